/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/legacy_migration.rs
*
* C5, the three independent legacy-migration/rollback loops (spec §4.5):
* the legacy token labeler, the legacy pull-secret finalizer remover, and
* the optional service-account rollback. Each watches a different object
* kind/filter and shares no state with the others, so each gets its own
* `kube::runtime::Controller` instance — the same "one controller per
* concern" shape the teacher uses for its CRD-specific controllers, applied
* here to three narrow maintenance sweeps instead of one resource's full
* lifecycle.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{controller::Action, watcher, Controller};
use kube::ResourceExt;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::context::Context;
use crate::errors::RequeueClass;
use crate::legacy;
use crate::metrics::RECONCILE_ERRORS_TOTAL;
use crate::model::{
    ANNOTATION_CREATED_BY, ANNOTATION_PULL_SECRET_REF, ANNOTATION_SERVICE_ACCOUNT,
    FINALIZER_LEGACY_TOKEN, LABEL_LEGACY_TOKEN, SECRET_TYPE_DOCKERCFG,
    SECRET_TYPE_SERVICE_ACCOUNT_TOKEN,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

// --- Legacy token labeler ---

const TOKEN_LABELER_CONTROLLER_NAME: &str = "legacy-token-labeler";

/// Field-manager identity for this loop's one apply (the `legacy-token`
/// label) — distinct from every C3/C4 manager, since it never touches a
/// field either of those controllers own.
const TOKEN_LABELER_FIELD_MANAGER: &str = "pull-secret-legacy-labeler.ph.io";

/// Labels pre-existing long-lived service-account token secrets created by
/// this subsystem with `legacy-token: "true"` (spec §4.5).
pub async fn run_token_labeler(ctx: Arc<Context>) {
    let secrets: Api<Secret> = Api::all(ctx.client.clone());
    let watch_config =
        watcher::Config::default().fields(&format!("type={SECRET_TYPE_SERVICE_ACCOUNT_TOKEN}"));

    Controller::new(secrets, watch_config)
        .shutdown_on_signal()
        .run(reconcile_token_labeler, error_policy_token_labeler, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!(%err, "legacy token labeler loop surfaced an error");
            }
        })
        .await;
}

async fn reconcile_token_labeler(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action, Error> {
    if !secret.annotations().contains_key(ANNOTATION_CREATED_BY) {
        return Ok(Action::await_change());
    }
    if secret.labels().get(LABEL_LEGACY_TOKEN).map(String::as_str) == Some("true") {
        return Ok(Action::await_change());
    }
    let Some(namespace) = secret.namespace() else {
        return Ok(Action::await_change());
    };

    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": secret.name_any(),
            "uid": secret.uid(),
            "labels": { LABEL_LEGACY_TOKEN: "true" },
        },
    });
    secret_api
        .patch(
            &secret.name_any(),
            &PatchParams::apply(TOKEN_LABELER_FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
    info!(secret = %secret.name_any(), "labeled legacy long-lived service account token");
    Ok(Action::await_change())
}

fn error_policy_token_labeler(secret: Arc<Secret>, error: &Error, _ctx: Arc<Context>) -> Action {
    classify(TOKEN_LABELER_CONTROLLER_NAME, &secret.name_any(), error)
}

// --- Legacy pull-secret finalizer remover ---

const FINALIZER_REMOVER_CONTROLLER_NAME: &str = "legacy-finalizer-remover";

/// Removes the [`FINALIZER_LEGACY_TOKEN`] finalizer from older pull secrets
/// (spec §4.5), via a position-indexed JSON-patch `test`+`remove` pair.
pub async fn run_finalizer_remover(ctx: Arc<Context>) {
    let secrets: Api<Secret> = Api::all(ctx.client.clone());
    let watch_config = watcher::Config::default().fields(&format!("type={SECRET_TYPE_DOCKERCFG}"));

    Controller::new(secrets, watch_config)
        .shutdown_on_signal()
        .run(reconcile_finalizer_remover, error_policy_finalizer_remover, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!(%err, "legacy finalizer remover loop surfaced an error");
            }
        })
        .await;
}

async fn reconcile_finalizer_remover(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(index) = secret.finalizers().iter().position(|f| f == FINALIZER_LEGACY_TOKEN) else {
        return Ok(Action::await_change());
    };
    let Some(namespace) = secret.namespace() else {
        return Ok(Action::await_change());
    };

    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = legacy::remove_finalizer_patch(index, FINALIZER_LEGACY_TOKEN);
    secret_api
        .patch(&secret.name_any(), &PatchParams::default(), &Patch::Json::<()>(patch))
        .await?;
    info!(secret = %secret.name_any(), index, "removed legacy finalizer from pull secret");
    Ok(Action::await_change())
}

fn error_policy_finalizer_remover(secret: Arc<Secret>, error: &Error, _ctx: Arc<Context>) -> Action {
    classify(FINALIZER_REMOVER_CONTROLLER_NAME, &secret.name_any(), error)
}

// --- Service-account rollback (optional, spec §4.5 "optional") ---

const ROLLBACK_CONTROLLER_NAME: &str = "service-account-rollback";

/// Reverts the new annotation/reference scheme on service accounts, when
/// enabled via [`crate::config::Config::enable_rollback`].
pub async fn run_rollback(ctx: Arc<Context>) {
    if !ctx.config.enable_rollback {
        info!("service-account rollback loop disabled (set ENABLE_PULL_SECRET_ROLLBACK=true to enable)");
        return;
    }

    let service_accounts: Api<ServiceAccount> = Api::all(ctx.client.clone());
    Controller::new(service_accounts, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_rollback, error_policy_rollback, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!(%err, "service account rollback loop surfaced an error");
            }
        })
        .await;
}

async fn reconcile_rollback(sa: Arc<ServiceAccount>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(secret_name) = sa.annotations().get(ANNOTATION_PULL_SECRET_REF).cloned() else {
        return Ok(Action::await_change());
    };
    let Some(namespace) = sa.namespace() else {
        return Ok(Action::await_change());
    };

    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let should_rollback = match secret_api.get_opt(&secret_name).await? {
        None => true,
        Some(secret) => secret.annotations().contains_key(ANNOTATION_SERVICE_ACCOUNT),
    };
    if !should_rollback {
        return Ok(Action::await_change());
    }

    let secrets_index = sa
        .secrets
        .iter()
        .flatten()
        .position(|r| r.name.as_deref() == Some(secret_name.as_str()));
    let image_pull_secrets_index = sa
        .image_pull_secrets
        .iter()
        .flatten()
        .position(|r| r.name.as_deref() == Some(secret_name.as_str()));

    let patch = legacy::rollback_service_account_patch(
        ANNOTATION_PULL_SECRET_REF,
        &secret_name,
        secrets_index,
        image_pull_secrets_index,
    );

    let sa_api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &namespace);
    sa_api
        .patch(&sa.name_any(), &PatchParams::default(), &Patch::Json::<()>(patch))
        .await?;
    info!(sa = %sa.name_any(), "rolled back service account pull-secret annotation");
    Ok(Action::await_change())
}

fn error_policy_rollback(sa: Arc<ServiceAccount>, error: &Error, _ctx: Arc<Context>) -> Action {
    classify(ROLLBACK_CONTROLLER_NAME, &sa.name_any(), error)
}

fn classify(controller: &str, object: &str, error: &Error) -> Action {
    warn!(object, controller, %error, "legacy migration reconcile failed");
    let Error::Kube(err) = error;
    let class = RequeueClass::of(err);
    RECONCILE_ERRORS_TOTAL
        .with_label_values(&[controller, &format!("{class:?}")])
        .inc();
    class.action(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn token_needing_label_is_detected() {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_CREATED_BY.to_string(), "true".to_string());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("builder-token-abcde".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(secret.annotations().contains_key(ANNOTATION_CREATED_BY));
        assert!(secret.labels().get(LABEL_LEGACY_TOKEN).is_none());
    }

    #[test]
    fn finalizer_index_is_found_by_value() {
        let secret = Secret {
            metadata: ObjectMeta {
                finalizers: Some(vec!["other/finalizer".to_string(), FINALIZER_LEGACY_TOKEN.to_string()]),
                ..Default::default()
            },
            ..Default::default()
        };
        let index = secret.finalizers().iter().position(|f| f == FINALIZER_LEGACY_TOKEN);
        assert_eq!(index, Some(1));
    }
}
