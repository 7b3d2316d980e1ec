/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/service_account_controller.rs
*
* C3, the Service-Account Reconciler. For every service account, ensures an
* annotation records its one managed pull secret's name, ensures that secret
* is listed in `ImagePullSecrets`, and ensures the secret itself exists
* (as an owned skeleton if nothing else created it yet).
*
* Built the way the teacher's `rbac_policy_controller` wires a
* `kube::runtime::Controller`, generalized with a secondary `.watches` over
* `Secret` whose mapper derives the owning SA's key from the
* `auth-token.service-account` annotation — the same "fold a secondary watch
* into the primary queue" shape the teacher's `dr_controller` uses for its
* owned resources, applied here via an explicit annotation-based mapper
* instead of owner-reference folding, since a skeleton secret's annotation
* is authoritative even before an owner reference exists.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{Resource, ResourceExt};
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::context::Context;
use crate::errors::RequeueClass;
use crate::metrics::{RECONCILE_ERRORS_TOTAL, SKELETON_SECRETS_CREATED_TOTAL};
use crate::model::{
    ANNOTATION_BINDING, ANNOTATION_PULL_SECRET_REF, ANNOTATION_SERVICE_ACCOUNT, BINDING_LEGACY,
    SECRET_TYPE_DOCKERCFG,
};

const CONTROLLER_NAME: &str = "service-account-reconciler";

/// Field-manager identity for every apply this controller makes: the
/// `ServiceAccount`'s pull-secret annotation and `ImagePullSecrets` entry,
/// and the managed secret's annotation/owner-reference/skeleton `data`.
/// Shared with `pull_secret_refresher`'s orphan-cleanup path, which also
/// edits `ImagePullSecrets` and must cooperate under the same identity
/// rather than fight this controller over that field (spec §9).
pub(crate) const FIELD_MANAGER: &str = "pull-secret-sa-controller.ph.io";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("service account {0} has no UID")]
    MissingUid(String),
}

/// Starts the C3 reconcile loop. Runs until the underlying watch streams end
/// (only at process shutdown).
pub async fn run(ctx: Arc<Context>) {
    let service_accounts: Api<ServiceAccount> = Api::all(ctx.client.clone());
    let secrets: Api<Secret> = Api::all(ctx.client.clone());

    Controller::new(service_accounts, watcher::Config::default())
        .watches(secrets, watcher::Config::default(), secret_to_sa_key)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!(%err, "service account reconcile loop surfaced an error");
            }
        })
        .await;
}

/// Maps a `Secret` event back to the `ServiceAccount` it's annotated as
/// belonging to, per spec §4.3's event-source description.
fn secret_to_sa_key(secret: Secret) -> Option<ObjectRef<ServiceAccount>> {
    let namespace = secret.namespace()?;
    let sa_name = secret
        .annotations()
        .get(ANNOTATION_SERVICE_ACCOUNT)?
        .clone();
    Some(ObjectRef::new(&sa_name).within(&namespace))
}

async fn reconcile(sa: Arc<ServiceAccount>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(namespace) = sa.namespace() else {
        return Ok(Action::await_change());
    };
    let sa_name = sa.name_any();
    let sa_api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &namespace);
    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

    // Step 1: SA not found -> return (nothing to reconcile).
    let Some(current_sa) = sa_api.get_opt(&sa_name).await? else {
        return Ok(Action::await_change());
    };

    let uid = current_sa
        .uid()
        .ok_or_else(|| Error::MissingUid(sa_name.clone()))?;

    // Step 2: compute the managed secret name.
    let secret_name = resolve_managed_secret_name(&current_sa, &secret_api, &sa_name).await?;

    // Step 3: apply-patch the annotation and ImagePullSecrets entry.
    ensure_annotation_and_image_pull_secret(&sa_api, &current_sa, &secret_name, &uid).await?;

    // Step 4: ensure the managed secret itself exists with correct shape.
    ensure_managed_secret(&secret_api, &secret_name, &sa_name, &uid).await?;

    Ok(Action::await_change())
}

/// Implements spec §4.3 step 2's four-way fallback in order.
async fn resolve_managed_secret_name(
    sa: &ServiceAccount,
    secret_api: &Api<Secret>,
    sa_name: &str,
) -> Result<String, Error> {
    if let Some(name) = sa.annotations().get(ANNOTATION_PULL_SECRET_REF) {
        return Ok(name.clone());
    }

    let candidates = secret_api.list(&Default::default()).await?;
    for secret in &candidates.items {
        let Some(secret_type) = secret.type_.as_deref() else {
            continue;
        };
        if secret_type != SECRET_TYPE_DOCKERCFG {
            continue;
        }
        let references_sa = secret
            .annotations()
            .get(ANNOTATION_SERVICE_ACCOUNT)
            .map(|v| v == sa_name)
            .unwrap_or(false)
            || secret
                .owner_references()
                .iter()
                .any(|owner| owner.kind == "ServiceAccount" && owner.name == sa_name);
        if references_sa {
            return Ok(secret.name_any());
        }
    }

    for secret in &candidates.items {
        if secret.annotations().get(ANNOTATION_BINDING).map(String::as_str) == Some(BINDING_LEGACY) {
            let referenced = sa
                .image_pull_secrets
                .iter()
                .flatten()
                .any(|r| r.name.as_deref() == Some(&secret.name_any()));
            if referenced {
                return Ok(secret.name_any());
            }
        }
    }

    Ok(generate_secret_name(sa_name))
}

fn generate_secret_name(sa_name: &str) -> String {
    const SUFFIX_LEN: usize = 5;
    let truncated: String = sa_name.chars().take(58).collect();
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..SUFFIX_LEN)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .map(|c| c.to_ascii_lowercase())
            .collect()
    };
    format!("{truncated}dockercfg-{suffix}")
}

async fn ensure_annotation_and_image_pull_secret(
    sa_api: &Api<ServiceAccount>,
    sa: &ServiceAccount,
    secret_name: &str,
    uid: &str,
) -> Result<(), Error> {
    let already_present = sa
        .image_pull_secrets
        .iter()
        .flatten()
        .any(|r| r.name.as_deref() == Some(secret_name));

    let mut image_pull_secrets: Vec<LocalObjectReference> = sa
        .image_pull_secrets
        .clone()
        .unwrap_or_default();
    if !already_present {
        image_pull_secrets.push(LocalObjectReference {
            name: Some(secret_name.to_string()),
        });
    }

    let mut patch = json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {
            "name": sa.name_any(),
            "namespace": sa.namespace(),
            "uid": uid,
            "annotations": {
                ANNOTATION_PULL_SECRET_REF: secret_name,
            },
        },
    });

    if !already_present {
        patch["imagePullSecrets"] = json!(image_pull_secrets);
        patch["metadata"]["resourceVersion"] = json!(sa.resource_version());
    }

    sa_api
        .patch(
            &sa.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
    Ok(())
}

async fn ensure_managed_secret(
    secret_api: &Api<Secret>,
    secret_name: &str,
    sa_name: &str,
    sa_uid: &str,
) -> Result<(), Error> {
    let existing = secret_api.get_opt(secret_name).await?;

    let needs_rewrite = match &existing {
        None => true,
        Some(secret) => {
            let annotation_matches = secret
                .annotations()
                .get(ANNOTATION_SERVICE_ACCOUNT)
                .map(|v| v == sa_name)
                .unwrap_or(false);
            let has_owner = secret
                .owner_references()
                .iter()
                .any(|owner| owner.kind == "ServiceAccount" && owner.name == sa_name);
            !annotation_matches || !has_owner
        }
    };

    if !needs_rewrite {
        return Ok(());
    }

    let existing_data = existing.as_ref().and_then(|s| s.data.clone());

    let mut patch = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": SECRET_TYPE_DOCKERCFG,
        "metadata": {
            "name": secret_name,
            "annotations": {
                ANNOTATION_SERVICE_ACCOUNT: sa_name,
            },
            "ownerReferences": [{
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "name": sa_name,
                "uid": sa_uid,
            }],
        },
    });

    match existing_data {
        Some(data) => patch["data"] = json!(data),
        None => {
            patch["stringData"] = json!({ crate::model::DOCKERCFG_DATA_KEY: "{}" });
            SKELETON_SECRETS_CREATED_TOTAL.inc();
        }
    }

    secret_api
        .patch(
            secret_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
    Ok(())
}

fn error_policy(sa: Arc<ServiceAccount>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(sa = %sa.name_any(), %error, "service account reconcile failed");
    let class = match error {
        Error::Kube(err) => RequeueClass::of(err),
        Error::MissingUid(_) => RequeueClass::Transient,
    };
    RECONCILE_ERRORS_TOTAL
        .with_label_values(&[CONTROLLER_NAME, &format!("{class:?}")])
        .inc();
    class.action(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_name_truncates_and_adds_suffix() {
        let long_name = "a".repeat(100);
        let generated = generate_secret_name(&long_name);
        assert!(generated.starts_with(&"a".repeat(58)));
        assert!(generated.contains("dockercfg-"));
        let suffix = generated.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn secret_to_sa_key_reads_the_annotation() {
        use std::collections::BTreeMap;
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_SERVICE_ACCOUNT.to_string(), "builder".to_string());
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                namespace: Some("team-a".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = secret_to_sa_key(secret).unwrap();
        assert_eq!(key.name, "builder");
        assert_eq!(key.namespace.as_deref(), Some("team-a"));
    }
}
