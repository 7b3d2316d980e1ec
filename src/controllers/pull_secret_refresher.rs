/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/pull_secret_refresher.rs
*
* C4, the Pull-Secret Refresher. For every managed pull secret, checks it
* for being orphaned, then for validity against the current registry-URL and
* signing-key-ID observations, and either leaves it alone, refreshes its
* embedded tokens, or deletes it, per spec §4.4.
*
* Built the same `kube::runtime::Controller` shape as
* `service_account_controller`, with one addition: a resync stream built
* from `RefresherContext`'s two `ObservationReceiver`s drives
* `Controller::reconcile_all_on` so that any change to the URL set or the
* key-ID set — even a value-equal republish — re-enqueues every managed
* secret, per spec §5/§9. This is the same `reconcile_all_on(reload_rx)`
* shape the broader ecosystem uses to fold an external reload signal into a
* controller's own queue; here the signal is our own observation hand-off
* rather than a filesystem watch.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{controller::Action, watcher, Controller};
use kube::ResourceExt;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::context::RefresherContext;
use crate::errors::RequeueClass;
use crate::jwt;
use crate::metrics::{
    NEXT_REFRESH_DEADLINE_UNIX, PULL_SECRETS_ORPHANED_TOTAL, PULL_SECRETS_REFRESHED_TOTAL,
    RECONCILE_ERRORS_TOTAL,
};
use crate::model::{
    decode_auth_entry, encode_auth_entry, AuthDocument, ANNOTATION_BINDING, ANNOTATION_PULL_SECRET_REF,
    ANNOTATION_SERVICE_ACCOUNT, BINDING_BOUND, DOCKERCFG_DATA_KEY, SECRET_TYPE_DOCKERCFG,
};
use crate::observation::ObservationReceiver;
use crate::token_issuer::BoundObjectRef;

const CONTROLLER_NAME: &str = "pull-secret-refresher";

/// Field-manager identity for this controller's own applies to the managed
/// secret: `type`, `data`, and the `auth-token.binding` annotation. Kept
/// distinct from `service_account_controller::FIELD_MANAGER`, which owns the
/// secret's `auth-token.service-account` annotation and owner reference —
/// two managers cooperating on disjoint fields of the same object, each
/// self-consistent across its own applies (spec §9).
const FIELD_MANAGER: &str = "pull-secret-refresher.ph.io";

/// Fraction of `(exp - now)` to wait before the *next* refresh after one has
/// just been issued (spec §4.4.3: "Requeue at now + 0.6*(exp_assumed - now)").
const POST_REFRESH_REQUEUE_FRACTION: f64 = 0.6;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("registry URL set has not been observed yet")]
    UrlsNotObserved,
    #[error("signing key ID set has not been observed yet")]
    KeyIdsNotObserved,
    #[error("secret {0} has no UID")]
    MissingUid(String),
    #[error("token issuer error: {0}")]
    TokenIssuer(#[from] crate::token_issuer::TokenIssuerError),
}

/// Starts the C4 reconcile loop. Runs until the underlying watch stream and
/// resync stream both end (only at process shutdown).
pub async fn run(ctx: Arc<RefresherContext>) {
    let secrets: Api<Secret> = Api::all(ctx.client.clone());
    let watch_config = watcher::Config::default().fields(&format!("type={SECRET_TYPE_DOCKERCFG}"));

    let resync = resync_stream(ctx.urls.clone(), ctx.key_ids.clone());

    Controller::new(secrets, watch_config)
        .reconcile_all_on(resync)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!(%err, "pull secret refresher loop surfaced an error");
            }
        })
        .await;
}

/// Yields a `()` every time either observation slot changes (spec §9:
/// "a value-equal update to an atomic pointer triggers a resync").
fn resync_stream(
    urls: ObservationReceiver<Vec<String>>,
    key_ids: ObservationReceiver<Vec<String>>,
) -> impl futures::Stream<Item = ()> {
    stream::unfold((urls, key_ids), |(mut urls, mut key_ids)| async move {
        tokio::select! {
            _ = urls.changed() => {},
            _ = key_ids.changed() => {},
        }
        Some(((), (urls, key_ids)))
    })
}

async fn reconcile(secret: Arc<Secret>, ctx: Arc<RefresherContext>) -> Result<Action, Error> {
    let Some(namespace) = secret.namespace() else {
        return Ok(Action::await_change());
    };
    let secret_name = secret.name_any();

    let Some(sa_name) = secret.annotations().get(ANNOTATION_SERVICE_ACCOUNT) else {
        // Not one of ours; the watch filter already narrows to `type=dockercfg`
        // but plenty of legacy/unrelated dockercfg secrets exist that this
        // subsystem never touches.
        return Ok(Action::await_change());
    };
    let sa_name = sa_name.clone();

    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let sa_api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &namespace);

    // Step 1: orphan check (spec §4.4.1).
    match sa_api.get_opt(&sa_name).await? {
        None => {
            return orphan_and_delete(&secret_api, &secret_name).await;
        }
        Some(sa) => {
            let Some(referenced_name) = sa.annotations().get(ANNOTATION_PULL_SECRET_REF) else {
                // C3 hasn't caught up yet; wait for it rather than error.
                return Ok(Action::await_change());
            };
            if referenced_name != &secret_name {
                strip_image_pull_secret_ref(&sa_api, &sa, &secret_name).await?;
                return orphan_and_delete(&secret_api, &secret_name).await;
            }
        }
    }

    // Step 0 (precondition gate, spec §4.4 "Preconditions"): both
    // observations must have fired at least once.
    let urls = ctx.urls.current().ok_or(Error::UrlsNotObserved)?;
    let key_ids = ctx.key_ids.current().ok_or(Error::KeyIdsNotObserved)?;
    let now = Utc::now();

    // Step 2: validity check (spec §4.4.2).
    match check_validity(&secret, &urls, &key_ids, now) {
        Validity::Valid { earliest_refresh } => {
            ensure_bound_annotation(&secret_api, &secret).await?;
            let delay = (earliest_refresh - now).to_std().unwrap_or(std::time::Duration::ZERO);
            NEXT_REFRESH_DEADLINE_UNIX.set(earliest_refresh.timestamp());
            Ok(Action::requeue(delay))
        }
        Validity::Stale => refresh(&secret_api, &secret, &sa_name, &urls, &ctx).await,
    }
}

async fn orphan_and_delete(secret_api: &Api<Secret>, secret_name: &str) -> Result<Action, Error> {
    match secret_api.delete(secret_name, &Default::default()).await {
        Ok(_) => {
            PULL_SECRETS_ORPHANED_TOTAL.inc();
            info!(secret = secret_name, "deleted orphaned managed pull secret");
        }
        Err(err) if crate::errors::is_not_found(&err) => {}
        Err(err) => return Err(err.into()),
    }
    Ok(Action::await_change())
}

/// Removes `secret_name` from the SA's `ImagePullSecrets` list when the SA's
/// annotation has moved on to a different managed secret (spec §4.4.1).
async fn strip_image_pull_secret_ref(
    sa_api: &Api<ServiceAccount>,
    sa: &ServiceAccount,
    secret_name: &str,
) -> Result<(), Error> {
    let Some(refs) = sa.image_pull_secrets.as_ref() else {
        return Ok(());
    };
    if !refs.iter().any(|r| r.name.as_deref() == Some(secret_name)) {
        return Ok(());
    }
    let remaining: Vec<LocalObjectReference> = refs
        .iter()
        .filter(|r| r.name.as_deref() != Some(secret_name))
        .cloned()
        .collect();

    let patch = json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {
            "name": sa.name_any(),
            "namespace": sa.namespace(),
            "uid": sa.uid(),
            "resourceVersion": sa.resource_version(),
        },
        "imagePullSecrets": remaining,
    });

    sa_api
        .patch(
            &sa.name_any(),
            // Same field manager as `service_account_controller`'s own
            // `ImagePullSecrets` writes: both cooperate on that one field,
            // so they must present as the same manager rather than fight
            // each other over which value is authoritative.
            &PatchParams::apply(crate::controllers::service_account_controller::FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
    Ok(())
}

enum Validity {
    Valid { earliest_refresh: DateTime<Utc> },
    Stale,
}

/// Implements spec §4.4.2's validity predicate over a secret's current
/// `.dockercfg` document against `(urls, kids, now)`.
fn check_validity(secret: &Secret, urls: &[String], key_ids: &[String], now: DateTime<Utc>) -> Validity {
    if secret.type_.as_deref() != Some(SECRET_TYPE_DOCKERCFG) {
        return Validity::Stale;
    }
    let Some(document) = parse_document(secret) else {
        return Validity::Stale;
    };

    let url_set: std::collections::HashSet<&str> = urls.iter().map(String::as_str).collect();
    let doc_keys: std::collections::HashSet<&str> = document.keys().map(String::as_str).collect();
    if url_set != doc_keys {
        return Validity::Stale;
    }
    if document.is_empty() {
        // An empty document can only be a skeleton; it never "passes" with
        // an empty `urls` set too, since an empty `urls` observation is
        // discarded upstream (spec §4.1) and C4 never sees `urls == []`
        // once the precondition gate has been satisfied.
        return Validity::Stale;
    }

    let mut earliest_refresh: Option<DateTime<Utc>> = None;
    for entry in document.values() {
        let Some((_, jwt_str)) = decode_auth_entry(entry) else {
            return Validity::Stale;
        };
        let Ok(decoded) = jwt::decode(&jwt_str) else {
            return Validity::Stale;
        };
        let Some(kid) = decoded.header.kid.as_deref() else {
            return Validity::Stale;
        };
        if !key_ids.iter().any(|k| k == kid) {
            return Validity::Stale;
        }
        let Some((nbf, exp)) = decoded.validity_window() else {
            return Validity::Stale;
        };
        let refresh_at = jwt::refresh_time(nbf, exp);
        if now >= refresh_at {
            return Validity::Stale;
        }
        earliest_refresh = Some(match earliest_refresh {
            Some(current) if current <= refresh_at => current,
            _ => refresh_at,
        });
    }

    match earliest_refresh {
        Some(earliest_refresh) => Validity::Valid { earliest_refresh },
        None => Validity::Stale,
    }
}

fn parse_document(secret: &Secret) -> Option<AuthDocument> {
    let data = secret.data.as_ref()?;
    let bytes = &data.get(DOCKERCFG_DATA_KEY)?.0;
    serde_json::from_slice(bytes).ok()
}

async fn ensure_bound_annotation(secret_api: &Api<Secret>, secret: &Secret) -> Result<(), Error> {
    if secret.annotations().get(ANNOTATION_BINDING).map(String::as_str) == Some(BINDING_BOUND) {
        return Ok(());
    }
    let Some(uid) = secret.uid() else {
        return Err(Error::MissingUid(secret.name_any()));
    };
    // Must stay self-consistent with `refresh`'s apply under the same field
    // manager: that apply's complete intent is `{type, data, binding
    // annotation}`, so this one restates the still-current `type`/`data`
    // rather than omitting them, which would otherwise delete the dockercfg
    // document this manager itself just wrote.
    let patch = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": SECRET_TYPE_DOCKERCFG,
        "metadata": {
            "name": secret.name_any(),
            "uid": uid,
            "annotations": { ANNOTATION_BINDING: BINDING_BOUND },
        },
        "data": secret.data.clone().unwrap_or_default(),
    });
    secret_api
        .patch(
            &secret.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
    Ok(())
}

/// Requests a fresh bound token and rewrites the `.dockercfg` document (spec
/// §4.4.3).
async fn refresh(
    secret_api: &Api<Secret>,
    secret: &Secret,
    sa_name: &str,
    urls: &[String],
    ctx: &RefresherContext,
) -> Result<Action, Error> {
    let namespace = secret.namespace().unwrap_or_default();
    let Some(uid) = secret.uid() else {
        return Err(Error::MissingUid(secret.name_any()));
    };

    let issued = ctx
        .token_issuer
        .create_token(
            &namespace,
            sa_name,
            Some(BoundObjectRef {
                kind: "Secret".to_string(),
                name: secret.name_any(),
                uid: uid.clone(),
            }),
            None,
        )
        .await?;

    let document: AuthDocument = urls
        .iter()
        .map(|url| (url.clone(), encode_auth_entry(&issued.jwt)))
        .collect();
    let document_bytes = serde_json::to_vec(&document).expect("auth document always serializes");

    let patch = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": SECRET_TYPE_DOCKERCFG,
        "metadata": {
            "name": secret.name_any(),
            "uid": uid,
            "annotations": { ANNOTATION_BINDING: BINDING_BOUND },
        },
        "data": {
            DOCKERCFG_DATA_KEY: base64_std(&document_bytes),
        },
    });

    secret_api
        .patch(
            &secret.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;

    PULL_SECRETS_REFRESHED_TOTAL.inc();
    info!(secret = %secret.name_any(), urls = urls.len(), "refreshed pull secret with a new token");

    let now = Utc::now();
    let remaining = (issued.expiry - now).num_milliseconds().max(0) as f64;
    let requeue_ms = (remaining * POST_REFRESH_REQUEUE_FRACTION) as u64;
    NEXT_REFRESH_DEADLINE_UNIX.set(now.timestamp() + (requeue_ms / 1000) as i64);
    Ok(Action::requeue(std::time::Duration::from_millis(requeue_ms)))
}

fn base64_std(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn error_policy(secret: Arc<Secret>, error: &Error, _ctx: Arc<RefresherContext>) -> Action {
    warn!(secret = %secret.name_any(), %error, "pull secret reconcile failed");
    let class = match error {
        Error::Kube(err) => RequeueClass::of(err),
        Error::UrlsNotObserved | Error::KeyIdsNotObserved => RequeueClass::PreconditionNotMet,
        Error::MissingUid(_) => RequeueClass::Transient,
        Error::TokenIssuer(_) => RequeueClass::Transient,
    };
    RECONCILE_ERRORS_TOTAL
        .with_label_values(&[CONTROLLER_NAME, &format!("{class:?}")])
        .inc();
    class.action(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn fake_jwt(kid: &str, nbf: i64, exp: i64) -> String {
        use base64::Engine;
        let e = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = format!(r#"{{"alg":"RS256","kid":"{kid}"}}"#);
        let claims = format!(r#"{{"nbf":{nbf},"exp":{exp}}}"#);
        format!("{}.{}.{}", e.encode(header), e.encode(claims), e.encode("sig"))
    }

    fn secret_with_document(document: &AuthDocument) -> Secret {
        let bytes = serde_json::to_vec(document).unwrap();
        let mut data = BTreeMap::new();
        data.insert(DOCKERCFG_DATA_KEY.to_string(), ByteString(bytes));
        Secret {
            metadata: ObjectMeta {
                name: Some("sa1-dockercfg-abcde".to_string()),
                namespace: Some("ns1".to_string()),
                uid: Some("secret-uid".to_string()),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE_DOCKERCFG.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn valid_document_with_fresh_token_is_valid() {
        let now = Utc::now();
        let jwt = fake_jwt("K", now.timestamp(), (now + chrono::Duration::hours(1)).timestamp());
        let mut document = AuthDocument::new();
        document.insert("r.svc:5000".to_string(), encode_auth_entry(&jwt));
        let secret = secret_with_document(&document);

        match check_validity(&secret, &["r.svc:5000".to_string()], &["K".to_string()], now) {
            Validity::Valid { .. } => {}
            Validity::Stale => panic!("expected Valid"),
        }
    }

    #[test]
    fn mismatched_url_set_is_stale() {
        let now = Utc::now();
        let jwt = fake_jwt("K", now.timestamp(), (now + chrono::Duration::hours(1)).timestamp());
        let mut document = AuthDocument::new();
        document.insert("old.svc:5000".to_string(), encode_auth_entry(&jwt));
        let secret = secret_with_document(&document);

        match check_validity(&secret, &["new.svc:5000".to_string()], &["K".to_string()], now) {
            Validity::Stale => {}
            Validity::Valid { .. } => panic!("expected Stale"),
        }
    }

    #[test]
    fn unknown_kid_is_stale() {
        let now = Utc::now();
        let jwt = fake_jwt("retired", now.timestamp(), (now + chrono::Duration::hours(1)).timestamp());
        let mut document = AuthDocument::new();
        document.insert("r.svc:5000".to_string(), encode_auth_entry(&jwt));
        let secret = secret_with_document(&document);

        match check_validity(&secret, &["r.svc:5000".to_string()], &["current".to_string()], now) {
            Validity::Stale => {}
            Validity::Valid { .. } => panic!("expected Stale after key rotation"),
        }
    }

    #[test]
    fn past_refresh_threshold_is_stale() {
        let now = Utc::now();
        let nbf = now - chrono::Duration::minutes(40);
        let exp = now + chrono::Duration::minutes(20);
        let jwt = fake_jwt("K", nbf.timestamp(), exp.timestamp());
        let mut document = AuthDocument::new();
        document.insert("r.svc:5000".to_string(), encode_auth_entry(&jwt));
        let secret = secret_with_document(&document);

        match check_validity(&secret, &["r.svc:5000".to_string()], &["K".to_string()], now) {
            Validity::Stale => {}
            Validity::Valid { .. } => panic!("expected Stale past the refresh threshold"),
        }
    }

    #[test]
    fn empty_document_is_stale_skeleton() {
        let document = AuthDocument::new();
        let secret = secret_with_document(&document);
        match check_validity(&secret, &["r.svc:5000".to_string()], &["K".to_string()], Utc::now()) {
            Validity::Stale => {}
            Validity::Valid { .. } => panic!("a skeleton must never be Valid"),
        }
    }

    #[test]
    fn wrong_type_is_stale() {
        let mut secret = secret_with_document(&AuthDocument::new());
        secret.type_ = Some("Opaque".to_string());
        match check_validity(&secret, &[], &[], Utc::now()) {
            Validity::Stale => {}
            Validity::Valid { .. } => panic!("non-dockercfg secrets are never valid"),
        }
    }
}
