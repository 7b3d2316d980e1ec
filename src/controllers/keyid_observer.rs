/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/keyid_observer.rs
*
* C2, the Signing-Key ID Observer. Watches one well-known `Secret` holding
* the cluster's public signing-key material and republishes its key-ID set
* (`keyid::compute_key_ids`) on every change, per spec §4.2.
*
* When the signing-key secret is absent or unparsable, falls back to
* requesting a short-lived throwaway token and reading its header `kid`
* instead — the same fallback path spec §4.2 describes, since the header
* still names the key that signed it even when we can't see the public key
* material directly.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::jwt;
use crate::keyid::compute_key_ids;
use crate::observation::ObservationSender;
use crate::token_issuer::TokenIssuer;

/// How often the fallback throwaway-token path polls when the signing-key
/// secret itself can't be read directly (spec §4.2: "periodically").
const FALLBACK_POLL_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Fallback service account used to request a throwaway token when the
/// signing-key secret's data can't be read directly. Any service account in
/// any namespace works, since only the issued token's header is inspected.
const FALLBACK_NAMESPACE: &str = "kube-system";
const FALLBACK_SERVICE_ACCOUNT: &str = "default";

fn key_ids_from_secret(secret: &Secret) -> Option<Vec<String>> {
    let data = secret.data.as_ref()?;
    let mut pem = Vec::new();
    for value in data.values() {
        pem.extend_from_slice(&value.0);
        pem.push(b'\n');
    }
    compute_key_ids(&pem).ok()
}

/// Runs the key-ID observer loop until its watch stream ends. Spawns the
/// fallback poller as a concurrent task; whichever path last successfully
/// computed a key-ID set wins, since both publish through the same sender.
pub async fn run(
    client: Client,
    namespace: String,
    name: String,
    token_issuer: Arc<dyn TokenIssuer>,
    sender: ObservationSender<Vec<String>>,
) {
    let direct_seen = Arc::new(AtomicBool::new(false));

    let fallback_sender = sender.clone();
    let fallback_issuer = token_issuer.clone();
    let fallback_direct_seen = direct_seen.clone();
    tokio::spawn(run_fallback_poller(fallback_issuer, fallback_sender, fallback_direct_seen));

    let api: Api<Secret> = Api::namespaced(client, &namespace);

    match api.get_opt(&name).await {
        Ok(Some(secret)) => publish_from_secret(&secret, &sender, &direct_seen),
        Ok(None) => warn!(namespace, name, "signing key secret not found at startup"),
        Err(err) => warn!(%err, namespace, name, "initial signing key secret lookup failed"),
    }

    let watch_config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api, watch_config).default_backoff().boxed();

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "signing key secret watch stream error");
                continue;
            }
        };

        match event {
            watcher::Event::Apply(secret) | watcher::Event::InitApply(secret) => {
                publish_from_secret(&secret, &sender, &direct_seen);
            }
            watcher::Event::Delete(secret) => {
                direct_seen.store(false, Ordering::Relaxed);
                warn!(name = %secret.name_any(), "signing key secret deleted, relying on fallback path");
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}

fn publish_from_secret(secret: &Secret, sender: &ObservationSender<Vec<String>>, direct_seen: &AtomicBool) {
    match key_ids_from_secret(secret) {
        Some(ids) => {
            info!(count = ids.len(), "republished signing key id set from secret");
            direct_seen.store(true, Ordering::Relaxed);
            sender.publish(ids);
        }
        None => warn!("signing key secret contained no parsable public keys"),
    }
}

async fn run_fallback_poller(
    token_issuer: Arc<dyn TokenIssuer>,
    sender: ObservationSender<Vec<String>>,
    direct_seen: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(FALLBACK_POLL_INTERVAL);
    loop {
        interval.tick().await;
        if direct_seen.load(Ordering::Relaxed) {
            continue;
        }
        match token_issuer
            .create_token(FALLBACK_NAMESPACE, FALLBACK_SERVICE_ACCOUNT, None, Some(300))
            .await
        {
            Ok(issued) => match jwt::decode_header(&issued.jwt) {
                Ok(header) => match header.kid {
                    Some(kid) => {
                        info!(kid, "republished signing key id from fallback token");
                        sender.publish(vec![kid]);
                    }
                    None => warn!("fallback token had no kid in its header"),
                },
                Err(err) => warn!(%err, "fallback token header could not be decoded"),
            },
            Err(err) => warn!(%err, "fallback token request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn key_ids_from_secret_concatenates_all_data_entries() {
        let pem: &str = "-----BEGIN PUBLIC KEY-----\n\
AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8gISIjJCUmJygpKissLS4v\n\
MDEyMzQ1Njc4OTo7\n\
-----END PUBLIC KEY-----\n";
        let mut data = std::collections::BTreeMap::new();
        data.insert(
            "signing-key.pub".to_string(),
            k8s_openapi::ByteString(pem.as_bytes().to_vec()),
        );
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        let ids = key_ids_from_secret(&secret).unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn fallback_poller_publishes_a_kid_from_a_fake_issuer() {
        use crate::token_issuer::FakeTokenIssuer;

        let now = Utc::now();
        let issuer: Arc<dyn TokenIssuer> = Arc::new(FakeTokenIssuer {
            kid: "fallback-kid".to_string(),
            nbf: now,
            exp: now + chrono::Duration::seconds(300),
        });
        let (tx, rx) = crate::observation::channel::<Vec<String>>();
        let issued = issuer
            .create_token(FALLBACK_NAMESPACE, FALLBACK_SERVICE_ACCOUNT, None, Some(300))
            .await
            .unwrap();
        let header = jwt::decode_header(&issued.jwt).unwrap();
        tx.publish(vec![header.kid.unwrap()]);
        assert_eq!(rx.current().as_deref(), Some(&vec!["fallback-kid".to_string()]));
    }
}
