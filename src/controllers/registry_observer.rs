/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/registry_observer.rs
*
* C1, the Registry URL Observer. Watches the two well-known internal
* registry `Service` locations and republishes the full canonical URL set
* (`registry_urls::compute_urls`) into an `ObservationSender` every time
* either Service's relevant fields change, per spec §4.1.
*
* Grounded in the teacher's `Controller`+`watcher` usage (see
* `rbac_policy_controller::run`), generalized from a CRD watch to a plain
* `Service` watch since there is no custom resource here.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::observation::ObservationSender;
use crate::registry_urls::{compute_urls, ServiceEndpoint};

/// The two well-known Service locations this subsystem treats as "the
/// internal registry" (spec §4.1: "the two well-known Service locations").
pub const WATCHED_SERVICES: [(&str, &str); 2] = [
    ("openshift-image-registry", "image-registry"),
    ("default", "docker-registry"),
];

fn to_endpoint(svc: &Service) -> Option<ServiceEndpoint> {
    let name = svc.name_any();
    let namespace = svc.namespace()?;
    let spec = svc.spec.as_ref()?;
    let ports = spec
        .ports
        .as_ref()
        .map(|ps| ps.iter().map(|p| p.port).collect())
        .unwrap_or_default();
    Some(ServiceEndpoint {
        name,
        namespace,
        cluster_ip: spec.cluster_ip.clone(),
        ports,
    })
}

/// Runs the registry URL observer loop until the watch stream ends (only at
/// process shutdown). Recomputes and republishes the URL set on every
/// watch event, folding in `additional_urls` from configuration.
pub async fn run(client: Client, additional_urls: Vec<String>, sender: ObservationSender<Vec<String>>) {
    let mut known: std::collections::HashMap<(String, String), ServiceEndpoint> =
        std::collections::HashMap::new();

    for (namespace, name) in WATCHED_SERVICES {
        let api: Api<Service> = Api::namespaced(client.clone(), namespace);
        match api.get_opt(name).await {
            Ok(Some(svc)) => {
                if let Some(ep) = to_endpoint(&svc) {
                    known.insert((namespace.to_string(), name.to_string()), ep);
                }
            }
            Ok(None) => {}
            Err(err) => warn!(%err, namespace, name, "initial registry service lookup failed"),
        }
    }

    publish(&known, &additional_urls, &sender);

    let api: Api<Service> = Api::all(client);
    let watch_config = watcher::Config::default();
    let mut stream = watcher(api, watch_config).default_backoff().boxed();

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "registry service watch stream error");
                continue;
            }
        };

        match event {
            watcher::Event::Apply(svc) => apply_event(&mut known, &svc),
            watcher::Event::Delete(svc) => delete_event(&mut known, &svc),
            watcher::Event::Init => {}
            watcher::Event::InitApply(svc) => apply_event(&mut known, &svc),
            watcher::Event::InitDone => {
                publish(&known, &additional_urls, &sender);
                continue;
            }
        }

        publish(&known, &additional_urls, &sender);
    }
}

fn key_for(svc: &Service) -> Option<(String, String)> {
    let name = svc.name_any();
    let namespace = svc.namespace()?;
    WATCHED_SERVICES
        .iter()
        .any(|(ns, n)| *ns == namespace && *n == name)
        .then_some((namespace, name))
}

fn apply_event(
    known: &mut std::collections::HashMap<(String, String), ServiceEndpoint>,
    svc: &Service,
) {
    let Some(key) = key_for(svc) else { return };
    match to_endpoint(svc) {
        Some(ep) => {
            known.insert(key, ep);
        }
        None => {
            known.remove(&key);
        }
    }
}

fn delete_event(
    known: &mut std::collections::HashMap<(String, String), ServiceEndpoint>,
    svc: &Service,
) {
    if let Some(key) = key_for(svc) {
        known.remove(&key);
    }
}

fn publish(
    known: &std::collections::HashMap<(String, String), ServiceEndpoint>,
    additional_urls: &[String],
    sender: &ObservationSender<Vec<String>>,
) {
    let services: Vec<ServiceEndpoint> = known.values().cloned().collect();
    let urls = compute_urls(&services, additional_urls);
    if urls.is_empty() {
        // Spec §4.1/§8: an empty result is discarded so C4 keeps using
        // whatever URL set it last observed rather than going precondition-
        // unmet or wiping every managed secret's document.
        warn!("computed registry url set is empty, not publishing");
        return;
    }
    info!(count = urls.len(), "republished registry url set");
    sender.publish(urls);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_folds_additional_urls_in_front() {
        let (tx, rx) = crate::observation::channel::<Vec<String>>();
        let mut known = std::collections::HashMap::new();
        known.insert(
            ("default".to_string(), "docker-registry".to_string()),
            ServiceEndpoint {
                name: "docker-registry".to_string(),
                namespace: "default".to_string(),
                cluster_ip: Some("10.0.0.5".to_string()),
                ports: vec![5000],
            },
        );
        publish(&known, &["extra.example.com".to_string()], &tx);
        let urls = rx.current().unwrap();
        assert_eq!(urls[0], "extra.example.com");
    }

    #[test]
    fn empty_result_is_discarded_not_published() {
        let (tx, rx) = crate::observation::channel::<Vec<String>>();
        publish(&std::collections::HashMap::new(), &[], &tx);
        assert!(rx.current().is_none());
    }

    #[test]
    fn a_prior_publish_survives_a_subsequent_empty_computation() {
        let (tx, rx) = crate::observation::channel::<Vec<String>>();
        let mut known = std::collections::HashMap::new();
        known.insert(
            ("default".to_string(), "docker-registry".to_string()),
            ServiceEndpoint {
                name: "docker-registry".to_string(),
                namespace: "default".to_string(),
                cluster_ip: Some("10.0.0.5".to_string()),
                ports: vec![5000],
            },
        );
        publish(&known, &[], &tx);
        assert!(rx.current().is_some());

        publish(&std::collections::HashMap::new(), &[], &tx);
        assert!(rx.current().is_some(), "empty recomputation must not clear the prior observation");
    }
}
