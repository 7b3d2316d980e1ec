/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/registry_urls.rs
*
* Pure computation of the canonical registry URL set (spec §3 "Registry URL
* set", §4.1 "Registry URL Observer"). Kept free of any `kube` types so it
* can be exercised directly in unit tests; `controllers::registry_observer`
* adapts real `Service` objects into `ServiceEndpoint` and calls in here.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::net::IpAddr;

/// The minimal shape of a watched `Service` this subsystem cares about.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub name: String,
    pub namespace: String,
    pub cluster_ip: Option<String>,
    pub ports: Vec<i32>,
}

/// Recomputes the full registry URL set from the two watched service
/// locations' last-known state plus the caller-supplied additional URLs.
///
/// Per spec §4.1: for each existing service, emit `<name>.<ns>.svc:<port>`,
/// `<ipv4>:<port>` (omitted when the cluster IP is IPv6 — spec §3), and
/// `<name>.<ns>.svc.cluster.local:<port>`; when `port` is 80 or 443, also
/// emit each of those forms without the port suffix. Additional URLs are
/// prepended. Duplicate forms across the two locations collapse naturally
/// once this slice becomes a document key set (invariant S4), but we still
/// de-duplicate here so callers observing "did the URL set change" see a
/// stable answer.
pub fn compute_urls(services: &[ServiceEndpoint], additional: &[String]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut push = |urls: &mut Vec<String>, seen: &mut std::collections::HashSet<String>, url: String| {
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    };

    for url in additional {
        push(&mut urls, &mut seen, url.clone());
    }

    for svc in services {
        let dns = format!("{}.{}.svc", svc.name, svc.namespace);
        let cluster_dns = format!("{}.{}.svc.cluster.local", svc.name, svc.namespace);
        let ipv4 = svc
            .cluster_ip
            .as_deref()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .filter(|ip| ip.is_ipv4())
            .map(|ip| ip.to_string());

        for &port in &svc.ports {
            push(&mut urls, &mut seen, format!("{dns}:{port}"));
            if let Some(ip) = &ipv4 {
                push(&mut urls, &mut seen, format!("{ip}:{port}"));
            }
            push(&mut urls, &mut seen, format!("{cluster_dns}:{port}"));

            if port == 80 || port == 443 {
                push(&mut urls, &mut seen, dns.clone());
                if let Some(ip) = &ipv4 {
                    push(&mut urls, &mut seen, ip.clone());
                }
                push(&mut urls, &mut seen, cluster_dns.clone());
            }
        }
    }

    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, ns: &str, ip: &str, ports: &[i32]) -> ServiceEndpoint {
        ServiceEndpoint {
            name: name.to_string(),
            namespace: ns.to_string(),
            cluster_ip: Some(ip.to_string()),
            ports: ports.to_vec(),
        }
    }

    #[test]
    fn emits_three_forms_for_a_plain_port() {
        let urls = compute_urls(&[svc("docker-registry", "default", "10.0.0.5", &[5000])], &[]);
        assert_eq!(
            urls,
            vec![
                "docker-registry.default.svc:5000".to_string(),
                "10.0.0.5:5000".to_string(),
                "docker-registry.default.svc.cluster.local:5000".to_string(),
            ]
        );
    }

    #[test]
    fn well_known_ports_also_get_portless_forms() {
        let urls = compute_urls(&[svc("image-registry", "openshift-image-registry", "10.0.0.9", &[443])], &[]);
        assert!(urls.contains(&"image-registry.openshift-image-registry.svc:443".to_string()));
        assert!(urls.contains(&"image-registry.openshift-image-registry.svc".to_string()));
        assert!(urls.contains(&"10.0.0.9".to_string()));
        assert!(urls.contains(&"image-registry.openshift-image-registry.svc.cluster.local".to_string()));
    }

    #[test]
    fn ipv6_cluster_ip_is_omitted_but_dns_forms_remain() {
        let urls = compute_urls(&[svc("docker-registry", "default", "fd00::1", &[5000])], &[]);
        assert!(!urls.iter().any(|u| u.contains("fd00")));
        assert!(urls.contains(&"docker-registry.default.svc:5000".to_string()));
        assert!(urls.contains(&"docker-registry.default.svc.cluster.local:5000".to_string()));
    }

    #[test]
    fn additional_urls_are_prepended_and_deduplicated() {
        let urls = compute_urls(
            &[svc("docker-registry", "default", "10.0.0.5", &[5000])],
            &["extra.example.com".to_string(), "extra.example.com".to_string()],
        );
        assert_eq!(urls[0], "extra.example.com");
        assert_eq!(urls.iter().filter(|u| *u == "extra.example.com").count(), 1);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(compute_urls(&[], &[]).is_empty());
    }
}
