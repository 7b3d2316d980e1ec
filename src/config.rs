/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* The one configuration surface this subsystem recognizes (spec §6: "The
* enclosing binary recognizes one configuration field relevant here: a list
* of additional registry URLs..."), plus the handful of operational knobs
* every controller needs (the signing-key secret's location, the metrics
* bind address). Read from the environment at process start, the same way
* the teacher's `main.rs` reads `PROMETHEUS_ENDPOINT` — no config-file crate
* is introduced, since the teacher's operator binary doesn't use one either.
*
* Field-manager identities are not configured here: each controller carries
* its own hardcoded literal (the teacher's convention — see
* `rbac_policy_controller.rs`'s `"rbac-policy-controller.ph.io"`), since a
* field-manager string names *who owns which fields*, not an operator-tunable
* knob.
*
* SPDX-License-Identifier: Apache-2.0
*/

#[derive(Debug, Clone)]
pub struct Config {
    /// Prepended to every emitted registry URL set (spec §6).
    pub additional_registry_urls: Vec<String>,
    /// Namespace of the signing-key-material secret watched by C2.
    pub signing_key_secret_namespace: String,
    /// Name of the signing-key-material secret watched by C2.
    pub signing_key_secret_name: String,
    /// Bind address for the `/metrics` and `/healthz` HTTP server.
    pub metrics_addr: std::net::SocketAddr,
    /// Whether the optional service-account rollback loop (C5c) runs at all
    /// (spec §4.5: "Service-account rollback (optional)").
    pub enable_rollback: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            additional_registry_urls: std::env::var("ADDITIONAL_REGISTRY_URLS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            signing_key_secret_namespace: std::env::var("SIGNING_KEY_SECRET_NAMESPACE")
                .unwrap_or_else(|_| "openshift-config-managed".to_string()),
            signing_key_secret_name: std::env::var("SIGNING_KEY_SECRET_NAME")
                .unwrap_or_else(|_| "signing-key".to_string()),
            metrics_addr: std::env::var("METRICS_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| ([0, 0, 0, 0], 9090).into()),
            enable_rollback: std::env::var("ENABLE_PULL_SECRET_ROLLBACK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env() {
        // Exercises the parsing helpers directly rather than mutating
        // process-wide environment state, which would race other tests.
        let urls: Vec<String> = "a, b ,,c"
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        assert_eq!(urls, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
}
