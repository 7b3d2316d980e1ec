/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model.rs
*
* This file centralizes the annotation/label/finalizer literals and the
* small value types shared across every controller in this subsystem. It is
* the single place that encodes the data-model invariants described for
* service accounts and managed pull secrets, so that no controller drifts
* from another's idea of what a string constant means.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::BTreeMap;

/// Annotation on a `ServiceAccount` naming its one managed pull secret (invariant A1).
pub const ANNOTATION_PULL_SECRET_REF: &str = "internal-registry-pull-secret-ref";

/// Annotation on a managed pull secret naming the `ServiceAccount` it belongs to (invariant S1).
pub const ANNOTATION_SERVICE_ACCOUNT: &str = "auth-token.service-account";

/// Annotation on a managed pull secret recording its binding mode (invariant S2).
pub const ANNOTATION_BINDING: &str = "auth-token.binding";

/// Value of [`ANNOTATION_BINDING`] for secrets owned end-to-end by this subsystem.
pub const BINDING_BOUND: &str = "bound";

/// Value of [`ANNOTATION_BINDING`] for secrets predating this subsystem.
pub const BINDING_LEGACY: &str = "legacy";

/// Annotation marking a long-lived service-account token secret as created by this subsystem,
/// consumed by the legacy token labeler (C5).
pub const ANNOTATION_CREATED_BY: &str = "auth-token.created-by";

/// Label applied to legacy long-lived token secrets so operators can tell them apart
/// from newly issued ones.
pub const LABEL_LEGACY_TOKEN: &str = "legacy-token";

/// Finalizer carried by older pull secrets, removed during migration (C5).
pub const FINALIZER_LEGACY_TOKEN: &str = "ph.io/legacy-token-cleanup";

/// The sole data key of a managed pull secret's byte map (invariant S4).
pub const DOCKERCFG_DATA_KEY: &str = ".dockercfg";

/// The only secret type this subsystem manages.
pub const SECRET_TYPE_DOCKERCFG: &str = "kubernetes.io/dockercfg";

/// The legacy long-lived service-account token secret type watched by C5's labeler.
pub const SECRET_TYPE_SERVICE_ACCOUNT_TOKEN: &str = "kubernetes.io/service-account-token";

/// One entry of a `.dockercfg`-style authentication document.
///
/// Only the `auth` field is ever written by this subsystem (spec §6): no
/// `username`/`password`/`email` entries are produced, even though the
/// canonical Docker config format accepts them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DockerConfigEntry {
    pub auth: String,
}

/// The authentication document embedded in a managed pull secret's
/// `.dockercfg` data key: one entry per registry URL (invariant S4).
pub type AuthDocument = BTreeMap<String, DockerConfigEntry>;

/// Builds the literal auth-entry value this subsystem writes: base64 of
/// `"<token>:" + jwt`, where the leading `<token>` text is literal (spec
/// §6: "yes, including the angle brackets").
pub fn encode_auth_entry(jwt: &str) -> DockerConfigEntry {
    use base64::Engine;
    let raw = format!("<token>:{jwt}");
    DockerConfigEntry {
        auth: base64::engine::general_purpose::STANDARD.encode(raw.as_bytes()),
    }
}

/// Decodes a previously written auth entry back into `(token_prefix, jwt)`,
/// used by the validity check (spec §4.4.2) to recover the embedded JWT.
pub fn decode_auth_entry(entry: &DockerConfigEntry) -> Option<(String, String)> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(entry.auth.as_bytes())
        .ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (prefix, jwt) = raw.split_once(':')?;
    Some((prefix.to_string(), jwt.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_entry_round_trips() {
        let entry = encode_auth_entry("header.payload.sig");
        let (prefix, jwt) = decode_auth_entry(&entry).unwrap();
        assert_eq!(prefix, "<token>");
        assert_eq!(jwt, "header.payload.sig");
    }

    #[test]
    fn auth_entry_rejects_garbage() {
        let entry = DockerConfigEntry {
            auth: "not-base64!!".to_string(),
        };
        assert!(decode_auth_entry(&entry).is_none());
    }
}
