/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/legacy.rs
*
* Pure JSON-patch construction for C5's two index-based removal paths (spec
* §4.5, §9 "JSON-patch with test"): the legacy pull-secret finalizer removal,
* and the service-account rollback's annotation/reference stripping. Every
* `remove` is paired with a `test` on the same path so a stale watch cache
* causes the patch to be rejected and retried rather than silently deleting
* the wrong array element, the same defensive shape `release_orchestrator`
* describes for its own RFC 6902 patches.
*
* SPDX-License-Identifier: Apache-2.0
*/

use json_patch::{Patch, PatchOperation, RemoveOperation, TestOperation};
use jsonptr::PointerBuf;
use serde_json::{json, Value};

fn pointer(path: &str) -> PointerBuf {
    PointerBuf::parse(path).expect("legacy.rs only builds well-formed JSON pointers")
}

fn test_then_remove(path: &str, expected: Value) -> Vec<PatchOperation> {
    let ptr = pointer(path);
    vec![
        PatchOperation::Test(TestOperation { path: ptr.clone(), value: expected }),
        PatchOperation::Remove(RemoveOperation { path: ptr }),
    ]
}

/// A JSON Pointer reference token must escape `~` and `/` (RFC 6901 §3).
fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Removes the legacy finalizer at `index` from `metadata.finalizers` (spec
/// §4.5 "Legacy pull-secret finalizer remover").
pub fn remove_finalizer_patch(index: usize, finalizer: &str) -> Patch {
    Patch(test_then_remove(
        &format!("/metadata/finalizers/{index}"),
        Value::String(finalizer.to_string()),
    ))
}

/// Removes the `internal-registry-pull-secret-ref` annotation and, when
/// present, the array entry at `secrets_index`/`image_pull_secrets_index`
/// that references `secret_name` (spec §4.5 "Service-account rollback").
pub fn rollback_service_account_patch(
    annotation_key: &str,
    secret_name: &str,
    secrets_index: Option<usize>,
    image_pull_secrets_index: Option<usize>,
) -> Patch {
    let mut ops = test_then_remove(
        &format!("/metadata/annotations/{}", escape_pointer_token(annotation_key)),
        Value::String(secret_name.to_string()),
    );

    if let Some(index) = secrets_index {
        ops.extend(test_then_remove(
            &format!("/secrets/{index}"),
            json!({ "name": secret_name }),
        ));
    }
    if let Some(index) = image_pull_secrets_index {
        ops.extend(test_then_remove(
            &format!("/imagePullSecrets/{index}"),
            json!({ "name": secret_name }),
        ));
    }

    Patch(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizer_patch_is_a_test_remove_pair_at_the_given_index() {
        let patch = remove_finalizer_patch(2, "ph.io/legacy-token-cleanup");
        assert_eq!(patch.0.len(), 2);
        match &patch.0[0] {
            PatchOperation::Test(op) => {
                assert_eq!(op.path.to_string(), "/metadata/finalizers/2");
                assert_eq!(op.value, Value::String("ph.io/legacy-token-cleanup".to_string()));
            }
            _ => panic!("expected a Test operation first"),
        }
        match &patch.0[1] {
            PatchOperation::Remove(op) => assert_eq!(op.path.to_string(), "/metadata/finalizers/2"),
            _ => panic!("expected a Remove operation second"),
        }
    }

    #[test]
    fn rollback_patch_covers_annotation_and_both_reference_arrays() {
        let patch = rollback_service_account_patch(
            "internal-registry-pull-secret-ref",
            "sa1-dockercfg-abcde",
            Some(1),
            Some(0),
        );
        // annotation test+remove, secrets test+remove, imagePullSecrets test+remove
        assert_eq!(patch.0.len(), 6);
        match &patch.0[2] {
            PatchOperation::Test(op) => assert_eq!(op.path.to_string(), "/secrets/1"),
            _ => panic!("expected a Test operation for /secrets/1"),
        }
        match &patch.0[4] {
            PatchOperation::Test(op) => assert_eq!(op.path.to_string(), "/imagePullSecrets/0"),
            _ => panic!("expected a Test operation for /imagePullSecrets/0"),
        }
    }

    #[test]
    fn rollback_patch_omits_absent_reference_arrays() {
        let patch = rollback_service_account_patch(
            "internal-registry-pull-secret-ref",
            "sa1-dockercfg-abcde",
            None,
            None,
        );
        assert_eq!(patch.0.len(), 2);
    }
}
