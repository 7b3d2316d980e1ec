/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/errors.rs
*
* Spec §7 sorts failures into a small taxonomy (not-found, conflict,
* transient, malformed, precondition, programmer precondition) and assigns
* each a different requeue behavior. Every controller in this subsystem
* defines its own `thiserror::Error` enum (the teacher's convention — see
* `rbac_policy_controller::Error`), but they all need the *same* mapping
* from "what kind of kube::Error is this" to "how should error_policy
* requeue". That mapping lives here so it isn't re-derived five times.
*
* SPDX-License-Identifier: Apache-2.0
*/

use kube::runtime::controller::Action;
use std::time::Duration;

/// How a failure should be retried, independent of which controller hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueClass {
    /// Benign: the object is gone. Treat as success, no requeue.
    NotFound,
    /// The write raced a concurrent update; retry immediately, no backoff
    /// penalty, since the next read will simply see the new state.
    Conflict,
    /// A transport/API-server hiccup; retry with exponential backoff.
    Transient,
    /// A precondition this reconciler needed isn't met yet (e.g. C4's
    /// urls/kids not observed); retry with backoff so rate limiting applies.
    PreconditionNotMet,
}

impl RequeueClass {
    /// Classifies a `kube::Error` returned from a get/apply/patch/delete call.
    pub fn of(err: &kube::Error) -> RequeueClass {
        match err {
            kube::Error::Api(api_err) if api_err.code == 404 => RequeueClass::NotFound,
            kube::Error::Api(api_err) if api_err.code == 409 => RequeueClass::Conflict,
            _ => RequeueClass::Transient,
        }
    }

    /// The `Action` an `error_policy` should return for this class, given a
    /// controller-specific base backoff and retry count.
    pub fn action(self, retries: u32) -> Action {
        match self {
            RequeueClass::NotFound => Action::await_change(),
            RequeueClass::Conflict => Action::requeue(Duration::from_millis(100)),
            RequeueClass::Transient | RequeueClass::PreconditionNotMet => {
                Action::requeue(exponential_backoff(retries))
            }
        }
    }
}

/// Exponential backoff with a 5s base and a 5m ceiling, matching the
/// "exponential rate limiting" spec §5/§7 describe without mandating exact
/// constants.
pub fn exponential_backoff(retries: u32) -> Duration {
    let capped_exp = retries.min(6); // 5s * 2^6 = 320s, comfortably under the 5m ceiling
    let secs = 5u64.saturating_mul(1u64 << capped_exp);
    Duration::from_secs(secs.min(300))
}

/// True when a `kube::Error` represents a get/delete of an object that is
/// simply absent — per spec §7, never an error, always a success short-circuit.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        assert_eq!(exponential_backoff(0), Duration::from_secs(5));
        assert_eq!(exponential_backoff(1), Duration::from_secs(10));
        assert_eq!(exponential_backoff(6), Duration::from_secs(300));
        assert_eq!(exponential_backoff(20), Duration::from_secs(300));
    }
}
