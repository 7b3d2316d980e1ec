/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* Defines and registers the custom Prometheus metrics this subsystem
* exposes. Spec §7 names no user-visible surface ("no user surface") and no
* Non-goal excludes observability, so this ships the same way the teacher's
* operator exposes its own metrics: via `lazy_static` +
* `prometheus::register_*!`, read once at startup and updated from every
* reconcile function.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge, Registry,
};

// --- Metric Definitions ---

lazy_static! {
    /// Total number of managed pull secrets refreshed with a new token (C4).
    pub static ref PULL_SECRETS_REFRESHED_TOTAL: IntCounter = register_int_counter!(opts!(
        "pull_secret_refreshed_total",
        "Total number of managed pull secrets refreshed with a new token."
    ))
    .unwrap();

    /// Total number of managed pull secrets deleted because their owning
    /// service account disappeared or diverged (C4 orphan check).
    pub static ref PULL_SECRETS_ORPHANED_TOTAL: IntCounter = register_int_counter!(opts!(
        "pull_secret_orphaned_total",
        "Total number of managed pull secrets deleted as orphaned."
    ))
    .unwrap();

    /// Total number of service accounts for which a skeleton pull secret
    /// was created (C3).
    pub static ref SKELETON_SECRETS_CREATED_TOTAL: IntCounter = register_int_counter!(opts!(
        "pull_secret_skeleton_created_total",
        "Total number of skeleton managed pull secrets created by the service-account reconciler."
    ))
    .unwrap();

    /// Reconcile errors, labeled by controller name and error class.
    pub static ref RECONCILE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pull_secret_reconcile_errors_total",
        "Total number of reconciliation errors, by controller and class.",
        &["controller", "class"]
    )
    .unwrap();

    /// Unix timestamp of the soonest upcoming refresh deadline across every
    /// tracked managed secret. One gauge, not one series per secret, to
    /// keep cardinality bounded regardless of fleet size.
    pub static ref NEXT_REFRESH_DEADLINE_UNIX: IntGauge = register_int_gauge!(opts!(
        "pull_secret_next_refresh_deadline_unix",
        "Unix timestamp of the soonest upcoming pull secret refresh deadline."
    ))
    .unwrap();
}

/// Creates a new Prometheus registry and registers all custom metrics.
///
/// This function is intended to be called once at process startup.
///
/// # Returns
/// A `Result` containing the `Registry` or a `prometheus::Error`.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(PULL_SECRETS_REFRESHED_TOTAL.clone()))?;
    r.register(Box::new(PULL_SECRETS_ORPHANED_TOTAL.clone()))?;
    r.register(Box::new(SKELETON_SECRETS_CREATED_TOTAL.clone()))?;
    r.register(Box::new(RECONCILE_ERRORS_TOTAL.clone()))?;
    r.register(Box::new(NEXT_REFRESH_DEADLINE_UNIX.clone()))?;
    Ok(r)
}
