/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/clock.rs
*
* A tiny seam around "now" (spec §6: "Clock. Monotonic now(); no special
* precision."), so the refresh-threshold math in `jwt.rs` and the validity
* check in the pull-secret controller can be exercised deterministically in
* tests without sleeping or mocking a whole Kubernetes cluster.
*
* SPDX-License-Identifier: Apache-2.0
*/

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The production clock, backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
