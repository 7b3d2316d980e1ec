/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/context.rs
*
* The shared `Context` passed to C3, C4 and the C5 loops — this subsystem's
* equivalent of the teacher's per-controller `Context { client }` structs,
* generalized to also carry the resolved `Config`, the `TokenIssuer`
* collaborator, and (for C4 only) the two observation receivers from C1/C2.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;

use kube::Client;

use crate::config::Config;
use crate::observation::ObservationReceiver;
use crate::registry_urls::ServiceEndpoint;
use crate::token_issuer::TokenIssuer;

/// Context shared by C3 (service-account reconciler) and the C5 loops.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Config,
    pub token_issuer: Arc<dyn TokenIssuer>,
}

/// Context for C4 (pull-secret refresher), which additionally needs the
/// latest registry-URL and signing-key-ID observations.
pub struct RefresherContext {
    pub base: Context,
    pub urls: ObservationReceiver<Vec<String>>,
    pub key_ids: ObservationReceiver<Vec<String>>,
}

impl std::ops::Deref for RefresherContext {
    type Target = Context;
    fn deref(&self) -> &Context {
        &self.base
    }
}

/// Placeholder used only by `registry_urls`/`observation` doctests and unit
/// tests that need a `ServiceEndpoint` list without standing up a client.
#[cfg(test)]
pub fn empty_services() -> Vec<ServiceEndpoint> {
    Vec::new()
}
