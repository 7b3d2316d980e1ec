/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers.rs
*
* Declares the five cooperating reconciliation components (spec §2):
* registry_observer (C1), keyid_observer (C2), service_account_controller
* (C3), pull_secret_refresher (C4), and legacy_migration (C5's three loops).
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod keyid_observer;
pub mod legacy_migration;
pub mod pull_secret_refresher;
pub mod registry_observer;
pub mod service_account_controller;
