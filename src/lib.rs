// Copyright 2024 Notarizer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
#![deny(unsafe_code)]

//! # Notarizer Crate
//!
//! A daemon that captures web requests, notarizes them against an external
//! TLS notary, and archives the resulting proofs.
//!
//! ## Overview
//!
//! Browser-side capture events stream into the notarizer over a local
//! WebSocket connection. Each network transaction is assembled from its
//! phases (headers sent, body available, response started) inside a
//! TTL-bound cache, gated by a user-controlled URL pattern filter, and
//! queued for notarization by id. A single scheduler drains the queue one
//! request at a time, pacing successive notarizations by a minimum delay,
//! and archives each successful proof in an ordered history store.
//! Completed proofs can optionally be encrypted and pushed to an external
//! endpoint as a best-effort side effect.
//!
//! The system is composed of three main components:
//!
//!   1. Capture: the request cache and the URL pattern filter decide what
//!      is worth notarizing.
//!   2. Scheduling: the notarization queue talks to the external notary,
//!      strictly one request in flight, failures terminal.
//!   3. Archival: the settings and history stores persist user
//!      configuration and completed proofs across restarts.

/// Short-lived cache of partially captured web requests.
pub mod capture;
/// The time source abstraction used by the cache and the scheduler.
pub mod clock;
/// Configuration loading and validation.
pub mod config;
/// Shared daemon state and the shutdown broadcast.
pub mod context;
/// Crate-wide error type.
pub mod error;
/// URL pattern admission filter.
pub mod filter;
/// WebSocket command server.
pub mod handler;
/// The external notary client.
pub mod notary;
/// Probe targets for structured tracing.
pub mod probe;
/// Encrypt-and-publish side channel for completed proofs.
pub mod publish;
/// The notarization queue and its drain scheduler.
pub mod queue;
/// Service wiring and startup.
pub mod service;
/// Settings and history storage backends.
pub mod store;

pub use error::{Error, Result};
