//! # Fleet Poll Library
//!
//! Poll a fleet-tracking REST API and expose normalized device snapshots.
//!
//! This library provides the core functionality for fetching device lists and
//! per-device extended telemetry (position, voltage, ...) from the tracking
//! cloud API, assembling the results into immutable snapshots, and refreshing
//! them on a schedule for downstream consumers.

pub mod api;
pub mod config;
pub mod error;
pub mod extended;
pub mod poller;
pub mod snapshot;
