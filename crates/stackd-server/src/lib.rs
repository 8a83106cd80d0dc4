//! # stackd-server
//!
//! Collects the cloud resources a set of locally running services declare.
//! Each service gets its own collector on a loopback port, named to it in
//! `SERVICE_ADDRESS`. The service declares resources and opens trigger
//! streams against it, and the collector records everything in that
//! service's [`requirements::ServiceRequirements`].
//!
//! ## Entry Points
//!
//! *   **Registry**: [`collector::Collector`]
//! *   **Service side**: [`client::CollectorClient`]
//! *   **Configuration**: [`config_loader::ConfigLoader`]

#![warn(clippy::await_holding_lock)]
#![warn(clippy::wildcard_enum_match_arm)]
#![warn(clippy::redundant_pattern_matching)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod collector;
pub mod config_loader;
pub mod ipc;
pub mod logging;
pub mod registration;
pub mod requirements;

pub use collector::{CollectionReport, Collector, CollectorError, SERVICE_ADDRESS_ENV};
pub use requirements::{Conflict, Requirements, ServiceRequirements};
