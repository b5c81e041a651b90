//! Node feature label service.
//!
//! # Purpose
//! Accepts `SetLabels` calls from fleet nodes over mutually authenticated QUIC, binds each
//! call to the node named in the caller's client certificate, and persists the reported
//! labels as one record per (node, label key).
//!
//! # Notes
//! The binary wires [`config`], [`observability`] and [`server::run`]; tests drive the same
//! pieces directly.
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod labels;
pub mod observability;
pub mod server;

pub use client::LabelerClient;
pub use config::{NfdMasterConfig, StorageBackend};
pub use error::SetLabelsError;
pub use labels::{LabelReport, LabelUpserter, NodeFeature};
pub use server::{LabelServer, build_identity, connect_persistence, run, set_labels};
