//! Aggregation and charge control for a virtual battery pack.
//!
//! Several independent battery banks, each publishing telemetry on an
//! external value bus, are combined into one virtual pack. A per-bank
//! state-machine-governed feedback controller computes charge voltage and
//! current ceilings every tick, and a merge engine fans per-bank telemetry
//! into pack-level published values.
//!
//! The transport itself (service discovery, wire protocol) is an external
//! collaborator behind the [`bus::ValueBus`] trait; this crate is the
//! single-threaded control core the embedding service drives.

pub mod aggregator;
pub mod bank;
pub mod bus;
pub mod charge_state;
pub mod config;
pub mod control;
pub mod errors;
pub mod filter;
pub mod history;
pub mod merge;
