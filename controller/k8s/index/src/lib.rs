//! Cluster indexing.
//!
//! This crate maintains the controller's view of the cluster: a resource
//! filter deciding what participates in the mesh, an annotation decoder for
//! per-service traffic options, an index fed by watch streams that mirrors
//! the relevant objects in memory and enqueues reconciliation keys, and the
//! topology builder that snapshots the index into a value graph.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod filter;
pub mod queue;
pub mod topology;

mod index;

pub use self::{
    filter::ResourceFilter,
    index::{Index, Kind, SharedIndex},
    queue::{Key, WorkQueue},
};
