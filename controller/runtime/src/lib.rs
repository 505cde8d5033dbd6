//! Runtime wiring for the trellis controller: CLI arguments, the kubert
//! runtime, resource watches, the reconciliation worker, the shared store and
//! the mesh API server.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use trellis_controller_core as core;
pub use trellis_controller_k8s_api as k8s;
pub use trellis_controller_k8s_index as index;
pub use trellis_controller_ports as ports;
pub use trellis_controller_provider as provider;
pub use trellis_controller_shadow as shadow;

mod api;
mod args;
mod bootstrap;
mod metrics;
mod store;
mod worker;

pub use self::args::Args;
pub use self::store::Store;
