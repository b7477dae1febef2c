//! # flotilla-registrar - Durable Registry Protocol
//!
//! Every master state change that must survive failover is mediated by a
//! serialized mutating operation against the registry: a durable pair of
//! lists (admitted agents, unreachable agents). This crate defines the
//! registry data model, the five mutations, the [`Registrar`] contract the
//! master depends on, and an in-memory linearizing implementation used in
//! tests and single-node deployments.
//!
//! The replicated log that would back a production registrar is out of
//! scope; any implementation that linearizes [`Registrar::apply`] calls
//! satisfies the master.

pub mod error;
pub mod operation;
pub mod registrar;
pub mod registry;

// Re-export commonly used types
pub use error::RegistrarError;
pub use operation::RegistryOperation;
pub use registrar::{InMemoryRegistrar, Registrar};
pub use registry::Registry;
