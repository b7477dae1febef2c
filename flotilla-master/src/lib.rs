//! # flotilla-master - Cluster Manager Master Core
//!
//! The central authority of a flotilla cluster: it mediates between
//! resource-offering agents and resource-consuming frameworks, launches
//! tasks and tracks their lifecycle, and coordinates with a pluggable
//! allocator that decides how free resources are offered.
//!
//! # Architecture
//!
//! The master is one cooperative actor draining a single event queue.
//! Inbound calls, transport exits, allocator decisions, timers, and the
//! completions of suspended work (registry commits, authentication,
//! authorization) all arrive as events and are processed serially, which
//! is what keeps the cross-entity invariants (offer sets, used-resources
//! counters, registry mirrors) consistent without locks.
//!
//! ```text
//! agents ──┐                              ┌── Registrar (durable registry)
//! frameworks ─┼─→ event queue → Master ←──┼── Authorizer / Authenticator
//! operators ──┘        ↑                  └── Allocator (offer decisions)
//!                      └── timers, continuations
//! ```
//!
//! Durable state is limited to agent admission and unreachability,
//! mediated by `flotilla-registrar`. Task state is in memory only; status
//! updates are at-least-once and reconciliation converges master and
//! framework views after disconnections.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use flotilla_master::allocator::ManualAllocator;
//! use flotilla_master::auth::{PermissiveAuthorizer, StaticAuthenticator};
//! use flotilla_master::config::MasterConfig;
//! use flotilla_master::master::Master;
//! use flotilla_registrar::InMemoryRegistrar;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (allocator, _allocator_handle) = ManualAllocator::new();
//! let (master, handle) = Master::new(
//!     MasterConfig::default(),
//!     allocator,
//!     InMemoryRegistrar::default(),
//!     PermissiveAuthorizer,
//!     StaticAuthenticator::new(),
//! )?;
//! tokio::spawn(master.run());
//! // Drive the master through `handle`.
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`master`] - the actor, its handle, and the lifecycle orchestration
//! - [`config`] - flags with defaults, builder, and validation
//! - [`event`] - the actor's event type and connection handles
//! - [`allocator`] - the allocator contract and a deterministic stand-in
//! - [`auth`] - authenticator/authorizer contracts and tracking
//! - [`limiter`] - per-principal token buckets with deferral queues
//! - [`error`] - the error taxonomy

pub mod allocator;
pub mod auth;
pub mod config;
pub mod error;
pub mod event;
pub mod limiter;
pub mod master;
mod roster;

// Re-export commonly used types
pub use allocator::{
    Allocator, AllocatorCall, AllocatorSink, ManualAllocator, ManualAllocatorHandle,
};
pub use auth::{
    Action, AuthenticationError, Authenticator, AuthorizationError, AuthorizationRequest,
    Authorizer, PermissiveAuthorizer, StaticAuthenticator,
};
pub use config::{MasterConfig, MasterConfigBuilder, RateLimit, RateLimits};
pub use error::MasterError;
pub use event::{AgentConn, ConnectionKind, Event, OperatorReply, SchedulerConn};
pub use limiter::{LimitDecision, RateLimiters, TokenBucket};
pub use master::{Master, MasterHandle, MasterMetrics};
