//! Master configuration with sensible defaults.

// Layer 1: Standard library
use std::collections::{HashMap, HashSet};
use std::time::Duration;

// Layer 2: Third-party
use serde::{Deserialize, Serialize};

// Layer 3: Internal
// (none)

/// Default window an agent has to re-register after a master failover or a
/// disconnection before it is marked unreachable (10 minutes).
pub const DEFAULT_AGENT_REREGISTER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default framework failover timeout when the framework does not set one.
pub const DEFAULT_FRAMEWORK_FAILOVER_TIMEOUT: Duration = Duration::ZERO;

/// Default bound on the completed-framework ring.
pub const DEFAULT_MAX_COMPLETED_FRAMEWORKS: usize = 50;

/// Default bound on each framework's completed-task ring.
pub const DEFAULT_MAX_COMPLETED_TASKS_PER_FRAMEWORK: usize = 1000;

/// Default bound on the removed-agent tombstone cache.
pub const DEFAULT_MAX_REMOVED_AGENTS: usize = 10_000;

/// Default bound on the unreachable list kept in the registry.
pub const DEFAULT_MAX_UNREACHABLE_AGENTS: usize = 1024;

/// Default registry garbage collection interval (15 minutes).
pub const DEFAULT_REGISTRY_GC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Default age cap for unreachable registry entries (2 weeks).
pub const DEFAULT_REGISTRY_MAX_AGENT_AGE: Duration = Duration::from_secs(14 * 24 * 3600);

/// Default count cap for unreachable registry entries.
pub const DEFAULT_REGISTRY_MAX_AGENT_COUNT: usize = 1024;

/// Default heartbeat interval for streaming connections (15 seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default deadline for an in-flight authentication attempt (15 seconds).
pub const DEFAULT_AUTHENTICATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-principal rate limit: sustained calls per second plus an optional
/// bound on how many calls may wait in the deferral queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained queries per second.
    pub qps: f64,
    /// Deferral queue capacity; `None` means unbounded.
    pub capacity: Option<usize>,
}

impl RateLimit {
    /// A limit of `qps` calls per second with unbounded queueing.
    pub fn per_second(qps: f64) -> Self {
        Self {
            qps,
            capacity: None,
        }
    }

    /// Bound the deferral queue.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Rate limiting configuration for inbound framework calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Limits for explicitly configured principals.
    pub principals: HashMap<String, RateLimit>,
    /// Shared limit for every principal not configured above, including
    /// unauthenticated connections. `None` disables default limiting.
    pub default: Option<RateLimit>,
}

/// Master-wide configuration.
///
/// # Examples
///
/// ```rust
/// use flotilla_master::config::MasterConfig;
/// use std::time::Duration;
///
/// let config = MasterConfig::builder()
///     .with_agent_reregister_timeout(Duration::from_secs(600))
///     .with_offer_timeout(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// assert_eq!(config.offer_timeout, Some(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// How long a recovered or disconnected agent may stay silent before
    /// the master marks it unreachable.
    pub agent_reregister_timeout: Duration,

    /// Failover timeout applied to frameworks that do not set their own.
    pub framework_failover_timeout: Duration,

    /// Offers expire after this long if the framework neither accepts nor
    /// declines. `None` disables expiry.
    pub offer_timeout: Option<Duration>,

    /// Bound on the completed-framework ring.
    pub max_completed_frameworks: usize,

    /// Bound on each framework's completed-task ring.
    pub max_completed_tasks_per_framework: usize,

    /// Bound on the removed-agent tombstone cache.
    pub max_removed_agents: usize,

    /// Bound on the unreachable list kept in the registry.
    pub max_unreachable_agents: usize,

    /// How often registry garbage collection runs.
    pub registry_gc_interval: Duration,

    /// Unreachable entries older than this are pruned.
    pub registry_max_agent_age: Duration,

    /// At most this many unreachable entries survive a GC pass.
    pub registry_max_agent_count: usize,

    /// Refuse re-registration from agents the master has no record of.
    pub registry_strict: bool,

    /// Roles frameworks may subscribe under; `None` allows any role.
    pub role_whitelist: Option<HashSet<String>>,

    /// Static role weights. Roles not listed weigh 1.0.
    pub weights: HashMap<String, f64>,

    /// Per-principal rate limits for framework calls.
    pub rate_limits: RateLimits,

    /// Rate limit on agent unreachability registry submissions, guarding
    /// against a thundering herd of removals during a network blip.
    pub agent_removal_limit: Option<RateLimit>,

    /// Refuse framework connections whose peer cannot be authenticated.
    pub authentication_required: bool,

    /// How long an authentication attempt may stay in flight before its
    /// queued calls are refused. The attempt itself is never cancelled; a
    /// late completion is discarded by generation.
    pub authentication_timeout: Duration,

    /// Names of the authenticator modules to use, in order. Module loading
    /// itself is outside the core; the list is surfaced through the flags
    /// endpoint.
    pub authenticators: Vec<String>,

    /// Heartbeat interval for HTTP framework streams and operator
    /// subscribers.
    pub heartbeat_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            agent_reregister_timeout: DEFAULT_AGENT_REREGISTER_TIMEOUT,
            framework_failover_timeout: DEFAULT_FRAMEWORK_FAILOVER_TIMEOUT,
            offer_timeout: None,
            max_completed_frameworks: DEFAULT_MAX_COMPLETED_FRAMEWORKS,
            max_completed_tasks_per_framework: DEFAULT_MAX_COMPLETED_TASKS_PER_FRAMEWORK,
            max_removed_agents: DEFAULT_MAX_REMOVED_AGENTS,
            max_unreachable_agents: DEFAULT_MAX_UNREACHABLE_AGENTS,
            registry_gc_interval: DEFAULT_REGISTRY_GC_INTERVAL,
            registry_max_agent_age: DEFAULT_REGISTRY_MAX_AGENT_AGE,
            registry_max_agent_count: DEFAULT_REGISTRY_MAX_AGENT_COUNT,
            registry_strict: false,
            role_whitelist: None,
            weights: HashMap::new(),
            rate_limits: RateLimits::default(),
            agent_removal_limit: None,
            authentication_required: false,
            authentication_timeout: DEFAULT_AUTHENTICATION_TIMEOUT,
            authenticators: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl MasterConfig {
    /// Create a new configuration builder.
    pub fn builder() -> MasterConfigBuilder {
        MasterConfigBuilder::default()
    }

    /// Validate configuration values.
    ///
    /// Returns `Err` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be > 0".to_owned());
        }
        if self.authentication_timeout.is_zero() {
            return Err("authentication_timeout must be > 0".to_owned());
        }
        if self.registry_gc_interval.is_zero() {
            return Err("registry_gc_interval must be > 0".to_owned());
        }
        if self.max_completed_frameworks == 0 {
            return Err("max_completed_frameworks must be > 0".to_owned());
        }
        if let Some(timeout) = self.offer_timeout {
            if timeout.is_zero() {
                return Err("offer_timeout must be > 0 when set".to_owned());
            }
        }
        for (role, weight) in &self.weights {
            if *weight <= 0.0 {
                return Err(format!("weight for role {role} must be > 0"));
            }
        }
        let limits = self
            .rate_limits
            .principals
            .values()
            .chain(self.rate_limits.default.iter())
            .chain(self.agent_removal_limit.iter());
        for limit in limits {
            if limit.qps <= 0.0 {
                return Err("rate limit qps must be > 0".to_owned());
            }
        }
        Ok(())
    }
}

/// Builder for [`MasterConfig`] with a fluent API.
#[derive(Debug, Clone, Default)]
pub struct MasterConfigBuilder {
    config: MasterConfig,
}

impl MasterConfigBuilder {
    /// Set the agent re-registration timeout.
    pub fn with_agent_reregister_timeout(mut self, timeout: Duration) -> Self {
        self.config.agent_reregister_timeout = timeout;
        self
    }

    /// Set the default framework failover timeout.
    pub fn with_framework_failover_timeout(mut self, timeout: Duration) -> Self {
        self.config.framework_failover_timeout = timeout;
        self
    }

    /// Enable offer expiry.
    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.config.offer_timeout = Some(timeout);
        self
    }

    /// Set the completed-framework ring bound.
    pub fn with_max_completed_frameworks(mut self, max: usize) -> Self {
        self.config.max_completed_frameworks = max;
        self
    }

    /// Set the completed-task ring bound.
    pub fn with_max_completed_tasks_per_framework(mut self, max: usize) -> Self {
        self.config.max_completed_tasks_per_framework = max;
        self
    }

    /// Set the removed-agent tombstone cache bound.
    pub fn with_max_removed_agents(mut self, max: usize) -> Self {
        self.config.max_removed_agents = max;
        self
    }

    /// Set the registry garbage collection interval.
    pub fn with_registry_gc_interval(mut self, interval: Duration) -> Self {
        self.config.registry_gc_interval = interval;
        self
    }

    /// Set the unreachable entry age cap.
    pub fn with_registry_max_agent_age(mut self, age: Duration) -> Self {
        self.config.registry_max_agent_age = age;
        self
    }

    /// Set the unreachable entry count cap.
    pub fn with_registry_max_agent_count(mut self, count: usize) -> Self {
        self.config.registry_max_agent_count = count;
        self
    }

    /// Refuse re-registration from unknown agents.
    pub fn with_registry_strict(mut self, strict: bool) -> Self {
        self.config.registry_strict = strict;
        self
    }

    /// Restrict subscribable roles.
    pub fn with_role_whitelist(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.config.role_whitelist = Some(roles.into_iter().collect());
        self
    }

    /// Set a static role weight.
    pub fn with_weight(mut self, role: impl Into<String>, weight: f64) -> Self {
        self.config.weights.insert(role.into(), weight);
        self
    }

    /// Set a per-principal rate limit.
    pub fn with_rate_limit(mut self, principal: impl Into<String>, limit: RateLimit) -> Self {
        self.config
            .rate_limits
            .principals
            .insert(principal.into(), limit);
        self
    }

    /// Set the shared default rate limit.
    pub fn with_default_rate_limit(mut self, limit: RateLimit) -> Self {
        self.config.rate_limits.default = Some(limit);
        self
    }

    /// Throttle agent unreachability submissions.
    pub fn with_agent_removal_limit(mut self, limit: RateLimit) -> Self {
        self.config.agent_removal_limit = Some(limit);
        self
    }

    /// Require authenticated framework connections.
    pub fn with_authentication_required(mut self, required: bool) -> Self {
        self.config.authentication_required = required;
        self
    }

    /// Bound in-flight authentication attempts.
    pub fn with_authentication_timeout(mut self, timeout: Duration) -> Self {
        self.config.authentication_timeout = timeout;
        self
    }

    /// Name the authenticator modules to use, in order.
    pub fn with_authenticators(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.config.authenticators = names.into_iter().collect();
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<MasterConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
