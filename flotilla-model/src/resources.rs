//! Resource bundles with reservations and persistent volumes.
//!
//! A [`Resources`] value is a canonical bag of named resources. Scalar kinds
//! (`cpus`, `mem`, `disk`, `gpus`) use floating point quantities; `ports` is
//! a set of closed integer ranges. Entries are keyed by `(name, role,
//! volume)`: a reserved resource and an unreserved resource of the same name
//! never merge, which is what makes reserve/unreserve expressible as
//! subtract-then-add.
//!
//! Range kinds are never summed across agents; callers keep per-agent
//! partitions and aggregate scalar quantities only.

// Layer 1: Standard library imports
use std::fmt::{self, Display};
use std::ops::{Add, AddAssign};

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Layer 3: Internal module imports
// (none)

/// Scalar comparison tolerance.
///
/// Scalar quantities survive repeated add/subtract cycles; comparisons are
/// made within this tolerance and near-zero entries are pruned.
pub const SCALAR_EPSILON: f64 = 1e-6;

/// Well-known resource names.
pub const CPUS: &str = "cpus";
pub const MEM: &str = "mem";
pub const DISK: &str = "disk";
pub const GPUS: &str = "gpus";
pub const PORTS: &str = "ports";

/// Errors produced by resource arithmetic and operation application.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    /// A subtraction would underflow the named resource.
    #[error("insufficient {name} resources")]
    Insufficient { name: String },

    /// Scalar and range values were mixed for the same resource name.
    #[error("resource kinds for {name} do not match")]
    KindMismatch { name: String },

    /// The operation carries no resources at all.
    #[error("operation contains no resources")]
    EmptyOperation,

    /// A reservation operation carried malformed resources.
    #[error("invalid reservation: {0}")]
    InvalidReservation(String),

    /// A volume operation carried malformed resources.
    #[error("invalid volume: {0}")]
    InvalidVolume(String),
}

/// A persistent volume annotation on a reserved `disk` resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Volume {
    /// Operator- or framework-chosen volume id.
    pub id: String,
    /// Path the volume is mounted at inside the container.
    pub container_path: String,
}

impl Volume {
    /// Create a volume annotation.
    pub fn new(id: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            container_path: container_path.into(),
        }
    }
}

/// The quantity carried by one resource entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Fractional quantity (cpus, mem in MB, disk in MB, gpus).
    Scalar(f64),
    /// Closed integer ranges (ports). Always normalized: sorted, coalesced.
    Ranges(Vec<(u64, u64)>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(v) => *v <= SCALAR_EPSILON,
            Value::Ranges(r) => r.is_empty(),
        }
    }
}

/// One entry of a [`Resources`] bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource name (`cpus`, `mem`, `disk`, `gpus`, `ports`, ...).
    pub name: String,
    /// Quantity.
    pub value: Value,
    /// Reservation role; `None` means unreserved.
    pub role: Option<String>,
    /// Persistent volume annotation; only meaningful on reserved `disk`.
    pub volume: Option<Volume>,
}

impl Resource {
    /// Create an unreserved scalar resource.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: Value::Scalar(value),
            role: None,
            volume: None,
        }
    }

    /// Create an unreserved range resource.
    pub fn ranges(name: impl Into<String>, ranges: Vec<(u64, u64)>) -> Self {
        Self {
            name: name.into(),
            value: Value::Ranges(normalize_ranges(ranges)),
            role: None,
            volume: None,
        }
    }

    /// Tag this resource as reserved for `role`.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Attach a persistent volume annotation.
    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.volume = Some(volume);
        self
    }

    /// True if the entry carries no quantity.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    fn key(&self) -> (&str, Option<&str>, Option<&Volume>) {
        (self.name.as_str(), self.role.as_deref(), self.volume.as_ref())
    }

    fn sort_key(&self) -> (String, Option<String>, Option<Volume>) {
        (self.name.clone(), self.role.clone(), self.volume.clone())
    }
}

/// A canonical bag of resources.
///
/// Always normalized: entries with the same `(name, role, volume)` key are
/// merged, empty entries pruned, and the entry order is deterministic.
///
/// # Examples
///
/// ```rust
/// use flotilla_model::resources::Resources;
///
/// let total = Resources::cpus(4.0) + Resources::mem(8192.0);
/// let used = Resources::cpus(1.0) + Resources::mem(2048.0);
///
/// assert!(total.contains(&used));
/// let free = total.checked_sub(&used).unwrap();
/// assert_eq!(free.scalar("cpus"), 3.0);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources(Vec<Resource>);

impl Resources {
    /// The empty bag.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build a canonical bag from arbitrary entries.
    pub fn from_entries(entries: Vec<Resource>) -> Self {
        let mut out = Self(Vec::new());
        for entry in entries {
            out.push(entry);
        }
        out
    }

    /// Convenience: an unreserved `cpus` scalar.
    pub fn cpus(value: f64) -> Self {
        Self::from_entries(vec![Resource::scalar(CPUS, value)])
    }

    /// Convenience: an unreserved `mem` scalar (MB).
    pub fn mem(value: f64) -> Self {
        Self::from_entries(vec![Resource::scalar(MEM, value)])
    }

    /// Convenience: an unreserved `disk` scalar (MB).
    pub fn disk(value: f64) -> Self {
        Self::from_entries(vec![Resource::scalar(DISK, value)])
    }

    /// Convenience: an unreserved `ports` range set.
    pub fn ports(ranges: Vec<(u64, u64)>) -> Self {
        Self::from_entries(vec![Resource::ranges(PORTS, ranges)])
    }

    /// True if the bag holds no quantity.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the canonical entries.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter()
    }

    /// Total scalar quantity for `name`, summed across reservations.
    ///
    /// Returns 0.0 for range kinds and unknown names.
    pub fn scalar(&self, name: &str) -> f64 {
        self.0
            .iter()
            .filter(|r| r.name == name)
            .map(|r| match &r.value {
                Value::Scalar(v) => *v,
                Value::Ranges(_) => 0.0,
            })
            .sum()
    }

    /// All entries reserved for `role`.
    pub fn reserved(&self, role: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|r| r.role.as_deref() == Some(role))
                .cloned()
                .collect(),
        )
    }

    /// All unreserved entries.
    pub fn unreserved(&self) -> Self {
        Self(self.0.iter().filter(|r| r.role.is_none()).cloned().collect())
    }

    /// All entries carrying a persistent volume annotation.
    pub fn volumes(&self) -> Self {
        Self(self.0.iter().filter(|r| r.volume.is_some()).cloned().collect())
    }

    /// The same quantities with reservation and volume annotations removed.
    pub fn as_unreserved(&self) -> Self {
        Self::from_entries(
            self.0
                .iter()
                .map(|r| Resource {
                    name: r.name.clone(),
                    value: r.value.clone(),
                    role: None,
                    volume: None,
                })
                .collect(),
        )
    }

    /// The same quantities with volume annotations removed, reservations kept.
    pub fn without_volumes(&self) -> Self {
        Self::from_entries(
            self.0
                .iter()
                .map(|r| Resource {
                    name: r.name.clone(),
                    value: r.value.clone(),
                    role: r.role.clone(),
                    volume: None,
                })
                .collect(),
        )
    }

    /// True if `other` fits entirely inside `self`, key by key.
    pub fn contains(&self, other: &Resources) -> bool {
        other.0.iter().all(|needed| {
            self.0.iter().any(|have| {
                have.key() == needed.key()
                    && match (&have.value, &needed.value) {
                        (Value::Scalar(h), Value::Scalar(n)) => *h + SCALAR_EPSILON >= *n,
                        (Value::Ranges(h), Value::Ranges(n)) => ranges_contain(h, n),
                        _ => false,
                    }
            })
        })
    }

    /// Subtract `other` from `self`, erroring on underflow.
    pub fn checked_sub(&self, other: &Resources) -> Result<Resources, ResourceError> {
        let mut entries = self.0.clone();
        for needed in &other.0 {
            let have = entries
                .iter_mut()
                .find(|r| r.key() == needed.key())
                .ok_or_else(|| ResourceError::Insufficient {
                    name: needed.name.clone(),
                })?;
            match (&mut have.value, &needed.value) {
                (Value::Scalar(h), Value::Scalar(n)) => {
                    if *h + SCALAR_EPSILON < *n {
                        return Err(ResourceError::Insufficient {
                            name: needed.name.clone(),
                        });
                    }
                    *h -= *n;
                }
                (Value::Ranges(h), Value::Ranges(n)) => {
                    if !ranges_contain(h, n) {
                        return Err(ResourceError::Insufficient {
                            name: needed.name.clone(),
                        });
                    }
                    *h = ranges_subtract(h, n);
                }
                _ => {
                    return Err(ResourceError::KindMismatch {
                        name: needed.name.clone(),
                    })
                }
            }
        }
        entries.retain(|r| !r.is_empty());
        entries.sort_by_key(Resource::sort_key);
        Ok(Self(entries))
    }

    fn push(&mut self, entry: Resource) {
        if entry.is_empty() {
            return;
        }
        let entry = match self.0.iter().position(|r| r.key() == entry.key()) {
            Some(i) => match Self::merge_entry(&mut self.0[i], entry) {
                Some(unmerged) => unmerged,
                None => {
                    self.0.sort_by_key(Resource::sort_key);
                    return;
                }
            },
            None => entry,
        };
        self.0.push(entry);
        self.0.sort_by_key(Resource::sort_key);
    }

    /// Merge `entry` into `slot` when the kinds agree; hand it back otherwise.
    ///
    /// Mixed kinds under one name never merge; the unmerged entry stays
    /// separate so the mismatch remains visible to contains/checked_sub.
    fn merge_entry(slot: &mut Resource, entry: Resource) -> Option<Resource> {
        match (&mut slot.value, entry.value) {
            (Value::Scalar(h), Value::Scalar(n)) => {
                *h += n;
                None
            }
            (Value::Ranges(h), Value::Ranges(n)) => {
                let mut merged = h.clone();
                merged.extend(n);
                *h = normalize_ranges(merged);
                None
            }
            (_, value) => Some(Resource {
                name: entry.name,
                value,
                role: entry.role,
                volume: entry.volume,
            }),
        }
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, rhs: Resources) -> Resources {
        for entry in rhs.0 {
            self.push(entry);
        }
        self
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        for entry in rhs.0 {
            self.push(entry);
        }
    }
}

impl Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        let mut first = true;
        for r in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            match &r.value {
                Value::Scalar(v) => write!(f, "{}:{v}", r.name)?,
                Value::Ranges(ranges) => {
                    write!(f, "{}:[", r.name)?;
                    for (i, (lo, hi)) in ranges.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{lo}-{hi}")?;
                    }
                    write!(f, "]")?;
                }
            }
            if let Some(role) = &r.role {
                write!(f, "({role})")?;
            }
            if let Some(volume) = &r.volume {
                write!(f, "[{}]", volume.id)?;
            }
        }
        Ok(())
    }
}

/// Sort and coalesce overlapping or adjacent ranges.
fn normalize_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.retain(|(lo, hi)| lo <= hi);
    ranges.sort_unstable();
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (lo, hi) in ranges {
        match out.last_mut() {
            Some((_, prev_hi)) if lo <= prev_hi.saturating_add(1) => {
                *prev_hi = (*prev_hi).max(hi);
            }
            _ => out.push((lo, hi)),
        }
    }
    out
}

/// True if every range of `needed` lies inside some range of `have`.
///
/// Both inputs are normalized.
fn ranges_contain(have: &[(u64, u64)], needed: &[(u64, u64)]) -> bool {
    needed
        .iter()
        .all(|(nlo, nhi)| have.iter().any(|(hlo, hhi)| hlo <= nlo && nhi <= hhi))
}

/// Set difference `have \ remove`. Assumes containment was checked.
fn ranges_subtract(have: &[(u64, u64)], remove: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut out = Vec::with_capacity(have.len() + remove.len());
    for &(hlo, hhi) in have {
        let mut cursor = hlo;
        let mut exhausted = false;
        for &(rlo, rhi) in remove {
            if rhi < cursor || rlo > hhi {
                continue;
            }
            if rlo > cursor {
                out.push((cursor, rlo - 1));
            }
            if rhi >= hhi {
                exhausted = true;
                break;
            }
            cursor = rhi + 1;
        }
        if !exhausted && cursor <= hhi {
            out.push((cursor, hhi));
        }
    }
    normalize_ranges(out)
}
