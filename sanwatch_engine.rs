//! # SanWatch Engine - Storage Array Metrics Core
//!
//! A storage-array performance metric collection, hierarchy tracking, and
//! cache reconciliation engine written in pure Rust. This is the data plane
//! that powers the SanWatch monitoring platform.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           SANWATCH RUST ENGINE                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  MAINTAINER SOURCE → RANGE RECONCILER → AGGREGATION → CACHE STORE            │
//! │                           │                                                  │
//! │  ENTITY TREE STORE ───────┴── PRECACHE SCHEDULER (worker pool)               │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Closure-Table Hierarchy**: ancestor/descendant queries as a single join
//! - **Incremental Caching**: minimal re-fetch windows against the maintainer
//! - **Derived Aggregations**: sum, average, percentile, top-k/bottom-k
//! - **Bounded Parallelism**: per-system precache jobs on a fixed worker pool
//!
//! ## Author
//!
//! SanWatch Team - Built with 🔥 and Rust

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// This section contains all external crate imports organized by functionality.
// We import everything we need upfront for clarity and compile-time optimization.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(unused_variables)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;
use smallvec::{smallvec, SmallVec};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};

// ----------------------------------------------------------------------------
// Relational Store
// ----------------------------------------------------------------------------
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

// ----------------------------------------------------------------------------
// Pattern Matching & Configuration
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use once_cell::sync::Lazy;
use regex::Regex;

// ----------------------------------------------------------------------------
// HTTP Client, CLI & Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the engine.
// These are carefully tuned for the cache geometry of the maintainer source.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "sanwatch-engine";
pub const ENGINE_FULL_NAME: &str = "SanWatch Storage Metrics Engine";

// ----------------------------------------------------------------------------
// Cache Key Geometry
// ----------------------------------------------------------------------------

/// Separator between the system, metric, map and filter parts of a cache key
pub const CACHE_KEY_SEPARATOR: char = ';';

/// Placeholder rendered into a cache key for an absent map/filter token.
/// Part of the persisted key format; never change without a cache flush.
pub const CACHE_KEY_EMPTY_TOKEN: &str = "undefined";

// ----------------------------------------------------------------------------
// Precache Windows & Chunking
// ----------------------------------------------------------------------------

/// Default refresh window reaching back from the start of the current day (days)
pub const DEFAULT_PRECACHE_WINDOW_DAYS: i64 = 30;

/// Slice width used when a metric definition is fetched in chunks (days)
pub const PRECACHE_CHUNK_DAYS: i64 = 7;

/// Minutes per precache chunk slice
pub const PRECACHE_CHUNK_MINUTES: i64 = PRECACHE_CHUNK_DAYS * 24 * 60;

// ----------------------------------------------------------------------------
// Worker Pool & Concurrency
// ----------------------------------------------------------------------------

/// Default number of precache workers (0 = auto-detect based on CPU cores)
pub const DEFAULT_MAX_PARALLEL: usize = 0;

/// Minimum precache workers
pub const MIN_PRECACHE_WORKERS: usize = 1;

/// Maximum precache workers
pub const MAX_PRECACHE_WORKERS: usize = 64;

/// Capacity of the source update broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default timeout for maintainer HTTP requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Timeout for the maintainer reachability probe (seconds)
pub const HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;

// ----------------------------------------------------------------------------
// Relational Store
// ----------------------------------------------------------------------------

/// Default path of the engine database file
pub const DEFAULT_DATABASE_PATH: &str = "sanwatch.db";

/// SQLite busy timeout (milliseconds)
pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;

// ----------------------------------------------------------------------------
// Time Base
// ----------------------------------------------------------------------------

/// Milliseconds per minute-epoch tick - the wire unit of the maintainer
pub const MINUTE_MILLIS: i64 = 60_000;

/// Seconds per minute-epoch tick
pub const MINUTE_SECS: i64 = 60;

// ----------------------------------------------------------------------------
// Hierarchy Defaults
// ----------------------------------------------------------------------------

/// Datacenter a component path is rooted under when none is given explicitly
pub const DEFAULT_DATACENTER: &str = "CZ_Chodov";

/// Number of CPUs, used for auto-sizing the worker pool
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The fundamental data types flowing through the engine:
// - Minute-epoch timestamps and half-open time ranges
// - The typed storage hierarchy vocabulary
// - Aggregation map/filter tokens and cache keys
// - Variant matrices (the raw shape of maintainer data)
// - The precache metric catalog
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 MinuteStamp - Minute-Epoch Time Handling
// ----------------------------------------------------------------------------

/// Timestamp in whole minutes since the Unix epoch.
///
/// The maintainer serializes every data range boundary and every matrix row
/// in this unit; keeping it as a newtype prevents accidental mixing with
/// second- or millisecond-epoch values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct MinuteStamp(i64);

impl MinuteStamp {
    /// Create a stamp from minutes since the Unix epoch
    #[inline]
    pub const fn from_minutes(minutes: i64) -> Self {
        Self(minutes)
    }

    /// Create a stamp from milliseconds since the Unix epoch, rounding to
    /// the nearest minute
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self((millis + MINUTE_MILLIS / 2).div_euclid(MINUTE_MILLIS))
    }

    /// Minutes since the Unix epoch
    #[inline]
    pub const fn as_minutes(&self) -> i64 {
        self.0
    }

    /// Seconds since the Unix epoch
    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 * MINUTE_SECS
    }

    /// Milliseconds since the Unix epoch
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 * MINUTE_MILLIS
    }

    /// The current wall-clock time, truncated to the minute
    #[inline]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Add a number of minutes
    #[inline]
    pub const fn add_minutes(&self, minutes: i64) -> Self {
        Self(self.0 + minutes)
    }

    /// Whole minutes between two stamps (saturating at zero)
    #[inline]
    pub const fn minutes_since(&self, earlier: MinuteStamp) -> i64 {
        self.0 - earlier.0
    }

    /// Convert to chrono `DateTime<Utc>`
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.as_secs(), 0).unwrap_or_default()
    }

    /// Create from chrono `DateTime<Utc>`
    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp().div_euclid(MINUTE_SECS))
    }

    /// Minimum representable stamp
    pub const MIN: MinuteStamp = MinuteStamp(i64::MIN);

    /// Maximum representable stamp
    pub const MAX: MinuteStamp = MinuteStamp(i64::MAX);
}

impl Display for MinuteStamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M UTC"))
    }
}

impl From<i64> for MinuteStamp {
    #[inline]
    fn from(minutes: i64) -> Self {
        Self(minutes)
    }
}

impl From<MinuteStamp> for i64 {
    #[inline]
    fn from(ts: MinuteStamp) -> Self {
        ts.0
    }
}

impl From<DateTime<Utc>> for MinuteStamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

// ----------------------------------------------------------------------------
// 3.2 TimeRange - Half-Open Minute Windows
// ----------------------------------------------------------------------------

/// A half-open time window `[from, to)` in minute-epoch units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start
    pub from: MinuteStamp,
    /// Exclusive end
    pub to: MinuteStamp,
}

impl TimeRange {
    /// Create a new range; `to` before `from` is normalized to the empty
    /// range at `from`.
    #[inline]
    pub fn new(from: MinuteStamp, to: MinuteStamp) -> Self {
        if to < from {
            Self { from, to: from }
        } else {
            Self { from, to }
        }
    }

    /// Range from raw minute-epoch boundaries
    #[inline]
    pub fn from_minutes(from: i64, to: i64) -> Self {
        Self::new(MinuteStamp::from_minutes(from), MinuteStamp::from_minutes(to))
    }

    /// An empty range positioned at `at`
    #[inline]
    pub const fn empty_at(at: MinuteStamp) -> Self {
        Self { from: at, to: at }
    }

    /// True when the range covers no minutes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    /// Width of the range in minutes
    #[inline]
    pub fn minutes(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.to.minutes_since(self.from)
        }
    }

    /// True when the stamp falls inside `[from, to)`
    #[inline]
    pub fn contains(&self, ts: MinuteStamp) -> bool {
        ts >= self.from && ts < self.to
    }

    /// True when this range fully contains `other`
    #[inline]
    pub fn covers(&self, other: TimeRange) -> bool {
        self.from <= other.from && self.to >= other.to
    }

    /// True when the two ranges share at least one minute
    #[inline]
    pub fn overlaps(&self, other: TimeRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.from < other.to && other.from < self.to
    }

    /// Smallest range containing both inputs. Empty inputs are ignored.
    pub fn union(&self, other: TimeRange) -> TimeRange {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return *self;
        }
        TimeRange {
            from: self.from.min(other.from),
            to: self.to.max(other.to),
        }
    }

    /// Intersection of the two ranges (possibly empty)
    pub fn clamp_to(&self, bounds: TimeRange) -> TimeRange {
        TimeRange::new(self.from.max(bounds.from), self.to.min(bounds.to))
    }

    /// Split into consecutive slices of at most `minutes` width, in order.
    pub fn split_minutes(&self, minutes: i64) -> Vec<TimeRange> {
        if self.is_empty() || minutes <= 0 {
            return Vec::new();
        }
        let mut slices = Vec::new();
        let mut cursor = self.from;
        while cursor < self.to {
            let end = cursor.add_minutes(minutes).min(self.to);
            slices.push(TimeRange { from: cursor, to: end });
            cursor = end;
        }
        slices
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from.as_minutes(), self.to.as_minutes())
    }
}

// ----------------------------------------------------------------------------
// 3.3 Hierarchy Vocabulary - Entity Ids, Types & Status
// ----------------------------------------------------------------------------

/// Opaque identifier of a storage entity (the node table row id).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct EntityId(pub i64);

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a node in the storage hierarchy.
///
/// The numeric discriminants are the persisted column values and must stay
/// stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageEntityType {
    Datacenter = 1,
    System = 2,
    Dkc = 3,
    Controller = 4,
    ChannelBoard = 5,
    PortGroup = 6,
    Pool = 7,
    ParityGroup = 8,
    HostGroup = 9,
    AdapterGroup = 10,
}

impl StorageEntityType {
    /// All known entity types, in persisted-discriminant order
    pub const ALL: [StorageEntityType; 10] = [
        StorageEntityType::Datacenter,
        StorageEntityType::System,
        StorageEntityType::Dkc,
        StorageEntityType::Controller,
        StorageEntityType::ChannelBoard,
        StorageEntityType::PortGroup,
        StorageEntityType::Pool,
        StorageEntityType::ParityGroup,
        StorageEntityType::HostGroup,
        StorageEntityType::AdapterGroup,
    ];

    /// Persisted column value
    #[inline]
    pub const fn as_db(&self) -> i64 {
        *self as i64
    }

    /// Parse the persisted column value
    pub fn from_db(value: i64) -> Result<Self, TreeError> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_db() == value)
            .ok_or(TreeError::UnknownType { value })
    }

    /// The one type a node of this type may have as its parent.
    /// `None` marks the hierarchy root.
    pub const fn parent_type(&self) -> Option<StorageEntityType> {
        match self {
            StorageEntityType::Datacenter => None,
            StorageEntityType::System => Some(StorageEntityType::Datacenter),
            StorageEntityType::Dkc => Some(StorageEntityType::System),
            StorageEntityType::Controller => Some(StorageEntityType::Dkc),
            StorageEntityType::ChannelBoard => Some(StorageEntityType::Controller),
            StorageEntityType::PortGroup => Some(StorageEntityType::AdapterGroup),
            StorageEntityType::Pool => Some(StorageEntityType::System),
            StorageEntityType::ParityGroup => Some(StorageEntityType::Pool),
            StorageEntityType::HostGroup => Some(StorageEntityType::System),
            StorageEntityType::AdapterGroup => Some(StorageEntityType::System),
        }
    }

    /// True when `parent` is an acceptable parent type for this node type
    #[inline]
    pub fn accepts_parent(&self, parent: StorageEntityType) -> bool {
        matches!(self.parent_type(), Some(p) if p == parent)
    }

    /// Chain of types descending from `self` (exclusive) to `leaf`
    /// (inclusive), following the fixed parent/child compatibility table.
    /// `None` when `leaf` is not reachable below `self`.
    pub fn chain_to(&self, leaf: StorageEntityType) -> Option<Vec<StorageEntityType>> {
        let mut chain = Vec::new();
        let mut cursor = leaf;
        while cursor != *self {
            chain.push(cursor);
            cursor = cursor.parent_type()?;
        }
        chain.reverse();
        Some(chain)
    }

    /// Types whose duplicates are rejected globally (by name + type) rather
    /// than per parent.
    pub const GLOBALLY_UNIQUE: [StorageEntityType; 3] = [
        StorageEntityType::Datacenter,
        StorageEntityType::System,
        StorageEntityType::Pool,
    ];
}

impl Display for StorageEntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageEntityType::Datacenter => "DATACENTER",
            StorageEntityType::System => "SYSTEM",
            StorageEntityType::Dkc => "DKC",
            StorageEntityType::Controller => "CONTROLLER",
            StorageEntityType::ChannelBoard => "CHANNEL_BOARD",
            StorageEntityType::PortGroup => "PORT_GROUP",
            StorageEntityType::Pool => "POOL",
            StorageEntityType::ParityGroup => "PARITY_GROUP",
            StorageEntityType::HostGroup => "HOST_GROUP",
            StorageEntityType::AdapterGroup => "ADAPTER_GROUP",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for StorageEntityType {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DATACENTER" => Ok(StorageEntityType::Datacenter),
            "SYSTEM" => Ok(StorageEntityType::System),
            "DKC" => Ok(StorageEntityType::Dkc),
            "CONTROLLER" => Ok(StorageEntityType::Controller),
            "CHANNEL_BOARD" => Ok(StorageEntityType::ChannelBoard),
            "PORT_GROUP" => Ok(StorageEntityType::PortGroup),
            "POOL" => Ok(StorageEntityType::Pool),
            "PARITY_GROUP" => Ok(StorageEntityType::ParityGroup),
            "HOST_GROUP" => Ok(StorageEntityType::HostGroup),
            "ADAPTER_GROUP" => Ok(StorageEntityType::AdapterGroup),
            _ => Err(TreeError::UnknownTypeName { name: s.to_string() }),
        }
    }
}

/// Operational status of a storage entity.
///
/// INACTIVE propagates down a subtree through `cascade_status` but is never
/// required on descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageEntityStatus {
    Active = 1,
    Inactive = 2,
}

impl StorageEntityStatus {
    /// Persisted column value
    #[inline]
    pub const fn as_db(&self) -> i64 {
        *self as i64
    }

    /// Parse the persisted column value
    pub fn from_db(value: i64) -> Result<Self, TreeError> {
        match value {
            1 => Ok(StorageEntityStatus::Active),
            2 => Ok(StorageEntityStatus::Inactive),
            _ => Err(TreeError::UnknownStatus { value }),
        }
    }
}

impl Display for StorageEntityStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StorageEntityStatus::Active => write!(f, "ACTIVE"),
            StorageEntityStatus::Inactive => write!(f, "INACTIVE"),
        }
    }
}

impl FromStr for StorageEntityStatus {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(StorageEntityStatus::Active),
            "INACTIVE" => Ok(StorageEntityStatus::Inactive),
            _ => Err(TreeError::UnknownStatusName { name: s.to_string() }),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Storage Entities, Details & Paths
// ----------------------------------------------------------------------------

/// Auxiliary detail record attached to a hierarchy node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDetail {
    /// Hardware model
    pub model: Option<String>,
    /// Physical room/location
    pub room: Option<String>,
    /// Management console URL
    pub management_url: Option<String>,
}

impl EntityDetail {
    /// True when no field carries a value
    pub fn is_blank(&self) -> bool {
        self.model.is_none() && self.room.is_none() && self.management_url.is_none()
    }
}

/// A node in the storage hierarchy.
///
/// `children` is populated per query, never eagerly for the whole tree; the
/// parent is a weak back-reference by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEntity {
    /// Node id
    pub id: EntityId,
    /// Display name, unique within the scope its type dictates
    pub name: CompactString,
    /// Node type
    pub entity_type: StorageEntityType,
    /// Operational status
    pub status: StorageEntityStatus,
    /// Hardware serial number, when known
    pub serial_number: Option<String>,
    /// Parent node id; `None` only for datacenter roots
    pub parent_id: Option<EntityId>,
    /// Child nodes loaded by the current query
    #[serde(default)]
    pub children: Vec<StorageEntity>,
    /// Attached detail record, when loaded
    #[serde(default)]
    pub detail: Option<EntityDetail>,
}

impl StorageEntity {
    /// Total number of nodes in this loaded subtree, including self
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(StorageEntity::node_count).sum::<usize>()
    }

    /// Depth-first iterator-free visitor over the loaded subtree
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a StorageEntity)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }
}

/// One step of a hierarchy path: a (name, type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    pub name: CompactString,
    pub entity_type: StorageEntityType,
}

impl PathSegment {
    pub fn new(name: impl Into<CompactString>, entity_type: StorageEntityType) -> Self {
        Self { name: name.into(), entity_type }
    }
}

impl Display for PathSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.name)
    }
}

/// Build the canonical path for a component addressed the way collector
/// feeds do: system name, optional sub-component, optional sub-sub-component.
///
/// Grouped component types (port groups, parity groups) sit one level below
/// their grouping parent, so a three-part address inserts the parent segment
/// between the system and the leaf.
pub fn component_path(
    datacenter: &str,
    system: &str,
    sub_component: Option<&str>,
    sub_sub_component: Option<&str>,
    leaf_type: StorageEntityType,
) -> Vec<PathSegment> {
    let mut path = vec![
        PathSegment::new(datacenter, StorageEntityType::Datacenter),
        PathSegment::new(system, StorageEntityType::System),
    ];

    match (sub_component, sub_sub_component, leaf_type.parent_type()) {
        (Some(group), Some(leaf), Some(group_type))
            if group_type != StorageEntityType::System =>
        {
            path.push(PathSegment::new(group, group_type));
            path.push(PathSegment::new(leaf, leaf_type));
        }
        (Some(leaf), _, _) => {
            path.push(PathSegment::new(leaf, leaf_type));
        }
        (None, _, _) => {
            // System-level address: the system segment is the leaf
            path.pop();
            path.push(PathSegment::new(system, leaf_type));
        }
    }

    path
}

// ----------------------------------------------------------------------------
// 3.5 Aggregation Tokens
// ----------------------------------------------------------------------------

static PERC_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^perc-(\d+(?:\.\d+)?)$").expect("static regex"));

static RANK_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(top|bot)-(\d+)$").expect("static regex"));

/// A map token: reduces all variant columns of a row to a single synthetic
/// value. Parsed from `sum`, `avg`, or `perc-<float>`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MapToken {
    Sum,
    Average,
    /// Percentile with `p` in `[0, 1]`
    Percentile(f64),
}

impl MapToken {
    /// Parse a map token from its query form
    pub fn parse(token: &str) -> Result<Self, CacheError> {
        match token {
            "sum" => Ok(MapToken::Sum),
            "avg" => Ok(MapToken::Average),
            _ => {
                if let Some(caps) = PERC_TOKEN_RE.captures(token) {
                    let p: f64 = caps[1].parse().map_err(|_| CacheError::InvalidToken {
                        token: token.to_string(),
                    })?;
                    Ok(MapToken::Percentile(p))
                } else {
                    Err(CacheError::InvalidToken { token: token.to_string() })
                }
            }
        }
    }

    /// True for the tokens whose reduction the maintainer can perform
    /// server-side
    #[inline]
    pub fn is_delegable(&self) -> bool {
        matches!(self, MapToken::Sum | MapToken::Average)
    }
}

impl Display for MapToken {
    /// Canonical query form; used as the synthetic variant name of a mapped
    /// series.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MapToken::Sum => write!(f, "sum"),
            MapToken::Average => write!(f, "avg"),
            MapToken::Percentile(p) => write!(f, "perc-{}", p),
        }
    }
}

/// A filter token: keeps a ranked subset of the variant columns.
/// Parsed from `top-<int>` or `bot-<int>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterToken {
    /// Keep the k variants with the largest value sums
    Top(usize),
    /// Keep the k variants with the smallest value sums
    Bottom(usize),
}

impl FilterToken {
    /// Parse a filter token from its query form
    pub fn parse(token: &str) -> Result<Self, CacheError> {
        let caps = RANK_TOKEN_RE
            .captures(token)
            .ok_or_else(|| CacheError::InvalidToken { token: token.to_string() })?;
        let count: usize = caps[2].parse().map_err(|_| CacheError::InvalidToken {
            token: token.to_string(),
        })?;
        match &caps[1] {
            "top" => Ok(FilterToken::Top(count)),
            _ => Ok(FilterToken::Bottom(count)),
        }
    }

    /// Number of variant columns the filter keeps
    #[inline]
    pub fn count(&self) -> usize {
        match self {
            FilterToken::Top(k) | FilterToken::Bottom(k) => *k,
        }
    }
}

impl Display for FilterToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FilterToken::Top(k) => write!(f, "top-{}", k),
            FilterToken::Bottom(k) => write!(f, "bot-{}", k),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.6 Cache Keys
// ----------------------------------------------------------------------------

/// The identity of one cached metric series.
///
/// Renders as `<system>;<metric>;<map|undefined>;<filter|undefined>`. The
/// literal `undefined` placeholder keeps distinct `(map, filter)`
/// combinations collision-free, including the "neither" case, and is part of
/// the persisted format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub system: CompactString,
    pub metric: CompactString,
    pub map: Option<CompactString>,
    pub filter: Option<CompactString>,
}

impl CacheKey {
    pub fn new(
        system: impl Into<CompactString>,
        metric: impl Into<CompactString>,
        map: Option<&str>,
        filter: Option<&str>,
    ) -> Self {
        Self {
            system: system.into(),
            metric: metric.into(),
            map: map.map(CompactString::from),
            filter: filter.map(CompactString::from),
        }
    }

    /// The persisted string form of this key
    pub fn render(&self) -> String {
        let map = self.map.as_deref().unwrap_or(CACHE_KEY_EMPTY_TOKEN);
        let filter = self.filter.as_deref().unwrap_or(CACHE_KEY_EMPTY_TOKEN);
        format!(
            "{sys}{sep}{metric}{sep}{map}{sep}{filter}",
            sys = self.system,
            metric = self.metric,
            map = map,
            filter = filter,
            sep = CACHE_KEY_SEPARATOR,
        )
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

// ----------------------------------------------------------------------------
// 3.7 Variant Matrices
// ----------------------------------------------------------------------------

/// Values of one matrix row, positionally aligned with the owning matrix's
/// variant list.
pub type RowValues = SmallVec<[f64; 4]>;

/// One timestamped row of variant values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub stamp: MinuteStamp,
    pub values: RowValues,
}

impl MetricRow {
    pub fn new(stamp: MinuteStamp, values: impl Into<RowValues>) -> Self {
        Self { stamp, values: values.into() }
    }
}

/// A block of raw or transformed metric data: named variant columns, the
/// physical unit, and timestamp-ordered rows aligned to the columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantMatrix {
    /// Ordered column names
    pub variants: Vec<String>,
    /// Physical unit of every value
    pub units: String,
    /// Rows in ascending stamp order
    pub data: Vec<MetricRow>,
}

impl VariantMatrix {
    /// An empty matrix with the given columns and unit
    pub fn empty(variants: Vec<String>, units: impl Into<String>) -> Self {
        Self { variants, units: units.into(), data: Vec::new() }
    }

    /// Number of variant columns
    #[inline]
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Drop rows outside `range`, preserving order
    pub fn retain_range(&mut self, range: TimeRange) {
        self.data.retain(|row| range.contains(row.stamp));
    }

    /// Keep only rows whose stamp advances by at least `resolution_secs`
    /// over the previously kept row.
    pub fn downsample(&mut self, resolution_secs: i64) {
        if resolution_secs <= 0 {
            return;
        }
        let mut last_kept: Option<i64> = None;
        self.data.retain(|row| {
            let secs = row.stamp.as_secs();
            match last_kept {
                Some(prev) if secs - prev < resolution_secs => false,
                _ => {
                    last_kept = Some(secs);
                    true
                }
            }
        });
    }
}

// ----------------------------------------------------------------------------
// 3.8 Precache Metric Catalog
// ----------------------------------------------------------------------------

/// One entry of the fixed precache catalog: a metric plus the derived series
/// (map/filter), an optional down-sampling resolution, and whether the fetch
/// window is processed in week-sized chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDefinition {
    /// Maintainer dataset name
    pub metric: &'static str,
    /// Map token applied before caching
    pub map: Option<&'static str>,
    /// Filter token applied before caching
    pub filter: Option<&'static str>,
    /// Minimum seconds between kept rows
    pub resolution_secs: Option<i64>,
    /// Fetch the refresh window in 7-day slices
    pub chunked: bool,
}

impl MetricDefinition {
    pub const fn new(metric: &'static str) -> Self {
        Self { metric, map: None, filter: None, resolution_secs: None, chunked: false }
    }

    pub const fn with_map(mut self, token: &'static str) -> Self {
        self.map = Some(token);
        self
    }

    pub const fn with_filter(mut self, token: &'static str) -> Self {
        self.filter = Some(token);
        self
    }

    pub const fn with_resolution(mut self, secs: i64) -> Self {
        self.resolution_secs = Some(secs);
        self
    }

    pub const fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    /// Cache key of this definition for one system
    pub fn cache_key(&self, system: &str) -> CacheKey {
        CacheKey::new(system, self.metric, self.map, self.filter)
    }
}

/// The ordered catalog of metric series refreshed by the precache scheduler.
/// Definitions are processed strictly in this order for every system.
pub const PRECACHE_CATALOG: &[MetricDefinition] = &[
    MetricDefinition::new("HG_Rnd_Read_IOPS").with_map("sum"),
    MetricDefinition::new("HG_Rnd_Write_IOPS").with_map("sum"),
    MetricDefinition::new("HG_Seq_Write_IOPS").with_map("sum"),
    MetricDefinition::new("HG_Seq_Read_IOPS").with_map("sum"),
    MetricDefinition::new("HG_Read_TransRate").with_map("sum"),
    MetricDefinition::new("HG_Write_TransRate").with_map("sum"),
    MetricDefinition::new("HG_C2D_Trans").with_map("sum"),
    MetricDefinition::new("HG_D2CR_Trans").with_map("sum"),
    MetricDefinition::new("HG_D2CS_Trans").with_map("sum"),
    MetricDefinition::new("LDEV_Read_BlockSize").with_map("avg"),
    MetricDefinition::new("LDEV_Read_Hit").with_map("avg"),
    MetricDefinition::new("LDEV_Read_Response").with_map("avg").chunked(),
    MetricDefinition::new("LDEV_Write_BlockSize").with_map("avg"),
    MetricDefinition::new("LDEV_Write_Hit").with_map("avg"),
    MetricDefinition::new("LDEV_Write_Response").with_map("avg").chunked(),
    MetricDefinition::new("PHY_Short_MP").with_resolution(300),
    MetricDefinition::new("PHY_Short_MP").with_map("avg"),
    MetricDefinition::new("PHY_Short_PG"),
    MetricDefinition::new("PHY_Short_PG").with_map("avg"),
    MetricDefinition::new("PHY_Short_Write_Pending_Rate_Each_of_MPU"),
    MetricDefinition::new("PHY_Short_Write_Pending_Rate_Each_of_MPU").with_map("avg"),
    MetricDefinition::new("HG_TransRate").with_map("sum"),
    MetricDefinition::new("HG_TransRate").with_filter("top-10"),
    MetricDefinition::new("HG_IOPS").with_map("sum"),
    MetricDefinition::new("HG_IOPS").with_filter("top-10"),
    MetricDefinition::new("HG_Read_IOPS").with_map("sum"),
    MetricDefinition::new("HG_Write_IOPS").with_map("sum"),
    MetricDefinition::new("HG_Read_Response").with_filter("top-10"),
    MetricDefinition::new("HG_Write_Response").with_filter("top-10"),
    MetricDefinition::new("CHB_KBPS"),
    MetricDefinition::new("PHY_Short_HIE_ISW").with_resolution(300),
    MetricDefinition::new("PHY_Short_MPU_HIE"),
    MetricDefinition::new("PHY_Short_Write_Pending_Rate"),
];

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Comprehensive error types for every subsystem in the engine.
// Designed for:
// - Clear error categorization (not-found / conflict / bad-input /
//   upstream-unavailable / unrecoverable)
// - Easy error propagation with context
// - Per-subsystem recovery decisions in the precache loop
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the SanWatch engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum EngineError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Hierarchy Errors ----
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    // ---- Cache Errors ----
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    // ---- External Source Errors ----
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias used across the engine
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Check if this error is recoverable within the current pass
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Config(_) => false,
            EngineError::Tree(e) => e.is_recoverable(),
            EngineError::Cache(e) => e.is_recoverable(),
            EngineError::Source(e) => e.is_recoverable(),
            EngineError::Io(_) => true,
            EngineError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Tree(e) => e.category(),
            EngineError::Cache(e) => e.category(),
            EngineError::Source(e) => e.category(),
            EngineError::Io(_) => "io",
            EngineError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Hierarchy Errors
// ----------------------------------------------------------------------------

/// Errors raised by the entity tree store.
///
/// Tree mutation failures surface synchronously to the caller and abort only
/// the operation that raised them.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Storage entity {entity_type} with name '{name}' was not found")]
    NotFoundByName { entity_type: StorageEntityType, name: String },

    #[error("Storage entity (id: {id}) was not found")]
    NotFoundById { id: EntityId },

    #[error("Storage entity (id: {id}) not found or is INACTIVE")]
    NotFoundOrInactive { id: EntityId },

    #[error("Datacenter '{name}' was not found")]
    DatacenterNotFound { name: String },

    #[error("Storage entity '{entity_type}' with name '{name}' already exists")]
    AlreadyExists { entity_type: StorageEntityType, name: String },

    #[error("Parent entity (id: {id}) was not found")]
    ParentNotFound { id: EntityId },

    #[error("A {entity_type} requires a parent entity")]
    MissingParent { entity_type: StorageEntityType },

    #[error("A {child} cannot be placed under a {parent}")]
    IncompatibleParent { child: StorageEntityType, parent: StorageEntityType },

    #[error("Entity (id: {id}) cannot be moved below its own subtree")]
    MoveIntoSubtree { id: EntityId },

    #[error("Path is empty or does not start at a datacenter")]
    InvalidPathRoot,

    #[error("No hierarchy level of type {leaf} exists below {root}")]
    UnreachableLevel { root: StorageEntityType, leaf: StorageEntityType },

    #[error("Unknown entity type value: {value}")]
    UnknownType { value: i64 },

    #[error("Unknown entity type name: '{name}'")]
    UnknownTypeName { name: String },

    #[error("Unknown entity status value: {value}")]
    UnknownStatus { value: i64 },

    #[error("Unknown entity status name: '{name}'")]
    UnknownStatusName { name: String },

    #[error("Storage backend failure: {0}")]
    Backend(#[from] rusqlite::Error),
}

impl TreeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TreeError::Backend(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            TreeError::NotFoundByName { .. }
            | TreeError::NotFoundById { .. }
            | TreeError::NotFoundOrInactive { .. }
            | TreeError::DatacenterNotFound { .. } => "not_found",
            TreeError::AlreadyExists { .. } => "conflict",
            TreeError::ParentNotFound { .. }
            | TreeError::MissingParent { .. }
            | TreeError::IncompatibleParent { .. }
            | TreeError::MoveIntoSubtree { .. }
            | TreeError::InvalidPathRoot
            | TreeError::UnreachableLevel { .. }
            | TreeError::UnknownType { .. }
            | TreeError::UnknownTypeName { .. }
            | TreeError::UnknownStatus { .. }
            | TreeError::UnknownStatusName { .. } => "bad_input",
            TreeError::Backend(_) => "unrecoverable",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 External Source Errors
// ----------------------------------------------------------------------------

/// Errors raised while talking to the maintainer source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("System '{system}' doesn't exist or is not handled by a maintainer")]
    UnhandledSystem { system: String },

    #[error("Maintainer for '{system}' is unavailable: {message}")]
    Unavailable { system: String, message: String },

    #[error("Maintainer for '{system}' has no data for metric '{metric}' yet")]
    NotReady { system: String, metric: String },

    #[error("Maintainer request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid maintainer response for '{context}': {message}")]
    InvalidResponse { context: String, message: String },

    #[error("Pool '{pool}' is not known to system '{system}'")]
    UnknownPool { system: String, pool: String },

    #[error("Unknown variant selector mode '{mode}'")]
    UnknownSelectorMode { mode: String },
}

impl SourceError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SourceError::Unavailable { .. }
            | SourceError::NotReady { .. }
            | SourceError::Transport(_) => true,
            _ => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            SourceError::UnhandledSystem { .. } | SourceError::UnknownPool { .. } => "not_found",
            SourceError::Unavailable { .. }
            | SourceError::NotReady { .. }
            | SourceError::Transport(_) => "upstream_unavailable",
            SourceError::InvalidResponse { .. } => "unrecoverable",
            SourceError::UnknownSelectorMode { .. } => "bad_input",
        }
    }

    pub fn invalid_response(context: impl Into<String>, message: impl Into<String>) -> Self {
        SourceError::InvalidResponse { context: context.into(), message: message.into() }
    }
}

/// Convenience alias for source-facing calls
pub type SourceResult<T> = Result<T, SourceError>;

// ----------------------------------------------------------------------------
// 4.4 Cache Errors
// ----------------------------------------------------------------------------

/// Errors raised by the cache store and the aggregation pipeline.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid map/filter token: '{token}'")]
    InvalidToken { token: String },

    #[error("Cache entry '{key}' was not found")]
    EntryNotFound { key: String },

    #[error("Transform failed for '{key}': {message}")]
    TransformFailed { key: String, message: String },

    #[error("Storage backend failure: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("Row serialization failed: {0}")]
    RowCodec(#[from] serde_json::Error),
}

impl CacheError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::Backend(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            CacheError::InvalidToken { .. } => "bad_input",
            CacheError::EntryNotFound { .. } => "not_found",
            CacheError::TransformFailed { .. }
            | CacheError::Backend(_)
            | CacheError::RowCodec(_) => "unrecoverable",
        }
    }
}

/// Convenience alias for cache-facing calls
pub type CacheResult<T> = Result<T, CacheError>;

// ----------------------------------------------------------------------------
// 4.5 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue { field: field.into(), message: message.into() }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Comprehensive configuration management with:
// - TOML file parsing
// - Environment variable overrides (SANWATCH_ prefix)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the entire SanWatch engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Relational store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Maintainer source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Precache scheduler configuration
    #[serde(default)]
    pub precache: PrecacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: GeneralConfig::default(),
            storage: StorageConfig::default(),
            source: SourceConfig::default(),
            precache: PrecacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SANWATCH_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.precache.max_parallel > MAX_PRECACHE_WORKERS {
            return Err(ConfigError::InvalidValue {
                field: "precache.max_parallel".into(),
                message: format!("Worker count cannot exceed {}", MAX_PRECACHE_WORKERS),
            });
        }

        if self.precache.window_days <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "precache.window_days".into(),
                message: "Refresh window must cover at least one day".into(),
            });
        }

        for (system, url) in &self.source.systems {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("source.systems.{}", system),
                    message: "Maintainer URL must not be empty".into(),
                });
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Get effective precache worker count (auto-detect if 0)
    pub fn effective_worker_count(&self) -> usize {
        let configured = if self.precache.max_parallel == 0 {
            num_cpus()
        } else {
            self.precache.max_parallel
        };
        configured.clamp(MIN_PRECACHE_WORKERS, MAX_PRECACHE_WORKERS)
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Datacenter component paths are rooted under by default
    #[serde(default = "default_datacenter")]
    pub default_datacenter: String,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Environment name (prod, staging, dev)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            default_datacenter: default_datacenter(),
            debug: false,
            environment: default_environment(),
        }
    }
}

fn default_instance_name() -> String {
    "sanwatch-engine".into()
}

fn default_datacenter() -> String {
    DEFAULT_DATACENTER.into()
}

fn default_environment() -> String {
    "production".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Relational Store Configuration
// ----------------------------------------------------------------------------

/// Relational store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Busy timeout in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_busy_timeout() -> u64 {
    DB_BUSY_TIMEOUT_MS
}

// ----------------------------------------------------------------------------
// 5.4 Maintainer Source Configuration
// ----------------------------------------------------------------------------

/// Maintainer source settings: which systems are handled, and where their
/// maintainers live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// System name -> maintainer base URL
    #[serde(default)]
    pub systems: BTreeMap<String, String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub request_timeout_secs: u64,

    /// Reachability probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            systems: BTreeMap::new(),
            request_timeout_secs: default_http_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_probe_timeout() -> u64 {
    HEALTH_PROBE_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// 5.5 Precache Scheduler Configuration
// ----------------------------------------------------------------------------

/// Precache scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecacheConfig {
    /// Enable the background precache passes
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum systems refreshed in parallel (0 = CPU count)
    #[serde(default)]
    pub max_parallel: usize,

    /// Refresh window reaching back from the start of the current day (days)
    #[serde(default = "default_window_days")]
    pub window_days: i64,

    /// Override of the refresh window anchor, as an RFC 3339 date.
    /// Intended for debugging against replayed maintainer data.
    #[serde(default)]
    pub anchor_date: Option<String>,
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel: DEFAULT_MAX_PARALLEL,
            window_days: default_window_days(),
            anchor_date: None,
        }
    }
}

fn default_window_days() -> i64 {
    DEFAULT_PRECACHE_WINDOW_DAYS
}

impl PrecacheConfig {
    /// Start of the refresh window: the configured anchor day (or today),
    /// truncated to midnight, minus the window width.
    pub fn window_start(&self) -> MinuteStamp {
        let anchor: DateTime<Utc> = self
            .anchor_date
            .as_deref()
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        let midnight = anchor
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();
        MinuteStamp::from_datetime(midnight - ChronoDuration::days(self.window_days))
    }
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source file/line in output
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with multiple output formats, driven by LoggingConfig
// and the usual RUST_LOG-style environment filter.
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            // Pretty format (default)
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_ids(false)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "sanwatch::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: PHASE 1 TESTS
// ============================================================================

#[cfg(test)]
mod phase1_tests {
    use super::*;

    #[test]
    fn test_minute_stamp_conversions() {
        let ts = MinuteStamp::from_minutes(29_000_000);
        assert_eq!(ts.as_secs(), 29_000_000 * 60);
        assert_eq!(MinuteStamp::from_millis(ts.as_millis()), ts);

        let dt = ts.to_datetime();
        assert_eq!(MinuteStamp::from_datetime(dt), ts);
    }

    #[test]
    fn test_time_range_basics() {
        let range = TimeRange::from_minutes(10, 20);
        assert!(!range.is_empty());
        assert_eq!(range.minutes(), 10);
        assert!(range.contains(MinuteStamp::from_minutes(10)));
        assert!(range.contains(MinuteStamp::from_minutes(19)));
        assert!(!range.contains(MinuteStamp::from_minutes(20)));

        // to < from normalizes to empty
        let inverted = TimeRange::from_minutes(20, 10);
        assert!(inverted.is_empty());
    }

    #[test]
    fn test_time_range_set_operations() {
        let a = TimeRange::from_minutes(10, 20);
        let b = TimeRange::from_minutes(15, 30);
        assert!(a.overlaps(b));
        assert_eq!(a.union(b), TimeRange::from_minutes(10, 30));
        assert_eq!(a.clamp_to(b), TimeRange::from_minutes(15, 20));

        let disjoint = TimeRange::from_minutes(40, 50);
        assert!(!a.overlaps(disjoint));
        assert!(a.union(TimeRange::empty_at(MinuteStamp::from_minutes(99))) == a);
    }

    #[test]
    fn test_time_range_split() {
        let range = TimeRange::from_minutes(0, 25);
        let slices = range.split_minutes(10);
        assert_eq!(
            slices,
            vec![
                TimeRange::from_minutes(0, 10),
                TimeRange::from_minutes(10, 20),
                TimeRange::from_minutes(20, 25),
            ]
        );
    }

    #[test]
    fn test_parent_compatibility_table() {
        use StorageEntityType::*;

        assert_eq!(Datacenter.parent_type(), None);
        assert_eq!(ParityGroup.parent_type(), Some(Pool));
        assert_eq!(PortGroup.parent_type(), Some(AdapterGroup));
        assert!(System.accepts_parent(Datacenter));
        assert!(!Pool.accepts_parent(Datacenter));

        // Round-trip of all persisted discriminants
        for t in StorageEntityType::ALL {
            assert_eq!(StorageEntityType::from_db(t.as_db()).unwrap(), t);
        }
        assert!(StorageEntityType::from_db(99).is_err());
    }

    #[test]
    fn test_type_chain_resolution() {
        use StorageEntityType::*;

        let chain = Datacenter.chain_to(ParityGroup).unwrap();
        assert_eq!(chain, vec![System, Pool, ParityGroup]);

        let chain = System.chain_to(PortGroup).unwrap();
        assert_eq!(chain, vec![AdapterGroup, PortGroup]);

        // A pool is not reachable below a DKC
        assert!(Dkc.chain_to(Pool).is_none());

        // Self chain is empty
        assert_eq!(System.chain_to(System).unwrap(), Vec::<StorageEntityType>::new());
    }

    #[test]
    fn test_type_and_status_parsing() {
        assert_eq!(
            "PARITY_GROUP".parse::<StorageEntityType>().unwrap(),
            StorageEntityType::ParityGroup
        );
        assert!("PARITYGROUP".parse::<StorageEntityType>().is_err());
        assert_eq!(
            "INACTIVE".parse::<StorageEntityStatus>().unwrap(),
            StorageEntityStatus::Inactive
        );
        assert!("DISABLED".parse::<StorageEntityStatus>().is_err());
    }

    #[test]
    fn test_component_path_shapes() {
        let path = component_path(
            "CZ_Chodov",
            "XP512",
            Some("Pool-01"),
            Some("PG-1-1"),
            StorageEntityType::ParityGroup,
        );
        assert_eq!(path.len(), 4);
        assert_eq!(path[2].entity_type, StorageEntityType::Pool);
        assert_eq!(path[3].name, "PG-1-1");

        let path = component_path(
            "CZ_Chodov",
            "XP512",
            Some("HG-app1"),
            None,
            StorageEntityType::HostGroup,
        );
        assert_eq!(path.len(), 3);
        assert_eq!(path[2].entity_type, StorageEntityType::HostGroup);

        let path =
            component_path("CZ_Chodov", "XP512", None, None, StorageEntityType::System);
        assert_eq!(path.len(), 2);
        assert_eq!(path[1].entity_type, StorageEntityType::System);
    }

    #[test]
    fn test_map_token_parsing() {
        assert_eq!(MapToken::parse("sum").unwrap(), MapToken::Sum);
        assert_eq!(MapToken::parse("avg").unwrap(), MapToken::Average);
        assert_eq!(MapToken::parse("perc-0.5").unwrap(), MapToken::Percentile(0.5));
        assert_eq!(MapToken::parse("perc-1").unwrap(), MapToken::Percentile(1.0));
        assert!(MapToken::parse("median").is_err());
        assert!(MapToken::parse("perc-").is_err());
    }

    #[test]
    fn test_filter_token_parsing() {
        assert_eq!(FilterToken::parse("top-10").unwrap(), FilterToken::Top(10));
        assert_eq!(FilterToken::parse("bot-3").unwrap(), FilterToken::Bottom(3));
        assert!(FilterToken::parse("top-").is_err());
        assert!(FilterToken::parse("best-5").is_err());
    }

    #[test]
    fn test_cache_key_rendering() {
        let key = CacheKey::new("XP512", "HG_IOPS", Some("sum"), None);
        assert_eq!(key.render(), "XP512;HG_IOPS;sum;undefined");

        let bare = CacheKey::new("XP512", "HG_IOPS", None, None);
        assert_eq!(bare.render(), "XP512;HG_IOPS;undefined;undefined");

        let filtered = CacheKey::new("XP512", "HG_IOPS", None, Some("top-10"));
        assert_eq!(filtered.render(), "XP512;HG_IOPS;undefined;top-10");

        // Distinct combinations never collide
        let keys: AHashSet<String> =
            [&key, &bare, &filtered].iter().map(|k| k.render()).collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_matrix_downsampling() {
        let mut matrix = VariantMatrix {
            variants: vec!["a".into()],
            units: "IOPS".into(),
            data: (0..10)
                .map(|i| MetricRow::new(MinuteStamp::from_minutes(i), smallvec![i as f64]))
                .collect(),
        };
        // 300 seconds = 5 minutes: keep one row per 5-minute step
        matrix.downsample(300);
        let stamps: Vec<i64> = matrix.data.iter().map(|r| r.stamp.as_minutes()).collect();
        assert_eq!(stamps, vec![0, 5]);
    }

    #[test]
    fn test_catalog_is_ordered_and_well_formed() {
        assert!(!PRECACHE_CATALOG.is_empty());
        for def in PRECACHE_CATALOG {
            if let Some(map) = def.map {
                MapToken::parse(map).expect("catalog map token parses");
            }
            if let Some(filter) = def.filter {
                FilterToken::parse(filter).expect("catalog filter token parses");
            }
        }
        // First definitions are host-group reductions, kept in catalog order
        assert_eq!(PRECACHE_CATALOG[0].metric, "HG_Rnd_Read_IOPS");
        assert_eq!(PRECACHE_CATALOG[0].map, Some("sum"));
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.precache.window_days, DEFAULT_PRECACHE_WINDOW_DAYS);
        assert!(config.precache.enabled);
        assert!(config.source.systems.is_empty());
        assert!(config.effective_worker_count() >= MIN_PRECACHE_WORKERS);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.precache.window_days = 0;
        assert!(config.validate().is_err());

        let toml_str = r#"
            [precache]
            window_days = 14
            max_parallel = 4

            [source.systems]
            XP512 = "http://maintainer-xp512:8080/"
        "#;
        let parsed = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(parsed.precache.window_days, 14);
        assert_eq!(parsed.effective_worker_count(), 4);
        assert_eq!(
            parsed.source.systems.get("XP512").map(String::as_str),
            Some("http://maintainer-xp512:8080/")
        );
    }

    #[test]
    fn test_window_start_anchoring() {
        let config = PrecacheConfig {
            enabled: true,
            max_parallel: 0,
            window_days: 30,
            anchor_date: Some("2024-03-31T12:34:00Z".into()),
        };
        let start = config.window_start();
        let expected = "2024-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(start, MinuteStamp::from_datetime(expected));
    }

    #[test]
    fn test_error_categories() {
        let not_found: EngineError = TreeError::NotFoundById { id: EntityId(7) }.into();
        assert_eq!(not_found.category(), "not_found");

        let conflict: EngineError = TreeError::AlreadyExists {
            entity_type: StorageEntityType::System,
            name: "XP512".into(),
        }
        .into();
        assert_eq!(conflict.category(), "conflict");

        let bad_input: EngineError =
            CacheError::InvalidToken { token: "median".into() }.into();
        assert_eq!(bad_input.category(), "bad_input");

        let upstream: EngineError = SourceError::Unavailable {
            system: "XP512".into(),
            message: "connection refused".into(),
        }
        .into();
        assert_eq!(upstream.category(), "upstream_unavailable");
        assert!(upstream.is_recoverable());
    }
}

// ============================================================================
// SECTION 8: RELATIONAL STORE
// ============================================================================
// Thin handle over the engine's SQLite database:
// - One write connection shared behind a mutex; WAL journal, busy timeout
// - Idempotent schema creation at open
// - The node table, its transitive-closure table, the per-type metric
//   tables, and the cache entry/row tables all live here
// ============================================================================

/// SQLite schema version of the engine store
const SCHEMA_VERSION: i64 = 1;

/// All statements creating the engine schema. Every statement is idempotent
/// so a partially initialized database can be reopened safely.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS store_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS storage_entities (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT    NOT NULL,
    id_type         INTEGER NOT NULL,
    id_status       INTEGER NOT NULL DEFAULT 1,
    serial_number   TEXT,
    id_parent       INTEGER REFERENCES storage_entities (id)
);

CREATE INDEX IF NOT EXISTS idx_storage_entities_parent
    ON storage_entities (id_parent);

CREATE INDEX IF NOT EXISTS idx_storage_entities_name_type
    ON storage_entities (name, id_type);

CREATE TABLE IF NOT EXISTS storage_entities_closure (
    id_ancestor     INTEGER NOT NULL,
    id_descendant   INTEGER NOT NULL,
    PRIMARY KEY (id_ancestor, id_descendant)
);

CREATE INDEX IF NOT EXISTS idx_closure_descendant
    ON storage_entities_closure (id_descendant);

CREATE TABLE IF NOT EXISTS storage_entity_details (
    id_storage_entity INTEGER PRIMARY KEY REFERENCES storage_entities (id),
    model             TEXT,
    room              TEXT,
    management_url    TEXT
);

CREATE TABLE IF NOT EXISTS host_group_metrics (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    id_storage_entity INTEGER NOT NULL,
    metric_name       TEXT    NOT NULL,
    value             REAL    NOT NULL,
    date              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pool_metrics (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    id_storage_entity INTEGER NOT NULL,
    metric_name       TEXT    NOT NULL,
    value             REAL    NOT NULL,
    date              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS parity_group_metrics (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    id_storage_entity INTEGER NOT NULL,
    metric_name       TEXT    NOT NULL,
    value             REAL    NOT NULL,
    date              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cha_metrics (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    id_storage_entity INTEGER NOT NULL,
    metric_name       TEXT    NOT NULL,
    value             REAL    NOT NULL,
    date              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS port_metrics (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    id_storage_entity INTEGER NOT NULL,
    metric_name       TEXT    NOT NULL,
    value             REAL    NOT NULL,
    date              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS system_metrics (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    id_storage_entity INTEGER NOT NULL,
    metric_name       TEXT    NOT NULL,
    value             REAL    NOT NULL,
    date              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS block_size_latency (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    id_storage_entity INTEGER NOT NULL,
    metric_name       TEXT    NOT NULL,
    value             REAL    NOT NULL,
    date              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS externals (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    id_storage_entity INTEGER NOT NULL,
    external_type     INTEGER NOT NULL,
    value             TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    key        TEXT PRIMARY KEY,
    range_from INTEGER NOT NULL,
    range_to   INTEGER NOT NULL,
    units      TEXT    NOT NULL,
    variants   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_rows (
    entry_key TEXT    NOT NULL REFERENCES cache_entries (key) ON DELETE CASCADE,
    stamp     INTEGER NOT NULL,
    vals      TEXT    NOT NULL,
    PRIMARY KEY (entry_key, stamp)
);
"#;

/// Metric tables scrubbed when an entity is deleted, in scrub order.
/// Keep aligned with the schema above.
pub const ENTITY_METRIC_TABLES: &[&str] = &[
    "block_size_latency",
    "externals",
    "host_group_metrics",
    "parity_group_metrics",
    "cha_metrics",
    "pool_metrics",
    "port_metrics",
    "system_metrics",
];

/// Shared handle to the engine database.
///
/// All mutations funnel through the single connection, which also serializes
/// structural tree rewrites (relocate, delete) against each other.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the engine database at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u64) -> Result<Self, EngineError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| EngineError::Internal(format!("Failed to open database: {}", e)))?;
        Self::bootstrap(conn, busy_timeout_ms)
    }

    /// Open a private in-memory database (used by tests and dry runs).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Internal(format!("Failed to open database: {}", e)))?;
        Self::bootstrap(conn, DB_BUSY_TIMEOUT_MS)
    }

    fn bootstrap(conn: Connection, busy_timeout_ms: u64) -> Result<Self, EngineError> {
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .map_err(|e| EngineError::Internal(format!("Failed to set busy timeout: {}", e)))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| EngineError::Internal(format!("Failed to enable FKs: {}", e)))?;

        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| EngineError::Internal(format!("Failed to create schema: {}", e)))?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
            .optional()
            .map_err(|e| EngineError::Internal(format!("Failed to read schema version: {}", e)))?;
        match version {
            None => {
                conn.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                    .map_err(|e| {
                        EngineError::Internal(format!("Failed to stamp schema version: {}", e))
                    })?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                return Err(EngineError::Internal(format!(
                    "Unsupported database schema version {} (engine speaks {})",
                    v, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        debug!(target: "sanwatch::db", "Database ready");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a closure against the locked connection.
    pub fn with<T, E: From<rusqlite::Error>>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, E>,
    ) -> Result<T, E> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside a transaction. The transaction commits when the
    /// closure returns `Ok` and rolls back otherwise.
    pub fn with_tx<T, E: From<rusqlite::Error>>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(E::from)?;
        let result = f(&tx)?;
        tx.commit().map_err(E::from)?;
        Ok(result)
    }
}

/// Build an `IN (?, ?, ...)` placeholder list for `n` parameters.
fn sql_placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

// ============================================================================
// SECTION 9: ENTITY TREE STORE
// ============================================================================
// The closure-table access object owning the storage hierarchy:
// - Path-based find/create resolution
// - Ancestor/descendant queries as a single closure join
// - Cascading status changes
// - Subtree relocation with a transactional closure rewrite
// - Leaves-first subtree deletion including per-type metric scrubbing
//
// The node table (`storage_entities`, self-referential parent pointer) and
// the transitive closure (`storage_entities_closure`) are kept consistent by
// every structural mutation; reachability is always derived from the closure
// and never mutated independently.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Requests & Row Mapping
// ----------------------------------------------------------------------------

/// Request to create a single hierarchy node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntityRequest {
    pub name: CompactString,
    pub entity_type: StorageEntityType,
    /// Required for everything but datacenters
    pub parent_id: Option<EntityId>,
    pub serial_number: Option<String>,
}

/// Request to update mutable attributes of a node. `None` keeps the stored
/// value (COALESCE semantics).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateEntityRequest {
    pub name: Option<String>,
    pub serial_number: Option<String>,
    pub detail: Option<EntityDetail>,
}

/// Column list shared by every node query
const NODE_COLUMNS: &str = "id, name, id_type, id_status, serial_number, id_parent";

/// Raw node row before enum conversion
#[derive(Debug, Clone)]
struct NodeRow {
    id: i64,
    name: String,
    id_type: i64,
    id_status: i64,
    serial_number: Option<String>,
    id_parent: Option<i64>,
}

fn read_node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        name: row.get(1)?,
        id_type: row.get(2)?,
        id_status: row.get(3)?,
        serial_number: row.get(4)?,
        id_parent: row.get(5)?,
    })
}

impl NodeRow {
    fn into_entity(self) -> Result<StorageEntity, TreeError> {
        Ok(StorageEntity {
            id: EntityId(self.id),
            name: CompactString::from(self.name),
            entity_type: StorageEntityType::from_db(self.id_type)?,
            status: StorageEntityStatus::from_db(self.id_status)?,
            serial_number: self.serial_number,
            parent_id: self.id_parent.map(EntityId),
            children: Vec::new(),
            detail: None,
        })
    }
}

// ----------------------------------------------------------------------------
// 9.2 The Store
// ----------------------------------------------------------------------------

/// Closure-table access object for the storage hierarchy.
#[derive(Debug, Clone)]
pub struct EntityTreeStore {
    db: Database,
}

impl EntityTreeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ---- Lookup -----------------------------------------------------------

    /// Load one node (with its detail record) by id.
    pub fn get(&self, id: EntityId) -> Result<StorageEntity, TreeError> {
        self.db.with(|conn| {
            let mut entity =
                load_entity(conn, id)?.ok_or(TreeError::NotFoundById { id })?;
            attach_detail(conn, &mut entity)?;
            Ok(entity)
        })
    }

    /// Ids of every ancestor of `id`, including `id` itself.
    pub fn ancestors(&self, id: EntityId) -> Result<Vec<EntityId>, TreeError> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id_ancestor FROM storage_entities_closure \
                 WHERE id_descendant = ?1 ORDER BY id_ancestor",
            )?;
            let ids = stmt
                .query_map(params![id.0], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids.into_iter().map(EntityId).collect())
        })
    }

    /// Ids of every descendant of `id`, including `id` itself.
    pub fn descendant_ids(&self, id: EntityId) -> Result<Vec<EntityId>, TreeError> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id_descendant FROM storage_entities_closure \
                 WHERE id_ancestor = ?1 ORDER BY id_descendant",
            )?;
            let ids = stmt
                .query_map(params![id.0], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids.into_iter().map(EntityId).collect())
        })
    }

    /// ACTIVE systems that already own at least one child component.
    pub fn available_systems(&self) -> Result<Vec<StorageEntity>, TreeError> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {cols} FROM storage_entities s \
                 WHERE s.id_type = ?1 AND s.id_status = ?2 \
                 AND EXISTS (SELECT 1 FROM storage_entities c WHERE c.id_parent = s.id) \
                 ORDER BY s.name",
                cols = NODE_COLUMNS,
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        StorageEntityType::System.as_db(),
                        StorageEntityStatus::Active.as_db()
                    ],
                    read_node_row,
                )?
                .collect::<rusqlite::Result<Vec<NodeRow>>>()?;
            rows.into_iter().map(NodeRow::into_entity).collect()
        })
    }

    // ---- Path Resolution --------------------------------------------------

    /// Walk a hierarchy path from a datacenter root downward.
    ///
    /// Each level matches a child by name and type under the current node.
    /// With `create_if_missing`, unmatched levels are created ACTIVE under
    /// the current node; without it they fail with `NotFound`. An unresolved
    /// datacenter root fails with `NotFound` regardless of the flag.
    pub fn resolve_path(
        &self,
        path: &[PathSegment],
        create_if_missing: bool,
    ) -> Result<StorageEntity, TreeError> {
        self.db.with_tx(|conn| {
            let (root_seg, rest) = path.split_first().ok_or(TreeError::InvalidPathRoot)?;
            if root_seg.entity_type != StorageEntityType::Datacenter {
                return Err(TreeError::InvalidPathRoot);
            }

            let mut current = find_child(conn, None, &root_seg.name, root_seg.entity_type)?
                .ok_or_else(|| TreeError::DatacenterNotFound {
                    name: root_seg.name.to_string(),
                })?;

            for segment in rest {
                match find_child(conn, Some(current.id), &segment.name, segment.entity_type)? {
                    Some(child) => current = child,
                    None if create_if_missing => {
                        if !segment.entity_type.accepts_parent(current.entity_type) {
                            return Err(TreeError::IncompatibleParent {
                                child: segment.entity_type,
                                parent: current.entity_type,
                            });
                        }
                        current = insert_node(
                            conn,
                            &segment.name,
                            segment.entity_type,
                            StorageEntityStatus::Active,
                            None,
                            Some(current.id),
                        )?;
                        debug!(
                            target: "sanwatch::tree",
                            id = current.id.0,
                            entity = %segment,
                            "Created hierarchy node"
                        );
                    }
                    None => {
                        return Err(TreeError::NotFoundByName {
                            entity_type: segment.entity_type,
                            name: segment.name.to_string(),
                        })
                    }
                }
            }

            Ok(current)
        })
    }

    // ---- Creation & Update ------------------------------------------------

    /// Create a single node with duplicity checking.
    ///
    /// Datacenters, systems and pools are unique by name+type across the
    /// whole tree; every other type is unique by name+type under its parent.
    pub fn create(&self, request: &CreateEntityRequest) -> Result<StorageEntity, TreeError> {
        self.db.with_tx(|conn| {
            let parent = if request.entity_type == StorageEntityType::Datacenter {
                None
            } else {
                let parent_id = request.parent_id.ok_or(TreeError::MissingParent {
                    entity_type: request.entity_type,
                })?;
                let parent = load_entity(conn, parent_id)?
                    .ok_or(TreeError::ParentNotFound { id: parent_id })?;
                if !request.entity_type.accepts_parent(parent.entity_type) {
                    return Err(TreeError::IncompatibleParent {
                        child: request.entity_type,
                        parent: parent.entity_type,
                    });
                }
                Some(parent)
            };

            let duplicate = if StorageEntityType::GLOBALLY_UNIQUE.contains(&request.entity_type)
            {
                exists_by_name_type(conn, &request.name, request.entity_type, None)?
            } else {
                exists_by_name_type(
                    conn,
                    &request.name,
                    request.entity_type,
                    parent.as_ref().map(|p| p.id),
                )?
            };
            if duplicate {
                return Err(TreeError::AlreadyExists {
                    entity_type: request.entity_type,
                    name: request.name.to_string(),
                });
            }

            insert_node(
                conn,
                &request.name,
                request.entity_type,
                StorageEntityStatus::Active,
                request.serial_number.as_deref(),
                parent.map(|p| p.id),
            )
        })
    }

    /// Update name/serial/detail of a node, keeping stored values where the
    /// request is silent.
    pub fn update(
        &self,
        id: EntityId,
        request: &UpdateEntityRequest,
    ) -> Result<StorageEntity, TreeError> {
        self.db.with_tx(|conn| {
            if load_entity(conn, id)?.is_none() {
                return Err(TreeError::NotFoundById { id });
            }

            conn.execute(
                "UPDATE storage_entities SET \
                 name = COALESCE(?1, name), \
                 serial_number = COALESCE(?2, serial_number) \
                 WHERE id = ?3",
                params![request.name, request.serial_number, id.0],
            )?;

            if let Some(detail) = &request.detail {
                conn.execute(
                    "INSERT INTO storage_entity_details \
                     (id_storage_entity, model, room, management_url) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT (id_storage_entity) DO UPDATE SET \
                     model = COALESCE(excluded.model, model), \
                     room = COALESCE(excluded.room, room), \
                     management_url = COALESCE(excluded.management_url, management_url)",
                    params![id.0, detail.model, detail.room, detail.management_url],
                )?;
            }

            let mut entity = load_entity(conn, id)?.ok_or(TreeError::NotFoundById { id })?;
            attach_detail(conn, &mut entity)?;
            Ok(entity)
        })
    }

    // ---- Hierarchy Queries ------------------------------------------------

    /// Load the subtree rooted at `id`, restricted to the fixed type chain
    /// leading to `leaf_type`, one level join per hop. The status filter
    /// applies at the leaf level; detail records are attached to every
    /// returned node. Descent stops once the leaf type is reached.
    pub fn descendants_of(
        &self,
        id: EntityId,
        leaf_type: StorageEntityType,
        statuses: &[StorageEntityStatus],
    ) -> Result<StorageEntity, TreeError> {
        self.db.with(|conn| {
            let mut root = load_entity(conn, id)?.ok_or(TreeError::NotFoundById { id })?;
            attach_detail(conn, &mut root)?;

            let chain = root.entity_type.chain_to(leaf_type).ok_or(
                TreeError::UnreachableLevel { root: root.entity_type, leaf: leaf_type },
            )?;
            if chain.is_empty() {
                return Ok(root);
            }

            let mut levels: Vec<Vec<StorageEntity>> = Vec::with_capacity(chain.len());
            let mut frontier: Vec<EntityId> = vec![root.id];
            for (depth, level_type) in chain.iter().enumerate() {
                let is_leaf = depth + 1 == chain.len();
                let mut nodes = children_of_type(conn, &frontier, *level_type)?;
                if is_leaf && !statuses.is_empty() {
                    nodes.retain(|n| statuses.contains(&n.status));
                }
                for node in &mut nodes {
                    attach_detail(conn, node)?;
                }
                frontier = nodes.iter().map(|n| n.id).collect();
                levels.push(nodes);
            }

            // Stitch the flat levels back into a tree, deepest first
            while levels.len() > 1 {
                let children = levels.pop().expect("len checked");
                let parents = levels.last_mut().expect("len checked");
                let mut by_parent: AHashMap<EntityId, Vec<StorageEntity>> = AHashMap::new();
                for child in children {
                    if let Some(pid) = child.parent_id {
                        by_parent.entry(pid).or_default().push(child);
                    }
                }
                for parent in parents.iter_mut() {
                    if let Some(kids) = by_parent.remove(&parent.id) {
                        parent.children = kids;
                    }
                }
            }
            root.children = levels.pop().unwrap_or_default();
            Ok(root)
        })
    }

    /// Apply `status` to the node and every descendant, depth-first with
    /// children persisted before their parent, and return the updated
    /// subtree.
    pub fn cascade_status(
        &self,
        id: EntityId,
        status: StorageEntityStatus,
    ) -> Result<StorageEntity, TreeError> {
        self.db.with_tx(|conn| {
            let mut tree = descendants_tree(conn, id)?;
            apply_status_depth_first(conn, &mut tree, status)?;
            info!(
                target: "sanwatch::tree",
                id = id.0,
                status = %status,
                nodes = tree.node_count(),
                "Cascaded status change"
            );
            Ok(tree)
        })
    }

    // ---- Structural Mutations ---------------------------------------------

    /// Reassign the parent of a node, rewriting the transitive closure:
    /// every link pairing the node's subtree with its old proper ancestors
    /// is removed, then each ancestor of the new parent (inclusive) is
    /// paired with each descendant of the node (inclusive).
    pub fn relocate(
        &self,
        id: EntityId,
        new_parent_id: EntityId,
    ) -> Result<StorageEntity, TreeError> {
        self.db.with_tx(|conn| {
            let entity = load_entity(conn, id)?
                .filter(|e| e.status == StorageEntityStatus::Active)
                .ok_or(TreeError::NotFoundOrInactive { id })?;
            let parent = load_entity(conn, new_parent_id)?
                .filter(|e| e.status == StorageEntityStatus::Active)
                .ok_or(TreeError::NotFoundOrInactive { id: new_parent_id })?;

            if !entity.entity_type.accepts_parent(parent.entity_type) {
                return Err(TreeError::IncompatibleParent {
                    child: entity.entity_type,
                    parent: parent.entity_type,
                });
            }

            let into_subtree: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM storage_entities_closure \
                 WHERE id_ancestor = ?1 AND id_descendant = ?2)",
                params![id.0, new_parent_id.0],
                |row| row.get(0),
            )?;
            if into_subtree {
                return Err(TreeError::MoveIntoSubtree { id });
            }

            // Unlink the subtree from the old proper ancestors
            conn.execute(
                "DELETE FROM storage_entities_closure \
                 WHERE id_descendant IN (SELECT id_descendant \
                                         FROM storage_entities_closure \
                                         WHERE id_ancestor = ?1) \
                 AND id_ancestor IN (SELECT id_ancestor \
                                     FROM storage_entities_closure \
                                     WHERE id_descendant = ?1 \
                                     AND id_ancestor != id_descendant)",
                params![id.0],
            )?;

            // Link it under the new ancestry
            conn.execute(
                "INSERT OR IGNORE INTO storage_entities_closure (id_ancestor, id_descendant) \
                 SELECT supertree.id_ancestor, subtree.id_descendant \
                 FROM storage_entities_closure AS supertree \
                 CROSS JOIN storage_entities_closure AS subtree \
                 WHERE supertree.id_descendant = ?2 \
                 AND subtree.id_ancestor = ?1",
                params![id.0, new_parent_id.0],
            )?;

            conn.execute(
                "UPDATE storage_entities SET id_parent = ?1 WHERE id = ?2",
                params![new_parent_id.0, id.0],
            )?;

            info!(
                target: "sanwatch::tree",
                id = id.0,
                new_parent = new_parent_id.0,
                "Relocated subtree"
            );

            load_entity(conn, id)?.ok_or(TreeError::NotFoundById { id })
        })
    }

    /// Delete a subtree, leaves before parents. For every node the per-type
    /// metric rows, the detail record, the closure rows and finally the node
    /// itself are removed. Deliberately not one transaction across the
    /// metric-table deletions; every step is idempotent so an interrupted
    /// run can be retried.
    pub fn delete_subtree(&self, id: EntityId) -> Result<(), TreeError> {
        self.db.with(|conn| {
            if load_entity(conn, id)?.is_none() {
                return Err(TreeError::NotFoundById { id });
            }
            delete_subtree_inner(conn, id)?;
            info!(target: "sanwatch::tree", id = id.0, "Deleted subtree");
            Ok(())
        })
    }

    // ---- Metric Sample Feeds ----------------------------------------------

    /// Record one sample into a per-type metric table. The table must be one
    /// of `ENTITY_METRIC_TABLES` (the `externals` table has its own shape
    /// and feed).
    pub fn record_metric_sample(
        &self,
        table: &str,
        entity: EntityId,
        metric_name: &str,
        value: f64,
        date: MinuteStamp,
    ) -> Result<(), TreeError> {
        if !ENTITY_METRIC_TABLES.contains(&table) || table == "externals" {
            return Err(TreeError::Backend(rusqlite::Error::InvalidParameterName(
                table.to_string(),
            )));
        }
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (id_storage_entity, metric_name, value, date) \
                     VALUES (?1, ?2, ?3, ?4)",
                    table
                ),
                params![entity.0, metric_name, value, date.as_minutes()],
            )?;
            Ok(())
        })
    }

    /// Record one external reference attached to an entity.
    pub fn record_external(
        &self,
        entity: EntityId,
        external_type: i64,
        value: &str,
    ) -> Result<(), TreeError> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO externals (id_storage_entity, external_type, value) \
                 VALUES (?1, ?2, ?3)",
                params![entity.0, external_type, value],
            )?;
            Ok(())
        })
    }

    /// Count rows a metric table holds for an entity.
    pub fn metric_sample_count(&self, table: &str, entity: EntityId) -> Result<i64, TreeError> {
        self.db.with(|conn| {
            let count = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE id_storage_entity = ?1", table),
                params![entity.0],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

// ----------------------------------------------------------------------------
// 9.3 Connection-Level Helpers
// ----------------------------------------------------------------------------

fn load_entity(conn: &Connection, id: EntityId) -> Result<Option<StorageEntity>, TreeError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM storage_entities WHERE id = ?1", NODE_COLUMNS),
            params![id.0],
            read_node_row,
        )
        .optional()?;
    row.map(NodeRow::into_entity).transpose()
}

fn find_child(
    conn: &Connection,
    parent: Option<EntityId>,
    name: &str,
    entity_type: StorageEntityType,
) -> Result<Option<StorageEntity>, TreeError> {
    let row = match parent {
        Some(pid) => conn
            .query_row(
                &format!(
                    "SELECT {} FROM storage_entities \
                     WHERE name = ?1 AND id_type = ?2 AND id_parent = ?3",
                    NODE_COLUMNS
                ),
                params![name, entity_type.as_db(), pid.0],
                read_node_row,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!(
                    "SELECT {} FROM storage_entities \
                     WHERE name = ?1 AND id_type = ?2 AND id_parent IS NULL",
                    NODE_COLUMNS
                ),
                params![name, entity_type.as_db()],
                read_node_row,
            )
            .optional()?,
    };
    row.map(NodeRow::into_entity).transpose()
}

fn exists_by_name_type(
    conn: &Connection,
    name: &str,
    entity_type: StorageEntityType,
    parent: Option<EntityId>,
) -> Result<bool, TreeError> {
    let exists: bool = match parent {
        Some(pid) => conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM storage_entities \
             WHERE name = ?1 AND id_type = ?2 AND id_parent = ?3)",
            params![name, entity_type.as_db(), pid.0],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM storage_entities \
             WHERE name = ?1 AND id_type = ?2)",
            params![name, entity_type.as_db()],
            |row| row.get(0),
        )?,
    };
    Ok(exists)
}

/// Insert a node and its closure rows: the self-pair plus one row per
/// ancestor of the parent (inclusive).
fn insert_node(
    conn: &Connection,
    name: &str,
    entity_type: StorageEntityType,
    status: StorageEntityStatus,
    serial_number: Option<&str>,
    parent: Option<EntityId>,
) -> Result<StorageEntity, TreeError> {
    conn.execute(
        "INSERT INTO storage_entities (name, id_type, id_status, serial_number, id_parent) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            name,
            entity_type.as_db(),
            status.as_db(),
            serial_number,
            parent.map(|p| p.0)
        ],
    )?;
    let id = conn.last_insert_rowid();

    conn.execute(
        "INSERT OR IGNORE INTO storage_entities_closure (id_ancestor, id_descendant) \
         VALUES (?1, ?1)",
        params![id],
    )?;
    if let Some(pid) = parent {
        conn.execute(
            "INSERT OR IGNORE INTO storage_entities_closure (id_ancestor, id_descendant) \
             SELECT id_ancestor, ?1 FROM storage_entities_closure WHERE id_descendant = ?2",
            params![id, pid.0],
        )?;
    }

    load_entity(conn, EntityId(id))?.ok_or(TreeError::NotFoundById { id: EntityId(id) })
}

fn attach_detail(conn: &Connection, entity: &mut StorageEntity) -> Result<(), TreeError> {
    let detail = conn
        .query_row(
            "SELECT model, room, management_url FROM storage_entity_details \
             WHERE id_storage_entity = ?1",
            params![entity.id.0],
            |row| {
                Ok(EntityDetail {
                    model: row.get(0)?,
                    room: row.get(1)?,
                    management_url: row.get(2)?,
                })
            },
        )
        .optional()?;
    entity.detail = detail;
    Ok(())
}

/// Children of any node in `parents` having the given type, ordered by name.
fn children_of_type(
    conn: &Connection,
    parents: &[EntityId],
    entity_type: StorageEntityType,
) -> Result<Vec<StorageEntity>, TreeError> {
    if parents.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {cols} FROM storage_entities \
         WHERE id_parent IN ({ph}) AND id_type = ? ORDER BY name",
        cols = NODE_COLUMNS,
        ph = sql_placeholders(parents.len()),
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut bind: Vec<i64> = parents.iter().map(|p| p.0).collect();
    bind.push(entity_type.as_db());
    let rows = stmt
        .query_map(params_from_iter(bind.iter()), read_node_row)?
        .collect::<rusqlite::Result<Vec<NodeRow>>>()?;
    rows.into_iter().map(NodeRow::into_entity).collect()
}

/// Load the full subtree below `id` (no type restriction) as a nested tree.
fn descendants_tree(conn: &Connection, id: EntityId) -> Result<StorageEntity, TreeError> {
    let mut root = load_entity(conn, id)?.ok_or(TreeError::NotFoundById { id })?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {cols} FROM storage_entities e \
         JOIN storage_entities_closure c ON c.id_descendant = e.id \
         WHERE c.id_ancestor = ?1 AND e.id != ?1 \
         ORDER BY e.id",
        cols = "e.id, e.name, e.id_type, e.id_status, e.serial_number, e.id_parent",
    ))?;
    let rows = stmt
        .query_map(params![id.0], read_node_row)?
        .collect::<rusqlite::Result<Vec<NodeRow>>>()?;

    let mut by_parent: AHashMap<EntityId, Vec<StorageEntity>> = AHashMap::new();
    for row in rows {
        let entity = row.into_entity()?;
        if let Some(pid) = entity.parent_id {
            by_parent.entry(pid).or_default().push(entity);
        }
    }
    attach_children(&mut root, &mut by_parent);
    Ok(root)
}

fn attach_children(
    node: &mut StorageEntity,
    by_parent: &mut AHashMap<EntityId, Vec<StorageEntity>>,
) {
    if let Some(mut kids) = by_parent.remove(&node.id) {
        for kid in &mut kids {
            attach_children(kid, by_parent);
        }
        node.children = kids;
    }
}

/// Depth-first status application: children first, then the node itself,
/// each persisted individually.
fn apply_status_depth_first(
    conn: &Connection,
    node: &mut StorageEntity,
    status: StorageEntityStatus,
) -> Result<(), TreeError> {
    for child in &mut node.children {
        apply_status_depth_first(conn, child, status)?;
    }
    conn.execute(
        "UPDATE storage_entities SET id_status = ?1 WHERE id = ?2",
        params![status.as_db(), node.id.0],
    )?;
    node.status = status;
    Ok(())
}

fn delete_subtree_inner(conn: &Connection, id: EntityId) -> Result<(), TreeError> {
    let child_ids: Vec<i64> = {
        let mut stmt =
            conn.prepare("SELECT id FROM storage_entities WHERE id_parent = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![id.0], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        ids
    };
    for child in child_ids {
        delete_subtree_inner(conn, EntityId(child))?;
    }

    for table in ENTITY_METRIC_TABLES {
        conn.execute(
            &format!("DELETE FROM {} WHERE id_storage_entity = ?1", table),
            params![id.0],
        )?;
    }
    conn.execute(
        "DELETE FROM storage_entity_details WHERE id_storage_entity = ?1",
        params![id.0],
    )?;

    // By now the node is a leaf; this removes its self-pair and every
    // ancestor link pointing at it.
    conn.execute(
        "DELETE FROM storage_entities_closure \
         WHERE id_descendant IN (SELECT id_descendant \
                                 FROM storage_entities_closure \
                                 WHERE id_ancestor = ?1)",
        params![id.0],
    )?;
    conn.execute("DELETE FROM storage_entities WHERE id = ?1", params![id.0])?;
    Ok(())
}

// ============================================================================
// SECTION 10: PHASE 2 TESTS
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> EntityTreeStore {
        EntityTreeStore::new(Database::open_in_memory().expect("in-memory db"))
    }

    fn seg(name: &str, ty: StorageEntityType) -> PathSegment {
        PathSegment::new(name, ty)
    }

    fn seed_datacenter(store: &EntityTreeStore) -> StorageEntity {
        store
            .create(&CreateEntityRequest {
                name: "CZ_Chodov".into(),
                entity_type: StorageEntityType::Datacenter,
                parent_id: None,
                serial_number: None,
            })
            .expect("datacenter created")
    }

    fn pool_path(system: &str, pool: &str) -> Vec<PathSegment> {
        vec![
            seg("CZ_Chodov", StorageEntityType::Datacenter),
            seg(system, StorageEntityType::System),
            seg(pool, StorageEntityType::Pool),
        ]
    }

    #[test]
    fn test_resolve_path_creates_then_finds_idempotently() {
        let store = store();
        seed_datacenter(&store);

        let created = store.resolve_path(&pool_path("XP512", "Pool-01"), true).unwrap();
        assert_eq!(created.entity_type, StorageEntityType::Pool);
        assert_eq!(created.status, StorageEntityStatus::Active);

        // Second resolution without the create flag returns the same node
        let found = store.resolve_path(&pool_path("XP512", "Pool-01"), false).unwrap();
        assert_eq!(found.id, created.id);

        // And creating again does not duplicate
        let again = store.resolve_path(&pool_path("XP512", "Pool-01"), true).unwrap();
        assert_eq!(again.id, created.id);
    }

    #[test]
    fn test_resolve_path_missing_level_fails_without_create() {
        let store = store();
        seed_datacenter(&store);

        let err = store.resolve_path(&pool_path("XP512", "Pool-01"), false).unwrap_err();
        assert!(matches!(err, TreeError::NotFoundByName { .. }));
    }

    #[test]
    fn test_resolve_path_unknown_datacenter_fails_regardless_of_flag() {
        let store = store();
        seed_datacenter(&store);

        let path = vec![
            seg("US_Reno", StorageEntityType::Datacenter),
            seg("XP512", StorageEntityType::System),
        ];
        for create in [false, true] {
            let err = store.resolve_path(&path, create).unwrap_err();
            assert!(matches!(err, TreeError::DatacenterNotFound { .. }));
        }
    }

    #[test]
    fn test_resolve_path_rejects_incompatible_levels() {
        let store = store();
        seed_datacenter(&store);

        // A parity group directly under a system skips its pool level
        let path = vec![
            seg("CZ_Chodov", StorageEntityType::Datacenter),
            seg("XP512", StorageEntityType::System),
            seg("PG-1-1", StorageEntityType::ParityGroup),
        ];
        let err = store.resolve_path(&path, true).unwrap_err();
        assert!(matches!(err, TreeError::IncompatibleParent { .. }));
    }

    #[test]
    fn test_closure_rows_track_created_paths() {
        let store = store();
        seed_datacenter(&store);

        let pg = store
            .resolve_path(
                &vec![
                    seg("CZ_Chodov", StorageEntityType::Datacenter),
                    seg("XP512", StorageEntityType::System),
                    seg("Pool-01", StorageEntityType::Pool),
                    seg("PG-1-1", StorageEntityType::ParityGroup),
                ],
                true,
            )
            .unwrap();

        // Ancestors: datacenter, system, pool, self
        let ancestors = store.ancestors(pg.id).unwrap();
        assert_eq!(ancestors.len(), 4);
        assert!(ancestors.contains(&pg.id));

        let system = store.resolve_path(&pool_path("XP512", "Pool-01")[..2].to_vec(), false).unwrap();
        assert!(ancestors.contains(&system.id));
        assert!(store.descendant_ids(system.id).unwrap().contains(&pg.id));
    }

    #[test]
    fn test_create_duplicity_checks() {
        let store = store();
        let dc = seed_datacenter(&store);

        let system = store
            .create(&CreateEntityRequest {
                name: "XP512".into(),
                entity_type: StorageEntityType::System,
                parent_id: Some(dc.id),
                serial_number: Some("10025".into()),
            })
            .unwrap();

        // Systems are globally unique by name
        let err = store
            .create(&CreateEntityRequest {
                name: "XP512".into(),
                entity_type: StorageEntityType::System,
                parent_id: Some(dc.id),
                serial_number: None,
            })
            .unwrap_err();
        assert!(matches!(err, TreeError::AlreadyExists { .. }));

        // Host groups are unique per parent only
        for parent in [system.id] {
            store
                .create(&CreateEntityRequest {
                    name: "HG-app1".into(),
                    entity_type: StorageEntityType::HostGroup,
                    parent_id: Some(parent),
                    serial_number: None,
                })
                .unwrap();
        }
        let err = store
            .create(&CreateEntityRequest {
                name: "HG-app1".into(),
                entity_type: StorageEntityType::HostGroup,
                parent_id: Some(system.id),
                serial_number: None,
            })
            .unwrap_err();
        assert!(matches!(err, TreeError::AlreadyExists { .. }));

        // Missing parent relation
        let err = store
            .create(&CreateEntityRequest {
                name: "HG-app2".into(),
                entity_type: StorageEntityType::HostGroup,
                parent_id: None,
                serial_number: None,
            })
            .unwrap_err();
        assert!(matches!(err, TreeError::MissingParent { .. }));
    }

    #[test]
    fn test_update_keeps_silent_fields() {
        let store = store();
        let dc = seed_datacenter(&store);
        let system = store
            .create(&CreateEntityRequest {
                name: "XP512".into(),
                entity_type: StorageEntityType::System,
                parent_id: Some(dc.id),
                serial_number: Some("10025".into()),
            })
            .unwrap();

        let updated = store
            .update(
                system.id,
                &UpdateEntityRequest {
                    name: None,
                    serial_number: Some("20050".into()),
                    detail: Some(EntityDetail {
                        model: Some("XP512".into()),
                        room: None,
                        management_url: None,
                    }),
                },
            )
            .unwrap();

        assert_eq!(updated.name, "XP512");
        assert_eq!(updated.serial_number.as_deref(), Some("20050"));
        assert_eq!(
            updated.detail.as_ref().and_then(|d| d.model.as_deref()),
            Some("XP512")
        );

        // A second update touching only the room keeps the model
        let updated = store
            .update(
                system.id,
                &UpdateEntityRequest {
                    detail: Some(EntityDetail {
                        model: None,
                        room: Some("DC2-R12".into()),
                        management_url: None,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        let detail = updated.detail.unwrap();
        assert_eq!(detail.model.as_deref(), Some("XP512"));
        assert_eq!(detail.room.as_deref(), Some("DC2-R12"));
    }

    #[test]
    fn test_descendants_of_walks_the_type_chain() {
        let store = store();
        seed_datacenter(&store);

        for pool in ["Pool-01", "Pool-02"] {
            for pg in ["a", "b"] {
                store
                    .resolve_path(
                        &vec![
                            seg("CZ_Chodov", StorageEntityType::Datacenter),
                            seg("XP512", StorageEntityType::System),
                            seg(pool, StorageEntityType::Pool),
                            seg(&format!("PG-{}-{}", pool, pg), StorageEntityType::ParityGroup),
                        ],
                        true,
                    )
                    .unwrap();
            }
        }

        let dc = store
            .resolve_path(&vec![seg("CZ_Chodov", StorageEntityType::Datacenter)], false)
            .unwrap();
        let tree = store
            .descendants_of(dc.id, StorageEntityType::ParityGroup, &[StorageEntityStatus::Active])
            .unwrap();

        assert_eq!(tree.entity_type, StorageEntityType::Datacenter);
        assert_eq!(tree.children.len(), 1); // the system
        let system = &tree.children[0];
        assert_eq!(system.entity_type, StorageEntityType::System);
        assert_eq!(system.children.len(), 2); // two pools
        for pool in &system.children {
            assert_eq!(pool.entity_type, StorageEntityType::Pool);
            assert_eq!(pool.children.len(), 2); // two parity groups each
        }
        assert_eq!(tree.node_count(), 1 + 1 + 2 + 4);
    }

    #[test]
    fn test_descendants_of_stops_at_leaf_type() {
        let store = store();
        seed_datacenter(&store);
        store
            .resolve_path(
                &vec![
                    seg("CZ_Chodov", StorageEntityType::Datacenter),
                    seg("XP512", StorageEntityType::System),
                    seg("Pool-01", StorageEntityType::Pool),
                    seg("PG-1-1", StorageEntityType::ParityGroup),
                ],
                true,
            )
            .unwrap();

        let dc = store
            .resolve_path(&vec![seg("CZ_Chodov", StorageEntityType::Datacenter)], false)
            .unwrap();
        let tree = store.descendants_of(dc.id, StorageEntityType::Pool, &[]).unwrap();
        let pool = &tree.children[0].children[0];
        assert_eq!(pool.entity_type, StorageEntityType::Pool);
        assert!(pool.children.is_empty(), "descent stops at the requested leaf type");
    }

    #[test]
    fn test_cascade_status_marks_whole_subtree_inactive() {
        let store = store();
        seed_datacenter(&store);
        store
            .resolve_path(
                &vec![
                    seg("CZ_Chodov", StorageEntityType::Datacenter),
                    seg("XP512", StorageEntityType::System),
                    seg("Pool-01", StorageEntityType::Pool),
                    seg("PG-1-1", StorageEntityType::ParityGroup),
                ],
                true,
            )
            .unwrap();
        let system = store.resolve_path(&pool_path("XP512", "Pool-01")[..2].to_vec(), false).unwrap();

        let tree = store
            .cascade_status(system.id, StorageEntityStatus::Inactive)
            .unwrap();

        let mut seen = 0;
        tree.visit(&mut |node| {
            seen += 1;
            assert_eq!(node.status, StorageEntityStatus::Inactive);
        });
        assert_eq!(seen, 3); // system, pool, parity group

        // Persisted too, not just the returned snapshot
        let reloaded = store.get(system.id).unwrap();
        assert_eq!(reloaded.status, StorageEntityStatus::Inactive);
    }

    #[test]
    fn test_relocate_rewrites_closure() {
        let store = store();
        seed_datacenter(&store);
        let pg = store
            .resolve_path(
                &vec![
                    seg("CZ_Chodov", StorageEntityType::Datacenter),
                    seg("XP512", StorageEntityType::System),
                    seg("Pool-01", StorageEntityType::Pool),
                    seg("PG-1-1", StorageEntityType::ParityGroup),
                ],
                true,
            )
            .unwrap();
        let target_pool = store.resolve_path(&pool_path("XP512", "Pool-02"), true).unwrap();

        let moved = store.relocate(pg.id, target_pool.id).unwrap();
        assert_eq!(moved.parent_id, Some(target_pool.id));

        // ancestors(pg) == ancestors(new parent) + {new parent} + {pg}
        let mut expected: Vec<EntityId> = store.ancestors(target_pool.id).unwrap();
        expected.push(pg.id);
        expected.sort();
        let actual = store.ancestors(pg.id).unwrap();
        assert_eq!(actual, expected);

        // The old pool no longer reaches the parity group
        let old_pool = store.resolve_path(&pool_path("XP512", "Pool-01"), false).unwrap();
        assert!(!store.descendant_ids(old_pool.id).unwrap().contains(&pg.id));
        assert!(store.descendant_ids(target_pool.id).unwrap().contains(&pg.id));
    }

    #[test]
    fn test_relocate_keeps_subtree_membership() {
        let store = store();
        seed_datacenter(&store);
        // Two systems; move a whole pool (with its parity group) across
        let pg = store
            .resolve_path(
                &vec![
                    seg("CZ_Chodov", StorageEntityType::Datacenter),
                    seg("XP512", StorageEntityType::System),
                    seg("Pool-01", StorageEntityType::Pool),
                    seg("PG-1-1", StorageEntityType::ParityGroup),
                ],
                true,
            )
            .unwrap();
        let pool = store.resolve_path(&pool_path("XP512", "Pool-01"), false).unwrap();
        let other_system = store
            .resolve_path(
                &vec![
                    seg("CZ_Chodov", StorageEntityType::Datacenter),
                    seg("XP7", StorageEntityType::System),
                ],
                true,
            )
            .unwrap();

        store.relocate(pool.id, other_system.id).unwrap();

        // The parity group moved along and still sits below the pool
        assert!(store.descendant_ids(pool.id).unwrap().contains(&pg.id));
        assert!(store.descendant_ids(other_system.id).unwrap().contains(&pg.id));
        assert!(store.ancestors(pg.id).unwrap().contains(&other_system.id));

        let old_system = store.resolve_path(&pool_path("XP512", "Pool-02")[..2].to_vec(), false).unwrap();
        assert!(!store.descendant_ids(old_system.id).unwrap().contains(&pg.id));
    }

    #[test]
    fn test_relocate_guards() {
        let store = store();
        seed_datacenter(&store);
        let pool = store.resolve_path(&pool_path("XP512", "Pool-01"), true).unwrap();
        let system = store.resolve_path(&pool_path("XP512", "Pool-01")[..2].to_vec(), false).unwrap();

        // Unknown ids
        let err = store.relocate(EntityId(4040), system.id).unwrap_err();
        assert!(matches!(err, TreeError::NotFoundOrInactive { .. }));

        // Moving a system below its own pool
        let err = store.relocate(system.id, pool.id).unwrap_err();
        assert!(matches!(
            err,
            TreeError::MoveIntoSubtree { .. } | TreeError::IncompatibleParent { .. }
        ));

        // Type compatibility
        let dc = store
            .resolve_path(&vec![seg("CZ_Chodov", StorageEntityType::Datacenter)], false)
            .unwrap();
        let err = store.relocate(pool.id, dc.id).unwrap_err();
        assert!(matches!(err, TreeError::IncompatibleParent { .. }));
    }

    #[test]
    fn test_delete_subtree_scrubs_metrics_and_closure() {
        let store = store();
        seed_datacenter(&store);
        let pg = store
            .resolve_path(
                &vec![
                    seg("CZ_Chodov", StorageEntityType::Datacenter),
                    seg("XP512", StorageEntityType::System),
                    seg("Pool-01", StorageEntityType::Pool),
                    seg("PG-1-1", StorageEntityType::ParityGroup),
                ],
                true,
            )
            .unwrap();
        let pool = store.resolve_path(&pool_path("XP512", "Pool-01"), false).unwrap();

        store
            .record_metric_sample(
                "parity_group_metrics",
                pg.id,
                "PG_Utilization",
                87.5,
                MinuteStamp::from_minutes(29_000_000),
            )
            .unwrap();
        store
            .record_metric_sample(
                "pool_metrics",
                pool.id,
                "Pool_Capacity",
                1024.0,
                MinuteStamp::from_minutes(29_000_000),
            )
            .unwrap();

        store.delete_subtree(pool.id).unwrap();

        // Nodes, closure membership and metric rows are gone
        assert!(matches!(store.get(pool.id), Err(TreeError::NotFoundById { .. })));
        assert!(matches!(store.get(pg.id), Err(TreeError::NotFoundById { .. })));
        assert_eq!(store.metric_sample_count("pool_metrics", pool.id).unwrap(), 0);
        assert_eq!(
            store.metric_sample_count("parity_group_metrics", pg.id).unwrap(),
            0
        );

        let system = store.resolve_path(&pool_path("XP512", "Pool-02")[..2].to_vec(), false).unwrap();
        assert!(!store.descendant_ids(system.id).unwrap().contains(&pool.id));

        // Deleting again reports NotFound
        assert!(matches!(
            store.delete_subtree(pool.id),
            Err(TreeError::NotFoundById { .. })
        ));
    }

    #[test]
    fn test_available_systems_requires_active_and_children() {
        let store = store();
        seed_datacenter(&store);
        store.resolve_path(&pool_path("XP512", "Pool-01"), true).unwrap();
        let bare_system = store
            .resolve_path(
                &vec![
                    seg("CZ_Chodov", StorageEntityType::Datacenter),
                    seg("XP8", StorageEntityType::System),
                ],
                true,
            )
            .unwrap();

        let systems = store.available_systems().unwrap();
        let names: Vec<&str> = systems.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["XP512"]); // XP8 has no children yet

        // An INACTIVE system disappears from the listing
        let populated = store.resolve_path(&pool_path("XP512", "Pool-01")[..2].to_vec(), false).unwrap();
        store.cascade_status(populated.id, StorageEntityStatus::Inactive).unwrap();
        assert!(store.available_systems().unwrap().is_empty());
        let _ = bare_system;
    }
}

// ============================================================================
// SECTION 11: EXTERNAL SOURCE CLIENT
// ============================================================================
// The maintainer is the external analytics backend holding the raw
// time-series data the engine mirrors. This section provides:
// - The `MetricSource` trait (the seam every consumer programs against)
// - The HTTP implementation speaking the maintainer wire protocol
// - An explicit broadcast channel for "data updated" notifications,
//   delivered at-least-once; consumers must stay idempotent
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Wire & Query Types
// ----------------------------------------------------------------------------

/// Availability and unit metadata of one maintainer dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    /// Raw-time ranges the maintainer holds, oldest first
    pub dataranges: Vec<TimeRange>,
    /// Physical unit of the dataset values
    pub units: String,
}

impl DatasetInfo {
    /// End of the newest range: the boundary up to which data exists.
    pub fn latest_boundary(&self) -> Option<MinuteStamp> {
        self.dataranges.last().map(|r| r.to)
    }
}

#[derive(Debug, Deserialize)]
struct DatasetInfoWire {
    #[serde(default)]
    dataranges: Vec<[i64; 2]>,
    #[serde(default)]
    units: Option<String>,
}

impl From<DatasetInfoWire> for DatasetInfo {
    fn from(wire: DatasetInfoWire) -> Self {
        DatasetInfo {
            dataranges: wire
                .dataranges
                .into_iter()
                .map(|[from, to]| TimeRange::from_minutes(from, to))
                .collect(),
            units: wire.units.unwrap_or_default(),
        }
    }
}

/// Options for a variant recommendation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantQuery {
    /// Filter token forwarded to the maintainer ranking
    pub filter: Option<String>,
    /// Restrict the recommendation to this candidate set
    pub variants: Option<Vec<String>>,
}

/// Options for a bulk data fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchQuery {
    /// Explicit variant columns; resolved via recommendation when absent
    pub variants: Option<Vec<String>>,
    /// Server-side reduction (`sum`/`avg`) performed by the maintainer
    pub op: Option<String>,
}

/// Pool composition as reported by the maintainer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    /// LDEV identifiers backing the pool
    #[serde(default)]
    pub ldevs: Vec<String>,
}

// ----------------------------------------------------------------------------
// 11.2 Update Events
// ----------------------------------------------------------------------------

/// What kind of maintainer data changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceEventKind {
    /// Performance time-series advanced
    Performance,
    /// Capacity/configuration snapshots advanced
    Capacity,
}

/// A "data updated" notification for one system.
///
/// Delivery is at-least-once: a lagging subscriber may observe a replacement
/// `Lagged` signal and must treat its next refresh as a full resync. All
/// consumers are idempotent, so duplicates are harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub system: String,
    pub kind: SourceEventKind,
}

// ----------------------------------------------------------------------------
// 11.3 The MetricSource Trait
// ----------------------------------------------------------------------------

/// The engine-facing contract of the external analytics backend.
///
/// Everything the cache layer knows about the maintainer goes through this
/// trait, which keeps the scheduler and read path testable against an
/// in-process fake.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// True when a maintainer is configured for the system
    fn handles_system(&self, system: &str) -> bool;

    /// All systems with a configured maintainer
    fn handled_systems(&self) -> Vec<String>;

    /// Reachability probe; an unreachable maintainer skips precaching
    async fn status(&self, system: &str) -> bool;

    /// Dataset availability ranges and units
    async fn dataset_info(&self, system: &str, metric: &str) -> SourceResult<DatasetInfo>;

    /// Ordered variant recommendation for a metric over a window
    async fn recommend_variants(
        &self,
        system: &str,
        metric: &str,
        range: TimeRange,
        query: &VariantQuery,
    ) -> SourceResult<Vec<String>>;

    /// Bulk data fetch; resolves variants when the query leaves them out and
    /// applies the optional server-side reduction
    async fn fetch_data(
        &self,
        system: &str,
        metric: &str,
        range: TimeRange,
        query: &FetchQuery,
    ) -> SourceResult<VariantMatrix>;

    /// Pool name -> composition, for per-pool variant expansion
    async fn pool_info(&self, system: &str) -> SourceResult<AHashMap<String, PoolDescriptor>>;

    /// Subscribe to "data updated" notifications
    fn subscribe(&self) -> broadcast::Receiver<SourceEvent>;
}

// ----------------------------------------------------------------------------
// 11.4 HTTP Implementation
// ----------------------------------------------------------------------------

/// HTTP client for the maintainer wire protocol:
/// - `GET  {base}datasets/<metric>`               -> availability + units
/// - `POST {base}features/variant_recommend`      -> ordered variant names
/// - `POST {base}bulkload_json/<metric>`          -> row-major numeric matrix
/// - `GET  {base}pools`                           -> pool compositions
/// - `GET  {base}health`                          -> reachability probe
pub struct MaintainerClient {
    /// System name -> normalized base URL (always slash-terminated)
    base_urls: AHashMap<String, String>,
    http: reqwest::Client,
    probe_timeout: Duration,
    events: broadcast::Sender<SourceEvent>,
}

impl fmt::Debug for MaintainerClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintainerClient")
            .field("systems", &self.base_urls.len())
            .finish_non_exhaustive()
    }
}

impl MaintainerClient {
    pub fn new(config: &SourceConfig) -> SourceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let base_urls = config
            .systems
            .iter()
            .map(|(system, url)| {
                let mut url = url.trim().to_string();
                if !url.ends_with('/') {
                    url.push('/');
                }
                (system.clone(), url)
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            base_urls,
            http,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            events,
        })
    }

    fn base(&self, system: &str) -> SourceResult<&str> {
        self.base_urls
            .get(system)
            .map(String::as_str)
            .ok_or_else(|| SourceError::UnhandledSystem { system: system.to_string() })
    }

    /// Publish a "data updated" notification to all subscribers.
    /// A send into a subscriber-less channel is a no-op.
    pub fn notify(&self, event: SourceEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MetricSource for MaintainerClient {
    fn handles_system(&self, system: &str) -> bool {
        self.base_urls.contains_key(system)
    }

    fn handled_systems(&self) -> Vec<String> {
        let mut systems: Vec<String> = self.base_urls.keys().cloned().collect();
        systems.sort();
        systems
    }

    async fn status(&self, system: &str) -> bool {
        let Ok(base) = self.base(system) else { return false };
        let url = format!("{}health", base);
        match self.http.get(&url).timeout(self.probe_timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn dataset_info(&self, system: &str, metric: &str) -> SourceResult<DatasetInfo> {
        let url = format!("{}datasets/{}", self.base(system)?, metric);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        let wire: DatasetInfoWire = resp
            .json()
            .await
            .map_err(|e| SourceError::invalid_response(format!("datasets/{}", metric), e.to_string()))?;
        Ok(wire.into())
    }

    async fn recommend_variants(
        &self,
        system: &str,
        metric: &str,
        range: TimeRange,
        query: &VariantQuery,
    ) -> SourceResult<Vec<String>> {
        let url = format!("{}features/variant_recommend", self.base(system)?);

        let mut body = serde_json::Map::new();
        body.insert("id".into(), json!(metric));
        body.insert("from".into(), json!(range.from.as_minutes().to_string()));
        body.insert("to".into(), json!(range.to.as_minutes().to_string()));
        if let Some(filter) = &query.filter {
            body.insert("filter".into(), json!(filter));
        }
        if let Some(variants) = &query.variants {
            body.insert("variants".into(), json!(variants));
        }

        let resp = self.http.post(&url).json(&body).send().await?.error_for_status()?;
        resp.json()
            .await
            .map_err(|e| SourceError::invalid_response("features/variant_recommend", e.to_string()))
    }

    async fn fetch_data(
        &self,
        system: &str,
        metric: &str,
        range: TimeRange,
        query: &FetchQuery,
    ) -> SourceResult<VariantMatrix> {
        let info = self.dataset_info(system, metric).await?;

        let variants = match &query.variants {
            Some(v) => v.clone(),
            None => {
                self.recommend_variants(system, metric, range, &VariantQuery::default())
                    .await?
            }
        };

        let url = format!("{}bulkload_json/{}", self.base(system)?, metric);
        let mut body = serde_json::Map::new();
        body.insert("variants".into(), json!(variants));
        body.insert("from".into(), json!(range.from.as_minutes().to_string()));
        body.insert("to".into(), json!(range.to.as_minutes().to_string()));
        if let Some(op) = &query.op {
            body.insert("op".into(), json!(op));
        }

        let resp = self.http.post(&url).json(&body).send().await?.error_for_status()?;
        let raw: Vec<Vec<JsonValue>> = resp
            .json()
            .await
            .map_err(|e| SourceError::invalid_response(format!("bulkload_json/{}", metric), e.to_string()))?;

        let out_variants = match &query.op {
            Some(op) => vec![op.clone()],
            None => variants,
        };
        let data = decode_matrix_rows(raw, out_variants.len());
        Ok(VariantMatrix { variants: out_variants, units: info.units, data })
    }

    async fn pool_info(&self, system: &str) -> SourceResult<AHashMap<String, PoolDescriptor>> {
        let url = format!("{}pools", self.base(system)?);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        resp.json()
            .await
            .map_err(|e| SourceError::invalid_response("pools", e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }
}

/// Decode a row-major maintainer matrix: column 0 is the minute-epoch stamp,
/// the rest align with the variant columns. Rows without a leading value are
/// dropped (the maintainer emits them for gaps); trailing holes read as zero.
fn decode_matrix_rows(raw: Vec<Vec<JsonValue>>, variant_count: usize) -> Vec<MetricRow> {
    let mut rows = Vec::with_capacity(raw.len());
    for cols in raw {
        let Some(stamp) = cols.first().and_then(JsonValue::as_i64) else { continue };
        if cols.len() > 1 && cols[1].is_null() {
            continue;
        }
        let mut values: RowValues = SmallVec::with_capacity(variant_count);
        for i in 0..variant_count {
            values.push(cols.get(i + 1).and_then(JsonValue::as_f64).unwrap_or(0.0));
        }
        rows.push(MetricRow { stamp: MinuteStamp::from_minutes(stamp), values });
    }
    rows
}

// ============================================================================
// SECTION 12: CACHE KEYED STORE
// ============================================================================
// Persisted representation of one cached metric series:
// - `cache_entries`: key, covered range, unit, serialized variant set
// - `cache_rows`:   one row per (entry, timestamp), values aligned to the
//                   entry's variant columns
//
// The variant set of an entry is authoritative: whenever the externally
// recommended set changes, the entry's rows are wiped and its coverage reset
// so stale variants are never mixed with new ones.
// ============================================================================

/// One persisted cache entry: the series identity plus its coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Rendered cache key
    pub key: String,
    /// Covered window `[from, to)`; an empty range means no coverage yet
    pub range: TimeRange,
    /// Physical unit of the cached values
    pub units: String,
    /// Ordered variant columns the rows align to
    pub variants: Vec<String>,
}

impl CacheEntry {
    /// The covered window, or `None` when the entry holds nothing yet.
    pub fn coverage(&self) -> Option<TimeRange> {
        if self.range.is_empty() {
            None
        } else {
            Some(self.range)
        }
    }
}

/// Store for cache entries and their timestamp-keyed rows.
#[derive(Debug, Clone)]
pub struct CacheStore {
    db: Database,
}

impl CacheStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Load the entry for a key, if any.
    pub fn load_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.db.with(|conn| load_entry_inner(conn, &key.render()))
    }

    /// Load or create the entry for a key, enforcing the variant invariant:
    /// a differing stored variant set wipes all rows and resets coverage.
    /// Units follow the latest resolution.
    pub fn ensure_entry(
        &self,
        key: &CacheKey,
        variants: &[String],
        units: &str,
    ) -> CacheResult<CacheEntry> {
        let rendered = key.render();
        self.db.with_tx(|conn| {
            match load_entry_inner(conn, &rendered)? {
                None => {
                    conn.execute(
                        "INSERT INTO cache_entries (key, range_from, range_to, units, variants) \
                         VALUES (?1, 0, 0, ?2, ?3)",
                        params![rendered, units, serde_json::to_string(variants)?],
                    )?;
                }
                Some(entry) if entry.variants != variants => {
                    debug!(
                        target: "sanwatch::cache",
                        key = %rendered,
                        "Variant set changed; invalidating cached rows"
                    );
                    conn.execute(
                        "DELETE FROM cache_rows WHERE entry_key = ?1",
                        params![rendered],
                    )?;
                    conn.execute(
                        "UPDATE cache_entries SET range_from = 0, range_to = 0, \
                         units = ?2, variants = ?3 WHERE key = ?1",
                        params![rendered, units, serde_json::to_string(variants)?],
                    )?;
                }
                Some(entry) => {
                    if entry.units != units {
                        conn.execute(
                            "UPDATE cache_entries SET units = ?2 WHERE key = ?1",
                            params![rendered, units],
                        )?;
                    }
                }
            }
            load_entry_inner(conn, &rendered)?
                .ok_or_else(|| CacheError::EntryNotFound { key: rendered.clone() })
        })
    }

    /// Delete the stored rows inside `range` (the exact sub-window about to
    /// be replaced).
    pub fn delete_rows_in(&self, key: &CacheKey, range: TimeRange) -> CacheResult<usize> {
        if range.is_empty() {
            return Ok(0);
        }
        self.db.with(|conn| {
            let n = conn.execute(
                "DELETE FROM cache_rows \
                 WHERE entry_key = ?1 AND stamp >= ?2 AND stamp < ?3",
                params![key.render(), range.from.as_minutes(), range.to.as_minutes()],
            )?;
            Ok(n)
        })
    }

    /// Insert rows for an entry. Exactly one row may exist per
    /// (entry, timestamp); a second insert for the same stamp replaces the
    /// first, which keeps retried slices idempotent.
    pub fn insert_rows(&self, key: &CacheKey, rows: &[MetricRow]) -> CacheResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rendered = key.render();
        self.db.with_tx(|conn| {
            let mut stmt = conn.prepare(
                "INSERT OR REPLACE INTO cache_rows (entry_key, stamp, vals) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for row in rows {
                let vals: Vec<f64> = row.values.iter().copied().collect();
                stmt.execute(params![
                    rendered,
                    row.stamp.as_minutes(),
                    serde_json::to_string(&vals)?
                ])?;
            }
            Ok(rows.len())
        })
    }

    /// Stored rows inside `range`, in ascending stamp order.
    pub fn rows_in(&self, key: &CacheKey, range: TimeRange) -> CacheResult<Vec<MetricRow>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT stamp, vals FROM cache_rows \
                 WHERE entry_key = ?1 AND stamp >= ?2 AND stamp < ?3 \
                 ORDER BY stamp",
            )?;
            let raw = stmt
                .query_map(
                    params![key.render(), range.from.as_minutes(), range.to.as_minutes()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )?
                .collect::<rusqlite::Result<Vec<(i64, String)>>>()?;

            let mut rows = Vec::with_capacity(raw.len());
            for (stamp, vals) in raw {
                let values: Vec<f64> = serde_json::from_str(&vals)?;
                rows.push(MetricRow {
                    stamp: MinuteStamp::from_minutes(stamp),
                    values: RowValues::from_vec(values),
                });
            }
            Ok(rows)
        })
    }

    /// Extend the entry's coverage to the union of the stored range and
    /// `fetched`, returning the new coverage.
    pub fn extend_coverage(&self, key: &CacheKey, fetched: TimeRange) -> CacheResult<TimeRange> {
        let rendered = key.render();
        self.db.with_tx(|conn| {
            let entry = load_entry_inner(conn, &rendered)?
                .ok_or_else(|| CacheError::EntryNotFound { key: rendered.clone() })?;
            let merged = match entry.coverage() {
                Some(existing) => existing.union(fetched),
                None => fetched,
            };
            conn.execute(
                "UPDATE cache_entries SET range_from = ?2, range_to = ?3 WHERE key = ?1",
                params![rendered, merged.from.as_minutes(), merged.to.as_minutes()],
            )?;
            Ok(merged)
        })
    }

    /// Number of rows stored for an entry.
    pub fn row_count(&self, key: &CacheKey) -> CacheResult<i64> {
        self.db.with(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM cache_rows WHERE entry_key = ?1",
                params![key.render()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }
}

fn load_entry_inner(conn: &Connection, rendered: &str) -> CacheResult<Option<CacheEntry>> {
    let raw = conn
        .query_row(
            "SELECT key, range_from, range_to, units, variants \
             FROM cache_entries WHERE key = ?1",
            params![rendered],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((key, from, to, units, variants)) = raw else {
        return Ok(None);
    };
    Ok(Some(CacheEntry {
        key,
        range: TimeRange::from_minutes(from, to),
        units,
        variants: serde_json::from_str(&variants)?,
    }))
}

// ============================================================================
// SECTION 13: RANGE RECONCILER
// ============================================================================
// Pure planning of the sub-window that still has to be fetched, given a
// requested refresh window and the existing cached coverage. Evaluated in
// order:
//   1. no coverage                      -> fetch the whole window
//   2. coverage contains the window     -> fetch nothing
//   3. window extends on both sides     -> fetch the head and the tail slice
//   4. window starts before coverage    -> fetch the head slice
//   5. window ends after coverage       -> fetch the tail slice
// Stored rows inside every planned slice are deleted before re-insertion.
// ============================================================================

/// The fetch slices still needed to satisfy a refresh window, in order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchPlan {
    pub slices: SmallVec<[TimeRange; 2]>,
}

impl FetchPlan {
    /// Plan that fetches nothing
    pub fn nothing() -> Self {
        Self::default()
    }

    /// Plan that fetches the whole window
    pub fn whole(range: TimeRange) -> Self {
        Self { slices: smallvec![range] }
    }

    /// True when nothing needs fetching
    pub fn is_nothing(&self) -> bool {
        self.slices.is_empty()
    }

    /// Total minutes across all slices
    pub fn minutes(&self) -> i64 {
        self.slices.iter().map(TimeRange::minutes).sum()
    }
}

/// Decide which sub-windows of `requested` still need fetching given the
/// existing `coverage`. Overlap boundaries favor the minimal slice.
pub fn reconcile(requested: TimeRange, coverage: Option<TimeRange>) -> FetchPlan {
    if requested.is_empty() {
        return FetchPlan::nothing();
    }

    let Some(coverage) = coverage.filter(|c| !c.is_empty()) else {
        return FetchPlan::whole(requested);
    };

    if coverage.covers(requested) {
        return FetchPlan::nothing();
    }

    // Head and tail slices per the rule table. A window disjoint from the
    // coverage still produces a single gap-spanning slice, which keeps the
    // union of coverage and fetched data contiguous.
    let mut plan = FetchPlan::nothing();
    if requested.from < coverage.from {
        plan.slices.push(TimeRange::new(requested.from, coverage.from));
    }
    if requested.to > coverage.to {
        plan.slices.push(TimeRange::new(coverage.to, requested.to));
    }
    plan
}

// ============================================================================
// SECTION 14: AGGREGATION PIPELINE
// ============================================================================
// Stateless transforms over variant matrices:
// - Maps collapse all variant columns of a row into one synthetic column
//   (sum, average, percentile)
// - Filters keep a ranked subset of the variant columns (top-k / bottom-k)
// Transforms compose as filter-then-map, never the reverse.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Map Transforms
// ----------------------------------------------------------------------------

/// Collapse every row of the matrix into a single synthetic variant.
///
/// - `sum`:  row total
/// - `avg`:  row total divided by the variant count
/// - `perc-p`: the row's values sorted ascending, picking index
///   `round(p * (variant_count - 1))`
///
/// The synthetic variant is named after the token. A matrix without variant
/// columns passes through unchanged.
pub fn apply_map(mut matrix: VariantMatrix, token: MapToken) -> VariantMatrix {
    let variant_count = matrix.variant_count();
    if variant_count == 0 {
        return matrix;
    }

    match token {
        MapToken::Sum | MapToken::Average => {
            let divisor = match token {
                MapToken::Sum => 1.0,
                _ => variant_count as f64,
            };
            for row in &mut matrix.data {
                let total: f64 = row.values.iter().sum();
                row.values = smallvec![total / divisor];
            }
        }
        MapToken::Percentile(p) => {
            let index = percentile_index(p, variant_count);
            for row in &mut matrix.data {
                let mut sorted: SmallVec<[f64; 4]> = row.values.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                row.values = smallvec![sorted[index]];
            }
        }
    }

    matrix.variants = vec![token.to_string()];
    matrix
}

/// Index picked by a percentile map: `round(p * (n - 1))`, clamped into the
/// column range.
fn percentile_index(p: f64, variant_count: usize) -> usize {
    let raw = (p * (variant_count as f64 - 1.0)).round();
    (raw.max(0.0) as usize).min(variant_count - 1)
}

// ----------------------------------------------------------------------------
// 14.2 Filter Transforms
// ----------------------------------------------------------------------------

/// Keep the k variant columns ranked by the sum of their values across all
/// rows: descending for `top-k`, ascending for `bot-k`. Ties keep their
/// original column order (the ranking sort is stable). When the matrix has
/// no more variants than k, the filter is a no-op.
pub fn apply_filter(matrix: VariantMatrix, token: FilterToken) -> VariantMatrix {
    let variant_count = matrix.variant_count();
    if variant_count <= token.count() {
        return matrix;
    }

    let mut sums: Vec<(usize, f64)> = (0..variant_count)
        .map(|col| {
            let total = matrix
                .data
                .iter()
                .map(|row| row.values.get(col).copied().unwrap_or(0.0))
                .sum();
            (col, total)
        })
        .collect();

    match token {
        FilterToken::Top(_) => {
            sums.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
        }
        FilterToken::Bottom(_) => {
            sums.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        }
    }

    let keep: Vec<usize> = sums.into_iter().take(token.count()).map(|(col, _)| col).collect();

    let variants = keep.iter().map(|&col| matrix.variants[col].clone()).collect();
    let data = matrix
        .data
        .into_iter()
        .map(|row| {
            let values: RowValues = keep
                .iter()
                .map(|&col| row.values.get(col).copied().unwrap_or(0.0))
                .collect();
            MetricRow { stamp: row.stamp, values }
        })
        .collect();

    VariantMatrix { variants, units: matrix.units, data }
}

// ----------------------------------------------------------------------------
// 14.3 Composition
// ----------------------------------------------------------------------------

/// Apply the optional filter, then the optional map. The order is fixed: a
/// column reduction must see the original variant columns, and a map erases
/// them.
pub fn apply_pipeline(
    mut matrix: VariantMatrix,
    filter: Option<FilterToken>,
    map: Option<MapToken>,
) -> VariantMatrix {
    if let Some(token) = filter {
        matrix = apply_filter(matrix, token);
    }
    if let Some(token) = map {
        matrix = apply_map(matrix, token);
    }
    matrix
}

// ============================================================================
// SECTION 15: PHASE 3 TESTS
// ============================================================================

#[cfg(test)]
mod phase3_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key() -> CacheKey {
        CacheKey::new("XP512", "HG_IOPS", Some("sum"), None)
    }

    fn cache() -> CacheStore {
        CacheStore::new(Database::open_in_memory().expect("in-memory db"))
    }

    fn matrix(variants: &[&str], rows: &[(i64, &[f64])]) -> VariantMatrix {
        VariantMatrix {
            variants: variants.iter().map(|v| v.to_string()).collect(),
            units: "IOPS".into(),
            data: rows
                .iter()
                .map(|(stamp, values)| {
                    MetricRow::new(
                        MinuteStamp::from_minutes(*stamp),
                        RowValues::from_slice(values),
                    )
                })
                .collect(),
        }
    }

    // ---- Range Reconciler --------------------------------------------------

    #[test]
    fn test_reconcile_without_coverage_fetches_everything() {
        let requested = TimeRange::from_minutes(10, 20);
        assert_eq!(reconcile(requested, None), FetchPlan::whole(requested));

        // An empty coverage counts as none
        let empty = TimeRange::empty_at(MinuteStamp::from_minutes(15));
        assert_eq!(reconcile(requested, Some(empty)), FetchPlan::whole(requested));
    }

    #[test]
    fn test_reconcile_contained_request_fetches_nothing() {
        let plan = reconcile(
            TimeRange::from_minutes(12, 18),
            Some(TimeRange::from_minutes(10, 20)),
        );
        assert!(plan.is_nothing());

        // Exact match is contained too
        let plan = reconcile(
            TimeRange::from_minutes(10, 20),
            Some(TimeRange::from_minutes(10, 20)),
        );
        assert!(plan.is_nothing());
    }

    #[test]
    fn test_reconcile_extension_on_both_sides_yields_two_slices() {
        let plan = reconcile(
            TimeRange::from_minutes(5, 25),
            Some(TimeRange::from_minutes(10, 20)),
        );
        assert_eq!(
            plan.slices.as_slice(),
            &[TimeRange::from_minutes(5, 10), TimeRange::from_minutes(20, 25)]
        );
    }

    #[test]
    fn test_reconcile_head_and_tail_slices() {
        let head = reconcile(
            TimeRange::from_minutes(5, 15),
            Some(TimeRange::from_minutes(10, 20)),
        );
        assert_eq!(head.slices.as_slice(), &[TimeRange::from_minutes(5, 10)]);

        let tail = reconcile(
            TimeRange::from_minutes(15, 30),
            Some(TimeRange::from_minutes(10, 20)),
        );
        assert_eq!(tail.slices.as_slice(), &[TimeRange::from_minutes(20, 30)]);
    }

    #[test]
    fn test_reconcile_disjoint_window_spans_the_gap() {
        // Coverage must stay contiguous, so the slice reaches back to the
        // coverage edge
        let plan = reconcile(
            TimeRange::from_minutes(30, 40),
            Some(TimeRange::from_minutes(10, 20)),
        );
        assert_eq!(plan.slices.as_slice(), &[TimeRange::from_minutes(20, 40)]);
    }

    #[test]
    fn test_reconcile_empty_request_is_a_no_op() {
        let plan = reconcile(
            TimeRange::empty_at(MinuteStamp::from_minutes(5)),
            Some(TimeRange::from_minutes(10, 20)),
        );
        assert!(plan.is_nothing());
    }

    // ---- Aggregation Pipeline ----------------------------------------------

    #[test]
    fn test_map_sum_and_average() {
        let input = matrix(&["a", "b"], &[(1, &[1.0, 3.0]), (2, &[2.0, 4.0])]);

        let summed = apply_map(input.clone(), MapToken::Sum);
        assert_eq!(summed.variants, vec!["sum".to_string()]);
        assert_eq!(summed.data[0].values.as_slice(), &[4.0]);
        assert_eq!(summed.data[1].values.as_slice(), &[6.0]);

        let averaged = apply_map(input, MapToken::Average);
        assert_eq!(averaged.variants, vec!["avg".to_string()]);
        assert_eq!(averaged.data[0].values.as_slice(), &[2.0]);
        assert_eq!(averaged.data[1].values.as_slice(), &[3.0]);
    }

    #[test]
    fn test_map_percentile_picks_sorted_index() {
        // perc-0.5 over [3, 1, 2]: sorted [1, 2, 3], index round(0.5 * 2) = 1
        let input = matrix(&["a", "b", "c"], &[(1, &[3.0, 1.0, 2.0])]);
        let result = apply_map(input, MapToken::Percentile(0.5));
        assert_eq!(result.variants, vec!["perc-0.5".to_string()]);
        assert_eq!(result.data[0].values.as_slice(), &[2.0]);
    }

    #[test]
    fn test_map_percentile_extremes() {
        let input = matrix(&["a", "b", "c"], &[(1, &[3.0, 1.0, 2.0])]);
        let min = apply_map(input.clone(), MapToken::Percentile(0.0));
        assert_eq!(min.data[0].values.as_slice(), &[1.0]);
        let max = apply_map(input, MapToken::Percentile(1.0));
        assert_eq!(max.data[0].values.as_slice(), &[3.0]);
    }

    #[test]
    fn test_filter_top_k_ranks_by_column_sum() {
        // Column sums: a=3, b=30, c=12
        let input = matrix(
            &["a", "b", "c"],
            &[(1, &[1.0, 10.0, 4.0]), (2, &[2.0, 20.0, 8.0])],
        );
        let top = apply_filter(input.clone(), FilterToken::Top(2));
        assert_eq!(top.variants, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(top.data[0].values.as_slice(), &[10.0, 4.0]);
        assert_eq!(top.data[1].values.as_slice(), &[20.0, 8.0]);

        let bottom = apply_filter(input, FilterToken::Bottom(1));
        assert_eq!(bottom.variants, vec!["a".to_string()]);
        assert_eq!(bottom.data[1].values.as_slice(), &[2.0]);
    }

    #[test]
    fn test_filter_is_noop_when_k_covers_all_variants() {
        let input = matrix(&["a", "b"], &[(1, &[1.0, 2.0])]);
        let filtered = apply_filter(input.clone(), FilterToken::Top(2));
        assert_eq!(filtered, input);
        let filtered = apply_filter(input.clone(), FilterToken::Top(5));
        assert_eq!(filtered, input);
    }

    #[test]
    fn test_filter_tie_break_keeps_original_column_order() {
        // All columns sum to 6: stable ranking keeps a, b
        let input = matrix(
            &["a", "b", "c"],
            &[(1, &[3.0, 3.0, 3.0]), (2, &[3.0, 3.0, 3.0])],
        );
        let top = apply_filter(input.clone(), FilterToken::Top(2));
        assert_eq!(top.variants, vec!["a".to_string(), "b".to_string()]);
        let bottom = apply_filter(input, FilterToken::Bottom(2));
        assert_eq!(bottom.variants, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_pipeline_filters_before_mapping() {
        // Column sums: a=2, b=20, c=8. top-2 keeps b, c; sum collapses them.
        let input = matrix(&["a", "b", "c"], &[(1, &[2.0, 20.0, 8.0])]);
        let result = apply_pipeline(
            input,
            Some(FilterToken::Top(2)),
            Some(MapToken::Sum),
        );
        assert_eq!(result.variants, vec!["sum".to_string()]);
        assert_eq!(result.data[0].values.as_slice(), &[28.0]);
    }

    // ---- Cache Store -------------------------------------------------------

    #[test]
    fn test_ensure_entry_creates_with_empty_coverage() {
        let cache = cache();
        let entry = cache
            .ensure_entry(&key(), &["sum".to_string()], "IOPS")
            .unwrap();
        assert_eq!(entry.coverage(), None);
        assert_eq!(entry.variants, vec!["sum".to_string()]);
        assert_eq!(entry.units, "IOPS");
    }

    #[test]
    fn test_rows_roundtrip_and_range_scans() {
        let cache = cache();
        let key = key();
        cache.ensure_entry(&key, &["sum".to_string()], "IOPS").unwrap();

        let rows: Vec<MetricRow> = (10..20)
            .map(|i| MetricRow::new(MinuteStamp::from_minutes(i), smallvec![i as f64]))
            .collect();
        cache.insert_rows(&key, &rows).unwrap();
        cache.extend_coverage(&key, TimeRange::from_minutes(10, 20)).unwrap();

        let scanned = cache.rows_in(&key, TimeRange::from_minutes(12, 15)).unwrap();
        let stamps: Vec<i64> = scanned.iter().map(|r| r.stamp.as_minutes()).collect();
        assert_eq!(stamps, vec![12, 13, 14]);

        // One row per (entry, stamp): re-inserting a stamp replaces it
        cache
            .insert_rows(
                &key,
                &[MetricRow::new(MinuteStamp::from_minutes(12), smallvec![99.0])],
            )
            .unwrap();
        assert_eq!(cache.row_count(&key).unwrap(), 10);
        let replaced = cache.rows_in(&key, TimeRange::from_minutes(12, 13)).unwrap();
        assert_eq!(replaced[0].values.as_slice(), &[99.0]);
    }

    #[test]
    fn test_delete_rows_in_exact_subwindow() {
        let cache = cache();
        let key = key();
        cache.ensure_entry(&key, &["sum".to_string()], "IOPS").unwrap();
        let rows: Vec<MetricRow> = (0..10)
            .map(|i| MetricRow::new(MinuteStamp::from_minutes(i), smallvec![i as f64]))
            .collect();
        cache.insert_rows(&key, &rows).unwrap();

        let deleted = cache.delete_rows_in(&key, TimeRange::from_minutes(3, 6)).unwrap();
        assert_eq!(deleted, 3);
        let left: Vec<i64> = cache
            .rows_in(&key, TimeRange::from_minutes(0, 10))
            .unwrap()
            .iter()
            .map(|r| r.stamp.as_minutes())
            .collect();
        assert_eq!(left, vec![0, 1, 2, 6, 7, 8, 9]);
    }

    #[test]
    fn test_variant_change_invalidates_rows_and_coverage() {
        let cache = cache();
        let key = key();
        cache
            .ensure_entry(&key, &["PORT-1A".to_string(), "PORT-2A".to_string()], "IOPS")
            .unwrap();
        cache
            .insert_rows(
                &key,
                &[MetricRow::new(MinuteStamp::from_minutes(10), smallvec![1.0, 2.0])],
            )
            .unwrap();
        cache.extend_coverage(&key, TimeRange::from_minutes(10, 11)).unwrap();

        // Same variants: nothing is lost
        let entry = cache
            .ensure_entry(&key, &["PORT-1A".to_string(), "PORT-2A".to_string()], "IOPS")
            .unwrap();
        assert_eq!(entry.coverage(), Some(TimeRange::from_minutes(10, 11)));
        assert_eq!(cache.row_count(&key).unwrap(), 1);

        // A changed recommendation wipes rows and resets coverage
        let entry = cache
            .ensure_entry(&key, &["PORT-1A".to_string(), "PORT-3B".to_string()], "IOPS")
            .unwrap();
        assert_eq!(entry.coverage(), None);
        assert_eq!(cache.row_count(&key).unwrap(), 0);
        assert_eq!(entry.variants, vec!["PORT-1A".to_string(), "PORT-3B".to_string()]);
    }

    #[test]
    fn test_coverage_union() {
        let cache = cache();
        let key = key();
        cache.ensure_entry(&key, &["sum".to_string()], "IOPS").unwrap();

        let merged = cache.extend_coverage(&key, TimeRange::from_minutes(10, 20)).unwrap();
        assert_eq!(merged, TimeRange::from_minutes(10, 20));
        let merged = cache.extend_coverage(&key, TimeRange::from_minutes(20, 30)).unwrap();
        assert_eq!(merged, TimeRange::from_minutes(10, 30));
        let merged = cache.extend_coverage(&key, TimeRange::from_minutes(5, 8)).unwrap();
        assert_eq!(merged, TimeRange::from_minutes(5, 30));
    }

    #[test]
    fn test_entries_are_isolated_by_key() {
        let cache = cache();
        let sum_key = CacheKey::new("XP512", "HG_IOPS", Some("sum"), None);
        let raw_key = CacheKey::new("XP512", "HG_IOPS", None, None);
        cache.ensure_entry(&sum_key, &["sum".to_string()], "IOPS").unwrap();
        cache
            .ensure_entry(&raw_key, &["PORT-1A".to_string()], "IOPS")
            .unwrap();

        cache
            .insert_rows(
                &sum_key,
                &[MetricRow::new(MinuteStamp::from_minutes(1), smallvec![5.0])],
            )
            .unwrap();
        assert_eq!(cache.row_count(&sum_key).unwrap(), 1);
        assert_eq!(cache.row_count(&raw_key).unwrap(), 0);
    }
}

// ============================================================================
// SECTION 16: CACHE READ PATH
// ============================================================================
// Serving one metric request:
// 1. the system must be handled by a configured maintainer
// 2. a cache hit (entry coverage starting at or before the requested start)
//    returns stored rows directly, with no re-aggregation
// 3. a miss resolves custom variant selectors, fetches raw data for the full
//    window, applies filter-then-map, and returns without persisting -
//    populating the cache is the scheduler's job, not the read path's
// ============================================================================

/// Per-pool variant expansion: `$<metric>@pool-<name>` selects the LDEVs
/// backing the named pool as the variant set.
static CUSTOM_METRIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(\w+)@(\w+)-(\w+)").expect("static regex"));

/// Query options of one metric read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    /// Map token (`sum`, `avg`, `perc-<float>`)
    pub map: Option<String>,
    /// Filter token (`top-<int>`, `bot-<int>`)
    pub filter: Option<String>,
    /// Explicit variant columns; resolved when absent
    pub variants: Option<Vec<String>>,
}

impl MetricQuery {
    /// Cache key of this query against a system/metric pair
    pub fn cache_key(&self, system: &str, metric: &str) -> CacheKey {
        CacheKey::new(system, metric, self.map.as_deref(), self.filter.as_deref())
    }
}

/// The cache-aware read path over the maintainer source.
pub struct CacheReader {
    source: Arc<dyn MetricSource>,
    cache: CacheStore,
}

impl fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheReader").finish_non_exhaustive()
    }
}

impl CacheReader {
    pub fn new(source: Arc<dyn MetricSource>, cache: CacheStore) -> Self {
        Self { source, cache }
    }

    /// Serve one metric request.
    ///
    /// With `bypass_cache` the lookup is skipped and the maintainer is
    /// always consulted; the result is still never persisted here.
    pub async fn get_data(
        &self,
        system: &str,
        metric: &str,
        range: TimeRange,
        query: &MetricQuery,
        bypass_cache: bool,
    ) -> EngineResult<VariantMatrix> {
        if !self.source.handles_system(system) {
            return Err(SourceError::UnhandledSystem { system: system.to_string() }.into());
        }

        let key = query.cache_key(system, metric);

        if !bypass_cache {
            if let Some(entry) = self.cache.load_entry(&key)? {
                if let Some(coverage) = entry.coverage() {
                    if coverage.from <= range.from {
                        trace!(target: "sanwatch::cache", key = %key, "cache HIT");
                        return Ok(VariantMatrix {
                            variants: entry.variants,
                            units: entry.units,
                            data: self.cache.rows_in(&key, range)?,
                        });
                    }
                }
            }
            warn!(target: "sanwatch::cache", key = %key, "cache MISS");
        }

        // Custom selector expansion rewrites the metric and pins variants
        let mut metric = metric.to_string();
        let mut variants = query.variants.clone();
        let selector = CUSTOM_METRIC_RE
            .captures(&metric)
            .map(|caps| (caps[1].to_string(), caps[2].to_string(), caps[3].to_string()));
        if let Some((bare_metric, mode, parameter)) = selector {
            let parameter = parameter.as_str();
            metric = bare_metric;
            match mode.as_str() {
                "pool" => {
                    let pools = self.source.pool_info(system).await?;
                    let pool = pools.get(parameter).ok_or_else(|| SourceError::UnknownPool {
                        system: system.to_string(),
                        pool: parameter.to_string(),
                    })?;
                    let mut expanded: Vec<String> = pool
                        .ldevs
                        .iter()
                        .map(|ldev| format!("{}X", ldev.to_uppercase()))
                        .collect();

                    // A requested filter narrows the expansion through the
                    // maintainer's own ranking
                    if let Some(filter) = &query.filter {
                        expanded = self
                            .source
                            .recommend_variants(
                                system,
                                &metric,
                                range,
                                &VariantQuery {
                                    filter: Some(filter.clone()),
                                    variants: Some(expanded),
                                },
                            )
                            .await?;
                    }
                    variants = Some(expanded);
                }
                other => {
                    return Err(SourceError::UnknownSelectorMode { mode: other.to_string() }.into())
                }
            }
        }

        let map_token = query.map.as_deref().map(MapToken::parse).transpose()?;
        let filter_token = query.filter.as_deref().map(FilterToken::parse).transpose()?;

        // sum/avg with no filter delegates the reduction to the maintainer
        if let Some(token) = map_token {
            if token.is_delegable() && filter_token.is_none() {
                let matrix = self
                    .source
                    .fetch_data(
                        system,
                        &metric,
                        range,
                        &FetchQuery { variants, op: query.map.clone() },
                    )
                    .await?;
                return Ok(matrix);
            }
        }

        let raw = self
            .source
            .fetch_data(system, &metric, range, &FetchQuery { variants, op: None })
            .await?;

        Ok(apply_pipeline(raw, filter_token, map_token))
    }
}

// ============================================================================
// SECTION 17: PRECACHE SCHEDULER
// ============================================================================
// Background crawler keeping the cache warm:
// - Walks every handled system whose maintainer answers the reachability
//   probe, with a bounded worker pool draining a task queue
// - Per system, the catalog definitions run strictly in order, so a later
//   definition always observes the persisted effects of earlier ones
// - Per definition: availability check, variant resolution, reconciliation
//   against the entry's coverage, slice fetches, down-sampling, transform,
//   delete-overlap + insert + coverage union
// - A failing definition is logged with its cache key and never aborts the
//   rest of the pass
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 Pass Accounting
// ----------------------------------------------------------------------------

/// Shared counters of one precache pass.
#[derive(Debug, Default)]
struct PassStats {
    systems: AtomicUsize,
    unreachable: AtomicUsize,
    refreshed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    rows_written: AtomicU64,
}

/// Outcome of one completed precache pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PassSummary {
    /// Systems visited
    pub systems: usize,
    /// Systems skipped because their maintainer was unreachable
    pub unreachable: usize,
    /// Definitions that wrote fresh rows
    pub refreshed: usize,
    /// Definitions skipped (no data, out of window, already current)
    pub skipped: usize,
    /// Definitions that failed and were logged
    pub failed: usize,
    /// Total rows written
    pub rows_written: u64,
}

impl PassStats {
    fn summarize(&self) -> PassSummary {
        PassSummary {
            systems: self.systems.load(AtomicOrdering::Relaxed),
            unreachable: self.unreachable.load(AtomicOrdering::Relaxed),
            refreshed: self.refreshed.load(AtomicOrdering::Relaxed),
            skipped: self.skipped.load(AtomicOrdering::Relaxed),
            failed: self.failed.load(AtomicOrdering::Relaxed),
            rows_written: self.rows_written.load(AtomicOrdering::Relaxed),
        }
    }
}

/// What refreshing one definition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    /// Fresh rows were written
    Refreshed { rows: usize },
    /// The maintainer has no data for the metric yet
    SkippedNoData,
    /// The refresh window starts after the newest available data
    SkippedOutOfWindow,
    /// The cached coverage already reaches the availability boundary
    SkippedUpToDate,
}

// ----------------------------------------------------------------------------
// 17.2 The Scheduler
// ----------------------------------------------------------------------------

/// Bounded-concurrency precache crawler over the fixed metric catalog.
pub struct PrecacheScheduler {
    source: Arc<dyn MetricSource>,
    reader: Arc<CacheReader>,
    cache: CacheStore,
    config: PrecacheConfig,
    /// Worker pool size for one pass
    workers: usize,
    /// Systems with a refresh currently in flight; a second refresh of the
    /// same system is a no-op while the first one runs
    in_flight: DashMap<String, ()>,
    catalog: &'static [MetricDefinition],
}

impl fmt::Debug for PrecacheScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrecacheScheduler")
            .field("workers", &self.workers)
            .field("catalog", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl PrecacheScheduler {
    pub fn new(
        source: Arc<dyn MetricSource>,
        reader: Arc<CacheReader>,
        cache: CacheStore,
        config: PrecacheConfig,
        workers: usize,
    ) -> Self {
        Self {
            source,
            reader,
            cache,
            config,
            workers: workers.clamp(MIN_PRECACHE_WORKERS, MAX_PRECACHE_WORKERS),
            in_flight: DashMap::new(),
            catalog: PRECACHE_CATALOG,
        }
    }

    /// Override the catalog (tests exercise small synthetic catalogs).
    #[cfg(test)]
    fn with_catalog(mut self, catalog: &'static [MetricDefinition]) -> Self {
        self.catalog = catalog;
        self
    }

    /// Run one full precache pass across all handled systems.
    ///
    /// Systems are pushed into a queue drained by a fixed pool of workers;
    /// completion is the join of all workers. The pass always completes, no
    /// matter how many definitions fail.
    pub async fn run_pass(self: &Arc<Self>) -> PassSummary {
        let window_start = self.config.window_start();
        let systems = self.source.handled_systems();
        let stats = Arc::new(PassStats::default());

        info!(
            target: "sanwatch::precache",
            systems = systems.len(),
            workers = self.workers,
            window_start = %window_start,
            "Starting precache pass"
        );
        let started = std::time::Instant::now();

        let (tx, rx) = flume::unbounded::<String>();
        for system in systems {
            let _ = tx.send(system);
        }
        drop(tx);

        let mut pool = JoinSet::new();
        for _ in 0..self.workers {
            let rx = rx.clone();
            let scheduler = Arc::clone(self);
            let stats = Arc::clone(&stats);
            let window_start = window_start;
            pool.spawn(async move {
                while let Ok(system) = rx.recv_async().await {
                    scheduler.prefetch_system(&system, window_start, &stats).await;
                }
            });
        }
        while pool.join_next().await.is_some() {}

        let summary = stats.summarize();
        info!(
            target: "sanwatch::precache",
            elapsed_ms = started.elapsed().as_millis() as u64,
            systems = summary.systems,
            unreachable = summary.unreachable,
            refreshed = summary.refreshed,
            skipped = summary.skipped,
            failed = summary.failed,
            rows = summary.rows_written,
            "Precache pass finished"
        );
        summary
    }

    /// Refresh one system outside a full pass (update notifications land
    /// here). Idempotent and safe to call concurrently.
    pub async fn refresh_system(&self, system: &str) -> PassSummary {
        let stats = PassStats::default();
        self.prefetch_system(system, self.config.window_start(), &stats).await;
        stats.summarize()
    }

    /// Refresh every catalog definition for one system, sequentially and in
    /// catalog order.
    async fn prefetch_system(&self, system: &str, window_start: MinuteStamp, stats: &PassStats) {
        if !self.source.status(system).await {
            warn!(
                target: "sanwatch::precache",
                system,
                "Skipping precache: maintainer unavailable"
            );
            stats.unreachable.fetch_add(1, AtomicOrdering::Relaxed);
            return;
        }

        match self.in_flight.entry(system.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(target: "sanwatch::precache", system, "Refresh already in flight");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        stats.systems.fetch_add(1, AtomicOrdering::Relaxed);
        let started = std::time::Instant::now();

        for definition in self.catalog {
            let key = definition.cache_key(system);
            let def_started = std::time::Instant::now();

            match self.refresh_definition(system, definition, window_start).await {
                Ok(RefreshOutcome::Refreshed { rows }) => {
                    stats.refreshed.fetch_add(1, AtomicOrdering::Relaxed);
                    stats.rows_written.fetch_add(rows as u64, AtomicOrdering::Relaxed);
                    debug!(
                        target: "sanwatch::precache",
                        key = %key,
                        rows,
                        elapsed_ms = def_started.elapsed().as_millis() as u64,
                        "Refreshed cache entry"
                    );
                }
                Ok(outcome) => {
                    stats.skipped.fetch_add(1, AtomicOrdering::Relaxed);
                    trace!(target: "sanwatch::precache", key = %key, ?outcome, "Skipped");
                }
                Err(err) => {
                    stats.failed.fetch_add(1, AtomicOrdering::Relaxed);
                    error!(
                        target: "sanwatch::precache",
                        key = %key,
                        category = err.category(),
                        error = %err,
                        "Failed to precache definition"
                    );
                }
            }
        }

        info!(
            target: "sanwatch::precache",
            system,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "System precache finished"
        );
        self.in_flight.remove(system);
    }

    /// Refresh one catalog definition for one system.
    async fn refresh_definition(
        &self,
        system: &str,
        definition: &MetricDefinition,
        window_start: MinuteStamp,
    ) -> EngineResult<RefreshOutcome> {
        let key = definition.cache_key(system);

        // 1. Availability boundary
        let info = self.source.dataset_info(system, definition.metric).await?;
        let Some(boundary) = info.latest_boundary() else {
            return Ok(RefreshOutcome::SkippedNoData);
        };
        if window_start > boundary {
            return Ok(RefreshOutcome::SkippedOutOfWindow);
        }
        let requested = TimeRange::new(window_start, boundary);

        // Entry already reaching the boundary needs nothing
        if let Some(entry) = self.cache.load_entry(&key)? {
            if let Some(coverage) = entry.coverage() {
                if coverage.to >= boundary {
                    return Ok(RefreshOutcome::SkippedUpToDate);
                }
            }
        }

        // 2. Variant resolution; the entry serializes the map's synthetic
        //    column when one is configured
        let mut underlying = self
            .source
            .recommend_variants(
                system,
                definition.metric,
                requested,
                &VariantQuery {
                    filter: definition.filter.map(String::from),
                    variants: None,
                },
            )
            .await?;
        underlying.sort();
        let entry_variants: Vec<String> = match definition.map {
            Some(map) => vec![map.to_string()],
            None => underlying.clone(),
        };

        // 3. Entry load/create; a changed variant set resets coverage
        let entry = self.cache.ensure_entry(&key, &entry_variants, &info.units)?;

        // 4. Reconcile; chunked definitions re-reconcile each week slice
        //    against the coverage as it advances
        let plan = reconcile(requested, entry.coverage());
        if plan.is_nothing() {
            return Ok(RefreshOutcome::SkippedUpToDate);
        }
        let mut windows: Vec<TimeRange> = Vec::new();
        for slice in &plan.slices {
            if definition.chunked {
                let mut chunks = slice.split_minutes(PRECACHE_CHUNK_MINUTES);
                // A slice in front of the existing coverage is chunked from
                // the coverage edge outward; the stored coverage must never
                // claim a gap that was not fetched yet.
                if matches!(entry.coverage(), Some(cov) if slice.to <= cov.from) {
                    chunks.reverse();
                }
                windows.extend(chunks);
            } else {
                windows.push(*slice);
            }
        }

        // 5. Fetch, transform, replace, extend
        let mut rows_written = 0usize;
        for window in windows {
            let current = self.cache.load_entry(&key)?.and_then(|e| e.coverage());
            for slice in reconcile(window, current).slices {
                rows_written += self.fetch_slice(system, definition, &key, slice, &underlying).await?;
            }
        }

        Ok(RefreshOutcome::Refreshed { rows: rows_written })
    }

    /// Fetch one slice, apply the definition's transforms, and swap it into
    /// the store.
    async fn fetch_slice(
        &self,
        system: &str,
        definition: &MetricDefinition,
        key: &CacheKey,
        slice: TimeRange,
        underlying: &[String],
    ) -> EngineResult<usize> {
        let query = MetricQuery {
            map: definition.map.map(String::from),
            filter: definition.filter.map(String::from),
            variants: Some(underlying.to_vec()),
        };
        let mut matrix = self
            .reader
            .get_data(system, definition.metric, slice, &query, true)
            .await?;

        if let Some(resolution) = definition.resolution_secs {
            matrix.downsample(resolution);
        }

        self.cache.delete_rows_in(key, slice)?;
        let written = self.cache.insert_rows(key, &matrix.data)?;
        self.cache.extend_coverage(key, slice)?;
        Ok(written)
    }
}

// ============================================================================
// SECTION 18: PHASE 4 TESTS
// ============================================================================


// ============================================================================
// SECTION 19: ENGINE WIRING
// ============================================================================
// Explicit constructor-based wiring of all collaborators. No container, no
// reflection: the database opens first, the stores wrap it, the maintainer
// client wraps the HTTP config, and the scheduler/reader receive everything
// they need by hand.
// ============================================================================

/// The assembled engine.
pub struct Engine {
    config: EngineConfig,
    db: Database,
    tree: EntityTreeStore,
    cache: CacheStore,
    source: Arc<MaintainerClient>,
    reader: Arc<CacheReader>,
    scheduler: Arc<PrecacheScheduler>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("instance", &self.config.engine.instance_name)
            .field("systems", &self.config.source.systems.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build the engine from its configuration.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let db = Database::open(
            &config.storage.database_path,
            config.storage.busy_timeout_ms,
        )?;
        let tree = EntityTreeStore::new(db.clone());
        let cache = CacheStore::new(db.clone());

        let source = Arc::new(MaintainerClient::new(&config.source)?);
        let dyn_source: Arc<dyn MetricSource> = source.clone();

        let reader = Arc::new(CacheReader::new(dyn_source.clone(), cache.clone()));
        let scheduler = Arc::new(PrecacheScheduler::new(
            dyn_source,
            reader.clone(),
            cache.clone(),
            config.precache.clone(),
            config.effective_worker_count(),
        ));

        Ok(Self { config, db, tree, cache, source, reader, scheduler })
    }

    /// The hierarchy store
    pub fn tree(&self) -> &EntityTreeStore {
        &self.tree
    }

    /// The cache-aware read path
    pub fn reader(&self) -> &Arc<CacheReader> {
        &self.reader
    }

    /// The precache scheduler
    pub fn scheduler(&self) -> &Arc<PrecacheScheduler> {
        &self.scheduler
    }

    /// The maintainer client (also the update-event publisher)
    pub fn source(&self) -> &Arc<MaintainerClient> {
        &self.source
    }

    /// Run the engine: one initial precache pass, then react to maintainer
    /// update notifications until ctrl-c.
    pub async fn run(&self) -> EngineResult<()> {
        let mut events = self.source.subscribe();

        if self.config.precache.enabled {
            let summary = self.scheduler.run_pass().await;
            info!(
                target: "sanwatch::engine",
                refreshed = summary.refreshed,
                failed = summary.failed,
                "Initial precache pass complete"
            );
        } else {
            info!(target: "sanwatch::engine", "Precaching disabled by configuration");
        }

        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!(target: "sanwatch::engine", "Shutdown signal received");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) if event.kind == SourceEventKind::Performance => {
                        debug!(
                            target: "sanwatch::engine",
                            system = %event.system,
                            "Performance data updated; refreshing"
                        );
                        self.scheduler.refresh_system(&event.system).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // At-least-once delivery: treat the lag as a resync
                        warn!(
                            target: "sanwatch::engine",
                            missed,
                            "Update events lagged; running a full pass"
                        );
                        self.scheduler.run_pass().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }
}

// ============================================================================
// SECTION 20: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// SanWatch Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "sanwatch",
    author = "SanWatch Team",
    version,
    about = "Storage-array metric collection and cache engine",
    long_about = "SanWatch Engine mirrors storage-array performance metrics from \
                  maintainer analytics backends into a local cache, maintains the \
                  typed hardware hierarchy, and serves aggregated time-series views."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "sanwatch.toml", env = "SANWATCH_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "SANWATCH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "SANWATCH_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    let config = EngineConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    println!("Configuration OK: {}", path.display());
    if verbose {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

// ============================================================================
// SECTION 21: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the SanWatch engine
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        eprintln!(
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
        EngineConfig::default()
    };

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    // Initialize logging
    init_logging(&logging_config)?;

    info!("🛰  {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let engine = Engine::new(config)?;
    engine.run().await?;

    Ok(())
}

// ============================================================================
// SECTION 22: PHASE 5 TESTS
// ============================================================================

#[cfg(test)]
mod phase5_tests {
    use super::*;

    fn engine_config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.storage.database_path = dir.join("engine.db");
        config
            .source
            .systems
            .insert("XP512".into(), "http://127.0.0.1:9/".into());
        config.precache.max_parallel = 1;
        config
    }

    #[tokio::test]
    async fn test_engine_wires_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(engine_config(dir.path())).unwrap();

        // The tree store is live behind the same database
        let dc = engine
            .tree()
            .create(&CreateEntityRequest {
                name: "CZ_Chodov".into(),
                entity_type: StorageEntityType::Datacenter,
                parent_id: None,
                serial_number: None,
            })
            .unwrap();
        assert_eq!(engine.tree().get(dc.id).unwrap().name, "CZ_Chodov");

        // The source client recognizes configured systems only
        assert!(engine.source().handles_system("XP512"));
        assert!(!engine.source().handles_system("GHOST"));
        assert_eq!(engine.source().handled_systems(), vec!["XP512".to_string()]);
    }

    #[tokio::test]
    async fn test_update_events_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(engine_config(dir.path())).unwrap();

        let mut events = engine.source().subscribe();
        engine.source().notify(SourceEvent {
            system: "XP512".into(),
            kind: SourceEventKind::Performance,
        });

        let received = events.recv().await.unwrap();
        assert_eq!(received.system, "XP512");
        assert_eq!(received.kind, SourceEventKind::Performance);
    }

    #[tokio::test]
    async fn test_unreachable_maintainer_probe_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(engine_config(dir.path())).unwrap();
        // Port 9 (discard) never answers: the probe must come back false
        assert!(!engine.source().status("XP512").await);
        assert!(!engine.source().status("GHOST").await);
    }
}
