use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::event::RawEvent;

/// Every aggregate covers one UTC day.
pub const DAY_TIMESPAN_MINUTES: i32 = 1440;

/// Separator between the components of an [`AggregationKey`].
const KEY_SEPARATOR: &str = "::";

/// Formats the UTC midnight of `ts` as the fixed day-bucket string.
pub fn day_bucket(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT00:00:00.000+00:00").to_string()
}

/// A raw-event field that can take part in an aggregation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Version,
    Network,
    Os,
}

impl Dimension {
    fn value(self, event: &RawEvent) -> &str {
        match self {
            Self::Version => &event.version,
            Self::Network => &event.network,
            Self::Os => &event.os,
        }
    }
}

/// Key layout chosen per call site in the dispatch table.
///
/// The order only changes how the key renders, never which accumulator it
/// names: two keys built from the same event fields and metric name are
/// equal whatever their order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimensionOrder {
    NetworkVersion,
    VersionNetwork,
    VersionOsNetwork,
}

impl DimensionOrder {
    /// Full dimension list including `os`, which emitted metrics carry last.
    pub fn dimensions(self) -> &'static [Dimension] {
        match self {
            Self::NetworkVersion => &[Dimension::Network, Dimension::Version, Dimension::Os],
            Self::VersionNetwork => &[Dimension::Version, Dimension::Network, Dimension::Os],
            Self::VersionOsNetwork => &[Dimension::Version, Dimension::Os, Dimension::Network],
        }
    }
}

/// Dimension layout that identifies an accumulator. It matches the fields of
/// [`EntryId`], so table entries and sink rows correspond one to one.
const IDENTITY_ORDER: &[Dimension] = &[Dimension::Version, Dimension::Network, Dimension::Os];

fn join_key(dims: &[Dimension], event: &RawEvent, day: &str, name: &str) -> String {
    let mut key = String::with_capacity(
        event.version.len() + event.network.len() + event.os.len() + day.len() + name.len() + 12,
    );
    for dim in dims {
        key.push_str(dim.value(event));
        key.push_str(KEY_SEPARATOR);
    }
    key.push_str(day);
    key.push_str(KEY_SEPARATOR);
    key.push_str(name);
    key
}

/// Composite key identifying one accumulator: dimensions, day, metric name.
///
/// Equality, hashing and ordering use the canonical identity only; the
/// call-site layout is kept for display.
#[derive(Debug, Clone)]
pub struct AggregationKey {
    identity: String,
    layout: String,
}

impl AggregationKey {
    pub fn new(order: DimensionOrder, event: &RawEvent, day: &str, name: &str) -> Self {
        Self {
            identity: join_key(IDENTITY_ORDER, event, day, name),
            layout: join_key(order.dimensions(), event, day, name),
        }
    }

    /// Key string in the call site's dimension order.
    pub fn as_str(&self) -> &str {
        &self.layout
    }

    /// Order-independent key string, `version::network::os::day::name`.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl PartialEq for AggregationKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for AggregationKey {}

impl Hash for AggregationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl PartialOrd for AggregationKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AggregationKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity.cmp(&other.identity)
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.layout)
    }
}

/// Primary key of an aggregate row in the sink (`_id` sub-document).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EntryId {
    pub version: String,
    pub network: String,
    pub event: String,
    pub os: String,
    /// Day bucket, see [`day_bucket`].
    pub timestamp: String,
    #[serde(rename = "timespan")]
    pub timespan_minutes: i32,
}

impl EntryId {
    pub fn new(event: &RawEvent, day: &str, name: &str) -> Self {
        Self {
            version: event.version.clone(),
            network: event.network.clone(),
            event: name.to_string(),
            os: event.os.clone(),
            timestamp: day.to_string(),
            timespan_minutes: DAY_TIMESPAN_MINUTES,
        }
    }
}
