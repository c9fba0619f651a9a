use std::collections::BTreeMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::event::Orientation;

/// The four accumulator shapes an aggregate row can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Counter,
    TimeSum,
    CtaSplit,
    HeatmapGrid,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::TimeSum => "time_sum",
            Self::CtaSplit => "cta_split",
            Self::HeatmapGrid => "heatmap_grid",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which CTA counter a call-to-action event lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtaBucket {
    User,
    Auto,
    Unknown,
}

/// Categorized call-to-action click counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CtaSplit {
    pub user: i64,
    pub auto: i64,
    pub unknown: i64,
}

impl CtaSplit {
    pub fn record(&mut self, bucket: CtaBucket) {
        let slot = match bucket {
            CtaBucket::User => &mut self.user,
            CtaBucket::Auto => &mut self.auto,
            CtaBucket::Unknown => &mut self.unknown,
        };
        *slot = slot.saturating_add(1);
    }
}

/// Second of play → cell index → click count.
pub type GridCounts = BTreeMap<i32, BTreeMap<i32, i64>>;

/// Per-orientation click heatmap.
///
/// Serialized with decimal string keys since document stores only accept
/// string field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeatmapGrid {
    #[serde(serialize_with = "serialize_grid")]
    pub portrait: GridCounts,
    #[serde(serialize_with = "serialize_grid")]
    pub landscape: GridCounts,
}

impl HeatmapGrid {
    pub fn record(&mut self, orientation: Orientation, second: i32, cell: i32) {
        let count = self
            .grid_mut(orientation)
            .entry(second)
            .or_default()
            .entry(cell)
            .or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Count recorded for one cell, 0 when absent.
    pub fn count(&self, orientation: Orientation, second: i32, cell: i32) -> i64 {
        self.grid(orientation)
            .get(&second)
            .and_then(|cells| cells.get(&cell))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of every cell in both orientations.
    pub fn total(&self) -> i64 {
        self.portrait
            .values()
            .chain(self.landscape.values())
            .flat_map(|cells| cells.values())
            .sum()
    }

    pub fn grid(&self, orientation: Orientation) -> &GridCounts {
        match orientation {
            Orientation::Portrait => &self.portrait,
            Orientation::Landscape => &self.landscape,
        }
    }

    fn grid_mut(&mut self, orientation: Orientation) -> &mut GridCounts {
        match orientation {
            Orientation::Portrait => &mut self.portrait,
            Orientation::Landscape => &mut self.landscape,
        }
    }
}

fn serialize_grid<S: Serializer>(grid: &GridCounts, serializer: S) -> Result<S::Ok, S::Error> {
    let mut outer = serializer.serialize_map(Some(grid.len()))?;
    for (second, cells) in grid {
        let cells: BTreeMap<String, i64> = cells
            .iter()
            .map(|(cell, count)| (cell.to_string(), *count))
            .collect();
        outer.serialize_entry(&second.to_string(), &cells)?;
    }
    outer.end()
}

/// A single mutation produced by the aggregation engine.
///
/// The update determines the value kind of a freshly created accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// Plain occurrence count.
    Count,
    /// Add whole seconds to a time sum.
    AddTime(i64),
    Cta(CtaBucket),
    Heat {
        orientation: Orientation,
        second: i32,
        cell: i32,
    },
}

impl Update {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Count => ValueKind::Counter,
            Self::AddTime(_) => ValueKind::TimeSum,
            Self::Cta(_) => ValueKind::CtaSplit,
            Self::Heat { .. } => ValueKind::HeatmapGrid,
        }
    }
}

/// Accumulated value of one aggregate row.
///
/// Counters and time sums serialize as bare integers, the structured kinds
/// as sub-documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AccumulatorValue {
    Counter(i64),
    TimeSum(i64),
    CtaSplit(CtaSplit),
    HeatmapGrid(HeatmapGrid),
}

impl AccumulatorValue {
    /// Empty accumulator of the given kind.
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Counter => Self::Counter(0),
            ValueKind::TimeSum => Self::TimeSum(0),
            ValueKind::CtaSplit => Self::CtaSplit(CtaSplit::default()),
            ValueKind::HeatmapGrid => Self::HeatmapGrid(HeatmapGrid::default()),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Counter(_) => ValueKind::Counter,
            Self::TimeSum(_) => ValueKind::TimeSum,
            Self::CtaSplit(_) => ValueKind::CtaSplit,
            Self::HeatmapGrid(_) => ValueKind::HeatmapGrid,
        }
    }

    /// Scalar value for counters and time sums.
    pub fn as_scalar(&self) -> Option<i64> {
        match self {
            Self::Counter(n) | Self::TimeSum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_cta_split(&self) -> Option<&CtaSplit> {
        match self {
            Self::CtaSplit(split) => Some(split),
            _ => None,
        }
    }

    pub fn as_heatmap(&self) -> Option<&HeatmapGrid> {
        match self {
            Self::HeatmapGrid(grid) => Some(grid),
            _ => None,
        }
    }

    /// Applies `update` in place. Returns false, leaving the value untouched,
    /// when the update belongs to a different kind.
    pub fn apply(&mut self, update: Update) -> bool {
        match (self, update) {
            (Self::Counter(n), Update::Count) => {
                *n = n.saturating_add(1);
            }
            (Self::TimeSum(n), Update::AddTime(secs)) => {
                *n = n.saturating_add(secs);
            }
            (Self::CtaSplit(split), Update::Cta(bucket)) => {
                split.record(bucket);
            }
            (
                Self::HeatmapGrid(grid),
                Update::Heat {
                    orientation,
                    second,
                    cell,
                },
            ) => {
                grid.record(orientation, second, cell);
            }
            _ => return false,
        }
        true
    }
}
