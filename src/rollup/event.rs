//! Raw telemetry events as read from the per-version source collections.
//!
//! A [`RawEvent`] is decoded once per source document and never mutated
//! afterwards. Store adapters are responsible for mapping their wire format
//! onto this type; nothing in the aggregation path depends on BSON.

use chrono::{DateTime, Utc};

/// Screen orientation a heatmap click was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    /// Returns the field name used for this orientation in the sink.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Portrait => "portrait",
            Self::Landscape => "landscape",
        }
    }
}

/// Click coordinates attached to a `click` event.
///
/// `x` and `y` are 1-based grid coordinates as sent by the client; a
/// non-positive `x` marks a landscape click and a non-positive `y` is an
/// offset from the bottom of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeatmapPayload {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl HeatmapPayload {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Orientation is encoded in the sign of the first coordinate.
    pub fn orientation(&self) -> Orientation {
        if self.x > 0 {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        }
    }

    /// Zero-based column. Non-positive `x` collapses to column 0.
    pub fn column(&self) -> i32 {
        if self.x > 0 {
            self.x - 1
        } else {
            0
        }
    }

    /// Row index; non-positive `y` counts back from the grid height.
    pub fn row(&self) -> i32 {
        if self.y > 0 {
            self.y
        } else {
            self.y.saturating_add(self.height)
        }
    }

    /// Linear cell index `column + row * width`.
    pub fn cell(&self) -> i32 {
        self.column()
            .saturating_add(self.row().saturating_mul(self.width))
    }
}

/// One telemetry record from a per-version source collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub version: String,
    pub network: String,
    pub os: String,
    /// Event name as sent by the client (`start`, `click`, ...).
    pub event: String,
    /// Scalar payload: outcome for `end`, click index for `click`, ...
    pub value: f64,
    /// Elapsed seconds since the session started.
    pub time: f64,
    pub session: String,
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub heatmap: Option<HeatmapPayload>,
}

impl RawEvent {
    /// Creates an event with zero value/time and no optional fields set.
    pub fn new(
        version: impl Into<String>,
        network: impl Into<String>,
        event: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            version: version.into(),
            network: network.into(),
            os: String::new(),
            event: event.into(),
            value: 0.0,
            time: 0.0,
            session: String::new(),
            ip: String::new(),
            timestamp,
            heatmap: None,
        }
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn with_heatmap(mut self, heatmap: HeatmapPayload) -> Self {
        self.heatmap = Some(heatmap);
        self
    }
}
