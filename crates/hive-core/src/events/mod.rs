//! Typed topics and payloads carried by the [`EventBus`].
//!
//! Topics are partitioned by a coarse [`Category`] plus a kind; each topic has
//! exactly one payload shape, expressed as a variant of [`Event`]. Publishing
//! derives the topic from the payload, so a payload can never travel under
//! the wrong topic.

mod bus;

pub use bus::*;

use crate::config::Setting;
use crate::input::Button;
use crate::radio::LinkStats;
use crate::sensors::ReadingBatch;

/// Coarse topic partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Sensor,
    Config,
    RadioStats,
    Storage,
    Uplink,
    Input,
}

impl Category {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Config => "config",
            Self::RadioStats => "radio-stats",
            Self::Storage => "storage",
            Self::Uplink => "uplink",
            Self::Input => "input",
        }
    }
}

/// A (category, kind) pair handlers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// "sensor/count": number of sensors found by the startup scan
    SensorCount,
    /// "sensor/readings": one averaged batch per sampling cycle
    SensorReadings,
    /// "config/changed"
    ConfigChanged,
    /// "radio-stats/link"
    LinkStats,
    /// "storage/readiness"
    StorageReadiness,
    /// "uplink/readiness"
    UplinkReadiness,
    /// "input/button"
    ButtonPressed,
}

impl Topic {
    pub const fn category(self) -> Category {
        match self {
            Self::SensorCount | Self::SensorReadings => Category::Sensor,
            Self::ConfigChanged => Category::Config,
            Self::LinkStats => Category::RadioStats,
            Self::StorageReadiness => Category::Storage,
            Self::UplinkReadiness => Category::Uplink,
            Self::ButtonPressed => Category::Input,
        }
    }

    pub const fn kind(self) -> &'static str {
        match self {
            Self::SensorCount => "count",
            Self::SensorReadings => "readings",
            Self::ConfigChanged => "changed",
            Self::LinkStats => "link",
            Self::StorageReadiness | Self::UplinkReadiness => "readiness",
            Self::ButtonPressed => "button",
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.category().label(), self.kind())
    }
}

/// Component that reports readiness to the wake/sleep controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessSource {
    SdCard,
    Uplink,
}

/// How a readiness source finished its work for this wake period.
///
/// The sleep controller treats both outcomes alike: the source will not
/// produce more work before sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Done,
    Unrecoverable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessSignal {
    pub source: ReadinessSource,
    pub outcome: ReadinessOutcome,
}

impl ReadinessSignal {
    pub const fn new(source: ReadinessSource, outcome: ReadinessOutcome) -> Self {
        Self { source, outcome }
    }
}

/// Payload of every topic on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SensorCount(usize),
    SensorReadings(ReadingBatch),
    ConfigChanged(Setting),
    LinkStats(LinkStats),
    Readiness(ReadinessSignal),
    ButtonPressed(Button),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::SensorCount(_) => Topic::SensorCount,
            Self::SensorReadings(_) => Topic::SensorReadings,
            Self::ConfigChanged(_) => Topic::ConfigChanged,
            Self::LinkStats(_) => Topic::LinkStats,
            Self::Readiness(signal) => match signal.source {
                ReadinessSource::SdCard => Topic::StorageReadiness,
                ReadinessSource::Uplink => Topic::UplinkReadiness,
            },
            Self::ButtonPressed(_) => Topic::ButtonPressed,
        }
    }
}
