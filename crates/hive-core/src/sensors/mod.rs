mod aggregator;
pub mod sht3x;

pub use aggregator::*;

use alloc::vec::Vec;
use core::future::Future;
use thiserror_no_std::Error;

/// Errors a sensor driver can report.
///
/// A failed read during sampling is a transient fault: it is logged and the
/// cycle continues with the data that was collected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor}: {operation} failed ({details})")]
    ReadFailed {
        sensor: &'static str,
        operation: &'static str,
        details: &'static str,
    },
    #[error("{sensor}: checksum mismatch in {operation}")]
    Checksum {
        sensor: &'static str,
        operation: &'static str,
    },
    #[error("I2C mux channel {channel} could not be selected for {sensor}: {details}")]
    I2cError {
        sensor: &'static str,
        channel: u8,
        details: &'static str,
    },
    #[error("no usable sensor bus")]
    NoSensorBus,
}

/// Position of one sensor: mux channel and I2C address.
///
/// Unique for the lifetime of one boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SensorId {
    pub bus_id: u8,
    pub address: u8,
}

impl SensorId {
    pub const fn new(bus_id: u8, address: u8) -> Self {
        Self { bus_id, address }
    }
}

/// Raw 16-bit sensor words as delivered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawValues {
    pub humidity: u16,
    pub temperature: u16,
}

/// One sensor's reading for a sampling cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub bus_id: u8,
    pub address: u8,
    pub raw_humidity: u16,
    pub raw_temperature: u16,
    /// Relative humidity in percent
    pub humidity: f32,
    /// Temperature in °C
    pub temperature: f32,
}

impl SensorReading {
    /// Build a reading from raw words using the SHT3x transfer functions.
    pub fn from_raw(sensor: SensorId, raw: RawValues) -> Self {
        Self {
            bus_id: sensor.bus_id,
            address: sensor.address,
            raw_humidity: raw.humidity,
            raw_temperature: raw.temperature,
            humidity: sht3x::humidity_from_raw(raw.humidity),
            temperature: sht3x::temperature_from_raw(raw.temperature),
        }
    }

    pub fn id(&self) -> SensorId {
        SensorId::new(self.bus_id, self.address)
    }

    pub fn raw(&self) -> RawValues {
        RawValues {
            humidity: self.raw_humidity,
            temperature: self.raw_temperature,
        }
    }
}

/// Readings captured within one sampling cycle, in discovery order.
pub type ReadingBatch = Vec<SensorReading>;

/// Driver collaborator for a set of humidity/temperature sensors.
pub trait SensorDriver {
    /// Discover the sensors present. Called once per boot.
    fn scan(&mut self) -> impl Future<Output = Result<Vec<SensorId>, SensorError>>;

    /// Read the raw words of one sensor.
    fn read_raw(
        &mut self,
        sensor: SensorId,
    ) -> impl Future<Output = Result<RawValues, SensorError>>;

    /// Convert averaged raw words to engineering units.
    fn to_reading(&self, sensor: SensorId, raw: RawValues) -> SensorReading {
        SensorReading::from_raw(sensor, raw)
    }
}
