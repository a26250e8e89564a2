use alloc::vec::Vec;

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use log::{debug, info, warn};

use super::{RawValues, ReadingBatch, SensorDriver, SensorError, SensorId};
use crate::config::DutyCycleConfig;
use crate::events::{Event, EventBus};

/// Per-sensor sums for one oversampling cycle.
///
/// `u32` holds `u16::MAX` sub-samples of `u16::MAX`, far beyond any
/// configured oversample count.
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    humidity: u32,
    temperature: u32,
    samples: u32,
    last: Option<RawValues>,
}

impl Accumulator {
    fn add(&mut self, raw: RawValues) {
        self.humidity += raw.humidity as u32;
        self.temperature += raw.temperature as u32;
        self.samples += 1;
        self.last = Some(raw);
    }

    /// A missed sub-sample repeats the last value read in this cycle.
    fn hold_last(&mut self) {
        if let Some(raw) = self.last {
            self.add(raw);
        }
    }

    /// Truncating average, `None` if the sensor never answered.
    fn average(&self) -> Option<RawValues> {
        if self.samples == 0 {
            return None;
        }
        Some(RawValues {
            humidity: (self.humidity / self.samples) as u16,
            temperature: (self.temperature / self.samples) as u16,
        })
    }
}

/// Oversamples every discovered sensor and emits one averaged batch per wake.
///
/// ## Algorithm
///
/// For `oversample_count` rounds spaced by `sample_spacing`, read the raw
/// words of every sensor and add them to per-sensor sums. Afterwards divide
/// by the number of contributions (truncating) and convert to engineering
/// units through the driver.
///
/// The sensor set is fixed by [`SensorAggregator::discover`]. A sensor that
/// misses a sub-sample contributes its last value of the cycle instead; a
/// sensor that never answers in a cycle is left out of that batch.
pub struct SensorAggregator<S, D> {
    driver: S,
    delay: D,
    sensors: Vec<SensorId>,
    oversample_count: u16,
    sample_spacing: Duration,
}

impl<S: SensorDriver, D: DelayNs> SensorAggregator<S, D> {
    /// Scan for sensors and announce how many were found on `sensor/count`.
    ///
    /// Zero sensors is not an error; only a missing sensor bus is.
    pub async fn discover(
        mut driver: S,
        delay: D,
        config: &DutyCycleConfig,
        bus: &EventBus,
    ) -> Result<Self, SensorError> {
        let sensors = driver.scan().await?;
        info!("Discovered {} sensors", sensors.len());
        bus.notify(Event::SensorCount(sensors.len()));

        Ok(Self {
            driver,
            delay,
            sensors,
            oversample_count: config.oversample_count.max(1),
            sample_spacing: config.sample_spacing,
        })
    }

    pub fn sensors(&self) -> &[SensorId] {
        &self.sensors
    }

    /// Run one oversampling cycle and return the averaged batch.
    pub async fn sample(&mut self) -> ReadingBatch {
        let mut sums = alloc::vec![Accumulator::default(); self.sensors.len()];

        for round in 0..self.oversample_count {
            if round > 0 {
                self.delay
                    .delay_us(self.sample_spacing.as_micros() as u32)
                    .await;
            }
            for (sensor, sum) in self.sensors.iter().zip(sums.iter_mut()) {
                match self.driver.read_raw(*sensor).await {
                    Ok(raw) => sum.add(raw),
                    Err(e) => {
                        warn!("Sub-sample {} of {:?} missed: {}", round, sensor, e);
                        sum.hold_last();
                    }
                }
            }
        }

        let batch: ReadingBatch = self
            .sensors
            .iter()
            .zip(sums.iter())
            .filter_map(|(sensor, sum)| {
                let average = sum.average();
                if average.is_none() {
                    warn!("{:?} did not answer this cycle, omitted", sensor);
                }
                average.map(|raw| self.driver.to_reading(*sensor, raw))
            })
            .collect();

        debug!("Sampled {} of {} sensors", batch.len(), self.sensors.len());
        batch
    }

    /// Sample and publish the batch on `sensor/readings`.
    pub async fn sample_and_publish(&mut self, bus: &EventBus) {
        let batch = self.sample().await;
        bus.notify(Event::SensorReadings(batch));
    }
}
