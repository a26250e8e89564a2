//! SHT3x humidity/temperature sensors behind a TCA9548A I2C mux.
//!
//! The mux fans one I2C bus out into eight channels; every channel can carry
//! up to two SHT3x sensors (address pins 0x44 and 0x45). Selecting a channel
//! is a single byte write of the channel bit mask to the mux.

use alloc::vec::Vec;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{debug, info, warn};

use super::{RawValues, SensorDriver, SensorError, SensorId};

pub const MUX_ADDRESS: u8 = 0x70;
pub const MUX_CHANNELS: u8 = 8;
pub const SENSOR_ADDRESSES: [u8; 2] = [0x44, 0x45];

/// Single shot, high repeatability, no clock stretching
const CMD_MEASURE: [u8; 2] = [0x24, 0x00];
const CMD_READ_STATUS: [u8; 2] = [0xF3, 0x2D];
/// Datasheet maximum for a high repeatability measurement
const MEASUREMENT_TIME_US: u32 = 15_500;

/// Relative humidity in percent for a raw word.
pub fn humidity_from_raw(raw: u16) -> f32 {
    100.0 * raw as f32 / 65535.0
}

/// Temperature in °C for a raw word.
pub fn temperature_from_raw(raw: u16) -> f32 {
    -45.0 + 175.0 * raw as f32 / 65535.0
}

/// CRC-8 used by Sensirion: polynomial 0x31, init 0xFF.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFFu8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn checked_word(chunk: &[u8], operation: &'static str) -> Result<u16, SensorError> {
    if crc8(&chunk[..2]) != chunk[2] {
        return Err(SensorError::Checksum {
            sensor: "SHT3x",
            operation,
        });
    }
    Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
}

pub struct Sht3xBus<I, D> {
    i2c: I,
    delay: D,
    selected: Option<u8>,
}

impl<I: I2c, D: DelayNs> Sht3xBus<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        Self {
            i2c,
            delay,
            selected: None,
        }
    }

    async fn select(&mut self, channel: u8) -> Result<(), SensorError> {
        if self.selected == Some(channel) {
            return Ok(());
        }
        self.i2c
            .write(MUX_ADDRESS, &[1 << channel])
            .await
            .map_err(|e| {
                warn!("TCA9548A channel {} select failed: {:?}", channel, e);
                self.selected = None;
                SensorError::I2cError {
                    sensor: "SHT3x",
                    channel,
                    details: "mux did not acknowledge",
                }
            })?;
        self.selected = Some(channel);
        Ok(())
    }

    async fn acknowledges(&mut self, address: u8) -> bool {
        let mut status = [0u8; 3];
        self.i2c
            .write_read(address, &CMD_READ_STATUS, &mut status)
            .await
            .is_ok()
    }
}

impl<I: I2c, D: DelayNs> SensorDriver for Sht3xBus<I, D> {
    async fn scan(&mut self) -> Result<Vec<SensorId>, SensorError> {
        let mut found = Vec::new();
        for channel in 0..MUX_CHANNELS {
            if let Err(e) = self.select(channel).await {
                // Without the mux there is no sensor bus at all.
                if channel == 0 {
                    return Err(SensorError::NoSensorBus);
                }
                warn!("Skipping mux channel {}: {}", channel, e);
                continue;
            }
            for address in SENSOR_ADDRESSES {
                if self.acknowledges(address).await {
                    info!("on bus {} found address: {:x}", channel, address);
                    found.push(SensorId::new(channel, address));
                }
            }
        }
        Ok(found)
    }

    async fn read_raw(&mut self, sensor: SensorId) -> Result<RawValues, SensorError> {
        self.select(sensor.bus_id).await?;

        self.i2c
            .write(sensor.address, &CMD_MEASURE)
            .await
            .map_err(|e| {
                debug!("SHT3x {:?} measure command failed: {:?}", sensor, e);
                SensorError::ReadFailed {
                    sensor: "SHT3x",
                    operation: "start measurement",
                    details: "I2C communication error or sensor not responding",
                }
            })?;

        self.delay.delay_us(MEASUREMENT_TIME_US).await;

        let mut data = [0u8; 6];
        self.i2c
            .read(sensor.address, &mut data)
            .await
            .map_err(|e| {
                debug!("SHT3x {:?} read failed: {:?}", sensor, e);
                SensorError::ReadFailed {
                    sensor: "SHT3x",
                    operation: "read measurement",
                    details: "I2C communication error or sensor not responding",
                }
            })?;

        let temperature = checked_word(&data[0..3], "read temperature")?;
        let humidity = checked_word(&data[3..6], "read humidity")?;

        Ok(RawValues {
            humidity,
            temperature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    /// Mux plus sensors; `sensors` maps (channel, address) to raw words.
    struct FakeBus {
        mux_present: bool,
        channel: Option<u8>,
        sensors: Vec<(SensorId, RawValues)>,
        corrupt: bool,
    }

    impl FakeBus {
        fn with(sensors: &[(SensorId, RawValues)]) -> Self {
            Self {
                mux_present: true,
                channel: None,
                sensors: sensors.to_vec(),
                corrupt: false,
            }
        }

        fn sensor(&self, address: u8) -> Option<RawValues> {
            let channel = self.channel?;
            self.sensors
                .iter()
                .find(|(id, _)| id.bus_id == channel && id.address == address)
                .map(|(_, raw)| *raw)
        }
    }

    impl ErrorType for FakeBus {
        type Error = ErrorKind;
    }

    impl I2c for FakeBus {
        async fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            let nack = ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address);
            if address == MUX_ADDRESS {
                if !self.mux_present {
                    return Err(nack);
                }
                if let Some(Operation::Write(mask)) = operations.first() {
                    self.channel = Some(mask[0].trailing_zeros() as u8);
                }
                return Ok(());
            }

            let raw = self.sensor(address).ok_or(nack)?;
            for operation in operations.iter_mut() {
                if let Operation::Read(buffer) = operation {
                    let t = raw.temperature.to_be_bytes();
                    let h = raw.humidity.to_be_bytes();
                    let mut frame = [t[0], t[1], crc8(&t), h[0], h[1], crc8(&h)];
                    if self.corrupt {
                        frame[2] ^= 0xFF;
                    }
                    let len = buffer.len().min(frame.len());
                    buffer[..len].copy_from_slice(&frame[..len]);
                }
            }
            Ok(())
        }
    }

    fn raw(humidity: u16, temperature: u16) -> RawValues {
        RawValues {
            humidity,
            temperature,
        }
    }

    #[test]
    fn test_crc8_datasheet_vector() {
        // Sensirion datasheet example: 0xBEEF -> 0x92
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn test_transfer_functions() {
        assert_eq!(humidity_from_raw(0), 0.0);
        assert_eq!(humidity_from_raw(65535), 100.0);
        assert_eq!(temperature_from_raw(0), -45.0);
        assert_eq!(temperature_from_raw(65535), 130.0);
    }

    #[test]
    fn test_scan_finds_sensors_on_all_channels() {
        let bus = FakeBus::with(&[
            (SensorId::new(4, 0x44), raw(1, 2)),
            (SensorId::new(5, 0x45), raw(3, 4)),
            (SensorId::new(6, 0x44), raw(5, 6)),
        ]);
        let mut driver = Sht3xBus::new(bus, NoDelay);

        let found = block_on(driver.scan()).unwrap();

        assert_eq!(
            found,
            [
                SensorId::new(4, 0x44),
                SensorId::new(5, 0x45),
                SensorId::new(6, 0x44)
            ]
        );
    }

    #[test]
    fn test_missing_mux_is_fatal() {
        let mut bus = FakeBus::with(&[]);
        bus.mux_present = false;
        let mut driver = Sht3xBus::new(bus, NoDelay);

        assert_eq!(block_on(driver.scan()), Err(SensorError::NoSensorBus));
    }

    #[test]
    fn test_read_raw_selects_channel_and_decodes_words() {
        let bus = FakeBus::with(&[
            (SensorId::new(1, 0x44), raw(0x1234, 0x5678)),
            (SensorId::new(2, 0x44), raw(0x9abc, 0xdef0)),
        ]);
        let mut driver = Sht3xBus::new(bus, NoDelay);

        let second = block_on(driver.read_raw(SensorId::new(2, 0x44))).unwrap();
        let first = block_on(driver.read_raw(SensorId::new(1, 0x44))).unwrap();

        assert_eq!(first, raw(0x1234, 0x5678));
        assert_eq!(second, raw(0x9abc, 0xdef0));
    }

    #[test]
    fn test_corrupt_word_is_reported() {
        let mut bus = FakeBus::with(&[(SensorId::new(0, 0x44), raw(10, 20))]);
        bus.corrupt = true;
        let mut driver = Sht3xBus::new(bus, NoDelay);

        assert!(matches!(
            block_on(driver.read_raw(SensorId::new(0, 0x44))),
            Err(SensorError::Checksum { .. })
        ));
    }
}
