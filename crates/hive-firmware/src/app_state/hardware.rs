//! Hardware initialization for the TTGO LoRa32 board
//!
//! Pin assignment:
//! - I2C0 (SHT3x sensors behind the TCA9548A mux): SDA GPIO21, SCL GPIO22
//! - SPI2 (RFM95): SCK GPIO5, MOSI GPIO27, MISO GPIO19, CS GPIO18,
//!   RESET GPIO23, DIO0 GPIO26
//! - SPI3 (SD card): SCK GPIO14, MOSI GPIO15, MISO GPIO2, CS GPIO13
//! - BOOT button GPIO0, mode switch GPIO34

use esp_hal::efuse::Efuse;
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use esp_hal::{Async, Blocking};

use embedded_sdmmc::{TimeSource, Timestamp};
use hive_core::storage::sd_card::SdCardStore;

/// The station MAC, which selects the radio role.
pub fn hardware_id() -> [u8; 6] {
    Efuse::read_base_mac_address()
}

/// Initialize the I2C bus the sensor mux hangs off
pub fn create_i2c_bus(
    i2c0: esp_hal::peripherals::I2C0<'static>,
    sda: esp_hal::peripherals::GPIO21<'static>,
    scl: esp_hal::peripherals::GPIO22<'static>,
) -> I2c<'static, Async> {
    I2c::new(
        i2c0,
        I2cConfig::default().with_frequency(Rate::from_khz(100)),
    )
    .unwrap()
    .with_sda(sda)
    .with_scl(scl)
    .into_async()
}

/// Initialize the SPI bus of the LoRa transceiver
pub fn create_lora_spi(
    spi2: esp_hal::peripherals::SPI2<'static>,
    sck: esp_hal::peripherals::GPIO5<'static>,
    mosi: esp_hal::peripherals::GPIO27<'static>,
    miso: esp_hal::peripherals::GPIO19<'static>,
) -> Spi<'static, Async> {
    Spi::new(
        spi2,
        SpiConfig::default().with_frequency(Rate::from_mhz(8)),
    )
    .unwrap()
    .with_sck(sck)
    .with_mosi(mosi)
    .with_miso(miso)
    .into_async()
}

/// Initialize the SPI bus of the SD card slot
///
/// Cards must be initialized at 400 kHz or less; `embedded-sdmmc` does all
/// of its work at this rate.
pub fn create_sd_card_spi(
    spi3: esp_hal::peripherals::SPI3<'static>,
    sck: esp_hal::peripherals::GPIO14<'static>,
    mosi: esp_hal::peripherals::GPIO15<'static>,
    miso: esp_hal::peripherals::GPIO2<'static>,
) -> Spi<'static, Blocking> {
    Spi::new(
        spi3,
        SpiConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .unwrap()
    .with_sck(sck)
    .with_mosi(mosi)
    .with_miso(miso)
}

/// Initialize the dataset log store on the SD card
///
/// # Type Parameters
/// - `S`: The SPI device type for the SD card
/// - `D`: The delay implementation type
pub fn init_sd_card<S, D>(sd_card_spi: S, delay: D) -> SdCardStore<S, D, BootClock>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
{
    SdCardStore::new(embedded_sdmmc::SdCard::new(sd_card_spi, delay), BootClock)
}

/// The node has no wall clock, so every file carries the same timestamp.
/// Datasets are ordered by their counter, not by file times.
pub struct BootClock;

impl TimeSource for BootClock {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 52,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}
