//! RFM95 / SX1276 LoRa transceiver over SPI
//!
//! Packet mode with explicit header and CRC, 868 MHz, 125 kHz bandwidth,
//! coding rate 4/5, spreading factor 7. The DIO0 line signals TxDone and
//! RxDone; everything else is polled from the IRQ flag register.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::spi::{Operation, SpiDevice};
use log::{debug, info, warn};
use thiserror_no_std::Error;

use hive_core::radio::{Radio, TxPower};

const REG_FIFO: u8 = 0x00;
const REG_OP_MODE: u8 = 0x01;
const REG_FRF_MSB: u8 = 0x06;
const REG_PA_CONFIG: u8 = 0x09;
const REG_FIFO_ADDR_PTR: u8 = 0x0D;
const REG_FIFO_TX_BASE_ADDR: u8 = 0x0E;
const REG_FIFO_RX_BASE_ADDR: u8 = 0x0F;
const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;
const REG_IRQ_FLAGS: u8 = 0x12;
const REG_RX_NB_BYTES: u8 = 0x13;
const REG_PKT_SNR: u8 = 0x19;
const REG_PKT_RSSI: u8 = 0x1A;
const REG_MODEM_CONFIG_1: u8 = 0x1D;
const REG_MODEM_CONFIG_2: u8 = 0x1E;
const REG_PREAMBLE_MSB: u8 = 0x20;
const REG_PAYLOAD_LENGTH: u8 = 0x22;
const REG_MODEM_CONFIG_3: u8 = 0x26;
const REG_DIO_MAPPING_1: u8 = 0x40;
const REG_VERSION: u8 = 0x42;
const REG_PA_DAC: u8 = 0x4D;

const MODE_LONG_RANGE: u8 = 0x80;
const MODE_SLEEP: u8 = 0x00;
const MODE_STDBY: u8 = 0x01;
const MODE_TX: u8 = 0x03;
const MODE_RX_CONTINUOUS: u8 = 0x05;

const IRQ_RX_DONE: u8 = 0x40;
const IRQ_CRC_ERROR: u8 = 0x20;
const IRQ_TX_DONE: u8 = 0x08;

const DIO0_RX_DONE: u8 = 0x00;
const DIO0_TX_DONE: u8 = 0x40;

const WRITE_FLAG: u8 = 0x80;
const SILICON_VERSION: u8 = 0x12;
/// Hardware FIFO size in LoRa mode
const MAX_PAYLOAD: usize = 255;

pub const FREQUENCY_HZ: u32 = 868_000_000;
const OSCILLATOR_HZ: u64 = 32_000_000;

#[derive(Error, Debug)]
pub enum Rf95Error<E> {
    #[error("SPI transfer failed: {0:?}")]
    Spi(E),
    #[error("DIO0 line failed")]
    Interrupt,
    #[error("unexpected silicon version {0:#04x}")]
    Version(u8),
    #[error("packet of {0} bytes does not fit the FIFO")]
    PacketTooLong(usize),
}

pub struct Rf95<S, P, I> {
    spi: S,
    reset: P,
    dio0: I,
}

impl<S, P, I> Rf95<S, P, I>
where
    S: SpiDevice,
    P: OutputPin,
    I: Wait,
{
    pub fn new(spi: S, reset: P, dio0: I) -> Self {
        Self { spi, reset, dio0 }
    }

    /// Reset the chip, check it is an SX127x and configure the modem.
    pub async fn init<D: DelayNs>(
        &mut self,
        delay: &mut D,
        power: TxPower,
    ) -> Result<(), Rf95Error<S::Error>> {
        let _ = self.reset.set_low();
        delay.delay_ms(1).await;
        let _ = self.reset.set_high();
        delay.delay_ms(10).await;

        let version = self.read(REG_VERSION).await?;
        if version != SILICON_VERSION {
            return Err(Rf95Error::Version(version));
        }

        // LoRa mode can only be selected while sleeping
        self.write(REG_OP_MODE, MODE_LONG_RANGE | MODE_SLEEP).await?;
        delay.delay_ms(10).await;

        // Whole FIFO for either direction, never both at once
        self.write(REG_FIFO_TX_BASE_ADDR, 0).await?;
        self.write(REG_FIFO_RX_BASE_ADDR, 0).await?;
        self.set_mode(MODE_STDBY).await?;

        // Bw 125 kHz, Cr 4/5, explicit header; Sf 7, CRC on; AGC on
        self.write(REG_MODEM_CONFIG_1, 0x72).await?;
        self.write(REG_MODEM_CONFIG_2, 0x74).await?;
        self.write(REG_MODEM_CONFIG_3, 0x04).await?;
        self.write_burst(REG_PREAMBLE_MSB, &[0x00, 0x08]).await?;
        self.set_frequency(FREQUENCY_HZ).await?;
        self.apply_power(power).await?;

        info!(
            "RF95 ready at {} MHz, {} dBm",
            FREQUENCY_HZ / 1_000_000,
            power.dbm()
        );
        Ok(())
    }

    async fn set_frequency(&mut self, hz: u32) -> Result<(), Rf95Error<S::Error>> {
        let frf = ((hz as u64) << 19) / OSCILLATOR_HZ;
        self.write_burst(
            REG_FRF_MSB,
            &[(frf >> 16) as u8, (frf >> 8) as u8, frf as u8],
        )
        .await
    }

    /// PA_BOOST output. Above 17 dBm the high power DAC adds 3 dB.
    async fn apply_power(&mut self, power: TxPower) -> Result<(), Rf95Error<S::Error>> {
        let mut dbm = power.dbm();
        if dbm > 17 {
            self.write(REG_PA_DAC, 0x87).await?;
            dbm -= 3;
        } else {
            self.write(REG_PA_DAC, 0x84).await?;
        }
        self.write(REG_PA_CONFIG, 0x80 | (dbm - 2) as u8).await
    }

    async fn set_mode(&mut self, mode: u8) -> Result<(), Rf95Error<S::Error>> {
        self.write(REG_OP_MODE, MODE_LONG_RANGE | mode).await
    }

    async fn wait_dio0(&mut self) -> Result<(), Rf95Error<S::Error>> {
        self.dio0
            .wait_for_high()
            .await
            .map_err(|_| Rf95Error::Interrupt)
    }

    async fn read(&mut self, register: u8) -> Result<u8, Rf95Error<S::Error>> {
        let mut buf = [register & !WRITE_FLAG, 0];
        self.spi
            .transfer_in_place(&mut buf)
            .await
            .map_err(Rf95Error::Spi)?;
        Ok(buf[1])
    }

    async fn read_burst(
        &mut self,
        register: u8,
        into: &mut [u8],
    ) -> Result<(), Rf95Error<S::Error>> {
        self.spi
            .transaction(&mut [
                Operation::Write(&[register & !WRITE_FLAG]),
                Operation::Read(into),
            ])
            .await
            .map_err(Rf95Error::Spi)
    }

    async fn write(&mut self, register: u8, value: u8) -> Result<(), Rf95Error<S::Error>> {
        self.write_burst(register, &[value]).await
    }

    async fn write_burst(&mut self, register: u8, data: &[u8]) -> Result<(), Rf95Error<S::Error>> {
        self.spi
            .transaction(&mut [
                Operation::Write(&[register | WRITE_FLAG]),
                Operation::Write(data),
            ])
            .await
            .map_err(Rf95Error::Spi)
    }
}

impl<S, P, I> Radio for Rf95<S, P, I>
where
    S: SpiDevice,
    S::Error: core::fmt::Debug,
    P: OutputPin,
    I: Wait,
{
    type Error = Rf95Error<S::Error>;

    async fn transmit(&mut self, packet: &[u8]) -> Result<(), Self::Error> {
        if packet.len() > MAX_PAYLOAD {
            return Err(Rf95Error::PacketTooLong(packet.len()));
        }

        self.set_mode(MODE_STDBY).await?;
        self.write(REG_FIFO_ADDR_PTR, 0).await?;
        self.write_burst(REG_FIFO, packet).await?;
        self.write(REG_PAYLOAD_LENGTH, packet.len() as u8).await?;

        self.write(REG_DIO_MAPPING_1, DIO0_TX_DONE).await?;
        self.set_mode(MODE_TX).await?;
        self.wait_dio0().await?;

        self.write(REG_IRQ_FLAGS, IRQ_TX_DONE).await?;
        self.set_mode(MODE_STDBY).await?;
        debug!("RF95 sent {} bytes", packet.len());
        Ok(())
    }

    /// Blocks until a packet arrives. A packet failing the hardware CRC is
    /// reported as zero bytes.
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        self.write(REG_DIO_MAPPING_1, DIO0_RX_DONE).await?;
        self.set_mode(MODE_RX_CONTINUOUS).await?;
        self.wait_dio0().await?;

        let flags = self.read(REG_IRQ_FLAGS).await?;
        self.write(REG_IRQ_FLAGS, 0xFF).await?;
        if flags & IRQ_RX_DONE == 0 {
            return Ok(0);
        }
        if flags & IRQ_CRC_ERROR != 0 {
            warn!("RF95 dropped a packet with a bad CRC");
            return Ok(0);
        }

        let len = self.read(REG_RX_NB_BYTES).await? as usize;
        let start = self.read(REG_FIFO_RX_CURRENT_ADDR).await?;
        self.write(REG_FIFO_ADDR_PTR, start).await?;

        // The relay layer rejects what does not fit, so a short read is fine
        let len = len.min(buffer.len());
        self.read_burst(REG_FIFO, &mut buffer[..len]).await?;

        let snr = self.read(REG_PKT_SNR).await? as i8 / 4;
        let rssi = self.read(REG_PKT_RSSI).await? as i16 - 157;
        debug!("RF95 received {} bytes, RSSI {} dBm, SNR {} dB", len, rssi, snr);
        Ok(len)
    }

    async fn set_tx_power(&mut self, power: TxPower) -> Result<(), Self::Error> {
        self.apply_power(power).await
    }
}
