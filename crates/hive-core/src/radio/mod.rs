//! Point-to-point radio relay between a field node and a base node.
//!
//! The field node samples and transmits one [`frame`] per batch; the base
//! node receives, validates and republishes the decoded batch on the bus as
//! if it had been sampled locally. Which role a node plays is decided once at
//! boot from its hardware id, see [`NodeRole::select`].

mod base;
mod field;
pub mod frame;

pub use base::*;
pub use field::*;

use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::info;
use thiserror_no_std::Error;

use crate::config::Setting;
use crate::events::{Event, EventBus, SubscriptionId, Topic};
use frame::FrameError;

/// Hardware ids of the nodes that act as field devices.
pub const FIELD_DEVICE_IDS: &[[u8; 6]] = &[[0x30, 0x83, 0x98, 0xdc, 0xca, 0xfc]];

/// Radio relay role, fixed for the boot session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Samples and transmits, never receives.
    Field,
    /// Receives and relays, never samples.
    Base,
}

impl NodeRole {
    /// A node on the `field_ids` allow-list is a field device; any other node
    /// is a base.
    pub fn select(hardware_id: [u8; 6], field_ids: &[[u8; 6]]) -> Self {
        let role = if field_ids.contains(&hardware_id) {
            Self::Field
        } else {
            Self::Base
        };
        info!("Radio role for {:02x?}: {:?}", hardware_id, role);
        role
    }
}

/// Transmit power within the range the transceiver supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TxPower(i8);

impl TxPower {
    pub const MIN_DBM: i8 = 2;
    pub const MAX_DBM: i8 = 20;

    /// Out-of-range requests are clamped, never rejected.
    pub const fn clamped(dbm: i8) -> Self {
        if dbm < Self::MIN_DBM {
            Self(Self::MIN_DBM)
        } else if dbm > Self::MAX_DBM {
            Self(Self::MAX_DBM)
        } else {
            Self(dbm)
        }
    }

    pub const fn dbm(self) -> i8 {
        self.0
    }
}

/// Link counters, published on `radio-stats/link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    pub frames_received: usize,
    pub frames_malformed: usize,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError<E: core::fmt::Debug> {
    #[error("frame could not be built: {0}")]
    Frame(FrameError),
    #[error("transmit timed out")]
    Timeout,
    #[error("radio error: {0:?}")]
    Radio(E),
}

impl<E: core::fmt::Debug> From<FrameError> for RelayError<E> {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

/// Packet radio collaborator (an RFM95/SX127x on the real node).
pub trait Radio {
    type Error: core::fmt::Debug;

    /// Transmit one packet and wait until it left the antenna.
    fn transmit(&mut self, packet: &[u8]) -> impl Future<Output = Result<(), Self::Error>>;

    /// Wait for the next packet and return its length; 0 means noise.
    fn receive(&mut self, buffer: &mut [u8]) -> impl Future<Output = Result<usize, Self::Error>>;

    fn set_tx_power(&mut self, power: TxPower) -> impl Future<Output = Result<(), Self::Error>>;
}

/// Latest transmit power requested through `config/changed`.
///
/// The bus handler only stores the request; the radio worker applies it
/// before its next send or receive.
pub struct TxPowerRequest {
    pending: Signal<CriticalSectionRawMutex, TxPower>,
}

impl TxPowerRequest {
    pub const fn new() -> Self {
        Self {
            pending: Signal::new(),
        }
    }

    pub fn attach(&'static self, bus: &EventBus) -> SubscriptionId {
        bus.subscribe(Topic::ConfigChanged, move |event| {
            if let Event::ConfigChanged(Setting::RadioPowerDbm(dbm)) = event {
                self.request(TxPower::clamped(*dbm));
            }
            Ok(())
        })
    }

    pub fn request(&self, power: TxPower) {
        self.pending.signal(power);
    }

    pub fn take(&self) -> Option<TxPower> {
        self.pending.try_take()
    }

    /// Apply a pending request to `radio`, if there is one.
    pub async fn apply<R: Radio>(&self, radio: &mut R) -> Result<(), R::Error> {
        if let Some(power) = self.take() {
            info!("Setting radio transmit power to {} dBm", power.dbm());
            radio.set_tx_power(power).await?;
        }
        Ok(())
    }
}

impl Default for TxPowerRequest {
    fn default() -> Self {
        Self::new()
    }
}
