//! Node configuration.
//!
//! [`DutyCycleConfig`] holds the fixed tunables of the duty cycle.
//! [`SettingsStore`] holds the runtime settings a user can change (hostname,
//! node name, sleep interval, radio power). They are persisted as a postcard
//! blob on the SD card (see [`crate::storage::load_settings`]) and every
//! change is announced on the bus.

use core::cell::RefCell;

use alloc::vec::Vec;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::events::{Event, EventBus};
use crate::radio::TxPower;

pub const HOSTNAME_CAPACITY: usize = 64;
pub const NODE_NAME_CAPACITY: usize = 32;

pub type Hostname = heapless::String<HOSTNAME_CAPACITY>;
pub type NodeName = heapless::String<NODE_NAME_CAPACITY>;

const DEFAULT_HOSTNAME: &str = "10.0.0.1";
const DEFAULT_NODE_NAME: &str = "beehive";
const DEFAULT_SLEEP_INTERVAL_SECS: u32 = 300;
const DEFAULT_RADIO_POWER_DBM: i8 = 14;

/// Fixed timing and capacity parameters of one duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycleConfig {
    /// Sub-samples averaged into one reading
    pub oversample_count: u16,
    /// Delay between two sub-samples
    pub sample_spacing: Duration,
    /// Upper bound for the readiness wait before sleeping
    pub quorum_timeout: Duration,
    /// How often a forced-awake node re-checks whether it may sleep
    pub awake_recheck: Duration,
    /// Datasets per log segment before rotating to a new file
    pub segment_capacity: usize,
    /// Upper bound for one radio transmit
    pub send_timeout: Duration,
    /// Minimum time between two accepted edges of one button
    pub button_debounce: Duration,
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self {
            oversample_count: 16,
            sample_spacing: Duration::from_millis(200),
            quorum_timeout: Duration::from_secs(30),
            awake_recheck: Duration::from_secs(20),
            // every 5 minutes, 24h a day
            segment_capacity: 12 * 24,
            send_timeout: Duration::from_secs(2),
            button_debounce: Duration::from_millis(200),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("value does not fit into {capacity} bytes")]
    ValueTooLong { capacity: usize },
    #[error("stored settings could not be encoded or decoded")]
    Encoding,
}

/// Persisted runtime settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub hostname: Hostname,
    pub node_name: NodeName,
    pub sleep_interval_seconds: u32,
    pub radio_power_dbm: i8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: Hostname::try_from(DEFAULT_HOSTNAME).unwrap_or_default(),
            node_name: NodeName::try_from(DEFAULT_NODE_NAME).unwrap_or_default(),
            sleep_interval_seconds: DEFAULT_SLEEP_INTERVAL_SECS,
            radio_power_dbm: DEFAULT_RADIO_POWER_DBM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Hostname,
    NodeName,
    SleepIntervalSeconds,
    RadioPowerDbm,
}

/// One setting together with its value; the payload of `config/changed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    Hostname(Hostname),
    NodeName(NodeName),
    SleepIntervalSeconds(u32),
    RadioPowerDbm(i8),
}

impl Setting {
    pub fn key(&self) -> SettingKey {
        match self {
            Self::Hostname(_) => SettingKey::Hostname,
            Self::NodeName(_) => SettingKey::NodeName,
            Self::SleepIntervalSeconds(_) => SettingKey::SleepIntervalSeconds,
            Self::RadioPowerDbm(_) => SettingKey::RadioPowerDbm,
        }
    }

    pub fn hostname(value: &str) -> Result<Self, ConfigError> {
        Hostname::try_from(value)
            .map(Self::Hostname)
            .map_err(|_| ConfigError::ValueTooLong {
                capacity: HOSTNAME_CAPACITY,
            })
    }

    pub fn node_name(value: &str) -> Result<Self, ConfigError> {
        NodeName::try_from(value)
            .map(Self::NodeName)
            .map_err(|_| ConfigError::ValueTooLong {
                capacity: NODE_NAME_CAPACITY,
            })
    }
}

/// Get/set/notify store for [`NodeConfig`].
pub struct SettingsStore {
    config: Mutex<CriticalSectionRawMutex, RefCell<NodeConfig>>,
}

impl SettingsStore {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config: Mutex::new(RefCell::new(config)),
        }
    }

    /// Restore settings from a blob written by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: NodeConfig = postcard::from_bytes(bytes).map_err(|_| ConfigError::Encoding)?;
        Ok(Self::new(config))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let config = self.snapshot();
        postcard::to_allocvec(&config).map_err(|_| ConfigError::Encoding)
    }

    pub fn snapshot(&self) -> NodeConfig {
        self.config.lock(|config| config.borrow().clone())
    }

    pub fn get(&self, key: SettingKey) -> Setting {
        self.config.lock(|config| {
            let config = config.borrow();
            match key {
                SettingKey::Hostname => Setting::Hostname(config.hostname.clone()),
                SettingKey::NodeName => Setting::NodeName(config.node_name.clone()),
                SettingKey::SleepIntervalSeconds => {
                    Setting::SleepIntervalSeconds(config.sleep_interval_seconds)
                }
                SettingKey::RadioPowerDbm => Setting::RadioPowerDbm(config.radio_power_dbm),
            }
        })
    }

    /// Store `setting` and announce it on `config/changed`.
    pub fn set(&self, setting: Setting, bus: &EventBus) {
        self.config.lock(|config| {
            let mut config = config.borrow_mut();
            match &setting {
                Setting::Hostname(value) => config.hostname = value.clone(),
                Setting::NodeName(value) => config.node_name = value.clone(),
                Setting::SleepIntervalSeconds(value) => config.sleep_interval_seconds = *value,
                Setting::RadioPowerDbm(value) => config.radio_power_dbm = *value,
            }
        });
        log::info!("Setting changed: {:?}", setting);
        bus.notify(Event::ConfigChanged(setting));
    }

    /// Re-publish every setting so subscribers apply the stored configuration.
    pub fn promote(&self, bus: &EventBus) {
        for key in [
            SettingKey::Hostname,
            SettingKey::NodeName,
            SettingKey::SleepIntervalSeconds,
            SettingKey::RadioPowerDbm,
        ] {
            bus.notify(Event::ConfigChanged(self.get(key)));
        }
    }

    pub fn sleep_interval(&self) -> Duration {
        let seconds = self.config.lock(|config| config.borrow().sleep_interval_seconds);
        Duration::from_secs(seconds as u64)
    }

    pub fn radio_power(&self) -> TxPower {
        let dbm = self.config.lock(|config| config.borrow().radio_power_dbm);
        TxPower::clamped(dbm)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(NodeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{HandlerError, Topic};
    use alloc::sync::Arc;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_defaults() {
        let settings = SettingsStore::default();
        assert_eq!(settings.sleep_interval(), Duration::from_secs(300));
        assert_eq!(settings.radio_power().dbm(), 14);
        assert_eq!(
            settings.get(SettingKey::NodeName),
            Setting::node_name("beehive").unwrap()
        );
    }

    #[test]
    fn test_set_publishes_change() {
        let bus = EventBus::default();
        let settings = SettingsStore::default();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let sink = seen.clone();
        bus.subscribe(Topic::ConfigChanged, move |event| match event {
            Event::ConfigChanged(setting) => {
                sink.lock().unwrap().push(setting.clone());
                Ok(())
            }
            _ => Err(HandlerError::Rejected("unexpected payload")),
        });

        settings.set(Setting::SleepIntervalSeconds(60), &bus);

        assert_eq!(settings.sleep_interval(), Duration::from_secs(60));
        assert_eq!(*seen.lock().unwrap(), [Setting::SleepIntervalSeconds(60)]);
    }

    #[test]
    fn test_promote_announces_every_setting() {
        let bus = EventBus::default();
        let settings = SettingsStore::default();
        let keys = Arc::new(StdMutex::new(Vec::new()));

        let sink = keys.clone();
        bus.subscribe(Topic::ConfigChanged, move |event| {
            if let Event::ConfigChanged(setting) = event {
                sink.lock().unwrap().push(setting.key());
            }
            Ok(())
        });

        settings.promote(&bus);

        assert_eq!(
            *keys.lock().unwrap(),
            [
                SettingKey::Hostname,
                SettingKey::NodeName,
                SettingKey::SleepIntervalSeconds,
                SettingKey::RadioPowerDbm
            ]
        );
    }

    #[test]
    fn test_persisted_settings_survive_reload() {
        let bus = EventBus::default();
        let settings = SettingsStore::default();
        settings.set(Setting::hostname("mqtt.local").unwrap(), &bus);
        settings.set(Setting::RadioPowerDbm(20), &bus);

        let bytes = settings.to_bytes().unwrap();
        let restored = SettingsStore::from_bytes(&bytes).unwrap();

        assert_eq!(restored.snapshot(), settings.snapshot());
    }

    #[test]
    fn test_overlong_name_is_rejected() {
        let name = "a-node-name-that-is-much-too-long-to-fit";
        assert_eq!(
            Setting::node_name(name),
            Err(ConfigError::ValueTooLong {
                capacity: NODE_NAME_CAPACITY
            })
        );
    }

    #[test]
    fn test_garbage_blob_is_an_encoding_error() {
        assert!(matches!(
            SettingsStore::from_bytes(&[0xff]),
            Err(ConfigError::Encoding)
        ));
    }
}
