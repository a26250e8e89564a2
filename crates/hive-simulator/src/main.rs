//! Desktop simulator for the hive sensing node.
//!
//! Runs a field node through several duty cycles against synthetic sensors,
//! an in-memory SD card and an in-memory radio link to a base node. Every
//! wake period is a fresh "boot": the field node recovers its dataset counter
//! from the card, samples, logs, relays, waits for readiness and powers down.
//! The base node never sleeps; it logs and republishes what it receives.
//!
//! On the last cycle the wake button is pressed, which keeps the field node
//! awake and ends the simulation.
//!
//! Logging goes through `env_logger` (`RUST_LOG=debug` for more detail).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use embassy_futures::block_on;
use embassy_time::{Delay, Duration, Instant};
use log::{info, warn};

use hive_core::app_state::{AppError, AppRunState, AppState};
use hive_core::config::{DutyCycleConfig, Setting};
use hive_core::events::{
    Event, EventBus, ReadinessOutcome, ReadinessSignal, ReadinessSource, Topic,
};
use hive_core::input::{Button, ButtonWorker, EdgeQueue};
use hive_core::power::{ReadinessBarrier, SleepController, SleepDecision, WakeLatch};
use hive_core::radio::{
    BaseStation, FIELD_DEVICE_IDS, FieldLink, NodeRole, Radio, RelayOutbox, SequenceMark,
    TxPower, TxPowerRequest,
};
use hive_core::sensors::{RawValues, SensorAggregator, SensorDriver, SensorError, SensorId};
use hive_core::storage::{
    MemoryStore, PersistentLog, StorageInbox, load_settings, parse_segment_index, save_settings,
};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Wake periods of the field node before the wake button is pressed.
const CYCLES: u32 = 5;

const BASE_ID: [u8; 6] = [0x30, 0x83, 0x98, 0xdc, 0x01, 0x02];

/// Simulated sleep between two wake periods, in seconds of sensor time.
const SLEEP_SECS: u32 = 300;

/// Timings compressed so a run takes a few seconds instead of hours.
fn sim_config() -> DutyCycleConfig {
    DutyCycleConfig {
        sample_spacing: Duration::from_millis(5),
        quorum_timeout: Duration::from_millis(500),
        awake_recheck: Duration::from_millis(50),
        segment_capacity: 3,
        ..DutyCycleConfig::default()
    }
}

/// Each simulated boot gets its own statics, like a fresh RAM image.
fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

// ---------------------------------------------------------------------------
// Synthetic hardware
// ---------------------------------------------------------------------------

/// Three SHT3x sensors in a hive with slowly drifting climate.
struct SyntheticSensors {
    /// Seconds since the simulation started
    elapsed_secs: f64,
}

impl SyntheticSensors {
    const SENSORS: [SensorId; 3] = [
        SensorId::new(4, 0x44),
        SensorId::new(5, 0x45),
        SensorId::new(6, 0x44),
    ];
}

impl SensorDriver for SyntheticSensors {
    async fn scan(&mut self) -> Result<Vec<SensorId>, SensorError> {
        Ok(Self::SENSORS.to_vec())
    }

    async fn read_raw(&mut self, sensor: SensorId) -> Result<RawValues, SensorError> {
        self.elapsed_secs += 0.2;
        let t = self.elapsed_secs;
        let offset = sensor.bus_id as f64;

        // Humidity: 55–65 %, temperature: 30–36 °C (brood nest)
        let humidity = 60.0 + 5.0 * (t / 900.0 + offset).sin();
        let temperature = 33.0 + 3.0 * (t / 1200.0 + offset).cos();

        Ok(RawValues {
            humidity: (humidity / 100.0 * 65535.0) as u16,
            temperature: ((temperature + 45.0) / 175.0 * 65535.0) as u16,
        })
    }
}

/// Radio link without loss: what one end transmits, the other receives.
#[derive(Clone, Default)]
struct AirLink {
    air: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl AirLink {
    fn pending(&self) -> usize {
        self.air.lock().map(|air| air.len()).unwrap_or(0)
    }
}

impl Radio for AirLink {
    type Error = &'static str;

    async fn transmit(&mut self, packet: &[u8]) -> Result<(), Self::Error> {
        let mut air = self.air.lock().map_err(|_| "link poisoned")?;
        air.push_back(packet.to_vec());
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let mut air = self.air.lock().map_err(|_| "link poisoned")?;
        let packet = air.pop_front().ok_or("silence")?;
        let len = packet.len().min(buffer.len());
        buffer[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn set_tx_power(&mut self, power: TxPower) -> Result<(), Self::Error> {
        info!("[radio] transmit power now {} dBm", power.dbm());
        Ok(())
    }
}

/// RTC memory of the field node: kept across deep sleep.
#[derive(Clone, Default)]
struct RtcMemory {
    last_sent: Arc<Mutex<Option<u64>>>,
}

impl SequenceMark for RtcMemory {
    fn last_sent(&self) -> Option<u64> {
        self.last_sent.lock().ok().and_then(|value| *value)
    }

    fn set_last_sent(&mut self, sequence: u64) {
        if let Ok(mut value) = self.last_sent.lock() {
            *value = Some(sequence);
        }
    }
}

/// Stand-in for the base node's MQTT uplink: every batch is "published" at
/// once and readiness is reported with an empty backlog.
fn attach_uplink(bus: &'static EventBus) {
    bus.subscribe(Topic::SensorReadings, move |event| {
        if let Event::SensorReadings(batch) = event {
            info!("[base] uplink: {} readings published", batch.len());
            bus.notify(Event::Readiness(ReadinessSignal::new(
                ReadinessSource::Uplink,
                ReadinessOutcome::Done,
            )));
        }
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Base node
// ---------------------------------------------------------------------------

struct BaseNode {
    bus: &'static EventBus,
    inbox: &'static StorageInbox,
    station: BaseStation<AirLink>,
    log: PersistentLog<MemoryStore>,
}

impl BaseNode {
    fn boot(air: AirLink, card: MemoryStore, config: &DutyCycleConfig) -> Self {
        let role = NodeRole::select(BASE_ID, FIELD_DEVICE_IDS);
        let mut state = AppState::new();
        state.set_role(role);
        state.transition(AppRunState::Recovering);

        let bus = leak(EventBus::default());
        let inbox = leak(StorageInbox::new());
        inbox.attach(bus);
        attach_uplink(bus);
        bus.subscribe(Topic::LinkStats, |event| {
            if let Event::LinkStats(stats) = event {
                info!(
                    "[base] link: {} frames, {} malformed",
                    stats.frames_received, stats.frames_malformed
                );
            }
            Ok(())
        });

        let log = PersistentLog::open(card, config);
        state.transition(AppRunState::Relaying(role));

        Self {
            bus,
            inbox,
            station: BaseStation::new(air),
            log,
        }
    }

    /// Receive everything on the air and log it.
    fn service(&mut self, air: &AirLink) {
        while air.pending() > 0 {
            if let Err(e) = block_on(self.station.listen_once(self.bus)) {
                warn!("[base] receive failed: {}", e);
            }
            while let Some(batch) = self.inbox.try_receive() {
                self.log.handle(&batch, self.bus);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Field node
// ---------------------------------------------------------------------------

/// One wake period of the field node; returns the sleep decision.
fn boot_field(
    boot: u32,
    clock_secs: f64,
    card: &MemoryStore,
    air: &AirLink,
    rtc: &RtcMemory,
    config: &DutyCycleConfig,
) -> Result<SleepDecision, AppError> {
    info!("===== field node boot {} =====", boot);
    let mut state = AppState::new();

    let bus = leak(EventBus::default());
    let settings = leak(load_settings(&mut card.clone()));
    let barrier = leak(ReadinessBarrier::new());
    let latch = leak(WakeLatch::new());
    let inbox = leak(StorageInbox::new());
    let outbox = leak(RelayOutbox::new());
    let power = leak(TxPowerRequest::new());
    let edges = leak(EdgeQueue::new());

    barrier.attach(bus);
    latch.attach(bus, barrier);
    inbox.attach(bus);
    outbox.attach(bus);
    power.attach(bus);
    settings.promote(bus);

    let role = NodeRole::select(FIELD_DEVICE_IDS[0], FIELD_DEVICE_IDS);
    state.set_role(role);

    state.transition(AppRunState::Recovering);
    let mut log = PersistentLog::open(card.clone(), config);
    // The radio hop is this node's uplink; the link reports its readiness
    let mut link =
        FieldLink::with_mark(air.clone(), log.counter(), config.send_timeout, rtc.clone());

    state.transition(AppRunState::Sampling);
    let sampled = block_on(SensorAggregator::discover(
        SyntheticSensors {
            elapsed_secs: clock_secs,
        },
        Delay,
        config,
        bus,
    ));
    let mut aggregator = match sampled {
        Ok(aggregator) => aggregator,
        Err(e) => {
            let err = AppError::NoSensorBus(e);
            state.fail(err, latch);
            return Err(err);
        }
    };
    block_on(aggregator.sample_and_publish(bus));

    // Storage worker turn
    while let Some(batch) = inbox.try_receive() {
        log.handle(&batch, bus);
    }

    // Field worker turn
    state.transition(AppRunState::Relaying(role));
    if boot == 2 {
        // A user turns the radio up through the settings endpoint
        settings.set(Setting::RadioPowerDbm(23), bus);
    }
    if let Some(batch) = outbox.try_take() {
        if let Err(e) = block_on(power.apply(link.radio_mut())) {
            warn!("[field] could not apply transmit power: {}", e);
        }
        if let Err(e) = block_on(link.relay(&batch, bus)) {
            warn!("[field] relay failed: {}", e);
        }
    }

    if boot == CYCLES {
        info!("[field] BOOT button pressed");
        edges.record(Button::Wake, Instant::now());
        ButtonWorker::new(edges, config.button_debounce).drain(bus);
    }

    if let Err(e) = save_settings(&mut card.clone(), settings) {
        warn!("[field] could not save settings: {}", e);
    }

    state.transition(AppRunState::WaitingForSleep);
    let mut controller = SleepController::new(latch, || false, barrier, settings, config);
    Ok(block_on(controller.step()))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting hive simulator");

    let config = sim_config();
    let air = AirLink::default();
    let field_card = MemoryStore::new();
    let rtc = RtcMemory::default();
    let mut base = BaseNode::boot(air.clone(), MemoryStore::new(), &config);

    for boot in 1..=CYCLES {
        let decision = boot_field(
            boot,
            f64::from((boot - 1) * SLEEP_SECS),
            &field_card,
            &air,
            &rtc,
            &config,
        );
        base.service(&air);

        match decision {
            Ok(SleepDecision::PowerDown(duration)) => {
                info!(
                    "[field] deep sleep for {} s, rebooting on timer",
                    duration.as_secs()
                );
            }
            Ok(SleepDecision::StayAwake) => {
                info!("[field] forced awake, ending simulation");
                break;
            }
            Err(e) => {
                warn!("[field] stopped: {}", e);
                break;
            }
        }
    }

    for name in field_card
        .file_names()
        .into_iter()
        .filter(|name| parse_segment_index(name).is_some())
    {
        let content = field_card.file(&name).unwrap_or_default();
        info!("[field] {}:\n{}", name, String::from_utf8_lossy(&content));
    }
    info!(
        "Base logged {} datasets, link stats {:?}",
        base.log.counter(),
        base.station.stats()
    );
}
