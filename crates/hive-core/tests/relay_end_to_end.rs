//! A field node relays one batch over a loopback radio to a base node, which
//! logs and republishes it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use embassy_futures::block_on;
use embassy_time::Duration;

use hive_core::config::DutyCycleConfig;
use hive_core::events::{Event, EventBus, ReadinessOutcome, Topic};
use hive_core::radio::{
    BaseStation, FieldLink, LinkStats, Radio, Reception, SequenceMark, TxPower,
};
use hive_core::sensors::{RawValues, ReadingBatch, SensorId, SensorReading};
use hive_core::storage::{MemoryStore, PersistentLog};

/// Both ends of an ideal radio link.
#[derive(Clone, Default)]
struct Loopback {
    air: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl Radio for Loopback {
    type Error = &'static str;

    async fn transmit(&mut self, packet: &[u8]) -> Result<(), Self::Error> {
        self.air.lock().unwrap().push_back(packet.to_vec());
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let packet = self.air.lock().unwrap().pop_front().ok_or("silence")?;
        buffer[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn set_tx_power(&mut self, _power: TxPower) -> Result<(), Self::Error> {
        Ok(())
    }
}

fn reading(bus_id: u8, address: u8, humidity: u16, temperature: u16) -> SensorReading {
    SensorReading::from_raw(
        SensorId::new(bus_id, address),
        RawValues {
            humidity,
            temperature,
        },
    )
}

fn scenario_batch() -> ReadingBatch {
    vec![
        reading(4, 0x44, 100, 200),
        reading(5, 0x45, 300, 400),
        reading(6, 0x44, 500, 600),
    ]
}

fn record(bus: &EventBus, topic: Topic) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(topic, move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    seen
}

#[test]
fn three_readings_cross_the_link() {
    let radio = Loopback::default();
    let field_bus = EventBus::default();
    let base_bus = EventBus::default();

    // Counter 6 recovered, so this batch goes out as frame 7
    let mut field = FieldLink::new(radio.clone(), 6, Duration::from_secs(2));
    block_on(field.relay(&scenario_batch(), &field_bus)).unwrap();

    let frame = radio.air.lock().unwrap().front().cloned().unwrap();
    assert_eq!(frame.len(), 24);
    assert_eq!(frame[..4], 7u32.to_le_bytes());

    let readings = record(&base_bus, Topic::SensorReadings);
    let stats = record(&base_bus, Topic::LinkStats);
    let mut base = BaseStation::new(radio);

    assert_eq!(
        block_on(base.listen_once(&base_bus)),
        Ok(Reception::Relayed(3))
    );

    assert_eq!(
        *readings.lock().unwrap(),
        [Event::SensorReadings(scenario_batch())]
    );
    assert_eq!(
        *stats.lock().unwrap(),
        [Event::LinkStats(LinkStats {
            frames_received: 1,
            frames_malformed: 0,
        })]
    );
}

#[test]
fn relayed_batch_is_logged_on_the_base() {
    let radio = Loopback::default();
    let store = MemoryStore::new();
    let base_bus = Arc::new(EventBus::default());
    let readiness = record(&base_bus, Topic::StorageReadiness);

    // Logged inline from the handler instead of through the storage worker
    let log = Arc::new(Mutex::new(PersistentLog::open(
        store.clone(),
        &DutyCycleConfig::default(),
    )));
    {
        let log = log.clone();
        let bus = base_bus.clone();
        base_bus.subscribe(Topic::SensorReadings, move |event| {
            if let Event::SensorReadings(batch) = event {
                log.lock().unwrap().handle(batch, &bus);
            }
            Ok(())
        });
    }

    let mut field = FieldLink::new(radio.clone(), 0, Duration::from_secs(2));
    block_on(field.relay(&scenario_batch(), &EventBus::default())).unwrap();

    let mut base = BaseStation::new(radio);
    block_on(base.listen_once(&base_bus)).unwrap();

    assert_eq!(
        store.file("BEE00001.TXT").unwrap(),
        b"#00000001,0444,0064,00c8,0545,012c,0190,0644,01f4,0258,\r\n"
    );
    assert_eq!(log.lock().unwrap().counter(), 1);
    assert_eq!(readiness.lock().unwrap().len(), 1);
    assert!(matches!(
        readiness.lock().unwrap()[0],
        Event::Readiness(signal) if signal.outcome == ReadinessOutcome::Done
    ));
}

#[test]
fn malformed_reception_does_not_stop_the_base() {
    let radio = Loopback::default();
    radio.air.lock().unwrap().extend([
        vec![1, 2, 3],
        Vec::new(),
        hive_core::radio::frame::encode(1, &scenario_batch())
            .unwrap()
            .to_vec(),
    ]);
    let bus = EventBus::default();
    let readings = record(&bus, Topic::SensorReadings);
    let mut base = BaseStation::new(radio);

    let receptions: Vec<_> = (0..3)
        .map(|_| block_on(base.listen_once(&bus)).unwrap())
        .collect();

    assert_eq!(
        receptions,
        [Reception::Malformed, Reception::Noise, Reception::Relayed(3)]
    );
    assert_eq!(readings.lock().unwrap().len(), 1);
    assert_eq!(
        base.stats(),
        LinkStats {
            frames_received: 2,
            frames_malformed: 1,
        }
    );
}

/// RTC memory of the field node: survives deep sleep, shared by clones.
#[derive(Clone, Default)]
struct RtcMark(Arc<Mutex<Option<u64>>>);

impl SequenceMark for RtcMark {
    fn last_sent(&self) -> Option<u64> {
        *self.0.lock().unwrap()
    }

    fn set_last_sent(&mut self, sequence: u64) {
        *self.0.lock().unwrap() = Some(sequence);
    }
}

fn sent_sequences(radio: &Loopback) -> Vec<u32> {
    radio
        .air
        .lock()
        .unwrap()
        .iter()
        .map(|frame| u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]))
        .collect()
}

#[test]
fn failed_card_write_does_not_repeat_a_sequence_after_sleep() {
    let radio = Loopback::default();
    let card = MemoryStore::new();
    let rtc = RtcMark::default();
    let config = DutyCycleConfig::default();
    let bus = EventBus::default();

    // Boot 1 logs and relays dataset 1
    let mut log = PersistentLog::open(card.clone(), &config);
    let mut field =
        FieldLink::with_mark(radio.clone(), log.counter(), config.send_timeout, rtc.clone());
    log.handle(&scenario_batch(), &bus);
    block_on(field.relay(&scenario_batch(), &bus)).unwrap();

    // Boot 2: the card misses the write, the frame still goes out
    let mut log = PersistentLog::open(card.clone(), &config);
    let mut field =
        FieldLink::with_mark(radio.clone(), log.counter(), config.send_timeout, rtc.clone());
    card.set_failing(true);
    log.handle(&scenario_batch(), &bus);
    block_on(field.relay(&scenario_batch(), &bus)).unwrap();
    card.set_failing(false);

    // Boot 3: the card only knows dataset 1
    let log = PersistentLog::open(card.clone(), &config);
    assert_eq!(log.counter(), 1);
    let mut field =
        FieldLink::with_mark(radio.clone(), log.counter(), config.send_timeout, rtc);
    block_on(field.relay(&scenario_batch(), &bus)).unwrap();

    assert_eq!(sent_sequences(&radio), [1, 2, 3]);
}
