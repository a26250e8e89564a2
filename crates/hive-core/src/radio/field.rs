use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use log::{debug, info, warn};

use super::frame;
use super::{LinkStats, Radio, RelayError, TxPowerRequest};
use crate::events::{
    Event, EventBus, HandlerError, ReadinessOutcome, ReadinessSignal, ReadinessSource,
    SubscriptionId, Topic,
};
use crate::sensors::{ReadingBatch, SensorReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldState {
    Idle,
    Sending,
}

/// The last sequence put on the air, kept in memory that survives deep sleep
/// but not a power cycle (RTC memory on the node).
///
/// The log counter only advances on the card, so after a failed write it
/// lags the frames already sent. The link resumes from whichever is higher.
pub trait SequenceMark {
    /// `None` after a cold start.
    fn last_sent(&self) -> Option<u64>;

    fn set_last_sent(&mut self, sequence: u64);
}

/// No retained memory; the link resumes from the recovered counter.
impl SequenceMark for () {
    fn last_sent(&self) -> Option<u64> {
        None
    }

    fn set_last_sent(&mut self, _sequence: u64) {}
}

/// Field role: one frame per batch, at most one in flight.
///
/// The sequence number is seeded from the recovered dataset counter (or the
/// retained [`SequenceMark`], if higher) and advanced once per batch, before
/// the frame is built, so a rejected or failed batch still consumes its
/// number.
///
/// The radio hop is the field node's uplink: every relay attempt ends with
/// an `uplink/readiness` signal, so the node does not sleep while a frame
/// is still waiting to go out.
pub struct FieldLink<R, M = ()> {
    radio: R,
    mark: M,
    sequence: u64,
    stats: LinkStats,
    state: FieldState,
    send_timeout: Duration,
}

impl<R: Radio> FieldLink<R> {
    pub fn new(radio: R, recovered_counter: u64, send_timeout: Duration) -> Self {
        Self::with_mark(radio, recovered_counter, send_timeout, ())
    }
}

impl<R: Radio, M: SequenceMark> FieldLink<R, M> {
    pub fn with_mark(radio: R, recovered_counter: u64, send_timeout: Duration, mark: M) -> Self {
        let sequence = match mark.last_sent() {
            Some(sent) if sent > recovered_counter => {
                info!(
                    "Log counter {} behind last sent frame {}, resuming after it",
                    recovered_counter, sent
                );
                sent
            }
            _ => recovered_counter,
        };
        info!("Field link starting at sequence {}", sequence);
        Self {
            radio,
            mark,
            sequence,
            stats: LinkStats::default(),
            state: FieldState::Idle,
            send_timeout,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn state(&self) -> FieldState {
        self.state
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn mark(&self) -> &M {
        &self.mark
    }

    /// Encode `batch`, transmit it within the send timeout and report uplink
    /// readiness: `Done` once the frame is out, `Unrecoverable` otherwise.
    pub async fn relay(
        &mut self,
        batch: &[SensorReading],
        bus: &EventBus,
    ) -> Result<(), RelayError<R::Error>> {
        let sent = self.send(batch, bus).await;
        let outcome = match sent {
            Ok(()) => ReadinessOutcome::Done,
            Err(_) => ReadinessOutcome::Unrecoverable,
        };
        bus.notify(Event::Readiness(ReadinessSignal::new(
            ReadinessSource::Uplink,
            outcome,
        )));
        sent
    }

    async fn send(
        &mut self,
        batch: &[SensorReading],
        bus: &EventBus,
    ) -> Result<(), RelayError<R::Error>> {
        self.sequence += 1;
        // Before the transmit: a timed out frame may still have gone out
        self.mark.set_last_sent(self.sequence);
        // The frame carries the low 32 bits
        let packet = frame::encode(self.sequence as u32, batch)?;

        self.state = FieldState::Sending;
        let sent = with_timeout(self.send_timeout, self.radio.transmit(&packet)).await;
        self.state = FieldState::Idle;

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RelayError::Radio(e)),
            Err(_) => return Err(RelayError::Timeout),
        }

        self.stats.frames_received += 1;
        debug!(
            "Sent frame {} with {} readings ({} bytes)",
            self.sequence,
            batch.len(),
            packet.len()
        );
        bus.notify(Event::LinkStats(self.stats));
        Ok(())
    }

    /// Field worker: relay the latest handed-off batch, forever.
    pub async fn run(
        &mut self,
        outbox: &RelayOutbox,
        power: &TxPowerRequest,
        bus: &EventBus,
    ) -> ! {
        loop {
            let batch = outbox.wait().await;
            if let Err(e) = power.apply(&mut self.radio).await {
                warn!("Could not apply transmit power: {:?}", e);
            }
            if let Err(e) = self.relay(&batch, bus).await {
                warn!("Relaying batch failed: {}", e);
            }
        }
    }
}

/// Single-slot hand-off from the bus to the field worker.
///
/// A newer batch replaces one the worker has not picked up yet; the field
/// role keeps no backlog.
pub struct RelayOutbox {
    latest: Signal<CriticalSectionRawMutex, ReadingBatch>,
}

impl RelayOutbox {
    pub const fn new() -> Self {
        Self {
            latest: Signal::new(),
        }
    }

    pub fn attach(&'static self, bus: &EventBus) -> SubscriptionId {
        bus.subscribe(Topic::SensorReadings, move |event| {
            let Event::SensorReadings(batch) = event else {
                return Err(HandlerError::Rejected("expected a reading batch"));
            };
            self.latest.signal(batch.clone());
            Ok(())
        })
    }

    pub async fn wait(&self) -> ReadingBatch {
        self.latest.wait().await
    }

    pub fn try_take(&self) -> Option<ReadingBatch> {
        self.latest.try_take()
    }
}

impl Default for RelayOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{TxPower, frame::FrameError};
    use crate::sensors::{RawValues, SensorId};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use embassy_futures::block_on;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct RecordingRadio {
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
        power: Arc<StdMutex<Option<TxPower>>>,
        fail: bool,
    }

    impl Radio for RecordingRadio {
        type Error = &'static str;

        async fn transmit(&mut self, packet: &[u8]) -> Result<(), Self::Error> {
            if self.fail {
                return Err("no ack from transceiver");
            }
            self.sent.lock().unwrap().push(packet.to_vec());
            Ok(())
        }

        async fn receive(&mut self, _buffer: &mut [u8]) -> Result<usize, Self::Error> {
            Err("field radio never receives")
        }

        async fn set_tx_power(&mut self, power: TxPower) -> Result<(), Self::Error> {
            *self.power.lock().unwrap() = Some(power);
            Ok(())
        }
    }

    fn reading(bus_id: u8) -> SensorReading {
        SensorReading::from_raw(
            SensorId::new(bus_id, 0x44),
            RawValues {
                humidity: 1,
                temperature: 2,
            },
        )
    }

    #[test]
    fn test_relay_advances_sequence_and_stats() {
        let bus = EventBus::default();
        let stats = Arc::new(StdMutex::new(Vec::new()));
        let sink = stats.clone();
        bus.subscribe(Topic::LinkStats, move |event| {
            if let Event::LinkStats(s) = event {
                sink.lock().unwrap().push(*s);
            }
            Ok(())
        });

        let radio = RecordingRadio::default();
        let mut link = FieldLink::new(radio.clone(), 6, Duration::from_secs(2));

        block_on(link.relay(&[reading(4)], &bus)).unwrap();

        let sent = radio.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][..4], 7u32.to_le_bytes());
        assert_eq!(link.sequence(), 7);
        assert_eq!(link.state(), FieldState::Idle);
        assert_eq!(
            *stats.lock().unwrap(),
            [LinkStats {
                frames_received: 1,
                frames_malformed: 0
            }]
        );
    }

    #[test]
    fn test_sequence_wraps_to_low_bits() {
        let radio = RecordingRadio::default();
        let mut link = FieldLink::new(radio.clone(), u32::MAX as u64, Duration::from_secs(2));

        block_on(link.relay(&[], &EventBus::default())).unwrap();

        assert_eq!(link.sequence(), 1 << 32);
        assert_eq!(radio.sent.lock().unwrap()[0][..4], [0, 0, 0, 0]);
    }

    #[test]
    fn test_oversized_batch_sends_nothing() {
        let radio = RecordingRadio::default();
        let mut link = FieldLink::new(radio.clone(), 0, Duration::from_secs(2));
        let batch: Vec<SensorReading> = (0..21).map(reading).collect();

        let result = block_on(link.relay(&batch, &EventBus::default()));

        assert_eq!(
            result,
            Err(RelayError::Frame(FrameError::TooManyReadings {
                count: 21,
                max: 20
            }))
        );
        assert!(radio.sent.lock().unwrap().is_empty());
        assert_eq!(link.stats(), LinkStats::default());
    }

    #[test]
    fn test_radio_failure_is_reported() {
        let radio = RecordingRadio {
            fail: true,
            ..RecordingRadio::default()
        };
        let mut link = FieldLink::new(radio, 0, Duration::from_secs(2));

        let result = block_on(link.relay(&[reading(0)], &EventBus::default()));

        assert_eq!(result, Err(RelayError::Radio("no ack from transceiver")));
        assert_eq!(link.stats().frames_received, 0);
    }

    fn uplink_outcomes(bus: &EventBus) -> Arc<StdMutex<Vec<ReadinessOutcome>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(Topic::UplinkReadiness, move |event| {
            if let Event::Readiness(signal) = event {
                sink.lock().unwrap().push(signal.outcome);
            }
            Ok(())
        });
        seen
    }

    #[test]
    fn test_every_relay_attempt_reports_uplink_readiness() {
        let bus = EventBus::default();
        let outcomes = uplink_outcomes(&bus);

        let mut link = FieldLink::new(RecordingRadio::default(), 0, Duration::from_secs(2));
        block_on(link.relay(&[reading(1)], &bus)).unwrap();
        let oversized: Vec<SensorReading> = (0..21).map(reading).collect();
        assert!(block_on(link.relay(&oversized, &bus)).is_err());

        let broken = RecordingRadio {
            fail: true,
            ..RecordingRadio::default()
        };
        let mut link = FieldLink::new(broken, 0, Duration::from_secs(2));
        assert!(block_on(link.relay(&[reading(1)], &bus)).is_err());

        assert_eq!(
            *outcomes.lock().unwrap(),
            [
                ReadinessOutcome::Done,
                ReadinessOutcome::Unrecoverable,
                ReadinessOutcome::Unrecoverable
            ]
        );
    }

    /// Stands in for RTC memory: clones share the value.
    #[derive(Clone, Default)]
    struct RetainedMark(Arc<StdMutex<Option<u64>>>);

    impl SequenceMark for RetainedMark {
        fn last_sent(&self) -> Option<u64> {
            *self.0.lock().unwrap()
        }

        fn set_last_sent(&mut self, sequence: u64) {
            *self.0.lock().unwrap() = Some(sequence);
        }
    }

    #[test]
    fn test_mark_follows_every_consumed_sequence() {
        let mark = RetainedMark::default();
        let broken = RecordingRadio {
            fail: true,
            ..RecordingRadio::default()
        };
        let mut link =
            FieldLink::with_mark(broken, 4, Duration::from_secs(2), mark.clone());

        assert!(block_on(link.relay(&[reading(1)], &EventBus::default())).is_err());

        assert_eq!(mark.last_sent(), Some(5));
    }

    #[test]
    fn test_link_resumes_after_the_higher_of_mark_and_counter() {
        let mark = RetainedMark::default();
        mark.clone().set_last_sent(9);

        let timeout = Duration::from_secs(2);

        let ahead = FieldLink::with_mark(RecordingRadio::default(), 7, timeout, mark.clone());
        assert_eq!(ahead.sequence(), 9);

        let behind = FieldLink::with_mark(RecordingRadio::default(), 12, timeout, mark);
        assert_eq!(behind.sequence(), 12);

        let cold =
            FieldLink::with_mark(RecordingRadio::default(), 3, timeout, RetainedMark::default());
        assert_eq!(cold.sequence(), 3);
    }

    #[test]
    fn test_outbox_keeps_only_the_latest_batch() {
        let bus = EventBus::default();
        let outbox: &'static RelayOutbox = Box::leak(Box::new(RelayOutbox::new()));
        outbox.attach(&bus);

        bus.publish(Event::SensorReadings(alloc::vec![reading(1)]))
            .unwrap();
        bus.publish(Event::SensorReadings(alloc::vec![reading(2)]))
            .unwrap();

        assert_eq!(outbox.try_take(), Some(alloc::vec![reading(2)]));
        assert_eq!(outbox.try_take(), None);
    }
}
