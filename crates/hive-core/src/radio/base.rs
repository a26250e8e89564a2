use log::{debug, warn};

use super::frame::{self, MAX_FRAME_LEN};
use super::{LinkStats, Radio, TxPowerRequest};
use crate::events::{Event, EventBus};

/// What became of one reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reception {
    /// Zero-length reception, ignored.
    Noise,
    /// Failed validation, counted and discarded.
    Malformed,
    /// Decoded and republished with this many readings.
    Relayed(usize),
}

/// Base role: listens forever and republishes every valid frame.
pub struct BaseStation<R> {
    radio: R,
    stats: LinkStats,
}

impl<R: Radio> BaseStation<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Account for and act on the bytes of one reception.
    ///
    /// A valid frame is republished on `sensor/readings`, so the rest of the
    /// node cannot tell it from a locally sampled batch. Link stats are
    /// published for every non-empty reception.
    pub fn handle_frame(&mut self, bytes: &[u8], bus: &EventBus) -> Reception {
        if bytes.is_empty() {
            return Reception::Noise;
        }

        self.stats.frames_received += 1;
        let reception = match frame::decode(bytes) {
            Ok(decoded) => {
                debug!(
                    "Frame {} with {} readings",
                    decoded.sequence,
                    decoded.readings.len()
                );
                let count = decoded.readings.len();
                bus.notify(Event::SensorReadings(decoded.readings));
                Reception::Relayed(count)
            }
            Err(e) => {
                self.stats.frames_malformed += 1;
                warn!("Discarding malformed frame: {}", e);
                Reception::Malformed
            }
        };

        bus.notify(Event::LinkStats(self.stats));
        reception
    }

    /// Receive and handle one packet.
    pub async fn listen_once(&mut self, bus: &EventBus) -> Result<Reception, R::Error> {
        let mut buffer = [0u8; MAX_FRAME_LEN];
        let len = self.radio.receive(&mut buffer).await?;
        Ok(self.handle_frame(&buffer[..len.min(MAX_FRAME_LEN)], bus))
    }

    /// Base worker: the receive loop, applying power changes between
    /// receptions.
    pub async fn run(&mut self, power: &TxPowerRequest, bus: &EventBus) -> ! {
        loop {
            if let Err(e) = power.apply(&mut self.radio).await {
                warn!("Could not apply transmit power: {:?}", e);
            }
            if let Err(e) = self.listen_once(bus).await {
                warn!("Radio receive failed: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;
    use crate::radio::TxPower;
    use crate::sensors::{RawValues, SensorId, SensorReading};
    use alloc::collections::VecDeque;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use embassy_futures::block_on;
    use std::sync::Mutex as StdMutex;

    /// Radio that hands out queued packets.
    struct QueuedRadio {
        packets: VecDeque<Vec<u8>>,
    }

    impl Radio for QueuedRadio {
        type Error = &'static str;

        async fn transmit(&mut self, _packet: &[u8]) -> Result<(), Self::Error> {
            Err("base never transmits")
        }

        async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
            let packet = self.packets.pop_front().ok_or("nothing queued")?;
            buffer[..packet.len()].copy_from_slice(&packet);
            Ok(packet.len())
        }

        async fn set_tx_power(&mut self, _power: TxPower) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    fn collect(bus: &EventBus, topic: Topic) -> Arc<StdMutex<Vec<Event>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(topic, move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        seen
    }

    fn batch() -> Vec<SensorReading> {
        alloc::vec![SensorReading::from_raw(
            SensorId::new(2, 0x45),
            RawValues {
                humidity: 0x8000,
                temperature: 0x6000,
            },
        )]
    }

    #[test]
    fn test_noise_is_ignored() {
        let bus = EventBus::default();
        let stats = collect(&bus, Topic::LinkStats);
        let mut base = BaseStation::new(QueuedRadio {
            packets: VecDeque::new(),
        });

        assert_eq!(base.handle_frame(&[], &bus), Reception::Noise);
        assert_eq!(base.stats(), LinkStats::default());
        assert!(stats.lock().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_frame_is_counted_not_relayed() {
        let bus = EventBus::default();
        let readings = collect(&bus, Topic::SensorReadings);
        let stats = collect(&bus, Topic::LinkStats);
        let mut base = BaseStation::new(QueuedRadio {
            packets: VecDeque::new(),
        });

        assert_eq!(
            base.handle_frame(&[7, 0, 0, 0, 1, 2, 0, 0], &bus),
            Reception::Malformed
        );

        assert!(readings.lock().unwrap().is_empty());
        assert_eq!(
            *stats.lock().unwrap(),
            [Event::LinkStats(LinkStats {
                frames_received: 1,
                frames_malformed: 1
            })]
        );
    }

    #[test]
    fn test_listen_relays_valid_frames() {
        let bus = EventBus::default();
        let readings = collect(&bus, Topic::SensorReadings);
        let good = frame::encode(3, &batch()).unwrap().to_vec();
        let mut base = BaseStation::new(QueuedRadio {
            packets: VecDeque::from([good, Vec::new(), alloc::vec![1, 2, 3]]),
        });

        assert_eq!(block_on(base.listen_once(&bus)), Ok(Reception::Relayed(1)));
        assert_eq!(block_on(base.listen_once(&bus)), Ok(Reception::Noise));
        assert_eq!(block_on(base.listen_once(&bus)), Ok(Reception::Malformed));
        assert_eq!(block_on(base.listen_once(&bus)), Err("nothing queued"));

        assert_eq!(*readings.lock().unwrap(), [Event::SensorReadings(batch())]);
        assert_eq!(
            base.stats(),
            LinkStats {
                frames_received: 2,
                frames_malformed: 1
            }
        );
    }
}
