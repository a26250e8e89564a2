use alloc::string::String;
use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use super::{FileName, LogStore, RecoveredLog, WriteMode, recover, segment_file_name};
use crate::config::DutyCycleConfig;
use crate::events::{
    Event, EventBus, HandlerError, ReadinessOutcome, ReadinessSignal, ReadinessSource,
    SubscriptionId, Topic,
};
use crate::sensors::{ReadingBatch, SensorReading};

/// Batches waiting for the storage worker.
pub const INBOX_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum LogError<E: core::fmt::Debug> {
    #[error("storage operation failed: {0:?}")]
    Storage(E),
    #[error("storage disabled after an earlier failure")]
    Disabled,
}

/// Format one dataset line: the counter, then every reading, then `\r\n`.
pub fn format_line(counter: u64, batch: &[SensorReading]) -> String {
    let mut line = String::with_capacity(12 + 15 * batch.len());
    // Writing into a String cannot fail
    let _ = write!(line, "#{:08x},", counter);
    for reading in batch {
        let _ = write!(
            line,
            "{:02x}{:02x},{:04x},{:04x},",
            reading.bus_id, reading.address, reading.raw_humidity, reading.raw_temperature
        );
    }
    line.push_str("\r\n");
    line
}

/// Appends reading batches to rotating segment files.
///
/// Owns the global dataset counter and the rotation state; both are handed
/// over from [`recover`] at startup. A storage failure disables all further
/// writes for this boot, but every batch is still answered with a readiness
/// signal so the sleep controller is never kept waiting.
pub struct PersistentLog<S: LogStore> {
    store: S,
    counter: u64,
    segment: Option<u32>,
    lines_in_segment: usize,
    torn_tail: bool,
    capacity: usize,
    disabled: bool,
}

impl<S: LogStore> PersistentLog<S> {
    /// Recover the log state from `store` and take ownership of it.
    ///
    /// A store that cannot be read starts disabled at counter 0.
    pub fn open(mut store: S, config: &DutyCycleConfig) -> Self {
        match recover(&mut store) {
            Ok(recovered) => Self::with_state(store, recovered, config.segment_capacity),
            Err(e) => {
                error!("SD card log unavailable, not logging this boot: {:?}", e);
                let mut log = Self::with_state(store, RecoveredLog::default(), 0);
                log.disabled = true;
                log
            }
        }
    }

    pub fn with_state(store: S, recovered: RecoveredLog, capacity: usize) -> Self {
        Self {
            store,
            counter: recovered.counter,
            segment: recovered.segment,
            lines_in_segment: recovered.lines_in_segment,
            torn_tail: recovered.torn_tail,
            capacity: capacity.max(1),
            disabled: false,
        }
    }

    /// Counter of the last dataset written.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn segment(&self) -> Option<u32> {
        self.segment
    }

    pub fn lines_in_segment(&self) -> usize {
        self.lines_in_segment
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start a new segment when there is none yet, the current one is full,
    /// or it holds no complete dataset (e.g. only a torn line).
    fn target(&mut self) -> (FileName, WriteMode) {
        if self.segment.is_none()
            || self.lines_in_segment == 0
            || self.lines_in_segment >= self.capacity
        {
            let next = self.segment.map_or(1, |s| s.wrapping_add(1));
            self.segment = Some(next);
            self.lines_in_segment = 0;
            self.torn_tail = false;
            let name = segment_file_name(next);
            info!("Creating SD card log file '{}'", name);
            return (name, WriteMode::Truncate);
        }
        let segment = self.segment.unwrap_or(1);
        (segment_file_name(segment), WriteMode::Append)
    }

    /// Write `batch` as the next dataset and return its counter.
    pub fn record(&mut self, batch: &[SensorReading]) -> Result<u64, LogError<S::Error>> {
        if self.disabled {
            return Err(LogError::Disabled);
        }

        let (name, mode) = self.target();
        self.counter += 1;
        let mut line = String::new();
        // Terminate a line cut short by power loss so ours parses
        let terminate = mode == WriteMode::Append && self.torn_tail;
        if terminate {
            line.push_str("\r\n");
        }
        line.push_str(&format_line(self.counter, batch));

        if let Err(e) = self.store.write_file(&name, mode, line.as_bytes()) {
            self.disabled = true;
            return Err(LogError::Storage(e));
        }
        if terminate {
            self.torn_tail = false;
            self.lines_in_segment += 1;
        }
        self.lines_in_segment += 1;

        debug!(
            "Wrote dataset {} to {} ({}/{})",
            self.counter, name, self.lines_in_segment, self.capacity
        );
        Ok(self.counter)
    }

    /// Record `batch` and report the outcome on `storage/readiness`.
    pub fn handle(&mut self, batch: &[SensorReading], bus: &EventBus) {
        let outcome = match self.record(batch) {
            Ok(_) => ReadinessOutcome::Done,
            Err(LogError::Disabled) => ReadinessOutcome::Unrecoverable,
            Err(e) => {
                // Logged once; afterwards the log is disabled
                error!("SD card write failed, disabling log: {}", e);
                ReadinessOutcome::Unrecoverable
            }
        };
        bus.notify(Event::Readiness(ReadinessSignal::new(
            ReadinessSource::SdCard,
            outcome,
        )));
    }

    /// Storage worker: record every batch that arrives in `inbox`.
    pub async fn run(&mut self, inbox: &StorageInbox, bus: &EventBus) -> ! {
        loop {
            let batch = inbox.receive().await;
            self.handle(&batch, bus);
        }
    }
}

/// Hands batches from the bus to the storage worker.
///
/// The bus handler only enqueues; storage I/O happens on the worker.
pub struct StorageInbox {
    batches: Channel<CriticalSectionRawMutex, ReadingBatch, INBOX_DEPTH>,
}

impl StorageInbox {
    pub const fn new() -> Self {
        Self {
            batches: Channel::new(),
        }
    }

    /// Forward every `sensor/readings` batch into this inbox.
    pub fn attach(&'static self, bus: &EventBus) -> SubscriptionId {
        bus.subscribe(Topic::SensorReadings, move |event| {
            let Event::SensorReadings(batch) = event else {
                return Err(HandlerError::Rejected("expected a reading batch"));
            };
            self.batches.try_send(batch.clone()).map_err(|_| {
                warn!("Storage inbox full, dropping batch");
                HandlerError::QueueFull
            })
        })
    }

    pub async fn receive(&self) -> ReadingBatch {
        self.batches.receive().await
    }

    pub fn try_receive(&self) -> Option<ReadingBatch> {
        self.batches.try_receive().ok()
    }
}

impl Default for StorageInbox {
    fn default() -> Self {
        Self::new()
    }
}
