use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, with_deadline};

use crate::events::{Event, EventBus, HandlerError, ReadinessSource, SubscriptionId, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Flags {
    storage: bool,
    uplink: bool,
    interrupted: bool,
}

/// How a quorum wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumEnd {
    /// Both sources signalled.
    Complete,
    /// The timeout elapsed first.
    TimedOut,
    /// An awake-triggering event cancelled the wait.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumOutcome {
    pub storage_ready: bool,
    pub uplink_ready: bool,
    pub end: QuorumEnd,
}

/// Two-of-two readiness barrier with timeout.
///
/// Readiness signals latch until a wait consumes them, so a signal that
/// arrives before the wait starts is not lost. Every wait clears the latches
/// when it returns.
pub struct ReadinessBarrier {
    flags: Mutex<CriticalSectionRawMutex, Cell<Flags>>,
    changed: Signal<CriticalSectionRawMutex, ()>,
}

impl ReadinessBarrier {
    pub const fn new() -> Self {
        Self {
            flags: Mutex::new(Cell::new(Flags {
                storage: false,
                uplink: false,
                interrupted: false,
            })),
            changed: Signal::new(),
        }
    }

    /// Latch storage and uplink readiness published on the bus.
    pub fn attach(&'static self, bus: &EventBus) -> [SubscriptionId; 2] {
        let handler = move |event: &Event| -> Result<(), HandlerError> {
            if let Event::Readiness(signal) = event {
                self.mark(signal.source);
            }
            Ok(())
        };
        [
            bus.subscribe(Topic::StorageReadiness, handler),
            bus.subscribe(Topic::UplinkReadiness, handler),
        ]
    }

    /// Latch readiness of `source`; both outcomes count alike.
    pub fn mark(&self, source: ReadinessSource) {
        self.update(|flags| match source {
            ReadinessSource::SdCard => flags.storage = true,
            ReadinessSource::Uplink => flags.uplink = true,
        });
    }

    /// Cancel a running (or the next) wait.
    pub fn interrupt(&self) {
        self.update(|flags| flags.interrupted = true);
    }

    fn update(&self, change: impl FnOnce(&mut Flags)) {
        self.flags.lock(|flags| {
            let mut current = flags.get();
            change(&mut current);
            flags.set(current);
        });
        self.changed.signal(());
    }

    fn take(&self) -> Flags {
        self.flags.lock(|flags| flags.replace(Flags::default()))
    }

    fn peek(&self) -> Flags {
        self.flags.lock(|flags| flags.get())
    }

    /// Wait until both sources signalled, the wait is interrupted, or
    /// `timeout` elapsed, whichever comes first.
    pub async fn wait(&self, timeout: Duration) -> QuorumOutcome {
        let deadline = Instant::now() + timeout;

        let end = loop {
            let flags = self.peek();
            if flags.interrupted {
                break QuorumEnd::Interrupted;
            }
            if flags.storage && flags.uplink {
                break QuorumEnd::Complete;
            }
            if with_deadline(deadline, self.changed.wait()).await.is_err() {
                break QuorumEnd::TimedOut;
            }
        };

        let flags = self.take();
        self.changed.reset();
        QuorumOutcome {
            storage_ready: flags.storage,
            uplink_ready: flags.uplink,
            end,
        }
    }
}

impl Default for ReadinessBarrier {
    fn default() -> Self {
        Self::new()
    }
}
