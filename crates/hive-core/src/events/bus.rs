use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{error, warn};
use thiserror_no_std::Error;

use super::{Event, Topic};

/// Failure reported by a single handler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler rejected the event: {0}")]
    Rejected(&'static str),
    #[error("handler queue full, event dropped")]
    QueueFull,
}

/// Returned by [`EventBus::publish`] in [`DispatchPolicy::FailFast`] mode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("dispatch of {topic} aborted by subscription {subscription:?}: {error}")]
pub struct DispatchError {
    pub topic: Topic,
    pub subscription: SubscriptionId,
    pub error: HandlerError,
}

/// What the bus does when a handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Record the fault and keep delivering to the remaining handlers.
    Continue,
    /// Record the fault and stop this dispatch, returning the error.
    FailFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u32);

/// Most recent handler failure seen by a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub topic: Topic,
    pub subscription: SubscriptionId,
    pub error: HandlerError,
}

/// Process-wide record of handler failures.
pub struct FaultLog {
    count: AtomicU32,
    last: Mutex<CriticalSectionRawMutex, Cell<Option<Fault>>>,
}

impl FaultLog {
    const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            last: Mutex::new(Cell::new(None)),
        }
    }

    fn record(&self, fault: Fault) {
        error!(
            "Handler {:?} failed on {}: {}",
            fault.subscription, fault.topic, fault.error
        );
        self.count.fetch_add(1, Ordering::Relaxed);
        self.last.lock(|last| last.set(Some(fault)));
    }

    /// Total number of handler failures so far.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn last(&self) -> Option<Fault> {
        self.last.lock(|last| last.get())
    }
}

type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    handler: Handler,
}

/// In-process, synchronous, typed publish/subscribe dispatcher.
///
/// Handlers run on the publisher's context, in registration order, one after
/// another. There is no queuing: a publish returns once every handler for the
/// topic has returned. The registry is guarded by a critical-section mutex
/// that is released before handlers run, so handlers may themselves publish
/// or subscribe; a subscription made during a dispatch takes effect from the
/// next publish.
///
/// Handlers must not block. Anything slow (SD card writes, radio transmits)
/// is handed to a worker through a channel from inside the handler.
///
/// ```rust,ignore
/// static BUS: EventBus = EventBus::new(DispatchPolicy::Continue);
///
/// BUS.subscribe(Topic::SensorCount, |event| {
///     if let Event::SensorCount(count) = event {
///         info!("{} sensors online", count);
///     }
///     Ok(())
/// });
/// BUS.publish(Event::SensorCount(4));
/// ```
pub struct EventBus {
    subscriptions: Mutex<CriticalSectionRawMutex, RefCell<Vec<Subscription>>>,
    next_id: AtomicU32,
    policy: DispatchPolicy,
    faults: FaultLog,
}

impl EventBus {
    pub const fn new(policy: DispatchPolicy) -> Self {
        Self {
            subscriptions: Mutex::new(RefCell::new(Vec::new())),
            next_id: AtomicU32::new(0),
            policy,
            faults: FaultLog::new(),
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn faults(&self) -> &FaultLog {
        &self.faults
    }

    /// Register `handler` for `topic`.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);
        self.subscriptions.lock(|subscriptions| {
            subscriptions.borrow_mut().push(Subscription {
                id,
                topic,
                handler,
            })
        });
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.lock(|subscriptions| {
            let mut subscriptions = subscriptions.borrow_mut();
            let before = subscriptions.len();
            subscriptions.retain(|subscription| subscription.id != id);
            subscriptions.len() != before
        })
    }

    /// Deliver `event` to every handler registered for its topic.
    ///
    /// Returns how many handlers accepted the event. Only a
    /// [`DispatchPolicy::FailFast`] bus ever returns an error.
    pub fn publish(&self, event: Event) -> Result<usize, DispatchError> {
        let topic = event.topic();

        // Snapshot the matching handlers so none of them runs under the lock.
        let handlers: Vec<(SubscriptionId, Handler)> = self.subscriptions.lock(|subscriptions| {
            subscriptions
                .borrow()
                .iter()
                .filter(|subscription| subscription.topic == topic)
                .map(|subscription| (subscription.id, subscription.handler.clone()))
                .collect()
        });

        let mut delivered = 0;
        for (subscription, handler) in handlers {
            match handler(&event) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    self.faults.record(Fault {
                        topic,
                        subscription,
                        error,
                    });
                    if self.policy == DispatchPolicy::FailFast {
                        return Err(DispatchError {
                            topic,
                            subscription,
                            error,
                        });
                    }
                }
            }
        }

        Ok(delivered)
    }

    /// Publish from a component that has no caller to hand the error to.
    ///
    /// A dispatch aborted by a [`DispatchPolicy::FailFast`] bus is logged
    /// with the event it dropped; returns how many handlers accepted it.
    pub fn notify(&self, event: Event) -> usize {
        let topic = event.topic();
        match self.publish(event) {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!("Publishing on {} stopped early: {}", topic, e);
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DispatchPolicy::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ReadinessOutcome, ReadinessSignal, ReadinessSource};
    use std::sync::Mutex as StdMutex;

    fn recorder() -> Arc<StdMutex<Vec<&'static str>>> {
        Arc::new(StdMutex::new(Vec::new()))
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::default();
        let seen = recorder();

        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(Topic::SensorCount, move |_| {
                seen.lock().unwrap().push(name);
                Ok(())
            });
        }

        assert_eq!(bus.publish(Event::SensorCount(2)), Ok(3));
        assert_eq!(*seen.lock().unwrap(), ["first", "second", "third"]);
    }

    #[test]
    fn test_only_matching_topic_is_delivered() {
        let bus = EventBus::default();
        let seen = recorder();

        let sink = seen.clone();
        bus.subscribe(Topic::UplinkReadiness, move |_| {
            sink.lock().unwrap().push("uplink");
            Ok(())
        });

        let storage_done = Event::Readiness(ReadinessSignal::new(
            ReadinessSource::SdCard,
            ReadinessOutcome::Done,
        ));
        assert_eq!(bus.publish(storage_done), Ok(0));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_handler_is_isolated_by_default() {
        let bus = EventBus::new(DispatchPolicy::Continue);
        let seen = recorder();

        let failing = bus.subscribe(Topic::SensorCount, |_| Err(HandlerError::Rejected("boom")));
        let sink = seen.clone();
        bus.subscribe(Topic::SensorCount, move |_| {
            sink.lock().unwrap().push("after");
            Ok(())
        });

        assert_eq!(bus.publish(Event::SensorCount(1)), Ok(1));
        assert_eq!(*seen.lock().unwrap(), ["after"]);
        assert_eq!(bus.faults().count(), 1);
        assert_eq!(bus.faults().last().map(|fault| fault.subscription), Some(failing));
    }

    #[test]
    fn test_fail_fast_stops_dispatch() {
        let bus = EventBus::new(DispatchPolicy::FailFast);
        let seen = recorder();

        let failing = bus.subscribe(Topic::SensorCount, |_| Err(HandlerError::QueueFull));
        let sink = seen.clone();
        bus.subscribe(Topic::SensorCount, move |_| {
            sink.lock().unwrap().push("never");
            Ok(())
        });

        let err = bus.publish(Event::SensorCount(1)).unwrap_err();
        assert_eq!(err.subscription, failing);
        assert_eq!(err.error, HandlerError::QueueFull);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.faults().count(), 1);
    }

    #[test]
    fn test_notify_absorbs_fail_fast_error() {
        let bus = EventBus::new(DispatchPolicy::FailFast);
        bus.subscribe(Topic::SensorCount, |_| Err(HandlerError::QueueFull));

        assert_eq!(bus.notify(Event::SensorCount(1)), 0);
        assert_eq!(bus.faults().count(), 1);

        let other = EventBus::new(DispatchPolicy::FailFast);
        other.subscribe(Topic::SensorCount, |_| Ok(()));
        assert_eq!(other.notify(Event::SensorCount(1)), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let id = bus.subscribe(Topic::SensorCount, |_| Ok(()));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(Event::SensorCount(0)), Ok(0));
    }

    #[test]
    fn test_subscribe_during_dispatch_applies_to_next_publish() {
        let bus = Arc::new(EventBus::default());
        let seen = recorder();

        let inner_bus = bus.clone();
        let sink = seen.clone();
        bus.subscribe(Topic::SensorCount, move |_| {
            let sink = sink.clone();
            inner_bus.subscribe(Topic::SensorCount, move |_| {
                sink.lock().unwrap().push("late");
                Ok(())
            });
            Ok(())
        });

        assert_eq!(bus.publish(Event::SensorCount(0)), Ok(1));
        assert!(seen.lock().unwrap().is_empty());

        bus.publish(Event::SensorCount(0)).unwrap();
        assert_eq!(*seen.lock().unwrap(), ["late"]);
    }

    #[test]
    fn test_handler_may_publish() {
        let bus = Arc::new(EventBus::default());
        let seen = recorder();

        let inner_bus = bus.clone();
        bus.subscribe(Topic::SensorCount, move |_| {
            inner_bus
                .publish(Event::Readiness(ReadinessSignal::new(
                    ReadinessSource::SdCard,
                    ReadinessOutcome::Done,
                )))
                .map(|_| ())
                .map_err(|_| HandlerError::Rejected("nested"))
        });
        let sink = seen.clone();
        bus.subscribe(Topic::StorageReadiness, move |_| {
            sink.lock().unwrap().push("nested");
            Ok(())
        });

        bus.publish(Event::SensorCount(3)).unwrap();
        assert_eq!(*seen.lock().unwrap(), ["nested"]);
    }
}
