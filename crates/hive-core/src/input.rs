//! Button edges, moved out of interrupt context.
//!
//! The GPIO interrupt only records which button fired and when into a
//! bounded queue. A regular worker drains the queue, debounces, and
//! publishes `input/button` on the bus.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant};
use heapless::LinearMap;
use log::{debug, warn};

use crate::events::{Event, EventBus};

pub const EDGE_QUEUE_DEPTH: usize = 8;
const MAX_BUTTONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    /// The BOOT button: keeps the node awake for the rest of this boot.
    Wake,
}

/// One raw edge as seen by the interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEdge {
    pub button: Button,
    pub at: Instant,
}

pub struct EdgeQueue {
    edges: Channel<CriticalSectionRawMutex, ButtonEdge, EDGE_QUEUE_DEPTH>,
}

impl EdgeQueue {
    pub const fn new() -> Self {
        Self {
            edges: Channel::new(),
        }
    }

    /// Record an edge. Safe to call from an interrupt handler: never blocks
    /// and never allocates. Returns `false` if the queue was full and the
    /// edge was dropped.
    pub fn record(&self, button: Button, at: Instant) -> bool {
        self.edges.try_send(ButtonEdge { button, at }).is_ok()
    }
}

impl Default for EdgeQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains an [`EdgeQueue`] and publishes debounced presses.
pub struct ButtonWorker<'a> {
    queue: &'a EdgeQueue,
    debounce: Duration,
    last: LinearMap<Button, Instant, MAX_BUTTONS>,
}

impl<'a> ButtonWorker<'a> {
    pub fn new(queue: &'a EdgeQueue, debounce: Duration) -> Self {
        Self {
            queue,
            debounce,
            last: LinearMap::new(),
        }
    }

    /// An edge within the debounce window of the last accepted edge of the
    /// same button is bounce.
    fn accept(&mut self, edge: ButtonEdge) -> bool {
        if let Some(last) = self.last.get(&edge.button)
            && edge.at < *last + self.debounce
        {
            debug!("Debounced {:?}", edge.button);
            return false;
        }
        if self.last.insert(edge.button, edge.at).is_err() {
            warn!("Too many buttons to debounce {:?}", edge.button);
        }
        true
    }

    fn handle(&mut self, edge: ButtonEdge, bus: &EventBus) -> bool {
        if !self.accept(edge) {
            return false;
        }
        bus.notify(Event::ButtonPressed(edge.button));
        true
    }

    /// Process every queued edge without waiting; returns the number of
    /// presses published.
    pub fn drain(&mut self, bus: &EventBus) -> usize {
        let mut published = 0;
        while let Ok(edge) = self.queue.edges.try_receive() {
            if self.handle(edge, bus) {
                published += 1;
            }
        }
        published
    }

    pub async fn run(&mut self, bus: &EventBus) -> ! {
        loop {
            let edge = self.queue.edges.receive().await;
            self.handle(edge, bus);
        }
    }
}
