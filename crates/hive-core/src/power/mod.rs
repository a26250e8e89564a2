//! Wake/sleep controller.
//!
//! ```text
//! Awake <-> WaitingForQuorum -> PoweredDown
//! ```
//!
//! While forced awake (wake latch or override switch) the node idles and
//! re-checks periodically. Otherwise it waits for storage and uplink to
//! report readiness, bounded by a timeout, then checks again: an awake
//! request that arrived during the wait cancels the sleep.

mod barrier;

pub use barrier::*;

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_time::{Duration, Timer};
use log::info;

use crate::config::{DutyCycleConfig, SettingsStore};
use crate::events::{Event, EventBus, SubscriptionId, Topic};
use crate::input::Button;

/// Sticky force-awake flag, set by a wake button press and never cleared for
/// the rest of the boot.
pub struct WakeLatch {
    forced: AtomicBool,
}

impl WakeLatch {
    pub const fn new() -> Self {
        Self {
            forced: AtomicBool::new(false),
        }
    }

    pub fn force(&self) {
        self.forced.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    /// Set the latch on a wake button press and cancel a running quorum
    /// wait.
    pub fn attach(
        &'static self,
        bus: &EventBus,
        barrier: &'static ReadinessBarrier,
    ) -> SubscriptionId {
        bus.subscribe(Topic::ButtonPressed, move |event| {
            if let Event::ButtonPressed(Button::Wake) = event {
                info!("Wake button pressed, staying awake");
                self.force();
                barrier.interrupt();
            }
            Ok(())
        })
    }
}

impl Default for WakeLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Live hardware switch that keeps the node awake while on.
pub trait OverrideSwitch {
    fn is_on(&mut self) -> bool;
}

impl<F: FnMut() -> bool> OverrideSwitch for F {
    fn is_on(&mut self) -> bool {
        self()
    }
}

/// Arms the wake timer and cuts power. Does not return; the node boots
/// again when the timer fires.
pub trait PowerControl {
    fn power_down(&mut self, duration: Duration) -> !;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepState {
    Awake,
    WaitingForQuorum,
    PoweredDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepDecision {
    StayAwake,
    PowerDown(Duration),
}

pub struct SleepController<'a, O> {
    latch: &'a WakeLatch,
    switch: O,
    barrier: &'a ReadinessBarrier,
    settings: &'a SettingsStore,
    quorum_timeout: Duration,
    awake_recheck: Duration,
    state: SleepState,
}

impl<'a, O: OverrideSwitch> SleepController<'a, O> {
    pub fn new(
        latch: &'a WakeLatch,
        switch: O,
        barrier: &'a ReadinessBarrier,
        settings: &'a SettingsStore,
        config: &DutyCycleConfig,
    ) -> Self {
        Self {
            latch,
            switch,
            barrier,
            settings,
            quorum_timeout: config.quorum_timeout,
            awake_recheck: config.awake_recheck,
            state: SleepState::Awake,
        }
    }

    pub fn state(&self) -> SleepState {
        self.state
    }

    /// Force-awake latch OR override switch.
    pub fn stay_awake(&mut self) -> bool {
        let latched = self.latch.is_set();
        let switched = self.switch.is_on();
        let awake = latched || switched;
        info!(
            "stay_awake: latch {}, switch {} -> {}",
            latched,
            switched,
            if awake { "we stay awake" } else { "we go to sleep" }
        );
        awake
    }

    /// One pass of the controller loop.
    ///
    /// Forced awake: idle for the re-check period and stay awake. Otherwise
    /// wait for the readiness quorum and decide again.
    pub async fn step(&mut self) -> SleepDecision {
        if self.stay_awake() {
            self.state = SleepState::Awake;
            Timer::after(self.awake_recheck).await;
            return SleepDecision::StayAwake;
        }

        self.state = SleepState::WaitingForQuorum;
        let outcome = self.barrier.wait(self.quorum_timeout).await;
        match outcome.end {
            QuorumEnd::Complete => info!("SD card & uplink are done"),
            QuorumEnd::TimedOut => info!(
                "Readiness timed out (storage {}, uplink {})",
                outcome.storage_ready, outcome.uplink_ready
            ),
            QuorumEnd::Interrupted => info!("Readiness wait interrupted"),
        }

        if self.stay_awake() {
            self.state = SleepState::Awake;
            return SleepDecision::StayAwake;
        }

        self.state = SleepState::PoweredDown;
        SleepDecision::PowerDown(self.settings.sleep_interval())
    }

    /// Run the controller until it powers the node down.
    pub async fn run<P: PowerControl>(&mut self, power: &mut P) -> ! {
        loop {
            if let SleepDecision::PowerDown(duration) = self.step().await {
                info!("Sleeping for {} seconds", duration.as_secs());
                power.power_down(duration);
            }
        }
    }
}
