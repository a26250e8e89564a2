//! RTC deep sleep and the stay-awake mode switch

use embassy_time::Duration;
use esp_hal::gpio::Input;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::rtc_cntl::sleep::TimerWakeupSource;
use log::info;

use hive_core::power::{OverrideSwitch, PowerControl};
use hive_core::radio::SequenceMark;

/// Powers the chip down with only the RTC timer running. Waking up is a
/// full reboot.
pub struct DeepSleep {
    rtc: Rtc<'static>,
}

impl DeepSleep {
    pub fn new(lpwr: esp_hal::peripherals::LPWR<'static>) -> Self {
        Self { rtc: Rtc::new(lpwr) }
    }
}

impl PowerControl for DeepSleep {
    fn power_down(&mut self, duration: Duration) -> ! {
        info!("Entering deep sleep for {} s", duration.as_secs());
        let timer = TimerWakeupSource::new(core::time::Duration::from_secs(duration.as_secs()));
        self.rtc.sleep_deep(&[&timer])
    }
}

/// The mode switch; pulled high keeps the node awake.
pub struct ModeSwitch {
    pin: Input<'static>,
}

impl ModeSwitch {
    pub fn new(pin: Input<'static>) -> Self {
        Self { pin }
    }
}

impl OverrideSwitch for ModeSwitch {
    fn is_on(&mut self) -> bool {
        self.pin.is_high()
    }
}

const MARK_MAGIC: u64 = 0x4849_5645_5345_5121;

/// Magic word and last sent sequence. RTC fast memory keeps its contents
/// through deep sleep; after a power-on reset it holds garbage, so the value
/// only counts when the magic word matches.
#[esp_hal::ram(unstable(rtc_fast, persistent))]
static mut SEQUENCE_MARK: [u64; 2] = [0; 2];

/// Last relayed sequence, kept in RTC memory so a wake that could not append
/// to the card still resumes past it.
pub struct RtcSequenceMark {
    _private: (),
}

impl RtcSequenceMark {
    /// Only one mark may exist per boot; it owns the RTC slot.
    pub fn take() -> Self {
        Self { _private: () }
    }
}

impl SequenceMark for RtcSequenceMark {
    fn last_sent(&self) -> Option<u64> {
        // Copy out by value, no reference to the static is formed
        let [magic, sequence] = unsafe { SEQUENCE_MARK };
        (magic == MARK_MAGIC).then_some(sequence)
    }

    fn set_last_sent(&mut self, sequence: u64) {
        unsafe { SEQUENCE_MARK = [MARK_MAGIC, sequence] };
    }
}
