#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Instant, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::spi::master::Spi;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::{Async, Blocking};
use log::{error, info, warn};
use static_cell::StaticCell;

use hive_core::config::{DutyCycleConfig, SettingsStore};
use hive_core::events::{DispatchPolicy, EventBus};
use hive_core::input::{Button, ButtonWorker, EdgeQueue};
use hive_core::power::{ReadinessBarrier, SleepController, WakeLatch};
use hive_core::radio::{
    BaseStation, FIELD_DEVICE_IDS, FieldLink, NodeRole, RelayOutbox, TxPowerRequest,
};
use hive_core::sensors::SensorAggregator;
use hive_core::sensors::sht3x::Sht3xBus;
use hive_core::storage::sd_card::SdCardStore;
use hive_core::storage::{PersistentLog, StorageInbox, load_settings};

use hive_firmware::app_state::{self, AppError, AppRunState, AppState, BootClock};
use hive_firmware::power::{DeepSleep, ModeSwitch, RtcSequenceMark};
use hive_firmware::rf95::Rf95;

type LoraRadio =
    Rf95<ExclusiveDevice<Spi<'static, Async>, Output<'static>, Delay>, Output<'static>, Input<'static>>;
type CardStore =
    SdCardStore<ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>, Delay, BootClock>;

static BUS: EventBus = EventBus::new(DispatchPolicy::Continue);
static BARRIER: ReadinessBarrier = ReadinessBarrier::new();
static LATCH: WakeLatch = WakeLatch::new();
static INBOX: StorageInbox = StorageInbox::new();
static OUTBOX: RelayOutbox = RelayOutbox::new();
static TX_POWER: TxPowerRequest = TxPowerRequest::new();
static EDGES: EdgeQueue = EdgeQueue::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[embassy_executor::task]
async fn storage_task(mut log: PersistentLog<CardStore>) {
    log.run(&INBOX, &BUS).await
}

#[embassy_executor::task]
async fn field_task(mut link: FieldLink<LoraRadio, RtcSequenceMark>) {
    link.run(&OUTBOX, &TX_POWER, &BUS).await
}

#[embassy_executor::task]
async fn base_task(mut station: BaseStation<LoraRadio>) {
    station.run(&TX_POWER, &BUS).await
}

/// Stands in for the GPIO interrupt: only records the edge.
#[embassy_executor::task]
async fn button_edge_task(mut pin: Input<'static>) {
    loop {
        pin.wait_for_rising_edge().await;
        if !EDGES.record(Button::Wake, Instant::now()) {
            warn!("Button edge queue full, edge dropped");
        }
    }
}

#[embassy_executor::task]
async fn button_worker_task(debounce: Duration) {
    ButtonWorker::new(&EDGES, debounce).run(&BUS).await
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(size: 72 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let mut state = AppState::new();
    let duty_cycle = DutyCycleConfig::default();

    // Settings live on the card next to the log
    let sd_spi = app_state::create_sd_card_spi(
        peripherals.SPI3,
        peripherals.GPIO14,
        peripherals.GPIO15,
        peripherals.GPIO2,
    );
    let sd_cs = Output::new(peripherals.GPIO13, Level::High, OutputConfig::default());
    let sd_device = ExclusiveDevice::new(sd_spi, sd_cs, Delay).unwrap();
    let mut card = app_state::init_sd_card(sd_device, Delay);

    static SETTINGS: StaticCell<SettingsStore> = StaticCell::new();
    let settings: &'static SettingsStore = SETTINGS.init(load_settings(&mut card));

    BARRIER.attach(&BUS);
    LATCH.attach(&BUS, &BARRIER);
    INBOX.attach(&BUS);
    TX_POWER.attach(&BUS);

    let role = NodeRole::select(app_state::hardware_id(), FIELD_DEVICE_IDS);
    state.set_role(role);
    if role == NodeRole::Field {
        OUTBOX.attach(&BUS);
    }
    settings.promote(&BUS);

    spawner.must_spawn(button_edge_task(Input::new(
        peripherals.GPIO0,
        InputConfig::default().with_pull(Pull::Up),
    )));
    spawner.must_spawn(button_worker_task(duty_cycle.button_debounce));

    // Recover the dataset counter from the card
    state.transition(AppRunState::Recovering);
    let log = PersistentLog::open(card, &duty_cycle);
    let recovered_counter = log.counter();
    spawner.must_spawn(storage_task(log));

    let lora_spi = app_state::create_lora_spi(
        peripherals.SPI2,
        peripherals.GPIO5,
        peripherals.GPIO27,
        peripherals.GPIO19,
    );
    let lora_cs = Output::new(peripherals.GPIO18, Level::High, OutputConfig::default());
    let lora_reset = Output::new(peripherals.GPIO23, Level::High, OutputConfig::default());
    let dio0 = Input::new(peripherals.GPIO26, InputConfig::default());
    let mut lora = Rf95::new(
        ExclusiveDevice::new(lora_spi, lora_cs, Delay).unwrap(),
        lora_reset,
        dio0,
    );
    let radio = match lora.init(&mut Delay, settings.radio_power()).await {
        Ok(()) => Some(lora),
        Err(e) => {
            error!("LoRa transceiver not found: {}", e);
            state.fail(AppError::NoRadio(role), &LATCH);
            None
        }
    };

    if role == NodeRole::Base {
        if let Some(radio) = radio {
            state.transition(AppRunState::Relaying(role));
            spawner.must_spawn(base_task(BaseStation::new(radio)));
        }

        // The base is mains powered and never sleeps
        loop {
            Timer::after(duty_cycle.awake_recheck).await;
            info!("Base alive, {} bus faults so far", BUS.faults().count());
        }
    }

    if let Some(radio) = radio {
        // The radio hop is this node's uplink; the link reports its readiness
        spawner.must_spawn(field_task(FieldLink::with_mark(
            radio,
            recovered_counter,
            duty_cycle.send_timeout,
            RtcSequenceMark::take(),
        )));
    }

    state.transition(AppRunState::Sampling);
    let i2c = app_state::create_i2c_bus(peripherals.I2C0, peripherals.GPIO21, peripherals.GPIO22);
    match SensorAggregator::discover(Sht3xBus::new(i2c, Delay), Delay, &duty_cycle, &BUS).await {
        Ok(mut aggregator) => {
            aggregator.sample_and_publish(&BUS).await;
            state.transition(AppRunState::Relaying(role));
        }
        Err(e) => state.fail(AppError::NoSensorBus(e), &LATCH),
    }

    state.transition(AppRunState::WaitingForSleep);
    let mode_switch = ModeSwitch::new(Input::new(peripherals.GPIO34, InputConfig::default()));
    let mut controller = SleepController::new(&LATCH, mode_switch, &BARRIER, settings, &duty_cycle);
    controller.run(&mut DeepSleep::new(peripherals.LPWR)).await
}
