#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use alloc::format;

use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::clock::CpuClock;
use esp_hal::delay::Delay;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::spi::Mode;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use log::{error, info, warn};

use irlog_core::config::{I2cPins, MountOptions, SpiPins};
use irlog_core::sensors::{DEFAULT_FREQUENCY_HZ, Mlx90614};
use irlog_core::storage::{FixedTimeSource, SpiCardBus, StorageSession};
use irlog_firmware::hardware::EspI2cController;

extern crate alloc;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

// This creates a default app-descriptor required by the esp-idf bootloader.
esp_bootloader_esp_idf::esp_app_desc!();

const SD_PINS: SpiPins = SpiPins::new(12, 11, 13, 10);
const SENSOR_PINS: I2cPins = I2cPins::new(16, 15);

/// Temperature log on the card.
const LOG_PATH: &str = "/sdcard/MLX90614.TXT";

/// SD cards must be brought up at 400 kHz or less.
const SD_INIT_RATE_KHZ: u32 = 400;

const SAMPLE_INTERVAL_MS: u32 = 1000;

fn halt() -> ! {
    let delay = Delay::new();
    loop {
        delay.delay_millis(SAMPLE_INTERVAL_MS);
    }
}

#[esp_hal::main]
fn main() -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let delay = Delay::new();

    // 1. SD card on SPI2 (CLK=12, MOSI=11, MISO=13, CS=10)
    let spi_config = SpiConfig::default()
        .with_frequency(Rate::from_khz(SD_INIT_RATE_KHZ))
        .with_mode(Mode::_0);
    let spi_bus = match Spi::new(peripherals.SPI2, spi_config) {
        Ok(spi) => spi
            .with_sck(peripherals.GPIO12)
            .with_mosi(peripherals.GPIO11)
            .with_miso(peripherals.GPIO13),
        Err(e) => {
            error!("SPI2 configuration rejected: {:?}", e);
            halt();
        }
    };
    let cs = Output::new(peripherals.GPIO10, Level::High, OutputConfig::default());
    let Ok(sd_spi) = ExclusiveDevice::new(spi_bus, cs, delay);

    let mut sd_bus = SpiCardBus::new(sd_spi, delay);
    let mut storage = match StorageSession::mount(
        &mut sd_bus,
        SD_PINS,
        MountOptions::default(),
        FixedTimeSource::default(),
    ) {
        Ok(storage) => storage,
        Err(e) => {
            error!("SD card unavailable: {}", e);
            halt();
        }
    };

    match storage.space_info() {
        Ok(space) => {
            for event in [
                format!("Total Space: {:.2} MB", space.total_mib()),
                format!("Free Space: {:.2} MB", space.free_mib()),
            ] {
                if let Err(e) = storage.log_event("SD_CARD", &event) {
                    warn!("Event not logged: {}", e);
                }
            }
        }
        Err(e) => warn!("SD card space unknown: {}", e),
    }

    if !storage.file_exists(LOG_PATH) {
        if let Err(e) = storage.create_file(LOG_PATH) {
            error!("Cannot create {}: {}", LOG_PATH, e);
            storage.unmount(&mut sd_bus);
            halt();
        }
    }

    // 2. MLX90614 on I2C0 (SCL=16, SDA=15)
    let mut controller =
        EspI2cController::new(peripherals.I2C0, peripherals.GPIO15, peripherals.GPIO16);
    let mut sensor = match Mlx90614::init(&mut controller, SENSOR_PINS, DEFAULT_FREQUENCY_HZ) {
        Ok(sensor) => sensor,
        Err(e) => {
            error!("MLX90614 unavailable: {}", e);
            storage.unmount(&mut sd_bus);
            halt();
        }
    };

    info!("Logging to {} every {} ms", LOG_PATH, SAMPLE_INTERVAL_MS);

    loop {
        match sensor.read_temperature() {
            Ok(sample) => {
                info!(
                    "Object temperature: {:.2} C / {:.2} F",
                    sample.celsius(),
                    sample.fahrenheit()
                );
                if let Err(e) = storage.append(LOG_PATH, &sample.to_record()) {
                    warn!("Sample dropped: {}", e);
                }
            }
            Err(e) => warn!("Sample skipped: {}", e),
        }

        delay.delay_millis(SAMPLE_INTERVAL_MS);
    }
}
