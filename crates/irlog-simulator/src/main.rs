//! Desktop simulator for the irlog temperature logger.
//!
//! Runs the logging loop against an in-memory SD card and a simulated
//! MLX90614, so the mount/append lifecycle and the PEC handling can be
//! watched without hardware. Set `RUST_LOG=debug` for driver detail.
//!
//! ```text
//! irlog-simulator [SAMPLES] [INTERVAL_MS]
//! ```

mod sim_hw;

use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use irlog_core::config::{I2cPins, MountOptions, SpiPins};
use irlog_core::sensors::{DEFAULT_FREQUENCY_HZ, Mlx90614};
use irlog_core::storage::{
    EVENT_LOG_PATH, FixedTimeSource, RamBus, RamCard, StorageSession, UnmountStatus,
};

use sim_hw::SimulatedController;

// ---------------------------------------------------------------------------
// Board wiring
// ---------------------------------------------------------------------------

const SD_PINS: SpiPins = SpiPins::new(12, 11, 13, 10);
const SENSOR_PINS: I2cPins = I2cPins::new(16, 15);

/// Temperature log on the card.
const LOG_PATH: &str = "/sdcard/MLX90614.TXT";

const DEFAULT_SAMPLES: u32 = 20;
const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

fn parse_args() -> (u32, Duration) {
    let mut args = std::env::args().skip(1);

    let samples = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SAMPLES);
    let interval = args
        .next()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_INTERVAL);

    (samples, interval)
}

/// Log card capacity to the console and the card's event log. Returns the
/// number of events written.
fn report_space(storage: &StorageSession<RamCard, FixedTimeSource>) -> usize {
    let space = match storage.space_info() {
        Ok(space) => space,
        Err(e) => {
            warn!("SD card space unknown: {}", e);
            return 0;
        }
    };
    info!(
        "SD card: {:.2} MiB total, {:.2} MiB free",
        space.total_mib(),
        space.free_mib()
    );

    let mut logged = 0;
    for event in [
        format!("Total Space: {:.2} MB", space.total_mib()),
        format!("Free Space: {:.2} MB", space.free_mib()),
    ] {
        match storage.log_event("SD_CARD", &event) {
            Ok(()) => logged += 1,
            Err(e) => warn!("Event not logged: {}", e),
        }
    }
    logged
}

fn main() {
    env_logger::init();
    let (samples, interval) = parse_args();
    info!(
        "Starting irlog simulator: {} samples every {} ms",
        samples,
        interval.as_millis()
    );

    // -----------------------------------------------------------------------
    // Storage
    // -----------------------------------------------------------------------
    let mut bus = RamBus::new(RamCard::blank(RamCard::DEFAULT_BLOCKS));
    let mut storage = match StorageSession::mount(
        &mut bus,
        SD_PINS,
        MountOptions::default(),
        FixedTimeSource::default(),
    ) {
        Ok(storage) => storage,
        Err(e) => {
            error!("SD card unavailable: {}", e);
            return;
        }
    };

    report_space(&storage);

    if !storage.file_exists(LOG_PATH) {
        if let Err(e) = storage.create_file(LOG_PATH) {
            error!("Cannot create {}: {}", LOG_PATH, e);
            storage.unmount(&mut bus);
            return;
        }
    }

    // -----------------------------------------------------------------------
    // Sensor
    // -----------------------------------------------------------------------
    let mut controller = SimulatedController::default();
    let mut sensor = match Mlx90614::init(&mut controller, SENSOR_PINS, DEFAULT_FREQUENCY_HZ) {
        Ok(sensor) => sensor,
        Err(e) => {
            error!("MLX90614 unavailable: {}", e);
            storage.unmount(&mut bus);
            return;
        }
    };

    // -----------------------------------------------------------------------
    // Logging loop
    // -----------------------------------------------------------------------
    let mut logged = 0;
    for _ in 0..samples {
        match sensor.read_temperature() {
            Ok(sample) => {
                info!(
                    "Object temperature: {:.2} C / {:.2} F",
                    sample.celsius(),
                    sample.fahrenheit()
                );
                match storage.append(LOG_PATH, &sample.to_record()) {
                    Ok(()) => logged += 1,
                    Err(e) => warn!("Sample dropped: {}", e),
                }
            }
            Err(e) => warn!("Sample skipped: {}", e),
        }

        thread::sleep(interval);
    }
    info!("Logged {} of {} samples", logged, samples);

    // -----------------------------------------------------------------------
    // Read back
    // -----------------------------------------------------------------------
    for path in [LOG_PATH, EVENT_LOG_PATH] {
        match storage.read(path) {
            Ok(lines) => {
                println!("--- {} ({} lines)", path, lines.len());
                for line in &lines {
                    println!("{}", line);
                }
            }
            Err(e) => warn!("Cannot read {}: {}", path, e),
        }
    }

    if let Ok(space) = storage.space_info() {
        println!(
            "--- {} of {} bytes free",
            space.free_bytes, space.total_bytes
        );
    }

    match storage.unmount(&mut bus) {
        UnmountStatus::Unmounted => info!("SD card unmounted"),
        status => warn!("SD card unmount: {:?}", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_space_logs_both_events() {
        let mut bus = RamBus::new(RamCard::blank(RamCard::DEFAULT_BLOCKS));
        let mut storage = StorageSession::mount(
            &mut bus,
            SD_PINS,
            MountOptions::default(),
            FixedTimeSource::default(),
        )
        .unwrap();

        assert_eq!(report_space(&storage), 2);
        assert_eq!(storage.read(EVENT_LOG_PATH).unwrap().len(), 2);

        storage.unmount(&mut bus);
        assert_eq!(report_space(&storage), 0);
    }
}
