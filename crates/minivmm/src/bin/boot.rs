//! Boot an xv6 boot sector and disk image.
//!
//! Usage: cargo run --bin boot -- [boot-sector] [disk-image] [serial-out]
//!
//! Paths not given fall back to `../xv6/bootblock`, `../xv6/xv6.img` and
//! `out.txt`.  The guest's serial output is appended to `serial-out`.

use std::env;
use std::error::Error;
use std::fs::{self, OpenOptions};

use minivmm::devices::ide::IdeDisk;
use minivmm::dispatcher::Halted;
use minivmm::machine::Machine;
use minivmm::vm::VmConfig;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = VmConfig::default();
    let mut args = env::args().skip(1);
    if let Some(path) = args.next() {
        config.boot_sector_path = path.into();
    }
    if let Some(path) = args.next() {
        config.disk_image_path = path.into();
    }
    if let Some(path) = args.next() {
        config.serial_output_path = path.into();
    }

    match boot(&config) {
        Ok(halted) => {
            log::info!(
                "Guest halted at rip {:#x} after {} exits",
                halted.rip,
                halted.exits,
            );
        }
        Err(e) => {
            log::error!("VM error: {}", e);
            let mut source = e.source();
            while let Some(cause) = source {
                log::error!("  caused by: {}", cause);
                source = cause.source();
            }
            std::process::exit(1);
        }
    }
}

fn boot(config: &VmConfig) -> Result<Halted, Box<dyn Error>> {
    log::info!("Loading boot sector: {}", config.boot_sector_path.display());
    let boot_sector = fs::read(&config.boot_sector_path)
        .map_err(|e| format!("Failed to read {}: {e}", config.boot_sector_path.display()))?;

    log::info!("Opening disk image: {}", config.disk_image_path.display());
    let disk = IdeDisk::open(&config.disk_image_path)
        .map_err(|e| format!("Failed to read {}: {e}", config.disk_image_path.display()))?;

    let serial_out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.serial_output_path)
        .map_err(|e| format!("Failed to open {}: {e}", config.serial_output_path.display()))?;

    let mut machine = Machine::new(config, disk, serial_out)?;
    machine.load_boot_sector(&boot_sector)?;

    log::info!("Running VM...");
    Ok(machine.run()?)
}
