use anyhow::{anyhow, bail, Result};
use clap::ArgMatches;
use env_logger::Env;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::services::MeterFleet;
use crate::sml::obis::{CodeCatalog, ObisCatalog};
use crate::storage::MeterStore;

pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(level)).try_init();
}

fn config_path(matches: &ArgMatches) -> &str {
    matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH)
}

/// Runs one-shot subcommands. Returns `false` when the fleet should run.
pub async fn handle_subcommands(matches: &ArgMatches) -> Result<bool> {
    let path = config_path(matches);

    match matches.subcommand() {
        Some(("ports", _)) => {
            list_ports()?;
            Ok(true)
        }
        Some(("check-config", _)) => {
            check_config(path)?;
            Ok(true)
        }
        Some(("init-config", sub)) => {
            let target = sub.get_one::<String>("path").map(String::as_str).unwrap_or(path);
            init_config(target, sub.get_flag("force"))?;
            Ok(true)
        }
        Some(("tail", sub)) => {
            let meter = sub
                .get_one::<String>("meter")
                .ok_or_else(|| anyhow!("missing meter id"))?;
            let count = sub.get_one::<usize>("count").copied().unwrap_or(20);
            tail(&Config::from_file(path)?, meter, count).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn list_ports() -> Result<()> {
    println!("📡 Available Serial Ports:");

    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("   ⚠️  No serial ports found");
        return Ok(());
    }

    for (index, port) in ports.iter().enumerate() {
        println!("   {}. {}", index + 1, port.port_name);
        if let serialport::SerialPortType::UsbPort(usb_info) = &port.port_type {
            println!("      🆔 VID:PID {:04x}:{:04x}", usb_info.vid, usb_info.pid);
            if let Some(manufacturer) = &usb_info.manufacturer {
                println!("      📱 Manufacturer: {}", manufacturer);
            }
            if let Some(serial_number) = &usb_info.serial_number {
                println!("      🔢 Serial Number: {}", serial_number);
            }
        }
    }

    Ok(())
}

fn check_config(path: &str) -> Result<()> {
    let config = Config::from_file(path)?;

    println!("✅ {} is valid", path);
    for (id, meter) in &config.meters {
        println!(
            "   {} {} -> {} ({} baud, {} filtered code(s)){}",
            if meter.enabled { "🟢" } else { "⚪" },
            id,
            meter.database.display(),
            meter.serial.baud_rate,
            meter.filter.len(),
            if meter.note.is_empty() {
                String::new()
            } else {
                format!(" - {}", meter.note)
            }
        );
    }
    Ok(())
}

fn init_config(path: &str, force: bool) -> Result<()> {
    if Path::new(path).exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path);
    }
    Config::example().save_to_file(path)?;
    println!("📝 Example configuration written to {}", path);
    Ok(())
}

async fn tail(config: &Config, meter: &str, count: usize) -> Result<()> {
    let meter_config = config
        .meters
        .get(meter)
        .ok_or_else(|| anyhow!("meter '{}' is not configured", meter))?;
    if !meter_config.database.exists() {
        bail!("database {} does not exist", meter_config.database.display());
    }

    let mut store = MeterStore::open(
        meter,
        &meter_config.note,
        &meter_config.store_options(&config.general),
        Arc::new(ObisCatalog),
    )
    .await?;

    let stats = store.stats().await?;
    println!("📊 {} ({})", meter, meter_config.database.display());
    println!(
        "   devices {} | units {} | codes {} | timestamps {} | points {}",
        stats.devices, stats.units, stats.codes, stats.timestamps, stats.points
    );

    match store.view_rows().await {
        Ok(rows) => {
            let skip = rows.len().saturating_sub(count);
            for row in &rows[skip..] {
                println!(
                    "   {}  {:<16} {:>20} {:<6} {}",
                    row.timestamp,
                    row.code,
                    row.value.to_string(),
                    row.unit_desc.as_deref().unwrap_or(""),
                    row.code_desc.as_deref().unwrap_or("")
                );
            }
        }
        Err(e) => println!("   ⚠️  No readings yet ({})", e),
    }

    store.close().await?;
    Ok(())
}

/// Starts every enabled meter and supervises them until Ctrl-C or until no
/// meter is left alive.
pub async fn run_fleet(config: &Config) -> Result<()> {
    let catalog: Arc<dyn CodeCatalog> = Arc::new(ObisCatalog);
    let mut fleet = MeterFleet::start(config, Handle::current(), catalog);
    if fleet.is_empty() {
        bail!("no meter could be started");
    }

    let poll = config.general.liveness_poll();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("🛑 Shutdown requested");
                break;
            }
            _ = tokio::time::sleep(poll) => {
                if !fleet.is_alive() {
                    warn!("⚠️ All meters stopped");
                    break;
                }
            }
        }
    }

    fleet.stop();
    fleet.wait_stopped(poll).await;
    fleet.join();
    info!("👋 All meters closed");
    Ok(())
}
