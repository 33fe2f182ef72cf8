// blerelay: BLE GATT man-in-the-middle relay
//
// Connects to the real device as a central, impersonates it toward a victim as
// a peripheral, and relays GATT traffic through an interception pipeline.

mod central;
mod config;
mod peripheral;

use anyhow::{Context, Result};
use blerelay_core::downstream::PeripheralBridge;
use blerelay_core::pipeline::{Pipeline, PipelineConfig};
use blerelay_core::session::{RelayError, SessionController, SessionState, EXIT_FATAL, EXIT_OK};
use blerelay_core::sim::{SimCentral, SimPeripheral};
use blerelay_core::topology::scan::DEFAULT_SCAN_RESULTS;
use blerelay_core::topology::{short_uuid, DeviceProfile, HostCapabilities, PeerAddress, ScanRecord, ScanResults};
use blerelay_core::upstream::CentralBridge;
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "blerelay")]
#[command(about = "BLE GATT man-in-the-middle relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log at debug level, including relayed payloads
    #[arg(long, global = true)]
    debug: bool,

    /// Also write daily-rolling log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log to the console as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Impersonate a device and relay a victim's traffic to it
    Relay(RelayArgs),
    /// Print the victim/target handle table of a profile
    InspectProfile { file: PathBuf },
    /// List devices from a scan results file
    Targets {
        #[arg(long, default_value = DEFAULT_SCAN_RESULTS)]
        scan_results: PathBuf,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct RelayArgs {
    /// Target address or advertised name (names are looked up in the scan results)
    #[arg(short, long)]
    target: String,

    /// Bluetooth adapter, e.g. hci0
    #[arg(long)]
    adapter: Option<String>,

    /// Profile file; defaults to <ADDRESS>_profile.json
    #[arg(long)]
    profile: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_SCAN_RESULTS)]
    scan_results: PathBuf,

    /// Interception pipeline file
    #[arg(long)]
    pipeline: Option<PathBuf>,

    /// Advertised name override
    #[arg(long)]
    name: Option<String>,

    /// Upstream connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Upstream operation timeout in seconds
    #[arg(long)]
    op_timeout: Option<u64>,

    /// Follow the victim's subscriptions instead of subscribing up front
    #[arg(long)]
    no_auto_subscribe: bool,

    /// Relay as soon as the victim connects, without waiting for pairing
    #[arg(long)]
    no_pairing: bool,

    /// Run against simulated radios instead of the host adapters
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
    Path,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match config::Config::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {:#}", "error:".bright_red().bold(), e);
            std::process::exit(EXIT_FATAL);
        }
    };

    let log_dir = cli.log_dir.clone().or_else(|| settings.log_dir.clone());
    // Held until exit so buffered file logs are flushed
    let _guard = match init_logging(&cli, log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{} {:#}", "error:".bright_red().bold(), e);
            std::process::exit(EXIT_FATAL);
        }
    };

    let result = match cli.command {
        Commands::Relay(args) => cmd_relay(args, settings).await,
        Commands::InspectProfile { file } => cmd_inspect_profile(&file),
        Commands::Targets { scan_results } => cmd_targets(&scan_results),
        Commands::Config { action } => cmd_config(action, settings),
    };

    let code = match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("{} {:#}", "error:".bright_red().bold(), e);
            e.downcast_ref::<RelayError>()
                .map(RelayError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn init_logging(cli: &Cli, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "blerelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let json_layer = cli.log_json.then(|| fmt::layer().json());
    let text_layer = (!cli.log_json).then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

// ============================================================================
// RELAY
// ============================================================================

async fn cmd_relay(args: RelayArgs, settings: config::Config) -> Result<()> {
    let scan = if args.scan_results.exists() {
        Some(ScanResults::load(&args.scan_results).context("Failed to load scan results")?)
    } else {
        None
    };
    let record: Option<ScanRecord> = scan
        .as_ref()
        .and_then(|scan| scan.locate(&args.target))
        .cloned();
    let address = resolve_target(&args.target, record.as_ref())?;

    let mut relay = settings.relay_config();
    if let Some(secs) = args.connect_timeout {
        relay = relay.with_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.op_timeout {
        relay = relay.with_operation_timeout(Duration::from_secs(secs));
    }
    if args.no_auto_subscribe {
        relay = relay.with_auto_subscribe(false);
    }
    if args.no_pairing {
        relay = relay.with_require_pairing(false);
    }
    if let Some(name) = &args.name {
        relay = relay.with_advertise_name(name.clone());
    }

    let profile_path = args
        .profile
        .clone()
        .unwrap_or_else(|| DeviceProfile::default_path(&address));
    let mut profile =
        DeviceProfile::load(&profile_path, &relay.host_capabilities).map_err(RelayError::from)?;
    if !profile.advertisement_captured {
        if let Some(record) = &record {
            record.enrich(&mut profile.advertisement);
        }
    }

    let pipeline = match args.pipeline.clone().or_else(|| settings.default_pipeline.clone()) {
        Some(path) => PipelineConfig::load(&path)
            .and_then(|config| config.build(&profile))
            .map_err(RelayError::from)?,
        None => Pipeline::identity(),
    };
    if !pipeline.is_identity() {
        info!("Interception pipeline has {} transform(s)", pipeline.slots().len());
    }

    let adapter = args.adapter.clone().or_else(|| settings.adapter.clone());
    let (central, peripheral): (Arc<dyn CentralBridge>, Arc<dyn PeripheralBridge>) = if args.dry_run {
        warn!("Dry run: relaying between simulated radios");
        (
            Arc::new(SimCentral::from_profile(&profile)),
            Arc::new(SimPeripheral::new()),
        )
    } else {
        let central = central::BtleplugCentral::open(adapter.as_deref())
            .await
            .map_err(RelayError::from)?;
        let peripheral = peripheral::BluezPeripheral::open(
            adapter.as_deref(),
            vec![address],
            relay.require_pairing,
        )
        .await
        .map_err(RelayError::from)?;
        (Arc::new(central), Arc::new(peripheral))
    };

    let controller = SessionController::new(relay, profile, pipeline, central, peripheral)?;
    let handle = controller.handle();

    let on_ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            println!("{}", "Shutting down...".bold());
            on_ctrl_c.shutdown();
        }
    });

    let mut states = handle.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            print_state(state);
        }
    });

    println!("{} {}", "Relaying".bold(), address.to_string().bright_cyan());
    controller.run(&address).await?;
    println!("{} Session closed", "✓".green());
    Ok(())
}

fn resolve_target(target: &str, record: Option<&ScanRecord>) -> Result<PeerAddress> {
    if let Ok(address) = target.parse::<PeerAddress>() {
        return Ok(address);
    }
    let record = record.with_context(|| {
        format!("{} is not an address and was not found in the scan results", target)
    })?;
    record
        .peer_address()
        .with_context(|| format!("Scan record for {} has an invalid address", target))
}

fn print_state(state: SessionState) {
    let label = state.to_string();
    let label = match state {
        SessionState::Relaying => label.bright_green(),
        SessionState::Advertising | SessionState::PairingVictim => label.bright_yellow(),
        SessionState::Closing | SessionState::Closed => label.bright_red(),
        _ => label.normal(),
    };
    println!("  {} {}", "•".bright_cyan(), label);
}

// ============================================================================
// PROFILES & TARGETS
// ============================================================================

fn cmd_inspect_profile(file: &Path) -> Result<()> {
    let profile = DeviceProfile::load(file, &HostCapabilities::default()).map_err(RelayError::from)?;

    println!("{}", "Device".bold());
    println!("  Name:    {}", profile.name.as_deref().unwrap_or("(none)").bright_cyan());
    if let Some(address) = profile.address {
        println!("  Address: {} ({:?})", address, profile.address_type);
    }
    if let Some(mtu) = profile.mtu {
        println!("  MTU:     {}", mtu);
    }
    println!(
        "  Advert:  {}{}",
        hex::encode(profile.advertisement_payload()),
        if profile.advertisement_captured {
            ""
        } else {
            " (synthesized)"
        }
    );
    println!();

    println!(
        "  {:<8} {:<8} {:<38} {}",
        "VICTIM".bold(),
        "TARGET".bold(),
        "UUID".bold(),
        "PROPERTIES".bold()
    );
    for service in &profile.services {
        println!(
            "  {:<8} {:<8} {}",
            format!("0x{:04X}", service.handle),
            "",
            describe(&service.uuid, service.description.as_deref()).bright_cyan()
        );
        for characteristic in &service.characteristics {
            println!(
                "  {:<8} {:<8} {:<38} {}",
                format!("0x{:04X}", characteristic.victim_handle),
                target(characteristic.target_handle),
                describe(&characteristic.uuid, characteristic.description.as_deref()),
                characteristic.properties.names().join(",").dimmed()
            );
            for descriptor in &characteristic.descriptors {
                println!(
                    "  {:<8} {:<8}   {}{}",
                    format!("0x{:04X}", descriptor.victim_handle),
                    target(descriptor.target_handle),
                    describe(&descriptor.uuid, None),
                    if descriptor.synthesized {
                        " (synthesized)"
                    } else {
                        ""
                    }
                );
            }
        }
    }
    Ok(())
}

fn describe(uuid: &Uuid, description: Option<&str>) -> String {
    let id = match short_uuid(uuid) {
        Some(short) => format!("0x{:04X}", short),
        None => uuid.to_string(),
    };
    match description {
        Some(text) => format!("{} {}", id, text),
        None => id,
    }
}

fn target(handle: Option<u16>) -> String {
    handle
        .map(|h| format!("0x{:04X}", h))
        .unwrap_or_else(|| "-".to_string())
}

fn cmd_targets(scan_results: &Path) -> Result<()> {
    let scan = ScanResults::load(scan_results)
        .with_context(|| format!("Failed to load {}", scan_results.display()))?;

    if scan.records().is_empty() {
        println!("{}", "No devices in scan results.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Targets".bold(), scan.records().len());
    println!();
    for record in scan.records() {
        println!(
            "  {} {} {}",
            "•".bright_green(),
            record.address.bright_cyan(),
            record.name.as_deref().unwrap_or("(unnamed)")
        );
        let rssi = record
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "    RSSI: {}  Services: {}",
            rssi.dimmed(),
            record.services.len()
        );
    }
    Ok(())
}

// ============================================================================
// CONFIG
// ============================================================================

fn cmd_config(action: ConfigAction, mut settings: config::Config) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in settings.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Set { key, value } => {
            settings.set(&key, &value)?;
            settings.save()?;
            let shown = settings.get(&key).unwrap_or(value);
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), shown);
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }
    Ok(())
}
