//! flashup CLI - headless driver for the FlashUp update engine.
//!
//! The primary mode is `--script`: load a firmware container, pick a target
//! device and drive the update to completion, exiting 0 on success and 1 on
//! failure. Inspection helpers (`--list-devices`, `--info`) and a container
//! packer (`--pack`) round out the surface.

use anyhow::{bail, Context, Result};
use clap::Parser;
use console::style;
use env_logger::Env;
use flashup::{
    write_package, CoreEvent, FirmwarePackage, FlashUpCore, NetworkFactory, SerialFactory,
    SignatureStatus,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

mod config;

use config::Config;

/// flashup - Firmware/OTA updater for serial and network devices.
///
/// Environment variables:
///   FLASHUP_DEVICE           - Default target device id
///   FLASHUP_NON_INTERACTIVE  - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "flashup")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "For more information, visit: https://github.com/flashup-io/flashup")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Run in headless script mode (requires --firmware and a target device).
    #[arg(short = 's', long = "script")]
    script: bool,

    /// Firmware container path.
    #[arg(short = 'f', long = "firmware", value_name = "PATH")]
    firmware: Option<PathBuf>,

    /// Target device identifier (e.g. "serial:/dev/ttyUSB0", "net:192.168.1.100:8266").
    #[arg(short = 'd', long = "device", value_name = "ID", env = "FLASHUP_DEVICE")]
    device: Option<String>,

    /// Discover and list devices.
    #[arg(long)]
    list_devices: bool,

    /// Show information about a firmware container.
    #[arg(long, value_name = "PATH")]
    info: Option<PathBuf>,

    /// Pack a raw firmware image into a container.
    #[arg(long, value_name = "OUTPUT")]
    pack: Option<PathBuf>,

    /// Raw image to pack (with --pack).
    #[arg(long, value_name = "PATH")]
    payload: Option<PathBuf>,

    /// Firmware name metadata (with --pack).
    #[arg(long, value_name = "NAME")]
    fw_name: Option<String>,

    /// Firmware version metadata (with --pack).
    #[arg(long, value_name = "VERSION")]
    fw_version: Option<String>,

    /// Firmware target metadata (with --pack).
    #[arg(long, value_name = "TARGET")]
    fw_target: Option<String>,

    /// Register a network device for discovery (repeatable).
    #[arg(long = "net-host", value_name = "HOST[:PORT]")]
    net_hosts: Vec<String>,

    /// Output results as JSON to stdout (--list-devices, --info).
    #[arg(long)]
    json: bool,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, env = "FLASHUP_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if std::env::var("NO_COLOR").is_ok() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    debug!("flashup v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    if let Some(path) = &cli.info {
        return cmd_info(path, cli.json);
    }
    if let Some(output) = &cli.pack {
        return cmd_pack(&cli, output.clone());
    }
    if cli.list_devices {
        return cmd_list_devices(&cli, &config);
    }
    if cli.script {
        return cmd_script(&cli, &config);
    }

    // No headless operation requested; the GUI shell drives the core
    // interactively. Point the user at the script surface.
    use clap::CommandFactory;
    Cli::command().print_help()?;
    Ok(())
}

/// Construct an orchestrator with the standard factories.
fn build_core(cli: &Cli, config: &Config) -> FlashUpCore {
    let mut network = NetworkFactory::new();
    for spec in config.network.hosts.iter().chain(cli.net_hosts.iter()) {
        match NetworkFactory::parse_host_spec(spec) {
            Some((host, port)) => network.add_host(host, port),
            None => log::warn!("Ignoring invalid host spec: {spec}"),
        }
    }

    let mut core = FlashUpCore::new();
    core.register_factory(Box::new(SerialFactory::new()));
    core.register_factory(Box::new(network));
    core
}

/// Resolve the target device id from flags, config or an interactive prompt.
fn resolve_device(cli: &Cli, config: &Config, core: &FlashUpCore) -> Result<String> {
    if let Some(device) = &cli.device {
        return Ok(device.clone());
    }
    if let Some(device) = &config.device.default {
        debug!("Using default device from config: {device}");
        return Ok(device.clone());
    }

    let available = core.available_devices();
    if available.is_empty() {
        bail!("No devices found. Specify one with --device or register hosts with --net-host.");
    }
    if cli.non_interactive {
        bail!(
            "No device specified. Available: {}",
            available.join(", ")
        );
    }

    let labels: Vec<String> = available
        .iter()
        .map(|id| {
            let description = core
                .device_info(id)
                .and_then(|info| info.get("description").cloned())
                .map(|d| format!(" - {d}"))
                .unwrap_or_default();
            format!("{id}{description}")
        })
        .collect();

    let selection = dialoguer::Select::with_theme(&dialoguer::theme::ColorfulTheme::default())
        .with_prompt("Select target device")
        .items(&labels)
        .default(0)
        .interact()
        .context("Device selection canceled")?;

    Ok(available[selection].clone())
}

/// Script-mode update: discover, update, exit 0/1.
fn cmd_script(cli: &Cli, config: &Config) -> Result<()> {
    let Some(firmware_path) = &cli.firmware else {
        bail!("--script requires --firmware <PATH>");
    };

    let mut core = build_core(cli, config);
    let events = core.subscribe();
    core.discover_devices();

    let device_id = resolve_device(cli, config, &core)?;
    if !core.available_devices().contains(&device_id) {
        bail!(
            "Unknown device: {device_id}. Available: {}",
            core.available_devices().join(", ")
        );
    }

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware from {}",
            style("📦").cyan(),
            firmware_path.display()
        );
    }

    if !core.update_firmware(&device_id, Some(firmware_path.as_path())) {
        // The reason was already emitted on the event stream and the log.
        drain_errors(&events);
        bail!("Failed to start update for {device_id}");
    }

    if !cli.quiet {
        eprintln!(
            "{} Updating {}",
            style("🔌").cyan(),
            style(&device_id).cyan()
        );
    }

    let bar = if cli.quiet || !console::Term::stderr().is_term() {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        bar
    };

    let mut outcome: Option<(bool, String)> = None;
    while outcome.is_none() {
        core.pump(Instant::now());
        for event in events.try_iter() {
            match event {
                CoreEvent::UpdateProgress {
                    percent, status, ..
                } => {
                    bar.set_position(u64::from(percent));
                    bar.set_message(status);
                }
                CoreEvent::UpdateComplete {
                    success, message, ..
                } => {
                    outcome = Some((success, message));
                }
                _ => {}
            }
        }
        if outcome.is_none() && !core.has_active_jobs() {
            outcome = Some((false, "Update ended without a result".to_string()));
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    let (success, message) = outcome.expect("loop exits with an outcome");
    if success {
        bar.finish_with_message(message.clone());
        if !cli.quiet {
            eprintln!("{} {message}", style("🎉").green().bold());
        }
        Ok(())
    } else {
        bar.abandon_with_message(message.clone());
        eprintln!("{} {message}", style("Error:").red().bold());
        std::process::exit(1);
    }
}

/// Print any error events that are already queued.
fn drain_errors(events: &std::sync::mpsc::Receiver<CoreEvent>) {
    for event in events.try_iter() {
        if let CoreEvent::Log {
            level: flashup::LogLevel::Error,
            message,
        } = event
        {
            eprintln!("{} {message}", style("Error:").red().bold());
        }
    }
}

/// List devices from a discovery pass.
fn cmd_list_devices(cli: &Cli, config: &Config) -> Result<()> {
    let mut core = build_core(cli, config);
    core.discover_devices();

    let devices: Vec<(String, BTreeMap<String, String>)> = core
        .available_devices()
        .into_iter()
        .map(|id| {
            let info = core.device_info(&id).unwrap_or_default();
            (id, info)
        })
        .collect();

    if cli.json {
        let list: Vec<serde_json::Value> = devices
            .iter()
            .map(|(id, info)| serde_json::json!({ "id": id, "info": info }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&list).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Discovered devices").bold().underlined());
    if devices.is_empty() {
        eprintln!("  {}", style("No devices found").dim());
    } else {
        for (id, info) in &devices {
            let kind = info.get("type").map(String::as_str).unwrap_or("?");
            let description = info
                .get("description")
                .map(|d| format!(" - {}", style(d).dim()))
                .unwrap_or_default();
            eprintln!(
                "  {} {} [{}]{}",
                style("•").green(),
                style(id).cyan(),
                kind,
                description
            );
        }
    }
    Ok(())
}

/// Show firmware container information.
fn cmd_info(path: &PathBuf, json: bool) -> Result<()> {
    let package = FirmwarePackage::from_file(path)
        .with_context(|| format!("Failed to load firmware from {}", path.display()))?;

    let metadata = package.metadata();
    let signature = match package.verify_signature() {
        SignatureStatus::Absent => "absent",
        SignatureStatus::Unverified => "present (unverified)",
    };

    if json {
        let info = serde_json::json!({
            "metadata": metadata,
            "payload_size": package.size(),
            "sha256": package.sha256(),
            "signature": signature,
            "chunks_1k": package.chunk_count(1024),
            "chunks_4k": package.chunk_count(4096),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&info).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Firmware package").bold().underlined());
    eprintln!("  Name:      {}", metadata["name"]);
    eprintln!("  Version:   {}", metadata["version"]);
    eprintln!("  Target:    {}", metadata["target"]);
    eprintln!("  Timestamp: {}", metadata["timestamp"]);
    eprintln!("  Payload:   {} bytes", package.size());
    eprintln!("  SHA-256:   {} {}", package.sha256(), style("✓ verified").green());
    eprintln!("  Signature: {signature}");

    let extra: Vec<(&String, &String)> = metadata
        .iter()
        .filter(|(k, _)| {
            !matches!(
                k.as_str(),
                "name" | "version" | "target" | "timestamp" | "sha256" | "signature"
            )
        })
        .collect();
    if !extra.is_empty() {
        eprintln!("\n{}", style("Additional metadata").bold());
        for (key, value) in extra {
            eprintln!("  {key}: {value}");
        }
    }
    Ok(())
}

/// Pack a raw image into a FLASHUP container.
fn cmd_pack(cli: &Cli, output: PathBuf) -> Result<()> {
    let Some(payload_path) = &cli.payload else {
        bail!("--pack requires --payload <PATH>");
    };
    let (Some(name), Some(version), Some(target)) =
        (&cli.fw_name, &cli.fw_version, &cli.fw_target)
    else {
        bail!("--pack requires --fw-name, --fw-version and --fw-target");
    };

    let payload = std::fs::read(payload_path)
        .with_context(|| format!("Failed to read image {}", payload_path.display()))?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string());

    let mut metadata = BTreeMap::new();
    metadata.insert("name".to_string(), name.clone());
    metadata.insert("version".to_string(), version.clone());
    metadata.insert("target".to_string(), target.clone());
    metadata.insert("timestamp".to_string(), timestamp);

    write_package(&output, &metadata, &payload)
        .with_context(|| format!("Failed to write container {}", output.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Packed {} bytes into {}",
            style("✓").green(),
            payload.len(),
            style(output.display()).cyan()
        );
    }
    Ok(())
}
