//! satip-client: SAT>IP client turning networked DVB tuners into local
//! devices.
//!
//! Discovers SAT>IP servers via SSDP, manages one RTSP/RTP session per
//! configured device and exposes a command channel for operations.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use satip_client::command::CommandServer;
use satip_client::config::{OperatingMode, SatipConfig, StaticServer, TransportMode};
use satip_client::device::DeviceSet;
use satip_client::discover::Discovery;
use satip_client::poller::Poller;
use satip_client::server::ServerRegistry;
use satip_client::source::Source;
use satip_client::SatipError;
use satip_client::logging;

/// satip-client - SAT>IP client for networked DVB tuners
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of devices to create
    #[arg(short, long, default_value = "2")]
    devices: usize,

    /// Trace bitmask (hex), see TRAC command
    #[arg(short, long, value_parser = parse_hex_mask, default_value = "0")]
    trace: u32,

    /// Hard-coded servers: [src@]ip[:port]|model[:filter]|desc[:quirkHex];...
    #[arg(short, long)]
    server: Option<String>,

    /// Start in detached mode
    #[arg(short = 'D', long)]
    detach: bool,

    /// One registry entry per model token
    #[arg(short = 'S', long)]
    single: bool,

    /// Disable server quirk autodetection
    #[arg(short = 'n', long)]
    noquirks: bool,

    /// Client RT[C]P port range, e.g. 9000-9015 (start must be even)
    #[arg(short, long)]
    portrange: Option<String>,

    /// RTP receive buffer size in bytes
    #[arg(short, long)]
    rcvbuf: Option<usize>,

    /// Command channel listen address
    #[arg(long, default_value = "127.0.0.1:6419")]
    listen: SocketAddr,

    /// Configuration file
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory for rotated log files (console only when unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex_mask(s: &str) -> Result<u32, String> {
    let s = s.trim_start_matches("0x");
    u32::from_str_radix(s, 16).map_err(|e| e.to_string())
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    general: GeneralSection,
    #[serde(default)]
    sources: SourcesSection,
    #[serde(default)]
    ci: CiSection,
    #[serde(default)]
    servers: ServersSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct GeneralSection {
    operating_mode: Option<String>,
    transport_mode: Option<String>,
    frontend_reuse: Option<bool>,
    eit_scan: Option<bool>,
    single_model_servers: Option<bool>,
    disable_quirks: Option<bool>,
    detached: Option<bool>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct SourcesSection {
    /// Satellite positions; `src=n` refers to the n-th entry.
    positions: Option<Vec<String>>,
    disabled: Option<Vec<String>>,
    disabled_filters: Option<Vec<usize>>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct CiSection {
    enabled: Option<bool>,
    cicams: Option<Vec<i32>>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServersSection {
    /// Static server entries in the --server syntax.
    entries: Option<Vec<String>>,
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

fn parse_sources(names: &[String]) -> Vec<Source> {
    names.iter().filter_map(|s| Source::parse(s)).collect()
}

fn apply_config_file(config: &SatipConfig, file: &ConfigFile) -> Result<(), SatipError> {
    if let Some(mode) = &file.general.operating_mode {
        config.set_operating_mode(mode.parse::<OperatingMode>()?);
    }
    if let Some(mode) = &file.general.transport_mode {
        config.set_transport_mode(mode.parse::<TransportMode>()?);
    }
    if let Some(on) = file.general.frontend_reuse {
        config.set_frontend_reuse(on);
    }
    if let Some(on) = file.general.eit_scan {
        config.set_eit_scan(on);
    }
    if let Some(on) = file.general.single_model_servers {
        config.set_single_model_servers(on);
    }
    if let Some(on) = file.general.disable_quirks {
        config.set_disable_quirks(on);
    }
    if let Some(on) = file.general.detached {
        config.set_detached(on);
    }
    if let Some(positions) = &file.sources.positions {
        config.set_sources(parse_sources(positions));
    }
    if let Some(disabled) = &file.sources.disabled {
        config.set_disabled_sources(parse_sources(disabled));
    }
    if let Some(filters) = &file.sources.disabled_filters {
        config.set_disabled_filters(filters.clone());
    }
    if let Some(on) = file.ci.enabled {
        config.set_ci_extension(on);
    }
    if let Some(cicams) = &file.ci.cicams {
        for (slot, ca) in cicams.iter().take(2).enumerate() {
            config.set_cicam(slot, *ca);
        }
    }
    Ok(())
}

fn parse_port_range(arg: &str) -> Result<(u16, u16), SatipError> {
    let (start, stop) = arg.split_once('-').ok_or_else(|| {
        SatipError::ConfigInvalid(format!("port range '{arg}' is not START-END"))
    })?;
    let start = start
        .trim()
        .parse()
        .map_err(|_| SatipError::ConfigInvalid(format!("bad range start '{start}'")))?;
    let stop = stop
        .trim()
        .parse()
        .map_err(|_| SatipError::ConfigInvalid(format!("bad range stop '{stop}'")))?;
    Ok((start, stop))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("satip-client: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(args.log_dir.as_deref(), args.verbose)?;

    let file_config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let config = Arc::new(SatipConfig::default());
    apply_config_file(&config, &file_config)?;

    // Command line wins over the file.
    config.set_trace_mask(args.trace);
    if args.detach {
        config.set_detached(true);
    }
    if args.single {
        config.set_single_model_servers(true);
    }
    if args.noquirks {
        config.set_disable_quirks(true);
    }
    if let Some(range) = &args.portrange {
        let (start, stop) = parse_port_range(range)?;
        config.set_port_range(start, stop, args.devices)?;
    }
    if let Some(rcvbuf) = args.rcvbuf {
        config.set_rtp_rcvbuf_size(rcvbuf);
    }

    let mut static_servers = Vec::new();
    if let Some(entries) = &file_config.servers.entries {
        for entry in entries {
            static_servers.push(StaticServer::parse(entry)?);
        }
    }
    if let Some(arg) = &args.server {
        static_servers.extend(StaticServer::parse_list(arg)?);
    }

    info!(
        "satip-client {} starting with {} devices",
        env!("CARGO_PKG_VERSION"),
        args.devices
    );

    let registry = ServerRegistry::new(Arc::clone(&config));
    registry.add_static(&static_servers);

    let poller = Poller::new();
    let devices = Arc::new(DeviceSet::new(
        args.devices,
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&poller),
    )?);

    let discovery = Discovery::new(Arc::clone(&config), Arc::clone(&registry))?;
    let discovery_task = tokio::spawn(Arc::clone(&discovery).run());

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!("Command channel listening on {}", args.listen);
    let command = CommandServer::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&discovery),
        Arc::clone(&devices),
    );
    let command_task = tokio::spawn(command.run(listener));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    command_task.abort();
    discovery_task.abort();
    devices.shutdown().await;
    poller.shutdown().await;
    info!("Bye");
    Ok(())
}
