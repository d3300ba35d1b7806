use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use uuid::Uuid;

use boardlink_core::config::LinkConfig;
use boardlink_core::connection::{ConnectionManager, ConnectionState};
use boardlink_core::events::TracingObserver;
use boardlink_core::registry::{DeviceRegistry, NetworkTargetStore};
use boardlink_core::transport::{BleDriver, OtaDriver, SerialDriver, TransportDriver};
use boardlink_core::upload::{CancelToken, UploadState, Uploader};

#[derive(Parser, Debug)]
#[command(author, version, about = "Microcontroller link and flash tool", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List boards reachable over serial, BLE and the network
    Scan,
    /// Register a network-OTA target
    RegisterNet {
        /// Display name for the target
        name: String,
        /// Hostname or IP address
        host: String,
        /// OTA listener port
        #[arg(default_value_t = 8266)]
        port: u16,
    },
    /// Remove a registered network-OTA target
    UnregisterNet { host: String },
    /// Push a firmware binary to a board
    Flash {
        /// Device id as printed by `scan`
        device_id: String,
        /// Path to the compiled binary
        binary: PathBuf,
    },
    /// Connect to a board and stream its serial output
    Monitor {
        /// Device id as printed by `scan`
        device_id: String,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => LinkConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => LinkConfig::default(),
    };
    config.validate()?;

    let store = Arc::new(Mutex::new(match &config.network.targets_path {
        Some(path) => NetworkTargetStore::load_from_file(path)?,
        None => NetworkTargetStore::in_memory(),
    }));
    let drivers = build_drivers(&config, store.clone());
    let observer = Arc::new(TracingObserver);
    let registry = DeviceRegistry::new(drivers.clone(), store, observer.clone());

    match args.command {
        Command::Scan => {
            for device in registry.scan() {
                println!("{device}");
            }
            Ok(())
        }
        Command::RegisterNet { name, host, port } => {
            registry.register_network_device(&name, &host, port)?;
            println!("registered {host}:{port}");
            Ok(())
        }
        Command::UnregisterNet { host } => {
            registry.unregister_network_device(&host)?;
            println!("unregistered {host}");
            Ok(())
        }
        Command::Flash { device_id, binary } => {
            let payload = std::fs::read(&binary)
                .with_context(|| format!("reading {}", binary.display()))?;
            let device = registry
                .scan()
                .into_iter()
                .find(|d| d.id == device_id)
                .with_context(|| format!("no device with id {device_id}"))?;

            let mut manager = ConnectionManager::new(drivers, observer.clone());
            manager.connect(&device)?;

            let uploader = Uploader::new(observer, config.bootloader.timings());
            let job = uploader.run(
                manager.upload_handle()?,
                &payload,
                &mut |p| eprint!("\r{:.0}%", p * 100.0),
                &CancelToken::new(),
            );
            eprintln!();

            match job.state {
                UploadState::Succeeded => {
                    info!(bytes = job.bytes_sent, "Flash complete");
                    Ok(())
                }
                _ => match job.error {
                    Some(e) => Err(e.into()),
                    None => bail!("upload ended in state {}", job.state),
                },
            }
        }
        Command::Monitor { device_id } => {
            let device = registry
                .scan()
                .into_iter()
                .find(|d| d.id == device_id)
                .with_context(|| format!("no device with id {device_id}"))?;

            let mut manager = ConnectionManager::new(drivers, observer);
            manager.connect(&device)?;
            manager.subscribe(Box::new(|chunk| {
                print!("{}", String::from_utf8_lossy(&chunk.payload));
            }));

            info!(device = %device, "Monitoring; Ctrl-C to stop");
            while manager.state() == ConnectionState::Connected {
                std::thread::sleep(Duration::from_millis(100));
            }
            bail!("connection lost")
        }
    }
}

fn build_drivers(
    config: &LinkConfig,
    store: Arc<Mutex<NetworkTargetStore>>,
) -> Vec<Arc<dyn TransportDriver>> {
    let mut drivers: Vec<Arc<dyn TransportDriver>> = vec![
        Arc::new(SerialDriver::new(
            config.serial.baud_rate,
            config.serial.read_timeout(),
            config.serial.chunk_profile(),
        )),
        Arc::new(OtaDriver::new(store, config.network.connect_timeout())),
    ];

    match ble_driver(config) {
        Ok(ble) => drivers.push(Arc::new(ble)),
        Err(e) => warn!(error = %e, "BLE transport unavailable, continuing without it"),
    }
    drivers
}

fn ble_driver(config: &LinkConfig) -> anyhow::Result<BleDriver> {
    let write_char = Uuid::parse_str(&config.wireless.write_characteristic)
        .context("wireless.write_characteristic is not a UUID")?;
    let notify_char = Uuid::parse_str(&config.wireless.notify_characteristic)
        .context("wireless.notify_characteristic is not a UUID")?;
    Ok(BleDriver::new(
        config.wireless.name_filters.clone(),
        write_char,
        notify_char,
        config.wireless.scan_window(),
        config.wireless.read_timeout(),
        config.wireless.chunk_profile(),
    )?)
}
