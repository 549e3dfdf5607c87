//! `ping1d` command-line tool

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ping1d_core::config::EngineConfig;
use ping1d_core::device::{spawn_reader, PingDevice, Session};
use ping1d_core::firmware::{
    FirmwareEvent, FirmwareUpdater, SerialBootloaderLink, Stm32FlashRunner, UpdateRequest,
    UpdateState,
};
use ping1d_core::protocol::{
    list_ports, open_port, CommunicationChannel, SerialChannel, TcpChannel,
};
use ping1d_core::settings::JsonSettingsFile;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ping1d", version, about = "Ping1D sonar monitor and firmware flasher")]
struct Cli {
    /// Engine configuration (JSON). Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports, USB adapters first
    Ports,

    /// Connect to a sonar and print its state once per period
    Monitor {
        #[arg(long, required_unless_present = "tcp")]
        port: Option<String>,

        /// Sonar reachable over TCP (host:port) instead of a serial port
        #[arg(long, conflicts_with = "port")]
        tcp: Option<String>,

        /// Link baud rate; overrides the configuration
        #[arg(long)]
        baud: Option<u32>,

        /// Persisted parameter file; defaults to the user config directory
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Print period in milliseconds
        #[arg(long, default_value_t = 1000)]
        period_ms: u64,
    },

    /// Flash a firmware image with stm32flash
    Flash {
        #[arg(long)]
        port: String,

        #[arg(long)]
        image: PathBuf,

        /// Bootloader baud rate; overrides the configuration
        #[arg(long)]
        baud: Option<u32>,

        /// Skip read-back verification
        #[arg(long)]
        no_verify: bool,

        /// The device is already in its bootloader
        #[arg(long)]
        no_goto_bootloader: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Ports => {
            for port in list_ports() {
                println!("{}", serde_json::to_string(&port)?);
            }
            Ok(())
        }
        Command::Monitor {
            port,
            tcp,
            baud,
            settings,
            period_ms,
        } => {
            let link = match tcp {
                Some(addr) => Link::Tcp(addr),
                None => Link::Serial(port.unwrap_or_default()),
            };
            monitor(config, link, baud, settings, Duration::from_millis(period_ms)).await
        }
        Command::Flash {
            port,
            image,
            baud,
            no_verify,
            no_goto_bootloader,
        } => {
            let mut request = UpdateRequest::new(port, image);
            request.baud = baud.unwrap_or(config.firmware.bootloader_baud);
            request.verify = !no_verify;
            request.send_goto_bootloader = !no_goto_bootloader;
            flash(config, request).await
        }
    }
}

enum Link {
    Serial(String),
    Tcp(String),
}

fn open_link(link: &Link, baud: u32) -> anyhow::Result<Box<dyn CommunicationChannel>> {
    Ok(match link {
        Link::Serial(name) => {
            let port =
                open_port(name, Some(baud)).with_context(|| format!("opening {}", name))?;
            Box::new(SerialChannel::new(port))
        }
        Link::Tcp(addr) => {
            Box::new(TcpChannel::connect(addr).with_context(|| format!("connecting to {}", addr))?)
        }
    })
}

async fn monitor(
    mut config: EngineConfig,
    link: Link,
    baud: Option<u32>,
    settings: Option<PathBuf>,
    period: Duration,
) -> anyhow::Result<()> {
    if let Some(baud) = baud {
        config.baud_rate = baud;
    }

    let channel = open_link(&link, config.baud_rate)?;
    info!("Connected to {}", channel.describe());
    let writer = channel.try_clone().context("cloning link")?;

    let store = match settings {
        Some(path) => JsonSettingsFile::new(path),
        None => JsonSettingsFile::default_location()?,
    };
    info!("Persisting parameters to {}", store.path().display());

    let device = PingDevice::new(Box::new(writer), config.request_timeout());
    let (handle, task) = Session::new(device, config)
        .with_store(Box::new(store))
        .spawn();
    let reader = spawn_reader(channel, handle.clone());

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match handle.snapshot().await {
                    Ok(snapshot) => println!("{}", serde_json::to_string(&snapshot)?),
                    Err(e) => {
                        warn!("Session ended: {}", e);
                        break;
                    }
                }
            }
        }
    }

    handle.shutdown().await;
    let device = task.await?;
    reader.await?;
    info!(
        "Parsed {} messages, {} parser errors, {} lost",
        device.parsed_messages(),
        device.parser_errors(),
        device.lost_messages()
    );
    Ok(())
}

async fn flash(config: EngineConfig, request: UpdateRequest) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling update");
            on_interrupt.cancel();
        }
    });

    let mut updater = FirmwareUpdater::new(&config.firmware);
    updater.subscribe(|event| match event {
        FirmwareEvent::StateChanged(state) => info!("{:?}", state),
        FirmwareEvent::Progress(percent) => info!("{:.1}%", percent),
        FirmwareEvent::Complete | FirmwareEvent::Failed(_) => {}
    });

    let mut link = SerialBootloaderLink::new(request.port.clone(), &config.firmware);
    let mut runner = Stm32FlashRunner;
    match updater.run(request, &mut runner, &mut link, &cancel).await {
        UpdateState::Complete => Ok(()),
        UpdateState::Failed(reason) => Err(anyhow::anyhow!("firmware update failed: {}", reason)),
        other => Err(anyhow::anyhow!("firmware update ended in {:?}", other)),
    }
}
