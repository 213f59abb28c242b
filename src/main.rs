use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use court_lights::*;
use futures::future::join_all;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to courtd.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum ZoneArg {
    /// Fixture covering the whole court
    Full,
    /// Fixture over half court A
    HalfA,
    /// Fixture over half court B
    HalfB,
}

impl From<ZoneArg> for Zone {
    fn from(zone: ZoneArg) -> Self {
        match zone {
            ZoneArg::Full => Zone::Full,
            ZoneArg::HalfA => Zone::HalfA,
            ZoneArg::HalfB => Zone::HalfB,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the power state of every zone
    Status,
    /// Turn lights on, confirming each zone
    On {
        /// Only this zone
        #[arg(short, long, value_enum)]
        zone: Option<ZoneArg>,
    },
    /// Turn lights off, confirming each zone
    Off {
        /// Only this zone
        #[arg(short, long, value_enum)]
        zone: Option<ZoneArg>,
    },
    /// Fetch today's timetable and show the zone state per slot
    Fetch,
    /// Serve a fixed timetable for testing
    MockServer {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Run the daemon under a web dashboard
    Dashboard {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("court_lights=info,courtctl=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => show_status(&config).await?,
        Commands::On { zone } => switch(&config, true, zone.map(Zone::from)).await?,
        Commands::Off { zone } => switch(&config, false, zone.map(Zone::from)).await?,
        Commands::Fetch => show_timetable(&config).await?,
        Commands::MockServer { bind } => {
            let bind = bind.unwrap_or_else(|| config.mock.bind.clone());
            mock::serve(&bind, shutdown_on_ctrl_c()).await?;
        }
        Commands::Dashboard { bind } => {
            let mut settings = config.dashboard.clone();
            if let Some(bind) = bind {
                settings.bind = bind;
            }
            dashboard::serve(&settings, shutdown_on_ctrl_c()).await?;
        }
    }

    Ok(())
}

/// Token cancelled on the first Ctrl+C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutting down");
        cancel.cancel();
    });
    token
}

/// Read every zone concurrently
#[instrument(skip(config))]
async fn show_status(config: &Config) -> Result<()> {
    let mut devices = device::connect(&config.devices).await?;
    let reads = devices
        .iter_mut()
        .map(|(zone, device)| async move { (zone, device.status().await) });

    for (zone, status) in join_all(reads).await {
        match status {
            Ok(Some(true)) => println!("{zone}: on"),
            Ok(Some(false)) => println!("{zone}: off"),
            Ok(None) => println!("{zone}: unknown"),
            Err(e) => println!("{zone}: error ({e})"),
        }
    }
    Ok(())
}

/// Switch one zone, or every zone, with confirmation
#[instrument(skip(config))]
async fn switch(config: &Config, on: bool, zone: Option<Zone>) -> Result<()> {
    let mut devices = device::connect(&config.devices).await?;

    match zone {
        Some(zone) => {
            let outcome =
                apply_state(devices.get_mut(zone), zone, on, &SystemClock, &config.timing).await;
            println!("{zone}: {outcome}");
            if outcome != Outcome::Confirmed {
                warn!("{} was not confirmed", zone);
            }
        }
        None => {
            let desired = if on {
                DesiredZoneState::ALL_ON
            } else {
                DesiredZoneState::ALL_OFF
            };
            let report =
                apply_desired_state(&mut devices, desired, &SystemClock, &config.timing).await;
            for zone_report in &report.0 {
                println!("{}: {}", zone_report.zone, zone_report.outcome());
            }
            if !report.all_confirmed() {
                warn!("Not every zone was confirmed");
            }
        }
    }
    Ok(())
}

/// Print the normalized timetable and the state each slot asks for
#[instrument(skip(config))]
async fn show_timetable(config: &Config) -> Result<()> {
    let source = HttpReservationSource::new(&config.source)?;
    let timeline = source.fetch_timeline().await?;

    if timeline.is_empty() {
        println!("No reservations");
        return Ok(());
    }
    for interval in &timeline {
        println!(
            "{}-{}  {}",
            interval.start.format("%H:%M"),
            interval.end().format("%H:%M"),
            interval.desired_state()
        );
    }
    Ok(())
}
