//! Headless tool for the wearable link engine
//!
//! Scans for peripherals, pushes Wi-Fi and experiment configuration, and
//! streams orientation telemetry to stdout.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wearable_link::domain::models::{
    AppEvent, BatchKind, ConnectionStatus, LinkCommand, MessageSeverity,
};
use wearable_link::domain::settings::SettingsService;
use wearable_link::infrastructure::bluetooth::{BtleBackend, LinkService};
use wearable_link::infrastructure::logging::init_logger;

#[derive(Parser)]
#[command(name = "wearable-link")]
#[command(about = "Configure and stream from a BLE motion-sensing wearable")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for wearable devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// List every advertiser, not only configurable wearables
        #[arg(short, long)]
        all: bool,
    },
    /// Stream orientation telemetry to stdout
    Stream {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: String,
        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(short = 't', long)]
        duration: Option<u64>,
    },
    /// Send Wi-Fi credentials to a device
    Wifi {
        #[arg(short, long)]
        device: String,
        #[arg(short, long)]
        ssid: String,
        #[arg(short, long)]
        password: String,
    },
    /// Send experiment parameters to a device
    Configure {
        #[arg(short, long)]
        device: String,
        #[arg(short = 'n', long)]
        experiment_name: Option<String>,
        #[arg(short = 'm', long)]
        sampling_ms: Option<u32>,
    },
    /// End the running experiment on a device
    Finish {
        #[arg(short, long)]
        device: String,
    },
}

const LINK_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_service = SettingsService::new()?;
    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    info!("Starting wearable link tool");

    let settings = Arc::new(Mutex::new(settings_service));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let backend = BtleBackend::new(event_tx.clone());
    let service = LinkService::new(event_tx, settings.clone(), backend, None)?;
    let worker = tokio::spawn(service.run(cmd_rx));

    let result = match cli.command {
        Commands::Scan { duration, all } => {
            settings
                .lock()
                .map_err(|_| anyhow!("Lock error"))?
                .get_mut()
                .link
                .show_all_devices = all;
            scan(&cmd_tx, &mut event_rx, duration).await
        }
        Commands::Stream { device, duration } => {
            stream(&cmd_tx, &mut event_rx, &device, duration).await
        }
        Commands::Wifi {
            device,
            ssid,
            password,
        } => {
            let command = LinkCommand::SendWifi { ssid, password };
            apply(&cmd_tx, &mut event_rx, &device, command, BatchKind::Wifi).await
        }
        Commands::Configure {
            device,
            experiment_name,
            sampling_ms,
        } => {
            let mut params = Vec::new();
            if let Some(name) = experiment_name {
                params.push(("experimentName".to_string(), name));
            }
            if let Some(ms) = sampling_ms {
                params.push(("samplingMs".to_string(), ms.to_string()));
            }
            let command = LinkCommand::SendConfig(params);
            apply(&cmd_tx, &mut event_rx, &device, command, BatchKind::Config).await
        }
        Commands::Finish { device } => {
            let command = LinkCommand::FinishExperiment;
            apply(&cmd_tx, &mut event_rx, &device, command, BatchKind::Finish).await
        }
    };

    let _ = cmd_tx.send(LinkCommand::Disconnect);
    drop(cmd_tx);
    if let Err(e) = worker.await {
        warn!("Link service task ended abnormally: {}", e);
    }
    result
}

async fn scan(
    cmd_tx: &mpsc::UnboundedSender<LinkCommand>,
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    duration: u64,
) -> Result<()> {
    cmd_tx.send(LinkCommand::StartScan)?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut seen = Vec::new();

    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let AppEvent::DeviceFound(device) = event {
            if seen.contains(&device.address) {
                continue;
            }
            let rssi = device
                .signal_strength
                .map(|r| format!("{r} dBm"))
                .unwrap_or_else(|| "?".to_string());
            println!("{:<20} {:<24} {}", device.address, device.name, rssi);
            seen.push(device.address);
        }
    }

    cmd_tx.send(LinkCommand::StopScan)?;
    println!("{} device(s) found", seen.len());
    Ok(())
}

async fn stream(
    cmd_tx: &mpsc::UnboundedSender<LinkCommand>,
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    device: &str,
    duration: Option<u64>,
) -> Result<()> {
    connect(cmd_tx, events, device).await?;
    cmd_tx.send(LinkCommand::EnableTelemetry)?;

    let stop = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Some(AppEvent::TelemetryBatch(samples)) => {
                    for s in samples {
                        println!("{:.5} {:.5} {:.5} {:.5}", s.w, s.x, s.y, s.z);
                    }
                }
                Some(AppEvent::ConnectionStatus(ConnectionStatus::Disconnected)) => {
                    return Err(anyhow!("device disconnected"));
                }
                Some(other) => report(&other),
                None => break,
            },
        }
    }
    Ok(())
}

/// Connect, run one write batch, and wait until the device acknowledged all of it.
///
/// Other batches (the pairing user id) may drain first, so only `kind` counts.
async fn apply(
    cmd_tx: &mpsc::UnboundedSender<LinkCommand>,
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    device: &str,
    command: LinkCommand,
    kind: BatchKind,
) -> Result<()> {
    connect(cmd_tx, events, device).await?;
    cmd_tx.send(command)?;
    wait_for(events, |e| matches!(e, AppEvent::ConfigApplied(k) if *k == kind)).await?;
    println!("Configuration applied");
    Ok(())
}

async fn connect(
    cmd_tx: &mpsc::UnboundedSender<LinkCommand>,
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    device: &str,
) -> Result<()> {
    cmd_tx.send(LinkCommand::Connect(device.to_string()))?;
    let event = wait_for(events, |e| {
        matches!(
            e,
            AppEvent::ConnectionStatus(
                ConnectionStatus::Connected { .. } | ConnectionStatus::Disconnected
            )
        )
    })
    .await?;

    match event {
        AppEvent::ConnectionStatus(ConnectionStatus::Connected { device_name }) => {
            println!("Connected to {}", device_name.as_deref().unwrap_or(device));
            Ok(())
        }
        _ => Err(anyhow!("could not connect to {device}")),
    }
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    done: impl Fn(&AppEvent) -> bool,
) -> Result<AppEvent> {
    let deadline = tokio::time::Instant::now() + LINK_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| anyhow!("timed out waiting for the device"))?
            .ok_or_else(|| anyhow!("link service stopped"))?;
        if done(&event) {
            return Ok(event);
        }
        report(&event);
    }
}

fn report(event: &AppEvent) {
    match event {
        AppEvent::LogMessage(msg) => match msg.severity {
            MessageSeverity::Error | MessageSeverity::Warning => eprintln!("{}", msg.message),
            _ => println!("{}", msg.message),
        },
        AppEvent::Pairing(snapshot) => {
            if let Some(status) = &snapshot.status {
                println!("[pairing] {}", status);
            }
        }
        _ => {}
    }
}
