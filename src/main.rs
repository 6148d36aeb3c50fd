use anyhow::{Context, Result};
use clap::Parser;
use imu_link::domain::models::{
    AppEvent, BluetoothCommand, ImuReading, MessageSeverity, SessionState, Side, Vec3,
};
use imu_link::domain::settings::SettingsService;
use imu_link::infrastructure::bluetooth::mock::MockTransport;
use imu_link::infrastructure::bluetooth::{protocol, BleTransport, BluetoothService};
use imu_link::infrastructure::logging;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Host link for the ESP32 IMU sensor pair
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Use simulated sensors instead of the Bluetooth adapter
    #[arg(long)]
    simulate: bool,

    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => SettingsService::from_path(path),
        None => SettingsService::new()?,
    };

    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting IMU link (settings: {})", settings.path().display());

    // The service loop and the event consumer share one thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(args, settings))
}

async fn run(args: Args, mut settings: SettingsService) -> Result<()> {
    if args.simulate {
        info!("Using simulated sensors");
        let transport = Arc::new(MockTransport::with_simulated_devices());
        let feed = spawn_simulated_feed(transport.clone());
        let result = drive(transport, &mut settings).await;
        feed.abort();
        result
    } else {
        run_hardware(&mut settings).await
    }
}

#[cfg(windows)]
async fn run_hardware(settings: &mut SettingsService) -> Result<()> {
    use imu_link::infrastructure::bluetooth::winrt::WinRtTransport;
    drive(Arc::new(WinRtTransport::new()), settings).await
}

#[cfg(not(windows))]
async fn run_hardware(_settings: &mut SettingsService) -> Result<()> {
    anyhow::bail!("No Bluetooth backend on this platform; run with --simulate")
}

/// Scan, connect up to two sensors, sync them, then stream until Ctrl+C
async fn drive<T: BleTransport>(transport: Arc<T>, settings: &mut SettingsService) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let service = BluetoothService::new(transport, settings.get(), event_tx);

    let controller = async move {
        let scan_duration = Duration::from_millis(settings.get().scan_duration_ms);
        let _ = cmd_tx.send(BluetoothCommand::StartScan);

        let mut found = Vec::new();
        let deadline = tokio::time::sleep(scan_duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Some(event) = event_rx.recv() => {
                    if let AppEvent::DeviceFound(handle) = event {
                        info!("Found {} ({}, rssi {:?})", handle.display_name(), handle.id, handle.rssi);
                        found.push(handle);
                    }
                }
            }
        }
        let _ = cmd_tx.send(BluetoothCommand::StopScan);

        if found.is_empty() {
            warn!("No sensors found after {:?}", scan_duration);
            let _ = cmd_tx.send(BluetoothCommand::Shutdown);
            return;
        }

        // Remembered placement first, then whichever side is still free
        let mut taken = Vec::new();
        for handle in &found {
            if let Some(side) = settings.get().known_side(&handle.id) {
                if !taken.contains(&side) {
                    taken.push(side);
                    let _ = cmd_tx.send(BluetoothCommand::Connect {
                        peripheral_id: handle.id.clone(),
                        side,
                    });
                }
            }
        }
        for handle in &found {
            if settings.get().known_side(&handle.id).is_some() {
                continue;
            }
            let free = [Side::Left, Side::Right].into_iter().find(|s| !taken.contains(s));
            if let Some(side) = free {
                taken.push(side);
                let _ = cmd_tx.send(BluetoothCommand::Connect {
                    peripheral_id: handle.id.clone(),
                    side,
                });
            }
        }

        if settings.get().sync_interval_ms.is_none() {
            let _ = cmd_tx.send(BluetoothCommand::SendSync(settings.get().sync_side));
        }

        let mut counts: HashMap<Side, u64> = HashMap::new();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Interrupted, shutting down");
                    break;
                }
                event = event_rx.recv() => match event {
                    Some(event) => handle_event(event, settings, &mut counts),
                    None => break,
                },
            }
        }
        let _ = cmd_tx.send(BluetoothCommand::Shutdown);
    };

    tokio::join!(service.run(cmd_rx), controller);
    Ok(())
}

fn handle_event(event: AppEvent, settings: &mut SettingsService, counts: &mut HashMap<Side, u64>) {
    match event {
        AppEvent::Reading {
            peripheral_id,
            side,
            reading,
        } => {
            debug!("{} ({}): {:?}", peripheral_id, side, reading);
            let count = counts.entry(side).or_default();
            *count += 1;
            if *count % 100 == 0 {
                info!(
                    "{} sensor: {} readings, |a| = {:.2} g, t = {} ms",
                    side,
                    count,
                    reading.accel.magnitude(),
                    reading.timestamp_ms
                );
            }
        }
        AppEvent::SessionStateChanged {
            peripheral_id,
            side,
            state,
        } => {
            info!("{} ({}) is {:?}", peripheral_id, side, state);
            if state == SessionState::Ready {
                if let Err(e) = settings.remember_peripheral(&peripheral_id, side) {
                    warn!("Failed to remember {}: {}", peripheral_id, e);
                }
            }
        }
        AppEvent::SyncSent {
            peripheral_id,
            timestamp_ms,
        } => info!("Synced {} to {}", peripheral_id, timestamp_ms),
        AppEvent::LogMessage(message) => match message.severity {
            MessageSeverity::Error => error!("{}", message.message),
            _ => debug!("{}", message.message),
        },
        AppEvent::ScanStateChanged(scanning) => debug!("Scanning: {}", scanning),
        AppEvent::DeviceFound(_) | AppEvent::DevicesCleared => {}
    }
}

/// Feed synthetic motion frames to every connected simulated sensor
fn spawn_simulated_feed(transport: Arc<MockTransport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            let base = started.elapsed().as_millis() as u32;
            let readings = [0u32, 1, 2, 3, 4].map(|i| {
                let t = base + i * 20;
                let phase = t as f32 / 1000.0;
                ImuReading {
                    timestamp_ms: t,
                    accel: Vec3::new(phase.sin() * 0.1, phase.cos() * 0.1, 1.0),
                    gyro: Vec3::new(phase.cos() * 5.0, 0.0, phase.sin() * 5.0),
                    mag: Vec3::new(25.0, -5.0, 40.0),
                    temperature_c: 31.5,
                }
            });
            let frame = protocol::encode_telemetry_frame(&readings).to_vec();
            for id in transport.connected_ids() {
                transport.notify(&id, Ok(Some(frame.clone())));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["imu_link"]).unwrap();
        assert!(!args.simulate);
        assert!(args.config.is_none());

        let args =
            Args::try_parse_from(["imu_link", "--simulate", "--config", "/tmp/imu.json"]).unwrap();
        assert!(args.simulate);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/imu.json")));

        assert!(Args::try_parse_from(["imu_link", "--bogus"]).is_err());
        assert!(Args::try_parse_from(["imu_link", "--config"]).is_err());
    }
}
