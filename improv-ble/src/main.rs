//! BLE provisioning tool for Improv devices
//!
//! Scans for Improv devices and sends Wi-Fi credentials via BLE.

use clap::{Parser, Subcommand};
use improv_ble_controller::ble::{self, BtleTransport, ProvisionError};
use improv_ble_controller::{
    Outcome, ProvisionConfig, Session, SessionRegistry, State, improv_home,
};
use improv_proto::Credentials;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "improv-ble")]
#[command(about = "BLE provisioning tool for Improv Wi-Fi devices")]
struct Cli {
    /// Print the outcome as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Improv devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Ask a device to identify itself (blink, beep)
    Identify {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Send WiFi credentials to a device
    Provision {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, default_value = "wifi_credentials.txt")]
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = ProvisionConfig::load(&improv_home()?.join("config.json"))?;
    let registry = SessionRegistry::with_known(&config.known_devices);

    match cli.command {
        Commands::Scan { duration } => {
            let duration = duration
                .map(Duration::from_secs)
                .unwrap_or(config.scan_duration);
            scan_devices(duration).await?;
        }
        Commands::Identify { device } => {
            match ble::identify(device.as_deref(), &registry, &config).await {
                Ok(()) => println!("Identify sent."),
                Err(e) => report(cli.json, Err(e)),
            }
        }
        Commands::Provision { device, file } => {
            let (ssid, password) = read_wifi_credentials(&file)?;
            let credentials = Credentials::new(&ssid, &password)?;
            println!("Scanning for Improv devices...");
            println!("  SSID: {}", credentials.ssid());
            let target = device.as_deref();
            let result = ble::provision(target, &credentials, &registry, &config, observe).await;
            report(cli.json, result);
        }
    }

    Ok(())
}

fn read_wifi_credentials(file: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)?;
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    let password = lines
        .next()
        .ok_or("Missing password in credentials file")?
        .trim()
        .to_string();
    Ok((ssid, password))
}

async fn scan_devices(duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for Improv devices ({} seconds)...", duration.as_secs());

    let adapter = ble::get_adapter().await?;
    let devices = ble::scan(&adapter, duration).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_improv { " [IMPROV]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }
    Ok(())
}

/// Follow a session from the menu: ctrl-c cancels it, state changes are printed
fn observe(session: &Session<BtleTransport>) {
    println!("Connected to {}", session.device().name());

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut states = session.watch();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match state {
                State::AwaitingAuthorization => {
                    println!("Press the button on the device to authorize...")
                }
                State::Provisioning => println!("Sending WiFi credentials..."),
                s if s.is_terminal() => break,
                _ => {}
            }
        }
    });
}

fn report(json: bool, result: Result<Outcome, ProvisionError>) {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("{e}");
            e.outcome()
        }
    };

    if json {
        match serde_json::to_string(&outcome) {
            Ok(s) => println!("{s}"),
            Err(e) => log::error!("failed to serialize outcome: {e}"),
        }
    } else {
        println!("{outcome}");
    }

    if !outcome.is_success() {
        std::process::exit(1);
    }
}
