//! CLI application for controlling Yeelight devices.
//!
//! This example demonstrates a full-featured command-line interface for
//! controlling a single device over its control socket.
//!
//! Run with: cargo run --example yeelight_cli -- --help

use std::time::Duration;

use clap::{Parser, Subcommand};
use yeelight_rs::{
    Brightness, DeviceId, DeviceSession, DeviceType, Endpoint, HueSaturation, Kelvin, Light,
    PowerMode, SessionConfig, discover,
};

#[derive(Parser)]
#[command(name = "yeelight-cli")]
#[command(about = "Control Yeelight smart lights from the command line", long_about = None)]
struct Cli {
    /// Address of the device, `host` or `host:port` (not required for discover)
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Model of the device, used for its color temperature range
    #[arg(short, long, global = true, default_value = "color")]
    model: String,

    /// Retries per command
    #[arg(short, long, global = true, default_value = "5")]
    retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover all Yeelight devices on the network
    Discover {
        /// Discovery timeout in seconds (default: 3)
        #[arg(short, long, default_value = "3")]
        timeout: u64,
    },

    /// Get the current status of the light
    Status,

    /// Turn the light on
    On,

    /// Turn the light off
    Off,

    /// Toggle the light on/off
    Toggle,

    /// Set hue (0-359) and saturation (0-100)
    Color {
        hue: u16,
        saturation: u8,
    },

    /// Set brightness (1-100)
    Brightness {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=100))]
        level: u8,
    },

    /// Set color temperature in Kelvin (1700-6500)
    Temperature {
        #[arg(value_parser = clap::value_parser!(u16).range(1700..=6500))]
        kelvin: u16,
    },

    /// Flash the light
    Identify,

    /// Print the session diagnostics after a status query
    Diagnostics,

    /// Print property changes pushed by the device
    Listen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Discover { timeout } = cli.command {
        println!("Discovering Yeelight devices (timeout: {}s)...", timeout);
        let devices = discover(Duration::from_secs(timeout)).await?;
        if devices.is_empty() {
            println!("No devices found on the network.");
        } else {
            println!("\nFound {} device(s):", devices.len());
            for device in devices {
                println!(
                    "  {}  {:21}  {:10}  {}",
                    device.identity,
                    device.endpoint.to_string(),
                    device.model,
                    device.support.join(" ")
                );
            }
        }
        return Ok(());
    }

    let address = cli
        .address
        .ok_or("An address is required for this command. Use --address <HOST[:PORT]>")?;
    let endpoint = match address.parse::<Endpoint>() {
        Ok(endpoint) => endpoint,
        Err(_) => Endpoint::from_location(&address)?,
    };

    let config = SessionConfig {
        retries: cli.retries,
        ..SessionConfig::default()
    };
    // The identity only labels logs and diagnostics here.
    let id = DeviceId::from_full_id("0x000000000000cafe")?;
    let session = DeviceSession::new(id, &cli.model, endpoint.clone(), &config);
    // Without an advertisement, assume the device supports everything.
    let tokens = [
        "set_power",
        "set_bright",
        "set_ct_abx",
        "set_hsv",
        "bg_set_power",
        "bg_set_bright",
        "bg_set_hsv",
        "start_cf",
    ];
    let light = Light::new(
        session.clone(),
        DeviceType::from_advertisement(&cli.model, &tokens),
        config.transition,
    );

    match cli.command {
        Commands::Discover { .. } => unreachable!(),

        Commands::Status => {
            let status = light.status().await?;
            println!("\nLight Status ({}):", endpoint);
            println!("  Power: {}", if status.emitting() { "ON" } else { "OFF" });
            if let Some(name) = status.name() {
                println!("  Name: {}", name);
            }
            if let Some(brightness) = status.brightness() {
                println!("  Brightness: {}%", brightness.value());
            }
            if let Some(temp) = status.temperature() {
                println!("  Temperature: {}K", temp.kelvin());
            }
            if let Some(color) = status.color() {
                println!("  Color: hue {} sat {}", color.hue(), color.saturation());
            }
            if let Some(mode) = status.color_mode() {
                println!("  Mode: {:?}", mode);
            }
        }

        Commands::On => {
            light.set_power(PowerMode::On).await?;
            report(&session, "Light turned ON");
        }

        Commands::Off => {
            light.set_power(PowerMode::Off).await?;
            report(&session, "Light turned OFF");
        }

        Commands::Toggle => {
            light.toggle().await?;
            report(&session, "Light toggled");
        }

        Commands::Color { hue, saturation } => {
            let color = HueSaturation::create(hue, saturation)
                .ok_or("Hue must be 0-359 and saturation 0-100.")?;
            light.set_hue_saturation(&color).await?;
            report(&session, "Color set");
        }

        Commands::Brightness { level } => {
            let brightness = Brightness::create(level).ok_or("Brightness must be 1-100.")?;
            light.set_brightness(&brightness).await?;
            report(&session, "Brightness set");
        }

        Commands::Temperature { kelvin } => {
            let temp = Kelvin::create(kelvin).ok_or("Temperature must be 1700-6500K.")?;
            light.set_color_temperature(&temp).await?;
            report(&session, "Temperature set");
        }

        Commands::Identify => {
            light.identify().await?;
            println!("Light is flashing");
        }

        Commands::Diagnostics => {
            if let Err(e) = light.status().await {
                eprintln!("Status query failed: {}", e);
            }
            let diag = session.diagnostics();
            println!("\nDiagnostics:\n{}", serde_json::to_string_pretty(&diag)?);
        }

        Commands::Listen => {
            session.on_property_changed(|id, change| {
                println!("[{}] {:?}", id, change);
            });
            // Any command opens the socket that carries the notifications.
            light.status().await?;
            println!("Listening for property changes... (Press Ctrl+C to stop)\n");
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    Ok(())
}

fn report(session: &DeviceSession, done: &str) {
    if session.is_online() {
        println!("{}", done);
    } else {
        println!("Device unreachable; the change was not applied.");
    }
}
