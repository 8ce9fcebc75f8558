//! Discover all Yeelight devices on the network and turn them on.
//!
//! This example demonstrates:
//! - Running the discovery listener against a session registry
//! - Attaching the advertised capabilities to every new session
//! - Sending a state change that survives a flaky connection
//!
//! Run with: cargo run --example discover_and_turn_on

use std::sync::Arc;
use std::time::Duration;

use yeelight_rs::{DiscoveryConfig, DiscoveryListener, Light, PowerMode, SessionRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Searching for Yeelight devices...");

    let registry = Arc::new(SessionRegistry::default());
    let listener = DiscoveryListener::new(DiscoveryConfig::default(), Arc::clone(&registry));

    let config = registry.config().clone();
    listener.on_discovered(move |record, session| {
        println!(
            "  + {} ({}) at {}",
            record.identity, record.model, record.endpoint
        );
        let light = Light::from_record(record, session.clone(), &config);
        tokio::spawn(async move {
            match light.set_power(PowerMode::On).await {
                Ok(()) => println!("  ✓ {} turned on", light.id()),
                Err(e) => eprintln!("  ✗ {}: {}", light.id(), e),
            }
        });
    });
    listener.on_endpoint_changed(|id, endpoint| {
        println!("  ~ {} moved to {}", id, endpoint);
    });

    let handle = listener.start().await?;
    tokio::time::sleep(Duration::from_secs(10)).await;

    listener.stop();
    handle.await;

    println!("\nFound {} device(s).", registry.len());
    Ok(())
}
