//! Example: Reading a Scale
//!
//! Waits for a recognized scale, takes one complete reading and prints the
//! live values as the scale settles.
//!
//! Run with: `cargo run --example read_scale [ADDRESS]`

use std::sync::Arc;
use std::time::Duration;

use blescale_core::{
    AdapterRegistry, ExtractOptions, LocalTransport, ProgressFn, Reading, acquire_reading,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut options = ExtractOptions::new().scan_timeout(Duration::from_secs(60));
    if let Some(address) = std::env::args().nth(1) {
        options = options.address(address);
    }

    let transport = LocalTransport::new().await?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let progress: ProgressFn = Arc::new(|reading: &Reading| println!("  ... {}", reading));

    println!("Step on the scale...");
    let raw = acquire_reading(
        &transport,
        &AdapterRegistry::new(),
        &options,
        &cancel,
        Some(progress),
    )
    .await?;

    println!();
    println!("Scale:     {} ({})", raw.address, raw.adapter.name());
    println!("Weight:    {:.2} kg", raw.reading.weight);
    if raw.reading.has_impedance() {
        println!("Impedance: {} ohm", raw.reading.impedance);
    }
    Ok(())
}
