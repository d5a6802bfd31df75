//! Example: Listening for Scales
//!
//! Prints every advertisement a registered adapter recognizes, with the
//! reading when the scale broadcasts one.
//!
//! Run with: `cargo run --example scan_scales`

use std::collections::HashSet;
use std::time::Duration;

use blescale_core::{AdapterRegistry, LocalTransport, Transport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let transport = LocalTransport::new().await?;
    let registry = AdapterRegistry::new();
    let mut adverts = transport.advertisements().await?;
    let mut seen = HashSet::new();

    println!("Listening for scales for 30 seconds ({})...", registry.names().join(", "));
    println!();

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);

    loop {
        let batch = tokio::select! {
            _ = &mut deadline => break,
            batch = adverts.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        for advertisement in batch {
            let Some(adapter) = registry.match_device(&advertisement.info) else {
                continue;
            };
            let reading = adapter.parse_broadcast(&advertisement.info);
            if reading.is_none() && !seen.insert(advertisement.address.clone()) {
                continue;
            }

            let rssi = advertisement
                .rssi
                .map(|r| format!("{} dBm", r))
                .unwrap_or_else(|| "N/A".to_string());
            println!(
                "  {} [{}] {} RSSI: {}",
                advertisement.info.name.as_deref().unwrap_or("Unknown"),
                adapter.name(),
                advertisement.address,
                rssi
            );
            match reading {
                Some(reading) => println!("    Broadcast: {}", reading),
                None if adapter.gatt().is_some() => println!("    Needs a GATT session"),
                None => println!("    Waiting for a stable reading"),
            }
        }
    }

    if seen.is_empty() {
        println!("No scales found.");
        println!();
        println!("Make sure:");
        println!("  - The scale is awake (step on it)");
        println!("  - Bluetooth is enabled on this computer");
    }
    Ok(())
}
