//! Hardware tests for blescale-core.
//!
//! These need a Bluetooth adapter and a scale in range:
//! ```
//! cargo test --package blescale-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! - `BLESCALE_DEVICE`: only read from this address
//! - `BLESCALE_BROKER` / `BLESCALE_PROXY_ID`: broker URL and device id of a
//!   remote radio, for the proxied test

use std::env;
use std::time::Duration;

use blescale_core::{
    AdapterRegistry, ExtractOptions, LocalTransport, Transport, acquire_reading,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Generous enough for a user to step on the scale.
const STEP_ON_TIMEOUT: Duration = Duration::from_secs(120);

fn options() -> ExtractOptions {
    let options = ExtractOptions::new().scan_timeout(STEP_ON_TIMEOUT);
    match env::var("BLESCALE_DEVICE") {
        Ok(address) => options.address(address),
        Err(_) => options,
    }
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_sees_advertisements() {
    let transport = LocalTransport::new().await.expect("no Bluetooth adapter");
    let mut adverts = transport.advertisements().await.unwrap();

    let batch = timeout(Duration::from_secs(30), adverts.recv())
        .await
        .expect("no advertisement within 30s")
        .expect("stream ended");
    for advertisement in batch {
        println!(
            "{} {:?} rssi={:?} services={}",
            advertisement.address,
            advertisement.info.name,
            advertisement.rssi,
            advertisement.info.services.len()
        );
    }
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_read_local_scale() {
    let transport = LocalTransport::new().await.expect("no Bluetooth adapter");
    println!("Step on the scale...");

    let raw = acquire_reading(
        &transport,
        &AdapterRegistry::new(),
        &options(),
        &CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    println!("{} from {} via {}", raw.reading, raw.address, raw.adapter.name());
    assert!(raw.reading.weight > 0.0);
}

#[cfg(feature = "proxy")]
#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_read_proxied_scale() {
    use blescale_core::{ProxiedTransport, ProxyConfig};

    let (Ok(broker), Ok(device_id)) = (env::var("BLESCALE_BROKER"), env::var("BLESCALE_PROXY_ID"))
    else {
        println!("BLESCALE_BROKER / BLESCALE_PROXY_ID not set, skipping");
        return;
    };
    let transport = ProxiedTransport::connect(&ProxyConfig::new(broker, device_id))
        .await
        .unwrap();
    println!("Remote radio status: {:?}. Step on the scale...", transport.status());

    let raw = acquire_reading(
        &transport,
        &AdapterRegistry::new(),
        &options(),
        &CancellationToken::new(),
        None,
    )
    .await
    .unwrap();
    println!("{} from {} via {}", raw.reading, raw.address, raw.adapter.name());
}
