//! Continuous watcher against the scripted transport.

use std::sync::Arc;
use std::time::Duration;

use blescale_core::mock::{MockSession, MockTransport};
use blescale_core::{AdapterRegistry, Advertisement, ContinuousWatcher, Error, WatcherOptions};
use blescale_types::{DeviceInfo, uuids};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const MI_ADDR: &str = "5C:CA:D3:00:00:01";
const QN_ADDR: &str = "C4:11:22:33:44:55";

fn mi2_advertisement(weight_raw: u16) -> Advertisement {
    let w = weight_raw.to_le_bytes();
    let frame = vec![
        0x02, 0x26, 0xE8, 0x07, 0x06, 0x0F, 0x08, 0x1E, 0x00, 0xF4, 0x01, w[0], w[1],
    ];
    Advertisement::new(
        MI_ADDR,
        DeviceInfo::new().with_service_data(uuids::BODY_COMPOSITION_SERVICE, frame),
    )
}

fn qn_frame(raw: u16, stable: bool) -> Vec<u8> {
    let w = raw.to_be_bytes();
    vec![0x10, 0x0E, 0x00, w[0], w[1], u8::from(stable), 0x00, 0x00, 0x01, 0xF4, 0x00]
}

fn qn_advertisement() -> Advertisement {
    Advertisement::new(QN_ADDR, DeviceInfo::new().with_name("QN-Scale"))
}

fn watch(transport: Arc<MockTransport>) -> (Arc<ContinuousWatcher>, CancellationToken) {
    let watcher = Arc::new(ContinuousWatcher::new(
        transport,
        AdapterRegistry::new(),
        WatcherOptions::default(),
    ));
    let cancel = CancellationToken::new();
    watcher.start(cancel.clone());
    (watcher, cancel)
}

#[tokio::test(start_paused = true)]
async fn test_repeated_broadcasts_are_deduplicated() {
    let transport = Arc::new(
        MockTransport::builder()
            .batch(vec![mi2_advertisement(15100)])
            .batch_after(Duration::from_secs(1), vec![mi2_advertisement(15100)])
            .batch_after(Duration::from_secs(1), vec![mi2_advertisement(16000)])
            .build(),
    );
    let (watcher, cancel) = watch(transport);

    let first = watcher.next(&cancel).await.unwrap();
    assert!((first.reading.weight - 75.5).abs() < 1e-9);
    let second = watcher.next(&cancel).await.unwrap();
    assert!((second.reading.weight - 80.0).abs() < 1e-9);

    assert!(
        timeout(Duration::from_secs(60), watcher.next(&cancel))
            .await
            .is_err()
    );
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_single_gatt_session_at_a_time() {
    let session = MockSession::builder(QN_ADDR)
        .characteristic(uuids::QN_WRITE)
        .frame(uuids::QN_NOTIFY, qn_frame(7420, false))
        .frame(uuids::QN_NOTIFY, qn_frame(7550, true))
        .frame_delay(Duration::from_secs(1));
    let stats = session.stats();
    let transport = Arc::new(
        MockTransport::builder()
            .batch(vec![qn_advertisement()])
            .batch_after(Duration::from_millis(200), vec![qn_advertisement()])
            .batch_after(Duration::from_millis(200), vec![qn_advertisement()])
            .session(session)
            .build(),
    );
    let (watcher, cancel) = watch(Arc::clone(&transport));

    let raw = watcher.next(&cancel).await.unwrap();
    assert_eq!(raw.address, QN_ADDR);
    assert_eq!(raw.reading.impedance, 500);
    assert_eq!(transport.connects(), 1);
    assert_eq!(stats.disconnects(), 1);
    assert_eq!(transport.subscriptions(), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!watcher.is_busy());
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_gatt_failure_is_queued() {
    let transport = Arc::new(
        MockTransport::builder()
            .batch(vec![qn_advertisement()])
            .session(MockSession::builder(QN_ADDR))
            .build(),
    );
    let (watcher, cancel) = watch(transport);

    let err = watcher.next(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::AdapterCharacteristicsMissing { .. }), "{err}");
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_after_stream_ends() {
    let transport = Arc::new(
        MockTransport::builder()
            .batch(vec![mi2_advertisement(15100)])
            .end_stream()
            .build(),
    );
    let (watcher, cancel) = watch(Arc::clone(&transport));

    assert!(watcher.next(&cancel).await.is_ok());
    let err = watcher.next(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::TransportUnreachable { .. }));

    // The replayed reading falls inside the dedup window; only the stream
    // end is reported again.
    let err = watcher.next(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::TransportUnreachable { .. }));
    assert!(transport.subscriptions() >= 2);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_consumer_and_watcher() {
    let transport = Arc::new(MockTransport::builder().build());
    let watcher = Arc::new(ContinuousWatcher::new(
        transport,
        AdapterRegistry::new(),
        WatcherOptions::default(),
    ));
    let cancel = CancellationToken::new();
    let handle = watcher.start(cancel.clone());

    let consumer = {
        let watcher = Arc::clone(&watcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.next(&cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    assert!(matches!(consumer.await.unwrap(), Err(Error::Cancelled)));
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_address_filter_ignores_other_scales() {
    let other = Advertisement::new(
        "5C:CA:D3:00:00:99",
        mi2_advertisement(15100).info,
    );
    let transport = Arc::new(
        MockTransport::builder()
            .batch(vec![other])
            .batch_after(Duration::from_secs(1), vec![mi2_advertisement(15100)])
            .build(),
    );
    let watcher = Arc::new(ContinuousWatcher::new(
        transport,
        AdapterRegistry::new(),
        WatcherOptions::new().address(MI_ADDR.to_lowercase()),
    ));
    let cancel = CancellationToken::new();
    watcher.start(cancel.clone());

    let raw = watcher.next(&cancel).await.unwrap();
    assert_eq!(raw.address, MI_ADDR);
    cancel.cancel();
}
