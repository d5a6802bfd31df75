//! The control loop.
//!
//! Each reading goes through the same pipeline: identify the user, check
//! for drift, compute body composition, show it on the remote radio,
//! export, and remember the weight. [`Runner`] drives that pipeline in one
//! of three modes (see [`RunMode`]).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use blescale_core::{
    AdapterRegistry, Backoff, Beep, ContinuousWatcher, DisplayReading, DisplayResult, Error,
    LocalTransport, MatchTier, ProgressFn, ProxiedTransport, RawReading, RemoteConfig,
    RemoteFeedback, RemoteUser, Transport, TransportKind, acquire_reading, detect_drift,
    match_user,
};
use blescale_types::Reading;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::exporters::{DispatchReport, ExportContext, ExportPayload, dispatch};
use crate::state::AppState;

/// Tone after at least one exporter accepted the reading.
const SUCCESS_BEEP: Beep = Beep {
    freq: 1000,
    duration: 100,
    repeat: 1,
};

/// Tone after every exporter failed.
const FAILURE_BEEP: Beep = Beep {
    freq: 400,
    duration: 300,
    repeat: 2,
};

/// How the control loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Acquire and process one reading, then return.
    Once,
    /// Repeat single acquisitions with a cooldown in between.
    Poll,
    /// Keep the advertisement subscription open and process every reading.
    Watch,
}

/// Why a cycle failed.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Acquire(#[from] Error),
    #[error("All {count} exporters failed")]
    ExportFailed { count: usize },
}

impl CycleError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CycleError::Acquire(Error::Cancelled))
    }
}

/// What a successful cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Attributed to `slug` and handed to its exporters.
    Exported {
        slug: String,
        tier: MatchTier,
        weight: f64,
        report: DispatchReport,
    },
    /// No user matched; nothing was exported.
    Unattributed { weight: f64 },
}

/// Open the radio selected by `config`.
pub async fn open_transport(config: &TransportConfig) -> blescale_core::Result<Arc<dyn Transport>> {
    match config.kind {
        TransportKind::Local => Ok(Arc::new(LocalTransport::new().await?)),
        TransportKind::Proxied => {
            let proxy = config.proxy.as_ref().ok_or_else(|| {
                Error::InvalidConfig("proxied transport requires [transport.proxy]".to_string())
            })?;
            Ok(Arc::new(ProxiedTransport::connect(proxy).await?))
        }
    }
}

/// Drives acquisition and processing for one transport.
pub struct Runner {
    state: Arc<AppState>,
    transport: Arc<dyn Transport>,
    registry: AdapterRegistry,
    known_scales: Mutex<BTreeSet<String>>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("transport", &self.transport.kind())
            .field("adapters", &self.registry.names())
            .finish()
    }
}

impl Runner {
    pub fn new(state: Arc<AppState>, transport: Arc<dyn Transport>) -> Self {
        Self {
            state,
            transport,
            registry: AdapterRegistry::new(),
            known_scales: Mutex::new(BTreeSet::new()),
        }
    }

    /// Run in `mode` until done or `cancel` fires.
    ///
    /// Only [`RunMode::Once`] returns a cycle error; the looping modes log
    /// failures, back off, and return `Ok` once cancelled.
    pub async fn run(&self, mode: RunMode, cancel: &CancellationToken) -> Result<(), CycleError> {
        self.publish_remote_config().await;
        match mode {
            RunMode::Once => self.run_once(cancel).await.map(|_| ()),
            RunMode::Poll => {
                self.run_polling(cancel).await;
                Ok(())
            }
            RunMode::Watch => {
                self.run_continuous(cancel).await;
                Ok(())
            }
        }
    }

    /// Acquire one reading within the configured scan and GATT timeouts
    /// and process it.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Outcome, CycleError> {
        let options = self.state.snapshot().await.extract_options();
        let raw = acquire_reading(
            self.transport.as_ref(),
            &self.registry,
            &options,
            cancel,
            Some(progress()),
        )
        .await?;
        self.process(raw).await
    }

    /// Single acquisitions separated by the configured cooldown, backing
    /// off after failures.
    pub async fn run_polling(&self, cancel: &CancellationToken) {
        let mut backoff = Backoff::default();
        loop {
            let delay = match self.run_once(cancel).await {
                Ok(_) => {
                    backoff.reset();
                    self.state.snapshot().await.runtime.cooldown()
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    let delay = backoff.fail();
                    warn!(error = %e, retry_in = ?delay, "Cycle failed");
                    delay
                }
            };
            if !pause(delay, cancel).await {
                break;
            }
        }
        info!("Polling stopped");
    }

    /// Consume the continuous watcher's queue until cancelled.
    ///
    /// Address filter, unit and GATT timeout are read once at start.
    pub async fn run_continuous(&self, cancel: &CancellationToken) {
        let options = self.state.snapshot().await.watcher_options();
        let watcher = Arc::new(
            ContinuousWatcher::new(Arc::clone(&self.transport), AdapterRegistry::new(), options)
                .with_progress(progress()),
        );
        let stop = cancel.child_token();
        let handle = watcher.start(stop.clone());
        info!(transport = %self.transport.kind(), "Watching for readings");

        let mut backoff = Backoff::default();
        loop {
            let result = match watcher.next(cancel).await {
                Ok(raw) => self.process(raw).await,
                Err(e) => Err(CycleError::from(e)),
            };
            match result {
                Ok(_) => backoff.reset(),
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    let delay = backoff.fail();
                    warn!(error = %e, retry_in = ?delay, "Cycle failed");
                    if !pause(delay, cancel).await {
                        break;
                    }
                }
            }
        }

        stop.cancel();
        if let Err(e) = handle.await {
            debug!("Watcher task ended abnormally: {}", e);
        }
        info!("Watching stopped");
    }

    /// Attribute, compute, display and export one reading.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(address = %raw.address, adapter = raw.adapter.name())
    )]
    pub async fn process(&self, raw: RawReading) -> Result<Outcome, CycleError> {
        let config = self.state.snapshot().await;
        self.note_scale(&raw.address).await;

        let weight = raw.reading.weight;
        let matched = match_user(&config.profiles(), weight, config.unknown_user);
        if let Some(warning) = &matched.warning {
            warn!(weight, "{}", warning);
        }
        let Some(user) = matched.user else {
            info!(weight, "Reading not attributed to any user; skipping export");
            return Ok(Outcome::Unattributed { weight });
        };

        let drift = detect_drift(&user, weight);
        if let Some(warning) = &drift {
            warn!(user = %user.slug, "{}", warning);
        }
        info!(
            user = %user.slug,
            tier = ?matched.tier,
            weight,
            impedance = raw.reading.impedance,
            "Reading attributed"
        );

        let composition = raw.adapter.compute_metrics(&raw.reading, &user);
        let targets = self.state.targets_for(&user.slug).await;
        let feedback = self.transport.feedback();

        if let Some(feedback) = feedback {
            let shown = DisplayReading {
                slug: user.slug.clone(),
                name: user.name.clone(),
                weight,
                impedance: raw.reading.impedance,
                exporters: targets.iter().map(|t| t.name().to_string()).collect(),
            };
            report_feedback("display/reading", feedback.display_reading(&shown).await);
        }

        let payload = ExportPayload {
            composition,
            timestamp: OffsetDateTime::now_utc(),
            address: raw.address.clone(),
            adapter: raw.adapter.name().to_string(),
        };
        let context = ExportContext::new(user.clone(), drift);
        let report = dispatch(&targets, &payload, Some(&context)).await;

        if let Some(feedback) = feedback {
            show_result(feedback, &context, weight, &report).await;
        }

        if let Err(e) = self.state.record_weight(&user.slug, weight).await {
            warn!(user = %user.slug, error = %e, "Failed to record last known weight");
        }

        if report.all_failed() {
            return Err(CycleError::ExportFailed {
                count: report.statuses.len(),
            });
        }
        Ok(Outcome::Exported {
            slug: user.slug,
            tier: matched.tier,
            weight,
            report,
        })
    }

    /// Push the known scales and the roster to the remote radio, if any.
    pub async fn publish_remote_config(&self) {
        let Some(feedback) = self.transport.feedback() else {
            return;
        };
        let config = self.state.snapshot().await;
        let scales = {
            let mut known = self.known_scales.lock().await;
            if let Some(address) = &config.scale.address {
                known.insert(address.to_uppercase());
            }
            known.iter().cloned().collect()
        };
        let users = config
            .users
            .iter()
            .map(|u| RemoteUser {
                slug: u.slug.clone(),
                name: u.name.clone(),
                min_weight: u.min_weight,
                max_weight: u.max_weight,
            })
            .collect();
        report_feedback(
            "config",
            feedback.publish_config(&RemoteConfig { scales, users }).await,
        );
    }

    /// Remember `address`; a new scale is pushed to the remote radio.
    async fn note_scale(&self, address: &str) {
        let added = self.known_scales.lock().await.insert(address.to_uppercase());
        if added {
            debug!(address, "New scale seen");
            self.publish_remote_config().await;
        }
    }
}

async fn show_result(
    feedback: &dyn RemoteFeedback,
    context: &ExportContext,
    weight: f64,
    report: &DispatchReport,
) {
    let result = DisplayResult {
        slug: context.user_slug.clone(),
        name: context.user_name.clone(),
        weight,
        exports: report.statuses.clone(),
    };
    report_feedback("display/result", feedback.display_result(&result).await);

    let beep = if report.all_failed() {
        FAILURE_BEEP
    } else {
        SUCCESS_BEEP
    };
    report_feedback("beep", feedback.beep(beep).await);
}

fn report_feedback(what: &str, result: blescale_core::Result<()>) {
    if let Err(e) = result {
        warn!(message = what, error = %e, "Remote feedback failed");
    }
}

fn progress() -> ProgressFn {
    Arc::new(|reading: &Reading| debug!(weight = reading.weight, "Measuring"))
}

/// Sleep for `delay`; `false` if cancelled first.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, UserConfig};
    use crate::exporters::Exporter;
    use crate::exporters::tests::StubExporter;
    use crate::state::TargetCache;
    use blescale_core::mock::MockTransport;
    use blescale_core::{Advertisement, DeviceNotFoundReason, UnknownUserStrategy};
    use blescale_types::{DeviceInfo, Gender, uuids};

    const MI_ADDR: &str = "5C:CA:D3:00:00:01";

    fn mi2_advertisement(address: &str, kg: f64) -> Advertisement {
        let w = ((kg * 200.0).round() as u16).to_le_bytes();
        let frame = vec![
            0x02, 0x26, 0xE8, 0x07, 0x06, 0x0F, 0x08, 0x1E, 0x00, 0xF4, 0x01, w[0], w[1],
        ];
        Advertisement::new(
            address,
            DeviceInfo::new().with_service_data(uuids::BODY_COMPOSITION_SERVICE, frame),
        )
    }

    fn user(slug: &str, gender: Gender, min: f64, max: f64) -> UserConfig {
        UserConfig {
            name: slug.to_uppercase(),
            slug: slug.into(),
            height: 172.0,
            birth_date: "1984-02-29".into(),
            gender,
            athlete: false,
            min_weight: min,
            max_weight: max,
            last_known_weight: None,
            exporters: None,
        }
    }

    fn config() -> Config {
        let mut config = Config {
            users: vec![
                user("dad", Gender::Male, 75.0, 95.0),
                user("mom", Gender::Female, 55.0, 75.0),
            ],
            ..Config::default()
        };
        config.scale.scan_timeout_secs = 5;
        config
    }

    fn runner(
        config: Config,
        transport: MockTransport,
        exporters: Vec<Arc<dyn Exporter>>,
    ) -> (Runner, Arc<AppState>, Arc<MockTransport>) {
        let targets = TargetCache::new(&config, exporters);
        let state = AppState::with_targets(config, targets, None);
        let transport = Arc::new(transport);
        let runner = Runner::new(Arc::clone(&state), transport.clone());
        (runner, state, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_exports_to_matched_user() {
        let stub = StubExporter::new("webhook", true);
        let (runner, state, transport) = runner(
            config(),
            MockTransport::builder()
                .batch(vec![mi2_advertisement(MI_ADDR, 82.0)])
                .with_feedback()
                .build(),
            vec![stub.clone()],
        );

        let (slug, tier, weight, report) = match runner.run_once(&CancellationToken::new()).await {
            Ok(Outcome::Exported {
                slug,
                tier,
                weight,
                report,
            }) => (slug, tier, weight, report),
            other => panic!("expected an export, got {:?}", other),
        };
        assert_eq!(slug, "dad");
        assert_eq!(tier, MatchTier::Exact);
        assert!((weight - 82.0).abs() < 1e-9);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(stub.calls(), 1);

        let dad = state.snapshot().await.user("dad").cloned().unwrap();
        assert_eq!(dad.last_known_weight, Some(82.0));

        let events = transport.mock_feedback().unwrap().events();
        assert_eq!(events, vec!["config", "display/reading", "display/result", "beep"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_exporters_failing_fails_the_cycle() {
        let (runner, state, _transport) = runner(
            config(),
            MockTransport::builder()
                .batch(vec![mi2_advertisement(MI_ADDR, 60.0)])
                .build(),
            vec![
                StubExporter::new("webhook", false),
                StubExporter::new("mqtt", false),
            ],
        );

        let err = runner.run_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CycleError::ExportFailed { count: 2 }));
        assert!(!err.is_cancelled());
        let mom = state.snapshot().await.user("mom").cloned().unwrap();
        assert_eq!(mom.last_known_weight, Some(60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_weight_is_not_exported() {
        let stub = StubExporter::new("webhook", true);
        let mut config = config();
        config.unknown_user = UnknownUserStrategy::Ignore;
        let (runner, _state, _transport) = runner(
            config,
            MockTransport::builder()
                .batch(vec![mi2_advertisement(MI_ADDR, 30.0)])
                .build(),
            vec![stub.clone()],
        );

        let outcome = runner.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Unattributed { weight: 30.0 });
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_scale_surfaces_device_not_found() {
        let (runner, _state, _transport) =
            runner(config(), MockTransport::builder().build(), Vec::new());

        let err = runner.run(RunMode::Once, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            CycleError::Acquire(Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_processes_each_reading_until_cancelled() {
        let stub = StubExporter::new("webhook", true);
        let (runner, state, transport) = runner(
            config(),
            MockTransport::builder()
                .batch(vec![mi2_advertisement(MI_ADDR, 82.0)])
                .batch_after(Duration::from_secs(2), vec![mi2_advertisement(MI_ADDR, 82.0)])
                .batch_after(Duration::from_secs(2), vec![mi2_advertisement(MI_ADDR, 61.5)])
                .build(),
            vec![stub.clone()],
        );

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(RunMode::Watch, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(stub.calls(), 2);
        assert_eq!(transport.subscriptions(), 1);
        let config = state.snapshot().await;
        assert_eq!(config.user("dad").unwrap().last_known_weight, Some(82.0));
        assert_eq!(config.user("mom").unwrap().last_known_weight, Some(61.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_backs_off_and_stops_on_cancel() {
        let (runner, _state, transport) =
            runner(config(), MockTransport::builder().build(), Vec::new());

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(RunMode::Poll, &cancel).await })
        };
        // 5 s scan + 5 s backoff + 5 s scan + 10 s backoff, then a third scan.
        tokio::time::sleep(Duration::from_secs(26)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(transport.subscriptions(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_config_lists_new_scales() {
        let mut config = config();
        config.scale.address = Some("aa:bb:cc:dd:ee:ff".into());
        config.unknown_user = UnknownUserStrategy::Ignore;
        let (runner, _state, transport) = runner(
            config,
            MockTransport::builder()
                .batch(vec![mi2_advertisement("AA:BB:CC:DD:EE:FF", 30.0)])
                .with_feedback()
                .build(),
            Vec::new(),
        );

        runner.publish_remote_config().await;
        assert_eq!(runner.known_scales.lock().await.len(), 1);

        runner.run_once(&CancellationToken::new()).await.unwrap();
        // Same scale: no second config push, and nothing to display.
        let events = transport.mock_feedback().unwrap().events();
        assert_eq!(events, vec!["config"]);
    }

    #[tokio::test]
    async fn test_proxied_transport_needs_proxy_section() {
        let config = TransportConfig {
            kind: TransportKind::Proxied,
            proxy: None,
        };
        let result = open_transport(&config).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
