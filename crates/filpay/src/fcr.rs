//! Fast Confirmation Rule monitor: a long-running poller of the F3
//! subprotocol that exposes a four-level confirmation lattice per tipset
//! height.
//!
//! Levels: `L0` mempool (reported by the settlement engine while the tipset
//! height is unknown), `L1` included, `L2` FCR-safe, `L3` finalized. The
//! monitor never advertises `L0` for a known height and never surfaces its
//! own errors; it best-effort continues on the next tick.
//!
//! The L2 heuristic: a tipset subject to the active instance is safe once
//! COMMIT is reached (explicit quorum witnessed), or while PREPARE holds at
//! round 0 for at least the propagation guard (5 s by default). The guard is
//! load-bearing for the safety claim; configuration can only raise it. A
//! round bump demotes to `L1` until COMMIT.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use tokio::sync::watch;

use crate::f3::{F3Certificate, F3Client, Phase};
use crate::settlement::SettlementRecord;

/// Confirmation lattice. Ordering is the confirmation strength; the
/// settlement engine treats a record's level as monotone non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, serde::Deserialize)]
pub enum ConfirmationLevel {
    L0,
    L1,
    L2,
    L3,
}

impl ConfirmationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmationLevel::L0 => "L0",
            ConfirmationLevel::L1 => "L1",
            ConfirmationLevel::L2 => "L2",
            ConfirmationLevel::L3 => "L3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "L0" => Some(ConfirmationLevel::L0),
            "L1" => Some(ConfirmationLevel::L1),
            "L2" => Some(ConfirmationLevel::L2),
            "L3" => Some(ConfirmationLevel::L3),
            _ => None,
        }
    }
}

/// Catalogue entry for `GET /fcr/levels`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LevelInfo {
    pub code: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub latency: &'static str,
}

/// The static level catalogue, including the bond backstop pseudo-level.
pub fn level_catalogue() -> &'static [LevelInfo] {
    &[
        LevelInfo {
            code: "L0",
            name: "mempool",
            description: "accepted by the facilitator, not yet in any tipset",
            latency: "immediate",
        },
        LevelInfo {
            code: "L1",
            name: "included",
            description: "in a tipset, not yet safe under the fast confirmation rule",
            latency: "~30s",
        },
        LevelInfo {
            code: "L2",
            name: "fcr-safe",
            description: "active consensus instance reached COMMIT, or held PREPARE at round 0 past the propagation guard",
            latency: "~1-2 min",
        },
        LevelInfo {
            code: "L3",
            name: "finalized",
            description: "covered by an F3 finality certificate",
            latency: "~2-5 min",
        },
        LevelInfo {
            code: "LB",
            name: "bond-backstop",
            description: "not confirmed; the provider is covered by the facilitator's bond commitment",
            latency: "10 min deadline",
        },
    ]
}

/// Monitor tuning. `min_time_in_prepare` is clamped up to the safety
/// minimum, never down.
#[derive(Debug, Clone)]
pub struct FcrConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub require_round_zero: bool,
    pub min_time_in_prepare: Duration,
    /// Default timeout for `GET /fcr/wait`.
    pub confirmation_timeout: Duration,
}

/// Floor for the PREPARE propagation guard.
pub const MIN_PREPARE_GUARD: Duration = Duration::from_secs(5);

impl Default for FcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(1),
            require_round_zero: true,
            min_time_in_prepare: MIN_PREPARE_GUARD,
            confirmation_timeout: Duration::from_secs(120),
        }
    }
}

/// The monitor's view of the active consensus instance. Mutated only on the
/// poller task; other tasks read cloned snapshots.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub instance: u64,
    pub round: u64,
    pub phase: Phase,
    /// Monotonic clock for the PREPARE guard.
    pub phase_start: Instant,
    /// Wall clock for display.
    pub phase_start_ms: i64,
    pub round_bumps: u32,
}

/// Serializable snapshot for `GET /fcr/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStateView {
    pub instance: u64,
    pub round: u64,
    pub phase: &'static str,
    pub phase_start_ms: i64,
    pub round_bumps: u32,
    pub level: ConfirmationLevel,
}

/// How a target height maps onto the instance timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightStatus {
    /// Covered by a finality certificate.
    Finalized,
    /// Subject of the active instance.
    Active,
    /// Not yet decided and not subject of the active instance.
    Pending,
}

impl HeightStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HeightStatus::Finalized => "finalized",
            HeightStatus::Active => "active",
            HeightStatus::Pending => "pending",
        }
    }
}

/// Result of evaluating a tipset height against the monitor state.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationStatus {
    pub level: ConfirmationLevel,
    pub instance: u64,
    pub status: HeightStatus,
    pub round: Option<u64>,
    pub phase: Option<Phase>,
    /// Certificates are identified by their instance.
    pub certificate_id: Option<u64>,
}

/// Wire shape of the per-settlement FCR fields.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcrInfo {
    pub level: ConfirmationLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tipset_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<i64>,
}

impl FcrInfo {
    pub fn from_record(record: &SettlementRecord) -> Self {
        Self {
            level: record.confirmation_level,
            tipset_height: record.tipset_height,
            instance: record.f3_instance,
            round: record.f3_round,
            phase: record.f3_phase.map(|p| p.as_str().to_string()),
            confirmed_at: record.confirmed_at,
        }
    }
}

/// Certificate with its finalized height precomputed on arrival.
#[derive(Debug, Clone, Copy)]
struct CachedCertificate {
    instance: u64,
    finalized_height: u64,
}

impl From<&F3Certificate> for CachedCertificate {
    fn from(cert: &F3Certificate) -> Self {
        Self {
            instance: cert.instance,
            finalized_height: cert.finalized_height(),
        }
    }
}

/// Bounded certificate cache capacity.
const CERT_CACHE_CAPACITY: usize = 100;

/// The FCR monitor. A pure source of [`ConfirmationStatus`] values keyed by
/// height; it depends on nothing else in the core.
pub struct FcrMonitor {
    client: Arc<dyn F3Client>,
    config: FcrConfig,
    state: RwLock<Option<InstanceState>>,
    certs: Mutex<LruCache<u64, CachedCertificate>>,
    latest_cert: RwLock<Option<CachedCertificate>>,
    level_tx: watch::Sender<ConfirmationLevel>,
}

impl FcrMonitor {
    pub fn new(client: Arc<dyn F3Client>, mut config: FcrConfig) -> Self {
        if config.min_time_in_prepare < MIN_PREPARE_GUARD {
            tracing::warn!(
                configured_ms = config.min_time_in_prepare.as_millis() as u64,
                "minTimeInPrepare below the safety minimum; clamping to 5s"
            );
            config.min_time_in_prepare = MIN_PREPARE_GUARD;
        }
        let (level_tx, _) = watch::channel(ConfirmationLevel::L0);
        Self {
            client,
            config,
            state: RwLock::new(None),
            certs: Mutex::new(LruCache::new(
                NonZeroUsize::new(CERT_CACHE_CAPACITY).unwrap(),
            )),
            latest_cert: RwLock::new(None),
            level_tx,
        }
    }

    pub fn config(&self) -> &FcrConfig {
        &self.config
    }

    /// Spawn the poller. It stops at the next tick after `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(manifest) = monitor.client.get_manifest().await {
                let network = manifest
                    .get("NetworkName")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                tracing::info!(network, "f3 monitor starting");
            }

            let mut interval = tokio::time::interval(monitor.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => monitor.poll_once().await,
                    _ = shutdown.changed() => {
                        tracing::info!("f3 monitor stopping");
                        return;
                    }
                }
            }
        });
    }

    /// One poll of `F3GetProgress`, diffed against the previous sample.
    /// Errors are logged and swallowed; the monitor never surfaces them.
    pub async fn poll_once(&self) {
        let progress = match self.client.get_progress().await {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "f3 progress poll failed");
                return;
            }
        };

        let mut fetch_certs_for: Option<u64> = None;
        {
            let mut state = self.state.write().unwrap();
            let now_ms = chrono::Utc::now().timestamp_millis();
            match state.as_mut() {
                None => {
                    *state = Some(InstanceState {
                        instance: progress.instance,
                        round: progress.round,
                        phase: progress.phase,
                        phase_start: Instant::now(),
                        phase_start_ms: now_ms,
                        round_bumps: 0,
                    });
                    fetch_certs_for = progress.instance.checked_sub(1);
                }
                Some(current) if progress.instance > current.instance => {
                    tracing::debug!(
                        from = current.instance,
                        to = progress.instance,
                        "f3 instance advanced"
                    );
                    let previous = current.instance;
                    *current = InstanceState {
                        instance: progress.instance,
                        round: progress.round,
                        phase: progress.phase,
                        phase_start: Instant::now(),
                        phase_start_ms: now_ms,
                        round_bumps: 0,
                    };
                    fetch_certs_for = Some(previous);
                }
                Some(current) if progress.instance < current.instance => {
                    // Instance is monotone; a lower sample is a stale or
                    // misrouted response.
                    tracing::warn!(
                        sample = progress.instance,
                        current = current.instance,
                        "ignoring non-monotone f3 instance"
                    );
                }
                Some(current) if progress.round > current.round => {
                    current.round = progress.round;
                    current.phase = progress.phase;
                    current.phase_start = Instant::now();
                    current.phase_start_ms = now_ms;
                    current.round_bumps += 1;
                    if current.round_bumps >= 2 {
                        tracing::warn!(
                            instance = current.instance,
                            round = current.round,
                            bumps = current.round_bumps,
                            "repeated f3 round bumps; fast confirmations degraded"
                        );
                    }
                }
                Some(current) if progress.phase != current.phase => {
                    current.phase = progress.phase;
                    current.phase_start = Instant::now();
                    current.phase_start_ms = now_ms;
                }
                Some(_) => {}
            }
        }

        if let Some(decided) = fetch_certs_for {
            self.refresh_certificates(decided).await;
        }

        let level = self.top_level();
        self.level_tx.send_if_modified(|current| {
            if *current != level {
                *current = level;
                true
            } else {
                false
            }
        });
    }

    /// Fetch the latest certificate and, if it does not cover `decided`,
    /// that instance's certificate as well. Best-effort.
    async fn refresh_certificates(&self, decided: u64) {
        match self.client.get_latest_certificate().await {
            Ok(Some(cert)) => self.insert_certificate(&cert),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "latest certificate fetch failed"),
        }

        let have_decided = self.certs.lock().unwrap().contains(&decided);
        if !have_decided {
            match self.client.get_certificate(decided).await {
                Ok(Some(cert)) => self.insert_certificate(&cert),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(instance = decided, error = %e, "certificate fetch failed")
                }
            }
        }
    }

    fn insert_certificate(&self, cert: &F3Certificate) {
        let cached = CachedCertificate::from(cert);
        self.certs.lock().unwrap().put(cached.instance, cached);

        let mut latest = self.latest_cert.write().unwrap();
        if latest.map(|l| cached.instance > l.instance).unwrap_or(true) {
            *latest = Some(cached);
        }
    }

    fn cert_for(&self, instance: u64) -> Option<CachedCertificate> {
        self.certs.lock().unwrap().get(&instance).copied()
    }

    /// Map a target height onto the instance timeline. Pure over the
    /// current snapshot and certificate cache.
    pub fn map_height(&self, height: u64) -> (u64, HeightStatus) {
        if let Some(latest) = *self.latest_cert.read().unwrap() {
            if latest.finalized_height >= height {
                return (latest.instance, HeightStatus::Finalized);
            }
        }

        let snapshot = self.state.read().unwrap().clone();
        let Some(state) = snapshot else {
            return (0, HeightStatus::Pending);
        };

        if let Some(cert) = self.cert_for(state.instance) {
            if cert.finalized_height >= height {
                return (state.instance, HeightStatus::Finalized);
            }
            // The active instance is already decided and does not cover the
            // height; the next instance will.
            return (state.instance + 1, HeightStatus::Pending);
        }

        (state.instance, HeightStatus::Active)
    }

    /// Phase evaluator for the active instance.
    fn evaluate_phase(&self, state: &InstanceState) -> ConfirmationLevel {
        if state.phase >= Phase::Decide {
            return ConfirmationLevel::L3;
        }
        if state.phase == Phase::Commit {
            return ConfirmationLevel::L2;
        }
        if state.phase == Phase::Prepare
            && (state.round == 0 || !self.config.require_round_zero)
            && state.phase_start.elapsed() >= self.config.min_time_in_prepare
        {
            return ConfirmationLevel::L2;
        }
        ConfirmationLevel::L1
    }

    /// Evaluate the confirmation level of a tipset height. Never returns
    /// `L0`: a height is at least included.
    pub fn evaluate(&self, height: u64) -> ConfirmationStatus {
        let (instance, status) = self.map_height(height);
        match status {
            HeightStatus::Finalized => ConfirmationStatus {
                level: ConfirmationLevel::L3,
                instance,
                status,
                round: None,
                phase: None,
                certificate_id: Some(instance),
            },
            HeightStatus::Active => {
                let snapshot = self.state.read().unwrap().clone();
                match snapshot {
                    Some(state) if state.instance == instance => ConfirmationStatus {
                        level: self.evaluate_phase(&state),
                        instance,
                        status,
                        round: Some(state.round),
                        phase: Some(state.phase),
                        certificate_id: None,
                    },
                    _ => ConfirmationStatus {
                        level: ConfirmationLevel::L1,
                        instance,
                        status,
                        round: None,
                        phase: None,
                        certificate_id: None,
                    },
                }
            }
            HeightStatus::Pending => ConfirmationStatus {
                level: ConfirmationLevel::L1,
                instance,
                status,
                round: None,
                phase: None,
                certificate_id: None,
            },
        }
    }

    /// The chain-wide confirmation level of the active instance, `L0` before
    /// the first successful poll.
    pub fn top_level(&self) -> ConfirmationLevel {
        match self.state.read().unwrap().as_ref() {
            Some(state) => self.evaluate_phase(state),
            None => ConfirmationLevel::L0,
        }
    }

    /// Snapshot for `GET /fcr/status`.
    pub fn status(&self) -> Option<InstanceStateView> {
        let state = self.state.read().unwrap().clone()?;
        let level = self.evaluate_phase(&state);
        Some(InstanceStateView {
            instance: state.instance,
            round: state.round,
            phase: state.phase.as_str(),
            phase_start_ms: state.phase_start_ms,
            round_bumps: state.round_bumps,
            level,
        })
    }

    /// Suspend until the top-level status reaches `level` or `timeout`
    /// elapses. Returns `true` on success.
    pub async fn wait_for_level(&self, level: ConfirmationLevel, timeout: Duration) -> bool {
        let mut rx = self.level_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|current| *current >= level))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::f3::{EcTipset, F3Progress};
    use crate::FacilitatorError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Scripted F3 endpoint: pops one progress sample per poll and serves
    /// certificates from a fixed map.
    struct ScriptedF3 {
        progress: StdMutex<Vec<F3Progress>>,
        certs: StdMutex<Vec<F3Certificate>>,
    }

    impl ScriptedF3 {
        fn new(samples: Vec<F3Progress>) -> Self {
            Self {
                progress: StdMutex::new(samples),
                certs: StdMutex::new(Vec::new()),
            }
        }

        fn with_certs(samples: Vec<F3Progress>, certs: Vec<F3Certificate>) -> Self {
            Self {
                progress: StdMutex::new(samples),
                certs: StdMutex::new(certs),
            }
        }
    }

    #[async_trait]
    impl F3Client for ScriptedF3 {
        async fn get_progress(&self) -> Result<F3Progress, FacilitatorError> {
            let mut samples = self.progress.lock().unwrap();
            if samples.is_empty() {
                return Err(FacilitatorError::Chain("no more samples".to_string()));
            }
            Ok(samples.remove(0))
        }

        async fn get_certificate(
            &self,
            instance: u64,
        ) -> Result<Option<F3Certificate>, FacilitatorError> {
            Ok(self
                .certs
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.instance == instance)
                .cloned())
        }

        async fn get_latest_certificate(&self) -> Result<Option<F3Certificate>, FacilitatorError> {
            Ok(self
                .certs
                .lock()
                .unwrap()
                .iter()
                .max_by_key(|c| c.instance)
                .cloned())
        }

        async fn get_manifest(&self) -> Result<serde_json::Value, FacilitatorError> {
            Ok(serde_json::json!({"NetworkName": "test"}))
        }
    }

    fn progress(instance: u64, round: u64, phase: Phase) -> F3Progress {
        F3Progress {
            instance,
            round,
            phase,
        }
    }

    fn cert(instance: u64, height: u64) -> F3Certificate {
        F3Certificate {
            instance,
            ec_chain: vec![EcTipset { epoch: height }],
        }
    }

    fn monitor_with(samples: Vec<F3Progress>, certs: Vec<F3Certificate>) -> FcrMonitor {
        FcrMonitor::new(
            Arc::new(ScriptedF3::with_certs(samples, certs)),
            FcrConfig::default(),
        )
    }

    #[tokio::test]
    async fn commit_phase_is_l2_decide_is_l3() {
        let monitor = monitor_with(
            vec![
                progress(10, 0, Phase::Commit),
                progress(10, 0, Phase::Decide),
            ],
            vec![],
        );

        monitor.poll_once().await;
        assert_eq!(monitor.top_level(), ConfirmationLevel::L2);
        let status = monitor.evaluate(500);
        assert_eq!(status.level, ConfirmationLevel::L2);
        assert_eq!(status.status, HeightStatus::Active);

        monitor.poll_once().await;
        assert_eq!(monitor.top_level(), ConfirmationLevel::L3);
    }

    #[tokio::test]
    async fn prepare_needs_the_propagation_guard() {
        let monitor = monitor_with(vec![progress(10, 0, Phase::Prepare)], vec![]);
        monitor.poll_once().await;

        // Fresh PREPARE: not yet safe.
        assert_eq!(monitor.top_level(), ConfirmationLevel::L1);

        // Backdate the phase start past the guard.
        {
            let mut state = monitor.state.write().unwrap();
            let s = state.as_mut().unwrap();
            s.phase_start = Instant::now() - Duration::from_secs(6);
        }
        assert_eq!(monitor.top_level(), ConfirmationLevel::L2);
    }

    #[tokio::test]
    async fn round_bump_demotes_prepare_until_commit() {
        let monitor = monitor_with(
            vec![
                progress(10, 0, Phase::Prepare),
                progress(10, 1, Phase::Prepare),
                progress(10, 1, Phase::Commit),
            ],
            vec![],
        );

        monitor.poll_once().await;
        {
            let mut state = monitor.state.write().unwrap();
            state.as_mut().unwrap().phase_start = Instant::now() - Duration::from_secs(6);
        }
        assert_eq!(monitor.top_level(), ConfirmationLevel::L2);

        // Round bump: back to L1 even after the guard elapses again.
        monitor.poll_once().await;
        {
            let mut state = monitor.state.write().unwrap();
            let s = state.as_mut().unwrap();
            assert_eq!(s.round, 1);
            assert_eq!(s.round_bumps, 1);
            s.phase_start = Instant::now() - Duration::from_secs(6);
        }
        assert_eq!(monitor.top_level(), ConfirmationLevel::L1);

        // COMMIT restores L2 regardless of the round.
        monitor.poll_once().await;
        assert_eq!(monitor.top_level(), ConfirmationLevel::L2);
    }

    #[tokio::test]
    async fn instance_advance_resets_round_bumps_and_fetches_certs() {
        let monitor = monitor_with(
            vec![
                progress(10, 2, Phase::Prepare),
                progress(11, 0, Phase::Quality),
            ],
            vec![cert(10, 800)],
        );

        monitor.poll_once().await;
        monitor.poll_once().await;

        let view = monitor.status().unwrap();
        assert_eq!(view.instance, 11);
        assert_eq!(view.round_bumps, 0);

        // The decided instance's certificate is now cached; heights at or
        // below its finalized height are L3.
        let status = monitor.evaluate(800);
        assert_eq!(status.level, ConfirmationLevel::L3);
        assert_eq!(status.status, HeightStatus::Finalized);
        assert_eq!(status.certificate_id, Some(10));
    }

    #[tokio::test]
    async fn heights_past_certified_coverage_stay_pending_or_active() {
        let monitor = monitor_with(
            vec![progress(10, 0, Phase::Quality), progress(11, 0, Phase::Quality)],
            vec![cert(10, 800)],
        );

        // Instance 10 already has its certificate: heights past its
        // coverage belong to the next instance and are still pending.
        monitor.poll_once().await;
        let status = monitor.evaluate(801);
        assert_eq!(status.status, HeightStatus::Pending);
        assert_eq!(status.instance, 11);
        assert_eq!(status.level, ConfirmationLevel::L1);

        // Once the progress sample advances, instance 11 is active and
        // covers the height.
        monitor.poll_once().await;
        let status = monitor.evaluate(801);
        assert_eq!(status.status, HeightStatus::Active);
        assert_eq!(status.instance, 11);
        assert_eq!(status.level, ConfirmationLevel::L1);
    }

    #[tokio::test]
    async fn unknown_state_maps_to_pending_l1() {
        let monitor = monitor_with(vec![], vec![]);
        let status = monitor.evaluate(100);
        assert_eq!(status.level, ConfirmationLevel::L1);
        assert_eq!(status.status, HeightStatus::Pending);
        assert_eq!(status.instance, 0);
        assert_eq!(monitor.top_level(), ConfirmationLevel::L0);
    }

    #[tokio::test]
    async fn non_monotone_instance_sample_is_ignored() {
        let monitor = monitor_with(
            vec![progress(11, 0, Phase::Commit), progress(10, 0, Phase::Quality)],
            vec![],
        );
        monitor.poll_once().await;
        monitor.poll_once().await;

        let view = monitor.status().unwrap();
        assert_eq!(view.instance, 11);
        assert_eq!(view.phase, "COMMIT");
    }

    #[tokio::test]
    async fn wait_for_level_resolves_on_poll() {
        let monitor = Arc::new(monitor_with(vec![progress(10, 0, Phase::Commit)], vec![]));

        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move {
                monitor
                    .wait_for_level(ConfirmationLevel::L2, Duration::from_secs(5))
                    .await
            })
        };

        monitor.poll_once().await;
        assert!(waiter.await.unwrap());

        // Already satisfied levels resolve immediately.
        assert!(
            monitor
                .wait_for_level(ConfirmationLevel::L1, Duration::from_millis(10))
                .await
        );
        // Unreached levels time out.
        assert!(
            !monitor
                .wait_for_level(ConfirmationLevel::L3, Duration::from_millis(10))
                .await
        );
    }

    #[test]
    fn prepare_guard_cannot_be_lowered() {
        let monitor = FcrMonitor::new(
            Arc::new(ScriptedF3::new(vec![])),
            FcrConfig {
                min_time_in_prepare: Duration::from_millis(100),
                ..FcrConfig::default()
            },
        );
        assert_eq!(monitor.config().min_time_in_prepare, MIN_PREPARE_GUARD);
    }

    #[test]
    fn catalogue_lists_all_levels() {
        let codes: Vec<&str> = level_catalogue().iter().map(|l| l.code).collect();
        assert_eq!(codes, vec!["L0", "L1", "L2", "L3", "LB"]);
    }
}
