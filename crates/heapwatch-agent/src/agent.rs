//! The embedded agent facade
//!
//! [`HeapwatchAgent`] is what host programs hold: lifecycle control,
//! signal queries, alerting, hotspots, streaming, and performance
//! operations, all backed by the subsystems wired together here. The
//! background tasks themselves live in the supervisor module.

use crate::snapshot::{AnalyzeOptions, InMemorySnapshotProvider, SnapshotHandle, SnapshotProvider};
use chrono::Utc;
use heapwatch_alerts::{AlertFilter, AlertInput, AlertManager, AlertStats};
use heapwatch_common::config::{
    AgentConfig, AlertingConfig, ChannelConfig, ChannelFilters, ChannelKind, HotspotConfig,
    StreamingConfig,
};
use heapwatch_common::{
    AgentEvent, Alert, CircuitBreaker, CircuitBreakerConfig, Error, ErrorRecord, HealthReport,
    Hotspot, LeakVerdict, MetricRing, Result, SafeTimer, Sample,
};
use heapwatch_detect::{DetectorConfig, HotspotAnalyzer, HotspotFilter, HotspotStats, LeakDetector};
use heapwatch_perf::{
    CacheConfig, CacheStats, OperationOptions, OperationQueue, OptimizerCache, OptimizerConfig,
    OverheadReport, PerformanceOptimizer, PutOptions, QueueStats, ResourceSnapshot,
    SamplingStrategy,
};
use heapwatch_probe::{gc_channel, GcHooks, GcRecorder, ProbeConfig, RuntimeProbe, SampleHistory};
use heapwatch_stream::{HubStats, StreamAuthenticator, StreamEvent, StreamHub, StreamServer};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Capacity of the agent-event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Error records retained for `get_error_history`.
const ERROR_HISTORY: usize = 100;

/// Aggregate view returned by [`HeapwatchAgent::get_metrics`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub latest: Option<Sample>,
    pub samples_retained: usize,
    pub gc_events_retained: usize,
    pub avg_heap_used: f64,
    pub avg_event_loop_delay_ms: f64,
}

/// Aggregate view returned by [`HeapwatchAgent::get_performance_metrics`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub interval_ms: u64,
    pub sampling_rate: f64,
    pub overhead_efficiency: f64,
    pub queue: QueueStats,
    pub cache: CacheStats,
}

/// Result of a bounded profiling run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileReport {
    pub duration_ms: u64,
    pub samples: usize,
    pub heap_used_min: u64,
    pub heap_used_max: u64,
    pub heap_used_mean: f64,
    pub gc_events: usize,
    pub avg_event_loop_delay_ms: f64,
}

pub(crate) struct Breakers {
    pub(crate) sampler: Arc<CircuitBreaker>,
    pub(crate) hotspots: Arc<CircuitBreaker>,
    pub(crate) optimizer: Arc<CircuitBreaker>,
}

pub(crate) struct AgentInner {
    pub(crate) config: RwLock<AgentConfig>,
    pub(crate) events: broadcast::Sender<AgentEvent>,
    pub(crate) probe: Arc<RuntimeProbe>,
    pub(crate) gc_recorder: GcRecorder,
    pub(crate) history: Mutex<SampleHistory>,
    pub(crate) detector: Mutex<LeakDetector>,
    pub(crate) analyzer: Mutex<HotspotAnalyzer>,
    pub(crate) alerts: AlertManager,
    pub(crate) optimizer: Arc<PerformanceOptimizer>,
    pub(crate) queue: OperationQueue,
    pub(crate) cache: Arc<OptimizerCache>,
    pub(crate) hub: StreamHub,
    pub(crate) stream: tokio::sync::Mutex<Option<StreamServer>>,
    pub(crate) stream_auth: RwLock<Option<Arc<dyn StreamAuthenticator>>>,
    pub(crate) snapshots: RwLock<Arc<dyn SnapshotProvider>>,
    pub(crate) gc_hooks: RwLock<Option<Arc<dyn GcHooks>>>,
    pub(crate) errors: Mutex<MetricRing<ErrorRecord>>,
    pub(crate) total_errors: AtomicU64,
    pub(crate) breakers: Breakers,
    pub(crate) running: AtomicBool,
    pub(crate) started_at: Mutex<Option<Instant>>,
    pub(crate) shutdown: Mutex<Option<watch::Sender<bool>>>,
    pub(crate) timers: Mutex<Vec<SafeTimer>>,
    pub(crate) hotspot_timer: Mutex<Option<SafeTimer>>,
    pub(crate) sampler_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) router_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) resources: Mutex<ResourceSnapshot>,
}

/// The in-process memory-observability agent.
#[derive(Clone)]
pub struct HeapwatchAgent {
    pub(crate) inner: Arc<AgentInner>,
}

/// The reporting section contributes sinks to the alert channel list:
/// a configured report file or webhook becomes a delivery channel.
fn alerting_with_reporting(config: &AgentConfig) -> AlertingConfig {
    let mut alerting = config.alerting.clone();
    let reporting = &config.reporting;

    if !reporting.console {
        alerting
            .channels
            .retain(|c| c.kind != ChannelKind::Console);
    }
    if let Some(path) = &reporting.file {
        let present = alerting
            .channels
            .iter()
            .any(|c| c.kind == ChannelKind::File && c.target.as_deref() == Some(path.as_str()));
        if !present {
            alerting.channels.push(ChannelConfig {
                name: "report-file".into(),
                kind: ChannelKind::File,
                min_level: None,
                filters: ChannelFilters::default(),
                target: Some(path.clone()),
            });
        }
    }
    if let Some(url) = &reporting.webhook {
        let present = alerting
            .channels
            .iter()
            .any(|c| c.kind == ChannelKind::Webhook && c.target.as_deref() == Some(url.as_str()));
        if !present {
            alerting.channels.push(ChannelConfig {
                name: "report-webhook".into(),
                kind: ChannelKind::Webhook,
                min_level: None,
                filters: ChannelFilters::default(),
                target: Some(url.clone()),
            });
        }
    }
    alerting
}

fn optimizer_config(config: &AgentConfig) -> OptimizerConfig {
    let strategy = if !config.performance.adaptive {
        SamplingStrategy::Fixed
    } else if config.performance.low_impact_mode {
        SamplingStrategy::Intelligent
    } else {
        SamplingStrategy::Adaptive
    };
    OptimizerConfig {
        base_interval: Duration::from_millis(config.monitoring.interval_ms),
        min_interval: Duration::from_millis(config.monitoring.min_interval_ms),
        max_interval: Duration::from_millis(config.monitoring.max_interval_ms),
        load_threshold: 0.7,
        pressure_threshold: 0.8,
        strategy,
        base_rate: 1.0,
        min_rate: 0.1,
        max_rate: 1.0,
    }
}

impl HeapwatchAgent {
    /// Build an agent from an already-validated configuration.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let config = config.normalize();
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (gc_recorder, gc_drain) = gc_channel();
        let probe = Arc::new(
            RuntimeProbe::new(ProbeConfig {
                detailed: config.monitoring.detailed,
                gc: config.monitoring.gc,
                heap_limit: None,
            })
            .with_gc_drain(gc_drain),
        );

        let breaker_settings = CircuitBreakerConfig::from(&config.error_handling.circuit_breaker);
        let breakers = Breakers {
            sampler: Arc::new(CircuitBreaker::new("sampler", breaker_settings.clone())),
            hotspots: Arc::new(CircuitBreaker::new("hotspots", breaker_settings.clone())),
            optimizer: Arc::new(CircuitBreaker::new("optimizer", breaker_settings)),
        };

        let inner = Arc::new(AgentInner {
            detector: Mutex::new(LeakDetector::new(DetectorConfig::from_agent(&config))),
            analyzer: Mutex::new(HotspotAnalyzer::new(config.hotspots.clone())),
            alerts: AlertManager::new(alerting_with_reporting(&config), events.clone()),
            optimizer: Arc::new(PerformanceOptimizer::new(
                optimizer_config(&config),
                events.clone(),
            )),
            queue: OperationQueue::new(
                config.performance.throttling.max_concurrent,
                events.clone(),
            ),
            cache: Arc::new(OptimizerCache::new(CacheConfig {
                max_entries: config.performance.caching.max_entries,
                default_ttl: Duration::from_millis(config.performance.caching.ttl_ms),
                compress_threshold: 16 * 1024,
            })),
            hub: StreamHub::new(config.streaming.buffer_size, events.clone()),
            stream: tokio::sync::Mutex::new(None),
            stream_auth: RwLock::new(None),
            snapshots: RwLock::new(Arc::new(InMemorySnapshotProvider::new())),
            gc_hooks: RwLock::new(None),
            errors: Mutex::new(MetricRing::new(ERROR_HISTORY)),
            total_errors: AtomicU64::new(0),
            breakers,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            shutdown: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
            hotspot_timer: Mutex::new(None),
            sampler_handle: Mutex::new(None),
            router_handle: Mutex::new(None),
            resources: Mutex::new(ResourceSnapshot::default()),
            history: Mutex::new(SampleHistory::default()),
            probe,
            gc_recorder,
            events,
            config: RwLock::new(config),
        });

        Ok(Self { inner })
    }

    /// Subscribe to the agent's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    /// Host-side handle for reporting GC notifications into the probe.
    pub fn gc_recorder(&self) -> GcRecorder {
        self.inner.gc_recorder.clone()
    }

    /// Install a runtime hook for on-demand collection.
    pub fn set_gc_hooks(&self, hooks: Arc<dyn GcHooks>) {
        *self.inner.gc_hooks.write() = Some(hooks);
    }

    /// Replace the snapshot backend.
    pub fn set_snapshot_provider(&self, provider: Arc<dyn SnapshotProvider>) {
        *self.inner.snapshots.write() = provider;
    }

    /// Install the bearer-token predicate used by the stream server.
    pub fn set_stream_authenticator(&self, auth: Arc<dyn StreamAuthenticator>) {
        *self.inner.stream_auth.write() = Some(auth);
    }

    // ---- lifecycle ------------------------------------------------------

    /// Deep-merge a partial configuration over the current one.
    ///
    /// Subsystems that support live reconfiguration pick the changes up
    /// immediately; the detector and analyzer are rebuilt only while the
    /// agent is stopped.
    pub fn configure(&self, partial: serde_json::Value) -> Result<()> {
        let merged = {
            let current = self.inner.config.read();
            let mut base = serde_json::to_value(&*current)?;
            deep_merge(&mut base, partial);
            base
        };
        let config: AgentConfig = serde_json::from_value(merged)
            .map_err(|e| Error::Configuration(format!("invalid configuration: {}", e)))?;
        let config = config.normalize();
        config.validate()?;

        self.inner.alerts.update_config(alerting_with_reporting(&config));
        if !self.inner.running.load(Ordering::SeqCst) {
            *self.inner.detector.lock() = LeakDetector::new(DetectorConfig::from_agent(&config));
            *self.inner.analyzer.lock() = HotspotAnalyzer::new(config.hotspots.clone());
        }
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Start every subsystem task. Idempotence is an error: starting a
    /// running agent is an invalid transition.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::State("agent is already running".into()));
        }
        info!("heapwatch agent starting");
        *self.inner.started_at.lock() = Some(Instant::now());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock() = Some(shutdown_tx);

        self.inner.probe.start_loop_monitor(Duration::from_millis(500));
        self.spawn_event_router(shutdown_rx.clone());
        self.spawn_sampler(shutdown_rx);
        self.spawn_periodic_tasks();

        let (hotspots_enabled, streaming_enabled) = {
            let config = self.inner.config.read();
            (config.hotspots.enabled, config.streaming.enabled)
        };
        if hotspots_enabled {
            self.start_hotspot_analysis(None)?;
        }
        if streaming_enabled {
            self.start_streaming(None).await?;
        }
        Ok(())
    }

    /// Stop every task and subscriber; the agent can be started again.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("heapwatch agent stopping");

        if let Some(shutdown) = self.inner.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        for timer in self.inner.timers.lock().drain(..) {
            timer.stop();
        }
        if let Some(timer) = self.inner.hotspot_timer.lock().take() {
            timer.stop();
        }
        if let Some(handle) = self.inner.sampler_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.router_handle.lock().take() {
            handle.abort();
        }
        self.inner.queue.shutdown();
        self.inner.alerts.shutdown();
        self.inner.probe.stop_loop_monitor();
        self.stop_streaming().await;
    }

    /// Stop with a hard deadline; subsystems that miss it are abandoned.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> Result<()> {
        let _ = self.inner.events.send(AgentEvent::Shutdown);
        match tokio::time::timeout(timeout, self.stop()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(?timeout, "graceful shutdown deadline expired, abandoning subsystems");
                Ok(())
            }
        }
    }

    /// Drop all derived state: baseline, hotspots, cache, errors.
    pub fn reset(&self) {
        self.inner.detector.lock().reset();
        self.inner.analyzer.lock().clear();
        self.inner.cache.clear();
        self.inner.history.lock().clear();
        self.inner.errors.lock().clear();
        self.inner.total_errors.store(0, Ordering::SeqCst);
        self.inner.optimizer.reset();
        self.inner.breakers.sampler.reset();
        self.inner.breakers.hotspots.reset();
        self.inner.breakers.optimizer.reset();
    }

    pub fn get_health(&self) -> HealthReport {
        self.build_health_report()
    }

    pub fn get_error_history(&self) -> Vec<ErrorRecord> {
        self.inner.errors.lock().to_vec()
    }

    pub fn clear_errors(&self) {
        self.inner.errors.lock().clear();
        self.inner.total_errors.store(0, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ---- signals --------------------------------------------------------

    /// Capture and cache a heap snapshot.
    pub async fn snapshot(&self) -> Result<SnapshotHandle> {
        let sample = self.inner.probe.collect();
        let provider = self.inner.snapshots.read().clone();
        provider.take_snapshot(&sample).await
    }

    /// Take a fresh snapshot and analyze it.
    pub async fn analyze(&self, options: AnalyzeOptions) -> Result<serde_json::Value> {
        let handle = self.snapshot().await?;
        self.analyze_snapshot(&handle, options).await
    }

    /// Analyze a previously captured snapshot.
    pub async fn analyze_snapshot(
        &self,
        handle: &SnapshotHandle,
        options: AnalyzeOptions,
    ) -> Result<serde_json::Value> {
        let provider = self.inner.snapshots.read().clone();
        provider.analyze(handle, &options).await
    }

    /// Diff two cached snapshots.
    pub async fn compare(
        &self,
        before: &SnapshotHandle,
        after: &SnapshotHandle,
    ) -> Result<serde_json::Value> {
        let provider = self.inner.snapshots.read().clone();
        provider.compare(before, after).await
    }

    /// Ask the host runtime for a collection, when a hook is installed.
    pub async fn force_gc(&self) -> Result<()> {
        let hooks = self.inner.gc_hooks.read().clone();
        match hooks {
            Some(hooks) => hooks.force_collect().await,
            None => Err(Error::Monitoring(
                "no gc hooks installed; force_gc is unsupported".into(),
            )),
        }
    }

    /// Collect samples at the profiling rate for `duration_ms`.
    pub async fn profile(&self, duration_ms: u64) -> Result<ProfileReport> {
        let (enabled, sample_rate, min_samples) = {
            let config = self.inner.config.read();
            (
                config.profiling.enabled,
                config.profiling.sample_rate,
                config.profiling.filters.min_sample_count,
            )
        };
        if !enabled {
            return Err(Error::Profiling("profiling is disabled".into()));
        }

        let interval = Duration::from_millis(((1_000.0 / sample_rate.max(0.001)) as u64).max(10));
        let deadline = Instant::now() + Duration::from_millis(duration_ms);
        let mut heap_used = Vec::new();
        let mut gc_events = 0usize;
        let mut loop_delays = Vec::new();

        while Instant::now() < deadline {
            let sample = self.inner.probe.collect();
            heap_used.push(sample.heap.used);
            gc_events += sample.gc.len();
            loop_delays.push(sample.event_loop_delay_ms);
            tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }

        if heap_used.len() < min_samples.max(1) {
            return Err(Error::Profiling(format!(
                "profiling window produced {} samples, need at least {}",
                heap_used.len(),
                min_samples.max(1)
            )));
        }
        let mean = heap_used.iter().sum::<u64>() as f64 / heap_used.len() as f64;
        Ok(ProfileReport {
            duration_ms,
            samples: heap_used.len(),
            heap_used_min: *heap_used.iter().min().unwrap(),
            heap_used_max: *heap_used.iter().max().unwrap(),
            heap_used_mean: mean,
            gc_events,
            avg_event_loop_delay_ms: loop_delays.iter().sum::<f64>()
                / loop_delays.len().max(1) as f64,
        })
    }

    pub fn get_metrics(&self) -> MetricsReport {
        let history = self.inner.history.lock();
        let samples = history.samples();
        let avg_heap = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.heap.used as f64).sum::<f64>() / samples.len() as f64
        };
        let delays = history.loop_delays();
        MetricsReport {
            latest: history.latest().cloned(),
            samples_retained: samples.len(),
            gc_events_retained: history.gc_events().len(),
            avg_heap_used: avg_heap,
            avg_event_loop_delay_ms: if delays.is_empty() {
                0.0
            } else {
                delays.iter().sum::<f64>() / delays.len() as f64
            },
        }
    }

    pub fn get_leaks(&self) -> Vec<LeakVerdict> {
        self.inner.detector.lock().recent_verdicts()
    }

    // ---- alerting -------------------------------------------------------

    pub fn create_alert(&self, input: AlertInput) -> Result<Option<Alert>> {
        self.inner.alerts.create_alert(input)
    }

    pub fn get_active_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.inner.alerts.active_alerts(filter)
    }

    pub fn get_alert_history(&self, limit: usize) -> Vec<Alert> {
        self.inner.alerts.history(limit)
    }

    pub fn resolve_alert(&self, id: Uuid, resolution: impl Into<String>) -> Result<Alert> {
        self.inner.alerts.resolve_alert(id, resolution)
    }

    pub fn suppress_alert(&self, id: Uuid, duration: Duration) -> Result<()> {
        self.inner.alerts.suppress_alert(id, duration)
    }

    pub fn get_alert_stats(&self) -> AlertStats {
        self.inner.alerts.stats()
    }

    pub fn configure_alerts(&self, config: AlertingConfig) {
        self.inner.config.write().alerting = config;
        let merged = alerting_with_reporting(&self.inner.config.read());
        self.inner.alerts.update_config(merged);
    }

    // ---- hotspots -------------------------------------------------------

    /// Start (or restart) the hotspot sampling task.
    pub fn start_hotspot_analysis(&self, config: Option<HotspotConfig>) -> Result<()> {
        if let Some(config) = config {
            *self.inner.analyzer.lock() = HotspotAnalyzer::new(config.clone());
            self.inner.config.write().hotspots = config;
        }
        let interval = {
            let config = self.inner.config.read();
            Duration::from_millis(config.hotspots.sample_interval_ms.max(100))
        };

        let mut slot = self.inner.hotspot_timer.lock();
        if let Some(previous) = slot.take() {
            previous.stop();
        }
        let agent = self.clone();
        *slot = Some(SafeTimer::spawn("hotspot-analysis", interval, move || {
            let agent = agent.clone();
            async move { agent.hotspot_tick().await }
        }));
        Ok(())
    }

    pub fn stop_hotspot_analysis(&self) {
        if let Some(timer) = self.inner.hotspot_timer.lock().take() {
            timer.stop();
        }
    }

    pub fn get_memory_hotspots(&self, filter: &HotspotFilter) -> Vec<Hotspot> {
        self.inner.analyzer.lock().hotspots(filter)
    }

    pub fn get_memory_map(&self) -> serde_json::Value {
        self.inner.analyzer.lock().memory_map()
    }

    pub fn resolve_hotspot(&self, id: &str, resolution: &str) -> Result<Hotspot> {
        let hotspot = self.inner.analyzer.lock().resolve(id, resolution)?;
        let _ = self.inner.events.send(AgentEvent::HotspotResolved {
            id: id.to_string(),
            resolution: resolution.to_string(),
        });
        Ok(hotspot)
    }

    pub fn get_hotspot_stats(&self) -> HotspotStats {
        self.inner.analyzer.lock().stats()
    }

    // ---- streaming ------------------------------------------------------

    /// Start the stream server; returns its bound address.
    pub async fn start_streaming(
        &self,
        config: Option<StreamingConfig>,
    ) -> Result<SocketAddr> {
        let streaming = match config {
            Some(config) => {
                self.inner.config.write().streaming = config.clone();
                config
            }
            None => self.inner.config.read().streaming.clone(),
        };

        let mut slot = self.inner.stream.lock().await;
        if slot.is_some() {
            return Err(Error::State("streaming is already running".into()));
        }
        let auth = self.inner.stream_auth.read().clone();
        let server = StreamServer::start(
            streaming,
            self.inner.hub.clone(),
            auth,
            self.inner.events.clone(),
        )
        .await?;
        let addr = server.local_addr();
        *slot = Some(server);
        Ok(addr)
    }

    pub async fn stop_streaming(&self) {
        if let Some(server) = self.inner.stream.lock().await.take() {
            server.stop();
        }
    }

    pub fn get_streaming_stats(&self) -> HubStats {
        self.inner.hub.stats()
    }

    /// Publish an arbitrary payload to stream subscribers.
    pub fn broadcast_to_stream(
        &self,
        data: serde_json::Value,
        channel: &str,
    ) -> StreamEvent {
        self.inner.hub.broadcast(data, channel)
    }

    // ---- performance ----------------------------------------------------

    pub fn get_performance_metrics(&self) -> PerformanceReport {
        PerformanceReport {
            interval_ms: self.inner.optimizer.current_interval().as_millis() as u64,
            sampling_rate: self.inner.optimizer.current_rate(),
            overhead_efficiency: self.inner.optimizer.overhead_efficiency(),
            queue: self.inner.queue.stats(),
            cache: self.inner.cache.stats(),
        }
    }

    /// Run one optimization pass immediately.
    pub fn optimize_performance(&self) {
        let snapshot = *self.inner.resources.lock();
        self.inner.optimizer.optimize(snapshot);
    }

    /// Time `iterations` probe collections and refresh the overhead
    /// estimate.
    pub fn measure_overhead(&self, iterations: u32) -> OverheadReport {
        let probe = self.inner.probe.clone();
        self.inner.optimizer.measure_overhead(iterations, move || {
            let _ = probe.collect();
        })
    }

    pub fn set_cache_value(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        options: PutOptions,
    ) -> Result<()> {
        self.inner.cache.put(key, value, options)
    }

    pub fn get_cache_value(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.cache.get(key)
    }

    /// Run an operation under admission control.
    pub async fn queue_operation<F, Fut, T>(
        &self,
        operation: F,
        options: OperationOptions,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner.queue.queue_operation(operation, options).await
    }

    // ---- internals shared with the supervisor module --------------------

    pub(crate) fn record_error(&self, error: &Error) {
        let record = error.to_record();
        self.inner.errors.lock().push(record.clone());
        self.inner.total_errors.fetch_add(1, Ordering::SeqCst);

        let (exit_on_unhandled, log_errors, report_errors) = {
            let handling = &self.inner.config.read().error_handling;
            (
                handling.exit_on_unhandled,
                handling.log_errors,
                handling.report_errors,
            )
        };
        if log_errors {
            tracing::error!(code = record.code, "{}", record.message);
        }
        if !report_errors {
            return;
        }
        if error.is_critical() {
            let _ = self.inner.events.send(AgentEvent::CriticalError(record));
            if exit_on_unhandled {
                let agent = self.clone();
                tokio::spawn(async move {
                    let timeout = Duration::from_millis(
                        agent
                            .inner
                            .config
                            .read()
                            .error_handling
                            .graceful_shutdown_timeout_ms,
                    );
                    let _ = agent.graceful_shutdown(timeout).await;
                });
            }
        } else {
            let _ = self.inner.events.send(AgentEvent::Error(record));
        }
    }

    pub(crate) fn build_health_report(&self) -> HealthReport {
        let uptime = (*self.inner.started_at.lock())
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        let total_errors = self.inner.total_errors.load(Ordering::SeqCst);
        let threshold = self.inner.config.read().error_handling.error_threshold;

        let mut subsystems = std::collections::HashMap::new();
        subsystems.insert(
            "detector".to_string(),
            if self.inner.detector.lock().is_baseline_established() {
                "detecting".to_string()
            } else {
                "baselining".to_string()
            },
        );
        subsystems.insert(
            "hotspots".to_string(),
            format!("{} active", self.inner.analyzer.lock().stats().active),
        );
        subsystems.insert(
            "streaming".to_string(),
            format!("{} subscribers", self.inner.hub.subscriber_count()),
        );
        subsystems.insert(
            "alerts".to_string(),
            format!("{} active", self.inner.alerts.stats().active),
        );

        let mut breakers = std::collections::HashMap::new();
        for breaker in [
            &self.inner.breakers.sampler,
            &self.inner.breakers.hotspots,
            &self.inner.breakers.optimizer,
        ] {
            breakers.insert(
                breaker.name().to_string(),
                breaker.state().as_str().to_string(),
            );
        }

        HealthReport {
            timestamp: Utc::now(),
            uptime_secs: uptime,
            running: self.inner.running.load(Ordering::SeqCst),
            subsystems,
            breakers,
            total_errors,
            error_alarm: total_errors > threshold,
        }
    }
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything
/// else replaces.
fn deep_merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(
                    base_map.entry(key).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (slot, value) => *slot = value,
    }
}
