//! Alert normalization and admission
//!
//! Signals from the detector, the hotspot analyzer, and host code are
//! normalized into [`Alert`]s, then pushed through the admission pipeline
//! in order: suppression rules, fingerprint dedup, sliding-window
//! throttling. Admitted alerts are routed to the configured channels,
//! optionally escalated on a schedule, and retained in a bounded history.

use crate::sinks::{AlertSink, ConsoleSink, EmailSink, FileSink, WebhookSink};
use chrono::Utc;
use heapwatch_common::config::{
    AlertingConfig, ChannelConfig, ChannelKind, SuppressionRule,
};
use heapwatch_common::{
    AgentEvent, Alert, AlertLevel, AlertMetrics, Error, MetricRing, Result, RetryConfig,
    RetryManager,
};
use parking_lot::{Mutex, RwLock};
use regex::RegexBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Alerts retained in the history ring.
const HISTORY_CAPACITY: usize = 200;

/// Input to [`AlertManager::create_alert`]; unset fields take defaults.
#[derive(Debug, Clone)]
pub struct AlertInput {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub source: String,
    pub category: String,
    pub tags: Vec<String>,
    pub metrics: Option<AlertMetrics>,
    pub recommendations: Vec<String>,
}

impl Default for AlertInput {
    fn default() -> Self {
        Self {
            level: AlertLevel::Warning,
            title: String::new(),
            message: String::new(),
            source: "heapwatch".into(),
            category: "memory".into(),
            tags: Vec::new(),
            metrics: None,
            recommendations: Vec::new(),
        }
    }
}

/// Stable dedup key over the identifying dimensions of an alert.
///
/// FNV-1a over `level|source|category|title`; identical inputs hash the
/// same in every process, which the dedup contract depends on.
pub fn fingerprint(level: AlertLevel, source: &str, category: &str, title: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for part in [level.as_str(), source, category, title] {
        for byte in part.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash ^= b'|' as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{:016x}", hash)
}

/// `level priority * (1 + pressure bonuses)`.
pub fn compute_severity(level: AlertLevel, metrics: Option<&AlertMetrics>) -> u32 {
    let mut bonuses = 0u32;
    if let Some(m) = metrics {
        if m.heap_limit > 0 {
            let ratio = m.heap_used as f64 / m.heap_limit as f64;
            bonuses += if ratio > 0.95 {
                3
            } else if ratio > 0.85 {
                2
            } else if ratio > 0.70 {
                1
            } else {
                0
            };
        }
        if m.gc_frequency.is_some_and(|f| f > 10.0) {
            bonuses += 1;
        }
        // Growth above 10 MiB/minute.
        if m.growth_rate.is_some_and(|g| g > 10.0 * 1024.0 * 1024.0) {
            bonuses += 1;
        }
    }
    level.priority() * (1 + bonuses)
}

fn enhance_message(message: &str, metrics: &AlertMetrics, recommendations: &[String]) -> String {
    let mut parts = vec![message.to_string()];
    if metrics.heap_limit > 0 {
        parts.push(format!(
            "heap at {:.1}% of limit ({:.1} MiB / {:.1} MiB)",
            metrics.heap_used as f64 / metrics.heap_limit as f64 * 100.0,
            metrics.heap_used as f64 / (1024.0 * 1024.0),
            metrics.heap_limit as f64 / (1024.0 * 1024.0),
        ));
    }
    if let Some(growth) = metrics.growth_rate {
        parts.push(format!(
            "growing {:.1} MiB/min",
            growth / (1024.0 * 1024.0)
        ));
    }
    if let Some(freq) = metrics.gc_frequency {
        parts.push(format!("{:.1} collections/min", freq));
    }
    if !recommendations.is_empty() {
        parts.push(format!("recommended: {}", recommendations.join("; ")));
    }
    parts.join(" | ")
}

fn parse_level(value: &str) -> Option<AlertLevel> {
    match value.to_ascii_lowercase().as_str() {
        "info" => Some(AlertLevel::Info),
        "warning" | "warn" => Some(AlertLevel::Warning),
        "error" => Some(AlertLevel::Error),
        "critical" => Some(AlertLevel::Critical),
        _ => None,
    }
}

struct CompiledRule {
    rule: SuppressionRule,
    pattern: Option<regex::Regex>,
}

impl CompiledRule {
    fn compile(rule: &SuppressionRule) -> Self {
        let pattern = rule.pattern.as_deref().and_then(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| warn!(pattern = p, error = %e, "invalid suppression pattern"))
                .ok()
        });
        Self {
            rule: rule.clone(),
            pattern,
        }
    }

    /// All present fields must match.
    fn matches(&self, alert: &Alert) -> bool {
        if let Some(level) = &self.rule.level {
            if parse_level(level) != Some(alert.level) {
                return false;
            }
        }
        if let Some(source) = &self.rule.source {
            if source != &alert.source {
                return false;
            }
        }
        if let Some(category) = &self.rule.category {
            if category != &alert.category {
                return false;
            }
        }
        if let Some(tags) = &self.rule.tags {
            if !tags.iter().all(|t| alert.tags.contains(t)) {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&alert.message) {
                return false;
            }
        }
        true
    }
}

struct ThrottleCounter {
    window_start: Instant,
    count: u32,
}

/// Aggregate counters for the query surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct AlertStats {
    pub created: u64,
    /// Drops from any admission stage.
    pub suppressed: u64,
    pub deduplicated: u64,
    pub throttled: u64,
    pub rule_suppressed: u64,
    pub escalated: u64,
    pub resolved: u64,
    pub active: usize,
}

/// Filter for [`AlertManager::active_alerts`].
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub level: Option<AlertLevel>,
    pub source: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
}

struct ManagerState {
    active: HashMap<Uuid, Alert>,
    history: MetricRing<Alert>,
    /// fingerprint -> last admission time.
    fingerprints: HashMap<String, Instant>,
    throttle: HashMap<String, ThrottleCounter>,
    /// Silenced alert ids and their expiry.
    silenced: HashMap<Uuid, Instant>,
    escalation_timers: HashMap<Uuid, JoinHandle<()>>,
    silence_timers: HashMap<Uuid, JoinHandle<()>>,
    stats: AlertStats,
}

struct ManagerInner {
    config: RwLock<AlertingConfig>,
    rules: RwLock<Vec<CompiledRule>>,
    channels: RwLock<Vec<(ChannelConfig, Arc<dyn AlertSink>)>>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<AgentEvent>,
    retry: RetryManager,
}

/// The alert manager. Clone-cheap handle over shared state.
#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<ManagerInner>,
}

fn build_channels(config: &AlertingConfig) -> Vec<(ChannelConfig, Arc<dyn AlertSink>)> {
    config
        .channels
        .iter()
        .filter_map(|channel| {
            let sink: Arc<dyn AlertSink> = match channel.kind {
                ChannelKind::Console => Arc::new(ConsoleSink),
                ChannelKind::File => match &channel.target {
                    Some(path) => Arc::new(FileSink::new(path.clone())),
                    None => {
                        warn!(channel = %channel.name, "file channel without target, skipped");
                        return None;
                    }
                },
                ChannelKind::Webhook => match &channel.target {
                    Some(url) => Arc::new(WebhookSink::new(url.clone())),
                    None => {
                        warn!(channel = %channel.name, "webhook channel without target, skipped");
                        return None;
                    }
                },
                ChannelKind::Email => match &channel.target {
                    Some(address) => Arc::new(EmailSink::new(address.clone())),
                    None => {
                        warn!(channel = %channel.name, "email channel without target, skipped");
                        return None;
                    }
                },
            };
            Some((channel.clone(), sink))
        })
        .collect()
}

impl AlertManager {
    pub fn new(config: AlertingConfig, events: broadcast::Sender<AgentEvent>) -> Self {
        let rules = config.suppression.rules.iter().map(CompiledRule::compile).collect();
        let channels = build_channels(&config);
        Self {
            inner: Arc::new(ManagerInner {
                config: RwLock::new(config),
                rules: RwLock::new(rules),
                channels: RwLock::new(channels),
                state: Mutex::new(ManagerState {
                    active: HashMap::new(),
                    history: MetricRing::new(HISTORY_CAPACITY),
                    fingerprints: HashMap::new(),
                    throttle: HashMap::new(),
                    silenced: HashMap::new(),
                    escalation_timers: HashMap::new(),
                    silence_timers: HashMap::new(),
                    stats: AlertStats::default(),
                }),
                events,
                retry: RetryManager::new(RetryConfig {
                    max_retries: 2,
                    base_delay: Duration::from_millis(250),
                    max_delay: Duration::from_secs(5),
                    backoff_factor: 2.0,
                    retryable_codes: vec!["reporting".into()],
                }),
            }),
        }
    }

    /// Replace the configuration; rules and channels are recompiled.
    pub fn update_config(&self, config: AlertingConfig) {
        *self.inner.rules.write() =
            config.suppression.rules.iter().map(CompiledRule::compile).collect();
        *self.inner.channels.write() = build_channels(&config);
        *self.inner.config.write() = config;
    }

    /// Normalize and admit one alert.
    ///
    /// Returns `Ok(None)` when the alert was dropped by a pipeline stage
    /// or alerting is disabled.
    pub fn create_alert(&self, input: AlertInput) -> Result<Option<Alert>> {
        let config = self.inner.config.read();
        if !config.enabled {
            return Ok(None);
        }
        if input.title.is_empty() {
            return Err(Error::Configuration("alert title must not be empty".into()));
        }

        let now = Utc::now();
        let enhanced_message = input
            .metrics
            .as_ref()
            .map(|m| enhance_message(&input.message, m, &input.recommendations));
        let mut alert = Alert {
            id: Uuid::new_v4(),
            fingerprint: fingerprint(input.level, &input.source, &input.category, &input.title),
            level: input.level,
            title: input.title,
            message: input.message,
            enhanced_message,
            source: input.source,
            category: input.category,
            tags: input.tags,
            severity: compute_severity(input.level, input.metrics.as_ref()),
            metrics: input.metrics,
            recommendations: input.recommendations,
            created_at: now,
            updated_at: now,
            resolved: false,
            resolved_at: None,
            escalated: false,
            escalation_count: 0,
        };

        // Stage 1: suppression rules.
        if config.suppression.enabled {
            let rules = self.inner.rules.read();
            if let Some(rule) = rules.iter().find(|r| r.matches(&alert)) {
                debug!(title = %alert.title, rule = ?rule.rule, "alert suppressed by rule");
                let mut state = self.inner.state.lock();
                state.stats.suppressed += 1;
                state.stats.rule_suppressed += 1;
                return Ok(None);
            }
        }

        let mut state = self.inner.state.lock();

        // Stage 2: smart dedup over the sliding duplicate window.
        if config.smart_filtering.enabled {
            let window = Duration::from_millis(config.smart_filtering.duplicate_window_ms);
            let now_mono = Instant::now();
            state
                .fingerprints
                .retain(|_, seen| now_mono.duration_since(*seen) <= window);
            if state.fingerprints.contains_key(&alert.fingerprint) {
                debug!(fingerprint = %alert.fingerprint, "duplicate alert dropped");
                state.stats.suppressed += 1;
                state.stats.deduplicated += 1;
                return Ok(None);
            }
            state.fingerprints.insert(alert.fingerprint.clone(), now_mono);
        }

        // Stage 3: sliding-window throttling per (level, source, category).
        if config.throttling.enabled {
            let key = format!(
                "{}|{}|{}",
                alert.level.as_str(),
                alert.source,
                alert.category
            );
            let window = Duration::from_millis(config.throttling.window_ms);
            let max = config.throttling.max_alerts_per_window;
            let counter = state
                .throttle
                .entry(key)
                .or_insert_with(|| ThrottleCounter {
                    window_start: Instant::now(),
                    count: 0,
                });
            if counter.window_start.elapsed() >= window {
                counter.window_start = Instant::now();
                counter.count = 0;
            }
            if counter.count >= max {
                state.stats.suppressed += 1;
                state.stats.throttled += 1;
                let fingerprint = alert.fingerprint.clone();
                drop(state);
                drop(config);
                let _ = self
                    .inner
                    .events
                    .send(AgentEvent::AlertThrottled { fingerprint });
                return Ok(None);
            }
            counter.count += 1;
        }

        // Admitted.
        alert.updated_at = Utc::now();
        state.active.insert(alert.id, alert.clone());
        state.history.push(alert.clone());
        state.stats.created += 1;

        let escalation_due =
            config.escalation.enabled && alert.level != AlertLevel::Info;
        drop(state);
        drop(config);

        info!(id = %alert.id, level = alert.level.as_str(), title = %alert.title, "alert created");
        let _ = self.inner.events.send(AgentEvent::AlertCreated(alert.clone()));
        self.dispatch(alert.clone(), false);
        if escalation_due {
            self.schedule_escalation(alert.id, alert.level);
        }

        Ok(Some(alert))
    }

    /// Route one alert to every channel whose level bound and filters
    /// accept it. Delivery is fire-and-forget per channel; failures are
    /// reported as `notification-error` events.
    fn dispatch(&self, alert: Alert, escalated: bool) {
        let channels = self.inner.channels.read();
        for (channel, sink) in channels.iter() {
            if let Some(min) = channel.min_level.as_deref().and_then(parse_level) {
                if alert.level.priority() < min.priority() {
                    continue;
                }
            }
            let filters = &channel.filters;
            if let Some(sources) = &filters.sources {
                if !sources.contains(&alert.source) {
                    continue;
                }
            }
            if let Some(categories) = &filters.categories {
                if !categories.contains(&alert.category) {
                    continue;
                }
            }
            if let Some(tags) = &filters.tags {
                if !tags.iter().any(|t| alert.tags.contains(t)) {
                    continue;
                }
            }

            let sink = sink.clone();
            let channel_name = channel.name.clone();
            let alert = alert.clone();
            let events = self.inner.events.clone();
            let retry = self.inner.retry.clone();
            let needs_retry = !matches!(channel.kind, ChannelKind::Console | ChannelKind::Email);
            tokio::spawn(async move {
                let result = if needs_retry {
                    retry
                        .execute(&channel_name, || sink.deliver(&alert, escalated))
                        .await
                } else {
                    sink.deliver(&alert, escalated).await
                };
                if let Err(e) = result {
                    warn!(channel = %channel_name, error = %e, "alert delivery failed");
                    let _ = events.send(AgentEvent::NotificationError {
                        channel: channel_name,
                        error: e.to_string(),
                    });
                }
            });
        }
    }

    fn escalation_timeout(&self, level: AlertLevel) -> Option<Duration> {
        let config = self.inner.config.read();
        let timeouts = &config.escalation.timeouts;
        let ms = match level {
            AlertLevel::Info => return None,
            AlertLevel::Warning => timeouts.warning,
            AlertLevel::Error => timeouts.error,
            AlertLevel::Critical => timeouts.critical,
        };
        Some(Duration::from_millis(ms))
    }

    /// Arm the one-shot escalation timer for an active alert. Any
    /// previously armed timer for the same alert is replaced, keeping at
    /// most one pending escalation per alert.
    fn schedule_escalation(&self, id: Uuid, level: AlertLevel) {
        let Some(timeout) = self.escalation_timeout(level) else {
            return;
        };
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.fire_escalation(id);
        });
        let mut state = self.inner.state.lock();
        if let Some(previous) = state.escalation_timers.insert(id, handle) {
            previous.abort();
        }
    }

    fn fire_escalation(&self, id: Uuid) {
        let max_escalations = self.inner.config.read().escalation.max_escalations;
        let mut state = self.inner.state.lock();
        state.escalation_timers.remove(&id);

        // Silenced alerts keep their level until the silence lifts.
        if state.silenced.contains_key(&id) {
            return;
        }
        let Some(alert) = state.active.get_mut(&id) else {
            return;
        };

        if alert.escalation_count >= max_escalations {
            drop(state);
            info!(id = %id, "alert reached maximum escalations");
            let _ = self.inner.events.send(AgentEvent::AlertMaxEscalation { id });
            return;
        }

        alert.level = alert.level.escalated();
        alert.severity = compute_severity(alert.level, alert.metrics.as_ref());
        alert.escalated = true;
        alert.escalation_count += 1;
        alert.updated_at = Utc::now();
        let snapshot = alert.clone();
        state.stats.escalated += 1;
        drop(state);

        warn!(id = %id, level = snapshot.level.as_str(), "alert escalated");
        let _ = self
            .inner
            .events
            .send(AgentEvent::AlertEscalated(snapshot.clone()));
        self.dispatch(snapshot.clone(), true);
        self.schedule_escalation(id, snapshot.level);
    }

    /// Mark an alert resolved, cancel its pending escalation, and drop it
    /// from the active map.
    pub fn resolve_alert(&self, id: Uuid, resolution: impl Into<String>) -> Result<Alert> {
        let resolution = resolution.into();
        let mut state = self.inner.state.lock();
        let mut alert = state
            .active
            .remove(&id)
            .ok_or_else(|| Error::State(format!("unknown alert id '{}'", id)))?;
        if let Some(timer) = state.escalation_timers.remove(&id) {
            timer.abort();
        }
        if let Some(timer) = state.silence_timers.remove(&id) {
            timer.abort();
        }
        state.silenced.remove(&id);
        let now = Utc::now();
        alert.resolved = true;
        alert.resolved_at = Some(now);
        alert.updated_at = now;
        state.stats.resolved += 1;
        drop(state);

        info!(id = %id, resolution = %resolution, "alert resolved");
        let _ = self
            .inner
            .events
            .send(AgentEvent::AlertResolved { id, resolution });
        Ok(alert)
    }

    /// Silence a specific alert for up to the configured maximum
    /// duration. The silence auto-clears when it expires.
    pub fn suppress_alert(&self, id: Uuid, duration: Duration) -> Result<()> {
        let config = self.inner.config.read();
        if !config.suppression.enabled {
            return Err(Error::State("suppression is disabled".into()));
        }
        let max = Duration::from_millis(config.suppression.max_duration_ms);
        drop(config);
        let effective = duration.min(max);

        let mut state = self.inner.state.lock();
        if !state.active.contains_key(&id) {
            return Err(Error::State(format!("unknown alert id '{}'", id)));
        }
        let until_instant = Instant::now() + effective;
        state.silenced.insert(id, until_instant);

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(effective).await;
            let mut state = manager.inner.state.lock();
            state.silenced.remove(&id);
            state.silence_timers.remove(&id);
        });
        if let Some(previous) = state.silence_timers.insert(id, handle) {
            previous.abort();
        }
        drop(state);

        let until = Utc::now() + chrono::TimeDelta::milliseconds(effective.as_millis() as i64);
        let _ = self
            .inner
            .events
            .send(AgentEvent::AlertSuppressed { id, until });
        Ok(())
    }

    /// Active alerts matching the filter, highest severity first.
    pub fn active_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let state = self.inner.state.lock();
        let mut alerts: Vec<Alert> = state
            .active
            .values()
            .filter(|a| filter.level.map_or(true, |l| a.level == l))
            .filter(|a| filter.source.as_deref().map_or(true, |s| a.source == s))
            .filter(|a| filter.category.as_deref().map_or(true, |c| a.category == c))
            .filter(|a| {
                filter
                    .tags
                    .as_ref()
                    .map_or(true, |tags| tags.iter().any(|t| a.tags.contains(t)))
            })
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.created_at.cmp(&a.created_at)));
        alerts
    }

    /// The most recent `limit` alerts, newest first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let state = self.inner.state.lock();
        let mut recent: Vec<Alert> = state.history.tail(limit).cloned().collect();
        recent.reverse();
        recent
    }

    pub fn stats(&self) -> AlertStats {
        let state = self.inner.state.lock();
        AlertStats {
            active: state.active.len(),
            ..state.stats
        }
    }

    /// Cancel every pending timer and clear transient state. Active
    /// alerts and history survive for post-mortem queries.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        for (_, timer) in state.escalation_timers.drain() {
            timer.abort();
        }
        for (_, timer) in state.silence_timers.drain() {
            timer.abort();
        }
        state.silenced.clear();
        debug!("alert manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapwatch_common::config::{
        AlertThrottlingConfig, EscalationConfig, EscalationTimeouts, SmartFilteringConfig,
        SuppressionConfig,
    };
    use tokio::time::sleep;

    fn test_config() -> AlertingConfig {
        AlertingConfig {
            enabled: true,
            throttling: AlertThrottlingConfig {
                enabled: true,
                window_ms: 60_000,
                max_alerts_per_window: 100,
                batch_similar: false,
            },
            escalation: EscalationConfig {
                enabled: false,
                timeouts: EscalationTimeouts {
                    warning: 100,
                    error: 100,
                    critical: 100,
                },
                max_escalations: 2,
            },
            suppression: SuppressionConfig {
                enabled: true,
                max_duration_ms: 3_600_000,
                rules: Vec::new(),
            },
            channels: Vec::new(),
            smart_filtering: SmartFilteringConfig {
                enabled: true,
                duplicate_window_ms: 5_000,
                similarity_threshold: 0.85,
            },
        }
    }

    fn manager(config: AlertingConfig) -> (AlertManager, broadcast::Receiver<AgentEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (AlertManager::new(config, tx), rx)
    }

    fn input(level: AlertLevel, source: &str, category: &str, title: &str) -> AlertInput {
        AlertInput {
            level,
            title: title.into(),
            message: format!("{} happened", title),
            source: source.into(),
            category: category.into(),
            ..Default::default()
        }
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let a = fingerprint(AlertLevel::Warning, "s", "c", "t");
        let b = fingerprint(AlertLevel::Warning, "s", "c", "t");
        assert_eq!(a, b);

        assert_ne!(a, fingerprint(AlertLevel::Error, "s", "c", "t"));
        assert_ne!(a, fingerprint(AlertLevel::Warning, "x", "c", "t"));
        assert_ne!(a, fingerprint(AlertLevel::Warning, "s", "x", "t"));
        assert_ne!(a, fingerprint(AlertLevel::Warning, "s", "c", "x"));
        // Field boundaries matter: ("ab","c") != ("a","bc").
        assert_ne!(
            fingerprint(AlertLevel::Warning, "ab", "c", "t"),
            fingerprint(AlertLevel::Warning, "a", "bc", "t")
        );
    }

    #[test]
    fn severity_combines_level_and_pressure() {
        assert_eq!(compute_severity(AlertLevel::Warning, None), 2);

        let metrics = AlertMetrics {
            heap_used: 96,
            heap_total: 100,
            heap_limit: 100,
            growth_rate: Some(20.0 * 1024.0 * 1024.0),
            gc_frequency: Some(15.0),
        };
        // priority 2 * (1 + 3 + 1 + 1) = 12
        assert_eq!(compute_severity(AlertLevel::Warning, Some(&metrics)), 12);
    }

    #[tokio::test]
    async fn duplicate_within_window_is_suppressed() {
        let (manager, _rx) = manager(test_config());

        let first = manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "t"))
            .unwrap();
        assert!(first.is_some());

        let second = manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "t"))
            .unwrap();
        assert!(second.is_none());

        let stats = manager.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn duplicate_window_slides() {
        let mut config = test_config();
        config.smart_filtering.duplicate_window_ms = 30;
        let (manager, _rx) = manager(config);

        assert!(manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "t"))
            .unwrap()
            .is_some());
        sleep(Duration::from_millis(50)).await;
        assert!(manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "t"))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn throttle_caps_per_key_and_resets() {
        let mut config = test_config();
        config.smart_filtering.enabled = false;
        config.throttling.max_alerts_per_window = 2;
        config.throttling.window_ms = 50;
        let (manager, _rx) = manager(config);

        for i in 0..4 {
            let created = manager
                .create_alert(input(
                    AlertLevel::Warning,
                    "s",
                    "c",
                    &format!("t{}", i),
                ))
                .unwrap();
            assert_eq!(created.is_some(), i < 2, "alert {} admission", i);
        }
        // A different key is unaffected.
        assert!(manager
            .create_alert(input(AlertLevel::Error, "s", "c", "other"))
            .unwrap()
            .is_some());

        // Counters reset across windows.
        sleep(Duration::from_millis(60)).await;
        assert!(manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "t9"))
            .unwrap()
            .is_some());
        assert_eq!(manager.stats().throttled, 2);
    }

    #[tokio::test]
    async fn suppression_rules_match_conjunctively() {
        let mut config = test_config();
        config.suppression.rules = vec![SuppressionRule {
            source: Some("noisy".into()),
            pattern: Some("expected.*churn".into()),
            ..Default::default()
        }];
        let (manager, _rx) = manager(config);

        // Source matches but pattern does not: admitted.
        let mut a = input(AlertLevel::Warning, "noisy", "c", "t1");
        a.message = "something else".into();
        assert!(manager.create_alert(a).unwrap().is_some());

        // Both fields match (case-insensitively): dropped.
        let mut b = input(AlertLevel::Warning, "noisy", "c", "t2");
        b.message = "EXPECTED allocation CHURN".into();
        assert!(manager.create_alert(b).unwrap().is_none());
        assert_eq!(manager.stats().rule_suppressed, 1);
    }

    #[tokio::test]
    async fn escalation_walks_levels_and_stops_at_the_cap() {
        let mut config = test_config();
        config.escalation.enabled = true;
        config.smart_filtering.enabled = false;
        let (manager, mut rx) = manager(config);

        let alert = manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "escalating"))
            .unwrap()
            .unwrap();

        // First escalation: warning -> error.
        sleep(Duration::from_millis(150)).await;
        let current = manager.active_alerts(&AlertFilter::default());
        assert_eq!(current[0].level, AlertLevel::Error);
        assert_eq!(current[0].escalation_count, 1);

        // Second escalation: error -> critical, then the cap stops it.
        sleep(Duration::from_millis(120)).await;
        let current = manager.active_alerts(&AlertFilter::default());
        assert_eq!(current[0].level, AlertLevel::Critical);
        assert_eq!(current[0].escalation_count, 2);

        sleep(Duration::from_millis(120)).await;
        let current = manager.active_alerts(&AlertFilter::default());
        assert_eq!(current[0].level, AlertLevel::Critical);
        assert_eq!(current[0].escalation_count, 2);

        let mut saw_escalated = 0;
        let mut saw_max = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::AlertEscalated(a) => {
                    assert_eq!(a.id, alert.id);
                    saw_escalated += 1;
                }
                AgentEvent::AlertMaxEscalation { id } => {
                    assert_eq!(id, alert.id);
                    saw_max = true;
                }
                _ => {}
            }
        }
        assert_eq!(saw_escalated, 2);
        assert!(saw_max);

        // Still active until resolved.
        assert_eq!(manager.stats().active, 1);
    }

    #[tokio::test]
    async fn resolve_cancels_pending_escalation() {
        let mut config = test_config();
        config.escalation.enabled = true;
        let (manager, _rx) = manager(config);

        let alert = manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "short-lived"))
            .unwrap()
            .unwrap();
        let resolved = manager.resolve_alert(alert.id, "handled").unwrap();
        assert!(resolved.resolved);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.stats().escalated, 0);
        assert_eq!(manager.stats().active, 0);
        assert_eq!(manager.stats().resolved, 1);
    }

    #[tokio::test]
    async fn silenced_alert_skips_escalation_until_expiry() {
        let mut config = test_config();
        config.escalation.enabled = true;
        let (manager, _rx) = manager(config);

        let alert = manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "quiet"))
            .unwrap()
            .unwrap();
        manager
            .suppress_alert(alert.id, Duration::from_millis(500))
            .unwrap();

        sleep(Duration::from_millis(150)).await;
        let current = manager.active_alerts(&AlertFilter::default());
        assert_eq!(current[0].level, AlertLevel::Warning);
        assert_eq!(current[0].escalation_count, 0);
    }

    #[tokio::test]
    async fn suppress_duration_is_bounded() {
        let mut config = test_config();
        config.suppression.max_duration_ms = 40;
        config.escalation.enabled = true;
        let (manager, mut rx) = manager(config);

        let alert = manager
            .create_alert(input(AlertLevel::Warning, "s", "c", "capped"))
            .unwrap()
            .unwrap();
        manager
            .suppress_alert(alert.id, Duration::from_secs(3600))
            .unwrap();

        let mut until = None;
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::AlertSuppressed { until: u, .. } = event {
                until = Some(u);
            }
        }
        let until = until.expect("suppression event");
        assert!(until <= Utc::now() + chrono::TimeDelta::milliseconds(100));
    }

    #[tokio::test]
    async fn query_surface_filters_and_sorts() {
        let mut config = test_config();
        config.smart_filtering.enabled = false;
        let (manager, _rx) = manager(config);

        let mut critical = input(AlertLevel::Critical, "db", "memory", "big");
        critical.tags = vec!["prod".into()];
        manager.create_alert(critical).unwrap();
        manager
            .create_alert(input(AlertLevel::Info, "web", "memory", "small"))
            .unwrap();

        let all = manager.active_alerts(&AlertFilter::default());
        assert_eq!(all.len(), 2);
        assert!(all[0].severity >= all[1].severity);

        let by_source = manager.active_alerts(&AlertFilter {
            source: Some("db".into()),
            ..Default::default()
        });
        assert_eq!(by_source.len(), 1);
        assert_eq!(by_source[0].title, "big");

        let by_tag = manager.active_alerts(&AlertFilter {
            tags: Some(vec!["prod".into()]),
            ..Default::default()
        });
        assert_eq!(by_tag.len(), 1);

        let history = manager.history(1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].title, "small");
    }

    #[tokio::test]
    async fn disabled_manager_drops_everything() {
        let mut config = test_config();
        config.enabled = false;
        let (manager, _rx) = manager(config);
        assert!(manager
            .create_alert(input(AlertLevel::Critical, "s", "c", "t"))
            .unwrap()
            .is_none());
        assert_eq!(manager.stats().created, 0);
    }
}
