//! Background tasks and recovery
//!
//! The supervisor side of the agent: the adaptive sampler loop, the
//! fixed-cadence optimizer / resource-monitor / heartbeat / cache-janitor
//! tasks, the event router that bridges alerts onto the stream, and the
//! typed-error recovery handlers.

use crate::agent::HeapwatchAgent;
use heapwatch_common::{
    AgentEvent, AlertLevel, AlertMetrics, Error, Result, RetryConfig, RetryManager, SafeTimer,
    Severity,
};
use heapwatch_detect::{HotspotEvent, Observation, VerdictKind};
use heapwatch_perf::ResourceSnapshot;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fixed cadences from the concurrency model.
const OPTIMIZER_PERIOD: Duration = Duration::from_secs(10);
const MONITOR_PERIOD: Duration = Duration::from_secs(5);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
const JANITOR_PERIOD: Duration = Duration::from_secs(60);
/// Wait before attempting a subsystem recovery.
const RECOVERY_BACKOFF: Duration = Duration::from_secs(5);

impl HeapwatchAgent {
    /// The sampler task: collect, record, classify, fan out. The sleep
    /// re-reads the optimizer's interval every cycle so adaptive changes
    /// take effect on the next tick.
    pub(crate) fn spawn_sampler(&self, mut shutdown: watch::Receiver<bool>) {
        let agent = self.clone();
        let handle = tokio::spawn(async move {
            // Fractional sampling-rate credits; a full tick runs when a
            // whole credit has accumulated.
            let mut credits = 0.0f64;
            loop {
                let interval = agent.inner.optimizer.current_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }

                credits += agent.inner.optimizer.current_rate();
                let full = credits >= 1.0;
                if full {
                    credits -= 1.0;
                }

                let breaker = agent.inner.breakers.sampler.clone();
                let tick_agent = agent.clone();
                let result = breaker
                    .execute(|| async move { tick_agent.sampler_tick(full).await })
                    .await;
                match result {
                    Ok(()) => {}
                    Err(Error::State(_)) => {
                        debug!("sampler breaker open, skipping tick");
                    }
                    Err(e) => agent.record_error(&e),
                }
            }
            debug!("sampler task stopped");
        });
        *self.inner.sampler_handle.lock() = Some(handle);
    }

    /// One sampler cycle. `full` ticks run the optional work (stream
    /// broadcast of the whole sample); reduced ticks keep the detector
    /// fed without it.
    pub(crate) async fn sampler_tick(&self, full: bool) -> Result<()> {
        let sample = self.inner.probe.collect();
        self.inner.history.lock().push(&sample);
        *self.inner.resources.lock() = ResourceSnapshot::from_sample(&sample);

        let detection_enabled = self.inner.config.read().detection.enabled;
        let observation = if detection_enabled {
            self.inner.detector.lock().observe(&sample)
        } else {
            Observation::default()
        };

        if observation.invariant_violation {
            self.record_error(&Error::Monitoring(
                "sample violates heap ordering invariant".into(),
            ));
        }
        if let Some(baseline) = observation.baseline_established {
            let _ = self
                .inner
                .events
                .send(AgentEvent::BaselineEstablished(baseline));
        }

        let _ = self
            .inner
            .events
            .send(AgentEvent::Metrics(Box::new(sample.clone())));
        if full {
            self.inner.hub.broadcast(
                serde_json::json!({
                    "type": "metrics",
                    "heapUsed": sample.heap.used,
                    "heapLimit": sample.heap.limit,
                    "eventLoopDelayMs": sample.event_loop_delay_ms,
                    "sample": sample,
                }),
                "metrics",
            );
        }

        if let Some((kind, verdict)) = observation.verdict {
            let event = match kind {
                VerdictKind::Leak => AgentEvent::Leak(verdict.clone()),
                VerdictKind::Warning => AgentEvent::Warning(verdict.clone()),
            };
            let _ = self.inner.events.send(event);
            self.inner.hub.broadcast(
                serde_json::json!({
                    "type": match kind {
                        VerdictKind::Leak => "leak",
                        VerdictKind::Warning => "warning",
                    },
                    "severity": (verdict.probability * 10.0).round(),
                    "probability": verdict.probability,
                    "factors": verdict.factors,
                }),
                "leaks",
            );

            let level = match kind {
                VerdictKind::Leak if verdict.probability >= 0.8 => AlertLevel::Critical,
                VerdictKind::Leak => AlertLevel::Error,
                VerdictKind::Warning => AlertLevel::Warning,
            };
            let input = heapwatch_alerts::AlertInput {
                level,
                title: match kind {
                    VerdictKind::Leak => "Memory leak suspected".into(),
                    VerdictKind::Warning => "Memory pressure warning".into(),
                },
                message: format!(
                    "leak probability {:.2} from {}",
                    verdict.probability,
                    verdict.factors.join(", ")
                ),
                source: "leak-detector".into(),
                category: "memory".into(),
                tags: vec!["memory".into(), "leak".into()],
                metrics: Some(AlertMetrics {
                    heap_used: verdict.metrics.heap_used,
                    heap_total: verdict.metrics.heap_total,
                    heap_limit: verdict.metrics.heap_limit,
                    growth_rate: None,
                    gc_frequency: None,
                }),
                recommendations: verdict.recommendations.clone(),
            };
            if let Err(e) = self.inner.alerts.create_alert(input) {
                self.record_error(&e);
            }
        }
        Ok(())
    }

    /// One hotspot analysis cycle, run by its own timer.
    pub(crate) async fn hotspot_tick(&self) -> Result<()> {
        let breaker = self.inner.breakers.hotspots.clone();
        let agent = self.clone();
        let result = breaker
            .execute(|| async move {
                let sample = agent.inner.probe.collect();
                let deltas = agent.inner.analyzer.lock().observe(&sample);
                for delta in deltas {
                    match delta {
                        HotspotEvent::Detected(hotspot) => {
                            let _ = agent
                                .inner
                                .events
                                .send(AgentEvent::HotspotDetected(hotspot.clone()));
                            agent.inner.hub.broadcast(
                                serde_json::json!({
                                    "type": "hotspot",
                                    "id": hotspot.id,
                                    "severity": severity_rank(hotspot.severity),
                                    "hotspot": hotspot,
                                }),
                                "default",
                            );
                            let input = heapwatch_alerts::AlertInput {
                                level: match hotspot.severity {
                                    Severity::Critical => AlertLevel::Critical,
                                    Severity::High => AlertLevel::Error,
                                    Severity::Medium => AlertLevel::Warning,
                                    Severity::Low => AlertLevel::Info,
                                },
                                title: format!("Memory hotspot: {}", hotspot.id),
                                message: format!(
                                    "{:?} hotspot observed {} time(s)",
                                    hotspot.kind, hotspot.occurrences
                                ),
                                source: "hotspot-analyzer".into(),
                                category: "memory".into(),
                                tags: vec!["memory".into(), "hotspot".into()],
                                metrics: None,
                                recommendations: hotspot.recommendations.clone(),
                            };
                            if let Err(e) = agent.inner.alerts.create_alert(input) {
                                agent.record_error(&e);
                            }
                        }
                        HotspotEvent::Expired { id } => {
                            let _ = agent.inner.events.send(AgentEvent::HotspotExpired { id });
                        }
                    }
                }
                Ok(())
            })
            .await;
        match result {
            Err(Error::State(_)) => Ok(()),
            other => other,
        }
    }

    /// Fixed-cadence background tasks: optimizer, resource monitor,
    /// health heartbeat, cache janitor. With background processing off
    /// only the health heartbeat runs.
    pub(crate) fn spawn_periodic_tasks(&self) {
        let background = self.inner.config.read().performance.background_processing;
        let mut timers = self.inner.timers.lock();

        let agent = self.clone();
        timers.push(SafeTimer::spawn("heartbeat", HEARTBEAT_PERIOD, move || {
            let agent = agent.clone();
            async move {
                let report = agent.build_health_report();
                if report.error_alarm {
                    warn!(
                        total_errors = report.total_errors,
                        "error count crossed the alarm threshold"
                    );
                }
                let _ = agent.inner.events.send(AgentEvent::HealthCheck(report));
                Ok(())
            }
        }));
        if !background {
            return;
        }

        let agent = self.clone();
        timers.push(SafeTimer::spawn("optimizer", OPTIMIZER_PERIOD, move || {
            let agent = agent.clone();
            async move {
                let snapshot = *agent.inner.resources.lock();
                let (adaptive_interval, adaptive) = {
                    let config = agent.inner.config.read();
                    (
                        config.monitoring.adaptive_interval,
                        config.performance.adaptive,
                    )
                };
                if !adaptive {
                    return Ok(());
                }
                let breaker = agent.inner.breakers.optimizer.clone();
                let optimizer = agent.inner.optimizer.clone();
                let result = breaker
                    .execute(|| async move {
                        if adaptive_interval {
                            optimizer.optimize(snapshot);
                        } else {
                            optimizer.optimize_rate(snapshot);
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    if !matches!(e, Error::State(_)) {
                        agent.record_error(&e);
                    }
                }
                Ok(())
            }
        }));

        let agent = self.clone();
        timers.push(SafeTimer::spawn("resource-monitor", MONITOR_PERIOD, move || {
            let agent = agent.clone();
            async move {
                let sample = agent.inner.probe.collect();
                *agent.inner.resources.lock() = ResourceSnapshot::from_sample(&sample);
                Ok(())
            }
        }));

        let agent = self.clone();
        timers.push(SafeTimer::spawn("cache-janitor", JANITOR_PERIOD, move || {
            let agent = agent.clone();
            async move {
                let purged = agent.inner.cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "cache janitor purged expired entries");
                }
                Ok(())
            }
        }));
    }

    /// Bridges agent events onto the stream's `alerts` channel and runs
    /// the typed-error recovery handlers.
    pub(crate) fn spawn_event_router(&self, mut shutdown: watch::Receiver<bool>) {
        let agent = self.clone();
        let mut rx = self.inner.events.subscribe();
        let handle = tokio::spawn(async move {
            let recovering: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(AgentEvent::AlertCreated(alert)) => {
                            agent.inner.hub.broadcast(
                                serde_json::json!({
                                    "type": "alert",
                                    "severity": alert.severity,
                                    "tags": alert.tags,
                                    "alert": alert,
                                }),
                                "alerts",
                            );
                        }
                        Ok(AgentEvent::AlertEscalated(alert)) => {
                            agent.inner.hub.broadcast(
                                serde_json::json!({
                                    "type": "alert",
                                    "escalated": true,
                                    "severity": alert.severity,
                                    "tags": alert.tags,
                                    "alert": alert,
                                }),
                                "alerts",
                            );
                        }
                        Ok(AgentEvent::Error(record)) => {
                            maybe_recover(&agent, record.code.clone(), recovering.clone());
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event router lagged behind");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("event router stopped");
        });
        *self.inner.router_handle.lock() = Some(handle);
    }

    /// Recovery action for one subsystem error class.
    pub(crate) fn recover_subsystem(&self, code: &str) -> Result<()> {
        match code {
            "monitoring" => {
                self.inner.breakers.sampler.reset();
                info!("sampler breaker reset");
                Ok(())
            }
            "detection" => {
                self.inner.detector.lock().reset();
                info!("leak detector reset");
                Ok(())
            }
            "analysis" => {
                self.inner.analyzer.lock().clear();
                self.inner.breakers.hotspots.reset();
                info!("hotspot analyzer reset");
                Ok(())
            }
            "performance" => {
                self.inner.optimizer.reset();
                self.inner.breakers.optimizer.reset();
                info!("optimizer reset");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn severity_rank(severity: Severity) -> u32 {
    match severity {
        Severity::Low => 1,
        Severity::Medium => 2,
        Severity::High => 3,
        Severity::Critical => 4,
    }
}

/// Kick off a recovery attempt for `code` unless one is in flight.
fn maybe_recover(
    agent: &HeapwatchAgent,
    code: String,
    recovering: Arc<Mutex<HashSet<String>>>,
) {
    if !matches!(
        code.as_str(),
        "monitoring" | "detection" | "analysis" | "performance"
    ) {
        return;
    }
    if !recovering.lock().insert(code.clone()) {
        return;
    }

    let agent = agent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(RECOVERY_BACKOFF).await;
        let retry = RetryManager::new(RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retryable_codes: vec!["state".into()],
        });
        let recover_agent = agent.clone();
        let recover_code = code.clone();
        let result = retry
            .execute(&format!("recover-{}", code), move || {
                let agent = recover_agent.clone();
                let code = recover_code.clone();
                async move { agent.recover_subsystem(&code) }
            })
            .await;
        match result {
            Ok(()) => info!(code = %code, "subsystem recovery completed"),
            Err(e) => warn!(code = %code, error = %e, "subsystem recovery failed"),
        }
        recovering.lock().remove(&code);
    });
}
