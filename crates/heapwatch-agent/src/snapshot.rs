//! Heap snapshot interface
//!
//! Snapshot decoding is an external collaborator; the agent's contract
//! is only take / analyze / compare. The default provider captures the
//! probe's heap counters and diffs two captures; a binding with a real
//! graph decoder plugs in behind the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heapwatch_common::{Error, HeapStats, Result, Sample};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Opaque reference to a captured snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHandle {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub heap: HeapStats,
}

/// Options for [`SnapshotProvider::analyze`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnalyzeOptions {
    /// Cap on reported spaces, largest first.
    pub top: Option<usize>,
}

/// The pluggable snapshot backend.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Capture and cache a snapshot from the current sample.
    async fn take_snapshot(&self, sample: &Sample) -> Result<SnapshotHandle>;

    /// Analyze one cached snapshot.
    async fn analyze(
        &self,
        handle: &SnapshotHandle,
        options: &AnalyzeOptions,
    ) -> Result<serde_json::Value>;

    /// Diff two cached snapshots, oldest-to-newest.
    async fn compare(
        &self,
        before: &SnapshotHandle,
        after: &SnapshotHandle,
    ) -> Result<serde_json::Value>;
}

/// Default provider: keeps captures in memory and diffs their counters.
#[derive(Default)]
pub struct InMemorySnapshotProvider {
    snapshots: Mutex<HashMap<Uuid, SnapshotHandle>>,
}

impl InMemorySnapshotProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, id: Uuid) -> Result<SnapshotHandle> {
        self.snapshots
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Snapshot(format!("unknown snapshot '{}'", id)))
    }
}

#[async_trait]
impl SnapshotProvider for InMemorySnapshotProvider {
    async fn take_snapshot(&self, sample: &Sample) -> Result<SnapshotHandle> {
        let handle = SnapshotHandle {
            id: Uuid::new_v4(),
            created_at: sample.timestamp,
            heap: sample.heap.clone(),
        };
        self.snapshots.lock().insert(handle.id, handle.clone());
        Ok(handle)
    }

    async fn analyze(
        &self,
        handle: &SnapshotHandle,
        options: &AnalyzeOptions,
    ) -> Result<serde_json::Value> {
        let snapshot = self.lookup(handle.id)?;
        let mut spaces: Vec<_> = snapshot.heap.spaces.iter().collect();
        spaces.sort_by(|a, b| b.used.cmp(&a.used));
        if let Some(top) = options.top {
            spaces.truncate(top);
        }
        Ok(serde_json::json!({
            "id": snapshot.id,
            "createdAt": snapshot.created_at,
            "heapUsed": snapshot.heap.used,
            "heapLimit": snapshot.heap.limit,
            "usageRatio": if snapshot.heap.limit > 0 {
                snapshot.heap.used as f64 / snapshot.heap.limit as f64
            } else {
                0.0
            },
            "spaces": spaces
                .iter()
                .map(|s| serde_json::json!({
                    "name": s.name,
                    "used": s.used,
                    "size": s.size,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    async fn compare(
        &self,
        before: &SnapshotHandle,
        after: &SnapshotHandle,
    ) -> Result<serde_json::Value> {
        let before = self.lookup(before.id)?;
        let after = self.lookup(after.id)?;

        let delta = after.heap.used as i64 - before.heap.used as i64;
        let mut space_deltas = Vec::new();
        for space in &after.heap.spaces {
            let previous = before
                .heap
                .spaces
                .iter()
                .find(|s| s.name == space.name)
                .map(|s| s.used)
                .unwrap_or(0);
            space_deltas.push(serde_json::json!({
                "name": space.name,
                "before": previous,
                "after": space.used,
                "delta": space.used as i64 - previous as i64,
            }));
        }
        space_deltas.sort_by_key(|d| -d["delta"].as_i64().unwrap_or(0));

        Ok(serde_json::json!({
            "before": before.id,
            "after": after.id,
            "elapsedMs": (after.created_at - before.created_at).num_milliseconds(),
            "heapUsedDelta": delta,
            "grew": delta > 0,
            "spaces": space_deltas,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use heapwatch_common::{CpuStats, HeapSpace, OsStats};

    fn sample(used: u64, spaces: Vec<HeapSpace>) -> Sample {
        Sample {
            timestamp: Utc::now(),
            heap: HeapStats {
                used,
                total: used,
                limit: used * 2,
                spaces,
                ..Default::default()
            },
            gc: Vec::new(),
            event_loop_delay_ms: 0.0,
            cpu: CpuStats::default(),
            os: OsStats::default(),
        }
    }

    fn space(name: &str, used: u64) -> HeapSpace {
        HeapSpace {
            name: name.into(),
            size: used * 2,
            used,
            available: used,
            physical: used,
        }
    }

    #[tokio::test]
    async fn take_analyze_compare_roundtrip() {
        let provider = InMemorySnapshotProvider::new();

        let first = provider
            .take_snapshot(&sample(100, vec![space("a", 60), space("b", 40)]))
            .await
            .unwrap();
        let mut second_sample = sample(150, vec![space("a", 100), space("b", 30)]);
        second_sample.timestamp = Utc::now() + TimeDelta::seconds(5);
        let second = provider.take_snapshot(&second_sample).await.unwrap();

        let analysis = provider
            .analyze(&first, &AnalyzeOptions { top: Some(1) })
            .await
            .unwrap();
        assert_eq!(analysis["heapUsed"], 100);
        assert_eq!(analysis["spaces"].as_array().unwrap().len(), 1);
        assert_eq!(analysis["spaces"][0]["name"], "a");

        let diff = provider.compare(&first, &second).await.unwrap();
        assert_eq!(diff["heapUsedDelta"], 50);
        assert_eq!(diff["grew"], true);
        // Largest positive delta first.
        assert_eq!(diff["spaces"][0]["name"], "a");
        assert_eq!(diff["spaces"][0]["delta"], 40);
    }

    #[tokio::test]
    async fn unknown_handles_are_snapshot_errors() {
        let provider = InMemorySnapshotProvider::new();
        let ghost = SnapshotHandle {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            heap: HeapStats::default(),
        };
        let result = provider.analyze(&ghost, &AnalyzeOptions::default()).await;
        assert!(matches!(result, Err(Error::Snapshot(_))));
    }
}
