//! In-process progress hub.
//!
//! Single writer per resource (the job layer serializes work per target),
//! many readers. Subscribers receive the current snapshot on attach, then
//! deltas. Rapid non-terminal updates are coalesced; terminal transitions
//! are always delivered and retained briefly for late subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::broadcast;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ProgressState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressStage {
    pub id: String,
    pub name: String,
    pub percentage: f64,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub resource_id: Ulid,
    pub operation: String,
    pub state: ProgressState,
    pub stages: Vec<ProgressStage>,
    pub overall_percentage: f64,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub error: Option<String>,
}

pub struct ProgressBus {
    latest: RwLock<HashMap<Ulid, ProgressEvent>>,
    last_emit: Mutex<HashMap<Ulid, Instant>>,
    sender: broadcast::Sender<ProgressEvent>,
    coalesce_interval: Duration,
    terminal_retention: Duration,
}

impl ProgressBus {
    pub fn new() -> Arc<Self> {
        Self::with_intervals(Duration::from_millis(250), Duration::from_secs(60))
    }

    pub fn with_intervals(coalesce_interval: Duration, terminal_retention: Duration) -> Arc<Self> {
        let (sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            latest: RwLock::new(HashMap::new()),
            last_emit: Mutex::new(HashMap::new()),
            sender,
            coalesce_interval,
            terminal_retention,
        })
    }

    /// Publish an event. Non-terminal events within the coalesce interval
    /// of the previous emit update the snapshot but skip the broadcast;
    /// terminal events always broadcast.
    pub fn publish(&self, event: ProgressEvent) {
        self.prune_expired();

        let resource_id = event.resource_id;
        let terminal = event.state.is_terminal();
        self.latest
            .write()
            .expect("progress map lock poisoned")
            .insert(resource_id, event.clone());

        let should_broadcast = if terminal {
            true
        } else {
            let mut emits = self.last_emit.lock().expect("emit map lock poisoned");
            match emits.get(&resource_id) {
                Some(last) if last.elapsed() < self.coalesce_interval => false,
                _ => {
                    emits.insert(resource_id, Instant::now());
                    true
                }
            }
        };

        if should_broadcast {
            let _ = self.sender.send(event);
        }
    }

    /// Snapshot of all live resources plus a receiver for deltas.
    pub fn subscribe(&self) -> (Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        self.prune_expired();
        let receiver = self.sender.subscribe();
        let mut snapshot: Vec<ProgressEvent> = self
            .latest
            .read()
            .expect("progress map lock poisoned")
            .values()
            .cloned()
            .collect();
        snapshot.sort_by_key(|e| e.resource_id);
        (snapshot, receiver)
    }

    pub fn latest_for(&self, resource_id: Ulid) -> Option<ProgressEvent> {
        self.latest
            .read()
            .expect("progress map lock poisoned")
            .get(&resource_id)
            .cloned()
    }

    /// Drop terminal snapshots past the retention window.
    fn prune_expired(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.terminal_retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut latest = self.latest.write().expect("progress map lock poisoned");
        latest.retain(|_, event| !(event.state.is_terminal() && event.last_update < cutoff));
    }
}

/// Writer-side handle for one operation on one resource. Stages are
/// declared up front; overall percentage is the stage average.
pub struct ProgressHandle {
    bus: Arc<ProgressBus>,
    resource_id: Ulid,
    operation: String,
    started_at: DateTime<Utc>,
    stages: Mutex<Vec<ProgressStage>>,
}

impl ProgressHandle {
    pub fn new(
        bus: Arc<ProgressBus>,
        resource_id: Ulid,
        operation: impl Into<String>,
        stage_names: &[&str],
    ) -> Self {
        let stages = stage_names
            .iter()
            .map(|name| ProgressStage {
                id: name.to_string(),
                name: name.to_string(),
                percentage: 0.0,
                step: String::new(),
            })
            .collect();
        let handle = Self {
            bus,
            resource_id,
            operation: operation.into(),
            started_at: Utc::now(),
            stages: Mutex::new(stages),
        };
        handle.emit(ProgressState::Running, None);
        handle
    }

    pub fn resource_id(&self) -> Ulid {
        self.resource_id
    }

    pub fn update_stage(&self, stage_id: &str, percentage: f64, step: impl Into<String>) {
        {
            let mut stages = self.stages.lock().expect("stage lock poisoned");
            if let Some(stage) = stages.iter_mut().find(|s| s.id == stage_id) {
                stage.percentage = percentage.clamp(0.0, 100.0);
                stage.step = step.into();
            }
        }
        self.emit(ProgressState::Running, None);
    }

    pub fn complete_stage(&self, stage_id: &str) {
        self.update_stage(stage_id, 100.0, "done");
    }

    pub fn complete(&self) {
        {
            let mut stages = self.stages.lock().expect("stage lock poisoned");
            for stage in stages.iter_mut() {
                stage.percentage = 100.0;
            }
        }
        self.emit(ProgressState::Completed, None);
    }

    pub fn fail(&self, error: impl Into<String>) {
        self.emit(ProgressState::Error, Some(error.into()));
    }

    pub fn cancelled(&self) {
        self.emit(ProgressState::Cancelled, None);
    }

    fn emit(&self, state: ProgressState, error: Option<String>) {
        let stages = self.stages.lock().expect("stage lock poisoned").clone();
        let overall = if stages.is_empty() {
            if state == ProgressState::Completed { 100.0 } else { 0.0 }
        } else {
            stages.iter().map(|s| s.percentage).sum::<f64>() / stages.len() as f64
        };
        self.bus.publish(ProgressEvent {
            resource_id: self.resource_id,
            operation: self.operation.clone(),
            state,
            stages,
            overall_percentage: overall,
            started_at: self.started_at,
            last_update: Utc::now(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_no_coalesce() -> Arc<ProgressBus> {
        ProgressBus::with_intervals(Duration::ZERO, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn subscriber_gets_snapshot_then_deltas() {
        let bus = bus_no_coalesce();
        let id = Ulid::new();
        let handle = ProgressHandle::new(bus.clone(), id, "stream_ingestion", &["fetch", "store"]);

        let (snapshot, mut rx) = bus.subscribe();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].resource_id, id);

        handle.update_stage("fetch", 50.0, "halfway");
        let delta = rx.recv().await.unwrap();
        assert_eq!(delta.stages[0].percentage, 50.0);
        assert_eq!(delta.overall_percentage, 25.0);
    }

    #[tokio::test]
    async fn coalescing_drops_rapid_updates_but_never_terminals() {
        let bus = ProgressBus::with_intervals(Duration::from_secs(3600), Duration::from_secs(60));
        let id = Ulid::new();
        let handle = ProgressHandle::new(bus.clone(), id, "epg_ingestion", &["fetch"]);
        let (_, mut rx) = bus.subscribe();

        // Within the coalesce window: snapshot updated, no broadcast.
        handle.update_stage("fetch", 10.0, "a");
        handle.update_stage("fetch", 20.0, "b");
        assert!(rx.try_recv().is_err());
        assert_eq!(
            bus.latest_for(id).unwrap().stages[0].percentage,
            20.0
        );

        // Terminal transition always lands.
        handle.complete();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, ProgressState::Completed);
        assert_eq!(event.overall_percentage, 100.0);
    }

    #[tokio::test]
    async fn terminal_events_expire_after_retention() {
        let bus = ProgressBus::with_intervals(Duration::ZERO, Duration::ZERO);
        let id = Ulid::new();
        let handle = ProgressHandle::new(bus.clone(), id, "backup", &[]);
        handle.complete();

        // Zero retention: the terminal snapshot is pruned on next access.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (snapshot, _) = bus.subscribe();
        assert!(snapshot.iter().all(|e| e.resource_id != id));
    }

    #[tokio::test]
    async fn failure_carries_the_error() {
        let bus = bus_no_coalesce();
        let id = Ulid::new();
        let handle = ProgressHandle::new(bus.clone(), id, "stream_ingestion", &["fetch"]);
        handle.fail("upstream returned 503");
        let event = bus.latest_for(id).unwrap();
        assert_eq!(event.state, ProgressState::Error);
        assert_eq!(event.error.as_deref(), Some("upstream returned 503"));
    }
}
