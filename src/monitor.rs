//! Status monitor: queryable snapshots and transition streams per run
//!
//! Each live run has a slot holding its state behind a per-run lock and a
//! broadcast channel of transition events. The coordinator is the only
//! writer; everything else reads snapshots or subscribes.

use crate::coordination::{ExecutionRun, FailureReason, NodeState, RunReport, RunState};
use crate::error::{ExecutorError, ExecutorResult};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEventKind {
    NodeTransition {
        index: usize,
        node: String,
        from: NodeState,
        to: NodeState,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
    },
    FeeTransition {
        from: NodeState,
        to: NodeState,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
    },
    RunStateChanged {
        from: RunState,
        to: RunState,
    },
    /// Last event of every stream
    RunFinished { report: RunReport },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub sequence: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

impl RunEvent {
    pub fn is_final(&self) -> bool {
        matches!(self.kind, RunEventKind::RunFinished { .. })
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            RunEventKind::NodeTransition { .. } => "node_transition",
            RunEventKind::FeeTransition { .. } => "fee_transition",
            RunEventKind::RunStateChanged { .. } => "run_state_changed",
            RunEventKind::RunFinished { .. } => "run_finished",
        }
    }
}

/// Live state of one run
pub struct RunSlot {
    pub(crate) run: RwLock<ExecutionRun>,
    events: broadcast::Sender<RunEvent>,
    sequence: AtomicU64,
    finished: Mutex<Option<RunEvent>>,
    settled_at: Mutex<Option<DateTime<Utc>>>,
}

impl RunSlot {
    fn new(run: ExecutionRun, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            run: RwLock::new(run),
            events,
            sequence: AtomicU64::new(0),
            finished: Mutex::new(None),
            settled_at: Mutex::new(None),
        }
    }

    /// Publish a non-final event
    pub(crate) fn publish(&self, run_id: Uuid, kind: RunEventKind) -> RunEvent {
        let event = RunEvent {
            run_id,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            at: Utc::now(),
            kind,
        };
        // No receivers is fine
        let _ = self.events.send(event.clone());
        event
    }

    /// Publish the closing event; later subscribers receive it directly
    pub(crate) async fn finish(&self, run_id: Uuid, report: RunReport) -> RunEvent {
        let mut finished = self.finished.lock().await;
        let event = self.publish(run_id, RunEventKind::RunFinished { report });
        *finished = Some(event.clone());
        *self.settled_at.lock().await = Some(Utc::now());
        event
    }

    pub async fn snapshot(&self) -> ExecutionRun {
        self.run.read().await.clone()
    }

    async fn subscribe(&self) -> RunSubscription {
        let finished = self.finished.lock().await;
        match finished.as_ref() {
            Some(event) => RunSubscription::finished(event.clone()),
            None => RunSubscription {
                receiver: Some(self.events.subscribe()),
                pending: None,
                done: false,
            },
        }
    }
}

/// Stream of events for one run; ends after `RunFinished`
pub struct RunSubscription {
    receiver: Option<broadcast::Receiver<RunEvent>>,
    pending: Option<RunEvent>,
    done: bool,
}

impl RunSubscription {
    /// Subscription that yields only the final event
    pub fn finished(event: RunEvent) -> Self {
        Self {
            receiver: None,
            pending: Some(event),
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<RunEvent> {
        if self.done {
            return None;
        }
        if let Some(event) = self.pending.take() {
            self.done = true;
            return Some(event);
        }

        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if event.is_final() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Run subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Drain until the run finishes and return its report
    pub async fn wait(mut self) -> Option<RunReport> {
        while let Some(event) = self.next().await {
            if let RunEventKind::RunFinished { report } = event.kind {
                return Some(report);
            }
        }
        None
    }

    pub fn into_stream(self) -> impl Stream<Item = RunEvent> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|event| (event, subscription))
        })
    }
}

/// Registry of live runs
pub struct StatusMonitor {
    runs: DashMap<Uuid, Arc<RunSlot>>,
    capacity: usize,
}

impl StatusMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            runs: DashMap::new(),
            capacity: capacity.max(16),
        }
    }

    pub(crate) fn register(&self, run: ExecutionRun) -> Arc<RunSlot> {
        let run_id = run.id;
        let slot = Arc::new(RunSlot::new(run, self.capacity));
        self.runs.insert(run_id, slot.clone());
        debug!("Registered run {}", run_id);
        slot
    }

    pub(crate) fn slot(&self, run_id: Uuid) -> ExecutorResult<Arc<RunSlot>> {
        self.runs
            .get(&run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExecutorError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub fn contains(&self, run_id: Uuid) -> bool {
        self.runs.contains_key(&run_id)
    }

    pub async fn snapshot(&self, run_id: Uuid) -> ExecutorResult<ExecutionRun> {
        Ok(self.slot(run_id)?.snapshot().await)
    }

    pub async fn subscribe(&self, run_id: Uuid) -> ExecutorResult<RunSubscription> {
        Ok(self.slot(run_id)?.subscribe().await)
    }

    pub fn live_runs(&self) -> usize {
        self.runs.len()
    }

    /// Drop settled runs older than `retention`
    pub async fn evict_settled(&self, retention: chrono::Duration) -> Vec<Uuid> {
        let cutoff = Utc::now() - retention;
        let slots: Vec<(Uuid, Arc<RunSlot>)> = self
            .runs
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut evicted = Vec::new();
        for (run_id, slot) in slots {
            let settled_at = *slot.settled_at.lock().await;
            if matches!(settled_at, Some(at) if at <= cutoff) {
                self.runs.remove(&run_id);
                evicted.push(run_id);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{ExecutionPlan, FeeInstruction};
    use crate::registry::TokenId;
    use ethers::types::{Address, U256};
    use futures::StreamExt;

    fn run() -> ExecutionRun {
        let plan = ExecutionPlan::new(
            Address::zero(),
            vec![],
            FeeInstruction {
                chain_id: 10,
                token: TokenId::from("USDC"),
                amount: U256::zero(),
            },
        );
        ExecutionRun::new(Uuid::new_v4(), &plan)
    }

    #[tokio::test]
    async fn test_stream_closes_after_final_event() {
        let monitor = StatusMonitor::new(64);
        let run = run();
        let run_id = run.id;
        let slot = monitor.register(run);

        let subscription = monitor.subscribe(run_id).await.unwrap();
        slot.publish(
            run_id,
            RunEventKind::RunStateChanged {
                from: RunState::Pending,
                to: RunState::Running,
            },
        );
        let report = slot.snapshot().await.report();
        slot.finish(run_id, report).await;

        let events: Vec<RunEvent> = subscription.into_stream().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
        assert!(events[1].is_final());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_final_event_only() {
        let monitor = StatusMonitor::new(64);
        let run = run();
        let run_id = run.id;
        let slot = monitor.register(run);
        let report = slot.snapshot().await.report();
        slot.finish(run_id, report.clone()).await;

        let mut subscription = monitor.subscribe(run_id).await.unwrap();
        let event = subscription.next().await.unwrap();
        assert_eq!(event.kind, RunEventKind::RunFinished { report });
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_run_and_eviction() {
        let monitor = StatusMonitor::new(64);
        assert!(matches!(
            monitor.snapshot(Uuid::new_v4()).await,
            Err(ExecutorError::RunNotFound { .. })
        ));

        let run = run();
        let run_id = run.id;
        let slot = monitor.register(run);
        assert!(monitor.evict_settled(chrono::Duration::zero()).await.is_empty());

        let report = slot.snapshot().await.report();
        slot.finish(run_id, report).await;
        assert_eq!(monitor.evict_settled(chrono::Duration::zero()).await, vec![run_id]);
        assert!(!monitor.contains(run_id));
    }

    #[test]
    fn test_event_serialization() {
        let event = RunEvent {
            run_id: Uuid::nil(),
            sequence: 3,
            at: Utc::now(),
            kind: RunEventKind::NodeTransition {
                index: 1,
                node: "bridge-B".into(),
                from: NodeState::Submitted,
                to: NodeState::AwaitingBridge,
                failure: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "node_transition");
        assert_eq!(json["to"], "awaiting_bridge");
        assert_eq!(json["sequence"], 3);
        assert!(json.get("failure").is_none());

        let fee = RunEvent {
            kind: RunEventKind::FeeTransition {
                from: NodeState::AwaitingConfirmation,
                to: NodeState::Confirmed,
                failure: None,
            },
            ..event
        };
        assert_eq!(fee.name(), "fee_transition");
        let json = serde_json::to_value(&fee).unwrap();
        assert_eq!(json["event"], "fee_transition");
        assert_eq!(json["from"], "awaiting_confirmation");
    }
}
