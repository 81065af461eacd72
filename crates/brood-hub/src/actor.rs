//! The hub actor: sole owner of the registry and the message log
//!
//! Connection handlers never touch state directly. They send an [`Op`] over
//! the actor's queue and wait on a oneshot reply, so every state transition
//! and every log append happens in queue order on one task.

use std::collections::HashMap;

use brood_core::protocol::{HelperSummary, Push, SendOutcome, StatusReport};
use brood_core::{BroodError, HelperId, Recipients, RecordKind, Result, DIRECTOR};
use brood_log::MessageLog;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::launcher::ProcessHandle;
use crate::registry::{CleanupStep, ConnId, LaunchPlan, Registry, StopPlan};

/// Depth of the actor's request queue
const OP_QUEUE: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests to the actor
pub enum Op {
    Spawn {
        parent: HelperId,
        breadth: Option<u32>,
        depth: Option<u32>,
        model: Option<String>,
        reply: Reply<LaunchPlan>,
    },
    LaunchFinished {
        identity: HelperId,
        process: Option<ProcessHandle>,
        reply: Reply<Option<ProcessHandle>>,
    },
    TeardownFinished {
        identity: HelperId,
        reply: Reply<()>,
    },
    Register {
        identity: HelperId,
        reply: Reply<HelperSummary>,
    },
    Running {
        identity: HelperId,
        reply: Reply<HelperSummary>,
    },
    Subscribe {
        identity: HelperId,
        conn: ConnId,
        pushes: mpsc::Sender<Push>,
        reply: Reply<()>,
    },
    Unsubscribe {
        identity: HelperId,
        conn: ConnId,
    },
    Send {
        from: HelperId,
        to: HelperId,
        content: String,
        reply: Reply<SendOutcome>,
    },
    Broadcast {
        from: HelperId,
        content: String,
        reply: Reply<SendOutcome>,
    },
    Stop {
        identity: HelperId,
        reply: Reply<StopPlan>,
    },
    Respawn {
        identity: HelperId,
        reply: Reply<LaunchPlan>,
    },
    Cleanup {
        identity: HelperId,
        cascade: bool,
        reply: Reply<Vec<CleanupStep>>,
    },
    Status {
        identity: Option<HelperId>,
        reply: Reply<StatusReport>,
    },
    LogSnapshot {
        reply: Reply<u64>,
    },
    Shutdown {
        reply: Reply<Vec<ProcessHandle>>,
    },
}

struct Subscriber {
    conn: ConnId,
    pushes: mpsc::Sender<Push>,
}

struct HubActor {
    registry: Registry,
    log: MessageLog,
    subscribers: HashMap<HelperId, Subscriber>,
}

/// Start the actor task
pub fn spawn_actor(registry: Registry, log: MessageLog) -> (HubHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(OP_QUEUE);
    let actor = HubActor {
        registry,
        log,
        subscribers: HashMap::new(),
    };
    let task = tokio::spawn(actor.run(rx));
    (HubHandle { tx }, task)
}

impl HubActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Op>) {
        debug!("Hub actor started");
        while let Some(op) = rx.recv().await {
            self.handle(op);
        }
        debug!("Hub actor stopped");
    }

    fn handle(&mut self, op: Op) {
        match op {
            Op::Spawn {
                parent,
                breadth,
                depth,
                model,
                reply,
            } => {
                let result = self.registry.reserve_child(parent, breadth, depth, model);
                if let Ok(plan) = &result {
                    info!(
                        "Spawning helper {} under {} ({})",
                        plan.identity, plan.parent, plan.budget
                    );
                    self.control(plan.identity, "spawn");
                }
                let _ = reply.send(result);
            }
            Op::LaunchFinished {
                identity,
                process,
                reply,
            } => {
                let failed = process.is_none();
                let result = self.registry.launch_finished(identity, process);
                if failed && result.is_ok() {
                    self.control(identity, "launch_failed");
                }
                let _ = reply.send(result);
            }
            Op::TeardownFinished { identity, reply } => {
                let _ = reply.send(self.registry.teardown_finished(identity));
            }
            Op::Register { identity, reply } => {
                let result = self.registry.register(identity).and_then(|changed| {
                    if changed {
                        info!("Helper {} registered", identity);
                        self.control(identity, "register");
                    }
                    self.registry.summary(identity)
                });
                let _ = reply.send(result);
            }
            Op::Running { identity, reply } => {
                let result = self.registry.mark_running(identity).and_then(|changed| {
                    if changed {
                        self.control(identity, "running");
                    }
                    self.registry.summary(identity)
                });
                let _ = reply.send(result);
            }
            Op::Subscribe {
                identity,
                conn,
                pushes,
                reply,
            } => {
                let result = self.registry.attach(identity, conn).map(|replaced| {
                    if let Some(old) = replaced {
                        debug!("Connection {} replaces {} for helper {}", conn, old, identity);
                    }
                    self.subscribers
                        .insert(identity, Subscriber { conn, pushes });
                });
                let _ = reply.send(result);
            }
            Op::Unsubscribe { identity, conn } => {
                if self
                    .subscribers
                    .get(&identity)
                    .is_some_and(|s| s.conn == conn)
                {
                    self.subscribers.remove(&identity);
                }
                if self.registry.detach(identity, conn) {
                    info!("Helper {} disconnected; marked stopped", identity);
                    self.control(identity, "disconnect");
                }
            }
            Op::Send {
                from,
                to,
                content,
                reply,
            } => {
                let _ = reply.send(self.send(from, to, content));
            }
            Op::Broadcast {
                from,
                content,
                reply,
            } => {
                let _ = reply.send(self.broadcast(from, content));
            }
            Op::Stop { identity, reply } => {
                let result = self.registry.begin_stop(identity);
                if let Ok(plan) = &result {
                    self.subscribers.remove(&identity);
                    if !plan.already_stopped {
                        info!("Stopping helper {}", identity);
                        self.control(identity, "stop");
                    }
                }
                let _ = reply.send(result);
            }
            Op::Respawn { identity, reply } => {
                let result = self.registry.begin_respawn(identity);
                if result.is_ok() {
                    info!("Respawning helper {}", identity);
                    self.control(identity, "respawn");
                }
                let _ = reply.send(result);
            }
            Op::Cleanup {
                identity,
                cascade,
                reply,
            } => {
                let result = self.registry.begin_cleanup(identity, cascade);
                if let Ok(steps) = &result {
                    for step in steps {
                        self.subscribers.remove(&step.identity);
                        info!("Cleaning up helper {}", step.identity);
                        self.control(step.identity, "cleanup");
                    }
                }
                let _ = reply.send(result);
            }
            Op::Status { identity, reply } => {
                let helpers = match identity {
                    Some(id) => self.registry.summary(id).map(|s| vec![s]),
                    None => Ok(self.registry.summaries()),
                };
                let result = helpers.map(|helpers| StatusReport {
                    helpers,
                    last_sequence: self.log.last_sequence(),
                });
                let _ = reply.send(result);
            }
            Op::LogSnapshot { reply } => {
                let _ = reply.send(Ok(self.log.last_sequence()));
            }
            Op::Shutdown { reply } => {
                let handles = self.registry.stop_all();
                self.subscribers.clear();
                self.control(DIRECTOR, "shutdown");
                let _ = reply.send(Ok(handles));
            }
        }
    }

    fn send(&mut self, from: HelperId, to: HelperId, content: String) -> Result<SendOutcome> {
        self.registry.get_live(from)?;
        self.registry.get_live(to)?;

        let record = self
            .log
            .append(RecordKind::Message, from, Recipients::one(to), content)?;
        let push = Push::from(&record);
        let delivered = usize::from(self.push(to, &push));
        debug!(
            "Message {} from {} to {} (pushed: {})",
            record.sequence,
            from,
            to,
            delivered > 0
        );

        Ok(SendOutcome {
            sequence: record.sequence,
            delivered,
        })
    }

    fn broadcast(&mut self, from: HelperId, content: String) -> Result<SendOutcome> {
        self.registry.get_live(from)?;

        let record = self
            .log
            .append(RecordKind::Message, from, Recipients::All, content)?;
        let push = Push::from(&record);
        let targets: Vec<HelperId> = self
            .subscribers
            .keys()
            .copied()
            .filter(|id| *id != from)
            .collect();
        let delivered = targets
            .into_iter()
            .filter(|id| self.push(*id, &push))
            .count();
        debug!(
            "Broadcast {} from {} pushed to {} subscribers",
            record.sequence, from, delivered
        );

        Ok(SendOutcome {
            sequence: record.sequence,
            delivered,
        })
    }

    /// Queue a push without waiting; a full queue drops it
    fn push(&self, id: HelperId, push: &Push) -> bool {
        let Some(subscriber) = self.subscribers.get(&id) else {
            return false;
        };
        match subscriber.pushes.try_send(push.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Push queue for helper {} is full; dropping push", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Subscriber for helper {} already gone", id);
                false
            }
        }
    }

    fn control(&mut self, identity: HelperId, event: &str) {
        if let Err(e) = self
            .log
            .append(RecordKind::Control, identity, Recipients::none(), event)
        {
            warn!("Failed to log {} for helper {}: {}", event, identity, e);
        }
    }
}

/// Cloneable front end to the actor
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Op>,
}

impl HubHandle {
    async fn call<T>(&self, op: impl FnOnce(Reply<T>) -> Op) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(op(reply))
            .await
            .map_err(|_| BroodError::HubUnavailable("hub actor has stopped".to_string()))?;
        rx.await
            .map_err(|_| BroodError::HubUnavailable("hub actor dropped the request".to_string()))?
    }

    pub async fn spawn(
        &self,
        parent: HelperId,
        breadth: Option<u32>,
        depth: Option<u32>,
        model: Option<String>,
    ) -> Result<LaunchPlan> {
        self.call(|reply| Op::Spawn {
            parent,
            breadth,
            depth,
            model,
            reply,
        })
        .await
    }

    /// Report a launch result; a returned handle must be terminated
    pub async fn launch_finished(
        &self,
        identity: HelperId,
        process: Option<ProcessHandle>,
    ) -> Result<Option<ProcessHandle>> {
        self.call(|reply| Op::LaunchFinished {
            identity,
            process,
            reply,
        })
        .await
    }

    pub async fn teardown_finished(&self, identity: HelperId) -> Result<()> {
        self.call(|reply| Op::TeardownFinished { identity, reply }).await
    }

    pub async fn register(&self, identity: HelperId) -> Result<HelperSummary> {
        self.call(|reply| Op::Register { identity, reply }).await
    }

    pub async fn running(&self, identity: HelperId) -> Result<HelperSummary> {
        self.call(|reply| Op::Running { identity, reply }).await
    }

    pub async fn subscribe(
        &self,
        identity: HelperId,
        conn: ConnId,
        pushes: mpsc::Sender<Push>,
    ) -> Result<()> {
        self.call(|reply| Op::Subscribe {
            identity,
            conn,
            pushes,
            reply,
        })
        .await
    }

    /// Fire and forget; a stopped actor has nothing left to detach
    pub async fn unsubscribe(&self, identity: HelperId, conn: ConnId) {
        let _ = self.tx.send(Op::Unsubscribe { identity, conn }).await;
    }

    pub async fn send(&self, from: HelperId, to: HelperId, content: String) -> Result<SendOutcome> {
        self.call(|reply| Op::Send {
            from,
            to,
            content,
            reply,
        })
        .await
    }

    pub async fn broadcast(&self, from: HelperId, content: String) -> Result<SendOutcome> {
        self.call(|reply| Op::Broadcast {
            from,
            content,
            reply,
        })
        .await
    }

    pub async fn stop(&self, identity: HelperId) -> Result<StopPlan> {
        self.call(|reply| Op::Stop { identity, reply }).await
    }

    pub async fn respawn(&self, identity: HelperId) -> Result<LaunchPlan> {
        self.call(|reply| Op::Respawn { identity, reply }).await
    }

    pub async fn cleanup(&self, identity: HelperId, cascade: bool) -> Result<Vec<CleanupStep>> {
        self.call(|reply| Op::Cleanup {
            identity,
            cascade,
            reply,
        })
        .await
    }

    pub async fn status(&self, identity: Option<HelperId>) -> Result<StatusReport> {
        self.call(|reply| Op::Status { identity, reply }).await
    }

    /// Sequence of the last durable record, used to bound log reads
    pub async fn log_snapshot(&self) -> Result<u64> {
        self.call(|reply| Op::LogSnapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<Vec<ProcessHandle>> {
        self.call(|reply| Op::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brood_core::{HelperStatus, Numbering, SpawnBudget};
    use tempfile::tempdir;

    fn start(dir: &std::path::Path) -> (HubHandle, JoinHandle<()>) {
        let registry = Registry::new(Numbering::new(3).unwrap(), SpawnBudget::new(2, 3));
        let log = MessageLog::open(dir.join("messages.jsonl")).unwrap();
        spawn_actor(registry, log)
    }

    async fn spawn_registered(hub: &HubHandle) -> HelperId {
        let plan = hub.spawn(DIRECTOR, None, None, None).await.unwrap();
        hub.launch_finished(plan.identity, None).await.unwrap();
        hub.register(plan.identity).await.unwrap();
        plan.identity
    }

    #[tokio::test]
    async fn test_send_pushes_to_subscriber() {
        let dir = tempdir().unwrap();
        let (hub, _task) = start(dir.path());
        let id = spawn_registered(&hub).await;

        let (tx, mut rx) = mpsc::channel(4);
        hub.subscribe(id, 1, tx).await.unwrap();

        let outcome = hub
            .send(DIRECTOR, id, "Analyze the auth module".to_string())
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 1);

        let Push::Message {
            sequence, content, ..
        } = rx.recv().await.unwrap();
        assert_eq!(sequence, outcome.sequence);
        assert_eq!(content, "Analyze the auth module");
    }

    #[tokio::test]
    async fn test_full_queue_drops_push_but_logs() {
        let dir = tempdir().unwrap();
        let (hub, _task) = start(dir.path());
        let id = spawn_registered(&hub).await;

        let (tx, _rx) = mpsc::channel(1);
        hub.subscribe(id, 1, tx).await.unwrap();

        let first = hub.send(DIRECTOR, id, "one".to_string()).await.unwrap();
        let second = hub.send(DIRECTOR, id, "two".to_string()).await.unwrap();
        assert_eq!(first.delivered, 1);
        assert_eq!(second.delivered, 0);
        assert_eq!(second.sequence, first.sequence + 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_is_rejected_without_logging() {
        let dir = tempdir().unwrap();
        let (hub, _task) = start(dir.path());
        let before = hub.log_snapshot().await.unwrap();

        let err = hub.send(DIRECTOR, 9, "hello".to_string()).await.unwrap_err();
        assert!(matches!(err, BroodError::UnknownIdentity(9)));
        assert_eq!(hub.log_snapshot().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_unsubscribe_marks_stopped() {
        let dir = tempdir().unwrap();
        let (hub, _task) = start(dir.path());
        let id = spawn_registered(&hub).await;

        let (tx, _rx) = mpsc::channel(4);
        hub.subscribe(id, 5, tx).await.unwrap();
        hub.unsubscribe(id, 5).await;

        let report = hub.status(Some(id)).await.unwrap();
        assert_eq!(report.helpers[0].status, HelperStatus::Stopped);
        assert!(!report.helpers[0].subscribed);
    }
}
