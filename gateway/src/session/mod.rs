//! SessionManager - the per-(actor, platform) session state machine.
//!
//! One supervised worker per (actor, platform) pair, lazily created on the
//! first job, reused for subsequent jobs from the same actor, torn down
//! after the idle sweep or an explicit disconnect. The manager routes
//! validated jobs into each session's queue channel and multiplexes worker
//! results back to the originating client connections through the bus.
//! When a worker in another gateway process sharing the queue executes one
//! of this process's jobs, the outcome arrives through the queue's durable
//! result records instead of an in-process message.
//!
//! State machine per key:
//!
//! ```text
//! Absent -> Starting -> Ready <-> Busy -> Draining -> Terminated -> Absent
//! ```
//!
//! `Absent` is the missing map entry. A worker crash drops the entry
//! directly (pending jobs fail with WorkerCrashed); the next job for the
//! key starts a fresh session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde_json::Value;
use tracing::{debug, info, warn};

use shared_types::{
    error_envelope, result_envelope, ActorId, ClientRef, ErrorObject, Job, SessionSnapshot,
};

use crate::bus::{self, actor_topic, client_topic, BusEvent, BusMsg};
use crate::credentials::CredentialStore;
use crate::error::DispatchError;
use crate::platform::PlatformRegistry;
use crate::queue::{JobOutcome, JobQueue};

pub mod worker;

pub use worker::{PlatformSessionActor, PlatformSessionArguments, PlatformSessionMsg};

/// Primary key for sessions: who, on which platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub actor: ActorId,
    pub platform: String,
}

impl SessionKey {
    pub fn new(actor: ActorId, platform: impl Into<String>) -> Self {
        Self {
            actor,
            platform: platform.into(),
        }
    }

    /// The queue channel this session consumes.
    pub fn channel(&self) -> String {
        shared_types::channel_key(&self.platform, &self.actor)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.actor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Busy,
    Draining,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Draining => "draining",
            SessionState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

struct PendingJob {
    client: ClientRef,
    /// Original envelope, kept for reply construction.
    payload: Value,
}

struct SessionEntry {
    state: SessionState,
    worker: ActorRef<PlatformSessionMsg>,
    worker_id: ractor::ActorId,
    /// Jobs awaiting a terminal outcome. Presence here is the delivery
    /// gate: a completion for an id no longer pending is dropped, so a
    /// redelivered duplicate never reaches the client twice.
    pending: HashMap<String, PendingJob>,
    last_activity: Instant,
}

pub struct SessionManagerArguments {
    pub registry: Arc<PlatformRegistry>,
    pub credentials: Arc<dyn CredentialStore>,
    pub queue: Arc<JobQueue>,
    pub bus: ActorRef<BusMsg>,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
}

pub struct SessionManagerState {
    registry: Arc<PlatformRegistry>,
    credentials: Arc<dyn CredentialStore>,
    queue: Arc<JobQueue>,
    bus: ActorRef<BusMsg>,
    idle_timeout: Duration,
    poll_interval: Duration,
    sessions: HashMap<SessionKey, SessionEntry>,
    /// Live client connections, by actor, for unsolicited fan-out and
    /// disconnect-triggered teardown.
    clients: HashMap<ClientRef, ActorId>,
}

#[derive(Debug)]
pub enum SessionManagerMsg {
    /// Route a validated job toward its session, spinning one up if absent.
    RouteJob { job: Job, client: ClientRef },

    /// Associate a client connection with an actor identity.
    RegisterClient { client: ClientRef, actor: ActorId },

    /// Drop a client connection; the actor's sessions are torn down when
    /// no other connection remains.
    UnregisterClient { client: ClientRef },

    /// Worker signalled readiness.
    SessionReady { key: SessionKey },

    /// Worker completed a job.
    JobDone {
        key: SessionKey,
        job_id: String,
        result: Value,
    },

    /// Worker reported a terminal job failure.
    JobFailed {
        key: SessionKey,
        job_id: String,
        error: DispatchError,
    },

    /// Unsolicited platform event (no job id): fan out to the actor's
    /// clients.
    PlatformEvent { key: SessionKey, payload: Value },

    /// Explicit teardown: disconnect verb, client disconnect, or operator.
    Terminate { key: SessionKey, reason: String },

    /// Periodic sweep: release expired queue claims, reap idle sessions.
    Sweep,

    /// Poll the durable outcome records for pending jobs finished by a
    /// consumer in another process.
    CollectResults,

    /// Point-in-time view of every session.
    Snapshot {
        reply: RpcReplyPort<Vec<SessionSnapshot>>,
    },
}

#[derive(Debug, Default)]
pub struct SessionManager;

#[async_trait]
impl Actor for SessionManager {
    type Msg = SessionManagerMsg;
    type State = SessionManagerState;
    type Arguments = SessionManagerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(actor_id = %myself.get_id(), "SessionManager starting");

        // Another gateway process sharing the queue can claim and finish
        // jobs this process is answerable for; their outcomes only exist as
        // durable records, so poll for them at the queue cadence.
        let collector = myself.clone();
        let interval = args.poll_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if collector.cast(SessionManagerMsg::CollectResults).is_err() {
                    break;
                }
            }
        });

        Ok(SessionManagerState {
            registry: args.registry,
            credentials: args.credentials,
            queue: args.queue,
            bus: args.bus,
            idle_timeout: args.idle_timeout,
            poll_interval: args.poll_interval,
            sessions: HashMap::new(),
            clients: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionManagerMsg::RouteJob { job, client } => {
                self.route_job(&myself, job, client, state).await;
            }
            SessionManagerMsg::RegisterClient { client, actor } => {
                debug!(client = %client, actor = %actor, "client registered");
                state.clients.insert(client, actor);
            }
            SessionManagerMsg::UnregisterClient { client } => {
                self.unregister_client(client, state);
            }
            SessionManagerMsg::SessionReady { key } => {
                if let Some(entry) = state.sessions.get_mut(&key) {
                    if entry.state == SessionState::Starting {
                        entry.state = if entry.pending.is_empty() {
                            SessionState::Ready
                        } else {
                            SessionState::Busy
                        };
                        entry.last_activity = Instant::now();
                        info!(session = %key, state = %entry.state, "session ready");
                    }
                }
            }
            SessionManagerMsg::JobDone {
                key,
                job_id,
                result,
            } => {
                self.complete_job(&key, &job_id, Ok(result), state);
            }
            SessionManagerMsg::JobFailed { key, job_id, error } => {
                self.complete_job(&key, &job_id, Err(error), state);
            }
            SessionManagerMsg::PlatformEvent { key, payload } => {
                if let Some(entry) = state.sessions.get_mut(&key) {
                    entry.last_activity = Instant::now();
                }
                let event = BusEvent::new(actor_topic(&key.actor), payload, "session-manager");
                let _ = bus::publish(&state.bus, event);
            }
            SessionManagerMsg::Terminate { key, reason } => {
                self.terminate_session(&key, &reason, state);
            }
            SessionManagerMsg::Sweep => {
                self.sweep(state);
            }
            SessionManagerMsg::CollectResults => {
                self.collect_recorded_results(state);
            }
            SessionManagerMsg::Snapshot { reply } => {
                let snapshots = state
                    .sessions
                    .iter()
                    .map(|(key, entry)| SessionSnapshot {
                        actor_id: key.actor.to_string(),
                        platform: key.platform.clone(),
                        state: entry.state.to_string(),
                        pending_jobs: entry.pending.len(),
                        idle_secs: entry.last_activity.elapsed().as_secs(),
                    })
                    .collect();
                let _ = reply.send(snapshots);
            }
        }
        Ok(())
    }

    /// Worker exits arrive here. A stop we initiated finds its entry
    /// already removed; anything else is a crash, and every pending job
    /// fails with WorkerCrashed. The session is not restarted implicitly.
    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorFailed(cell, err) => {
                self.reap_crashed_worker(cell.get_id(), &err.to_string(), state);
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                let reason = reason.unwrap_or_else(|| "worker exited".to_string());
                self.reap_crashed_worker(cell.get_id(), &reason, state);
            }
            _ => {}
        }
        Ok(())
    }
}

impl SessionManager {
    async fn route_job(
        &self,
        myself: &ActorRef<SessionManagerMsg>,
        job: Job,
        client: ClientRef,
        state: &mut SessionManagerState,
    ) {
        let key = SessionKey::new(job.actor.clone(), job.platform.clone());

        if !state.sessions.contains_key(&key) {
            if let Err(e) = self.start_session(myself, &key, state).await {
                warn!(session = %key, error = %e, "session start failed");
                self.publish_error(
                    state,
                    &client,
                    Some(&job.id),
                    Some(&job.platform),
                    &DispatchError::WorkerCrashed(format!("session start failed: {e}")),
                );
                return;
            }
        }

        let Some(entry) = state.sessions.get_mut(&key) else {
            return;
        };

        entry.pending.insert(
            job.id.clone(),
            PendingJob {
                client,
                payload: job.payload.clone(),
            },
        );
        entry.last_activity = Instant::now();
        if entry.state == SessionState::Ready {
            entry.state = SessionState::Busy;
        }

        if let Err(e) = state.queue.enqueue(&job) {
            warn!(session = %key, job_id = %job.id, error = %e, "enqueue failed");
            let pending = entry.pending.remove(&job.id);
            if let Some(pending) = pending {
                self.publish_error(
                    state,
                    &pending.client,
                    Some(&job.id),
                    Some(&job.platform),
                    &DispatchError::Queue(e.to_string()),
                );
            }
            return;
        }

        debug!(session = %key, job_id = %job.id, "job routed");

        // Nudge the worker so the job is picked up ahead of the next poll.
        if let Some(entry) = state.sessions.get(&key) {
            let _ = entry.worker.cast(PlatformSessionMsg::Tick);
        }
    }

    /// Absent -> Starting: allocate a supervised worker carrying the
    /// actor's credentials and the platform descriptor.
    async fn start_session(
        &self,
        myself: &ActorRef<SessionManagerMsg>,
        key: &SessionKey,
        state: &mut SessionManagerState,
    ) -> anyhow::Result<()> {
        let descriptor = state
            .registry
            .get(&key.platform)
            .ok_or_else(|| anyhow::anyhow!("platform '{}' not loaded", key.platform))?;

        let credentials = state
            .credentials
            .get(&key.actor, &key.platform)
            .map_err(|e| anyhow::anyhow!("credential lookup: {e}"))?;

        let (worker, _handle) = Actor::spawn_linked(
            None,
            PlatformSessionActor,
            PlatformSessionArguments {
                key: key.clone(),
                descriptor,
                credentials,
                queue: state.queue.clone(),
                manager: myself.clone(),
                poll_interval: state.poll_interval,
            },
            myself.get_cell(),
        )
        .await?;

        info!(session = %key, "session starting");
        state.sessions.insert(
            key.clone(),
            SessionEntry {
                state: SessionState::Starting,
                worker_id: worker.get_id(),
                worker,
                pending: HashMap::new(),
                last_activity: Instant::now(),
            },
        );
        Ok(())
    }

    /// Resolve one job's terminal outcome back to its client. Exactly one
    /// client-visible completion per job id: duplicates (redelivery after a
    /// visibility timeout) and orphans (session already reaped) are
    /// dropped.
    fn complete_job(
        &self,
        key: &SessionKey,
        job_id: &str,
        outcome: Result<Value, DispatchError>,
        state: &mut SessionManagerState,
    ) {
        let Some(entry) = state.sessions.get_mut(key) else {
            debug!(session = %key, job_id, "completion for reaped session dropped");
            return;
        };

        let Some(pending) = entry.pending.remove(job_id) else {
            debug!(session = %key, job_id, "completion for unknown or answered job dropped");
            return;
        };

        // This process answers for the job, so its durable outcome record
        // is consumed here; the poll path must not deliver it a second
        // time.
        if let Err(e) = state.queue.take_result(job_id) {
            warn!(session = %key, job_id, error = %e, "result record take failed");
        }

        entry.last_activity = Instant::now();
        if entry.pending.is_empty() && entry.state == SessionState::Busy {
            entry.state = SessionState::Ready;
        }

        match outcome {
            Ok(result) => {
                let reply = result_envelope(&pending.payload, result);
                let event = BusEvent::new(client_topic(&pending.client), reply, "session-manager");
                let _ = bus::publish(&state.bus, event);
            }
            Err(error) => {
                self.publish_error(
                    state,
                    &pending.client,
                    Some(job_id),
                    Some(&key.platform),
                    &error,
                );
            }
        }
    }

    /// Deliver outcomes recorded by consumers in other processes. Only ids
    /// this process holds pending are looked up, so a record belonging to
    /// another gateway's client is left for that gateway to take.
    fn collect_recorded_results(&self, state: &mut SessionManagerState) {
        let lookups: Vec<(SessionKey, String)> = state
            .sessions
            .iter()
            .flat_map(|(key, entry)| entry.pending.keys().map(move |id| (key.clone(), id.clone())))
            .collect();

        for (key, job_id) in lookups {
            match state.queue.take_result(&job_id) {
                Ok(Some(JobOutcome::Success(result))) => {
                    debug!(session = %key, job_id = %job_id, "recorded result collected");
                    self.complete_job(&key, &job_id, Ok(result), state);
                }
                Ok(Some(JobOutcome::Failure(reason))) => {
                    debug!(session = %key, job_id = %job_id, "recorded failure collected");
                    self.complete_job(
                        &key,
                        &job_id,
                        Err(DispatchError::PlatformExecutionError(reason)),
                        state,
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "result record poll failed"),
            }
        }
    }

    /// Ready/Busy -> Draining -> Terminated. Pending jobs fail with
    /// SessionTerminated, each answered to its own client; then the worker
    /// is released and the key returns to Absent.
    fn terminate_session(&self, key: &SessionKey, reason: &str, state: &mut SessionManagerState) {
        let Some(mut entry) = state.sessions.remove(key) else {
            return;
        };

        entry.state = SessionState::Draining;
        info!(session = %key, reason, pending = entry.pending.len(), "session draining");

        let error = DispatchError::SessionTerminated(reason.to_string());
        for (job_id, pending) in entry.pending.drain() {
            self.publish_error(
                state,
                &pending.client,
                Some(&job_id),
                Some(&key.platform),
                &error,
            );
        }

        entry.state = SessionState::Terminated;
        entry.worker.stop(Some(reason.to_string()));
        info!(session = %key, "session terminated");
    }

    /// Unexpected worker exit: fail pending jobs with WorkerCrashed and
    /// drop the entry so the next job starts fresh.
    fn reap_crashed_worker(
        &self,
        worker_id: ractor::ActorId,
        reason: &str,
        state: &mut SessionManagerState,
    ) {
        let Some(key) = state
            .sessions
            .iter()
            .find(|(_, entry)| entry.worker_id == worker_id)
            .map(|(key, _)| key.clone())
        else {
            return;
        };

        let Some(mut entry) = state.sessions.remove(&key) else {
            return;
        };
        warn!(session = %key, reason, pending = entry.pending.len(), "worker crashed");

        let error = DispatchError::WorkerCrashed(reason.to_string());
        for (job_id, pending) in entry.pending.drain() {
            self.publish_error(
                state,
                &pending.client,
                Some(&job_id),
                Some(&key.platform),
                &error,
            );
        }
    }

    fn unregister_client(&self, client: ClientRef, state: &mut SessionManagerState) {
        let Some(actor) = state.clients.remove(&client) else {
            return;
        };
        debug!(client = %client, actor = %actor, "client unregistered");

        let actor_still_connected = state.clients.values().any(|a| *a == actor);
        if actor_still_connected {
            return;
        }

        let keys: Vec<SessionKey> = state
            .sessions
            .keys()
            .filter(|key| key.actor == actor)
            .cloned()
            .collect();
        for key in keys {
            self.terminate_session(&key, "client disconnected", state);
        }
    }

    /// Periodic housekeeping: expired queue claims become claimable again,
    /// and sessions idle past the threshold with nothing pending are
    /// reaped. A subsequent job creates a fresh session rather than
    /// reusing a handle to the dead worker.
    fn sweep(&self, state: &mut SessionManagerState) {
        match state.queue.requeue_expired() {
            Ok(0) => {}
            Ok(n) => info!(requeued = n, "released expired job claims"),
            Err(e) => warn!(error = %e, "expired-claim sweep failed"),
        }

        // Outcome records nobody took within the idle horizon belong to
        // clients that are gone.
        if let Err(e) = state.queue.purge_results(state.idle_timeout) {
            warn!(error = %e, "stale-result purge failed");
        }

        let idle_keys: Vec<SessionKey> = state
            .sessions
            .iter()
            .filter(|(_, entry)| {
                entry.state == SessionState::Ready
                    && entry.pending.is_empty()
                    && entry.last_activity.elapsed() >= state.idle_timeout
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in idle_keys {
            self.terminate_session(&key, "idle timeout", state);
        }
    }

    fn publish_error(
        &self,
        state: &SessionManagerState,
        client: &ClientRef,
        id: Option<&str>,
        context: Option<&str>,
        error: &DispatchError,
    ) {
        let envelope = error_envelope(id, context, &ErrorObject::from(error));
        let event = BusEvent::new(client_topic(client), envelope, "session-manager");
        let _ = bus::publish(&state.bus, event);
    }
}
