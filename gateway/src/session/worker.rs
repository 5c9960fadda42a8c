//! PlatformSessionActor - the dedicated worker behind one (actor, platform)
//! session.
//!
//! Each worker owns the live platform plugin invocation loop for its
//! channel: it polls the durable queue, executes one job at a time in claim
//! order (which preserves per-session FIFO), records terminal outcomes, and
//! reports results back to the SessionManager. Unsolicited platform events
//! flow through the emitter channel injected into the plugin's session
//! context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::platform::{PlatformDescriptor, SessionContext};
use crate::queue::{JobOutcome, JobQueue};
use crate::session::{SessionKey, SessionManagerMsg};

pub struct PlatformSessionArguments {
    pub key: SessionKey,
    pub descriptor: Arc<PlatformDescriptor>,
    pub credentials: Option<Value>,
    pub queue: Arc<JobQueue>,
    pub manager: ActorRef<SessionManagerMsg>,
    pub poll_interval: Duration,
}

pub struct PlatformSessionState {
    key: SessionKey,
    descriptor: Arc<PlatformDescriptor>,
    context: SessionContext,
    queue: Arc<JobQueue>,
    manager: ActorRef<SessionManagerMsg>,
    channel: String,
}

#[derive(Debug)]
pub enum PlatformSessionMsg {
    /// Poll the queue channel and run any claimable jobs.
    Tick,
}

#[derive(Debug, Default)]
pub struct PlatformSessionActor;

#[async_trait]
impl Actor for PlatformSessionActor {
    type Msg = PlatformSessionMsg;
    type State = PlatformSessionState;
    type Arguments = PlatformSessionArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(
            session = %args.key,
            actor_id = %myself.get_id(),
            "platform session starting"
        );

        // Unsolicited events from the plugin are forwarded to the manager,
        // which fans them out to every client of this actor.
        let (emitter, mut events) = mpsc::unbounded_channel::<Value>();
        let manager = args.manager.clone();
        let event_key = args.key.clone();
        tokio::spawn(async move {
            while let Some(payload) = events.recv().await {
                let forward = manager.cast(SessionManagerMsg::PlatformEvent {
                    key: event_key.clone(),
                    payload,
                });
                if forward.is_err() {
                    break;
                }
            }
        });

        let tick_ref = myself.clone();
        let interval = args.poll_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tick_ref.cast(PlatformSessionMsg::Tick).is_err() {
                    break;
                }
            }
        });

        let context = SessionContext {
            actor: args.key.actor.clone(),
            platform: args.key.platform.clone(),
            credentials: args.credentials,
            emitter,
        };

        let channel = args.key.channel();
        let state = PlatformSessionState {
            key: args.key,
            descriptor: args.descriptor,
            context,
            queue: args.queue,
            manager: args.manager,
            channel,
        };

        let _ = state.manager.cast(SessionManagerMsg::SessionReady {
            key: state.key.clone(),
        });

        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PlatformSessionMsg::Tick => self.drain_channel(state).await,
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.descriptor.plugin.cleanup(&state.context).await;
        info!(session = %state.key, "platform session stopped");
        Ok(())
    }
}

impl PlatformSessionActor {
    /// Claim and execute jobs until the channel is empty. Claims arrive in
    /// enqueue order; one job runs at a time.
    async fn drain_channel(&self, state: &mut PlatformSessionState) {
        loop {
            let job = match state.queue.claim(&state.channel) {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    warn!(session = %state.key, error = %e, "queue claim failed");
                    return;
                }
            };

            debug!(
                session = %state.key,
                job_id = %job.id,
                verb = %job.verb,
                attempt = job.attempt,
                "executing job"
            );

            let outcome = state.descriptor.plugin.invoke(&job, &state.context).await;

            // Success and platform failure are both terminal outcomes; only
            // a crash leaves the claim to expire and be redelivered. The
            // recorded outcome is how the reply reaches the client when the
            // process holding its connection is not this one.
            let record = match &outcome {
                Ok(result) => JobOutcome::Success(result.clone()),
                Err(e) => JobOutcome::Failure(e.to_string()),
            };
            if let Err(e) = state.queue.complete(&job.id, &record) {
                warn!(session = %state.key, job_id = %job.id, error = %e, "completion record failed");
            }

            let report = match outcome {
                Ok(result) => SessionManagerMsg::JobDone {
                    key: state.key.clone(),
                    job_id: job.id.clone(),
                    result,
                },
                Err(e) => SessionManagerMsg::JobFailed {
                    key: state.key.clone(),
                    job_id: job.id.clone(),
                    error: crate::error::DispatchError::PlatformExecutionError(e.to_string()),
                },
            };

            if state.manager.cast(report).is_err() {
                warn!(session = %state.key, job_id = %job.id, "manager unreachable");
                return;
            }
        }
    }
}
