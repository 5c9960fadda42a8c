//! Gateway core - Activity Stream validation, dispatch, and per-actor job
//! routing.
//!
//! The pipeline: a transport hands raw frames to the [`Dispatcher`], which
//! validates them against the composed schema registry and routes accepted
//! jobs through the [`SessionManager`](session::SessionManager). Each
//! (actor, platform) pair gets one supervised worker consuming its durable
//! queue channel; results and errors travel back to clients over the
//! [`bus`]. Transports stay out of this crate: they subscribe to bus topics
//! and call [`Dispatcher::ingest`].

pub mod bus;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod platform;
pub mod queue;
pub mod schema;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef};
use tracing::info;

use shared_types::SessionSnapshot;

use crate::bus::{BusMsg, EventBusActor};
use crate::config::Config;
use crate::credentials::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore};
use crate::dispatch::Dispatcher;
use crate::platform::{PlatformPlugin, PlatformRegistry};
use crate::queue::JobQueue;
use crate::schema::SchemaRegistry;
use crate::session::{SessionManager, SessionManagerArguments, SessionManagerMsg};

/// A fully wired gateway: schema registry, platform registry, stores,
/// bus, session manager, and the dispatcher in front of them. One per
/// process.
pub struct Gateway {
    pub config: Config,
    pub schemas: Arc<SchemaRegistry>,
    pub platforms: Arc<PlatformRegistry>,
    pub credentials: Arc<dyn CredentialStore>,
    pub queue: Arc<JobQueue>,
    pub bus: ActorRef<BusMsg>,
    pub manager: ActorRef<SessionManagerMsg>,
    pub dispatcher: Dispatcher,
}

impl Gateway {
    /// Compile schemas, load platforms (fatal on meta-validation failure),
    /// open the stores, and spawn the runtime actors. The sweep ticker
    /// runs until the session manager stops.
    pub async fn start(
        config: Config,
        plugins: Vec<Arc<dyn PlatformPlugin>>,
    ) -> anyhow::Result<Self> {
        let schemas = Arc::new(SchemaRegistry::new()?);
        let platforms = Arc::new(PlatformRegistry::load(
            plugins,
            &config.platform_allow,
            &config.platform_deny,
            &schemas,
        )?);

        let queue = Arc::new(JobQueue::open(
            &config.database_path,
            config.job_visibility_timeout,
        )?);
        let credentials: Arc<dyn CredentialStore> = match config.database_path.as_str() {
            ":memory:" => Arc::new(MemoryCredentialStore::new()),
            path => Arc::new(SqliteCredentialStore::open(path)?),
        };

        let (bus, _) = Actor::spawn(None, EventBusActor, ()).await?;
        let (manager, _) = Actor::spawn(
            None,
            SessionManager,
            SessionManagerArguments {
                registry: platforms.clone(),
                credentials: credentials.clone(),
                queue: queue.clone(),
                bus: bus.clone(),
                idle_timeout: config.session_idle_timeout,
                poll_interval: config.queue_poll_interval,
            },
        )
        .await?;

        let sweeper = manager.clone();
        let sweep_interval = config.session_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sweeper.cast(SessionManagerMsg::Sweep).is_err() {
                    break;
                }
            }
        });

        let dispatcher = Dispatcher::new(
            schemas.clone(),
            platforms.clone(),
            credentials.clone(),
            manager.clone(),
            bus.clone(),
        );

        info!(
            platforms = ?platforms.ids(),
            database = %config.database_path,
            "gateway started"
        );

        Ok(Self {
            config,
            schemas,
            platforms,
            credentials,
            queue,
            bus,
            manager,
            dispatcher,
        })
    }

    /// Point-in-time view of all live sessions.
    pub async fn snapshot(&self) -> anyhow::Result<Vec<SessionSnapshot>> {
        let result = self
            .manager
            .call(
                |reply| SessionManagerMsg::Snapshot { reply },
                Some(Duration::from_secs(5)),
            )
            .await
            .map_err(|e| anyhow::anyhow!("snapshot call: {e}"))?;
        match result {
            CallResult::Success(snapshots) => Ok(snapshots),
            CallResult::Timeout => Err(anyhow::anyhow!("snapshot call timed out")),
            CallResult::SenderError => {
                Err(anyhow::anyhow!("session manager dropped the snapshot reply"))
            }
        }
    }

    /// Stop the runtime actors. Sessions drain through the manager's stop
    /// path; pending jobs stay in the durable queue.
    pub fn shutdown(&self) {
        self.manager.stop(None);
        self.bus.stop(None);
    }
}
