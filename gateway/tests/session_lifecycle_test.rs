//! Session lifecycle: reuse, idle teardown, crash recovery, disconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use gateway::bus::{self, actor_topic, client_topic, BusEvent};
use gateway::config::Config;
use gateway::platform::{
    DummyPlatform, PlatformConfig, PlatformError, PlatformPlugin, PlatformSchema, SessionContext,
};
use gateway::queue::JobOutcome;
use gateway::session::{SessionKey, SessionManagerMsg};
use gateway::Gateway;
use shared_types::{ActorId, ClientRef, Job};

struct Collector;

#[async_trait]
impl Actor for Collector {
    type Msg = BusEvent;
    type State = mpsc::UnboundedSender<BusEvent>;
    type Arguments = mpsc::UnboundedSender<BusEvent>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = state.send(message);
        Ok(())
    }
}

async fn listen_topic(gateway: &Gateway, topic: String) -> mpsc::UnboundedReceiver<BusEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (collector, _) = Actor::spawn(None, Collector, tx).await.unwrap();
    bus::subscribe(&gateway.bus, topic, collector).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    rx
}

async fn listen(gateway: &Gateway, client: &ClientRef) -> mpsc::UnboundedReceiver<BusEvent> {
    listen_topic(gateway, client_topic(client)).await
}

async fn next_reply(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("bus channel closed")
        .payload
}

fn echo_message(id: &str, content: &str) -> String {
    json!({
        "id": id,
        "context": "dummy",
        "type": "echo",
        "actor": { "id": "bob@example.org", "type": "person" },
        "object": { "type": "message", "content": content },
    })
    .to_string()
}

#[tokio::test]
async fn test_session_is_reused_across_jobs() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(DummyPlatform::new())])
        .await
        .unwrap();
    let client = ClientRef::generate();
    let mut rx = listen(&gateway, &client).await;

    for i in 1..=3 {
        gateway
            .dispatcher
            .ingest(&client, &echo_message(&format!("m{i}"), "x"))
            .unwrap();
        next_reply(&mut rx).await;
    }

    let sessions = gateway.snapshot().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].platform, "dummy");
    assert_eq!(sessions[0].actor_id, "bob@example.org");
    assert_eq!(sessions[0].pending_jobs, 0);
    assert_eq!(sessions[0].state, "ready");

    gateway.shutdown();
}

#[tokio::test]
async fn test_idle_session_reaped_and_recreated() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        session_idle_timeout: Duration::from_millis(100),
        session_sweep_interval: Duration::from_millis(50),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(DummyPlatform::new())])
        .await
        .unwrap();
    let client = ClientRef::generate();
    let mut rx = listen(&gateway, &client).await;

    gateway
        .dispatcher
        .ingest(&client, &echo_message("m1", "x"))
        .unwrap();
    next_reply(&mut rx).await;
    assert_eq!(gateway.snapshot().await.unwrap().len(), 1);

    // Past the idle timeout the sweep tears the session down.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(gateway.snapshot().await.unwrap().is_empty());

    // The next job gets a fresh session transparently.
    gateway
        .dispatcher
        .ingest(&client, &echo_message("m2", "again"))
        .unwrap();
    let reply = next_reply(&mut rx).await;
    assert_eq!(reply["id"], json!("m2"));
    assert_eq!(reply["object"]["content"], json!("again"));

    gateway.shutdown();
}

#[tokio::test]
async fn test_client_disconnect_tears_down_sessions() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(DummyPlatform::new())])
        .await
        .unwrap();
    let client = ClientRef::generate();
    let mut rx = listen(&gateway, &client).await;

    gateway
        .dispatcher
        .ingest(&client, &echo_message("m1", "x"))
        .unwrap();
    next_reply(&mut rx).await;
    assert_eq!(gateway.snapshot().await.unwrap().len(), 1);

    gateway
        .manager
        .cast(SessionManagerMsg::UnregisterClient {
            client: client.clone(),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(gateway.snapshot().await.unwrap().is_empty());

    gateway.shutdown();
}

/// Takes its time over every job, so tests can disconnect while a job is
/// still pending.
struct SlowPlatform;

#[async_trait]
impl PlatformPlugin for SlowPlatform {
    fn id(&self) -> &str {
        "slow"
    }

    fn schema(&self) -> PlatformSchema {
        PlatformSchema {
            name: "slow".to_string(),
            version: "1.0.0".to_string(),
            messages: json!({
                "type": "object",
                "properties": {
                    "type": { "enum": ["echo", "credentials"] },
                },
            }),
            credentials: None,
        }
    }

    fn config(&self) -> PlatformConfig {
        PlatformConfig {
            persist: true,
            require_credentials: false,
        }
    }

    async fn invoke(&self, _job: &Job, _session: &SessionContext) -> Result<Value, PlatformError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(json!({ "type": "message", "content": "late" }))
    }
}

#[tokio::test]
async fn test_disconnect_fails_pending_jobs_with_session_terminated() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(SlowPlatform)])
        .await
        .unwrap();
    let client = ClientRef::generate();
    let mut rx = listen(&gateway, &client).await;

    let slow = json!({
        "id": "m-slow",
        "context": "slow",
        "type": "echo",
        "actor": { "id": "bob@example.org", "type": "person" },
    });
    gateway
        .dispatcher
        .ingest(&client, &slow.to_string())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let disconnect = json!({
        "id": "m-bye",
        "context": "slow",
        "type": "disconnect",
        "actor": { "id": "bob@example.org", "type": "person" },
    });
    gateway
        .dispatcher
        .ingest(&client, &disconnect.to_string())
        .unwrap();

    // Two replies, in either order: the pending job's failure and the
    // disconnect ack.
    let mut replies = vec![next_reply(&mut rx).await, next_reply(&mut rx).await];
    replies.sort_by_key(|r| r["id"].as_str().unwrap_or_default().to_string());

    assert_eq!(replies[0]["id"], json!("m-bye"));
    assert_eq!(replies[0]["type"], json!("disconnect"));
    assert_eq!(replies[1]["id"], json!("m-slow"));
    assert_eq!(replies[1]["object"]["code"], json!("SESSION_TERMINATED"));

    assert!(gateway.snapshot().await.unwrap().is_empty());

    gateway.shutdown();
}

/// Echoes like the dummy platform, but panics on the "crash" verb to
/// simulate a worker dying mid-session.
struct CrashyPlatform;

#[async_trait]
impl PlatformPlugin for CrashyPlatform {
    fn id(&self) -> &str {
        "crashy"
    }

    fn schema(&self) -> PlatformSchema {
        PlatformSchema {
            name: "crashy".to_string(),
            version: "1.0.0".to_string(),
            messages: json!({
                "type": "object",
                "properties": {
                    "type": { "enum": ["echo", "crash", "credentials"] },
                },
            }),
            credentials: None,
        }
    }

    fn config(&self) -> PlatformConfig {
        PlatformConfig {
            persist: false,
            require_credentials: false,
        }
    }

    async fn invoke(&self, job: &Job, _session: &SessionContext) -> Result<Value, PlatformError> {
        match job.verb.as_str() {
            "echo" => Ok(json!({ "type": "message", "content": "ok" })),
            _ => panic!("simulated platform crash"),
        }
    }
}

#[tokio::test]
async fn test_worker_crash_fails_pending_jobs_and_recovers() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(CrashyPlatform)])
        .await
        .unwrap();
    let client = ClientRef::generate();
    let mut rx = listen(&gateway, &client).await;

    let crash = json!({
        "id": "m-crash",
        "context": "crashy",
        "type": "crash",
        "actor": { "id": "bob@example.org", "type": "person" },
    });
    let queued = json!({
        "id": "m-queued",
        "context": "crashy",
        "type": "echo",
        "actor": { "id": "bob@example.org", "type": "person" },
    });
    gateway
        .dispatcher
        .ingest(&client, &crash.to_string())
        .unwrap();
    gateway
        .dispatcher
        .ingest(&client, &queued.to_string())
        .unwrap();

    // Both pending jobs fail, each answered to the client, in either order.
    let mut failed_ids = vec![];
    for _ in 0..2 {
        let reply = next_reply(&mut rx).await;
        assert_eq!(reply["object"]["code"], json!("WORKER_CRASHED"));
        failed_ids.push(reply["id"].as_str().unwrap_or_default().to_string());
    }
    failed_ids.sort();
    assert_eq!(failed_ids, vec!["m-crash", "m-queued"]);

    // The crashed session is gone; a fresh one serves the next job.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.snapshot().await.unwrap().is_empty());

    let echo = json!({
        "id": "m-next",
        "context": "crashy",
        "type": "echo",
        "actor": { "id": "bob@example.org", "type": "person" },
    });
    gateway
        .dispatcher
        .ingest(&client, &echo.to_string())
        .unwrap();
    let reply = next_reply(&mut rx).await;
    assert_eq!(reply["id"], json!("m-next"));
    assert_eq!(reply["object"]["content"], json!("ok"));

    gateway.shutdown();
}

#[tokio::test]
async fn test_redelivered_completion_reaches_client_once() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(DummyPlatform::new())])
        .await
        .unwrap();
    let client = ClientRef::generate();
    let mut rx = listen(&gateway, &client).await;

    gateway
        .dispatcher
        .ingest(&client, &echo_message("m1", "once"))
        .unwrap();
    let reply = next_reply(&mut rx).await;
    assert_eq!(reply["id"], json!("m1"));
    assert_eq!(reply["object"]["content"], json!("once"));

    // A visibility-timeout redelivery makes the worker report the same job
    // a second time; the manager must not answer the client again.
    let key = SessionKey::new(ActorId::from("bob@example.org"), "dummy");
    gateway
        .manager
        .cast(SessionManagerMsg::JobDone {
            key,
            job_id: "m1".to_string(),
            result: json!({ "type": "message", "content": "again" }),
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    gateway.shutdown();
}

#[tokio::test]
async fn test_outcome_recorded_elsewhere_reaches_waiting_client() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(SlowPlatform)])
        .await
        .unwrap();
    let client = ClientRef::generate();
    let mut rx = listen(&gateway, &client).await;

    // The first job occupies the local worker for its full duration, so the
    // second sits unclaimed on the channel.
    let busy = json!({
        "id": "m-busy",
        "context": "slow",
        "type": "echo",
        "actor": { "id": "bob@example.org", "type": "person" },
    });
    gateway
        .dispatcher
        .ingest(&client, &busy.to_string())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let waiting = json!({
        "id": "m-remote",
        "context": "slow",
        "type": "echo",
        "actor": { "id": "bob@example.org", "type": "person" },
    });
    gateway
        .dispatcher
        .ingest(&client, &waiting.to_string())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A consumer in another gateway process claims the waiting job and
    // records its outcome; no in-process report ever happens for it.
    let claimed = gateway
        .queue
        .claim("slow:bob@example.org")
        .unwrap()
        .expect("second job should be claimable");
    assert_eq!(claimed.id, "m-remote");
    gateway
        .queue
        .complete(
            &claimed.id,
            &JobOutcome::Success(json!({ "type": "message", "content": "relayed" })),
        )
        .unwrap();

    // The manager's result poll picks the record up and answers the client.
    let reply = next_reply(&mut rx).await;
    assert_eq!(reply["id"], json!("m-remote"));
    assert_eq!(reply["object"]["content"], json!("relayed"));

    gateway.shutdown();
}

/// Pushes an unsolicited event toward the actor's clients while handling a
/// job, like an incoming chat message arriving mid-command.
struct ChattyPlatform;

#[async_trait]
impl PlatformPlugin for ChattyPlatform {
    fn id(&self) -> &str {
        "chatty"
    }

    fn schema(&self) -> PlatformSchema {
        PlatformSchema {
            name: "chatty".to_string(),
            version: "1.0.0".to_string(),
            messages: json!({
                "type": "object",
                "properties": {
                    "type": { "enum": ["echo", "credentials"] },
                },
            }),
            credentials: None,
        }
    }

    fn config(&self) -> PlatformConfig {
        PlatformConfig {
            persist: true,
            require_credentials: false,
        }
    }

    async fn invoke(&self, _job: &Job, session: &SessionContext) -> Result<Value, PlatformError> {
        session.send_to_client(json!({
            "type": "message",
            "context": "chatty",
            "content": "incoming",
        }));
        Ok(json!({ "type": "message", "content": "handled" }))
    }
}

#[tokio::test]
async fn test_unsolicited_event_fans_out_to_every_actor_connection() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(ChattyPlatform)])
        .await
        .unwrap();
    let client = ClientRef::generate();
    let mut rx = listen(&gateway, &client).await;

    // Two connections of the same actor, both on the fan-out topic.
    let actor = ActorId::from("bob@example.org");
    let mut first_rx = listen_topic(&gateway, actor_topic(&actor)).await;
    let mut second_rx = listen_topic(&gateway, actor_topic(&actor)).await;

    let msg = json!({
        "id": "m1",
        "context": "chatty",
        "type": "echo",
        "actor": { "id": "bob@example.org", "type": "person" },
    });
    gateway.dispatcher.ingest(&client, &msg.to_string()).unwrap();

    let on_first = next_reply(&mut first_rx).await;
    assert_eq!(on_first["content"], json!("incoming"));
    let on_second = next_reply(&mut second_rx).await;
    assert_eq!(on_second["content"], json!("incoming"));

    // The job's own reply stays on the submitting client's topic.
    let reply = next_reply(&mut rx).await;
    assert_eq!(reply["id"], json!("m1"));
    assert_eq!(reply["object"]["content"], json!("handled"));
    assert!(first_rx.try_recv().is_err());

    gateway.shutdown();
}

#[tokio::test]
async fn test_sessions_are_isolated_per_actor() {
    let config = Config {
        queue_poll_interval: Duration::from_millis(20),
        ..Config::default()
    };
    let gateway = Gateway::start(config, vec![Arc::new(DummyPlatform::new())])
        .await
        .unwrap();

    let alice = ClientRef::generate();
    let bob = ClientRef::generate();
    let mut alice_rx = listen(&gateway, &alice).await;
    let mut bob_rx = listen(&gateway, &bob).await;

    let msg = |id: &str, actor: &str| {
        json!({
            "id": id,
            "context": "dummy",
            "type": "echo",
            "actor": { "id": actor, "type": "person" },
            "object": { "type": "message", "content": actor },
        })
        .to_string()
    };

    gateway
        .dispatcher
        .ingest(&alice, &msg("a1", "alice@example.org"))
        .unwrap();
    gateway
        .dispatcher
        .ingest(&bob, &msg("b1", "bob@example.org"))
        .unwrap();

    let alice_reply = next_reply(&mut alice_rx).await;
    assert_eq!(alice_reply["object"]["content"], json!("alice@example.org"));
    let bob_reply = next_reply(&mut bob_rx).await;
    assert_eq!(bob_reply["object"]["content"], json!("bob@example.org"));

    // One session per (actor, platform) pair.
    let sessions = gateway.snapshot().await.unwrap();
    assert_eq!(sessions.len(), 2);

    gateway.shutdown();
}
