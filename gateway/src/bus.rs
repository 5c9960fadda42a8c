//! EventBusActor - pub/sub delivery plane using ractor Process Groups.
//!
//! Routes outbound envelopes to client connections: directed replies go to
//! `client.<id>` topics, unsolicited platform events fan out on
//! `actor.<id>` topics so every connection a given actor has open receives
//! them. Topic membership is handled by `ractor::pg`, so there is no custom
//! subscriber bookkeeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{cast, Actor, ActorProcessingErr, ActorRef};
use serde::{Deserialize, Serialize};

use shared_types::{ActorId, ClientRef};

/// Topic carrying directed replies for one client connection.
pub fn client_topic(client: &ClientRef) -> String {
    format!("client.{client}")
}

/// Topic carrying unsolicited events for every connection of one actor.
pub fn actor_topic(actor: &ActorId) -> String {
    format!("actor.{actor}")
}

/// One delivery on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    /// Unique event identifier (ULID).
    pub id: String,

    /// Hierarchical routing topic, e.g. "client.01J....".
    pub topic: String,

    /// The outbound envelope.
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    /// Originating component, for tracing.
    pub source: String,
}

impl BusEvent {
    pub fn new(
        topic: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

/// Messages handled by EventBusActor.
#[derive(Debug)]
pub enum BusMsg {
    /// Publish an event to its topic (and matching wildcard topics).
    Publish { event: BusEvent },

    /// Subscribe an actor to a topic.
    Subscribe {
        topic: String,
        subscriber: ActorRef<BusEvent>,
    },

    /// Unsubscribe an actor from a topic.
    Unsubscribe {
        topic: String,
        subscriber: ActorRef<BusEvent>,
    },
}

#[derive(Debug, Default)]
pub struct EventBusActor;

#[async_trait]
impl Actor for EventBusActor {
    type Msg = BusMsg;
    type State = ();
    type Arguments = ();

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "EventBusActor starting");
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BusMsg::Publish { event } => {
                tracing::debug!(
                    event_id = %event.id,
                    topic = %event.topic,
                    source = %event.source,
                    "publishing event"
                );
                self.broadcast_to_topic(&event.topic, &event);
                self.broadcast_to_wildcards(&event);
            }
            BusMsg::Subscribe { topic, subscriber } => {
                ractor::pg::join(topic.clone(), vec![subscriber.get_cell()]);
                tracing::debug!(
                    topic = %topic,
                    subscriber = %subscriber.get_id(),
                    "subscribed"
                );
            }
            BusMsg::Unsubscribe { topic, subscriber } => {
                ractor::pg::leave(topic.clone(), vec![subscriber.get_cell()]);
                tracing::debug!(
                    topic = %topic,
                    subscriber = %subscriber.get_id(),
                    "unsubscribed"
                );
            }
        }
        Ok(())
    }
}

impl EventBusActor {
    fn broadcast_to_topic(&self, topic: &str, event: &BusEvent) {
        let members = ractor::pg::get_members(&topic.to_string());
        for member in members {
            let actor_id = member.get_id();
            let subscriber: ActorRef<BusEvent> = member.into();
            if let Err(e) = cast!(subscriber, event.clone()) {
                tracing::warn!(
                    topic = %topic,
                    subscriber = %actor_id,
                    error = %e,
                    "failed to deliver event to subscriber"
                );
            }
        }
    }

    fn broadcast_to_wildcards(&self, event: &BusEvent) {
        let parts: Vec<&str> = event.topic.split('.').collect();
        for i in 1..parts.len() {
            let wildcard_topic = format!("{}.*", parts[..i].join("."));
            self.broadcast_to_topic(&wildcard_topic, event);
        }
        self.broadcast_to_topic("*", event);
    }
}

/// Convenience function to publish an event.
pub fn publish(
    bus: &ActorRef<BusMsg>,
    event: BusEvent,
) -> Result<(), ractor::RactorErr<BusMsg>> {
    cast!(bus, BusMsg::Publish { event })
}

/// Convenience function to subscribe to a topic.
pub fn subscribe(
    bus: &ActorRef<BusMsg>,
    topic: impl Into<String>,
    subscriber: ActorRef<BusEvent>,
) -> Result<(), ractor::RactorErr<BusMsg>> {
    cast!(
        bus,
        BusMsg::Subscribe {
            topic: topic.into(),
            subscriber,
        }
    )
}

/// Convenience function to leave a topic.
pub fn unsubscribe(
    bus: &ActorRef<BusMsg>,
    topic: impl Into<String>,
    subscriber: ActorRef<BusEvent>,
) -> Result<(), ractor::RactorErr<BusMsg>> {
    cast!(
        bus,
        BusMsg::Unsubscribe {
            topic: topic.into(),
            subscriber,
        }
    )
}
