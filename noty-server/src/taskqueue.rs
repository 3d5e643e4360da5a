//! Optional task-queue broker adapter (§4.8), backed by `lapin`. Purely
//! advisory: §4.6 §Trigger posts a hint here so a future consumer could
//! react faster than the leader's 1s poll tick, but nothing currently
//! consumes it, and its absence must not affect correctness (§1, §9).

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};

use crate::error::Result;
use crate::health;

const EXCHANGE: &str = "opennoty.events";

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()>;
}

pub struct LapinBroker {
    channel: lapin::Channel,
}

impl LapinBroker {
    pub async fn connect(uri: &str) -> Result<Self> {
        let conn = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| crate::error::Error::Transport(format!("broker connect failed: {e}")))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| crate::error::Error::Transport(format!("broker channel failed: {e}")))?;
        channel
            .exchange_declare(EXCHANGE, ExchangeKind::Topic, ExchangeDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| crate::error::Error::Transport(format!("broker exchange declare failed: {e}")))?;
        Ok(LapinBroker { channel })
    }
}

#[async_trait]
impl BrokerClient for LapinBroker {
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(EXCHANGE, routing_key, BasicPublishOptions::default(), body, BasicProperties::default())
            .await
            .map_err(|e| crate::error::Error::Transport(format!("broker publish failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl health::Provider for LapinBroker {
    async fn check(&self) -> health::Health {
        if self.channel.status().connected() {
            health::Health::up()
        } else {
            health::Health::down("broker channel not connected")
        }
    }
}

/// Used when no broker URI is configured.
pub struct NullBroker;

#[async_trait]
impl BrokerClient for NullBroker {
    async fn publish(&self, _routing_key: &str, _body: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl health::Provider for NullBroker {
    async fn check(&self) -> health::Health {
        health::Health::down("broker not configured")
    }
}
