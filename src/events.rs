//! Cluster events consumed by the system database.
//!
//! Engine processes report failures and pool service changes as events. The
//! [`EventBus`] fans each published event out to every subscribed
//! [`EventHandler`] on its own task, so handlers run concurrently with
//! normal request processing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default capacity of the broadcast channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Event raised somewhere in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// An engine process exited without being asked to.
    EngineDied {
        hostname: String,
        instance_idx: u32,
        rank: u32,
        incarnation: u64,
        exit_err: String,
        timestamp: DateTime<Utc>,
    },
    /// The set of ranks hosting a pool service changed.
    PoolSvcReplicasUpdate {
        hostname: String,
        pool_uuid: Uuid,
        svc_replicas: Vec<u32>,
        version: u64,
        timestamp: DateTime<Utc>,
    },
}

impl SystemEvent {
    pub fn engine_died(
        hostname: impl Into<String>,
        instance_idx: u32,
        rank: u32,
        incarnation: u64,
        exit_err: impl Into<String>,
    ) -> Self {
        SystemEvent::EngineDied {
            hostname: hostname.into(),
            instance_idx,
            rank,
            incarnation,
            exit_err: exit_err.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn pool_svc_replicas_update(
        hostname: impl Into<String>,
        pool_uuid: Uuid,
        svc_replicas: Vec<u32>,
        version: u64,
    ) -> Self {
        SystemEvent::PoolSvcReplicasUpdate {
            hostname: hostname.into(),
            pool_uuid,
            svc_replicas,
            version,
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemEvent::EngineDied { .. } => "engine_died",
            SystemEvent::PoolSvcReplicasUpdate { .. } => "pool_svc_replicas_update",
        }
    }
}

/// Receiver of cluster events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &SystemEvent);
}

/// Broadcast fan-out of [`SystemEvent`]s to subscribed handlers.
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
    shutdown: CancellationToken,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(buffer: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Arc::new(Self {
            sender,
            shutdown: CancellationToken::new(),
            published: AtomicU64::new(0),
        })
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: SystemEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(event = event.name(), "Event published");
        // No receivers is not an error: nobody is interested yet.
        let _ = self.sender.send(event);
    }

    /// Deliver every subsequently published event to `handler` on a
    /// dedicated task until the bus is closed.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let mut rx = self.sender.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => handler.on_event(&event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Event handler lagged; events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Stop all subscription tasks.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
