//! sysdb - replicated system database for a distributed storage cluster.
//!
//! A small set of replicas keeps a consistent view of which storage engines
//! ("members") belong to the system and in what state, where each pool
//! service is hosted, and the fault domain topology used for placement.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Membership: join rules | state updates | failure handling  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Database: leader-only serving | leadership | pool locks    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SystemFsm: replicated apply | snapshot | restore           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data model: members | pools | fault domain tree | ranks    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The consensus algorithm is outside this crate: a substrate implementing
//! [`raft::RaftService`] drives [`sysdb::SystemFsm`] with committed entries.
//! [`raft::LocalRaft`] is an in-process substrate for a single replica.
//!
//! # Quick Start
//!
//! ```no_run
//! use sysdb::config::SysdbConfig;
//! use sysdb::Node;
//!
//! #[tokio::main]
//! async fn main() -> sysdb::Result<()> {
//!     let config = SysdbConfig::development();
//!     sysdb::observability::init(&config.observability)?;
//!
//!     let node = Node::start(config)?;
//!     println!("map version {}", node.database.cur_map_version()?);
//!     node.shutdown().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod faultdomain;
pub mod member;
pub mod membership;
pub mod observability;
pub mod pool;
pub mod raft;
pub mod ranks;
pub mod sysdb;

// Re-exports
pub use error::{Result, SysdbError};
pub use membership::{JoinRequest, JoinResponse, Membership};
pub use sysdb::Database;

use config::SysdbConfig;
use events::{EventBus, DEFAULT_EVENT_BUFFER};
use raft::{LocalRaft, RaftLogFilter};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A running system database node.
pub struct Node {
    pub database: Arc<Database>,
    pub membership: Arc<Membership>,
    pub events: Arc<EventBus>,
    raft: Option<Arc<LocalRaft>>,
    subscriptions: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a node from `config`.
    ///
    /// A replica starts an in-process consensus service and the bootstrap
    /// replica takes leadership. Must be called within a tokio runtime.
    pub fn start(config: SysdbConfig) -> Result<Self> {
        config.validate()?;
        info!(
            node = %config.node.name,
            system = %config.database.system_name,
            "Starting system database node"
        );

        let database = Arc::new(Database::new(config.database.clone()));
        let raft = match database.replica_addr() {
            Ok(addr) => {
                let filter = RaftLogFilter::new(config.database.suppressed_log_messages.clone());
                let (raft, leader_rx) = LocalRaft::new(addr, database.fsm(), filter);
                database.start(raft.clone(), leader_rx)?;
                if database.is_bootstrap() {
                    raft.bootstrap()?;
                }
                Some(raft)
            }
            Err(_) => None,
        };

        let membership = Arc::new(Membership::new(database.clone()));
        let events = EventBus::new(DEFAULT_EVENT_BUFFER);
        let subscriptions = vec![
            events.subscribe(database.clone()),
            events.subscribe(membership.clone()),
        ];

        Ok(Self {
            database,
            membership,
            events,
            raft,
            subscriptions,
        })
    }

    /// The in-process consensus service, if this node is a replica.
    pub fn raft(&self) -> Option<&Arc<LocalRaft>> {
        self.raft.as_ref()
    }

    /// Stop event delivery and the database.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down system database node");
        self.events.close();
        for handle in self.subscriptions {
            if let Err(e) = handle.await {
                error!(error = %e, "Event subscription task failed");
            }
        }
        self.database.stop().await
    }
}
