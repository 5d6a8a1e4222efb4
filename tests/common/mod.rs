//! Common test utilities for integration tests.

pub mod fixtures;

use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;

use sysdb::config::DatabaseConfig;
use sysdb::raft::{LocalRaft, RaftLogFilter};
use sysdb::Database;

pub use fixtures::*;

/// Control address of the single test replica.
pub fn replica_addr() -> SocketAddr {
    "127.0.0.1:10001".parse().unwrap()
}

/// A single-replica database that has taken leadership.
pub struct TestDb {
    pub db: Arc<Database>,
    pub raft: Arc<LocalRaft>,
    pub temp_dir: TempDir,
}

impl TestDb {
    /// Start a replica without taking leadership.
    pub fn follower() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let cfg = DatabaseConfig {
            replicas: vec![replica_addr()],
            control_addr: Some(replica_addr()),
            raft_dir: temp_dir.path().join("raft"),
            ..DatabaseConfig::default()
        };
        let db = Arc::new(Database::new(cfg));
        let (raft, rx) = LocalRaft::new(replica_addr(), db.fsm(), RaftLogFilter::default());
        db.start(raft.clone(), rx).expect("Failed to start database");
        Self { db, raft, temp_dir }
    }

    pub fn leader() -> Self {
        let test_db = Self::follower();
        test_db.raft.bootstrap().expect("Failed to bootstrap");
        test_db
    }
}
