// Member and pool builders for integration tests

use std::net::SocketAddr;
use uuid::Uuid;

use sysdb::faultdomain::FaultDomain;
use sysdb::member::{Member, MemberState};
use sysdb::pool::{PoolService, PoolServiceState};
use sysdb::ranks::Rank;
use sysdb::JoinRequest;

/// Control address of test host `host`.
pub fn host_addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], 10001))
}

pub fn fault_domain(s: &str) -> FaultDomain {
    s.parse().expect("Invalid fault domain")
}

/// Joined member on `host` with a fabric URI.
pub fn test_member(rank: Rank, host: u8, domain: &str) -> Member {
    Member::new(rank, Uuid::new_v4(), host_addr(host), fault_domain(domain))
        .with_state(MemberState::Joined)
        .with_fabric(format!("tcp://10.0.0.{}:31416", host), 1)
}

/// Join request for a new engine on `host`.
pub fn join_request(host: u8, domain: &str) -> JoinRequest {
    JoinRequest::new(Rank::NIL, Uuid::new_v4(), host_addr(host), fault_domain(domain))
        .with_fabric(format!("tcp://10.0.0.{}:31416", host), 1)
}

pub fn ready_pool(label: &str, replicas: &[u32]) -> PoolService {
    PoolService::new(
        Uuid::new_v4(),
        label,
        replicas.iter().copied().map(Rank).collect(),
    )
    .with_state(PoolServiceState::Ready)
}
