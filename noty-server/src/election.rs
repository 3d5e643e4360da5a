//! Leader election over a lease-style row in the shared catalog (§4.4).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, LeaseOutcome};
use crate::wire::PeerId;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const LEASE_TTL_SECS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower { holder: String },
}

pub struct LeaderElection {
    key: String,
    self_id: PeerId,
    catalog: Arc<Catalog>,
    tx: watch::Sender<Role>,
}

impl LeaderElection {
    pub fn new(key: impl Into<String>, self_id: PeerId, catalog: Arc<Catalog>) -> Arc<Self> {
        let (tx, _rx) = watch::channel(Role::Follower { holder: String::new() });
        Arc::new(LeaderElection { key: key.into(), self_id, catalog, tx })
    }

    /// Subscribers are notified of every role transition, the idiomatic
    /// async-Rust stand-in for the spec's "registered callbacks".
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Role {
        self.tx.borrow().clone()
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    fn tick(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let outcome = self.catalog.upsert_lease(&self.key, self.self_id.as_str(), now, LEASE_TTL_SECS);
        let role = match outcome {
            Ok(LeaseOutcome::Leader) => Role::Leader,
            Ok(LeaseOutcome::Follower { holder }) => Role::Follower { holder },
            Err(e) => {
                tracing::warn!("leader election tick for '{}' failed: {e}", self.key);
                return;
            }
        };
        if role != *self.tx.borrow() {
            tracing::info!("leader election '{}': now {:?}", self.key, role);
        }
        let _ = self.tx.send_if_modified(|current| {
            if *current != role {
                *current = role.clone();
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_candidate_always_wins() {
        let catalog = Catalog::open(":memory:").unwrap();
        let election = LeaderElection::new("workflow-engine", PeerId("node-a".into()), Arc::new(catalog));
        election.tick();
        assert_eq!(election.current(), Role::Leader);
    }

    #[test]
    fn second_candidate_follows() {
        let catalog = Arc::new(Catalog::open(":memory:").unwrap());
        let a = LeaderElection::new("workflow-engine", PeerId("node-a".into()), catalog.clone());
        let b = LeaderElection::new("workflow-engine", PeerId("node-b".into()), catalog);
        a.tick();
        b.tick();
        assert_eq!(a.current(), Role::Leader);
        assert_eq!(b.current(), Role::Follower { holder: "node-a".into() });
    }
}
