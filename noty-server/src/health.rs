//! Health check aggregator.
//!
//! A direct port of the original's `pkg/health`: named providers, each
//! optionally critical, polled concurrently; overall status is `Down` only
//! if a *critical* provider reports down.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Health {
    pub fn up() -> Self {
        Health { status: Status::Up, reason: None }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Health { status: Status::Down, reason: Some(reason.into()) }
    }
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub status: Status,
    pub details: HashMap<String, Health>,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn check(&self) -> Health;
}

struct ProviderHolder {
    provider: Arc<dyn Provider>,
    critical: bool,
    enabled: bool,
}

#[derive(Default)]
pub struct Checker {
    providers: RwLock<HashMap<String, ProviderHolder>>,
}

impl Checker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, critical: bool, provider: Arc<dyn Provider>) {
        self.providers.write().insert(
            name.into(),
            ProviderHolder { provider, critical, enabled: true },
        );
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) {
        if let Some(holder) = self.providers.write().get_mut(name) {
            holder.enabled = enabled;
        }
    }

    pub async fn check(&self) -> Response {
        let snapshot: Vec<(String, Option<Arc<dyn Provider>>, bool)> = {
            let providers = self.providers.read();
            providers
                .iter()
                .map(|(name, holder)| {
                    (
                        name.clone(),
                        holder.enabled.then(|| holder.provider.clone()),
                        holder.critical,
                    )
                })
                .collect()
        };

        let mut details = HashMap::with_capacity(snapshot.len());
        let mut critical_down = false;

        let checks = snapshot.into_iter().map(|(name, provider, critical)| async move {
            let health = match provider {
                Some(p) => p.check().await,
                None => Health { status: Status::Disabled, reason: None },
            };
            (name, health, critical)
        });
        for (name, health, critical) in futures::future::join_all(checks).await {
            if health.status == Status::Down && critical {
                critical_down = true;
            }
            details.insert(name, health);
        }

        Response {
            status: if critical_down { Status::Down } else { Status::Up },
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Health);

    #[async_trait::async_trait]
    impl Provider for Fixed {
        async fn check(&self) -> Health {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn disabled_provider_does_not_affect_overall_status() {
        let checker = Checker::new();
        checker.register("broker", false, Arc::new(Fixed(Health::up())));
        checker.set_enabled("broker", false);
        let response = checker.check().await;
        assert_eq!(response.details["broker"].status, Status::Disabled);
        assert_eq!(response.status, Status::Up);
    }

    #[tokio::test]
    async fn down_non_critical_provider_leaves_overall_status_up() {
        let checker = Checker::new();
        checker.register("mail", false, Arc::new(Fixed(Health::down("smtp unreachable"))));
        let response = checker.check().await;
        assert_eq!(response.status, Status::Up);
        assert_eq!(response.details["mail"].status, Status::Down);
    }

    #[tokio::test]
    async fn down_critical_provider_flips_overall_status_down() {
        let checker = Checker::new();
        checker.register("catalog", true, Arc::new(Fixed(Health::down("disk full"))));
        checker.register("mail", false, Arc::new(Fixed(Health::up())));
        let response = checker.check().await;
        assert_eq!(response.status, Status::Down);
    }
}
