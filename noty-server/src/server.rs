//! Orchestration: wires the catalog, mesh, election, pub/sub, workflow
//! engine and HTTP surface together, and runs them under one cancellation
//! token (§5).
//!
//! Grounded on the teacher's `Server::{new,run}` — build collaborators,
//! spawn their background loops, bind the HTTP listeners, then wait on a
//! shutdown signal — generalized from the teacher's single-listener IRC
//! server to this crate's multi-task cluster node.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::config::ServerConfig;
use crate::directory::{self, PeerDirectory};
use crate::election::LeaderElection;
use crate::error::Result;
use crate::mail::{MailSender, NullMailSender, SmtpMailSender};
use crate::notify::NotificationFacade;
use crate::pubsub::PubSub;
use crate::session::{Acl, PermissiveAcl};
use crate::taskqueue::{BrokerClient, LapinBroker, NullBroker};
use crate::template::Templates;
use crate::web::{self, AppState};
use crate::workflow::WorkflowEngine;

pub struct Server {
    config: ServerConfig,
    acl: Arc<dyn Acl>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server { config, acl: Arc::new(PermissiveAcl) }
    }

    /// Overrides the default permissive ACL, e.g. for tests or deployments
    /// with their own authorization interceptor.
    pub fn with_acl(config: ServerConfig, acl: Arc<dyn Acl>) -> Self {
        Server { config, acl }
    }

    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let catalog = Arc::new(Catalog::open(&self.config.catalog_path)?);

        let advertise_addr = self
            .config
            .peer_notify_address
            .clone()
            .unwrap_or_else(directory::detect_local_address);
        let advertise_port = self
            .config
            .cluster_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        let directory = PeerDirectory::new(catalog.clone(), advertise_addr, advertise_port);
        directory.start(&self.config.cluster_addr, cancel.clone()).await?;

        let pubsub = PubSub::new(directory.self_id.clone(), catalog.clone(), directory.clone());
        pubsub.start(cancel.clone()).await;

        let election = LeaderElection::new("workflow-engine", directory.self_id.clone(), catalog.clone());
        tokio::spawn(election.clone().run(cancel.clone()));

        let notify = Arc::new(NotificationFacade::new(catalog.clone(), pubsub.clone()));
        let templates = Arc::new(Templates::new(catalog.clone(), self.config.locale_fallback.clone())?);

        // Each concrete sender implements both `MailSender` and
        // `health::Provider`; keep one typed handle of each so the workflow
        // engine and the health checker can hold the same instance without
        // requiring `dyn MailSender` to carry a `Provider` vtable.
        let (mail, mail_health): (Arc<dyn MailSender>, Arc<dyn crate::health::Provider>) =
            if self.config.smtp_configured() {
                let sender = Arc::new(SmtpMailSender::from_config(&self.config)?);
                (sender.clone(), sender)
            } else {
                let sender = Arc::new(NullMailSender);
                (sender.clone(), sender)
            };
        let broker: Arc<dyn BrokerClient> = if self.config.broker_configured() {
            Arc::new(LapinBroker::connect(&self.config.broker_uri).await?)
        } else {
            Arc::new(NullBroker)
        };

        let workflow = Arc::new(WorkflowEngine::new(
            catalog.clone(),
            notify,
            mail,
            templates.clone(),
            broker,
            self.config.broker_routing_key_prefix.clone(),
        ));
        tokio::spawn(workflow.clone().run(election, cancel.clone()));

        // Health registration mirrors the original's server.go: the catalog
        // is critical, mail is advisory and only enabled when configured,
        // the task-queue broker is never registered (its absence is by
        // design and must not affect `/health`).
        let health = Arc::new(crate::health::Checker::new());
        health.register("catalog", true, catalog.clone());
        health.register("smtp", false, mail_health);
        health.set_enabled("smtp", self.config.smtp_configured());

        let state = Arc::new(AppState {
            catalog,
            directory,
            pubsub,
            workflow,
            templates,
            health,
            acl: self.acl,
        });

        let public_app = web::public_router(&self.config.context_path, state.clone());
        let private_app = web::private_router(state);

        let public_listener = tokio::net::TcpListener::bind(&self.config.public_addr).await?;
        tracing::info!("public HTTP/WS listener on {}", self.config.public_addr);
        let public_cancel = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(public_listener, public_app.into_make_service());
            tokio::select! {
                _ = public_cancel.cancelled() => {}
                result = serve => {
                    if let Err(e) = result {
                        tracing::error!("public HTTP server error: {e}");
                    }
                }
            }
        });

        let private_listener = tokio::net::TcpListener::bind(&self.config.private_addr).await?;
        tracing::info!("private/admin HTTP listener on {}", self.config.private_addr);
        let private_cancel = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(private_listener, private_app.into_make_service());
            tokio::select! {
                _ = private_cancel.cancelled() => {}
                result = serve => {
                    if let Err(e) = result {
                        tracing::error!("private HTTP server error: {e}");
                    }
                }
            }
        });

        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, cancelling background tasks");
        cancel.cancel();
        // Give spawned tasks a moment to observe cancellation and close
        // their listeners/connections before the process exits.
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        Ok(())
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received ctrl-c");
    }
}
