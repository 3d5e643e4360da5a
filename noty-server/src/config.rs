//! Process configuration.
//!
//! Every field falls back to an environment variable the same way the
//! original's `Option.ensureDefaults()` pulled from `os.Getenv`, but parsed
//! declaratively with `clap` the way the teacher's `ServerConfig` does.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "noty-server", about = "Multi-node notification and workflow delivery service")]
pub struct ServerConfig {
    /// Address the public HTTP/WS surface binds to.
    #[arg(long, env = "NOTY_PUBLIC_ADDR", default_value = "0.0.0.0:3000")]
    pub public_addr: String,

    /// Address the admin/private HTTP surface binds to.
    #[arg(long, env = "NOTY_PRIVATE_ADDR", default_value = "0.0.0.0:3001")]
    pub private_addr: String,

    /// Address the peer mesh listener binds to.
    #[arg(long, env = "NOTY_CLUSTER_ADDR", default_value = "0.0.0.0:7946")]
    pub cluster_addr: String,

    /// Externally-reachable address other nodes should dial to reach this
    /// one. When unset, derived from the first non-loopback interface.
    #[arg(long, env = "NOTY_PEER_NOTIFY_ADDRESS")]
    pub peer_notify_address: Option<String>,

    #[arg(long, env = "NOTY_CONTEXT_PATH", default_value = "/noty/")]
    pub context_path: String,

    #[arg(long, env = "NOTY_METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// Path to the SQLite catalog file. `:memory:` for an ephemeral node.
    #[arg(long, env = "NOTY_CATALOG_PATH", default_value = "noty.sqlite3")]
    pub catalog_path: String,

    #[arg(long, env = "SMTP_SERVER", default_value = "")]
    pub smtp_server: String,
    #[arg(long, env = "SMTP_USERNAME", default_value = "")]
    pub smtp_username: String,
    #[arg(long, env = "SMTP_PASSWORD", default_value = "")]
    pub smtp_password: String,
    #[arg(long, env = "MAIL_FROM", default_value = "")]
    pub mail_from: String,
    #[arg(long, env = "MAIL_FROM_NAME", default_value = "")]
    pub mail_from_name: String,

    #[arg(long, env = "BROKER_URI", default_value = "")]
    pub broker_uri: String,
    #[arg(long, env = "BROKER_ROUTING_KEY_PREFIX", default_value = "noty.")]
    pub broker_routing_key_prefix: String,

    #[arg(long, env = "LOCALE_FALLBACK", default_value = "en-US")]
    pub locale_fallback: String,
}

impl ServerConfig {
    pub fn smtp_configured(&self) -> bool {
        !self.smtp_server.is_empty()
    }

    pub fn broker_configured(&self) -> bool {
        !self.broker_uri.is_empty()
    }
}
