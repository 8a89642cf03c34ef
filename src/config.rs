use anyhow::Context;
use clap::Args;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Options shared by every command, each backed by an environment variable.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "PROGRESS_MAX_CONNECTIONS", global = true, default_value_t = 5)]
    pub max_connections: u32,

    /// Attempts allowed per module before retakes are refused; unlimited when unset
    #[arg(long, env = "PROGRESS_MAX_ATTEMPTS", global = true)]
    pub max_attempts: Option<u32>,

    /// Emails treated as administrators regardless of their stored role
    #[arg(long, env = "PROGRESS_ADMIN_EMAILS", global = true, value_delimiter = ',')]
    pub admin_emails: Vec<String>,

    /// Tracing filter directive, e.g. `progress_tracker=debug`
    #[arg(long, env = "RUST_LOG", global = true, default_value = "info")]
    pub log_filter: String,
}

impl Settings {
    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        let database_url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")
    }
}
