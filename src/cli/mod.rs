use crate::config::confique_partial_app_config::PartialAppConfig;
use crate::{AppConfig, CertificateAuthority, Wiretap};
use anyhow::Result;
use clap::{Parser, Subcommand};
use confique::Config;
use std::path::PathBuf;
use tracing::info;

mod trust;
pub use trust::{TrustCommands, TrustHandler};

#[derive(Parser)]
#[command(name = "wiretap")]
#[command(about = "A TLS-intercepting HTTP forward proxy")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "$HOME/.wiretap/config.toml")]
    config_path: PathBuf,

    #[command(flatten)]
    config: PartialAppConfig,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the root CA certificate in the system trust store
    Trust {
        #[command(subcommand)]
        command: TrustCommands,
    },
}

impl Cli {
    pub async fn run(&self) -> Result<()> {
        let log_level = if self.verbose { "debug" } else { "info" };
        tracing_subscriber::fmt()
            .with_env_filter(format!("wiretap={},{}", log_level, log_level))
            .init();

        if let Some(command) = &self.command {
            return self.handle_command(command).await;
        }

        self.run_proxy().await
    }

    fn load_config(&self) -> Result<AppConfig> {
        let home_dir = dirs::home_dir().unwrap_or_else(|| ".".into());
        let config_path = self
            .config_path
            .to_str()
            .unwrap_or("")
            .replace("$HOME", home_dir.to_str().unwrap_or("."));
        let config = AppConfig::builder()
            .preloaded(self.config.clone())
            .env()
            .file(PathBuf::from(config_path))
            .load()?;
        Ok(config.with_resolved_paths()?)
    }

    async fn handle_command(&self, command: &Commands) -> Result<()> {
        match command {
            Commands::Trust { command } => {
                let config = self.load_config()?;
                TrustHandler::new(config).handle(command).await
            }
        }
    }

    async fn run_proxy(&self) -> Result<()> {
        let config = self.load_config()?;
        info!("loaded proxy configuration");

        std::fs::create_dir_all(&config.tls.cert_dir)?;
        let ca = CertificateAuthority::new(config.tls.cert_dir.clone()).await?;
        info!("certificate authority initialized at {}", config.tls.cert_dir.display());

        let mut wiretap = Wiretap::new(ca, config);
        wiretap.run().await
    }
}
