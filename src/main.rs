//! freegate - HTTP gateway over free GPT-style upstream providers
//!
//! Serves plain-text and OpenAI-compatible completion endpoints and fails
//! over across providers until one of them answers.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use freegate::config::{Config, KeySource};
use freegate::provider::AUTO;

#[derive(Parser)]
#[command(name = "freegate")]
#[command(about = "HTTP gateway with provider failover for free GPT-style upstreams")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured providers and how their keys were resolved
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

impl Commands {
    fn config_path(&self) -> &str {
        match self {
            Commands::Serve { config, .. } => config,
            Commands::Check { config } => config,
            Commands::Providers { config } => config,
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("freegate={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn log_key_sources(key_sources: &[(String, KeySource)]) {
    for (name, source) in key_sources {
        match source {
            KeySource::None => tracing::debug!(owner = %name, "No API key configured"),
            _ => tracing::info!(owner = %name, source = %source, "API key resolved"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = Config::from_file_with_env(cli.command.config_path());
    let level = loaded
        .as_ref()
        .map(|(config, _)| config.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level);

    match cli.command {
        Commands::Serve { config, listen } => {
            tracing::info!(config = %config, "Loading configuration");
            let (mut config, key_sources) = loaded?;
            log_key_sources(&key_sources);

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            freegate::api::run_server(config).await
        }

        Commands::Check { config: path } => {
            tracing::info!(config = %path, "Checking configuration");
            let (config, key_sources) = loaded?;
            log_key_sources(&key_sources);

            println!("Configuration OK: {}", path);
            println!("  listen:    {}", config.server.listen);
            println!("  keyword:   {}", config.server.keyword);
            println!(
                "  upstream:  {}",
                config
                    .upstream
                    .as_ref()
                    .map(|u| u.url.as_str())
                    .unwrap_or("(none)")
            );
            println!("  providers: {}", config.providers.len());
            println!(
                "  database:  {}",
                config
                    .database
                    .as_ref()
                    .map(|d| d.path.as_str())
                    .unwrap_or("(disabled)")
            );
            println!("  keys:");
            for (owner, source) in &key_sources {
                println!("    {:<20} {}", owner, source);
            }
            Ok(())
        }

        Commands::Providers { .. } => {
            let (config, key_sources) = loaded?;
            let key_of = |name: &str| {
                key_sources
                    .iter()
                    .find(|(owner, _)| owner == name)
                    .map(|(_, source)| source.to_string())
                    .unwrap_or_else(|| KeySource::None.to_string())
            };

            println!("{:<24} {:<40} {:<22} MODELS", "NAME", "URL", "KEY");
            if let Some(upstream) = &config.upstream {
                println!(
                    "{:<24} {:<40} {:<22} {}",
                    AUTO,
                    upstream.url,
                    key_of("upstream"),
                    upstream.models.join(", ")
                );
            }
            for provider in &config.providers {
                let url = provider
                    .url
                    .as_deref()
                    .or(config.upstream.as_ref().map(|u| u.url.as_str()))
                    .unwrap_or("(none)");
                println!(
                    "{:<24} {:<40} {:<22} {}",
                    provider.name,
                    url,
                    key_of(&provider.name),
                    provider.models.join(", ")
                );
            }
            for name in &config.health.blacklist {
                println!("{:<24} (blacklisted)", name);
            }
            Ok(())
        }
    }
}
