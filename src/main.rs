//! minicpm-adapter - OpenAI-compatible gateway for MiniCPM-o 4.5
//!
//! Forwards chat completions to llama-server, or drives the omni
//! prefill/generate protocol with per-key backend sessions.

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use minicpm_adapter::config::Config;

#[derive(Parser)]
#[command(name = "minicpm-adapter")]
#[command(about = "OpenAI-compatible gateway for MiniCPM-o 4.5")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Override llama-server base URL
        #[arg(long)]
        backend_url: Option<String>,
    },

    /// Validate configuration file and print the resolved settings
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

/// Load the config file, falling back to defaults when it does not exist.
///
/// The flag reports whether defaults were used.
fn load_config(path: &str) -> anyhow::Result<(Config, bool)> {
    if Path::new(path).exists() {
        Ok((Config::from_file(path)?, false))
    } else {
        Ok((Config::from_defaults()?, true))
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("minicpm_adapter={},tower_http=info", level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config: path,
            listen,
            backend_url,
        } => {
            let (config, defaulted) = load_config(&path)?;
            init_tracing(&config.logging.level);

            if defaulted {
                tracing::warn!(config = %path, "Config file not found, using defaults");
            } else {
                tracing::info!(config = %path, "Loaded configuration");
            }

            if let Some(addr) = &listen {
                tracing::info!(listen = %addr, "Override listen address");
            }
            if let Some(url) = &backend_url {
                tracing::info!(backend = %url, "Override llama-server URL");
            }
            let config = config
                .with_overrides(listen, backend_url)
                .context("Invalid command-line override")?;

            minicpm_adapter::proxy::run_server(config).await
        }

        Commands::Check { config: path } => {
            let (config, defaulted) = load_config(&path)?;

            if defaulted {
                println!("{} not found; built-in defaults are valid", path);
            } else {
                println!("{} is valid", path);
            }
            println!("  listen:        {}", config.server.listen);
            println!("  mode:          {}", config.server.mode);
            println!("  llama-server:  {}", config.backend.url);
            println!("  backend model: {}", config.backend.model);
            println!("  public model:  {}", config.backend.public_model);

            if let Some(omni) = config.omni.as_ref().filter(|_| config.omni_enabled()) {
                println!("  session url:   {}", omni.session_url);
                println!("  inference url: {}", omni.inference_url);
                println!("  freshness:     {}s", omni.freshness_secs);
                match &omni.manual_session {
                    Some(manual) => println!(
                        "  manual session: {} (user {}, source {})",
                        manual.session_id, manual.user_id, omni.manual_source
                    ),
                    None => println!("  manual session: none"),
                }
            }
            Ok(())
        }
    }
}
