use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_control_models::DEFAULT_N_PREDICT;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llama_relay::backend::{self, BackendOptions};
use llama_relay::config::ProxyConfig;
use llama_relay::model_catalog::ModelCatalog;
use llama_relay::overrides::parse_flags;
use llama_relay::proxy;

/// Serve local GGUF models behind one HTTP endpoint, one backend per accelerator slot.
#[derive(Parser)]
#[command(name = "llama-relay", version, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch every configured slot and serve the routing proxy
    Proxy {
        /// Slot configuration file
        #[arg(long, env = "LLAMA_RELAY_CONFIG", default_value = "relay.toml", value_name = "PATH")]
        config: PathBuf,
    },

    /// Host one model behind the backend HTTP service
    Backend {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long)]
        port: u16,

        /// Directory holding the model files
        #[arg(long, value_name = "DIR")]
        model_root: PathBuf,

        /// Model file, relative to the model root
        #[arg(long)]
        model_path: String,

        /// Auxiliary projector file, relative to the model root
        #[arg(long)]
        mmproj_path: Option<String>,

        #[arg(long, default_value_t = DEFAULT_N_PREDICT)]
        n_predict: usize,

        /// Engine overrides after `--`, e.g. `-- --n-ctx 8192 --seed 7`
        #[arg(last = true, value_name = "OVERRIDES")]
        overrides: Vec<String>,
    },

    /// List the model files a slot could load
    Models {
        #[arg(long, value_name = "DIR")]
        model_root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llama_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Commands::Proxy { config } => {
            let config = ProxyConfig::load(&config)?;
            info!(listen = %config.listen, slots = config.slots.len(), "starting llama-relay");
            proxy::serve(config).await
        }
        Commands::Backend {
            host,
            port,
            model_root,
            model_path,
            mmproj_path,
            n_predict,
            overrides,
        } => {
            let overrides = parse_flags(&overrides)
                .map_err(anyhow::Error::msg)
                .context("invalid engine overrides")?;
            backend::serve(BackendOptions {
                host,
                port,
                model_root,
                model_path,
                mmproj_path,
                n_predict,
                overrides,
            })
            .await
        }
        Commands::Models { model_root } => {
            let catalog = ModelCatalog::discover(&model_root)
                .with_context(|| format!("cannot list models in {}", model_root.display()))?;
            println!("{}", catalog.format_list());
            Ok(())
        }
    }
}
