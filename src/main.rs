use clap::{Parser, Subcommand};
use deskctl::config::{self, Config, LoggingConfig};
use deskctl::{api, daemon};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "deskctl")]
#[command(author, version, about = "Local control daemon for Bluetooth over D-Bus", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground (run it under a service manager
    /// to keep it in the background)
    Start,

    /// Stop the running daemon
    Stop,

    /// Check daemon status
    Status,

    /// Inspect settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },

    /// Manage REST API keys
    ApiKey {
        #[command(subcommand)]
        action: ApiKeyAction,
    },
}

#[derive(Subcommand)]
enum ApiKeyAction {
    /// Generate a new API key and print its hash for the config file
    Generate,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = if verbose {
        EnvFilter::new("deskctl=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("deskctl={}", logging.level)))
    };

    let json = logging.json.then(|| tracing_subscriber::fmt::layer().json());
    let text = (!logging.json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Only the daemon honours the [logging] section; a broken config is
    // reported by the daemon itself once logging is up
    let logging = match cli.command {
        Commands::Start => Config::load().map(|c| c.logging).unwrap_or_default(),
        _ => LoggingConfig::default(),
    };
    init_logging(cli.verbose, &logging);

    match cli.command {
        Commands::Start => {
            info!("Starting deskctl daemon...");
            daemon::run().await?;
        }

        Commands::Stop => {
            info!("Stopping deskctl daemon...");
            daemon::stop().await?;
        }

        Commands::Status => {
            daemon::status().await?;
        }

        Commands::Config { show } => {
            if show {
                config::show()?;
            } else {
                println!("Use --show to view current config.");
                println!("Config file: {}", Config::config_path()?.display());
            }
        }

        Commands::ApiKey { action } => match action {
            ApiKeyAction::Generate => {
                let key = api::generate_api_key();
                println!("API key:  {}", key);
                println!("Key hash: {}", api::hash_api_key(&key));
                println!();
                println!("Add the hash to your config file:");
                println!();
                println!("[api]");
                println!("api_key_hash = \"{}\"", api::hash_api_key(&key));
                println!();
                println!("Send the key in the X-API-Key header.");
            }
        },
    }

    Ok(())
}
