//! Coffer - S3-Compatible Object Storage Gateway
//!
//! Serves the S3 REST API subset for buckets, objects and multipart uploads.

use anyhow::Context;
use clap::{Parser, Subcommand};
use coffer_auth::{generate_credentials, generate_presigned_url, PresignRequest};
use coffer_core::config::{CofferConfig, LoggingConfig};
use coffer_s3_api::S3Server;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "coffer")]
#[command(version = coffer_core::VERSION)]
#[command(about = "S3-Compatible Object Storage Gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true, env = "COFFER_CONFIG")]
    config: Option<String>,

    /// Bind address
    #[arg(long, global = true, env = "COFFER_BIND_ADDRESS")]
    bind: Option<String>,

    /// Port number
    #[arg(short, long, global = true, env = "COFFER_PORT")]
    port: Option<u16>,

    /// Data directory
    #[arg(long, global = true, env = "COFFER_DATA_DIR")]
    data_dir: Option<String>,

    /// Root access key
    #[arg(long, global = true, env = "COFFER_ROOT_ACCESS_KEY")]
    access_key: Option<String>,

    /// Root secret key
    #[arg(long, global = true, env = "COFFER_ROOT_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "COFFER_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the S3 server (default)
    Server,

    /// Print a presigned URL for an object or bucket
    Presign {
        bucket: String,

        key: Option<String>,

        /// HTTP method the URL is valid for
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Validity in seconds (max 604800)
        #[arg(short, long, default_value_t = 3600)]
        expires: u64,

        /// Base URL clients use to reach the server
        #[arg(long, default_value = "http://localhost:9000")]
        endpoint: String,
    },

    /// Generate a random access key pair
    GenCredentials,

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Server) {
        Commands::Server => {
            init_logging(&config.logging)?;
            print_banner();
            run_server(config).await?;
        }
        Commands::Presign {
            bucket,
            key,
            method,
            expires,
            endpoint,
        } => {
            let request = PresignRequest {
                method: method.to_uppercase(),
                bucket,
                key,
                expires_in: expires,
            };
            let url = generate_presigned_url(
                &request,
                &endpoint,
                &config.auth.root_access_key,
                &config.auth.root_secret_key,
                &config.auth.region,
                chrono::Utc::now(),
            )?;
            println!("{}", url);
        }
        Commands::GenCredentials => {
            let (access_key, secret_key) = generate_credentials();
            println!("access_key = \"{}\"", access_key);
            println!("secret_key = \"{}\"", secret_key);
        }
        Commands::PrintConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{}", rendered);
        }
    }

    Ok(())
}

/// File or environment configuration with command-line overrides on top
fn load_config(cli: &Cli) -> anyhow::Result<CofferConfig> {
    let mut config = match &cli.config {
        Some(path) => CofferConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => CofferConfig::from_env(),
    };

    if let Some(bind) = &cli.bind {
        config.server.bind_address = bind.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.into();
    }
    if let Some(access_key) = &cli.access_key {
        config.auth.root_access_key = access_key.clone();
    }
    if let Some(secret_key) = &cli.secret_key {
        config.auth.root_secret_key = secret_key.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    Ok(config)
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid log level '{}'", logging.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
    Ok(())
}

fn print_banner() {
    println!(
        r#"
    ___        __  __
   / __\___   / _|/ _| ___ _ __
  / /  / _ \ | |_| |_ / _ \ '__|
 / /__| (_) ||  _|  _|  __/ |
 \____/\___/ |_| |_|  \___|_|

   S3-Compatible Object Storage Gateway
   Version: {}
"#,
        coffer_core::VERSION
    );
}

async fn run_server(config: CofferConfig) -> anyhow::Result<()> {
    info!("Starting Coffer server...");
    info!("Data directory: {:?}", config.storage.data_dir);
    info!("Database: {}", config.database.url);

    let server = S3Server::new(config);
    server.run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "coffer",
            "--port",
            "9100",
            "--access-key",
            "AK",
            "--secret-key",
            "SK",
            "print-config",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.auth.root_access_key, "AK");
        assert_eq!(config.auth.root_secret_key, "SK");
        assert!(matches!(cli.command, Some(Commands::PrintConfig)));
    }

    #[test]
    fn test_presign_arguments() {
        let cli = Cli::parse_from(["coffer", "presign", "bucket", "dir/key.txt", "-e", "60"]);
        match cli.command {
            Some(Commands::Presign {
                bucket,
                key,
                method,
                expires,
                ..
            }) => {
                assert_eq!(bucket, "bucket");
                assert_eq!(key.as_deref(), Some("dir/key.txt"));
                assert_eq!(method, "GET");
                assert_eq!(expires, 60);
            }
            _ => panic!("expected presign"),
        }
    }

    #[test]
    fn test_config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&CofferConfig::default()).unwrap();
        let parsed = CofferConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.server.port, CofferConfig::default().server.port);
    }
}
