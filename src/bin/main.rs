use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{LevelFilter, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tincture::analysis::StyledTokensRequest;
use tincture::config::{self, Settings};
use tincture::rpc::{ClientError, PROTOCOL_VERSION};
use tincture::tokenize::TokenizeJob;
use tincture::{AnalysisServer, AnalysisServices, RpcClient, TinctureError, TinctureResult};

/// Source tokenization, theme styling and type resolution over RPC
#[derive(Parser)]
#[command(name = "tincture")]
#[command(version)]
#[command(about = "Source tokenization, theme styling and type resolution over RPC")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/tincture/tincture.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the analysis server until interrupted
    Serve {
        /// Port to listen on (overrides config and TINCTURE_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Tokenize and style one file locally, printing JSON
    Tokenize {
        /// Grammar id, scope name or file extension (e.g. rust, source.js, toy)
        #[arg(long)]
        grammar: String,

        /// Theme id registered in the config (default: default_theme)
        #[arg(long)]
        theme: Option<String>,

        file: PathBuf,
    },
    /// Call a method on a running server, printing the JSON result
    Call {
        method: String,

        /// JSON params
        #[arg(default_value = "null")]
        params: String,
    },
    /// Print crate and protocol versions
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level_from_env = init_logging();
    let settings = match config::load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if !level_from_env {
        apply_log_level(settings.log_level.as_deref());
    }

    let result = match cli.command {
        Commands::Serve { port } => serve(settings, port).await,
        Commands::Tokenize {
            grammar,
            theme,
            file,
        } => tokenize(settings, grammar, theme, file).await,
        Commands::Call { method, params } => call(settings, method, params).await,
        Commands::Version => {
            println!(
                "tincture {} (protocol {})",
                env!("CARGO_PKG_VERSION"),
                PROTOCOL_VERSION
            );
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        let code = match e {
            TinctureError::Rpc(ClientError::Exhausted { .. }) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

/// Install the logger before anything logs. Returns whether `RUST_LOG`
/// chose the filter, in which case the config's `log_level` is ignored.
fn init_logging() -> bool {
    let from_env = std::env::var_os("RUST_LOG").is_some();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .target(env_logger::Target::Stderr)
        .init();
    if !from_env {
        log::set_max_level(LevelFilter::Info);
    }
    from_env
}

fn apply_log_level(level: Option<&str>) {
    let Some(level) = level else {
        return;
    };
    match level.parse::<LevelFilter>() {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!(
            target: "tincture::config",
            "Ignoring unknown log_level '{}'",
            level
        ),
    }
}

async fn serve(mut settings: Settings, port: Option<u16>) -> TinctureResult<()> {
    if let Some(port) = port {
        settings.server.port = port;
    }

    let services = Arc::new(AnalysisServices::from_settings(&settings).await?);
    let server = AnalysisServer::new(services);
    let listener = TcpListener::bind(settings.server.address()).await?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "tincture::server", "Interrupted, shutting down");
        }
        on_signal.cancel();
    });

    server.serve(listener, shutdown).await;
    Ok(())
}

async fn tokenize(
    settings: Settings,
    grammar: String,
    theme: Option<String>,
    file: PathBuf,
) -> TinctureResult<()> {
    let source = tokio::fs::read_to_string(&file).await?;
    let services = AnalysisServices::from_settings(&settings).await?;

    let output = if theme.is_some() || settings.default_theme.is_some() {
        let styled = services
            .styled_tokens(StyledTokensRequest {
                grammar_id: grammar,
                source,
                theme_id: theme,
                time_limit: None,
                location: None,
            })
            .await?;
        serde_json::to_string_pretty(&styled)?
    } else {
        let raw = services.raw_tokens(TokenizeJob::new(grammar, source)).await?;
        serde_json::to_string_pretty(&raw)?
    };
    println!("{}", output);
    Ok(())
}

async fn call(settings: Settings, method: String, params: String) -> TinctureResult<()> {
    let params: serde_json::Value = serde_json::from_str(&params)?;
    let client = RpcClient::connect(settings.server.address(), settings.client.options()).await?;
    client.check_protocol_version().await?;

    let result = client.request(&method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
