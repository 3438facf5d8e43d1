//! FoxNest Server - hosts many repositories behind one HTTP endpoint

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use foxnest_server::{ApiHandler, Config};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// FoxNest Server Configuration
#[derive(Parser, Debug)]
#[command(name = "foxnest")]
#[command(author = "FoxNest Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Repository host for fox clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:5000)
        #[arg(short, long, default_value = "0.0.0.0:5000")]
        addr: String,

        /// Root directory; repositories live in <root>/repositories
        #[arg(short, long, default_value = "./data")]
        root: PathBuf,

        /// Maximum request body size in bytes
        #[arg(long, default_value_t = 256 * 1024 * 1024)]
        max_body_size: usize,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// List the repositories under a root
    List {
        #[arg(short, long, default_value = "./data")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            root,
            max_body_size,
            debug,
        } => {
            init_tracing(debug);

            info!("Starting FoxNest server on {}", addr);
            info!("Repository root: {}", root.display());

            let config = Config {
                addr: addr.clone(),
                root,
                max_body_size,
                debug,
            };
            let handler = Arc::new(ApiHandler::new(config).context("Failed to open repository root")?);

            let addr: SocketAddr = addr.parse().with_context(|| format!("Invalid listen address {}", addr))?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;

            info!("Server listening on {}", addr);

            loop {
                let (stream, peer) = listener.accept().await?;
                let handler = handler.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(move |req| handle_request(req, handler.clone())))
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", peer, e);
                    }
                });
            }
        }

        Commands::List { root } => {
            let handler = ApiHandler::new(Config {
                root,
                ..Config::default()
            })
            .context("Failed to open repository root")?;
            for id in handler.host().list()? {
                let summary = handler.host().summary(&id)?;
                println!(
                    "{}\t{}\t{} commits{}",
                    id,
                    summary.head.map(|h| h.short()).unwrap_or_else(|| "(empty)".into()),
                    summary.commits,
                    if summary.archived { "\tarchived" } else { "" }
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

/// Handle incoming HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    handler: Arc<ApiHandler>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    info!("Request: {} {}", req.method(), req.uri());

    let response = match handler.handle(req).await {
        Ok(resp) => resp,
        Err(e) => {
            error!("Request error: {}", e);
            foxnest_server::handlers::json_error(e.status(), &e.to_string())
        }
    };

    info!("Response: {}", response.status());
    Ok(response)
}
