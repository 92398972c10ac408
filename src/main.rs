//! TSS wallet backend CLI
//!
//! Run modes:
//!   tss-server api            - TSS API (keygen, triples, signing)
//!   tss-server node           - key-share node
//!   tss-server check-nodes    - query a node set for one user's status

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::net::TcpListener;

use tss_server::config::{EngineKind, KsnConfig, NodeSetFile, TssConfig};
use tss_server::crypto::{CryptoEngine, SoftwareEngine};
use tss_server::identity::JwtClaimsVerifier;
use tss_server::ksn::{self, KsnState};
use tss_server::logging::init_logging;
use tss_server::storage::{SqliteKsnStore, SqliteTssStore};
use tss_server::types::CurveType;
use tss_server::{AppState, KeyShareNodeClient, UserCredentials};

#[derive(Parser)]
#[command(name = "tss-server")]
#[command(about = "Two-party threshold wallet backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the TSS API server
    Api {
        /// Bind address, overrides TSS_BIND
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run a key-share node
    Node {
        /// Bind address, overrides KSN_BIND
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Check a user's wallet status on every node of a node set
    CheckNodes {
        /// Node set TOML file
        #[arg(short, long)]
        nodes: String,

        #[arg(short, long, default_value = "secp256k1")]
        curve: CurveType,

        #[arg(long, env = "TSS_AUTH_TYPE")]
        auth_type: String,

        #[arg(long, env = "TSS_ID_TOKEN")]
        id_token: String,
    },
}

fn engine_for(kind: EngineKind) -> Arc<dyn CryptoEngine> {
    match kind {
        EngineKind::Software => Arc::new(SoftwareEngine::new()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Api { bind } => run_api(bind).await?,
        Commands::Node { bind } => run_node(bind).await?,
        Commands::CheckNodes {
            nodes,
            curve,
            auth_type,
            id_token,
        } => {
            init_logging("warn".into(), false)?;
            check_nodes(&nodes, curve, UserCredentials { auth_type, id_token }).await?;
        }
    }

    Ok(())
}

async fn run_api(bind: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = TssConfig::from_env()?;
    init_logging(config.log_level.as_str().into(), config.environment.json_logs())?;
    config.validate_for_production()?;
    if let Some(bind) = bind {
        config.bind = bind;
    }

    let store = Arc::new(SqliteTssStore::new(&config.db_path)?);
    let state = AppState::new(
        store,
        engine_for(config.engine),
        config.share_password.clone(),
        config.sss_threshold,
    );
    let app = tss_server::create_router(state);

    let listener = TcpListener::bind(&config.bind).await?;
    tracing::info!(
        bind = %config.bind,
        environment = ?config.environment,
        db = %config.db_path,
        "TSS API listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_node(bind: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = KsnConfig::from_env()?;
    init_logging(config.log_level.as_str().into(), config.environment.json_logs())?;
    config.validate_for_production()?;
    if let Some(bind) = bind {
        config.bind = bind;
    }

    let node_key = ksn::node_signing_key(&config)?;
    let state = KsnState::new(
        Arc::new(SqliteKsnStore::new(&config.db_path)?),
        Arc::new(SoftwareEngine::new()),
        Arc::new(JwtClaimsVerifier::new(&config.allowed_issuers)),
        &node_key,
        &config,
    );
    let app = ksn::create_router(Arc::new(state));

    let listener = TcpListener::bind(&config.bind).await?;
    tracing::info!(
        bind = %config.bind,
        node = %config.node_name,
        node_pubkey = %hex::encode(node_key.verifying_key().to_bytes()),
        "Key-share node listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn check_nodes(
    path: &str,
    curve: CurveType,
    credentials: UserCredentials,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = NodeSetFile::load(path)?;
    let client = KeyShareNodeClient::from_file(&file, Arc::new(SoftwareEngine::new()))?;
    let checked = client.check_nodes(&credentials, curve).await;

    println!("{} nodes, threshold {}", checked.nodes.len(), checked.threshold);
    for node in &checked.nodes {
        println!("  {:<20} {:<40} {:?}", node.name, node.endpoint, node.wallet_status);
    }
    println!(
        "{} of {} ACTIVE for {}",
        checked.active_count(),
        checked.nodes.len(),
        curve
    );
    Ok(())
}
