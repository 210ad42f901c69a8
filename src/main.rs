use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use quantum_mesh_core::config::MeshConfig;
use quantum_mesh_core::logging::{init_logging, log_error, log_info, LogCategory};
use quantum_mesh_core::mesh_node::MeshNode;
use quantum_mesh_core::MeshError;

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 64;
/// Exit code for cryptographic initialization failures (production).
const EXIT_CRYPTO_INIT: u8 = 65;
/// Exit code for fatal runtime errors.
const EXIT_FATAL: u8 = 70;

#[derive(Debug, Parser)]
#[command(
    name = "mesh-node",
    version,
    about = "Self-healing post-quantum mesh control-plane node"
)]
struct Cli {
    /// Fixed node identifier (32 hex chars); minted at first boot if absent.
    #[arg(long)]
    node_id: Option<String>,
    /// UDP listen address, e.g. 0.0.0.0:7100.
    #[arg(long)]
    listen: Option<String>,
    /// Bootstrap peer address; repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,
    /// Production mode: PQC mandatory, TOFU and mock primitives rejected.
    #[arg(long)]
    production: bool,
    /// Permit trust-on-first-use peer installation (lab use only).
    #[arg(long)]
    allow_tofu: bool,
    /// Path to a configuration file (TOML or JSON).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> quantum_mesh_core::Result<MeshConfig> {
    let mut config = MeshConfig::load(cli.config.as_deref())?;
    if cli.node_id.is_some() {
        config.node_id = cli.node_id.clone();
    }
    if cli.listen.is_some() {
        config.listen = cli.listen.clone();
    }
    if !cli.peers.is_empty() {
        config.peers = cli.peers.clone();
    }
    config.production |= cli.production;
    config.allow_tofu |= cli.allow_tofu;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Environment files are optional; a missing .env is not an error.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_logging(config.log_json);

    let node = match MeshNode::new(config).await {
        Ok(node) => node,
        Err(MeshError::CryptoInit(e)) => {
            log_error(
                LogCategory::System,
                &format!("cryptographic initialization failed: {e}"),
            );
            return ExitCode::from(EXIT_CRYPTO_INIT);
        }
        Err(MeshError::Configuration(e)) => {
            log_error(LogCategory::System, &format!("configuration error: {e}"));
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            log_error(LogCategory::System, &format!("startup failed: {e}"));
            return ExitCode::from(EXIT_FATAL);
        }
    };

    if let Err(e) = node.start().await {
        log_error(LogCategory::System, &format!("node start failed: {e}"));
        return ExitCode::from(EXIT_FATAL);
    }
    log_info(
        LogCategory::System,
        &format!("node {} listening on {}", node.node_id(), node.local_addr()),
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            node.shutdown().await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            log_error(LogCategory::System, &format!("signal wait failed: {e}"));
            node.shutdown().await;
            ExitCode::from(EXIT_FATAL)
        }
    }
}
