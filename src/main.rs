use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crossmesh::config::NodeConfig;
use crossmesh::p2p::P2pService;
use crossmesh::resource::{LocalResourceTable, MemoryResource, ResourcePath};
use crossmesh::tls;

#[derive(Parser)]
#[command(name = "crossmesh-node", about = "Cross-organization resource mesh node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node.
    Run {
        /// Path to the node's TOML configuration.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate a self-signed identity certificate and key.
    Keygen {
        /// Directory to write node_cert.pem and node_key.pem into.
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match Cli::parse().command {
        Command::Run { config } => run(&config).await,
        Command::Keygen { out } => keygen(&out),
    }
}

async fn run(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = NodeConfig::load(config_path).context("load configuration")?;

    let table = Arc::new(LocalResourceTable::new());
    for decl in &config.resources {
        let path: ResourcePath = decl.path.parse()?;
        match decl.stub_type.as_str() {
            "memory" => {
                table.register(Arc::new(MemoryResource::new(&path)));
                info!(path = %path, "registered local resource");
            }
            other => {
                warn!(path = %path, stub_type = %other, "unknown stub type, resource skipped");
            }
        }
    }

    let service = P2pService::new(config, table.clone(), table.clone())
        .context("initialize p2p service")?;
    service.start().await.context("start p2p service")?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

fn keygen(out: &PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(out)?;
    let (cert_pem, key_pem) = tls::generate_identity_pem()?;

    let cert_path = out.join("node_cert.pem");
    let key_path = out.join("node_key.pem");
    std::fs::write(&cert_path, &cert_pem)?;
    std::fs::write(&key_path, &key_pem)?;

    let identity = tls::TlsIdentity::from_pem(&cert_pem, &key_pem)?;
    println!("wrote {}", cert_path.display());
    println!("wrote {}", key_path.display());
    println!("node id: {}", identity.node_id()?);
    Ok(())
}
