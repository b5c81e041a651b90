// Create or complete the fleet root authority in a credentials directory.
use anyhow::{Context, Result, bail};
use clap::Parser;
use fleet_pki::{RootAuthority, root_paths};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bootstrap-ca")]
#[command(about = "Create or complete the fleet root authority")]
struct Args {
    /// Credentials directory
    #[arg(env = "NFD_CA_DIR", default_value = "/ca")]
    dir: PathBuf,

    /// Replace existing credentials
    #[arg(long, conflicts_with = "init")]
    force: bool,

    /// Reuse existing credentials, generating whatever is missing
    #[arg(long)]
    init: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let root = if args.init {
        RootAuthority::init(&args.dir)
            .with_context(|| format!("initialize root authority in {}", args.dir.display()))?
    } else {
        let (cert_path, key_path) = root_paths(&args.dir);
        if !args.force && (cert_path.exists() || key_path.exists()) {
            bail!(
                "credentials already present in {}; pass --force to replace them",
                args.dir.display()
            );
        }
        RootAuthority::bootstrap(&args.dir)
            .with_context(|| format!("bootstrap root authority in {}", args.dir.display()))?
    };
    tracing::info!(
        dir = %args.dir.display(),
        not_after = %root.not_after(),
        "root authority ready"
    );
    Ok(())
}
