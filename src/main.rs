use anyhow::{Context, Result};
use clap::Parser;
use ldap_directory::server::{LdapServer, ServerOptions};
use ldap_directory::store::open_store;
use ldap_directory::{run_metrics_server, tls, Config, Directory, Metrics};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ldap-directory")]
#[command(about = "LDAP v3 directory server with pluggable storage and ACLs")]
struct Args {
    /// Configuration file path (built-in defaults when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_directory={},info", log_level))
        .init();

    info!("Starting LDAP directory");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => {
            warn!("No --config given, using built-in defaults");
            Config::default()
        }
    };
    if let Some(url) = args.listen {
        config.listen.url = url;
    }

    info!("Configuration loaded:");
    info!("  Listen URL: {}", config.listen.url);
    info!("  Base DN: {}", config.directory.base_dn);
    info!("  Store: {:?}", config.store.kind);
    info!("  ACL rules: {}", config.directory.acl.len());

    let store = open_store(&config.store).await?;
    let directory = Arc::new(Directory::new(&config.directory, store)?);
    directory.init().await.context("Failed to initialize directory")?;

    let need_ldaps = config.listen.url.starts_with("ldaps://");
    let tls_acceptor = match &config.tls {
        Some(tls_config) => {
            let acceptor = tls::acceptor(tls_config)?;
            info!("TLS enabled for listener (LDAPS or StartTLS)");
            Some(acceptor)
        }
        None if need_ldaps => anyhow::bail!("LDAPS (ldaps://) requires a tls section in config"),
        None => None,
    };
    let options = ServerOptions::from_config(&config.listen, tls_acceptor)?;

    let metrics = Arc::new(Metrics::new());
    let listener = LdapServer::bind(&config.listen.url).await?;
    let listening = Arc::new(AtomicBool::new(true));

    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let directory_for_ready = Arc::clone(&directory);
        let listening_for_ready = Arc::clone(&listening);
        let ready = Arc::new(move || {
            directory_for_ready.is_initialized() && listening_for_ready.load(Ordering::Acquire)
        });
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, ready).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let server = LdapServer::new(directory, metrics, options);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let mut handle = tokio::spawn(async move { server.serve(listener, token).await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested, notifying clients");
        }
        finished = &mut handle => {
            listening.store(false, Ordering::Release);
            finished.context("LDAP server task failed")??;
            return Ok(());
        }
    }

    listening.store(false, Ordering::Release);
    shutdown.cancel();
    match tokio::time::timeout(config.shutdown_timeout(), handle).await {
        Ok(joined) => joined.context("LDAP server task failed")??,
        Err(_) => warn!(
            "Sessions still open after {:?}, exiting anyway",
            config.shutdown_timeout()
        ),
    }
    info!("LDAP directory stopped");
    Ok(())
}
