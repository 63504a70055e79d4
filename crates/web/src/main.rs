//! vmportal daemon
//!
//! Serves the Proxmox console broker over HTTP.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmportal_common::PortalConfig;
use vmportal_web::WebServer;

#[derive(Parser)]
#[command(name = "vmportald")]
#[command(about = "vmportal - Proxmox VM console broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VMPORTAL_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides the configuration file)
    #[arg(short, long, env = "VMPORTAL_LISTEN")]
    listen: Option<SocketAddr>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration (secrets masked) and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    info!("vmportal v{}", vmportal_common::VERSION);

    let config_path = cli.config.unwrap_or_else(vmportal_common::default_config_path);
    let mut config = PortalConfig::load(&config_path)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    info!(
        config = %config_path.display(),
        proxmox = %config.proxmox.base_url,
        verify_tls = config.proxmox.verify_tls,
        "Configuration loaded"
    );

    let addr = config.listen;
    let shutdown = CancellationToken::new();
    let server = WebServer::from_config(config, shutdown.clone())?;
    let mut server_handle = tokio::spawn(server.serve(addr));

    // Wait for shutdown signal
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown.cancel();
            server_handle.await
        }
        result = &mut server_handle => result,
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Web server error: {}", e),
        Err(e) => error!("Web server task failed: {}", e),
    }

    info!("vmportal shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["vmportald", "--print-config", "--listen", "0.0.0.0:9000"]).unwrap();
        assert!(cli.print_config);
        assert_eq!(cli.listen, Some("0.0.0.0:9000".parse().unwrap()));
        assert!(!Cli::try_parse_from(["vmportald"]).unwrap().print_config);
    }

    #[test]
    fn test_printed_config_shows_effective_listen() {
        let mut config = PortalConfig::default();
        config.listen = "0.0.0.0:9000".parse().unwrap();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains(r#"listen = "0.0.0.0:9000""#), "{}", rendered);
        assert!(rendered.contains("[console]"), "{}", rendered);
    }
}
