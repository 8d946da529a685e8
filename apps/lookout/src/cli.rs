use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::error;

use lookout_core::{HostStatus, PairingToken, ReconnectPolicy};

use crate::host::HostConnectionManager;

#[derive(Parser, Debug)]
#[command(
    name = "lookout",
    about = "Pairing relay that shows you which browser opened your link"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default when no command is given).
    Serve,
    /// Open a host session from the terminal: mint a token, print the share
    /// link, and wait for visitor reports.
    Host {
        /// Base URL of the relay server.
        #[arg(
            short,
            long,
            env = "LOOKOUT_SERVER_URL",
            default_value = "http://localhost:8080"
        )]
        server_url: String,

        /// Reproduce the legacy squaring reconnect curve instead of capped
        /// exponential backoff.
        #[arg(long, default_value_t = false)]
        legacy_backoff: bool,
    },
}

pub async fn run_host_client(server_url: String, legacy_backoff: bool) -> Result<()> {
    let token = PairingToken::generate().context("could not mint a pairing token")?;
    let policy = if legacy_backoff {
        ReconnectPolicy::squaring()
    } else {
        ReconnectPolicy::exponential()
    };

    println!("Have someone click this link:");
    println!("  {}", share_link(&server_url, &token));
    println!();
    println!("Awaiting remote visitor...");

    let (status_tx, mut status_rx) = watch::channel(HostStatus::AwaitingVisitor);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("failed to listen for ctrl-c");
        }
        let _ = shutdown_tx.send(true);
    });

    let manager = HostConnectionManager::new(token, &server_url, policy, status_tx, shutdown_rx);
    let mut runner = tokio::spawn(manager.run());

    loop {
        tokio::select! {
            res = &mut runner => {
                res.context("host session task failed")??;
                return Ok(());
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    // Status sender gone means the runner is finishing.
                    runner.await.context("host session task failed")??;
                    return Ok(());
                }
                let status = status_rx.borrow_and_update().clone();
                render_status(&status);
            }
        }
    }
}

fn render_status(status: &HostStatus) {
    match status {
        HostStatus::AwaitingVisitor => println!("Awaiting remote visitor..."),
        HostStatus::Delivered(report) => {
            println!("Remote visitor: {}", report.user_agent);
            if let Some(ip) = &report.ip {
                println!("  ip: {ip}");
            }
            if let Some(reverse_dns) = &report.reverse_dns {
                println!("  reverse dns: {reverse_dns}");
            }
            println!("  seen at: {}", report.observed_at.to_rfc3339());
        }
        HostStatus::ConnectionError => {
            println!("Connection error; retrying in the background...")
        }
    }
}

fn share_link(server_url: &str, token: &PairingToken) -> String {
    format!("{}/share-with/{}", server_url.trim_end_matches('/'), token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_link_matches_the_served_route() {
        let token: PairingToken = "abc123".parse().unwrap();
        assert_eq!(
            share_link("http://localhost:8080/", &token),
            "http://localhost:8080/share-with/abc123"
        );
    }
}
