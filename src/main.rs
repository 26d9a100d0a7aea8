use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use secrecy::SecretString;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use mail_relay::admin::admin_routes;
use mail_relay::channels::HttpChannels;
use mail_relay::config::FileSettings;
use mail_relay::mailbox::ImapProvider;
use mail_relay::relay::PollLoop;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let settings = FileSettings::from_env();

    eprintln!("📨 Mail Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", settings.path().display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Admin API ────────────────────────────────────────────────────────
    let admin_addr = env_var("MAIL_RELAY_ADMIN_ADDR");
    let admin_token = env_var("MAIL_RELAY_ADMIN_TOKEN");
    match (admin_addr, admin_token) {
        (Some(addr), Some(token)) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("Invalid MAIL_RELAY_ADMIN_ADDR: {addr}"))?;
            let app = admin_routes(settings.path().to_path_buf(), SecretString::from(token));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind admin API on {addr}"))?;
            eprintln!("   Admin API: http://{}/api/config", addr);

            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let shutdown = async move {
                    let _ = rx.wait_for(|stop| *stop).await;
                };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!(error = %e, "Admin API server stopped");
                }
            });
        }
        (Some(_), None) => {
            warn!("MAIL_RELAY_ADMIN_ADDR set without MAIL_RELAY_ADMIN_TOKEN — admin API disabled");
        }
        _ => {}
    }

    eprintln!("   Press Ctrl-C to stop.\n");

    // ── Shutdown ─────────────────────────────────────────────────────────
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Without a signal handler the relay runs until killed.
                error!(error = %e, "Failed to listen for Ctrl-C");
                let _keep_open = shutdown_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    // ── Relay ────────────────────────────────────────────────────────────
    let mut relay = PollLoop::new(
        Arc::new(settings),
        Arc::new(ImapProvider::default()),
        Arc::new(HttpChannels),
    );
    relay.run(shutdown_rx).await;

    Ok(())
}

/// Console logging, plus a daily-rolling file under `MAIL_RELAY_LOG_DIR`
/// when set. The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match env_var("MAIL_RELAY_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
