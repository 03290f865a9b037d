use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use bencher_proxy::admission::{ChainPolicy, Engine, RoundCaches};
use bencher_proxy::api::{self, ratelimit::RateLimiter, AppState};
use bencher_proxy::capacity::ClientRegistry;
use bencher_proxy::chain::{Chain, ChainState};
use bencher_proxy::config::Config;
use bencher_proxy::refresher::Refresher;
use bencher_proxy::tracing::{self, prelude::*};
use bencher_proxy::upstream::{PullUpstream, PushUpstream, Transport};

/// Attempts at obtaining the initial mining info before giving up. Push
/// upstreams need a moment to connect and deliver their first round.
const STARTUP_ATTEMPTS: u32 = 10;

#[derive(Parser)]
#[command(version, about = "Proof-of-capacity mining proxy")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn build_upstream(
    url: &str,
    account_key: &str,
    passphrase: &str,
    ip_forwarding: bool,
    config: &Config,
    tracker: &TaskTracker,
    running: &CancellationToken,
) -> anyhow::Result<Arc<Transport>> {
    if url.starts_with("wss") {
        let push = PushUpstream::new(
            url.to_string(),
            account_key.to_string(),
            config.miner_name.clone(),
        );
        tracker.spawn(push.clone().run(running.clone()));
        Ok(Arc::new(Transport::Push(push)))
    } else {
        let pull = PullUpstream::new(
            url.to_string(),
            account_key.to_string(),
            passphrase.to_string(),
            ip_forwarding,
            config.miner_alias.clone(),
        )?;
        Ok(Arc::new(Transport::Pull(pull)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load_from(&args.config)
        .with_context(|| format!("load {}", args.config.display()))?;
    tracing::init(config.file_logging);

    info!(version = bencher_proxy::VERSION, "bencher-proxy starting");
    info!(address = %config.listen_address, "proxy address");
    info!(
        primary = %config.primary_submit_url,
        secondary = config.secondary_submit_url().unwrap_or("-"),
        "upstreams"
    );
    info!(limit = config.rate_limit, burst = config.burst_rate, "rate limiter");
    if config.cert_file.is_some() || config.key_file.is_some() {
        warn!("certFile/keyFile present; TLS termination is expected from the fronting proxy");
    }

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let clients = Arc::new(ClientRegistry::new());
    let chains = Arc::new(ChainState::new(
        config.primary_target_deadline,
        config.secondary_target_deadline,
    ));
    let caches = Arc::new(RoundCaches::new());

    let primary = build_upstream(
        &config.primary_submit_url,
        &config.primary_account_key,
        &config.primary_passphrase,
        config.primary_ip_forwarding,
        &config,
        &tracker,
        &running,
    )?;
    let secondary = match config.secondary_submit_url() {
        Some(url) => Some(build_upstream(
            url,
            &config.secondary_account_key,
            &config.secondary_passphrase,
            config.secondary_ip_forwarding,
            &config,
            &tracker,
            &running,
        )?),
        None => None,
    };
    let push = [Some(&primary), secondary.as_ref()]
        .into_iter()
        .flatten()
        .find(|transport| matches!(transport.as_ref(), Transport::Push(_)))
        .cloned();

    let refresher = Refresher::new(
        chains.clone(),
        caches.clone(),
        clients.clone(),
        primary.clone(),
        secondary.clone(),
        config.scan_time,
        config.display_miners,
    );

    // The listener only starts once the primary chain has a published round.
    let mut startup_err = None;
    for attempt in 0..STARTUP_ATTEMPTS {
        startup_err = match refresher.refresh().await {
            Ok(()) if chains.current_info(Chain::Primary).is_some() => None,
            Ok(()) => Some(anyhow::anyhow!("primary mining info not yet available")),
            Err(e) => Some(e.into()),
        };
        if startup_err.is_none() {
            break;
        }
        if attempt + 1 < STARTUP_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    if let Some(e) = startup_err {
        return Err(e).context("get initial mining info");
    }

    let engine = Arc::new(Engine::new(
        chains.clone(),
        clients.clone(),
        caches,
        primary,
        secondary,
        [
            ChainPolicy {
                ignore_worse_deadlines: config.primary_ignore_worse_deadlines,
            },
            ChainPolicy {
                ignore_worse_deadlines: config.secondary_ignore_worse_deadlines,
            },
        ],
        config.miners_per_ip,
        config.lie_detector,
    ));

    let state = AppState {
        engine,
        chains,
        clients,
        push,
        limiter: Arc::new(RateLimiter::new(config.rate_limit, config.burst_rate)),
    };

    tracker.spawn(refresher.run(running.clone()));

    if let Some(stats_addr) = config.stats_listen_addr.clone() {
        let listener = TcpListener::bind(&stats_addr)
            .await
            .with_context(|| format!("bind {stats_addr}"))?;
        let app = api::stats_routes(state.clone());
        let shutdown = running.clone();
        tracker.spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!(error = %e, "stats listener failed");
            }
        });
    }

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("bind {}", config.listen_address))?;
    let app = api::miner_routes(state);
    let shutdown = running.clone();
    tracker.spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        {
            error!(error = %e, "miner listener failed");
        }
    });
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();
    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
