use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

use lnurl_bridge::cache::CacheService;
use lnurl_bridge::channel::HttpCallbackChannel;
use lnurl_bridge::config::Args;
use lnurl_bridge::dns::{DnsService, NoDns, TsigDns};
use lnurl_bridge::nostr::NostrManager;
use lnurl_bridge::persist::cleanup::{LnurlCleanupService, NwcCleanupService};
use lnurl_bridge::persist::{Store, postgres};
use lnurl_bridge::routes;
use lnurl_bridge::state::AppState;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();

    let pool = postgres::connect(&args.database_url)
        .await
        .map_err(|e| anyhow!("failed to connect to postgres: {e}"))?;
    if args.auto_migrate {
        postgres::run_migrations(&pool)
            .await
            .map_err(|e| anyhow!("failed to run migrations: {e}"))?;
    }

    let store = Store::postgres(pool.clone());
    let cache: Arc<dyn CacheService> = Arc::new(postgres::PostgresCache::new(pool));
    let dns = build_dns(&args)?;

    let root_url = args.root_url()?;
    let root = CancellationToken::new();

    let channel = Arc::new(HttpCallbackChannel::new(format!("{root_url}/response")));
    let nostr = Arc::new(NostrManager::new(Arc::clone(&store.nwc), root.clone()));
    if let Err(e) = nostr.start().await {
        error!("failed to start nostr manager: {e}");
    }

    LnurlCleanupService::new(Arc::clone(&store.lnurl)).start(root.clone());
    let mut nwc_cleanup = NwcCleanupService::new(Arc::clone(&store.nwc));
    let manager = Arc::clone(&nostr);
    nwc_cleanup.on_cleanup(Arc::new(move || {
        let manager = Arc::clone(&manager);
        async move { manager.resubscribe().await }.boxed()
    }));
    nwc_cleanup.start(root.clone());

    let state = AppState {
        store,
        cache,
        dns,
        channel,
        nostr,
        root_url,
        domain: args.domain()?,
    };

    let addr = args.internal_addr()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    let shutdown = root.clone();
    let server = axum::serve(listener, routes::router(state).into_make_service())
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to create Ctrl+C shutdown signal");
            shutdown.cancel();
        });
    if let Err(e) = server.await {
        error!("shutdown error: {e}");
    }
    root.cancel();
    Ok(())
}

fn build_dns(args: &Args) -> Result<Arc<dyn DnsService>, anyhow::Error> {
    let (Some(name_server), Some(tsig_key), Some(tsig_secret)) =
        (&args.name_server, &args.tsig_key, &args.tsig_secret)
    else {
        warn!("no name server or TSIG key configured, offers will not be published over DNS");
        return Ok(Arc::new(NoDns));
    };

    let domain = Url::parse(&args.external_url)?
        .host_str()
        .ok_or_else(|| anyhow!("external URL has no host"))?
        .to_string();
    let dns = TsigDns::new(
        name_server.clone(),
        args.dns_protocol,
        &domain,
        tsig_key,
        tsig_secret,
    )
    .map_err(|e| anyhow!("failed to set up DNS publisher: {e}"))?;
    Ok(Arc::new(dns))
}
