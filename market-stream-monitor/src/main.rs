use market_stream::{MarketFeed, SharedStore, StreamConfig, Symbol};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

const SYMBOLS_ENV: &str = "MARKET_STREAM_SYMBOLS";
const SNAPSHOT_SECS_ENV: &str = "MARKET_STREAM_SNAPSHOT_SECS";

const DEFAULT_SYMBOLS: &str = "SPY,QQQ";
const DEFAULT_SNAPSHOT_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    let config = match StreamConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid market stream configuration");
            std::process::exit(1);
        }
    };

    let symbols = parse_symbols(
        &std::env::var(SYMBOLS_ENV).unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string()),
    );
    let snapshot_every = std::env::var(SNAPSHOT_SECS_ENV)
        .ok()
        .and_then(|secs| secs.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_SNAPSHOT_SECS));

    info!(
        url = %config.url,
        symbols = ?symbols,
        snapshot_secs = snapshot_every.as_secs(),
        "Starting market stream monitor"
    );

    let feed = MarketFeed::new(config, SharedStore::new());
    feed.subscribe(symbols);
    if !feed.manager().config().auto_connect {
        feed.manager().connect();
    }

    let mut snapshots = interval(snapshot_every);
    snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = snapshots.tick() => log_snapshot(&feed),
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    warn!(%error, "failed to listen for ctrl-c, shutting down");
                }
                break;
            }
        }
    }

    info!("Shutting down market stream monitor");
    feed.manager().disconnect().await;
}

fn log_snapshot(feed: &MarketFeed) {
    let state = feed.manager().state();
    let snapshot = feed.store().snapshot();
    let status = snapshot.status();

    info!(
        %state,
        connected = status.connected,
        reconnecting = status.reconnecting,
        degraded = status.degraded,
        attempt = status.reconnect_attempt,
        error = status.last_error.as_ref().map(|fault| fault.message.as_str()),
        quotes = snapshot.quotes().count(),
        "stream status"
    );

    for symbol in snapshot.subscriptions() {
        match snapshot.quote(symbol) {
            Some(quote) => info!(
                %symbol,
                last = quote.last,
                bid = ?quote.bid,
                ask = ?quote.ask,
                change_percent = ?quote.change_percent,
                "quote"
            ),
            None => debug!(%symbol, "no quote yet"),
        }

        if let Some(bar) = snapshot.latest_bar(symbol) {
            match serde_json::to_string(bar) {
                Ok(bar) => debug!(%symbol, %bar, "latest bar"),
                Err(error) => warn!(%symbol, %error, "failed to serialise bar"),
            }
        }
    }
}

/// Split a comma-separated symbol list, trimming blanks and upper-casing.
fn parse_symbols(raw: &str) -> Vec<Symbol> {
    raw.split(',')
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(|symbol| Symbol::new(symbol.to_ascii_uppercase()))
        .collect()
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
