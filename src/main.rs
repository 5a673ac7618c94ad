use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::mpsc;

use copytrade::api::create_router;
use copytrade::config::{AppConfig, StoreBackend};
use copytrade::db::{self, MemoryStore, PgStore, StateStore};
use copytrade::execution::dispatcher::{Dispatcher, DispatcherSettings, QueuedIntent};
use copytrade::execution::reconciler::{run_reconciler, Reconciler};
use copytrade::execution::swap_client::{SwapApiAuth, SwapApiClient};
use copytrade::execution::{DryRunVenue, ExecutionVenue, IdempotencyGuard};
use copytrade::ingestion::pipeline::{run_cursor_checkpoints, run_feed, spawn_workers, WorkerContext};
use copytrade::ingestion::ws_listener::{Channel, WsFeedSource};
use copytrade::ingestion::{FeedAdapter, FeedSource, WatermarkTracker};
use copytrade::registry::SubscriptionRegistry;
use copytrade::services::notifier::{LogSink, NotificationSink, Notifier};
use copytrade::services::order_expiry::run_order_expiry;
use copytrade::services::subscriptions::SubscriptionService;
use copytrade::trigger::EvaluatorSettings;
use copytrade::AppState;

const WALLET_SOURCE_ID: &str = "wallets";
const PRICE_SOURCE_ID: &str = "prices";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    // Several TLS clients share one process; pin the provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    let metrics_handle = copytrade::metrics::init_metrics()?;

    let store: Arc<dyn StateStore> = match (config.store_backend, &config.database_url) {
        (StoreBackend::Postgres, Some(url)) => {
            tracing::info!("Connecting to database...");
            let pool = db::init_pool(url).await?;
            tracing::info!("Database connected");
            Arc::new(PgStore::new(pool))
        }
        (StoreBackend::Postgres, None) => anyhow::bail!("DATABASE_URL must be set"),
        (StoreBackend::Memory, _) => {
            tracing::warn!("STORE_BACKEND=memory: state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let notifier: Arc<dyn NotificationSink> =
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat)) => {
                tracing::info!("Telegram notifications enabled");
                Arc::new(Notifier::new(token.clone(), chat.clone()))
            }
            _ => {
                tracing::info!("Telegram not configured: notifications go to the log");
                Arc::new(LogSink)
            }
        };

    let venue: Arc<dyn ExecutionVenue> = match (
        config.live_trading(),
        &config.swap_api_url,
        &config.swap_api_key,
        &config.swap_api_secret,
    ) {
        (true, Some(url), Some(key), Some(secret)) => {
            tracing::warn!(url = %url, "LIVE trading enabled");
            let auth = SwapApiAuth::new(key.clone(), secret.clone());
            Arc::new(SwapApiClient::new(auth, url)?)
        }
        _ => {
            tracing::info!("Dry-run mode: swaps are simulated");
            Arc::new(DryRunVenue::new())
        }
    };

    // --- Shared state: registry, guard, watermarks ---
    let registry = Arc::new(SubscriptionRegistry::new());
    let guard = Arc::new(IdempotencyGuard::new(
        config.guard_soft_capacity,
        chrono::Duration::seconds(config.revocation_ttl_secs),
    ));
    let watermarks = Arc::new(WatermarkTracker::new());
    let pause_flag = Arc::new(AtomicBool::new(false));

    let subscriptions = Arc::new(SubscriptionService::new(
        store.clone(),
        registry.clone(),
        guard.clone(),
        notifier.clone(),
    ));
    subscriptions.bootstrap().await?;

    // --- Crash reconciliation before any new execution ---
    let reconciler = Arc::new(Reconciler::new(store.clone(), venue.clone(), notifier.clone()));
    let report = reconciler.reconcile_once(chrono::Duration::zero()).await?;
    tracing::info!(
        settled = report.settled,
        still_pending = report.still_pending,
        errors = report.errors,
        "Startup reconciliation complete"
    );

    // --- Execution layer ---
    let (intent_tx, intent_rx) = mpsc::channel::<QueuedIntent>(config.queue_capacity.max(1));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        venue.clone(),
        notifier.clone(),
        DispatcherSettings {
            workers: config.executor_workers,
            ..DispatcherSettings::default()
        },
        pause_flag.clone(),
    ));
    tokio::spawn(dispatcher.clone().run(intent_rx));

    // --- Evaluation layer ---
    let settings = EvaluatorSettings {
        staleness: chrono::Duration::seconds(config.staleness_secs),
        intent_ttl: chrono::Duration::seconds(config.intent_ttl_secs),
    };
    let ctx = WorkerContext {
        registry: registry.clone(),
        guard: guard.clone(),
        watermarks: watermarks.clone(),
        intents: intent_tx,
    };
    let (router, workers) = spawn_workers(config.evaluator_workers, config.queue_capacity, settings, ctx);
    for (id, handle) in workers.into_iter().enumerate() {
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(worker = id, error = %e, "Evaluator worker exited"),
                Err(e) => tracing::error!(worker = id, error = %e, "Evaluator worker panicked"),
            }
        });
    }

    // --- Ingestion: one adapter per configured feed ---
    let feeds = [
        (WALLET_SOURCE_ID, config.wallet_feed_url.clone(), Channel::Swaps),
        (PRICE_SOURCE_ID, config.price_feed_url.clone(), Channel::Prices),
    ];
    for (source_id, url, channel) in feeds {
        let Some(url) = url else {
            tracing::warn!(source = source_id, "Feed URL not set: source disabled");
            continue;
        };

        let cursor = store.load_cursor(source_id).await?;
        if let Some(next_seq) = cursor {
            watermarks.seed(source_id, next_seq);
        }
        let source: Arc<dyn FeedSource> = Arc::new(WsFeedSource::new(
            source_id,
            url,
            channel,
            config.feed_chain_id.clone(),
            registry.clone(),
        ));
        tracing::info!(source = source_id, from_seq = ?cursor, "Starting feed");

        let adapter = FeedAdapter::new(source, cursor);
        let (router, watermarks, store, notifier) =
            (router.clone(), watermarks.clone(), store.clone(), notifier.clone());
        tokio::spawn(async move {
            if let Err(e) = run_feed(adapter, router, watermarks, store, notifier).await {
                tracing::error!(source = source_id, error = %e, "Feed stopped");
            }
        });
    }

    // --- Background services ---
    tokio::spawn(run_cursor_checkpoints(
        store.clone(),
        watermarks.clone(),
        config.cursor_checkpoint_secs,
    ));
    tokio::spawn(run_order_expiry(subscriptions.clone(), config.expiry_sweep_secs));
    tokio::spawn(run_reconciler(
        reconciler,
        config.reconcile_interval_secs,
        config.reconcile_stale_secs,
    ));

    let state = AppState {
        store,
        config,
        metrics_handle,
        registry,
        guard,
        subscriptions,
        dispatcher: Some(dispatcher),
        pause_flag,
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
