//! Laurel - settlement and reconciliation core for on-chain learning rewards

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use laurel::{
    config::Args,
    db::{
        MemoryConversationStore, MemoryCounterStore, MemoryReservationStore, MongoClient,
        MongoConversationStore, MongoCounterStore, MongoReservationStore,
    },
    ledger::{
        indexer::HttpConversationIndexer,
        rpc::HttpLedgerRpc,
        script::P2shScriptBuilder,
    },
    mint::{spawn_sweep_task, MintConfig, MintReservationManager},
    queue::{spawn_settlement_worker, LedgerExecutor, QueueConfig},
    reconcile::{spawn_sync_task, ReconcileConfig, ReconciliationEngine},
    service::{OpenGate, SettlementService, StaticWhitelist, WhitelistGate},
    tokens::TokenIdAllocator,
    utxo::UtxoReservationManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("laurel={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Laurel - settlement core");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Ledger RPC: {}", args.ledger_rpc_url);
    info!("Indexer: {}", args.indexer_url);
    info!("MongoDB: {}", args.mongodb_uri);
    info!("Treasury: {}", args.funding_address());
    info!("Sync interval: {}s", args.sync_interval_secs);
    info!("Sweep interval: {}s", args.sweep_interval_secs);
    info!("Reservation expiry: {}m", args.reservation_expiry_minutes);
    info!("======================================");

    // Connect to MongoDB (optional in dev mode)
    let mongo = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => {
            info!("MongoDB connected successfully");
            Some(client)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, using in-memory stores): {}", e);
                None
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    // Store layer: Mongo in production, memory fallback in dev mode
    let (reservation_store, conversation_store, counter_store): (
        Arc<dyn laurel::db::ReservationStore>,
        Arc<dyn laurel::db::ConversationStore>,
        Arc<dyn laurel::db::CounterStore>,
    ) = match &mongo {
        Some(client) => (
            Arc::new(MongoReservationStore::new(client).await?),
            Arc::new(MongoConversationStore::new(client).await?),
            Arc::new(MongoCounterStore::new(client).await?),
        ),
        None => (
            Arc::new(MemoryReservationStore::new()),
            Arc::new(MemoryConversationStore::new()),
            Arc::new(MemoryCounterStore::new()),
        ),
    };

    // External collaborators
    let timeout = Duration::from_millis(args.request_timeout_ms);
    let rpc = Arc::new(HttpLedgerRpc::new(&args.ledger_rpc_url, timeout)?);
    let indexer = Arc::new(HttpConversationIndexer::new(&args.indexer_url, timeout)?);

    // Token allocation, warm-started from persisted counters
    let allocator = Arc::new(TokenIdAllocator::new(Arc::clone(&counter_store)));
    let hydrated = allocator.hydrate().await?;
    info!("Hydrated {} token counter(s)", hydrated);

    // Mint state machine
    let scripts = Arc::new(P2shScriptBuilder::new(&args.network_prefix));
    let mint = Arc::new(MintReservationManager::new(
        Arc::clone(&reservation_store),
        Arc::clone(&allocator),
        scripts,
        MintConfig {
            expiry_minutes: args.reservation_expiry_minutes,
            default_max_supply: args.collection_max_supply,
            ..MintConfig::default()
        },
    ));

    // Reconciliation engine, warm-started from the persisted view
    let engine = Arc::new(ReconciliationEngine::new(
        indexer,
        Arc::clone(&rpc) as _,
        Arc::clone(&conversation_store),
        ReconcileConfig {
            relay_addresses: args.relay_address_list(),
            sync_interval: Duration::from_secs(args.sync_interval_secs),
            strict_sender_check: args.strict_sender_check,
        },
    ));
    let warmed = engine.warm_start().await?;
    info!("Warm-started {} conversation record(s)", warmed);

    // Settlement queue
    let utxos = Arc::new(UtxoReservationManager::new());
    let executor = Arc::new(LedgerExecutor::new(
        Arc::clone(&rpc) as _,
        utxos,
        Arc::clone(&mint),
        Arc::clone(&reservation_store),
        args.funding_address(),
    ));
    let (queue, queue_handle) = spawn_settlement_worker(
        executor,
        QueueConfig {
            max_attempts: args.queue_max_attempts,
            ..QueueConfig::default()
        },
    );

    // Eligibility gate: whitelist when configured, open otherwise
    let whitelist = args.reward_whitelist_list();
    let gate: Arc<dyn WhitelistGate> = if whitelist.is_empty() {
        if !args.dev_mode {
            warn!("No reward whitelist configured; gate is open");
        }
        Arc::new(OpenGate)
    } else {
        info!("Reward whitelist active ({} address(es))", whitelist.len());
        Arc::new(StaticWhitelist::new(whitelist))
    };

    let _service = Arc::new(SettlementService::new(
        Arc::clone(&mint),
        Arc::clone(&engine),
        queue,
        gate,
    ));

    // Background maintenance
    let sweep_handle = spawn_sweep_task(mint, Duration::from_secs(args.sweep_interval_secs));
    let sync_handle = spawn_sync_task(engine);

    info!("Laurel is up");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = queue_handle => {
            error!("Settlement worker exited unexpectedly");
        }
        _ = sweep_handle => {
            error!("Expiry sweep task exited unexpectedly");
        }
        _ = sync_handle => {
            error!("Reconciliation sync task exited unexpectedly");
        }
    }

    info!("Laurel shut down");
    Ok(())
}
