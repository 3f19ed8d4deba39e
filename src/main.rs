mod aggregate;
mod api;
mod chain_types;
mod config;
mod errors;
mod feeds;
mod fetcher;
mod jobs;
mod listener;
mod metrics;
mod proof;
mod reorg;
mod signer;
mod store;
mod tx_manager;

use api::ApiState;
use clap::Parser;
use config::{Args, NodeConfig};
use ethers::middleware::{NonceManagerMiddleware, SignerMiddleware};
use ethers::prelude::{Http, Provider};
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer as EthersSigner};
use eyre::{eyre, Result};
use feeds::FeedRegistry;
use fetcher::Fetcher;
use jobs::{JobEngine, JobEngineConfig};
use listener::{EventListener, ListenerConfig};
use metrics::Metrics;
use proof::{CircuitKeys, ProofEngine};
use reorg::ReorgGuard;
use signer::Signer;
use std::sync::Arc;
use std::time::Duration;
use store::FileStore;
use tokio_util::sync::CancellationToken;
use tx_manager::{TxManager, TxManagerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = NodeConfig::load(args).map_err(|e| eyre!("{e}"))?;
    tracing::info!(config = %cfg.redacted_summary(), "oracle node starting");

    let private_key = std::env::var(&cfg.private_key_env).map_err(|_| {
        eyre!(
            "missing private key env var '{}'. Set it before starting the node.",
            cfg.private_key_env
        )
    })?;
    let key_bytes = hex::decode(private_key.trim_start_matches("0x"))
        .map_err(|e| eyre!("invalid private key hex in {}: {e}", cfg.private_key_env))?;
    let signing_key = k256::ecdsa::SigningKey::from_slice(&key_bytes)
        .map_err(|e| eyre!("invalid private key in {}: {e}", cfg.private_key_env))?;
    let wallet: LocalWallet = LocalWallet::from(signing_key.clone()).with_chain_id(cfg.chain_id);

    let provider = Provider::<Http>::try_from(cfg.rpc_url.as_str())?.interval(Duration::from_millis(800));

    let remote_chain_id = provider.get_chainid().await?.as_u64();
    if remote_chain_id != cfg.chain_id {
        return Err(eyre!(
            "RPC chainId mismatch: config expects {}, RPC reports {}. Refusing to start.",
            cfg.chain_id,
            remote_chain_id
        ));
    }

    let code = provider.get_code(cfg.contract, None).await?;
    if code.0.is_empty() {
        return Err(eyre!(
            "no contract code found at {:?}. Check the configured contract address and RPC.",
            cfg.contract
        ));
    }

    let signer_middleware = SignerMiddleware::new(provider, wallet.clone());
    let client = Arc::new(NonceManagerMiddleware::new(signer_middleware, wallet.address()));

    let (store, _store_lock) = FileStore::open(&cfg.data_dir).map_err(|e| eyre!("{e}"))?;

    let signer = Arc::new(Signer::new(signing_key));

    let range_keys = CircuitKeys::load(
        &cfg.proving_key_dir.join("range.pk"),
        &cfg.proving_key_dir.join("range.vk"),
    )
    .map_err(|e| eyre!("loading range circuit keys: {e}"))?;
    let vrf_keys = CircuitKeys::load(
        &cfg.proving_key_dir.join("vrf.pk"),
        &cfg.proving_key_dir.join("vrf.vk"),
    )
    .map_err(|e| eyre!("loading vrf circuit keys: {e}"))?;
    let bridge_keys = CircuitKeys::load(
        &cfg.proving_key_dir.join("bridge.pk"),
        &cfg.proving_key_dir.join("bridge.vk"),
    )
    .map_err(|e| eyre!("loading bridge circuit keys: {e}"))?;
    let proof_engine = Arc::new(ProofEngine::new(range_keys, vrf_keys, bridge_keys).map_err(|e| eyre!("{e}"))?);

    let fetcher = Arc::new(Fetcher::new(cfg.source_indirection.clone()).map_err(|e| eyre!("{e}"))?);
    let feeds = FeedRegistry::load(cfg.feeds.clone(), &store)
        .await
        .map_err(|e| eyre!("{e}"))?;

    let tx_manager = Arc::new(
        TxManager::new(
            client.clone(),
            store.clone(),
            TxManagerConfig {
                receipt_timeout: cfg.receipt_timeout,
                ..TxManagerConfig::default()
            },
            wallet.address(),
        )
        .await
        .map_err(|e| eyre!("{e}"))?,
    );

    let metrics = Arc::new(Metrics::install());

    let job_engine_cfg = JobEngineConfig {
        queue_capacity: cfg.queue_capacity,
        worker_count: cfg.worker_count,
        max_retries: cfg.max_retries,
        oracle_contract: cfg.contract,
        fetch_opts: fetcher::FetchOpts {
            max_attempts: cfg.fetch_max_attempts,
            timeout: cfg.fetch_timeout,
            ..fetcher::FetchOpts::default()
        },
        outlier_k_num: cfg.mad_k_num,
        outlier_k_den: cfg.mad_k_den,
        ..JobEngineConfig::default()
    };
    let job_engine = JobEngine::new(
        store.clone(),
        job_engine_cfg,
        fetcher,
        feeds.clone(),
        proof_engine,
        signer,
        tx_manager,
        None,
        metrics.clone(),
    );

    let reorg_guard = ReorgGuard::load(store.clone(), cfg.confirmation_depth).map_err(|e| eyre!("{e}"))?;
    let listener = Arc::new(EventListener::new(
        client,
        ListenerConfig {
            contract: cfg.contract,
            start_block: cfg.start_block,
            confirmation_depth: cfg.confirmation_depth,
            log_chunk_size: cfg.log_chunk_size,
            poll_interval: cfg.poll_interval,
        },
        reorg_guard,
    ));

    let api_state = ApiState::new(metrics.clone());

    let cancel = CancellationToken::new();

    // Re-enqueue jobs still pending from a prior run before the
    // listener begins a new subscription, so in-flight work at the
    // last shutdown is never silently dropped.
    let requeued = job_engine.requeue_pending().await.map_err(|e| eyre!("{e}"))?;
    if requeued > 0 {
        tracing::info!(requeued, "re-enqueued pending jobs from a prior run");
    }

    let worker_handles = job_engine.spawn_workers();
    let heartbeat_handles = job_engine.spawn_heartbeats(feeds.all().await, cancel.clone());

    let listener_task = {
        let listener = listener.clone();
        let job_engine = job_engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            listener.run(job_engine, cancel).await;
        })
    };

    let api_router = api::build_router(api_state.clone());
    let api_addr: std::net::SocketAddr = cfg
        .api_addr
        .parse()
        .map_err(|e| eyre!("invalid api_addr '{}': {e}", cfg.api_addr))?;
    let api_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let listener_socket = match tokio::net::TcpListener::bind(api_addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(error = %e, "failed to bind operator API; it will be unavailable");
                    return;
                }
            };
            let serve = axum::serve(listener_socket, api_router);
            tokio::select! {
                result = serve => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "operator API server exited with error");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("operator API shutting down");
                }
            }
        })
    };

    api_state.mark_ready();

    if cfg.once {
        tracing::info!("--once requested; running a single ingestion tick then exiting");
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
    } else {
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received; draining in-flight work");
        cancel.cancel();
    }

    let drain = async {
        let _ = listener_task.await;
        let _ = api_task.await;
        for handle in worker_handles {
            let _ = handle.await;
        }
        for handle in heartbeat_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        tracing::warn!("shutdown drain exceeded 30s; exiting anyway");
    }

    Ok(())
}
