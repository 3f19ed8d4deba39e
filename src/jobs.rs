//! Persistent job queue with typed dispatch and retry/dead-letter
//! policy. Grounded on the `mntogether` kernel job-queue example's
//! shapes (`EnqueueResult::{Created,Duplicate}`, `ClaimedJob`, typed
//! `ErrorKind`), adapted from a Postgres-backed pull queue to a
//! Store-backed push queue: `Dispatch` persists then sends on a bounded
//! `mpsc` channel, so a full channel blocks the sender and gives the
//! Event Listener natural backpressure.

use crate::aggregate::{classify_outliers, median};
use crate::chain_types::{JobKind, JobRequest, JobStatus};
use crate::errors::OracleError;
use crate::feeds::{FeedRegistry, SourceSpec};
use crate::fetcher::{FetchOpts, FetchSource, Fetcher};
use crate::metrics::Metrics;
use crate::proof::ProofEngine;
use crate::signer::Signer;
use crate::store::FileStore;
use crate::tx_manager::TxManager;
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::middleware::Middleware;
use ethers::types::{Address, Bytes, U256};
use ethers::utils::keccak256;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const PENDING_NS: &str = "jobs/pending";
const DLQ_NS: &str = "jobs/dlq";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Created,
    Duplicate,
}

/// Out-of-scope compute handler seam: the dispatch path is real, the
/// adapter behind it is not. `NoopComputeAdapter` is the default and
/// always refuses, non-retryably.
#[async_trait]
pub trait ComputeAdapter: Send + Sync {
    async fn handle(&self, job: &JobRequest) -> Result<(), OracleError>;
}

pub struct NoopComputeAdapter;

#[async_trait]
impl ComputeAdapter for NoopComputeAdapter {
    async fn handle(&self, _job: &JobRequest) -> Result<(), OracleError> {
        Err(OracleError::ComputeUnavailable)
    }
}

pub struct JobEngineConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub oracle_contract: Address,
    pub fetch_opts: FetchOpts,
    pub outlier_k_num: i128,
    pub outlier_k_den: i128,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            worker_count: num_cpus::get(),
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            oracle_contract: Address::zero(),
            fetch_opts: FetchOpts::default(),
            outlier_k_num: 3,
            outlier_k_den: 1,
        }
    }
}

pub struct JobEngine<M: Middleware + 'static> {
    store: FileStore,
    cfg: JobEngineConfig,
    sender: mpsc::Sender<JobRequest>,
    receiver: Mutex<Option<mpsc::Receiver<JobRequest>>>,
    fetcher: Arc<Fetcher>,
    feeds: Arc<FeedRegistry>,
    proof_engine: Arc<ProofEngine>,
    signer: Arc<Signer>,
    tx_manager: Arc<TxManager<M>>,
    compute: Arc<dyn ComputeAdapter>,
    metrics: Arc<Metrics>,
}

impl<M: Middleware + 'static> JobEngine<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: FileStore,
        cfg: JobEngineConfig,
        fetcher: Arc<Fetcher>,
        feeds: Arc<FeedRegistry>,
        proof_engine: Arc<ProofEngine>,
        signer: Arc<Signer>,
        tx_manager: Arc<TxManager<M>>,
        compute: Option<Arc<dyn ComputeAdapter>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(cfg.queue_capacity);
        Arc::new(Self {
            store,
            cfg,
            sender,
            receiver: Mutex::new(Some(receiver)),
            fetcher,
            feeds,
            proof_engine,
            signer,
            tx_manager,
            compute: compute.unwrap_or_else(|| Arc::new(NoopComputeAdapter)),
            metrics,
        })
    }

    /// Persists the job at `jobs/pending/<jobId>`, then enqueues it.
    /// Idempotent on `job.id`: a terminal record already on disk is a
    /// no-op (`Duplicate`); a `Pending` record is re-armed and resent.
    pub async fn dispatch(&self, job: JobRequest) -> Result<EnqueueResult, OracleError> {
        if let Ok(existing) = self.store.get_json::<JobRequest>(PENDING_NS, &job.id) {
            if matches!(existing.status, JobStatus::Completed | JobStatus::DeadLettered) {
                return Ok(EnqueueResult::Duplicate);
            }
        }

        self.store.put_json(PENDING_NS, &job.id, &job)?;
        self.sender
            .send(job)
            .await
            .map_err(|_| OracleError::Store("job engine channel closed".to_string()))?;
        self.metrics.record_request_processed();
        Ok(EnqueueResult::Created)
    }

    /// Re-enqueues every job still `Pending` on disk. Called at startup
    /// before the Event Listener begins a new subscription, so jobs
    /// in flight at the last shutdown are never silently dropped.
    pub async fn requeue_pending(self: &Arc<Self>) -> Result<usize, OracleError> {
        let mut count = 0;
        for key in self.store.list(PENDING_NS)? {
            let job: JobRequest = self.store.get_json(PENDING_NS, &key)?;
            if matches!(job.status, JobStatus::Pending | JobStatus::InFlight) {
                self.sender
                    .send(job)
                    .await
                    .map_err(|_| OracleError::Store("job engine channel closed".to_string()))?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Spawns one task per active feed carrying a configured heartbeat,
    /// waking on `tokio::time::interval(heartbeat)` to synthesize and
    /// dispatch a refresh job when the chain has been silent for that
    /// feed. Purely advisory: it never gates or blocks requested jobs,
    /// it only adds extra ones to the same queue.
    pub fn spawn_heartbeats(
        self: &Arc<Self>,
        feeds: Vec<crate::feeds::FeedConfig>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        feeds
            .into_iter()
            .filter(|feed| feed.active)
            .filter_map(|feed| feed.heartbeat.map(|hb| (feed.feed_id, hb)))
            .map(|(feed_id, heartbeat)| {
                let engine = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(heartbeat);
                    ticker.tick().await; // first tick fires immediately; skip it
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                let job = JobRequest::new_heartbeat(&feed_id, now_unix());
                                if let Err(e) = engine.dispatch(job).await {
                                    tracing::warn!(feed_id = %feed_id, error = %e, "heartbeat dispatch failed");
                                }
                            }
                            _ = cancel.cancelled() => {
                                tracing::info!(feed_id = %feed_id, "heartbeat loop stopped (shutdown requested)");
                                return;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Spawns `workerCount` tasks sharing one `mpsc::Receiver` behind a
    /// mutex. Each worker loops until the channel closes (on shutdown,
    /// once every sender — including `dispatch`'s held clone — drops).
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.cfg.worker_count);
        for worker_id in 0..self.cfg.worker_count {
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker_id).await;
            }));
        }
        handles
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let job = {
                let mut guard = self.receiver.lock().await;
                match guard.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => None,
                }
            };
            let Some(mut job) = job else {
                tracing::info!(worker_id, "job engine channel closed; worker exiting");
                return;
            };

            job.status = JobStatus::InFlight;
            if let Err(e) = self.store.put_json(PENDING_NS, &job.id, &job) {
                tracing::error!(job_id = %job.id, error = %e, "failed to mark job in-flight");
            }

            let outcome = AssertUnwindSafe(self.handle(&job)).catch_unwind().await;
            let result = match outcome {
                Ok(inner) => inner,
                Err(panic) => {
                    let message = panic_message(panic);
                    tracing::error!(job_id = %job.id, %message, "job handler panicked");
                    Err(OracleError::HandlerPanic(message))
                }
            };

            match result {
                Ok(()) => {
                    job.status = JobStatus::Completed;
                    if let Err(e) = self.store.put_json(PENDING_NS, &job.id, &job) {
                        tracing::error!(job_id = %job.id, error = %e, "failed to persist completion");
                    }
                    tracing::info!(job_id = %job.id, worker_id, "job completed");
                }
                Err(err) => self.handle_failure(job, err).await,
            }
        }
    }

    async fn handle_failure(self: &Arc<Self>, mut job: JobRequest, err: OracleError) {
        if err.fatal() {
            tracing::error!(job_id = %job.id, error = %err, "fatal error processing job; node should halt");
        }

        if err.retryable() && job.attempts < self.cfg.max_retries {
            job.attempts += 1;
            job.status = JobStatus::Pending;
            let delay = backoff_for(job.attempts, self.cfg.base_backoff, self.cfg.max_backoff);
            tracing::warn!(job_id = %job.id, attempts = job.attempts, error = %err, delay_ms = delay.as_millis() as u64, "job failed; retrying");

            if let Err(e) = self.store.put_json(PENDING_NS, &job.id, &job) {
                tracing::error!(job_id = %job.id, error = %e, "failed to persist retry state");
            }

            let engine = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = engine.sender.send(job).await {
                    tracing::error!(error = %e, "failed to requeue job after backoff");
                }
            });
        } else {
            job.status = JobStatus::DeadLettered;
            tracing::error!(job_id = %job.id, attempts = job.attempts, error = %err, "job dead-lettered");
            if let Err(e) = self.store.put_json(DLQ_NS, &job.id, &job) {
                tracing::error!(job_id = %job.id, error = %e, "failed to persist dead-letter record");
            }
            let _ = self.store.delete(PENDING_NS, &job.id);
            if let Ok(dlq) = self.store.list(DLQ_NS) {
                self.metrics.set_dlq_size(dlq.len() as u64);
            }
        }
    }

    async fn handle(&self, job: &JobRequest) -> Result<(), OracleError> {
        match job.kind {
            JobKind::DataFeed => self.handle_data_feed(job).await,
            JobKind::Vrf => self.handle_vrf(job).await,
            JobKind::Compute => self.compute.handle(job).await,
        }
    }

    async fn handle_data_feed(&self, job: &JobRequest) -> Result<(), OracleError> {
        let feed_id = job
            .params
            .get("feedId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OracleError::Decode("data feed job missing feedId".to_string()))?;
        let min: u128 = parse_u128_param(job, "min")?;
        let max: u128 = parse_u128_param(job, "max")?;

        let feed = self
            .feeds
            .get(feed_id)
            .await
            .ok_or_else(|| OracleError::Decode(format!("unknown feed {feed_id}")))?;

        let fetch_opts = FetchOpts {
            decimals: feed.decimals,
            ..self.cfg.fetch_opts.clone()
        };
        let mut samples = Vec::with_capacity(feed.sources.len());
        for source in &feed.sources {
            let fetch_source = fetch_source_for(source);
            match self
                .fetcher
                .fetch(&fetch_source, &source.json_path, &fetch_opts)
                .await
            {
                Ok(result) => samples.push(result.value),
                Err(err) => tracing::warn!(feed_id, source = %source.url, error = %err, "source fetch failed; continuing with remaining sources"),
            }
        }

        if samples.len() < feed.min_responses {
            return Err(OracleError::PermanentFetchFailure(format!(
                "feed {feed_id}: only {} of {} required sources responded",
                samples.len(),
                feed.min_responses
            )));
        }

        let flags = classify_outliers(&samples, self.cfg.outlier_k_num, self.cfg.outlier_k_den)
            .ok_or_else(|| OracleError::PermanentFetchFailure(format!("feed {feed_id}: empty sample")))?;
        let outlier_count = flags.iter().filter(|&&is_outlier| is_outlier).count();
        if outlier_count > 0 {
            self.metrics.record_outliers_filtered(outlier_count as u64);
        }
        let survivors: Vec<i128> = samples
            .iter()
            .zip(flags.iter())
            .filter(|(_, &is_outlier)| !is_outlier)
            .map(|(&v, _)| v)
            .collect();
        let value = median(&survivors).ok_or_else(|| {
            OracleError::PermanentFetchFailure(format!(
                "feed {feed_id}: every sample was classified an outlier"
            ))
        })?;
        self.metrics.record_aggregation_performed();

        if value < 0 {
            return Err(OracleError::PermanentFetchFailure(format!(
                "feed {feed_id}: aggregated value {value} is negative"
            )));
        }

        let proof = self.proof_engine.prove_range(value as u128, min, max).await?;
        self.metrics.record_proof_generated("range");

        let request_id = job
            .params
            .get("requestId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| job.id.clone());
        let calldata = encode_fulfill_data(&request_id, value, &proof, [min, max])?;
        self.tx_manager
            .submit(self.cfg.oracle_contract, calldata)
            .await?;
        self.metrics.record_transaction_sent();
        Ok(())
    }

    async fn handle_vrf(&self, job: &JobRequest) -> Result<(), OracleError> {
        let seed_hex = job
            .params
            .get("seed")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OracleError::Decode("vrf job missing seed".to_string()))?;
        let seed_bytes = hex::decode(seed_hex.trim_start_matches("0x"))
            .map_err(|e| OracleError::Decode(format!("invalid seed hex: {e}")))?;

        let vrf_output = self.signer.vrf(&seed_bytes)?;

        let request_id = job
            .params
            .get("requestId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| job.id.clone());
        let calldata = encode_fulfill_randomness(&request_id, &vrf_output.randomness, &vrf_output.proof_bytes)?;
        self.tx_manager
            .submit(self.cfg.oracle_contract, calldata)
            .await?;
        self.metrics.record_transaction_sent();
        Ok(())
    }
}

/// Obscured sources carry a fingerprint in `url` rather than a real
/// address; everything else fetches the plain URL.
fn fetch_source_for(source: &SourceSpec) -> FetchSource {
    if source.obscured {
        FetchSource::Fingerprint(source.url.clone())
    } else {
        FetchSource::Url(source.url.clone())
    }
}

fn parse_u128_param(job: &JobRequest, key: &str) -> Result<u128, OracleError> {
    job.params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| OracleError::Decode(format!("job missing {key}")))?
        .parse()
        .map_err(|_| OracleError::Decode(format!("job {key} is not a valid u128")))
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

fn backoff_for(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let scaled = base.saturating_mul(1u32 << attempts.min(16));
    scaled.min(cap)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn encode_fulfill_data(
    request_id: &str,
    value: i128,
    proof: &crate::proof::ProofBytes,
    public_inputs: [u128; 2],
) -> Result<Bytes, OracleError> {
    let request_id = parse_request_id(request_id)?;
    let value_token = Token::Int(U256::from(value.unsigned_abs()));
    let proof_token = Token::FixedArray(
        proof
            .iter()
            .map(|chunk| Token::FixedBytes(chunk.to_vec()))
            .collect(),
    );
    let public_inputs_token = Token::FixedArray(
        public_inputs
            .iter()
            .map(|&v| Token::Uint(U256::from(v)))
            .collect(),
    );

    let mut encoded = selector("fulfillData(uint256,int256,bytes32[8],uint256[2])").to_vec();
    encoded.extend(ethers::abi::encode(&[
        Token::Uint(request_id),
        value_token,
        proof_token,
        public_inputs_token,
    ]));
    Ok(Bytes::from(encoded))
}

fn encode_fulfill_randomness(
    request_id: &str,
    randomness: &[u8; 32],
    proof_bytes: &[u8],
) -> Result<Bytes, OracleError> {
    let request_id = parse_request_id(request_id)?;
    let mut encoded = selector("fulfillRandomness(uint256,bytes32,bytes)").to_vec();
    encoded.extend(ethers::abi::encode(&[
        Token::Uint(request_id),
        Token::FixedBytes(randomness.to_vec()),
        Token::Bytes(proof_bytes.to_vec()),
    ]));
    Ok(Bytes::from(encoded))
}

fn parse_request_id(request_id: &str) -> Result<U256, OracleError> {
    if let Some(stripped) = request_id.strip_prefix("0x") {
        U256::from_str_radix(stripped, 16)
            .map_err(|e| OracleError::Decode(format!("invalid hex requestId {request_id}: {e}")))
    } else {
        U256::from_dec_str(request_id)
            .map_err(|e| OracleError::Decode(format!("invalid requestId {request_id}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_known_function_signature() {
        // transfer(address,uint256) -> 0xa9059cbb, a widely known selector.
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);
        assert_eq!(backoff_for(0, base, cap), Duration::from_millis(100));
        assert_eq!(backoff_for(1, base, cap), Duration::from_millis(200));
        assert_eq!(backoff_for(10, base, cap), cap);
    }

    #[test]
    fn parses_decimal_and_hex_request_ids() {
        assert_eq!(parse_request_id("42").unwrap(), U256::from(42));
        assert_eq!(parse_request_id("0x2a").unwrap(), U256::from(42));
    }

    #[test]
    fn obscured_source_resolves_to_fingerprint_not_url() {
        let plain = SourceSpec {
            url: "https://example.com/price".to_string(),
            json_path: "price".to_string(),
            obscured: false,
        };
        assert!(matches!(fetch_source_for(&plain), FetchSource::Url(u) if u == plain.url));

        let obscured = SourceSpec {
            url: "src-fingerprint-1".to_string(),
            json_path: "price".to_string(),
            obscured: true,
        };
        assert!(matches!(fetch_source_for(&obscured), FetchSource::Fingerprint(f) if f == obscured.url));
    }

    #[test]
    fn fulfill_data_encodes_public_inputs_from_requested_bounds() {
        let proof: crate::proof::ProofBytes = [[7u8; 32]; 8];
        let calldata = encode_fulfill_data("42", 384_752_000_000, &proof, [300_000_000_000, 500_000_000_000])
            .unwrap();

        assert_eq!(&calldata[0..4], &selector("fulfillData(uint256,int256,bytes32[8],uint256[2])"));

        let min_word = U256::from(300_000_000_000u128);
        let max_word = U256::from(500_000_000_000u128);
        let mut min_bytes = [0u8; 32];
        min_word.to_big_endian(&mut min_bytes);
        let mut max_bytes = [0u8; 32];
        max_word.to_big_endian(&mut max_bytes);

        // publicInputs[2] is the last two 32-byte words of the static tail.
        let tail = &calldata[calldata.len() - 64..];
        assert_eq!(&tail[0..32], &min_bytes[..]);
        assert_eq!(&tail[32..64], &max_bytes[..]);
    }
}
