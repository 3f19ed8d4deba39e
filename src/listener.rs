//! Chain event ingestion. Grounded on `opensub-keeper`'s `scanner.rs`
//! (chunked `eth_getLogs` with shrink-on-failure, confirmation-depth
//! gating via `target = latest - confirmations`) generalized from one
//! topic0 to two (`RequestData`, `RequestRandomness`) and from an
//! in-memory `BTreeSet` scan cursor to the Reorg Guard's persisted
//! `lastSafeBlock`/dedup contract.

use crate::chain_types::{ChainEvent, RequestDataEvent, RequestRandomnessEvent};
use crate::errors::OracleError;
use crate::jobs::JobEngine;
use crate::reorg::{EventKey, ReorgGuard};
use ethers::abi::{self, ParamType};
use ethers::middleware::Middleware;
use ethers::types::{Address, BlockNumber, Filter, Log, H256, U256};
use ethers::utils::id as event_id;
use std::cmp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn request_data_topic0() -> H256 {
    event_id("RequestData(uint256,string,uint256,uint256,address,bool,address,bool)")
}

fn request_data_legacy_topic0() -> H256 {
    event_id("RequestData(uint256,string,uint256,uint256,address)")
}

fn request_randomness_topic0() -> H256 {
    event_id("RequestRandomness(uint256,bytes32,address)")
}

pub struct ListenerConfig {
    pub contract: Address,
    pub start_block: u64,
    pub confirmation_depth: u64,
    pub log_chunk_size: u64,
    pub poll_interval: Duration,
}

pub struct EventListener<M: Middleware> {
    client: Arc<M>,
    cfg: ListenerConfig,
    guard: Mutex<ReorgGuard>,
}

impl<M: Middleware + 'static> EventListener<M> {
    pub fn new(client: Arc<M>, cfg: ListenerConfig, guard: ReorgGuard) -> Self {
        Self {
            client,
            cfg,
            guard: Mutex::new(guard),
        }
    }

    /// Runs forever: on each tick, scans `[lastSafeBlock+1, latest -
    /// confirmationDepth]`, decodes logs into `ChainEvent`s, dispatches
    /// each undispatched one through the Job Engine, marks it processed,
    /// then advances `lastSafeBlock`. Reconnects with backoff on RPC
    /// failure rather than exiting the task.
    pub async fn run(&self, jobs: Arc<JobEngine<M>>, cancel: tokio_util::sync::CancellationToken) {
        let mut reconnect_delay = Duration::from_secs(1);

        while !cancel_requested(&cancel) {
            match self.tick(&jobs).await {
                Ok(processed) => {
                    reconnect_delay = Duration::from_secs(1);
                    if processed == 0 {
                        tokio::time::sleep(self.cfg.poll_interval).await;
                    }
                }
                Err(err) if err.fatal() => {
                    tracing::error!(error = %err, "fatal error in event listener; halting ingestion");
                    return;
                }
                Err(err) => {
                    tracing::warn!(error = %err, backoff_s = reconnect_delay.as_secs(), "listener tick failed; backing off");
                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(60));
                }
            }
        }
        tracing::info!("event listener stopped (shutdown requested)");
    }

    async fn tick(&self, jobs: &Arc<JobEngine<M>>) -> Result<usize, OracleError> {
        let latest = self
            .client
            .get_block_number()
            .await
            .map_err(|e| OracleError::TransientFetchFailure(format!("get_block_number: {e}")))?
            .as_u64();
        let target = latest.saturating_sub(self.cfg.confirmation_depth);

        let (from, safe_block) = {
            let guard = self.guard.lock().await;
            (
                (guard.last_safe_block() + 1).max(self.cfg.start_block),
                guard.last_safe_block(),
            )
        };

        if safe_block > 0 {
            let current_hash = self.block_hash(safe_block).await?;
            let guard = self.guard.lock().await;
            guard.verify_safe_block_hash(current_hash)?;
        }

        if from > target {
            return Ok(0);
        }

        let mut processed = 0usize;
        let mut chunk = self.cfg.log_chunk_size.max(1);
        let mut cursor = from;

        while cursor <= target {
            let end = cmp::min(cursor.saturating_add(chunk - 1), target);

            let logs = match self.fetch_logs(cursor, end).await {
                Ok(logs) => logs,
                Err(err) => {
                    if chunk <= 10 {
                        return Err(err);
                    }
                    chunk = cmp::max(10, chunk / 2);
                    tracing::warn!(cursor, end, chunk, error = %err, "getLogs failed; shrinking chunk and retrying");
                    continue;
                }
            };

            for log in logs {
                if self.dispatch_log(&log, target, jobs).await? {
                    processed += 1;
                }
            }

            let end_hash = self
                .block_hash(end)
                .await?
                .ok_or_else(|| OracleError::TransientFetchFailure(format!("missing block hash for {end}")))?;
            {
                let mut guard = self.guard.lock().await;
                guard.advance_safe_block(end, end_hash)?;
            }
            cursor = end.saturating_add(1);
        }

        Ok(processed)
    }

    async fn block_hash(&self, n: u64) -> Result<Option<H256>, OracleError> {
        let block = self
            .client
            .get_block(BlockNumber::Number(n.into()))
            .await
            .map_err(|e| OracleError::TransientFetchFailure(format!("get_block({n}): {e}")))?;
        Ok(block.and_then(|b| b.hash))
    }

    async fn fetch_logs(&self, from: u64, to: u64) -> Result<Vec<Log>, OracleError> {
        let filter = Filter::new()
            .address(self.cfg.contract)
            .from_block(BlockNumber::Number(from.into()))
            .to_block(BlockNumber::Number(to.into()));

        let mut delay = Duration::from_millis(200);
        for attempt in 1..=3 {
            match self.client.get_logs(&filter).await {
                Ok(logs) => return Ok(logs),
                Err(err) => {
                    if attempt == 3 {
                        return Err(OracleError::TransientFetchFailure(err.to_string()));
                    }
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn dispatch_log(
        &self,
        log: &Log,
        head: u64,
        jobs: &Arc<JobEngine<M>>,
    ) -> Result<bool, OracleError> {
        let Some(block_number) = log.block_number.map(|b| b.as_u64()) else {
            return Ok(false);
        };
        let Some(tx_hash) = log.transaction_hash else {
            return Ok(false);
        };
        let log_index = log.log_index.map(|i| i.as_u64()).unwrap_or_default();

        let key = EventKey {
            block_number,
            tx_hash,
            log_index,
        };

        {
            let guard = self.guard.lock().await;
            if !guard.should_process(head, &key) {
                return Ok(false);
            }
        }

        let Some(event) = decode_log(log) else {
            tracing::debug!(tx = ?tx_hash, "log does not match a known event signature; skipping");
            return Ok(false);
        };

        let job = match event {
            ChainEvent::RequestData(ev) => crate::chain_types::JobRequest::new_data_feed(
                ev.request_id.to_string(),
                &ev.api_url,
                ev.min,
                ev.max,
                ev.requester,
                now_unix(),
            ),
            ChainEvent::RequestRandomness(ev) => crate::chain_types::JobRequest::new_vrf(
                ev.request_id.to_string(),
                ev.seed,
                ev.requester,
                now_unix(),
            ),
        };

        let dispatched_kind = job.kind;
        jobs.dispatch(job).await?;

        {
            let mut guard = self.guard.lock().await;
            guard.mark_processed(key)?;
        }

        tracing::info!(tx = ?tx_hash, block_number, kind = ?dispatched_kind, "event dispatched");
        Ok(true)
    }
}

fn cancel_requested(token: &tokio_util::sync::CancellationToken) -> bool {
    token.is_cancelled()
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

/// Decodes a log into a `ChainEvent`, tolerating both the extended
/// `RequestData` shape (with OEV/optimistic fields) and the legacy
/// shorter one. Unknown topic0s decode to `None` rather than erroring,
/// so an unrelated event on the same contract never aborts a scan.
fn decode_log(log: &Log) -> Option<ChainEvent> {
    let topic0 = *log.topics.first()?;

    if topic0 == request_data_topic0() {
        let tokens = abi::decode(
            &[
                ParamType::Uint(256),
                ParamType::String,
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Address,
                ParamType::Bool,
                ParamType::Address,
                ParamType::Bool,
            ],
            &log.data,
        )
        .ok()?;
        let request_id = tokens[0].clone().into_uint()?;
        let api_url = tokens[1].clone().into_string()?;
        let min = tokens[2].clone().into_uint()?;
        let max = tokens[3].clone().into_uint()?;
        let requester = tokens[4].clone().into_address()?;
        let oev_enabled = tokens[5].clone().into_bool()?;
        let beneficiary = tokens[6].clone().into_address()?;
        let is_optimistic = tokens[7].clone().into_bool()?;
        return Some(ChainEvent::RequestData(RequestDataEvent {
            request_id,
            api_url,
            min,
            max,
            requester,
            oev_enabled,
            beneficiary,
            is_optimistic,
        }));
    }

    if topic0 == request_data_legacy_topic0() {
        let tokens = abi::decode(
            &[
                ParamType::Uint(256),
                ParamType::String,
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Address,
            ],
            &log.data,
        )
        .ok()?;
        let request_id = tokens[0].clone().into_uint()?;
        let api_url = tokens[1].clone().into_string()?;
        let min = tokens[2].clone().into_uint()?;
        let max = tokens[3].clone().into_uint()?;
        let requester = tokens[4].clone().into_address()?;
        return Some(ChainEvent::RequestData(RequestDataEvent {
            request_id,
            api_url,
            min,
            max,
            requester,
            oev_enabled: false,
            beneficiary: Address::zero(),
            is_optimistic: false,
        }));
    }

    if topic0 == request_randomness_topic0() {
        let tokens = abi::decode(
            &[ParamType::Uint(256), ParamType::FixedBytes(32), ParamType::Address],
            &log.data,
        )
        .ok()?;
        let request_id = tokens[0].clone().into_uint()?;
        let seed_bytes = tokens[1].clone().into_fixed_bytes()?;
        let requester = tokens[2].clone().into_address()?;
        let seed = H256::from_slice(&seed_bytes);
        return Some(ChainEvent::RequestRandomness(RequestRandomnessEvent {
            request_id,
            seed,
            requester,
        }));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::Token;

    fn log_with(topic0: H256, tokens: &[Token]) -> Log {
        Log {
            address: Address::zero(),
            topics: vec![topic0],
            data: abi::encode(tokens).into(),
            block_number: Some(100u64.into()),
            transaction_hash: Some(H256::repeat_byte(0x11)),
            log_index: Some(U256::zero()),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_legacy_request_data_shape() {
        let log = log_with(
            request_data_legacy_topic0(),
            &[
                Token::Uint(U256::from(1)),
                Token::String("https://example.com".to_string()),
                Token::Uint(U256::from(100)),
                Token::Uint(U256::from(200)),
                Token::Address(Address::repeat_byte(0x22)),
            ],
        );
        let event = decode_log(&log).unwrap();
        match event {
            ChainEvent::RequestData(ev) => {
                assert_eq!(ev.request_id, U256::from(1));
                assert!(!ev.is_optimistic);
            }
            _ => panic!("expected RequestData"),
        }
    }

    #[test]
    fn decodes_extended_request_data_shape() {
        let log = log_with(
            request_data_topic0(),
            &[
                Token::Uint(U256::from(2)),
                Token::String("https://example.com".to_string()),
                Token::Uint(U256::from(100)),
                Token::Uint(U256::from(200)),
                Token::Address(Address::repeat_byte(0x22)),
                Token::Bool(true),
                Token::Address(Address::repeat_byte(0x33)),
                Token::Bool(true),
            ],
        );
        let event = decode_log(&log).unwrap();
        match event {
            ChainEvent::RequestData(ev) => {
                assert!(ev.oev_enabled);
                assert!(ev.is_optimistic);
            }
            _ => panic!("expected RequestData"),
        }
    }

    #[test]
    fn unknown_topic_decodes_to_none() {
        let log = log_with(H256::repeat_byte(0xFF), &[]);
        assert!(decode_log(&log).is_none());
    }
}
