//! Transaction submission with serialized nonce management. Grounded
//! on `opensub-keeper`'s `collector.rs` (send + receipt wait with
//! timeout) and `state.rs`'s `reconcile_in_flight`/`InFlightTx`
//! bookkeeping and `main.rs`'s chain-id/contract-code startup checks,
//! generalized from one fixed call (`collect()`) to the oracle's
//! `fulfillData`/`fulfillRandomness`/generic submit calls and from a
//! best-effort nonce (the chain's pending count) to an explicit
//! Store-checkpointed reservation so nonces never gap across restarts.

use crate::errors::OracleError;
use crate::store::FileStore;
use ethers::middleware::Middleware;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256, U64};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const NONCE_NS: &str = "checkpoint";
const NONCE_KEY: &str = "nonce";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TicketStatus {
    Reserved,
    Broadcast,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxTicket {
    pub nonce: u64,
    pub submitted_at: u64,
    pub hash: Option<H256>,
    pub status: TicketStatus,
}

pub struct TxManagerConfig {
    pub receipt_timeout: Duration,
    pub max_replacements: u32,
    pub replacement_fee_bump_numerator: u64,
    pub replacement_fee_bump_denominator: u64,
}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self {
            receipt_timeout: Duration::from_secs(120),
            max_replacements: 3,
            // 1.125x per replacement.
            replacement_fee_bump_numerator: 1125,
            replacement_fee_bump_denominator: 1000,
        }
    }
}

/// Single-writer per signing account: all submissions funnel through
/// `submit`, which is called from one place (the Job Engine workers)
/// but serializes internally via `next_nonce`'s mutex so nonces never
/// race even under worker concurrency.
pub struct TxManager<M: Middleware> {
    client: Arc<M>,
    store: FileStore,
    cfg: TxManagerConfig,
    nonce_lock: tokio::sync::Mutex<()>,
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

impl<M: Middleware + 'static> TxManager<M> {
    /// Initializes the local nonce counter from Store if present, else
    /// from the chain's pending-nonce at startup via
    /// `get_transaction_count`, and checkpoints it.
    pub async fn new(
        client: Arc<M>,
        store: FileStore,
        cfg: TxManagerConfig,
        account: Address,
    ) -> Result<Self, OracleError> {
        let existing = store.get_json::<u64>(NONCE_NS, NONCE_KEY);
        let starting = match existing {
            Ok(n) => n,
            Err(OracleError::NotFound { .. }) => {
                let pending = client
                    .get_transaction_count(account, Some(ethers::types::BlockId::from(
                        ethers::types::BlockNumber::Pending,
                    )))
                    .await
                    .map_err(|e| OracleError::Store(format!("fetching starting nonce: {e}")))?;
                pending.as_u64()
            }
            Err(e) => return Err(e),
        };
        store.put_json(NONCE_NS, NONCE_KEY, &starting)?;

        Ok(Self {
            client,
            store,
            cfg,
            nonce_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Reserves the next nonce, checkpointing the counter before
    /// returning it so a crash between reservation and broadcast never
    /// reuses a nonce on restart.
    async fn reserve_nonce(&self) -> Result<u64, OracleError> {
        let _guard = self.nonce_lock.lock().await;
        let current: u64 = self.store.get_json(NONCE_NS, NONCE_KEY)?;
        let next = current;
        self.store.put_json(NONCE_NS, NONCE_KEY, &(current + 1))?;
        Ok(next)
    }

    /// Builds, signs, and broadcasts a call to `to` with `calldata`,
    /// waits up to `receiptTimeout` for a receipt, and replaces the
    /// transaction at the same nonce with a higher fee on timeout, up
    /// to `maxReplacements` attempts.
    pub async fn submit(&self, to: Address, calldata: Bytes) -> Result<H256, OracleError> {
        let nonce = self.reserve_nonce().await?;

        let mut ticket = TxTicket {
            nonce,
            submitted_at: now_unix(),
            hash: None,
            status: TicketStatus::Reserved,
        };

        let mut fee_multiplier_num = 1u64;
        let mut fee_multiplier_den = 1u64;

        for attempt in 0..=self.cfg.max_replacements {
            let gas_price = match self.client.get_gas_price().await {
                Ok(price) => price,
                Err(e) => {
                    tracing::warn!(nonce, attempt, error = %e, "fee estimation failed; will retry");
                    fee_multiplier_num = self.cfg.replacement_fee_bump_numerator;
                    fee_multiplier_den = self.cfg.replacement_fee_bump_denominator;
                    continue;
                }
            };
            let bumped = gas_price * U256::from(fee_multiplier_num) / U256::from(fee_multiplier_den);

            let tx = TransactionRequest::new()
                .to(to)
                .data(calldata.clone())
                .nonce(U256::from(nonce))
                .gas_price(bumped);

            let pending = match self.client.send_transaction(tx, None).await {
                Ok(pending) => pending,
                Err(e) => {
                    let classified = classify_send_error(e.to_string());
                    if let OracleError::TxRejectedPermanent(_) = classified {
                        tracing::error!(nonce, error = %classified, "broadcast permanently rejected; consuming reserved nonce");
                        ticket.status = TicketStatus::Failed;
                        self.consume_failed_nonce(nonce).await?;
                        return Err(classified);
                    }
                    tracing::warn!(nonce, attempt, error = %classified, "broadcast failed; will retry");
                    fee_multiplier_num = self.cfg.replacement_fee_bump_numerator;
                    fee_multiplier_den = self.cfg.replacement_fee_bump_denominator;
                    continue;
                }
            };

            let tx_hash = *pending;
            ticket.hash = Some(tx_hash);
            ticket.status = TicketStatus::Broadcast;
            tracing::info!(nonce, attempt, tx = ?tx_hash, "transaction broadcast");

            match tokio::time::timeout(self.cfg.receipt_timeout, pending).await {
                Ok(Ok(Some(receipt))) => {
                    if receipt.status == Some(U64::from(1)) {
                        ticket.status = TicketStatus::Confirmed;
                        tracing::info!(nonce, tx = ?tx_hash, "transaction confirmed");
                        return Ok(tx_hash);
                    } else {
                        ticket.status = TicketStatus::Failed;
                        return Err(OracleError::TxRejectedPermanent(
                            "transaction mined but reverted".to_string(),
                        ));
                    }
                }
                Ok(Ok(None)) => {
                    tracing::warn!(nonce, tx = ?tx_hash, "no receipt returned; treating as timeout");
                }
                Ok(Err(err)) => {
                    tracing::warn!(nonce, tx = ?tx_hash, error = %err, "receipt wait errored; treating as timeout");
                }
                Err(_) => {
                    tracing::warn!(nonce, tx = ?tx_hash, timeout_s = self.cfg.receipt_timeout.as_secs(), "receipt wait timed out");
                }
            }

            fee_multiplier_num = self.cfg.replacement_fee_bump_numerator;
            fee_multiplier_den = self.cfg.replacement_fee_bump_denominator;
        }

        ticket.status = TicketStatus::Failed;
        tracing::error!(nonce, "exhausted replacement attempts; nonce will be consumed by a no-op");
        self.consume_failed_nonce(nonce).await?;
        Err(OracleError::TxTimeout)
    }

    /// The invariant "a Failed nonce must be either replaced or
    /// consumed by an explicit no-op before the next submission
    /// proceeds" is enforced automatically here: a zero-value
    /// self-transfer at the failed nonce guarantees no gap forms.
    async fn consume_failed_nonce(&self, nonce: u64) -> Result<(), OracleError> {
        let self_address = self
            .client
            .default_sender()
            .ok_or_else(|| OracleError::TxRejectedPermanent("no default sender configured".to_string()))?;

        let gas_price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| OracleError::TxRejectedPermanent(format!("fee estimation: {e}")))?;

        let tx = TransactionRequest::new()
            .to(self_address)
            .value(U256::zero())
            .nonce(U256::from(nonce))
            .gas_price(gas_price * 2);

        match self.client.send_transaction(tx, None).await {
            Ok(pending) => {
                let _ = tokio::time::timeout(self.cfg.receipt_timeout, pending).await;
                Ok(())
            }
            Err(e) => Err(OracleError::TxRejectedPermanent(format!(
                "failed to consume gap nonce {nonce}: {e}"
            ))),
        }
    }
}

fn classify_send_error(message: String) -> OracleError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient funds") || lower.contains("invalid signature") {
        OracleError::TxRejectedPermanent(message)
    } else {
        OracleError::TxTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_balance_and_signature_errors_as_permanent() {
        assert!(matches!(
            classify_send_error("insufficient funds for gas".to_string()),
            OracleError::TxRejectedPermanent(_)
        ));
        assert!(matches!(
            classify_send_error("Invalid Signature".to_string()),
            OracleError::TxRejectedPermanent(_)
        ));
    }

    #[test]
    fn classifies_other_send_errors_as_retryable_timeout() {
        assert!(matches!(
            classify_send_error("connection reset by peer".to_string()),
            OracleError::TxTimeout
        ));
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = TxManagerConfig::default();
        assert_eq!(cfg.receipt_timeout, Duration::from_secs(120));
        assert_eq!(cfg.max_replacements, 3);
        assert_eq!(
            cfg.replacement_fee_bump_numerator as f64 / cfg.replacement_fee_bump_denominator as f64,
            1.125
        );
    }
}
