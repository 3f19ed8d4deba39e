//! Reorg-safe confirmation gating and event dedup. Grounded on
//! `opensub-keeper`'s `scanner.rs` confirmation-depth gate, generalized
//! from "track one scan cursor" to a `ShouldProcess`/`MarkProcessed`/
//! `AdvanceSafeBlock` contract plus a bounded, block-indexed dedup set.
//!
//! The dedup set is a `BTreeMap<block, HashSet<(tx_hash, log_index)>>`
//! rather than a generic LRU: eviction is block-distance-based ("evict
//! far below lastSafeBlock"), so a block-indexed map expresses it as a
//! direct range-drain instead of an LRU's access-order heuristic.

use crate::errors::OracleError;
use crate::store::FileStore;
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

const LAST_SAFE_BLOCK_NS: &str = "checkpoint";
const LAST_SAFE_BLOCK_KEY: &str = "lastSafeBlock";
const LAST_SAFE_BLOCK_HASH_KEY: &str = "lastSafeBlockHash";
const DEDUP_NS: &str = "dedup";

/// How many blocks below `lastSafeBlock` a dedup entry is kept before
/// it becomes eligible for eviction.
const DEDUP_RETENTION_BLOCKS: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DedupMarker;

pub struct ReorgGuard {
    store: FileStore,
    last_safe_block: u64,
    last_safe_block_hash: Option<H256>,
    confirmation_depth: u64,
    seen: BTreeMap<u64, HashSet<(H256, u64)>>,
}

impl ReorgGuard {
    /// Loads `lastSafeBlock`/its hash from Store (defaulting to 0/none)
    /// and rehydrates the dedup set from recent markers so a restart
    /// never replays an event it already dispatched.
    pub fn load(store: FileStore, confirmation_depth: u64) -> Result<Self, OracleError> {
        let last_safe_block = match store.get_json::<u64>(LAST_SAFE_BLOCK_NS, LAST_SAFE_BLOCK_KEY) {
            Ok(v) => v,
            Err(OracleError::NotFound { .. }) => 0,
            Err(e) => return Err(e),
        };
        let last_safe_block_hash = match store.get_json::<H256>(LAST_SAFE_BLOCK_NS, LAST_SAFE_BLOCK_HASH_KEY) {
            Ok(v) => Some(v),
            Err(OracleError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let mut seen: BTreeMap<u64, HashSet<(H256, u64)>> = BTreeMap::new();
        for composite in store.list(DEDUP_NS)? {
            if let Some(key) = parse_dedup_key(&composite) {
                seen.entry(key.block_number)
                    .or_default()
                    .insert((key.tx_hash, key.log_index));
            }
        }

        Ok(Self {
            store,
            last_safe_block,
            last_safe_block_hash,
            confirmation_depth,
            seen,
        })
    }

    pub fn last_safe_block(&self) -> u64 {
        self.last_safe_block
    }

    /// Compares the chain's current hash for `lastSafeBlock` against the
    /// hash observed when that block was last advanced past. A mismatch
    /// means the chain has reorged beneath the node's safe point — the
    /// node halts rather than silently rewinding.
    pub fn verify_safe_block_hash(&self, current_hash: Option<H256>) -> Result<(), OracleError> {
        match (self.last_safe_block_hash, current_hash) {
            (Some(expected), Some(actual)) if expected != actual => {
                Err(self.deep_reorg_alert(self.last_safe_block))
            }
            _ => Ok(()),
        }
    }

    /// Step 1: unconfirmed events are not yet actionable.
    /// Step 2: already-processed events are never redispatched.
    pub fn should_process(&self, head: u64, key: &EventKey) -> bool {
        if key.block_number > head.saturating_sub(self.confirmation_depth) {
            return false;
        }
        !self
            .seen
            .get(&key.block_number)
            .map(|set| set.contains(&(key.tx_hash, key.log_index)))
            .unwrap_or(false)
    }

    /// Persists the dedup marker. Must be called only after the caller
    /// has successfully enqueued the corresponding job — `MarkProcessed`
    /// happens-before any subsequent `should_process` that could
    /// observe the same key.
    pub fn mark_processed(&mut self, key: EventKey) -> Result<(), OracleError> {
        self.store.put_json(
            DEDUP_NS,
            &dedup_key(&key),
            &DedupMarker,
        )?;
        self.seen
            .entry(key.block_number)
            .or_default()
            .insert((key.tx_hash, key.log_index));
        Ok(())
    }

    /// Atomically advances `lastSafeBlock` (monotonically) and evicts
    /// dedup entries far enough below it to be safe from further reorg
    /// consideration. `hash` is the chain's hash for block `n`, recorded
    /// as the new baseline `verify_safe_block_hash` checks against.
    pub fn advance_safe_block(&mut self, n: u64, hash: H256) -> Result<(), OracleError> {
        if n <= self.last_safe_block {
            return Ok(());
        }
        self.last_safe_block = n;
        self.last_safe_block_hash = Some(hash);
        self.store
            .put_json(LAST_SAFE_BLOCK_NS, LAST_SAFE_BLOCK_KEY, &self.last_safe_block)?;
        self.store
            .put_json(LAST_SAFE_BLOCK_NS, LAST_SAFE_BLOCK_HASH_KEY, &hash)?;

        let cutoff = self.last_safe_block.saturating_sub(DEDUP_RETENTION_BLOCKS);
        let evict: Vec<u64> = self
            .seen
            .range(..cutoff)
            .map(|(&block, _)| block)
            .collect();
        for block in evict {
            if let Some(keys) = self.seen.remove(&block) {
                for (tx_hash, log_index) in keys {
                    let key = EventKey {
                        block_number: block,
                        tx_hash,
                        log_index,
                    };
                    self.store.delete(DEDUP_NS, &dedup_key(&key))?;
                }
            }
        }
        Ok(())
    }

    /// A block hash mismatch detected beneath `lastSafeBlock`: the node
    /// refuses to silently rewind, and instead halts ingestion so the
    /// operator can intervene.
    pub fn deep_reorg_alert(&self, at_block: u64) -> OracleError {
        OracleError::ReorgDetected(format!(
            "observed reorg at block {at_block}, beneath last safe block {}",
            self.last_safe_block
        ))
    }
}

fn dedup_key(key: &EventKey) -> String {
    format!("{}/{:#x}/{}", key.block_number, key.tx_hash, key.log_index)
}

fn parse_dedup_key(composite: &str) -> Option<EventKey> {
    let mut parts = composite.splitn(3, '/');
    let block_number: u64 = parts.next()?.parse().ok()?;
    let tx_hash: H256 = parts.next()?.parse().ok()?;
    let log_index: u64 = parts.next()?.parse().ok()?;
    Some(EventKey {
        block_number,
        tx_hash,
        log_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(block: u64, log_index: u64) -> EventKey {
        EventKey {
            block_number: block,
            tx_hash: H256::repeat_byte(0xAB),
            log_index,
        }
    }

    fn fresh_guard(confirmation_depth: u64) -> (tempfile::TempDir, ReorgGuard) {
        let dir = tempfile::tempdir().unwrap();
        let (store, lock) = FileStore::open(dir.path()).unwrap();
        std::mem::forget(lock);
        let guard = ReorgGuard::load(store, confirmation_depth).unwrap();
        (dir, guard)
    }

    #[test]
    fn unconfirmed_event_is_not_processed() {
        let (_dir, guard) = fresh_guard(12);
        assert!(!guard.should_process(1005, &key(1000, 0)));
    }

    #[test]
    fn confirmed_event_is_processed_once() {
        let (_dir, mut guard) = fresh_guard(12);
        assert!(guard.should_process(1020, &key(1000, 0)));
        guard.mark_processed(key(1000, 0)).unwrap();
        assert!(!guard.should_process(1020, &key(1000, 0)));
    }

    #[test]
    fn scenario_c_reorg_under_confirmation_depth() {
        let (_dir, mut guard) = fresh_guard(12);
        let k = key(1000, 0);
        // First delivery at head=1005: 1005-1000=5 < 12, unconfirmed.
        assert!(!guard.should_process(1005, &k));
        // Second delivery at head=1020: confirmed.
        assert!(guard.should_process(1020, &k));
        guard.mark_processed(k).unwrap();
        // Duplicate delivery: deduped.
        assert!(!guard.should_process(1020, &k));
    }

    #[test]
    fn advance_safe_block_is_monotonic() {
        let (_dir, mut guard) = fresh_guard(12);
        guard.advance_safe_block(100, H256::repeat_byte(0x11)).unwrap();
        guard.advance_safe_block(50, H256::repeat_byte(0x22)).unwrap();
        assert_eq!(guard.last_safe_block(), 100);
    }

    #[test]
    fn hash_mismatch_beneath_safe_block_is_detected() {
        let (_dir, mut guard) = fresh_guard(12);
        guard.advance_safe_block(100, H256::repeat_byte(0x11)).unwrap();
        assert!(guard.verify_safe_block_hash(Some(H256::repeat_byte(0x11))).is_ok());
        let err = guard
            .verify_safe_block_hash(Some(H256::repeat_byte(0x99)))
            .unwrap_err();
        assert!(matches!(err, OracleError::ReorgDetected(_)));
        assert!(err.fatal());
    }

    #[test]
    fn restart_rehydrates_dedup_set() {
        let dir = tempfile::tempdir().unwrap();
        let (store, lock) = FileStore::open(dir.path()).unwrap();
        let mut guard = ReorgGuard::load(store, 12).unwrap();
        guard.mark_processed(key(1000, 0)).unwrap();
        drop(lock);

        let (store2, _lock2) = FileStore::open(dir.path()).unwrap();
        let guard2 = ReorgGuard::load(store2, 12).unwrap();
        assert!(!guard2.should_process(1020, &key(1000, 0)));
    }
}
