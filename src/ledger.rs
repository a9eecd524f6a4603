//! The ledger seam used by the reference facilitator.
//!
//! Real chains plug in by implementing [`Ledger`]; [`InMemoryLedger`] keeps
//! balances in memory and confirms transfers after a configurable delay, which
//! is enough to run the whole protocol locally and in tests.

use crate::types::SignedTransfer;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Errors reported by a ledger backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The node could not be reached or is overloaded; nothing was written.
    #[error("transient ledger error: {0}")]
    Transient(String),
    /// The ledger refused the transfer.
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

/// Ledger-side state of a broadcast transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// In the mempool
    Pending,
    /// Included and final
    Confirmed,
    /// Aborted on-chain
    Failed(String),
}

/// A distributed ledger that accepts signed transfers.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submits a signed transfer, returning its transaction id.
    async fn broadcast(&self, transfer: &SignedTransfer) -> Result<String, LedgerError>;

    /// Reports the current state of a broadcast transfer.
    async fn status(&self, txid: &str) -> Result<TransferStatus, LedgerError>;
}

#[derive(Debug)]
struct TxRecord {
    transfer: SignedTransfer,
    broadcast_at: Instant,
    outcome: Option<TransferStatus>,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<(String, String), u128>,
    transactions: HashMap<String, TxRecord>,
    nonces: HashSet<String>,
}

/// An in-process ledger with explicit balances.
///
/// Transfers stay pending for `confirmation_delay` after broadcast, then move
/// funds (confirmed) or fail on insufficient balance.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    confirmation_delay: Duration,
    failing_broadcasts: AtomicUsize,
}

impl InMemoryLedger {
    /// Creates an empty ledger that confirms immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps transfers pending for `delay` after broadcast.
    pub fn with_confirmation_delay(mut self, delay: Duration) -> Self {
        self.confirmation_delay = delay;
        self
    }

    /// Makes the next `count` broadcasts fail with a transient error.
    pub fn fail_next_broadcasts(&self, count: usize) {
        self.failing_broadcasts.store(count, Ordering::SeqCst);
    }

    /// Adds `amount` of `asset` to `principal`.
    pub async fn credit(&self, asset: &str, principal: &str, amount: u128) {
        let mut state = self.state.write().await;
        let balance = state
            .balances
            .entry((asset.to_string(), principal.to_string()))
            .or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    /// Current balance of `asset` held by `principal`.
    pub async fn balance(&self, asset: &str, principal: &str) -> u128 {
        let state = self.state.read().await;
        state
            .balances
            .get(&(asset.to_string(), principal.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of transfers ever accepted for broadcast.
    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn broadcast(&self, transfer: &SignedTransfer) -> Result<String, LedgerError> {
        let failed = self
            .failing_broadcasts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if failed {
            return Err(LedgerError::Transient("node unavailable".to_string()));
        }

        let digest = transfer
            .transfer
            .signing_digest()
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        let txid = format!("0x{}", hex::encode(digest));
        let nonce_key = format!("{}:{}", transfer.transfer.from, transfer.transfer.nonce);

        let mut state = self.state.write().await;
        if !state.nonces.insert(nonce_key) {
            return Err(LedgerError::Rejected("nonce already used".to_string()));
        }
        state.transactions.insert(
            txid.clone(),
            TxRecord {
                transfer: transfer.clone(),
                broadcast_at: Instant::now(),
                outcome: None,
            },
        );
        Ok(txid)
    }

    async fn status(&self, txid: &str) -> Result<TransferStatus, LedgerError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let record = state
            .transactions
            .get_mut(txid)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown transaction {txid}")))?;

        if let Some(outcome) = &record.outcome {
            return Ok(outcome.clone());
        }
        if record.broadcast_at.elapsed() < self.confirmation_delay {
            return Ok(TransferStatus::Pending);
        }

        let t = &record.transfer.transfer;
        let amount = t.amount.value();
        let from_key = (t.asset.clone(), t.from.clone());
        let available = state.balances.get(&from_key).copied().unwrap_or(0);
        let outcome = if available < amount {
            TransferStatus::Failed(format!(
                "insufficient balance: {} holds {} {}, needs {}",
                t.from, available, t.asset, amount
            ))
        } else {
            state.balances.insert(from_key, available - amount);
            let to = state
                .balances
                .entry((t.asset.clone(), t.to.clone()))
                .or_insert(0);
            *to = to.saturating_add(amount);
            TransferStatus::Confirmed
        };
        record.outcome = Some(outcome.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::types::{TokenAmount, UnsignedTransfer, STX_ASSET};
    use crate::utils::generate_nonce;

    fn transfer(amount: u128) -> SignedTransfer {
        SignedTransfer {
            transfer: UnsignedTransfer {
                network: Network::stacks_testnet(),
                asset: STX_ASSET.to_string(),
                from: "ST_PAYER".to_string(),
                to: "ST_PAYEE".to_string(),
                amount: TokenAmount(amount),
                nonce: generate_nonce(),
                valid_before: 1_900_000_000,
                memo: None,
            },
            public_key: String::new(),
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn test_confirmed_transfer_moves_funds() {
        let ledger = InMemoryLedger::new();
        ledger.credit(STX_ASSET, "ST_PAYER", 50_000).await;

        let txid = ledger.broadcast(&transfer(10_000)).await.unwrap();
        assert_eq!(ledger.status(&txid).await.unwrap(), TransferStatus::Confirmed);
        assert_eq!(ledger.balance(STX_ASSET, "ST_PAYER").await, 40_000);
        assert_eq!(ledger.balance(STX_ASSET, "ST_PAYEE").await, 10_000);

        // Status is sticky; funds move once.
        assert_eq!(ledger.status(&txid).await.unwrap(), TransferStatus::Confirmed);
        assert_eq!(ledger.balance(STX_ASSET, "ST_PAYEE").await, 10_000);
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails() {
        let ledger = InMemoryLedger::new();
        let txid = ledger.broadcast(&transfer(10_000)).await.unwrap();
        assert!(matches!(
            ledger.status(&txid).await.unwrap(),
            TransferStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_nonce_replay_rejected() {
        let ledger = InMemoryLedger::new();
        let t = transfer(1);
        ledger.broadcast(&t).await.unwrap();
        assert!(matches!(
            ledger.broadcast(&t).await,
            Err(LedgerError::Rejected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_until_delay_elapses() {
        let ledger = InMemoryLedger::new().with_confirmation_delay(Duration::from_secs(5));
        ledger.credit(STX_ASSET, "ST_PAYER", 1).await;
        let txid = ledger.broadcast(&transfer(1)).await.unwrap();
        assert_eq!(ledger.status(&txid).await.unwrap(), TransferStatus::Pending);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(ledger.status(&txid).await.unwrap(), TransferStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_transient_failures() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next_broadcasts(1);
        assert!(matches!(
            ledger.broadcast(&transfer(1)).await,
            Err(LedgerError::Transient(_))
        ));
        assert!(ledger.broadcast(&transfer(1)).await.is_ok());
        assert_eq!(ledger.transaction_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_transient_failures_counted_across_concurrent_broadcasts() {
        let ledger = std::sync::Arc::new(InMemoryLedger::new());
        ledger.fail_next_broadcasts(3);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.broadcast(&transfer(1)).await })
            })
            .collect();
        let mut transient = 0;
        for handle in handles {
            if let Err(LedgerError::Transient(_)) = handle.await.unwrap() {
                transient += 1;
            }
        }

        assert_eq!(transient, 3);
        assert_eq!(ledger.transaction_count().await, 13);
        assert!(ledger.broadcast(&transfer(1)).await.is_ok());
    }
}
