//! Closed-loop wallet ledger: per-user balances plus the append-only
//! transaction log. Every balance movement and its transaction record
//! commit inside one critical section, so the ledger-sum invariant holds at
//! every observable point and two debits racing for the last rupee resolve
//! to exactly one success.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::broadcast::RealtimeBroadcaster;
use crate::clock::Clock;
use crate::errors::{EngineError, EngineResult};
use crate::models::{
    BidId, EngineUpdate, TransactionType, UserId, Wallet, WalletId, WalletTransaction,
};

#[derive(Default)]
struct WalletState {
    wallets: HashMap<WalletId, Wallet>,
    by_user: HashMap<UserId, WalletId>,
    transactions: Vec<WalletTransaction>,
}

impl WalletState {
    fn append_tx(
        &mut self,
        wallet_id: WalletId,
        tx_type: TransactionType,
        amount: Decimal,
        description: String,
        reference_bid_id: Option<BidId>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) {
        self.transactions.push(WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id,
            amount: tx_type.sign() * amount,
            tx_type,
            description,
            reference_bid_id,
            created_at,
        });
    }
}

pub struct WalletLedger {
    state: Mutex<WalletState>,
    broadcaster: Arc<RealtimeBroadcaster>,
    clock: Arc<dyn Clock>,
}

impl WalletLedger {
    pub fn new(broadcaster: Arc<RealtimeBroadcaster>, clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(WalletState::default()), broadcaster, clock }
    }

    /// Top-up. Creates the wallet lazily on first credit; this is the only
    /// path that creates wallets.
    pub fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        description: &str,
    ) -> EngineResult<Wallet> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation("credit amount must be positive".to_string()));
        }
        let now = self.clock.now();
        let mut state = self.lock();

        let wallet_id = match state.by_user.get(user_id) {
            Some(id) => *id,
            None => {
                let wallet = Wallet {
                    id: Uuid::new_v4(),
                    user_id: user_id.to_string(),
                    balance: Decimal::ZERO,
                    created_at: now,
                };
                let id = wallet.id;
                state.by_user.insert(user_id.to_string(), id);
                state.wallets.insert(id, wallet);
                id
            }
        };

        let wallet = state.wallets.get_mut(&wallet_id).expect("wallet index out of sync");
        wallet.balance += amount;
        let updated = wallet.clone();
        state.append_tx(wallet_id, TransactionType::Credit, amount, description.to_string(), None, now);

        log::info!("Credited {} to wallet {} (user {})", amount, wallet_id, user_id);
        // Published under the wallet lock so version order matches commit
        // order for this wallet.
        self.broadcaster.publish(EngineUpdate::WalletChanged(updated.clone()));
        Ok(updated)
    }

    /// Balance-floor-guarded debit. On `InsufficientFunds` nothing changes:
    /// no balance movement, no transaction record.
    pub fn debit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        description: &str,
        reference_bid_id: Option<BidId>,
    ) -> EngineResult<Wallet> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation("debit amount must be positive".to_string()));
        }
        let now = self.clock.now();
        let mut state = self.lock();

        let wallet = state
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| EngineError::NotFound { kind: "wallet", id: wallet_id.to_string() })?;
        if wallet.balance < amount {
            return Err(EngineError::InsufficientFunds {
                available: wallet.balance,
                required: amount,
            });
        }
        wallet.balance -= amount;
        let updated = wallet.clone();
        state.append_tx(
            wallet_id,
            TransactionType::Debit,
            amount,
            description.to_string(),
            reference_bid_id,
            now,
        );

        self.broadcaster.publish(EngineUpdate::WalletChanged(updated.clone()));
        Ok(updated)
    }

    /// Return escrowed money for a bid. Not deduplicated here: the caller's
    /// payment-status compare-and-set guarantees at most one refund per bid.
    pub fn refund(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        description: &str,
        reference_bid_id: BidId,
    ) -> EngineResult<Wallet> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation("refund amount must be positive".to_string()));
        }
        let now = self.clock.now();
        let mut state = self.lock();

        let wallet = state
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| EngineError::NotFound { kind: "wallet", id: wallet_id.to_string() })?;
        wallet.balance += amount;
        let updated = wallet.clone();
        state.append_tx(
            wallet_id,
            TransactionType::Refund,
            amount,
            description.to_string(),
            Some(reference_bid_id),
            now,
        );

        log::info!("Refunded {} to wallet {} for bid {}", amount, wallet_id, reference_bid_id);
        self.broadcaster.publish(EngineUpdate::WalletChanged(updated.clone()));
        Ok(updated)
    }

    pub fn get(&self, wallet_id: WalletId) -> Option<Wallet> {
        self.lock().wallets.get(&wallet_id).cloned()
    }

    pub fn wallet_for_user(&self, user_id: &str) -> Option<Wallet> {
        let state = self.lock();
        state.by_user.get(user_id).and_then(|id| state.wallets.get(id)).cloned()
    }

    /// Zero for users with no wallet yet.
    pub fn balance_of(&self, user_id: &str) -> Decimal {
        self.wallet_for_user(user_id).map(|w| w.balance).unwrap_or(Decimal::ZERO)
    }

    pub fn transactions_for(&self, wallet_id: WalletId) -> Vec<WalletTransaction> {
        self.lock()
            .transactions
            .iter()
            .filter(|tx| tx.wallet_id == wallet_id)
            .cloned()
            .collect()
    }

    /// Recompute a wallet's balance from its transaction log. Used by the
    /// reconciliation check: the result must always equal the live balance.
    pub fn recompute_balance(&self, wallet_id: WalletId) -> EngineResult<Decimal> {
        let state = self.lock();
        if !state.wallets.contains_key(&wallet_id) {
            return Err(EngineError::NotFound { kind: "wallet", id: wallet_id.to_string() });
        }
        Ok(state
            .transactions
            .iter()
            .filter(|tx| tx.wallet_id == wallet_id)
            .map(|tx| tx.amount)
            .sum())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WalletState> {
        self.state.lock().expect("wallet state lock poisoned")
    }
}
