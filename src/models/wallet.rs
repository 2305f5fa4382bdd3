use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type WalletId = Uuid;

/// Opaque user identity handed to us by the auth layer.
pub type UserId = String;

/// Closed-loop wallet. Balance is mutated only through the WalletLedger,
/// which appends a transaction for every movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Direction of a wallet transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Credit,
    Debit,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "CREDIT",
            Self::Debit => "DEBIT",
            Self::Refund => "REFUND",
        }
    }

    /// Sign applied to the stored amount. Debits are recorded negative so
    /// summing a wallet's transactions reproduces its balance.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Credit | Self::Refund => Decimal::ONE,
            Self::Debit => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Append-only ledger entry. Never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: WalletId,
    /// Signed amount: positive for CREDIT/REFUND, negative for DEBIT.
    pub amount: Decimal,
    pub tx_type: TransactionType,
    pub description: String,
    /// The bid that caused this movement, if any.
    pub reference_bid_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
