use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SettleError;

/// Lifecycle of a payment as reported by the processor and advanced by the
/// settlement pipeline. Terminal statuses never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Paid,
    /// A chain call timed out locally; the reconciler owns the outcome.
    Monitoring,
    Completed,
    Failed,
    Canceled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Monitoring => "monitoring",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Terminal statuses must not be overwritten with anything else.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Failed
                | PaymentStatus::Canceled
                | PaymentStatus::Refunded
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = SettleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "paid" => Ok(PaymentStatus::Paid),
            "monitoring" => Ok(PaymentStatus::Monitoring),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "canceled" => Ok(PaymentStatus::Canceled),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(SettleError::Validation(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

/// How far the token delivery itself has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    RequiresOptIn,
    /// Deposited into the receiver's inbox, awaiting their claim.
    InInbox,
    DirectTransferred,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::RequiresOptIn => "requires_opt_in",
            TransferStatus::InInbox => "in_inbox",
            TransferStatus::DirectTransferred => "direct_transferred",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = SettleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "requires_opt_in" => Ok(TransferStatus::RequiresOptIn),
            "in_inbox" => Ok(TransferStatus::InInbox),
            "direct_transferred" => Ok(TransferStatus::DirectTransferred),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(SettleError::Validation(format!(
                "unknown transfer status '{other}'"
            ))),
        }
    }
}

/// Processor-agnostic settlement request. Each processor adapter in the
/// gateway produces one of these; the dispatcher never sees provider JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    /// Provider event id — the delivery-level idempotency key.
    pub event_id: String,
    /// Caller-supplied business identity — the payment-level idempotency key.
    pub payment_reference: String,
    pub session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    /// Token base units to deliver. Always positive.
    pub token_amount: u64,
    /// Fiat amounts in minor currency units.
    pub price_per_token: i64,
    pub subtotal: i64,
    pub processing_fee: i64,
    pub total_amount: i64,
    pub currency: String,
    pub user_wallet_address: Address,
    pub user_email: Option<String>,
}

/// One row per attempted purchase. Created on the first confirmed webhook
/// for a reference, updated thereafter, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub id: String,
    pub payment_reference: String,
    pub session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub token_amount: u64,
    pub price_per_token: i64,
    pub subtotal: i64,
    pub processing_fee: i64,
    pub total_amount: i64,
    pub currency: String,
    pub user_wallet_address: Address,
    pub user_email: Option<String>,
    pub payment_status: PaymentStatus,
    pub token_transfer_status: TransferStatus,
    pub token_transfer_tx_id: Option<String>,
    pub token_transfer_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub tokens_transferred_at: Option<DateTime<Utc>>,
}

/// Which on-chain movement a [`TokenTransfer`] row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Direct,
    InboxDeposit,
    NativeFunding,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Direct => "direct",
            TransferKind::InboxDeposit => "inbox_deposit",
            TransferKind::NativeFunding => "native_funding",
        }
    }
}

impl FromStr for TransferKind {
    type Err = SettleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(TransferKind::Direct),
            "inbox_deposit" => Ok(TransferKind::InboxDeposit),
            "native_funding" => Ok(TransferKind::NativeFunding),
            other => Err(SettleError::Validation(format!(
                "unknown transfer kind '{other}'"
            ))),
        }
    }
}

/// Status of a single on-chain attempt (append-only audit rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferRowStatus {
    Pending,
    Completed,
    Failed,
}

impl TransferRowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferRowStatus::Pending => "pending",
            TransferRowStatus::Completed => "completed",
            TransferRowStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransferRowStatus {
    type Err = SettleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferRowStatus::Pending),
            "completed" => Ok(TransferRowStatus::Completed),
            "failed" => Ok(TransferRowStatus::Failed),
            other => Err(SettleError::Validation(format!(
                "unknown transfer row status '{other}'"
            ))),
        }
    }
}

/// One executed (or attempted) on-chain movement linked to a payment.
/// Retried attempts produce new rows referencing the same payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    pub id: String,
    pub payment_id: String,
    pub kind: TransferKind,
    pub from_address: Address,
    pub to_address: Address,
    pub asset_id: String,
    pub amount: u64,
    pub transaction_hash: Option<String>,
    pub status: TransferRowStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Direction for the advisory per-wallet running balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceDirection {
    Credit,
    Debit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_round_trips() {
        for s in [
            "pending",
            "processing",
            "paid",
            "monitoring",
            "completed",
            "failed",
            "canceled",
            "refunded",
        ] {
            let status: PaymentStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(PaymentStatus::Completed.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Canceled.is_terminal());
        assert!(PaymentStatus::Refunded.is_terminal());
        assert!(!PaymentStatus::Paid.is_terminal());
        assert!(!PaymentStatus::Monitoring.is_terminal());
    }

    #[test]
    fn unknown_status_is_validation_error() {
        let err = "exploded".parse::<PaymentStatus>().unwrap_err();
        assert!(matches!(err, SettleError::Validation(_)));
    }

    #[test]
    fn transfer_status_round_trips() {
        for s in [
            "pending",
            "requires_opt_in",
            "in_inbox",
            "direct_transferred",
            "completed",
            "failed",
        ] {
            let status: TransferStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
    }
}
