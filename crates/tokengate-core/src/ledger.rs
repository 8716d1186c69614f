//! Transaction ledger: the authoritative per-payment record.
//!
//! The ledger performs no business logic. It is the single place that
//! enforces the no-backward-transition rule for terminal statuses: a write
//! that would downgrade `completed`/`failed`/`canceled`/`refunded` fails
//! with [`SettleError::StateConflict`] and leaves the row intact. Rewriting
//! the same status is idempotent.

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Db;
use crate::payment::{
    BalanceDirection, PaymentEvent, PaymentStatus, PaymentTransaction, TokenTransfer,
    TransferKind, TransferRowStatus, TransferStatus,
};
use crate::SettleError;

const TERMINAL_PAYMENT_STATUSES: &str = "('completed','failed','canceled','refunded')";
const TERMINAL_TRANSFER_STATUSES: &str = "('completed','failed')";

struct RawPayment {
    id: String,
    payment_reference: String,
    session_id: Option<String>,
    payment_intent_id: Option<String>,
    token_amount: i64,
    price_per_token: i64,
    subtotal: i64,
    processing_fee: i64,
    total_amount: i64,
    currency: String,
    user_wallet_address: String,
    user_email: Option<String>,
    payment_status: String,
    token_transfer_status: String,
    token_transfer_tx_id: Option<String>,
    token_transfer_error: Option<String>,
    created_at: String,
    paid_at: Option<String>,
    tokens_transferred_at: Option<String>,
}

const PAYMENT_COLUMNS: &str = "id, payment_reference, session_id, payment_intent_id, \
     token_amount, price_per_token, subtotal, processing_fee, total_amount, currency, \
     user_wallet_address, user_email, payment_status, token_transfer_status, \
     token_transfer_tx_id, token_transfer_error, created_at, paid_at, tokens_transferred_at";

fn raw_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPayment> {
    Ok(RawPayment {
        id: row.get(0)?,
        payment_reference: row.get(1)?,
        session_id: row.get(2)?,
        payment_intent_id: row.get(3)?,
        token_amount: row.get(4)?,
        price_per_token: row.get(5)?,
        subtotal: row.get(6)?,
        processing_fee: row.get(7)?,
        total_amount: row.get(8)?,
        currency: row.get(9)?,
        user_wallet_address: row.get(10)?,
        user_email: row.get(11)?,
        payment_status: row.get(12)?,
        token_transfer_status: row.get(13)?,
        token_transfer_tx_id: row.get(14)?,
        token_transfer_error: row.get(15)?,
        created_at: row.get(16)?,
        paid_at: row.get(17)?,
        tokens_transferred_at: row.get(18)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, SettleError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SettleError::Validation(format!("corrupt timestamp in ledger: {e}")))
}

impl RawPayment {
    fn into_payment(self) -> Result<PaymentTransaction, SettleError> {
        Ok(PaymentTransaction {
            user_wallet_address: self
                .user_wallet_address
                .parse::<Address>()
                .map_err(|e| SettleError::Validation(format!("corrupt wallet address: {e}")))?,
            payment_status: self.payment_status.parse()?,
            token_transfer_status: self.token_transfer_status.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            paid_at: self.paid_at.as_deref().map(parse_timestamp).transpose()?,
            tokens_transferred_at: self
                .tokens_transferred_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            id: self.id,
            payment_reference: self.payment_reference,
            session_id: self.session_id,
            payment_intent_id: self.payment_intent_id,
            token_amount: self.token_amount.max(0) as u64,
            price_per_token: self.price_per_token,
            subtotal: self.subtotal,
            processing_fee: self.processing_fee,
            total_amount: self.total_amount,
            currency: self.currency,
            user_email: self.user_email,
            token_transfer_tx_id: self.token_transfer_tx_id,
            token_transfer_error: self.token_transfer_error,
        })
    }
}

impl Db {
    /// Create the payment row for a first confirmed webhook.
    ///
    /// The INSERT is guarded by the UNIQUE constraint on `payment_reference`,
    /// making check-then-act a single atomic statement: exactly one of any
    /// number of concurrent deliveries for the same reference creates the
    /// row. Returns `None` when the reference already exists.
    pub fn create_payment_transaction(
        &self,
        event: &PaymentEvent,
    ) -> Result<Option<PaymentTransaction>, SettleError> {
        let now = Utc::now();
        let payment = PaymentTransaction {
            id: Uuid::new_v4().to_string(),
            payment_reference: event.payment_reference.clone(),
            session_id: event.session_id.clone(),
            payment_intent_id: event.payment_intent_id.clone(),
            token_amount: event.token_amount,
            price_per_token: event.price_per_token,
            subtotal: event.subtotal,
            processing_fee: event.processing_fee,
            total_amount: event.total_amount,
            currency: event.currency.clone(),
            user_wallet_address: event.user_wallet_address,
            user_email: event.user_email.clone(),
            payment_status: PaymentStatus::Processing,
            token_transfer_status: TransferStatus::Pending,
            token_transfer_tx_id: None,
            token_transfer_error: None,
            created_at: now,
            paid_at: Some(now),
            tokens_transferred_at: None,
        };

        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO payment_transactions
                 (id, payment_reference, session_id, payment_intent_id, token_amount,
                  price_per_token, subtotal, processing_fee, total_amount, currency,
                  user_wallet_address, user_email, payment_status, token_transfer_status,
                  created_at, paid_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            rusqlite::params![
                payment.id,
                payment.payment_reference,
                payment.session_id,
                payment.payment_intent_id,
                payment.token_amount as i64,
                payment.price_per_token,
                payment.subtotal,
                payment.processing_fee,
                payment.total_amount,
                payment.currency,
                format!("{:#x}", payment.user_wallet_address),
                payment.user_email,
                payment.payment_status.as_str(),
                payment.token_transfer_status.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(payment))
    }

    pub fn get_payment(&self, id: &str) -> Result<Option<PaymentTransaction>, SettleError> {
        let raw = {
            let conn = self.lock();
            conn.query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE id = ?1"),
                [id],
                raw_payment,
            )
            .optional()?
        };
        raw.map(RawPayment::into_payment).transpose()
    }

    pub fn get_payment_by_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Option<PaymentTransaction>, SettleError> {
        let raw = {
            let conn = self.lock();
            conn.query_row(
                &format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE payment_reference = ?1"
                ),
                [payment_reference],
                raw_payment,
            )
            .optional()?
        };
        raw.map(RawPayment::into_payment).transpose()
    }

    /// Advance the payment status. Rejects downgrades from terminal statuses
    /// with `StateConflict`; rewriting the current status is a no-op.
    pub fn update_payment_status(
        &self,
        id: &str,
        status: PaymentStatus,
        note: Option<&str>,
    ) -> Result<(), SettleError> {
        let conn = self.lock();
        let updated = conn.execute(
            &format!(
                "UPDATE payment_transactions
                 SET payment_status = ?2,
                     token_transfer_error = COALESCE(?3, token_transfer_error),
                     paid_at = CASE WHEN ?2 = 'paid' AND paid_at IS NULL THEN ?4 ELSE paid_at END
                 WHERE id = ?1 AND payment_status NOT IN {TERMINAL_PAYMENT_STATUSES}"
            ),
            rusqlite::params![id, status.as_str(), note, Utc::now().to_rfc3339()],
        )?;
        if updated > 0 {
            return Ok(());
        }

        let current: Option<String> = conn
            .query_row(
                "SELECT payment_status FROM payment_transactions WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            None => Err(SettleError::Validation(format!("unknown payment {id}"))),
            Some(cur) if cur == status.as_str() => Ok(()),
            Some(cur) => Err(SettleError::StateConflict(format!(
                "payment {id} is terminal ({cur}), refusing downgrade to {status}"
            ))),
        }
    }

    /// Advance the token-transfer status, optionally recording the tx id and
    /// a human-readable error. Same terminal-guard semantics as
    /// [`Db::update_payment_status`].
    pub fn update_token_transfer_status(
        &self,
        id: &str,
        status: TransferStatus,
        tx_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), SettleError> {
        let conn = self.lock();
        let updated = conn.execute(
            &format!(
                "UPDATE payment_transactions
                 SET token_transfer_status = ?2,
                     token_transfer_tx_id = COALESCE(?3, token_transfer_tx_id),
                     token_transfer_error = ?4,
                     tokens_transferred_at = CASE
                         WHEN ?2 IN ('direct_transferred','in_inbox','completed')
                              AND tokens_transferred_at IS NULL
                         THEN ?5 ELSE tokens_transferred_at END
                 WHERE id = ?1 AND token_transfer_status NOT IN {TERMINAL_TRANSFER_STATUSES}"
            ),
            rusqlite::params![id, status.as_str(), tx_id, error, Utc::now().to_rfc3339()],
        )?;
        if updated > 0 {
            return Ok(());
        }

        let current: Option<String> = conn
            .query_row(
                "SELECT token_transfer_status FROM payment_transactions WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            None => Err(SettleError::Validation(format!("unknown payment {id}"))),
            Some(cur) if cur == status.as_str() => Ok(()),
            Some(cur) => Err(SettleError::StateConflict(format!(
                "transfer for payment {id} is terminal ({cur}), refusing downgrade to {status}"
            ))),
        }
    }

    /// Append one on-chain movement to the audit trail. Returns the row id.
    #[allow(clippy::too_many_arguments)]
    pub fn record_token_transfer(
        &self,
        payment_id: &str,
        kind: TransferKind,
        from: Address,
        to: Address,
        asset_id: &str,
        amount: u64,
        transaction_hash: Option<&str>,
        status: TransferRowStatus,
        error_message: Option<&str>,
    ) -> Result<String, SettleError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO token_transfers
                 (id, payment_id, kind, from_address, to_address, asset_id, amount,
                  transaction_hash, status, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                id,
                payment_id,
                kind.as_str(),
                format!("{from:#x}"),
                format!("{to:#x}"),
                asset_id,
                amount as i64,
                transaction_hash,
                status.as_str(),
                error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Finalize a previously recorded pending transfer row.
    pub fn finalize_token_transfer(
        &self,
        transfer_id: &str,
        status: TransferRowStatus,
        error_message: Option<&str>,
    ) -> Result<(), SettleError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE token_transfers SET status = ?2, error_message = ?3
             WHERE id = ?1 AND status = 'pending'",
            rusqlite::params![transfer_id, status.as_str(), error_message],
        )?;
        Ok(())
    }

    /// Latest pending transfer attempt for a payment, if any. Used by the
    /// reconciler to recover the submitted tx hash and movement kind.
    pub fn latest_pending_transfer(
        &self,
        payment_id: &str,
    ) -> Result<Option<TokenTransfer>, SettleError> {
        let raw: Option<(String, String, String, String, String, i64, Option<String>, String)> = {
            let conn = self.lock();
            conn.query_row(
                "SELECT id, kind, from_address, to_address, asset_id, amount,
                        transaction_hash, created_at
                 FROM token_transfers
                 WHERE payment_id = ?1 AND status = 'pending'
                 ORDER BY created_at DESC LIMIT 1",
                [payment_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((id, kind, from, to, asset_id, amount, hash, created_at)) = raw else {
            return Ok(None);
        };
        Ok(Some(TokenTransfer {
            id,
            payment_id: payment_id.to_string(),
            kind: kind.parse()?,
            from_address: from
                .parse()
                .map_err(|e| SettleError::Validation(format!("corrupt from address: {e}")))?,
            to_address: to
                .parse()
                .map_err(|e| SettleError::Validation(format!("corrupt to address: {e}")))?,
            asset_id,
            amount: amount.max(0) as u64,
            transaction_hash: hash,
            status: TransferRowStatus::Pending,
            error_message: None,
            created_at: parse_timestamp(&created_at)?,
        }))
    }

    /// Adjust the advisory per-wallet running balance. Never the source of
    /// truth for on-chain holdings; clamped at zero.
    pub fn update_user_wallet_balance(
        &self,
        wallet: Address,
        network: &str,
        asset_id: &str,
        amount: u64,
        direction: BalanceDirection,
    ) -> Result<(), SettleError> {
        let delta = match direction {
            BalanceDirection::Credit => amount as i64,
            BalanceDirection::Debit => -(amount as i64),
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO user_wallet_balances (wallet_address, network, asset_id, balance, updated_at)
             VALUES (?1, ?2, ?3, MAX(0, ?4), ?5)
             ON CONFLICT(wallet_address, network, asset_id)
             DO UPDATE SET balance = MAX(0, balance + ?4), updated_at = ?5",
            rusqlite::params![
                format!("{wallet:#x}"),
                network,
                asset_id,
                delta,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Cached advisory balance for a wallet, zero when absent.
    pub fn user_wallet_balance(
        &self,
        wallet: Address,
        network: &str,
        asset_id: &str,
    ) -> Result<u64, SettleError> {
        let conn = self.lock();
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance FROM user_wallet_balances
                 WHERE wallet_address = ?1 AND network = ?2 AND asset_id = ?3",
                rusqlite::params![format!("{wallet:#x}"), network, asset_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0).max(0) as u64)
    }

    /// Payments still awaiting resolution since before `cutoff`, oldest
    /// first: parked in `monitoring`, or stranded in `processing` because the
    /// process died between reservation and finalization.
    pub fn stale_unresolved_payments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, SettleError> {
        let raws: Vec<RawPayment> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {PAYMENT_COLUMNS} FROM payment_transactions
                 WHERE payment_status IN ('monitoring', 'processing') AND created_at < ?1
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([cutoff.to_rfc3339()], raw_payment)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raws.into_iter().map(RawPayment::into_payment).collect()
    }
}
