//! Idempotency ledger: event-level and payment-level dedupe.
//!
//! Two independent keys are required. The provider's delivery identity
//! (event id) and the business identity (payment reference) are not the
//! same thing: one payment can legitimately produce several distinct
//! events, while a single event id must never be re-applied.

use chrono::Utc;

use crate::db::Db;
use crate::payment::PaymentStatus;
use crate::SettleError;

/// Result of the payment-level idempotency check.
#[derive(Debug, Clone)]
pub struct PaymentIdempotency {
    pub payment_id: String,
    pub status: PaymentStatus,
}

impl Db {
    /// True if this event id has already been applied (or deliberately
    /// skipped). Fail-secure: a storage error surfaces instead of returning
    /// a silent `false` that would re-apply the effect.
    pub fn already_processed(&self, event_id: &str) -> Result<bool, SettleError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM webhook_events WHERE event_id = ?1 AND processed = 1",
            [event_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record the event row on receipt, unprocessed. Safe on re-delivery.
    pub fn record_event(&self, event_id: &str, event_type: &str) -> Result<(), SettleError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO webhook_events (event_id, event_type, processed, created_at)
             VALUES (?1, ?2, 0, ?3)",
            rusqlite::params![event_id, event_type, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Mark an event processed. Upsert, safe to call twice; `processed`
    /// only ever moves from 0 to 1.
    pub fn mark_processed(&self, event_id: &str, event_type: &str) -> Result<(), SettleError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO webhook_events (event_id, event_type, processed, created_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(event_id) DO UPDATE SET processed = 1",
            rusqlite::params![event_id, event_type, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Payment-level check, distinct from the event-level one: a payment is
    /// represented by multiple deliveries over its lifetime.
    pub fn check_payment_idempotency(
        &self,
        payment_reference: &str,
    ) -> Result<Option<PaymentIdempotency>, SettleError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, payment_status FROM payment_transactions WHERE payment_reference = ?1",
                [payment_reference],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match row {
            Some((payment_id, status)) => Ok(Some(PaymentIdempotency {
                payment_id,
                status: status.parse()?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_event_is_unprocessed() {
        let db = Db::open_in_memory().unwrap();
        assert!(!db.already_processed("evt_1").unwrap());
    }

    #[test]
    fn recorded_but_unprocessed_event_is_not_processed() {
        let db = Db::open_in_memory().unwrap();
        db.record_event("evt_1", "checkout.session.completed").unwrap();
        assert!(!db.already_processed("evt_1").unwrap());
    }

    #[test]
    fn mark_processed_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        db.record_event("evt_1", "checkout.session.completed").unwrap();
        db.mark_processed("evt_1", "checkout.session.completed").unwrap();
        db.mark_processed("evt_1", "checkout.session.completed").unwrap();
        assert!(db.already_processed("evt_1").unwrap());

        let conn = db.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM webhook_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn mark_processed_upserts_without_prior_record() {
        let db = Db::open_in_memory().unwrap();
        db.mark_processed("evt_2", "charge.refund.updated").unwrap();
        assert!(db.already_processed("evt_2").unwrap());
    }

    #[test]
    fn payment_idempotency_absent_for_unknown_reference() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.check_payment_idempotency("ref-missing").unwrap().is_none());
    }
}
