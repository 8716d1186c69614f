//! Inventory manager: atomic reserve / release / commit per (network, asset).
//!
//! All mutations go through conditional single-statement updates inside SQL
//! transactions, so `available + reserved <= total` holds under concurrent
//! callers and a transfer can never be attempted against unreserved stock.
//! Reservation rows are keyed by payment id, which makes release and commit
//! idempotent per payment.

use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Db;
use crate::SettleError;

/// Snapshot returned by the availability check.
#[derive(Debug, Clone, Copy)]
pub struct Availability {
    pub available: bool,
    pub available_balance: u64,
}

impl Db {
    /// Non-binding availability check. The binding check happens inside
    /// [`Db::reserve`]; this exists for pre-flight validation and display.
    pub fn check_availability(
        &self,
        network: &str,
        asset_id: &str,
        amount: u64,
    ) -> Result<Availability, SettleError> {
        let conn = self.lock();
        let available_balance: i64 = conn.query_row(
            "SELECT available_balance FROM token_inventory WHERE network = ?1 AND asset_id = ?2",
            [network, asset_id],
            |row| row.get(0),
        )?;
        let available_balance = available_balance.max(0) as u64;
        Ok(Availability {
            available: available_balance >= amount,
            available_balance,
        })
    }

    /// Place a hold on `amount` base units for a payment.
    ///
    /// The decrement is guarded by `available_balance >= amount` in the same
    /// statement, so two racing reservations can never oversell. A repeated
    /// call for a payment that already holds a reservation is a no-op.
    pub fn reserve(
        &self,
        network: &str,
        asset_id: &str,
        payment_id: &str,
        amount: u64,
    ) -> Result<(), SettleError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO inventory_reservations
                 (payment_id, network, asset_id, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![payment_id, network, asset_id, amount as i64, Utc::now().to_rfc3339()],
        )?;
        if inserted == 0 {
            // Reservation already held by this payment.
            tx.commit()?;
            return Ok(());
        }

        let updated = tx.execute(
            "UPDATE token_inventory
             SET available_balance = available_balance - ?3,
                 reserved_balance  = reserved_balance + ?3
             WHERE network = ?1 AND asset_id = ?2 AND available_balance >= ?3",
            rusqlite::params![network, asset_id, amount as i64],
        )?;
        if updated == 0 {
            let available: i64 = tx
                .query_row(
                    "SELECT available_balance FROM token_inventory
                     WHERE network = ?1 AND asset_id = ?2",
                    [network, asset_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            // Drop the transaction without committing; the reservation row
            // insert rolls back with it.
            drop(tx);
            return Err(SettleError::InsufficientInventory {
                requested: amount,
                available: available.max(0) as u64,
            });
        }

        tx.commit()?;
        Ok(())
    }

    /// Return a prior reservation to the available pool. A payment with no
    /// active reservation is a no-op, not an error, so the failure path can
    /// call this unconditionally.
    pub fn release(&self, payment_id: &str) -> Result<(), SettleError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let reservation: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT network, asset_id, amount FROM inventory_reservations
                 WHERE payment_id = ?1",
                [payment_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((network, asset_id, amount)) = reservation else {
            return Ok(());
        };

        tx.execute(
            "DELETE FROM inventory_reservations WHERE payment_id = ?1",
            [payment_id],
        )?;
        let updated = tx.execute(
            "UPDATE token_inventory
             SET available_balance = available_balance + ?3,
                 reserved_balance  = reserved_balance - ?3
             WHERE network = ?1 AND asset_id = ?2 AND reserved_balance >= ?3",
            rusqlite::params![network, asset_id, amount],
        )?;
        if updated == 0 {
            drop(tx);
            return Err(SettleError::StateConflict(format!(
                "reserved balance below reservation amount for payment {payment_id}"
            )));
        }

        tx.commit()?;
        Ok(())
    }

    /// Permanently remove a reserved amount from the tracked pool after the
    /// transfer confirmed: the tokens have left custody. Idempotent per
    /// payment for the same reason release is.
    pub fn commit_reservation(&self, payment_id: &str) -> Result<(), SettleError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let reservation: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT network, asset_id, amount FROM inventory_reservations
                 WHERE payment_id = ?1",
                [payment_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((network, asset_id, amount)) = reservation else {
            return Ok(());
        };

        tx.execute(
            "DELETE FROM inventory_reservations WHERE payment_id = ?1",
            [payment_id],
        )?;
        let updated = tx.execute(
            "UPDATE token_inventory
             SET reserved_balance = reserved_balance - ?3,
                 total_supply     = total_supply - ?3
             WHERE network = ?1 AND asset_id = ?2 AND reserved_balance >= ?3",
            rusqlite::params![network, asset_id, amount],
        )?;
        if updated == 0 {
            drop(tx);
            return Err(SettleError::StateConflict(format!(
                "reserved balance below reservation amount for payment {payment_id}"
            )));
        }

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET: &str = "testnet";
    const ASSET: &str = "0xa11ce";

    fn db_with_supply(total: u64) -> Db {
        let db = Db::open_in_memory().unwrap();
        db.provision_inventory(NET, ASSET, total, "0xcafe").unwrap();
        db
    }

    fn levels(db: &Db) -> (u64, u64, u64) {
        let conn = db.lock();
        conn.query_row(
            "SELECT total_supply, available_balance, reserved_balance FROM token_inventory
             WHERE network = ?1 AND asset_id = ?2",
            [NET, ASSET],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )
        .unwrap()
    }

    #[test]
    fn reserve_moves_available_to_reserved() {
        let db = db_with_supply(1000);
        db.reserve(NET, ASSET, "pay-1", 500).unwrap();
        assert_eq!(levels(&db), (1000, 500, 500));
    }

    #[test]
    fn reserve_rejects_when_insufficient() {
        let db = db_with_supply(100);
        let err = db.reserve(NET, ASSET, "pay-1", 500).unwrap_err();
        match err {
            SettleError::InsufficientInventory { requested, available } => {
                assert_eq!(requested, 500);
                assert_eq!(available, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Rejected reservation leaves no trace.
        assert_eq!(levels(&db), (100, 100, 0));
        db.release("pay-1").unwrap();
        assert_eq!(levels(&db), (100, 100, 0));
    }

    #[test]
    fn reserve_is_idempotent_per_payment() {
        let db = db_with_supply(1000);
        db.reserve(NET, ASSET, "pay-1", 400).unwrap();
        db.reserve(NET, ASSET, "pay-1", 400).unwrap();
        assert_eq!(levels(&db), (1000, 600, 400));
    }

    #[test]
    fn release_restores_available() {
        let db = db_with_supply(1000);
        db.reserve(NET, ASSET, "pay-1", 300).unwrap();
        db.release("pay-1").unwrap();
        assert_eq!(levels(&db), (1000, 1000, 0));
    }

    #[test]
    fn release_twice_is_a_no_op() {
        let db = db_with_supply(1000);
        db.reserve(NET, ASSET, "pay-1", 300).unwrap();
        db.release("pay-1").unwrap();
        db.release("pay-1").unwrap();
        assert_eq!(levels(&db), (1000, 1000, 0));
    }

    #[test]
    fn commit_removes_from_tracked_pool() {
        let db = db_with_supply(1000);
        db.reserve(NET, ASSET, "pay-1", 250).unwrap();
        db.commit_reservation("pay-1").unwrap();
        assert_eq!(levels(&db), (750, 750, 0));
        // Committing again is a no-op.
        db.commit_reservation("pay-1").unwrap();
        assert_eq!(levels(&db), (750, 750, 0));
    }

    #[test]
    fn invariant_holds_across_mixed_operations() {
        let db = db_with_supply(1000);
        db.reserve(NET, ASSET, "a", 200).unwrap();
        db.reserve(NET, ASSET, "b", 300).unwrap();
        db.release("a").unwrap();
        db.commit_reservation("b").unwrap();

        let (total, available, reserved) = levels(&db);
        assert!(available + reserved <= total);
        assert_eq!((total, available, reserved), (700, 700, 0));
    }

    #[test]
    fn availability_check_reports_balance() {
        let db = db_with_supply(100);
        let check = db.check_availability(NET, ASSET, 50).unwrap();
        assert!(check.available);
        assert_eq!(check.available_balance, 100);

        let check = db.check_availability(NET, ASSET, 150).unwrap();
        assert!(!check.available);
    }
}
