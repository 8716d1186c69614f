//! SQLite-backed durable store shared by the idempotency ledger, the
//! inventory manager and the transaction ledger.
//!
//! A single connection behind a mutex keeps multi-row updates (inventory +
//! payment row together) inside one SQL transaction. WAL journal mode and
//! 0600 file permissions match the rest of the deployment.

use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS webhook_events (
    event_id   TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    processed  INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payment_transactions (
    id                    TEXT PRIMARY KEY,
    payment_reference     TEXT NOT NULL UNIQUE,
    session_id            TEXT,
    payment_intent_id     TEXT,
    token_amount          INTEGER NOT NULL,
    price_per_token       INTEGER NOT NULL,
    subtotal              INTEGER NOT NULL,
    processing_fee        INTEGER NOT NULL,
    total_amount          INTEGER NOT NULL,
    currency              TEXT NOT NULL,
    user_wallet_address   TEXT NOT NULL,
    user_email            TEXT,
    payment_status        TEXT NOT NULL,
    token_transfer_status TEXT NOT NULL,
    token_transfer_tx_id  TEXT,
    token_transfer_error  TEXT,
    created_at            TEXT NOT NULL,
    paid_at               TEXT,
    tokens_transferred_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_payments_wallet ON payment_transactions(user_wallet_address);
CREATE INDEX IF NOT EXISTS idx_payments_status ON payment_transactions(payment_status);

CREATE TABLE IF NOT EXISTS token_inventory (
    network                TEXT NOT NULL,
    asset_id               TEXT NOT NULL,
    total_supply           INTEGER NOT NULL,
    available_balance      INTEGER NOT NULL,
    reserved_balance       INTEGER NOT NULL,
    central_wallet_address TEXT NOT NULL,
    PRIMARY KEY (network, asset_id),
    CHECK (available_balance >= 0),
    CHECK (reserved_balance >= 0),
    CHECK (available_balance + reserved_balance <= total_supply)
);

CREATE TABLE IF NOT EXISTS inventory_reservations (
    payment_id TEXT PRIMARY KEY,
    network    TEXT NOT NULL,
    asset_id   TEXT NOT NULL,
    amount     INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS token_transfers (
    id               TEXT PRIMARY KEY,
    payment_id       TEXT NOT NULL,
    kind             TEXT NOT NULL,
    from_address     TEXT NOT NULL,
    to_address       TEXT NOT NULL,
    asset_id         TEXT NOT NULL,
    amount           INTEGER NOT NULL,
    transaction_hash TEXT,
    status           TEXT NOT NULL,
    error_message    TEXT,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transfers_payment ON token_transfers(payment_id);

CREATE TABLE IF NOT EXISTS user_wallet_balances (
    wallet_address TEXT NOT NULL,
    network        TEXT NOT NULL,
    asset_id       TEXT NOT NULL,
    balance        INTEGER NOT NULL,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (wallet_address, network, asset_id)
);

PRAGMA journal_mode=WAL;
";

/// Handle to the settlement database. Cheap to share behind an `Arc`.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the settlement database at the given path.
    ///
    /// On Unix systems the database file permissions are restricted to 0600
    /// (owner read/write only): the ledger holds buyer emails and wallet
    /// addresses.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set ledger database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned mutex. Writes that
    /// poisoned the lock have already been rolled back by SQLite.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("ledger database mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Create the inventory row for (network, asset) if it does not exist.
    /// Called once at provisioning time; existing rows are left untouched.
    pub fn provision_inventory(
        &self,
        network: &str,
        asset_id: &str,
        total_supply: u64,
        central_wallet_address: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO token_inventory
                 (network, asset_id, total_supply, available_balance, reserved_balance, central_wallet_address)
             VALUES (?1, ?2, ?3, ?3, 0, ?4)",
            rusqlite::params![network, asset_id, total_supply as i64, central_wallet_address],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let db = Db::open(path.to_str().unwrap()).unwrap();
            db.provision_inventory("testnet", "asset", 1000, "0xcafe").unwrap();
        }

        let db = Db::open(path.to_str().unwrap()).unwrap();
        let conn = db.lock();
        let total: i64 = conn
            .query_row(
                "SELECT total_supply FROM token_inventory WHERE network='testnet'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(total, 1000);
    }

    #[test]
    fn provision_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        db.provision_inventory("testnet", "asset", 1000, "0xcafe").unwrap();
        db.provision_inventory("testnet", "asset", 9999, "0xcafe").unwrap();

        let conn = db.lock();
        let total: i64 = conn
            .query_row("SELECT total_supply FROM token_inventory", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 1000);
    }
}
