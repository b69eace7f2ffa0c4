use chrono::{NaiveDate, NaiveTime};
use ingest_core::domain::{
    ClientRecord, IngestionState, ProductRecord, Record, StoreRecord, TargetDate,
    TransactionRecord,
};
use ingest_core::ports::{RecordStore, Result, StoreTransaction};
use ingest_core::schema::Dataset;
use ingest_core::utils::{format_timestamp, parse_timestamp, TIME_FORMAT};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    job TEXT,
    email TEXT,
    account_id TEXT NOT NULL,
    source_blob TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY,
    ean INTEGER NOT NULL,
    brand TEXT,
    description TEXT,
    source_blob TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stores (
    id INTEGER PRIMARY KEY,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    opening TEXT NOT NULL,
    closing TEXT NOT NULL,
    type TEXT NOT NULL,
    source_blob TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    transaction_id INTEGER PRIMARY KEY,
    client_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    store_id INTEGER NOT NULL,
    transaction_time TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    account_id TEXT,
    process_date TEXT NOT NULL,
    source_blob TEXT NOT NULL,
    processed_at TEXT DEFAULT (DATETIME('now'))
);

CREATE INDEX IF NOT EXISTS transactions_process_date ON transactions (process_date);

CREATE TABLE IF NOT EXISTS ingestion_log (
    process_date TEXT NOT NULL,
    blob_name TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    etag TEXT,
    row_count INTEGER NOT NULL,
    loaded_at TEXT NOT NULL,
    PRIMARY KEY (process_date, blob_name)
);
"#;

const UPSERT_TRANSACTION: &str = r#"
INSERT INTO transactions
    (transaction_id, client_id, product_id, store_id, transaction_time, quantity,
     account_id, process_date, source_blob)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, (SELECT account_id FROM clients WHERE id = ?2), ?7, ?8)
ON CONFLICT (transaction_id) DO UPDATE SET
    client_id = excluded.client_id,
    product_id = excluded.product_id,
    store_id = excluded.store_id,
    transaction_time = excluded.transaction_time,
    quantity = excluded.quantity,
    account_id = excluded.account_id,
    source_blob = excluded.source_blob
WHERE transactions.process_date = excluded.process_date
"#;

const UPSERT_CLIENT: &str = r#"
INSERT INTO clients (id, name, job, email, account_id, source_blob)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT (id) DO UPDATE SET
    name = excluded.name,
    job = excluded.job,
    email = excluded.email,
    account_id = excluded.account_id,
    source_blob = excluded.source_blob
"#;

const UPSERT_PRODUCT: &str = r#"
INSERT INTO products (id, ean, brand, description, source_blob)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT (id) DO UPDATE SET
    ean = excluded.ean,
    brand = excluded.brand,
    description = excluded.description,
    source_blob = excluded.source_blob
"#;

const UPSERT_STORE: &str = r#"
INSERT INTO stores (id, latitude, longitude, opening, closing, type, source_blob)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT (id) DO UPDATE SET
    latitude = excluded.latitude,
    longitude = excluded.longitude,
    opening = excluded.opening,
    closing = excluded.closing,
    type = excluded.type,
    source_blob = excluded.source_blob
"#;

const MARK_LOADED: &str = r#"
INSERT INTO ingestion_log (process_date, blob_name, content_hash, etag, row_count, loaded_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT (process_date, blob_name) DO UPDATE SET
    content_hash = excluded.content_hash,
    etag = excluded.etag,
    row_count = excluded.row_count,
    loaded_at = excluded.loaded_at
"#;

/// SQLite implementation of the RecordStore trait
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Opens (or creates) the database file and makes sure the tables exist
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        let store = Self::with_connection(conn)?;
        info!(path = %db_path.as_ref().display(), "database tables created/verified");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Reads back every row of a dataset ordered by its key
    pub fn fetch_records(&self, dataset: Dataset) -> Result<Vec<Record>> {
        let sql = match dataset {
            Dataset::Transactions => {
                "SELECT transaction_id, client_id, product_id, store_id, transaction_time, quantity
                 FROM transactions ORDER BY transaction_id"
            }
            Dataset::Clients => {
                "SELECT id, name, job, email, account_id FROM clients ORDER BY id"
            }
            Dataset::Products => "SELECT id, ean, brand, description FROM products ORDER BY id",
            Dataset::Stores => {
                "SELECT id, latitude, longitude, opening, closing, type FROM stores ORDER BY id"
            }
        };

        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map([], |row: &Row| map_record(dataset, row))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        Ok(records)
    }

    /// Number of transaction rows recorded for a process date
    pub fn count_transactions(&self, date: &TargetDate) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE process_date = ?1",
            params![date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Account id joined onto a transaction from the clients table
    pub fn transaction_account(&self, transaction_id: i64) -> Result<Option<String>> {
        let account = self
            .conn
            .query_row(
                "SELECT account_id FROM transactions WHERE transaction_id = ?1",
                params![transaction_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(account.flatten())
    }

    pub fn ingestion_log(&self) -> Result<Vec<IngestionState>> {
        let mut stmt = self.conn.prepare(
            "SELECT process_date, blob_name, content_hash, etag, row_count, loaded_at
             FROM ingestion_log ORDER BY process_date, blob_name",
        )?;
        let states = stmt
            .query_map([], map_state)?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(states)
    }
}

impl RecordStore for SqliteRecordStore {
    fn is_loaded(&self, date: &TargetDate, blob_name: &str) -> Result<Option<IngestionState>> {
        let state = self
            .conn
            .query_row(
                "SELECT process_date, blob_name, content_hash, etag, row_count, loaded_at
                 FROM ingestion_log WHERE process_date = ?1 AND blob_name = ?2",
                params![date.to_string(), blob_name],
                map_state,
            )
            .optional()?;
        Ok(state)
    }

    fn last_loaded(&self, blob_name: &str) -> Result<Option<IngestionState>> {
        let state = self
            .conn
            .query_row(
                "SELECT process_date, blob_name, content_hash, etag, row_count, loaded_at
                 FROM ingestion_log WHERE blob_name = ?1
                 ORDER BY loaded_at DESC, process_date DESC LIMIT 1",
                params![blob_name],
                map_state,
            )
            .optional()?;
        Ok(state)
    }

    fn begin(&mut self) -> Result<Box<dyn StoreTransaction + '_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

/// One blob's write unit. Dropping it without commit rolls back.
struct SqliteTransaction<'c> {
    tx: Transaction<'c>,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn upsert(&mut self, record: &Record, date: &TargetDate, blob_name: &str) -> Result<()> {
        match record {
            Record::Transaction(t) => {
                let changed = self.tx.prepare_cached(UPSERT_TRANSACTION)?.execute(params![
                    t.transaction_id,
                    t.client_id,
                    t.product_id,
                    t.store_id,
                    format_timestamp(&t.transaction_time),
                    t.quantity,
                    date.to_string(),
                    blob_name,
                ])?;
                // the upsert only updates rows of the same process date
                if changed == 0 {
                    let loaded_for: String = self.tx.query_row(
                        "SELECT process_date FROM transactions WHERE transaction_id = ?1",
                        params![t.transaction_id],
                        |row| row.get(0),
                    )?;
                    return Err(format!(
                        "transaction {} already loaded for {}",
                        t.transaction_id, loaded_for
                    )
                    .into());
                }
            }
            Record::Client(c) => {
                self.tx.prepare_cached(UPSERT_CLIENT)?.execute(params![
                    c.id,
                    c.name,
                    c.job,
                    c.email,
                    c.account_id,
                    blob_name,
                ])?;
            }
            Record::Product(p) => {
                self.tx.prepare_cached(UPSERT_PRODUCT)?.execute(params![
                    p.id,
                    p.ean,
                    p.brand,
                    p.description,
                    blob_name,
                ])?;
            }
            Record::Store(s) => {
                self.tx.prepare_cached(UPSERT_STORE)?.execute(params![
                    s.id,
                    s.latitude,
                    s.longitude,
                    s.opening.format(TIME_FORMAT).to_string(),
                    s.closing.format(TIME_FORMAT).to_string(),
                    s.store_type,
                    blob_name,
                ])?;
            }
        }
        Ok(())
    }

    fn clear_blob(&mut self, blob_name: &str) -> Result<usize> {
        let mut removed = 0;
        for table in ["transactions", "clients", "products", "stores"] {
            removed += self.tx.execute(
                &format!("DELETE FROM {} WHERE source_blob = ?1", table),
                params![blob_name],
            )?;
        }
        Ok(removed)
    }

    fn mark_loaded(&mut self, state: &IngestionState) -> Result<()> {
        self.tx.prepare_cached(MARK_LOADED)?.execute(params![
            state.date.to_string(),
            state.blob_name,
            state.content_hash,
            state.etag,
            state.row_count as i64,
            format_timestamp(&state.loaded_at),
        ])?;
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

fn conversion_error(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected stored value '{}'", value).into(),
    )
}

fn get_time(row: &Row, idx: usize) -> rusqlite::Result<NaiveTime> {
    let raw: String = row.get(idx)?;
    NaiveTime::parse_from_str(&raw, TIME_FORMAT).map_err(|_| conversion_error(idx, &raw))
}

fn map_record(dataset: Dataset, row: &Row) -> rusqlite::Result<Record> {
    Ok(match dataset {
        Dataset::Transactions => {
            let raw_time: String = row.get(4)?;
            let transaction_time =
                parse_timestamp(&raw_time).ok_or_else(|| conversion_error(4, &raw_time))?;
            Record::Transaction(TransactionRecord {
                transaction_id: row.get(0)?,
                client_id: row.get(1)?,
                product_id: row.get(2)?,
                store_id: row.get(3)?,
                transaction_time,
                quantity: row.get(5)?,
            })
        }
        Dataset::Clients => Record::Client(ClientRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            job: row.get(2)?,
            email: row.get(3)?,
            account_id: row.get(4)?,
        }),
        Dataset::Products => Record::Product(ProductRecord {
            id: row.get(0)?,
            ean: row.get(1)?,
            brand: row.get(2)?,
            description: row.get(3)?,
        }),
        Dataset::Stores => Record::Store(StoreRecord {
            id: row.get(0)?,
            latitude: row.get(1)?,
            longitude: row.get(2)?,
            opening: get_time(row, 3)?,
            closing: get_time(row, 4)?,
            store_type: row.get(5)?,
        }),
    })
}

fn map_state(row: &Row) -> rusqlite::Result<IngestionState> {
    let raw_date: String = row.get(0)?;
    let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
        .map_err(|_| conversion_error(0, &raw_date))?;
    let raw_loaded_at: String = row.get(5)?;
    let loaded_at =
        parse_timestamp(&raw_loaded_at).ok_or_else(|| conversion_error(5, &raw_loaded_at))?;
    let row_count: i64 = row.get(4)?;

    Ok(IngestionState {
        date: TargetDate::new(date),
        blob_name: row.get(1)?,
        content_hash: row.get(2)?,
        etag: row.get(3)?,
        row_count: row_count as usize,
        loaded_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> TargetDate {
        TargetDate::new(NaiveDate::from_ymd_opt(2023, 11, 24).unwrap())
    }

    fn transaction(id: i64, client_id: i64) -> Record {
        Record::Transaction(TransactionRecord {
            transaction_id: id,
            client_id,
            product_id: 10,
            store_id: 3,
            transaction_time: parse_timestamp("2023-11-24 08:15:00").unwrap(),
            quantity: 2,
        })
    }

    fn state(blob_name: &str, rows: usize) -> IngestionState {
        IngestionState {
            date: date(),
            blob_name: blob_name.to_string(),
            content_hash: "abc".to_string(),
            etag: Some("\"0x1\"".to_string()),
            row_count: rows,
            loaded_at: parse_timestamp("2023-11-25 01:00:00").unwrap(),
        }
    }

    #[test]
    fn test_commit_persists_rows_and_marker() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.upsert(&transaction(1, 7), &date(), "transactions_2023-11-24_8.csv")
            .unwrap();
        tx.mark_loaded(&state("transactions_2023-11-24_8.csv", 1)).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            store.fetch_records(Dataset::Transactions).unwrap(),
            vec![transaction(1, 7)]
        );
        assert_eq!(
            store
                .is_loaded(&date(), "transactions_2023-11-24_8.csv")
                .unwrap(),
            Some(state("transactions_2023-11-24_8.csv", 1))
        );
        assert_eq!(store.count_transactions(&date()).unwrap(), 1);
    }

    #[test]
    fn test_rollback_discards_everything() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.upsert(&transaction(1, 7), &date(), "a.csv").unwrap();
        tx.mark_loaded(&state("a.csv", 1)).unwrap();
        tx.rollback().unwrap();

        assert!(store.fetch_records(Dataset::Transactions).unwrap().is_empty());
        assert_eq!(store.is_loaded(&date(), "a.csv").unwrap(), None);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        {
            let mut tx = store.begin().unwrap();
            tx.upsert(&transaction(1, 7), &date(), "a.csv").unwrap();
        }
        assert!(store.fetch_records(Dataset::Transactions).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_is_idempotent_on_natural_key() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        for _ in 0..2 {
            let mut tx = store.begin().unwrap();
            tx.upsert(&transaction(1, 7), &date(), "a.csv").unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(store.fetch_records(Dataset::Transactions).unwrap().len(), 1);
    }

    #[test]
    fn test_transactions_pick_up_account_from_clients() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.upsert(
            &Record::Client(ClientRecord {
                id: 7,
                name: "Ana".to_string(),
                job: None,
                email: None,
                account_id: "ACC-7".to_string(),
            }),
            &date(),
            "clients.csv",
        )
        .unwrap();
        tx.upsert(&transaction(1, 7), &date(), "a.csv").unwrap();
        tx.upsert(&transaction(2, 99), &date(), "a.csv").unwrap();
        tx.commit().unwrap();

        assert_eq!(store.transaction_account(1).unwrap(), Some("ACC-7".to_string()));
        assert_eq!(store.transaction_account(2).unwrap(), None);
        assert_eq!(store.transaction_account(3).unwrap(), None);
    }

    #[test]
    fn test_clear_blob_only_touches_that_blob() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.upsert(&transaction(1, 7), &date(), "a.csv").unwrap();
        tx.upsert(&transaction(2, 7), &date(), "b.csv").unwrap();
        let removed = tx.clear_blob("a.csv").unwrap();
        tx.commit().unwrap();

        assert_eq!(removed, 1);
        assert_eq!(
            store.fetch_records(Dataset::Transactions).unwrap(),
            vec![transaction(2, 7)]
        );
    }

    #[test]
    fn test_store_round_trip_keeps_seconds() {
        let store_record = Record::Store(StoreRecord {
            id: 3,
            latitude: 40.4168,
            longitude: -3.7038,
            opening: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            closing: NaiveTime::from_hms_opt(21, 30, 15).unwrap(),
            store_type: "Express".to_string(),
        });
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.upsert(&store_record, &date(), "stores.csv").unwrap();
        tx.commit().unwrap();

        assert_eq!(store.fetch_records(Dataset::Stores).unwrap(), vec![store_record]);
    }

    #[test]
    fn test_open_file_database_twice_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retail_data.db");
        {
            let mut store = SqliteRecordStore::open(&path).unwrap();
            let mut tx = store.begin().unwrap();
            tx.mark_loaded(&state("a.csv", 0)).unwrap();
            tx.commit().unwrap();
        }
        let store = SqliteRecordStore::open(&path).unwrap();
        assert_eq!(store.ingestion_log().unwrap(), vec![state("a.csv", 0)]);
    }

    #[test]
    fn test_transaction_id_reused_on_later_date_fails() {
        let next_day = TargetDate::new(NaiveDate::from_ymd_opt(2023, 11, 25).unwrap());
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.upsert(&transaction(1, 7), &date(), "a.csv").unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let err = tx.upsert(&transaction(1, 8), &next_day, "b.csv").unwrap_err();
        assert!(err.to_string().contains("already loaded for 2023-11-24"), "{err}");
        drop(tx);

        assert_eq!(store.count_transactions(&date()).unwrap(), 1);
        assert_eq!(store.count_transactions(&next_day).unwrap(), 0);
        assert_eq!(
            store.fetch_records(Dataset::Transactions).unwrap(),
            vec![transaction(1, 7)]
        );
    }

    #[test]
    fn test_last_loaded_spans_dates() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let later = IngestionState {
            date: TargetDate::new(NaiveDate::from_ymd_opt(2023, 11, 25).unwrap()),
            content_hash: "def".to_string(),
            loaded_at: parse_timestamp("2023-11-26 01:00:00").unwrap(),
            ..state("clients.csv", 2)
        };
        let mut tx = store.begin().unwrap();
        tx.mark_loaded(&state("clients.csv", 2)).unwrap();
        tx.mark_loaded(&later).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.last_loaded("clients.csv").unwrap(), Some(later));
        assert_eq!(store.last_loaded("stores.csv").unwrap(), None);
    }
}
