//! Persistent advertisement store backed by `SQLite`.
//!
//! Every observed BLE advertisement lands in one table keyed by
//! `(rpi, timestamp)` with a secondary index on `timestamp` for the
//! retention purge. The interesting operation is [`AdvertisementStore::match_buffer`]:
//! a streaming join between the table and a caller-owned RPI buffer,
//! expressed as an ascending probe of the primary-key index for every
//! valid buffer position. The whole join runs inside one exclusive
//! transaction so the row snapshot and the cached row count cannot shear.
//!
//! # Schema
//!
//! `advertisements(rpi BLOB, encrypted_aem BLOB, timestamp INTEGER,
//! scan_interval INTEGER, rssi INTEGER, saturated INTEGER, counter
//! INTEGER, PRIMARY KEY(rpi, timestamp))` plus
//! `idx_advertisements_timestamp`.
//!
//! # Failure model
//!
//! Callers need to know which failures are survivable, so `SQLite`
//! result codes collapse into four actionable kinds plus a catch-all:
//! [`StoreError::Full`] (device storage exhausted),
//! [`StoreError::Corrupt`] (drop the store and rebuild),
//! [`StoreError::Reopen`] (transient I/O; close and reopen),
//! [`StoreError::Busy`] (retry after backoff). Transactions roll back on
//! error; no operation partially applies.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use enkit_core::crypto::{AEM_LEN, RPI_LEN};
use enkit_core::filter::QueryFilter;
use enkit_core::types::{Advertisement, MatchedAdvertisement};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File name of the central store inside its folder.
pub const STORE_FILE_NAME: &str = "en_advertisements.db";

/// RPI slots covered by one TEK, fixed by the protocol.
const SLOTS_PER_KEY: usize = 144;

const SCHEMA_SQL: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;

    CREATE TABLE IF NOT EXISTS advertisements (
        rpi BLOB NOT NULL,
        encrypted_aem BLOB NOT NULL,
        timestamp INTEGER NOT NULL,
        scan_interval INTEGER NOT NULL,
        rssi INTEGER NOT NULL,
        saturated INTEGER NOT NULL,
        counter INTEGER NOT NULL,
        PRIMARY KEY (rpi, timestamp)
    );

    CREATE INDEX IF NOT EXISTS idx_advertisements_timestamp
        ON advertisements(timestamp);
";

/// Errors surfaced by the advertisement store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Device storage is exhausted.
    #[error("device storage is full")]
    Full,

    /// The backing database is corrupt; drop the store and rebuild.
    #[error("store is corrupt and must be rebuilt")]
    Corrupt,

    /// Transient I/O failure; close and reopen the store.
    #[error("store must be closed and reopened")]
    Reopen,

    /// Another connection holds the database; retry after backoff.
    #[error("store is busy")]
    Busy,

    /// Bookkeeping or allocation failure.
    #[error("internal store failure: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DiskFull => Self::Full,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => Self::Corrupt,
                ErrorCode::SystemIoFailure | ErrorCode::CannotOpen => Self::Reopen,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Self::Busy,
                _ => Self::Internal {
                    message: err.to_string(),
                },
            },
            _ => Self::Internal {
                message: err.to_string(),
            },
        }
    }
}

/// Persistent store of observed advertisements.
///
/// The connection sits behind a mutex; concurrent sessions serialize
/// through it and every read operation takes an exclusive transaction
/// for a stable snapshot.
#[derive(Debug)]
pub struct AdvertisementStore {
    conn: Mutex<Connection>,
    cached_count: Mutex<Option<u64>>,
}

impl AdvertisementStore {
    /// Opens (creating if needed) the central store in `folder`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Reopen`] if the folder or database cannot
    /// be opened and mapped failures for everything else.
    pub fn open(folder: impl AsRef<Path>) -> Result<Self, StoreError> {
        let folder = folder.as_ref();
        std::fs::create_dir_all(folder).map_err(|e| StoreError::Internal {
            message: format!("failed to create store folder: {e}"),
        })?;
        let path = folder.join(STORE_FILE_NAME);
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        // Observation data is privacy-sensitive; keep it owner-only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mut permissions = metadata.permissions();
                permissions.set_mode(0o600);
                let _ = std::fs::set_permissions(&path, permissions);
            }
        }

        info!(path = %path.display(), "opened advertisement store");
        Ok(Self {
            conn: Mutex::new(conn),
            cached_count: Mutex::new(None),
        })
    }

    /// Opens an in-memory store, for tests and tooling.
    ///
    /// # Errors
    ///
    /// Propagates mapped `SQLite` failures.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cached_count: Mutex::new(None),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Internal {
            message: "connection lock poisoned".to_string(),
        })
    }

    fn invalidate_count(&self) {
        if let Ok(mut cached) = self.cached_count.lock() {
            *cached = None;
        }
    }

    /// Count of advertisements currently persisted.
    ///
    /// The count is cached between mutations; the first call after an
    /// insert, purge, or match overflow re-reads it from the database.
    ///
    /// # Errors
    ///
    /// Propagates mapped `SQLite` failures.
    pub fn stored_count(&self) -> Result<u64, StoreError> {
        if let Ok(cached) = self.cached_count.lock() {
            if let Some(count) = *cached {
                return Ok(count);
            }
        }
        let conn = self.lock_conn()?;
        let count: u64 =
            conn.query_row("SELECT COUNT(*) FROM advertisements", [], |row| row.get(0))?;
        drop(conn);
        if let Ok(mut cached) = self.cached_count.lock() {
            *cached = Some(count);
        }
        Ok(count)
    }

    /// Inserts an observation, folding it into an existing row when one
    /// already carries the same `(rpi, timestamp)` key.
    ///
    /// # Errors
    ///
    /// Propagates mapped `SQLite` failures; the transaction rolls back
    /// on error.
    pub fn insert(&self, advertisement: &Advertisement) -> Result<(), StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT encrypted_aem, scan_interval, rssi, saturated, counter
                 FROM advertisements WHERE rpi = ?1 AND timestamp = ?2",
                params![advertisement.rpi.as_slice(), advertisement.timestamp],
                |row| {
                    row_to_advertisement(
                        &advertisement.rpi,
                        advertisement.timestamp,
                        row.get_ref(0)?.as_blob()?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    )
                },
            )
            .optional()?;

        if let Some(mut merged) = existing {
            merged.combine(advertisement);
            tx.execute(
                "UPDATE advertisements
                 SET rssi = ?3, saturated = ?4, counter = ?5
                 WHERE rpi = ?1 AND timestamp = ?2",
                params![
                    advertisement.rpi.as_slice(),
                    advertisement.timestamp,
                    merged.rssi,
                    merged.saturated,
                    merged.counter
                ],
            )?;
        } else {
            tx.execute(
                "INSERT INTO advertisements
                 (rpi, encrypted_aem, timestamp, scan_interval, rssi, saturated, counter)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    advertisement.rpi.as_slice(),
                    advertisement.encrypted_aem.as_slice(),
                    advertisement.timestamp,
                    advertisement.scan_interval,
                    advertisement.rssi,
                    advertisement.saturated,
                    advertisement.counter
                ],
            )?;
        }
        tx.commit()?;
        self.invalidate_count();
        Ok(())
    }

    /// Enumerates every stored RPI into a fresh bloom filter.
    ///
    /// # Errors
    ///
    /// Invalid filter parameters and mapped `SQLite` failures surface as
    /// [`StoreError`].
    pub fn build_prefilter(
        &self,
        buffer_size: usize,
        hash_count: usize,
    ) -> Result<QueryFilter, StoreError> {
        let mut filter =
            QueryFilter::new(buffer_size, hash_count).map_err(|e| StoreError::Internal {
                message: e.to_string(),
            })?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            let mut stmt = tx.prepare("SELECT rpi FROM advertisements")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let blob = row.get_ref(0)?.as_blob().map_err(rusqlite::Error::from)?;
                let rpi: [u8; RPI_LEN] = blob_to_array(blob, "rpi")?;
                filter.insert(&rpi);
            }
        }
        tx.commit()?;
        debug!(
            buffer_size,
            hash_count, "built query pre-filter from stored advertisements"
        );
        Ok(filter)
    }

    /// Finds every stored advertisement whose RPI occupies a valid slot
    /// of the caller's buffer.
    ///
    /// `rpi_buffer` holds `validity.len()` packed 16-byte RPIs; only
    /// positions whose validity flag is set participate. Buffer
    /// positions are scanned in ascending order and each stored row is
    /// annotated with the first position that matched it:
    /// `daily_key_index = i / 144`, `rpi_index = i % 144`.
    ///
    /// The result is bounded by [`Self::stored_count`] at entry. If the
    /// bound turns out stale, the excess is dropped, the cached count is
    /// invalidated, and the partial result is returned.
    ///
    /// # Errors
    ///
    /// [`StoreError::Internal`] on a buffer length mismatch and mapped
    /// `SQLite` failures otherwise; the transaction rolls back on error.
    pub fn match_buffer(
        &self,
        rpi_buffer: &[u8],
        validity: &[bool],
        valid_count: usize,
    ) -> Result<Vec<MatchedAdvertisement>, StoreError> {
        if rpi_buffer.len() != validity.len() * RPI_LEN {
            return Err(StoreError::Internal {
                message: format!(
                    "rpi buffer is {} bytes for {} validity slots",
                    rpi_buffer.len(),
                    validity.len()
                ),
            });
        }
        let bound = self.stored_count()?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let mut matches = Vec::new();
        let mut overflowed = false;
        {
            let mut stmt = tx.prepare(
                "SELECT encrypted_aem, timestamp, scan_interval, rssi, saturated, counter
                 FROM advertisements WHERE rpi = ?1 ORDER BY timestamp ASC",
            )?;

            let mut probed: HashSet<[u8; RPI_LEN]> = HashSet::new();
            let mut seen_valid = 0usize;
            'positions: for (position, _) in validity
                .iter()
                .enumerate()
                .filter(|(_, &valid)| valid)
            {
                if seen_valid >= valid_count {
                    break;
                }
                seen_valid += 1;

                let rpi: [u8; RPI_LEN] = rpi_buffer[position * RPI_LEN..(position + 1) * RPI_LEN]
                    .try_into()
                    .map_err(|_| StoreError::Internal {
                        message: "rpi buffer slice misaligned".to_string(),
                    })?;
                if !probed.insert(rpi) {
                    continue;
                }

                let mut rows = stmt.query(params![rpi.as_slice()])?;
                while let Some(row) = rows.next()? {
                    if matches.len() as u64 >= bound {
                        overflowed = true;
                        break 'positions;
                    }
                    let blob = row.get_ref(0)?.as_blob().map_err(rusqlite::Error::from)?;
                    let advertisement = row_to_advertisement(
                        &rpi,
                        row.get(1)?,
                        blob,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    )?;
                    #[allow(clippy::cast_possible_truncation)]
                    matches.push(MatchedAdvertisement {
                        advertisement,
                        daily_key_index: (position / SLOTS_PER_KEY) as u32,
                        rpi_index: (position % SLOTS_PER_KEY) as u16,
                    });
                }
            }
        }
        tx.commit()?;
        drop(conn);

        if overflowed {
            warn!(
                bound,
                "match result exceeded cached row count; dropping excess"
            );
            self.invalidate_count();
        }
        Ok(matches)
    }

    /// Deletes advertisements observed before `cutoff`, returning how
    /// many rows went away. Driven by the externally-scheduled daily
    /// retention purge.
    ///
    /// # Errors
    ///
    /// Propagates mapped `SQLite` failures.
    pub fn purge_before(&self, cutoff: i64) -> Result<u64, StoreError> {
        let conn = self.lock_conn()?;
        let purged = conn.execute(
            "DELETE FROM advertisements WHERE timestamp < ?1",
            params![cutoff],
        )?;
        drop(conn);
        self.invalidate_count();
        info!(cutoff, purged, "purged expired advertisements");
        Ok(purged as u64)
    }
}

fn blob_to_array<const N: usize>(blob: &[u8], what: &str) -> Result<[u8; N], rusqlite::Error> {
    blob.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            blob.len(),
            rusqlite::types::Type::Blob,
            format!("{what} column is {} bytes, expected {N}", blob.len()).into(),
        )
    })
}

fn row_to_advertisement(
    rpi: &[u8; RPI_LEN],
    timestamp: i64,
    encrypted_aem: &[u8],
    scan_interval: u16,
    rssi: i8,
    saturated: bool,
    counter: u8,
) -> Result<Advertisement, rusqlite::Error> {
    let encrypted_aem: [u8; AEM_LEN] = blob_to_array(encrypted_aem, "encrypted_aem")?;
    Ok(Advertisement {
        rpi: *rpi,
        encrypted_aem,
        timestamp,
        scan_interval,
        rssi,
        saturated,
        counter,
    })
}
