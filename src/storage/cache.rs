//! Delivery de-duplication cache.
//!
//! After a file is uploaded to Telegram once, the platform file_id it got
//! assigned is remembered under a fingerprint of (canonical URL, quality,
//! delivery kind). A later request with the same fingerprint is answered by
//! re-sending the file_id, skipping the download entirely.

use super::db::{get_connection, DbPool};
use crate::core::error::AppResult;

/// Builds the cache key for one (URL, settings) combination.
///
/// Different quality or delivery-kind settings must never collide, so both
/// are folded into the key next to the canonical URL.
pub fn fingerprint(canonical_url: &str, quality: &str, send_as: &str) -> String {
    format!("{}?p={}{}", canonical_url, quality, send_as)
}

/// A cached delivery: everything needed to re-send without re-downloading.
#[derive(Debug, Clone)]
pub struct CachedDelivery {
    pub fingerprint: String,
    pub canonical_url: String,
    /// Telegram file_id assigned at first upload
    pub file_id: String,
    /// Delivery kind the file was sent as: 'video', 'audio', 'document', 'animation', 'photo'
    pub kind: String,
    pub caption: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration: Option<i64>,
    pub file_size: Option<i64>,
}

/// Parameters for recording a fresh delivery
#[derive(Debug)]
pub struct NewDelivery<'a> {
    pub fingerprint: &'a str,
    pub canonical_url: &'a str,
    pub file_id: &'a str,
    pub kind: &'a str,
    pub caption: Option<&'a str>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration: Option<i64>,
    pub file_size: Option<i64>,
}

/// Handle to the delivery cache table, cheap to clone.
#[derive(Clone)]
pub struct DeliveryCache {
    pool: DbPool,
}

impl DeliveryCache {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Looks up a fingerprint. `None` means the download has to happen.
    pub fn lookup(&self, fingerprint: &str) -> AppResult<Option<CachedDelivery>> {
        let conn = get_connection(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT fingerprint, canonical_url, file_id, kind, caption,
                    width, height, duration, file_size
             FROM delivery_cache WHERE fingerprint = ?",
        )?;
        let mut rows = stmt.query(rusqlite::params![fingerprint])?;

        if let Some(row) = rows.next()? {
            Ok(Some(CachedDelivery {
                fingerprint: row.get(0)?,
                canonical_url: row.get(1)?,
                file_id: row.get(2)?,
                kind: row.get(3)?,
                caption: row.get(4)?,
                width: row.get(5)?,
                height: row.get(6)?,
                duration: row.get(7)?,
                file_size: row.get(8)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Records a delivery after the upload succeeded.
    ///
    /// Re-storing an existing fingerprint replaces the old row, so a
    /// re-download after /uncache refreshes the entry instead of failing.
    pub fn store(&self, delivery: &NewDelivery) -> AppResult<()> {
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "INSERT OR REPLACE INTO delivery_cache (
                fingerprint, canonical_url, file_id, kind, caption,
                width, height, duration, file_size
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                delivery.fingerprint,
                delivery.canonical_url,
                delivery.file_id,
                delivery.kind,
                delivery.caption,
                delivery.width,
                delivery.height,
                delivery.duration,
                delivery.file_size,
            ],
        )?;
        Ok(())
    }

    /// Drops every cached fingerprint for a canonical URL.
    ///
    /// Used by the admin /uncache command when a cached file turns out to
    /// be broken. Returns how many rows were removed.
    pub fn remove_by_url(&self, canonical_url: &str) -> AppResult<usize> {
        let conn = get_connection(&self.pool)?;
        let removed = conn.execute(
            "DELETE FROM delivery_cache WHERE canonical_url = ?1",
            rusqlite::params![canonical_url],
        )?;
        if removed > 0 {
            log::info!("🗑️ Uncached {} entries for {}", removed, canonical_url);
        }
        Ok(removed)
    }

    pub fn entry_count(&self) -> AppResult<i64> {
        let conn = get_connection(&self.pool)?;
        let count = conn.query_row("SELECT COUNT(*) FROM delivery_cache", [], |row| row.get(0))?;
        Ok(count)
    }
}
