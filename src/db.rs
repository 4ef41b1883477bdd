use crate::error::{Error, Result};
use crate::model::{ListSource, Metadata, PhoneNumber, Provider, SuppressionEntry};
use crate::store::{EntryFilter, SyncChangeSet};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::time::Duration;
use tracing::info;

const ENTRY_COLUMNS: &str = "id, phone_number, source, provider_id, reason, added_at, expires_at,
     source_reference, notes, metadata, added_by, updated_at, removed_at, removed_by,
     removal_reason";

/// Synchronous SQLite access. All calls block; async callers go through
/// [`crate::store::SqliteStore`], which moves them onto the blocking pool.
pub struct DbClient {
    db_path: String,
    conn: Mutex<Connection>,
}

impl DbClient {
    pub fn new(db_path: impl Into<String>) -> Result<Self> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            db_path: ":memory:".to_string(),
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS suppression_entries (
                id TEXT PRIMARY KEY,
                phone_number TEXT NOT NULL,
                source TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                expires_at INTEGER,
                source_reference TEXT,
                notes TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}',
                added_by TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                removed_at INTEGER,
                removed_by TEXT,
                removal_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_entries_phone ON suppression_entries(phone_number);
            CREATE INDEX IF NOT EXISTS idx_entries_expires ON suppression_entries(expires_at);
            CREATE INDEX IF NOT EXISTS idx_entries_provider ON suppression_entries(provider_id);
            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;

        info!("SQLite database initialized at {}", self.db_path);
        Ok(())
    }

    pub fn active_entries(
        &self,
        phone: &PhoneNumber,
        provider_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<SuppressionEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM suppression_entries
             WHERE phone_number = ?1 AND provider_id = ?2 AND removed_at IS NULL
               AND (expires_at IS NULL OR expires_at > ?3)",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![phone.as_str(), provider_id, as_of.timestamp_millis()],
            read_entry,
        )?;
        collect_rows(rows)
    }

    pub fn get_entry(&self, id: &str) -> Result<Option<SuppressionEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM suppression_entries WHERE id = ?1",
            ENTRY_COLUMNS
        ))?;
        let row = stmt.query_row(params![id], read_entry).optional()?;
        row.transpose()
    }

    pub fn insert_entry(&self, entry: &SuppressionEntry) -> Result<()> {
        let mut conn = self.conn.lock();
        // IMMEDIATE takes the write lock up front so the duplicate check and
        // the insert cannot interleave with another writer.
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM suppression_entries
                 WHERE phone_number = ?1 AND source = ?2 AND removed_at IS NULL
                   AND (expires_at IS NULL OR expires_at > ?3)
                 LIMIT 1",
                params![
                    entry.phone_number.as_str(),
                    entry.source.as_str(),
                    entry.added_at.timestamp_millis()
                ],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            return Err(Error::conflict(format!(
                "{} already has an active {} suppression ({})",
                entry.phone_number, entry.source, existing
            )));
        }
        insert_row(&tx, entry).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::conflict(format!("entry {} already exists", entry.id))
            }
            other => other.into(),
        })?;
        tx.commit()?;
        Ok(())
    }

    /// Rejects an update that would reactivate an entry while another entry
    /// for the same (phone number, source) is active.
    pub fn update_entry(&self, entry: &SuppressionEntry) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let at = entry.updated_at.timestamp_millis();
        let was_active: Option<bool> = tx
            .query_row(
                "SELECT removed_at IS NULL AND (expires_at IS NULL OR expires_at > ?2)
                 FROM suppression_entries WHERE id = ?1",
                params![entry.id, at],
                |row| row.get(0),
            )
            .optional()?;
        let Some(was_active) = was_active else {
            return Err(Error::not_found("suppression entry", &entry.id));
        };
        if !was_active && entry.is_active(entry.updated_at) {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM suppression_entries
                     WHERE phone_number = ?1 AND source = ?2 AND id <> ?3 AND removed_at IS NULL
                       AND (expires_at IS NULL OR expires_at > ?4)
                     LIMIT 1",
                    params![entry.phone_number.as_str(), entry.source.as_str(), entry.id, at],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(Error::conflict(format!(
                    "{} already has an active {} suppression ({})",
                    entry.phone_number, entry.source, existing
                )));
            }
        }
        update_row(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_entry(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM suppression_entries WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn provider_entries(&self, provider_id: &str) -> Result<Vec<SuppressionEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM suppression_entries WHERE provider_id = ?1 AND removed_at IS NULL",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![provider_id], read_entry)?;
        collect_rows(rows)
    }

    pub fn apply_sync(&self, provider_id: &str, changes: &SyncChangeSet) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for entry in &changes.added {
            insert_row(&tx, entry)?;
        }
        for entry in &changes.updated {
            if entry.provider_id != provider_id || update_row(&tx, entry)? == 0 {
                return Err(Error::not_found("suppression entry", &entry.id));
            }
        }

        let removed_at = changes.removed_at.unwrap_or_else(Utc::now).timestamp_millis();
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE suppression_entries
                 SET removed_at = ?1, removed_by = ?2, removal_reason = ?3, updated_at = ?1
                 WHERE id = ?4 AND provider_id = ?5",
            )?;
            for id in &changes.removed {
                let changed = stmt.execute(params![
                    removed_at,
                    changes.removed_by,
                    changes.removal_reason,
                    id,
                    provider_id
                ])?;
                if changed == 0 {
                    return Err(Error::not_found("suppression entry", id));
                }
            }
        }

        // Dropping the transaction on any early return rolls it back.
        tx.commit()?;
        Ok(())
    }

    pub fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<SuppressionEntry>> {
        let mut sql = format!("SELECT {} FROM suppression_entries WHERE 1 = 1", ENTRY_COLUMNS);
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(phone) = &filter.phone_number {
            args.push(phone.as_str().to_string().into());
            sql.push_str(&format!(" AND phone_number = ?{}", args.len()));
        }
        if let Some(provider_id) = &filter.provider_id {
            args.push(provider_id.clone().into());
            sql.push_str(&format!(" AND provider_id = ?{}", args.len()));
        }
        if let Some(since) = filter.added_since {
            args.push(since.timestamp_millis().into());
            sql.push_str(&format!(" AND added_at >= ?{}", args.len()));
        }
        if !filter.include_removed {
            sql.push_str(" AND removed_at IS NULL");
        }
        sql.push_str(" ORDER BY added_at ASC, id ASC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), read_entry)?;
        // Source and time-window filters are cheaper to apply on decoded rows.
        let mut out: Vec<SuppressionEntry> = collect_rows(rows)?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    pub fn list_providers(&self) -> Result<Vec<Provider>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT data FROM providers ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for data in rows {
            out.push(serde_json::from_str(&data?)?);
        }
        Ok(out)
    }

    pub fn get_provider(&self, id: &str) -> Result<Option<Provider>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row("SELECT data FROM providers WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub fn upsert_provider(&self, provider: &Provider) -> Result<()> {
        let data = serde_json::to_string(provider)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO providers (id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![provider.id, data, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }
}

fn insert_row(conn: &Connection, entry: &SuppressionEntry) -> rusqlite::Result<usize> {
    let metadata = serde_json::to_string(&entry.metadata)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO suppression_entries ({}) VALUES
         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        ENTRY_COLUMNS
    ))?;
    stmt.execute(params![
        entry.id,
        entry.phone_number.as_str(),
        entry.source.as_str(),
        entry.provider_id,
        entry.reason.as_str(),
        entry.added_at.timestamp_millis(),
        entry.expires_at.map(|t| t.timestamp_millis()),
        entry.source_reference,
        entry.notes,
        metadata,
        entry.added_by,
        entry.updated_at.timestamp_millis(),
        entry.removed_at.map(|t| t.timestamp_millis()),
        entry.removed_by,
        entry.removal_reason,
    ])
}

fn update_row(conn: &Connection, entry: &SuppressionEntry) -> Result<usize> {
    let metadata = serde_json::to_string(&entry.metadata)?;
    let mut stmt = conn.prepare_cached(
        "UPDATE suppression_entries SET
            reason = ?2, expires_at = ?3, source_reference = ?4, notes = ?5, metadata = ?6,
            updated_at = ?7, removed_at = ?8, removed_by = ?9, removal_reason = ?10
         WHERE id = ?1",
    )?;
    Ok(stmt.execute(params![
        entry.id,
        entry.reason.as_str(),
        entry.expires_at.map(|t| t.timestamp_millis()),
        entry.source_reference,
        entry.notes,
        metadata,
        entry.updated_at.timestamp_millis(),
        entry.removed_at.map(|t| t.timestamp_millis()),
        entry.removed_by,
        entry.removal_reason,
    ])?)
}

/// Rows decode in two steps: rusqlite pulls the raw columns, then the
/// domain types are validated. A row that no longer parses is a storage
/// error rather than a panic.
fn read_entry(row: &Row<'_>) -> rusqlite::Result<Result<SuppressionEntry>> {
    let id: String = row.get(0)?;
    let phone: String = row.get(1)?;
    let source: String = row.get(2)?;
    let provider_id: String = row.get(3)?;
    let reason: String = row.get(4)?;
    let added_at: i64 = row.get(5)?;
    let expires_at: Option<i64> = row.get(6)?;
    let source_reference: Option<String> = row.get(7)?;
    let notes: String = row.get(8)?;
    let metadata: String = row.get(9)?;
    let added_by: String = row.get(10)?;
    let updated_at: i64 = row.get(11)?;
    let removed_at: Option<i64> = row.get(12)?;
    let removed_by: Option<String> = row.get(13)?;
    let removal_reason: Option<String> = row.get(14)?;

    Ok((|| -> Result<SuppressionEntry> {
        Ok(SuppressionEntry {
            phone_number: PhoneNumber::parse(&phone)
                .map_err(|e| Error::storage(format!("entry {}: {}", id, e)))?,
            source: source.parse::<ListSource>().map_err(Error::storage)?,
            provider_id,
            reason: reason.parse().map_err(Error::storage)?,
            added_at: from_millis(added_at)?,
            expires_at: expires_at.map(from_millis).transpose()?,
            source_reference,
            notes,
            metadata: serde_json::from_str::<Metadata>(&metadata)?,
            added_by,
            updated_at: from_millis(updated_at)?,
            removed_at: removed_at.map(from_millis).transpose()?,
            removed_by,
            removal_reason,
            id,
        })
    })())
}

fn collect_rows<I>(rows: I) -> Result<Vec<SuppressionEntry>>
where
    I: Iterator<Item = rusqlite::Result<Result<SuppressionEntry>>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::storage(format!("invalid timestamp {}", ms)))
}
