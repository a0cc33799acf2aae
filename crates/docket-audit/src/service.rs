//! The serialized audit ledger.
//!
//! All chain and window mutations happen under a single mutex so leaf order
//! equals acceptance order and roots are never torn. Every mutation persists
//! inside one SQLite transaction before the in-memory state advances
//! (preview, commit, apply). Reads — proof generation, exports — go straight
//! to the database without taking the ledger lock: leaves are append-only,
//! so a read is always a consistent prefix snapshot.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use docket_db::{DbConnection, DbPool};
use docket_types::DecisionLog;

use crate::chain::{hash_entry, verify_full_chain, AuditEntry, AuditEntryType};
use crate::error::AuditError;
use crate::hash::{log_content_hash, GENESIS_HASH};
use crate::pack::{seal_pack, AuditPack, PackRoot, TimeRange};
use crate::window::{compute_root, verify_proof, window_floor, InclusionProof, MerkleWindow};

/// A window closed by rollover, reported for broadcasting.
#[derive(Debug, Clone)]
pub struct FinalizedWindow {
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub merkle_root: String,
    pub hash_count: usize,
}

struct Ledger {
    tail_hash: String,
    open_windows: BTreeMap<i64, MerkleWindow>,
}

/// In-process audit service: content hashing, hash-linked chain, hourly
/// Merkle windows, proofs, and pack export.
pub struct AuditService {
    pool: DbPool,
    window_ms: i64,
    ledger: Mutex<Ledger>,
}

impl AuditService {
    /// Opens the service, restoring the chain tail and any unfinalized
    /// windows from the database.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Integrity`] if a restored window's recomputed
    /// root disagrees with its stored root.
    pub fn open(pool: DbPool, window_ms: i64) -> Result<Self, AuditError> {
        let conn = pool.get().map_err(|e| AuditError::Pool(e.to_string()))?;

        let tail_hash: String = conn
            .query_row(
                "SELECT self_hash FROM audit_entries ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut open_windows = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT window_start_ms, root FROM merkle_windows WHERE finalized = 0",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            for row in rows {
                let (window_start_ms, stored_root) = row?;
                let leaves = load_leaves(&conn, window_start_ms)?;
                let window = MerkleWindow::from_leaves(window_start_ms, window_ms, leaves);
                if window.root != stored_root {
                    return Err(AuditError::Integrity(format!(
                        "window {window_start_ms} root mismatch: stored {stored_root}, recomputed {}",
                        window.root
                    )));
                }
                open_windows.insert(window_start_ms, window);
            }
        }

        tracing::info!(
            windows = open_windows.len(),
            resumed = tail_hash != GENESIS_HASH,
            "audit ledger opened"
        );

        Ok(Self {
            pool,
            window_ms,
            ledger: Mutex::new(Ledger {
                tail_hash,
                open_windows,
            }),
        })
    }

    /// Records an accepted log: chain entry plus a leaf in its hourly window.
    ///
    /// The log's stored content hash is recomputed and must match.
    pub fn record_created(
        &self,
        log: &DecisionLog,
        metadata: Value,
    ) -> Result<AuditEntry, AuditError> {
        let log_hash = log_content_hash(log)?;
        if !log.content_hash.is_empty() && log.content_hash != log_hash {
            return Err(AuditError::Integrity(format!(
                "content hash mismatch for {}: stored {}, recomputed {log_hash}",
                log.log_id(),
                log.content_hash
            )));
        }

        let mut ledger = self.lock_ledger()?;
        let mut conn = self.conn()?;
        let now_ms = Utc::now().timestamp_millis();

        let entry = seal_entry(AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            entry_type: AuditEntryType::LogCreated,
            log_id: Some(log.log_id()),
            log_hash: Some(log_hash.clone()),
            updates: None,
            timestamp: now_ms,
            metadata,
            previous_hash: ledger.tail_hash.clone(),
            self_hash: String::new(),
        })?;

        // Late leaves for a finalized window fold into the current hour.
        let event_window = window_floor(log.timestamp.timestamp_millis(), self.window_ms);
        let target_start = if ledger.open_windows.contains_key(&event_window) {
            event_window
        } else if window_finalized(&conn, event_window)? {
            window_floor(now_ms, self.window_ms)
        } else {
            event_window
        };

        // Preview the window change, commit, then apply.
        let (leaf_index, new_root) = {
            let existing = ledger
                .open_windows
                .get(&target_start)
                .map(|w| w.leaves.as_slice())
                .unwrap_or(&[]);
            let mut leaves = existing.to_vec();
            leaves.push(log_hash.clone());
            (leaves.len() - 1, compute_root(&leaves))
        };

        let tx = conn.transaction()?;
        insert_entry(&tx, &entry)?;
        tx.execute(
            "INSERT INTO merkle_leaves (window_start_ms, leaf_index, leaf_hash)
             VALUES (?1, ?2, ?3)",
            params![target_start, leaf_index as i64, log_hash],
        )?;
        tx.execute(
            "INSERT INTO merkle_windows (window_start_ms, window_end_ms, root, hash_count, finalized)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT (window_start_ms)
             DO UPDATE SET root = excluded.root, hash_count = excluded.hash_count",
            params![
                target_start,
                target_start + self.window_ms,
                new_root,
                (leaf_index + 1) as i64,
            ],
        )?;
        tx.commit()?;

        let window_ms = self.window_ms;
        let window = ledger
            .open_windows
            .entry(target_start)
            .or_insert_with(|| MerkleWindow::new(target_start, window_ms));
        window.leaves.push(log_hash);
        window.root = new_root;
        ledger.tail_hash = entry.self_hash.clone();

        Ok(entry)
    }

    /// Records an applied review update. Updates extend the chain but do not
    /// add window leaves; only creations are folded.
    pub fn record_updated(
        &self,
        log: &DecisionLog,
        updates: Value,
        metadata: Value,
    ) -> Result<AuditEntry, AuditError> {
        let mut ledger = self.lock_ledger()?;
        let conn = self.conn()?;

        let entry = seal_entry(AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            entry_type: AuditEntryType::LogUpdated,
            log_id: Some(log.log_id()),
            log_hash: None,
            updates: Some(updates),
            timestamp: Utc::now().timestamp_millis(),
            metadata,
            previous_hash: ledger.tail_hash.clone(),
            self_hash: String::new(),
        })?;

        insert_entry(&conn, &entry)?;
        ledger.tail_hash = entry.self_hash.clone();

        Ok(entry)
    }

    /// Finalizes every open window whose end has passed.
    pub fn rollover(&self, now_ms: i64) -> Result<Vec<FinalizedWindow>, AuditError> {
        self.finalize_where(|window| window.window_end_ms <= now_ms)
    }

    /// Finalizes every open window regardless of the clock (explicit flush).
    pub fn flush_all(&self) -> Result<Vec<FinalizedWindow>, AuditError> {
        self.finalize_where(|_| true)
    }

    fn finalize_where(
        &self,
        should_close: impl Fn(&MerkleWindow) -> bool,
    ) -> Result<Vec<FinalizedWindow>, AuditError> {
        let mut ledger = self.lock_ledger()?;
        let mut conn = self.conn()?;

        let closing: Vec<i64> = ledger
            .open_windows
            .values()
            .filter(|w| should_close(w))
            .map(|w| w.window_start_ms)
            .collect();

        let mut finalized = Vec::with_capacity(closing.len());
        for window_start_ms in closing {
            let window = &ledger.open_windows[&window_start_ms];
            let summary = FinalizedWindow {
                window_start_ms,
                window_end_ms: window.window_end_ms,
                merkle_root: window.root.clone(),
                hash_count: window.leaves.len(),
            };

            let entry = seal_entry(AuditEntry {
                entry_id: Uuid::new_v4().to_string(),
                entry_type: AuditEntryType::WindowFinalized,
                log_id: None,
                log_hash: None,
                updates: None,
                timestamp: Utc::now().timestamp_millis(),
                metadata: serde_json::json!({
                    "window_start": summary.window_start_ms,
                    "window_end": summary.window_end_ms,
                    "merkle_root": summary.merkle_root,
                    "hash_count": summary.hash_count,
                }),
                previous_hash: ledger.tail_hash.clone(),
                self_hash: String::new(),
            })?;

            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE merkle_windows SET finalized = 1 WHERE window_start_ms = ?1",
                params![window_start_ms],
            )?;
            insert_entry(&tx, &entry)?;
            tx.commit()?;

            ledger.tail_hash = entry.self_hash.clone();
            ledger.open_windows.remove(&window_start_ms);

            tracing::info!(
                window_start_ms,
                hash_count = summary.hash_count,
                root = %summary.merkle_root,
                "finalized merkle window"
            );
            finalized.push(summary);
        }

        Ok(finalized)
    }

    /// Builds the inclusion proof for a log hash within a window.
    ///
    /// Reads a snapshot from the database; does not take the ledger lock.
    pub fn prove_inclusion(
        &self,
        window_start_ms: i64,
        leaf_hash: &str,
    ) -> Result<InclusionProof, AuditError> {
        let conn = self.conn()?;

        let stored_root: String = conn
            .query_row(
                "SELECT root FROM merkle_windows WHERE window_start_ms = ?1",
                params![window_start_ms],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(AuditError::UnknownWindow(window_start_ms))?;

        let leaves = load_leaves(&conn, window_start_ms)?;
        let window = MerkleWindow::from_leaves(window_start_ms, self.window_ms, leaves);
        if window.root != stored_root {
            return Err(AuditError::Integrity(format!(
                "window {window_start_ms} root mismatch: stored {stored_root}, recomputed {}",
                window.root
            )));
        }

        let proof = window.prove(leaf_hash)?;
        debug_assert!(verify_proof(&proof));
        Ok(proof)
    }

    /// The hourly window a log's event time falls into.
    pub fn window_for(&self, ts_ms: i64) -> i64 {
        window_floor(ts_ms, self.window_ms)
    }

    /// Exports the finalized roots and chain entries for `[start, end)`.
    pub fn export_pack(&self, start_ms: i64, end_ms: i64) -> Result<AuditPack, AuditError> {
        let conn = self.conn()?;

        let mut merkle_roots = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT window_start_ms, window_end_ms, root, hash_count, finalized
                 FROM merkle_windows
                 WHERE finalized = 1 AND window_start_ms >= ?1 AND window_start_ms < ?2
                 ORDER BY window_start_ms ASC",
            )?;
            let rows = stmt.query_map(params![start_ms, end_ms], |row| {
                Ok(PackRoot {
                    window_start: row.get(0)?,
                    window_end: row.get(1)?,
                    merkle_root: row.get(2)?,
                    hash_count: row.get(3)?,
                    finalized: row.get::<_, i64>(4)? == 1,
                })
            })?;
            for row in rows {
                merkle_roots.push(row?);
            }
        }

        let mut audit_chain = Vec::new();
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM audit_entries
                 WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2
                 ORDER BY seq ASC",
            ))?;
            let rows = stmt.query_map(params![start_ms, end_ms], row_to_entry)?;
            for row in rows {
                audit_chain.push(row??);
            }
        }

        seal_pack(AuditPack {
            id: Uuid::new_v4().to_string(),
            generated_at: Utc::now().timestamp_millis(),
            time_range: TimeRange {
                start: start_ms,
                end: end_ms,
            },
            merkle_roots,
            audit_chain,
            verification: crate::pack::PackVerification {
                total_entries: 0,
                merkle_roots_count: 0,
                chain_integrity: false,
                pack_hash: String::new(),
            },
        })
    }

    /// Re-verifies the entire persisted chain from genesis.
    ///
    /// Returns the number of entries checked.
    pub fn verify_stored_chain(&self) -> Result<usize, AuditError> {
        let conn = self.conn()?;
        let mut entries = Vec::new();
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM audit_entries ORDER BY seq ASC"
            ))?;
            let rows = stmt.query_map([], row_to_entry)?;
            for row in rows {
                entries.push(row??);
            }
        }

        verify_full_chain(&entries)
            .map_err(|index| AuditError::Integrity(format!("chain broken at entry {index}")))?;
        Ok(entries.len())
    }

    /// Whether a `LOG_CREATED` entry exists for a log.
    ///
    /// Used by the worker to repair redeliveries that persisted the log but
    /// lost the audit call.
    pub fn has_created_entry(&self, log_id: &str) -> Result<bool, AuditError> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM audit_entries
             WHERE log_id = ?1 AND entry_type = 'LOG_CREATED')",
            params![log_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Total number of chain entries, for the metrics endpoint.
    pub fn entry_count(&self) -> Result<i64, AuditError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))?)
    }

    fn lock_ledger(&self) -> Result<std::sync::MutexGuard<'_, Ledger>, AuditError> {
        self.ledger
            .lock()
            .map_err(|_| AuditError::Integrity("audit ledger lock poisoned".into()))
    }

    fn conn(&self) -> Result<DbConnection, AuditError> {
        self.pool.get().map_err(|e| AuditError::Pool(e.to_string()))
    }
}

const ENTRY_COLUMNS: &str = "entry_id, entry_type, log_id, log_hash, updates, timestamp_ms, \
                             metadata, previous_hash, self_hash";

fn seal_entry(mut entry: AuditEntry) -> Result<AuditEntry, AuditError> {
    entry.self_hash = hash_entry(&entry)?;
    Ok(entry)
}

fn insert_entry(conn: &Connection, entry: &AuditEntry) -> Result<(), AuditError> {
    let updates = entry
        .updates
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let metadata = serde_json::to_string(&entry.metadata)?;

    conn.execute(
        "INSERT INTO audit_entries
            (entry_id, entry_type, log_id, log_hash, updates, timestamp_ms, metadata,
             previous_hash, self_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.entry_id,
            entry.entry_type.as_str(),
            entry.log_id,
            entry.log_hash,
            updates,
            entry.timestamp,
            metadata,
            entry.previous_hash,
            entry.self_hash,
        ],
    )?;
    Ok(())
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Result<AuditEntry, AuditError>> {
    let entry_type: String = row.get(1)?;
    let updates: Option<String> = row.get(4)?;
    let metadata: String = row.get(6)?;

    Ok((|| {
        Ok(AuditEntry {
            entry_id: row.get(0)?,
            entry_type: entry_type
                .parse()
                .map_err(AuditError::Integrity)?,
            log_id: row.get(2)?,
            log_hash: row.get(3)?,
            updates: updates.as_deref().map(serde_json::from_str).transpose()?,
            timestamp: row.get(5)?,
            metadata: serde_json::from_str(&metadata)?,
            previous_hash: row.get(7)?,
            self_hash: row.get(8)?,
        })
    })())
}

fn load_leaves(conn: &Connection, window_start_ms: i64) -> Result<Vec<String>, AuditError> {
    let mut stmt = conn.prepare(
        "SELECT leaf_hash FROM merkle_leaves
         WHERE window_start_ms = ?1
         ORDER BY leaf_index ASC",
    )?;
    let rows = stmt.query_map(params![window_start_ms], |row| row.get::<_, String>(0))?;

    let mut leaves = Vec::new();
    for row in rows {
        leaves.push(row?);
    }
    Ok(leaves)
}

fn window_finalized(conn: &Connection, window_start_ms: i64) -> Result<bool, AuditError> {
    let finalized: Option<i64> = conn
        .query_row(
            "SELECT finalized FROM merkle_windows WHERE window_start_ms = ?1",
            params![window_start_ms],
            |row| row.get(0),
        )
        .optional()?;
    Ok(finalized == Some(1))
}
