//! Result store.
//!
//! Durable keyed storage for named candidate results, the bounded comparison
//! history, and the current/previous working slots. Each logical collection
//! is serialized whole as one JSON value under its string key; the in-memory
//! mirror is the source of truth, so a read immediately after a write always
//! observes the write. One lock covers mutation and persistence, which keeps
//! concurrent save/delete application in issuance order.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, warn};

use crate::models::{MethodType, OptimizationOutcome, SavedResult, StructureResult};

/// Hard cap on the rolling comparison history.
pub const HISTORY_CAP: usize = 5;
/// Maximum number of simultaneously selected comparison candidates.
pub const SELECTION_CAP: usize = 3;

const KEY_CURRENT: &str = "calculationResults";
const KEY_PREVIOUS: &str = "previousCalculationResults";
const KEY_OPTIMIZATION: &str = "optimizationResults";
const KEY_HISTORY: &str = "multipleComparisonResults";
const KEY_SAVED: &str = "savedResults";

/// Reference to one comparison candidate: a saved result by id, or one of
/// the working slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultRef {
    Saved(String),
    Current,
    Previous,
}

pub struct ResultStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    conn: Connection,
    saved: Vec<SavedResult>,
    history: VecDeque<SavedResult>,
    current: Option<StructureResult>,
    previous: Option<StructureResult>,
    optimization: Option<OptimizationOutcome>,
    selection: Vec<ResultRef>,
}

impl ResultStore {
    /// Open (or create) the store at the given path and load every
    /// collection. Unreadable values are treated as empty, never as errors.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open result store database")?;
        Self::from_connection(conn)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to initialize result store schema")?;

        let saved: Vec<SavedResult> = load_or_empty(&conn, KEY_SAVED)?.unwrap_or_default();
        let history: VecDeque<SavedResult> = load_or_empty(&conn, KEY_HISTORY)?.unwrap_or_default();
        let current: Option<StructureResult> = load_or_empty(&conn, KEY_CURRENT)?.flatten();
        let previous: Option<StructureResult> = load_or_empty(&conn, KEY_PREVIOUS)?.flatten();
        let optimization: Option<OptimizationOutcome> =
            load_or_empty(&conn, KEY_OPTIMIZATION)?.flatten();

        debug!(
            saved = saved.len(),
            history = history.len(),
            "Result store loaded"
        );

        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                saved,
                history,
                current,
                previous,
                optimization,
                selection: Vec::new(),
            }),
        })
    }

    /// Save a payload as a named result. Appends to the named list and
    /// upserts the bounded comparison history, then persists both
    /// collections before returning the new id.
    pub fn save(
        &self,
        structure: StructureResult,
        name: String,
        method_type: MethodType,
    ) -> Result<String> {
        let entry = SavedResult::new(name, method_type, structure);
        let id = entry.id.clone();

        let mut inner = self.inner.lock();
        inner.saved.push(entry.clone());
        inner.upsert_history(entry);
        persist(&inner.conn, KEY_SAVED, &inner.saved)?;
        persist(&inner.conn, KEY_HISTORY, &inner.history)?;

        debug!(id = %id, "Saved result");
        Ok(id)
    }

    /// Record a run in the bounded comparison history without naming it.
    /// Used for working results that were never explicitly saved.
    pub fn record_comparison_entry(
        &self,
        structure: StructureResult,
        label: String,
        method_type: MethodType,
    ) -> Result<String> {
        let entry = SavedResult::new(label, method_type, structure);
        let id = entry.id.clone();

        let mut inner = self.inner.lock();
        inner.upsert_history(entry);
        persist(&inner.conn, KEY_HISTORY, &inner.history)?;
        Ok(id)
    }

    /// Delete a saved result by id. A selection entry referencing it is
    /// repaired to the current working slot, never left dangling.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();

        let before = inner.saved.len();
        inner.saved.retain(|r| r.id != id);
        let removed = inner.saved.len() != before;
        inner.history.retain(|r| r.id != id);

        if let Some(pos) = inner
            .selection
            .iter()
            .position(|r| matches!(r, ResultRef::Saved(sel) if sel == id))
        {
            if inner.selection.contains(&ResultRef::Current) {
                inner.selection.remove(pos);
            } else {
                inner.selection[pos] = ResultRef::Current;
            }
        }

        persist(&inner.conn, KEY_SAVED, &inner.saved)?;
        persist(&inner.conn, KEY_HISTORY, &inner.history)?;

        debug!(id, removed, "Deleted result");
        Ok(removed)
    }

    /// Named results in insertion order.
    pub fn list(&self) -> Vec<SavedResult> {
        self.inner.lock().saved.clone()
    }

    pub fn get(&self, id: &str) -> Option<SavedResult> {
        self.inner.lock().saved.iter().find(|r| r.id == id).cloned()
    }

    /// Bounded comparison history, oldest first.
    pub fn history(&self) -> Vec<SavedResult> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Shift current into previous, then install the new calculation result.
    /// This is the only mutation path for the working slots.
    pub fn advance_current(&self, structure: StructureResult) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.previous = inner.current.take();
        inner.current = Some(structure);
        persist(&inner.conn, KEY_PREVIOUS, &inner.previous)?;
        persist(&inner.conn, KEY_CURRENT, &inner.current)?;
        Ok(())
    }

    pub fn current(&self) -> Option<StructureResult> {
        self.inner.lock().current.clone()
    }

    pub fn previous(&self) -> Option<StructureResult> {
        self.inner.lock().previous.clone()
    }

    pub fn set_optimization(&self, outcome: OptimizationOutcome) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.optimization = Some(outcome);
        persist(&inner.conn, KEY_OPTIMIZATION, &inner.optimization)?;
        Ok(())
    }

    pub fn optimization(&self) -> Option<OptimizationOutcome> {
        self.inner.lock().optimization.clone()
    }

    /// Add a candidate to the active comparison selection. Re-selecting an
    /// already selected candidate is a no-op; a fourth selection evicts the
    /// oldest entry.
    pub fn select(&self, candidate: ResultRef) {
        let mut inner = self.inner.lock();
        if inner.selection.contains(&candidate) {
            return;
        }
        inner.selection.push(candidate);
        if inner.selection.len() > SELECTION_CAP {
            inner.selection.remove(0);
        }
    }

    pub fn clear_selection(&self) {
        self.inner.lock().selection.clear();
    }

    pub fn selection(&self) -> Vec<ResultRef> {
        self.inner.lock().selection.clone()
    }
}

impl StoreInner {
    /// Bounded-history insert: an entry of the same category replaces the
    /// existing one in place; otherwise the oldest entry is evicted once the
    /// cap is reached.
    fn upsert_history(&mut self, entry: SavedResult) {
        if let Some(pos) = self
            .history
            .iter()
            .position(|e| e.method_type == entry.method_type)
        {
            self.history[pos] = entry;
            return;
        }
        if self.history.len() >= HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }
}

fn persist<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value).context("Failed to serialize collection")?;
    conn.execute(
        "INSERT INTO collections (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, json],
    )
    .with_context(|| format!("Failed to persist collection {key}"))?;
    Ok(())
}

/// Load one collection. An absent key is a valid empty state; a value that
/// fails to deserialize is logged and treated as empty rather than raised.
fn load_or_empty<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT value FROM collections WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to read collection")?;

    let Some(json) = json else {
        return Ok(None);
    };

    match serde_json::from_str(&json) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, "Stored collection unreadable, starting empty: {e}");
            Ok(None)
        }
    }
}
