use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::models::*;
use crate::flow::PhaseDef;

/// Async-safe handle to the record store.
///
/// Wraps `StoreDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StoreDb>>,
}

impl DbHandle {
    pub fn new(db: StoreDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StoreDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("store task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup seeding and tests;
    /// must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StoreDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))
    }
}

/// Insert parameters for a material request.
#[derive(Debug, Clone, Default)]
pub struct NewMaterialRequest {
    pub site_id: i64,
    pub lot_id: Option<i64>,
    pub material: String,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub urgency: Urgency,
    pub notes: String,
    pub source_message_id: Option<i64>,
}

pub struct StoreDb {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_col<T>(s: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

impl StoreDb {
    /// Open (or create) the store at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sites (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    org_id INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phases (
                    ordinal INTEGER PRIMARY KEY,
                    phase_id TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_id INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                    number TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'not_started',
                    current_phase INTEGER NOT NULL DEFAULT 1,
                    progress_percentage INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    UNIQUE(site_id, number)
                );

                CREATE TABLE IF NOT EXISTS blocking_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lot_id INTEGER NOT NULL REFERENCES lots(id) ON DELETE CASCADE,
                    phase_ordinal INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    open INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    resolved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS gate_checks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lot_id INTEGER NOT NULL REFERENCES lots(id) ON DELETE CASCADE,
                    transition_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'not_started',
                    updated_at TEXT NOT NULL,
                    UNIQUE(lot_id, transition_id)
                );

                CREATE TABLE IF NOT EXISTS timeline_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_id INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                    lot_id INTEGER,
                    sender_id INTEGER NOT NULL,
                    sender_role TEXT NOT NULL,
                    sender_name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    ai_interpretation TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS material_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_id INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                    lot_id INTEGER,
                    material TEXT NOT NULL,
                    quantity REAL,
                    unit TEXT,
                    urgency TEXT NOT NULL DEFAULT 'normal',
                    status TEXT NOT NULL DEFAULT 'pending',
                    notes TEXT NOT NULL DEFAULT '',
                    source_message_id INTEGER UNIQUE,
                    requested_at TEXT NOT NULL,
                    acknowledged_at TEXT,
                    in_transit_at TEXT,
                    delivered_at TEXT,
                    cancelled_at TEXT
                );

                CREATE TABLE IF NOT EXISTS devices (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    app_name TEXT NOT NULL,
                    push_token TEXT,
                    push_enabled INTEGER NOT NULL DEFAULT 1,
                    last_active_at TEXT NOT NULL,
                    UNIQUE(user_id, app_name)
                );

                CREATE TABLE IF NOT EXISTS site_assignments (
                    site_id INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    UNIQUE(site_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS org_memberships (
                    org_id INTEGER NOT NULL,
                    user_id INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    UNIQUE(org_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS offline_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    op_id TEXT NOT NULL UNIQUE,
                    payload TEXT NOT NULL,
                    captured_at TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    quarantined INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS applied_ops (
                    op_id TEXT PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_lots_site ON lots(site_id);
                CREATE INDEX IF NOT EXISTS idx_blocking_lot ON blocking_items(lot_id, open);
                CREATE INDEX IF NOT EXISTS idx_gates_lot ON gate_checks(lot_id);
                CREATE INDEX IF NOT EXISTS idx_messages_site ON timeline_messages(site_id, id);
                CREATE INDEX IF NOT EXISTS idx_materials_site ON material_requests(site_id);
                CREATE INDEX IF NOT EXISTS idx_assignments_site ON site_assignments(site_id, active);
                CREATE INDEX IF NOT EXISTS idx_memberships_org ON org_memberships(org_id, role);
                CREATE INDEX IF NOT EXISTS idx_queue_pending ON offline_queue(quarantined, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Run `f` inside a transaction that first claims `op_id` in the
    /// applied-op ledger. Returns false without calling `f` when the key was
    /// already claimed, so a replayed write applies nothing twice.
    pub fn run_idempotent<F>(&self, op_id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let claimed = tx.execute(
            "INSERT OR IGNORE INTO applied_ops (op_id, applied_at) VALUES (?1, ?2)",
            params![op_id, now()],
        )?;
        if claimed == 0 {
            return Ok(false);
        }
        f(self)?;
        tx.commit()?;
        Ok(true)
    }

    // ── Reference data ───────────────────────────────────────────────

    pub fn seed_phases(&self, catalog: &[PhaseDef]) -> Result<()> {
        for phase in catalog {
            self.conn.execute(
                "INSERT OR IGNORE INTO phases (ordinal, phase_id, name) VALUES (?1, ?2, ?3)",
                params![phase.ordinal, phase.id, phase.name],
            )?;
        }
        Ok(())
    }

    // ── Sites and lots ───────────────────────────────────────────────

    pub fn insert_site(&self, name: &str, org_id: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sites (name, org_id, created_at) VALUES (?1, ?2, ?3)",
            params![name, org_id, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_site(&self, id: i64) -> Result<Option<Site>> {
        self.conn
            .query_row(
                "SELECT id, name, org_id, created_at FROM sites WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Site {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        org_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to load site")
    }

    pub fn site_exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM sites WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_lot(&self, site_id: i64, number: &str, current_phase: u32) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO lots (site_id, number, status, current_phase, progress_percentage, created_at)
             VALUES (?1, ?2, 'not_started', ?3, 0, ?4)",
            params![site_id, number, current_phase, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_lot(&self, id: i64) -> Result<Option<Lot>> {
        self.conn
            .query_row(
                "SELECT id, site_id, number, status, current_phase, progress_percentage, created_at
                 FROM lots WHERE id = ?1",
                params![id],
                lot_from_row,
            )
            .optional()
            .context("Failed to load lot")
    }

    /// Humans refer to lots by number, not row id.
    pub fn find_lot_by_number(&self, site_id: i64, number: &str) -> Result<Option<Lot>> {
        self.conn
            .query_row(
                "SELECT id, site_id, number, status, current_phase, progress_percentage, created_at
                 FROM lots WHERE site_id = ?1 AND number = ?2",
                params![site_id, number],
                lot_from_row,
            )
            .optional()
            .context("Failed to look up lot by number")
    }

    /// Lots still in progress on a site, bounded for prompt-context assembly.
    pub fn active_lots_for_site(&self, site_id: i64, limit: usize) -> Result<Vec<Lot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, site_id, number, status, current_phase, progress_percentage, created_at
             FROM lots WHERE site_id = ?1 AND status != 'completed'
             ORDER BY number LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![site_id, limit as i64], lot_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list active lots")
    }

    /// Conditional phase advance keyed on the previously-read ordinal.
    /// Returns false when another writer moved the lot first.
    pub fn advance_lot_phase(
        &self,
        lot_id: i64,
        expected_phase: u32,
        target_phase: u32,
        progress: u8,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE lots SET current_phase = ?1, progress_percentage = ?2,
                    status = CASE WHEN status = 'not_started' THEN 'in_progress' ELSE status END
             WHERE id = ?3 AND current_phase = ?4",
            params![target_phase, progress, lot_id, expected_phase],
        )?;
        Ok(changed == 1)
    }

    pub fn set_lot_status(&self, lot_id: i64, status: LotStatus) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE lots SET status = ?1 WHERE id = ?2",
            params![status.as_str(), lot_id],
        )?;
        Ok(changed == 1)
    }

    // ── Blocking items and gate checks ───────────────────────────────

    pub fn insert_blocking_item(
        &self,
        lot_id: i64,
        phase_ordinal: u32,
        title: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO blocking_items (lot_id, phase_ordinal, title, open, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![lot_id, phase_ordinal, title, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn close_blocking_item(&self, item_id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE blocking_items SET open = 0, resolved_at = ?1 WHERE id = ?2 AND open = 1",
            params![now(), item_id],
        )?;
        Ok(changed == 1)
    }

    pub fn blocking_item_exists(&self, item_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM blocking_items WHERE id = ?1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Open blocking-item counts grouped by phase ordinal.
    pub fn open_blocking_counts(&self, lot_id: i64) -> Result<Vec<(u32, u32)>> {
        let mut stmt = self.conn.prepare(
            "SELECT phase_ordinal, COUNT(*) FROM blocking_items
             WHERE lot_id = ?1 AND open = 1 GROUP BY phase_ordinal",
        )?;
        let rows = stmt.query_map(params![lot_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to count blocking items")
    }

    pub fn upsert_gate_check(
        &self,
        lot_id: i64,
        transition_id: &str,
        status: GateStatus,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO gate_checks (lot_id, transition_id, status, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lot_id, transition_id)
             DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
            params![lot_id, transition_id, status.as_str(), now()],
        )?;
        Ok(())
    }

    pub fn gate_checks_for_lot(&self, lot_id: i64) -> Result<Vec<GateCheck>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, lot_id, transition_id, status, updated_at
             FROM gate_checks WHERE lot_id = ?1",
        )?;
        let rows = stmt.query_map(params![lot_id], |row| {
            Ok(GateCheck {
                id: row.get(0)?,
                lot_id: row.get(1)?,
                transition_id: row.get(2)?,
                status: parse_col(row.get::<_, String>(3)?)?,
                updated_at: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load gate checks")
    }

    // ── Timeline messages ────────────────────────────────────────────

    pub fn insert_message(
        &self,
        site_id: i64,
        lot_id: Option<i64>,
        sender: &Sender,
        content: &str,
        attachments: &[String],
    ) -> Result<i64> {
        let attachments_json =
            serde_json::to_string(attachments).context("Failed to encode attachments")?;
        self.conn.execute(
            "INSERT INTO timeline_messages
                 (site_id, lot_id, sender_id, sender_role, sender_name, content, attachments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                site_id,
                lot_id,
                sender.user_id,
                sender.role.as_str(),
                sender.display_name,
                content,
                attachments_json,
                now()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_message(&self, id: i64) -> Result<Option<TimelineMessage>> {
        self.conn
            .query_row(
                "SELECT id, site_id, lot_id, sender_id, sender_role, sender_name,
                        content, attachments, ai_interpretation, created_at
                 FROM timeline_messages WHERE id = ?1",
                params![id],
                message_from_row,
            )
            .optional()
            .context("Failed to load message")
    }

    /// Replaces any previous interpretation on the message.
    pub fn attach_interpretation(&self, message_id: i64, interpretation: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE timeline_messages SET ai_interpretation = ?1 WHERE id = ?2",
            params![interpretation, message_id],
        )?;
        Ok(changed == 1)
    }

    /// Most recent messages in persisted (ascending) order.
    pub fn recent_messages(
        &self,
        site_id: i64,
        lot_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TimelineMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, site_id, lot_id, sender_id, sender_role, sender_name,
                    content, attachments, ai_interpretation, created_at
             FROM timeline_messages
             WHERE site_id = ?1 AND (?2 IS NULL OR lot_id = ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![site_id, lot_id, limit as i64], message_from_row)?;
        let mut messages = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load messages")?;
        messages.reverse();
        Ok(messages)
    }

    // ── Material requests ────────────────────────────────────────────

    pub fn insert_material_request(&self, req: &NewMaterialRequest) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO material_requests
                 (site_id, lot_id, material, quantity, unit, urgency, status, notes,
                  source_message_id, requested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9)",
            params![
                req.site_id,
                req.lot_id,
                req.material,
                req.quantity,
                req.unit,
                req.urgency.as_str(),
                req.notes,
                req.source_message_id,
                now()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The request previously extracted from a message, if one exists.
    pub fn material_request_for_message(&self, message_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM material_requests WHERE source_message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up material request by message")
    }

    pub fn get_material_request(&self, id: i64) -> Result<Option<MaterialRequest>> {
        self.conn
            .query_row(
                "SELECT id, site_id, lot_id, material, quantity, unit, urgency, status, notes,
                        source_message_id, requested_at, acknowledged_at, in_transit_at,
                        delivered_at, cancelled_at
                 FROM material_requests WHERE id = ?1",
                params![id],
                material_from_row,
            )
            .optional()
            .context("Failed to load material request")
    }

    pub fn material_requests_for_site(&self, site_id: i64) -> Result<Vec<MaterialRequest>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, site_id, lot_id, material, quantity, unit, urgency, status, notes,
                    source_message_id, requested_at, acknowledged_at, in_transit_at,
                    delivered_at, cancelled_at
             FROM material_requests WHERE site_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![site_id], material_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list material requests")
    }

    /// Apply a lifecycle transition, stamping its timestamp column.
    /// Rejects regressions and transitions out of a terminal state.
    pub fn update_material_status(&self, id: i64, to: MaterialRequestStatus) -> Result<()> {
        let current = self
            .get_material_request(id)?
            .with_context(|| format!("material request {} not found", id))?;
        if !current.status.can_transition_to(to) {
            anyhow::bail!(
                "invalid material request transition {} -> {}",
                current.status.as_str(),
                to.as_str()
            );
        }
        let stamp_column = match to {
            MaterialRequestStatus::Acknowledged => "acknowledged_at",
            MaterialRequestStatus::InTransit => "in_transit_at",
            MaterialRequestStatus::Delivered => "delivered_at",
            MaterialRequestStatus::Cancelled => "cancelled_at",
            MaterialRequestStatus::Pending => "requested_at",
        };
        let sql = format!(
            "UPDATE material_requests SET status = ?1, {} = ?2 WHERE id = ?3",
            stamp_column
        );
        self.conn.execute(&sql, params![to.as_str(), now(), id])?;
        Ok(())
    }

    // ── Devices and recipients ───────────────────────────────────────

    /// At most one row per (user, app); registration refreshes the token.
    pub fn upsert_device(
        &self,
        user_id: i64,
        app_name: &str,
        push_token: Option<&str>,
        push_enabled: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO devices (user_id, app_name, push_token, push_enabled, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, app_name)
             DO UPDATE SET push_token = excluded.push_token,
                           push_enabled = excluded.push_enabled,
                           last_active_at = excluded.last_active_at",
            params![user_id, app_name, push_token, push_enabled, now()],
        )?;
        Ok(())
    }

    /// Push-enabled devices with a token, for the given users and apps.
    pub fn devices_for_users(&self, user_ids: &[i64], app_names: &[&str]) -> Result<Vec<Device>> {
        if user_ids.is_empty() || app_names.is_empty() {
            return Ok(Vec::new());
        }
        let user_marks = vec!["?"; user_ids.len()].join(",");
        let app_marks = vec!["?"; app_names.len()].join(",");
        let sql = format!(
            "SELECT id, user_id, app_name, push_token, push_enabled, last_active_at
             FROM devices
             WHERE push_enabled = 1 AND push_token IS NOT NULL
               AND user_id IN ({}) AND app_name IN ({})
             ORDER BY id",
            user_marks, app_marks
        );
        let mut values: Vec<Value> = user_ids.iter().map(|id| Value::Integer(*id)).collect();
        values.extend(app_names.iter().map(|a| Value::Text((*a).to_string())));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(Device {
                id: row.get(0)?,
                user_id: row.get(1)?,
                app_name: row.get(2)?,
                push_token: row.get(3)?,
                push_enabled: row.get(4)?,
                last_active_at: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load devices")
    }

    pub fn upsert_site_assignment(&self, site_id: i64, user_id: i64, active: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO site_assignments (site_id, user_id, active) VALUES (?1, ?2, ?3)
             ON CONFLICT(site_id, user_id) DO UPDATE SET active = excluded.active",
            params![site_id, user_id, active],
        )?;
        Ok(())
    }

    pub fn upsert_org_membership(&self, org_id: i64, user_id: i64, role: Role) -> Result<()> {
        self.conn.execute(
            "INSERT INTO org_memberships (org_id, user_id, role) VALUES (?1, ?2, ?3)
             ON CONFLICT(org_id, user_id) DO UPDATE SET role = excluded.role",
            params![org_id, user_id, role.as_str()],
        )?;
        Ok(())
    }

    /// Users actively assigned to a site (operator recipients).
    pub fn operator_user_ids(&self, site_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM site_assignments WHERE site_id = ?1 AND active = 1")?;
        let rows = stmt.query_map(params![site_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load site assignments")
    }

    /// Organization members holding a role (monitor/worker recipients).
    pub fn member_user_ids(&self, org_id: i64, role: Role) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM org_memberships WHERE org_id = ?1 AND role = ?2")?;
        let rows = stmt.query_map(params![org_id, role.as_str()], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load org memberships")
    }

    // ── Offline queue ────────────────────────────────────────────────

    pub fn enqueue_offline_op(&self, op_id: &str, payload: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO offline_queue (op_id, payload, captured_at) VALUES (?1, ?2, ?3)",
            params![op_id, payload, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Queue rows in captured order. Quarantined rows are excluded unless
    /// asked for explicitly.
    pub fn queue_items(&self, quarantined: bool) -> Result<Vec<(i64, String, String, String, u32)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, op_id, payload, captured_at, attempts
             FROM offline_queue WHERE quarantined = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![quarantined], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load offline queue")
    }

    pub fn delete_queue_item(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Bump the attempt counter and return the new total.
    pub fn record_queue_attempt(&self, id: i64) -> Result<u32> {
        self.conn.execute(
            "UPDATE offline_queue SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        let attempts: u32 = self.conn.query_row(
            "SELECT attempts FROM offline_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn quarantine_queue_item(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE offline_queue SET quarantined = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

fn lot_from_row(row: &Row<'_>) -> rusqlite::Result<Lot> {
    Ok(Lot {
        id: row.get(0)?,
        site_id: row.get(1)?,
        number: row.get(2)?,
        status: parse_col(row.get::<_, String>(3)?)?,
        current_phase: row.get(4)?,
        progress_percentage: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<TimelineMessage> {
    let attachments_json: String = row.get(7)?;
    let attachments = serde_json::from_str(&attachments_json).unwrap_or_default();
    Ok(TimelineMessage {
        id: row.get(0)?,
        site_id: row.get(1)?,
        lot_id: row.get(2)?,
        sender: Sender {
            user_id: row.get(3)?,
            role: parse_col(row.get::<_, String>(4)?)?,
            display_name: row.get(5)?,
        },
        content: row.get(6)?,
        attachments,
        ai_interpretation: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn material_from_row(row: &Row<'_>) -> rusqlite::Result<MaterialRequest> {
    Ok(MaterialRequest {
        id: row.get(0)?,
        site_id: row.get(1)?,
        lot_id: row.get(2)?,
        material: row.get(3)?,
        quantity: row.get(4)?,
        unit: row.get(5)?,
        urgency: parse_col(row.get::<_, String>(6)?)?,
        status: parse_col(row.get::<_, String>(7)?)?,
        notes: row.get(8)?,
        source_message_id: row.get(9)?,
        requested_at: row.get(10)?,
        acknowledged_at: row.get(11)?,
        in_transit_at: row.get(12)?,
        delivered_at: row.get(13)?,
        cancelled_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow;

    fn test_db() -> StoreDb {
        let db = StoreDb::new_in_memory().unwrap();
        db.seed_phases(&flow::PHASES).unwrap();
        db
    }

    fn sender() -> Sender {
        Sender {
            user_id: 7,
            role: Role::Worker,
            display_name: "Dana".to_string(),
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = test_db();
        db.run_migrations().unwrap();
    }

    #[test]
    fn lot_lookup_by_number_is_site_scoped() {
        let db = test_db();
        let site_a = db.insert_site("North Ridge", 1).unwrap();
        let site_b = db.insert_site("South Ridge", 1).unwrap();
        db.insert_lot(site_a, "12", 1).unwrap();
        let id_b = db.insert_lot(site_b, "12", 3).unwrap();

        let found = db.find_lot_by_number(site_b, "12").unwrap().unwrap();
        assert_eq!(found.id, id_b);
        assert_eq!(found.current_phase, 3);
        assert!(db.find_lot_by_number(site_b, "99").unwrap().is_none());
    }

    #[test]
    fn advance_is_conditional_on_expected_phase() {
        let db = test_db();
        let site = db.insert_site("North Ridge", 1).unwrap();
        let lot = db.insert_lot(site, "12", 2).unwrap();

        assert!(db.advance_lot_phase(lot, 2, 3, 33).unwrap());
        // A second writer that read phase 2 loses the race.
        assert!(!db.advance_lot_phase(lot, 2, 3, 33).unwrap());

        let lot = db.get_lot(lot).unwrap().unwrap();
        assert_eq!(lot.current_phase, 3);
        assert_eq!(lot.status, LotStatus::InProgress);
    }

    #[test]
    fn blocking_counts_round_trip() {
        let db = test_db();
        let site = db.insert_site("North Ridge", 1).unwrap();
        let lot = db.insert_lot(site, "12", 2).unwrap();

        assert!(db.open_blocking_counts(lot).unwrap().is_empty());
        let item = db.insert_blocking_item(lot, 2, "missing anchor bolts").unwrap();
        assert_eq!(db.open_blocking_counts(lot).unwrap(), vec![(2, 1)]);
        assert!(db.close_blocking_item(item).unwrap());
        assert!(db.open_blocking_counts(lot).unwrap().is_empty());
        // Closing twice is a no-op.
        assert!(!db.close_blocking_item(item).unwrap());
    }

    #[test]
    fn gate_check_upsert_replaces_status() {
        let db = test_db();
        let site = db.insert_site("North Ridge", 1).unwrap();
        let lot = db.insert_lot(site, "12", 2).unwrap();

        db.upsert_gate_check(lot, "framing_to_roofing", GateStatus::InProgress)
            .unwrap();
        db.upsert_gate_check(lot, "framing_to_roofing", GateStatus::Passed)
            .unwrap();
        let checks = db.gate_checks_for_lot(lot).unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, GateStatus::Passed);
    }

    #[test]
    fn interpretation_attach_overwrites() {
        let db = test_db();
        let site = db.insert_site("North Ridge", 1).unwrap();
        let id = db
            .insert_message(site, None, &sender(), "need rebar", &[])
            .unwrap();

        assert!(db.attach_interpretation(id, "{\"v\":1}").unwrap());
        assert!(db.attach_interpretation(id, "{\"v\":2}").unwrap());
        let msg = db.get_message(id).unwrap().unwrap();
        assert_eq!(msg.ai_interpretation.as_deref(), Some("{\"v\":2}"));
        assert_eq!(msg.content, "need rebar");
    }

    #[test]
    fn recent_messages_are_bounded_and_ordered() {
        let db = test_db();
        let site = db.insert_site("North Ridge", 1).unwrap();
        for i in 0..5 {
            db.insert_message(site, None, &sender(), &format!("update {}", i), &[])
                .unwrap();
        }
        let recent = db.recent_messages(site, None, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "update 2");
        assert_eq!(recent[2].content, "update 4");
    }

    #[test]
    fn material_transition_stamps_and_rejects_regression() {
        let db = test_db();
        let site = db.insert_site("North Ridge", 1).unwrap();
        let id = db
            .insert_material_request(&NewMaterialRequest {
                site_id: site,
                material: "2x4 lumber".to_string(),
                ..Default::default()
            })
            .unwrap();

        db.update_material_status(id, MaterialRequestStatus::Acknowledged)
            .unwrap();
        db.update_material_status(id, MaterialRequestStatus::Delivered)
            .unwrap();
        let req = db.get_material_request(id).unwrap().unwrap();
        assert_eq!(req.status, MaterialRequestStatus::Delivered);
        assert!(req.acknowledged_at.is_some());
        assert!(req.delivered_at.is_some());
        assert!(req.in_transit_at.is_none());

        let err = db
            .update_material_status(id, MaterialRequestStatus::Pending)
            .unwrap_err();
        assert!(err.to_string().contains("invalid material request transition"));
    }

    #[test]
    fn device_upsert_keeps_one_row_per_user_app() {
        let db = test_db();
        db.upsert_device(7, "field", Some("tok-a"), true).unwrap();
        db.upsert_device(7, "field", Some("tok-b"), true).unwrap();
        db.upsert_device(7, "office", Some("tok-c"), false).unwrap();

        let devices = db.devices_for_users(&[7], &["field", "office"]).unwrap();
        // The office device is push-disabled and filtered out.
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].push_token.as_deref(), Some("tok-b"));
    }

    #[test]
    fn run_idempotent_claims_once() {
        let db = test_db();
        let site = db.insert_site("North Ridge", 1).unwrap();

        let first = db
            .run_idempotent("op-1", |db| {
                db.insert_message(site, None, &sender(), "queued hello", &[])?;
                Ok(())
            })
            .unwrap();
        let second = db
            .run_idempotent("op-1", |db| {
                db.insert_message(site, None, &sender(), "queued hello", &[])?;
                Ok(())
            })
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(db.recent_messages(site, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn run_idempotent_rolls_back_claim_on_failure() {
        let db = test_db();
        let result = db.run_idempotent("op-2", |_| anyhow::bail!("store unavailable"));
        assert!(result.is_err());
        // The claim was rolled back, so a retry applies.
        let site = db.insert_site("North Ridge", 1).unwrap();
        let retried = db
            .run_idempotent("op-2", |db| {
                db.insert_message(site, None, &sender(), "second try", &[])?;
                Ok(())
            })
            .unwrap();
        assert!(retried);
    }
}
