//! SQLite-backed transactional store.
//!
//! One database file is shared by every executor process; WAL mode plus a
//! busy timeout keep concurrent access workable, and the claim operation runs
//! in an IMMEDIATE transaction so it is the single cross-executor
//! synchronization primitive. All timestamps are bound from Rust as UTC so
//! lexicographic comparison in SQL matches chronological order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde_json::Value;

use crate::error::{OverseerError, Result};
use crate::events::{AgentEvent, EventCounts, EventFilter, EventSeverity, EventType};
use crate::issue::{
    Comment, Dependency, ExecutionAttempt, ExecutionState, ExecutorInstance, Issue,
    IssueExecutionState, IssueFilter, IssueType, IssueUpdate, InstanceStatus, Statistics, Status,
    WorkFilter,
};

const ISSUE_ID_PREFIX: &str = "ov";
const ISSUE_SEQ_KEY: &str = "issue_seq";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS issues (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    design TEXT NOT NULL DEFAULT '',
    acceptance_criteria TEXT NOT NULL DEFAULT '',
    priority INTEGER NOT NULL DEFAULT 2,
    status TEXT NOT NULL DEFAULT 'open'
        CHECK(status IN ('open', 'in_progress', 'blocked', 'closed')),
    issue_type TEXT NOT NULL DEFAULT 'task',
    assignee TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    closed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
CREATE INDEX IF NOT EXISTS idx_issues_priority ON issues(priority);
CREATE INDEX IF NOT EXISTS idx_issues_created ON issues(created_at);

CREATE TABLE IF NOT EXISTS comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id TEXT NOT NULL,
    actor TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_comments_issue ON comments(issue_id);

CREATE TABLE IF NOT EXISTS dependencies (
    issue_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (issue_id, depends_on),
    FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE,
    FOREIGN KEY (depends_on) REFERENCES issues(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON dependencies(depends_on);

CREATE TABLE IF NOT EXISTS labels (
    issue_id TEXT NOT NULL,
    label TEXT NOT NULL,
    PRIMARY KEY (issue_id, label),
    FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS executor_instances (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    pid INTEGER NOT NULL,
    version TEXT NOT NULL,
    started_at TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running'
        CHECK(status IN ('running', 'stopped', 'crashed'))
);
CREATE INDEX IF NOT EXISTS idx_instances_status ON executor_instances(status);
CREATE INDEX IF NOT EXISTS idx_instances_heartbeat ON executor_instances(last_heartbeat);

CREATE TABLE IF NOT EXISTS issue_execution_state (
    issue_id TEXT PRIMARY KEY,
    executor_instance_id TEXT,
    claimed_at TEXT,
    state TEXT NOT NULL DEFAULT 'pending'
        CHECK(state IN ('pending', 'claimed', 'assessing', 'executing',
                        'analyzing', 'gates', 'committing', 'completed', 'failed')),
    checkpoint_data TEXT,
    error_message TEXT,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE,
    FOREIGN KEY (executor_instance_id) REFERENCES executor_instances(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_execution_state ON issue_execution_state(state);
CREATE INDEX IF NOT EXISTS idx_execution_executor ON issue_execution_state(executor_instance_id);

CREATE TABLE IF NOT EXISTS execution_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id TEXT NOT NULL,
    executor_instance_id TEXT,
    attempt_number INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    success INTEGER,
    exit_code INTEGER,
    summary TEXT,
    FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_history_issue ON execution_history(issue_id);

CREATE TABLE IF NOT EXISTS agent_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    issue_id TEXT,
    executor_id TEXT,
    agent_id TEXT,
    type TEXT NOT NULL,
    severity TEXT NOT NULL CHECK(severity IN ('info', 'warning', 'error')),
    message TEXT NOT NULL,
    data TEXT,
    source_line INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_agent_events_issue ON agent_events(issue_id);
CREATE INDEX IF NOT EXISTS idx_agent_events_timestamp ON agent_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_agent_events_type ON agent_events(type);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path` and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // WAL for concurrent executors sharing one database file.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Recover the connection on poisoning; SQLite state is consistent
        // because every compound write runs in a transaction.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- issues ----------------------------------------------------------

    /// Create an issue, assigning a fresh sequential ID when `issue.id` is empty.
    pub fn create_issue(&self, issue: &mut Issue, actor: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if issue.id.is_empty() {
            issue.id = next_issue_id(&tx)?;
        }
        let now = Utc::now();
        issue.created_at = now;
        issue.updated_at = now;

        tx.execute(
            "INSERT INTO issues (id, title, description, design, acceptance_criteria,
                                 priority, status, issue_type, assignee, created_at, updated_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                issue.id,
                issue.title,
                issue.description,
                issue.design,
                issue.acceptance_criteria,
                issue.priority,
                issue.status.as_str(),
                issue.issue_type.as_str(),
                issue.assignee,
                issue.created_at,
                issue.updated_at,
                issue.closed_at,
            ],
        )?;
        add_comment_tx(&tx, &issue.id, actor, "Issue created")?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_issue(&self, id: &str) -> Result<Issue> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1"),
            params![id],
            issue_from_row,
        )
        .optional()?
        .ok_or_else(|| OverseerError::IssueNotFound(id.to_string()))
    }

    pub fn update_issue(&self, id: &str, update: &IssueUpdate, actor: &str) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let mut sets: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(v) = &update.title {
            args.push(Box::new(v.clone()));
            sets.push(format!("title = ?{}", args.len()));
        }
        if let Some(v) = &update.description {
            args.push(Box::new(v.clone()));
            sets.push(format!("description = ?{}", args.len()));
        }
        if let Some(v) = &update.design {
            args.push(Box::new(v.clone()));
            sets.push(format!("design = ?{}", args.len()));
        }
        if let Some(v) = &update.acceptance_criteria {
            args.push(Box::new(v.clone()));
            sets.push(format!("acceptance_criteria = ?{}", args.len()));
        }
        if let Some(v) = update.priority {
            args.push(Box::new(v));
            sets.push(format!("priority = ?{}", args.len()));
        }
        if let Some(v) = update.status {
            args.push(Box::new(v.as_str().to_string()));
            sets.push(format!("status = ?{}", args.len()));
            if v == Status::Closed {
                args.push(Box::new(now));
                sets.push(format!("closed_at = ?{}", args.len()));
            }
        }
        if let Some(v) = update.issue_type {
            args.push(Box::new(v.as_str().to_string()));
            sets.push(format!("issue_type = ?{}", args.len()));
        }
        if let Some(v) = &update.assignee {
            args.push(Box::new(v.clone()));
            sets.push(format!("assignee = ?{}", args.len()));
        }
        args.push(Box::new(now));
        sets.push(format!("updated_at = ?{}", args.len()));
        args.push(Box::new(id.to_string()));

        let sql = format!(
            "UPDATE issues SET {} WHERE id = ?{}",
            sets.join(", "),
            args.len()
        );
        let changed = tx.execute(&sql, params_from_iter(args.iter().map(|a| a.as_ref())))?;
        if changed == 0 {
            return Err(OverseerError::IssueNotFound(id.to_string()));
        }
        add_comment_tx(&tx, id, actor, "Issue updated")?;
        tx.commit()?;
        Ok(())
    }

    pub fn close_issue(&self, id: &str, reason: &str, actor: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let changed = tx.execute(
            "UPDATE issues SET status = 'closed', closed_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(OverseerError::IssueNotFound(id.to_string()));
        }
        add_comment_tx(&tx, id, actor, &format!("Closed: {reason}"))?;
        tx.commit()?;
        Ok(())
    }

    /// Search issues by title/description substring plus structured filters.
    pub fn search_issues(&self, query: &str, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let conn = self.conn();

        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if !query.is_empty() {
            args.push(Box::new(format!("%{query}%")));
            clauses.push(format!(
                "(title LIKE ?{n} OR description LIKE ?{n})",
                n = args.len()
            ));
        }
        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(priority) = filter.priority {
            args.push(Box::new(priority));
            clauses.push(format!("priority = ?{}", args.len()));
        }
        if let Some(assignee) = &filter.assignee {
            args.push(Box::new(assignee.clone()));
            clauses.push(format!("assignee = ?{}", args.len()));
        }
        if let Some(issue_type) = filter.issue_type {
            args.push(Box::new(issue_type.as_str().to_string()));
            clauses.push(format!("issue_type = ?{}", args.len()));
        }
        if let Some(after) = filter.created_after {
            args.push(Box::new(after));
            clauses.push(format!("created_at >= ?{}", args.len()));
        }
        if let Some(label) = &filter.label {
            args.push(Box::new(label.clone()));
            clauses.push(format!(
                "id IN (SELECT issue_id FROM labels WHERE label = ?{})",
                args.len()
            ));
        }

        let mut sql = format!("SELECT {ISSUE_COLUMNS} FROM issues");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            args.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(|a| a.as_ref())),
            issue_from_row,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Ready work: open issues whose dependencies are all closed and which
    /// carry no live claim, highest priority first.
    pub fn get_ready_work(&self, filter: &WorkFilter) -> Result<Vec<Issue>> {
        let conn = self.conn();
        let limit = if filter.limit == 0 { 1 } else { filter.limit };
        let mut stmt = conn.prepare(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues i
             WHERE i.status = 'open'
               AND NOT EXISTS (
                   SELECT 1 FROM dependencies d
                   JOIN issues di ON di.id = d.depends_on
                   WHERE d.issue_id = i.id AND di.status != 'closed')
               AND NOT EXISTS (
                   SELECT 1 FROM issue_execution_state s
                   WHERE s.issue_id = i.id
                     AND s.state NOT IN ('pending', 'completed', 'failed'))
             ORDER BY i.priority ASC, i.created_at ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], issue_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn get_statistics(&self) -> Result<Statistics> {
        let conn = self.conn();
        let mut stats = Statistics::default();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM issues GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            match Status::parse(&status) {
                Some(Status::Open) => stats.open = count,
                Some(Status::InProgress) => stats.in_progress = count,
                Some(Status::Blocked) => stats.blocked = count,
                Some(Status::Closed) => stats.closed = count,
                None => {}
            }
        }
        Ok(stats)
    }

    // ---- comments --------------------------------------------------------

    pub fn add_comment(&self, issue_id: &str, actor: &str, body: &str) -> Result<()> {
        let conn = self.conn();
        ensure_issue_exists(&conn, issue_id)?;
        conn.execute(
            "INSERT INTO comments (issue_id, actor, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![issue_id, actor, body, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get_comments(&self, issue_id: &str, limit: usize) -> Result<Vec<Comment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, issue_id, actor, body, created_at FROM comments
             WHERE issue_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![issue_id, limit as i64], |row| {
            Ok(Comment {
                id: row.get(0)?,
                issue_id: row.get(1)?,
                actor: row.get(2)?,
                body: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ---- dependencies and labels ----------------------------------------

    pub fn add_dependency(&self, dep: &Dependency, _actor: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_issue_exists_tx(&tx, &dep.issue_id)?;
        ensure_issue_exists_tx(&tx, &dep.depends_on)?;

        // Walk the dependency graph from `depends_on`; reaching `issue_id`
        // again would close a cycle.
        let mut seen: HashSet<String> = HashSet::new();
        let mut frontier = vec![dep.depends_on.clone()];
        while let Some(current) = frontier.pop() {
            if current == dep.issue_id {
                return Err(OverseerError::DependencyCycle {
                    issue_id: dep.issue_id.clone(),
                    depends_on: dep.depends_on.clone(),
                });
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            let mut stmt =
                tx.prepare("SELECT depends_on FROM dependencies WHERE issue_id = ?1")?;
            let next = stmt
                .query_map(params![current], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            frontier.extend(next);
        }

        tx.execute(
            "INSERT OR IGNORE INTO dependencies (issue_id, depends_on, created_at)
             VALUES (?1, ?2, ?3)",
            params![dep.issue_id, dep.depends_on, Utc::now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_dependency(&self, issue_id: &str, depends_on: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM dependencies WHERE issue_id = ?1 AND depends_on = ?2",
            params![issue_id, depends_on],
        )?;
        Ok(())
    }

    pub fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Issue>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues
             WHERE id IN (SELECT depends_on FROM dependencies WHERE issue_id = ?1)
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![issue_id], issue_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn get_dependents(&self, issue_id: &str) -> Result<Vec<Issue>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues
             WHERE id IN (SELECT issue_id FROM dependencies WHERE depends_on = ?1)
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![issue_id], issue_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn add_label(&self, issue_id: &str, label: &str) -> Result<()> {
        let conn = self.conn();
        ensure_issue_exists(&conn, issue_id)?;
        conn.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
            params![issue_id, label],
        )?;
        Ok(())
    }

    pub fn remove_label(&self, issue_id: &str, label: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM labels WHERE issue_id = ?1 AND label = ?2",
            params![issue_id, label],
        )?;
        Ok(())
    }

    pub fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT label FROM labels WHERE issue_id = ?1 ORDER BY label")?;
        let rows = stmt.query_map(params![issue_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ---- executor instances ----------------------------------------------

    pub fn register_instance(&self, instance: &ExecutorInstance) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO executor_instances (id, hostname, pid, version, started_at, last_heartbeat, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                instance.id,
                instance.hostname,
                instance.pid,
                instance.version,
                instance.started_at,
                instance.last_heartbeat,
                instance.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn update_heartbeat(&self, instance_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE executor_instances SET last_heartbeat = ?1 WHERE id = ?2",
            params![Utc::now(), instance_id],
        )?;
        Ok(())
    }

    pub fn mark_instance_stopped(&self, instance_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE executor_instances SET status = 'stopped', last_heartbeat = ?1 WHERE id = ?2",
            params![Utc::now(), instance_id],
        )?;
        Ok(())
    }

    pub fn get_active_instances(&self) -> Result<Vec<ExecutorInstance>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, hostname, pid, version, started_at, last_heartbeat, status
             FROM executor_instances WHERE status = 'running' ORDER BY started_at",
        )?;
        let rows = stmt.query_map([], instance_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Mark instances with stale heartbeats as crashed and release every
    /// non-terminal claim they hold. Returns the number of instances swept.
    pub fn cleanup_stale_instances(&self, stale_threshold: Duration) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM executor_instances
                 WHERE status = 'running' AND last_heartbeat < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for instance_id in &stale {
            tx.execute(
                "UPDATE executor_instances SET status = 'crashed' WHERE id = ?1",
                params![instance_id],
            )?;

            let held: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT issue_id FROM issue_execution_state
                     WHERE executor_instance_id = ?1
                       AND state NOT IN ('pending', 'completed', 'failed')",
                )?;
                let rows = stmt.query_map(params![instance_id], |row| row.get::<_, String>(0))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            for issue_id in held {
                let reason = format!("reclaimed stale claim from instance {instance_id}");
                release_and_reopen_tx(&tx, &issue_id, &reason)?;
            }
        }

        tx.commit()?;
        Ok(stale.len())
    }

    /// Delete stopped/crashed instance rows older than `older_than`, keeping
    /// the `keep` most recent. `keep == 0` keeps none.
    pub fn delete_old_stopped_instances(&self, older_than: Duration, keep: usize) -> Result<usize> {
        let conn = self.conn();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let deleted = conn.execute(
            "DELETE FROM executor_instances
             WHERE status IN ('stopped', 'crashed')
               AND last_heartbeat < ?1
               AND id NOT IN (
                   SELECT id FROM executor_instances
                   WHERE status IN ('stopped', 'crashed')
                   ORDER BY last_heartbeat DESC
                   LIMIT ?2)",
            params![cutoff, keep as i64],
        )?;
        Ok(deleted)
    }

    // ---- claims and execution state --------------------------------------

    /// Atomically claim an open, unclaimed issue for `instance_id`.
    ///
    /// Verifies the issue is open with no live claim, writes the execution
    /// state row, and flips the issue to in_progress, all in one IMMEDIATE
    /// transaction. A lost race surfaces as [`OverseerError::ClaimRaceLost`],
    /// which the work loop treats as routine.
    pub fn claim_issue(&self, issue_id: &str, instance_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM issues WHERE id = ?1",
                params![issue_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => return Err(OverseerError::IssueNotFound(issue_id.to_string())),
            Some("open") => {}
            Some(_) => {
                return Err(OverseerError::ClaimRaceLost {
                    issue_id: issue_id.to_string(),
                })
            }
        }

        let live: Option<String> = tx
            .query_row(
                "SELECT state FROM issue_execution_state
                 WHERE issue_id = ?1 AND state NOT IN ('pending', 'completed', 'failed')",
                params![issue_id],
                |row| row.get(0),
            )
            .optional()?;
        if live.is_some() {
            return Err(OverseerError::ClaimRaceLost {
                issue_id: issue_id.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO issue_execution_state
                 (issue_id, executor_instance_id, claimed_at, state, error_message, updated_at)
             VALUES (?1, ?2, ?3, 'claimed', NULL, ?3)
             ON CONFLICT(issue_id) DO UPDATE SET
                 executor_instance_id = ?2,
                 claimed_at = ?3,
                 state = 'claimed',
                 error_message = NULL,
                 updated_at = ?3",
            params![issue_id, instance_id, now],
        )?;
        tx.execute(
            "UPDATE issues SET status = 'in_progress', updated_at = ?1 WHERE id = ?2",
            params![now, issue_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_execution_state(&self, issue_id: &str) -> Result<Option<IssueExecutionState>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT issue_id, executor_instance_id, claimed_at, state,
                        checkpoint_data, error_message, updated_at
                 FROM issue_execution_state WHERE issue_id = ?1",
                params![issue_id],
                execution_state_from_row,
            )
            .optional()?)
    }

    pub fn update_execution_state(&self, issue_id: &str, state: ExecutionState) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE issue_execution_state SET state = ?1, updated_at = ?2 WHERE issue_id = ?3",
            params![state.as_str(), Utc::now(), issue_id],
        )?;
        Ok(())
    }

    pub fn save_checkpoint(&self, issue_id: &str, checkpoint: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE issue_execution_state SET checkpoint_data = ?1, updated_at = ?2
             WHERE issue_id = ?3",
            params![checkpoint, Utc::now(), issue_id],
        )?;
        Ok(())
    }

    pub fn get_checkpoint(&self, issue_id: &str) -> Result<Option<String>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT checkpoint_data FROM issue_execution_state WHERE issue_id = ?1",
                params![issue_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    /// Clear the claim, leaving the issue status untouched. Used when the
    /// caller decides the follow-up status itself (e.g. blocking).
    pub fn release_issue(&self, issue_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE issue_execution_state
             SET state = 'failed', executor_instance_id = NULL, updated_at = ?1
             WHERE issue_id = ?2",
            params![Utc::now(), issue_id],
        )?;
        Ok(())
    }

    /// Atomic release + reopen: fail the execution state, clear the claim,
    /// reopen the issue, append a failure attempt with `error_text`.
    pub fn release_and_reopen(&self, issue_id: &str, error_text: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        release_and_reopen_tx(&tx, issue_id, error_text)?;
        tx.commit()?;
        Ok(())
    }

    /// Atomic success path: complete the execution state, close the issue,
    /// append a successful attempt.
    pub fn complete_and_close(
        &self,
        issue_id: &str,
        actor: &str,
        summary: &str,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let instance: Option<String> = tx
            .query_row(
                "SELECT executor_instance_id FROM issue_execution_state WHERE issue_id = ?1",
                params![issue_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        tx.execute(
            "UPDATE issue_execution_state
             SET state = 'completed', executor_instance_id = NULL,
                 error_message = NULL, updated_at = ?1
             WHERE issue_id = ?2",
            params![now, issue_id],
        )?;
        tx.execute(
            "UPDATE issues SET status = 'closed', closed_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, issue_id],
        )?;
        add_comment_tx(&tx, issue_id, actor, &format!("Closed: {summary}"))?;
        append_attempt_tx(&tx, issue_id, instance.as_deref(), Some(true), exit_code, summary)?;
        tx.commit()?;
        Ok(())
    }

    // ---- execution history -----------------------------------------------

    pub fn get_execution_history(&self, issue_id: &str) -> Result<Vec<ExecutionAttempt>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, issue_id, executor_instance_id, attempt_number,
                    started_at, completed_at, success, exit_code, summary
             FROM execution_history WHERE issue_id = ?1
             ORDER BY attempt_number ASC",
        )?;
        let rows = stmt.query_map(params![issue_id], attempt_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn record_attempt(
        &self,
        issue_id: &str,
        instance_id: Option<&str>,
        success: Option<bool>,
        exit_code: Option<i32>,
        summary: &str,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        append_attempt_tx(&tx, issue_id, instance_id, success, exit_code, summary)?;
        tx.commit()?;
        Ok(())
    }

    // ---- agent events ----------------------------------------------------

    pub fn store_agent_event(&self, event: &AgentEvent) -> Result<i64> {
        let conn = self.conn();
        let data = match &event.data {
            Value::Null => None,
            other => Some(serde_json::to_string(other)?),
        };
        conn.execute(
            "INSERT INTO agent_events
                 (timestamp, issue_id, executor_id, agent_id, type, severity, message, data, source_line)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.timestamp,
                event.issue_id,
                event.executor_id,
                event.agent_id,
                event.event_type.as_str(),
                event.severity.as_str(),
                event.message,
                data,
                event.source_line,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_agent_events(&self, filter: &EventFilter) -> Result<Vec<AgentEvent>> {
        let conn = self.conn();
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(issue_id) = &filter.issue_id {
            args.push(Box::new(issue_id.clone()));
            clauses.push(format!("issue_id = ?{}", args.len()));
        }
        if let Some(event_type) = filter.event_type {
            args.push(Box::new(event_type.as_str().to_string()));
            clauses.push(format!("type = ?{}", args.len()));
        }
        if let Some(severity) = filter.severity {
            args.push(Box::new(severity.as_str().to_string()));
            clauses.push(format!("severity = ?{}", args.len()));
        }
        if let Some(after) = filter.after {
            args.push(Box::new(after));
            clauses.push(format!("timestamp >= ?{}", args.len()));
        }
        if let Some(before) = filter.before {
            args.push(Box::new(before));
            clauses.push(format!("timestamp <= ?{}", args.len()));
        }

        let mut sql = String::from(
            "SELECT id, timestamp, issue_id, executor_id, agent_id, type, severity, message, data, source_line
             FROM agent_events",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC");
        if let Some(limit) = filter.limit {
            args.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(|a| a.as_ref())),
            event_from_row,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn get_agent_events_by_issue(&self, issue_id: &str) -> Result<Vec<AgentEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, issue_id, executor_id, agent_id, type, severity, message, data, source_line
             FROM agent_events WHERE issue_id = ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![issue_id], event_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn get_recent_agent_events(&self, limit: usize) -> Result<Vec<AgentEvent>> {
        self.get_agent_events(&EventFilter {
            limit: Some(limit),
            ..Default::default()
        })
    }

    /// Delete events older than `retention_days`, except error-severity
    /// events younger than `critical_days`. Batched; returns rows deleted.
    pub fn cleanup_events_by_age(
        &self,
        retention_days: u32,
        critical_days: u32,
        batch_size: usize,
    ) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let critical_cutoff = Utc::now() - chrono::Duration::days(critical_days as i64);
        let mut total = 0usize;
        loop {
            let deleted = {
                let conn = self.conn();
                conn.execute(
                    "DELETE FROM agent_events WHERE id IN (
                         SELECT id FROM agent_events
                         WHERE (timestamp < ?1 AND severity != 'error')
                            OR timestamp < ?2
                         ORDER BY timestamp ASC LIMIT ?3)",
                    params![cutoff, critical_cutoff, batch_size as i64],
                )?
            };
            total += deleted;
            if deleted < batch_size {
                break;
            }
        }
        Ok(total)
    }

    /// Trim each issue's events down to `per_issue_limit`, oldest first.
    pub fn cleanup_events_by_issue_limit(
        &self,
        per_issue_limit: usize,
        batch_size: usize,
    ) -> Result<usize> {
        let over: Vec<(String, i64)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT issue_id, COUNT(*) FROM agent_events
                 WHERE issue_id IS NOT NULL
                 GROUP BY issue_id HAVING COUNT(*) > ?1",
            )?;
            let rows = stmt.query_map(params![per_issue_limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut total = 0usize;
        for (issue_id, count) in over {
            let mut excess = (count as usize).saturating_sub(per_issue_limit);
            while excess > 0 {
                let chunk = excess.min(batch_size);
                let deleted = {
                    let conn = self.conn();
                    conn.execute(
                        "DELETE FROM agent_events WHERE id IN (
                             SELECT id FROM agent_events WHERE issue_id = ?1
                             ORDER BY timestamp ASC, id ASC LIMIT ?2)",
                        params![issue_id, chunk as i64],
                    )?
                };
                total += deleted;
                if deleted == 0 {
                    break;
                }
                excess -= deleted.min(excess);
            }
        }
        Ok(total)
    }

    /// Delete oldest events globally until the total is at or below `limit`.
    pub fn cleanup_events_by_global_limit(&self, limit: usize, batch_size: usize) -> Result<usize> {
        let mut total = 0usize;
        loop {
            let count: i64 = {
                let conn = self.conn();
                conn.query_row("SELECT COUNT(*) FROM agent_events", [], |row| row.get(0))?
            };
            if count as usize <= limit {
                break;
            }
            let chunk = ((count as usize) - limit).min(batch_size);
            let deleted = {
                let conn = self.conn();
                conn.execute(
                    "DELETE FROM agent_events WHERE id IN (
                         SELECT id FROM agent_events ORDER BY timestamp ASC, id ASC LIMIT ?1)",
                    params![chunk as i64],
                )?
            };
            total += deleted;
            if deleted == 0 {
                break;
            }
        }
        Ok(total)
    }

    pub fn get_event_counts(&self) -> Result<EventCounts> {
        let conn = self.conn();
        let mut counts = EventCounts::default();
        let mut stmt = conn.prepare("SELECT type, COUNT(*) FROM agent_events GROUP BY type")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (event_type, count) = row?;
            counts.total += count;
            counts.by_type.insert(event_type, count);
        }
        Ok(counts)
    }

    /// Storage compaction; run after large deletes when configured.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    // ---- config ----------------------------------------------------------

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }
}

const ISSUE_COLUMNS: &str = "id, title, description, design, acceptance_criteria, priority, \
                             status, issue_type, assignee, created_at, updated_at, closed_at";

fn next_issue_id(tx: &Transaction<'_>) -> Result<String> {
    let current: Option<String> = tx
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![ISSUE_SEQ_KEY],
            |row| row.get(0),
        )
        .optional()?;
    let next = current
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    tx.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = ?2",
        params![ISSUE_SEQ_KEY, next.to_string()],
    )?;
    Ok(format!("{ISSUE_ID_PREFIX}-{next}"))
}

fn ensure_issue_exists(conn: &Connection, issue_id: &str) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM issues WHERE id = ?1",
            params![issue_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(OverseerError::IssueNotFound(issue_id.to_string()));
    }
    Ok(())
}

fn ensure_issue_exists_tx(tx: &Transaction<'_>, issue_id: &str) -> Result<()> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM issues WHERE id = ?1",
            params![issue_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(OverseerError::IssueNotFound(issue_id.to_string()));
    }
    Ok(())
}

fn add_comment_tx(tx: &Transaction<'_>, issue_id: &str, actor: &str, body: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO comments (issue_id, actor, body, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![issue_id, actor, body, Utc::now()],
    )?;
    Ok(())
}

fn append_attempt_tx(
    tx: &Transaction<'_>,
    issue_id: &str,
    instance_id: Option<&str>,
    success: Option<bool>,
    exit_code: Option<i32>,
    summary: &str,
) -> Result<()> {
    let attempt_number: i64 = tx.query_row(
        "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM execution_history WHERE issue_id = ?1",
        params![issue_id],
        |row| row.get(0),
    )?;
    let now = Utc::now();
    tx.execute(
        "INSERT INTO execution_history
             (issue_id, executor_instance_id, attempt_number, started_at, completed_at,
              success, exit_code, summary)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7)",
        params![issue_id, instance_id, attempt_number, now, success, exit_code, summary],
    )?;
    Ok(())
}

fn release_and_reopen_tx(tx: &Transaction<'_>, issue_id: &str, error_text: &str) -> Result<()> {
    let now = Utc::now();
    let instance: Option<String> = tx
        .query_row(
            "SELECT executor_instance_id FROM issue_execution_state WHERE issue_id = ?1",
            params![issue_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    tx.execute(
        "UPDATE issue_execution_state
         SET state = 'failed', executor_instance_id = NULL, error_message = ?1, updated_at = ?2
         WHERE issue_id = ?3",
        params![error_text, now, issue_id],
    )?;
    tx.execute(
        "UPDATE issues SET status = 'open', updated_at = ?1 WHERE id = ?2",
        params![now, issue_id],
    )?;
    append_attempt_tx(tx, issue_id, instance.as_deref(), Some(false), None, error_text)?;
    Ok(())
}

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let status: String = row.get(6)?;
    let issue_type: String = row.get(7)?;
    Ok(Issue {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        design: row.get(3)?,
        acceptance_criteria: row.get(4)?,
        priority: row.get(5)?,
        status: Status::parse(&status).unwrap_or(Status::Open),
        issue_type: IssueType::parse(&issue_type).unwrap_or_default(),
        assignee: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        closed_at: row.get(11)?,
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutorInstance> {
    let status: String = row.get(6)?;
    Ok(ExecutorInstance {
        id: row.get(0)?,
        hostname: row.get(1)?,
        pid: row.get(2)?,
        version: row.get(3)?,
        started_at: row.get(4)?,
        last_heartbeat: row.get(5)?,
        status: InstanceStatus::parse(&status).unwrap_or(InstanceStatus::Crashed),
    })
}

fn execution_state_from_row(row: &Row<'_>) -> rusqlite::Result<IssueExecutionState> {
    let state: String = row.get(3)?;
    Ok(IssueExecutionState {
        issue_id: row.get(0)?,
        executor_instance_id: row.get(1)?,
        claimed_at: row.get(2)?,
        state: ExecutionState::parse(&state).unwrap_or(ExecutionState::Pending),
        checkpoint_data: row.get(4)?,
        error_message: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionAttempt> {
    Ok(ExecutionAttempt {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        executor_instance_id: row.get(2)?,
        attempt_number: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        success: row.get(6)?,
        exit_code: row.get(7)?,
        summary: row.get(8)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AgentEvent> {
    let event_type: String = row.get(5)?;
    let severity: String = row.get(6)?;
    let data: Option<String> = row.get(8)?;
    Ok(AgentEvent {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        issue_id: row.get(2)?,
        executor_id: row.get(3)?,
        agent_id: row.get(4)?,
        event_type: EventType::parse(&event_type).unwrap_or(EventType::Error),
        severity: EventSeverity::parse(&severity).unwrap_or(EventSeverity::Info),
        message: row.get(7)?,
        data: data
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or(Value::Null),
        source_line: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSeverity;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("overseer.db")).unwrap();
        (dir, store)
    }

    fn seed_issue(store: &Store, title: &str) -> Issue {
        let mut issue = Issue::new(title);
        store.create_issue(&mut issue, "test").unwrap();
        issue
    }

    fn seed_instance(store: &Store, id: &str) {
        store
            .register_instance(&ExecutorInstance {
                id: id.to_string(),
                hostname: "host".into(),
                pid: 1,
                version: "0".into(),
                started_at: Utc::now(),
                last_heartbeat: Utc::now(),
                status: InstanceStatus::Running,
            })
            .unwrap();
    }

    #[test]
    fn create_assigns_sequential_ids() {
        let (_dir, store) = test_store();
        let a = seed_issue(&store, "first");
        let b = seed_issue(&store, "second");
        assert_eq!(a.id, "ov-1");
        assert_eq!(b.id, "ov-2");
    }

    #[test]
    fn get_missing_issue_is_not_found() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.get_issue("ov-99"),
            Err(OverseerError::IssueNotFound(_))
        ));
    }

    #[test]
    fn ready_work_excludes_issues_with_open_dependencies() {
        let (_dir, store) = test_store();
        let blocker = seed_issue(&store, "blocker");
        let blocked = seed_issue(&store, "blocked");
        store
            .add_dependency(
                &Dependency {
                    issue_id: blocked.id.clone(),
                    depends_on: blocker.id.clone(),
                },
                "test",
            )
            .unwrap();

        let ready = store.get_ready_work(&WorkFilter { limit: 10 }).unwrap();
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert!(ids.contains(&blocker.id.as_str()));
        assert!(!ids.contains(&blocked.id.as_str()));

        store.close_issue(&blocker.id, "done", "test").unwrap();
        let ready = store.get_ready_work(&WorkFilter { limit: 10 }).unwrap();
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert!(ids.contains(&blocked.id.as_str()));
    }

    #[test]
    fn ready_work_orders_by_priority() {
        let (_dir, store) = test_store();
        let mut low = Issue::new("low priority");
        low.priority = 3;
        store.create_issue(&mut low, "test").unwrap();
        let mut high = Issue::new("high priority");
        high.priority = 0;
        store.create_issue(&mut high, "test").unwrap();

        let ready = store.get_ready_work(&WorkFilter { limit: 1 }).unwrap();
        assert_eq!(ready[0].id, high.id);
    }

    #[test]
    fn dependency_cycles_are_refused() {
        let (_dir, store) = test_store();
        let a = seed_issue(&store, "a");
        let b = seed_issue(&store, "b");
        let c = seed_issue(&store, "c");
        store
            .add_dependency(
                &Dependency {
                    issue_id: a.id.clone(),
                    depends_on: b.id.clone(),
                },
                "test",
            )
            .unwrap();
        store
            .add_dependency(
                &Dependency {
                    issue_id: b.id.clone(),
                    depends_on: c.id.clone(),
                },
                "test",
            )
            .unwrap();
        let err = store
            .add_dependency(
                &Dependency {
                    issue_id: c.id.clone(),
                    depends_on: a.id.clone(),
                },
                "test",
            )
            .unwrap_err();
        assert!(matches!(err, OverseerError::DependencyCycle { .. }));
    }

    #[test]
    fn claim_is_exclusive() {
        let (_dir, store) = test_store();
        let issue = seed_issue(&store, "race target");
        seed_instance(&store, "instance-a");
        seed_instance(&store, "instance-b");

        store.claim_issue(&issue.id, "instance-a").unwrap();
        let err = store.claim_issue(&issue.id, "instance-b").unwrap_err();
        assert!(matches!(err, OverseerError::ClaimRaceLost { .. }));

        let fetched = store.get_issue(&issue.id).unwrap();
        assert_eq!(fetched.status, Status::InProgress);
        let state = store.get_execution_state(&issue.id).unwrap().unwrap();
        assert_eq!(state.state, ExecutionState::Claimed);
        assert_eq!(state.executor_instance_id.as_deref(), Some("instance-a"));
    }

    #[test]
    fn claimed_issue_disappears_from_ready_work() {
        let (_dir, store) = test_store();
        let issue = seed_issue(&store, "claim me");
        seed_instance(&store, "instance-a");
        store.claim_issue(&issue.id, "instance-a").unwrap();
        let ready = store.get_ready_work(&WorkFilter { limit: 10 }).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn release_and_reopen_records_failure_attempt() {
        let (_dir, store) = test_store();
        let issue = seed_issue(&store, "will fail");
        seed_instance(&store, "instance-a");
        store.claim_issue(&issue.id, "instance-a").unwrap();
        store.release_and_reopen(&issue.id, "agent exploded").unwrap();

        let fetched = store.get_issue(&issue.id).unwrap();
        assert_eq!(fetched.status, Status::Open);
        let state = store.get_execution_state(&issue.id).unwrap().unwrap();
        assert_eq!(state.state, ExecutionState::Failed);
        assert!(state.executor_instance_id.is_none());

        let history = store.get_execution_history(&issue.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].success, Some(false));
        assert_eq!(history[0].summary.as_deref(), Some("agent exploded"));
        assert_eq!(history[0].attempt_number, 1);
    }

    #[test]
    fn reclaim_after_release_works() {
        let (_dir, store) = test_store();
        let issue = seed_issue(&store, "retry me");
        seed_instance(&store, "instance-a");
        seed_instance(&store, "instance-b");
        store.claim_issue(&issue.id, "instance-a").unwrap();
        store.release_and_reopen(&issue.id, "boom").unwrap();
        store.claim_issue(&issue.id, "instance-b").unwrap();
        let state = store.get_execution_state(&issue.id).unwrap().unwrap();
        assert_eq!(state.executor_instance_id.as_deref(), Some("instance-b"));
    }

    #[test]
    fn complete_and_close_closes_with_attempt() {
        let (_dir, store) = test_store();
        let issue = seed_issue(&store, "will pass");
        seed_instance(&store, "instance-a");
        store.claim_issue(&issue.id, "instance-a").unwrap();
        store
            .complete_and_close(&issue.id, "instance-a", "all gates green", Some(0))
            .unwrap();

        let fetched = store.get_issue(&issue.id).unwrap();
        assert_eq!(fetched.status, Status::Closed);
        assert!(fetched.closed_at.is_some());
        let history = store.get_execution_history(&issue.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].success, Some(true));
        assert_eq!(history[0].exit_code, Some(0));
    }

    #[test]
    fn stale_instances_are_swept_and_claims_released() {
        let (_dir, store) = test_store();
        let issue = seed_issue(&store, "orphaned work");

        let stale = ExecutorInstance {
            id: "dead-instance".into(),
            hostname: "host".into(),
            pid: 1,
            version: "0".into(),
            started_at: Utc::now() - chrono::Duration::hours(1),
            last_heartbeat: Utc::now() - chrono::Duration::hours(1),
            status: InstanceStatus::Running,
        };
        store.register_instance(&stale).unwrap();
        store.claim_issue(&issue.id, &stale.id).unwrap();

        let swept = store
            .cleanup_stale_instances(Duration::from_secs(300))
            .unwrap();
        assert_eq!(swept, 1);

        let fetched = store.get_issue(&issue.id).unwrap();
        assert_eq!(fetched.status, Status::Open);
        let history = store.get_execution_history(&issue.id).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].summary.as_deref().unwrap().contains("stale"));

        // A live peer can now take the work.
        seed_instance(&store, "live-instance");
        store.claim_issue(&issue.id, "live-instance").unwrap();
    }

    #[test]
    fn fresh_heartbeat_survives_sweep() {
        let (_dir, store) = test_store();
        let live = ExecutorInstance {
            id: "live-instance".into(),
            hostname: "host".into(),
            pid: 1,
            version: "0".into(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            status: InstanceStatus::Running,
        };
        store.register_instance(&live).unwrap();
        let swept = store
            .cleanup_stale_instances(Duration::from_secs(300))
            .unwrap();
        assert_eq!(swept, 0);
        assert_eq!(store.get_active_instances().unwrap().len(), 1);
    }

    #[test]
    fn old_stopped_instances_are_pruned_keeping_most_recent() {
        let (_dir, store) = test_store();
        for i in 0..5 {
            let inst = ExecutorInstance {
                id: format!("inst-{i}"),
                hostname: "host".into(),
                pid: i,
                version: "0".into(),
                started_at: Utc::now() - chrono::Duration::days(3),
                last_heartbeat: Utc::now() - chrono::Duration::days(2) + chrono::Duration::minutes(i as i64),
                status: InstanceStatus::Running,
            };
            store.register_instance(&inst).unwrap();
            // register writes status=running; flip to stopped keeping the old heartbeat
            let conn = store.conn();
            conn.execute(
                "UPDATE executor_instances SET status = 'stopped' WHERE id = ?1",
                params![inst.id],
            )
            .unwrap();
            drop(conn);
        }

        let deleted = store
            .delete_old_stopped_instances(Duration::from_secs(24 * 3600), 2)
            .unwrap();
        assert_eq!(deleted, 3);

        // keep == 0 deletes everything eligible
        let deleted = store
            .delete_old_stopped_instances(Duration::from_secs(24 * 3600), 0)
            .unwrap();
        assert_eq!(deleted, 2);
    }

    #[test]
    fn event_retention_enforces_bounds() {
        let (_dir, store) = test_store();
        let issue = seed_issue(&store, "noisy issue");

        // Old info event: past retention, deleted.
        let mut old_info = AgentEvent::new(EventType::AgentProgress, EventSeverity::Info, "old");
        old_info.timestamp = Utc::now() - chrono::Duration::days(40);
        old_info.issue_id = Some(issue.id.clone());
        store.store_agent_event(&old_info).unwrap();

        // Old error event: younger than critical retention, preserved.
        let mut old_error = AgentEvent::new(EventType::Error, EventSeverity::Error, "old error");
        old_error.timestamp = Utc::now() - chrono::Duration::days(40);
        old_error.issue_id = Some(issue.id.clone());
        store.store_agent_event(&old_error).unwrap();

        // Ancient error event: past critical retention, deleted.
        let mut ancient = AgentEvent::new(EventType::Error, EventSeverity::Error, "ancient");
        ancient.timestamp = Utc::now() - chrono::Duration::days(120);
        ancient.issue_id = Some(issue.id.clone());
        store.store_agent_event(&ancient).unwrap();

        let deleted = store.cleanup_events_by_age(30, 90, 100).unwrap();
        assert_eq!(deleted, 2);
        let remaining = store.get_agent_events_by_issue(&issue.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message, "old error");
    }

    #[test]
    fn per_issue_and_global_limits() {
        let (_dir, store) = test_store();
        let a = seed_issue(&store, "issue a");
        let b = seed_issue(&store, "issue b");
        for i in 0..10 {
            let mut ev = AgentEvent::new(EventType::AgentProgress, EventSeverity::Info, format!("a{i}"));
            ev.timestamp = Utc::now() - chrono::Duration::minutes(100 - i);
            ev.issue_id = Some(a.id.clone());
            store.store_agent_event(&ev).unwrap();
        }
        for i in 0..4 {
            let mut ev = AgentEvent::new(EventType::AgentProgress, EventSeverity::Info, format!("b{i}"));
            ev.issue_id = Some(b.id.clone());
            store.store_agent_event(&ev).unwrap();
        }

        let deleted = store.cleanup_events_by_issue_limit(5, 3).unwrap();
        assert_eq!(deleted, 5);
        assert_eq!(store.get_agent_events_by_issue(&a.id).unwrap().len(), 5);
        assert_eq!(store.get_agent_events_by_issue(&b.id).unwrap().len(), 4);

        let deleted = store.cleanup_events_by_global_limit(6, 4).unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.get_event_counts().unwrap().total, 6);
    }

    #[test]
    fn system_events_have_no_issue() {
        let (_dir, store) = test_store();
        let ev = AgentEvent::new(
            EventType::EventCleanupCompleted,
            EventSeverity::Info,
            "cleanup done",
        );
        store.store_agent_event(&ev).unwrap();
        let recent = store.get_recent_agent_events(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].issue_id.is_none());
    }

    #[test]
    fn config_round_trip() {
        let (_dir, store) = test_store();
        assert_eq!(store.get_config("missing").unwrap(), None);
        store.set_config("key", "value").unwrap();
        store.set_config("key", "value2").unwrap();
        assert_eq!(store.get_config("key").unwrap().as_deref(), Some("value2"));
    }

    #[test]
    fn checkpoint_round_trip() {
        let (_dir, store) = test_store();
        let issue = seed_issue(&store, "checkpointed");
        seed_instance(&store, "inst");
        store.claim_issue(&issue.id, "inst").unwrap();
        assert_eq!(store.get_checkpoint(&issue.id).unwrap(), None);
        store
            .save_checkpoint(&issue.id, r#"{"phase": "executing"}"#)
            .unwrap();
        assert_eq!(
            store.get_checkpoint(&issue.id).unwrap().as_deref(),
            Some(r#"{"phase": "executing"}"#)
        );
    }
}
