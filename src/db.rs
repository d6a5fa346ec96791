use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;

use crate::error::ReconResult;

const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_init.sql", include_str!("../db/migrations/0001_init.sql")),
    (
        "0002_import_job_collisions.sql",
        include_str!("../db/migrations/0002_import_job_collisions.sql"),
    ),
];

const BUSY_TIMEOUT_MS: u32 = 5_000;

#[derive(Debug)]
pub struct MigrateResult {
    pub created: bool,
    pub applied_now: Vec<String>,
    pub applied_total: usize,
}

/// Opens a connection with the pragmas every caller needs. Posting relies on
/// the busy timeout when two connections contend for the write lock.
pub fn open(db_path: &Path) -> ReconResult<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
    Ok(conn)
}

fn ensure_schema_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )
}

fn load_applied_versions(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

/// Creates the database file if needed and applies every embedded migration
/// not yet recorded in `schema_migrations`. Each migration runs in its own
/// transaction, so a failure leaves earlier migrations committed.
pub fn apply_embedded_migrations(db_path: &Path) -> ReconResult<MigrateResult> {
    let created = !db_path.exists();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            crate::error::ReconError::InvalidInput(format!("cannot create db directory: {e}"))
        })?;
    }

    let mut conn = open(db_path)?;
    ensure_schema_migrations_table(&conn)?;

    let already = load_applied_versions(&conn)?
        .into_iter()
        .collect::<HashSet<_>>();

    let mut applied_now = Vec::new();
    for (version, sql) in MIGRATIONS {
        if already.contains(*version) {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations(version) VALUES (?1)",
            [*version],
        )?;
        tx.commit()?;
        applied_now.push((*version).to_string());
    }

    let applied_total = load_applied_versions(&conn)?.len();
    Ok(MigrateResult {
        created,
        applied_now,
        applied_total,
    })
}
