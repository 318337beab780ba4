use ::duckdb::{Connection, ToSql};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_receipt_queue",
        sql: r#"
CREATE SEQUENCE IF NOT EXISTS pending_receipts_seq START 1;

CREATE TABLE IF NOT EXISTS pending_receipts (
    id TEXT PRIMARY KEY,
    seq BIGINT NOT NULL DEFAULT nextval('pending_receipts_seq'),
    source_doctype TEXT NOT NULL,
    source_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    priority INTEGER NOT NULL DEFAULT 5,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS receipt_log_seq START 1;

CREATE TABLE IF NOT EXISTS receipt_log (
    id BIGINT PRIMARY KEY DEFAULT nextval('receipt_log_seq'),
    source_doctype TEXT NOT NULL,
    source_name TEXT NOT NULL,
    status TEXT NOT NULL,
    bill_type TEXT,
    receipt_id TEXT,
    lottery TEXT,
    qr_data TEXT,
    queue_id TEXT,
    error TEXT,
    duration_ms BIGINT,
    created_at TEXT NOT NULL
);
"#,
    },
    Migration {
        version: "0002_reference_data",
        sql: r#"
CREATE TABLE IF NOT EXISTS districts (
    code TEXT PRIMARY KEY,
    branch_code TEXT NOT NULL,
    branch_name TEXT NOT NULL,
    sub_branch_code TEXT NOT NULL,
    sub_branch_name TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS tax_codes (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    tax_type_code TEXT,
    tax_type_name TEXT,
    start_date TEXT,
    end_date TEXT,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0003_kv_cache",
        sql: r#"
CREATE TABLE IF NOT EXISTS kv_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at_ms BIGINT
);
"#,
    },
    Migration {
        version: "0004_queued_document_version",
        sql: r#"
ALTER TABLE pending_receipts ADD COLUMN IF NOT EXISTS document_modified TEXT;
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let params: [&dyn ToSql; 1] = [&migration.version];
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params,
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params,
            )?;
        }
    }

    Ok(())
}

pub fn applied_versions(connection: &Connection) -> Result<Vec<String>, ::duckdb::Error> {
    let mut statement =
        connection.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}
