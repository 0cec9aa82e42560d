use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE: &str = "hostel.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS colleges(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rooms(
            id TEXT PRIMARY KEY,
            room_number TEXT NOT NULL UNIQUE,
            capacity INTEGER NOT NULL CHECK(capacity > 0),
            floor_number INTEGER,
            room_type TEXT NOT NULL DEFAULT 'standard',
            status TEXT NOT NULL DEFAULT 'available',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // room_number is the business key; students follow renames and are
    // released when the room row goes away.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            gender TEXT NOT NULL,
            phone TEXT NOT NULL,
            email TEXT,
            parent_name TEXT,
            parent_phone TEXT,
            address TEXT,
            department_id TEXT,
            college_id TEXT,
            year INTEGER NOT NULL,
            room_number TEXT,
            admission_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id) ON DELETE SET NULL,
            FOREIGN KEY(college_id) REFERENCES colleges(id) ON DELETE SET NULL,
            FOREIGN KEY(room_number) REFERENCES rooms(room_number)
                ON DELETE SET NULL ON UPDATE CASCADE
        )",
        [],
    )?;

    // Older workspaces stored the college as free text on the student row.
    ensure_students_status(&conn)?;
    ensure_students_college_id(&conn)?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_room ON students(room_number)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_college ON students(college_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fees(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            fee_year TEXT NOT NULL,
            amount_minor INTEGER NOT NULL CHECK(amount_minor > 0),
            paid_minor INTEGER NOT NULL DEFAULT 0 CHECK(paid_minor >= 0),
            status TEXT NOT NULL,
            due_date TEXT NOT NULL,
            payment_date TEXT,
            payment_method TEXT,
            transaction_id TEXT,
            remarks TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fees_student ON fees(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fees_status ON fees(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            password_salt TEXT NOT NULL,
            email_confirmed_at TEXT,
            last_sign_in_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN status TEXT NOT NULL DEFAULT 'active'",
        [],
    )?;
    Ok(())
}

fn ensure_students_college_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "college_id")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN college_id TEXT REFERENCES colleges(id) ON DELETE SET NULL",
        [],
    )?;
    if !table_has_column(conn, "students", "college")? {
        return Ok(());
    }

    // Link each distinct free-text name to a college row, creating rows as needed.
    let names = {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT TRIM(college) FROM students
             WHERE college IS NOT NULL AND TRIM(college) <> ''",
        )?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let tx = conn.unchecked_transaction()?;
    for name in &names {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM colleges WHERE LOWER(name) = LOWER(?)",
                [name],
                |r| r.get(0),
            )
            .optional()?;
        let college_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                let code = unique_college_code(&tx, name)?;
                tx.execute(
                    "INSERT INTO colleges(id, code, name, created_at)
                     VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                    (&id, &code, name),
                )?;
                id
            }
        };
        tx.execute(
            "UPDATE students SET college_id = ? WHERE TRIM(college) = ?",
            (&college_id, name),
        )?;
    }
    tx.commit()?;
    tracing::info!(colleges = names.len(), "migrated free-text student colleges");
    Ok(())
}

fn unique_college_code(conn: &Connection, name: &str) -> anyhow::Result<String> {
    let base: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(12)
        .collect();
    let base = if base.is_empty() { "COLLEGE".to_string() } else { base };
    let mut candidate = base.clone();
    let mut n = 2;
    loop {
        let taken: Option<i64> = conn
            .query_row("SELECT 1 FROM colleges WHERE code = ?", [&candidate], |r| {
                r.get(0)
            })
            .optional()?;
        if taken.is_none() {
            return Ok(candidate);
        }
        candidate = format!("{}-{}", base, n);
        n += 1;
    }
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("corrupt setting {}", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
