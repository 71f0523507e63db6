use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    // The (scope, period, category) uniqueness invariant for meal plans
    // lives in the schema, not only in the validator: a concurrent
    // writer that slips past the key read fails here.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meal_plans(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            month TEXT NOT NULL,
            day TEXT NOT NULL,
            meal_type TEXT NOT NULL,
            dish TEXT NOT NULL,
            notes TEXT,
            updated_at TEXT,
            UNIQUE(class_id, month, day, meal_type),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_meal_plans_notes(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meal_plans_class_month ON meal_plans(class_id, month)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_groups(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            UNIQUE(class_id, name),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_groups_class ON fee_groups(class_id)",
        [],
    )?;

    // Same invariant for fee items, keyed per student.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_items(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            month TEXT NOT NULL,
            fee_group TEXT NOT NULL,
            title TEXT NOT NULL,
            amount REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'due',
            updated_at TEXT,
            UNIQUE(class_id, student_id, month, fee_group),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_fee_items_status(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_items_class_month ON fee_items(class_id, month)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_items_student ON fee_items(student_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_meal_plans_notes(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces stored the dish column only.
    if table_has_column(conn, "meal_plans", "notes")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE meal_plans ADD COLUMN notes TEXT", [])?;
    Ok(())
}

fn ensure_fee_items_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "fee_items", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE fee_items ADD COLUMN status TEXT NOT NULL DEFAULT 'due'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
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
