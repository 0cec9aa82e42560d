use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::export;
use crate::fees::{self, FeeStatus, PaymentMethod};
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::fees as fee_handlers;
use crate::ipc::handlers::students;
use crate::ipc::helpers::{get_as_of, get_required_str, in_tx, with_db};
use crate::ipc::types::{AppState, Request};
use crate::occupancy::{self, RoomStatus, RoomType};
use crate::validate;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// One imported row as `(column, value)` pairs, from CSV or JSON alike.
type Record = Vec<(String, String)>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Table {
    Students,
    Rooms,
    Departments,
    Colleges,
    Fees,
}

impl Table {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "students" => Some(Self::Students),
            "rooms" => Some(Self::Rooms),
            "departments" => Some(Self::Departments),
            "colleges" => Some(Self::Colleges),
            "fees" => Some(Self::Fees),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Students => "students",
            Self::Rooms => "rooms",
            Self::Departments => "departments",
            Self::Colleges => "colleges",
            Self::Fees => "fees",
        }
    }

    fn headers(self) -> &'static [&'static str] {
        match self {
            Self::Students => &[
                "student_id",
                "name",
                "gender",
                "phone",
                "email",
                "parent_name",
                "parent_phone",
                "address",
                "department_code",
                "college",
                "year",
                "room_number",
                "admission_date",
                "status",
            ],
            Self::Rooms => &["room_number", "capacity", "floor_number", "room_type", "status"],
            Self::Departments => &["code", "name"],
            Self::Colleges => &["code", "name"],
            Self::Fees => &[
                "student_id",
                "academic_year",
                "fee_year",
                "amount",
                "paid_amount",
                "status",
                "due_date",
                "payment_date",
                "payment_method",
                "transaction_id",
                "remarks",
            ],
        }
    }

    fn query(self) -> &'static str {
        match self {
            Self::Students => {
                "SELECT s.student_id, s.name, s.gender, s.phone, IFNULL(s.email, ''),
                        IFNULL(s.parent_name, ''), IFNULL(s.parent_phone, ''), IFNULL(s.address, ''),
                        IFNULL(d.code, ''), IFNULL(c.name, ''), CAST(s.year AS TEXT),
                        IFNULL(s.room_number, ''), s.admission_date, s.status
                 FROM students s
                 LEFT JOIN departments d ON d.id = s.department_id
                 LEFT JOIN colleges c ON c.id = s.college_id
                 ORDER BY s.student_id"
            }
            Self::Rooms => {
                "SELECT room_number, CAST(capacity AS TEXT), IFNULL(CAST(floor_number AS TEXT), ''),
                        room_type, status
                 FROM rooms ORDER BY room_number"
            }
            Self::Departments => "SELECT code, name FROM departments ORDER BY code",
            Self::Colleges => "SELECT code, name FROM colleges ORDER BY code",
            Self::Fees => {
                "SELECT s.student_id, f.academic_year, f.fee_year, f.amount_minor, f.paid_minor,
                        f.status, f.due_date, IFNULL(f.payment_date, ''), IFNULL(f.payment_method, ''),
                        IFNULL(f.transaction_id, ''), IFNULL(f.remarks, '')
                 FROM fees f JOIN students s ON s.id = f.student_id
                 ORDER BY s.student_id, f.due_date"
            }
        }
    }
}

const ALL_TABLES: [Table; 5] = [
    Table::Students,
    Table::Rooms,
    Table::Departments,
    Table::Colleges,
    Table::Fees,
];

fn get_table(params: &Value) -> Result<Table, HandlerErr> {
    let raw = get_required_str(params, "table")?;
    Table::parse(&raw).ok_or_else(|| HandlerErr::bad_params(format!("unknown table: {}", raw)))
}

fn table_rows(conn: &Connection, table: Table) -> Result<Vec<Vec<String>>, HandlerErr> {
    let width = table.headers().len();
    let mut stmt = conn.prepare(table.query()).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            let mut out = Vec::with_capacity(width);
            for i in 0..width {
                if table == Table::Fees && (i == 3 || i == 4) {
                    let minor: i64 = r.get(i)?;
                    out.push(format!("{:.2}", fees::from_minor(minor)));
                } else {
                    out.push(r.get::<_, String>(i)?);
                }
            }
            Ok(out)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn rows_as_objects(table: Table, rows: &[Vec<String>]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let obj: Map<String, Value> = table
                .headers()
                .iter()
                .zip(row.iter())
                .map(|(h, v)| (h.to_string(), Value::String(v.clone())))
                .collect();
            Value::Object(obj)
        })
        .collect()
}

fn write_out(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let p = PathBuf::from(path);
    if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
        })?;
    }
    std::fs::write(&p, contents).map_err(|e| {
        HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
    })
}

fn read_in(path: &str) -> Result<String, HandlerErr> {
    std::fs::read_to_string(path).map_err(|e| {
        HandlerErr::new("import_failed", e.to_string()).with_details(json!({ "path": path }))
    })
}

fn data_export_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let table = get_table(params)?;
    let out_path = get_required_str(params, "outPath")?;
    let rows = table_rows(conn, table)?;
    write_out(&out_path, &export::write_csv(table.headers(), &rows))?;
    tracing::info!(table = table.name(), rows = rows.len(), path = %out_path, "csv exported");
    Ok(json!({ "ok": true, "path": out_path, "rowsExported": rows.len() }))
}

fn data_backup_json(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let out_path = get_required_str(params, "outPath")?;
    let mut doc = Map::new();
    doc.insert(
        "exportedAt".into(),
        json!(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
    );
    let mut counts = Map::new();
    for table in ALL_TABLES {
        let rows = table_rows(conn, table)?;
        counts.insert(table.name().into(), json!(rows.len()));
        doc.insert(table.name().into(), Value::Array(rows_as_objects(table, &rows)));
    }
    let text = serde_json::to_string_pretty(&Value::Object(doc))
        .map_err(|e| HandlerErr::new("export_failed", e.to_string()))?;
    write_out(&out_path, &text)?;
    Ok(json!({ "ok": true, "path": out_path, "counts": counts }))
}

fn field(rec: &Record, name: &str) -> Option<String> {
    rec.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| validate::non_empty_trimmed(v))
}

fn json_to_record(v: &Value) -> Option<Record> {
    let obj = v.as_object()?;
    Some(
        obj.iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::Null => String::new(),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), s)
            })
            .collect(),
    )
}

#[derive(Default)]
struct ImportOutcome {
    inserted: usize,
    updated: usize,
    skipped: usize,
    warnings: Vec<Value>,
    touched_rooms: BTreeSet<String>,
}

impl ImportOutcome {
    fn warn(&mut self, line: usize, message: impl Into<String>) {
        self.warnings.push(json!({ "line": line, "message": message.into() }));
    }

    fn skip(&mut self, line: usize, message: impl Into<String>) {
        self.skipped += 1;
        self.warn(line, message);
    }

    fn count(&mut self, existed: bool) {
        if existed {
            self.updated += 1;
        } else {
            self.inserted += 1;
        }
    }
}

fn lookup_id(conn: &Connection, sql: &str, key: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(sql, [key], |r| r.get::<_, String>(0))
        .optional()
        .map_err(db_err("db_query_failed"))
}

fn import_directory_row(
    conn: &Connection,
    table: &str,
    rec: &Record,
    line: usize,
    out: &mut ImportOutcome,
) -> Result<(), HandlerErr> {
    let (Some(code), Some(name)) = (field(rec, "code"), field(rec, "name")) else {
        out.skip(line, "code and name are required");
        return Ok(());
    };
    let existing = lookup_id(conn, &format!("SELECT id FROM {} WHERE code = ?", table), &code)?;
    match &existing {
        Some(id) => {
            conn.execute(&format!("UPDATE {} SET name = ? WHERE id = ?", table), (&name, id))
                .map_err(db_err("db_update_failed"))?;
        }
        None => {
            conn.execute(
                &format!(
                    "INSERT INTO {}(id, code, name, created_at)
                     VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                    table
                ),
                (Uuid::new_v4().to_string(), &code, &name),
            )
            .map_err(db_err("db_insert_failed"))?;
        }
    }
    out.count(existing.is_some());
    Ok(())
}

fn import_room_row(
    conn: &Connection,
    rec: &Record,
    line: usize,
    out: &mut ImportOutcome,
) -> Result<(), HandlerErr> {
    let Some(room_number) = field(rec, "room_number") else {
        out.skip(line, "room_number is required");
        return Ok(());
    };
    let capacity = match field(rec, "capacity").map(|c| c.parse::<i64>()) {
        Some(Ok(c)) if c > 0 => c,
        _ => {
            out.skip(line, "capacity must be a positive integer");
            return Ok(());
        }
    };
    let floor = field(rec, "floor_number").and_then(|f| f.parse::<i64>().ok());
    let room_type = field(rec, "room_type")
        .and_then(|t| RoomType::parse(&t))
        .unwrap_or(RoomType::Standard);
    // Derived statuses are recomputed after import; only holds carry over.
    let status = field(rec, "status")
        .and_then(|s| RoomStatus::parse(&s))
        .filter(|s| s.is_manual_hold())
        .unwrap_or(RoomStatus::Available);

    let existing = lookup_id(conn, "SELECT id FROM rooms WHERE room_number = ?", &room_number)?;
    match &existing {
        Some(id) => {
            conn.execute(
                "UPDATE rooms SET capacity = ?, floor_number = ?, room_type = ?, status = ?,
                        updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE id = ?",
                (capacity, floor, room_type.as_str(), status.as_str(), id),
            )
            .map_err(db_err("db_update_failed"))?;
        }
        None => {
            conn.execute(
                "INSERT INTO rooms(id, room_number, capacity, floor_number, room_type, status, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                (Uuid::new_v4().to_string(), &room_number, capacity, floor, room_type.as_str(), status.as_str()),
            )
            .map_err(db_err("db_insert_failed"))?;
        }
    }
    out.count(existing.is_some());
    out.touched_rooms.insert(room_number);
    Ok(())
}

fn import_student_row(
    conn: &Connection,
    rec: &Record,
    line: usize,
    out: &mut ImportOutcome,
) -> Result<(), HandlerErr> {
    let (Some(student_id), Some(name)) = (field(rec, "student_id"), field(rec, "name")) else {
        out.skip(line, "student_id and name are required");
        return Ok(());
    };
    let Some(gender) = field(rec, "gender").and_then(|g| validate::normalize_gender(&g)) else {
        out.skip(line, "gender must be male, female or other");
        return Ok(());
    };
    let Some(phone) = field(rec, "phone").filter(|p| validate::is_valid_phone(p)) else {
        out.skip(line, "phone must have 7 to 15 digits");
        return Ok(());
    };
    let Some(year) = field(rec, "year")
        .and_then(|y| y.parse::<i64>().ok())
        .filter(|y| validate::is_valid_year(*y))
    else {
        out.skip(line, "year must be between 1 and 4");
        return Ok(());
    };
    let email = field(rec, "email");
    if email.as_deref().is_some_and(|e| !validate::is_valid_email(e)) {
        out.skip(line, "email is not a valid address");
        return Ok(());
    }

    let department_id = match field(rec, "department_code") {
        Some(code) => {
            let id = lookup_id(
                conn,
                "SELECT id FROM departments WHERE code = ?1 OR name = ?1",
                &code,
            )?;
            if id.is_none() {
                out.warn(line, format!("unknown department {}; left empty", code));
            }
            id
        }
        None => None,
    };
    let college_id = match field(rec, "college") {
        Some(c) => {
            let id = lookup_id(
                conn,
                "SELECT id FROM colleges WHERE LOWER(name) = LOWER(?1) OR code = ?1",
                &c,
            )?;
            if id.is_none() {
                out.warn(line, format!("unknown college {}; left empty", c));
            }
            id
        }
        None => None,
    };
    let room_number = match field(rec, "room_number") {
        Some(rn) => {
            let exists =
                lookup_id(conn, "SELECT id FROM rooms WHERE room_number = ?", &rn)?.is_some();
            if !exists {
                out.warn(line, format!("unknown room {}; left unassigned", rn));
                None
            } else {
                Some(rn)
            }
        }
        None => None,
    };
    let admission_date = field(rec, "admission_date")
        .and_then(|d| fees::parse_date(&d))
        .unwrap_or_else(fees::today);
    let status = match field(rec, "status").map(|s| s.to_ascii_lowercase()) {
        Some(s) if s == "inactive" => "inactive",
        _ => "active",
    };

    let existing: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, room_number FROM students WHERE student_id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;

    match &existing {
        Some((id, previous_room)) => {
            if let Some(prev) = previous_room {
                out.touched_rooms.insert(prev.clone());
            }
            conn.execute(
                "UPDATE students
                 SET name = ?, gender = ?, phone = ?, email = ?, parent_name = ?, parent_phone = ?,
                     address = ?, department_id = ?, college_id = ?, year = ?, room_number = ?,
                     admission_date = ?, status = ?,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE id = ?",
                rusqlite::params![
                    name,
                    gender,
                    phone,
                    email,
                    field(rec, "parent_name"),
                    field(rec, "parent_phone"),
                    field(rec, "address"),
                    department_id,
                    college_id,
                    year,
                    room_number,
                    fees::format_date(admission_date),
                    status,
                    id,
                ],
            )
            .map_err(db_err("db_update_failed"))?;
        }
        None => {
            conn.execute(
                "INSERT INTO students(id, student_id, name, gender, phone, email, parent_name,
                                      parent_phone, address, department_id, college_id, year,
                                      room_number, admission_date, status, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                        strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    student_id,
                    name,
                    gender,
                    phone,
                    email,
                    field(rec, "parent_name"),
                    field(rec, "parent_phone"),
                    field(rec, "address"),
                    department_id,
                    college_id,
                    year,
                    room_number,
                    fees::format_date(admission_date),
                    status,
                ],
            )
            .map_err(db_err("db_insert_failed"))?;
        }
    }
    if let Some(rn) = room_number {
        out.touched_rooms.insert(rn);
    }
    out.count(existing.is_some());
    Ok(())
}

fn parse_amount(raw: Option<String>) -> Option<i64> {
    raw.and_then(|v| v.parse::<f64>().ok()).and_then(fees::to_minor)
}

/// Upserts one fee keyed by (student, academic year, fee year). The stored
/// status is re-derived, never taken from the row.
fn import_fee_row(
    conn: &Connection,
    rec: &Record,
    line: usize,
    as_of: NaiveDate,
    out: &mut ImportOutcome,
) -> Result<(), HandlerErr> {
    let (Some(student_key), Some(academic_year), Some(fee_year)) = (
        field(rec, "student_id"),
        field(rec, "academic_year"),
        field(rec, "fee_year"),
    ) else {
        out.skip(line, "student_id, academic_year and fee_year are required");
        return Ok(());
    };
    let student_row_id = match students::resolve_student_id(conn, &student_key) {
        Ok(id) => id,
        Err(e) if e.code == "not_found" => {
            out.skip(line, format!("unknown student {}", student_key));
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let Some(amount) = parse_amount(field(rec, "amount")).filter(|a| *a > 0) else {
        out.skip(line, "amount must be a positive number");
        return Ok(());
    };
    let paid = match field(rec, "paid_amount") {
        None => 0,
        raw => match parse_amount(raw) {
            Some(p) if p <= amount => p,
            _ => {
                out.skip(line, "paid_amount must be between 0 and amount");
                return Ok(());
            }
        },
    };
    let Some(due) = field(rec, "due_date").and_then(|d| fees::parse_date(&d)) else {
        out.skip(line, "due_date must be YYYY-MM-DD");
        return Ok(());
    };
    let method = match field(rec, "payment_method") {
        None => None,
        Some(m) => match PaymentMethod::parse(&m) {
            Some(m) => Some(m),
            None => {
                out.skip(line, "payment_method must be one of: cash, upi, bank_transfer");
                return Ok(());
            }
        },
    };
    let transaction_id = field(rec, "transaction_id");
    if paid > 0
        && transaction_id.is_none()
        && method.is_some_and(PaymentMethod::needs_transaction_id)
    {
        out.skip(line, "transaction_id is required for non-cash payments");
        return Ok(());
    }
    let payment_date = field(rec, "payment_date")
        .and_then(|d| fees::parse_date(&d))
        .map(fees::format_date);
    let status = fees::derive_status(amount, paid, due, as_of);

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM fees WHERE student_id = ? AND academic_year = ? AND fee_year = ?",
            (&student_row_id, &academic_year, &fee_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let due = fees::format_date(due);
    let method = method.map(PaymentMethod::as_str);
    let remarks = field(rec, "remarks");
    match &existing {
        Some(id) => {
            conn.execute(
                "UPDATE fees
                 SET amount_minor = ?, paid_minor = ?, status = ?, due_date = ?, payment_date = ?,
                     payment_method = ?, transaction_id = ?, remarks = ?,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE id = ?",
                rusqlite::params![
                    amount,
                    paid,
                    status.as_str(),
                    due,
                    payment_date,
                    method,
                    transaction_id,
                    remarks,
                    id,
                ],
            )
            .map_err(db_err("db_update_failed"))?;
        }
        None => {
            conn.execute(
                "INSERT INTO fees(id, student_id, academic_year, fee_year, amount_minor, paid_minor,
                                  status, due_date, payment_date, payment_method, transaction_id,
                                  remarks, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                        strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    student_row_id,
                    academic_year,
                    fee_year,
                    amount,
                    paid,
                    status.as_str(),
                    due,
                    payment_date,
                    method,
                    transaction_id,
                    remarks,
                ],
            )
            .map_err(db_err("db_insert_failed"))?;
        }
    }
    out.count(existing.is_some());
    Ok(())
}

/// Applies `records` to `table` in one transaction, then reconciles every
/// room whose occupancy or capacity could have moved.
fn import_records(
    conn: &Connection,
    table: Table,
    records: &[(usize, Record)],
    as_of: NaiveDate,
) -> Result<Value, HandlerErr> {
    let outcome = in_tx(conn, |tx| {
        let mut out = ImportOutcome::default();
        for (line, rec) in records {
            let line = *line;
            match table {
                Table::Students => import_student_row(tx, rec, line, &mut out)?,
                Table::Rooms => import_room_row(tx, rec, line, &mut out)?,
                Table::Departments => import_directory_row(tx, "departments", rec, line, &mut out)?,
                Table::Colleges => import_directory_row(tx, "colleges", rec, line, &mut out)?,
                Table::Fees => import_fee_row(tx, rec, line, as_of, &mut out)?,
            }
        }
        occupancy::reconcile_rooms(tx, out.touched_rooms.iter().map(|s| s.as_str()))
            .map_err(db_err("db_update_failed"))?;
        Ok(out)
    })?;

    tracing::info!(
        table = table.name(),
        inserted = outcome.inserted,
        updated = outcome.updated,
        warnings = outcome.warnings.len(),
        "import applied"
    );
    Ok(json!({
        "ok": true,
        "table": table.name(),
        "inserted": outcome.inserted,
        "updated": outcome.updated,
        "skipped": outcome.skipped,
        "warnings": outcome.warnings,
        "roomsReconciled": outcome.touched_rooms.len(),
    }))
}

fn data_import_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let table = get_table(params)?;
    let path = get_required_str(params, "path")?;
    let as_of = get_as_of(params)?;
    let text = read_in(&path)?;
    let records = export::csv_objects(&text);
    import_records(conn, table, &records, as_of)
}

fn data_import_json(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let table = get_table(params)?;
    let path = get_required_str(params, "path")?;
    let as_of = get_as_of(params)?;
    let text = read_in(&path)?;
    let doc: Value = serde_json::from_str(&text).map_err(|e| {
        HandlerErr::new("import_failed", format!("invalid JSON: {}", e))
            .with_details(json!({ "path": path }))
    })?;
    let items = match &doc {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get(table.name()) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(HandlerErr::new(
                    "import_failed",
                    format!("backup has no {} array", table.name()),
                ))
            }
        },
        _ => return Err(HandlerErr::new("import_failed", "expected an array or backup object")),
    };
    // For JSON, "line" is the 1-based position in the array.
    let records: Vec<(usize, Record)> = items
        .iter()
        .enumerate()
        .filter_map(|(i, v)| json_to_record(v).map(|r| (i + 1, r)))
        .collect();
    import_records(conn, table, &records, as_of)
}

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0))
        .map_err(db_err("db_query_failed"))
}

fn data_diagnostics(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let as_of = get_as_of(params)?;
    let overdue = fee_handlers::load_fees(conn, None)?
        .iter()
        .filter(|f| f.effective_status(as_of) == FeeStatus::Overdue)
        .count();

    let mut stmt = conn
        .prepare(
            "SELECT r.room_number, r.capacity, r.status,
                    (SELECT COUNT(*) FROM students s WHERE s.room_number = r.room_number)
             FROM rooms r ORDER BY r.room_number",
        )
        .map_err(db_err("db_query_failed"))?;
    let rooms = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut over_capacity = Vec::new();
    let mut stale = Vec::new();
    for (rn, capacity, stored, occ) in &rooms {
        if occ > capacity {
            over_capacity.push(rn.clone());
        }
        let current = RoomStatus::parse(stored).unwrap_or(RoomStatus::Available);
        if occupancy::derive_room_status(*occ, *capacity, current).as_str() != stored {
            stale.push(rn.clone());
        }
    }

    Ok(json!({
        "students": count(conn, "SELECT COUNT(*) FROM students")?,
        "departments": count(conn, "SELECT COUNT(*) FROM departments")?,
        "colleges": count(conn, "SELECT COUNT(*) FROM colleges")?,
        "rooms": count(conn, "SELECT COUNT(*) FROM rooms")?,
        "fees": count(conn, "SELECT COUNT(*) FROM fees")?,
        "overdueFees": overdue,
        "studentsWithoutEmail": count(conn, "SELECT COUNT(*) FROM students WHERE email IS NULL OR TRIM(email) = ''")?,
        "unassignedStudents": count(conn, "SELECT COUNT(*) FROM students WHERE room_number IS NULL")?,
        "roomsOverCapacity": over_capacity,
        "staleRooms": stale,
        "asOf": fees::format_date(as_of),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "data.exportCsv" => Some(with_db(state, req, data_export_csv)),
        "data.importCsv" => Some(with_db(state, req, data_import_csv)),
        "data.backupJson" => Some(with_db(state, req, data_backup_json)),
        "data.importJson" => Some(with_db(state, req, data_import_json)),
        "data.diagnostics" => Some(with_db(state, req, data_diagnostics)),
        _ => None,
    }
}
