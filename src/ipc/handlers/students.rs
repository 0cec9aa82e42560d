use std::collections::HashMap;

use crate::fees::{self, FeeStatus};
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::{fees as fee_handlers, setup};
use crate::ipc::helpers::{
    get_as_of, get_bool, get_date, get_i64, get_opt_str, get_patch, get_required_i64,
    get_required_str, in_tx, patch_str, with_db,
};
use crate::ipc::types::{AppState, Request};
use crate::occupancy::{self, Reconciled, RoomStatus};
use crate::validate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Accepts either the row id or the student's business number.
pub(crate) fn resolve_student_id(conn: &Connection, key: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT id FROM students WHERE id = ?1 OR student_id = ?1 LIMIT 1",
        [key],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("student"))
}

fn current_room(conn: &Connection, student_row_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT room_number FROM students WHERE id = ?",
        [student_row_id],
        |r| r.get::<_, Option<String>>(0),
    )
    .map_err(db_err("db_query_failed"))
}

/// Gate for putting one more student into `room_number`.
///
/// Holds always refuse. Capacity is only re-checked when the workspace turns
/// on `rooms.enforceCapacity`; otherwise the selection-time filter is the
/// only guard and two allotments may both take the last slot.
pub(crate) fn check_room_accepts(conn: &Connection, room_number: &str) -> Result<(), HandlerErr> {
    let room: Option<(i64, String)> = conn
        .query_row(
            "SELECT capacity, status FROM rooms WHERE room_number = ?",
            [room_number],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((capacity, status)) = room else {
        return Err(HandlerErr::not_found("room"));
    };
    if RoomStatus::parse(&status).map_or(false, |s| s.is_manual_hold()) {
        return Err(
            HandlerErr::new("room_unavailable", format!("room {} is {}", room_number, status))
                .with_details(json!({ "roomNumber": room_number, "status": status })),
        );
    }
    if setup::rooms_enforce_capacity(conn) {
        let occupancy = occupancy::occupancy_of(conn, room_number).map_err(db_err("db_query_failed"))?;
        if occupancy >= capacity {
            return Err(HandlerErr::new("room_full", format!("room {} is full", room_number))
                .with_details(json!({
                    "roomNumber": room_number,
                    "occupancy": occupancy,
                    "capacity": capacity,
                })));
        }
    }
    Ok(())
}

fn reconcile_pair(
    conn: &Connection,
    previous: Option<&str>,
    next: Option<&str>,
) -> Result<Vec<Reconciled>, HandlerErr> {
    occupancy::reconcile_rooms(conn, previous.into_iter().chain(next))
        .map_err(db_err("db_update_failed"))
}

#[derive(Default)]
struct StudentInput {
    student_id: Option<String>,
    name: Option<String>,
    gender: Option<String>,
    phone: Option<String>,
    email: Option<Option<String>>,
    parent_name: Option<Option<String>>,
    parent_phone: Option<Option<String>>,
    address: Option<Option<String>>,
    department_id: Option<Option<String>>,
    college_id: Option<Option<String>>,
    year: Option<i64>,
    room_number: Option<Option<String>>,
    admission_date: Option<String>,
    status: Option<String>,
}

fn required_patch_str(
    obj: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match patch_str(obj, key) {
        None => Ok(None),
        Some(None) => Err(HandlerErr::bad_params(format!("{} must not be empty", key))),
        Some(Some(v)) => Ok(Some(v)),
    }
}

/// Validates every field present in `obj`. Absent keys stay `None`.
fn parse_student_fields(obj: &Map<String, Value>) -> Result<StudentInput, HandlerErr> {
    let mut input = StudentInput {
        student_id: required_patch_str(obj, "studentId")?,
        name: required_patch_str(obj, "name")?,
        ..Default::default()
    };

    if let Some(raw) = required_patch_str(obj, "gender")? {
        let g = validate::normalize_gender(&raw).ok_or_else(|| {
            HandlerErr::bad_params(format!("gender must be one of: {}", validate::GENDERS.join(", ")))
        })?;
        input.gender = Some(g.to_string());
    }
    if let Some(raw) = required_patch_str(obj, "phone")? {
        if !validate::is_valid_phone(&raw) {
            return Err(HandlerErr::bad_params("phone must have 7 to 15 digits"));
        }
        input.phone = Some(raw);
    }
    if let Some(v) = patch_str(obj, "email") {
        if let Some(e) = &v {
            if !validate::is_valid_email(e) {
                return Err(HandlerErr::bad_params("email is not a valid address"));
            }
        }
        input.email = Some(v);
    }
    if let Some(v) = patch_str(obj, "parentPhone") {
        if let Some(p) = &v {
            if !validate::is_valid_phone(p) {
                return Err(HandlerErr::bad_params("parentPhone must have 7 to 15 digits"));
            }
        }
        input.parent_phone = Some(v);
    }
    input.parent_name = patch_str(obj, "parentName");
    input.address = patch_str(obj, "address");
    input.department_id = patch_str(obj, "departmentId");
    input.college_id = patch_str(obj, "collegeId");
    input.room_number = patch_str(obj, "roomNumber");

    let as_value = Value::Object(obj.clone());
    if let Some(year) = get_i64(&as_value, "year")? {
        if !validate::is_valid_year(year) {
            return Err(HandlerErr::bad_params("year must be between 1 and 4"));
        }
        input.year = Some(year);
    }
    if let Some(d) = get_date(&as_value, "admissionDate")? {
        input.admission_date = Some(fees::format_date(d));
    }
    if let Some(raw) = required_patch_str(obj, "status")? {
        let s = raw.to_ascii_lowercase();
        if s != "active" && s != "inactive" {
            return Err(HandlerErr::bad_params("status must be active or inactive"));
        }
        input.status = Some(s);
    }
    Ok(input)
}

fn check_reference(
    conn: &Connection,
    table: &str,
    id: Option<&str>,
    what: &str,
) -> Result<(), HandlerErr> {
    let Some(id) = id else {
        return Ok(());
    };
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found = conn
        .query_row(&sql, [id], |_| Ok(()))
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if found.is_none() {
        return Err(HandlerErr::not_found(what));
    }
    Ok(())
}

struct StudentRow {
    id: String,
    student_id: String,
    name: String,
    gender: String,
    phone: String,
    email: Option<String>,
    parent_name: Option<String>,
    parent_phone: Option<String>,
    address: Option<String>,
    department_id: Option<String>,
    department_name: Option<String>,
    college_id: Option<String>,
    college_name: Option<String>,
    year: i64,
    room_number: Option<String>,
    admission_date: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl StudentRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "name": self.name,
            "gender": self.gender,
            "phone": self.phone,
            "email": self.email,
            "parentName": self.parent_name,
            "parentPhone": self.parent_phone,
            "address": self.address,
            "departmentId": self.department_id,
            "departmentName": self.department_name,
            "collegeId": self.college_id,
            "collegeName": self.college_name,
            "year": self.year,
            "roomNumber": self.room_number,
            "admissionDate": self.admission_date,
            "status": self.status,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

const STUDENT_SELECT: &str = "SELECT s.id, s.student_id, s.name, s.gender, s.phone, s.email,
        s.parent_name, s.parent_phone, s.address, s.department_id, d.name,
        s.college_id, c.name, s.year, s.room_number, s.admission_date, s.status,
        s.created_at, s.updated_at
     FROM students s
     LEFT JOIN departments d ON d.id = s.department_id
     LEFT JOIN colleges c ON c.id = s.college_id";

fn map_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        name: r.get(2)?,
        gender: r.get(3)?,
        phone: r.get(4)?,
        email: r.get(5)?,
        parent_name: r.get(6)?,
        parent_phone: r.get(7)?,
        address: r.get(8)?,
        department_id: r.get(9)?,
        department_name: r.get(10)?,
        college_id: r.get(11)?,
        college_name: r.get(12)?,
        year: r.get(13)?,
        room_number: r.get(14)?,
        admission_date: r.get(15)?,
        status: r.get(16)?,
        created_at: r.get(17)?,
        updated_at: r.get(18)?,
    })
}

/// Fee roll-up label per student row id, evaluated against `as_of`.
fn fee_summaries(
    conn: &Connection,
    as_of: chrono::NaiveDate,
) -> Result<HashMap<String, Vec<FeeStatus>>, HandlerErr> {
    let mut by_student: HashMap<String, Vec<FeeStatus>> = HashMap::new();
    for fee in fee_handlers::load_fees(conn, None)? {
        let status = fee.effective_status(as_of);
        by_student.entry(fee.student_id).or_default().push(status);
    }
    Ok(by_student)
}

/// `%q%` for LIKE with the wildcards in `q` taken literally.
fn contains_pattern(q: &str) -> String {
    let mut out = String::with_capacity(q.len() + 2);
    out.push('%');
    for ch in q.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let as_of = get_as_of(params)?;
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(q) = get_opt_str(params, "search") {
        clauses.push(
            "(s.name LIKE ? ESCAPE '\\' OR s.student_id LIKE ? ESCAPE '\\'
              OR s.phone LIKE ? ESCAPE '\\' OR IFNULL(s.email, '') LIKE ? ESCAPE '\\')",
        );
        let like = contains_pattern(&q);
        for _ in 0..4 {
            binds.push(like.clone().into());
        }
    }
    if let Some(year) = get_i64(params, "year")? {
        clauses.push("s.year = ?");
        binds.push(year.into());
    }
    if let Some(dep) = get_opt_str(params, "departmentId") {
        clauses.push("s.department_id = ?");
        binds.push(dep.into());
    }
    if let Some(col) = get_opt_str(params, "collegeId") {
        clauses.push("s.college_id = ?");
        binds.push(col.into());
    }
    if let Some(room) = get_opt_str(params, "roomNumber") {
        clauses.push("s.room_number = ?");
        binds.push(room.into());
    }
    if get_bool(params, "unassigned")?.unwrap_or(false) {
        clauses.push("s.room_number IS NULL");
    }
    if let Some(status) = get_opt_str(params, "status") {
        clauses.push("s.status = ?");
        binds.push(status.to_ascii_lowercase().into());
    }

    let mut sql = STUDENT_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY s.created_at DESC, s.name");

    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), map_student)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let summaries = fee_summaries(conn, as_of)?;
    let out: Vec<Value> = rows
        .iter()
        .map(|s| {
            let statuses = summaries.get(&s.id).cloned().unwrap_or_default();
            let mut v = s.to_json();
            v["feeSummary"] = json!(fees::student_fee_summary(statuses));
            v
        })
        .collect();
    Ok(json!({ "students": out }))
}

fn students_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = get_required_str(params, "studentId")?;
    let id = resolve_student_id(conn, &key)?;
    let as_of = get_as_of(params)?;

    let sql = format!("{} WHERE s.id = ?", STUDENT_SELECT);
    let row = conn
        .query_row(&sql, [&id], map_student)
        .map_err(db_err("db_query_failed"))?;

    let department = match row.department_id.as_deref() {
        Some(dep) => conn
            .query_row(
                "SELECT id, code, name FROM departments WHERE id = ?",
                [dep],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "code": r.get::<_, String>(1)?,
                        "name": r.get::<_, String>(2)?,
                    }))
                },
            )
            .optional()
            .map_err(db_err("db_query_failed"))?,
        None => None,
    };
    let college = match row.college_id.as_deref() {
        Some(col) => conn
            .query_row(
                "SELECT id, code, name FROM colleges WHERE id = ?",
                [col],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "code": r.get::<_, String>(1)?,
                        "name": r.get::<_, String>(2)?,
                    }))
                },
            )
            .optional()
            .map_err(db_err("db_query_failed"))?,
        None => None,
    };
    let fee_rows = fee_handlers::load_fees(conn, Some(&id))?;
    let summary = fees::student_fee_summary(fee_rows.iter().map(|f| f.effective_status(as_of)));

    let mut v = row.to_json();
    v["department"] = department.unwrap_or(Value::Null);
    v["college"] = college.unwrap_or(Value::Null);
    v["fees"] = Value::Array(fee_rows.iter().map(|f| f.to_json(as_of)).collect());
    v["feeSummary"] = json!(summary);
    Ok(json!({ "student": v }))
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let obj = params
        .as_object()
        .ok_or_else(|| HandlerErr::bad_params("params must be an object"))?;
    let input = parse_student_fields(obj)?;

    let student_id = input
        .student_id
        .ok_or_else(|| HandlerErr::bad_params("missing studentId"))?;
    let name = input.name.ok_or_else(|| HandlerErr::bad_params("missing name"))?;
    let gender = input.gender.ok_or_else(|| HandlerErr::bad_params("missing gender"))?;
    let phone = input.phone.ok_or_else(|| HandlerErr::bad_params("missing phone"))?;
    let year = match input.year {
        Some(y) => y,
        None => get_required_i64(params, "year")?,
    };
    let admission_date = input
        .admission_date
        .unwrap_or_else(|| fees::format_date(fees::today()));
    let status = input.status.unwrap_or_else(|| "active".to_string());
    let department_id = input.department_id.flatten();
    let college_id = input.college_id.flatten();
    let room_number = input.room_number.flatten();

    check_reference(conn, "departments", department_id.as_deref(), "department")?;
    check_reference(conn, "colleges", college_id.as_deref(), "college")?;

    let id = Uuid::new_v4().to_string();
    let reconciled = in_tx(conn, |tx| {
        if let Some(rn) = room_number.as_deref() {
            check_room_accepts(tx, rn)?;
        }
        tx.execute(
            "INSERT INTO students(id, student_id, name, gender, phone, email, parent_name,
                                  parent_phone, address, department_id, college_id, year,
                                  room_number, admission_date, status, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                    strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
            rusqlite::params![
                id,
                student_id,
                name,
                gender,
                phone,
                input.email.flatten(),
                input.parent_name.flatten(),
                input.parent_phone.flatten(),
                input.address.flatten(),
                department_id,
                college_id,
                year,
                room_number,
                admission_date,
                status,
            ],
        )
        .map_err(db_err("db_insert_failed"))?;
        reconcile_pair(tx, None, room_number.as_deref())
    })?;

    Ok(json!({
        "id": id,
        "studentId": student_id,
        "rooms": reconciled.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
    }))
}

fn students_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = get_required_str(params, "studentId")?;
    let id = resolve_student_id(conn, &key)?;
    let patch = get_patch(params)?;
    let input = parse_student_fields(patch)?;

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    let mut push = |col: &'static str, v: rusqlite::types::Value| {
        sets.push(col);
        binds.push(v);
    };

    if let Some(v) = input.student_id {
        push("student_id = ?", v.into());
    }
    if let Some(v) = input.name {
        push("name = ?", v.into());
    }
    if let Some(v) = input.gender {
        push("gender = ?", v.into());
    }
    if let Some(v) = input.phone {
        push("phone = ?", v.into());
    }
    if let Some(v) = input.email {
        push("email = ?", v.into());
    }
    if let Some(v) = input.parent_name {
        push("parent_name = ?", v.into());
    }
    if let Some(v) = input.parent_phone {
        push("parent_phone = ?", v.into());
    }
    if let Some(v) = input.address {
        push("address = ?", v.into());
    }
    if let Some(v) = &input.department_id {
        check_reference(conn, "departments", v.as_deref(), "department")?;
        push("department_id = ?", v.clone().into());
    }
    if let Some(v) = &input.college_id {
        check_reference(conn, "colleges", v.as_deref(), "college")?;
        push("college_id = ?", v.clone().into());
    }
    if let Some(v) = input.year {
        push("year = ?", v.into());
    }
    if let Some(v) = input.admission_date {
        push("admission_date = ?", v.into());
    }
    if let Some(v) = input.status {
        push("status = ?", v.into());
    }
    if let Some(v) = &input.room_number {
        push("room_number = ?", v.clone().into());
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch has no student fields"));
    }
    sets.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')");
    binds.push(id.clone().into());
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));

    let reconciled = in_tx(conn, |tx| {
        let previous = current_room(tx, &id)?;
        let next = match &input.room_number {
            Some(v) => v.clone(),
            None => previous.clone(),
        };
        if let Some(rn) = next.as_deref() {
            if previous.as_deref() != Some(rn) {
                check_room_accepts(tx, rn)?;
            }
        }
        tx.execute(&sql, rusqlite::params_from_iter(binds.iter()))
            .map_err(db_err("db_update_failed"))?;
        reconcile_pair(tx, previous.as_deref(), next.as_deref())
    })?;

    Ok(json!({
        "ok": true,
        "rooms": reconciled.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
    }))
}

fn students_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = get_required_str(params, "studentId")?;
    let id = resolve_student_id(conn, &key)?;
    let reconciled = in_tx(conn, |tx| {
        let previous = current_room(tx, &id)?;
        tx.execute("DELETE FROM students WHERE id = ?", [&id])
            .map_err(db_err("db_delete_failed"))?;
        reconcile_pair(tx, previous.as_deref(), None)
    })?;
    Ok(json!({
        "ok": true,
        "rooms": reconciled.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
    }))
}

fn students_allot(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = get_required_str(params, "studentId")?;
    let room_number = get_required_str(params, "roomNumber")?;
    let id = resolve_student_id(conn, &key)?;

    let (previous, reconciled) = in_tx(conn, |tx| {
        let previous = current_room(tx, &id)?;
        if previous.as_deref() == Some(room_number.as_str()) {
            let r = reconcile_pair(tx, None, Some(&room_number))?;
            return Ok((previous, r));
        }
        check_room_accepts(tx, &room_number)?;
        tx.execute(
            "UPDATE students
             SET room_number = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?",
            (&room_number, &id),
        )
        .map_err(db_err("db_update_failed"))?;
        let r = reconcile_pair(tx, previous.as_deref(), Some(&room_number))?;
        Ok((previous, r))
    })?;

    let target = reconciled.iter().find(|r| r.room_number == room_number);
    let over_capacity = target.map_or(false, |r| r.occupancy > r.capacity);
    if over_capacity {
        tracing::warn!(room = %room_number, student = %id, "allotment left room over capacity");
    }
    tracing::info!(
        student = %id,
        from = previous.as_deref().unwrap_or("-"),
        to = %room_number,
        "student allotted"
    );

    Ok(json!({
        "ok": true,
        "studentId": id,
        "roomNumber": room_number,
        "previousRoom": previous,
        "overCapacity": over_capacity,
        "room": target.map(|r| r.to_json()),
        "rooms": reconciled.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
    }))
}

fn students_unassign(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = get_required_str(params, "studentId")?;
    let id = resolve_student_id(conn, &key)?;
    let (previous, reconciled) = in_tx(conn, |tx| {
        let previous = current_room(tx, &id)?;
        tx.execute(
            "UPDATE students
             SET room_number = NULL, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?",
            [&id],
        )
        .map_err(db_err("db_update_failed"))?;
        let r = reconcile_pair(tx, previous.as_deref(), None)?;
        Ok((previous, r))
    })?;
    Ok(json!({
        "ok": true,
        "previousRoom": previous,
        "rooms": reconciled.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(with_db(state, req, students_list)),
        "students.get" => Some(with_db(state, req, students_get)),
        "students.create" => Some(with_db(state, req, students_create)),
        "students.update" => Some(with_db(state, req, students_update)),
        "students.delete" => Some(with_db(state, req, students_delete)),
        "students.allot" => Some(with_db(state, req, students_allot)),
        "students.unassign" => Some(with_db(state, req, students_unassign)),
        _ => None,
    }
}
