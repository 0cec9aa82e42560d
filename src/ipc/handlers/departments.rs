use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{get_patch, get_required_str, patch_str, with_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn department_exists(conn: &Connection, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM departments WHERE id = ?", [id], |_| Ok(()))
        .optional()
        .map(|v| v.is_some())
        .map_err(db_err("db_query_failed"))
}

fn departments_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT d.id, d.code, d.name, d.created_at,
                    (SELECT COUNT(*) FROM students s WHERE s.department_id = d.id)
             FROM departments d
             ORDER BY d.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "departments": rows }))
}

fn departments_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO departments(id, code, name, created_at)
         VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, &code, &name),
    )
    .map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "departmentId": id }))
}

fn departments_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "departmentId")?;
    let patch = get_patch(params)?;
    if !department_exists(conn, &id)? {
        return Err(HandlerErr::not_found("department"));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    for (key, col) in [("code", "code = ?"), ("name", "name = ?")] {
        match patch_str(patch, key) {
            None => {}
            Some(None) => return Err(HandlerErr::bad_params(format!("{} must not be empty", key))),
            Some(Some(v)) => {
                sets.push(col);
                binds.push(v);
            }
        }
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch has no department fields"));
    }
    binds.push(id);
    let sql = format!("UPDATE departments SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(binds.iter()))
        .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "ok": true }))
}

fn departments_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "departmentId")?;
    let linked: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE department_id = ?",
            [&id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let n = conn
        .execute("DELETE FROM departments WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("department"));
    }
    tracing::info!(department = %id, unlinked = linked, "department deleted");
    Ok(json!({ "ok": true, "unlinkedStudents": linked }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "departments.list" => Some(with_db(state, req, departments_list)),
        "departments.create" => Some(with_db(state, req, departments_create)),
        "departments.update" => Some(with_db(state, req, departments_update)),
        "departments.delete" => Some(with_db(state, req, departments_delete)),
        _ => None,
    }
}
