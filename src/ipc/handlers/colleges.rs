use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{get_patch, get_required_str, patch_str, with_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

fn colleges_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.code, c.name, c.created_at,
                    (SELECT COUNT(*) FROM students s WHERE s.college_id = c.id)
             FROM colleges c
             ORDER BY c.name",
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
    Ok(json!({ "colleges": rows }))
}

fn colleges_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO colleges(id, code, name, created_at)
         VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, &code, &name),
    )
    .map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "collegeId": id }))
}

// Students reference colleges by id, so a rename touches one row.
fn colleges_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "collegeId")?;
    let patch = get_patch(params)?;

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
        return Err(HandlerErr::bad_params("patch has no college fields"));
    }
    binds.push(id);
    let sql = format!("UPDATE colleges SET {} WHERE id = ?", sets.join(", "));
    let n = conn
        .execute(&sql, rusqlite::params_from_iter(binds.iter()))
        .map_err(db_err("db_update_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("college"));
    }
    Ok(json!({ "ok": true }))
}

fn colleges_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "collegeId")?;
    let n = conn
        .execute("DELETE FROM colleges WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("college"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "colleges.list" => Some(with_db(state, req, colleges_list)),
        "colleges.create" => Some(with_db(state, req, colleges_create)),
        "colleges.update" => Some(with_db(state, req, colleges_update)),
        "colleges.delete" => Some(with_db(state, req, colleges_delete)),
        _ => None,
    }
}
