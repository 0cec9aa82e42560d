use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::fees;
use crate::ipc::error::{err, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};

pub type DbHandler = fn(&Connection, &Value) -> Result<Value, HandlerErr>;

pub fn with_db(state: &mut AppState, req: &Request, f: DbHandler) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    respond(&req.id, f(conn, &req.params))
}

/// Runs `f` inside one transaction. Any error rolls everything back.
pub fn in_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, HandlerErr>,
) -> Result<T, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let out = f(&*tx)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(out)
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    get_opt_str(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn get_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(v) => value_as_i64(v)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    get_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

/// Amount in rupees (number or numeric string), returned in paise.
pub fn get_money(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    let raw = match params.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    raw.and_then(fees::to_minor)
        .map(Some)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an amount between 0 and {}", key, fees::MAX_AMOUNT)))
}

pub fn get_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match get_opt_str(params, key) {
        None => Ok(None),
        Some(s) => fees::parse_date(&s)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))),
    }
}

/// Evaluation date for status derivation: `asOf` when given, else today.
pub fn get_as_of(params: &Value) -> Result<NaiveDate, HandlerErr> {
    Ok(get_date(params, "asOf")?.unwrap_or_else(fees::today))
}

pub fn get_patch(params: &Value) -> Result<&Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))
}

/// `None` when the key is absent; `Some(None)` when it is null or blank.
pub fn patch_str(patch: &Map<String, Value>, key: &str) -> Option<Option<String>> {
    let v = patch.get(key)?;
    Some(match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
