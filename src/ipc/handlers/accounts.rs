use crate::accounts::{self, AccountsMode};
use crate::ipc::error::{db_err, respond, HandlerErr};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn conn_of(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Gate for admin calls. A refusal without elevation drops the session into
/// the read-only fallback for good.
fn require_admin(state: &mut AppState, method: &str) -> Result<(), HandlerErr> {
    if state.accounts_mode == AccountsMode::Fallback {
        return Err(HandlerErr::new(
            "read_only",
            "account administration is unavailable; directory is read-only",
        ));
    }
    if !state.elevated {
        state.accounts_mode = AccountsMode::Fallback;
        tracing::warn!(method, "admin call without elevated credential; switching to fallback");
        return Err(
            HandlerErr::new("forbidden", "elevated credential required")
                .with_details(json!({ "status": 403 })),
        );
    }
    Ok(())
}

fn account_exists(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    conn.query_row("SELECT 1 FROM accounts WHERE id = ?", [id], |_| Ok(()))
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("account"))
}

fn list_accounts(conn: &Connection, full: bool) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, email, email_confirmed_at, last_sign_in_at, created_at
             FROM accounts ORDER BY created_at DESC, email",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            let confirmed_at: Option<String> = r.get(2)?;
            let mut v = json!({
                "id": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "confirmed": confirmed_at.is_some(),
            });
            if full {
                v["emailConfirmedAt"] = json!(confirmed_at);
                v["lastSignInAt"] = json!(r.get::<_, Option<String>>(3)?);
                v["createdAt"] = json!(r.get::<_, String>(4)?);
            }
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn accounts_list(state: &mut AppState, _params: &Value) -> Result<Value, HandlerErr> {
    conn_of(state)?;
    if state.accounts_mode == AccountsMode::Admin {
        require_admin(state, "accounts.list")?;
    }
    let conn = conn_of(state)?;
    match state.accounts_mode {
        AccountsMode::Admin => Ok(json!({ "mode": "admin", "accounts": list_accounts(conn, true)? })),
        AccountsMode::Fallback => Ok(json!({
            "mode": "fallback",
            "readOnly": true,
            "accounts": list_accounts(conn, false)?,
        })),
    }
}

fn accounts_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    conn_of(state)?;
    require_admin(state, "accounts.create")?;
    let conn = conn_of(state)?;

    let email = get_required_str(params, "email")?.to_ascii_lowercase();
    if !validate::is_valid_email(&email) {
        return Err(HandlerErr::bad_params("email is not a valid address"));
    }
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let confirm = params.get("confirmPassword").and_then(|v| v.as_str());
    accounts::check_password_policy(password, confirm).map_err(HandlerErr::bad_params)?;

    let id = Uuid::new_v4().to_string();
    let salt = accounts::new_salt();
    conn.execute(
        "INSERT INTO accounts(id, email, password_hash, password_salt, email_confirmed_at, created_at)
         VALUES(?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, &email, accounts::hash_password(password, &salt), &salt),
    )
    .map_err(db_err("db_insert_failed"))?;
    tracing::info!(account = %id, "account created");
    Ok(json!({ "accountId": id, "email": email }))
}

fn set_confirmed(state: &mut AppState, params: &Value, confirmed: bool) -> Result<Value, HandlerErr> {
    conn_of(state)?;
    require_admin(state, if confirmed { "accounts.approve" } else { "accounts.revoke" })?;
    let conn = conn_of(state)?;
    let id = get_required_str(params, "accountId")?;
    account_exists(conn, &id)?;
    let sql = if confirmed {
        "UPDATE accounts SET email_confirmed_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?"
    } else {
        "UPDATE accounts SET email_confirmed_at = NULL WHERE id = ?"
    };
    conn.execute(sql, [&id]).map_err(db_err("db_update_failed"))?;
    Ok(json!({ "ok": true, "confirmed": confirmed }))
}

fn accounts_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    conn_of(state)?;
    require_admin(state, "accounts.delete")?;
    let conn = conn_of(state)?;
    let id = get_required_str(params, "accountId")?;
    let n = conn
        .execute("DELETE FROM accounts WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("account"));
    }
    tracing::info!(account = %id, "account deleted");
    Ok(json!({ "ok": true }))
}

fn accounts_reset_password(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    conn_of(state)?;
    require_admin(state, "accounts.resetPassword")?;
    let conn = conn_of(state)?;
    let id = get_required_str(params, "accountId")?;
    account_exists(conn, &id)?;
    let password = accounts::generate_password();
    let salt = accounts::new_salt();
    conn.execute(
        "UPDATE accounts SET password_hash = ?, password_salt = ? WHERE id = ?",
        (accounts::hash_password(&password, &salt), &salt, &id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "ok": true, "password": password }))
}

fn accounts_mode(state: &mut AppState, _params: &Value) -> Result<Value, HandlerErr> {
    Ok(json!({
        "mode": state.accounts_mode.as_str(),
        "elevated": state.elevated,
        "serviceKeyConfigured": state.service_key.is_some(),
    }))
}

fn auth_elevate(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let presented = get_required_str(params, "serviceKey")?;
    let matches = state
        .service_key
        .as_deref()
        .map_or(false, |k| accounts::service_key_matches(k, &presented));
    if !matches {
        return Err(HandlerErr::new("forbidden", "service key rejected")
            .with_details(json!({ "status": 403 })));
    }
    state.elevated = true;
    tracing::info!("session elevated");
    Ok(json!({ "ok": true, "mode": state.accounts_mode.as_str() }))
}

fn auth_sign_in(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = conn_of(state)?;
    let email = get_required_str(params, "email")?.to_ascii_lowercase();
    // Hashed verbatim at create time, so no trimming here.
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let row: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, password_hash, password_salt, email_confirmed_at FROM accounts WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let invalid = || HandlerErr::new("forbidden", "invalid email or password");
    let Some((id, hash, salt, confirmed_at)) = row else {
        return Err(invalid());
    };
    if !accounts::verify_password(password, &salt, &hash) {
        return Err(invalid());
    }
    if confirmed_at.is_none() {
        return Err(HandlerErr::new("forbidden", "account is not confirmed"));
    }
    conn.execute(
        "UPDATE accounts SET last_sign_in_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
        [&id],
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "ok": true, "accountId": id, "email": email }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "accounts.list" => accounts_list(state, &req.params),
        "accounts.create" => accounts_create(state, &req.params),
        "accounts.approve" => set_confirmed(state, &req.params, true),
        "accounts.revoke" => set_confirmed(state, &req.params, false),
        "accounts.delete" => accounts_delete(state, &req.params),
        "accounts.resetPassword" => accounts_reset_password(state, &req.params),
        "accounts.mode" => accounts_mode(state, &req.params),
        "auth.elevate" => auth_elevate(state, &req.params),
        "auth.signIn" => auth_sign_in(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
