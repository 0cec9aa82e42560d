use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use serde_json::Value;

type Family = fn(&mut AppState, &Request) -> Option<Value>;

/// Method families in dispatch order. Each claims the methods it knows.
const FAMILIES: &[Family] = &[
    handlers::core::try_handle,
    handlers::students::try_handle,
    handlers::rooms::try_handle,
    handlers::fees::try_handle,
    handlers::departments::try_handle,
    handlers::colleges::try_handle,
    handlers::accounts::try_handle,
    handlers::setup::try_handle,
    handlers::reports::try_handle,
    handlers::data::try_handle,
    handlers::backup_exchange::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> Value {
    for family in FAMILIES {
        if let Some(resp) = family(state, &req) {
            return resp;
        }
    }
    tracing::debug!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
