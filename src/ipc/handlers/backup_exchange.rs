use crate::backup;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

fn active_workspace(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn export_bundle(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let out_path = get_required_str(params, "outPath")?;
    let workspace = active_workspace(state)?;
    let summary = backup::export_workspace_bundle(&workspace, &PathBuf::from(&out_path))
        .map_err(|e| {
            tracing::warn!("bundle export failed: {e:#}");
            HandlerErr::new("export_failed", format!("{e:#}"))
                .with_details(json!({ "path": out_path }))
        })?;
    tracing::info!(path = %out_path, sha256 = %summary.db_sha256, bytes = summary.db_bytes, "bundle exported");

    Ok(json!({
        "ok": true,
        "path": out_path,
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "dbSha256": summary.db_sha256,
        "dbBytes": summary.db_bytes,
    }))
}

/// Replaces the workspace database with the bundle's copy. The connection is
/// dropped first and always reopened afterwards, so a rejected bundle leaves
/// the previous database in service.
fn import_bundle(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let in_path = get_required_str(params, "inPath")?;
    let workspace = active_workspace(state)?;
    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(HandlerErr::not_found("bundle").with_details(json!({ "path": in_path })));
    }

    state.db = None;
    let restored = backup::import_workspace_bundle(&src, &workspace);
    let reopened = open_workspace(state, &workspace);

    let summary = restored.map_err(|e| {
        tracing::warn!("bundle import failed: {e:#}");
        HandlerErr::new("import_failed", format!("{e:#}")).with_details(json!({ "path": in_path }))
    })?;
    reopened.map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    tracing::info!(path = %in_path, sha256 = %summary.db_sha256, "bundle restored");

    Ok(json!({
        "ok": true,
        "workspacePath": workspace.to_string_lossy(),
        "bundleFormatDetected": summary.bundle_format_detected,
        "dbSha256": summary.db_sha256,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "backup.exportBundle" => export_bundle(state, &req.params),
        "backup.importBundle" => import_bundle(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
