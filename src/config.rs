use std::path::PathBuf;

/// Process-level settings read once from the environment at startup.
/// Per-workspace preferences live in the `settings` table instead.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub service_key: Option<String>,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        let workspace = std::env::var("HOSTELD_WORKSPACE")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let service_key = std::env::var("HOSTELD_SERVICE_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let log_filter = std::env::var("HOSTELD_LOG").unwrap_or_else(|_| "info".into());
        Config {
            workspace,
            service_key,
            log_filter,
        }
    }
}
