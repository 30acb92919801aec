//! Process-wide defaults, layered from `Config::default()` and overridden by
//! `TERMTAPE_*` environment variables. Deliberately small: the file-based
//! loader (profiles, project config files) is the out-of-scope CLI
//! collaborator; this only resolves the handful of numeric/string defaults
//! the core itself consults.

use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Ring buffer capacity, in lines.
    pub output_limit: usize,
    /// Maximum number of concurrently registered sessions.
    pub max_sessions: usize,
    /// Seconds a session may run before it's considered stale by
    /// age-based cleanup heuristics that consult `max_runtime`.
    pub max_session_runtime_secs: u64,
    /// Bytes after which `full_log`/on-disk capture is considered to have
    /// exceeded the session's output budget.
    pub max_output_size_bytes: u64,
    /// Directory name under the user's home directory used to build
    /// session log paths: `~/.<app_dir_name>/sessions/<id>/output.log`.
    pub app_dir_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_limit: 1000,
            max_sessions: 20,
            max_session_runtime_secs: 3600,
            max_output_size_bytes: 100 * 1024 * 1024,
            app_dir_name: "termtape".to_string(),
        }
    }
}

impl Config {
    /// Start from defaults and overlay any recognized `TERMTAPE_*`
    /// environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = parse_env_usize("TERMTAPE_OUTPUT_LIMIT") {
            cfg.output_limit = v;
        }
        if let Some(v) = parse_env_usize("TERMTAPE_MAX_SESSIONS") {
            cfg.max_sessions = v;
        }
        if let Some(v) = parse_env_u64("TERMTAPE_MAX_SESSION_RUNTIME_SECS") {
            cfg.max_session_runtime_secs = v;
        }
        if let Some(v) = parse_env_u64("TERMTAPE_MAX_OUTPUT_SIZE_BYTES") {
            cfg.max_output_size_bytes = v;
        }
        if let Ok(v) = env::var("TERMTAPE_APP_DIR_NAME") {
            if !v.is_empty() {
                cfg.app_dir_name = v;
            }
        }
        cfg
    }

    /// Directory housing per-session logs: `~/.<app_dir_name>/sessions`.
    pub fn sessions_dir(&self) -> std::path::PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        home.join(format!(".{}", self.app_dir_name)).join("sessions")
    }
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok()?.parse().ok()
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.output_limit, 1000);
        assert_eq!(cfg.max_sessions, 20);
        assert_eq!(cfg.max_session_runtime_secs, 3600);
        assert_eq!(cfg.app_dir_name, "termtape");
    }

    #[test]
    fn sessions_dir_uses_app_dir_name() {
        let cfg = Config {
            app_dir_name: "custom".to_string(),
            ..Config::default()
        };
        assert!(cfg.sessions_dir().ends_with("custom/sessions"));
    }
}
