// Environment configuration for the server process.

use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_CATCHUP_WINDOW_MINUTES: u32 = 15;
pub const MAX_CATCHUP_WINDOW_MINUTES: u32 = 720;

/// Origins allowed when `CORS_ORIGINS` is not set. The literal "null" origin
/// covers file:// contexts used by the desktop shell.
pub const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:5173",
    "http://127.0.0.1:5173",
    "null",
];

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub port: u16,
    pub state_dir: PathBuf,
    pub cors_origins: Vec<String>,
    pub dashboard_api_token: Option<String>,
    pub catchup_window_minutes: u32,
    pub remote_mode: bool,
    pub pairing_admin_token: Option<String>,
    pub minimum_desktop_version: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            port: read_var("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            state_dir: resolve_state_dir(),
            cors_origins: read_var("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| {
                    DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect()
                }),
            dashboard_api_token: read_var("DASHBOARD_API_TOKEN"),
            catchup_window_minutes: catchup_window_from(
                read_var("SCHEDULER_CATCHUP_WINDOW_MINUTES").as_deref(),
            ),
            remote_mode: read_var("REMOTE_MODE")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            pairing_admin_token: read_var("PAIRING_ADMIN_TOKEN"),
            minimum_desktop_version: read_var("MINIMUM_DESKTOP_VERSION"),
        }
    }
}

pub fn catchup_window_from(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(0, MAX_CATCHUP_WINDOW_MINUTES as i64) as u32)
        .unwrap_or(DEFAULT_CATCHUP_WINDOW_MINUTES)
}

fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn resolve_state_dir() -> PathBuf {
    if let Some(dir) = read_var("CADENCE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from(".cadence")
}
