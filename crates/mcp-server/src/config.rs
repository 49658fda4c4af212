//! Launch configuration assembled from environment variables and CLI overrides.

use crate::backend::{BackendCommand, SupervisorConfig};
use crate::session::SessionConfig;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const STORAGE_PATH_ENV: &str = "STORAGE_PATH";
pub const PLUGINS_DIR_ENV: &str = "SONAR_MCP_PLUGINS_DIR";
pub const BACKEND_COMMAND_ENV: &str = "SONAR_MCP_BACKEND_COMMAND";
pub const BACKEND_ARGS_ENV: &str = "SONAR_MCP_BACKEND_ARGS";
pub const LOG_ENV: &str = "SONAR_MCP_LOG";

const DEFAULT_BACKEND_COMMAND: &str = "sonarlint-backend";
const PLUGINS_SUBDIR: &str = "plugins";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub storage_path: Option<PathBuf>,
    pub plugins_dir: PathBuf,
    pub backend: BackendCommand,
    pub supervisor: SupervisorConfig,
    pub session: SessionConfig,
}

/// Values a CLI invocation may override on top of the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub plugins_dir: Option<PathBuf>,
    pub backend_command: Option<PathBuf>,
    pub max_in_flight: Option<usize>,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let storage_path = env.string(STORAGE_PATH_ENV).map(PathBuf::from);
        let plugins_dir = match (env.string(PLUGINS_DIR_ENV), storage_path.as_ref()) {
            (Some(dir), _) => PathBuf::from(dir),
            (None, Some(storage)) => storage.join(PLUGINS_SUBDIR),
            (None, None) => {
                bail!("{STORAGE_PATH_ENV} is not set (or set {PLUGINS_DIR_ENV} explicitly)")
            }
        };

        let backend = BackendCommand {
            program: PathBuf::from(
                env.string(BACKEND_COMMAND_ENV)
                    .unwrap_or_else(|| DEFAULT_BACKEND_COMMAND.to_string()),
            ),
            args: env
                .string(BACKEND_ARGS_ENV)
                .map(|raw| raw.split_whitespace().map(ToString::to_string).collect())
                .unwrap_or_default(),
            storage_path: storage_path.clone(),
        };

        let defaults = SupervisorConfig::default();
        let supervisor = SupervisorConfig {
            handshake_timeout: env.millis(
                "SONAR_MCP_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout,
                100..=600_000,
            ),
            heartbeat_interval: env.millis(
                "SONAR_MCP_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
                10..=600_000,
            ),
            heartbeat_timeout: env.millis(
                "SONAR_MCP_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout,
                10..=600_000,
            ),
            heartbeat_misses: env.number(
                "SONAR_MCP_HEARTBEAT_MISSES",
                defaults.heartbeat_misses,
                1..=100,
            ),
            max_restarts: env.number("SONAR_MCP_MAX_RESTARTS", defaults.max_restarts, 0..=1_000),
            backoff_min: env.millis(
                "SONAR_MCP_RESTART_BACKOFF_MIN_MS",
                defaults.backoff_min,
                1..=600_000,
            ),
            backoff_max: env.millis(
                "SONAR_MCP_RESTART_BACKOFF_MAX_MS",
                defaults.backoff_max,
                1..=3_600_000,
            ),
            request_timeout: env.millis(
                "SONAR_MCP_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
                100..=3_600_000,
            ),
            shutdown_grace: env.millis(
                "SONAR_MCP_SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace,
                0..=60_000,
            ),
        };

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            max_in_flight: env.number(
                "SONAR_MCP_MAX_IN_FLIGHT",
                session_defaults.max_in_flight,
                1..=64,
            ),
            max_queued: env.number("SONAR_MCP_MAX_QUEUED", session_defaults.max_queued, 0..=4_096),
            admission_wait: env.millis(
                "SONAR_MCP_ADMISSION_WAIT_MS",
                session_defaults.admission_wait,
                0..=600_000,
            ),
            default_timeout: supervisor.request_timeout,
            ..session_defaults
        };

        Ok(Self {
            storage_path,
            plugins_dir,
            backend,
            supervisor: supervisor.normalized(),
            session,
        })
    }

    pub fn apply_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(dir) = overrides.plugins_dir.as_ref() {
            self.plugins_dir = dir.clone();
        }
        if let Some(command) = overrides.backend_command.as_ref() {
            self.backend.program = command.clone();
        }
        if let Some(max) = overrides.max_in_flight {
            self.session.max_in_flight = max.clamp(1, 64);
        }
        self
    }
}

pub fn logging_enabled() -> bool {
    std::env::var(LOG_ENV)
        .ok()
        .map(|v| {
            let v = v.trim();
            !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
        })
        .unwrap_or(false)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number<T>(&self, key: &str, default: T, range: std::ops::RangeInclusive<T>) -> T
    where
        T: std::str::FromStr + PartialOrd + Copy + std::fmt::Display,
    {
        let Some(raw) = self.string(key) else {
            return default;
        };
        match raw.parse::<T>() {
            Ok(value) if range.contains(&value) => value,
            Ok(value) => {
                let clamped = if value < *range.start() {
                    *range.start()
                } else {
                    *range.end()
                };
                log::warn!("{key}={value} is out of range; using {clamped}");
                clamped
            }
            Err(_) => {
                log::warn!("{key}={raw:?} is not a valid number; using default {default}");
                default
            }
        }
    }

    fn millis(
        &self,
        key: &str,
        default: Duration,
        range: std::ops::RangeInclusive<u64>,
    ) -> Duration {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.number(key, default_ms, range))
    }
}
