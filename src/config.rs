use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://cdp.customer.io/v1/";

/// Runtime configuration for the harness server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub settings_dir: PathBuf,
    pub api_base: Url,
    pub request_timeout: Duration,
    /// How long `initialize` waits for the tracking client to load.
    pub ready_timeout: Duration,
    pub enable_cors: bool,
    /// Record tracking calls locally instead of sending them.
    pub dry_run: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("failed to parse BIND_ADDR")?;

        let settings_dir = PathBuf::from(
            std::env::var("SETTINGS_DIR").unwrap_or_else(|_| ".cdp-harness".to_string()),
        );

        let api_base = parse_api_base(
            &std::env::var("CDP_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
        )
        .context("failed to parse CDP_API_BASE")?;

        let request_timeout = duration_ms_from_env("CDP_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|| Duration::from_secs(10));
        let ready_timeout = duration_ms_from_env("CLIENT_READY_TIMEOUT_MS")
            .unwrap_or_else(|| Duration::from_secs(5));

        Ok(Self {
            bind_addr,
            settings_dir,
            api_base,
            request_timeout,
            ready_timeout,
            enable_cors: flag_from_env("ENABLE_CORS"),
            dry_run: flag_from_env("CDP_DRY_RUN"),
        })
    }

    /// Applies command-line overrides on top of the environment.
    pub fn with_overrides(
        mut self,
        bind_addr: Option<SocketAddr>,
        settings_dir: Option<PathBuf>,
        api_base: Option<&str>,
        dry_run: bool,
    ) -> anyhow::Result<Self> {
        if let Some(addr) = bind_addr {
            self.bind_addr = addr;
        }
        if let Some(dir) = settings_dir {
            self.settings_dir = dir;
        }
        if let Some(base) = api_base {
            self.api_base = parse_api_base(base).context("failed to parse --api-base")?;
        }
        self.dry_run |= dry_run;
        Ok(self)
    }
}

/// Parses the pipelines base url, forcing a trailing slash so endpoint
/// names join under it.
pub fn parse_api_base(raw: &str) -> Result<Url, url::ParseError> {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("{trimmed}/"))
    }
}

fn flag_from_env(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn duration_ms_from_env(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
