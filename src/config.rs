//! Server configuration and client options.
//!
//! Both read defaults from the environment (`BRIDGE_*` variables); the CLI
//! overrides individual fields.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::transfer::DEFAULT_CHUNK;
use crate::transport::{Keywords, DEFAULT_MAX_FRAME};

pub const DEFAULT_PORT: u16 = 10000;
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for the dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind; empty means all interfaces.
    #[serde(default)]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Chunk size for receiving uploads.
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,

    /// Largest control frame the server will accept.
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: u32,

    /// Where fresh session directories are created. Defaults to the system temp dir.
    #[serde(default)]
    pub session_root: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            port: DEFAULT_PORT,
            recv_buffer: DEFAULT_CHUNK,
            max_frame_bytes: DEFAULT_MAX_FRAME,
            session_root: None,
        }
    }
}

impl ServerConfig {
    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `BRIDGE_BIND`, `BRIDGE_PORT`, `BRIDGE_RECV_BUFFER` and `BRIDGE_SESSION_ROOT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: std::env::var("BRIDGE_BIND").unwrap_or(defaults.bind_address),
            port: env_parse("BRIDGE_PORT").unwrap_or(defaults.port),
            recv_buffer: env_parse::<usize>("BRIDGE_RECV_BUFFER")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.recv_buffer),
            session_root: std::env::var_os("BRIDGE_SESSION_ROOT").map(PathBuf::from),
            ..defaults
        }
    }

    /// Host part to bind; `0.0.0.0` when no address was given.
    pub fn bind_host(&self) -> &str {
        if self.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            &self.bind_address
        }
    }

    pub fn session_root(&self) -> PathBuf {
        self.session_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Per-call options for the client.
///
/// Keys the client does not recognize travel to the executor as keywords.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub ip: String,
    pub port: u16,
    /// Budget for connecting and for waiting on the response.
    pub timeout: Duration,
    /// Log per-call progress at `info` instead of `debug`.
    pub verbose: bool,
    /// Attach keywords inside the command's call syntax.
    pub is_function: bool,
    /// Local directory for downloads. Defaults to the current directory.
    pub outdir: Option<PathBuf>,
    pub extra: Keywords,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ip: "localhost".to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_CLIENT_TIMEOUT,
            verbose: false,
            is_function: false,
            outdir: None,
            extra: Keywords::new(),
        }
    }
}

impl ClientOptions {
    /// Defaults overridden by `BRIDGE_HOST`, `BRIDGE_PORT` and `BRIDGE_TIMEOUT` (seconds).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ip: std::env::var("BRIDGE_HOST").unwrap_or(defaults.ip),
            port: env_parse("BRIDGE_PORT").unwrap_or(defaults.port),
            timeout: env_parse::<f64>("BRIDGE_TIMEOUT")
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .unwrap_or(defaults.timeout),
            ..defaults
        }
    }

    /// Split a flat option mapping into recognized options and executor keywords.
    ///
    /// Recognized: `ip`, `port`, `timeout` (seconds), `verbose`,
    /// `is_function`/`isFunction`, `outdir`.
    pub fn from_keywords(mut keywords: Keywords) -> Result<Self> {
        let mut options = Self::default();

        if let Some(v) = keywords.remove("ip") {
            options.ip = expect_text("ip", v)?;
        }
        if let Some(v) = keywords.remove("port") {
            options.port = expect_number(&v)
                .and_then(|n| u16::try_from(n as u64).ok().filter(|_| n.fract() == 0.0))
                .ok_or_else(|| Error::Validation(format!("Invalid port: {v}")))?;
        }
        if let Some(v) = keywords.remove("timeout") {
            options.timeout = expect_number(&v)
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .ok_or_else(|| Error::Validation(format!("Invalid timeout: {v}")))?;
        }
        if let Some(v) = keywords.remove("verbose") {
            options.verbose = truthy(&v);
        }
        for key in ["is_function", "isFunction"] {
            if let Some(v) = keywords.remove(key) {
                options.is_function = truthy(&v);
            }
        }
        if let Some(v) = keywords.remove("outdir") {
            options.outdir = Some(PathBuf::from(expect_text("outdir", v)?));
        }

        options.extra = keywords;
        Ok(options)
    }

    /// Socket address string for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = Some(outdir.into());
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        warn!(var = name, value = %raw, "Ignoring unparsable environment variable");
    }
    parsed
}

fn expect_text(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s),
        other => Err(Error::Validation(format!(
            "{key} must be a non-blank string, got {other}"
        ))),
    }
}

fn expect_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite() && *n >= 0.0)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

const fn default_recv_buffer() -> usize {
    DEFAULT_CHUNK
}

const fn default_max_frame() -> u32 {
    DEFAULT_MAX_FRAME
}
