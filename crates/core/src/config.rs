use std::env;
use std::fs;
use std::net::IpAddr;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::gateway::{GatewaySettings, DEFAULT_CACHE_SIZE_BYTES, DEFAULT_DECODE_CONCURRENCY};
use crate::port::{listen_host, DEFAULT_PORT_RANGE};
use crate::runner::RunnerSettings;
use crate::server::DEFAULT_BIND_ATTEMPTS;

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "RENDERQ_DATA_DIR";
pub const ENV_PORT: &str = "PORT";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub decode: DecodeConfig,
    pub render: RenderConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address. Unset means `::` when IPv6 is usable, else `0.0.0.0`.
    pub host: Option<String>,
    /// Preferred studio port; the fallback range is scanned when unset or taken.
    pub port: Option<u16>,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub bind_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecodeConfig {
    pub concurrency: usize,
    pub cache_size_bytes: usize,
    pub ffmpeg_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RenderConfig {
    pub engine_program: PathBuf,
    pub engine_args: Vec<String>,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub job_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Static files served by the asset server next to `/proxy`.
    pub public_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            port_range_start: DEFAULT_PORT_RANGE.start,
            port_range_end: DEFAULT_PORT_RANGE.end,
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrency: 1 }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_DECODE_CONCURRENCY,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            engine_program: PathBuf::from("renderq-engine"),
            engine_args: Vec::new(),
            output_dir: PathBuf::from("out"),
            scratch_dir: PathBuf::from("tmp"),
            job_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    /// Address both servers listen on; a CLI `--host` takes precedence.
    pub fn listen_host(&self, cli_host: Option<&str>) -> Result<IpAddr> {
        match cli_host.or(self.host.as_deref()) {
            Some(host) => host
                .parse()
                .with_context(|| format!("invalid listen host {host:?}: expected an IP address")),
            None => Ok(listen_host()),
        }
    }
}

impl DecodeConfig {
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            concurrency: self.concurrency,
            cache_size_bytes: self.cache_size_bytes,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port_range_start >= self.server.port_range_end {
            bail!(
                "server.port_range_start ({}) must be below server.port_range_end ({})",
                self.server.port_range_start,
                self.server.port_range_end
            );
        }
        if self.server.bind_attempts == 0 {
            bail!("server.bind_attempts must be at least 1");
        }
        if self.queue.max_concurrency == 0 {
            bail!("queue.max_concurrency must be at least 1");
        }
        if self.decode.concurrency == 0 {
            bail!("decode.concurrency must be at least 1");
        }
        Ok(())
    }

    pub fn runner_settings(&self, data_dir: &Path) -> RunnerSettings {
        RunnerSettings {
            output_dir: resolve_relative_to(data_dir, &self.render.output_dir),
            scratch_dir: resolve_relative_to(data_dir, &self.render.scratch_dir),
            job_timeout: self.render.job_timeout_secs.map(Duration::from_secs),
            serve_url: None,
        }
    }

    pub fn public_dir(&self, data_dir: &Path) -> Option<PathBuf> {
        self.paths
            .public_dir
            .as_deref()
            .map(|dir| resolve_relative_to(data_dir, dir))
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. RENDERQ_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Desired studio port: CLI flag, then `PORT`, then the config file.
pub fn desired_port(cli_port: Option<u16>, env_port: Option<&str>, config: &ServerConfig) -> Result<Option<u16>> {
    if cli_port.is_some() {
        return Ok(cli_port);
    }
    if let Some(raw) = env_port.map(str::trim).filter(|raw| !raw.is_empty()) {
        let port = raw
            .parse::<u16>()
            .with_context(|| format!("{ENV_PORT} must be a port number, got {raw:?}"))?;
        return Ok(Some(port));
    }
    Ok(config.port)
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
