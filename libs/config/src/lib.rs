//! sling configuration. Loaded from YAML, every key has a default so an empty
//! (or missing) file is a valid configuration.
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// default wildcard for multi-file sends
pub const DEFAULT_WILDCARD: &str = "*";
/// default endpoint port
pub const DEFAULT_PORT: u16 = 9080;
/// default endpoint address
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
/// default log/console level
pub const DEFAULT_LEVEL: &str = "info";

/// top level config
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SlingConfig {
    /// file to send, a bare name is resolved against `dir`
    pub file: Option<PathBuf>,
    /// directory to send files from
    pub dir: Option<PathBuf>,
    pub wildcard: String,
    pub repeat: u64,
    pub save_req: bool,
    pub save_req_dir: PathBuf,
    pub save_res: bool,
    pub save_res_dir: PathBuf,
    /// zero-based index into `endpoints`
    pub endpoint_index: usize,
    pub endpoints: Vec<Endpoint>,
    pub throttle: Throttle,
    pub log: LogConfig,
    pub console: ConsoleConfig,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for SlingConfig {
    fn default() -> Self {
        Self {
            file: None,
            dir: None,
            wildcard: DEFAULT_WILDCARD.to_owned(),
            repeat: 1,
            save_req: false,
            save_req_dir: PathBuf::from("requests"),
            save_res: false,
            save_res_dir: PathBuf::from("responses"),
            endpoint_index: 0,
            endpoints: vec![Endpoint::default()],
            throttle: Throttle::default(),
            log: LogConfig::default(),
            console: ConsoleConfig::default(),
            path: None,
        }
    }
}

/// a destination for requests
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_owned(),
            port: DEFAULT_PORT,
            kind: TransportKind::Tcp,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind, self.address, self.port)
    }
}

/// how requests are delivered
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    #[serde(alias = "TCP")]
    Tcp,
    #[serde(alias = "HttpPost", alias = "http-post")]
    HttpPost,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "tcp",
            TransportKind::HttpPost => "http_post",
        })
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "http_post" | "httppost" | "http" => Ok(TransportKind::HttpPost),
            other => bail!("unknown client type {other:?}, expected tcp or http_post"),
        }
    }
}

/// concurrency, pacing and timeouts. Rates of 0 are unlimited, timeouts of 0 are disabled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Throttle {
    /// concurrent connections, also the rate limiter burst
    pub cxn_num: u32,
    /// bound the worker pool by `cxn_num`
    pub cxn_lim: bool,
    /// delay after each request, per worker
    pub sleep_ms: u64,
    pub rate_sec: u32,
    pub rate_min: u32,
    /// overall per-request timeout, seconds
    pub tmo_sec: u64,
    /// dial timeout, seconds
    pub tmo_cxn: u64,
    pub tmo_rd_s: u64,
    pub tmo_wr_s: u64,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            cxn_num: 1,
            cxn_lim: false,
            sleep_ms: 0,
            rate_sec: 0,
            rate_min: 0,
            tmo_sec: 0,
            tmo_cxn: 0,
            tmo_rd_s: 0,
            tmo_wr_s: 0,
        }
    }
}

/// log output format
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Standard,
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(LogFormat::Standard),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => bail!("unknown log format {other:?}, expected standard, json or pretty"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// log file, stderr when unset
    pub file: Option<PathBuf>,
    pub level: String,
    pub format: LogFormat,
    /// write the run histogram to the log
    pub histogram: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: DEFAULT_LEVEL.to_owned(),
            format: LogFormat::Standard,
            histogram: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub level: String,
    /// message only, no timestamp, level or fields
    pub flat: bool,
    /// print the run histogram to the console
    pub histogram: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL.to_owned(),
            flat: false,
            histogram: true,
        }
    }
}

impl SlingConfig {
    /// load and validate the YAML config at `path`
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::parse_str(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )
        .with_context(|| format!("failed to parse config at {}", &path.display()))?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// load and validate YAML config from a string
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let config: Self = if s.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(s)?
        };
        config.validate()?;
        debug!(?config);
        Ok(config)
    }

    /// `parse` when a path is given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::parse(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.endpoints.is_empty(), "config must list at least one endpoint");
        ensure!(
            self.endpoint_index < self.endpoints.len(),
            "endpoint_index {} out of range, {} endpoints configured",
            self.endpoint_index,
            self.endpoints.len()
        );
        ensure!(!self.wildcard.is_empty(), "wildcard must not be empty");
        Ok(())
    }

    /// path this config was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// the endpoint at `endpoint_index`
    pub fn active_endpoint(&self) -> &Endpoint {
        // index checked by `validate` and `set_active_endpoint`
        &self.endpoints[self.endpoint_index.min(self.endpoints.len().saturating_sub(1))]
    }

    /// select the endpoint requests are sent to
    pub fn set_active_endpoint(&mut self, index: usize) -> Result<()> {
        if index >= self.endpoints.len() {
            bail!(
                "endpoint index {index} out of range, {} endpoints configured",
                self.endpoints.len()
            );
        }
        debug!(index, endpoint = %self.endpoints[index], "active endpoint set");
        self.endpoint_index = index;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
