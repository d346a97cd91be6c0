//! Configuration model, defaults, and load-time validation.

use crate::auth::Auth;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Timeout applied to every orchestrator call made from an HTTP handler.
pub const API_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler lifetime used in local mode, where backends never expire.
const LOCAL_HANDLER_LIFETIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Global configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: Host,

    #[serde(default)]
    pub listen: Listen,

    #[serde(default)]
    pub parameters: Vec<Parameter>,

    #[serde(default)]
    pub launch: LaunchCfg,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,

    #[serde(default)]
    pub network: Network,

    #[serde(default)]
    pub dns: DnsCfg,

    #[serde(skip)]
    pub local_mode: bool,
}

/// Virtual host names the server multiplexes on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
    /// Host serving the management UI and API (e.g. `mirage.example.net`).
    #[serde(default)]
    pub web_api: String,

    /// Suffix for proxied subdomains, leading dot included
    /// (e.g. `.example.net`).
    #[serde(default)]
    pub reverse_proxy_suffix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Listen {
    /// Bind address (default: 0.0.0.0)
    #[serde(default)]
    pub foreign_address: String,

    #[serde(default)]
    pub http: Vec<PortMap>,
}

/// Binds an inbound listen port to an upstream container port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMap {
    /// Record name prefix for DNS registration (default: "http")
    #[serde(default = "default_port_name")]
    pub name: String,

    pub listen: u16,

    pub target: u16,

    /// Require a valid auth cookie on requests through this listen port.
    #[serde(default)]
    pub require_auth_cookie: bool,
}

fn default_port_name() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchCfg {
    /// Task definitions offered when a launch request names none.
    #[serde(default)]
    pub default_task_definitions: Vec<String>,
}

/// A launch parameter definition. Request values are validated against
/// this schema before a task is launched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,

    /// Environment variable the value is exported as in the task.
    #[serde(default)]
    pub env: String,

    /// Validation regex applied to submitted values.
    #[serde(default)]
    pub rule: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: String,

    /// When non-empty, submitted values must be one of these.
    #[serde(default)]
    pub options: Vec<String>,

    #[serde(default)]
    pub description: String,

    #[serde(skip)]
    pub regex: Option<Regex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Upstream request timeout in seconds. 0 disables the timeout.
    #[serde(default)]
    pub proxy_timeout: u64,

    /// Seconds a proxy handler survives without being used or re-added.
    #[serde(default = "default_handler_lifetime")]
    pub handler_lifetime: u64,

    /// Access counter bucket unit in seconds.
    #[serde(default = "default_access_counter_unit")]
    pub access_counter_unit: u64,

    /// Capacity of the proxy control channel (minimum 10).
    #[serde(default = "default_control_channel_capacity")]
    pub control_channel_capacity: usize,
}

fn default_handler_lifetime() -> u64 {
    30
}

fn default_access_counter_unit() -> u64 {
    60
}

fn default_control_channel_capacity() -> usize {
    64
}

impl Default for Network {
    fn default() -> Self {
        Self {
            proxy_timeout: 0,
            handler_lifetime: default_handler_lifetime(),
            access_counter_unit: default_access_counter_unit(),
            control_channel_capacity: default_control_channel_capacity(),
        }
    }
}

impl Network {
    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout)
    }

    pub fn handler_lifetime(&self) -> Duration {
        Duration::from_secs(self.handler_lifetime)
    }

    pub fn access_counter_unit(&self) -> Duration {
        Duration::from_secs(self.access_counter_unit)
    }

    pub fn control_channel_capacity(&self) -> usize {
        self.control_channel_capacity.max(10)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsCfg {
    /// Hosted zone records are maintained in. `None` disables DNS sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_name: Option<String>,
}

/// Inputs resolved from the command line before the config file loads.
#[derive(Debug, Clone)]
pub struct ConfigParams {
    pub path: Option<PathBuf>,
    pub domain: String,
    pub default_port: u16,
    pub local_mode: bool,
}

impl Config {
    pub fn new(params: &ConfigParams) -> Result<Self> {
        let mut domain = params.domain.clone();
        if !domain.starts_with('.') {
            domain.insert(0, '.');
        }

        let mut cfg = match &params.path {
            Some(path) => {
                info!(path = %path.display(), "loading config file");
                Self::load(path)?
            }
            None => {
                info!(domain = %domain, "no config file specified, using defaults");
                Config::default()
            }
        };
        cfg.local_mode = params.local_mode;
        cfg.apply_defaults(&domain, params.default_port)?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        Ok(config)
    }

    fn apply_defaults(&mut self, domain: &str, default_port: u16) -> Result<()> {
        if self.host.web_api.is_empty() {
            self.host.web_api = format!("mirage{domain}");
        }
        if self.host.reverse_proxy_suffix.is_empty() {
            self.host.reverse_proxy_suffix = domain.to_string();
        }
        if self.listen.foreign_address.is_empty() {
            self.listen.foreign_address = "0.0.0.0".to_string();
        }
        if self.listen.http.is_empty() {
            self.listen.http = vec![PortMap {
                name: default_port_name(),
                listen: 80,
                target: default_port,
                require_auth_cookie: false,
            }];
        }

        if !self.parameters.iter().any(|p| p.name == "branch") {
            self.parameters.push(Parameter {
                name: "branch".to_string(),
                env: "GIT_BRANCH".to_string(),
                required: true,
                ..Parameter::default()
            });
        }
        for p in &mut self.parameters {
            if p.env.is_empty() {
                p.env = p.name.to_uppercase();
            }
            if !p.rule.is_empty() {
                let re = Regex::new(&p.rule)
                    .with_context(|| format!("invalid parameter rule: {}", p.rule))?;
                p.regex = Some(re);
            }
        }

        if let Some(auth) = &mut self.auth {
            auth.finalize();
        }

        if self.local_mode {
            self.network.access_counter_unit = 10;
            self.network.handler_lifetime = LOCAL_HANDLER_LIFETIME_SECS;
        }
        Ok(())
    }
}
