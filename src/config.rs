//! YAML configuration.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ha::{HaError, HaServiceConfig};

fn default_gateway_path() -> String {
    "gateway".into()
}

fn default_external_scheme() -> String {
    "http".into()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct GatewayConfig {
    /// Proxy listener, `host:port`.
    pub listen: String,
    #[serde(default)]
    pub health_listen: Option<String>,
    #[serde(default = "default_gateway_path")]
    pub gateway_path: String,
    #[serde(default = "default_external_scheme")]
    pub external_scheme: String,
    pub topologies: Vec<TopologyConfig>,
    /// Directory relative paths resolve against. Set by [`GatewayConfig::load_from_file`].
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct TopologyConfig {
    pub name: String,
    /// Ambient values visible to every rewrite rule.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Trusted header carrying the authenticated principal.
    #[serde(default)]
    pub principal_header: Option<String>,
    #[serde(default)]
    pub hostmap: Option<HostMapConfig>,
    /// Rule descriptor files.
    #[serde(default)]
    pub rules: Vec<PathBuf>,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum HostMapConfig {
    File { file: PathBuf },
    Inline(BTreeMap<String, String>),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct ServiceConfig {
    pub role: String,
    /// Path prefix under `/{gateway_path}/{topology}`.
    pub path: String,
    pub urls: Vec<String>,
    #[serde(default)]
    pub ha: Option<HaParams>,
    /// Name of the OUT rule for `Location` headers of this service.
    #[serde(default)]
    pub response_rule: Option<String>,
}

/// HA parameters, either `key=value;key=value` or a YAML map.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum HaParams {
    Inline(String),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl HaParams {
    pub fn to_config(&self) -> Result<HaServiceConfig, HaError> {
        match self {
            HaParams::Inline(params) => HaServiceConfig::from_param_string(params),
            HaParams::Map(map) => {
                let mut pairs = Vec::with_capacity(map.len());
                for (key, value) in map {
                    pairs.push((key.as_str(), scalar(key, value)?));
                }
                HaServiceConfig::from_params(pairs)
            }
        }
    }
}

impl ServiceConfig {
    /// HA settings of the service; HA is off without an `ha` block.
    pub fn ha_config(&self) -> Result<HaServiceConfig, HaError> {
        match &self.ha {
            Some(params) => params.to_config(),
            None => Ok(HaServiceConfig::disabled()),
        }
    }
}

fn scalar(key: &str, value: &serde_yaml::Value) -> Result<String, HaError> {
    use serde_yaml::Value;
    match value {
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Sequence(items) => {
            let parts = items
                .iter()
                .map(|item| scalar(key, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(parts.join(","))
        }
        _ => Err(HaError::InvalidConfig {
            key: key.to_string(),
            value: format!("{:?}", value),
        }),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl GatewayConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut cfg = Self::from_yaml(&text)?;
        cfg.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: GatewayConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("`listen` cannot be empty".into()));
        }
        if self.gateway_path.contains('/') || self.gateway_path.trim().is_empty() {
            return Err(ConfigError::Invalid("`gateway_path` must be a single path segment".into()));
        }
        if self.topologies.is_empty() {
            return Err(ConfigError::Invalid("at least one topology is required".into()));
        }
        let mut names = HashSet::new();
        for topology in &self.topologies {
            if topology.name.trim().is_empty() || topology.name.contains('/') {
                return Err(ConfigError::Invalid(format!("invalid topology name `{}`", topology.name)));
            }
            if !names.insert(topology.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate topology `{}`", topology.name)));
            }
            validate_topology(topology)?;
        }
        Ok(())
    }

    /// Resolves `path` against the configuration file's directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

fn validate_topology(topology: &TopologyConfig) -> Result<(), ConfigError> {
    let name = &topology.name;
    if topology.services.is_empty() {
        return Err(ConfigError::Invalid(format!("topology `{}` has no services", name)));
    }
    let mut roles = HashSet::new();
    for service in &topology.services {
        if service.role.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("topology `{}`: service `role` cannot be empty", name)));
        }
        if !roles.insert(service.role.as_str()) {
            return Err(ConfigError::Invalid(format!("topology `{}`: duplicate service `{}`", name, service.role)));
        }
        if !service.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "topology `{}`: `{}.path` must start with '/'",
                name, service.role
            )));
        }
        if service.urls.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "topology `{}`: service `{}` has no URLs",
                name, service.role
            )));
        }
        if let Some(url) = service.urls.iter().find(|u| !is_backend_url(u)) {
            return Err(ConfigError::Invalid(format!(
                "topology `{}`: service `{}` has invalid URL `{}`",
                name, service.role, url
            )));
        }
    }
    Ok(())
}

/// Absolute `http`/`https` URL with a host.
fn is_backend_url(url: &str) -> bool {
    let Ok(uri) = url.trim().parse::<http::Uri>() else {
        return false;
    };
    let scheme_ok = uri
        .scheme_str()
        .is_some_and(|s| s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"));
    scheme_ok && uri.host().is_some_and(|h| !h.is_empty())
}
