//! Declarative container specification.
//!
//! Specs are read from YAML or JSON (YAML being a superset, a single parser
//! handles both) and validated once before creation. A validated spec is
//! never mutated.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_PATH_ENV;
use crate::error::{Result, StockadeError};
use crate::types::{ContainerId, NamespaceKind, ResourceLimits};

/// Root filesystem layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootfsSpec {
    /// Materialized root image, used as the bottom-most layer.
    #[serde(default)]
    pub image: Option<PathBuf>,
    /// Lower layers, bottom to top. Later entries shadow earlier ones.
    #[serde(default)]
    pub lower: Vec<PathBuf>,
}

impl RootfsSpec {
    /// Returns every read-only layer in bottom-to-top order.
    #[must_use]
    pub fn layers(&self) -> Vec<PathBuf> {
        self.image.iter().chain(self.lower.iter()).cloned().collect()
    }
}

/// Network attachment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkRequest {
    /// Bridge to attach the host-side veth to.
    pub bridge: String,
    /// Fixed address in CIDR notation; pool-assigned when absent.
    #[serde(default)]
    pub static_ip: Option<String>,
}

impl NetworkRequest {
    /// Parses `static_ip`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not valid IPv4 CIDR notation.
    pub fn parsed_static_ip(&self) -> Result<Option<Ipv4Network>> {
        self.static_ip
            .as_deref()
            .map(|raw| {
                raw.parse::<Ipv4Network>().map_err(|e| StockadeError::Config {
                    message: format!("invalid static_ip {raw:?}: {e}"),
                })
            })
            .transpose()
    }
}

/// The process to run inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    /// Program and arguments.
    pub entrypoint: Vec<String>,
    /// Working directory inside the container.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

impl ProcessSpec {
    /// Returns the `PATH` used to resolve the entrypoint.
    #[must_use]
    pub fn search_path(&self) -> &str {
        self.env.get("PATH").map_or(DEFAULT_PATH_ENV, String::as_str)
    }

    /// Returns the environment as `KEY=VALUE` strings, adding a default
    /// `PATH` when none is set.
    #[must_use]
    pub fn env_pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        if !self.env.contains_key("PATH") {
            pairs.push(format!("PATH={DEFAULT_PATH_ENV}"));
        }
        pairs
    }
}

/// Complete declarative description of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerSpec {
    /// Unique container identifier.
    pub id: ContainerId,
    /// Hostname set inside a UTS namespace; defaults to the id.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Root filesystem layers.
    pub rootfs: RootfsSpec,
    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Namespaces to create. Kinds not listed are shared with the host.
    #[serde(default)]
    pub namespaces: BTreeSet<NamespaceKind>,
    /// Optional network attachment.
    #[serde(default)]
    pub network: Option<NetworkRequest>,
    /// Entry process.
    pub process: ProcessSpec,
}

impl ContainerSpec {
    /// Parses a spec from YAML or JSON text and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or fails validation.
    pub fn from_str_validated(text: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(text).map_err(|e| StockadeError::Config {
            message: format!("cannot parse container spec: {e}"),
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Reads, parses, and validates a spec file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StockadeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_str_validated(&text)
    }

    /// Returns the hostname for the UTS namespace.
    #[must_use]
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or_else(|| self.id.as_str())
    }

    /// Returns whether the given namespace was requested.
    #[must_use]
    pub fn isolates(&self, kind: NamespaceKind) -> bool {
        self.namespaces.contains(&kind)
    }

    /// Checks structural rules that do not depend on host policy.
    ///
    /// Limit ranges are policy and are checked by the cgroup controller.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(StockadeError::Config { message });

        if self.rootfs.layers().is_empty() {
            return invalid(format!("{}: rootfs needs at least one layer", self.id));
        }
        if self.process.entrypoint.is_empty() || self.process.entrypoint[0].is_empty() {
            return invalid(format!("{}: process.entrypoint is empty", self.id));
        }
        if !self.process.cwd.is_absolute() {
            return invalid(format!(
                "{}: process.cwd must be absolute, got {}",
                self.id,
                self.process.cwd.display()
            ));
        }
        if let Some(key) = self
            .process
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return invalid(format!("{}: invalid environment key {key:?}", self.id));
        }
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() || hostname.len() > 64 {
                return invalid(format!("{}: hostname must be 1-64 bytes", self.id));
            }
        }
        if let Some(network) = &self.network {
            if network.bridge.is_empty() {
                return invalid(format!("{}: network.bridge is empty", self.id));
            }
            if !self.isolates(NamespaceKind::Net) {
                return invalid(format!(
                    "{}: network attachment requires the net namespace",
                    self.id
                ));
            }
            let _ = network.parsed_static_ip()?;
        }
        Ok(())
    }
}
