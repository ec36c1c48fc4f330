//! Declarative target configuration and the environmental facts a
//! reconcile depends on.
//!
//! Both halves deserialize from JSON; [`super::RenderContext::new`] checks
//! the cross-record invariants.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NvmetError, Result};

// ============================================================================
// Enumerations
// ============================================================================

/// Fabric transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Trtype {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "RDMA")]
    Rdma,
}

impl Trtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trtype::Tcp => "TCP",
            Trtype::Rdma => "RDMA",
        }
    }
}

impl Display for Trtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "IPv4", alias = "IPV4")]
    Ipv4,
    #[serde(rename = "IPv6", alias = "IPV6")]
    Ipv6,
}

impl AddressFamily {
    /// Spelling the daemon expects in `adrfam`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "IPv4",
            AddressFamily::Ipv6 => "IPv6",
        }
    }
}

/// Kind of storage backing a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    Zvol,
    File,
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Zvol => write!(f, "ZVOL"),
            DeviceType::File => write!(f, "FILE"),
        }
    }
}

/// HA role of this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailoverStatus {
    #[default]
    Single,
    Master,
    Backup,
}

/// Which controller of an HA pair this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    A,
    B,
}

/// Asynchronous I/O engine used for ZVOL-backed bdevs.
///
/// Fixed per deployment: create, delete and rescan all follow the live
/// bdev's engine, so switching only affects bdevs created afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BdevEngine {
    #[default]
    Uring,
    Aio,
}

impl FromStr for BdevEngine {
    type Err = NvmetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "uring" => Ok(BdevEngine::Uring),
            "aio" => Ok(BdevEngine::Aio),
            _ => Err(NvmetError::InvalidConfig(format!(
                "unknown bdev engine '{}': expected uring or aio",
                s
            ))),
        }
    }
}

impl Display for BdevEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BdevEngine::Uring => write!(f, "uring"),
            BdevEngine::Aio => write!(f, "aio"),
        }
    }
}

// ============================================================================
// Declarative records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subsystem {
    pub subnqn: String,
    pub serial: String,
    #[serde(default)]
    pub allow_any_host: bool,
    /// `None` inherits the global ANA flag.
    #[serde(default)]
    pub ana: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub index: u32,
    pub addr_trtype: Trtype,
    pub addr_adrfam: AddressFamily,
    pub addr_traddr: String,
    pub addr_trsvcid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub hostnqn: String,
    #[serde(default)]
    pub dhchap_key: Option<String>,
    #[serde(default)]
    pub dhchap_ctrl_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(default)]
    pub nsid: Option<u32>,
    /// NQN of the owning subsystem.
    pub subsys: String,
    pub device_type: DeviceType,
    /// Dataset name for ZVOL, absolute path for FILE.
    pub device_path: String,
    pub device_uuid: Uuid,
    pub device_nguid: Uuid,
    #[serde(default)]
    pub locked: bool,
}

impl Namespace {
    /// True when both records name the same backing in the same subsystem.
    pub fn same_backing(&self, other: &Namespace) -> bool {
        self.subsys == other.subsys
            && self.device_type == other.device_type
            && normalize_device_path(self.device_type, &self.device_path)
                == normalize_device_path(other.device_type, &other.device_path)
    }
}

/// ZVOL paths may be given with the `zvol/` prefix of their device node.
pub fn normalize_device_path(device_type: DeviceType, path: &str) -> String {
    match device_type {
        DeviceType::Zvol => path.strip_prefix("zvol/").unwrap_or(path).to_string(),
        DeviceType::File => path.to_string(),
    }
}

/// "This subsystem listens on this port", by port index and subsystem NQN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSubsys {
    pub port: u32,
    pub subsys: String,
}

/// "This host may connect to this subsystem", by NQNs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSubsys {
    pub host: String,
    pub subsys: String,
}

/// The declarative half of a reconcile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub subsystems: Vec<Subsystem>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default)]
    pub port_subsys: Vec<PortSubsys>,
    #[serde(default)]
    pub host_subsys: Vec<HostSubsys>,
}

// ============================================================================
// Environment
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Failover {
    #[serde(default)]
    pub licensed: bool,
    #[serde(default)]
    pub status: FailoverStatus,
    #[serde(default)]
    pub node: Option<Node>,
}

pub const DEFAULT_MODEL: &str = "NVMe-oF Target";

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

/// Facts about the node that are not part of the declared configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub failover: Failover,
    #[serde(default)]
    pub ana_enabled: bool,
    /// Per transport, `traddr` to an `"addrA/addrB"` pair of node addresses.
    #[serde(default)]
    pub address_choices: BTreeMap<Trtype, BTreeMap<String, String>>,
    /// Dataset recordsize by FILE path.
    #[serde(default)]
    pub recordsize: BTreeMap<String, u32>,
    /// Sent as `model_number` when creating subsystems.
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            failover: Failover::default(),
            ana_enabled: false,
            address_choices: BTreeMap::new(),
            recordsize: BTreeMap::new(),
            model: default_model(),
        }
    }
}
