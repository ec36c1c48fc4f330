//! Wire types for the target daemon's JSON-RPC responses and requests.
//!
//! Only the fields the reconciler consumes are modelled; unknown fields in
//! daemon responses are ignored.

use std::fmt::{self, Display};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// NQN of the daemon's built-in discovery subsystem.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// `product_name` reported for io_uring backed bdevs.
pub const PRODUCT_URING: &str = "URING bdev";
/// `product_name` reported for libaio backed bdevs.
pub const PRODUCT_AIO: &str = "AIO disk";
/// `product_name` reported for null bdevs.
pub const PRODUCT_NULL: &str = "Null disk";

// ============================================================================
// Listen addresses
// ============================================================================

/// A transport endpoint as the daemon reports and accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenAddress {
    pub trtype: String,
    #[serde(default)]
    pub adrfam: String,
    pub traddr: String,
    #[serde(default)]
    pub trsvcid: String,
}

impl ListenAddress {
    pub fn new(
        trtype: impl Into<String>,
        adrfam: impl Into<String>,
        traddr: impl Into<String>,
        trsvcid: impl Into<String>,
    ) -> Self {
        Self {
            trtype: trtype.into(),
            adrfam: adrfam.into(),
            traddr: traddr.into(),
            trsvcid: trsvcid.into(),
        }
    }

    /// True when both addresses name the same endpoint. The address family
    /// is implied by `traddr` and is not compared.
    pub fn same_endpoint(&self, other: &ListenAddress) -> bool {
        self.trtype == other.trtype && self.traddr == other.traddr && self.trsvcid == other.trsvcid
    }
}

/// Formats as `{trtype}:{traddr}:{trsvcid}`.
impl Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.trtype, self.traddr, self.trsvcid)
    }
}

// ============================================================================
// Subsystems
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvmfSubsystem {
    pub nqn: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub listen_addresses: Vec<ListenAddress>,
    #[serde(default)]
    pub allow_any_host: bool,
    #[serde(default)]
    pub hosts: Vec<SubsystemHost>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub min_cntlid: Option<u16>,
    #[serde(default)]
    pub max_cntlid: Option<u16>,
    #[serde(default)]
    pub namespaces: Vec<SubsystemNamespace>,
}

impl NvmfSubsystem {
    pub fn is_discovery(&self) -> bool {
        self.nqn == DISCOVERY_NQN
    }
}

/// A host allowed on a subsystem, with the keyring names bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemHost {
    pub nqn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhchap_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhchap_ctrlr_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemNamespace {
    pub nsid: u32,
    pub bdev_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nguid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anagrpid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmfTransport {
    pub trtype: String,
}

// ============================================================================
// Listeners and ANA
// ============================================================================

/// Asymmetric Namespace Access state of a listener for one ANA group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnaState {
    Optimized,
    NonOptimized,
    Inaccessible,
    PersistentLoss,
    Change,
}

impl Display for AnaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnaState::Optimized => "optimized",
            AnaState::NonOptimized => "non_optimized",
            AnaState::Inaccessible => "inaccessible",
            AnaState::PersistentLoss => "persistent_loss",
            AnaState::Change => "change",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnaGroupState {
    pub ana_group: u32,
    pub ana_state: AnaState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub address: ListenAddress,
    #[serde(default)]
    pub ana_states: Vec<AnaGroupState>,
}

impl Listener {
    /// Current state of the listener for `anagrpid`, if the daemon reports one.
    pub fn ana_state(&self, anagrpid: u32) -> Option<AnaState> {
        self.ana_states
            .iter()
            .find(|s| s.ana_group == anagrpid)
            .map(|s| s.ana_state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referral {
    pub address: ListenAddress,
}

// ============================================================================
// Keyring
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringKey {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ============================================================================
// Block devices
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBacking {
    pub filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSpecific {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uring: Option<FileBacking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aio: Option<FileBacking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bdev {
    pub name: String,
    pub product_name: String,
    #[serde(default)]
    pub block_size: u32,
    #[serde(default)]
    pub num_blocks: u64,
    #[serde(default)]
    pub driver_specific: DriverSpecific,
}

/// The backing of a bdev, classified from its product name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BdevBacking {
    Uring { filename: String },
    Aio { filename: String },
    Null,
    /// A product this client does not manage, or one missing its filename.
    Other,
}

impl Bdev {
    pub fn backing(&self) -> BdevBacking {
        let ds = &self.driver_specific;
        match self.product_name.as_str() {
            PRODUCT_URING => match &ds.uring {
                Some(b) => BdevBacking::Uring {
                    filename: b.filename.clone(),
                },
                None => BdevBacking::Other,
            },
            PRODUCT_AIO => match &ds.aio {
                Some(b) => BdevBacking::Aio {
                    filename: b.filename.clone(),
                },
                None => BdevBacking::Other,
            },
            PRODUCT_NULL => BdevBacking::Null,
            _ => BdevBacking::Other,
        }
    }
}
