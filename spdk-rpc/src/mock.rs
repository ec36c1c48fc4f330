//! In-memory stand-in for the target daemon.
//!
//! [`MockTarget`] keeps enough state to answer every method the reconciler
//! uses and enforces the dependency rules the real daemon does: a bdev
//! claimed by a namespace cannot be deleted, a key bound to a host cannot be
//! removed, a listener needs its transport, and so on. Every call is
//! recorded so tests can assert on ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::client::{Connect, RpcClient};
use crate::error::{Result, RpcError};
use crate::methods::is_read_only;
use crate::types::{
    AnaGroupState, AnaState, Bdev, DISCOVERY_NQN, DriverSpecific, FileBacking, KeyringKey, ListenAddress,
    Listener, NvmfSubsystem, PRODUCT_AIO, PRODUCT_NULL, PRODUCT_URING, SubsystemHost, SubsystemNamespace,
};

const EINVAL: i64 = -22;
const EBUSY: i64 = -16;
const EEXIST: i64 = -17;
const ENODEV: i64 = -19;
const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;

/// One recorded request.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub params: Option<Value>,
}

impl Call {
    /// Look up a top-level parameter.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }

    /// Look up a top-level string parameter.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
struct MockListener {
    address: ListenAddress,
    ana_states: BTreeMap<u32, AnaState>,
}

#[derive(Debug, Clone)]
struct MockSubsystem {
    info: NvmfSubsystem,
    listeners: Vec<MockListener>,
    ana_reporting: bool,
}

impl MockSubsystem {
    fn listener_mut(&mut self, address: &ListenAddress) -> Option<&mut MockListener> {
        self.listeners.iter_mut().find(|l| l.address.same_endpoint(address))
    }

    /// Listing as the daemon reports it. A listener reports a state for each
    /// group it was explicitly set for and each group a namespace uses.
    fn listeners(&self) -> Vec<Listener> {
        let used: BTreeSet<u32> = self.info.namespaces.iter().filter_map(|ns| ns.anagrpid).collect();
        self.listeners
            .iter()
            .map(|l| {
                let groups: BTreeSet<u32> = used.iter().chain(l.ana_states.keys()).copied().collect();
                Listener {
                    address: l.address.clone(),
                    ana_states: groups
                        .into_iter()
                        .map(|g| AnaGroupState {
                            ana_group: g,
                            ana_state: l.ana_states.get(&g).copied().unwrap_or(AnaState::Optimized),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    fn snapshot(&self) -> NvmfSubsystem {
        let mut info = self.info.clone();
        info.listen_addresses = self.listeners.iter().map(|l| l.address.clone()).collect();
        info
    }
}

#[derive(Debug)]
struct State {
    subsystems: BTreeMap<String, MockSubsystem>,
    transports: BTreeSet<String>,
    referrals: Vec<ListenAddress>,
    keys: BTreeMap<String, PathBuf>,
    bdevs: BTreeMap<String, Bdev>,
    calls: Vec<Call>,
    failures: Vec<(String, i64, String)>,
    available: bool,
}

impl Default for State {
    fn default() -> Self {
        let discovery = MockSubsystem {
            info: NvmfSubsystem {
                nqn: DISCOVERY_NQN.to_string(),
                subtype: "Discovery".to_string(),
                listen_addresses: Vec::new(),
                allow_any_host: true,
                hosts: Vec::new(),
                serial_number: None,
                model_number: None,
                min_cntlid: None,
                max_cntlid: None,
                namespaces: Vec::new(),
            },
            listeners: Vec::new(),
            ana_reporting: false,
        };
        Self {
            subsystems: BTreeMap::from([(DISCOVERY_NQN.to_string(), discovery)]),
            transports: BTreeSet::new(),
            referrals: Vec::new(),
            keys: BTreeMap::new(),
            bdevs: BTreeMap::new(),
            calls: Vec::new(),
            failures: Vec::new(),
            available: true,
        }
    }
}

/// Shared handle to an in-memory daemon. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MockTarget {
    state: Arc<Mutex<State>>,
}

fn err(method: &str, code: i64, message: impl Into<String>) -> RpcError {
    RpcError::from_daemon(method, code, message)
}

fn parse<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| err(method, INVALID_PARAMS, format!("Invalid parameters: {e}")))
}

fn ok() -> Result<Value> {
    Ok(Value::Bool(true))
}

#[derive(Deserialize)]
struct NqnParams {
    nqn: String,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct CreateSubsystemParams {
    nqn: String,
    serial_number: String,
    model_number: String,
    #[serde(default)]
    allow_any_host: bool,
    min_cntlid: Option<u16>,
    max_cntlid: Option<u16>,
    #[serde(default)]
    ana_reporting: bool,
}

#[derive(Deserialize)]
struct AllowAnyHostParams {
    nqn: String,
    allow_any_host: bool,
}

#[derive(Deserialize)]
struct TransportParams {
    trtype: String,
}

#[derive(Deserialize)]
struct ListenerParams {
    nqn: String,
    listen_address: ListenAddress,
}

#[derive(Deserialize)]
struct AnaStateParams {
    nqn: String,
    listen_address: ListenAddress,
    ana_state: AnaState,
    anagrpid: u32,
}

#[derive(Deserialize)]
struct HostParams {
    nqn: String,
    host: String,
    dhchap_key: Option<String>,
    dhchap_ctrlr_key: Option<String>,
}

#[derive(Deserialize)]
struct ReferralParams {
    address: ListenAddress,
}

#[derive(Deserialize)]
struct KeyParams {
    name: String,
    path: PathBuf,
}

#[derive(Deserialize)]
struct FileBdevParams {
    name: String,
    filename: String,
    block_size: Option<u32>,
}

#[derive(Deserialize)]
struct NullBdevParams {
    name: String,
    num_blocks: u64,
    block_size: u32,
}

#[derive(Deserialize)]
struct NamespaceSpec {
    bdev_name: String,
    uuid: Option<String>,
    nguid: Option<String>,
    anagrpid: Option<u32>,
    nsid: Option<u32>,
}

#[derive(Deserialize)]
struct AddNsParams {
    nqn: String,
    namespace: NamespaceSpec,
}

#[derive(Deserialize)]
struct RemoveNsParams {
    nqn: String,
    nsid: u32,
}

fn file_blocks(filename: &str, block_size: u32) -> u64 {
    std::fs::metadata(filename)
        .map(|m| m.len() / u64::from(block_size.max(1)))
        .unwrap_or(0)
}

impl State {
    fn subsystem(&self, method: &str, nqn: &str) -> Result<&MockSubsystem> {
        self.subsystems
            .get(nqn)
            .ok_or_else(|| err(method, INVALID_PARAMS, format!("Unable to find subsystem with NQN {nqn}")))
    }

    fn subsystem_mut(&mut self, method: &str, nqn: &str) -> Result<&mut MockSubsystem> {
        self.subsystems
            .get_mut(nqn)
            .ok_or_else(|| err(method, INVALID_PARAMS, format!("Unable to find subsystem with NQN {nqn}")))
    }

    fn bdev_claimed(&self, name: &str) -> bool {
        self.subsystems
            .values()
            .any(|s| s.info.namespaces.iter().any(|ns| ns.bdev_name == name))
    }

    fn key_in_use(&self, name: &str) -> bool {
        self.subsystems.values().any(|s| {
            s.info
                .hosts
                .iter()
                .any(|h| h.dhchap_key.as_deref() == Some(name) || h.dhchap_ctrlr_key.as_deref() == Some(name))
        })
    }

    fn dispatch(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        match method {
            "framework_wait_init" => ok(),

            "nvmf_get_subsystems" => Ok(json!(
                self.subsystems.values().map(MockSubsystem::snapshot).collect::<Vec<_>>()
            )),
            "nvmf_create_subsystem" => {
                let p: CreateSubsystemParams = parse(method, params)?;
                if self.subsystems.contains_key(&p.nqn) {
                    return Err(err(method, EEXIST, format!("Subsystem NQN {} already exists", p.nqn)));
                }
                let subsys = MockSubsystem {
                    info: NvmfSubsystem {
                        nqn: p.nqn.clone(),
                        subtype: "NVMe".to_string(),
                        listen_addresses: Vec::new(),
                        allow_any_host: p.allow_any_host,
                        hosts: Vec::new(),
                        serial_number: Some(p.serial_number),
                        model_number: Some(p.model_number),
                        min_cntlid: Some(p.min_cntlid.unwrap_or(1)),
                        max_cntlid: Some(p.max_cntlid.unwrap_or(65519)),
                        namespaces: Vec::new(),
                    },
                    listeners: Vec::new(),
                    ana_reporting: p.ana_reporting,
                };
                self.subsystems.insert(p.nqn, subsys);
                ok()
            }
            "nvmf_delete_subsystem" => {
                let p: NqnParams = parse(method, params)?;
                if p.nqn == DISCOVERY_NQN {
                    return Err(err(method, EINVAL, "discovery subsystem cannot be deleted"));
                }
                self.subsystem(method, &p.nqn)?;
                self.subsystems.remove(&p.nqn);
                ok()
            }
            "nvmf_subsystem_allow_any_host" => {
                let p: AllowAnyHostParams = parse(method, params)?;
                self.subsystem_mut(method, &p.nqn)?.info.allow_any_host = p.allow_any_host;
                ok()
            }

            "nvmf_get_transports" => Ok(json!(
                self.transports.iter().map(|t| json!({ "trtype": t })).collect::<Vec<_>>()
            )),
            "nvmf_create_transport" => {
                let p: TransportParams = parse(method, params)?;
                if !self.transports.insert(p.trtype.clone()) {
                    return Err(err(method, EEXIST, format!("Transport type '{}' already exists", p.trtype)));
                }
                ok()
            }

            "nvmf_subsystem_add_listener" => {
                let p: ListenerParams = parse(method, params)?;
                if !self.transports.contains(&p.listen_address.trtype) {
                    return Err(err(
                        method,
                        EINVAL,
                        format!("transport {} has not been created", p.listen_address.trtype),
                    ));
                }
                let subsys = self.subsystem_mut(method, &p.nqn)?;
                if subsys.listener_mut(&p.listen_address).is_some() {
                    return Err(err(method, EEXIST, format!("listener {} already added", p.listen_address)));
                }
                subsys.listeners.push(MockListener {
                    address: p.listen_address,
                    ana_states: BTreeMap::new(),
                });
                ok()
            }
            "nvmf_subsystem_remove_listener" => {
                let p: ListenerParams = parse(method, params)?;
                let subsys = self.subsystem_mut(method, &p.nqn)?;
                let before = subsys.listeners.len();
                subsys.listeners.retain(|l| !l.address.same_endpoint(&p.listen_address));
                if subsys.listeners.len() == before {
                    return Err(err(method, ENODEV, format!("listener {} not found", p.listen_address)));
                }
                ok()
            }
            "nvmf_subsystem_get_listeners" => {
                let p: NqnParams = parse(method, params)?;
                Ok(json!(self.subsystem(method, &p.nqn)?.listeners()))
            }
            "nvmf_subsystem_listener_set_ana_state" => {
                let p: AnaStateParams = parse(method, params)?;
                let subsys = self.subsystem_mut(method, &p.nqn)?;
                let listener = subsys
                    .listener_mut(&p.listen_address)
                    .ok_or_else(|| err(method, ENODEV, format!("listener {} not found", p.listen_address)))?;
                listener.ana_states.insert(p.anagrpid, p.ana_state);
                ok()
            }

            "nvmf_subsystem_add_host" => {
                let p: HostParams = parse(method, params)?;
                for key in p.dhchap_key.iter().chain(p.dhchap_ctrlr_key.iter()) {
                    if !self.keys.contains_key(key) {
                        return Err(err(method, EINVAL, format!("key '{key}' is unknown to the keyring")));
                    }
                }
                let subsys = self.subsystem_mut(method, &p.nqn)?;
                if subsys.info.hosts.iter().any(|h| h.nqn == p.host) {
                    return Err(err(method, EEXIST, format!("host {} already allowed", p.host)));
                }
                subsys.info.hosts.push(SubsystemHost {
                    nqn: p.host,
                    dhchap_key: p.dhchap_key,
                    dhchap_ctrlr_key: p.dhchap_ctrlr_key,
                });
                ok()
            }
            "nvmf_subsystem_remove_host" => {
                #[derive(Deserialize)]
                struct RemoveHost {
                    nqn: String,
                    host: String,
                }
                let p: RemoveHost = parse(method, params)?;
                let subsys = self.subsystem_mut(method, &p.nqn)?;
                let before = subsys.info.hosts.len();
                subsys.info.hosts.retain(|h| h.nqn != p.host);
                if subsys.info.hosts.len() == before {
                    return Err(err(method, ENODEV, format!("host {} not found", p.host)));
                }
                ok()
            }

            "nvmf_discovery_get_referrals" => Ok(json!(
                self.referrals.iter().map(|a| json!({ "address": a })).collect::<Vec<_>>()
            )),
            "nvmf_discovery_add_referral" => {
                let p: ReferralParams = parse(method, params)?;
                if self.referrals.iter().any(|a| a.same_endpoint(&p.address)) {
                    return Err(err(method, EEXIST, format!("referral {} already added", p.address)));
                }
                self.referrals.push(p.address);
                ok()
            }
            "nvmf_discovery_remove_referral" => {
                let p: ReferralParams = parse(method, params)?;
                let before = self.referrals.len();
                self.referrals.retain(|a| !a.same_endpoint(&p.address));
                if self.referrals.len() == before {
                    return Err(err(method, ENODEV, format!("referral {} not found", p.address)));
                }
                ok()
            }

            "keyring_get_keys" => Ok(json!(
                self.keys
                    .iter()
                    .map(|(name, path)| KeyringKey {
                        name: name.clone(),
                        path: Some(path.clone()),
                    })
                    .collect::<Vec<_>>()
            )),
            "keyring_file_add_key" => {
                let p: KeyParams = parse(method, params)?;
                if self.keys.contains_key(&p.name) {
                    return Err(err(method, EEXIST, format!("Key '{}' already exists", p.name)));
                }
                check_key_file(method, &p.path)?;
                self.keys.insert(p.name, p.path);
                ok()
            }
            "keyring_file_remove_key" => {
                let p: NameParams = parse(method, params)?;
                if !self.keys.contains_key(&p.name) {
                    return Err(err(method, ENODEV, format!("No such key '{}'", p.name)));
                }
                if self.key_in_use(&p.name) {
                    return Err(err(method, EBUSY, format!("Key '{}' is in use by a host", p.name)));
                }
                self.keys.remove(&p.name);
                ok()
            }

            "bdev_get_bdevs" => Ok(json!(self.bdevs.values().collect::<Vec<_>>())),
            "bdev_aio_create" | "bdev_uring_create" => {
                let p: FileBdevParams = parse(method, params)?;
                if self.bdevs.contains_key(&p.name) {
                    return Err(err(method, EEXIST, format!("bdev {} already exists", p.name)));
                }
                let block_size = p.block_size.unwrap_or(512);
                let backing = Some(FileBacking {
                    filename: p.filename.clone(),
                });
                let (product, driver_specific) = if method == "bdev_aio_create" {
                    (PRODUCT_AIO, DriverSpecific { aio: backing, uring: None })
                } else {
                    (PRODUCT_URING, DriverSpecific { uring: backing, aio: None })
                };
                self.bdevs.insert(
                    p.name.clone(),
                    Bdev {
                        name: p.name,
                        product_name: product.to_string(),
                        block_size,
                        num_blocks: file_blocks(&p.filename, block_size),
                        driver_specific,
                    },
                );
                Ok(json!(true))
            }
            "bdev_null_create" => {
                let p: NullBdevParams = parse(method, params)?;
                if self.bdevs.contains_key(&p.name) {
                    return Err(err(method, EEXIST, format!("bdev {} already exists", p.name)));
                }
                self.bdevs.insert(
                    p.name.clone(),
                    Bdev {
                        name: p.name,
                        product_name: PRODUCT_NULL.to_string(),
                        block_size: p.block_size,
                        num_blocks: p.num_blocks,
                        driver_specific: DriverSpecific::default(),
                    },
                );
                ok()
            }
            "bdev_aio_delete" | "bdev_uring_delete" | "bdev_null_delete" => {
                let p: NameParams = parse(method, params)?;
                self.typed_bdev(method, &p.name)?;
                if self.bdev_claimed(&p.name) {
                    return Err(err(method, EBUSY, format!("bdev {} is claimed by a namespace", p.name)));
                }
                self.bdevs.remove(&p.name);
                ok()
            }
            "bdev_aio_rescan" | "bdev_uring_rescan" => {
                let p: NameParams = parse(method, params)?;
                self.typed_bdev(method, &p.name)?;
                if let Some(bdev) = self.bdevs.get_mut(&p.name) {
                    let filename = bdev
                        .driver_specific
                        .aio
                        .as_ref()
                        .or(bdev.driver_specific.uring.as_ref())
                        .map(|b| b.filename.clone())
                        .unwrap_or_default();
                    bdev.num_blocks = file_blocks(&filename, bdev.block_size);
                }
                ok()
            }

            "nvmf_subsystem_add_ns" => {
                let p: AddNsParams = parse(method, params)?;
                if !self.bdevs.contains_key(&p.namespace.bdev_name) {
                    return Err(err(
                        method,
                        EINVAL,
                        format!("bdev {} cannot be opened, error=-19", p.namespace.bdev_name),
                    ));
                }
                let subsys = self.subsystem_mut(method, &p.nqn)?;
                let used: BTreeSet<u32> = subsys.info.namespaces.iter().map(|ns| ns.nsid).collect();
                let nsid = match p.namespace.nsid {
                    Some(nsid) if used.contains(&nsid) => {
                        return Err(err(method, EINVAL, format!("Requested NSID {nsid} already in use")));
                    }
                    Some(nsid) => nsid,
                    None => (1..).find(|n| !used.contains(n)).unwrap_or(1),
                };
                subsys.info.namespaces.push(SubsystemNamespace {
                    nsid,
                    bdev_name: p.namespace.bdev_name,
                    uuid: p.namespace.uuid,
                    nguid: p.namespace.nguid,
                    anagrpid: p.namespace.anagrpid,
                });
                subsys.info.namespaces.sort_by_key(|ns| ns.nsid);
                Ok(json!(nsid))
            }
            "nvmf_subsystem_remove_ns" => {
                let p: RemoveNsParams = parse(method, params)?;
                let subsys = self.subsystem_mut(method, &p.nqn)?;
                let before = subsys.info.namespaces.len();
                subsys.info.namespaces.retain(|ns| ns.nsid != p.nsid);
                if subsys.info.namespaces.len() == before {
                    return Err(err(method, ENODEV, format!("Unable to find namespace {}", p.nsid)));
                }
                ok()
            }

            _ => Err(err(method, METHOD_NOT_FOUND, "Method not implemented")),
        }
    }

    /// The bdev exists and its product matches the method's driver.
    fn typed_bdev(&self, method: &str, name: &str) -> Result<&Bdev> {
        let bdev = self
            .bdevs
            .get(name)
            .ok_or_else(|| err(method, ENODEV, format!("No such device: {name}")))?;
        let product = match method.split('_').nth(1) {
            Some("aio") => PRODUCT_AIO,
            Some("uring") => PRODUCT_URING,
            _ => PRODUCT_NULL,
        };
        if bdev.product_name != product {
            return Err(err(method, EINVAL, format!("bdev {name} is a {}", bdev.product_name)));
        }
        Ok(bdev)
    }
}

/// The daemon refuses key files it cannot read or that others can read.
fn check_key_file(method: &str, path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| err(method, EINVAL, format!("Could not stat key file '{}': {e}", path.display())))?;
    if meta.permissions().mode() & 0o077 != 0 {
        return Err(err(
            method,
            EINVAL,
            format!("Invalid permissions for key file '{}'", path.display()),
        ));
    }
    Ok(())
}

impl MockTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make connects fail and in-flight clients see a closed connection.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Fail the next call of `method` with a structured daemon error.
    pub fn fail_next(&self, method: &str, code: i64, message: &str) {
        self.lock()
            .failures
            .push((method.to_string(), code, message.to_string()));
    }

    /// All recorded calls, reads included.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Recorded calls that change daemon state.
    pub fn mutations(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| !is_read_only(&c.method))
            .cloned()
            .collect()
    }

    /// Method names of [`MockTarget::mutations`], in order.
    pub fn mutation_methods(&self) -> Vec<String> {
        self.mutations().into_iter().map(|c| c.method).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn subsystem(&self, nqn: &str) -> Option<NvmfSubsystem> {
        self.lock().subsystems.get(nqn).map(MockSubsystem::snapshot)
    }

    pub fn subsystem_nqns(&self) -> Vec<String> {
        self.lock().subsystems.keys().cloned().collect()
    }

    /// Whether the subsystem was created with ANA reporting.
    pub fn ana_reporting(&self, nqn: &str) -> Option<bool> {
        self.lock().subsystems.get(nqn).map(|s| s.ana_reporting)
    }

    pub fn listeners(&self, nqn: &str) -> Vec<Listener> {
        self.lock()
            .subsystems
            .get(nqn)
            .map(MockSubsystem::listeners)
            .unwrap_or_default()
    }

    pub fn transports(&self) -> Vec<String> {
        self.lock().transports.iter().cloned().collect()
    }

    pub fn referrals(&self) -> Vec<ListenAddress> {
        self.lock().referrals.clone()
    }

    pub fn keys(&self) -> BTreeMap<String, PathBuf> {
        self.lock().keys.clone()
    }

    pub fn bdevs(&self) -> Vec<Bdev> {
        self.lock().bdevs.values().cloned().collect()
    }

    pub fn bdev(&self, name: &str) -> Option<Bdev> {
        self.lock().bdevs.get(name).cloned()
    }
}

impl RpcClient for MockTarget {
    fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        let mut state = self.lock();
        if !state.available {
            return Err(RpcError::Closed {
                method: method.to_string(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "mock daemon stopped"),
            });
        }
        state.calls.push(Call {
            method: method.to_string(),
            params: params.clone(),
        });
        if let Some(pos) = state.failures.iter().position(|(m, _, _)| m == method) {
            let (_, code, message) = state.failures.remove(pos);
            return Err(err(method, code, message));
        }
        state.dispatch(method, params)
    }
}

impl Connect for MockTarget {
    type Client = MockTarget;

    fn connect(&self) -> Result<MockTarget> {
        if !self.lock().available {
            return Err(RpcError::Unavailable {
                path: PathBuf::from("mock"),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "mock daemon stopped"),
            });
        }
        Ok(self.clone())
    }

    fn endpoint_present(&self) -> bool {
        self.lock().available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::{AddHost, CreateSubsystem, CreateTransport, NamespaceParams, SpdkRpc};

    fn subsystem(nqn: &str) -> CreateSubsystem {
        CreateSubsystem {
            nqn: nqn.into(),
            serial_number: "serial".into(),
            model_number: "model".into(),
            allow_any_host: false,
            min_cntlid: None,
            max_cntlid: None,
            ana_reporting: None,
        }
    }

    fn ns(bdev: &str) -> NamespaceParams {
        NamespaceParams {
            bdev_name: bdev.into(),
            uuid: None,
            nguid: None,
            anagrpid: Some(1),
            nsid: None,
        }
    }

    #[test]
    fn test_discovery_present_and_protected() {
        let mut mock = MockTarget::new();
        let subs = mock.nvmf_get_subsystems().unwrap();
        assert_eq!(subs.len(), 1);
        assert!(subs[0].is_discovery());
        assert!(mock.nvmf_delete_subsystem(DISCOVERY_NQN).is_err());
    }

    #[test]
    fn test_listener_requires_transport() {
        let mut mock = MockTarget::new();
        let addr = ListenAddress::new("TCP", "IPv4", "10.0.0.1", "4420");
        assert!(mock.nvmf_subsystem_add_listener(DISCOVERY_NQN, &addr).is_err());
        mock.nvmf_create_transport(&CreateTransport::with_defaults("TCP")).unwrap();
        mock.nvmf_subsystem_add_listener(DISCOVERY_NQN, &addr).unwrap();
        assert_eq!(mock.listeners(DISCOVERY_NQN).len(), 1);
    }

    #[test]
    fn test_claimed_bdev_cannot_be_deleted() {
        let mut mock = MockTarget::new();
        mock.nvmf_create_subsystem(&subsystem("nqn.s")).unwrap();
        mock.bdev_null_create("NULL:ZVOL:tank/v", 1, 4096).unwrap();
        assert_eq!(mock.nvmf_subsystem_add_ns("nqn.s", &ns("NULL:ZVOL:tank/v")).unwrap(), 1);
        let err = mock.bdev_null_delete("NULL:ZVOL:tank/v").unwrap_err();
        assert!(!err.is_not_found());
        mock.nvmf_subsystem_remove_ns("nqn.s", 1).unwrap();
        mock.bdev_null_delete("NULL:ZVOL:tank/v").unwrap();
    }

    #[test]
    fn test_nsid_assignment_and_conflict() {
        let mut mock = MockTarget::new();
        mock.nvmf_create_subsystem(&subsystem("nqn.s")).unwrap();
        mock.bdev_null_create("a", 1, 4096).unwrap();
        mock.bdev_null_create("b", 1, 4096).unwrap();
        let mut fixed = ns("a");
        fixed.nsid = Some(1);
        mock.nvmf_subsystem_add_ns("nqn.s", &fixed).unwrap();
        let mut clash = ns("b");
        clash.nsid = Some(1);
        assert!(mock.nvmf_subsystem_add_ns("nqn.s", &clash).is_err());
        assert_eq!(mock.nvmf_subsystem_add_ns("nqn.s", &ns("b")).unwrap(), 2);
    }

    #[test]
    fn test_key_bound_to_host_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k");
        std::fs::write(&path, "secret").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let mut mock = MockTarget::new();
        mock.nvmf_create_subsystem(&subsystem("nqn.s")).unwrap();
        mock.keyring_file_add_key("k1", path.to_str().unwrap()).unwrap();
        mock.nvmf_subsystem_add_host(&AddHost {
            nqn: "nqn.s".into(),
            host: "nqn.h".into(),
            dhchap_key: Some("k1".into()),
            dhchap_ctrlr_key: None,
        })
        .unwrap();
        assert!(mock.keyring_file_remove_key("k1").is_err());
        mock.nvmf_subsystem_remove_host("nqn.s", "nqn.h").unwrap();
        mock.keyring_file_remove_key("k1").unwrap();
        assert!(mock.keyring_file_remove_key("k1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_world_readable_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k");
        std::fs::write(&path, "secret").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let mut mock = MockTarget::new();
        assert!(mock.keyring_file_add_key("k1", path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_ana_state_defaults_and_updates() {
        let mut mock = MockTarget::new();
        mock.nvmf_create_transport(&CreateTransport::with_defaults("TCP")).unwrap();
        mock.nvmf_create_subsystem(&subsystem("nqn.s")).unwrap();
        let addr = ListenAddress::new("TCP", "IPv4", "10.0.0.1", "9420");
        mock.nvmf_subsystem_add_listener("nqn.s", &addr).unwrap();
        assert_eq!(mock.listeners("nqn.s")[0].ana_state(2), None);
        mock.nvmf_subsystem_listener_set_ana_state("nqn.s", &addr, AnaState::Inaccessible, 2)
            .unwrap();
        assert_eq!(mock.listeners("nqn.s")[0].ana_state(2), Some(AnaState::Inaccessible));
    }

    #[test]
    fn test_unavailable_and_injected_failures() {
        let mock = MockTarget::new();
        mock.fail_next("nvmf_get_transports", -32603, "Internal error");
        let mut client = mock.connect().unwrap();
        assert!(client.nvmf_get_transports().is_err());
        assert!(client.nvmf_get_transports().unwrap().is_empty());

        mock.set_available(false);
        assert!(!mock.endpoint_present());
        assert!(mock.connect().unwrap_err().is_unavailable());
        assert!(client.nvmf_get_transports().unwrap_err().is_unavailable());
    }

    #[test]
    fn test_mutations_exclude_reads() {
        let mut mock = MockTarget::new();
        mock.nvmf_get_subsystems().unwrap();
        mock.nvmf_create_transport(&CreateTransport::with_defaults("TCP")).unwrap();
        assert_eq!(mock.calls().len(), 2);
        assert_eq!(mock.mutation_methods(), vec!["nvmf_create_transport"]);
    }
}
