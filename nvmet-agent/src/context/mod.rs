//! The immutable snapshot a reconcile runs against.
//!
//! [`RenderContext::new`] combines the declared [`TargetConfig`] with the
//! node's [`Environment`] and rejects configurations that cannot be applied
//! before any daemon call is made.

mod rules;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{NvmetError, Result};

pub use rules::{
    ANA_PORT_INDEX_OFFSET, AnaUsage, NODE_A_MAX_CNTLID, NODE_B_MIN_CNTLID, PortUsage,
};
pub use types::*;

/// Highest index an administrator may assign; higher indexes are ANA offsets.
pub const MAX_PORT_INDEX: u32 = ANA_PORT_INDEX_OFFSET - 1;

const MAX_NQN_LEN: usize = 223;

static SERIAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,20}$").expect("Invalid regex pattern"));

#[derive(Debug, Clone)]
pub struct RenderContext {
    config: TargetConfig,
    env: Environment,
}

fn invalid(msg: String) -> NvmetError {
    NvmetError::InvalidConfig(msg)
}

/// Validate an NQN (subsystem or host).
fn validate_nqn(nqn: &str, field_name: &str) -> Result<()> {
    if nqn.is_empty() {
        return Err(invalid(format!("{} cannot be empty", field_name)));
    }
    if nqn.len() > MAX_NQN_LEN {
        return Err(invalid(format!(
            "{} '{}' exceeds maximum length of {} characters",
            field_name, nqn, MAX_NQN_LEN
        )));
    }
    if !nqn.starts_with("nqn.") {
        return Err(invalid(format!("{} '{}' must start with 'nqn.'", field_name, nqn)));
    }
    if !nqn
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err(invalid(format!("{} '{}' contains invalid characters", field_name, nqn)));
    }
    Ok(())
}

impl RenderContext {
    /// Build and validate a context. ZVOL device paths are normalized to
    /// dataset names.
    pub fn new(mut config: TargetConfig, env: Environment) -> Result<Self> {
        for ns in &mut config.namespaces {
            ns.device_path = normalize_device_path(ns.device_type, &ns.device_path);
        }
        let ctx = Self { config, env };
        ctx.validate()?;
        Ok(ctx)
    }

    fn validate(&self) -> Result<()> {
        self.validate_subsystems()?;
        self.validate_hosts()?;
        self.validate_ports()?;
        self.validate_associations()?;
        self.validate_namespaces()
    }

    fn validate_subsystems(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for subsys in &self.config.subsystems {
            validate_nqn(&subsys.subnqn, "subsystem NQN")?;
            if subsys.subnqn == spdk_rpc::DISCOVERY_NQN {
                return Err(invalid("the discovery NQN cannot be declared as a subsystem".into()));
            }
            if !SERIAL_RE.is_match(&subsys.serial) {
                return Err(invalid(format!(
                    "serial '{}' of {} must be 1-20 alphanumeric characters",
                    subsys.serial, subsys.subnqn
                )));
            }
            if !seen.insert(subsys.subnqn.as_str()) {
                return Err(invalid(format!("duplicate subsystem NQN {}", subsys.subnqn)));
            }
        }
        Ok(())
    }

    fn validate_hosts(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for host in &self.config.hosts {
            validate_nqn(&host.hostnqn, "host NQN")?;
            if !seen.insert(host.hostnqn.as_str()) {
                return Err(invalid(format!("duplicate host NQN {}", host.hostnqn)));
            }
            for secret in host.dhchap_key.iter().chain(host.dhchap_ctrl_key.iter()) {
                if secret.is_empty() || secret.contains('\n') {
                    return Err(invalid(format!("malformed DH-CHAP secret for {}", host.hostnqn)));
                }
            }
        }
        Ok(())
    }

    fn validate_ports(&self) -> Result<()> {
        let mut indexes = BTreeSet::new();
        let mut plain_addrs = BTreeMap::new();
        let mut ana_addrs = BTreeMap::new();
        for port in &self.config.ports {
            if !(1..=MAX_PORT_INDEX).contains(&port.index) {
                return Err(invalid(format!(
                    "port index {} outside 1..={}",
                    port.index, MAX_PORT_INDEX
                )));
            }
            if !indexes.insert(port.index) {
                return Err(invalid(format!("duplicate port index {}", port.index)));
            }
            if port.addr_traddr.is_empty() || port.addr_trsvcid.parse::<u16>().is_err() {
                return Err(invalid(format!(
                    "port {} has an invalid address {}:{}",
                    port.index, port.addr_traddr, port.addr_trsvcid
                )));
            }

            let usage = self.port_usage(port);
            if usage.plain {
                let triple = (port.addr_trtype, port.addr_traddr.clone(), port.addr_trsvcid.clone());
                if let Some(other) = plain_addrs.insert(triple, port.index) {
                    return Err(invalid(format!(
                        "ports {} and {} share the address {}:{}:{}",
                        other, port.index, port.addr_trtype, port.addr_traddr, port.addr_trsvcid
                    )));
                }
            }
            if usage.ana {
                let traddr = match (self.env.failover.node, self.ana_address(port)) {
                    (Some(_), None) => {
                        return Err(invalid(format!(
                            "ANA port {} address {} has no valid node address pair for {}",
                            port.index, port.addr_traddr, port.addr_trtype
                        )));
                    }
                    (_, addr) => addr.unwrap_or_else(|| port.addr_traddr.clone()),
                };
                let triple = (port.addr_trtype, traddr, port.addr_trsvcid.clone());
                if let Some(other) = ana_addrs.insert(triple, port.index) {
                    return Err(invalid(format!(
                        "ANA ports {} and {} resolve to the same address",
                        other, port.index
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_associations(&self) -> Result<()> {
        for assoc in &self.config.port_subsys {
            if self.port(assoc.port).is_none() {
                return Err(invalid(format!(
                    "port association references unknown port {}",
                    assoc.port
                )));
            }
            if self.subsystem(&assoc.subsys).is_none() {
                return Err(invalid(format!(
                    "port association references unknown subsystem {}",
                    assoc.subsys
                )));
            }
        }
        for assoc in &self.config.host_subsys {
            if self.host(&assoc.host).is_none() {
                return Err(invalid(format!(
                    "host association references unknown host {}",
                    assoc.host
                )));
            }
            if self.subsystem(&assoc.subsys).is_none() {
                return Err(invalid(format!(
                    "host association references unknown subsystem {}",
                    assoc.subsys
                )));
            }
        }
        Ok(())
    }

    fn validate_namespaces(&self) -> Result<()> {
        let mut backings = BTreeSet::new();
        let mut nsids = BTreeSet::new();
        for ns in &self.config.namespaces {
            if self.subsystem(&ns.subsys).is_none() {
                return Err(invalid(format!(
                    "namespace {} references unknown subsystem {}",
                    ns.device_path, ns.subsys
                )));
            }
            match ns.device_type {
                DeviceType::Zvol => {
                    if ns.device_path.is_empty() || ns.device_path.starts_with('/') || ns.device_path.contains("..") {
                        return Err(invalid(format!("invalid ZVOL dataset '{}'", ns.device_path)));
                    }
                }
                DeviceType::File => {
                    if !ns.device_path.starts_with('/') || ns.device_path.starts_with("/dev/zvol/") {
                        return Err(invalid(format!(
                            "FILE namespace path '{}' must be an absolute file path",
                            ns.device_path
                        )));
                    }
                }
            }
            if !backings.insert((ns.device_type, ns.device_path.as_str())) {
                return Err(invalid(format!(
                    "{} {} is used by more than one namespace",
                    ns.device_type, ns.device_path
                )));
            }
            if let Some(nsid) = ns.nsid {
                if nsid == 0 {
                    return Err(invalid(format!("namespace {} has nsid 0", ns.device_path)));
                }
                if !nsids.insert((ns.subsys.as_str(), nsid)) {
                    return Err(invalid(format!("duplicate nsid {} in {}", nsid, ns.subsys)));
                }
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn subsystems(&self) -> &[Subsystem] {
        &self.config.subsystems
    }

    pub fn ports(&self) -> &[Port] {
        &self.config.ports
    }

    pub fn hosts(&self) -> &[Host] {
        &self.config.hosts
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.config.namespaces
    }

    pub fn port_subsys(&self) -> &[PortSubsys] {
        &self.config.port_subsys
    }

    pub fn host_subsys(&self) -> &[HostSubsys] {
        &self.config.host_subsys
    }

    pub fn subsystem(&self, nqn: &str) -> Option<&Subsystem> {
        self.config.subsystems.iter().find(|s| s.subnqn == nqn)
    }

    pub fn port(&self, index: u32) -> Option<&Port> {
        self.config.ports.iter().find(|p| p.index == index)
    }

    pub fn host(&self, hostnqn: &str) -> Option<&Host> {
        self.config.hosts.iter().find(|h| h.hostnqn == hostnqn)
    }

    /// Dataset recordsize recorded for a FILE path.
    pub fn recordsize(&self, path: &str) -> Option<u32> {
        self.env.recordsize.get(path).copied()
    }

    /// A copy of this context with one namespace's `locked` flag replaced.
    /// The namespace is matched by subsystem and backing.
    pub fn with_namespace_locked(&self, ns: &Namespace, locked: bool) -> RenderContext {
        let mut ctx = self.clone();
        for entry in &mut ctx.config.namespaces {
            if entry.same_backing(ns) {
                entry.locked = locked;
            }
        }
        ctx
    }
}
