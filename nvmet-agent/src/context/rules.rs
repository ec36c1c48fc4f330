//! Visibility, ANA and port indexing rules shared by every reconciler.

use spdk_rpc::{AnaState, ListenAddress};

use super::RenderContext;
use super::types::{FailoverStatus, Node, Port, PortSubsys, Subsystem};

/// ANA listeners use the declared port index plus this offset.
pub const ANA_PORT_INDEX_OFFSET: u32 = 5000;
/// Node A hands out controller IDs up to this value.
pub const NODE_A_MAX_CNTLID: u16 = 31999;
/// Node B hands out controller IDs from this value.
pub const NODE_B_MIN_CNTLID: u16 = 32000;

/// Which listener flavours a port needs on this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortUsage {
    /// Listen on the declared address under the declared index.
    pub plain: bool,
    /// Listen on the node's resolved address under the offset index.
    pub ana: bool,
}

/// Whether a listener belongs to an ANA or a plain port index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnaUsage {
    Plain,
    Ana,
}

impl RenderContext {
    pub fn status(&self) -> FailoverStatus {
        self.env.failover.status
    }

    pub fn node(&self) -> Option<Node> {
        self.env.failover.node
    }

    pub fn is_backup(&self) -> bool {
        self.env.failover.status == FailoverStatus::Backup
    }

    pub fn ha_licensed(&self) -> bool {
        self.env.failover.licensed
    }

    /// On `BACKUP` only ANA subsystems are exposed.
    pub fn subsys_visible(&self, subsys: &Subsystem) -> bool {
        match self.status() {
            FailoverStatus::Single | FailoverStatus::Master => true,
            FailoverStatus::Backup => self.subsys_ana(subsys),
        }
    }

    pub fn subsys_ana(&self, subsys: &Subsystem) -> bool {
        if !self.ha_licensed() {
            return false;
        }
        subsys.ana.unwrap_or(self.env.ana_enabled)
    }

    /// Visibility by NQN; unknown subsystems are not visible.
    pub fn nqn_visible(&self, nqn: &str) -> bool {
        self.subsystem(nqn).is_some_and(|s| self.subsys_visible(s))
    }

    /// ANA-ness by NQN; unknown subsystems are not ANA.
    pub fn nqn_ana(&self, nqn: &str) -> bool {
        self.subsystem(nqn).is_some_and(|s| self.subsys_ana(s))
    }

    /// Effective listener index of an association, or `None` when the
    /// listener must not exist on this node.
    pub fn port_subsys_index(&self, assoc: &PortSubsys) -> Option<u32> {
        let port = self.port(assoc.port)?;
        let index = if self.nqn_ana(&assoc.subsys) {
            port.index + ANA_PORT_INDEX_OFFSET
        } else {
            port.index
        };
        if self.is_backup() && index < ANA_PORT_INDEX_OFFSET {
            return None;
        }
        Some(index)
    }

    pub fn ana_grpid(&self) -> u32 {
        match self.node() {
            Some(Node::A) => 2,
            Some(Node::B) => 3,
            None => 1,
        }
    }

    pub fn ana_state(&self) -> AnaState {
        match self.status() {
            FailoverStatus::Master => AnaState::Optimized,
            FailoverStatus::Single | FailoverStatus::Backup => AnaState::Inaccessible,
        }
    }

    /// A port is listened on plainly for every non-ANA subsystem using it and
    /// under its ANA index for every ANA subsystem. Unused ports follow the
    /// global flag. The standby never listens on plain indexes.
    pub fn port_usage(&self, port: &Port) -> PortUsage {
        let mut usage = PortUsage::default();
        let mut associated = false;
        for assoc in self.port_subsys().iter().filter(|a| a.port == port.index) {
            associated = true;
            if self.nqn_ana(&assoc.subsys) {
                usage.ana = true;
            } else {
                usage.plain = true;
            }
        }
        if !associated {
            let ana = self.ha_licensed() && self.env.ana_enabled;
            usage.ana = ana;
            usage.plain = !ana;
        }
        if self.is_backup() {
            usage.plain = false;
        }
        usage
    }

    fn address_pair(&self, port: &Port) -> Option<(&str, &str)> {
        self.env
            .address_choices
            .get(&port.addr_trtype)?
            .get(&port.addr_traddr)?
            .split_once('/')
            .filter(|(a, b)| !a.is_empty() && !b.is_empty())
    }

    /// Address this node listens on for the port's ANA index. Without a node
    /// identity the declared address is used.
    pub fn ana_address(&self, port: &Port) -> Option<String> {
        match self.node() {
            Some(Node::A) => self.address_pair(port).map(|(a, _)| a.to_string()),
            Some(Node::B) => self.address_pair(port).map(|(_, b)| b.to_string()),
            None => Some(port.addr_traddr.clone()),
        }
    }

    /// Address of the other node for the port's ANA index.
    pub fn peer_address(&self, port: &Port) -> Option<String> {
        match self.node() {
            Some(Node::A) => self.address_pair(port).map(|(_, b)| b.to_string()),
            Some(Node::B) => self.address_pair(port).map(|(a, _)| a.to_string()),
            None => None,
        }
    }

    /// Concrete listen address of a port for the given index flavour.
    pub fn listen_address(&self, port: &Port, usage: AnaUsage) -> ListenAddress {
        let traddr = match usage {
            AnaUsage::Plain => port.addr_traddr.clone(),
            AnaUsage::Ana => self
                .ana_address(port)
                .unwrap_or_else(|| port.addr_traddr.clone()),
        };
        ListenAddress::new(
            port.addr_trtype.as_str(),
            port.addr_adrfam.as_str(),
            traddr,
            port.addr_trsvcid.clone(),
        )
    }

    /// Listen address for an effective index as produced by
    /// [`RenderContext::port_subsys_index`] or the port reconciler.
    pub fn listen_address_for_index(&self, index: u32) -> Option<ListenAddress> {
        if index > ANA_PORT_INDEX_OFFSET {
            let port = self.port(index - ANA_PORT_INDEX_OFFSET)?;
            Some(self.listen_address(port, AnaUsage::Ana))
        } else {
            let port = self.port(index)?;
            Some(self.listen_address(port, AnaUsage::Plain))
        }
    }

    /// Project a live listen address back to the index that would have
    /// produced it. Addresses no declared port explains key as
    /// `{trtype}:{traddr}:{trsvcid}` so they are pruned. When the plain and
    /// ANA addresses coincide, `prefer_ana` picks the flavour.
    pub fn live_port_key(&self, addr: &ListenAddress, prefer_ana: impl Fn(&Port) -> bool) -> String {
        for port in self.ports() {
            if addr.trtype != port.addr_trtype.as_str() || addr.trsvcid != port.addr_trsvcid {
                continue;
            }
            let plain = addr.traddr == port.addr_traddr;
            let ana = self.ana_address(port).is_some_and(|a| a == addr.traddr);
            let index = match (plain, ana) {
                (true, true) if prefer_ana(port) => port.index + ANA_PORT_INDEX_OFFSET,
                (true, _) => port.index,
                (false, true) => port.index + ANA_PORT_INDEX_OFFSET,
                (false, false) => continue,
            };
            return index.to_string();
        }
        addr.to_string()
    }
}
