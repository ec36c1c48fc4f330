//! Ports and port/subsystem associations.
//!
//! The daemon has no standalone port object. A port is a listener on the
//! discovery subsystem, keyed by its effective index (the declared index, or
//! the index plus [`ANA_PORT_INDEX_OFFSET`] for the node-local ANA address).
//! An association is the same listener on the data subsystem.

use std::collections::BTreeMap;

use spdk_rpc::{DISCOVERY_NQN, ListenAddress, RpcClient, SpdkRpc};
use tracing::info;

use super::Reconciler;
use crate::context::{ANA_PORT_INDEX_OFFSET, AnaUsage, RenderContext};
use crate::error::Result;

/// Insert under `key`, falling back to the raw address when two live
/// listeners project to the same index so neither escapes pruning.
fn insert_live<V>(map: &mut BTreeMap<String, V>, key: String, raw: &ListenAddress, value: V) {
    if map.contains_key(&key) {
        map.insert(raw.to_string(), value);
    } else {
        map.insert(key, value);
    }
}

pub struct PortReconciler;

impl Reconciler for PortReconciler {
    type Desired = ListenAddress;
    type Live = ListenAddress;

    fn resource(&self) -> &'static str {
        "port"
    }

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, ListenAddress>> {
        let mut desired = BTreeMap::new();
        for port in ctx.ports() {
            let usage = ctx.port_usage(port);
            if usage.plain {
                desired.insert(port.index.to_string(), ctx.listen_address(port, AnaUsage::Plain));
            }
            if usage.ana {
                desired.insert(
                    (port.index + ANA_PORT_INDEX_OFFSET).to_string(),
                    ctx.listen_address(port, AnaUsage::Ana),
                );
            }
        }
        Ok(desired)
    }

    fn live(&self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<BTreeMap<String, ListenAddress>> {
        let mut live = BTreeMap::new();
        for listener in client.nvmf_subsystem_get_listeners(DISCOVERY_NQN)? {
            let key = ctx.live_port_key(&listener.address, |port| {
                let usage = ctx.port_usage(port);
                usage.ana && !usage.plain
            });
            insert_live(&mut live, key, &listener.address, listener.address.clone());
        }
        Ok(live)
    }

    fn add(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, address: &ListenAddress) -> Result<()> {
        client.nvmf_subsystem_add_listener(DISCOVERY_NQN, address)?;
        Ok(())
    }

    fn update(
        &self,
        client: &mut dyn RpcClient,
        _ctx: &RenderContext,
        key: &str,
        desired: &ListenAddress,
        live: &ListenAddress,
    ) -> Result<()> {
        if !desired.same_endpoint(live) {
            info!("Moving port {} from {} to {}", key, live, desired);
            client.nvmf_subsystem_remove_listener(DISCOVERY_NQN, live)?;
            client.nvmf_subsystem_add_listener(DISCOVERY_NQN, desired)?;
        }
        Ok(())
    }

    fn delete(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, live: &ListenAddress) -> Result<()> {
        client.nvmf_subsystem_remove_listener(DISCOVERY_NQN, live)?;
        Ok(())
    }
}

/// A listener on a data subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemListener {
    pub nqn: String,
    pub address: ListenAddress,
}

pub struct PortSubsysReconciler;

impl Reconciler for PortSubsysReconciler {
    type Desired = SubsystemListener;
    type Live = SubsystemListener;

    fn resource(&self) -> &'static str {
        "port_subsys"
    }

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, SubsystemListener>> {
        let mut desired = BTreeMap::new();
        for assoc in ctx.port_subsys() {
            if !ctx.nqn_visible(&assoc.subsys) {
                continue;
            }
            let Some(index) = ctx.port_subsys_index(assoc) else {
                continue;
            };
            let Some(address) = ctx.listen_address_for_index(index) else {
                continue;
            };
            desired.insert(
                format!("{}:{}", index, assoc.subsys),
                SubsystemListener {
                    nqn: assoc.subsys.clone(),
                    address,
                },
            );
        }
        Ok(desired)
    }

    fn live(&self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<BTreeMap<String, SubsystemListener>> {
        let mut live = BTreeMap::new();
        for subsys in client.nvmf_get_subsystems()? {
            if subsys.is_discovery() {
                continue;
            }
            let ana = ctx.nqn_ana(&subsys.nqn);
            for address in subsys.listen_addresses {
                let index = ctx.live_port_key(&address, |_| ana);
                let key = format!("{}:{}", index, subsys.nqn);
                let raw = address.clone();
                insert_live(
                    &mut live,
                    key,
                    &raw,
                    SubsystemListener {
                        nqn: subsys.nqn.clone(),
                        address,
                    },
                );
            }
        }
        Ok(live)
    }

    fn add(&self, client: &mut dyn RpcClient, ctx: &RenderContext, key: &str, desired: &SubsystemListener) -> Result<()> {
        client.nvmf_subsystem_add_listener(&desired.nqn, &desired.address)?;
        if is_ana_key(key) {
            client.nvmf_subsystem_listener_set_ana_state(
                &desired.nqn,
                &desired.address,
                ctx.ana_state(),
                ctx.ana_grpid(),
            )?;
        }
        Ok(())
    }

    fn update(
        &self,
        client: &mut dyn RpcClient,
        ctx: &RenderContext,
        key: &str,
        desired: &SubsystemListener,
        live: &SubsystemListener,
    ) -> Result<()> {
        if !desired.address.same_endpoint(&live.address) {
            info!("Moving {} from {} to {}", key, live.address, desired.address);
            client.nvmf_subsystem_remove_listener(&live.nqn, &live.address)?;
            self.add(client, ctx, key, desired)?;
        }
        Ok(())
    }

    fn delete(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, live: &SubsystemListener) -> Result<()> {
        client.nvmf_subsystem_remove_listener(&live.nqn, &live.address)?;
        Ok(())
    }
}

/// Association keys lead with the effective index.
fn is_ana_key(key: &str) -> bool {
    key.split(':')
        .next()
        .and_then(|index| index.parse::<u32>().ok())
        .is_some_and(|index| index > ANA_PORT_INDEX_OFFSET)
}
