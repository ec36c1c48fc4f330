//! Namespaces binding a bdev into a subsystem.

use std::collections::{BTreeMap, BTreeSet};

use spdk_rpc::{NamespaceParams, RpcClient, SpdkRpc};
use uuid::Uuid;

use super::bdev::{base_name, bdev_name, namespace_bdev_name};
use super::{Reconciler, Scope};
use crate::context::RenderContext;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredNamespace {
    pub nqn: String,
    pub nsid: Option<u32>,
    /// Bdev to bind; the stub on a standby node.
    pub bdev_name: String,
    /// The real bdev behind `bdev_name`.
    pub real_name: String,
    pub uuid: Uuid,
    pub nguid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveNamespace {
    pub nqn: String,
    pub nsid: u32,
    pub bdev_name: String,
}

fn namespace_key(bdev_name: &str, nqn: &str, nsid: Option<u32>) -> String {
    match nsid {
        Some(nsid) => format!("{}:{}:{}", bdev_name, nqn, nsid),
        None => format!("{}:{}:", bdev_name, nqn),
    }
}

pub struct NamespaceReconciler {
    scope: Scope,
}

impl NamespaceReconciler {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }
}

impl Reconciler for NamespaceReconciler {
    type Desired = DesiredNamespace;
    type Live = LiveNamespace;

    fn resource(&self) -> &'static str {
        "namespace"
    }

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, DesiredNamespace>> {
        let mut desired = BTreeMap::new();
        for ns in ctx.namespaces() {
            if ns.locked || !self.scope.includes(ns) || !ctx.nqn_visible(&ns.subsys) {
                continue;
            }
            let name = namespace_bdev_name(ctx, ns);
            desired.insert(
                namespace_key(&name, &ns.subsys, ns.nsid),
                DesiredNamespace {
                    nqn: ns.subsys.clone(),
                    nsid: ns.nsid,
                    bdev_name: name,
                    real_name: bdev_name(ns.device_type, &ns.device_path),
                    uuid: ns.device_uuid,
                    nguid: ns.device_nguid,
                },
            );
        }
        Ok(desired)
    }

    /// A live namespace matching a declared namespace that has no nsid is
    /// keyed without one, so the nsid the daemon picked is not drift.
    fn live(&self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<BTreeMap<String, LiveNamespace>> {
        let floating: BTreeSet<(String, String)> = ctx
            .namespaces()
            .iter()
            .filter(|ns| ns.nsid.is_none())
            .map(|ns| (namespace_bdev_name(ctx, ns), ns.subsys.clone()))
            .collect();
        let selected = match &self.scope {
            Scope::All => None,
            Scope::Single(sel) => Some((sel.subsys.as_str(), bdev_name(sel.device_type, &sel.device_path))),
        };

        let mut live = BTreeMap::new();
        for subsys in client.nvmf_get_subsystems()? {
            if subsys.is_discovery() {
                continue;
            }
            for ns in subsys.namespaces {
                let wanted = selected
                    .as_ref()
                    .is_none_or(|(nqn, real)| subsys.nqn == *nqn && base_name(&ns.bdev_name) == real.as_str());
                if !wanted {
                    continue;
                }
                let nsid = if floating.contains(&(ns.bdev_name.clone(), subsys.nqn.clone())) {
                    None
                } else {
                    Some(ns.nsid)
                };
                live.insert(
                    namespace_key(&ns.bdev_name, &subsys.nqn, nsid),
                    LiveNamespace {
                        nqn: subsys.nqn.clone(),
                        nsid: ns.nsid,
                        bdev_name: ns.bdev_name,
                    },
                );
            }
        }
        Ok(live)
    }

    fn add(&self, client: &mut dyn RpcClient, ctx: &RenderContext, _key: &str, desired: &DesiredNamespace) -> Result<()> {
        client.nvmf_subsystem_add_ns(
            &desired.nqn,
            &NamespaceParams {
                bdev_name: desired.bdev_name.clone(),
                uuid: Some(desired.uuid.to_string()),
                nguid: Some(desired.nguid.simple().to_string()),
                anagrpid: Some(ctx.ana_grpid()),
                nsid: desired.nsid,
            },
        )?;
        Ok(())
    }

    fn delete(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, live: &LiveNamespace) -> Result<()> {
        client.nvmf_subsystem_remove_ns(&live.nqn, live.nsid)?;
        Ok(())
    }

    /// A namespace switching between its real bdev and the standby stub
    /// reuses the slot of the old binding.
    fn supersedes(&self, desired: &DesiredNamespace, live: &LiveNamespace) -> bool {
        if desired.nqn != live.nqn || desired.bdev_name == live.bdev_name {
            return false;
        }
        match desired.nsid {
            Some(nsid) => nsid == live.nsid,
            None => base_name(&live.bdev_name) == desired.real_name,
        }
    }
}
