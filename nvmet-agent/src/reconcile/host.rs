//! Hosts allowed on a subsystem, with their bound DH-CHAP keys.

use std::collections::BTreeMap;

use spdk_rpc::{AddHost, RpcClient, SpdkRpc};
use tracing::info;

use super::Reconciler;
use crate::context::RenderContext;
use crate::error::Result;
use crate::keys::{KeyRole, key_name};

/// A host on a subsystem and the keyring names it authenticates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    pub hostnqn: String,
    pub nqn: String,
    pub dhchap_key: Option<String>,
    pub dhchap_ctrl_key: Option<String>,
}

impl HostBinding {
    fn same_keys(&self, other: &HostBinding) -> bool {
        self.dhchap_key == other.dhchap_key && self.dhchap_ctrl_key == other.dhchap_ctrl_key
    }
}

pub struct HostSubsysReconciler;

impl Reconciler for HostSubsysReconciler {
    type Desired = HostBinding;
    type Live = HostBinding;

    fn resource(&self) -> &'static str {
        "host_subsys"
    }

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, HostBinding>> {
        let mut desired = BTreeMap::new();
        for assoc in ctx.host_subsys() {
            if !ctx.nqn_visible(&assoc.subsys) {
                continue;
            }
            let Some(host) = ctx.host(&assoc.host) else {
                continue;
            };
            desired.insert(
                format!("{}:{}", host.hostnqn, assoc.subsys),
                HostBinding {
                    hostnqn: host.hostnqn.clone(),
                    nqn: assoc.subsys.clone(),
                    dhchap_key: host
                        .dhchap_key
                        .as_deref()
                        .map(|s| key_name(KeyRole::Host, &host.hostnqn, s)),
                    dhchap_ctrl_key: host
                        .dhchap_ctrl_key
                        .as_deref()
                        .map(|s| key_name(KeyRole::Ctrl, &host.hostnqn, s)),
                },
            );
        }
        Ok(desired)
    }

    fn live(&self, client: &mut dyn RpcClient, _ctx: &RenderContext) -> Result<BTreeMap<String, HostBinding>> {
        let mut live = BTreeMap::new();
        for subsys in client.nvmf_get_subsystems()? {
            if subsys.is_discovery() {
                continue;
            }
            for host in subsys.hosts {
                live.insert(
                    format!("{}:{}", host.nqn, subsys.nqn),
                    HostBinding {
                        hostnqn: host.nqn,
                        nqn: subsys.nqn.clone(),
                        dhchap_key: host.dhchap_key,
                        dhchap_ctrl_key: host.dhchap_ctrlr_key,
                    },
                );
            }
        }
        Ok(live)
    }

    fn add(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, desired: &HostBinding) -> Result<()> {
        client.nvmf_subsystem_add_host(&AddHost {
            nqn: desired.nqn.clone(),
            host: desired.hostnqn.clone(),
            dhchap_key: desired.dhchap_key.clone(),
            dhchap_ctrlr_key: desired.dhchap_ctrl_key.clone(),
        })?;
        Ok(())
    }

    /// Keys cannot be rebound in place; a host whose key names changed is
    /// removed and added again.
    fn update(
        &self,
        client: &mut dyn RpcClient,
        ctx: &RenderContext,
        key: &str,
        desired: &HostBinding,
        live: &HostBinding,
    ) -> Result<()> {
        if desired.same_keys(live) {
            return Ok(());
        }
        info!("Rebinding keys of {}", key);
        client.nvmf_subsystem_remove_host(&live.nqn, &live.hostnqn)?;
        self.add(client, ctx, key, desired)
    }

    fn delete(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, live: &HostBinding) -> Result<()> {
        client.nvmf_subsystem_remove_host(&live.nqn, &live.hostnqn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::*;
    use crate::context::{Environment, Host, HostSubsys, TargetConfig};
    use crate::keys::KeyStore;
    use crate::reconcile::dhchap::DhchapKeyReconciler;
    use crate::reconcile::subsystem::SubsystemReconciler;
    use crate::reconcile::{Scoped, Stage, run_nested};
    use spdk_rpc::mock::MockTarget;
    use tempfile::TempDir;

    const HOST: &str = "nqn.2014-08.org.nvmexpress:uuid:host1";

    fn config(secret: Option<&str>) -> TargetConfig {
        TargetConfig {
            subsystems: vec![subsystem(S1, None)],
            hosts: vec![Host {
                hostnqn: HOST.to_string(),
                dhchap_key: secret.map(str::to_string),
                dhchap_ctrl_key: None,
            }],
            host_subsys: vec![HostSubsys {
                host: HOST.to_string(),
                subsys: S1.to_string(),
            }],
            ..TargetConfig::default()
        }
    }

    fn apply(target: &MockTarget, store: &KeyStore, config: TargetConfig) {
        let ctx = RenderContext::new(config, Environment::default()).unwrap();
        let mut client = target.clone();
        let mut stages: Vec<Box<dyn Stage + '_>> = vec![
            Box::new(Scoped::new(SubsystemReconciler)),
            Box::new(Scoped::new(DhchapKeyReconciler::new(KeyRole::Host, store))),
            Box::new(Scoped::new(HostSubsysReconciler)),
        ];
        run_nested(&mut stages, &mut client, &ctx).unwrap();
    }

    #[test]
    fn test_binds_host_with_key_name() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());
        let target = MockTarget::new();
        apply(&target, &store, config(Some("s1")));

        let hosts = target.subsystem(S1).unwrap().hosts;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].dhchap_key, Some(key_name(KeyRole::Host, HOST, "s1")));
        assert_eq!(hosts[0].dhchap_ctrlr_key, None);
    }

    #[test]
    fn test_key_rotation_rebinds_before_old_key_goes() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());
        let target = MockTarget::new();
        apply(&target, &store, config(Some("old")));
        target.clear_calls();

        apply(&target, &store, config(Some("new")));
        assert_eq!(
            target.mutation_methods(),
            vec![
                "keyring_file_add_key",
                "nvmf_subsystem_remove_host",
                "nvmf_subsystem_add_host",
                "keyring_file_remove_key",
            ]
        );
        let hosts = target.subsystem(S1).unwrap().hosts;
        assert_eq!(hosts[0].dhchap_key, Some(key_name(KeyRole::Host, HOST, "new")));
    }

    #[test]
    fn test_removed_association_detaches_host() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());
        let target = MockTarget::new();
        apply(&target, &store, config(None));
        assert_eq!(target.subsystem(S1).unwrap().hosts.len(), 1);

        let mut detached = config(None);
        detached.host_subsys.clear();
        apply(&target, &store, detached);
        assert!(target.subsystem(S1).unwrap().hosts.is_empty());
    }
}
