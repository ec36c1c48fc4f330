//! Subsystems, keyed by NQN.

use std::collections::BTreeMap;

use spdk_rpc::{CreateSubsystem, DISCOVERY_NQN, NvmfSubsystem, RpcClient, SpdkRpc};
use tracing::info;

use super::Reconciler;
use crate::context::{NODE_A_MAX_CNTLID, NODE_B_MIN_CNTLID, Node, RenderContext, Subsystem};
use crate::error::Result;

pub struct SubsystemReconciler;

impl Reconciler for SubsystemReconciler {
    type Desired = Subsystem;
    type Live = NvmfSubsystem;

    fn resource(&self) -> &'static str {
        "subsystem"
    }

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, Subsystem>> {
        Ok(ctx
            .subsystems()
            .iter()
            .filter(|s| ctx.subsys_visible(s))
            .map(|s| (s.subnqn.clone(), s.clone()))
            .collect())
    }

    fn live(&self, client: &mut dyn RpcClient, _ctx: &RenderContext) -> Result<BTreeMap<String, NvmfSubsystem>> {
        Ok(client
            .nvmf_get_subsystems()?
            .into_iter()
            .map(|s| (s.nqn.clone(), s))
            .collect())
    }

    fn add(&self, client: &mut dyn RpcClient, ctx: &RenderContext, key: &str, desired: &Subsystem) -> Result<()> {
        // Controller IDs are split between the two nodes so an initiator
        // never sees the same ID from both sides of a failover.
        let (min_cntlid, max_cntlid) = match ctx.node() {
            Some(Node::A) => (None, Some(NODE_A_MAX_CNTLID)),
            Some(Node::B) => (Some(NODE_B_MIN_CNTLID), None),
            None => (None, None),
        };
        client.nvmf_create_subsystem(&CreateSubsystem {
            nqn: key.to_string(),
            serial_number: desired.serial.clone(),
            model_number: ctx.env().model.clone(),
            allow_any_host: desired.allow_any_host,
            min_cntlid,
            max_cntlid,
            ana_reporting: ctx.ha_licensed().then_some(true),
        })?;
        Ok(())
    }

    fn update(
        &self,
        client: &mut dyn RpcClient,
        _ctx: &RenderContext,
        key: &str,
        desired: &Subsystem,
        live: &NvmfSubsystem,
    ) -> Result<()> {
        if desired.allow_any_host != live.allow_any_host {
            info!("Setting allow_any_host={} on {}", desired.allow_any_host, key);
            client.nvmf_subsystem_allow_any_host(key, desired.allow_any_host)?;
        }
        Ok(())
    }

    fn delete(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, key: &str, _live: &NvmfSubsystem) -> Result<()> {
        client.nvmf_delete_subsystem(key)?;
        Ok(())
    }

    fn protected(&self, key: &str) -> bool {
        key == DISCOVERY_NQN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::*;
    use crate::context::{Environment, FailoverStatus, RenderContext, TargetConfig};
    use crate::reconcile::testing::run;
    use spdk_rpc::mock::MockTarget;

    fn config(subsystems: Vec<Subsystem>) -> TargetConfig {
        TargetConfig {
            subsystems,
            ..TargetConfig::default()
        }
    }

    #[test]
    fn test_creates_with_model_and_no_cntlid_split() {
        let target = MockTarget::new();
        let ctx = RenderContext::new(config(vec![subsystem(S1, None)]), Environment::default()).unwrap();
        run(SubsystemReconciler, &target, &ctx).unwrap();

        let created = target.subsystem(S1).unwrap();
        assert_eq!(created.serial_number.as_deref(), Some("abc123"));
        assert_eq!(created.model_number.as_deref(), Some(crate::context::DEFAULT_MODEL));
        assert_eq!(created.min_cntlid, Some(1));
        assert_eq!(created.max_cntlid, Some(65519));
        assert_eq!(target.ana_reporting(S1), Some(false));
    }

    #[test]
    fn test_node_a_and_b_partition_cntlids() {
        let a = MockTarget::new();
        let ctx = RenderContext::new(
            config(vec![subsystem(S1, None)]),
            ha_env(FailoverStatus::Master, Node::A, false),
        )
        .unwrap();
        run(SubsystemReconciler, &a, &ctx).unwrap();
        assert_eq!(a.subsystem(S1).unwrap().max_cntlid, Some(NODE_A_MAX_CNTLID));
        assert_eq!(a.ana_reporting(S1), Some(true));

        let b = MockTarget::new();
        let ctx = RenderContext::new(
            config(vec![subsystem(S1, None)]),
            ha_env(FailoverStatus::Master, Node::B, false),
        )
        .unwrap();
        run(SubsystemReconciler, &b, &ctx).unwrap();
        assert_eq!(b.subsystem(S1).unwrap().min_cntlid, Some(NODE_B_MIN_CNTLID));
    }

    #[test]
    fn test_toggle_allow_any_host_in_place() {
        let target = MockTarget::new();
        let ctx = RenderContext::new(config(vec![subsystem(S1, None)]), Environment::default()).unwrap();
        run(SubsystemReconciler, &target, &ctx).unwrap();
        target.clear_calls();

        let mut closed = subsystem(S1, None);
        closed.allow_any_host = false;
        let ctx = RenderContext::new(config(vec![closed]), Environment::default()).unwrap();
        run(SubsystemReconciler, &target, &ctx).unwrap();
        assert_eq!(target.mutation_methods(), vec!["nvmf_subsystem_allow_any_host"]);
        assert!(!target.subsystem(S1).unwrap().allow_any_host);
    }

    #[test]
    fn test_discovery_survives_empty_config() {
        let target = MockTarget::new();
        let ctx = RenderContext::new(config(vec![subsystem(S1, None)]), Environment::default()).unwrap();
        run(SubsystemReconciler, &target, &ctx).unwrap();

        let ctx = RenderContext::new(TargetConfig::default(), Environment::default()).unwrap();
        run(SubsystemReconciler, &target, &ctx).unwrap();
        assert_eq!(target.subsystem_nqns(), vec![DISCOVERY_NQN.to_string()]);
    }

    #[test]
    fn test_backup_hides_non_ana_subsystems() {
        let target = MockTarget::new();
        let ctx = RenderContext::new(
            config(vec![subsystem(S1, Some(false)), subsystem(S2, Some(true))]),
            ha_env(FailoverStatus::Backup, Node::B, false),
        )
        .unwrap();
        run(SubsystemReconciler, &target, &ctx).unwrap();
        assert!(target.subsystem(S1).is_none());
        assert!(target.subsystem(S2).is_some());
    }
}
