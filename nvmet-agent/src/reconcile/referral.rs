//! Discovery referrals pointing initiators at the peer node's ANA address.

use std::collections::BTreeMap;

use spdk_rpc::{ListenAddress, RpcClient, SpdkRpc};

use super::Reconciler;
use crate::context::RenderContext;
use crate::error::Result;

pub struct ReferralReconciler;

impl Reconciler for ReferralReconciler {
    type Desired = ListenAddress;
    type Live = ListenAddress;

    fn resource(&self) -> &'static str {
        "referral"
    }

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, ListenAddress>> {
        let mut desired = BTreeMap::new();
        if ctx.node().is_none() {
            return Ok(desired);
        }
        for port in ctx.ports().iter().filter(|p| ctx.port_usage(p).ana) {
            if let Some(peer) = ctx.peer_address(port) {
                let address = ListenAddress::new(
                    port.addr_trtype.as_str(),
                    port.addr_adrfam.as_str(),
                    peer,
                    port.addr_trsvcid.clone(),
                );
                desired.insert(address.to_string(), address);
            }
        }
        Ok(desired)
    }

    fn live(&self, client: &mut dyn RpcClient, _ctx: &RenderContext) -> Result<BTreeMap<String, ListenAddress>> {
        Ok(client
            .nvmf_discovery_get_referrals()?
            .into_iter()
            .map(|r| (r.address.to_string(), r.address))
            .collect())
    }

    fn add(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, address: &ListenAddress) -> Result<()> {
        client.nvmf_discovery_add_referral(address)?;
        Ok(())
    }

    fn delete(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, address: &ListenAddress) -> Result<()> {
        client.nvmf_discovery_remove_referral(address)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::*;
    use crate::context::{Environment, FailoverStatus, Node};
    use crate::reconcile::testing::run;
    use spdk_rpc::mock::MockTarget;

    #[test]
    fn test_refers_to_peer_address() {
        let target = MockTarget::new();
        let ctx = RenderContext::new(single_config(Some(true)), ha_env(FailoverStatus::Master, Node::A, false)).unwrap();
        run(ReferralReconciler, &target, &ctx).unwrap();
        assert_eq!(
            target.referrals(),
            vec![ListenAddress::new("TCP", "IPv4", "10.0.0.12", "4420")]
        );

        target.clear_calls();
        run(ReferralReconciler, &target, &ctx).unwrap();
        assert!(target.mutations().is_empty());
    }

    #[test]
    fn test_plain_only_ports_have_no_referral() {
        let target = MockTarget::new();
        let ctx = RenderContext::new(single_config(Some(false)), ha_env(FailoverStatus::Master, Node::A, false)).unwrap();
        run(ReferralReconciler, &target, &ctx).unwrap();
        assert!(target.referrals().is_empty());
    }

    #[test]
    fn test_non_ha_node_prunes_referrals() {
        let target = MockTarget::new();
        let ctx = RenderContext::new(single_config(Some(true)), ha_env(FailoverStatus::Master, Node::B, false)).unwrap();
        run(ReferralReconciler, &target, &ctx).unwrap();
        assert_eq!(target.referrals().len(), 1);

        let ctx = RenderContext::new(single_config(None), Environment::default()).unwrap();
        run(ReferralReconciler, &target, &ctx).unwrap();
        assert!(target.referrals().is_empty());
    }
}
