//! ANA state of listeners on ANA subsystems.
//!
//! Demotion to inaccessible is applied on entry, before anything nested
//! tears resources down. Promotion to optimized is applied on exit, after
//! everything nested has been built.

use spdk_rpc::{AnaState, ListenAddress, RpcClient, SpdkRpc};
use tracing::{info, warn};

use super::Stage;
use crate::context::RenderContext;
use crate::error::{NvmetError, Result};
use crate::metrics;

const RESOURCE: &str = "ana_state";

#[derive(Default)]
pub struct AnaStateStage {
    queued: Vec<(String, ListenAddress)>,
}

impl AnaStateStage {
    fn collect(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()> {
        let target = ctx.ana_state();
        let grpid = ctx.ana_grpid();
        for subsys in ctx.subsystems().iter().filter(|s| ctx.subsys_ana(s)) {
            let listeners = match client.nvmf_subsystem_get_listeners(&subsys.subnqn) {
                Ok(listeners) => listeners,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(NvmetError::from(e).query(RESOURCE)),
            };
            for listener in listeners {
                if listener.ana_state(grpid).is_some_and(|state| state != target) {
                    self.queued.push((subsys.subnqn.clone(), listener.address));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()> {
        let target = ctx.ana_state();
        let grpid = ctx.ana_grpid();
        for (nqn, address) in std::mem::take(&mut self.queued) {
            info!("Setting ANA group {} of {} on {} to {}", grpid, address, nqn, target);
            match client.nvmf_subsystem_listener_set_ana_state(&nqn, &address, target, grpid) {
                Ok(()) => metrics::record_mutation(RESOURCE, "update"),
                Err(e) if e.is_not_found() => warn!("Listener {} on {} vanished: {}", address, nqn, e),
                Err(e) => return Err(NvmetError::from(e).attribute(RESOURCE, &format!("{}:{}", nqn, address))),
            }
        }
        Ok(())
    }
}

impl Stage for AnaStateStage {
    fn resource(&self) -> &'static str {
        RESOURCE
    }

    fn enter(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()> {
        self.queued.clear();
        self.collect(client, ctx)?;
        if ctx.ana_state() == AnaState::Inaccessible {
            self.apply(client, ctx)?;
        }
        Ok(())
    }

    fn exit(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()> {
        if ctx.ana_state() == AnaState::Optimized {
            self.apply(client, ctx)?;
        }
        Ok(())
    }
}
