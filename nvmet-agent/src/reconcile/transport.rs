//! Transports referenced by declared ports.
//!
//! Transports are only ever created. The daemon cannot unload one safely
//! while it is running, so stale transports are left in place.

use std::collections::BTreeSet;

use spdk_rpc::{CreateTransport, RpcClient, SpdkRpc};
use tracing::info;

use super::Stage;
use crate::context::{RenderContext, Trtype};
use crate::error::{NvmetError, Result};
use crate::metrics;

const RESOURCE: &str = "transport";

pub struct TransportStage;

impl Stage for TransportStage {
    fn resource(&self) -> &'static str {
        RESOURCE
    }

    fn enter(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()> {
        let desired: BTreeSet<Trtype> = ctx.ports().iter().map(|p| p.addr_trtype).collect();
        let live: BTreeSet<String> = client
            .nvmf_get_transports()
            .map_err(|e| NvmetError::from(e).query(RESOURCE))?
            .into_iter()
            .map(|t| t.trtype.to_ascii_uppercase())
            .collect();

        for trtype in desired.iter().filter(|t| !live.contains(t.as_str())) {
            info!("Creating {} transport", trtype);
            client
                .nvmf_create_transport(&CreateTransport::with_defaults(trtype.as_str()))
                .map_err(|e| NvmetError::from(e).attribute(RESOURCE, trtype.as_str()))?;
            metrics::record_mutation(RESOURCE, "add");
        }
        Ok(())
    }

    fn exit(&mut self, _client: &mut dyn RpcClient, _ctx: &RenderContext) -> Result<()> {
        Ok(())
    }
}
