//! Backing block devices.
//!
//! A namespace's bdev is named after its backing (`ZVOL:tank/vol1`,
//! `FILE:/mnt/tank/img`). On a standby node the bdev is a one block null
//! device named `NULL:` plus the real name, so namespace identity survives
//! without holding the storage open.

use std::collections::BTreeMap;

use spdk_rpc::{Bdev, BdevBacking, RpcClient, SpdkRpc};
use tracing::{debug, warn};

use super::{Reconciler, Scope};
use crate::context::{BdevEngine, DeviceType, Namespace, RenderContext, normalize_device_path};
use crate::error::Result;

pub const ZVOL_PREFIX: &str = "ZVOL:";
pub const FILE_PREFIX: &str = "FILE:";
pub const NULL_PREFIX: &str = "NULL:";
pub const ZVOL_DEV_DIR: &str = "/dev/zvol/";

const STUB_NUM_BLOCKS: u64 = 1;
const STUB_BLOCK_SIZE: u32 = 4096;
const FILE_BLOCK_SIZE: u32 = 512;

/// Bdev names and device nodes cannot carry spaces.
pub fn escape_path(path: &str) -> String {
    path.replace(' ', "+")
}

pub fn unescape_path(path: &str) -> String {
    path.replace('+', " ")
}

/// `{device_type}:{device_path}`; the identity of a backing.
pub fn backing_key(device_type: DeviceType, device_path: &str) -> String {
    format!("{}:{}", device_type, normalize_device_path(device_type, device_path))
}

/// Name of the real bdev for a backing.
pub fn bdev_name(device_type: DeviceType, device_path: &str) -> String {
    let path = normalize_device_path(device_type, device_path);
    match device_type {
        DeviceType::Zvol => format!("{}{}", ZVOL_PREFIX, escape_path(&path)),
        DeviceType::File => format!("{}{}", FILE_PREFIX, path),
    }
}

/// Name of the standby stub for a real bdev name.
pub fn stub_name(name: &str) -> String {
    format!("{}{}", NULL_PREFIX, name)
}

/// Real bdev name behind a possibly stubbed one.
pub fn base_name(name: &str) -> &str {
    name.strip_prefix(NULL_PREFIX).unwrap_or(name)
}

/// Bdev name of a namespace on this node.
pub fn namespace_bdev_name(ctx: &RenderContext, ns: &Namespace) -> String {
    let name = bdev_name(ns.device_type, &ns.device_path);
    if ctx.is_backup() { stub_name(&name) } else { name }
}

/// Backing key from a file-backed bdev's filename.
fn filename_key(filename: &str) -> String {
    match filename.strip_prefix(ZVOL_DEV_DIR) {
        Some(rest) => format!("{}{}", ZVOL_PREFIX, unescape_path(rest)),
        None => format!("{}{}", FILE_PREFIX, filename),
    }
}

/// Backing key from a real bdev name.
fn name_key(name: &str) -> Option<String> {
    if let Some(rest) = name.strip_prefix(ZVOL_PREFIX) {
        Some(format!("{}{}", ZVOL_PREFIX, unescape_path(rest)))
    } else if name.starts_with(FILE_PREFIX) {
        Some(name.to_string())
    } else {
        None
    }
}

/// Key of a live bdev, or `None` for bdevs this agent does not manage.
pub fn live_key(bdev: &Bdev) -> Option<String> {
    if ![ZVOL_PREFIX, FILE_PREFIX, NULL_PREFIX]
        .iter()
        .any(|p| bdev.name.starts_with(p))
    {
        return None;
    }
    match bdev.backing() {
        BdevBacking::Uring { filename } | BdevBacking::Aio { filename } => Some(filename_key(&filename)),
        BdevBacking::Null => bdev
            .name
            .strip_prefix(NULL_PREFIX)
            .and_then(name_key)
            .map(|key| format!("{}{}", NULL_PREFIX, key)),
        BdevBacking::Other => None,
    }
}

/// Ask the daemon to pick up a new size of the backing. Returns false for
/// bdevs without a resizable backing.
pub fn rescan(client: &mut dyn RpcClient, bdev: &Bdev) -> Result<bool> {
    match bdev.backing() {
        BdevBacking::Uring { .. } => client.bdev_uring_rescan(&bdev.name)?,
        BdevBacking::Aio { .. } => client.bdev_aio_rescan(&bdev.name)?,
        BdevBacking::Null | BdevBacking::Other => return Ok(false),
    }
    Ok(true)
}

/// What to create for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BdevSpec {
    Zvol { name: String, filename: String },
    File { name: String, filename: String },
    Stub { name: String },
}

impl BdevSpec {
    pub fn name(&self) -> &str {
        match self {
            BdevSpec::Zvol { name, .. } | BdevSpec::File { name, .. } | BdevSpec::Stub { name } => name,
        }
    }
}

pub struct BdevReconciler {
    engine: BdevEngine,
    scope: Scope,
}

impl BdevReconciler {
    pub fn new(engine: BdevEngine, scope: Scope) -> Self {
        Self { engine, scope }
    }

    fn in_scope(&self, key: &str) -> bool {
        match &self.scope {
            Scope::All => true,
            Scope::Single(sel) => {
                let own = backing_key(sel.device_type, &sel.device_path);
                key == own || key.strip_prefix(NULL_PREFIX) == Some(own.as_str())
            }
        }
    }
}

impl Reconciler for BdevReconciler {
    type Desired = BdevSpec;
    type Live = Bdev;

    fn resource(&self) -> &'static str {
        "bdev"
    }

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, BdevSpec>> {
        let mut desired = BTreeMap::new();
        for ns in ctx.namespaces() {
            if ns.locked || !self.scope.includes(ns) || !ctx.nqn_visible(&ns.subsys) {
                continue;
            }
            let key = backing_key(ns.device_type, &ns.device_path);
            let name = bdev_name(ns.device_type, &ns.device_path);
            if ctx.is_backup() {
                desired.insert(
                    format!("{}{}", NULL_PREFIX, key),
                    BdevSpec::Stub { name: stub_name(&name) },
                );
                continue;
            }
            let path = normalize_device_path(ns.device_type, &ns.device_path);
            let spec = match ns.device_type {
                DeviceType::Zvol => BdevSpec::Zvol {
                    name,
                    filename: format!("{}{}", ZVOL_DEV_DIR, escape_path(&path)),
                },
                DeviceType::File => BdevSpec::File { name, filename: path },
            };
            desired.insert(key, spec);
        }
        Ok(desired)
    }

    fn live(&self, client: &mut dyn RpcClient, _ctx: &RenderContext) -> Result<BTreeMap<String, Bdev>> {
        Ok(client
            .bdev_get_bdevs()?
            .into_iter()
            .filter_map(|bdev| live_key(&bdev).map(|key| (key, bdev)))
            .filter(|(key, _)| self.in_scope(key))
            .collect())
    }

    fn add(&self, client: &mut dyn RpcClient, ctx: &RenderContext, _key: &str, spec: &BdevSpec) -> Result<()> {
        match spec {
            BdevSpec::Stub { name } => client.bdev_null_create(name, STUB_NUM_BLOCKS, STUB_BLOCK_SIZE)?,
            BdevSpec::Zvol { name, filename } => match self.engine {
                BdevEngine::Uring => client.bdev_uring_create(name, filename)?,
                BdevEngine::Aio => client.bdev_aio_create(name, filename, None)?,
            },
            BdevSpec::File { name, filename } => {
                if let Some(recordsize) = ctx.recordsize(filename) {
                    // TODO: use the recordsize as block_size once initiators
                    // cope with logical block sizes other than 512.
                    debug!("{} sits on a dataset with recordsize {}", filename, recordsize);
                }
                client.bdev_aio_create(name, filename, Some(FILE_BLOCK_SIZE))?
            }
        }
        Ok(())
    }

    fn delete(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, _key: &str, live: &Bdev) -> Result<()> {
        match live.backing() {
            BdevBacking::Uring { .. } => client.bdev_uring_delete(&live.name)?,
            BdevBacking::Aio { .. } => client.bdev_aio_delete(&live.name)?,
            BdevBacking::Null => client.bdev_null_delete(&live.name)?,
            BdevBacking::Other => warn!("Not deleting bdev {} of unknown product {}", live.name, live.product_name),
        }
        Ok(())
    }
}
