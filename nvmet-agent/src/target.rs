//! Lifecycle entry points: full reconcile, namespace hooks and readiness.
//!
//! Every entry point takes the same lock, so a namespace hook never
//! interleaves with a full reconcile against the same daemon.

use std::sync::{Mutex, MutexGuard};

use spdk_rpc::{Connect, SpdkRpc};
use tracing::{debug, info, instrument, warn};

use crate::context::{BdevEngine, Namespace, RenderContext};
use crate::error::{NvmetError, Result};
use crate::keys::KeyStore;
use crate::metrics::{self, ReconcileTimer};
use crate::reconcile::bdev::{backing_key, live_key, rescan};
use crate::reconcile::{full_stages, namespace_stages, run_nested};

/// Metric status label for a failed run.
fn failure_status(err: &NvmetError) -> &'static str {
    match err {
        _ if err.is_unavailable() => "unavailable",
        NvmetError::InvalidConfig(_) => "invalid_config",
        NvmetError::KeyMaterial { .. } => "key_material",
        _ => "daemon_error",
    }
}

fn finish(timer: ReconcileTimer, result: &Result<()>) {
    match result {
        Ok(()) => timer.success(),
        Err(e) => timer.failure(failure_status(e)),
    }
}

/// Drives one target daemon.
pub struct NvmetTarget<C: Connect> {
    connector: C,
    keys: KeyStore,
    engine: BdevEngine,
    lock: Mutex<()>,
}

impl<C: Connect> NvmetTarget<C> {
    pub fn new(connector: C, keys: KeyStore, engine: BdevEngine) -> Self {
        Self {
            connector,
            keys,
            engine,
            lock: Mutex::new(()),
        }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn engine(&self) -> BdevEngine {
        self.engine
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bring the daemon in line with `ctx`.
    #[instrument(skip(self, ctx))]
    pub fn write_config(&self, ctx: &RenderContext) -> Result<()> {
        let _guard = self.guard();
        let timer = ReconcileTimer::new("write_config");
        let result = self.reconcile_all(ctx);
        finish(timer, &result);
        metrics::set_converged(result.is_ok());
        result
    }

    fn reconcile_all(&self, ctx: &RenderContext) -> Result<()> {
        self.keys.ensure_dir()?;
        let mut client = self.connector.connect()?;
        let mut stages = full_stages(&self.keys, self.engine);
        run_nested(&mut stages, &mut client, ctx)?;
        info!(
            subsystems = ctx.subsystems().len(),
            namespaces = ctx.namespaces().len(),
            "Target configuration applied"
        );
        Ok(())
    }

    fn reconcile_namespace(&self, ns: &Namespace, ctx: &RenderContext) -> Result<()> {
        let mut client = self.connector.connect()?;
        let mut stages = namespace_stages(self.engine, ns);
        run_nested(&mut stages, &mut client, ctx)
    }

    /// Detach a namespace and release its bdev. Safe to repeat.
    #[instrument(skip(self, ns, ctx), fields(subsys = %ns.subsys, path = %ns.device_path))]
    pub fn lock_namespace(&self, ns: &Namespace, ctx: &RenderContext) -> Result<()> {
        let _guard = self.guard();
        let timer = ReconcileTimer::new("lock_namespace");
        let locked = ctx.with_namespace_locked(ns, true);
        let result = self.reconcile_namespace(ns, &locked);
        finish(timer, &result);
        result
    }

    /// Recreate a namespace's bdev and binding. Safe to repeat.
    #[instrument(skip(self, ns, ctx), fields(subsys = %ns.subsys, path = %ns.device_path))]
    pub fn unlock_namespace(&self, ns: &Namespace, ctx: &RenderContext) -> Result<()> {
        let _guard = self.guard();
        if !ctx.namespaces().iter().any(|n| n.same_backing(ns)) {
            warn!("Namespace is not part of the configuration, not unlocking");
            return Ok(());
        }
        let timer = ReconcileTimer::new("unlock_namespace");
        let unlocked = ctx.with_namespace_locked(ns, false);
        let result = self.reconcile_namespace(ns, &unlocked);
        finish(timer, &result);
        result
    }

    /// Have the daemon pick up a new size of the namespace's backing.
    #[instrument(skip(self, ns, _ctx), fields(subsys = %ns.subsys, path = %ns.device_path))]
    pub fn resize_namespace(&self, ns: &Namespace, _ctx: &RenderContext) -> Result<()> {
        let _guard = self.guard();
        let mut client = self.connector.connect()?;
        let key = backing_key(ns.device_type, &ns.device_path);
        let bdev = client
            .bdev_get_bdevs()?
            .into_iter()
            .find(|b| live_key(b).as_deref() == Some(key.as_str()));
        match bdev {
            Some(bdev) => {
                if rescan(&mut client, &bdev).map_err(|e| e.attribute("bdev", &bdev.name))? {
                    info!("Rescanned bdev {}", bdev.name);
                    metrics::record_mutation("bdev", "rescan");
                }
            }
            None => debug!("No live bdev for {}, nothing to rescan", key),
        }
        Ok(())
    }

    /// Whether the daemon is up. `cheap` only checks that its endpoint
    /// exists; otherwise the daemon must answer `framework_wait_init`.
    pub fn nvmf_ready(&self, cheap: bool) -> bool {
        if !self.connector.endpoint_present() {
            return false;
        }
        if cheap {
            return true;
        }
        match self.connector.connect().and_then(|mut client| client.framework_wait_init()) {
            Ok(()) => true,
            Err(e) => {
                debug!("Target daemon not ready: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::*;
    use crate::context::{DeviceType, Environment};
    use spdk_rpc::mock::MockTarget;
    use tempfile::TempDir;

    fn agent(target: &MockTarget, dir: &TempDir) -> NvmetTarget<MockTarget> {
        NvmetTarget::new(target.clone(), KeyStore::new(dir.path().join("keys")), BdevEngine::Uring)
    }

    #[test]
    fn test_write_config_creates_key_dir() {
        let dir = TempDir::new().unwrap();
        let target = MockTarget::new();
        let agent = agent(&target, &dir);
        let ctx = RenderContext::new(single_config(None), Environment::default()).unwrap();
        agent.write_config(&ctx).unwrap();
        assert!(dir.path().join("keys").is_dir());
        assert_eq!(target.subsystem(S1).unwrap().namespaces.len(), 1);
    }

    #[test]
    fn test_unavailable_daemon() {
        let dir = TempDir::new().unwrap();
        let target = MockTarget::new();
        target.set_available(false);
        let agent = agent(&target, &dir);
        let ctx = RenderContext::new(single_config(None), Environment::default()).unwrap();
        let err = agent.write_config(&ctx).unwrap_err();
        assert!(err.is_unavailable());
        assert!(!agent.nvmf_ready(true));
        assert!(!agent.nvmf_ready(false));
    }

    #[test]
    fn test_ready_probe() {
        let dir = TempDir::new().unwrap();
        let target = MockTarget::new();
        let agent = agent(&target, &dir);
        assert!(agent.nvmf_ready(true));
        assert!(target.calls().is_empty());
        assert!(agent.nvmf_ready(false));
        assert_eq!(target.calls()[0].method, "framework_wait_init");
    }

    #[test]
    fn test_lock_unlock_cycle() {
        let dir = TempDir::new().unwrap();
        let target = MockTarget::new();
        let agent = agent(&target, &dir);
        let config = single_config(None);
        let ns = config.namespaces[0].clone();
        let ctx = RenderContext::new(config, Environment::default()).unwrap();
        agent.write_config(&ctx).unwrap();

        agent.lock_namespace(&ns, &ctx).unwrap();
        assert!(target.subsystem(S1).unwrap().namespaces.is_empty());
        assert!(target.bdevs().is_empty());
        // Again, with nothing left to remove.
        agent.lock_namespace(&ns, &ctx).unwrap();

        agent.unlock_namespace(&ns, &ctx).unwrap();
        agent.unlock_namespace(&ns, &ctx).unwrap();
        let namespaces = target.subsystem(S1).unwrap().namespaces;
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].bdev_name, "ZVOL:tank/vol1");
    }

    #[test]
    fn test_resize_rescans_file_bdev() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();

        let target = MockTarget::new();
        let agent = agent(&target, &dir);
        let mut config = single_config(None);
        config.namespaces[0].device_type = DeviceType::File;
        config.namespaces[0].device_path = image.to_string_lossy().into_owned();
        let ns = config.namespaces[0].clone();
        let ctx = RenderContext::new(config, Environment::default()).unwrap();
        agent.write_config(&ctx).unwrap();
        let name = format!("FILE:{}", image.display());
        assert_eq!(target.bdev(&name).unwrap().num_blocks, 8);

        std::fs::write(&image, vec![0u8; 8192]).unwrap();
        agent.resize_namespace(&ns, &ctx).unwrap();
        assert_eq!(target.bdev(&name).unwrap().num_blocks, 16);
    }

    #[test]
    fn test_resize_without_bdev_is_noop() {
        let dir = TempDir::new().unwrap();
        let target = MockTarget::new();
        let agent = agent(&target, &dir);
        let config = single_config(None);
        let ns = config.namespaces[0].clone();
        let ctx = RenderContext::new(config, Environment::default()).unwrap();
        agent.resize_namespace(&ns, &ctx).unwrap();
        assert!(target.mutations().is_empty());
    }
}
