//! Keyed-set reconciliation against the target daemon.
//!
//! A [`Reconciler`] computes the desired and live keyed sets for one
//! resource class and knows how to add, update and delete a single entry.
//! [`Scoped`] turns it into a [`Stage`]: entering applies creations,
//! exiting applies deletions. [`run_nested`] enters every stage in order
//! and exits them in reverse, so an outer class is created before and
//! deleted after every inner class.

pub mod ana;
pub mod bdev;
pub mod dhchap;
pub mod host;
pub mod namespace;
pub mod port;
pub mod referral;
pub mod subsystem;
pub mod transport;

use std::collections::BTreeMap;

use spdk_rpc::RpcClient;
use tracing::{debug, info, warn};

use crate::context::{BdevEngine, DeviceType, Namespace, RenderContext, normalize_device_path};
use crate::error::Result;
use crate::keys::{KeyRole, KeyStore};
use crate::metrics;

/// One resource class.
pub trait Reconciler {
    type Desired;
    type Live;

    /// Resource class name used in logs, errors and metrics.
    fn resource(&self) -> &'static str;

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, Self::Desired>>;

    fn live(&self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<BTreeMap<String, Self::Live>>;

    fn add(&self, client: &mut dyn RpcClient, ctx: &RenderContext, key: &str, desired: &Self::Desired) -> Result<()>;

    fn update(
        &self,
        _client: &mut dyn RpcClient,
        _ctx: &RenderContext,
        _key: &str,
        _desired: &Self::Desired,
        _live: &Self::Live,
    ) -> Result<()> {
        Ok(())
    }

    fn delete(&self, client: &mut dyn RpcClient, ctx: &RenderContext, key: &str, live: &Self::Live) -> Result<()>;

    /// True when a desired entry takes over the daemon slot held by a live
    /// entry under another key; the live entry is then deleted immediately
    /// before the add instead of on exit.
    fn supersedes(&self, _desired: &Self::Desired, _live: &Self::Live) -> bool {
        false
    }

    /// Live keys that are never deleted.
    fn protected(&self, _key: &str) -> bool {
        false
    }
}

/// The operations one reconciler will perform.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub adds: Vec<String>,
    /// `(desired key, live key)`: delete the live entry, then add.
    pub replaces: Vec<(String, String)>,
    pub updates: Vec<String>,
    pub deletes: Vec<String>,
}

impl Plan {
    pub fn compute<R: Reconciler + ?Sized>(
        reconciler: &R,
        desired: &BTreeMap<String, R::Desired>,
        live: &BTreeMap<String, R::Live>,
    ) -> Plan {
        let mut plan = Plan {
            deletes: live
                .keys()
                .filter(|k| !desired.contains_key(*k) && !reconciler.protected(k))
                .cloned()
                .collect(),
            ..Plan::default()
        };
        for (key, want) in desired {
            if live.contains_key(key) {
                plan.updates.push(key.clone());
            } else if let Some(pos) = plan
                .deletes
                .iter()
                .position(|stale| reconciler.supersedes(want, &live[stale]))
            {
                let stale = plan.deletes.remove(pos);
                plan.replaces.push((key.clone(), stale));
            } else {
                plan.adds.push(key.clone());
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.replaces.is_empty() && self.deletes.is_empty()
    }
}

/// One level of the nesting run by [`run_nested`].
pub trait Stage {
    fn resource(&self) -> &'static str;

    /// Creation phase, run outermost first.
    fn enter(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()>;

    /// Deletion phase, run innermost first.
    fn exit(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()>;
}

/// Adapts a [`Reconciler`] into a [`Stage`], holding the deletions planned
/// on entry until exit.
pub struct Scoped<R: Reconciler> {
    reconciler: R,
    pending: Vec<(String, R::Live)>,
}

impl<R: Reconciler> Scoped<R> {
    pub fn new(reconciler: R) -> Self {
        Self {
            reconciler,
            pending: Vec::new(),
        }
    }

    fn delete(&self, client: &mut dyn RpcClient, ctx: &RenderContext, key: &str, live: &R::Live) -> Result<()> {
        let resource = self.reconciler.resource();
        info!("Deleting {} {}", resource, key);
        match self.reconciler.delete(client, ctx, key, live) {
            Ok(()) => {
                metrics::record_mutation(resource, "delete");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("{} {} already absent: {}", resource, key, e);
                Ok(())
            }
            Err(e) => Err(e.attribute(resource, key)),
        }
    }

    fn add(&self, client: &mut dyn RpcClient, ctx: &RenderContext, key: &str, desired: &R::Desired) -> Result<()> {
        let resource = self.reconciler.resource();
        info!("Adding {} {}", resource, key);
        self.reconciler
            .add(client, ctx, key, desired)
            .map_err(|e| e.attribute(resource, key))?;
        metrics::record_mutation(resource, "add");
        Ok(())
    }
}

impl<R: Reconciler> Stage for Scoped<R> {
    fn resource(&self) -> &'static str {
        self.reconciler.resource()
    }

    fn enter(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()> {
        let resource = self.reconciler.resource();
        let desired = self.reconciler.desired(ctx)?;
        let mut live = self
            .reconciler
            .live(client, ctx)
            .map_err(|e| e.query(resource))?;
        let plan = Plan::compute(&self.reconciler, &desired, &live);
        debug!(
            resource,
            desired = desired.len(),
            live = live.len(),
            adds = plan.adds.len(),
            replaces = plan.replaces.len(),
            deletes = plan.deletes.len(),
            "Planned reconcile"
        );

        for (key, stale) in &plan.replaces {
            if let Some(entry) = live.get(stale) {
                self.delete(client, ctx, stale, entry)?;
            }
            self.add(client, ctx, key, &desired[key])?;
        }
        for key in &plan.adds {
            self.add(client, ctx, key, &desired[key])?;
        }
        for key in &plan.updates {
            self.reconciler
                .update(client, ctx, key, &desired[key], &live[key])
                .map_err(|e| e.attribute(resource, key))?;
        }

        self.pending = plan
            .deletes
            .into_iter()
            .filter_map(|key| live.remove(&key).map(|entry| (key, entry)))
            .collect();
        Ok(())
    }

    fn exit(&mut self, client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()> {
        for (key, entry) in std::mem::take(&mut self.pending) {
            self.delete(client, ctx, &key, &entry)?;
        }
        Ok(())
    }
}

/// Enter every stage in order, then exit them in reverse. The first error
/// aborts everything that remains.
pub fn run_nested(stages: &mut [Box<dyn Stage + '_>], client: &mut dyn RpcClient, ctx: &RenderContext) -> Result<()> {
    for stage in stages.iter_mut() {
        debug!("Entering {}", stage.resource());
        stage.enter(client, ctx)?;
    }
    for stage in stages.iter_mut().rev() {
        debug!("Leaving {}", stage.resource());
        stage.exit(client, ctx)?;
    }
    Ok(())
}

/// Restricts the bdev and namespace reconcilers to one namespace.
#[derive(Debug, Clone, Default)]
pub enum Scope {
    #[default]
    All,
    Single(NamespaceSelector),
}

/// Identity of one namespace: owning subsystem plus backing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSelector {
    pub subsys: String,
    pub device_type: DeviceType,
    pub device_path: String,
}

impl NamespaceSelector {
    pub fn new(ns: &Namespace) -> Self {
        Self {
            subsys: ns.subsys.clone(),
            device_type: ns.device_type,
            device_path: normalize_device_path(ns.device_type, &ns.device_path),
        }
    }

    pub fn matches(&self, ns: &Namespace) -> bool {
        ns.subsys == self.subsys
            && ns.device_type == self.device_type
            && normalize_device_path(ns.device_type, &ns.device_path) == self.device_path
    }
}

impl Scope {
    pub fn includes(&self, ns: &Namespace) -> bool {
        match self {
            Scope::All => true,
            Scope::Single(sel) => sel.matches(ns),
        }
    }
}

/// Every stage of a full reconcile, outermost first.
pub fn full_stages<'a>(keys: &'a KeyStore, engine: BdevEngine) -> Vec<Box<dyn Stage + 'a>> {
    vec![
        Box::new(Scoped::new(subsystem::SubsystemReconciler)),
        Box::new(transport::TransportStage),
        Box::new(Scoped::new(dhchap::DhchapKeyReconciler::new(KeyRole::Host, keys))),
        Box::new(Scoped::new(dhchap::DhchapKeyReconciler::new(KeyRole::Ctrl, keys))),
        Box::new(Scoped::new(port::PortReconciler)),
        Box::new(Scoped::new(referral::ReferralReconciler)),
        Box::new(Scoped::new(host::HostSubsysReconciler)),
        Box::new(Scoped::new(port::PortSubsysReconciler)),
        Box::new(ana::AnaStateStage::default()),
        Box::new(Scoped::new(bdev::BdevReconciler::new(engine, Scope::All))),
        Box::new(Scoped::new(namespace::NamespaceReconciler::new(Scope::All))),
    ]
}

/// Stages touching a single namespace and its bdev.
pub fn namespace_stages<'a>(engine: BdevEngine, ns: &Namespace) -> Vec<Box<dyn Stage + 'a>> {
    let scope = Scope::Single(NamespaceSelector::new(ns));
    vec![
        Box::new(Scoped::new(bdev::BdevReconciler::new(engine, scope.clone()))),
        Box::new(Scoped::new(namespace::NamespaceReconciler::new(scope))),
    ]
}
