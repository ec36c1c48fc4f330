//! DH-CHAP key files registered with the daemon keyring.
//!
//! The keyring name hashes the secret, so rotating a secret shows up as one
//! new key plus one stale key and no update path is needed.

use std::collections::BTreeMap;

use spdk_rpc::{KeyringKey, RpcClient, SpdkRpc};
use tracing::warn;

use super::Reconciler;
use crate::context::{Host, RenderContext};
use crate::error::Result;
use crate::keys::{KeyRole, KeyStore, key_name};

pub struct DhchapKeyReconciler<'a> {
    role: KeyRole,
    store: &'a KeyStore,
}

impl<'a> DhchapKeyReconciler<'a> {
    pub fn new(role: KeyRole, store: &'a KeyStore) -> Self {
        Self { role, store }
    }

    fn secret<'h>(&self, host: &'h Host) -> Option<&'h str> {
        match self.role {
            KeyRole::Host => host.dhchap_key.as_deref(),
            KeyRole::Ctrl => host.dhchap_ctrl_key.as_deref(),
        }
    }
}

impl Reconciler for DhchapKeyReconciler<'_> {
    /// The raw secret.
    type Desired = String;
    type Live = KeyringKey;

    fn resource(&self) -> &'static str {
        self.role.as_str()
    }

    fn desired(&self, ctx: &RenderContext) -> Result<BTreeMap<String, String>> {
        Ok(ctx
            .hosts()
            .iter()
            .filter_map(|host| {
                self.secret(host)
                    .map(|secret| (key_name(self.role, &host.hostnqn, secret), secret.to_string()))
            })
            .collect())
    }

    fn live(&self, client: &mut dyn RpcClient, _ctx: &RenderContext) -> Result<BTreeMap<String, KeyringKey>> {
        let prefix = self.role.name_prefix();
        Ok(client
            .keyring_get_keys()?
            .into_iter()
            .filter(|k| k.name.starts_with(&prefix))
            .map(|k| (k.name.clone(), k))
            .collect())
    }

    fn add(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, key: &str, secret: &String) -> Result<()> {
        let path = self.store.write(secret)?;
        if let Err(e) = client.keyring_file_add_key(key, &path.to_string_lossy()) {
            if let Err(cleanup) = self.store.remove(&path) {
                warn!("Failed to clean up key file {}: {}", path.display(), cleanup);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, client: &mut dyn RpcClient, _ctx: &RenderContext, key: &str, live: &KeyringKey) -> Result<()> {
        client.keyring_file_remove_key(key)?;
        if let Some(path) = &live.path {
            self.store.remove(path)?;
        }
        Ok(())
    }
}
