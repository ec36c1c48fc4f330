//! Typed wrappers for the daemon methods the reconciler consumes.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::client::RpcClient;
use crate::error::{Result, RpcError};
use crate::types::{AnaState, Bdev, KeyringKey, ListenAddress, Listener, NvmfSubsystem, NvmfTransport, Referral};

/// Parameters for `nvmf_create_subsystem`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateSubsystem {
    pub nqn: String,
    pub serial_number: String,
    pub model_number: String,
    pub allow_any_host: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cntlid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cntlid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ana_reporting: Option<bool>,
}

/// Parameters for `nvmf_create_transport`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateTransport {
    pub trtype: String,
    pub no_srq: bool,
    pub c2h_success: bool,
}

impl CreateTransport {
    pub fn with_defaults(trtype: impl Into<String>) -> Self {
        Self {
            trtype: trtype.into(),
            no_srq: false,
            c2h_success: true,
        }
    }
}

/// Parameters for `nvmf_subsystem_add_host`. The daemon spells the
/// controller key `dhchap_ctrlr_key`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddHost {
    pub nqn: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhchap_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhchap_ctrlr_key: Option<String>,
}

/// The `namespace` object of `nvmf_subsystem_add_ns`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceParams {
    pub bdev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nguid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anagrpid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsid: Option<u32>,
}

fn params<T: Serialize>(method: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|source| RpcError::Decode {
        method: method.to_string(),
        source,
    })
}

/// Typed access to the daemon, available on every [`RpcClient`].
pub trait SpdkRpc: RpcClient {
    /// Call `method` and decode its result as `T`.
    fn invoke<T: DeserializeOwned>(&mut self, method: &str, params: Option<Value>) -> Result<T> {
        let value = self.call(method, params)?;
        serde_json::from_value(value).map_err(|source| RpcError::Decode {
            method: method.to_string(),
            source,
        })
    }

    /// Call `method` for its side effect only.
    fn execute(&mut self, method: &str, params: Value) -> Result<()> {
        self.call(method, Some(params)).map(|_| ())
    }

    fn framework_wait_init(&mut self) -> Result<()> {
        self.call("framework_wait_init", None).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Subsystems
    // ------------------------------------------------------------------

    fn nvmf_get_subsystems(&mut self) -> Result<Vec<NvmfSubsystem>> {
        self.invoke("nvmf_get_subsystems", None)
    }

    fn nvmf_create_subsystem(&mut self, req: &CreateSubsystem) -> Result<()> {
        let p = params("nvmf_create_subsystem", req)?;
        self.execute("nvmf_create_subsystem", p)
    }

    fn nvmf_delete_subsystem(&mut self, nqn: &str) -> Result<()> {
        self.execute("nvmf_delete_subsystem", json!({ "nqn": nqn }))
    }

    fn nvmf_subsystem_allow_any_host(&mut self, nqn: &str, allow_any_host: bool) -> Result<()> {
        self.execute(
            "nvmf_subsystem_allow_any_host",
            json!({ "nqn": nqn, "allow_any_host": allow_any_host }),
        )
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    fn nvmf_get_transports(&mut self) -> Result<Vec<NvmfTransport>> {
        self.invoke("nvmf_get_transports", None)
    }

    fn nvmf_create_transport(&mut self, req: &CreateTransport) -> Result<()> {
        let p = params("nvmf_create_transport", req)?;
        self.execute("nvmf_create_transport", p)
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    fn nvmf_subsystem_add_listener(&mut self, nqn: &str, address: &ListenAddress) -> Result<()> {
        self.execute(
            "nvmf_subsystem_add_listener",
            json!({ "nqn": nqn, "listen_address": address }),
        )
    }

    fn nvmf_subsystem_remove_listener(&mut self, nqn: &str, address: &ListenAddress) -> Result<()> {
        self.execute(
            "nvmf_subsystem_remove_listener",
            json!({ "nqn": nqn, "listen_address": address }),
        )
    }

    fn nvmf_subsystem_get_listeners(&mut self, nqn: &str) -> Result<Vec<Listener>> {
        self.invoke("nvmf_subsystem_get_listeners", Some(json!({ "nqn": nqn })))
    }

    fn nvmf_subsystem_listener_set_ana_state(
        &mut self,
        nqn: &str,
        address: &ListenAddress,
        ana_state: AnaState,
        anagrpid: u32,
    ) -> Result<()> {
        self.execute(
            "nvmf_subsystem_listener_set_ana_state",
            json!({
                "nqn": nqn,
                "listen_address": address,
                "ana_state": ana_state,
                "anagrpid": anagrpid,
            }),
        )
    }

    // ------------------------------------------------------------------
    // Hosts
    // ------------------------------------------------------------------

    fn nvmf_subsystem_add_host(&mut self, req: &AddHost) -> Result<()> {
        let p = params("nvmf_subsystem_add_host", req)?;
        self.execute("nvmf_subsystem_add_host", p)
    }

    fn nvmf_subsystem_remove_host(&mut self, nqn: &str, host: &str) -> Result<()> {
        self.execute("nvmf_subsystem_remove_host", json!({ "nqn": nqn, "host": host }))
    }

    // ------------------------------------------------------------------
    // Discovery referrals
    // ------------------------------------------------------------------

    fn nvmf_discovery_get_referrals(&mut self) -> Result<Vec<Referral>> {
        self.invoke("nvmf_discovery_get_referrals", None)
    }

    fn nvmf_discovery_add_referral(&mut self, address: &ListenAddress) -> Result<()> {
        self.execute("nvmf_discovery_add_referral", json!({ "address": address }))
    }

    fn nvmf_discovery_remove_referral(&mut self, address: &ListenAddress) -> Result<()> {
        self.execute("nvmf_discovery_remove_referral", json!({ "address": address }))
    }

    // ------------------------------------------------------------------
    // Keyring
    // ------------------------------------------------------------------

    fn keyring_get_keys(&mut self) -> Result<Vec<KeyringKey>> {
        self.invoke("keyring_get_keys", None)
    }

    fn keyring_file_add_key(&mut self, name: &str, path: &str) -> Result<()> {
        self.execute("keyring_file_add_key", json!({ "name": name, "path": path }))
    }

    fn keyring_file_remove_key(&mut self, name: &str) -> Result<()> {
        self.execute("keyring_file_remove_key", json!({ "name": name }))
    }

    // ------------------------------------------------------------------
    // Block devices
    // ------------------------------------------------------------------

    fn bdev_get_bdevs(&mut self) -> Result<Vec<Bdev>> {
        self.invoke("bdev_get_bdevs", None)
    }

    fn bdev_aio_create(&mut self, name: &str, filename: &str, block_size: Option<u32>) -> Result<()> {
        let mut p = json!({ "name": name, "filename": filename });
        if let Some(block_size) = block_size {
            p["block_size"] = json!(block_size);
        }
        self.execute("bdev_aio_create", p)
    }

    fn bdev_aio_delete(&mut self, name: &str) -> Result<()> {
        self.execute("bdev_aio_delete", json!({ "name": name }))
    }

    fn bdev_aio_rescan(&mut self, name: &str) -> Result<()> {
        self.execute("bdev_aio_rescan", json!({ "name": name }))
    }

    fn bdev_uring_create(&mut self, name: &str, filename: &str) -> Result<()> {
        self.execute("bdev_uring_create", json!({ "name": name, "filename": filename }))
    }

    fn bdev_uring_delete(&mut self, name: &str) -> Result<()> {
        self.execute("bdev_uring_delete", json!({ "name": name }))
    }

    fn bdev_uring_rescan(&mut self, name: &str) -> Result<()> {
        self.execute("bdev_uring_rescan", json!({ "name": name }))
    }

    fn bdev_null_create(&mut self, name: &str, num_blocks: u64, block_size: u32) -> Result<()> {
        self.execute(
            "bdev_null_create",
            json!({ "name": name, "num_blocks": num_blocks, "block_size": block_size }),
        )
    }

    fn bdev_null_delete(&mut self, name: &str) -> Result<()> {
        self.execute("bdev_null_delete", json!({ "name": name }))
    }

    // ------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------

    /// Attach a namespace; returns the namespace ID the daemon assigned.
    fn nvmf_subsystem_add_ns(&mut self, nqn: &str, namespace: &NamespaceParams) -> Result<u32> {
        self.invoke(
            "nvmf_subsystem_add_ns",
            Some(json!({ "nqn": nqn, "namespace": namespace })),
        )
    }

    fn nvmf_subsystem_remove_ns(&mut self, nqn: &str, nsid: u32) -> Result<()> {
        self.execute("nvmf_subsystem_remove_ns", json!({ "nqn": nqn, "nsid": nsid }))
    }
}

impl<C: RpcClient + ?Sized> SpdkRpc for C {}

/// Methods that only read daemon state.
pub const READ_ONLY_METHODS: &[&str] = &[
    "framework_wait_init",
    "nvmf_get_subsystems",
    "nvmf_get_transports",
    "nvmf_subsystem_get_listeners",
    "nvmf_discovery_get_referrals",
    "keyring_get_keys",
    "bdev_get_bdevs",
];

pub fn is_read_only(method: &str) -> bool {
    READ_ONLY_METHODS.contains(&method)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the last request and answers with a canned value.
    struct Recorder {
        last: Option<(String, Option<Value>)>,
        answer: Value,
    }

    impl RpcClient for Recorder {
        fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
            self.last = Some((method.to_string(), params));
            Ok(self.answer.clone())
        }
    }

    fn recorder(answer: Value) -> Recorder {
        Recorder { last: None, answer }
    }

    #[test]
    fn test_create_subsystem_omits_unset_cntlids() {
        let mut client = recorder(json!(true));
        let req = CreateSubsystem {
            nqn: "nqn.2025-01.example:s1".into(),
            serial_number: "abc123".into(),
            model_number: "model".into(),
            allow_any_host: true,
            min_cntlid: None,
            max_cntlid: Some(31999),
            ana_reporting: Some(true),
        };
        client.nvmf_create_subsystem(&req).unwrap();
        let (method, params) = client.last.unwrap();
        assert_eq!(method, "nvmf_create_subsystem");
        let params = params.unwrap();
        assert_eq!(params["max_cntlid"], 31999);
        assert!(params.get("min_cntlid").is_none());
        assert_eq!(params["ana_reporting"], true);
    }

    #[test]
    fn test_add_host_uses_daemon_ctrlr_spelling() {
        let mut client = recorder(json!(true));
        client
            .nvmf_subsystem_add_host(&AddHost {
                nqn: "nqn.s".into(),
                host: "nqn.h".into(),
                dhchap_key: None,
                dhchap_ctrlr_key: Some("dhchap_ctrl_key-h-1".into()),
            })
            .unwrap();
        let params = client.last.unwrap().1.unwrap();
        assert_eq!(params["dhchap_ctrlr_key"], "dhchap_ctrl_key-h-1");
        assert!(params.get("dhchap_key").is_none());
    }

    #[test]
    fn test_listener_params_nest_address() {
        let mut client = recorder(json!(true));
        let addr = ListenAddress::new("TCP", "IPv4", "10.0.0.1", "4420");
        client
            .nvmf_subsystem_listener_set_ana_state("nqn.s", &addr, AnaState::Inaccessible, 2)
            .unwrap();
        let params = client.last.unwrap().1.unwrap();
        assert_eq!(params["listen_address"]["traddr"], "10.0.0.1");
        assert_eq!(params["ana_state"], "inaccessible");
        assert_eq!(params["anagrpid"], 2);
    }

    #[test]
    fn test_add_ns_returns_nsid() {
        let mut client = recorder(json!(7));
        let nsid = client
            .nvmf_subsystem_add_ns(
                "nqn.s",
                &NamespaceParams {
                    bdev_name: "ZVOL:tank/vol1".into(),
                    uuid: None,
                    nguid: None,
                    anagrpid: Some(1),
                    nsid: None,
                },
            )
            .unwrap();
        assert_eq!(nsid, 7);
    }

    #[test]
    fn test_decode_failure_names_method() {
        let mut client = recorder(json!("not a list"));
        let err = client.nvmf_get_transports().unwrap_err();
        assert_eq!(err.method(), Some("nvmf_get_transports"));
        assert!(matches!(err, RpcError::Decode { .. }));
    }

    #[test]
    fn test_read_only_methods() {
        assert!(is_read_only("bdev_get_bdevs"));
        assert!(!is_read_only("bdev_null_create"));
    }
}
