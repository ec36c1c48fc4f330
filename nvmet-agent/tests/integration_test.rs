//! Integration tests for nvmet-agent
//!
//! These tests drive the public entry points against the in-memory target
//! daemon from `spdk_rpc::mock`, which enforces the same ordering rules as
//! the real daemon and records every call.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use spdk_rpc::mock::{Call, MockTarget};
use spdk_rpc::{AnaState, DISCOVERY_NQN};
use tempfile::TempDir;

use nvmet_agent::context::{
    AddressFamily, FailoverStatus, Host, HostSubsys, Node, Port, PortSubsys, Subsystem, Trtype,
};
use nvmet_agent::keys::{KeyRole, KeyStore, key_name};
use nvmet_agent::reconcile::bdev::BdevReconciler;
use nvmet_agent::reconcile::dhchap::DhchapKeyReconciler;
use nvmet_agent::reconcile::host::HostSubsysReconciler;
use nvmet_agent::reconcile::namespace::NamespaceReconciler;
use nvmet_agent::reconcile::port::{PortReconciler, PortSubsysReconciler};
use nvmet_agent::reconcile::referral::ReferralReconciler;
use nvmet_agent::reconcile::subsystem::SubsystemReconciler;
use nvmet_agent::reconcile::{Plan, Reconciler, Scope};
use nvmet_agent::{BdevEngine, Environment, Namespace, NvmetError, NvmetTarget, RenderContext, TargetConfig};

const S1: &str = "nqn.2025-01.example:s1";
const S2: &str = "nqn.2025-01.example:s2";
const H1: &str = "nqn.2014-08.org.nvmexpress:uuid:h1";

/// A temp key directory plus an agent bound to a fresh mock daemon
struct Harness {
    _dir: TempDir,
    target: MockTarget,
    agent: NvmetTarget<MockTarget>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let target = MockTarget::new();
        let agent = NvmetTarget::new(target.clone(), KeyStore::new(dir.path().join("keys")), BdevEngine::Uring);
        Self {
            _dir: dir,
            target,
            agent,
        }
    }

    fn apply(&self, ctx: &RenderContext) {
        self.agent.write_config(ctx).unwrap();
    }

    /// Apply and return the mutations issued by this run only
    fn apply_recording(&self, ctx: &RenderContext) -> Vec<Call> {
        self.target.clear_calls();
        self.apply(ctx);
        self.target.mutations()
    }
}

fn methods(calls: &[Call]) -> Vec<&str> {
    calls.iter().map(|c| c.method.as_str()).collect()
}

fn listen_traddr(call: &Call) -> Option<&str> {
    call.param("listen_address")
        .and_then(|a| a.get("traddr"))
        .and_then(Value::as_str)
}

/// Scenario A input, written the way the supervisor's config file carries it
fn scenario_a() -> TargetConfig {
    serde_json::from_value(json!({
        "subsystems": [
            { "subnqn": S1, "serial": "a1b2c3d4", "allow_any_host": true }
        ],
        "ports": [
            {
                "index": 1,
                "addr_trtype": "TCP",
                "addr_adrfam": "IPV4",
                "addr_traddr": "10.0.0.1",
                "addr_trsvcid": "4420"
            }
        ],
        "port_subsys": [ { "port": 1, "subsys": S1 } ],
        "namespaces": [
            {
                "nsid": 1,
                "subsys": S1,
                "device_type": "ZVOL",
                "device_path": "zvol/tank/vol1",
                "device_uuid": "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
                "device_nguid": "9f0b7a1c-3d2e-4f5a-8b6c-7d8e9fa0b1c2"
            }
        ]
    }))
    .unwrap()
}

fn single(config: TargetConfig) -> RenderContext {
    RenderContext::new(config, Environment::default()).unwrap()
}

fn ha_env(status: FailoverStatus, node: Node) -> Environment {
    serde_json::from_value(json!({
        "failover": { "licensed": true, "status": status, "node": node },
        "ana_enabled": false,
        "address_choices": { "TCP": { "10.0.0.1": "10.0.0.11/10.0.0.12" } }
    }))
    .unwrap()
}

/// Scenario A with the subsystem opted into ANA
fn ana_config() -> TargetConfig {
    let mut config = scenario_a();
    config.subsystems[0].ana = Some(true);
    config
}

fn ha(config: TargetConfig, status: FailoverStatus, node: Node) -> RenderContext {
    RenderContext::new(config, ha_env(status, node)).unwrap()
}

/// A configuration exercising every resource class
fn full_config() -> TargetConfig {
    let mut config = ana_config();
    config.subsystems.push(Subsystem {
        subnqn: S2.to_string(),
        serial: "plain01".to_string(),
        allow_any_host: false,
        ana: Some(false),
    });
    config.ports.push(Port {
        index: 2,
        addr_trtype: Trtype::Tcp,
        addr_adrfam: AddressFamily::Ipv4,
        addr_traddr: "10.0.1.1".to_string(),
        addr_trsvcid: "4420".to_string(),
    });
    config.port_subsys.push(PortSubsys {
        port: 2,
        subsys: S2.to_string(),
    });
    config.hosts.push(Host {
        hostnqn: H1.to_string(),
        dhchap_key: Some("DHHC-1:00:host-secret:".to_string()),
        dhchap_ctrl_key: Some("DHHC-1:00:ctrl-secret:".to_string()),
    });
    for subsys in [S1, S2] {
        config.host_subsys.push(HostSubsys {
            host: H1.to_string(),
            subsys: subsys.to_string(),
        });
    }
    let mut ns2 = config.namespaces[0].clone();
    ns2.subsys = S2.to_string();
    ns2.device_path = "tank/my vol".to_string();
    ns2.nsid = None;
    ns2.device_uuid = uuid::Uuid::from_u128(0x11);
    ns2.device_nguid = uuid::Uuid::from_u128(0x22);
    config.namespaces.push(ns2);
    config
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

/// Test minimal single-node bring-up issues the expected RPCs in order
#[test]
fn test_scenario_a_bring_up() {
    let h = Harness::new();
    let calls = h.apply_recording(&single(scenario_a()));
    assert_eq!(
        methods(&calls),
        vec![
            "nvmf_create_subsystem",
            "nvmf_create_transport",
            "nvmf_subsystem_add_listener",
            "nvmf_subsystem_add_listener",
            "bdev_uring_create",
            "nvmf_subsystem_add_ns",
        ]
    );
    assert_eq!(calls[2].str_param("nqn"), Some(DISCOVERY_NQN));
    assert_eq!(listen_traddr(&calls[2]), Some("10.0.0.1"));
    assert_eq!(calls[3].str_param("nqn"), Some(S1));
    assert_eq!(calls[4].str_param("filename"), Some("/dev/zvol/tank/vol1"));
    assert_eq!(calls[5].param("namespace").and_then(|n| n.get("nsid")), Some(&json!(1)));
}

/// Test that a re-run against a converged daemon only reads
#[test]
fn test_scenario_b_rerun_is_noop() {
    let h = Harness::new();
    let ctx = single(scenario_a());
    h.apply(&ctx);
    assert!(h.apply_recording(&ctx).is_empty());
    assert!(!h.target.calls().is_empty(), "reads are still issued");
}

/// Test that an address change adds the new listeners before removing the old
#[test]
fn test_scenario_c_address_change() {
    let h = Harness::new();
    h.apply(&single(scenario_a()));

    let mut moved = scenario_a();
    moved.ports[0].addr_traddr = "10.0.0.2".to_string();
    let calls = h.apply_recording(&single(moved));
    let listeners: Vec<(&str, Option<&str>, Option<&str>)> = calls
        .iter()
        .map(|c| (c.method.as_str(), c.str_param("nqn"), listen_traddr(c)))
        .collect();
    assert_eq!(
        listeners,
        vec![
            ("nvmf_subsystem_add_listener", Some(DISCOVERY_NQN), Some("10.0.0.2")),
            ("nvmf_subsystem_add_listener", Some(S1), Some("10.0.0.2")),
            ("nvmf_subsystem_remove_listener", Some(S1), Some("10.0.0.1")),
            ("nvmf_subsystem_remove_listener", Some(DISCOVERY_NQN), Some("10.0.0.1")),
        ]
    );
}

/// Test that locking a namespace detaches it and then deletes its bdev
#[test]
fn test_scenario_d_lock() {
    let h = Harness::new();
    let ctx = single(scenario_a());
    h.apply(&ctx);
    h.target.clear_calls();

    let ns = ctx.namespaces()[0].clone();
    h.agent.lock_namespace(&ns, &ctx).unwrap();
    let calls = h.target.mutations();
    assert_eq!(methods(&calls), vec!["nvmf_subsystem_remove_ns", "bdev_uring_delete"]);
    assert_eq!(calls[0].param("nsid"), Some(&json!(1)));
    assert_eq!(calls[1].str_param("name"), Some("ZVOL:tank/vol1"));
}

/// Test failover to standby demotes first, then swaps backings for stubs
#[test]
fn test_scenario_e_master_to_backup() {
    let h = Harness::new();
    h.apply(&ha(ana_config(), FailoverStatus::Master, Node::A));
    let listeners = h.target.listeners(S1);
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].address.traddr, "10.0.0.11");
    assert_eq!(listeners[0].ana_state(2), Some(AnaState::Optimized));

    let calls = h.apply_recording(&ha(ana_config(), FailoverStatus::Backup, Node::A));
    assert_eq!(
        methods(&calls),
        vec![
            "nvmf_subsystem_listener_set_ana_state",
            "bdev_null_create",
            "nvmf_subsystem_remove_ns",
            "nvmf_subsystem_add_ns",
            "bdev_uring_delete",
        ]
    );
    assert_eq!(calls[0].str_param("ana_state"), Some("inaccessible"));
    assert_eq!(calls[0].param("anagrpid"), Some(&json!(2)));
    assert_eq!(calls[1].str_param("name"), Some("NULL:ZVOL:tank/vol1"));

    let ns = &h.target.subsystem(S1).unwrap().namespaces[0];
    assert_eq!((ns.nsid, ns.bdev_name.as_str()), (1, "NULL:ZVOL:tank/vol1"));
}

/// Test failback to master promotes only after everything is rebuilt
#[test]
fn test_backup_to_master_promotes_last() {
    let h = Harness::new();
    h.apply(&ha(ana_config(), FailoverStatus::Backup, Node::A));
    assert_eq!(h.target.listeners(S1)[0].ana_state(2), Some(AnaState::Inaccessible));

    let calls = h.apply_recording(&ha(ana_config(), FailoverStatus::Master, Node::A));
    assert_eq!(
        methods(&calls),
        vec![
            "bdev_uring_create",
            "nvmf_subsystem_remove_ns",
            "nvmf_subsystem_add_ns",
            "bdev_null_delete",
            "nvmf_subsystem_listener_set_ana_state",
        ]
    );
    assert_eq!(calls[4].str_param("ana_state"), Some("optimized"));
    assert_eq!(h.target.listeners(S1)[0].ana_state(2), Some(AnaState::Optimized));
}

/// Test DH-CHAP rotation never leaves the host bound to a missing key
#[test]
fn test_scenario_f_key_rotation() {
    let h = Harness::new();
    let mut config = scenario_a();
    config.hosts.push(Host {
        hostnqn: H1.to_string(),
        dhchap_key: Some("K1".to_string()),
        dhchap_ctrl_key: None,
    });
    config.host_subsys.push(HostSubsys {
        host: H1.to_string(),
        subsys: S1.to_string(),
    });
    h.apply(&single(config.clone()));

    config.hosts[0].dhchap_key = Some("K2".to_string());
    let calls = h.apply_recording(&single(config));
    let old = key_name(KeyRole::Host, H1, "K1");
    let new = key_name(KeyRole::Host, H1, "K2");
    assert_eq!(
        methods(&calls),
        vec![
            "keyring_file_add_key",
            "nvmf_subsystem_remove_host",
            "nvmf_subsystem_add_host",
            "keyring_file_remove_key",
        ]
    );
    assert_eq!(calls[0].str_param("name"), Some(new.as_str()));
    assert_eq!(calls[2].str_param("dhchap_key"), Some(new.as_str()));
    assert_eq!(calls[3].str_param("name"), Some(old.as_str()));

    // Only the new key file is left in the key directory.
    let files: Vec<_> = std::fs::read_dir(h.agent.keys().dir()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

// ============================================================================
// Properties
// ============================================================================

fn converged<R: Reconciler>(reconciler: R, target: &MockTarget, ctx: &RenderContext) -> bool {
    let mut client = target.clone();
    let desired = reconciler.desired(ctx).unwrap();
    let live = reconciler.live(&mut client, ctx).unwrap();
    Plan::compute(&reconciler, &desired, &live).is_empty()
}

fn assert_converged(h: &Harness, ctx: &RenderContext) {
    let keys = h.agent.keys();
    let t = &h.target;
    assert!(converged(SubsystemReconciler, t, ctx));
    assert!(converged(DhchapKeyReconciler::new(KeyRole::Host, keys), t, ctx));
    assert!(converged(DhchapKeyReconciler::new(KeyRole::Ctrl, keys), t, ctx));
    assert!(converged(PortReconciler, t, ctx));
    assert!(converged(ReferralReconciler, t, ctx));
    assert!(converged(HostSubsysReconciler, t, ctx));
    assert!(converged(PortSubsysReconciler, t, ctx));
    assert!(converged(BdevReconciler::new(BdevEngine::Uring, Scope::All), t, ctx));
    assert!(converged(NamespaceReconciler::new(Scope::All), t, ctx));
}

/// Test idempotence and convergence across every node role
#[test]
fn test_idempotent_and_converged_in_every_role() {
    let contexts = vec![
        single(full_config()),
        ha(full_config(), FailoverStatus::Master, Node::A),
        ha(full_config(), FailoverStatus::Backup, Node::A),
        ha(full_config(), FailoverStatus::Master, Node::B),
        ha(full_config(), FailoverStatus::Backup, Node::B),
    ];
    for ctx in &contexts {
        let h = Harness::new();
        h.apply(ctx);
        assert_converged(&h, ctx);
        assert!(h.apply_recording(ctx).is_empty(), "second run must not mutate");
    }
}

/// Test that moving between roles converges without leftovers
#[test]
fn test_role_transitions_converge() {
    let h = Harness::new();
    let sequence = [
        ha(full_config(), FailoverStatus::Master, Node::A),
        ha(full_config(), FailoverStatus::Backup, Node::A),
        ha(full_config(), FailoverStatus::Master, Node::A),
        single(full_config()),
    ];
    for ctx in &sequence {
        h.apply(ctx);
        assert_converged(&h, ctx);
    }
}

/// Test that the discovery subsystem is never deleted
#[test]
fn test_discovery_preserved() {
    let h = Harness::new();
    h.apply(&single(full_config()));
    h.target.clear_calls();
    h.apply(&single(TargetConfig::default()));

    assert!(
        h.target
            .mutations()
            .iter()
            .filter(|c| c.method == "nvmf_delete_subsystem")
            .all(|c| c.str_param("nqn") != Some(DISCOVERY_NQN))
    );
    assert_eq!(h.target.subsystem_nqns(), vec![DISCOVERY_NQN.to_string()]);
    assert!(h.target.bdevs().is_empty());
    assert!(h.target.keys().is_empty());
    assert!(h.target.listeners(DISCOVERY_NQN).is_empty());
}

/// Test controller ID ranges on either node of an HA pair
#[test]
fn test_cntlid_partition() {
    for (node, min, max) in [(Node::A, None, Some(31999)), (Node::B, Some(32000), None)] {
        let h = Harness::new();
        h.apply(&ha(full_config(), FailoverStatus::Master, node));
        let creates: Vec<Call> = h
            .target
            .mutations()
            .into_iter()
            .filter(|c| c.method == "nvmf_create_subsystem")
            .collect();
        assert_eq!(creates.len(), 2);
        for create in &creates {
            assert_eq!(create.param("min_cntlid").cloned(), min.map(|v: u16| json!(v)));
            assert_eq!(create.param("max_cntlid").cloned(), max.map(|v: u16| json!(v)));
            assert_eq!(create.param("ana_reporting"), Some(&json!(true)));
        }
    }
}

/// Test that a standby exposes nothing but ANA listeners and stub bdevs
#[test]
fn test_standby_silence() {
    let h = Harness::new();
    h.apply(&ha(full_config(), FailoverStatus::Backup, Node::B));

    for call in h.target.mutations() {
        if call.method == "nvmf_subsystem_add_listener" {
            assert_eq!(listen_traddr(&call), Some("10.0.0.12"), "only the node ANA address");
        }
    }
    assert!(h.target.subsystem(S2).is_none());
    let bdevs = h.target.bdevs();
    assert!(!bdevs.is_empty());
    assert!(bdevs.iter().all(|b| b.product_name == spdk_rpc::PRODUCT_NULL));
}

/// Test that keyring names follow the secret and nothing else
#[test]
fn test_key_hashing_identity() {
    let names = |secret: &str| -> Vec<String> {
        let h = Harness::new();
        let mut config = full_config();
        config.hosts[0].dhchap_key = Some(secret.to_string());
        h.apply(&single(config));
        h.target.keys().into_keys().collect()
    };
    let first = names("DHHC-1:00:one:");
    assert_eq!(first, names("DHHC-1:00:one:"));
    assert_ne!(first, names("DHHC-1:00:two:"));
}

/// Test that lock then unlock restores an equivalent converged state
#[test]
fn test_lock_unlock_round_trip() {
    let h = Harness::new();
    let ctx = ha(full_config(), FailoverStatus::Master, Node::B);
    h.apply(&ctx);
    let before = (h.target.subsystem(S1), h.target.subsystem(S2), h.target.bdevs());

    for ns in ctx.namespaces() {
        h.agent.lock_namespace(ns, &ctx).unwrap();
    }
    assert!(h.target.bdevs().is_empty());
    for ns in ctx.namespaces() {
        h.agent.unlock_namespace(ns, &ctx).unwrap();
    }

    let after = (h.target.subsystem(S1), h.target.subsystem(S2), h.target.bdevs());
    assert_eq!(before, after);
    assert!(h.apply_recording(&ctx).is_empty());
}

// ============================================================================
// Failure handling
// ============================================================================

/// Test that invalid configurations are rejected before the daemon is touched
#[test]
fn test_invalid_config_fails_closed() {
    let mut duplicate_port = scenario_a();
    duplicate_port.ports.push(duplicate_port.ports[0].clone());
    let err = RenderContext::new(duplicate_port, Environment::default()).unwrap_err();
    assert!(matches!(err, NvmetError::InvalidConfig(_)));

    // An ANA port on an HA node needs an address pair.
    let err = RenderContext::new(
        ana_config(),
        Environment {
            address_choices: BTreeMap::new(),
            ..ha_env(FailoverStatus::Master, Node::A)
        },
    )
    .unwrap_err();
    assert!(err.to_string().contains("address pair"));

    let mut dangling = scenario_a();
    dangling.port_subsys[0].port = 9;
    assert!(RenderContext::new(dangling, Environment::default()).is_err());
}

/// Test that a daemon that goes away is reported as unavailable
#[test]
fn test_daemon_unavailable() {
    let h = Harness::new();
    let ctx = single(scenario_a());
    h.target.set_available(false);
    let err = h.agent.write_config(&ctx).unwrap_err();
    assert!(err.is_unavailable());
    assert!(h.target.calls().is_empty());
    assert!(!h.agent.nvmf_ready(true));

    h.target.set_available(true);
    assert!(h.agent.nvmf_ready(false));
    h.apply(&ctx);
    assert_converged(&h, &ctx);
}

/// Test that a failed add aborts the run and names the resource and key
#[test]
fn test_protocol_error_aborts_with_key() {
    let h = Harness::new();
    h.target.fail_next("nvmf_create_subsystem", -32602, "Invalid parameters");
    let err = h.agent.write_config(&single(scenario_a())).unwrap_err();
    match &err {
        NvmetError::Rpc { resource, key, .. } => {
            assert_eq!(*resource, "subsystem");
            assert_eq!(key, S1);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("nvmf_create_subsystem"));
    assert_eq!(methods(&h.target.mutations()), vec!["nvmf_create_subsystem"]);

    // The next run converges.
    h.apply(&single(scenario_a()));
    assert_converged(&h, &single(scenario_a()));
}

/// Test that objects removed behind the agent's back are not an error
#[test]
fn test_already_absent_delete_is_tolerated() {
    let h = Harness::new();
    let ctx = single(scenario_a());
    h.apply(&ctx);
    let ns = ctx.namespaces()[0].clone();

    h.target.fail_next("bdev_uring_delete", -19, "No such device");
    h.agent.lock_namespace(&ns, &ctx).unwrap();
    // The injected failure left the bdev in place; the next lock removes it.
    assert!(h.target.bdev("ZVOL:tank/vol1").is_some());
    h.agent.lock_namespace(&ns, &ctx).unwrap();
    assert!(h.target.bdevs().is_empty());
}

/// Test that namespace hooks tolerate a daemon that never saw the namespace
#[test]
fn test_hooks_on_unknown_namespace() {
    let h = Harness::new();
    let ctx = single(scenario_a());
    let ns: Namespace = ctx.namespaces()[0].clone();
    h.agent.lock_namespace(&ns, &ctx).unwrap();
    h.agent.resize_namespace(&ns, &ctx).unwrap();
    assert!(h.target.mutations().is_empty());
}
