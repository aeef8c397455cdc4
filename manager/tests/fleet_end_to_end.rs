// File: manager/tests/fleet_end_to_end.rs
//! End-to-end scenarios from spec §8, exercised against a real
//! `ConfigStore`, a fake `jcli` shell script standing in for the node
//! CLI, and a wiremock stand-in for the supervisor's XML-RPC endpoint.

use fleet_supervisor::config::ConfigStore;
use fleet_supervisor::fleet_manager::FleetManager;
use fleet_supervisor::fleet_view::{FleetRegistry, FleetView};
use fleet_supervisor::node_client::{new_cli_mutex, NodeClient};
use fleet_supervisor::node_monitor::{NodeMonitor, NodeState};
use fleet_supervisor::notifier::LoggingNotifier;
use fleet_supervisor::supervisor_client::SupervisorClient;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Fakes the subset of `supervisor.*` XML-RPC calls this crate drives,
/// keyed by service name so one server can back a multi-node fleet.
struct FakeSupervisor {
    state_by_service: StdMutex<HashMap<String, i64>>,
}

impl FakeSupervisor {
    fn new() -> Arc<Self> {
        Arc::new(Self { state_by_service: StdMutex::new(HashMap::new()) })
    }

    fn set_state(&self, service: &str, code: i64) {
        self.state_by_service.lock().unwrap().insert(service.to_string(), code);
    }
}

fn extract_service_name(body: &str) -> String {
    let start = body.find("<string>").map(|i| i + "<string>".len()).unwrap_or(0);
    let end = body[start..].find("</string>").map(|i| start + i).unwrap_or(body.len());
    body[start..end].to_string()
}

fn bool_response(value: bool) -> ResponseTemplate {
    let body = format!(
        "<?xml version=\"1.0\"?><methodResponse><params><param><value><boolean>{}</boolean></value></param></params></methodResponse>",
        if value { 1 } else { 0 }
    );
    ResponseTemplate::new(200).set_body_string(body)
}

fn process_info_response(state: i64) -> ResponseTemplate {
    let body = format!(
        "<?xml version=\"1.0\"?><methodResponse><params><param><value><struct>\
         <member><name>state</name><value><int>{}</int></value></member>\
         <member><name>start</name><value><int>1000</int></value></member>\
         <member><name>now</name><value><int>1000</int></value></member>\
         </struct></value></param></params></methodResponse>",
        state
    );
    ResponseTemplate::new(200).set_body_string(body)
}

impl Respond for FakeSupervisor {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body = String::from_utf8_lossy(&request.body).to_string();
        let service = extract_service_name(&body);

        if body.contains("startProcess") {
            self.set_state(&service, 10); // bootstrapping immediately after start
            bool_response(true)
        } else if body.contains("stopProcess") {
            self.set_state(&service, 0);
            bool_response(true)
        } else if body.contains("getProcessInfo") {
            let code = *self.state_by_service.lock().unwrap().get(&service).unwrap_or(&0);
            process_info_response(code)
        } else {
            ResponseTemplate::new(500)
        }
    }
}

/// Writes a fake `jcli` whose behavior is driven by flat files under
/// `resp_dir`, which the test mutates between ticks to simulate node
/// progress. Order matters: longer/overlapping subcommand strings must
/// be matched before their prefixes.
async fn write_fake_jcli(path: &std::path::Path, resp_dir: &std::path::Path) {
    let script = format!(
        r#"#!/bin/sh
RESP="{resp}"
case "$*" in
  *"leaders logs get"*) cat "$RESP/logs.json" ;;
  *"leaders post"*) echo '[1]' > "$RESP/leaders.json"; echo posted ;;
  *"leaders delete"*) echo '[]' > "$RESP/leaders.json"; echo success ;;
  *"leaders get"*) cat "$RESP/leaders.json" ;;
  *"node stats get"*) cat "$RESP/stats.json" ;;
  *"block"*) cat "$RESP/block.hex" ;;
  *) echo '{{}}' ;;
esac
exit 0
"#,
        resp = resp_dir.display()
    );
    tokio::fs::write(path, script).await.unwrap();
    let mut perms = tokio::fs::metadata(path).await.unwrap().permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await.unwrap();

    tokio::fs::write(resp_dir.join("leaders.json"), "[]").await.unwrap();
    tokio::fs::write(resp_dir.join("logs.json"), "[]").await.unwrap();
    tokio::fs::write(resp_dir.join("block.hex"), "0".repeat(240)).await.unwrap();
    // Empty object: no `lastBlockHeight` field, so `get_stats` reports
    // `NotReady` until a test writes real stats — standing in for a
    // node whose REST endpoint isn't answering yet.
    tokio::fs::write(resp_dir.join("stats.json"), "{}").await.unwrap();
}

async fn write_stats(resp_dir: &std::path::Path, height: u64, epoch: i64, slot: i64) {
    let stats = serde_json::json!({
        "state": "Running",
        "lastBlockHeight": height,
        "lastBlockHash": format!("hash{}", height),
        "lastBlockDate": format!("{}.{}", epoch, slot),
        "uptime": 10,
        "version": "0.13.0",
    });
    tokio::fs::write(resp_dir.join("stats.json"), stats.to_string()).await.unwrap();
}

struct NodeFixture {
    node_path: std::path::PathBuf,
}

impl NodeFixture {
    fn resp_dir(&self) -> std::path::PathBuf {
        self.node_path.clone()
    }
}

/// Builds a two-file `ConfigStore` fixture with `node_names.len()` nodes,
/// all pointed at `supervisor_url`, and rewinds `refresh_interval` to 1s
/// so monitor loops progress quickly under test.
async fn build_config_store(
    root: &std::path::Path,
    node_names: &[&str],
    supervisor_url: &str,
    tip_timeout_sec: i64,
) -> (ConfigStore, HashMap<String, NodeFixture>) {
    let mut fixtures = HashMap::new();
    let mut nodes_config = Vec::new();
    let mut port = 19000u16;

    for name in node_names {
        let node_dir = root.join(name);
        tokio::fs::create_dir_all(&node_dir).await.unwrap();
        write_fake_jcli(&node_dir.join("jcli"), &node_dir).await;

        nodes_config.push(serde_json::json!({
            "node_name": name,
            "jmanager_settings": {
                "node_path": node_dir.to_string_lossy(),
                "supervisor_service_name": name,
                "default_trusted_peers": ["default-peer"],
            },
            "config": { "rest": { "listen": format!("127.0.0.1:{}", port) } },
        }));
        port += 1;

        fixtures.insert(name.to_string(), NodeFixture { node_path: node_dir });
    }

    let pool_id_file = root.join("pool_id");
    let genesis_hash_file = root.join("genesis_hash");
    tokio::fs::write(&pool_id_file, "pool1").await.unwrap();
    tokio::fs::write(&genesis_hash_file, "abcdef0123456789").await.unwrap();

    let secret_dir = root.join("common");
    tokio::fs::create_dir_all(&secret_dir).await.unwrap();
    tokio::fs::write(secret_dir.join("secret.json"), "{}").await.unwrap();

    let main_config = serde_json::json!({
        "nodes_config": nodes_config,
        "common_config": {
            "jormungandr": {
                "timeouts": { "refresh_interval": 1, "tip_timeout": tip_timeout_sec, "leaders_refresh_interval": 1 },
                "tip_diff_threshold": 3,
                "common_dir": secret_dir.to_string_lossy(),
                "restarts_log_filename": "restarts.log",
                "secret": "secret.json",
                "supervisor_rest_api_url": supervisor_url,
            },
            "manager": {
                "timeout_between_restarts": 2,
                "min_scheduled_time_difference": 60,
                "send_slots_within": 600,
                "epoch_start_time": { "hour": 0, "minute": 0, "second": 0 },
                "pool_id_file": pool_id_file.to_string_lossy(),
                "genesis_hash_file": genesis_hash_file.to_string_lossy(),
            },
            "email": { "email_alerts": false },
            "pooltool": {
                "user_id": "user1",
                "status_summary": { "url": format!("{}/status", supervisor_url), "refresh_rate": 600 },
                "send_tip": { "url": format!("{}/tip", supervisor_url), "refresh_rate": 600 },
                "send_slots": { "url": format!("{}/slots", supervisor_url), "key_path": root.join("keys").to_string_lossy() },
            },
        },
    });

    let template = serde_json::json!({ "rest": { "listen": "127.0.0.1:0" }, "p2p": { "trusted_peers": [] } });

    let main_path = root.join("jmanager_config.json");
    let template_path = root.join("config_template.json");
    tokio::fs::write(&main_path, main_config.to_string()).await.unwrap();
    tokio::fs::write(&template_path, template.to_string()).await.unwrap();

    let store = ConfigStore::load(&main_path, &template_path).await.unwrap();
    store.write_all_node_configs().await.unwrap();
    (store, fixtures)
}

async fn build_fleet(store: ConfigStore) -> (Arc<FleetRegistry>, Arc<FleetManager>, Vec<Arc<NodeMonitor>>, Arc<ConfigStore>) {
    let store = Arc::new(store);
    let snapshot = store.get().await;
    let cli_mutex = new_cli_mutex();
    let supervisor = Arc::new(SupervisorClient::new(&snapshot.common.supervisor_rpc_url));
    let registry = Arc::new(FleetRegistry::new());

    let mut monitors = Vec::new();
    for node_config in snapshot.nodes.values() {
        let client = NodeClient::new(node_config.cli_tool_path.clone(), node_config.rest_host.clone(), cli_mutex.clone());
        let monitor = Arc::new(NodeMonitor::new(node_config.clone(), snapshot.common.clone(), client, cli_mutex.clone(), supervisor.clone()));
        registry.register(node_config.node_name.clone(), monitor.clone());
        monitors.push(monitor);
    }
    for monitor in &monitors {
        let view: Arc<dyn FleetView> = registry.clone();
        monitor.bind_fleet_view(view);
    }

    let fleet_manager = Arc::new(FleetManager::new(registry.clone(), store.clone(), Arc::new(LoggingNotifier)));
    (registry, fleet_manager, monitors, store)
}

#[tokio::test]
async fn bootstrap_single_node_starts_and_logs_restart() {
    let server = MockServer::start().await;
    let fake = FakeSupervisor::new();
    Mock::given(wiremock::matchers::method("POST")).respond_with(fake.clone()).mount(&server).await;
    fake.set_state("node-a", 0); // stopped

    let root = TempDir::new().unwrap();
    let (store, fixtures) = build_config_store(root.path(), &["node-a"], &server.uri(), 30).await;
    let (_registry, fleet_manager, monitors, config_store) = build_fleet(store).await;

    let fixture = &fixtures["node-a"];

    let _monitor_task = tokio::spawn({
        let monitor = monitors[0].clone();
        let store = config_store.clone();
        async move { monitor.run(store).await }
    });
    let _fleet_task = tokio::spawn({
        let fm = fleet_manager.clone();
        async move { fm.run().await }
    });

    // One tick observes STOPPED and calls start_node(); the fake
    // supervisor immediately reports BOOTSTRAPPING.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(matches!(monitors[0].state(), NodeState::Bootstrapping | NodeState::Started));

    write_stats(&fixture.resp_dir(), 10, 5, 1).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(monitors[0].state(), NodeState::Started);
    assert_eq!(monitors[0].get_tip().await, 10);

    let restarts_log = root.path().join("common").join("restarts.log");
    let contents = tokio::fs::read_to_string(&restarts_log).await.unwrap();
    assert!(contents.contains("start"));
}

#[tokio::test]
async fn leader_handoff_prefers_higher_tip_node() {
    let server = MockServer::start().await;
    let fake = FakeSupervisor::new();
    Mock::given(wiremock::matchers::method("POST")).respond_with(fake.clone()).mount(&server).await;
    fake.set_state("node-a", 20);
    fake.set_state("node-b", 20);

    let root = TempDir::new().unwrap();
    // tip_timeout_sec is kept well above this test's runtime so node-a's
    // frozen tip (it never receives a second write_stats) doesn't trigger
    // a staled-tip restart and confound the leader-handoff assertions.
    let (store, fixtures) = build_config_store(root.path(), &["node-a", "node-b"], &server.uri(), 30).await;
    let (registry, fleet_manager, monitors, config_store) = build_fleet(store).await;

    write_stats(&fixtures["node-a"].resp_dir(), 100, 7, 10).await;
    write_stats(&fixtures["node-b"].resp_dir(), 100, 7, 10).await;
    // node-a starts as the registered leader.
    tokio::fs::write(fixtures["node-a"].resp_dir().join("leaders.json"), "[1]").await.unwrap();

    let _tasks: Vec<_> = monitors
        .iter()
        .cloned()
        .map(|m| {
            let store = config_store.clone();
            tokio::spawn(async move { m.run(store).await })
        })
        .collect();
    let _fleet_task = tokio::spawn({
        let fm = fleet_manager.clone();
        async move { fm.run().await }
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let node_a = registry.get("node-a").unwrap();
    let node_b = registry.get("node-b").unwrap();
    assert_eq!(node_a.state(), NodeState::Started);
    assert_eq!(node_b.state(), NodeState::Started);

    // node-b pulls ahead by more than the hysteresis margin.
    write_stats(&fixtures["node-b"].resp_dir(), 104, 7, 14).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(node_b.is_leader().await, "leader should have switched to the higher-tip node");
    assert!(!node_a.is_leader().await, "old leader should have been unregistered");
}

#[tokio::test]
async fn stuck_node_is_restarted_with_staled_tip_reason() {
    let server = MockServer::start().await;
    let fake = FakeSupervisor::new();
    Mock::given(wiremock::matchers::method("POST")).respond_with(fake.clone()).mount(&server).await;
    fake.set_state("node-a", 20);

    let root = TempDir::new().unwrap();
    let (store, fixtures) = build_config_store(root.path(), &["node-a"], &server.uri(), 3).await;
    let (registry, fleet_manager, monitors, config_store) = build_fleet(store).await;

    write_stats(&fixtures["node-a"].resp_dir(), 50, 7, 1).await;

    let _monitor_task = tokio::spawn({
        let monitor = monitors[0].clone();
        let store = config_store.clone();
        async move { monitor.run(store).await }
    });
    let _fleet_task = tokio::spawn({
        let fm = fleet_manager.clone();
        async move { fm.run().await }
    });

    // tip_timeout_sec is 3 in the fixture; past that with an unchanged
    // height, the node should be restarted for a staled tip.
    tokio::time::sleep(Duration::from_secs(6)).await;

    let node_a = registry.get("node-a").unwrap();
    let restarts_log = root.path().join("common").join("restarts.log");
    let contents = tokio::fs::read_to_string(&restarts_log).await.unwrap();
    assert!(contents.contains("staled tip"), "expected a staled-tip restart entry, got: {}", contents);
    let _ = node_a.state();
}
