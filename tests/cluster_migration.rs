//! Two members on loopback sharing one metadata store: copies, push/pull
//! migration, cross-member moves and forwarding
use minivol::cluster::ClusterDb;
use minivol::common::config::MemberSeed;
use minivol::orchestrator::Orchestrator;
use minivol::storage::{NewVolume, VolumeKind};
use minivol::{Config, Daemon};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

struct Member {
    url: String,
    orch: Arc<Orchestrator>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

struct Cluster {
    db: Arc<ClusterDb>,
    node1: Member,
    node2: Member,
}

fn start_member(
    name: &str,
    listener: TcpListener,
    peer: (&str, &str),
    db: Arc<ClusterDb>,
) -> Member {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let mut config = Config::default();
    config.server.member_name = name.into();
    config.server.advertise_url = Some(url.clone());
    config.server.data_dir = dir.path().to_path_buf();
    config.cluster.members.push(MemberSeed {
        name: peer.0.into(),
        url: peer.1.into(),
    });

    let daemon = Daemon::with_db(config, db).unwrap();
    let orch = daemon.orchestrator().clone();
    let shutdown = CancellationToken::new();
    tokio::spawn(daemon.serve_on(listener, shutdown.clone()));
    Member {
        url,
        orch,
        shutdown,
        _dir: dir,
    }
}

fn cluster() -> Cluster {
    let db = Arc::new(ClusterDb::in_memory());
    let l1 = TcpListener::bind("127.0.0.1:0").unwrap();
    let l2 = TcpListener::bind("127.0.0.1:0").unwrap();
    let url1 = format!("http://{}", l1.local_addr().unwrap());
    let url2 = format!("http://{}", l2.local_addr().unwrap());
    let node1 = start_member("node1", l1, ("node2", &url2), db.clone());
    let node2 = start_member("node2", l2, ("node1", &url1), db.clone());
    Cluster { db, node1, node2 }
}

fn payload() -> Vec<u8> {
    (0..300_000u32).map(|i| (i % 251) as u8).collect()
}

async fn seed_volume(orch: &Orchestrator, name: &str, data: &[u8]) {
    let pool = orch.pool("default").unwrap();
    let mut reader = data;
    pool.create_custom_volume_from_reader(
        NewVolume {
            project: "default".into(),
            name: name.into(),
            ..NewVolume::default()
        },
        &mut reader,
    )
    .await
    .unwrap();
    pool.create_custom_volume_snapshot("default", name, "snap0")
        .await
        .unwrap();
}

async fn read_volume(orch: &Orchestrator, name: &str) -> Vec<u8> {
    let pool = orch.pool("default").unwrap();
    let record = pool.get_volume("default", VolumeKind::Custom, name).unwrap();
    let (mut reader, _) = pool.open_volume(&record, None).await.unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}

fn snapshot_count(orch: &Orchestrator, name: &str) -> usize {
    let pool = orch.pool("default").unwrap();
    let record = pool.get_volume("default", VolumeKind::Custom, name).unwrap();
    pool.list_snapshots(&record).unwrap().len()
}

async fn send(client: &Client, method: reqwest::Method, url: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = client.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await.unwrap();
    let status = resp.status();
    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

async fn wait_success(client: &Client, base: &str, operation: &str) {
    let url = format!("{}{}/wait?timeout=30", base, operation);
    let (status, body) = send(client, reqwest::Method::GET, &url, None).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["metadata"]["status"], "Success", "{}", body);
}

fn volumes(base: &str) -> String {
    format!("{}/1.0/storage-pools/default/volumes", base)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_copy_between_members_pulls_identical_bytes() {
    let c = cluster();
    let client = Client::new();
    let data = payload();
    seed_volume(&c.node1.orch, "vol", &data).await;

    let (status, body) = send(
        &client,
        reqwest::Method::POST,
        &volumes(&c.node2.url),
        Some(json!({"name": "copy", "source": {"type": "copy", "name": "vol"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    wait_success(&client, &c.node2.url, body["operation"].as_str().unwrap()).await;

    assert_eq!(read_volume(&c.node2.orch, "copy").await, data);
    assert_eq!(snapshot_count(&c.node2.orch, "copy"), 1);
    // the source stays where it was
    assert_eq!(read_volume(&c.node1.orch, "vol").await, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_migration_matches_pull() {
    let c = cluster();
    let client = Client::new();
    let data = payload();
    seed_volume(&c.node1.orch, "vol", &data).await;

    // sink waits on node2 for the source to dial in
    let (status, sink) = send(
        &client,
        reqwest::Method::POST,
        &volumes(&c.node2.url),
        Some(json!({"name": "pushed", "source": {"type": "migration", "mode": "push"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", sink);
    let sink_op = sink["operation"].as_str().unwrap().to_string();
    let websockets = sink["metadata"]["metadata"]["websockets"].clone();
    assert!(websockets["control"].is_string());
    assert!(websockets["filesystem"].is_string());

    let (status, source) = send(
        &client,
        reqwest::Method::POST,
        &format!("{}/custom/vol", volumes(&c.node1.url)),
        Some(json!({
            "name": "vol",
            "migration": true,
            "target": {
                "operation": format!("{}{}", c.node2.url, sink_op),
                "websockets": websockets,
            },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", source);

    wait_success(&client, &c.node1.url, source["operation"].as_str().unwrap()).await;
    wait_success(&client, &c.node2.url, &sink_op).await;
    assert_eq!(read_volume(&c.node2.orch, "pushed").await, data);
    assert_eq!(snapshot_count(&c.node2.orch, "pushed"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_move_to_other_member() {
    let c = cluster();
    let client = Client::new();
    let data = payload();
    seed_volume(&c.node1.orch, "vol", &data).await;

    let (status, body) = send(
        &client,
        reqwest::Method::POST,
        &format!("{}/custom/vol?target=node2", volumes(&c.node1.url)),
        Some(json!({"name": "vol", "migration": true})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    wait_success(&client, &c.node1.url, body["operation"].as_str().unwrap()).await;

    assert_eq!(read_volume(&c.node2.orch, "vol").await, data);
    let pool = c.node1.orch.pool("default").unwrap();
    assert!(pool.get_volume("default", VolumeKind::Custom, "vol").is_err());

    // node1 now forwards reads to node2
    let (status, body) = send(
        &client,
        reqwest::Method::GET,
        &format!("{}/custom/vol", volumes(&c.node1.url)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["metadata"]["location"], "node2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forwarding_to_offline_member_is_unavailable() {
    let c = cluster();
    let client = Client::new();
    seed_volume(&c.node1.orch, "vol", b"bytes").await;

    let url = format!("{}/custom/vol", volumes(&c.node2.url));
    let (status, body) = send(&client, reqwest::Method::GET, &url, None).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["metadata"]["location"], "node1");

    c.node1.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    c.db.transaction(|tx| tx.touch_heartbeat("node1", 0)).unwrap();

    let (status, body) = send(&client, reqwest::Method::GET, &url, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", body);
    assert_eq!(body["error_code"], 503);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("The cluster member hosting the storage volume is offline"));
}
