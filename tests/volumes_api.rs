//! Volume API scenarios against the router, without a listener
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use minivol::cluster::ClusterDb;
use minivol::common::auth::Role;
use minivol::common::config::{ApiKeySeed, ProjectSeed};
use minivol::common::sha256_hex;
use minivol::{Config, Daemon};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const VOLUMES: &str = "/1.0/storage-pools/default/volumes";

fn daemon(config_fn: impl FnOnce(&mut Config)) -> (Daemon, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.member_name = "node1".into();
    config.server.data_dir = dir.path().to_path_buf();
    config_fn(&mut config);
    let daemon = Daemon::with_db(config, Arc::new(ClusterDb::in_memory())).unwrap();
    (daemon, dir)
}

async fn call(router: &Router, req: Request<Body>) -> (StatusCode, header::HeaderMap, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create(router: &Router, name: &str) {
    let (status, _, body) = call(router, json_request("POST", VOLUMES, json!({"name": name}))).await;
    assert_eq!(status, StatusCode::OK, "create failed: {}", body);
}

#[tokio::test]
async fn test_create_is_sync_and_duplicate_conflicts() {
    let (daemon, _dir) = daemon(|_| {});
    let router = daemon.router();

    let (status, headers, body) = call(
        &router,
        json_request("POST", VOLUMES, json!({"name": "data", "type": "custom"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "sync");
    assert_eq!(body["metadata"], json!({}));
    assert_eq!(
        headers[header::LOCATION],
        "/1.0/storage-pools/default/volumes/custom/data"
    );

    let (status, _, body) = call(&router, json_request("POST", VOLUMES, json!({"name": "data"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error_code"], 409);
    assert_eq!(body["error"], "Volume by that name already exists");

    let (_, _, body) = call(&router, get(VOLUMES)).await;
    assert_eq!(
        body["metadata"],
        json!(["/1.0/storage-pools/default/volumes/custom/data"])
    );
}

#[tokio::test]
async fn test_list_recursion_and_filter() {
    let (daemon, _dir) = daemon(|_| {});
    let router = daemon.router();
    create(&router, "alpha").await;
    create(&router, "beta").await;

    let (status, _, body) = call(&router, get(&format!("{}?recursion=1", VOLUMES))).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["metadata"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    let (_, _, body) = call(
        &router,
        get(&format!("{}/custom?recursion=1&filter=name%20eq%20beta", VOLUMES)),
    )
    .await;
    assert_eq!(body["metadata"].as_array().unwrap().len(), 1);
    assert_eq!(body["metadata"][0]["name"], "beta");

    let (status, _, _) = call(&router, get("/1.0/storage-pools/missing/volumes")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_put_requires_matching_etag() {
    let (daemon, _dir) = daemon(|_| {});
    let router = daemon.router();
    create(&router, "data").await;

    let url = format!("{}/custom/data", VOLUMES);
    let (status, headers, _) = call(&router, get(&url)).await;
    assert_eq!(status, StatusCode::OK);
    let etag = headers[header::ETAG].to_str().unwrap().to_string();

    let stale = Request::builder()
        .method("PUT")
        .uri(&url)
        .header(header::IF_MATCH, "\"not-the-etag\"")
        .body(Body::from(json!({"config": {"user.tier": "gold"}}).to_string()))
        .unwrap();
    let (status, _, body) = call(&router, stale).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["error_code"], 412);

    let fresh = Request::builder()
        .method("PUT")
        .uri(&url)
        .header(header::IF_MATCH, etag.as_str())
        .body(Body::from(json!({"config": {"user.tier": "gold"}}).to_string()))
        .unwrap();
    let (status, headers, _) = call(&router, fresh).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(headers[header::ETAG].to_str().unwrap(), etag);

    let (status, _, _) = call(
        &router,
        json_request("PATCH", &url, json!({"config": {"user.owner": "ops"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, body) = call(&router, get(&url)).await;
    assert_eq!(body["metadata"]["config"]["user.tier"], "gold");
    assert_eq!(body["metadata"]["config"]["user.owner"], "ops");
}

#[tokio::test]
async fn test_rename_then_delete() {
    let (daemon, _dir) = daemon(|_| {});
    let router = daemon.router();
    create(&router, "old").await;

    let (status, headers, _) = call(
        &router,
        json_request("POST", &format!("{}/custom/old", VOLUMES), json!({"name": "new"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers[header::LOCATION],
        "/1.0/storage-pools/default/volumes/custom/new"
    );
    let (status, _, _) = call(&router, get(&format!("{}/custom/old", VOLUMES))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("{}/custom/new", VOLUMES))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = call(&router, delete).await;
    assert_eq!(status, StatusCode::OK);

    let delete_container = Request::builder()
        .method("DELETE")
        .uri(format!("{}/container/c1", VOLUMES))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = call(&router, delete_container).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("container"));
}

#[tokio::test]
async fn test_copy_runs_as_operation() {
    let (daemon, _dir) = daemon(|_| {});
    let router = daemon.router();
    create(&router, "origin").await;

    let (status, headers, body) = call(
        &router,
        json_request(
            "POST",
            VOLUMES,
            json!({"name": "clone", "source": {"type": "copy", "name": "origin"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["type"], "async");
    let operation = body["operation"].as_str().unwrap().to_string();
    assert_eq!(headers[header::LOCATION], operation.as_str());
    assert_eq!(body["metadata"]["class"], "task");
    assert_eq!(
        body["metadata"]["resources"],
        json!(["/1.0/storage-pools/default/volumes/custom/clone"])
    );

    let (status, _, body) = call(&router, get(&format!("{}/wait?timeout=5", operation))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["status"], "Success", "{}", body);

    let (status, _, _) = call(&router, get(&format!("{}/custom/clone", VOLUMES))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, _, body) = call(&router, get("/1.0/operations")).await;
    assert_eq!(body["metadata"], json!([operation]));

    // finished tasks cannot be cancelled
    let cancel = Request::builder()
        .method("DELETE")
        .uri(&operation)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = call(&router, cancel).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_iso_upload() {
    let (daemon, _dir) = daemon(|_| {});
    let router = daemon.router();

    let upload = Request::builder()
        .method("POST")
        .uri(VOLUMES)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("X-LXD-name", "installer")
        .header("X-LXD-type", "iso")
        .body(Body::from(vec![7u8; 4096]))
        .unwrap();
    let (status, _, body) = call(&router, upload).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (_, _, body) = call(&router, get(&format!("{}/custom/installer", VOLUMES))).await;
    assert_eq!(body["metadata"]["content_type"], "iso");
}

#[tokio::test]
async fn test_server_info_is_public() {
    let (daemon, _dir) = daemon(|config| {
        config.auth.enabled = true;
    });
    let router = daemon.router();

    let (status, _, body) = call(&router, get("/1.0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["environment"]["server_name"], "node1");

    let (status, _, _) = call(&router, get(VOLUMES)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_read_only_key_cannot_create() {
    let (daemon, _dir) = daemon(|config| {
        config.auth.enabled = true;
        config.auth.keys.push(ApiKeySeed {
            name: "viewer".into(),
            key_sha256: sha256_hex(b"view-key"),
            role: Role::ReadOnly,
        });
    });
    let router = daemon.router();

    let list = Request::builder()
        .uri(VOLUMES)
        .header(header::AUTHORIZATION, "Bearer view-key")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = call(&router, list).await;
    assert_eq!(status, StatusCode::OK);

    let create = Request::builder()
        .method("POST")
        .uri(VOLUMES)
        .header(header::AUTHORIZATION, "Bearer view-key")
        .body(Body::from(json!({"name": "x"}).to_string()))
        .unwrap();
    let (status, _, body) = call(&router, create).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["type"], "error");
}

#[tokio::test]
async fn test_project_without_volume_feature_round_trip() {
    let (daemon, _dir) = daemon(|config| {
        config.projects.push(ProjectSeed {
            name: "web".into(),
            config: HashMap::from([("features.storage.volumes".to_string(), "false".to_string())]),
        });
    });
    let router = daemon.router();
    let collection = format!("{}?project=web", VOLUMES);
    let volume = |name: &str| format!("{}/custom/{}?project=web", VOLUMES, name);

    let (status, _, body) = call(&router, json_request("POST", &collection, json!({"name": "data"}))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, _, body) = call(&router, get(&volume("data"))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["metadata"]["project"], "default");

    let (status, _, body) = call(
        &router,
        json_request("PUT", &volume("data"), json!({"config": {"user.tier": "gold"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, _, body) = call(&router, json_request("POST", &volume("data"), json!({"name": "renamed"}))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, _, body) = call(&router, get(&volume("renamed"))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["metadata"]["config"]["user.tier"], "gold");

    let delete = Request::builder()
        .method("DELETE")
        .uri(volume("renamed"))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = call(&router, delete).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    // the record lived in the default project all along
    let (status, _, _) = call(&router, get(&format!("{}/custom/renamed", VOLUMES))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
