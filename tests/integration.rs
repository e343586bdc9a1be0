//! End-to-end tests: a leader and a follower sharing a directory-backed
//! checkpoint store, driven over HTTP.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ndb_core::LexicalEngineLoader;
use ndb_server::checkpoint::{Checkpointer, StoreCheckpointer};
use ndb_server::config::ServerConfig;
use ndb_server::object_store::LocalObjectStore;
use ndb_server::server;
use ndb_server::state::{Role, ServerState};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use tempfile::TempDir;

const FRUIT_CSV: &str = "name,desc,price\n\
                         apple,crunchy red fruit,1\n\
                         banana,soft yellow fruit,2\n";

const TOOLS_CSV: &str = "name,desc,price\n\
                         hammer,drives nails into wood,10\n\
                         saw,cuts wood planks,25\n";

/// Find a free port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for the server to become ready by polling /health.
async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Server did not start within 5 seconds");
}

fn checkpointer(store_root: &Path) -> Arc<dyn Checkpointer> {
    let store = Arc::new(LocalObjectStore::new(store_root).unwrap());
    Arc::new(StoreCheckpointer::new(store, 3))
}

/// Start a node and return its base URL.
async fn start_node(role: Role, store_root: &Path, local_dir: &Path) -> String {
    let state = Arc::new(
        ServerState::new(
            role,
            Some(checkpointer(store_root)),
            Arc::new(LexicalEngineLoader),
            local_dir.to_path_buf(),
        )
        .await
        .unwrap(),
    );

    let port = find_free_port();
    let config = ServerConfig {
        leader: role == Role::Leader,
        bind: format!("127.0.0.1:{}", port),
        tls_cert: None,
        tls_key: None,
    };
    tokio::spawn(async move {
        server::run_server(&config, state).await.ok();
    });
    wait_for_server(port).await;

    format!("http://127.0.0.1:{}/api/v1", port)
}

fn upload(csv: &str, filename: &str, metadata: Value) -> Form {
    Form::new()
        .part(
            "file",
            Part::bytes(csv.as_bytes().to_vec()).file_name(filename.to_string()),
        )
        .text("metadata", metadata.to_string())
}

async fn insert(client: &reqwest::Client, base: &str, csv: &str, source_id: &str) -> Value {
    let resp = client
        .post(format!("{}/insert", base))
        .multipart(upload(
            csv,
            &format!("{}.csv", source_id),
            json!({
                "filename": format!("{}.csv", source_id),
                "source_id": source_id,
                "text_columns": ["name", "desc"],
                "metadata_types": {"price": "integer"},
            }),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "insert {} failed", source_id);
    resp.json().await.unwrap()
}

async fn search(client: &reqwest::Client, base: &str, body: Value) -> reqwest::Response {
    client
        .post(format!("{}/search", base))
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn checkpoint(client: &reqwest::Client, base: &str) -> Value {
    let resp = client
        .post(format!("{}/checkpoint", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

fn source_ids(search_body: &Value) -> Vec<String> {
    search_body["references"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["source_id"].as_str().unwrap().to_string())
        .collect()
}

// ============ Tests ============

#[tokio::test]
async fn test_health() {
    let store = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let base = start_node(Role::Leader, store.path(), local.path()).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_leader_publishes_and_follower_adopts() {
    let store = TempDir::new().unwrap();
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let client = reqwest::Client::new();

    let leader = start_node(Role::Leader, store.path(), leader_dir.path()).await;

    let inserted = insert(&client, &leader, FRUIT_CSV, "fruit").await;
    assert_eq!(inserted["source"], "fruit.csv");
    assert_eq!(inserted["source_id"], "fruit");
    assert_eq!(inserted["version"], 1);

    let first = checkpoint(&client, &leader).await;
    assert_eq!(first, json!({"version": 1, "new_checkpoint": true}));

    // Nothing changed since.
    let again = checkpoint(&client, &leader).await;
    assert_eq!(again, json!({"version": 1, "new_checkpoint": false}));

    insert(&client, &leader, TOOLS_CSV, "tools").await;
    let second = checkpoint(&client, &leader).await;
    assert_eq!(second, json!({"version": 2, "new_checkpoint": true}));

    let version: Value = client
        .get(format!("{}/version", leader))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["curr_version"], 2);
    assert_eq!(version["last_checkpoint"]["version"], 2);
    assert_eq!(version["last_checkpoint"]["complete"], true);

    // A follower started now restores the newest checkpoint.
    let follower = start_node(Role::Follower, store.path(), follower_dir.path()).await;

    let body: Value = search(&client, &follower, json!({"query": "wood", "top_k": 5}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["query_text"], "wood");
    let ids = source_ids(&body);
    assert!(!ids.is_empty());
    assert!(ids.iter().all(|id| id == "tools"));

    let sources: Value = client
        .get(format!("{}/sources", follower))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        sources,
        json!([
            {"source": "fruit.csv", "source_id": "fruit", "version": 1},
            {"source": "tools.csv", "source_id": "tools", "version": 1},
        ])
    );

    let version: Value = client
        .get(format!("{}/version", follower))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["curr_version"], 2);
}

#[tokio::test]
async fn test_follower_rejects_writes() {
    let store = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let follower = start_node(Role::Follower, store.path(), local.path()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/insert", follower))
        .multipart(upload(
            FRUIT_CSV,
            "fruit.csv",
            json!({"filename": "fruit.csv", "text_columns": ["name"]}),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");

    for (path, payload) in [
        ("delete", json!({"source_ids": ["fruit"]})),
        (
            "upvote",
            json!({"text_id_pairs": [{"query_text": "apple", "reference_id": 0}]}),
        ),
    ] {
        let resp = client
            .post(format!("{}/{}", follower, path))
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403, "{} should be leader-only", path);
    }

    let resp = client
        .post(format!("{}/checkpoint", follower))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Reads still work on an empty follower.
    let resp = search(&client, &follower, json!({"query": "apple"})).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["references"], json!([]));
}

#[tokio::test]
async fn test_search_constraints_and_validation() {
    let store = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let leader = start_node(Role::Leader, store.path(), local.path()).await;
    let client = reqwest::Client::new();

    insert(&client, &leader, FRUIT_CSV, "fruit").await;

    let body: Value = search(
        &client,
        &leader,
        json!({
            "query": "fruit",
            "top_k": 10,
            "constraints": {
                "price": {"constraint_type": "GreaterThan", "value": 1, "dtype": "integer"}
            }
        }),
    )
    .await
    .json()
    .await
    .unwrap();
    let refs = body["references"].as_array().unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0]["metadata"]["price"], 2);
    assert_eq!(refs[0]["source_version"], 1);

    let resp = search(&client, &leader, json!({"query": "fruit", "top_k": 0})).await;
    assert_eq!(resp.status(), 422);

    let resp = search(
        &client,
        &leader,
        json!({
            "query": "fruit",
            "constraints": {
                "price": {"constraint_type": "Around", "value": 1, "dtype": "integer"}
            }
        }),
    )
    .await;
    assert_eq!(resp.status(), 422);

    let resp = client
        .post(format!("{}/search", leader))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_insert_validation() {
    let store = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let leader = start_node(Role::Leader, store.path(), local.path()).await;
    let client = reqwest::Client::new();

    // Not a CSV.
    let resp = client
        .post(format!("{}/insert", leader))
        .multipart(upload(
            "hello",
            "notes.txt",
            json!({"filename": "notes.txt", "text_columns": ["name"]}),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    // Missing metadata part.
    let form = Form::new().part(
        "file",
        Part::bytes(FRUIT_CSV.as_bytes().to_vec()).file_name("fruit.csv"),
    );
    let resp = client
        .post(format!("{}/insert", leader))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown text column.
    let resp = client
        .post(format!("{}/insert", leader))
        .multipart(upload(
            FRUIT_CSV,
            "fruit.csv",
            json!({"filename": "fruit.csv", "text_columns": ["title"]}),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unprocessable");
    assert!(body["error"]["message"].as_str().unwrap().contains("title"));

    // Nothing was inserted, so there is nothing to publish.
    let outcome = checkpoint(&client, &leader).await;
    assert_eq!(outcome, json!({"version": 0, "new_checkpoint": false}));
}

#[tokio::test]
async fn test_generated_source_id_and_upsert() {
    let store = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let leader = start_node(Role::Leader, store.path(), local.path()).await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .post(format!("{}/insert", leader))
        .multipart(upload(
            FRUIT_CSV,
            "fruit.csv",
            json!({"filename": "fruit.csv", "text_columns": ["name", "desc"]}),
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let generated = resp["source_id"].as_str().unwrap();
    assert_eq!(generated.len(), 36);

    insert(&client, &leader, FRUIT_CSV, "doc").await;
    let upserted: Value = client
        .post(format!("{}/insert", leader))
        .multipart(upload(
            TOOLS_CSV,
            "doc.csv",
            json!({
                "filename": "doc.csv",
                "source_id": "doc",
                "text_columns": ["name", "desc"],
                "upsert": true,
            }),
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(upserted["version"], 2);

    let sources: Vec<Value> = client
        .get(format!("{}/sources", leader))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let doc_versions: Vec<&Value> = sources
        .iter()
        .filter(|s| s["source_id"] == "doc")
        .map(|s| &s["version"])
        .collect();
    assert_eq!(doc_versions, vec![&json!(2)]);
}

#[tokio::test]
async fn test_delete_and_upvote() {
    let store = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let leader = start_node(Role::Leader, store.path(), local.path()).await;
    let client = reqwest::Client::new();

    insert(&client, &leader, FRUIT_CSV, "fruit").await;
    insert(&client, &leader, TOOLS_CSV, "tools").await;

    // Upvote the banana chunk for a query that matches both fruit rows.
    let body: Value = search(&client, &leader, json!({"query": "fruit", "top_k": 5}))
        .await
        .json()
        .await
        .unwrap();
    let banana = body["references"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["text"].as_str().unwrap().starts_with("banana"))
        .unwrap()["id"]
        .clone();

    let resp = client
        .post(format!("{}/upvote", leader))
        .json(&json!({"text_id_pairs": [{"query_text": "fruit", "reference_id": banana}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = search(&client, &leader, json!({"query": "fruit", "top_k": 1}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["references"][0]["id"], banana);

    let resp = client
        .post(format!("{}/upvote", leader))
        .json(&json!({"text_id_pairs": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/delete", leader))
        .json(&json!({"source_ids": ["fruit"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = search(&client, &leader, json!({"query": "fruit wood", "top_k": 10}))
        .await
        .json()
        .await
        .unwrap();
    assert!(source_ids(&body).iter().all(|id| id == "tools"));
}

#[tokio::test]
async fn test_non_finite_float_cells_are_rejected() {
    let store = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let leader = start_node(Role::Leader, store.path(), local.path()).await;
    let client = reqwest::Client::new();

    for cell in ["NaN", "inf", "-infinity"] {
        let csv = format!("name,price\napple,{}\n", cell);
        let resp = client
            .post(format!("{}/insert", leader))
            .multipart(upload(
                &csv,
                "prices.csv",
                json!({
                    "filename": "prices.csv",
                    "source_id": "prices",
                    "text_columns": ["name"],
                    "metadata_types": {"price": "float"},
                }),
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 422, "{} should be rejected", cell);
    }

    // The rejected uploads leave the leader clean, and a later valid insert
    // still publishes.
    let outcome = checkpoint(&client, &leader).await;
    assert_eq!(outcome, json!({"version": 0, "new_checkpoint": false}));

    let resp = client
        .post(format!("{}/insert", leader))
        .multipart(upload(
            "name,price\napple,1.5\n",
            "prices.csv",
            json!({
                "filename": "prices.csv",
                "source_id": "prices",
                "text_columns": ["name"],
                "metadata_types": {"price": "float"},
            }),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let outcome = checkpoint(&client, &leader).await;
    assert_eq!(outcome, json!({"version": 1, "new_checkpoint": true}));
}
