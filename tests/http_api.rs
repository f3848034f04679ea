//! HTTP surface, exercised with a real client against a local listener.

mod common;

use serde_json::{json, Value};
use tempfile::TempDir;

async fn create(client: &reqwest::Client, server: &common::Server, user: &str) -> String {
    let resp = client
        .post(server.url("/create-session"))
        .json(&json!({ "userId": user }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["userId"], user);
    assert_eq!(body["workingDirectory"], "~");
    body["sessionId"].as_str().unwrap().to_string()
}

async fn execute(
    client: &reqwest::Client,
    server: &common::Server,
    session_id: &str,
    command: &str,
) -> (u16, Value) {
    let resp = client
        .post(server.url("/execute-command"))
        .header("X-Session-Id", session_id)
        .json(&json!({ "command": command }))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn create_and_execute() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;
    let client = reqwest::Client::new();

    let id = create(&client, &server, "alice").await;
    let (status, body) = execute(&client, &server, &id, "echo hi").await;
    assert_eq!(status, 200);
    assert_eq!(body["output"], "hi\n");
    assert_eq!(body["exitCode"], 0);
    assert_eq!(body["sessionRenewed"], false);
    assert!(body.get("newSessionId").is_none());
}

#[tokio::test]
async fn create_without_body_picks_a_user() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;

    let resp = reqwest::Client::new()
        .post(server.url("/create-session"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert!(!body["userId"].as_str().unwrap().is_empty());
    assert!(body["expiresIn"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn forbidden_commands_get_403() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;
    let client = reqwest::Client::new();
    let id = create(&client, &server, "alice").await;

    let (status, body) = execute(&client, &server, &id, "sudo rm -rf /").await;
    assert_eq!(status, 403);
    assert!(body["error"].as_str().unwrap().contains("disallowed operation"));
    assert_eq!(body["exitCode"], 1);
}

#[tokio::test]
async fn failing_commands_get_400_with_exit_code() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;
    let client = reqwest::Client::new();
    let id = create(&client, &server, "alice").await;

    let (status, body) = execute(&client, &server, &id, "echo nope >&2; exit 7").await;
    assert_eq!(status, 400);
    assert_eq!(body["exitCode"], 7);
    assert_eq!(body["error"], "nope\n");
}

#[tokio::test]
async fn unknown_session_is_renewed() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;
    let client = reqwest::Client::new();

    let (status, body) = execute(&client, &server, "expired-id", "echo fresh").await;
    assert_eq!(status, 200);
    assert_eq!(body["output"], "fresh\n");
    assert_eq!(body["sessionRenewed"], true);
    let new_id = body["newSessionId"].as_str().unwrap().to_string();

    let (_, again) = execute(&client, &server, &new_id, "echo same").await;
    assert_eq!(again["sessionRenewed"], false);
}

#[tokio::test]
async fn session_data_header_reconnects_the_user() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;
    let client = reqwest::Client::new();
    let id = create(&client, &server, "alice").await;

    let resp = client
        .post(server.url("/execute-command"))
        .header("X-Session-Id", "lost-id")
        .header("X-Session-Data", r#"{"userId":"alice"}"#)
        .json(&json!({ "command": "echo back" }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["newSessionId"], id.as_str());
}

#[tokio::test]
async fn session_details_and_end() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;
    let client = reqwest::Client::new();
    let id = create(&client, &server, "alice").await;

    let details: Value = client
        .get(server.url("/session"))
        .header("X-Session-Id", &id)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(details["userId"], "alice");
    assert_eq!(details["running"], false);
    assert!(details["lastAccessed"].is_string());

    let resp = client
        .delete(server.url("/session"))
        .header("X-Session-Id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(server.url("/session"))
        .header("X-Session-Id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn empty_command_is_rejected() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;
    let client = reqwest::Client::new();
    let id = create(&client, &server, "alice").await;

    let (status, body) = execute(&client, &server, &id, "   ").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "No command provided");
}

#[tokio::test]
async fn health_reports_counts() {
    let dir = TempDir::new().unwrap();
    let server = common::spawn_server(common::config(&dir)).await;
    let client = reqwest::Client::new();
    create(&client, &server, "alice").await;

    let body: Value = client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeSessions"], 1);
    assert_eq!(body["backend"], "directory");
    assert_eq!(server.state.sessions.len().await, 1);
}
