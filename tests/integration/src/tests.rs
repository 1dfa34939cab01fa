//! Integration tests for the devshell HTTP bridge
//!
//! Each test boots the router in-process on an ephemeral port.
//! PTY tests need `/bin/sh`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use integration_tests::*;
use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

// ============================================================================
// Health Tests
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .get(server.api_url("/health"))
        .send()
        .await
        .expect("Failed to send health request");

    assert!(
        response.status().is_success(),
        "Health check failed with status: {}",
        response.status()
    );

    let health: HealthResponse = response.json().await.expect("Failed to parse health response");
    assert_eq!(health.status, "ok");
    assert!(!health.version.is_empty());
    assert_eq!(health.pty_sessions, 0);
}

// ============================================================================
// Dev Server Tests
// ============================================================================

#[tokio::test]
async fn test_dev_server_status_of_unknown_project() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .get(server.api_url("/dev-servers/status"))
        .query(&[("cwd", dir.path().to_str().unwrap())])
        .send()
        .await
        .expect("Failed to get status");

    assert!(response.status().is_success());
    let status: DevServerResponse = response.json().await.unwrap();
    assert_eq!(status.status, "stopped");
    assert_eq!(status.pid, None);
    assert_eq!(status.project_path, dir.path().to_str().unwrap());
}

#[tokio::test]
async fn test_dev_server_rejects_shell_injection() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    for command in ["npm run dev; rm -rf /", "npm run dev && curl x", "bash -c ls", "npm run $(whoami)"] {
        let response = server
            .client
            .post(server.api_url("/dev-servers/start"))
            .json(&json!({ "cwd": dir.path(), "command": command }))
            .send()
            .await
            .expect("Failed to send start");

        assert_eq!(response.status().as_u16(), 422, "accepted {:?}", command);
        let error: ErrorResponse = response.json().await.unwrap();
        assert_eq!(error.code, 1100); // Validation
    }
}

#[tokio::test]
async fn test_dev_server_rejects_relative_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .post(server.api_url("/dev-servers/start"))
        .json(&json!({ "cwd": "./app", "command": "npm run dev" }))
        .send()
        .await
        .expect("Failed to send start");

    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn test_dev_server_low_confidence_needs_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("package.json"),
        r#"{"scripts":{"start":"node server.js"}}"#,
    )
    .unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .post(server.api_url("/dev-servers/start"))
        .json(&json!({ "cwd": dir.path() }))
        .send()
        .await
        .expect("Failed to send start");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"], "needs_confirmation");
    assert_eq!(body["status"], "needs_confirmation");
    assert_eq!(body["plan"]["confidence"], "low");
    assert_eq!(body["plan"]["command"]["bin"], "npm");

    let list: Vec<DevServerResponse> = server
        .client
        .get(server.api_url("/dev-servers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list.iter().all(|p| p.status == "stopped"));
}

#[tokio::test]
async fn test_dev_server_unknown_project_type() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .post(server.api_url("/dev-servers/start"))
        .json(&json!({ "cwd": dir.path() }))
        .send()
        .await
        .expect("Failed to send start");

    assert_eq!(response.status().as_u16(), 404);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 4007); // PlanNotFound
}

#[tokio::test]
async fn test_dev_server_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    for _ in 0..2 {
        let response = server
            .client
            .post(server.api_url("/dev-servers/stop"))
            .json(&json!({ "cwd": dir.path() }))
            .send()
            .await
            .expect("Failed to send stop");
        assert!(response.status().is_success());
    }
}

// ============================================================================
// PTY Tests
// ============================================================================

#[tokio::test]
async fn test_pty_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .post(server.api_url("/pty"))
        .json(&json!({ "cols": 100, "rows": 30, "tab_id": "tab-1" }))
        .send()
        .await
        .expect("Failed to create PTY");
    assert!(
        response.status().is_success(),
        "Create PTY failed: {}",
        response.status()
    );

    let pty: PtyResponse = response.json().await.unwrap();
    assert!(!pty.id.is_empty());
    assert!(pty.pid > 0);
    assert_eq!(pty.shell, "/bin/sh");
    assert_eq!(pty.cwd, dir.path().to_str().unwrap());
    assert_eq!((pty.cols, pty.rows), (100, 30));

    let response = server
        .client
        .post(server.api_url(&format!("/pty/{}/resize", pty.id)))
        .json(&json!({ "cols": 120, "rows": 40 }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let fetched: PtyResponse = server
        .client
        .get(server.api_url(&format!("/pty/{}", pty.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!((fetched.cols, fetched.rows), (120, 40));

    let response = server
        .client
        .delete(server.api_url(&format!("/pty/{}", pty.id)))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let response = server
        .client
        .get(server.api_url(&format!("/pty/{}", pty.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 4101); // PtyNotFound
}

#[tokio::test]
async fn test_pty_websocket_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let pty: PtyResponse = server
        .client
        .post(server.api_url("/pty"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let (mut socket, _) = connect_async(server.ws_url(&format!("/pty/{}/ws", pty.id)))
        .await
        .expect("Failed to connect PTY socket");

    socket
        .send(Message::Text("echo $((40+2))\n".into()))
        .await
        .unwrap();

    let mut output = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = socket.next().await {
            if let Message::Binary(data) = msg {
                output.push_str(&String::from_utf8_lossy(&data));
                if output.contains("42") {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "no shell output, got {:?}", output);

    socket.send(Message::Text("exit\n".into())).await.unwrap();
    server.state.ptys.kill(&pty.id).await.unwrap();
}

#[tokio::test]
async fn test_pty_rejects_unknown_shell() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .post(server.api_url("/pty"))
        .json(&json!({ "shell": "/usr/bin/python3" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn test_pty_resize_rejects_zero() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .post(server.api_url("/pty/whatever/resize"))
        .json(&json!({ "cols": 0, "rows": 24 }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 1002); // InvalidParameter
}

// ============================================================================
// MCP Session Tests
// ============================================================================

#[tokio::test]
async fn test_mcp_session_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let session: McpSessionResponse = server
        .client
        .post(server.api_url("/mcp/sessions"))
        .json(&json!({ "project_path": dir.path() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session.project_path, dir.path().to_str().unwrap());

    tokio::time::sleep(Duration::from_millis(20)).await;

    // Any verb on the session refreshes it
    let touched: McpSessionResponse = server
        .client
        .post(server.api_url(&format!("/mcp/sessions/{}", session.session_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_ne!(touched.last_activity, session.last_activity);

    let response = server
        .client
        .delete(server.api_url(&format!("/mcp/sessions/{}", session.session_id)))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let response = server
        .client
        .get(server.api_url(&format!("/mcp/sessions/{}", session.session_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 4301); // McpSessionNotFound
}

#[tokio::test]
async fn test_mcp_session_header_refreshes() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let session = server.state.mcp_sessions.open("/srv/app");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let response = server
        .client
        .get(server.api_url("/health"))
        .header("mcp-session-id", &session.session_id)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let refreshed = server.state.mcp_sessions.get(&session.session_id).unwrap();
    assert!(refreshed.last_activity > session.last_activity);
}

// ============================================================================
// Repair Tests
// ============================================================================

#[tokio::test]
async fn test_repairs_for_quiet_project() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let body: serde_json::Value = server
        .client
        .get(server.api_url("/repairs"))
        .query(&[("project", dir.path().to_str().unwrap())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["active"], json!([]));
    assert_eq!(body["history"], json!([]));
}

#[tokio::test]
async fn test_unknown_repair() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .post(server.api_url("/repairs/nope/signal"))
        .json(&json!({ "signal": "fix_applied" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 4201); // RepairNotFound

    let response = server
        .client
        .post(server.api_url("/repairs/abort"))
        .json(&json!({ "project": dir.path() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

// ============================================================================
// Process Tracker Tests
// ============================================================================

#[tokio::test]
async fn test_process_list_includes_ptys() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let pty: PtyResponse = server
        .client
        .post(server.api_url("/pty"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let processes: Vec<serde_json::Value> = server
        .client
        .get(server.api_url("/processes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let entry = processes
        .iter()
        .find(|p| p["key"] == pty.id.as_str())
        .expect("PTY missing from process list");
    assert_eq!(entry["kind"], "pty");
    assert_eq!(entry["pid"], pty.pid);

    server.state.ptys.kill(&pty.id).await.unwrap();
}

#[tokio::test]
async fn test_event_stream_is_sse() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .get(server.api_url("/events"))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
}

// ============================================================================
// Origin Tests
// ============================================================================

const FOREIGN_ORIGIN: &str = "http://evil.example";
const APP_ORIGIN: &str = "http://localhost:5173";

#[tokio::test]
async fn test_foreign_origin_gets_no_cors_grant() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .request(reqwest::Method::OPTIONS, server.api_url("/pty/x/input"))
        .header("Origin", FOREIGN_ORIGIN)
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "content-type")
        .send()
        .await
        .unwrap();

    assert!(response.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn test_foreign_origin_cannot_spawn_pty() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let response = server
        .client
        .post(server.api_url("/pty"))
        .header("Origin", FOREIGN_ORIGIN)
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 403);
    assert!(response.headers().get("access-control-allow-origin").is_none());
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, 1004); // OriginNotAllowed
    assert!(server.state.ptys.is_empty());
}

#[tokio::test]
async fn test_foreign_origin_websocket_refused() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let pty: PtyResponse = server
        .client
        .post(server.api_url("/pty"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let mut request = server
        .ws_url(&format!("/pty/{}/ws", pty.id))
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static(FOREIGN_ORIGIN));

    match connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        Err(other) => panic!("unexpected handshake error: {}", other),
        Ok(_) => panic!("upgrade from a foreign origin was accepted"),
    }

    server.state.ptys.kill(&pty.id).await.unwrap();
}

#[tokio::test]
async fn test_configured_origin_is_granted() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::with_config(devshell_server::Config {
        allowed_origins: vec![APP_ORIGIN.to_string()],
        ..test_config(dir.path())
    })
    .await;

    let preflight = server
        .client
        .request(reqwest::Method::OPTIONS, server.api_url("/pty"))
        .header("Origin", APP_ORIGIN)
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .unwrap();
    assert_eq!(
        preflight
            .headers()
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok()),
        Some(APP_ORIGIN)
    );

    let response = server
        .client
        .get(server.api_url("/health"))
        .header("Origin", APP_ORIGIN)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}
