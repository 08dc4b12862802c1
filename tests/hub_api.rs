//! End-to-end tests of the hub HTTP API against mock drones.

mod common;

use common::start_hub;
use serde_json::{json, Value};

#[tokio::test]
async fn spawn_stop_roundtrip_over_http() {
    let fixture = start_hub(21440).await;
    let http = reqwest::Client::new();

    // Spawn on an empty hub.
    let response = http
        .post(format!("{}/agents", fixture.base_url))
        .json(&json!({ "name": "alpha", "branch": "feat/a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let agent: Value = response.json().await.unwrap();
    assert_eq!(agent["name"], "alpha");
    assert_eq!(agent["branch"], "feat/a");
    let port = agent["port"].as_u64().unwrap() as u16;

    // Status is reachable by name.
    let status: Value = http
        .get(format!("{}/agents/alpha/status", fixture.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ready");

    // The port carries a lease for the agent.
    let port_view: Value = http
        .get(format!("{}/ports/{port}", fixture.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(port_view["lease"]["agentName"], "alpha");

    // Stop it.
    let stopped: Value = http
        .delete(format!("{}/agents/alpha", fixture.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stopped["status"], "stopped");

    // The originally allocated port is free again.
    let port_view: Value = http
        .get(format!("{}/ports/{port}", fixture.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(port_view.get("lease").is_none(), "lease survived stop: {port_view}");

    // Health still counts the stopped agent as registered, not running.
    let health: Value = http
        .get(format!("{}/health", fixture.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["agents_total"], 1);
    assert_eq!(health["agents_running"], 0);
}

#[tokio::test]
async fn spawn_rejects_missing_name_and_duplicates() {
    let fixture = start_hub(21560).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/agents", fixture.base_url))
        .json(&json!({ "branch": "feat/x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("name"));

    let first = http
        .post(format!("{}/agents", fixture.base_url))
        .json(&json!({ "name": "solo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);

    let duplicate = http
        .post(format!("{}/agents", fixture.base_url))
        .json(&json!({ "name": "solo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    http.delete(format!("{}/agents/solo", fixture.base_url))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_agent_is_a_json_404() {
    let fixture = start_hub(21680).await;
    let response = reqwest::get(format!("{}/agents/ghost", fixture.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn message_routing_reaches_the_drone() {
    let fixture = start_hub(21800).await;
    let http = reqwest::Client::new();

    let agent: Value = http
        .post(format!("{}/agents", fixture.base_url))
        .json(&json!({ "name": "postman" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let port = agent["port"].as_u64().unwrap() as u16;

    // Empty content is a 400.
    let response = http
        .post(format!("{}/agents/postman/message", fixture.base_url))
        .json(&json!({ "content": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = http
        .post(format!("{}/agents/postman/message", fixture.base_url))
        .json(&json!({ "content": "ship it" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let sent = fixture.mock.sent();
    assert!(sent.iter().any(|(p, m)| *p == port && m == "ship it"));

    // Conversation comes back through the same client.
    fixture.mock.set_messages(
        port,
        vec![serde_json::from_value(json!({ "role": "assistant", "content": "done" })).unwrap()],
    );
    let conversation: Value = http
        .get(format!("{}/agents/postman/conversation", fixture.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conversation["messages"][0]["role"], "assistant");

    http.delete(format!("{}/agents/postman", fixture.base_url))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn task_dependency_gate_over_http() {
    let fixture = start_hub(21920).await;
    let http = reqwest::Client::new();
    let url = |path: &str| format!("{}{path}", fixture.base_url);

    let t1: Value = http
        .post(url("/tasks"))
        .json(&json!({ "subject": "one" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let t2: Value = http
        .post(url("/tasks"))
        .json(&json!({ "subject": "two" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let gated = http
        .post(url("/tasks"))
        .json(&json!({
            "subject": "three",
            "blockedBy": [t1["id"], t2["id"]],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(gated.status(), 201);
    let t3: Value = gated.json().await.unwrap();
    assert_eq!(t3["blockedBy"], json!(["1", "2"]));

    // Starting the gated task is refused while blockers are open.
    let blocked = http
        .post(url(&format!("/tasks/{}/start", t3["id"].as_str().unwrap())))
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), 400);

    for id in [t1["id"].as_str().unwrap(), t2["id"].as_str().unwrap()] {
        let started = http.post(url(&format!("/tasks/{id}/start"))).send().await.unwrap();
        assert_eq!(started.status(), 200);
        let completed = http
            .post(url(&format!("/tasks/{id}/complete")))
            .json(&json!({ "ok": true }))
            .send()
            .await
            .unwrap();
        assert_eq!(completed.status(), 200);
    }

    let started = http
        .post(url(&format!("/tasks/{}/start", t3["id"].as_str().unwrap())))
        .send()
        .await
        .unwrap();
    assert_eq!(started.status(), 200);

    // Step progress lands in activeForm.
    let stepped: Value = http
        .put(url(&format!(
            "/tasks/{}/steps/wiring",
            t3["id"].as_str().unwrap()
        )))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stepped["activeForm"], "wiring");
}

#[tokio::test]
async fn solicitation_lifecycle_over_http() {
    let fixture = start_hub(22040).await;
    let http = reqwest::Client::new();
    let url = |path: &str| format!("{}{path}", fixture.base_url);

    let created = http
        .post(url("/solicitations"))
        .json(&json!({
            "agentId": "w1",
            "agentName": "worker",
            "type": "blocker",
            "urgency": "high",
            "message": "remote rejected my push",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let solicitation: Value = created.json().await.unwrap();
    let id = solicitation["id"].as_str().unwrap().to_string();

    // Default listing is pending-only and includes it.
    let pending: Value = http.get(url("/solicitations")).send().await.unwrap().json().await.unwrap();
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let responded: Value = http
        .post(url(&format!("/solicitations/{id}/respond")))
        .json(&json!({ "response": "rebase on main and retry" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(responded["status"], "responded");
    assert!(responded["respondedAt"].is_string());

    // Second respond fails as already terminal.
    let again = http
        .post(url(&format!("/solicitations/{id}/respond")))
        .json(&json!({ "response": "never mind" }))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 400);

    // And the default listing no longer shows it.
    let pending: Value = http.get(url("/solicitations")).send().await.unwrap().json().await.unwrap();
    assert!(pending.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn port_endpoints_acquire_release_and_force() {
    let fixture = start_hub(22160).await;
    let http = reqwest::Client::new();
    let url = |path: &str| format!("{}{path}", fixture.base_url);

    let acquired: Value = http
        .post(url("/ports/acquire"))
        .json(&json!({ "port": 22201, "agent_id": "a1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(acquired["status"], "acquired");

    // Someone else without wait gets a 409 busy.
    let busy = http
        .post(url("/ports/acquire"))
        .json(&json!({ "port": 22201, "agent_id": "b2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(busy.status(), 409);

    // A non-holder release is refused.
    let refused = http
        .post(url("/ports/release"))
        .json(&json!({ "agent_id": "b2", "port": 22201 }))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), 409);

    // Force release bypasses ownership.
    let forced = http
        .post(url("/ports/22201/force-release"))
        .json(&json!({ "reason": "operator cleanup" }))
        .send()
        .await
        .unwrap();
    assert_eq!(forced.status(), 200);

    let listing: Value = http.get(url("/ports")).send().await.unwrap().json().await.unwrap();
    assert!(listing["leases"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn sse_stream_starts_with_connected_and_carries_events() {
    let fixture = start_hub(22280).await;
    let http = reqwest::Client::new();

    let mut response = http
        .get(format!("{}/ws", fixture.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut seen = String::new();
    // First frame announces the connection.
    while !seen.contains("event: connected") {
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), response.chunk())
            .await
            .expect("timed out waiting for connected frame")
            .unwrap()
            .expect("stream ended early");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(seen.contains("agents_total"));

    // A state change shows up as a typed frame.
    http.post(format!("{}/tasks", fixture.base_url))
        .json(&json!({ "subject": "observe me" }))
        .send()
        .await
        .unwrap();

    while !seen.contains("event: task.created") {
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), response.chunk())
            .await
            .expect("timed out waiting for task.created")
            .unwrap()
            .expect("stream ended early");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
}
