//! Cross-component tests: HTTP transport through the connection manager and
//! router, and a full two-phase orchestrator turn over local tools.

use async_trait::async_trait;
use futures::StreamExt;
use opsrelay::config::{
    AuthConfig, MaskingConfig, RetryPolicy, ServerDescriptor, TimeoutConfig, TransportKind,
};
use opsrelay::error::Result;
use opsrelay::masking::MaskingEngine;
use opsrelay::mcp::clients::{LocalTransport, Transport};
use opsrelay::mcp::types::Tool;
use opsrelay::mcp::{ConnectionManager, ConnectionStatus};
use opsrelay::orchestrator::{
    ChatMessage, ChatModel, Decision, LlmToolCall, OrchestratorEvent, ToolOrchestrator,
};
use opsrelay::routing::{ToolCall, ToolRouter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn descriptor(name: &str, transport: TransportKind) -> ServerDescriptor {
    ServerDescriptor {
        name: name.to_string(),
        transport,
        url: None,
        command: None,
        args: Vec::new(),
        env: None,
        cwd: None,
        timeouts: TimeoutConfig::default(),
        retry: RetryPolicy::default(),
        enabled: true,
        enabled_tools: None,
        disabled_tools: None,
        auth: AuthConfig::None,
        headers: HashMap::new(),
    }
}

async fn mock_http_tool_server() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": "1",
            "result": {
                "tools": [{
                    "name": "fetch_logs",
                    "description": "Fetch recent log lines",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"service": {"type": "string"}},
                        "required": ["service"]
                    }
                }]
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": "2",
            "result": {"lines": ["error on 10.9.8.7", "retrying"]}
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn http_server_discovery_routing_and_ping() {
    opsrelay::init_logging();
    let mock = mock_http_tool_server().await;

    let mut d = descriptor("ops-http", TransportKind::Http);
    d.url = Some(mock.uri());

    let router = ToolRouter::new();
    router.initialize(vec![d], HashMap::new()).await.unwrap();

    // Discovery published the tool.
    let tools = router.list_tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "fetch_logs");

    // Argument validation happens before the wire.
    let err = router.call("fetch_logs", json!({})).await.unwrap_err();
    assert_eq!(err.category(), "tool_call_failed");

    // A valid call reaches the mock server.
    let result = router.call("fetch_logs", json!({"service": "api"})).await.unwrap();
    assert_eq!(result["lines"][1], json!("retrying"));

    // Health check reflects the /health endpoint.
    let health = router.health_check().await;
    assert_eq!(health.connected_servers, 1);
    assert!(health.servers[0].responsive);

    // A batch against one server keeps outcomes parallel to the requests.
    let outcomes = router
        .call_batch(vec![
            ToolCall::new("fetch_logs", json!({"service": "api"})),
            ToolCall::new("no_such_tool", json!({})),
        ])
        .await;
    assert!(outcomes[0].is_success());
    assert_eq!(outcomes[1].error().unwrap().category(), "tool_not_found");
}

#[tokio::test]
async fn disconnect_blocks_calls_without_reaching_transport() {
    let mock = mock_http_tool_server().await;

    let mut d = descriptor("ops-http", TransportKind::Http);
    d.url = Some(mock.uri());

    let manager = ConnectionManager::new(d).unwrap();
    manager.connect().await.unwrap();
    assert_eq!(manager.status().await, ConnectionStatus::Connected);

    manager.disconnect().await.unwrap();
    let received_before = mock.received_requests().await.unwrap().len();

    let err = manager
        .call("fetch_logs", json!({"service": "api"}), std::time::Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "server_not_connected");

    // No additional request hit the wire.
    assert_eq!(mock.received_requests().await.unwrap().len(), received_before);
}

/// Model scripted to ask for both tools, then answer by echoing whatever
/// masked addresses the prompt contains.
struct EchoMaskedModel;

#[async_trait]
impl ChatModel for EchoMaskedModel {
    async fn decide(&self, _messages: &[ChatMessage], tools: &[Tool]) -> Result<Decision> {
        Ok(Decision::ToolCalls(
            tools
                .iter()
                .enumerate()
                .map(|(i, tool)| LlmToolCall {
                    id: format!("call-{}", i),
                    name: tool.name.clone(),
                    arguments: json!({}),
                })
                .collect(),
        ))
    }

    async fn stream_reply(&self, messages: &[ChatMessage]) -> Result<opsrelay::orchestrator::ChunkStream> {
        let prompt: String = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        let masked: Vec<String> = prompt
            .split(|c: char| c.is_whitespace() || c == '"' || c == ',')
            .filter(|w| w.starts_with("10.0.") || w.starts_with("host-"))
            .map(str::to_string)
            .collect();

        let text = format!("Affected: {}", masked.join(" and "));
        // One chunk per word to exercise incremental restoration.
        let chunks: Vec<Result<String>> = text
            .split_inclusive(' ')
            .map(|s| Ok(s.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[tokio::test]
async fn two_phase_turn_over_local_tools_restores_everything() {
    let host = LocalTransport::new("ops-local");
    host.register(
        Tool::new("cluster_status", "Cluster status", json!({"type": "object"})).unwrap(),
        |_| Box::pin(async { Ok(json!({"ip": "192.168.1.100"})) }),
    )
    .await
    .unwrap();
    host.register(
        Tool::new("node_info", "Node info", json!({"type": "object"})).unwrap(),
        |_| Box::pin(async { Ok(json!({"host": "db-prod-07"})) }),
    )
    .await
    .unwrap();

    let manager = ConnectionManager::with_transport(
        descriptor("ops-local", TransportKind::Local),
        Transport::Local(host),
    );
    let router = Arc::new(ToolRouter::new());
    router.add_manager(Arc::new(manager)).await;

    let masking = Arc::new(MaskingEngine::new(&MaskingConfig::default()));
    let orchestrator = ToolOrchestrator::new(router, masking, Arc::new(EchoMaskedModel));

    let mut stream = orchestrator.run_turn(vec![ChatMessage::user("what is degraded?")]);
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    // Both tools bracketed by progress events.
    let started: Vec<&OrchestratorEvent> = events
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::ToolCallStarted { .. }))
        .collect();
    assert_eq!(started.len(), 2);

    // Reconstruct what the client displays.
    let mut displayed = String::new();
    for event in &events {
        match event {
            OrchestratorEvent::Text { content } => displayed.push_str(content),
            OrchestratorEvent::ContentUpdate { content } => displayed = content.clone(),
            _ => {}
        }
    }

    // The final rendering carries the restored originals, not pseudonyms.
    assert!(displayed.contains("192.168.1.100"));
    assert!(displayed.contains("db-prod-07"));
    assert!(!displayed.contains("host-"));

    // The summaries never carried the raw payload.
    for event in &events {
        if let OrchestratorEvent::ToolCallFinished { summary, .. } = event {
            assert!(!summary.contains("192.168.1.100"));
            assert!(!summary.contains("db-prod-07"));
        }
    }
}

/// Value walk sanity against a realistic payload shape.
#[tokio::test]
async fn masked_tool_payloads_keep_structure() {
    let engine = MaskingEngine::new(&MaskingConfig::default());
    let payload: Value = json!({
        "summary": {"total": 3, "healthy": 1},
        "nodes": ["10.1.1.1", "10.1.1.2", "10.1.1.3"]
    });

    let masked = engine.mask_all(std::slice::from_ref(&payload), "turn-x").unwrap();
    assert_eq!(masked[0]["summary"]["total"], json!(3));
    assert_eq!(masked[0]["nodes"].as_array().unwrap().len(), 3);
}
