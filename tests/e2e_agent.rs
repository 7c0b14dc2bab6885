//! Agent loop tests through the client: local tools, MCP tools served by an
//! in-process session, and the step and tool-error limits.
//!
//! Run with: cargo test --test e2e_agent

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use edgequake_pipeline::mcp::{McpError, McpSession, McpToolDef, McpToolResult};
use edgequake_pipeline::{
    AgentConfig, AgentStatus, Client, ContentPart, FnTool, McpServerManager, MockBackend,
    OrchestratorConfig, Role, ToolCall,
};
use serde_json::{json, Value as JsonValue};

/// In-process MCP server exposing `forecast` and `add`.
struct WeatherServer {
    calls: AtomicUsize,
}

#[async_trait]
impl McpSession for WeatherServer {
    fn server_name(&self) -> &str {
        "weather"
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        Ok(vec![
            McpToolDef {
                name: "forecast".to_string(),
                description: "Forecast for a city".to_string(),
                input_schema: json!({"type": "object", "required": ["city"]}),
            },
            McpToolDef {
                name: "add".to_string(),
                description: "Remote adder".to_string(),
                input_schema: json!({"type": "object"}),
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<McpToolResult, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (name, arguments["city"].as_str()) {
            ("forecast", Some("Paris")) => Ok(McpToolResult::text("Sunny, 24C")),
            ("forecast", Some(city)) => Ok(McpToolResult::error(format!("Unknown city {}", city))),
            _ => Ok(McpToolResult::text("remote")),
        }
    }
}

fn adder() -> Arc<FnTool> {
    Arc::new(FnTool::new(
        "add",
        "Add two integers",
        json!({"type": "object", "required": ["a", "b"]}),
        |args| async move {
            Ok((args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0)).to_string())
        },
    ))
}

fn setup(config: OrchestratorConfig) -> (Client, MockBackend, Arc<WeatherServer>) {
    let model = MockBackend::new("primary");
    let server = Arc::new(WeatherServer {
        calls: AtomicUsize::new(0),
    });
    let manager = Arc::new(McpServerManager::new());
    manager.attach("weather", server.clone());

    let client = Client::builder(config)
        .backend(Arc::new(model.clone()))
        .mcp(manager)
        .build()
        .unwrap();
    (client, model, server)
}

fn tool_outputs(transcript: &[edgequake_pipeline::Message]) -> Vec<(String, bool)> {
    transcript
        .iter()
        .filter(|m| m.role == Role::Tool)
        .flat_map(|m| m.content.iter())
        .filter_map(|part| match part {
            ContentPart::ToolResult {
                content, is_error, ..
            } => Some((content.clone(), *is_error)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_agent_mixes_local_and_mcp_tools() {
    let (client, model, server) = setup(OrchestratorConfig::default());
    model.add_tool_response(
        "",
        vec![
            ToolCall::new("c1", "forecast", json!({"city": "Paris"})),
            ToolCall::new("c2", "add", json!({"a": 2, "b": 3})),
        ],
    );
    model.add_response("Sunny in Paris, and 2 + 3 = 5.");

    let agent = client.agent("gpt-4o").with_tool(adder()).unwrap();
    let run = agent.run("Weather in Paris, and what is 2 + 3?").await.unwrap();

    assert_eq!(run.status, AgentStatus::FinalAnswer);
    assert_eq!(run.steps, 2);
    assert_eq!(run.answer.as_deref(), Some("Sunny in Paris, and 2 + 3 = 5."));
    assert_eq!(
        tool_outputs(&run.transcript),
        vec![("Sunny, 24C".to_string(), false), ("5".to_string(), false)]
    );
    // The local adder shadows the remote one.
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);

    // Both tools were advertised to the model.
    let first = &model.requests()[0];
    let mut advertised: Vec<&str> = first.tools.iter().map(|t| t.name.as_str()).collect();
    advertised.sort();
    assert_eq!(advertised, vec!["add", "forecast"]);
}

#[tokio::test]
async fn test_remote_tool_error_is_fed_back() {
    let (client, model, _server) = setup(OrchestratorConfig::default());
    model.add_tool_response(
        "",
        vec![ToolCall::new("c1", "forecast", json!({"city": "Atlantis"}))],
    );
    model.add_response("I could not find that city.");

    let run = client.agent("gpt-4o").run("Weather in Atlantis?").await.unwrap();

    assert!(run.is_success());
    assert_eq!(run.tool_errors, 1);
    let outputs = tool_outputs(&run.transcript);
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].1);
    assert!(outputs[0].0.starts_with("Error: "));
    assert!(outputs[0].0.contains("Unknown city Atlantis"));
}

#[tokio::test]
async fn test_config_limits_apply_to_client_agents() {
    let mut config = OrchestratorConfig::default();
    config.agent = AgentConfig::default().with_max_steps(3);
    let (client, model, _server) = setup(config);

    let looping = ToolCall::new("c", "forecast", json!({"city": "Paris"}));
    model.set_fallback(edgequake_pipeline::providers::MockReply::Respond(
        edgequake_pipeline::Response::new("", "gpt-4o").with_tool_calls(vec![looping]),
    ));

    let run = client.agent("gpt-4o").run("Keep checking").await.unwrap();

    assert_eq!(run.status, AgentStatus::StepLimitExceeded);
    assert_eq!(run.steps, 3);
    assert_eq!(model.call_count(), 3);
    assert!(run.answer.is_none());
}

#[tokio::test]
async fn test_tool_error_budget_from_config() {
    let mut config = OrchestratorConfig::default();
    config.agent = AgentConfig::default().with_tool_error_budget(1);
    let (client, model, _server) = setup(config);

    for id in ["c1", "c2"] {
        model.add_tool_response("", vec![ToolCall::new(id, "missing_tool", json!({}))]);
    }
    model.add_response("unreachable");

    let run = client.agent("gpt-4o").run("Use a tool").await.unwrap();

    assert_eq!(run.status, AgentStatus::ToolError);
    assert_eq!(run.tool_errors, 2);
    assert_eq!(run.steps, 2);
    assert!(!model.is_exhausted());
}
