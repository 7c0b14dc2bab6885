//! Tool-using agent loop.
//!
//! Prompt → generate → tool calls → invoke tools → feed results back →
//! repeat, until the model answers without tool calls or the step budget runs
//! out.
//!
//! # Tool errors
//!
//! An unknown tool name or a failing invocation is not fatal. It is fed back
//! to the model as a tool result with `is_error = true` and content
//! `Error: <reason>`, and it consumes one unit of `tool_error_budget`. A tool
//! error that arrives with no budget left ends the run with
//! [`AgentStatus::ToolError`]. Backend and pipeline errors are returned as
//! `Err` from [`Agent::run`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{PipelineError, Result};
use crate::mcp::McpServerManager;
use crate::tools::{Tool, ToolRegistry};
use crate::traits::{CompletionOptions, Generator, Message, Request};

fn default_max_steps() -> usize {
    10
}

fn default_tool_error_budget() -> u32 {
    3
}

/// Agent loop limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum backend calls per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Tool errors tolerated per run before it stops.
    #[serde(default = "default_tool_error_budget")]
    pub tool_error_budget: u32,

    /// Optional system prompt placed first in the transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            tool_error_budget: default_tool_error_budget(),
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    /// Cap on backend calls per run.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Tool errors tolerated before a run stops with
    /// [`AgentStatus::ToolError`].
    pub fn with_tool_error_budget(mut self, budget: u32) -> Self {
        self.tool_error_budget = budget;
        self
    }

    /// System prompt placed first in every transcript.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Check the limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(PipelineError::Config(
                "agent.max_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// State of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Not finished yet.
    Running,
    /// The model answered without requesting tools.
    FinalAnswer,
    /// The tool error budget ran out.
    ToolError,
    /// `max_steps` backend calls were made without a final answer.
    StepLimitExceeded,
}

/// Outcome of [`Agent::run`].
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// How the run ended.
    pub status: AgentStatus,
    /// Final answer text, set only for [`AgentStatus::FinalAnswer`].
    pub answer: Option<String>,
    /// Every message of the run, system prompt first.
    pub transcript: Vec<Message>,
    /// Backend calls made.
    pub steps: usize,
    /// Tool errors observed, including a terminal one.
    pub tool_errors: u32,
}

impl AgentRun {
    /// Check if the run produced a final answer.
    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::FinalAnswer
    }
}

/// Agent driving a [`Generator`] with local and MCP tools.
pub struct Agent {
    generator: Arc<dyn Generator>,
    backend: String,
    model: String,
    options: CompletionOptions,
    config: AgentConfig,
    tools: ToolRegistry,
    mcp: Option<Arc<McpServerManager>>,
}

impl Agent {
    /// Create an agent calling `model` through `generator`.
    pub fn new(generator: Arc<dyn Generator>, model: impl Into<String>) -> Self {
        Self {
            generator,
            backend: String::new(),
            model: model.into(),
            options: CompletionOptions::default(),
            config: AgentConfig::default(),
            tools: ToolRegistry::new(),
            mcp: None,
        }
    }

    /// Replace the step limit, tool error budget and system prompt.
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Backend id placed on each request. Routers overwrite it per attempt.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Sampling options sent with every request.
    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the local tool registry.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Register one more local tool.
    ///
    /// # Errors
    ///
    /// Fails when a local tool with the same name is already registered.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Result<Self> {
        self.tools.register_tool(tool)?;
        Ok(self)
    }

    /// Expose tools from these MCP servers.
    pub fn with_mcp(mut self, manager: Arc<McpServerManager>) -> Self {
        self.mcp = Some(manager);
        self
    }

    /// Limits in effect for [`run`](Self::run).
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Local tools. MCP tools are discovered per run and not listed here.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Local tools plus discovered MCP tools; local names win.
    async fn run_tools(&self) -> ToolRegistry {
        let mut tools = self.tools.clone();
        if let Some(manager) = &self.mcp {
            let shadowed = tools.merge(manager.discover().await);
            for name in shadowed {
                debug!(tool = %name, "MCP tool shadowed by local tool");
            }
        }
        tools
    }

    /// Run the loop for one prompt.
    pub async fn run(&self, prompt: impl Into<String>) -> Result<AgentRun> {
        self.config.validate()?;
        let span = info_span!(
            "agent",
            model = %self.model,
            max_steps = self.config.max_steps,
        );
        self.run_loop(prompt.into()).instrument(span).await
    }

    async fn run_loop(&self, prompt: String) -> Result<AgentRun> {
        let mut transcript = Vec::with_capacity(4);
        if let Some(system) = &self.config.system_prompt {
            transcript.push(Message::system(system.clone()));
        }
        transcript.push(Message::user(prompt));

        let tools = self.run_tools().await;
        let definitions = tools.definitions();
        let mut budget = self.config.tool_error_budget;
        let mut tool_errors = 0u32;
        let mut steps = 0usize;

        while steps < self.config.max_steps {
            let request = Request::new(&self.backend, &self.model, transcript.clone())
                .with_tools(definitions.clone())
                .with_options(self.options.clone());

            let response = self.generator.generate(request).await?;
            steps += 1;

            if !response.has_tool_calls() {
                info!(steps, tool_errors, "Agent produced final answer");
                transcript.push(Message::assistant(response.text.clone()));
                return Ok(AgentRun {
                    status: AgentStatus::FinalAnswer,
                    answer: Some(response.text),
                    transcript,
                    steps,
                    tool_errors,
                });
            }

            debug!(step = steps, calls = response.tool_calls.len(), "Executing tool calls");
            transcript.push(Message::assistant_with_tools(
                response.text.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                match tools.invoke(call).await {
                    Ok(output) => {
                        debug!(tool = %call.name, call_id = %call.id, "Tool succeeded");
                        transcript.push(Message::tool_result(&call.id, output, false));
                    }
                    Err(error) => {
                        tool_errors += 1;
                        transcript.push(Message::tool_result(
                            &call.id,
                            format!("Error: {}", error),
                            true,
                        ));
                        if budget == 0 {
                            warn!(tool = %call.name, error = %error, "Tool error budget exhausted");
                            return Ok(AgentRun {
                                status: AgentStatus::ToolError,
                                answer: None,
                                transcript,
                                steps,
                                tool_errors,
                            });
                        }
                        budget -= 1;
                        warn!(
                            tool = %call.name,
                            error = %error,
                            remaining_budget = budget,
                            "Tool error fed back to model"
                        );
                    }
                }
            }
        }

        warn!(steps, "Agent reached step limit");
        Ok(AgentRun {
            status: AgentStatus::StepLimitExceeded,
            answer: None,
            transcript,
            steps,
            tool_errors,
        })
    }
}
