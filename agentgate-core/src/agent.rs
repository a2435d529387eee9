//! The single-turn orchestration controller.
//!
//! For one user message the agent (a) asks the model which tools to use
//! against the live catalog, (b) validates the proposed calls against each
//! tool's declared schema, (c) executes the valid ones concurrently through
//! the registry, (d) records every decision and outcome as an
//! [`AgentAction`], and (e) assembles the final augmented prompt for
//! generation. Tool selection is best-effort by construction: an
//! unparseable plan degrades the turn to a plain retrieval-augmented
//! answer.

use std::future::Future;
use std::time::Instant;

use agentgate_ollama::GenerateRequest;
use agentgate_protocol::CallToolResult;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::activity_log::ActionKind;
use crate::activity_log::AgentAction;
use crate::activity_log::SessionLog;
use crate::connection_manager::ToolDescriptor;
use crate::error::GatewayError;
use crate::truncate::truncate_chars;

/// Seam to the registry (or a test double).
pub trait ToolExecutor {
    fn catalog(&self) -> impl Future<Output = Vec<ToolDescriptor>> + Send;
    fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> impl Future<Output = Result<CallToolResult, GatewayError>> + Send;
}

/// Seam to the generation backend (or a test double).
pub trait TextGenerator {
    fn generate(
        &self,
        request: GenerateRequest,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;
}

/// Seam to the external retrieval collaborator. The default implementation
/// retrieves nothing.
pub trait ContextRetriever {
    fn retrieve(&self, query: &str) -> impl Future<Output = Result<String, GatewayError>> + Send;
}

pub struct NoRetrieval;

impl ContextRetriever for NoRetrieval {
    async fn retrieve(&self, _query: &str) -> Result<String, GatewayError> {
        Ok(String::new())
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Bound on `result_excerpt` in logged actions.
    pub excerpt_limit: usize,
    /// Bound on each tool result included in the synthesis prompt.
    pub tool_output_limit: usize,
    /// Preamble for the synthesis call.
    pub system_prompt: String,
    /// Skip the analysis round entirely (generation-only turns).
    pub tools_enabled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            excerpt_limit: 500,
            tool_output_limit: 4096,
            system_prompt: "You are a capable local assistant. Answer directly and \
                            concisely. When tool results are provided, ground your \
                            answer in them."
                .to_string(),
            tools_enabled: true,
        }
    }
}

/// Outcome of one turn.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub answer: String,
    pub actions: Vec<AgentAction>,
}

/// The tool plan the model is asked to emit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolPlan {
    #[serde(default)]
    pub needs_tools: bool,
    #[serde(default, alias = "recommended_tools")]
    pub tool_calls: Vec<PlannedCall>,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedCall {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub purpose: String,
}

struct ExecutedCall {
    server: String,
    tool: String,
    success: bool,
    output: String,
    error_kind: Option<&'static str>,
}

pub struct Agent<E, G, R> {
    executor: E,
    generator: G,
    retriever: R,
    config: AgentConfig,
    log: SessionLog,
}

impl<E, G, R> Agent<E, G, R>
where
    E: ToolExecutor + Sync,
    G: TextGenerator + Sync,
    R: ContextRetriever + Sync,
{
    pub fn new(executor: E, generator: G, retriever: R, config: AgentConfig) -> Self {
        Self {
            executor,
            generator,
            retriever,
            config,
            log: SessionLog::new(),
        }
    }

    pub fn session_log(&self) -> &SessionLog {
        &self.log
    }

    /// Run one full turn: analyze, validate, execute, synthesize.
    pub async fn handle_turn(&mut self, user_message: &str) -> AgentTurn {
        let first_action = self.log.actions().len();
        let catalog = self.executor.catalog().await;

        let plan = if self.config.tools_enabled && !catalog.is_empty() {
            self.analyze(user_message, &catalog).await
        } else {
            ToolPlan {
                needs_tools: false,
                tool_calls: Vec::new(),
                reasoning: "no tools available".to_string(),
            }
        };

        let executed = if plan.needs_tools {
            let valid = self.validate_plan(plan.tool_calls, &catalog);
            self.execute_calls(valid).await
        } else {
            Vec::new()
        };

        let answer = self.synthesize(user_message, &executed).await;
        let actions = self.log.actions()[first_action..].to_vec();
        AgentTurn { answer, actions }
    }

    /// LLM call #1: tool selection against the catalog.
    async fn analyze(&mut self, user_message: &str, catalog: &[ToolDescriptor]) -> ToolPlan {
        let started = Instant::now();
        let request = GenerateRequest {
            prompt: analysis_prompt(user_message, catalog),
            system: Some(ANALYSIS_SYSTEM_PROMPT.to_string()),
            context: None,
            model: None,
            options: Default::default(),
        };

        let mut action = AgentAction::new(ActionKind::Analysis, String::new());
        let plan = match self.generator.generate(request).await {
            Ok(reply) => match extract_plan(&reply) {
                Some(plan) => {
                    action.purpose = plan.reasoning.clone();
                    action.result_excerpt =
                        Some(truncate_chars(reply.trim(), self.config.excerpt_limit));
                    plan
                }
                None => {
                    warn!("tool-selection reply was not parseable as a plan; degrading");
                    action.success = false;
                    action.purpose = "unparseable tool-selection reply".to_string();
                    action.result_excerpt =
                        Some(truncate_chars(reply.trim(), self.config.excerpt_limit));
                    ToolPlan::default()
                }
            },
            Err(err) => {
                warn!("tool-selection call failed ({}); degrading", err.kind());
                action.success = false;
                action.purpose = format!("analysis failed: {}", err.kind());
                ToolPlan::default()
            }
        };
        action.duration_ms = started.elapsed().as_millis() as u64;
        self.log.push(action);
        plan
    }

    /// Drop proposed calls that do not match the catalog or miss required
    /// parameters; execution proceeds with the remainder.
    fn validate_plan(
        &mut self,
        proposed: Vec<PlannedCall>,
        catalog: &[ToolDescriptor],
    ) -> Vec<PlannedCall> {
        let mut valid = Vec::new();
        for call in proposed {
            let descriptor = catalog
                .iter()
                .find(|d| d.server_name == call.server && d.tool_name == call.tool);
            let Some(descriptor) = descriptor else {
                warn!(
                    server = %call.server,
                    tool = %call.tool,
                    "dropping planned call to unknown tool"
                );
                continue;
            };
            if let Some(missing) = missing_required(descriptor, &call.parameters) {
                warn!(
                    server = %call.server,
                    tool = %call.tool,
                    "dropping planned call missing required parameter '{missing}'"
                );
                continue;
            }
            valid.push(call);
        }
        valid
    }

    /// Run the validated calls concurrently. Every call produces exactly one
    /// `tool_call` action with exactly one resolution.
    async fn execute_calls(&mut self, calls: Vec<PlannedCall>) -> Vec<ExecutedCall> {
        let call_futures = calls.iter().map(|call| {
            let executor = &self.executor;
            async move {
                let started = Instant::now();
                let outcome = executor
                    .call_tool(&call.server, &call.tool, call.parameters.clone())
                    .await;
                (started.elapsed(), outcome)
            }
        });
        let outcomes = futures::future::join_all(call_futures).await;

        let mut executed = Vec::with_capacity(calls.len());
        for (call, (elapsed, outcome)) in calls.iter().zip(outcomes) {
            let mut action = AgentAction::new(ActionKind::ToolCall, call.purpose.clone());
            action.server = Some(call.server.clone());
            action.tool = Some(call.tool.clone());
            action.parameters = Some(call.parameters.clone());
            action.duration_ms = elapsed.as_millis() as u64;

            let record = match outcome {
                Ok(result) => {
                    let output = result.text_content();
                    let failed = result.is_error.unwrap_or(false);
                    action.success = !failed;
                    action.result_excerpt =
                        Some(truncate_chars(&output, self.config.excerpt_limit));
                    ExecutedCall {
                        server: call.server.clone(),
                        tool: call.tool.clone(),
                        success: !failed,
                        output,
                        error_kind: failed.then_some("tool-error"),
                    }
                }
                Err(err) => {
                    let kind = err.kind();
                    action.success = false;
                    action.result_excerpt =
                        Some(truncate_chars(&err.to_string(), self.config.excerpt_limit));
                    ExecutedCall {
                        server: call.server.clone(),
                        tool: call.tool.clone(),
                        success: false,
                        output: err.to_string(),
                        error_kind: Some(kind),
                    }
                }
            };
            self.log.push(action);
            executed.push(record);
        }
        executed
    }

    /// LLM call #2: compose the final answer from retrieved context and the
    /// bounded tool outputs. Failures degrade to a summary of what the
    /// tools returned.
    async fn synthesize(&mut self, user_message: &str, executed: &[ExecutedCall]) -> String {
        let started = Instant::now();

        let retrieved = match self.retriever.retrieve(user_message).await {
            Ok(context) => context,
            Err(err) => {
                warn!("context retrieval failed ({}); continuing without", err.kind());
                String::new()
            }
        };

        let tool_block = self.render_tool_block(executed);
        let context = match (retrieved.trim().is_empty(), tool_block.is_empty()) {
            (true, true) => None,
            (false, true) => Some(retrieved),
            (true, false) => Some(tool_block),
            (false, false) => Some(format!("{retrieved}\n\n{tool_block}")),
        };

        let request = GenerateRequest {
            prompt: user_message.to_string(),
            system: Some(self.config.system_prompt.clone()),
            context,
            model: None,
            options: Default::default(),
        };

        let mut action = AgentAction::new(ActionKind::Synthesis, "compose final answer");
        let answer = match self.generator.generate(request).await {
            Ok(answer) => {
                action.result_excerpt =
                    Some(truncate_chars(answer.trim(), self.config.excerpt_limit));
                answer
            }
            Err(err) => {
                action.success = false;
                action.kind = ActionKind::Error;
                action.purpose = format!("synthesis failed: {}", err.kind());
                degraded_answer(err.kind(), executed)
            }
        };
        action.duration_ms = started.elapsed().as_millis() as u64;
        self.log.push(action);

        append_failure_footer(answer, executed)
    }

    fn render_tool_block(&self, executed: &[ExecutedCall]) -> String {
        if executed.is_empty() {
            return String::new();
        }
        let mut block = String::from("Tool results:");
        for call in executed {
            let status = if call.success { "ok" } else { "failed" };
            let output = truncate_chars(&call.output, self.config.tool_output_limit);
            block.push_str(&format!(
                "\n\n### {}.{} ({status})\n{output}",
                call.server, call.tool
            ));
        }
        block
    }
}

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a tool-selection analyzer for a local \
assistant. Given a user request and the available tools, decide whether tools are \
needed and which calls to make. Respond ONLY with a JSON object of the exact shape \
{\"needs_tools\": true|false, \"tool_calls\": [{\"server\": \"...\", \"tool\": \
\"...\", \"parameters\": {...}, \"purpose\": \"...\"}], \"reasoning\": \"...\"}. \
No prose outside the JSON.";

fn analysis_prompt(user_message: &str, catalog: &[ToolDescriptor]) -> String {
    let entries: Vec<Value> = catalog
        .iter()
        .map(|descriptor| {
            serde_json::json!({
                "server": descriptor.server_name,
                "tool": descriptor.tool_name,
                "description": descriptor.description.clone().unwrap_or_default(),
                "parameters": descriptor.input_schema,
            })
        })
        .collect();
    let rendered = serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string());
    format!(
        "User request: {user_message:?}\n\nAvailable tools:\n{rendered}\n\n\
         Decide which tools (if any) to call for this request."
    )
}

/// Parse the model's tool-selection reply with three strategies in order:
/// a direct parse, the first fenced ```json block, then a brace-depth scan
/// from the first `{`.
pub(crate) fn extract_plan(raw: &str) -> Option<ToolPlan> {
    let trimmed = raw.trim();
    if let Ok(plan) = serde_json::from_str::<ToolPlan>(trimmed) {
        return Some(plan);
    }
    if let Some(block) = fenced_json_block(trimmed) {
        if let Ok(plan) = serde_json::from_str::<ToolPlan>(block) {
            return Some(plan);
        }
    }
    if let Some(object) = first_json_object(trimmed) {
        if let Ok(plan) = serde_json::from_str::<ToolPlan>(object) {
            debug!("tool plan recovered via brace scan");
            return Some(plan);
        }
    }
    None
}

fn fenced_json_block(raw: &str) -> Option<&str> {
    let start = raw.find("```json")?;
    let rest = &raw[start + "```json".len()..];
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// Scan for the first balanced `{...}` object, aware of strings and escape
/// sequences.
fn first_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, byte) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&raw[start..=index]);
                }
            }
            _ => {}
        }
    }
    None
}

fn missing_required(descriptor: &ToolDescriptor, parameters: &Value) -> Option<String> {
    let required = descriptor.input_schema.required.as_deref().unwrap_or(&[]);
    if required.is_empty() {
        return None;
    }
    let Some(object) = parameters.as_object() else {
        return required.first().cloned();
    };
    required
        .iter()
        .find(|name| !object.contains_key(*name))
        .cloned()
}

fn degraded_answer(kind: &str, executed: &[ExecutedCall]) -> String {
    let mut answer = format!("The language model is currently unavailable ({kind}).");
    let successes: Vec<&ExecutedCall> = executed.iter().filter(|call| call.success).collect();
    if !successes.is_empty() {
        answer.push_str("\n\nTool results gathered for this request:");
        for call in successes {
            answer.push_str(&format!(
                "\n\n### {}.{}\n{}",
                call.server,
                call.tool,
                truncate_chars(&call.output, 1000)
            ));
        }
    }
    answer
}

/// Annotate partial success: a normal answer plus a short footer naming the
/// failed calls.
fn append_failure_footer(answer: String, executed: &[ExecutedCall]) -> String {
    let failures: Vec<&ExecutedCall> = executed.iter().filter(|call| !call.success).collect();
    if failures.is_empty() {
        return answer;
    }
    let mut footer = String::from("\n\n[tool issues]");
    for call in failures {
        footer.push_str(&format!(
            "\n- {}.{}: {}",
            call.server,
            call.tool,
            call.error_kind.unwrap_or("error")
        ));
    }
    answer + &footer
}
