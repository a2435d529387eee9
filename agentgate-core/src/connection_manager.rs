//! Connection manager for the configured tool servers.
//!
//! Owns one [`McpClient`] per enabled server (keyed by server name),
//! establishes sessions concurrently, aggregates tool discovery across the
//! ready set and routes `tools/call` through the gateway pipeline. Partial
//! connectivity is a normal state: servers that fail to start are reported
//! per-name and never fail the registry as a whole.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use agentgate_mcp_client::McpClient;
use agentgate_protocol::CallToolResult;
use agentgate_protocol::ClientCapabilities;
use agentgate_protocol::Implementation;
use agentgate_protocol::InitializeParams;
use agentgate_protocol::MCP_SCHEMA_VERSION;
use agentgate_protocol::Tool;
use agentgate_protocol::ToolInputSchema;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

use crate::cache::CacheName;
use crate::config::GatewayConfig;
use crate::config::McpServerConfig;
use crate::error::GatewayError;
use crate::gateway::CallPolicy;
use crate::gateway::Gateway;

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One row of `list_servers`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub name: String,
    pub ready: bool,
    pub tool_count: usize,
    pub description: Option<String>,
    pub detail: Option<String>,
}

/// A tool as exposed to the agent: server-qualified with its runtime input
/// schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub server_name: String,
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: ToolInputSchema,
}

impl ToolDescriptor {
    /// Fully qualified name rendered into prompts.
    pub fn qualified_name(&self) -> String {
        format!("{}__{}", self.server_name, self.tool_name)
    }
}

struct ManagedSession {
    client: Arc<McpClient>,
    tools: Vec<Tool>,
}

pub struct ConnectionManager {
    gateway: Arc<Gateway>,
    specs: HashMap<String, McpServerConfig>,
    disabled: HashMap<String, McpServerConfig>,
    sessions: RwLock<HashMap<String, ManagedSession>>,
    start_errors: RwLock<HashMap<String, String>>,
    draining: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: &GatewayConfig, gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            specs: config.mcp_servers.clone(),
            disabled: config.disabled_servers.clone(),
            sessions: RwLock::new(HashMap::new()),
            start_errors: RwLock::new(HashMap::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Spawn sessions for every enabled server concurrently. Returns the
    /// number of ready servers; per-server failures land in
    /// [`list_servers`](Self::list_servers) details.
    pub async fn connect_all(&self) -> usize {
        let mut join_set = JoinSet::new();
        for (name, spec) in &self.specs {
            let name = name.clone();
            let spec = spec.clone();
            join_set.spawn(async move {
                let result = connect_one(&name, &spec).await;
                (name, result)
            });
        }

        let mut ready = 0;
        while let Some(joined) = join_set.join_next().await {
            let Ok((name, result)) = joined else {
                warn!("task panic while starting a tool server");
                continue;
            };
            match result {
                Ok((client, tools)) => {
                    info!(server = %name, tools = tools.len(), "tool server ready");
                    self.sessions.write().await.insert(
                        name,
                        ManagedSession { client, tools },
                    );
                    ready += 1;
                }
                Err(err) => {
                    warn!(server = %name, "failed to start tool server: {err}");
                    self.start_errors.write().await.insert(name, err.to_string());
                }
            }
        }
        ready
    }

    /// Disconnect one server (if connected) and establish a fresh session,
    /// refreshing its tool catalog. Reconnects happen only on explicit
    /// command; there is no automatic retry loop.
    pub async fn reconnect(&self, server: &str) -> Result<usize, GatewayError> {
        let spec = self
            .specs
            .get(server)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownServer(server.to_string()))?;

        if let Some(session) = self.sessions.write().await.remove(server) {
            let _ = session.client.disconnect(DEFAULT_SHUTDOWN_GRACE).await;
        }

        match connect_one(server, &spec).await {
            Ok((client, tools)) => {
                let tool_count = tools.len();
                self.start_errors.write().await.remove(server);
                self.sessions.write().await.insert(
                    server.to_string(),
                    ManagedSession { client, tools },
                );
                Ok(tool_count)
            }
            Err(err) => {
                self.start_errors
                    .write()
                    .await
                    .insert(server.to_string(), err.to_string());
                Err(err)
            }
        }
    }

    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let sessions = self.sessions.read().await;
        let start_errors = self.start_errors.read().await;
        let mut statuses: Vec<ServerStatus> = Vec::new();

        for (name, spec) in &self.specs {
            match sessions.get(name) {
                Some(session) => statuses.push(ServerStatus {
                    name: name.clone(),
                    ready: true,
                    tool_count: session.tools.len(),
                    description: spec.description.clone(),
                    detail: None,
                }),
                None => statuses.push(ServerStatus {
                    name: name.clone(),
                    ready: false,
                    tool_count: 0,
                    description: spec.description.clone(),
                    detail: Some(
                        start_errors
                            .get(name)
                            .cloned()
                            .unwrap_or_else(|| "not connected".to_string()),
                    ),
                }),
            }
        }
        for (name, spec) in &self.disabled {
            statuses.push(ServerStatus {
                name: name.clone(),
                ready: false,
                tool_count: 0,
                description: spec.description.clone(),
                detail: Some("disabled".to_string()),
            });
        }

        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Tools of one server, or the union across all ready sessions.
    pub async fn list_tools(
        &self,
        server: Option<&str>,
    ) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let sessions = self.sessions.read().await;
        match server {
            Some(name) => {
                let session = sessions
                    .get(name)
                    .ok_or_else(|| GatewayError::UnknownServer(name.to_string()))?;
                Ok(descriptors_for(name, &session.tools))
            }
            None => {
                let mut all: Vec<ToolDescriptor> = sessions
                    .iter()
                    .flat_map(|(name, session)| descriptors_for(name, &session.tools))
                    .collect();
                all.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));
                Ok(all)
            }
        }
    }

    /// The aggregated catalog; an alias of `list_tools(None)` that cannot
    /// fail.
    pub async fn catalog(&self) -> Vec<ToolDescriptor> {
        self.list_tools(None).await.unwrap_or_default()
    }

    /// Case-insensitive substring search over tool names and descriptions.
    pub async fn search_tools(&self, query: &str) -> Vec<ToolDescriptor> {
        let needle = query.to_lowercase();
        self.catalog()
            .await
            .into_iter()
            .filter(|descriptor| {
                descriptor.tool_name.to_lowercase().contains(&needle)
                    || descriptor
                        .description
                        .as_deref()
                        .is_some_and(|description| description.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Invoke one tool through the resilience pipeline. `cacheable` opts the
    /// call into the general cache keyed by its exact inputs.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
        cacheable: bool,
    ) -> Result<CallToolResult, GatewayError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }

        let client = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(server)
                .ok_or_else(|| GatewayError::UnknownServer(server.to_string()))?;
            if !session.tools.iter().any(|t| t.name == tool) {
                return Err(GatewayError::UnknownTool {
                    server: server.to_string(),
                    tool: tool.to_string(),
                });
            }
            Arc::clone(&session.client)
        };

        let timeout = timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT);
        let mut policy = CallPolicy::tool(server, tool).with_timeout(timeout);
        if cacheable {
            let args_key = serde_json::to_string(&arguments).unwrap_or_default();
            policy = policy.with_cache(CacheName::General, format!("{server}.{tool}:{args_key}"));
        }

        let tool_name = tool.to_string();
        let arguments = arguments.clone();
        self.gateway
            .execute(&policy, move || {
                let client = Arc::clone(&client);
                let tool_name = tool_name.clone();
                let arguments = arguments.clone();
                async move {
                    client
                        .call_tool(tool_name, Some(arguments), Some(timeout))
                        .await
                        .map_err(GatewayError::from)
                }
            })
            .await
    }

    /// Disconnect every session in parallel with a bounded grace window.
    pub async fn shutdown(&self, grace: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        let sessions: Vec<(String, Arc<McpClient>)> = {
            let mut guard = self.sessions.write().await;
            guard
                .drain()
                .map(|(name, session)| (name, session.client))
                .collect()
        };
        if sessions.is_empty() {
            return;
        }

        let mut join_set = JoinSet::new();
        for (name, client) in sessions {
            join_set.spawn(async move {
                if let Err(err) = client.disconnect(grace).await {
                    warn!(server = %name, "disconnect failed: {err}");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
        info!("all tool server sessions closed");
    }
}

fn descriptors_for(server: &str, tools: &[Tool]) -> Vec<ToolDescriptor> {
    tools
        .iter()
        .map(|tool| ToolDescriptor {
            server_name: server.to_string(),
            tool_name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        })
        .collect()
}

async fn connect_one(
    name: &str,
    spec: &McpServerConfig,
) -> Result<(Arc<McpClient>, Vec<Tool>), GatewayError> {
    if !crate::config::is_valid_server_name(name) {
        return Err(GatewayError::Configuration(format!(
            "invalid server name '{name}'"
        )));
    }

    let startup_timeout = spec
        .startup_timeout_sec
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_STARTUP_TIMEOUT);

    let client = McpClient::new_stdio_client(
        name,
        OsString::from(spec.command.clone()),
        spec.args.iter().map(OsString::from).collect(),
        spec.env.clone(),
        None,
    )
    .await
    .map_err(|err| GatewayError::Spawn {
        server: name.to_string(),
        reason: err.to_string(),
    })?;

    client
        .initialize(initialize_params(), Some(startup_timeout))
        .await?;

    let tools = match client.list_tools(Some(startup_timeout)).await {
        Ok(result) => result.tools,
        Err(err) => {
            warn!(server = %name, "tools/list failed: {err}");
            Vec::new()
        }
    };

    Ok((Arc::new(client), tools))
}

impl crate::agent::ToolExecutor for Arc<ConnectionManager> {
    async fn catalog(&self) -> Vec<ToolDescriptor> {
        ConnectionManager::catalog(self).await
    }

    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, GatewayError> {
        ConnectionManager::call_tool(self, server, tool, arguments, None, false).await
    }
}

fn initialize_params() -> InitializeParams {
    InitializeParams {
        protocol_version: MCP_SCHEMA_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "agentgate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}
