//! The append-only per-session record of agent decisions and outcomes.
//!
//! Two sibling files are written on graceful shutdown or explicit save: a
//! structured JSON array of actions and a human-readable report. Both are
//! written to a temp file in the target directory and renamed into place.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Analysis,
    ToolCall,
    Synthesis,
    Error,
}

impl ActionKind {
    fn label(self) -> &'static str {
        match self {
            ActionKind::Analysis => "ANALYSIS",
            ActionKind::ToolCall => "TOOL CALL",
            ActionKind::Synthesis => "SYNTHESIS",
            ActionKind::Error => "ERROR",
        }
    }
}

/// Immutable record of one agent decision or outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub timestamp: DateTime<Utc>,
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_excerpt: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
}

impl AgentAction {
    pub fn new(kind: ActionKind, purpose: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            server: None,
            tool: None,
            purpose: purpose.into(),
            parameters: None,
            result_excerpt: None,
            success: true,
            duration_ms: 0,
        }
    }
}

/// Paths produced by one save.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedReport {
    pub json_path: PathBuf,
    pub report_path: PathBuf,
}

/// Append-only action log for one session.
pub struct SessionLog {
    session_id: String,
    started_at: DateTime<Utc>,
    actions: Vec<AgentAction>,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLog {
    pub fn new() -> Self {
        let session_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            session_id,
            started_at: Utc::now(),
            actions: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn push(&mut self, action: AgentAction) {
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[AgentAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Write the structured log and the readable report into `dir`.
    pub fn save(&self, dir: &Path) -> Result<SavedReport, GatewayError> {
        fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let json_path = dir.join(format!("session_{}_{stamp}.json", self.session_id));
        let report_path = dir.join(format!("report_session_{}_{stamp}.txt", self.session_id));

        let document = json!({
            "session_id": self.session_id,
            "started_at": self.started_at,
            "saved_at": Utc::now(),
            "total_actions": self.actions.len(),
            "actions": self.actions,
        });
        let encoded = serde_json::to_string_pretty(&document)
            .map_err(|err| GatewayError::Configuration(format!("log not serializable: {err}")))?;
        write_atomic(&json_path, &encoded)?;
        write_atomic(&report_path, &self.render_report())?;

        Ok(SavedReport {
            json_path,
            report_path,
        })
    }

    /// Human-readable summary: banner header, totals, then one block per
    /// action.
    pub fn render_report(&self) -> String {
        const RULE: &str =
            "======================================================================";
        const LINE: &str =
            "----------------------------------------------------------------------";

        if self.actions.is_empty() {
            return "No actions logged in this session.\n".to_string();
        }

        let mut lines: Vec<String> = vec![
            RULE.to_string(),
            "AGENTGATE ACTIVITY REPORT".to_string(),
            format!("Session: {}", self.session_id),
            format!("Generated: {}", Utc::now().format("%Y-%m-%d %H:%M:%S")),
            RULE.to_string(),
            String::new(),
        ];

        let tool_calls: Vec<&AgentAction> = self
            .actions
            .iter()
            .filter(|action| action.kind == ActionKind::ToolCall)
            .collect();
        let successful = tool_calls.iter().filter(|action| action.success).count();
        let average_ms = if tool_calls.is_empty() {
            0.0
        } else {
            tool_calls.iter().map(|a| a.duration_ms as f64).sum::<f64>() / tool_calls.len() as f64
        };

        lines.extend([
            "SUMMARY".to_string(),
            LINE.to_string(),
            format!("Total Actions: {}", self.actions.len()),
            format!("Tool Calls: {}", tool_calls.len()),
            format!("Successful: {successful}"),
            format!("Failed: {}", tool_calls.len() - successful),
            format!("Average Tool Duration: {average_ms:.2}ms"),
            String::new(),
            "DETAILED ACTIONS".to_string(),
            LINE.to_string(),
            String::new(),
        ]);

        for (index, action) in self.actions.iter().enumerate() {
            let time = action.timestamp.format("%H:%M:%S");
            let status = if action.success { "OK" } else { "FAILED" };
            lines.push(format!(
                "{}. [{time}] {} - {status}",
                index + 1,
                action.kind.label()
            ));
            if let Some(server) = &action.server {
                lines.push(format!("   Server: {server}"));
            }
            if let Some(tool) = &action.tool {
                lines.push(format!("   Tool: {tool}"));
            }
            if !action.purpose.is_empty() {
                lines.push(format!("   Purpose: {}", action.purpose));
            }
            if let Some(parameters) = &action.parameters {
                lines.push(format!("   Parameters: {parameters}"));
            }
            lines.push(format!("   Duration: {}ms", action.duration_ms));
            if let Some(excerpt) = &action.result_excerpt {
                lines.push(format!("   Result: {excerpt}"));
            }
            lines.push(String::new());
        }

        lines.extend([RULE.to_string(), "END OF REPORT".to_string(), RULE.to_string()]);
        let mut report = lines.join("\n");
        report.push('\n');
        report
    }
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn sample_log() -> SessionLog {
        let mut log = SessionLog::new();
        log.push(AgentAction::new(
            ActionKind::Analysis,
            "file read requested",
        ));
        let mut call = AgentAction::new(ActionKind::ToolCall, "read the requested file");
        call.server = Some("filesystem".to_string());
        call.tool = Some("read_file".to_string());
        call.parameters = Some(json!({"path": "/tmp/hello.txt"}));
        call.result_excerpt = Some("Hello, world!".to_string());
        call.duration_ms = 12;
        log.push(call);
        log
    }

    #[test]
    fn save_writes_parseable_json_and_a_report_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = sample_log();
        let saved = log.save(dir.path()).expect("save");

        assert!(saved.json_path.file_name().is_some_and(|name| {
            name.to_string_lossy().starts_with(&format!("session_{}_", log.session_id()))
        }));
        assert!(saved.report_path.file_name().is_some_and(|name| {
            name.to_string_lossy()
                .starts_with(&format!("report_session_{}_", log.session_id()))
        }));

        let raw = std::fs::read_to_string(&saved.json_path).expect("read json");
        let document: Value = serde_json::from_str(&raw).expect("parse json");
        assert_eq!(document["total_actions"], json!(2));
        assert_eq!(document["actions"][1]["tool"], json!("read_file"));

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn report_contains_totals_and_action_blocks() {
        let log = sample_log();
        let report = log.render_report();
        assert!(report.contains("AGENTGATE ACTIVITY REPORT"));
        assert!(report.contains("Total Actions: 2"));
        assert!(report.contains("Tool Calls: 1"));
        assert!(report.contains("Successful: 1"));
        assert!(report.contains("TOOL CALL - OK"));
        assert!(report.contains("Server: filesystem"));
        assert!(report.contains("Result: Hello, world!"));
        assert!(report.contains("END OF REPORT"));
    }

    #[test]
    fn empty_log_renders_a_placeholder() {
        let log = SessionLog::new();
        assert_eq!(log.render_report(), "No actions logged in this session.\n");
    }

    #[test]
    fn actions_round_trip_through_serde() {
        let mut action = AgentAction::new(ActionKind::ToolCall, "purpose");
        action.server = Some("memory".to_string());
        action.success = false;
        let encoded = serde_json::to_string(&action).expect("encode");
        let decoded: AgentAction = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.kind, ActionKind::ToolCall);
        assert_eq!(decoded.server.as_deref(), Some("memory"));
        assert!(!decoded.success);
    }
}
