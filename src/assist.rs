//! Analysis collaborator interface
//!
//! The broker only decides *when* to ask. What the answer says is up to the
//! [`OutputAnalyzer`] implementation, and a suggested command is never run
//! without an explicit approval coming back through the gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Context passed alongside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisContext {
    pub hostname: String,
    pub username: String,
    /// Oldest first
    pub recent_commands: Vec<String>,
    /// Free-form question, when the user asked one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Answer from the analyzer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_approval: Option<bool>,
}

impl Analysis {
    /// Suggested command, if any non-blank one was returned.
    pub fn suggested_command(&self) -> Option<&str> {
        self.command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("analysis service unavailable: {0}")]
    Unavailable(String),

    #[error("analysis failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait OutputAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        snapshot: &str,
        context: &AnalysisContext,
    ) -> Result<Analysis, AnalyzerError>;
}

/// What caused an analysis request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisTrigger {
    /// Command-boundary detector fired
    CommandCompleted,
    /// Client asked to analyze the whole buffer
    Manual,
    /// Client asked a free-form question
    Question,
}

/// Analyzer answer as delivered to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub trigger: AnalysisTrigger,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub requires_approval: bool,
}

/// Assistant-related notifications for session observers
#[derive(Debug, Clone, PartialEq)]
pub enum AssistEvent {
    Status { enabled: bool },
    ProcessingStarted { trigger: AnalysisTrigger },
    ProcessingFinished { trigger: AnalysisTrigger },
    Response(AnalysisResponse),
    /// Needs human approval before anything is written to the shell
    CommandSuggestion { command: String },
    CommandExecuted { command: String },
    Error { message: String },
}

impl AnalysisResponse {
    pub fn from_analysis(trigger: AnalysisTrigger, analysis: Analysis) -> Self {
        let command = analysis.suggested_command().map(str::to_string);
        Self {
            trigger,
            // A suggestion always goes through approval, whatever the analyzer says.
            requires_approval: command.is_some() || analysis.requires_approval.unwrap_or(false),
            command,
            message: analysis.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_command_is_not_a_suggestion() {
        let analysis = Analysis {
            message: "ok".into(),
            command: Some("   ".into()),
            requires_approval: None,
        };
        assert_eq!(analysis.suggested_command(), None);
        let response = AnalysisResponse::from_analysis(AnalysisTrigger::Manual, analysis);
        assert!(response.command.is_none());
        assert!(!response.requires_approval);
    }

    #[test]
    fn test_suggestion_always_requires_approval() {
        let analysis = Analysis {
            message: "disk is full".into(),
            command: Some("df -h".into()),
            requires_approval: Some(false),
        };
        let response = AnalysisResponse::from_analysis(AnalysisTrigger::CommandCompleted, analysis);
        assert_eq!(response.command.as_deref(), Some("df -h"));
        assert!(response.requires_approval);
    }

    #[test]
    fn test_analysis_wire_format() {
        let analysis: Analysis =
            serde_json::from_str(r#"{"message":"hi","command":"ls","requiresApproval":true}"#)
                .unwrap();
        assert_eq!(analysis.requires_approval, Some(true));
    }
}
