//! Error taxonomy for cases callers need to match on (§7). Everything else
//! propagates as `anyhow::Error` with `.context(...)` chains.

use std::fmt;

/// Errors the pipeline engine and its callers branch on directly.
///
/// Most failure paths in this crate just bubble up `anyhow::Error`; this
/// enum exists only for the handful of cases where the caller's behavior
/// differs by kind (e.g. a gate timeout retries, a definition error is
/// fatal at startup).
#[derive(Debug)]
pub enum SquadronError {
    /// A pipeline YAML file failed validation (duplicate stage id, dangling
    /// transition target, or a sub-pipeline cycle/over-depth).
    DefinitionInvalid { pipeline: String, reason: String },
    /// A gate check exceeded its configured `timeout_seconds`.
    GateTimeout { stage_id: String },
    /// A worker subprocess exceeded its wall-clock timeout.
    WorkerTimeout { agent_id: String },
    /// A worker hit its circuit-breaker bound (iterations, tool calls,
    /// turns, or wall-clock duration).
    CircuitBreakerTripped { agent_id: String, limit: String },
    /// Forge API call failed after exhausting retries.
    ForgeUnavailable { operation: String, source: String },
    /// Referenced run/stage/agent id does not exist in the registry.
    NotFound { kind: &'static str, id: String },
    /// An expression template referenced a path that does not resolve.
    TemplateResolution { expression: String },
}

impl fmt::Display for SquadronError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SquadronError::DefinitionInvalid { pipeline, reason } => {
                write!(f, "pipeline definition {pipeline:?} invalid: {reason}")
            }
            SquadronError::GateTimeout { stage_id } => {
                write!(f, "gate stage {stage_id:?} timed out")
            }
            SquadronError::WorkerTimeout { agent_id } => {
                write!(f, "worker for agent {agent_id:?} timed out")
            }
            SquadronError::CircuitBreakerTripped { agent_id, limit } => {
                write!(f, "agent {agent_id:?} tripped circuit breaker: {limit}")
            }
            SquadronError::ForgeUnavailable { operation, source } => {
                write!(f, "forge call {operation:?} failed: {source}")
            }
            SquadronError::NotFound { kind, id } => {
                write!(f, "{kind} {id:?} not found")
            }
            SquadronError::TemplateResolution { expression } => {
                write!(f, "could not resolve expression {expression:?}")
            }
        }
    }
}

impl std::error::Error for SquadronError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_identifying_fields() {
        let e = SquadronError::NotFound {
            kind: "pipeline_run",
            id: "abc123".to_string(),
        };
        assert!(e.to_string().contains("abc123"));
        assert!(e.to_string().contains("pipeline_run"));
    }
}
