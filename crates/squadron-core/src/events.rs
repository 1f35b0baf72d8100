//! Event Router: normalizes inbound forge webhooks into `NormalizedEvent`,
//! deduplicates by delivery id, filters the bot's own actions back out of
//! its inbox, and dispatches to whichever pipeline definitions declared a
//! matching trigger — or to an already-running run's `on_events` table
//! when the event references something that run owns.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::db::Db;
use crate::definitions::DefinitionSet;
use crate::types::{NormalizedEvent, ReactiveDirective};

pub struct EventRouter {
    db: Arc<Db>,
    definitions: Arc<DefinitionSet>,
    bot_identity: String,
}

#[derive(Debug)]
pub enum RouteDecision {
    /// Event was a duplicate delivery; already handled.
    Duplicate,
    /// Event originated from the bot's own identity; ignored to avoid
    /// feedback loops.
    SelfEvent,
    /// No pipeline declared a trigger for this event type.
    Unhandled,
    /// Start a fresh run of the named pipeline.
    StartPipeline { pipeline_name: String },
    /// Feed a reactive directive to an already-running run.
    Reactive { run_id: String, directive: ReactiveDirective },
}

impl EventRouter {
    pub fn new(db: Arc<Db>, definitions: Arc<DefinitionSet>, bot_identity: String) -> Self {
        Self {
            db,
            definitions,
            bot_identity,
        }
    }

    pub fn route(&self, event: &NormalizedEvent) -> Result<Vec<RouteDecision>> {
        if event.sender == self.bot_identity {
            return Ok(vec![RouteDecision::SelfEvent]);
        }
        if !self.db.mark_delivery_processed(&event.delivery_id)? {
            return Ok(vec![RouteDecision::Duplicate]);
        }

        let mut decisions = self.dispatch(event)?;

        // A comment mentioning the bot with a role (`@bot role: do the
        // thing`) is a command in disguise: synthesize a `command` event
        // and route it through the same trigger/reactive matching so
        // pipelines can declare a trigger or on_events entry for it
        // without the router special-casing comment bodies everywhere.
        if let Some(body) = event.payload.get("body").and_then(Value::as_str) {
            if let Some((role, args)) = self.parse_command_mention(body) {
                let synthetic = NormalizedEvent {
                    event_type: "command".to_string(),
                    delivery_id: format!("{}#command", event.delivery_id),
                    sender: event.sender.clone(),
                    repository: event.repository.clone(),
                    payload: serde_json::json!({
                        "role": role,
                        "command": args,
                        "pr_number": event.pr_number(),
                        "issue_number": event.issue_number(),
                    }),
                };
                decisions.extend(self.dispatch(&synthetic)?);
            }
        }

        if decisions.is_empty() {
            decisions.push(RouteDecision::Unhandled);
        }
        Ok(decisions)
    }

    /// Trigger/reactive matching shared by a real event and a synthetic
    /// `command` event derived from it. Assumes dedup/self-event filtering
    /// already happened on the caller's side.
    fn dispatch(&self, event: &NormalizedEvent) -> Result<Vec<RouteDecision>> {
        let mut decisions = Vec::new();

        if let Some(pr) = event.pr_number() {
            for run in self.db.list_active_runs()? {
                if run.primary_pr_number != Some(pr) {
                    continue;
                }
                if let Some(directive) = run.definition_snapshot.on_events.get(&event.event_type) {
                    decisions.push(RouteDecision::Reactive {
                        run_id: run.run_id.clone(),
                        directive: directive.clone(),
                    });
                }
            }
        }

        for def in self.definitions.triggered_by(&event.event_type) {
            if trigger_condition_matches(def, event) {
                decisions.push(RouteDecision::StartPipeline {
                    pipeline_name: def.name.clone(),
                });
            }
        }

        Ok(decisions)
    }

    /// Parses an `@bot command args` mention out of a comment body, used
    /// by command-triggered human-stage resolution.
    pub fn parse_command_mention<'a>(&self, body: &'a str) -> Option<(&'a str, &'a str)> {
        let mention = format!("@{}", self.bot_identity);
        let idx = body.find(&mention)?;
        let rest = body[idx + mention.len()..].trim_start();
        let mut parts = rest.splitn(2, char::is_whitespace);
        let command = parts.next()?;
        if command.is_empty() {
            return None;
        }
        let args = parts.next().unwrap_or("").trim();
        Some((command, args))
    }
}

fn trigger_condition_matches(def: &crate::types::PipelineDefinition, event: &NormalizedEvent) -> bool {
    let Some(trigger) = &def.trigger else { return false };
    if let Some(label) = &trigger.condition.label {
        let has_label = event
            .payload
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| labels.iter().any(|l| l.as_str() == Some(label.as_str())))
            .unwrap_or(false);
        if !has_label {
            return false;
        }
    }
    if let Some(base_branch) = &trigger.condition.base_branch {
        let matches_base = event
            .payload
            .get("base_branch")
            .and_then(Value::as_str)
            .map(|b| b == base_branch)
            .unwrap_or(false);
        if !matches_base {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn router_with_def(def: crate::types::PipelineDefinition) -> EventRouter {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let mut set = DefinitionSet::default();
        set.by_name.insert(def.name.clone(), def);
        EventRouter::new(db, Arc::new(set), "squadron-bot".to_string())
    }

    fn pr_opened_def() -> crate::types::PipelineDefinition {
        use crate::types::{Trigger, TriggerCondition};
        crate::types::PipelineDefinition {
            name: "review".to_string(),
            description: String::new(),
            scope: crate::types::PipelineScope::SinglePr,
            trigger: Some(Trigger {
                event: "pull_request.opened".to_string(),
                condition: TriggerCondition::default(),
            }),
            on_events: HashMap::new(),
            stages: vec![],
            on_complete: Default::default(),
            on_error: Default::default(),
        }
    }

    #[test]
    fn duplicate_delivery_is_suppressed() {
        let router = router_with_def(pr_opened_def());
        let event = NormalizedEvent {
            event_type: "pull_request.opened".to_string(),
            delivery_id: "d1".to_string(),
            sender: "alice".to_string(),
            repository: "acme/widgets".to_string(),
            payload: serde_json::json!({}),
        };
        let first = router.route(&event).unwrap();
        assert!(matches!(first[0], RouteDecision::StartPipeline { .. }));
        let second = router.route(&event).unwrap();
        assert!(matches!(second[0], RouteDecision::Duplicate));
    }

    #[test]
    fn self_events_are_filtered() {
        let router = router_with_def(pr_opened_def());
        let event = NormalizedEvent {
            event_type: "pull_request.opened".to_string(),
            delivery_id: "d2".to_string(),
            sender: "squadron-bot".to_string(),
            repository: "acme/widgets".to_string(),
            payload: serde_json::json!({}),
        };
        let decisions = router.route(&event).unwrap();
        assert!(matches!(decisions[0], RouteDecision::SelfEvent));
    }

    #[test]
    fn command_mention_parses_command_and_args() {
        let router = router_with_def(pr_opened_def());
        let parsed = router.parse_command_mention("hey @squadron-bot retry stage=qa");
        assert_eq!(parsed, Some(("retry", "stage=qa")));
    }

    #[test]
    fn comment_mentioning_bot_emits_synthetic_command_event() {
        use crate::types::{Trigger, TriggerCondition};
        let mut def = pr_opened_def();
        def.name = "retry-on-command".to_string();
        def.trigger = Some(Trigger {
            event: "command".to_string(),
            condition: TriggerCondition::default(),
        });
        let router = router_with_def(def);
        let event = NormalizedEvent {
            event_type: "issue_comment.created".to_string(),
            delivery_id: "d4".to_string(),
            sender: "alice".to_string(),
            repository: "acme/widgets".to_string(),
            payload: serde_json::json!({"body": "@squadron-bot retry stage=qa", "pr_number": 7}),
        };
        let decisions = router.route(&event).unwrap();
        assert!(decisions.iter().any(|d| matches!(d, RouteDecision::StartPipeline { pipeline_name } if pipeline_name == "retry-on-command")));
    }

    #[test]
    fn label_condition_filters_trigger() {
        use crate::types::{Trigger, TriggerCondition};
        let mut def = pr_opened_def();
        def.trigger = Some(Trigger {
            event: "pull_request.opened".to_string(),
            condition: TriggerCondition {
                label: Some("ready".to_string()),
                base_branch: None,
            },
        });
        let router = router_with_def(def);
        let event = NormalizedEvent {
            event_type: "pull_request.opened".to_string(),
            delivery_id: "d3".to_string(),
            sender: "alice".to_string(),
            repository: "acme/widgets".to_string(),
            payload: serde_json::json!({"labels": ["other"]}),
        };
        let decisions = router.route(&event).unwrap();
        assert!(matches!(decisions[0], RouteDecision::Unhandled));
    }
}
