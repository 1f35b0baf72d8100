//! Loads pipeline definitions from a directory of YAML files and validates
//! them as a set before the server accepts any traffic. Validation failure
//! is fatal: a malformed definitions directory must never come up partially
//! serving.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};

use crate::types::{PipelineDefinition, StageKind, RESERVED_TERMINALS, MAX_NESTING_DEPTH};

#[derive(Debug, Default)]
pub struct DefinitionSet {
    pub by_name: HashMap<String, PipelineDefinition>,
}

impl DefinitionSet {
    pub fn get(&self, name: &str) -> Option<&PipelineDefinition> {
        self.by_name.get(name)
    }

    pub fn triggered_by(&self, event: &str) -> Vec<&PipelineDefinition> {
        self.by_name
            .values()
            .filter(|d| {
                d.trigger
                    .as_ref()
                    .map(|t| t.event == event)
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Load every `*.yml`/`*.yaml` file under `dir`, parse each as a
/// `PipelineDefinition`, and validate the whole set. Returns the first
/// error encountered with enough context to act on (file path + reason).
pub fn load_and_validate(dir: &Path) -> Result<DefinitionSet> {
    let mut set = DefinitionSet::default();
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading pipeline definitions dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            )
        })
        .collect();
    entries.sort();

    for path in entries {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let def: PipelineDefinition = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing pipeline definition {}", path.display()))?;
        if set.by_name.contains_key(&def.name) {
            anyhow::bail!(
                "duplicate pipeline name {:?} ({} and a prior file)",
                def.name,
                path.display()
            );
        }
        set.by_name.insert(def.name.clone(), def);
    }

    validate_set(&set)?;
    Ok(set)
}

fn validate_set(set: &DefinitionSet) -> Result<()> {
    for def in set.by_name.values() {
        validate_stage_ids(def)?;
        validate_transitions(def)?;
    }
    validate_sub_pipeline_acyclic(set)?;
    Ok(())
}

fn validate_stage_ids(def: &PipelineDefinition) -> Result<()> {
    let mut seen = HashSet::new();
    for stage in &def.stages {
        if !seen.insert(stage.id.as_str()) {
            anyhow::bail!(
                "pipeline {:?}: duplicate stage id {:?}",
                def.name,
                stage.id
            );
        }
        if let StageKind::Parallel(p) = &stage.kind {
            let mut branch_ids = HashSet::new();
            for branch in &p.branches {
                if !branch_ids.insert(branch.id.as_str()) {
                    anyhow::bail!(
                        "pipeline {:?}: duplicate branch id {:?} in stage {:?}",
                        def.name,
                        branch.id,
                        stage.id
                    );
                }
            }
        }
    }
    Ok(())
}

fn validate_transitions(def: &PipelineDefinition) -> Result<()> {
    let stage_ids: HashSet<&str> = def.stages.iter().map(|s| s.id.as_str()).collect();
    let is_valid_target = |target: &str| -> bool {
        RESERVED_TERMINALS.contains(&target) || stage_ids.contains(target)
    };

    for stage in &def.stages {
        for target in stage_targets(&stage.kind) {
            let primary = target.primary_target();
            if !is_valid_target(primary) {
                anyhow::bail!(
                    "pipeline {:?}: stage {:?} transitions to unknown target {:?}",
                    def.name,
                    stage.id,
                    primary
                );
            }
            if let crate::types::TransitionTarget::Loop {
                exhausted_then: Some(then),
                ..
            } = target
            {
                if !is_valid_target(then) {
                    anyhow::bail!(
                        "pipeline {:?}: stage {:?} loop-exhaustion target {:?} unknown",
                        def.name,
                        stage.id,
                        then
                    );
                }
            }
        }
    }
    Ok(())
}

fn stage_targets(kind: &StageKind) -> Vec<&crate::types::TransitionTarget> {
    match kind {
        StageKind::Agent(c) => c
            .on_complete
            .iter()
            .chain(c.on_error.iter())
            .collect(),
        StageKind::Gate(c) => std::iter::once(&c.on_pass)
            .chain(c.on_fail.iter())
            .chain(c.on_timeout.iter())
            .collect(),
        StageKind::Human(c) => std::iter::once(&c.on_complete)
            .chain(c.on_timeout.iter())
            .collect(),
        StageKind::Parallel(c) => std::iter::once(&c.on_complete)
            .chain(c.on_any_reject.iter())
            .collect(),
        StageKind::Delay(c) => vec![&c.on_complete],
        StageKind::Action(c) => std::iter::once(&c.on_complete)
            .chain(c.on_conflict.iter())
            .chain(c.on_ci_failure.iter())
            .collect(),
        StageKind::Webhook(c) => std::iter::once(&c.on_complete)
            .chain(c.on_error.iter())
            .collect(),
        StageKind::Pipeline(c) => std::iter::once(&c.on_complete)
            .chain(c.on_error.iter())
            .collect(),
    }
}

/// Sub-pipelines (no `trigger`) can only be reached via a `pipeline` stage.
/// Build the reference graph among them and reject cycles and chains deeper
/// than `MAX_NESTING_DEPTH` via DFS.
fn validate_sub_pipeline_acyclic(set: &DefinitionSet) -> Result<()> {
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for def in set.by_name.values() {
        let mut callees = Vec::new();
        for stage in &def.stages {
            collect_pipeline_refs(&stage.kind, &mut callees);
        }
        graph.insert(def.name.as_str(), callees);
    }

    for root in graph.keys() {
        let mut stack = vec![*root];
        let mut visiting = HashSet::new();
        if let Some(depth) = dfs_depth(root, &graph, &mut visiting, &mut stack)? {
            if depth > MAX_NESTING_DEPTH {
                anyhow::bail!(
                    "pipeline {:?}: sub-pipeline nesting depth {} exceeds max {}",
                    root,
                    depth,
                    MAX_NESTING_DEPTH
                );
            }
        }
    }
    Ok(())
}

fn dfs_depth<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visiting: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> Result<Option<u32>> {
    if !visiting.insert(node) {
        anyhow::bail!(
            "sub-pipeline cycle detected: {}",
            stack
                .iter()
                .chain(std::iter::once(&node))
                .cloned()
                .collect::<Vec<_>>()
                .join(" -> ")
        );
    }
    let mut max_child_depth = 0u32;
    if let Some(children) = graph.get(node) {
        for child in children {
            stack.push(child);
            if let Some(d) = dfs_depth(child, graph, visiting, stack)? {
                max_child_depth = max_child_depth.max(d);
            }
            stack.pop();
        }
    }
    visiting.remove(node);
    Ok(Some(max_child_depth + 1))
}

fn collect_pipeline_refs<'a>(kind: &'a StageKind, out: &mut Vec<&'a str>) {
    match kind {
        StageKind::Pipeline(c) => out.push(c.pipeline.as_str()),
        StageKind::Parallel(c) => {
            for branch in &c.branches {
                collect_pipeline_refs(&branch.stage, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PipelineScope, Stage, StageKind, Trigger, TriggerCondition};

    fn minimal_def(name: &str, trigger: bool) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            description: String::new(),
            scope: PipelineScope::SinglePr,
            trigger: if trigger {
                Some(Trigger {
                    event: "pull_request.opened".to_string(),
                    condition: TriggerCondition::default(),
                })
            } else {
                None
            },
            on_events: HashMap::new(),
            stages: vec![],
            on_complete: Default::default(),
            on_error: Default::default(),
        }
    }

    #[test]
    fn duplicate_stage_ids_rejected() {
        use crate::types::{AgentStageConfig, TransitionTarget};
        let mut def = minimal_def("p1", true);
        def.stages = vec![
            Stage {
                id: "a".into(),
                kind: StageKind::Agent(AgentStageConfig {
                    role: "dev".into(),
                    action: "build".into(),
                    continue_session: false,
                    expected_outputs: vec![],
                    on_complete: Some(TransitionTarget::Simple("complete".into())),
                    on_error: None,
                }),
            },
            Stage {
                id: "a".into(),
                kind: StageKind::Agent(AgentStageConfig {
                    role: "dev".into(),
                    action: "build".into(),
                    continue_session: false,
                    expected_outputs: vec![],
                    on_complete: Some(TransitionTarget::Simple("complete".into())),
                    on_error: None,
                }),
            },
        ];
        assert!(validate_stage_ids(&def).is_err());
    }

    #[test]
    fn dangling_transition_rejected() {
        use crate::types::{AgentStageConfig, TransitionTarget};
        let mut def = minimal_def("p1", true);
        def.stages = vec![Stage {
            id: "a".into(),
            kind: StageKind::Agent(AgentStageConfig {
                role: "dev".into(),
                action: "build".into(),
                continue_session: false,
                expected_outputs: vec![],
                on_complete: Some(TransitionTarget::Simple("nonexistent".into())),
                on_error: None,
            }),
        }];
        assert!(validate_transitions(&def).is_err());
    }

    #[test]
    fn reserved_terminal_is_valid_target() {
        use crate::types::{AgentStageConfig, TransitionTarget};
        let mut def = minimal_def("p1", true);
        def.stages = vec![Stage {
            id: "a".into(),
            kind: StageKind::Agent(AgentStageConfig {
                role: "dev".into(),
                action: "build".into(),
                continue_session: false,
                expected_outputs: vec![],
                on_complete: Some(TransitionTarget::Simple("complete".into())),
                on_error: None,
            }),
        }];
        assert!(validate_transitions(&def).is_ok());
    }

    #[test]
    fn sub_pipeline_cycle_detected() {
        use crate::types::{PipelineStageConfig, TransitionTarget};
        let mut a = minimal_def("a", false);
        a.stages = vec![Stage {
            id: "call_b".into(),
            kind: StageKind::Pipeline(PipelineStageConfig {
                pipeline: "b".into(),
                context: HashMap::new(),
                on_complete: TransitionTarget::Simple("complete".into()),
                on_error: None,
            }),
        }];
        let mut b = minimal_def("b", false);
        b.stages = vec![Stage {
            id: "call_a".into(),
            kind: StageKind::Pipeline(PipelineStageConfig {
                pipeline: "a".into(),
                context: HashMap::new(),
                on_complete: TransitionTarget::Simple("complete".into()),
                on_error: None,
            }),
        }];
        let mut set = DefinitionSet::default();
        set.by_name.insert("a".into(), a);
        set.by_name.insert("b".into(), b);

        assert!(validate_sub_pipeline_acyclic(&set).is_err());
    }
}
