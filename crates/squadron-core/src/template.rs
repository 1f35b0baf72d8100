//! Narrow `{{ expression }}` evaluator for stage configuration fields.
//!
//! Supports dotted-path lookups into the run context (`trigger.*`,
//! `stages.<id>.outputs.*`, `branches.<id>.outputs.*`), a short filter
//! chain (`| str`, `| int`, `| default(x)`), and `==`/`!=` comparisons.
//! A field that is a single `{{ ... }}` expression preserves the
//! underlying JSON type; anything else is treated as a string template
//! with embedded substitutions.

use std::collections::HashMap;

use serde_json::Value;

pub struct TemplateContext<'a> {
    pub context: &'a HashMap<String, Value>,
    pub trigger: &'a Value,
    pub stage_outputs: &'a HashMap<String, HashMap<String, Value>>,
    pub branch_outputs: &'a HashMap<String, HashMap<String, Value>>,
}

/// Render a config field. A whole-string single expression (e.g.
/// `"{{ stages.build.outputs.artifact }}"`) returns the resolved JSON value
/// directly, type preserved. Anything with surrounding text is rendered as
/// a string with each `{{ ... }}` replaced by its stringified value.
pub fn render(field: &str, ctx: &TemplateContext) -> anyhow::Result<Value> {
    if let Some(expr) = whole_expression(field) {
        return eval_expression(expr, ctx);
    }

    let mut out = String::new();
    let mut rest = field;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| anyhow::anyhow!("unterminated expression in template: {field:?}"))?;
        let expr = after[..end].trim();
        let value = eval_expression(expr, ctx)?;
        out.push_str(&value_to_string(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn whole_expression(field: &str) -> Option<&str> {
    let trimmed = field.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") {
        return None;
    }
    Some(inner.trim())
}

fn eval_expression(expr: &str, ctx: &TemplateContext) -> anyhow::Result<Value> {
    if let Some((left, right)) = split_once_op(expr, "==") {
        let lv = eval_pipeline(left.trim(), ctx)?;
        let rv = eval_literal_or_pipeline(right.trim(), ctx)?;
        return Ok(Value::Bool(lv == rv));
    }
    if let Some((left, right)) = split_once_op(expr, "!=") {
        let lv = eval_pipeline(left.trim(), ctx)?;
        let rv = eval_literal_or_pipeline(right.trim(), ctx)?;
        return Ok(Value::Bool(lv != rv));
    }
    eval_pipeline(expr, ctx)
}

fn split_once_op<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expr.find(op).map(|i| (&expr[..i], &expr[i + op.len()..]))
}

fn eval_literal_or_pipeline(token: &str, ctx: &TemplateContext) -> anyhow::Result<Value> {
    let token = token.trim();
    if let Some(s) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Ok(Value::String(s.to_string()));
    }
    if let Some(s) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Ok(Value::String(s.to_string()));
    }
    if let Ok(n) = token.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    if token == "true" || token == "false" {
        return Ok(Value::Bool(token == "true"));
    }
    eval_pipeline(token, ctx)
}

/// `path | filter1 | filter2(arg)`
fn eval_pipeline(expr: &str, ctx: &TemplateContext) -> anyhow::Result<Value> {
    let mut parts = expr.split('|').map(str::trim);
    let path = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty expression"))?;
    let mut value = resolve_path(path, ctx)
        .ok_or_else(|| anyhow::anyhow!("could not resolve expression {path:?}"))?;
    for filter in parts {
        value = apply_filter(filter, value)?;
    }
    Ok(value)
}

fn resolve_path(path: &str, ctx: &TemplateContext) -> Option<Value> {
    let mut segs = path.split('.');
    let root = segs.next()?;
    let mut cursor = match root {
        "trigger" => ctx.trigger.clone(),
        "context" => Value::Object(ctx.context.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        "stages" => {
            let stage_id = segs.next()?;
            let outputs_key = segs.next()?;
            if outputs_key != "outputs" {
                return None;
            }
            let field = segs.next()?;
            return ctx.stage_outputs.get(stage_id)?.get(field).cloned();
        }
        "branches" => {
            let branch_id = segs.next()?;
            let outputs_key = segs.next()?;
            if outputs_key != "outputs" {
                return None;
            }
            let field = segs.next()?;
            return ctx.branch_outputs.get(branch_id)?.get(field).cloned();
        }
        other => ctx.context.get(other)?.clone(),
    };
    for seg in segs {
        cursor = match cursor {
            Value::Object(mut map) => map.remove(seg)?,
            _ => return None,
        };
    }
    Some(cursor)
}

fn apply_filter(filter: &str, value: Value) -> anyhow::Result<Value> {
    let filter = filter.trim();
    if filter == "str" {
        return Ok(Value::String(value_to_string(&value)));
    }
    if filter == "int" {
        return match &value {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .map_err(|_| anyhow::anyhow!("cannot convert {s:?} to int")),
            other => anyhow::bail!("cannot convert {other:?} to int"),
        };
    }
    if let Some(arg) = filter.strip_prefix("default(").and_then(|s| s.strip_suffix(')')) {
        if value.is_null() {
            return eval_literal_from_raw(arg);
        }
        return Ok(value);
    }
    anyhow::bail!("unknown filter: {filter}")
}

fn eval_literal_from_raw(raw: &str) -> anyhow::Result<Value> {
    let raw = raw.trim();
    if let Some(s) = raw.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Ok(Value::String(s.to_string()));
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    Ok(Value::String(raw.to_string()))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn empty_ctx<'a>(
        context: &'a HashMap<String, Value>,
        trigger: &'a Value,
        stage_outputs: &'a HashMap<String, HashMap<String, Value>>,
        branch_outputs: &'a HashMap<String, HashMap<String, Value>>,
    ) -> TemplateContext<'a> {
        TemplateContext {
            context,
            trigger,
            stage_outputs,
            branch_outputs,
        }
    }

    #[test]
    fn whole_expression_preserves_type() {
        let context = HashMap::new();
        let trigger = json!({"pr_number": 42});
        let stage_outputs = HashMap::new();
        let branch_outputs = HashMap::new();
        let ctx = empty_ctx(&context, &trigger, &stage_outputs, &branch_outputs);

        let rendered = render("{{ trigger.pr_number }}", &ctx).unwrap();
        assert_eq!(rendered, json!(42));
    }

    #[test]
    fn stage_output_lookup() {
        let context = HashMap::new();
        let trigger = json!({});
        let mut stage_outputs = HashMap::new();
        stage_outputs.insert(
            "build".to_string(),
            HashMap::from([("artifact".to_string(), json!("build.tar.gz"))]),
        );
        let branch_outputs = HashMap::new();
        let ctx = empty_ctx(&context, &trigger, &stage_outputs, &branch_outputs);

        let rendered = render("{{ stages.build.outputs.artifact }}", &ctx).unwrap();
        assert_eq!(rendered, json!("build.tar.gz"));
    }

    #[test]
    fn default_filter_substitutes_on_null() {
        let context = HashMap::new();
        let trigger = json!({"label": null});
        let stage_outputs = HashMap::new();
        let branch_outputs = HashMap::new();
        let ctx = empty_ctx(&context, &trigger, &stage_outputs, &branch_outputs);

        let rendered = render("{{ trigger.label | default(\"none\") }}", &ctx).unwrap();
        assert_eq!(rendered, json!("none"));
    }

    #[test]
    fn string_template_embeds_multiple_substitutions() {
        let context = HashMap::new();
        let trigger = json!({"pr_number": 7, "repo": "acme/widgets"});
        let stage_outputs = HashMap::new();
        let branch_outputs = HashMap::new();
        let ctx = empty_ctx(&context, &trigger, &stage_outputs, &branch_outputs);

        let rendered = render("PR #{{ trigger.pr_number }} on {{ trigger.repo }}", &ctx).unwrap();
        assert_eq!(rendered, json!("PR #7 on acme/widgets"));
    }

    #[test]
    fn equality_comparison() {
        let context = HashMap::new();
        let trigger = json!({"label": "ready-for-review"});
        let stage_outputs = HashMap::new();
        let branch_outputs = HashMap::new();
        let ctx = empty_ctx(&context, &trigger, &stage_outputs, &branch_outputs);

        let rendered = render("{{ trigger.label == \"ready-for-review\" }}", &ctx).unwrap();
        assert_eq!(rendered, json!(true));
    }

    #[test]
    fn unresolved_path_is_an_error() {
        let context = HashMap::new();
        let trigger = json!({});
        let stage_outputs = HashMap::new();
        let branch_outputs = HashMap::new();
        let ctx = empty_ctx(&context, &trigger, &stage_outputs, &branch_outputs);

        assert!(render("{{ stages.missing.outputs.x }}", &ctx).is_err());
    }
}
