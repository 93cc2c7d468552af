//! Resolución de templates sobre un árbol JSON, pura y sin efectos.
//!
//! Sintaxis soportada en los `params` de un step:
//! - `{{inputs}}` / `{{inputs.a.b}}`: inputs del run.
//! - `{{steps.<id>.outputs}}` / `{{steps.<id>.outputs.x}}`: outputs de un
//!   step previo, por id lógico del blueprint.
//!
//! Un string que es exactamente una expresión se sustituye por el valor
//! referenciado (de cualquier tipo). Expresiones embebidas en un string
//! mayor interpolan sólo escalares. Todo fallo es
//! `template_resolution_error` y ocurre antes de invocar el handler.

use serde_json::Value;
use std::collections::HashMap;

use crate::errors::CoreError;

pub struct TemplateContext<'a> {
    pub inputs: &'a Value,
    /// Outputs de steps ya completados, por id lógico.
    pub steps: &'a HashMap<String, Value>,
}

/// Resuelve recursivamente todas las expresiones del árbol `template`.
pub fn resolve(template: &Value, ctx: &TemplateContext) -> Result<Value, CoreError> {
    match template {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>, CoreError> = items.iter().map(|v| resolve(v, ctx)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, ctx: &TemplateContext) -> Result<Value, CoreError> {
    let trimmed = s.trim();
    // Caso sustitución completa: "{{expr}}" exacto conserva el tipo.
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
        let expr = trimmed[2..trimmed.len() - 2].trim();
        return lookup(expr, ctx).cloned();
    }
    if !s.contains("{{") {
        return Ok(Value::String(s.to_string()));
    }
    // Interpolación: cada expresión embebida debe resolver a escalar.
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}")
                         .ok_or_else(|| CoreError::Template(format!("expresión sin cerrar en {s:?}")))?;
        let expr = after[..close].trim();
        let value = lookup(expr, ctx)?;
        match value {
            Value::String(v) => out.push_str(v),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            other => {
                return Err(CoreError::Template(format!("no se puede interpolar un valor no escalar ({}) en {s:?}",
                                                       type_name(other))));
            }
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn lookup<'a>(expr: &str, ctx: &TemplateContext<'a>) -> Result<&'a Value, CoreError> {
    let mut segments = expr.split('.');
    let root = segments.next().unwrap_or("");
    match root {
        "inputs" => walk(ctx.inputs, segments, expr),
        "steps" => {
            let step_id = segments.next()
                                  .ok_or_else(|| CoreError::Template(format!("falta id de step en {expr:?}")))?;
            let outputs_kw = segments.next();
            if outputs_kw != Some("outputs") {
                return Err(CoreError::Template(format!("sólo se referencian outputs de steps: {expr:?}")));
            }
            let outputs = ctx.steps
                             .get(step_id)
                             .ok_or_else(|| CoreError::Template(format!("step desconocido o sin completar: {step_id:?}")))?;
            walk(outputs, segments, expr)
        }
        other => Err(CoreError::Template(format!("raíz desconocida {other:?} (se espera inputs|steps)"))),
    }
}

fn walk<'a, 'e, I>(mut current: &'a Value, segments: I, expr: &str) -> Result<&'a Value, CoreError>
    where I: Iterator<Item = &'e str>
{
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }.ok_or_else(|| CoreError::Template(format!("ruta inexistente {seg:?} en {expr:?}")))?;
    }
    Ok(current)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with<'a>(inputs: &'a Value, steps: &'a HashMap<String, Value>) -> TemplateContext<'a> {
        TemplateContext { inputs, steps }
    }

    #[test]
    fn full_substitution_keeps_type() {
        let inputs = json!({"count": 3, "nested": {"flag": true}});
        let steps = HashMap::new();
        let ctx = ctx_with(&inputs, &steps);
        assert_eq!(resolve(&json!("{{inputs.count}}"), &ctx).unwrap(), json!(3));
        assert_eq!(resolve(&json!("{{inputs.nested}}"), &ctx).unwrap(), json!({"flag": true}));
        assert_eq!(resolve(&json!("{{inputs}}"), &ctx).unwrap(), inputs);
    }

    #[test]
    fn interpolation_renders_scalars() {
        let inputs = json!({"name": "s1", "n": 2});
        let steps = HashMap::new();
        let ctx = ctx_with(&inputs, &steps);
        let v = resolve(&json!("run {{inputs.name}} intento {{inputs.n}}"), &ctx).unwrap();
        assert_eq!(v, json!("run s1 intento 2"));
    }

    #[test]
    fn step_outputs_resolve_by_logical_id() {
        let inputs = json!({});
        let mut steps = HashMap::new();
        steps.insert("fetch".to_string(), json!({"rows": [1, 2, 3]}));
        let ctx = ctx_with(&inputs, &steps);
        assert_eq!(resolve(&json!("{{steps.fetch.outputs.rows.1}}"), &ctx).unwrap(), json!(2));
    }

    #[test]
    fn errors_are_typed_template_failures() {
        let inputs = json!({"obj": {}});
        let steps = HashMap::new();
        let ctx = ctx_with(&inputs, &steps);
        for tpl in ["{{unknown.x}}", "{{inputs.missing}}", "{{steps.a.outputs}}", "prefix {{inputs.obj}}", "{{inputs.x"] {
            let err = resolve(&json!(tpl), &ctx).unwrap_err();
            assert!(matches!(err, CoreError::Template(_)), "tpl={tpl}");
        }
    }

    #[test]
    fn nested_trees_resolve_recursively() {
        let inputs = json!({"x": "a"});
        let mut steps = HashMap::new();
        steps.insert("s".to_string(), json!({"y": 9}));
        let ctx = ctx_with(&inputs, &steps);
        let tpl = json!({"a": ["{{inputs.x}}", {"b": "{{steps.s.outputs.y}}"}], "c": 1});
        assert_eq!(resolve(&tpl, &ctx).unwrap(), json!({"a": ["a", {"b": 9}], "c": 1}));
    }
}
