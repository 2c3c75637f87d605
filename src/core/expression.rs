//! `<+...>` expression resolution over arbitrary config object graphs
//!
//! An [`ExpressionContext`] maps expression prefixes (`env`, `artifact`,
//! `secrets`, `pipeline.variables`, ...) to either a literal JSON document or
//! an [`ExpressionFunctor`]. Lookup uses the longest registered prefix, and the
//! remainder of the expression is handed to the functor or walked inside the
//! literal.

use crate::core::error::ExpressionError;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Resolves the remainder of an expression below a registered prefix
pub trait ExpressionFunctor: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Value>;
}

#[derive(Clone)]
enum ContextEntry {
    Literal(Value),
    Functor(Arc<dyn ExpressionFunctor>),
}

/// Named resolvers available to one resolution pass
#[derive(Clone, Default)]
pub struct ExpressionContext {
    entries: BTreeMap<String, ContextEntry>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_literal(mut self, prefix: impl Into<String>, value: Value) -> Self {
        self.entries.insert(prefix.into(), ContextEntry::Literal(value));
        self
    }

    pub fn with_functor(mut self, prefix: impl Into<String>, functor: Arc<dyn ExpressionFunctor>) -> Self {
        self.entries.insert(prefix.into(), ContextEntry::Functor(functor));
        self
    }

    /// Resolve a bare expression body such as `env.name`
    pub fn lookup(&self, expression: &str) -> Option<Value> {
        let expression = expression.trim();
        let segments: Vec<&str> = expression.split('.').collect();
        for split in (1..=segments.len()).rev() {
            let prefix = segments[..split].join(".");
            let Some(entry) = self.entries.get(&prefix) else { continue };
            let rest = segments[split..].join(".");
            return match entry {
                ContextEntry::Literal(value) => walk(value, &segments[split..]).cloned(),
                ContextEntry::Functor(functor) => functor.resolve(&rest),
            };
        }
        None
    }
}

fn walk<'v>(value: &'v Value, segments: &[&str]) -> Option<&'v Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Rewrites expressions embedded in strings of a JSON object graph
pub struct ExpressionResolver {
    pattern: Regex,
}

impl ExpressionResolver {
    pub fn new() -> Result<Self, ExpressionError> {
        Ok(Self {
            pattern: Regex::new(r"<\+([^<>]+)>")?,
        })
    }

    /// Resolve every expression in `value` in place. Returns the expressions
    /// that could not be resolved; those are left untouched.
    pub fn update_expressions(&self, context: &ExpressionContext, value: &mut Value) -> Vec<String> {
        let mut unresolved = Vec::new();
        self.update_value(context, value, &mut unresolved);
        unresolved
    }

    fn update_value(&self, context: &ExpressionContext, value: &mut Value, unresolved: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                if let Some(resolved) = self.resolve_string(context, s, unresolved) {
                    *value = resolved;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.update_value(context, item, unresolved);
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.update_value(context, item, unresolved);
                }
            }
            _ => {}
        }
    }

    /// A string that is exactly one expression takes the resolved value's
    /// type. Otherwise each expression is substituted textually.
    fn resolve_string(&self, context: &ExpressionContext, s: &str, unresolved: &mut Vec<String>) -> Option<Value> {
        if !s.contains("<+") {
            return None;
        }

        if let Some(caps) = self.pattern.captures(s) {
            let whole = caps.get(0)?;
            if whole.start() == 0 && whole.end() == s.len() {
                let body = caps.get(1)?.as_str();
                return match context.lookup(body) {
                    Some(resolved) => Some(resolved),
                    None => {
                        unresolved.push(whole.as_str().to_string());
                        None
                    }
                };
            }
        }

        let mut changed = false;
        let replaced = self.pattern.replace_all(s, |caps: &regex::Captures| {
            match context.lookup(&caps[1]) {
                Some(Value::String(text)) => {
                    changed = true;
                    text
                }
                Some(Value::Null) | None => {
                    unresolved.push(caps[0].to_string());
                    caps[0].to_string()
                }
                Some(other) => {
                    changed = true;
                    other.to_string()
                }
            }
        });
        changed.then(|| Value::String(replaced.into_owned()))
    }

    /// Resolve expressions inside a typed config object
    pub fn render<T>(&self, context: &ExpressionContext, object: &T) -> Result<(T, Vec<String>), ExpressionError>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut value = serde_json::to_value(object)?;
        let unresolved = self.update_expressions(context, &mut value);
        Ok((serde_json::from_value(value)?, unresolved))
    }

    /// Like [`render`](Self::render), but any unresolved expression is an error
    pub fn render_strict<T>(&self, context: &ExpressionContext, object: &T) -> Result<T, ExpressionError>
    where
        T: Serialize + DeserializeOwned,
    {
        let (rendered, unresolved) = self.render(context, object)?;
        if unresolved.is_empty() {
            Ok(rendered)
        } else {
            Err(ExpressionError::Unresolved(unresolved))
        }
    }
}

/// Resolves `<+pipeline.variables.x>` style lookups against a variable map
pub struct VariablesFunctor {
    variables: HashMap<String, Value>,
}

impl VariablesFunctor {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self { variables }
    }
}

impl ExpressionFunctor for VariablesFunctor {
    fn resolve(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let name = segments.next()?;
        let rest: Vec<&str> = segments.collect();
        walk(self.variables.get(name)?, &rest).cloned()
    }
}

/// Resolves `<+secrets.getValue("name")>` to the registered secret reference
pub struct SecretsFunctor {
    secrets: HashMap<String, String>,
    pattern: Regex,
}

impl SecretsFunctor {
    pub fn new(secrets: HashMap<String, String>) -> Result<Self, ExpressionError> {
        Ok(Self {
            secrets,
            pattern: Regex::new(r#"^getValue\(\s*["']([^"']+)["']\s*\)$"#)?,
        })
    }
}

impl ExpressionFunctor for SecretsFunctor {
    fn resolve(&self, path: &str) -> Option<Value> {
        let caps = self.pattern.captures(path.trim())?;
        self.secrets.get(&caps[1]).cloned().map(Value::String)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExpressionContext {
        let mut variables = HashMap::new();
        variables.insert("tag".to_string(), json!("1.2.3"));
        variables.insert("replicas".to_string(), json!(3));

        let mut secrets = HashMap::new();
        secrets.insert("dockerPass".to_string(), "ref:account.dockerPass".to_string());

        ExpressionContext::new()
            .with_literal("env", json!({"name": "prod", "type": "Production"}))
            .with_functor("pipeline.variables", Arc::new(VariablesFunctor::new(variables)))
            .with_functor("secrets", Arc::new(SecretsFunctor::new(secrets).unwrap()))
    }

    #[test]
    fn test_whole_and_embedded_expressions() {
        let resolver = ExpressionResolver::new().unwrap();
        let mut value = json!({
            "image": "nginx:<+pipeline.variables.tag>",
            "replicas": "<+pipeline.variables.replicas>",
            "labels": ["<+env.name>", "static"],
            "password": "<+secrets.getValue(\"dockerPass\")>",
        });

        let unresolved = resolver.update_expressions(&context(), &mut value);

        assert!(unresolved.is_empty());
        assert_eq!(value["image"], "nginx:1.2.3");
        assert_eq!(value["replicas"], 3);
        assert_eq!(value["labels"][0], "prod");
        assert_eq!(value["password"], "ref:account.dockerPass");
    }

    #[test]
    fn test_unresolved_are_reported_and_left_in_place() {
        let resolver = ExpressionResolver::new().unwrap();
        let mut value = json!({"a": "<+artifact.tag>", "b": "x-<+env.missing>"});

        let unresolved = resolver.update_expressions(&context(), &mut value);

        assert_eq!(unresolved.len(), 2);
        assert_eq!(value["a"], "<+artifact.tag>");
        assert_eq!(value["b"], "x-<+env.missing>");
    }

    #[test]
    fn test_render_strict_fails_on_unresolved() {
        let resolver = ExpressionResolver::new().unwrap();
        let input = json!({"x": "<+unknown.thing>"});
        let err = resolver.render_strict(&context(), &input).unwrap_err();
        assert!(matches!(err, ExpressionError::Unresolved(ref list) if list.len() == 1));
    }
}
