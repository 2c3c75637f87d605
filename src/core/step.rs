//! Step domain model
//!
//! A step is a common envelope (identifier, timeout, failure strategies,
//! conditions) around a payload that depends on the step kind.

use crate::core::error::PlanError;
use crate::core::stage::{step_run_condition, strip_node_ids, FailureStrategyConfig, StepWhenCondition};
use crate::core::parameter::{string_of, ParameterField};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Step kinds the planner knows how to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    ShellScript,
    K8sRollingDeploy,
    K8sRollingRollback,
    Http,
    Wait,
}

impl StepKind {
    pub fn parse(step_type: &str) -> Result<Self, PlanError> {
        match step_type {
            "ShellScript" => Ok(StepKind::ShellScript),
            "K8sRollingDeploy" => Ok(StepKind::K8sRollingDeploy),
            "K8sRollingRollback" => Ok(StepKind::K8sRollingRollback),
            "Http" => Ok(StepKind::Http),
            "Wait" => Ok(StepKind::Wait),
            other => Err(PlanError::invalid_request(format!(
                "Step type [{}] is not supported",
                other
            ))),
        }
    }
}

/// Kind-specific payload of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepSpec {
    #[serde(rename_all = "camelCase")]
    ShellScript {
        shell: String,
        script: String,
        #[serde(default)]
        environment_variables: BTreeMap<String, String>,
        #[serde(default)]
        output_variables: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    K8sRollingDeploy {
        #[serde(default)]
        skip_dry_run: bool,
        #[serde(default)]
        prune_enabled: bool,
    },
    K8sRollingRollback {},
    #[serde(rename_all = "camelCase")]
    Http {
        url: String,
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        request_body: Option<String>,
        #[serde(default)]
        assertion: Option<String>,
    },
    Wait {
        duration: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellScriptYaml {
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    source: Option<Value>,
    #[serde(default)]
    environment_variables: Vec<NameValue>,
    #[serde(default)]
    output_variables: Vec<NameValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct K8sRollingDeployYaml {
    #[serde(default)]
    skip_dry_run: Option<ParameterField<bool>>,
    #[serde(default)]
    prune_enabled: Option<ParameterField<bool>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpYaml {
    #[serde(default)]
    url: Option<ParameterField<String>>,
    #[serde(default)]
    method: Option<ParameterField<String>>,
    #[serde(default)]
    headers: Vec<KeyValue>,
    #[serde(default)]
    request_body: Option<ParameterField<String>>,
    #[serde(default)]
    assertion: Option<ParameterField<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct WaitYaml {
    #[serde(default)]
    duration: Option<ParameterField<String>>,
}

#[derive(Debug, Deserialize)]
struct NameValue {
    name: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flag(field: &Option<ParameterField<bool>>) -> bool {
    matches!(field, Some(ParameterField::Value(true)))
}

fn spec_from<T: serde::de::DeserializeOwned + Default>(kind: StepKind, spec: &Value) -> Result<T, PlanError> {
    if spec.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(spec.clone())
        .map_err(|e| PlanError::invalid_yaml(format!("Invalid spec for {:?} step: {}", kind, e)))
}

impl StepSpec {
    /// Build the payload for `kind` from the step's yaml `spec`
    pub fn from_yaml(kind: StepKind, spec: &Value) -> Result<Self, PlanError> {
        match kind {
            StepKind::ShellScript => {
                let yaml: ShellScriptYaml = spec_from(kind, spec)?;
                let script = yaml
                    .source
                    .as_ref()
                    .and_then(|s| s.pointer("/spec/script"))
                    .map(scalar_text)
                    .unwrap_or_default();
                Ok(StepSpec::ShellScript {
                    shell: yaml.shell.unwrap_or_else(|| "Bash".to_string()),
                    script,
                    environment_variables: yaml
                        .environment_variables
                        .into_iter()
                        .map(|v| (v.name, scalar_text(&v.value)))
                        .collect(),
                    output_variables: yaml.output_variables.into_iter().map(|v| v.name).collect(),
                })
            }
            StepKind::K8sRollingDeploy => {
                let yaml: K8sRollingDeployYaml = spec_from(kind, spec)?;
                Ok(StepSpec::K8sRollingDeploy {
                    skip_dry_run: flag(&yaml.skip_dry_run),
                    prune_enabled: flag(&yaml.prune_enabled),
                })
            }
            StepKind::K8sRollingRollback => Ok(StepSpec::K8sRollingRollback {}),
            StepKind::Http => {
                let yaml: HttpYaml = spec_from(kind, spec)?;
                let url = string_of(&yaml.url)
                    .ok_or_else(|| PlanError::invalid_yaml("Http step requires a url"))?;
                Ok(StepSpec::Http {
                    url: url.to_string(),
                    method: string_of(&yaml.method).unwrap_or("GET").to_string(),
                    headers: yaml.headers.into_iter().map(|h| (h.key, h.value)).collect(),
                    request_body: string_of(&yaml.request_body).map(str::to_string),
                    assertion: string_of(&yaml.assertion).map(str::to_string),
                })
            }
            StepKind::Wait => {
                let yaml: WaitYaml = spec_from(kind, spec)?;
                Ok(StepSpec::Wait {
                    duration: string_of(&yaml.duration).unwrap_or("10m").to_string(),
                })
            }
        }
    }
}

/// Fields shared by every step, wrapping the kind-specific spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEnvelope {
    pub identifier: String,
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub failure_strategies: Vec<FailureStrategyConfig>,
    pub when: String,
    #[serde(default)]
    pub skip_condition: Option<String>,
    #[serde(default)]
    pub delegate_selectors: Vec<String>,
    pub spec: StepSpec,
}

/// `step` node as written in yaml
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepNodeYaml {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub timeout: Option<ParameterField<String>>,
    #[serde(default)]
    pub failure_strategies: Vec<FailureStrategyConfig>,
    #[serde(default)]
    pub when: Option<StepWhenCondition>,
    #[serde(default)]
    pub skip_condition: Option<ParameterField<String>>,
    #[serde(default)]
    pub spec: Value,
}

impl StepEnvelope {
    pub fn from_yaml(step: &StepNodeYaml) -> Result<Self, PlanError> {
        let kind = StepKind::parse(&step.step_type)?;
        let mut spec = step.spec.clone();
        strip_node_ids(&mut spec);

        let delegate_selectors = spec
            .get("delegateSelectors")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(scalar_text).collect())
            .unwrap_or_default();

        Ok(Self {
            identifier: step.identifier.clone(),
            name: step.name.clone().unwrap_or_else(|| step.identifier.clone()),
            kind,
            timeout: string_of(&step.timeout).map(str::to_string),
            failure_strategies: step.failure_strategies.clone(),
            when: step_run_condition(&step.when),
            skip_condition: string_of(&step.skip_condition).map(str::to_string),
            delegate_selectors,
            spec: StepSpec::from_yaml(kind, &spec)?,
        })
    }
}
