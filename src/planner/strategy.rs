//! Looping strategies (`matrix`, `repeat`, `parallelism`) around a stage or step

use crate::core::error::PlanError;
use crate::core::parameter::ParameterField;
use crate::core::plan::{
    AdviserObtainment, Dependency, FacilitatorType, PlanCreationResponse, PlanNode, StepOutcomeGroup,
    StepParameters, StepType,
};
use crate::core::yaml::YamlNode;
use crate::planner::{deserialize_clean, PlanCreationContext};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Dependency metadata key carrying [`StrategyMetadata`]
pub const STRATEGY_METADATA: &str = "strategyMetadata";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<ParameterField<u32>>,
    /// Every other key is an axis
    #[serde(flatten)]
    pub axes: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ParameterField<Vec<Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<ParameterField<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<ParameterField<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    Matrix,
    Repeat,
    Parallelism,
}

/// `strategy` block of a stage or step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<ParameterField<u32>>,
}

/// One concrete run of a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyIteration {
    pub index: usize,
    pub bindings: IndexMap<String, Value>,
    pub identifier_postfix: String,
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn postfix_of(bindings: &IndexMap<String, Value>) -> String {
    let parts: Vec<String> = bindings
        .values()
        .map(|v| {
            scalar_text(v)
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
                .collect()
        })
        .collect();
    format!("_{}", parts.join("_"))
}

/// Cartesian product of named axes, first axis varying slowest
pub fn cartesian(axes: &[(String, Vec<Value>)]) -> Vec<IndexMap<String, Value>> {
    let mut combinations = vec![IndexMap::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for combination in &combinations {
            for value in values {
                let mut extended = combination.clone();
                extended.insert(name.clone(), value.clone());
                next.push(extended);
            }
        }
        combinations = next;
    }
    combinations
}

impl StrategyConfig {
    /// Parse a `strategy` yaml node, dropping node ids
    pub fn from_node(node: &YamlNode<'_>) -> Result<Self, PlanError> {
        let config: StrategyConfig = deserialize_clean(node)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let declared = [self.matrix.is_some(), self.repeat.is_some(), self.parallelism.is_some()];
        if declared.iter().filter(|d| **d).count() != 1 {
            return Err(PlanError::invalid_request(
                "Strategy must define exactly one of matrix, repeat or parallelism",
            ));
        }
        if let Some(repeat) = &self.repeat {
            if repeat.items.is_some() == repeat.times.is_some() {
                return Err(PlanError::invalid_request(
                    "Repeat strategy must define exactly one of items or times",
                ));
            }
        }
        Ok(())
    }

    pub fn strategy_type(&self) -> StrategyType {
        if self.matrix.is_some() {
            StrategyType::Matrix
        } else if self.repeat.is_some() {
            StrategyType::Repeat
        } else {
            StrategyType::Parallelism
        }
    }

    /// Concurrency cap, when one is declared as a concrete value
    pub fn max_concurrency(&self) -> Option<u32> {
        let field = match (&self.matrix, &self.repeat) {
            (Some(matrix), _) => matrix.max_concurrency.as_ref(),
            (_, Some(repeat)) => repeat.max_concurrency.as_ref(),
            _ => None,
        };
        field.and_then(ParameterField::value).copied()
    }

    /// Concrete iterations. Every axis and count must be resolved by now.
    pub fn expand(&self) -> Result<Vec<StrategyIteration>, PlanError> {
        self.validate()?;

        if let Some(matrix) = &self.matrix {
            let mut axes = Vec::new();
            for (name, values) in matrix.axes.iter().filter(|(k, _)| !k.starts_with("__")) {
                match values {
                    Value::Array(items) => axes.push((name.clone(), items.clone())),
                    Value::String(expression) => {
                        return Err(PlanError::UnresolvedExpression {
                            field: format!("matrix.{}", name),
                            expression: expression.clone(),
                        })
                    }
                    other => axes.push((name.clone(), vec![other.clone()])),
                }
            }
            let iterations = cartesian(&axes)
                .into_iter()
                .filter(|bindings| {
                    !matrix.exclude.iter().any(|exclude| {
                        exclude.iter().all(|(k, v)| bindings.get(k) == Some(v))
                    })
                })
                .enumerate()
                .map(|(index, bindings)| StrategyIteration {
                    index,
                    identifier_postfix: postfix_of(&bindings),
                    bindings,
                })
                .collect();
            return Ok(iterations);
        }

        if let Some(repeat) = &self.repeat {
            if let Some(items) = &repeat.items {
                let items = items.concrete("repeat.items")?;
                return Ok(items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| StrategyIteration {
                        index,
                        bindings: IndexMap::from([("item".to_string(), item.clone())]),
                        identifier_postfix: format!("_{}", index),
                    })
                    .collect());
            }
            if let Some(times) = &repeat.times {
                let times = *times.concrete("repeat.times")?;
                return Ok(indexed(times));
            }
        }

        let count = match &self.parallelism {
            Some(parallelism) => *parallelism.concrete("parallelism")?,
            None => 0,
        };
        Ok(indexed(count))
    }
}

fn indexed(count: u32) -> Vec<StrategyIteration> {
    (0..count as usize)
        .map(|index| StrategyIteration {
            index,
            bindings: IndexMap::new(),
            identifier_postfix: format!("_{}", index),
        })
        .collect()
}

/// Parameters of a strategy node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStepParameters {
    pub child_node_id: String,
    pub strategy_type: StrategyType,
    pub strategy: StrategyConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

/// Handed from the wrapped stage or step to the strategy creator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyMetadata {
    pub strategy_node_id: String,
    pub child_node_id: String,
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,
}

/// If `node` declares a `strategy`, return the id the wrapped node must use
/// and register the strategy dependency. The strategy node takes `outer_id`
/// and the caller's advisers.
pub fn wrap_with_strategy(
    node: &YamlNode<'_>,
    outer_id: &str,
    identifier: &str,
    name: &str,
    advisers: &[AdviserObtainment],
    response: &mut PlanCreationResponse,
) -> Result<Option<String>, PlanError> {
    let Some(strategy) = node.field("strategy") else {
        return Ok(None);
    };
    let inner_id = strategy.uuid().to_string();
    let metadata = StrategyMetadata {
        strategy_node_id: outer_id.to_string(),
        child_node_id: inner_id.clone(),
        identifier: identifier.to_string(),
        name: name.to_string(),
        advisers: advisers.to_vec(),
    };
    response.add_dependency(Dependency::new(&strategy).with_metadata(STRATEGY_METADATA, &metadata)?);
    Ok(Some(inner_id))
}

pub(crate) fn create_strategy_plan(
    ctx: &PlanCreationContext<'_>,
    node: YamlNode<'_>,
) -> Result<PlanCreationResponse, PlanError> {
    let metadata: StrategyMetadata = ctx.require_metadata(STRATEGY_METADATA)?;
    let config = StrategyConfig::from_node(&node)?;
    debug!("Creating {:?} strategy node for {}", config.strategy_type(), metadata.identifier);

    let parameters = StrategyStepParameters {
        child_node_id: metadata.child_node_id.clone(),
        strategy_type: config.strategy_type(),
        max_concurrency: config.max_concurrency(),
        strategy: config,
    };
    let plan_node = PlanNode::new(
        metadata.strategy_node_id.clone(),
        metadata.identifier.clone(),
        StepType::Strategy,
        FacilitatorType::Children,
    )
    .with_name(metadata.name.clone())
    .with_group(StepOutcomeGroup::Strategy)
    .with_parameters(StepParameters::Strategy(parameters))
    .with_advisers(metadata.advisers);

    let mut response = PlanCreationResponse::new();
    response.add_node(plan_node)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(yaml: &str) -> StrategyConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_matrix_expansion_with_exclude() {
        let strategy = config(
            r#"
matrix:
  os: [linux, windows]
  arch: [amd64, arm64]
  exclude:
    - os: windows
      arch: arm64
  maxConcurrency: 2
"#,
        );

        let iterations = strategy.expand().unwrap();
        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[0].bindings["os"], json!("linux"));
        assert_eq!(iterations[0].identifier_postfix, "_linux_amd64");
        assert_eq!(iterations[2].identifier_postfix, "_windows_amd64");
        assert_eq!(strategy.max_concurrency(), Some(2));
        assert_eq!(strategy.strategy_type(), StrategyType::Matrix);
    }

    #[test]
    fn test_repeat_and_parallelism() {
        let repeat = config("repeat:\n  items: [a, b, c]\n");
        let iterations = repeat.expand().unwrap();
        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[1].bindings["item"], json!("b"));

        let times = config("repeat:\n  times: 2\n");
        assert_eq!(times.expand().unwrap().len(), 2);

        let parallelism = config("parallelism: 4\n");
        assert_eq!(parallelism.expand().unwrap()[3].identifier_postfix, "_3");
    }

    #[test]
    fn test_unresolved_axis_fails_expansion() {
        let strategy = config("matrix:\n  region: <+input>\n");
        assert!(matches!(
            strategy.expand(),
            Err(PlanError::UnresolvedExpression { .. })
        ));
    }

    #[test]
    fn test_strategy_must_pick_one_kind() {
        assert!(config("parallelism: 2\nrepeat: { times: 2 }\n").validate().is_err());
        assert!(config("{}").validate().is_err());
        assert!(config("repeat: { times: 2, items: [a] }\n").validate().is_err());
    }

    #[test]
    fn test_cartesian_order() {
        let combos = cartesian(&[
            ("a".to_string(), vec![json!(1), json!(2)]),
            ("b".to_string(), vec![json!("x"), json!("y")]),
        ]);
        let pairs: Vec<(Value, Value)> = combos
            .iter()
            .map(|c| (c["a"].clone(), c["b"].clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (json!(1), json!("x")),
                (json!(1), json!("y")),
                (json!(2), json!("x")),
                (json!(2), json!("y")),
            ]
        );
    }
}
