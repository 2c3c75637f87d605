//! Execution, step group and step creators

use crate::core::error::PlanError;
use crate::core::plan::{
    Dependency, FacilitatorType, PlanCreationResponse, PlanNode, StepOutcomeGroup, StepParameters, StepType,
};
use crate::core::step::{StepEnvelope, StepKind, StepNodeYaml};
use crate::core::yaml::YamlNode;
use crate::planner::multi_deployment::IDENTIFIER_POSTFIX_EXPRESSION;
use crate::planner::strategy::wrap_with_strategy;
use crate::planner::{
    deserialize_clean, failure_strategy_advisers, next_sibling_adviser, PlanCreationContext, STEP_SIBLINGS,
};
use tracing::debug;

/// How the orchestrator runs each step kind
pub fn facilitator_for(kind: StepKind) -> FacilitatorType {
    match kind {
        StepKind::ShellScript | StepKind::Http => FacilitatorType::Task,
        StepKind::K8sRollingDeploy | StepKind::K8sRollingRollback => FacilitatorType::TaskChain,
        StepKind::Wait => FacilitatorType::Async,
    }
}

fn add_step_dependencies(steps: &YamlNode<'_>, response: &mut PlanCreationResponse) {
    for child in steps.wrapped_children(STEP_SIBLINGS) {
        response.add_dependency(Dependency::new(&child));
    }
}

pub(crate) fn create_execution_plan(
    _ctx: &PlanCreationContext<'_>,
    node: YamlNode<'_>,
) -> Result<PlanCreationResponse, PlanError> {
    let steps = node
        .field("steps")
        .ok_or_else(|| PlanError::invalid_yaml("Execution must contain steps"))?;
    let first = steps
        .first_wrapped_child(STEP_SIBLINGS)
        .ok_or_else(|| PlanError::invalid_request("Execution must have at least one step"))?;

    let mut response = PlanCreationResponse::new();
    response.add_node(
        PlanNode::new(node.uuid(), "execution", StepType::Execution, FacilitatorType::Child)
            .with_name("Execution")
            .with_group(StepOutcomeGroup::Execution)
            .with_parameters(StepParameters::section(first.uuid())),
    )?;
    add_step_dependencies(&steps, &mut response);
    Ok(response)
}

pub(crate) fn create_step_plan(
    _ctx: &PlanCreationContext<'_>,
    node: YamlNode<'_>,
) -> Result<PlanCreationResponse, PlanError> {
    let yaml: StepNodeYaml = deserialize_clean(&node)?;
    let mut envelope = StepEnvelope::from_yaml(&yaml)?;
    debug!("Creating {:?} step {}", envelope.kind, envelope.identifier);

    let mut response = PlanCreationResponse::new();
    let next = next_sibling_adviser(&node).into_iter().collect::<Vec<_>>();
    let inner_id = wrap_with_strategy(&node, node.uuid(), &envelope.identifier, &envelope.name, &next, &mut response)?;

    let (uuid, advisers) = match &inner_id {
        Some(inner) => {
            envelope.identifier = format!("{}{}", envelope.identifier, IDENTIFIER_POSTFIX_EXPRESSION);
            envelope.name = format!("{}{}", envelope.name, IDENTIFIER_POSTFIX_EXPRESSION);
            (inner.clone(), Vec::new())
        }
        None => (node.uuid().to_string(), next),
    };

    let plan_node = PlanNode::new(uuid, envelope.identifier.clone(), StepType::Step(envelope.kind), facilitator_for(envelope.kind))
        .with_name(envelope.name.clone())
        .with_group(StepOutcomeGroup::Step)
        .with_when_condition(Some(envelope.when.clone()))
        .with_skip_condition(envelope.skip_condition.clone())
        .with_timeout(envelope.timeout.clone())
        .with_advisers(failure_strategy_advisers(&envelope.failure_strategies))
        .with_advisers(advisers)
        .with_parameters(StepParameters::Step(envelope));
    response.add_node(plan_node)?;
    Ok(response)
}

pub(crate) fn create_step_group_plan(
    _ctx: &PlanCreationContext<'_>,
    node: YamlNode<'_>,
) -> Result<PlanCreationResponse, PlanError> {
    let identifier = node
        .identifier()
        .ok_or_else(|| PlanError::invalid_yaml(format!("Step group at [{}] needs an identifier", node.yaml_path())))?;
    let name = node.string_field("name").unwrap_or(identifier);
    let steps = node
        .field("steps")
        .ok_or_else(|| PlanError::invalid_yaml(format!("Step group [{}] must contain steps", identifier)))?;
    let first = steps.first_wrapped_child(STEP_SIBLINGS).ok_or_else(|| {
        PlanError::invalid_request(format!("Step group [{}] must have at least one step", identifier))
    })?;

    let mut response = PlanCreationResponse::new();
    let next = next_sibling_adviser(&node).into_iter().collect::<Vec<_>>();
    let inner_id = wrap_with_strategy(&node, node.uuid(), identifier, name, &next, &mut response)?;
    let (uuid, advisers, identifier, name) = match inner_id {
        Some(inner) => (
            inner,
            Vec::new(),
            format!("{}{}", identifier, IDENTIFIER_POSTFIX_EXPRESSION),
            format!("{}{}", name, IDENTIFIER_POSTFIX_EXPRESSION),
        ),
        None => (node.uuid().to_string(), next, identifier.to_string(), name.to_string()),
    };

    response.add_node(
        PlanNode::new(uuid, identifier, StepType::StepGroup, FacilitatorType::Child)
            .with_name(name)
            .with_group(StepOutcomeGroup::StepGroup)
            .with_parameters(StepParameters::section(first.uuid()))
            .with_advisers(advisers),
    )?;
    add_step_dependencies(&steps, &mut response);
    Ok(response)
}
