//! Pipeline, stages and parallel creators

use crate::core::error::PlanError;
use crate::core::plan::{
    Dependency, EdgeLayoutList, FacilitatorType, GraphLayoutNode, ParallelStepParameters, PlanCreationResponse,
    PlanNode, StepOutcomeGroup, StepParameters, StepType,
};
use crate::core::yaml::YamlNode;
use crate::planner::{next_sibling_adviser, PlanCreationContext, STAGE_SIBLINGS, STEP_SIBLINGS};

pub(crate) fn create_pipeline_plan(
    _ctx: &PlanCreationContext<'_>,
    node: YamlNode<'_>,
) -> Result<PlanCreationResponse, PlanError> {
    let stages = node
        .field("stages")
        .ok_or_else(|| PlanError::invalid_yaml("Pipeline must contain stages"))?;
    let identifier = node.identifier().unwrap_or("pipeline");
    let name = node.string_field("name").unwrap_or(identifier);

    let mut response = PlanCreationResponse::new();
    response.add_node(
        PlanNode::new(node.uuid(), identifier, StepType::Pipeline, FacilitatorType::Child)
            .with_name(name)
            .with_group(StepOutcomeGroup::Pipeline)
            .with_parameters(StepParameters::section(stages.uuid())),
    )?;
    response.add_dependency(Dependency::new(&stages));
    response.start_node_id = Some(node.uuid().to_string());
    Ok(response)
}

pub(crate) fn create_stages_plan(
    _ctx: &PlanCreationContext<'_>,
    node: YamlNode<'_>,
) -> Result<PlanCreationResponse, PlanError> {
    let first = node
        .first_wrapped_child(STAGE_SIBLINGS)
        .ok_or_else(|| PlanError::invalid_request("Pipeline must have at least one stage"))?;

    let mut response = PlanCreationResponse::new();
    response.add_node(
        PlanNode::new(node.uuid(), "stages", StepType::Stages, FacilitatorType::Child)
            .with_name("Stages")
            .with_group(StepOutcomeGroup::Stages)
            .with_parameters(StepParameters::section(first.uuid())),
    )?;
    for child in node.wrapped_children(STAGE_SIBLINGS) {
        response.add_dependency(Dependency::new(&child));
    }
    Ok(response)
}

/// A `parallel` block of stages or of steps
pub(crate) fn create_parallel_plan(
    _ctx: &PlanCreationContext<'_>,
    node: YamlNode<'_>,
) -> Result<PlanCreationResponse, PlanError> {
    let in_steps = node.enclosing_array_name() == Some("steps");
    let kinds = if in_steps { STEP_SIBLINGS } else { STAGE_SIBLINGS };
    let children = node.wrapped_children(kinds);
    if children.is_empty() {
        return Err(PlanError::invalid_request(format!(
            "Parallel block at [{}] must contain at least one element",
            node.yaml_path()
        )));
    }
    let child_node_ids: Vec<String> = children.iter().map(|c| c.uuid().to_string()).collect();

    let mut response = PlanCreationResponse::new();
    let parallel_node = PlanNode::new(node.uuid(), "parallel", StepType::Parallel, FacilitatorType::Children)
        .with_name("parallel")
        .with_parameters(StepParameters::Parallel(ParallelStepParameters {
            child_node_ids: child_node_ids.clone(),
        }))
        .with_advisers(next_sibling_adviser(&node));
    response.add_node(parallel_node)?;

    if !in_steps {
        let next_ids = node
            .next_sibling_from_parent_array(STAGE_SIBLINGS)
            .map(|sibling| vec![sibling.uuid().to_string()])
            .unwrap_or_default();
        response.add_layout_node(GraphLayoutNode {
            node_uuid: node.uuid().to_string(),
            node_identifier: "parallel".to_string(),
            node_type: "parallel".to_string(),
            name: "parallel".to_string(),
            node_group: "STAGE".to_string(),
            edge_layout_list: EdgeLayoutList {
                current_node_children: child_node_ids,
                next_ids,
            },
        });
    }

    for child in children {
        response.add_dependency(Dependency::new(&child));
    }
    Ok(response)
}
