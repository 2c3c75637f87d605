//! CLI output formatting

use crate::core::plan::{GraphLayoutNode, Plan, PlanNode};
use crate::core::state::Status;
use crate::execution::ExecutionEvent;
use crate::persistence::SweepingOutputEntry;
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format a step status for display
pub fn format_status(status: Status) -> String {
    match status {
        Status::Running => style("RUNNING").yellow().to_string(),
        Status::AsyncWaiting => style("ASYNC_WAITING").yellow().to_string(),
        Status::Succeeded => style("SUCCEEDED").green().to_string(),
        Status::Failed => style("FAILED").red().to_string(),
        Status::Skipped => style("SKIPPED").dim().to_string(),
        Status::Aborted => style("ABORTED").yellow().to_string(),
    }
}

/// One line per plan node: id, type, identifier and outgoing edges
pub fn format_plan_node(node: &PlanNode) -> String {
    let mut line = format!(
        "{} {:?} {}",
        style(&node.uuid).dim(),
        node.step_type,
        style(&node.identifier).bold()
    );
    let children = node.step_parameters.child_node_ids();
    if !children.is_empty() {
        line.push_str(&format!(" child: {}", style(children.join(", ")).cyan()));
    }
    for adviser in &node.advisers {
        if let Some(next) = &adviser.next_node_id {
            line.push_str(&format!(" {:?} → {}", adviser.adviser_type, style(next).cyan()));
        }
    }
    line
}

/// Short summary of a compiled plan
pub fn format_plan_summary(plan: &Plan) -> String {
    format!(
        "{} Plan with {} node(s), start {}",
        CHECK,
        style(plan.nodes.len()).cyan(),
        style(&plan.start_node_id).dim()
    )
}

pub fn format_layout_node(node: &GraphLayoutNode) -> String {
    let edges = &node.edge_layout_list;
    let mut line = format!(
        "{} [{}] {} ({})",
        style(&node.node_group).dim(),
        node.node_type,
        style(&node.node_identifier).bold(),
        style(&node.node_uuid).dim()
    );
    if !edges.current_node_children.is_empty() {
        line.push_str(&format!(" children: {}", edges.current_node_children.join(", ")));
    }
    if !edges.next_ids.is_empty() {
        line.push_str(&format!(" next: {}", edges.next_ids.join(", ")));
    }
    line
}

pub fn format_output_entry(entry: &SweepingOutputEntry) -> String {
    format!(
        "{} {} [{}] {}",
        style(entry.created_at.to_rfc3339()).dim(),
        style(&entry.name).bold(),
        entry.visibility.as_str(),
        format_payload(&entry.payload, 80)
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::StepStarted { node_id } => format!("{} {}", ROCKET, style(node_id).cyan()),
        ExecutionEvent::PhaseChanged { node_id, phase } => {
            format!("{} {} {:?}", SPINNER, style(node_id).dim(), phase)
        }
        ExecutionEvent::TasksDispatched { node_id, task_ids } => format!(
            "{} {} dispatched {} task(s)",
            INFO,
            style(node_id).cyan(),
            style(task_ids.len()).bold()
        ),
        ExecutionEvent::StepCompleted { node_id, status } => {
            format!("{} {} {}", CHECK, style(node_id).green(), format_status(*status))
        }
        ExecutionEvent::StepFailed { node_id, error, internal } => {
            let marker = if *internal { WARN } else { CROSS };
            format!("{} {}: {}", marker, style(node_id).red(), style(error).dim())
        }
        ExecutionEvent::StepAborted { node_id } => {
            format!("{} {} aborted", WARN, style(node_id).yellow())
        }
    }
}

/// Truncate a payload to `max_chars` characters
pub fn format_payload(payload: &str, max_chars: usize) -> String {
    if payload.chars().count() <= max_chars {
        payload.to_string()
    } else {
        let truncated: String = payload.chars().take(max_chars).collect();
        format!("{}{}", truncated, style("...").dim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{AdviserObtainment, AdviserType, FacilitatorType, StepParameters, StepType};

    #[test]
    fn test_format_plan_node_lists_edges() {
        console::set_colors_enabled(false);
        let node = PlanNode::new("svc", "service", StepType::ServiceV3, FacilitatorType::Child)
            .with_parameters(StepParameters::section("def"))
            .with_adviser(AdviserObtainment::next(AdviserType::OnSuccess, "infra"));

        let line = format_plan_node(&node);
        assert!(line.contains("child: def"));
        assert!(line.contains("OnSuccess → infra"));
    }

    #[test]
    fn test_format_payload_truncates() {
        console::set_colors_enabled(false);
        assert_eq!(format_payload("short", 10), "short");
        assert_eq!(format_payload("abcdefghij", 4), "abcd...");
    }
}
