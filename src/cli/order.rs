use std::path::Path;

use serde_json::json;

use crate::cli::commands::OrderArgs;
use crate::errors::MenderError;
use crate::workflow::store::read_graph;
use crate::workflow::{execution_order, WorkflowGraph};

pub async fn handle_order(args: OrderArgs) -> Result<(), MenderError> {
    let graph = read_graph(Path::new(&args.workflow)).await?;
    let order = execution_order(&graph);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&json!({ "executionOrder": order }))?);
    } else {
        print!("{}", render_order(&graph, &order));
    }
    Ok(())
}

fn render_order(graph: &WorkflowGraph, order: &[String]) -> String {
    let mut out = String::new();
    for (index, id) in order.iter().enumerate() {
        let Some(node) = graph.node(id) else { continue };
        let marker = if node.kind.step().is_some() { "" } else { " (skipped)" };
        out.push_str(&format!(
            "{:>3}. {} [{}] {}{}\n",
            index + 1,
            node.id,
            node.kind.type_name(),
            node.label,
            marker
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{NodeKind, PromptStep, WorkflowEdge, WorkflowNode};

    #[test]
    fn test_render_marks_passed_over_nodes() {
        let graph = WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("fix", NodeKind::Prompt(PromptStep::default())).with_label("Fix it"),
                WorkflowNode::new("start", NodeKind::Start),
            ],
            edges: vec![WorkflowEdge::new("start", "fix")],
            ..Default::default()
        };
        let order = execution_order(&graph);
        let text = render_order(&graph, &order);
        assert_eq!(
            text,
            "  1. start [workflowStart] start (skipped)\n  2. fix [promptBlock] Fix it\n"
        );
    }
}
