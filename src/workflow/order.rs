use std::collections::{HashMap, VecDeque};

use super::graph::WorkflowGraph;

/// Kahn's algorithm over the workflow edges.
///
/// Start nodes seed the queue first, then every other zero in-degree node in
/// node order. Each node is emitted at most once. Edges that name unknown
/// nodes are ignored, and nodes on a cycle are never emitted. Condition
/// outcomes play no part: both branches of a condition appear in the order.
pub fn execution_order(graph: &WorkflowGraph) -> Vec<String> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(graph.nodes.len());
    let mut nodes = Vec::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        if !index.contains_key(node.id.as_str()) {
            index.insert(node.id.as_str(), nodes.len());
            nodes.push(node);
        }
    }

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];
    for edge in &graph.edges {
        if let (Some(&source), Some(&target)) =
            (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
        {
            successors[source].push(target);
            in_degree[target] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..nodes.len())
        .filter(|&i| nodes[i].kind.is_start())
        .collect();
    queue.extend((0..nodes.len()).filter(|&i| !nodes[i].kind.is_start() && in_degree[i] == 0));

    let mut visited = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = queue.pop_front() {
        if visited[current] {
            continue;
        }
        visited[current] = true;
        order.push(nodes[current].id.clone());

        for &next in &successors[current] {
            in_degree[next] = in_degree[next].saturating_sub(1);
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    order
}
