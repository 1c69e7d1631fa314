//! Structural checks run by `GraphBuilder::build`.
//!
//! All checks work on node and edge indices. Predicates are opaque here, so
//! every edge is treated as one that may fire.

use std::collections::VecDeque;

use switchyard_core::error::ValidationError;

use super::edge::Edge;
use super::node::{InputContract, NodeSpec};

/// Index form of a graph under construction.
pub(crate) struct Topology<'a> {
    pub nodes: &'a [NodeSpec],
    pub edges: &'a [Edge],
    /// `(from, to)` node indices, parallel to `edges`.
    pub ends: &'a [(usize, usize)],
    /// Outgoing edge indices per node.
    pub outgoing: &'a [Vec<usize>],
    /// Incoming edge indices per node.
    pub incoming: &'a [Vec<usize>],
}

/// Validate the topology and return the start node index.
pub(crate) fn validate(topo: &Topology<'_>, start: Option<usize>) -> Result<usize, ValidationError> {
    if topo.nodes.is_empty() {
        return Err(ValidationError::EmptyGraph);
    }

    if let Some(cycle) = find_cycle(topo) {
        return Err(ValidationError::Cycle {
            path: cycle.into_iter().map(|i| topo.nodes[i].name.clone()).collect(),
        });
    }

    let start = start.ok_or(ValidationError::NoStartNode)?;
    if topo.nodes[start].inputs.is_merge() {
        return Err(ValidationError::StartNodeIsMerge {
            node: topo.nodes[start].name.clone(),
        });
    }

    let unreachable = unreachable_from(topo, start);
    if !unreachable.is_empty() {
        return Err(ValidationError::Unreachable {
            nodes: unreachable.into_iter().map(|i| topo.nodes[i].name.clone()).collect(),
        });
    }

    check_merge_contracts(topo)?;

    Ok(start)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search in insertion order. Returns the first cycle found as a
/// closed path (first node repeated at the end).
///
/// Iterative so that long chains cannot exhaust the thread stack.
fn find_cycle(topo: &Topology<'_>) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; topo.nodes.len()];
    // Current path, with the position of the next outgoing edge to explore.
    let mut path: Vec<(usize, usize)> = Vec::new();

    for root in 0..topo.nodes.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::OnStack;
        path.push((root, 0));

        while let Some(&(node, cursor)) = path.last() {
            let Some(&edge) = topo.outgoing[node].get(cursor) else {
                marks[node] = Mark::Done;
                path.pop();
                continue;
            };
            if let Some(top) = path.last_mut() {
                top.1 += 1;
            }

            let (_, next) = topo.ends[edge];
            match marks[next] {
                Mark::OnStack => {
                    let pos = path.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    let mut cycle: Vec<usize> = path[pos..].iter().map(|&(n, _)| n).collect();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[next] = Mark::OnStack;
                    path.push((next, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Nodes not reachable from `start`, in insertion order.
fn unreachable_from(topo: &Topology<'_>, start: usize) -> Vec<usize> {
    let mut seen = vec![false; topo.nodes.len()];
    let mut queue = VecDeque::from([start]);
    seen[start] = true;

    while let Some(node) = queue.pop_front() {
        for &edge in &topo.outgoing[node] {
            let (_, next) = topo.ends[edge];
            if !seen[next] {
                seen[next] = true;
                queue.push_back(next);
            }
        }
    }

    (0..topo.nodes.len()).filter(|&i| !seen[i]).collect()
}

/// Declared merge inputs must be distinct and each wired to the node, and
/// every edge into a merge node must come from a declared input.
fn check_merge_contracts(topo: &Topology<'_>) -> Result<(), ValidationError> {
    for (idx, node) in topo.nodes.iter().enumerate() {
        let InputContract::Merge(sources) = &node.inputs else {
            continue;
        };
        if let Some(dup) = sources
            .iter()
            .enumerate()
            .find(|(i, s)| sources[..*i].contains(*s))
            .map(|(_, s)| s)
        {
            return Err(ValidationError::DuplicateMergeInput {
                node: node.name.clone(),
                input: dup.clone(),
            });
        }

        let incoming: Vec<&str> = topo.incoming[idx]
            .iter()
            .map(|&e| topo.edges[e].from.as_str())
            .collect();

        if let Some(missing) = sources.iter().find(|s| !incoming.contains(&s.as_str())) {
            return Err(ValidationError::MergeInputNotConnected {
                node: node.name.clone(),
                input: missing.clone(),
            });
        }
        if let Some(extra) = incoming.iter().find(|from| !sources.iter().any(|s| s == *from)) {
            return Err(ValidationError::UnexpectedMergeSource {
                node: node.name.clone(),
                from: extra.to_string(),
            });
        }
    }
    Ok(())
}
