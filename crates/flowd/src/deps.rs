//! Dependency analyzer: build a DAG from issue relationships, order it,
//! and detect cycles.
//!
//! Two relationship kinds produce edges. `blocks` points from blocker to
//! blocked as written; `depends-on` is reversed so the edge always runs
//! blocker → blocked. Edges touching issues outside the requested set are
//! dropped, duplicates are suppressed.

use flow_core::entity::{Entity, RELATION_BLOCKS, RELATION_DEPENDS_ON};
use std::collections::{HashMap, HashSet, VecDeque};

/// Result of analyzing one issue set.
#[derive(Debug, Clone)]
pub struct DependencyAnalysis {
    pub issue_ids: Vec<String>,
    /// Blocker → blocked edges.
    pub edges: Vec<(String, String)>,
    pub topological_order: Vec<String>,
    /// Cycle paths, each ending in the node that closed it. `None` when
    /// the graph is acyclic.
    pub cycles: Option<Vec<Vec<String>>>,
    /// Issues grouped by dependency level; issues in one group have no
    /// edges between them and may run concurrently.
    pub parallel_groups: Vec<Vec<String>>,
}

impl DependencyAnalysis {
    pub fn has_cycles(&self) -> bool {
        self.cycles.is_some()
    }
}

/// Analyze the dependency structure of the given issues.
pub fn analyze(issue_ids: &[String], issues_by_id: &HashMap<String, Entity>) -> DependencyAnalysis {
    let id_set: HashSet<&str> = issue_ids.iter().map(String::as_str).collect();

    // Collect blocker → blocked edges from both relationship kinds.
    let mut edges: Vec<(String, String)> = Vec::new();
    let mut edge_set: HashSet<(String, String)> = HashSet::new();
    let mut push_edge = |from: &str, to: &str| {
        if !id_set.contains(from) || !id_set.contains(to) || from == to {
            return;
        }
        let edge = (from.to_string(), to.to_string());
        if edge_set.insert(edge.clone()) {
            edges.push(edge);
        }
    };

    for id in issue_ids {
        let Some(issue) = issues_by_id.get(id) else {
            continue;
        };
        for target in issue.relation_targets(RELATION_BLOCKS) {
            push_edge(id, target);
        }
        for target in issue.relation_targets(RELATION_DEPENDS_ON) {
            // This issue depends on the target, so the target blocks it.
            push_edge(target, id);
        }
    }

    // Adjacency and in-degree over the requested set.
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut incoming: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> =
        issue_ids.iter().map(|id| (id.as_str(), 0)).collect();
    for (from, to) in &edges {
        outgoing.entry(from.as_str()).or_default().push(to.as_str());
        incoming.entry(to.as_str()).or_default().push(from.as_str());
        *in_degree.entry(to.as_str()).or_insert(0) += 1;
    }

    // Kahn's algorithm: seed with zero in-degree nodes in input order.
    let mut queue: VecDeque<&str> = issue_ids
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
        .collect();
    let mut remaining = in_degree.clone();
    let mut topological_order: Vec<String> = Vec::with_capacity(issue_ids.len());

    while let Some(node) = queue.pop_front() {
        topological_order.push(node.to_string());
        if let Some(neighbors) = outgoing.get(node) {
            for &next in neighbors {
                if let Some(degree) = remaining.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }
    }

    // Any node not emitted sits on (or behind) a cycle.
    let cycles = if topological_order.len() < issue_ids.len() {
        let emitted: HashSet<&str> = topological_order.iter().map(String::as_str).collect();
        let stuck: Vec<&str> = issue_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !emitted.contains(id))
            .collect();
        Some(find_cycles(&stuck, &outgoing))
    } else {
        None
    };

    // Level = 1 + max(level of in-neighbors); roots are level 1.
    let mut levels: HashMap<&str, usize> = HashMap::new();
    for node in &topological_order {
        let level = incoming
            .get(node.as_str())
            .map(|parents| {
                parents
                    .iter()
                    .filter_map(|p| levels.get(p))
                    .max()
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            + 1;
        levels.insert(node.as_str(), level);
    }

    let max_level = levels.values().max().copied().unwrap_or(0);
    let mut parallel_groups: Vec<Vec<String>> = vec![Vec::new(); max_level];
    for node in &topological_order {
        if let Some(&level) = levels.get(node.as_str()) {
            parallel_groups[level - 1].push(node.clone());
        }
    }

    DependencyAnalysis {
        issue_ids: issue_ids.to_vec(),
        edges,
        topological_order,
        cycles,
        parallel_groups,
    }
}

/// Locate cycles by DFS restricted to the nodes Kahn's algorithm could
/// not emit. Each cycle is reported once as a path ending in the node
/// that closed it.
fn find_cycles<'a>(
    stuck: &[&'a str],
    outgoing: &HashMap<&'a str, Vec<&'a str>>,
) -> Vec<Vec<String>> {
    let stuck_set: HashSet<&str> = stuck.iter().copied().collect();
    let mut cycles: Vec<Vec<String>> = Vec::new();
    let mut done: HashSet<&str> = HashSet::new();

    for &start in stuck {
        if done.contains(start) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        dfs(
            start,
            outgoing,
            &stuck_set,
            &mut path,
            &mut on_path,
            &mut done,
            &mut cycles,
        );
    }

    cycles
}

fn dfs<'a>(
    node: &'a str,
    outgoing: &HashMap<&'a str, Vec<&'a str>>,
    stuck_set: &HashSet<&str>,
    path: &mut Vec<&'a str>,
    on_path: &mut HashSet<&'a str>,
    done: &mut HashSet<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    path.push(node);
    on_path.insert(node);

    if let Some(neighbors) = outgoing.get(node) {
        for &next in neighbors {
            if !stuck_set.contains(next) {
                continue;
            }
            if on_path.contains(next) {
                // Cycle found: slice the path from the repeat onward and
                // close it with the repeated node.
                let pos = path.iter().position(|&p| p == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| (*s).to_string()).collect();
                cycle.push(next.to_string());
                cycles.push(cycle);
            } else if !done.contains(next) {
                dfs(next, outgoing, stuck_set, path, on_path, done, cycles);
            }
        }
    }

    path.pop();
    on_path.remove(node);
    done.insert(node);
}
