// Execution Planner
// Compiles a pipeline config into a dependency DAG layered into levels of
// parallelism. Pure: validation errors are reported, nothing is executed.

use std::collections::{HashMap, HashSet};

use cadence_types::PipelineConfig;

use crate::error::{PipelineError, Result};

/// A level with more ready stages than this is usually a modeling error.
const FAN_OUT_WARNING_THRESHOLD: usize = 10;

/// One stage in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageNode {
    pub name: String,
    pub depends_on: Vec<String>,
    /// Longest-path distance from any root (roots at 0).
    pub level: usize,
}

/// The compiled plan: nodes keyed by stage name and the level layering.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: HashMap<String, StageNode>,
    /// Stages per level, in config declaration order within each level.
    pub level_groups: Vec<Vec<String>>,
    pub max_parallelism: usize,
}

impl ExecutionGraph {
    pub fn node(&self, name: &str) -> Option<&StageNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Build the plan for a validated config.
    pub fn build(config: &PipelineConfig) -> Result<ExecutionGraph> {
        if config.agents.is_empty() {
            return Err(PipelineError::Validation(
                "pipeline has no stages".to_string(),
            ));
        }

        // duplicate names
        let mut seen = HashSet::new();
        for stage in &config.agents {
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        // unknown dependency targets
        for stage in &config.agents {
            for dep in &stage.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(PipelineError::Validation(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    )));
                }
            }
        }

        if let Some(cycle) = detect_cycle(config) {
            return Err(PipelineError::Validation(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }

        // longest-path level per node; dependencies always resolve because
        // the graph is acyclic
        let deps_by_name: HashMap<&str, &Vec<String>> = config
            .agents
            .iter()
            .map(|s| (s.name.as_str(), &s.depends_on))
            .collect();
        let mut levels: HashMap<&str, usize> = HashMap::new();
        for stage in &config.agents {
            compute_level(stage.name.as_str(), &deps_by_name, &mut levels);
        }

        let depth = levels.values().copied().max().unwrap_or(0);
        let mut level_groups: Vec<Vec<String>> = vec![Vec::new(); depth + 1];
        for stage in &config.agents {
            let level = levels[stage.name.as_str()];
            level_groups[level].push(stage.name.clone());
        }

        let max_parallelism = level_groups.iter().map(|g| g.len()).max().unwrap_or(0);
        if let Some((level, group)) = level_groups
            .iter()
            .enumerate()
            .find(|(_, g)| g.len() > FAN_OUT_WARNING_THRESHOLD)
        {
            tracing::warn!(
                "level {} has {} concurrent stages; large fan-out is usually a modeling error",
                level,
                group.len()
            );
        }

        let nodes = config
            .agents
            .iter()
            .map(|stage| {
                (
                    stage.name.clone(),
                    StageNode {
                        name: stage.name.clone(),
                        depends_on: stage.depends_on.clone(),
                        level: levels[stage.name.as_str()],
                    },
                )
            })
            .collect();

        Ok(ExecutionGraph {
            nodes,
            level_groups,
            max_parallelism,
        })
    }
}

fn compute_level<'a>(
    name: &'a str,
    deps_by_name: &HashMap<&'a str, &'a Vec<String>>,
    levels: &mut HashMap<&'a str, usize>,
) -> usize {
    if let Some(level) = levels.get(name) {
        return *level;
    }
    let level = match deps_by_name.get(name) {
        Some(deps) if !deps.is_empty() => deps
            .iter()
            .map(|dep| compute_level(dep.as_str(), deps_by_name, levels) + 1)
            .max()
            .unwrap_or(0),
        _ => 0,
    };
    levels.insert(name, level);
    level
}

/// DFS colouring; returns the participating cycle path when one exists.
fn detect_cycle(config: &PipelineConfig) -> Option<Vec<String>> {
    let by_name: HashMap<&str, &Vec<String>> = config
        .agents
        .iter()
        .map(|s| (s.name.as_str(), &s.depends_on))
        .collect();

    for stage in &config.agents {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if dfs_cycle(&stage.name, &by_name, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle(
    name: &str,
    by_name: &HashMap<&str, &Vec<String>>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.iter().any(|p| p == name) {
        path.push(name.to_string());
        return true;
    }
    if visited.contains(name) {
        return false;
    }

    visited.insert(name.to_string());
    path.push(name.to_string());

    if let Some(deps) = by_name.get(name) {
        for dep in deps.iter() {
            if dfs_cycle(dep, by_name, visited, path) {
                return true;
            }
        }
    }

    path.pop();
    false
}
