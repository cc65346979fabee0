//! Graph definitions: node specs, retry policies, per-node budgets, and the
//! YAML loader with load-time structural validation.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, InfraError, WintermuteError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: f64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_seconds() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

/// Per-node budget caps. Zero means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeBudget {
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub max_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(skip, default)]
    pub name: String,
    pub agent: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub on_fail: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub budget: Option<NodeBudget>,
    #[serde(default)]
    pub end: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub id: String,
    pub entry: String,
    pub nodes: HashMap<String, GraphNode>,
}

impl Graph {
    pub fn node(&self, name: &str) -> Result<&GraphNode, GraphError> {
        self.nodes
            .get(name)
            .ok_or_else(|| GraphError::DanglingEdge {
                node: "<lookup>".into(),
                target: name.into(),
                edge: "next",
            })
    }

    /// Structural validation run once at load time: the entry must exist,
    /// every `next`/`on_fail` must resolve, and every node must be reachable
    /// from the entry (via either edge kind).
    pub fn validate(&self) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&self.entry) {
            return Err(GraphError::UnknownEntry(self.entry.clone()));
        }

        for (name, node) in &self.nodes {
            if let Some(next) = &node.next {
                if !self.nodes.contains_key(next) {
                    return Err(GraphError::DanglingEdge {
                        node: name.clone(),
                        target: next.clone(),
                        edge: "next",
                    });
                }
            }
            if let Some(on_fail) = &node.on_fail {
                if !self.nodes.contains_key(on_fail) {
                    return Err(GraphError::DanglingEdge {
                        node: name.clone(),
                        target: on_fail.clone(),
                        edge: "on_fail",
                    });
                }
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack = vec![self.entry.as_str()];
        while let Some(name) = stack.pop() {
            if !seen.insert(name) {
                continue;
            }
            let node = &self.nodes[name];
            if let Some(next) = &node.next {
                stack.push(next);
            }
            if let Some(on_fail) = &node.on_fail {
                stack.push(on_fail);
            }
        }
        for name in self.nodes.keys() {
            if !seen.contains(name.as_str()) {
                return Err(GraphError::Unreachable(name.clone()));
            }
        }

        Ok(())
    }

    /// Node names on the main `next` chain from the entry, in execution order.
    pub fn main_chain(&self) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = Some(self.entry.as_str());
        let mut guard: HashSet<&str> = HashSet::new();
        while let Some(name) = current {
            if !guard.insert(name) {
                break;
            }
            chain.push(name);
            current = self
                .nodes
                .get(name)
                .and_then(|n| if n.end { None } else { n.next.as_deref() });
        }
        chain
    }
}

/// Load and validate a graph definition from a YAML file.
pub fn load_graph(path: impl AsRef<Path>) -> Result<Graph, WintermuteError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(InfraError::Io)?;
    let mut graph: Graph =
        serde_yaml::from_str(&raw).map_err(|e| InfraError::Config(e.to_string()))?;
    if graph.id.is_empty() {
        graph.id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    for (name, node) in graph.nodes.iter_mut() {
        node.name = name.clone();
    }
    graph.validate()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> Graph {
        let mut nodes = HashMap::new();
        nodes.insert(
            "a".to_string(),
            GraphNode {
                name: "a".into(),
                agent: "ingestor".into(),
                inputs: vec!["scope_id".into()],
                outputs: vec!["sources".into()],
                next: Some("b".into()),
                on_fail: None,
                retry: RetryPolicy::default(),
                budget: None,
                end: false,
            },
        );
        nodes.insert(
            "b".to_string(),
            GraphNode {
                name: "b".into(),
                agent: "publisher".into(),
                inputs: vec!["sources".into()],
                outputs: vec!["artifacts".into()],
                next: None,
                on_fail: None,
                retry: RetryPolicy::default(),
                budget: None,
                end: true,
            },
        );
        Graph {
            id: "test".into(),
            entry: "a".into(),
            nodes,
        }
    }

    #[test]
    fn valid_graph_passes() {
        assert!(two_node_graph().validate().is_ok());
    }

    #[test]
    fn dangling_next_rejected() {
        let mut graph = two_node_graph();
        graph.nodes.get_mut("a").unwrap().next = Some("ghost".into());
        assert!(matches!(
            graph.validate(),
            Err(GraphError::DanglingEdge { edge: "next", .. })
        ));
    }

    #[test]
    fn unknown_entry_rejected() {
        let mut graph = two_node_graph();
        graph.entry = "ghost".into();
        assert!(matches!(graph.validate(), Err(GraphError::UnknownEntry(_))));
    }

    #[test]
    fn unreachable_node_rejected() {
        let mut graph = two_node_graph();
        graph.nodes.insert(
            "island".into(),
            GraphNode {
                name: "island".into(),
                agent: "qa_validator".into(),
                inputs: vec![],
                outputs: vec![],
                next: None,
                on_fail: None,
                retry: RetryPolicy::default(),
                budget: None,
                end: true,
            },
        );
        assert!(matches!(graph.validate(), Err(GraphError::Unreachable(n)) if n == "island"));
    }

    #[test]
    fn main_chain_follows_next_until_end() {
        let graph = two_node_graph();
        assert_eq!(graph.main_chain(), vec!["a", "b"]);
    }

    #[test]
    fn loads_yaml_with_defaults() {
        let yaml = r#"
entry: extract
nodes:
  extract:
    agent: claim_extractor
    inputs: [segments]
    outputs: [claims]
    next: publish
    retry:
      max_attempts: 2
      backoff_seconds: 0.0
    budget:
      max_tokens: 8000
  publish:
    agent: publisher
    inputs: [claims]
    outputs: [artifacts]
    end: true
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mini.yaml");
        std::fs::write(&path, yaml).unwrap();

        let graph = load_graph(&path).unwrap();
        assert_eq!(graph.id, "mini");
        assert_eq!(graph.entry, "extract");
        let extract = &graph.nodes["extract"];
        assert_eq!(extract.name, "extract");
        assert_eq!(extract.retry.max_attempts, 2);
        assert_eq!(extract.budget.as_ref().unwrap().max_tokens, 8000);
        assert!(graph.nodes["publish"].end);
    }
}
