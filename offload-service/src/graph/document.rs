// Graph Document
// Serialized pipeline graph files: node summaries, links and input rewriting

use crate::graph::model::{Edge, Node};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading or rewriting a graph file
#[derive(Debug, Error)]
pub enum GraphFileError {
    #[error("Graph file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read graph file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse graph file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Graph file {0} has no 'graph' section")]
    MissingGraph(PathBuf),

    #[error("Node '{node}' is missing '{field}'")]
    MissingField { node: String, field: &'static str },

    #[error("Input files {first} and {second} share the name '{name}'")]
    AmbiguousInput {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Failed to write graph file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Name, type and uid of one node as declared in a graph file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub name: String,
    pub node_type: String,
    pub uid: String,
}

impl NodeSummary {
    pub fn to_node(&self, accelerated: bool) -> Node {
        Node::new(&self.name, &self.node_type, &self.uid, accelerated)
    }
}

/// A graph file held as a JSON tree so unknown sections survive a rewrite
#[derive(Debug, Clone)]
pub struct GraphDocument {
    path: PathBuf,
    value: Value,
}

impl GraphDocument {
    /// Read and parse a graph file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphFileError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GraphFileError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| GraphFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|source| GraphFileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_value(path, value)
    }

    /// Wrap an already parsed document
    pub fn from_value(path: impl Into<PathBuf>, value: Value) -> Result<Self, GraphFileError> {
        let path = path.into();
        if !value.get("graph").map(Value::is_object).unwrap_or(false) {
            return Err(GraphFileError::MissingGraph(path));
        }
        Ok(Self { path, value })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// File name of the graph, e.g. `scan.mg`
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name without extension, used as the project name
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn graph(&self) -> Option<&serde_json::Map<String, Value>> {
        self.value.get("graph").and_then(Value::as_object)
    }

    /// Name, type and uid of every node in the file
    pub fn node_summaries(&self) -> Result<Vec<NodeSummary>, GraphFileError> {
        self.graph()
            .into_iter()
            .flatten()
            .map(|(name, node)| {
                let node_type = node
                    .get("nodeType")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GraphFileError::MissingField {
                        node: name.clone(),
                        field: "nodeType",
                    })?;
                let uid = node
                    .get("uid")
                    .and_then(Value::as_str)
                    .or_else(|| node.pointer("/uids/0").and_then(Value::as_str))
                    .ok_or_else(|| GraphFileError::MissingField {
                        node: name.clone(),
                        field: "uid",
                    })?;

                Ok(NodeSummary {
                    name: name.clone(),
                    node_type: node_type.to_string(),
                    uid: uid.to_string(),
                })
            })
            .collect()
    }

    /// Dependencies derived from `{Node.attribute}` link expressions in node inputs
    pub fn edges(&self) -> Vec<Edge> {
        let Some(graph) = self.graph() else {
            return Vec::new();
        };
        let mut edges = BTreeSet::new();

        for (name, node) in graph {
            let Some(inputs) = node.get("inputs") else {
                continue;
            };
            let mut sources = Vec::new();
            collect_links(inputs, &mut sources);

            for source in sources {
                if source != *name && graph.contains_key(&source) {
                    edges.insert((source, name.clone()));
                }
            }
        }

        edges
            .into_iter()
            .map(|(source, destination)| Edge::new(source, destination))
            .collect()
    }

    /// Nodes and edges ready for a dependency graph.
    ///
    /// `is_accelerated` receives each node type.
    pub fn nodes_and_edges(
        &self,
        is_accelerated: impl Fn(&str) -> bool,
    ) -> Result<(Vec<Node>, Vec<Edge>), GraphFileError> {
        let nodes = self
            .node_summaries()?
            .iter()
            .map(|s| s.to_node(is_accelerated(&s.node_type)))
            .collect();
        Ok((nodes, self.edges()))
    }

    /// Point every viewpoint input at its in-job mount path.
    ///
    /// Returns the upload manifest: remote file name to local absolute path.
    /// Relative inputs are resolved against the graph file's directory.
    pub fn rewrite_input_paths(
        &mut self,
        mount_root: &str,
    ) -> Result<BTreeMap<String, PathBuf>, GraphFileError> {
        let base_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mount_root = mount_root.trim_end_matches('/');
        let mut manifest: BTreeMap<String, PathBuf> = BTreeMap::new();

        let Some(graph) = self.value.get_mut("graph").and_then(Value::as_object_mut) else {
            return Ok(manifest);
        };

        for node in graph.values_mut() {
            let Some(viewpoints) = node
                .pointer_mut("/inputs/viewpoints")
                .and_then(Value::as_array_mut)
            else {
                continue;
            };

            for viewpoint in viewpoints {
                let Some(path) = viewpoint.get("path").and_then(Value::as_str) else {
                    continue;
                };
                let local = PathBuf::from(path);
                let Some(name) = local.file_name().map(|n| n.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let absolute = if local.is_absolute() {
                    local
                } else {
                    base_dir.join(local)
                };

                if let Some(existing) = manifest.get(&name) {
                    if *existing != absolute {
                        return Err(GraphFileError::AmbiguousInput {
                            name,
                            first: existing.clone(),
                            second: absolute,
                        });
                    }
                }

                viewpoint["path"] = Value::String(format!("{}/{}", mount_root, name));
                manifest.insert(name, absolute);
            }
        }

        Ok(manifest)
    }

    /// Write the document as pretty JSON, creating parent directories
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), GraphFileError> {
        let path = path.as_ref();
        let write_err = |source: std::io::Error| GraphFileError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = serde_json::to_string_pretty(&self.value)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        fs::write(path, content).map_err(write_err)
    }
}

/// Collect node names referenced by `{Node.attribute}` strings
fn collect_links(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(inner) = s.trim().strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if let Some((node, attribute)) = inner.split_once('.') {
                    if !node.is_empty() && !attribute.is_empty() {
                        out.push(node.to_string());
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_links(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_links(v, out)),
        _ => {}
    }
}
