use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::delegate::DelegateRegistry;
use super::stage::StageSpec;
use crate::core::errors::{Result, StagehandError};
use crate::operation::OperationRegistry;

/// A validated, acyclic graph of stages
///
/// Construction fails with `InvalidPipeline` on any structural problem, so a
/// graph that exists can be run.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    description: Option<String>,
    stages: BTreeMap<String, Arc<StageSpec>>,
    order: Vec<String>,
    levels: Vec<Vec<String>>,
}

impl PipelineGraph {
    pub fn build(
        name: impl Into<String>,
        specs: Vec<StageSpec>,
        registry: &OperationRegistry,
    ) -> Result<Self> {
        let name = name.into();
        if specs.is_empty() {
            return Err(StagehandError::invalid_pipeline(format!(
                "pipeline '{}' has no stages",
                name
            )));
        }

        let mut stages: BTreeMap<String, Arc<StageSpec>> = BTreeMap::new();
        for spec in specs {
            if spec.id.trim().is_empty() {
                return Err(StagehandError::invalid_pipeline("stage id cannot be empty"));
            }
            if spec.output_key.trim().is_empty() {
                return Err(StagehandError::invalid_stage(&spec.id, "output key cannot be empty"));
            }
            if stages.contains_key(&spec.id) {
                return Err(StagehandError::invalid_stage(&spec.id, "declared more than once"));
            }
            stages.insert(spec.id.clone(), Arc::new(spec));
        }

        check_operations(&stages, registry)?;

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();
        for id in stages.keys() {
            indices.insert(id.clone(), graph.add_node(id.clone()));
        }
        for (id, spec) in &stages {
            for dep in &spec.depends_on {
                let dep_index = indices.get(dep).ok_or_else(|| {
                    StagehandError::invalid_stage(id, format!("depends on unknown stage '{}'", dep))
                })?;
                graph.add_edge(*dep_index, indices[id], ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let id = graph[cycle.node_id()].clone();
            StagehandError::invalid_stage(id, "is part of a dependency cycle")
        })?;

        let mut node_levels: HashMap<NodeIndex, usize> = HashMap::new();
        let mut levels: Vec<Vec<String>> = Vec::new();
        for index in &sorted {
            let level = graph
                .edges_directed(*index, Direction::Incoming)
                .map(|edge| node_levels.get(&edge.source()).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            node_levels.insert(*index, level);
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(graph[*index].clone());
        }
        for level in levels.iter_mut() {
            level.sort();
        }
        let order = sorted.iter().map(|i| graph[*i].clone()).collect();

        let mut writers: HashMap<&str, &str> = HashMap::new();
        for spec in stages.values() {
            if let Some(other) = writers.insert(spec.output_key.as_str(), spec.id.as_str()) {
                warn!(
                    pipeline = %name,
                    output_key = %spec.output_key,
                    first = other,
                    second = %spec.id,
                    "Two stages share an output key; the later write will be rejected"
                );
            }
        }

        info!(
            pipeline = %name,
            stages = stages.len(),
            levels = levels.len(),
            "Built pipeline graph"
        );

        Ok(Self {
            name,
            description: None,
            stages,
            order,
            levels,
        })
    }

    /// Resolve a declarative definition against named delegates
    pub fn from_definition(
        definition: PipelineDefinition,
        delegates: &DelegateRegistry,
        registry: &OperationRegistry,
    ) -> Result<Self> {
        let mut specs = Vec::with_capacity(definition.stages.len());
        for stage in definition.stages {
            let delegate = delegates.get(&stage.delegate).ok_or_else(|| {
                StagehandError::invalid_stage(
                    &stage.id,
                    format!("uses unknown delegate '{}'", stage.delegate),
                )
            })?;
            let mut spec = StageSpec::new(stage.id, delegate);
            spec.requirements.extend(stage.requires);
            spec.operations.extend(stage.operations);
            spec.depends_on.extend(stage.depends_on);
            if let Some(key) = stage.output_key {
                spec.output_key = key;
            }
            spec.timeout = stage.timeout_ms.map(Duration::from_millis);
            specs.push(spec);
        }
        let mut graph = Self::build(definition.name, specs, registry)?;
        graph.description = definition.description;
        Ok(graph)
    }

    /// Re-check operation names against the registry a run will use
    pub fn validate_against(&self, registry: &OperationRegistry) -> Result<()> {
        check_operations(&self.stages, registry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    pub fn stage(&self, id: &str) -> Option<&Arc<StageSpec>> {
        self.stages.get(id)
    }

    pub fn stages(&self) -> impl Iterator<Item = &Arc<StageSpec>> {
        self.stages.values()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage ids grouped by dependency depth; each group may run concurrently
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// A topological order of stage ids
    pub fn order(&self) -> &[String] {
        &self.order
    }
}

fn check_operations(
    stages: &BTreeMap<String, Arc<StageSpec>>,
    registry: &OperationRegistry,
) -> Result<()> {
    for (id, spec) in stages {
        for operation in &spec.requirements {
            if !registry.contains(operation) {
                return Err(StagehandError::invalid_stage(
                    id,
                    format!("requires unknown operation '{}'", operation),
                ));
            }
        }
        for operation in &spec.operations {
            if !registry.contains(operation) {
                return Err(StagehandError::invalid_stage(
                    id,
                    format!("allows unknown operation '{}'", operation),
                ));
            }
        }
    }
    Ok(())
}

/// Serializable pipeline description, with delegates referenced by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,
    pub delegate: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PipelineDefinition {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| StagehandError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }
}
