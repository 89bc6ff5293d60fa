use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use txcore::{DefinitionError, FlowDefinition};

/// Dependency graph of a flow document.
///
/// Graph node `i` is the `i`-th task of the document, so positions and
/// indices are interchangeable.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph: DiGraph<String, ()>,
}

impl ExecutionPlan {
    /// Build the graph, rejecting duplicate ids, unknown dependencies and
    /// cycles
    pub fn build(definition: &FlowDefinition) -> Result<Self, DefinitionError> {
        let mut graph = DiGraph::new();
        let mut node_to_index: HashMap<&str, NodeIndex> = HashMap::new();

        for task in &definition.tasks {
            let idx = graph.add_node(task.id.clone());
            if node_to_index.insert(task.id.as_str(), idx).is_some() {
                return Err(DefinitionError::DuplicateNode(task.id.clone()));
            }
        }

        for (position, task) in definition.tasks.iter().enumerate() {
            let to_idx = NodeIndex::new(position);
            for dependency in &task.depends_on {
                let from_idx = node_to_index.get(dependency.as_str()).ok_or_else(|| {
                    DefinitionError::UnknownDependency {
                        node: task.id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                graph.update_edge(*from_idx, to_idx, ());
            }
        }

        if toposort(&graph, None).is_err() {
            return Err(DefinitionError::CyclicDependency);
        }

        Ok(Self { graph })
    }

    /// Reject duplicate node ids; they would share a Task row id
    pub fn check_node_ids(definition: &FlowDefinition) -> Result<(), DefinitionError> {
        let mut seen = HashSet::new();
        for task in &definition.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(DefinitionError::DuplicateNode(task.id.clone()));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Positions of the nodes `position` waits on
    pub fn dependencies(&self, position: usize) -> Vec<usize> {
        self.neighbors(position, Direction::Incoming)
    }

    /// Positions of the nodes waiting on `position`
    pub fn dependents(&self, position: usize) -> Vec<usize> {
        self.neighbors(position, Direction::Outgoing)
    }

    /// Positions with no dependencies
    pub fn roots(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|p| self.dependencies(*p).is_empty())
            .collect()
    }

    fn neighbors(&self, position: usize, direction: Direction) -> Vec<usize> {
        let mut positions: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(position), direction)
            .map(|idx| idx.index())
            .collect();
        positions.sort_unstable();
        positions
    }
}
