//! Tensor/stage dataflow graph
//!
//! Tensors and stages live in one arena owned by the [`Graph`] and refer to
//! each other through [`TensorId`] and [`StageId`] handles, so the
//! producer/consumer back-references never form ownership cycles.

use std::collections::BTreeMap;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::ast::{ScalarType, StageExpr};
use crate::tiling::{serialize, serialize_all};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StageId(pub usize);

/// A named data stream
#[derive(Debug, Clone)]
pub struct Tensor {
    pub id: TensorId,
    pub name: String,
    pub scalar_type: ScalarType,
    pub channel_count: usize,
    /// Store index of the defining expression (all zeros for the input)
    pub idx: Vec<i64>,
    /// Producing stage; `None` for the primary input
    pub parent: Option<StageId>,
    /// Consuming stages in wiring order
    pub children: IndexSet<StageId>,
    /// Production time on the serialized axis
    pub offset: i64,
    /// Stages that receive this tensor's border values
    pub preserve_border_to: Option<IndexSet<StageId>>,
}

impl Tensor {
    pub fn is_output(&self) -> bool {
        self.children.is_empty()
    }
}

/// A production rule reading windows of its inputs and writing one tensor
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    /// Same as the output tensor's name
    pub name: String,
    /// Same as the output tensor's store index
    pub idx: Vec<i64>,
    /// Relative indices read from each input, sorted by serialized offset
    pub window: BTreeMap<String, Vec<Vec<i64>>>,
    /// `window` serialized
    pub offset: BTreeMap<String, Vec<i64>>,
    /// Extra cycles each input is held before it is consumed
    pub delay: BTreeMap<String, i64>,
    pub exprs: Vec<StageExpr>,
    pub inputs: BTreeMap<String, TensorId>,
    pub output: TensorId,
    /// Tensor whose border values this stage keeps
    pub preserve_border_from: Option<TensorId>,
}

impl Stage {
    pub fn is_input(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Largest serialized offset read from `input`
    pub fn max_offset(&self, input: &str) -> Option<i64> {
        self.offset.get(input).and_then(|o| o.last().copied())
    }

    pub fn delay_of(&self, input: &str) -> i64 {
        self.delay.get(input).copied().unwrap_or(0)
    }
}

/// Arena of tensors and stages
#[derive(Debug, Clone, Default)]
pub struct Graph {
    tensors: Vec<Tensor>,
    stages: Vec<Stage>,
    tensor_ids: IndexMap<String, TensorId>,
    stage_ids: IndexMap<String, StageId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(
        &mut self,
        name: &str,
        scalar_type: ScalarType,
        channel_count: usize,
        idx: Vec<i64>,
    ) -> TensorId {
        let id = TensorId(self.tensors.len());
        self.tensors.push(Tensor {
            id,
            name: name.to_string(),
            scalar_type,
            channel_count,
            idx,
            parent: None,
            children: IndexSet::new(),
            offset: 0,
            preserve_border_to: None,
        });
        self.tensor_ids.insert(name.to_string(), id);
        id
    }

    /// Create the stage producing `output` and wire both directions of
    /// every producer/consumer edge.
    pub fn add_stage(
        &mut self,
        output: TensorId,
        window: BTreeMap<String, Vec<Vec<i64>>>,
        exprs: Vec<StageExpr>,
        inputs: BTreeMap<String, TensorId>,
        tile_size: &[i64],
    ) -> StageId {
        let id = StageId(self.stages.len());
        let offset = window
            .iter()
            .map(|(name, points)| (name.clone(), serialize_all(points, tile_size)))
            .collect();
        let (name, idx) = {
            let tensor = &self.tensors[output.0];
            (tensor.name.clone(), tensor.idx.clone())
        };
        for input in inputs.values() {
            self.tensors[input.0].children.insert(id);
        }
        self.tensors[output.0].parent = Some(id);
        self.stages.push(Stage {
            id,
            name: name.clone(),
            idx,
            window,
            offset,
            delay: BTreeMap::new(),
            exprs,
            inputs,
            output,
            preserve_border_from: None,
        });
        self.stage_ids.insert(name, id);
        id
    }

    /// Make `stage` read `input` at the given points, keeping the window
    /// sorted by serialized offset.
    pub fn add_stage_input(
        &mut self,
        stage: StageId,
        input: TensorId,
        points: Vec<Vec<i64>>,
        tile_size: &[i64],
    ) {
        let name = self.tensors[input.0].name.clone();
        let mut points = points;
        points.sort_by_key(|p| serialize(p, tile_size));
        let offsets = serialize_all(&points, tile_size);
        let s = &mut self.stages[stage.0];
        s.window.insert(name.clone(), points);
        s.offset.insert(name.clone(), offsets);
        s.inputs.insert(name, input);
        self.tensors[input.0].children.insert(stage);
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id.0]
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.0]
    }

    pub fn stage_mut(&mut self, id: StageId) -> &mut Stage {
        &mut self.stages[id.0]
    }

    pub fn tensor_id(&self, name: &str) -> Option<TensorId> {
        self.tensor_ids.get(name).copied()
    }

    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.stage_ids.get(name).copied()
    }

    /// Tensors in creation order
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.iter()
    }

    /// Stages in creation order
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// No producer, or a producer that reads nothing
    pub fn is_input(&self, id: TensorId) -> bool {
        match self.tensor(id).parent {
            None => true,
            Some(stage) => self.stage(stage).is_input(),
        }
    }

    /// Whether `id` produces the pipeline output
    pub fn is_output_stage(&self, id: StageId) -> bool {
        self.tensor(self.stage(id).output).is_output()
    }

    pub fn preserve_border_from(&self, id: TensorId) -> Option<TensorId> {
        self.tensor(id)
            .parent
            .and_then(|stage| self.stage(stage).preserve_border_from)
    }

    /// Name of some tensor that (transitively) depends on itself
    pub fn find_cycle(&self) -> Option<&str> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        fn visit(graph: &Graph, id: TensorId, marks: &mut [Mark]) -> Option<TensorId> {
            match marks[id.0] {
                Mark::Done => return None,
                Mark::Active => return Some(id),
                Mark::Unvisited => {}
            }
            marks[id.0] = Mark::Active;
            if let Some(stage) = graph.tensor(id).parent {
                for &input in graph.stage(stage).inputs.values() {
                    if let Some(found) = visit(graph, input, marks) {
                        return Some(found);
                    }
                }
            }
            marks[id.0] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.tensors.len()];
        (0..self.tensors.len())
            .find_map(|i| visit(self, TensorId(i), &mut marks))
            .map(|id| self.tensor(id).name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Load, StageExpr};

    fn window(name: &str, points: &[[i64; 2]]) -> BTreeMap<String, Vec<Vec<i64>>> {
        let mut w = BTreeMap::new();
        w.insert(name.to_string(), points.iter().map(|p| p.to_vec()).collect());
        w
    }

    #[test]
    fn test_stage_wiring() {
        let mut graph = Graph::new();
        let input = graph.add_tensor("input", ScalarType::Uint16, 1, vec![0, 0]);
        let tmp = graph.add_tensor("tmp", ScalarType::Uint16, 1, vec![0, 0]);
        let exprs = vec![StageExpr::new(vec![0, 0], vec![Load::new("input", vec![1, 0])])];
        let inputs = [("input".to_string(), input)].into_iter().collect();
        let stage = graph.add_stage(tmp, window("input", &[[-1, 0], [1, 0]]), exprs, inputs, &[10, 0]);

        assert_eq!(graph.tensor(tmp).parent, Some(stage));
        assert!(graph.tensor(input).children.contains(&stage));
        assert_eq!(graph.stage(stage).name, "tmp");
        assert_eq!(graph.stage(stage).offset["input"], vec![-1, 1]);
        assert_eq!(graph.stage(stage).max_offset("input"), Some(1));
        assert!(graph.is_input(input));
        assert!(!graph.is_input(tmp));
        assert!(graph.tensor(tmp).is_output());
        assert!(graph.is_output_stage(stage));
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn test_find_cycle() {
        let mut graph = Graph::new();
        let a = graph.add_tensor("a", ScalarType::Int32, 1, vec![0]);
        let b = graph.add_tensor("b", ScalarType::Int32, 1, vec![0]);
        graph.add_stage(a, BTreeMap::new(), vec![], [("b".to_string(), b)].into_iter().collect(), &[0]);
        graph.add_stage(b, BTreeMap::new(), vec![], [("a".to_string(), a)].into_iter().collect(), &[0]);
        assert!(graph.find_cycle().is_some());
    }

    #[test]
    fn test_add_stage_input_sorts_window() {
        let mut graph = Graph::new();
        let input = graph.add_tensor("input", ScalarType::Uint8, 1, vec![0, 0]);
        let out = graph.add_tensor("out", ScalarType::Uint8, 1, vec![0, 0]);
        let stage = graph.add_stage(out, BTreeMap::new(), vec![], BTreeMap::new(), &[4, 0]);
        graph.add_stage_input(stage, input, vec![vec![0, 1], vec![1, 0]], &[4, 0]);
        assert_eq!(graph.stage(stage).window["input"], vec![vec![1, 0], vec![0, 1]]);
        assert_eq!(graph.stage(stage).offset["input"], vec![1, 4]);
        assert!(graph.tensor(input).children.contains(&stage));
    }
}
