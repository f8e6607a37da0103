//! Causal scheduling of tensors on the serialized time axis
//!
//! Walks the graph breadth-first from the primary input. A stage is
//! scheduled once all of its inputs are, at the earliest offset where every
//! input window is fully available; inputs that arrive earlier than needed
//! get a delay on that edge. Offsets are assigned greedily and never
//! revisited.

use std::collections::{HashSet, VecDeque};

use crate::error::{StencilError, StencilResult};
use crate::graph::{Graph, StageId, TensorId};
use crate::tiling::serialize;

/// Assign every tensor its offset and every stage edge its delay.
///
/// Returns the tensors in the order they were scheduled, input first.
pub fn schedule(graph: &mut Graph, input: TensorId, tile_size: &[i64]) -> StencilResult<Vec<TensorId>> {
    check_reachable(graph, input)?;

    let mut queue = VecDeque::from([input]);
    let mut processed = HashSet::from([input]);
    let mut chronological = vec![input];
    clilog::debug!(
        "tensor {} is at offset {}",
        graph.tensor(input).name,
        graph.tensor(input).offset
    );

    while let Some(b) = queue.pop_front() {
        clilog::debug!("inspecting tensor {}'s children", graph.tensor(b).name);
        let children: Vec<StageId> = graph.tensor(b).children.iter().copied().collect();
        for s in children {
            let stage = graph.stage(s);
            let output = stage.output;
            let inputs: Vec<TensorId> = stage.inputs.values().copied().collect();
            if !inputs.iter().all(|t| processed.contains(t)) {
                for t in inputs {
                    if !processed.contains(&t) && !queue.contains(&t) {
                        clilog::debug!(
                            "tensor {} requires tensor {} which isn't processed yet",
                            stage.name,
                            graph.tensor(t).name
                        );
                        queue.push_back(t);
                    }
                }
                continue;
            }
            if processed.contains(&output) {
                continue;
            }

            clilog::debug!(
                "intend to generate tensor {} at offset {}",
                stage.name,
                graph.tensor(output).offset
            );
            let offset = synchronize(graph, s, tile_size);
            graph.tensor_mut(output).offset = offset;
            clilog::debug!("decide to generate tensor {} at offset {}", graph.stage(s).name, offset);
            assign_delays(graph, s, tile_size);

            processed.insert(output);
            queue.push_back(output);
            chronological.push(output);
        }
    }

    if processed.len() != graph.tensor_count() {
        let missing: Vec<&str> = graph
            .tensors()
            .filter(|t| !processed.contains(&t.id))
            .map(|t| t.name.as_str())
            .collect();
        return Err(StencilError::internal(format!(
            "tensor(s) {} were never scheduled",
            missing.join(", ")
        )));
    }
    Ok(chronological)
}

/// Time at which input `tensor` has produced everything `stage` reads
/// from it, relative to the stage's own store offset.
pub fn required_availability(graph: &Graph, stage: StageId, tensor: TensorId, tile_size: &[i64]) -> i64 {
    let stage = graph.stage(stage);
    let tensor = graph.tensor(tensor);
    let stage_offset = serialize(&stage.idx, tile_size);
    let distance = stage.max_offset(&tensor.name).unwrap_or(0);
    tensor.offset + distance - stage_offset
}

/// Earliest output offset at which every input window is available.
fn synchronize(graph: &Graph, s: StageId, tile_size: &[i64]) -> i64 {
    let stage = graph.stage(s);
    let stage_offset = serialize(&stage.idx, tile_size);
    let mut offset = graph.tensor(stage.output).offset;
    for (name, &t) in &stage.inputs {
        let loads = stage.offset.get(name).map(Vec::as_slice).unwrap_or(&[]);
        let (lo, hi) = match (loads.first(), loads.last()) {
            (Some(&min), Some(&max)) => (stage_offset - max, stage_offset - min),
            _ => (0, 0),
        };
        clilog::debug!(
            "want to access tensor {} at offset [{}, {}] to generate tensor {} at offset {}",
            name,
            offset + lo,
            offset + hi,
            stage.name,
            offset
        );
        let available = required_availability(graph, s, t, tile_size);
        if offset < available {
            clilog::debug!("but tensor {} won't be available until offset {}", name, available);
            offset = available;
        }
    }
    offset
}

fn assign_delays(graph: &mut Graph, s: StageId, tile_size: &[i64]) {
    let stage = graph.stage(s);
    let output_offset = graph.tensor(stage.output).offset;
    let delays: Vec<(String, i64)> = stage
        .inputs
        .iter()
        .map(|(name, &t)| {
            let arrival = required_availability(graph, s, t, tile_size);
            let delay = output_offset - arrival;
            if delay > 0 {
                clilog::debug!(
                    "tensor {} arrives at tensor {} at offset {} < {}; add {} delay",
                    name,
                    stage.name,
                    arrival,
                    output_offset,
                    delay
                );
            }
            (name.clone(), delay.max(0))
        })
        .collect();
    graph.stage_mut(s).delay.extend(delays);
}

/// Every tensor must be reachable from the input through consumer edges.
fn check_reachable(graph: &Graph, input: TensorId) -> StencilResult<()> {
    let mut seen = HashSet::from([input]);
    let mut stack = vec![input];
    while let Some(t) = stack.pop() {
        for &s in &graph.tensor(t).children {
            let output = graph.stage(s).output;
            if seen.insert(output) {
                stack.push(output);
            }
        }
    }
    if let Some(orphan) = graph.tensors().find(|t| !seen.contains(&t.id)) {
        return Err(StencilError::internal(format!(
            "dependency graph is disconnected: tensor {} cannot be reached from {}",
            orphan.name,
            graph.tensor(input).name
        )));
    }
    Ok(())
}
