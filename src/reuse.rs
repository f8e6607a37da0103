//! Reuse-buffer and point synthesis
//!
//! Each producer tensor is buffered by shift-register chains. A tap at
//! offset `k` holds the value produced `k` cycles ago; consumers read the
//! taps their window points map to. With `U` lanes the taps are split by
//! residue mod `U` into `U` independent chains.
//!
//! Two flavors exist. The unrolled one (time-multiplexed lanes) includes
//! the lane index and the scheduler's edge delay in every tap. The
//! replicated one (independent physical copies, used when clustering)
//! includes neither.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::Serialize;

use crate::graph::{Graph, Tensor};

/// Shift-register chains serving one tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReuseBuffer {
    /// Deepest tap plus one
    pub length: i64,
    /// `(start, end)` links; `start == end` marks a chain entry point
    pub links: Vec<(i64, i64)>,
}

impl ReuseBuffer {
    /// Whether some chain holds a tap at `offset`
    pub fn contains(&self, offset: i64) -> bool {
        self.links.iter().any(|&(_, end)| end == offset)
    }

    pub fn taps(&self) -> impl Iterator<Item = i64> + '_ {
        self.links.iter().map(|&(_, end)| end)
    }
}

/// Buffers of every producer tensor, keyed by tensor name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReusePlan {
    pub buffers: BTreeMap<String, ReuseBuffer>,
    /// Per tensor, FIFO depth of the register ending at each tap
    pub lengths: BTreeMap<String, BTreeMap<i64, i64>>,
    /// Per tensor, where the value at a tap is forwarded next
    pub next_fifo: BTreeMap<String, BTreeMap<i64, i64>>,
}

/// Per consuming stage: tap offset -> lane -> window rank
pub type Points = IndexMap<String, IndexMap<i64, IndexMap<usize, usize>>>;

/// Per consuming stage: tap offset -> window rank
pub type ReplicatedPoints = IndexMap<String, IndexMap<i64, usize>>;

/// Reuse plan for time-multiplexed lanes
pub fn unrolled_reuse_plan(graph: &Graph, unroll_factor: usize) -> ReusePlan {
    build_plan(graph, unroll_factor, |tensor| {
        reuse_chains(graph, tensor, unroll_factor)
    })
}

/// Reuse plan for physically replicated copies
pub fn replicated_reuse_plan(graph: &Graph, replication_factor: usize) -> ReusePlan {
    build_plan(graph, replication_factor, |tensor| {
        replicated_reuse_chains(graph, tensor, replication_factor)
    })
}

fn build_plan(graph: &Graph, factor: usize, chains: impl Fn(&Tensor) -> Vec<Vec<i64>>) -> ReusePlan {
    let mut plan = ReusePlan::default();
    for tensor in graph.tensors().filter(|t| !t.children.is_empty()) {
        let buffer = link_chains(&chains(tensor));
        clilog::debug!("reuse chains of tensor {}: {:?}", tensor.name, buffer);
        plan.lengths.insert(tensor.name.clone(), buffer_lengths(&buffer, factor));
        plan.next_fifo.insert(tensor.name.clone(), next_fifo(&buffer));
        plan.buffers.insert(tensor.name.clone(), buffer);
    }
    plan
}

/// Split the needed taps of `tensor` into one sorted chain per lane.
fn reuse_chains(graph: &Graph, tensor: &Tensor, unroll_factor: usize) -> Vec<Vec<i64>> {
    let mut a_dag = BTreeSet::new();
    for &s in &tensor.children {
        let stage = graph.stage(s);
        let Some(offsets) = stage.offset.get(&tensor.name) else {
            continue;
        };
        let Some(max_offset) = stage.max_offset(&tensor.name) else {
            continue;
        };
        let delay = stage.delay_of(&tensor.name);
        for lane in 0..unroll_factor as i64 {
            a_dag.extend(offsets.iter().map(|x| max_offset + lane - x + delay));
        }
    }
    clilog::debug!("A† of tensor {}: {:?}", tensor.name, a_dag);
    chains_by_residue(&a_dag, unroll_factor)
}

fn replicated_reuse_chains(graph: &Graph, tensor: &Tensor, replication_factor: usize) -> Vec<Vec<i64>> {
    let mut a_dag = BTreeSet::new();
    for &s in &tensor.children {
        let stage = graph.stage(s);
        let Some(offsets) = stage.offset.get(&tensor.name) else {
            continue;
        };
        let Some(max_offset) = stage.max_offset(&tensor.name) else {
            continue;
        };
        a_dag.extend(offsets.iter().map(|x| max_offset - x));
    }
    clilog::debug!("replicated A† of tensor {}: {:?}", tensor.name, a_dag);
    chains_by_residue(&a_dag, replication_factor)
}

/// Chains ordered by descending residue, each sorted ascending
fn chains_by_residue(a_dag: &BTreeSet<i64>, factor: usize) -> Vec<Vec<i64>> {
    let factor = factor as i64;
    (0..factor)
        .rev()
        .map(|residue| {
            a_dag
                .iter()
                .copied()
                .filter(|x| x.rem_euclid(factor) == residue)
                .collect()
        })
        .collect()
}

fn link_chains(chains: &[Vec<i64>]) -> ReuseBuffer {
    let mut links = Vec::new();
    for chain in chains.iter().filter(|c| !c.is_empty()) {
        links.push((chain[0], chain[0]));
        links.extend(chain.windows(2).map(|pair| (pair[0], pair[1])));
    }
    let length = links.iter().map(|&(_, end)| end).max().map_or(0, |deepest| deepest + 1);
    ReuseBuffer { length, links }
}

/// FIFO depth of the register feeding each tap.
///
/// The entry point of a lane holds everything before it; every later
/// register only the distance to its predecessor.
fn buffer_lengths(buffer: &ReuseBuffer, factor: usize) -> BTreeMap<i64, i64> {
    let factor = factor as i64;
    let mut first = vec![true; factor as usize];
    let mut lengths = BTreeMap::new();
    for &(start, end) in &buffer.links {
        let lane = start.rem_euclid(factor) as usize;
        if first[lane] {
            first[lane] = false;
            if start >= factor {
                lengths.insert(end, end / factor);
                continue;
            }
        }
        lengths.insert(end, (end - start) / factor);
    }
    lengths
}

fn next_fifo(buffer: &ReuseBuffer) -> BTreeMap<i64, i64> {
    buffer
        .links
        .iter()
        .filter(|(start, end)| start < end)
        .map(|&(start, end)| (start, end))
        .collect()
}

/// Which window point each lane of each consumer reads at each tap
pub fn unrolled_points(graph: &Graph, tensor: &Tensor, unroll_factor: usize) -> Points {
    let mut all_points = Points::new();
    for &s in &tensor.children {
        let stage = graph.stage(s);
        let points = all_points.entry(stage.name.clone()).or_default();
        let (Some(offsets), Some(max_offset)) =
            (stage.offset.get(&tensor.name), stage.max_offset(&tensor.name))
        else {
            continue;
        };
        let delay = stage.delay_of(&tensor.name);
        for lane in 0..unroll_factor {
            for (rank, offset) in offsets.iter().enumerate() {
                let tap = max_offset - offset + delay + lane as i64;
                points
                    .entry(tap)
                    .or_default()
                    .insert(unroll_factor - 1 - lane, rank);
            }
        }
    }
    for (stage, points) in &all_points {
        for (tap, lanes) in points {
            for (lane, rank) in lanes {
                clilog::debug!(
                    "{} <- {} @ offset={} <=> point #{} @ unroll_index={}",
                    stage,
                    tensor.name,
                    tap,
                    rank,
                    lane
                );
            }
        }
    }
    all_points
}

pub fn replicated_points(graph: &Graph, tensor: &Tensor) -> ReplicatedPoints {
    let mut all_points = ReplicatedPoints::new();
    for &s in &tensor.children {
        let stage = graph.stage(s);
        let points = all_points.entry(stage.name.clone()).or_default();
        let (Some(offsets), Some(max_offset)) =
            (stage.offset.get(&tensor.name), stage.max_offset(&tensor.name))
        else {
            continue;
        };
        for (rank, offset) in offsets.iter().enumerate() {
            points.insert(max_offset - offset, rank);
        }
    }
    clilog::debug!("replicated points of tensor {}: {:?}", tensor.name, all_points);
    all_points
}
