//! Cumulative stencil windows across stage boundaries
//!
//! When a stage keeps the border of a tensor produced several stages
//! upstream, it needs the full footprint it (transitively) reads from that
//! tensor. The footprint is the Minkowski sum of the windows along every
//! producer path, normalized so the consumer's own store index is the
//! origin.

use std::collections::HashMap;
use std::rc::Rc;

use crate::graph::{Graph, TensorId};
use crate::tiling::Window;

/// Memo of aggregated windows keyed by `(source, consumer)`
pub type WindowMemo = HashMap<(TensorId, TensorId), Rc<Window>>;

/// Every offset `consumer` effectively reads from `source`.
///
/// Producer edges form a DAG, so the recursion always bottoms out at the
/// source or at the primary input (which yields an empty window).
pub fn overall_stencil_window(
    graph: &Graph,
    memo: &mut WindowMemo,
    source: TensorId,
    consumer: TensorId,
) -> Rc<Window> {
    if let Some(window) = memo.get(&(source, consumer)) {
        return Rc::clone(window);
    }

    let src = graph.tensor(source);
    let dst = graph.tensor(consumer);
    let mut all_points = Window::new();
    if let Some(parent) = dst.parent {
        let stage = graph.stage(parent);
        for (name, points) in &stage.window {
            if *name == src.name {
                all_points.extend(points.iter().map(|point| sub(point, &dst.idx)));
                continue;
            }
            let Some(&intermediate) = stage.inputs.get(name) else {
                continue;
            };
            let recursive = overall_stencil_window(graph, memo, source, intermediate);
            for point in points {
                for p in recursive.iter() {
                    all_points.insert(p.iter().zip(point).zip(&dst.idx).map(|((a, b), c)| a + b - c).collect());
                }
            }
        }
    }
    clilog::debug!(
        "overall stencil window of {} <- {} is {:?} ({} points)",
        dst.name,
        src.name,
        all_points,
        all_points.len()
    );

    let window = Rc::new(all_points);
    memo.insert((source, consumer), Rc::clone(&window));
    window
}

fn sub(a: &[i64], b: &[i64]) -> Vec<i64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}
