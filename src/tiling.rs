//! Tile geometry and coordinate serialization
//!
//! Every N-dimensional relative index is linearized in raster-scan order
//! within a tile. The resulting scalar is the time axis used by the
//! scheduler and by all buffer length computations:
//!
//! `serialize(v) = v[0] + v[1]*T[0] + v[2]*T[0]*T[1] + ...`
//!
//! The last tile extent never contributes, which is why it may be left 0
//! (unbounded).

use std::collections::BTreeSet;

/// A set of relative index vectors
pub type Window = BTreeSet<Vec<i64>>;

/// Linearize one index vector
pub fn serialize(idx: &[i64], tile_size: &[i64]) -> i64 {
    let mut stride = 1;
    let mut offset = 0;
    for (d, &x) in idx.iter().enumerate() {
        if d > 0 {
            stride *= tile_size.get(d - 1).copied().unwrap_or(1);
        }
        offset += x * stride;
    }
    offset
}

/// Linearize every vector of a sequence, preserving order
pub fn serialize_all<'a>(
    idxs: impl IntoIterator<Item = &'a Vec<i64>>,
    tile_size: &[i64],
) -> Vec<i64> {
    idxs.into_iter().map(|idx| serialize(idx, tile_size)).collect()
}

/// Per-dimension shift that moves a store-normalized window to a
/// non-negative origin
pub fn window_offset(window: &Window, dim: usize) -> Vec<i64> {
    (0..dim)
        .map(|d| {
            window
                .iter()
                .filter_map(|p| p.get(d))
                .min()
                .map_or(0, |min| -min)
        })
        .collect()
}

/// Per-dimension extent of a window
pub fn stencil_dim(window: &Window, dim: usize) -> Vec<i64> {
    (0..dim)
        .map(|d| {
            let coords = window.iter().filter_map(|p| p.get(d).copied());
            let (lo, hi) = coords.fold((i64::MAX, i64::MIN), |(lo, hi), x| (lo.min(x), hi.max(x)));
            if lo > hi {
                0
            } else {
                hi - lo + 1
            }
        })
        .collect()
}

/// Total depth in cycles spanned by a window
pub fn stencil_distance(window: &Window, tile_size: &[i64]) -> i64 {
    let deepest = serialize_all(window, tile_size).into_iter().max().unwrap_or(0);
    deepest + serialize(&window_offset(window, tile_size.len()), tile_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_raster_order() {
        let tile = [233, 0];
        assert_eq!(serialize(&[0, 0], &tile), 0);
        assert_eq!(serialize(&[1, 0], &tile), 1);
        assert_eq!(serialize(&[0, 1], &tile), 233);
        assert_eq!(serialize(&[-1, -1], &tile), -234);
        assert_eq!(serialize(&[233, 42], &tile), 233 + 42 * 233);
    }

    #[test]
    fn test_serialize_three_dims() {
        let tile = [4, 5, 0];
        assert_eq!(serialize(&[1, 2, 3], &tile), 1 + 2 * 4 + 3 * 20);
    }

    #[test]
    fn test_serialize_all_keeps_order() {
        let idxs = vec![vec![1, 0], vec![0, 1], vec![-1, 0]];
        assert_eq!(serialize_all(&idxs, &[10, 0]), vec![1, 10, -1]);
    }

    #[test]
    fn test_window_geometry() {
        let window: Window = [vec![-1, 0], vec![0, 0], vec![1, 0], vec![0, -1], vec![0, 1]]
            .into_iter()
            .collect();
        let tile = [10, 0];
        assert_eq!(window_offset(&window, 2), vec![1, 1]);
        assert_eq!(stencil_dim(&window, 2), vec![3, 3]);
        // deepest point (0, 1) -> 10, offset (1, 1) -> 11
        assert_eq!(stencil_distance(&window, &tile), 21);
    }

    #[test]
    fn test_empty_window() {
        let window = Window::new();
        assert_eq!(window_offset(&window, 2), vec![0, 0]);
        assert_eq!(stencil_dim(&window, 2), vec![0, 0]);
        assert_eq!(stencil_distance(&window, &[8, 0]), 0);
    }
}
