//! Spatial indexing abstractions for particle neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from particle positions.
    fn rebuild(&mut self, positions: &[[f32; 3]]) -> Result<(), IndexError>;

    /// Visit neighbors of `particle_idx` within the provided squared radius.
    ///
    /// The probe particle itself is never reported. Visitation order is
    /// deterministic for a fixed position ordering: cells are walked in
    /// ascending x, then y, then z, and entries within a cell retain
    /// insertion (particle index) order.
    fn neighbors_within(
        &self,
        particle_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform grid over a bounded cube `[-half_extent, half_extent]^3`.
///
/// Positions outside the bounds are clamped into the edge cells rather than
/// wrapped: the simulated world is a closed box, not a torus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing particles.
    pub cell_size: f32,
    /// Half extent of the indexed cube along every axis.
    pub half_extent: f32,
    #[serde(skip)]
    cells_per_axis: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<[f32; 3]>,
}

impl UniformGridIndex {
    /// Create a new uniform grid covering `[-half_extent, half_extent]^3`.
    #[must_use]
    pub fn new(cell_size: f32, half_extent: f32) -> Self {
        let cells_per_axis = if cell_size > 0.0 && half_extent > 0.0 {
            ((2.0 * half_extent / cell_size).ceil() as usize).max(1)
        } else {
            1
        };
        Self {
            cell_size,
            half_extent,
            cells_per_axis,
            buckets: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Number of cells along each axis.
    #[must_use]
    pub const fn cells_per_axis(&self) -> usize {
        self.cells_per_axis
    }

    /// Number of positions captured by the most recent rebuild.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when no positions have been indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[inline]
    fn axis_cell(&self, value: f32) -> usize {
        let shifted = value + self.half_extent;
        let cell = (shifted / self.cell_size).floor();
        if cell < 0.0 {
            0
        } else {
            (cell as usize).min(self.cells_per_axis - 1)
        }
    }

    #[inline]
    fn cell_of(&self, position: [f32; 3]) -> (usize, usize, usize) {
        (
            self.axis_cell(position[0]),
            self.axis_cell(position[1]),
            self.axis_cell(position[2]),
        )
    }

    #[inline]
    fn bucket_offset(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.cells_per_axis + y) * self.cells_per_axis + x
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(3.0, 10.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[[f32; 3]]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self.half_extent <= 0.0 || !self.half_extent.is_finite() {
            return Err(IndexError::InvalidConfig("half_extent must be positive"));
        }

        // Recomputed here so a deserialized index heals on its first rebuild.
        self.cells_per_axis = ((2.0 * self.half_extent / self.cell_size).ceil() as usize).max(1);

        let bucket_count = self.cells_per_axis.pow(3);
        if self.buckets.len() != bucket_count {
            self.buckets.resize_with(bucket_count, Vec::new);
        }
        for bucket in &mut self.buckets {
            bucket.clear();
        }

        self.positions.clear();
        self.positions.extend_from_slice(positions);

        for (idx, position) in positions.iter().enumerate() {
            let (x, y, z) = self.cell_of(*position);
            let offset = self.bucket_offset(x, y, z);
            self.buckets[offset].push(idx);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        particle_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(probe) = self.positions.get(particle_idx).copied() else {
            return;
        };
        if radius_sq <= 0.0 || !radius_sq.is_finite() {
            return;
        }

        let span = (radius_sq.sqrt() / self.cell_size).ceil() as isize;
        let (cx, cy, cz) = self.cell_of(probe);
        let limit = self.cells_per_axis as isize;

        for dx in -span..=span {
            let x = cx as isize + dx;
            if x < 0 || x >= limit {
                continue;
            }
            for dy in -span..=span {
                let y = cy as isize + dy;
                if y < 0 || y >= limit {
                    continue;
                }
                for dz in -span..=span {
                    let z = cz as isize + dz;
                    if z < 0 || z >= limit {
                        continue;
                    }
                    let offset = self.bucket_offset(x as usize, y as usize, z as usize);
                    for &other in &self.buckets[offset] {
                        if other == particle_idx {
                            continue;
                        }
                        let p = self.positions[other];
                        let ddx = p[0] - probe[0];
                        let ddy = p[1] - probe[1];
                        let ddz = p[2] - probe[2];
                        let dist_sq = ddx * ddx + ddy * ddy + ddz * ddz;
                        if dist_sq <= radius_sq {
                            visitor(other, OrderedFloat(dist_sq));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_neighbors(index: &UniformGridIndex, idx: usize, radius_sq: f32) -> Vec<(usize, f32)> {
        let mut found = Vec::new();
        index.neighbors_within(idx, radius_sq, &mut |other, dist_sq| {
            found.push((other, dist_sq.into_inner()));
        });
        found
    }

    #[test]
    fn rebuild_rejects_bad_configuration() {
        let mut zero_cell = UniformGridIndex::new(0.0, 10.0);
        assert!(zero_cell.rebuild(&[[0.0; 3]]).is_err());

        let mut zero_extent = UniformGridIndex::new(2.0, 0.0);
        assert!(zero_extent.rebuild(&[[0.0; 3]]).is_err());
    }

    #[test]
    fn finds_neighbors_within_radius_and_excludes_self() {
        let mut index = UniformGridIndex::new(2.0, 10.0);
        let positions = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 2.5, 0.0],
            [9.0, 9.0, 9.0],
        ];
        index.rebuild(&positions).expect("rebuild");

        let found = collect_neighbors(&index, 0, 9.0);
        let indices: Vec<usize> = found.iter().map(|(idx, _)| *idx).collect();
        assert!(indices.contains(&1));
        assert!(indices.contains(&2));
        assert!(!indices.contains(&0), "probe must not report itself");
        assert!(!indices.contains(&3), "far particle outside radius");

        let dist_to_1 = found
            .iter()
            .find(|(idx, _)| *idx == 1)
            .map(|(_, d)| *d)
            .expect("neighbor 1");
        assert!((dist_to_1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn visitation_order_is_deterministic() {
        let mut index = UniformGridIndex::new(1.5, 10.0);
        let positions: Vec<[f32; 3]> = (0..24)
            .map(|i| {
                let f = i as f32;
                [(f * 0.37).sin() * 8.0, (f * 0.53).cos() * 8.0, (f * 0.71).sin() * 8.0]
            })
            .collect();
        index.rebuild(&positions).expect("rebuild");

        let first = collect_neighbors(&index, 5, 16.0);
        let second = collect_neighbors(&index, 5, 16.0);
        assert_eq!(first, second);

        index.rebuild(&positions).expect("rebuild again");
        let third = collect_neighbors(&index, 5, 16.0);
        assert_eq!(first, third, "rebuild with same input preserves order");
    }

    #[test]
    fn out_of_bounds_positions_clamp_to_edge_cells() {
        let mut index = UniformGridIndex::new(2.0, 4.0);
        let positions = [[100.0, 100.0, 100.0], [3.9, 3.9, 3.9]];
        index.rebuild(&positions).expect("rebuild");

        // Both land in the corner cell; the true squared distance still gates.
        let found = collect_neighbors(&index, 1, 1.0e6);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 0);
    }

    #[test]
    fn empty_index_reports_nothing() {
        let mut index = UniformGridIndex::new(2.0, 4.0);
        index.rebuild(&[]).expect("rebuild");
        assert!(index.is_empty());
        assert!(collect_neighbors(&index, 0, 4.0).is_empty());
    }
}
