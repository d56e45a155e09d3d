//! Spatial indexing abstractions for agent neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError>;

    /// Visit neighbors of `agent_idx` within the provided squared radius.
    ///
    /// The visitor receives the neighbor's dense index and its squared distance, measured
    /// with wrap-around when the index was built for a toroidal world.
    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    );
}

type CellSpan = SmallVec<[usize; 16]>;

/// Uniform bucket grid covering a `width × height` world.
///
/// Buckets are stored in compressed-row form (`cell_starts` / `entries`) so a rebuild is a
/// counting sort with no per-cell allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing agents.
    pub cell_size: f64,
    pub width: f64,
    pub height: f64,
    /// Whether distances and cell lookups wrap around the world edges.
    pub wrap: bool,
    #[serde(skip)]
    cols: usize,
    #[serde(skip)]
    rows: usize,
    #[serde(skip)]
    positions: Vec<(f64, f64)>,
    #[serde(skip)]
    cell_starts: Vec<usize>,
    #[serde(skip)]
    entries: Vec<usize>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size and world extent.
    #[must_use]
    pub fn new(cell_size: f64, width: f64, height: f64, wrap: bool) -> Self {
        Self {
            cell_size,
            width,
            height,
            wrap,
            cols: 0,
            rows: 0,
            positions: Vec::new(),
            cell_starts: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Number of positions captured by the last rebuild.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn validate(&self) -> Result<(), IndexError> {
        if !(self.cell_size > 0.0) || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if !(self.width > 0.0) || !(self.height > 0.0) {
            return Err(IndexError::InvalidConfig("world extent must be positive"));
        }
        Ok(())
    }

    fn cell_coord(&self, value: f64, extent: f64, count: usize) -> usize {
        let mut v = value;
        if self.wrap {
            v = v.rem_euclid(extent);
        }
        let cell = (v / self.cell_size).floor();
        if cell.is_nan() || cell < 0.0 {
            0
        } else {
            (cell as usize).min(count - 1)
        }
    }

    fn cell_of(&self, (x, y): (f64, f64)) -> usize {
        let cx = self.cell_coord(x, self.width, self.cols);
        let cy = self.cell_coord(y, self.height, self.rows);
        cy * self.cols + cx
    }

    fn axis_delta(&self, delta: f64, extent: f64) -> f64 {
        if !self.wrap {
            return delta;
        }
        let half = extent * 0.5;
        if delta > half {
            delta - extent
        } else if delta < -half {
            delta + extent
        } else {
            delta
        }
    }

    /// Squared distance between two positions honouring wrap-around.
    #[must_use]
    pub fn distance_sq(&self, a: (f64, f64), b: (f64, f64)) -> f64 {
        let dx = self.axis_delta(b.0 - a.0, self.width);
        let dy = self.axis_delta(b.1 - a.1, self.height);
        dx * dx + dy * dy
    }

    fn span(&self, center: usize, reach: usize, count: usize) -> CellSpan {
        let mut cells = CellSpan::new();
        if self.wrap {
            if 2 * reach + 1 >= count {
                cells.extend(0..count);
            } else {
                for offset in 0..=2 * reach {
                    cells.push((center + count + offset - reach) % count);
                }
            }
        } else {
            let lo = center.saturating_sub(reach);
            let hi = (center + reach).min(count - 1);
            cells.extend(lo..=hi);
        }
        cells
    }

    /// Visit every indexed position within `radius_sq` of `origin`, skipping `exclude`.
    pub fn visit_point(
        &self,
        origin: (f64, f64),
        exclude: Option<usize>,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        if self.positions.is_empty() || !(radius_sq >= 0.0) {
            return;
        }
        let reach = (radius_sq.sqrt() / self.cell_size).ceil() as usize;
        let cx = self.cell_coord(origin.0, self.width, self.cols);
        let cy = self.cell_coord(origin.1, self.height, self.rows);
        let xs = self.span(cx, reach, self.cols);
        let ys = self.span(cy, reach, self.rows);
        for &y in &ys {
            for &x in &xs {
                let cell = y * self.cols + x;
                let start = self.cell_starts[cell];
                let end = self.cell_starts[cell + 1];
                for &other in &self.entries[start..end] {
                    if Some(other) == exclude {
                        continue;
                    }
                    let dist_sq = self.distance_sq(origin, self.positions[other]);
                    if dist_sq <= radius_sq {
                        visitor(other, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(5.0, 100.0, 100.0, true)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError> {
        self.validate()?;
        self.cols = ((self.width / self.cell_size).ceil() as usize).max(1);
        self.rows = ((self.height / self.cell_size).ceil() as usize).max(1);
        let cell_count = self.cols * self.rows;

        self.positions.clear();
        self.positions.extend_from_slice(positions);

        self.cell_starts.clear();
        self.cell_starts.resize(cell_count + 1, 0);
        let cells: Vec<usize> = positions.iter().map(|&p| self.cell_of(p)).collect();
        for &cell in &cells {
            self.cell_starts[cell + 1] += 1;
        }
        for i in 0..cell_count {
            self.cell_starts[i + 1] += self.cell_starts[i];
        }

        self.entries.clear();
        self.entries.resize(positions.len(), 0);
        let mut cursor = self.cell_starts.clone();
        for (idx, &cell) in cells.iter().enumerate() {
            self.entries[cursor[cell]] = idx;
            cursor[cell] += 1;
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        let Some(&origin) = self.positions.get(agent_idx) else {
            return;
        };
        self.visit_point(origin, Some(agent_idx), radius_sq, visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(index: &UniformGridIndex, idx: usize, radius: f64) -> Vec<usize> {
        let mut found = Vec::new();
        index.neighbors_within(idx, radius * radius, &mut |other, _| found.push(other));
        found.sort_unstable();
        found
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        let mut index = UniformGridIndex::new(0.0, 10.0, 10.0, true);
        assert_eq!(
            index.rebuild(&[(1.0, 1.0)]),
            Err(IndexError::InvalidConfig("cell_size must be positive"))
        );
    }

    #[test]
    fn matches_brute_force_on_torus() {
        let positions: Vec<(f64, f64)> = (0..60)
            .map(|i| {
                let f = i as f64;
                ((f * 7.3) % 40.0, (f * 13.1) % 40.0)
            })
            .collect();
        let mut index = UniformGridIndex::new(3.0, 40.0, 40.0, true);
        index.rebuild(&positions).expect("rebuild");

        let radius = 6.5;
        for idx in 0..positions.len() {
            let mut expected: Vec<usize> = (0..positions.len())
                .filter(|&other| {
                    other != idx
                        && index.distance_sq(positions[idx], positions[other]) <= radius * radius
                })
                .collect();
            expected.sort_unstable();
            assert_eq!(collect(&index, idx, radius), expected, "agent {idx}");
        }
    }

    #[test]
    fn wrap_finds_neighbors_across_the_seam() {
        let positions = [(0.5, 10.0), (39.5, 10.0)];
        let mut torus = UniformGridIndex::new(2.0, 40.0, 40.0, true);
        torus.rebuild(&positions).expect("rebuild");
        assert_eq!(collect(&torus, 0, 2.0), vec![1]);

        let mut bounded = UniformGridIndex::new(2.0, 40.0, 40.0, false);
        bounded.rebuild(&positions).expect("rebuild");
        assert!(collect(&bounded, 0, 2.0).is_empty());
    }

    #[test]
    fn reported_distance_is_squared() {
        let positions = [(1.0, 1.0), (4.0, 5.0)];
        let mut index = UniformGridIndex::new(1.0, 20.0, 20.0, false);
        index.rebuild(&positions).expect("rebuild");
        let mut seen = Vec::new();
        index.neighbors_within(0, 100.0, &mut |other, dist_sq| {
            seen.push((other, dist_sq.into_inner()));
        });
        assert_eq!(seen, vec![(1, 25.0)]);
    }

    #[test]
    fn large_radius_visits_each_cell_once() {
        let positions = [(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)];
        let mut index = UniformGridIndex::new(4.0, 8.0, 8.0, true);
        index.rebuild(&positions).expect("rebuild");
        assert_eq!(collect(&index, 0, 100.0), vec![1, 2]);
    }
}
