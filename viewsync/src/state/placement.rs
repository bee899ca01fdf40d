//! Anchor-based placement for new components.
//!
//! A fixed, ordered grid of anchor points is checked against the positions
//! already in use; the first free anchor wins. When every anchor is taken
//! the planner returns the fallback coordinate and components may overlap.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::types::Position;
use super::MAX_LAYOUT_COLUMNS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub origin_x: i32,
    pub origin_y: i32,
    pub cell_size: i32,
    pub columns: u32,
    pub rows: u32,
    pub fallback_x: i32,
    pub fallback_y: i32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            origin_x: 40,
            origin_y: 40,
            cell_size: 220,
            columns: 3,
            rows: 3,
            fallback_x: 20,
            fallback_y: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlacementPlanner {
    anchors: Vec<Position>,
    fallback: Position,
}

impl PlacementPlanner {
    pub fn new(config: &PlacementConfig) -> Self {
        // Grid dimensions are capped like layout columns; coordinates
        // saturate instead of wrapping.
        let columns = config.columns.min(MAX_LAYOUT_COLUMNS) as i32;
        let rows = config.rows.min(MAX_LAYOUT_COLUMNS) as i32;

        // Row-major: left to right, then top to bottom.
        let mut anchors = Vec::with_capacity((columns * rows) as usize);
        for row in 0..rows {
            for column in 0..columns {
                anchors.push(Position::new(
                    config
                        .origin_x
                        .saturating_add(column.saturating_mul(config.cell_size)),
                    config
                        .origin_y
                        .saturating_add(row.saturating_mul(config.cell_size)),
                ));
            }
        }

        Self {
            anchors,
            fallback: Position::new(config.fallback_x, config.fallback_y),
        }
    }

    pub fn anchors(&self) -> &[Position] {
        &self.anchors
    }

    pub fn fallback(&self) -> Position {
        self.fallback
    }

    /// First anchor not matched exactly by an occupied position.
    pub fn place(&self, occupied: &[Position]) -> Position {
        let taken: HashSet<Position> = occupied.iter().copied().collect();
        self.anchors
            .iter()
            .copied()
            .find(|anchor| !taken.contains(anchor))
            .unwrap_or(self.fallback)
    }
}

impl Default for PlacementPlanner {
    fn default() -> Self {
        Self::new(&PlacementConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_canvas_gets_first_anchor() {
        let planner = PlacementPlanner::default();
        assert_eq!(planner.place(&[]), Position::new(40, 40));
    }

    #[test]
    fn anchors_are_row_major() {
        let planner = PlacementPlanner::default();
        let anchors = planner.anchors();
        assert_eq!(anchors.len(), 9);
        assert_eq!(anchors[1], Position::new(260, 40));
        assert_eq!(anchors[3], Position::new(40, 260));
    }

    #[test]
    fn skips_occupied_anchors_only_on_exact_match() {
        let planner = PlacementPlanner::default();
        let occupied = [Position::new(40, 40), Position::new(261, 40)];
        assert_eq!(planner.place(&occupied), Position::new(260, 40));
    }

    #[test]
    fn full_grid_falls_back() {
        let planner = PlacementPlanner::default();
        let occupied = planner.anchors().to_vec();
        assert_eq!(planner.place(&occupied), planner.fallback());
    }

    #[test]
    fn oversized_grid_config_saturates() {
        let config = PlacementConfig {
            origin_x: i32::MAX - 10,
            cell_size: i32::MAX,
            columns: u32::MAX,
            rows: 2,
            ..PlacementConfig::default()
        };
        let planner = PlacementPlanner::new(&config);
        let anchors = planner.anchors();
        assert_eq!(anchors.len(), (MAX_LAYOUT_COLUMNS * 2) as usize);
        assert_eq!(anchors[0], Position::new(i32::MAX - 10, 40));
        assert_eq!(anchors[1], Position::new(i32::MAX, 40));
        assert_eq!(anchors[MAX_LAYOUT_COLUMNS as usize].y, i32::MAX);
    }

    #[test]
    fn placement_is_deterministic() {
        let planner = PlacementPlanner::default();
        let occupied = [Position::new(260, 40), Position::new(40, 40)];
        let first = planner.place(&occupied);
        for _ in 0..10 {
            assert_eq!(planner.place(&occupied), first);
        }
        let reversed = [Position::new(40, 40), Position::new(260, 40)];
        assert_eq!(planner.place(&reversed), first);
    }
}
