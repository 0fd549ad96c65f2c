//! Point-in-polygon partition of a frame's detections against one zone.
//!
//! The reference point is the bbox bottom-center (`BBox::anchor`). Points
//! lying exactly on an edge or vertex count as inside.

use crate::{Detection, Point};

/// Indices into the evaluated detection slice. Disjoint; together they cover
/// every index exactly once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainmentPartition {
    pub inside: Vec<usize>,
    pub outside: Vec<usize>,
}

impl ContainmentPartition {
    pub fn len(&self) -> usize {
        self.inside.len() + self.outside.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-detection inside flags, in input order.
pub fn inside_flags(polygon: &[Point], detections: &[Detection]) -> Vec<bool> {
    detections
        .iter()
        .map(|det| {
            let (x, y) = det.bbox.anchor();
            contains_point(polygon, x, y)
        })
        .collect()
}

pub fn partition(polygon: &[Point], detections: &[Detection]) -> ContainmentPartition {
    let mut out = ContainmentPartition::default();
    for (idx, inside) in inside_flags(polygon, detections).into_iter().enumerate() {
        if inside {
            out.inside.push(idx);
        } else {
            out.outside.push(idx);
        }
    }
    out
}

/// Even-odd ray casting with an explicit on-edge check.
pub fn contains_point(polygon: &[Point], x: f64, y: f64) -> bool {
    if polygon.len() < crate::MIN_POLYGON_POINTS {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].x as f64, polygon[i].y as f64);
        let (xj, yj) = (polygon[j].x as f64, polygon[j].y as f64);
        if on_segment(xi, yi, xj, yj, x, y) {
            return true;
        }
        if (yi > y) != (yj > y) {
            let cross_x = xi + (y - yi) * (xj - xi) / (yj - yi);
            if x < cross_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(x1: f64, y1: f64, x2: f64, y2: f64, px: f64, py: f64) -> bool {
    let cross = (x2 - x1) * (py - y1) - (y2 - y1) * (px - x1);
    if cross.abs() > f64::EPSILON {
        return false;
    }
    px >= x1.min(x2) && px <= x1.max(x2) && py >= y1.min(y2) && py <= y1.max(y2)
}
