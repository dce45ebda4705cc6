//! Built-in affinity functions.

use crate::detection::BBox3D;

/// Intersection over Union of two axis-aligned 3D boxes.
///
/// Returns 0.0 for disjoint or degenerate boxes.
pub fn iou_3d(a: &BBox3D, b: &BBox3D) -> f64 {
    let (a_min, a_max) = (a.min(), a.max());
    let (b_min, b_max) = (b.min(), b.max());

    let mut inter_volume = 1.0;
    for axis in 0..3 {
        let lo = a_min[axis].max(b_min[axis]);
        let hi = a_max[axis].min(b_max[axis]);
        inter_volume *= (hi - lo).max(0.0);
    }

    let union_volume = a.volume() + b.volume() - inter_volume;
    if union_volume > 0.0 {
        inter_volume / union_volume
    } else {
        0.0
    }
}

/// Intersection over Union of the `x`/`y` faces of two boxes.
///
/// Used when at least one box has no depth extent.
pub fn iou_2d(a: &BBox3D, b: &BBox3D) -> f64 {
    let (a_min, a_max) = (a.min(), a.max());
    let (b_min, b_max) = (b.min(), b.max());

    let inter_w = (a_max.x.min(b_max.x) - a_min.x.max(b_min.x)).max(0.0);
    let inter_h = (a_max.y.min(b_max.y) - a_min.y.max(b_min.y)).max(0.0);
    let inter_area = inter_w * inter_h;

    let union_area = a.width * a.height + b.width * b.height - inter_area;
    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Overlap of two boxes: 3D IoU when both have depth, 2D IoU otherwise.
pub fn overlap(a: &BBox3D, b: &BBox3D) -> f64 {
    if a.has_depth() && b.has_depth() {
        iou_3d(a, b)
    } else {
        iou_2d(a, b)
    }
}

/// Cosine similarity between two embeddings.
///
/// Returns `None` when dimensions differ or either vector has zero norm.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some((dot / denom).clamp(-1.0, 1.0))
}
