//! Stateless 2-D primitives for zone evaluation.
//!
//! Both functions operate in the pixel space of whatever frame detection ran
//! on; callers must not mix coordinates from differently scaled frames.

/// Side of a directed line, viewed with y growing downward (image space).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
    On,
}

/// Classify `point` against the directed line `start → end` using the sign
/// of the 2-D cross product. The answer depends only on the line's direction,
/// not on where along it the endpoints sit.
pub fn line_side(point: (f32, f32), start: (f32, f32), end: (f32, f32)) -> Side {
    let cross = (end.0 - start.0) * (point.1 - start.1) - (end.1 - start.1) * (point.0 - start.0);
    if cross > 0.0 {
        Side::Left
    } else if cross < 0.0 {
        Side::Right
    } else {
        Side::On
    }
}

/// Ray-casting containment test over an ordered vertex list. Edges are
/// treated half-open, so walking the boundary never double-counts a vertex;
/// points exactly on an edge classify consistently, one side or the other.
pub fn polygon_contains(point: (f32, f32), vertices: &[(f32, f32)]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let (px, py) = point;
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (xi, yi) = vertices[i];
        let (xj, yj) = vertices[j];
        if (yi > py) != (yj > py) {
            let x_at = (xj - xi) * (py - yi) / (yj - yi) + xi;
            if px < x_at {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE_START: (f32, f32) = (0.0, 250.0);
    const LINE_END: (f32, f32) = (800.0, 250.0);

    #[test]
    fn classifies_both_sides_of_a_horizontal_line() {
        // y grows downward: above the line is Right, below is Left.
        assert_eq!(line_side((400.0, 100.0), LINE_START, LINE_END), Side::Right);
        assert_eq!(line_side((400.0, 400.0), LINE_START, LINE_END), Side::Left);
        assert_eq!(line_side((123.0, 250.0), LINE_START, LINE_END), Side::On);
    }

    #[test]
    fn side_is_invariant_under_same_direction_reparameterization() {
        let point = (400.0, 100.0);
        let original = line_side(point, LINE_START, LINE_END);
        // Slide both endpoints along the line and stretch it.
        let shifted = line_side(point, (-100.0, 250.0), (900.0, 250.0));
        let shortened = line_side(point, (300.0, 250.0), (500.0, 250.0));
        assert_eq!(original, shifted);
        assert_eq!(original, shortened);
    }

    #[test]
    fn reversing_direction_swaps_sides() {
        let point = (400.0, 100.0);
        let forward = line_side(point, LINE_START, LINE_END);
        let backward = line_side(point, LINE_END, LINE_START);
        assert_eq!(forward, Side::Right);
        assert_eq!(backward, Side::Left);
    }

    #[test]
    fn contains_interior_and_rejects_far_exterior_points() {
        let square = [
            (200.0, 150.0),
            (600.0, 150.0),
            (600.0, 450.0),
            (200.0, 450.0),
        ];
        assert!(polygon_contains((400.0, 300.0), &square));
        assert!(polygon_contains((201.0, 151.0), &square));
        assert!(!polygon_contains((1000.0, 1000.0), &square));
        assert!(!polygon_contains((-50.0, 300.0), &square));
    }

    #[test]
    fn works_for_concave_polygons() {
        // An L-shape; (60, 60) sits in the notch.
        let ell = [
            (0.0, 0.0),
            (100.0, 0.0),
            (100.0, 40.0),
            (40.0, 40.0),
            (40.0, 100.0),
            (0.0, 100.0),
        ];
        assert!(polygon_contains((20.0, 80.0), &ell));
        assert!(polygon_contains((80.0, 20.0), &ell));
        assert!(!polygon_contains((60.0, 60.0), &ell));
    }

    #[test]
    fn boundary_rule_is_consistent() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        // Whatever the half-open rule decides for one vertical edge, the
        // opposite edge must decide the other way; a tiling of squares
        // counts every point exactly once.
        let on_left_edge = polygon_contains((0.0, 5.0), &square);
        let on_right_edge = polygon_contains((10.0, 5.0), &square);
        assert_ne!(on_left_edge, on_right_edge);
    }

    #[test]
    fn degenerate_vertex_lists_never_contain_anything() {
        assert!(!polygon_contains((0.0, 0.0), &[]));
        assert!(!polygon_contains((0.0, 0.0), &[(0.0, 0.0), (10.0, 10.0)]));
    }
}
