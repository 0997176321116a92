//! geometry: axis-aligned box math shared by every stage
//!
//! Boxes are `(x1, y1, x2, y2)` in original-frame pixel coordinates.

/// Axis-aligned bounding box in pixel coordinates of the original frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Square of side `size` centred on `(cx, cy)`.
    pub fn around(cx: f32, cy: f32, size: f32) -> Self {
        let half = size / 2.0;
        Self::new(cx - half, cy - half, cx + half, cy + half)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }
    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }
    pub fn center(&self) -> (f32, f32) {
        (self.center_x(), self.center_y())
    }

    /// Area, zero for inverted or degenerate boxes.
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Squared Euclidean distance between the two box centres.
    pub fn center_distance_sq(&self, other: &BBox) -> f32 {
        let dx = self.center_x() - other.center_x();
        let dy = self.center_y() - other.center_y();
        dx * dx + dy * dy
    }

    /// Grow by `dx` on the left/right and `dy` on the top/bottom.
    pub fn expand(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x1 - dx, self.y1 - dy, self.x2 + dx, self.y2 + dy)
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to a `width × height`
    /// frame, or `None` when nothing of the box lies inside it.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        // Truncate towards zero like a slice index would.
        let x1 = (self.x1.max(0.0) as u32).min(width);
        let y1 = (self.y1.max(0.0) as u32).min(height);
        let x2 = (self.x2.max(0.0) as u32).min(width);
        let y2 = (self.y2.max(0.0) as u32).min(height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BBox::new(10.0, 20.0, 50.0, 80.0);
        assert_eq!(b.iou(&b), 1.0);
    }

    #[test]
    fn iou_is_symmetric() {
        let a = BBox::new(0.0, 0.0, 40.0, 40.0);
        let b = BBox::new(20.0, 10.0, 70.0, 45.0);
        assert_eq!(a.iou(&b), b.iou(&a));
        assert!(a.iou(&b) > 0.0 && a.iou(&b) < 1.0);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        // Touching edges do not overlap either.
        let c = BBox::new(10.0, 0.0, 20.0, 10.0);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn degenerate_boxes_do_not_divide_by_zero() {
        let a = BBox::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(a.iou(&a), 0.0);
        assert_eq!(a.area(), 0.0);
    }

    #[test]
    fn around_builds_a_centred_square() {
        let b = BBox::around(100.0, 50.0, 20.0);
        assert_eq!(b, BBox::new(90.0, 40.0, 110.0, 60.0));
        assert_eq!(b.center(), (100.0, 50.0));
    }

    #[test]
    fn center_distance_is_squared() {
        let a = BBox::around(0.0, 0.0, 4.0);
        let b = BBox::around(3.0, 4.0, 10.0);
        assert_eq!(a.center_distance_sq(&b), 25.0);
    }

    #[test]
    fn clip_to_handles_partial_and_outside_boxes() {
        let b = BBox::new(-10.0, 5.5, 30.9, 200.0);
        assert_eq!(b.clip_to(100, 100), Some((0, 5, 30, 95)));
        assert_eq!(BBox::new(150.0, 0.0, 200.0, 10.0).clip_to(100, 100), None);
        assert_eq!(BBox::new(10.0, 10.0, 10.5, 40.0).clip_to(100, 100), None);
    }
}
