// Region tracking helpers

use serde::{Deserialize, Serialize};

/// A rectangular region
///
/// This can be used to track damage boxes, window geometry,
/// clip regions, etc. It is determined by the corners of a
/// rectangle:
///   r_pos:  the upper left corner's position on the desktop
///   r_size: the distance from the left to the lower right
#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(C)]
pub struct Rect<T> {
    pub r_pos: (T, T),
    pub r_size: (T, T),
}

impl<T> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Rect<T> {
        Rect {
            r_pos: (x, y),
            r_size: (width, height),
        }
    }
}

impl Rect<f32> {
    /// Scale this rect into device pixels
    pub fn scaled(&self, scale: f32) -> Rect<f32> {
        Rect {
            r_pos: (self.r_pos.0 * scale, self.r_pos.1 * scale),
            r_size: (self.r_size.0 * scale, self.r_size.1 * scale),
        }
    }

    /// Snap the corners of this rect to the pixel grid
    pub fn snapped(&self) -> Rect<f32> {
        let x = self.r_pos.0.round();
        let y = self.r_pos.1.round();
        let right = (self.r_pos.0 + self.r_size.0).round();
        let bottom = (self.r_pos.1 + self.r_size.1).round();
        Rect {
            r_pos: (x, y),
            r_size: (right - x, bottom - y),
        }
    }

    /// Shrink this rect by `amount` on all four sides
    pub fn adjusted(&self, amount: f32) -> Rect<f32> {
        Rect {
            r_pos: (self.r_pos.0 + amount, self.r_pos.1 + amount),
            r_size: (self.r_size.0 - 2.0 * amount, self.r_size.1 - 2.0 * amount),
        }
    }
}

/// A set of non-overlapping rectangles
///
/// We only ever consume the bounding box on the rendering side,
/// so this does not try to be a real boolean-ops region.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Region {
    pub rects: Vec<Rect<i32>>,
}

impl Region {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rect<i32>) -> Self {
        Self { rects: vec![rect] }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
            || self
                .rects
                .iter()
                .all(|r| r.r_size.0 <= 0 || r.r_size.1 <= 0)
    }

    pub fn add(&mut self, rect: Rect<i32>) {
        self.rects.push(rect);
    }

    /// The smallest rectangle containing every rect in the region
    pub fn bounding_rect(&self) -> Rect<i32> {
        let mut iter = self
            .rects
            .iter()
            .filter(|r| r.r_size.0 > 0 && r.r_size.1 > 0);

        let first = match iter.next() {
            Some(r) => r,
            None => return Rect::new(0, 0, 0, 0),
        };

        let mut x0 = first.r_pos.0;
        let mut y0 = first.r_pos.1;
        let mut x1 = first.r_pos.0 + first.r_size.0;
        let mut y1 = first.r_pos.1 + first.r_size.1;

        for r in iter {
            x0 = x0.min(r.r_pos.0);
            y0 = y0.min(r.r_pos.1);
            x1 = x1.max(r.r_pos.0 + r.r_size.0);
            y1 = y1.max(r.r_pos.1 + r.r_size.1);
        }

        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_rect_spans_all_rects() {
        let mut region = Region::new();
        region.add(Rect::new(10, 10, 20, 20));
        region.add(Rect::new(50, 0, 10, 15));

        assert_eq!(region.bounding_rect(), Rect::new(10, 0, 50, 30));
    }

    #[test]
    fn empty_region_has_zero_bounds() {
        let region = Region::new();
        assert!(region.is_empty());
        assert_eq!(region.bounding_rect(), Rect::new(0, 0, 0, 0));
    }

    #[test]
    fn snapped_rect_keeps_opposite_corners() {
        let r = Rect::new(0.4, 0.6, 10.2, 10.2).snapped();
        assert_eq!(r.r_pos, (0.0, 1.0));
        // the snapped size is measured corner to corner, not rounded itself
        assert_eq!(r.r_size, (11.0, 10.0));
    }
}
