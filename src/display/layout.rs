//! Arrangement of outputs in screen space
//!
//! Input handling lives outside this crate; what it needs from us is the
//! union of output view areas and a way to keep a pointer on some output.

use std::sync::{Arc, OnceLock};

use crate::geometry::{Point, Rectangle};

/// View areas of the active outputs, by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayLayout {
    outputs: Vec<(String, Rectangle)>,
}

impl DisplayLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_output(&mut self, name: impl Into<String>, area: Rectangle) {
        self.outputs.push((name.into(), area));
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, Rectangle)> {
        self.outputs.iter().map(|(name, area)| (name.as_str(), *area))
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn bounding_rectangle(&self) -> Rectangle {
        self.outputs
            .iter()
            .fold(Rectangle::default(), |bounds, (_, area)| bounds.union(area))
    }

    /// Output containing `point`
    pub fn output_at(&self, point: Point) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(_, area)| area.contains(point))
            .map(|(name, _)| name.as_str())
    }

    /// Moves `point` onto the closest output. Points already on an output,
    /// and every point when there are no outputs, are returned unchanged.
    pub fn confine(&self, point: Point) -> Point {
        if self.outputs.is_empty() || self.output_at(point).is_some() {
            return point;
        }

        self.outputs
            .iter()
            .filter(|(_, area)| !area.is_empty())
            .map(|(_, area)| clamp(point, area))
            .min_by_key(|clamped| distance_squared(point, *clamped))
            .unwrap_or(point)
    }
}

fn clamp(point: Point, area: &Rectangle) -> Point {
    Point::new(
        point.x.clamp(area.left(), area.right() - 1),
        point.y.clamp(area.top(), area.bottom() - 1),
    )
}

fn distance_squared(a: Point, b: Point) -> i64 {
    let dx = (a.x - b.x) as i64;
    let dy = (a.y - b.y) as i64;
    dx * dx + dy * dy
}

/// Handle to the layout that can be given out before the outputs exist
///
/// Clones share one slot, filled once when the graphics stack has built its
/// outputs. Until then there is no region and points pass through.
#[derive(Debug, Clone, Default)]
pub struct InputRegion {
    layout: Arc<OnceLock<DisplayLayout>>,
}

impl InputRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills the slot. Returns false if it was already bound.
    pub fn bind(&self, layout: DisplayLayout) -> bool {
        self.layout.set(layout).is_ok()
    }

    pub fn is_bound(&self) -> bool {
        self.layout.get().is_some()
    }

    pub fn bounding_rectangle(&self) -> Option<Rectangle> {
        self.layout.get().map(DisplayLayout::bounding_rectangle)
    }

    pub fn confine(&self, point: Point) -> Point {
        match self.layout.get() {
            Some(layout) => layout.confine(point),
            None => point,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual_head() -> DisplayLayout {
        let mut layout = DisplayLayout::new();
        layout.add_output("left", Rectangle::from_xywh(0, 0, 1920, 1080));
        layout.add_output("right", Rectangle::from_xywh(1920, 0, 1280, 1024));
        layout
    }

    #[test]
    fn test_bounding_rectangle_covers_all_outputs() {
        assert_eq!(dual_head().bounding_rectangle(), Rectangle::from_xywh(0, 0, 3200, 1080));
        assert_eq!(DisplayLayout::new().bounding_rectangle(), Rectangle::default());
    }

    #[test]
    fn test_confine_moves_point_to_nearest_output() {
        let layout = dual_head();
        assert_eq!(layout.confine(Point::new(100, 100)), Point::new(100, 100));
        assert_eq!(layout.confine(Point::new(-50, 500)), Point::new(0, 500));
        // Below the shorter right-hand output
        assert_eq!(layout.confine(Point::new(2500, 1050)), Point::new(2500, 1023));
        assert_eq!(layout.confine(Point::new(5000, -10)), Point::new(3199, 0));
    }

    #[test]
    fn test_input_region_binds_once() {
        let region = InputRegion::new();
        let handle = region.clone();
        assert_eq!(handle.confine(Point::new(-5, -5)), Point::new(-5, -5));
        assert!(handle.bounding_rectangle().is_none());

        assert!(region.bind(dual_head()));
        assert!(!region.bind(DisplayLayout::new()));
        assert!(handle.is_bound());
        assert_eq!(handle.confine(Point::new(-5, -5)), Point::new(0, 0));
    }
}
