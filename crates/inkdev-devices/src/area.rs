/*!
 * Integer rectangles and clamp-and-notify area editing.
 *
 * Display areas are never rejected for being out of bounds. Each edit clamps
 * the requested value into the bounds, and every field that ends up
 * different from what the caller asked for (or that changed as a side
 * effect) is reported back so the caller can refresh its view.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use inkdev_core::event::{EventHub, Subscription};
use inkdev_core::types::{object, Value};

use crate::error::DeviceError;
use crate::properties::mismatch;

/// An integer rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left
    pub x: i32,
    /// Top
    pub y: i32,
    /// Width
    pub width: i32,
    /// Height
    pub height: i32,
}

impl Rect {
    /// Create a rectangle
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle at the origin covering `width` x `height`
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, saturating_i32(width), saturating_i32(height))
    }

    /// Exclusive right edge
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    /// Whether `other` lies entirely inside `self`
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// This rectangle clamped field by field into a `width` x `height` area
    pub fn clamped_to(&self, width: u32, height: u32) -> Rect {
        let mut editor = AreaEditor::new(*self, width, height);
        editor.set_x(self.x);
        editor.set_y(self.y);
        editor.set_width(self.width);
        editor.set_height(self.height);
        editor.area()
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{X={},Y={},Width={},Height={}}}",
            self.x, self.y, self.width, self.height
        )
    }
}

impl From<Rect> for Value {
    fn from(rect: Rect) -> Self {
        object([
            ("X", Value::from(rect.x)),
            ("Y", Value::from(rect.y)),
            ("Width", Value::from(rect.width)),
            ("Height", Value::from(rect.height)),
        ])
    }
}

impl TryFrom<&Value> for Rect {
    type Error = DeviceError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let field = |name: &str| {
            value
                .field(name)
                .and_then(Value::as_integer)
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| mismatch("Rect", value))
        };
        Ok(Rect::new(field("X")?, field("Y")?, field("Width")?, field("Height")?))
    }
}

pub(crate) fn saturating_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// A rectangle field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AreaField {
    /// Left
    X,
    /// Top
    Y,
    /// Width
    Width,
    /// Height
    Height,
}

/// A field whose stored value differs from what the caller asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaAdjustment {
    /// The field
    pub field: AreaField,
    /// The stored value
    pub value: i32,
}

/// Edits one rectangle inside fixed bounds
#[derive(Debug, Clone)]
pub struct AreaEditor {
    area: Rect,
    width: i32,
    height: i32,
    adjustments: EventHub<AreaAdjustment>,
}

impl AreaEditor {
    /// Create an editor for `area` within `width` x `height`
    ///
    /// The initial area is taken as is; use [`Rect::clamped_to`] first if it
    /// may be out of bounds.
    pub fn new(area: Rect, width: u32, height: u32) -> Self {
        Self {
            area,
            width: saturating_i32(width).max(1),
            height: saturating_i32(height).max(1),
            adjustments: EventHub::new("area-adjustments"),
        }
    }

    /// Editor covering the full bounds
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(Rect::from_size(width, height), width, height)
    }

    /// Current area
    pub fn area(&self) -> Rect {
        self.area
    }

    /// Bounds as (width, height)
    pub fn bounds(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    /// Receive every adjustment as it happens
    pub fn subscribe(&self) -> Subscription<AreaAdjustment> {
        self.adjustments.subscribe()
    }

    /// Set X, clamped to `[0, width - 1]`; shrinks the width if the area overflows
    pub fn set_x(&mut self, value: i32) -> Vec<AreaAdjustment> {
        let (x, w) = clamp_offset(value, self.area.width, self.width);
        self.area.x = x;
        let mut adjusted = Vec::new();
        if x != value {
            adjusted.push(AreaField::X);
        }
        if w != self.area.width {
            self.area.width = w;
            adjusted.push(AreaField::Width);
        }
        self.report(adjusted)
    }

    /// Set Y, clamped to `[0, height - 1]`; shrinks the height if the area overflows
    pub fn set_y(&mut self, value: i32) -> Vec<AreaAdjustment> {
        let (y, h) = clamp_offset(value, self.area.height, self.height);
        self.area.y = y;
        let mut adjusted = Vec::new();
        if y != value {
            adjusted.push(AreaField::Y);
        }
        if h != self.area.height {
            self.area.height = h;
            adjusted.push(AreaField::Height);
        }
        self.report(adjusted)
    }

    /// Set the width, clamped to `[1, width - X]`
    pub fn set_width(&mut self, value: i32) -> Vec<AreaAdjustment> {
        let w = clamp_extent(value, self.area.x, self.width);
        self.area.width = w;
        let adjusted = if w != value {
            vec![AreaField::Width]
        } else {
            Vec::new()
        };
        self.report(adjusted)
    }

    /// Set the height, clamped to `[1, height - Y]`
    pub fn set_height(&mut self, value: i32) -> Vec<AreaAdjustment> {
        let h = clamp_extent(value, self.area.y, self.height);
        self.area.height = h;
        let adjusted = if h != value {
            vec![AreaField::Height]
        } else {
            Vec::new()
        };
        self.report(adjusted)
    }

    fn report(&self, fields: Vec<AreaField>) -> Vec<AreaAdjustment> {
        fields
            .into_iter()
            .map(|field| {
                let value = match field {
                    AreaField::X => self.area.x,
                    AreaField::Y => self.area.y,
                    AreaField::Width => self.area.width,
                    AreaField::Height => self.area.height,
                };
                let adjustment = AreaAdjustment { field, value };
                debug!("Area {:?} adjusted to {}", field, value);
                self.adjustments.publish(adjustment);
                adjustment
            })
            .collect()
    }
}

fn clamp_offset(value: i32, extent: i32, bound: i32) -> (i32, i32) {
    let offset = value.clamp(0, bound - 1);
    let extent = if offset.saturating_add(extent) > bound {
        bound - offset
    } else {
        extent
    };
    (offset, extent)
}

fn clamp_extent(value: i32, offset: i32, bound: i32) -> i32 {
    value.max(1).min(bound - offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(adjustments: &[AreaAdjustment]) -> Vec<AreaField> {
        adjustments.iter().map(|a| a.field).collect()
    }

    #[test]
    fn test_set_x_beyond_width_clamps_and_shrinks() {
        let mut editor = AreaEditor::full(320, 200);
        let adjusted = editor.set_x(500);
        assert_eq!(fields(&adjusted), vec![AreaField::X, AreaField::Width]);
        assert_eq!(editor.area(), Rect::new(319, 0, 1, 200));
        assert_eq!(adjusted[0].value, 319);
        assert_eq!(adjusted[1].value, 1);
    }

    #[test]
    fn test_set_x_in_range_shrinks_width_only() {
        let mut editor = AreaEditor::full(320, 200);
        let adjusted = editor.set_x(20);
        assert_eq!(fields(&adjusted), vec![AreaField::Width]);
        assert_eq!(editor.area(), Rect::new(20, 0, 300, 200));

        let adjusted = editor.set_x(10);
        assert!(adjusted.is_empty());
        assert_eq!(editor.area(), Rect::new(10, 0, 300, 200));
    }

    #[test]
    fn test_negative_offsets_clamp_to_zero() {
        let mut editor = AreaEditor::new(Rect::new(10, 10, 50, 50), 320, 200);
        assert_eq!(fields(&editor.set_x(-5)), vec![AreaField::X]);
        assert_eq!(fields(&editor.set_y(-1)), vec![AreaField::Y]);
        assert_eq!(editor.area(), Rect::new(0, 0, 50, 50));
    }

    #[test]
    fn test_set_width_and_height_bounds() {
        let mut editor = AreaEditor::new(Rect::new(300, 150, 10, 10), 320, 200);
        assert_eq!(fields(&editor.set_width(0)), vec![AreaField::Width]);
        assert_eq!(editor.area().width, 1);

        let adjusted = editor.set_width(100);
        assert_eq!(adjusted, vec![AreaAdjustment { field: AreaField::Width, value: 20 }]);

        assert_eq!(fields(&editor.set_height(80)), vec![AreaField::Height]);
        assert_eq!(editor.area().height, 50);

        assert!(editor.set_height(25).is_empty());
    }

    #[test]
    fn test_adjustments_are_published() {
        let mut editor = AreaEditor::full(100, 100);
        let mut sub = editor.subscribe();
        editor.set_y(150);
        assert_eq!(
            sub.drain(),
            vec![
                AreaAdjustment { field: AreaField::Y, value: 99 },
                AreaAdjustment { field: AreaField::Height, value: 1 },
            ]
        );
    }

    #[test]
    fn test_value_conversion() {
        let rect = Rect::new(10, 20, 300, 400);
        let value = Value::from(rect);
        assert_eq!(value.field("Width"), Some(&Value::Integer(300)));
        assert_eq!(Rect::try_from(&value).unwrap(), rect);
        assert!(Rect::try_from(&Value::from("nope")).is_err());
    }

    #[test]
    fn test_clamped_to() {
        assert_eq!(Rect::new(-10, 5, 1000, 0).clamped_to(320, 200), Rect::new(0, 5, 320, 1));
        let inside = Rect::new(1, 2, 3, 4);
        assert_eq!(inside.clamped_to(320, 200), inside);
        assert!(Rect::from_size(320, 200).contains(&inside));
    }
}
