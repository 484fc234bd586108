/*!
 * 2D affine transforms from device coordinates to caller space.
 */
use serde::{Deserialize, Serialize};

/// Micrometres to device independent pixels (1/96 inch)
pub const MICROMETER_TO_DIP: f64 = 96.0 / 25400.0;

/// A point in device or view space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Point {
    /// Create a point
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A 3x2 affine matrix applied to row vectors: `[x y 1] * M`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    /// Row 1, column 1
    pub m11: f64,
    /// Row 1, column 2
    pub m12: f64,
    /// Row 2, column 1
    pub m21: f64,
    /// Row 2, column 2
    pub m22: f64,
    /// Horizontal offset
    pub m31: f64,
    /// Vertical offset
    pub m32: f64,
}

impl Matrix {
    /// The identity transform
    pub const IDENTITY: Matrix = Matrix {
        m11: 1.0,
        m12: 0.0,
        m21: 0.0,
        m22: 1.0,
        m31: 0.0,
        m32: 0.0,
    };

    /// Uniform or non-uniform scale about the origin
    pub fn scale(sx: f64, sy: f64) -> Self {
        Matrix {
            m11: sx,
            m22: sy,
            ..Self::IDENTITY
        }
    }

    /// Clockwise rotation (y axis pointing down) about the origin
    pub fn rotate_degrees(angle: f64) -> Self {
        let (sin, cos) = exact_sin_cos(angle);
        Matrix {
            m11: cos,
            m12: sin,
            m21: -sin,
            m22: cos,
            m31: 0.0,
            m32: 0.0,
        }
    }

    /// Translation
    pub fn translate(dx: f64, dy: f64) -> Self {
        Matrix {
            m31: dx,
            m32: dy,
            ..Self::IDENTITY
        }
    }

    /// `self` followed by `next`
    pub fn then(&self, next: &Matrix) -> Matrix {
        Matrix {
            m11: self.m11 * next.m11 + self.m12 * next.m21,
            m12: self.m11 * next.m12 + self.m12 * next.m22,
            m21: self.m21 * next.m11 + self.m22 * next.m21,
            m22: self.m21 * next.m12 + self.m22 * next.m22,
            m31: self.m31 * next.m11 + self.m32 * next.m21 + next.m31,
            m32: self.m31 * next.m12 + self.m32 * next.m22 + next.m32,
        }
    }

    /// Whether this is the identity
    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Transform a point
    pub fn apply(&self, p: Point) -> Point {
        Point {
            x: p.x * self.m11 + p.y * self.m21 + self.m31,
            y: p.x * self.m12 + p.y * self.m22 + self.m32,
        }
    }
}

impl Default for Matrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl std::ops::Mul for Matrix {
    type Output = Matrix;

    fn mul(self, rhs: Matrix) -> Matrix {
        self.then(&rhs)
    }
}

fn exact_sin_cos(angle: f64) -> (f64, f64) {
    let normalized = angle.rem_euclid(360.0);
    if normalized == 0.0 {
        (0.0, 1.0)
    } else if normalized == 90.0 {
        (1.0, 0.0)
    } else if normalized == 180.0 {
        (0.0, -1.0)
    } else if normalized == 270.0 {
        (-1.0, 0.0)
    } else {
        normalized.to_radians().sin_cos()
    }
}

/// Transform from a portrait-mounted device to landscape view space
///
/// Device units are scaled to DIPs by the point size (micrometres), rotated
/// by 90 degrees and shifted right by the scaled device height, so the
/// device's top-left corner lands at the view's top-right.
pub fn device_to_view(_width: u32, height: u32, point_size_um: u32) -> Matrix {
    let s = f64::from(point_size_um) * MICROMETER_TO_DIP;
    Matrix::scale(s, s)
        .then(&Matrix::rotate_degrees(90.0))
        .then(&Matrix::translate(f64::from(height) * s, 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Point, b: Point) -> bool {
        (a.x - b.x).abs() < 1e-9 && (a.y - b.y).abs() < 1e-9
    }

    #[test]
    fn test_identity() {
        let p = Point::new(3.5, -2.0);
        assert_eq!(Matrix::IDENTITY.apply(p), p);
        assert!(Matrix::default().is_identity());
    }

    #[test]
    fn test_compose_order() {
        let m = Matrix::scale(2.0, 2.0) * Matrix::translate(10.0, 0.0);
        assert!(close(m.apply(Point::new(1.0, 1.0)), Point::new(12.0, 2.0)));

        let m = Matrix::translate(10.0, 0.0) * Matrix::scale(2.0, 2.0);
        assert!(close(m.apply(Point::new(1.0, 1.0)), Point::new(22.0, 2.0)));
    }

    #[test]
    fn test_rotation_is_exact_for_right_angles() {
        let m = Matrix::rotate_degrees(90.0);
        assert_eq!(m.apply(Point::new(1.0, 0.0)), Point::new(0.0, 1.0));
        assert_eq!(m.apply(Point::new(0.0, 1.0)), Point::new(-1.0, 0.0));
    }

    #[test]
    fn test_device_to_view() {
        // zero point size collapses everything onto the origin
        let m = device_to_view(21600, 14800, 0);
        assert!(close(m.apply(Point::new(5.0, 5.0)), Point::new(0.0, 0.0)));

        let s = 10.0 * MICROMETER_TO_DIP;
        let m = device_to_view(21600, 14800, 10);
        assert!(close(m.apply(Point::new(0.0, 0.0)), Point::new(14800.0 * s, 0.0)));
        assert!(close(m.apply(Point::new(0.0, 14800.0)), Point::new(0.0, 0.0)));
        assert!(close(
            m.apply(Point::new(21600.0, 0.0)),
            Point::new(14800.0 * s, 21600.0 * s)
        ));
    }
}
