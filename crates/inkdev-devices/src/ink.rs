/*!
 * Ink document model.
 *
 * File transfer delivers [`InkDocument`]s: ordered layers of strokes of
 * points. Real-time ink delivers single [`InkSample`]s as they arrive.
 * Documents are immutable once delivered.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transform::{Matrix, Point};

/// Position of a sample within its stroke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointPhase {
    /// Pen down
    Begin,
    /// Pen moving on the surface
    Move,
    /// Pen up
    End,
    /// Pen in proximity, not touching
    Hover,
}

impl fmt::Display for PointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One pen sample with its optional sensor fields
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InkPoint {
    /// Position, in caller space once transformed
    pub position: Point,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Monotonic sequence number, useful to detect drops
    pub sequence: Option<u32>,
    /// Normalized pressure
    pub pressure: Option<f32>,
    /// Position in display pixels
    pub point_display: Option<Point>,
    /// Raw sensor position
    pub point_raw: Option<Point>,
    /// Raw sensor pressure
    pub pressure_raw: Option<u32>,
    /// Raw sensor timestamp
    pub timestamp_raw: Option<u32>,
    /// Pen barrel rotation
    pub rotation: Option<f32>,
    /// Pen azimuth
    pub azimuth: Option<f32>,
    /// Pen altitude
    pub altitude: Option<f32>,
    /// Pen tilt
    pub tilt: Option<Point>,
    /// Pen id
    pub pen_id: Option<u32>,
}

impl InkPoint {
    /// A point with only a position and timestamp
    pub fn new(position: Point, timestamp: DateTime<Utc>) -> Self {
        Self {
            position,
            timestamp,
            ..Self::default()
        }
    }

    /// Set the sequence number
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Set the pressure
    pub fn with_pressure(mut self, pressure: f32) -> Self {
        self.pressure = Some(pressure);
        self
    }

    /// Set the pen id
    pub fn with_pen_id(mut self, pen_id: u32) -> Self {
        self.pen_id = Some(pen_id);
        self
    }

    /// Copy of this point with `matrix` applied to the position
    pub fn transformed(&self, matrix: &Matrix) -> Self {
        Self {
            position: matrix.apply(self.position),
            ..self.clone()
        }
    }
}

/// A sample together with its stroke phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InkSample {
    /// Stroke phase
    pub phase: PointPhase,
    /// The sample
    pub point: InkPoint,
}

impl InkSample {
    /// Create a sample
    pub fn new(phase: PointPhase, point: InkPoint) -> Self {
        Self { phase, point }
    }

    /// Whether the pen was off the surface
    pub fn is_hover(&self) -> bool {
        self.phase == PointPhase::Hover
    }
}

/// An ordered run of points between pen down and pen up
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Stroke {
    /// Pen down time
    pub timestamp: DateTime<Utc>,
    /// Pen type reported by the device
    pub pen_type: Option<String>,
    /// Pen id
    pub pen_id: Option<u32>,
    /// Points in capture order
    pub points: Vec<InkPoint>,
}

impl Stroke {
    /// Create a stroke from points; the timestamp is taken from the first point
    pub fn new(points: Vec<InkPoint>) -> Self {
        let timestamp = points.first().map(|p| p.timestamp).unwrap_or_default();
        Self {
            timestamp,
            pen_type: None,
            pen_id: None,
            points,
        }
    }

    /// Samples with phases derived from stroke position
    ///
    /// A single point stroke is reported as `Begin` only.
    pub fn samples(&self) -> impl Iterator<Item = InkSample> + '_ {
        let last = self.points.len().saturating_sub(1);
        self.points.iter().enumerate().map(move |(i, p)| {
            let phase = if i == 0 {
                PointPhase::Begin
            } else if i == last {
                PointPhase::End
            } else {
                PointPhase::Move
            };
            InkSample::new(phase, p.clone())
        })
    }
}

/// An ordered list of strokes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Layer {
    /// Strokes in capture order
    pub strokes: Vec<Stroke>,
}

/// A page of ink transferred from the device
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InkDocument {
    /// Page creation time
    pub created: DateTime<Utc>,
    /// Page bounds in caller space
    pub bounds: Option<crate::properties::RectF>,
    /// Layers in page order
    pub layers: Vec<Layer>,
}

impl InkDocument {
    /// Create a document
    pub fn new(created: DateTime<Utc>, layers: Vec<Layer>) -> Self {
        Self {
            created,
            bounds: None,
            layers,
        }
    }

    /// Number of layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Number of strokes across all layers
    pub fn stroke_count(&self) -> usize {
        self.layers.iter().map(|l| l.strokes.len()).sum()
    }

    /// Number of points across all strokes
    pub fn point_count(&self) -> usize {
        self.strokes().map(|s| s.points.len()).sum()
    }

    /// All strokes in layer order
    pub fn strokes(&self) -> impl Iterator<Item = &Stroke> {
        self.layers.iter().flat_map(|l| l.strokes.iter())
    }

    /// All samples, in layer and stroke order
    pub fn to_samples(&self) -> Vec<InkSample> {
        self.strokes().flat_map(Stroke::samples).collect()
    }

    /// Short summary, e.g. `2024-03-01 10:15:00 UTC (1 layers, 12 total strokes)`
    pub fn description(&self) -> String {
        format!(
            "{} ({} layers, {} total strokes)",
            self.created,
            self.layer_count(),
            self.stroke_count()
        )
    }

    /// Copy of this document with `matrix` applied to every point position
    pub fn transformed(&self, matrix: &Matrix) -> Self {
        if matrix.is_identity() {
            return self.clone();
        }
        let layers = self
            .layers
            .iter()
            .map(|layer| Layer {
                strokes: layer
                    .strokes
                    .iter()
                    .map(|s| Stroke {
                        points: s.points.iter().map(|p| p.transformed(matrix)).collect(),
                        ..s.clone()
                    })
                    .collect(),
            })
            .collect();
        Self {
            layers,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn stroke(n: usize) -> Stroke {
        Stroke::new(
            (0..n)
                .map(|i| InkPoint::new(Point::new(i as f64, 1.0), at(i as i64)).with_sequence(i as u32))
                .collect(),
        )
    }

    #[test]
    fn test_counts_and_description() {
        let doc = InkDocument::new(
            at(0),
            vec![
                Layer {
                    strokes: vec![stroke(3), stroke(2)],
                },
                Layer {
                    strokes: vec![stroke(4)],
                },
            ],
        );
        assert_eq!(doc.layer_count(), 2);
        assert_eq!(doc.stroke_count(), 3);
        assert_eq!(doc.point_count(), 9);
        assert!(doc.description().ends_with("(2 layers, 3 total strokes)"));
    }

    #[test]
    fn test_sample_phases() {
        let phases: Vec<PointPhase> = stroke(4).samples().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![PointPhase::Begin, PointPhase::Move, PointPhase::Move, PointPhase::End]
        );

        let phases: Vec<PointPhase> = stroke(1).samples().map(|s| s.phase).collect();
        assert_eq!(phases, vec![PointPhase::Begin]);

        assert_eq!(stroke(0).samples().count(), 0);
    }

    #[test]
    fn test_transformed_leaves_original() {
        let doc = InkDocument::new(at(0), vec![Layer { strokes: vec![stroke(2)] }]);
        let moved = doc.transformed(&Matrix::translate(10.0, 0.0));
        assert_eq!(moved.layers[0].strokes[0].points[1].position, Point::new(11.0, 1.0));
        assert_eq!(doc.layers[0].strokes[0].points[1].position, Point::new(1.0, 1.0));
        assert_eq!(moved.layers[0].strokes[0].points[1].sequence, Some(1));
    }
}
