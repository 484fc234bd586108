/*!
 * CSV export of pen samples.
 *
 * One row per sample. Optional fields that the device did not report are
 * written as empty fields, pair fields (display, raw, tilt) as two empty
 * fields. Timestamps are RFC 3339 in UTC with fractional seconds.
 */
use std::fmt::Display;
use std::io::Write;
use std::path::Path;

use chrono::SecondsFormat;
use tracing::info;

use crate::error::Result;
use crate::ink::{InkDocument, InkSample};
use crate::transform::Point;

/// The header row
pub const CSV_HEADER: &str = "Timestamp,PointX,PointY,Phase,Pressure,PointDisplayX,PointDisplayY,PointRawX,PointRawY,PressureRaw,TimestampRaw,Sequence,Rotation,Azimuth,Altitude,TiltX,TiltY,PenId";

fn opt<T: Display>(row: &mut String, value: Option<T>) {
    row.push(',');
    if let Some(v) = value {
        row.push_str(&v.to_string());
    }
}

fn opt_pair(row: &mut String, value: Option<Point>) {
    match value {
        Some(p) => {
            row.push_str(&format!(",{},{}", p.x, p.y));
        }
        None => row.push_str(",,"),
    }
}

/// Format one sample as a CSV row, without the line terminator
pub fn csv_row(sample: &InkSample) -> String {
    let p = &sample.point;
    let mut row = format!(
        "{},{},{},{}",
        p.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        p.position.x,
        p.position.y,
        sample.phase
    );
    opt(&mut row, p.pressure);
    opt_pair(&mut row, p.point_display);
    opt_pair(&mut row, p.point_raw);
    opt(&mut row, p.pressure_raw);
    opt(&mut row, p.timestamp_raw);
    opt(&mut row, p.sequence);
    opt(&mut row, p.rotation);
    opt(&mut row, p.azimuth);
    opt(&mut row, p.altitude);
    opt_pair(&mut row, p.tilt);
    opt(&mut row, p.pen_id.map(|id| format!("0x{:08x}", id)));
    row
}

/// Write the header and one row per sample
pub fn write_csv<'a, W, I>(mut writer: W, samples: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a InkSample>,
{
    writeln!(writer, "{}", CSV_HEADER)?;
    let mut rows = 0;
    for sample in samples {
        writeln!(writer, "{}", csv_row(sample))?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

/// Write a real-time sample log to `path`
pub async fn save_csv<P: AsRef<Path>>(path: P, samples: &[InkSample]) -> Result<usize> {
    let mut buf = Vec::new();
    let rows = write_csv(&mut buf, samples)?;
    tokio::fs::write(path.as_ref(), buf).await?;
    info!("Exported {} samples to {}", rows, path.as_ref().display());
    Ok(rows)
}

/// Write every point of `document` to `path`
pub async fn save_document_csv<P: AsRef<Path>>(path: P, document: &InkDocument) -> Result<usize> {
    save_csv(path, &document.to_samples()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ink::{InkPoint, Layer, PointPhase, Stroke};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn sample() -> InkSample {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_250).unwrap();
        InkSample::new(PointPhase::Move, InkPoint::new(Point::new(12.5, 40.0), ts))
    }

    #[test]
    fn test_minimal_row_has_empty_optionals() {
        let row = csv_row(&sample());
        assert_eq!(row, "2023-11-14T22:13:20.250Z,12.5,40,Move,,,,,,,,,,,,,,");
        assert_eq!(row.split(',').count(), CSV_HEADER.split(',').count());
    }

    #[test]
    fn test_full_row() {
        let mut s = sample();
        s.point.pressure = Some(0.5);
        s.point.point_display = Some(Point::new(100.0, 200.0));
        s.point.point_raw = Some(Point::new(1000.0, 2000.0));
        s.point.pressure_raw = Some(1023);
        s.point.timestamp_raw = Some(65000);
        s.point.sequence = Some(7);
        s.point.rotation = Some(1.25);
        s.point.azimuth = Some(0.75);
        s.point.altitude = Some(1.5);
        s.point.tilt = Some(Point::new(-0.25, 0.5));
        s.point.pen_id = Some(0x2a);

        assert_eq!(
            csv_row(&s),
            "2023-11-14T22:13:20.250Z,12.5,40,Move,0.5,100,200,1000,2000,1023,65000,7,1.25,0.75,1.5,-0.25,0.5,0x0000002a"
        );
    }

    #[test]
    fn test_write_csv_header() -> Result<()> {
        let mut out = Vec::new();
        let samples = vec![sample(), sample()];
        assert_eq!(write_csv(&mut out, &samples)?, 2);
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(lines.count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_save_document_csv() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("page.csv");
        let points = (0..3)
            .map(|i| InkPoint::new(Point::new(f64::from(i), 0.0), Utc::now()))
            .collect();
        let doc = InkDocument::new(
            Utc::now(),
            vec![Layer {
                strokes: vec![Stroke::new(points)],
            }],
        );
        assert_eq!(save_document_csv(&path, &doc).await?, 3);

        let text = tokio::fs::read_to_string(&path).await?;
        let phases: Vec<&str> = text
            .lines()
            .skip(1)
            .map(|l| l.split(',').nth(3).unwrap())
            .collect();
        assert_eq!(phases, vec!["Begin", "Move", "End"]);
        Ok(())
    }
}
