// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, internal_error, invalid_argument_error};
use chrono::{DateTime, Local};
use log::info;

use crate::imu_trait::{AccelData, GyroData, MagData, Orientation, Reading};
use crate::sink_fanout::Sink;

pub const CSV_HEADER: &str =
    "dev_id,time_ms,accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,mag_x,mag_y,mag_z,yaw,pitch,roll";

const NUM_VALUE_FIELDS: usize = 14;

// Rows are flushed to the OS at least this often, so that a crash loses at
// most this many rows.
const FLUSH_EVERY_ROWS: u64 = 100;

/// The comma-joined values of a Reading, in CSV_HEADER order. This is also
/// the network publish payload.
pub fn format_values(reading: &Reading) -> String {
    let s = &reading.sample;
    let o = &reading.orientation;
    format!("{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            s.dev_id, s.time_ms,
            s.accel.x, s.accel.y, s.accel.z,
            s.gyro.x, s.gyro.y, s.gyro.z,
            s.mag.x, s.mag.y, s.mag.z,
            o.yaw, o.pitch, o.roll)
}

// Free text is the only quoted field. Embedded quotes are doubled.
pub fn quote_label(label: &str) -> String {
    format!("\"{}\"", label.replace('"', "\"\""))
}

pub fn format_row(reading: &Reading, label: Option<&str>) -> String {
    match label {
        Some(label) => format!("{},{}", format_values(reading), quote_label(label)),
        None => format_values(reading),
    }
}

pub fn header(with_label: bool) -> String {
    if with_label {
        format!("{},label", CSV_HEADER)
    } else {
        CSV_HEADER.to_string()
    }
}

// CSV file name for a session started at `start`, e.g.
// "bno08X-2024-05-01_21-04-05.csv".
pub fn default_file_name(start: &DateTime<Local>) -> String {
    format!("bno08X-{}.csv", start.format("%Y-%m-%d_%H-%M-%S"))
}

/// One row read back from a CSV file. The quaternion is not stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRecord {
    pub dev_id: String,
    pub time_ms: i64,
    pub accel: AccelData,
    pub gyro: GyroData,
    pub mag: MagData,
    pub orientation: Orientation,
    pub label: Option<String>,
}

fn unquote_label(field: &str) -> Result<String, CanonicalError> {
    if field.len() < 2 || !field.starts_with('"') || !field.ends_with('"') {
        return Err(invalid_argument_error(
            &format!("Label field not quoted: {}", field)));
    }
    Ok(field[1..field.len() - 1].replace("\"\"", "\""))
}

pub fn parse_row(line: &str) -> Result<CsvRecord, CanonicalError> {
    let fields: Vec<&str> = line.splitn(NUM_VALUE_FIELDS + 1, ',').collect();
    if fields.len() < NUM_VALUE_FIELDS {
        return Err(invalid_argument_error(
            &format!("Expected {} fields, got {}: {}",
                     NUM_VALUE_FIELDS, fields.len(), line)));
    }
    let float = |i: usize| -> Result<f64, CanonicalError> {
        fields[i].parse::<f64>().map_err(|e| invalid_argument_error(
            &format!("Bad value {:?} in column {}: {:?}", fields[i], i, e)))
    };
    let time_ms = fields[1].parse::<i64>().map_err(|e| invalid_argument_error(
        &format!("Bad time_ms {:?}: {:?}", fields[1], e)))?;
    let label = match fields.get(NUM_VALUE_FIELDS) {
        Some(field) => Some(unquote_label(field)?),
        None => None,
    };
    Ok(CsvRecord{
        dev_id: fields[0].to_string(),
        time_ms,
        accel: AccelData{x: float(2)?, y: float(3)?, z: float(4)?},
        gyro: GyroData{x: float(5)?, y: float(6)?, z: float(7)?},
        mag: MagData{x: float(8)?, y: float(9)?, z: float(10)?},
        orientation: Orientation{yaw: float(11)?, pitch: float(12)?, roll: float(13)?},
        label,
    })
}

/// Reads a file written by CsvSink, skipping the header.
pub fn read_csv(path: &Path) -> Result<Vec<CsvRecord>, CanonicalError> {
    let file = File::open(path).map_err(|e| internal_error(
        &format!("Failed to open {:?}: {:?}", path, e)))?;
    let mut records = Vec::new();
    for (line_number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| internal_error(
            &format!("Failed to read {:?}: {:?}", path, e)))?;
        if line_number == 0 || line.is_empty() {
            continue;
        }
        records.push(parse_row(&line)?);
    }
    Ok(records)
}

// Append-only CSV file, one row per Reading.
pub struct CsvSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    label: Option<String>,
    rows: u64,
}

impl CsvSink {
    /// Creates (truncating) the file at `path` and writes the header. Parent
    /// directories are created as needed. If `label` is given, every row gets
    /// it as a trailing quoted column.
    pub fn create(path: &Path, label: Option<&str>) -> Result<Self, CanonicalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| internal_error(
                    &format!("Failed to create {:?}: {:?}", parent, e)))?;
            }
        }
        let file = File::create(path).map_err(|e| internal_error(
            &format!("Failed to create {:?}: {:?}", path, e)))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", header(label.is_some())).map_err(|e| internal_error(
            &format!("Failed to write header to {:?}: {:?}", path, e)))?;
        info!("Writing readings to {:?}", path);
        Ok(CsvSink{
            path: path.to_path_buf(),
            writer: Some(writer),
            label: label.map(str::to_string),
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn deliver(&mut self, reading: &Reading) -> Result<(), CanonicalError> {
        let writer = self.writer.as_mut().ok_or_else(
            || internal_error("CSV sink already closed"))?;
        writeln!(writer, "{}", format_row(reading, self.label.as_deref()))
            .map_err(|e| internal_error(
                &format!("Failed to write to {:?}: {:?}", self.path, e)))?;
        self.rows += 1;
        if self.rows % FLUSH_EVERY_ROWS == 0 {
            writer.flush().map_err(|e| internal_error(
                &format!("Failed to flush {:?}: {:?}", self.path, e)))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), CanonicalError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| internal_error(
                &format!("Failed to flush {:?}: {:?}", self.path, e)))?;
            info!("Wrote {} rows to {:?}", self.rows, self.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;
    use crate::imu_trait::{Quaternion, Sample};
    use super::*;

    fn reading(time_ms: i64, k: f64) -> Reading {
        Reading {
            sample: Sample {
                dev_id: "bno085-testing".to_string(),
                time_ms,
                accel: AccelData{x: 0.1 * k, y: -9.81, z: 1.0 / 3.0},
                gyro: GyroData{x: k, y: -k, z: 1e-9},
                mag: MagData{x: 22.5, y: -3.0625, z: 40.0 + k},
                quaternion: Quaternion::identity(),
            },
            orientation: Orientation{yaw: -179.5 + k, pitch: 90.0 - k / 7.0, roll: 180.0},
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("imu_logger_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_format_row() {
        let r = Reading {
            sample: Sample {
                dev_id: "dev".to_string(),
                time_ms: 1234,
                accel: AccelData{x: 1.0, y: 2.5, z: -3.0},
                gyro: GyroData::default(),
                mag: MagData{x: 0.5, y: 0.0, z: 0.0},
                quaternion: Quaternion::identity(),
            },
            orientation: Orientation{yaw: 90.0, pitch: 12.25, roll: 0.0},
        };
        assert_eq!(format_values(&r), "dev,1234,1,2.5,-3,0,0,0,0.5,0,0,90,12.25,0");
        assert_eq!(format_row(&r, Some("run \"A\", left")),
                   "dev,1234,1,2.5,-3,0,0,0,0.5,0,0,90,12.25,0,\"run \"\"A\"\", left\"");
    }

    #[test]
    fn test_header() {
        assert_eq!(header(false).split(',').count(), 14);
        assert!(header(true).ends_with(",label"));
    }

    #[test]
    fn test_default_file_name() {
        let start = Local.with_ymd_and_hms(2024, 5, 1, 21, 4, 5).unwrap();
        assert_eq!(default_file_name(&start), "bno08X-2024-05-01_21-04-05.csv");
    }

    #[test]
    fn test_parse_row_errors() {
        assert!(parse_row("a,1,2").is_err());
        assert!(parse_row("dev,notanumber,0,0,0,0,0,0,0,0,0,0,0,0").is_err());
        assert!(parse_row("dev,1,0,0,0,0,0,0,0,0,0,0,0,x").is_err());
        assert!(parse_row("dev,1,0,0,0,0,0,0,0,0,0,0,0,0,unquoted").is_err());
    }

    #[test]
    fn test_csv_round_trip() {
        let path = temp_path("round_trip.csv");
        let written: Vec<Reading> = (0..50).map(|i| reading(1000 + 10 * i, i as f64)).collect();
        let mut sink = CsvSink::create(&path, None).unwrap();
        for r in &written {
            sink.deliver(r).unwrap();
        }
        sink.close().unwrap();

        let records = read_csv(&path).unwrap();
        assert_eq!(records.len(), written.len());
        for (record, r) in records.iter().zip(&written) {
            assert_eq!(record.dev_id, r.sample.dev_id);
            assert_eq!(record.time_ms, r.sample.time_ms);
            let s = &r.sample;
            let values = [
                (record.accel.x, s.accel.x), (record.accel.y, s.accel.y),
                (record.accel.z, s.accel.z),
                (record.gyro.x, s.gyro.x), (record.gyro.y, s.gyro.y),
                (record.gyro.z, s.gyro.z),
                (record.mag.x, s.mag.x), (record.mag.y, s.mag.y), (record.mag.z, s.mag.z),
                (record.orientation.yaw, r.orientation.yaw),
                (record.orientation.pitch, r.orientation.pitch),
                (record.orientation.roll, r.orientation.roll),
            ];
            for (read, wrote) in values {
                assert_abs_diff_eq!(read, wrote, epsilon = 1e-12);
            }
            assert_eq!(record.label, None);
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_csv_round_trip_with_label() {
        let path = temp_path("labelled.csv");
        let mut sink = CsvSink::create(&path, Some("bench, \"flat\"")).unwrap();
        sink.deliver(&reading(5, 1.0)).unwrap();
        sink.deliver(&reading(6, 2.0)).unwrap();
        sink.close().unwrap();
        // Closing twice is harmless.
        sink.close().unwrap();
        // Writing after close is an error, not a panic.
        assert!(sink.deliver(&reading(7, 3.0)).is_err());

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&header(true)));
        let records = read_csv(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].label.as_deref(), Some("bench, \"flat\""));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_create_makes_parent_directory() {
        let dir = temp_path("nested_dir");
        let path = dir.join("out.csv");
        let mut sink = CsvSink::create(&path, None).unwrap();
        assert_eq!(sink.path(), path.as_path());
        sink.close().unwrap();
        assert!(path.exists());
        fs::remove_dir_all(&dir).unwrap();
    }

}  // mod tests.
