// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::Write;
use std::time::Instant;

use canonical_error::{CanonicalError, internal_error};
use termion::{clear, cursor};
use termion::input::TermRead;
use termion::raw::IntoRawMode;

use crate::imu_trait::Reading;
use crate::sink_fanout::Sink;

fn io_error(what: &str, e: std::io::Error) -> CanonicalError {
    internal_error(&format!("{}: {:?}", what, e))
}

// Fixed width, three decimals, blank in place of a '+' sign, so columns stay
// aligned as values change sign.
pub fn format_field(value: f64) -> String {
    if value.is_sign_negative() && value != 0.0 {
        format!("{:08.3}", value)
    } else {
        format!(" {:07.3}", value.abs())
    }
}

/// The screen lines for one Reading, top to bottom. The last line reports
/// the time since the previous update, if there was one.
pub fn render_lines(reading: &Reading, since_last_ms: Option<f64>) -> Vec<String> {
    let s = &reading.sample;
    let o = &reading.orientation;
    let mut lines = vec![
        "Basic reading".to_string(),
        format!("Accel X:{}", format_field(s.accel.x)),
        format!("Accel Y:{}", format_field(s.accel.y)),
        format!("Accel Z:{}", format_field(s.accel.z)),
        format!("Gyro X:{}", format_field(s.gyro.x)),
        format!("Gyro Y:{}", format_field(s.gyro.y)),
        format!("Gyro Z:{}", format_field(s.gyro.z)),
        format!("Mag X:{}", format_field(s.mag.x)),
        format!("Mag Y:{}", format_field(s.mag.y)),
        format!("Mag Z:{}", format_field(s.mag.z)),
        format!("Yaw (z):{}", format_field(o.yaw)),
        format!("Pitch (y):{}", format_field(o.pitch)),
        format!("Roll (x):{}", format_field(o.roll)),
    ];
    match since_last_ms {
        Some(ms) => lines.push(format!("ms since last iteration: {}", format_field(ms))),
        None => lines.push("ms since last iteration:".to_string()),
    }
    lines
}

/// Blocks until a key is pressed on stdin, with the terminal in raw mode.
pub fn wait_for_keypress(prompt: &str) -> Result<(), CanonicalError> {
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock().into_raw_mode().map_err(
        |e| io_error("Could not enter raw mode", e))?;
    write!(stdout, "{}{}{}", clear::All, cursor::Goto(1, 1), prompt).map_err(
        |e| io_error("Could not write prompt", e))?;
    stdout.flush().map_err(|e| io_error("Could not write prompt", e))?;
    let stdin = std::io::stdin();
    if let Some(Err(e)) = stdin.lock().keys().next() {
        return Err(io_error("Could not read key", e));
    }
    write!(stdout, "{}", clear::All).map_err(|e| io_error("Could not clear screen", e))?;
    stdout.flush().map_err(|e| io_error("Could not clear screen", e))?;
    Ok(())
}

// Redraws a fixed block of text each tick. Output is a single buffered
// write per Reading. Presentation only; logging to stdout must be disabled
// while this is active.
pub struct LiveDisplay<W: Write + Send> {
    out: W,
    last_update: Option<Instant>,
    cursor_hidden: bool,
}

impl LiveDisplay<std::io::Stdout> {
    pub fn stdout() -> Result<Self, CanonicalError> {
        LiveDisplay::new(std::io::stdout())
    }
}

impl<W: Write + Send> LiveDisplay<W> {
    pub fn new(mut out: W) -> Result<Self, CanonicalError> {
        write!(out, "{}{}", clear::All, cursor::Hide).map_err(
            |e| io_error("Could not initialize display", e))?;
        out.flush().map_err(|e| io_error("Could not initialize display", e))?;
        Ok(LiveDisplay{out, last_update: None, cursor_hidden: true})
    }

    fn draw(&mut self, lines: &[String]) -> Result<(), CanonicalError> {
        let mut frame = String::new();
        for (row, line) in lines.iter().enumerate() {
            frame.push_str(&format!("{}{}{}", cursor::Goto(1, row as u16 + 1),
                                    clear::CurrentLine, line));
        }
        self.out.write_all(frame.as_bytes()).map_err(
            |e| io_error("Display write failed", e))?;
        self.out.flush().map_err(|e| io_error("Display write failed", e))
    }
}

impl<W: Write + Send> Sink for LiveDisplay<W> {
    fn name(&self) -> &str {
        "display"
    }

    fn deliver(&mut self, reading: &Reading) -> Result<(), CanonicalError> {
        let now = Instant::now();
        let since_last_ms = self.last_update.map(
            |last| (now - last).as_secs_f64() * 1000.0);
        self.last_update = Some(now);
        let lines = render_lines(reading, since_last_ms);
        self.draw(&lines)
    }

    fn close(&mut self) -> Result<(), CanonicalError> {
        if !self.cursor_hidden {
            return Ok(());
        }
        self.cursor_hidden = false;
        write!(self.out, "{}{}\r\n", cursor::Goto(1, 16), cursor::Show).map_err(
            |e| io_error("Could not restore display", e))?;
        self.out.flush().map_err(|e| io_error("Could not restore display", e))
    }
}

// Make sure the cursor comes back even if close() was never reached.
impl<W: Write + Send> Drop for LiveDisplay<W> {
    fn drop(&mut self) {
        if self.cursor_hidden {
            let _ = write!(self.out, "{}", cursor::Show);
            let _ = self.out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::imu_trait::{AccelData, GyroData, MagData, Orientation,
                           Quaternion, Sample};
    use super::*;

    fn reading() -> Reading {
        Reading {
            sample: Sample {
                dev_id: "pi".to_string(),
                time_ms: 5,
                accel: AccelData{x: 1.5, y: -0.25, z: 9.81},
                gyro: GyroData{x: 0.0, y: 12.0, z: -120.5},
                mag: MagData{x: 30.0, y: -5.0, z: 42.125},
                quaternion: Quaternion::identity(),
            },
            orientation: Orientation{yaw: -90.0, pitch: 10.0, roll: 179.5},
        }
    }

    #[test]
    fn test_format_field() {
        assert_eq!(format_field(1.5), " 001.500");
        assert_eq!(format_field(-1.5), "-001.500");
        assert_eq!(format_field(0.0), " 000.000");
        assert_eq!(format_field(-0.0), " 000.000");
        assert_eq!(format_field(123.4567), " 123.457");
        // Wider values are not truncated.
        assert_eq!(format_field(12345.0), " 12345.000");
    }

    #[test]
    fn test_render_lines() {
        let lines = render_lines(&reading(), Some(10.02));
        assert_eq!(lines.len(), 14);
        assert_eq!(lines[0], "Basic reading");
        assert_eq!(lines[1], "Accel X: 001.500");
        assert_eq!(lines[2], "Accel Y:-000.250");
        assert_eq!(lines[6], "Gyro Z:-120.500");
        assert_eq!(lines[9], "Mag Z: 042.125");
        assert_eq!(lines[10], "Yaw (z):-090.000");
        assert_eq!(lines[12], "Roll (x): 179.500");
        assert_eq!(lines[13], "ms since last iteration:  010.020");

        let lines = render_lines(&reading(), None);
        assert_eq!(lines[13], "ms since last iteration:");
    }

    #[test]
    fn test_display_writes_and_restores_cursor() {
        let mut display = LiveDisplay::new(Vec::<u8>::new()).unwrap();
        display.deliver(&reading()).unwrap();
        display.deliver(&reading()).unwrap();
        display.close().unwrap();
        // Second close is a no-op.
        display.close().unwrap();

        let text = String::from_utf8(display.out.clone()).unwrap();
        assert!(text.starts_with(&format!("{}{}", clear::All, cursor::Hide)));
        assert!(text.contains("Pitch (y): 010.000"));
        assert_eq!(text.matches("ms since last iteration: ").count(), 1);
        assert!(text.ends_with(&format!("{}\r\n", cursor::Show)));
    }

}  // mod tests.
