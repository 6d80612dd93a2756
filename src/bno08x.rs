// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError,
                      failed_precondition_error, internal_error,
                      invalid_argument_error, unavailable_error};
use log::{debug, info, warn};
use rppal::i2c::I2c;

use crate::imu_trait::{AccelData, GyroData, MagData, Quaternion, Sample,
                       SampleSource, TimestampSequencer, monotonic_millis};

// BNO08x I2C addresses. The alternate is used when SA0 is pulled low.
pub const BNO08X_ADDR: u16 = 0x4A;
pub const BNO08X_ALTERNATE_ADDR: u16 = 0x4B;

// SHTP channels.
const CHANNEL_CONTROL: u8 = 2;
const CHANNEL_INPUT_REPORT: u8 = 3;

const SHTP_HEADER_SIZE: usize = 4;
// Largest packet the device sends (the advertisement) plus header.
const SHTP_MAX_PACKET: usize = 512;

// SH-2 control report IDs.
const SET_FEATURE_COMMAND: u8 = 0xFD;
const PRODUCT_ID_REQUEST: u8 = 0xF9;
const PRODUCT_ID_RESPONSE: u8 = 0xF8;
const BASE_TIMESTAMP: u8 = 0xFB;
const TIMESTAMP_REBASE: u8 = 0xFA;

// SH-2 sensor report IDs.
const REPORT_ACCELEROMETER: u8 = 0x01;
const REPORT_GYROSCOPE: u8 = 0x02;
const REPORT_MAGNETOMETER: u8 = 0x03;
const REPORT_LINEAR_ACCELERATION: u8 = 0x04;
const REPORT_ROTATION_VECTOR: u8 = 0x05;
const REPORT_GAME_ROTATION_VECTOR: u8 = 0x08;
const REPORT_GEOMAGNETIC_ROTATION_VECTOR: u8 = 0x09;

// Reports enabled at init. The fused quaternion comes from the rotation
// vector; the geomagnetic rotation vector is enabled so that the
// magnetometer keeps being calibrated into the fusion.
const ENABLED_REPORTS: [u8; 5] = [
    REPORT_LINEAR_ACCELERATION,
    REPORT_GYROSCOPE,
    REPORT_MAGNETOMETER,
    REPORT_ROTATION_VECTOR,
    REPORT_GEOMAGNETIC_ROTATION_VECTOR,
];

// Q-point scale factors for converting fixed point report fields.
const Q4_SCALE: f64 = 1.0 / 16.0;  // Magnetometer, µT.
const Q8_SCALE: f64 = 1.0 / 256.0;  // Acceleration, m/s².
const Q9_SCALE: f64 = 1.0 / 512.0;  // Gyroscope, rad/s.
const Q14_SCALE: f64 = 1.0 / 16384.0;  // Quaternion.

// Upper bound on packets drained per poll() so a chatty device cannot hold
// the scheduler tick.
const MAX_PACKETS_PER_POLL: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct ShtpPacket {
    pub channel: u8,
    pub sequence: u8,
    pub payload: Vec<u8>,
}

/// Packet level access to an SHTP device. Bno08x holds one of these rather
/// than being one, so tests can substitute a scripted transport.
pub trait ShtpTransport {
    // Returns Ok(None) if the device has nothing to send.
    fn read_packet(&mut self) -> Result<Option<ShtpPacket>, CanonicalError>;

    fn write_packet(&mut self, channel: u8, payload: &[u8])
                    -> Result<(), CanonicalError>;
}

// SHTP over Linux I2C.
pub struct I2cTransport {
    i2c: I2c,
    address: u16,
    // Per-channel sequence numbers for packets we send.
    sequence: [u8; 6],
}

impl I2cTransport {
    pub fn new(bus: u8, address: u16) -> Result<Self, CanonicalError> {
        let mut i2c = I2c::with_bus(bus)
            .map_err(|e| unavailable_error(
                &format!("Failed to initialize I2C bus {}: {:?}", bus, e)))?;
        i2c.set_slave_address(address)
            .map_err(|e| invalid_argument_error(
                &format!("Failed to set I2C slave address: {:?}", e)))?;
        Ok(I2cTransport{i2c, address, sequence: [0; 6]})
    }

    pub fn address(&self) -> u16 {
        self.address
    }
}

impl ShtpTransport for I2cTransport {
    fn read_packet(&mut self) -> Result<Option<ShtpPacket>, CanonicalError> {
        // The device restarts its output buffer on every read, so we first
        // read the header to learn the length, then read the whole packet
        // (header included) in a second transaction.
        let mut header = [0u8; SHTP_HEADER_SIZE];
        self.i2c.read(&mut header)
            .map_err(|e| unavailable_error(
                &format!("Failed to read SHTP header: {:?}", e)))?;
        let length = match parse_header_length(&header) {
            Some(length) => length,
            None => return Ok(None),
        };
        let mut buffer = vec![0u8; length.min(SHTP_MAX_PACKET)];
        self.i2c.read(&mut buffer)
            .map_err(|e| unavailable_error(
                &format!("Failed to read SHTP packet: {:?}", e)))?;
        if parse_header_length(&buffer[..SHTP_HEADER_SIZE]).is_none() {
            return Ok(None);
        }
        Ok(Some(ShtpPacket{
            channel: buffer[2],
            sequence: buffer[3],
            payload: buffer[SHTP_HEADER_SIZE..].to_vec(),
        }))
    }

    fn write_packet(&mut self, channel: u8, payload: &[u8])
                    -> Result<(), CanonicalError> {
        let length = (payload.len() + SHTP_HEADER_SIZE) as u16;
        let seq_slot = (channel as usize).min(self.sequence.len() - 1);
        let sequence = self.sequence[seq_slot];
        self.sequence[seq_slot] = sequence.wrapping_add(1);

        let mut buffer = Vec::with_capacity(length as usize);
        buffer.extend_from_slice(&length.to_le_bytes());
        buffer.push(channel);
        buffer.push(sequence);
        buffer.extend_from_slice(payload);
        self.i2c.write(&buffer)
            .map_err(|e| internal_error(
                &format!("Failed to write SHTP packet: {:?}", e)))?;
        Ok(())
    }
}

// Returns the total packet length (header included) from an SHTP header, or
// None if the header indicates no data.
fn parse_header_length(header: &[u8]) -> Option<usize> {
    if header.len() < SHTP_HEADER_SIZE {
        return None;
    }
    let raw = u16::from_le_bytes([header[0], header[1]]);
    if raw == 0xFFFF {
        return None;
    }
    // Bit 15 is the continuation flag.
    let length = (raw & 0x7FFF) as usize;
    if length <= SHTP_HEADER_SIZE {
        return None;
    }
    Some(length)
}

// Calls `open` with the primary address, then once with the alternate
// address if that fails. Returns the opened device and the address used.
pub fn open_with_address_fallback<T, F>(mut open: F)
                                        -> Result<(T, u16), CanonicalError>
where F: FnMut(u16) -> Result<T, CanonicalError>
{
    match open(BNO08X_ADDR) {
        Ok(device) => Ok((device, BNO08X_ADDR)),
        Err(e) => {
            warn!("No IMU at 0x{:02X} ({:?}); trying 0x{:02X}",
                  BNO08X_ADDR, e, BNO08X_ALTERNATE_ADDR);
            let device = open(BNO08X_ALTERNATE_ADDR)?;
            Ok((device, BNO08X_ALTERNATE_ADDR))
        }
    }
}

fn build_set_feature_command(report_id: u8, report_interval_us: u32) -> [u8; 17] {
    let interval = report_interval_us.to_le_bytes();
    [
        SET_FEATURE_COMMAND,
        report_id,
        0x00,  // Feature flags.
        0x00, 0x00,  // Change sensitivity.
        interval[0], interval[1], interval[2], interval[3],
        0x00, 0x00, 0x00, 0x00,  // Batch interval.
        0x00, 0x00, 0x00, 0x00,  // Sensor-specific config.
    ]
}

fn read_xyz(report: &[u8], scale: f64) -> (f64, f64, f64) {
    let x = i16::from_le_bytes([report[4], report[5]]);
    let y = i16::from_le_bytes([report[6], report[7]]);
    let z = i16::from_le_bytes([report[8], report[9]]);
    (x as f64 * scale, y as f64 * scale, z as f64 * scale)
}

// Size in bytes of a sensor report, None for IDs we do not know how to skip.
fn report_size(report_id: u8) -> Option<usize> {
    match report_id {
        REPORT_ACCELEROMETER | REPORT_GYROSCOPE |
        REPORT_MAGNETOMETER | REPORT_LINEAR_ACCELERATION => Some(10),
        REPORT_ROTATION_VECTOR | REPORT_GEOMAGNETIC_ROTATION_VECTOR => Some(14),
        REPORT_GAME_ROTATION_VECTOR => Some(12),
        _ => None,
    }
}

/// BNO08x 9-axis IMU exposed as a SampleSource. Retains the most recent
/// value of each report type; poll() drains whatever packets the device has
/// queued and returns the latest values.
pub struct Bno08x<T: ShtpTransport> {
    transport: T,
    dev_id: String,

    accel: Option<AccelData>,
    gyro: Option<GyroData>,
    mag: Option<MagData>,
    quaternion: Option<Quaternion>,

    timestamps: TimestampSequencer,
}

impl Bno08x<I2cTransport> {
    /// Opens the BNO08x on the given I2C bus, trying the alternate address
    /// if the primary one does not respond, and enables its reports.
    pub fn open(bus: u8, dev_id: &str, report_interval: Duration)
                -> Result<Self, CanonicalError> {
        let (imu, address) = open_with_address_fallback(|address| {
            let transport = I2cTransport::new(bus, address)?;
            Bno08x::new(transport, dev_id, report_interval)
        })?;
        info!("BNO08x found at 0x{:02X} on I2C bus {}", address, bus);
        Ok(imu)
    }
}

impl<T: ShtpTransport> Bno08x<T> {
    /// Verifies the device identity and enables the accelerometer, gyro,
    /// magnetometer and rotation vector reports at `report_interval`.
    pub fn new(transport: T, dev_id: &str, report_interval: Duration)
               -> Result<Self, CanonicalError> {
        let report_interval_us = u32::try_from(report_interval.as_micros())
            .map_err(|_| invalid_argument_error(
                &format!("Report interval too long: {:?}", report_interval)))?;
        if report_interval_us == 0 {
            return Err(invalid_argument_error("Report interval must be positive"));
        }
        let mut imu = Bno08x{
            transport,
            dev_id: dev_id.to_string(),
            accel: None,
            gyro: None,
            mag: None,
            quaternion: None,
            timestamps: TimestampSequencer::new(),
        };
        imu.verify_device()?;
        for report_id in ENABLED_REPORTS {
            imu.transport.write_packet(
                CHANNEL_CONTROL,
                &build_set_feature_command(report_id, report_interval_us))?;
        }
        info!("BNO08x configured: {} reports every {}us",
              ENABLED_REPORTS.len(), report_interval_us);
        Ok(imu)
    }

    pub fn release(self) -> T {
        self.transport
    }

    // Requests the product ID and waits for the response, discarding the
    // advertisement and any other packets the device sends after boot.
    fn verify_device(&mut self) -> Result<(), CanonicalError> {
        self.transport.write_packet(CHANNEL_CONTROL, &[PRODUCT_ID_REQUEST, 0x00])?;
        for _ in 0..20 {
            match self.transport.read_packet()? {
                Some(packet) => {
                    if packet.channel == CHANNEL_CONTROL &&
                        packet.payload.first() == Some(&PRODUCT_ID_RESPONSE)
                    {
                        let payload = &packet.payload;
                        if payload.len() >= 4 {
                            info!("Device verified: BNO08x (SW version {}.{})",
                                  payload[2], payload[3]);
                        }
                        return Ok(());
                    }
                    debug!("Discarding packet on channel {} during init",
                           packet.channel);
                },
                None => {
                    std::thread::sleep(Duration::from_millis(10));
                },
            }
        }
        Err(failed_precondition_error("No product ID response from BNO08x"))
    }

    fn process_input_report(&mut self, payload: &[u8]) {
        let mut offset = 0;
        while offset < payload.len() {
            let report_id = payload[offset];
            if report_id == BASE_TIMESTAMP || report_id == TIMESTAMP_REBASE {
                offset += 5;
                continue;
            }
            let size = match report_size(report_id) {
                Some(size) => size,
                None => {
                    debug!("Unknown report 0x{:02X}; skipping rest of packet", report_id);
                    return;
                }
            };
            if offset + size > payload.len() {
                debug!("Truncated report 0x{:02X}", report_id);
                return;
            }
            self.process_sensor_report(&payload[offset..offset + size]);
            offset += size;
        }
    }

    fn process_sensor_report(&mut self, report: &[u8]) {
        match report[0] {
            REPORT_LINEAR_ACCELERATION | REPORT_ACCELEROMETER => {
                let (x, y, z) = read_xyz(report, Q8_SCALE);
                self.accel = Some(AccelData{x, y, z});
            },
            REPORT_GYROSCOPE => {
                // Device reports rad/s.
                let (x, y, z) = read_xyz(report, Q9_SCALE);
                self.gyro = Some(GyroData{
                    x: x.to_degrees(), y: y.to_degrees(), z: z.to_degrees()});
            },
            REPORT_MAGNETOMETER => {
                let (x, y, z) = read_xyz(report, Q4_SCALE);
                self.mag = Some(MagData{x, y, z});
            },
            REPORT_ROTATION_VECTOR => {
                let (i, j, k) = read_xyz(report, Q14_SCALE);
                let real = i16::from_le_bytes([report[10], report[11]]) as f64 * Q14_SCALE;
                self.quaternion = Some(Quaternion::new(real, i, j, k));
            },
            _ => {},
        }
    }

    fn missing_report(&self) -> Option<&'static str> {
        if self.accel.is_none() {
            Some("linear acceleration")
        } else if self.gyro.is_none() {
            Some("gyroscope")
        } else if self.mag.is_none() {
            Some("magnetometer")
        } else if self.quaternion.is_none() {
            Some("rotation vector")
        } else {
            None
        }
    }
}

impl<T: ShtpTransport> SampleSource for Bno08x<T> {
    fn poll(&mut self) -> Result<Sample, CanonicalError> {
        for _ in 0..MAX_PACKETS_PER_POLL {
            match self.transport.read_packet()? {
                Some(packet) => {
                    if packet.channel == CHANNEL_INPUT_REPORT {
                        self.process_input_report(&packet.payload);
                    }
                },
                None => break,
            }
        }
        if let Some(missing) = self.missing_report() {
            return Err(unavailable_error(
                &format!("No {} report received from BNO08x", missing)));
        }
        let time_ms = self.timestamps.next(monotonic_millis()?);
        Ok(Sample{
            dev_id: self.dev_id.clone(),
            time_ms,
            accel: self.accel.unwrap_or_default(),
            gyro: self.gyro.unwrap_or_default(),
            mag: self.mag.unwrap_or_default(),
            quaternion: self.quaternion.unwrap_or_else(Quaternion::identity),
        })
    }

    fn get_model(&self) -> String {
        "BNO08x".to_string()
    }
}

// mod tests.
