//! Frame types and decoding: Y16 thermal grids, telemetry rows, YUYV/MJPG to RGB.

use std::time::Instant;

/// Bytes per sample in a Y16 thermal frame.
pub const Y16_BYTES_PER_SAMPLE: usize = 2;

/// A raw 16-bit thermal frame as delivered by the sensor.
///
/// Samples are row-major, `width * height` long. For radiometric sensors
/// each sample is a temperature in hundredths of a Kelvin.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u16>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

/// Where the sensor appends its telemetry rows relative to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryPosition {
    Top,
    #[default]
    Bottom,
}

impl RawFrame {
    /// Decode a little-endian Y16 buffer.
    ///
    /// The buffer must be exactly `width * height * 2` bytes. Anything else
    /// is treated as a corrupt transfer and rejected.
    pub fn from_le_bytes(bytes: &[u8], width: u32, height: u32) -> Result<Self, FrameError> {
        check_y16_len(bytes.len(), width, height)?;
        Ok(Self {
            data: decode_le_u16(bytes),
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Drop `rows` telemetry rows from the top or bottom of the frame.
    pub fn strip_telemetry(
        &self,
        rows: u32,
        position: TelemetryPosition,
    ) -> Result<RawFrame, FrameError> {
        if rows >= self.height {
            return Err(FrameError::TooFewRows {
                height: self.height,
                telemetry_rows: rows,
            });
        }
        let w = self.width as usize;
        let keep = (self.height - rows) as usize;
        let start = match position {
            TelemetryPosition::Top => rows as usize * w,
            TelemetryPosition::Bottom => 0,
        };
        Ok(RawFrame {
            data: self.data[start..start + keep * w].to_vec(),
            width: self.width,
            height: self.height - rows,
            captured_at: self.captured_at,
        })
    }
}

/// An undecoded Y16 buffer copied out of a driver callback.
///
/// Construction only checks the length and copies bytes; the sample decode
/// is deferred to [`Y16Buffer::decode`] on the consuming thread.
#[derive(Debug, Clone)]
pub struct Y16Buffer {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl Y16Buffer {
    /// Copy `bytes` if they hold exactly one `width` x `height` Y16 frame.
    pub fn copy_from(bytes: &[u8], width: u32, height: u32) -> Result<Self, FrameError> {
        check_y16_len(bytes.len(), width, height)?;
        Ok(Self {
            bytes: bytes.to_vec(),
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Decode to samples, keeping the copy-out time as the capture time.
    pub fn decode(&self) -> RawFrame {
        RawFrame {
            data: decode_le_u16(&self.bytes),
            width: self.width,
            height: self.height,
            captured_at: self.captured_at,
        }
    }
}

fn check_y16_len(actual: usize, width: u32, height: u32) -> Result<(), FrameError> {
    let expected = width as usize * height as usize * Y16_BYTES_PER_SAMPLE;
    if actual != expected {
        return Err(FrameError::InvalidLength { expected, actual });
    }
    Ok(())
}

fn decode_le_u16(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(Y16_BYTES_PER_SAMPLE)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// A decoded RGB8 frame from the visible-light camera.
#[derive(Debug, Clone)]
pub struct ColorFrame {
    /// Interleaved RGB bytes (width * height * 3).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

/// Convert packed YUYV (4:2:2) to interleaved RGB using BT.601 coefficients.
///
/// Each 4-byte group [Y0, U, Y1, V] yields two pixels sharing U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    if pixels % 2 != 0 {
        return Err(FrameError::Decode(format!(
            "YUYV {width}x{height} has an odd pixel count"
        )));
    }
    let expected = pixels * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let mut rgb = Vec::with_capacity(pixels * 3);
    for group in yuyv[..expected].chunks_exact(4) {
        let u = group[1] as f32 - 128.0;
        let v = group[3] as f32 - 128.0;
        for y in [group[0], group[2]] {
            let y = y as f32;
            rgb.push((y + 1.402 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

/// Decode a Motion-JPEG buffer into interleaved RGB, checking its dimensions.
pub fn mjpeg_to_rgb(jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .into_rgb8();
    if img.width() != width || img.height() != height {
        return Err(FrameError::Decode(format!(
            "MJPG frame is {}x{}, expected {width}x{height}",
            img.width(),
            img.height()
        )));
    }
    Ok(img.into_raw())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame has {height} rows, cannot strip {telemetry_rows} telemetry rows")]
    TooFewRows { height: u32, telemetry_rows: u32 },
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_bytes(samples: &[u16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_raw_frame_exact_length() {
        let bytes = le_bytes(&[30000, 27315, 1, 65535, 0, 2]);
        let frame = RawFrame::from_le_bytes(&bytes, 3, 2).unwrap();
        assert_eq!(frame.data, vec![30000, 27315, 1, 65535, 0, 2]);
        assert_eq!((frame.width, frame.height), (3, 2));
    }

    #[test]
    fn test_raw_frame_rejects_short_and_long() {
        let bytes = vec![0u8; 3 * 2 * 2];
        assert!(RawFrame::from_le_bytes(&bytes[..11], 3, 2).is_err());

        let mut long = bytes.clone();
        long.push(0);
        let err = RawFrame::from_le_bytes(&long, 3, 2).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidLength {
                expected: 12,
                actual: 13
            }
        ));
    }

    #[test]
    fn test_strip_telemetry_bottom() {
        // 2x4 frame, rows are [0,0] [1,1] [2,2] [9,9]; last row is telemetry
        let bytes = le_bytes(&[0, 0, 1, 1, 2, 2, 9, 9]);
        let frame = RawFrame::from_le_bytes(&bytes, 2, 4).unwrap();
        let image = frame.strip_telemetry(1, TelemetryPosition::Bottom).unwrap();
        assert_eq!(image.height, 3);
        assert_eq!(image.data, vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_strip_telemetry_top() {
        let bytes = le_bytes(&[9, 9, 8, 8, 1, 1, 2, 2]);
        let frame = RawFrame::from_le_bytes(&bytes, 2, 4).unwrap();
        let image = frame.strip_telemetry(2, TelemetryPosition::Top).unwrap();
        assert_eq!(image.height, 2);
        assert_eq!(image.data, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_strip_telemetry_whole_frame_rejected() {
        let frame = RawFrame::from_le_bytes(&le_bytes(&[1, 2]), 1, 2).unwrap();
        assert!(frame.strip_telemetry(2, TelemetryPosition::Bottom).is_err());
    }

    #[test]
    fn test_yuyv_to_rgb_gray() {
        // Neutral chroma: RGB equals luma
        let yuyv = vec![100, 128, 200, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_to_rgb_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_yuyv_to_rgb_odd_pixel_count_rejected() {
        // 3x1 has no partner for the last pixel; 3 pixels * 2 bytes would
        // otherwise pass the length check.
        let yuyv = vec![100, 128, 110, 128, 120, 128];
        assert!(matches!(yuyv_to_rgb(&yuyv, 3, 1), Err(FrameError::Decode(_))));

        let rgb = yuyv_to_rgb(&[16, 128, 16, 128, 16, 128, 16, 128], 2, 2).unwrap();
        assert_eq!(rgb.len(), 2 * 2 * 3);
    }

    #[test]
    fn test_y16_buffer_copies_then_decodes() {
        let bytes = le_bytes(&[30000, 27315, 1, 2]);
        let buffer = Y16Buffer::copy_from(&bytes, 2, 2).unwrap();
        assert_eq!(buffer.bytes, bytes);

        let frame = buffer.decode();
        assert_eq!(frame.data, vec![30000, 27315, 1, 2]);
        assert_eq!((frame.width, frame.height), (2, 2));
        assert_eq!(frame.captured_at, buffer.captured_at);
    }

    #[test]
    fn test_y16_buffer_rejects_wrong_length() {
        let err = Y16Buffer::copy_from(&[0u8; 7], 2, 2).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidLength {
                expected: 8,
                actual: 7
            }
        ));
    }

    #[test]
    fn test_mjpeg_garbage_rejected() {
        assert!(matches!(
            mjpeg_to_rgb(&[0xde, 0xad, 0xbe, 0xef], 2, 2),
            Err(FrameError::Decode(_))
        ));
    }
}
