//! Thermal sensor profiles and USB device lookup.
//!
//! Profiles map a USB VID:PID to the stream geometry and telemetry layout
//! of a known thermal core. Profile files are embedded at compile time
//! from `profiles/*.toml`.

use crate::frame::TelemetryPosition;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;

const PROFILE_1E4E_0100: &str = include_str!("../profiles/1e4e-0100.toml");

/// PureThermal board USB vendor ID.
pub const PURETHERMAL_VID: u16 = 0x1e4e;
/// PureThermal board USB product ID.
pub const PURETHERMAL_PID: u16 = 0x0100;

static PROFILE_DB: OnceLock<Vec<SensorProfile>> = OnceLock::new();

/// One profile file.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorProfile {
    pub device: UsbIdentity,
    pub stream: StreamLayout,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsbIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
}

/// Native stream geometry, including telemetry rows.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamLayout {
    pub fourcc: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub telemetry_rows: u32,
    #[serde(default)]
    pub telemetry_position: TelemetryPosition,
}

fn profile_db() -> &'static Vec<SensorProfile> {
    PROFILE_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [PROFILE_1E4E_0100] {
            match toml::from_str::<SensorProfile>(src) {
                Ok(p) => db.push(p),
                Err(e) => tracing::error!(error = %e, "bad sensor profile TOML"),
            }
        }
        db
    })
}

/// Look up a profile by USB vendor:product ID.
pub fn lookup_profile(vid: u16, pid: u16) -> Option<&'static SensorProfile> {
    profile_db()
        .iter()
        .find(|p| p.device.vendor_id == vid && p.device.product_id == pid)
}

pub fn list_profiles() -> &'static [SensorProfile] {
    profile_db()
}

/// Read USB VID:PID from sysfs for a `/dev/videoN` device.
///
/// Returns `None` if the device is not USB or sysfs is unavailable.
pub fn usb_ids(device_path: &str) -> Option<(u16, u16)> {
    let dev_name = Path::new(device_path).file_name()?.to_str()?;
    // The device link points at the USB interface; its parent is the USB device.
    let interface_dir =
        std::fs::canonicalize(format!("/sys/class/video4linux/{dev_name}/device")).ok()?;
    let usb_device_dir = interface_dir.parent()?;

    let vid = std::fs::read_to_string(usb_device_dir.join("idVendor")).ok()?;
    let pid = std::fs::read_to_string(usb_device_dir.join("idProduct")).ok()?;
    Some((parse_hex_id(&vid)?, parse_hex_id(&pid)?))
}

fn parse_hex_id(s: &str) -> Option<u16> {
    u16::from_str_radix(s.trim(), 16).ok()
}

/// Find the first `/dev/videoN` whose USB IDs match `vid:pid`.
///
/// UVC devices expose a metadata node next to the capture node; only nodes
/// with the VIDEO_CAPTURE capability are considered.
pub fn find_by_usb_id(vid: u16, pid: u16) -> Option<String> {
    crate::camera::list_devices()
        .into_iter()
        .find(|d| d.usb_id == Some((vid, pid)))
        .map(|d| d.path)
}
