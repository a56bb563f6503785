//! Capture controller.
//!
//! `CaptureSession` owns the camera, its per-stream buffers and the fixed
//! pool of capture requests. Hardware access goes through the `CameraDevice`
//! trait; `v4l2` drives a real capture node and `synthetic` backs `stub://`
//! devices.

pub mod buffers;
pub mod config;
pub mod controls;
pub mod decimate;
pub mod device;
pub mod session;
pub mod synthetic;
pub mod v4l2;

use anyhow::{anyhow, Result};

pub use config::{CameraConfiguration, ColorSpace, PixelFormat, StreamRole, ValidationStatus};
pub use controls::{CameraProperties, Control, ControlId, ControlList};
pub use device::{CameraDevice, CameraInfo, Completion, RequestStatus};
pub use session::{CaptureSession, Frame};
pub use synthetic::{SyntheticCamera, SyntheticCameraConfig, SyntheticHandle};

use crate::params::Parameters;

/// Device setting that picks among the enumerated V4L2 cameras.
pub const AUTO_CAMERA: &str = "auto";
const STUB_PREFIX: &str = "stub://";

/// Cameras eligible for selection, in `camera_id` order: USB-attached
/// cameras dropped, the rest ordered by id descending.
pub fn selection_order(mut cameras: Vec<CameraInfo>) -> Vec<CameraInfo> {
    cameras.retain(|camera| !camera.id.contains("/usb"));
    cameras.sort_by(|a, b| b.id.cmp(&a.id));
    cameras
}

pub fn select_camera(cameras: Vec<CameraInfo>, camera_id: u32) -> Result<CameraInfo> {
    let mut cameras = selection_order(cameras);
    let index = camera_id as usize;
    if index >= cameras.len() {
        return Err(anyhow!("selected camera is not available"));
    }
    Ok(cameras.swap_remove(index))
}

/// Open the camera named by a device setting.
///
/// `auto` selects among enumerated capture nodes using the snapshot's camera
/// id, a `/dev/videoN` path opens that node directly and `stub://<name>`
/// creates a synthetic camera running at the snapshot's frame rate.
pub fn open_camera(device: &str, params: &Parameters) -> Result<Box<dyn CameraDevice>> {
    if device.starts_with(STUB_PREFIX) {
        let camera = SyntheticCamera::new(SyntheticCameraConfig {
            id: device.to_string(),
            fps: Some(params.fps),
            ..SyntheticCameraConfig::default()
        });
        log::info!("Camera: using synthetic camera {}", device);
        return Ok(Box::new(camera));
    }

    let info = if device == AUTO_CAMERA {
        select_camera(v4l2::enumerate()?, params.camera_id)?
    } else {
        CameraInfo {
            id: device.to_string(),
            node: device.into(),
        }
    };
    v4l2::set_sensor_hdr(params.hdr);
    log::info!("Camera: selected {} ({})", info.id, info.node.display());
    Ok(Box::new(v4l2::V4l2Camera::open(info)?))
}
