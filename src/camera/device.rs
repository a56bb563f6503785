//! Camera device seam.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use super::config::{CameraConfiguration, StreamRole, ValidationStatus};
use super::controls::{CameraProperties, ControlList};
use crate::buffer::DmaBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Complete,
    Cancelled,
}

/// A request handed back by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub slot: usize,
    pub status: RequestStatus,
    /// Sensor timestamp in nanoseconds.
    pub timestamp_ns: u64,
}

/// Completions are posted from the device's own thread.
pub type CompletionSender = SyncSender<Completion>;

/// One buffer per configured stream, bound to a request slot.
pub type RequestBuffers = Vec<(StreamRole, Arc<DmaBuffer>)>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraInfo {
    /// Stable identifier; USB-attached cameras contain `/usb`.
    pub id: String,
    pub node: PathBuf,
}

/// Capture hardware as seen by a `CaptureSession`.
///
/// Setup methods run on the caller's thread before `start`. After `start`,
/// `queue_request` is called from the session's completion thread and the
/// device posts one `Completion` per queued request into the sender it was
/// started with.
pub trait CameraDevice: Send {
    fn id(&self) -> &str;

    fn properties(&self) -> CameraProperties;

    /// Adjust `config` to what the device can deliver, settling strides and
    /// frame sizes.
    fn validate(&self, config: &mut CameraConfiguration) -> ValidationStatus;

    /// Commit a validated configuration.
    fn configure(&mut self, config: &CameraConfiguration) -> Result<()>;

    /// Attach the buffers for request `slot`. Called for every slot before start.
    fn bind_request(&mut self, slot: usize, buffers: &RequestBuffers) -> Result<()>;

    fn start(&mut self, controls: &ControlList, completions: CompletionSender) -> Result<()>;

    /// Hand request `slot` to the hardware with the controls to apply to it.
    fn queue_request(&mut self, slot: usize, controls: &ControlList) -> Result<()>;

    fn stop(&mut self) -> Result<()>;
}
