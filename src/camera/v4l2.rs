//! V4L2 capture node importing DMA-heap buffers.
//!
//! The node is responsible for:
//! - Enumerating capture-capable video nodes and their stable ids
//! - Negotiating the primary YUV 4:2:0 format
//! - Importing session-owned DMA buffers (`V4L2_MEMORY_DMABUF`)
//! - Dequeuing filled buffers on its own thread and posting completions
//! - Mapping pipeline controls onto the V4L2 controls the node exposes
//!
//! A plain capture node has one output path, so configurations asking for a
//! raw or secondary stream are reported invalid.

use anyhow::{anyhow, bail, Context, Result};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Description, Flags as CtrlFlags, Type as CtrlType, Value};
use v4l::device::Handle;
use v4l::format::FieldOrder;
use v4l::memory::Memory;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{self, v4l2_buffer, v4l2_format, v4l2_pix_format, v4l2_requestbuffers};
use v4l::video::capture::Parameters as StreamParams;
use v4l::video::Capture;
use v4l::{Device, Fraction};

use super::config::{CameraConfiguration, PixelFormat, StreamRole, ValidationStatus};
use super::controls::{AwbMode, FlickerMode};
use super::controls::{CameraProperties, Control, ControlList, ManualMode, Rectangle};
use super::device::{
    CameraDevice, CameraInfo, Completion, CompletionSender, RequestBuffers, RequestStatus,
};
use crate::buffer::DmaBuffer;
use crate::sys;

const SYSFS_VIDEO: &str = "/sys/class/video4linux";
const DEQUEUE_POLL_MS: i32 = 200;

const CAPTURE: u32 = BufType::VideoCapture as u32;
const DMABUF: u32 = Memory::DmaBuf as u32;

/// Capture-capable video nodes, in device index order.
pub fn enumerate() -> Result<Vec<CameraInfo>> {
    let mut nodes = v4l::context::enum_devices();
    nodes.sort_by_key(|node| node.index());
    let mut cameras = Vec::new();
    for node in nodes {
        let path = node.path().to_path_buf();
        match Device::with_path(&path).and_then(|device| device.query_caps()) {
            Ok(caps) if is_capture_node(caps.capabilities) => {
                let sysfs = PathBuf::from(SYSFS_VIDEO)
                    .join(format!("video{}", node.index()))
                    .join("device");
                let id = std::fs::canonicalize(sysfs)
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|_| path.display().to_string());
                cameras.push(CameraInfo { id, node: path });
            }
            Ok(_) => {}
            Err(err) => log::debug!("V4l2Camera: skipping {}: {}", path.display(), err),
        }
    }
    Ok(cameras)
}

fn is_capture_node(caps: CapFlags) -> bool {
    caps.contains(CapFlags::VIDEO_CAPTURE | CapFlags::STREAMING)
        && !caps.intersects(CapFlags::VIDEO_M2M | CapFlags::VIDEO_M2M_MPLANE)
}

/// Toggle wide dynamic range on the first sensor sub-device that accepts it.
pub fn set_sensor_hdr(enabled: bool) {
    for index in 0..4 {
        let node = PathBuf::from(format!("/dev/v4l-subdev{}", index));
        let Ok(device) = Device::with_path(&node) else {
            continue;
        };
        let control = v4l::Control {
            id: v4l_sys::V4L2_CID_WIDE_DYNAMIC_RANGE,
            value: Value::Integer(i64::from(enabled)),
        };
        if device.set_control(control).is_ok() {
            log::info!("V4l2Camera: HDR {} via {}", enabled, node.display());
            return;
        }
    }
    if enabled {
        log::warn!("V4l2Camera: no sensor sub-device accepted the HDR control");
    }
}

fn borrow_fd(handle: &Handle) -> BorrowedFd<'_> {
    // SAFETY: the handle owns the descriptor and outlives the borrow.
    unsafe { BorrowedFd::borrow_raw(handle.fd()) }
}

// ----------------------------------------------------------------------------
// Capture node
// ----------------------------------------------------------------------------

pub struct V4l2Camera {
    info: CameraInfo,
    device: Device,
    handle: Arc<Handle>,
    controls: Vec<Description>,
    native: Rectangle,
    slots: Vec<Option<Arc<DmaBuffer>>>,
    queued: Arc<Mutex<Vec<bool>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2Camera {
    pub fn open(info: CameraInfo) -> Result<Self> {
        let device = Device::with_path(&info.node)
            .with_context(|| format!("open {}", info.node.display()))?;
        let format = device
            .format()
            .with_context(|| format!("read format of {}", info.node.display()))?;
        let controls = device
            .query_controls()
            .map(|all| {
                all.into_iter()
                    .filter(|desc| !desc.flags.contains(CtrlFlags::DISABLED))
                    .collect()
            })
            .unwrap_or_else(|err| {
                log::debug!("V4l2Camera: no controls on {}: {}", info.node.display(), err);
                Vec::new()
            });
        log::info!(
            "V4l2Camera: opened {} ({}x{} native, {} controls)",
            info.node.display(),
            format.width,
            format.height,
            controls.len()
        );
        Ok(Self {
            info,
            handle: device.handle(),
            device,
            controls,
            native: Rectangle {
                x: 0,
                y: 0,
                width: format.width,
                height: format.height,
            },
            slots: Vec::new(),
            queued: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    fn fd(&self) -> BorrowedFd<'_> {
        borrow_fd(&self.handle)
    }

    /// TRY_FMT or S_FMT with the primary YUV 4:2:0 layout.
    fn negotiate(
        &self,
        request: libc::c_ulong,
        width: u32,
        height: u32,
        colorspace: u32,
    ) -> Result<v4l2_pix_format> {
        // SAFETY: both are plain C structs for which all-zero is valid.
        let (mut fmt, mut pix): (v4l2_format, v4l2_pix_format) =
            unsafe { (std::mem::zeroed(), std::mem::zeroed()) };
        pix.width = width;
        pix.height = height;
        pix.pixelformat = PixelFormat::Yuv420.pixelformat();
        pix.field = FieldOrder::Progressive as u32;
        pix.colorspace = colorspace;
        fmt.type_ = CAPTURE;
        fmt.fmt.pix = pix;
        // SAFETY: VIDIOC_TRY_FMT / VIDIOC_S_FMT take a v4l2_format.
        unsafe { sys::ioctl(self.fd(), request, &mut fmt) }.context("negotiate capture format")?;
        // SAFETY: the single-planar member is active for VIDEO_CAPTURE.
        Ok(unsafe { fmt.fmt.pix })
    }

    fn describe(&self, id: u32) -> Option<&Description> {
        self.controls.iter().find(|desc| desc.id == id)
    }

    fn set_ctrl(&self, id: u32, value: i64) -> io::Result<()> {
        let value = match self.describe(id) {
            Some(desc) if desc.typ == CtrlType::Boolean => Value::Boolean(value != 0),
            _ => Value::Integer(value),
        };
        self.device.set_control(v4l::Control { id, value })
    }

    /// Set a control scaled against its reported default, e.g. contrast 1.0
    /// maps onto the device's default value.
    fn set_relative(&self, id: u32, factor: f32) -> Result<()> {
        let desc = self
            .describe(id)
            .ok_or_else(|| anyhow!("control {:#x} not supported", id))?;
        let value = (desc.default as f32 * factor).round() as i64;
        self.set_ctrl(id, value.clamp(desc.minimum, desc.maximum))?;
        Ok(())
    }

    fn apply_control(&self, control: &Control) -> Result<()> {
        match *control {
            Control::Brightness(value) => {
                let desc = self
                    .describe(v4l_sys::V4L2_CID_BRIGHTNESS)
                    .ok_or_else(|| anyhow!("brightness not supported"))?;
                let span = (desc.maximum - desc.minimum) as f32;
                let scaled = desc.minimum as f32 + (value.clamp(-1.0, 1.0) + 1.0) / 2.0 * span;
                self.set_ctrl(v4l_sys::V4L2_CID_BRIGHTNESS, scaled.round() as i64)?;
            }
            Control::Contrast(value) => self.set_relative(v4l_sys::V4L2_CID_CONTRAST, value)?,
            Control::Saturation(value) => self.set_relative(v4l_sys::V4L2_CID_SATURATION, value)?,
            Control::Sharpness(value) => self.set_relative(v4l_sys::V4L2_CID_SHARPNESS, value)?,
            Control::AwbMode(mode) => self.set_ctrl(
                v4l_sys::V4L2_CID_AUTO_WHITE_BALANCE,
                i64::from(mode == AwbMode::Auto),
            )?,
            Control::ExposureTimeMode(mode) => {
                let value = match mode {
                    ManualMode::Auto => v4l_sys::v4l2_exposure_auto_type_V4L2_EXPOSURE_AUTO,
                    ManualMode::Manual => v4l_sys::v4l2_exposure_auto_type_V4L2_EXPOSURE_MANUAL,
                };
                self.set_ctrl(v4l_sys::V4L2_CID_EXPOSURE_AUTO, i64::from(value))?
            }
            // V4L2 exposure is expressed in 100 µs units.
            Control::ExposureTime(us) => self.set_ctrl(
                v4l_sys::V4L2_CID_EXPOSURE_ABSOLUTE,
                i64::from((us / 100).max(1)),
            )?,
            Control::AnalogueGainMode(mode) => self.set_ctrl(
                v4l_sys::V4L2_CID_AUTOGAIN,
                i64::from(mode == ManualMode::Auto),
            )?,
            Control::AnalogueGain(gain) => self.set_relative(v4l_sys::V4L2_CID_GAIN, gain)?,
            Control::AeFlickerMode(FlickerMode::Off) => self.set_ctrl(
                v4l_sys::V4L2_CID_POWER_LINE_FREQUENCY,
                i64::from(
                    v4l_sys::v4l2_power_line_frequency_V4L2_CID_POWER_LINE_FREQUENCY_DISABLED,
                ),
            )?,
            Control::AeFlickerPeriod(period_us) => {
                let mode = if period_us >= 9_167 {
                    v4l_sys::v4l2_power_line_frequency_V4L2_CID_POWER_LINE_FREQUENCY_50HZ
                } else {
                    v4l_sys::v4l2_power_line_frequency_V4L2_CID_POWER_LINE_FREQUENCY_60HZ
                };
                self.set_ctrl(v4l_sys::V4L2_CID_POWER_LINE_FREQUENCY, i64::from(mode))?
            }
            Control::FrameDurationLimits([min_us, _]) => {
                let interval = Fraction::new(min_us.max(1) as u32, 1_000_000);
                self.device
                    .set_params(&StreamParams::new(interval))
                    .context("set frame interval")?;
            }
            _ => {
                log::trace!("V4l2Camera: {:?} has no V4L2 counterpart", control.id());
            }
        }
        Ok(())
    }

    fn apply_controls(&self, controls: &ControlList) {
        for control in controls.iter() {
            if let Err(err) = self.apply_control(control) {
                log::debug!("V4l2Camera: {:?} not applied: {}", control.id(), err);
            }
        }
    }

    fn stream(&self, request: libc::c_ulong, what: &str) -> Result<()> {
        let mut buf_type = CAPTURE as libc::c_int;
        // SAFETY: VIDIOC_STREAMON/OFF take a buffer type int.
        unsafe { sys::ioctl(self.fd(), request, &mut buf_type) }.context(what.to_string())
    }
}

impl CameraDevice for V4l2Camera {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn properties(&self) -> CameraProperties {
        CameraProperties {
            scaler_crop_maximum: Some(self.native),
            supports_autofocus: false,
        }
    }

    fn validate(&self, config: &mut CameraConfiguration) -> ValidationStatus {
        if config.streams.iter().any(|stream| stream.role != StreamRole::Video) {
            log::warn!(
                "V4l2Camera: {} supports the video stream only, requested {:?}",
                self.info.node.display(),
                config.roles()
            );
            return ValidationStatus::Invalid;
        }
        let Some(stream) = config.stream_mut(StreamRole::Video) else {
            return ValidationStatus::Invalid;
        };
        let colorspace = stream.color_space.map(|cs| cs.v4l2()).unwrap_or(0);
        let pix = match self.negotiate(
            vidioc::VIDIOC_TRY_FMT as libc::c_ulong,
            stream.width,
            stream.height,
            colorspace,
        ) {
            Ok(pix) => pix,
            Err(err) => {
                log::warn!("V4l2Camera: format rejected: {}", err);
                return ValidationStatus::Invalid;
            }
        };
        if pix.pixelformat != PixelFormat::Yuv420.pixelformat() {
            return ValidationStatus::Invalid;
        }
        let mut status = ValidationStatus::Valid;
        if pix.width != stream.width || pix.height != stream.height {
            stream.width = pix.width;
            stream.height = pix.height;
            status = ValidationStatus::Adjusted;
        }
        stream.stride = pix.bytesperline;
        stream.frame_size = pix.sizeimage as usize;
        status
    }

    fn configure(&mut self, config: &CameraConfiguration) -> Result<()> {
        let stream = config
            .stream(StreamRole::Video)
            .ok_or_else(|| anyhow!("video stream missing"))?;
        let colorspace = stream.color_space.map(|cs| cs.v4l2()).unwrap_or(0);
        let pix = self.negotiate(
            vidioc::VIDIOC_S_FMT as libc::c_ulong,
            stream.width,
            stream.height,
            colorspace,
        )?;
        if pix.bytesperline != stream.stride || pix.sizeimage as usize != stream.frame_size {
            bail!(
                "device settled on stride {} / size {} instead of {} / {}",
                pix.bytesperline,
                pix.sizeimage,
                stream.stride,
                stream.frame_size
            );
        }

        let (h_flip, v_flip) = config.orientation.flips();
        for (id, value) in [
            (v4l_sys::V4L2_CID_HFLIP, h_flip),
            (v4l_sys::V4L2_CID_VFLIP, v_flip),
        ] {
            if let Err(err) = self.set_ctrl(id, i64::from(value)) {
                if value {
                    bail!("orientation not supported by {}: {}", self.info.node.display(), err);
                }
            }
        }

        // SAFETY: plain C struct; all-zero is valid.
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = stream.buffer_count;
        req.type_ = CAPTURE;
        req.memory = DMABUF;
        // SAFETY: VIDIOC_REQBUFS takes a v4l2_requestbuffers.
        unsafe { sys::ioctl(self.fd(), vidioc::VIDIOC_REQBUFS as libc::c_ulong, &mut req) }
            .context("VIDIOC_REQBUFS (dmabuf)")?;
        if req.count < stream.buffer_count {
            bail!(
                "device accepted {} of {} capture buffers",
                req.count,
                stream.buffer_count
            );
        }
        self.slots = vec![None; stream.buffer_count as usize];
        *self
            .queued
            .lock()
            .map_err(|_| anyhow!("queue state lock poisoned"))? =
            vec![false; stream.buffer_count as usize];
        Ok(())
    }

    fn bind_request(&mut self, slot: usize, buffers: &RequestBuffers) -> Result<()> {
        let video = buffers
            .iter()
            .find(|(role, _)| *role == StreamRole::Video)
            .map(|(_, buffer)| Arc::clone(buffer))
            .ok_or_else(|| anyhow!("request {} has no video buffer", slot))?;
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| anyhow!("request slot {} out of range", slot))?;
        *entry = Some(video);
        Ok(())
    }

    fn start(&mut self, controls: &ControlList, completions: CompletionSender) -> Result<()> {
        self.apply_controls(controls);
        self.stream(vidioc::VIDIOC_STREAMON as libc::c_ulong, "VIDIOC_STREAMON")?;

        let handle = Arc::clone(&self.handle);
        let queued = Arc::clone(&self.queued);
        let stop = Arc::clone(&self.stop);
        let node = self.info.node.display().to_string();
        let spawned = std::thread::Builder::new()
            .name("v4l2-dequeue".to_string())
            .spawn(move || dequeue_loop(&handle, &queued, &stop, &completions, &node));
        match spawned {
            Ok(worker) => self.worker = Some(worker),
            Err(err) => {
                if let Err(off) =
                    self.stream(vidioc::VIDIOC_STREAMOFF as libc::c_ulong, "VIDIOC_STREAMOFF")
                {
                    log::warn!("V4l2Camera: {:#}", off);
                }
                return Err(err).context("spawn dequeue thread");
            }
        }
        log::info!("V4l2Camera: streaming from {}", self.info.node.display());
        Ok(())
    }

    fn queue_request(&mut self, slot: usize, controls: &ControlList) -> Result<()> {
        if !controls.is_empty() {
            self.apply_controls(controls);
        }
        let buffer = self
            .slots
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("request slot {} not bound", slot))?;
        // SAFETY: plain C struct; all-zero is valid.
        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.index = slot as u32;
        buf.type_ = CAPTURE;
        buf.memory = DMABUF;
        buf.m.fd = buffer.fd().as_raw_fd();
        buf.length = buffer.len() as u32;

        // Marked before QBUF: the dequeue thread may see the buffer complete
        // or fail before the ioctl returns.
        mark_queued(&self.queued, slot, true);
        // SAFETY: VIDIOC_QBUF takes a v4l2_buffer.
        let queued = unsafe { sys::ioctl(self.fd(), vidioc::VIDIOC_QBUF as libc::c_ulong, &mut buf) };
        if let Err(err) = queued {
            mark_queued(&self.queued, slot, false);
            return Err(err).with_context(|| format!("VIDIOC_QBUF slot {}", slot));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("dequeue thread panicked"))?;
        }
        self.stream(vidioc::VIDIOC_STREAMOFF as libc::c_ulong, "VIDIOC_STREAMOFF")?;
        log::info!("V4l2Camera: stopped {}", self.info.node.display());
        Ok(())
    }
}

fn mark_queued(queued: &Mutex<Vec<bool>>, slot: usize, held: bool) {
    if let Ok(mut queued) = queued.lock() {
        if let Some(entry) = queued.get_mut(slot) {
            *entry = held;
        }
    }
}

fn timestamp_us(buf: &v4l2_buffer) -> u64 {
    buf.timestamp.tv_sec as u64 * 1_000_000 + buf.timestamp.tv_usec as u64
}

fn dequeue_loop(
    handle: &Handle,
    queued: &Mutex<Vec<bool>>,
    stop: &AtomicBool,
    completions: &CompletionSender,
    node: &str,
) {
    let fd = borrow_fd(handle);
    while !stop.load(Ordering::SeqCst) {
        match sys::poll_readable(fd, DEQUEUE_POLL_MS) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                fail_queued(queued, completions, node, &err);
                return;
            }
        }
        // SAFETY: plain C struct; all-zero is valid.
        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.type_ = CAPTURE;
        buf.memory = DMABUF;
        // SAFETY: VIDIOC_DQBUF fills a v4l2_buffer.
        match unsafe { sys::ioctl(fd, vidioc::VIDIOC_DQBUF as libc::c_ulong, &mut buf) } {
            Ok(()) => {
                let slot = buf.index as usize;
                mark_queued(queued, slot, false);
                if buf.flags & v4l_sys::V4L2_BUF_FLAG_ERROR != 0 {
                    log::debug!("V4l2Camera: {} delivered a corrupted frame", node);
                }
                let completion = Completion {
                    slot,
                    status: RequestStatus::Complete,
                    timestamp_ns: timestamp_us(&buf) * 1000,
                };
                if completions.send(completion).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                fail_queued(queued, completions, node, &err);
                return;
            }
        }
    }
}

/// The node is gone: every request still held by it is cancelled.
fn fail_queued(
    queued: &Mutex<Vec<bool>>,
    completions: &CompletionSender,
    node: &str,
    err: &io::Error,
) {
    log::error!("V4l2Camera: {} failed: {}", node, err);
    let slots: Vec<usize> = match queued.lock() {
        Ok(mut queued) => queued
            .iter_mut()
            .enumerate()
            .filter(|(_, held)| **held)
            .map(|(slot, held)| {
                *held = false;
                slot
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    for slot in slots {
        let _ = completions.send(Completion {
            slot,
            status: RequestStatus::Cancelled,
            timestamp_ns: 0,
        });
    }
}
