//! Memory-to-memory encode device.
//!
//! The hardware backend talks to the encoder through `M2mDevice`. The V4L2
//! implementation drives a multi-planar M2M node: raw frames go in on the
//! output queue by DMA-buf fd, compressed packets come back on the capture
//! queue from a fixed pool of mmapped buffers.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags as CapFlags;
use v4l::format::FieldOrder;
use v4l::memory::Memory;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{
    self, v4l2_buffer, v4l2_control, v4l2_format, v4l2_outputparm, v4l2_pix_format_mplane,
    v4l2_plane, v4l2_plane_pix_format, v4l2_requestbuffers, v4l2_streamparm,
};
use v4l::{Capabilities, Device};

use crate::buffer::Mapping;
use crate::camera::{ColorSpace, PixelFormat};
use crate::sys;

/// Stream layout programmed before buffers are requested.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct M2mFormat {
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the raw input.
    pub stride: u32,
    pub colorspace: ColorSpace,
    pub fps: f32,
    /// Size of each compressed-output buffer.
    pub capture_buffer_size: u32,
}

/// Encoder hardware as seen by `HardwareEncoder`.
///
/// `queue_output` runs on the capture completion thread while `wait`,
/// `dequeue_output` and `dequeue_capture` run on the encoder's dequeue
/// thread, so implementations synchronize internally.
pub trait M2mDevice: Send + Sync {
    fn name(&self) -> &str;

    fn set_control(&self, id: u32, value: i32) -> Result<()>;

    fn configure(&self, format: &M2mFormat) -> Result<()>;

    /// Request `output_count` DMA-buf input slots and `capture_count`
    /// compressed-output buffers, then queue every capture buffer.
    fn request_buffers(&self, output_count: u32, capture_count: u32) -> Result<()>;

    fn stream_on(&self) -> Result<()>;

    fn stream_off(&self) -> Result<()>;

    /// Submit a raw frame on input slot `index`.
    fn queue_output(
        &self,
        index: u32,
        fd: BorrowedFd<'_>,
        size: usize,
        timestamp_us: u64,
    ) -> Result<()>;

    /// Wait for a compressed packet. `Ok(false)` on timeout.
    fn wait(&self, timeout_ms: i32) -> Result<bool>;

    /// Reclaim one consumed input slot.
    fn dequeue_output(&self) -> Result<u32>;

    /// Take one compressed packet, hand it to `sink` with its timestamp and
    /// give the buffer back to the device.
    fn dequeue_capture(&self, sink: &mut dyn FnMut(&[u8], u64)) -> Result<()>;
}

/// Whether the node at `path` identifies itself as `expected_model`.
pub fn probe(path: &Path, expected_model: &str) -> bool {
    match query_card(path) {
        Ok(card) => {
            log::debug!("M2mDevice: {} identifies as '{}'", path.display(), card);
            card == expected_model
        }
        Err(err) => {
            log::debug!("M2mDevice: probe of {} failed: {}", path.display(), err);
            false
        }
    }
}

fn query_caps(path: &Path) -> Result<Capabilities> {
    Device::with_path(path)
        .and_then(|device| device.query_caps())
        .with_context(|| format!("VIDIOC_QUERYCAP on {}", path.display()))
}

fn query_card(path: &Path) -> Result<String> {
    Ok(query_caps(path)?.card)
}

fn open_node(path: &Path) -> Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(OwnedFd::from(file))
}

fn zeroed_buffer(type_: u32, memory: Memory, plane: &mut v4l2_plane) -> v4l2_buffer {
    // SAFETY: plain C struct; all-zero is valid.
    let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
    buf.type_ = type_;
    buf.memory = memory as u32;
    buf.length = 1;
    buf.m.planes = plane as *mut v4l2_plane;
    buf
}

fn zeroed_plane() -> v4l2_plane {
    // SAFETY: plain C struct; all-zero is valid.
    unsafe { std::mem::zeroed() }
}

fn timestamp_us(buf: &v4l2_buffer) -> u64 {
    buf.timestamp.tv_sec as u64 * 1_000_000 + buf.timestamp.tv_usec as u64
}

// ----------------------------------------------------------------------------
// V4L2 multi-planar M2M node
// ----------------------------------------------------------------------------

const OUTPUT: u32 = BufType::VideoOutputMplane as u32;
const CAPTURE: u32 = BufType::VideoCaptureMplane as u32;

pub struct V4l2M2mDevice {
    name: String,
    node: PathBuf,
    fd: OwnedFd,
    capture: Mutex<Vec<Mapping>>,
}

impl V4l2M2mDevice {
    pub fn open(node: &Path) -> Result<Self> {
        let caps = query_caps(node)?;
        if !caps.capabilities.contains(CapFlags::VIDEO_M2M_MPLANE) {
            bail!("{} is not a multi-planar M2M device", node.display());
        }
        let fd = open_node(node)?;
        log::info!("V4l2M2mDevice: opened {} ({})", node.display(), caps.card);
        Ok(Self {
            name: caps.card,
            node: node.to_path_buf(),
            fd,
            capture: Mutex::new(Vec::new()),
        })
    }

    fn request(&self, type_: u32, memory: Memory, count: u32) -> Result<u32> {
        // SAFETY: plain C struct; all-zero is valid.
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = type_;
        req.memory = memory as u32;
        // SAFETY: VIDIOC_REQBUFS takes a v4l2_requestbuffers.
        unsafe { sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_REQBUFS as libc::c_ulong, &mut req) }
            .with_context(|| format!("VIDIOC_REQBUFS type {}", type_))?;
        Ok(req.count)
    }

    fn queue_capture(&self, index: u32) -> Result<()> {
        let mut plane = zeroed_plane();
        let mut buf = zeroed_buffer(CAPTURE, Memory::Mmap, &mut plane);
        buf.index = index;
        // SAFETY: VIDIOC_QBUF takes a v4l2_buffer whose plane array outlives the call.
        unsafe { sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_QBUF as libc::c_ulong, &mut buf) }
            .with_context(|| format!("VIDIOC_QBUF capture {}", index))
    }

    fn stream(&self, request: libc::c_ulong, what: &str) -> Result<()> {
        for type_ in [OUTPUT, CAPTURE] {
            let mut buf_type = type_ as libc::c_int;
            // SAFETY: VIDIOC_STREAMON/OFF take a buffer type int.
            unsafe { sys::ioctl(self.fd.as_fd(), request, &mut buf_type) }
                .with_context(|| format!("{} type {}", what, type_))?;
        }
        Ok(())
    }

    fn set_format(&self, type_: u32, pix: v4l2_pix_format_mplane, what: &str) -> Result<()> {
        // SAFETY: plain C struct; all-zero is valid.
        let mut fmt: v4l2_format = unsafe { std::mem::zeroed() };
        fmt.type_ = type_;
        fmt.fmt.pix_mp = pix;
        // SAFETY: VIDIOC_S_FMT takes a v4l2_format.
        unsafe { sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_S_FMT as libc::c_ulong, &mut fmt) }
            .with_context(|| format!("set {} format", what))
    }
}

impl M2mDevice for V4l2M2mDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        let mut ctrl = v4l2_control { id, value };
        // SAFETY: VIDIOC_S_CTRL takes a v4l2_control.
        unsafe { sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_S_CTRL as libc::c_ulong, &mut ctrl) }
            .with_context(|| format!("set control {:#x} to {}", id, value))
    }

    fn configure(&self, format: &M2mFormat) -> Result<()> {
        let mut raw = mplane(format.width, format.height, PixelFormat::Yuv420.pixelformat());
        raw.colorspace = format.colorspace.v4l2();
        raw.plane_fmt[0] = plane_format(format.stride, 0);
        self.set_format(OUTPUT, raw, "output")?;

        let mut h264 = mplane(format.width, format.height, u32::from_le_bytes(*b"H264"));
        h264.colorspace = v4l_sys::v4l2_colorspace_V4L2_COLORSPACE_DEFAULT;
        h264.plane_fmt[0] = plane_format(0, format.capture_buffer_size);
        self.set_format(CAPTURE, h264, "capture")?;

        // SAFETY: plain C structs; all-zero is valid.
        let (mut parm, mut output): (v4l2_streamparm, v4l2_outputparm) =
            unsafe { (std::mem::zeroed(), std::mem::zeroed()) };
        output.timeperframe.numerator = 1;
        output.timeperframe.denominator = format.fps.round().max(1.0) as u32;
        parm.type_ = OUTPUT;
        parm.parm.output = output;
        // SAFETY: VIDIOC_S_PARM takes a v4l2_streamparm.
        unsafe { sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_S_PARM as libc::c_ulong, &mut parm) }
            .context("set frame rate")?;
        Ok(())
    }

    fn request_buffers(&self, output_count: u32, capture_count: u32) -> Result<()> {
        let granted = self.request(OUTPUT, Memory::DmaBuf, output_count)?;
        if granted < output_count {
            bail!("encoder granted {} of {} input buffers", granted, output_count);
        }
        let granted = self.request(CAPTURE, Memory::Mmap, capture_count)?;
        if granted < capture_count {
            bail!("encoder granted {} of {} output buffers", granted, capture_count);
        }

        let mut mappings = Vec::with_capacity(capture_count as usize);
        for index in 0..capture_count {
            let mut plane = zeroed_plane();
            let mut buf = zeroed_buffer(CAPTURE, Memory::Mmap, &mut plane);
            buf.index = index;
            // SAFETY: VIDIOC_QUERYBUF fills a v4l2_buffer and its plane array.
            unsafe {
                sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_QUERYBUF as libc::c_ulong, &mut buf)
            }
            .with_context(|| format!("VIDIOC_QUERYBUF capture {}", index))?;
            // SAFETY: QUERYBUF on an MMAP buffer fills mem_offset.
            let offset = unsafe { plane.m.mem_offset };
            let mapping = Mapping::map(self.fd.as_fd(), plane.length as usize, offset as libc::off_t)
                .with_context(|| format!("map capture buffer {}", index))?;
            mappings.push(mapping);
            self.queue_capture(index)?;
        }
        *self
            .capture
            .lock()
            .map_err(|_| anyhow!("capture mappings lock poisoned"))? = mappings;
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        self.stream(vidioc::VIDIOC_STREAMON as libc::c_ulong, "VIDIOC_STREAMON")
    }

    fn stream_off(&self) -> Result<()> {
        self.stream(vidioc::VIDIOC_STREAMOFF as libc::c_ulong, "VIDIOC_STREAMOFF")
    }

    fn queue_output(
        &self,
        index: u32,
        fd: BorrowedFd<'_>,
        size: usize,
        timestamp_us: u64,
    ) -> Result<()> {
        let mut plane = zeroed_plane();
        plane.m.fd = fd.as_raw_fd();
        plane.bytesused = size as u32;
        plane.length = size as u32;
        let mut buf = zeroed_buffer(OUTPUT, Memory::DmaBuf, &mut plane);
        buf.index = index;
        buf.field = FieldOrder::Progressive as u32;
        buf.timestamp.tv_sec = (timestamp_us / 1_000_000) as _;
        buf.timestamp.tv_usec = (timestamp_us % 1_000_000) as _;
        // SAFETY: VIDIOC_QBUF takes a v4l2_buffer whose plane array outlives the call.
        unsafe { sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_QBUF as libc::c_ulong, &mut buf) }
            .with_context(|| format!("VIDIOC_QBUF output {}", index))
    }

    fn wait(&self, timeout_ms: i32) -> Result<bool> {
        sys::poll_readable(self.fd.as_fd(), timeout_ms)
            .with_context(|| format!("poll {}", self.node.display()))
    }

    fn dequeue_output(&self) -> Result<u32> {
        let mut plane = zeroed_plane();
        let mut buf = zeroed_buffer(OUTPUT, Memory::DmaBuf, &mut plane);
        // SAFETY: VIDIOC_DQBUF fills a v4l2_buffer and its plane array.
        unsafe { sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_DQBUF as libc::c_ulong, &mut buf) }
            .context("VIDIOC_DQBUF output")?;
        Ok(buf.index)
    }

    fn dequeue_capture(&self, sink: &mut dyn FnMut(&[u8], u64)) -> Result<()> {
        let mut plane = zeroed_plane();
        let mut buf = zeroed_buffer(CAPTURE, Memory::Mmap, &mut plane);
        // SAFETY: VIDIOC_DQBUF fills a v4l2_buffer and its plane array.
        unsafe { sys::ioctl(self.fd.as_fd(), vidioc::VIDIOC_DQBUF as libc::c_ulong, &mut buf) }
            .context("VIDIOC_DQBUF capture")?;
        let index = buf.index;
        {
            let mappings = self
                .capture
                .lock()
                .map_err(|_| anyhow!("capture mappings lock poisoned"))?;
            let mapping = mappings
                .get(index as usize)
                .ok_or_else(|| anyhow!("capture buffer {} is not mapped", index))?;
            let data = mapping.as_slice();
            let used = (plane.bytesused as usize).min(data.len());
            sink(&data[..used], timestamp_us(&buf));
        }
        self.queue_capture(index)
    }
}

impl Drop for V4l2M2mDevice {
    fn drop(&mut self) {
        // Mappings must go before the buffers are released.
        if let Ok(mut mappings) = self.capture.lock() {
            mappings.clear();
        }
        let _ = self.request(OUTPUT, Memory::DmaBuf, 0);
        let _ = self.request(CAPTURE, Memory::Mmap, 0);
    }
}

fn mplane(width: u32, height: u32, pixelformat: u32) -> v4l2_pix_format_mplane {
    // SAFETY: plain C struct; all-zero is valid.
    let mut pix: v4l2_pix_format_mplane = unsafe { std::mem::zeroed() };
    pix.width = width;
    pix.height = height;
    pix.pixelformat = pixelformat;
    pix.field = FieldOrder::Progressive as u32;
    pix.num_planes = 1;
    pix
}

fn plane_format(bytesperline: u32, sizeimage: u32) -> v4l2_plane_pix_format {
    // SAFETY: plain C struct; all-zero is valid.
    let mut plane: v4l2_plane_pix_format = unsafe { std::mem::zeroed() };
    plane.bytesperline = bytesperline;
    plane.sizeimage = sizeimage;
    plane
}
