//! Capture session lifecycle.
//!
//! The session is responsible for:
//! - Validating and committing the stream configuration
//! - Allocating one buffer per stream per request and binding them
//! - Submitting every request at start and recycling each on completion
//! - Decimating the secondary stream by wall-clock interval
//! - Applying pending control changes at the next completion
//! - Latching the first cancellation into a permanent error state
//!
//! The session MUST NOT:
//! - Let a frame callback keep buffer memory past its return
//! - Create or destroy requests after start
//! - Fire the error callback more than once

use anyhow::{anyhow, bail, Context, Result};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::buffers::BufferArena;
use super::config::{CameraConfiguration, ColorSpace, StreamRole, ValidationStatus};
use super::controls::{dynamic_controls, start_controls, CameraProperties, ControlList};
use super::decimate::SecondaryStreamState;
use super::device::{CameraDevice, Completion, RequestStatus};
use crate::buffer::{BufferAllocator, CpuAccess, DmaBuffer};
use crate::params::Parameters;

const COMPLETION_POLL: Duration = Duration::from_millis(100);

/// A completed capture, valid for the duration of the frame callback.
pub struct Frame<'a> {
    /// Mapped primary buffer.
    pub data: &'a [u8],
    pub fd: BorrowedFd<'a>,
    /// Total bytes in the primary buffer.
    pub size: usize,
    pub timestamp_us: u64,
    /// Mapped secondary buffer, present only when the decimator lets it through.
    pub secondary: Option<&'a [u8]>,
}

pub type FrameCallback = Box<dyn FnMut(&Frame<'_>) + Send>;
pub type ErrorCallback = Box<dyn FnOnce() + Send>;
/// Paints into the primary buffer before the frame callback sees it.
pub type OverlayCallback = Box<dyn FnMut(&mut [u8]) + Send>;

struct SessionShared {
    pending: Mutex<ControlList>,
    in_error: AtomicBool,
    stopping: AtomicBool,
    frames: AtomicU64,
}

pub struct CaptureSession {
    device: Arc<Mutex<Box<dyn CameraDevice>>>,
    arena: Arc<BufferArena>,
    config: CameraConfiguration,
    properties: CameraProperties,
    secondary_fps: f32,
    shared: Arc<SessionShared>,
    frame_cb: Option<FrameCallback>,
    error_cb: Option<ErrorCallback>,
    overlay_cb: Option<OverlayCallback>,
    worker: Option<JoinHandle<()>>,
    started: bool,
}

impl CaptureSession {
    /// Configure `device` for `params` and allocate every request's buffers.
    pub fn create(
        params: &Parameters,
        mut device: Box<dyn CameraDevice>,
        allocator: &BufferAllocator,
    ) -> Result<Self> {
        params.validate()?;
        let mut config = CameraConfiguration::from_params(params);
        match device.validate(&mut config) {
            ValidationStatus::Valid => {}
            ValidationStatus::Adjusted => {
                log::warn!(
                    "CaptureSession: {} adjusted the stream configuration: {:?}",
                    device.id(),
                    config.streams
                );
            }
            ValidationStatus::Invalid => {
                bail!("stream configuration is invalid for camera {}", device.id());
            }
        }
        device
            .configure(&config)
            .with_context(|| format!("configure camera {}", device.id()))?;

        let depth = params.buffer_count as usize;
        let arena = BufferArena::allocate(allocator, &config, depth)?;
        for slot in 0..depth {
            device.bind_request(slot, &arena.request_buffers(slot))?;
        }

        let properties = device.properties();
        log::info!(
            "CaptureSession: camera {} configured with streams {:?}",
            device.id(),
            config.roles()
        );

        Ok(Self {
            device: Arc::new(Mutex::new(device)),
            arena: Arc::new(arena),
            config,
            properties,
            secondary_fps: params.secondary_fps,
            shared: Arc::new(SessionShared {
                pending: Mutex::new(ControlList::new()),
                in_error: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                frames: AtomicU64::new(0),
            }),
            frame_cb: None,
            error_cb: None,
            overlay_cb: None,
            worker: None,
            started: false,
        })
    }

    /// Register the frame callback. It runs on the completion thread.
    pub fn on_frame<F>(&mut self, callback: F)
    where
        F: FnMut(&Frame<'_>) + Send + 'static,
    {
        self.frame_cb = Some(Box::new(callback));
    }

    /// Register the error callback, fired at most once on the completion thread.
    pub fn on_error<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.error_cb = Some(Box::new(callback));
    }

    /// Register a writer that runs on each primary buffer ahead of `on_frame`.
    pub fn on_overlay<F>(&mut self, callback: F)
    where
        F: FnMut(&mut [u8]) + Send + 'static,
    {
        self.overlay_cb = Some(Box::new(callback));
    }

    /// Apply the initial controls and submit every request.
    pub fn start(&mut self, params: &Parameters) -> Result<()> {
        if self.started {
            bail!("capture session already started");
        }
        let frame_cb = self
            .frame_cb
            .take()
            .ok_or_else(|| anyhow!("frame callback not registered"))?;
        let controls = start_controls(params, &self.properties)?;

        let depth = self.arena.depth();
        let (tx, rx) = mpsc::sync_channel(depth);
        self.lock_device()?
            .start(&controls, tx)
            .context("start camera")?;
        self.started = true;

        let secondary = self
            .config
            .stream(StreamRole::Secondary)
            .map(|_| SecondaryStreamState::new(self.secondary_fps, Instant::now()));
        let handler = CompletionHandler {
            device: Arc::clone(&self.device),
            arena: Arc::clone(&self.arena),
            shared: Arc::clone(&self.shared),
            secondary,
            frame_cb,
            error_cb: self.error_cb.take(),
            overlay_cb: self.overlay_cb.take(),
        };
        self.worker = Some(
            std::thread::Builder::new()
                .name("capture-completion".to_string())
                .spawn(move || handler.run(rx))
                .context("spawn completion thread")?,
        );

        let empty = ControlList::new();
        for slot in 0..depth {
            self.arena.submit(slot)?;
            self.lock_device()?
                .queue_request(slot, &empty)
                .with_context(|| format!("queue request {}", slot))?;
        }
        log::info!("CaptureSession: started with {} requests", depth);
        Ok(())
    }

    /// Stage new dynamic controls; they apply at the next completion.
    pub fn reload_controls(&self, params: &Parameters) -> Result<()> {
        let controls = dynamic_controls(params);
        self.shared
            .pending
            .lock()
            .map_err(|_| anyhow!("pending controls lock poisoned"))?
            .merge(&controls);
        Ok(())
    }

    pub fn stride(&self, role: StreamRole) -> Result<u32> {
        self.config
            .stream(role)
            .map(|stream| stream.stride)
            .ok_or_else(|| anyhow!("{} stream is not configured", role.name()))
    }

    pub fn colorspace(&self, role: StreamRole) -> Result<ColorSpace> {
        let stream = self
            .config
            .stream(role)
            .ok_or_else(|| anyhow!("{} stream is not configured", role.name()))?;
        Ok(stream.color_space.unwrap_or(ColorSpace::Smpte170m))
    }

    pub fn configuration(&self) -> &CameraConfiguration {
        &self.config
    }

    /// Number of capture requests; fixed for the session's lifetime.
    pub fn request_count(&self) -> usize {
        self.arena.depth()
    }

    /// Requests currently held by the hardware.
    pub fn in_flight(&self) -> usize {
        self.arena.in_flight()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.shared.frames.load(Ordering::SeqCst)
    }

    pub fn is_in_error(&self) -> bool {
        self.shared.in_error.load(Ordering::SeqCst)
    }

    /// Stop the device and join the completion thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stopped = if self.started {
            self.lock_device()?.stop()
        } else {
            Ok(())
        };
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("completion thread panicked"))?;
        }
        log::info!(
            "CaptureSession: stopped after {} frames",
            self.frames_delivered()
        );
        stopped
    }

    fn lock_device(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn CameraDevice>>> {
        self.device
            .lock()
            .map_err(|_| anyhow!("camera device lock poisoned"))
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("CaptureSession: shutdown failed: {}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Completion thread
// ----------------------------------------------------------------------------

struct CompletionHandler {
    device: Arc<Mutex<Box<dyn CameraDevice>>>,
    arena: Arc<BufferArena>,
    shared: Arc<SessionShared>,
    secondary: Option<SecondaryStreamState>,
    frame_cb: FrameCallback,
    error_cb: Option<ErrorCallback>,
    overlay_cb: Option<OverlayCallback>,
}

impl CompletionHandler {
    fn run(mut self, rx: Receiver<Completion>) {
        loop {
            match rx.recv_timeout(COMPLETION_POLL) {
                Ok(completion) => self.handle(completion),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle(&mut self, completion: Completion) {
        if self.shared.stopping.load(Ordering::SeqCst)
            || self.shared.in_error.load(Ordering::SeqCst)
        {
            return;
        }

        if completion.status == RequestStatus::Cancelled {
            self.shared.in_error.store(true, Ordering::SeqCst);
            log::error!("CaptureSession: request {} cancelled", completion.slot);
            if let Some(error_cb) = self.error_cb.take() {
                error_cb();
            }
            return;
        }

        let slot = completion.slot;
        if let Err(err) = self.arena.complete(slot) {
            log::warn!("CaptureSession: unexpected completion: {}", err);
            return;
        }

        let forward_secondary = match self.secondary.as_mut() {
            Some(state) => state.should_emit(Instant::now()),
            None => false,
        };
        if let Err(err) = self.deliver(slot, completion.timestamp_ns / 1000, forward_secondary) {
            log::warn!("CaptureSession: frame {} not delivered: {}", slot, err);
        }

        if let Err(err) = self.requeue(slot) {
            if !self.shared.stopping.load(Ordering::SeqCst) {
                log::error!("CaptureSession: request {} not requeued: {}", slot, err);
            }
        }
    }

    fn deliver(&mut self, slot: usize, timestamp_us: u64, forward_secondary: bool) -> Result<()> {
        let video = self
            .arena
            .buffer(StreamRole::Video, slot)
            .ok_or_else(|| anyhow!("no video buffer for slot {}", slot))?;
        if let Some(overlay) = self.overlay_cb.as_mut() {
            let mut access = video.begin_cpu_access(true)?;
            let data = access
                .data_mut()
                .ok_or_else(|| anyhow!("video buffer is not mapped"))?;
            overlay(data);
        }
        let video_access = cpu_access(video)?;
        let data = video_access
            .data()
            .ok_or_else(|| anyhow!("video buffer is not mapped"))?;

        let secondary_access = if forward_secondary {
            match self.arena.buffer(StreamRole::Secondary, slot) {
                Some(buffer) => Some(cpu_access(buffer)?),
                None => None,
            }
        } else {
            None
        };

        let frame = Frame {
            data,
            fd: video.fd(),
            size: video.len(),
            timestamp_us,
            secondary: secondary_access.as_ref().and_then(CpuAccess::data),
        };
        (self.frame_cb)(&frame);
        self.shared.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn requeue(&mut self, slot: usize) -> Result<()> {
        self.arena.recycle(slot)?;
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }
        let controls = self
            .shared
            .pending
            .lock()
            .map_err(|_| anyhow!("pending controls lock poisoned"))?
            .take();
        self.arena.submit(slot)?;
        self.device
            .lock()
            .map_err(|_| anyhow!("camera device lock poisoned"))?
            .queue_request(slot, &controls)
    }
}

fn cpu_access(buffer: &DmaBuffer) -> Result<CpuAccess<'_>> {
    buffer.begin_cpu_access(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MEMFD_HEAP;
    use crate::camera::synthetic::{SyntheticCamera, SyntheticCameraConfig};

    fn session(params: &Parameters) -> Result<CaptureSession> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let camera = SyntheticCamera::new(SyntheticCameraConfig::default());
        CaptureSession::create(params, Box::new(camera), &allocator)
    }

    #[test]
    fn colorspace_follows_resolution() -> Result<()> {
        let hd = session(&Parameters {
            width: 1280,
            height: 720,
            buffer_count: 1,
            ..Parameters::default()
        })?;
        assert_eq!(hd.colorspace(StreamRole::Video)?, ColorSpace::Rec709);
        assert_eq!(hd.stride(StreamRole::Video)?, 1280);

        let sd = session(&Parameters {
            width: 640,
            height: 480,
            buffer_count: 1,
            ..Parameters::default()
        })?;
        assert_eq!(sd.colorspace(StreamRole::Video)?, ColorSpace::Smpte170m);

        let err = sd.colorspace(StreamRole::Secondary).unwrap_err();
        assert_eq!(err.to_string(), "secondary stream is not configured");
        Ok(())
    }

    #[test]
    fn start_requires_a_frame_callback() -> Result<()> {
        let params = Parameters {
            width: 640,
            height: 480,
            buffer_count: 2,
            ..Parameters::default()
        };
        let mut session = session(&params)?;
        let err = session.start(&params).unwrap_err();
        assert!(err.to_string().contains("frame callback"));
        assert_eq!(session.in_flight(), 0);

        session.on_frame(|_| {});
        session.start(&params)?;
        assert_eq!(session.in_flight(), 2);
        assert!(session.start(&params).is_err());
        session.stop()
    }

    #[test]
    fn invalid_snapshot_is_rejected_before_allocation() {
        let params = Parameters {
            buffer_count: 0,
            ..Parameters::default()
        };
        let err = session(&params).err().expect("zero buffers rejected");
        assert!(err.to_string().contains("buffer count"));
    }

    #[test]
    fn overlay_paints_before_frame_callback() -> Result<()> {
        let params = Parameters {
            width: 640,
            height: 480,
            buffer_count: 1,
            ..Parameters::default()
        };
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let camera = SyntheticCamera::new(SyntheticCameraConfig {
            fps: None,
            ..SyntheticCameraConfig::default()
        });
        let handle = camera.handle();
        let mut session = CaptureSession::create(&params, Box::new(camera), &allocator)?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        session.on_overlay(|data| data[640 * 10] = 0xAB);
        {
            let seen = Arc::clone(&seen);
            session.on_frame(move |frame| seen.lock().unwrap().push(frame.data[640 * 10]));
        }
        session.start(&params)?;
        assert!(handle.trigger()?);

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "no frame delivered");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(seen.lock().unwrap()[0], 0xAB);
        session.stop()
    }
}
