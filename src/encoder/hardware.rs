//! Hardware H.264 backend on a memory-to-memory encode device.
//!
//! The backend is responsible for:
//! - Programming codec controls, formats and frame rate before streaming
//! - Submitting capture buffers to the device by DMA-buf fd, without copies
//! - Draining compressed packets on a dedicated dequeue thread
//! - Re-applying bitrate and IDR period on reload
//!
//! The backend MUST NOT:
//! - Hold a capture buffer beyond the `encode` call that lent it
//! - Stop on a single failed submission or dequeue

use anyhow::{anyhow, Context, Result};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use v4l::v4l_sys;

use super::m2m::{M2mDevice, M2mFormat};
use super::{EncoderOptions, OutputCallback};
use crate::camera::ColorSpace;
use crate::params::Parameters;

pub struct HardwareEncoder {
    device: Arc<dyn M2mDevice>,
    buffer_count: usize,
    next_slot: AtomicUsize,
    drops: AtomicU64,
    shutdown: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl HardwareEncoder {
    /// Program `device` and start draining it into `output`.
    pub fn create(
        params: &Parameters,
        stride: u32,
        colorspace: ColorSpace,
        device: Arc<dyn M2mDevice>,
        options: &EncoderOptions,
        output: OutputCallback,
    ) -> Result<Self> {
        let controls = [
            (
                v4l_sys::V4L2_CID_MPEG_VIDEO_H264_I_PERIOD,
                params.idr_period as i32,
            ),
            (v4l_sys::V4L2_CID_MPEG_VIDEO_BITRATE, params.bitrate as i32),
            (
                v4l_sys::V4L2_CID_MPEG_VIDEO_H264_PROFILE,
                profile_value(&params.hardware_h264_profile),
            ),
            (
                v4l_sys::V4L2_CID_MPEG_VIDEO_H264_LEVEL,
                level_value(&params.hardware_h264_level),
            ),
            (v4l_sys::V4L2_CID_MPEG_VIDEO_REPEAT_SEQ_HEADER, 0),
        ];
        for (id, value) in controls {
            device.set_control(id, value)?;
        }

        device.configure(&M2mFormat {
            width: params.width,
            height: params.height,
            stride,
            colorspace,
            fps: params.fps,
            capture_buffer_size: options.capture_buffer_size,
        })?;
        device.request_buffers(params.buffer_count, params.capture_buffer_count)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = DequeueWorker {
            device: Arc::clone(&device),
            shutdown: Arc::clone(&shutdown),
            poll_ms: options.poll_timeout_ms,
            output,
        };
        let join = start_streaming(device.as_ref(), || spawn_dequeue(worker))?;

        log::info!(
            "HardwareEncoder: {} encoding {}x{} @ {} fps, {} bps",
            device.name(),
            params.width,
            params.height,
            params.fps,
            params.bitrate
        );
        Ok(Self {
            device,
            buffer_count: params.buffer_count.max(1) as usize,
            next_slot: AtomicUsize::new(0),
            drops: AtomicU64::new(0),
            shutdown,
            join: Mutex::new(Some(join)),
        })
    }

    /// Submit a frame on the next input slot. Called from the capture
    /// completion thread; a refused submission drops the frame.
    pub fn encode(&self, fd: BorrowedFd<'_>, size: usize, timestamp_us: u64) {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.buffer_count;
        if let Err(err) = self
            .device
            .queue_output(slot as u32, fd, size, timestamp_us)
        {
            let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!(
                "HardwareEncoder: frame at {} us dropped ({} total): {:#}",
                timestamp_us,
                drops,
                err
            );
        }
    }

    pub fn reload_params(&self, params: &Parameters) {
        if let Err(err) = self
            .device
            .set_control(v4l_sys::V4L2_CID_MPEG_VIDEO_BITRATE, params.bitrate as i32)
        {
            log::error!("HardwareEncoder: bitrate not applied: {:#}", err);
        }
        if let Err(err) = self.device.set_control(
            v4l_sys::V4L2_CID_MPEG_VIDEO_H264_I_PERIOD,
            params.idr_period as i32,
        ) {
            log::error!("HardwareEncoder: IDR period not applied: {:#}", err);
        }
    }

    /// Frames dropped because the device refused them.
    pub fn dropped_frames(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Join the dequeue thread and stop streaming. Safe to call twice.
    pub fn stop(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let join = self
            .join
            .lock()
            .map_err(|_| anyhow!("encoder join lock poisoned"))?
            .take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| anyhow!("encoder dequeue thread panicked"))?;
            self.device.stream_off()?;
            log::info!(
                "HardwareEncoder: stopped ({} frames dropped)",
                self.dropped_frames()
            );
        }
        Ok(())
    }
}

impl Drop for HardwareEncoder {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("HardwareEncoder: shutdown failed: {}", err);
        }
    }
}

/// Stream on, then start the dequeue thread. The device is streamed off
/// again when the thread cannot be started.
fn start_streaming<F>(device: &dyn M2mDevice, spawn: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<JoinHandle<()>>,
{
    device.stream_on()?;
    match spawn() {
        Ok(join) => Ok(join),
        Err(err) => {
            if let Err(stop_err) = device.stream_off() {
                log::warn!("HardwareEncoder: stream off failed: {:#}", stop_err);
            }
            Err(err)
        }
    }
}

fn spawn_dequeue(worker: DequeueWorker) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("h264-dequeue".to_string())
        .spawn(move || worker.run())
        .context("spawn encoder dequeue thread")
}

struct DequeueWorker {
    device: Arc<dyn M2mDevice>,
    shutdown: Arc<AtomicBool>,
    poll_ms: i32,
    output: OutputCallback,
}

impl DequeueWorker {
    fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.device.wait(self.poll_ms) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    log::error!("HardwareEncoder: poll failed: {:#}", err);
                    std::thread::sleep(std::time::Duration::from_millis(
                        self.poll_ms.max(1) as u64,
                    ));
                    continue;
                }
            }
            if let Err(err) = self.device.dequeue_output() {
                log::error!("HardwareEncoder: {:#}", err);
                continue;
            }
            let output = &self.output;
            if let Err(err) = self
                .device
                .dequeue_capture(&mut |data, timestamp_us| output(data, timestamp_us))
            {
                log::error!("HardwareEncoder: {:#}", err);
            }
        }
    }
}

fn profile_value(name: &str) -> i32 {
    match name {
        "baseline" => v4l_sys::v4l2_mpeg_video_h264_profile_V4L2_MPEG_VIDEO_H264_PROFILE_BASELINE as i32,
        "main" => v4l_sys::v4l2_mpeg_video_h264_profile_V4L2_MPEG_VIDEO_H264_PROFILE_MAIN as i32,
        _ => v4l_sys::v4l2_mpeg_video_h264_profile_V4L2_MPEG_VIDEO_H264_PROFILE_HIGH as i32,
    }
}

fn level_value(name: &str) -> i32 {
    match name {
        "4.0" => v4l_sys::v4l2_mpeg_video_h264_level_V4L2_MPEG_VIDEO_H264_LEVEL_4_0 as i32,
        "4.1" => v4l_sys::v4l2_mpeg_video_h264_level_V4L2_MPEG_VIDEO_H264_LEVEL_4_1 as i32,
        _ => v4l_sys::v4l2_mpeg_video_h264_level_V4L2_MPEG_VIDEO_H264_LEVEL_4_2 as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferAllocator, MEMFD_HEAP};
    use crate::encoder::loopback::LoopbackDevice;
    use std::sync::mpsc;
    use std::time::Duration;

    fn encoder(
        device: Arc<LoopbackDevice>,
        params: &Parameters,
    ) -> Result<(HardwareEncoder, mpsc::Receiver<(Vec<u8>, u64)>)> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let output: OutputCallback = Arc::new(move |data: &[u8], ts: u64| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send((data.to_vec(), ts));
            }
        });
        let encoder = HardwareEncoder::create(
            params,
            params.width,
            ColorSpace::Smpte170m,
            device,
            &EncoderOptions {
                poll_timeout_ms: 20,
                ..EncoderOptions::default()
            },
            output,
        )?;
        Ok((encoder, rx))
    }

    fn small_params() -> Parameters {
        Parameters {
            width: 64,
            height: 48,
            ..Parameters::default()
        }
    }

    #[test]
    fn profile_and_level_mapping() {
        assert_eq!(profile_value("baseline"), 0);
        assert_eq!(profile_value("main"), 2);
        assert_eq!(profile_value("high"), 4);
        assert_eq!(profile_value("unknown"), 4);
        assert_eq!(level_value("4.0"), 11);
        assert_eq!(level_value("4.1"), 12);
        assert_eq!(level_value("4.2"), 13);
        assert_eq!(level_value(""), 13);
    }

    #[test]
    fn create_programs_controls_and_format() -> Result<()> {
        let device = Arc::new(LoopbackDevice::new("loopback"));
        let params = Parameters {
            idr_period: 30,
            bitrate: 2_000_000,
            hardware_h264_profile: "baseline".to_string(),
            hardware_h264_level: "4.0".to_string(),
            ..small_params()
        };
        let (encoder, _rx) = encoder(Arc::clone(&device), &params)?;
        assert_eq!(
            device.controls(),
            vec![
                (v4l_sys::V4L2_CID_MPEG_VIDEO_H264_I_PERIOD, 30),
                (v4l_sys::V4L2_CID_MPEG_VIDEO_BITRATE, 2_000_000),
                (v4l_sys::V4L2_CID_MPEG_VIDEO_H264_PROFILE, 0),
                (v4l_sys::V4L2_CID_MPEG_VIDEO_H264_LEVEL, 11),
                (v4l_sys::V4L2_CID_MPEG_VIDEO_REPEAT_SEQ_HEADER, 0),
            ]
        );
        let format = device.format().expect("format programmed");
        assert_eq!(format.stride, 64);
        assert_eq!(format.capture_buffer_size, 512 << 10);
        assert!(device.is_streaming());
        encoder.stop()?;
        assert!(!device.is_streaming());
        Ok(())
    }

    #[test]
    fn failed_thread_start_streams_off() {
        let device = LoopbackDevice::new("loopback");
        let result = start_streaming(&device, || Err(anyhow!("out of threads")));
        assert!(result.is_err());
        assert!(!device.is_streaming());
    }

    #[test]
    fn timestamp_survives_device_roundtrip() -> Result<()> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let frame = allocator.alloc("frame", 64 * 48 * 3 / 2, false)?;
        let device = Arc::new(LoopbackDevice::new("loopback"));
        let (encoder, rx) = encoder(Arc::clone(&device), &small_params())?;

        encoder.encode(frame.fd(), frame.len(), 42_000_123);
        let (packet, ts) = rx.recv_timeout(Duration::from_secs(2))?;
        assert_eq!(ts, 42_000_123);
        assert!(!packet.is_empty());
        encoder.stop()?;
        Ok(())
    }

    #[test]
    fn refused_submission_is_dropped_and_counted() -> Result<()> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let frame = allocator.alloc("frame", 64 * 48 * 3 / 2, false)?;
        let device = Arc::new(LoopbackDevice::new("loopback"));
        let (encoder, rx) = encoder(Arc::clone(&device), &small_params())?;

        device.fail_next_submissions(1);
        encoder.encode(frame.fd(), frame.len(), 1);
        encoder.encode(frame.fd(), frame.len(), 2);
        let (_, ts) = rx.recv_timeout(Duration::from_secs(2))?;
        assert_eq!(ts, 2);
        assert_eq!(encoder.dropped_frames(), 1);
        encoder.stop()?;
        Ok(())
    }

    #[test]
    fn reload_reapplies_bitrate_and_idr_period() -> Result<()> {
        let device = Arc::new(LoopbackDevice::new("loopback"));
        let (encoder, _rx) = encoder(Arc::clone(&device), &small_params())?;
        let before = device.controls().len();
        let params = Parameters {
            bitrate: 3_000_000,
            idr_period: 15,
            ..small_params()
        };
        encoder.reload_params(&params);
        encoder.reload_params(&params);
        let controls = device.controls();
        assert_eq!(
            &controls[before..],
            &[
                (v4l_sys::V4L2_CID_MPEG_VIDEO_BITRATE, 3_000_000),
                (v4l_sys::V4L2_CID_MPEG_VIDEO_H264_I_PERIOD, 15),
                (v4l_sys::V4L2_CID_MPEG_VIDEO_BITRATE, 3_000_000),
                (v4l_sys::V4L2_CID_MPEG_VIDEO_H264_I_PERIOD, 15),
            ]
        );
        encoder.stop()?;
        Ok(())
    }
}
