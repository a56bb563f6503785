//! Loopback encode device (`stub://`).
//!
//! Every raw frame queued on the input side comes back as one synthetic
//! Annex-B packet carrying the frame's timestamp, so the hardware backend's
//! threading and buffer accounting can run without an encoder.

use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::m2m::{M2mDevice, M2mFormat};

/// Packet prefix: start code and an IDR slice NAL header.
pub const LOOPBACK_NAL_PREFIX: [u8; 5] = [0, 0, 0, 1, 0x65];

#[derive(Default)]
struct LoopbackState {
    format: Option<M2mFormat>,
    output_slots: u32,
    free_capture: u32,
    streaming: bool,
    queued: Vec<u32>,
    consumed: VecDeque<u32>,
    packets: VecDeque<(Vec<u8>, u64)>,
    controls: Vec<(u32, i32)>,
    fail_submissions: usize,
}

pub struct LoopbackDevice {
    name: String,
    state: Mutex<LoopbackState>,
    ready: Condvar,
}

impl LoopbackDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(LoopbackState::default()),
            ready: Condvar::new(),
        }
    }

    /// Every control write so far, in order.
    pub fn controls(&self) -> Vec<(u32, i32)> {
        self.lock().controls.clone()
    }

    pub fn format(&self) -> Option<M2mFormat> {
        self.lock().format
    }

    /// Reject the next `count` submissions as a busy device would.
    pub fn fail_next_submissions(&self, count: usize) {
        self.lock().fail_submissions = count;
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl M2mDevice for LoopbackDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        self.lock().controls.push((id, value));
        Ok(())
    }

    fn configure(&self, format: &M2mFormat) -> Result<()> {
        if format.width == 0 || format.height == 0 {
            bail!("loopback encoder rejects an empty frame size");
        }
        self.lock().format = Some(*format);
        Ok(())
    }

    fn request_buffers(&self, output_count: u32, capture_count: u32) -> Result<()> {
        let mut state = self.lock();
        state.output_slots = output_count;
        state.free_capture = capture_count;
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        self.lock().streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut state = self.lock();
        state.streaming = false;
        state.queued.clear();
        state.consumed.clear();
        state.packets.clear();
        self.ready.notify_all();
        Ok(())
    }

    fn queue_output(
        &self,
        index: u32,
        _fd: BorrowedFd<'_>,
        size: usize,
        timestamp_us: u64,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            bail!("input slot {} busy", index);
        }
        if !state.streaming {
            bail!("loopback encoder is not streaming");
        }
        if index >= state.output_slots {
            bail!("input slot {} out of range", index);
        }
        if state.queued.contains(&index) {
            bail!("input slot {} already queued", index);
        }
        if state.free_capture == 0 {
            bail!("no free output buffer");
        }
        state.free_capture -= 1;
        state.queued.push(index);

        let mut packet = LOOPBACK_NAL_PREFIX.to_vec();
        packet.extend_from_slice(&timestamp_us.to_le_bytes());
        packet.extend_from_slice(&(size as u32).to_le_bytes());
        state.packets.push_back((packet, timestamp_us));
        state.consumed.push_back(index);
        self.ready.notify_all();
        Ok(())
    }

    fn wait(&self, timeout_ms: i32) -> Result<bool> {
        let state = self.lock();
        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |state| state.packets.is_empty())
            .map_err(|_| anyhow!("loopback state lock poisoned"))?;
        Ok(!state.packets.is_empty())
    }

    fn dequeue_output(&self) -> Result<u32> {
        let mut state = self.lock();
        let index = state
            .consumed
            .pop_front()
            .ok_or_else(|| anyhow!("no consumed input buffer"))?;
        state.queued.retain(|queued| *queued != index);
        Ok(index)
    }

    fn dequeue_capture(&self, sink: &mut dyn FnMut(&[u8], u64)) -> Result<()> {
        let (packet, timestamp_us) = self
            .lock()
            .packets
            .pop_front()
            .ok_or_else(|| anyhow!("no compressed packet ready"))?;
        sink(&packet, timestamp_us);
        self.lock().free_capture += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferAllocator, MEMFD_HEAP};
    use crate::camera::ColorSpace;

    #[test]
    fn queued_frame_comes_back_with_its_timestamp() -> Result<()> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let frame = allocator.alloc("input", 96, false)?;
        let device = LoopbackDevice::new("loopback");
        device.configure(&M2mFormat {
            width: 8,
            height: 8,
            stride: 8,
            colorspace: ColorSpace::Smpte170m,
            fps: 30.0,
            capture_buffer_size: 1024,
        })?;
        device.request_buffers(3, 2)?;
        device.stream_on()?;

        device.queue_output(0, frame.fd(), 96, 1_234_567)?;
        assert!(device.wait(10)?);
        assert_eq!(device.dequeue_output()?, 0);

        let mut seen = Vec::new();
        device.dequeue_capture(&mut |data, ts| seen.push((data.to_vec(), ts)))?;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 1_234_567);
        assert_eq!(&seen[0].0[..5], &LOOPBACK_NAL_PREFIX);
        assert!(!device.wait(10)?);
        Ok(())
    }

    #[test]
    fn double_queue_of_an_input_slot_is_rejected() -> Result<()> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let frame = allocator.alloc("input", 16, false)?;
        let device = LoopbackDevice::new("loopback");
        device.request_buffers(1, 4)?;
        device.stream_on()?;
        device.queue_output(0, frame.fd(), 16, 1)?;
        assert!(device.queue_output(0, frame.fd(), 16, 2).is_err());
        Ok(())
    }
}
