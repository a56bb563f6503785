//! Per-stream buffer sets and request slot ownership.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::{Arc, Mutex};

use super::config::{CameraConfiguration, StreamRole};
use super::device::RequestBuffers;
use crate::buffer::{BufferAllocator, DmaBuffer};

/// Who currently holds a request slot's buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the session, not yet submitted.
    Idle,
    /// Submitted to the hardware.
    Queued,
    /// Completed and being delivered to the frame callback.
    Delivered,
}

struct StreamBuffers {
    role: StreamRole,
    buffers: Vec<Arc<DmaBuffer>>,
}

/// Buffers indexed by (stream, slot), one slot per capture request.
pub struct BufferArena {
    streams: Vec<StreamBuffers>,
    slots: Mutex<Vec<SlotState>>,
}

impl BufferArena {
    /// Allocate `depth` buffers for every configured stream.
    ///
    /// Buffers allocated before a failure are dropped, releasing their fds
    /// and mappings.
    pub fn allocate(
        allocator: &BufferAllocator,
        config: &CameraConfiguration,
        depth: usize,
    ) -> Result<Self> {
        if depth == 0 {
            bail!("buffer depth must be greater than zero");
        }
        let mut streams = Vec::with_capacity(config.streams.len());
        for stream in &config.streams {
            let mut buffers = Vec::with_capacity(depth);
            for slot in 0..depth {
                let name = format!("{}-{}", stream.role.name(), slot);
                let buffer = allocator
                    .alloc(&name, stream.frame_size, stream.role.is_mapped())
                    .with_context(|| format!("allocate {} buffer {}", stream.role.name(), slot))?;
                buffers.push(Arc::new(buffer));
            }
            streams.push(StreamBuffers {
                role: stream.role,
                buffers,
            });
        }
        log::debug!(
            "BufferArena: allocated {} buffers per stream from {}",
            depth,
            allocator.name()
        );
        Ok(Self {
            streams,
            slots: Mutex::new(vec![SlotState::Idle; depth]),
        })
    }

    pub fn depth(&self) -> usize {
        self.streams
            .first()
            .map(|stream| stream.buffers.len())
            .unwrap_or(0)
    }

    pub fn buffer(&self, role: StreamRole, slot: usize) -> Option<&Arc<DmaBuffer>> {
        self.streams
            .iter()
            .find(|stream| stream.role == role)
            .and_then(|stream| stream.buffers.get(slot))
    }

    /// Buffers to bind to request `slot`.
    pub fn request_buffers(&self, slot: usize) -> RequestBuffers {
        self.streams
            .iter()
            .filter_map(|stream| {
                stream
                    .buffers
                    .get(slot)
                    .map(|buffer| (stream.role, Arc::clone(buffer)))
            })
            .collect()
    }

    /// Idle -> Queued.
    pub fn submit(&self, slot: usize) -> Result<()> {
        self.transition(slot, SlotState::Idle, SlotState::Queued)
    }

    /// Queued -> Delivered.
    pub fn complete(&self, slot: usize) -> Result<()> {
        self.transition(slot, SlotState::Queued, SlotState::Delivered)
    }

    /// Delivered -> Idle.
    pub fn recycle(&self, slot: usize) -> Result<()> {
        self.transition(slot, SlotState::Delivered, SlotState::Idle)
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(slot)
            .copied()
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|state| **state == SlotState::Queued)
            .count()
    }

    fn transition(&self, slot: usize, from: SlotState, to: SlotState) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow!("buffer arena lock poisoned"))?;
        let state = slots
            .get_mut(slot)
            .ok_or_else(|| anyhow!("request slot {} out of range", slot))?;
        if *state != from {
            bail!(
                "request slot {} is {:?}, expected {:?}",
                slot,
                state,
                from
            );
        }
        *state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MEMFD_HEAP;
    use crate::params::Parameters;

    fn arena(params: &Parameters) -> Result<BufferArena> {
        let allocator = BufferAllocator::open(&[MEMFD_HEAP])?;
        let config = CameraConfiguration::from_params(params);
        BufferArena::allocate(&allocator, &config, params.buffer_count as usize)
    }

    #[test]
    fn allocates_one_buffer_per_stream_per_slot() -> Result<()> {
        let params = Parameters {
            width: 64,
            height: 48,
            mode: Some("64:48:10:P".parse()?),
            secondary_width: 32,
            secondary_height: 24,
            secondary_fps: 1.0,
            ..Parameters::default()
        };
        let arena = arena(&params)?;
        assert_eq!(arena.depth(), 3);
        for slot in 0..3 {
            let bound = arena.request_buffers(slot);
            assert_eq!(bound.len(), 3);
        }
        let raw = arena.buffer(StreamRole::Raw, 0).expect("raw buffer");
        assert!(!raw.is_mapped());
        let video = arena.buffer(StreamRole::Video, 0).expect("video buffer");
        assert!(video.is_mapped());
        assert_eq!(video.len(), 64 * 48 * 3 / 2);
        Ok(())
    }

    #[test]
    fn slot_lifecycle_rejects_double_submit() -> Result<()> {
        let arena = arena(&Parameters {
            width: 32,
            height: 32,
            ..Parameters::default()
        })?;
        arena.submit(1)?;
        assert!(arena.submit(1).is_err());
        assert_eq!(arena.in_flight(), 1);
        arena.complete(1)?;
        assert_eq!(arena.state(1), Some(SlotState::Delivered));
        assert!(arena.submit(1).is_err());
        arena.recycle(1)?;
        arena.submit(1)?;
        assert_eq!(arena.in_flight(), 1);
        assert!(arena.submit(7).is_err());
        Ok(())
    }
}
