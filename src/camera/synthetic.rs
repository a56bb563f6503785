//! Synthetic camera (`stub://`) for tests and hardware-free runs.
//!
//! Completes requests from a clock thread at a fixed rate, or one at a time
//! on demand through a `SyntheticHandle`. The first bytes of every mapped
//! buffer carry a little-endian frame sequence number.

use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::config::{CameraConfiguration, StreamRole, ValidationStatus};
use super::controls::{CameraProperties, ControlList, Rectangle};
use super::device::{
    CameraDevice, CameraInfo, Completion, CompletionSender, RequestBuffers, RequestStatus,
};
use crate::buffer::write_at;

#[derive(Clone, Debug)]
pub struct SyntheticCameraConfig {
    pub id: String,
    /// Completion rate of the clock thread; `None` completes only on
    /// `SyntheticHandle::trigger`.
    pub fps: Option<f32>,
    /// Row alignment in bytes applied during validation.
    pub stride_alignment: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub sensor_area: Option<Rectangle>,
    pub supports_autofocus: bool,
}

impl Default for SyntheticCameraConfig {
    fn default() -> Self {
        Self {
            id: "stub://camera".to_string(),
            fps: None,
            stride_alignment: 1,
            max_width: 4056,
            max_height: 3040,
            sensor_area: Some(Rectangle {
                x: 0,
                y: 0,
                width: 4056,
                height: 3040,
            }),
            supports_autofocus: true,
        }
    }
}

#[derive(Default)]
struct SyntheticState {
    queued: VecDeque<usize>,
    bound: Vec<RequestBuffers>,
    sender: Option<CompletionSender>,
    started: bool,
    sequence: u64,
    started_at: Option<Instant>,
    /// Controls applied at start followed by every non-empty per-request set.
    applied: Vec<ControlList>,
    /// Accumulated effect of all applied controls.
    effective: ControlList,
}

/// Test-side view of a synthetic camera.
#[derive(Clone)]
pub struct SyntheticHandle {
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticHandle {
    /// Complete the oldest queued request. Returns `false` when none is queued.
    pub fn trigger(&self) -> Result<bool> {
        complete_next(&self.state)
    }

    /// Cancel every queued request, as the hardware does on a fatal fault.
    pub fn cancel_all(&self) -> Result<usize> {
        let mut state = lock(&self.state)?;
        let sender = state
            .sender
            .clone()
            .ok_or_else(|| anyhow!("synthetic camera not started"))?;
        let slots: Vec<usize> = state.queued.drain(..).collect();
        drop(state);
        for slot in &slots {
            let _ = sender.send(Completion {
                slot: *slot,
                status: RequestStatus::Cancelled,
                timestamp_ns: 0,
            });
        }
        Ok(slots.len())
    }

    pub fn queued(&self) -> usize {
        lock(&self.state).map(|state| state.queued.len()).unwrap_or(0)
    }

    pub fn applied(&self) -> Vec<ControlList> {
        lock(&self.state)
            .map(|state| state.applied.clone())
            .unwrap_or_default()
    }

    pub fn effective_controls(&self) -> ControlList {
        lock(&self.state)
            .map(|state| state.effective.clone())
            .unwrap_or_default()
    }
}

pub struct SyntheticCamera {
    config: SyntheticCameraConfig,
    state: Arc<Mutex<SyntheticState>>,
    stop: Arc<AtomicBool>,
    clock: Option<JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticCameraConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SyntheticState::default())),
            stop: Arc::new(AtomicBool::new(false)),
            clock: None,
        }
    }

    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            id: self.config.id.clone(),
            node: self.config.id.clone().into(),
        }
    }

    pub fn handle(&self) -> SyntheticHandle {
        SyntheticHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl CameraDevice for SyntheticCamera {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn properties(&self) -> CameraProperties {
        CameraProperties {
            scaler_crop_maximum: self.config.sensor_area,
            supports_autofocus: self.config.supports_autofocus,
        }
    }

    fn validate(&self, config: &mut CameraConfiguration) -> ValidationStatus {
        let mut status = ValidationStatus::Valid;
        let align = self.config.stride_alignment.max(1);
        for stream in &mut config.streams {
            if stream.width == 0 || stream.height == 0 {
                return ValidationStatus::Invalid;
            }
            if stream.width > self.config.max_width || stream.height > self.config.max_height {
                stream.width = stream.width.min(self.config.max_width);
                stream.height = stream.height.min(self.config.max_height);
                status = ValidationStatus::Adjusted;
            }
            let stride = stream.pixel_format.min_stride(stream.width).div_ceil(align) * align;
            stream.stride = stride;
            stream.frame_size = stream.pixel_format.frame_size(stride, stream.height);
        }
        status
    }

    fn configure(&mut self, config: &CameraConfiguration) -> Result<()> {
        let depth = config
            .streams
            .first()
            .map(|stream| stream.buffer_count as usize)
            .unwrap_or(0);
        let mut state = lock(&self.state)?;
        state.bound = vec![Vec::new(); depth];
        log::info!(
            "SyntheticCamera: {} configured ({} streams)",
            self.config.id,
            config.streams.len()
        );
        Ok(())
    }

    fn bind_request(&mut self, slot: usize, buffers: &RequestBuffers) -> Result<()> {
        let mut state = lock(&self.state)?;
        let entry = state
            .bound
            .get_mut(slot)
            .ok_or_else(|| anyhow!("request slot {} out of range", slot))?;
        *entry = buffers.clone();
        Ok(())
    }

    fn start(&mut self, controls: &ControlList, completions: CompletionSender) -> Result<()> {
        {
            let mut state = lock(&self.state)?;
            if state.started {
                bail!("synthetic camera already started");
            }
            state.started = true;
            state.started_at = Some(Instant::now());
            state.sender = Some(completions);
            state.applied.push(controls.clone());
            state.effective.merge(controls);
        }

        if let Some(fps) = self.config.fps {
            let period = Duration::from_secs_f64(1.0 / fps.max(0.1) as f64);
            let state = Arc::clone(&self.state);
            let stop = Arc::clone(&self.stop);
            self.clock = Some(std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(period);
                    if let Err(err) = complete_next(&state) {
                        log::warn!("SyntheticCamera: {}", err);
                        break;
                    }
                }
            }));
        }
        log::info!("SyntheticCamera: {} started", self.config.id);
        Ok(())
    }

    fn queue_request(&mut self, slot: usize, controls: &ControlList) -> Result<()> {
        let mut state = lock(&self.state)?;
        if !state.started {
            bail!("synthetic camera not started");
        }
        if slot >= state.bound.len() {
            bail!("request slot {} out of range", slot);
        }
        if state.queued.contains(&slot) {
            bail!("request slot {} already queued", slot);
        }
        if !controls.is_empty() {
            state.applied.push(controls.clone());
            state.effective.merge(controls);
        }
        state.queued.push_back(slot);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(clock) = self.clock.take() {
            clock
                .join()
                .map_err(|_| anyhow!("synthetic clock thread panicked"))?;
        }
        let mut state = lock(&self.state)?;
        state.started = false;
        state.sender = None;
        state.queued.clear();
        Ok(())
    }
}

fn complete_next(state: &Arc<Mutex<SyntheticState>>) -> Result<bool> {
    let mut guard = lock(state)?;
    let Some(sender) = guard.sender.clone() else {
        return Ok(false);
    };
    let Some(slot) = guard.queued.pop_front() else {
        return Ok(false);
    };
    guard.sequence += 1;
    let sequence = guard.sequence;
    let timestamp_ns = guard
        .started_at
        .map(|at| at.elapsed().as_nanos() as u64)
        .unwrap_or(0);
    for (role, buffer) in &guard.bound[slot] {
        if *role != StreamRole::Raw {
            write_at(buffer.fd(), 0, &sequence.to_le_bytes())?;
        }
    }
    drop(guard);
    sender
        .send(Completion {
            slot,
            status: RequestStatus::Complete,
            timestamp_ns,
        })
        .map_err(|_| anyhow!("completion receiver closed"))?;
    Ok(true)
}

fn lock(state: &Arc<Mutex<SyntheticState>>) -> Result<std::sync::MutexGuard<'_, SyntheticState>> {
    state
        .lock()
        .map_err(|_| anyhow!("synthetic camera state lock poisoned"))
}
