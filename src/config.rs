use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::buffer::DEFAULT_HEAPS;
use crate::camera::AUTO_CAMERA;
use crate::encoder::{
    EncoderOptions, DEFAULT_CAPTURE_BUFFER_SIZE, DEFAULT_ENCODER_DEVICE, DEFAULT_ENCODER_MODEL,
    DEFAULT_POLL_TIMEOUT_MS,
};

#[derive(Debug, Deserialize, Default)]
struct DaemonConfigFile {
    camera: Option<CameraConfigFile>,
    buffers: Option<BufferConfigFile>,
    encoder: Option<EncoderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    dma_heaps: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct EncoderConfigFile {
    device: Option<String>,
    model: Option<String>,
    poll_timeout_ms: Option<i32>,
    capture_buffer_size: Option<u32>,
}

/// Host-side settings of `camerad`. Per-stream settings arrive as parameter
/// snapshots over the control pipe instead.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// `auto`, `stub://<name>` or a `/dev/videoN` path.
    pub camera: String,
    /// DMA heaps tried in order.
    pub dma_heaps: Vec<String>,
    pub encoder: EncoderOptions,
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMERAD_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with the file named explicitly instead of by `CAMERAD_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        let camera = file
            .camera
            .and_then(|camera| camera.device)
            .unwrap_or_else(|| AUTO_CAMERA.to_string());
        let dma_heaps = file
            .buffers
            .and_then(|buffers| buffers.dma_heaps)
            .unwrap_or_else(|| DEFAULT_HEAPS.iter().map(|heap| heap.to_string()).collect());
        let encoder = file.encoder.unwrap_or_default();
        Self {
            camera,
            dma_heaps,
            encoder: EncoderOptions {
                device: encoder
                    .device
                    .unwrap_or_else(|| DEFAULT_ENCODER_DEVICE.to_string()),
                expected_model: encoder
                    .model
                    .unwrap_or_else(|| DEFAULT_ENCODER_MODEL.to_string()),
                poll_timeout_ms: encoder.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
                capture_buffer_size: encoder
                    .capture_buffer_size
                    .unwrap_or(DEFAULT_CAPTURE_BUFFER_SIZE),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(camera) = std::env::var("CAMERAD_CAMERA") {
            if !camera.trim().is_empty() {
                self.camera = camera.trim().to_string();
            }
        }
        if let Ok(heaps) = std::env::var("CAMERAD_DMA_HEAPS") {
            let parsed = split_list(&heaps);
            if !parsed.is_empty() {
                self.dma_heaps = parsed;
            }
        }
        if let Ok(device) = std::env::var("CAMERAD_ENCODER_DEVICE") {
            if !device.trim().is_empty() {
                self.encoder.device = device.trim().to_string();
            }
        }
        if let Ok(model) = std::env::var("CAMERAD_ENCODER_MODEL") {
            if !model.trim().is_empty() {
                self.encoder.expected_model = model.trim().to_string();
            }
        }
        if let Ok(poll) = std::env::var("CAMERAD_ENCODER_POLL_MS") {
            self.encoder.poll_timeout_ms = poll.trim().parse().map_err(|_| {
                anyhow!("CAMERAD_ENCODER_POLL_MS must be an integer number of milliseconds")
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if self.dma_heaps.is_empty() {
            return Err(anyhow!("at least one DMA heap must be configured"));
        }
        if self.encoder.poll_timeout_ms <= 0 {
            return Err(anyhow!("encoder poll timeout must be greater than zero"));
        }
        if self.encoder.capture_buffer_size == 0 {
            return Err(anyhow!("encoder capture buffer size must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Heap names may contain commas (`linux,cma`), so lists use `;`.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
