//! Encoder backend abstraction.
//!
//! One backend is chosen at startup and stays for the process lifetime:
//! - `Hardware`: a V4L2 memory-to-memory H.264 encoder fed by DMA-buf fd
//! - `Software`: libx264 on a worker thread fed through a single-slot mailbox
//!
//! Both deliver compressed packets through the same `OutputCallback`, on
//! their own thread.

pub mod codec;
#[cfg(feature = "encode-ffmpeg")]
pub mod ffmpeg;
pub mod hardware;
pub mod loopback;
pub mod m2m;
pub mod software;

use anyhow::{bail, Result};
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

pub use codec::{CodecFactory, CodecSettings, H264Codec};
pub use hardware::HardwareEncoder;
pub use loopback::LoopbackDevice;
pub use m2m::{M2mDevice, M2mFormat, V4l2M2mDevice};
pub use software::SoftwareEncoder;

use crate::camera::ColorSpace;
use crate::params::Parameters;

pub const DEFAULT_ENCODER_DEVICE: &str = "/dev/video11";
pub const DEFAULT_ENCODER_MODEL: &str = "bcm2835-codec-encode";
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 200;
pub const DEFAULT_CAPTURE_BUFFER_SIZE: u32 = 512 << 10;

const STUB_PREFIX: &str = "stub://";

/// Receives `(compressed_bytes, timestamp_us)` on the encoder's thread.
pub type OutputCallback = Arc<dyn Fn(&[u8], u64) + Send + Sync>;

/// The `Codec` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecChoice {
    Auto,
    Hardware,
    Software,
}

impl CodecChoice {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | "auto" => Ok(Self::Auto),
            "hardwareH264" => Ok(Self::Hardware),
            "softwareH264" => Ok(Self::Software),
            other => bail!("unsupported codec '{}'", other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Hardware,
    Software,
}

/// Resolve `choice`; `probe` runs only for `Auto`.
pub fn select_backend<F>(choice: CodecChoice, probe: F) -> Backend
where
    F: FnOnce() -> bool,
{
    match choice {
        CodecChoice::Hardware => Backend::Hardware,
        CodecChoice::Software => Backend::Software,
        CodecChoice::Auto => {
            if probe() {
                Backend::Hardware
            } else {
                Backend::Software
            }
        }
    }
}

/// Where to find the hardware encoder and how to drive it.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderOptions {
    /// `/dev/videoN` node, or `stub://…` for the loopback device.
    pub device: String,
    /// Card name the hardware encoder reports through `VIDIOC_QUERYCAP`.
    pub expected_model: String,
    pub poll_timeout_ms: i32,
    pub capture_buffer_size: u32,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            device: DEFAULT_ENCODER_DEVICE.to_string(),
            expected_model: DEFAULT_ENCODER_MODEL.to_string(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            capture_buffer_size: DEFAULT_CAPTURE_BUFFER_SIZE,
        }
    }
}

impl EncoderOptions {
    /// Whether the configured device is the expected hardware encoder.
    pub fn hardware_available(&self) -> bool {
        if self.device.starts_with(STUB_PREFIX) {
            return true;
        }
        m2m::probe(Path::new(&self.device), &self.expected_model)
    }

    fn open_device(&self) -> Result<Arc<dyn M2mDevice>> {
        if self.device.starts_with(STUB_PREFIX) {
            return Ok(Arc::new(LoopbackDevice::new(&self.device)));
        }
        Ok(Arc::new(V4l2M2mDevice::open(Path::new(&self.device))?))
    }
}

pub enum Encoder {
    Hardware(HardwareEncoder),
    Software(SoftwareEncoder),
}

impl Encoder {
    /// Select and start a backend for frames of the given stride and colour space.
    pub fn create(
        params: &Parameters,
        stride: u32,
        colorspace: ColorSpace,
        options: &EncoderOptions,
        output: OutputCallback,
    ) -> Result<Self> {
        let choice = CodecChoice::from_name(&params.codec)?;
        match select_backend(choice, || options.hardware_available()) {
            Backend::Hardware => {
                let device = options.open_device()?;
                Ok(Self::Hardware(HardwareEncoder::create(
                    params, stride, colorspace, device, options, output,
                )?))
            }
            Backend::Software => Ok(Self::Software(SoftwareEncoder::create(
                params,
                stride,
                colorspace,
                codec::default_codec,
                output,
            )?)),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::Hardware(_) => Backend::Hardware,
            Self::Software(_) => Backend::Software,
        }
    }

    /// Encode one captured frame. The buffer is only borrowed for this call.
    pub fn encode(&self, data: &[u8], fd: BorrowedFd<'_>, size: usize, timestamp_us: u64) {
        match self {
            Self::Hardware(encoder) => encoder.encode(fd, size, timestamp_us),
            Self::Software(encoder) => {
                if let Err(err) = encoder.encode(data, timestamp_us) {
                    log::warn!("Encoder: frame at {} us not queued: {:#}", timestamp_us, err);
                }
            }
        }
    }

    pub fn reload_params(&self, params: &Parameters) {
        match self {
            Self::Hardware(encoder) => encoder.reload_params(params),
            Self::Software(encoder) => encoder.reload_params(params),
        }
    }

    pub fn stop(&self) -> Result<()> {
        match self {
            Self::Hardware(encoder) => encoder.stop(),
            Self::Software(encoder) => encoder.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn codec_names() -> Result<()> {
        assert_eq!(CodecChoice::from_name("auto")?, CodecChoice::Auto);
        assert_eq!(CodecChoice::from_name("hardwareH264")?, CodecChoice::Hardware);
        assert_eq!(CodecChoice::from_name("softwareH264")?, CodecChoice::Software);
        assert!(CodecChoice::from_name("mjpeg").is_err());
        Ok(())
    }

    #[test]
    fn forced_choices_skip_the_probe() {
        let probed = Cell::new(false);
        let probe = || {
            probed.set(true);
            true
        };
        assert_eq!(select_backend(CodecChoice::Software, probe), Backend::Software);
        assert!(!probed.get());
        assert_eq!(
            select_backend(CodecChoice::Hardware, || false),
            Backend::Hardware
        );
    }

    #[test]
    fn auto_follows_the_probe() {
        assert_eq!(select_backend(CodecChoice::Auto, || true), Backend::Hardware);
        assert_eq!(select_backend(CodecChoice::Auto, || false), Backend::Software);
    }

    #[test]
    fn stub_device_is_always_available() {
        let options = EncoderOptions {
            device: "stub://encoder".to_string(),
            ..EncoderOptions::default()
        };
        assert!(options.hardware_available());
        let missing = EncoderOptions {
            device: "/nonexistent/video11".to_string(),
            ..EncoderOptions::default()
        };
        assert!(!missing.hardware_available());
    }

    #[test]
    fn auto_with_stub_device_creates_hardware_backend() -> Result<()> {
        let params = Parameters {
            width: 32,
            height: 16,
            ..Parameters::default()
        };
        let options = EncoderOptions {
            device: "stub://encoder".to_string(),
            poll_timeout_ms: 10,
            ..EncoderOptions::default()
        };
        let output: OutputCallback = Arc::new(|_: &[u8], _: u64| {});
        let encoder = Encoder::create(&params, 32, ColorSpace::Smpte170m, &options, output)?;
        assert_eq!(encoder.backend(), Backend::Hardware);
        encoder.stop()?;
        Ok(())
    }
}
