//! Frame router.
//!
//! The router is responsible for:
//! - Building the capture session, the encoder and the optional JPEG encoder
//!   in the order their inputs become known
//! - Painting the timestamp overlay into primary frames when enabled
//! - Feeding every captured frame to the encoder, and secondary frames to
//!   the JPEG encoder
//! - Forwarding compressed output and camera faults to the control pipe
//! - Applying reload commands, keeping the previous snapshot on bad input
//!
//! The router MUST NOT:
//! - Retain captured buffers past the frame callback
//! - Leave a half-built pipeline running when a later stage fails

use anyhow::{Context, Result};
use chrono::Local;
use std::sync::Arc;

use crate::buffer::BufferAllocator;
use crate::camera::{self, CameraDevice, CaptureSession, StreamRole};
use crate::config::DaemonConfig;
use crate::encoder::{Encoder, EncoderOptions, OutputCallback};
use crate::jpeg::JpegEncoder;
use crate::params::Parameters;
use crate::pipe::{Command, PipeWriter};
use crate::text::TextOverlay;

/// Text written to the pipe when the camera cancels a request.
pub const CAMERA_FAULT_MESSAGE: &str = "camera driver exited";

pub struct Router {
    session: Option<CaptureSession>,
    encoder: Arc<Encoder>,
    jpeg: Option<Arc<JpegEncoder>>,
    params: Parameters,
}

impl Router {
    /// Open the configured heap and camera, then build and start the pipeline.
    pub fn start(params: Parameters, config: &DaemonConfig, writer: Arc<PipeWriter>) -> Result<Self> {
        let allocator = BufferAllocator::open(&config.dma_heaps).context("open DMA heap")?;
        let device = camera::open_camera(&config.camera, &params).context("open camera")?;
        Self::with_device(params, device, &allocator, &config.encoder, writer)
    }

    /// Build and start the pipeline on an already opened camera.
    pub fn with_device(
        params: Parameters,
        device: Box<dyn CameraDevice>,
        allocator: &BufferAllocator,
        options: &EncoderOptions,
        writer: Arc<PipeWriter>,
    ) -> Result<Self> {
        let mut session =
            CaptureSession::create(&params, device, allocator).context("camera_create")?;

        if params.text_overlay_enable {
            let overlay = TextOverlay::create(&params, session.stride(StreamRole::Video)?)
                .context("text_create")?;
            session.on_overlay(move |data| {
                if let Err(err) = overlay.draw(data, &Local::now()) {
                    log::debug!("Router: text overlay not drawn: {:#}", err);
                }
            });
        }

        let output: OutputCallback = {
            let writer = Arc::clone(&writer);
            Arc::new(move |data: &[u8], timestamp_us: u64| {
                if let Err(err) = writer.write_data(data, timestamp_us) {
                    log::debug!("Router: primary data not written: {:#}", err);
                }
            })
        };
        let encoder = Arc::new(
            Encoder::create(
                &params,
                session.stride(StreamRole::Video)?,
                session.colorspace(StreamRole::Video)?,
                options,
                output,
            )
            .context("encoder_create")?,
        );
        log::info!("Router: using {:?} encoder", encoder.backend());

        let jpeg = if params.has_secondary() {
            let output: OutputCallback = {
                let writer = Arc::clone(&writer);
                Arc::new(move |data: &[u8], timestamp_us: u64| {
                    if let Err(err) = writer.write_secondary(data, timestamp_us) {
                        log::debug!("Router: secondary data not written: {:#}", err);
                    }
                })
            };
            Some(Arc::new(
                JpegEncoder::create(
                    params.secondary_width,
                    params.secondary_height,
                    params.secondary_mjpeg_quality,
                    session.stride(StreamRole::Secondary)?,
                    output,
                )
                .context("encoder_jpeg_create")?,
            ))
        } else {
            None
        };

        {
            let encoder = Arc::clone(&encoder);
            let jpeg = jpeg.clone();
            session.on_frame(move |frame| {
                encoder.encode(frame.data, frame.fd, frame.size, frame.timestamp_us);
                if let (Some(jpeg), Some(secondary)) = (jpeg.as_ref(), frame.secondary) {
                    if let Err(err) = jpeg.encode(secondary, frame.timestamp_us) {
                        log::warn!("Router: secondary frame dropped: {:#}", err);
                    }
                }
            });
        }
        {
            let writer = Arc::clone(&writer);
            session.on_error(move || {
                if let Err(err) = writer.write_error(CAMERA_FAULT_MESSAGE) {
                    log::error!("Router: camera fault not reported: {:#}", err);
                }
            });
        }

        session.start(&params).context("camera_start")?;
        Ok(Self {
            session: Some(session),
            encoder,
            jpeg,
            params,
        })
    }

    /// Apply one control-pipe command. Returns `false` when the daemon should exit.
    pub fn handle(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Exit => Ok(false),
            Command::Configure(body) => {
                match Parameters::unserialize(&body) {
                    Ok(params) => self.reload(params)?,
                    Err(err) => log::warn!(
                        "Router: skipping reloading parameters since they are invalid: {:#}",
                        err
                    ),
                }
                Ok(true)
            }
            Command::Unknown(tag) => {
                log::warn!("Router: ignoring unknown command {:?}", tag as char);
                Ok(true)
            }
        }
    }

    fn reload(&mut self, params: Parameters) -> Result<()> {
        if let Some(session) = &self.session {
            session.reload_controls(&params)?;
        }
        self.encoder.reload_params(&params);
        if params.log_level != self.params.log_level && std::env::var_os("RUST_LOG").is_none() {
            log::set_max_level(params.log_level_filter());
        }
        self.params = params;
        log::debug!("Router: parameters reloaded");
        Ok(())
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Stop capture first so no frame reaches a stopped encoder.
    pub fn stop(mut self) -> Result<()> {
        let mut first_err = None;
        if let Some(session) = self.session.take() {
            if let Err(err) = session.stop() {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.encoder.stop() {
            first_err.get_or_insert(err);
        }
        if let Some(jpeg) = &self.jpeg {
            if let Err(err) = jpeg.stop() {
                first_err.get_or_insert(err);
            }
        }
        log::info!("Router: stopped");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
