//! Secondary stream JPEG encoder.
//!
//! Frames are copied into a single-slot mailbox and compressed on a worker
//! thread, so the capture completion thread never waits on the compressor
//! unless a previous frame is still pending.

use anyhow::{anyhow, bail, Context, Result};
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::encoder::OutputCallback;
use crate::mailbox::Mailbox;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Geometry {
    width: usize,
    height: usize,
    stride: usize,
}

impl Geometry {
    fn chroma_stride(&self) -> usize {
        self.stride.div_ceil(2)
    }

    fn chroma_plane(&self) -> usize {
        self.chroma_stride() * self.height.div_ceil(2)
    }

    fn frame_size(&self) -> usize {
        self.stride * self.height + 2 * self.chroma_plane()
    }
}

struct Snapshot {
    data: Vec<u8>,
    timestamp_us: u64,
}

pub struct JpegEncoder {
    geometry: Geometry,
    mailbox: Arc<Mailbox<Snapshot>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl JpegEncoder {
    pub fn create(
        width: u32,
        height: u32,
        quality: u32,
        stride: u32,
        output: OutputCallback,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("secondary stream needs a non-zero size");
        }
        if stride < width {
            bail!("secondary stride {} is narrower than width {}", stride, width);
        }
        let geometry = Geometry {
            width: width as usize,
            height: height as usize,
            stride: stride as usize,
        };
        let quality = quality.clamp(1, 100) as u8;
        let mailbox = Arc::new(Mailbox::new());
        let worker = {
            let mailbox = Arc::clone(&mailbox);
            move || run(&mailbox, geometry, quality, &output)
        };
        let join = std::thread::Builder::new()
            .name("jpeg-encode".to_string())
            .spawn(worker)
            .context("spawn JPEG encoder thread")?;
        log::info!(
            "JpegEncoder: {}x{} at quality {}",
            width,
            height,
            quality
        );
        Ok(Self {
            geometry,
            mailbox,
            join: Mutex::new(Some(join)),
        })
    }

    /// Copy a secondary YUV 4:2:0 frame for compression.
    pub fn encode(&self, data: &[u8], timestamp_us: u64) -> Result<()> {
        let size = self.geometry.frame_size();
        if data.len() < size {
            bail!(
                "secondary frame holds {} bytes, expected {}",
                data.len(),
                size
            );
        }
        self.mailbox.put(Snapshot {
            data: data[..size].to_vec(),
            timestamp_us,
        })
    }

    pub fn stop(&self) -> Result<()> {
        self.mailbox.close();
        let join = self
            .join
            .lock()
            .map_err(|_| anyhow!("JPEG join lock poisoned"))?
            .take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| anyhow!("JPEG encoder thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for JpegEncoder {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("JpegEncoder: shutdown failed: {}", err);
        }
    }
}

fn run(mailbox: &Mailbox<Snapshot>, geometry: Geometry, quality: u8, output: &OutputCallback) {
    let _closed = mailbox.close_on_drop();
    let mut rgb = vec![0u8; geometry.width * geometry.height * 3];
    let mut jpeg = Vec::new();
    while let Some(snapshot) = mailbox.take() {
        yuv420_to_rgb(&snapshot.data, geometry, &mut rgb);
        jpeg.clear();
        let encoded = ImageJpegEncoder::new_with_quality(&mut jpeg, quality).encode(
            &rgb,
            geometry.width as u32,
            geometry.height as u32,
            ExtendedColorType::Rgb8,
        );
        match encoded {
            Ok(()) => output(&jpeg, snapshot.timestamp_us),
            Err(err) => log::warn!("JpegEncoder: frame dropped: {}", err),
        }
    }
}

/// BT.601 limited-range conversion.
fn yuv420_to_rgb(yuv: &[u8], geometry: Geometry, rgb: &mut [u8]) {
    let Geometry {
        width,
        height,
        stride,
    } = geometry;
    let chroma_stride = geometry.chroma_stride();
    let u_plane = stride * height;
    let v_plane = u_plane + geometry.chroma_plane();
    for row in 0..height {
        for col in 0..width {
            let y = yuv[row * stride + col] as i32 - 16;
            let chroma = (row / 2) * chroma_stride + col / 2;
            let u = yuv[u_plane + chroma] as i32 - 128;
            let v = yuv[v_plane + chroma] as i32 - 128;
            let out = (row * width + col) * 3;
            rgb[out] = clamp((298 * y + 409 * v + 128) >> 8);
            rgb[out + 1] = clamp((298 * y - 100 * u - 208 * v + 128) >> 8);
            rgb[out + 2] = clamp((298 * y + 516 * u + 128) >> 8);
        }
    }
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
