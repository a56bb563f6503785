//! Timestamp overlay painted into the primary stream.
//!
//! The template is a strftime pattern where `%f` stands for the
//! microseconds of the capture second. Text is rasterised into a coverage
//! mask with `imageproc` and blended straight into the YUV420 frame on top
//! of a darkened box in the top-left corner.

use ab_glyph::{FontRef, PxScale};
use anyhow::{anyhow, bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use image::{GrayImage, Luma};
use imageproc::drawing::{draw_text_mut, text_size};
use std::fmt::Write;

use crate::params::Parameters;

const FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");
const FONT_PX: f32 = 25.0;

const BOX_ORIGIN: usize = 7;
const BOX_HEIGHT: usize = 34;
const BOX_PADDING: usize = 10;
const BOX_OPACITY: u32 = 45;
const TEXT_X: i32 = 5;
const TEXT_Y: i32 = 3;

pub struct TextOverlay {
    template: String,
    font: FontRef<'static>,
    scale: PxScale,
    width: usize,
    height: usize,
    stride: usize,
}

impl TextOverlay {
    pub fn create(params: &Parameters, stride: u32) -> Result<Self> {
        let template = expand_microseconds(&params.text_overlay);
        if StrftimeItems::new(&template).any(|item| matches!(item, Item::Error)) {
            bail!("invalid text overlay template '{}'", params.text_overlay);
        }
        let font = FontRef::try_from_slice(FONT).map_err(|err| anyhow!("load font: {}", err))?;
        log::info!("TextOverlay: drawing '{}'", params.text_overlay);
        Ok(Self {
            template,
            font,
            scale: PxScale::from(FONT_PX),
            width: params.width as usize,
            height: params.height as usize,
            stride: stride as usize,
        })
    }

    fn render_text(&self, now: &DateTime<Local>) -> Result<String> {
        let mut text = String::new();
        write!(text, "{}", now.format(&self.template)).context("format text overlay")?;
        Ok(text)
    }

    /// Paint the overlay for `now` into a YUV420 `frame`.
    pub fn draw(&self, frame: &mut [u8], now: &DateTime<Local>) -> Result<()> {
        let chroma_stride = self.stride.div_ceil(2);
        let luma = self.stride * self.height;
        let chroma = chroma_stride * self.height.div_ceil(2);
        if frame.len() < luma + 2 * chroma {
            bail!("frame of {} bytes is too small for the overlay", frame.len());
        }

        let text = self.render_text(now)?;
        let (text_width, _) = text_size(self.scale, &self.font, &text);
        let box_width = (text_width as usize + BOX_PADDING).min(self.width.saturating_sub(BOX_ORIGIN));
        let box_height = BOX_HEIGHT.min(self.height.saturating_sub(BOX_ORIGIN));
        if box_width == 0 || box_height == 0 {
            return Ok(());
        }

        let mut mask = GrayImage::new(box_width as u32, box_height as u32);
        draw_text_mut(&mut mask, Luma([255]), TEXT_X, TEXT_Y, self.scale, &self.font, &text);

        let (y_plane, uv) = frame.split_at_mut(luma);
        let (u_plane, v_plane) = uv.split_at_mut(chroma);
        for row in 0..box_height {
            let y = BOX_ORIGIN + row;
            for col in 0..box_width {
                let x = BOX_ORIGIN + col;
                let i1 = y * self.stride + x;
                let i2 = (y / 2) * chroma_stride + x / 2;

                y_plane[i1] = blend(y_plane[i1], 0, BOX_OPACITY);
                if x % 2 == 0 && y % 2 == 0 {
                    u_plane[i2] = blend(u_plane[i2], 128, BOX_OPACITY);
                    v_plane[i2] = blend(v_plane[i2], 128, BOX_OPACITY);
                }

                let coverage = mask.get_pixel(col as u32, row as u32)[0];
                if coverage != 0 {
                    let coverage = u32::from(coverage);
                    y_plane[i1] = blend(y_plane[i1], coverage as u8, coverage);
                    u_plane[i2] = blend(u_plane[i2], 128, coverage);
                    v_plane[i2] = blend(v_plane[i2], 128, coverage);
                }
            }
        }
        Ok(())
    }
}

fn blend(base: u8, color: u8, opacity: u32) -> u8 {
    ((u32::from(color) * opacity + u32::from(base) * (255 - opacity)) / 255) as u8
}

/// Rewrite `%f` as chrono's fixed six-digit fraction, leaving `%%f` alone.
fn expand_microseconds(template: &str) -> String {
    let mut out = String::with_capacity(template.len() + 4);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        out.push(c);
        if c == '%' {
            match chars.next() {
                Some('f') => out.push_str("6f"),
                Some(next) => out.push(next),
                None => {}
            }
        }
    }
    out
}
