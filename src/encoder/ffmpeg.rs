//! libx264 through FFmpeg.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, encoder, format::Pixel, frame, util::color, Dictionary, Packet, Rational};

use super::codec::{CodecSettings, H264Codec};
use crate::camera::ColorSpace;

pub struct X264Codec {
    settings: CodecSettings,
    encoder: encoder::video::Encoder,
    frame: frame::Video,
    packet: Packet,
    width: usize,
    height: usize,
}

impl X264Codec {
    pub fn open(settings: &CodecSettings) -> Result<Self> {
        ffmpeg::init().context("initialise ffmpeg")?;
        let x264 = encoder::find_by_name("libx264")
            .ok_or_else(|| anyhow!("libx264 encoder not available"))?;
        let mut video = codec::context::Context::new_with_codec(x264)
            .encoder()
            .video()
            .context("create libx264 context")?;

        let fps = settings.fps.round().max(1.0) as i32;
        video.set_width(settings.width);
        video.set_height(settings.height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(Rational::new(1, fps));
        video.set_frame_rate(Some(Rational::new(fps, 1)));
        video.set_bit_rate(settings.bitrate as usize);
        video.set_max_bit_rate(settings.bitrate as usize);
        // SAFETY: the context is not open yet and is owned by `video`.
        unsafe {
            (*video.as_mut_ptr()).rc_buffer_size = settings.bitrate as i32;
        }
        video.set_gop(settings.idr_period);
        video.set_max_b_frames(0);
        video.set_colorspace(match settings.colorspace {
            ColorSpace::Rec709 => color::Space::BT709,
            ColorSpace::Smpte170m => color::Space::SMPTE170M,
        });

        let mut options = Dictionary::new();
        options.set("preset", "ultrafast");
        options.set("tune", "zerolatency");
        options.set("profile", &settings.profile);
        options.set(
            "x264-params",
            &format!(
                "level={}:keyint={}:bframes=0:colormatrix={}:annexb=1:repeat-headers=1",
                settings.level,
                settings.idr_period,
                settings.color_matrix_name()
            ),
        );
        let encoder = video
            .open_with(options)
            .context("open libx264 encoder")?;

        Ok(Self {
            settings: settings.clone(),
            encoder,
            frame: frame::Video::new(Pixel::YUV420P, settings.width, settings.height),
            packet: Packet::empty(),
            width: settings.width as usize,
            height: settings.height as usize,
        })
    }

    fn fill_frame(&mut self, data: &[u8]) -> Result<()> {
        let chroma = (self.width.div_ceil(2), self.height.div_ceil(2));
        let planes = [(self.width, self.height), chroma, chroma];
        let mut offset = 0;
        for (index, (width, height)) in planes.into_iter().enumerate() {
            let stride = self.frame.stride(index);
            let plane = self.frame.data_mut(index);
            for row in 0..height {
                let src = data
                    .get(offset..offset + width)
                    .ok_or_else(|| anyhow!("frame shorter than {}x{}", self.width, self.height))?;
                plane[row * stride..row * stride + width].copy_from_slice(src);
                offset += width;
            }
        }
        Ok(())
    }
}

impl H264Codec for X264Codec {
    fn encode(&mut self, data: &[u8], pts: i64, sink: &mut dyn FnMut(&[u8])) -> Result<()> {
        self.fill_frame(data)?;
        self.frame.set_pts(Some(pts));
        self.encoder
            .send_frame(&self.frame)
            .context("send frame to libx264")?;
        while self.encoder.receive_packet(&mut self.packet).is_ok() {
            if let Some(bytes) = self.packet.data() {
                sink(bytes);
            }
        }
        Ok(())
    }

    fn reconfigure(&mut self, bitrate: u32, idr_period: u32) -> Result<()> {
        let next = self.settings.with_rate(bitrate, idr_period);
        if self.settings.needs_reopen(&next) {
            *self = Self::open(&next).context("reopen libx264 for a new IDR period")?;
            log::info!("X264Codec: reopened with IDR every {} frames", idr_period);
            return Ok(());
        }
        // SAFETY: the context stays open for self's lifetime and is only
        // touched behind the codec lock. libx264 picks up rate-control
        // changes on the next frame.
        unsafe {
            let ctx = self.encoder.as_mut_ptr();
            (*ctx).bit_rate = bitrate as i64;
            (*ctx).rc_max_rate = bitrate as i64;
            (*ctx).rc_buffer_size = bitrate as i32;
        }
        self.settings = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;

    fn open_small() -> Option<X264Codec> {
        let params = Parameters {
            width: 64,
            height: 48,
            bitrate: 500_000,
            idr_period: 30,
            ..Parameters::default()
        };
        match X264Codec::open(&CodecSettings::from_params(&params, ColorSpace::Smpte170m)) {
            Ok(codec) => Some(codec),
            Err(err) => {
                log::warn!("libx264 unavailable: {:#}", err);
                None
            }
        }
    }

    #[test]
    fn idr_period_change_takes_effect() -> Result<()> {
        let Some(mut codec) = open_small() else {
            return Ok(());
        };
        codec.reconfigure(500_000, 10)?;
        assert_eq!(codec.settings.idr_period, 10);
        // SAFETY: read-only access to the open context.
        let gop = unsafe { (*codec.encoder.as_ptr()).gop_size };
        assert_eq!(gop, 10);

        let frame = vec![128u8; 64 * 48 * 3 / 2];
        let mut bytes = 0;
        for pts in 0..3 {
            codec.encode(&frame, pts, &mut |packet| bytes += packet.len())?;
        }
        assert!(bytes > 0);
        Ok(())
    }

    #[test]
    fn bitrate_change_sets_vbv_buffer() -> Result<()> {
        let Some(mut codec) = open_small() else {
            return Ok(());
        };
        codec.reconfigure(800_000, 30)?;
        // SAFETY: read-only access to the open context.
        let (bit_rate, buffer) = unsafe {
            let ctx = codec.encoder.as_ptr();
            ((*ctx).bit_rate, (*ctx).rc_buffer_size)
        };
        assert_eq!(bit_rate, 800_000);
        assert_eq!(buffer, 800_000);
        assert_eq!(codec.settings.bitrate, 800_000);
        Ok(())
    }
}
