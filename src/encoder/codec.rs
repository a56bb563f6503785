//! Software H.264 codec seam.

use anyhow::Result;

use crate::camera::ColorSpace;
use crate::params::Parameters;

/// Encoder settings derived from a parameter snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct CodecSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub bitrate: u32,
    pub idr_period: u32,
    pub colorspace: ColorSpace,
    pub profile: String,
    pub level: String,
}

impl CodecSettings {
    pub fn from_params(params: &Parameters, colorspace: ColorSpace) -> Self {
        Self {
            width: params.width,
            height: params.height,
            fps: params.fps,
            bitrate: params.bitrate,
            idr_period: params.idr_period,
            colorspace,
            profile: params.software_h264_profile.clone(),
            level: params.software_h264_level.clone(),
        }
    }

    /// H.264 VUI matrix coefficients.
    pub fn color_matrix(&self) -> u8 {
        match self.colorspace {
            ColorSpace::Rec709 => 1,
            ColorSpace::Smpte170m => 6,
        }
    }

    pub fn color_matrix_name(&self) -> &'static str {
        match self.colorspace {
            ColorSpace::Rec709 => "bt709",
            ColorSpace::Smpte170m => "smpte170m",
        }
    }

    /// Bytes of one tightly packed YUV 4:2:0 frame.
    pub fn frame_size(&self) -> usize {
        let luma = self.width as usize * self.height as usize;
        let chroma = self.width.div_ceil(2) as usize * self.height.div_ceil(2) as usize;
        luma + 2 * chroma
    }

    /// The same stream at a new bitrate and IDR period.
    pub fn with_rate(&self, bitrate: u32, idr_period: u32) -> Self {
        Self {
            bitrate,
            idr_period,
            ..self.clone()
        }
    }

    /// Whether moving to `next` needs a fresh encoder. Rate control can be
    /// changed in place, the GOP structure cannot.
    pub fn needs_reopen(&self, next: &CodecSettings) -> bool {
        self.idr_period != next.idr_period
            || self.width != next.width
            || self.height != next.height
    }
}

/// One open H.264 encoder.
///
/// Encoders run with preset `ultrafast`, tune `zerolatency`, no B-frames and
/// Annex-B output repeating SPS/PPS before every IDR.
pub trait H264Codec: Send {
    /// Compress one tightly packed YUV 4:2:0 frame with presentation index
    /// `pts`, handing every produced packet to `sink`.
    fn encode(&mut self, frame: &[u8], pts: i64, sink: &mut dyn FnMut(&[u8])) -> Result<()>;

    /// Apply a new bitrate and IDR period. An error leaves the previous
    /// settings in effect.
    fn reconfigure(&mut self, bitrate: u32, idr_period: u32) -> Result<()>;
}

pub type CodecFactory = fn(&CodecSettings) -> Result<Box<dyn H264Codec>>;

/// The codec compiled into this build.
#[cfg(feature = "encode-ffmpeg")]
pub fn default_codec(settings: &CodecSettings) -> Result<Box<dyn H264Codec>> {
    Ok(Box::new(super::ffmpeg::X264Codec::open(settings)?))
}

/// Builds without `encode-ffmpeg` have no software codec; `Codec=auto` then
/// needs the hardware encoder.
#[cfg(not(feature = "encode-ffmpeg"))]
pub fn default_codec(_settings: &CodecSettings) -> Result<Box<dyn H264Codec>> {
    anyhow::bail!("software H.264 encoding requires the encode-ffmpeg feature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_follows_colorspace() {
        let params = Parameters::default();
        let hd = CodecSettings::from_params(&params, ColorSpace::Rec709);
        assert_eq!(hd.color_matrix(), 1);
        let sd = CodecSettings::from_params(&params, ColorSpace::Smpte170m);
        assert_eq!(sd.color_matrix(), 6);
        assert_eq!(sd.color_matrix_name(), "smpte170m");
    }

    #[test]
    fn settings_use_software_profile() {
        let params = Parameters {
            width: 640,
            height: 480,
            software_h264_profile: "main".to_string(),
            hardware_h264_profile: "high".to_string(),
            ..Parameters::default()
        };
        let settings = CodecSettings::from_params(&params, ColorSpace::Smpte170m);
        assert_eq!(settings.profile, "main");
        assert_eq!(settings.frame_size(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn idr_change_needs_a_new_encoder() {
        let params = Parameters {
            bitrate: 1_000_000,
            idr_period: 30,
            ..Parameters::default()
        };
        let current = CodecSettings::from_params(&params, ColorSpace::Smpte170m);

        let faster = current.with_rate(2_000_000, 30);
        assert_eq!(faster.bitrate, 2_000_000);
        assert_eq!(faster.profile, current.profile);
        assert!(!current.needs_reopen(&faster));

        let shorter_gop = current.with_rate(1_000_000, 15);
        assert_eq!(shorter_gop.idr_period, 15);
        assert!(current.needs_reopen(&shorter_gop));
    }

    #[cfg(not(feature = "encode-ffmpeg"))]
    #[test]
    fn build_without_ffmpeg_has_no_software_codec() {
        let settings = CodecSettings::from_params(&Parameters::default(), ColorSpace::Rec709);
        let err = default_codec(&settings).err().expect("no software codec");
        assert!(err.to_string().contains("encode-ffmpeg"));
    }

    #[cfg(feature = "encode-ffmpeg")]
    #[test]
    fn default_build_opens_libx264() {
        let params = Parameters {
            width: 64,
            height: 48,
            ..Parameters::default()
        };
        let settings = CodecSettings::from_params(&params, ColorSpace::Smpte170m);
        if let Err(err) = default_codec(&settings) {
            // FFmpeg may be built without libx264; the codec must say so.
            assert!(format!("{:#}", err).contains("libx264"), "{:#}", err);
        }
    }
}
