//! Stream configuration derived from a parameter snapshot.

use crate::params::{Parameters, SensorMode};
use v4l::v4l_sys;
use v4l::FourCC;

/// Hardware output paths a session can configure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamRole {
    /// Primary YUV 4:2:0 stream fed to the encoder.
    Video,
    /// Unprocessed Bayer stream at the selected sensor mode.
    Raw,
    /// Low-resolution YUV 4:2:0 stream for snapshots.
    Secondary,
}

impl StreamRole {
    pub fn name(self) -> &'static str {
        match self {
            StreamRole::Video => "video",
            StreamRole::Raw => "raw",
            StreamRole::Secondary => "secondary",
        }
    }

    /// Whether buffers of this stream are mapped for CPU access.
    pub fn is_mapped(self) -> bool {
        !matches!(self, StreamRole::Raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420,
    Sbggr8,
    Sbggr10,
    Sbggr10Csi2p,
    Sbggr12,
    Sbggr12Csi2p,
}

impl PixelFormat {
    /// Raw format for a sensor mode; unknown depths fall back to 12-bit packed.
    pub fn for_sensor_mode(mode: &SensorMode) -> Self {
        match (mode.bit_depth, mode.packed) {
            (8, _) => PixelFormat::Sbggr8,
            (10, false) => PixelFormat::Sbggr10,
            (10, true) => PixelFormat::Sbggr10Csi2p,
            (12, false) => PixelFormat::Sbggr12,
            (12, true) => PixelFormat::Sbggr12Csi2p,
            _ => PixelFormat::Sbggr12Csi2p,
        }
    }

    pub fn fourcc(self) -> FourCC {
        FourCC::new(match self {
            PixelFormat::Yuv420 => b"YU12",
            PixelFormat::Sbggr8 => b"BA81",
            PixelFormat::Sbggr10 => b"BG10",
            PixelFormat::Sbggr10Csi2p => b"pBAA",
            PixelFormat::Sbggr12 => b"BG12",
            PixelFormat::Sbggr12Csi2p => b"pBCC",
        })
    }

    /// The fourcc as the `pixelformat` word of a `v4l2_format`.
    pub fn pixelformat(self) -> u32 {
        u32::from_le_bytes(self.fourcc().repr)
    }

    /// Bytes per line of a tightly packed row (luma plane for YUV).
    pub fn min_stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::Yuv420 | PixelFormat::Sbggr8 => width,
            PixelFormat::Sbggr10 | PixelFormat::Sbggr12 => width * 2,
            PixelFormat::Sbggr10Csi2p => (width * 5).div_ceil(4),
            PixelFormat::Sbggr12Csi2p => (width * 3).div_ceil(2),
        }
    }

    /// Chroma planes of odd-sized YUV frames round up to whole samples.
    pub fn frame_size(self, stride: u32, height: u32) -> usize {
        let plane = stride as usize * height as usize;
        match self {
            PixelFormat::Yuv420 => {
                let chroma = stride.div_ceil(2) as usize * height.div_ceil(2) as usize;
                plane + 2 * chroma
            }
            _ => plane,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorSpace {
    Rec709,
    Smpte170m,
}

impl ColorSpace {
    /// HD and larger use Rec.709, everything else SMPTE-170M.
    pub fn for_resolution(width: u32, height: u32) -> Self {
        if width >= 1280 || height >= 720 {
            ColorSpace::Rec709
        } else {
            ColorSpace::Smpte170m
        }
    }

    pub fn v4l2(self) -> u32 {
        match self {
            ColorSpace::Rec709 => v4l_sys::v4l2_colorspace_V4L2_COLORSPACE_REC709,
            ColorSpace::Smpte170m => v4l_sys::v4l2_colorspace_V4L2_COLORSPACE_SMPTE170M,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transform {
    HFlip,
    VFlip,
}

/// Image orientation reachable from the identity by flips.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Rotate0,
    Rotate0Mirror,
    Rotate180,
    Rotate180Mirror,
}

impl Orientation {
    pub fn compose(self, transform: Transform) -> Self {
        use Orientation::*;
        match (self, transform) {
            (Rotate0, Transform::HFlip) => Rotate0Mirror,
            (Rotate0Mirror, Transform::HFlip) => Rotate0,
            (Rotate180, Transform::HFlip) => Rotate180Mirror,
            (Rotate180Mirror, Transform::HFlip) => Rotate180,
            (Rotate0, Transform::VFlip) => Rotate180Mirror,
            (Rotate0Mirror, Transform::VFlip) => Rotate180,
            (Rotate180, Transform::VFlip) => Rotate0Mirror,
            (Rotate180Mirror, Transform::VFlip) => Rotate0,
        }
    }

    pub fn from_flips(h_flip: bool, v_flip: bool) -> Self {
        let mut orientation = Orientation::Rotate0;
        if h_flip {
            orientation = orientation.compose(Transform::HFlip);
        }
        if v_flip {
            orientation = orientation.compose(Transform::VFlip);
        }
        orientation
    }

    /// Equivalent (horizontal, vertical) sensor flips.
    pub fn flips(self) -> (bool, bool) {
        match self {
            Orientation::Rotate0 => (false, false),
            Orientation::Rotate0Mirror => (true, false),
            Orientation::Rotate180Mirror => (false, true),
            Orientation::Rotate180 => (true, true),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfiguration {
    pub role: StreamRole,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub color_space: Option<ColorSpace>,
    pub buffer_count: u32,
    /// Bytes per line, settled by the device during validation.
    pub stride: u32,
    /// Bytes per buffer, settled by the device during validation.
    pub frame_size: usize,
}

impl StreamConfiguration {
    fn new(role: StreamRole, width: u32, height: u32, pixel_format: PixelFormat, buffers: u32) -> Self {
        let stride = pixel_format.min_stride(width);
        Self {
            role,
            width,
            height,
            pixel_format,
            color_space: None,
            buffer_count: buffers,
            stride,
            frame_size: pixel_format.frame_size(stride, height),
        }
    }
}

/// Outcome of checking a configuration against what the device can do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationStatus {
    Valid,
    Adjusted,
    Invalid,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CameraConfiguration {
    pub streams: Vec<StreamConfiguration>,
    pub orientation: Orientation,
}

impl CameraConfiguration {
    pub fn from_params(params: &Parameters) -> Self {
        let buffers = params.buffer_count;
        let mut video = StreamConfiguration::new(
            StreamRole::Video,
            params.width,
            params.height,
            PixelFormat::Yuv420,
            buffers,
        );
        video.color_space = Some(ColorSpace::for_resolution(params.width, params.height));
        let mut streams = vec![video];

        if let Some(mode) = &params.mode {
            streams.push(StreamConfiguration::new(
                StreamRole::Raw,
                mode.width,
                mode.height,
                PixelFormat::for_sensor_mode(mode),
                buffers,
            ));
        }

        if params.has_secondary() {
            streams.push(StreamConfiguration::new(
                StreamRole::Secondary,
                params.secondary_width,
                params.secondary_height,
                PixelFormat::Yuv420,
                buffers,
            ));
        }

        Self {
            streams,
            orientation: Orientation::from_flips(params.h_flip, params.v_flip),
        }
    }

    pub fn stream(&self, role: StreamRole) -> Option<&StreamConfiguration> {
        self.streams.iter().find(|stream| stream.role == role)
    }

    pub fn stream_mut(&mut self, role: StreamRole) -> Option<&mut StreamConfiguration> {
        self.streams.iter_mut().find(|stream| stream.role == role)
    }

    pub fn roles(&self) -> Vec<StreamRole> {
        self.streams.iter().map(|stream| stream.role).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colorspace_follows_resolution() {
        assert_eq!(ColorSpace::for_resolution(1280, 720), ColorSpace::Rec709);
        assert_eq!(ColorSpace::for_resolution(1280, 480), ColorSpace::Rec709);
        assert_eq!(ColorSpace::for_resolution(640, 720), ColorSpace::Rec709);
        assert_eq!(ColorSpace::for_resolution(640, 480), ColorSpace::Smpte170m);
    }

    #[test]
    fn pixelformat_words_match_videodev2() {
        assert_eq!(PixelFormat::Yuv420.pixelformat(), 0x3231_5559);
        assert_eq!(PixelFormat::Sbggr10Csi2p.pixelformat(), 0x4141_4270);
        assert_eq!(PixelFormat::Sbggr8.fourcc().str().ok(), Some("BA81"));
    }

    #[test]
    fn odd_yuv_frames_round_chroma_up() {
        assert_eq!(PixelFormat::Yuv420.frame_size(640, 480), 640 * 480 * 3 / 2);
        assert_eq!(PixelFormat::Yuv420.frame_size(3, 2), 6 + 2 * 2);
        assert_eq!(PixelFormat::Yuv420.frame_size(5, 3), 15 + 2 * 3 * 2);
        assert_eq!(PixelFormat::Sbggr8.frame_size(5, 3), 15);
    }

    #[test]
    fn raw_format_table() {
        let mode = |bit_depth, packed| SensorMode {
            width: 4056,
            height: 3040,
            bit_depth,
            packed,
        };
        assert_eq!(PixelFormat::for_sensor_mode(&mode(8, false)), PixelFormat::Sbggr8);
        assert_eq!(PixelFormat::for_sensor_mode(&mode(8, true)), PixelFormat::Sbggr8);
        assert_eq!(PixelFormat::for_sensor_mode(&mode(10, false)), PixelFormat::Sbggr10);
        assert_eq!(PixelFormat::for_sensor_mode(&mode(10, true)), PixelFormat::Sbggr10Csi2p);
        assert_eq!(PixelFormat::for_sensor_mode(&mode(12, false)), PixelFormat::Sbggr12);
        assert_eq!(PixelFormat::for_sensor_mode(&mode(12, true)), PixelFormat::Sbggr12Csi2p);
        assert_eq!(PixelFormat::for_sensor_mode(&mode(16, false)), PixelFormat::Sbggr12Csi2p);
    }

    #[test]
    fn flips_compose_into_orientation() {
        assert_eq!(Orientation::from_flips(false, false), Orientation::Rotate0);
        assert_eq!(Orientation::from_flips(true, false), Orientation::Rotate0Mirror);
        assert_eq!(Orientation::from_flips(false, true), Orientation::Rotate180Mirror);
        assert_eq!(Orientation::from_flips(true, true), Orientation::Rotate180);
        for (h, v) in [(false, false), (true, false), (false, true), (true, true)] {
            assert_eq!(Orientation::from_flips(h, v).flips(), (h, v));
        }
    }

    #[test]
    fn optional_streams_follow_params() -> anyhow::Result<()> {
        let params = Parameters {
            width: 640,
            height: 480,
            mode: Some("1332:990:10:P".parse()?),
            secondary_width: 320,
            secondary_height: 240,
            secondary_fps: 2.0,
            ..Parameters::default()
        };
        let config = CameraConfiguration::from_params(&params);
        assert_eq!(
            config.roles(),
            vec![StreamRole::Video, StreamRole::Raw, StreamRole::Secondary]
        );
        let video = config.stream(StreamRole::Video).expect("video stream");
        assert_eq!(video.color_space, Some(ColorSpace::Smpte170m));
        assert_eq!(video.frame_size, 640 * 480 * 3 / 2);
        let raw = config.stream(StreamRole::Raw).expect("raw stream");
        assert_eq!(raw.pixel_format, PixelFormat::Sbggr10Csi2p);
        assert_eq!(raw.buffer_count, params.buffer_count);

        let plain = CameraConfiguration::from_params(&Parameters::default());
        assert_eq!(plain.roles(), vec![StreamRole::Video]);
        Ok(())
    }
}
