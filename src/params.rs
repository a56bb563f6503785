//! Parameter snapshots and their wire format.
//!
//! A `Parameters` value is immutable once built: a reload always decodes a
//! fresh snapshot and swaps it in whole. The wire format is a space-separated
//! list of `Key:Value` entries; string values are base64 encoded so they may
//! carry spaces and colons.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::fmt::Write as _;
use std::str::FromStr;

/// Fixed capture buffer depth.
pub const BUFFER_COUNT: u32 = 3;
/// Fixed pool of compressed-output buffers on the hardware encoder.
pub const CAPTURE_BUFFER_COUNT: u32 = 12;

/// A rectangle expressed as fractions (0..1) of the sensor's crop area.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Window {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FromStr for Window {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let parts: Vec<f32> = value
            .split(',')
            .map(|part| part.trim().parse::<f32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| anyhow!("window '{}' must be four numbers", value))?;
        if parts.len() != 4 {
            bail!("window '{}' must be four numbers", value);
        }
        if parts.iter().any(|v| !(0.0..=1.0).contains(v)) {
            bail!("window '{}' values must lie in 0..1", value);
        }
        Ok(Self {
            x: parts[0],
            y: parts[1],
            width: parts[2],
            height: parts[3],
        })
    }
}

/// Sensor readout mode, written `width:height:bitdepth:P|U`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorMode {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
    pub packed: bool,
}

impl FromStr for SensorMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() != 4 {
            bail!("sensor mode '{}' must be width:height:bitdepth:P|U", value);
        }
        let number = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| anyhow!("sensor mode '{}' has a non-numeric field", value))
        };
        let packed = match parts[3] {
            "P" => true,
            "U" => false,
            other => bail!("sensor mode packing must be P or U, got '{}'", other),
        };
        Ok(Self {
            width: number(parts[0])?,
            height: number(parts[1])?,
            bit_depth: number(parts[2])?,
            packed,
        })
    }
}

/// One configuration snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameters {
    pub log_level: String,
    pub camera_id: u32,
    pub width: u32,
    pub height: u32,
    pub h_flip: bool,
    pub v_flip: bool,
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub sharpness: f32,
    pub exposure: String,
    pub awb: String,
    pub awb_gain_red: f32,
    pub awb_gain_blue: f32,
    pub denoise: String,
    /// Exposure time in microseconds, 0 for automatic.
    pub shutter: u32,
    pub metering: String,
    /// Analogue gain, 0 for automatic.
    pub gain: f32,
    pub ev: f32,
    pub roi: Option<Window>,
    pub hdr: bool,
    pub tuning_file: String,
    pub mode: Option<SensorMode>,
    pub fps: f32,
    pub af_mode: String,
    pub af_range: String,
    pub af_speed: String,
    pub lens_position: f32,
    pub af_window: Option<Window>,
    /// Flicker period in microseconds, 0 disables flicker avoidance.
    pub flicker_period: u32,
    pub text_overlay_enable: bool,
    pub text_overlay: String,
    pub codec: String,
    pub idr_period: u32,
    pub bitrate: u32,
    pub hardware_h264_profile: String,
    pub hardware_h264_level: String,
    pub software_h264_profile: String,
    pub software_h264_level: String,
    pub secondary_width: u32,
    pub secondary_height: u32,
    pub secondary_fps: f32,
    pub secondary_mjpeg_quality: u32,
    pub buffer_count: u32,
    pub capture_buffer_count: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            camera_id: 0,
            width: 1920,
            height: 1080,
            h_flip: false,
            v_flip: false,
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
            sharpness: 1.0,
            exposure: "normal".to_string(),
            awb: "auto".to_string(),
            awb_gain_red: 0.0,
            awb_gain_blue: 0.0,
            denoise: "off".to_string(),
            shutter: 0,
            metering: "centre".to_string(),
            gain: 0.0,
            ev: 0.0,
            roi: None,
            hdr: false,
            tuning_file: String::new(),
            mode: None,
            fps: 30.0,
            af_mode: "continuous".to_string(),
            af_range: "normal".to_string(),
            af_speed: "normal".to_string(),
            lens_position: 0.0,
            af_window: None,
            flicker_period: 0,
            text_overlay_enable: false,
            text_overlay: String::new(),
            codec: "auto".to_string(),
            idr_period: 60,
            bitrate: 1_000_000,
            hardware_h264_profile: "main".to_string(),
            hardware_h264_level: "4.1".to_string(),
            software_h264_profile: "baseline".to_string(),
            software_h264_level: "4.1".to_string(),
            secondary_width: 0,
            secondary_height: 0,
            secondary_fps: 0.0,
            secondary_mjpeg_quality: 60,
            buffer_count: BUFFER_COUNT,
            capture_buffer_count: CAPTURE_BUFFER_COUNT,
        }
    }
}

impl Parameters {
    /// Decode a snapshot from its wire form.
    pub fn unserialize(buf: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(buf).context("parameters are not valid UTF-8")?;
        let mut params = Self::default();
        for entry in text.split(' ').filter(|entry| !entry.is_empty()) {
            let (key, value) = entry
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed parameter entry '{}'", entry))?;
            params.apply(key, value)?;
        }
        params.validate()?;
        Ok(params)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "LogLevel" => self.log_level = decode_string(key, value)?,
            "CameraID" => self.camera_id = parse_number(key, value)?,
            "Width" => self.width = parse_number(key, value)?,
            "Height" => self.height = parse_number(key, value)?,
            "HFlip" => self.h_flip = value == "1",
            "VFlip" => self.v_flip = value == "1",
            "Brightness" => self.brightness = parse_number(key, value)?,
            "Contrast" => self.contrast = parse_number(key, value)?,
            "Saturation" => self.saturation = parse_number(key, value)?,
            "Sharpness" => self.sharpness = parse_number(key, value)?,
            "Exposure" => self.exposure = decode_string(key, value)?,
            "AWB" => self.awb = decode_string(key, value)?,
            "AWBGainRed" => self.awb_gain_red = parse_number(key, value)?,
            "AWBGainBlue" => self.awb_gain_blue = parse_number(key, value)?,
            "Denoise" => self.denoise = decode_string(key, value)?,
            "Shutter" => self.shutter = parse_number(key, value)?,
            "Metering" => self.metering = decode_string(key, value)?,
            "Gain" => self.gain = parse_number(key, value)?,
            "EV" => self.ev = parse_number(key, value)?,
            "ROI" => {
                let raw = decode_string(key, value)?;
                self.roi = if raw.is_empty() {
                    None
                } else {
                    Some(raw.parse().map_err(|err| anyhow!("invalid ROI: {}", err))?)
                };
            }
            "HDR" => self.hdr = value == "1",
            "TuningFile" => self.tuning_file = decode_string(key, value)?,
            "Mode" => {
                let raw = decode_string(key, value)?;
                self.mode = if raw.is_empty() {
                    None
                } else {
                    Some(
                        raw.parse()
                            .map_err(|err| anyhow!("invalid sensor mode: {}", err))?,
                    )
                };
            }
            "FPS" => self.fps = parse_number(key, value)?,
            "AfMode" => self.af_mode = decode_string(key, value)?,
            "AfRange" => self.af_range = decode_string(key, value)?,
            "AfSpeed" => self.af_speed = decode_string(key, value)?,
            "LensPosition" => self.lens_position = parse_number(key, value)?,
            "AfWindow" => {
                let raw = decode_string(key, value)?;
                self.af_window = if raw.is_empty() {
                    None
                } else {
                    Some(
                        raw.parse()
                            .map_err(|err| anyhow!("invalid AfWindow: {}", err))?,
                    )
                };
            }
            "FlickerPeriod" => self.flicker_period = parse_number(key, value)?,
            "TextOverlayEnable" => self.text_overlay_enable = value == "1",
            "TextOverlay" => self.text_overlay = decode_string(key, value)?,
            "Codec" => self.codec = decode_string(key, value)?,
            "IDRPeriod" => self.idr_period = parse_number(key, value)?,
            "Bitrate" => self.bitrate = parse_number(key, value)?,
            "HardwareH264Profile" => self.hardware_h264_profile = decode_string(key, value)?,
            "HardwareH264Level" => self.hardware_h264_level = decode_string(key, value)?,
            "SoftwareH264Profile" => self.software_h264_profile = decode_string(key, value)?,
            "SoftwareH264Level" => self.software_h264_level = decode_string(key, value)?,
            "SecondaryWidth" => self.secondary_width = parse_number(key, value)?,
            "SecondaryHeight" => self.secondary_height = parse_number(key, value)?,
            "SecondaryFPS" => self.secondary_fps = parse_number(key, value)?,
            "SecondaryMJPEGQuality" => self.secondary_mjpeg_quality = parse_number(key, value)?,
            other => log::debug!("Parameters: ignoring unknown key {}", other),
        }
        Ok(())
    }

    /// Reject snapshots that could not drive a capture session.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            bail!("width and height must be greater than zero");
        }
        if self.fps.is_nan() || self.fps <= 0.0 {
            bail!("fps must be greater than zero");
        }
        if self.secondary_width != 0 {
            if self.secondary_height == 0 {
                bail!("secondary height must be set when a secondary width is");
            }
            if self.secondary_fps.is_nan() || self.secondary_fps <= 0.0 {
                bail!("secondary fps must be greater than zero");
            }
            if !(1..=100).contains(&self.secondary_mjpeg_quality) {
                bail!("secondary MJPEG quality must be between 1 and 100");
            }
        }
        if self.buffer_count == 0 {
            bail!("buffer count must be greater than zero");
        }
        Ok(())
    }

    /// Encode the snapshot in wire form.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut num = |key: &str, value: &dyn std::fmt::Display| {
            let _ = write!(out, "{}:{} ", key, value);
        };
        num("CameraID", &self.camera_id);
        num("Width", &self.width);
        num("Height", &self.height);
        num("HFlip", &u8::from(self.h_flip));
        num("VFlip", &u8::from(self.v_flip));
        num("Brightness", &self.brightness);
        num("Contrast", &self.contrast);
        num("Saturation", &self.saturation);
        num("Sharpness", &self.sharpness);
        num("AWBGainRed", &self.awb_gain_red);
        num("AWBGainBlue", &self.awb_gain_blue);
        num("Shutter", &self.shutter);
        num("Gain", &self.gain);
        num("EV", &self.ev);
        num("HDR", &u8::from(self.hdr));
        num("FPS", &self.fps);
        num("LensPosition", &self.lens_position);
        num("FlickerPeriod", &self.flicker_period);
        num("TextOverlayEnable", &u8::from(self.text_overlay_enable));
        num("IDRPeriod", &self.idr_period);
        num("Bitrate", &self.bitrate);
        num("SecondaryWidth", &self.secondary_width);
        num("SecondaryHeight", &self.secondary_height);
        num("SecondaryFPS", &self.secondary_fps);
        num("SecondaryMJPEGQuality", &self.secondary_mjpeg_quality);

        let roi = self.roi.map(format_window).unwrap_or_default();
        let af_window = self.af_window.map(format_window).unwrap_or_default();
        let mode = self
            .mode
            .map(|m| {
                format!(
                    "{}:{}:{}:{}",
                    m.width,
                    m.height,
                    m.bit_depth,
                    if m.packed { "P" } else { "U" }
                )
            })
            .unwrap_or_default();
        for (key, value) in [
            ("LogLevel", self.log_level.as_str()),
            ("Exposure", self.exposure.as_str()),
            ("AWB", self.awb.as_str()),
            ("Denoise", self.denoise.as_str()),
            ("Metering", self.metering.as_str()),
            ("ROI", roi.as_str()),
            ("TuningFile", self.tuning_file.as_str()),
            ("Mode", mode.as_str()),
            ("AfMode", self.af_mode.as_str()),
            ("AfRange", self.af_range.as_str()),
            ("AfSpeed", self.af_speed.as_str()),
            ("AfWindow", af_window.as_str()),
            ("TextOverlay", self.text_overlay.as_str()),
            ("Codec", self.codec.as_str()),
            ("HardwareH264Profile", self.hardware_h264_profile.as_str()),
            ("HardwareH264Level", self.hardware_h264_level.as_str()),
            ("SoftwareH264Profile", self.software_h264_profile.as_str()),
            ("SoftwareH264Level", self.software_h264_level.as_str()),
        ] {
            let _ = write!(out, "{}:{} ", key, BASE64.encode(value));
        }
        out.trim_end().to_string()
    }

    /// Log filter requested by the snapshot.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.log_level.as_str() {
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }

    /// Whether a secondary stream is requested.
    pub fn has_secondary(&self) -> bool {
        self.secondary_width != 0
    }
}

fn format_window(window: Window) -> String {
    format!(
        "{},{},{},{}",
        window.x, window.y, window.width, window.height
    )
}

fn decode_string(key: &str, value: &str) -> Result<String> {
    let bytes = BASE64
        .decode(value)
        .map_err(|err| anyhow!("{} is not valid base64: {}", key, err))?;
    String::from_utf8(bytes).map_err(|_| anyhow!("{} is not valid UTF-8", key))
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value))
}
