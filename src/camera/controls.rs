//! Image pipeline controls.
//!
//! `dynamic_controls` is a pure mapping from a parameter snapshot to the
//! controls that may change while streaming. `start_controls` adds the
//! autofocus and crop controls that are only applied when capture starts and
//! that need the sensor geometry.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

use crate::params::{Parameters, Window};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    /// Scale a fractional window to `area` and translate it by the area's
    /// top-left corner.
    pub fn from_window(window: &Window, area: &Rectangle) -> Self {
        Self {
            x: (window.x * area.width as f32) as i32 + area.x,
            y: (window.y * area.height as f32) as i32 + area.y,
            width: (window.width * area.width as f32) as u32,
            height: (window.height * area.height as f32) as u32,
        }
    }
}

/// Static properties a device reports about itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CameraProperties {
    /// Largest crop rectangle on the sensor's pixel array.
    pub scaler_crop_maximum: Option<Rectangle>,
    pub supports_autofocus: bool,
}

// ----------------------------------------------------------------------------
// Control values
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureMode {
    Normal,
    Short,
    Long,
    Custom,
}

impl ExposureMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "short" => ExposureMode::Short,
            "long" => ExposureMode::Long,
            "custom" => ExposureMode::Custom,
            _ => ExposureMode::Normal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AwbMode {
    Auto,
    Incandescent,
    Tungsten,
    Fluorescent,
    Indoor,
    Daylight,
    Cloudy,
    Custom,
}

impl AwbMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "incandescent" => AwbMode::Incandescent,
            "tungsten" => AwbMode::Tungsten,
            "fluorescent" => AwbMode::Fluorescent,
            "indoor" => AwbMode::Indoor,
            "daylight" => AwbMode::Daylight,
            "cloudy" => AwbMode::Cloudy,
            "custom" => AwbMode::Custom,
            _ => AwbMode::Auto,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseReductionMode {
    Off,
    Fast,
    HighQuality,
    Minimal,
}

impl NoiseReductionMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "cdn_off" => NoiseReductionMode::Minimal,
            "cdn_hq" => NoiseReductionMode::HighQuality,
            "cdn_fast" => NoiseReductionMode::Fast,
            _ => NoiseReductionMode::Off,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeteringMode {
    CentreWeighted,
    Spot,
    Matrix,
    Custom,
}

impl MeteringMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "spot" => MeteringMode::Spot,
            "matrix" => MeteringMode::Matrix,
            "custom" => MeteringMode::Custom,
            _ => MeteringMode::CentreWeighted,
        }
    }
}

/// Shared shape of the exposure-time, gain and flicker mode controls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManualMode {
    Auto,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlickerMode {
    Off,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfMode {
    Manual,
    Auto,
    Continuous,
}

impl AfMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "manual" => AfMode::Manual,
            "continuous" => AfMode::Continuous,
            _ => AfMode::Auto,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfRange {
    Normal,
    Macro,
    Full,
}

impl AfRange {
    pub fn from_name(name: &str) -> Self {
        match name {
            "macro" => AfRange::Macro,
            "full" => AfRange::Full,
            _ => AfRange::Normal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfSpeed {
    Normal,
    Fast,
}

impl AfSpeed {
    pub fn from_name(name: &str) -> Self {
        match name {
            "fast" => AfSpeed::Fast,
            _ => AfSpeed::Normal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfMetering {
    Auto,
    Windows,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfTrigger {
    Start,
    Cancel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlId {
    Brightness,
    Contrast,
    Saturation,
    Sharpness,
    AeExposureMode,
    AeFlickerMode,
    AeFlickerPeriod,
    AwbMode,
    ColourGains,
    NoiseReductionMode,
    ExposureTimeMode,
    ExposureTime,
    AeMeteringMode,
    AnalogueGainMode,
    AnalogueGain,
    ExposureValue,
    FrameDurationLimits,
    AfMetering,
    AfWindows,
    AfMode,
    AfRange,
    AfSpeed,
    AfTrigger,
    LensPosition,
    ScalerCrop,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Control {
    Brightness(f32),
    Contrast(f32),
    Saturation(f32),
    Sharpness(f32),
    AeExposureMode(ExposureMode),
    AeFlickerMode(FlickerMode),
    /// Microseconds.
    AeFlickerPeriod(u32),
    AwbMode(AwbMode),
    /// Red and blue gains.
    ColourGains([f32; 2]),
    NoiseReductionMode(NoiseReductionMode),
    ExposureTimeMode(ManualMode),
    /// Microseconds.
    ExposureTime(u32),
    AeMeteringMode(MeteringMode),
    AnalogueGainMode(ManualMode),
    AnalogueGain(f32),
    ExposureValue(f32),
    /// Minimum and maximum frame duration in microseconds.
    FrameDurationLimits([i64; 2]),
    AfMetering(AfMetering),
    AfWindows(Rectangle),
    AfMode(AfMode),
    AfRange(AfRange),
    AfSpeed(AfSpeed),
    AfTrigger(AfTrigger),
    LensPosition(f32),
    ScalerCrop(Rectangle),
}

impl Control {
    pub fn id(&self) -> ControlId {
        match self {
            Control::Brightness(_) => ControlId::Brightness,
            Control::Contrast(_) => ControlId::Contrast,
            Control::Saturation(_) => ControlId::Saturation,
            Control::Sharpness(_) => ControlId::Sharpness,
            Control::AeExposureMode(_) => ControlId::AeExposureMode,
            Control::AeFlickerMode(_) => ControlId::AeFlickerMode,
            Control::AeFlickerPeriod(_) => ControlId::AeFlickerPeriod,
            Control::AwbMode(_) => ControlId::AwbMode,
            Control::ColourGains(_) => ControlId::ColourGains,
            Control::NoiseReductionMode(_) => ControlId::NoiseReductionMode,
            Control::ExposureTimeMode(_) => ControlId::ExposureTimeMode,
            Control::ExposureTime(_) => ControlId::ExposureTime,
            Control::AeMeteringMode(_) => ControlId::AeMeteringMode,
            Control::AnalogueGainMode(_) => ControlId::AnalogueGainMode,
            Control::AnalogueGain(_) => ControlId::AnalogueGain,
            Control::ExposureValue(_) => ControlId::ExposureValue,
            Control::FrameDurationLimits(_) => ControlId::FrameDurationLimits,
            Control::AfMetering(_) => ControlId::AfMetering,
            Control::AfWindows(_) => ControlId::AfWindows,
            Control::AfMode(_) => ControlId::AfMode,
            Control::AfRange(_) => ControlId::AfRange,
            Control::AfSpeed(_) => ControlId::AfSpeed,
            Control::AfTrigger(_) => ControlId::AfTrigger,
            Control::LensPosition(_) => ControlId::LensPosition,
            Control::ScalerCrop(_) => ControlId::ScalerCrop,
        }
    }
}

/// Set of control values, at most one per control id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlList {
    values: BTreeMap<ControlId, Control>,
}

impl ControlList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, control: Control) {
        self.values.insert(control.id(), control);
    }

    pub fn get(&self, id: ControlId) -> Option<&Control> {
        self.values.get(&id)
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.values.contains_key(&id)
    }

    /// Overwrite entries with those of `other`.
    pub fn merge(&mut self, other: &ControlList) {
        for control in other.iter() {
            self.set(*control);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Control> {
        self.values.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Move the contents out, leaving the list empty.
    pub fn take(&mut self) -> ControlList {
        std::mem::take(self)
    }
}

// ----------------------------------------------------------------------------
// Assembly
// ----------------------------------------------------------------------------

/// Controls that may change while streaming.
pub fn dynamic_controls(params: &Parameters) -> ControlList {
    let mut ctrls = ControlList::new();
    ctrls.set(Control::Brightness(params.brightness));
    ctrls.set(Control::Contrast(params.contrast));
    ctrls.set(Control::Saturation(params.saturation));
    ctrls.set(Control::Sharpness(params.sharpness));

    ctrls.set(Control::AeExposureMode(ExposureMode::from_name(&params.exposure)));

    if params.flicker_period != 0 {
        ctrls.set(Control::AeFlickerMode(FlickerMode::Manual));
        ctrls.set(Control::AeFlickerPeriod(params.flicker_period));
    } else {
        ctrls.set(Control::AeFlickerMode(FlickerMode::Off));
    }

    ctrls.set(Control::AwbMode(AwbMode::from_name(&params.awb)));
    if params.awb_gain_red > 0.0 && params.awb_gain_blue > 0.0 {
        ctrls.set(Control::ColourGains([params.awb_gain_red, params.awb_gain_blue]));
    }

    ctrls.set(Control::NoiseReductionMode(NoiseReductionMode::from_name(
        &params.denoise,
    )));

    if params.shutter != 0 {
        ctrls.set(Control::ExposureTimeMode(ManualMode::Manual));
        ctrls.set(Control::ExposureTime(params.shutter));
    } else {
        ctrls.set(Control::ExposureTimeMode(ManualMode::Auto));
    }

    ctrls.set(Control::AeMeteringMode(MeteringMode::from_name(&params.metering)));

    if params.gain != 0.0 {
        ctrls.set(Control::AnalogueGainMode(ManualMode::Manual));
        ctrls.set(Control::AnalogueGain(params.gain));
    } else {
        ctrls.set(Control::AnalogueGainMode(ManualMode::Auto));
    }

    ctrls.set(Control::ExposureValue(params.ev));

    let frame_time = (1_000_000f32 / params.fps) as i64;
    ctrls.set(Control::FrameDurationLimits([frame_time, frame_time]));
    ctrls
}

/// Full control set applied when capture starts.
pub fn start_controls(params: &Parameters, properties: &CameraProperties) -> Result<ControlList> {
    let mut ctrls = dynamic_controls(params);

    if properties.supports_autofocus {
        if let Some(window) = &params.af_window {
            let area = sensor_area(properties)?;
            ctrls.set(Control::AfMetering(AfMetering::Windows));
            ctrls.set(Control::AfWindows(Rectangle::from_window(window, &area)));
        }

        let af_mode = AfMode::from_name(&params.af_mode);
        ctrls.set(Control::AfMode(af_mode));
        ctrls.set(Control::AfRange(AfRange::from_name(&params.af_range)));
        ctrls.set(Control::AfSpeed(AfSpeed::from_name(&params.af_speed)));

        match params.af_mode.as_str() {
            "auto" => ctrls.set(Control::AfTrigger(AfTrigger::Start)),
            "manual" => ctrls.set(Control::LensPosition(params.lens_position)),
            _ => {}
        }
    }

    if let Some(roi) = &params.roi {
        let area = sensor_area(properties)?;
        ctrls.set(Control::ScalerCrop(Rectangle::from_window(roi, &area)));
    }

    Ok(ctrls)
}

fn sensor_area(properties: &CameraProperties) -> Result<Rectangle> {
    properties
        .scaler_crop_maximum
        .ok_or_else(|| anyhow!("camera does not report its maximum scaler crop"))
}
