//! Capture and encode settings.
//!
//! `Settings` is the single canonical record fed into the pipeline. Every key that can
//! be changed from the command line, the config file, the environment or a live
//! control command is a `ParamKey`; each key owns its parser, its range validation and
//! the hardware parameter it maps to.

use crate::error::ControlError;
use crate::hal::{CameraParameter, ParamTarget};

pub const DEFAULT_VIDEO_WIDTH: u32 = 1920;
pub const DEFAULT_VIDEO_HEIGHT: u32 = 1080;
pub const DEFAULT_STREAM_WIDTH: u32 = 320;
pub const DEFAULT_QUALITY: u32 = 75;

pub const SENSOR_MAX_WIDTH: u32 = 2592;
pub const SENSOR_MAX_HEIGHT: u32 = 1944;
pub const ROI_FULL: u32 = 65536;
pub const MAX_ANNOTATION_BYTES: usize = 255;
pub const MAX_SHUTTER_US: u32 = 6_000_000;

/// Stream heights are rounded down to this alignment.
pub const STREAM_ALIGN: u32 = 16;

macro_rules! closed_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, String> {
                let wanted = s.trim().to_ascii_lowercase();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|candidate| candidate.as_str() == wanted)
                    .ok_or_else(|| {
                        let names: Vec<&str> = Self::ALL.iter().map(|v| v.as_str()).collect();
                        format!("expected one of {}", names.join(", "))
                    })
            }
        }
    };
}

closed_enum!(
    /// Sensor exposure program.
    ExposureMode {
        Off => "off",
        Auto => "auto",
        Night => "night",
        NightPreview => "nightpreview",
        Backlight => "backlight",
        Spotlight => "spotlight",
        Sports => "sports",
        Snow => "snow",
        Beach => "beach",
        VeryLong => "verylong",
        FixedFps => "fixedfps",
        AntiShake => "antishake",
        Fireworks => "fireworks",
    }
);

closed_enum!(
    /// Automatic white balance mode.
    AwbMode {
        Off => "off",
        Auto => "auto",
        Sun => "sun",
        Cloudy => "cloudy",
        Shade => "shade",
        Tungsten => "tungsten",
        Fluorescent => "fluorescent",
        Incandescent => "incandescent",
        Flash => "flash",
        Horizon => "horizon",
    }
);

closed_enum!(
    MeteringMode {
        Average => "average",
        Spot => "spot",
        Backlit => "backlit",
        Matrix => "matrix",
    }
);

closed_enum!(
    /// Image effect applied by the sensor pipeline.
    ImageEffect {
        None => "none",
        Negative => "negative",
        Solarise => "solarise",
        Sketch => "sketch",
        Denoise => "denoise",
        Emboss => "emboss",
        OilPaint => "oilpaint",
        Hatch => "hatch",
        GPen => "gpen",
        Pastel => "pastel",
        Watercolour => "watercolour",
        Film => "film",
        Blur => "blur",
        Saturation => "saturation",
        ColourSwap => "colourswap",
        WashedOut => "washedout",
        Posterise => "posterise",
        ColourPoint => "colourpoint",
        ColourBalance => "colourbalance",
        Cartoon => "cartoon",
    }
);

impl Default for ExposureMode {
    fn default() -> Self {
        ExposureMode::Auto
    }
}

impl Default for AwbMode {
    fn default() -> Self {
        AwbMode::Auto
    }
}

impl Default for MeteringMode {
    fn default() -> Self {
        MeteringMode::Average
    }
}

impl Default for ImageEffect {
    fn default() -> Self {
        ImageEffect::None
    }
}

/// Fixed chroma override (`u:v`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColourEffect {
    pub u: u32,
    pub v: u32,
}

/// Sensor region of interest in 1/65536 units of the full frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Default for Roi {
    fn default() -> Self {
        Roi {
            x: 0,
            y: 0,
            w: ROI_FULL,
            h: ROI_FULL,
        }
    }
}

impl std::fmt::Display for Roi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}:{}", self.x, self.y, self.w, self.h)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mirror {
    None,
    Horizontal,
    Vertical,
    Both,
}

impl Mirror {
    pub fn from_flips(hflip: bool, vflip: bool) -> Self {
        match (hflip, vflip) {
            (false, false) => Mirror::None,
            (true, false) => Mirror::Horizontal,
            (false, true) => Mirror::Vertical,
            (true, true) => Mirror::Both,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub video_width: u32,
    pub video_height: u32,
    pub width: u32,
    pub quality: u32,
    pub annotation: String,
    pub anno_background: bool,
    pub sharpness: i32,
    pub contrast: i32,
    pub brightness: i32,
    pub saturation: i32,
    pub iso: u32,
    pub vstab: bool,
    pub ev: i32,
    pub exposure: ExposureMode,
    pub awb: AwbMode,
    pub imxfx: ImageEffect,
    pub colfx: Option<ColourEffect>,
    pub metering: MeteringMode,
    pub rotation: i32,
    pub hflip: bool,
    pub vflip: bool,
    pub roi: Roi,
    pub shutter: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            video_width: DEFAULT_VIDEO_WIDTH,
            video_height: DEFAULT_VIDEO_HEIGHT,
            width: DEFAULT_STREAM_WIDTH,
            quality: DEFAULT_QUALITY,
            annotation: String::new(),
            anno_background: false,
            sharpness: 0,
            contrast: 0,
            brightness: 50,
            saturation: 0,
            iso: 0,
            vstab: false,
            ev: 0,
            exposure: ExposureMode::default(),
            awb: AwbMode::default(),
            imxfx: ImageEffect::default(),
            colfx: None,
            metering: MeteringMode::default(),
            rotation: 0,
            hflip: false,
            vflip: false,
            roi: Roi::default(),
            shutter: 0,
        }
    }
}

impl Settings {
    /// Height of the scaled stream: aspect-preserving, rounded down to a multiple of 16.
    pub fn stream_height(&self) -> u32 {
        if self.video_width == 0 {
            return 0;
        }
        let height = u64::from(self.width) * u64::from(self.video_height)
            / u64::from(self.video_width);
        let height = height as u32;
        height - height % STREAM_ALIGN
    }

    pub fn stream_size(&self) -> (u32, u32) {
        (self.width, self.stream_height())
    }

    pub fn mirror(&self) -> Mirror {
        Mirror::from_flips(self.hflip, self.vflip)
    }

    /// Checks every key. Used before a pipeline is first built.
    pub fn validate(&self) -> Result<(), ControlError> {
        for key in ParamKey::ALL {
            key.validate(self)?;
        }
        Ok(())
    }
}

/// How a key reaches the hardware once it is changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyClass {
    /// Re-issued in place on the running graph.
    Parameter,
    /// Changes port formats; needs a full teardown and rebuild.
    Resolution,
}

/// Closed set of settings keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamKey {
    VideoWidth,
    VideoHeight,
    Width,
    Quality,
    Annotation,
    AnnoBackground,
    Sharpness,
    Contrast,
    Brightness,
    Saturation,
    Iso,
    Vstab,
    Ev,
    Exposure,
    Awb,
    Imxfx,
    Colfx,
    Metering,
    Rotation,
    Hflip,
    Vflip,
    Roi,
    Shutter,
}

impl ParamKey {
    pub const ALL: &'static [ParamKey] = &[
        ParamKey::VideoWidth,
        ParamKey::VideoHeight,
        ParamKey::Width,
        ParamKey::Quality,
        ParamKey::Annotation,
        ParamKey::AnnoBackground,
        ParamKey::Sharpness,
        ParamKey::Contrast,
        ParamKey::Brightness,
        ParamKey::Saturation,
        ParamKey::Iso,
        ParamKey::Vstab,
        ParamKey::Ev,
        ParamKey::Exposure,
        ParamKey::Awb,
        ParamKey::Imxfx,
        ParamKey::Colfx,
        ParamKey::Metering,
        ParamKey::Rotation,
        ParamKey::Hflip,
        ParamKey::Vflip,
        ParamKey::Roi,
        ParamKey::Shutter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ParamKey::VideoWidth => "video_width",
            ParamKey::VideoHeight => "video_height",
            ParamKey::Width => "width",
            ParamKey::Quality => "quality",
            ParamKey::Annotation => "annotation",
            ParamKey::AnnoBackground => "anno_background",
            ParamKey::Sharpness => "sharpness",
            ParamKey::Contrast => "contrast",
            ParamKey::Brightness => "brightness",
            ParamKey::Saturation => "saturation",
            ParamKey::Iso => "iso",
            ParamKey::Vstab => "vstab",
            ParamKey::Ev => "ev",
            ParamKey::Exposure => "exposure",
            ParamKey::Awb => "awb",
            ParamKey::Imxfx => "imxfx",
            ParamKey::Colfx => "colfx",
            ParamKey::Metering => "metering",
            ParamKey::Rotation => "rotation",
            ParamKey::Hflip => "hflip",
            ParamKey::Vflip => "vflip",
            ParamKey::Roi => "roi",
            ParamKey::Shutter => "shutter",
        }
    }

    /// Looks a key up by name. Case-insensitive; `-` and `_` are interchangeable.
    pub fn parse(name: &str) -> Result<Self, ControlError> {
        let wanted = name.trim().to_ascii_lowercase().replace('-', "_");
        ParamKey::ALL
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| ControlError::UnknownKey(name.trim().to_string()))
    }

    pub fn class(self) -> KeyClass {
        match self {
            ParamKey::VideoWidth | ParamKey::VideoHeight | ParamKey::Width => {
                KeyClass::Resolution
            }
            _ => KeyClass::Parameter,
        }
    }

    /// Value a bare key (no value given) stands for, if the key allows it.
    pub fn bare_value(self) -> Option<&'static str> {
        match self {
            ParamKey::AnnoBackground | ParamKey::Vstab | ParamKey::Hflip | ParamKey::Vflip => {
                Some("on")
            }
            ParamKey::Annotation | ParamKey::Colfx => Some(""),
            _ => None,
        }
    }

    /// Parses `raw`, validates the result and stores it. On error `settings` is left
    /// untouched.
    pub fn set(self, settings: &mut Settings, raw: &str) -> Result<(), ControlError> {
        let mut candidate = settings.clone();
        self.assign(&mut candidate, raw)?;
        self.validate(&candidate)?;
        *settings = candidate;
        Ok(())
    }

    /// Like `set`, but only range-checks this key's own value. Cross-field checks
    /// are left to a final `Settings::validate` once every source has been applied.
    pub fn store(self, settings: &mut Settings, raw: &str) -> Result<(), ControlError> {
        let mut candidate = settings.clone();
        self.assign(&mut candidate, raw)?;
        self.validate_range(&candidate)?;
        *settings = candidate;
        Ok(())
    }

    fn assign(self, s: &mut Settings, raw: &str) -> Result<(), ControlError> {
        let key = self.name();
        match self {
            ParamKey::VideoWidth => s.video_width = parse_u32(key, raw)?,
            ParamKey::VideoHeight => s.video_height = parse_u32(key, raw)?,
            ParamKey::Width => s.width = parse_u32(key, raw)?,
            ParamKey::Quality => s.quality = parse_u32(key, raw)?,
            ParamKey::Annotation => s.annotation = raw.to_string(),
            ParamKey::AnnoBackground => s.anno_background = parse_bool(key, raw)?,
            ParamKey::Sharpness => s.sharpness = parse_i32(key, raw)?,
            ParamKey::Contrast => s.contrast = parse_i32(key, raw)?,
            ParamKey::Brightness => s.brightness = parse_i32(key, raw)?,
            ParamKey::Saturation => s.saturation = parse_i32(key, raw)?,
            ParamKey::Iso => s.iso = parse_u32(key, raw)?,
            ParamKey::Vstab => s.vstab = parse_bool(key, raw)?,
            ParamKey::Ev => s.ev = parse_i32(key, raw)?,
            ParamKey::Exposure => s.exposure = parse_enum(key, raw)?,
            ParamKey::Awb => s.awb = parse_enum(key, raw)?,
            ParamKey::Imxfx => s.imxfx = parse_enum(key, raw)?,
            ParamKey::Colfx => s.colfx = parse_colfx(key, raw)?,
            ParamKey::Metering => s.metering = parse_enum(key, raw)?,
            ParamKey::Rotation => s.rotation = parse_i32(key, raw)?,
            ParamKey::Hflip => s.hflip = parse_bool(key, raw)?,
            ParamKey::Vflip => s.vflip = parse_bool(key, raw)?,
            ParamKey::Roi => s.roi = parse_roi(key, raw)?,
            ParamKey::Shutter => s.shutter = parse_u32(key, raw)?,
        }
        Ok(())
    }

    /// Checks the value currently held in `settings` for this key. Resolution keys
    /// also require the derived stream height to be usable.
    pub fn validate(self, s: &Settings) -> Result<(), ControlError> {
        self.validate_range(s)?;
        if self.class() == KeyClass::Resolution {
            stream_height_ok(s)
                .map_err(|reason| ControlError::invalid(self.name(), &self.value(s), reason))?;
        }
        Ok(())
    }

    fn validate_range(self, s: &Settings) -> Result<(), ControlError> {
        let fail = |reason: String| Err(ControlError::invalid(self.name(), &self.value(s), reason));
        match self {
            ParamKey::VideoWidth => {
                within(i64::from(s.video_width), 64, i64::from(SENSOR_MAX_WIDTH)).or_else(fail)
            }
            ParamKey::VideoHeight => {
                within(i64::from(s.video_height), 64, i64::from(SENSOR_MAX_HEIGHT)).or_else(fail)
            }
            ParamKey::Width => {
                within(i64::from(s.width), 16, i64::from(SENSOR_MAX_WIDTH)).or_else(fail)
            }
            ParamKey::Quality => within(i64::from(s.quality), 1, 100).or_else(fail),
            ParamKey::Annotation => {
                if s.annotation.len() > MAX_ANNOTATION_BYTES {
                    return fail(format!("longer than {} bytes", MAX_ANNOTATION_BYTES));
                }
                if s.annotation.chars().any(|c| c.is_control()) {
                    return fail("contains control characters".to_string());
                }
                Ok(())
            }
            ParamKey::Sharpness | ParamKey::Contrast | ParamKey::Saturation => {
                let value = match self {
                    ParamKey::Sharpness => s.sharpness,
                    ParamKey::Contrast => s.contrast,
                    _ => s.saturation,
                };
                within(i64::from(value), -100, 100).or_else(fail)
            }
            ParamKey::Brightness => within(i64::from(s.brightness), 0, 100).or_else(fail),
            ParamKey::Iso => {
                if s.iso == 0 || (100..=800).contains(&s.iso) {
                    Ok(())
                } else {
                    fail("expected 0 (auto) or 100..=800".to_string())
                }
            }
            ParamKey::Ev => within(i64::from(s.ev), -10, 10).or_else(fail),
            ParamKey::Colfx => match s.colfx {
                Some(effect) if effect.u > 255 || effect.v > 255 => {
                    fail("u and v must be within 0..=255".to_string())
                }
                _ => Ok(()),
            },
            ParamKey::Rotation => within(i64::from(s.rotation), 0, 359).or_else(fail),
            ParamKey::Roi => {
                let roi = s.roi;
                if [roi.x, roi.y, roi.w, roi.h].iter().any(|v| *v > ROI_FULL) {
                    return fail(format!("components must be within 0..={}", ROI_FULL));
                }
                Ok(())
            }
            ParamKey::Shutter => within(i64::from(s.shutter), 0, i64::from(MAX_SHUTTER_US))
                .or_else(fail),
            ParamKey::AnnoBackground
            | ParamKey::Vstab
            | ParamKey::Exposure
            | ParamKey::Awb
            | ParamKey::Imxfx
            | ParamKey::Metering
            | ParamKey::Hflip
            | ParamKey::Vflip => Ok(()),
        }
    }

    /// Current value of this key, in the same text form `set` accepts.
    pub fn value(self, s: &Settings) -> String {
        match self {
            ParamKey::VideoWidth => s.video_width.to_string(),
            ParamKey::VideoHeight => s.video_height.to_string(),
            ParamKey::Width => s.width.to_string(),
            ParamKey::Quality => s.quality.to_string(),
            ParamKey::Annotation => s.annotation.clone(),
            ParamKey::AnnoBackground => on_off(s.anno_background),
            ParamKey::Sharpness => s.sharpness.to_string(),
            ParamKey::Contrast => s.contrast.to_string(),
            ParamKey::Brightness => s.brightness.to_string(),
            ParamKey::Saturation => s.saturation.to_string(),
            ParamKey::Iso => s.iso.to_string(),
            ParamKey::Vstab => on_off(s.vstab),
            ParamKey::Ev => s.ev.to_string(),
            ParamKey::Exposure => s.exposure.to_string(),
            ParamKey::Awb => s.awb.to_string(),
            ParamKey::Imxfx => s.imxfx.to_string(),
            ParamKey::Colfx => match s.colfx {
                Some(effect) => format!("{}:{}", effect.u, effect.v),
                None => String::new(),
            },
            ParamKey::Metering => s.metering.to_string(),
            ParamKey::Rotation => s.rotation.to_string(),
            ParamKey::Hflip => on_off(s.hflip),
            ParamKey::Vflip => on_off(s.vflip),
            ParamKey::Roi => s.roi.to_string(),
            ParamKey::Shutter => s.shutter.to_string(),
        }
    }

    /// Hardware call this key is realised by. Resolution keys have none; keys that
    /// share a hardware parameter (flips, annotation text and background) each map to
    /// the combined value.
    pub fn camera_parameter(self, s: &Settings) -> Option<(ParamTarget, CameraParameter)> {
        let control = ParamTarget::CameraControl;
        let param = match self {
            ParamKey::VideoWidth | ParamKey::VideoHeight | ParamKey::Width => return None,
            ParamKey::Quality => {
                return Some((
                    ParamTarget::EncoderOutput,
                    CameraParameter::JpegQuality(s.quality),
                ))
            }
            ParamKey::Rotation => {
                return Some((
                    ParamTarget::CameraOutput,
                    CameraParameter::Rotation(s.rotation),
                ))
            }
            ParamKey::Hflip | ParamKey::Vflip => {
                return Some((
                    ParamTarget::CameraOutput,
                    CameraParameter::Mirror(s.mirror()),
                ))
            }
            ParamKey::Annotation | ParamKey::AnnoBackground => CameraParameter::Annotation {
                text: s.annotation.clone(),
                background: s.anno_background,
            },
            ParamKey::Sharpness => CameraParameter::Sharpness(s.sharpness),
            ParamKey::Contrast => CameraParameter::Contrast(s.contrast),
            ParamKey::Brightness => CameraParameter::Brightness(s.brightness),
            ParamKey::Saturation => CameraParameter::Saturation(s.saturation),
            ParamKey::Iso => CameraParameter::Iso(s.iso),
            ParamKey::Vstab => CameraParameter::VideoStabilisation(s.vstab),
            ParamKey::Ev => CameraParameter::ExposureCompensation(s.ev),
            ParamKey::Exposure => CameraParameter::ExposureMode(s.exposure),
            ParamKey::Awb => CameraParameter::AwbMode(s.awb),
            ParamKey::Imxfx => CameraParameter::ImageEffect(s.imxfx),
            ParamKey::Colfx => CameraParameter::ColourEffect(s.colfx),
            ParamKey::Metering => CameraParameter::MeteringMode(s.metering),
            ParamKey::Roi => CameraParameter::InputCrop(s.roi),
            ParamKey::Shutter => CameraParameter::ShutterSpeed(s.shutter),
        };
        Some((control, param))
    }

    /// Parameter-class keys with one entry per distinct hardware call.
    pub fn hardware_parameters() -> impl Iterator<Item = ParamKey> {
        ParamKey::ALL.iter().copied().filter(|key| {
            key.class() == KeyClass::Parameter
                && !matches!(key, ParamKey::Vflip | ParamKey::AnnoBackground)
        })
    }

    /// Environment variable consulted for this key (`JPGSTREAM_<KEY>`).
    pub fn env_var(self) -> String {
        format!("JPGSTREAM_{}", self.name().to_ascii_uppercase())
    }
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ---- Value parsing ----

fn on_off(value: bool) -> String {
    let text = if value { "on" } else { "off" };
    text.to_string()
}

fn within(value: i64, min: i64, max: i64) -> Result<(), String> {
    if value < min || value > max {
        Err(format!("expected {}..={}", min, max))
    } else {
        Ok(())
    }
}

fn stream_height_ok(s: &Settings) -> Result<(), String> {
    if s.stream_height() < STREAM_ALIGN {
        Err(format!(
            "stream {}x{} from capture {}x{} is shorter than {} lines",
            s.width,
            s.stream_height(),
            s.video_width,
            s.video_height,
            STREAM_ALIGN
        ))
    } else {
        Ok(())
    }
}

fn parse_i64(key: &str, raw: &str) -> Result<i64, ControlError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ControlError::invalid(key, raw, "not an integer"))
}

fn parse_i32(key: &str, raw: &str) -> Result<i32, ControlError> {
    i32::try_from(parse_i64(key, raw)?).map_err(|_| ControlError::invalid(key, raw, "out of range"))
}

fn parse_u32(key: &str, raw: &str) -> Result<u32, ControlError> {
    u32::try_from(parse_i64(key, raw)?)
        .map_err(|_| ControlError::invalid(key, raw, "must be a non-negative integer"))
}

pub(crate) fn parse_bool(key: &str, raw: &str) -> Result<bool, ControlError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "on" | "1" | "true" | "yes" => Ok(true),
        "off" | "0" | "false" | "no" => Ok(false),
        _ => Err(ControlError::invalid(key, raw, "expected on/off")),
    }
}

fn parse_enum<T>(key: &str, raw: &str) -> Result<T, ControlError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>()
        .map_err(|reason| ControlError::invalid(key, raw, reason))
}

fn parse_colfx(key: &str, raw: &str) -> Result<Option<ColourEffect>, ControlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let (u, v) = trimmed
        .split_once(':')
        .ok_or_else(|| ControlError::invalid(key, raw, "expected u:v"))?;
    Ok(Some(ColourEffect {
        u: parse_u32(key, u)?,
        v: parse_u32(key, v)?,
    }))
}

fn parse_roi(key: &str, raw: &str) -> Result<Roi, ControlError> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    if parts.len() != 4 {
        return Err(ControlError::invalid(key, raw, "expected x:y:w:h"));
    }
    Ok(Roi {
        x: parse_u32(key, parts[0])?,
        y: parse_u32(key, parts[1])?,
        w: parse_u32(key, parts[2])?,
        h: parse_u32(key, parts[3])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.width, 320);
        assert_eq!(s.quality, 75);
        assert_eq!(s.brightness, 50);
        assert_eq!(s.roi, Roi::default());
        assert_eq!(s.exposure, ExposureMode::Auto);
        assert_eq!(s.metering, MeteringMode::Average);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn stream_height_rounds_down_to_alignment() {
        let mut s = Settings::default();
        assert_eq!(s.stream_size(), (320, 176));
        s.width = 640;
        assert_eq!(s.stream_height(), 352);
        s.video_width = 1296;
        s.video_height = 972;
        s.width = 100;
        assert_eq!(s.stream_height(), 64);
    }

    #[test]
    fn set_rejects_out_of_range_and_leaves_settings_untouched() {
        let mut s = Settings::default();
        let before = s.clone();
        let err = ParamKey::Sharpness.set(&mut s, "150").unwrap_err();
        assert!(matches!(err, ControlError::InvalidValue { .. }));
        assert_eq!(s, before);

        assert!(ParamKey::Iso.set(&mut s, "50").is_err());
        assert!(ParamKey::Iso.set(&mut s, "400").is_ok());
        assert_eq!(s.iso, 400);
    }

    #[test]
    fn enum_keys_accept_only_closed_sets() {
        let mut s = Settings::default();
        ParamKey::Exposure.set(&mut s, "Night").unwrap();
        assert_eq!(s.exposure, ExposureMode::Night);
        let err = ParamKey::Awb.set(&mut s, "moonlight").unwrap_err();
        assert!(err.to_string().contains("expected one of"));
        assert_eq!(s.awb, AwbMode::Auto);
    }

    #[test]
    fn composite_values_parse() {
        let mut s = Settings::default();
        ParamKey::Colfx.set(&mut s, "128:64").unwrap();
        assert_eq!(s.colfx, Some(ColourEffect { u: 128, v: 64 }));
        assert!(ParamKey::Colfx.set(&mut s, "300:1").is_err());
        ParamKey::Colfx.set(&mut s, "off").unwrap();
        assert_eq!(s.colfx, None);

        ParamKey::Roi.set(&mut s, "100:200:30000:40000").unwrap();
        assert_eq!(s.roi.to_string(), "100:200:30000:40000");
        assert!(ParamKey::Roi.set(&mut s, "1:2:3").is_err());
        assert!(ParamKey::Roi.set(&mut s, "0:0:70000:1").is_err());
    }

    #[test]
    fn resolution_keys_check_derived_stream_height() {
        let mut s = Settings::default();
        assert!(ParamKey::Width.set(&mut s, "16").is_err());
        assert_eq!(s.width, 320);
        ParamKey::Width.set(&mut s, "640").unwrap();
        assert_eq!(ParamKey::Width.class(), KeyClass::Resolution);
        assert_eq!(ParamKey::Quality.class(), KeyClass::Parameter);
    }

    #[test]
    fn key_lookup_is_lenient_about_case_and_dashes() {
        assert_eq!(ParamKey::parse("Video-Width").unwrap(), ParamKey::VideoWidth);
        assert_eq!(ParamKey::parse("ISO").unwrap(), ParamKey::Iso);
        assert_eq!(
            ParamKey::parse("zoom").unwrap_err(),
            ControlError::UnknownKey("zoom".to_string())
        );
    }

    #[test]
    fn hardware_parameters_cover_each_call_once() {
        let keys: Vec<ParamKey> = ParamKey::hardware_parameters().collect();
        assert!(keys.contains(&ParamKey::Hflip));
        assert!(!keys.contains(&ParamKey::Vflip));
        assert!(!keys.contains(&ParamKey::Width));
        let s = Settings::default();
        for key in keys {
            assert!(key.camera_parameter(&s).is_some(), "{} has no hardware call", key);
        }
    }

    #[test]
    fn value_round_trips_through_set() {
        let mut s = Settings::default();
        ParamKey::Hflip.set(&mut s, "on").unwrap();
        ParamKey::Annotation.set(&mut s, "cam %Y-%m-%d").unwrap();
        let mut copy = Settings::default();
        for key in ParamKey::ALL {
            key.set(&mut copy, &key.value(&s)).unwrap();
        }
        assert_eq!(copy, s);
    }
}
