use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Re-export common dependencies
pub use serde;
pub use bincode;
pub use tokio;
pub use tracing;

// IPC client module
pub mod ipc_client;

/// Color modes a keyboard backlight zone can be driven in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Static,
}

/// What the discovered keyboard backlight can do.
///
/// The color maxima are only present when the zones are RGB capable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklightCapabilities {
    pub zones: u32,
    pub max_brightness: u32,
    pub max_red: Option<u8>,
    pub max_green: Option<u8>,
    pub max_blue: Option<u8>,
    pub modes: Vec<ColorMode>,
}

impl BacklightCapabilities {
    /// Single white-only zone
    pub fn white(max_brightness: u32) -> Self {
        Self {
            zones: 1,
            max_brightness,
            max_red: None,
            max_green: None,
            max_blue: None,
            modes: vec![ColorMode::Static],
        }
    }

    /// `zones` RGB zones with the full 8-bit range per channel
    pub fn rgb(zones: u32, max_brightness: u32) -> Self {
        Self {
            zones,
            max_brightness,
            max_red: Some(u8::MAX),
            max_green: Some(u8::MAX),
            max_blue: Some(u8::MAX),
            modes: vec![ColorMode::Static],
        }
    }

    pub fn has_rgb(&self) -> bool {
        self.max_red.is_some() && self.max_green.is_some() && self.max_blue.is_some()
    }
}

/// State of one backlight zone. Index in the surrounding sequence is the zone index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklightZoneState {
    pub mode: ColorMode,
    pub brightness: u32,
    pub red: Option<u8>,
    pub green: Option<u8>,
    pub blue: Option<u8>,
}

impl BacklightZoneState {
    pub fn white(brightness: u32) -> Self {
        Self {
            mode: ColorMode::Static,
            brightness,
            red: None,
            green: None,
            blue: None,
        }
    }

    pub fn rgb(brightness: u32, color: Rgb) -> Self {
        Self {
            mode: ColorMode::Static,
            brightness,
            red: Some(color.red),
            green: Some(color.green),
            blue: Some(color.blue),
        }
    }

    /// The zone color, if all three channels are set
    pub fn color(&self) -> Option<Rgb> {
        Some(Rgb {
            red: self.red?,
            green: self.green?,
            blue: self.blue?,
        })
    }

    /// Color packed as `0xRRGGBB00`; missing channels count as zero
    pub fn packed_color(&self) -> u32 {
        Rgb {
            red: self.red.unwrap_or(0),
            green: self.green.unwrap_or(0),
            blue: self.blue.unwrap_or(0),
        }
        .to_packed()
    }
}

/// An 8-bit per channel color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb { red: 0xff, green: 0xff, blue: 0xff };

    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Decompose `0xRRGGBBAA`, ignoring the lowest byte
    pub fn from_packed(value: u32) -> Self {
        Self {
            red: (value >> 24) as u8,
            green: (value >> 16) as u8,
            blue: (value >> 8) as u8,
        }
    }

    /// Pack into `0xRRGGBB00`
    pub fn to_packed(self) -> u32 {
        (u32::from(self.red) << 24) | (u32::from(self.green) << 16) | (u32::from(self.blue) << 8)
    }
}

/// Formats as the LED class `multi_intensity` text: `"R G B"` in decimal
impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.red, self.green, self.blue)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRgbError(String);

impl fmt::Display for ParseRgbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid multi_intensity value: {:?}", self.0)
    }
}

impl std::error::Error for ParseRgbError {}

impl FromStr for Rgb {
    type Err = ParseRgbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRgbError(s.to_string());
        let mut channels = s.split_whitespace().map(|c| c.parse::<u8>());
        let red = channels.next().ok_or_else(err)?.map_err(|_| err())?;
        let green = channels.next().ok_or_else(err)?.map_err(|_| err())?;
        let blue = channels.next().ok_or_else(err)?.map_err(|_| err())?;
        Ok(Self { red, green, blue })
    }
}

/// A resolution together with the refresh rates it supports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayMode {
    pub x_resolution: u32,
    pub y_resolution: u32,
    pub refresh_rates: Vec<f64>,
}

/// Everything known about the internal panel from one display-server query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayModesReport {
    pub display_name: String,
    /// Zero-valued unless the display server marked a rate as current
    pub active_mode: DisplayMode,
    pub display_modes: Vec<DisplayMode>,
}

/// IPC Requests from GUI to Daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Discovered keyboard backlight capabilities
    GetCapabilities,

    /// Current published keyboard backlight state
    GetBacklightState,

    /// Request a new keyboard backlight state.
    /// `payload` is the JSON encoding produced by [`encode_backlight_state`].
    PushBacklightState {
        payload: String,
    },

    /// Resolutions and refresh rates of the internal panel
    GetDisplayModes,

    /// Change the panel refresh rate
    SetRefreshRate {
        rate: f64,
    },

    /// Change the panel resolution
    SetResolution {
        x: u32,
        y: u32,
    },

    /// Change resolution and refresh rate in one command
    SetRefreshResolution {
        x: u32,
        y: u32,
        rate: f64,
    },

    /// Get daemon status and version
    GetStatus,
}

/// IPC Responses from Daemon to GUI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Backlight capabilities, `None` while probing or when unsupported
    Capabilities(Option<BacklightCapabilities>),

    /// Published backlight state, one entry per zone
    BacklightState(Vec<BacklightZoneState>),

    /// Panel modes, `None` without a usable X11 session
    DisplayModes(Option<DisplayModesReport>),

    /// Acknowledgment of successful operation
    Ack,

    /// Status information
    Status {
        version: String,
        uptime_seconds: u64,
        backlight_supported: bool,
    },

    /// Error response
    Error(String),
}

/// Serialization helpers for the IPC protocol
pub fn serialize<T: Serialize>(msg: &T) -> Vec<u8> {
    bincode::serialize(msg).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize message: {:?}", e);
        Vec::new()
    })
}

pub fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

/// Encode a backlight state the way it travels in [`Request::PushBacklightState`]
pub fn encode_backlight_state(states: &[BacklightZoneState]) -> String {
    serde_json::to_string(states).unwrap_or_else(|e| {
        tracing::error!("Failed to encode backlight state: {:?}", e);
        "[]".to_string()
    })
}

pub fn decode_backlight_state(payload: &str) -> Result<Vec<BacklightZoneState>, serde_json::Error> {
    serde_json::from_str(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_color_round_trip() {
        let samples: Vec<u8> = (0..=255u8).step_by(17).chain([1, 128, 254]).collect();
        for &red in &samples {
            for &green in &samples {
                for &blue in &samples {
                    let packed = Rgb::new(red, green, blue).to_packed();
                    assert_eq!(Rgb::from_packed(packed), Rgb::new(red, green, blue));
                }
            }
        }
        for value in 0..=255u8 {
            assert_eq!(Rgb::from_packed(Rgb::new(value, 0, 0).to_packed()).red, value);
            assert_eq!(Rgb::from_packed(Rgb::new(0, value, 0).to_packed()).green, value);
            assert_eq!(Rgb::from_packed(Rgb::new(0, 0, value).to_packed()).blue, value);
        }
    }

    #[test]
    fn test_packed_layout() {
        assert_eq!(Rgb::new(0x12, 0x34, 0x56).to_packed(), 0x1234_5600);
        // Lowest byte is ignored
        assert_eq!(Rgb::from_packed(0x1234_56ff), Rgb::new(0x12, 0x34, 0x56));
    }

    #[test]
    fn test_multi_intensity_format() {
        assert_eq!(Rgb::new(255, 0, 17).to_string(), "255 0 17");
        assert_eq!("255 0 17\n".parse::<Rgb>().unwrap(), Rgb::new(255, 0, 17));
        assert!("255 0".parse::<Rgb>().is_err());
        assert!("256 0 0".parse::<Rgb>().is_err());
    }

    #[test]
    fn test_backlight_state_payload() {
        let states = vec![
            BacklightZoneState::rgb(128, Rgb::new(255, 0, 0)),
            BacklightZoneState::white(3),
        ];
        let payload = encode_backlight_state(&states);
        assert_eq!(decode_backlight_state(&payload).unwrap(), states);

        // Color fields may be omitted entirely
        let decoded = decode_backlight_state(r#"[{"mode":"static","brightness":2}]"#).unwrap();
        assert_eq!(decoded, vec![BacklightZoneState::white(2)]);

        assert!(decode_backlight_state("not json").is_err());
        assert!(decode_backlight_state(r#"[{"mode":"rainbow","brightness":2}]"#).is_err());
    }

    #[test]
    fn test_capability_tiers() {
        let white = BacklightCapabilities::white(2);
        assert_eq!(white.zones, 1);
        assert!(!white.has_rgb());

        let rgb = BacklightCapabilities::rgb(3, 255);
        assert!(rgb.has_rgb());
        assert_eq!(rgb.max_red, Some(255));
    }

    #[test]
    fn test_ipc_serialization() {
        let request = Request::SetRefreshResolution { x: 2560, y: 1440, rate: 165.0 };
        let serialized = serialize(&request);
        let deserialized: Request = deserialize(&serialized).unwrap();
        assert!(matches!(
            deserialized,
            Request::SetRefreshResolution { x: 2560, y: 1440, rate } if rate == 165.0
        ));

        let response = Response::BacklightState(vec![BacklightZoneState::rgb(10, Rgb::WHITE)]);
        let deserialized: Response = deserialize(&serialize(&response)).unwrap();
        match deserialized {
            Response::BacklightState(states) => assert_eq!(states[0].color(), Some(Rgb::WHITE)),
            other => panic!("Expected BacklightState response, got {:?}", other),
        }
    }
}
