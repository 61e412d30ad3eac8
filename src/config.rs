//! Engine configuration
//!
//! A `Config` is copied into the engine at `start` and treated as immutable
//! from then on. Live changes go through `ConfigUpdate`, which produces a
//! fresh validated `Config` that the engine publishes atomically.

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use thiserror::Error;

/// Largest strip the engine will drive
pub const MAX_LED_COUNT: usize = 4096;

/// Default WLED UDP realtime port
pub const DEFAULT_PORT: u16 = 21324;

/// Hard ceiling on the transmit rate
pub const MAX_FPS: u32 = 90;

/// Input device id meaning "let the platform choose"
pub const DEFAULT_INPUT_DEVICE: i32 = 0;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("LED count {0} out of range (1-4096)")]
    InvalidLedCount(usize),

    #[error("UDP port must be between 1 and 65535")]
    InvalidPort,

    #[error("Endpoint host is empty")]
    EmptyHost,

    #[error("Gamma must be a finite value >= 0.1, got {0}")]
    InvalidGamma(f32),

    #[error("Max FPS {0} out of range (1-90)")]
    InvalidMaxFps(u32),

    #[error("{protocol:?} addresses at most {max} LEDs, got {led_count}")]
    ProtocolRange {
        protocol: Protocol,
        led_count: usize,
        max: usize,
    },

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
}

/// Network location of the LED controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// IPv4/IPv6 literal or DNS name
    pub host: String,

    /// UDP port (1-65535)
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first usable socket address
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        let target = (self.host.as_str(), self.port);
        target
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(format!("{}:{} ({})", self.host, self.port, e)))?
            .next()
            .ok_or_else(|| ConfigError::Resolve(format!("{}:{}", self.host, self.port)))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        // WLED access-point address
        Self::new("4.3.2.1", DEFAULT_PORT)
    }
}

/// Audio capture backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Low-latency callback stream at the hinted rate and burst size
    Native,

    /// Shared-mode stream at the device's default configuration
    Portable,
}

/// UDP payload encoding understood by the LED controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Warls,
    Drgb,
    Dnrgb,
}

impl Protocol {
    /// Highest LED count this protocol can address
    pub fn max_leds(self) -> usize {
        match self {
            Protocol::Warls => 255,
            Protocol::Drgb => 490,
            Protocol::Dnrgb => MAX_LED_COUNT,
        }
    }

    /// Protocol picked when the config leaves it unset
    pub fn for_led_count(led_count: usize) -> Self {
        if led_count <= Protocol::Drgb.max_leds() {
            Protocol::Drgb
        } else {
            Protocol::Dnrgb
        }
    }
}

/// Effect selected for rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    #[default]
    Energy,
    Scroll,
    BeatFlash,
}

impl EffectKind {
    pub const ALL: [EffectKind; 3] = [EffectKind::Energy, EffectKind::Scroll, EffectKind::BeatFlash];

    pub fn name(self) -> &'static str {
        match self {
            EffectKind::Energy => "energy",
            EffectKind::Scroll => "scroll",
            EffectKind::BeatFlash => "beat_flash",
        }
    }

    /// Look up an effect by name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        Self::ALL.into_iter().find(|e| e.name() == lower)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EffectKind::Energy => 0,
            EffectKind::Scroll => 1,
            EffectKind::BeatFlash => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => EffectKind::Scroll,
            2 => EffectKind::BeatFlash,
            _ => EffectKind::Energy,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LED controller address
    pub endpoint: Endpoint,

    /// Number of LEDs on the strip
    pub led_count: usize,

    /// Capture backend; `None` picks the recommended one at start
    pub backend: Option<Backend>,

    /// Opaque device id from the host (0 = system default)
    pub input_device_id: i32,

    /// Advisory sample rate (0 = platform default)
    pub sample_rate_hint: u32,

    /// Advisory callback burst size in frames (0 = platform default)
    pub frames_per_burst_hint: u32,

    /// Wire format; `None` picks from `led_count`
    pub protocol: Option<Protocol>,

    /// Effect rendered at start
    pub effect: EffectKind,

    /// Mirror the Energy effect from the centre outwards
    pub symmetric: bool,

    /// Output gamma applied as the final step
    pub gamma: f32,

    /// Seconds the controller stays in realtime mode after the last packet
    pub timeout_secs: u8,

    /// Smoothed loudness below this blanks the Energy baseline
    pub silence_gate_db: f32,

    /// Transmit rate ceiling
    pub max_fps: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            led_count: 60,
            backend: None,
            input_device_id: DEFAULT_INPUT_DEVICE,
            sample_rate_hint: 0,
            frames_per_burst_hint: 0,
            protocol: None,
            effect: EffectKind::Energy,
            symmetric: false,
            gamma: 2.2,
            timeout_secs: 2,
            silence_gate_db: -70.0,
            max_fps: MAX_FPS,
        }
    }
}

impl Config {
    /// Parse a JSON config; missing keys take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Wire format actually used for this strip
    pub fn effective_protocol(&self) -> Protocol {
        self.protocol
            .unwrap_or_else(|| Protocol::for_led_count(self.led_count))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.led_count == 0 || self.led_count > MAX_LED_COUNT {
            return Err(ConfigError::InvalidLedCount(self.led_count));
        }
        if self.endpoint.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if !self.gamma.is_finite() || self.gamma < 0.1 {
            return Err(ConfigError::InvalidGamma(self.gamma));
        }
        if self.max_fps == 0 || self.max_fps > MAX_FPS {
            return Err(ConfigError::InvalidMaxFps(self.max_fps));
        }
        let protocol = self.effective_protocol();
        if self.led_count > protocol.max_leds() {
            return Err(ConfigError::ProtocolRange {
                protocol,
                led_count: self.led_count,
                max: protocol.max_leds(),
            });
        }
        Ok(())
    }

    /// Apply a live update, returning the new validated config
    pub fn with_update(&self, update: &ConfigUpdate) -> Result<Config, ConfigError> {
        let mut next = self.clone();
        if let Some(led_count) = update.led_count {
            next.led_count = led_count;
        }
        if let Some(ref endpoint) = update.endpoint {
            next.endpoint = endpoint.clone();
        }
        next.validate()?;
        Ok(next)
    }
}

/// Fields that may change while the engine is running
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub led_count: Option<usize>,
    pub endpoint: Option<Endpoint>,
}

impl ConfigUpdate {
    pub fn led_count(led_count: usize) -> Self {
        Self {
            led_count: Some(led_count),
            endpoint: None,
        }
    }

    pub fn endpoint(endpoint: Endpoint) -> Self {
        Self {
            led_count: None,
            endpoint: Some(endpoint),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.led_count.is_none() && self.endpoint.is_none()
    }
}
