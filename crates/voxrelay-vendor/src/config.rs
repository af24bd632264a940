use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_RECOGNITION_URL: &str =
    "wss://office-api-ast-dx.iflyaisol.com/ast/communicate/v1";

pub const DEFAULT_SYNTHESIS_URL: &str = "https://cbm01.cn-huabei-1.xf-yun.com/v1/private/mcd9m97e6";

fn default_recognition_url() -> String {
    DEFAULT_RECOGNITION_URL.to_string()
}

fn default_synthesis_url() -> String {
    DEFAULT_SYNTHESIS_URL.to_string()
}

fn default_audio_encode() -> String {
    "pcm_s16le".to_string()
}

fn default_lang() -> String {
    "autodialect".to_string()
}

fn default_sample_rate() -> u32 {
    voxrelay_types::SAMPLE_RATE_HZ
}

fn default_recognition_pool() -> PoolSettings {
    PoolSettings {
        max_size: 100,
        ..PoolSettings::default()
    }
}

fn default_synthesis_pool() -> PoolSettings {
    PoolSettings {
        max_size: 10,
        ..PoolSettings::default()
    }
}

fn default_pool_max_size() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_handshake_timeout_ms() -> u64 {
    15_000
}

/// Sizing and timeouts for one vendor connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Upper bound on connections created by the pool (idle + checked out).
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    /// How long `acquire` waits for a free connection once the pool is full.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// How long a new connection may take to complete its open handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Credentials and stream parameters for the speech-recognition vendor.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_recognition_url")]
    pub url: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default, skip_serializing)]
    pub access_key_secret: String,
    #[serde(default = "default_audio_encode")]
    pub audio_encode: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Restart the recognition cycle after this much audio silence from the
    /// client. Unset means rely on the vendor's own silence detection.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default = "default_recognition_pool")]
    pub pool: PoolSettings,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            url: default_recognition_url(),
            app_id: String::new(),
            access_key_id: String::new(),
            access_key_secret: String::new(),
            audio_encode: default_audio_encode(),
            lang: default_lang(),
            sample_rate: default_sample_rate(),
            idle_timeout_ms: None,
            pool: default_recognition_pool(),
        }
    }
}

impl fmt::Debug for RecognitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognitionConfig")
            .field("url", &self.url)
            .field("app_id", &self.app_id)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"[REDACTED]")
            .field("audio_encode", &self.audio_encode)
            .field("lang", &self.lang)
            .field("sample_rate", &self.sample_rate)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("pool", &self.pool)
            .finish()
    }
}

impl RecognitionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn default_vcn() -> String {
    "x5_lingfeiyi_flow".to_string()
}

fn default_level() -> u8 {
    50
}

fn default_audio_encoding() -> String {
    "lame".to_string()
}

fn default_synthesis_sample_rate() -> u32 {
    24_000
}

/// Voice and output format requested from the synthesis vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceParams {
    #[serde(default = "default_vcn")]
    pub vcn: String,
    #[serde(default = "default_level")]
    pub speed: u8,
    #[serde(default = "default_level")]
    pub volume: u8,
    #[serde(default = "default_level")]
    pub pitch: u8,
    /// `lame` yields MP3, `raw` yields PCM.
    #[serde(default = "default_audio_encoding")]
    pub encoding: String,
    #[serde(default = "default_synthesis_sample_rate")]
    pub sample_rate: u32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            vcn: default_vcn(),
            speed: default_level(),
            volume: default_level(),
            pitch: default_level(),
            encoding: default_audio_encoding(),
            sample_rate: default_synthesis_sample_rate(),
        }
    }
}

impl VoiceParams {
    /// File extension matching `encoding`.
    pub fn file_extension(&self) -> &'static str {
        match self.encoding.as_str() {
            "lame" => "mp3",
            "raw" => "pcm",
            _ => "bin",
        }
    }
}

/// Credentials and voice settings for the speech-synthesis vendor.
#[derive(Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_synthesis_url")]
    pub url: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing)]
    pub api_secret: String,
    #[serde(default)]
    pub voice: VoiceParams,
    #[serde(default = "default_synthesis_pool")]
    pub pool: PoolSettings,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            url: default_synthesis_url(),
            app_id: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            voice: VoiceParams::default(),
            pool: default_synthesis_pool(),
        }
    }
}

impl fmt::Debug for SynthesisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisConfig")
            .field("url", &self.url)
            .field("app_id", &self.app_id)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("voice", &self.voice)
            .field("pool", &self.pool)
            .finish()
    }
}
