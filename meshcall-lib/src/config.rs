use std::{io::ErrorKind, path::Path, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;

use crate::{
    engine::{GatheringPolicy, RtcConfiguration},
    sdp::CodecPreference,
};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ClientConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub continual_ice_gathering: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub ticket_refresh_fallback_secs: u64,
    /// Unanswered offers fail after this long. Disabled when absent.
    pub negotiation_timeout_ms: Option<u64>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub max_video_bitrate_kbps: Option<u32>,
    pub max_audio_bitrate_kbps: Option<u32>,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![],
            continual_ice_gathering: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            ticket_refresh_fallback_secs: 5 * 60,
            negotiation_timeout_ms: None,
            video_codecs: vec![],
            audio_codecs: vec![],
            max_video_bitrate_kbps: None,
            max_audio_bitrate_kbps: None,
        }
    }
}

impl ClientConfiguration {
    pub fn from_toml_str(src: &str) -> Result<Self> {
        Ok(toml::from_str(src)?)
    }

    /// Reads the configuration file, or returns the defaults if it does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        match read_to_string(path).await {
            Ok(src) => Self::from_toml_str(&src),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ticket_refresh_fallback(&self) -> Duration {
        Duration::from_secs(self.ticket_refresh_fallback_secs)
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_ms.map(Duration::from_millis)
    }

    pub fn codec_preference(&self) -> CodecPreference {
        CodecPreference {
            audio: self.audio_codecs.clone(),
            video: self.video_codecs.clone(),
        }
    }

    pub fn rtc_configuration(&self, continual_ice_gathering: bool) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: self.ice_servers.clone(),
            gathering_policy: if continual_ice_gathering {
                GatheringPolicy::Continually
            } else {
                GatheringPolicy::Once
            },
        }
    }
}
