use serde_json::{json, Map, Value};

use crate::media::{LocalStream, Resolution, TrackKind};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishOptions {
    /// Overrides `max_video_bitrate_kbps` of the client configuration.
    pub max_video_bitrate_kbps: Option<u32>,
    pub max_audio_bitrate_kbps: Option<u32>,
}

/// Video parameters requested from the server for a subscription.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VideoUpdateOptions {
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<u32>,
    pub key_frame_interval: Option<u32>,
    pub bitrate_multiplier: Option<f64>,
}

impl VideoUpdateOptions {
    pub(crate) fn parameters(&self) -> Value {
        let mut params = Map::new();
        if let Some(resolution) = self.resolution {
            params.insert(
                "resolution".to_owned(),
                json!({ "width": resolution.width, "height": resolution.height }),
            );
        }
        if let Some(frame_rate) = self.frame_rate {
            params.insert("framerate".to_owned(), json!(frame_rate));
        }
        if let Some(multiplier) = self.bitrate_multiplier {
            params.insert("bitrate".to_owned(), json!(format!("x{}", multiplier)));
        }
        if let Some(interval) = self.key_frame_interval {
            params.insert("keyFrameInterval".to_owned(), json!(interval));
        }
        Value::Object(params)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeOptions {
    pub audio: bool,
    /// `None` leaves video out of the subscription.
    pub video: Option<VideoUpdateOptions>,
    pub simulcast_rid: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoUpdateOptions::default()),
            simulcast_rid: None,
        }
    }
}

pub(crate) fn publish_message(stream: &LocalStream) -> Value {
    let source = stream.source();
    let video = match source.video {
        Some(kind) => {
            let mut params = Map::new();
            if let Some(resolution) = stream.resolution {
                params.insert(
                    "resolution".to_owned(),
                    json!({ "width": resolution.width, "height": resolution.height }),
                );
            }
            if let Some(frame_rate) = stream.frame_rate {
                params.insert("framerate".to_owned(), json!(frame_rate));
            }
            json!({ "parameters": params, "source": kind })
        }
        None => json!(false),
    };
    let audio = match source.audio {
        Some(kind) => json!({ "source": kind }),
        None => json!(false),
    };
    let mut msg = json!({ "media": { "video": video, "audio": audio } });
    if !stream.attributes.is_empty() {
        msg["attributes"] = json!(stream.attributes);
    }
    msg
}

pub(crate) fn subscribe_message(stream_id: &str, options: &SubscribeOptions) -> Value {
    let video = match &options.video {
        Some(video) => {
            let mut msg = json!({ "from": stream_id });
            let params = video.parameters();
            if params.as_object().is_some_and(|x| !x.is_empty()) {
                msg["parameters"] = params;
            }
            if let Some(rid) = &options.simulcast_rid {
                msg["simulcastRid"] = json!(rid);
            }
            msg
        }
        None => json!(false),
    };
    let audio = if options.audio {
        json!({ "from": stream_id })
    } else {
        json!(false)
    };
    json!({ "media": { "video": video, "audio": audio } })
}

pub(crate) fn control_operation(mute: bool) -> &'static str {
    if mute {
        "pause"
    } else {
        "play"
    }
}

pub(crate) fn control_message(id: &str, kind: TrackKind, mute: bool) -> Value {
    json!({ "id": id, "operation": control_operation(mute), "data": kind.as_str() })
}
