use once_cell::sync::Lazy;
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "1.0";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sent with `login` and as the payload of `chat-ua`.
pub static USER_AGENT: Lazy<Value> = Lazy::new(|| {
    json!({
        "runtime": { "name": "tokio", "version": "1" },
        "sdk": { "type": "Rust", "version": SDK_VERSION },
        "os": { "name": std::env::consts::OS, "version": std::env::consts::ARCH },
        "capabilities": {
            "continualIceGathering": true,
            "unifiedPlan": true,
            "streamRemovable": true,
        },
    })
});
