use serde_json::Value;

/// What the remote endpoint announced it can do in its `chat-ua`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CapabilitySet {
    pub stream_removable: bool,
    pub unified_plan: bool,
    pub continual_ice_gathering: bool,
}

/// Assumed until the remote user agent is known.
impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            stream_removable: true,
            unified_plan: true,
            continual_ice_gathering: true,
        }
    }
}

impl CapabilitySet {
    pub fn from_user_agent(ua: &Value) -> Self {
        match ua.get("capabilities") {
            Some(capabilities) => {
                let flag = |name: &str| {
                    capabilities
                        .get(name)
                        .and_then(|x| x.as_bool())
                        .unwrap_or(false)
                };
                Self {
                    stream_removable: flag("streamRemovable"),
                    unified_plan: flag("unifiedPlan"),
                    continual_ice_gathering: flag("continualIceGathering"),
                }
            }
            // Agents predating capabilities: only Firefox could not remove streams.
            None => Self {
                stream_removable: ua
                    .get("runtime")
                    .and_then(|x| x.get("name"))
                    .and_then(|x| x.as_str())
                    != Some("Firefox"),
                unified_plan: false,
                continual_ice_gathering: false,
            },
        }
    }
}
