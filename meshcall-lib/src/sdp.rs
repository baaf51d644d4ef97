use std::collections::HashMap;

use crate::media::{SessionDescription, TrackKind};

const GOOGLE_ICE_OPTION: &str = "a=ice-options:google-ice";

/// Codec names in order of preference. Empty lists keep the engine's order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecPreference {
    pub audio: Vec<String>,
    pub video: Vec<String>,
}

/// Applies the local description rewrites: codec preference and removal of
/// options the server does not understand.
pub fn munge_local_description(
    desc: SessionDescription,
    codecs: &CodecPreference,
) -> SessionDescription {
    let sdp: String = desc
        .sdp
        .split_inclusive('\n')
        .filter(|line| line.trim_end() != GOOGLE_ICE_OPTION)
        .collect();
    let sdp = prefer_codecs(&sdp, TrackKind::Audio, &codecs.audio);
    let sdp = prefer_codecs(&sdp, TrackKind::Video, &codecs.video);
    SessionDescription::new(desc.sdp_type, sdp)
}

/// Moves the payload types of `preferred` codecs to the front of every `m=` line of `kind`.
/// Retransmission payload types follow the codecs they protect. Other payload types keep
/// their relative order.
pub fn prefer_codecs(sdp: &str, kind: TrackKind, preferred: &[String]) -> String {
    if preferred.is_empty() {
        return sdp.to_owned();
    }
    let lines: Vec<&str> = sdp.lines().collect();

    let mut codec_names: HashMap<&str, String> = HashMap::new();
    let mut rtx_apt: HashMap<&str, &str> = HashMap::new();
    for line in &lines {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rest.splitn(2, ' ');
            let (Some(pt), Some(encoding)) = (parts.next(), parts.next()) else {
                continue;
            };
            let name = encoding.split('/').next().unwrap_or_default();
            codec_names.insert(pt, name.to_ascii_lowercase());
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            let mut parts = rest.splitn(2, ' ');
            let (Some(pt), Some(params)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Some(apt) = params
                .split(';')
                .find_map(|x| x.trim().strip_prefix("apt="))
            {
                rtx_apt.insert(pt, apt);
            }
        }
    }

    let m_prefix = format!("m={} ", kind.as_str());
    let mut output: Vec<String> = lines
        .iter()
        .map(|line| {
            if !line.starts_with(&m_prefix) {
                return (*line).to_owned();
            }
            let parts: Vec<&str> = line.split(' ').collect();
            if parts.len() <= 3 {
                return (*line).to_owned();
            }
            let (header, payload_types) = parts.split_at(3);
            let mut ordered: Vec<&str> = vec![];
            for codec in preferred {
                let codec = codec.to_ascii_lowercase();
                let matched: Vec<&str> = payload_types
                    .iter()
                    .copied()
                    .filter(|pt| !ordered.contains(pt) && codec_names.get(pt) == Some(&codec))
                    .collect();
                ordered.extend(matched);
            }
            let rtx: Vec<&str> = payload_types
                .iter()
                .copied()
                .filter(|pt| {
                    !ordered.contains(pt)
                        && rtx_apt
                            .get(pt)
                            .map(|apt| ordered.contains(apt))
                            .unwrap_or(false)
                })
                .collect();
            ordered.extend(rtx);
            let rest: Vec<&str> = payload_types
                .iter()
                .copied()
                .filter(|pt| !ordered.contains(pt))
                .collect();
            ordered.extend(rest);
            header
                .iter()
                .chain(ordered.iter())
                .copied()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    if sdp.ends_with('\n') {
        output.push(String::new());
    }
    output.join("\r\n")
}
