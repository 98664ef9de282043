//! Signaling wire messages
//!
//! Every frame exchanged through the relay is a single JSON object whose `type`
//! field selects one of four shapes: `join`, `offer`, `answer` and `candidate`.
//! Frames with any other `type` are not errors; they decode to `None` so newer
//! peers can add message kinds without breaking older ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Room used when a peer joins with an empty room name.
pub const DEFAULT_ROOM: &str = "default";

/// Errors produced while decoding or encoding a signaling frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is not valid JSON, or a known message has the wrong fields.
    #[error("malformed signaling frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame is not an object with a string `type` field.
    #[error("signaling frame has no message type")]
    MissingType,
    /// `sdpType` disagrees with the message envelope.
    #[error("sdpType {found:?} does not match a {expected:?} message")]
    SdpTypeMismatch { expected: SdpType, found: SdpType },
    /// A candidate without its transport descriptor or any m-line reference.
    #[error("partial ice candidate")]
    PartialCandidate,
    /// An offer or answer carrying no sdp, neither flat nor nested.
    #[error("session description has no sdp")]
    MissingSdp,
}

/// Which half of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An opaque session description together with its type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate as it travels over the relay. The `candidate` string is
/// never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// A candidate is usable when it has a descriptor and names its m-line
    /// either by mid or by index.
    pub fn is_complete(&self) -> bool {
        !self.candidate.trim().is_empty()
            && (self.sdp_mid.is_some() || self.sdp_mline_index.is_some())
    }
}

/// A decoded signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Join { room: String },
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl Signal {
    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Join { .. } => "join",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::Candidate(_) => "candidate",
        }
    }

    /// Serialize to the JSON text carried in one frame.
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&Wire::from(self.clone()))?)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Wire {
    Join { room: String },
    Offer(WireDescription),
    Answer(WireDescription),
    Candidate(IceCandidate),
}

#[derive(Serialize, Deserialize)]
struct WireDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(rename = "sdpType", default, skip_serializing_if = "Option::is_none")]
    sdp_type: Option<SdpType>,
    /// Older peers send `{"description":{"type":..,"sdp":..}}` instead of a
    /// flat `sdp`.
    #[serde(default, skip_serializing)]
    description: Option<NestedDescription>,
}

#[derive(Serialize, Deserialize)]
struct NestedDescription {
    sdp: String,
    #[serde(rename = "type", default)]
    kind: Option<SdpType>,
}

impl WireDescription {
    fn flat(desc: SessionDescription) -> Self {
        Self {
            sdp: Some(desc.sdp),
            sdp_type: Some(desc.kind),
            description: None,
        }
    }

    /// The flat `sdp` wins unless it is empty, then the nested one is used.
    fn resolve(self, expected: SdpType) -> Result<SessionDescription, CodecError> {
        let (nested_sdp, nested_kind) = match self.description {
            Some(nested) => (Some(nested.sdp), nested.kind),
            None => (None, None),
        };
        check_sdp_type(expected, self.sdp_type.or(nested_kind))?;

        let sdp = match (self.sdp, nested_sdp) {
            (Some(sdp), _) if !sdp.is_empty() => sdp,
            (_, Some(nested)) => nested,
            (Some(sdp), None) => sdp,
            (None, None) => return Err(CodecError::MissingSdp),
        };
        Ok(SessionDescription {
            kind: expected,
            sdp,
        })
    }
}

impl From<Signal> for Wire {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Join { room } => Wire::Join { room },
            Signal::Offer(desc) => Wire::Offer(WireDescription::flat(desc)),
            Signal::Answer(desc) => Wire::Answer(WireDescription::flat(desc)),
            Signal::Candidate(candidate) => Wire::Candidate(candidate),
        }
    }
}

impl TryFrom<Wire> for Signal {
    type Error = CodecError;

    fn try_from(wire: Wire) -> Result<Self, Self::Error> {
        match wire {
            Wire::Join { room } => {
                let room = if room.is_empty() {
                    DEFAULT_ROOM.to_string()
                } else {
                    room
                };
                Ok(Signal::Join { room })
            }
            Wire::Offer(desc) => desc.resolve(SdpType::Offer).map(Signal::Offer),
            Wire::Answer(desc) => desc.resolve(SdpType::Answer).map(Signal::Answer),
            Wire::Candidate(candidate) => {
                if !candidate.is_complete() {
                    return Err(CodecError::PartialCandidate);
                }
                Ok(Signal::Candidate(candidate))
            }
        }
    }
}

fn check_sdp_type(expected: SdpType, found: Option<SdpType>) -> Result<(), CodecError> {
    match found {
        Some(found) if found != expected => Err(CodecError::SdpTypeMismatch { expected, found }),
        _ => Ok(()),
    }
}

/// Read the `type` tag of a frame without decoding the rest of it.
///
/// This is all the relay needs to know about a frame after the join: anything
/// that is a JSON object with a string `type` is a well-formed envelope.
pub fn message_type(raw: &str) -> Result<String, CodecError> {
    let value: Value = serde_json::from_str(raw)?;
    value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(CodecError::MissingType)
}

/// Decode one frame.
///
/// Returns `Ok(None)` for well-formed frames of an unknown type.
pub fn decode(raw: &str) -> Result<Option<Signal>, CodecError> {
    let value: Value = serde_json::from_str(raw)?;
    let known = match value.get("type").and_then(Value::as_str) {
        Some("join" | "offer" | "answer" | "candidate") => true,
        Some(_) => false,
        None => return Err(CodecError::MissingType),
    };
    if !known {
        return Ok(None);
    }

    let wire: Wire = serde_json::from_value(value)?;
    Signal::try_from(wire).map(Some)
}
