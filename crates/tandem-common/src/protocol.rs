//! Signaling payloads produced and consumed by the session coordinator.
//!
//! These are plain strings on the wire. The JSON shapes match what browsers
//! emit for `RTCSessionDescriptionInit` and `RTCIceCandidateInit`, so they can
//! be forwarded over any signaling transport unchanged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Type of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            "pranswer" => Ok(SdpType::Pranswer),
            "rollback" => Ok(SdpType::Rollback),
            other => Err(Error::protocol(format!("unknown SDP type '{other}'"))),
        }
    }
}

/// A session description: SDP type plus the serialized SDP body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    /// Build a description from the string pair used on the signaling surface.
    ///
    /// A rollback carries no body; every other type requires one.
    pub fn parse(sdp_type: &str, sdp: &str) -> Result<Self> {
        let sdp_type = SdpType::from_str(sdp_type)?;
        if sdp_type != SdpType::Rollback && sdp.trim().is_empty() {
            return Err(Error::protocol(format!("empty SDP body for {sdp_type}")));
        }
        Ok(Self::new(sdp_type, sdp))
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Minimum number of fields in a `candidate:` attribute value
/// (foundation, component, transport, priority, address, port, "typ", type).
const MIN_CANDIDATE_FIELDS: usize = 8;

/// One ICE candidate as exchanged with the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    /// Validate and build a candidate from its signaling triple.
    ///
    /// Accepts the attribute with or without a leading `a=`.
    pub fn parse(sdp_mid: &str, sdp_mline_index: u16, candidate: &str) -> Result<Self> {
        let trimmed = candidate.trim();
        let attribute = trimmed.strip_prefix("a=").unwrap_or(trimmed);
        let Some(value) = attribute.strip_prefix("candidate:") else {
            return Err(Error::protocol("ICE candidate must start with 'candidate:'"));
        };

        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() < MIN_CANDIDATE_FIELDS {
            return Err(Error::protocol(format!(
                "ICE candidate has {} fields, expected at least {}",
                fields.len(),
                MIN_CANDIDATE_FIELDS
            )));
        }
        if fields[6] != "typ" {
            return Err(Error::protocol("ICE candidate is missing 'typ'"));
        }
        if fields[3].parse::<u32>().is_err() || fields[5].parse::<u16>().is_err() {
            return Err(Error::protocol("ICE candidate has a malformed priority or port"));
        }

        Ok(Self {
            candidate: attribute.to_string(),
            sdp_mid: sdp_mid.to_string(),
            sdp_mline_index,
        })
    }

    /// Candidate type (`host`, `srflx`, `prflx`, `relay`).
    pub fn candidate_type(&self) -> Option<&str> {
        self.candidate.split_whitespace().nth(7)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let raw: IceCandidate = serde_json::from_str(json)?;
        Self::parse(&raw.sdp_mid, raw.sdp_mline_index, &raw.candidate)
    }
}
