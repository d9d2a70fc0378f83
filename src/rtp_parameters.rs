//! RTP capabilities and parameters as exchanged between endpoints, routers and the media
//! worker.
//!
//! The RTP capabilities define what a router or an endpoint can receive at media level; RTP
//! parameters describe a concrete stream. Consumable RTP parameters are the router-canonical
//! form of a producer's parameters (router-preferred payload types, mapped SSRCs) from which
//! per-consumer parameters are derived.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::num::{NonZeroU32, NonZeroU8};

/// Media kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Known audio MIME types.
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum MimeTypeAudio {
    #[serde(rename = "audio/opus")]
    Opus,
    #[serde(rename = "audio/PCMU")]
    Pcmu,
    #[serde(rename = "audio/PCMA")]
    Pcma,
    #[serde(rename = "audio/ISAC")]
    Isac,
    #[serde(rename = "audio/G722")]
    G722,
    #[serde(rename = "audio/iLBC")]
    Ilbc,
    #[serde(rename = "audio/SILK")]
    Silk,
    #[serde(rename = "audio/CN")]
    Cn,
    #[serde(rename = "audio/telephone-event")]
    TelephoneEvent,
    #[serde(rename = "audio/rtx")]
    Rtx,
}

/// Known video MIME types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum MimeTypeVideo {
    #[serde(rename = "video/VP8")]
    Vp8,
    #[serde(rename = "video/VP9")]
    Vp9,
    #[serde(rename = "video/H264")]
    H264,
    #[serde(rename = "video/H265")]
    H265,
    #[serde(rename = "video/rtx")]
    Rtx,
}

/// MIME type of audio or video codec.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MimeType {
    Audio(MimeTypeAudio),
    Video(MimeTypeVideo),
}

impl MimeType {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub(crate) fn is_rtx(&self) -> bool {
        matches!(
            self,
            Self::Audio(MimeTypeAudio::Rtx) | Self::Video(MimeTypeVideo::Rtx),
        )
    }
}

/// Value of a codec-specific parameter; either a string or an unsigned integer.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RtpCodecParametersParametersValue {
    String(String),
    Number(u32),
}

impl From<u32> for RtpCodecParametersParametersValue {
    fn from(value: u32) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RtpCodecParametersParametersValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RtpCodecParametersParametersValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Codec-specific parameters (such as `packetization-mode` and `profile-level-id` in H264 or
/// `profile-id` in VP9, critical for codec matching; `apt` in RTX codecs).
#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RtpCodecParametersParameters(
    BTreeMap<Cow<'static, str>, RtpCodecParametersParametersValue>,
);

impl RtpCodecParametersParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: Into<Cow<'static, str>>,
        V: Into<RtpCodecParametersParametersValue>,
    {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> &mut Self {
        self.0.remove(key);
        self
    }

    pub fn get(&self, key: &str) -> Option<&RtpCodecParametersParametersValue> {
        self.0.get(key)
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&Cow<'static, str>, &RtpCodecParametersParametersValue)> {
        self.0.iter()
    }
}

impl<const N: usize> From<[(&'static str, RtpCodecParametersParametersValue); N]>
    for RtpCodecParametersParameters
{
    fn from(array: [(&'static str, RtpCodecParametersParametersValue); N]) -> Self {
        Self(
            array
                .iter()
                .cloned()
                .map(|(key, value)| (Cow::Borrowed(key), value))
                .collect(),
        )
    }
}

/// RTCP feedback message supported by a codec.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum RtcpFeedback {
    Nack,
    NackPli,
    CcmFir,
    GoogRemb,
    TransportCc,
    /// Feedback combination this crate doesn't have a name for; kept verbatim.
    Unsupported {
        r#type: String,
        parameter: String,
    },
}

// Wire representation is `{"type": ..., "parameter": ...}` with `parameter` defaulting to "".
#[derive(Deserialize, Serialize)]
struct RtcpFeedbackWire {
    r#type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    parameter: String,
}

impl Serialize for RtcpFeedback {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (r#type, parameter) = match self {
            Self::Nack => ("nack", ""),
            Self::NackPli => ("nack", "pli"),
            Self::CcmFir => ("ccm", "fir"),
            Self::GoogRemb => ("goog-remb", ""),
            Self::TransportCc => ("transport-cc", ""),
            Self::Unsupported { r#type, parameter } => (r#type.as_str(), parameter.as_str()),
        };
        RtcpFeedbackWire {
            r#type: r#type.to_string(),
            parameter: parameter.to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RtcpFeedback {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = RtcpFeedbackWire::deserialize(deserializer)?;
        Ok(
            match (wire.r#type.as_str(), wire.parameter.as_str()) {
                ("nack", "") => Self::Nack,
                ("nack", "pli") => Self::NackPli,
                ("ccm", "fir") => Self::CcmFir,
                ("goog-remb", "") => Self::GoogRemb,
                ("transport-cc", "") => Self::TransportCc,
                _ => Self::Unsupported {
                    r#type: wire.r#type,
                    parameter: wire.parameter,
                },
            },
        )
    }
}

/// Provides information on the capabilities of a codec within the RTP capabilities.
///
/// Exactly one entry is present for each supported combination of parameters that requires a
/// distinct value of `preferred_payload_type`; for example multiple H264 codecs each with their
/// own `packetization-mode` and `profile-level-id` values.
///
/// Entries in the `media_codecs` array of router options do not require
/// `preferred_payload_type` (if unset, the router will choose a dynamic one).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RtpCodecCapability {
    #[serde(rename_all = "camelCase")]
    Audio {
        mime_type: MimeTypeAudio,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_payload_type: Option<u8>,
        clock_rate: NonZeroU32,
        /// The number of channels supported (e.g. two for stereo). Default 1.
        #[serde(default = "default_channels")]
        channels: NonZeroU8,
        #[serde(default)]
        parameters: RtpCodecParametersParameters,
        #[serde(default)]
        rtcp_feedback: Vec<RtcpFeedback>,
    },
    #[serde(rename_all = "camelCase")]
    Video {
        mime_type: MimeTypeVideo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_payload_type: Option<u8>,
        clock_rate: NonZeroU32,
        #[serde(default)]
        parameters: RtpCodecParametersParameters,
        #[serde(default)]
        rtcp_feedback: Vec<RtcpFeedback>,
    },
}

fn default_channels() -> NonZeroU8 {
    NonZeroU8::new(1).unwrap()
}

impl RtpCodecCapability {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio { .. } => MediaKind::Audio,
            Self::Video { .. } => MediaKind::Video,
        }
    }

    pub fn mime_type(&self) -> MimeType {
        match self {
            Self::Audio { mime_type, .. } => MimeType::Audio(*mime_type),
            Self::Video { mime_type, .. } => MimeType::Video(*mime_type),
        }
    }

    pub fn preferred_payload_type(&self) -> Option<u8> {
        match self {
            Self::Audio {
                preferred_payload_type,
                ..
            }
            | Self::Video {
                preferred_payload_type,
                ..
            } => *preferred_payload_type,
        }
    }

    pub(crate) fn set_preferred_payload_type(&mut self, payload_type: u8) {
        match self {
            Self::Audio {
                preferred_payload_type,
                ..
            }
            | Self::Video {
                preferred_payload_type,
                ..
            } => {
                preferred_payload_type.replace(payload_type);
            }
        }
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        match self {
            Self::Audio { clock_rate, .. } | Self::Video { clock_rate, .. } => *clock_rate,
        }
    }

    pub fn channels(&self) -> Option<NonZeroU8> {
        match self {
            Self::Audio { channels, .. } => Some(*channels),
            Self::Video { .. } => None,
        }
    }

    pub fn parameters(&self) -> &RtpCodecParametersParameters {
        match self {
            Self::Audio { parameters, .. } | Self::Video { parameters, .. } => parameters,
        }
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut RtpCodecParametersParameters {
        match self {
            Self::Audio { parameters, .. } | Self::Video { parameters, .. } => parameters,
        }
    }

    pub fn rtcp_feedback(&self) -> &Vec<RtcpFeedback> {
        match self {
            Self::Audio { rtcp_feedback, .. } | Self::Video { rtcp_feedback, .. } => {
                rtcp_feedback
            }
        }
    }

    pub(crate) fn is_rtx(&self) -> bool {
        self.mime_type().is_rtx()
    }
}

/// Direction of RTP header extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RtpHeaderExtensionDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Default for RtpHeaderExtensionDirection {
    fn default() -> Self {
        Self::SendRecv
    }
}

/// URI of an RTP header extension as defined in RFC 5285 and friends.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum RtpHeaderExtensionUri {
    #[serde(rename = "urn:ietf:params:rtp-hdrext:sdes:mid")]
    Mid,
    #[serde(rename = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id")]
    RtpStreamId,
    #[serde(rename = "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id")]
    RepairedRtpStreamId,
    #[serde(rename = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time")]
    AbsSendTime,
    #[serde(
        rename = "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
    )]
    TransportWideCcDraft01,
    #[serde(rename = "http://tools.ietf.org/html/draft-ietf-avtext-framemarking-07")]
    FrameMarkingDraft07,
    #[serde(rename = "urn:ietf:params:rtp-hdrext:framemarking")]
    FrameMarking,
    #[serde(rename = "urn:ietf:params:rtp-hdrext:ssrc-audio-level")]
    AudioLevel,
    #[serde(rename = "urn:3gpp:video-orientation")]
    VideoOrientation,
    #[serde(rename = "urn:ietf:params:rtp-hdrext:toffset")]
    TimeOffset,
}

/// Provides information relating to a header extension supported by a router or endpoint.
///
/// Encrypted RTP header extensions are not currently supported. The `direction` field is only
/// meaningful in router capabilities; it's ignored if present in endpoints' RTP capabilities.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    /// Media kind. If unset, it's valid for all kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    /// The URI of the RTP header extension.
    pub uri: RtpHeaderExtensionUri,
    /// The preferred numeric identifier that goes in the RTP packet. Must be unique.
    pub preferred_id: u8,
    /// If true, it is preferred that the value in the header be encrypted as per RFC 6904.
    /// Default false.
    #[serde(default)]
    pub preferred_encrypt: bool,
    /// `SendRecv` means the router supports sending and receiving this extension; `SendOnly`
    /// that it can only send it; `RecvOnly` that it can only receive it.
    #[serde(default)]
    pub direction: RtpHeaderExtensionDirection,
}

/// The RTP capabilities define what a router or an endpoint can receive at media level.
#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    /// Supported media and RTX codecs.
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    /// Supported RTP header extensions.
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

/// Provides information on codec settings within the RTP parameters.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RtpCodecParameters {
    #[serde(rename_all = "camelCase")]
    Audio {
        mime_type: MimeTypeAudio,
        /// The value that goes in the RTP Payload Type Field. Must be unique.
        payload_type: u8,
        clock_rate: NonZeroU32,
        /// The number of channels supported (e.g. two for stereo). Default 1.
        #[serde(default = "default_channels")]
        channels: NonZeroU8,
        #[serde(default)]
        parameters: RtpCodecParametersParameters,
        #[serde(default)]
        rtcp_feedback: Vec<RtcpFeedback>,
    },
    #[serde(rename_all = "camelCase")]
    Video {
        mime_type: MimeTypeVideo,
        /// The value that goes in the RTP Payload Type Field. Must be unique.
        payload_type: u8,
        clock_rate: NonZeroU32,
        #[serde(default)]
        parameters: RtpCodecParametersParameters,
        #[serde(default)]
        rtcp_feedback: Vec<RtcpFeedback>,
    },
}

impl RtpCodecParameters {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio { .. } => MediaKind::Audio,
            Self::Video { .. } => MediaKind::Video,
        }
    }

    pub fn mime_type(&self) -> MimeType {
        match self {
            Self::Audio { mime_type, .. } => MimeType::Audio(*mime_type),
            Self::Video { mime_type, .. } => MimeType::Video(*mime_type),
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Audio { payload_type, .. } | Self::Video { payload_type, .. } => *payload_type,
        }
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        match self {
            Self::Audio { clock_rate, .. } | Self::Video { clock_rate, .. } => *clock_rate,
        }
    }

    pub fn channels(&self) -> Option<NonZeroU8> {
        match self {
            Self::Audio { channels, .. } => Some(*channels),
            Self::Video { .. } => None,
        }
    }

    pub fn parameters(&self) -> &RtpCodecParametersParameters {
        match self {
            Self::Audio { parameters, .. } | Self::Video { parameters, .. } => parameters,
        }
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut RtpCodecParametersParameters {
        match self {
            Self::Audio { parameters, .. } | Self::Video { parameters, .. } => parameters,
        }
    }

    pub fn rtcp_feedback(&self) -> &Vec<RtcpFeedback> {
        match self {
            Self::Audio { rtcp_feedback, .. } | Self::Video { rtcp_feedback, .. } => {
                rtcp_feedback
            }
        }
    }

    pub(crate) fn rtcp_feedback_mut(&mut self) -> &mut Vec<RtcpFeedback> {
        match self {
            Self::Audio { rtcp_feedback, .. } | Self::Video { rtcp_feedback, .. } => {
                rtcp_feedback
            }
        }
    }

    pub(crate) fn is_rtx(&self) -> bool {
        self.mime_type().is_rtx()
    }
}

/// RTX stream information.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct RtpEncodingParametersRtx {
    /// The RTX SSRC.
    pub ssrc: u32,
}

/// Provides information relating to an encoding, which represents a media RTP stream and its
/// associated RTX stream (if any).
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    /// The media SSRC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    /// The RID RTP extension value. Must be unique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    /// Codec payload type this encoding affects. If unset, first media codec is chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_payload_type: Option<u8>,
    /// RTX stream information. It must contain a numeric ssrc field indicating the RTX SSRC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtpEncodingParametersRtx>,
    /// Whether discontinuous RTP transmission will be used. Useful for audio (if the codec
    /// supports it) and for video screen sharing (when static content is being transmitted,
    /// this option disables the RTP inactivity checks in the worker). Default false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtx: Option<bool>,
    /// Number of spatial and temporal layers in the RTP stream (e.g. "L1T3"). See webrtc-svc.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

/// Defines a RTP header extension within the RTP parameters.
///
/// Encrypted header extensions are not currently supported and no parameters are currently
/// considered.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    /// The URI of the RTP header extension.
    pub uri: RtpHeaderExtensionUri,
    /// The numeric identifier that goes in the RTP packet. Must be unique.
    pub id: u8,
    /// If true, the value in the header is encrypted as per RFC 6904. Default false.
    #[serde(default)]
    pub encrypt: bool,
    /// Configuration parameters for the header extension.
    #[serde(default)]
    pub parameters: RtpCodecParametersParameters,
}

/// Provides information on RTCP settings within the RTP parameters.
///
/// If no cname is given in a producer's RTP parameters, the transport will choose a random one
/// that will be used into RTCP SDES messages sent to all its associated consumers.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    /// The Canonical Name (CNAME) used by RTCP (e.g. in SDES messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    /// Whether reduced size RTCP (RFC 5506) is configured (if true) or compound RTCP as
    /// specified in RFC 3550 (if false). Default true.
    #[serde(default = "default_reduced_size")]
    pub reduced_size: bool,
    /// Whether RTCP-mux is used. Default true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux: Option<bool>,
}

fn default_reduced_size() -> bool {
    true
}

impl Default for RtcpParameters {
    fn default() -> Self {
        Self {
            cname: None,
            reduced_size: true,
            mux: None,
        }
    }
}

/// The RTP send parameters describe a media stream received by a router from an endpoint
/// through its corresponding producer, and the RTP receive parameters describe a media stream
/// as sent by a router to an endpoint through its corresponding consumer.
///
/// Send parameters may use a single encoding or multiple encodings (simulcast); in the latter
/// case each entry in `encodings` must include an `ssrc` or a `rid` field.
///
/// Receive parameters always have a single entry in `encodings`, with randomly generated ssrc
/// values (plus `rtx.ssrc` if the endpoint supports RTX), regardless of the producer's
/// original send parameters. The exception is consuming over a pipe transport, where all RTP
/// streams of the producer are forwarded verbatim.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    /// The MID RTP extension value as defined in the BUNDLE specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    /// Media and RTX codecs in use.
    pub codecs: Vec<RtpCodecParameters>,
    /// RTP header extensions in use.
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    /// Transmitted RTP streams and their settings.
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    /// Parameters used for RTCP.
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtcp_feedback_serde() {
        assert_eq!(
            serde_json::to_string(&RtcpFeedback::NackPli).unwrap(),
            r#"{"type":"nack","parameter":"pli"}"#,
        );
        assert_eq!(
            serde_json::to_string(&RtcpFeedback::TransportCc).unwrap(),
            r#"{"type":"transport-cc"}"#,
        );
        assert_eq!(
            serde_json::from_str::<RtcpFeedback>(r#"{"type":"nack"}"#).unwrap(),
            RtcpFeedback::Nack,
        );
        assert_eq!(
            serde_json::from_str::<RtcpFeedback>(r#"{"type":"ack","parameter":"rpsi"}"#)
                .unwrap(),
            RtcpFeedback::Unsupported {
                r#type: "ack".to_string(),
                parameter: "rpsi".to_string()
            },
        );
    }

    #[test]
    fn codec_parameters_serde() {
        let codec = RtpCodecParameters::Audio {
            mime_type: MimeTypeAudio::Opus,
            payload_type: 111,
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![],
        };

        let serialized = serde_json::to_value(&codec).unwrap();
        assert_eq!(serialized["mimeType"], "audio/opus");
        assert_eq!(serialized["payloadType"], 111);
        assert_eq!(serialized["parameters"]["useinbandfec"], 1);

        let deserialized = serde_json::from_value::<RtpCodecParameters>(serialized).unwrap();
        assert_eq!(deserialized, codec);
    }

    #[test]
    fn codec_without_channels_defaults_to_one() {
        let deserialized = serde_json::from_str::<RtpCodecParameters>(
            r#"{"mimeType":"audio/PCMU","payloadType":0,"clockRate":8000}"#,
        )
        .unwrap();
        assert_eq!(deserialized.channels(), NonZeroU8::new(1));
    }
}
