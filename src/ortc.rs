//! Capability negotiation and RTP parameter derivation.
//!
//! This module owns the codec matching rules, the dynamic payload-type allocator and the
//! derivation chain producer parameters -> consumable parameters -> consumer parameters that
//! every produce/consume call goes through. Structural validation of capabilities and
//! parameters happens at the serde boundary (the typed model in [`crate::rtp_parameters`]
//! rejects malformed input and fills defaults); the functions here enforce the semantic rules
//! on top of it.

use crate::rtp_parameters::{
    MediaKind, MimeType, MimeTypeVideo, RtcpFeedback, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpCodecParametersParameters,
    RtpCodecParametersParametersValue, RtpEncodingParameters, RtpEncodingParametersRtx,
    RtpHeaderExtensionDirection, RtpHeaderExtensionParameters, RtpHeaderExtensionUri,
    RtpParameters,
};
use crate::scalability_modes::ScalabilityMode;
use crate::supported_rtp_capabilities;
use h264_profile_level_id::ProfileLevelId;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroU8};
use thiserror::Error;

/// First dynamic payload type handed out is 100; the 96..=99 range is only drawn from once
/// 100..=127 is exhausted.
const DYNAMIC_PAYLOAD_TYPES: [u8; 32] = [
    100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114, 115, 116, 117,
    118, 119, 120, 121, 122, 123, 124, 125, 126, 127, 96, 97, 98, 99,
];

/// Error caused by invalid RTP capabilities.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RtpCapabilitiesError {
    /// Media codec not supported.
    #[error("media codec not supported [mime_type:{mime_type:?}]")]
    UnsupportedCodec { mime_type: MimeType },
    /// Cannot allocate more dynamic codec payload types.
    #[error("cannot allocate more dynamic codec payload types")]
    CannotAllocate,
    /// Duplicated preferred payload type.
    #[error("duplicated codec.preferredPayloadType {0}")]
    DuplicatedPreferredPayloadType(u8),
}

/// Error caused by invalid or unsupported RTP parameters given to a produce operation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RtpParametersMappingError {
    /// Unsupported codec.
    #[error("unsupported codec [mime_type:{mime_type:?}, payload_type:{payload_type}]")]
    UnsupportedCodec {
        mime_type: MimeType,
        payload_type: u8,
    },
    /// No media codec found for RTX associated payload type.
    #[error("missing media codec found for RTX PT {payload_type}")]
    MissingMediaCodecForRtx { payload_type: u8 },
    /// No RTX codec for capability codec payload type.
    #[error("no RTX codec for capability codec PT {preferred_payload_type}")]
    UnsupportedRtxCodec { preferred_payload_type: u8 },
}

/// Error caused by RTP capabilities that cannot consume a producer.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConsumerRtpParametersError {
    /// The RTP capabilities do not match any codec of the producer.
    #[error("no compatible media codecs")]
    NoCompatibleMediaCodecs,
}

/// Mapping of codec payload types and encoding SSRCs between a producer's RTP parameters and
/// the values used internally by the router.
#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpMapping {
    pub(crate) codecs: Vec<RtpMappingCodec>,
    pub(crate) encodings: Vec<RtpMappingEncoding>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpMappingCodec {
    pub(crate) payload_type: u8,
    pub(crate) mapped_payload_type: u8,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpMappingEncoding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) scalability_mode: Option<String>,
    pub(crate) mapped_ssrc: u32,
}

/// Generate RTP capabilities for a router based on the given media codecs and the worker
/// supported RTP capabilities.
pub(crate) fn generate_router_rtp_capabilities(
    media_codecs: Vec<RtpCodecCapability>,
) -> Result<RtpCapabilities, RtpCapabilitiesError> {
    let supported_rtp_capabilities =
        supported_rtp_capabilities::get_supported_rtp_capabilities();

    let mut dynamic_payload_types = DYNAMIC_PAYLOAD_TYPES.to_vec();
    let mut caps = RtpCapabilities {
        codecs: vec![],
        header_extensions: supported_rtp_capabilities.header_extensions,
    };

    for media_codec in media_codecs {
        let matched_supported_codec = supported_rtp_capabilities
            .codecs
            .iter()
            .find(|supported_codec| {
                match_codecs(
                    CodecToMatch::from(&media_codec),
                    CodecToMatch::from(*supported_codec),
                    false,
                )
            })
            .ok_or(RtpCapabilitiesError::UnsupportedCodec {
                mime_type: media_codec.mime_type(),
            })?;

        let mut codec = matched_supported_codec.clone();

        // If the given media codec has a preferred payload type, keep it, removing it from the
        // dynamic pool; otherwise use the supported codec's static one if set, else draw from
        // the pool.
        if let Some(preferred_payload_type) = media_codec.preferred_payload_type() {
            codec.set_preferred_payload_type(preferred_payload_type);

            if let Some(index) = dynamic_payload_types
                .iter()
                .position(|&pt| pt == preferred_payload_type)
            {
                dynamic_payload_types.remove(index);
            }
        } else if codec.preferred_payload_type().is_none() {
            if dynamic_payload_types.is_empty() {
                return Err(RtpCapabilitiesError::CannotAllocate);
            }
            let pt = dynamic_payload_types.remove(0);
            codec.set_preferred_payload_type(pt);
        }

        let preferred_payload_type = codec.preferred_payload_type().unwrap();
        if caps
            .codecs
            .iter()
            .any(|c| c.preferred_payload_type() == Some(preferred_payload_type))
        {
            return Err(RtpCapabilitiesError::DuplicatedPreferredPayloadType(
                preferred_payload_type,
            ));
        }

        // Merge the given parameters over the supported codec defaults.
        for (key, value) in media_codec.parameters().iter() {
            codec.parameters_mut().insert(key.clone(), value.clone());
        }

        let is_video = codec.kind() == MediaKind::Video;
        let clock_rate = codec.clock_rate();

        caps.codecs.push(codec);

        // Add a RTX companion codec for every video codec.
        if is_video {
            if dynamic_payload_types.is_empty() {
                return Err(RtpCapabilitiesError::CannotAllocate);
            }
            let pt = dynamic_payload_types.remove(0);

            caps.codecs.push(RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Rtx,
                preferred_payload_type: Some(pt),
                clock_rate,
                parameters: RtpCodecParametersParameters::from([(
                    "apt",
                    u32::from(preferred_payload_type).into(),
                )]),
                rtcp_feedback: vec![],
            });
        }
    }

    Ok(caps)
}

/// Get a mapping of codec payload types and encodings of the given producer RTP parameters as
/// values expected by the router.
///
/// For H264 under strict matching the answer `profile-level-id` is written back into the
/// producer codec parameters, which is why the parameters are taken mutably.
pub(crate) fn get_producer_rtp_parameters_mapping(
    rtp_parameters: &mut RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> Result<RtpMapping, RtpParametersMappingError> {
    let mut rtp_mapping = RtpMapping::default();

    // Index of producer codec -> matched capability codec.
    let mut codec_to_cap_codec = HashMap::<usize, &RtpCodecCapability>::new();

    // Match parameters media codecs to capabilities media codecs.
    for (index, codec) in rtp_parameters.codecs.iter_mut().enumerate() {
        if codec.is_rtx() {
            continue;
        }

        let matched_cap_codec = rtp_capabilities
            .codecs
            .iter()
            .find(|cap_codec| {
                match_codecs(
                    CodecToMatch::from(&*codec),
                    CodecToMatch::from(*cap_codec),
                    true,
                )
            })
            .ok_or(RtpParametersMappingError::UnsupportedCodec {
                mime_type: codec.mime_type(),
                payload_type: codec.payload_type(),
            })?;

        if let MimeType::Video(MimeTypeVideo::H264) = codec.mime_type() {
            apply_h264_answer(codec, matched_cap_codec);
        }

        codec_to_cap_codec.insert(index, matched_cap_codec);
    }

    // Match parameters RTX codecs to capabilities RTX codecs.
    let codecs = rtp_parameters.codecs.clone();
    for (index, codec) in codecs.iter().enumerate() {
        if !codec.is_rtx() {
            continue;
        }

        let apt = parameter_u32(codec.parameters(), "apt");

        // Search for the associated media codec.
        let associated_media_codec_index = codecs
            .iter()
            .position(|media_codec| {
                !media_codec.is_rtx() && u32::from(media_codec.payload_type()) == apt
            })
            .ok_or(RtpParametersMappingError::MissingMediaCodecForRtx {
                payload_type: codec.payload_type(),
            })?;

        let cap_media_codec = codec_to_cap_codec
            .get(&associated_media_codec_index)
            .ok_or(RtpParametersMappingError::MissingMediaCodecForRtx {
                payload_type: codec.payload_type(),
            })?;
        let cap_media_codec_pt = cap_media_codec.preferred_payload_type().unwrap();

        // Ensure that the capabilities media codec has a RTX codec.
        let associated_cap_rtx_codec = rtp_capabilities
            .codecs
            .iter()
            .find(|cap_codec| {
                cap_codec.is_rtx()
                    && parameter_u32(cap_codec.parameters(), "apt")
                        == u32::from(cap_media_codec_pt)
            })
            .ok_or(RtpParametersMappingError::UnsupportedRtxCodec {
                preferred_payload_type: cap_media_codec_pt,
            })?;

        codec_to_cap_codec.insert(index, associated_cap_rtx_codec);
    }

    // Generate codecs mapping.
    let mut mapped_indices = codec_to_cap_codec.into_iter().collect::<Vec<_>>();
    mapped_indices.sort_by_key(|(index, _)| *index);
    for (index, cap_codec) in mapped_indices {
        rtp_mapping.codecs.push(RtpMappingCodec {
            payload_type: rtp_parameters.codecs[index].payload_type(),
            mapped_payload_type: cap_codec.preferred_payload_type().unwrap(),
        });
    }

    // Generate encodings mapping.
    let mut mapped_ssrc = generate_ssrc();
    for encoding in &rtp_parameters.encodings {
        rtp_mapping.encodings.push(RtpMappingEncoding {
            ssrc: encoding.ssrc,
            rid: encoding.rid.clone(),
            scalability_mode: encoding.scalability_mode.clone(),
            mapped_ssrc,
        });
        mapped_ssrc = mapped_ssrc.wrapping_add(1);
    }

    Ok(rtp_mapping)
}

/// Generate RTP parameters to be internally used by consumers given the RTP parameters of a
/// producer and the RTP capabilities of the router.
pub(crate) fn get_consumable_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
    rtp_mapping: &RtpMapping,
) -> RtpParameters {
    let mut consumable_params = RtpParameters::default();

    for codec in &rtp_parameters.codecs {
        if codec.is_rtx() {
            continue;
        }

        let consumable_codec_pt = rtp_mapping
            .codecs
            .iter()
            .find(|entry| entry.payload_type == codec.payload_type())
            .map(|entry| entry.mapped_payload_type);
        let consumable_codec_pt = match consumable_codec_pt {
            Some(pt) => pt,
            None => continue,
        };

        let matched_cap_codec = rtp_capabilities
            .codecs
            .iter()
            .find(|cap_codec| cap_codec.preferred_payload_type() == Some(consumable_codec_pt));
        let matched_cap_codec = match matched_cap_codec {
            Some(cap_codec) => cap_codec,
            None => continue,
        };

        // Keep the producer codec parameters, take everything else from the capability codec.
        consumable_params.codecs.push(capability_to_parameters(
            matched_cap_codec,
            Some(codec.parameters().clone()),
        ));

        let consumable_cap_rtx_codec = rtp_capabilities.codecs.iter().find(|cap_rtx_codec| {
            cap_rtx_codec.is_rtx()
                && parameter_u32(cap_rtx_codec.parameters(), "apt")
                    == u32::from(consumable_codec_pt)
        });

        if let Some(consumable_cap_rtx_codec) = consumable_cap_rtx_codec {
            consumable_params
                .codecs
                .push(capability_to_parameters(consumable_cap_rtx_codec, None));
        }
    }

    // Just take RTP header extensions that can be used in consumers.
    for cap_ext in &rtp_capabilities.header_extensions {
        if cap_ext.kind != Some(kind)
            || !matches!(
                cap_ext.direction,
                RtpHeaderExtensionDirection::SendRecv | RtpHeaderExtensionDirection::SendOnly,
            )
        {
            continue;
        }

        consumable_params
            .header_extensions
            .push(RtpHeaderExtensionParameters {
                uri: cap_ext.uri,
                id: cap_ext.preferred_id,
                encrypt: cap_ext.preferred_encrypt,
                parameters: RtpCodecParametersParameters::default(),
            });
    }

    for (index, encoding) in rtp_parameters.encodings.iter().enumerate() {
        let mut consumable_encoding = encoding.clone();
        consumable_encoding.rid = None;
        consumable_encoding.rtx = None;
        consumable_encoding.codec_payload_type = None;
        consumable_encoding.ssrc = rtp_mapping
            .encodings
            .get(index)
            .map(|mapped_encoding| mapped_encoding.mapped_ssrc);

        consumable_params.encodings.push(consumable_encoding);
    }

    consumable_params.rtcp = RtcpParameters {
        cname: rtp_parameters.rtcp.cname.clone(),
        reduced_size: true,
        mux: Some(true),
    };

    consumable_params
}

/// Check whether the given RTP capabilities can consume the given producer (through its
/// consumable RTP parameters).
pub(crate) fn can_consume(
    consumable_params: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> bool {
    let mut matching_codecs = Vec::<&RtpCodecParameters>::new();

    for codec in &consumable_params.codecs {
        let matched = rtp_capabilities.codecs.iter().any(|cap_codec| {
            match_codecs(
                CodecToMatch::from(cap_codec),
                CodecToMatch::from(codec),
                true,
            )
        });
        if matched {
            matching_codecs.push(codec);
        }
    }

    // Ensure there is at least one media codec.
    match matching_codecs.first() {
        Some(codec) => !codec.is_rtx(),
        None => false,
    }
}

/// Generate RTP parameters for a specific consumer.
///
/// It reduces encodings to just one and takes into account given RTP capabilities to reduce
/// codecs, codecs' RTCP feedback and header extensions, and also enables or disables RTX.
pub(crate) fn get_consumer_rtp_parameters(
    consumable_params: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> Result<RtpParameters, ConsumerRtpParametersError> {
    let mut consumer_params = RtpParameters {
        rtcp: consumable_params.rtcp.clone(),
        ..RtpParameters::default()
    };

    let mut rtx_supported = false;

    for codec in &consumable_params.codecs {
        let matched_cap_codec = rtp_capabilities.codecs.iter().find(|cap_codec| {
            match_codecs(
                CodecToMatch::from(*cap_codec),
                CodecToMatch::from(codec),
                true,
            )
        });

        let matched_cap_codec = match matched_cap_codec {
            Some(cap_codec) => cap_codec,
            None => continue,
        };

        let mut codec = codec.clone();
        *codec.rtcp_feedback_mut() = matched_cap_codec.rtcp_feedback().clone();

        if !rtx_supported && codec.is_rtx() {
            rtx_supported = true;
        }

        consumer_params.codecs.push(codec);
    }

    // Ensure there is at least one media codec.
    match consumer_params.codecs.first() {
        Some(codec) if !codec.is_rtx() => {}
        _ => {
            return Err(ConsumerRtpParametersError::NoCompatibleMediaCodecs);
        }
    }

    consumer_params.header_extensions = consumable_params
        .header_extensions
        .iter()
        .filter(|ext| {
            rtp_capabilities
                .header_extensions
                .iter()
                .any(|cap_ext| cap_ext.preferred_id == ext.id && cap_ext.uri == ext.uri)
        })
        .cloned()
        .collect();

    // Reduce codecs' RTCP feedback. Use Transport-CC if available, REMB otherwise.
    let has_transport_cc = consumer_params
        .header_extensions
        .iter()
        .any(|ext| ext.uri == RtpHeaderExtensionUri::TransportWideCcDraft01);
    let has_abs_send_time = consumer_params
        .header_extensions
        .iter()
        .any(|ext| ext.uri == RtpHeaderExtensionUri::AbsSendTime);
    for codec in &mut consumer_params.codecs {
        codec.rtcp_feedback_mut().retain(|fb| {
            if has_transport_cc {
                fb != &RtcpFeedback::GoogRemb
            } else if has_abs_send_time {
                fb != &RtcpFeedback::TransportCc
            } else {
                fb != &RtcpFeedback::TransportCc && fb != &RtcpFeedback::GoogRemb
            }
        });
    }

    let mut consumer_encoding = RtpEncodingParameters {
        ssrc: Some(generate_ssrc()),
        ..RtpEncodingParameters::default()
    };

    if rtx_supported {
        consumer_encoding.rtx = Some(RtpEncodingParametersRtx {
            ssrc: generate_ssrc(),
        });
    }

    // If any of the consumable encodings has scalability mode, process it (all encodings are
    // assumed to carry the same value).
    let mut scalability_mode = consumable_params
        .encodings
        .iter()
        .find_map(|encoding| encoding.scalability_mode.clone());

    // If there is simulcast, mangle spatial layers in scalability mode.
    if consumable_params.encodings.len() > 1 {
        let temporal_layers = parse_scalability_mode(scalability_mode.as_deref())
            .temporal_layers;

        scalability_mode = Some(format!(
            "S{}T{}",
            consumable_params.encodings.len(),
            temporal_layers,
        ));
    }

    consumer_encoding.scalability_mode = scalability_mode;

    // Use the maximum max_bitrate in any encoding and honor it in the consumer's encoding.
    let max_encoding_max_bitrate = consumable_params
        .encodings
        .iter()
        .filter_map(|encoding| encoding.max_bitrate)
        .max();

    consumer_encoding.max_bitrate = max_encoding_max_bitrate;

    // Set a single encoding for the consumer.
    consumer_params.encodings.push(consumer_encoding);

    Ok(consumer_params)
}

/// Generate RTP parameters for a pipe consumer.
///
/// It keeps all original consumable encodings and removes support for BWE. If `enable_rtx` is
/// false, it also removes RTX and NACK support.
pub(crate) fn get_pipe_consumer_rtp_parameters(
    consumable_params: &RtpParameters,
    enable_rtx: bool,
) -> RtpParameters {
    let mut consumer_params = RtpParameters {
        rtcp: consumable_params.rtcp.clone(),
        ..RtpParameters::default()
    };

    for codec in &consumable_params.codecs {
        if !enable_rtx && codec.is_rtx() {
            continue;
        }

        let mut codec = codec.clone();
        codec.rtcp_feedback_mut().retain(|fb| {
            fb == &RtcpFeedback::NackPli
                || fb == &RtcpFeedback::CcmFir
                || (enable_rtx && fb == &RtcpFeedback::Nack)
        });

        consumer_params.codecs.push(codec);
    }

    // Reduce RTP extensions by disabling transport MID and BWE related ones.
    consumer_params.header_extensions = consumable_params
        .header_extensions
        .iter()
        .filter(|ext| {
            !matches!(
                ext.uri,
                RtpHeaderExtensionUri::Mid
                    | RtpHeaderExtensionUri::AbsSendTime
                    | RtpHeaderExtensionUri::TransportWideCcDraft01,
            )
        })
        .cloned()
        .collect();

    for encoding in &consumable_params.encodings {
        let mut encoding = encoding.clone();
        if !enable_rtx {
            encoding.rtx = None;
        }

        consumer_params.encodings.push(encoding);
    }

    consumer_params
}

/// Parse a scalability mode string, falling back to a single spatial/temporal layer on miss.
pub(crate) fn parse_scalability_mode(scalability_mode: Option<&str>) -> ScalabilityMode {
    match scalability_mode {
        Some(scalability_mode) => scalability_mode.parse().unwrap_or_else(|_| {
            warn!(
                "parse_scalability_mode() | invalid scalability mode \"{}\"",
                scalability_mode,
            );
            ScalabilityMode::default()
        }),
        None => ScalabilityMode::default(),
    }
}

fn generate_ssrc() -> u32 {
    fastrand::u32(100_000_000..999_999_999)
}

fn capability_to_parameters(
    cap_codec: &RtpCodecCapability,
    parameters: Option<RtpCodecParametersParameters>,
) -> RtpCodecParameters {
    let payload_type = cap_codec.preferred_payload_type().unwrap();
    match cap_codec {
        RtpCodecCapability::Audio {
            mime_type,
            clock_rate,
            channels,
            parameters: cap_parameters,
            rtcp_feedback,
            ..
        } => RtpCodecParameters::Audio {
            mime_type: *mime_type,
            payload_type,
            clock_rate: *clock_rate,
            channels: *channels,
            parameters: parameters.unwrap_or_else(|| cap_parameters.clone()),
            rtcp_feedback: rtcp_feedback.clone(),
        },
        RtpCodecCapability::Video {
            mime_type,
            clock_rate,
            parameters: cap_parameters,
            rtcp_feedback,
            ..
        } => RtpCodecParameters::Video {
            mime_type: *mime_type,
            payload_type,
            clock_rate: *clock_rate,
            parameters: parameters.unwrap_or_else(|| cap_parameters.clone()),
            rtcp_feedback: rtcp_feedback.clone(),
        },
    }
}

fn parameter_u32(parameters: &RtpCodecParametersParameters, key: &str) -> u32 {
    match parameters.get(key) {
        Some(RtpCodecParametersParametersValue::Number(number)) => *number,
        _ => 0,
    }
}

/// Uniform view over capability and parameters codecs for matching purposes.
#[derive(Copy, Clone)]
struct CodecToMatch<'a> {
    mime_type: MimeType,
    clock_rate: NonZeroU32,
    channels: Option<NonZeroU8>,
    parameters: &'a RtpCodecParametersParameters,
}

impl<'a> From<&'a RtpCodecCapability> for CodecToMatch<'a> {
    fn from(codec: &'a RtpCodecCapability) -> Self {
        Self {
            mime_type: codec.mime_type(),
            clock_rate: codec.clock_rate(),
            channels: codec.channels(),
            parameters: codec.parameters(),
        }
    }
}

impl<'a> From<&'a RtpCodecParameters> for CodecToMatch<'a> {
    fn from(codec: &'a RtpCodecParameters) -> Self {
        Self {
            mime_type: codec.mime_type(),
            clock_rate: codec.clock_rate(),
            channels: codec.channels(),
            parameters: codec.parameters(),
        }
    }
}

fn match_codecs(codec_a: CodecToMatch<'_>, codec_b: CodecToMatch<'_>, strict: bool) -> bool {
    if codec_a.mime_type != codec_b.mime_type {
        return false;
    }

    if codec_a.clock_rate != codec_b.clock_rate {
        return false;
    }

    if codec_a.channels != codec_b.channels {
        return false;
    }

    // Per codec special checks.
    match codec_a.mime_type {
        MimeType::Video(MimeTypeVideo::H264) => {
            let packetization_mode_a = parameter_u32(codec_a.parameters, "packetization-mode");
            let packetization_mode_b = parameter_u32(codec_b.parameters, "packetization-mode");

            if packetization_mode_a != packetization_mode_b {
                return false;
            }

            // If strict matching, check profile-level-id.
            if strict && h264_answer(codec_a.parameters, codec_b.parameters).is_err() {
                return false;
            }
        }
        MimeType::Video(MimeTypeVideo::Vp9) => {
            // If strict matching, check profile-id.
            if strict {
                let profile_id_a = parameter_u32(codec_a.parameters, "profile-id");
                let profile_id_b = parameter_u32(codec_b.parameters, "profile-id");

                if profile_id_a != profile_id_b {
                    return false;
                }
            }
        }
        _ => {}
    }

    true
}

fn h264_profile_level_id_str(parameters: &RtpCodecParametersParameters) -> Option<&str> {
    match parameters.get("profile-level-id") {
        Some(RtpCodecParametersParametersValue::String(string)) => Some(string.as_str()),
        _ => None,
    }
}

fn h264_level_asymmetry_allowed(parameters: &RtpCodecParametersParameters) -> bool {
    matches!(
        parameters.get("level-asymmetry-allowed"),
        Some(RtpCodecParametersParametersValue::Number(1)),
    )
}

struct H264AnswerError;

/// Negotiate the H264 `profile-level-id` between a producer codec and a capability codec.
/// `Ok(None)` means neither side supplied one and the parameter must stay absent; `Err` means
/// the profiles are incompatible and the codecs don't match.
fn h264_answer(
    local_parameters: &RtpCodecParametersParameters,
    remote_parameters: &RtpCodecParametersParameters,
) -> Result<Option<String>, H264AnswerError> {
    let local_str = h264_profile_level_id_str(local_parameters);
    let remote_str = h264_profile_level_id_str(remote_parameters);

    if h264_profile_level_id::is_same_profile(local_str, remote_str).is_none() {
        return Err(H264AnswerError);
    }

    if local_str.is_none() && remote_str.is_none() {
        return Ok(None);
    }

    // A missing side counts as the default profile for level negotiation.
    let local = match local_str {
        Some(string) => Some(string.parse::<ProfileLevelId>().map_err(|_| H264AnswerError)?),
        None => Some(ProfileLevelId::default()),
    };
    let remote = match remote_str {
        Some(string) => Some(string.parse::<ProfileLevelId>().map_err(|_| H264AnswerError)?),
        None => Some(ProfileLevelId::default()),
    };

    h264_profile_level_id::generate_profile_level_id_for_answer(
        local,
        h264_level_asymmetry_allowed(local_parameters),
        remote,
        h264_level_asymmetry_allowed(remote_parameters),
    )
    .map(|profile_level_id| Some(profile_level_id.to_string()))
    .map_err(|_| H264AnswerError)
}

/// Write the negotiated H264 `profile-level-id` into the producer codec parameters (the
/// `modify` side of strict codec matching).
fn apply_h264_answer(codec: &mut RtpCodecParameters, cap_codec: &RtpCodecCapability) {
    if let Ok(selected_profile_level_id) =
        h264_answer(codec.parameters(), cap_codec.parameters())
    {
        match selected_profile_level_id {
            Some(profile_level_id) => {
                codec
                    .parameters_mut()
                    .insert("profile-level-id", profile_level_id);
            }
            None => {
                codec.parameters_mut().remove("profile-level-id");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp_parameters::{MimeTypeAudio, RtpHeaderExtension};

    #[test]
    fn h264_answer_negotiation() {
        let mut local = RtpCodecParametersParameters::default();
        local.insert("profile-level-id", "42e01f");
        let mut remote = RtpCodecParametersParameters::default();
        remote.insert("profile-level-id", "42e00b");

        // Without level asymmetry the answer level is the minimum of both.
        match h264_answer(&local, &remote) {
            Ok(Some(answer)) => assert_eq!(answer, "42e00b"),
            _ => panic!("expected an answer"),
        }

        // With level asymmetry allowed on both sides the local level wins.
        local.insert("level-asymmetry-allowed", 1_u32);
        remote.insert("level-asymmetry-allowed", 1_u32);
        match h264_answer(&local, &remote) {
            Ok(Some(answer)) => assert_eq!(answer, "42e01f"),
            _ => panic!("expected an answer"),
        }

        // Different profiles don't match.
        let mut main_profile = RtpCodecParametersParameters::default();
        main_profile.insert("profile-level-id", "4d0032");
        assert!(h264_answer(&local, &main_profile).is_err());

        // Neither side naming a profile leaves the parameter absent.
        assert!(matches!(
            h264_answer(
                &RtpCodecParametersParameters::default(),
                &RtpCodecParametersParameters::default(),
            ),
            Ok(None),
        ));
    }

    fn media_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            },
        ]
    }

    fn audio_producer_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters::Audio {
                mime_type: MimeTypeAudio::Opus,
                payload_type: 111,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                max_bitrate: Some(100_000),
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("producer-cname".to_string()),
                ..RtcpParameters::default()
            },
        }
    }

    #[test]
    fn router_capabilities_have_dynamic_payload_types_and_rtx() {
        let caps = generate_router_rtp_capabilities(media_codecs()).unwrap();

        // Opus, VP8 and the VP8 RTX companion.
        assert_eq!(caps.codecs.len(), 3);

        let opus_pt = caps.codecs[0].preferred_payload_type().unwrap();
        assert!((100..=127).contains(&opus_pt) || (96..=99).contains(&opus_pt));

        let vp8 = &caps.codecs[1];
        assert_eq!(vp8.mime_type(), MimeType::Video(MimeTypeVideo::Vp8));
        let vp8_pt = vp8.preferred_payload_type().unwrap();

        let rtx = &caps.codecs[2];
        assert_eq!(rtx.mime_type(), MimeType::Video(MimeTypeVideo::Rtx));
        assert_eq!(parameter_u32(rtx.parameters(), "apt"), u32::from(vp8_pt));

        // Every given media codec must non-strictly match some generated codec.
        for media_codec in media_codecs() {
            assert!(caps.codecs.iter().any(|codec| {
                match_codecs(
                    CodecToMatch::from(&media_codec),
                    CodecToMatch::from(codec),
                    false,
                )
            }));
        }
    }

    #[test]
    fn duplicated_preferred_payload_type_is_rejected() {
        let media_codecs = vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(100),
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Pcmu,
                preferred_payload_type: Some(100),
                clock_rate: NonZeroU32::new(8000).unwrap(),
                channels: NonZeroU8::new(1).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            },
        ];

        assert_eq!(
            generate_router_rtp_capabilities(media_codecs),
            Err(RtpCapabilitiesError::DuplicatedPreferredPayloadType(100)),
        );
    }

    #[test]
    fn producer_mapping_round_trip() {
        let caps = generate_router_rtp_capabilities(media_codecs()).unwrap();
        let mut producer_params = audio_producer_parameters();

        let mapping =
            get_producer_rtp_parameters_mapping(&mut producer_params, &caps).unwrap();

        assert_eq!(mapping.codecs.len(), 1);
        assert_eq!(mapping.codecs[0].payload_type, 111);
        assert_eq!(mapping.encodings.len(), 1);
        assert_eq!(mapping.encodings[0].ssrc, Some(1111));

        let consumable_params = get_consumable_rtp_parameters(
            MediaKind::Audio,
            &producer_params,
            &caps,
            &mapping,
        );

        // The payload types of the consumable parameters are exactly the mapped ones.
        let consumable_pts = consumable_params
            .codecs
            .iter()
            .map(|codec| codec.payload_type())
            .collect::<Vec<_>>();
        let mapped_pts = mapping
            .codecs
            .iter()
            .map(|entry| entry.mapped_payload_type)
            .collect::<Vec<_>>();
        assert_eq!(consumable_pts, mapped_pts);

        assert_eq!(
            consumable_params.encodings[0].ssrc,
            Some(mapping.encodings[0].mapped_ssrc),
        );
        assert_eq!(
            consumable_params.rtcp.cname,
            Some("producer-cname".to_string()),
        );
        assert_eq!(consumable_params.rtcp.mux, Some(true));
    }

    #[test]
    fn unsupported_producer_codec_is_rejected() {
        let caps = generate_router_rtp_capabilities(media_codecs()).unwrap();
        let mut producer_params = RtpParameters {
            codecs: vec![RtpCodecParameters::Audio {
                mime_type: MimeTypeAudio::Isac,
                payload_type: 103,
                clock_rate: NonZeroU32::new(16000).unwrap(),
                channels: NonZeroU8::new(1).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            }],
            ..RtpParameters::default()
        };

        assert!(matches!(
            get_producer_rtp_parameters_mapping(&mut producer_params, &caps),
            Err(RtpParametersMappingError::UnsupportedCodec { .. }),
        ));
    }

    #[test]
    fn consumer_parameters_use_router_preferred_payload_types() {
        let caps = generate_router_rtp_capabilities(media_codecs()).unwrap();
        let mut producer_params = audio_producer_parameters();
        let mapping =
            get_producer_rtp_parameters_mapping(&mut producer_params, &caps).unwrap();
        let consumable_params = get_consumable_rtp_parameters(
            MediaKind::Audio,
            &producer_params,
            &caps,
            &mapping,
        );

        // A consuming endpoint advertising opus with its own preferred payload type.
        let endpoint_caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(100),
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
        };

        assert!(can_consume(&consumable_params, &endpoint_caps));

        let consumer_params =
            get_consumer_rtp_parameters(&consumable_params, &endpoint_caps).unwrap();

        // Consumable payload types are the router's, not the producer's original 111.
        assert!(!consumer_params.codecs.is_empty());
        assert!(!consumer_params.codecs[0].is_rtx());
        assert_eq!(
            consumer_params.codecs[0].payload_type(),
            consumable_params.codecs[0].payload_type(),
        );
        assert_eq!(consumer_params.encodings.len(), 1);
        assert!(consumer_params.encodings[0].ssrc.is_some());
        assert_eq!(consumer_params.encodings[0].max_bitrate, Some(100_000));
    }

    #[test]
    fn can_consume_is_false_for_foreign_capabilities() {
        let caps = generate_router_rtp_capabilities(media_codecs()).unwrap();
        let mut producer_params = audio_producer_parameters();
        let mapping =
            get_producer_rtp_parameters_mapping(&mut producer_params, &caps).unwrap();
        let consumable_params = get_consumable_rtp_parameters(
            MediaKind::Audio,
            &producer_params,
            &caps,
            &mapping,
        );

        let foreign_caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Pcmu,
                preferred_payload_type: Some(0),
                clock_rate: NonZeroU32::new(8000).unwrap(),
                channels: NonZeroU8::new(1).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
        };

        assert!(!can_consume(&consumable_params, &foreign_caps));
        assert_eq!(
            get_consumer_rtp_parameters(&consumable_params, &foreign_caps),
            Err(ConsumerRtpParametersError::NoCompatibleMediaCodecs),
        );
    }

    #[test]
    fn simulcast_consumer_scalability_mode_is_rewritten() {
        let caps = generate_router_rtp_capabilities(media_codecs()).unwrap();
        let mut producer_params = RtpParameters {
            codecs: vec![RtpCodecParameters::Video {
                mime_type: MimeTypeVideo::Vp8,
                payload_type: 96,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            }],
            encodings: vec![
                RtpEncodingParameters {
                    ssrc: Some(1000),
                    scalability_mode: Some("L1T3".to_string()),
                    ..RtpEncodingParameters::default()
                },
                RtpEncodingParameters {
                    ssrc: Some(1001),
                    scalability_mode: Some("L1T3".to_string()),
                    ..RtpEncodingParameters::default()
                },
                RtpEncodingParameters {
                    ssrc: Some(1002),
                    scalability_mode: Some("L1T3".to_string()),
                    ..RtpEncodingParameters::default()
                },
            ],
            rtcp: RtcpParameters {
                cname: Some("simulcast-cname".to_string()),
                ..RtcpParameters::default()
            },
            ..RtpParameters::default()
        };

        let mapping =
            get_producer_rtp_parameters_mapping(&mut producer_params, &caps).unwrap();
        let consumable_params = get_consumable_rtp_parameters(
            MediaKind::Video,
            &producer_params,
            &caps,
            &mapping,
        );

        assert_eq!(consumable_params.encodings.len(), 3);

        let endpoint_caps = generate_router_rtp_capabilities(media_codecs()).unwrap();
        let consumer_params =
            get_consumer_rtp_parameters(&consumable_params, &endpoint_caps).unwrap();

        assert_eq!(consumer_params.encodings.len(), 1);
        assert_eq!(
            consumer_params.encodings[0].scalability_mode,
            Some("S3T3".to_string()),
        );
        // RTX is supported by the router-generated capabilities.
        assert!(consumer_params.encodings[0].rtx.is_some());
    }

    #[test]
    fn pipe_consumer_parameters_keep_encodings() {
        let caps = generate_router_rtp_capabilities(media_codecs()).unwrap();
        let mut producer_params = RtpParameters {
            codecs: vec![RtpCodecParameters::Video {
                mime_type: MimeTypeVideo::Vp8,
                payload_type: 96,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            }],
            encodings: vec![
                RtpEncodingParameters {
                    ssrc: Some(2000),
                    ..RtpEncodingParameters::default()
                },
                RtpEncodingParameters {
                    ssrc: Some(2001),
                    ..RtpEncodingParameters::default()
                },
            ],
            rtcp: RtcpParameters {
                cname: Some("pipe-cname".to_string()),
                ..RtcpParameters::default()
            },
            ..RtpParameters::default()
        };

        let mapping =
            get_producer_rtp_parameters_mapping(&mut producer_params, &caps).unwrap();
        let consumable_params = get_consumable_rtp_parameters(
            MediaKind::Video,
            &producer_params,
            &caps,
            &mapping,
        );

        let pipe_params = get_pipe_consumer_rtp_parameters(&consumable_params, false);

        // Simulcast layers survive the pipe; RTX codecs do not when disabled.
        assert_eq!(pipe_params.encodings.len(), 2);
        assert!(pipe_params.codecs.iter().all(|codec| !codec.is_rtx()));
        assert!(pipe_params
            .header_extensions
            .iter()
            .all(|ext| !matches!(
                ext.uri,
                RtpHeaderExtensionUri::Mid
                    | RtpHeaderExtensionUri::AbsSendTime
                    | RtpHeaderExtensionUri::TransportWideCcDraft01,
            )));
        // Only nack/pli and ccm/fir feedback survive without RTX.
        for codec in &pipe_params.codecs {
            for fb in codec.rtcp_feedback() {
                assert!(fb == &RtcpFeedback::NackPli || fb == &RtcpFeedback::CcmFir);
            }
        }
    }

    #[test]
    fn header_extensions_are_filtered_by_kind_and_direction() {
        let caps = generate_router_rtp_capabilities(media_codecs()).unwrap();
        let mut producer_params = audio_producer_parameters();
        let mapping =
            get_producer_rtp_parameters_mapping(&mut producer_params, &caps).unwrap();
        let consumable_params = get_consumable_rtp_parameters(
            MediaKind::Audio,
            &producer_params,
            &caps,
            &mapping,
        );

        for ext in &consumable_params.header_extensions {
            let cap_ext: Vec<&RtpHeaderExtension> = caps
                .header_extensions
                .iter()
                .filter(|cap_ext| cap_ext.uri == ext.uri && cap_ext.preferred_id == ext.id)
                .collect();
            assert!(!cap_ext.is_empty());
            for cap_ext in cap_ext {
                assert_ne!(cap_ext.kind, Some(MediaKind::Video));
            }
        }
    }
}
