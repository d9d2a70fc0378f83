//! SCTP association and stream parameters.

use serde::{Deserialize, Serialize};

/// Both OS and MIS are part of the SCTP INIT+ACK handshake. OS refers to the initial number of
/// outgoing SCTP streams that the server side transport creates (to be used by data consumers),
/// while MIS refers to the maximum number of incoming SCTP streams that the server side
/// transport can receive (to be used by data producers).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct NumSctpStreams {
    /// Initially requested number of outgoing SCTP streams.
    pub os: u16,
    /// Maximum number of incoming SCTP streams.
    pub mis: u16,
}

impl Default for NumSctpStreams {
    fn default() -> Self {
        Self {
            os: 1024,
            mis: 1024,
        }
    }
}

/// SCTP capabilities advertised by an endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpCapabilities {
    pub num_streams: NumSctpStreams,
}

/// Parameters of the SCTP association.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpParameters {
    /// Must always equal 5000.
    pub port: u16,
    /// Initially requested number of outgoing SCTP streams.
    #[serde(rename = "OS")]
    pub os: u16,
    /// Maximum number of incoming SCTP streams.
    #[serde(rename = "MIS")]
    pub mis: u16,
    /// Maximum allowed size for SCTP messages.
    pub max_message_size: u32,
}

/// SCTP stream parameters describing the reliability of a certain SCTP stream.
///
/// If `ordered` is true then `max_packet_life_time` and `max_retransmits` must be unset. If
/// unordered, at most one of them may be set.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpStreamParameters {
    /// SCTP stream id.
    pub(crate) stream_id: u16,
    /// Whether data messages must be received in order. If true the messages will be sent
    /// reliably. Default true.
    #[serde(default = "default_ordered")]
    pub(crate) ordered: bool,
    /// When `ordered` is false indicates the time (in milliseconds) after which a SCTP packet
    /// will stop being retransmitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) max_packet_life_time: Option<u16>,
    /// When `ordered` is false indicates the maximum number of times a packet will be
    /// retransmitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) max_retransmits: Option<u16>,
}

fn default_ordered() -> bool {
    true
}

impl SctpStreamParameters {
    /// Ordered reliable delivery.
    pub fn new_ordered(stream_id: u16) -> Self {
        Self {
            stream_id,
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
        }
    }

    /// Unordered delivery with a bounded packet lifetime.
    pub fn new_unordered_with_life_time(stream_id: u16, max_packet_life_time: u16) -> Self {
        Self {
            stream_id,
            ordered: false,
            max_packet_life_time: Some(max_packet_life_time),
            max_retransmits: None,
        }
    }

    /// Unordered delivery with a bounded number of retransmissions.
    pub fn new_unordered_with_retransmits(stream_id: u16, max_retransmits: u16) -> Self {
        Self {
            stream_id,
            ordered: false,
            max_packet_life_time: None,
            max_retransmits: Some(max_retransmits),
        }
    }

    /// SCTP stream id.
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Whether data messages must be received in order.
    pub fn ordered(&self) -> bool {
        self.ordered
    }

    /// Time (in milliseconds) after which a SCTP packet will stop being retransmitted.
    pub fn max_packet_life_time(&self) -> Option<u16> {
        self.max_packet_life_time
    }

    /// Maximum number of times a packet will be retransmitted.
    pub fn max_retransmits(&self) -> Option<u16> {
        self.max_retransmits
    }
}
