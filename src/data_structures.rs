//! Miscellaneous data structures.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;

/// Container for arbitrary data attached to switchboard entities.
#[derive(Debug, Clone)]
pub struct AppData(Arc<dyn Any + Send + Sync>);

impl Default for AppData {
    fn default() -> Self {
        Self::new(())
    }
}

impl Deref for AppData {
    type Target = Arc<dyn Any + Send + Sync>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AppData {
    pub fn new<T: Any + Send + Sync>(app_data: T) -> Self {
        Self(Arc::new(app_data))
    }
}

/// IP to listen on.
///
/// # Notes on usage
/// If you use "0.0.0.0" or "::" as ip value, then you need to also provide `announced_ip`.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportListenIp {
    /// Listening IPv4 or IPv6.
    pub ip: IpAddr,
    /// Announced IPv4 or IPv6 (useful when running the worker behind NAT with private IP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<IpAddr>,
}

/// ICE role.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IceRole {
    /// The transport is the controlled agent.
    Controlled,
    /// The transport is the controlling agent.
    Controlling,
}

/// ICE parameters.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    /// ICE username fragment.
    pub username_fragment: String,
    /// ICE password.
    pub password: String,
    /// ICE Lite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_lite: Option<bool>,
}

/// ICE candidate type (always `Host` for the worker's ICE Lite implementation).
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

/// ICE candidate TCP type (always `Passive`).
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateTcpType {
    Passive,
}

/// Transport protocol.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

/// ICE candidate.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Unique identifier that allows ICE to correlate candidates that appear on multiple
    /// transports.
    pub foundation: String,
    /// The assigned priority of the candidate.
    pub priority: u32,
    /// The IP address of the candidate.
    pub ip: IpAddr,
    /// The protocol of the candidate.
    pub protocol: TransportProtocol,
    /// The port for the candidate.
    pub port: u16,
    /// The type of candidate.
    pub r#type: IceCandidateType,
    /// The type of TCP candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<IceCandidateTcpType>,
}

/// ICE state.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IceState {
    /// No ICE Binding Requests have been received yet.
    New,
    /// Valid ICE Binding Request have been received, but none with USE-CANDIDATE attribute.
    /// Outgoing media is allowed.
    Connected,
    /// ICE Binding Request with USE_CANDIDATE attribute has been received. Media in both
    /// directions is now allowed.
    Completed,
    /// ICE was `Connected` or `Completed` but it has suddenly failed (this can just happen if
    /// the selected tuple has `Tcp` protocol).
    Disconnected,
    /// ICE state when the transport has been closed.
    Closed,
}

/// Tuple of local IP/port/protocol + optional remote IP/port.
///
/// # Notes on usage
/// Both `remote_ip` and `remote_port` are unset until the media address of the remote endpoint
/// is known, which happens after calling `connect()` on `PlainTransport` and `PipeTransport`,
/// or via dynamic detection as it happens in `WebRtcTransport` (in which the remote media
/// address is detected by ICE means), or in `PlainTransport` when using `comedia` mode.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TransportTuple {
    #[serde(rename_all = "camelCase")]
    WithRemote {
        /// Local IP address.
        local_ip: IpAddr,
        /// Local port.
        local_port: u16,
        /// Remote IP address.
        remote_ip: IpAddr,
        /// Remote port.
        remote_port: u16,
        /// Protocol.
        protocol: TransportProtocol,
    },
    #[serde(rename_all = "camelCase")]
    LocalOnly {
        /// Local IP address.
        local_ip: IpAddr,
        /// Local port.
        local_port: u16,
        /// Protocol.
        protocol: TransportProtocol,
    },
}

impl TransportTuple {
    /// Local IP of the tuple.
    pub fn local_ip(&self) -> IpAddr {
        match self {
            Self::WithRemote { local_ip, .. } | Self::LocalOnly { local_ip, .. } => *local_ip,
        }
    }

    /// Local port of the tuple.
    pub fn local_port(&self) -> u16 {
        match self {
            Self::WithRemote { local_port, .. } | Self::LocalOnly { local_port, .. } => {
                *local_port
            }
        }
    }
}

/// DTLS state.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DtlsState {
    /// DTLS procedures not yet initiated.
    New,
    /// DTLS connecting.
    Connecting,
    /// DTLS successfully connected (SRTP keys already extracted).
    Connected,
    /// DTLS connection failed.
    Failed,
    /// DTLS state when the transport has been closed.
    Closed,
}

/// SCTP state.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SctpState {
    /// SCTP procedures not yet initiated.
    New,
    /// SCTP connecting.
    Connecting,
    /// SCTP successfully connected.
    Connected,
    /// SCTP connection failed.
    Failed,
    /// SCTP state when the transport has been closed.
    Closed,
}

/// DTLS role.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DtlsRole {
    /// The DTLS role is determined based on the resolved ICE role (the `Controlled` role acts
    /// as DTLS client, the `Controlling` role acts as DTLS server). Since the worker is an ICE
    /// Lite implementation it always behaves as ICE `Controlled`.
    Auto,
    /// DTLS client role.
    Client,
    /// DTLS server role.
    Server,
}

impl Default for DtlsRole {
    fn default() -> Self {
        Self::Auto
    }
}

/// Hash function algorithm as defined in the "Hash function Textual Names" registry
/// ([RFC 4572](https://tools.ietf.org/html/rfc4572#section-8)).
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum FingerprintAlgorithm {
    #[serde(rename = "sha-1")]
    Sha1,
    #[serde(rename = "sha-224")]
    Sha224,
    #[serde(rename = "sha-256")]
    Sha256,
    #[serde(rename = "sha-384")]
    Sha384,
    #[serde(rename = "sha-512")]
    Sha512,
}

/// Hash algorithm and its corresponding certificate fingerprint value (uppercase colon-separated
/// hex, as in SDP).
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct DtlsFingerprint {
    pub algorithm: FingerprintAlgorithm,
    pub value: String,
}

/// DTLS parameters.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct DtlsParameters {
    /// DTLS role.
    pub role: DtlsRole,
    /// DTLS fingerprints.
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Direction of a trace event.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDirection {
    In,
    Out,
}

/// Container used for sending/receiving messages using `DirectTransport` data producers and
/// data consumers.
///
/// SCTP PPID values (WebRTC datachannel establishment protocol):
///
/// | Value               | SCTP PPID |
/// |---------------------|-----------|
/// | WebRTC String       | 51        |
/// | WebRTC Binary       | 53        |
/// | WebRTC String Empty | 56        |
/// | WebRTC Binary Empty | 57        |
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WebRtcMessage {
    String(String),
    Binary(Bytes),
    EmptyString,
    EmptyBinary,
}

impl WebRtcMessage {
    pub(crate) fn new(ppid: u32, payload: Bytes) -> Option<Self> {
        match ppid {
            51 => Some(WebRtcMessage::String(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            53 => Some(WebRtcMessage::Binary(payload)),
            56 => Some(WebRtcMessage::EmptyString),
            57 => Some(WebRtcMessage::EmptyBinary),
            _ => None,
        }
    }

    // Empty payloads carry a single filler byte since SCTP does not support zero-length
    // messages; the PPID alone identifies them as empty.
    pub(crate) fn into_ppid_and_payload(self) -> (u32, Bytes) {
        match self {
            WebRtcMessage::String(string) => (51_u32, Bytes::from(string)),
            WebRtcMessage::Binary(binary) => (53_u32, binary),
            WebRtcMessage::EmptyString => (56_u32, Bytes::from_static(b" ")),
            WebRtcMessage::EmptyBinary => (57_u32, Bytes::from_static(&[0u8])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webrtc_message_ppid_round_trip() {
        let (ppid, payload) = WebRtcMessage::String("hello".to_string()).into_ppid_and_payload();
        assert_eq!(ppid, 51);
        assert_eq!(
            WebRtcMessage::new(ppid, payload),
            Some(WebRtcMessage::String("hello".to_string())),
        );

        let (ppid, payload) = WebRtcMessage::EmptyString.into_ppid_and_payload();
        assert_eq!(ppid, 56);
        assert_eq!(payload.len(), 1);

        let (ppid, payload) = WebRtcMessage::EmptyBinary.into_ppid_and_payload();
        assert_eq!(ppid, 57);
        assert_eq!(payload.len(), 1);

        assert_eq!(WebRtcMessage::new(52, Bytes::new()), None);
    }

    #[test]
    fn dtls_fingerprint_serde() {
        let fingerprint_str = r#"{"algorithm":"sha-256","value":"7A:27:46:F0"}"#;
        let fingerprint = serde_json::from_str::<DtlsFingerprint>(fingerprint_str).unwrap();
        assert_eq!(fingerprint.algorithm, FingerprintAlgorithm::Sha256);
        assert_eq!(
            serde_json::to_string(&fingerprint).unwrap(),
            fingerprint_str,
        );
    }
}
