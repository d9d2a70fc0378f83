//! Typed catalog of the request/response and payload-notification protocol spoken with the
//! worker.
//!
//! A request on the wire is `{id, method, handlerId?, data?}` where `handlerId` is the id of
//! the deepest worker-side object the method operates on; the structs here are the `data`
//! payloads. Responses are either `{id, accepted, data?}` or `{id, rejected, reason}`.

use crate::consumer::{
    ConsumerDump, ConsumerId, ConsumerLayers, ConsumerScore, ConsumerStats,
    ConsumerTraceEventType, ConsumerType,
};
use crate::data_consumer::{DataConsumerDump, DataConsumerId, DataConsumerStat, DataConsumerType};
use crate::data_producer::{DataProducerDump, DataProducerId, DataProducerStat, DataProducerType};
use crate::data_structures::{DtlsParameters, DtlsRole, TransportListenIp, TransportTuple};
use crate::direct_transport::DirectTransportData;
use crate::ortc::RtpMapping;
use crate::pipe_transport::PipeTransportData;
use crate::plain_transport::PlainTransportData;
use crate::producer::{ProducerDump, ProducerId, ProducerStat, ProducerTraceEventType, ProducerType};
use crate::router::{RouterDump, RouterId};
use crate::rtp_parameters::{MediaKind, RtpEncodingParameters, RtpParameters};
use crate::rtp_observer::RtpObserverId;
use crate::sctp_parameters::{NumSctpStreams, SctpStreamParameters};
use crate::srtp_parameters::{SrtpCryptoSuite, SrtpParameters};
use crate::transport::{TransportId, TransportTraceEventType};
use crate::webrtc_transport::{TransportListenIps, WebRtcTransportData};
use crate::worker::{WorkerDump, WorkerResourceUsage, WorkerUpdateSettings};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::net::IpAddr;

pub(crate) trait Request: Debug + Serialize {
    type Response: DeserializeOwned;

    fn as_method(&self) -> &'static str;
}

/// Notification sent over the payload channel together with a raw payload frame.
pub(crate) trait PayloadNotification: Debug + Serialize {
    fn as_event(&self) -> &'static str;
}

macro_rules! request_response {
    (
        $method:literal,
        $request_struct_name:ident { $( $(#[$field_meta:meta])* $field_name:ident: $field_type:ty, )* },
        $existing_response_type:ty $(,)?
    ) => {
        #[derive(Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $request_struct_name {
            $( $(#[$field_meta])* pub(crate) $field_name: $field_type, )*
        }

        impl Request for $request_struct_name {
            type Response = $existing_response_type;

            fn as_method(&self) -> &'static str {
                $method
            }
        }
    };
    (
        $method:literal,
        $request_struct_name:ident $request_struct_impl:tt $(,)?
    ) => {
        // Call above macro with unit type as expected response.
        request_response!($method, $request_struct_name $request_struct_impl, ());
    };
    (
        $method:literal,
        $request_struct_name:ident { $( $(#[$field_meta:meta])* $field_name:ident: $field_type:ty, )* },
        $response_struct_name:ident { $( $(#[$response_field_meta:meta])* $response_field_name:ident: $response_field_type:ty, )* } $(,)?
    ) => {
        #[derive(Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $request_struct_name {
            $( $(#[$field_meta])* pub(crate) $field_name: $field_type, )*
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $response_struct_name {
            $( $(#[$response_field_meta])* pub(crate) $response_field_name: $response_field_type, )*
        }

        impl Request for $request_struct_name {
            type Response = $response_struct_name;

            fn as_method(&self) -> &'static str {
                $method
            }
        }
    };
}

macro_rules! request_response_generic {
    (
        $method:literal,
        $request_struct_name:ident { $( $field_name:ident: $field_type:ty, )* },
        $generic_response:ident $(,)?
    ) => {
        #[derive(Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $request_struct_name<$generic_response>
        where
            $generic_response: Debug + DeserializeOwned,
        {
            $( pub(crate) $field_name: $field_type, )*
            #[serde(skip)]
            pub(crate) phantom_data: PhantomData<$generic_response>,
        }

        impl<$generic_response: Debug + DeserializeOwned> Request
            for $request_struct_name<$generic_response>
        {
            type Response = $generic_response;

            fn as_method(&self) -> &'static str {
                $method
            }
        }
    };
}

macro_rules! payload_notification {
    (
        $event:literal,
        $notification_struct_name:ident { $( $field_name:ident: $field_type:ty, )* } $(,)?
    ) => {
        #[derive(Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $notification_struct_name {
            $( pub(crate) $field_name: $field_type, )*
        }

        impl PayloadNotification for $notification_struct_name {
            fn as_event(&self) -> &'static str {
                $event
            }
        }
    };
}

request_response!("worker.dump", WorkerDumpRequest {}, WorkerDump);

request_response!(
    "worker.getResourceUsage",
    WorkerGetResourceUsageRequest {},
    WorkerResourceUsage,
);

request_response!(
    "worker.updateSettings",
    WorkerUpdateSettingsRequest {
        #[serde(flatten)]
        data: WorkerUpdateSettings,
    },
);

request_response!(
    "worker.createRouter",
    WorkerCreateRouterRequest {
        router_id: RouterId,
    },
);

request_response!(
    "worker.closeRouter",
    WorkerCloseRouterRequest {
        router_id: RouterId,
    },
);

request_response!("router.dump", RouterDumpRequest {}, RouterDump);

request_response!(
    "router.createWebRtcTransport",
    RouterCreateWebrtcTransportRequest {
        transport_id: TransportId,
        listen_ips: TransportListenIps,
        enable_udp: bool,
        enable_tcp: bool,
        prefer_udp: bool,
        prefer_tcp: bool,
        initial_available_outgoing_bitrate: u32,
        enable_sctp: bool,
        num_sctp_streams: NumSctpStreams,
        max_sctp_message_size: u32,
        sctp_send_buffer_size: u32,
    },
    WebRtcTransportData,
);

request_response!(
    "router.createPlainTransport",
    RouterCreatePlainTransportRequest {
        transport_id: TransportId,
        listen_ip: TransportListenIp,
        rtcp_mux: bool,
        comedia: bool,
        enable_sctp: bool,
        num_sctp_streams: NumSctpStreams,
        max_sctp_message_size: u32,
        sctp_send_buffer_size: u32,
        enable_srtp: bool,
        srtp_crypto_suite: SrtpCryptoSuite,
    },
    PlainTransportData,
);

request_response!(
    "router.createPipeTransport",
    RouterCreatePipeTransportRequest {
        transport_id: TransportId,
        listen_ip: TransportListenIp,
        enable_sctp: bool,
        num_sctp_streams: NumSctpStreams,
        max_sctp_message_size: u32,
        sctp_send_buffer_size: u32,
        enable_rtx: bool,
        enable_srtp: bool,
    },
    PipeTransportData,
);

request_response!(
    "router.createDirectTransport",
    RouterCreateDirectTransportRequest {
        transport_id: TransportId,
        direct: bool,
        max_message_size: u32,
    },
    DirectTransportData,
);

request_response!(
    "router.createAudioLevelObserver",
    RouterCreateAudioLevelObserverRequest {
        rtp_observer_id: RtpObserverId,
        max_entries: u16,
        threshold: i8,
        interval: u16,
    },
);

request_response!(
    "router.createActiveSpeakerObserver",
    RouterCreateActiveSpeakerObserverRequest {
        rtp_observer_id: RtpObserverId,
        interval: u16,
    },
);

request_response!(
    "router.closeTransport",
    RouterCloseTransportRequest {
        transport_id: TransportId,
    },
);

request_response!(
    "router.closeRtpObserver",
    RouterCloseRtpObserverRequest {
        rtp_observer_id: RtpObserverId,
    },
);

request_response_generic!(
    "transport.dump",
    TransportDumpRequest {},
    Dump,
);

request_response_generic!(
    "transport.getStats",
    TransportGetStatsRequest {},
    Stats,
);

request_response!(
    "transport.connect",
    TransportConnectWebRtcRequest {
        dtls_parameters: DtlsParameters,
    },
    TransportConnectWebRtcResponse {
        dtls_local_role: DtlsRole,
    },
);

request_response!(
    "transport.connect",
    TransportConnectPlainRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rtcp_port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        srtp_parameters: Option<SrtpParameters>,
    },
    TransportConnectPlainResponse {
        tuple: Option<TransportTuple>,
        rtcp_tuple: Option<TransportTuple>,
        srtp_parameters: Option<SrtpParameters>,
    },
);

request_response!(
    "transport.connect",
    TransportConnectPipeRequest {
        ip: IpAddr,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        srtp_parameters: Option<SrtpParameters>,
    },
    TransportConnectPipeResponse {
        tuple: TransportTuple,
    },
);

request_response!(
    "transport.setMaxIncomingBitrate",
    TransportSetMaxIncomingBitrateRequest {
        bitrate: u32,
    },
);

request_response!(
    "transport.setMaxOutgoingBitrate",
    TransportSetMaxOutgoingBitrateRequest {
        bitrate: u32,
    },
);

request_response!(
    "transport.restartIce",
    TransportRestartIceRequest {},
    TransportRestartIceResponse {
        ice_parameters: crate::data_structures::IceParameters,
    },
);

request_response!(
    "transport.produce",
    TransportProduceRequest {
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        rtp_mapping: RtpMapping,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_frame_request_delay: Option<u32>,
        paused: bool,
    },
    TransportProduceResponse {
        r#type: ProducerType,
    },
);

request_response!(
    "transport.consume",
    TransportConsumeRequest {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        r#type: ConsumerType,
        consumable_rtp_encodings: Vec<RtpEncodingParameters>,
        paused: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        preferred_layers: Option<ConsumerLayers>,
    },
    TransportConsumeResponse {
        paused: bool,
        producer_paused: bool,
        score: ConsumerScore,
        preferred_layers: Option<ConsumerLayers>,
    },
);

request_response!(
    "transport.produceData",
    TransportProduceDataRequest {
        data_producer_id: DataProducerId,
        r#type: DataProducerType,
        #[serde(skip_serializing_if = "Option::is_none")]
        sctp_stream_parameters: Option<SctpStreamParameters>,
        label: String,
        protocol: String,
    },
);

request_response!(
    "transport.consumeData",
    TransportConsumeDataRequest {
        data_consumer_id: DataConsumerId,
        data_producer_id: DataProducerId,
        r#type: DataConsumerType,
        #[serde(skip_serializing_if = "Option::is_none")]
        sctp_stream_parameters: Option<SctpStreamParameters>,
        label: String,
        protocol: String,
    },
);

request_response!(
    "transport.enableTraceEvent",
    TransportEnableTraceEventRequest {
        types: Vec<TransportTraceEventType>,
    },
);

request_response!(
    "transport.closeProducer",
    TransportCloseProducerRequest {
        producer_id: ProducerId,
    },
);

request_response!(
    "transport.closeConsumer",
    TransportCloseConsumerRequest {
        consumer_id: ConsumerId,
    },
);

request_response!(
    "transport.closeDataProducer",
    TransportCloseDataProducerRequest {
        data_producer_id: DataProducerId,
    },
);

request_response!(
    "transport.closeDataConsumer",
    TransportCloseDataConsumerRequest {
        data_consumer_id: DataConsumerId,
    },
);

request_response!("producer.dump", ProducerDumpRequest {}, ProducerDump);

request_response!(
    "producer.getStats",
    ProducerGetStatsRequest {},
    Vec<ProducerStat>,
);

request_response!("producer.pause", ProducerPauseRequest {});

request_response!("producer.resume", ProducerResumeRequest {});

request_response!(
    "producer.enableTraceEvent",
    ProducerEnableTraceEventRequest {
        types: Vec<ProducerTraceEventType>,
    },
);

request_response!("consumer.dump", ConsumerDumpRequest {}, ConsumerDump);

request_response!("consumer.getStats", ConsumerGetStatsRequest {}, ConsumerStats);

request_response!("consumer.pause", ConsumerPauseRequest {});

request_response!("consumer.resume", ConsumerResumeRequest {});

request_response!(
    "consumer.setPreferredLayers",
    ConsumerSetPreferredLayersRequest {
        spatial_layer: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        temporal_layer: Option<u8>,
    },
    Option<ConsumerLayers>,
);

request_response!(
    "consumer.setPriority",
    ConsumerSetPriorityRequest {
        priority: u8,
    },
    ConsumerSetPriorityResponse {
        priority: u8,
    },
);

request_response!("consumer.requestKeyFrame", ConsumerRequestKeyFrameRequest {});

request_response!(
    "consumer.enableTraceEvent",
    ConsumerEnableTraceEventRequest {
        types: Vec<ConsumerTraceEventType>,
    },
);

request_response!("dataProducer.dump", DataProducerDumpRequest {}, DataProducerDump);

request_response!(
    "dataProducer.getStats",
    DataProducerGetStatsRequest {},
    Vec<DataProducerStat>,
);

request_response!("dataConsumer.dump", DataConsumerDumpRequest {}, DataConsumerDump);

request_response!(
    "dataConsumer.getStats",
    DataConsumerGetStatsRequest {},
    Vec<DataConsumerStat>,
);

request_response!(
    "dataConsumer.getBufferedAmount",
    DataConsumerGetBufferedAmountRequest {},
    DataConsumerGetBufferedAmountResponse {
        buffered_amount: u32,
    },
);

request_response!(
    "dataConsumer.setBufferedAmountLowThreshold",
    DataConsumerSetBufferedAmountLowThresholdRequest {
        threshold: u32,
    },
);

request_response!("rtpObserver.pause", RtpObserverPauseRequest {});

request_response!("rtpObserver.resume", RtpObserverResumeRequest {});

request_response!(
    "rtpObserver.addProducer",
    RtpObserverAddProducerRequest {
        producer_id: ProducerId,
    },
);

request_response!(
    "rtpObserver.removeProducer",
    RtpObserverRemoveProducerRequest {
        producer_id: ProducerId,
    },
);

payload_notification!(
    "dataProducer.send",
    DataProducerSendNotification {
        ppid: u32,
    },
);
