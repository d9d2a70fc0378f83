//! Abstract transport: the network endpoint on which media endpoints are created.
//!
//! The concrete variants (WebRTC, plain, pipe, direct) share the produce/consume machinery
//! implemented here: ortc parameter derivation, CNAME reservation, consumer MID allocation and
//! SCTP stream-id allocation.

use crate::consumer::{Consumer, ConsumerId, ConsumerOptions, ConsumerType};
use crate::data_consumer::{DataConsumer, DataConsumerId, DataConsumerOptions, DataConsumerType};
use crate::data_producer::{DataProducer, DataProducerId, DataProducerOptions, DataProducerType};
use crate::data_structures::{AppData, EventDirection};
use crate::messages::{
    TransportConsumeDataRequest, TransportConsumeRequest, TransportDumpRequest,
    TransportEnableTraceEventRequest, TransportGetStatsRequest, TransportProduceDataRequest,
    TransportProduceRequest, TransportSetMaxIncomingBitrateRequest,
    TransportSetMaxOutgoingBitrateRequest,
};
use crate::ortc;
pub use crate::ortc::{ConsumerRtpParametersError, RtpParametersMappingError};
use crate::producer::{Producer, ProducerId, ProducerOptions};
use crate::router::{Router, RouterId};
use crate::rtp_parameters::RtpEncodingParameters;
use crate::sctp_parameters::SctpStreamParameters;
use crate::uuid_based_wrapper_type;
use crate::worker::{Channel, PayloadChannel, RequestError};
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

uuid_based_wrapper_type!(
    /// Transport identifier.
    TransportId
);

// The MID space for consumers is limited to 8 characters, hence the wrap.
const MID_SPACE: usize = 100_000_000;

/// Error that caused [`Transport::produce`] to fail.
#[derive(Debug, Error)]
pub enum ProduceError {
    /// The transport is already closed.
    #[error("Transport is closed")]
    TransportClosed,
    /// A producer with the same id already exists.
    #[error("Producer with the same id \"{0}\" already exists")]
    AlreadyExists(ProducerId),
    /// Producing is not supported by this transport.
    #[error("Producing is not supported by this transport")]
    NotSupported,
    /// The producer RTP parameters cannot be mapped onto the router capabilities.
    #[error("RTP parameters mapping error: {0}")]
    FailedRtpParametersMapping(RtpParametersMappingError),
    /// Request to worker failed.
    #[error("Request to worker failed: {0}")]
    Request(RequestError),
}

/// Error that caused [`Transport::consume`] to fail.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The transport is already closed.
    #[error("Transport is closed")]
    TransportClosed,
    /// The referenced producer is not found in the router.
    #[error("Producer with id \"{0}\" not found")]
    ProducerNotFound(ProducerId),
    /// Consuming is not supported by this transport.
    #[error("Consuming is not supported by this transport")]
    NotSupported,
    /// The given RTP capabilities are not compatible with the producer.
    #[error("Bad consumer RTP parameters: {0}")]
    BadConsumerRtpParameters(ConsumerRtpParametersError),
    /// Request to worker failed.
    #[error("Request to worker failed: {0}")]
    Request(RequestError),
}

/// Error that caused [`Transport::produce_data`] to fail.
#[derive(Debug, Error)]
pub enum ProduceDataError {
    /// The transport is already closed.
    #[error("Transport is closed")]
    TransportClosed,
    /// A data producer with the same id already exists.
    #[error("Data producer with the same id \"{0}\" already exists")]
    AlreadyExists(DataProducerId),
    /// SCTP stream parameters are required on this transport.
    #[error("SCTP stream parameters are required for this transport")]
    SctpStreamParametersRequired,
    /// SCTP stream parameters must not be given on a direct transport.
    #[error("SCTP stream parameters must not be given for direct transport")]
    SctpStreamParametersNotAllowed,
    /// Request to worker failed.
    #[error("Request to worker failed: {0}")]
    Request(RequestError),
}

/// Error that caused [`Transport::consume_data`] to fail.
#[derive(Debug, Error)]
pub enum ConsumeDataError {
    /// The transport is already closed.
    #[error("Transport is closed")]
    TransportClosed,
    /// The referenced data producer is not found in the router.
    #[error("Data producer with id \"{0}\" not found")]
    DataProducerNotFound(DataProducerId),
    /// All SCTP stream ids of the transport are in use.
    #[error("No free SCTP stream id available")]
    NoSctpStreamId,
    /// Request to worker failed.
    #[error("Request to worker failed: {0}")]
    Request(RequestError),
}

/// Types of trace events a transport can emit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportTraceEventType {
    /// RTP probation packet.
    Probation,
    /// Transport bandwidth estimation changed.
    Bwe,
}

/// 'trace' event data.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportTraceEventData {
    Probation {
        /// Event timestamp.
        timestamp: u64,
        /// Event direction.
        direction: EventDirection,
        /// Per type specific information.
        info: Value,
    },
    Bwe {
        /// Event timestamp.
        timestamp: u64,
        /// Event direction.
        direction: EventDirection,
        /// Per type specific information.
        info: Value,
    },
}

/// A transport connects an endpoint with a router and enables transmission of media in both
/// directions by means of [`Producer`], [`Consumer`], [`DataProducer`] and [`DataConsumer`]
/// instances created on it.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Transport id.
    fn id(&self) -> TransportId;

    /// Router id this transport belongs to.
    fn router_id(&self) -> RouterId;

    /// Custom application data.
    fn app_data(&self) -> &AppData;

    /// Whether the transport is closed.
    fn closed(&self) -> bool;

    /// Instructs the router to receive audio or video RTP (or SRTP depending on the transport).
    /// This is the way to inject media into the SFU.
    ///
    /// Transport will be kept alive as long as at least one producer instance is alive.
    async fn produce(&self, producer_options: ProducerOptions) -> Result<Producer, ProduceError>;

    /// Instructs the router to send audio or video RTP (or SRTP depending on the transport).
    /// This is the way to extract media from the SFU.
    ///
    /// Transport will be kept alive as long as at least one consumer instance is alive.
    async fn consume(&self, consumer_options: ConsumerOptions) -> Result<Consumer, ConsumeError>;

    /// Instructs the router to receive data messages. Those messages can be delivered by an
    /// endpoint via SCTP protocol (AKA DataChannel) or can be directly sent from the Rust
    /// application if the transport is a direct transport.
    async fn produce_data(
        &self,
        data_producer_options: DataProducerOptions,
    ) -> Result<DataProducer, ProduceDataError>;

    /// Instructs the router to send data messages to the endpoint via SCTP protocol (AKA
    /// DataChannel) or directly to the Rust process if the transport is a direct transport.
    async fn consume_data(
        &self,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError>;

    /// Instructs the transport to emit "trace" events. For monitoring purposes.
    async fn enable_trace_event(
        &self,
        types: Vec<TransportTraceEventType>,
    ) -> Result<(), RequestError>;

    /// Callback is called when a new producer is created.
    fn on_new_producer(
        &self,
        callback: Box<dyn Fn(&Producer) + Send + Sync + 'static>,
    ) -> HandlerId;

    /// Callback is called when a new consumer is created.
    fn on_new_consumer(
        &self,
        callback: Box<dyn Fn(&Consumer) + Send + Sync + 'static>,
    ) -> HandlerId;

    /// Callback is called when a new data producer is created.
    fn on_new_data_producer(
        &self,
        callback: Box<dyn Fn(&DataProducer) + Send + Sync + 'static>,
    ) -> HandlerId;

    /// Callback is called when a new data consumer is created.
    fn on_new_data_consumer(
        &self,
        callback: Box<dyn Fn(&DataConsumer) + Send + Sync + 'static>,
    ) -> HandlerId;

    /// See [`Transport::enable_trace_event`].
    fn on_trace(
        &self,
        callback: Box<dyn Fn(&TransportTraceEventData) + Send + Sync + 'static>,
    ) -> HandlerId;

    /// Callback is called when the router this transport belongs to is closed for whatever
    /// reason. The transport itself is also closed.
    fn on_router_close(&self, callback: Box<dyn FnOnce() + Send + 'static>) -> HandlerId;

    /// Callback is called when the transport is closed for whatever reason.
    ///
    /// NOTE: Callback will be called in place if transport is already closed.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send + 'static>) -> HandlerId;
}

/// Non-object-safe part of the transport interface: per-variant dump/stats types and the
/// operations whose availability depends on the variant.
#[async_trait]
pub trait TransportGeneric: Transport + Clone + 'static {
    /// Dump data structure specific to this transport.
    type Dump: Debug + DeserializeOwned + Send;
    /// Stats data structure specific to this transport.
    type Stat: Debug + DeserializeOwned + Send;

    /// Dump the transport.
    #[doc(hidden)]
    async fn dump(&self) -> Result<Self::Dump, RequestError>;

    /// Returns current RTC statistics of the transport.
    async fn get_stats(&self) -> Result<Vec<Self::Stat>, RequestError>;
}

/// Which variant a transport is; drives the small semantic differences in the shared
/// produce/consume paths.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum TransportType {
    Direct,
    Pipe,
    Plain,
    WebRtc,
}

/// Event handler bags common to every transport variant.
#[derive(Default)]
pub(super) struct TransportHandlers {
    pub(super) new_producer: Bag<Box<dyn Fn(&Producer) + Send + Sync>>,
    pub(super) new_consumer: Bag<Box<dyn Fn(&Consumer) + Send + Sync>>,
    pub(super) new_data_producer: Bag<Box<dyn Fn(&DataProducer) + Send + Sync>>,
    pub(super) new_data_consumer: Bag<Box<dyn Fn(&DataConsumer) + Send + Sync>>,
    pub(super) trace: Bag<Box<dyn Fn(&TransportTraceEventData) + Send + Sync>>,
    pub(super) router_close: BagOnce<Box<dyn FnOnce() + Send>>,
    pub(super) close: BagOnce<Box<dyn FnOnce() + Send>>,
}

/// SCTP stream ids are allocated mod-MIS, skipping ids still in use; releasing an id clears
/// its slot.
pub(super) struct SctpStreamIds {
    next: usize,
    used: Vec<bool>,
}

impl SctpStreamIds {
    pub(super) fn new(mis: u16) -> Self {
        Self {
            next: 0,
            used: vec![false; usize::from(mis)],
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        let len = self.used.len();
        for offset in 0..len {
            let index = (self.next + offset) % len;
            if !self.used[index] {
                self.used[index] = true;
                self.next = (index + 1) % len;
                return Some(index as u16);
            }
        }

        None
    }

    fn release(&mut self, stream_id: u16) {
        if let Some(used) = self.used.get_mut(usize::from(stream_id)) {
            *used = false;
        }
    }
}

/// Internal trait implemented by every variant, providing access to the shared state and the
/// shared operation implementations.
#[async_trait]
pub(super) trait TransportImpl: TransportGeneric {
    fn transport_type(&self) -> TransportType;

    fn router(&self) -> &Router;

    fn channel(&self) -> &Channel;

    fn payload_channel(&self) -> &PayloadChannel;

    fn executor(&self) -> &Arc<Executor<'static>>;

    fn handlers(&self) -> &Arc<TransportHandlers>;

    fn next_mid_for_consumers(&self) -> &AtomicUsize;

    fn used_sctp_stream_ids(&self) -> &Arc<Mutex<SctpStreamIds>>;

    fn cname_for_producers(&self) -> &Mutex<Option<String>>;

    async fn dump_impl(&self) -> Result<Self::Dump, RequestError> {
        self.channel()
            .request(
                &self.id().to_string(),
                TransportDumpRequest {
                    phantom_data: PhantomData::<Self::Dump>,
                },
            )
            .await
    }

    async fn get_stats_impl(&self) -> Result<Vec<Self::Stat>, RequestError> {
        self.channel()
            .request(
                &self.id().to_string(),
                TransportGetStatsRequest {
                    phantom_data: PhantomData::<Vec<Self::Stat>>,
                },
            )
            .await
    }

    async fn set_max_incoming_bitrate_impl(&self, bitrate: u32) -> Result<(), RequestError> {
        self.channel()
            .request(
                &self.id().to_string(),
                TransportSetMaxIncomingBitrateRequest { bitrate },
            )
            .await
    }

    async fn set_max_outgoing_bitrate_impl(&self, bitrate: u32) -> Result<(), RequestError> {
        self.channel()
            .request(
                &self.id().to_string(),
                TransportSetMaxOutgoingBitrateRequest { bitrate },
            )
            .await
    }

    async fn enable_trace_event_impl(
        &self,
        types: Vec<TransportTraceEventType>,
    ) -> Result<(), RequestError> {
        self.channel()
            .request(
                &self.id().to_string(),
                TransportEnableTraceEventRequest { types },
            )
            .await
    }

    async fn produce_impl(
        &self,
        producer_options: ProducerOptions,
    ) -> Result<Producer, ProduceError> {
        if self.closed() {
            return Err(ProduceError::TransportClosed);
        }

        let ProducerOptions {
            id,
            kind,
            mut rtp_parameters,
            paused,
            key_frame_request_delay,
            app_data,
        } = producer_options;

        if let Some(id) = &id {
            if self.router().has_producer(id) {
                return Err(ProduceError::AlreadyExists(*id));
            }
        }

        // A producer without encodings gets a single default one.
        if rtp_parameters.encodings.is_empty() {
            rtp_parameters
                .encodings
                .push(RtpEncodingParameters::default());
        }

        // Don't do this in PipeTransports since there the producer is already
        // holding the mapped CNAME of the original producer.
        if self.transport_type() != TransportType::Pipe && rtp_parameters.rtcp.cname.is_none() {
            let mut cname_for_producers = self.cname_for_producers().lock();
            let cname = cname_for_producers
                .get_or_insert_with(|| format!("{:08x}{:08x}", fastrand::u32(..), fastrand::u32(..)));
            rtp_parameters.rtcp.cname = Some(cname.clone());
        }

        let rtp_mapping = ortc::get_producer_rtp_parameters_mapping(
            &mut rtp_parameters,
            self.router().rtp_capabilities(),
        )
        .map_err(ProduceError::FailedRtpParametersMapping)?;

        let consumable_rtp_parameters = ortc::get_consumable_rtp_parameters(
            kind,
            &rtp_parameters,
            self.router().rtp_capabilities(),
            &rtp_mapping,
        );

        let producer_id = id.unwrap_or_else(ProducerId::new);

        let response = self
            .channel()
            .request(
                &self.id().to_string(),
                TransportProduceRequest {
                    producer_id,
                    kind,
                    rtp_parameters: rtp_parameters.clone(),
                    rtp_mapping,
                    key_frame_request_delay,
                    paused,
                },
            )
            .await
            .map_err(ProduceError::Request)?;

        let producer = Producer::new(
            producer_id,
            kind,
            response.r#type,
            rtp_parameters,
            consumable_rtp_parameters,
            paused,
            Arc::clone(self.executor()),
            self.channel().clone(),
            self.payload_channel().clone(),
            app_data,
            Box::new(self.clone()),
            self.transport_type() == TransportType::Direct,
        );

        self.router().register_producer(&producer);

        self.handlers().new_producer.call(|callback| {
            callback(&producer);
        });

        Ok(producer)
    }

    async fn consume_impl(
        &self,
        consumer_options: ConsumerOptions,
    ) -> Result<Consumer, ConsumeError> {
        if self.closed() {
            return Err(ConsumeError::TransportClosed);
        }

        let ConsumerOptions {
            producer_id,
            rtp_capabilities,
            paused,
            preferred_layers,
            app_data,
        } = consumer_options;

        let producer = self
            .router()
            .get_producer(&producer_id)
            .ok_or(ConsumeError::ProducerNotFound(producer_id))?;

        let (r#type, rtp_parameters) = match self.transport_type() {
            TransportType::Pipe => {
                // Pipe consumers preserve all simulcast layers of the producer; RTX depends on
                // how the pipe transport was created.
                let rtp_parameters = ortc::get_pipe_consumer_rtp_parameters(
                    producer.consumable_rtp_parameters(),
                    self.rtx_for_consumers(),
                );

                (ConsumerType::Pipe, rtp_parameters)
            }
            _ => {
                let mut rtp_parameters = ortc::get_consumer_rtp_parameters(
                    producer.consumable_rtp_parameters(),
                    &rtp_capabilities,
                )
                .map_err(ConsumeError::BadConsumerRtpParameters)?;

                let raw_mid = self.next_mid_for_consumers().fetch_add(1, Ordering::AcqRel);
                if raw_mid > 0 && raw_mid % MID_SPACE == 0 {
                    warn!("consume() | consumer MID counter wrapped [transport_id:{}]", self.id());
                }
                rtp_parameters.mid = Some((raw_mid % MID_SPACE).to_string());

                (ConsumerType::from(producer.r#type()), rtp_parameters)
            }
        };

        let consumer_id = ConsumerId::new();

        let response = self
            .channel()
            .request(
                &self.id().to_string(),
                TransportConsumeRequest {
                    consumer_id,
                    producer_id,
                    kind: producer.kind(),
                    rtp_parameters: rtp_parameters.clone(),
                    r#type,
                    consumable_rtp_encodings: producer
                        .consumable_rtp_parameters()
                        .encodings
                        .clone(),
                    paused,
                    preferred_layers,
                },
            )
            .await
            .map_err(ConsumeError::Request)?;

        let consumer = Consumer::new(
            consumer_id,
            producer_id,
            producer.kind(),
            r#type,
            rtp_parameters,
            response.paused,
            response.producer_paused,
            response.score,
            response.preferred_layers,
            Arc::clone(self.executor()),
            self.channel().clone(),
            self.payload_channel().clone(),
            app_data,
            Box::new(self.clone()),
        );

        self.handlers().new_consumer.call(|callback| {
            callback(&consumer);
        });

        Ok(consumer)
    }

    /// Whether consumers on this transport should keep RTX support; only meaningful for pipe
    /// transports.
    fn rtx_for_consumers(&self) -> bool {
        false
    }

    async fn produce_data_impl(
        &self,
        r#type: DataProducerType,
        data_producer_options: DataProducerOptions,
    ) -> Result<DataProducer, ProduceDataError> {
        if self.closed() {
            return Err(ProduceDataError::TransportClosed);
        }

        let DataProducerOptions {
            id,
            sctp_stream_parameters,
            label,
            protocol,
            app_data,
        } = data_producer_options;

        if let Some(id) = &id {
            if self.router().has_data_producer(id) {
                return Err(ProduceDataError::AlreadyExists(*id));
            }
        }

        match r#type {
            DataProducerType::Sctp => {
                if sctp_stream_parameters.is_none() {
                    return Err(ProduceDataError::SctpStreamParametersRequired);
                }
            }
            DataProducerType::Direct => {
                if sctp_stream_parameters.is_some() {
                    return Err(ProduceDataError::SctpStreamParametersNotAllowed);
                }
            }
        }

        let data_producer_id = id.unwrap_or_else(DataProducerId::new);

        self.channel()
            .request(
                &self.id().to_string(),
                TransportProduceDataRequest {
                    data_producer_id,
                    r#type,
                    sctp_stream_parameters,
                    label: label.clone(),
                    protocol: protocol.clone(),
                },
            )
            .await
            .map_err(ProduceDataError::Request)?;

        let data_producer = DataProducer::new(
            data_producer_id,
            r#type,
            sctp_stream_parameters,
            label,
            protocol,
            Arc::clone(self.executor()),
            self.channel().clone(),
            self.payload_channel().clone(),
            app_data,
            Box::new(self.clone()),
            r#type == DataProducerType::Direct,
        );

        self.router().register_data_producer(&data_producer);

        self.handlers().new_data_producer.call(|callback| {
            callback(&data_producer);
        });

        Ok(data_producer)
    }

    async fn consume_data_impl(
        &self,
        r#type: DataConsumerType,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError> {
        if self.closed() {
            return Err(ConsumeDataError::TransportClosed);
        }

        let DataConsumerOptions {
            data_producer_id,
            ordered,
            max_packet_life_time,
            max_retransmits,
            app_data,
        } = data_consumer_options;

        let data_producer = self
            .router()
            .get_data_producer(&data_producer_id)
            .ok_or(ConsumeDataError::DataProducerNotFound(data_producer_id))?;

        let (sctp_stream_parameters, allocated_stream_id) = match r#type {
            DataConsumerType::Sctp => {
                let mut sctp_stream_parameters = data_producer
                    .sctp_stream_parameters()
                    .unwrap_or_else(|| SctpStreamParameters::new_ordered(0));

                let stream_id = self
                    .used_sctp_stream_ids()
                    .lock()
                    .allocate()
                    .ok_or(ConsumeDataError::NoSctpStreamId)?;

                sctp_stream_parameters.stream_id = stream_id;
                if let Some(ordered) = ordered {
                    sctp_stream_parameters.ordered = ordered;
                }
                if max_packet_life_time.is_some() {
                    sctp_stream_parameters.max_packet_life_time = max_packet_life_time;
                }
                if max_retransmits.is_some() {
                    sctp_stream_parameters.max_retransmits = max_retransmits;
                }

                (Some(sctp_stream_parameters), Some(stream_id))
            }
            DataConsumerType::Direct => (None, None),
        };

        let data_consumer_id = DataConsumerId::new();

        let result = self
            .channel()
            .request(
                &self.id().to_string(),
                TransportConsumeDataRequest {
                    data_consumer_id,
                    data_producer_id,
                    r#type,
                    sctp_stream_parameters,
                    label: data_producer.label().clone(),
                    protocol: data_producer.protocol().clone(),
                },
            )
            .await;

        if let Err(error) = result {
            if let Some(stream_id) = allocated_stream_id {
                self.used_sctp_stream_ids().lock().release(stream_id);
            }
            return Err(ConsumeDataError::Request(error));
        }

        let data_consumer = DataConsumer::new(
            data_consumer_id,
            data_producer_id,
            r#type,
            sctp_stream_parameters,
            data_producer.label().clone(),
            data_producer.protocol().clone(),
            Arc::clone(self.executor()),
            self.channel().clone(),
            self.payload_channel().clone(),
            app_data,
            Box::new(self.clone()),
            r#type == DataConsumerType::Direct,
        );

        // Give the SCTP stream id back once the data consumer goes away.
        if let Some(stream_id) = allocated_stream_id {
            let used_sctp_stream_ids = Arc::clone(self.used_sctp_stream_ids());
            data_consumer
                .on_close(move || {
                    used_sctp_stream_ids.lock().release(stream_id);
                })
                .detach();
        }

        self.handlers().new_data_consumer.call(|callback| {
            callback(&data_consumer);
        });

        Ok(data_consumer)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sctp_stream_id_allocation_is_mod_mis() {
        let mut ids = SctpStreamIds::new(4);

        assert_eq!(ids.allocate(), Some(0));
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));

        // Releasing an id makes it available again, but allocation continues after the last
        // handed out id first.
        ids.release(1);
        assert_eq!(ids.allocate(), Some(3));
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), None);

        ids.release(2);
        assert_eq!(ids.allocate(), Some(2));
    }
}
