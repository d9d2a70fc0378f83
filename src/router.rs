//! A router enables injection, selection and forwarding of media streams through transport
//! instances created on it. It holds the RTP capability set every endpoint in the media
//! session negotiates against.

pub mod active_speaker_observer;
pub mod audio_level_observer;
pub mod consumer;
pub mod data_consumer;
pub mod data_producer;
pub mod direct_transport;
pub mod pipe_transport;
pub mod plain_transport;
pub mod producer;
pub mod rtp_observer;
pub mod transport;
pub mod webrtc_transport;

use crate::active_speaker_observer::{ActiveSpeakerObserver, ActiveSpeakerObserverOptions};
use crate::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use crate::consumer::{Consumer, ConsumerOptions};
use crate::data_consumer::{DataConsumer, DataConsumerOptions};
use crate::data_producer::{
    DataProducer, DataProducerId, DataProducerOptions, NonClosingDataProducer, WeakDataProducer,
};
use crate::data_structures::{AppData, TransportListenIp};
use crate::direct_transport::{DirectTransport, DirectTransportOptions};
use crate::messages::{
    RouterCreateActiveSpeakerObserverRequest, RouterCreateAudioLevelObserverRequest,
    RouterCreateDirectTransportRequest, RouterCreatePipeTransportRequest,
    RouterCreatePlainTransportRequest, RouterCreateWebrtcTransportRequest, RouterDumpRequest,
    WorkerCloseRouterRequest,
};
use crate::ortc;
use crate::pipe_transport::{
    PipeTransport, PipeTransportOptions, PipeTransportRemoteParameters,
};
use crate::plain_transport::{PlainTransport, PlainTransportOptions};
use crate::producer::{
    NonClosingProducer, Producer, ProducerId, ProducerOptions, WeakProducer,
};
use crate::rtp_observer::RtpObserverId;
use crate::rtp_parameters::{RtpCapabilities, RtpCodecCapability};
use crate::sctp_parameters::NumSctpStreams;
use crate::transport::{ConsumeError, ProduceError, Transport, TransportId};
use crate::uuid_based_wrapper_type;
use crate::webrtc_transport::{WebRtcTransport, WebRtcTransportOptions};
use crate::worker::{Channel, PayloadChannel, RequestError, Worker};
use async_executor::Executor;
use async_lock::Mutex as AsyncMutex;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

uuid_based_wrapper_type!(
    /// Router identifier.
    RouterId
);

/// Router options.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RouterOptions {
    /// Router media codecs, pruned against the worker supported capabilities to form the
    /// router RTP capability set.
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Custom application data.
    pub app_data: AppData,
}

impl RouterOptions {
    pub fn new(media_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            media_codecs,
            app_data: AppData::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
#[non_exhaustive]
pub struct RouterDump {
    pub id: RouterId,
    pub transport_ids: HashSet<TransportId>,
    pub rtp_observer_ids: HashSet<RtpObserverId>,
}

/// Error that caused a transport creation to fail.
#[derive(Debug, Error)]
pub enum CreateTransportError {
    /// The router is already closed.
    #[error("Router is closed")]
    RouterClosed,
    /// Request to worker failed.
    #[error("Request to worker failed: {0}")]
    Request(RequestError),
}

/// Error that caused an RTP observer creation to fail.
#[derive(Debug, Error)]
pub enum CreateRtpObserverError {
    /// The router is already closed.
    #[error("Router is closed")]
    RouterClosed,
    /// Request to worker failed.
    #[error("Request to worker failed: {0}")]
    Request(RequestError),
}

/// Error that caused [`Router::pipe_producer_to_router`] to fail.
#[derive(Debug, Error)]
pub enum PipeProducerToRouterError {
    /// The destination router must be different from the source router.
    #[error("Destination router must be different from the source router")]
    SameRouter,
    /// The referenced producer is not found in this router.
    #[error("Producer with id \"{0}\" not found")]
    ProducerNotFound(ProducerId),
    /// Failed to create a pipe transport.
    #[error("Failed to create a pipe transport: {0}")]
    CreateTransport(CreateTransportError),
    /// Failed to connect the pipe transport pair.
    #[error("Failed to connect the pipe transport pair: {0}")]
    ConnectTransport(RequestError),
    /// Failed to consume on the local pipe transport.
    #[error("Failed to consume on the local pipe transport: {0}")]
    Consume(ConsumeError),
    /// Failed to produce on the destination router.
    #[error("Failed to produce on the destination router: {0}")]
    Produce(ProduceError),
}

/// Error that caused [`Router::pipe_data_producer_to_router`] to fail.
#[derive(Debug, Error)]
pub enum PipeDataProducerToRouterError {
    /// The destination router must be different from the source router.
    #[error("Destination router must be different from the source router")]
    SameRouter,
    /// The referenced data producer is not found in this router.
    #[error("Data producer with id \"{0}\" not found")]
    DataProducerNotFound(DataProducerId),
    /// The source data producer has no SCTP stream parameters to derive the pipe from.
    #[error("Data producer has no SCTP stream parameters")]
    MissingSctpStreamParameters,
    /// Failed to create a pipe transport.
    #[error("Failed to create a pipe transport: {0}")]
    CreateTransport(CreateTransportError),
    /// Failed to connect the pipe transport pair.
    #[error("Failed to connect the pipe transport pair: {0}")]
    ConnectTransport(RequestError),
    /// Failed to consume data on the local pipe transport.
    #[error("Failed to consume data on the local pipe transport: {0}")]
    ConsumeData(crate::transport::ConsumeDataError),
    /// Failed to produce data on the destination router.
    #[error("Failed to produce data on the destination router: {0}")]
    ProduceData(crate::transport::ProduceDataError),
}

/// Options for piping a producer or data producer to another router.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PipeToRouterOptions {
    /// Target router.
    pub router: Router,
    /// IP used in the pipe transport pair. Default "127.0.0.1".
    pub listen_ip: TransportListenIp,
    /// Create a SCTP association. Default true.
    pub enable_sctp: bool,
    /// SCTP streams number.
    pub num_sctp_streams: NumSctpStreams,
    /// Enable RTX and NACK for RTP retransmission. Default false.
    pub enable_rtx: bool,
    /// Enable SRTP. Default false.
    pub enable_srtp: bool,
}

impl PipeToRouterOptions {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            listen_ip: TransportListenIp {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_ip: None,
            },
            enable_sctp: true,
            num_sctp_streams: NumSctpStreams::default(),
            enable_rtx: false,
            enable_srtp: false,
        }
    }
}

/// Result of [`Router::pipe_producer_to_router`].
///
/// The returned consumer lives on the local pipe transport and feeds the returned producer on
/// the destination router; keeping the consumer alive keeps the pipe flowing. The producer is
/// wrapped so that dropping it does not close the worker-side peer: it stays alive until its
/// source closes.
pub struct PipeProducerToRouterPair {
    /// The consumer created on the local pipe transport.
    pub pipe_consumer: Consumer,
    /// The producer created on the destination router, reusing the source producer id.
    pub pipe_producer: NonClosingProducer,
}

/// Result of [`Router::pipe_data_producer_to_router`].
pub struct PipeDataProducerToRouterPair {
    /// The data consumer created on the local pipe transport.
    pub pipe_data_consumer: DataConsumer,
    /// The data producer created on the destination router, reusing the source id.
    pub pipe_data_producer: NonClosingDataProducer,
}

/// New transport notification for [`Router::on_new_transport`].
#[derive(Debug, Clone, Copy)]
pub enum NewTransport<'a> {
    /// Direct transport.
    Direct(&'a DirectTransport),
    /// Pipe transport.
    Pipe(&'a PipeTransport),
    /// Plain transport.
    Plain(&'a PlainTransport),
    /// WebRTC transport.
    WebRtc(&'a WebRtcTransport),
}

/// New RTP observer notification for [`Router::on_new_rtp_observer`].
#[derive(Debug, Clone, Copy)]
pub enum NewRtpObserver<'a> {
    /// Audio level observer.
    AudioLevel(&'a AudioLevelObserver),
    /// Active speaker observer.
    ActiveSpeaker(&'a ActiveSpeakerObserver),
}

/// The memoized pipe transport pair to one destination router. Holding the transports strongly
/// keeps them (and the worker-side peers) alive for as long as the memo entry exists.
struct PipeTransportPair {
    local: PipeTransport,
    remote: PipeTransport,
    _local_on_close_handler: HandlerId,
    _remote_on_close_handler: HandlerId,
}

#[derive(Default)]
#[allow(clippy::type_complexity)]
struct Handlers {
    new_transport: Bag<Box<dyn for<'a> Fn(NewTransport<'a>) + Send + Sync>>,
    new_rtp_observer: Bag<Box<dyn for<'a> Fn(NewRtpObserver<'a>) + Send + Sync>>,
    worker_close: BagOnce<Box<dyn FnOnce() + Send>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: RouterId,
    executor: Arc<Executor<'static>>,
    channel: Channel,
    payload_channel: PayloadChannel,
    rtp_capabilities: RtpCapabilities,
    handlers: Arc<Handlers>,
    producers: Arc<Mutex<HashMap<ProducerId, WeakProducer>>>,
    data_producers: Arc<Mutex<HashMap<DataProducerId, WeakDataProducer>>>,
    // Single-flight queue plus memo so concurrent pipes to the same destination router share
    // one pipe transport pair.
    mapped_pipe_transports: Arc<Mutex<HashMap<RouterId, PipeTransportPair>>>,
    pipe_to_router_queue: AsyncMutex<()>,
    app_data: AppData,
    // Make sure the worker is not dropped until this router is not dropped.
    worker: Worker,
    closed: AtomicBool,
    _on_worker_close_handler: Mutex<HandlerId>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close(true);
    }
}

impl Inner {
    fn close(&self, close_request: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close()");

            self.handlers.close.call_simple();

            // The cascade above already closed the pipe transports; this just drops them.
            self.mapped_pipe_transports.lock().clear();

            if close_request {
                let channel = self.channel.clone();
                let router_id = self.id;
                let worker = self.worker.clone();
                self.executor
                    .spawn(async move {
                        if let Err(error) = channel
                            .request("", WorkerCloseRouterRequest { router_id })
                            .await
                        {
                            error!("router closing failed on drop: {}", error);
                        }

                        drop(worker);
                    })
                    .detach();
            }
        }
    }
}

/// A router enables injection, selection and forwarding of media streams through transport
/// instances created on it.
#[derive(Clone)]
#[must_use = "Router will be destroyed on drop, make sure to keep it around for as long as needed"]
pub struct Router {
    inner: Arc<Inner>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed)
            .finish()
    }
}

impl Router {
    pub(crate) fn new(
        id: RouterId,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        payload_channel: PayloadChannel,
        rtp_capabilities: RtpCapabilities,
        app_data: AppData,
        worker: Worker,
    ) -> Self {
        debug!("new()");

        let handlers = Arc::<Handlers>::default();

        let inner_weak = Arc::<Mutex<Option<Weak<Inner>>>>::default();
        let on_worker_close_handler = worker.on_close({
            let inner_weak = Arc::clone(&inner_weak);

            move || {
                if let Some(inner) = inner_weak
                    .lock()
                    .as_ref()
                    .and_then(|weak_inner| weak_inner.upgrade())
                {
                    inner.handlers.worker_close.call_simple();
                    // No requests: the worker is gone.
                    inner.close(false);
                }
            }
        });

        let inner = Arc::new(Inner {
            id,
            executor,
            channel,
            payload_channel,
            rtp_capabilities,
            handlers,
            producers: Arc::<Mutex<HashMap<ProducerId, WeakProducer>>>::default(),
            data_producers: Arc::<Mutex<HashMap<DataProducerId, WeakDataProducer>>>::default(),
            mapped_pipe_transports: Arc::<Mutex<HashMap<RouterId, PipeTransportPair>>>::default(
            ),
            pipe_to_router_queue: AsyncMutex::new(()),
            app_data,
            worker,
            closed: AtomicBool::new(false),
            _on_worker_close_handler: Mutex::new(on_worker_close_handler),
        });

        inner_weak.lock().replace(Arc::downgrade(&inner));

        Self { inner }
    }

    /// Router id.
    pub fn id(&self) -> RouterId {
        self.inner.id
    }

    /// Worker this router belongs to.
    pub fn worker(&self) -> &Worker {
        &self.inner.worker
    }

    /// Custom application data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// RTP capabilities of the router; immutable for the router's lifetime. These capabilities
    /// must be used to compute the capabilities of every endpoint willing to produce into or
    /// consume from this router.
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.inner.rtp_capabilities
    }

    /// Whether the router is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dump the router.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<RouterDump, RequestError> {
        debug!("dump()");

        self.inner
            .channel
            .request(&self.inner.id.to_string(), RouterDumpRequest {})
            .await
    }

    /// Create a WebRTC transport.
    ///
    /// Router will be kept alive as long as at least one transport instance is alive.
    pub async fn create_webrtc_transport(
        &self,
        webrtc_transport_options: WebRtcTransportOptions,
    ) -> Result<WebRtcTransport, CreateTransportError> {
        debug!("create_webrtc_transport()");

        if self.closed() {
            return Err(CreateTransportError::RouterClosed);
        }

        let WebRtcTransportOptions {
            listen_ips,
            enable_udp,
            enable_tcp,
            prefer_udp,
            prefer_tcp,
            initial_available_outgoing_bitrate,
            enable_sctp,
            num_sctp_streams,
            max_sctp_message_size,
            sctp_send_buffer_size,
            app_data,
        } = webrtc_transport_options;

        let transport_id = TransportId::new();

        let data = self
            .inner
            .channel
            .request(
                &self.inner.id.to_string(),
                RouterCreateWebrtcTransportRequest {
                    transport_id,
                    listen_ips,
                    enable_udp,
                    enable_tcp,
                    prefer_udp,
                    prefer_tcp,
                    initial_available_outgoing_bitrate,
                    enable_sctp,
                    num_sctp_streams,
                    max_sctp_message_size,
                    sctp_send_buffer_size,
                },
            )
            .await
            .map_err(CreateTransportError::Request)?;

        let transport = WebRtcTransport::new(
            transport_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            self.inner.payload_channel.clone(),
            data,
            app_data,
            self.clone(),
        );

        self.inner.handlers.new_transport.call(|callback| {
            callback(NewTransport::WebRtc(&transport));
        });

        Ok(transport)
    }

    /// Create a plain transport.
    ///
    /// Router will be kept alive as long as at least one transport instance is alive.
    pub async fn create_plain_transport(
        &self,
        plain_transport_options: PlainTransportOptions,
    ) -> Result<PlainTransport, CreateTransportError> {
        debug!("create_plain_transport()");

        if self.closed() {
            return Err(CreateTransportError::RouterClosed);
        }

        let PlainTransportOptions {
            listen_ip,
            rtcp_mux,
            comedia,
            enable_sctp,
            num_sctp_streams,
            max_sctp_message_size,
            sctp_send_buffer_size,
            enable_srtp,
            srtp_crypto_suite,
            app_data,
        } = plain_transport_options;

        let transport_id = TransportId::new();

        let data = self
            .inner
            .channel
            .request(
                &self.inner.id.to_string(),
                RouterCreatePlainTransportRequest {
                    transport_id,
                    listen_ip,
                    rtcp_mux,
                    comedia,
                    enable_sctp,
                    num_sctp_streams,
                    max_sctp_message_size,
                    sctp_send_buffer_size,
                    enable_srtp,
                    srtp_crypto_suite,
                },
            )
            .await
            .map_err(CreateTransportError::Request)?;

        let transport = PlainTransport::new(
            transport_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            self.inner.payload_channel.clone(),
            data,
            app_data,
            self.clone(),
        );

        self.inner.handlers.new_transport.call(|callback| {
            callback(NewTransport::Plain(&transport));
        });

        Ok(transport)
    }

    /// Create a pipe transport.
    ///
    /// Router will be kept alive as long as at least one transport instance is alive.
    pub async fn create_pipe_transport(
        &self,
        pipe_transport_options: PipeTransportOptions,
    ) -> Result<PipeTransport, CreateTransportError> {
        debug!("create_pipe_transport()");

        if self.closed() {
            return Err(CreateTransportError::RouterClosed);
        }

        let PipeTransportOptions {
            listen_ip,
            enable_sctp,
            num_sctp_streams,
            max_sctp_message_size,
            sctp_send_buffer_size,
            enable_rtx,
            enable_srtp,
            app_data,
        } = pipe_transport_options;

        let transport_id = TransportId::new();

        let data = self
            .inner
            .channel
            .request(
                &self.inner.id.to_string(),
                RouterCreatePipeTransportRequest {
                    transport_id,
                    listen_ip,
                    enable_sctp,
                    num_sctp_streams,
                    max_sctp_message_size,
                    sctp_send_buffer_size,
                    enable_rtx,
                    enable_srtp,
                },
            )
            .await
            .map_err(CreateTransportError::Request)?;

        let transport = PipeTransport::new(
            transport_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            self.inner.payload_channel.clone(),
            data,
            app_data,
            self.clone(),
        );

        self.inner.handlers.new_transport.call(|callback| {
            callback(NewTransport::Pipe(&transport));
        });

        Ok(transport)
    }

    /// Create a direct transport.
    ///
    /// Router will be kept alive as long as at least one transport instance is alive.
    pub async fn create_direct_transport(
        &self,
        direct_transport_options: DirectTransportOptions,
    ) -> Result<DirectTransport, CreateTransportError> {
        debug!("create_direct_transport()");

        if self.closed() {
            return Err(CreateTransportError::RouterClosed);
        }

        let DirectTransportOptions {
            max_message_size,
            app_data,
        } = direct_transport_options;

        let transport_id = TransportId::new();

        let data = self
            .inner
            .channel
            .request(
                &self.inner.id.to_string(),
                RouterCreateDirectTransportRequest {
                    transport_id,
                    direct: true,
                    max_message_size,
                },
            )
            .await
            .map_err(CreateTransportError::Request)?;

        let transport = DirectTransport::new(
            transport_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            self.inner.payload_channel.clone(),
            data,
            app_data,
            self.clone(),
        );

        self.inner.handlers.new_transport.call(|callback| {
            callback(NewTransport::Direct(&transport));
        });

        Ok(transport)
    }

    /// Create an audio level observer.
    ///
    /// Router will be kept alive as long as at least one observer instance is alive.
    pub async fn create_audio_level_observer(
        &self,
        audio_level_observer_options: AudioLevelObserverOptions,
    ) -> Result<AudioLevelObserver, CreateRtpObserverError> {
        debug!("create_audio_level_observer()");

        if self.closed() {
            return Err(CreateRtpObserverError::RouterClosed);
        }

        let AudioLevelObserverOptions {
            max_entries,
            threshold,
            interval,
            app_data,
        } = audio_level_observer_options;

        let rtp_observer_id = RtpObserverId::new();

        self.inner
            .channel
            .request(
                &self.inner.id.to_string(),
                RouterCreateAudioLevelObserverRequest {
                    rtp_observer_id,
                    max_entries,
                    threshold,
                    interval,
                },
            )
            .await
            .map_err(CreateRtpObserverError::Request)?;

        let audio_level_observer = AudioLevelObserver::new(
            rtp_observer_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            app_data,
            self.clone(),
        );

        self.inner.handlers.new_rtp_observer.call(|callback| {
            callback(NewRtpObserver::AudioLevel(&audio_level_observer));
        });

        Ok(audio_level_observer)
    }

    /// Create an active speaker observer.
    ///
    /// Router will be kept alive as long as at least one observer instance is alive.
    pub async fn create_active_speaker_observer(
        &self,
        active_speaker_observer_options: ActiveSpeakerObserverOptions,
    ) -> Result<ActiveSpeakerObserver, CreateRtpObserverError> {
        debug!("create_active_speaker_observer()");

        if self.closed() {
            return Err(CreateRtpObserverError::RouterClosed);
        }

        let ActiveSpeakerObserverOptions { interval, app_data } =
            active_speaker_observer_options;

        let rtp_observer_id = RtpObserverId::new();

        self.inner
            .channel
            .request(
                &self.inner.id.to_string(),
                RouterCreateActiveSpeakerObserverRequest {
                    rtp_observer_id,
                    interval,
                },
            )
            .await
            .map_err(CreateRtpObserverError::Request)?;

        let active_speaker_observer = ActiveSpeakerObserver::new(
            rtp_observer_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            app_data,
            self.clone(),
        );

        self.inner.handlers.new_rtp_observer.call(|callback| {
            callback(NewRtpObserver::ActiveSpeaker(&active_speaker_observer));
        });

        Ok(active_speaker_observer)
    }

    /// Check whether the given RTP capabilities can consume the given producer.
    pub fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        match self.get_producer(producer_id) {
            Some(producer) => {
                ortc::can_consume(producer.consumable_rtp_parameters(), rtp_capabilities)
            }
            None => {
                error!(
                    "can_consume() | producer with id \"{}\" not found",
                    producer_id,
                );
                false
            }
        }
    }

    /// Pipe the given producer into the destination router.
    ///
    /// Concurrent calls for the same destination router share a single pipe transport pair:
    /// they are serialized through a router-scoped queue and the pair is memoized until either
    /// of its sides closes.
    pub async fn pipe_producer_to_router(
        &self,
        producer_id: ProducerId,
        pipe_to_router_options: PipeToRouterOptions,
    ) -> Result<PipeProducerToRouterPair, PipeProducerToRouterError> {
        debug!("pipe_producer_to_router()");

        if pipe_to_router_options.router.id() == self.id() {
            return Err(PipeProducerToRouterError::SameRouter);
        }

        let producer = self
            .get_producer(&producer_id)
            .ok_or(PipeProducerToRouterError::ProducerNotFound(producer_id))?;

        let (local, remote) = self
            .get_or_create_pipe_transport_pair(&pipe_to_router_options)
            .await
            .map_err(|error| match error {
                PipeTransportPairError::CreateTransport(error) => {
                    PipeProducerToRouterError::CreateTransport(error)
                }
                PipeTransportPairError::ConnectTransport(error) => {
                    PipeProducerToRouterError::ConnectTransport(error)
                }
            })?;

        let pipe_consumer = local
            .consume(ConsumerOptions::new(
                producer_id,
                RtpCapabilities::default(),
            ))
            .await
            .map_err(PipeProducerToRouterError::Consume)?;

        let pipe_producer = remote
            .produce({
                let mut producer_options = ProducerOptions::new_pipe_transport(
                    producer_id,
                    producer.kind(),
                    pipe_consumer.rtp_parameters().clone(),
                );
                producer_options.paused = pipe_consumer.producer_paused();
                producer_options.app_data = producer.app_data().clone();
                producer_options
            })
            .await
            .map_err(PipeProducerToRouterError::Produce)?;

        // Either end of the pipe going away tears down the other.
        pipe_consumer
            .on_close({
                let weak_producer = pipe_producer.downgrade();

                move || {
                    if let Some(pipe_producer) = weak_producer.upgrade() {
                        pipe_producer.close();
                    }
                }
            })
            .detach();
        pipe_producer
            .on_close({
                let weak_consumer = pipe_consumer.downgrade();

                move || {
                    if let Some(pipe_consumer) = weak_consumer.upgrade() {
                        pipe_consumer.close();
                    }
                }
            })
            .detach();

        let pipe_producer = NonClosingProducer::new(pipe_producer, {
            let pipe_consumer = pipe_consumer.clone();

            move |pipe_producer| {
                // Keep the destination-side producer alive until its source stops feeding it.
                pipe_consumer
                    .on_close(move || {
                        drop(pipe_producer);
                    })
                    .detach();
            }
        });

        Ok(PipeProducerToRouterPair {
            pipe_consumer,
            pipe_producer,
        })
    }

    /// Pipe the given data producer into the destination router.
    pub async fn pipe_data_producer_to_router(
        &self,
        data_producer_id: DataProducerId,
        pipe_to_router_options: PipeToRouterOptions,
    ) -> Result<PipeDataProducerToRouterPair, PipeDataProducerToRouterError> {
        debug!("pipe_data_producer_to_router()");

        if pipe_to_router_options.router.id() == self.id() {
            return Err(PipeDataProducerToRouterError::SameRouter);
        }

        let data_producer = self.get_data_producer(&data_producer_id).ok_or(
            PipeDataProducerToRouterError::DataProducerNotFound(data_producer_id),
        )?;

        // The data path cannot be piped without SCTP stream parameters on the source.
        if data_producer.sctp_stream_parameters().is_none() {
            return Err(PipeDataProducerToRouterError::MissingSctpStreamParameters);
        }

        let (local, remote) = self
            .get_or_create_pipe_transport_pair(&pipe_to_router_options)
            .await
            .map_err(|error| match error {
                PipeTransportPairError::CreateTransport(error) => {
                    PipeDataProducerToRouterError::CreateTransport(error)
                }
                PipeTransportPairError::ConnectTransport(error) => {
                    PipeDataProducerToRouterError::ConnectTransport(error)
                }
            })?;

        let pipe_data_consumer = local
            .consume_data(DataConsumerOptions::new_sctp(data_producer_id))
            .await
            .map_err(PipeDataProducerToRouterError::ConsumeData)?;

        let pipe_data_producer = remote
            .produce_data({
                let sctp_stream_parameters = pipe_data_consumer
                    .sctp_stream_parameters()
                    .ok_or(PipeDataProducerToRouterError::MissingSctpStreamParameters)?;

                let mut data_producer_options = DataProducerOptions::new_pipe_transport(
                    data_producer_id,
                    sctp_stream_parameters,
                );
                data_producer_options.label = data_producer.label().clone();
                data_producer_options.protocol = data_producer.protocol().clone();
                data_producer_options.app_data = data_producer.app_data().clone();
                data_producer_options
            })
            .await
            .map_err(PipeDataProducerToRouterError::ProduceData)?;

        pipe_data_consumer
            .on_close({
                let weak_data_producer = pipe_data_producer.downgrade();

                move || {
                    if let Some(pipe_data_producer) = weak_data_producer.upgrade() {
                        pipe_data_producer.close();
                    }
                }
            })
            .detach();
        pipe_data_producer
            .on_close({
                let weak_data_consumer = pipe_data_consumer.downgrade();

                move || {
                    if let Some(pipe_data_consumer) = weak_data_consumer.upgrade() {
                        pipe_data_consumer.close();
                    }
                }
            })
            .detach();

        let pipe_data_producer = NonClosingDataProducer::new(pipe_data_producer, {
            let pipe_data_consumer = pipe_data_consumer.clone();

            move |pipe_data_producer| {
                pipe_data_consumer
                    .on_close(move || {
                        drop(pipe_data_producer);
                    })
                    .detach();
            }
        });

        Ok(PipeDataProducerToRouterPair {
            pipe_data_consumer,
            pipe_data_producer,
        })
    }

    /// Callback is called when a new transport is created.
    pub fn on_new_transport<F: for<'a> Fn(NewTransport<'a>) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.new_transport.add(Box::new(callback))
    }

    /// Callback is called when a new RTP observer is created.
    pub fn on_new_rtp_observer<F: for<'a> Fn(NewRtpObserver<'a>) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.new_rtp_observer.add(Box::new(callback))
    }

    /// Callback is called when the worker this router belongs to is closed for whatever
    /// reason. The router itself is also closed; no worker requests are issued on this path.
    pub fn on_worker_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.worker_close.add(Box::new(callback))
    }

    /// Callback is called when the router is closed for whatever reason.
    ///
    /// NOTE: Callback will be called in place if router is already closed.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Close the router and cascade the close to every transport and RTP observer created on
    /// it (and through them to every media and data endpoint). A single close request for the
    /// whole subtree is sent to the worker; descendants are closed locally without further
    /// requests. Idempotent.
    pub fn close(&self) {
        self.inner.close(true);
    }

    pub(crate) fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.get_producer(producer_id).is_some()
    }

    pub(crate) fn get_producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.inner
            .producers
            .lock()
            .get(producer_id)?
            .upgrade()
    }

    pub(crate) fn has_data_producer(&self, data_producer_id: &DataProducerId) -> bool {
        self.get_data_producer(data_producer_id).is_some()
    }

    pub(crate) fn get_data_producer(
        &self,
        data_producer_id: &DataProducerId,
    ) -> Option<DataProducer> {
        self.inner
            .data_producers
            .lock()
            .get(data_producer_id)?
            .upgrade()
    }

    pub(crate) fn register_producer(&self, producer: &Producer) {
        let producer_id = producer.id();
        self.inner
            .producers
            .lock()
            .insert(producer_id, producer.downgrade());

        producer
            .on_close({
                let producers = Arc::clone(&self.inner.producers);

                move || {
                    producers.lock().remove(&producer_id);
                }
            })
            .detach();
    }

    pub(crate) fn register_data_producer(&self, data_producer: &DataProducer) {
        let data_producer_id = data_producer.id();
        self.inner
            .data_producers
            .lock()
            .insert(data_producer_id, data_producer.downgrade());

        data_producer
            .on_close({
                let data_producers = Arc::clone(&self.inner.data_producers);

                move || {
                    data_producers.lock().remove(&data_producer_id);
                }
            })
            .detach();
    }

    async fn get_or_create_pipe_transport_pair(
        &self,
        pipe_to_router_options: &PipeToRouterOptions,
    ) -> Result<(PipeTransport, PipeTransport), PipeTransportPairError> {
        // Serialize concurrent calls: a second call for the same destination router waits for
        // the first and reuses its pair.
        let _queue_guard = self.inner.pipe_to_router_queue.lock().await;

        let destination_router_id = pipe_to_router_options.router.id();

        if let Some(pair) = self
            .inner
            .mapped_pipe_transports
            .lock()
            .get(&destination_router_id)
        {
            return Ok((pair.local.clone(), pair.remote.clone()));
        }

        let transport_options = PipeTransportOptions {
            enable_sctp: pipe_to_router_options.enable_sctp,
            num_sctp_streams: pipe_to_router_options.num_sctp_streams,
            enable_rtx: pipe_to_router_options.enable_rtx,
            enable_srtp: pipe_to_router_options.enable_srtp,
            ..PipeTransportOptions::new(pipe_to_router_options.listen_ip)
        };

        let local = self
            .create_pipe_transport(transport_options.clone())
            .await
            .map_err(PipeTransportPairError::CreateTransport)?;
        let remote = pipe_to_router_options
            .router
            .create_pipe_transport(transport_options)
            .await
            .map_err(PipeTransportPairError::CreateTransport)?;

        // Cross-connect the pair through their local tuples.
        local
            .connect(PipeTransportRemoteParameters {
                ip: remote.tuple().local_ip(),
                port: remote.tuple().local_port(),
                srtp_parameters: remote.srtp_parameters(),
            })
            .await
            .map_err(PipeTransportPairError::ConnectTransport)?;
        remote
            .connect(PipeTransportRemoteParameters {
                ip: local.tuple().local_ip(),
                port: local.tuple().local_port(),
                srtp_parameters: local.srtp_parameters(),
            })
            .await
            .map_err(PipeTransportPairError::ConnectTransport)?;

        // Either side closing evicts the memo entry, which drops both transports.
        let evict_handler = |inner_weak: Weak<Inner>| {
            move || {
                if let Some(inner) = inner_weak.upgrade() {
                    inner
                        .mapped_pipe_transports
                        .lock()
                        .remove(&destination_router_id);
                }
            }
        };

        let local_on_close_handler =
            local.on_close(Box::new(evict_handler(Arc::downgrade(&self.inner))));
        let remote_on_close_handler =
            remote.on_close(Box::new(evict_handler(Arc::downgrade(&self.inner))));

        self.inner.mapped_pipe_transports.lock().insert(
            destination_router_id,
            PipeTransportPair {
                local: local.clone(),
                remote: remote.clone(),
                _local_on_close_handler: local_on_close_handler,
                _remote_on_close_handler: remote_on_close_handler,
            },
        );

        Ok((local, remote))
    }
}

enum PipeTransportPairError {
    CreateTransport(CreateTransportError),
    ConnectTransport(RequestError),
}
