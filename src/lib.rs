//! Switchboard is an embeddable control plane for a Selective Forwarding Unit: it spawns and
//! supervises native media-worker subprocesses and drives them through a netstring-framed JSON
//! protocol over anonymous pipes.
//!
//! The object model mirrors the worker side: a [`worker_manager::WorkerManager`] creates
//! [`worker::Worker`]s (one subprocess each); a worker hosts [`router::Router`]s; routers
//! create transports (WebRTC, plain, pipe, direct) on which media and data endpoints —
//! producers, consumers, data producers, data consumers — live. Closing any object cascades
//! to all its descendants, on both sides of the protocol.
//!
//! All media and data is transmitted by the worker; this crate never touches RTP itself. The
//! ortc module implements the capability negotiation that makes a producer consumable by
//! endpoints with heterogeneous codec support.

mod macros;

pub mod data_structures;
mod messages;
mod ortc;
pub mod router;
pub mod rtp_parameters;
pub mod scalability_modes;
pub mod sctp_parameters;
pub mod srtp_parameters;
pub mod supported_rtp_capabilities;
pub mod worker;
pub mod worker_manager;

pub use router::active_speaker_observer;
pub use router::audio_level_observer;
pub use router::consumer;
pub use router::data_consumer;
pub use router::data_producer;
pub use router::direct_transport;
pub use router::pipe_transport;
pub use router::plain_transport;
pub use router::producer;
pub use router::rtp_observer;
pub use router::transport;
pub use router::webrtc_transport;
