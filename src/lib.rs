//! Network ingestion front end for remote audit events
//!
//! Remote audit agents connect over TCP and stream audit records to this listener, which
//! reassembles complete messages and hands them to a downstream queue.
//!
//! Two framings share the same socket and can be told apart by their first 4 bytes:
//! - Legacy: plain text records, each terminated by a line feed.
//! - Envelope (the "RMW" remote logging protocol): a 16 bytes big-endian header that starts with
//!   the magic `0xff0000fe`, followed by a payload of the length announced in the header.
//!
//! Envelopes also carry the control traffic. A heartbeat is answered on the spot with an ACK
//! that echoes its sequence number, and is never passed downstream.
//!
//! ## Admission
//!
//! Every accepted peer goes through a host policy and a source port range check before any
//! data is read. Accepted, refused and closed connections are reported to an [`AuditSink`].
//!
//! ## Driving the listener
//!
//! [`AuditListener`] owns every connection and is driven from a single task, either with
//! [`AuditListener::run`], or from another event loop through its per-event entry points.
//!
//! The framing layer is also usable on its own: [`framing::Reassembler`] works on any byte
//! stream, and [`framing::EnvelopeCodec`] is a tokio codec for envelope-only peers such as
//! forwarding clients.

pub mod audit;
pub mod config;
pub mod delivery;
pub mod framing;
pub mod listener;

pub use audit::{AuditSink, TracingAuditSink};
pub use config::ListenerConfig;
pub use delivery::{AuditMessage, MessageSink};
pub use listener::AuditListener;
