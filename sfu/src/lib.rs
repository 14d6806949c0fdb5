//! # Per-subscriber media forwarding engine
//!
//! One [`forwarder::Forwarder`] exists per outgoing subscription of a
//! selective forwarding unit. For a single logical media track (audio or
//! simulcast video) it decides which spatial/temporal layer of the
//! publisher's feed to forward under the current bandwidth budget, rewrites
//! RTP sequence numbers and timestamps so the subscriber sees one continuous
//! stream as the source layer changes, and takes part in the cooperative
//! bandwidth allocation protocol the stream allocator drives across all
//! forwarders of a subscriber.
//!
//! ## Components
//!
//! - **forwarder**: allocation state machine, source-switch timestamp
//!   reconciliation, and the per-packet translation pipeline.
//! - **rtp_munger**: outgoing sequence number / timestamp rewriting, ordering
//!   classification, and padding generation.
//! - **codec_munger**: codec in-band state rewriting (VP8 picture id / TL0
//!   index continuity) behind a capability trait.
//! - **selector**: per-packet video layer selection (simulcast key-frame
//!   gated switching) behind a capability trait.
//! - **packet**: byte-backed RTP packet with 64-bit extended counters.
//!
//! The engine is reactive: no background tasks, timers, or I/O. Every public
//! operation completes synchronously under one reader-writer lock.

pub mod codec_munger;
pub mod error;
pub mod forwarder;
pub mod layer;
pub mod packet;
pub mod rtp_munger;
pub mod selector;
