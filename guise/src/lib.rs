//! `guise`: a UDP-over-fake-TCP tunnel endpoint.
//!
//! Datagrams go in one side and come out the other while the wire shows a
//! well-formed TCP flow: a three-way handshake, optionally one HTTP
//! request/response pair, then PSH+ACK segments. No real TCP stack is
//! involved on either side; both ends fabricate frames, capture the
//! peer's, and accept only what matches their flow filter. The far end
//! must be another guise instance.
//!
//! # Architecture
//!
//! ```text
//!  application datagrams
//!        │  ▲
//!        ▼  │
//!  ┌───────────────┐   read/write    ┌──────────────────┐
//!  │ RawConn (dial)│◀───────────────▶│RawListener (serve)│
//!  └──────┬────────┘                 └────────┬─────────┘
//!         │ send template + state machine     │ per-flow tables
//!  ┌──────▼───────────────────────────────────▼─────────┐
//!  │ capture pump: parse → filter → packet channel      │
//!  │ injection:    template → encode → frame sink       │
//!  └──────────────────────┬─────────────────────────────┘
//!                         │ raw frames
//!                  network interface
//! ```
//!
//! Reads deliver exactly one captured segment's payload; writes emit
//! exactly one segment. There is no retransmission, reordering or
//! congestion control: a lost segment is a lost datagram, just like UDP.

pub mod capture;
pub mod cli;
pub mod conf;
pub mod dial;
pub mod error;
pub mod http;
pub mod listen;
mod pacer;
pub mod pipe;
mod template;

pub use conf::TunnelOpts;
pub use dial::RawConn;
pub use error::{GuiseError, Result};
pub use listen::RawListener;
