//! # xendevd Proto
//!
//! Wire format for the local device-management protocol spoken between the
//! toolstack and `xendevd`, plus the client side of one exchange.
//!
//! Every connection carries exactly one request and one response:
//!
//! ```text
//! client                                   xendevd
//!   │── request header (12 bytes) ───────────▶│
//!   │── request payload (payload_len) ───────▶│
//!   │◀────────── response header (8 bytes) ───│
//!   │◀────────── response payload ────────────│
//!   └──────────────── close ──────────────────┘
//! ```
//!
//! All integers are 32-bit in host byte order; the socket never leaves the host.

pub mod client;
pub mod error;
pub mod wire;

pub use error::{ProtoError, Result};
pub use wire::{
    read_request, read_response, write_request, write_response, DevRequest, DevResponse,
    DeviceKind, RequestHeader, RequestKind, ResponseHeader, DEFAULT_SOCKET_PATH,
};
