//! Wire layer for the control channel.
//!
//! # Architecture
//!
//! - **envelope**: Envelope type and its JSON codec (decode/encode)
//! - **error_envelope**: Error replies built from raw, partially-valid documents
//! - **codec**: Length-prefixed framing for AsyncRead/AsyncWrite
//! - **transport**: Unix socket binding and cleanup

pub mod codec;
pub mod envelope;
pub mod error_envelope;
pub mod transport;
