//! Core protocol types for connect-rs.
//!
//! This crate holds everything the server ([`connect-rs-axum`]) and client
//! ([`connect-rs-client`]) runtimes share: the error model, content-type and
//! codec selection, compression codecs and negotiation, streaming envelope
//! framing, header parsing, and static method descriptions.
//!
//! [`connect-rs-axum`]: https://docs.rs/connect-rs-axum
//! [`connect-rs-client`]: https://docs.rs/connect-rs-client

mod compression;
mod envelope;
mod error;
mod header;
mod method;
mod protocol;

pub use compression::*;
pub use envelope::*;
pub use error::*;
pub use header::*;
pub use method::*;
pub use protocol::*;
