//! Protocol bindings and types shared by the `segid` gRPC server and its
//! clients.
//!
//! - [`error`]: the service error type and its mapping onto gRPC status
//!   codes.
//! - [`types`]: request limits and conversions from allocator state to
//!   protocol messages.
//! - [`proto`]: generated messages, client and server.

pub mod error;
pub mod types;

pub use error::{Error, Result};

pub mod proto {
    tonic::include_proto!("segid");
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("segid_descriptor");
}
