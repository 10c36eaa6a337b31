//! gRPC service implementation.
//!
//! Requests are validated here and handed to the shared allocator, which
//! serves them from its in-memory segments and schedules store refills in the
//! background.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`AllocatorService`).

pub mod handler;
