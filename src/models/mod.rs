//! Request and Response models for the line protocol
//!
//! This module defines the DTOs (Data Transfer Objects) decoded from
//! request lines and encoded into response lines.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{Command, DeleteRequest, GetRequest, InitRequest, Request, SetRequest};
pub use responses::Response;
