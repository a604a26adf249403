//! # kiln-id
//!
//! Stable ID types, parsing, and validation for the kiln hosting platform.
//!
//! ## ID Format
//!
//! Every resource ID uses a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `srv_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `usr_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix makes a node id impossible to pass where a server id is
//! expected, and the ULID keeps ids time-ordered, which placement relies on
//! for deterministic tie-breaking.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::{parse_prefixed, TypedId};
pub use types::*;

pub use ulid::Ulid;
