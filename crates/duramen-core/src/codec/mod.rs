//! Canonical codec: deterministic serialization and SHA-256 checksums for
//! events, workflow states, and snapshot blobs.
//!
//! Two implementations that agree on the canonical encoding agree on every
//! checksum, which makes integrity a testable property rather than a
//! convention.

mod canonical_json;
mod hash;

pub use canonical_json::to_canonical_json;
pub use hash::{
    canonical_timestamp, event_checksum, sha256_hex, state_blob, state_blob_checksum,
    state_checksum, verify_event, verify_state,
};
