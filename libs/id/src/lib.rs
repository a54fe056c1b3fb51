//! # cloudagent-id
//!
//! Typed identifiers for records owned by the control plane.
//!
//! Every id is rendered as `{prefix}_{ulid}`, for example
//! `tsk_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The ULID half keeps ids sortable by
//! creation time, which the record store relies on as a FIFO tie-break.
//!
//! Machine ids are not defined here: they are assigned by the cloud provider
//! and carried around as opaque strings.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

/// Splits `{prefix}_{ulid}` and checks the prefix.
///
/// Shared by every type generated with [`define_id!`].
pub fn parse_prefixed(input: &str, expected: &'static str) -> Result<Ulid, IdError> {
    if input.is_empty() {
        return Err(IdError::Empty);
    }

    let Some((prefix, raw)) = input.split_once('_') else {
        return Err(IdError::MissingSeparator);
    };

    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }

    raw.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
