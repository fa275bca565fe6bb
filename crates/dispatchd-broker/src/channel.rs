//! Channel name validation.
//!
//! Channel names get spliced into LISTEN statements and registry keys, so
//! every transport rejects anything outside the permitted alphabet before
//! executing a single statement.

use crate::error::{BrokerError, Result};

/// Reject names containing anything outside `[A-Za-z0-9_]`, and empty names.
pub fn validate_channel_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(BrokerError::InvalidChannel {
            name: name.to_string(),
        });
    }
    Ok(())
}
