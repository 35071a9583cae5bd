//! Prepared request records and request-set states

use std::fmt;

use crate::{
    config::MAX_REQUEST_LENGTH,
    error::{Result, ScatterError},
};

/// Direction of a prepared request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    Write,
}

/// One accepted (address, length) request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedRequest {
    /// Target address
    pub address: u64,
    /// Length in bytes, always non-zero
    pub length: u32,
    /// Read or write
    pub kind: RequestKind,
}

impl PreparedRequest {
    /// Whether this request is a read of exactly `address`/`length`
    pub fn is_read_of(&self, address: u64, length: u32) -> bool {
        self.kind == RequestKind::Read && self.address == address && self.length == length
    }
}

/// Lifecycle state of a request set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetState {
    /// Accepting prepare calls
    Open,
    /// Results readable
    Executed,
    /// Handle released, nothing further is valid
    Disposed,
}

impl fmt::Display for SetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetState::Open => "Open",
            SetState::Executed => "Executed",
            SetState::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}

/// Validate a request length, returning it as the transport's `u32`
pub(crate) fn checked_length(length: usize) -> Result<u32> {
    if length == 0 {
        return Err(ScatterError::invalid_parameter(
            "length",
            "Request length must be greater than zero",
        ));
    }
    match u32::try_from(length) {
        Ok(length) if length <= MAX_REQUEST_LENGTH => Ok(length),
        _ => Err(ScatterError::invalid_parameter(
            "length",
            format!(
                "Request length {} exceeds maximum of {} bytes",
                length, MAX_REQUEST_LENGTH
            ),
        )),
    }
}
