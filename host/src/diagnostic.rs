//! Diagnostics and source locations.
//!
//! Kernels receive an opaque [`Location`] token and resolve it through a
//! [`LocationHandler`] only when they actually need to report something, so
//! the happy path never pays for location decoding.

use std::fmt;
use std::sync::Arc;

use crate::async_value::{AsyncValue, ValueRef};

/// A location token resolved to source coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLocation {
    pub filename: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for DecodedLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.line, self.column)
    }
}

/// Resolves opaque location tokens for one program image.
pub trait LocationHandler: Send + Sync {
    fn decode_location(&self, token: u32) -> DecodedLocation;
}

/// An opaque location forwarded to kernels.
///
/// Carries the handler it can be decoded with; a default location has no
/// handler and decodes to nothing.
#[derive(Clone, Default)]
pub struct Location {
    pub handler: Option<Arc<dyn LocationHandler>>,
    pub token: u32,
}

impl Location {
    pub fn new(handler: Arc<dyn LocationHandler>, token: u32) -> Location {
        Location { handler: Some(handler), token }
    }

    pub fn decode(&self) -> Option<DecodedLocation> {
        self.handler.as_ref().map(|handler| handler.decode_location(self.token))
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location").field("token", &self.token).finish()
    }
}

/// Payload of an error-state [`AsyncValue`].
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub location: Option<DecodedLocation>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Diagnostic {
        Diagnostic { location: None, message: message.into() }
    }

    pub fn at(location: DecodedLocation, message: impl Into<String>) -> Diagnostic {
        Diagnostic { location: Some(location), message: message.into() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{location}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Report an error against `location`, producing an error-state value.
pub fn emit_error(location: &Location, message: impl Into<String>) -> ValueRef {
    let diagnostic = match location.decode() {
        Some(decoded) => Diagnostic::at(decoded, message),
        None => Diagnostic::new(message),
    };
    tracing::debug!(%diagnostic, "emitting error value");
    AsyncValue::error(diagnostic)
}
