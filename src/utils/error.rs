//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for monaxos.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MonaxosError(pub String);

impl MonaxosError {
    /// Makes an error from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        MonaxosError(m.to_string())
    }
}

impl fmt::Display for MonaxosError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for MonaxosError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `MonaxosError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for MonaxosError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                MonaxosError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(bincode::error::EncodeError);
impl_from_error!(bincode::error::DecodeError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);
