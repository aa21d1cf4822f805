//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for the shuffle writer. Variants are the error
/// kinds callers are expected to distinguish.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RssError {
    /// Connect failure, unreachable address, or broken transport.
    Network(String),

    /// Connect or finish/ack wait exceeded its configured timeout.
    NetworkTimeout(String),

    /// API misuse, e.g. sending records before starting the upload.
    UploadState(String),

    /// A specific replica's write worker failed mid-stream.
    ServerWrite { server: String, msg: String },

    /// Combined result of a fan-out operation, produced only after all
    /// units of work have settled.
    Aggregate(Vec<RssError>),

    /// Anything else (codec, config parsing, task joining, etc.).
    Msg(String),
}

impl RssError {
    pub fn msg(msg: impl ToString) -> Self {
        RssError::Msg(msg.to_string())
    }

    pub fn network(msg: impl ToString) -> Self {
        RssError::Network(msg.to_string())
    }

    pub fn timeout(msg: impl ToString) -> Self {
        RssError::NetworkTimeout(msg.to_string())
    }

    pub fn upload_state(msg: impl ToString) -> Self {
        RssError::UploadState(msg.to_string())
    }

    pub fn server_write(server: impl ToString, msg: impl ToString) -> Self {
        RssError::ServerWrite {
            server: server.to_string(),
            msg: msg.to_string(),
        }
    }

    /// Folds a list of per-unit errors into one. A single error is returned
    /// as-is; an empty list yields `None`.
    pub fn aggregate(mut errors: Vec<RssError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(RssError::Aggregate(errors)),
        }
    }

    /// True for network failures and timeouts, including aggregates made
    /// up only of those.
    pub fn is_network(&self) -> bool {
        match self {
            RssError::Network(_) | RssError::NetworkTimeout(_) => true,
            RssError::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(|e| e.is_network())
            }
            _ => false,
        }
    }

    /// True if this is, or contains, a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            RssError::NetworkTimeout(_) => true,
            RssError::Aggregate(errors) => errors.iter().any(|e| e.is_timeout()),
            _ => false,
        }
    }

    /// Identities of the servers whose write workers failed.
    pub fn failed_servers(&self) -> Vec<&str> {
        match self {
            RssError::ServerWrite { server, .. } => vec![server.as_str()],
            RssError::Aggregate(errors) => {
                errors.iter().flat_map(|e| e.failed_servers()).collect()
            }
            _ => vec![],
        }
    }
}

impl fmt::Display for RssError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RssError::Network(msg) => write!(f, "network error: {}", msg),
            RssError::NetworkTimeout(msg) => {
                write!(f, "network timeout: {}", msg)
            }
            RssError::UploadState(msg) => {
                write!(f, "upload state error: {}", msg)
            }
            RssError::ServerWrite { server, msg } => {
                write!(f, "write to server {} failed: {}", server, msg)
            }
            RssError::Aggregate(errors) => {
                write!(f, "{} failures: [", errors.len())?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            RssError::Msg(msg) => write!(f, "{}", msg), // no literal quotes
        }
    }
}

impl error::Error for RssError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to a `RssError` variant.
macro_rules! impl_from_error {
    ($error:ty => $variant:ident) => {
        impl From<$error> for RssError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                RssError::$variant(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `RssError`.
macro_rules! impl_from_error_generic {
    ($error:ty => $variant:ident) => {
        impl<T> From<$error> for RssError {
            fn from(e: $error) -> RssError {
                RssError::$variant(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error => Network);
impl_from_error!(net::AddrParseError => Network);
impl_from_error!(tokio::time::error::Elapsed => NetworkTimeout);
impl_from_error!(string::FromUtf8Error => Msg);
impl_from_error!(num::ParseIntError => Msg);
impl_from_error!(rmp_serde::encode::Error => Msg);
impl_from_error!(rmp_serde::decode::Error => Msg);
impl_from_error!(toml::ser::Error => Msg);
impl_from_error!(toml::de::Error => Msg);
impl_from_error!(tokio::task::JoinError => Msg);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T> => Msg);
