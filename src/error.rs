//! Error type and result codes for the DNS-over-TLS client.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

//------------ Error ----------------------------------------------------------

/// Error type for the DNS-over-TLS client.
#[derive(Clone, Debug)]
pub enum Error {
    /// Octet sequence too short to carry a DNS message ID.
    ShortMessage,

    /// Every ID of the 16 bit ID space is taken by an outstanding query.
    TooManyOutstandingQueries,

    /// The connection or its transport was closed before a response
    /// arrived.
    ConnectionClosed,

    /// The query was sent the maximum number of times without response.
    RetryLimitExceeded,

    /// Setting up the stream socket failed.
    Connect(Arc<io::Error>),

    /// The connection or TLS handshake took too long.
    ConnectTimeout,

    /// The TLS handshake failed, including certificate validation.
    Tls(Arc<io::Error>),

    /// The configured server name is not a valid DNS name.
    InvalidServerName,

    /// The server identity names a protocol we cannot connect with.
    UnsupportedProtocol,

    /// Reading from the stream gave an error.
    StreamReadError(Arc<io::Error>),

    /// Writing to the stream gave an error.
    StreamWriteError(Arc<io::Error>),

    /// The query does not fit into a length prefixed frame.
    LongMessage,

    /// The caller's answer buffer cannot hold the response.
    AnswerTooLarge,
}

impl Error {
    /// Returns the caller facing result code for this error.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Error::ShortMessage | Error::TooManyOutstandingQueries => {
                ResponseCode::InternalError
            }
            Error::AnswerTooLarge => ResponseCode::LimitError,
            _ => ResponseCode::NetworkError,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::ShortMessage => {
                write!(f, "octet sequence too short to be a valid message")
            }
            Error::TooManyOutstandingQueries => {
                write!(f, "too many outstanding queries on transport")
            }
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::RetryLimitExceeded => {
                write!(f, "query retried too often")
            }
            Error::Connect(err) => {
                write!(f, "error connecting to server: {}", err)
            }
            Error::ConnectTimeout => write!(f, "timeout connecting to server"),
            Error::Tls(err) => write!(f, "TLS handshake failed: {}", err),
            Error::InvalidServerName => write!(f, "invalid server name"),
            Error::UnsupportedProtocol => {
                write!(f, "unsupported transport protocol")
            }
            Error::StreamReadError(err) => {
                write!(f, "error reading from stream: {}", err)
            }
            Error::StreamWriteError(err) => {
                write!(f, "error writing to stream: {}", err)
            }
            Error::LongMessage => write!(f, "message too long for stream"),
            Error::AnswerTooLarge => {
                write!(f, "answer buffer too small for response")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Connect(e) => Some(e),
            Error::Tls(e) => Some(e),
            Error::StreamReadError(e) => Some(e),
            Error::StreamWriteError(e) => Some(e),
            _ => None,
        }
    }
}

//------------ ResponseCode ---------------------------------------------------

/// The outcome of a query as reported to the surrounding resolver.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResponseCode {
    /// A response was received and copied to the answer buffer.
    Success,

    /// Connecting, the handshake, sending or receiving failed, or the
    /// query was abandoned.
    NetworkError,

    /// The answer buffer is too small for the response.
    LimitError,

    /// A local resource is exhausted.
    InternalError,
}

impl Display for ResponseCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(match self {
            ResponseCode::Success => "success",
            ResponseCode::NetworkError => "network_error",
            ResponseCode::LimitError => "limit_error",
            ResponseCode::InternalError => "internal_error",
        })
    }
}

//============ Tests =========================================================
