use std::io;

use thiserror::Error;

use crate::{
    dbr::DbrError,
    messages::{ErrorCondition, HandshakeError, MessageError},
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("No server answered the search for {0}")]
    NameNotFound(String),
    #[error("Connection failed: {0}")]
    Connection(#[from] io::Error),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Protocol failure: {0}")]
    Protocol(#[from] MessageError),
    #[error("The circuit to the server was disconnected")]
    Disconnected,
    #[error("Timed out waiting for read response")]
    ChannelReadError,
    #[error("Timed out waiting for write acknowledgement")]
    WriteTimeout,
    #[error("Channel {0} did not connect in time")]
    ConnectTimeout(String),
    #[error("Channel has been closed")]
    ChannelClosed,
    #[error("The client context has been shut down")]
    ContextDisconnected,
    #[error("Server reported failure: {0}")]
    Server(ErrorCondition),
    #[error("Server refused to create channel {0}")]
    ChannelCreateFailed(String),
    #[error("Invalid data: {0}")]
    InvalidData(#[from] DbrError),
}

impl ClientError {
    /// Whether re-issuing the same operation may succeed.
    ///
    /// Local timeouts and lost circuits clear up on their own; operations on a closed
    /// channel or torn-down context never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::NameNotFound(_)
            | ClientError::Connection(_)
            | ClientError::Handshake(_)
            | ClientError::Disconnected
            | ClientError::ChannelReadError
            | ClientError::WriteTimeout
            | ClientError::ConnectTimeout(_) => true,
            ClientError::Server(condition) => matches!(
                condition,
                ErrorCondition::Timeout | ErrorCondition::Disconn | ErrorCondition::AllocMem
            ),
            ClientError::Protocol(_)
            | ClientError::ChannelClosed
            | ClientError::ContextDisconnected
            | ClientError::ChannelCreateFailed(_)
            | ClientError::InvalidData(_) => false,
        }
    }
}
