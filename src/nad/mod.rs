//! NAD C338 control protocol
//!
//! The amplifier listens on TCP port 30001 and speaks a line protocol:
//! commands are `<Command><operator>[value]` and the amplifier answers
//! (and spontaneously notifies) with `<Command>=<value>\r\n` lines.

pub mod client;
pub mod protocol;

pub use client::{ClientSettings, NadClient};
pub use protocol::{make_command, parse_part, DeviceState, Operator, Value};

use thiserror::Error;

/// Errors raised by the protocol codec and the TCP client
#[derive(Debug, Error)]
pub enum NadError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid operator '{operator}' for {command}")]
    InvalidOperator { command: String, operator: char },

    #[error("No value provided for {0}")]
    MissingValue(String),

    #[error("Operator '{0}' cannot be called with a value")]
    UnexpectedValue(char),

    #[error("Given value '{value}' is not one of {allowed}")]
    InvalidValue { value: String, allowed: String },

    #[error("Malformed response line: {0:?}")]
    MalformedResponse(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Connection timeout to {0}")]
    ConnectTimeout(String),

    #[error("Connection closed by {0}")]
    ConnectionClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NadResult<T> = std::result::Result<T, NadError>;
