//! Positional argument parsing: `<host> <port> <path>`.

use thiserror::Error;

/// Usage line printed with argument errors.
pub const USAGE: &str = "usage: observe-client <host> <port> <path>";

/// Missing or unusable command-line input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    /// A positional argument is absent or empty.
    #[error("missing {0}")]
    Missing(&'static str),
    /// The port is not a number in 1..=65535.
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    /// More than three arguments.
    #[error("unexpected argument {0:?}")]
    Unexpected(String),
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Resource path to observe
    pub path: String,
}

impl Args {
    /// Parse arguments, excluding the program name.
    pub fn parse<I>(args: I) -> Result<Self, ArgumentError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let host = required(args.next(), "server address")?;
        let port = required(args.next(), "server port")?;
        let path = required(args.next(), "resource path")?;
        if let Some(extra) = args.next() {
            return Err(ArgumentError::Unexpected(extra));
        }

        let port = match port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(ArgumentError::InvalidPort(port)),
        };
        Ok(Self { host, port, path })
    }
}

fn required(value: Option<String>, what: &'static str) -> Result<String, ArgumentError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ArgumentError::Missing(what)),
    }
}
