//! Structured per-request server errors.
//!
//! A response marked unsuccessful resolves its callback with a
//! [`ServerError::Response`] carrying the original command, the raw error
//! text, and, when the server follows the "Error processing request. "
//! convention, the parsed message and stack trace with server install paths
//! normalized out.

use regex::Regex;
use thiserror::Error;

use crate::protocol::Response;
use crate::version::ProtocolVersion;

const ERROR_TEXT_PREFIX: &str = "Error processing request. ";

/// Error resolving a single request.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// The server answered the request with a failure response.
    #[error("<{server_id}> server error on '{command}': {}", .server_message.as_deref().unwrap_or(.error_text.as_deref().unwrap_or("unknown error")))]
    Response {
        server_id: String,
        command: String,
        /// Raw `message` field of the failing response.
        error_text: Option<String>,
        /// First line of the parsed error, when the text follows the
        /// server's error-reporting convention.
        server_message: Option<String>,
        /// Normalized stack trace following the message, if any.
        server_stack: Option<String>,
    },

    /// The request could not be written to the transport.
    #[error("<{server_id}> failed to send '{command}': {message}")]
    Write {
        server_id: String,
        command: String,
        message: String,
    },

    /// The process terminated while the request was pending.
    #[error("<{server_id}> {cause}")]
    Terminated { server_id: String, cause: String },

    /// No server in the topology accepts this command.
    #[error("no server accepts command '{command}'")]
    NoServerForCommand { command: String },
}

impl ServerError {
    /// Build a structured error from an unsuccessful response frame.
    pub fn from_response(
        server_id: &str,
        version: ProtocolVersion,
        response: &Response,
    ) -> Self {
        let parsed = response
            .message
            .as_deref()
            .and_then(|text| parse_error_text(version, text));
        let (server_message, server_stack) = match parsed {
            Some((message, stack)) => (Some(message), Some(stack)),
            None => (None, None),
        };
        ServerError::Response {
            server_id: server_id.to_string(),
            command: response.command.clone(),
            error_text: response.message.clone(),
            server_message,
            server_stack,
        }
    }

    pub fn terminated(server_id: &str, cause: &str) -> Self {
        ServerError::Terminated {
            server_id: server_id.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Split "Error processing request. <message>\n<stack>" into its parts.
fn parse_error_text(version: ProtocolVersion, error_text: &str) -> Option<(String, String)> {
    let rest = error_text.strip_prefix(ERROR_TEXT_PREFIX)?;
    let (message, stack) = rest.split_once('\n')?;
    Some((message.to_string(), normalize_stack(version, stack)))
}

/// Replace absolute server install paths in a stack with a stable name so
/// logs from different installs compare equal.
fn normalize_stack(_version: ProtocolVersion, stack: &str) -> String {
    // The stack cites the serving script as "<install dir>/tsserver.js:".
    // Any path ending in the script name collapses to just the script name.
    match Regex::new(r"(?i)[^\s(]+[/\\]tsserver\.js:") {
        Ok(re) => re.replace_all(stack, "tsserver.js:").into_owned(),
        Err(_) => stack.to_string(),
    }
}
