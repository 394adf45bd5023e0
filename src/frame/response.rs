//! The server-side frames the connection setup and keepalive paths care
//! about. RESULT bodies are deliberately left opaque: the pool only needs
//! to know that a setup statement succeeded.

use std::collections::HashMap;

use num_enum::TryFromPrimitive;

use crate::errors::{DbError, TypeParseError};
use crate::frame::types;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Authenticate(Authenticate),
    Supported(Supported),
    Result,
    Event,
    AuthChallenge,
    AuthSuccess,
}

impl Response {
    pub fn deserialize(
        opcode: ResponseOpcode,
        buf: &mut &[u8],
    ) -> Result<Response, TypeParseError> {
        Ok(match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result,
            ResponseOpcode::Event => Response::Event,
            ResponseOpcode::AuthChallenge => Response::AuthChallenge,
            ResponseOpcode::AuthSuccess => Response::AuthSuccess,
        })
    }

    /// The human-readable name of the response kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Error(_) => "ERROR",
            Response::Ready => "READY",
            Response::Authenticate(_) => "AUTHENTICATE",
            Response::Supported(_) => "SUPPORTED",
            Response::Result => "RESULT",
            Response::Event => "EVENT",
            Response::AuthChallenge => "AUTH_CHALLENGE",
            Response::AuthSuccess => "AUTH_SUCCESS",
        }
    }
}

/// An ERROR response: a numeric code plus a message.
#[derive(Debug)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, TypeParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();
        Ok(Error {
            error: DbError::from_code(code),
            reason,
        })
    }
}

/// The server's supported options, sent in response to OPTIONS. This is
/// where a node describes its shard layout.
#[derive(Debug)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, TypeParseError> {
        let options = types::read_string_multimap(buf)?;
        Ok(Supported { options })
    }
}

/// The server demands authentication with the named authenticator.
#[derive(Debug)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, TypeParseError> {
        let authenticator_name = types::read_string(buf)?.to_owned();
        Ok(Authenticate { authenticator_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn test_error_deserialization() {
        setup_tracing();
        let mut body = Vec::new();
        types::write_int(0x000A, &mut body);
        types::write_string("Invalid or unsupported protocol version", &mut body).unwrap();

        let error = Error::deserialize(&mut &body[..]).unwrap();
        assert_eq!(error.error, DbError::ProtocolError);
        assert_eq!(error.reason, "Invalid or unsupported protocol version");
    }

    #[test]
    fn test_supported_deserialization() {
        setup_tracing();
        let mut options = HashMap::new();
        options.insert("SCYLLA_NR_SHARDS".to_owned(), vec!["4".to_owned()]);
        let mut body = Vec::new();
        types::write_string_multimap(&options, &mut body).unwrap();

        let supported = Supported::deserialize(&mut &body[..]).unwrap();
        assert_eq!(supported.options, options);
    }
}
