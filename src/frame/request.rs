//! The client-side frames of the connection setup and keepalive paths.

use std::collections::HashMap;

use crate::errors::FrameError;
use crate::frame::types;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    AuthResponse = 0x0F,
}

pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), FrameError>;
}

/// Finalises the connection negotiation, carrying the options the client
/// opts into.
pub struct Startup {
    pub options: HashMap<String, String>,
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}

/// Asks the server for its supported options. May be sent before STARTUP,
/// and doubles as the keepalive request on established connections.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), FrameError> {
        Ok(())
    }
}

/// An unprepared statement. The pool itself only ever issues `USE <ks>`,
/// but the frame is generic over its contents.
pub struct Query<'a> {
    pub contents: &'a str,
}

// Consistency ONE; `USE` does not read or write any replica.
const QUERY_CONSISTENCY_ONE: u16 = 0x0001;

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        types::write_long_string(self.contents, buf)?;
        types::write_short(QUERY_CONSISTENCY_ONE, buf);
        buf.push(0); // No query flags - no values, no paging, no timestamps.
        Ok(())
    }
}

/// Answers a server authentication challenge. The only exchange this driver
/// implements is the plain SASL round of PasswordAuthenticator.
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl AuthResponse {
    /// The initial response of the PLAIN SASL mechanism.
    pub fn plain(username: &str, password: &str) -> Self {
        let mut token = Vec::with_capacity(username.len() + password.len() + 2);
        token.push(0);
        token.extend_from_slice(username.as_bytes());
        token.push(0);
        token.extend_from_slice(password.as_bytes());
        Self {
            response: Some(token),
        }
    }
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        types::write_bytes_opt(self.response.as_deref(), buf)?;
        Ok(())
    }
}
