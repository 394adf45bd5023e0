//! Just enough of the CQL native protocol (v4) framing to set up
//! connections, keep them alive and ferry opaque request/response bodies.
//! Statement execution, value codecs and result parsing live above this
//! crate and are not its concern.

pub mod request;
pub mod response;
pub mod types;

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::FrameError;
use request::SerializableRequest;
use response::ResponseOpcode;

const HEADER_SIZE: usize = 9;

// Frame flags. Compression is never negotiated by this driver, so the only
// flag it may legitimately see is the warning flag.
const FLAG_COMPRESSION: u8 = 0x01;

/// A request frame serialized into its on-the-wire form, with the stream id
/// patched in right before the frame is written out.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(req: &R) -> Result<SerializedRequest, FrameError> {
        let mut data = vec![0; HEADER_SIZE];
        req.serialize(&mut data)?;

        data[0] = 4; // Version 4 is the only one we speak.
        data[1] = 0; // Flags.
        // Bytes 2-3 are left for the stream id.
        data[4] = R::OPCODE as u8;

        let req_size = (data.len() - HEADER_SIZE) as u32;
        data[5..9].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// Parts of the frame header which are not determined by the
/// request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    if version & 0x7F != 0x04 {
        return Err(FrameError::VersionNotSupported(version & 0x7F));
    }

    let flags = buf.get_u8();
    if flags & FLAG_COMPRESSION != 0 {
        return Err(FrameError::UnexpectedCompressionFlag);
    }
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())
        .map_err(|e| FrameError::UnknownResponseOpcode(e.number))?;

    let length = buf.get_u32() as usize;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

#[cfg(test)]
mod tests {
    use super::request::{Options, Query, Startup};
    use super::{FrameParams, SerializedRequest, read_response_frame};
    use crate::errors::FrameError;
    use crate::frame::response::ResponseOpcode;
    use crate::utils::test_utils::setup_tracing;
    use std::collections::HashMap;

    #[test]
    fn test_request_frame_layout() {
        setup_tracing();
        let mut req = SerializedRequest::make(&Options).unwrap();
        req.set_stream(42);
        let data = req.get_data();
        // version, flags, stream, opcode, length
        assert_eq!(data, [0x04, 0x00, 0x00, 0x2A, 0x05, 0, 0, 0, 0]);

        let startup = Startup {
            options: HashMap::from([("CQL_VERSION".into(), "3.0.0".into())]),
        };
        let req = SerializedRequest::make(&startup).unwrap();
        let data = req.get_data();
        assert_eq!(data[4], 0x01);
        let body_len = u32::from_be_bytes(data[5..9].try_into().unwrap()) as usize;
        assert_eq!(body_len, data.len() - 9);

        let query = Query { contents: "USE ks" };
        let req = SerializedRequest::make(&query).unwrap();
        assert_eq!(req.get_data()[4], 0x07);
    }

    #[tokio::test]
    async fn test_read_response_frame() {
        setup_tracing();
        // READY response on stream 7.
        let frame: &[u8] = &[0x84, 0x00, 0x00, 0x07, 0x02, 0, 0, 0, 0];
        let (params, opcode, body) = read_response_frame(&mut &frame[..]).await.unwrap();
        assert_eq!(
            params,
            FrameParams {
                version: 0x84,
                flags: 0,
                stream: 7
            }
        );
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert!(body.is_empty());

        // A frame sent by a client is rejected.
        let frame: &[u8] = &[0x04, 0x00, 0x00, 0x07, 0x02, 0, 0, 0, 0];
        let err = read_response_frame(&mut &frame[..]).await.unwrap_err();
        assert!(matches!(err, FrameError::FrameFromClient));

        // Unsupported version.
        let frame: &[u8] = &[0x83, 0x00, 0x00, 0x07, 0x02, 0, 0, 0, 0];
        let err = read_response_frame(&mut &frame[..]).await.unwrap_err();
        assert!(matches!(err, FrameError::VersionNotSupported(0x03)));

        // Truncated body.
        let frame: &[u8] = &[0x84, 0x00, 0x00, 0x07, 0x02, 0, 0, 0, 5, 1, 2];
        let err = read_response_frame(&mut &frame[..]).await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed(3, 5)));
    }
}
