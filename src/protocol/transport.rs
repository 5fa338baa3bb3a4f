use std::{
    fmt,
    io::{self, IoSlice, Read, Write},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_to_vec,
};
use thiserror::Error;

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_BODY: usize = 128 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("frame body of {0} bytes exceeds the {MAX_FRAME_BODY} byte limit")]
    BodyTooLarge(usize),
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Cancelled,
    InvalidArgument,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
}

/// Outcome of one call, carried back to the client in the trailing frame.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

/// Envelope preceding every frame body on the wire.
///
/// A unary call is one `Call` frame from the client answered by an optional
/// `Message` frame and a closing `Status` frame, all sharing the call id.
#[derive(Debug, Encode, Decode, PartialEq, Eq)]
pub enum FrameHeader {
    Call { id: u64, method: String, len: u32 },
    Message { id: u64, len: u32 },
    Status { id: u64, status: Status },
}

impl FrameHeader {
    fn body_len(&self) -> usize {
        match self {
            FrameHeader::Call { len, .. } | FrameHeader::Message { len, .. } => *len as usize,
            FrameHeader::Status { .. } => 0,
        }
    }
}

#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    config: Configuration<BigEndian, Fixint>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self { stream, config }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_call(
        &mut self,
        id: u64,
        method: &str,
        body: &[IoSlice<'_>],
    ) -> Result<(), TransportError> {
        let len = body_len(body)?;
        self.write_frame(
            FrameHeader::Call {
                id,
                method: method.to_string(),
                len,
            },
            body,
        )
    }

    pub fn write_message(&mut self, id: u64, body: &[IoSlice<'_>]) -> Result<(), TransportError> {
        let len = body_len(body)?;
        self.write_frame(FrameHeader::Message { id, len }, body)
    }

    pub fn write_status(&mut self, id: u64, status: Status) -> Result<(), TransportError> {
        self.write_frame(FrameHeader::Status { id, status }, &[])
    }

    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        let header: FrameHeader = decode_from_std_read(&mut self.stream, self.config)?;
        let len = header.body_len();
        if len > MAX_FRAME_BODY {
            return Err(TransportError::BodyTooLarge(len));
        }

        let mut body = vec![0; len];
        self.stream.read_exact(&mut body)?;
        Ok(Frame { header, body })
    }

    /// Header and body leave in a single vectored write; body fragments are
    /// never copied into an intermediate buffer.
    fn write_frame(
        &mut self,
        header: FrameHeader,
        body: &[IoSlice<'_>],
    ) -> Result<(), TransportError> {
        let header = encode_to_vec(header, self.config)?;
        let mut slices = Vec::with_capacity(body.len() + 1);
        slices.push(IoSlice::new(&header));
        slices.extend(body.iter().filter(|slice| !slice.is_empty()).copied());

        write_all_vectored(&mut self.stream, &mut slices)?;
        self.stream.flush()?;
        Ok(())
    }
}

fn body_len(body: &[IoSlice<'_>]) -> Result<u32, TransportError> {
    let len: usize = body.iter().map(|slice| slice.len()).sum();
    if len > MAX_FRAME_BODY {
        return Err(TransportError::BodyTooLarge(len));
    }
    Ok(len as u32)
}

fn write_all_vectored<W: Write>(writer: &mut W, mut slices: &mut [IoSlice<'_>]) -> io::Result<()> {
    IoSlice::advance_slices(&mut slices, 0);
    while !slices.is_empty() {
        match writer.write_vectored(slices) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole frame",
                ));
            }
            Ok(n) => IoSlice::advance_slices(&mut slices, n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use super::*;

    #[test]
    fn read_write_call() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        let first = [1_u8, 2, 3];
        let second = [4_u8; 5];
        transport
            .write_call(7, "/test/Call", &[IoSlice::new(&first), IoSlice::new(&second)])
            .unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        let frame = transport.read_frame().unwrap();
        assert_eq!(
            frame.header,
            FrameHeader::Call {
                id: 7,
                method: "/test/Call".into(),
                len: 8
            }
        );
        assert_eq!(frame.body, vec![1, 2, 3, 4, 4, 4, 4, 4]);
    }

    #[test]
    fn read_write_reply() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_message(3, &[IoSlice::new(b"pong")]).unwrap();
        transport
            .write_status(3, Status::new(StatusCode::OutOfRange, "past the end"))
            .unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        let message = transport.read_frame().unwrap();
        assert_eq!(message.header, FrameHeader::Message { id: 3, len: 4 });
        assert_eq!(message.body, b"pong");

        let status = transport.read_frame().unwrap();
        assert_eq!(
            status.header,
            FrameHeader::Status {
                id: 3,
                status: Status::new(StatusCode::OutOfRange, "past the end")
            }
        );
        assert!(status.body.is_empty());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);
        transport.write_message(1, &[IoSlice::new(&[9; 16])]).unwrap();

        let mut bytes = transport.stream.into_inner();
        bytes.truncate(bytes.len() - 4);
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        assert!(matches!(transport.read_frame(), Err(TransportError::Io(_))));
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::ok().to_string(), "Ok");
        assert_eq!(
            Status::new(StatusCode::Unavailable, "connection closed").to_string(),
            "Unavailable: connection closed"
        );
    }
}
