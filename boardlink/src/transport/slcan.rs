//! CAN link through a network-attached SLCAN adapter.
//!
//! The adapter speaks the Lawicel ASCII protocol over TCP: every command and
//! every received frame is one line terminated by `\r`. The adapter answers
//! commands with `\r` (accepted), `z`/`Z` (frame queued) or BEL (rejected).

use std::fmt;
use std::fmt::Write as _;
use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::config::CanConfig;
use super::reader::{FrameReader, FrameWriter, Link, LinkFrame, TransportReader};
use crate::error::{DecodeError, Result, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BELL: u8 = 0x07;
const MAX_STANDARD_ID: u32 = 0x7FF;
const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// One CAN 2.0 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration id.
    pub id: u32,

    /// Whether `id` is a 29-bit extended id.
    pub extended: bool,

    /// Remote transmission request.
    pub remote: bool,

    /// Payload; for remote frames only the length is meaningful.
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a data frame with a standard id.
    pub fn new(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            extended: false,
            remote: false,
            data: data.into(),
        }
    }

    /// Create a data frame with an extended id.
    pub fn extended(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            extended: true,
            ..Self::new(id, data)
        }
    }

    /// Encode as one SLCAN transmit command, including the trailing `\r`.
    pub fn to_slcan(&self) -> io::Result<String> {
        let max_id = if self.extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if self.id > max_id {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("CAN id {:#x} out of range", self.id),
            ));
        }
        if self.data.len() > 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("CAN payload of {} bytes exceeds 8", self.data.len()),
            ));
        }

        let command = match (self.extended, self.remote) {
            (false, false) => 't',
            (true, false) => 'T',
            (false, true) => 'r',
            (true, true) => 'R',
        };

        let mut line = String::with_capacity(1 + 8 + 1 + 16 + 1);
        line.push(command);
        if self.extended {
            let _ = write!(line, "{:08X}", self.id);
        } else {
            let _ = write!(line, "{:03X}", self.id);
        }
        let _ = write!(line, "{:X}", self.data.len());
        if !self.remote {
            for byte in &self.data {
                let _ = write!(line, "{byte:02X}");
            }
        }
        line.push('\r');
        Ok(line)
    }

    /// Decode one adapter line (without its terminator).
    ///
    /// Acknowledgements and other non-frame replies decode to `Ok(None)`.
    pub fn from_slcan(line: &[u8]) -> std::result::Result<Option<Self>, DecodeError> {
        let (extended, remote) = match line.first() {
            Some(b't') => (false, false),
            Some(b'T') => (true, false),
            Some(b'r') => (false, true),
            Some(b'R') => (true, true),
            _ => return Ok(None),
        };

        let text = std::str::from_utf8(line)
            .map_err(|_| DecodeError::new("SLCAN frame", String::from_utf8_lossy(line)))?;
        let malformed = || DecodeError::new("SLCAN frame", text);

        let id_len = if extended { 8 } else { 3 };
        let id = text
            .get(1..1 + id_len)
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .ok_or_else(malformed)?;
        let dlc = text
            .get(1 + id_len..2 + id_len)
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .filter(|dlc| *dlc <= 8)
            .ok_or_else(malformed)?;

        let max_id = if extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if id > max_id {
            return Err(malformed());
        }

        let payload = &text[2 + id_len..];
        let data = if remote {
            if !payload.is_empty() {
                return Err(malformed());
            }
            vec![0; dlc]
        } else {
            if payload.len() != dlc * 2 || !payload.is_ascii() {
                return Err(malformed());
            }
            (0..dlc)
                .map(|i| u8::from_str_radix(&payload[i * 2..i * 2 + 2], 16))
                .collect::<std::result::Result<Vec<u8>, _>>()
                .map_err(|_| malformed())?
        };

        Ok(Some(Self {
            id,
            extended,
            remote,
            data,
        }))
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        if self.remote {
            write!(f, " [{}] remote", self.data.len())
        } else {
            write!(f, " [{}]", self.data.len())?;
            for byte in &self.data {
                write!(f, " {byte:02X}")?;
            }
            Ok(())
        }
    }
}

impl LinkFrame for CanFrame {}

/// SLCAN setup command selecting a bit rate.
fn bitrate_command(bit_rate: u32) -> Option<&'static str> {
    let command = match bit_rate {
        10_000 => "S0\r",
        20_000 => "S1\r",
        50_000 => "S2\r",
        100_000 => "S3\r",
        125_000 => "S4\r",
        250_000 => "S5\r",
        500_000 => "S6\r",
        800_000 => "S7\r",
        1_000_000 => "S8\r",
        _ => return None,
    };
    Some(command)
}

/// Receiving half of an SLCAN link.
pub struct SlcanReader {
    inner: OwnedReadHalf,
    buf: BytesMut,
    poll_timeout: Duration,
}

impl SlcanReader {
    /// Pop the next complete line from the buffer and decode it.
    ///
    /// Returns `None` when no complete frame line is buffered.
    fn next_buffered(&mut self) -> Option<CanFrame> {
        while let Some(pos) = memchr::memchr2(b'\r', BELL, &self.buf) {
            let terminator = self.buf[pos];
            let line = self.buf.split_to(pos);
            self.buf.advance(1);

            if terminator == BELL {
                warn!("SLCAN adapter rejected a command");
                continue;
            }
            match CanFrame::from_slcan(&line) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => trace!("SLCAN reply {:?}", String::from_utf8_lossy(&line)),
                Err(e) => warn!("{}", e),
            }
        }
        None
    }
}

impl FrameReader for SlcanReader {
    type Frame = CanFrame;

    async fn read_frame(&mut self) -> io::Result<Option<CanFrame>> {
        loop {
            if let Some(frame) = self.next_buffered() {
                return Ok(Some(frame));
            }

            self.buf.reserve(256);
            match tokio::time::timeout(self.poll_timeout, self.inner.read_buf(&mut self.buf)).await
            {
                Err(_) => trace!("no CAN traffic for {:?}", self.poll_timeout),
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

/// Sending half of an SLCAN link.
pub struct SlcanWriter {
    inner: OwnedWriteHalf,
}

impl FrameWriter for SlcanWriter {
    type Outgoing = CanFrame;

    async fn write_frame(&mut self, frame: &CanFrame) -> io::Result<bool> {
        let line = frame.to_slcan()?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(true)
    }
}

/// CAN link through a SLCAN adapter reachable over TCP.
#[derive(Debug)]
pub struct SlcanLink;

/// Transport over a SLCAN adapter.
pub type CanTransport = TransportReader<SlcanLink>;

impl Link for SlcanLink {
    type Params = CanConfig;
    type Frame = CanFrame;
    type Outgoing = CanFrame;
    type Reader = SlcanReader;
    type Writer = SlcanWriter;

    fn endpoint(params: &CanConfig) -> String {
        params.endpoint.clone()
    }

    fn enqueue_frames(params: &CanConfig) -> bool {
        params.enqueue_frames
    }

    async fn connect(params: &CanConfig) -> Result<(SlcanReader, SlcanWriter)> {
        let connection_error = |source: io::Error| TransportError::Connection {
            endpoint: params.endpoint.clone(),
            source,
        };

        let bitrate = bitrate_command(params.bit_rate).ok_or_else(|| {
            TransportError::InvalidConfig {
                message: format!("unsupported CAN bit rate {}", params.bit_rate),
            }
        })?;

        let mut stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(params.socket_addr()),
        )
        .await
        .map_err(|_| {
            connection_error(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no answer within {CONNECT_TIMEOUT:?}"),
            ))
        })?
        .map_err(connection_error)?;
        stream.set_nodelay(true).map_err(connection_error)?;

        // Close any open channel, select the bit rate, then open
        for command in ["C\r", bitrate, "O\r"] {
            stream
                .write_all(command.as_bytes())
                .await
                .map_err(connection_error)?;
        }
        stream.flush().await.map_err(connection_error)?;

        debug!(
            "SLCAN channel open on {} at {} bit/s",
            params.endpoint, params.bit_rate
        );

        let (read_half, write_half) = stream.into_split();
        Ok((
            SlcanReader {
                inner: read_half,
                buf: BytesMut::with_capacity(1024),
                poll_timeout: params.message_timeout,
            },
            SlcanWriter { inner: write_half },
        ))
    }
}

impl TransportReader<SlcanLink> {
    /// Send a data frame with the given id and payload.
    pub async fn send_message(&self, id: u32, payload: &[u8], extended: bool) -> Result<bool> {
        let frame = if extended {
            CanFrame::extended(id, payload)
        } else {
            CanFrame::new(id, payload)
        };
        self.send(&frame).await
    }
}
