//! UART link using tokio-serial.
//!
//! A serial frame is whatever arrives before the line goes quiet for the
//! inter-character timeout. When nothing arrives for a whole message timeout
//! the reader reports an idle (empty) frame.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

use super::config::{Parity, SerialConfig, StopBits};
use super::reader::{FrameReader, FrameWriter, Link, TransportReader};
use crate::error::{Result, TransportError};

/// Largest frame handed out by a single read.
pub const MAX_FRAME_BYTES: usize = 8 * 1024;

/// Byte-stream reader splitting input into frames by inter-character gaps.
pub struct ByteReader<R> {
    inner: R,
    buf: BytesMut,
    inter_char_timeout: Duration,
    message_timeout: Duration,
}

impl<R> ByteReader<R> {
    /// Wrap a byte stream.
    pub fn new(inner: R, inter_char_timeout: Duration, message_timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(MAX_FRAME_BYTES),
            inter_char_timeout,
            message_timeout,
        }
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> FrameReader for ByteReader<R> {
    type Frame = Bytes;

    async fn read_frame(&mut self) -> io::Result<Option<Bytes>> {
        if self.buf.is_empty() {
            self.buf.reserve(MAX_FRAME_BYTES);
            match tokio::time::timeout(self.message_timeout, self.inner.read_buf(&mut self.buf))
                .await
            {
                Err(_) => return Ok(Some(Bytes::new())),
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
            }
        }

        // Keep collecting until the line goes quiet
        while self.buf.len() < MAX_FRAME_BYTES {
            self.buf.reserve(MAX_FRAME_BYTES - self.buf.len());
            match tokio::time::timeout(
                self.inter_char_timeout,
                self.inner.read_buf(&mut self.buf),
            )
            .await
            {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
            }
        }

        trace!("serial frame: {} bytes", self.buf.len());
        Ok(Some(self.buf.split().freeze()))
    }
}

/// Byte-stream writer.
pub struct ByteWriter<W> {
    inner: W,
}

impl<W> ByteWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> FrameWriter for ByteWriter<W> {
    type Outgoing = [u8];

    async fn write_frame(&mut self, out: &[u8]) -> io::Result<bool> {
        let mut written = 0;
        while written < out.len() {
            let n = self.inner.write(&out[written..]).await?;
            if n == 0 {
                break;
            }
            written += n;
        }
        self.inner.flush().await?;
        Ok(written == out.len())
    }
}

/// UART link opened through the OS serial driver.
#[derive(Debug)]
pub struct SerialLink;

/// Transport over a UART link.
pub type SerialTransport = TransportReader<SerialLink>;

impl SerialLink {
    fn parity(parity: Parity) -> Result<tokio_serial::Parity> {
        match parity {
            Parity::None => Ok(tokio_serial::Parity::None),
            Parity::Even => Ok(tokio_serial::Parity::Even),
            Parity::Odd => Ok(tokio_serial::Parity::Odd),
            Parity::Mark | Parity::Space => Err(TransportError::InvalidConfig {
                message: format!("parity '{parity}' is not supported by the serial driver"),
            }
            .into()),
        }
    }

    fn stop_bits(stop_bits: StopBits) -> Result<tokio_serial::StopBits> {
        match stop_bits {
            StopBits::One => Ok(tokio_serial::StopBits::One),
            StopBits::Two => Ok(tokio_serial::StopBits::Two),
            StopBits::OnePointFive => Err(TransportError::InvalidConfig {
                message: "1.5 stop bits are not supported by the serial driver".to_string(),
            }
            .into()),
        }
    }
}

impl Link for SerialLink {
    type Params = SerialConfig;
    type Frame = Bytes;
    type Outgoing = [u8];
    type Reader = ByteReader<ReadHalf<SerialStream>>;
    type Writer = ByteWriter<WriteHalf<SerialStream>>;

    fn endpoint(params: &SerialConfig) -> String {
        params.port.clone()
    }

    fn enqueue_frames(params: &SerialConfig) -> bool {
        params.enqueue_frames
    }

    async fn connect(params: &SerialConfig) -> Result<(Self::Reader, Self::Writer)> {
        let connection_error = |source: io::Error| TransportError::Connection {
            endpoint: params.port.clone(),
            source,
        };

        let port = tokio_serial::new(&params.port, params.baud_rate)
            .parity(Self::parity(params.parity)?)
            .stop_bits(Self::stop_bits(params.stop_bits)?)
            .data_bits(tokio_serial::DataBits::Eight)
            .open_native_async()
            .map_err(|e| connection_error(io::Error::other(e)))?;

        port.clear(ClearBuffer::All)
            .map_err(|e| connection_error(io::Error::other(e)))?;

        debug!(
            "opened {} at {} baud ({} parity, {:?} stop bits)",
            params.port, params.baud_rate, params.parity, params.stop_bits
        );

        let (read_half, write_half) = tokio::io::split(port);
        Ok((
            ByteReader::new(read_half, params.inter_char_timeout, params.message_timeout),
            ByteWriter::new(write_half),
        ))
    }
}
