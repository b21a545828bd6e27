//! Minimal framed client for talking to a frame-echo server.

use crate::codec::{FrameCodec, FrameReader};
use crate::error::FrameError;
use crate::protocol;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

pub struct FrameClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    codec: FrameCodec,
    out: BytesMut,
}

impl FrameClient {
    /// Connect to `addr`. Requests may be up to `max_frame_size` bytes;
    /// responses may additionally carry the echo prefix.
    pub async fn connect<A: ToSocketAddrs>(addr: A, max_frame_size: usize) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        let response_codec = FrameCodec::new(protocol::max_response_size(max_frame_size));

        Ok(Self {
            reader: FrameReader::new(read_half, response_codec),
            writer,
            codec: FrameCodec::new(max_frame_size),
            out: BytesMut::new(),
        })
    }

    /// Send one request frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        self.out.clear();
        self.codec.encode_into(payload, &mut self.out)?;
        self.writer.write_all(&self.out).await?;
        Ok(())
    }

    /// Send raw bytes, bypassing the encoder.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Receive one response frame; `None` when the server closed cleanly.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, FrameError> {
        self.reader.decode_next().await
    }

    /// Send a request and wait for its response.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Bytes, FrameError> {
        self.send(payload).await?;
        self.recv().await?.ok_or(FrameError::ConnectionClosed)
    }

    /// Half-close the connection; the server sees end of stream.
    pub async fn close(mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
