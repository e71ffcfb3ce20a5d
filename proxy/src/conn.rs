//! Peer connection with raw-byte retention.
//!
//! Every byte read off the socket is appended to `raw` and stays there until
//! `flush_to` forwards it, so a handshake flight can be parsed and then
//! replayed to the other peer byte-for-byte. Handshake record payloads are
//! additionally collected in `hand` until a full message can be decoded.

use l7proxify_shared::handshake::HandshakeMessage;
use l7proxify_shared::protocol::{
    handshake_body_len, ContentType, Limits, RecordHeader, HANDSHAKE_HEADER_LEN,
    RECORD_HEADER_LEN, SSLV2_MARKER,
};
use l7proxify_shared::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub struct PeerConnection<S> {
    stream: S,
    limits: Limits,
    /// Bytes read off the wire and not yet forwarded.
    raw: Vec<u8>,
    /// Handshake payload bytes not yet consumed as a message.
    hand: Vec<u8>,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, limits: Limits) -> Self {
        Self {
            stream,
            limits,
            raw: Vec::new(),
            hand: Vec::new(),
        }
    }

    /// Read one full TLS record, appending it verbatim to the retained buffer.
    pub async fn read_record(&mut self, want: ContentType) -> Result<()> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        read_full(&mut self.stream, &mut header, true).await?;
        self.raw.extend_from_slice(&header);

        let header = RecordHeader::parse(&header);

        // No valid TLS record has a type of 0x80, but an SSLv2 hello starts
        // with a u16 length whose MSB is set.
        if want == ContentType::Handshake && header.content_type == SSLV2_MARKER {
            return Err(Error::UnsupportedSslv2);
        }

        if header.length > self.limits.max_ciphertext {
            return Err(Error::OversizedRecord(header.length));
        }

        debug!(
            typ = header.content_type,
            vers = header.version,
            n = header.length,
            "record"
        );

        let start = self.raw.len();
        self.raw.resize(start + header.length, 0);
        if let Err(e) = read_full(&mut self.stream, &mut self.raw[start..], false).await {
            self.raw.truncate(start);
            return Err(e);
        }

        if header.content_type != want as u8 {
            return Err(Error::UnexpectedRecord {
                want: want as u8,
                got: header.content_type,
            });
        }
        if header.length == 0 {
            return Err(Error::EmptyRecord);
        }

        self.hand.extend_from_slice(&self.raw[start..]);
        Ok(())
    }

    /// Read records until a complete handshake message is buffered and decode it.
    pub async fn read_handshake(&mut self) -> Result<HandshakeMessage> {
        while self.hand.len() < HANDSHAKE_HEADER_LEN {
            self.read_record(ContentType::Handshake).await?;
        }

        let n = handshake_body_len(&self.hand);
        if n > self.limits.max_handshake {
            return Err(Error::OversizedHandshake(n));
        }

        while self.hand.len() < HANDSHAKE_HEADER_LEN + n {
            self.read_record(ContentType::Handshake).await?;
        }

        let msg: Vec<u8> = self.hand.drain(..HANDSHAKE_HEADER_LEN + n).collect();
        HandshakeMessage::decode(msg[0], &msg[HANDSHAKE_HEADER_LEN..])
    }

    /// Write every retained raw byte to `peer`, then clear the buffer.
    pub async fn flush_to<W>(&mut self, peer: &mut W) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let n = self.raw.len();
        peer.write_all(&self.raw).await?;
        peer.flush().await?;
        self.raw.clear();
        Ok(n)
    }

    /// Bytes read but not yet forwarded.
    pub fn buffered(&self) -> usize {
        self.raw.len()
    }

    /// Handshake bytes received past the last decoded message.
    pub fn pending_handshake(&self) -> usize {
        self.hand.len()
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Fill `buf` completely. A clean EOF before the first byte is reported as
/// `ConnectionClosed` when `at_boundary` is set; any other EOF is unexpected.
async fn read_full<R>(reader: &mut R, buf: &mut [u8], at_boundary: bool) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if at_boundary && filled == 0 {
                return Err(Error::ConnectionClosed);
            }
            return Err(Error::UnexpectedEof);
        }
        filled += n;
    }
    Ok(())
}
