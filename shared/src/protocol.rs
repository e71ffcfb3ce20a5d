//! TLS record framing constants and header parsing.

/// Record header: content_type(1) + version(2) + length(2)
pub const RECORD_HEADER_LEN: usize = 5;

/// Handshake header: msg_type(1) + length(3)
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// Largest plaintext fragment a record may carry.
pub const MAX_PLAINTEXT: usize = 16384;

/// Largest record payload accepted off the wire (plaintext plus expansion allowance).
pub const MAX_CIPHERTEXT: usize = MAX_PLAINTEXT + 2048;

/// Largest handshake message body accepted.
pub const MAX_HANDSHAKE: usize = 65536;

/// First byte of an SSLv2-framed ClientHello.
pub const SSLV2_MARKER: u8 = 0x80;

/// Record content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl TryFrom<u8> for ContentType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            other => Err(other),
        }
    }
}

/// Handshake message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    NewSessionTicket = 4,
    Certificate = 11,
    ServerKeyExchange = 12,
    CertificateRequest = 13,
    ServerHelloDone = 14,
    CertificateVerify = 15,
    ClientKeyExchange = 16,
    Finished = 20,
}

impl HandshakeType {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeType::HelloRequest => "HelloRequest",
            HandshakeType::ClientHello => "ClientHello",
            HandshakeType::ServerHello => "ServerHello",
            HandshakeType::NewSessionTicket => "NewSessionTicket",
            HandshakeType::Certificate => "Certificate",
            HandshakeType::ServerKeyExchange => "ServerKeyExchange",
            HandshakeType::CertificateRequest => "CertificateRequest",
            HandshakeType::ServerHelloDone => "ServerHelloDone",
            HandshakeType::CertificateVerify => "CertificateVerify",
            HandshakeType::ClientKeyExchange => "ClientKeyExchange",
            HandshakeType::Finished => "Finished",
        }
    }
}

impl TryFrom<u8> for HandshakeType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => HandshakeType::HelloRequest,
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            4 => HandshakeType::NewSessionTicket,
            11 => HandshakeType::Certificate,
            12 => HandshakeType::ServerKeyExchange,
            13 => HandshakeType::CertificateRequest,
            14 => HandshakeType::ServerHelloDone,
            15 => HandshakeType::CertificateVerify,
            16 => HandshakeType::ClientKeyExchange,
            20 => HandshakeType::Finished,
            other => return Err(other),
        })
    }
}

/// Parsed 5-byte record header. The content type is kept raw so that
/// SSLv2 and unknown types can be reported precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub version: u16,
    pub length: usize,
}

impl RecordHeader {
    pub fn parse(data: &[u8; RECORD_HEADER_LEN]) -> Self {
        Self {
            content_type: data[0],
            version: u16::from_be_bytes([data[1], data[2]]),
            length: u16::from_be_bytes([data[3], data[4]]) as usize,
        }
    }
}

/// Size limits applied while reading records and handshake messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_ciphertext: usize,
    pub max_handshake: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_ciphertext: MAX_CIPHERTEXT,
            max_handshake: MAX_HANDSHAKE,
        }
    }
}

/// Decode the 24-bit body length of a handshake header.
pub fn handshake_body_len(header: &[u8]) -> usize {
    ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | (header[3] as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_parse() {
        let header = RecordHeader::parse(&[0x16, 0x03, 0x01, 0x02, 0x00]);
        assert_eq!(header.content_type, ContentType::Handshake as u8);
        assert_eq!(header.version, 0x0301);
        assert_eq!(header.length, 512);
    }

    #[test]
    fn test_content_type_conversion() {
        assert_eq!(ContentType::try_from(22), Ok(ContentType::Handshake));
        assert_eq!(ContentType::try_from(0x80), Err(0x80));
    }

    #[test]
    fn test_handshake_type_conversion() {
        assert_eq!(HandshakeType::try_from(11), Ok(HandshakeType::Certificate));
        assert_eq!(HandshakeType::try_from(3), Err(3));
        assert_eq!(HandshakeType::ServerHello.name(), "ServerHello");
    }

    #[test]
    fn test_handshake_body_len() {
        assert_eq!(handshake_body_len(&[1, 0x01, 0x00, 0x02]), 65538);
    }

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_ciphertext, 18432);
        assert_eq!(limits.max_handshake, 65536);
    }
}
