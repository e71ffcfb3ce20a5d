//! Handshake message codec.
//!
//! Decodes the handshake messages the proxy has to look at while routing
//! (ClientHello, ServerHello, Certificate, Finished) and re-encodes
//! ClientHello, ServerHello and Certificate messages. Decoding is strict about
//! lengths: every declared length must match the bytes actually consumed.
//! Extensions the codec does not model are skipped by their declared length.
//!
//! References:
//! - https://datatracker.ietf.org/doc/html/rfc5246#section-7.4 (handshake)
//! - https://datatracker.ietf.org/doc/html/rfc6066#section-3 (server_name)
//! - https://datatracker.ietf.org/doc/html/rfc7301 (ALPN)

use crate::protocol::HandshakeType;
use crate::{Error, Result};

// Extension types
pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_STATUS_REQUEST: u16 = 0x0005;
pub const EXT_SUPPORTED_CURVES: u16 = 0x000a;
pub const EXT_SUPPORTED_POINTS: u16 = 0x000b;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
pub const EXT_ALPN: u16 = 0x0010;
pub const EXT_SCT: u16 = 0x0012;
pub const EXT_SESSION_TICKET: u16 = 0x0023;
pub const EXT_NEXT_PROTO_NEG: u16 = 0x3374;
pub const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

/// TLS_EMPTY_RENEGOTIATION_INFO_SCSV
pub const SCSV_RENEGOTIATION: u16 = 0x00ff;

const STATUS_TYPE_OCSP: u8 = 1;
const NAME_TYPE_HOST: u8 = 0;
const MAX_SESSION_ID: usize = 32;

/// A (hash, signature) algorithm pair from the signature_algorithms extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureAndHash {
    pub hash: u8,
    pub signature: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    /// Host name from the server_name extension, if the client sent one.
    pub server_name: Option<String>,
    /// ALPN protocol ids, kept as opaque bytes.
    pub alpn_protocols: Vec<Vec<u8>>,
    pub supported_curves: Vec<u16>,
    pub supported_points: Vec<u8>,
    pub signature_algorithms: Vec<SignatureAndHash>,
    pub ticket_supported: bool,
    pub session_ticket: Vec<u8>,
    pub secure_renegotiation: bool,
    pub ocsp_stapling: bool,
    pub next_proto_neg: bool,
    pub scts: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHello {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub ocsp_stapling: bool,
    pub ticket_supported: bool,
    pub secure_renegotiation: bool,
    pub alpn_protocol: Option<Vec<u8>>,
}

/// DER certificates, leaf first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Certificate {
    pub certificates: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: Vec<u8>,
}

/// The handshake messages the proxy understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    Certificate(Certificate),
    Finished(Finished),
}

impl HandshakeMessage {
    /// Decode a handshake body according to its message type byte.
    pub fn decode(msg_type: u8, body: &[u8]) -> Result<Self> {
        match HandshakeType::try_from(msg_type) {
            Ok(HandshakeType::ClientHello) => ClientHello::decode(body).map(Self::ClientHello),
            Ok(HandshakeType::ServerHello) => ServerHello::decode(body).map(Self::ServerHello),
            Ok(HandshakeType::Certificate) => Certificate::decode(body).map(Self::Certificate),
            Ok(HandshakeType::Finished) => Ok(Self::Finished(Finished {
                verify_data: body.to_vec(),
            })),
            _ => Err(Error::UnknownMessage(msg_type)),
        }
    }

    pub fn handshake_type(&self) -> HandshakeType {
        match self {
            HandshakeMessage::ClientHello(_) => HandshakeType::ClientHello,
            HandshakeMessage::ServerHello(_) => HandshakeType::ServerHello,
            HandshakeMessage::Certificate(_) => HandshakeType::Certificate,
            HandshakeMessage::Finished(_) => HandshakeType::Finished,
        }
    }

    pub fn name(&self) -> &'static str {
        self.handshake_type().name()
    }
}

impl ClientHello {
    pub fn decode(body: &[u8]) -> Result<Self> {
        parse_client_hello(body).ok_or(Error::Malformed("ClientHello"))
    }

    /// Encode as a complete handshake message, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.session_id.len() > MAX_SESSION_ID {
            return Err(Error::Encode("session id longer than 32 bytes"));
        }

        let mut extensions = Vec::new();
        if self.next_proto_neg {
            put_extension(&mut extensions, EXT_NEXT_PROTO_NEG, &[])?;
        }
        if let Some(name) = &self.server_name {
            let name_len = u16_len(name.len())?;
            let mut data = Vec::with_capacity(name.len() + 5);
            put_u16(&mut data, u16_len(name.len() + 3)?);
            data.push(NAME_TYPE_HOST);
            put_u16(&mut data, name_len);
            data.extend_from_slice(name.as_bytes());
            put_extension(&mut extensions, EXT_SERVER_NAME, &data)?;
        }
        if self.ocsp_stapling {
            // status_type, then empty responder_id_list and request_extensions
            put_extension(&mut extensions, EXT_STATUS_REQUEST, &[STATUS_TYPE_OCSP, 0, 0, 0, 0])?;
        }
        if !self.supported_curves.is_empty() {
            let mut data = Vec::with_capacity(2 + 2 * self.supported_curves.len());
            put_u16(&mut data, u16_len(2 * self.supported_curves.len())?);
            for curve in &self.supported_curves {
                put_u16(&mut data, *curve);
            }
            put_extension(&mut extensions, EXT_SUPPORTED_CURVES, &data)?;
        }
        if !self.supported_points.is_empty() {
            let len = u8::try_from(self.supported_points.len())
                .map_err(|_| Error::Encode("too many point formats"))?;
            let mut data = Vec::with_capacity(1 + self.supported_points.len());
            data.push(len);
            data.extend_from_slice(&self.supported_points);
            put_extension(&mut extensions, EXT_SUPPORTED_POINTS, &data)?;
        }
        if self.ticket_supported {
            put_extension(&mut extensions, EXT_SESSION_TICKET, &self.session_ticket)?;
        }
        if !self.signature_algorithms.is_empty() {
            let mut data = Vec::with_capacity(2 + 2 * self.signature_algorithms.len());
            put_u16(&mut data, u16_len(2 * self.signature_algorithms.len())?);
            for pair in &self.signature_algorithms {
                data.push(pair.hash);
                data.push(pair.signature);
            }
            put_extension(&mut extensions, EXT_SIGNATURE_ALGORITHMS, &data)?;
        }
        if self.secure_renegotiation {
            put_extension(&mut extensions, EXT_RENEGOTIATION_INFO, &[0])?;
        }
        if !self.alpn_protocols.is_empty() {
            let mut list = Vec::new();
            for proto in &self.alpn_protocols {
                if proto.is_empty() || proto.len() > 255 {
                    return Err(Error::Encode("invalid ALPN protocol name length"));
                }
                list.push(proto.len() as u8);
                list.extend_from_slice(proto);
            }
            let mut data = Vec::with_capacity(2 + list.len());
            put_u16(&mut data, u16_len(list.len())?);
            data.extend_from_slice(&list);
            put_extension(&mut extensions, EXT_ALPN, &data)?;
        }
        if self.scts {
            put_extension(&mut extensions, EXT_SCT, &[])?;
        }

        let mut body = Vec::with_capacity(
            2 + 32 + 1 + self.session_id.len() + 2 + 2 * self.cipher_suites.len() + 1
                + self.compression_methods.len()
                + 2
                + extensions.len(),
        );
        put_u16(&mut body, self.version);
        body.extend_from_slice(&self.random);
        body.push(self.session_id.len() as u8);
        body.extend_from_slice(&self.session_id);
        put_u16(&mut body, u16_len(2 * self.cipher_suites.len())?);
        for suite in &self.cipher_suites {
            put_u16(&mut body, *suite);
        }
        body.push(
            u8::try_from(self.compression_methods.len())
                .map_err(|_| Error::Encode("too many compression methods"))?,
        );
        body.extend_from_slice(&self.compression_methods);
        if !extensions.is_empty() {
            put_u16(&mut body, u16_len(extensions.len())?);
            body.extend_from_slice(&extensions);
        }

        frame(HandshakeType::ClientHello, body)
    }

    /// The server name, treating an empty name the same as a missing one.
    pub fn sni(&self) -> Option<&str> {
        self.server_name.as_deref().filter(|name| !name.is_empty())
    }
}

impl ServerHello {
    pub fn decode(body: &[u8]) -> Result<Self> {
        parse_server_hello(body).ok_or(Error::Malformed("ServerHello"))
    }

    /// Encode as a complete handshake message, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.session_id.len() > MAX_SESSION_ID {
            return Err(Error::Encode("session id longer than 32 bytes"));
        }

        let mut extensions = Vec::new();
        if self.ocsp_stapling {
            put_extension(&mut extensions, EXT_STATUS_REQUEST, &[])?;
        }
        if self.ticket_supported {
            put_extension(&mut extensions, EXT_SESSION_TICKET, &[])?;
        }
        if self.secure_renegotiation {
            put_extension(&mut extensions, EXT_RENEGOTIATION_INFO, &[0])?;
        }
        if let Some(proto) = &self.alpn_protocol {
            if proto.is_empty() || proto.len() > 255 {
                return Err(Error::Encode("invalid ALPN protocol name length"));
            }
            let mut data = Vec::with_capacity(3 + proto.len());
            put_u16(&mut data, (proto.len() + 1) as u16);
            data.push(proto.len() as u8);
            data.extend_from_slice(proto);
            put_extension(&mut extensions, EXT_ALPN, &data)?;
        }

        let mut body = Vec::with_capacity(2 + 32 + 1 + self.session_id.len() + 3 + 2 + extensions.len());
        put_u16(&mut body, self.version);
        body.extend_from_slice(&self.random);
        body.push(self.session_id.len() as u8);
        body.extend_from_slice(&self.session_id);
        put_u16(&mut body, self.cipher_suite);
        body.push(self.compression_method);
        if !extensions.is_empty() {
            put_u16(&mut body, u16_len(extensions.len())?);
            body.extend_from_slice(&extensions);
        }

        frame(HandshakeType::ServerHello, body)
    }
}

impl Certificate {
    pub fn decode(body: &[u8]) -> Result<Self> {
        parse_certificate(body).ok_or(Error::Malformed("Certificate"))
    }

    /// Encode as a complete handshake message, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total: usize = self.certificates.iter().map(|c| 3 + c.len()).sum();
        let mut body = Vec::with_capacity(3 + total);
        put_u24(&mut body, total)?;
        for cert in &self.certificates {
            put_u24(&mut body, cert.len())?;
            body.extend_from_slice(cert);
        }
        frame(HandshakeType::Certificate, body)
    }
}

fn parse_client_hello(body: &[u8]) -> Option<ClientHello> {
    let mut r = Reader::new(body);

    let mut hello = ClientHello {
        version: r.u16()?,
        random: r.take(32)?.try_into().ok()?,
        ..Default::default()
    };

    let session_id_len = r.u8()? as usize;
    if session_id_len > MAX_SESSION_ID {
        return None;
    }
    hello.session_id = r.take(session_id_len)?.to_vec();

    // Cipher suites are u16s, so the byte count must be even.
    let suites_len = r.u16()? as usize;
    if suites_len % 2 == 1 {
        return None;
    }
    let mut suites = r.sub(suites_len)?;
    while !suites.is_empty() {
        let suite = suites.u16()?;
        if suite == SCSV_RENEGOTIATION {
            hello.secure_renegotiation = true;
        }
        hello.cipher_suites.push(suite);
    }

    let compression_len = r.u8()? as usize;
    hello.compression_methods = r.take(compression_len)?.to_vec();

    // Extensions are optional.
    if r.is_empty() {
        return Some(hello);
    }

    let extensions_len = r.u16()? as usize;
    if extensions_len != r.remaining() {
        return None;
    }

    while !r.is_empty() {
        let ext_type = r.u16()?;
        let length = r.u16()? as usize;
        let mut ext = r.sub(length)?;

        match ext_type {
            EXT_SERVER_NAME => {
                let names_len = ext.u16()? as usize;
                if names_len != ext.remaining() {
                    return None;
                }
                while !ext.is_empty() {
                    let name_type = ext.u8()?;
                    let name_len = ext.u16()? as usize;
                    let name = ext.take(name_len)?;
                    if name_type == NAME_TYPE_HOST {
                        hello.server_name = Some(String::from_utf8(name.to_vec()).ok()?);
                        break;
                    }
                }
            }
            EXT_NEXT_PROTO_NEG => {
                if length > 0 {
                    return None;
                }
                hello.next_proto_neg = true;
            }
            EXT_STATUS_REQUEST => {
                hello.ocsp_stapling = ext.u8() == Some(STATUS_TYPE_OCSP);
            }
            EXT_SUPPORTED_CURVES => {
                let l = ext.u16()? as usize;
                if l % 2 == 1 || l != ext.remaining() {
                    return None;
                }
                hello.supported_curves.clear();
                while !ext.is_empty() {
                    hello.supported_curves.push(ext.u16()?);
                }
            }
            EXT_SUPPORTED_POINTS => {
                let l = ext.u8()? as usize;
                if l != ext.remaining() {
                    return None;
                }
                hello.supported_points = ext.take(l)?.to_vec();
            }
            EXT_SESSION_TICKET => {
                hello.ticket_supported = true;
                hello.session_ticket = ext.take(length)?.to_vec();
            }
            EXT_SIGNATURE_ALGORITHMS => {
                if length < 2 || length % 2 != 0 {
                    return None;
                }
                let l = ext.u16()? as usize;
                if l != length - 2 {
                    return None;
                }
                hello.signature_algorithms.clear();
                while !ext.is_empty() {
                    hello.signature_algorithms.push(SignatureAndHash {
                        hash: ext.u8()?,
                        signature: ext.u8()?,
                    });
                }
            }
            EXT_RENEGOTIATION_INFO => {
                if length != 1 || ext.u8()? != 0 {
                    return None;
                }
                hello.secure_renegotiation = true;
            }
            EXT_ALPN => {
                if length < 2 {
                    return None;
                }
                let l = ext.u16()? as usize;
                if l != length - 2 {
                    return None;
                }
                while !ext.is_empty() {
                    let proto_len = ext.u8()? as usize;
                    if proto_len == 0 {
                        return None;
                    }
                    let proto = ext.take(proto_len)?;
                    hello.alpn_protocols.push(proto.to_vec());
                }
            }
            EXT_SCT => {
                if length != 0 {
                    return None;
                }
                hello.scts = true;
            }
            _ => {}
        }
    }

    Some(hello)
}

fn parse_server_hello(body: &[u8]) -> Option<ServerHello> {
    let mut r = Reader::new(body);

    let mut hello = ServerHello {
        version: r.u16()?,
        random: r.take(32)?.try_into().ok()?,
        ..Default::default()
    };

    let session_id_len = r.u8()? as usize;
    if session_id_len > MAX_SESSION_ID {
        return None;
    }
    hello.session_id = r.take(session_id_len)?.to_vec();
    hello.cipher_suite = r.u16()?;
    hello.compression_method = r.u8()?;

    if r.is_empty() {
        return Some(hello);
    }

    let extensions_len = r.u16()? as usize;
    if extensions_len != r.remaining() {
        return None;
    }

    while !r.is_empty() {
        let ext_type = r.u16()?;
        let length = r.u16()? as usize;
        let mut ext = r.sub(length)?;

        match ext_type {
            EXT_STATUS_REQUEST => {
                if length > 0 {
                    return None;
                }
                hello.ocsp_stapling = true;
            }
            EXT_SESSION_TICKET => {
                if length > 0 {
                    return None;
                }
                hello.ticket_supported = true;
            }
            EXT_RENEGOTIATION_INFO => {
                let l = ext.u8()? as usize;
                if l != ext.remaining() {
                    return None;
                }
                hello.secure_renegotiation = true;
            }
            EXT_ALPN => {
                let l = ext.u16()? as usize;
                if l != ext.remaining() {
                    return None;
                }
                let proto_len = ext.u8()? as usize;
                if proto_len == 0 || proto_len != ext.remaining() {
                    return None;
                }
                let proto = ext.take(proto_len)?;
                hello.alpn_protocol = Some(proto.to_vec());
            }
            _ => {}
        }
    }

    Some(hello)
}

fn parse_certificate(body: &[u8]) -> Option<Certificate> {
    let mut r = Reader::new(body);

    let certs_len = r.u24()?;
    if certs_len != r.remaining() {
        return None;
    }

    let mut certificates = Vec::new();
    while !r.is_empty() {
        let cert_len = r.u24()?;
        certificates.push(r.take(cert_len)?.to_vec());
    }

    Some(Certificate { certificates })
}

/// Bounds-checked big-endian cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    /// Split off the next `n` bytes as their own reader.
    fn sub(&mut self, n: usize) -> Option<Reader<'a>> {
        self.take(n).map(Reader::new)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u24(out: &mut Vec<u8>, value: usize) -> Result<()> {
    if value > 0xff_ffff {
        return Err(Error::Encode("length exceeds 24 bits"));
    }
    out.extend_from_slice(&[(value >> 16) as u8, (value >> 8) as u8, value as u8]);
    Ok(())
}

fn u16_len(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::Encode("length exceeds 16 bits"))
}

fn put_extension(out: &mut Vec<u8>, ext_type: u16, data: &[u8]) -> Result<()> {
    put_u16(out, ext_type);
    put_u16(out, u16_len(data.len())?);
    out.extend_from_slice(data);
    Ok(())
}

fn frame(msg_type: HandshakeType, body: Vec<u8>) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.push(msg_type as u8);
    put_u24(&mut out, body.len())?;
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client_hello() -> ClientHello {
        ClientHello {
            version: 0x0303,
            random: [7u8; 32],
            session_id: vec![1, 2, 3, 4],
            cipher_suites: vec![0xc02f, 0xc030, SCSV_RENEGOTIATION],
            compression_methods: vec![0],
            server_name: Some("example.com".to_string()),
            alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            supported_curves: vec![0x001d, 0x0017],
            supported_points: vec![0],
            signature_algorithms: vec![
                SignatureAndHash { hash: 4, signature: 1 },
                SignatureAndHash { hash: 4, signature: 3 },
            ],
            ticket_supported: true,
            session_ticket: vec![9, 9, 9],
            secure_renegotiation: true,
            ocsp_stapling: true,
            next_proto_neg: true,
            scts: true,
        }
    }

    fn body(msg: &[u8]) -> &[u8] {
        &msg[4..]
    }

    #[test]
    fn test_client_hello_round_trip() {
        let hello = sample_client_hello();
        let encoded = hello.encode().unwrap();
        assert_eq!(encoded[0], HandshakeType::ClientHello as u8);
        assert_eq!(crate::protocol::handshake_body_len(&encoded), encoded.len() - 4);

        let decoded = ClientHello::decode(body(&encoded)).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn test_client_hello_without_extensions() {
        let hello = ClientHello {
            version: 0x0301,
            cipher_suites: vec![0x002f],
            compression_methods: vec![0],
            ..Default::default()
        };
        let encoded = hello.encode().unwrap();
        // version + random + sid len + suites + compression
        assert_eq!(encoded.len(), 4 + 2 + 32 + 1 + 4 + 2);

        let decoded = ClientHello::decode(body(&encoded)).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(decoded.sni(), None);
    }

    #[test]
    fn test_unknown_extension_skipped() {
        let hello = ClientHello {
            version: 0x0303,
            cipher_suites: vec![0x1301],
            compression_methods: vec![0],
            server_name: Some("example.com".to_string()),
            ..Default::default()
        };
        let encoded = hello.encode().unwrap();
        let mut raw = body(&encoded).to_vec();

        // Append supported_versions (0x002b) and fix up the extensions length.
        let unknown = [0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04];
        let ext_start = 2 + 32 + 1 + 2 + 2 + 2;
        let ext_len = u16::from_be_bytes([raw[ext_start], raw[ext_start + 1]]) as usize + unknown.len();
        raw[ext_start..ext_start + 2].copy_from_slice(&(ext_len as u16).to_be_bytes());
        raw.extend_from_slice(&unknown);

        let decoded = ClientHello::decode(&raw).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn test_truncated_client_hello_rejected() {
        let encoded = sample_client_hello().encode().unwrap();
        let raw = body(&encoded);
        for cut in [1, 10, 40, raw.len() - 1] {
            assert!(matches!(
                ClientHello::decode(&raw[..raw.len() - cut]),
                Err(Error::Malformed("ClientHello"))
            ));
        }
    }

    #[test]
    fn test_extension_length_mismatch_rejected() {
        let hello = ClientHello {
            version: 0x0303,
            cipher_suites: vec![0x1301],
            compression_methods: vec![0],
            server_name: Some("a.example".to_string()),
            ..Default::default()
        };
        let encoded = hello.encode().unwrap();
        let mut raw = body(&encoded).to_vec();

        // server_name list length is the first field after the extension header.
        let list_len_at = 2 + 32 + 1 + 2 + 2 + 2 + 2 + 4;
        raw[list_len_at + 1] += 1;
        assert!(ClientHello::decode(&raw).is_err());
    }

    #[test]
    fn test_odd_cipher_suite_length_rejected() {
        let mut raw = vec![0x03, 0x03];
        raw.extend_from_slice(&[0u8; 32]);
        raw.push(0);
        raw.extend_from_slice(&[0x00, 0x03, 0x00, 0x2f, 0x00]);
        raw.extend_from_slice(&[0x01, 0x00]);
        assert!(ClientHello::decode(&raw).is_err());
    }

    #[test]
    fn test_oversized_session_id_rejected() {
        let mut raw = vec![0x03, 0x03];
        raw.extend_from_slice(&[0u8; 32]);
        raw.push(33);
        raw.extend_from_slice(&[0u8; 33]);
        raw.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f, 0x01, 0x00]);
        assert!(ClientHello::decode(&raw).is_err());
    }

    #[test]
    fn test_empty_server_name() {
        let hello = ClientHello {
            version: 0x0303,
            cipher_suites: vec![0x1301],
            compression_methods: vec![0],
            server_name: Some(String::new()),
            ..Default::default()
        };
        let decoded = ClientHello::decode(body(&hello.encode().unwrap())).unwrap();
        assert_eq!(decoded.server_name.as_deref(), Some(""));
        assert_eq!(decoded.sni(), None);
    }

    #[test]
    fn test_invalid_alpn_not_encoded() {
        let hello = ClientHello {
            alpn_protocols: vec![Vec::new()],
            ..Default::default()
        };
        assert!(matches!(hello.encode(), Err(Error::Encode(_))));
    }

    #[test]
    fn test_binary_alpn_ids_preserved() {
        let hello = ClientHello {
            alpn_protocols: vec![vec![0xff, 0xfe], b"http/1.1".to_vec()],
            ..sample_client_hello()
        };
        let encoded = hello.encode().unwrap();
        let decoded = ClientHello::decode(body(&encoded)).unwrap();
        assert_eq!(decoded.alpn_protocols[0], vec![0xff, 0xfe]);
        assert_eq!(decoded.encode().unwrap(), encoded);

        let server = ServerHello {
            version: 0x0303,
            alpn_protocol: Some(vec![0x80]),
            ..Default::default()
        };
        let encoded = server.encode().unwrap();
        let decoded = ServerHello::decode(body(&encoded)).unwrap();
        assert_eq!(decoded.alpn_protocol, Some(vec![0x80]));
    }

    #[test]
    fn test_server_hello_round_trip() {
        let hello = ServerHello {
            version: 0x0303,
            random: [3u8; 32],
            session_id: vec![5; 32],
            cipher_suite: 0xc02f,
            compression_method: 0,
            ocsp_stapling: true,
            ticket_supported: true,
            secure_renegotiation: true,
            alpn_protocol: Some(b"h2".to_vec()),
        };
        let encoded = hello.encode().unwrap();
        let decoded = ServerHello::decode(body(&encoded)).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn test_server_hello_bad_extensions_length() {
        let hello = ServerHello {
            version: 0x0303,
            ocsp_stapling: true,
            ..Default::default()
        };
        let encoded = hello.encode().unwrap();
        let mut raw = body(&encoded).to_vec();
        raw.push(0);
        assert!(matches!(
            ServerHello::decode(&raw),
            Err(Error::Malformed("ServerHello"))
        ));
    }

    #[test]
    fn test_certificate_decode() {
        let msg = Certificate {
            certificates: vec![vec![0x30, 0x01, 0x00], vec![0x30, 0x00]],
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(Certificate::decode(body(&encoded)).unwrap(), msg);
    }

    #[test]
    fn test_certificate_inconsistent_lengths() {
        // Declares 10 bytes of certificates but carries 5.
        let raw = [0x00, 0x00, 0x0a, 0x00, 0x00, 0x02, 0xaa, 0xbb];
        assert!(Certificate::decode(&raw).is_err());

        // Outer length consistent, inner certificate overruns it.
        let raw = [0x00, 0x00, 0x05, 0x00, 0x00, 0x09, 0xaa, 0xbb];
        assert!(Certificate::decode(&raw).is_err());
    }

    #[test]
    fn test_dispatch() {
        let encoded = sample_client_hello().encode().unwrap();
        let msg = HandshakeMessage::decode(encoded[0], body(&encoded)).unwrap();
        assert_eq!(msg.handshake_type(), HandshakeType::ClientHello);

        let finished = HandshakeMessage::decode(20, &[1, 2, 3]).unwrap();
        assert_eq!(finished.name(), "Finished");

        assert!(matches!(
            HandshakeMessage::decode(14, &[]),
            Err(Error::UnknownMessage(14))
        ));
        assert!(matches!(
            HandshakeMessage::decode(99, &[]),
            Err(Error::UnknownMessage(99))
        ));
    }
}
