//! TLS ClientHello reader.
//!
//! Parses just enough of a ClientHello to recover the SNI server_name
//! extension. The proxy never terminates TLS; it only needs the name a
//! client asked for, so anything past the extension walk is ignored.

/// Outcome of attempting to read a ClientHello from a partial byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientHello {
    /// A complete ClientHello carrying this server_name.
    Sni(String),
    /// A complete ClientHello without a server_name extension.
    NoSni,
    /// The buffer ends before the record does; reading more may help.
    NeedMore,
    /// The bytes cannot be a ClientHello; more input will not fix them.
    Invalid,
}

/// Read the first TLS record in `buf` and extract the SNI, if any.
///
/// Callers are expected to have already matched the record preamble
/// (`0x16 0x03 0x00..=0x06`); this function re-checks it and walks the
/// ClientHello body: version, random, session id, cipher suites,
/// compression methods, then the extension list.
pub fn read_client_hello(buf: &[u8]) -> ClientHello {
    if buf.len() < 5 {
        return ClientHello::NeedMore;
    }
    if buf[0] != 0x16 || buf[1] != 0x03 || buf[2] > 0x06 {
        return ClientHello::Invalid;
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return ClientHello::NeedMore;
    }
    let body = &buf[5..5 + record_len];

    // Handshake header: type (1), length (3)
    if body.len() < 4 {
        return ClientHello::Invalid;
    }
    if body[0] != 0x01 {
        return ClientHello::Invalid;
    }
    let hs_len = ((body[1] as usize) << 16) | ((body[2] as usize) << 8) | body[3] as usize;
    if hs_len > body.len() - 4 {
        // ClientHello spans multiple records; reassembly is not worth it
        // for a sniff-only consumer.
        return ClientHello::Invalid;
    }
    let hello = &body[4..4 + hs_len];

    let mut pos = 0usize;

    // legacy_version (2) + random (32)
    pos += 2 + 32;
    if hello.len() < pos + 1 {
        return ClientHello::Invalid;
    }

    // session id
    let session_len = hello[pos] as usize;
    pos += 1 + session_len;
    if hello.len() < pos + 2 {
        return ClientHello::Invalid;
    }

    // cipher suites
    let cipher_len = u16::from_be_bytes([hello[pos], hello[pos + 1]]) as usize;
    pos += 2 + cipher_len;
    if hello.len() < pos + 1 {
        return ClientHello::Invalid;
    }

    // compression methods
    let comp_len = hello[pos] as usize;
    pos += 1 + comp_len;
    if hello.len() < pos {
        return ClientHello::Invalid;
    }

    // a ClientHello may legitimately end here, extension-free
    if hello.len() == pos {
        return ClientHello::NoSni;
    }
    if hello.len() < pos + 2 {
        return ClientHello::Invalid;
    }

    let ext_len = u16::from_be_bytes([hello[pos], hello[pos + 1]]) as usize;
    pos += 2;
    if hello.len() < pos + ext_len {
        return ClientHello::Invalid;
    }
    let end = pos + ext_len;

    while pos + 4 <= end {
        let ext_type = u16::from_be_bytes([hello[pos], hello[pos + 1]]);
        let len = u16::from_be_bytes([hello[pos + 2], hello[pos + 3]]) as usize;
        pos += 4;
        if pos + len > end {
            return ClientHello::Invalid;
        }

        if ext_type == 0x0000 {
            return read_server_name(&hello[pos..pos + len]);
        }
        pos += len;
    }

    ClientHello::NoSni
}

/// Walk a server_name extension body and return the first hostname entry.
fn read_server_name(ext: &[u8]) -> ClientHello {
    if ext.len() < 2 {
        return ClientHello::Invalid;
    }
    let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
    if ext.len() < 2 + list_len {
        return ClientHello::Invalid;
    }

    let mut pos = 2usize;
    let end = 2 + list_len;
    while pos + 3 <= end {
        let name_type = ext[pos];
        let name_len = u16::from_be_bytes([ext[pos + 1], ext[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > end {
            return ClientHello::Invalid;
        }
        if name_type == 0 {
            return match std::str::from_utf8(&ext[pos..pos + name_len]) {
                Ok(name) if !name.is_empty() => ClientHello::Sni(name.to_string()),
                _ => ClientHello::Invalid,
            };
        }
        pos += name_len;
    }

    ClientHello::NoSni
}

#[cfg(test)]
pub mod testutil {
    //! ClientHello builders shared with the sniffer tests.

    /// Serialize a minimal ClientHello carrying `hostname` as its SNI.
    pub fn build_client_hello(hostname: &str) -> Vec<u8> {
        let host = hostname.as_bytes();
        let sni_ext_len = 5 + host.len(); // list len (2) + type (1) + len (2) + host
        let extensions_len = 4 + sni_ext_len;

        let mut out = Vec::new();
        out.push(0x16);
        out.extend_from_slice(&[0x03, 0x01]);
        let record_len = 4 + 2 + 32 + 1 + 2 + 1 + 2 + extensions_len;
        out.extend_from_slice(&(record_len as u16).to_be_bytes());

        out.push(0x01); // ClientHello
        out.push(0);
        out.extend_from_slice(&((record_len - 4) as u16).to_be_bytes());

        out.extend_from_slice(&[0x03, 0x03]); // legacy_version
        out.extend_from_slice(&[0; 32]); // random
        out.push(0); // session id
        out.extend_from_slice(&[0x00, 0x02, 0x00, 0x00]); // cipher suites
        out.extend_from_slice(&[0x01, 0x00]); // compression

        out.extend_from_slice(&(extensions_len as u16).to_be_bytes());
        out.extend_from_slice(&[0x00, 0x00]); // server_name
        out.extend_from_slice(&(sni_ext_len as u16).to_be_bytes());
        out.extend_from_slice(&((sni_ext_len - 2) as u16).to_be_bytes());
        out.push(0x00); // name type: hostname
        out.extend_from_slice(&(host.len() as u16).to_be_bytes());
        out.extend_from_slice(host);

        out
    }

    /// Serialize a minimal ClientHello with an empty extension list.
    pub fn build_client_hello_no_sni() -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0x16);
        out.extend_from_slice(&[0x03, 0x01]);
        let record_len = 4 + 2 + 32 + 1 + 2 + 1 + 2;
        out.extend_from_slice(&(record_len as u16).to_be_bytes());

        out.push(0x01);
        out.push(0);
        out.extend_from_slice(&((record_len - 4) as u16).to_be_bytes());

        out.extend_from_slice(&[0x03, 0x03]);
        out.extend_from_slice(&[0; 32]);
        out.push(0);
        out.extend_from_slice(&[0x00, 0x02, 0x00, 0x00]);
        out.extend_from_slice(&[0x01, 0x00]);
        out.extend_from_slice(&[0x00, 0x00]);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{build_client_hello, build_client_hello_no_sni};
    use super::*;

    #[test]
    fn reads_sni_hostname() {
        let hello = build_client_hello("api.example.net");
        assert_eq!(
            read_client_hello(&hello),
            ClientHello::Sni("api.example.net".into())
        );
    }

    #[test]
    fn reads_long_hostname() {
        let name = format!("{}.example.net", "x".repeat(60));
        let hello = build_client_hello(&name);
        assert_eq!(read_client_hello(&hello), ClientHello::Sni(name));
    }

    #[test]
    fn reports_missing_sni() {
        let hello = build_client_hello_no_sni();
        assert_eq!(read_client_hello(&hello), ClientHello::NoSni);
    }

    #[test]
    fn short_buffer_needs_more() {
        let hello = build_client_hello("example.net");
        for cut in [0, 3, 5, 20, hello.len() - 1] {
            assert_eq!(
                read_client_hello(&hello[..cut]),
                ClientHello::NeedMore,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn rejects_non_handshake_record() {
        let mut hello = build_client_hello("example.net");
        hello[0] = 0x17; // application data
        assert_eq!(read_client_hello(&hello), ClientHello::Invalid);
    }

    #[test]
    fn rejects_server_hello() {
        let mut hello = build_client_hello("example.net");
        hello[5] = 0x02;
        assert_eq!(read_client_hello(&hello), ClientHello::Invalid);
    }

    #[test]
    fn rejects_inconsistent_extension_lengths() {
        let mut hello = build_client_hello("example.net");
        let len = hello.len();
        hello.truncate(len - 4);
        // keep the record length consistent so the cut lands inside the
        // extension walk rather than the record read
        let record_len = (hello.len() - 5) as u16;
        hello[3..5].copy_from_slice(&record_len.to_be_bytes());
        let hs_len = (hello.len() - 9) as u16;
        hello[7..9].copy_from_slice(&hs_len.to_be_bytes());
        assert_eq!(read_client_hello(&hello), ClientHello::Invalid);
    }
}
