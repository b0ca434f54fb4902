//! The framed text + raw-byte wire protocol.
//!
//! Every frame is a small, closed subset of tagged text:
//!
//! ```text
//! <message><service>NAME</service><data>...</data></message>
//! ```
//!
//! terminated by the literal sentinel `</message>`. This module hand-rolls
//! a tiny recursive-descent reader for that subset rather than pulling in
//! a general XML crate: the grammar is five tags deep and fixed, and
//! writing the reader directly keeps the "a raw byte payload may follow
//! immediately after the sentinel" framing invariant explicit in the one
//! place that has to get it right.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::{ManifestDir, ManifestFile};

pub const SENTINEL: &[u8] = b"</message>";

#[derive(Debug)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame parse error: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// The unit of protocol transfer.
#[derive(Debug, Clone)]
pub enum SyncFrame {
    Authenticate { user: String, pass: String },
    SignUp { user: String, pass: String },
    AuthResponse { ok: bool, message: String },
    /// `size_code`: -2 erase, -1 directory, >=0 regular file of that byte count.
    Sync { rel_path: String, size_code: i64 },
    SyncAck,
    CheckSync { manifest: ManifestDir },
    CheckSyncResponse { missing: Vec<String> },
    Restore,
    RestoreEnd,
}

impl SyncFrame {
    pub fn service_name(&self) -> &'static str {
        match self {
            SyncFrame::Authenticate { .. } => "authentication",
            SyncFrame::SignUp { .. } => "signup",
            SyncFrame::AuthResponse { .. } => "authentication_response",
            SyncFrame::Sync { .. } => "sync",
            SyncFrame::SyncAck => "syncack",
            SyncFrame::CheckSync { .. } => "checksync",
            SyncFrame::CheckSyncResponse { .. } => "checksyncresponse",
            SyncFrame::Restore => "restore",
            SyncFrame::RestoreEnd => "restoreend",
        }
    }
}

// ---------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------

fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_text(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Encode a frame as the text envelope bytes (sentinel included). Raw file
/// bytes for a `Sync{size_code>=0}` are the caller's responsibility to
/// write immediately afterward.
pub fn encode(frame: &SyncFrame) -> Vec<u8> {
    let mut out = String::from("<message><service>");
    out.push_str(frame.service_name());
    out.push_str("</service><data>");
    encode_data(frame, &mut out);
    out.push_str("</data></message>");
    out.into_bytes()
}

fn encode_data(frame: &SyncFrame, out: &mut String) {
    match frame {
        SyncFrame::Authenticate { user, pass } | SyncFrame::SignUp { user, pass } => {
            out.push_str("<user>");
            out.push_str(&escape_text(user));
            out.push_str("</user><pass>");
            out.push_str(&escape_text(pass));
            out.push_str("</pass>");
        }
        SyncFrame::AuthResponse { ok, message } => {
            out.push_str("<success message=\"");
            out.push_str(&escape_text(message));
            out.push_str("\">");
            out.push_str(if *ok { "true" } else { "false" });
            out.push_str("</success>");
        }
        SyncFrame::Sync { rel_path, size_code } => {
            out.push_str("<file size=\"");
            out.push_str(&size_code.to_string());
            out.push_str("\">");
            out.push_str(&escape_text(rel_path));
            out.push_str("</file>");
        }
        SyncFrame::SyncAck | SyncFrame::Restore | SyncFrame::RestoreEnd => {}
        SyncFrame::CheckSync { manifest } => {
            encode_manifest(manifest, out);
        }
        SyncFrame::CheckSyncResponse { missing } => {
            out.push_str("<files>");
            for rel in missing {
                out.push_str("<file>");
                out.push_str(&escape_text(rel));
                out.push_str("</file>");
            }
            out.push_str("</files>");
        }
    }
}

fn encode_manifest(dir: &ManifestDir, out: &mut String) {
    out.push_str("<directory name=\"");
    out.push_str(&escape_text(&dir.name));
    out.push_str("\"><directories>");
    for child in &dir.directories {
        encode_manifest(child, out);
    }
    out.push_str("</directories><files>");
    for file in &dir.files {
        out.push_str("<file size=\"");
        out.push_str(&file.size.to_string());
        out.push_str("\" hash=\"");
        out.push_str(&escape_text(&file.hash));
        out.push_str("\">");
        out.push_str(&escape_text(&file.name));
        out.push_str("</file>");
    }
    out.push_str("</files></directory>");
}

// ---------------------------------------------------------------------
// Decoding: a minimal recursive-descent reader over the fixed tag subset.
// ---------------------------------------------------------------------

struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|n| n.name == name)
    }
}

struct Cursor<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Cursor { s: s.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError(format!("expected '{}' at byte {}", byte as char, self.pos)))
        }
    }

    fn expect_str(&mut self, s: &str) -> Result<(), ParseError> {
        let bytes = s.as_bytes();
        if self.s[self.pos..].starts_with(bytes) {
            self.pos += bytes.len();
            Ok(())
        } else {
            Err(ParseError(format!("expected \"{s}\" at byte {}", self.pos)))
        }
    }

    fn read_name(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c != b'>' && c != b' ' && c != b'/' ) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ParseError("expected a tag/attribute name".into()));
        }
        Ok(String::from_utf8_lossy(&self.s[start..self.pos]).into_owned())
    }

    fn parse_attrs(&mut self) -> Result<Vec<(String, String)>, ParseError> {
        let mut attrs = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b'>') {
                break;
            }
            let name = self.read_name()?;
            self.expect(b'=')?;
            self.expect(b'"')?;
            let start = self.pos;
            while matches!(self.peek(), Some(c) if c != b'"') {
                self.pos += 1;
            }
            let raw = std::str::from_utf8(&self.s[start..self.pos])
                .map_err(|e| ParseError(e.to_string()))?;
            let value = unescape_text(raw);
            self.expect(b'"')?;
            attrs.push((name, value));
        }
        Ok(attrs)
    }

    fn parse_node(&mut self) -> Result<Node, ParseError> {
        self.expect(b'<')?;
        let name = self.read_name()?;
        self.skip_ws();
        let attrs = self.parse_attrs()?;
        self.expect(b'>')?;

        let mut children = Vec::new();
        let mut text = String::new();
        loop {
            if self.s[self.pos..].starts_with(b"</") {
                break;
            }
            if self.peek() == Some(b'<') {
                children.push(self.parse_node()?);
                continue;
            }
            let start = self.pos;
            while matches!(self.peek(), Some(c) if c != b'<') {
                self.pos += 1;
            }
            if self.pos == start {
                return Err(ParseError(format!("unterminated element <{name}>")));
            }
            let raw =
                std::str::from_utf8(&self.s[start..self.pos]).map_err(|e| ParseError(e.to_string()))?;
            text.push_str(&unescape_text(raw));
        }
        self.expect_str("</")?;
        self.expect_str(&name)?;
        self.expect(b'>')?;

        Ok(Node { name, attrs, text, children })
    }
}

fn parse_document(s: &str) -> Result<Node, ParseError> {
    let mut cur = Cursor::new(s);
    cur.skip_ws();
    cur.parse_node()
}

fn parse_manifest_node(node: &Node) -> Result<ManifestDir, ParseError> {
    let name = node
        .attr("name")
        .ok_or_else(|| ParseError("directory node missing name".into()))?
        .to_string();
    let mut directories = Vec::new();
    if let Some(dirs) = node.child("directories") {
        for child in &dirs.children {
            directories.push(parse_manifest_node(child)?);
        }
    }
    let mut files = Vec::new();
    if let Some(files_node) = node.child("files") {
        for f in &files_node.children {
            let size: u64 = f
                .attr("size")
                .ok_or_else(|| ParseError("file node missing size".into()))?
                .parse()
                .map_err(|_| ParseError("file size not an integer".into()))?;
            let hash = f.attr("hash").unwrap_or("").to_string();
            files.push(ManifestFile { name: f.text.clone(), size, hash });
        }
    }
    Ok(ManifestDir { name, directories, files })
}

/// Decode a complete frame (sentinel-terminated text, sentinel excluded or
/// included: both are tolerated since parsing stops at `</message>`).
pub fn decode(bytes: &[u8]) -> Result<SyncFrame, ParseError> {
    let s = std::str::from_utf8(bytes).map_err(|e| ParseError(e.to_string()))?;
    let root = parse_document(s)?;
    if root.name != "message" {
        return Err(ParseError(format!("unexpected root element <{}>", root.name)));
    }
    let service = root
        .child("service")
        .ok_or_else(|| ParseError("missing <service>".into()))?
        .text
        .as_str();
    let data = root
        .child("data")
        .ok_or_else(|| ParseError("missing <data>".into()))?;

    let frame = match service {
        "authentication" => SyncFrame::Authenticate {
            user: data.child("user").map(|n| n.text.clone()).unwrap_or_default(),
            pass: data.child("pass").map(|n| n.text.clone()).unwrap_or_default(),
        },
        "signup" => SyncFrame::SignUp {
            user: data.child("user").map(|n| n.text.clone()).unwrap_or_default(),
            pass: data.child("pass").map(|n| n.text.clone()).unwrap_or_default(),
        },
        "authentication_response" => {
            let node = data
                .child("success")
                .ok_or_else(|| ParseError("missing <success>".into()))?;
            SyncFrame::AuthResponse {
                ok: node.text == "true",
                message: node.attr("message").unwrap_or("").to_string(),
            }
        }
        "sync" => {
            let node = data.child("file").ok_or_else(|| ParseError("missing <file>".into()))?;
            let size_code: i64 = node
                .attr("size")
                .ok_or_else(|| ParseError("missing size attribute".into()))?
                .parse()
                .map_err(|_| ParseError("size attribute not an integer".into()))?;
            SyncFrame::Sync { rel_path: node.text.clone(), size_code }
        }
        "syncack" => SyncFrame::SyncAck,
        "checksync" => {
            let dir_node = data
                .child("directory")
                .ok_or_else(|| ParseError("missing <directory>".into()))?;
            SyncFrame::CheckSync { manifest: parse_manifest_node(dir_node)? }
        }
        "checksyncresponse" => {
            let files_node = data
                .child("files")
                .ok_or_else(|| ParseError("missing <files>".into()))?;
            let missing = files_node.children.iter().map(|n| n.text.clone()).collect();
            SyncFrame::CheckSyncResponse { missing }
        }
        "restore" => SyncFrame::Restore,
        "restoreend" => SyncFrame::RestoreEnd,
        other => return Err(ParseError(format!("unknown service {other}"))),
    };
    Ok(frame)
}

// ---------------------------------------------------------------------
// Framed reading over a live connection
// ---------------------------------------------------------------------

/// Buffers bytes off an `AsyncRead` and hands out one complete text frame
/// (sentinel-terminated) or one raw payload of a known length at a time.
///
/// The read buffer is the one place the "don't consume bytes past the
/// sentinel when a raw byte payload follows" invariant has to be honored:
/// a `Sync{size_code>=0}` frame is immediately followed on the wire by
/// exactly `size_code` raw bytes with no framing of their own, so any
/// bytes read past `</message>` while looking for the sentinel are the
/// start of that payload and must be served to `read_payload` first.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader { reader, buf: Vec::new() }
    }

    /// Read one complete frame (text up to and including `</message>`),
    /// leaving any trailing bytes already read buffered for the next call.
    pub async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut scan_from = 0;
        loop {
            if let Some(pos) = find_sentinel_end(&self.buf, scan_from) {
                let frame = self.buf[..pos].to_vec();
                self.buf.drain(..pos);
                return Ok(frame);
            }
            scan_from = self.buf.len().saturating_sub(SENTINEL.len().saturating_sub(1));
            let mut tmp = [0u8; 4096];
            let n = self.reader.read(&mut tmp).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-frame"));
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Read exactly `total` raw bytes, preferring bytes already buffered
    /// (leftover from the previous `read_frame`) before issuing further
    /// reads, each capped at `chunk_size`.
    pub async fn read_payload(
        &mut self,
        total: u64,
        chunk_size: usize,
        mut on_chunk: impl FnMut(&[u8]) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut remaining = total;

        if !self.buf.is_empty() {
            let take = remaining.min(self.buf.len() as u64) as usize;
            let chunk = self.buf[..take].to_vec();
            self.buf.drain(..take);
            on_chunk(&chunk)?;
            remaining -= take as u64;
        }

        let mut tmp = vec![0u8; chunk_size];
        while remaining > 0 {
            let want = remaining.min(chunk_size as u64) as usize;
            self.reader.read_exact(&mut tmp[..want]).await?;
            on_chunk(&tmp[..want])?;
            remaining -= want as u64;
        }
        Ok(())
    }
}

fn find_sentinel_end(buf: &[u8], scan_from: usize) -> Option<usize> {
    buf.windows(SENTINEL.len())
        .skip(scan_from)
        .position(|w| w == SENTINEL)
        .map(|i| scan_from + i + SENTINEL.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ManifestDir, ManifestFile};

    fn roundtrip(frame: SyncFrame) -> SyncFrame {
        let bytes = encode(&frame);
        decode(&bytes).expect("decode")
    }

    #[test]
    fn roundtrip_authenticate() {
        let f = SyncFrame::Authenticate { user: "alice".into(), pass: "s3cret".into() };
        match roundtrip(f) {
            SyncFrame::Authenticate { user, pass } => {
                assert_eq!(user, "alice");
                assert_eq!(pass, "s3cret");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_sync_negative_sizes() {
        for size_code in [-2i64, -1, 0, 5, 1_000_000] {
            let f = SyncFrame::Sync { rel_path: "a/b c.txt".into(), size_code };
            match roundtrip(f) {
                SyncFrame::Sync { rel_path, size_code: sc } => {
                    assert_eq!(rel_path, "a/b c.txt");
                    assert_eq!(sc, size_code);
                }
                _ => panic!("wrong variant"),
            }
        }
    }

    #[test]
    fn roundtrip_paths_with_unicode_and_markup_chars() {
        let path = "dir/héllo <world> & \"quote's\".txt";
        let f = SyncFrame::Sync { rel_path: path.into(), size_code: 3 };
        match roundtrip(f) {
            SyncFrame::Sync { rel_path, .. } => assert_eq!(rel_path, path),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_auth_response_with_message() {
        let f = SyncFrame::AuthResponse { ok: false, message: "Cannot login: user already connected".into() };
        match roundtrip(f) {
            SyncFrame::AuthResponse { ok, message } => {
                assert!(!ok);
                assert_eq!(message, "Cannot login: user already connected");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_checksync_manifest() {
        let manifest = ManifestDir {
            name: "root".into(),
            directories: vec![ManifestDir::empty("a")],
            files: vec![ManifestFile { name: "b.txt".into(), size: 5, hash: "aGFzaA==".into() }],
        };
        let f = SyncFrame::CheckSync { manifest };
        match roundtrip(f) {
            SyncFrame::CheckSync { manifest } => {
                assert_eq!(manifest.name, "root");
                assert_eq!(manifest.directories.len(), 1);
                assert_eq!(manifest.files[0].name, "b.txt");
                assert_eq!(manifest.files[0].size, 5);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_checksync_response() {
        let f = SyncFrame::CheckSyncResponse { missing: vec!["a.txt".into(), "dir/b.txt".into()] };
        match roundtrip(f) {
            SyncFrame::CheckSyncResponse { missing } => {
                assert_eq!(missing, vec!["a.txt".to_string(), "dir/b.txt".to_string()]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_service_is_a_hard_error() {
        let bytes = b"<message><service>bogus</service><data></data></message>";
        assert!(decode(bytes).is_err());
    }

    #[test]
    fn malformed_frame_is_a_hard_error() {
        let bytes = b"<message><service>sync</data></message>";
        assert!(decode(bytes).is_err());
    }

    #[test]
    fn encoded_frame_ends_with_sentinel() {
        let bytes = encode(&SyncFrame::SyncAck);
        assert!(bytes.ends_with(SENTINEL));
    }

    #[tokio::test]
    async fn frame_reader_stops_at_sentinel_and_buffers_the_rest() {
        let mut wire = encode(&SyncFrame::SyncAck);
        wire.extend_from_slice(b"PAYLOADTAIL");
        let mut reader = FrameReader::new(std::io::Cursor::new(wire));

        let frame = reader.read_frame().await.unwrap();
        assert!(matches!(decode(&frame).unwrap(), SyncFrame::SyncAck));

        let mut collected = Vec::new();
        reader
            .read_payload(11, 4, |chunk| {
                collected.extend_from_slice(chunk);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(collected, b"PAYLOADTAIL");
    }

    #[tokio::test]
    async fn frame_reader_handles_frame_split_across_reads() {
        let wire = encode(&SyncFrame::Restore);
        let mut reader = FrameReader::new(std::io::Cursor::new(wire.clone()));
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame, wire);
    }

    #[tokio::test]
    async fn frame_reader_reads_two_frames_back_to_back() {
        let mut wire = encode(&SyncFrame::Restore);
        wire.extend(encode(&SyncFrame::RestoreEnd));
        let mut reader = FrameReader::new(std::io::Cursor::new(wire));

        assert!(matches!(
            decode(&reader.read_frame().await.unwrap()).unwrap(),
            SyncFrame::Restore
        ));
        assert!(matches!(
            decode(&reader.read_frame().await.unwrap()).unwrap(),
            SyncFrame::RestoreEnd
        ));
    }
}
