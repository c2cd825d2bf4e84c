use std;
use std::cmp;
use std::mem;
use http;
use httparse;

use {Request, RequestHead};
use errors::*;


/// Size caps applied while reading a request
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}
impl std::default::Default for Limits {
    fn default() -> Limits {
        Limits {
            max_header_bytes: 1 << 20,
            max_body_bytes: 10 << 20,
        }
    }
}


/// How the body following a request head is delimited
enum Framing {
    Length(usize),
    Chunked(ChunkedDecoder),
}


/// Http reader/parser for incrementally reading a request,
/// parsing its headers and collecting its body.
///
/// Bytes belonging to a following (pipelined) request are left
/// in the buffer and picked up by the next `try_build_request`.
pub(crate) struct HttpStreamReader {
    read_buf: Vec<u8>,
    scanned: usize,
    head: Option<RequestHead>,
    framing: Framing,
    body: Vec<u8>,
    expect_continue: bool,
    limits: Limits,
}
impl HttpStreamReader {
    pub fn new(limits: Limits) -> Self {
        Self {
            read_buf: Vec::with_capacity(1024),
            scanned: 0,
            head: None,
            framing: Framing::Length(0),
            body: Vec::new(),
            expect_continue: false,
            limits,
        }
    }

    /// Save a new chunk of bytes
    pub fn receive_chunk(&mut self, chunk: &[u8]) -> usize {
        self.read_buf.extend_from_slice(chunk);
        self.read_buf.len()
    }

    /// Returns `true` once per request when the client asked for
    /// `100 Continue` and is still owed its body.
    pub fn take_continue(&mut self) -> bool {
        let owed = self.expect_continue && self.head.is_some();
        self.expect_continue = false;
        owed
    }

    /// Try parsing the buffered bytes into a complete request.
    /// `Ok(None)` means more bytes are needed.
    pub fn try_build_request(&mut self) -> Result<Option<Request>> {
        if self.head.is_none() {
            self.skip_empty_lines();
            let end = match find_headers_end(&self.read_buf, self.scanned) {
                Some(end) => end,
                None => {
                    self.scanned = self.read_buf.len().saturating_sub(2);
                    if self.read_buf.len() > self.limits.max_header_bytes {
                        bail!(ErrorKind::RequestHeadersTooLarge(
                            format!("no end of headers within {} bytes", self.limits.max_header_bytes)));
                    }
                    return Ok(None)
                }
            };
            if end > self.limits.max_header_bytes {
                bail!(ErrorKind::RequestHeadersTooLarge(
                    format!("{} header bytes exceeds limit of {}", end, self.limits.max_header_bytes)));
            }
            let parsed = parse_head(&self.read_buf[..end])?;
            if let Framing::Length(n) = parsed.framing {
                if n > self.limits.max_body_bytes {
                    bail!(ErrorKind::RequestBodyTooLarge(
                        format!("content-length {} exceeds limit of {}", n, self.limits.max_body_bytes)));
                }
            }
            self.read_buf.drain(..end);
            self.scanned = 0;
            self.head = Some(parsed.head);
            self.framing = parsed.framing;
            self.expect_continue = parsed.expect_continue;
        }

        let (consumed, complete) = match self.framing {
            Framing::Length(ref mut remaining) => {
                let take = cmp::min(*remaining, self.read_buf.len());
                self.body.extend_from_slice(&self.read_buf[..take]);
                *remaining -= take;
                (take, *remaining == 0)
            }
            Framing::Chunked(ref mut decoder) => {
                decoder.decode(&self.read_buf, &mut self.body, self.limits.max_body_bytes)?
            }
        };
        self.read_buf.drain(..consumed);
        if !complete { return Ok(None) }

        let head = match self.head.take() {
            Some(head) => head,
            None => return Ok(None),
        };
        self.expect_continue = false;
        self.framing = Framing::Length(0);
        let (parts, ()) = head.into_parts();
        let body = mem::replace(&mut self.body, Vec::new());
        Ok(Some(http::Request::from_parts(parts, body)))
    }

    /// Clients may send stray line breaks between requests
    fn skip_empty_lines(&mut self) {
        let n = self.read_buf.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
        if n > 0 {
            self.read_buf.drain(..n);
            self.scanned = 0;
        }
    }
}


/// Position just past the blank line ending a request head, searching
/// from `from`. Accepts both `\r\n\r\n` and bare `\n\n`.
fn find_headers_end(buf: &[u8], from: usize) -> Option<usize> {
    for i in from..buf.len() {
        if buf[i] != b'\n' { continue }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\n") { return Some(i + 2) }
        if rest.starts_with(b"\r\n") { return Some(i + 3) }
    }
    None
}


struct ParsedHead {
    head: RequestHead,
    framing: Framing,
    expect_continue: bool,
}


fn parse_head(bytes: &[u8]) -> Result<ParsedHead> {
    // every header takes at least one line
    let header_lines = bytes.iter().filter(|&&b| b == b'\n').count();
    let mut headers = vec![httparse::EMPTY_HEADER; header_lines];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(bytes) {
        Ok(httparse::Status::Complete(_)) => (),
        Ok(httparse::Status::Partial) => {
            bail!(ErrorKind::MalformedHttpRequest("request head ends mid-line".into()));
        }
        Err(e) => {
            bail!(ErrorKind::MalformedHttpRequest(format!("{}: {:?}", e, String::from_utf8_lossy(bytes))));
        }
    }
    let method = req.method.ok_or_else(|| ErrorKind::MalformedHttpRequest("missing method".into()))?;
    let path = req.path.ok_or_else(|| ErrorKind::MalformedHttpRequest("missing path".into()))?;
    let version = match req.version {
        Some(0) => http::Version::HTTP_10,
        _ => http::Version::HTTP_11,
    };

    let mut content_length = None;
    let mut chunked = false;
    let mut expect_continue = false;
    let mut request = http::Request::builder();
    request.method(method).uri(path).version(version);
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let n = parse_content_length(header.value)?;
            if content_length.map_or(false, |prev| prev != n) {
                bail!(ErrorKind::MalformedHttpRequest("conflicting content-length headers".into()));
            }
            content_length = Some(n);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let codings = std::str::from_utf8(header.value)?;
            let last = codings.rsplit(',').next().unwrap_or("").trim();
            if !last.eq_ignore_ascii_case("chunked") {
                bail!(ErrorKind::MalformedHttpRequest(format!("unsupported transfer-encoding: {}", codings)));
            }
            chunked = true;
        } else if header.name.eq_ignore_ascii_case("expect") {
            expect_continue = header.value.eq_ignore_ascii_case(b"100-continue");
        }
        request.header(header.name, header.value);
    }
    let head = request.body(())?;

    // chunked framing wins over a content-length
    let framing = if chunked {
        Framing::Chunked(ChunkedDecoder::new())
    } else {
        Framing::Length(content_length.unwrap_or(0))
    };
    Ok(ParsedHead { head, framing, expect_continue })
}


fn parse_content_length(value: &[u8]) -> Result<usize> {
    let s = std::str::from_utf8(value)?.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        bail!(ErrorKind::MalformedHttpRequest(format!("invalid content-length: {:?}", s)));
    }
    s.parse::<usize>()
        .map_err(|e| ErrorKind::MalformedHttpRequest(format!("invalid content-length {:?}: {}", s, e)).into())
}


#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}


/// Decoder for `Transfer-Encoding: chunked` bodies. Chunk extensions
/// and trailer fields are read and discarded.
struct ChunkedDecoder {
    state: ChunkState,
}
impl ChunkedDecoder {
    /// Longest chunk-size or trailer line accepted
    const MAX_LINE: usize = 4096;

    fn new() -> Self {
        ChunkedDecoder { state: ChunkState::Size }
    }

    /// Decode as much of `buf` as possible into `body`. Returns the number
    /// of bytes of `buf` consumed and whether the final chunk was seen.
    fn decode(&mut self, buf: &[u8], body: &mut Vec<u8>, max_body: usize) -> Result<(usize, bool)> {
        let mut pos = 0;
        loop {
            match self.state {
                ChunkState::Size => {
                    let (line, used) = match next_line(&buf[pos..], Self::MAX_LINE)? {
                        Some(l) => l,
                        None => return Ok((pos, false)),
                    };
                    let size = parse_chunk_size(line)?;
                    pos += used;
                    self.state = if size == 0 { ChunkState::Trailer } else { ChunkState::Data(size) };
                }
                ChunkState::Data(remaining) => {
                    let available = buf.len() - pos;
                    if available == 0 { return Ok((pos, false)) }
                    let take = cmp::min(remaining, available);
                    if body.len() + take > max_body {
                        bail!(ErrorKind::RequestBodyTooLarge(
                            format!("chunked body exceeds limit of {}", max_body)));
                    }
                    body.extend_from_slice(&buf[pos..pos + take]);
                    pos += take;
                    self.state = if take == remaining { ChunkState::DataEnd } else { ChunkState::Data(remaining - take) };
                }
                ChunkState::DataEnd => {
                    let rest = &buf[pos..];
                    if rest.starts_with(b"\r\n") {
                        pos += 2;
                    } else if rest.starts_with(b"\n") {
                        pos += 1;
                    } else if rest.is_empty() || rest == b"\r" {
                        return Ok((pos, false))
                    } else {
                        bail!(ErrorKind::MalformedHttpRequest("missing line break after chunk data".into()));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let (line, used) = match next_line(&buf[pos..], Self::MAX_LINE)? {
                        Some(l) => l,
                        None => return Ok((pos, false)),
                    };
                    pos += used;
                    if line.is_empty() {
                        self.state = ChunkState::Size;
                        return Ok((pos, true))
                    }
                }
            }
        }
    }
}


/// Split the next line off `buf`, without its line break.
/// Returns the line and the number of bytes it occupied.
fn next_line(buf: &[u8], max: usize) -> Result<Option<(&[u8], usize)>> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(n) => {
            let line = &buf[..n];
            let line = if line.ends_with(b"\r") { &line[..n - 1] } else { line };
            Ok(Some((line, n + 1)))
        }
        None if buf.len() > max => {
            bail!(ErrorKind::MalformedHttpRequest(format!("line longer than {} bytes", max)));
        }
        None => Ok(None),
    }
}


fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let line = std::str::from_utf8(line)?;
    let size = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size, 16)
        .map_err(|e| ErrorKind::MalformedHttpRequest(format!("invalid chunk size {:?}: {}", size, e)).into())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> HttpStreamReader {
        HttpStreamReader::new(Limits::default())
    }

    fn read_all(reader: &mut HttpStreamReader, bytes: &[u8]) -> Result<Option<Request>> {
        reader.receive_chunk(bytes);
        reader.try_build_request()
    }

    #[test]
    fn waits_for_complete_head() {
        let mut r = reader();
        assert!(read_all(&mut r, b"GET /a HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        assert!(read_all(&mut r, b"\r").unwrap().is_none());
        let req = read_all(&mut r, b"\n").unwrap().expect("request");
        assert_eq!(req.method(), &http::Method::GET);
        assert_eq!(req.uri().path(), "/a");
        assert_eq!(req.headers()["host"], "x");
        assert!(req.body().is_empty());
    }

    #[test]
    fn headers_end_split_across_chunks() {
        let mut r = reader();
        let raw = b"PUT /split HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let mut built = None;
        for b in raw.iter() {
            if let Some(req) = read_all(&mut r, &[*b]).unwrap() {
                built = Some(req);
            }
        }
        let req = built.expect("request");
        assert_eq!(req.method(), &http::Method::PUT);
        assert_eq!(req.body(), b"abc");
    }

    #[test]
    fn reads_content_length_body() {
        let mut r = reader();
        assert!(read_all(&mut r, b"POST /foo HTTP/1.1\r\nContent-Length: 7\r\n\r\n{\"x\"").unwrap().is_none());
        let req = read_all(&mut r, b":1}").unwrap().expect("request");
        assert_eq!(req.body(), b"{\"x\":1}");
    }

    #[test]
    fn bare_newlines_and_http10() {
        let mut r = reader();
        let req = read_all(&mut r, b"GET / HTTP/1.0\nUser-Agent: t\n\n").unwrap().expect("request");
        assert_eq!(req.version(), http::Version::HTTP_10);
        assert_eq!(req.headers()["user-agent"], "t");
    }

    #[test]
    fn pipelined_requests_stay_buffered() {
        let mut r = reader();
        r.receive_chunk(b"GET /one HTTP/1.1\r\n\r\n\r\nDELETE /two HTTP/1.1\r\nContent-Length: 1\r\n\r\nzGET");
        let one = r.try_build_request().unwrap().expect("first");
        assert_eq!(one.uri().path(), "/one");
        let two = r.try_build_request().unwrap().expect("second");
        assert_eq!(two.method(), &http::Method::DELETE);
        assert_eq!(two.body(), b"z");
        assert!(r.try_build_request().unwrap().is_none());
        let three = read_all(&mut r, b" /three HTTP/1.1\r\n\r\n").unwrap().expect("third");
        assert_eq!(three.uri().path(), "/three");
    }

    #[test]
    fn custom_methods_pass_through() {
        let mut r = reader();
        let req = read_all(&mut r, b"BREW /pot HTTP/1.1\r\n\r\n").unwrap().expect("request");
        assert_eq!(req.method().as_str(), "BREW");
    }

    #[test]
    fn decodes_chunked_body() {
        let mut r = reader();
        let head = b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(read_all(&mut r, head).unwrap().is_none());
        assert!(read_all(&mut r, b"4;ext=1\r\nWiki\r\n5\r\npe").unwrap().is_none());
        assert!(read_all(&mut r, b"dia\r\n0\r\nX-Trailer: 1\r\n").unwrap().is_none());
        let req = read_all(&mut r, b"\r\nGET").unwrap().expect("request");
        assert_eq!(req.body(), b"Wikipedia");
        assert!(r.try_build_request().unwrap().is_none());
    }

    #[test]
    fn continue_is_owed_only_while_body_pending() {
        let mut r = reader();
        let head = b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n";
        assert!(read_all(&mut r, head).unwrap().is_none());
        assert!(r.take_continue());
        assert!(!r.take_continue());
        assert!(read_all(&mut r, b"ok").unwrap().is_some());

        let head = b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 0\r\n\r\n";
        assert!(read_all(&mut r, head).unwrap().is_some());
        assert!(!r.take_continue());
    }

    #[test]
    fn rejects_garbage() {
        let mut r = reader();
        let err = read_all(&mut r, b"\x01\x02 not http\r\n\r\n").unwrap_err();
        assert_eq!(err.response_status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn rejects_unfinished_request_line() {
        // blank line before the request line is finished
        let mut r = reader();
        let err = read_all(&mut r, b"GET\n\n").unwrap_err();
        assert_eq!(err.response_status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn rejects_bad_content_length() {
        for raw in &[&b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n"[..],
                     &b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"[..],
                     &b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n"[..]] {
            let mut r = reader();
            let err = read_all(&mut r, raw).unwrap_err();
            assert_eq!(err.response_status(), Some(http::StatusCode::BAD_REQUEST));
        }
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let mut r = reader();
        let err = read_all(&mut r, b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n").unwrap_err();
        assert_eq!(err.response_status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn enforces_header_limit() {
        let mut r = HttpStreamReader::new(Limits { max_header_bytes: 32, max_body_bytes: 32 });
        let err = read_all(&mut r, b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaa").unwrap_err();
        assert_eq!(err.response_status(), Some(http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE));
    }

    #[test]
    fn enforces_body_limit() {
        let mut r = HttpStreamReader::new(Limits { max_header_bytes: 1024, max_body_bytes: 4 });
        let err = read_all(&mut r, b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap_err();
        assert_eq!(err.response_status(), Some(http::StatusCode::PAYLOAD_TOO_LARGE));

        let mut r = HttpStreamReader::new(Limits { max_header_bytes: 1024, max_body_bytes: 4 });
        let err = read_all(&mut r, b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n")
            .unwrap_err();
        assert_eq!(err.response_status(), Some(http::StatusCode::PAYLOAD_TOO_LARGE));
    }

    #[test]
    fn finds_headers_end() {
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\r\n\r\n", 0), Some(18));
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\n\nrest", 0), Some(16));
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\r\nA: b\r\n", 0), None);
    }
}
