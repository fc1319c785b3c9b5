//! Streaming `multipart/*` body decoder.
//!
//! The decoder scans the body for `\r\n--<boundary>` delimiters and keeps
//! only enough bytes buffered to spot a delimiter split across chunks. Each
//! part is handed out as a [`Part`] that mutably borrows the decoder, so at
//! most one part stream is open at a time. A part dropped before it was
//! drained is skipped when the next part is requested.

use std::sync::LazyLock;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use regex::Regex;

use crate::error::{NetError, Result};
use crate::flow::bridge::Inbound;

static BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)multipart.*;\s*boundary=([^;]+)").expect("boundary pattern is valid")
});

const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Boundary token from the first `Content-Type` header that carries one.
pub fn extract_boundary(headers: &HeaderMap) -> Result<String> {
    headers
        .get_all(header::CONTENT_TYPE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| BOUNDARY.captures(v))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().trim_matches('"').to_string())
        .find(|b| !b.is_empty())
        .ok_or_else(|| NetError::Decode("not a valid multipart body".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Headers,
    Body,
    End,
}

/// Lazy sequence of body parts.
#[derive(Debug)]
pub struct Multipart {
    input: Inbound<Bytes>,
    buf: BytesMut,
    delimiter: Vec<u8>,
    boundary: String,
    state: State,
}

impl Multipart {
    /// Start decoding `input`. Fails before reading anything when the
    /// headers carry no boundary.
    pub fn decode(headers: &HeaderMap, input: Inbound<Bytes>) -> Result<Self> {
        let boundary = extract_boundary(headers)?;
        Ok(Self::with_boundary(boundary, input))
    }

    pub fn with_boundary(boundary: impl Into<String>, input: Inbound<Bytes>) -> Self {
        let boundary = boundary.into();
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        // The first delimiter may start the body without a leading CRLF.
        let mut buf = BytesMut::with_capacity(8 * 1024);
        buf.extend_from_slice(b"\r\n");
        Self {
            input,
            buf,
            delimiter,
            boundary,
            state: State::Preamble,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Next part, or `None` after the closing boundary.
    pub async fn next_part(&mut self) -> Result<Option<Part<'_>>> {
        loop {
            match self.state {
                State::End => return Ok(None),
                State::Preamble | State::Body => self.skip_to_delimiter().await?,
                State::Headers => {
                    let headers = self.read_headers().await?;
                    self.state = State::Body;
                    return Ok(Some(Part {
                        decoder: self,
                        headers,
                        done: false,
                    }));
                }
            }
        }
    }

    async fn fill(&mut self) -> Result<()> {
        match self.input.next().await {
            Some(Ok(chunk)) => {
                self.buf.extend_from_slice(&chunk);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(NetError::Decode("multipart body truncated".into())),
        }
    }

    fn find(&self, needle: &[u8]) -> Option<usize> {
        self.buf.windows(needle.len()).position(|w| w == needle)
    }

    async fn skip_to_delimiter(&mut self) -> Result<()> {
        loop {
            if let Some(pos) = self.find(&self.delimiter) {
                self.buf.advance(pos + self.delimiter.len());
                return self.read_boundary_suffix().await;
            }
            let keep = self.delimiter.len() - 1;
            let discard = self.buf.len().saturating_sub(keep);
            self.buf.advance(discard);
            self.fill().await?;
        }
    }

    /// After a delimiter: `--` closes the body, CRLF opens a part.
    async fn read_boundary_suffix(&mut self) -> Result<()> {
        loop {
            // Transport padding.
            while matches!(self.buf.first(), Some(b' ' | b'\t')) {
                self.buf.advance(1);
            }
            if self.buf.len() < 2 {
                self.fill().await?;
                continue;
            }
            if self.buf.starts_with(b"--") {
                self.buf.advance(2);
                self.state = State::End;
            } else if self.buf.starts_with(b"\r\n") {
                self.buf.advance(2);
                self.state = State::Headers;
            } else {
                return Err(NetError::Decode("malformed boundary line".into()));
            }
            return Ok(());
        }
    }

    async fn read_headers(&mut self) -> Result<HeaderMap> {
        loop {
            if self.buf.starts_with(b"\r\n") {
                self.buf.advance(2);
                return Ok(HeaderMap::new());
            }
            if let Some(end) = self.find(b"\r\n\r\n") {
                let block = self.buf.split_to(end);
                self.buf.advance(4);
                return parse_headers(&block);
            }
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(NetError::Decode("part headers too large".into()));
            }
            self.fill().await?;
        }
    }

    async fn body_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.state != State::Body {
                return Ok(None);
            }
            match self.find(&self.delimiter) {
                Some(0) => {
                    self.buf.advance(self.delimiter.len());
                    self.read_boundary_suffix().await?;
                    return Ok(None);
                }
                Some(pos) => return Ok(Some(self.buf.split_to(pos).freeze())),
                None => {
                    let keep = self.delimiter.len() - 1;
                    if self.buf.len() > keep {
                        let n = self.buf.len() - keep;
                        return Ok(Some(self.buf.split_to(n).freeze()));
                    }
                    self.fill().await?;
                }
            }
        }
    }
}

fn parse_headers(block: &[u8]) -> Result<HeaderMap> {
    let text = std::str::from_utf8(block).map_err(|_| NetError::Decode("part headers are not UTF-8".into()))?;
    let mut headers = HeaderMap::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| NetError::Decode(format!("malformed part header: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| NetError::Decode(e.to_string()))?;
        let value = HeaderValue::from_str(value.trim()).map_err(|e| NetError::Decode(e.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// One part: its headers and a forward-only body.
#[derive(Debug)]
pub struct Part<'a> {
    decoder: &'a mut Multipart,
    headers: HeaderMap,
    done: bool,
}

impl<'a> Part<'a> {
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// `name` parameter of `Content-Disposition`.
    pub fn name(&self) -> Option<&str> {
        disposition_param(&self.headers, "name")
    }

    /// `filename` parameter of `Content-Disposition`.
    pub fn filename(&self) -> Option<&str> {
        disposition_param(&self.headers, "filename")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Next body chunk, `None` once the part ended.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let chunk = self.decoder.body_chunk().await?;
        if chunk.is_none() {
            self.done = true;
        }
        Ok(chunk)
    }

    /// Whole body of this part.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Discard the rest of this part.
    pub async fn skip(mut self) -> Result<()> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }

    /// The body as a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + 'a {
        futures_util::stream::unfold(self, |mut part| async move {
            match part.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), part)),
                Ok(None) => None,
                Err(e) => {
                    part.done = true;
                    Some((Err(e), part))
                }
            }
        })
    }
}

fn disposition_param<'h>(headers: &'h HeaderMap, key: &str) -> Option<&'h str> {
    let value = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;
    value.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"'))
    })
}
