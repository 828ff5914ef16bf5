//! Multipart (MJPEG) stream decoding.
//!
//! Each part is a `--boundary` line, `Key: Value` header lines, a blank line
//! and exactly `Content-Length` body bytes. Image parts are returned; other
//! parts are skipped.

use std::io::{self, BufRead, Read};

use crate::error::CameraError;

/// Largest part body accepted from a camera.
pub const MAX_PART_BYTES: usize = 5 * 1024 * 1024;

const MAX_HEADER_LINE: u64 = 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartHeader {
    pub boundary: String,
    pub motion_event: Option<i64>,
    pub content_type: String,
    pub content_length: usize,
}

impl PartHeader {
    pub fn is_image(&self) -> bool {
        self.content_type
            .trim()
            .to_ascii_lowercase()
            .starts_with("image/")
    }
}

pub struct MultipartDecoder<R> {
    reader: R,
}

impl<R: BufRead> MultipartDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads parts until an image part is complete.
    pub fn next_image(&mut self) -> Result<(PartHeader, Vec<u8>), CameraError> {
        loop {
            let header = self.read_header()?;
            if !header.is_image() {
                log::debug!(
                    "skipping {} byte part of type {:?}",
                    header.content_length,
                    header.content_type
                );
                self.discard(header.content_length)?;
                continue;
            }
            let body = self.read_body(header.content_length)?;
            return Ok((header, body));
        }
    }

    fn read_header(&mut self) -> Result<PartHeader, CameraError> {
        let line = loop {
            match self.read_line()? {
                None => return Err(CameraError::StreamClosed),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };
        let boundary = line.strip_prefix("--").ok_or_else(|| {
            CameraError::MalformedHeader(format!("expected boundary, got {:?}", clip(&line)))
        })?;

        let mut header = PartHeader {
            boundary: boundary.to_string(),
            ..PartHeader::default()
        };
        let mut content_length = None;
        loop {
            let line = self.read_line()?.ok_or_else(|| {
                CameraError::MalformedHeader("stream ended inside part header".to_string())
            })?;
            if line.is_empty() {
                break;
            }
            let fields: Vec<&str> = line.split(": ").collect();
            let [key, value] = fields.as_slice() else {
                return Err(CameraError::MalformedHeader(format!(
                    "not a key/value pair: {:?}",
                    clip(&line)
                )));
            };
            if key.eq_ignore_ascii_case("Motion-Event") {
                header.motion_event = Some(parse_number(key, value)?);
            } else if key.eq_ignore_ascii_case("Content-Type") {
                header.content_type = value.to_string();
            } else if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(parse_number::<usize>(key, value)?);
            }
        }

        header.content_length = match content_length {
            Some(len) if len > MAX_PART_BYTES => {
                return Err(CameraError::MalformedHeader(format!(
                    "content length {} exceeds {} bytes",
                    len, MAX_PART_BYTES
                )))
            }
            Some(len) => len,
            None if header.is_image() => {
                return Err(CameraError::MalformedHeader(
                    "image part without Content-Length".to_string(),
                ))
            }
            None => 0,
        };
        Ok(header)
    }

    fn read_body(&mut self, expected: usize) -> Result<Vec<u8>, CameraError> {
        let mut body = vec![0u8; expected];
        let mut received = 0;
        while received < expected {
            match self.reader.read(&mut body[received..]) {
                Ok(0) => return Err(CameraError::TruncatedBody { expected, received }),
                Ok(n) => received += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(body)
    }

    fn discard(&mut self, expected: usize) -> Result<(), CameraError> {
        let received =
            io::copy(&mut (&mut self.reader).take(expected as u64), &mut io::sink())? as usize;
        if received < expected {
            return Err(CameraError::TruncatedBody { expected, received });
        }
        Ok(())
    }

    /// Next line without its terminator, or `None` at end of stream.
    fn read_line(&mut self) -> Result<Option<String>, CameraError> {
        let mut raw = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_HEADER_LINE)
            .read_until(b'\n', &mut raw)?;
        if n == 0 {
            return Ok(None);
        }
        if n as u64 == MAX_HEADER_LINE && raw.last() != Some(&b'\n') {
            return Err(CameraError::MalformedHeader(
                "header line too long".to_string(),
            ));
        }
        Ok(Some(String::from_utf8_lossy(&raw).trim().to_string()))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CameraError> {
    value.trim().parse().map_err(|_| {
        CameraError::MalformedHeader(format!("invalid {} value {:?}", key, clip(value)))
    })
}

fn clip(text: &str) -> &str {
    match text.char_indices().nth(64) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
