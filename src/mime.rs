//! MIME type sniffing for bodies served without a useful `Content-Type`.

use std::fmt;

use thiserror::Error;

/// Number of leading body bytes handed to the sniffer.
pub const SNIFF_LENGTH: usize = 8 * 1024;

/// Failure to determine a content type.
#[derive(Debug, Error)]
#[error("could not determine content type for {url}")]
pub struct MimeDetectError {
    url: String,
}

impl MimeDetectError {
    /// Creates an error for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Determines a content type from leading body bytes and the URL.
pub trait MimeSniffer: Send + Sync + fmt::Debug {
    /// Returns the detected MIME type.
    ///
    /// # Errors
    ///
    /// Returns [`MimeDetectError`] when nothing conclusive was found.
    fn content_type(&self, head: &[u8], url: &str) -> Result<String, MimeDetectError>;
}

/// Signature, extension and text heuristics.
///
/// Checks run in order: binary signatures, markup prefixes, URL extension,
/// then "looks like UTF-8 text".
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicMimeSniffer;

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"\x1F\x8B", "application/gzip"),
    (b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1", "application/x-tika-msoffice"),
    (b"%!PS", "application/postscript"),
    (b"{\\rtf", "application/rtf"),
];

const EXTENSIONS: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("xhtml", "application/xhtml+xml"),
    ("xml", "application/xml"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
];

impl MimeSniffer for BasicMimeSniffer {
    fn content_type(&self, head: &[u8], url: &str) -> Result<String, MimeDetectError> {
        if let Some((_, mime)) = SIGNATURES.iter().find(|(sig, _)| head.starts_with(sig)) {
            return Ok((*mime).to_string());
        }
        if let Some(mime) = sniff_markup(head) {
            return Ok(mime.to_string());
        }
        if let Some(mime) = mime_from_extension(url) {
            return Ok(mime.to_string());
        }
        if !head.is_empty() && looks_like_text(head) {
            return Ok("text/plain".to_string());
        }
        Err(MimeDetectError::new(url))
    }
}

fn sniff_markup(head: &[u8]) -> Option<&'static str> {
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    let start = head.iter().position(|b| !b.is_ascii_whitespace())?;
    let prefix: Vec<u8> = head[start..]
        .iter()
        .take(16)
        .map(u8::to_ascii_lowercase)
        .collect();
    if prefix.starts_with(b"<?xml") {
        Some("application/xml")
    } else if prefix.starts_with(b"<!doctype html") || prefix.starts_with(b"<html") {
        Some("text/html")
    } else {
        None
    }
}

/// Maps the URL's file extension to a MIME type.
#[must_use]
pub fn mime_from_extension(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

fn looks_like_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        // A multi-byte sequence may be cut at the sniff boundary.
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > head.len(),
    }
}
