//! Constants for the fetch module (content typing, robots.txt).

/// Charset reported when the response declares none.
pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Declared type treated as "unknown" so the body gets sniffed.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// MIME type whose length limit applies to robots.txt bodies.
pub const ROBOTS_TXT_MIME_TYPE: &str = "text/plain";

/// Path of robots.txt relative to the host URL.
pub const ROBOTS_TXT_PATH: &str = "/robots.txt";
