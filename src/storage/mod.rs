//! Physical backends.
//!
//! The [`backend::ObjectBackend`] trait abstracts over one S3-compatible
//! endpoint.  Implementations are an HTTP client for real endpoints
//! ([`s3::S3Backend`]) and an in-process store ([`memory::MemoryBackend`]).

pub mod backend;
pub mod listing;
pub mod memory;
pub mod registry;
pub mod s3;

use percent_encoding::percent_decode_str;

/// Turn a raw request path (without the leading `/`) into a virtual key.
///
/// The path is decoded once.  Some clients double-encode keys, so a second
/// decode is applied only when the first result still contains a `%XX`
/// escape.
pub fn decode_virtual_key(raw: &str) -> String {
    let once = percent_decode_str(raw).decode_utf8_lossy().into_owned();
    if contains_escape(&once) {
        percent_decode_str(&once).decode_utf8_lossy().into_owned()
    } else {
        once
    }
}

fn contains_escape(s: &str) -> bool {
    s.as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1].is_ascii_hexdigit() && w[2].is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_once() {
        assert_eq!(decode_virtual_key("photos/cat%20one.jpg"), "photos/cat one.jpg");
        assert_eq!(decode_virtual_key("plain/key.txt"), "plain/key.txt");
    }

    #[test]
    fn test_decode_twice_when_escape_survives() {
        assert_eq!(decode_virtual_key("a%2520b"), "a b");
    }

    #[test]
    fn test_lone_percent_left_alone() {
        assert_eq!(decode_virtual_key("100%"), "100%");
        assert_eq!(decode_virtual_key("100%25"), "100%");
        assert_eq!(decode_virtual_key("50%zz"), "50%zz");
    }
}
