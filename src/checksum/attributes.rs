//! Attribute names and content type detection

use serde::{Deserialize, Serialize};

use crate::binary::Hint;

/// Bytes inspected when sniffing the content type
pub const SNIFF_LEN: usize = 8 * 1024;

/// Attributes the engine can compute for a binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeName {
    Checksum,
    ContentType,
}

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF", "application/pdf"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x1f\x8b", "application/gzip"),
    (b"BZh", "application/x-bzip2"),
    (b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    (b"\xfd7zXZ\x00", "application/x-xz"),
    (b"Rar!\x1a\x07", "application/vnd.rar"),
    (b"OggS", "audio/ogg"),
    (b"fLaC", "audio/flac"),
    (b"ID3", "audio/mpeg"),
    (b"\x1a\x45\xdf\xa3", "video/webm"),
    (b"\x7fELF", "application/x-elf"),
    (b"\x00asm", "application/wasm"),
];

/// Detect the content type of a binary from its first bytes.
///
/// Order: known magic bytes, then the hinted content type, then the
/// hinted file name's extension, then plain text, then octet-stream.
pub fn detect_content_type(head: &[u8], hint: &Hint) -> String {
    if let Some(mime) = sniff(head, hint) {
        return mime.to_string();
    }

    if let Some(content_type) = hint.content_type.as_deref().map(str::trim) {
        if !content_type.is_empty() {
            return content_type.to_string();
        }
    }

    if let Some(mime) = hint
        .filename
        .as_deref()
        .and_then(|name| mime_guess::from_path(name).first_raw())
    {
        return mime.to_string();
    }

    if looks_like_text(head) {
        return "text/plain".to_string();
    }

    "application/octet-stream".to_string()
}

fn sniff(head: &[u8], hint: &Hint) -> Option<&'static str> {
    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return Some(*mime);
    }

    if head.len() >= 12 && &head[..4] == b"RIFF" {
        match &head[8..12] {
            b"WEBP" => return Some("image/webp"),
            b"WAVE" => return Some("audio/wav"),
            _ => {}
        }
    }

    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return Some("video/mp4");
    }

    // Many formats are ZIP containers, so only claim the ones that say so
    if head.starts_with(b"PK\x03\x04") {
        if head.len() > 30 && contains(&head[..head.len().min(64)], b"epub") {
            return Some("application/epub+zip");
        }

        let by_name = hint
            .filename
            .as_deref()
            .and_then(|name| mime_guess::from_path(name).first_raw());
        return Some(by_name.unwrap_or("application/zip"));
    }

    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn looks_like_text(head: &[u8]) -> bool {
    if head.is_empty() {
        return false;
    }

    let valid = match std::str::from_utf8(head) {
        Ok(_) => true,
        // The head may cut a multi-byte character in half
        Err(e) => e.error_len().is_none(),
    };

    valid
        && !head
            .iter()
            .any(|&b| b.is_ascii_control() && !matches!(b, b'\n' | b'\r' | b'\t' | 0x0c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_bytes_win_over_hint() {
        let hint = Hint::filename("notes.txt").with_content_type("text/plain");
        assert_eq!(detect_content_type(b"%PDF-1.7\n", &hint), "application/pdf");
        assert_eq!(
            detect_content_type(b"\x89PNG\r\n\x1a\n\0\0", &Hint::none()),
            "image/png"
        );
    }

    #[test]
    fn test_hint_content_type_then_filename() {
        let hint = Hint::filename("data.csv").with_content_type("application/x-custom");
        assert_eq!(detect_content_type(b"a,b\n1,2\n", &hint), "application/x-custom");

        let hint = Hint::filename("data.csv");
        assert_eq!(detect_content_type(b"a,b\n1,2\n", &hint), "text/csv");
    }

    #[test]
    fn test_text_fallback() {
        assert_eq!(detect_content_type(b"abcdefghij", &Hint::none()), "text/plain");
        assert_eq!(
            detect_content_type("héllo".as_bytes(), &Hint::none()),
            "text/plain"
        );
        // Truncated multi-byte sequence at the end of the head
        assert_eq!(detect_content_type(&[b'a', 0xc3], &Hint::none()), "text/plain");
    }

    #[test]
    fn test_binary_fallback() {
        assert_eq!(
            detect_content_type(&[0x00, 0x01, 0x02, 0xff], &Hint::none()),
            "application/octet-stream"
        );
        assert_eq!(detect_content_type(b"", &Hint::none()), "application/octet-stream");
    }

    #[test]
    fn test_zip_containers() {
        let mut epub = b"PK\x03\x04".to_vec();
        epub.extend_from_slice(&[0u8; 26]);
        epub.extend_from_slice(b"mimetypeapplication/epub+zip");
        assert_eq!(detect_content_type(&epub, &Hint::none()), "application/epub+zip");

        let zip = b"PK\x03\x04\x14\x00\x00\x00";
        assert_eq!(detect_content_type(zip, &Hint::none()), "application/zip");
    }
}
