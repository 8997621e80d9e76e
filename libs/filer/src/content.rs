use std::fmt;

/// Payload content type, detected by magic number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    /// nothing recognised, sent raw
    #[default]
    Unknown,
    /// zip archive
    Zip,
    /// gzip stream
    Gzip,
    /// rar archive
    Rar,
    /// webm video
    Webm,
    /// truetype collection
    Ttc,
    /// opentype font
    Otf,
    /// woff font
    Woff,
    /// woff2 font
    Woff2,
    /// webassembly module
    Wasm,
    /// truetype font
    Ttf,
}

// checked in order, first match wins
const SIGNATURES: &[(&[u8], ContentType)] = &[
    (b"PK\x03\x04", ContentType::Zip),
    (b"\x1f\x8b\x08", ContentType::Gzip),
    (b"Rar!\x1a\x07\x00", ContentType::Rar),
    (b"Rar!\x1a\x07\x01\x00", ContentType::Rar),
    (b"\x1a\x45\xdf\xa3", ContentType::Webm),
    (b"ttcf", ContentType::Ttc),
    (b"OTTO", ContentType::Otf),
    (b"wOFF", ContentType::Woff),
    (b"wOF2", ContentType::Woff2),
    (b"\x00asm", ContentType::Wasm),
    (b"\x00\x01\x00\x00", ContentType::Ttf),
];

impl ContentType {
    /// Detect the content type from the leading bytes of a file
    pub fn sniff(buf: &[u8]) -> Self {
        SIGNATURES
            .iter()
            .find(|(magic, _)| buf.starts_with(magic))
            .map(|(_, ty)| *ty)
            .unwrap_or_default()
    }

    /// archives are decompressed before sending
    pub fn is_archive(&self) -> bool {
        matches!(self, ContentType::Zip | ContentType::Gzip)
    }

    /// mime type for the detected content
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Unknown => "application/octet-stream",
            ContentType::Zip => "application/zip",
            ContentType::Gzip => "application/x-gzip",
            ContentType::Rar => "application/x-rar-compressed",
            ContentType::Webm => "video/webm",
            ContentType::Ttc => "font/collection",
            ContentType::Otf => "font/otf",
            ContentType::Woff => "font/woff",
            ContentType::Woff2 => "font/woff2",
            ContentType::Wasm => "application/wasm",
            ContentType::Ttf => "font/ttf",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff() {
        assert_eq!(ContentType::sniff(b""), ContentType::Unknown);
        assert_eq!(ContentType::sniff(b"hello"), ContentType::Unknown);
        assert_eq!(ContentType::sniff(b"PK\x03\x04rest"), ContentType::Zip);
        assert_eq!(ContentType::sniff(b"\x1f\x8b\x08\x00"), ContentType::Gzip);
        assert_eq!(
            ContentType::sniff(b"Rar!\x1a\x07\x01\x00.."),
            ContentType::Rar
        );
        assert_eq!(ContentType::sniff(b"\x00asm\x01"), ContentType::Wasm);
        assert_eq!(ContentType::sniff(b"wOF2...."), ContentType::Woff2);
        assert!(ContentType::Gzip.is_archive());
        assert!(!ContentType::Rar.is_archive());
    }
}
