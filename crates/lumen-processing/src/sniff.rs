//! Content sniffing: media kind and MIME type from leading bytes, never from the filename.

use lumen_core::models::MediaKind;

/// Bytes of leading content enough for every signature below.
pub const SNIFF_LEN: usize = 512;

/// Result of a successful sniff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    pub kind: MediaKind,
    pub mime: &'static str,
}

impl Sniffed {
    const fn image(mime: &'static str) -> Self {
        Self {
            kind: MediaKind::Image,
            mime,
        }
    }

    const fn video(mime: &'static str) -> Self {
        Self {
            kind: MediaKind::Video,
            mime,
        }
    }
}

/// Identify an image from its signature.
pub fn sniff_image(header: &[u8]) -> Option<Sniffed> {
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(Sniffed::image("image/jpeg"));
    }
    if header.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(Sniffed::image("image/png"));
    }
    if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        return Some(Sniffed::image("image/gif"));
    }
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        return Some(Sniffed::image("image/webp"));
    }
    None
}

/// Major brands of `ftyp` boxes that announce an MP4 family video.
const MP4_VIDEO_BRANDS: &[&[u8]] = &[
    b"isom", b"iso2", b"iso3", b"iso4", b"iso5", b"iso6", b"mp41", b"mp42", b"mp71", b"avc1",
    b"dash", b"mmp4", b"MSNV", b"f4v ", b"3gp4", b"3gp5", b"3gp6", b"3g2a", b"3g2b", b"3g2c",
];

/// Identify a video container from its signature.
pub fn sniff_video(header: &[u8]) -> Option<Sniffed> {
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        // ISO base media also carries stills (HEIC, AVIF) and audio; only video brands count.
        return match &header[8..12] {
            b"qt  " => Some(Sniffed::video("video/quicktime")),
            b"M4V " | b"M4VH" | b"M4VP" => Some(Sniffed::video("video/x-m4v")),
            brand if MP4_VIDEO_BRANDS.contains(&brand) => Some(Sniffed::video("video/mp4")),
            _ => None,
        };
    }
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        // The EBML doctype string appears within the first few dozen bytes.
        let window = &header[..header.len().min(64)];
        let is_webm = window.windows(4).any(|w| w == b"webm");
        return Some(if is_webm {
            Sniffed::video("video/webm")
        } else {
            Sniffed::video("video/x-matroska")
        });
    }
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"AVI " {
        return Some(Sniffed::video("video/x-msvideo"));
    }
    if header.starts_with(b"OggS") {
        return Some(Sniffed::video("video/ogg"));
    }
    None
}

/// Identify any supported media.
pub fn sniff(header: &[u8]) -> Option<Sniffed> {
    sniff_image(header).or_else(|| sniff_video(header))
}
