//! MIME 推断：魔数优先，其次响应头，最后按 URL 扩展名猜测

/// 识别媒体类型；都失败时返回 application/octet-stream
pub fn sniff_mime(bytes: &[u8], content_type: Option<&str>, url: &str) -> String {
    if let Some(mime) = sniff_magic(bytes) {
        return mime.to_string();
    }

    if let Some(header) = content_type {
        let essence = header.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        if !essence.is_empty() && essence != "application/octet-stream" {
            return essence;
        }
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn sniff_magic(bytes: &[u8]) -> Option<&'static str> {
    let starts = |magic: &[u8]| bytes.starts_with(magic);
    let at = |offset: usize, magic: &[u8]| bytes.get(offset..offset + magic.len()) == Some(magic);

    if starts(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if starts(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if starts(b"GIF87a") || starts(b"GIF89a") {
        Some("image/gif")
    } else if starts(b"RIFF") && at(8, b"WEBP") {
        Some("image/webp")
    } else if starts(b"RIFF") && at(8, b"WAVE") {
        Some("audio/wav")
    } else if starts(b"BM") && bytes.len() > 14 {
        Some("image/bmp")
    } else if starts(b"ID3") || starts(&[0xFF, 0xFB]) || starts(&[0xFF, 0xF3]) || starts(&[0xFF, 0xF2]) {
        Some("audio/mpeg")
    } else if starts(b"OggS") {
        Some("audio/ogg")
    } else if starts(b"fLaC") {
        Some("audio/flac")
    } else if at(4, b"ftypM4A") {
        Some("audio/mp4")
    } else if at(4, b"ftypqt") {
        Some("video/quicktime")
    } else if at(4, b"ftyp") {
        Some("video/mp4")
    } else if starts(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some("video/webm")
    } else {
        None
    }
}

/// 音频 MIME → 供应商使用的格式名（mp3 / wav / ...）
pub fn audio_format(mime: &str) -> String {
    match mime {
        "audio/mpeg" | "audio/mp3" => "mp3".to_string(),
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav".to_string(),
        "audio/mp4" | "audio/x-m4a" => "m4a".to_string(),
        other => other.strip_prefix("audio/").unwrap_or("mp3").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_beats_header() {
        let png = b"\x89PNG\r\n\x1a\n....";
        assert_eq!(sniff_mime(png, Some("text/plain"), "https://x/a.bin"), "image/png");
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0];
        assert_eq!(sniff_mime(&jpeg, None, ""), "image/jpeg");
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0WAVEfmt ", None, ""), "audio/wav");
        assert_eq!(sniff_mime(b"\0\0\0\x18ftypmp42", None, ""), "video/mp4");
    }

    #[test]
    fn test_header_then_extension() {
        assert_eq!(sniff_mime(b"????", Some("image/avif; charset=binary"), ""), "image/avif");
        assert_eq!(
            sniff_mime(b"????", Some("application/octet-stream"), "https://x/clip.mp3?sig=1"),
            "audio/mpeg"
        );
        assert_eq!(sniff_mime(b"????", None, "https://x/blob"), "application/octet-stream");
    }

    #[test]
    fn test_audio_format() {
        assert_eq!(audio_format("audio/mpeg"), "mp3");
        assert_eq!(audio_format("audio/x-wav"), "wav");
        assert_eq!(audio_format("audio/ogg"), "ogg");
    }
}
