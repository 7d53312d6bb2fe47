// Media detection for message bodies and out-of-band URLs.
//
// Classification works from the file name in the link. This is hacky,
// but avoids SIMS and additional HTTP requests, and it also covers
// users manually posting plain HTTP links.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::MediaType;

static GEO_URI: Lazy<Regex> = Lazy::new(|| {
    // geo:latitude,longitude with an optional altitude
    Regex::new(r"^geo:-?\d+(\.\d+)?,-?\d+(\.\d+)?(,-?\d+(\.\d+)?)?$")
        .expect("invalid geo URI pattern")
});

/// One recognized attachment, at most one per message.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub media_type: MediaType,
    pub content_type: String,
    pub url: String,
}

pub fn is_http_url(word: &str) -> bool {
    word.starts_with("http://") || word.starts_with("https://")
}

pub fn is_geo_location(word: &str) -> bool {
    GEO_URI.is_match(word)
}

/// Media type and MIME type for a single link, keyed by the extension of
/// the URL path.
pub fn classify_url(url: &str) -> (MediaType, &'static str) {
    if is_geo_location(url) {
        return (MediaType::GeoLocation, "x-scheme-handler/geo");
    }

    let (media_type, content_type) = match url_extension(url).as_str() {
        "png" => (MediaType::Image, "image/png"),
        "jpg" | "jpeg" => (MediaType::Image, "image/jpeg"),
        "gif" => (MediaType::Image, "image/gif"),
        "webp" => (MediaType::Image, "image/webp"),
        "bmp" => (MediaType::Image, "image/bmp"),
        "svg" => (MediaType::Image, "image/svg+xml"),
        "mp3" => (MediaType::Audio, "audio/mpeg"),
        "ogg" | "oga" => (MediaType::Audio, "audio/ogg"),
        "opus" => (MediaType::Audio, "audio/opus"),
        "wav" => (MediaType::Audio, "audio/wav"),
        "m4a" => (MediaType::Audio, "audio/mp4"),
        "flac" => (MediaType::Audio, "audio/flac"),
        "mp4" | "m4v" => (MediaType::Video, "video/mp4"),
        "webm" => (MediaType::Video, "video/webm"),
        "mkv" => (MediaType::Video, "video/x-matroska"),
        "avi" => (MediaType::Video, "video/x-msvideo"),
        "mov" => (MediaType::Video, "video/quicktime"),
        "pdf" => (MediaType::Document, "application/pdf"),
        "odt" => (MediaType::Document, "application/vnd.oasis.opendocument.text"),
        "doc" => (MediaType::Document, "application/msword"),
        "docx" => (
            MediaType::Document,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ),
        "epub" => (MediaType::Document, "application/epub+zip"),
        // Plain text links are not worth rendering as attachments.
        "txt" => (MediaType::Text, "text/plain"),
        "md" => (MediaType::Text, "text/markdown"),
        _ => (MediaType::File, "application/octet-stream"),
    };
    (media_type, content_type)
}

/// Scans the body's whitespace-delimited tokens, with the out-of-band
/// URL prepended, and returns the first token that classifies as media.
/// The out-of-band-first order is contractual: it keeps detection stable
/// when the same link also appears in the body text.
pub fn detect_attachment(body: &str, out_of_band_url: &str) -> Option<Attachment> {
    let mut words: Vec<&str> = Vec::new();
    if !out_of_band_url.is_empty() {
        words.push(out_of_band_url);
    }
    words.extend(body.split_whitespace());

    for word in words {
        if !is_http_url(word) && !is_geo_location(word) {
            continue;
        }

        let (media_type, content_type) = classify_url(word);
        match media_type {
            MediaType::Text | MediaType::Unknown => continue,
            _ => {
                // We can only handle one link.
                return Some(Attachment {
                    media_type,
                    content_type: content_type.to_string(),
                    url: word.to_string(),
                });
            }
        }
    }

    None
}

fn url_extension(url: &str) -> String {
    // Strip query and fragment before looking at the last path segment.
    let path = url
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or(url);
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_recognition() {
        assert!(is_http_url("http://example.org/a.png"));
        assert!(is_http_url("https://example.org/a.png"));
        assert!(!is_http_url("ftp://example.org/a.png"));
        assert!(is_geo_location("geo:48.2082,16.3738"));
        assert!(is_geo_location("geo:-33.8688,151.2093,58"));
        assert!(!is_geo_location("geo:somewhere"));
        assert!(!is_geo_location("48.2082,16.3738"));
    }

    #[test]
    fn test_classification_by_extension() {
        assert_eq!(
            classify_url("https://example.org/photo.JPG"),
            (MediaType::Image, "image/jpeg")
        );
        assert_eq!(
            classify_url("https://example.org/talk.ogg?download=1"),
            (MediaType::Audio, "audio/ogg")
        );
        assert_eq!(
            classify_url("https://example.org/paper.pdf#page=2"),
            (MediaType::Document, "application/pdf")
        );
        assert_eq!(
            classify_url("https://example.org/archive"),
            (MediaType::File, "application/octet-stream")
        );
        assert_eq!(
            classify_url("geo:48.2082,16.3738"),
            (MediaType::GeoLocation, "x-scheme-handler/geo")
        );
    }

    #[test]
    fn test_first_body_link_wins() {
        let attachment =
            detect_attachment("look http://x/a.png and http://x/b.png", "").unwrap();
        assert_eq!(attachment.url, "http://x/a.png");
        assert_eq!(attachment.media_type, MediaType::Image);
    }

    #[test]
    fn test_out_of_band_url_checked_first() {
        let attachment =
            detect_attachment("hello", "http://x/doc.pdf").unwrap();
        assert_eq!(attachment.url, "http://x/doc.pdf");
        assert_eq!(attachment.media_type, MediaType::Document);
        assert_eq!(attachment.content_type, "application/pdf");

        // Even when the body carries its own link, the out-of-band URL
        // still wins.
        let attachment =
            detect_attachment("http://x/a.png", "http://x/doc.pdf").unwrap();
        assert_eq!(attachment.url, "http://x/doc.pdf");
    }

    #[test]
    fn test_unrecognized_tokens_are_skipped() {
        assert_eq!(detect_attachment("just words, no links", ""), None);
        // A plain-text link is skipped, the next recognizable one wins.
        let attachment =
            detect_attachment("see http://x/notes.txt http://x/pic.png", "").unwrap();
        assert_eq!(attachment.url, "http://x/pic.png");
    }

    #[test]
    fn test_geo_location_in_body() {
        let attachment = detect_attachment("geo:48.2082,16.3738", "").unwrap();
        assert_eq!(attachment.media_type, MediaType::GeoLocation);
        assert_eq!(attachment.url, "geo:48.2082,16.3738");
    }
}
