//! Capture metadata embedded in the camera's JPEG comment segment.
//!
//! The comment follows the `FF FE` marker and its 2-byte length, as a
//! `;`-separated list of `key=value` fields.

use std::collections::HashMap;

const COMMENT_MARKER: [u8; 2] = [0xFF, 0xFE];
const COMMENT_HEADER_LEN: usize = 4;

/// Milliseconds since camera power-on at capture time.
pub const CAPTURE_OFFSET_FIELD: &str = "TempoCaptura";
/// Day/night state; `2` means night.
pub const DAY_NIGHT_FIELD: &str = "SituacaoDayNight";
const NIGHT_MODE: u64 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    pub capture_offset_ms: u64,
    pub is_night_mode: bool,
}

/// Reads the capture metadata. Missing or unparseable fields fall back to
/// offset 0 and day mode.
pub fn extract(image: &[u8]) -> FrameMetadata {
    let fields = comment_fields(image);
    let number = |key: &str| {
        fields
            .get(key)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    };
    FrameMetadata {
        capture_offset_ms: number(CAPTURE_OFFSET_FIELD),
        is_night_mode: number(DAY_NIGHT_FIELD) == NIGHT_MODE,
    }
}

/// All `key=value` fields of the first comment segment. Fields that do not
/// split into exactly two tokens are ignored.
pub fn comment_fields(image: &[u8]) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let Some(start) = image
        .windows(COMMENT_MARKER.len())
        .position(|window| window == COMMENT_MARKER)
    else {
        return fields;
    };
    let body_start = start + COMMENT_HEADER_LEN;
    if body_start > image.len() {
        return fields;
    }

    let segment_len = usize::from(u16::from_be_bytes([image[start + 2], image[start + 3]]));
    let segment_end = start + COMMENT_MARKER.len() + segment_len;
    let body_end = if segment_len >= 2 && segment_end <= image.len() {
        segment_end
    } else {
        image.len()
    };

    let text = String::from_utf8_lossy(&image[body_start..body_end]);
    for field in text.split(';') {
        let parts: Vec<&str> = field.split('=').collect();
        if let [key, value] = parts.as_slice() {
            fields.insert(clean(key), clean(value));
        }
    }
    fields
}

fn clean(raw: &str) -> String {
    raw.trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}
