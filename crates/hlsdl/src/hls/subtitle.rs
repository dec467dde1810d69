// WebVTT assembly for segmented and direct subtitle tracks.

const WEBVTT: &str = "WEBVTT";

/// Split a fragment into its header block (`WEBVTT` line plus any header lines up to the first
/// blank line) and the cue body.
fn split_header(text: &str) -> (Option<&str>, &str) {
    if !text.starts_with(WEBVTT) {
        return (None, text);
    }
    match text.find("\n\n") {
        Some(end) => (Some(&text[..end]), text[end..].trim_start()),
        None => (Some(text), ""),
    }
}

fn normalize(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_start_matches('\u{feff}')
        .replace("\r\n", "\n")
        .trim()
        .to_string()
}

/// Join WebVTT fragments in order into one document with a single leading header.
///
/// The first fragment's header block is kept (it may carry `X-TIMESTAMP-MAP`); the headers of
/// later fragments are dropped.
pub fn join_webvtt<B: AsRef<[u8]>>(fragments: &[B]) -> String {
    let mut header: Option<String> = None;
    let mut bodies = Vec::with_capacity(fragments.len());

    for fragment in fragments {
        let text = normalize(fragment.as_ref());
        let (fragment_header, body) = split_header(&text);
        if header.is_none()
            && let Some(h) = fragment_header
        {
            header = Some(h.to_string());
        }
        if !body.is_empty() {
            bodies.push(body.to_string());
        }
    }

    let mut out = header.unwrap_or_else(|| WEBVTT.to_string());
    for body in bodies {
        out.push_str("\n\n");
        out.push_str(&body);
    }
    out.push('\n');
    out
}

/// A subtitle served as a single file: make sure it starts with the `WEBVTT` header.
pub fn ensure_webvtt_header(bytes: &[u8]) -> String {
    join_webvtt(&[bytes])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_a_single_header() {
        let fragments = [
            "WEBVTT\nX-TIMESTAMP-MAP=MPEGTS:900000,LOCAL:00:00:00.000\n\n00:00:01.000 --> 00:00:02.000\nHello\n",
            "WEBVTT\nX-TIMESTAMP-MAP=MPEGTS:900000,LOCAL:00:00:00.000\n\n00:00:03.000 --> 00:00:04.000\nWorld\n",
        ];
        let joined = join_webvtt(&fragments);
        assert_eq!(joined.matches("WEBVTT").count(), 1);
        assert!(joined.starts_with("WEBVTT\nX-TIMESTAMP-MAP"));
        let hello = joined.find("Hello").unwrap();
        let world = joined.find("World").unwrap();
        assert!(hello < world);
    }

    #[test]
    fn adds_missing_header() {
        let text = ensure_webvtt_header(b"00:00:01.000 --> 00:00:02.000\nHi\n");
        assert_eq!(text, "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nHi\n");
    }

    #[test]
    fn header_only_fragments_are_skipped() {
        let joined = join_webvtt(&["WEBVTT\n\n", "\u{feff}WEBVTT\r\n\r\n00:00:01.000 --> 00:00:02.000\r\nA\r\n"]);
        assert_eq!(joined, "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nA\n");
    }
}
