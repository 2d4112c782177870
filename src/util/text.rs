use std::borrow::Cow;

fn is_stripped_control(b: u8) -> bool {
    b == 0x1b || b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
}

/// Strip control characters and ANSI escape sequences from feed-supplied text.
///
/// Removes C0 controls other than tab/newline/CR, DEL, CSI sequences
/// (`ESC [` ... final byte 0x40-0x7E), OSC sequences (`ESC ]` ... BEL or
/// `ESC \`) and bare ESC bytes. Returns `Cow::Borrowed` when nothing needs
/// stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    if !bytes.iter().copied().any(is_stripped_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    let len = bytes.len();

    while i < len {
        match bytes[i] {
            0x1b if bytes.get(i + 1) == Some(&b'[') => {
                i += 2;
                while i < len {
                    let c = bytes[i];
                    i += 1;
                    if (0x40..=0x7e).contains(&c) {
                        break;
                    }
                }
            }
            0x1b if bytes.get(i + 1) == Some(&b']') => {
                i += 2;
                while i < len {
                    if bytes[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            b if is_stripped_control(b) => i += 1,
            _ => {
                let start = i;
                while i < len && !is_stripped_control(bytes[i]) {
                    i += 1;
                }
                // Only ASCII bytes stop the run, so the slice is on char boundaries
                out.push_str(&s[start..i]);
            }
        }
    }

    Cow::Owned(out)
}

/// Decode HTML character references (`&amp;`, `&#8217;`, ...).
pub fn decode_html(s: &str) -> String {
    html_escape::decode_html_entities(s).into_owned()
}

/// Single-line display text: entities decoded, controls stripped, trimmed.
/// `None` when nothing is left.
pub fn clean_text(s: &str) -> Option<String> {
    let decoded = decode_html(s);
    let stripped = strip_control_chars(&decoded);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
