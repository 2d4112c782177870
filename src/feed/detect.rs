use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::storage::FeedFormat;

/// Classify downloaded feed text.
///
/// A well-formed XML document (exactly one root element, balanced tags,
/// nothing but whitespace outside the root) is `Rss`; this also covers
/// Atom and RDF since one parser handles all of them. Otherwise text that
/// starts with `{` and ends with `}` is `Json`. Everything else is
/// `Unknown`. Purely syntactic: no schema checks, but attributes must be
/// quoted and unique, and every entity reference must be a predefined or
/// character one.
pub fn detect_format(text: &str) -> FeedFormat {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return FeedFormat::Unknown;
    }
    if is_xml_document(trimmed) {
        FeedFormat::Rss
    } else if trimmed.starts_with('{') && trimmed.ends_with('}') {
        FeedFormat::Json
    } else {
        FeedFormat::Unknown
    }
}

fn is_xml_document(text: &str) -> bool {
    let mut reader = Reader::from_str(text);
    reader.config_mut().check_end_names = true;

    let mut depth: usize = 0;
    let mut roots: usize = 0;

    loop {
        let decoder = reader.decoder();
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if !attributes_well_formed(&e, decoder) {
                    return false;
                }
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if !attributes_well_formed(&e, decoder) {
                    return false;
                }
                if depth == 0 {
                    roots += 1;
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Ok(Event::Text(t)) if depth == 0 => {
                if !t.iter().all(u8::is_ascii_whitespace) {
                    return false;
                }
            }
            Ok(Event::Text(t)) => {
                if t.unescape().is_err() {
                    return false;
                }
            }
            Ok(Event::CData(_)) if depth == 0 => return false,
            Ok(Event::Eof) => return depth == 0 && roots == 1,
            Ok(_) => {}
            Err(_) => return false,
        }
        if roots > 1 {
            return false;
        }
    }
}

fn attributes_well_formed(element: &BytesStart<'_>, decoder: Decoder) -> bool {
    element.attributes().with_checks(true).all(|attr| {
        attr.is_ok_and(|a| a.decode_and_unescape_value(decoder).is_ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rss_document() {
        let rss = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>T</title></channel></rss>"#;
        assert_eq!(detect_format(rss), FeedFormat::Rss);
    }

    #[test]
    fn test_atom_document_with_leading_whitespace() {
        let atom = "\n\n  <feed xmlns=\"http://www.w3.org/2005/Atom\"><title>T</title></feed>\n";
        assert_eq!(detect_format(atom), FeedFormat::Rss);
    }

    #[test]
    fn test_single_empty_element_is_xml() {
        assert_eq!(detect_format("<rss/>"), FeedFormat::Rss);
    }

    #[test]
    fn test_comment_and_doctype_outside_root_allowed() {
        let xml = "<?xml version=\"1.0\"?><!-- generated --><!DOCTYPE rss><rss></rss>";
        assert_eq!(detect_format(xml), FeedFormat::Rss);
    }

    #[test]
    fn test_json_object() {
        let json = r#"{"version":"https://jsonfeed.org/version/1.1","title":"T","items":[]}"#;
        assert_eq!(detect_format(json), FeedFormat::Json);
    }

    #[test]
    fn test_json_with_markup_in_strings() {
        let json = r#"{"items":[{"content_html":"<p>Hello</p>"}]}"#;
        assert_eq!(detect_format(json), FeedFormat::Json);
    }

    #[test]
    fn test_unknown_inputs() {
        assert_eq!(detect_format(""), FeedFormat::Unknown);
        assert_eq!(detect_format("   \n\t"), FeedFormat::Unknown);
        assert_eq!(detect_format("plain text"), FeedFormat::Unknown);
        assert_eq!(detect_format("[1, 2, 3]"), FeedFormat::Unknown);
    }

    #[test]
    fn test_malformed_xml_is_unknown() {
        // Unclosed root
        assert_eq!(detect_format("<rss><channel></channel>"), FeedFormat::Unknown);
        // Mismatched end tag
        assert_eq!(detect_format("<rss><channel></rss></channel>"), FeedFormat::Unknown);
        // Two roots
        assert_eq!(detect_format("<a></a><b></b>"), FeedFormat::Unknown);
        // Trailing text after the root
        assert_eq!(detect_format("<rss></rss> trailing"), FeedFormat::Unknown);
    }

    #[test]
    fn test_malformed_attributes_and_entities_are_unknown() {
        assert_eq!(
            detect_format("<rss version=2.0><channel/></rss>"),
            FeedFormat::Unknown
        );
        assert_eq!(
            detect_format("<rss a=\"1\" a=\"2\"><channel/></rss>"),
            FeedFormat::Unknown
        );
        assert_eq!(
            detect_format("<rss><title>&nbsp;</title></rss>"),
            FeedFormat::Unknown
        );
        assert_eq!(
            detect_format("<rss><link href=\"/?a=1&b=2\"/></rss>"),
            FeedFormat::Unknown
        );
    }

    #[test]
    fn test_predefined_and_character_entities_are_fine() {
        let xml = "<rss version=\"2.0\"><title a=\"x&amp;y\">Tom &amp; Jerry &#169; &#x2014;</title></rss>";
        assert_eq!(detect_format(xml), FeedFormat::Rss);
    }

    #[test]
    fn test_html_page_is_not_a_feed() {
        let html = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head><body><br></body></html>";
        assert_eq!(detect_format(html), FeedFormat::Unknown);
    }

    proptest! {
        #[test]
        fn prop_braced_non_xml_text_is_json(body in "[a-z0-9 :,\"]{0,40}") {
            let text = format!("{{{}}}", body);
            prop_assert_eq!(detect_format(&text), FeedFormat::Json);
        }

        #[test]
        fn prop_surrounding_whitespace_does_not_matter(
            lead in "[ \t\r\n]{0,5}",
            trail in "[ \t\r\n]{0,5}",
            pick in 0usize..3,
        ) {
            let bodies = ["<rss><channel/></rss>", "{\"title\":\"T\"}", "hello"];
            let body = bodies[pick];
            let padded = format!("{lead}{body}{trail}");
            prop_assert_eq!(detect_format(&padded), detect_format(body));
        }

        #[test]
        fn prop_detection_never_panics(text in "\\PC{0,200}") {
            let _ = detect_format(&text);
        }
    }
}
