use std::sync::OnceLock;

use regex::Regex;

const EXPLICIT_WORDS: [&str; 6] = ["yes", "true", "explicit", "да", "y", "1"];

/// Interprets the loosely typed explicit flag found in records.
pub fn normalize_explicit(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    EXPLICIT_WORDS.contains(&lowered.as_str())
}

/// Canonical rendering of the explicit flag.
pub fn explicit_label(explicit: bool) -> &'static str {
    if explicit {
        "true"
    } else {
        "false"
    }
}

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

/// Wraps markup in CDATA, escapes everything else.
pub fn cdata_or_escape(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    if text.contains(['&', '<', '>']) {
        format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
    } else {
        escape_xml(text)
    }
}

fn numbered_item(line: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\d+\.\s+(.*)$").expect("valid regex"));
    re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn bullet_item(line: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[\x{2022}\-\*]\s+(.*)$").expect("valid regex"));
    re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListState {
    Closed,
    Bullets,
    Ordered { nested: bool },
}

impl ListState {
    fn close(self, out: &mut Vec<String>) {
        match self {
            ListState::Closed => {}
            ListState::Bullets => out.push("</ul>".into()),
            ListState::Ordered { nested } => {
                if nested {
                    out.push("</ul>".into());
                }
                out.push("</li>".into());
                out.push("</ol>".into());
            }
        }
    }
}

/// Converts editor text into paragraphs and lists.
///
/// `1.` lines open an ordered list, `-`, `*` and `•` lines a bullet list.
/// Bullets directly under a numbered item nest inside it; other lines
/// directly under a numbered item continue it.
pub fn plain_text_to_html(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut state = ListState::Closed;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            state.close(&mut out);
            state = ListState::Closed;
            continue;
        }
        if let Some(item) = numbered_item(line) {
            match state {
                ListState::Ordered { nested } => {
                    if nested {
                        out.push("</ul>".into());
                    }
                    out.push("</li>".into());
                }
                other => {
                    other.close(&mut out);
                    out.push("<ol>".into());
                }
            }
            out.push(format!("<li>{}", escape_text(item)));
            state = ListState::Ordered { nested: false };
        } else if let Some(item) = bullet_item(line) {
            match state {
                ListState::Ordered { nested: false } => {
                    out.push("<ul>".into());
                    state = ListState::Ordered { nested: true };
                }
                ListState::Closed => {
                    out.push("<ul>".into());
                    state = ListState::Bullets;
                }
                _ => {}
            }
            out.push(format!("<li>{}</li>", escape_text(item)));
        } else if state == (ListState::Ordered { nested: false }) {
            if let Some(last) = out.last_mut() {
                last.push(' ');
                last.push_str(&escape_text(line));
            }
        } else {
            state.close(&mut out);
            state = ListState::Closed;
            out.push(format!("<p>{}</p>", escape_text(line)));
        }
    }
    state.close(&mut out);
    out.join("\n")
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

const ALLOWED_TAGS: [&str; 5] = ["p", "ul", "ol", "li", "a"];

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<(/?)([A-Za-z][A-Za-z0-9]*)\b([^>]*)>|<!--.*?-->").expect("valid regex")
    })
}

fn dropped_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>").expect("valid regex")
    })
}

fn href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).expect("valid regex")
    })
}

fn entity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^&(?:#[0-9]+|#[xX][0-9a-fA-F]+|[A-Za-z][A-Za-z0-9]*);").expect("valid regex"))
}

/// Reduces HTML to the subset podcast directories render.
///
/// Keeps `p`, `ul`, `ol`, `li` and `a` (with an http, https or mailto
/// `href` only), drops every other tag but keeps its text, and replaces
/// typographic quotes with plain ones.
pub fn sanitize_html_for_rss(html: &str) -> String {
    let html = dropped_block_regex().replace_all(html, "");
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for caps in tag_regex().captures_iter(&html) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&escape_fragment(&html[last..whole.start()]));
        last = whole.end();
        let Some(name) = caps.get(2) else { continue };
        let name = name.as_str().to_ascii_lowercase();
        if !ALLOWED_TAGS.contains(&name.as_str()) {
            continue;
        }
        let closing = caps.get(1).map(|m| !m.as_str().is_empty()).unwrap_or(false);
        if closing {
            out.push_str(&format!("</{name}>"));
        } else if name == "a" {
            let attrs = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            match safe_href(attrs) {
                Some(href) => out.push_str(&format!("<a href=\"{}\">", escape_xml(&href))),
                None => out.push_str("<a>"),
            }
        } else {
            out.push_str(&format!("<{name}>"));
        }
    }
    out.push_str(&escape_fragment(&html[last..]));
    out.replace("&rsquo;", "'")
        .replace("&lsquo;", "'")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
}

fn safe_href(attrs: &str) -> Option<String> {
    let caps = href_regex().captures(attrs)?;
    let value = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))?
        .as_str()
        .trim();
    let lowered = value.to_ascii_lowercase();
    let allowed = ["http://", "https://", "mailto:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme));
    allowed.then(|| value.replace("&amp;", "&"))
}

/// Escapes text between tags, leaving existing entities intact.
fn escape_fragment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (idx, c) in text.char_indices() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' if entity_regex().is_match(&text[idx..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_words_are_recognized() {
        for word in ["yes", " TRUE ", "Explicit", "да", "y", "1"] {
            assert!(normalize_explicit(word), "{word}");
        }
        for word in ["no", "false", "", "clean", "0"] {
            assert!(!normalize_explicit(word), "{word}");
        }
        assert_eq!(explicit_label(true), "true");
        assert_eq!(explicit_label(false), "false");
    }

    #[test]
    fn cdata_only_when_markup_present() {
        assert_eq!(cdata_or_escape("plain"), "plain");
        assert_eq!(cdata_or_escape("a & b"), "<![CDATA[a & b]]>");
        assert_eq!(cdata_or_escape(""), "");
    }

    #[test]
    fn paragraphs_and_lists() {
        let html = plain_text_to_html("Intro line\n\n- one\n- two\n\nOutro");
        assert_eq!(
            html,
            "<p>Intro line</p>\n<ul>\n<li>one</li>\n<li>two</li>\n</ul>\n<p>Outro</p>"
        );
    }

    #[test]
    fn numbered_items_nest_bullets() {
        let html = plain_text_to_html("1. First\n• detail\n2. Second\ncontinued");
        assert_eq!(
            html,
            "<ol>\n<li>First\n<ul>\n<li>detail</li>\n</ul>\n</li>\n<li>Second continued\n</li>\n</ol>"
        );
    }

    #[test]
    fn sanitizer_keeps_allowed_subset() {
        let html = r#"<div class="x"><p style="color:red">Hi <b>there</b></p><script>alert(1)</script><a href="https://example.com/?a=1&b=2" onclick="x()">link</a><a href="javascript:alert(1)">bad</a></div>"#;
        assert_eq!(
            sanitize_html_for_rss(html),
            r#"<p>Hi there</p><a href="https://example.com/?a=1&amp;b=2">link</a><a>bad</a>"#
        );
    }

    #[test]
    fn sanitizer_normalizes_quotes_and_ampersands() {
        assert_eq!(
            sanitize_html_for_rss("It&rsquo;s \u{201C}fine\u{201D} & done &amp; dusted"),
            "It's \"fine\" &amp; done &amp; dusted"
        );
    }
}
