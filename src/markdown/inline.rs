//! Inline markup: emphasis, strong emphasis and links.
//!
//! Parsing runs pulldown-cmark over one block's text and maps its
//! emphasis, strong and link events to spans in plain-text byte offsets.
//! Delimiters the parser leaves as literal text are rejected when they
//! could have opened something, so a typo surfaces as an error instead of
//! vanishing markup. Serializing uses a marker stack that always closes
//! before it opens and never opens a kind that is already open.

use crate::error::FormatError;
use crate::model::{InlineKind, InlineSpan, coalesce_inline};
use pulldown_cmark::{Event, LinkType, Options, Parser, Tag, TagEnd};
use std::ops::Range;

/// CommonMark core only; no tables, footnotes or strikethrough.
const OPTIONS: Options = Options::empty();

const ESCAPED: [char; 8] = ['\\', '*', '_', '[', ']', '`', '<', '&'];

/// Block text as handed to the CommonMark parser: leading indentation
/// dropped and a backslash in front of anything that would start a block
/// of its own, with a map back to source offsets.
struct Fragment<'a> {
    source: &'a str,
    text: String,
    /// Source offset of each byte of `text`, plus one entry for its end.
    offsets: Vec<usize>,
}

impl<'a> Fragment<'a> {
    fn new(source: &'a str, start: usize, end: usize) -> Self {
        let mut fragment = Fragment {
            source,
            text: String::with_capacity(end - start + 4),
            offsets: Vec::with_capacity(end - start + 5),
        };
        let mut line_start = start;
        for raw in source[start..end].split_inclusive('\n') {
            let body = raw.trim_end_matches(['\n', '\r']);
            let content = body.trim_start_matches([' ', '\t']);
            let content_start = line_start + body.len() - content.len();
            match block_marker(content) {
                Some(at) => {
                    fragment.push(&content[..at], content_start);
                    fragment.push("\\", content_start + at);
                    fragment.push(&content[at..], content_start + at);
                }
                None => fragment.push(content, content_start),
            }
            if raw.ends_with('\n') {
                fragment.push("\n", line_start + body.len());
            }
            line_start += raw.len();
        }
        fragment.offsets.push(end);
        fragment
    }

    fn push(&mut self, text: &str, at: usize) {
        self.text.push_str(text);
        self.offsets.extend(at..at + text.len());
    }

    fn error(&self, at: usize, message: impl Into<String>) -> FormatError {
        FormatError::at_offset(self.source, self.offsets[at], message)
    }

    fn escaped_positions(&self) -> Vec<bool> {
        let bytes = self.text.as_bytes();
        let mut escaped = vec![false; bytes.len()];
        let mut at = 0;
        while at < bytes.len() {
            if bytes[at] == b'\\' && bytes.get(at + 1).is_some_and(u8::is_ascii_punctuation) {
                escaped[at + 1] = true;
                at += 2;
            } else {
                at += 1;
            }
        }
        escaped
    }

    /// Fails on the first unescaped delimiter inside literal text that could
    /// have opened emphasis or a link.
    fn check_literals(&self, literals: &[Range<usize>]) -> Result<(), FormatError> {
        let escaped = self.escaped_positions();
        for range in literals {
            for (offset, ch) in self.text[range.clone()].char_indices() {
                let at = range.start + offset;
                if escaped[at] {
                    continue;
                }
                match ch {
                    '*' | '_' => {
                        let run = self.delimiter_run(at, &escaped);
                        if self.can_open(&run) {
                            return Err(self.error(run.start, "unterminated emphasis"));
                        }
                    }
                    '[' => {
                        let (at, message) = self.bracket_problem(at, &escaped);
                        return Err(self.error(at, message));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn delimiter_run(&self, at: usize, escaped: &[bool]) -> Range<usize> {
        let bytes = self.text.as_bytes();
        let marker = bytes[at];
        let mut start = at;
        while start > 0 && bytes[start - 1] == marker && !escaped[start - 1] {
            start -= 1;
        }
        let mut end = at + 1;
        while end < bytes.len() && bytes[end] == marker && !escaped[end] {
            end += 1;
        }
        start..end
    }

    fn can_open(&self, run: &Range<usize>) -> bool {
        let prev = self.text[..run.start].chars().next_back();
        let next = self.text[run.end..].chars().next();
        let space = |c: Option<char>| c.is_none_or(char::is_whitespace);
        let punct = |c: Option<char>| c.is_some_and(|c| c.is_ascii_punctuation());
        let left = !space(next) && (!punct(next) || space(prev) || punct(prev));
        let right = !space(prev) && (!punct(prev) || space(next) || punct(next));
        if self.text.as_bytes()[run.start] == b'_' {
            left && (!right || punct(prev))
        } else {
            left
        }
    }

    /// Explains why the `[` at `open` did not become a link or image.
    fn bracket_problem(&self, open: usize, escaped: &[bool]) -> (usize, String) {
        let bytes = self.text.as_bytes();
        let image = open > 0 && bytes[open - 1] == b'!' && !escaped[open - 1];
        let (construct, label) = if image {
            ("image", "alt")
        } else {
            ("link", "link")
        };

        let mut depth = 0usize;
        let mut close = None;
        for at in open + 1..bytes.len() {
            if escaped[at] {
                continue;
            }
            match bytes[at] {
                b'[' => depth += 1,
                b']' if depth == 0 => {
                    close = Some(at);
                    break;
                }
                b']' => depth -= 1,
                _ => {}
            }
        }
        let Some(close) = close else {
            return (open, format!("malformed {construct}: unterminated {label} text"));
        };
        let paren = close + 1;
        if bytes.get(paren) != Some(&b'(') {
            return (
                paren,
                format!("malformed {construct}: expected '(' after {construct} text"),
            );
        }

        let mut depth = 0usize;
        for at in paren + 1..bytes.len() {
            if escaped[at] {
                continue;
            }
            match bytes[at] {
                b'(' => depth += 1,
                b')' if depth == 0 => {
                    return (paren, format!("malformed {construct}: invalid destination"));
                }
                b')' => depth -= 1,
                b'\n' => break,
                _ => {}
            }
        }
        (
            paren,
            format!("malformed {construct}: unterminated destination"),
        )
    }
}

/// Backslash position that keeps a line from opening a block construct.
fn block_marker(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let first = *bytes.first()?;
    match first {
        b'#' | b'>' | b'=' | b'-' | b'+' | b'~' | b'<' => Some(0),
        b'*' | b'_' => {
            let item = bytes.get(1).is_none_or(u8::is_ascii_whitespace);
            let rule = bytes.iter().all(|b| *b == first || *b == b' ' || *b == b'\t')
                && bytes.iter().filter(|b| **b == first).count() >= 3;
            (item || rule).then_some(0)
        }
        b'`' => (bytes.iter().take_while(|b| **b == b'`').count() >= 3).then_some(0),
        b'[' => {
            let close = line.find(']')?;
            line[close + 1..].starts_with(':').then_some(0)
        }
        b'0'..=b'9' => {
            let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
            matches!(bytes.get(digits), Some(b'.' | b')')).then_some(digits)
        }
        _ => None,
    }
}

/// Consumes events up to and including the end of the element just started.
fn skip_element<'e>(events: &mut impl Iterator<Item = (Event<'e>, Range<usize>)>) {
    let mut depth = 1usize;
    for (event, _) in events {
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// Parses `source[start..end]`, reporting errors against positions in the
/// whole `source`.
pub(crate) fn parse_inline(
    source: &str,
    start: usize,
    end: usize,
) -> Result<(String, Vec<InlineSpan>), FormatError> {
    let fragment = Fragment::new(source, start, end);
    let mut plain = String::with_capacity(end - start);
    let mut spans = Vec::new();
    let mut open: Vec<(usize, InlineKind)> = Vec::new();
    let mut literals = Vec::new();

    let mut events = Parser::new_ext(&fragment.text, OPTIONS).into_offset_iter();
    while let Some((event, range)) = events.next() {
        match event {
            Event::Text(text) => {
                plain.push_str(&text);
                literals.push(range);
            }
            Event::SoftBreak | Event::HardBreak => plain.push('\n'),
            Event::Start(Tag::Emphasis) => open.push((plain.len(), InlineKind::Italic)),
            Event::Start(Tag::Strong) => open.push((plain.len(), InlineKind::Bold)),
            Event::Start(Tag::Link {
                link_type: LinkType::Inline,
                dest_url,
                ..
            }) => {
                if dest_url.trim().is_empty() {
                    return Err(fragment.error(range.start, "malformed link: empty destination"));
                }
                let url = dest_url.into_string();
                open.push((plain.len(), InlineKind::Hyperlink { url }));
            }
            // autolinks and inline images stay verbatim
            Event::Start(Tag::Link { .. } | Tag::Image { .. }) => {
                plain.push_str(&fragment.text[range]);
                skip_element(&mut events);
            }
            Event::End(TagEnd::Emphasis | TagEnd::Strong | TagEnd::Link) => {
                if let Some((plain_start, kind)) = open.pop() {
                    spans.push(InlineSpan::new(kind, plain_start, plain.len()));
                }
            }
            Event::Start(_) | Event::End(_) => {}
            _ => plain.push_str(&fragment.text[range]),
        }
    }

    fragment.check_literals(&literals)?;
    coalesce_inline(&mut spans);
    Ok((plain, spans))
}

/// Parses a line holding exactly one image; returns its alt text and path.
pub(crate) fn parse_image(
    source: &str,
    start: usize,
    end: usize,
) -> Result<(String, String), FormatError> {
    let fragment = Fragment::new(source, start, end);
    let mut events = Parser::new_ext(&fragment.text, OPTIONS)
        .into_offset_iter()
        .filter(|(event, _)| {
            !matches!(event, Event::Start(Tag::Paragraph) | Event::End(TagEnd::Paragraph))
        });

    let (dest_url, image_end) = match events.next() {
        Some((
            Event::Start(Tag::Image {
                link_type: LinkType::Inline,
                dest_url,
                ..
            }),
            range,
        )) if range.start == 0 => (dest_url, range.end),
        _ => {
            let escaped = fragment.escaped_positions();
            let (at, message) = fragment.bracket_problem(1, &escaped);
            return Err(fragment.error(at, message));
        }
    };
    if image_end != fragment.text.len() {
        return Err(fragment.error(
            image_end,
            "malformed image: unexpected text after image",
        ));
    }
    if dest_url.trim().is_empty() {
        return Err(fragment.error(0, "malformed image: empty destination"));
    }

    let mut alt = String::new();
    let mut depth = 0usize;
    for (event, range) in events {
        match event {
            Event::End(TagEnd::Image) if depth == 0 => break,
            Event::Start(_) => depth += 1,
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Text(text) => alt.push_str(&text),
            Event::SoftBreak | Event::HardBreak => alt.push(' '),
            _ => alt.push_str(&fragment.text[range]),
        }
    }
    Ok((alt, dest_url.into_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    Link(String),
    Bold,
    Italic,
}

impl Marker {
    fn open(&self) -> &'static str {
        match self {
            Marker::Link(_) => "[",
            Marker::Bold => "**",
            Marker::Italic => "*",
        }
    }

    fn close(&self, out: &mut String) {
        match self {
            Marker::Link(url) => {
                out.push_str("](");
                out.push_str(&escape_url(url));
                out.push(')');
            }
            Marker::Bold => out.push_str("**"),
            Marker::Italic => out.push('*'),
        }
    }
}

/// Renders plain text plus inline spans back to markup.
pub(crate) fn serialize_inline(plain: &str, spans: &[InlineSpan]) -> String {
    let spans = normalize_for_output(plain, spans);
    let mut boundaries: Vec<usize> = spans.iter().flat_map(|s| [s.start, s.end]).collect();
    boundaries.push(0);
    boundaries.push(plain.len());
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut out = String::with_capacity(plain.len() + spans.len() * 4);
    let mut stack: Vec<Marker> = Vec::new();
    for window in boundaries.windows(2) {
        let (seg_start, seg_end) = (window[0], window[1]);
        let desired = active_markers(&spans, seg_start, seg_end);

        if let Some(first_stale) = stack.iter().position(|m| !desired.contains(m)) {
            while stack.len() > first_stale {
                if let Some(marker) = stack.pop() {
                    marker.close(&mut out);
                }
            }
        }
        for marker in desired {
            if !stack.contains(&marker) {
                // "![" would read back as an image
                if matches!(marker, Marker::Link(_)) && out.ends_with('!') {
                    out.pop();
                    out.push_str("\\!");
                }
                out.push_str(marker.open());
                stack.push(marker);
            }
        }
        escape_into(&plain[seg_start..seg_end], &mut out);
    }
    while let Some(marker) = stack.pop() {
        marker.close(&mut out);
    }
    out
}

fn active_markers(spans: &[InlineSpan], start: usize, end: usize) -> Vec<Marker> {
    let covering = |span: &&InlineSpan| span.start <= start && end <= span.end;
    let mut markers = Vec::new();
    if let Some(url) = spans.iter().filter(covering).find_map(InlineSpan::url) {
        markers.push(Marker::Link(url.to_string()));
    }
    if spans
        .iter()
        .filter(covering)
        .any(|s| s.kind == InlineKind::Bold)
    {
        markers.push(Marker::Bold);
    }
    if spans
        .iter()
        .filter(covering)
        .any(|s| s.kind == InlineKind::Italic)
    {
        markers.push(Marker::Italic);
    }
    markers
}

/// Clamps spans to char boundaries and pulls emphasis off surrounding
/// whitespace, since a marker next to whitespace cannot open or close.
fn normalize_for_output(plain: &str, spans: &[InlineSpan]) -> Vec<InlineSpan> {
    let mut out: Vec<InlineSpan> = spans
        .iter()
        .filter_map(|span| {
            let mut start = floor_char_boundary(plain, span.start.min(plain.len()));
            let mut end = floor_char_boundary(plain, span.end.min(plain.len()));
            if !matches!(span.kind, InlineKind::Hyperlink { .. }) {
                let inner = &plain[start..end];
                let trimmed_start = inner.len() - inner.trim_start().len();
                let trimmed_end = inner.len() - inner.trim_end().len();
                start += trimmed_start;
                end = end.saturating_sub(trimmed_end).max(start);
            }
            (start < end).then(|| InlineSpan::new(span.kind.clone(), start, end))
        })
        .collect();
    coalesce_inline(&mut out);
    out
}

pub(crate) fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

pub(crate) fn escape_into(text: &str, out: &mut String) {
    for ch in text.chars() {
        if ESCAPED.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
}

pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    escape_into(text, &mut out);
    out
}

/// Link destination markup. URLs with whitespace or angle brackets use the
/// `<...>` form; otherwise parentheses are escaped only when unbalanced.
pub(crate) fn escape_url(url: &str) -> String {
    let pointy = url
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control() || ch == '<' || ch == '>');
    let mut depth = 0i64;
    let mut balanced = true;
    for ch in url.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    balanced = false;
                }
            }
            _ => {}
        }
    }
    balanced &= depth == 0;

    let mut out = String::with_capacity(url.len() + 2);
    if pointy {
        out.push('<');
    }
    for ch in url.chars() {
        let needs_escape = match ch {
            '\\' | '&' => true,
            '<' | '>' => pointy,
            '(' | ')' => !pointy && !balanced,
            _ => false,
        };
        if needs_escape {
            out.push('\\');
        }
        out.push(ch);
    }
    if pointy {
        out.push('>');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> (String, Vec<InlineSpan>) {
        parse_inline(text, 0, text.len()).unwrap()
    }

    fn bold(start: usize, end: usize) -> InlineSpan {
        InlineSpan::new(InlineKind::Bold, start, end)
    }

    fn italic(start: usize, end: usize) -> InlineSpan {
        InlineSpan::new(InlineKind::Italic, start, end)
    }

    fn link(url: &str, start: usize, end: usize) -> InlineSpan {
        InlineSpan::new(InlineKind::Hyperlink { url: url.into() }, start, end)
    }

    #[test]
    fn test_plain_offsets_exclude_markers() {
        let (plain, spans) = parse("This is **bold** text");
        assert_eq!(plain, "This is bold text");
        assert_eq!(spans, vec![bold(8, 12)]);
    }

    #[test]
    fn test_bold_italic_triple_run() {
        let (plain, spans) = parse("Normal ***both*** end");
        assert_eq!(plain, "Normal both end");
        assert_eq!(spans, vec![bold(7, 11), italic(7, 11)]);
    }

    #[test]
    fn test_underscore_is_literal_inside_words() {
        let (plain, spans) = parse("snake_case_name and _it_");
        assert_eq!(plain, "snake_case_name and it");
        assert_eq!(spans, vec![italic(20, 22)]);
    }

    #[test]
    fn test_lone_asterisk_between_spaces_is_literal() {
        let (plain, spans) = parse("5 * 3");
        assert_eq!(plain, "5 * 3");
        assert!(spans.is_empty());
    }

    #[test]
    fn test_link_with_nested_parens_and_emphasis() {
        let (plain, spans) = parse("See [**Python**](https://en.wikipedia.org/wiki/Python_(language)).");
        assert_eq!(plain, "See Python.");
        assert_eq!(
            spans,
            vec![
                bold(4, 10),
                link("https://en.wikipedia.org/wiki/Python_(language)", 4, 10)
            ]
        );
    }

    #[test]
    fn test_escapes_are_removed() {
        let (plain, spans) = parse(r"\*not bold\* and \[brackets\]");
        assert_eq!(plain, "*not bold* and [brackets]");
        assert!(spans.is_empty());
    }

    #[test]
    fn test_unterminated_emphasis_reports_position() {
        let err = parse_inline("Hello **world", 0, 13).unwrap_err();
        assert_eq!((err.line, err.column), (1, 7));
        assert!(err.message.contains("unterminated emphasis"));
    }

    #[test]
    fn test_malformed_links() {
        let missing_paren = parse_inline("[text] more", 0, 11).unwrap_err();
        assert!(missing_paren.message.contains("expected '('"));

        let unterminated = parse_inline("[text](http://x", 0, 15).unwrap_err();
        assert!(unterminated.message.contains("unterminated destination"));

        let open_text = parse_inline("[text", 0, 5).unwrap_err();
        assert!(open_text.message.contains("unterminated link text"));

        let empty = parse_inline("[text]()", 0, 8).unwrap_err();
        assert!(empty.message.contains("empty destination"));
    }

    #[test]
    fn test_stray_closing_bracket_is_literal() {
        let (plain, spans) = parse("a ] b");
        assert_eq!(plain, "a ] b");
        assert!(spans.is_empty());
    }

    #[test]
    fn test_block_markers_inside_text_stay_literal() {
        let (plain, spans) = parse("1986. was a year\n> not quoted\n---");
        assert_eq!(plain, "1986. was a year\n> not quoted\n---");
        assert!(spans.is_empty());
    }

    #[test]
    fn test_code_spans_and_autolinks_are_verbatim() {
        let text = "run `ls *` or <https://x.test>";
        let (plain, spans) = parse(text);
        assert_eq!(plain, text);
        assert!(spans.is_empty());
    }

    #[test]
    fn test_error_offsets_skip_indentation() {
        let text = "first\n   second *open";
        let err = parse_inline(text, 0, text.len()).unwrap_err();
        assert_eq!((err.line, err.column), (2, 11));
    }

    #[test]
    fn test_image_with_escaped_alt() {
        let (alt, path) = parse_image(r"![a \[b\]](assets/image1.png)", 0, 29).unwrap();
        assert_eq!(alt, "a [b]");
        assert_eq!(path, "assets/image1.png");

        let err = parse_image("![alt](assets/x.png", 0, 19).unwrap_err();
        assert!(err.message.contains("malformed image: unterminated destination"));
    }

    #[test]
    fn test_serialize_nests_overlapping_spans() {
        let plain = "abcdefghij";
        let spans = vec![bold(0, 10), italic(3, 5)];
        let markup = serialize_inline(plain, &spans);
        assert_eq!(markup, "**abc*de*fghij**");
        assert_eq!(parse(&markup), (plain.to_string(), spans));
    }

    #[test]
    fn test_serialize_switching_emphasis_kinds() {
        let plain = "abcdef";
        for spans in [
            vec![bold(0, 3), italic(3, 6)],
            vec![italic(0, 3), bold(3, 6)],
            vec![italic(0, 6), bold(3, 6)],
            vec![bold(0, 6), italic(0, 3)],
        ] {
            let markup = serialize_inline(plain, &spans);
            let (parsed_plain, mut parsed) = parse(&markup);
            let mut expected = spans.clone();
            coalesce_inline(&mut expected);
            coalesce_inline(&mut parsed);
            assert_eq!(parsed_plain, plain, "markup: {markup}");
            assert_eq!(parsed, expected, "markup: {markup}");
        }
    }

    #[test]
    fn test_serialize_moves_emphasis_off_whitespace() {
        let markup = serialize_inline("a bold word", &[bold(1, 7)]);
        assert_eq!(markup, "a **bold** word");
    }

    #[test]
    fn test_serialize_escapes_literal_markers() {
        let markup = serialize_inline("2*3 [x] a_b", &[]);
        assert_eq!(markup, r"2\*3 \[x\] a\_b");
        assert_eq!(parse(&markup).0, "2*3 [x] a_b");
    }

    #[test]
    fn test_serialize_link_with_unbalanced_url() {
        let spans = vec![link("https://x.test/a)b", 0, 4)];
        let markup = serialize_inline("link", &spans);
        assert_eq!(markup, r"[link](https://x.test/a\)b)");
        assert_eq!(parse(&markup).1, spans);
    }

    #[test]
    fn test_serialize_escapes_code_and_html_markers() {
        let plain = "a<b> & `c`";
        let markup = serialize_inline(plain, &[]);
        assert_eq!(markup, r"a\<b> \& \`c\`");
        assert_eq!(parse(&markup).0, plain);
    }

    #[test]
    fn test_serialize_link_with_spaces_uses_angle_form() {
        let spans = vec![link("docs/a file.html", 0, 4)];
        let markup = serialize_inline("docs", &spans);
        assert_eq!(markup, "[docs](<docs/a file.html>)");
        assert_eq!(parse(&markup).1, spans);
    }

    #[test]
    fn test_serialize_link_after_exclamation_mark() {
        let spans = vec![link("u", 4, 9)];
        let markup = serialize_inline("Wow!click", &spans);
        assert_eq!(markup, r"Wow\![click](u)");
        assert_eq!(parse(&markup), ("Wow!click".to_string(), spans));
    }

    #[test]
    fn test_serialize_bold_ending_inside_link() {
        let plain = "click here now";
        let spans = vec![bold(0, 10), link("u", 6, 14)];
        let markup = serialize_inline(plain, &spans);
        let (parsed_plain, parsed) = parse(&markup);
        assert_eq!(parsed_plain, plain);
        assert_eq!(parsed, spans);
    }
}
