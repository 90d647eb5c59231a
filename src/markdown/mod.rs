//! Markdown backend: the text side of a container.
//!
//! `parse` turns a text buffer into a flat, document-ordered block stream
//! with byte spans and plain-text inline spans; `serialize` renders blocks
//! and reports the span each one landed on. The two agree by construction:
//! serializing parsed blocks and parsing the result yields the same content.

mod inline;

pub(crate) use inline::floor_char_boundary;

use crate::error::FormatError;
use crate::model::{BlockKind, InlineSpan, Span};
use inline::{escape, escape_url, parse_image, parse_inline, serialize_inline};

/// Block content without position: what `serialize` consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContent {
    pub kind: BlockKind,
    /// Text with markers and escapes removed. Alt text for images, empty for
    /// list containers.
    pub plain: String,
    pub inline: Vec<InlineSpan>,
    /// Index of the owning list block, for list items.
    pub parent: Option<usize>,
}

impl BlockContent {
    pub fn new(kind: BlockKind, plain: impl Into<String>) -> Self {
        Self {
            kind,
            plain: plain.into(),
            inline: Vec::new(),
            parent: None,
        }
    }

    pub fn with_inline(mut self, inline: Vec<InlineSpan>) -> Self {
        self.inline = inline;
        self
    }

    pub fn with_parent(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlock {
    pub content: BlockContent,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Serialized {
    pub text: String,
    /// One span per input block, same order.
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineClass {
    Blank,
    Heading { level: u8, text_start: usize },
    Item { ordered: bool, text_start: usize },
    Image,
    Text,
}

#[derive(Debug, Clone, Copy)]
struct Line {
    /// First non-whitespace byte.
    start: usize,
    /// One past the last non-whitespace byte.
    end: usize,
    class: LineClass,
}

fn scan_lines(text: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for raw in text.split_inclusive('\n') {
        let line_start = offset;
        offset += raw.len();
        let body = raw.trim_end_matches(['\n', '\r']);
        let leading = body.len() - body.trim_start().len();
        let trimmed = body.trim();
        let start = line_start + leading;
        lines.push(Line {
            start,
            end: start + trimmed.len(),
            class: classify(trimmed, start),
        });
    }
    lines
}

fn classify(trimmed: &str, start: usize) -> LineClass {
    if trimmed.is_empty() {
        return LineClass::Blank;
    }

    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if (1..=6).contains(&hashes) {
        let rest = &trimmed[hashes..];
        if rest.is_empty() || rest.starts_with([' ', '\t']) {
            let gap = rest.len() - rest.trim_start().len();
            return LineClass::Heading {
                level: hashes as u8,
                text_start: start + hashes + gap,
            };
        }
    }

    if trimmed.starts_with("![") {
        return LineClass::Image;
    }

    let bytes = trimmed.as_bytes();
    if matches!(bytes[0], b'-' | b'*' | b'+') && matches!(bytes.get(1), Some(b' ' | b'\t')) {
        let gap = trimmed[1..].len() - trimmed[1..].trim_start().len();
        return LineClass::Item {
            ordered: false,
            text_start: start + 1 + gap,
        };
    }

    let digits = trimmed.bytes().take_while(u8::is_ascii_digit).count();
    if (1..=9).contains(&digits)
        && bytes.get(digits) == Some(&b'.')
        && matches!(bytes.get(digits + 1), Some(b' ' | b'\t'))
    {
        let rest = &trimmed[digits + 1..];
        let gap = rest.len() - rest.trim_start().len();
        return LineClass::Item {
            ordered: true,
            text_start: start + digits + 1 + gap,
        };
    }

    LineClass::Text
}

/// The part of a list item line after its marker; any other line as is.
pub(crate) fn item_body(line: &str) -> &str {
    match classify(line, 0) {
        LineClass::Item { text_start, .. } => &line[text_start..],
        _ => line,
    }
}

/// Parses a text buffer into blocks in document order. A list block is
/// immediately followed by its items.
pub fn parse(text: &str) -> Result<Vec<ParsedBlock>, FormatError> {
    let lines = scan_lines(text);
    let mut blocks = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let line = lines[index];
        match line.class {
            LineClass::Blank => {
                index += 1;
            }
            LineClass::Heading { level, text_start } => {
                let (plain, inline) = parse_inline(text, text_start, line.end)?;
                blocks.push(ParsedBlock {
                    content: BlockContent::new(BlockKind::Heading { level }, plain)
                        .with_inline(inline),
                    span: Span::new(line.start, line.end),
                });
                index += 1;
            }
            LineClass::Image => {
                let (alt, image_path) = parse_image(text, line.start, line.end)?;
                blocks.push(ParsedBlock {
                    content: BlockContent::new(BlockKind::Image { image_path }, alt),
                    span: Span::new(line.start, line.end),
                });
                index += 1;
            }
            LineClass::Item { ordered, .. } => {
                let list_index = blocks.len();
                blocks.push(ParsedBlock {
                    content: BlockContent::new(BlockKind::List { ordered }, ""),
                    span: Span::new(line.start, line.end),
                });
                while let Some(item) = lines.get(index) {
                    let LineClass::Item {
                        ordered: item_ordered,
                        text_start,
                    } = item.class
                    else {
                        break;
                    };
                    if item_ordered != ordered {
                        break;
                    }
                    let (plain, inline) = parse_inline(text, text_start, item.end)?;
                    blocks.push(ParsedBlock {
                        content: BlockContent::new(BlockKind::ListItem, plain)
                            .with_inline(inline)
                            .with_parent(list_index),
                        span: Span::new(item.start, item.end),
                    });
                    blocks[list_index].span.end = item.end;
                    index += 1;
                }
            }
            LineClass::Text => {
                let start = line.start;
                let mut end = line.end;
                index += 1;
                while let Some(next) = lines.get(index) {
                    if next.class != LineClass::Text {
                        break;
                    }
                    end = next.end;
                    index += 1;
                }
                let (plain, inline) = parse_inline(text, start, end)?;
                blocks.push(ParsedBlock {
                    content: BlockContent::new(BlockKind::Paragraph, plain).with_inline(inline),
                    span: Span::new(start, end),
                });
            }
        }
    }

    Ok(blocks)
}

/// Renders blocks as markdown. Top-level blocks are separated by a blank
/// line, list items by a single newline. Items must directly follow their
/// list; items whose parent is not the preceding list are dropped.
pub fn serialize(blocks: &[BlockContent]) -> Serialized {
    let mut text = String::new();
    let mut spans = vec![Span::new(0, 0); blocks.len()];
    let mut first = true;
    let mut index = 0;

    while index < blocks.len() {
        let block = &blocks[index];
        if block.parent.is_some() {
            index += 1;
            continue;
        }
        if !first {
            text.push_str("\n\n");
        }
        first = false;
        let start = text.len();

        match &block.kind {
            BlockKind::List { ordered } => {
                let mut number = 0usize;
                let mut item_index = index + 1;
                while let Some(item) = blocks.get(item_index) {
                    if item.parent != Some(index) {
                        break;
                    }
                    number += 1;
                    if number > 1 {
                        text.push('\n');
                    }
                    let item_start = text.len();
                    if *ordered {
                        text.push_str(&format!("{number}. "));
                    } else {
                        text.push_str("- ");
                    }
                    text.push_str(&serialize_inline(&item.plain, &item.inline));
                    spans[item_index] = Span::new(item_start, text.len());
                    item_index += 1;
                }
                spans[index] = Span::new(start, text.len());
                index = item_index;
                continue;
            }
            BlockKind::Heading { level } => {
                text.push_str(&"#".repeat(usize::from((*level).clamp(1, 6))));
                let body = serialize_inline(&block.plain, &block.inline);
                if !body.is_empty() {
                    text.push(' ');
                    text.push_str(&body);
                }
            }
            BlockKind::Image { image_path } => {
                text.push_str("![");
                text.push_str(&escape(&block.plain));
                text.push_str("](");
                text.push_str(&escape_url(image_path));
                text.push(')');
            }
            BlockKind::Paragraph | BlockKind::ListItem => {
                let body = serialize_inline(&block.plain, &block.inline);
                text.push_str(&guard_line_starts(&body));
            }
        }
        spans[index] = Span::new(start, text.len());
        index += 1;
    }

    Serialized { text, spans }
}

/// Escapes paragraph lines that would otherwise read as a heading, list
/// item or image.
fn guard_line_starts(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 2);
    for (number, line) in body.split('\n').enumerate() {
        if number > 0 {
            out.push('\n');
        }
        let leading = line.len() - line.trim_start().len();
        let (indent, rest) = line.split_at(leading);
        out.push_str(indent);
        match classify(rest.trim_end(), 0) {
            LineClass::Item { ordered: true, .. } => {
                let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
                out.push_str(&rest[..digits]);
                out.push('\\');
                out.push_str(&rest[digits..]);
            }
            LineClass::Heading { .. } | LineClass::Item { .. } | LineClass::Image => {
                out.push('\\');
                out.push_str(rest);
            }
            LineClass::Blank | LineClass::Text => out.push_str(rest),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InlineKind;

    fn contents(blocks: &[ParsedBlock]) -> Vec<BlockContent> {
        blocks.iter().map(|b| b.content.clone()).collect()
    }

    #[test]
    fn test_heading_and_paragraph_spans() {
        let text = "# Title\n\nHello world.";
        let blocks = parse(text).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].content.kind, BlockKind::Heading { level: 1 });
        assert_eq!(&text[blocks[0].span.start..blocks[0].span.end], "# Title");
        assert_eq!(blocks[0].content.plain, "Title");
        assert_eq!(blocks[1].content.kind, BlockKind::Paragraph);
        assert_eq!(&text[blocks[1].span.start..blocks[1].span.end], "Hello world.");
    }

    #[test]
    fn test_list_items_follow_their_list() {
        let text = "Intro\n\n- one\n- **two**\n\n1. first\n2. second";
        let blocks = parse(text).unwrap();
        let kinds: Vec<_> = blocks.iter().map(|b| b.content.kind.type_name()).collect();
        assert_eq!(
            kinds,
            vec![
                "paragraph",
                "list",
                "list-item",
                "list-item",
                "list",
                "list-item",
                "list-item"
            ]
        );
        assert_eq!(blocks[1].content.kind, BlockKind::List { ordered: false });
        assert_eq!(&text[blocks[1].span.start..blocks[1].span.end], "- one\n- **two**");
        assert_eq!(blocks[3].content.parent, Some(1));
        assert_eq!(blocks[3].content.plain, "two");
        assert_eq!(
            blocks[3].content.inline,
            vec![InlineSpan::new(InlineKind::Bold, 0, 3)]
        );
        assert_eq!(blocks[4].content.kind, BlockKind::List { ordered: true });
        assert_eq!(blocks[6].content.parent, Some(4));
    }

    #[test]
    fn test_item_body_drops_marker() {
        assert_eq!(item_body("12. twelfth"), "twelfth");
        assert_eq!(item_body("-   spaced bullet"), "spaced bullet");
        assert_eq!(item_body("plain text"), "plain text");
    }

    #[test]
    fn test_multiline_paragraph_is_one_block() {
        let text = "first line\nsecond line\n\nnext";
        let blocks = parse(text).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].content.plain, "first line\nsecond line");
    }

    #[test]
    fn test_crlf_line_endings() {
        let text = "# Title\r\n\r\nBody\r\n";
        let blocks = parse(text).unwrap();
        assert_eq!(&text[blocks[0].span.start..blocks[0].span.end], "# Title");
        assert_eq!(&text[blocks[1].span.start..blocks[1].span.end], "Body");
    }

    #[test]
    fn test_image_line() {
        let blocks = parse("![A chart](assets/image1.png)").unwrap();
        assert_eq!(
            blocks[0].content.kind,
            BlockKind::Image {
                image_path: "assets/image1.png".into()
            }
        );
        assert_eq!(blocks[0].content.plain, "A chart");
    }

    #[test]
    fn test_malformed_image_is_format_error() {
        let err = parse("Para\n\n![alt](assets/x.png").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("malformed image"));

        let trailing = parse("![alt](assets/x.png) caption").unwrap_err();
        assert!(trailing.message.contains("unexpected text after image"));
    }

    #[test]
    fn test_format_error_reports_line_and_column() {
        let err = parse("# Fine\n\nSome *broken text").unwrap_err();
        assert_eq!((err.line, err.column), (3, 6));
    }

    #[test]
    fn test_serialize_reports_spans_that_parse_back() {
        let blocks = vec![
            BlockContent::new(BlockKind::Heading { level: 2 }, "Overview"),
            BlockContent::new(BlockKind::Paragraph, "Some bold text").with_inline(vec![
                InlineSpan::new(InlineKind::Bold, 5, 9),
            ]),
            BlockContent::new(BlockKind::List { ordered: true }, ""),
            BlockContent::new(BlockKind::ListItem, "alpha").with_parent(2),
            BlockContent::new(BlockKind::ListItem, "beta").with_parent(2),
            BlockContent::new(
                BlockKind::Image {
                    image_path: "assets/image1.png".into(),
                },
                "diagram",
            ),
        ];
        let out = serialize(&blocks);
        assert_eq!(
            out.text,
            "## Overview\n\nSome **bold** text\n\n1. alpha\n2. beta\n\n![diagram](assets/image1.png)"
        );
        let parsed = parse(&out.text).unwrap();
        let spans: Vec<_> = parsed.iter().map(|b| b.span).collect();
        assert_eq!(spans, out.spans);
        assert_eq!(contents(&parsed), blocks);
    }

    #[test]
    fn test_serialize_escapes_block_markers_in_paragraphs() {
        let blocks = vec![
            BlockContent::new(BlockKind::Paragraph, "# not a heading"),
            BlockContent::new(BlockKind::Paragraph, "- not an item"),
            BlockContent::new(BlockKind::Paragraph, "12. not ordered"),
            BlockContent::new(BlockKind::Paragraph, "![not](an image)"),
        ];
        let out = serialize(&blocks);
        let parsed = parse(&out.text).unwrap();
        assert_eq!(contents(&parsed), blocks);
    }
}
