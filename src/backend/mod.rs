//! In-memory formatted document: the paragraph/run/image model that
//! extraction reads and reconstruction writes. A docx reader or writer sits
//! on the other side of this model and is not part of this crate.

pub use crate::model::Alignment;
pub use crate::model::style::{ListClass, heading_level_for_style, list_class_for_style};

use crate::model::ImageDimensions;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FormattedDocument {
    pub paragraphs: Vec<Paragraph>,
}

impl FormattedDocument {
    pub fn new(paragraphs: Vec<Paragraph>) -> Self {
        Self { paragraphs }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Paragraph {
    pub style_name: String,
    pub alignment: Alignment,
    pub font_name: Option<String>,
    pub font_size: Option<f32>,
    pub runs: Vec<Run>,
    pub image: Option<EmbeddedImage>,
}

impl Paragraph {
    pub fn new(style_name: impl Into<String>) -> Self {
        Self {
            style_name: style_name.into(),
            alignment: Alignment::Left,
            font_name: None,
            font_size: None,
            runs: Vec::new(),
            image: None,
        }
    }

    pub fn with_run(mut self, run: Run) -> Self {
        self.runs.push(run);
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_run(Run::new(text))
    }

    pub fn with_image(mut self, image: EmbeddedImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_font(mut self, name: impl Into<String>, size: f32) -> Self {
        self.font_name = Some(name.into());
        self.font_size = Some(size);
        self
    }

    /// Concatenated run text.
    pub fn text(&self) -> String {
        self.runs.iter().map(|run| run.text.as_str()).collect()
    }

    /// Runs with adjacent equally formatted runs joined, for comparing
    /// documents whose run boundaries differ but whose formatting does not.
    pub fn coalesced_runs(&self) -> Vec<Run> {
        let mut out: Vec<Run> = Vec::with_capacity(self.runs.len());
        for run in self.runs.iter().filter(|run| !run.text.is_empty()) {
            match out.last_mut() {
                Some(last) if last.same_formatting(run) => last.text.push_str(&run.text),
                _ => out.push(run.clone()),
            }
        }
        out
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Run {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub color: Option<String>,
    pub hyperlink: Option<String>,
}

impl Run {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }

    pub fn italic(mut self) -> Self {
        self.italic = true;
        self
    }

    pub fn underline(mut self) -> Self {
        self.underline = true;
        self
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn link(mut self, url: impl Into<String>) -> Self {
        self.hyperlink = Some(url.into());
        self
    }

    pub fn same_formatting(&self, other: &Run) -> bool {
        self.bold == other.bold
            && self.italic == other.italic
            && self.underline == other.underline
            && self.color == other.color
            && self.hyperlink == other.hyperlink
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedImage {
    pub data: Vec<u8>,
    /// File extension matching the image format (`png`, `jpeg`, ...).
    pub extension: String,
    pub dimensions: Option<ImageDimensions>,
    pub alt: String,
}

impl EmbeddedImage {
    pub fn new(data: Vec<u8>, extension: impl Into<String>) -> Self {
        Self {
            data,
            extension: extension.into(),
            dimensions: None,
            alt: String::new(),
        }
    }

    pub fn with_alt(mut self, alt: impl Into<String>) -> Self {
        self.alt = alt.into();
        self
    }

    pub fn with_dimensions(mut self, width: u64, height: u64) -> Self {
        self.dimensions = Some(ImageDimensions { width, height });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesced_runs_join_equal_formatting() {
        let paragraph = Paragraph::new("Normal")
            .with_run(Run::new("Hello "))
            .with_run(Run::new("big").bold())
            .with_run(Run::new(" wide").bold())
            .with_run(Run::new(""))
            .with_run(Run::new(" world"));
        let runs = paragraph.coalesced_runs();
        let texts: Vec<_> = runs.iter().map(|run| run.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello ", "big wide", " world"]);
        assert_eq!(paragraph.text(), "Hello big wide world");
    }
}
