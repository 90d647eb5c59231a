#![no_main]

use libfuzzer_sys::fuzz_target;
use sidedoc::{ExtractConfig, FormattedDocument, Paragraph, SyncConfig, extract, sync, validate};

fuzz_target!(|data: &[u8]| {
    let doc = FormattedDocument::new(vec![
        Paragraph::new("Heading 1").with_text("Title"),
        Paragraph::new("Normal").with_text("First paragraph."),
        Paragraph::new("List Bullet").with_text("one"),
        Paragraph::new("List Bullet").with_text("two"),
        Paragraph::new("Normal").with_text("Last paragraph."),
    ]);
    let Ok(container) = extract(&doc, &ExtractConfig::default()) else {
        return;
    };
    let edited = String::from_utf8_lossy(data);
    if let Ok(outcome) = sync(&container, &edited, &SyncConfig::default()) {
        assert!(validate(&outcome.container).is_empty());
    }
});
