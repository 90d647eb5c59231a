#![no_main]

use libfuzzer_sys::fuzz_target;
use sidedoc::markdown::{self, BlockContent};

fuzz_target!(|data: &[u8]| {
    let input = String::from_utf8_lossy(data);
    let Ok(blocks) = markdown::parse(&input) else {
        return;
    };
    for block in &blocks {
        assert!(block.span.start <= block.span.end && block.span.end <= input.len());
    }
    let contents: Vec<BlockContent> = blocks.into_iter().map(|b| b.content).collect();
    let serialized = markdown::serialize(&contents);
    let reparsed = markdown::parse(&serialized.text).expect("serialized text parses");
    let recontents: Vec<BlockContent> = reparsed.into_iter().map(|b| b.content).collect();
    assert_eq!(contents, recontents);
});
