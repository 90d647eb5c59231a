use proptest::prelude::*;
use sidedoc::{Container, ExtractConfig, FormattedDocument, Paragraph, SyncConfig, extract, sync, validate};
use std::collections::BTreeMap;

fn paragraphs() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,8}( [a-z]{1,8}){0,4}", 2..8).prop_map(|words| {
        words
            .into_iter()
            .enumerate()
            .map(|(i, text)| format!("Paragraph {i} {text}."))
            .collect()
    })
}

fn container_for(texts: &[String]) -> Container {
    let doc = FormattedDocument::new(
        texts
            .iter()
            .map(|text| Paragraph::new("Normal").with_text(text.clone()))
            .collect(),
    );
    extract(&doc, &ExtractConfig::default()).unwrap()
}

fn list_items() -> impl Strategy<Value = (bool, Vec<String>)> {
    (
        any::<bool>(),
        prop::collection::vec("[a-z]{1,8}( [a-z]{1,8}){0,3}", 2..6),
    )
        .prop_map(|(ordered, words)| {
            let items = words
                .into_iter()
                .enumerate()
                .map(|(i, text)| format!("item {i} {text}"))
                .collect();
            (ordered, items)
        })
}

fn list_container(ordered: bool, items: &[String]) -> Container {
    let style = if ordered { "List Number" } else { "List Bullet" };
    let mut paragraphs = vec![Paragraph::new("Normal").with_text("Intro.")];
    paragraphs.extend(items.iter().map(|item| Paragraph::new(style).with_text(item.clone())));
    extract(&FormattedDocument::new(paragraphs), &ExtractConfig::default()).unwrap()
}

fn list_text<S: AsRef<str>>(ordered: bool, items: &[S]) -> String {
    let lines: Vec<String> = items
        .iter()
        .enumerate()
        .map(|(k, item)| {
            if ordered {
                format!("{}. {}", k + 1, item.as_ref())
            } else {
                format!("- {}", item.as_ref())
            }
        })
        .collect();
    format!("Intro.\n\n{}", lines.join("\n"))
}

/// Item ids mapped to their text without the list marker.
fn item_bodies(container: &Container) -> BTreeMap<String, String> {
    container
        .blocks
        .iter()
        .filter(|block| block.is_child())
        .map(|block| {
            let text = container.block_text(block).unwrap();
            let body = text.split_once(' ').map_or(text, |(_, body)| body);
            (block.id.to_string(), body.to_string())
        })
        .collect()
}

fn id_to_text(container: &Container) -> BTreeMap<String, String> {
    container
        .blocks
        .iter()
        .map(|block| {
            (
                block.id.to_string(),
                container.block_text(block).unwrap().to_string(),
            )
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(proptest_config::cases()))]

    #[test]
    fn sync_without_edits_is_identity(texts in paragraphs()) {
        let c = container_for(&texts);
        let outcome = sync(&c, &c.text, &SyncConfig::default()).unwrap();
        prop_assert_eq!(outcome.report.matched, c.blocks.len());
        prop_assert_eq!(outcome.report.inserted, 0);
        prop_assert_eq!(outcome.report.deleted, 0);
        prop_assert_eq!(&outcome.container.blocks, &c.blocks);
        prop_assert_eq!(&outcome.container.styles, &c.styles);
    }

    #[test]
    fn reordering_never_changes_identity(
        (texts, order) in paragraphs().prop_flat_map(|texts| {
            let len = texts.len();
            (Just(texts), Just((0..len).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        let c = container_for(&texts);
        let permuted: Vec<&str> = order.iter().map(|&i| texts[i].as_str()).collect();
        let permuted = permuted.join("\n\n");

        let shuffled = sync(&c, &permuted, &SyncConfig::default()).unwrap();
        prop_assert_eq!(shuffled.report.matched, texts.len());
        prop_assert_eq!(shuffled.report.modified, 0);
        prop_assert_eq!(id_to_text(&shuffled.container), id_to_text(&c));

        let restored = sync(&shuffled.container, &c.text, &SyncConfig::default()).unwrap();
        prop_assert_eq!(id_to_text(&restored.container), id_to_text(&c));
        prop_assert!(validate(&restored.container).is_empty());
    }

    #[test]
    fn synced_containers_stay_valid(
        texts in paragraphs(),
        edit in 0usize..8,
        extra in "[a-z]{1,8}( [a-z]{1,8}){0,3}",
    ) {
        let c = container_for(&texts);
        let mut edited = texts.clone();
        let index = edit % edited.len();
        match edit % 3 {
            0 => edited[index] = format!("{} {extra}", edited[index]),
            1 => { edited.remove(index); }
            _ => edited.insert(index, format!("Inserted {extra}.")),
        }
        let outcome = sync(&c, &edited.join("\n\n"), &SyncConfig::default()).unwrap();
        let violations = validate(&outcome.container);
        prop_assert!(violations.is_empty(), "{:?}", violations);

        let before: Vec<_> = c.blocks.iter().map(|b| &b.id).collect();
        for block in &outcome.container.blocks {
            if !before.contains(&&block.id) {
                prop_assert!(block.id.top_level_number().unwrap() >= c.manifest.next_block_id);
            }
        }
    }

    #[test]
    fn reordering_list_items_never_changes_identity(
        ((ordered, items), order) in list_items().prop_flat_map(|(ordered, items)| {
            let len = items.len();
            (Just((ordered, items)), Just((0..len).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        let c = list_container(ordered, &items);
        let permuted: Vec<&str> = order.iter().map(|&i| items[i].as_str()).collect();

        let outcome = sync(&c, &list_text(ordered, &permuted), &SyncConfig::default()).unwrap();
        prop_assert_eq!(outcome.report.matched, c.blocks.len());
        prop_assert_eq!(outcome.report.modified, 0);
        prop_assert_eq!(item_bodies(&outcome.container), item_bodies(&c));
        let violations = validate(&outcome.container);
        prop_assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn list_edits_touch_only_the_edited_item(
        (ordered, items) in list_items(),
        edit in 0usize..6,
        extra in "[a-z]{1,8}",
    ) {
        let c = list_container(ordered, &items);
        let mut edited = items.clone();
        let index = edit % edited.len();
        match edit % 3 {
            0 => edited[index] = format!("{} {extra}", edited[index]),
            1 => { edited.remove(index); }
            _ => edited.insert(index, format!("added {extra}")),
        }
        let outcome = sync(&c, &list_text(ordered, &edited), &SyncConfig::default()).unwrap();
        let report = &outcome.report;
        let expected = match edit % 3 {
            0 => (1, 0, 0),
            1 => (0, 0, 1),
            _ => (0, 1, 0),
        };
        prop_assert_eq!((report.modified, report.inserted, report.deleted), expected);
        let violations = validate(&outcome.container);
        prop_assert!(violations.is_empty(), "{:?}", violations);
    }
}
