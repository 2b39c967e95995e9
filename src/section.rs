//! Heading-anchored sectionizer.
//!
//! Groups an ordered sequence of [`ContentItem`]s into [`Section`]s. Each
//! heading closes the section collected so far and opens a new one; the
//! paragraphs that follow are appended until the next heading.
//!
//! Section ids are sequential within a volume (`sec_0001`, `sec_0002`, ...)
//! and depend only on the input, so re-segmenting the same items always
//! yields the same ids. Resume relies on this.

use crate::models::{ContentItem, ItemKind, Section};

/// Separator between the heading and paragraph texts of one section.
const SECTION_JOIN: &str = "\n";

/// Split items into heading-anchored sections.
///
/// Items whose text is blank after trimming are skipped entirely. Items of
/// an unknown kind are ignored. Sections whose text would be empty are not
/// emitted and do not consume an id.
pub fn segment(items: &[ContentItem]) -> Vec<Section> {
    let mut builder = SectionBuilder::default();

    for item in items {
        let text = item.text.trim();
        if text.is_empty() {
            continue;
        }

        match item.kind {
            ItemKind::Heading => {
                builder.flush();
                builder.heading = Some((text.to_string(), item.id.clone()));
            }
            ItemKind::Paragraph => builder.buffer.push(item),
            ItemKind::Other => {}
        }
    }

    builder.flush();
    builder.sections
}

#[derive(Default)]
struct SectionBuilder<'a> {
    heading: Option<(String, String)>,
    buffer: Vec<&'a ContentItem>,
    sections: Vec<Section>,
    emitted: usize,
}

impl SectionBuilder<'_> {
    fn flush(&mut self) {
        let heading = self.heading.take();
        let buffer = std::mem::take(&mut self.buffer);
        if heading.is_none() && buffer.is_empty() {
            return;
        }

        let mut parts: Vec<&str> = Vec::with_capacity(buffer.len() + 1);
        let mut item_ids = Vec::with_capacity(buffer.len() + 1);
        if let Some((title, id)) = &heading {
            parts.push(title);
            item_ids.push(id.clone());
        }
        for item in &buffer {
            parts.push(&item.text);
            item_ids.push(item.id.clone());
        }

        let text = parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join(SECTION_JOIN)
            .trim()
            .to_string();
        if text.is_empty() {
            return;
        }

        self.emitted += 1;
        self.sections.push(Section {
            section_id: section_id(self.emitted),
            section_title: heading.map(|(title, _)| title).unwrap_or_default(),
            item_ids,
            text,
        });
    }
}

fn section_id(n: usize) -> String {
    format!("sec_{:04}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(sections: &[Section]) -> Vec<String> {
        sections
            .iter()
            .flat_map(|s| s.item_ids.iter().cloned())
            .collect()
    }

    #[test]
    fn test_heading_with_paragraphs() {
        let items = vec![
            ContentItem::heading("i1", "第一节"),
            ContentItem::paragraph("i2", "李治为太子。"),
            ContentItem::paragraph("i3", "房玄龄辅之。"),
        ];
        let sections = segment(&items);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].section_id, "sec_0001");
        assert_eq!(sections[0].section_title, "第一节");
        assert_eq!(sections[0].text, "第一节\n李治为太子。\n房玄龄辅之。");
        assert_eq!(sections[0].item_ids, vec!["i1", "i2", "i3"]);
    }

    #[test]
    fn test_leading_paragraphs_form_untitled_section() {
        let items = vec![
            ContentItem::paragraph("p0", "序。"),
            ContentItem::heading("h1", "甲"),
            ContentItem::paragraph("p1", "一。"),
        ];
        let sections = segment(&items);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section_title, "");
        assert_eq!(sections[0].text, "序。");
        assert_eq!(sections[1].section_id, "sec_0002");
        assert_eq!(sections[1].item_ids, vec!["h1", "p1"]);
    }

    #[test]
    fn test_blank_items_skipped_without_flush() {
        let items = vec![
            ContentItem::heading("h1", "甲"),
            ContentItem::heading("h2", "   "),
            ContentItem::paragraph("p1", ""),
            ContentItem::paragraph("p2", "二。"),
        ];
        let sections = segment(&items);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].item_ids, vec!["h1", "p2"]);
        assert_eq!(sections[0].text, "甲\n二。");
    }

    #[test]
    fn test_consecutive_headings_each_emit() {
        let items = vec![
            ContentItem::heading("h1", "甲"),
            ContentItem::heading("h2", "乙"),
            ContentItem::paragraph("p1", "丙。"),
        ];
        let sections = segment(&items);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].text, "甲");
        assert_eq!(sections[0].item_ids, vec!["h1"]);
        assert_eq!(sections[1].section_id, "sec_0002");
    }

    #[test]
    fn test_unknown_kind_ignored() {
        let mut other = ContentItem::paragraph("x", "注");
        other.kind = ItemKind::Other;
        let items = vec![ContentItem::heading("h1", "甲"), other];
        let sections = segment(&items);
        assert_eq!(ids(&sections), vec!["h1"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(segment(&[]).is_empty());
        assert!(segment(&[ContentItem::paragraph("p", " \n ")]).is_empty());
    }

    #[test]
    fn test_item_ids_partition_non_empty_inputs() {
        let items: Vec<ContentItem> = (0..40)
            .map(|i| {
                let id = format!("i{}", i);
                match i % 7 {
                    0 => ContentItem::heading(id, format!("卷{}", i)),
                    3 => ContentItem::paragraph(id, "  "),
                    _ => ContentItem::paragraph(id, format!("文{}", i)),
                }
            })
            .collect();
        let expected: Vec<String> = items
            .iter()
            .filter(|it| !it.text.trim().is_empty())
            .map(|it| it.id.clone())
            .collect();
        let sections = segment(&items);
        assert_eq!(ids(&sections), expected);
        for s in &sections[1..] {
            assert!(items
                .iter()
                .any(|it| it.id == s.item_ids[0] && it.kind == ItemKind::Heading));
        }
    }

    #[test]
    fn test_deterministic() {
        let items = vec![
            ContentItem::heading("h1", "甲"),
            ContentItem::paragraph("p1", "一。"),
            ContentItem::heading("h2", "乙"),
            ContentItem::paragraph("p2", "二。"),
        ];
        assert_eq!(segment(&items), segment(&items));
    }
}
