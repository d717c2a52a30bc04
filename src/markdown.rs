//! Markdown conversion for card content that arrives as source text.

use pulldown_cmark::{html, Options, Parser};

/// Convert markdown to HTML and wrap it in the editable container the card
/// page styles. Raw HTML inside the source is passed through.
pub fn render_card_markdown(source: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_SMART_PUNCTUATION);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(source, options);
    let mut body = String::with_capacity(source.len() * 3 / 2);
    html::push_html(&mut body, parser);

    format!(
        concat!(
            r#"<div data-v-fc3bb97c="" contenteditable="true" translate="no" "#,
            r#"name="editableText" class="editable-element md-class">{}</div>"#,
        ),
        body
    )
}
