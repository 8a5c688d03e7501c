//! HTML sanitisation applied to email bodies before they reach a renderer.

use ammonia::Builder as AmmoniaBuilder;

/// Strips active content from untrusted HTML.
///
/// Implementations must remove `script`, `object`, `embed` and `form`
/// elements together with every inline event-handler attribute.
pub trait HtmlSanitizer: Send + Sync {
    fn sanitize(&self, html: &str) -> String;
}

/// [`HtmlSanitizer`] backed by an allow-list tuned for email markup.
pub struct AmmoniaSanitizer {
    builder: AmmoniaBuilder<'static>,
}

impl AmmoniaSanitizer {
    pub fn new() -> Self {
        Self {
            builder: email_builder(),
        }
    }
}

impl Default for AmmoniaSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl HtmlSanitizer for AmmoniaSanitizer {
    fn sanitize(&self, html: &str) -> String {
        self.builder.clean(html).to_string()
    }
}

fn email_builder() -> AmmoniaBuilder<'static> {
    let mut builder = AmmoniaBuilder::default();

    // Layout tags that newsletters and receipts lean on.
    builder.add_tags(&[
        "center", "font", "caption", "col", "colgroup", "tfoot", "section", "article", "header",
        "footer", "main", "figure", "figcaption",
    ]);

    builder.add_generic_attributes(&[
        "align", "bgcolor", "border", "class", "color", "dir", "height", "lang", "style", "title",
        "valign", "width",
    ]);

    builder.add_tag_attributes("table", &["cellpadding", "cellspacing", "summary"]);
    builder.add_tag_attributes("td", &["colspan", "rowspan", "nowrap"]);
    builder.add_tag_attributes("th", &["colspan", "rowspan", "scope"]);
    builder.add_tag_attributes("font", &["face", "size"]);
    builder.add_tag_attributes("img", &["alt", "src", "width", "height"]);

    // Inline images arrive as data: or cid: references. Remote URLs survive
    // sanitisation but are blocked by the rendering context.
    builder.add_url_schemes(&["data", "cid"]);

    builder
}
