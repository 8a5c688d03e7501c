//! Wraps a sanitised email body in the printable document shell.

use askama::Template;
use time::{
    OffsetDateTime, UtcOffset, format_description::BorrowedFormatItem, macros::format_description,
};

use crate::domain::entities::RenderJobPayload;

use super::types::RenderError;

/// Blocks every fetch except inline `data:` resources and inline styles.
pub const DOCUMENT_CSP: &str =
    "default-src 'none'; img-src data:; font-src data:; style-src 'unsafe-inline'";

const RECEIVED_AT_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute] UTC");

const UNTITLED: &str = "(no subject)";

/// Email body that has already passed through sanitisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentBody {
    /// Sanitised HTML, inserted verbatim.
    Html(String),
    /// Plain text, escaped and shown preformatted.
    Plain(String),
}

#[derive(Template)]
#[template(path = "email_document.html")]
struct EmailDocumentTemplate<'a> {
    content_security_policy: &'a str,
    title: &'a str,
    sender: &'a str,
    recipients: String,
    received_at: String,
    message_id: &'a str,
    attachment_count: usize,
    is_html: bool,
    body: &'a str,
}

/// Title used for the document record and the PDF metadata.
pub fn document_title(payload: &RenderJobPayload) -> &str {
    let subject = payload.subject.trim();
    if subject.is_empty() { UNTITLED } else { subject }
}

pub fn compose_document(
    payload: &RenderJobPayload,
    body: &DocumentBody,
) -> Result<String, RenderError> {
    let (is_html, body) = match body {
        DocumentBody::Html(html) => (true, html.as_str()),
        DocumentBody::Plain(text) => (false, text.as_str()),
    };

    EmailDocumentTemplate {
        content_security_policy: DOCUMENT_CSP,
        title: document_title(payload),
        sender: &payload.sender,
        recipients: payload.recipients.join(", "),
        received_at: format_received_at(payload.received_at),
        message_id: &payload.message_id,
        attachment_count: payload.attachment_ids.len(),
        is_html,
        body,
    }
    .render()
    .map_err(|err| RenderError::RendererCrash(format!("document template failed: {err}")))
}

fn format_received_at(received_at: OffsetDateTime) -> String {
    let utc = received_at.to_offset(UtcOffset::UTC);
    utc.format(RECEIVED_AT_FORMAT)
        .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::domain::types::RenderRoute;

    fn payload() -> RenderJobPayload {
        RenderJobPayload {
            tenant_id: "t1".into(),
            message_id: "m1".into(),
            subject: "Invoice <March>".into(),
            sender: "Billing <billing@example.com>".into(),
            recipients: vec!["ops@example.com".into(), "cfo@example.com".into()],
            received_at: datetime!(2024-03-05 09:30 +02:00),
            html_body: None,
            text_body: Some("Total: 42 & change".into()),
            attachment_ids: vec!["att-1".into()],
            category_hint: None,
            tag_hints: Vec::new(),
            route: RenderRoute::AutoWithAttachments,
        }
    }

    #[test]
    fn header_metadata_is_escaped() {
        let html = compose_document(&payload(), &DocumentBody::Plain("hi".into())).unwrap();
        assert!(html.contains("Invoice &#60;March&#62;") || html.contains("Invoice &lt;March&gt;"));
        assert!(!html.contains("<March>"));
        assert!(html.contains("2024-03-05 07:30 UTC"));
        assert!(html.contains("ops@example.com, cfo@example.com"));
        assert!(html.contains("<td>m1</td>"));
    }

    #[test]
    fn plain_text_is_preformatted_and_escaped() {
        let html = compose_document(
            &payload(),
            &DocumentBody::Plain("<b>not bold</b>".into()),
        )
        .unwrap();
        assert!(html.contains(r#"<pre class="mp-plain">"#));
        assert!(!html.contains("<b>not bold</b>"));
    }

    #[test]
    fn sanitised_html_is_inserted_verbatim() {
        let html = compose_document(
            &payload(),
            &DocumentBody::Html("<table><tr><td>Row</td></tr></table>".into()),
        )
        .unwrap();
        assert!(html.contains("<table><tr><td>Row</td></tr></table>"));
        assert!(html.contains(DOCUMENT_CSP.split(';').next().unwrap()));
    }

    #[test]
    fn blank_subject_falls_back() {
        let mut payload = payload();
        payload.subject = "   ".into();
        assert_eq!(document_title(&payload), UNTITLED);
    }
}
