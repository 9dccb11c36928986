//! Builds the exact message sequence sent to the model provider.
//!
//! `merge` is pure: the same inputs always produce the same list. Document
//! context is synthesized into `user` messages placed immediately before the
//! final user message, since providers treat the most recent user turn as the
//! active question.

use tracing::debug;

use crate::document::{DocumentContext, Page};
use crate::message::{ContentPart, Message, Role};

const FALLBACK_IMAGE_MIME: &str = "image/jpeg";

pub fn merge(
    system_prompt: &str,
    prior_messages: &[Message],
    existing_documents: &[DocumentContext],
    new_documents: &[DocumentContext],
    user_text: &str,
) -> Vec<Message> {
    let mut context = Vec::with_capacity(prior_messages.len() + 2);
    context.push(Message::system(system_prompt));
    // Only one system message may lead the sequence.
    context.extend(prior_messages.iter().filter(|m| m.role != Role::System).cloned());

    let document_messages: Vec<Message> = existing_documents
        .iter()
        .chain(new_documents.iter())
        .filter_map(document_message)
        .collect();

    context.push(Message::user(user_text));

    if !document_messages.is_empty() {
        let anchor = context
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(context.len());
        debug!("Inserting {} document message(s) at index {}", document_messages.len(), anchor);
        context.splice(anchor..anchor, document_messages);
    }

    context
}

/// Synthesize one multimodal `user` message for a document; `None` when the
/// document has no pages.
pub fn document_message(document: &DocumentContext) -> Option<Message> {
    if document.is_empty() {
        return None;
    }

    let mut parts = vec![ContentPart::text(format!("[Begin document: {}]", document.source_name))];
    for page in &document.pages {
        push_page(&mut parts, page);
    }
    parts.push(ContentPart::text(format!("[End document: {}]", document.source_name)));

    Some(Message::user_parts(parts))
}

fn push_page(parts: &mut Vec<ContentPart>, page: &Page) {
    if !page.text.trim().is_empty() {
        parts.push(ContentPart::text(page.text.clone()));
    }
    for image in &page.images {
        if let Some(ref data) = image.data {
            parts.push(ContentPart::image(normalize_image_data(data, &image.id)));
        }
    }
}

/// Ensure an image payload is a `data:` URI.
pub fn normalize_image_data(data: &str, image_id: &str) -> String {
    if data.starts_with("data:") {
        return data.to_string();
    }
    let mime = mime_guess::from_path(image_id)
        .first()
        .filter(|m| m.type_() == mime_guess::mime::IMAGE)
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| FALLBACK_IMAGE_MIME.to_string());
    format!("data:{};base64,{}", mime, data)
}
