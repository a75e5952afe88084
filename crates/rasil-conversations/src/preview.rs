//! Preview-text derivation for the conversation list.

use rasil_core::types::{Attachment, AttachmentKind};

/// The body when non-empty; otherwise a glyph per the first attachment's
/// type, so media-only messages still render a meaningful preview.
pub fn preview_text(body: &str, attachments: &[Attachment]) -> String {
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    match attachments.first().map(|a| a.kind) {
        Some(AttachmentKind::Voice) | Some(AttachmentKind::Audio) => "🎙️ تسجيل صوتي".to_string(),
        Some(AttachmentKind::Image) => "📷 صورة".to_string(),
        Some(AttachmentKind::Video) => "🎥 فيديو".to_string(),
        Some(AttachmentKind::Document) => "📁 ملف".to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_wins_over_attachments() {
        let atts = vec![Attachment::new(AttachmentKind::Image, "image/jpeg")];
        assert_eq!(preview_text("مرحبا", &atts), "مرحبا");
    }

    #[test]
    fn empty_body_with_voice_gets_glyph() {
        let atts = vec![Attachment::new(AttachmentKind::Voice, "audio/ogg")];
        assert_eq!(preview_text("", &atts), "🎙️ تسجيل صوتي");
    }

    #[test]
    fn empty_body_without_attachments_stays_empty() {
        assert_eq!(preview_text("  ", &[]), "");
    }
}
