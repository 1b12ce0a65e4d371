//! Transport encoding: raw file bytes → base64 for JSON request bodies.
//!
//! Both Google extraction APIs take the document inline as a base64
//! `content` string rather than as a multipart upload, so every byte buffer
//! passes through here on its way to [`crate::pipeline::extract`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

/// Encode a downloaded file for an inline `content` field.
pub fn encode_document(bytes: &[u8]) -> String {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded {} bytes → {} bytes base64", bytes.len(), b64.len());
    b64
}

/// Whether the extraction APIs treat `mime_type` as a multi-page file
/// (PDF/TIFF/GIF) rather than a single image.
pub fn is_paged_mime(mime_type: &str) -> bool {
    matches!(
        mime_type.to_ascii_lowercase().as_str(),
        "application/pdf" | "image/tiff" | "image/gif"
    )
}
