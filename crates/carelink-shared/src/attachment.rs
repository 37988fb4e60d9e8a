//! Attachment validation and local preview handling.
//!
//! Validation runs before any network call and mirrors the server's own
//! checks, so a rejected file never produces a request.

use base64::Engine;
use bytes::Bytes;

use crate::constants::{ALLOWED_MIME_TYPES, MAX_ATTACHMENT_SIZE};
use crate::error::ValidationError;
use crate::types::AttachmentMeta;

/// Whether the server accepts this MIME type.
pub fn is_allowed_mime(mime: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&mime)
}

/// A file selected for sending, held in memory until the upload settles.
///
/// The bytes are retained for the lifetime of the send so a failed message
/// can be retried without re-reading the file.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl AttachmentUpload {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Enforce the size cap and MIME allow-list.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bytes.len() > MAX_ATTACHMENT_SIZE {
            return Err(ValidationError::FileTooLarge {
                size: self.bytes.len(),
            });
        }
        if !is_allowed_mime(&self.mime_type) {
            return Err(ValidationError::UnsupportedFileType {
                mime: self.mime_type.clone(),
            });
        }
        Ok(())
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Data-URL preview for images, so the bubble renders before the upload
    /// completes. `None` for non-image files.
    pub fn preview_data_url(&self) -> Option<String> {
        if !self.is_image() {
            return None;
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        Some(format!("data:{};base64,{encoded}", self.mime_type))
    }

    /// Metadata for the optimistic message (no server URL yet, preview set
    /// for images).
    pub fn meta(&self) -> AttachmentMeta {
        AttachmentMeta {
            file_name: self.file_name.clone(),
            byte_size: self.bytes.len() as u64,
            mime_type: self.mime_type.clone(),
            url: None,
            local_preview: self.preview_data_url(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(mime: &str, len: usize) -> AttachmentUpload {
        AttachmentUpload::new("file.bin", mime, Bytes::from(vec![0u8; len]))
    }

    #[test]
    fn accepts_file_at_exact_limit() {
        let a = upload("application/pdf", MAX_ATTACHMENT_SIZE);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn rejects_file_one_byte_over_limit() {
        let a = upload("application/pdf", MAX_ATTACHMENT_SIZE + 1);
        assert_eq!(
            a.validate(),
            Err(ValidationError::FileTooLarge {
                size: MAX_ATTACHMENT_SIZE + 1
            })
        );
    }

    #[test]
    fn rejects_unsupported_mime() {
        let a = upload("application/x-msdownload", 16);
        assert!(matches!(
            a.validate(),
            Err(ValidationError::UnsupportedFileType { .. })
        ));
    }

    #[test]
    fn preview_only_for_images() {
        let img = upload("image/png", 4);
        let preview = img.preview_data_url().unwrap();
        assert!(preview.starts_with("data:image/png;base64,"));

        let pdf = upload("application/pdf", 4);
        assert!(pdf.preview_data_url().is_none());
        assert!(pdf.meta().local_preview.is_none());
    }

    #[test]
    fn allow_list_covers_office_and_csv() {
        for mime in ["image/webp", "text/csv", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"] {
            assert!(is_allowed_mime(mime), "{mime} should be allowed");
        }
        assert!(!is_allowed_mime("video/mp4"));
    }
}
