use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;

use huddle_types::api::OutgoingAttachment;

use crate::config::DEFAULT_MAX_ATTACHMENT_BYTES;
use crate::error::ValidationError;

const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
];

const ALLOWED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "pdf", "doc", "docx", "txt",
];

/// A file the user picked, before validation.
#[derive(Debug, Clone)]
pub struct AttachmentCandidate {
    pub name: String,
    /// Type declared by the picker, if any.
    pub mime: Option<String>,
    pub data: Bytes,
}

impl AttachmentCandidate {
    pub fn new(name: impl Into<String>, mime: Option<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime,
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }

    /// Declared MIME essence: lowercased, parameters stripped.
    fn mime_essence(&self) -> Option<String> {
        self.mime.as_deref().map(|mime| {
            mime.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}

/// An attachment that passed [`validate`]. Only this type can sit in a draft.
#[derive(Debug, Clone)]
pub struct ValidatedAttachment(AttachmentCandidate);

impl ValidatedAttachment {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn size(&self) -> u64 {
        self.0.size()
    }

    /// MIME type if declared, otherwise the extension.
    pub fn mime_or_ext(&self) -> String {
        self.0
            .mime_essence()
            .filter(|mime| !mime.is_empty())
            .or_else(|| self.0.extension())
            .unwrap_or_default()
    }

    pub fn to_outgoing(&self) -> OutgoingAttachment {
        OutgoingAttachment {
            name: self.0.name.clone(),
            mime: self.0.mime.clone(),
            data: B64.encode(&self.0.data),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttachmentPolicy {
    pub max_bytes: u64,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

impl AttachmentPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Check size first, then type. Either the declared MIME type or the
    /// filename extension must be on the allow-list.
    pub fn validate(
        &self,
        candidate: AttachmentCandidate,
    ) -> Result<ValidatedAttachment, ValidationError> {
        let size = candidate.size();
        if size > self.max_bytes {
            return Err(ValidationError::TooLarge {
                name: candidate.name,
                size,
                limit: self.max_bytes,
            });
        }

        let mime_ok = candidate
            .mime_essence()
            .is_some_and(|mime| ALLOWED_MIME_TYPES.contains(&mime.as_str()));
        let ext_ok = candidate
            .extension()
            .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()));

        if !mime_ok && !ext_ok {
            return Err(ValidationError::UnsupportedType {
                name: candidate.name,
            });
        }

        Ok(ValidatedAttachment(candidate))
    }
}

/// Validate against the default policy.
pub fn validate(candidate: AttachmentCandidate) -> Result<ValidatedAttachment, ValidationError> {
    AttachmentPolicy::default().validate(candidate)
}
