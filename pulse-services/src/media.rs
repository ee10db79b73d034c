use chrono::Utc;
use pulse_core::storage::SignedUpload;
use pulse_core::types::MessageType;
use pulse_core::{PulseContext, PulseError, PulseResult};
use serde::{Deserialize, Serialize};
use tracing;

use crate::conversations::ConversationService;

pub const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;
pub const MAX_VIDEO_BYTES: u64 = 20 * 1024 * 1024;
pub const UPLOAD_URL_TTL_SECS: u64 = 300;
pub const DOWNLOAD_URL_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub conversation_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadGrant {
    pub upload_url: String,
    pub file_path: String,
    pub token: String,
    pub media_type: MessageType,
    pub expires_in: u64,
}

/// Maps a mime type onto the media classification, or `None` for anything
/// the service does not accept.
pub fn classify_mime(mime_type: &str) -> Option<MessageType> {
    match mime_type {
        "image/jpeg" | "image/png" | "image/gif" | "image/webp" => Some(MessageType::Image),
        "video/mp4" | "video/quicktime" | "video/webm" => Some(MessageType::Video),
        _ => None,
    }
}

pub fn max_bytes_for(media_type: MessageType) -> u64 {
    match media_type {
        MessageType::Video => MAX_VIDEO_BYTES,
        _ => MAX_IMAGE_BYTES,
    }
}

/// Keeps the stored object name to `[A-Za-z0-9._-]`; anything else becomes
/// `_`. Path separators are stripped by taking the final segment first.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);

    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct MediaService {
    ctx: PulseContext,
}

impl MediaService {
    pub fn new(ctx: PulseContext) -> Self {
        Self { ctx }
    }

    pub async fn request_upload_url(
        &self,
        actor: &str,
        input: UploadRequest,
    ) -> PulseResult<UploadGrant> {
        let conversations = ConversationService::new(self.ctx.clone());
        if !conversations
            .is_member(&input.conversation_id, actor)
            .await?
        {
            return Err(PulseError::Forbidden(format!(
                "user {} is not a member of conversation {}",
                actor, input.conversation_id
            )));
        }

        let media_type = classify_mime(&input.mime_type).ok_or_else(|| {
            PulseError::BadRequest(format!("unsupported media type: {}", input.mime_type))
        })?;

        if input.file_size == 0 {
            return Err(PulseError::BadRequest("empty file".to_string()));
        }
        let max = max_bytes_for(media_type);
        if input.file_size > max {
            return Err(PulseError::BadRequest(format!(
                "file size {} exceeds limit of {} bytes",
                input.file_size, max
            )));
        }

        let file_path = format!(
            "conversations/{}/{}_{}_{}",
            input.conversation_id,
            actor,
            Utc::now().timestamp_millis(),
            sanitize_file_name(&input.file_name)
        );

        let SignedUpload {
            signed_url,
            path,
            token,
        } = self.ctx.storage.create_signed_upload_url(&file_path).await?;

        tracing::debug!("Issued upload grant for {}", path);

        Ok(UploadGrant {
            upload_url: signed_url,
            file_path: path,
            token,
            media_type,
            expires_in: UPLOAD_URL_TTL_SECS,
        })
    }

    /// No membership re-check at read time: a path only ever leaves the
    /// service inside a message the actor could already see.
    pub async fn get_media_url(&self, file_path: &str) -> PulseResult<String> {
        if file_path.trim().is_empty() {
            return Err(PulseError::BadRequest("empty media path".to_string()));
        }

        self.ctx
            .storage
            .create_signed_download_url(file_path, DOWNLOAD_URL_TTL_SECS)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_supported_mimes() {
        assert_eq!(classify_mime("image/jpeg"), Some(MessageType::Image));
        assert_eq!(classify_mime("image/png"), Some(MessageType::Image));
        assert_eq!(classify_mime("image/gif"), Some(MessageType::Image));
        assert_eq!(classify_mime("image/webp"), Some(MessageType::Image));
        assert_eq!(classify_mime("video/mp4"), Some(MessageType::Video));
        assert_eq!(classify_mime("video/quicktime"), Some(MessageType::Video));
        assert_eq!(classify_mime("video/webm"), Some(MessageType::Video));
    }

    #[test]
    fn rejects_unknown_mimes() {
        assert_eq!(classify_mime("application/pdf"), None);
        assert_eq!(classify_mime("image/svg+xml"), None);
        assert_eq!(classify_mime("audio/mpeg"), None);
    }

    #[test]
    fn size_limits_are_inclusive() {
        assert!(MAX_IMAGE_BYTES <= max_bytes_for(MessageType::Image));
        assert_eq!(max_bytes_for(MessageType::Image), 5 * 1024 * 1024);
        assert_eq!(max_bytes_for(MessageType::Video), 20 * 1024 * 1024);
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_file_name("photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("my photo (1).png"), "my_photo__1_.png");
        assert_eq!(sanitize_file_name("weird$name!.mp4"), "weird_name_.mp4");
    }

    #[test]
    fn strips_path_separators() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("a/b/c.png"), "c.png");
        assert_eq!(sanitize_file_name("a\\b\\c.png"), "c.png");
    }
}
