use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::server::{Notifier, ServerState};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload is empty")]
    Empty,
    #[error("upload is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("upload is not a supported image")]
    UnsupportedType,
    #[error("invalid file name")]
    InvalidName,
    #[error("upload storage failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub file_name: String,
    pub url: String,
    pub content_type: &'static str,
}

/// Images re-hosted under our public URL so the provider can fetch them.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    public_base_url: String,
    max_bytes: usize,
}

const SUPPORTED_IMAGE_TYPES: [(&str, &str); 4] = [
    ("jpg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
];

impl UploadStore {
    pub async fn new(dir: impl AsRef<Path>, public_base_url: &str, max_bytes: usize) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(UploadStore {
            dir,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            max_bytes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn public_url(&self, file_name: &str) -> String {
        format!("{}/uploads/{}", self.public_base_url, file_name)
    }

    pub async fn save(&self, bytes: &[u8]) -> Result<StoredUpload, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(UploadError::TooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }

        let kind = infer::get(bytes).ok_or(UploadError::UnsupportedType)?;
        let (extension, content_type) = SUPPORTED_IMAGE_TYPES
            .iter()
            .copied()
            .find(|(_, mime)| *mime == kind.mime_type())
            .ok_or(UploadError::UnsupportedType)?;

        let file_name = format!("image_{}.{}", Uuid::new_v4().simple(), extension);
        tokio::fs::write(self.dir.join(&file_name), bytes).await?;
        info!("Image uploaded: {file_name}");

        Ok(StoredUpload {
            url: self.public_url(&file_name),
            file_name,
            content_type,
        })
    }

    /// Reads a stored upload. `None` when the file does not exist.
    pub async fn load(&self, file_name: &str) -> Result<Option<(Vec<u8>, &'static str)>, UploadError> {
        let file_name = sanitize_file_name(file_name).ok_or(UploadError::InvalidName)?;
        let path = self.dir.join(file_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some((bytes, content_type_for(file_name)))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn sanitize_file_name(file_name: &str) -> Option<&str> {
    let trimmed = file_name.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('.')
        || trimmed.contains(['/', '\\', '\0'])
        || trimmed.contains("..")
    {
        return None;
    }
    Some(trimmed)
}

pub fn content_type_for(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

pub(crate) async fn upload_image<N: Notifier>(
    State(state): State<Arc<ServerState<N>>>,
    mut multipart: Multipart,
) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!("Upload error: {err}");
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() })))
                    .into_response();
            }
        };
        if field.name() != Some("image") {
            continue;
        }

        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Upload error: {err}");
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() })))
                    .into_response();
            }
        };

        return match state.uploads.save(&bytes).await {
            Ok(stored) => Json(json!({ "success": true, "url": stored.url })).into_response(),
            Err(UploadError::Io(err)) => {
                error!("Upload error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
            Err(err) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response()
            }
        };
    }

    (StatusCode::BAD_REQUEST, Json(json!({ "error": "No image field" }))).into_response()
}

pub(crate) async fn serve_upload<N: Notifier>(
    State(state): State<Arc<ServerState<N>>>,
    UrlPath(file_name): UrlPath<String>,
) -> Response {
    match state.uploads.load(&file_name).await {
        Ok(Some((bytes, content_type))) => {
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Ok(None) | Err(UploadError::InvalidName) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("Failed to read upload {file_name}: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_BYTES: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52,
    ];

    async fn store(max_bytes: usize) -> (tempfile::TempDir, UploadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path(), "https://bot.example/", max_bytes)
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn saves_png_under_generated_name() {
        let (_dir, store) = store(1024).await;
        let stored = store.save(PNG_BYTES).await.unwrap();
        assert!(stored.file_name.starts_with("image_"));
        assert!(stored.file_name.ends_with(".png"));
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(
            stored.url,
            format!("https://bot.example/uploads/{}", stored.file_name)
        );

        let (bytes, content_type) = store.load(&stored.file_name).await.unwrap().unwrap();
        assert_eq!(bytes, PNG_BYTES);
        assert_eq!(content_type, "image/png");
    }

    #[tokio::test]
    async fn rejects_empty_oversized_and_non_images() {
        let (_dir, store) = store(8).await;
        assert!(matches!(store.save(&[]).await, Err(UploadError::Empty)));
        assert!(matches!(
            store.save(PNG_BYTES).await,
            Err(UploadError::TooLarge { size: 16, max: 8 })
        ));
        assert!(matches!(
            store.save(b"hello").await,
            Err(UploadError::UnsupportedType)
        ));
    }

    #[tokio::test]
    async fn load_refuses_traversal_and_reports_missing() {
        let (_dir, store) = store(1024).await;
        assert!(matches!(
            store.load("../secret.db").await,
            Err(UploadError::InvalidName)
        ));
        assert!(matches!(
            store.load(".env").await,
            Err(UploadError::InvalidName)
        ));
        assert!(store.load("missing.png").await.unwrap().is_none());
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for("a.PNG"), "image/png");
        assert_eq!(content_type_for("a.webp"), "image/webp");
        assert_eq!(content_type_for("a.gif"), "image/gif");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("noext"), "image/jpeg");
    }
}
