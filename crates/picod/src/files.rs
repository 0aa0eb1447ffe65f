use std::path::Path;

use anyhow::Context;
use axum::extract::{Multipart, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use base64::Engine;

use crate::error::{AgentError, Json};
use crate::AppState;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

#[derive(Debug, serde::Deserialize)]
pub struct UploadRequest {
    pub path: String,
    /// Base64-encoded file content.
    pub content: String,
    /// Octal mode string such as "0755". Out-of-range or unparsable
    /// values fall back to 0644.
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub modified: chrono::DateTime<chrono::Utc>,
    pub mode: String,
    pub is_dir: bool,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ListResponse {
    pub files: Vec<FileInfo>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: String,
}

/// Parse an octal mode string, falling back to 0644 for anything that is
/// not a valid mode within 0777.
pub fn parse_mode(mode: Option<&str>) -> u32 {
    mode.and_then(|raw| u32::from_str_radix(raw, 8).ok())
        .filter(|m| *m <= 0o777)
        .unwrap_or(DEFAULT_FILE_MODE)
}

/// `POST /api/files` accepts either a JSON body (base64 content + mode)
/// or a multipart form (`path`, `file`); dispatch is by content type.
pub async fn upload(
    State(state): State<std::sync::Arc<AppState>>,
    req: axum::extract::Request,
) -> Result<axum::Json<FileInfo>, AgentError> {
    use axum::extract::FromRequest;

    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .trim()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data")
        })
        .unwrap_or(false);

    if is_multipart {
        let multipart = Multipart::from_request(req, &())
            .await
            .map_err(|err| AgentError::BadRequest(format!("malformed multipart body: {err}")))?;
        upload_multipart(&state, multipart).await
    } else {
        let Json(request) = Json::<UploadRequest>::from_request(req, &()).await?;
        let content = base64::engine::general_purpose::STANDARD
            .decode(&request.content)
            .map_err(|_| AgentError::BadRequest("content is not valid base64".into()))?;
        let mode = parse_mode(request.mode.as_deref());
        let info = write_file(&state, &request.path, &content, mode).await?;
        Ok(axum::Json(info))
    }
}

/// Multipart upload: fields `path` and `file`, written with the default mode.
async fn upload_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<axum::Json<FileInfo>, AgentError> {
    let mut path: Option<String> = None;
    let mut content: Option<bytes::Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AgentError::BadRequest(format!("malformed multipart body: {err}")))?
    {
        match field.name() {
            Some("path") => {
                path = Some(field.text().await.map_err(|err| {
                    AgentError::BadRequest(format!("reading path field: {err}"))
                })?);
            }
            Some("file") => {
                content = Some(field.bytes().await.map_err(|err| {
                    AgentError::BadRequest(format!("reading file field: {err}"))
                })?);
            }
            _ => (),
        }
    }

    let path = path.ok_or_else(|| AgentError::BadRequest("missing path field".into()))?;
    let content =
        content.ok_or_else(|| AgentError::BadRequest("missing file field".into()))?;

    let info = write_file(state, &path, &content, DEFAULT_FILE_MODE).await?;
    Ok(axum::Json(info))
}

async fn write_file(
    state: &AppState,
    path: &str,
    content: &[u8],
    mode: u32,
) -> Result<FileInfo, AgentError> {
    use tokio::io::AsyncWriteExt;

    let target = state.jail.resolve(path)?;
    if let Some(parent) = target.parent() {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(parent)
            .await
            .with_context(|| format!("creating parent directories for {target:?}"))?;
    }

    // The mode applies at creation, before any byte is visible.
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&target)
        .await
        .with_context(|| format!("opening {target:?}"))?;
    file.write_all(content)
        .await
        .with_context(|| format!("writing {target:?}"))?;
    file.flush().await.context("flushing upload")?;
    drop(file);

    // An existing file keeps its old mode from create(); enforce ours.
    tokio::fs::set_permissions(&target, std::os::unix::fs::PermissionsExt::from_mode(mode))
        .await
        .with_context(|| format!("setting mode of {target:?}"))?;

    let metadata = tokio::fs::metadata(&target)
        .await
        .with_context(|| format!("reading back {target:?}"))?;
    Ok(file_info(&target, &metadata))
}

/// `GET /api/files/{*path}`: stream the file back as an attachment.
pub async fn download(
    State(state): State<std::sync::Arc<AppState>>,
    axum::extract::Path(path): axum::extract::Path<String>,
) -> Result<axum::response::Response, AgentError> {
    let target = state.jail.resolve(&path)?;

    let metadata = match tokio::fs::metadata(&target).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AgentError::NotFound(format!("file {path:?} not found")))
        }
        Err(err) => return Err(anyhow::Error::from(err).into()),
    };
    if metadata.is_dir() {
        return Err(AgentError::BadRequest(format!(
            "{path:?} is a directory, not a file"
        )));
    }

    let content = tokio::fs::read(&target)
        .await
        .with_context(|| format!("reading {target:?}"))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let content_type = mime_guess::from_path(&target)
        .first_or_octet_stream()
        .to_string();

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        content,
    )
        .into_response())
}

/// `GET /api/files?path=…`: list a directory.
pub async fn list(
    State(state): State<std::sync::Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<axum::Json<ListResponse>, AgentError> {
    let target = state.jail.resolve(&query.path)?;

    let mut entries = match tokio::fs::read_dir(&target).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AgentError::NotFound(format!(
                "directory {:?} not found",
                query.path
            )))
        }
        Err(err) => return Err(anyhow::Error::from(err).into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .context("reading directory entry")?
    {
        let metadata = entry.metadata().await.context("reading entry metadata")?;
        files.push(file_info(&entry.path(), &metadata));
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(axum::Json(ListResponse { files }))
}

fn file_info(path: &Path, metadata: &std::fs::Metadata) -> FileInfo {
    use std::os::unix::fs::PermissionsExt;

    let modified = metadata
        .modified()
        .map(chrono::DateTime::<chrono::Utc>::from)
        .unwrap_or_else(|_| chrono::Utc::now());

    FileInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: metadata.len(),
        modified,
        mode: format!("{:04o}", metadata.permissions().mode() & 0o7777),
        is_dir: metadata.is_dir(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_mode_fallbacks() {
        for bad in ["0778", "10000", "abc", ""] {
            assert_eq!(parse_mode(Some(bad)), 0o644, "{bad:?}");
        }
        assert_eq!(parse_mode(None), 0o644);
        assert_eq!(parse_mode(Some("0755")), 0o755);
        assert_eq!(parse_mode(Some("777")), 0o777);
        assert_eq!(parse_mode(Some("0400")), 0o400);
    }
}
