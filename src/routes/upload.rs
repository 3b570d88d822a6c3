use crate::auth::AuthUser;
use crate::config::Config;
use crate::errors::{ApiError, ApiResult};
use crate::models::UploadResponse;
use rocket::form::Form;
use rocket::fs::TempFile;
use rocket::serde::json::Json;
use rocket::{post, FromForm, State};
use std::path::Path;

#[derive(FromForm)]
pub struct UploadForm<'r> {
    pub file: TempFile<'r>,
}

fn sanitize_filename(raw: &str) -> String {
    let safe: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if safe.trim_matches('.').is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

/// Multipart upload (field `file`, ≤ 50 MiB via the data limits). Files are
/// stored under UPLOAD_DIR with a UUID prefix and served from `/uploads/`.
#[post("/v1/upload", data = "<form>")]
pub async fn upload(
    config: &State<Config>,
    _user: AuthUser,
    mut form: Form<UploadForm<'_>>,
) -> ApiResult<UploadResponse> {
    let file = &mut form.file;
    let size_bytes = file.len();
    if size_bytes == 0 {
        return Err(ApiError::validation("uploaded file is empty"));
    }

    let original = file
        .raw_name()
        .map(|n| n.dangerous_unsafe_unsanitized_raw().as_str().to_string())
        .unwrap_or_else(|| "file".to_string());
    let name = sanitize_filename(&original);
    let stored = format!("{}_{}", uuid::Uuid::new_v4(), name);

    std::fs::create_dir_all(&config.upload_dir)
        .map_err(|e| ApiError::internal(format!("cannot create upload dir: {e}")))?;
    let dest = Path::new(&config.upload_dir).join(&stored);
    file.move_copy_to(&dest)
        .await
        .map_err(|e| ApiError::internal(format!("cannot persist upload: {e}")))?;

    Ok(Json(UploadResponse {
        url: format!("/uploads/{stored}"),
        name,
        size_bytes,
    }))
}
