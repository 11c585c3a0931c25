//! Profile image storage.
//!
//! Images live under `profile-images/` in either a local directory or a remote
//! storage bucket. Both backends hand out public URLs of the form
//! `{base}/o/{percent-encoded path}?alt=media`, and deletion works back from
//! such a URL to the object path.

mod local;
mod remote;

use std::sync::Arc;

use url::Url;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{AppError, Result};

pub use local::LocalImageStore;
pub use remote::RemoteImageStore;

pub const PROFILE_IMAGE_DIR: &str = "profile-images";

/// Bytes per progress step.
const CHUNK_SIZE: usize = 64 * 1024;

/// Upload progress callback, called with a percentage in `0.0..=100.0`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub data: Vec<u8>,
}

pub enum ImageStore {
    Local(LocalImageStore),
    Remote(RemoteImageStore),
}

impl ImageStore {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Local => Ok(ImageStore::Local(LocalImageStore::new(
                &config.local_dir,
                &config.public_base_url,
            ))),
            StorageBackend::Remote => {
                let bucket_url = config.bucket_url.clone().ok_or_else(|| {
                    AppError::Config("storage.bucket_url is required for the remote backend".to_string())
                })?;
                let store = RemoteImageStore::new(bucket_url, config.access_token.clone())?;
                Ok(ImageStore::Remote(store))
            }
        }
    }

    /// Upload a profile image and return its public URL.
    pub async fn upload_profile_image(
        &self,
        user_id: &str,
        upload: ImageUpload,
        on_progress: Option<ProgressFn>,
    ) -> Result<String> {
        let path = object_path(
            user_id,
            &upload.file_name,
            chrono::Utc::now().timestamp_millis(),
        );
        tracing::debug!("Uploading {} bytes to {}", upload.data.len(), path);

        // Backends report progress per chunk; an empty body has none.
        let finish = upload.data.is_empty().then(|| on_progress.clone()).flatten();

        let url = match self {
            ImageStore::Local(store) => store.put(&path, &upload.data, on_progress).await?,
            ImageStore::Remote(store) => store.put(&path, upload.data, on_progress).await?,
        };

        if let Some(cb) = finish {
            cb(100.0);
        }
        Ok(url)
    }

    pub async fn delete_profile_image(&self, image_url: &str) -> Result<()> {
        let path = path_from_url(image_url)?;
        tracing::debug!("Deleting image {}", path);

        match self {
            ImageStore::Local(store) => store.delete(&path).await,
            ImageStore::Remote(store) => store.delete(&path).await,
        }
    }

    /// Whether the URL points into this store.
    pub fn owns_url(&self, image_url: &str) -> bool {
        let base = match self {
            ImageStore::Local(store) => store.base_url(),
            ImageStore::Remote(store) => store.base_url(),
        };
        image_url.starts_with(&format!("{}/o/", base.trim_end_matches('/')))
    }
}

/// `profile-images/profile-{user}-{millis}.{ext}`, where `ext` is whatever
/// follows the last `.` of the uploaded file name.
pub fn object_path(user_id: &str, file_name: &str, millis: i64) -> String {
    let ext = file_name.rsplit('.').next().unwrap_or_default();
    format!("{PROFILE_IMAGE_DIR}/profile-{user_id}-{millis}.{ext}")
}

pub fn public_url(base_url: &str, path: &str, token: Option<&str>) -> String {
    let mut url = format!(
        "{}/o/{}?alt=media",
        base_url.trim_end_matches('/'),
        urlencoding::encode(path)
    );
    if let Some(token) = token {
        url.push_str("&token=");
        url.push_str(&urlencoding::encode(token));
    }
    url
}

/// Recover the object path from a public URL: the decoded part of the URL
/// path after `/o/`, query excluded.
pub fn path_from_url(image_url: &str) -> Result<String> {
    let url = Url::parse(image_url).map_err(|_| AppError::InvalidImageUrl(image_url.to_string()))?;

    let encoded = url
        .path()
        .split_once("/o/")
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| AppError::InvalidImageUrl(image_url.to_string()))?;

    let path = urlencoding::decode(encoded)
        .map_err(|_| AppError::InvalidImageUrl(image_url.to_string()))?
        .into_owned();

    if path.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return Err(AppError::InvalidImageUrl(image_url.to_string()));
    }

    Ok(path)
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_uses_last_extension() {
        assert_eq!(
            object_path("u1", "me.final.PNG", 1_678_886_400_000),
            "profile-images/profile-u1-1678886400000.PNG"
        );
        assert_eq!(
            object_path("u1", "noext", 5),
            "profile-images/profile-u1-5.noext"
        );
    }

    #[test]
    fn public_url_encodes_path() {
        let url = public_url("https://store.example/v0/b/app/", "profile-images/a b.png", Some("t0k"));
        assert_eq!(
            url,
            "https://store.example/v0/b/app/o/profile-images%2Fa%20b.png?alt=media&token=t0k"
        );
    }

    #[test]
    fn path_comes_back_from_public_url() {
        let url = public_url("https://store.example/v0/b/app", "profile-images/profile-u1-5.png", None);
        assert_eq!(path_from_url(&url).unwrap(), "profile-images/profile-u1-5.png");
    }

    #[test]
    fn rejects_urls_without_object_path() {
        assert!(matches!(
            path_from_url("https://store.example/avatar.png"),
            Err(AppError::InvalidImageUrl(_))
        ));
        assert!(path_from_url("not a url").is_err());
        assert!(path_from_url("https://store.example/o/").is_err());
        assert!(path_from_url("https://store.example/o/..%2Fsecret").is_err());
    }

    #[test]
    fn percent_of_empty_upload_is_complete() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
