use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::Result;

use super::{percent, public_url, ProgressFn, CHUNK_SIZE};

/// Image store backed by a directory, served elsewhere under `base_url`.
pub struct LocalImageStore {
    root: PathBuf,
    base_url: String,
}

impl LocalImageStore {
    pub fn new(root: impl AsRef<Path>, base_url: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn file_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    pub(super) async fn put(
        &self,
        path: &str,
        data: &[u8],
        on_progress: Option<ProgressFn>,
    ) -> Result<String> {
        let target = self.file_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&target).await?;
        let mut written = 0;
        for chunk in data.chunks(CHUNK_SIZE) {
            file.write_all(chunk).await?;
            written += chunk.len();
            if let Some(cb) = &on_progress {
                cb(percent(written, data.len()));
            }
        }
        file.flush().await?;

        Ok(public_url(&self.base_url, path, None))
    }

    pub(super) async fn delete(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.file_path(path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::{ImageStore, ImageUpload};
    use super::*;

    #[tokio::test]
    async fn upload_reports_progress_and_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::Local(LocalImageStore::new(dir.path(), "http://localhost/storage/"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));

        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        let url = store
            .upload_profile_image(
                "u1",
                ImageUpload {
                    file_name: "avatar.png".to_string(),
                    data: data.clone(),
                },
                Some(progress),
            )
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost/storage/o/profile-images%2Fprofile-u1-"));
        assert!(url.ends_with(".png?alt=media"));
        assert!(store.owns_url(&url));
        assert!(!store.owns_url("https://elsewhere.example/avatar.png"));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last().copied(), Some(100.0));

        let path = super::super::path_from_url(&url).unwrap();
        let ImageStore::Local(local) = &store else {
            unreachable!()
        };
        let on_disk = local.file_path(&path);
        assert_eq!(tokio::fs::read(&on_disk).await.unwrap(), data);

        store.delete_profile_image(&url).await.unwrap();
        assert!(!on_disk.exists());
        assert!(store.delete_profile_image(&url).await.is_err());
    }

    #[tokio::test]
    async fn empty_upload_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::Local(LocalImageStore::new(dir.path(), "http://localhost"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));

        let url = store
            .upload_profile_image(
                "u1",
                ImageUpload {
                    file_name: "empty.png".to_string(),
                    data: Vec::new(),
                },
                Some(progress),
            )
            .await
            .unwrap();
        assert!(url.ends_with(".png?alt=media"));
        assert_eq!(*seen.lock().unwrap(), vec![100.0]);
    }
}
