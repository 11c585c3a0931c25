use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;

use crate::error::{AppError, Result};

use super::{percent, public_url, ProgressFn, CHUNK_SIZE};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: String,
    #[serde(rename = "downloadTokens")]
    download_tokens: Option<String>,
}

/// Client for a bucket exposing the `/o` object REST interface
/// (`POST {bucket}/o?name=…` to upload, `DELETE {bucket}/o/{path}` to remove).
pub struct RemoteImageStore {
    client: Client,
    bucket_url: String,
    access_token: Option<String>,
}

impl RemoteImageStore {
    pub fn new(bucket_url: String, access_token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("storyshelf/1.0")
            .build()?;
        Ok(Self {
            client,
            bucket_url: bucket_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.bucket_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub(super) async fn put(
        &self,
        path: &str,
        data: Vec<u8>,
        on_progress: Option<ProgressFn>,
    ) -> Result<String> {
        let total = data.len();
        let content_type = content_type_for(path);

        // Progress is reported as the client pulls each chunk off the body.
        let chunks: Vec<Vec<u8>> = data.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        let mut sent = 0;
        let body = stream::iter(chunks).map(move |chunk| {
            sent += chunk.len();
            if let Some(cb) = &on_progress {
                cb(percent(sent, total));
            }
            Ok::<_, std::io::Error>(chunk)
        });

        let request = self
            .client
            .post(format!("{}/o", self.bucket_url))
            .query(&[("uploadType", "media"), ("name", path)])
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, total)
            .body(Body::wrap_stream(body));

        let response = self.authorize(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(AppError::StorageApi(format!(
                "upload failed ({}): {}",
                status, error_text
            )));
        }

        let uploaded: UploadResponse = response.json().await?;
        let token = uploaded
            .download_tokens
            .as_deref()
            .and_then(|tokens| tokens.split(',').next());

        Ok(public_url(&self.bucket_url, &uploaded.name, token))
    }

    pub(super) async fn delete(&self, path: &str) -> Result<()> {
        let request = self.client.delete(format!(
            "{}/o/{}",
            self.bucket_url,
            urlencoding::encode(path)
        ));
        let response = self.authorize(request).send().await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(AppError::StorageApi(format!("object not found: {}", path))),
            status => {
                let error_text = response.text().await?;
                Err(AppError::StorageApi(format!(
                    "delete failed ({}): {}",
                    status, error_text
                )))
            }
        }
    }
}

fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use mockito::Matcher;

    use super::super::{ImageStore, ImageUpload};
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<f64>>>, ProgressFn) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |p| sink.lock().unwrap().push(p)))
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type_for("profile-images/a.PNG"), "image/png");
        assert_eq!(content_type_for("profile-images/a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("profile-images/a.bin"), "application/octet-stream");
    }

    #[test]
    fn upload_response_tokens_are_optional() {
        let parsed: UploadResponse =
            serde_json::from_str(r#"{"name":"profile-images/a.png","bucket":"b"}"#).unwrap();
        assert_eq!(parsed.name, "profile-images/a.png");
        assert!(parsed.download_tokens.is_none());
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let store = RemoteImageStore::new("https://store.example/v0/b/app/".to_string(), None).unwrap();
        assert_eq!(store.base_url(), "https://store.example/v0/b/app");
    }

    #[tokio::test]
    async fn upload_posts_media_and_returns_tokened_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/o")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uploadType".into(), "media".into()),
                Matcher::UrlEncoded("name".into(), "profile-images/a.png".into()),
            ]))
            .match_header("authorization", "Bearer tok")
            .match_header("content-type", "image/png")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"profile-images/a.png","downloadTokens":"t1,t2"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = RemoteImageStore::new(server.url(), Some("tok".to_string())).unwrap();
        let (seen, progress) = recorder();

        let url = store
            .put("profile-images/a.png", vec![1u8; CHUNK_SIZE + 1], Some(progress))
            .await
            .unwrap();

        assert_eq!(
            url,
            format!("{}/o/profile-images%2Fa.png?alt=media&token=t1", server.url())
        );
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.last().copied(), Some(100.0));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_upload_still_reports_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/o")
            .match_query(Matcher::UrlEncoded("uploadType".into(), "media".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"profile-images/profile-u1-1.png"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = ImageStore::Remote(RemoteImageStore::new(server.url(), None).unwrap());
        let (seen, progress) = recorder();

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

        assert!(url.ends_with("?alt=media"));
        assert_eq!(*seen.lock().unwrap(), vec![100.0]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn upload_failure_is_storage_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/o")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("bucket unavailable")
            .create_async()
            .await;

        let store = RemoteImageStore::new(server.url(), None).unwrap();
        let err = store
            .put("profile-images/a.png", vec![1, 2, 3], None)
            .await
            .unwrap_err();

        match err {
            AppError::StorageApi(message) => {
                assert!(message.contains("500"));
                assert!(message.contains("bucket unavailable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn delete_removes_object_and_reports_missing_ones() {
        let mut server = mockito::Server::new_async().await;
        let object = Matcher::Regex(r"^/o/profile-images(%2F|/)a\.png$".to_string());
        let gone = server
            .mock("DELETE", object.clone())
            .match_header("authorization", "Bearer tok")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let store = RemoteImageStore::new(server.url(), Some("tok".to_string())).unwrap();
        store.delete("profile-images/a.png").await.unwrap();
        gone.assert_async().await;
        gone.remove_async().await;

        let missing = server
            .mock("DELETE", object)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = store.delete("profile-images/a.png").await.unwrap_err();
        assert!(matches!(err, AppError::StorageApi(ref m) if m.contains("not found")));
        missing.assert_async().await;
    }
}
