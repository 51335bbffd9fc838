//! HTTP adapter for the izerop API.
//!
//! Implements [`RemoteStore`] over `/api/v1/...` with bearer auth. Two
//! clients are held: a short-timeout one for control-plane calls and a
//! long-timeout one for downloads, whose redirects are followed by hand so
//! the `Authorization` header can be dropped once a hop leaves the origin
//! host (blob stores hand out pre-signed URLs and some reject foreign auth).

use async_trait::async_trait;
use izerop_core::{
    ChangePage, Manifest, RemoteDirectory, RemoteFile, RemoteStore, SyncError, SyncResult,
    SyncStatus,
};
use reqwest::{header, multipart, redirect, Client, Response, Url};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_REDIRECTS: usize = 10;

pub struct HttpRemote {
    base_url: String,
    token: String,
    client: Client,
    download_client: Client,
}

#[derive(Deserialize)]
struct FilesEnvelope {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

#[derive(Deserialize)]
struct DirectoriesEnvelope {
    #[serde(default)]
    directories: Vec<RemoteDirectory>,
}

#[derive(Deserialize)]
struct FileEnvelope {
    file: RemoteFile,
}

#[derive(Deserialize)]
struct DirectoryEnvelope {
    directory: RemoteDirectory,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(transport)?;
        let download_client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(transport)?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
            download_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> SyncResult<Response> {
        let response = request
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> SyncResult<T> {
        let response = self.send(self.client.get(self.url(path))).await?;
        decode(path, response).await
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(path: &str, response: Response) -> SyncResult<T> {
    response
        .json()
        .await
        .map_err(|err| SyncError::Protocol(format!("decode {path}: {err}")))
}

fn transport(err: reqwest::Error) -> SyncError {
    SyncError::Transport {
        message: err.to_string(),
        retryable: err.is_timeout() || err.is_connect() || err.is_request(),
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn list_directories(&self) -> SyncResult<Vec<RemoteDirectory>> {
        let envelope: DirectoriesEnvelope = self.get_json("/api/v1/directories").await?;
        Ok(envelope.directories)
    }

    async fn list_files(&self, directory_id: Option<&str>) -> SyncResult<Vec<RemoteFile>> {
        let path = match directory_id {
            Some(id) => format!("/api/v1/files?directory_id={id}"),
            None => "/api/v1/files".to_string(),
        };
        let envelope: FilesEnvelope = self.get_json(&path).await?;
        Ok(envelope.files)
    }

    async fn get_changes(&self, cursor: Option<&str>) -> SyncResult<ChangePage> {
        let path = match cursor {
            Some(cursor) => format!("/api/v1/sync/changes?since={cursor}"),
            None => "/api/v1/sync/changes".to_string(),
        };
        self.get_json(&path).await
    }

    async fn get_manifest(&self, root: &str) -> SyncResult<Manifest> {
        self.get_json(&format!("/api/v1/sync/manifest?root={root}"))
            .await
    }

    async fn sync_status(&self) -> SyncResult<SyncStatus> {
        self.get_json("/api/v1/sync/status").await
    }

    async fn create_directory(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> SyncResult<RemoteDirectory> {
        let mut payload = json!({ "name": name });
        if let Some(parent_id) = parent_id {
            payload["user_directory_id"] = json!(parent_id);
        }
        let path = "/api/v1/directories";
        let response = self
            .send(self.client.post(self.url(path)).json(&payload))
            .await?;
        let envelope: DirectoryEnvelope = decode(path, response).await?;
        Ok(envelope.directory)
    }

    async fn upload_binary(
        &self,
        local: &Path,
        directory_id: &str,
        name: &str,
    ) -> SyncResult<RemoteFile> {
        let bytes = tokio::fs::read(local).await?;
        debug!(name, size = bytes.len(), "multipart upload");
        let part = multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("application/octet-stream")
            .map_err(transport)?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("directory_id", directory_id.to_string())
            .text("name", name.to_string());
        let path = "/api/v1/files";
        let response = self
            .send(self.client.post(self.url(path)).multipart(form))
            .await?;
        let envelope: FileEnvelope = decode(path, response).await?;
        Ok(envelope.file)
    }

    async fn create_text(
        &self,
        name: &str,
        contents: &str,
        directory_id: &str,
    ) -> SyncResult<RemoteFile> {
        let payload = json!({
            "name": name,
            "contents": contents,
            "directory_id": directory_id,
            "content_type": "text/plain",
        });
        let path = "/api/v1/files/text";
        let response = self
            .send(self.client.post(self.url(path)).json(&payload))
            .await?;
        let envelope: FileEnvelope = decode(path, response).await?;
        Ok(envelope.file)
    }

    async fn update_contents(&self, file_id: &str, contents: &str) -> SyncResult<RemoteFile> {
        let path = format!("/api/v1/files/{file_id}");
        let payload = json!({ "contents": contents });
        let response = self
            .send(self.client.patch(self.url(&path)).json(&payload))
            .await?;
        let envelope: FileEnvelope = decode(&path, response).await?;
        Ok(envelope.file)
    }

    async fn move_file(
        &self,
        file_id: &str,
        new_name: Option<&str>,
        new_directory_id: Option<&str>,
    ) -> SyncResult<RemoteFile> {
        let mut payload = json!({});
        if let Some(name) = new_name {
            payload["name"] = json!(name);
        }
        if let Some(dir_id) = new_directory_id {
            payload["directory_id"] = json!(dir_id);
        }
        let path = format!("/api/v1/files/{file_id}");
        let response = self
            .send(self.client.patch(self.url(&path)).json(&payload))
            .await?;
        let envelope: FileEnvelope = decode(&path, response).await?;
        Ok(envelope.file)
    }

    async fn delete_file(&self, file_id: &str) -> SyncResult<()> {
        self.send(self.client.delete(self.url(&format!("/api/v1/files/{file_id}"))))
            .await?;
        Ok(())
    }

    async fn delete_directory(&self, directory_id: &str) -> SyncResult<()> {
        self.send(
            self.client
                .delete(self.url(&format!("/api/v1/directories/{directory_id}"))),
        )
        .await?;
        Ok(())
    }

    async fn download(&self, file_id: &str, dest: &Path) -> SyncResult<String> {
        let mut url = self.url(&format!("/api/v1/files/{file_id}/download"));
        let origin_host = host_of(&url);
        let mut authorized = true;
        let mut hops = 0;

        let mut response = loop {
            let mut request = self.download_client.get(&url);
            if authorized {
                request = request.bearer_auth(&self.token);
            }
            let response = request.send().await.map_err(transport)?;
            if response.status().is_redirection() {
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(SyncError::Protocol("too many redirects".into()));
                }
                let Some(location) = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                else {
                    return Err(SyncError::Protocol("redirect without location".into()));
                };
                url = resolve_location(&url, location)?;
                // credentials never leave the origin host
                if host_of(&url) != origin_host {
                    authorized = false;
                }
                continue;
            }
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(SyncError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
            break response;
        };

        let suggested = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(disposition_filename)
            .unwrap_or_default();

        let mut out = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok(suggested)
    }
}

fn resolve_location(current: &str, location: &str) -> SyncResult<String> {
    let base =
        Url::parse(current).map_err(|err| SyncError::Protocol(format!("bad url: {err}")))?;
    let next = base
        .join(location)
        .map_err(|err| SyncError::Protocol(format!("bad redirect target: {err}")))?;
    Ok(next.to_string())
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_default()
}

fn disposition_filename(value: &str) -> String {
    value
        .split("filename=")
        .nth(1)
        .and_then(|rest| rest.split(';').next())
        .map(|name| name.trim_matches(|c| c == '"' || c == '\'' || c == ' ').to_string())
        .unwrap_or_default()
}
