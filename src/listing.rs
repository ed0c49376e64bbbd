//! Drive folder listing: produces the URL list the ingestion run consumes.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::ingest::source::view_url;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILES_ENDPOINT: &str = "https://www.googleapis.com/drive/v3/files";

#[derive(Error, Debug)]
pub enum ListingError {
    #[error("Missing access token (set GOOGLE_DRIVE_TOKEN)")]
    MissingToken,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Drive API rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// One page of a folder's direct children.
#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FilePage, ListingError>;
}

/// Drive v3 `files.list` with a caller-supplied bearer token.
pub struct HttpDriveApi {
    client: reqwest::Client,
    token: String,
}

impl HttpDriveApi {
    pub fn new(token: impl Into<String>) -> Result<Self, ListingError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ListingError::MissingToken);
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            token: token.trim().to_string(),
        })
    }

    pub fn from_env() -> Result<Self, ListingError> {
        let token = std::env::var("GOOGLE_DRIVE_TOKEN").map_err(|_| ListingError::MissingToken)?;
        Self::new(token)
    }
}

/// Escape a folder id for use inside a Drive query string literal.
fn escape_query_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl DriveApi for HttpDriveApi {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FilePage, ListingError> {
        let q = format!(
            "'{}' in parents and trashed=false",
            escape_query_literal(folder_id)
        );
        let mut params = vec![
            ("q", q),
            ("spaces", "drive".to_string()),
            (
                "fields",
                "nextPageToken, files(id, name, mimeType)".to_string(),
            ),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response = self
            .client
            .get(FILES_ENDPOINT)
            .bearer_auth(&self.token)
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ListingError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Every image under `root_folder`, sub-folders included. Folders are walked
/// breadth-first from an explicit queue; each folder is visited once.
pub async fn list_images(
    api: &dyn DriveApi,
    root_folder: &str,
) -> Result<Vec<DriveFile>, ListingError> {
    let mut queue = VecDeque::from([root_folder.to_string()]);
    let mut visited = HashSet::new();
    let mut images = Vec::new();

    while let Some(folder) = queue.pop_front() {
        if !visited.insert(folder.clone()) {
            continue;
        }

        let mut page_token: Option<String> = None;
        loop {
            let page = api.list_children(&folder, page_token.as_deref()).await?;
            for file in page.files {
                if file.mime_type == FOLDER_MIME {
                    queue.push_back(file.id);
                } else if file.mime_type.starts_with("image/") {
                    images.push(file);
                }
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        tracing::debug!(
            "Listing: folder {} done, {} images so far, {} folders queued",
            folder,
            images.len(),
            queue.len()
        );
    }

    Ok(images)
}

/// Write one share link per line. Returns the number of links written.
pub fn write_url_list(path: &Path, files: &[DriveFile]) -> Result<usize, ListingError> {
    let mut out = String::with_capacity(files.len() * 64);
    for file in files {
        out.push_str(&view_url(&file.id));
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::ingest::source::parse_url_list;

    fn file(id: &str, mime: &str) -> DriveFile {
        DriveFile {
            id: id.into(),
            name: format!("{}.bin", id),
            mime_type: mime.into(),
        }
    }

    /// Pages keyed by (folder, page token).
    #[derive(Default)]
    struct FakeDrive {
        pages: HashMap<(String, Option<String>), FilePage>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeDrive {
        fn page(mut self, folder: &str, token: Option<&str>, files: Vec<DriveFile>, next: Option<&str>) -> Self {
            self.pages.insert(
                (folder.to_string(), token.map(str::to_string)),
                FilePage {
                    files,
                    next_page_token: next.map(str::to_string),
                },
            );
            self
        }
    }

    #[async_trait]
    impl DriveApi for FakeDrive {
        async fn list_children(
            &self,
            folder_id: &str,
            page_token: Option<&str>,
        ) -> Result<FilePage, ListingError> {
            self.calls.lock().unwrap().push(folder_id.to_string());
            Ok(self
                .pages
                .get(&(folder_id.to_string(), page_token.map(str::to_string)))
                .cloned()
                .unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_walks_subfolders_and_pages() {
        let drive = FakeDrive::default()
            .page(
                "root",
                None,
                vec![file("a", "image/jpeg"), file("sub", FOLDER_MIME), file("doc", "application/pdf")],
                Some("p2"),
            )
            .page("root", Some("p2"), vec![file("b", "image/png")], None)
            .page("sub", None, vec![file("c", "image/heic"), file("deeper", FOLDER_MIME)], None)
            .page("deeper", None, vec![file("d", "image/jpeg")], None);

        let images = list_images(&drive, "root").await.unwrap();
        let ids: Vec<_> = images.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_folder_cycle_visited_once() {
        let drive = FakeDrive::default()
            .page("x", None, vec![file("y", FOLDER_MIME), file("i1", "image/jpeg")], None)
            .page("y", None, vec![file("x", FOLDER_MIME)], None);

        let images = list_images(&drive, "x").await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(drive.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_written_list_feeds_ingestion() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("urls.txt");
        let n = write_url_list(&path, &[file("a1", "image/jpeg"), file("b2", "image/png")]).unwrap();
        assert_eq!(n, 2);

        let items = parse_url_list(&std::fs::read_to_string(&path).unwrap());
        let ids: Vec<_> = items.iter().map(|i| i.drive_id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a1", "b2"]);
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(HttpDriveApi::new("  "), Err(ListingError::MissingToken)));
    }

    #[test]
    fn test_query_literal_escaping() {
        assert_eq!(escape_query_literal("ab'c"), "ab\\'c");
    }

    #[test]
    fn test_page_deserializes_camel_case() {
        let page: FilePage = serde_json::from_str(
            r#"{"nextPageToken": "t", "files": [{"id": "1", "name": "x.jpg", "mimeType": "image/jpeg"}]}"#,
        )
        .unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("t"));
        assert_eq!(page.files[0].mime_type, "image/jpeg");
    }
}
