//! Static file routes.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use hyper::header::{self, HeaderValue};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{NetError, Result};
use crate::http::channel::HttpChannel;
use crate::http::server::HttpHandler;

const CHUNK_SIZE: usize = 16 * 1024;

/// Map a request path below `prefix` to a file below `root`.
///
/// Returns `None` for anything that could escape `root`.
pub(crate) fn resolve(root: &Path, prefix: &str, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.strip_prefix(prefix.trim_end_matches('/'))?;
    let relative = relative.split('?').next().unwrap_or_default();
    if !relative.starts_with('/') {
        return None;
    }
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() || relative.contains('\\') {
        return None;
    }

    let mut resolved = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(segment) => resolved.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

pub(crate) fn directory_handler(prefix: String, root: PathBuf) -> HttpHandler {
    let prefix: Arc<str> = prefix.into();
    let root = Arc::new(root);
    Arc::new(move |channel: HttpChannel| -> BoxFuture<'static, Result<()>> {
        let target = resolve(&root, &prefix, channel.path());
        Box::pin(async move {
            match target {
                Some(path) => channel.send_file(&path).await,
                None => Err(NetError::NotFound(channel.path().to_string())),
            }
        })
    })
}

pub(crate) fn file_handler(file: PathBuf) -> HttpHandler {
    let file = Arc::new(file);
    Arc::new(move |channel: HttpChannel| -> BoxFuture<'static, Result<()>> {
        let file = Arc::clone(&file);
        Box::pin(async move { channel.send_file(&file).await })
    })
}

impl HttpChannel {
    /// Stream a file as the response body.
    ///
    /// A missing or unreadable file fails with `NotFound` before anything is
    /// written, so the request can fall through to another route.
    pub async fn send_file(&self, path: &Path) -> Result<()> {
        let not_found = || NetError::NotFound(path.display().to_string());
        let mut file = File::open(path).await.map_err(|_| not_found())?;
        let metadata = file.metadata().await.map_err(|_| not_found())?;
        if !metadata.is_file() {
            return Err(not_found());
        }

        if !self.headers_sent() {
            self.set_header(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()))?;
            self.set_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type(path)),
            )?;
        }
        self.send_headers();

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.send(Bytes::copy_from_slice(&buf[..n])).await?;
        }
        tracing::debug!(request_id = %self.id(), path = %path.display(), bytes = metadata.len(), "Sent file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_the_prefix() {
        let root = Path::new("/srv");
        assert_eq!(
            resolve(root, "/files", "/files/readme.txt"),
            Some(PathBuf::from("/srv/readme.txt"))
        );
        assert_eq!(
            resolve(root, "/files/", "/files/docs/a.html"),
            Some(PathBuf::from("/srv/docs/a.html"))
        );
    }

    #[test]
    fn rejects_traversal() {
        let root = Path::new("/srv");
        assert_eq!(resolve(root, "/files", "/files/../etc/passwd"), None);
        assert_eq!(resolve(root, "/files", "/files/a/../../b"), None);
        assert_eq!(resolve(root, "/files", "/files/..\\b"), None);
        assert_eq!(resolve(root, "/files", "/files/"), None);
        assert_eq!(resolve(root, "/files", "/other/a"), None);
        assert_eq!(resolve(root, "/files", "/filesystem/a"), None);
    }

    #[test]
    fn content_types_follow_the_extension() {
        assert_eq!(content_type(Path::new("a.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
        assert_eq!(content_type(Path::new("noext")), "application/octet-stream");
    }
}
