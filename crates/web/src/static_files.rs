//! Vendored noVNC asset serving

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Serves files from the vendored noVNC directory, if one is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticFiles {
    dir: Option<PathBuf>,
}

impl StaticFiles {
    pub fn new(dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &dir {
            if !dir.is_dir() {
                warn!("noVNC asset directory {} does not exist", dir.display());
            }
        }
        Self { dir }
    }

    pub fn is_configured(&self) -> bool {
        self.dir.is_some()
    }

    /// Serve a file relative to the asset directory
    pub async fn serve(&self, rel: &str) -> Response {
        let Some(dir) = self.dir.as_ref() else {
            return (StatusCode::NOT_FOUND, "noVNC assets not configured").into_response();
        };

        let rel = rel.trim_start_matches('/');
        let requested = dir.join(rel);

        // Canonicalize both sides so `..` and symlinks cannot leave the directory.
        let Ok(canon_dir) = dir.canonicalize() else {
            return (StatusCode::NOT_FOUND, "Not found").into_response();
        };
        let Ok(canon_req) = requested.canonicalize() else {
            return (StatusCode::NOT_FOUND, "Not found").into_response();
        };
        if !canon_req.starts_with(&canon_dir) {
            debug!(path = %rel, "Rejected asset path outside the noVNC directory");
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }

        match tokio::fs::read(&canon_req).await {
            Ok(bytes) => {
                let mime = mime_guess::from_path(&canon_req).first_or_octet_stream();
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, mime.as_ref())],
                    bytes,
                )
                    .into_response()
            }
            Err(_) => (StatusCode::NOT_FOUND, "Not found").into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, StaticFiles) {
        let root = tempfile::tempdir().unwrap();
        let novnc = root.path().join("novnc");
        std::fs::create_dir_all(novnc.join("app/styles")).unwrap();
        std::fs::write(novnc.join("app/ui.js"), "export default {};").unwrap();
        std::fs::write(novnc.join("app/styles/base.css"), "body {}").unwrap();
        std::fs::write(root.path().join("secret.txt"), "outside").unwrap();
        let files = StaticFiles::new(Some(novnc));
        (root, files)
    }

    #[tokio::test]
    async fn test_serves_with_guessed_type() {
        let (_root, files) = fixture();
        let resp = files.serve("app/ui.js").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let ct = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(ct.contains("javascript"), "{}", ct);

        let resp = files.serve("/app/styles/base.css").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/css");
    }

    #[tokio::test]
    async fn test_traversal_is_forbidden() {
        let (_root, files) = fixture();
        assert_eq!(files.serve("../secret.txt").await.status(), StatusCode::FORBIDDEN);
        assert_eq!(files.serve("app/../../secret.txt").await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_and_unconfigured() {
        let (_root, files) = fixture();
        assert!(files.is_configured());
        assert!(!StaticFiles::default().is_configured());
        assert_eq!(files.serve("app/nope.js").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            StaticFiles::default().serve("app/ui.js").await.status(),
            StatusCode::NOT_FOUND
        );
    }
}
