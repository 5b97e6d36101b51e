//! Streamed download responses.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use tokio_util::io::ReaderStream;

use super::error::ApiError;
use crate::archive::{Download, ARCHIVE_MIME};
use crate::CumulusError;

/// Generate a safe Content-Disposition header value for file downloads.
///
/// Control characters are dropped and quotes/backslashes replaced in the
/// plain `filename` parameter; anything non-ASCII is also sent RFC 5987
/// encoded in `filename*`.
pub fn content_disposition_header(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '"' | '\\' => '_',
            _ => c,
        })
        .collect();

    if filename.is_ascii() && sanitized == filename {
        return format!("attachment; filename=\"{}\"", filename);
    }

    let encoded = urlencoding::encode(filename);
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitized, encoded
    )
}

/// Build the HTTP response for a prepared download.
///
/// The body is streamed; nothing is buffered beyond the read chunk size.
pub async fn download_response(download: Download) -> Result<Response, ApiError> {
    let response = match download {
        Download::File {
            name, mime, path, ..
        } => {
            let file = tokio::fs::File::open(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CumulusError::FileNotFound(format!("blob of {name}"))
                } else {
                    CumulusError::Io(e)
                }
            })?;
            let len = file.metadata().await.map_err(CumulusError::Io)?.len();

            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime)
                .header(header::CONTENT_DISPOSITION, content_disposition_header(&name))
                .header(header::CONTENT_LENGTH, len)
                .body(Body::from_stream(ReaderStream::new(file)))
        }
        Download::Archive { name, stream } => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, ARCHIVE_MIME)
            .header(header::CONTENT_DISPOSITION, content_disposition_header(&name))
            .body(Body::from_stream(stream)),
    };

    response.map_err(|e| {
        tracing::error!("Failed to build response: {}", e);
        ApiError::internal("Failed to build response")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveEntry, Archiver};
    use crate::web::error::ErrorCode;
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    #[test]
    fn test_content_disposition_ascii() {
        assert_eq!(
            content_disposition_header("report.pdf"),
            "attachment; filename=\"report.pdf\""
        );
    }

    #[test]
    fn test_content_disposition_unicode() {
        let header = content_disposition_header("日本語.txt");
        assert!(header.starts_with("attachment; filename=\"日本語.txt\""));
        assert!(header.contains("filename*=UTF-8''%E6%97%A5%E6%9C%AC%E8%AA%9E.txt"));
    }

    #[test]
    fn test_content_disposition_injection() {
        let header = content_disposition_header("evil\"\r\nSet-Cookie: x.txt");
        assert!(!header.contains('\r'));
        assert!(!header.contains('\n'));
        assert!(header.starts_with("attachment; filename=\"evil_Set-Cookie: x.txt\""));
    }

    #[tokio::test]
    async fn test_file_response() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"file body").unwrap();

        let response = download_response(Download::File {
            name: "notes.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 9,
            path,
        })
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "9");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"notes.txt\""
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"file body");
    }

    #[tokio::test]
    async fn test_file_response_missing_blob() {
        let dir = TempDir::new().unwrap();
        let result = download_response(Download::File {
            name: "gone.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 1,
            path: dir.path().join("gone"),
        })
        .await;

        assert_eq!(result.unwrap_err().code(), ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn test_archive_response_fails_mid_stream() {
        let dir = TempDir::new().unwrap();
        let entries = vec![Ok::<_, CumulusError>(ArchiveEntry::File {
            path: "gone.txt".to_string(),
            source: dir.path().join("gone"),
            size: 1,
            modified: chrono::Utc::now(),
        })];

        let response = download_response(Download::Archive {
            name: "Docs.tar.gz".to_string(),
            stream: Archiver::default().stream(entries.into_iter()),
        })
        .await
        .unwrap();

        assert_eq!(response.headers()[header::CONTENT_TYPE], ARCHIVE_MIME);
        // Headers are already out, so the failure surfaces as a body error
        assert!(response.into_body().collect().await.is_err());
    }
}
