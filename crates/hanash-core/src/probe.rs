//! URL probe - one-shot fetch of the resource's metadata
//!
//! The probe issues a GET and reads only the response head: final URL after
//! redirects, status code, size, MIME type, file name, and whether the
//! server accepts range requests. The body is never consumed.

use crate::error::HanashError;
use reqwest::Client;
use std::time::Duration;
use tracing::info;

/// Product string sent with every request.
pub const USER_AGENT: &str = "Hanash Download Manager";

/// Redirect hops followed per request.
const MAX_REDIRECTS: usize = 10;

/// Connection phase timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata extracted from a probe response.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    /// URL as submitted.
    pub url: String,
    /// URL after following redirects.
    pub eff_url: String,
    /// HTTP status code of the final response.
    pub status: u16,
    /// Sanitized file name.
    pub name: String,
    /// Size in bytes; 0 means unknown.
    pub size: u64,
    /// MIME type with parameters stripped.
    pub mime_type: String,
    /// `accept-ranges` advertised and not "none".
    pub resumable: bool,
}

/// Status codes on which a driver must refuse to start the download.
pub fn is_bad_status(code: u16) -> bool {
    matches!(code, 400..=403 | 405..=417 | 500..=505)
}

/// Build the HTTP client shared by the probe and all workers. Certificate
/// validation uses the trust roots bundled with the binary.
pub fn build_client() -> Result<Client, HanashError> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

/// Probe a URL for metadata. The request is a plain GET whose body is
/// dropped unread, which closes the connection after the head arrives.
pub async fn probe_url(client: &Client, url: &str) -> Result<ProbeInfo, HanashError> {
    url::Url::parse(url).map_err(|_| HanashError::InvalidUrl(url.to_string()))?;

    info!("probing {}", url);
    let response = client.get(url).send().await?;

    let status = response.status().as_u16();
    let eff_url = response.url().to_string();

    let size = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(';').next().unwrap_or("").trim().to_string())
        .unwrap_or_default();

    let resumable = response
        .headers()
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|s| s != "none")
        .unwrap_or(false);

    let raw_name = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_file_name)
        .unwrap_or_else(|| file_name_from_url(url));

    let name = ensure_extension(sanitize_file_name(&raw_name), &mime_type);

    info!(
        "probe {}: status {}, size {}, type {}, resumable {}",
        url, status, size, mime_type, resumable
    );

    Ok(ProbeInfo {
        url: url.to_string(),
        eff_url,
        status,
        name,
        size,
        mime_type,
        resumable,
    })
}

/// Extract the file name from a `content-disposition` header value.
fn disposition_file_name(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("filename=")
            .map(|n| n.trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|n| !n.is_empty())
    })
}

/// Last path component of the URL with the query string stripped.
fn file_name_from_url(url: &str) -> String {
    let clean = url.split('?').next().unwrap_or(url);
    let name = clean.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "download".to_string()
    } else {
        name.to_string()
    }
}

/// Replace characters unsafe in file names with `_`, keep only code points
/// in the basic multilingual plane, and cap the length at 100 code points.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| (*c as u32) <= 0xFFFF)
        .take(100)
        .map(|c| match c {
            '\\' | '/' | ':' | '?' | '<' | '>' | '"' | '|' | '*' => '_',
            c => c,
        })
        .collect()
}

/// Append an extension guessed from the MIME type when the name has none.
fn ensure_extension(name: String, mime_type: &str) -> String {
    if mime_type.is_empty() || mime_guess::from_path(&name).first().is_some() {
        return name;
    }
    match mime_guess::get_mime_extensions_str(mime_type).and_then(|exts| exts.first()) {
        Some(ext) => format!("{name}.{ext}"),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn bad_status_bounds() {
        for code in [400, 403, 405, 416, 417, 500, 505] {
            assert!(is_bad_status(code), "{code} should be bad");
        }
        for code in [200, 206, 301, 404, 418, 429, 506] {
            assert!(!is_bad_status(code), "{code} should not be bad");
        }
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_file_name(r#"a\b/c:d?e<f>g"h|i*j"#), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn sanitize_drops_non_bmp_and_caps_length() {
        assert_eq!(sanitize_file_name("clip🎬.mp4"), "clip.mp4");
        let long = "x".repeat(300);
        assert_eq!(sanitize_file_name(&long).chars().count(), 100);
    }

    #[test]
    fn disposition_parsing() {
        assert_eq!(
            disposition_file_name(r#"attachment; filename="report v1.bin""#),
            Some("report v1.bin".to_string())
        );
        assert_eq!(disposition_file_name("inline"), None);
    }

    #[test]
    fn url_fallback_strips_query() {
        assert_eq!(
            file_name_from_url("http://host/a/b/archive.tar.gz?token=abc"),
            "archive.tar.gz"
        );
        assert_eq!(file_name_from_url("http://host/"), "download");
    }

    #[test]
    fn extension_guessed_from_mime() {
        assert_eq!(ensure_extension("video".into(), "video/mp4"), "video.mp4");
        assert_eq!(ensure_extension("video.mp4".into(), "video/mp4"), "video.mp4");
        assert_eq!(ensure_extension("blob".into(), ""), "blob");
    }

    #[tokio::test]
    async fn probe_reads_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/report.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("accept-ranges", "bytes")
                    .insert_header("content-disposition", r#"attachment; filename="report v1.bin""#)
                    .set_body_raw(vec![0u8; 2048], "application/octet-stream; charset=binary"),
            )
            .mount(&server)
            .await;

        let client = build_client().unwrap();
        let info = probe_url(&client, &format!("{}/files/report.bin", server.uri()))
            .await
            .unwrap();

        assert_eq!(info.status, 200);
        assert_eq!(info.size, 2048);
        assert_eq!(info.mime_type, "application/octet-stream");
        assert!(info.resumable);
        assert_eq!(info.name, "report v1.bin");
    }

    #[tokio::test]
    async fn probe_falls_back_to_url_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/report.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"body".to_vec()))
            .mount(&server)
            .await;

        let client = build_client().unwrap();
        let info = probe_url(&client, &format!("{}/data/report.pdf?session=1", server.uri()))
            .await
            .unwrap();

        assert_eq!(info.name, "report.pdf");
        assert!(!info.resumable);
    }
}
