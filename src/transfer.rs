//! File upload and download glue on top of the one-shot request path.
//!
//! Thin byte-stream helpers, outside the pooled core: uploads frame a
//! single multipart part, downloads copy the buffered body into a
//! writer or file.

use std::io::{Read, Write};
use std::path::Path;

use bytes::Bytes;
use rand::Rng;
use tracing::warn;

use crate::error::Error;
use crate::request::RequestBuilder;
use crate::response::Response;

/// Uploads a local file as a single `multipart/form-data` part.
pub fn upload_file(url: &str, field_name: &str, path: &Path) -> crate::Result<Response> {
    let file = std::fs::File::open(path).map_err(|source| Error::File {
        path: path.display().to_string(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_owned());
    upload_reader(url, field_name, &file_name, file)
}

/// Uploads bytes from a reader as a single `multipart/form-data` part.
pub fn upload_reader<R>(
    url: &str,
    field_name: &str,
    file_name: &str,
    mut reader: R,
) -> crate::Result<Response>
where
    R: Read,
{
    let mut content = Vec::new();
    reader.read_to_end(&mut content).map_err(|source| Error::File {
        path: file_name.to_owned(),
        source,
    })?;

    let boundary = format!("outcall-{:016x}", rand::rng().random::<u64>());
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{file_name}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(&content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    RequestBuilder::post(url)
        .content_type(format!("multipart/form-data; boundary={boundary}"))
        .body_bytes(Bytes::from(body))
        .build()?
        .send()
}

/// Downloads the url into a writer. A non-success status is logged and
/// returned as an error rather than writing an error page to the sink.
pub fn download_to_writer<W>(url: &str, writer: &mut W) -> crate::Result<u64>
where
    W: Write + ?Sized,
{
    let descriptor = RequestBuilder::get(url).build()?;
    let response = descriptor.send()?;
    if !response.is_success() {
        warn!(
            url = %url,
            status = response.status().as_u16(),
            "download request was not ok"
        );
        return Err(Error::HttpStatus {
            status: response.status().as_u16(),
            method: http::Method::GET,
            url: url.to_owned(),
            body: crate::util::truncate_body(response.body()),
        });
    }

    writer
        .write_all(response.body())
        .and_then(|()| writer.flush())
        .map_err(|source| Error::File {
            path: url.to_owned(),
            source,
        })?;
    Ok(response.body().len() as u64)
}

/// Downloads the url into a local file.
pub fn download_to_file(url: &str, into: &Path) -> crate::Result<u64> {
    let mut file = std::fs::File::create(into).map_err(|source| Error::File {
        path: into.display().to_string(),
        source,
    })?;
    download_to_writer(url, &mut file)
}

/// Downloads the url and returns the decoded body.
pub fn download_string(url: &str) -> crate::Result<String> {
    let descriptor = RequestBuilder::get(url).build()?;
    let response = descriptor.send()?;
    if !response.is_success() {
        warn!(
            url = %url,
            status = response.status().as_u16(),
            "download request was not ok"
        );
        return Err(Error::HttpStatus {
            status: response.status().as_u16(),
            method: http::Method::GET,
            url: url.to_owned(),
            body: crate::util::truncate_body(response.body()),
        });
    }
    Ok(response.text())
}
