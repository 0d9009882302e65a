//! Static file server built on the router: resolves files under a www
//! root, stamps mime/caching headers and answers Range requests with
//! zero-copy file chunks.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::trace;

use crate::error::{SuilError, SuilResult};
use crate::http::request::Request;
use crate::http::response::{Chunk, HandlerResult, HttpError, Response};
use crate::http::routing::Router;
use crate::http::status::{Method, Status};

#[derive(Debug, Clone)]
pub struct FileServerConfig {
    /// Directory served as the site root.
    pub root: PathBuf,
    /// File answered for directory URLs.
    pub index_file: String,
    /// Cache-Control max-age in seconds; 0 disables caching headers.
    pub cache_expires: u64,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./www"),
            index_file: "index.html".to_string(),
            cache_expires: 3600,
        }
    }
}

pub struct FileServer {
    root: PathBuf,
    config: FileServerConfig,
}

impl FileServer {
    /// Register static-asset routes on the router: `/` for the index
    /// and `/<path>` for everything else.
    pub fn attach(router: &mut Router, config: FileServerConfig) -> SuilResult<()> {
        let root = config
            .root
            .canonicalize()
            .map_err(|e| SuilError::Other(format!("www root {:?}: {e}", config.root)))?;
        let server = Arc::new(FileServer { root, config });

        let index = server.clone();
        router
            .add(&[Method::Get, Method::Head], "/", move |req, resp| {
                let name = index.config.index_file.clone();
                index.serve_path(req, resp, &name)
            })
            .attrs
            .is_static = true;

        let files = server.clone();
        router
            .add(&[Method::Get, Method::Head], "/<path>", move |req, resp| {
                let rel = req
                    .params
                    .string(0)
                    .map(str::to_string)
                    .ok_or_else(|| HttpError::not_found("no such file"))?;
                files.serve_path(req, resp, &rel)
            })
            .attrs
            .is_static = true;

        Ok(())
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf, HttpError> {
        let rel_path = Path::new(rel);
        if rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
        {
            return Err(HttpError::forbidden("path escapes the www root"));
        }
        let mut full = self.root.join(rel_path);
        if full.is_dir() {
            full.push(&self.config.index_file);
        }
        if !full.is_file() {
            return Err(HttpError::not_found(format!("no such file: {rel}")));
        }
        Ok(full)
    }

    fn serve_path(&self, req: &mut Request, resp: &mut Response, rel: &str) -> HandlerResult {
        let full = self.resolve(rel)?;
        let file = File::open(&full)
            .map_err(|e| HttpError::not_found(format!("opening {rel} failed: {e}")))?;
        let meta = file
            .metadata()
            .map_err(|e| HttpError::internal(e.to_string()))?;
        let total = meta.len();
        let modified = meta.modified().ok();

        let mime = mime_guess::from_path(&full).first_or_octet_stream();
        let allow_range = range_allowed(mime.essence_str());
        resp.header("Content-Type", mime.essence_str());
        resp.header("Accept-Ranges", if allow_range { "bytes" } else { "none" });

        if let Some(modified) = modified {
            resp.header("Last-Modified", httpdate::fmt_http_date(modified));
            if self.config.cache_expires > 0 {
                resp.header(
                    "Cache-Control",
                    format!("public, max-age={}", self.config.cache_expires),
                );
            }
            if let Some(since) = req.header("If-Modified-Since") {
                if let Ok(since) = httpdate::parse_http_date(since) {
                    if not_modified_since(modified, since) {
                        resp.end(Status::NotModified);
                        return Ok(());
                    }
                }
            }
        }

        if allow_range {
            if let Some(range) = req.header("Range").map(str::to_string) {
                return self.serve_range(resp, file, total, &range);
            }
        }

        trace!(path = %full.display(), total, "serving static file");
        resp.chunk(Chunk::file(file, 0, total as usize));
        resp.end(Status::Ok);
        Ok(())
    }

    fn serve_range(
        &self,
        resp: &mut Response,
        file: File,
        total: u64,
        range: &str,
    ) -> HandlerResult {
        match parse_range(range, total) {
            RangeSpec::Single { start, end } => {
                resp.header(
                    "Content-Range",
                    format!("bytes {start}-{end}/{total}"),
                );
                resp.chunk(Chunk::file(file, start, (end - start + 1) as usize));
                resp.end(Status::PartialContent);
                Ok(())
            }
            // multipart/byteranges is not supported.
            RangeSpec::Multiple => Err(HttpError::new(
                Status::NotAcceptable,
                "multi-range requests are not supported",
            )),
            RangeSpec::Invalid => {
                resp.header("Content-Range", format!("bytes */{total}"));
                Err(HttpError::new(
                    Status::RequestRangeInvalid,
                    "requested range is out of bounds",
                ))
            }
        }
    }
}

/// Markup is served whole; range requests make sense for media and
/// binary assets.
fn range_allowed(mime: &str) -> bool {
    !matches!(mime, "text/html" | "application/xhtml+xml")
}

fn not_modified_since(modified: SystemTime, since: SystemTime) -> bool {
    // HTTP dates have second precision; truncate before comparing.
    match (
        modified.duration_since(SystemTime::UNIX_EPOCH),
        since.duration_since(SystemTime::UNIX_EPOCH),
    ) {
        (Ok(m), Ok(s)) => m.as_secs() <= s.as_secs(),
        _ => false,
    }
}

#[derive(Debug, PartialEq)]
enum RangeSpec {
    Single { start: u64, end: u64 },
    Multiple,
    Invalid,
}

/// Parse a `Range: bytes=a-b` header against a resource of `total`
/// bytes. `a-` runs to the end, `-n` means the last n bytes.
fn parse_range(value: &str, total: u64) -> RangeSpec {
    let Some(ranges) = value.trim().strip_prefix("bytes=") else {
        return RangeSpec::Invalid;
    };
    if ranges.contains(',') {
        return RangeSpec::Multiple;
    }
    let Some((from, to)) = ranges.split_once('-') else {
        return RangeSpec::Invalid;
    };
    let from = from.trim();
    let to = to.trim();

    if from.is_empty() {
        // Suffix form: last n bytes.
        let Ok(n) = to.parse::<u64>() else {
            return RangeSpec::Invalid;
        };
        if n == 0 || n > total {
            return RangeSpec::Invalid;
        }
        return RangeSpec::Single {
            start: total - n,
            end: total - 1,
        };
    }

    let Ok(start) = from.parse::<u64>() else {
        return RangeSpec::Invalid;
    };
    let end = if to.is_empty() {
        total.saturating_sub(1)
    } else {
        match to.parse::<u64>() {
            Ok(end) => end,
            Err(_) => return RangeSpec::Invalid,
        }
    };

    if start > end || start >= total || end >= total {
        return RangeSpec::Invalid;
    }
    RangeSpec::Single { start, end }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_range_parses() {
        assert_eq!(
            parse_range("bytes=100-199", 1000),
            RangeSpec::Single {
                start: 100,
                end: 199
            }
        );
        assert_eq!(
            parse_range("bytes=0-0", 1),
            RangeSpec::Single { start: 0, end: 0 }
        );
    }

    #[test]
    fn open_and_suffix_forms() {
        assert_eq!(
            parse_range("bytes=900-", 1000),
            RangeSpec::Single {
                start: 900,
                end: 999
            }
        );
        assert_eq!(
            parse_range("bytes=-100", 1000),
            RangeSpec::Single {
                start: 900,
                end: 999
            }
        );
    }

    #[test]
    fn multi_range_is_flagged() {
        assert_eq!(parse_range("bytes=0-1,5-9", 1000), RangeSpec::Multiple);
    }

    #[test]
    fn out_of_bounds_is_invalid() {
        assert_eq!(parse_range("bytes=1000-1100", 1000), RangeSpec::Invalid);
        assert_eq!(parse_range("bytes=5-4", 1000), RangeSpec::Invalid);
        assert_eq!(parse_range("bytes=-0", 1000), RangeSpec::Invalid);
        assert_eq!(parse_range("chunks=1-2", 1000), RangeSpec::Invalid);
    }
}
