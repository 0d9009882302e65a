//! HTTP request: header map, lazily parsed cookies and query
//! parameters, typed route parameters and the body store, which spills
//! to disk once Content-Length crosses the configured threshold.

use std::any::Any;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::config::HttpConfig;
use crate::error::{SuilError, SuilResult};
use crate::http::cookie::parse_cookie_header;
use crate::http::parser::{HeadersMeta, ParseError, ParserCallbacks};
use crate::http::routing::RouteParams;
use crate::http::status::{Method, Status};

/// Case-insensitive, insertion-ordered header map.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace any existing value for `name`, or append.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        for (k, v) in self.entries.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value.into();
                return;
            }
        }
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Body spilled to disk. The temp file is unlinked when the request is
/// dropped, and eagerly if an offload write fails.
struct OffloadFile {
    file: File,
    path: PathBuf,
    len: usize,
}

static OFFLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

impl OffloadFile {
    fn create(dir: &Path) -> SuilResult<Self> {
        fs::create_dir_all(dir)?;
        let seq = OFFLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let path = dir.join(format!("body.{}.{}.{}", std::process::id(), nanos, seq));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        trace!(path = %path.display(), "created body offload file");
        Ok(Self { file, path, len: 0 })
    }
}

impl Drop for OffloadFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "removing offload file failed: {e}");
        }
    }
}

enum BodyStore {
    Empty,
    Mem(Vec<u8>),
    Offload(OffloadFile),
}

/// One file field extracted from a multipart body. Data is a range
/// into the request's body buffer, not a copy.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub filename: String,
    pub mime: Option<String>,
    range: Range<usize>,
}

#[derive(Default)]
pub struct Form {
    fields: Vec<(String, String)>,
    files: Vec<UploadedFile>,
}

pub struct Request {
    pub method: Method,
    pub version: (u8, u8),
    pub headers: HeaderMap,
    pub params: RouteParams,
    url: String,
    path: String,
    query_raw: Option<String>,
    cookies: Option<Vec<(String, String)>>,
    query: Option<Vec<(String, String)>>,
    body: BodyStore,
    body_cache: Option<Vec<u8>>,
    read_pos: usize,
    content_length: usize,
    form: Option<Form>,
    complete: bool,
    mw_contexts: Vec<Box<dyn Any>>,
    worker: Option<crate::worker::WorkerContext>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::Unknown,
            version: (1, 1),
            headers: HeaderMap::new(),
            params: RouteParams::new(),
            url: String::new(),
            path: String::new(),
            query_raw: None,
            cookies: None,
            query: None,
            body: BodyStore::Empty,
            body_cache: None,
            read_pos: 0,
            content_length: 0,
            form: None,
            complete: false,
            mw_contexts: Vec::new(),
            worker: None,
        }
    }

    /// The raw request target as received, query string included.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The percent-decoded path component.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn cookie(&mut self, name: &str) -> Option<&str> {
        if self.cookies.is_none() {
            let parsed = self
                .headers
                .get("Cookie")
                .map(parse_cookie_header)
                .unwrap_or_default();
            self.cookies = Some(parsed);
        }
        self.cookies
            .as_ref()
            .unwrap()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn parse_query(&mut self) {
        if self.query.is_some() {
            return;
        }
        let mut out = Vec::new();
        if let Some(raw) = &self.query_raw {
            for pair in raw.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (k, v) = match pair.find('=') {
                    Some(eq) => (&pair[..eq], &pair[eq + 1..]),
                    None => (pair, ""),
                };
                let k = decode_url_component(k.as_bytes()).unwrap_or_else(|| k.to_string());
                let v = decode_url_component(v.as_bytes()).unwrap_or_else(|| v.to_string());
                out.push((k, v));
            }
        }
        self.query = Some(out);
    }

    pub fn query_str(&mut self, name: &str) -> Option<&str> {
        self.parse_query();
        self.query
            .as_ref()
            .unwrap()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Typed query parameter lookup.
    pub fn query<T: FromStr>(&mut self, name: &str) -> Option<T> {
        self.query_str(name).and_then(|v| v.parse().ok())
    }

    /// Copy out the next bytes of the body; the body is consumed
    /// sequentially and reads past the end return 0. Offloaded bodies
    /// can be rewound with [`body_seek`](Self::body_seek).
    pub fn read_body(&mut self, buf: &mut [u8]) -> SuilResult<usize> {
        match &mut self.body {
            BodyStore::Empty => Ok(0),
            BodyStore::Mem(data) => {
                let left = data.len().saturating_sub(self.read_pos);
                let n = left.min(buf.len());
                buf[..n].copy_from_slice(&data[self.read_pos..self.read_pos + n]);
                self.read_pos += n;
                Ok(n)
            }
            BodyStore::Offload(off) => {
                off.file.seek(SeekFrom::Start(self.read_pos as u64))?;
                let n = off.file.read(buf)?;
                self.read_pos += n;
                Ok(n)
            }
        }
    }

    /// Rewind the body read cursor.
    pub fn body_seek(&mut self, pos: usize) {
        self.read_pos = pos;
    }

    /// The whole body as one slice. An offloaded body is materialized
    /// into memory on first use.
    pub fn body_bytes(&mut self) -> SuilResult<&[u8]> {
        match &mut self.body {
            BodyStore::Empty => Ok(&[]),
            BodyStore::Mem(data) => Ok(data.as_slice()),
            BodyStore::Offload(off) => {
                if self.body_cache.is_none() {
                    let mut data = Vec::with_capacity(off.len);
                    off.file.seek(SeekFrom::Start(0))?;
                    off.file.read_to_end(&mut data)?;
                    self.body_cache = Some(data);
                }
                Ok(self.body_cache.as_ref().unwrap().as_slice())
            }
        }
    }

    /// Whether the body was spilled to disk.
    pub fn body_offloaded(&self) -> bool {
        matches!(self.body, BodyStore::Offload(_))
    }

    /// Deserialize the body as JSON.
    pub fn to_json<T: DeserializeOwned>(&mut self) -> SuilResult<T> {
        let bytes = self.body_bytes()?;
        serde_json::from_slice(bytes).map_err(|e| SuilError::proto(format!("invalid json: {e}")))
    }

    /// Parse an `application/x-www-form-urlencoded` or
    /// `multipart/form-data` body into form fields and uploaded files.
    pub fn parse_form(&mut self) -> SuilResult<()> {
        if self.form.is_some() {
            return Ok(());
        }
        let content_type = self
            .headers
            .get("Content-Type")
            .unwrap_or_default()
            .to_string();

        let form = if content_type.starts_with("application/x-www-form-urlencoded") {
            let bytes = self.body_bytes()?.to_vec();
            let mut form = Form::default();
            for pair in bytes.split(|b| *b == b'&') {
                if pair.is_empty() {
                    continue;
                }
                let eq = pair.iter().position(|b| *b == b'=').unwrap_or(pair.len());
                let name = decode_form_component(&pair[..eq])
                    .ok_or_else(|| SuilError::proto("bad urlencoded field name"))?;
                let value = if eq < pair.len() {
                    decode_form_component(&pair[eq + 1..])
                        .ok_or_else(|| SuilError::proto("bad urlencoded field value"))?
                } else {
                    String::new()
                };
                form.fields.push((name, value));
            }
            form
        } else if content_type.starts_with("multipart/form-data") {
            let boundary = content_type
                .split(';')
                .map(str::trim)
                .find_map(|p| p.strip_prefix("boundary="))
                .map(|b| b.trim_matches('"').to_string())
                .ok_or_else(|| SuilError::proto("multipart body without boundary"))?;
            let body = self.body_bytes()?;
            parse_multipart(body, &boundary)?
        } else {
            return Err(SuilError::proto(format!(
                "cannot parse form from content type '{content_type}'"
            )));
        };

        self.form = Some(form);
        Ok(())
    }

    pub fn form_field(&self, name: &str) -> Option<&str> {
        self.form
            .as_ref()?
            .fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn uploaded_file(&self, name: &str) -> Option<&UploadedFile> {
        self.form.as_ref()?.files.iter().find(|f| f.name == name)
    }

    pub fn uploaded_files(&self) -> impl Iterator<Item = &UploadedFile> {
        self.form.iter().flat_map(|f| f.files.iter())
    }

    /// The raw bytes of an uploaded file, sliced out of the body.
    pub fn file_data(&mut self, file: &UploadedFile) -> SuilResult<&[u8]> {
        let range = file.range.clone();
        let body = self.body_bytes()?;
        body.get(range)
            .ok_or_else(|| SuilError::proto("uploaded file range out of bounds"))
    }

    /// Write an uploaded file into `dir` under its client filename.
    pub fn save_file(&mut self, file: &UploadedFile, dir: &Path) -> SuilResult<PathBuf> {
        let name = Path::new(&file.filename)
            .file_name()
            .ok_or_else(|| SuilError::proto("uploaded file has no usable name"))?;
        let dest = dir.join(name);
        let data = self.file_data(file)?;
        let mut out = File::create(&dest)?;
        out.write_all(data)?;
        Ok(dest)
    }

    pub(crate) fn set_worker(&mut self, ctx: crate::worker::WorkerContext) {
        self.worker = Some(ctx);
    }

    /// The worker serving this request.
    pub fn worker(&self) -> Option<&crate::worker::WorkerContext> {
        self.worker.as_ref()
    }

    /// Install the per-request middleware context slots.
    pub(crate) fn install_contexts(&mut self, slots: Vec<Box<dyn Any>>) {
        self.mw_contexts = slots;
    }

    pub(crate) fn drop_contexts(&mut self) {
        self.mw_contexts.clear();
    }

    /// Borrow a middleware context by its concrete type. Middlewares
    /// and handlers both read contexts this way; a middleware can see
    /// contexts of middlewares declared before it.
    pub fn context<T: 'static>(&self) -> Option<&T> {
        self.mw_contexts.iter().find_map(|c| c.downcast_ref::<T>())
    }

    pub fn context_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.mw_contexts
            .iter_mut()
            .find_map(|c| c.downcast_mut::<T>())
    }

    /// Connection keep-alive decision from the request side.
    pub fn wants_keep_alive(&self) -> bool {
        match self.headers.get("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version != (1, 0),
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// Parser sink that builds a `Request`, enforcing the body-size policy
/// and redirecting large bodies to disk.
pub struct RequestBuilder<'a> {
    pub req: &'a mut Request,
    pub config: &'a HttpConfig,
    /// Status to answer with when the sink aborted the parse.
    pub reject: Option<Status>,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(req: &'a mut Request, config: &'a HttpConfig) -> Self {
        Self {
            req,
            config,
            reject: None,
        }
    }

    fn abort(&mut self, status: Status) -> ParseError {
        self.reject = Some(status);
        ParseError::Aborted
    }
}

impl<'a> ParserCallbacks for RequestBuilder<'a> {
    fn on_url(&mut self, url: &[u8]) -> Result<(), ParseError> {
        let raw = match std::str::from_utf8(url) {
            Ok(s) => s,
            Err(_) => return Err(self.abort(Status::BadRequest)),
        };
        self.req.url.push_str(raw);
        let (path, query) = match raw.find('?') {
            Some(q) => (&raw[..q], Some(&raw[q + 1..])),
            None => (raw, None),
        };
        match decode_url_component(path.as_bytes()) {
            Some(decoded) => self.req.path = decoded,
            None => return Err(self.abort(Status::BadRequest)),
        }
        self.req.query_raw = query.map(str::to_string);
        Ok(())
    }

    fn on_header(&mut self, field: &[u8], value: &[u8]) -> Result<(), ParseError> {
        let field = String::from_utf8_lossy(field).into_owned();
        let value = String::from_utf8_lossy(value).into_owned();
        self.req.headers.append(field, value);
        Ok(())
    }

    fn on_headers_complete(&mut self, meta: &HeadersMeta) -> Result<(), ParseError> {
        self.req.method = meta.method;
        self.req.version = meta.version;
        let len = meta.content_length.unwrap_or(0);
        self.req.content_length = len;

        if len > self.config.max_body_len {
            return Err(self.abort(Status::RequestEntityTooLarge));
        }

        if len > 0 {
            if self.config.disk_offload && len >= self.config.disk_offload_min {
                match OffloadFile::create(&self.config.offload_path) {
                    Ok(off) => self.req.body = BodyStore::Offload(off),
                    Err(e) => {
                        debug!("creating offload file failed: {e}");
                        return Err(self.abort(Status::InternalError));
                    }
                }
            } else {
                self.req.body = BodyStore::Mem(Vec::with_capacity(len));
            }
        } else if meta.chunked {
            self.req.body = BodyStore::Mem(Vec::new());
        }
        Ok(())
    }

    fn on_body_part(&mut self, data: &[u8]) -> Result<(), ParseError> {
        match &mut self.req.body {
            BodyStore::Empty => {
                self.req.body = BodyStore::Mem(data.to_vec());
            }
            BodyStore::Mem(buf) => {
                if buf.len() + data.len() > self.config.max_body_len {
                    return Err(self.abort(Status::RequestEntityTooLarge));
                }
                buf.extend_from_slice(data);
            }
            BodyStore::Offload(off) => {
                if let Err(e) = off.file.write_all(data) {
                    debug!("offload write failed: {e}");
                    // Drop removes the file right away.
                    self.req.body = BodyStore::Empty;
                    return Err(self.abort(Status::InternalError));
                }
                off.len += data.len();
            }
        }
        Ok(())
    }

    fn on_message_complete(&mut self) -> Result<(), ParseError> {
        self.req.complete = true;
        Ok(())
    }
}

/// Percent-decode a URL path or query component. Returns None on a
/// truncated or non-UTF-8 escape.
pub fn decode_url_component(bytes: &[u8]) -> Option<String> {
    percent_decode(bytes, false)
}

/// Like URL decoding, plus `+` means space (form encoding).
fn decode_form_component(bytes: &[u8]) -> Option<String> {
    percent_decode(bytes, true)
}

fn percent_decode(bytes: &[u8], plus_is_space: bool) -> Option<String> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' if plus_is_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Multipart/form-data parser. Works in place over the received body:
/// fields are decoded, file payloads stay as ranges into the buffer.
fn parse_multipart(body: &[u8], boundary: &str) -> SuilResult<Form> {
    let mut marker = Vec::with_capacity(boundary.len() + 2);
    marker.extend_from_slice(b"--");
    marker.extend_from_slice(boundary.as_bytes());

    let mut form = Form::default();
    let mut pos = find(body, 0, &marker).ok_or_else(|| SuilError::proto("missing boundary"))?;

    loop {
        pos += marker.len();
        // Closing marker: --boundary--
        if body[pos..].starts_with(b"--") {
            break;
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let header_end =
            find(body, pos, b"\r\n\r\n").ok_or_else(|| SuilError::proto("truncated part"))?;
        let headers = &body[pos..header_end];
        let data_start = header_end + 4;

        let next = find(body, data_start, &marker)
            .ok_or_else(|| SuilError::proto("unterminated part"))?;
        let mut data_end = next;
        if data_end >= 2 && &body[data_end - 2..data_end] == b"\r\n" {
            data_end -= 2;
        }

        let (name, filename, mime) = parse_part_headers(headers);
        let name = name.ok_or_else(|| SuilError::proto("part without a field name"))?;
        match filename {
            Some(filename) => form.files.push(UploadedFile {
                name,
                filename,
                mime,
                range: data_start..data_end,
            }),
            None => {
                let value = String::from_utf8_lossy(&body[data_start..data_end]).into_owned();
                form.fields.push((name, value));
            }
        }

        pos = next;
    }

    Ok(form)
}

fn parse_part_headers(headers: &[u8]) -> (Option<String>, Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    let mut mime = None;

    let Ok(text) = std::str::from_utf8(headers) else {
        return (None, None, None);
    };
    for line in text.split("\r\n") {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("content-disposition:") {
            name = quoted_attr(line, "name=\"");
            filename = quoted_attr(line, "filename=\"");
        } else if lower.starts_with("content-type:") {
            mime = Some(line[13..].trim().to_string());
        }
    }
    (name, filename, mime)
}

fn quoted_attr(line: &str, prefix: &str) -> Option<String> {
    let idx = line.find(prefix)?;
    let rest = &line[idx + prefix.len()..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn find(data: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > data.len() {
        return None;
    }
    data[from..]
        .windows(needle.len().max(1))
        .position(|w| w == needle)
        .map(|p| p + from)
}
