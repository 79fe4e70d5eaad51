//! Package a local source directory as a single-layer OCI image and push it
//! through a registry [`Transport`].

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::{write::GzEncoder, Compression};
use http::{header, Method, Request, Response, StatusCode, Uri};
use metrics::counter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::proxy::{ProxyError, Transport, Wrapper};

/// Repository the local source proxy publishes sources under.
pub const SOURCE_REPOSITORY: &str = "source";
/// Ignore file read from the root of the source directory.
pub const IGNORE_FILE: &str = ".tanzuignore";

const ALWAYS_EXCLUDED: &[&str] = &[".imgpkg"];

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const CONTENT_DIGEST: &str = "Docker-Content-Digest";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Http(#[from] http::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("registry rejected {op}: {status} {body}")]
    Registry { op: &'static str, status: StatusCode, body: String },
    #[error("registry did not return an upload location")]
    MissingLocation,
    #[error("local source proxy did not report a registry repository")]
    MissingRepository,
}

impl SourceError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| SourceError::Io { path: path.to_path_buf(), source }
    }
}

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

/// Paths excluded from the source archive: the ignore file's entries plus `.imgpkg`.
///
/// Lines are trimmed; blank lines and `#` comments are skipped and a trailing
/// `/` is dropped. A missing ignore file is not an error.
pub fn load_exclusions(dir: &Path) -> Result<Vec<String>, SourceError> {
    let mut out: Vec<String> = ALWAYS_EXCLUDED.iter().map(|s| s.to_string()).collect();
    let path = dir.join(IGNORE_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(SourceError::io(&path)(e)),
    };
    for line in raw.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = line.trim_end_matches('/').trim_start_matches("./");
        if !entry.is_empty() && !out.iter().any(|e| e == entry) {
            out.push(entry.to_string());
        }
    }
    Ok(out)
}

fn is_excluded(rel: &str, exclusions: &HashSet<&str>) -> bool {
    let mut prefix = rel;
    loop {
        if exclusions.contains(prefix) {
            return true;
        }
        match prefix.rfind('/') {
            Some(i) => prefix = &prefix[..i],
            None => return false,
        }
    }
}

/// A content-addressed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: String,
    pub data: Vec<u8>,
}

impl Blob {
    fn new(data: Vec<u8>) -> Self {
        Self { digest: sha256_digest(&data), data }
    }
}

/// A single-layer image ready to push.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub config: Blob,
    pub layer: Blob,
    pub manifest: Vec<u8>,
}

impl SourceImage {
    pub fn digest(&self) -> String {
        sha256_digest(&self.manifest)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor<'a> {
    media_type: &'a str,
    digest: &'a str,
    size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    schema_version: u8,
    media_type: &'a str,
    config: Descriptor<'a>,
    layers: Vec<Descriptor<'a>>,
}

/// Archive `dir` into a reproducible gzipped tar and wrap it in an image.
///
/// Entries are sorted and carry no owner or mtime, so the same tree always
/// yields the same digest.
pub fn package(dir: &Path, exclusions: &[String]) -> Result<SourceImage, SourceError> {
    if !dir.is_dir() {
        return Err(SourceError::NotADirectory(dir.to_path_buf()));
    }
    let excluded: HashSet<&str> = exclusions.iter().map(String::as_str).collect();
    let mut ar = tar::Builder::new(Vec::new());
    let mut files = 0usize;

    let walker = WalkDir::new(dir).min_depth(1).sort_by_file_name().into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(dir).map(|p| p.to_string_lossy().replace('\\', "/")).unwrap_or_default();
        !is_excluded(&rel, &excluded)
    });
    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(dir).map(|p| p.to_string_lossy().replace('\\', "/")).unwrap_or_default();
        let meta = entry.metadata()?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            ar.append_data(&mut header, format!("{rel}/"), io::empty()).map_err(SourceError::io(entry.path()))?;
        } else if meta.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if is_executable(&meta) { 0o755 } else { 0o644 });
            header.set_size(meta.len());
            let file = std::fs::File::open(entry.path()).map_err(SourceError::io(entry.path()))?;
            ar.append_data(&mut header, &rel, file).map_err(SourceError::io(entry.path()))?;
            files += 1;
        } else {
            debug!(path = %rel, "skipping special file");
        }
    }
    let tarball = ar.into_inner().map_err(SourceError::io(dir))?;
    let diff_id = sha256_digest(&tarball);

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tarball).map_err(SourceError::io(dir))?;
    let layer = Blob::new(gz.finish().map_err(SourceError::io(dir))?);

    let config = Blob::new(serde_json::to_vec(&serde_json::json!({
        "architecture": "",
        "os": "",
        "config": {},
        "rootfs": { "type": "layers", "diff_ids": [diff_id] },
    }))?);
    let manifest = serde_json::to_vec(&Manifest {
        schema_version: 2,
        media_type: MANIFEST_MEDIA_TYPE,
        config: Descriptor { media_type: CONFIG_MEDIA_TYPE, digest: &config.digest, size: config.data.len() },
        layers: vec![Descriptor { media_type: LAYER_MEDIA_TYPE, digest: &layer.digest, size: layer.data.len() }],
    })?;
    debug!(files, layer = %layer.digest, bytes = layer.data.len(), "source packaged");
    Ok(SourceImage { config, layer, manifest })
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

async fn send<T: Transport + ?Sized>(transport: &T, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, SourceError> {
    debug!(method = %req.method(), uri = %req.uri(), "registry request");
    Ok(transport.round_trip(req).await?)
}

fn expect(op: &'static str, resp: &Response<Vec<u8>>, ok: &[StatusCode]) -> Result<(), SourceError> {
    if ok.contains(&resp.status()) {
        return Ok(());
    }
    Err(SourceError::Registry { op, status: resp.status(), body: String::from_utf8_lossy(resp.body()).trim().to_string() })
}

/// Append `digest=<digest>` to an upload location, keeping only its path and query.
fn upload_target(location: &str, digest: &str) -> Result<String, SourceError> {
    let uri: Uri = location.parse().map_err(ProxyError::from)?;
    let param = url::form_urlencoded::Serializer::new(String::new()).append_pair("digest", digest).finish();
    Ok(match uri.query() {
        Some(q) if !q.is_empty() => format!("{}?{q}&{param}", uri.path()),
        _ => format!("{}?{param}", uri.path()),
    })
}

async fn push_blob<T: Transport + ?Sized>(transport: &T, repo: &str, blob: &Blob) -> Result<(), SourceError> {
    let head = send(transport, Request::head(format!("/v2/{repo}/blobs/{}", blob.digest)).body(Vec::new())?).await?;
    if head.status() == StatusCode::OK {
        debug!(digest = %blob.digest, "blob already present");
        return Ok(());
    }

    let start = send(transport, Request::post(format!("/v2/{repo}/blobs/uploads/")).body(Vec::new())?).await?;
    expect("blob upload start", &start, &[StatusCode::ACCEPTED])?;
    let location = start
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(SourceError::MissingLocation)?;

    let put = Request::builder()
        .method(Method::PUT)
        .uri(upload_target(location, &blob.digest)?)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(blob.data.clone())?;
    let done = send(transport, put).await?;
    expect("blob upload", &done, &[StatusCode::CREATED])?;
    counter!("apps_source_blob_bytes_total", blob.data.len() as u64);
    Ok(())
}

/// Push `image` as `<repo>:<tag>` and return the manifest digest.
pub async fn push<T: Transport + ?Sized>(transport: &T, repo: &str, tag: &str, image: &SourceImage) -> Result<String, SourceError> {
    push_blob(transport, repo, &image.layer).await?;
    push_blob(transport, repo, &image.config).await?;

    let put = Request::builder()
        .method(Method::PUT)
        .uri(format!("/v2/{repo}/manifests/{tag}"))
        .header(header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
        .body(image.manifest.clone())?;
    let resp = send(transport, put).await?;
    expect("manifest upload", &resp, &[StatusCode::CREATED, StatusCode::OK])?;

    let digest = resp
        .headers()
        .get(CONTENT_DIGEST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| image.digest());
    info!(repo = %repo, tag = %tag, digest = %digest, "image pushed");
    Ok(digest)
}

/// Push `image` to the local source proxy and return the digested image reference
/// the cluster pulls it by: `<repository>:<tag>@<digest>`.
pub async fn publish_local_source(wrapper: &Wrapper, tag: &str, image: &SourceImage) -> Result<String, SourceError> {
    let digest = push(wrapper, SOURCE_REPOSITORY, tag, image).await?;
    let repository = wrapper.repository().ok_or(SourceError::MissingRepository)?;
    Ok(format!("{repository}:{tag}@{digest}"))
}
