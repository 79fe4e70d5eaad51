#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use http::{header, Method, Request, Response, StatusCode};

use apps_ops::proxy::{ProxyError, Transport, Wrapper};
use apps_ops::source::{load_exclusions, package, publish_local_source, push, sha256_digest, SourceError, SourceImage};

/// A minimal in-memory registry: stores blobs and manifests, hands out upload sessions.
#[derive(Default)]
struct Registry {
    seen: Mutex<Vec<(Method, String)>>,
    blobs: Mutex<Vec<String>>,
    manifests: Mutex<Vec<(String, Vec<u8>)>>,
    registry_path: Option<&'static str>,
    reject_manifest: bool,
}

impl Registry {
    fn requests(&self) -> Vec<(Method, String)> { self.seen.lock().unwrap().clone() }
}

fn reply(status: StatusCode) -> http::response::Builder {
    Response::builder().status(status)
}

#[async_trait::async_trait]
impl Transport for Registry {
    async fn round_trip(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, ProxyError> {
        let uri = req.uri().clone();
        self.seen.lock().unwrap().push((req.method().clone(), uri.to_string()));
        let path = uri.path().to_string();

        let mut resp = if req.method() == Method::HEAD {
            let digest = path.rsplit('/').next().unwrap_or_default();
            let known = self.blobs.lock().unwrap().iter().any(|b| b == digest);
            reply(if known { StatusCode::OK } else { StatusCode::NOT_FOUND })
        } else if req.method() == Method::POST && path.ends_with("/blobs/uploads/") {
            let n = self.seen.lock().unwrap().len();
            reply(StatusCode::ACCEPTED).header(header::LOCATION, format!("/v2/source/blobs/uploads/u{n}?_state=s{n}"))
        } else if req.method() == Method::PUT && path.contains("/blobs/uploads/") {
            let digest = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
                .find(|(k, _)| k == "digest")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            assert_eq!(digest, sha256_digest(req.body()), "uploaded bytes match the digest");
            self.blobs.lock().unwrap().push(digest);
            reply(StatusCode::CREATED)
        } else if req.method() == Method::PUT && path.contains("/manifests/") {
            if self.reject_manifest {
                reply(StatusCode::BAD_REQUEST)
            } else {
                let tag = path.rsplit('/').next().unwrap_or_default().to_string();
                self.manifests.lock().unwrap().push((tag, req.body().clone()));
                reply(StatusCode::CREATED)
            }
        } else {
            reply(StatusCode::NOT_FOUND)
        };
        if let Some(p) = self.registry_path {
            resp = resp.header("Lsp-Registry-Path", p);
        }
        Ok(resp.body(Vec::new()).unwrap())
    }
}

const BASE: &str = "/api/v1/namespaces/tap-local-source-system/services/http:local-source-proxy:5001/proxy";

fn image() -> (tempfile::TempDir, SourceImage) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "print('hello')\n").unwrap();
    let excl = load_exclusions(dir.path()).unwrap();
    let image = package(dir.path(), &excl).unwrap();
    (dir, image)
}

#[tokio::test]
async fn local_source_is_published_through_the_proxy() {
    let registry = Arc::new(Registry { registry_path: Some("registry.example.com/apps/source"), ..Default::default() });
    let wrapper = Wrapper::new(BASE.parse().unwrap()).with_transport(registry.clone());
    let (_dir, image) = image();

    let reference = publish_local_source(&wrapper, "default-petclinic", &image).await.unwrap();
    assert_eq!(reference, format!("registry.example.com/apps/source:default-petclinic@{}", image.digest()));

    let requests = registry.requests();
    assert!(requests.iter().all(|(_, uri)| uri.starts_with(BASE)), "every request is rebased: {requests:?}");
    assert_eq!(requests[0], (Method::HEAD, format!("{BASE}/v2/source/blobs/{}", image.layer.digest)));
    assert_eq!(requests[1], (Method::POST, format!("{BASE}/v2/source/blobs/uploads/")));
    assert_eq!(requests[2].1, format!("{BASE}/v2/source/blobs/uploads/u2?_state=s2&digest={}", image.layer.digest.replace(':', "%3A")));
    assert_eq!(requests.last().unwrap(), &(Method::PUT, format!("{BASE}/v2/source/manifests/default-petclinic")));

    let manifests = registry.manifests.lock().unwrap();
    assert_eq!(manifests.as_slice(), &[("default-petclinic".to_string(), image.manifest.clone())]);
}

#[tokio::test]
async fn present_blobs_are_not_uploaded_again() {
    let registry = Registry::default();
    let (_dir, image) = image();
    registry.blobs.lock().unwrap().push(image.layer.digest.clone());

    let digest = push(&registry, "source", "latest", &image).await.unwrap();
    assert_eq!(digest, image.digest());
    let uploads = registry.requests().iter().filter(|(m, _)| *m == Method::POST).count();
    assert_eq!(uploads, 1, "only the config blob is uploaded");
}

#[tokio::test]
async fn missing_repository_header_is_an_error() {
    let registry = Arc::new(Registry::default());
    let wrapper = Wrapper::new(BASE.parse().unwrap()).with_transport(registry);
    let (_dir, image) = image();

    let err = publish_local_source(&wrapper, "default-petclinic", &image).await.unwrap_err();
    assert!(matches!(err, SourceError::MissingRepository), "got {err:?}");
}

#[tokio::test]
async fn rejected_manifest_is_reported() {
    let registry = Registry { reject_manifest: true, ..Default::default() };
    let (_dir, image) = image();

    let err = push(&registry, "source", "latest", &image).await.unwrap_err();
    assert!(
        matches!(err, SourceError::Registry { op: "manifest upload", status, .. } if status == StatusCode::BAD_REQUEST),
        "got {err:?}"
    );
}
