//! Distribution API served over a [`MemoryRegistry`] for HTTP client tests

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use futures::StreamExt;
use parking_lot::Mutex;
use registry_replicator::digest::Digest;
use registry_replicator::error::ReplicationError;
use registry_replicator::image::Reference;
use registry_replicator::registry::{MemoryRegistry, OciClient, RegistryClient, RegistryEndpoint};
use registry_replicator::secrets::StaticSecretsProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

#[derive(Clone)]
struct AppState {
    registry: Arc<MemoryRegistry>,
    token: Option<String>,
    realm: String,
    token_scopes: Arc<Mutex<Vec<String>>>,
    upload_lengths: Arc<Mutex<Vec<Option<String>>>>,
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<MemoryRegistry>,
    token_scopes: Arc<Mutex<Vec<String>>>,
    upload_lengths: Arc<Mutex<Vec<Option<String>>>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Anonymous registry
    pub async fn start(registry: Arc<MemoryRegistry>) -> Self {
        Self::spawn(registry, None).await
    }

    /// Registry demanding `Bearer <token>`, issued by its own `/token` realm
    pub async fn with_bearer(registry: Arc<MemoryRegistry>, token: &str) -> Self {
        Self::spawn(registry, Some(token.to_string())).await
    }

    async fn spawn(registry: Arc<MemoryRegistry>, token: Option<String>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token_scopes = Arc::new(Mutex::new(Vec::new()));
        let upload_lengths = Arc::new(Mutex::new(Vec::new()));

        let state = AppState {
            registry: Arc::clone(&registry),
            token,
            realm: format!("http://{}/token", addr),
            token_scopes: Arc::clone(&token_scopes),
            upload_lengths: Arc::clone(&upload_lengths),
        };
        let app = Router::new().fallback(handle).with_state(state);
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            registry,
            token_scopes,
            upload_lengths,
            handle: server,
        }
    }

    pub fn endpoint(&self) -> RegistryEndpoint {
        RegistryEndpoint::generic(self.addr.to_string()).with_insecure(true)
    }

    pub fn client(&self) -> OciClient {
        self.client_for(self.endpoint())
    }

    pub fn client_for(&self, endpoint: RegistryEndpoint) -> OciClient {
        OciClient::builder(endpoint)
            .with_secrets(Arc::new(StaticSecretsProvider::new()))
            .build()
            .unwrap()
    }

    /// Scopes requested from the token realm, in order
    pub fn token_scopes(&self) -> Vec<String> {
        self.token_scopes.lock().clone()
    }

    /// `Content-Length` of each blob upload PUT, `None` when sent chunked
    pub fn upload_lengths(&self) -> Vec<Option<String>> {
        self.upload_lengths.lock().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn respond(status: StatusCode) -> axum::http::response::Builder {
    Response::builder().status(status)
}

fn error_response(err: ReplicationError) -> Response {
    let (status, code) = match &err {
        ReplicationError::NotFound(_) => (StatusCode::NOT_FOUND, "NAME_UNKNOWN"),
        ReplicationError::DigestMismatch { .. } => (StatusCode::BAD_REQUEST, "DIGEST_INVALID"),
        ReplicationError::Registry { status, .. } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "MANIFEST_INVALID",
        ),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
    };
    let body = serde_json::json!({ "errors": [{ "code": code, "message": err.to_string() }] });
    respond(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn json(value: serde_json::Value) -> Response {
    respond(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    url::form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn parse_reference(raw: &str) -> Result<Reference, ReplicationError> {
    if raw.starts_with("sha256:") {
        Ok(Reference::Digest(raw.parse()?))
    } else {
        Ok(Reference::Tag(raw.to_string()))
    }
}

async fn handle(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if uri.path() == "/token" {
        if let Some(scope) = query_param(&uri, "scope") {
            state.token_scopes.lock().push(scope);
        }
        let token = state.token.clone().unwrap_or_default();
        return json(serde_json::json!({ "token": token, "expires_in": 300 }));
    }

    if let Some(token) = &state.token {
        let expected = format!("Bearer {}", token);
        let presented = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
        if presented != Some(expected.as_str()) {
            return respond(StatusCode::UNAUTHORIZED)
                .header(
                    WWW_AUTHENTICATE,
                    format!(r#"Bearer realm="{}",service="test-registry""#, state.realm),
                )
                .body(Body::empty())
                .unwrap();
        }
    }

    match route(&state, &method, &uri, &headers, body).await {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

async fn route(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ReplicationError> {
    let registry = &state.registry;
    let Some(rest) = uri.path().strip_prefix("/v2/") else {
        return Ok(respond(StatusCode::NOT_FOUND).body(Body::empty()).unwrap());
    };

    if rest.is_empty() {
        return Ok(json(serde_json::json!({})));
    }

    if rest == "_catalog" {
        let repositories = registry.list_repositories().await?;
        return Ok(json(serde_json::json!({ "repositories": repositories })));
    }

    if let Some(name) = rest.strip_suffix("/tags/list") {
        let tags = registry.list_tags(name).await?;
        return Ok(json(serde_json::json!({ "name": name, "tags": tags })));
    }

    if let Some((name, raw)) = rest.rsplit_once("/manifests/") {
        let reference = parse_reference(raw)?;
        return match *method {
            Method::GET | Method::HEAD => {
                let manifest = registry.get_manifest(name, &reference).await?;
                let builder = respond(StatusCode::OK)
                    .header(CONTENT_TYPE, manifest.media_type.as_str())
                    .header(DOCKER_CONTENT_DIGEST, manifest.digest.as_str());
                let body = if *method == Method::GET {
                    Body::from(manifest.bytes)
                } else {
                    Body::empty()
                };
                Ok(builder.body(body).unwrap())
            }
            Method::PUT => {
                let media_type = headers
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let digest = registry.put_manifest(name, &reference, body, &media_type).await?;
                Ok(respond(StatusCode::CREATED)
                    .header(DOCKER_CONTENT_DIGEST, digest.as_str())
                    .body(Body::empty())
                    .unwrap())
            }
            Method::DELETE => {
                registry.delete_image(name, &reference).await?;
                Ok(respond(StatusCode::ACCEPTED).body(Body::empty()).unwrap())
            }
            _ => Ok(respond(StatusCode::METHOD_NOT_ALLOWED).body(Body::empty()).unwrap()),
        };
    }

    if let Some((name, _session)) = rest.split_once("/blobs/uploads/") {
        return match *method {
            Method::POST => Ok(respond(StatusCode::ACCEPTED)
                .header(LOCATION, format!("/v2/{}/blobs/uploads/{}", name, uuid::Uuid::new_v4()))
                .header(CONTENT_LENGTH, "0")
                .body(Body::empty())
                .unwrap()),
            Method::PUT => {
                let digest: Digest = query_param(uri, "digest")
                    .ok_or_else(|| ReplicationError::Registry {
                        status: 400,
                        message: "missing digest parameter".to_string(),
                    })?
                    .parse()?;
                let length = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                state.upload_lengths.lock().push(length);
                let size = body.len() as u64;
                let stream = futures::stream::iter(vec![Ok(body)]).boxed();
                registry.put_blob(name, &digest, size, stream).await?;
                Ok(respond(StatusCode::CREATED)
                    .header(DOCKER_CONTENT_DIGEST, digest.as_str())
                    .body(Body::empty())
                    .unwrap())
            }
            _ => Ok(respond(StatusCode::METHOD_NOT_ALLOWED).body(Body::empty()).unwrap()),
        };
    }

    if let Some((name, raw)) = rest.rsplit_once("/blobs/") {
        let digest: Digest = raw.parse()?;
        return match *method {
            Method::HEAD => {
                let status = if registry.has_blob(name, &digest) {
                    StatusCode::OK
                } else {
                    StatusCode::NOT_FOUND
                };
                Ok(respond(status).body(Body::empty()).unwrap())
            }
            Method::GET => {
                let mut blob = registry.get_blob(name, &digest).await?;
                let mut data = Vec::new();
                while let Some(chunk) = blob.stream.next().await {
                    data.extend_from_slice(&chunk?);
                }
                Ok(respond(StatusCode::OK)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(DOCKER_CONTENT_DIGEST, digest.as_str())
                    .body(Body::from(data))
                    .unwrap())
            }
            Method::DELETE => {
                registry.delete_blob(name, &digest).await?;
                Ok(respond(StatusCode::ACCEPTED).body(Body::empty()).unwrap())
            }
            _ => Ok(respond(StatusCode::METHOD_NOT_ALLOWED).body(Body::empty()).unwrap()),
        };
    }

    Ok(respond(StatusCode::NOT_FOUND).body(Body::empty()).unwrap())
}
