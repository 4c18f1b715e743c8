//! Axum handlers for the publix HTTP surface.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};

use publix_kernel::{BatchId, ComponentId, PublixStore, RunId};
use publix_runtime::{normalize_request_body, ComponentStart, Publix, PublixError};

use crate::api_errors::ApiError;
use crate::api_models::{
    AbortQuery, ApiEnvelope, ApiMeta, ComponentStartResponse, DownloadQuery, FinishQuery,
    GroupResponse, InitDataResponse, ResultDataResponse, StartRunBody, UploadResponse,
};

/// Header carrying the identity token, in requests and responses.
pub const ID_TOKEN_HEADER: &str = "x-publix-id-token";

const DEFAULT_BODY_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct PublixApiState {
    pub publix: Arc<Publix<dyn PublixStore>>,
    pub body_limit: usize,
}

impl PublixApiState {
    pub fn new(publix: Arc<Publix<dyn PublixStore>>) -> Self {
        Self {
            publix,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }
}

pub fn build_router(state: PublixApiState) -> Router {
    let body_limit = state.body_limit;
    Router::new()
        .route("/publix/v1/batches/:batch_id/start", post(start_run))
        .route(
            "/publix/v1/runs/:run_id/components/:component_id/start",
            post(start_component),
        )
        .route(
            "/publix/v1/runs/:run_id/positions/:position/start",
            post(start_component_by_position),
        )
        .route(
            "/publix/v1/runs/:run_id/next-component/start",
            post(start_next_component),
        )
        .route(
            "/publix/v1/runs/:run_id/components/:component_id/init-data",
            get(retrieve_init_data),
        )
        .route(
            "/publix/v1/runs/:run_id/session-data",
            put(set_session_data),
        )
        .route("/publix/v1/runs/:run_id/heartbeat", post(heartbeat))
        .route(
            "/publix/v1/runs/:run_id/components/:component_id/result-data",
            put(submit_result_data).post(append_result_data),
        )
        .route(
            "/publix/v1/runs/:run_id/components/:component_id/files/:filename",
            post(upload_file),
        )
        .route("/publix/v1/runs/:run_id/files/:filename", get(download_file))
        .route("/publix/v1/runs/:run_id/group/join", post(join_group))
        .route("/publix/v1/runs/:run_id/group/leave", post(leave_group))
        .route("/publix/v1/runs/:run_id/finish", post(finish_run))
        .route("/publix/v1/runs/:run_id/abort", post(abort_run))
        .route("/publix/v1/runs/:run_id/log", post(log))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn(request_log_middleware))
        .with_state(state)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn id_token(headers: &HeaderMap, rid: &str) -> Result<String, ApiError> {
    headers
        .get(ID_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::forbidden("identity token is missing").with_request_id(rid))
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

fn publix_error(rid: &str) -> impl Fn(PublixError) -> ApiError + '_ {
    move |err| ApiError::from(err).with_request_id(rid)
}

fn envelope<T>(rid: String, data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope {
        meta: ApiMeta::ok(),
        request_id: rid,
        data,
    })
}

/// Plain-text acknowledgement, optionally with a reissued token.
fn ack(token: Option<String>) -> Response {
    match token {
        Some(token) => ([(ID_TOKEN_HEADER, token)], " ").into_response(),
        None => " ".into_response(),
    }
}

fn started(rid: String, start: ComponentStart) -> Response {
    let data = ComponentStartResponse::from(&start);
    ([(ID_TOKEN_HEADER, start.token)], envelope(rid, data)).into_response()
}

async fn request_log_middleware(
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let rid = request_id(&headers);
    tracing::info!(
        request_id = %rid,
        method = %request.method(),
        path = request.uri().path(),
        "publix_api_request"
    );
    next.run(request).await
}

pub async fn start_run(
    State(state): State<PublixApiState>,
    Path(batch_id): Path<BatchId>,
    headers: HeaderMap,
    Json(body): Json<StartRunBody>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let start = state
        .publix
        .start_run(batch_id, &body.into_request())
        .map_err(publix_error(&rid))?;
    Ok(started(rid, start))
}

pub async fn start_component(
    State(state): State<PublixApiState>,
    Path((run_id, component_id)): Path<(RunId, ComponentId)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let start = state
        .publix
        .start_component(&token, run_id, component_id)
        .map_err(publix_error(&rid))?;
    Ok(started(rid, start))
}

pub async fn start_component_by_position(
    State(state): State<PublixApiState>,
    Path((run_id, position)): Path<(RunId, usize)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let start = state
        .publix
        .start_component_by_position(&token, run_id, Some(position))
        .map_err(publix_error(&rid))?;
    Ok(started(rid, start))
}

pub async fn start_next_component(
    State(state): State<PublixApiState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let next = state
        .publix
        .start_next_component(&token, run_id)
        .map_err(publix_error(&rid))?;
    Ok(match next {
        Some(start) => started(rid, start),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn retrieve_init_data(
    State(state): State<PublixApiState>,
    Path((run_id, component_id)): Path<(RunId, ComponentId)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let init = state
        .publix
        .retrieve_init_data(&token, run_id, component_id)
        .map_err(publix_error(&rid))?;
    let data = InitDataResponse::from(&init);
    Ok(([(ID_TOKEN_HEADER, init.token)], envelope(rid, data)).into_response())
}

pub async fn set_session_data(
    State(state): State<PublixApiState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let data = normalize_request_body(content_type(&headers), &body).map_err(publix_error(&rid))?;
    state
        .publix
        .set_session_data(&token, run_id, data)
        .map_err(publix_error(&rid))?;
    Ok(ack(None))
}

pub async fn heartbeat(
    State(state): State<PublixApiState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    state
        .publix
        .heartbeat(&token, run_id)
        .map_err(publix_error(&rid))?;
    Ok(ack(None))
}

fn store_result_data(
    state: &PublixApiState,
    run_id: RunId,
    component_id: ComponentId,
    headers: &HeaderMap,
    body: &[u8],
    append: bool,
) -> Result<Json<ApiEnvelope<ResultDataResponse>>, ApiError> {
    let rid = request_id(headers);
    let token = id_token(headers, &rid)?;
    let payload = normalize_request_body(content_type(headers), body).map_err(publix_error(&rid))?;
    let component_run = state
        .publix
        .submit_result_data(&token, run_id, component_id, &payload, append)
        .map_err(publix_error(&rid))?;
    let size = component_run.data.as_ref().map_or(0, String::len);
    Ok(envelope(
        rid,
        ResultDataResponse {
            component_run_id: component_run.id,
            size,
        },
    ))
}

pub async fn submit_result_data(
    State(state): State<PublixApiState>,
    Path((run_id, component_id)): Path<(RunId, ComponentId)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiEnvelope<ResultDataResponse>>, ApiError> {
    store_result_data(&state, run_id, component_id, &headers, &body, false)
}

pub async fn append_result_data(
    State(state): State<PublixApiState>,
    Path((run_id, component_id)): Path<(RunId, ComponentId)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiEnvelope<ResultDataResponse>>, ApiError> {
    store_result_data(&state, run_id, component_id, &headers, &body, true)
}

pub async fn upload_file(
    State(state): State<PublixApiState>,
    Path((run_id, component_id, filename)): Path<(RunId, ComponentId, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiEnvelope<UploadResponse>>, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let publix = state.publix.clone();
    let stored = tokio::task::spawn_blocking(move || {
        publix.upload_file(&token, run_id, component_id, &filename, &body)
    })
    .await
    .map_err(|e| ApiError::internal(format!("upload task: {}", e)).with_request_id(rid.clone()))?
    .map_err(publix_error(&rid))?;
    Ok(envelope(
        rid,
        UploadResponse {
            component_run_id: stored.component_run_id,
            filename: stored.filename,
            size: stored.size,
        },
    ))
}

pub async fn download_file(
    State(state): State<PublixApiState>,
    Path((run_id, filename)): Path<(RunId, String)>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let publix = state.publix.clone();
    let bytes = tokio::task::spawn_blocking(move || {
        publix.download_file(&token, run_id, &filename, query.component_run_id)
    })
    .await
    .map_err(|e| ApiError::internal(format!("download task: {}", e)).with_request_id(rid.clone()))?
    .map_err(publix_error(&rid))?;
    Ok(([(CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

pub async fn join_group(
    State(state): State<PublixApiState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let membership = state
        .publix
        .join_group(&token, run_id)
        .map_err(publix_error(&rid))?;
    let data = GroupResponse::from(&membership);
    Ok(([(ID_TOKEN_HEADER, membership.token)], envelope(rid, data)).into_response())
}

pub async fn leave_group(
    State(state): State<PublixApiState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let reissued = state
        .publix
        .leave_group(&token, run_id)
        .map_err(publix_error(&rid))?;
    Ok(ack(Some(reissued)))
}

/// Body is the confirmation code, or a single space when there is none to
/// show.
pub async fn finish_run(
    State(state): State<PublixApiState>,
    Path(run_id): Path<RunId>,
    Query(query): Query<FinishQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let code = state
        .publix
        .finish_run(&token, run_id, query.successful, query.message)
        .map_err(publix_error(&rid))?;
    Ok(match code {
        Some(code) => code.into_response(),
        None => ack(None),
    })
}

pub async fn abort_run(
    State(state): State<PublixApiState>,
    Path(run_id): Path<RunId>,
    Query(query): Query<AbortQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    state
        .publix
        .abort_run(&token, run_id, query.message)
        .map_err(publix_error(&rid))?;
    Ok(ack(None))
}

pub async fn log(
    State(state): State<PublixApiState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let token = id_token(&headers, &rid)?;
    let message = normalize_request_body(content_type(&headers), &body).map_err(publix_error(&rid))?;
    state
        .publix
        .log(&token, run_id, &message)
        .map_err(publix_error(&rid))?;
    Ok(ack(None))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use publix_kernel::{InMemoryPublixStore, PublixStore, RunState, StoreSeed};
    use publix_runtime::{IdTokenCodec, Publix};
    use serde_json::Value;
    use tower::util::ServiceExt;

    use super::{build_router, PublixApiState, ID_TOKEN_HEADER};

    const SEED: &str = r#"{
        "studies": [
            {"id": 1, "title": "pairs", "component_ids": [10, 20], "group_study": true, "max_group_size": 2}
        ],
        "components": [
            {"id": 10, "study_id": 1, "title": "consent"},
            {"id": 20, "study_id": 1, "title": "game", "reloadable": true}
        ],
        "batches": [
            {"id": 1, "study_id": 1, "title": "default", "active": true,
             "allowed_kinds": ["anonymous_repeatable", "platform"], "max_total_workers": null}
        ]
    }"#;

    fn build_state() -> PublixApiState {
        let store: Arc<dyn PublixStore> = Arc::new(InMemoryPublixStore::from_seed(
            StoreSeed::from_json(SEED).unwrap(),
        ));
        let publix = Publix::builder(store)
            .token_codec(IdTokenCodec::new(b"api-test".to_vec()))
            .build()
            .unwrap();
        PublixApiState::new(Arc::new(publix))
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn text_body(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Starts a run and returns (run id, token).
    async fn start(router: &axum::Router, kind: &str) -> (u64, String) {
        let mut body = serde_json::json!({ "worker_kind": kind });
        if kind == "platform" {
            body["platform_worker_id"] = Value::from("A2B3C4");
        }
        let req = Request::builder()
            .method(Method::POST)
            .uri("/publix/v1/batches/1/start")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let token = resp.headers()[ID_TOKEN_HEADER].to_str().unwrap().to_string();
        let json = json_body(resp).await;
        assert_eq!(json["meta"]["status"], "ok");
        assert_eq!(json["data"]["component_id"], 10);
        assert_eq!(json["data"]["position"], 1);
        (json["data"]["run_id"].as_u64().unwrap(), token)
    }

    fn call(method: Method, uri: String, token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(ID_TOKEN_HEADER, token)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn start_then_retrieve_init_data() {
        let router = build_router(build_state());
        let (run_id, token) = start(&router, "anonymous_repeatable").await;

        let resp = router
            .clone()
            .oneshot(call(
                Method::GET,
                format!("/publix/v1/runs/{}/components/10/init-data", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(ID_TOKEN_HEADER));
        let json = json_body(resp).await;
        assert_eq!(json["data"]["run_id"], run_id);
        assert_eq!(json["data"]["component_position"], 1);
        assert!(json["data"]["group_id"].is_null());
    }

    #[tokio::test]
    async fn missing_or_tampered_token_is_forbidden() {
        let router = build_router(build_state());
        let (run_id, token) = start(&router, "anonymous_repeatable").await;

        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/publix/v1/runs/{}/heartbeat", run_id))
            .header("x-request-id", "rid-heartbeat")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let json = json_body(resp).await;
        assert_eq!(json["request_id"], "rid-heartbeat");
        assert_eq!(json["error"]["code"], "forbidden");

        let tampered = format!("{}A", token);
        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/heartbeat", run_id),
                &tampered,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["error"]["code"], "token_signature");

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/heartbeat", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(text_body(resp).await, " ");
    }

    #[tokio::test]
    async fn result_data_is_normalized_and_appended() {
        let state = build_state();
        let router = build_router(state.clone());
        let (run_id, token) = start(&router, "anonymous_repeatable").await;
        let uri = format!("/publix/v1/runs/{}/components/10/result-data", run_id);

        let req = Request::builder()
            .method(Method::PUT)
            .uri(uri.clone())
            .header(ID_TOKEN_HEADER, &token)
            .header("content-type", "application/json")
            .body(Body::from("{ \"a\" : 1 }"))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder()
            .method(Method::POST)
            .uri(uri.clone())
            .header(ID_TOKEN_HEADER, &token)
            .header("content-type", "text/plain")
            .body(Body::from("\nmore"))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        let component_run_id = json["data"]["component_run_id"].as_u64().unwrap();

        let stored = state
            .publix
            .store()
            .find_component_run(component_run_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.data.as_deref(), Some("{\"a\":1}\nmore"));

        let req = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(ID_TOKEN_HEADER, &token)
            .header("content-type", "image/png")
            .body(Body::from(vec![0u8, 1, 2]))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(json_body(resp).await["error"]["code"], "unsupported_media_type");
    }

    #[tokio::test]
    async fn refused_reload_ends_the_run() {
        let state = build_state();
        let router = build_router(state.clone());
        let (run_id, token) = start(&router, "anonymous_repeatable").await;

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/components/10/start", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["error"]["code"], "forbidden_reload");
        let run = state.publix.store().require_run(run_id).unwrap();
        assert_eq!(run.state, RunState::Fail);

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/heartbeat", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn next_component_then_finish() {
        let router = build_router(build_state());
        let (run_id, token) = start(&router, "platform").await;

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/next-component/start", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let token = resp.headers()[ID_TOKEN_HEADER].to_str().unwrap().to_string();
        assert_eq!(json_body(resp).await["data"]["component_id"], 20);

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/next-component/start", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/finish?successful=true", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let code = text_body(resp).await;
        assert!(!code.trim().is_empty());
        assert!(uuid::Uuid::parse_str(&code).is_ok());
    }

    #[tokio::test]
    async fn group_join_and_leave_reissue_tokens() {
        let router = build_router(build_state());
        let (run_id, token) = start(&router, "anonymous_repeatable").await;

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/group/join", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let joined_token = resp.headers()[ID_TOKEN_HEADER].to_str().unwrap().to_string();
        assert_ne!(joined_token, token);
        let json = json_body(resp).await;
        assert_eq!(json["data"]["state"], "INCOMPLETE");
        assert_eq!(json["data"]["member_run_ids"], serde_json::json!([run_id]));

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/group/leave", run_id),
                &joined_token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(ID_TOKEN_HEADER));
    }

    #[tokio::test]
    async fn upload_and_download_file() {
        let router = build_router(build_state());
        let (run_id, token) = start(&router, "anonymous_repeatable").await;

        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/publix/v1/runs/{}/components/10/files/answers.csv", run_id))
            .header(ID_TOKEN_HEADER, &token)
            .body(Body::from("q,a\n1,yes\n"))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["data"]["size"], 10);

        let resp = router
            .clone()
            .oneshot(call(
                Method::GET,
                format!("/publix/v1/runs/{}/files/answers.csv", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(text_body(resp).await, "q,a\n1,yes\n");

        let resp = router
            .clone()
            .oneshot(call(
                Method::GET,
                format!("/publix/v1/runs/{}/files/missing.csv", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn abort_then_log_still_accepted() {
        let router = build_router(build_state());
        let (run_id, token) = start(&router, "anonymous_repeatable").await;

        let resp = router
            .clone()
            .oneshot(call(
                Method::POST,
                format!("/publix/v1/runs/{}/abort?message=left%20early", run_id),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/publix/v1/runs/{}/log", run_id))
            .header(ID_TOKEN_HEADER, &token)
            .header("content-type", "text/plain")
            .body(Body::from("window\nclosed"))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
