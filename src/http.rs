//! REST facade over the request dispatcher. Each route assembles the same
//! `params` object a stdio client would send, so both transports share one
//! code path and one error taxonomy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;

use crate::error::ErrorCode;
use crate::ipc::{self, AppState, Request};
use crate::roles::Role;

pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";

type Fields = HashMap<String, String>;

#[derive(Clone)]
pub struct HttpState {
    inner: Arc<Mutex<AppState>>,
}

impl HttpState {
    pub fn new(state: AppState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }
}

/// How the request body becomes params.
#[derive(Clone, Copy)]
enum Body {
    Merge,
    Field(&'static str),
}

/// What a route dispatches to and how it answers.
#[derive(Clone, Copy)]
struct Route {
    method: &'static str,
    ok_status: StatusCode,
    body_as: Body,
    /// Routes scoped to one role refuse any other claimed role.
    role: Option<Role>,
}

impl Route {
    const fn new(method: &'static str, ok_status: StatusCode) -> Self {
        Self {
            method,
            ok_status,
            body_as: Body::Merge,
            role: None,
        }
    }

    const fn body(self, body_as: Body) -> Self {
        Self { body_as, ..self }
    }

    const fn for_role(self, role: Role) -> Self {
        Self {
            role: Some(role),
            ..self
        }
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Option<Value> {
    let role = headers.get(ACTOR_ROLE_HEADER)?.to_str().ok()?;
    let user_id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    Some(json!({ "role": role, "user_id": user_id }))
}

/// A claimed role that parses but is not the route's role. Missing or
/// unknown claims are left to the handler's actor validation.
fn wrong_role(route: &Route, headers: &HeaderMap) -> Option<Role> {
    let required = route.role?;
    let claimed = headers
        .get(ACTOR_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(Role::parse)?;
    (claimed != required).then_some(claimed)
}

fn envelope_status(resp: &Value, ok_status: StatusCode) -> StatusCode {
    if resp.get("success").and_then(|v| v.as_bool()) == Some(true) {
        return ok_status;
    }
    resp.pointer("/error/code")
        .and_then(|v| v.as_str())
        .and_then(ErrorCode::parse)
        .unwrap_or(ErrorCode::InternalError)
        .http_status()
}

fn reply(code: ErrorCode, request_id: &str, message: impl Into<String>) -> Response {
    let resp = ipc::err(request_id, code.as_str(), message, None);
    (code.http_status(), Json(resp)).into_response()
}

async fn dispatch(
    state: &HttpState,
    route: Route,
    headers: &HeaderMap,
    path: Fields,
    query: Fields,
    body: &[u8],
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();

    if let Some(claimed) = wrong_role(&route, headers) {
        return reply(
            ErrorCode::Forbidden,
            &request_id,
            format!("role {} cannot use this route", claimed.as_str()),
        );
    }

    let mut params = Map::new();
    if !body.iter().all(|b| b.is_ascii_whitespace()) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => match route.body_as {
                Body::Merge => params.extend(fields),
                Body::Field(key) => {
                    params.insert(key.to_string(), Value::Object(fields));
                }
            },
            Ok(_) | Err(_) => {
                return reply(
                    ErrorCode::ValidationError,
                    &request_id,
                    "request body must be a JSON object",
                );
            }
        }
    }
    for (k, v) in query.into_iter().chain(path) {
        params.insert(k, Value::String(v));
    }
    // The header claim always wins over anything in the body.
    params.remove("actor");
    if let Some(actor) = actor_from_headers(headers) {
        params.insert("actor".to_string(), actor);
    }

    let req = Request {
        id: request_id.clone(),
        method: route.method.to_string(),
        params: Value::Object(params),
    };
    // SQLite calls block, and a writer may sit out the busy timeout.
    let inner = Arc::clone(&state.inner);
    let handled = tokio::task::spawn_blocking(move || {
        let mut guard = inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ipc::handle_request(&mut guard, req)
    })
    .await;
    match handled {
        Ok(resp) => {
            let status = envelope_status(&resp, route.ok_status);
            (status, Json(resp)).into_response()
        }
        Err(e) => {
            tracing::error!(
                request_id = %request_id,
                method = route.method,
                error = %e,
                "request task failed"
            );
            reply(ErrorCode::InternalError, &request_id, "internal server error")
        }
    }
}

macro_rules! route_fn {
    ($name:ident, $route:expr) => {
        async fn $name(
            State(state): State<HttpState>,
            headers: HeaderMap,
            Query(query): Query<Fields>,
            body: Bytes,
        ) -> Response {
            dispatch(&state, $route, &headers, Fields::new(), query, &body).await
        }
    };
}

macro_rules! path_route_fn {
    ($name:ident, $route:expr) => {
        async fn $name(
            State(state): State<HttpState>,
            headers: HeaderMap,
            Path(path): Path<Fields>,
            Query(query): Query<Fields>,
            body: Bytes,
        ) -> Response {
            dispatch(&state, $route, &headers, path, query, &body).await
        }
    };
}

const OK: StatusCode = StatusCode::OK;
const CREATED: StatusCode = StatusCode::CREATED;

route_fn!(health, Route::new("health", OK));
route_fn!(
    directory_import,
    Route::new("directory.import", OK).body(Body::Field("document"))
);

route_fn!(assessment_types_list, Route::new("assessmentTypes.list", OK));
route_fn!(
    assessment_types_create,
    Route::new("assessmentTypes.create", CREATED)
);
path_route_fn!(
    assessment_types_update,
    Route::new("assessmentTypes.update", OK)
);
path_route_fn!(
    assessment_types_delete,
    Route::new("assessmentTypes.delete", OK)
);
route_fn!(weights_set, Route::new("weights.set", OK));
route_fn!(marks_record, Route::new("marks.record", CREATED));
route_fn!(marks_list, Route::new("marks.list", OK));

route_fn!(compile_grades, Route::new("grades.compile", OK));
route_fn!(rankings, Route::new("rankings.get", OK));
route_fn!(publish_semester, Route::new("publish.semester", OK));
route_fn!(publish_year, Route::new("publish.year", OK));
route_fn!(send_roster, Route::new("roster.send", OK));

route_fn!(
    student_profile,
    Route::new("student.profile", OK).for_role(Role::Student)
);
route_fn!(
    student_semester,
    Route::new("reports.semester", OK).for_role(Role::Student)
);
route_fn!(
    student_year,
    Route::new("reports.year", OK).for_role(Role::Student)
);
path_route_fn!(
    student_subject_grades,
    Route::new("reports.subjectGrades", OK).for_role(Role::Student)
);
route_fn!(
    student_rank,
    Route::new("reports.rank", OK).for_role(Role::Student)
);

route_fn!(
    parent_children,
    Route::new("parent.children", OK).for_role(Role::Parent)
);
path_route_fn!(
    child_profile,
    Route::new("student.profile", OK).for_role(Role::Parent)
);
path_route_fn!(
    child_semester,
    Route::new("reports.semester", OK).for_role(Role::Parent)
);
path_route_fn!(
    child_year,
    Route::new("reports.year", OK).for_role(Role::Parent)
);
path_route_fn!(
    child_subject_grades,
    Route::new("reports.subjectGrades", OK).for_role(Role::Parent)
);
path_route_fn!(
    child_rank,
    Route::new("reports.rank", OK).for_role(Role::Parent)
);

route_fn!(rosters_list, Route::new("rosters.list", OK));
path_route_fn!(rosters_get, Route::new("rosters.get", OK));
route_fn!(rosters_export, Route::new("rosters.exportArchive", OK));

route_fn!(notifications_list, Route::new("notifications.list", OK));

async fn unknown_route() -> Response {
    reply(
        ErrorCode::NotFound,
        &uuid::Uuid::new_v4().to_string(),
        "route not found",
    )
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/admin/directory/import", post(directory_import))
        .route(
            "/api/v1/school/assessment-types",
            get(assessment_types_list).post(assessment_types_create),
        )
        .route(
            "/api/v1/school/assessment-types/{type_id}",
            put(assessment_types_update).delete(assessment_types_delete),
        )
        .route("/api/v1/teacher/assessment-weights", put(weights_set))
        .route("/api/v1/teacher/marks", get(marks_list).post(marks_record))
        .route("/api/v1/class-head/compile-grades", post(compile_grades))
        .route("/api/v1/class-head/students/rankings", get(rankings))
        .route("/api/v1/class-head/publish/semester", post(publish_semester))
        .route("/api/v1/class-head/publish/year", post(publish_year))
        .route(
            "/api/v1/class-head/store-house/send-roster",
            post(send_roster),
        )
        .route("/api/v1/student/profile", get(student_profile))
        .route("/api/v1/student/reports/semester", get(student_semester))
        .route("/api/v1/student/reports/year", get(student_year))
        .route(
            "/api/v1/student/subjects/{subject_id}/grades",
            get(student_subject_grades),
        )
        .route("/api/v1/student/rank", get(student_rank))
        .route("/api/v1/parent/children", get(parent_children))
        .route(
            "/api/v1/parent/children/{student_id}/profile",
            get(child_profile),
        )
        .route(
            "/api/v1/parent/children/{student_id}/reports/semester",
            get(child_semester),
        )
        .route(
            "/api/v1/parent/children/{student_id}/reports/year",
            get(child_year),
        )
        .route(
            "/api/v1/parent/children/{student_id}/subjects/{subject_id}/grades",
            get(child_subject_grades),
        )
        .route("/api/v1/parent/children/{student_id}/rank", get(child_rank))
        .route("/api/v1/store-house/rosters", get(rosters_list))
        .route("/api/v1/store-house/rosters/export", post(rosters_export))
        .route("/api/v1/store-house/rosters/{roster_id}", get(rosters_get))
        .route("/api/v1/notifications", get(notifications_list))
        .fallback(unknown_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let app = build_router(HttpState::new(state));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("http server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("received ctrl-c, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_envelopes_map_to_their_status() {
        let ok = json!({ "success": true });
        assert_eq!(envelope_status(&ok, StatusCode::CREATED), StatusCode::CREATED);
        let forbidden = json!({ "success": false, "error": { "code": "FORBIDDEN" } });
        assert_eq!(
            envelope_status(&forbidden, StatusCode::OK),
            StatusCode::FORBIDDEN
        );
        let odd = json!({ "success": false, "error": { "code": "weird" } });
        assert_eq!(
            envelope_status(&odd, StatusCode::OK),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn actor_comes_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(actor_from_headers(&headers).is_none());
        headers.insert(ACTOR_ROLE_HEADER, "class_head".parse().expect("header"));
        headers.insert(ACTOR_ID_HEADER, "u-head".parse().expect("header"));
        assert_eq!(
            actor_from_headers(&headers),
            Some(json!({ "role": "class_head", "user_id": "u-head" }))
        );
    }

    #[test]
    fn role_scoped_routes_refuse_other_claims() {
        let child = Route::new("reports.semester", OK).for_role(Role::Parent);
        let mut headers = HeaderMap::new();
        assert_eq!(wrong_role(&child, &headers), None);

        headers.insert(ACTOR_ROLE_HEADER, "student".parse().expect("header"));
        assert_eq!(wrong_role(&child, &headers), Some(Role::Student));
        assert_eq!(
            wrong_role(&Route::new("reports.semester", OK), &headers),
            None
        );

        headers.insert(ACTOR_ROLE_HEADER, "parent".parse().expect("header"));
        assert_eq!(wrong_role(&child, &headers), None);
        headers.insert(ACTOR_ROLE_HEADER, "janitor".parse().expect("header"));
        assert_eq!(wrong_role(&child, &headers), None);
    }
}
