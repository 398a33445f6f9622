mod test_support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use gradebookd::http as api;
use gradebookd::{archive, db, ipc};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use test_support::{demo, fixture_path, temp_dir};
use tower::ServiceExt;

fn app_in(prefix: &str) -> (Router, PathBuf) {
    let workspace = temp_dir(prefix);
    let mut state = ipc::AppState::empty();
    state.db = Some(db::open_db(&workspace).expect("open db"));
    state.workspace = Some(workspace.clone());
    (api::build_router(api::HttpState::new(state)), workspace)
}

fn app(prefix: &str) -> Router {
    app_in(prefix).0
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    actor: Option<(&str, &str)>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((role, user_id)) = actor {
        builder = builder
            .header(api::ACTOR_ROLE_HEADER, role)
            .header(api::ACTOR_ID_HEADER, user_id);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app
        .clone()
        .oneshot(builder.body(body).expect("build request"))
        .await
        .expect("router response");
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body");
    let value: Value = serde_json::from_slice(&bytes).expect("json body");
    (status, value)
}

async fn import_demo(app: &Router) {
    let text = std::fs::read_to_string(fixture_path("fixtures/demo_school.json"))
        .expect("read demo fixture");
    let document: Value = serde_json::from_str(&text).expect("parse demo fixture");
    let (status, body) = call(
        app,
        "POST",
        "/api/v1/admin/directory/import",
        Some(("admin", demo::ADMIN)),
        Some(document),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

/// One Final Exam mark (weight 40) each, so Mathematics equals the raw score.
async fn seed_math(app: &Router) {
    for (student, score) in [(demo::ABEBE, 30), (demo::TIGIST, 20), (demo::DAWIT, 10)] {
        let (status, body) = call(
            app,
            "POST",
            "/api/v1/teacher/marks",
            Some(("teacher", demo::TEACHER_ALMAZ)),
            Some(json!({
                "teaching_assignment_id": 1,
                "student_id": student,
                "assessment_type_id": 5,
                "semester_id": 5,
                "score": score,
                "max_score": 40,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["success"], true);
    }
}

#[tokio::test]
async fn class_head_flow_over_rest() {
    let app = app("gradebook-http-flow");
    import_demo(&app).await;
    seed_math(&app).await;
    let head = Some(("class_head", demo::CLASS_HEAD));
    let student = Some(("student", demo::STUDENT_USER_ABEBE));

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/class-head/compile-grades",
        head,
        Some(json!({ "semester_id": 5, "academic_year_id": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["students_compiled"], 3);

    let (status, body) = call(
        &app,
        "GET",
        "/api/v1/class-head/students/rankings?semester_id=5",
        head,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"][0]["student_id"], demo::ABEBE);

    let (status, body) = call(
        &app,
        "GET",
        "/api/v1/student/reports/semester?semester_id=5",
        student,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body["data"].is_null());

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/class-head/publish/semester",
        head,
        Some(json!({ "semester_id": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        "GET",
        "/api/v1/student/reports/semester?semester_id=5&academic_year_id=3",
        student,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["summary"]["rank_in_class"], 1);

    let (status, body) = call(
        &app,
        "GET",
        "/api/v1/parent/children/1/reports/semester?semester_id=5",
        Some(("parent", demo::PARENT_OF_ABEBE)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["student"]["id"], demo::ABEBE);

    let (status, _) = call(
        &app,
        "GET",
        "/api/v1/parent/children/1/rank?semester_id=5",
        Some(("parent", demo::PARENT_OF_TIGIST)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        &app,
        "GET",
        "/api/v1/student/subjects/1/grades?semester_id=5",
        student,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["assessments"][0]["type"], "Final Exam");

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/class-head/store-house/send-roster",
        head,
        Some(json!({ "semester_id": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let roster_id = body["data"]["roster_id"].as_str().expect("roster_id").to_string();

    let store = Some(("store_house", demo::STORE_HOUSE));
    let (status, body) = call(&app, "GET", "/api/v1/store-house/rosters", store, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"][0]["roster_id"], roster_id.as_str());

    let (status, body) = call(
        &app,
        "GET",
        &format!("/api/v1/store-house/rosters/{roster_id}"),
        store,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["payload"]["statistics"]["total_students"], 3);
}

#[tokio::test]
async fn header_actor_wins_over_body() {
    let app = app("gradebook-http-actor");
    import_demo(&app).await;

    // The body claims to be the class head; the header says teacher.
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/class-head/compile-grades",
        Some(("teacher", demo::TEACHER_ALMAZ)),
        Some(json!({
            "semester_id": 5,
            "actor": { "role": "class_head", "user_id": demo::CLASS_HEAD },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");

    // Without headers a body claim is ignored altogether.
    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/class-head/compile-grades",
        None,
        Some(json!({
            "semester_id": 5,
            "actor": { "role": "class_head", "user_id": demo::CLASS_HEAD },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn assessment_type_routes_map_statuses() {
    let app = app("gradebook-http-types");
    import_demo(&app).await;
    let head = Some(("school_head", demo::SCHOOL_HEAD));

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/school/assessment-types",
        head,
        Some(json!({ "name": "Project", "default_weight_percent": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let type_id = body["data"]["id"].as_str().expect("id").to_string();

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/school/assessment-types",
        head,
        Some(json!({ "name": "PROJECT", "default_weight_percent": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let uri = format!("/api/v1/school/assessment-types/{type_id}");
    let (status, body) = call(
        &app,
        "PUT",
        &uri,
        head,
        Some(json!({ "default_weight_percent": 20 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["name"], "Project");

    let (status, _) = call(&app, "DELETE", &uri, head, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "DELETE", &uri, head, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, "GET", "/api/v1/school/assessment-types", head, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"].as_array().expect("items").len(), 5);
}

#[tokio::test]
async fn unknown_routes_and_bad_bodies() {
    let app = app("gradebook-http-errors");

    let (status, body) = call(&app, "GET", "/api/v1/nowhere", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/teacher/marks",
        Some(("teacher", demo::TEACHER_ALMAZ)),
        Some(json!([1, 2, 3])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["version"].is_string());
}

#[tokio::test]
async fn roster_export_is_confined_to_the_workspace() {
    let (app, workspace) = app_in("gradebook-http-export");
    import_demo(&app).await;
    let store = Some(("store_house", demo::STORE_HOUSE));
    let db_path = workspace.join(db::DB_FILE_NAME);
    let db_before = std::fs::read(&db_path).expect("read db");

    for body in [
        json!({ "out_path": db_path.to_string_lossy() }),
        json!({ "file_name": db_path.to_string_lossy() }),
        json!({ "file_name": "gradebook.sqlite3" }),
        json!({ "file_name": "../escaped.zip" }),
    ] {
        let (status, resp) = call(
            &app,
            "POST",
            "/api/v1/store-house/rosters/export",
            store,
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(resp["error"]["code"], "VALIDATION_ERROR");
    }
    assert_eq!(std::fs::read(&db_path).expect("read db"), db_before);
    assert!(!workspace.join("escaped.zip").exists());

    let (status, resp) = call(
        &app,
        "POST",
        "/api/v1/store-house/rosters/export",
        store,
        Some(json!({ "file_name": "rosters.zip" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{resp}");
    let out = workspace.join(archive::EXPORT_DIR).join("rosters.zip");
    assert_eq!(resp["data"]["path"], &*out.to_string_lossy());
    assert_eq!(archive::verify_archive(&out).expect("verify"), 0);

    let (status, _) = call(&app, "GET", "/api/v1/store-house/rosters", store, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn child_routes_belong_to_parents() {
    let app = app("gradebook-http-child-routes");
    import_demo(&app).await;
    seed_math(&app).await;
    let head = Some(("class_head", demo::CLASS_HEAD));
    for (uri, body) in [
        ("/api/v1/class-head/compile-grades", json!({ "semester_id": 5 })),
        ("/api/v1/class-head/publish/semester", json!({ "semester_id": 5 })),
    ] {
        let (status, resp) = call(&app, "POST", uri, head, Some(body)).await;
        assert_eq!(status, StatusCode::OK, "{resp}");
    }

    // Abebe asking for Tigist's report through the parent routes.
    let abebe = Some(("student", demo::STUDENT_USER_ABEBE));
    for uri in [
        "/api/v1/parent/children/2/reports/semester?semester_id=5",
        "/api/v1/parent/children/2/rank?semester_id=5",
        "/api/v1/parent/children/1/profile",
        "/api/v1/parent/children",
    ] {
        let (status, resp) = call(&app, "GET", uri, abebe, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(resp["error"]["code"], "FORBIDDEN");
    }

    // A parent cannot use the student's own routes either.
    let (status, _) = call(
        &app,
        "GET",
        "/api/v1/student/reports/semester?semester_id=5",
        Some(("parent", demo::PARENT_OF_ABEBE)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Naming another student on the student route is refused too.
    let (status, _) = call(
        &app,
        "GET",
        "/api/v1/student/reports/semester?semester_id=5&student_id=2",
        abebe,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, resp) = call(
        &app,
        "GET",
        "/api/v1/student/reports/semester?semester_id=5&student_id=1",
        abebe,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{resp}");
    assert_eq!(resp["data"]["student"]["id"], demo::ABEBE);
}

#[tokio::test(flavor = "current_thread")]
async fn waiting_writers_do_not_stall_the_runtime() {
    let (app, workspace) = app_in("gradebook-http-blocking");
    import_demo(&app).await;
    seed_math(&app).await;

    // A second connection holds the write lock for a while.
    let holder = db::open_db(&workspace).expect("second connection");
    holder.execute_batch("BEGIN IMMEDIATE").expect("take write lock");
    let release = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(400));
        holder.execute_batch("ROLLBACK").expect("release write lock");
    });

    let compile = tokio::spawn({
        let app = app.clone();
        async move {
            call(
                &app,
                "POST",
                "/api/v1/class-head/compile-grades",
                Some(("class_head", demo::CLASS_HEAD)),
                Some(json!({ "semester_id": 5 })),
            )
            .await
        }
    });

    // The single runtime thread keeps serving timers while the compile waits.
    let started = Instant::now();
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(started.elapsed() < Duration::from_millis(200));

    let (status, body) = compile.await.expect("compile task");
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["students_compiled"], 3);
    release.join().expect("holder thread");
}
