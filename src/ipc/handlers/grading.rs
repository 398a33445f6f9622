use crate::error::AppResult;
use crate::grading::{self, ClassScope, SemesterInfo, YearPublishOptions};
use crate::ipc::helpers::{actor_with, optional_bool, optional_id, required_id, respond};
use crate::ipc::types::{AppState, Request};
use crate::roles::{Actor, Capability};
use crate::roster;
use rusqlite::Connection;
use serde_json::json;

/// The class head's class for the requested semester. `academic_year_id` is
/// optional; when given, the semester has to belong to it.
fn semester_scope(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> AppResult<(ClassScope, SemesterInfo)> {
    let semester_id = required_id(params, "semester_id")?;
    let semester = match optional_id(params, "academic_year_id")? {
        Some(year) => grading::semester_in_year(conn, &semester_id, &year)?,
        None => grading::semester_info(conn, &semester_id)?,
    };
    let scope = grading::class_for_head(conn, &actor.user_id, &semester.academic_year_id)?;
    Ok((scope, semester))
}

fn handle_compile(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::CompileResults)?;
    let conn = state.conn()?;
    let (scope, semester) = semester_scope(conn, &actor, &req.params)?;
    let summary = grading::compile_semester(conn, &scope, &semester, chrono::Utc::now())?;
    Ok(json!(summary))
}

fn handle_rankings(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::CompileResults)?;
    let conn = state.conn()?;
    let (scope, semester) = semester_scope(conn, &actor, &req.params)?;
    grading::rankings(conn, &scope, &semester)
}

fn handle_publish_semester(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::PublishResults)?;
    let conn = state.conn()?;
    let (scope, semester) = semester_scope(conn, &actor, &req.params)?;
    let summary = grading::publish_semester(conn, &scope, &semester, chrono::Utc::now())?;
    Ok(json!({
        "class_id": scope.class_id,
        "semester_id": semester.id,
        "students_published": summary.students_published,
        "newly_published": summary.newly_published,
        "published_at": summary.published_at,
    }))
}

fn handle_publish_year(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::PublishResults)?;
    let conn = state.conn()?;
    let year = required_id(&req.params, "academic_year_id")?;
    let options = YearPublishOptions {
        notify_students: optional_bool(&req.params, "notify_students")?,
        notify_parents: optional_bool(&req.params, "notify_parents")?,
        send_to_store_house: optional_bool(&req.params, "send_to_store_house")?,
    };
    if options.send_to_store_house {
        actor.require(Capability::SendRoster)?;
    }
    let scope = grading::class_for_head(conn, &actor.user_id, &year)?;
    grading::publish_year(conn, &scope, &actor.user_id, options, chrono::Utc::now())
}

fn handle_roster_send(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::SendRoster)?;
    let conn = state.conn()?;
    let (scope, semester) = semester_scope(conn, &actor, &req.params)?;
    let receipt =
        roster::send_semester_roster(conn, &scope, &semester, &actor.user_id, chrono::Utc::now())?;
    Ok(json!(receipt))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.compile" => handle_compile(state, req),
        "rankings.get" => handle_rankings(state, req),
        "publish.semester" => handle_publish_semester(state, req),
        "publish.year" => handle_publish_year(state, req),
        "roster.send" => handle_roster_send(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
