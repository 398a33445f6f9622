use crate::error::AppResult;
use crate::grading;
use crate::ipc::helpers::{optional_id, required_id, respond};
use crate::ipc::types::{AppState, Request};
use crate::reports::{self, StudentInfo};
use crate::roles::{Actor, Capability, Role};
use rusqlite::Connection;

/// Resolve the actor and the student whose report is read.
fn reader(conn: &Connection, req: &Request) -> AppResult<StudentInfo> {
    let actor = Actor::from_params(&req.params)?;
    match actor.role {
        Role::Parent => actor.require(Capability::ViewChildReport)?,
        _ => actor.require(Capability::ViewOwnReport)?,
    }
    let student_id = optional_id(&req.params, "student_id")?;
    reports::report_subject(conn, &actor, student_id.as_deref())
}

/// `academic_year_id` defaults to the semester's own year.
fn year_for_semester(
    conn: &Connection,
    params: &serde_json::Value,
    semester_id: &str,
) -> AppResult<String> {
    match optional_id(params, "academic_year_id")? {
        Some(year) => Ok(year),
        None => Ok(grading::semester_info(conn, semester_id)?.academic_year_id),
    }
}

fn handle_profile(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let conn = state.conn()?;
    let student = reader(conn, req)?;
    Ok(reports::profile(&student))
}

fn handle_semester(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let conn = state.conn()?;
    let student = reader(conn, req)?;
    let semester_id = required_id(&req.params, "semester_id")?;
    let year = year_for_semester(conn, &req.params, &semester_id)?;
    reports::semester_report(conn, &student, &semester_id, &year)
}

fn handle_year(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let conn = state.conn()?;
    let student = reader(conn, req)?;
    let year = required_id(&req.params, "academic_year_id")?;
    reports::year_report(conn, &student, &year)
}

fn handle_subject_grades(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let conn = state.conn()?;
    let student = reader(conn, req)?;
    let subject_id = required_id(&req.params, "subject_id")?;
    let semester_id = required_id(&req.params, "semester_id")?;
    reports::subject_grades(conn, &student, &subject_id, &semester_id)
}

fn handle_rank(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let conn = state.conn()?;
    let student = reader(conn, req)?;
    let semester_id = required_id(&req.params, "semester_id")?;
    let year = year_for_semester(conn, &req.params, &semester_id)?;
    reports::rank(conn, &student, &semester_id, &year)
}

fn handle_children(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = Actor::from_params(&req.params)?;
    actor.require(Capability::ViewChildReport)?;
    let conn = state.conn()?;
    reports::children(conn, &actor.user_id)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "student.profile" => handle_profile(state, req),
        "reports.semester" => handle_semester(state, req),
        "reports.year" => handle_year(state, req),
        "reports.subjectGrades" => handle_subject_grades(state, req),
        "reports.rank" => handle_rank(state, req),
        "parent.children" => handle_children(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
