//! Bulk load of the school directory (people, classes, subjects, calendar).
//! Every row is upserted by id, so importing the same document twice is a no-op.

use rusqlite::Connection;
use serde::{Deserialize, Deserializer};
use serde_json::json;

use crate::error::{conflict_on_constraint, AppError, AppResult};
use crate::grading;
use crate::roles::Role;

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or integer id, got {other}"
        ))),
    }
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<serde_json::Value>::deserialize(d)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(serde_json::Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or integer id, got {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct SchoolDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AcademicYearDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SemesterDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub academic_year_id: String,
    pub name: String,
    pub semester_number: i64,
}

#[derive(Debug, Deserialize)]
pub struct UserDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub school_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GradeDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub school_id: String,
    pub level: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ClassDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub grade_id: String,
    pub name: String,
    #[serde(deserialize_with = "de_id")]
    pub academic_year_id: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub class_head_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StudentDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub user_id: Option<String>,
    #[serde(deserialize_with = "de_id")]
    pub class_id: String,
    pub student_code: String,
    pub name: String,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub date_of_admission: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StudentParentDoc {
    #[serde(deserialize_with = "de_id")]
    pub student_id: String,
    #[serde(deserialize_with = "de_id")]
    pub parent_id: String,
    #[serde(default)]
    pub relationship: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubjectDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub school_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AssessmentTypeDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub school_id: Option<String>,
    pub name: String,
    pub default_weight_percent: f64,
}

#[derive(Debug, Deserialize)]
pub struct TeachingAssignmentDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub teacher_id: String,
    #[serde(deserialize_with = "de_id")]
    pub class_id: String,
    #[serde(deserialize_with = "de_id")]
    pub subject_id: String,
    #[serde(deserialize_with = "de_id")]
    pub academic_year_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PromotionCriteriaDoc {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    pub passing_average: f64,
    pub passing_per_subject: f64,
    pub max_failing_subjects: i64,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryDoc {
    pub schools: Vec<SchoolDoc>,
    pub academic_years: Vec<AcademicYearDoc>,
    pub semesters: Vec<SemesterDoc>,
    pub users: Vec<UserDoc>,
    pub grades: Vec<GradeDoc>,
    pub classes: Vec<ClassDoc>,
    pub students: Vec<StudentDoc>,
    pub student_parents: Vec<StudentParentDoc>,
    pub subjects: Vec<SubjectDoc>,
    pub assessment_types: Vec<AssessmentTypeDoc>,
    pub teaching_assignments: Vec<TeachingAssignmentDoc>,
    pub promotion_criteria: Vec<PromotionCriteriaDoc>,
}

pub fn parse_document(value: &serde_json::Value) -> AppResult<DirectoryDoc> {
    DirectoryDoc::deserialize(value)
        .map_err(|e| AppError::validation(format!("invalid directory document: {e}")))
}

fn validate(doc: &DirectoryDoc) -> AppResult<()> {
    for s in &doc.semesters {
        if s.semester_number < 1 {
            return Err(AppError::validation(format!(
                "semester {} must have a positive semester_number",
                s.id
            )));
        }
    }
    for t in &doc.assessment_types {
        if !(0.0..=100.0).contains(&t.default_weight_percent) {
            return Err(AppError::validation(format!(
                "assessment type {} weight must be between 0 and 100",
                t.id
            )));
        }
    }
    for c in &doc.promotion_criteria {
        if c.max_failing_subjects < 0 || !c.passing_average.is_finite() {
            return Err(AppError::validation(format!(
                "promotion criteria {} is not valid",
                c.id
            )));
        }
    }
    if doc.promotion_criteria.iter().filter(|c| c.is_active).count() > 1 {
        return Err(AppError::validation(
            "at most one promotion criteria row may be active",
        ));
    }
    Ok(())
}

pub fn import_directory(conn: &Connection, doc: &DirectoryDoc) -> AppResult<serde_json::Value> {
    validate(doc)?;
    let tx = grading::begin_immediate(conn)?;
    let on_conflict = |e: rusqlite::Error| {
        conflict_on_constraint(e, "directory rows conflict with existing data")
    };

    for s in &doc.schools {
        tx.execute(
            "INSERT INTO schools(id, name) VALUES(?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            (&s.id, &s.name),
        )
        .map_err(on_conflict)?;
    }
    for y in &doc.academic_years {
        tx.execute(
            "INSERT INTO academic_years(id, name, start_date, end_date) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                start_date = excluded.start_date,
                end_date = excluded.end_date",
            (&y.id, &y.name, &y.start_date, &y.end_date),
        )
        .map_err(on_conflict)?;
    }
    for s in &doc.semesters {
        tx.execute(
            "INSERT INTO semesters(id, academic_year_id, name, semester_number) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                academic_year_id = excluded.academic_year_id,
                name = excluded.name,
                semester_number = excluded.semester_number",
            (&s.id, &s.academic_year_id, &s.name, s.semester_number),
        )
        .map_err(on_conflict)?;
    }
    for u in &doc.users {
        tx.execute(
            "INSERT INTO users(id, name, role, school_id) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                role = excluded.role,
                school_id = excluded.school_id",
            (&u.id, &u.name, u.role.as_str(), &u.school_id),
        )
        .map_err(on_conflict)?;
    }
    for g in &doc.grades {
        tx.execute(
            "INSERT INTO grades(id, school_id, level, name) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                school_id = excluded.school_id,
                level = excluded.level,
                name = excluded.name",
            (&g.id, &g.school_id, g.level, &g.name),
        )
        .map_err(on_conflict)?;
    }
    for c in &doc.classes {
        tx.execute(
            "INSERT INTO classes(id, grade_id, name, academic_year_id, class_head_id)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                grade_id = excluded.grade_id,
                name = excluded.name,
                academic_year_id = excluded.academic_year_id,
                class_head_id = excluded.class_head_id",
            (
                &c.id,
                &c.grade_id,
                &c.name,
                &c.academic_year_id,
                &c.class_head_id,
            ),
        )
        .map_err(on_conflict)?;
    }
    for s in &doc.students {
        tx.execute(
            "INSERT INTO students(
                id, user_id, class_id, student_code, name, sex, date_of_birth, date_of_admission
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                class_id = excluded.class_id,
                student_code = excluded.student_code,
                name = excluded.name,
                sex = excluded.sex,
                date_of_birth = excluded.date_of_birth,
                date_of_admission = excluded.date_of_admission",
            (
                &s.id,
                &s.user_id,
                &s.class_id,
                &s.student_code,
                &s.name,
                &s.sex,
                &s.date_of_birth,
                &s.date_of_admission,
            ),
        )
        .map_err(on_conflict)?;
    }
    for l in &doc.student_parents {
        tx.execute(
            "INSERT INTO student_parents(student_id, parent_id, relationship) VALUES(?, ?, ?)
             ON CONFLICT(student_id, parent_id) DO UPDATE SET
                relationship = excluded.relationship",
            (&l.student_id, &l.parent_id, &l.relationship),
        )
        .map_err(on_conflict)?;
    }
    for s in &doc.subjects {
        tx.execute(
            "INSERT INTO subjects(id, school_id, name) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                school_id = excluded.school_id,
                name = excluded.name",
            (&s.id, &s.school_id, &s.name),
        )
        .map_err(on_conflict)?;
    }
    for t in &doc.assessment_types {
        tx.execute(
            "INSERT INTO assessment_types(id, school_id, name, default_weight_percent)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                school_id = excluded.school_id,
                name = excluded.name,
                default_weight_percent = excluded.default_weight_percent",
            (&t.id, &t.school_id, &t.name, t.default_weight_percent),
        )
        .map_err(on_conflict)?;
    }
    for a in &doc.teaching_assignments {
        tx.execute(
            "INSERT INTO teaching_assignments(id, teacher_id, class_id, subject_id, academic_year_id)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                teacher_id = excluded.teacher_id,
                class_id = excluded.class_id,
                subject_id = excluded.subject_id,
                academic_year_id = excluded.academic_year_id",
            (
                &a.id,
                &a.teacher_id,
                &a.class_id,
                &a.subject_id,
                &a.academic_year_id,
            ),
        )
        .map_err(on_conflict)?;
    }
    for c in &doc.promotion_criteria {
        tx.execute(
            "INSERT INTO promotion_criteria(
                id, name, passing_average, passing_per_subject, max_failing_subjects, is_active
             ) VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                passing_average = excluded.passing_average,
                passing_per_subject = excluded.passing_per_subject,
                max_failing_subjects = excluded.max_failing_subjects,
                is_active = excluded.is_active",
            (
                &c.id,
                &c.name,
                c.passing_average,
                c.passing_per_subject,
                c.max_failing_subjects,
                c.is_active,
            ),
        )
        .map_err(on_conflict)?;
    }
    // One active criteria row at a time.
    if let Some(active) = doc.promotion_criteria.iter().find(|c| c.is_active) {
        tx.execute(
            "UPDATE promotion_criteria SET is_active = 0 WHERE id <> ?",
            [&active.id],
        )?;
    }

    tx.commit()?;

    let counts = json!({
        "schools": doc.schools.len(),
        "academic_years": doc.academic_years.len(),
        "semesters": doc.semesters.len(),
        "users": doc.users.len(),
        "grades": doc.grades.len(),
        "classes": doc.classes.len(),
        "students": doc.students.len(),
        "student_parents": doc.student_parents.len(),
        "subjects": doc.subjects.len(),
        "assessment_types": doc.assessment_types.len(),
        "teaching_assignments": doc.teaching_assignments.len(),
        "promotion_criteria": doc.promotion_criteria.len(),
    });
    tracing::info!(counts = %counts, "imported directory");
    Ok(json!({ "imported": counts }))
}
