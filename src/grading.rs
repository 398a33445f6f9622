//! Compilation and publication of class results.
//!
//! Every workflow here that writes runs inside one `BEGIN IMMEDIATE`
//! transaction: SQLite hands out its write lock up front, so two compiles or
//! publishes can never interleave, and a failure leaves the scope untouched.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;

use crate::calc::{self, MarkRow, PromotionCriteria, StudentScores, SubjectScore};
use crate::error::{AppError, AppResult};
use crate::roster;

#[derive(Debug, Clone, Serialize)]
pub struct ClassScope {
    pub class_id: String,
    pub class_name: String,
    pub grade_name: String,
    pub academic_year_id: String,
    pub academic_year_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemesterInfo {
    pub id: String,
    pub name: String,
    pub semester_number: i64,
    pub academic_year_id: String,
}

pub fn begin_immediate(conn: &Connection) -> AppResult<Transaction<'_>> {
    Ok(Transaction::new_unchecked(
        conn,
        TransactionBehavior::Immediate,
    )?)
}

pub fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn academic_year_name(conn: &Connection, academic_year_id: &str) -> AppResult<String> {
    conn.query_row(
        "SELECT name FROM academic_years WHERE id = ?",
        [academic_year_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("academic year not found"))
}

/// The class a class head leads in the given academic year.
pub fn class_for_head(
    conn: &Connection,
    head_user_id: &str,
    academic_year_id: &str,
) -> AppResult<ClassScope> {
    let academic_year_name = academic_year_name(conn, academic_year_id)?;
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT c.id, c.name, g.name
             FROM classes c
             JOIN grades g ON g.id = c.grade_id
             WHERE c.class_head_id = ? AND c.academic_year_id = ?
             ORDER BY c.id
             LIMIT 1",
            (head_user_id, academic_year_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((class_id, class_name, grade_name)) = row else {
        return Err(AppError::not_found(
            "no class is assigned to this class head for the academic year",
        ));
    };
    Ok(ClassScope {
        class_id,
        class_name,
        grade_name,
        academic_year_id: academic_year_id.to_string(),
        academic_year_name,
    })
}

pub fn semester_info(conn: &Connection, semester_id: &str) -> AppResult<SemesterInfo> {
    conn.query_row(
        "SELECT id, name, semester_number, academic_year_id FROM semesters WHERE id = ?",
        [semester_id],
        |r| {
            Ok(SemesterInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                semester_number: r.get(2)?,
                academic_year_id: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("semester not found"))
}

pub fn semester_in_year(
    conn: &Connection,
    semester_id: &str,
    academic_year_id: &str,
) -> AppResult<SemesterInfo> {
    let sem = semester_info(conn, semester_id)?;
    if sem.academic_year_id != academic_year_id {
        return Err(AppError::not_found(
            "semester does not belong to the academic year",
        ));
    }
    Ok(sem)
}

pub fn active_criteria(conn: &Connection) -> AppResult<PromotionCriteria> {
    let row = conn
        .query_row(
            "SELECT passing_average, passing_per_subject, max_failing_subjects
             FROM promotion_criteria
             WHERE is_active = 1
             ORDER BY id
             LIMIT 1",
            [],
            |r| {
                Ok(PromotionCriteria {
                    passing_average: r.get(0)?,
                    passing_per_subject: r.get(1)?,
                    max_failing_subjects: r.get(2)?,
                })
            },
        )
        .optional()?;
    match row {
        Some(c) => Ok(c),
        None => {
            tracing::warn!("no active promotion criteria; using standard criteria");
            Ok(PromotionCriteria::default())
        }
    }
}

pub fn load_mark_rows(
    conn: &Connection,
    class_id: &str,
    semester_id: &str,
) -> AppResult<Vec<MarkRow>> {
    let mut stmt = conn.prepare(
        "SELECT m.student_id, ta.subject_id, s.name, m.score, m.max_score,
                COALESCE(aw.weight_percent, aty.default_weight_percent)
         FROM marks m
         JOIN teaching_assignments ta ON ta.id = m.teaching_assignment_id
         JOIN subjects s ON s.id = ta.subject_id
         JOIN assessment_types aty ON aty.id = m.assessment_type_id
         JOIN students st ON st.id = m.student_id AND st.class_id = ta.class_id
         LEFT JOIN assessment_weights aw
                ON aw.teaching_assignment_id = m.teaching_assignment_id
               AND aw.assessment_type_id = m.assessment_type_id
               AND aw.semester_id = m.semester_id
         WHERE ta.class_id = ? AND m.semester_id = ?
         ORDER BY m.student_id, ta.subject_id, m.created_at, m.id",
    )?;
    let rows = stmt
        .query_map((class_id, semester_id), |r| {
            Ok(MarkRow {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                subject_name: r.get(2)?,
                score: r.get(3)?,
                max_score: r.get(4)?,
                weight_percent: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn class_student_ids(conn: &Connection, class_id: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM students WHERE class_id = ? ORDER BY id")?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeCounts {
    pub compiled: i64,
    pub published: i64,
}

pub fn semester_scope_counts(
    conn: &Connection,
    class_id: &str,
    semester_id: &str,
) -> AppResult<ScopeCounts> {
    let (compiled, published) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(is_published), 0)
         FROM student_semester_results
         WHERE class_id = ? AND semester_id = ?",
        (class_id, semester_id),
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
    )?;
    Ok(ScopeCounts {
        compiled,
        published,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileSummary {
    pub class_id: String,
    pub class_name: String,
    pub semester_id: String,
    pub students_compiled: usize,
    pub students_skipped: usize,
    pub class_average: f64,
    pub compiled_at: String,
}

pub fn compile_semester(
    conn: &Connection,
    scope: &ClassScope,
    semester: &SemesterInfo,
    at: DateTime<Utc>,
) -> AppResult<CompileSummary> {
    let tx = begin_immediate(conn)?;

    let counts = semester_scope_counts(&tx, &scope.class_id, &semester.id)?;
    if counts.published > 0 {
        return Err(AppError::conflict(
            "results for this class and semester are already published",
        )
        .with_details(json!({ "students_published": counts.published })));
    }

    let criteria = active_criteria(&tx)?;
    let rows = load_mark_rows(&tx, &scope.class_id, &semester.id)?;
    let mut scored = calc::aggregate_subject_scores(&rows);
    let scored_ids: HashSet<String> = scored.iter().map(|s| s.student_id.clone()).collect();
    for id in class_student_ids(&tx, &scope.class_id)? {
        if !scored_ids.contains(&id) {
            scored.push(StudentScores {
                student_id: id,
                subjects: Vec::new(),
            });
        }
    }
    let compiled = calc::compile_class(scored, &criteria);

    let compiled_at = timestamp(&at);
    let keep: HashSet<&str> = compiled
        .results
        .iter()
        .map(|r| r.student_id.as_str())
        .collect();

    // Full overwrite: rows for students without marks any more go away.
    let stale: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id, student_id FROM student_semester_results
             WHERE class_id = ? AND semester_id = ?",
        )?;
        let rows = stmt
            .query_map((&scope.class_id, &semester.id), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .filter(|(_, sid)| !keep.contains(sid.as_str()))
            .map(|(id, _)| id)
            .collect()
    };
    for result_id in &stale {
        tx.execute(
            "DELETE FROM result_subject_scores WHERE result_id = ?",
            [result_id],
        )?;
        tx.execute(
            "DELETE FROM student_semester_results WHERE id = ?",
            [result_id],
        )?;
    }

    for r in &compiled.results {
        let result_id: Option<String> = tx
            .query_row(
                "INSERT INTO student_semester_results(
                    id, student_id, class_id, semester_id, academic_year_id,
                    total_score, average_score, rank_in_class, subjects_count,
                    failing_subjects, remark, is_published, published_at, compiled_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)
                 ON CONFLICT(student_id, semester_id) DO UPDATE SET
                    class_id = excluded.class_id,
                    academic_year_id = excluded.academic_year_id,
                    total_score = excluded.total_score,
                    average_score = excluded.average_score,
                    rank_in_class = excluded.rank_in_class,
                    subjects_count = excluded.subjects_count,
                    failing_subjects = excluded.failing_subjects,
                    remark = excluded.remark,
                    compiled_at = excluded.compiled_at
                 WHERE student_semester_results.is_published = 0
                 RETURNING id",
                rusqlite::params![
                    uuid::Uuid::new_v4().to_string(),
                    r.student_id,
                    scope.class_id,
                    semester.id,
                    scope.academic_year_id,
                    r.total,
                    r.average,
                    r.rank,
                    r.subjects_count,
                    r.failing_subjects,
                    r.remark.as_str(),
                    compiled_at,
                ],
                |row| row.get(0),
            )
            .optional()?;
        let Some(result_id) = result_id else {
            return Err(AppError::conflict(
                "a published result already exists for a student in this semester",
            )
            .with_details(json!({ "student_id": r.student_id })));
        };
        write_subject_snapshot(&tx, "result_subject_scores", &result_id, &r.subjects)?;
    }

    tx.commit()?;

    tracing::info!(
        class_id = %scope.class_id,
        semester_id = %semester.id,
        compiled = compiled.results.len(),
        skipped = compiled.skipped.len(),
        class_average = compiled.class_average,
        "compiled semester results"
    );

    Ok(CompileSummary {
        class_id: scope.class_id.clone(),
        class_name: scope.class_name.clone(),
        semester_id: semester.id.clone(),
        students_compiled: compiled.results.len(),
        students_skipped: compiled.skipped.len(),
        class_average: compiled.class_average,
        compiled_at,
    })
}

fn write_subject_snapshot(
    conn: &Connection,
    table: &str,
    result_id: &str,
    subjects: &[SubjectScore],
) -> AppResult<()> {
    conn.execute(
        &format!("DELETE FROM {table} WHERE result_id = ?"),
        [result_id],
    )?;
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {table}(result_id, subject_id, subject_name, score) VALUES(?, ?, ?, ?)"
    ))?;
    for s in subjects {
        stmt.execute((result_id, &s.subject_id, &s.name, s.score))?;
    }
    Ok(())
}

/// Compiled subject scores for one class+semester, optionally published rows only.
pub fn load_semester_scores(
    conn: &Connection,
    class_id: &str,
    semester_id: &str,
    published_only: bool,
) -> AppResult<Vec<StudentScores>> {
    let mut stmt = conn.prepare(
        "SELECT r.student_id, ss.subject_id, ss.subject_name, ss.score
         FROM student_semester_results r
         JOIN result_subject_scores ss ON ss.result_id = r.id
         WHERE r.class_id = ? AND r.semester_id = ? AND (? = 0 OR r.is_published = 1)
         ORDER BY r.student_id, ss.subject_name, ss.subject_id",
    )?;
    let rows = stmt
        .query_map(
            (class_id, semester_id, if published_only { 1 } else { 0 }),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    SubjectScore {
                        subject_id: r.get(1)?,
                        name: r.get(2)?,
                        score: r.get(3)?,
                    },
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: Vec<StudentScores> = Vec::new();
    for (student_id, subject) in rows {
        match out.last_mut() {
            Some(last) if last.student_id == student_id => last.subjects.push(subject),
            _ => out.push(StudentScores {
                student_id,
                subjects: vec![subject],
            }),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct RankingItem {
    pub student_id: String,
    pub student_code: String,
    pub name: String,
    pub rank: i64,
    pub total: f64,
    pub average: f64,
    pub remark: String,
    pub subjects_count: i64,
    pub failing_subjects: i64,
    pub is_published: bool,
}

pub fn rankings(
    conn: &Connection,
    scope: &ClassScope,
    semester: &SemesterInfo,
) -> AppResult<serde_json::Value> {
    let mut stmt = conn.prepare(
        "SELECT r.student_id, st.student_code, st.name, r.rank_in_class, r.total_score,
                r.average_score, r.remark, r.subjects_count, r.failing_subjects, r.is_published
         FROM student_semester_results r
         JOIN students st ON st.id = r.student_id
         WHERE r.class_id = ? AND r.semester_id = ?
         ORDER BY r.rank_in_class, r.student_id",
    )?;
    let items = stmt
        .query_map((&scope.class_id, &semester.id), |r| {
            Ok(RankingItem {
                student_id: r.get(0)?,
                student_code: r.get(1)?,
                name: r.get(2)?,
                rank: r.get(3)?,
                total: r.get(4)?,
                average: r.get(5)?,
                remark: r.get(6)?,
                subjects_count: r.get(7)?,
                failing_subjects: r.get(8)?,
                is_published: r.get::<_, i64>(9)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if items.is_empty() {
        return Err(AppError::not_found(
            "grades have not been compiled for this semester",
        ));
    }
    let averages: Vec<f64> = items.iter().map(|i| i.average).collect();
    Ok(json!({
        "class_id": scope.class_id,
        "class_name": scope.class_name,
        "semester": semester.name,
        "items": items,
        "class_average": calc::round_2dp(calc::mean(&averages)),
    }))
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishSummary {
    pub students_published: i64,
    pub newly_published: usize,
    pub published_at: Option<String>,
}

/// Compiled -> Published for every result of the class in the semester.
/// Already-published rows keep their original timestamp.
pub fn publish_semester(
    conn: &Connection,
    scope: &ClassScope,
    semester: &SemesterInfo,
    at: DateTime<Utc>,
) -> AppResult<PublishSummary> {
    let tx = begin_immediate(conn)?;
    let counts = semester_scope_counts(&tx, &scope.class_id, &semester.id)?;
    if counts.compiled == 0 {
        return Err(AppError::not_found(
            "no compiled results to publish; compile grades first",
        ));
    }
    let newly_published = tx.execute(
        "UPDATE student_semester_results
         SET is_published = 1, published_at = ?
         WHERE class_id = ? AND semester_id = ? AND is_published = 0",
        (timestamp(&at), &scope.class_id, &semester.id),
    )?;
    let published_at: Option<String> = tx.query_row(
        "SELECT MAX(published_at) FROM student_semester_results
         WHERE class_id = ? AND semester_id = ?",
        (&scope.class_id, &semester.id),
        |r| r.get(0),
    )?;
    tx.commit()?;

    tracing::info!(
        class_id = %scope.class_id,
        semester_id = %semester.id,
        newly_published,
        total = counts.compiled,
        "published semester results"
    );

    Ok(PublishSummary {
        students_published: counts.compiled,
        newly_published,
        published_at,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YearPublishOptions {
    pub notify_students: bool,
    pub notify_parents: bool,
    pub send_to_store_house: bool,
}

pub fn publish_year(
    conn: &Connection,
    scope: &ClassScope,
    sent_by: &str,
    options: YearPublishOptions,
    at: DateTime<Utc>,
) -> AppResult<serde_json::Value> {
    let tx = begin_immediate(conn)?;

    let semester_ids: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM semesters WHERE academic_year_id = ? ORDER BY semester_number",
        )?;
        let ids = stmt
            .query_map([&scope.academic_year_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let mut per_semester: Vec<Vec<StudentScores>> = Vec::new();
    let mut included: Vec<String> = Vec::new();
    for semester_id in &semester_ids {
        let counts = semester_scope_counts(&tx, &scope.class_id, semester_id)?;
        if counts.compiled == 0 {
            continue;
        }
        if counts.published < counts.compiled {
            return Err(AppError::conflict(
                "semester results must be published before the year is published",
            )
            .with_details(json!({ "semester_id": semester_id })));
        }
        per_semester.push(load_semester_scores(&tx, &scope.class_id, semester_id, true)?);
        included.push(semester_id.clone());
    }
    if included.is_empty() {
        return Err(AppError::conflict(
            "no published semester results exist for this academic year",
        ));
    }

    let criteria = active_criteria(&tx)?;
    let compiled = calc::compile_class(calc::year_subject_scores(&per_semester), &criteria);
    let stamp = timestamp(&at);

    let keep: HashSet<&str> = compiled
        .results
        .iter()
        .map(|r| r.student_id.as_str())
        .collect();
    let stale: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id, student_id FROM student_year_results
             WHERE class_id = ? AND academic_year_id = ?",
        )?;
        let rows = stmt
            .query_map((&scope.class_id, &scope.academic_year_id), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .filter(|(_, sid)| !keep.contains(sid.as_str()))
            .map(|(id, _)| id)
            .collect()
    };
    for result_id in &stale {
        tx.execute("DELETE FROM year_subject_scores WHERE result_id = ?", [result_id])?;
        tx.execute("DELETE FROM student_year_results WHERE id = ?", [result_id])?;
    }

    for r in &compiled.results {
        let result_id: String = tx.query_row(
            "INSERT INTO student_year_results(
                id, student_id, class_id, academic_year_id, total_score, average_score,
                rank_in_class, subjects_count, failing_subjects, remark,
                is_published, published_at, compiled_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(student_id, academic_year_id) DO UPDATE SET
                class_id = excluded.class_id,
                total_score = excluded.total_score,
                average_score = excluded.average_score,
                rank_in_class = excluded.rank_in_class,
                subjects_count = excluded.subjects_count,
                failing_subjects = excluded.failing_subjects,
                remark = excluded.remark,
                is_published = 1,
                published_at = COALESCE(student_year_results.published_at, excluded.published_at),
                compiled_at = excluded.compiled_at
             RETURNING id",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                r.student_id,
                scope.class_id,
                scope.academic_year_id,
                r.total,
                r.average,
                r.rank,
                r.subjects_count,
                r.failing_subjects,
                r.remark.as_str(),
                stamp,
                stamp,
            ],
            |row| row.get(0),
        )?;
        write_subject_snapshot(&tx, "year_subject_scores", &result_id, &r.subjects)?;
    }

    let student_ids: Vec<&str> = compiled
        .results
        .iter()
        .map(|r| r.student_id.as_str())
        .collect();
    let mut notifications_sent = 0usize;
    let message = format!(
        "{} results for class {} are published.",
        scope.academic_year_name, scope.class_name
    );
    if options.notify_students {
        notifications_sent += notify(
            &tx,
            "SELECT user_id FROM students WHERE id = ? AND user_id IS NOT NULL",
            &student_ids,
            "year_results_published",
            &scope.academic_year_id,
            &message,
            &stamp,
        )?;
    }
    if options.notify_parents {
        notifications_sent += notify(
            &tx,
            "SELECT parent_id FROM student_parents WHERE student_id = ?",
            &student_ids,
            "child_year_results_published",
            &scope.academic_year_id,
            &message,
            &stamp,
        )?;
    }

    let roster = if options.send_to_store_house {
        let payload = roster::build_year_payload(&tx, scope, at)?;
        Some(roster::store_roster(
            &tx,
            scope,
            None,
            roster::RosterKind::Year,
            payload,
            sent_by,
            at,
        )?)
    } else {
        None
    };

    tx.commit()?;

    tracing::info!(
        class_id = %scope.class_id,
        academic_year_id = %scope.academic_year_id,
        students = compiled.results.len(),
        notifications_sent,
        roster_sent = roster.is_some(),
        "published year results"
    );

    Ok(json!({
        "class_id": scope.class_id,
        "class_name": scope.class_name,
        "academic_year_id": scope.academic_year_id,
        "semesters_included": included,
        "students_published": compiled.results.len(),
        "class_average": compiled.class_average,
        "published_at": stamp,
        "notifications_sent": notifications_sent,
        "roster": roster,
    }))
}

/// One notification per recipient and reference; repeats are ignored.
fn notify(
    conn: &Connection,
    recipients_sql: &str,
    student_ids: &[&str],
    kind: &str,
    ref_key: &str,
    message: &str,
    created_at: &str,
) -> AppResult<usize> {
    let mut recipients: Vec<String> = Vec::new();
    {
        let mut stmt = conn.prepare(recipients_sql)?;
        for sid in student_ids {
            let ids = stmt
                .query_map([sid], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            recipients.extend(ids);
        }
    }
    recipients.sort();
    recipients.dedup();

    let mut inserted = 0usize;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO notifications(id, recipient_id, kind, ref_key, message, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
    )?;
    for recipient in &recipients {
        inserted += stmt.execute((
            uuid::Uuid::new_v4().to_string(),
            recipient,
            kind,
            ref_key,
            message,
            created_at,
        ))?;
    }
    Ok(inserted)
}
