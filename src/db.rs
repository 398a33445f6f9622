use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Writers wait for each other instead of failing with SQLITE_BUSY.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            semester_number INTEGER NOT NULL,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(academic_year_id, semester_number)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            school_id TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            level INTEGER NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            name TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            class_head_id TEXT,
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(class_head_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_head_year ON classes(class_head_id, academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT,
            class_id TEXT NOT NULL,
            student_code TEXT NOT NULL,
            name TEXT NOT NULL,
            sex TEXT,
            date_of_birth TEXT,
            date_of_admission TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_user ON students(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_parents(
            student_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            relationship TEXT,
            PRIMARY KEY(student_id, parent_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(parent_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_parents_parent ON student_parents(parent_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_types(
            id TEXT PRIMARY KEY,
            school_id TEXT,
            name TEXT NOT NULL,
            default_weight_percent REAL NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teaching_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(class_id, subject_id, academic_year_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teaching_assignments_class ON teaching_assignments(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_weights(
            id TEXT PRIMARY KEY,
            teaching_assignment_id TEXT NOT NULL,
            assessment_type_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            weight_percent REAL NOT NULL,
            FOREIGN KEY(teaching_assignment_id) REFERENCES teaching_assignments(id),
            FOREIGN KEY(assessment_type_id) REFERENCES assessment_types(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            UNIQUE(teaching_assignment_id, assessment_type_id, semester_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            teaching_assignment_id TEXT NOT NULL,
            assessment_type_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            score REAL NOT NULL,
            max_score REAL NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teaching_assignment_id) REFERENCES teaching_assignments(id),
            FOREIGN KEY(assessment_type_id) REFERENCES assessment_types(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_semester_assignment ON marks(semester_id, teaching_assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS promotion_criteria(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            passing_average REAL NOT NULL,
            passing_per_subject REAL NOT NULL,
            max_failing_subjects INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_semester_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            total_score REAL NOT NULL,
            average_score REAL NOT NULL,
            rank_in_class INTEGER NOT NULL,
            subjects_count INTEGER NOT NULL,
            failing_subjects INTEGER NOT NULL,
            remark TEXT NOT NULL,
            is_published INTEGER NOT NULL DEFAULT 0,
            published_at TEXT,
            compiled_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(student_id, semester_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semester_results_scope ON student_semester_results(class_id, semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_subject_scores(
            result_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY(result_id, subject_id),
            FOREIGN KEY(result_id) REFERENCES student_semester_results(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_year_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            total_score REAL NOT NULL,
            average_score REAL NOT NULL,
            rank_in_class INTEGER NOT NULL,
            subjects_count INTEGER NOT NULL,
            failing_subjects INTEGER NOT NULL,
            remark TEXT NOT NULL,
            is_published INTEGER NOT NULL DEFAULT 0,
            published_at TEXT,
            compiled_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(student_id, academic_year_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_year_results_scope ON student_year_results(class_id, academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS year_subject_scores(
            result_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY(result_id, subject_id),
            FOREIGN KEY(result_id) REFERENCES student_year_results(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    // semester_key is '' for a year roster so the unique key stays total.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rosters(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            semester_key TEXT NOT NULL,
            kind TEXT NOT NULL,
            students_count INTEGER NOT NULL,
            class_average REAL NOT NULL,
            payload TEXT NOT NULL,
            payload_sha256 TEXT NOT NULL,
            sent_by TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(class_id, academic_year_id, semester_key, kind)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            recipient_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            ref_key TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(recipient_id) REFERENCES users(id),
            UNIQUE(recipient_id, kind, ref_key)
        )",
        [],
    )?;

    Ok(conn)
}

pub fn table_exists(conn: &Connection, table: &str) -> anyhow::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [table],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_db_is_repeatable() {
        let dir = std::env::temp_dir().join(format!("gradebook-db-{}", uuid::Uuid::new_v4()));
        let conn = open_db(&dir).expect("first open");
        drop(conn);
        let conn = open_db(&dir).expect("second open");
        for table in [
            "marks",
            "student_semester_results",
            "result_subject_scores",
            "student_year_results",
            "rosters",
            "notifications",
        ] {
            assert!(table_exists(&conn, table).expect("query"), "{table}");
        }
        drop(conn);
        let _ = std::fs::remove_dir_all(dir);
    }
}
