use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Two-decimal rounding applied to every stored score.
pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// One stored mark joined to its subject and effective weight.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkRow {
    pub student_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub score: f64,
    pub max_score: f64,
    pub weight_percent: f64,
}

/// `score / max_score * weight`. A mark without a usable `max_score`
/// contributes nothing.
pub fn weighted_contribution(score: f64, max_score: f64, weight_percent: f64) -> Option<f64> {
    if !(max_score > 0.0) || !score.is_finite() || !weight_percent.is_finite() {
        return None;
    }
    Some(score / max_score * weight_percent)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectScore {
    pub subject_id: String,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentScores {
    pub student_id: String,
    pub subjects: Vec<SubjectScore>,
}

/// Per student, one weighted score per subject that has at least one usable mark.
/// Students come out in id order, subjects in name order.
pub fn aggregate_subject_scores(rows: &[MarkRow]) -> Vec<StudentScores> {
    let mut by_student: BTreeMap<&str, BTreeMap<&str, (&str, f64)>> = BTreeMap::new();
    for r in rows {
        let Some(part) = weighted_contribution(r.score, r.max_score, r.weight_percent) else {
            continue;
        };
        let entry = by_student
            .entry(r.student_id.as_str())
            .or_default()
            .entry(r.subject_id.as_str())
            .or_insert((r.subject_name.as_str(), 0.0));
        entry.1 += part;
    }

    by_student
        .into_iter()
        .map(|(student_id, subjects)| {
            let mut subjects: Vec<SubjectScore> = subjects
                .into_iter()
                .map(|(subject_id, (name, sum))| SubjectScore {
                    subject_id: subject_id.to_string(),
                    name: name.to_string(),
                    score: round_2dp(sum),
                })
                .collect();
            sort_subjects(&mut subjects);
            StudentScores {
                student_id: student_id.to_string(),
                subjects,
            }
        })
        .collect()
}

fn sort_subjects(subjects: &mut [SubjectScore]) {
    subjects.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| a.subject_id.cmp(&b.subject_id))
    });
}

/// Year view: each subject scores the mean of its semester scores, over the
/// semesters in which that subject was scored.
pub fn year_subject_scores(semesters: &[Vec<StudentScores>]) -> Vec<StudentScores> {
    let mut acc: BTreeMap<String, BTreeMap<String, (String, f64, usize)>> = BTreeMap::new();
    for semester in semesters {
        for student in semester {
            let subjects = acc.entry(student.student_id.clone()).or_default();
            for s in &student.subjects {
                let entry = subjects
                    .entry(s.subject_id.clone())
                    .or_insert_with(|| (s.name.clone(), 0.0, 0));
                entry.1 += s.score;
                entry.2 += 1;
            }
        }
    }

    acc.into_iter()
        .map(|(student_id, subjects)| {
            let mut subjects: Vec<SubjectScore> = subjects
                .into_iter()
                .map(|(subject_id, (name, sum, n))| SubjectScore {
                    subject_id,
                    name,
                    score: round_2dp(sum / n as f64),
                })
                .collect();
            sort_subjects(&mut subjects);
            StudentScores {
                student_id,
                subjects,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PromotionCriteria {
    pub passing_average: f64,
    pub passing_per_subject: f64,
    pub max_failing_subjects: i64,
}

impl Default for PromotionCriteria {
    fn default() -> Self {
        Self {
            passing_average: 50.0,
            passing_per_subject: 40.0,
            max_failing_subjects: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Remark {
    Promoted,
    Retained,
}

impl Remark {
    pub fn as_str(self) -> &'static str {
        match self {
            Remark::Promoted => "Promoted",
            Remark::Retained => "Retained",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Promoted" => Some(Remark::Promoted),
            "Retained" => Some(Remark::Retained),
            _ => None,
        }
    }
}

pub fn promotion_remark(
    average: f64,
    failing_subjects: i64,
    criteria: &PromotionCriteria,
) -> Remark {
    if average >= criteria.passing_average && failing_subjects <= criteria.max_failing_subjects {
        Remark::Promoted
    } else {
        Remark::Retained
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledResult {
    pub student_id: String,
    pub total: f64,
    pub average: f64,
    pub rank: i64,
    pub subjects_count: i64,
    pub failing_subjects: i64,
    pub remark: Remark,
    pub subjects: Vec<SubjectScore>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledClass {
    /// Ordered by rank, then student id.
    pub results: Vec<CompiledResult>,
    pub skipped: Vec<String>,
    pub class_average: f64,
}

/// Competition ranking: `1 + number of strictly greater averages`.
pub fn competition_ranks(averages: &[f64]) -> Vec<i64> {
    averages
        .iter()
        .map(|a| 1 + averages.iter().filter(|b| **b > *a).count() as i64)
        .collect()
}

pub fn compile_class(students: Vec<StudentScores>, criteria: &PromotionCriteria) -> CompiledClass {
    let mut skipped = Vec::new();
    let mut results: Vec<CompiledResult> = Vec::new();

    for s in students {
        if s.subjects.is_empty() {
            skipped.push(s.student_id);
            continue;
        }
        let total = round_2dp(s.subjects.iter().map(|x| x.score).sum::<f64>());
        let subjects_count = s.subjects.len() as i64;
        let average = round_2dp(total / subjects_count as f64);
        let failing_subjects = s
            .subjects
            .iter()
            .filter(|x| x.score < criteria.passing_per_subject)
            .count() as i64;
        results.push(CompiledResult {
            student_id: s.student_id,
            total,
            average,
            rank: 0,
            subjects_count,
            failing_subjects,
            remark: promotion_remark(average, failing_subjects, criteria),
            subjects: s.subjects,
        });
    }

    let averages: Vec<f64> = results.iter().map(|r| r.average).collect();
    for (r, rank) in results.iter_mut().zip(competition_ranks(&averages)) {
        r.rank = rank;
    }
    results.sort_by(|a, b| {
        a.rank
            .cmp(&b.rank)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });

    let class_average = if results.is_empty() {
        0.0
    } else {
        round_2dp(averages.iter().sum::<f64>() / averages.len() as f64)
    };

    CompiledClass {
        results,
        skipped,
        class_average,
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
