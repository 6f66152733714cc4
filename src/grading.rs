//! # Grading Engine
//!
//! Scores decoded sheets against per-exam answer keys and resolves student
//! identity from the roster.
//!
//! One sheet produces one [`ExamResult`]: either a fully populated
//! [`GradedExam`] or a [`FailedExam`] carrying an error and a suggestion.
//! On disk both serialize to the same flat record shape.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::Answers;
use crate::errors::{AppError, AppResult, GradingError};

/// One roster entry, keyed by the code bubbled on the sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    #[serde(alias = "coords")]
    pub student_code: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub question: u32,
    pub answer: String,
}

/// Correct answers of one exam variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerKey {
    pub exam_code: String,
    pub answers: Vec<KeyEntry>,
}

impl AnswerKey {
    /// Question → correct option. A repeated question keeps its last entry.
    pub fn correct_answers(&self) -> BTreeMap<u32, &str> {
        self.answers
            .iter()
            .map(|entry| (entry.question, entry.answer.as_str()))
            .collect()
    }
}

/// Outcome of a single question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Correct,
    Wrong,
    Blank,
    /// More than one option marked, scored as wrong
    Multi,
}

/// What the student marked for a question that was not left blank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StudentAnswer {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question: u32,
    pub student_answer: Option<StudentAnswer>,
    pub correct_answer: String,
    pub result: Classification,
}

/// Classifies a question from its selected options.
pub fn classify(selected: &[String], correct: &str) -> (Option<StudentAnswer>, Classification) {
    match selected {
        [] => (None, Classification::Blank),
        [only] if only == correct => (
            Some(StudentAnswer::Single(only.clone())),
            Classification::Correct,
        ),
        [only] => (Some(StudentAnswer::Single(only.clone())), Classification::Wrong),
        many => (
            Some(StudentAnswer::Multiple(many.to_vec())),
            Classification::Multi,
        ),
    }
}

/// `correct / total * 10` rounded to two decimals, or 0 when there are no
/// questions.
pub fn compute_score(correct: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_to_cents(correct as f64 / total as f64 * 10.0)
}

/// Rounds to two decimals, half to even, judged on the exact binary value
/// of `value` rather than on the rounded product `value * 100`.
pub fn round_to_cents(value: f64) -> f64 {
    let scaled = value * 100.0;
    let fraction = scaled - scaled.floor();
    let rounded = if fraction == 0.5 {
        // The product may have been rounded onto the tie
        let residual = value.mul_add(100.0, -scaled);
        if residual > 0.0 {
            scaled.ceil()
        } else if residual < 0.0 {
            scaled.floor()
        } else {
            scaled.round_ties_even()
        }
    } else {
        scaled.round()
    };
    rounded / 100.0
}

/// A successfully graded sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct GradedExam {
    pub student_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub student_code: String,
    pub exam_code: String,
    pub total_questions: u32,
    pub correct: u32,
    /// Includes multi-marked questions
    pub wrong: u32,
    pub blank: u32,
    pub score: f64,
    pub image_name: String,
    pub details: Vec<QuestionResult>,
}

/// A sheet that could not be graded.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedExam {
    pub image_name: String,
    pub error: String,
    pub suggestion: String,
    /// Decoded codes when the failure happened after analysis
    pub student_code: Option<String>,
    pub exam_code: Option<String>,
}

impl FailedExam {
    pub fn from_error(error: &GradingError, image_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            error: error.to_string(),
            suggestion: error.suggestion().to_string(),
            student_code: None,
            exam_code: None,
        }
    }

    pub fn with_codes(mut self, student_code: &str, exam_code: &str) -> Self {
        self.student_code = Some(student_code.to_string());
        self.exam_code = Some(exam_code.to_string());
        self
    }
}

/// Outcome of grading one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ExamResultRecord", from = "ExamResultRecord")]
pub enum ExamResult {
    Success(GradedExam),
    Failure(FailedExam),
}

impl ExamResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExamResult::Success(_))
    }

    pub fn image_name(&self) -> &str {
        match self {
            ExamResult::Success(graded) => &graded.image_name,
            ExamResult::Failure(failed) => &failed.image_name,
        }
    }

    pub fn as_success(&self) -> Option<&GradedExam> {
        match self {
            ExamResult::Success(graded) => Some(graded),
            ExamResult::Failure(_) => None,
        }
    }

    pub fn failure(error: &GradingError, image_name: impl Into<String>) -> Self {
        ExamResult::Failure(FailedExam::from_error(error, image_name))
    }
}

/// Flat persisted form shared by successes and failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamResultRecord {
    pub student_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub student_code: Option<String>,
    pub exam_code: Option<String>,
    pub total_questions: u32,
    pub correct: u32,
    pub wrong: u32,
    pub blank: u32,
    pub score: f64,
    pub image_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub details: Vec<QuestionResult>,
}

impl From<ExamResult> for ExamResultRecord {
    fn from(result: ExamResult) -> Self {
        match result {
            ExamResult::Success(g) => Self {
                student_id: g.student_id,
                name: g.name,
                email: g.email,
                student_code: Some(g.student_code),
                exam_code: Some(g.exam_code),
                total_questions: g.total_questions,
                correct: g.correct,
                wrong: g.wrong,
                blank: g.blank,
                score: g.score,
                image_name: g.image_name,
                success: true,
                error: None,
                suggestion: None,
                details: g.details,
            },
            ExamResult::Failure(f) => Self {
                student_id: None,
                name: None,
                email: None,
                student_code: f.student_code,
                exam_code: f.exam_code,
                total_questions: 0,
                correct: 0,
                wrong: 0,
                blank: 0,
                score: 0.0,
                image_name: f.image_name,
                success: false,
                error: Some(f.error),
                suggestion: Some(f.suggestion),
                details: Vec::new(),
            },
        }
    }
}

impl From<ExamResultRecord> for ExamResult {
    fn from(record: ExamResultRecord) -> Self {
        if record.success {
            ExamResult::Success(GradedExam {
                student_id: record.student_id,
                name: record.name,
                email: record.email,
                student_code: record.student_code.unwrap_or_default(),
                exam_code: record.exam_code.unwrap_or_default(),
                total_questions: record.total_questions,
                correct: record.correct,
                wrong: record.wrong,
                blank: record.blank,
                score: record.score,
                image_name: record.image_name,
                details: record.details,
            })
        } else {
            ExamResult::Failure(FailedExam {
                image_name: record.image_name,
                error: record.error.unwrap_or_default(),
                suggestion: record.suggestion.unwrap_or_default(),
                student_code: record.student_code,
                exam_code: record.exam_code,
            })
        }
    }
}

/// Roster and answer keys, fixed for the lifetime of a batch.
#[derive(Debug, Clone, Default)]
pub struct GradingEngine {
    students: HashMap<String, StudentRecord>,
    answer_keys: HashMap<String, AnswerKey>,
}

impl GradingEngine {
    /// Indexes the roster by student code and the keys by exam code. Later
    /// duplicates replace earlier ones.
    pub fn new(roster: Vec<StudentRecord>, answer_keys: Vec<AnswerKey>) -> Self {
        Self {
            students: roster
                .into_iter()
                .map(|s| (s.student_code.clone(), s))
                .collect(),
            answer_keys: answer_keys
                .into_iter()
                .map(|k| (k.exam_code.clone(), k))
                .collect(),
        }
    }

    /// Loads a roster array and an answer-key array from JSON files.
    pub fn from_json_files(
        roster_path: impl AsRef<Path>,
        answer_keys_path: impl AsRef<Path>,
    ) -> AppResult<Self> {
        let roster: Vec<StudentRecord> = read_json(roster_path.as_ref())?;
        let keys: Vec<AnswerKey> = read_json(answer_keys_path.as_ref())?;

        tracing::info!(
            students = roster.len(),
            answer_keys = keys.len(),
            "Grading data loaded"
        );
        Ok(Self::new(roster, keys))
    }

    pub fn student(&self, student_code: &str) -> Option<&StudentRecord> {
        self.students.get(student_code)
    }

    pub fn answer_key(&self, exam_code: &str) -> Option<&AnswerKey> {
        self.answer_keys.get(exam_code)
    }

    pub fn student_count(&self) -> usize {
        self.students.len()
    }

    pub fn answer_key_count(&self) -> usize {
        self.answer_keys.len()
    }

    /// Grades a decoded sheet, failing only when the exam code has no key.
    ///
    /// The denominator is the size of the answer key. Questions absent from
    /// `answers` count as blank.
    pub fn try_grade(
        &self,
        student_code: &str,
        exam_code: &str,
        answers: &Answers,
        image_name: &str,
    ) -> Result<GradedExam, GradingError> {
        let key = self
            .answer_key(exam_code)
            .ok_or_else(|| GradingError::AnswerKeyNotFound {
                exam_code: exam_code.to_string(),
            })?;
        let correct_answers = key.correct_answers();
        let total = correct_answers.len() as u32;

        let (mut correct, mut wrong, mut blank) = (0u32, 0u32, 0u32);
        let mut details = Vec::with_capacity(total as usize);
        for question in 1..=total {
            let expected = correct_answers.get(&question).copied().unwrap_or("");
            let selected = answers.get(&question).map(Vec::as_slice).unwrap_or(&[]);
            let (student_answer, result) = classify(selected, expected);
            match result {
                Classification::Correct => correct += 1,
                Classification::Blank => blank += 1,
                Classification::Wrong | Classification::Multi => wrong += 1,
            }
            details.push(QuestionResult {
                question,
                student_answer,
                correct_answer: expected.to_string(),
                result,
            });
        }

        let student = self.student(student_code);
        let score = compute_score(correct, total);

        tracing::debug!(
            target: "omr_pipeline",
            "Graded {}: exam_code={}, known_student={}, correct={}, wrong={}, blank={}, score={}",
            image_name,
            exam_code,
            student.is_some(),
            correct,
            wrong,
            blank,
            score
        );

        Ok(GradedExam {
            student_id: student.and_then(|s| s.student_id.clone()),
            name: student.and_then(|s| s.name.clone()),
            email: student.and_then(|s| s.email.clone()),
            student_code: student_code.to_string(),
            exam_code: exam_code.to_string(),
            total_questions: total,
            correct,
            wrong,
            blank,
            score,
            image_name: image_name.to_string(),
            details,
        })
    }

    /// Like [`try_grade`](Self::try_grade), folding the failure into a record.
    pub fn grade(
        &self,
        student_code: &str,
        exam_code: &str,
        answers: &Answers,
        image_name: &str,
    ) -> ExamResult {
        match self.try_grade(student_code, exam_code, answers, image_name) {
            Ok(graded) => ExamResult::Success(graded),
            Err(err) => ExamResult::Failure(
                FailedExam::from_error(&err, image_name).with_codes(student_code, exam_code),
            ),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> AppResult<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::FileSystem(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        AppError::Serialization(format!("invalid JSON in {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_000() -> AnswerKey {
        serde_json::from_str(
            r#"{"exam_code":"000","answers":[{"question":1,"answer":"A"},{"question":2,"answer":"B"}]}"#,
        )
        .expect("answer key JSON should parse")
    }

    fn engine() -> GradingEngine {
        let roster = vec![StudentRecord {
            student_code: "123456".to_string(),
            student_id: Some("S-001".to_string()),
            name: Some("Le Van A".to_string()),
            email: Some("a@example.edu".to_string()),
        }];
        GradingEngine::new(roster, vec![key_000()])
    }

    fn answers(pairs: &[(u32, &[&str])]) -> Answers {
        pairs
            .iter()
            .map(|(q, opts)| (*q, opts.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_classify() {
        let a = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(classify(&a(&[]), "A").1, Classification::Blank);
        assert_eq!(classify(&a(&["A"]), "A").1, Classification::Correct);
        assert_eq!(classify(&a(&["C"]), "A").1, Classification::Wrong);
        assert_eq!(classify(&a(&["A", "C"]), "A").1, Classification::Multi);
    }

    #[test]
    fn test_compute_score_rounding() {
        assert_eq!(compute_score(1, 3), 3.33);
        assert_eq!(compute_score(2, 3), 6.67);
        assert_eq!(compute_score(0, 0), 0.0);
        assert_eq!(compute_score(120, 120), 10.0);
    }

    #[test]
    fn test_round_to_cents_ties_go_to_even() {
        assert_eq!(round_to_cents(0.125), 0.12);
        assert_eq!(round_to_cents(0.375), 0.38);
        assert_eq!(round_to_cents(0.625), 0.62);
        assert_eq!(round_to_cents(-0.125), -0.12);
        // 2.675 is stored slightly below the tie
        assert_eq!(round_to_cents(2.675), 2.67);
        assert_eq!(round_to_cents(7.5), 7.5);
    }

    #[test]
    fn test_unknown_student_still_scores() {
        let graded = engine()
            .try_grade("999999", "000", &answers(&[(1, &["A"]), (2, &["B"])]), "x")
            .expect("known exam code should grade");
        assert_eq!(graded.score, 10.0);
        assert_eq!(graded.student_id, None);
        assert_eq!(graded.name, None);
    }

    #[test]
    fn test_known_student_identity() {
        let graded = engine()
            .try_grade("123456", "000", &Answers::new(), "x")
            .expect("known exam code should grade");
        assert_eq!(graded.student_id.as_deref(), Some("S-001"));
        assert_eq!(graded.blank, 2);
        assert_eq!(graded.score, 0.0);
    }

    #[test]
    fn test_roster_accepts_coords_alias() {
        let roster: Vec<StudentRecord> = serde_json::from_str(
            r#"[{"coords":"012345","student_id":"S-9","name":"B","email":null}]"#,
        )
        .expect("roster should parse");
        assert_eq!(roster[0].student_code, "012345");
        assert_eq!(roster[0].email, None);
    }

    #[test]
    fn test_failure_record_shape() {
        let result = engine().grade("123456", "999", &Answers::new(), "img_3");
        let json = serde_json::to_value(&result).expect("result should serialize");

        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Answer key not found for exam code: 999");
        assert_eq!(json["exam_code"], "999");
        assert!(json["suggestion"].is_string());
        assert!(json["student_id"].is_null());
    }

    #[test]
    fn test_success_record_omits_error_fields() {
        let result = engine().grade("123456", "000", &answers(&[(1, &["A"])]), "img_1");
        let json = serde_json::to_value(&result).expect("result should serialize");

        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
        assert!(json.get("suggestion").is_none());
        assert_eq!(json["details"][0]["student_answer"], "A");
        assert_eq!(json["details"][0]["result"], "correct");
        assert!(json["details"][1]["student_answer"].is_null());
        assert_eq!(json["details"][1]["result"], "blank");
    }

    #[test]
    fn test_multi_answer_serializes_as_list() {
        let result = engine().grade("123456", "000", &answers(&[(1, &["A", "B"])]), "img");
        let json = serde_json::to_value(&result).expect("result should serialize");
        assert_eq!(json["details"][0]["student_answer"], serde_json::json!(["A", "B"]));
        assert_eq!(json["details"][0]["result"], "multi");
    }
}
