use std::collections::BTreeMap;

use crate::catalog::PASSING_THRESHOLD;
use crate::error::{ProgressError, Result};
use crate::models::Submission;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Score {
    pub total_questions: u32,
    pub correct_count: u32,
    pub percentage: u32,
    pub approved: bool,
}

/// Integer division rounding halves up, matching `round(n / d)` for the
/// non-negative values used here.
pub fn rounded_ratio(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return 0;
    }
    (2 * numerator + denominator) / (2 * denominator)
}

pub fn percentage(correct_count: u32, total_questions: u32) -> u32 {
    rounded_ratio(u64::from(correct_count) * 100, u64::from(total_questions)) as u32
}

pub fn is_approved(percentage: u32) -> bool {
    percentage >= PASSING_THRESHOLD
}

/// Validates a raw submission and scores it.
pub fn score_submission(submission: &Submission) -> Result<Score> {
    if submission.total_questions <= 0 {
        return Err(ProgressError::InvalidSubmission(format!(
            "question count must be positive, got {}",
            submission.total_questions
        )));
    }
    if submission.correct_count < 0 || submission.correct_count > submission.total_questions {
        return Err(ProgressError::InvalidSubmission(format!(
            "correct count {} is outside 0..={}",
            submission.correct_count, submission.total_questions
        )));
    }

    let total_questions = u32::try_from(submission.total_questions).map_err(|_| {
        ProgressError::InvalidSubmission(format!(
            "question count {} is too large",
            submission.total_questions
        ))
    })?;
    let correct_count = submission.correct_count as u32;
    let percentage = percentage(correct_count, total_questions);

    Ok(Score {
        total_questions,
        correct_count,
        percentage,
        approved: is_approved(percentage),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionResult {
    pub question: u32,
    pub given: Option<String>,
    pub expected: String,
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradedSheet {
    pub details: Vec<QuestionResult>,
    pub correct: u32,
    pub total: u32,
    pub percentage: u32,
    pub approved: bool,
}

impl GradedSheet {
    pub fn into_submission(self, answers: BTreeMap<u32, String>) -> Submission {
        Submission {
            total_questions: i64::from(self.total),
            correct_count: i64::from(self.correct),
            answers,
        }
    }
}

/// Grades answers keyed by 1-based question number against an ordered
/// answer key. Comparison ignores surrounding whitespace and case.
pub fn grade(answer_key: &[String], answers: &BTreeMap<u32, String>) -> GradedSheet {
    let details: Vec<QuestionResult> = answer_key
        .iter()
        .zip(1u32..)
        .map(|(expected, question)| {
            let given = answers.get(&question).cloned();
            let correct = given
                .as_deref()
                .map(|value| value.trim().eq_ignore_ascii_case(expected.trim()))
                .unwrap_or(false);
            QuestionResult {
                question,
                given,
                expected: expected.clone(),
                correct,
            }
        })
        .collect();

    let total = details.len() as u32;
    let correct = details.iter().filter(|detail| detail.correct).count() as u32;
    let percentage = percentage(correct, total);

    GradedSheet {
        details,
        correct,
        total,
        percentage,
        approved: total > 0 && is_approved(percentage),
    }
}

/// Parses a comma separated answer list into 1-based question numbers.
/// Blank entries are treated as unanswered.
pub fn parse_answer_list(raw: &str) -> BTreeMap<u32, String> {
    raw.split(',')
        .zip(1u32..)
        .filter_map(|(value, question)| {
            let value = value.trim();
            (!value.is_empty()).then(|| (question, value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(correct: i64, total: i64) -> Submission {
        Submission {
            total_questions: total,
            correct_count: correct,
            answers: BTreeMap::new(),
        }
    }

    #[test]
    fn percentage_rounds_half_up() {
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(1, 8), 13);
        assert_eq!(percentage(0, 5), 0);
        assert_eq!(percentage(5, 5), 100);
    }

    #[test]
    fn exact_threshold_is_approved() {
        let score = score_submission(&submission(7, 10)).unwrap();
        assert_eq!(score.percentage, 70);
        assert!(score.approved);

        let score = score_submission(&submission(69, 100)).unwrap();
        assert!(!score.approved);
    }

    #[test]
    fn percentage_and_approval_agree_for_all_small_sheets() {
        for total in 1..=40i64 {
            for correct in 0..=total {
                let score = score_submission(&submission(correct, total)).unwrap();
                let expected = ((correct * 100) as f64 / total as f64).round() as u32;
                assert_eq!(score.percentage, expected, "{correct}/{total}");
                assert_eq!(score.approved, expected >= 70);
            }
        }
    }

    #[test]
    fn rejects_malformed_submissions() {
        for (correct, total) in [(0, 0), (1, -3), (6, 5), (-1, 5)] {
            let err = score_submission(&submission(correct, total)).unwrap_err();
            assert!(matches!(err, ProgressError::InvalidSubmission(_)));
        }
    }

    #[test]
    fn grades_sheet_against_key() {
        let key: Vec<String> = ["b", "c", "a", "d", "a"].iter().map(|s| s.to_string()).collect();
        let answers = parse_answer_list("b, C,a,,b");

        let sheet = grade(&key, &answers);
        assert_eq!(sheet.total, 5);
        assert_eq!(sheet.correct, 3);
        assert_eq!(sheet.percentage, 60);
        assert!(!sheet.approved);
        assert_eq!(sheet.details[3].given, None);
        assert!(!sheet.details[4].correct);

        let submission = sheet.into_submission(answers.clone());
        assert_eq!(submission.correct_count, 3);
        assert_eq!(submission.answers, answers);
    }
}
