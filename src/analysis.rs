//! # Answer Analysis
//!
//! Turns cropped cells into a best-effort decode: the student code, the exam
//! code and the set of options selected for every question. Analysis never
//! fails. Unreadable code digits become a sentinel character and unreadable
//! bubbles simply read as unfilled, leaving the grading stage to decide what
//! an unknown code means.

use std::collections::BTreeMap;

use image::GrayImage;
use imageproc::filter::sharpen3x3;
use serde::{Deserialize, Serialize};

use crate::config::{AnalysisConfig, SheetLayout};
use crate::grid::Cell;
use crate::preprocessing::{apply_clahe, binarize_inverse, count_dark_pixels};

/// Question number → selected option labels, in option order.
pub type Answers = BTreeMap<u32, Vec<String>>;

/// Decoded content of one sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetReading {
    pub student_code: String,
    pub exam_code: String,
    pub answers: Answers,
}

/// Grid position of one option bubble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BubblePosition {
    pub row: usize,
    pub col: usize,
}

#[derive(Debug, Clone)]
pub struct AnswerAnalyzer {
    config: AnalysisConfig,
    layout: SheetLayout,
}

impl AnswerAnalyzer {
    pub fn new(config: AnalysisConfig, layout: SheetLayout) -> Self {
        Self { config, layout }
    }

    /// Foreground pixel count of a bubble after inverse binarization.
    pub fn fill_count(&self, cell: &GrayImage) -> u32 {
        count_dark_pixels(cell, self.config.bin_threshold)
    }

    pub fn is_cell_filled(&self, cell: &GrayImage) -> bool {
        self.fill_count(cell) > self.config.pixel_threshold
    }

    /// Bubble positions of question `question` (1-based), one per option.
    ///
    /// Questions run down a block of `questions_per_block` rows, then continue
    /// in the next block to the right.
    pub fn question_positions(&self, question: u32) -> Vec<BubblePosition> {
        let layout = &self.layout;
        let index = question.saturating_sub(1) as usize;
        let block = index / layout.questions_per_block;
        let row = layout.first_answer_row + index % layout.questions_per_block;
        let col_start = layout.first_answer_col + block * layout.option_labels.len();

        (0..layout.option_labels.len())
            .map(|offset| BubblePosition {
                row,
                col: col_start + offset,
            })
            .collect()
    }

    /// Options read as filled for one question. Missing cells read as unfilled.
    pub fn analyze_question(&self, answer_cells: &[Vec<Cell>], question: u32) -> Vec<String> {
        self.question_positions(question)
            .iter()
            .zip(self.layout.option_labels.iter())
            .filter(|(pos, _)| {
                answer_cells
                    .get(pos.row)
                    .and_then(|row| row.get(pos.col))
                    .is_some_and(|cell| !cell.is_empty() && self.is_cell_filled(&cell.image))
            })
            .map(|(_, label)| label.clone())
            .collect()
    }

    pub fn analyze_answers(&self, answer_cells: &[Vec<Cell>]) -> Answers {
        (1..=self.layout.num_questions as u32)
            .map(|q| (q, self.analyze_question(answer_cells, q)))
            .collect()
    }

    /// Fill count of a code cell after contrast enhancement and sharpening.
    fn code_fill_count(&self, cell: &Cell) -> u32 {
        if cell.is_empty() {
            return 0;
        }
        match apply_clahe(&cell.image, self.config.code_clahe_clip_limit, (8, 8)) {
            Ok(enhanced) => {
                let sharpened = sharpen3x3(&enhanced.image);
                binarize_inverse(&sharpened, self.config.code_bin_threshold).foreground_pixels
            }
            Err(_) => 0,
        }
    }

    /// Decodes a digit-row-major code region with `columns` digits.
    ///
    /// Each column's digit is the row with the highest fill count, ties going
    /// to the lower digit. A column whose best count does not exceed
    /// `code_empty_pixels` decodes to the unknown sentinel.
    pub fn decode_code(&self, cells: &[Cell], columns: usize) -> String {
        let digits = self.layout.code_rows();
        (0..columns)
            .map(|col| {
                let mut best: Option<(usize, u32)> = None;
                for digit in 0..digits {
                    let count = cells
                        .get(digit * columns + col)
                        .map(|cell| self.code_fill_count(cell))
                        .unwrap_or(0);
                    if best.is_none_or(|(_, c)| count > c) {
                        best = Some((digit, count));
                    }
                }
                match best {
                    Some((digit, count)) if count > self.config.code_empty_pixels => {
                        char::from_digit((digit % 10) as u32, 10)
                            .unwrap_or(self.config.unknown_digit)
                    }
                    _ => self.config.unknown_digit,
                }
            })
            .collect()
    }

    /// Decodes a whole sheet.
    pub fn analyze(
        &self,
        answer_cells: &[Vec<Cell>],
        student_code_cells: &[Cell],
        exam_code_cells: &[Cell],
    ) -> SheetReading {
        let start_time = std::time::Instant::now();

        let student_code = self.decode_code(student_code_cells, self.layout.student_code.columns);
        let exam_code = self.decode_code(exam_code_cells, self.layout.exam_code.columns);
        let answers = self.analyze_answers(answer_cells);

        let answered = answers.values().filter(|a| !a.is_empty()).count();
        tracing::debug!(
            target: "omr_pipeline",
            "Sheet analyzed in {}ms: student_code={}, exam_code={}, answered={}/{}",
            start_time.elapsed().as_millis(),
            student_code,
            exam_code,
            answered,
            answers.len()
        );

        SheetReading {
            student_code,
            exam_code,
            answers,
        }
    }
}
