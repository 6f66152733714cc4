//! # Test Helper Library
//!
//! Renders synthetic answer sheets that follow the default sheet layout, plus
//! the roster, answer keys and configuration shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::rect::Rect;
use omr_grader::config::GraderConfig;
use omr_grader::grading::{AnswerKey, GradingEngine, KeyEntry, StudentRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SHEET_WIDTH: u32 = 1300;
pub const SHEET_HEIGHT: u32 = 1700;

const MARK_SIZE: i32 = 14;
const BUBBLE_RADIUS: i32 = 9;
const INK: Luma<u8> = Luma([15]);
const PAPER: Luma<u8> = Luma([255]);

/// Center y of row mark `row`
pub fn row_y(row: usize) -> i32 {
    40 + 36 * row as i32
}

/// Center x of column mark `col`
pub fn col_x(col: usize) -> i32 {
    60 + 60 * col as i32
}

const ROW_MARK_X: i32 = 1265;
const COL_MARK_Y: i32 = 1655;

/// What a student filled in on a sheet.
#[derive(Debug, Clone, Default)]
pub struct SheetMarks {
    pub student_code: String,
    pub exam_code: String,
    /// (question, options) with options as 0-based indices into A-D
    pub answers: Vec<(u32, Vec<usize>)>,
}

impl SheetMarks {
    pub fn new(student_code: &str, exam_code: &str) -> Self {
        Self {
            student_code: student_code.to_string(),
            exam_code: exam_code.to_string(),
            answers: Vec::new(),
        }
    }

    pub fn answer(mut self, question: u32, options: &[usize]) -> Self {
        self.answers.push((question, options.to_vec()));
        self
    }
}

fn square(img: &mut GrayImage, cx: i32, cy: i32, size: i32) {
    let half = size / 2;
    draw_filled_rect_mut(
        img,
        Rect::at(cx - half, cy - half).of_size(size as u32, size as u32),
        INK,
    );
}

/// Random 10 px checker blocks giving the matcher distinctive corners.
fn texture(img: &mut GrayImage, rng: &mut StdRng, x0: i32, y0: i32, x1: i32, y1: i32, dx: i32, dy: i32) {
    let mut y = y0;
    while y < y1 {
        let mut x = x0;
        while x < x1 {
            if rng.random_bool(0.5) {
                draw_filled_rect_mut(img, Rect::at(x + dx, y + dy).of_size(10, 10), INK);
            }
            x += 10;
        }
        y += 10;
    }
}

/// Blank printed sheet shifted by `(dx, dy)`.
pub fn render_blank_sheet(dx: i32, dy: i32) -> GrayImage {
    let mut img = GrayImage::from_pixel(SHEET_WIDTH, SHEET_HEIGHT, PAPER);

    for row in 0..42 {
        square(&mut img, ROW_MARK_X + dx, row_y(row) + dy, MARK_SIZE);
    }
    for col in 0..18 {
        square(&mut img, col_x(col) + dx, COL_MARK_Y + dy, MARK_SIZE);
    }

    // Same seed for every render so template and photos share the print
    let mut rng = StdRng::seed_from_u64(0x5eed_5ee7);
    texture(&mut img, &mut rng, 100, 60, 800, 380, dx, dy);
    texture(&mut img, &mut rng, 100, 1540, 800, 1600, dx, dy);
    texture(&mut img, &mut rng, 1165, 440, 1225, 1480, dx, dy);
    img
}

fn bubble(img: &mut GrayImage, cx: i32, cy: i32) {
    draw_filled_circle_mut(img, (cx, cy), BUBBLE_RADIUS, INK);
}

fn fill_code(img: &mut GrayImage, code: &str, region_x: f32, cell_width: f32, dx: i32, dy: i32) {
    for (i, ch) in code.chars().enumerate() {
        let Some(digit) = ch.to_digit(10) else {
            continue;
        };
        let cx = (region_x + (i as f32 + 0.5) * cell_width).round() as i32;
        bubble(img, cx + dx, row_y(1 + digit as usize) + dy);
    }
}

/// A filled-in sheet shifted by `(dx, dy)`.
pub fn render_sheet(marks: &SheetMarks, dx: i32, dy: i32) -> GrayImage {
    let mut img = render_blank_sheet(dx, dy);

    fill_code(&mut img, &marks.student_code, 892.0, 145.0 / 6.0, dx, dy);
    fill_code(&mut img, &marks.exam_code, 1080.0, 24.0, dx, dy);

    for (question, options) in &marks.answers {
        let index = (*question as usize).saturating_sub(1);
        let row = 11 + index % 30;
        let first_col = 1 + 4 * (index / 30);
        for &option in options {
            bubble(&mut img, col_x(first_col + option) + dx, row_y(row) + dy);
        }
    }
    img
}

/// Places a sheet onto a white `width`×`height` photo through `projection`,
/// which maps sheet pixels to photo pixels.
pub fn photograph(sheet: &GrayImage, projection: &Projection, width: u32, height: u32) -> GrayImage {
    let mut photo = GrayImage::from_pixel(width, height, PAPER);
    warp_into(sheet, projection, Interpolation::Bilinear, PAPER, &mut photo);
    photo
}

pub fn blank_photo() -> GrayImage {
    GrayImage::from_pixel(SHEET_WIDTH, SHEET_HEIGHT, PAPER)
}

pub fn save_png(img: &GrayImage, dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    img.save(&path).expect("PNG should be written");
    path
}

/// Default configuration with a smaller feature budget and room for slow
/// debug builds.
pub fn test_config() -> GraderConfig {
    let mut config = GraderConfig::default();
    config.warp.max_features = 1500;
    config.processor.max_workers = 2;
    config.processor.per_image_timeout_secs = 300;
    config
}

pub fn key(exam_code: &str, answers: &[&str]) -> AnswerKey {
    AnswerKey {
        exam_code: exam_code.to_string(),
        answers: answers
            .iter()
            .enumerate()
            .map(|(i, answer)| KeyEntry {
                question: i as u32 + 1,
                answer: answer.to_string(),
            })
            .collect(),
    }
}

pub fn student(code: &str, id: &str, name: &str) -> StudentRecord {
    StudentRecord {
        student_code: code.to_string(),
        student_id: Some(id.to_string()),
        name: Some(name.to_string()),
        email: Some(format!("{}@school.test", id)),
    }
}

/// Roster with two students and keys for exam codes "000" and "101".
pub fn sample_engine() -> GradingEngine {
    GradingEngine::new(
        vec![
            student("123456", "S001", "Ada Park"),
            student("654321", "S002", "Lin Osei"),
        ],
        vec![key("000", &["A", "B"]), key("101", &["A", "C", "B", "D", "A"])],
    )
}
