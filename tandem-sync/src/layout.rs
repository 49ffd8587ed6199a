//! Caret measurement from the editor's own text model.
//!
//! The engine never talks to a rendering surface directly. It asks a
//! [`CaretSource`] for the caret's logical offset and its rectangle relative
//! to the editable root. When that rectangle is degenerate (zero width *and*
//! zero height, typical at line ends and in empty blocks) the source is asked
//! to place a zero-width marker at the offset and measure it instead.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Position relative to the editable root, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Both axis deltas to `other` are below `threshold`.
    pub fn within(&self, other: &Point, threshold: f32) -> bool {
        (self.x - other.x).abs() < threshold && (self.y - other.y).abs() < threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CaretRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl CaretRect {
    pub fn is_degenerate(&self) -> bool {
        self.width == 0.0 && self.height == 0.0
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// Caret offset plus its native bounding rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaretProbe {
    /// Characters preceding the caret inside the editable root.
    pub offset: usize,
    pub rect: CaretRect,
}

/// Anything that can report where the local caret is.
pub trait CaretSource: Send {
    /// `None` when the caret is outside the editor.
    fn caret(&self) -> Option<CaretProbe>;

    /// Insert a zero-width marker at `offset`, measure, and remove it.
    fn measure_marker(&self, offset: usize) -> Option<Point>;
}

/// No caret at all (headless sessions).
pub struct NoCaret;

impl CaretSource for NoCaret {
    fn caret(&self) -> Option<CaretProbe> {
        None
    }

    fn measure_marker(&self, _offset: usize) -> Option<Point> {
        None
    }
}

/// Fixed-pitch layout with optional soft wrapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonospaceLayout {
    pub char_width: f32,
    pub line_height: f32,
    pub padding: Point,
    /// Soft wrap after this many columns.
    pub wrap_column: Option<usize>,
}

impl Default for MonospaceLayout {
    fn default() -> Self {
        Self {
            char_width: 8.0,
            line_height: 18.0,
            padding: Point::new(4.0, 4.0),
            wrap_column: None,
        }
    }
}

impl MonospaceLayout {
    /// Visual (row, column) of a character offset.
    pub fn row_col(&self, text: &str, offset: usize) -> (usize, usize) {
        let (mut row, mut col) = (0usize, 0usize);
        for c in text.chars().take(offset) {
            if c == '\n' {
                row += 1;
                col = 0;
                continue;
            }
            col += 1;
            if let Some(wrap) = self.wrap_column.filter(|w| *w > 0) {
                if col >= wrap {
                    row += 1;
                    col = 0;
                }
            }
        }
        (row, col)
    }

    pub fn position(&self, text: &str, offset: usize) -> Point {
        let (row, col) = self.row_col(text, offset);
        Point::new(
            self.padding.x + col as f32 * self.char_width,
            self.padding.y + row as f32 * self.line_height,
        )
    }
}

/// Plain-text editor model: text, caret offset and layout.
#[derive(Debug, Clone, Default)]
pub struct TextModel {
    text: String,
    caret: Option<usize>,
    layout: MonospaceLayout,
}

impl TextModel {
    pub fn new(layout: MonospaceLayout) -> Self {
        Self {
            text: String::new(),
            caret: None,
            layout,
        }
    }

    /// Replace the text; the caret is clamped to the new length.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        let len = self.text.chars().count();
        self.caret = self.caret.map(|c| c.min(len));
    }

    pub fn set_caret(&mut self, offset: Option<usize>) {
        let len = self.text.chars().count();
        self.caret = offset.map(|o| o.min(len));
    }

    /// Put the caret after the last character.
    pub fn caret_to_end(&mut self) {
        self.caret = Some(self.text.chars().count());
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn caret_offset(&self) -> Option<usize> {
        self.caret
    }

    fn at_line_end(&self, offset: usize) -> bool {
        match self.text.chars().nth(offset) {
            None => true,
            Some(c) => c == '\n',
        }
    }
}

impl CaretSource for TextModel {
    fn caret(&self) -> Option<CaretProbe> {
        let offset = self.caret?;
        // Line ends and empty lines have no glyph box to measure.
        let rect = if self.at_line_end(offset) {
            CaretRect::default()
        } else {
            let p = self.layout.position(&self.text, offset);
            CaretRect {
                x: p.x,
                y: p.y,
                width: self.layout.char_width,
                height: self.layout.line_height,
            }
        };
        Some(CaretProbe { offset, rect })
    }

    fn measure_marker(&self, offset: usize) -> Option<Point> {
        Some(self.layout.position(&self.text, offset))
    }
}

/// A [`TextModel`] shared between the editor front end and a session.
#[derive(Debug, Clone, Default)]
pub struct SharedTextModel {
    inner: Arc<Mutex<TextModel>>,
}

impl SharedTextModel {
    pub fn new(model: TextModel) -> Self {
        Self {
            inner: Arc::new(Mutex::new(model)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TextModel> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CaretSource for SharedTextModel {
    fn caret(&self) -> Option<CaretProbe> {
        self.lock().caret()
    }

    fn measure_marker(&self, offset: usize) -> Option<Point> {
        self.lock().measure_marker(offset)
    }
}
