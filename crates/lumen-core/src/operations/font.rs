//! Built-in 5x7 bitmap glyphs for watermark text.
//!
//! Each glyph is seven rows; the low five bits of a row are its pixels with
//! bit 4 as the leftmost column. Lowercase letters render as uppercase and any
//! character without a glyph renders as `?`.

pub const GLYPH_WIDTH: u32 = 5;
pub const GLYPH_HEIGHT: u32 = 7;

/// Horizontal advance per character, including one column of spacing.
pub const ADVANCE: u32 = GLYPH_WIDTH + 1;

type Glyph = [u8; GLYPH_HEIGHT as usize];

const QUESTION: Glyph = [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04];

pub fn glyph(c: char) -> &'static Glyph {
    match c.to_ascii_uppercase() {
        'A' => &[0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => &[0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => &[0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => &[0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => &[0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => &[0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => &[0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => &[0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => &[0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => &[0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => &[0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => &[0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => &[0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => &[0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => &[0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => &[0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => &[0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => &[0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => &[0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => &[0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => &[0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => &[0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => &[0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => &[0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => &[0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => &[0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => &[0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => &[0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => &[0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => &[0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => &[0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => &[0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => &[0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => &[0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => &[0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => &[0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ' ' => &[0x00; 7],
        '.' => &[0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => &[0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        ':' => &[0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '!' => &[0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04],
        '/' => &[0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10],
        '@' => &[0x0E, 0x11, 0x01, 0x0D, 0x15, 0x15, 0x0E],
        _ => &QUESTION,
    }
}

/// Whether the pixel at (`col`, `row`) of a glyph is set.
pub fn is_set(glyph: &Glyph, col: u32, row: u32) -> bool {
    col < GLYPH_WIDTH
        && row < GLYPH_HEIGHT
        && glyph[row as usize] & (1 << (GLYPH_WIDTH - 1 - col)) != 0
}

/// Rendered size of `text` at integer `scale`, without trailing spacing.
pub fn text_size(text: &str, scale: u32) -> (u32, u32) {
    let chars = text.chars().count() as u32;
    if chars == 0 {
        return (0, 0);
    }
    let width = chars
        .saturating_mul(ADVANCE)
        .saturating_sub(1)
        .saturating_mul(scale);
    (width, GLYPH_HEIGHT.saturating_mul(scale))
}
