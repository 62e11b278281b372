use image::{DynamicImage, Rgba, RgbaImage};
use std::str::FromStr;

use super::font::{self, GLYPH_HEIGHT};
use super::params::{self, invalid};
use super::{transcode, Operation};
use crate::error::PipelineError;
use crate::types::{OperationKind, Parameters};

const KIND: OperationKind = OperationKind::Watermark;

/// Distance between the text and the image edge.
const MARGIN: u32 = 10;

/// Where the watermark text is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkPosition {
    TopLeft,
    TopCenter,
    TopRight,
    Center,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

impl FromStr for WatermarkPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "top-left" => Ok(Self::TopLeft),
            "top-center" => Ok(Self::TopCenter),
            "top-right" => Ok(Self::TopRight),
            "center" => Ok(Self::Center),
            "bottom-left" => Ok(Self::BottomLeft),
            "bottom-center" => Ok(Self::BottomCenter),
            "bottom-right" => Ok(Self::BottomRight),
            other => Err(format!("unknown position: {other}")),
        }
    }
}

impl WatermarkPosition {
    /// Top-left corner of a `text_w`×`text_h` box inside a `w`×`h` image.
    fn origin(self, w: u32, h: u32, text_w: u32, text_h: u32) -> (u32, u32) {
        let left = MARGIN;
        let right = w.saturating_sub(text_w.saturating_add(MARGIN));
        let hcenter = w.saturating_sub(text_w) / 2;
        let top = MARGIN;
        let bottom = h.saturating_sub(text_h.saturating_add(MARGIN));
        let vcenter = h.saturating_sub(text_h) / 2;
        match self {
            Self::TopLeft => (left, top),
            Self::TopCenter => (hcenter, top),
            Self::TopRight => (right, top),
            Self::Center => (hcenter, vcenter),
            Self::BottomLeft => (left, bottom),
            Self::BottomCenter => (hcenter, bottom),
            Self::BottomRight => (right, bottom),
        }
    }
}

/// Stamp text onto the image with the built-in bitmap font.
pub struct WatermarkOperation {
    default_text: String,
    default_opacity: f64,
    default_font_size: u32,
    max_font_size: u32,
    default_quality: u8,
}

struct WatermarkSettings {
    text: String,
    opacity: f64,
    position: WatermarkPosition,
    font_size: u32,
    quality: u8,
}

impl WatermarkOperation {
    pub fn new(
        default_text: String,
        default_opacity: f64,
        default_font_size: u32,
        max_font_size: u32,
        default_quality: u8,
    ) -> Self {
        Self {
            default_text,
            default_opacity,
            default_font_size,
            max_font_size,
            default_quality,
        }
    }

    fn settings(&self, params: &Parameters) -> Result<WatermarkSettings, PipelineError> {
        let text = params::text(params, "text", KIND)?.unwrap_or(self.default_text.as_str());
        if text.trim().is_empty() {
            return Err(invalid(KIND, "text must not be empty"));
        }
        let opacity = params::float(params, "opacity", KIND)?.unwrap_or(self.default_opacity);
        if !(0.0..=1.0).contains(&opacity) {
            return Err(invalid(
                KIND,
                format!("opacity must be between 0 and 1, got {opacity}"),
            ));
        }
        let position = match params::text(params, "position", KIND)? {
            Some(p) => p.parse().map_err(|e: String| invalid(KIND, e))?,
            None => WatermarkPosition::BottomRight,
        };
        let font_size =
            params::positive(params, "font_size", KIND)?.unwrap_or(self.default_font_size);
        if font_size > self.max_font_size {
            return Err(invalid(
                KIND,
                format!("font_size {font_size} exceeds maximum {}", self.max_font_size),
            ));
        }
        Ok(WatermarkSettings {
            text: text.to_string(),
            opacity,
            position,
            font_size,
            quality: params::quality(params, self.default_quality, KIND)?,
        })
    }
}

fn blend(base: u8, over: u8, alpha: f64) -> u8 {
    (base as f64 * (1.0 - alpha) + over as f64 * alpha).round() as u8
}

fn stamp(canvas: &mut RgbaImage, settings: &WatermarkSettings) {
    let scale = (settings.font_size / GLYPH_HEIGHT).max(1);
    let (text_w, text_h) = font::text_size(&settings.text, scale);
    let (ox, oy) = settings
        .position
        .origin(canvas.width(), canvas.height(), text_w, text_h);
    let ink = Rgba([255u8, 255, 255, 255]);
    let (width, height) = canvas.dimensions();
    let cell = font::ADVANCE.saturating_mul(scale);

    for (i, c) in settings.text.chars().enumerate() {
        let gx = ox.saturating_add(cell.saturating_mul(i as u32));
        if gx >= width {
            break;
        }
        let glyph = font::glyph(c);
        for row in 0..GLYPH_HEIGHT {
            let y0 = oy.saturating_add(row.saturating_mul(scale));
            if y0 >= height {
                break;
            }
            let y1 = y0.saturating_add(scale).min(height);
            for col in 0..font::GLYPH_WIDTH {
                let x0 = gx.saturating_add(col.saturating_mul(scale));
                if x0 >= width {
                    break;
                }
                if !font::is_set(glyph, col, row) {
                    continue;
                }
                let x1 = x0.saturating_add(scale).min(width);
                for y in y0..y1 {
                    for x in x0..x1 {
                        let px = canvas.get_pixel_mut(x, y);
                        for channel in 0..3 {
                            px.0[channel] = blend(px.0[channel], ink.0[channel], settings.opacity);
                        }
                    }
                }
            }
        }
    }
}

impl Operation for WatermarkOperation {
    fn kind(&self) -> OperationKind {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<(), PipelineError> {
        self.settings(params).map(|_| ())
    }

    fn execute(&self, input: &[u8], params: &Parameters) -> Result<Vec<u8>, PipelineError> {
        let settings = self.settings(params)?;
        transcode(input, settings.quality, |image| {
            let mut canvas = image.to_rgba8();
            stamp(&mut canvas, &settings);
            Ok(DynamicImage::ImageRgba8(canvas))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::codec::{self, fixtures};
    use crate::types::ParamValue;
    use image::GenericImageView;

    fn op() -> WatermarkOperation {
        WatermarkOperation::new("lumen".into(), 0.5, 14, 10_000, 85)
    }

    fn black_png(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255])));
        codec::encode(&img, crate::types::ImageFormat::Png, 0).unwrap()
    }

    #[test]
    fn test_position_parsing() {
        assert_eq!(
            "top-left".parse::<WatermarkPosition>(),
            Ok(WatermarkPosition::TopLeft)
        );
        assert!("middle".parse::<WatermarkPosition>().is_err());
    }

    #[test]
    fn test_origin_respects_margin() {
        let (x, y) = WatermarkPosition::BottomRight.origin(200, 100, 50, 14);
        assert_eq!((x, y), (140, 76));
        let (x, y) = WatermarkPosition::TopLeft.origin(200, 100, 50, 14);
        assert_eq!((x, y), (10, 10));
    }

    #[test]
    fn test_stamps_blended_text_at_opacity() {
        let mut p = Parameters::new();
        p.insert("text".into(), ParamValue::Text("L".into()));
        p.insert("position".into(), ParamValue::Text("top-left".into()));
        p.insert("font_size".into(), ParamValue::Int(7));
        let out = op().execute(&black_png(40, 40), &p).unwrap();
        let (image, _) = codec::decode(&out).unwrap();

        // 'L' has its full left column set; scale 1 places it at the margin
        let inked = image.get_pixel(10, 10);
        assert_eq!(inked.0[0], 128);
        let untouched = image.get_pixel(30, 30);
        assert_eq!(untouched.0[0], 0);
    }

    #[test]
    fn test_text_larger_than_image_is_clipped() {
        let mut p = Parameters::new();
        p.insert("text".into(), ParamValue::Text("A VERY LONG WATERMARK".into()));
        p.insert("font_size".into(), ParamValue::Int(70));
        let out = op().execute(&black_png(20, 20), &p).unwrap();
        assert_eq!(codec::dimensions(&out).unwrap(), (20, 20));
    }

    #[test]
    fn test_rejects_font_size_above_limit() {
        let mut p = Parameters::new();
        p.insert("font_size".into(), ParamValue::Int(1_000_000_000));
        let err = op().validate(&p).unwrap_err();
        assert!(err.to_string().contains("font_size 1000000000 exceeds maximum"));
    }

    #[test]
    fn test_huge_text_at_max_font_size_is_clipped() {
        let mut p = Parameters::new();
        p.insert("text".into(), ParamValue::Text("W".repeat(100_000)));
        p.insert("font_size".into(), ParamValue::Int(10_000));
        p.insert("position".into(), ParamValue::Text("top-left".into()));
        let out = op().execute(&black_png(30, 30), &p).unwrap();
        let (image, _) = codec::decode(&out).unwrap();
        // 'W' has its top-left pixel set and one cell covers the whole canvas
        assert_eq!(image.get_pixel(29, 29).0[0], 128);
        assert_eq!(image.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        let mut p = Parameters::new();
        p.insert("opacity".into(), ParamValue::Float(1.5));
        assert!(op().validate(&p).is_err());

        let mut p = Parameters::new();
        p.insert("position".into(), ParamValue::Text("middle".into()));
        let err = op().validate(&p).unwrap_err();
        assert!(err.to_string().contains("unknown position"));

        let mut p = Parameters::new();
        p.insert("text".into(), ParamValue::Text("  ".into()));
        assert!(op().validate(&p).is_err());
    }
}
