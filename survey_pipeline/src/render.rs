use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use survey_common::detection::{Channel, EnrichedDetection};
use tracing::warn;

const LABEL_SCALE: f32 = 18.0;
const LABEL_PAD: i32 = 2;

fn channel_color(channel: &Channel) -> Rgb<u8> {
    match channel {
        Channel::Lighting => Rgb([255, 200, 0]),
        Channel::Its => Rgb([0, 200, 255]),
        Channel::Oia => Rgb([0, 220, 90]),
        Channel::Pavement => Rgb([255, 80, 80]),
        Channel::Structures => Rgb([200, 110, 255]),
        Channel::Other(_) => Rgb([220, 220, 220]),
    }
}

/// Draws detection boxes and labels onto frame buffers. Box colors are
/// keyed by source channel so multi-channel output stays attributable.
pub struct Renderer {
    font: Option<FontArc>,
}

impl Renderer {
    pub fn new(font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| match Self::load_font(path) {
            Ok(font) => Some(font),
            Err(err) => {
                warn!(%err, "label font unavailable, drawing boxes only");
                None
            }
        });
        Self { font }
    }

    fn load_font(path: &Path) -> Result<FontArc> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        FontArc::try_from_vec(bytes).context("failed to parse font")
    }

    pub fn annotate(&self, img: &mut RgbImage, detections: &[EnrichedDetection]) {
        let (w, h) = (img.width() as i32, img.height() as i32);

        for det in detections {
            let color = channel_color(&det.channel);
            let x = (det.bbox.x1 as i32).clamp(0, w - 1);
            let y = (det.bbox.y1 as i32).clamp(0, h - 1);
            let bw = (det.bbox.width() as i32).clamp(1, w - x);
            let bh = (det.bbox.height() as i32).clamp(1, h - y);

            let rect = Rect::at(x, y).of_size(bw as u32, bh as u32);
            draw_hollow_rect_mut(img, rect, color);
            // Second ring for visibility at survey resolutions.
            if bw > 2 && bh > 2 {
                draw_hollow_rect_mut(
                    img,
                    Rect::at(x + 1, y + 1).of_size(bw as u32 - 2, bh as u32 - 2),
                    color,
                );
            }

            if let Some(font) = &self.font {
                let label = format!("{} {:.0}%", det.class_name, det.confidence * 100.0);
                let ty = (y - LABEL_SCALE as i32 - LABEL_PAD).max(0);
                let bg = Rect::at(x, ty).of_size(
                    ((label.len() as f32 * LABEL_SCALE * 0.55) as u32).min(img.width()),
                    LABEL_SCALE as u32 + LABEL_PAD as u32,
                );
                draw_filled_rect_mut(img, bg, Rgb([30, 30, 30]));
                draw_text_mut(
                    img,
                    color,
                    x + LABEL_PAD,
                    ty,
                    PxScale::from(LABEL_SCALE),
                    font,
                    &label,
                );
            }
        }
    }
}
