//! Page renderer: decoded notebook pages to a multi-page PDF.
//!
//! Pages are drawn in device pixels on a 1404×1872 canvas; a single
//! transform per page maps that to PDF points at the device's 226 dpi with
//! the origin moved to the top-left corner.

use crate::lines::{Page, Sample, Stroke};
use pdf_writer::types::{LineCapStyle, LineJoinStyle};
use pdf_writer::{Content, Finish, Name, Pdf, Rect, Ref};

pub const CANVAS_WIDTH: f32 = 1404.0;
pub const CANVAS_HEIGHT: f32 = 1872.0;
const DPI: f32 = 226.0;
const SCALE: f32 = 72.0 / DPI;

/// Opacity is quantized to this many steps, one graphics state each.
const ALPHA_STEPS: usize = 20;
const MIN_WIDTH: f32 = 0.5;

/// Drawing tool behind a raw pen code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Brush,
    Pencil,
    Ballpoint,
    Marker,
    Fineliner,
    Highlighter,
    Eraser,
    MechanicalPencil,
    EraseArea,
}

impl Tool {
    /// Map a pen code from any format version. Unknown codes fall back to
    /// the ballpoint.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 | 12 | 21 => Tool::Brush,
            1 | 14 => Tool::Pencil,
            2 | 15 => Tool::Ballpoint,
            3 | 16 => Tool::Marker,
            4 | 17 => Tool::Fineliner,
            5 | 18 => Tool::Highlighter,
            6 => Tool::Eraser,
            7 | 13 => Tool::MechanicalPencil,
            8 => Tool::EraseArea,
            other => {
                tracing::debug!("Unknown pen code {}, drawing as ballpoint", other);
                Tool::Ballpoint
            }
        }
    }

    /// Tools whose width or opacity follows pressure and tilt are drawn
    /// one segment at a time.
    fn is_dynamic(self) -> bool {
        matches!(self, Tool::Brush | Tool::Pencil)
    }

    /// Width in canvas pixels and opacity for a stroke of base width `w`
    /// at `sample`.
    pub fn style(self, w: f32, sample: &Sample) -> (f32, f32) {
        let p = sample.pressure;
        let tilt = sample.tilt;
        let (width, opacity) = match self {
            Tool::Brush => ((5.0 * tilt) * (6.0 * w - 10.0) * (1.0 + 2.0 * p * p * p), 1.0),
            Tool::Pencil => ((10.0 * tilt - 2.0) * (8.0 * w - 14.0), (p - 0.2) * (p - 0.2)),
            Tool::Ballpoint | Tool::Fineliner => (32.0 * w * w - 116.0 * w + 107.0, 1.0),
            Tool::Marker => (64.0 * w - 112.0, 0.9),
            Tool::Highlighter => (30.0, 0.2),
            Tool::Eraser => (1280.0 * w * w - 4800.0 * w + 4510.0, 1.0),
            Tool::MechanicalPencil => (16.0 * w - 27.0, 0.9),
            Tool::EraseArea => (0.0, 0.0),
        };
        let width = if width.is_finite() { width.max(MIN_WIDTH) } else { MIN_WIDTH };
        let opacity = if opacity.is_finite() { opacity.clamp(0.0, 1.0) } else { 1.0 };
        (width, opacity)
    }
}

/// RGB for a raw colour code. The eraser paints white.
fn color_of(tool: Tool, code: u32) -> (f32, f32, f32) {
    if tool == Tool::Eraser {
        return (1.0, 1.0, 1.0);
    }
    match code {
        1 => (0.5, 0.5, 0.5),
        2 => (1.0, 1.0, 1.0),
        _ => (0.0, 0.0, 0.0),
    }
}

fn alpha_index(opacity: f32) -> usize {
    ((opacity * ALPHA_STEPS as f32).round() as usize).min(ALPHA_STEPS)
}

fn alpha_name(index: usize) -> String {
    format!("A{}", index)
}

/// Render pages to a PDF document. No pages gives a single blank page.
pub fn render(pages: &[Page]) -> Vec<u8> {
    let blank = [Page::default()];
    let pages = if pages.is_empty() { &blank[..] } else { pages };

    let catalog_id = Ref::new(1);
    let tree_id = Ref::new(2);
    let alpha_ids: Vec<Ref> = (0..=ALPHA_STEPS).map(|i| Ref::new(3 + i as i32)).collect();
    let first_page = 4 + ALPHA_STEPS as i32;
    let page_ids: Vec<(Ref, Ref)> = (0..pages.len() as i32)
        .map(|i| (Ref::new(first_page + 2 * i), Ref::new(first_page + 2 * i + 1)))
        .collect();
    let alpha_names: Vec<String> = (0..=ALPHA_STEPS).map(alpha_name).collect();

    let media_box = Rect::new(0.0, 0.0, CANVAS_WIDTH * SCALE, CANVAS_HEIGHT * SCALE);

    let mut pdf = Pdf::new();
    pdf.catalog(catalog_id).pages(tree_id);
    pdf.pages(tree_id)
        .kids(page_ids.iter().map(|(page, _)| *page))
        .count(pages.len() as i32);

    for (i, id) in alpha_ids.iter().enumerate() {
        pdf.ext_graphics(*id)
            .stroking_alpha(i as f32 / ALPHA_STEPS as f32);
    }

    for (page, (page_id, content_id)) in pages.iter().zip(&page_ids) {
        let mut writer = pdf.page(*page_id);
        writer.media_box(media_box);
        writer.parent(tree_id);
        writer.contents(*content_id);
        {
            let mut resources = writer.resources();
            let mut states = resources.ext_g_states();
            for (name, id) in alpha_names.iter().zip(&alpha_ids) {
                states.pair(Name(name.as_bytes()), *id);
            }
        }
        writer.finish();

        pdf.stream(*content_id, &draw_page(page));
    }

    pdf.finish()
}

fn draw_page(page: &Page) -> Vec<u8> {
    let mut content = Content::new();
    content.transform([SCALE, 0.0, 0.0, -SCALE, 0.0, CANVAS_HEIGHT * SCALE]);
    content.set_line_cap(LineCapStyle::RoundCap);
    content.set_line_join(LineJoinStyle::RoundJoin);
    for stroke in page.layers.iter().flat_map(|layer| &layer.strokes) {
        draw_stroke(&mut content, stroke);
    }
    content.finish()
}

fn draw_stroke(content: &mut Content, stroke: &Stroke) {
    let tool = Tool::from_code(stroke.pen);
    if tool == Tool::EraseArea || stroke.samples.is_empty() {
        return;
    }
    let (r, g, b) = color_of(tool, stroke.color);
    content.set_stroke_rgb(r, g, b);

    if tool.is_dynamic() {
        for pair in stroke.samples.windows(2) {
            let (width, opacity) = tool.style(stroke.width, &pair[1]);
            set_pen(content, width, opacity);
            content.move_to(pair[0].x, pair[0].y);
            content.line_to(pair[1].x, pair[1].y);
            content.stroke();
        }
        if stroke.samples.len() > 1 {
            return;
        }
    }

    let (width, opacity) = tool.style(stroke.width, &stroke.samples[0]);
    set_pen(content, width, opacity);
    let first = &stroke.samples[0];
    content.move_to(first.x, first.y);
    if stroke.samples.len() == 1 {
        // A single sample is a dot; the round cap gives it a shape.
        content.line_to(first.x, first.y);
    }
    for sample in &stroke.samples[1..] {
        content.line_to(sample.x, sample.y);
    }
    content.stroke();
}

fn set_pen(content: &mut Content, width: f32, opacity: f32) {
    let name = alpha_name(alpha_index(opacity));
    content.set_parameters(Name(name.as_bytes()));
    content.set_line_width(width);
}
