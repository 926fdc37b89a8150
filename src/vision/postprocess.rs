//! Post-processing for PaddleOCR model outputs
//!
//! Turns the DB detection probability map into text boxes and decodes CTC
//! recognition output into strings.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array2;
use std::collections::BTreeMap;

use super::Bounds;

/// Rows closer than this (in pixels) are treated as one line of text
const SAME_LINE_TOLERANCE: u32 = 10;

/// Thresholds for box extraction from the detection map
#[derive(Debug, Clone)]
pub struct BoxParams {
    /// Pixel probability threshold for the binary text mask
    pub det_threshold: f32,
    /// Minimum mean probability over a component to keep its box
    pub box_threshold: f32,
    /// Box expansion ratio (DB "unclip")
    pub unclip_ratio: f32,
    /// Minimum box side length in map pixels
    pub min_box_size: u32,
}

impl Default for BoxParams {
    fn default() -> Self {
        Self {
            det_threshold: 0.3,
            box_threshold: 0.6,
            unclip_ratio: 1.5,
            min_box_size: 3,
        }
    }
}

/// A box in detection-map coordinates with its mean score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub score: f32,
}

impl ScoredBox {
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    /// Expand the box outward by `area * ratio / perimeter` on every side
    pub fn unclip(&self, ratio: f32) -> Self {
        let (w, h) = (self.width(), self.height());
        let perimeter = 2.0 * (w + h);
        if perimeter <= 0.0 {
            return *self;
        }
        let distance = w * h * ratio / perimeter;

        Self {
            x0: self.x0 - distance,
            y0: self.y0 - distance,
            x1: self.x1 + distance,
            y1: self.y1 + distance,
            score: self.score,
        }
    }

    /// Map back to original image coordinates, clamped to the image
    pub fn to_image_bounds(&self, scale: f32, img_width: u32, img_height: u32) -> Bounds {
        let scale = if scale > 0.0 { scale } else { 1.0 };
        let clamp = |v: f32, max: u32| (v / scale).round().clamp(0.0, max as f32) as u32;

        let x0 = clamp(self.x0, img_width);
        let y0 = clamp(self.y0, img_height);
        let x1 = clamp(self.x1, img_width);
        let y1 = clamp(self.y1, img_height);

        (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }
}

/// Extract text boxes from a detection probability map (H x W).
///
/// The map is binarized at `det_threshold` into a mask and labelled into
/// 4-connected components; each component yields its bounding rectangle
/// scored by the mean probability inside the component.
pub fn extract_boxes(prob_map: &Array2<f32>, params: &BoxParams) -> Vec<ScoredBox> {
    let (height, width) = prob_map.dim();
    if height == 0 || width == 0 {
        return Vec::new();
    }

    let mask = binarize(prob_map, params.det_threshold);
    let labels = connected_components(&mask, Connectivity::Four, Luma([0u8]));

    let mut components: BTreeMap<u32, Component> = BTreeMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        components
            .entry(label)
            .or_insert_with(|| Component::new(x, y))
            .add(x, y, prob_map[[y as usize, x as usize]]);
    }

    components
        .into_values()
        .filter(|c| c.width().min(c.height()) >= params.min_box_size)
        .map(|c| c.to_scored_box())
        .filter(|b| b.score >= params.box_threshold)
        .map(|b| b.unclip(params.unclip_ratio))
        .collect()
}

/// Binary text mask: 255 where the probability exceeds `threshold`
fn binarize(prob_map: &Array2<f32>, threshold: f32) -> GrayImage {
    let (height, width) = prob_map.dim();
    let mut mask = GrayImage::new(width as u32, height as u32);
    for ((y, x), &p) in prob_map.indexed_iter() {
        if p > threshold {
            mask.put_pixel(x as u32, y as u32, Luma([255]));
        }
    }
    mask
}

/// Running bounds and score of one labelled component
struct Component {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    score_sum: f32,
    count: usize,
}

impl Component {
    fn new(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            score_sum: 0.0,
            count: 0,
        }
    }

    fn add(&mut self, x: u32, y: u32, score: f32) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
        self.score_sum += score;
        self.count += 1;
    }

    fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    fn to_scored_box(&self) -> ScoredBox {
        ScoredBox {
            x0: self.min_x as f32,
            y0: self.min_y as f32,
            x1: (self.max_x + 1) as f32,
            y1: (self.max_y + 1) as f32,
            score: self.score_sum / self.count.max(1) as f32,
        }
    }
}

/// Sort boxes top-to-bottom, then left-to-right within a line
pub fn sort_reading_order(boxes: &mut [Bounds]) {
    boxes.sort_by_key(|b| (b.1, b.0));

    for i in 0..boxes.len().saturating_sub(1) {
        for j in (0..=i).rev() {
            let (a, b) = (boxes[j], boxes[j + 1]);
            if a.1.abs_diff(b.1) < SAME_LINE_TOLERANCE && b.0 < a.0 {
                boxes.swap(j, j + 1);
            } else {
                break;
            }
        }
    }
}

/// Greedy CTC decoding of one recognition output (timesteps x vocab).
///
/// Index 0 is the blank token; repeated indices collapse; index `i` maps to
/// `dictionary[i - 1]` and anything past the dictionary decodes as a space.
/// Returns the text and the mean probability of the emitted characters.
pub fn ctc_greedy_decode(
    output: &[f32],
    timesteps: usize,
    vocab_size: usize,
    dictionary: &[String],
) -> (String, f32) {
    let mut text = String::new();
    let mut scores = Vec::new();
    let mut last_index = 0usize;

    for t in 0..timesteps {
        let start = t * vocab_size;
        let Some(row) = output.get(start..start + vocab_size) else {
            break;
        };

        let Some((max_index, max_value)) = row
            .iter()
            .copied()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
        else {
            break;
        };

        if max_index != 0 && max_index != last_index {
            match dictionary.get(max_index - 1) {
                Some(ch) => text.push_str(ch),
                None => text.push(' '),
            }
            scores.push(max_value);
        }
        last_index = max_index;
    }

    let confidence = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f32>() / scores.len() as f32
    };

    (text.trim().to_string(), confidence)
}
