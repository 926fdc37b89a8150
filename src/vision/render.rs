//! Result rendering: word colors and box overlays

use image::RgbImage;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use super::{ChipColor, TextDetection};

/// Saturated colors readable both as chip backgrounds and as outlines
const PALETTE: [[u8; 3]; 12] = [
    [230, 25, 75],
    [60, 180, 75],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 200, 200],
    [240, 50, 230],
    [170, 110, 40],
    [128, 0, 0],
    [0, 128, 128],
    [0, 0, 128],
    [128, 128, 0],
];

/// Stable color for a word: the same text always gets the same color
pub fn color_for_word(word: &str) -> ChipColor {
    // FNV-1a keeps colors stable across runs and platforms
    let hash = word.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    });
    ChipColor(PALETTE[(hash % PALETTE.len() as u64) as usize])
}

/// Draw each detection as a hollow rectangle `thickness` pixels wide
pub fn draw_detections(image: &mut RgbImage, detections: &[TextDetection], thickness: u32) {
    for detection in detections {
        let (x, y, w, h) = detection.bounds;
        for inset in 0..thickness.max(1) {
            let (rw, rh) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
            if rw == 0 || rh == 0 {
                break;
            }
            let rect = Rect::at((x + inset) as i32, (y + inset) as i32).of_size(rw, rh);
            draw_hollow_rect_mut(image, rect, detection.color.to_rgb());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_color_for_word_is_stable() {
        assert_eq!(color_for_word("exit"), color_for_word("exit"));
        assert!(PALETTE.contains(&color_for_word("").0));

        let distinct: std::collections::HashSet<_> = ["a", "b", "c", "d", "e", "f", "g", "h"]
            .iter()
            .map(|w| color_for_word(w))
            .collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_draw_detections_outlines_box() {
        let mut image = RgbImage::from_pixel(20, 20, Rgb([255, 255, 255]));
        let detections = vec![TextDetection {
            text: "x".to_string(),
            bounds: (2, 2, 10, 8),
            confidence: 1.0,
            color: ChipColor([255, 0, 0]),
        }];

        draw_detections(&mut image, &detections, 2);

        // Outer and inner outline rows are painted
        assert_eq!(*image.get_pixel(2, 2), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(5, 3), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(11, 9), Rgb([255, 0, 0]));
        // Interior untouched
        assert_eq!(*image.get_pixel(6, 6), Rgb([255, 255, 255]));
        // Outside untouched
        assert_eq!(*image.get_pixel(15, 15), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_draw_detections_degenerate_box() {
        let mut image = RgbImage::new(4, 4);
        let detections = vec![TextDetection {
            text: String::new(),
            bounds: (1, 1, 0, 0),
            confidence: 0.0,
            color: ChipColor([9, 9, 9]),
        }];
        draw_detections(&mut image, &detections, 3);
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }
}
