use crate::core::detector::FaceBox;
use image::DynamicImage;

/// How usable a detected face is for comparison. All scores are in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct QualityMetrics {
    pub detection_confidence: f32,
    pub face_size_ratio: f32,
    pub face_centering_score: f32,
    pub brightness_score: f32,
    pub contrast_score: f32,
    pub overall_score: f32,
}

impl QualityMetrics {
    pub fn calculate(image: &DynamicImage, face: &FaceBox) -> Self {
        let detection_confidence = face.confidence.clamp(0.0, 1.0);

        let img_width = image.width().max(1) as f32;
        let img_height = image.height().max(1) as f32;
        let face_area = (face.x2 - face.x1).max(0.0) * (face.y2 - face.y1).max(0.0);
        let face_size_ratio = (face_area / (img_width * img_height)).min(1.0);

        let center_x = img_width / 2.0;
        let center_y = img_height / 2.0;
        let x_offset = (((face.x1 + face.x2) / 2.0 - center_x).abs() / center_x).min(1.0);
        let y_offset = (((face.y1 + face.y2) / 2.0 - center_y).abs() / center_y).min(1.0);
        let face_centering_score = 1.0 - (x_offset + y_offset) / 2.0;

        let (brightness_score, contrast_score) = brightness_and_contrast(image, face);

        let overall_score = detection_confidence * 0.3
            + size_score(face_size_ratio) * 0.2
            + face_centering_score * 0.2
            + brightness_score * 0.15
            + contrast_score * 0.15;

        Self {
            detection_confidence,
            face_size_ratio,
            face_centering_score,
            brightness_score,
            contrast_score,
            overall_score: overall_score.clamp(0.0, 1.0),
        }
    }
}

/// A face filling 10-50% of the frame is ideal for recognition.
fn size_score(ratio: f32) -> f32 {
    if ratio < 0.1 {
        ratio / 0.1
    } else if ratio > 0.5 {
        (1.0 - (ratio - 0.5) * 2.0).max(0.0)
    } else {
        1.0
    }
}

fn brightness_and_contrast(image: &DynamicImage, face: &FaceBox) -> (f32, f32) {
    let gray = image.to_luma8();

    let x1 = face.x1.max(0.0) as u32;
    let y1 = face.y1.max(0.0) as u32;
    let x2 = (face.x2.max(0.0) as u32).min(gray.width());
    let y2 = (face.y2.max(0.0) as u32).min(gray.height());

    if x2 <= x1 || y2 <= y1 {
        return (0.5, 0.5);
    }

    let mut sum = 0u64;
    let mut sum_sq = 0u64;
    let mut count = 0u64;
    for y in y1..y2 {
        for x in x1..x2 {
            let pixel = gray.get_pixel(x, y)[0] as u64;
            sum += pixel;
            sum_sq += pixel * pixel;
            count += 1;
        }
    }

    let mean = sum as f32 / count as f32;
    let variance = (sum_sq as f32 / count as f32 - mean * mean).max(0.0);

    let brightness = 1.0 - ((mean - 127.5).abs() / 127.5).min(1.0);
    let contrast = (variance.sqrt() / 64.0).min(1.0);
    (brightness, contrast)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn test_black_frame_scores_low() {
        let image = DynamicImage::ImageLuma8(GrayImage::new(100, 100));
        let metrics = QualityMetrics::calculate(&image, &face(30.0, 30.0, 70.0, 70.0, 0.9));
        assert_eq!(metrics.brightness_score, 0.0);
        assert_eq!(metrics.contrast_score, 0.0);
    }

    #[test]
    fn test_centered_textured_face_scores_high() {
        let image = GrayImage::from_fn(100, 100, |x, y| Luma([if (x + y) % 2 == 0 { 64 } else { 192 }]));
        let metrics = QualityMetrics::calculate(&DynamicImage::ImageLuma8(image), &face(25.0, 25.0, 75.0, 75.0, 0.95));
        assert!((metrics.face_centering_score - 1.0).abs() < 1e-6);
        assert!(metrics.overall_score > 0.8, "score {}", metrics.overall_score);
    }

    #[test]
    fn test_box_outside_image_uses_neutral_light_scores() {
        let image = DynamicImage::ImageLuma8(GrayImage::new(10, 10));
        let metrics = QualityMetrics::calculate(&image, &face(20.0, 20.0, 30.0, 30.0, 0.5));
        assert_eq!((metrics.brightness_score, metrics.contrast_score), (0.5, 0.5));
    }
}
