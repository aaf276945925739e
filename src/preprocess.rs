use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageError, Rgb, RgbImage};
use serde::Deserialize;
use thiserror::Error;

/// Contrast gain of the primary pass
pub const CONTRAST_ALPHA: f32 = 1.2;
/// Brightness offset of the primary pass
pub const BRIGHTNESS_BETA: f32 = 30.0;
/// Upscale factor of the enhanced pass
pub const UPSCALE_FACTOR: u32 = 2;
/// Contrast enhancement of the enhanced pass
pub const ENHANCE_CONTRAST: f32 = 1.5;
/// Brightness enhancement of the enhanced pass
pub const ENHANCE_BRIGHTNESS: f32 = 1.2;
/// Rows and columns of the detection grid in the enhanced pass
pub const GRID_SIZE: u32 = 3;

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Invalid image data: {0}")]
    InvalidDataUrl(String),
    #[error("Failed to decode image: {0}")]
    Decode(#[source] ImageError),
    #[error("Failed to encode image: {0}")]
    Encode(#[source] ImageError),
}

/// Which enhancement runs before detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    /// Fixed contrast/brightness scaling, whole-image detection
    #[default]
    Contrast,
    /// Upscale, denoise, equalize, enhance, then detect per grid region
    Enhanced,
}

/// Decoded pixels plus the JPEG bytes sent to the face directory
#[derive(Debug)]
pub struct PreparedImage {
    pub pixels: RgbImage,
    pub jpeg: Vec<u8>,
}

impl PreparedImage {
    pub fn from_pixels(pixels: RgbImage) -> Result<Self, PreprocessError> {
        let jpeg = encode_jpeg(&pixels)?;
        Ok(Self { pixels, jpeg })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

impl Pipeline {
    /// Decode and enhance an uploaded image
    pub fn prepare(&self, bytes: &[u8]) -> Result<PreparedImage, PreprocessError> {
        let decoded = decode(bytes)?;
        let enhanced = match self {
            Pipeline::Contrast => scale_contrast(&decoded, CONTRAST_ALPHA, BRIGHTNESS_BETA),
            Pipeline::Enhanced => {
                let upscaled = upscale(&decoded, UPSCALE_FACTOR);
                let denoised = median_denoise(&upscaled);
                let equalized = equalize_luminance(&denoised);
                let contrasted = enhance_contrast(&equalized, ENHANCE_CONTRAST);
                enhance_brightness(&contrasted, ENHANCE_BRIGHTNESS)
            }
        };
        PreparedImage::from_pixels(enhanced)
    }

    /// Split a prepared image into the regions faces are detected in
    pub fn regions(&self, prepared: PreparedImage) -> Result<Vec<PreparedImage>, PreprocessError> {
        match self {
            Pipeline::Contrast => Ok(vec![prepared]),
            Pipeline::Enhanced => split_grid(&prepared.pixels, GRID_SIZE)
                .into_iter()
                .filter(|r| r.width() > 0 && r.height() > 0)
                .map(PreparedImage::from_pixels)
                .collect(),
        }
    }
}

/// Extract the raw bytes from a `data:<mime>;base64,<payload>` URL
pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>, PreprocessError> {
    let (_, payload) = data_url
        .split_once(',')
        .ok_or_else(|| PreprocessError::InvalidDataUrl("expected a base64 data URL".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| PreprocessError::InvalidDataUrl(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(PreprocessError::Decode)
}

pub fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(img)
        .map_err(PreprocessError::Encode)?;
    Ok(buf)
}

fn saturate(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// `|p * alpha + beta|` saturated to u8, per channel
pub fn scale_contrast(img: &RgbImage, alpha: f32, beta: f32) -> RgbImage {
    let mut out = img.clone();
    for px in out.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = saturate((*c as f32 * alpha + beta).abs());
        }
    }
    out
}

/// Bicubic upscale by an integer factor
pub fn upscale(img: &RgbImage, factor: u32) -> RgbImage {
    imageops::resize(
        img,
        img.width() * factor,
        img.height() * factor,
        FilterType::CatmullRom,
    )
}

/// 3x3 median filter per channel, edges clamped
pub fn median_denoise(img: &RgbImage) -> RgbImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let mut out = RgbImage::new(w, h);
    let mut window = [[0u8; 9]; 3];
    for y in 0..h {
        for x in 0..w {
            let mut n = 0;
            for dy in [-1i64, 0, 1] {
                for dx in [-1i64, 0, 1] {
                    let sx = (x as i64 + dx).clamp(0, w as i64 - 1) as u32;
                    let sy = (y as i64 + dy).clamp(0, h as i64 - 1) as u32;
                    let p = img.get_pixel(sx, sy);
                    for ch in 0..3 {
                        window[ch][n] = p.0[ch];
                    }
                    n += 1;
                }
            }
            let mut px = [0u8; 3];
            for ch in 0..3 {
                window[ch].sort_unstable();
                px[ch] = window[ch][4];
            }
            out.put_pixel(x, y, Rgb(px));
        }
    }
    out
}

// ============================================================================
// CIE L*a*b* (D65) conversion
// ============================================================================

const WHITE: [f32; 3] = [0.950_47, 1.0, 1.088_83];
const DELTA: f32 = 6.0 / 29.0;

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f32) -> f32 {
    if t > DELTA * DELTA * DELTA {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    if t > DELTA {
        t * t * t
    } else {
        3.0 * DELTA * DELTA * (t - 4.0 / 29.0)
    }
}

fn rgb_to_lab(px: &Rgb<u8>) -> [f32; 3] {
    let [r, g, b] = px.0.map(|c| srgb_to_linear(c as f32 / 255.0));
    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b;
    let z = 0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b;
    let fx = lab_f(x / WHITE[0]);
    let fy = lab_f(y / WHITE[1]);
    let fz = lab_f(z / WHITE[2]);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

fn lab_to_rgb(lab: [f32; 3]) -> Rgb<u8> {
    let fy = (lab[0] + 16.0) / 116.0;
    let fx = fy + lab[1] / 500.0;
    let fz = fy - lab[2] / 200.0;
    let x = WHITE[0] * lab_f_inv(fx);
    let y = WHITE[1] * lab_f_inv(fy);
    let z = WHITE[2] * lab_f_inv(fz);
    let r = 3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z;
    let g = -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z;
    let b = 0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z;
    Rgb([r, g, b].map(|c| saturate(linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0)))
}

/// Histogram-equalize the L* channel, leaving a* and b* untouched
pub fn equalize_luminance(img: &RgbImage) -> RgbImage {
    let labs: Vec<[f32; 3]> = img.pixels().map(rgb_to_lab).collect();
    let levels: Vec<u8> = labs
        .iter()
        .map(|lab| saturate(lab[0] * 255.0 / 100.0))
        .collect();

    let mut hist = [0u64; 256];
    for &l in &levels {
        hist[l as usize] += 1;
    }
    let total = levels.len() as u64;
    let mut cdf = [0u64; 256];
    let mut running = 0;
    for (i, count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }
    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == cdf_min {
        // A single luminance level has nothing to spread
        return img.clone();
    }

    let scale = 255.0 / (total - cdf_min) as f32;
    let lut: Vec<u8> = cdf
        .iter()
        .map(|&c| saturate(c.saturating_sub(cdf_min) as f32 * scale))
        .collect();

    let mut out = RgbImage::new(img.width(), img.height());
    for ((px, lab), level) in out.pixels_mut().zip(labs).zip(levels) {
        let l = lut[level as usize] as f32 * 100.0 / 255.0;
        *px = lab_to_rgb([l, lab[1], lab[2]]);
    }
    out
}

/// Push channels away from the mean grey level by `factor`
pub fn enhance_contrast(img: &RgbImage, factor: f32) -> RgbImage {
    let count = (img.width() as u64 * img.height() as u64).max(1);
    let sum: u64 = img
        .pixels()
        .map(|p| (p.0[0] as u64 * 299 + p.0[1] as u64 * 587 + p.0[2] as u64 * 114) / 1000)
        .sum();
    let mean = (sum as f32 / count as f32 + 0.5).floor();

    let mut out = img.clone();
    for px in out.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = saturate(mean + (*c as f32 - mean) * factor);
        }
    }
    out
}

/// Scale every channel by `factor`
pub fn enhance_brightness(img: &RgbImage, factor: f32) -> RgbImage {
    let mut out = img.clone();
    for px in out.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = saturate(*c as f32 * factor);
        }
    }
    out
}

/// Cut an image into `grid x grid` equal, non-overlapping regions (row major)
pub fn split_grid(img: &RgbImage, grid: u32) -> Vec<RgbImage> {
    let region_w = img.width() / grid;
    let region_h = img.height() / grid;
    let mut regions = Vec::with_capacity((grid * grid) as usize);
    for row in 0..grid {
        for col in 0..grid {
            regions.push(
                imageops::crop_imm(img, col * region_w, row * region_h, region_w, region_h)
                    .to_image(),
            );
        }
    }
    regions
}

/// Crop a box given as fractions of the image size
///
/// Coordinates are truncated to whole pixels and clamped to the image.
/// Returns `None` when nothing of the box lies inside the image.
pub fn crop_normalized(
    img: &RgbImage,
    left: f32,
    top: f32,
    width: f32,
    height: f32,
) -> Option<RgbImage> {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let x0 = (left * w as f32) as i64;
    let y0 = (top * h as f32) as i64;
    let x1 = x0 + (width * w as f32) as i64;
    let y1 = y0 + (height * h as f32) as i64;

    let (x0, x1) = (x0.clamp(0, w), x1.clamp(0, w));
    let (y0, y1) = (y0.clamp(0, h), y1.clamp(0, h));
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(
        imageops::crop_imm(img, x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
            .to_image(),
    )
}
