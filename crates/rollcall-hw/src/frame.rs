//! Luma frames: pixel format conversion, dark-frame check, CLAHE, image interop.

use image::{DynamicImage, GrayImage};

/// A captured or decoded 8-bit grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Luma pixels, row-major, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Build a frame from a decoded still image (reference photos).
    pub fn from_image(img: &DynamicImage) -> Self {
        let luma = img.to_luma8();
        let (width, height) = luma.dimensions();
        let data = luma.into_raw();
        let is_dark = is_dark_frame(&data, 0.95);
        Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
            is_dark,
        }
    }

    /// Copy into an `image` buffer, e.g. to save a preview.
    pub fn to_image(&self) -> Option<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data.clone())
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Packed YUYV (`[Y0, U, Y1, V]`) to luma: keep every even byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// 8-bit GREY is already luma; trim driver padding.
pub fn grey_to_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    check_len(buf, expected)?;
    Ok(buf[..expected].to_vec())
}

/// Y16 little-endian to 8-bit by keeping the high byte.
pub fn y16_to_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(buf, expected)?;
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True when more than `threshold_pct` of the pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

/// Clipped, renormalised CDF for one tile.
fn tile_cdf(gray: &[u8], stride: usize, x0: usize, y0: usize, tw: usize, th: usize, clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    for row in gray[y0 * stride..].chunks(stride).take(th) {
        for &p in &row[x0..x0 + tw] {
            hist[p as usize] += 1;
        }
    }

    let pixels = (tw * th) as u32;
    let clip = ((clip_limit * pixels as f32) as u32).max(1);
    let excess: u32 = hist.iter().map(|&b| b.saturating_sub(clip)).sum();
    let (share, leftover) = (excess / 256, (excess % 256) as usize);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin = (*bin).min(clip) + share + u32::from(i < leftover);
    }

    let mut cdf = [0f32; 256];
    let mut running = 0f32;
    for (slot, &bin) in cdf.iter_mut().zip(hist.iter()) {
        running += bin as f32;
        *slot = running;
    }
    let floor = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let span = pixels as f32 - floor;
    if span > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - floor) / span * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}

/// Contrast-limited adaptive histogram equalisation, in place.
///
/// Uses a `tiles`×`tiles` grid and bilinear blending between tile CDFs.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let (w, h, n) = (width as usize, height as usize, tiles as usize);
    if n == 0 || gray.len() < w * h {
        return;
    }
    let (tw, th) = (w / n, h / n);
    if tw == 0 || th == 0 {
        return;
    }

    let cdfs: Vec<[f32; 256]> = (0..n * n)
        .map(|t| tile_cdf(gray, w, (t % n) * tw, (t / n) * th, tw, th, clip_limit))
        .collect();

    let last = (n - 1) as f32;
    for y in 0..h {
        let fy = (y as f32 / th as f32 - 0.5).clamp(0.0, last);
        let (r0, dy) = (fy as usize, fy.fract());
        let r1 = (r0 + 1).min(n - 1);
        for x in 0..w {
            let fx = (x as f32 / tw as f32 - 0.5).clamp(0.0, last);
            let (c0, dx) = (fx as usize, fx.fract());
            let c1 = (c0 + 1).min(n - 1);

            let p = gray[y * w + x] as usize;
            let top = cdfs[r0 * n + c0][p] * (1.0 - dx) + cdfs[r0 * n + c1][p] * dx;
            let bottom = cdfs[r1 * n + c0][p] * (1.0 - dx) + cdfs[r1 * n + c1][p] * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}
