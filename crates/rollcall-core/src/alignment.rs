//! Five-point face alignment for the recognizer input.
//!
//! Maps the detected landmarks onto the canonical ArcFace template with a
//! least-squares similarity transform and resamples a 112×112 grayscale crop.

/// ArcFace template landmarks for a 112×112 crop.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit of `src` onto `dst`.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - smx, s.1 - smy);
            let (dx, dy) = (d.0 - dmx, d.1 - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-9 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

fn sample_bilinear(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let px = |xi: f32, yi: f32| -> f32 {
        if xi < 0.0 || yi < 0.0 || xi >= width as f32 || yi >= height as f32 {
            0.0
        } else {
            frame[yi as usize * width + xi as usize] as f32
        }
    };
    let top = px(x0, y0) * (1.0 - fx) + px(x0 + 1.0, y0) * fx;
    let bottom = px(x0, y0 + 1.0) * (1.0 - fx) + px(x0 + 1.0, y0 + 1.0) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Align a face in a grayscale frame to a 112×112 crop.
///
/// Degenerate landmarks (all points coincident) produce a black crop.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    if frame.len() < w * h {
        return out;
    }
    let Some(back) = Similarity::fit(landmarks, &TEMPLATE_112).and_then(|t| t.inverse()) else {
        return out;
    };

    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let (sx, sy) = back.apply((ox as f32, oy as f32));
            out[oy * ALIGNED_SIZE + ox] =
                sample_bilinear(frame, w, h, sx, sy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-3 && (a.1 - b.1).abs() < 1e-3
    }

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&TEMPLATE_112, &TEMPLATE_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_scale_and_shift() {
        let src: [(f32, f32); 5] =
            std::array::from_fn(|i| (TEMPLATE_112[i].0 * 0.5 + 10.0, TEMPLATE_112[i].1 * 0.5 + 20.0));
        let t = Similarity::fit(&src, &TEMPLATE_112).unwrap();
        for i in 0..5 {
            assert!(close(t.apply(src[i]), TEMPLATE_112[i]), "point {i}");
        }
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 12.0, ty: -4.0 };
        let inv = t.inverse().unwrap();
        let p = (33.0, 71.0);
        assert!(close(inv.apply(t.apply(p)), p));
    }

    #[test]
    fn test_degenerate_landmarks_yield_black_crop() {
        let frame = vec![200u8; 64 * 64];
        let out = align_face(&frame, 64, 64, &[(5.0, 5.0); 5]);
        assert_eq!(out.len(), ALIGNED_SIZE * ALIGNED_SIZE);
        assert!(out.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_align_uniform_frame_stays_uniform_inside() {
        // Landmarks already at template positions in a 112x112 frame.
        let frame = vec![90u8; ALIGNED_SIZE * ALIGNED_SIZE];
        let out = align_face(&frame, 112, 112, &TEMPLATE_112);
        assert_eq!(out[56 * ALIGNED_SIZE + 56], 90);
    }
}
