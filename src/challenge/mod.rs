//! 滑块验证码求解：还原打乱的背景图，用梯度图上的掩码归一化互相关定位缺口。
//!
//! 纯计算，不访问网络；相同输入得到相同结果。

use image::{DynamicImage, GenericImageView, GrayImage, RgbaImage, imageops};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum ChallengeError {
    #[error("no confident alignment (best score {confidence:.3})")]
    Unsolvable { confidence: f32 },
    #[error("malformed slice map: {0}")]
    SliceMap(String),
    #[error("image error: {0}")]
    Image(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliderSolution {
    /// 拖动距离（缺口左上角 x）。
    pub x: u32,
    pub y: u32,
    pub confidence: f32,
}

/// 切片表：按行给出每个目标格子取自原图的 `(src_x, src_y)`。
pub type SliceMap = Vec<Vec<(u32, u32)>>;

fn coerce_u32(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 解码页面里的 `Data` 串：每个字符码减 3 后是 JSON 数组。
pub fn decode_slice_map(encoded: &str) -> Result<SliceMap, ChallengeError> {
    let unescaped = encoded.replace("\\/", "/");
    let shifted: String = unescaped
        .chars()
        .map(|c| char::from_u32((c as u32).wrapping_sub(3)).unwrap_or(c))
        .collect();
    let value: Value =
        serde_json::from_str(&shifted).map_err(|e| ChallengeError::SliceMap(e.to_string()))?;
    let rows = value
        .as_array()
        .ok_or_else(|| ChallengeError::SliceMap("top level is not an array".into()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row
            .as_array()
            .ok_or_else(|| ChallengeError::SliceMap("row is not an array".into()))?;
        let mut parsed = Vec::with_capacity(cells.len());
        for cell in cells {
            let pair = cell.as_array().filter(|p| p.len() >= 2);
            let xy = pair.and_then(|p| Some((coerce_u32(&p[0])?, coerce_u32(&p[1])?)));
            parsed.push(xy.ok_or_else(|| ChallengeError::SliceMap(format!("bad cell {cell}")))?);
        }
        out.push(parsed);
    }
    if out.is_empty() || out[0].is_empty() {
        return Err(ChallengeError::SliceMap("empty slice map".into()));
    }
    Ok(out)
}

/// 按切片表把打乱的背景拼回原样。
pub fn reconstruct(bg: &DynamicImage, map: &SliceMap) -> RgbaImage {
    let src = bg.to_rgba8();
    let (w, h) = src.dimensions();
    let mut out = RgbaImage::new(w, h);
    let rows = map.len() as u32;
    let cols = map.first().map(|r| r.len()).unwrap_or(0) as u32;
    if rows == 0 || cols == 0 {
        return src;
    }
    let slice_w = w / cols;
    let slice_h = h / rows;

    for (ri, row) in map.iter().enumerate() {
        for (ci, &(sx, sy)) in row.iter().enumerate() {
            let dx = ci as u32 * slice_w;
            let dy = ri as u32 * slice_h;
            let cw = slice_w.min(w.saturating_sub(sx)).min(w.saturating_sub(dx));
            let ch = slice_h.min(h.saturating_sub(sy)).min(h.saturating_sub(dy));
            if cw == 0 || ch == 0 {
                continue;
            }
            let tile = imageops::crop_imm(&src, sx, sy, cw, ch).to_image();
            imageops::replace(&mut out, &tile, i64::from(dx), i64::from(dy));
        }
    }
    out
}

/// Sobel 梯度幅值。
fn gradient(gray: &GrayImage) -> Vec<f32> {
    let (w, h) = gray.dimensions();
    let (w, h) = (w as usize, h as usize);
    let px = |x: usize, y: usize| f32::from(gray.as_raw()[y * w + x]);
    let mut out = vec![0.0f32; w * h];
    if w < 3 || h < 3 {
        return out;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1)
                - px(x - 1, y - 1)
                - 2.0 * px(x - 1, y)
                - px(x - 1, y + 1);
            let gy = px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1)
                - px(x - 1, y - 1)
                - 2.0 * px(x, y - 1)
                - px(x + 1, y - 1);
            out[y * w + x] = (gx * gx + gy * gy).sqrt();
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct SliderSolver {
    pub threshold: f32,
}

impl Default for SliderSolver {
    fn default() -> Self {
        Self { threshold: 0.25 }
    }
}

impl SliderSolver {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// 在背景中寻找与拼图块最吻合的位置。拼图块透明像素不参与匹配。
    pub fn solve(
        &self,
        background: &DynamicImage,
        piece: &DynamicImage,
    ) -> Result<SliderSolution, ChallengeError> {
        let (bw, bh) = background.dimensions();
        let (pw, ph) = piece.dimensions();
        if pw == 0 || ph == 0 || pw > bw || ph > bh {
            return Err(ChallengeError::Image(format!(
                "piece {pw}x{ph} does not fit background {bw}x{bh}"
            )));
        }

        let rgba = piece.to_rgba8();
        let bg_grad = gradient(&background.to_luma8());
        let pc_grad = gradient(&piece.to_luma8());

        // 只取 3x3 邻域全部不透明的像素，避开拼图块轮廓处失真的梯度
        let opaque = |x: i64, y: i64| {
            x >= 0
                && y >= 0
                && (x as u32) < pw
                && (y as u32) < ph
                && rgba.get_pixel(x as u32, y as u32)[3] > 0
        };
        let mut mask: Vec<usize> = Vec::new();
        for y in 1..ph.saturating_sub(1) {
            for x in 1..pw.saturating_sub(1) {
                let (xi, yi) = (i64::from(x), i64::from(y));
                let inner = (-1..=1).all(|dy| (-1..=1).all(|dx| opaque(xi + dx, yi + dy)));
                if inner {
                    mask.push((y * pw + x) as usize);
                }
            }
        }
        let (bw, pw, ph) = (bw as usize, pw as usize, ph as usize);
        let n = mask.len() as f32;
        if mask.is_empty() {
            return Err(ChallengeError::Unsolvable { confidence: 0.0 });
        }

        let t_mean = mask.iter().map(|&i| pc_grad[i]).sum::<f32>() / n;
        let template: Vec<(usize, f32)> = mask
            .iter()
            .map(|&i| ((i / pw) * bw + (i % pw), pc_grad[i] - t_mean))
            .collect();
        let t_norm = template.iter().map(|(_, t)| t * t).sum::<f32>().sqrt();
        if t_norm < f32::EPSILON {
            return Err(ChallengeError::Unsolvable { confidence: 0.0 });
        }

        let mut best = (0usize, 0usize, f32::MIN);
        for oy in 0..=(bh as usize - ph) {
            for ox in 0..=(bw - pw) {
                let base = oy * bw + ox;
                let (mut sum, mut sum_sq, mut cross) = (0.0f64, 0.0f64, 0.0f64);
                for &(off, t) in &template {
                    let b = f64::from(bg_grad[base + off]);
                    sum += b;
                    sum_sq += b * b;
                    cross += f64::from(t) * b;
                }
                let var = sum_sq - sum * sum / f64::from(n);
                if var <= 1e-6 {
                    continue;
                }
                let score = (cross / (f64::from(t_norm) * var.sqrt())) as f32;
                // 同分取最左，保证结果确定
                if score > best.2 {
                    best = (ox, oy, score);
                }
            }
        }

        let confidence = best.2.max(0.0);
        debug!(target: "challenge", x = best.0, y = best.1, confidence, "slider alignment");
        if confidence < self.threshold {
            return Err(ChallengeError::Unsolvable { confidence });
        }
        Ok(SliderSolution {
            x: best.0 as u32,
            y: best.1 as u32,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn noise_bg(w: u32, h: u32, seed: u32) -> RgbaImage {
        let mut state = seed;
        RgbaImage::from_fn(w, h, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let v = ((state >> 16) & 0xFF) as u8;
            Rgba([v, v / 2, 255 - v, 255])
        })
    }

    fn cut_piece(bg: &RgbaImage, x: u32, y: u32, size: u32) -> RgbaImage {
        let r = size as f32 / 2.0;
        RgbaImage::from_fn(size, size, |px, py| {
            let (dx, dy) = (px as f32 - r, py as f32 - r);
            if dx * dx + dy * dy <= r * r {
                *bg.get_pixel(x + px, y + py)
            } else {
                Rgba([0, 0, 0, 0])
            }
        })
    }

    #[test]
    fn finds_piece_offset() {
        let bg = noise_bg(220, 90, 7);
        let piece = cut_piece(&bg, 137, 31, 36);
        let solver = SliderSolver::default();
        let sol = solver
            .solve(
                &DynamicImage::ImageRgba8(bg.clone()),
                &DynamicImage::ImageRgba8(piece.clone()),
            )
            .unwrap();
        assert_eq!((sol.x, sol.y), (137, 31));
        assert!(sol.confidence > 0.9);

        let again = solver
            .solve(&DynamicImage::ImageRgba8(bg), &DynamicImage::ImageRgba8(piece))
            .unwrap();
        assert_eq!(sol, again);
    }

    #[test]
    fn featureless_piece_is_unsolvable() {
        let bg = noise_bg(120, 60, 3);
        let piece = RgbaImage::from_pixel(20, 20, Rgba([128, 128, 128, 255]));
        let err = SliderSolver::default()
            .solve(&DynamicImage::ImageRgba8(bg), &DynamicImage::ImageRgba8(piece))
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Unsolvable { .. }));
    }

    #[test]
    fn decodes_shifted_slice_map() {
        let plain = r#"[[[10,0],["0","0"]]]"#;
        let encoded: String = plain
            .chars()
            .map(|c| char::from_u32(c as u32 + 3).unwrap())
            .collect();
        let map = decode_slice_map(&encoded).unwrap();
        assert_eq!(map, vec![vec![(10, 0), (0, 0)]]);
        assert!(decode_slice_map("garbage").is_err());
    }

    #[test]
    fn reconstruct_swaps_tiles_back() {
        // 左右两半互换
        let mut shuffled = RgbaImage::new(20, 10);
        for (x, _, p) in shuffled.enumerate_pixels_mut() {
            *p = if x < 10 { Rgba([0, 0, 255, 255]) } else { Rgba([255, 0, 0, 255]) };
        }
        let map = vec![vec![(10, 0), (0, 0)]];
        let fixed = reconstruct(&DynamicImage::ImageRgba8(shuffled), &map);
        assert_eq!(fixed.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(fixed.get_pixel(19, 9), &Rgba([0, 0, 255, 255]));
    }
}
