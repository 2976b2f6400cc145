// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode/dfl.rs - anchor-free (DFL) 检测头解码
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use tracing::warn;

use super::{BoxXywh, Candidate, GridLevel, QuantSlice};
use crate::quant::QuantElem;

/// 一个步长层级的 DFL 检测头输出
#[derive(Debug, Clone, Copy)]
pub struct DflHead<'a, T> {
  /// `4 * dfl_len` 个通道，依次为 左、上、右、下 的分布 logits
  pub boxes: QuantSlice<'a, T>,
  /// `class_num` 个通道
  pub scores: QuantSlice<'a, T>,
  /// 可选的单通道分数和，用于快速过滤
  pub score_sum: Option<QuantSlice<'a, T>>,
  pub dfl_len: usize,
  pub class_num: usize,
}

impl<T> DflHead<'_, T> {
  fn fits(&self, level: &GridLevel) -> bool {
    let grid_len = level.grid_len();
    self.boxes.data.len() >= 4 * self.dfl_len * grid_len
      && self.scores.data.len() >= self.class_num * grid_len
      && self
        .score_sum
        .as_ref()
        .is_none_or(|sum| sum.data.len() >= grid_len)
  }
}

/// 对四条边各自的 `dfl_len` 个 logits 做 softmax，取期望作为偏移量
pub fn compute_dfl(tensor: &[f32], dfl_len: usize) -> [f32; 4] {
  let mut side = [0.0f32; 4];
  let mut exp_t = vec![0.0f32; dfl_len];
  for (b, out) in side.iter_mut().enumerate() {
    let logits = &tensor[b * dfl_len..(b + 1) * dfl_len];
    let mut exp_sum = 0.0f32;
    for (e, &l) in exp_t.iter_mut().zip(logits) {
      *e = l.exp();
      exp_sum += *e;
    }
    let mut acc_sum = 0.0f32;
    for (i, &e) in exp_t.iter().enumerate() {
      acc_sum += e / exp_sum * i as f32;
    }
    *out = acc_sum;
  }
  side
}

/// 解码一个步长层级。
///
/// 阈值比较发生在量化空间：先把 `threshold` 量化，再与原始整数比较，
/// 只有通过的单元格才反量化。
pub fn decode_dfl<T: QuantElem>(
  head: &DflHead<'_, T>,
  level: GridLevel,
  threshold: f32,
  out: &mut Vec<Candidate>,
) -> usize {
  if !head.fits(&level) {
    warn!(
      "DFL 检测头张量大小不足: 网格 {}x{}, dfl_len={}, class_num={}",
      level.grid_h, level.grid_w, head.dfl_len, head.class_num
    );
    return 0;
  }

  let grid_len = level.grid_len();
  let score_thres = T::threshold(threshold, head.scores.qp);
  let score_sum_thres = head
    .score_sum
    .as_ref()
    .map(|sum| (sum.data, T::threshold(threshold, sum.qp)));

  let mut before_dfl = vec![0.0f32; head.dfl_len * 4];
  let mut valid_count = 0;

  for i in 0..level.grid_h {
    for j in 0..level.grid_w {
      let offset = i * level.grid_w + j;

      // 分数和通道起到快速过滤的作用
      if let Some((sum, thres)) = score_sum_thres
        && sum[offset] < thres
      {
        continue;
      }

      let mut max_score = T::score_floor(head.scores.qp);
      let mut max_class_id = None;
      for c in 0..head.class_num {
        let score = head.scores.data[offset + c * grid_len];
        if score > score_thres && score > max_score {
          max_score = score;
          max_class_id = Some(c);
        }
      }

      // 只有超过阈值的分数才会更新类别
      let Some(class_id) = max_class_id else {
        continue;
      };

      for (k, v) in before_dfl.iter_mut().enumerate() {
        *v = head.boxes.data[offset + k * grid_len].to_f32(head.boxes.qp);
      }
      let side = compute_dfl(&before_dfl, head.dfl_len);

      let (col, row) = (j as f32, i as f32);
      let x1 = (-side[0] + col + 0.5) * level.stride;
      let y1 = (-side[1] + row + 0.5) * level.stride;
      let x2 = (side[2] + col + 0.5) * level.stride;
      let y2 = (side[3] + row + 0.5) * level.stride;

      out.push(Candidate {
        bbox: BoxXywh::from_corners(x1, y1, x2, y2),
        confidence: max_score.to_f32(head.scores.qp),
        class_id,
      });
      valid_count += 1;
    }
  }

  valid_count
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::quant::{QuantParams, quantize_i8, quantize_u8};

  const GRID: usize = 2;
  const DFL_LEN: usize = 4;
  const CLASS_NUM: usize = 8;
  const STRIDE: usize = 16;
  // 目标单元格: row 1, col 0
  const TARGET: usize = GRID;

  /// 以实数构造一个检测头，再由 `quant` 转换成目标数值类型
  struct RealHead {
    boxes: Vec<f32>,
    scores: Vec<f32>,
    score_sum: Vec<f32>,
  }

  fn real_head(target_score: f32, target_sum: f32) -> RealHead {
    let grid_len = GRID * GRID;
    let mut boxes = vec![0.0f32; 4 * DFL_LEN * grid_len];
    // 右边的分布集中在最后一个 bin
    boxes[(2 * DFL_LEN + 3) * grid_len + TARGET] = 2.0;
    let mut scores = vec![0.0f32; CLASS_NUM * grid_len];
    scores[5 * grid_len + TARGET] = target_score;
    scores[2 * grid_len + TARGET] = 0.3;
    let mut score_sum = vec![0.0f32; grid_len];
    score_sum[TARGET] = target_sum;
    RealHead {
      boxes,
      scores,
      score_sum,
    }
  }

  fn expected_box() -> BoxXywh {
    let right = 3.0 * 2.0f32.exp() / (2.0f32.exp() + 3.0);
    let stride = STRIDE as f32;
    BoxXywh::from_corners(
      (-1.5 + 0.0 + 0.5) * stride,
      (-1.5 + 1.0 + 0.5) * stride,
      (right + 0.0 + 0.5) * stride,
      (1.5 + 1.0 + 0.5) * stride,
    )
  }

  fn assert_box_close(a: &BoxXywh, b: &BoxXywh, eps: f32) {
    assert!((a.x - b.x).abs() < eps, "x {} vs {}", a.x, b.x);
    assert!((a.y - b.y).abs() < eps, "y {} vs {}", a.y, b.y);
    assert!((a.w - b.w).abs() < eps, "w {} vs {}", a.w, b.w);
    assert!((a.h - b.h).abs() < eps, "h {} vs {}", a.h, b.h);
  }

  #[test]
  fn test_compute_dfl_uniform_and_peaked() {
    let uniform = compute_dfl(&[0.0; 16], 4);
    for s in uniform {
      assert!((s - 1.5).abs() < 1e-6);
    }

    let mut logits = [0.0f32; 16];
    logits[4 + 1] = 50.0;
    let side = compute_dfl(&logits, 4);
    assert!((side[1] - 1.0).abs() < 1e-4);
  }

  #[test]
  fn test_decode_i8_single_cell() {
    let real = real_head(0.9, 0.9);
    let box_qp = QuantParams::new(0, 0.1);
    let score_qp = QuantParams::new(-128, 1.0 / 255.0);
    let boxes: Vec<i8> = real.boxes.iter().map(|&v| quantize_i8(v, 0, 0.1)).collect();
    let scores: Vec<i8> = real
      .scores
      .iter()
      .map(|&v| quantize_i8(v, -128, 1.0 / 255.0))
      .collect();
    let sum: Vec<i8> = real
      .score_sum
      .iter()
      .map(|&v| quantize_i8(v, -128, 1.0 / 255.0))
      .collect();

    let head = DflHead {
      boxes: QuantSlice::new(&boxes, box_qp),
      scores: QuantSlice::new(&scores, score_qp),
      score_sum: Some(QuantSlice::new(&sum, score_qp)),
      dfl_len: DFL_LEN,
      class_num: CLASS_NUM,
    };

    let mut out = Vec::new();
    let n = decode_dfl(&head, GridLevel::new(GRID, GRID, STRIDE), 0.25, &mut out);
    assert_eq!(n, 1);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].class_id, 5);
    let expected_conf = (quantize_i8(0.9, -128, 1.0 / 255.0) as f32 + 128.0) / 255.0;
    assert!((out[0].confidence - expected_conf).abs() < 1e-6);
    assert_box_close(&out[0].bbox, &expected_box(), 1e-3);
  }

  #[test]
  fn test_numeric_kinds_agree() {
    let real = real_head(0.9, 0.9);
    let level = GridLevel::new(GRID, GRID, STRIDE);

    let f32_head = DflHead {
      boxes: QuantSlice::new(&real.boxes, QuantParams::IDENTITY),
      scores: QuantSlice::new(&real.scores, QuantParams::IDENTITY),
      score_sum: Some(QuantSlice::new(&real.score_sum, QuantParams::IDENTITY)),
      dfl_len: DFL_LEN,
      class_num: CLASS_NUM,
    };
    let mut f32_out = Vec::new();
    decode_dfl(&f32_head, level, 0.25, &mut f32_out);

    let box_qp = QuantParams::new(20, 0.1);
    let score_qp = QuantParams::new(0, 1.0 / 255.0);
    let boxes: Vec<u8> = real.boxes.iter().map(|&v| quantize_u8(v, 20, 0.1)).collect();
    let scores: Vec<u8> = real
      .scores
      .iter()
      .map(|&v| quantize_u8(v, 0, 1.0 / 255.0))
      .collect();
    let sum: Vec<u8> = real
      .score_sum
      .iter()
      .map(|&v| quantize_u8(v, 0, 1.0 / 255.0))
      .collect();
    let u8_head = DflHead {
      boxes: QuantSlice::new(&boxes, box_qp),
      scores: QuantSlice::new(&scores, score_qp),
      score_sum: Some(QuantSlice::new(&sum, score_qp)),
      dfl_len: DFL_LEN,
      class_num: CLASS_NUM,
    };
    let mut u8_out = Vec::new();
    decode_dfl(&u8_head, level, 0.25, &mut u8_out);

    assert_eq!(f32_out.len(), 1);
    assert_eq!(u8_out.len(), 1);
    assert_eq!(f32_out[0].class_id, u8_out[0].class_id);
    assert!((f32_out[0].confidence - u8_out[0].confidence).abs() <= 1.0 / 255.0);
    assert_box_close(&f32_out[0].bbox, &expected_box(), 1e-3);
    assert_box_close(&u8_out[0].bbox, &expected_box(), 1e-3);
  }

  #[test]
  fn test_score_sum_fast_reject() {
    // 类别分数很高，但分数和低于阈值，单元格被跳过
    let real = real_head(0.9, 0.1);
    let mut head = DflHead {
      boxes: QuantSlice::new(&real.boxes, QuantParams::IDENTITY),
      scores: QuantSlice::new(&real.scores, QuantParams::IDENTITY),
      score_sum: Some(QuantSlice::new(&real.score_sum, QuantParams::IDENTITY)),
      dfl_len: DFL_LEN,
      class_num: CLASS_NUM,
    };
    let level = GridLevel::new(GRID, GRID, STRIDE);
    let mut out = Vec::new();
    assert_eq!(decode_dfl(&head, level, 0.25, &mut out), 0);

    // 没有分数和通道时执行完整扫描
    head.score_sum = None;
    assert_eq!(decode_dfl(&head, level, 0.25, &mut out), 1);
    assert_eq!(out[0].class_id, 5);
  }

  #[test]
  fn test_below_threshold_yields_nothing() {
    let real = real_head(0.2, 0.9);
    let head = DflHead {
      boxes: QuantSlice::new(&real.boxes, QuantParams::IDENTITY),
      scores: QuantSlice::new(&real.scores, QuantParams::IDENTITY),
      score_sum: None,
      dfl_len: DFL_LEN,
      class_num: CLASS_NUM,
    };
    let mut out = Vec::new();
    // 0.3 的类别 2 超过阈值 0.25，0.2 的类别 5 没有
    assert_eq!(decode_dfl(&head, GridLevel::new(GRID, GRID, STRIDE), 0.25, &mut out), 1);
    assert_eq!(out[0].class_id, 2);
    out.clear();
    assert_eq!(decode_dfl(&head, GridLevel::new(GRID, GRID, STRIDE), 0.5, &mut out), 0);
  }

  #[test]
  fn test_short_tensor_is_skipped() {
    let boxes = [0i8; 4];
    let scores = [0i8; 4];
    let head = DflHead {
      boxes: QuantSlice::new(&boxes, QuantParams::IDENTITY),
      scores: QuantSlice::new(&scores, QuantParams::IDENTITY),
      score_sum: None,
      dfl_len: DFL_LEN,
      class_num: CLASS_NUM,
    };
    let mut out = Vec::new();
    assert_eq!(decode_dfl(&head, GridLevel::new(GRID, GRID, STRIDE), 0.25, &mut out), 0);
  }
}
