// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nms.rs - 置信度排序与逐类别非极大值抑制
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

use std::collections::BTreeSet;

use crate::decode::{BoxXywh, Candidate};

/// 按置信度降序排列的下标序列，相同置信度保持原始顺序
pub fn sort_descending_by_confidence(candidates: &[Candidate]) -> Vec<usize> {
  let mut order: Vec<usize> = (0..candidates.len()).collect();
  order.sort_by(|&a, &b| {
    candidates[b]
      .confidence
      .total_cmp(&candidates[a].confidence)
  });
  order
}

/// 像素边界包含在内的 IoU：面积为 `(x2 - x1 + 1) * (y2 - y1 + 1)`
pub fn iou(a: &BoxXywh, b: &BoxXywh) -> f32 {
  let (xmin0, ymin0, xmax0, ymax0) = (a.x, a.y, a.x2(), a.y2());
  let (xmin1, ymin1, xmax1, ymax1) = (b.x, b.y, b.x2(), b.y2());

  let w = (xmax0.min(xmax1) - xmin0.max(xmin1) + 1.0).max(0.0);
  let h = (ymax0.min(ymax1) - ymin0.max(ymin1) + 1.0).max(0.0);
  let i = w * h;
  let u = (xmax0 - xmin0 + 1.0) * (ymax0 - ymin0 + 1.0) + (xmax1 - xmin1 + 1.0) * (ymax1 - ymin1 + 1.0)
    - i;
  if u <= 0.0 { 0.0 } else { i / u }
}

/// 对类别 `class_id` 做一次贪心抑制。
///
/// `order` 为置信度降序的下标，被抑制的位置置为 `None`，之后不会再参与比较。
pub fn nms(candidates: &[Candidate], order: &mut [Option<usize>], class_id: usize, threshold: f32) {
  for i in 0..order.len() {
    let Some(n) = order[i] else {
      continue;
    };
    if candidates[n].class_id != class_id {
      continue;
    }
    for j in (i + 1)..order.len() {
      let Some(m) = order[j] else {
        continue;
      };
      if candidates[m].class_id != class_id {
        continue;
      }
      if iou(&candidates[n].bbox, &candidates[m].bbox) > threshold {
        order[j] = None;
      }
    }
  }
}

/// 排序并逐类别抑制，返回保留下来的候选框下标（置信度降序）
pub fn suppress(candidates: &[Candidate], threshold: f32) -> Vec<usize> {
  let mut order: Vec<Option<usize>> = sort_descending_by_confidence(candidates)
    .into_iter()
    .map(Some)
    .collect();

  let class_set: BTreeSet<usize> = candidates.iter().map(|c| c.class_id).collect();
  for class_id in class_set {
    nms(candidates, &mut order, class_id, threshold);
  }

  order.into_iter().flatten().collect()
}
