// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode/anchor.rs - anchor-based 检测头解码
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

const ANCHOR_NUM: usize = 3;

/// 每个步长层级的 3 个先验框 (宽, 高)
pub const YOLOV5_ANCHORS: [[(f32, f32); ANCHOR_NUM]; 3] = [
  [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)],
  [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)],
  [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)],
];

/// 解码一个步长层级。
///
/// 张量布局为 `[anchor][5 + class_num][grid_h][grid_w]`，前 5 个通道依次为
/// x、y、w、h、objectness。objectness 在量化空间与阈值比较，
/// 最终置信度 `obj * cls` 则在反量化后与浮点阈值比较。
pub fn decode_anchor<T: QuantElem>(
  input: QuantSlice<'_, T>,
  anchors: &[(f32, f32); ANCHOR_NUM],
  level: GridLevel,
  class_num: usize,
  threshold: f32,
  out: &mut Vec<Candidate>,
) -> usize {
  let grid_len = level.grid_len();
  let prop_box_size = 5 + class_num;
  if input.data.len() < ANCHOR_NUM * prop_box_size * grid_len {
    warn!(
      "anchor 检测头张量大小不足: 网格 {}x{}, class_num={}, 实际 {}",
      level.grid_h,
      level.grid_w,
      class_num,
      input.data.len()
    );
    return 0;
  }

  let qp = input.qp;
  let thres = T::threshold(threshold, qp);
  let mut valid_count = 0;

  for (a, &(anchor_w, anchor_h)) in anchors.iter().enumerate() {
    for i in 0..level.grid_h {
      for j in 0..level.grid_w {
        let base = a * grid_len * prop_box_size + i * level.grid_w + j;
        let at = |channel: usize| input.data[base + channel * grid_len];

        let box_confidence = at(4);
        if box_confidence < thres {
          continue;
        }

        let mut max_score = T::SCAN_FLOOR;
        let mut max_class_id = None;
        for c in 0..class_num {
          let class_score = at(5 + c);
          if class_score > max_score {
            max_score = class_score;
            max_class_id = Some(c);
          }
        }
        let Some(class_id) = max_class_id else {
          continue;
        };

        let final_conf = box_confidence.to_f32(qp) * max_score.to_f32(qp);
        if final_conf < threshold {
          continue;
        }

        let box_x = at(0).to_f32(qp) * 2.0 - 0.5;
        let box_y = at(1).to_f32(qp) * 2.0 - 0.5;
        let box_w = at(2).to_f32(qp) * 2.0;
        let box_h = at(3).to_f32(qp) * 2.0;

        let cx = (box_x + j as f32) * level.stride;
        let cy = (box_y + i as f32) * level.stride;
        let w = box_w * box_w * anchor_w;
        let h = box_h * box_h * anchor_h;

        out.push(Candidate {
          bbox: BoxXywh {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
          },
          confidence: final_conf,
          class_id,
        });
        valid_count += 1;
      }
    }
  }

  valid_count
}
