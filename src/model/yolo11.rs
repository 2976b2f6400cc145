// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolo11.rs - YOLO11 输出布局与解码
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

//! 三个检测头，每个检测头 2 或 3 个输出：回归 `[1, 4 * dfl_len, h, w]`、
//! 分类 `[1, class_num, h, w]`，以及可选的分数和 `[1, 1, h, w]`。

use tracing::{debug, warn};

use super::{DetectionParams, HeadOutputs, ModelError};
use crate::{
  decode::{Candidate, DflHead, GridLevel, decode_dfl},
  quant::QuantElem,
  tensor::{IoAttrs, ModelGeometry},
};

const BRANCH_NUM: usize = 3;

pub(super) fn validate(io: &IoAttrs, params: &DetectionParams) -> Result<(), ModelError> {
  let n_output = io.outputs.len();
  if n_output == 0 || n_output % BRANCH_NUM != 0 {
    return Err(ModelError::invalid(format!(
      "YOLO11 输出数量 {} 不是 {} 的倍数",
      n_output, BRANCH_NUM
    )));
  }

  let per_branch = n_output / BRANCH_NUM;
  if !(2..=3).contains(&per_branch) {
    return Err(ModelError::invalid(format!(
      "YOLO11 每个检测头应有 2 或 3 个输出, 实际为 {}",
      per_branch
    )));
  }

  if let Some(bad) = io.outputs.iter().find(|attrs| attrs.dims.len() != 4) {
    return Err(ModelError::invalid(format!(
      "输出 {} 维度应为 4, 实际为 {:?}",
      bad.index, bad.dims
    )));
  }

  let box_channels = io.outputs[0].dim(1);
  if box_channels == 0 || box_channels % 4 != 0 {
    return Err(ModelError::invalid(format!(
      "回归输出通道数 {} 不是 4 的倍数",
      box_channels
    )));
  }

  for i in 0..BRANCH_NUM {
    let score_channels = io.outputs[i * per_branch + 1].dim(1);
    if score_channels != params.class_num {
      return Err(ModelError::invalid(format!(
        "检测头 {} 分类输出通道数 {} 与类别数 {} 不符",
        i, score_channels, params.class_num
      )));
    }
    if per_branch == 3 && io.outputs[i * per_branch + 2].dim(1) != 1 {
      return Err(ModelError::invalid(format!(
        "检测头 {} 分数和输出通道数应为 1, 实际为 {}",
        i,
        io.outputs[i * per_branch + 2].dim(1)
      )));
    }
  }

  let kind = io.outputs[0].kind;
  if io.outputs.iter().any(|attrs| attrs.kind != kind) {
    return Err(ModelError::invalid("输出张量类型不一致"));
  }

  debug!(
    "YOLO11: dfl_len={}, 每个检测头 {} 个输出",
    box_channels / 4,
    per_branch
  );
  Ok(())
}

pub(super) fn decode<T: QuantElem>(
  heads: &HeadOutputs<'_>,
  geometry: ModelGeometry,
  params: &DetectionParams,
  out: &mut Vec<Candidate>,
) -> usize {
  let per_branch = heads.len() / BRANCH_NUM;
  let Some(first) = heads.attrs(0) else {
    return 0;
  };
  let dfl_len = first.dim(1) / 4;
  let mut valid_count = 0;

  for i in 0..BRANCH_NUM {
    let box_idx = i * per_branch;
    let Some(attrs) = heads.attrs(box_idx) else {
      continue;
    };
    let (grid_h, grid_w) = (attrs.dim(2), attrs.dim(3));
    if grid_h == 0 || grid_w == 0 {
      warn!("检测头 {} 网格为空", i);
      continue;
    }
    let stride = geometry.height as usize / grid_h;

    let (Some(boxes), Some(scores)) = (heads.slice::<T>(box_idx), heads.slice::<T>(box_idx + 1))
    else {
      continue;
    };
    let score_sum = if per_branch == 3 {
      heads.slice::<T>(box_idx + 2)
    } else {
      None
    };

    let head = DflHead {
      boxes,
      scores,
      score_sum,
      dfl_len,
      class_num: params.class_num,
    };
    let n = decode_dfl(
      &head,
      GridLevel::new(grid_h, grid_w, stride),
      params.confidence,
      out,
    );
    debug!("检测头 {} ({}x{}, stride {}): {} 个候选框", i, grid_h, grid_w, stride, n);
    valid_count += n;
  }

  valid_count
}
