// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolov5.rs - YOLOv5 输出布局与解码
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

use tracing::{debug, warn};

use super::{DetectionParams, HeadOutputs, ModelError};
use crate::{
  decode::{Candidate, GridLevel, YOLOV5_ANCHORS, decode_anchor},
  quant::QuantElem,
  tensor::{IoAttrs, ModelGeometry},
};

/// 每个检测头输出 `[1, 3 * (5 + class_num), h, w]`
pub(super) fn validate(io: &IoAttrs, params: &DetectionParams) -> Result<(), ModelError> {
  if io.outputs.len() < YOLOV5_ANCHORS.len() {
    return Err(ModelError::invalid(format!(
      "YOLOv5 需要 {} 个输出, 实际为 {}",
      YOLOV5_ANCHORS.len(),
      io.outputs.len()
    )));
  }

  let expected = 3 * (5 + params.class_num);
  for attrs in io.outputs.iter().take(YOLOV5_ANCHORS.len()) {
    if attrs.dims.len() != 4 || attrs.dim(1) != expected {
      return Err(ModelError::invalid(format!(
        "输出 {} 维度 {:?} 与类别数 {} 不符, 通道数应为 {}",
        attrs.index, attrs.dims, params.class_num, expected
      )));
    }
  }

  let kind = io.outputs[0].kind;
  if io.outputs.iter().any(|attrs| attrs.kind != kind) {
    return Err(ModelError::invalid("输出张量类型不一致"));
  }
  Ok(())
}

pub(super) fn decode<T: QuantElem>(
  heads: &HeadOutputs<'_>,
  geometry: ModelGeometry,
  params: &DetectionParams,
  out: &mut Vec<Candidate>,
) -> usize {
  let mut valid_count = 0;

  for (i, anchors) in YOLOV5_ANCHORS.iter().enumerate() {
    let Some(attrs) = heads.attrs(i) else {
      continue;
    };
    let (grid_h, grid_w) = (attrs.dim(2), attrs.dim(3));
    if grid_h == 0 || grid_w == 0 {
      warn!("检测头 {} 网格为空", i);
      continue;
    }
    let stride = geometry.height as usize / grid_h;

    let Some(input) = heads.slice::<T>(i) else {
      continue;
    };
    let n = decode_anchor(
      input,
      anchors,
      GridLevel::new(grid_h, grid_w, stride),
      params.class_num,
      params.confidence,
      out,
    );
    debug!("检测头 {} ({}x{}, stride {}): {} 个候选框", i, grid_h, grid_w, stride, n);
    valid_count += n;
  }

  valid_count
}
