// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode.rs - 检测头输出解码
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

//! 把单个检测头的原始输出转换为候选框。
//!
//! 所有张量均为通道优先布局，通道间距为 `grid_h * grid_w`。
//! 解码函数不返回错误，只向 `out` 追加候选框并返回本次追加的数量。

use crate::quant::QuantParams;

mod anchor;
mod dfl;

pub use self::anchor::{YOLOV5_ANCHORS, decode_anchor};
pub use self::dfl::{DflHead, compute_dfl, decode_dfl};

/// 左上角加宽高，位于 letterbox 后的模型输入坐标系
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoxXywh {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

impl BoxXywh {
  pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self {
      x: x1,
      y: y1,
      w: x2 - x1,
      h: y2 - y1,
    }
  }

  pub fn x2(&self) -> f32 {
    self.x + self.w
  }

  pub fn y2(&self) -> f32 {
    self.y + self.h
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub bbox: BoxXywh,
  pub confidence: f32,
  pub class_id: usize,
}

/// 单个步长层级的网格
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLevel {
  pub grid_h: usize,
  pub grid_w: usize,
  pub stride: f32,
}

impl GridLevel {
  pub fn new(grid_h: usize, grid_w: usize, stride: usize) -> Self {
    Self {
      grid_h,
      grid_w,
      stride: stride as f32,
    }
  }

  /// 单个通道的元素数
  pub fn grid_len(&self) -> usize {
    self.grid_h * self.grid_w
  }
}

/// 带量化参数的张量切片
#[derive(Debug, Clone, Copy)]
pub struct QuantSlice<'a, T> {
  pub data: &'a [T],
  pub qp: QuantParams,
}

impl<'a, T> QuantSlice<'a, T> {
  pub fn new(data: &'a [T], qp: QuantParams) -> Self {
    Self { data, qp }
  }
}
