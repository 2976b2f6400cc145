// 该文件是 Shanan （山南西风） 项目的一部分。
// src/letterbox.rs - 保持宽高比的缩放与填充
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

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pads {
  pub left: u32,
  pub right: u32,
  pub top: u32,
  pub bottom: u32,
}

#[derive(Debug, Clone)]
pub struct Letterbox {
  /// 与模型输入尺寸一致的图像，像素按 HWC 排列
  pub image: RgbImage,
  pub pads: Pads,
  pub scale: f32,
}

impl Letterbox {
  /// NHWC uint8 输入缓冲
  pub fn as_nhwc(&self) -> &[u8] {
    self.image.as_raw()
  }
}

/// 等比缩放到 `target_w x target_h` 以内，剩余部分用 `pad_color` 填充。
///
/// 左、上两侧取填充量的一半，右、下两侧取剩余部分。
pub fn letterbox(image: &RgbImage, target_w: u32, target_h: u32, pad_color: [u8; 3]) -> Letterbox {
  let (src_w, src_h) = image.dimensions();
  let scale = (target_w as f32 / src_w.max(1) as f32).min(target_h as f32 / src_h.max(1) as f32);

  let resized_w = ((src_w as f32 * scale).round() as u32).clamp(1, target_w.max(1));
  let resized_h = ((src_h as f32 * scale).round() as u32).clamp(1, target_h.max(1));

  let pad_w = target_w.saturating_sub(resized_w);
  let pad_h = target_h.saturating_sub(resized_h);
  let pads = Pads {
    left: pad_w / 2,
    right: pad_w - pad_w / 2,
    top: pad_h / 2,
    bottom: pad_h - pad_h / 2,
  };

  debug!(
    "letterbox: {}x{} -> {}x{}, scale={:.4}, pads={:?}",
    src_w, src_h, resized_w, resized_h, scale, pads
  );

  let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb(pad_color));
  if (resized_w, resized_h) == (src_w, src_h) {
    imageops::overlay(&mut canvas, image, pads.left as i64, pads.top as i64);
  } else {
    let resized = imageops::resize(image, resized_w, resized_h, FilterType::Triangle);
    imageops::overlay(&mut canvas, &resized, pads.left as i64, pads.top as i64);
  }

  Letterbox {
    image: canvas,
    pads,
    scale,
  }
}
