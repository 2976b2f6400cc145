// 该文件是 Shanan （山南西风） 项目的一部分。
// src/draw.rs - 检测结果可视化与文本记录
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

use std::path::Path;

use ab_glyph::{FontVec, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::{
  labels::Labels,
  model::{DetectItem, DetectResult, ImageRect},
};

const BOX_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色
const BOX_THICKNESS: u32 = 3;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("图像保存失败: {0}")]
  Image(#[from] image::ImageError),
  #[error("记录写入失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体加载失败: {0}")]
  Font(#[from] InvalidFont),
}

/// 未加载字体时只绘制边框
pub struct Draw {
  color: [u8; 3],
  thickness: u32,
  font: Option<FontVec>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      color: BOX_COLOR,
      thickness: BOX_THICKNESS,
      font: None,
    }
  }
}

impl Draw {
  pub fn color(mut self, color: [u8; 3]) -> Self {
    self.color = color;
    self
  }

  pub fn thickness(mut self, thickness: u32) -> Self {
    self.thickness = thickness.max(1);
    self
  }

  /// 加载 TrueType/OpenType 字体，用于在边框上方标注类别与分数
  pub fn font(mut self, path: &Path) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    self.font = Some(FontVec::try_from_vec(data)?);
    info!("标签字体已加载: {}", path.display());
    Ok(self)
  }

  /// 在原图上绘制空心边框，边框向内加粗
  pub fn draw_result(&self, image: &mut RgbImage, result: &DetectResult, labels: &Labels) {
    for item in result.items.iter() {
      let r = item.bbox;
      info!(
        "{} @ ({} {} {} {}) {:.3}",
        labels.name(item.class_id),
        r.left,
        r.top,
        r.right,
        r.bottom,
        item.score
      );

      for t in 0..self.thickness as i32 {
        let width = r.right - r.left - 2 * t;
        let height = r.bottom - r.top - 2 * t;
        if width <= 0 || height <= 0 {
          break;
        }
        let rect = Rect::at(r.left + t, r.top + t).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, rect, Rgb(self.color));
      }

      if let Some(font) = &self.font {
        self.draw_label(image, font, item, labels);
      }
    }
  }

  fn draw_label(&self, image: &mut RgbImage, font: &FontVec, item: &DetectItem, labels: &Labels) {
    let label = format!("{} {:.2}", labels.name(item.class_id), item.score);
    let Some(rect) = label_rect(&item.bbox, label.chars().count(), image.width()) else {
      return;
    };
    draw_filled_rect_mut(image, rect, Rgb(self.color));
    draw_text_mut(
      image,
      Rgb(LABEL_TEXT_COLOR),
      rect.left(),
      rect.top() + LABEL_TEXT_VERTICAL_PADDING,
      PxScale::from(LABEL_FONT_SIZE),
      font,
      &label,
    );
  }

  pub fn save(&self, image: &RgbImage, path: &Path) -> Result<(), DrawError> {
    image.save(path)?;
    info!("结果图像已保存: {}", path.display());
    Ok(())
  }
}

/// 标签背景位于边框上方，超出图像右侧的部分被截掉
fn label_rect(bbox: &ImageRect, chars: usize, image_width: u32) -> Option<Rect> {
  let x = bbox.left.max(0);
  let y = (bbox.top - LABEL_TEXT_HEIGHT).max(0);
  let text_width = (chars as f32 * LABEL_CHAR_WIDTH) as i32;
  let width = text_width.min(image_width as i32 - x);
  if width <= 0 {
    return None;
  }
  Some(Rect::at(x, y).of_size(width as u32, LABEL_TEXT_HEIGHT as u32))
}

/// 每个检测框一行：`label, score, left, top, right, bottom`
pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  pub fn render(&self, result: &DetectResult, labels: &Labels) -> String {
    result
      .items
      .iter()
      .map(|item| {
        let name = if self.label_with_name {
          labels.name(item.class_id).to_string()
        } else {
          item.class_id.to_string()
        };
        format!(
          "{}, {:.4}, {}, {}, {}, {}",
          name, item.score, item.bbox.left, item.bbox.top, item.bbox.right, item.bbox.bottom
        )
      })
      .collect::<Vec<_>>()
      .join("\n")
  }

  /// 写入与 `path` 同名的 `.txt` 文件
  pub fn record(&self, result: &DetectResult, labels: &Labels, path: &Path) -> Result<(), DrawError> {
    std::fs::write(path.with_extension("txt"), self.render(result, labels))?;
    Ok(())
  }
}
