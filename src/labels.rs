// 该文件是 Shanan （山南西风） 项目的一部分。
// src/labels.rs - 类别名称表
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

use tracing::{debug, warn};

/// 找不到名称时使用的占位符
pub const UNKNOWN_LABEL: &str = "null";

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck",
  "boat", "traffic light", "fire hydrant", "stop sign", "parking meter", "bench",
  "bird", "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra",
  "giraffe", "backpack", "umbrella", "handbag", "tie", "suitcase", "frisbee",
  "skis", "snowboard", "sports ball", "kite", "baseball bat", "baseball glove",
  "skateboard", "surfboard", "tennis racket", "bottle", "wine glass", "cup",
  "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
  "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
  "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
  "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
  "refrigerator", "book", "clock", "vase", "scissors", "teddy bear",
  "hair drier", "toothbrush",
];

/// 按类别编号查找显示名称，仅用于展示
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
  names: Vec<String>,
}

impl Default for Labels {
  fn default() -> Self {
    Self::coco()
  }
}

impl Labels {
  pub fn coco() -> Self {
    Labels {
      names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
    }
  }

  /// 每行一个名称，最多读取 `max` 行。文件不可读时所有编号都回退为占位符。
  pub fn load(path: impl AsRef<Path>, max: usize) -> Self {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
      Ok(text) => {
        let names: Vec<String> = text
          .lines()
          .take(max)
          .map(|line| line.trim_end().to_string())
          .collect();
        if names.len() < max {
          warn!(
            "标签文件 {} 只有 {} 行, 少于类别数 {}",
            path.display(),
            names.len(),
            max
          );
        }
        debug!("载入 {} 个标签: {}", names.len(), path.display());
        Labels { names }
      }
      Err(e) => {
        warn!("无法读取标签文件 {}: {}, 使用占位名称", path.display(), e);
        Labels { names: Vec::new() }
      }
    }
  }

  pub fn name(&self, class_id: usize) -> &str {
    self
      .names
      .get(class_id)
      .map(String::as_str)
      .unwrap_or(UNKNOWN_LABEL)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_coco_default() {
    let labels = Labels::default();
    assert_eq!(labels.len(), 80);
    assert_eq!(labels.name(0), "person");
    assert_eq!(labels.name(5), "bus");
    assert_eq!(labels.name(79), "toothbrush");
    assert_eq!(labels.name(80), UNKNOWN_LABEL);
  }

  #[test]
  fn test_load_truncates_to_max() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cat\ndog\nbird\r\nfish").unwrap();

    let labels = Labels::load(file.path(), 3);
    assert_eq!(labels.len(), 3);
    assert_eq!(labels.name(2), "bird");
    assert_eq!(labels.name(3), UNKNOWN_LABEL);
  }

  #[test]
  fn test_missing_file_degrades() {
    let dir = tempfile::tempdir().unwrap();
    let labels = Labels::load(dir.path().join("missing.txt"), 80);
    assert!(labels.is_empty());
    assert_eq!(labels.name(0), UNKNOWN_LABEL);
  }
}
