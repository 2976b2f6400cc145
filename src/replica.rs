// 该文件是 Shanan （山南西风） 项目的一部分。
// src/replica.rs - 共享权重的模型副本集合
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

use thiserror::Error;
use tracing::{error, info};

use crate::{
  accelerator::{AcceleratorContext, CoreAllocator},
  model::{DetectionParams, Detector, DetectorBuilder, ModelError, ModelFamily},
};

/// 副本 1..N 的创建方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaStrategy {
  /// 复制副本 0 的上下文，共享权重内存
  #[default]
  SharedWeights,
  /// 每个副本都完整加载一次权重
  IndependentWeights,
}

#[derive(Error, Debug)]
pub enum ReplicaError {
  #[error("副本数量必须大于 0")]
  Empty,
  #[error("无法为 {0} 个副本分配内存")]
  OutOfMemory(usize),
  #[error("副本 {index} 创建失败: {source}")]
  Replica {
    index: usize,
    #[source]
    source: ModelError,
  },
}

pub struct ModelReplicaSet<C> {
  replicas: Vec<Detector<C>>,
  strategy: ReplicaStrategy,
}

impl<C: AcceleratorContext> ModelReplicaSet<C> {
  /// 读取权重文件并创建 `count` 个副本
  pub fn build(
    path: impl AsRef<Path>,
    count: usize,
    family: ModelFamily,
    params: DetectionParams,
    strategy: ReplicaStrategy,
    cores: &CoreAllocator,
  ) -> Result<Self, ReplicaError> {
    let path = path.as_ref();
    info!("加载模型文件: {}", path.display());
    let weights = std::fs::read(path).map_err(|e| ReplicaError::Replica {
      index: 0,
      source: ModelError::Io(e),
    })?;
    Self::from_weights(&weights, count, family, params, strategy, cores)
  }

  /// 使用 URL 描述的模型配置，每个集合独享一个核心分配器
  pub fn from_builder(
    builder: &DetectorBuilder,
    count: usize,
    strategy: ReplicaStrategy,
  ) -> Result<Self, ReplicaError> {
    Self::build(
      builder.model_path(),
      count,
      builder.family(),
      builder.detection_params().clone(),
      strategy,
      &CoreAllocator::new(builder.cores()),
    )
  }

  /// 副本 0 完整加载，其余按 `strategy` 创建。
  /// 任何一个副本失败时，已创建的副本全部释放后再返回错误。
  pub fn from_weights(
    weights: &[u8],
    count: usize,
    family: ModelFamily,
    params: DetectionParams,
    strategy: ReplicaStrategy,
    cores: &CoreAllocator,
  ) -> Result<Self, ReplicaError> {
    if count == 0 {
      return Err(ReplicaError::Empty);
    }

    let mut replicas: Vec<Detector<C>> = Vec::new();
    replicas
      .try_reserve_exact(count)
      .map_err(|_| ReplicaError::OutOfMemory(count))?;

    for index in 0..count {
      let replica = match (replicas.first(), strategy) {
        (Some(primary), ReplicaStrategy::SharedWeights) => {
          Detector::with_shared_context(primary, cores)
        }
        _ => Detector::new(weights, family, params.clone(), cores),
      };

      match replica {
        Ok(replica) => replicas.push(replica),
        Err(source) => {
          error!(
            "副本 {} 创建失败: {}, 释放已创建的 {} 个副本",
            index,
            source,
            replicas.len()
          );
          drop(replicas);
          return Err(ReplicaError::Replica { index, source });
        }
      }
    }

    info!("创建 {} 个 {} 副本 ({:?})", count, family, strategy);
    Ok(ModelReplicaSet { replicas, strategy })
  }
}

impl<C> ModelReplicaSet<C> {
  pub fn len(&self) -> usize {
    self.replicas.len()
  }

  pub fn is_empty(&self) -> bool {
    self.replicas.is_empty()
  }

  pub fn strategy(&self) -> ReplicaStrategy {
    self.strategy
  }

  pub fn get(&self, index: usize) -> Option<&Detector<C>> {
    self.replicas.get(index)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Detector<C>> {
    self.replicas.iter()
  }

  pub fn into_replicas(self) -> Vec<Detector<C>> {
    self.replicas
  }
}
