// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/model.rs - 分类模型
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

use std::fmt;

use ndarray::{Array2, Array4, ArrayView4, ArrayViewD, Axis, Ix4};
use thiserror::Error;
use tracing::{debug, error};

use crate::frame::{AsNhwcTensor, INCEPTION_INPUT_SIZE, InceptionTensor, TENSOR_CHANNELS};

/// 缺失值哨兵，模型内部的自定义层会把它映射为 0
pub const NAN_SENTINEL: f32 = -2.0;
pub const NUM_CLASSES: usize = 4;
const PROBABILITY_TOLERANCE: f32 = 1e-4;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

pub trait WithLabel: Sized + fmt::Debug {
  fn to_label_str(&self) -> String;
  fn to_label_id(&self) -> u32;
  fn from_label_id(id: u32) -> Option<Self>;
}

/// 作物健康类别，顺序与模型训练时一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthLabel {
  NonPlant,
  Unhealthy,
  Moderate,
  Healthy,
}

pub const HEALTH_LABELS: [HealthLabel; NUM_CLASSES] = [
  HealthLabel::NonPlant,
  HealthLabel::Unhealthy,
  HealthLabel::Moderate,
  HealthLabel::Healthy,
];

impl HealthLabel {
  pub fn as_str(&self) -> &'static str {
    match self {
      HealthLabel::NonPlant => "Non-Plant",
      HealthLabel::Unhealthy => "Unhealthy",
      HealthLabel::Moderate => "Moderate",
      HealthLabel::Healthy => "Healthy",
    }
  }
}

impl WithLabel for HealthLabel {
  fn to_label_str(&self) -> String {
    self.as_str().to_string()
  }

  fn to_label_id(&self) -> u32 {
    *self as u32
  }

  fn from_label_id(id: u32) -> Option<Self> {
    HEALTH_LABELS.get(id as usize).copied()
  }
}

impl fmt::Display for HealthLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
  pub label: HealthLabel,
  pub confidence: f32,
}

pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// 推理后端：(N, 299, 299, 3) -> (N, 4) 概率
pub trait InferenceBackend: Send + Sync {
  fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, BackendError>;
}

#[derive(Error, Debug)]
pub enum ClassifierError {
  #[error("张量形状无效: 期望 (N, 299, 299, 3) 或 (299, 299, 3), 实际 {0:?}")]
  InvalidShape(Vec<usize>),
  #[error("推理后端错误: {0}")]
  Backend(#[source] BackendError),
  #[error("模型输出无效: {0}")]
  InvalidOutput(String),
}

/// 已加载的分类模型，只读，可在多个请求间共享
pub struct Classifier {
  backend: Box<dyn InferenceBackend>,
}

impl fmt::Debug for Classifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Classifier").finish_non_exhaustive()
  }
}

impl Classifier {
  pub fn new(backend: impl InferenceBackend + 'static) -> Self {
    Self {
      backend: Box::new(backend),
    }
  }

  /// 单个或批量张量的第一项预测，返回 (类别索引, 置信度)
  pub fn predict(&self, tensor: ArrayViewD<'_, f32>) -> Result<(usize, f32), ClassifierError> {
    let predictions = self.predict_batch(tensor)?;
    predictions
      .into_iter()
      .next()
      .ok_or_else(|| ClassifierError::InvalidOutput("模型没有输出".to_string()))
  }

  pub fn predict_batch(
    &self,
    tensor: ArrayViewD<'_, f32>,
  ) -> Result<Vec<(usize, f32)>, ClassifierError> {
    let batch = to_batch(tensor)?;
    debug!("执行模型推理, 批大小: {}", batch.dim().0);

    let probs = self
      .backend
      .forward(batch.view())
      .map_err(ClassifierError::Backend)?;

    if probs.dim() != (batch.dim().0, NUM_CLASSES) {
      error!("模型输出形状不匹配: {:?}", probs.dim());
      return Err(ClassifierError::InvalidOutput(format!(
        "期望输出形状 ({}, {}), 实际 {:?}",
        batch.dim().0,
        NUM_CLASSES,
        probs.dim()
      )));
    }

    probs
      .axis_iter(Axis(0))
      .map(|row| reduce_probabilities(&row.to_vec()))
      .collect()
  }

  pub fn classify(&self, tensor: &InceptionTensor) -> Result<Classification, ClassifierError> {
    let (index, confidence) = self.predict(tensor.as_nhwc().into_dyn())?;
    let label = HEALTH_LABELS[index];
    debug!("分类结果: {} ({:.4})", label, confidence);
    Ok(Classification { label, confidence })
  }
}

impl Model for Classifier {
  type Input = InceptionTensor;
  type Output = Classification;
  type Error = ClassifierError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.classify(input)
  }
}

/// 补齐批维度，校验形状，并把 NaN 替换为哨兵值
fn to_batch(tensor: ArrayViewD<'_, f32>) -> Result<Array4<f32>, ClassifierError> {
  let shape = tensor.shape().to_vec();
  let batch = match tensor.ndim() {
    3 => tensor.insert_axis(Axis(0)),
    4 => tensor,
    _ => return Err(ClassifierError::InvalidShape(shape)),
  };
  let batch = batch
    .into_dimensionality::<Ix4>()
    .map_err(|_| ClassifierError::InvalidShape(shape.clone()))?;

  let (n, h, w, c) = batch.dim();
  let size = INCEPTION_INPUT_SIZE as usize;
  if n == 0 || h != size || w != size || c != TENSOR_CHANNELS {
    return Err(ClassifierError::InvalidShape(shape));
  }

  Ok(batch.mapv(|v| if v.is_nan() { NAN_SENTINEL } else { v }))
}

fn reduce_probabilities(row: &[f32]) -> Result<(usize, f32), ClassifierError> {
  let valid = row
    .iter()
    .all(|p| p.is_finite() && (-PROBABILITY_TOLERANCE..=1.0 + PROBABILITY_TOLERANCE).contains(p));
  if !valid {
    error!("模型输出不是概率向量: {:?}", row);
    return Err(ClassifierError::InvalidOutput(format!(
      "不是概率向量: {:?}",
      row
    )));
  }

  let mut best = 0usize;
  for (i, &p) in row.iter().enumerate() {
    if p > row[best] {
      best = i;
    }
  }
  Ok((best, row[best].clamp(0.0, 1.0)))
}

#[cfg(feature = "model_onnx")]
mod onnx;
#[cfg(feature = "model_onnx")]
pub use self::onnx::{OnnxBackend, OnnxBackendBuilder, OnnxBackendError};
