// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/model/onnx.rs - ONNX 推理后端
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

use std::path::PathBuf;

use ndarray::{Array2, ArrayView4, Axis};
use thiserror::Error;
use tracing::{debug, error, info};
use tract_onnx::prelude::*;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{INCEPTION_INPUT_SIZE, TENSOR_CHANNELS},
  model::{BackendError, InferenceBackend, NUM_CLASSES},
};

const ONNX_NUM_INPUTS: usize = 1;
const ONNX_NUM_OUTPUTS: usize = 1;

type OnnxPlan = TypedRunnableModel<TypedModel>;

/// tract 实现的 ONNX 后端，输入固定为 (1, 299, 299, 3)
pub struct OnnxBackend {
  plan: OnnxPlan,
}

#[derive(Error, Debug)]
pub enum OnnxBackendError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

pub struct OnnxBackendBuilder {
  model_path: PathBuf,
}

impl FromUrlWithScheme for OnnxBackendBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxBackendBuilder {
  type Error = OnnxBackendError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OnnxBackendError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(OnnxBackendBuilder {
      model_path: PathBuf::from(url.path()),
    })
  }
}

impl OnnxBackendBuilder {
  pub fn with_path(path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: path.into(),
    }
  }

  pub fn build(self) -> Result<OnnxBackend, OnnxBackendError> {
    info!("加载模型文件: {}", self.model_path.display());
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let model = tract_onnx::onnx()
      .model_for_read(&mut std::io::Cursor::new(model_data))
      .map_err(|e| OnnxBackendError::ModelInvalid(format!("无法解析 ONNX 模型: {}", e)))?;

    let num_inputs = model.inputs.len();
    let num_outputs = model.outputs.len();
    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    if num_inputs != ONNX_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        ONNX_NUM_INPUTS, num_inputs
      );
      return Err(OnnxBackendError::ModelInvalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        ONNX_NUM_INPUTS, num_inputs
      )));
    }

    if num_outputs != ONNX_NUM_OUTPUTS {
      error!(
        "预期模型输出数量为 {}, 实际为 {}",
        ONNX_NUM_OUTPUTS, num_outputs
      );
      return Err(OnnxBackendError::ModelInvalid(format!(
        "预期模型输出数量为 {}, 实际为 {}",
        ONNX_NUM_OUTPUTS, num_outputs
      )));
    }

    let size = INCEPTION_INPUT_SIZE as usize;
    info!("优化推理计划");
    let plan = model
      .with_input_fact(0, f32::fact([1, size, size, TENSOR_CHANNELS]).into())
      .and_then(|m| m.into_optimized())
      .and_then(|m| m.into_runnable())
      .map_err(|e| OnnxBackendError::ModelInvalid(format!("无法构建推理计划: {}", e)))?;
    info!("模型加载完成");

    Ok(OnnxBackend { plan })
  }
}

impl InferenceBackend for OnnxBackend {
  fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, BackendError> {
    let (n, h, w, c) = batch.dim();
    let mut probs = Array2::<f32>::zeros((n, NUM_CLASSES));

    // 推理计划的批大小固定为 1
    for (i, sample) in batch.axis_iter(Axis(0)).enumerate() {
      let data: Vec<f32> = sample.iter().copied().collect();
      let input = Tensor::from_shape(&[1, h, w, c], &data)?;
      let outputs = self.plan.run(tvec!(input.into()))?;
      let output = outputs.first().ok_or("模型没有输出")?;
      let values = output.as_slice::<f32>()?;
      if values.len() != NUM_CLASSES {
        return Err(format!("期望 {} 个类别概率, 实际 {}", NUM_CLASSES, values.len()).into());
      }
      for (j, &p) in values.iter().enumerate() {
        probs[[i, j]] = p;
      }
    }

    Ok(probs)
  }
}
