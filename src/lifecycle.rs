// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/lifecycle.rs - 模型启动与就绪状态
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

use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::model::{BackendError, Classifier};

#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error("模型加载失败: {0}")]
  ModelLoad(#[source] BackendError),
  #[error("模型尚未加载, 服务未就绪")]
  NotReady,
}

/// 持有已加载的分类模型
///
/// 启动成功之前不提供模型，启动失败后保持未就绪。
#[derive(Debug, Default)]
pub struct Lifecycle {
  classifier: OnceLock<Arc<Classifier>>,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self::default()
  }

  /// 执行一次性的模型加载
  pub fn start<F, E>(&self, load: F) -> Result<(), LifecycleError>
  where
    F: FnOnce() -> Result<Classifier, E>,
    E: Into<BackendError>,
  {
    if self.is_ready() {
      warn!("模型已加载, 忽略重复启动");
      return Ok(());
    }

    info!("开始加载模型...");
    let now = std::time::Instant::now();
    let classifier = load().map_err(|e| {
      let e: BackendError = e.into();
      error!("模型加载失败: {}", e);
      LifecycleError::ModelLoad(e)
    })?;

    if self.classifier.set(Arc::new(classifier)).is_err() {
      warn!("模型已由其他调用加载");
    }
    info!("模型加载完成, 耗时: {:.2?}", now.elapsed());
    Ok(())
  }

  /// 从 `onnx://` URL 加载模型
  #[cfg(feature = "model_onnx")]
  pub fn start_onnx(&self, url: &url::Url) -> Result<(), LifecycleError> {
    use crate::{FromUrl, model::OnnxBackendBuilder};

    self.start(|| -> Result<Classifier, BackendError> {
      let backend = OnnxBackendBuilder::from_url(url)?.build()?;
      Ok(Classifier::new(backend))
    })
  }

  pub fn is_ready(&self) -> bool {
    self.classifier.get().is_some()
  }

  pub fn classifier(&self) -> Result<Arc<Classifier>, LifecycleError> {
    self
      .classifier
      .get()
      .cloned()
      .ok_or(LifecycleError::NotReady)
  }
}
