// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/pipeline.rs - 分类流水线编排
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

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{INCEPTION_INPUT_SIZE, InceptionTensor},
  index::{IndexError, center_square_crop, pseudo_ndvi, vari},
  input::{ImageKind, IngestError, RasterIngestor, RawImageInput, SourceKind, decode_rgb},
  lifecycle::LifecycleError,
  model::{Classifier, ClassifierError, HealthLabel, Model},
  normalize::{NormalizationPolicy, NormalizeError, Normalizer, Smoothing},
  raster::{GeoBounds, VegetationIndexMap},
};

type InceptionNormalizer = Normalizer<INCEPTION_INPUT_SIZE, INCEPTION_INPUT_SIZE>;
type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// 错误类别，供调用方分支处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
  InvalidInputShape,
  UnsupportedFormat,
  DecodeError,
  TransferIntegrity,
  ModelLoadError,
  InferenceError,
  NotReady,
  Timeout,
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("[{stage}] 输入形状无效: {source}")]
  InvalidInputShape {
    stage: &'static str,
    #[source]
    source: BoxedError,
  },
  #[error("[{stage}] 不支持的格式: {source}")]
  UnsupportedFormat {
    stage: &'static str,
    #[source]
    source: BoxedError,
  },
  #[error("[{stage}] 解码失败: {source}")]
  DecodeError {
    stage: &'static str,
    #[source]
    source: BoxedError,
  },
  #[error("传输不完整: 声明 {expected:?} 字节, 实际 {actual} 字节")]
  TransferIntegrity { expected: Option<u64>, actual: usize },
  #[error("模型加载失败: {0}")]
  ModelLoad(#[source] LifecycleError),
  #[error("[{stage}] 推理失败: {source}")]
  Inference {
    stage: &'static str,
    #[source]
    source: BoxedError,
  },
  #[error("服务未就绪")]
  NotReady,
  #[error("请求超时: 超过 {budget:.2?}")]
  Timeout { budget: Duration },
}

impl PipelineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PipelineError::InvalidInputShape { .. } => ErrorKind::InvalidInputShape,
      PipelineError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
      PipelineError::DecodeError { .. } => ErrorKind::DecodeError,
      PipelineError::TransferIntegrity { .. } => ErrorKind::TransferIntegrity,
      PipelineError::ModelLoad(_) => ErrorKind::ModelLoadError,
      PipelineError::Inference { .. } => ErrorKind::InferenceError,
      PipelineError::NotReady => ErrorKind::NotReady,
      PipelineError::Timeout { .. } => ErrorKind::Timeout,
    }
  }

  fn ingest(stage: &'static str, err: IngestError) -> Self {
    match err {
      IngestError::UnsupportedFormat(_) | IngestError::SchemeMismatch(_) => {
        PipelineError::UnsupportedFormat {
          stage,
          source: Box::new(err),
        }
      }
      IngestError::DecodeError(_) | IngestError::Staging(_) => PipelineError::DecodeError {
        stage,
        source: Box::new(err),
      },
    }
  }

  fn index(stage: &'static str, err: IndexError) -> Self {
    PipelineError::InvalidInputShape {
      stage,
      source: Box::new(err),
    }
  }

  fn normalize(stage: &'static str, err: NormalizeError) -> Self {
    PipelineError::InvalidInputShape {
      stage,
      source: Box::new(err),
    }
  }

  fn classifier(stage: &'static str, err: ClassifierError) -> Self {
    match err {
      ClassifierError::InvalidShape(_) => PipelineError::InvalidInputShape {
        stage,
        source: Box::new(err),
      },
      _ => PipelineError::Inference {
        stage,
        source: Box::new(err),
      },
    }
  }
}

impl From<LifecycleError> for PipelineError {
  fn from(err: LifecycleError) -> Self {
    match err {
      LifecycleError::NotReady => PipelineError::NotReady,
      err => PipelineError::ModelLoad(err),
    }
  }
}

/// 各路径的归一化配置
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
  pub rgb_policy: NormalizationPolicy,
  pub ndvi_policy: NormalizationPolicy,
  pub webcam_policy: NormalizationPolicy,
  /// NDVI 文件路径在缩放前做 5x5 高斯模糊
  pub ndvi_smoothing: bool,
  /// 字节流暂存目录，`None` 使用系统临时目录
  pub staging_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      rgb_policy: NormalizationPolicy::RangePreserving,
      ndvi_policy: NormalizationPolicy::RangePreserving,
      webcam_policy: NormalizationPolicy::MinMaxRescale,
      ndvi_smoothing: true,
      staging_dir: None,
    }
  }
}

/// 实际执行的处理路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePath {
  Rgb,
  Ndvi,
  #[serde(rename = "webcam")]
  WebcamProxy,
}

impl fmt::Display for PipelinePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PipelinePath::Rgb => "rgb",
      PipelinePath::Ndvi => "ndvi",
      PipelinePath::WebcamProxy => "webcam",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone)]
pub struct ClassificationRequest {
  pub image_reference: String,
  pub input: RawImageInput,
}

impl ClassificationRequest {
  pub fn new(image_reference: impl Into<String>, input: RawImageInput) -> Self {
    Self {
      image_reference: image_reference.into(),
      input,
    }
  }
}

impl FromUrlWithScheme for ClassificationRequest {
  const SCHEME: &'static str = RawImageInput::SCHEME;
}

/// 在 [`RawImageInput`] 的基础上读取 `reference` 参数，缺省为文件路径
impl FromUrl for ClassificationRequest {
  type Error = IngestError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let input = RawImageInput::from_url(url)?;
    let image_reference = url
      .query_pairs()
      .find(|(k, _)| k == "reference")
      .map(|(_, v)| v.into_owned())
      .unwrap_or_else(|| url.path().to_string());
    Ok(Self::new(image_reference, input))
  }
}

/// 一次成功分类的结果，创建后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
  pub label: HealthLabel,
  pub confidence: f32,
  pub image_reference: String,
}

/// 交给持久化方的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
  pub class_label: String,
  pub confidence: f32,
  pub image_reference: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub geodata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ClassificationOutcome {
  pub result: ClassificationResult,
  pub geodata: Option<GeoBounds>,
  pub path: PipelinePath,
  pub source_kind: SourceKind,
}

impl ClassificationOutcome {
  pub fn record(&self) -> ClassificationRecord {
    ClassificationRecord {
      class_label: self.result.label.to_string(),
      confidence: self.result.confidence,
      image_reference: self.result.image_reference.clone(),
      geodata: self.geodata.as_ref().map(GeoBounds::to_geojson),
    }
  }
}

/// 声明为 rgb 但字节实际是 TIFF 时按 NDVI 处理
///
/// `source` 来自 [`SourceKind::resolve`]，文件头优先于内容类型与文件名。
pub fn correct_declared_kind(declared: ImageKind, source: SourceKind) -> ImageKind {
  match (declared, source) {
    (ImageKind::Rgb, SourceKind::SingleBandRaster | SourceKind::MultiBandRaster) => {
      warn!("声明为 rgb 但内容为 TIFF ({:?}), 按 ndvi 处理", source);
      ImageKind::Ndvi
    }
    (kind, _) => kind,
  }
}

fn check_integrity(input: &RawImageInput) -> Result<(), PipelineError> {
  let actual = input.bytes.len();
  let mismatched = input
    .declared_length
    .map(|expected| expected != actual as u64)
    .unwrap_or(false);
  if actual == 0 || mismatched {
    error!(
      "传输校验失败: 声明 {:?} 字节, 实际 {} 字节",
      input.declared_length, actual
    );
    return Err(PipelineError::TransferIntegrity {
      expected: input.declared_length,
      actual,
    });
  }
  Ok(())
}

/// 按声明类别串联读取、指数计算、归一化与推理
#[derive(Debug, Clone)]
pub struct Orchestrator {
  classifier: Arc<Classifier>,
  config: PipelineConfig,
  ingestor: RasterIngestor,
}

impl Orchestrator {
  pub fn new(classifier: Arc<Classifier>, config: PipelineConfig) -> Self {
    let ingestor = RasterIngestor::new().with_staging_dir(config.staging_dir.clone());
    Self {
      classifier,
      config,
      ingestor,
    }
  }

  pub fn classify(
    &self,
    request: &ClassificationRequest,
  ) -> Result<ClassificationOutcome, PipelineError> {
    let input = &request.input;
    info!(
      "开始分类: {} (声明类别 {}, {} 字节)",
      request.image_reference,
      input.declared_kind,
      input.bytes.len()
    );
    let now = std::time::Instant::now();

    check_integrity(input)?;
    let source_kind = SourceKind::resolve(
      &input.bytes,
      input.content_type.as_deref(),
      input.filename.as_deref(),
    )
    .map_err(|e| PipelineError::ingest("格式识别", e))?;
    let declared = correct_declared_kind(input.declared_kind, source_kind);

    let path = match declared {
      ImageKind::Rgb => PipelinePath::Rgb,
      ImageKind::Ndvi => PipelinePath::Ndvi,
      ImageKind::WebcamProxy => PipelinePath::WebcamProxy,
      ImageKind::Unknown if source_kind.is_raster() => PipelinePath::Ndvi,
      ImageKind::Unknown => PipelinePath::Rgb,
    };
    debug!("处理路径: {}, 输入格式: {:?}", path, source_kind);

    let (tensor, geodata) = match path {
      PipelinePath::Rgb => (self.rgb_tensor(&input.bytes)?, None),
      PipelinePath::Ndvi => self.ndvi_tensor(&input.bytes, source_kind)?,
      PipelinePath::WebcamProxy => (self.webcam_tensor(&input.bytes)?, None),
    };

    let classification = self
      .classifier
      .classify(&tensor)
      .map_err(|e| PipelineError::classifier("推理", e))?;

    info!(
      "分类完成: {} -> {} ({:.4}), 耗时: {:.2?}",
      request.image_reference,
      classification.label,
      classification.confidence,
      now.elapsed()
    );

    Ok(ClassificationOutcome {
      result: ClassificationResult {
        label: classification.label,
        confidence: classification.confidence,
        image_reference: request.image_reference.clone(),
      },
      geodata,
      path,
      source_kind,
    })
  }

  fn rgb_tensor(&self, bytes: &[u8]) -> Result<InceptionTensor, PipelineError> {
    let rgb = decode_rgb(bytes).map_err(|e| PipelineError::ingest("RGB 解码", e))?;
    let map = vari(rgb.view()).map_err(|e| PipelineError::index("VARI", e))?;
    InceptionNormalizer::new(self.config.rgb_policy, Smoothing::None)
      .normalize(map.data().view())
      .map_err(|e| PipelineError::normalize("归一化", e))
  }

  fn ndvi_tensor(
    &self,
    bytes: &[u8],
    source_kind: SourceKind,
  ) -> Result<(InceptionTensor, Option<GeoBounds>), PipelineError> {
    let raster = self
      .ingestor
      .ingest_bytes(bytes, source_kind)
      .map_err(|e| PipelineError::ingest("栅格读取", e))?;
    let geodata = raster.bounds().cloned();
    let map = VegetationIndexMap::from_ndvi(raster);

    let smoothing = if self.config.ndvi_smoothing {
      Smoothing::Gaussian5x5
    } else {
      Smoothing::None
    };
    let tensor = InceptionNormalizer::new(self.config.ndvi_policy, smoothing)
      .normalize(map.data().view())
      .map_err(|e| PipelineError::normalize("归一化", e))?;
    Ok((tensor, geodata))
  }

  fn webcam_tensor(&self, bytes: &[u8]) -> Result<InceptionTensor, PipelineError> {
    let rgb = decode_rgb(bytes).map_err(|e| PipelineError::ingest("画面解码", e))?;
    let square = center_square_crop(rgb.view());
    let map = pseudo_ndvi(square).map_err(|e| PipelineError::index("伪 NDVI", e))?;
    InceptionNormalizer::new(self.config.webcam_policy, Smoothing::None)
      .normalize(map.data().view())
      .map_err(|e| PipelineError::normalize("归一化", e))
  }
}

impl Model for Orchestrator {
  type Input = ClassificationRequest;
  type Output = ClassificationOutcome;
  type Error = PipelineError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.classify(input)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::fixtures::{gray_tiff, npy_f4};
  use crate::model::{BackendError, InferenceBackend};
  use image::{ImageFormat, Rgb, RgbImage};
  use ndarray::{Array2, ArrayView4};
  use std::io::Cursor;

  /// 总是以 0.7 判为 Healthy
  struct Confident;

  impl InferenceBackend for Confident {
    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, BackendError> {
      let mut out = Array2::zeros((batch.dim().0, 4));
      out.column_mut(3).fill(0.7);
      out.column_mut(2).fill(0.3);
      Ok(out)
    }
  }

  fn orchestrator() -> Orchestrator {
    Orchestrator::new(Arc::new(Classifier::new(Confident)), PipelineConfig::default())
  }

  fn png(image: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
  }

  #[test]
  fn test_correct_declared_kind() {
    assert_eq!(
      correct_declared_kind(ImageKind::Rgb, SourceKind::SingleBandRaster),
      ImageKind::Ndvi
    );
    assert_eq!(
      correct_declared_kind(ImageKind::Rgb, SourceKind::MultiBandRaster),
      ImageKind::Ndvi
    );
    assert_eq!(
      correct_declared_kind(ImageKind::Rgb, SourceKind::StandardImage),
      ImageKind::Rgb
    );
    assert_eq!(
      correct_declared_kind(ImageKind::WebcamProxy, SourceKind::SingleBandRaster),
      ImageKind::WebcamProxy
    );
  }

  #[test]
  fn test_transfer_integrity() {
    let orchestrator = orchestrator();
    let request = ClassificationRequest::new(
      "img-1",
      RawImageInput::new(vec![0u8; 500], ImageKind::Ndvi).with_declared_length(1000),
    );
    let err = orchestrator.classify(&request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransferIntegrity);

    let empty = ClassificationRequest::new("img-2", RawImageInput::new(Vec::new(), ImageKind::Rgb));
    assert_eq!(
      orchestrator.classify(&empty).unwrap_err().kind(),
      ErrorKind::TransferIntegrity
    );
  }

  #[test]
  fn test_rgb_path() {
    let image = RgbImage::from_pixel(64, 48, Rgb([40, 180, 60]));
    let request = ClassificationRequest::new(
      "leaf.png",
      RawImageInput::new(png(&image), ImageKind::Rgb).with_content_type("image/png"),
    );
    let outcome = orchestrator().classify(&request).unwrap();
    assert_eq!(outcome.path, PipelinePath::Rgb);
    assert_eq!(outcome.source_kind, SourceKind::StandardImage);
    assert_eq!(outcome.result.label, HealthLabel::Healthy);
    assert!((outcome.result.confidence - 0.7).abs() < 1e-6);
    assert!(outcome.geodata.is_none());
  }

  #[test]
  fn test_tiff_declared_rgb_takes_ndvi_path() {
    let tiff = gray_tiff(8, 8, &[0.4; 64], true);
    let request = ClassificationRequest::new(
      "field.tif",
      RawImageInput::new(tiff, ImageKind::Rgb).with_content_type("image/tiff"),
    );
    let outcome = orchestrator().classify(&request).unwrap();
    assert_eq!(outcome.path, PipelinePath::Ndvi);
    assert_eq!(outcome.source_kind, SourceKind::SingleBandRaster);
    let bounds = outcome.geodata.as_ref().unwrap();
    assert_eq!(bounds.crs.as_deref(), Some("EPSG:4326"));
    assert!(outcome.record().geodata.is_some());
  }

  #[test]
  fn test_tiff_declared_rgb_without_content_type() {
    let orchestrator = orchestrator();
    let tiff = gray_tiff(8, 8, &[0.4; 64], false);
    let untyped = ClassificationRequest::new(
      "field.tif",
      RawImageInput::new(tiff.clone(), ImageKind::Rgb).with_filename("field.tif"),
    );
    let outcome = orchestrator.classify(&untyped).unwrap();
    assert_eq!(outcome.path, PipelinePath::Ndvi);
    assert_eq!(outcome.source_kind, SourceKind::SingleBandRaster);

    let octet = ClassificationRequest::new(
      "upload",
      RawImageInput::new(tiff, ImageKind::Rgb).with_content_type("application/octet-stream"),
    );
    assert_eq!(orchestrator.classify(&octet).unwrap().path, PipelinePath::Ndvi);
  }

  #[test]
  fn test_unknown_kind_inferred_from_source() {
    let npy = npy_f4(&[2, 2], &[0.1, 0.2, 0.3, 0.4]);
    let request = ClassificationRequest::new("a.npy", RawImageInput::new(npy, ImageKind::Unknown));
    let outcome = orchestrator().classify(&request).unwrap();
    assert_eq!(outcome.path, PipelinePath::Ndvi);
    assert_eq!(outcome.source_kind, SourceKind::NumericArray);
  }

  #[test]
  fn test_webcam_path() {
    let image = RgbImage::from_pixel(80, 40, Rgb([30, 200, 30]));
    let request = ClassificationRequest::new("cam", RawImageInput::new(png(&image), ImageKind::WebcamProxy));
    let outcome = orchestrator().classify(&request).unwrap();
    assert_eq!(outcome.path, PipelinePath::WebcamProxy);
    assert!(outcome.geodata.is_none());
  }

  #[test]
  fn test_unsupported_and_corrupt_inputs() {
    let orchestrator = orchestrator();
    let text = ClassificationRequest::new(
      "notes",
      RawImageInput::new(b"hello".to_vec(), ImageKind::Rgb)
        .with_content_type("text/plain")
        .with_filename("notes.txt"),
    );
    assert_eq!(
      orchestrator.classify(&text).unwrap_err().kind(),
      ErrorKind::UnsupportedFormat
    );

    let mut bytes = png(&RgbImage::new(4, 4));
    bytes.truncate(24);
    let corrupt = ClassificationRequest::new("broken", RawImageInput::new(bytes, ImageKind::Rgb));
    assert_eq!(
      orchestrator.classify(&corrupt).unwrap_err().kind(),
      ErrorKind::DecodeError
    );
  }

  #[test]
  fn test_record_serialization() {
    let outcome = ClassificationOutcome {
      result: ClassificationResult {
        label: HealthLabel::Moderate,
        confidence: 0.5,
        image_reference: "img-9".to_string(),
      },
      geodata: None,
      path: PipelinePath::Rgb,
      source_kind: SourceKind::StandardImage,
    };
    let json = serde_json::to_value(outcome.record()).unwrap();
    assert_eq!(json["class_label"], "Moderate");
    assert_eq!(json["image_reference"], "img-9");
    assert!(json.get("geodata").is_none());
  }

  #[test]
  fn test_lifecycle_errors_map_to_kinds() {
    assert_eq!(
      PipelineError::from(LifecycleError::NotReady).kind(),
      ErrorKind::NotReady
    );
    assert_eq!(
      PipelineError::from(LifecycleError::ModelLoad("损坏".into())).kind(),
      ErrorKind::ModelLoadError
    );
  }
}
