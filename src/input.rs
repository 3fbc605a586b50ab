// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/input.rs - 栅格/图像输入
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

use std::{
  fmt,
  fs::File,
  io::BufReader,
  path::{Path, PathBuf},
  str::FromStr,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, raster::Raster};

mod geotiff;
mod numeric_array;
mod staging;
mod standard_image;

pub use self::geotiff::read_geotiff;
pub use self::numeric_array::read_npy;
pub use self::staging::StagedFile;
pub use self::standard_image::decode_rgb;

#[derive(Error, Debug)]
pub enum IngestError {
  #[error("不支持的格式: {0}")]
  UnsupportedFormat(String),
  #[error("解码失败: {0}")]
  DecodeError(String),
  #[error("临时文件错误: {0}")]
  Staging(#[from] std::io::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 上游声明的图像类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageKind {
  Rgb,
  Ndvi,
  /// 摄像头画面，走伪 NDVI 路径
  WebcamProxy,
  #[default]
  Unknown,
}

impl FromStr for ImageKind {
  type Err = std::convert::Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s.trim().to_ascii_lowercase().as_str() {
      "rgb" => ImageKind::Rgb,
      "ndvi" => ImageKind::Ndvi,
      "webcam" => ImageKind::WebcamProxy,
      _ => ImageKind::Unknown,
    })
  }
}

impl fmt::Display for ImageKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ImageKind::Rgb => "rgb",
      ImageKind::Ndvi => "ndvi",
      ImageKind::WebcamProxy => "webcam",
      ImageKind::Unknown => "unknown",
    };
    f.write_str(name)
  }
}

/// 输入源的具体格式，在入口处解析一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
  /// `.npy` 稠密数组
  NumericArray,
  /// 单波段 TIFF/GeoTIFF
  SingleBandRaster,
  /// 多波段 TIFF/GeoTIFF
  MultiBandRaster,
  /// JPEG / PNG
  StandardImage,
}

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const TIFF_MAGICS: [&[u8]; 4] = [b"II*\0", b"MM\0*", b"II+\0", b"MM\0+"];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claimed {
  Npy,
  Tiff,
  Image,
}

/// 去掉参数并转为小写的 MIME 类型
pub fn media_type(content_type: &str) -> String {
  content_type
    .split(';')
    .next()
    .unwrap_or_default()
    .trim()
    .to_ascii_lowercase()
}

pub fn is_tiff_media_type(content_type: &str) -> bool {
  matches!(
    media_type(content_type).as_str(),
    "image/tiff" | "image/tif" | "image/x-tiff" | "image/geotiff"
  )
}

fn sniff(bytes: &[u8]) -> Option<Claimed> {
  if bytes.starts_with(NPY_MAGIC) {
    Some(Claimed::Npy)
  } else if TIFF_MAGICS.iter().any(|m| bytes.starts_with(m)) {
    Some(Claimed::Tiff)
  } else if bytes.starts_with(JPEG_MAGIC) || bytes.starts_with(PNG_MAGIC) {
    Some(Claimed::Image)
  } else {
    None
  }
}

fn claimed_by_content_type(content_type: &str) -> Option<Claimed> {
  if is_tiff_media_type(content_type) {
    return Some(Claimed::Tiff);
  }
  match media_type(content_type).as_str() {
    "image/jpeg" | "image/jpg" | "image/png" => Some(Claimed::Image),
    "application/x-npy" | "application/npy" => Some(Claimed::Npy),
    _ => None,
  }
}

fn claimed_by_extension(filename: &str) -> Option<Claimed> {
  let extension = Path::new(filename)
    .extension()?
    .to_str()?
    .to_ascii_lowercase();
  match extension.as_str() {
    "npy" => Some(Claimed::Npy),
    "tif" | "tiff" => Some(Claimed::Tiff),
    "jpg" | "jpeg" | "png" => Some(Claimed::Image),
    _ => None,
  }
}

impl SourceKind {
  /// 依次按文件头、内容类型、扩展名确定格式
  pub fn resolve(
    bytes: &[u8],
    content_type: Option<&str>,
    filename: Option<&str>,
  ) -> Result<Self, IngestError> {
    let hinted = content_type
      .and_then(claimed_by_content_type)
      .or_else(|| filename.and_then(claimed_by_extension));
    let sniffed = sniff(bytes);

    if let (Some(h), Some(s)) = (hinted, sniffed)
      && h != s
    {
      warn!("声明格式 {:?} 与文件头 {:?} 不符, 以文件头为准", h, s);
    }

    let claimed = sniffed.or(hinted).ok_or_else(|| {
      error!(
        "无法识别的输入格式, content-type: {:?}, 文件名: {:?}",
        content_type, filename
      );
      IngestError::UnsupportedFormat(format!(
        "content-type {:?}, 文件名 {:?}",
        content_type, filename
      ))
    })?;

    let kind = match claimed {
      Claimed::Npy => SourceKind::NumericArray,
      Claimed::Image => SourceKind::StandardImage,
      Claimed::Tiff => {
        if geotiff::band_count(bytes)? > 1 {
          SourceKind::MultiBandRaster
        } else {
          SourceKind::SingleBandRaster
        }
      }
    };
    debug!("输入格式: {:?}", kind);
    Ok(kind)
  }

  pub fn is_raster(&self) -> bool {
    !matches!(self, SourceKind::StandardImage)
  }

  fn staging_suffix(&self) -> &'static str {
    match self {
      SourceKind::NumericArray => ".npy",
      SourceKind::SingleBandRaster | SourceKind::MultiBandRaster => ".tiff",
      SourceKind::StandardImage => ".img",
    }
  }
}

/// 一次分类请求携带的原始数据
#[derive(Debug, Clone, Default)]
pub struct RawImageInput {
  pub bytes: Vec<u8>,
  pub declared_kind: ImageKind,
  pub content_type: Option<String>,
  pub declared_length: Option<u64>,
  pub filename: Option<String>,
}

impl RawImageInput {
  pub fn new(bytes: Vec<u8>, declared_kind: ImageKind) -> Self {
    Self {
      bytes,
      declared_kind,
      ..Default::default()
    }
  }

  pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
    self.content_type = Some(content_type.into());
    self
  }

  pub fn with_declared_length(mut self, length: u64) -> Self {
    self.declared_length = Some(length);
    self
  }

  pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
    self.filename = Some(filename.into());
    self
  }
}

impl FromUrlWithScheme for RawImageInput {
  const SCHEME: &'static str = "file";
}

/// `file:///path?kind=ndvi&content_type=image/tiff&content_length=1234`
impl FromUrl for RawImageInput {
  type Error = IngestError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(IngestError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = url
      .to_file_path()
      .unwrap_or_else(|_| PathBuf::from(url.path()));
    let bytes = std::fs::read(&path)?;

    let mut input = RawImageInput::new(bytes, ImageKind::Unknown);
    input.filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "kind" => input.declared_kind = value.parse().unwrap_or_default(),
        "content_type" => input.content_type = Some(value.into_owned()),
        "content_length" => match value.parse() {
          Ok(length) => input.declared_length = Some(length),
          Err(_) => warn!("忽略无效的 content_length: {}", value),
        },
        _ => {}
      }
    }

    info!(
      "读取输入文件: {} ({} 字节, 声明类别 {})",
      path.display(),
      input.bytes.len(),
      input.declared_kind
    );
    Ok(input)
  }
}

/// 将数组文件或 GeoTIFF 读入为 [`Raster`]
#[derive(Debug, Clone, Default)]
pub struct RasterIngestor {
  staging_dir: Option<PathBuf>,
}

impl RasterIngestor {
  pub fn new() -> Self {
    Self::default()
  }

  /// 临时文件存放目录，默认使用系统临时目录
  pub fn with_staging_dir(mut self, dir: Option<PathBuf>) -> Self {
    self.staging_dir = dir;
    self
  }

  /// 字节流先落到临时文件再读取，临时文件在返回前删除
  pub fn ingest_bytes(&self, bytes: &[u8], kind: SourceKind) -> Result<Raster, IngestError> {
    let staged = StagedFile::stage(bytes, kind.staging_suffix(), self.staging_dir.as_deref())?;
    self.ingest_path(staged.path(), kind)
  }

  pub fn ingest_path(&self, path: &Path, kind: SourceKind) -> Result<Raster, IngestError> {
    debug!("读取栅格: {} ({:?})", path.display(), kind);
    let reader = BufReader::new(File::open(path)?);
    let raster = match kind {
      SourceKind::NumericArray => Raster::new(read_npy(reader)?),
      SourceKind::SingleBandRaster | SourceKind::MultiBandRaster => read_geotiff(reader)?,
      SourceKind::StandardImage => {
        return Err(IngestError::UnsupportedFormat(
          "普通图像不是栅格输入".to_string(),
        ));
      }
    };
    let (height, width) = raster.shape();
    info!(
      "栅格读取完成: {}x{}, 地理范围: {}",
      width,
      height,
      if raster.bounds().is_some() { "有" } else { "无" }
    );
    Ok(raster)
  }

  /// 按路径读取，格式由文件内容与扩展名确定
  pub fn ingest_file(&self, path: &Path) -> Result<(SourceKind, Raster), IngestError> {
    let bytes = std::fs::read(path)?;
    let filename = path.file_name().and_then(|n| n.to_str());
    let kind = SourceKind::resolve(&bytes, None, filename)?;
    let raster = self.ingest_path(path, kind)?;
    Ok((kind, raster))
  }
}


#[cfg(test)]
mod tests {
  use super::fixtures::*;
  use super::*;

  #[test]
  fn test_image_kind_parse() {
    assert_eq!("RGB".parse::<ImageKind>().unwrap(), ImageKind::Rgb);
    assert_eq!("ndvi".parse::<ImageKind>().unwrap(), ImageKind::Ndvi);
    assert_eq!("webcam".parse::<ImageKind>().unwrap(), ImageKind::WebcamProxy);
    assert_eq!("thermal".parse::<ImageKind>().unwrap(), ImageKind::Unknown);
  }

  #[test]
  fn test_media_type() {
    assert_eq!(media_type("Image/TIFF; application=geotiff"), "image/tiff");
    assert!(is_tiff_media_type("image/tiff"));
    assert!(!is_tiff_media_type("image/png"));
  }

  #[test]
  fn test_resolve_by_magic() {
    let tiff = gray_tiff(2, 2, &[0.0; 4], false);
    assert_eq!(
      SourceKind::resolve(&tiff, None, None).unwrap(),
      SourceKind::SingleBandRaster
    );

    let rgb = rgb_tiff(2, 1, &[1, 2, 3, 4, 5, 6]);
    assert_eq!(
      SourceKind::resolve(&rgb, Some("image/tiff"), None).unwrap(),
      SourceKind::MultiBandRaster
    );

    let npy = npy_f4(&[1, 2], &[0.1, 0.2]);
    assert_eq!(
      SourceKind::resolve(&npy, Some("application/octet-stream"), Some("x.bin")).unwrap(),
      SourceKind::NumericArray
    );

    let png = b"\x89PNG\r\n\x1a\nrest";
    assert_eq!(
      SourceKind::resolve(png, None, None).unwrap(),
      SourceKind::StandardImage
    );
  }

  #[test]
  fn test_resolve_falls_back_to_hints() {
    let garbage = b"not a known header";
    assert_eq!(
      SourceKind::resolve(garbage, None, Some("field.NPY")).unwrap(),
      SourceKind::NumericArray
    );
    assert_eq!(
      SourceKind::resolve(garbage, Some("image/jpeg"), None).unwrap(),
      SourceKind::StandardImage
    );
    assert!(matches!(
      SourceKind::resolve(garbage, Some("text/plain"), Some("notes.txt")),
      Err(IngestError::UnsupportedFormat(_))
    ));
    assert!(matches!(
      SourceKind::resolve(garbage, None, Some("broken.tif")),
      Err(IngestError::DecodeError(_))
    ));
  }

  #[test]
  fn test_ingest_bytes_cleans_up_on_success_and_failure() {
    let dir = tempfile::tempdir().unwrap();
    let ingestor = RasterIngestor::new().with_staging_dir(Some(dir.path().to_path_buf()));

    let npy = npy_f4(&[2, 2], &[0.1, 0.2, 0.3, 0.4]);
    let raster = ingestor
      .ingest_bytes(&npy, SourceKind::NumericArray)
      .unwrap();
    assert_eq!(raster.shape(), (2, 2));
    assert!(raster.bounds().is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let broken = b"\x93NUMPY\x01\x00garbage";
    assert!(
      ingestor
        .ingest_bytes(broken, SourceKind::NumericArray)
        .is_err()
    );
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
  }

  #[test]
  fn test_ingest_tiff_without_georeference() {
    let ingestor = RasterIngestor::new();
    let tiff = gray_tiff(3, 2, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], false);
    let raster = ingestor
      .ingest_bytes(&tiff, SourceKind::SingleBandRaster)
      .unwrap();
    assert_eq!(raster.shape(), (2, 3));
    assert!(raster.bounds().is_none());
    assert!((raster.data()[[1, 2]] - 0.6).abs() < 1e-6);
  }

  #[test]
  fn test_ingest_file_resolves_kind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("field.tif");
    std::fs::write(&path, gray_tiff(2, 2, &[0.5; 4], true)).unwrap();
    let (kind, raster) = RasterIngestor::new().ingest_file(&path).unwrap();
    assert_eq!(kind, SourceKind::SingleBandRaster);
    assert!(raster.bounds().is_some());
  }

  #[test]
  fn test_standard_image_is_not_a_raster() {
    assert!(!SourceKind::StandardImage.is_raster());
    let result = RasterIngestor::new().ingest_bytes(b"\xFF\xD8\xFF", SourceKind::StandardImage);
    assert!(matches!(result, Err(IngestError::UnsupportedFormat(_))));
  }

  #[test]
  fn test_raw_input_from_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leaf.npy");
    std::fs::write(&path, npy_f4(&[1, 1], &[0.5])).unwrap();

    let mut url = Url::from_file_path(&path).unwrap();
    url.set_query(Some("kind=ndvi&content_type=application/x-npy&content_length=12"));
    let input = RawImageInput::from_url(&url).unwrap();
    assert_eq!(input.declared_kind, ImageKind::Ndvi);
    assert_eq!(input.content_type.as_deref(), Some("application/x-npy"));
    assert_eq!(input.declared_length, Some(12));
    assert_eq!(input.filename.as_deref(), Some("leaf.npy"));
    assert!(!input.bytes.is_empty());

    let url = Url::parse("http://example.com/leaf.npy").unwrap();
    assert!(matches!(
      RawImageInput::from_url(&url),
      Err(IngestError::SchemeMismatch(_))
    ));
  }
}
