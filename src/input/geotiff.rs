// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/input/geotiff.rs - GeoTIFF 读取与地理范围解析
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

use std::io::{Cursor, Read, Seek};

use ndarray::Array2;
use tiff::{
  decoder::{Decoder, DecodingResult, Limits},
  tags::Tag,
};
use tracing::{debug, error, warn};

use super::IngestError;
use crate::raster::{GeoBounds, Raster};

const GEO_KEY_PROJECTED_CRS: u16 = 3072;
const GEO_KEY_GEOGRAPHIC_CRS: u16 = 2048;
const EPSG_USER_DEFINED: u16 = 32767;
const PLANAR_SEPARATE: u16 = 2;
/// 单幅影像解码缓冲区上限 (1 GiB)，超出即拒绝
const MAX_DECODING_BUFFER: usize = 1 << 30;

fn decode_error(err: impl std::fmt::Display) -> IngestError {
  error!("TIFF 解码失败: {}", err);
  IngestError::DecodeError(err.to_string())
}

fn find_u16<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<u16>, IngestError> {
  decoder
    .find_tag(tag)
    .map_err(decode_error)?
    .map(|v| v.into_u16())
    .transpose()
    .map_err(decode_error)
}

/// 可选标签读取失败时记录并忽略
fn find_f64_vec<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<Vec<f64>> {
  match decoder.find_tag(tag).and_then(|v| v.map(|v| v.into_f64_vec()).transpose()) {
    Ok(values) => values,
    Err(e) => {
      warn!("读取标签 {:?} 失败: {}", tag, e);
      None
    }
  }
}

fn find_u16_vec<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<Vec<u16>> {
  match decoder.find_tag(tag).and_then(|v| v.map(|v| v.into_u16_vec()).transpose()) {
    Ok(values) => values,
    Err(e) => {
      warn!("读取标签 {:?} 失败: {}", tag, e);
      None
    }
  }
}

/// TIFF 的波段数
pub fn band_count(bytes: &[u8]) -> Result<u16, IngestError> {
  let mut decoder = Decoder::new(Cursor::new(bytes)).map_err(decode_error)?;
  Ok(find_u16(&mut decoder, Tag::SamplesPerPixel)?.unwrap_or(1))
}

/// 像素坐标到模型坐标的仿射变换
#[derive(Debug, Clone, Copy, PartialEq)]
struct Affine {
  origin_x: f64,
  pixel_width: f64,
  row_rotation: f64,
  origin_y: f64,
  col_rotation: f64,
  pixel_height: f64,
}

impl Affine {
  fn from_tags(scale: Option<&[f64]>, tiepoint: Option<&[f64]>, transform: Option<&[f64]>) -> Option<Self> {
    if let (Some(s), Some(t)) = (scale, tiepoint)
      && s.len() >= 2
      && t.len() >= 6
    {
      return Some(Self {
        origin_x: t[3] - t[0] * s[0],
        pixel_width: s[0],
        row_rotation: 0.0,
        origin_y: t[4] + t[1] * s[1],
        col_rotation: 0.0,
        pixel_height: -s[1],
      });
    }

    if let Some(m) = transform
      && m.len() >= 16
    {
      return Some(Self {
        origin_x: m[3],
        pixel_width: m[0],
        row_rotation: m[1],
        origin_y: m[7],
        col_rotation: m[4],
        pixel_height: m[5],
      });
    }

    None
  }

  fn apply(&self, col: f64, row: f64) -> (f64, f64) {
    (
      self.origin_x + col * self.pixel_width + row * self.row_rotation,
      self.origin_y + col * self.col_rotation + row * self.pixel_height,
    )
  }

  /// (west, south, east, north)
  fn extent(&self, width: u32, height: u32) -> (f64, f64, f64, f64) {
    let (w, h) = (width as f64, height as f64);
    let corners = [
      self.apply(0.0, 0.0),
      self.apply(w, 0.0),
      self.apply(0.0, h),
      self.apply(w, h),
    ];
    let west = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
    let east = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
    let south = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
    let north = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);
    (west, south, east, north)
  }
}

/// GeoKeyDirectory 中的 EPSG 代码
fn crs_from_geokeys(keys: &[u16]) -> Option<String> {
  if keys.len() < 4 {
    return None;
  }
  let count = keys[3] as usize;
  let entries: Vec<&[u16]> = keys[4..].chunks_exact(4).take(count).collect();
  for wanted in [GEO_KEY_PROJECTED_CRS, GEO_KEY_GEOGRAPHIC_CRS] {
    if let Some(entry) = entries.iter().find(|e| e[0] == wanted)
      && entry[1] == 0
      && entry[3] > 0
      && entry[3] < EPSG_USER_DEFINED
    {
      return Some(format!("EPSG:{}", entry[3]));
    }
  }
  None
}

fn read_bounds<R: Read + Seek>(decoder: &mut Decoder<R>, width: u32, height: u32) -> Option<GeoBounds> {
  let scale = find_f64_vec(decoder, Tag::ModelPixelScaleTag);
  let tiepoint = find_f64_vec(decoder, Tag::ModelTiepointTag);
  let transform = find_f64_vec(decoder, Tag::ModelTransformationTag);
  let crs = find_u16_vec(decoder, Tag::GeoKeyDirectoryTag).and_then(|k| crs_from_geokeys(&k));

  let affine = Affine::from_tags(scale.as_deref(), tiepoint.as_deref(), transform.as_deref());
  match (affine, crs) {
    (None, None) => {
      debug!("TIFF 没有地理参考");
      None
    }
    (Some(affine), crs) => {
      let (west, south, east, north) = affine.extent(width, height);
      Some(GeoBounds {
        west,
        south,
        east,
        north,
        crs,
      })
    }
    (None, Some(crs)) => {
      warn!("TIFF 只有坐标系 {} 没有仿射变换, 使用像素范围", crs);
      Some(GeoBounds {
        west: 0.0,
        south: height as f64,
        east: width as f64,
        north: 0.0,
        crs: Some(crs),
      })
    }
  }
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f32> {
  let text = match decoder.find_tag(Tag::GdalNodata) {
    Ok(Some(value)) => value.into_string().ok()?,
    Ok(None) => return None,
    Err(e) => {
      warn!("读取 GDAL_NODATA 失败: {}", e);
      return None;
    }
  };
  let text = text.trim_matches(char::from(0)).trim();
  match text.parse::<f64>() {
    Ok(value) => Some(value as f32),
    Err(_) => {
      warn!("无效的 GDAL_NODATA: {}", text);
      None
    }
  }
}

fn into_f32(result: DecodingResult) -> Result<Vec<f32>, IngestError> {
  let values = match result {
    DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
    DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
    DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
    DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
    DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
    DecodingResult::F32(v) => v,
    DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
    #[allow(unreachable_patterns)]
    _ => {
      return Err(IngestError::UnsupportedFormat(
        "不支持的 TIFF 采样类型".to_string(),
      ));
    }
  };
  Ok(values)
}

fn decoding_limits() -> Limits {
  let mut limits = Limits::default();
  limits.decoding_buffer_size = MAX_DECODING_BUFFER;
  limits
}

/// 读取 TIFF 的第一个波段及其地理范围
///
/// GDAL_NODATA 标记的值替换为 NaN。
pub fn read_geotiff<R: Read + Seek>(reader: R) -> Result<Raster, IngestError> {
  let mut decoder = Decoder::new(reader)
    .map_err(decode_error)?
    .with_limits(decoding_limits());

  let (width, height) = decoder.dimensions().map_err(decode_error)?;
  let bands = find_u16(&mut decoder, Tag::SamplesPerPixel)?
    .unwrap_or(1)
    .max(1) as usize;
  let planar = find_u16(&mut decoder, Tag::PlanarConfiguration)?.unwrap_or(1);
  debug!(
    "TIFF 尺寸: {}x{}, 波段数: {}, 平面配置: {}",
    width, height, bands, planar
  );

  let bounds = read_bounds(&mut decoder, width, height);
  let nodata = read_nodata(&mut decoder);
  let samples = into_f32(decoder.read_image().map_err(decode_error)?)?;

  let pixels = width as usize * height as usize;
  let band: Vec<f32> = if samples.len() == pixels {
    samples
  } else if samples.len() == pixels * bands {
    if planar == PLANAR_SEPARATE {
      samples[..pixels].to_vec()
    } else {
      samples.into_iter().step_by(bands).collect()
    }
  } else {
    return Err(IngestError::DecodeError(format!(
      "采样数 {} 与尺寸 {}x{}x{} 不符",
      samples.len(),
      width,
      height,
      bands
    )));
  };

  let mut data = Array2::from_shape_vec((height as usize, width as usize), band).map_err(decode_error)?;
  if let Some(nodata) = nodata
    && !nodata.is_nan()
  {
    data.mapv_inplace(|v| if v == nodata { f32::NAN } else { v });
  }

  Ok(Raster::new(data).with_bounds(bounds))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::fixtures::{gray_tiff, rgb_tiff};
  use tiff::encoder::{TiffEncoder, colortype};

  #[test]
  fn test_georeferenced_bounds() {
    let bytes = gray_tiff(4, 2, &[0.0; 8], true);
    let raster = read_geotiff(Cursor::new(bytes)).unwrap();
    let bounds = raster.bounds().unwrap();
    // 原点 (100, 50), 像元 0.5 x 0.25
    assert_eq!(bounds.west, 100.0);
    assert_eq!(bounds.east, 102.0);
    assert_eq!(bounds.north, 50.0);
    assert_eq!(bounds.south, 49.5);
    assert_eq!(bounds.crs.as_deref(), Some("EPSG:4326"));
  }

  #[test]
  fn test_no_georeference() {
    let bytes = gray_tiff(2, 2, &[0.1, 0.2, 0.3, 0.4], false);
    let raster = read_geotiff(Cursor::new(bytes)).unwrap();
    assert!(raster.bounds().is_none());
    assert_eq!(raster.shape(), (2, 2));
  }

  #[test]
  fn test_multiband_reads_first_band() {
    let bytes = rgb_tiff(2, 1, &[10, 20, 30, 40, 50, 60]);
    assert_eq!(band_count(&bytes).unwrap(), 3);
    let raster = read_geotiff(Cursor::new(bytes)).unwrap();
    assert_eq!(raster.data().iter().copied().collect::<Vec<_>>(), vec![10.0, 40.0]);
  }

  #[test]
  fn test_nodata_becomes_nan() {
    let mut buf = Cursor::new(Vec::new());
    {
      let mut encoder = TiffEncoder::new(&mut buf).unwrap();
      let mut image = encoder.new_image::<colortype::Gray32Float>(2, 1).unwrap();
      image.encoder().write_tag(Tag::GdalNodata, "-9999").unwrap();
      image.write_data(&[-9999.0f32, 0.5]).unwrap();
    }
    let raster = read_geotiff(Cursor::new(buf.into_inner())).unwrap();
    assert!(raster.data()[[0, 0]].is_nan());
    assert_eq!(raster.data()[[0, 1]], 0.5);
  }

  #[test]
  fn test_transformation_matrix_bounds() {
    let affine = Affine::from_tags(
      None,
      None,
      Some(&[
        2.0, 0.0, 0.0, 10.0, 0.0, -2.0, 0.0, 20.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0,
      ]),
    )
    .unwrap();
    assert_eq!(affine.extent(3, 2), (10.0, 16.0, 16.0, 20.0));
  }

  #[test]
  fn test_crs_from_geokeys() {
    assert_eq!(
      crs_from_geokeys(&[1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 32633]).as_deref(),
      Some("EPSG:32633")
    );
    // 用户自定义坐标系没有 EPSG 代码
    assert_eq!(crs_from_geokeys(&[1, 1, 0, 1, 3072, 0, 1, 32767]), None);
    assert_eq!(crs_from_geokeys(&[1, 1]), None);
  }

  /// 只有 IFD 的小端 TIFF，声明 20000x20000 的 f32 单波段影像
  fn oversized_header() -> Vec<u8> {
    const SHORT: u16 = 3;
    const LONG: u16 = 4;
    let entries: [(u16, u16, u32); 10] = [
      (256, LONG, 20_000),
      (257, LONG, 20_000),
      (258, SHORT, 32),
      (259, SHORT, 1),
      (262, SHORT, 1),
      (273, LONG, 8),
      (277, SHORT, 1),
      (278, LONG, 20_000),
      (279, LONG, 20_000 * 20_000 * 4),
      (339, SHORT, 3),
    ];

    let mut out = b"II*\0".to_vec();
    out.extend_from_slice(&8u32.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (tag, kind, value) in entries {
      out.extend_from_slice(&tag.to_le_bytes());
      out.extend_from_slice(&kind.to_le_bytes());
      out.extend_from_slice(&1u32.to_le_bytes());
      if kind == SHORT {
        out.extend_from_slice(&(value as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
      } else {
        out.extend_from_slice(&value.to_le_bytes());
      }
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out
  }

  #[test]
  fn test_oversized_dimensions_hit_decoding_limit() {
    let bytes = oversized_header();
    assert!(bytes.len() < 256);
    assert!(matches!(
      read_geotiff(Cursor::new(bytes)),
      Err(IngestError::DecodeError(_))
    ));
  }

  #[test]
  fn test_garbage_is_decode_error() {
    assert!(matches!(
      read_geotiff(Cursor::new(b"II*\0garbage".to_vec())),
      Err(IngestError::DecodeError(_))
    ));
  }
}
