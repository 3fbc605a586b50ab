// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/input/numeric_array.rs - NumPy `.npy` 数组读取
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

use std::io::Read;

use ndarray::{Array2, Array3, Axis};
use tracing::{debug, error};

use super::{IngestError, NPY_MAGIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dtype {
  kind: char,
  size: usize,
  big_endian: bool,
}

#[derive(Debug)]
struct Header {
  dtype: Dtype,
  fortran_order: bool,
  shape: Vec<usize>,
}

fn decode_error(reason: impl Into<String>) -> IngestError {
  let reason = reason.into();
  error!("npy 解码失败: {}", reason);
  IngestError::DecodeError(reason)
}

fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
  let pattern = format!("'{}':", key);
  let start = header.find(&pattern)? + pattern.len();
  Some(header[start..].trim_start())
}

fn parse_descr(header: &str) -> Result<Dtype, IngestError> {
  let value = header_value(header, "descr").ok_or_else(|| decode_error("缺少 descr"))?;
  let quote = value
    .chars()
    .next()
    .filter(|c| *c == '\'' || *c == '"')
    .ok_or_else(|| decode_error("descr 不是字符串"))?;
  let body = &value[1..];
  let end = body
    .find(quote)
    .ok_or_else(|| decode_error("descr 未闭合"))?;
  let descr = &body[..end];

  let mut chars = descr.chars();
  let (big_endian, kind) = match chars.next() {
    Some('>') => (true, chars.next()),
    Some('<') | Some('|') | Some('=') => (false, chars.next()),
    other => (false, other),
  };
  let kind = kind.ok_or_else(|| decode_error(format!("无效的 descr: {}", descr)))?;
  let size: usize = chars
    .as_str()
    .parse()
    .map_err(|_| decode_error(format!("无效的 descr: {}", descr)))?;

  Ok(Dtype {
    kind,
    size,
    big_endian,
  })
}

fn parse_shape(header: &str) -> Result<Vec<usize>, IngestError> {
  let value = header_value(header, "shape").ok_or_else(|| decode_error("缺少 shape"))?;
  let inner = value
    .strip_prefix('(')
    .and_then(|v| v.split_once(')'))
    .map(|(inner, _)| inner)
    .ok_or_else(|| decode_error("shape 不是元组"))?;
  inner
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(|s| {
      s.parse()
        .map_err(|_| decode_error(format!("无效的维度: {}", s)))
    })
    .collect()
}

fn parse_header(header: &str) -> Result<Header, IngestError> {
  let fortran_order = header_value(header, "fortran_order")
    .map(|v| v.starts_with("True"))
    .unwrap_or(false);
  Ok(Header {
    dtype: parse_descr(header)?,
    fortran_order,
    shape: parse_shape(header)?,
  })
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header, IngestError> {
  let mut preamble = [0u8; 8];
  reader
    .read_exact(&mut preamble)
    .map_err(|e| decode_error(format!("文件头不完整: {}", e)))?;
  if &preamble[..6] != NPY_MAGIC {
    return Err(decode_error("不是 npy 文件"));
  }

  let major = preamble[6];
  let header_len = match major {
    1 => {
      let mut len = [0u8; 2];
      reader
        .read_exact(&mut len)
        .map_err(|e| decode_error(e.to_string()))?;
      u16::from_le_bytes(len) as usize
    }
    2 | 3 => {
      let mut len = [0u8; 4];
      reader
        .read_exact(&mut len)
        .map_err(|e| decode_error(e.to_string()))?;
      u32::from_le_bytes(len) as usize
    }
    v => return Err(decode_error(format!("不支持的 npy 版本: {}", v))),
  };

  let mut raw = vec![0u8; header_len];
  reader
    .read_exact(&mut raw)
    .map_err(|e| decode_error(format!("头部不完整: {}", e)))?;
  let text = String::from_utf8(raw).map_err(|_| decode_error("头部不是 UTF-8"))?;
  debug!("npy 头部: {}", text.trim_end());
  parse_header(&text)
}

fn chunks<const N: usize>(raw: &[u8]) -> impl Iterator<Item = [u8; N]> + '_ {
  raw.chunks_exact(N).map(|c| {
    let mut b = [0u8; N];
    b.copy_from_slice(c);
    b
  })
}

macro_rules! decode_as {
  ($raw:expr, $big:expr, $ty:ty, $n:literal) => {
    chunks::<$n>($raw)
      .map(|b| {
        (if $big {
          <$ty>::from_be_bytes(b)
        } else {
          <$ty>::from_le_bytes(b)
        }) as f32
      })
      .collect()
  };
}

fn decode_values(raw: &[u8], dtype: Dtype) -> Result<Vec<f32>, IngestError> {
  let big = dtype.big_endian;
  let values: Vec<f32> = match (dtype.kind, dtype.size) {
    ('f', 4) => decode_as!(raw, big, f32, 4),
    ('f', 8) => decode_as!(raw, big, f64, 8),
    ('u', 1) => raw.iter().map(|&v| v as f32).collect(),
    ('i', 1) => raw.iter().map(|&v| v as i8 as f32).collect(),
    ('b', 1) => raw.iter().map(|&v| if v != 0 { 1.0 } else { 0.0 }).collect(),
    ('u', 2) => decode_as!(raw, big, u16, 2),
    ('i', 2) => decode_as!(raw, big, i16, 2),
    ('u', 4) => decode_as!(raw, big, u32, 4),
    ('i', 4) => decode_as!(raw, big, i32, 4),
    ('u', 8) => decode_as!(raw, big, u64, 8),
    ('i', 8) => decode_as!(raw, big, i64, 8),
    (kind, size) => {
      return Err(IngestError::UnsupportedFormat(format!(
        "npy 数据类型 {}{}",
        kind, size
      )));
    }
  };
  Ok(values)
}

/// 头部声明的数据字节数，溢出时报错
fn data_len(header: &Header) -> Result<usize, IngestError> {
  header
    .shape
    .iter()
    .try_fold(header.dtype.size, |acc, &dim| acc.checked_mul(dim))
    .ok_or_else(|| decode_error(format!("数组尺寸溢出: {:?}", header.shape)))
}

/// 读取 `.npy` 数组，返回单波段平面
///
/// 二维数组原样返回；三维数组若首轴为 1 取第一层，否则取末轴第一个波段。
pub fn read_npy<R: Read>(mut reader: R) -> Result<Array2<f32>, IngestError> {
  let header = read_header(&mut reader)?;
  if header.fortran_order {
    return Err(IngestError::UnsupportedFormat(
      "不支持 Fortran 顺序的 npy 数组".to_string(),
    ));
  }

  let expected = data_len(&header)?;
  // 按实际读到的字节增长缓冲区，不按头部声明的尺寸预分配
  let mut raw = Vec::new();
  reader
    .by_ref()
    .take(expected as u64)
    .read_to_end(&mut raw)
    .map_err(|e| decode_error(format!("读取数据失败: {}", e)))?;
  if raw.len() != expected {
    return Err(decode_error(format!(
      "数据不完整: 期望 {} 字节, 实际 {} 字节",
      expected,
      raw.len()
    )));
  }
  let values = decode_values(&raw, header.dtype)?;

  match header.shape.as_slice() {
    &[h, w] => Array2::from_shape_vec((h, w), values).map_err(|e| decode_error(e.to_string())),
    &[d0, d1, d2] => {
      let cube =
        Array3::from_shape_vec((d0, d1, d2), values).map_err(|e| decode_error(e.to_string()))?;
      if d0 == 1 {
        Ok(cube.index_axis(Axis(0), 0).to_owned())
      } else if d2 > 0 {
        Ok(cube.index_axis(Axis(2), 0).to_owned())
      } else {
        Err(decode_error("末轴为空"))
      }
    }
    shape => Err(decode_error(format!("不支持的数组维度: {:?}", shape))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::fixtures::{npy, npy_f4};
  use std::io::Cursor;

  #[test]
  fn test_read_f4_plane() {
    let bytes = npy_f4(&[2, 3], &[0.0, 0.1, 0.2, 0.3, 0.4, 0.5]);
    let plane = read_npy(Cursor::new(bytes)).unwrap();
    assert_eq!(plane.dim(), (2, 3));
    assert!((plane[[1, 0]] - 0.3).abs() < 1e-6);
  }

  #[test]
  fn test_read_big_endian_f8() {
    let mut raw = Vec::new();
    for v in [0.25f64, -0.5, f64::NAN, 1.0] {
      raw.extend_from_slice(&v.to_be_bytes());
    }
    let plane = read_npy(Cursor::new(npy(">f8", &[2, 2], false, &raw))).unwrap();
    assert_eq!(plane[[0, 0]], 0.25);
    assert_eq!(plane[[0, 1]], -0.5);
    assert!(plane[[1, 0]].is_nan());
  }

  #[test]
  fn test_read_integer_types() {
    let plane = read_npy(Cursor::new(npy("|u1", &[1, 3], false, &[0, 128, 255]))).unwrap();
    assert_eq!(plane.iter().copied().collect::<Vec<_>>(), vec![0.0, 128.0, 255.0]);

    let mut raw = Vec::new();
    for v in [-3i16, 7] {
      raw.extend_from_slice(&v.to_le_bytes());
    }
    let plane = read_npy(Cursor::new(npy("<i2", &[2, 1], false, &raw))).unwrap();
    assert_eq!(plane[[0, 0]], -3.0);
    assert_eq!(plane[[1, 0]], 7.0);
  }

  #[test]
  fn test_three_dimensional_squeeze() {
    // (1, 2, 2) 取第一层
    let plane = read_npy(Cursor::new(npy_f4(&[1, 2, 2], &[1.0, 2.0, 3.0, 4.0]))).unwrap();
    assert_eq!(plane.dim(), (2, 2));
    assert_eq!(plane[[1, 1]], 4.0);

    // (2, 2, 2) 取末轴第一个波段
    let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
    let plane = read_npy(Cursor::new(npy_f4(&[2, 2, 2], &data))).unwrap();
    assert_eq!(plane.iter().copied().collect::<Vec<_>>(), vec![0.0, 2.0, 4.0, 6.0]);
  }

  #[test]
  fn test_rejects_unsupported() {
    let fortran = npy("<f4", &[1, 1], true, &0.5f32.to_le_bytes());
    assert!(matches!(
      read_npy(Cursor::new(fortran)),
      Err(IngestError::UnsupportedFormat(_))
    ));

    let complex = npy("<c8", &[1, 1], false, &[0u8; 8]);
    assert!(matches!(
      read_npy(Cursor::new(complex)),
      Err(IngestError::UnsupportedFormat(_))
    ));

    let vector = npy_f4(&[3], &[1.0, 2.0, 3.0]);
    assert!(matches!(
      read_npy(Cursor::new(vector)),
      Err(IngestError::DecodeError(_))
    ));
  }

  #[test]
  fn test_oversized_header_shape_is_decode_error() {
    let overflowing = npy("<f4", &[1 << 32, 1 << 32], false, &[0u8; 16]);
    assert!(matches!(
      read_npy(Cursor::new(overflowing)),
      Err(IngestError::DecodeError(_))
    ));

    let huge = npy("<f8", &[1 << 24, 1 << 24], false, &[0u8; 16]);
    assert!(matches!(
      read_npy(Cursor::new(huge)),
      Err(IngestError::DecodeError(_))
    ));
  }

  #[test]
  fn test_truncated_data_is_decode_error() {
    let mut bytes = npy_f4(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    bytes.truncate(bytes.len() - 3);
    assert!(matches!(
      read_npy(Cursor::new(bytes)),
      Err(IngestError::DecodeError(_))
    ));
  }
}
