// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/input/standard_image.rs - JPEG/PNG 图像解码
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

use std::io::Cursor;

use image::ImageReader;
use ndarray::Array3;
use tracing::{debug, error};

use super::IngestError;

/// 解码为 (H, W, 3) 的 RGB 数组，取值 0 到 255
pub fn decode_rgb(bytes: &[u8]) -> Result<Array3<f32>, IngestError> {
  let image = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()
    .map_err(|e| IngestError::DecodeError(e.to_string()))?
    .decode()
    .map_err(|e| {
      error!("图像解码失败: {}", e);
      IngestError::DecodeError(e.to_string())
    })?
    .to_rgb8();

  let (width, height) = image.dimensions();
  debug!("解码图像: {}x{}", width, height);
  let pixels: Vec<f32> = image.into_raw().into_iter().map(f32::from).collect();
  Array3::from_shape_vec((height as usize, width as usize, 3), pixels)
    .map_err(|e| IngestError::DecodeError(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{ImageFormat, Rgb, RgbImage};

  fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
  }

  #[test]
  fn test_decode_png_layout() {
    let mut image = RgbImage::new(3, 2);
    image.put_pixel(2, 1, Rgb([10, 20, 30]));
    let rgb = decode_rgb(&encode(&image, ImageFormat::Png)).unwrap();
    assert_eq!(rgb.dim(), (2, 3, 3));
    assert_eq!(rgb[[1, 2, 0]], 10.0);
    assert_eq!(rgb[[1, 2, 1]], 20.0);
    assert_eq!(rgb[[1, 2, 2]], 30.0);
    assert_eq!(rgb[[0, 0, 0]], 0.0);
  }

  #[test]
  fn test_decode_jpeg() {
    let image = RgbImage::from_pixel(16, 8, Rgb([128, 128, 128]));
    let rgb = decode_rgb(&encode(&image, ImageFormat::Jpeg)).unwrap();
    assert_eq!(rgb.dim(), (8, 16, 3));
    assert!(rgb.iter().all(|v| (v - 128.0).abs() <= 3.0));
  }

  #[test]
  fn test_corrupt_image_is_decode_error() {
    let mut bytes = encode(&RgbImage::new(4, 4), ImageFormat::Png);
    bytes.truncate(20);
    assert!(matches!(decode_rgb(&bytes), Err(IngestError::DecodeError(_))));
  }
}
