// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use chrono::{DateTime, Datelike, Utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

use crate::{FromUrl, FromUrlWithScheme, output::Render, pipeline::ClassificationRecord};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 按日期分目录保存 JSON 记录：`dir/YYYY/MM/DD/HH-MM-SS-XXXX.json`
#[derive(Debug, Clone)]
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  record_counter: Arc<Mutex<u16>>,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    Ok(DirectoryRecordOutput::with_directory(uri.path()))
  }
}

impl DirectoryRecordOutput {
  pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      record_counter: Arc::new(Mutex::new(0)),
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn record_id(&self) -> u16 {
    let mut counter = self
      .record_counter
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let id = counter.wrapping_add(1);
    *counter = id;
    id
  }

  fn record_path(&self, now: DateTime<Utc>) -> Result<PathBuf, DirectoryRecordOutputError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.json",
      now.format("%H-%M-%S"),
      self.record_id()
    )))
  }
}

impl Render<ClassificationRecord> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, result: &ClassificationRecord) -> Result<(), Self::Error> {
    let path = self.record_path(Utc::now())?;
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, result)?;
    writer.flush()?;
    debug!("记录已保存: {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn record(reference: &str) -> ClassificationRecord {
    ClassificationRecord {
      class_label: "Healthy".to_string(),
      confidence: 0.8,
      image_reference: reference.to_string(),
      geodata: Some(serde_json::json!({"type": "FeatureCollection", "features": []})),
    }
  }

  fn json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
      for entry in std::fs::read_dir(current).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          stack.push(path);
        } else {
          files.push(path);
        }
      }
    }
    files
  }

  #[test]
  fn test_record_path_layout() {
    let dir = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::with_directory(dir.path());
    let now = Utc.with_ymd_and_hms(2026, 3, 7, 9, 5, 1).unwrap();
    let first = output.record_path(now).unwrap();
    let second = output.record_path(now).unwrap();
    assert_eq!(
      first,
      dir.path().join("2026").join("03").join("07").join("09-05-01-0001.json")
    );
    assert!(second.ends_with("09-05-01-0002.json"));
  }

  #[test]
  fn test_render_writes_json_files() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    output.render_result(&record("a")).unwrap();
    output.render_result(&record("b")).unwrap();

    let files = json_files(dir.path());
    assert_eq!(files.len(), 2);
    let mut references: Vec<String> = files
      .iter()
      .map(|p| {
        let parsed: ClassificationRecord =
          serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap();
        assert!(parsed.geodata.is_some());
        parsed.image_reference
      })
      .collect();
    references.sort();
    assert_eq!(references, vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn test_scheme_mismatch() {
    let url = url::Url::parse("stdout://").unwrap();
    assert!(matches!(
      DirectoryRecordOutput::from_url(&url),
      Err(DirectoryRecordOutputError::SchemeMismatch)
    ));
  }
}
