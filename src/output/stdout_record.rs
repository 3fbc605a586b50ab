// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/output/stdout_record.rs - 标准输出记录
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

use std::io::Write;

use thiserror::Error;

use crate::{FromUrl, FromUrlWithScheme, output::Render, pipeline::ClassificationRecord};

#[derive(Error, Debug)]
pub enum StdoutRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 每条记录输出为一行 JSON，`?pretty` 时缩进输出
#[derive(Debug, Clone, Default)]
pub struct StdoutRecordOutput {
  pretty: bool,
}

impl FromUrlWithScheme for StdoutRecordOutput {
  const SCHEME: &'static str = "stdout";
}

impl FromUrl for StdoutRecordOutput {
  type Error = StdoutRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(StdoutRecordOutputError::SchemeMismatch);
    }

    let pretty = uri.query_pairs().any(|(k, _)| k == "pretty");
    Ok(StdoutRecordOutput { pretty })
  }
}

impl StdoutRecordOutput {
  pub fn write_record<W: Write>(
    &self,
    writer: &mut W,
    record: &ClassificationRecord,
  ) -> Result<(), StdoutRecordOutputError> {
    if self.pretty {
      serde_json::to_writer_pretty(&mut *writer, record)?;
    } else {
      serde_json::to_writer(&mut *writer, record)?;
    }
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
  }
}

impl Render<ClassificationRecord> for StdoutRecordOutput {
  type Error = StdoutRecordOutputError;

  fn render_result(&self, result: &ClassificationRecord) -> Result<(), Self::Error> {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    self.write_record(&mut lock, result)
  }
}
