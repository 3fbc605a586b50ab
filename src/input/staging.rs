// 该文件是 Qingmiao （青苗） 项目的一部分。
// src/input/staging.rs - 临时文件暂存
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

use std::{io::Write, path::Path};

use tempfile::NamedTempFile;
use tracing::debug;

use super::IngestError;

const STAGING_PREFIX: &str = "qingmiao-";

/// 作用域内存在的临时文件，离开作用域即删除
pub struct StagedFile {
  file: NamedTempFile,
}

impl StagedFile {
  pub fn stage(bytes: &[u8], suffix: &str, dir: Option<&Path>) -> Result<Self, IngestError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(STAGING_PREFIX).suffix(suffix);
    let mut file = match dir {
      Some(dir) => builder.tempfile_in(dir)?,
      None => builder.tempfile()?,
    };
    file.write_all(bytes)?;
    file.flush()?;
    debug!("写入临时文件: {} ({} 字节)", file.path().display(), bytes.len());
    Ok(Self { file })
  }

  pub fn path(&self) -> &Path {
    self.file.path()
  }
}

impl Drop for StagedFile {
  fn drop(&mut self) {
    // 删除由 NamedTempFile 完成
    debug!("删除临时文件: {}", self.file.path().display());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_staged_file_removed_on_drop() {
    let path = {
      let staged = StagedFile::stage(b"hello", ".bin", None).unwrap();
      assert!(staged.path().exists());
      assert_eq!(std::fs::read(staged.path()).unwrap(), b"hello");
      assert!(
        staged
          .path()
          .file_name()
          .unwrap()
          .to_string_lossy()
          .ends_with(".bin")
      );
      staged.path().to_path_buf()
    };
    assert!(!path.exists());
  }

  #[test]
  fn test_staged_in_custom_dir() {
    let dir = tempfile::tempdir().unwrap();
    let staged = StagedFile::stage(b"", ".npy", Some(dir.path())).unwrap();
    assert!(staged.path().starts_with(dir.path()));
    assert_eq!(std::fs::metadata(staged.path()).unwrap().len(), 0);
    drop(staged);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
  }

  #[test]
  fn test_missing_dir_is_staging_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    assert!(matches!(
      StagedFile::stage(b"x", ".npy", Some(&missing)),
      Err(IngestError::Staging(_))
    ));
  }
}
