// 该文件是 Yishang （衣裳） 项目的一部分。
// src/detector/exec.rs - 外部检测程序后端
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Yishang Contributors

//! 通过外部程序完成训练与推理。
//!
//! 地址格式: `exec:///path/to/program?arg=a&arg=b`，`arg` 依次放在子命令之前。
//!
//! - `train --weights <id> --data <yaml> --epochs <n> --save <path>`
//! - `predict --model <path> --source <image> --conf <t> --output-dir <dir> --results <json>`
//!
//! 子进程继承本进程的 stdout/stderr，调用方在守卫内调用即可捕获其输出。

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};
use url::Url;

use super::{DetectorBackend, DetectorError, RawDetection};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Debug, Clone)]
pub struct ExecBackend {
  program: PathBuf,
  args: Vec<String>,
}

/// 已确认可读的模型文件
#[derive(Debug, Clone)]
pub struct ExecModel {
  path: PathBuf,
}

impl ExecModel {
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl FromUrlWithScheme for ExecBackend {
  const SCHEME: &'static str = "exec";
}

impl FromUrl for ExecBackend {
  type Error = DetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DetectorError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let program = urlencoding::decode(url.path())
      .map_err(|e| DetectorError::SchemeMismatch(format!("检测程序路径不是有效的 UTF-8: {}", e)))?;
    if program.is_empty() {
      return Err(DetectorError::SchemeMismatch(format!(
        "检测程序路径为空: {}",
        url
      )));
    }

    let args = url
      .query_pairs()
      .filter(|(k, _)| k == "arg")
      .map(|(_, v)| v.into_owned())
      .collect();

    Ok(ExecBackend {
      program: PathBuf::from(program.as_ref()),
      args,
    })
  }
}

impl ExecBackend {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
    }
  }

  fn command(&self, subcommand: &str) -> Command {
    let mut command = Command::new(&self.program);
    command
      .args(&self.args)
      .arg(subcommand)
      .stdin(Stdio::null())
      .stdout(Stdio::inherit())
      .stderr(Stdio::inherit());
    command
  }

  fn run(&self, mut command: Command) -> Result<(), String> {
    debug!("执行检测程序: {:?}", command);
    let status = command
      .status()
      .map_err(|e| format!("无法启动 {}: {}", self.program.display(), e))?;
    if status.success() {
      Ok(())
    } else {
      Err(format!("{} 退出状态: {}", self.program.display(), status))
    }
  }
}

impl DetectorBackend for ExecBackend {
  type Handle = ExecModel;

  fn load(&self, model_path: &Path) -> Result<ExecModel, DetectorError> {
    let metadata = std::fs::metadata(model_path).map_err(|source| DetectorError::ModelLoad {
      path: model_path.to_path_buf(),
      source,
    })?;
    if !metadata.is_file() {
      return Err(DetectorError::ModelLoad {
        path: model_path.to_path_buf(),
        source: std::io::Error::other("不是普通文件"),
      });
    }
    std::fs::File::open(model_path).map_err(|source| DetectorError::ModelLoad {
      path: model_path.to_path_buf(),
      source,
    })?;

    debug!(
      "模型文件大小: {:.2} MB",
      metadata.len() as f64 / (1024.0 * 1024.0)
    );
    Ok(ExecModel {
      path: model_path.to_path_buf(),
    })
  }

  fn bootstrap(
    &self,
    weights_id: &str,
    training_config: &Path,
    epochs: u32,
    save_to: &Path,
  ) -> Result<ExecModel, DetectorError> {
    // 先写入临时文件再改名，避免其他进程读到写了一半的模型
    let mut partial: OsString = save_to.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let mut command = self.command("train");
    command
      .arg("--weights")
      .arg(weights_id)
      .arg("--data")
      .arg(training_config)
      .arg("--epochs")
      .arg(epochs.to_string())
      .arg("--save")
      .arg(&partial);
    self.run(command).map_err(DetectorError::Bootstrap)?;

    if !partial.is_file() {
      return Err(DetectorError::Bootstrap(format!(
        "训练结束但未生成模型文件: {}",
        partial.display()
      )));
    }
    std::fs::rename(&partial, save_to)
      .map_err(|e| DetectorError::Bootstrap(format!("保存模型失败: {}", e)))?;
    info!("模型已保存: {}", save_to.display());

    self.load(save_to)
  }

  fn predict(
    &self,
    handle: &ExecModel,
    image_path: &Path,
    confidence_threshold: f32,
    output_dir: &Path,
  ) -> Result<Vec<RawDetection>, DetectorError> {
    std::fs::create_dir_all(output_dir).map_err(|e| {
      DetectorError::Predict(format!("无法创建输出目录 {}: {}", output_dir.display(), e))
    })?;
    let results = tempfile::NamedTempFile::new().map_err(DetectorError::Spawn)?;

    let mut command = self.command("predict");
    command
      .arg("--model")
      .arg(handle.path())
      .arg("--source")
      .arg(image_path)
      .arg("--conf")
      .arg(confidence_threshold.to_string())
      .arg("--output-dir")
      .arg(output_dir)
      .arg("--results")
      .arg(results.path());
    self.run(command).map_err(DetectorError::Predict)?;

    let content = std::fs::read_to_string(results.path())
      .map_err(|e| DetectorError::Predict(format!("无法读取检测结果: {}", e)))?;
    if content.trim().is_empty() {
      return Err(DetectorError::Predict("检测程序未写入结果".to_string()));
    }
    let items: Vec<RawDetection> = serde_json::from_str(&content)?;
    debug!("检测程序返回 {} 个结果", items.len());
    Ok(items)
  }
}
