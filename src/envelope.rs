// 该文件是 Yishang （衣裳） 项目的一部分。
// src/envelope.rs - 结果信封
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

use std::io::{self, BufRead, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::artifact::RunArtifacts;
use crate::detector::Detection;

pub const BEGIN_SENTINEL: &str = "JSON_RESULT_BEGIN";
pub const END_SENTINEL: &str = "JSON_RESULT_END";

#[derive(Error, Debug)]
pub enum EnvelopeError {
  #[error("序列化结果失败: {0}")]
  Serialize(#[source] serde_json::Error),
  #[error("解析结果失败: {0}")]
  Parse(#[source] serde_json::Error),
  #[error("I/O 错误: {0}")]
  Io(#[from] io::Error),
  #[error("结果信封缺少结束标记 {END_SENTINEL}")]
  Unterminated,
  #[error("结果信封不是有效的 UTF-8: {0}")]
  Encoding(#[from] std::str::Utf8Error),
}

/// 交给调用方的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
  pub detections: Vec<Detection>,
  pub result_image_path: String,
  pub original_image_path: String,
  pub run_directory: String,
}

impl From<&RunArtifacts> for ResultEnvelope {
  fn from(artifacts: &RunArtifacts) -> Self {
    Self {
      detections: artifacts.detections.clone(),
      result_image_path: artifacts.result_image_path.display().to_string(),
      original_image_path: artifacts.original_image_path.display().to_string(),
      run_directory: artifacts.run_directory.display().to_string(),
    }
  }
}

/// 信封写入的目标通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeChannel {
  /// stdout，除信封外不写入任何内容
  #[default]
  Primary,
  /// stderr，与日志混合，调用方按标记行提取
  Diagnostic,
}

impl EnvelopeChannel {
  pub fn sink(self) -> Box<dyn Write + Send> {
    match self {
      EnvelopeChannel::Primary => Box::new(io::stdout()),
      EnvelopeChannel::Diagnostic => Box::new(io::stderr()),
    }
  }
}

pub struct EnvelopeEmitter<W> {
  sink: W,
  shared: bool,
}

impl EnvelopeEmitter<Box<dyn Write + Send>> {
  pub fn for_channel(channel: EnvelopeChannel) -> Self {
    match channel {
      EnvelopeChannel::Primary => Self::new(channel.sink()),
      EnvelopeChannel::Diagnostic => Self::shared(channel.sink()),
    }
  }
}

impl<W: Write> EnvelopeEmitter<W> {
  /// 独占的输出流，只写信封
  pub fn new(sink: W) -> Self {
    Self {
      sink,
      shared: false,
    }
  }

  /// 与其他输出共用的流，开始标记前先补一个换行，
  /// 避免接在未换行的进度输出后面
  pub fn shared(sink: W) -> Self {
    Self { sink, shared: true }
  }

  /// 依次写出开始标记、单行 JSON、结束标记
  pub fn emit(&mut self, envelope: &ResultEnvelope) -> Result<(), EnvelopeError> {
    let payload = serde_json::to_string(envelope).map_err(EnvelopeError::Serialize)?;
    debug!("结果信封长度: {} 字节", payload.len());

    let mut block = String::with_capacity(payload.len() + BEGIN_SENTINEL.len() + END_SENTINEL.len() + 4);
    if self.shared {
      block.push('\n');
    }
    block.push_str(BEGIN_SENTINEL);
    block.push('\n');
    block.push_str(&payload);
    block.push('\n');
    block.push_str(END_SENTINEL);
    block.push('\n');

    // 一次写出整个块，减少与其他输出交错的机会
    self.sink.write_all(block.as_bytes())?;
    self.sink.flush()?;
    Ok(())
  }

  pub fn into_inner(self) -> W {
    self.sink
  }
}

/// 从混有日志的文本流中提取结果信封
///
/// 找不到开始标记时返回 `Ok(None)`；标记之间跨多行的内容会被拼接后解析。
/// 标记之外的行按字节处理，不要求是有效的 UTF-8。
pub fn extract_envelope<R: BufRead>(mut reader: R) -> Result<Option<ResultEnvelope>, EnvelopeError> {
  let mut payload: Option<String> = None;
  let mut line = Vec::new();

  loop {
    line.clear();
    if reader.read_until(b'\n', &mut line)? == 0 {
      break;
    }
    let trimmed = line.trim_ascii();

    match payload.as_mut() {
      None => {
        if trimmed == BEGIN_SENTINEL.as_bytes() {
          payload = Some(String::new());
        }
      }
      Some(buffer) => {
        if trimmed == END_SENTINEL.as_bytes() {
          let envelope = serde_json::from_str(buffer.trim()).map_err(EnvelopeError::Parse)?;
          return Ok(Some(envelope));
        }
        let text = std::str::from_utf8(&line)?;
        buffer.push_str(text.trim_end_matches(['\r', '\n']));
      }
    }
  }

  match payload {
    Some(_) => Err(EnvelopeError::Unterminated),
    None => Ok(None),
  }
}
