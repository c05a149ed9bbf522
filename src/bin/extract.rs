// 该文件是 Yishang （衣裳） 项目的一部分。
// src/bin/extract.rs - 从捕获的输出中提取结果信封
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

use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use yishang::envelope::extract_envelope;

/// 从检测程序的输出中提取结果信封并以 JSON 打印
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 捕获的输出文件，省略时读取标准输入
  #[arg(value_name = "FILE")]
  pub input: Option<PathBuf>,

  /// 紧凑输出
  #[arg(long)]
  pub compact: bool,
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  match extract(&args) {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => {
      error!("输入中没有结果信封");
      ExitCode::from(1)
    }
    Err(e) => {
      error!("提取失败: {:#}", e);
      ExitCode::from(2)
    }
  }
}

fn extract(args: &Args) -> Result<bool> {
  let reader: Box<dyn Read> = match &args.input {
    Some(path) => Box::new(
      std::fs::File::open(path).with_context(|| format!("无法打开 {}", path.display()))?,
    ),
    None => Box::new(std::io::stdin()),
  };

  let Some(envelope) = extract_envelope(BufReader::new(reader))? else {
    return Ok(false);
  };
  info!("提取到 {} 个检测结果", envelope.detections.len());

  let text = if args.compact {
    serde_json::to_string(&envelope)?
  } else {
    serde_json::to_string_pretty(&envelope)?
  };
  println!("{text}");
  Ok(true)
}
