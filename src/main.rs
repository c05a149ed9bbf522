// 该文件是 Yishang （衣裳） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use yishang::FromUrl;
use yishang::artifact::{ArtifactManager, draw::Draw};
use yishang::detector::{DetectorFacade, ExecBackend};
use yishang::envelope::{EnvelopeChannel, EnvelopeEmitter};
use yishang::run::{EXIT_USAGE, RunController};

fn main() -> ExitCode {
  // stdout 只留给结果信封，日志一律写 stderr
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let code = run();

  let _ = std::io::stdout().flush();
  let _ = std::io::stderr().flush();
  code
}

fn run() -> ExitCode {
  let args = match args::Args::try_parse() {
    Ok(args) => args,
    Err(e) => {
      eprint!("{e}");
      return if e.exit_code() == 0 {
        ExitCode::SUCCESS
      } else {
        ExitCode::from(EXIT_USAGE)
      };
    }
  };

  info!("输入图像: {}", args.image.display());
  info!("模型文件路径: {}", args.model.display());
  info!("检测程序: {}", args.detector);
  info!("置信度阈值: {}", args.confidence);

  let backend = match ExecBackend::from_url(&args.detector) {
    Ok(backend) => backend,
    Err(e) => {
      error!("检测程序地址无效: {}", e);
      return ExitCode::from(EXIT_USAGE);
    }
  };

  let channel = EnvelopeChannel::from(args.envelope_channel);
  let mut controller = RunController::new(
    args.run_config(),
    DetectorFacade::new(backend, &args.detector_output_dir),
    ArtifactManager::new(&args.runs_dir, Draw::with_font(args.font.as_deref())),
    EnvelopeEmitter::for_channel(channel),
  );

  match controller.run(&args.image) {
    Ok(envelope) => {
      info!("处理完成，运行目录: {}", envelope.run_directory);
      ExitCode::SUCCESS
    }
    Err(e) => ExitCode::from(e.exit_code()),
  }
}
