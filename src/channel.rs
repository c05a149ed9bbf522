// 该文件是 Yishang （衣裳） 项目的一部分。
// src/channel.rs - 标准输出重定向守卫
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

//! 标准输出（结果通道）只允许写入结果信封。
//!
//! [`StdoutGuard`] 在文件描述符层面把 fd 1 换成一个私有临时文件，
//! 退出时恢复进入时的 fd 1，并把捕获到的内容原样转发到诊断通道（默认 stderr）。
//! 子进程继承的 stdout 以及原生库直接写 fd 1 的输出也会被捕获。
//!
//! 同一进程内同一时刻只应存在一个守卫；嵌套使用时按栈顺序恢复。

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ChannelError {
  #[error("重定向标准输出失败: {0}")]
  Redirect(io::Error),
  #[error("恢复标准输出失败: {0}")]
  Restore(io::Error),
  #[error("转发捕获的输出失败: {0}")]
  Forward(io::Error),
}

pub struct StdoutGuard<D: Write = io::Stderr> {
  saved: Option<sys::SavedStdout>,
  capture: File,
  diagnostic: Option<D>,
}

impl StdoutGuard<io::Stderr> {
  /// 进入守卫，捕获内容在退出时转发到 stderr
  pub fn enter() -> Result<Self, ChannelError> {
    Self::enter_with(io::stderr())
  }
}

impl<D: Write> StdoutGuard<D> {
  pub fn enter_with(diagnostic: D) -> Result<Self, ChannelError> {
    io::stdout().flush().map_err(ChannelError::Redirect)?;
    let capture = tempfile::tempfile().map_err(ChannelError::Redirect)?;
    let saved = sys::redirect(&capture).map_err(ChannelError::Redirect)?;
    debug!("标准输出已重定向");

    Ok(Self {
      saved: Some(saved),
      capture,
      diagnostic: Some(diagnostic),
    })
  }

  /// 退出守卫，返回诊断输出目标
  pub fn exit(mut self) -> Result<D, ChannelError> {
    self.restore()?;
    self
      .diagnostic
      .take()
      .ok_or_else(|| ChannelError::Forward(io::Error::other("诊断输出目标已被取走")))
  }

  fn restore(&mut self) -> Result<(), ChannelError> {
    let Some(saved) = self.saved.take() else {
      return Ok(());
    };

    // 先把 Rust 侧缓冲写入捕获文件，再切回原来的 fd 1
    let flushed = io::stdout().flush();
    sys::restore(saved).map_err(ChannelError::Restore)?;
    flushed.map_err(ChannelError::Restore)?;
    debug!("标准输出已恢复");

    if let Some(diagnostic) = self.diagnostic.as_mut() {
      self
        .capture
        .seek(SeekFrom::Start(0))
        .map_err(ChannelError::Forward)?;
      io::copy(&mut self.capture, diagnostic).map_err(ChannelError::Forward)?;
      diagnostic.flush().map_err(ChannelError::Forward)?;
    }

    Ok(())
  }
}

impl<D: Write> Drop for StdoutGuard<D> {
  fn drop(&mut self) {
    let _ = self.restore();
  }
}

/// 在守卫内执行 `f`，无论成功与否都会恢复标准输出。
///
/// `f` 自身的错误优先于守卫退出时的错误返回。
pub fn redirect_stdout<T, E, F>(f: F) -> Result<T, E>
where
  F: FnOnce() -> Result<T, E>,
  E: From<ChannelError>,
{
  let guard = StdoutGuard::enter()?;
  let result = f();
  let exited = guard.exit();
  let value = result?;
  exited?;
  Ok(value)
}

/// 测试中所有会进入守卫的用例共用此锁，避免并行线程交错替换 fd 1
#[cfg(test)]
pub(crate) fn serial_guard() -> std::sync::MutexGuard<'static, ()> {
  static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
  LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(unix)]
mod sys {
  use std::fs::File;
  use std::io;
  use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

  pub struct SavedStdout(OwnedFd);

  pub fn redirect(target: &File) -> io::Result<SavedStdout> {
    // SAFETY: dup 只复制描述符，返回值由 OwnedFd 独占管理
    let saved = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if saved < 0 {
      return Err(io::Error::last_os_error());
    }
    let saved = unsafe { OwnedFd::from_raw_fd(saved) };

    if unsafe { libc::dup2(target.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
      return Err(io::Error::last_os_error());
    }

    Ok(SavedStdout(saved))
  }

  pub fn restore(saved: SavedStdout) -> io::Result<()> {
    if unsafe { libc::dup2(saved.0.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }
}

#[cfg(not(unix))]
mod sys {
  use std::fs::File;
  use std::io;

  use tracing::warn;

  pub struct SavedStdout;

  pub fn redirect(_target: &File) -> io::Result<SavedStdout> {
    warn!("当前平台不支持标准输出重定向，第三方输出可能混入结果通道");
    Ok(SavedStdout)
  }

  pub fn restore(_saved: SavedStdout) -> io::Result<()> {
    Ok(())
  }
}
