#![cfg(unix)]

use std::io::Write;
use std::os::fd::AsRawFd;

use yishang::channel::{ChannelError, StdoutGuard, redirect_stdout};

/// fd 1 当前指向的文件的 (设备, inode)
fn stdout_identity() -> (u64, u64) {
  let mut stat: libc::stat = unsafe { std::mem::zeroed() };
  let rc = unsafe { libc::fstat(std::io::stdout().as_raw_fd(), &mut stat) };
  assert_eq!(rc, 0);
  (stat.st_dev as u64, stat.st_ino as u64)
}

fn write_stdout(text: &str) {
  let mut stdout = std::io::stdout();
  stdout.write_all(text.as_bytes()).unwrap();
  stdout.flush().unwrap();
}

fn captured_output_is_forwarded_in_order() {
  let before = stdout_identity();

  let guard = StdoutGuard::enter_with(Vec::new()).unwrap();
  assert_ne!(stdout_identity(), before);
  write_stdout("line one\n");
  write_stdout("partial ");
  write_stdout("line two\n");
  let forwarded = guard.exit().unwrap();

  assert_eq!(String::from_utf8(forwarded).unwrap(), "line one\npartial line two\n");
  assert_eq!(stdout_identity(), before);
}

fn child_process_output_is_captured() {
  let guard = StdoutGuard::enter_with(Vec::new()).unwrap();
  let status = std::process::Command::new("sh")
    .arg("-c")
    .arg("echo from child")
    .status()
    .unwrap();
  assert!(status.success());
  let forwarded = guard.exit().unwrap();

  assert_eq!(String::from_utf8(forwarded).unwrap(), "from child\n");
}

fn nested_guards_restore_in_stack_order() {
  let before = stdout_identity();

  let outer = StdoutGuard::enter_with(Vec::new()).unwrap();
  write_stdout("outer before\n");
  let outer_target = stdout_identity();

  let inner = StdoutGuard::enter_with(Vec::new()).unwrap();
  write_stdout("inner\n");
  let inner_text = inner.exit().unwrap();
  assert_eq!(stdout_identity(), outer_target);

  write_stdout("outer after\n");
  let outer_text = outer.exit().unwrap();

  assert_eq!(String::from_utf8(inner_text).unwrap(), "inner\n");
  assert_eq!(String::from_utf8(outer_text).unwrap(), "outer before\nouter after\n");
  assert_eq!(stdout_identity(), before);
}

fn routing_is_restored_after_error_and_panic() {
  let before = stdout_identity();

  #[derive(Debug)]
  enum Failure {
    Guard,
    Work,
  }
  impl From<ChannelError> for Failure {
    fn from(_: ChannelError) -> Self {
      Failure::Guard
    }
  }

  let result: Result<(), Failure> = redirect_stdout(|| {
    write_stdout("noise before failure\n");
    Err(Failure::Work)
  });
  assert!(matches!(result, Err(Failure::Work)));
  assert_eq!(stdout_identity(), before);

  let panicked = std::panic::catch_unwind(|| {
    let _guard = StdoutGuard::enter_with(Vec::new()).unwrap();
    write_stdout("noise before panic\n");
    panic!("detector crashed");
  });
  assert!(panicked.is_err());
  assert_eq!(stdout_identity(), before);
}

// 守卫会捕获测试框架自身写到 stdout 的内容，因此所有检查放在同一个用例里顺序执行
#[test]
fn stdout_guard() {
  captured_output_is_forwarded_in_order();
  child_process_output_is_captured();
  nested_guards_restore_in_stack_order();
  routing_is_restored_after_error_and_panic();
}
