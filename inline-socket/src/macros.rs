/// Calls a `libc` function and turns a `-1` return into the thread's last OS
/// error.
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
    #[allow(unused_unsafe)]
    let res = unsafe { libc::$fn($($arg, )*) };
    if res == -1 {
      Err(std::io::Error::last_os_error())
    } else {
      Ok(res)
    }
  }};
}

/// Retries a syscall expression for as long as it fails with `EINTR`.
macro_rules! retry_eintr {
  ($expr: expr) => {{
    loop {
      match $expr {
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
        other => break other,
      }
    }
  }};
}
