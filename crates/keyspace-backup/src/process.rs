use std::any::Any;
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Output, Stdio};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_output;

pub(crate) fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub(crate) fn run_command_output(cmd: &mut Command) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .output()
        .map_err(|e| Error::msg(format!("failed to run command {}: {e}", program_name(cmd))))
}

/// Run `cmd`, returning its output only when it exits successfully.
pub(crate) fn run_command_capture(mut cmd: Command) -> Result<Output> {
    let out = run_command_output(&mut cmd)?;
    if out.status.success() {
        return Ok(out);
    }
    Err(Error::msg(format!(
        "{} failed: {}",
        program_name(&cmd),
        command_summary(&out)
    )))
}

pub(crate) fn command_summary(out: &Output) -> String {
    let stderr = sanitize_output(&out.stderr);
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = sanitize_output(&out.stdout);
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Feed `body` to the child's stdin and wait for it to exit. If `body`
/// fails mid-stream the child is killed before stdin closes, so it never
/// sees a clean EOF and cannot commit the partial input.
pub(crate) fn run_with_stdin(mut cmd: Command, body: &mut dyn Read) -> Result<()> {
    let what = program_name(&cmd);
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to run command {what}: {e}")))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::msg(format!("{what}: stdin was not captured")))?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let copied = io::copy(body, &mut stdin);
    if copied.is_err() {
        let _ = child.kill();
    }
    drop(stdin);
    let status = child
        .wait()
        .map_err(|e| Error::msg(format!("failed to wait for {what}: {e}")))?;
    let out = Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    };

    if let Err(e) = copied {
        // A broken pipe means the child quit first; its own output says why.
        if e.kind() == io::ErrorKind::BrokenPipe {
            return Err(Error::msg(format!("{what} failed: {}", command_summary(&out))));
        }
        return Err(Error::msg(format!("{what}: failed to stream input: {e}")));
    }
    if !out.status.success() {
        return Err(Error::msg(format!("{what} failed: {}", command_summary(&out))));
    }
    Ok(())
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Streams a child's stdout. The exit status is checked when the stream is
/// exhausted, so a failed command surfaces as a read error instead of a
/// silently short body. Dropping the reader early kills the child.
pub struct ChildReader {
    what: String,
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<Vec<u8>>>,
    finished: bool,
    _guard: Option<Box<dyn Any + Send>>,
}

impl ChildReader {
    pub(crate) fn spawn(mut cmd: Command, what: impl Into<String>) -> Result<Self> {
        let what = what.into();
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to start {what}: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::msg(format!("{what}: stdout was not captured")))?;
        let stderr = child.stderr.take().map(drain);
        Ok(Self {
            what,
            child,
            stdout,
            stderr,
            finished: false,
            _guard: None,
        })
    }

    /// Keep `guard` alive for as long as the reader is.
    pub(crate) fn with_guard<G: Any + Send>(mut self, guard: G) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        let status = self.child.wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        let detail = sanitize_output(&stderr);
        Err(io::Error::other(format!(
            "{} failed ({status}): {}",
            self.what,
            if detail.is_empty() { "no output" } else { detail.as_str() }
        )))
    }
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finish()?;
        }
        Ok(n)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn child_reader_reports_failure_at_eof() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf abc; echo boom >&2; exit 3");
        let mut r = ChildReader::spawn(cmd, "test command").expect("spawn");
        let mut got = Vec::new();
        let err = r.read_to_end(&mut got).unwrap_err().to_string();
        assert_eq!(got, b"abc");
        assert!(err.contains("boom"), "unexpected err: {err}");
    }

    #[test]
    fn stdin_is_streamed_to_child() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dest = tmp.path().join("out");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("cat > {}", sh_quote(&dest.to_string_lossy())));
        run_with_stdin(cmd, &mut &b"payload"[..]).expect("run");
        assert_eq!(std::fs::read(&dest).expect("read"), b"payload");
    }

    /// Yields `chunks` pieces of input, then fails.
    struct FailsAfter {
        chunks: usize,
    }

    impl Read for FailsAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks == 0 {
                return Err(io::Error::other("source went away"));
            }
            self.chunks -= 1;
            let part = b"part";
            let n = part.len().min(buf.len());
            buf[..n].copy_from_slice(&part[..n]);
            Ok(n)
        }
    }

    #[test]
    fn failed_input_kills_child_before_it_commits() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let part = sh_quote(&tmp.path().join("obj.part").to_string_lossy());
        let dest = tmp.path().join("obj");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!(
            "cat > {part} && mv {part} {}",
            sh_quote(&dest.to_string_lossy())
        ));

        let err = run_with_stdin(cmd, &mut FailsAfter { chunks: 2 })
            .unwrap_err()
            .to_string();
        assert!(err.contains("source went away"), "unexpected err: {err}");
        assert!(!dest.exists(), "partial input was committed");
    }
}
