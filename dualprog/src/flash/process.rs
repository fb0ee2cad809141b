//! Subprocess execution with a hard deadline.

use {
    crate::error::{Error, Result},
    log::{debug, trace, warn},
    std::{
        io::Read,
        process::{Command, ExitStatus, Stdio},
        thread,
        time::{Duration, Instant},
    },
};

const POLL: Duration = Duration::from_millis(50);

/// Captured result of a finished tool run.
#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Combined output, stdout first.
    pub fn text(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Last non-empty output line, for error messages.
    pub fn last_line(&self) -> String {
        self.text()
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .unwrap_or("no output")
            .to_string()
    }
}

fn drain(mut source: impl Read + Send + 'static) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run `command`, killing it once `timeout` has passed.
pub(crate) fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<ToolOutput> {
    let program = command.get_program().to_string_lossy().into_owned();
    debug!("Running {program} {:?}", command.get_args().collect::<Vec<_>>());

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::BackendUnavailable(format!("cannot start {program}: {e}")))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!("{program} did not finish within {timeout:?}, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout(format!(
                "{program} did not finish within {}s",
                timeout.as_secs()
            )));
        }
        thread::sleep(POLL);
    };

    let collect = |handle: Option<thread::JoinHandle<String>>| {
        handle.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    let output = ToolOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    };
    trace!("{program} exited with {status}: {}", output.text());
    Ok(output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_output_and_status() {
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.last_line(), "oops");
    }

    #[test]
    fn test_kills_on_timeout() {
        let started = Instant::now();
        let err = run_with_timeout(Command::new("sleep").arg("5"), Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let err = run_with_timeout(&mut Command::new("/nonexistent/tool"), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }
}
