//! Child-process executor speaking the one-line activation protocol.
//!
//! The user executable is spawned with:
//!
//! - stdin: a pipe the executor writes one JSON request line into per run;
//! - stdout: the response channel — exactly one bounded line per run, read
//!   back by the executor;
//! - stderr: the owning proxy's log sink, written by the child directly.
//!
//! Keeping stdout as the pure response channel means activation logs
//! belong on stderr; anything the child prints to stdout is read as its
//! answer.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use crate::logs::LogSink;

/// Response line budget. A longer line means the child is not speaking the
/// protocol; it is treated as dead.
const MAX_RESPONSE: usize = 16 * 1024 * 1024;

/// How long after spawn the child is given to fail fast.
const START_GRACE: Duration = Duration::from_millis(5);

/// The child terminated, stopped answering, or broke the line protocol.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("command exited")]
pub struct ChildExited;

/// Exclusively owned handle to a running user executable.
///
/// Dropping the executor kills the child.
#[derive(Debug)]
pub struct Executor {
    child: Child,
    stdin: ChildStdin,
    responses: BufReader<ChildStdout>,
    out: LogSink,
    err: LogSink,
}

impl Executor {
    /// Spawns `exec` with the given extra environment, wiring stdout as the
    /// response pipe and stderr to the log sink.
    ///
    /// Fails if the process cannot be spawned or exits within the start
    /// grace period.
    pub fn start(
        exec: &Path,
        env: &[(String, String)],
        out: &LogSink,
        err: &LogSink,
    ) -> io::Result<Self> {
        let mut child = Command::new(exec)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(err.child_stdio()?)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child spawned without a stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child spawned without a stdout pipe"))?;

        // Fail fast on executables that die immediately (bad format,
        // missing interpreter, permission trouble surfaced late).
        std::thread::sleep(START_GRACE);
        if let Some(status) = child.try_wait()? {
            return Err(io::Error::other(format!(
                "command exited abruptly during init: {status}"
            )));
        }

        Ok(Self {
            child,
            stdin,
            responses: BufReader::new(stdout),
            out: out.clone(),
            err: err.clone(),
        })
    }

    /// One activation round-trip: writes `input` plus a newline to the
    /// child's stdin, reads one bounded line back from its stdout.
    ///
    /// The activation sentinel is appended to both log sinks afterwards,
    /// success or not, so log consumers can always delimit activations.
    pub fn interact(&mut self, input: &[u8]) -> Result<Vec<u8>, ChildExited> {
        let result = self.round_trip(input);
        self.out.append_guard();
        self.err.append_guard();
        result
    }

    fn round_trip(&mut self, input: &[u8]) -> Result<Vec<u8>, ChildExited> {
        // Single write: request plus terminator in one syscall-sized record.
        let mut line = Vec::with_capacity(input.len() + 1);
        line.extend_from_slice(input);
        line.push(b'\n');
        self.stdin.write_all(&line).map_err(|_| ChildExited)?;
        self.stdin.flush().map_err(|_| ChildExited)?;

        read_bounded_line(&mut self.responses)
    }

    /// Non-blocking liveness check.
    pub fn exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => false,
            Ok(Some(_)) | Err(_) => true,
        }
    }

    /// Kills the child and reaps it.
    pub fn stop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reads one newline-terminated line, up to [`MAX_RESPONSE`] bytes.
///
/// EOF before any byte, an I/O error, or an oversized line all mean the
/// child is unusable. A final unterminated line at EOF is still returned;
/// the caller will find out on the next round-trip.
fn read_bounded_line(reader: &mut impl BufRead) -> Result<Vec<u8>, ChildExited> {
    let mut line = Vec::new();
    loop {
        let (chunk, terminated) = {
            let buf = reader.fill_buf().map_err(|_| ChildExited)?;
            if buf.is_empty() {
                // EOF: the child closed its stdout.
                if line.is_empty() {
                    return Err(ChildExited);
                }
                return Ok(line);
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => (buf[..pos].to_vec(), true),
                None => (buf.to_vec(), false),
            }
        };
        let consumed = chunk.len() + usize::from(terminated);
        line.extend_from_slice(&chunk);
        reader.consume(consumed);
        if line.len() > MAX_RESPONSE {
            return Err(ChildExited);
        }
        if terminated {
            return Ok(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Instant;

    use super::*;

    /// Writes an executable shell script into `dir` and returns its path.
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("exec");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// An action that logs to stderr and answers on stdout.
    const GREETER: &str = "#!/bin/sh\n\
        while read line; do\n\
        echo 'Main' >&2\n\
        echo 'Hello, Mike' >&2\n\
        printf '%s\\n' '{\"greetings\":\"Hello, Mike\"}'\n\
        done\n";

    #[test]
    fn interact_round_trip_and_log_tee() {
        let dir = tempfile::tempdir().unwrap();
        let exec = write_script(dir.path(), GREETER);
        let out = LogSink::temp().unwrap();
        let err = LogSink::temp().unwrap();

        let mut executor = Executor::start(&exec, &[], &out, &err).unwrap();
        let response = executor.interact(br#"{"value":{"name":"Mike"}}"#).unwrap();
        assert_eq!(response, br#"{"greetings":"Hello, Mike"}"#);

        // Two activations stay serialized on the same pipe pair.
        let response = executor.interact(br#"{"value":{}}"#).unwrap();
        assert_eq!(response, br#"{"greetings":"Hello, Mike"}"#);
        executor.stop();

        // Logs land in the stderr sink; the response pipe stays clean.
        let stderr_log = err.capture_from(0).unwrap();
        assert!(stderr_log.contains("Main\nHello, Mike\n"));
        // One sentinel per activation, on both sinks.
        assert_eq!(
            stderr_log
                .matches(actionloop_proto::ACTIVATION_GUARD)
                .count(),
            2
        );
        assert_eq!(
            out.capture_from(0)
                .unwrap()
                .matches(actionloop_proto::ACTIVATION_GUARD)
                .count(),
            2
        );
    }

    #[test]
    fn env_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let exec = write_script(
            dir.path(),
            "#!/bin/sh\nwhile read line; do printf '{\"greeting\":\"%s\"}\\n' \"$GREETING\"; done\n",
        );
        let out = LogSink::temp().unwrap();
        let err = LogSink::temp().unwrap();

        let env = vec![("GREETING".to_owned(), "ciao".to_owned())];
        let mut executor = Executor::start(&exec, &env, &out, &err).unwrap();
        let response = executor.interact(b"{}").unwrap();
        assert_eq!(response, br#"{"greeting":"ciao"}"#);
    }

    #[test]
    fn dead_child_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let exec = write_script(dir.path(), "#!/bin/sh\nread line\nexit 1\n");
        let out = LogSink::temp().unwrap();
        let err = LogSink::temp().unwrap();

        let mut executor = Executor::start(&exec, &[], &out, &err).unwrap();
        // First interact: child reads the line, then exits without answering.
        assert!(executor.interact(b"{}").is_err());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !executor.exited() {
            assert!(Instant::now() < deadline, "child never reaped");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(executor.interact(b"{}").is_err());
    }

    #[test]
    fn missing_executable_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let out = LogSink::temp().unwrap();
        let err = LogSink::temp().unwrap();
        assert!(Executor::start(&dir.path().join("nope"), &[], &out, &err).is_err());
    }

    #[test]
    fn bounded_line_reader_rejects_oversize() {
        let huge = vec![b'x'; MAX_RESPONSE + 1];
        let mut reader = io::Cursor::new(huge);
        assert!(read_bounded_line(&mut BufReader::new(&mut reader)).is_err());
    }

    #[test]
    fn bounded_line_reader_returns_final_unterminated_line() {
        let mut reader = BufReader::new(io::Cursor::new(b"{\"a\":1}".to_vec()));
        assert_eq!(read_bounded_line(&mut reader).unwrap(), b"{\"a\":1}");
    }
}
