//! Engine process lifecycle.
//!
//! The driver can attach to an engine someone else started, spawn the engine
//! binary itself, or spawn it wrapped in the memory checker. In the child
//! modes the engine's stdout and stderr are merged onto one pipe that the
//! supervisor reads: first for the startup handshake (pid line, then a line
//! containing `listening`), afterwards on a dedicated thread for log echoing
//! and memory-checker accounting.
//!
//! Closing the protocol socket is the engine's shutdown signal; `shutdown`
//! then waits for the child and joins the reader thread.

use std::env;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use crate::error::{EngineError, Result};

use super::instrumentation::{self, OutputAccounting};

/// Port the first engine instance listens on; later child instances count up
/// from here.
pub const DEFAULT_ENGINE_PORT: u16 = 21214;

/// Environment variable naming the engine binary. When unset the binary is
/// assumed to be `./voltdbipc` and the memory checker logs to a file instead
/// of streaming inline.
pub const ENGINE_PATH_ENV: &str = "VOLTDBIPC_PATH";

const DEFAULT_ENGINE_BINARY: &str = "./voltdbipc";
const HANDSHAKE_TOKEN: &str = "listening";

static NEXT_PORT: AtomicU32 = AtomicU32::new(DEFAULT_ENGINE_PORT as u32);

/// Claim the next engine port. Process-wide and monotonically increasing so
/// parallel drivers never collide.
pub fn next_engine_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst) as u16
}

/// How the engine process comes to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    /// Connect to an engine started out-of-band. With `port: None` the
    /// operator is prompted and the default port is used.
    External { port: Option<u16> },
    /// Spawn the engine binary directly, port as its sole argument.
    Managed,
    /// Spawn the engine under the memory checker; diagnostics feed the
    /// process-wide instrumentation log.
    Instrumented,
}

/// A supervised engine process (or a handle to an external one).
#[derive(Debug)]
pub struct EngineProcess {
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    port: u16,
}

impl EngineProcess {
    /// Bring up the engine per `target` and complete the startup handshake.
    /// Only after this returns may the transport connect.
    pub fn launch(target: &BackendTarget, site_id: u32) -> Result<Self> {
        match target {
            BackendTarget::External { port } => Self::external(*port),
            BackendTarget::Managed => {
                let port = next_engine_port();
                Self::spawn(vec![engine_binary(), port.to_string()], false, port)
            }
            BackendTarget::Instrumented => {
                let port = next_engine_port();
                Self::spawn(instrumented_argv(site_id, port), true, port)
            }
        }
    }

    /// Port the engine accepts the protocol connection on.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn external(port: Option<u16>) -> Result<Self> {
        let port = match port {
            Some(port) => port,
            None => {
                println!(
                    "Press enter after you have started the engine process \
                     to initiate the connection"
                );
                let mut line = String::new();
                std::io::stdin().read_line(&mut line)?;
                DEFAULT_ENGINE_PORT
            }
        };
        Ok(Self {
            child: None,
            reader: None,
            port,
        })
    }

    fn spawn(argv: Vec<String>, instrumented: bool, port: u16) -> Result<Self> {
        tracing::info!(?argv, port, "spawning engine");

        let (pipe_reader, pipe_writer) = std::io::pipe()?;
        let mut child = {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..])
                .stdin(Stdio::null())
                .stdout(pipe_writer.try_clone()?)
                .stderr(pipe_writer);
            cmd.spawn()?
        };

        let mut lines = BufReader::new(pipe_reader).lines();

        // First line identifies the child: "==<pid>==...". The pid doubles
        // as the filter prefix for memory-checker output.
        let pid = match lines.next().transpose()? {
            Some(line) => match parse_pid_line(&line) {
                Some(pid) => pid,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::Startup(format!(
                        "unrecognized pid line from engine: {line:?}"
                    )));
                }
            },
            None => return Err(startup_eof(&mut child)),
        };
        tracing::info!(%pid, "engine pid line received");

        // Echo output until the engine says it is listening.
        loop {
            match lines.next().transpose()? {
                Some(line) => {
                    tracing::info!("[ipc={pid}] {line}");
                    if line.contains(HANDSHAKE_TOKEN) {
                        break;
                    }
                }
                None => return Err(startup_eof(&mut child)),
            }
        }

        // From here on a dedicated thread owns the output stream.
        let reader_pid = pid.clone();
        let reader = std::thread::spawn(move || {
            let mut accounting = instrumented.then(|| OutputAccounting::new(&reader_pid));
            for line in lines {
                let Ok(line) = line else { break };
                tracing::info!("[ipc={reader_pid}] {line}");
                if let Some(accounting) = accounting.as_mut() {
                    if accounting.matches(&line) {
                        accounting.process_line(&line, instrumentation::global());
                    }
                }
            }
            tracing::info!("[ipc={reader_pid}] end of output stream");
            if let Some(accounting) = accounting {
                accounting.finish(instrumentation::global());
            }
        });

        Ok(Self {
            child: Some(child),
            reader: Some(reader),
            port,
        })
    }

    /// Wait for the child to exit and join the reader thread. The caller
    /// must have closed the protocol socket first; that is what tells the
    /// engine to terminate.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            tracing::info!(%status, "engine exited");
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        Ok(())
    }
}

impl Drop for EngineProcess {
    // The coordinator going down must not leave the engine behind.
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn engine_binary() -> String {
    env::var(ENGINE_PATH_ENV).unwrap_or_else(|_| DEFAULT_ENGINE_BINARY.to_string())
}

fn instrumented_argv(site_id: u32, port: u16) -> Vec<String> {
    let engine_path = env::var(ENGINE_PATH_ENV).ok();
    let mut argv: Vec<String> = [
        "valgrind",
        "--leak-check=full",
        "--show-reachable=yes",
        "--num-callers=32",
        "--error-exitcode=-1",
    ]
    .map(String::from)
    .into();
    if engine_path.is_none() {
        // Outside the regression harness nobody captures the inline stream,
        // so the checker writes a per-site log file instead.
        argv.push("--quiet".into());
        argv.push(format!("--log-file=site_{site_id}.log"));
    }
    argv.push(engine_path.unwrap_or_else(|| DEFAULT_ENGINE_BINARY.into()));
    argv.push(port.to_string());
    argv
}

/// Extract the pid from the child's banner line, `…=<pid>=…`.
fn parse_pid_line(line: &str) -> Option<String> {
    let rest = line.get(2..)?;
    let end = rest.find('=')?;
    let pid = &rest[..end];
    if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(pid.to_string())
}

fn startup_eof(child: &mut Child) -> EngineError {
    match child.wait() {
        Ok(status) => EngineError::Startup(format!(
            "engine closed its output before listening, exit status {status}"
        )),
        Err(e) => EngineError::Startup(format!(
            "engine closed its output before listening; wait failed: {e}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid_line() {
        assert_eq!(parse_pid_line("==4242== Memcheck").as_deref(), Some("4242"));
        assert_eq!(parse_pid_line("==7==").as_deref(), Some("7"));
        assert_eq!(parse_pid_line("==abc=="), None);
        assert_eq!(parse_pid_line("===="), None);
        assert_eq!(parse_pid_line("no equals here"), None);
        assert_eq!(parse_pid_line(""), None);
    }

    #[test]
    fn test_port_counter_is_monotonic() {
        let first = next_engine_port();
        let second = next_engine_port();
        assert!(second > first);
        assert!(first >= DEFAULT_ENGINE_PORT);
    }

    #[test]
    fn test_external_target_with_port_has_no_child() {
        let process = EngineProcess::launch(&BackendTarget::External { port: Some(4000) }, 0)
            .unwrap();
        assert_eq!(process.port(), 4000);
        assert!(process.child.is_none());
    }

    #[test]
    fn test_instrumented_argv_without_env_logs_to_file() {
        // Only meaningful when the harness env var is absent.
        if env::var(ENGINE_PATH_ENV).is_ok() {
            return;
        }
        let argv = instrumented_argv(3, 21300);
        assert_eq!(argv[0], "valgrind");
        assert!(argv.contains(&"--leak-check=full".to_string()));
        assert!(argv.contains(&"--num-callers=32".to_string()));
        assert!(argv.contains(&"--quiet".to_string()));
        assert!(argv.contains(&"--log-file=site_3.log".to_string()));
        assert_eq!(argv[argv.len() - 2], DEFAULT_ENGINE_BINARY);
        assert_eq!(argv[argv.len() - 1], "21300");
    }

    #[cfg(unix)]
    mod fake_engine {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;

        fn write_script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-engine.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[test]
        fn test_managed_handshake_and_shutdown() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(
                &dir,
                "echo '==4242=='\n\
                 echo 'listening on port '$1\n\
                 echo 'late line'\n",
            );

            let mut process = EngineProcess::spawn(
                vec![script.display().to_string(), "21999".to_string()],
                false,
                21999,
            )
            .unwrap();
            assert_eq!(process.port(), 21999);
            process.shutdown().unwrap();
            assert!(process.child.is_none());
            assert!(process.reader.is_none());
        }

        #[test]
        fn test_exit_before_listening_fails_startup() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "echo '==1==' \nexit 3\n");

            let err = EngineProcess::spawn(
                vec![script.display().to_string(), "22000".to_string()],
                false,
                22000,
            )
            .unwrap_err();
            match err {
                EngineError::Startup(message) => {
                    assert!(message.contains("before listening"), "{message}");
                }
                other => panic!("expected startup failure, got {other:?}"),
            }
        }

        #[test]
        fn test_instrumented_output_feeds_global_log() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(
                &dir,
                "echo '==5151=='\n\
                 echo 'listening'\n\
                 echo '==5151== ERROR SUMMARY: 3 errors from 1 contexts'\n",
            );

            let mut process = EngineProcess::spawn(
                vec![script.display().to_string(), "22001".to_string()],
                true,
                22001,
            )
            .unwrap();
            process.shutdown().unwrap();

            let errors = instrumentation::global().take();
            assert!(errors.iter().any(|e| e.contains("ERROR SUMMARY: 3")));
            // No "All heap blocks were freed" line was printed.
            assert!(errors.iter().any(|e| e == "Not all heap blocks were freed"));
        }
    }
}
