//! Subprocess-backed LLM invocation.
//!
//! Spawns the configured provider CLI with the prompt on stdin and a
//! hard deadline. Failures never escape as errors: the response envelope
//! carries an `ERROR:` marker instead, which is what the executor's
//! classification expects.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use sortie_exec::invoker::{LlmInvoker, LlmResponse, ERROR_MARKER, TIMEOUT_MARKER};

pub struct SubprocessInvoker {
    program: String,
}

impl SubprocessInvoker {
    /// `program` is the provider CLI on PATH (e.g. the configured
    /// provider identifier).
    pub fn new(program: &str) -> Self {
        SubprocessInvoker { program: program.to_string() }
    }
}

impl LlmInvoker for SubprocessInvoker {
    fn invoke(&self, prompt: &str, model: &str, timeout: Duration) -> LlmResponse {
        let started = Instant::now();

        let spawn = Command::new(&self.program)
            .arg("-p")
            .arg("--model")
            .arg(model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawn {
            Ok(child) => child,
            Err(e) => {
                return LlmResponse {
                    text: format!("{} failed to spawn {}: {}", ERROR_MARKER, self.program, e),
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(prompt.as_bytes()).is_err() {
                let _ = child.kill();
                return LlmResponse {
                    text: format!("{} could not write prompt to {}", ERROR_MARKER, self.program),
                    latency_ms: started.elapsed().as_millis() as u64,
                };
            }
        }

        // Poll for exit up to the deadline; kill on timeout
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let output = match child.wait_with_output() {
                        Ok(output) => output,
                        Err(e) => {
                            return LlmResponse {
                                text: format!("{} reading output: {}", ERROR_MARKER, e),
                                latency_ms: started.elapsed().as_millis() as u64,
                            }
                        }
                    };
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let text = if status.success() {
                        String::from_utf8_lossy(&output.stdout).to_string()
                    } else {
                        format!(
                            "{} {} exited with {}: {}",
                            ERROR_MARKER,
                            self.program,
                            status,
                            String::from_utf8_lossy(&output.stderr).trim()
                        )
                    };
                    return LlmResponse { text, latency_ms };
                }
                Ok(None) => {
                    if started.elapsed() >= timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return LlmResponse {
                            text: format!(
                                "{} after {:.0}s",
                                TIMEOUT_MARKER,
                                timeout.as_secs_f64()
                            ),
                            latency_ms: started.elapsed().as_millis() as u64,
                        };
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    return LlmResponse {
                        text: format!("{} waiting on {}: {}", ERROR_MARKER, self.program, e),
                        latency_ms: started.elapsed().as_millis() as u64,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_yields_error_envelope() {
        let invoker = SubprocessInvoker::new("definitely-not-a-real-binary-xyz");
        let response = invoker.invoke("hello", "m", Duration::from_secs(1));
        assert!(response.text.starts_with(ERROR_MARKER));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_and_marks() {
        // `sleep` ignores the prompt protocol but exercises the deadline
        let invoker = SubprocessInvoker::new("sleep");
        let response = invoker.invoke("10", "m", Duration::from_millis(200));
        // sleep exits nonzero on bad args, or gets killed; both are
        // in-band failures, never a panic
        assert!(response.text.starts_with(ERROR_MARKER));
    }
}
