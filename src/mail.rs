//! Crash/hang mail notifications (spec §6, grounded on `_send_mail` in
//! `afl.py`). Disabled by default; a configured command is spawned with the
//! report piped to its stdin.

use std::io::Write;
use std::process::{Command, Stdio};

use log::warn;

/// Delivers a short plain-text report somewhere. The default is a no-op so
/// that mail delivery is opt-in (spec §6: ambient concern, off unless
/// configured).
pub trait MailSink {
    fn send(&self, subject: &str, body: &str);
}

pub struct NoopMailSink;

impl MailSink for NoopMailSink {
    fn send(&self, _subject: &str, _body: &str) {}
}

/// Pipes the report to a configured shell command's stdin, e.g. `mail -s
/// <subject> user@example.com`. Failures are logged, never propagated: a
/// broken mail path must not abort a fuzzing run.
pub struct ProcessMailSink {
    command: String,
}

impl ProcessMailSink {
    pub fn new(command: String) -> Self {
        ProcessMailSink { command }
    }
}

impl MailSink for ProcessMailSink {
    fn send(&self, subject: &str, body: &str) {
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("MAZERUNNER_MAIL_SUBJECT", subject)
            .stdin(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to spawn mail command {:?}: {e}", self.command);
                return;
            }
        };
        if let Some(stdin) = child.stdin.as_mut() {
            if let Err(e) = stdin.write_all(body.as_bytes()) {
                warn!("failed to write mail body: {e}");
            }
        }
        if let Err(e) = child.wait() {
            warn!("mail command did not exit cleanly: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_never_panics() {
        NoopMailSink.send("subject", "body");
    }

    #[test]
    fn process_sink_survives_unknown_command() {
        let sink = ProcessMailSink::new("nonexistent-mazerunner-mail-helper".into());
        sink.send("subject", "body");
    }
}
