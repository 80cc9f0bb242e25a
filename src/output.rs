use std::io::Write;

/// Where command modules send what the user sees.
///
/// Tracing goes to stderr separately; this is the command's own output, and
/// tests swap in [`CapturedOutput`] to assert on it.
pub trait UserOutput: Send + Sync {
    /// Plain line: tables, identities, follow-up instructions.
    fn status(&self, message: &str);

    /// A client operation went through.
    fn success(&self, message: &str);

    /// Something the user should look at, e.g. a skipped descriptor.
    fn warning(&self, message: &str);

    /// One client failed.
    fn error(&self, message: &str);

    /// Start a line that [`finish_progress`](Self::finish_progress) completes.
    fn progress(&self, message: &str);

    fn finish_progress(&self, result: &str);
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Terminal output. Results on stdout, warnings and errors on stderr.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("{}{}{}", GREEN, message, RESET);
    }

    fn warning(&self, message: &str) {
        eprintln!("{}{}{}", YELLOW, message, RESET);
    }

    fn error(&self, message: &str) {
        eprintln!("{}{}{}", RED, message, RESET);
    }

    fn progress(&self, message: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{}", message);
        let _ = stdout.flush();
    }

    fn finish_progress(&self, result: &str) {
        println!("{}", result);
    }
}

/// Keeps every line in memory, prefixing warnings and errors.
#[cfg(test)]
#[derive(Default)]
pub struct CapturedOutput {
    lines: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl CapturedOutput {
    pub fn text(&self) -> String {
        self.lines.lock().join("\n")
    }
}

#[cfg(test)]
impl UserOutput for CapturedOutput {
    fn status(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }

    fn success(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }

    fn warning(&self, message: &str) {
        self.lines.lock().push(format!("warning: {}", message));
    }

    fn error(&self, message: &str) {
        self.lines.lock().push(format!("error: {}", message));
    }

    fn progress(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }

    fn finish_progress(&self, result: &str) {
        let mut lines = self.lines.lock();
        match lines.last_mut() {
            Some(last) => last.push_str(result),
            None => lines.push(result.to_string()),
        }
    }
}
