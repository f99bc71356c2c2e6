//! Console transcript scanning and log-based error extraction.
//!
//! TeX reports faults only as text. The console scanner watches the
//! interpreter's terminal output for the moment it stops at an error prompt;
//! [`extract_error_message`] then recovers the message from `texput.log`.

/// Input echo TeX prints when it shows the offending line (`<*> \error`).
pub const INPUT_ECHO_MARKER: &[u8] = b"<*> ";

/// Interactive prompt TeX waits at after an error.
pub const IDLE_PROMPT: &[u8] = b"? ";

pub const FATAL_NO_OUTPUT: &[u8] = b"!  ==> Fatal error occurred, no output PDF file produced!";

pub const EMERGENCY_STOP: &[u8] = b"! Emergency stop.";

/// Lua error lines are followed by this, not prefixed with `!`.
pub const LUA_TRACEBACK: &[u8] = b"stack traceback:";

/// Lua errors raised directly inside `\directlua` at top level (no traceback).
pub const LUA_TOPLEVEL: &[u8] = br"[\directlua]:";

pub const GENERIC_ERROR_MESSAGE: &str = "TeX error";

/// What made the console scanner give up on the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFault {
    /// Interpreter stopped at `? ` after echoing an input line.
    ErrorPrompt,
    /// Interpreter printed its fatal no-output line.
    FatalExit,
}

impl ConsoleFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorPrompt => "error prompt",
            Self::FatalExit => "fatal exit",
        }
    }
}

/// Everything the interpreter printed on its console.
#[derive(Debug, Default)]
pub struct ConsoleTranscript {
    lines: Vec<Vec<u8>>,
    pending: Vec<u8>,
    marker_seen: bool,
    fault: Option<ConsoleFault>,
}

impl ConsoleTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of console output.
    ///
    /// Returns the fault the first time one is detected. Once faulted the
    /// transcript keeps recording but stops scanning.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<ConsoleFault> {
        self.pending.extend_from_slice(chunk);

        let mut completed = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            completed.push(line);
        }

        let scanning = self.fault.is_none();
        let mut fault = None;
        if scanning {
            if completed.iter().any(|line| line.starts_with(INPUT_ECHO_MARKER)) {
                self.marker_seen = true;
            }
            if completed.iter().any(|line| contains(line, FATAL_NO_OUTPUT)) {
                fault = Some(ConsoleFault::FatalExit);
            } else if self.marker_seen && self.pending == IDLE_PROMPT {
                fault = Some(ConsoleFault::ErrorPrompt);
            }
        }
        self.lines.extend(completed);

        if fault.is_some() {
            self.fault = fault;
        }
        fault
    }

    pub fn fault(&self) -> Option<ConsoleFault> {
        self.fault
    }

    pub fn marker_seen(&self) -> bool {
        self.marker_seen
    }

    /// Completed lines, decoded lossily.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

fn contains(line: &[u8], phrase: &[u8]) -> bool {
    line.windows(phrase.len()).any(|window| window == phrase)
}

/// Recover the human-readable message from the contents of `texput.log`.
///
/// Error lines are those starting with `!`, those right before a Lua
/// traceback, and top-level `\directlua` errors. The message is the error
/// line just before the last emergency stop (or the fatal no-output line).
pub fn extract_error_message(log: &[u8]) -> String {
    let log_lines: Vec<&[u8]> = log
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();

    let error_lines: Vec<&[u8]> = log_lines
        .iter()
        .enumerate()
        .filter(|&(i, line)| {
            line.starts_with(b"!")
                || log_lines.get(i + 1).is_some_and(|next| *next == LUA_TRACEBACK)
                || line.starts_with(LUA_TOPLEVEL)
        })
        .map(|(_, line)| *line)
        .collect();

    let last_index_of = |marker: &[u8]| error_lines.iter().rposition(|line| *line == marker);
    let stop = last_index_of(EMERGENCY_STOP).or_else(|| last_index_of(FATAL_NO_OUTPUT));

    match stop {
        Some(i) if i > 0 => {
            let line = error_lines[i - 1];
            let line = line.strip_prefix(b"!").unwrap_or(line).trim_ascii_start();
            String::from_utf8_lossy(line).into_owned()
        }
        _ => GENERIC_ERROR_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_after_echo_is_an_error() {
        let mut t = ConsoleTranscript::new();
        assert_eq!(t.feed(b"This is pdfTeX\n**"), None);
        assert_eq!(t.feed(b"\n! Undefined control sequence.\n<*> \\err"), None);
        assert!(!t.marker_seen());
        assert_eq!(t.feed(b"or\n\n? "), Some(ConsoleFault::ErrorPrompt));
        assert!(t.marker_seen());
        assert_eq!(t.pending(), IDLE_PROMPT);
        assert_eq!(t.lines()[3], "<*> \\error");
    }

    #[test]
    fn prompt_without_echo_is_ignored() {
        let mut t = ConsoleTranscript::new();
        assert_eq!(t.feed(b"some output\n? "), None);
        assert_eq!(t.fault(), None);
    }

    #[test]
    fn fatal_line_is_an_error_even_without_prompt() {
        let mut t = ConsoleTranscript::new();
        let mut chunk = b"!  ==> Fatal error occurred, no output PDF file produced!".to_vec();
        assert_eq!(t.feed(&chunk), None);
        chunk.clear();
        chunk.push(b'\n');
        assert_eq!(t.feed(&chunk), Some(ConsoleFault::FatalExit));
    }

    #[test]
    fn fatal_phrase_after_prompt_text_is_an_error() {
        let mut t = ConsoleTranscript::new();
        assert_eq!(t.feed(b"This is pdfTeX\n**"), None);
        assert_eq!(
            t.feed(b"!  ==> Fatal error occurred, no output PDF file produced!\n"),
            Some(ConsoleFault::FatalExit)
        );
        assert_eq!(
            t.lines()[1],
            "**!  ==> Fatal error occurred, no output PDF file produced!"
        );
    }

    #[test]
    fn fault_reported_once_and_recording_continues() {
        let mut t = ConsoleTranscript::new();
        assert!(t.feed(b"<*> x\n? ").is_some());
        assert_eq!(t.feed(b"\n<*> y\n? "), None);
        assert_eq!(t.fault(), Some(ConsoleFault::ErrorPrompt));
        assert_eq!(t.lines(), vec!["<*> x", "? ", "<*> y"]);
    }

    #[test]
    fn message_precedes_last_emergency_stop() {
        let log = b"This is pdfTeX\n\
            ! Undefined control sequence.\n\
            l.1 \\error\n\
            \n\
            ! Emergency stop.\n\
            <*> \\error\n\
            No pages of output.\n";
        assert_eq!(extract_error_message(log), "Undefined control sequence.");
    }

    #[test]
    fn lua_traceback_errors_are_found() {
        let log = b"a.lua:1: hello\nstack traceback:\n\t[C]: in ?\n! Emergency stop.\n";
        assert_eq!(extract_error_message(log), "a.lua:1: hello");

        let log = b"[\\directlua]:1: unexpected symbol near ')'.\n! Emergency stop.\n";
        assert_eq!(
            extract_error_message(log),
            "[\\directlua]:1: unexpected symbol near ')'."
        );
    }

    #[test]
    fn fatal_line_used_when_no_emergency_stop() {
        let log = b"! TeX capacity exceeded, sorry [grouping levels=255].\r\n\
            !  ==> Fatal error occurred, no output PDF file produced!\r\n";
        insta::assert_snapshot!(
            extract_error_message(log),
            @"TeX capacity exceeded, sorry [grouping levels=255]."
        );
    }

    #[test]
    fn falls_back_to_generic_message() {
        assert_eq!(extract_error_message(b""), GENERIC_ERROR_MESSAGE);
        assert_eq!(extract_error_message(b"! Emergency stop.\n"), GENERIC_ERROR_MESSAGE);
        assert_eq!(extract_error_message(&[0xff, b'\n']), GENERIC_ERROR_MESSAGE);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let log = b"! Bad \xff byte\n! Emergency stop.\n";
        assert_eq!(extract_error_message(log), "Bad \u{fffd} byte");
    }
}
