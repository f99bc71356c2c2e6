//! Stand-in interpreter for process-level tests.
//!
//! A POSIX `sh` loop that behaves like TeX listening on its terminal: every
//! input line is appended to `texput.log` and echoed on stderr. Lines starting
//! with `#` are only logged. `error...` makes it log an undefined control
//! sequence and stop at the error prompt; `fatal` makes it abort with the
//! fatal no-output line; `exit` ends input cleanly; `pid` answers with the
//! process id, which no two processes share.

use std::io;
use std::process::{Child, Command};
use std::sync::Arc;

use crate::child::{ChildProcessConfig, ProcessSpawner, SpawnRequest};
use crate::name::EngineName;

const FAKE_TEX: &str = r#"
printf 'This is FakeTeX\n**'
while IFS= read -r line; do
  printf '%s\n' "$line" >> texput.log
  case "$line" in
    \#*) ;;
    error*)
      printf '! Undefined control sequence.\nl.1 \\error\n\n! Emergency stop.\n' >> texput.log
      printf '\n! Undefined control sequence.\n<*> %s\n\n? ' "$line"
      ;;
    fatal*)
      printf '! TeX capacity exceeded, sorry [grouping levels=255].\n!  ==> Fatal error occurred, no output PDF file produced!\n' >> texput.log
      printf '!  ==> Fatal error occurred, no output PDF file produced!\n'
      exit 1
      ;;
    exit*) exit 0 ;;
    pid) printf '%s\n' "$$" >&2 ;;
    *) printf '%s\n' "$line" >&2 ;;
  esac
done
"#;

pub(crate) struct FakeTexSpawner;

impl ProcessSpawner for FakeTexSpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> io::Result<Child> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(FAKE_TEX);
        request.prepare(&mut command);
        command.spawn()
    }
}

pub(crate) fn fake_config() -> ChildProcessConfig {
    ChildProcessConfig::new(EngineName::PdfTex).with_spawner(Arc::new(FakeTexSpawner))
}
