//! The fixed wrapper every user program is executed through.
//!
//! The prelude hides interpreter frames from tracebacks, turns `time.sleep`
//! into a busy-wait of the same length, runs an optional preamble in the same
//! namespace as the user code, and always ends the run with a blank line.
//! User code and preamble are embedded as JSON string literals, which are
//! also valid Python string literals.

use serde_json::Value;

/// Helper definitions evaluated before every run.
pub const PRELUDE: &str = r#"import sys

sys.tracebacklimit = 0

import time
def _runnel_sleep(seconds):
    start = now = time.time()
    while now - start < seconds:
        now = time.time()
time.sleep = _runnel_sleep

def _runnel_run(code, preamble=''):
    namespace = {}
    try:
        exec(preamble, namespace)
        code = compile(code, '<code>', 'exec')
        exec(code, namespace)
    except Exception:
        _, value, tb = sys.exc_info()
        raise value.with_traceback(tb.tb_next)
    finally:
        print()
"#;

const ENTRY: &str = "_runnel_run(*";

/// A user program and its preamble as recovered from a wrapped source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The user's code
    pub code: String,
    /// Code executed first in the same namespace; empty when none was given
    pub preamble: String,
}

/// Wrap `code` in the harness.
pub fn wrap(code: &str, preamble: Option<&str>) -> String {
    let call = Value::from(vec![code, preamble.unwrap_or_default()]);
    format!("{PRELUDE}\n\n{ENTRY}{call})\n")
}

/// Recover the user program from a source produced by [`wrap`].
///
/// Interpreters that implement the harness natively use this instead of
/// evaluating the prelude. Returns `None` for sources not built by [`wrap`].
pub fn parse(source: &str) -> Option<Invocation> {
    let rest = source.strip_prefix(PRELUDE)?;
    let call = rest.trim().strip_prefix(ENTRY)?.strip_suffix(')')?;
    let (code, preamble): (String, String) = serde_json::from_str(call).ok()?;
    Some(Invocation { code, preamble })
}
