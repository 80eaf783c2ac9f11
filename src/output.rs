//! User-facing output helpers.
//!
//! Callers pass the stderr handle explicitly so tests can capture what
//! would be shown to the user.

use std::io::Write;

/// Write one line to the given stderr handle.
///
/// # Errors
///
/// Returns any I/O error from the underlying writer.
pub fn write_stderr_line(stderr: &mut dyn Write, message: &str) -> std::io::Result<()> {
    writeln!(stderr, "{message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_terminated() {
        let mut sink = Vec::new();
        write_stderr_line(&mut sink, "hello").expect("writing to a Vec cannot fail");
        assert_eq!(sink, b"hello\n");
    }
}
