use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence;
/// otherwise only warnings are shown, or debug output for this crate when
/// `verbose` is set. Logs go to stderr so command output stays clean.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("warn,toolrelay=debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Appends finished assistant replies to a plain-text transcript file.
pub struct TranscriptWriter {
    file_path: Option<String>,
}

impl TranscriptWriter {
    pub fn new(file_path: Option<String>) -> Self {
        Self { file_path }
    }

    /// Points the transcript at `path` after checking it can be written.
    pub fn set_log_file(&mut self, path: String) -> io::Result<()> {
        OpenOptions::new().create(true).append(true).open(&path)?;
        self.file_path = Some(path);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.file_path.is_some()
    }

    pub fn status_string(&self) -> String {
        match &self.file_path {
            None => "disabled".to_string(),
            Some(path) => format!(
                "active ({})",
                Path::new(path)
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
            ),
        }
    }

    pub fn log_message(&self, content: &str) -> io::Result<()> {
        let Some(file_path) = &self.file_path else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let mut writer = BufWriter::new(file);

        for line in content.lines() {
            writeln!(writer, "{line}")?;
        }
        // Blank line between messages.
        writeln!(writer)?;

        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn inactive_writer_is_a_no_op() {
        let writer = TranscriptWriter::new(None);
        assert!(!writer.is_active());
        assert_eq!(writer.status_string(), "disabled");
        writer.log_message("ignored").expect("no-op");
    }

    #[test]
    fn messages_are_appended_with_spacing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("chat.log");
        let mut writer = TranscriptWriter::new(None);
        writer
            .set_log_file(path.to_string_lossy().into_owned())
            .expect("set log file");
        assert_eq!(writer.status_string(), "active (chat.log)");

        writer.log_message("first\nreply").expect("write");
        writer.log_message("second").expect("write");

        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "first\nreply\n\nsecond\n\n");
    }

    #[test]
    fn unwritable_log_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("chat.log");
        let mut writer = TranscriptWriter::new(None);
        assert!(writer
            .set_log_file(path.to_string_lossy().into_owned())
            .is_err());
        assert!(!writer.is_active());
    }
}
