use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Opt-in transcript logging to a plain text file. Write-only: the log is
/// never read back into a conversation.
pub struct LoggingState {
    file_path: Option<String>,
    is_active: bool,
}

impl LoggingState {
    pub fn new(log_file: Option<String>) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(path) = &log_file {
            test_file_access(path)?;
        }

        let is_active = log_file.is_some();
        Ok(LoggingState {
            file_path: log_file,
            is_active,
        })
    }

    pub fn log_message(&self, content: &str) -> Result<(), Box<dyn std::error::Error>> {
        let Some(file_path) = self.file_path.as_ref().filter(|_| self.is_active) else {
            return Ok(());
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        for line in content.lines() {
            writeln!(file, "{}", line)?;
        }
        writeln!(file)?;

        file.flush()?;
        Ok(())
    }

    pub fn get_status_string(&self) -> String {
        match (&self.file_path, self.is_active) {
            (None, _) => "disabled".to_string(),
            (Some(path), true) => format!(
                "active ({})",
                Path::new(path)
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
            ),
            (Some(path), false) => format!(
                "paused ({})",
                Path::new(path)
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
            ),
        }
    }
}

fn test_file_access(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn inactive_logger_writes_nothing() {
        let logging = LoggingState::new(None).unwrap();
        assert!(logging.log_message("dropped").is_ok());
        assert_eq!(logging.get_status_string(), "disabled");
    }

    #[test]
    fn messages_append_with_spacing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transcript.log");
        let logging = LoggingState::new(Some(path.to_string_lossy().into_owned())).unwrap();

        logging.log_message("You: hello").unwrap();
        logging.log_message("line one\nline two").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "You: hello\n\nline one\nline two\n\n");
        assert!(logging.get_status_string().starts_with("active"));
    }
}
