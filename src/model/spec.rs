use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reusable job template: a named command with optional `{{key}}`
/// placeholders filled from runtime arguments at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub created_by: Option<String>,
    /// Inactive specs keep their history but cannot be run.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSpec {
    /// Normalize command text at save time: trailing newlines stripped.
    pub fn normalize_command(command: &str) -> String {
        command.trim_end_matches(['\n', '\r']).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_newlines_stripped() {
        assert_eq!(JobSpec::normalize_command("echo hi\n\n"), "echo hi");
        assert_eq!(JobSpec::normalize_command("echo hi\r\n"), "echo hi");
        // Interior newlines survive, multi-line commands are allowed.
        assert_eq!(JobSpec::normalize_command("a\nb\n"), "a\nb");
    }
}
