use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// Where finished analyses land. Publishing happens after the job record
/// is already marked succeeded; a sink failure is logged, not fatal.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, job_id: Uuid, template: &str, text: &str) -> anyhow::Result<()>;
}

/// Appends each analysis to `<dir>/<template>.md`, newest last. Appending
/// keeps the full history of a template in one reviewable file.
pub struct ArtifactSink {
    dir: PathBuf,
}

impl ArtifactSink {
    pub fn new(dir: PathBuf) -> Self {
        ArtifactSink { dir }
    }
}

#[async_trait]
impl ResultSink for ArtifactSink {
    async fn publish(&self, job_id: Uuid, template: &str, text: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{template}.md"));
        let is_new = !path.exists();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if is_new {
            writeln!(file, "# {template} analyses")?;
        }
        writeln!(
            file,
            "\n---\n\n## {} [job {}]\n\n{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            job_id,
            text.trim_end()
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_entries_in_arrival_order() {
        let tmp = TempDir::new().unwrap();
        let sink = ArtifactSink::new(tmp.path().join("artifacts"));

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        sink.publish(first, "state", "first analysis").await.unwrap();
        sink.publish(second, "state", "second analysis").await.unwrap();

        let content = std::fs::read_to_string(tmp.path().join("artifacts/state.md")).unwrap();
        assert!(content.starts_with("# state analyses\n"));
        assert_eq!(content.matches("# state analyses").count(), 1);

        let a = content.find("first analysis").unwrap();
        let b = content.find("second analysis").unwrap();
        assert!(a < b);
        assert!(content.contains(&first.to_string()));
        assert!(content.contains(&second.to_string()));
    }

    #[tokio::test]
    async fn templates_get_separate_files() {
        let tmp = TempDir::new().unwrap();
        let sink = ArtifactSink::new(tmp.path().to_path_buf());

        sink.publish(Uuid::new_v4(), "state", "s").await.unwrap();
        sink.publish(Uuid::new_v4(), "insights", "i").await.unwrap();

        assert!(tmp.path().join("state.md").exists());
        assert!(tmp.path().join("insights.md").exists());
    }

    #[tokio::test]
    async fn unwritable_destination_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("occupied");
        std::fs::write(&blocker, "a file, not a directory").unwrap();

        let sink = ArtifactSink::new(blocker);
        assert!(sink.publish(Uuid::new_v4(), "state", "x").await.is_err());
    }
}
