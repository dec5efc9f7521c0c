use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{PipelineError, Result};

/// Discovery metadata for one session transcript on disk. The transcript
/// itself is re-read on every use; only location and freshness live here.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub id: String,
    /// Original project path decoded from the flattened directory name,
    /// when the directory follows the `-seg-seg-seg` convention.
    pub project_path: Option<String>,
    pub file_path: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl SessionMeta {
    fn matches_project(&self, needle_lower: &str) -> bool {
        if let Some(project) = &self.project_path
            && project.to_lowercase().contains(needle_lower)
        {
            return true;
        }
        self.file_path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_lowercase().contains(needle_lower))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct SessionFilter {
    /// Case-insensitive substring matched against the project path.
    pub project: Option<String>,
    /// Only sessions touched within this many days; zero disables the cut.
    pub days: i64,
    /// Zero means unlimited.
    pub limit: usize,
}

impl Default for SessionFilter {
    fn default() -> Self {
        SessionFilter {
            project: None,
            days: 30,
            limit: 20,
        }
    }
}

/// Read-only view over the assistant's session log tree. The expected
/// layout is `<root>/<flattened-project>/<session-id>.jsonl`, but lookup
/// recurses so deeper nesting still resolves.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: PathBuf) -> Self {
        SessionStore { root }
    }

    /// Resolves a session id to exactly one transcript file.
    pub fn resolve(&self, id: &str, project: Option<&str>) -> Result<SessionMeta> {
        if !valid_session_id(id) {
            return Err(PipelineError::SessionNotFound(id.to_string()));
        }

        let pattern = self.root.join("**").join(format!("{id}.jsonl"));
        let mut matches: Vec<SessionMeta> = glob_paths(&pattern)?
            .iter()
            .filter_map(|path| self.meta_for(path))
            .collect();

        if let Some(project) = project {
            let needle = project.to_lowercase();
            matches.retain(|m| m.matches_project(&needle));
        }

        if matches.len() > 1 {
            return Err(PipelineError::AmbiguousSession {
                id: id.to_string(),
                count: matches.len(),
            });
        }
        matches
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::SessionNotFound(id.to_string()))
    }

    /// Lists known sessions, newest first.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionMeta>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = self.root.join("**").join("*.jsonl");
        let mut sessions: Vec<SessionMeta> = glob_paths(&pattern)?
            .iter()
            .filter_map(|path| self.meta_for(path))
            .collect();

        if filter.days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(filter.days);
            sessions.retain(|s| s.modified_at >= cutoff);
        }
        if let Some(project) = &filter.project {
            let needle = project.to_lowercase();
            sessions.retain(|s| s.matches_project(&needle));
        }

        sessions.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        if filter.limit > 0 {
            sessions.truncate(filter.limit);
        }
        Ok(sessions)
    }

    fn meta_for(&self, path: &Path) -> Option<SessionMeta> {
        let id = path.file_stem()?.to_string_lossy().into_owned();
        let stat = match std::fs::metadata(path) {
            Ok(stat) => stat,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "skipping unreadable session file");
                return None;
            }
        };
        let modified_at = stat
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let project_path = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| decode_project_dir(&name.to_string_lossy()));

        Some(SessionMeta {
            id,
            project_path,
            file_path: path.to_path_buf(),
            modified_at,
            size_bytes: stat.len(),
        })
    }
}

/// Session ids are interpolated into a filesystem glob, so only the
/// characters that actually occur in session ids are allowed through.
fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>> {
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern)
        .map_err(|e| PipelineError::Config(format!("invalid session glob {pattern:?}: {e}")))?;

    Ok(entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(%err, "skipping unreadable path during session scan");
                None
            }
        })
        .collect())
}

/// Session directories flatten the project path by replacing separators
/// with dashes and keeping a leading dash, e.g. `-Users-alice-work-api`
/// for `/Users/alice/work/api`.
fn decode_project_dir(name: &str) -> Option<String> {
    let rest = name.strip_prefix('-')?;
    if rest.is_empty() {
        return None;
    }
    Some(format!("/{}", rest.split('-').collect::<Vec<_>>().join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(root: &Path, project_dir: &str, session: &str) -> PathBuf {
        let dir = root.join(project_dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{session}.jsonl"));
        std::fs::write(&path, r#"{"type":"user","message":{"content":"hi"}}"#).unwrap();
        path
    }

    #[test]
    fn resolves_a_unique_session_and_decodes_the_project() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "-Users-alice-work-api", "sess-1111");

        let store = SessionStore::new(tmp.path().to_path_buf());
        let meta = store.resolve("sess-1111", None).unwrap();

        assert_eq!(meta.id, "sess-1111");
        assert_eq!(meta.project_path.as_deref(), Some("/Users/alice/work/api"));
        assert!(meta.size_bytes > 0);
    }

    #[test]
    fn unknown_session_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());

        let err = store.resolve("missing", None).unwrap_err();
        assert!(matches!(err, PipelineError::SessionNotFound(_)));
    }

    #[test]
    fn duplicate_ids_need_a_project_filter() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "-home-alice-api", "sess-dup");
        seed(tmp.path(), "-home-alice-web", "sess-dup");

        let store = SessionStore::new(tmp.path().to_path_buf());

        let err = store.resolve("sess-dup", None).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::AmbiguousSession { count: 2, .. }
        ));

        let meta = store.resolve("sess-dup", Some("web")).unwrap();
        assert_eq!(meta.project_path.as_deref(), Some("/home/alice/web"));
    }

    #[test]
    fn ids_with_path_separators_never_reach_the_filesystem() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());

        for id in ["../../../etc/passwd", "a/b", "*", "", "a b"] {
            let err = store.resolve(id, None).unwrap_err();
            assert!(matches!(err, PipelineError::SessionNotFound(_)), "id {id:?}");
        }
    }

    #[test]
    fn list_is_newest_first_and_respects_the_limit() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "-home-alice-api", "sess-old");
        std::thread::sleep(std::time::Duration::from_millis(25));
        seed(tmp.path(), "-home-alice-api", "sess-mid");
        std::thread::sleep(std::time::Duration::from_millis(25));
        seed(tmp.path(), "-home-alice-web", "sess-new");

        let store = SessionStore::new(tmp.path().to_path_buf());
        let all = store.list(&SessionFilter::default()).unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["sess-new", "sess-mid", "sess-old"]);

        let limited = store
            .list(&SessionFilter {
                limit: 2,
                ..SessionFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, "sess-new");
    }

    #[test]
    fn list_filters_by_project_substring() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "-home-alice-api", "sess-a");
        seed(tmp.path(), "-home-alice-web", "sess-b");

        let store = SessionStore::new(tmp.path().to_path_buf());
        let hits = store
            .list(&SessionFilter {
                project: Some("API".into()),
                ..SessionFilter::default()
            })
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "sess-a");
    }

    #[test]
    fn missing_root_lists_nothing() {
        let store = SessionStore::new(PathBuf::from("/nonexistent/debrief-sessions"));
        assert!(store.list(&SessionFilter::default()).unwrap().is_empty());
    }
}
