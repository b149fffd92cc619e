use log::warn;
use skirmish_core::{Event, EventSink};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create journal directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to journal file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run journal: every event in `journal.jsonl`, step events also in
/// `steps/<step>.jsonl`.
#[derive(Debug)]
pub struct JsonlEventLog {
    pub root: PathBuf,
    pub journal_file: PathBuf,
    pub step_dir: PathBuf,
    writer: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let journal_file = root.join("journal.jsonl");
        let step_dir = root.join("steps");
        Self {
            root,
            journal_file,
            step_dir,
            writer: Mutex::new(()),
        }
    }

    pub fn ensure_layout(&self) -> Result<(), EventLogError> {
        fs::create_dir_all(&self.root).map_err(|source| EventLogError::CreateDir {
            path: self.root.clone(),
            source,
        })?;
        fs::create_dir_all(&self.step_dir).map_err(|source| EventLogError::CreateDir {
            path: self.step_dir.clone(),
            source,
        })?;
        Ok(())
    }

    fn append_journal(&self, event: &Event) -> Result<(), EventLogError> {
        append_json_line(&self.journal_file, event)
    }

    fn append_step(&self, event: &Event) -> Result<(), EventLogError> {
        if let Some(step) = &event.step {
            append_json_line(&self.step_log_path(step), event)?;
        }
        Ok(())
    }

    /// Serialised across threads so lines from concurrent minions never mix.
    pub fn append_both(&self, event: &Event) -> Result<(), EventLogError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_layout()?;
        self.append_journal(event)?;
        self.append_step(event)?;
        Ok(())
    }

    pub fn step_log_path(&self, step: &str) -> PathBuf {
        self.step_dir
            .join(format!("{}.jsonl", sanitize_for_file_name(step)))
    }

    pub fn journal_path(&self) -> &Path {
        self.journal_file.as_path()
    }
}

impl EventSink for JsonlEventLog {
    fn record(&self, event: Event) {
        if let Err(err) = self.append_both(&event) {
            warn!("failed to journal event {}: {err}", event.id);
        }
    }
}

fn sanitize_for_file_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "step".to_string()
    } else {
        out
    }
}

fn append_json_line(path: &Path, event: &Event) -> Result<(), EventLogError> {
    let mut line =
        serde_json::to_string(event).map_err(|source| EventLogError::Serialize { source })?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(line.as_bytes())
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skirmish_core::{ActionOutcome, EventKind, Mode, ResourceAction};
    use std::sync::Arc;
    use std::thread;

    fn mk_event(step: Option<&str>) -> Event {
        Event::now(
            step,
            EventKind::Resource {
                operation: "instance".to_string(),
                action: ResourceAction::Stop,
                target: "web-1".to_string(),
                project: "prod".to_string(),
                zone: Some("us-east1-b".to_string()),
                mode: Mode::Repairable,
                outcome: ActionOutcome::Applied,
            },
        )
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .expect("read journal")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn append_both_writes_journal_and_step_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JsonlEventLog::new(dir.path().join("journal"));

        log.append_both(&mk_event(Some("stop web/tier")))
            .expect("append step event");
        log.append_both(&mk_event(None)).expect("append run event");

        assert_eq!(read_lines(log.journal_path()).len(), 2);
        let step_path = log.step_log_path("stop web/tier");
        assert!(step_path.ends_with("steps/stop_web_tier.jsonl"));
        let step_lines = read_lines(&step_path);
        assert_eq!(step_lines.len(), 1);

        let decoded: Event = serde_json::from_str(&step_lines[0]).expect("decode line");
        assert_eq!(decoded.step.as_deref(), Some("stop web/tier"));
    }

    #[test]
    fn concurrent_records_stay_line_delimited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(JsonlEventLog::new(dir.path()));

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..25 {
                        log.record(mk_event(Some("burst")));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let lines = read_lines(log.journal_path());
        assert_eq!(lines.len(), 100);
        for line in lines {
            serde_json::from_str::<Event>(&line).expect("each line is one event");
        }
    }

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize_for_file_name("a/b c"), "a_b_c");
        assert_eq!(sanitize_for_file_name(""), "step");
    }
}
