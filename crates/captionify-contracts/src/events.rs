use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only `events.jsonl` sink shared by one engine session.
///
/// Every line carries `type`, `session_id`, `seq` and `ts`; the caller's
/// payload is merged on top. Clones write to the same file and share the
/// sequence counter.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    session_id: String,
    sink: Mutex<Sink>,
}

#[derive(Debug)]
struct Sink {
    file: File,
    next_seq: u64,
}

impl EventWriter {
    pub fn open(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed opening {}", path.display()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                session_id: session_id.into(),
                sink: Mutex::new(Sink { file, next_seq: 1 }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        let mut sink = self
            .shared
            .sink
            .lock()
            .map_err(|_| anyhow!("event sink lock poisoned"))?;

        let mut event = Map::new();
        event.insert("type".into(), event_type.into());
        event.insert("session_id".into(), self.shared.session_id.as_str().into());
        event.insert("seq".into(), sink.next_seq.into());
        event.insert(
            "ts".into(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .into(),
        );
        event.extend(payload);

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        sink.file
            .write_all(&line)
            .with_context(|| format!("failed appending to {}", self.shared.path.display()))?;
        sink.next_seq += 1;
        Ok(Value::Object(event))
    }
}

/// Parses every non-blank line of an `events.jsonl` file.
pub fn read_events(path: &Path) -> Result<Vec<Value>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{} is not valid JSON", path.display(), index + 1))
        })
        .collect()
}

/// Builds an [`EventPayload`] from `key => value` pairs.
#[macro_export]
macro_rules! event_payload {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut payload = $crate::events::EventPayload::new();
        $(payload.insert($key.to_string(), $crate::__serde_json::json!($value));)*
        payload
    }};
}
