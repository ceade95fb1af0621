use serde::{de::DeserializeOwned, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::{self, OpenOptions}, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

use crate::error::{CampaignError, Result};

/// Write `bytes` next to `path` and rename over it.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        let _ = f.sync_all(); // best-effort
    }
    std::fs::rename(&tmp, path)
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Replace the whole file with one JSON object per line.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut buf = Vec::new();
    for rec in records {
        serde_json::to_writer(&mut buf, rec)?;
        buf.push(b'\n');
    }
    write_atomic(path, &buf)?;
    Ok(())
}

/// Append one record to a JSON Lines file, creating it and its parent.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(&line)?;
    Ok(())
}

/// Read a JSON Lines file. Lines that fail to parse are logged and skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> std::io::Result<Vec<T>> {
    let file = std::fs::File::open(path)?;
    let mut out = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(rec) => out.push(rec),
            Err(e) => warn!(
                file = %path.display(),
                line = line_num + 1,
                "skipping malformed record: {e}"
            ),
        }
    }
    Ok(out)
}

/// Append-only JSON Lines writer shared between tasks.
#[derive(Clone)]
pub struct JsonlWriter {
    file: Arc<Mutex<tokio::fs::File>>,
}

impl JsonlWriter {
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self { file: Arc::new(Mutex::new(file)) })
    }

    pub async fn append<T: Serialize>(&self, rec: &T) -> Result<()> {
        let mut line = serde_json::to_vec(rec)?;
        line.push(b'\n');
        let mut f = self.file.lock().await;
        f.write_all(&line).await?;
        f.flush().await?;
        Ok(())
    }
}

/// Accepts a bare file name and nothing that walks out of a directory.
pub fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let p = Path::new(name);
    let mut comps = p.components();
    matches!((comps.next(), comps.next()), (Some(std::path::Component::Normal(_)), None))
}

/// Ids become path components, so they must be bare file names.
pub fn check_id<'a>(kind: &str, id: &'a str) -> Result<&'a str> {
    if is_safe_filename(id) {
        Ok(id)
    } else {
        Err(CampaignError::InvalidState(format!("invalid {kind} id: {id:?}")))
    }
}
