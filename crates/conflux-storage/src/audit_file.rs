use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use conflux_core::{
    audit::{paginate, stamp, AuditFilter, AuditLog, AuditRecord},
    model::{Page, PageRequest},
    CoreError, CoreResult,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Append-only JSON-lines audit log. Each append is `fsync`ed before it returns,
/// so a successful append is durable.
///
/// Records are also indexed in memory for export queries; the file is the source
/// of truth and is replayed on open. A record is complete only once its newline
/// is written; an incomplete tail is cut off on open and after a failed write,
/// so later appends always start on a fresh line.
pub struct FileAuditLog {
    path: PathBuf,
    records: Mutex<Vec<AuditRecord>>,
}

impl FileAuditLog {
    pub async fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let records = replay(&path)?;
        debug!(path = %path.display(), records = records.len(), "audit log opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn audit_err<E: ToString>(err: E) -> CoreError {
    CoreError::Audit {
        reason: err.to_string(),
    }
}

fn replay(path: &Path) -> CoreResult<Vec<AuditRecord>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(audit_err(err)),
    };
    let complete = raw.iter().rposition(|b| *b == b'\n').map_or(0, |idx| idx + 1);
    if complete < raw.len() {
        // The append never finished, so nothing depended on it.
        warn!(
            path = %path.display(),
            bytes = raw.len() - complete,
            "truncating torn audit tail"
        );
        truncate(path, complete as u64).map_err(audit_err)?;
    }

    let mut records = Vec::new();
    for (lineno, line) in raw[..complete].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record = serde_json::from_slice::<AuditRecord>(line).map_err(|err| {
            audit_err(format!("corrupt audit record at line {}: {err}", lineno + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

fn truncate(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_data()
}

/// Write one complete line. No await point separates the start of the write from
/// its end, and a failed write is cut back to the previous length.
fn write_line(path: &Path, line: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    if let Err(err) = file.write_all(line) {
        if let Err(cut) = file.set_len(len) {
            warn!(error = %cut, "failed to cut back partial audit line");
        }
        return Err(err);
    }
    file.sync_data()
}

#[async_trait]
impl AuditLog for FileAuditLog {
    #[instrument(skip_all, fields(action = %record.action, resource = %record.resource_path))]
    async fn append(&self, mut record: AuditRecord) -> CoreResult<u64> {
        // Held across the write so file order matches sequence order.
        let mut records = self.records.lock().await;
        stamp(&mut record, records.last());

        let mut line = serde_json::to_vec(&record).map_err(audit_err)?;
        line.push(b'\n');
        write_line(&self.path, &line).map_err(audit_err)?;

        let seq = record.seq;
        records.push(record);
        Ok(seq)
    }

    async fn query(&self, filter: &AuditFilter, page: &PageRequest) -> CoreResult<Page<AuditRecord>> {
        let records = self.records.lock().await;
        paginate(&records, filter, page)
    }
}
