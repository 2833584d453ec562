use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AuditEvent, Ingestor, Position, SharedPosition, SourceLabels, StartedIngestor};
use crate::util::{Error, metrics};

/// How often the tail re-checks the file after reaching EOF. Each tick also
/// re-stats the path so a rotation during idle is noticed.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tails a local audit log written one JSON event per line.
///
/// Rotation is detected by inode comparison; on platforms without inodes the
/// reported inode is 0 and detection degrades to file-not-found only.
pub struct FileIngestor {
    path: PathBuf,
    labels: SourceLabels,
    position: SharedPosition,
}

impl FileIngestor {
    pub fn new(path: &str, labels: SourceLabels, resume: Position) -> Self {
        FileIngestor {
            path: PathBuf::from(path),
            labels,
            position: Arc::new(Mutex::new(resume)),
        }
    }

    async fn run(
        self,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> Result<(), Error> {
        'reopen: loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let file = match File::open(&self.path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Not rotated into place yet; wait and retry.
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(POLL_INTERVAL) => continue 'reopen,
                    }
                }
                Err(e) => return Err(e.into()),
            };
            let meta = file.metadata().await?;
            let current_inode = inode_of(&meta);

            let mut offset = {
                let mut pos = self.position.lock().expect("position poisoned");
                if pos.inode != current_inode {
                    // Different file behind the same path: start over.
                    pos.inode = current_inode;
                    pos.file_offset = 0;
                } else if pos.file_offset > meta.len() {
                    // Truncated in place without an inode change.
                    pos.file_offset = 0;
                }
                pos.file_offset
            };

            let mut reader = BufReader::new(file);
            reader.seek(SeekFrom::Start(offset)).await?;
            let mut line = String::new();

            loop {
                line.clear();
                let n = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    read = reader.read_line(&mut line) => read?,
                };

                if n == 0 || !line.ends_with('\n') {
                    // EOF, possibly mid-line while the writer is still
                    // appending. Rewind to the last complete event and poll.
                    if n > 0 {
                        reader.seek(SeekFrom::Start(offset)).await?;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                    match tokio::fs::metadata(&self.path).await {
                        Ok(m) if inode_of(&m) == current_inode => continue,
                        // Rotated or removed while idle.
                        _ => continue 'reopen,
                    }
                }

                offset += n as u64;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    self.commit(offset, None);
                    continue;
                }
                match serde_json::from_str::<AuditEvent>(trimmed) {
                    Ok(event) => {
                        let timestamp = event.stage_timestamp.clone();
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            sent = tx.send(event) => {
                                if sent.is_err() {
                                    // Pipeline is gone; nothing left to feed.
                                    return Ok(());
                                }
                            }
                        }
                        self.commit(offset, timestamp);
                    }
                    Err(e) => {
                        metrics::parse_error(&self.labels.name, &self.labels.namespace);
                        eprintln!(
                            "⚠️ {}/{} skipping unparseable audit line at offset {}: {}",
                            self.labels.namespace, self.labels.name, offset, e
                        );
                        self.commit(offset, None);
                    }
                }
            }
        }
    }

    fn commit(&self, offset: u64, timestamp: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>) {
        let mut pos = self.position.lock().expect("position poisoned");
        pos.file_offset = offset;
        if timestamp.is_some() {
            pos.last_timestamp = timestamp;
        }
    }
}

impl Ingestor for FileIngestor {
    fn start(
        self: Box<Self>,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> StartedIngestor {
        let position = self.position.clone();
        let task = tokio::spawn(async move { self.run(cancel, tx).await });
        StartedIngestor { task, position }
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn event_line(audit_id: &str, verb: &str) -> String {
        format!(
            r#"{{"auditID":"{audit_id}","verb":"{verb}","user":{{"username":"alice"}},"objectRef":{{"resource":"pods","namespace":"dev"}},"requestURI":"/api/v1/pods"}}"#
        )
    }

    fn labels() -> SourceLabels {
        SourceLabels {
            name: "test".into(),
            namespace: "default".into(),
        }
    }

    async fn collect(
        path: &std::path::Path,
        resume: Position,
        expected: usize,
    ) -> (Vec<AuditEvent>, Position) {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let ingestor = Box::new(FileIngestor::new(
            path.to_str().unwrap(),
            labels(),
            resume,
        ));
        let started = ingestor.start(cancel.clone(), tx);
        let mut events = Vec::new();
        for _ in 0..expected {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed early");
            events.push(event);
        }
        cancel.cancel();
        started.task.await.unwrap().unwrap();
        let position = started.position.lock().unwrap().clone();
        (events, position)
    }

    #[tokio::test]
    async fn tails_complete_lines_and_skips_garbage() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "{}", event_line("id-1", "get")).unwrap();
        writeln!(tmp, "this is not json").unwrap();
        writeln!(tmp, "{}", event_line("id-2", "list")).unwrap();
        tmp.flush().unwrap();

        let (events, position) = collect(tmp.path(), Position::default(), 2).await;
        assert_eq!(events[0].audit_id, "id-1");
        assert_eq!(events[1].audit_id, "id-2");
        let file_len = std::fs::metadata(tmp.path()).unwrap().len();
        assert_eq!(position.file_offset, file_len);
        assert_ne!(position.inode, 0);
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_without_replaying() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        for i in 0..5 {
            writeln!(tmp, "{}", event_line(&format!("first-{i}"), "get")).unwrap();
        }
        tmp.flush().unwrap();

        let (first, checkpoint) = collect(tmp.path(), Position::default(), 5).await;
        assert_eq!(first.len(), 5);

        // Restart from the persisted position; only appended events arrive.
        writeln!(tmp, "{}", event_line("second-0", "watch")).unwrap();
        writeln!(tmp, "{}", event_line("second-1", "watch")).unwrap();
        tmp.flush().unwrap();

        let (second, _) = collect(tmp.path(), checkpoint, 2).await;
        assert_eq!(second[0].audit_id, "second-0");
        assert_eq!(second[1].audit_id, "second-1");
    }

    #[tokio::test]
    async fn inode_mismatch_rewinds_to_start() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "{}", event_line("only", "get")).unwrap();
        tmp.flush().unwrap();

        let stale = Position {
            file_offset: 9_999,
            inode: 1, // guaranteed not to match the temp file
            ..Default::default()
        };
        let (events, position) = collect(tmp.path(), stale, 1).await;
        assert_eq!(events[0].audit_id, "only");
        assert_ne!(position.inode, 1);
    }
}
