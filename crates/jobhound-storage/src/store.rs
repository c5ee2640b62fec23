use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Context;
use jobhound_core::JobRecord;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::ledger::Ledger;
use crate::validate::{sanitize_record, validate_record};

/// Append-only JSON Lines record store. One line is one [`JobRecord`].
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LedgerLoad {
    pub ledger: Ledger,
    pub lines_read: usize,
    pub skipped_lines: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistReport {
    pub saved: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub failed: usize,
}

impl PersistReport {
    pub fn skipped(&self) -> usize {
        self.duplicates + self.invalid + self.failed
    }
}

#[derive(Deserialize)]
struct StoredId {
    #[serde(default)]
    job_id: Option<String>,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild the ledger by scanning every stored line. A missing store is an empty ledger.
    pub async fn load_ledger(&self) -> anyhow::Result<LedgerLoad> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking record store {}", self.path.display()))?
        {
            return Ok(LedgerLoad {
                ledger: Ledger::new(),
                lines_read: 0,
                skipped_lines: 0,
            });
        }

        let file = fs::File::open(&self.path)
            .await
            .with_context(|| format!("opening record store {}", self.path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let mut ids = Vec::new();
        let mut lines_read = 0usize;
        let mut skipped_lines = 0usize;
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("reading record store {}", self.path.display()))?
        {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            lines_read += 1;
            match serde_json::from_str::<StoredId>(line) {
                Ok(StoredId {
                    job_id: Some(job_id),
                }) if !job_id.trim().is_empty() => ids.push(job_id),
                Ok(_) => skipped_lines += 1,
                Err(err) => {
                    debug!(line = lines_read, %err, "skipping unparseable store line");
                    skipped_lines += 1;
                }
            }
        }

        if skipped_lines > 0 {
            warn!(
                path = %self.path.display(),
                skipped_lines,
                "record store contains lines without a usable job_id"
            );
        }

        Ok(LedgerLoad {
            ledger: Ledger::from_ids(ids),
            lines_read,
            skipped_lines,
        })
    }

    async fn open_append(&self) -> anyhow::Result<fs::File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening record store {} for append", self.path.display()))?;
        if ends_mid_line(&self.path).await? {
            warn!(path = %self.path.display(), "record store ends with a partial line; starting a new one");
            file.write_all(b"\n")
                .await
                .context("terminating partial store line")?;
        }
        Ok(file)
    }

    /// Sanitize, validate, dedup and append `records`.
    ///
    /// Every record is attempted independently: invalid records, duplicates and write
    /// failures are counted, never propagated. A `job_id` enters the ledger only after its
    /// line has been written and flushed.
    pub async fn persist(
        &self,
        records: impl IntoIterator<Item = JobRecord>,
        ledger: &mut Ledger,
    ) -> PersistReport {
        let mut report = PersistReport::default();
        let mut file = match self.open_append().await {
            Ok(file) => Some(file),
            Err(err) => {
                error!(error = %format!("{err:#}"), "record store unavailable; batch will not be written");
                None
            }
        };

        for record in records {
            let record = sanitize_record(record);
            if let Err(errors) = validate_record(&record) {
                warn!(
                    job_id = %record.job_id,
                    source = %record.source,
                    ?errors,
                    "dropping invalid record"
                );
                report.invalid += 1;
                continue;
            }
            if ledger.contains(&record.job_id) {
                report.duplicates += 1;
                continue;
            }
            let Some(file) = file.as_mut() else {
                report.failed += 1;
                continue;
            };
            match write_line(file, &record).await {
                Ok(()) => {
                    ledger.insert(record.job_id);
                    report.saved += 1;
                }
                Err(err) => {
                    warn!(job_id = %record.job_id, error = %format!("{err:#}"), "failed to append record");
                    report.failed += 1;
                }
            }
        }

        info!(
            path = %self.path.display(),
            saved = report.saved,
            duplicates = report.duplicates,
            invalid = report.invalid,
            failed = report.failed,
            "persisted batch"
        );
        report
    }
}

async fn ends_mid_line(path: &Path) -> anyhow::Result<bool> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("opening record store {}", path.display()))?;
    if file.metadata().await.context("reading store metadata")?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await.context("seeking to store end")?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await.context("reading store tail")?;
    Ok(last[0] != b'\n')
}

/// Append one line. A failed write is truncated away so the next line starts clean.
async fn write_line(file: &mut fs::File, record: &JobRecord) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(record).context("serializing job record")?;
    line.push('\n');
    let start = file.metadata().await.context("reading store metadata")?.len();
    let written = match file.write_all(line.as_bytes()).await {
        Ok(()) => file.flush().await,
        Err(err) => Err(err),
    };
    if let Err(err) = written {
        if let Err(truncate_err) = file.set_len(start).await {
            warn!(error = %truncate_err, "could not drop partial store line");
        }
        return Err(err).context("writing job record line");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobhound_core::{SourceType, DEFAULT_CATEGORY};
    use tempfile::tempdir;

    fn mk_record(job_id: &str, link: &str) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            job_id: job_id.to_string(),
            title: format!("Job {job_id}"),
            description: "Budget: $500".into(),
            link: link.to_string(),
            budget: Some("500".into()),
            proposals: None,
            client_country: None,
            category: DEFAULT_CATEGORY.into(),
            source: "Test Board".into(),
            source_type: SourceType::Rss,
            created_at: now,
            crawled_at: now,
            skills: Vec::new(),
            keyword: None,
        }
    }

    #[tokio::test]
    async fn second_persist_of_same_batch_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path().join("data/raw_jobs.jsonl"));
        let batch = vec![
            mk_record("aaaaaaaaaaaa", "https://example.com/job/1"),
            mk_record("bbbbbbbbbbbb", "https://example.com/job/2"),
        ];

        let mut ledger = store.load_ledger().await.expect("load").ledger;
        let first = store.persist(batch.clone(), &mut ledger).await;
        assert_eq!(first.saved, 2);

        let mut reloaded = store.load_ledger().await.expect("reload").ledger;
        assert_eq!(reloaded.len(), 2);
        let second = store.persist(batch, &mut reloaded).await;
        assert_eq!(second.saved, 0);
        assert_eq!(second.duplicates, 2);

        let text = std::fs::read_to_string(store.path()).expect("read store");
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn invalid_link_is_counted_not_written() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path().join("raw_jobs.jsonl"));
        let mut ledger = Ledger::new();

        let report = store
            .persist(
                vec![
                    mk_record("aaaaaaaaaaaa", "not-a-url"),
                    mk_record("bbbbbbbbbbbb", "https://example.com/job/1"),
                ],
                &mut ledger,
            )
            .await;

        assert_eq!(report.saved, 1);
        assert_eq!(report.invalid, 1);
        assert!(ledger.contains("bbbbbbbbbbbb"));
        assert!(!ledger.contains("aaaaaaaaaaaa"));

        let text = std::fs::read_to_string(store.path()).expect("read store");
        let line: JobRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(line.link, "https://example.com/job/1");
    }

    #[tokio::test]
    async fn duplicate_ids_within_one_batch_are_written_once() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::new(dir.path().join("raw_jobs.jsonl"));
        let mut ledger = Ledger::new();
        let report = store
            .persist(
                vec![
                    mk_record("cccccccccccc", "https://example.com/job/3"),
                    mk_record("cccccccccccc", "https://example.com/job/3"),
                ],
                &mut ledger,
            )
            .await;
        assert_eq!(report, PersistReport { saved: 1, duplicates: 1, invalid: 0, failed: 0 });
    }

    #[tokio::test]
    async fn unwritable_store_counts_failures_and_leaves_ledger_alone() {
        let dir = tempdir().expect("tempdir");
        // The store path is a directory, so opening it for append fails.
        let store = JobStore::new(dir.path());
        let mut ledger = Ledger::new();
        let report = store
            .persist(vec![mk_record("dddddddddddd", "https://example.com/job/4")], &mut ledger)
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped(), 1);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn ledger_load_skips_garbage_lines() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("raw_jobs.jsonl");
        std::fs::write(
            &path,
            "{\"job_id\":\"111111111111\",\"title\":\"a\"}\nnot json\n\n{\"title\":\"no id\"}\n{\"job_id\":\"222222222222\"}\n",
        )
        .expect("seed store");

        let load = JobStore::new(&path).load_ledger().await.expect("load");
        assert_eq!(load.lines_read, 4);
        assert_eq!(load.skipped_lines, 2);
        assert!(load.ledger.contains("111111111111"));
        assert!(load.ledger.contains("222222222222"));
    }

    #[tokio::test]
    async fn partial_trailing_line_does_not_swallow_the_next_record() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("raw_jobs.jsonl");
        std::fs::write(&path, "{\"job_id\":\"111111111111\"}\n{\"job_id\":\"2222").expect("seed store");
        let store = JobStore::new(&path);

        let mut ledger = store.load_ledger().await.expect("load").ledger;
        let report = store
            .persist(vec![mk_record("eeeeeeeeeeee", "https://example.com/job/5")], &mut ledger)
            .await;
        assert_eq!(report.saved, 1);

        let load = store.load_ledger().await.expect("reload");
        assert_eq!(load.lines_read, 3);
        assert_eq!(load.skipped_lines, 1);
        assert!(load.ledger.contains("111111111111"));
        assert!(load.ledger.contains("eeeeeeeeeeee"));
    }

    #[tokio::test]
    async fn missing_store_is_an_empty_ledger() {
        let dir = tempdir().expect("tempdir");
        let load = JobStore::new(dir.path().join("absent.jsonl"))
            .load_ledger()
            .await
            .expect("load");
        assert!(load.ledger.is_empty());
        assert_eq!(load.lines_read, 0);
    }
}
