//! Recommendation sources beyond the per-certificate API
//!
//! Yearly backfills come from a ZIP archive containing a CSV export of all
//! recommendations lodged that year. The archive can be a local file or an
//! HTTP(S) URL.

use futures::StreamExt;
use serde_json::{Map, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::client::{FetchError, RetryPolicy};
use epc_common::types::Kind;

/// Timeout for a whole archive download
pub const DEFAULT_ARCHIVE_TIMEOUT_SECS: u64 = 600;

/// Rows handed to the landing writer at a time
pub const DEFAULT_ARCHIVE_CHUNK_ROWS: usize = 5_000;

/// Parsed chunks buffered between the CSV reader and the landing writer
const ARCHIVE_CHANNEL_CHUNKS: usize = 2;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive not found: {0}")]
    NotFound(String),

    #[error("Failed to read archive {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to download archive: {0}")]
    Download(#[from] FetchError),

    #[error("Invalid ZIP archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("No CSV member in archive")]
    NoCsv,

    #[error("Invalid CSV in archive member {member}: {source}")]
    Csv {
        member: String,
        #[source]
        source: csv::Error,
    },

    #[error("Archive parsing task failed: {0}")]
    Task(String),
}

/// Where a yearly archive lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Local(PathBuf),
    Http(String),
}

impl ArchiveSource {
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if location.starts_with("http://") || location.starts_with("https://") {
            ArchiveSource::Http(location.to_string())
        } else {
            ArchiveSource::Local(PathBuf::from(location))
        }
    }

    /// Expand `{kind}` and `{year}` in a location template
    pub fn from_template(template: &str, kind: Kind, year: u16) -> Self {
        Self::parse(
            &template
                .replace("{kind}", kind.as_str())
                .replace("{year}", &format!("{:04}", year)),
        )
    }
}

impl std::fmt::Display for ArchiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveSource::Local(path) => write!(f, "{}", path.display()),
            ArchiveSource::Http(url) => write!(f, "{}", url),
        }
    }
}

/// An archive on local disk
///
/// Downloaded archives live in a temporary file that is removed on drop.
#[derive(Debug)]
pub enum ArchiveFile {
    Local(PathBuf),
    Downloaded(NamedTempFile),
}

impl ArchiveFile {
    pub fn path(&self) -> &Path {
        match self {
            ArchiveFile::Local(path) => path,
            ArchiveFile::Downloaded(temp) => temp.path(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArchiveFetcher {
    http: reqwest::Client,
    retry: RetryPolicy,
    chunk_rows: usize,
}

impl ArchiveFetcher {
    pub fn new(retry: RetryPolicy) -> Result<Self, ArchiveError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_ARCHIVE_TIMEOUT_SECS))
            .user_agent(concat!("epc-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::terminal(None, format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            retry,
            chunk_rows: DEFAULT_ARCHIVE_CHUNK_ROWS,
        })
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    /// Make the archive available on local disk
    ///
    /// Remote archives are streamed to a temporary file; each retry starts a
    /// fresh file.
    #[instrument(skip(self, source), fields(source = %source))]
    pub async fn fetch(&self, source: &ArchiveSource) -> Result<ArchiveFile, ArchiveError> {
        match source {
            ArchiveSource::Local(path) => match tokio::fs::metadata(path).await {
                Ok(_) => Ok(ArchiveFile::Local(path.clone())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(ArchiveError::NotFound(path.display().to_string()))
                },
                Err(source) => Err(ArchiveError::Io {
                    path: path.display().to_string(),
                    source,
                }),
            },
            ArchiveSource::Http(url) => {
                let (temp, bytes) = self
                    .retry
                    .run("archive download", |_| async move { self.download(url).await })
                    .await
                    .map_err(|e| match e {
                        FetchError::Terminal {
                            status: Some(404), ..
                        } => ArchiveError::NotFound(url.clone()),
                        other => ArchiveError::Download(other),
                    })?;
                info!(bytes, "Downloaded archive");
                Ok(ArchiveFile::Downloaded(temp))
            },
        }
    }

    async fn download(&self, url: &str) -> Result<(NamedTempFile, u64), FetchError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), &body));
        }

        let disk = |e: std::io::Error| FetchError::terminal(None, format!("failed to write archive: {}", e));
        let temp = NamedTempFile::new().map_err(disk)?;
        let mut file = tokio::fs::File::from_std(temp.as_file().try_clone().map_err(disk)?);

        let mut bytes = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(disk)?;
            bytes += chunk.len() as u64;
        }
        file.flush().await.map_err(disk)?;

        Ok((temp, bytes))
    }
}

/// Pick the CSV member: prefer one named like recommendations, else the first CSV
fn choose_member(names: &[String]) -> Option<String> {
    let csvs: Vec<&String> = names
        .iter()
        .filter(|n| n.to_lowercase().ends_with(".csv"))
        .collect();
    csvs.iter()
        .find(|n| n.to_lowercase().contains("recom"))
        .or_else(|| csvs.first())
        .map(|n| n.to_string())
}

/// Read archive rows as JSON objects keyed by CSV header, `chunk_rows` at a time
///
/// `emit` returning `false` stops the read early. Returns the number of rows
/// emitted. Invalid UTF-8 is replaced rather than rejected. Blocking; run it
/// off the async runtime.
pub fn read_archive_chunks(
    path: &Path,
    chunk_rows: usize,
    emit: impl FnMut(Vec<Value>) -> bool,
) -> Result<u64, ArchiveError> {
    let file = std::fs::File::open(path).map_err(|source| ArchiveError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(std::io::BufReader::new(file))?;
    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let member = choose_member(&names).ok_or(ArchiveError::NoCsv)?;
    debug!(member = %member, "Reading archive member");

    let reader = archive.by_name(&member)?;
    parse_csv(&member, reader, chunk_rows.max(1), emit)
}

fn parse_csv(
    member: &str,
    reader: impl Read,
    chunk_rows: usize,
    mut emit: impl FnMut(Vec<Value>) -> bool,
) -> Result<u64, ArchiveError> {
    let csv_err = |source| ArchiveError::Csv {
        member: member.to_string(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .collect();

    let mut emitted = 0u64;
    let mut chunk = Vec::with_capacity(chunk_rows);
    for record in reader.byte_records() {
        let record = record.map_err(csv_err)?;
        let mut row = Map::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            row.insert(
                header.clone(),
                Value::String(String::from_utf8_lossy(value).into_owned()),
            );
        }
        chunk.push(Value::Object(row));

        if chunk.len() == chunk_rows {
            emitted += chunk.len() as u64;
            if !emit(std::mem::replace(&mut chunk, Vec::with_capacity(chunk_rows))) {
                return Ok(emitted);
            }
        }
    }

    if !chunk.is_empty() {
        emitted += chunk.len() as u64;
        emit(chunk);
    }
    Ok(emitted)
}

/// Archive rows arriving in chunks from a blocking reader task
pub struct ArchiveRows {
    chunks: mpsc::Receiver<Vec<Value>>,
    reader: JoinHandle<Result<u64, ArchiveError>>,
}

impl ArchiveRows {
    /// Next chunk; `None` once the reader has stopped
    pub async fn next_chunk(&mut self) -> Option<Vec<Value>> {
        self.chunks.recv().await
    }

    /// Rows read in total, or the error that stopped the reader
    pub async fn finish(self) -> Result<u64, ArchiveError> {
        let Self { chunks, reader } = self;
        drop(chunks);
        reader.await.map_err(|e| ArchiveError::Task(e.to_string()))?
    }
}

/// Fetch an archive and start reading it without blocking the runtime
///
/// At most a couple of chunks are buffered ahead of the consumer. Dropping
/// the returned [`ArchiveRows`] stops the reader.
pub async fn stream_archive(
    fetcher: &ArchiveFetcher,
    source: &ArchiveSource,
) -> Result<ArchiveRows, ArchiveError> {
    let file = fetcher.fetch(source).await?;
    let chunk_rows = fetcher.chunk_rows;
    let (tx, chunks) = mpsc::channel(ARCHIVE_CHANNEL_CHUNKS);

    let reader = tokio::task::spawn_blocking(move || {
        read_archive_chunks(file.path(), chunk_rows, |chunk| tx.blocking_send(chunk).is_ok())
    });

    Ok(ArchiveRows { chunks, reader })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn zip_at(dir: &Path, members: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("archive.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        for (name, content) in members {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn read_all(path: &Path, chunk_rows: usize) -> Result<Vec<Vec<Value>>, ArchiveError> {
        let mut chunks = Vec::new();
        read_archive_chunks(path, chunk_rows, |chunk| {
            chunks.push(chunk);
            true
        })?;
        Ok(chunks)
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(
            ArchiveSource::parse("https://example.org/recs.zip"),
            ArchiveSource::Http("https://example.org/recs.zip".to_string())
        );
        assert_eq!(
            ArchiveSource::from_template("/data/{kind}-{year}.zip", Kind::NonDomestic, 2021),
            ArchiveSource::Local(PathBuf::from("/data/non-domestic-2021.zip"))
        );
    }

    #[test]
    fn test_choose_member_prefers_recommendations() {
        let names = vec![
            "certificates.csv".to_string(),
            "README.txt".to_string(),
            "Recommendations.CSV".to_string(),
        ];
        assert_eq!(choose_member(&names).unwrap(), "Recommendations.CSV");
        assert_eq!(
            choose_member(&["a.txt".to_string(), "b.csv".to_string()]).unwrap(),
            "b.csv"
        );
        assert!(choose_member(&["a.txt".to_string()]).is_none());
    }

    #[test]
    fn test_read_archive_rows() {
        let dir = tempfile::tempdir().unwrap();
        let csv = b"LMK_KEY,IMPROVEMENT_ITEM,IMPROVEMENT_SUMMARY_TEXT\nk1,1,Loft insulation\nk1,2,\"Solar, PV\"\n";
        let path = zip_at(
            dir.path(),
            &[
                ("certificates.csv", b"LMK_KEY\nx\n".as_slice()),
                ("recommendations.csv", csv.as_slice()),
            ],
        );

        let rows: Vec<Value> = read_all(&path, 100).unwrap().concat();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["LMK_KEY"], "k1");
        assert_eq!(rows[1]["IMPROVEMENT_SUMMARY_TEXT"], "Solar, PV");
    }

    #[test]
    fn test_rows_arrive_in_bounded_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let csv = b"LMK_KEY,IMPROVEMENT_ITEM\nk1,1\nk1,2\nk2,1\nk3,1\nk3,2\n";
        let path = zip_at(dir.path(), &[("recs.csv", csv.as_slice())]);

        let sizes: Vec<usize> = read_all(&path, 2).unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, [2, 2, 1]);

        // A consumer that hangs up stops the read
        let mut seen = 0;
        let emitted = read_archive_chunks(&path, 2, |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!((seen, emitted), (1, 2));
    }

    #[test]
    fn test_archive_without_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = zip_at(dir.path(), &[("notes.txt", b"hello".as_slice())]);
        assert!(matches!(read_all(&path, 10), Err(ArchiveError::NoCsv)));
    }

    #[tokio::test]
    async fn test_missing_local_archive() {
        let fetcher = ArchiveFetcher::new(RetryPolicy::default()).unwrap();
        let err = fetcher
            .fetch(&ArchiveSource::Local(PathBuf::from("/nonexistent/recs.zip")))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stream_archive_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let csv = b"LMK_KEY,IMPROVEMENT_ITEM\nk1,1\nk1,2\nk2,1\n";
        let path = zip_at(dir.path(), &[("recs.csv", csv.as_slice())]);

        let fetcher = ArchiveFetcher::new(RetryPolicy::default())
            .unwrap()
            .with_chunk_rows(2);
        let mut rows = stream_archive(&fetcher, &ArchiveSource::Local(path))
            .await
            .unwrap();

        let mut sizes = Vec::new();
        while let Some(chunk) = rows.next_chunk().await {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, [2, 1]);
        assert_eq!(rows.finish().await.unwrap(), 3);
    }
}
