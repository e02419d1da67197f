use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::store::{ArchiveMetadata, DateFilter, Record, DEFAULT_SOURCE};

/// What an export knows before the first record is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportHeader {
    /// Number of records that will follow.
    pub total_count: u64,
    /// Stored metadata, or defaults when no run ever completed.
    pub metadata: ArchiveMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub exported: usize,
    /// Ids present in the membership set whose record hash was missing.
    pub orphaned: usize,
}

/// Destination of [`RecordStore::export_all`](crate::store::RecordStore::export_all).
///
/// Called as `begin`, then `write_record` once per record in export order, then `finish`.
pub trait ExportSink {
    fn begin(&mut self, header: &ExportHeader) -> Result<()>;
    fn write_record(&mut self, record: &Record) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Collects the export in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub header: Option<ExportHeader>,
    pub records: Vec<Record>,
    pub finished: bool,
}

impl ExportSink for VecSink {
    fn begin(&mut self, header: &ExportHeader) -> Result<()> {
        self.header = Some(header.clone());
        Ok(())
    }

    fn write_record(&mut self, record: &Record) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentHeader<'a> {
    export_date: String,
    source: &'a str,
    api_url: &'a str,
    date_filter: &'a DateFilter,
    total_count: u64,
    page_count: u64,
}

/// Writes the archive document to a file, one record per line inside `models`.
///
/// ```text
/// {"exportDate":..,"source":..,"apiUrl":..,"dateFilter":{..},"totalCount":..,"pageCount":..,
/// "models":[
/// {"id":..},
/// ...
/// ]}
/// ```
pub struct JsonFileSink {
    path: PathBuf,
    default_api_url: String,
    writer: BufWriter<File>,
    written: u64,
}

impl JsonFileSink {
    pub fn create(path: impl AsRef<Path>, default_api_url: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("Failed to create export file {}", path.display()))?;
        Ok(Self {
            path,
            default_api_url: default_api_url.into(),
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_err(&self) -> String {
        format!("Failed to write export file {}", self.path.display())
    }
}

impl ExportSink for JsonFileSink {
    fn begin(&mut self, header: &ExportHeader) -> Result<()> {
        let meta = &header.metadata;
        let document = DocumentHeader {
            export_date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            source: meta.source.as_deref().unwrap_or(DEFAULT_SOURCE),
            api_url: meta.api_url.as_deref().unwrap_or(self.default_api_url.as_str()),
            date_filter: &meta.date_filter,
            total_count: header.total_count,
            page_count: meta.page_count.unwrap_or(0),
        };
        let mut json = serde_json::to_string(&document).context("Failed to serialize header")?;
        // Reopen the object so the models array can be streamed after the header fields
        json.pop();
        write!(self.writer, "{json},\n\"models\":[").with_context(|| self.write_err())
    }

    fn write_record(&mut self, record: &Record) -> Result<()> {
        let separator = if self.written == 0 { "\n" } else { ",\n" };
        let json = serde_json::to_string(record).context("Failed to serialize record")?;
        write!(self.writer, "{separator}{json}").with_context(|| self.write_err())?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        writeln!(self.writer, "\n]}}").with_context(|| self.write_err())?;
        self.writer.flush().with_context(|| self.write_err())
    }
}
