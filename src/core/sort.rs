// Normalization: rewrite a tabular file fully quoted and sorted by its join key.
//
// Rows are buffered into memory-bounded runs, each run is sorted and spilled to a
// scratch directory beside the target, and the runs are k-way merged into a temporary
// file that is renamed onto the derived path only once complete. When too many runs
// pile up, the oldest ones are merged into a single run first, so at most
// `max_open_runs` run files are ever open at once.
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_8};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{DEFAULT_ENCODING, TabularFormat, quoted_line};
use crate::core::reader::RowReader;
use crate::core::tokenizer::Tokenizer;

pub const SORTED_SUFFIX: &str = "-sorted";

const DEFAULT_MAX_RUN_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_OPEN_RUNS: usize = 64;
// Approximate bookkeeping cost of one buffered row beyond its text.
const ENTRY_OVERHEAD: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortOptions {
    /// Upper bound on buffered row text per run before it is spilled to disk.
    pub max_run_bytes: usize,
    /// Most run files merged at once; values below 2 are treated as 2.
    pub max_open_runs: usize,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            max_run_bytes: DEFAULT_MAX_RUN_BYTES,
            max_open_runs: DEFAULT_MAX_OPEN_RUNS,
        }
    }
}

impl SortOptions {
    pub fn with_max_run_bytes(mut self, max_run_bytes: usize) -> Self {
        self.max_run_bytes = max_run_bytes;
        self
    }

    pub fn with_max_open_runs(mut self, max_open_runs: usize) -> Self {
        self.max_open_runs = max_open_runs;
        self
    }

    fn open_run_limit(&self) -> usize {
        self.max_open_runs.max(2)
    }
}

/// Location of the normalized artifact for `source`: a sibling named `<name>-sorted`.
pub fn sorted_path(source: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(SORTED_SUFFIX);
    source.with_file_name(name)
}

/// Produces the sorted artifact for `source` unless it already exists.
///
/// Returns `None` when the format declares no quote character (the file is used as
/// is), `Some(true)` when a new artifact was written and `Some(false)` when one was
/// already present.
pub fn normalize_and_sort(
    source: &Path,
    format: &TabularFormat,
    key_column: usize,
    options: SortOptions,
) -> Result<Option<bool>, Error> {
    let Some(quote) = format.quote else {
        debug!(path = %source.display(), "no quote character, normalization skipped");
        return Ok(None);
    };
    let target = sorted_path(source);
    if target.exists() {
        debug!(path = %target.display(), "sorted artifact already present");
        return Ok(Some(false));
    }

    let encoding = format.validate()?;
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let canonical = Canonical {
        delimiter: format.delimiter.clone(),
        quote,
        key_column,
    };

    let mut reader = Tokenizer::open(source, format)?;
    let scratch = tempfile::Builder::new()
        .prefix(".starjoin-runs")
        .tempdir_in(&parent)
        .map_err(|err| {
            Error::io(err, "failed to create sort scratch directory").with_path(&parent)
        })?;

    let mut runs = Runs::new(&scratch, options.open_run_limit());
    let mut pending = Vec::new();
    let mut pending_bytes = 0usize;
    let mut rows = 0u64;
    while let Some(row) = reader.read()? {
        let key = row.get(key_column).unwrap_or_default().to_string();
        let line = canonical.line(&row.fields);
        pending_bytes += key.len() + line.len() + ENTRY_OVERHEAD;
        pending.push(RunEntry {
            key,
            seq: rows,
            line,
        });
        rows += 1;
        if pending_bytes >= options.max_run_bytes {
            runs.spill(&mut pending, &canonical)?;
            pending_bytes = 0;
        }
    }
    let headers = reader.header_rows().to_vec();
    reader.close()?;

    let mut output = tempfile::Builder::new()
        .prefix(".starjoin-out")
        .tempfile_in(&parent)
        .map_err(|err| Error::io(err, "failed to create sort output").with_path(&parent))?;
    {
        let mut writer = EncodedWriter::new(BufWriter::new(output.as_file_mut()), encoding)
            .with_path(&target);
        for header in &headers {
            writer.write_line(&canonical.line(header))?;
        }
        if runs.paths.is_empty() {
            sort_run(&mut pending);
            for entry in &pending {
                writer.write_line(&entry.line)?;
            }
        } else {
            if !pending.is_empty() {
                runs.spill(&mut pending, &canonical)?;
            }
            debug!(runs = runs.paths.len(), "merging sorted runs");
            merge_runs(&runs.paths, &canonical, &mut writer)?;
        }
        writer.finish()?;
    }
    output
        .as_file()
        .sync_all()
        .map_err(|err| Error::io(err, "failed to sync sort output").with_path(&target))?;

    match output.persist_noclobber(&target) {
        Ok(_) => {}
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %target.display(), "sorted artifact produced concurrently");
            return Ok(Some(false));
        }
        Err(err) => {
            return Err(
                Error::io(err.error, "failed to publish sorted artifact").with_path(&target)
            );
        }
    }
    info!(
        path = %target.display(),
        rows,
        runs = runs.spilled.max(1),
        "normalized and sorted"
    );
    Ok(Some(true))
}

struct Canonical {
    delimiter: String,
    quote: char,
    key_column: usize,
}

impl Canonical {
    fn line(&self, fields: &[String]) -> String {
        quoted_line(fields, &self.delimiter, self.quote)
    }

    /// Format used to read runs back; runs are always UTF-8.
    fn run_format(&self) -> TabularFormat {
        TabularFormat {
            encoding: DEFAULT_ENCODING.to_string(),
            delimiter: self.delimiter.clone(),
            quote: Some(self.quote),
            header_rows: 0,
        }
    }
}

struct RunEntry {
    key: String,
    seq: u64,
    line: String,
}

fn sort_run(entries: &mut [RunEntry]) {
    entries.par_sort_unstable_by(|a, b| a.key.cmp(&b.key).then(a.seq.cmp(&b.seq)));
}

/// Spilled runs in input order, consolidated so no more than `limit` are kept.
struct Runs<'a> {
    scratch: &'a TempDir,
    limit: usize,
    paths: Vec<PathBuf>,
    spilled: usize,
    merged: usize,
}

impl<'a> Runs<'a> {
    fn new(scratch: &'a TempDir, limit: usize) -> Self {
        Self {
            scratch,
            limit,
            paths: Vec::new(),
            spilled: 0,
            merged: 0,
        }
    }

    fn spill(&mut self, pending: &mut Vec<RunEntry>, canonical: &Canonical) -> Result<(), Error> {
        sort_run(pending);
        let path = self.scratch.path().join(format!("run-{:05}", self.spilled));
        let mut writer = EncodedWriter::new(BufWriter::new(create_run(&path)?), UTF_8)
            .with_path(&path);
        for entry in pending.drain(..) {
            writer.write_line(&entry.line)?;
        }
        writer.finish()?;
        debug!(run = self.spilled, path = %path.display(), "spilled sorted run");
        self.spilled += 1;
        self.paths.push(path);
        self.consolidate(canonical)
    }

    // The oldest runs are merged and the result takes their place at the front,
    // which keeps equal keys in input order for the final merge.
    fn consolidate(&mut self, canonical: &Canonical) -> Result<(), Error> {
        if self.paths.len() < self.limit {
            return Ok(());
        }
        let count = (self.limit / 2).max(2).min(self.paths.len());
        let oldest: Vec<PathBuf> = self.paths.drain(..count).collect();
        let path = self.scratch.path().join(format!("merged-{:05}", self.merged));
        self.merged += 1;

        let mut writer = EncodedWriter::new(BufWriter::new(create_run(&path)?), UTF_8)
            .with_path(&path);
        merge_runs(&oldest, canonical, &mut writer)?;
        writer.finish()?;
        for run in &oldest {
            if let Err(err) = fs::remove_file(run) {
                debug!(path = %run.display(), error = %err, "failed to remove merged run");
            }
        }
        debug!(
            merged = count,
            remaining = self.paths.len() + 1,
            "consolidated sorted runs"
        );
        self.paths.insert(0, path);
        Ok(())
    }
}

fn create_run(path: &Path) -> Result<File, Error> {
    File::create(path).map_err(|err| Error::io(err, "failed to create sort run").with_path(path))
}

struct MergeHead {
    key: String,
    run: usize,
    fields: Vec<String>,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    // Runs are numbered in input order, so the run index keeps equal keys stable.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.run.cmp(&other.run))
    }
}

fn merge_runs<W: Write>(
    runs: &[PathBuf],
    canonical: &Canonical,
    writer: &mut EncodedWriter<W>,
) -> Result<(), Error> {
    let format = canonical.run_format();
    let mut readers = runs
        .iter()
        .map(|path| Tokenizer::open(path, &format))
        .collect::<Result<Vec<_>, _>>()?;

    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (run, reader) in readers.iter_mut().enumerate() {
        if let Some(row) = reader.read()? {
            heap.push(Reverse(head(run, row.fields, canonical.key_column)));
        }
    }
    while let Some(Reverse(next)) = heap.pop() {
        writer.write_line(&canonical.line(&next.fields))?;
        if let Some(row) = readers[next.run].read()? {
            heap.push(Reverse(head(next.run, row.fields, canonical.key_column)));
        }
    }
    for reader in &mut readers {
        reader.close()?;
    }
    Ok(())
}

fn head(run: usize, fields: Vec<String>, key_column: usize) -> MergeHead {
    let key = fields.get(key_column).cloned().unwrap_or_default();
    MergeHead { key, run, fields }
}

struct EncodedWriter<W: Write> {
    inner: W,
    encoding: &'static Encoding,
    path: Option<PathBuf>,
    warned_unmappable: bool,
}

impl<W: Write> EncodedWriter<W> {
    fn new(inner: W, encoding: &'static Encoding) -> Self {
        Self {
            inner,
            encoding,
            path: None,
            warned_unmappable: false,
        }
    }

    fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    fn write_line(&mut self, line: &str) -> Result<(), Error> {
        let (bytes, _, unmappable) = self.encoding.encode(line);
        if unmappable && !self.warned_unmappable {
            self.warned_unmappable = true;
            warn!(
                path = ?self.path,
                encoding = self.encoding.name(),
                "wrote unmappable characters as numeric references"
            );
        }
        let result = self
            .inner
            .write_all(&bytes)
            .and_then(|_| self.inner.write_all(b"\n"));
        result.map_err(|err| self.error(err))
    }

    fn finish(mut self) -> Result<(), Error> {
        let result = self.inner.flush();
        result.map_err(|err| self.error(err))
    }

    fn error(&self, err: io::Error) -> Error {
        let err = Error::io(err, "failed to write sorted output");
        match &self.path {
            Some(path) => err.with_path(path),
            None => err,
        }
    }
}

/// Checks that `path` is ordered by `key_column`, reading it with `format`.
pub fn is_sorted(path: &Path, format: &TabularFormat, key_column: usize) -> Result<bool, Error> {
    let mut reader = Tokenizer::open(path, format)?;
    let mut previous: Option<String> = None;
    while let Some(row) = reader.read()? {
        let key = row.get(key_column).unwrap_or_default();
        if previous.as_deref().is_some_and(|prev| prev > key) {
            reader.close()?;
            return Ok(false);
        }
        previous = Some(key.to_string());
    }
    Ok(true)
}

/// Fails with `Usage` when `key_column` is missing from a non-empty header row.
pub fn check_key_column(header: Option<&[String]>, key_column: usize) -> Result<(), Error> {
    match header {
        Some(header) if key_column >= header.len() => Err(Error::new(ErrorKind::Usage)
            .with_message(format!(
                "key column {key_column} outside header of {} columns",
                header.len()
            ))),
        _ => Ok(()),
    }
}
