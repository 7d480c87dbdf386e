// Sorted merge-join of one core source with any number of extension sources.
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::core::error::Error;
use crate::core::mapped::MappedRow;
use crate::core::reader::RowReader;

/// A core row and, per extension name, the extension rows referencing it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StarRecord<K: Eq + Hash> {
    core: MappedRow<K>,
    extensions: BTreeMap<String, Vec<MappedRow<K>>>,
}

impl<K: Eq + Hash> StarRecord<K> {
    pub fn new(core: MappedRow<K>, extensions: BTreeMap<String, Vec<MappedRow<K>>>) -> Self {
        Self { core, extensions }
    }

    pub fn core(&self) -> &MappedRow<K> {
        &self.core
    }

    /// Rows of one extension; empty for unknown names.
    pub fn extension(&self, name: &str) -> &[MappedRow<K>] {
        self.extensions.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn extensions(&self) -> impl Iterator<Item = (&str, &[MappedRow<K>])> {
        self.extensions
            .iter()
            .map(|(name, rows)| (name.as_str(), rows.as_slice()))
    }

    /// Total number of extension rows across all extensions.
    pub fn size(&self) -> usize {
        self.extensions.values().map(Vec::len).sum()
    }

    /// All extension rows, grouped by extension name in name order.
    pub fn iter(&self) -> impl Iterator<Item = &MappedRow<K>> {
        self.extensions.values().flatten()
    }

    pub fn into_parts(self) -> (MappedRow<K>, BTreeMap<String, Vec<MappedRow<K>>>) {
        (self.core, self.extensions)
    }
}

/// Rewrites the rows grouped for one extension before they are emitted.
pub trait ReplacementPolicy<K: Eq + Hash> {
    fn apply(&self, extension: &str, rows: Vec<MappedRow<K>>) -> Vec<MappedRow<K>>;
}

impl<K, F> ReplacementPolicy<K> for F
where
    K: Eq + Hash,
    F: Fn(&str, Vec<MappedRow<K>>) -> Vec<MappedRow<K>>,
{
    fn apply(&self, extension: &str, rows: Vec<MappedRow<K>>) -> Vec<MappedRow<K>> {
        self(extension, rows)
    }
}

/// Keeps only the last row for each value of `marker`; a later row supersedes an
/// earlier one. Rows without the marker are always kept.
#[derive(Clone, Debug)]
pub struct Supersede<K> {
    marker: K,
}

impl<K> Supersede<K> {
    pub fn new(marker: K) -> Self {
        Self { marker }
    }
}

impl<K: Eq + Hash> ReplacementPolicy<K> for Supersede<K> {
    fn apply(&self, _extension: &str, rows: Vec<MappedRow<K>>) -> Vec<MappedRow<K>> {
        let mut last = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            if let Some(value) = row.get(&self.marker) {
                last.insert(value.to_string(), idx);
            }
        }
        rows.into_iter()
            .enumerate()
            .filter(|(idx, row)| match row.get(&self.marker) {
                Some(value) => last.get(value) == Some(idx),
                None => true,
            })
            .map(|(_, row)| row)
            .collect()
    }
}

pub struct JoinOptions<K: Eq + Hash> {
    pub include_extensions: bool,
    pub replacement: Option<Box<dyn ReplacementPolicy<K>>>,
}

impl<K: Eq + Hash> Default for JoinOptions<K> {
    fn default() -> Self {
        Self {
            include_extensions: true,
            replacement: None,
        }
    }
}

impl<K: Eq + Hash> JoinOptions<K> {
    pub fn core_only() -> Self {
        Self {
            include_extensions: false,
            replacement: None,
        }
    }

    pub fn with_replacement(mut self, policy: impl ReplacementPolicy<K> + 'static) -> Self {
        self.replacement = Some(Box::new(policy));
        self
    }
}

/// A reader together with the key whose value is its join key.
pub struct Keyed<R, K> {
    reader: R,
    id: K,
    closed: bool,
}

impl<R, K> Keyed<R, K>
where
    R: RowReader<Row = MappedRow<K>>,
    K: Eq + Hash,
{
    pub fn new(reader: R, id: K) -> Self {
        Self {
            reader,
            id,
            closed: false,
        }
    }

    pub fn id(&self) -> &K {
        &self.id
    }

    fn key_of<'a>(&self, row: &'a MappedRow<K>) -> &'a str {
        row.get(&self.id).unwrap_or_default()
    }

    fn read(&mut self) -> Result<Option<MappedRow<K>>, Error> {
        if self.closed {
            return Ok(None);
        }
        self.reader.read()
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reader.close()
    }
}

struct ExtensionCursor<R, K: Eq + Hash> {
    name: String,
    source: Keyed<R, K>,
    pending: Option<MappedRow<K>>,
    orphans: u64,
}

impl<R, K> ExtensionCursor<R, K>
where
    R: RowReader<Row = MappedRow<K>>,
    K: Eq + Hash,
{
    /// Consumes every buffered row keyed at or below `key`, returning those equal to it.
    /// Rows keyed below `key` can never match a later core row and are dropped.
    fn collect(&mut self, key: &str) -> Result<Vec<MappedRow<K>>, Error> {
        let mut group = Vec::new();
        loop {
            let row = match self.pending.take() {
                Some(row) => row,
                None => match self.source.read()? {
                    Some(row) => row,
                    None => break,
                },
            };
            match self.source.key_of(&row).cmp(key) {
                Ordering::Less => {
                    self.orphans += 1;
                    trace!(extension = %self.name, line = row.line(), "dropped orphan row");
                }
                Ordering::Equal => group.push(row),
                Ordering::Greater => {
                    self.pending = Some(row);
                    break;
                }
            }
        }
        Ok(group)
    }
}

/// Forward-only merge-join over a core source and extension sources that are all
/// sorted ascending by their join keys.
///
/// Each record is built from one core row and the extension rows whose join key equals
/// the core row's key. Extension rows that match no core row are dropped. A repeated
/// core key reuses the groups collected for its first occurrence.
pub struct StarJoin<R, K: Eq + Hash> {
    core: Keyed<R, K>,
    extensions: Vec<ExtensionCursor<R, K>>,
    include_extensions: bool,
    replacement: Option<Box<dyn ReplacementPolicy<K>>>,
    // One core row read ahead so a repeated id is known before its groups are handed out.
    lookahead: Option<MappedRow<K>>,
    deferred: Option<Error>,
    repeat: Option<(String, BTreeMap<String, Vec<MappedRow<K>>>)>,
    last_key: Option<String>,
    warned_unsorted: bool,
    finished: bool,
}

impl<R, K> StarJoin<R, K>
where
    R: RowReader<Row = MappedRow<K>>,
    K: Clone + Eq + Hash,
{
    pub fn new(
        core: Keyed<R, K>,
        extensions: Vec<(String, Keyed<R, K>)>,
        options: JoinOptions<K>,
    ) -> Self {
        let extensions = extensions
            .into_iter()
            .map(|(name, source)| ExtensionCursor {
                name,
                source,
                pending: None,
                orphans: 0,
            })
            .collect();
        Self {
            core,
            extensions,
            include_extensions: options.include_extensions,
            replacement: options.replacement,
            lookahead: None,
            deferred: None,
            repeat: None,
            last_key: None,
            warned_unsorted: false,
            finished: false,
        }
    }

    pub fn extension_names(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(|cursor| cursor.name.as_str())
    }

    /// Extension rows dropped so far because no core row referenced them.
    pub fn orphan_count(&self) -> u64 {
        self.extensions.iter().map(|cursor| cursor.orphans).sum()
    }

    /// Reads the next record, or `None` once the core source is exhausted.
    pub fn advance(&mut self) -> Result<Option<StarRecord<K>>, Error> {
        if self.finished {
            return Ok(None);
        }
        let core = match self.next_core() {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.close()?;
                return Ok(None);
            }
            Err(err) => {
                self.finished = true;
                return Err(err);
            }
        };
        if !self.include_extensions {
            return Ok(Some(StarRecord::new(core, BTreeMap::new())));
        }

        let key = self.core.key_of(&core).to_string();
        let groups = match self.repeat.take() {
            Some((previous, groups)) if previous == key => groups,
            _ => {
                if let Some(previous) = &self.last_key {
                    if *previous > key && !self.warned_unsorted {
                        self.warned_unsorted = true;
                        warn!(previous = %previous, key = %key, "core source is not sorted by id");
                    }
                }
                self.collect_groups(&key)?
            }
        };

        // A read failure belongs to the following record, so it is held until then.
        match self.core.read() {
            Ok(Some(next)) => {
                if self.core.key_of(&next) == key {
                    self.repeat = Some((key.clone(), groups.clone()));
                }
                self.lookahead = Some(next);
            }
            Ok(None) => {}
            Err(err) => self.deferred = Some(err),
        }
        self.last_key = Some(key);
        Ok(Some(StarRecord::new(core, groups)))
    }

    fn next_core(&mut self) -> Result<Option<MappedRow<K>>, Error> {
        if let Some(row) = self.lookahead.take() {
            return Ok(Some(row));
        }
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        self.core.read()
    }

    fn collect_groups(
        &mut self,
        key: &str,
    ) -> Result<BTreeMap<String, Vec<MappedRow<K>>>, Error> {
        let mut groups = BTreeMap::new();
        for cursor in &mut self.extensions {
            let rows = match cursor.collect(key) {
                Ok(rows) => rows,
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            };
            let rows = match &self.replacement {
                Some(policy) if !rows.is_empty() => policy.apply(&cursor.name, rows),
                _ => rows,
            };
            groups.insert(cursor.name.clone(), rows);
        }
        Ok(groups)
    }

    /// Closes the core and every extension source, continuing past failures and
    /// returning the first one. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<(), Error> {
        if !self.finished {
            debug!(orphans = self.orphan_count(), "closing star join");
        }
        self.finished = true;
        self.lookahead = None;
        self.deferred = None;
        self.repeat = None;
        let mut first = self.core.close().err();
        for cursor in &mut self.extensions {
            cursor.pending = None;
            if let Err(err) = cursor.source.close() {
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<R, K> Iterator for StarJoin<R, K>
where
    R: RowReader<Row = MappedRow<K>>,
    K: Clone + Eq + Hash,
{
    type Item = Result<StarRecord<K>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::{JoinOptions, Keyed, StarJoin, StarRecord, Supersede};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::format::TabularFormat;
    use crate::core::mapped::{MappedReader, MappedRow};
    use crate::core::reader::RowReader;
    use crate::core::tokenizer::Tokenizer;
    use std::cell::Cell;
    use std::io::Cursor;
    use std::rc::Rc;

    type Reader = MappedReader<Tokenizer<Cursor<Vec<u8>>>, &'static str>;

    fn source(text: &str, columns: &[&'static str]) -> Reader {
        let bytes = Cursor::new(text.as_bytes().to_vec());
        let tokenizer = Tokenizer::new(bytes, &TabularFormat::csv()).expect("tokenizer");
        MappedReader::new(tokenizer, columns.to_vec())
    }

    fn join(
        core: &str,
        extensions: &[(&str, &str)],
        options: JoinOptions<&'static str>,
    ) -> StarJoin<Reader, &'static str> {
        let core = Keyed::new(source(core, &["id", "name"]), "id");
        let extensions = extensions
            .iter()
            .map(|(name, text)| {
                (
                    name.to_string(),
                    Keyed::new(source(text, &["coreid", "value", "flag"]), "coreid"),
                )
            })
            .collect();
        StarJoin::new(core, extensions, options)
    }

    fn collect(join: StarJoin<Reader, &'static str>) -> Vec<StarRecord<&'static str>> {
        join.collect::<Result<Vec<_>, _>>().expect("records")
    }

    fn values<'a>(rows: &'a [MappedRow<&'static str>]) -> Vec<&'a str> {
        rows.iter().map(|row| row.get(&"value").unwrap_or_default()).collect()
    }

    #[test]
    fn groups_extension_rows_under_their_core_row() {
        let records = collect(join(
            "1,one\n2,two\n3,three\n",
            &[
                ("vernacular", "1,uno\n1,eins\n3,drei\n"),
                ("distribution", "2,north\n2,south\n3,east\n"),
            ],
            JoinOptions::default(),
        ));

        assert_eq!(records.len(), 3);
        assert_eq!(values(records[0].extension("vernacular")), ["uno", "eins"]);
        assert!(records[0].extension("distribution").is_empty());
        assert_eq!(values(records[1].extension("distribution")), ["north", "south"]);
        assert_eq!(records[2].size(), 2);
        assert_eq!(records[2].iter().count(), 2);
        assert_eq!(records[2].core().get(&"name"), Some("three"));
        assert_eq!(records.iter().map(StarRecord::size).sum::<usize>(), 6);
    }

    #[test]
    fn orphan_rows_are_dropped_silently() {
        let mut join = join(
            "2,two\n4,four\n",
            &[("ext", "1,before\n2,match\n3,between\n4,match\n5,after\n6,after\n")],
            JoinOptions::default(),
        );

        let first = join.next().expect("record").expect("ok");
        assert_eq!(values(first.extension("ext")), ["match"]);
        let second = join.next().expect("record").expect("ok");
        assert_eq!(values(second.extension("ext")), ["match"]);
        assert!(join.next().is_none());
        assert!(join.next().is_none());
        assert_eq!(join.orphan_count(), 2);
    }

    #[test]
    fn core_only_skips_extension_sources() {
        let records = collect(join(
            "1,one\n2,two\n",
            &[("ext", "1,a\n2,b\n")],
            JoinOptions::core_only(),
        ));
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.size() == 0));
        assert_eq!(records[1].extensions().count(), 0);
    }

    #[test]
    fn duplicate_core_ids_share_their_group() {
        let records = collect(join(
            "1,one\n1,again\n2,two\n",
            &[("ext", "1,a\n1,b\n2,c\n")],
            JoinOptions::default(),
        ));
        assert_eq!(records.len(), 3);
        assert_eq!(values(records[0].extension("ext")), ["a", "b"]);
        assert_eq!(values(records[1].extension("ext")), ["a", "b"]);
        assert_eq!(values(records[2].extension("ext")), ["c"]);
    }

    #[test]
    fn long_duplicate_runs_share_without_consuming_the_next_group() {
        let records = collect(join(
            "1,one\n1,again\n1,third\n3,three\n3,last\n",
            &[("ext", "1,a\n2,orphan\n3,c\n3,d\n")],
            JoinOptions::default(),
        ));
        assert_eq!(records.len(), 5);
        for record in &records[..3] {
            assert_eq!(values(record.extension("ext")), ["a"]);
        }
        assert_eq!(records[2].core().get(&"name"), Some("third"));
        assert_eq!(values(records[3].extension("ext")), ["c", "d"]);
        assert_eq!(values(records[4].extension("ext")), ["c", "d"]);
    }

    #[test]
    fn core_failure_surfaces_on_the_record_it_belongs_to() {
        let mut join = join(
            "1,one\n1,\"broken\n",
            &[("ext", "1,a\n")],
            JoinOptions::default(),
        );
        let first = join.next().expect("record").expect("ok");
        assert_eq!(values(first.extension("ext")), ["a"]);
        let err = join.next().expect("record").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(join.next().is_none());
    }

    #[test]
    fn replacement_policy_collapses_superseded_rows() {
        let options = JoinOptions::default().with_replacement(Supersede::new("flag"));
        let records = collect(join(
            "1,one\n",
            &[("ext", "1,old,x\n1,keep\n1,new,x\n1,solo,y\n")],
            options,
        ));
        assert_eq!(values(records[0].extension("ext")), ["keep", "new", "solo"]);

        let options = JoinOptions::default()
            .with_replacement(|_: &str, mut rows: Vec<MappedRow<&'static str>>| {
                rows.truncate(1);
                rows
            });
        let records = collect(join("1,one\n", &[("ext", "1,a\n1,b\n")], options));
        assert_eq!(values(records[0].extension("ext")), ["a"]);
    }

    #[test]
    fn format_failure_ends_the_join() {
        let mut join = join(
            "1,one\n2,\"broken\n",
            &[("ext", "1,a\n")],
            JoinOptions::default(),
        );
        assert!(join.next().expect("record").is_ok());
        let err = join.next().expect("record").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(join.next().is_none());
        join.close().expect("close");
    }

    struct Tracked {
        rows: Vec<MappedRow<&'static str>>,
        closes: Rc<Cell<u32>>,
        fail_close: bool,
    }

    impl RowReader for Tracked {
        type Row = MappedRow<&'static str>;

        fn header(&self) -> Option<&[String]> {
            None
        }

        fn read(&mut self) -> Result<Option<Self::Row>, Error> {
            Ok(if self.rows.is_empty() { None } else { Some(self.rows.remove(0)) })
        }

        fn close(&mut self) -> Result<(), Error> {
            self.closes.set(self.closes.get() + 1);
            if self.fail_close {
                return Err(Error::new(ErrorKind::Io).with_message("close failed"));
            }
            Ok(())
        }
    }

    fn tracked(
        ids: &[&str],
        closes: &Rc<Cell<u32>>,
        fail_close: bool,
    ) -> Keyed<Tracked, &'static str> {
        let rows = ids
            .iter()
            .enumerate()
            .map(|(idx, id)| {
                let mut row = MappedRow::new(idx as u64 + 1, Default::default(), 1);
                row.set("id", *id);
                row
            })
            .collect();
        Keyed::new(
            Tracked {
                rows,
                closes: Rc::clone(closes),
                fail_close,
            },
            "id",
        )
    }

    #[test]
    fn close_fans_out_past_failures_once() {
        let closes = Rc::new(Cell::new(0));
        let core = tracked(&["1", "2", "3"], &closes, false);
        let extensions = vec![
            ("a".to_string(), tracked(&["1"], &closes, true)),
            ("b".to_string(), tracked(&["2", "3"], &closes, false)),
        ];
        let mut join = StarJoin::new(core, extensions, JoinOptions::default());

        assert!(join.next().expect("record").is_ok());
        let err = join.close().unwrap_err();
        assert_eq!(err.message(), Some("close failed"));
        assert_eq!(closes.get(), 3);

        join.close().expect("second close is a no-op");
        assert_eq!(closes.get(), 3);
        assert!(join.next().is_none());
    }

    #[test]
    fn natural_end_releases_every_source() {
        let closes = Rc::new(Cell::new(0));
        let core = tracked(&["1"], &closes, false);
        let extensions = vec![("a".to_string(), tracked(&["1", "9"], &closes, false))];
        let mut join = StarJoin::new(core, extensions, JoinOptions::default());

        assert_eq!(join.next().expect("record").expect("ok").size(), 1);
        assert!(join.next().is_none());
        assert_eq!(closes.get(), 2);
    }
}
