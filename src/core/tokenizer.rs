// Quote-aware, line-streaming tokenizer for delimiter-separated text files.
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_8};
use tracing::warn;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::TabularFormat;
use crate::core::reader::RowReader;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TabularRow {
    pub fields: Vec<String>,
    /// 1-based data row number; header rows and blank lines are not counted.
    pub line: u64,
}

impl TabularRow {
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }
}

/// Splits a byte stream into rows of fields.
///
/// A field is quote-enclosed only when the quote character is its first character.
/// Inside an enclosed field a doubled quote is a literal quote, a quote followed by the
/// delimiter or the end of the line closes the field, and any other quote is kept as
/// data. Delimiters and line breaks inside an enclosed field are data.
pub struct Tokenizer<R> {
    reader: Option<BufReader<R>>,
    encoding: &'static Encoding,
    delimiter: String,
    quote: Option<char>,
    headers: Vec<Vec<String>>,
    empty_lines: BTreeSet<u64>,
    source_line: u64,
    data_line: u64,
    buf: Vec<u8>,
    path: Option<PathBuf>,
    warned_lossy: bool,
}

impl Tokenizer<File> {
    pub fn open(path: &Path, format: &TabularFormat) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|err| Error::io(err, "failed to open tabular file").with_path(path))?;
        Self::build(file, format, Some(path.to_path_buf()))
    }
}

impl<R: Read> Tokenizer<R> {
    pub fn new(reader: R, format: &TabularFormat) -> Result<Self, Error> {
        Self::build(reader, format, None)
    }

    fn build(reader: R, format: &TabularFormat, path: Option<PathBuf>) -> Result<Self, Error> {
        let encoding = format.validate()?;
        let mut tokenizer = Self {
            reader: Some(BufReader::new(reader)),
            encoding,
            delimiter: format.delimiter.clone(),
            quote: format.quote,
            headers: Vec::with_capacity(format.header_rows),
            empty_lines: BTreeSet::new(),
            source_line: 0,
            data_line: 0,
            buf: Vec::new(),
            path,
            warned_lossy: false,
        };
        for _ in 0..format.header_rows {
            match tokenizer.next_record() {
                Ok(Some(fields)) => tokenizer.headers.push(fields),
                Ok(None) => break,
                Err(err) => return Err(tokenizer.with_context(err)),
            }
        }
        Ok(tokenizer)
    }

    /// Every row skipped as a header, in file order.
    pub fn header_rows(&self) -> &[Vec<String>] {
        &self.headers
    }

    /// Physical 1-based line numbers of blank lines seen so far.
    pub fn empty_lines(&self) -> &BTreeSet<u64> {
        &self.empty_lines
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    fn with_context(&self, err: Error) -> Error {
        match &self.path {
            Some(path) => err.with_path(path.clone()),
            None => err,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>, Error> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        self.buf.clear();
        let read = match reader.read_until(b'\n', &mut self.buf) {
            Ok(read) => read,
            Err(err) => {
                self.reader = None;
                return Err(Error::io(err, "failed to read tabular data"));
            }
        };
        if read == 0 {
            self.reader = None;
            return Ok(None);
        }
        self.source_line += 1;

        let mut bytes = self.buf.as_slice();
        if self.source_line == 1 && self.encoding == UTF_8 {
            bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        }
        bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
        bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        let (text, had_errors) = self.encoding.decode_without_bom_handling(bytes);
        let line = text.into_owned();
        if had_errors && !self.warned_lossy {
            self.warned_lossy = true;
            warn!(
                line = self.source_line,
                encoding = self.encoding.name(),
                "replaced undecodable bytes"
            );
        }
        Ok(Some(line))
    }

    fn next_record(&mut self) -> Result<Option<Vec<String>>, Error> {
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            if line.is_empty() {
                self.empty_lines.insert(self.source_line);
                continue;
            }
            return self.split(line).map(Some);
        }
    }

    fn split(&mut self, mut line: String) -> Result<Vec<String>, Error> {
        let start_line = self.source_line;
        let mut fields = Vec::new();
        let mut pos = 0;
        loop {
            let Some(quote) = self.quote.filter(|quote| line[pos..].starts_with(*quote)) else {
                match line[pos..].find(self.delimiter.as_str()) {
                    Some(offset) => {
                        fields.push(line[pos..pos + offset].to_string());
                        pos += offset + self.delimiter.len();
                        continue;
                    }
                    None => {
                        fields.push(line[pos..].to_string());
                        return Ok(fields);
                    }
                }
            };
            let (value, next) =
                self.quoted_field(&mut line, pos + quote.len_utf8(), quote, start_line)?;
            fields.push(value);
            match next {
                Some(next) => pos = next,
                None => return Ok(fields),
            }
        }
    }

    /// Reads an enclosed field starting just after its opening quote. Returns the value
    /// and the offset of the following field, or `None` when the field ended the row.
    /// `line` is replaced when the field spans physical lines.
    fn quoted_field(
        &mut self,
        line: &mut String,
        mut pos: usize,
        quote: char,
        start_line: u64,
    ) -> Result<(String, Option<usize>), Error> {
        let width = quote.len_utf8();
        let mut value = String::new();
        loop {
            let Some(c) = line[pos..].chars().next() else {
                match self.next_line()? {
                    Some(next) => {
                        value.push('\n');
                        *line = next;
                        pos = 0;
                        continue;
                    }
                    None => {
                        return Err(Error::new(ErrorKind::Format)
                            .with_message("unterminated quoted field")
                            .with_line(start_line));
                    }
                }
            };
            if c != quote {
                value.push(c);
                pos += c.len_utf8();
                continue;
            }

            let after = pos + width;
            let rest = &line[after..];
            if rest.starts_with(quote) {
                value.push(quote);
                pos = after + width;
            } else if rest.is_empty() {
                return Ok((value, None));
            } else if rest.starts_with(self.delimiter.as_str()) {
                return Ok((value, Some(after + self.delimiter.len())));
            } else {
                value.push(quote);
                pos = after;
            }
        }
    }
}

impl<R: Read> RowReader for Tokenizer<R> {
    type Row = TabularRow;

    fn header(&self) -> Option<&[String]> {
        self.headers.first().map(Vec::as_slice)
    }

    fn read(&mut self) -> Result<Option<TabularRow>, Error> {
        match self.next_record() {
            Ok(Some(fields)) => {
                self.data_line += 1;
                Ok(Some(TabularRow {
                    fields,
                    line: self.data_line,
                }))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.reader = None;
                Err(self.with_context(err))
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.reader = None;
        Ok(())
    }
}
