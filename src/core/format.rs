// Tabular file format settings and the canonical fully quoted row encoding.
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_ENCODING: &str = "utf-8";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabularFormat {
    /// WHATWG encoding label, e.g. `utf-8` or `windows-1252`.
    pub encoding: String,
    pub delimiter: String,
    /// `None` disables all quote interpretation.
    pub quote: Option<char>,
    pub header_rows: usize,
}

impl Default for TabularFormat {
    fn default() -> Self {
        Self::csv()
    }
}

impl TabularFormat {
    pub fn csv() -> Self {
        Self {
            encoding: DEFAULT_ENCODING.to_string(),
            delimiter: ",".to_string(),
            quote: Some('"'),
            header_rows: 0,
        }
    }

    pub fn tsv() -> Self {
        Self {
            encoding: DEFAULT_ENCODING.to_string(),
            delimiter: "\t".to_string(),
            quote: None,
            header_rows: 0,
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_quote(mut self, quote: Option<char>) -> Self {
        self.quote = quote;
        self
    }

    pub fn with_header_rows(mut self, header_rows: usize) -> Self {
        self.header_rows = header_rows;
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    /// Resolves the encoding label. Rows are split on the `\n` byte, so only
    /// ASCII-compatible encodings are accepted.
    pub fn resolve_encoding(&self) -> Result<&'static Encoding, Error> {
        let encoding = Encoding::for_label(self.encoding.trim().as_bytes()).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("unknown encoding label '{}'", self.encoding))
        })?;
        if !encoding.is_ascii_compatible() {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "encoding {} is not ASCII-compatible",
                encoding.name()
            )));
        }
        Ok(encoding)
    }

    pub fn validate(&self) -> Result<&'static Encoding, Error> {
        if self.delimiter.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("delimiter must not be empty"));
        }
        if let Some(quote) = self.quote {
            if self.delimiter.contains(quote) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("quote character must not appear in the delimiter"));
            }
        }
        self.resolve_encoding()
    }
}

/// Encodes a row with every field quote-enclosed and embedded quotes doubled.
/// The returned line carries no terminator.
pub fn quoted_line(fields: &[String], delimiter: &str, quote: char) -> String {
    let capacity = fields.iter().map(|field| field.len() + 3).sum::<usize>();
    let mut line = String::with_capacity(capacity);
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            line.push_str(delimiter);
        }
        line.push(quote);
        for c in field.chars() {
            if c == quote {
                line.push(quote);
            }
            line.push(c);
        }
        line.push(quote);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::{TabularFormat, quoted_line};
    use crate::core::error::ErrorKind;

    #[test]
    fn quoted_line_doubles_embedded_quotes() {
        let fields = vec![
            "15".to_string(),
            "no, this is \"real\"".to_string(),
            String::new(),
        ];
        assert_eq!(
            quoted_line(&fields, ",", '"'),
            r#""15","no, this is ""real""","""#
        );
    }

    #[test]
    fn defaults_deserialize_from_partial_json() {
        let format: TabularFormat =
            serde_json::from_str(r#"{"delimiter": "\t", "header_rows": 1}"#).expect("format");
        assert_eq!(format.delimiter, "\t");
        assert_eq!(format.quote, Some('"'));
        assert_eq!(format.header_rows, 1);
        assert_eq!(format.encoding, "utf-8");

        let unquoted: TabularFormat =
            serde_json::from_str(r#"{"quote": null}"#).expect("format");
        assert_eq!(unquoted.quote, None);
    }

    #[test]
    fn invalid_settings_are_usage_errors() {
        let err = TabularFormat::csv()
            .with_encoding("klingon")
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = TabularFormat::csv()
            .with_encoding("utf-16le")
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = TabularFormat::csv().with_delimiter("").validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        let latin = TabularFormat::tsv()
            .with_encoding("latin1")
            .validate()
            .expect("latin1");
        assert_eq!(latin.name(), "windows-1252");
    }
}
