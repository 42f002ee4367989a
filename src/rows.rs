//! Streaming row source over a delimited input file.
//!
//! [`RowSource`] yields one [`Row`] at a time so a migration never holds the
//! whole input in memory. Records whose field count does not match the
//! header, or whose bytes cannot be decoded, surface as
//! [`SourceError::Malformed`] so the controller can reject them individually;
//! I/O failures are fatal.

use std::{io::Read, path::Path};

use anyhow::Result;
use encoding_rs::Encoding;
use thiserror::Error;

use crate::io_utils;

/// One source record: a 1-based data row number and its raw fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub number: usize,
    pub fields: Vec<String>,
}

impl Row {
    pub fn new(number: usize, fields: Vec<String>) -> Self {
        Self { number, fields }
    }
}

/// Read-only view of the row being migrated, handed to conversion hooks.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub row: &'a Row,
    pub headers: &'a [String],
}

impl<'a> RowContext<'a> {
    pub fn new(row: &'a Row, headers: &'a [String]) -> Self {
        Self { row, headers }
    }

    pub fn field(&self, column: &str) -> Option<&'a str> {
        let idx = self.headers.iter().position(|h| h == column)?;
        self.row.fields.get(idx).map(String::as_str)
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Row {number}: {message}")]
    Malformed {
        number: usize,
        fields: Vec<String>,
        message: String,
    },

    #[error(transparent)]
    Fatal(#[from] csv::Error),
}

pub struct RowSource<R: Read> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    encoding: &'static Encoding,
    record: csv::ByteRecord,
    next_number: usize,
}

impl RowSource<Box<dyn Read>> {
    pub fn from_path(path: &Path, delimiter: u8, encoding: &'static Encoding) -> Result<Self> {
        let reader = io_utils::open_csv_reader_from_path(path, delimiter)?;
        Self::new(reader, encoding)
    }
}

impl<R: Read> RowSource<R> {
    pub fn new(mut reader: csv::Reader<R>, encoding: &'static Encoding) -> Result<Self> {
        let headers = io_utils::reader_headers(&mut reader, encoding)?;
        Ok(Self {
            reader,
            headers,
            encoding,
            record: csv::ByteRecord::new(),
            next_number: 1,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl<R: Read> Iterator for RowSource<R> {
    type Item = Result<Row, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_byte_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => {
                let number = self.next_number;
                self.next_number += 1;
                let lossy = || {
                    self.record
                        .iter()
                        .map(|f| String::from_utf8_lossy(f).into_owned())
                        .collect::<Vec<_>>()
                };
                let fields = match io_utils::decode_record(&self.record, self.encoding) {
                    Ok(fields) => fields,
                    Err(err) => {
                        return Some(Err(SourceError::Malformed {
                            number,
                            fields: lossy(),
                            message: err.to_string(),
                        }));
                    }
                };
                if fields.len() != self.headers.len() {
                    return Some(Err(SourceError::Malformed {
                        number,
                        message: format!(
                            "expected {} field(s) but found {}",
                            self.headers.len(),
                            fields.len()
                        ),
                        fields,
                    }));
                }
                Some(Ok(Row::new(number, fields)))
            }
            Err(err) if err.is_io_error() => Some(Err(SourceError::Fatal(err))),
            Err(err) => {
                let number = self.next_number;
                self.next_number += 1;
                Some(Err(SourceError::Malformed {
                    number,
                    fields: Vec::new(),
                    message: err.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::UTF_8;

    fn source(input: &'static str) -> RowSource<&'static [u8]> {
        let reader = io_utils::open_csv_reader(input.as_bytes(), b',');
        RowSource::new(reader, UTF_8).expect("headers")
    }

    #[test]
    fn yields_numbered_rows() {
        let mut rows = source("a,b\n1,2\n3,4\n");
        assert_eq!(rows.headers(), ["a", "b"]);
        let first = rows.next().unwrap().unwrap();
        assert_eq!(first, Row::new(1, vec!["1".into(), "2".into()]));
        let second = rows.next().unwrap().unwrap();
        assert_eq!(second.number, 2);
        assert!(rows.next().is_none());
    }

    #[test]
    fn short_records_are_malformed_not_fatal() {
        let mut rows = source("a,b\n1\n3,4\n");
        match rows.next().unwrap() {
            Err(SourceError::Malformed { number, fields, .. }) => {
                assert_eq!(number, 1);
                assert_eq!(fields, vec!["1".to_string()]);
            }
            other => panic!("expected malformed row, got {other:?}"),
        }
        assert_eq!(rows.next().unwrap().unwrap().number, 2);
    }

    #[test]
    fn row_context_looks_up_by_header() {
        let headers = vec!["spn".to_string(), "qty".to_string()];
        let row = Row::new(1, vec!["4001".into(), "3.4".into()]);
        let ctx = RowContext::new(&row, &headers);
        assert_eq!(ctx.field("qty"), Some("3.4"));
        assert_eq!(ctx.field("missing"), None);
    }
}
