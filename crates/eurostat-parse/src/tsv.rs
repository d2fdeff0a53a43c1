//! `TsvParser`: streams the gzip-compressed wide matrix file into
//! bounded row chunks without decoding observation tokens (spec.md
//! §4.2).
//!
//! The first row's first cell encodes the non-time dimension ids and
//! the time dimension id, joined by a backslash, e.g.
//! `geo,freq\time`; the remaining header cells are time-period labels.
//! Each data row's first cell is a comma-separated list of non-time
//! dimension values in the same order, and the remaining cells are raw
//! observation tokens (`TsvParser` does not interpret them).

use std::io::{BufRead, BufReader, Read};

use eurostat_core::error::PipelineError;
use flate2::read::GzDecoder;

/// Default number of data rows per `RowChunk`.
pub const DEFAULT_CHUNK_ROWS: usize = 5_000;

/// One wide data row: the non-time dimension values (in header order)
/// and the raw observation tokens, indexed the same way as
/// [`RowChunk::time_periods`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WideRow {
    pub dimension_values: Vec<String>,
    pub raw_tokens: Vec<String>,
}

/// A bounded, in-memory slice of the wide matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChunk {
    /// Non-time dimension ids, in header declaration order.
    pub dimension_ids: Vec<String>,
    /// Time-period column labels, in header declaration order.
    pub time_periods: Vec<String>,
    pub rows: Vec<WideRow>,
}

/// Streams a gzip-compressed TSV matrix in bounded chunks.
pub struct TsvParser<R: Read> {
    reader: csv::Reader<GzDecoder<BufReader<R>>>,
    dimension_ids: Vec<String>,
    time_periods: Vec<String>,
    chunk_rows: usize,
    dataset_id: String,
    exhausted: bool,
}

impl<R: Read> TsvParser<R> {
    pub fn new(source: R, dataset_id: impl Into<String>) -> Result<Self, PipelineError> {
        Self::with_chunk_rows(source, dataset_id, DEFAULT_CHUNK_ROWS)
    }

    pub fn with_chunk_rows(
        source: R,
        dataset_id: impl Into<String>,
        chunk_rows: usize,
    ) -> Result<Self, PipelineError> {
        let dataset_id = dataset_id.into();
        let gz = GzDecoder::new(BufReader::new(source));
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(gz);

        let mut records = reader.records();
        let header = records
            .next()
            .ok_or_else(|| PipelineError::TsvMalformed {
                dataset_id: dataset_id.clone(),
                reason: "empty file: no header row".to_string(),
            })?
            .map_err(|e| PipelineError::TsvMalformed {
                dataset_id: dataset_id.clone(),
                reason: format!("could not read header row: {e}"),
            })?;
        drop(records);

        let mut cells = header.iter();
        let first_cell = cells.next().ok_or_else(|| PipelineError::TsvMalformed {
            dataset_id: dataset_id.clone(),
            reason: "header row is empty".to_string(),
        })?;
        let (dims_part, _time_id) =
            first_cell
                .split_once('\\')
                .ok_or_else(|| PipelineError::TsvMalformed {
                    dataset_id: dataset_id.clone(),
                    reason: format!("header first cell `{first_cell}` has no '\\' separator"),
                })?;
        let dimension_ids: Vec<String> = dims_part.split(',').map(|s| s.trim().to_string()).collect();
        let time_periods: Vec<String> = cells.map(|s| s.trim().to_string()).collect();

        if time_periods.is_empty() {
            return Err(PipelineError::TsvMalformed {
                dataset_id,
                reason: "header row has no time-period columns".to_string(),
            });
        }

        Ok(TsvParser {
            reader,
            dimension_ids,
            time_periods,
            chunk_rows,
            dataset_id,
            exhausted: false,
        })
    }

    pub fn dimension_ids(&self) -> &[String] {
        &self.dimension_ids
    }

    pub fn time_periods(&self) -> &[String] {
        &self.time_periods
    }

    /// Pull the next bounded chunk of rows, or `None` once the file is
    /// exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<RowChunk>, PipelineError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(self.chunk_rows);
        let ndims = self.dimension_ids.len();
        let ntime = self.time_periods.len();

        loop {
            let mut record = csv::StringRecord::new();
            let read = self
                .reader
                .read_record(&mut record)
                .map_err(|e| PipelineError::TsvMalformed {
                    dataset_id: self.dataset_id.clone(),
                    reason: format!("row read error: {e}"),
                })?;
            if !read {
                self.exhausted = true;
                break;
            }

            let mut cells = record.iter();
            let first_cell = cells.next().ok_or_else(|| PipelineError::TsvMalformed {
                dataset_id: self.dataset_id.clone(),
                reason: "data row is empty".to_string(),
            })?;
            let dimension_values: Vec<String> = first_cell.split(',').map(|s| s.trim().to_string()).collect();
            if dimension_values.len() != ndims {
                return Err(PipelineError::TsvMalformed {
                    dataset_id: self.dataset_id.clone(),
                    reason: format!(
                        "row has {} dimension values, expected {ndims}",
                        dimension_values.len()
                    ),
                });
            }

            let raw_tokens: Vec<String> = cells.map(|s| s.to_string()).collect();
            if raw_tokens.len() != ntime {
                return Err(PipelineError::TsvMalformed {
                    dataset_id: self.dataset_id.clone(),
                    reason: format!(
                        "row has {} observation cells, expected {ntime}",
                        raw_tokens.len()
                    ),
                });
            }

            rows.push(WideRow {
                dimension_values,
                raw_tokens,
            });

            if rows.len() >= self.chunk_rows {
                break;
            }
        }

        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(RowChunk {
                dimension_ids: self.dimension_ids.clone(),
                time_periods: self.time_periods.clone(),
                rows,
            }))
        }
    }
}

/// Build a `TsvParser` from any `BufRead` source (the common case:
/// a file opened from the Fetcher's cache).
pub fn open_tsv<R: BufRead + Read>(
    source: R,
    dataset_id: impl Into<String>,
) -> Result<TsvParser<R>, PipelineError> {
    TsvParser::new(source, dataset_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(s: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(s.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    const S1_TSV: &str = "geo,freq\\time\t2020\t2021\nDE,A\t10.5\t11 p\nFR,A\t:\t9\n";

    #[test]
    fn parses_header_and_rows() {
        let data = gzip(S1_TSV);
        let mut parser = TsvParser::new(data.as_slice(), "nama_10_gdp").unwrap();
        assert_eq!(parser.dimension_ids(), &["geo", "freq"]);
        assert_eq!(parser.time_periods(), &["2020", "2021"]);

        let chunk = parser.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.rows.len(), 2);
        assert_eq!(chunk.rows[0].dimension_values, vec!["DE", "A"]);
        assert_eq!(chunk.rows[0].raw_tokens, vec!["10.5", "11 p"]);
        assert_eq!(chunk.rows[1].raw_tokens, vec![":", "9"]);

        assert!(parser.next_chunk().unwrap().is_none());
    }

    #[test]
    fn bounds_chunk_size() {
        let mut body = String::from("geo\\time\t2020\n");
        for i in 0..10 {
            body.push_str(&format!("G{i}\t{i}\n"));
        }
        let data = gzip(&body);
        let mut parser = TsvParser::with_chunk_rows(data.as_slice(), "ds", 4).unwrap();

        let c1 = parser.next_chunk().unwrap().unwrap();
        assert_eq!(c1.rows.len(), 4);
        let c2 = parser.next_chunk().unwrap().unwrap();
        assert_eq!(c2.rows.len(), 4);
        let c3 = parser.next_chunk().unwrap().unwrap();
        assert_eq!(c3.rows.len(), 2);
        assert!(parser.next_chunk().unwrap().is_none());
    }

    #[test]
    fn rejects_header_without_backslash() {
        let data = gzip("geo,freq\t2020\n");
        let err = TsvParser::new(data.as_slice(), "ds").unwrap_err();
        assert!(matches!(err, PipelineError::TsvMalformed { .. }));
    }

    #[test]
    fn rejects_row_with_wrong_dimension_count() {
        let data = gzip("geo,freq\\time\t2020\nDE\t10.5\n");
        let mut parser = TsvParser::new(data.as_slice(), "ds").unwrap();
        let err = parser.next_chunk().unwrap_err();
        assert!(matches!(err, PipelineError::TsvMalformed { .. }));
    }
}
