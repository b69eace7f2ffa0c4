//! Decodes fetched payloads into [`Record`]s.
//!
//! Parsing is all-or-nothing per blob: [`parse_blob`] returns either every
//! record in the payload or the first error, never a prefix.

use crate::domain::{
    BlobReference, ClientRecord, ProductRecord, RawPayload, Record, StoreRecord,
    TransactionRecord,
};
use crate::error::{IngestError, IngestResult};
use crate::schema::{ColumnKind, ColumnSpec, Dataset, DatasetSchema};
use crate::utils;
use chrono::{NaiveDate, NaiveTime};
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim};

#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Null,
    Integer(i64),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Coordinates(f64, f64),
}

fn coerce(spec: &ColumnSpec, raw: &str) -> Result<FieldValue, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return if spec.nullable {
            Ok(FieldValue::Null)
        } else {
            Err("value is required".to_string())
        };
    }

    Ok(match spec.kind {
        ColumnKind::Integer => FieldValue::Integer(utils::parse_integer(raw)?),
        ColumnKind::Text => FieldValue::Text(raw.to_string()),
        ColumnKind::Date => FieldValue::Date(
            utils::parse_strict_date(raw)
                .ok_or_else(|| format!("'{}' is not a YYYY-MM-DD date", raw))?,
        ),
        ColumnKind::Time => FieldValue::Time(utils::parse_time(raw)?),
        ColumnKind::Coordinates => {
            let (lat, lng) = utils::parse_coordinates(raw)?;
            FieldValue::Coordinates(lat, lng)
        }
    })
}

/// One data row coerced against its schema, addressed by column name.
struct Row {
    schema: &'static DatasetSchema,
    values: Vec<FieldValue>,
}

impl Row {
    fn value(&self, name: &str) -> Result<&FieldValue, String> {
        self.schema
            .columns
            .iter()
            .position(|c| c.name == name)
            .map(|idx| &self.values[idx])
            .ok_or_else(|| format!("column '{}' is not part of the schema", name))
    }

    fn integer(&self, name: &str) -> Result<i64, String> {
        match self.value(name)? {
            FieldValue::Integer(v) => Ok(*v),
            other => Err(mismatch(name, "integer", other)),
        }
    }

    fn integer_in(&self, name: &str, min: i64, max: i64) -> Result<i64, String> {
        let value = self.integer(name)?;
        if value < min || value > max {
            return Err(format!(
                "column '{}': {} is outside the range {}..={}",
                name, value, min, max
            ));
        }
        Ok(value)
    }

    fn text(&self, name: &str) -> Result<String, String> {
        match self.opt_text(name)? {
            Some(v) => Ok(v),
            None => Err(format!("column '{}': value is required", name)),
        }
    }

    fn opt_text(&self, name: &str) -> Result<Option<String>, String> {
        match self.value(name)? {
            FieldValue::Text(v) => Ok(Some(v.clone())),
            FieldValue::Null => Ok(None),
            other => Err(mismatch(name, "text", other)),
        }
    }

    fn date(&self, name: &str) -> Result<NaiveDate, String> {
        match self.value(name)? {
            FieldValue::Date(v) => Ok(*v),
            other => Err(mismatch(name, "date", other)),
        }
    }

    fn time(&self, name: &str) -> Result<NaiveTime, String> {
        match self.value(name)? {
            FieldValue::Time(v) => Ok(*v),
            other => Err(mismatch(name, "time", other)),
        }
    }

    fn coordinates(&self, name: &str) -> Result<(f64, f64), String> {
        match self.value(name)? {
            FieldValue::Coordinates(lat, lng) => Ok((*lat, *lng)),
            other => Err(mismatch(name, "coordinates", other)),
        }
    }
}

fn mismatch(name: &str, expected: &str, found: &FieldValue) -> String {
    format!("column '{}': expected {}, found {:?}", name, expected, found)
}

fn build_record(dataset: Dataset, row: &Row) -> Result<Record, String> {
    match dataset {
        Dataset::Transactions => {
            let date = row.date("date")?;
            let hour = row.integer_in("hour", 0, 23)?;
            let minute = row.integer_in("minute", 0, 59)?;
            let transaction_time = date
                .and_hms_opt(hour as u32, minute as u32, 0)
                .ok_or_else(|| format!("{} {}:{} is not a valid time", date, hour, minute))?;

            Ok(Record::Transaction(TransactionRecord {
                transaction_id: row.integer("transaction_id")?,
                client_id: row.integer("client_id")?,
                product_id: row.integer("product_id")?,
                store_id: row.integer("store_id")?,
                transaction_time,
                quantity: row.integer_in("quantity", 1, i64::MAX)?,
            }))
        }
        Dataset::Clients => Ok(Record::Client(ClientRecord {
            id: row.integer("id")?,
            name: row.text("name")?,
            job: row.opt_text("job")?,
            email: row.opt_text("email")?,
            account_id: row.text("account_id")?,
        })),
        Dataset::Products => Ok(Record::Product(ProductRecord {
            id: row.integer("id")?,
            // EAN-13 at most
            ean: row.integer_in("ean", 0, 9_999_999_999_999)?,
            brand: row.opt_text("brand")?,
            description: row.opt_text("description")?,
        })),
        Dataset::Stores => {
            let (latitude, longitude) = row.coordinates("latlng")?;
            Ok(Record::Store(StoreRecord {
                id: row.integer("id")?,
                latitude,
                longitude,
                opening: row.time("opening")?,
                closing: row.time("closing")?,
                store_type: row.text("type")?,
            }))
        }
    }
}

/// Rejects exports whose first line is a comment instead of a header
fn check_header_line(bytes: &[u8]) -> Result<(), String> {
    let first = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let first = String::from_utf8_lossy(first);
    let first = first.trim();
    if first.starts_with('#') || first.to_lowercase().contains("this file contains") {
        return Err(format!(
            "first line looks like a comment, not a header: '{}'",
            first
        ));
    }
    Ok(())
}

/// Lazily decodes the records of one payload.
///
/// The reader borrows the payload, so it can be rebuilt from the same bytes to
/// restart the sequence. It stops after the first error.
pub struct RecordReader<'a> {
    blob: &'a BlobReference,
    schema: &'static DatasetSchema,
    positions: Vec<usize>,
    records: StringRecordsIntoIter<&'a [u8]>,
    row: usize,
    done: bool,
}

impl<'a> RecordReader<'a> {
    pub fn new(blob: &'a BlobReference, payload: &'a RawPayload) -> IngestResult<Self> {
        let header_error = |reason: String| IngestError::Parse {
            blob: blob.name.clone(),
            row: 0,
            reason: format!("header: {}", reason),
        };

        let dataset = Dataset::from_file_name(blob.file_name()).ok_or_else(|| {
            header_error(format!("no schema declared for '{}'", blob.file_name()))
        })?;
        let schema = dataset.schema();

        check_header_line(payload.bytes()).map_err(header_error)?;

        let mut reader = ReaderBuilder::new()
            .delimiter(schema.delimiter)
            .has_headers(true)
            .trim(Trim::All)
            .from_reader(payload.bytes());

        let headers = reader
            .headers()
            .map_err(|e| header_error(e.to_string()))?
            .clone();
        let positions = schema
            .resolve_header(headers.iter())
            .map_err(header_error)?;

        Ok(Self {
            blob,
            schema,
            positions,
            records: reader.into_records(),
            row: 0,
            done: false,
        })
    }

    pub fn dataset(&self) -> Dataset {
        self.schema.dataset
    }

    fn decode(&self, raw: &StringRecord) -> Result<Record, String> {
        let mut values = Vec::with_capacity(self.positions.len());
        for (spec, &idx) in self.schema.columns.iter().zip(&self.positions) {
            let field = raw.get(idx).unwrap_or_default();
            let value = coerce(spec, field).map_err(|e| format!("column '{}': {}", spec.name, e))?;
            values.push(value);
        }
        let row = Row {
            schema: self.schema,
            values,
        };
        build_record(self.schema.dataset, &row)
    }
}

impl Iterator for RecordReader<'_> {
    type Item = IngestResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let row = self.row;
        let result = match self.records.next()? {
            Ok(raw) => self.decode(&raw),
            Err(e) => Err(e.to_string()),
        };
        self.row += 1;

        Some(result.map_err(|reason| {
            self.done = true;
            IngestError::Parse {
                blob: self.blob.name.clone(),
                row,
                reason,
            }
        }))
    }
}

/// Parses a whole blob, discarding everything if any row is invalid
pub fn parse_blob(blob: &BlobReference, payload: &RawPayload) -> IngestResult<Vec<Record>> {
    RecordReader::new(blob, payload)?.collect()
}
