//! Record batch reading for footprint datasets.
//!
//! Datasets are read in bounded batches so only one batch of rows is resident
//! at a time.
//!
//! Supported inputs:
//! - CSV with a header row, read record by record with the `csv` crate. Every
//!   field is kept as text and coerced later. A record with the wrong number of
//!   fields or invalid UTF-8 becomes a malformed [`Row`] that is dropped and
//!   counted; the records around it are unaffected.
//! - Parquet / GeoParquet through the Arrow reader, with numeric or text
//!   attributes and a WKT (text) or WKB (binary) geometry column. Each
//!   `RecordBatch` is converted to owned rows right away.

use std::fs::File;
use std::path::Path;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float32Type, Float64Type, Int32Type, Int64Type, UInt32Type, UInt64Type};
use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field};
use csv::ByteRecord;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};

use crate::{Error, Result};

pub const GEOMETRY_COLUMN: &str = "geometry";
pub const AREA_COLUMN: &str = "area_in_meters";
pub const CONFIDENCE_COLUMN: &str = "confidence";
pub const PLUS_CODE_COLUMN: &str = "full_plus_code";

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Raw geometry cell as found in the input.
#[derive(Debug, Clone, PartialEq)]
pub enum RawGeometry {
    Wkt(String),
    Wkb(Vec<u8>),
    Missing,
}

/// Raw attribute cell as found in the input.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Missing,
}

impl RawValue {
    /// Coerce to a finite float. Text is trimmed and parsed.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            RawValue::Number(n) => *n,
            RawValue::Text(s) => s.trim().parse::<f64>().ok()?,
            RawValue::Missing => return None,
        };
        value.is_finite().then_some(value)
    }

    /// Coerce to text. Numbers use their shortest round-trip formatting.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RawValue::Number(n) if n.is_finite() => Some(n.to_string()),
            RawValue::Number(_) => None,
            RawValue::Text(s) => Some(s.clone()),
            RawValue::Missing => None,
        }
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

/// One input record.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Zero-based position in the input; orders features inside a tile
    pub index: usize,
    pub geometry: RawGeometry,
    pub area_in_meters: RawValue,
    pub confidence: RawValue,
    pub full_plus_code: RawValue,
    /// Why the record could not be split into fields, if it could not
    pub malformed: Option<String>,
}

impl Row {
    /// Build a row from WKT text and attribute values.
    pub fn from_wkt(
        index: usize,
        wkt: &str,
        area_in_meters: impl Into<RawValue>,
        confidence: impl Into<RawValue>,
        full_plus_code: impl Into<RawValue>,
    ) -> Self {
        Self {
            index,
            geometry: RawGeometry::Wkt(wkt.to_string()),
            area_in_meters: area_in_meters.into(),
            confidence: confidence.into(),
            full_plus_code: full_plus_code.into(),
            malformed: None,
        }
    }

    /// A record that was read but could not be parsed.
    pub fn malformed(index: usize, problem: String) -> Self {
        Self {
            index,
            geometry: RawGeometry::Missing,
            area_in_meters: RawValue::Missing,
            confidence: RawValue::Missing,
            full_plus_code: RawValue::Missing,
            malformed: Some(problem),
        }
    }
}

/// Input file format, chosen from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    Parquet,
}

impl InputFormat {
    /// Detect the format from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("csv") => Ok(InputFormat::Csv),
            Some("parquet") | Some("geoparquet") => Ok(InputFormat::Parquet),
            _ => Err(Error::InvalidConfig(format!(
                "Unsupported input format (expected .csv or .parquet): {}",
                path.display()
            ))),
        }
    }
}

/// Iterator over batches of [`Row`]s read from a dataset file.
pub struct RowBatches {
    inner: Box<dyn Iterator<Item = Result<Vec<Row>>>>,
}

impl Iterator for RowBatches {
    type Item = Result<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Open a dataset for batch-wise reading.
///
/// Missing files, unknown extensions and unreadable headers are reported here,
/// as are missing CSV columns; missing Parquet columns surface with the first
/// batch.
pub fn open_row_batches(path: &Path, batch_size: usize) -> Result<RowBatches> {
    if !path.exists() {
        return Err(Error::InputRead(format!(
            "Input file does not exist: {}",
            path.display()
        )));
    }
    if batch_size == 0 {
        return Err(Error::InvalidConfig("batch size must be at least 1".to_string()));
    }

    let inner: Box<dyn Iterator<Item = Result<Vec<Row>>>> = match InputFormat::from_path(path)? {
        InputFormat::Csv => Box::new(CsvBatches::open(path, batch_size)?),
        InputFormat::Parquet => Box::new(ParquetBatches::open(path, batch_size)?),
    };

    Ok(RowBatches { inner })
}

/// Position of the geometry column: `geometry`, else the first name containing `geom`.
fn geometry_column_index<'a>(names: impl Iterator<Item = &'a str> + Clone) -> Option<usize> {
    names
        .clone()
        .position(|name| name == GEOMETRY_COLUMN)
        .or_else(|| names.clone().position(|name| name.contains("geom")))
}

/// Field positions of the columns a CSV row is built from.
#[derive(Debug, Clone, Copy)]
struct CsvColumns {
    width: usize,
    geometry: usize,
    area: usize,
    confidence: usize,
    plus_code: usize,
}

impl CsvColumns {
    fn from_header(header: &ByteRecord) -> Result<Self> {
        let names: Vec<String> = header
            .iter()
            .map(|name| String::from_utf8_lossy(name).trim().to_string())
            .collect();

        let find = |column: &str| {
            names
                .iter()
                .position(|name| name == column)
                .ok_or_else(|| Error::InputRead(format!("Missing required column: {}", column)))
        };

        Ok(Self {
            width: names.len(),
            geometry: geometry_column_index(names.iter().map(String::as_str))
                .ok_or_else(|| Error::InputRead("No geometry column found".to_string()))?,
            area: find(AREA_COLUMN)?,
            confidence: find(CONFIDENCE_COLUMN)?,
            plus_code: find(PLUS_CODE_COLUMN)?,
        })
    }

    fn row(&self, index: usize, record: &ByteRecord) -> Row {
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        if record.len() != self.width {
            return Row::malformed(
                index,
                format!(
                    "line {}: expected {} fields, found {}",
                    line,
                    self.width,
                    record.len()
                ),
            );
        }
        if let Err(e) = std::str::from_utf8(record.as_slice()) {
            return Row::malformed(index, format!("line {}: invalid UTF-8: {}", line, e));
        }

        let text = |idx: usize| {
            record
                .get(idx)
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
                .filter(|value| !value.is_empty())
        };

        Row {
            index,
            geometry: text(self.geometry)
                .map(|wkt| RawGeometry::Wkt(wkt.to_string()))
                .unwrap_or(RawGeometry::Missing),
            area_in_meters: text(self.area).map(RawValue::from).unwrap_or(RawValue::Missing),
            confidence: text(self.confidence)
                .map(RawValue::from)
                .unwrap_or(RawValue::Missing),
            full_plus_code: text(self.plus_code)
                .map(RawValue::from)
                .unwrap_or(RawValue::Missing),
            malformed: None,
        }
    }
}

/// CSV records in batches of at most `batch_size` rows.
struct CsvBatches {
    reader: csv::Reader<File>,
    columns: CsvColumns,
    record: ByteRecord,
    batch_size: usize,
    row_offset: usize,
    finished: bool,
}

impl CsvBatches {
    fn open(path: &Path, batch_size: usize) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::InputRead(format!("Failed to open: {}", e)))?;

        // Ragged records are reported per row instead of failing the reader.
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let header = reader
            .byte_headers()
            .map_err(|e| Error::InputRead(format!("Failed to read CSV header: {}", e)))?
            .clone();
        let columns = CsvColumns::from_header(&header)?;

        Ok(Self {
            reader,
            columns,
            record: ByteRecord::new(),
            batch_size,
            row_offset: 0,
            finished: false,
        })
    }
}

impl Iterator for CsvBatches {
    type Item = Result<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut rows = Vec::new();
        while rows.len() < self.batch_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {
                    let index = self.row_offset + rows.len();
                    rows.push(self.columns.row(index, &self.record));
                }
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(Error::InputRead(format!(
                        "Failed to read CSV record: {}",
                        e
                    ))));
                }
            }
        }

        self.row_offset += rows.len();
        if rows.is_empty() {
            None
        } else {
            Some(Ok(rows))
        }
    }
}

/// Parquet record batches converted to rows.
struct ParquetBatches {
    reader: ParquetRecordBatchReader,
    row_offset: usize,
}

impl ParquetBatches {
    fn open(path: &Path, batch_size: usize) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::InputRead(format!("Failed to open: {}", e)))?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::InputRead(format!("Failed to create reader: {}", e)))?
            .with_batch_size(batch_size)
            .build()
            .map_err(|e| Error::InputRead(format!("Failed to build reader: {}", e)))?;

        Ok(Self {
            reader,
            row_offset: 0,
        })
    }
}

impl Iterator for ParquetBatches {
    type Item = Result<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = match self.reader.next()? {
            Ok(batch) => batch,
            Err(e) => {
                return Some(Err(Error::InputRead(format!(
                    "Failed to read batch: {}",
                    e
                ))))
            }
        };

        let rows = rows_from_batch(&batch, self.row_offset);
        self.row_offset += batch.num_rows();
        Some(rows)
    }
}

/// Convert one Arrow batch into owned rows.
pub fn rows_from_batch(batch: &RecordBatch, row_offset: usize) -> Result<Vec<Row>> {
    let schema = batch.schema();

    let geom_idx = geometry_column_index(schema.fields().iter().map(|f| f.name().as_str()))
        .ok_or_else(|| Error::InputRead("No geometry column found".to_string()))?;
    check_geometry_type(schema.field(geom_idx))?;

    let geometry = batch.column(geom_idx);
    let area = attribute_column(batch, AREA_COLUMN)?;
    let confidence = attribute_column(batch, CONFIDENCE_COLUMN)?;
    let plus_code = attribute_column(batch, PLUS_CODE_COLUMN)?;

    Ok((0..batch.num_rows())
        .map(|i| Row {
            index: row_offset + i,
            geometry: raw_geometry(geometry, i),
            area_in_meters: raw_value(area, i),
            confidence: raw_value(confidence, i),
            full_plus_code: raw_value(plus_code, i),
            malformed: None,
        })
        .collect())
}

fn attribute_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    let schema = batch.schema_ref();
    let idx = schema
        .index_of(name)
        .map_err(|_| Error::InputRead(format!("Missing required column: {}", name)))?;
    check_attribute_type(schema.field(idx))?;
    Ok(batch.column(idx))
}

fn check_geometry_type(field: &Field) -> Result<()> {
    match field.data_type() {
        DataType::Utf8
        | DataType::LargeUtf8
        | DataType::Utf8View
        | DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView => Ok(()),
        other => Err(Error::InputRead(format!(
            "Unsupported type {} for geometry column {}",
            other,
            field.name()
        ))),
    }
}

fn check_attribute_type(field: &Field) -> Result<()> {
    match field.data_type() {
        DataType::Utf8
        | DataType::LargeUtf8
        | DataType::Utf8View
        | DataType::Float64
        | DataType::Float32
        | DataType::Int64
        | DataType::Int32
        | DataType::UInt64
        | DataType::UInt32 => Ok(()),
        other => Err(Error::InputRead(format!(
            "Unsupported type {} for column {}",
            other,
            field.name()
        ))),
    }
}

fn raw_geometry(array: &ArrayRef, row: usize) -> RawGeometry {
    if array.is_null(row) {
        return RawGeometry::Missing;
    }

    match array.data_type() {
        DataType::Utf8 => RawGeometry::Wkt(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => RawGeometry::Wkt(array.as_string::<i64>().value(row).to_string()),
        DataType::Utf8View => RawGeometry::Wkt(array.as_string_view().value(row).to_string()),
        DataType::Binary => RawGeometry::Wkb(array.as_binary::<i32>().value(row).to_vec()),
        DataType::LargeBinary => RawGeometry::Wkb(array.as_binary::<i64>().value(row).to_vec()),
        DataType::BinaryView => RawGeometry::Wkb(array.as_binary_view().value(row).to_vec()),
        _ => RawGeometry::Missing,
    }
}

fn raw_value(array: &ArrayRef, row: usize) -> RawValue {
    if array.is_null(row) {
        return RawValue::Missing;
    }

    match array.data_type() {
        DataType::Float64 => RawValue::Number(array.as_primitive::<Float64Type>().value(row)),
        DataType::Float32 => {
            RawValue::Number(array.as_primitive::<Float32Type>().value(row) as f64)
        }
        DataType::Int64 => RawValue::Number(array.as_primitive::<Int64Type>().value(row) as f64),
        DataType::Int32 => RawValue::Number(array.as_primitive::<Int32Type>().value(row) as f64),
        DataType::UInt64 => {
            RawValue::Number(array.as_primitive::<UInt64Type>().value(row) as f64)
        }
        DataType::UInt32 => {
            RawValue::Number(array.as_primitive::<UInt32Type>().value(row) as f64)
        }
        DataType::Utf8 => RawValue::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => RawValue::Text(array.as_string::<i64>().value(row).to_string()),
        DataType::Utf8View => RawValue::Text(array.as_string_view().value(row).to_string()),
        _ => RawValue::Missing,
    }
}
