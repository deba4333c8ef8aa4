use crate::catalog::{Column, DataType, Schema};
use crate::error::{OmnidexError, OmnidexResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Padding added on top of the maximum observed field length so later
/// inserts of slightly longer values still fit their slot.
const WIDTH_MARGIN: usize = 8;

/// The ingestion collaborators hand the engine a header list and a row
/// iterator; nothing in the core depends on where rows come from.
pub trait RowSource {
    fn headers(&self) -> &[String];
    fn next_row(&mut self) -> OmnidexResult<Option<Vec<String>>>;
}

/// Delimited-text source with a header row.
pub struct CsvSource {
    headers: Vec<String>,
    reader: csv::Reader<std::fs::File>,
}

impl CsvSource {
    pub fn open(path: &Path) -> OmnidexResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|err| OmnidexError::Build(format!("cannot read {:?}: {}", path, err)))?;
        let headers = reader
            .headers()
            .map_err(|err| OmnidexError::Build(format!("bad header row in {:?}: {}", path, err)))?
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        Ok(CsvSource { headers, reader })
    }
}

impl RowSource for CsvSource {
    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn next_row(&mut self) -> OmnidexResult<Option<Vec<String>>> {
        let mut record = csv::StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(true) => Ok(Some(record.iter().map(|f| f.to_string()).collect())),
            Ok(false) => Ok(None),
            Err(err) => Err(OmnidexError::Build(format!("csv read failed: {}", err))),
        }
    }
}

/// Drain a source into memory; width inference needs the full pass anyway.
pub fn collect_rows(source: &mut dyn RowSource) -> OmnidexResult<(Vec<String>, Vec<Vec<String>>)> {
    let headers = source.headers().to_vec();
    if headers.is_empty() {
        return Err(OmnidexError::Build("source has no header row".to_string()));
    }
    let mut rows = Vec::new();
    while let Some(row) = source.next_row()? {
        rows.push(row);
    }
    Ok((headers, rows))
}

fn is_geo_pair(value: &str) -> bool {
    let mut parts = value.split(',');
    let ok = |p: Option<&str>| p.map(str::trim).is_some_and(|p| p.parse::<f64>().is_ok());
    ok(parts.next()) && ok(parts.next()) && parts.next().is_none()
}

/// Recover declared types and slot widths from the observed data: a column
/// is Int/Float/Geo2d only when every non-empty value parses as one.
pub fn infer_schema(headers: &[String], rows: &[Vec<String>]) -> Schema {
    let mut columns = Vec::with_capacity(headers.len());
    for (idx, header) in headers.iter().enumerate() {
        let mut max_len = 1usize;
        let mut any_value = false;
        let (mut all_int, mut all_float, mut all_geo) = (true, true, true);
        for row in rows {
            let value = row.get(idx).map(String::as_str).unwrap_or("").trim();
            max_len = max_len.max(value.len());
            if value.is_empty() {
                continue;
            }
            any_value = true;
            all_int &= value.parse::<i64>().is_ok();
            all_float &= value.parse::<f64>().is_ok();
            all_geo &= is_geo_pair(value);
        }
        let data_type = if !any_value {
            DataType::Text
        } else if all_int {
            DataType::Int
        } else if all_float {
            DataType::Float
        } else if all_geo {
            DataType::Geo2d
        } else {
            DataType::Text
        };
        columns.push(Column::new(header.clone(), data_type, max_len + WIDTH_MARGIN));
    }
    Schema::new(columns)
}

/// Delegated synthetic-row generator for `INSERT INTO t GENERATE_DATA(n)`.
/// Int columns count up from `start` so generated keys stay unique.
pub fn synthetic_rows(schema: &Schema, count: usize, start: u64) -> Vec<Vec<String>> {
    let mut rng = StdRng::seed_from_u64(start.wrapping_mul(0x9E37_79B9).wrapping_add(count as u64));
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let mut row = Vec::with_capacity(schema.column_count());
        for column in &schema.columns {
            let value = match column.data_type {
                DataType::Int => (start + i as u64).to_string(),
                DataType::Float => format!("{:.2}", rng.gen_range(0.0..1000.0)),
                DataType::Geo2d => format!(
                    "{:.4},{:.4}",
                    rng.gen_range(-90.0..90.0),
                    rng.gen_range(-180.0..180.0)
                ),
                DataType::Text => {
                    let len = 8.min(column.width.saturating_sub(1)).max(1);
                    (0..len)
                        .map(|_| {
                            let c = rng.gen_range(0..36u32);
                            char::from_digit(c, 36).expect("radix 36 digit")
                        })
                        .collect()
                }
            };
            row.push(value);
        }
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_csv(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn csv_source_yields_headers_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            dir.path(),
            "t.csv",
            "Id,Name,Score\n1,ana,9.5\n2,benito,8.0\n",
        );
        let mut source = CsvSource::open(&path).unwrap();
        let (headers, rows) = collect_rows(&mut source).unwrap();
        assert_eq!(headers, vec!["id", "name", "score"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["2", "benito", "8.0"]);
    }

    #[test]
    fn schema_inference_recovers_types_and_widths() {
        let headers: Vec<String> = ["id", "name", "score", "loc"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = vec![
            vec![
                "1".to_string(),
                "ana".to_string(),
                "9.5".to_string(),
                "47.60,-122.33".to_string(),
            ],
            vec![
                "2".to_string(),
                "benito".to_string(),
                "8".to_string(),
                "48.00,-121.00".to_string(),
            ],
        ];
        let schema = infer_schema(&headers, &rows);
        assert_eq!(schema.columns[0].data_type, DataType::Int);
        assert_eq!(schema.columns[1].data_type, DataType::Text);
        assert_eq!(schema.columns[2].data_type, DataType::Float);
        assert_eq!(schema.columns[3].data_type, DataType::Geo2d);
        assert_eq!(schema.columns[1].width, "benito".len() + WIDTH_MARGIN);
    }

    #[test]
    fn empty_columns_default_to_text() {
        let headers = vec!["a".to_string()];
        let rows = vec![vec!["".to_string()], vec!["  ".to_string()]];
        let schema = infer_schema(&headers, &rows);
        assert_eq!(schema.columns[0].data_type, DataType::Text);
    }

    #[test]
    fn synthetic_rows_fit_the_schema() {
        let schema = Schema::new(vec![
            Column::new("id", DataType::Int, 16),
            Column::new("name", DataType::Text, 12),
            Column::new("score", DataType::Float, 12),
        ]);
        let rows = synthetic_rows(&schema, 5, 100);
        assert_eq!(rows.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row[0], (100 + i as u64).to_string());
            assert!(row[1].len() <= 12);
            assert!(row[2].parse::<f64>().is_ok());
        }
    }
}
