//! Fragment codecs.
//!
//! Two layouts share the same column order (see [`crate::schema`]):
//!
//! - **CSV**: a header line, then one comma-separated line per row. Floats are
//!   fixed-point with six decimals; strings are written verbatim and may not
//!   contain commas or line breaks.
//! - **Binary**: rows back to back, each field little-endian fixed width,
//!   strings as a `u32` byte length followed by UTF-8. No header and no
//!   delimiters; the row count is whatever the stream length yields.

use crate::column::Element;
use crate::schema::{COLUMN_NAMES, CSV_HEADER};
use crate::table::RecordTable;
use jr_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;

/// On-disk layout of a fragment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFormat {
    #[default]
    Csv,
    Binary,
}

impl StorageFormat {
    /// File extension used for fragments in this format.
    pub fn extension(self) -> &'static str {
        match self {
            StorageFormat::Csv => "csv",
            StorageFormat::Binary => "bin",
        }
    }

    /// Guess the format of an existing fragment from its extension.
    ///
    /// Anything that is not `.bin` is treated as CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("bin") => StorageFormat::Binary,
            _ => StorageFormat::Csv,
        }
    }
}

impl std::str::FromStr for StorageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(StorageFormat::Csv),
            "bin" | "binary" => Ok(StorageFormat::Binary),
            other => Err(Error::Config(format!("unknown storage format '{other}'"))),
        }
    }
}

impl RecordTable {
    /// Serialize the whole table.
    pub fn dump<W: Write>(&self, sink: &mut W, format: StorageFormat) -> Result<()> {
        self.check_consistent()?;
        match format {
            StorageFormat::Csv => {
                writeln!(sink, "{CSV_HEADER}")?;
                self.dump_csv_rows(sink)
            }
            StorageFormat::Binary => self.dump_binary(sink),
        }
    }

    /// Serialize rows only. For CSV this omits the header line, which is what
    /// appending to an existing shared file needs.
    pub fn dump_rows<W: Write>(&self, sink: &mut W, format: StorageFormat) -> Result<()> {
        self.check_consistent()?;
        match format {
            StorageFormat::Csv => self.dump_csv_rows(sink),
            StorageFormat::Binary => self.dump_binary(sink),
        }
    }

    fn dump_binary<W: Write>(&self, sink: &mut W) -> Result<()> {
        for i in 0..self.len() {
            self.write_row(sink, i)?;
        }
        sink.flush()?;
        Ok(())
    }

    /// CSV rows without the header line.
    pub fn dump_csv_rows<W: Write>(&self, sink: &mut W) -> Result<()> {
        for i in 0..self.len() {
            let fields = [
                self.job_id[i].to_field()?,
                self.step_id[i].to_field()?,
                self.user[i].to_field()?,
                self.account[i].to_field()?,
                self.num_nodes[i].to_field()?,
                self.host[i].to_field()?,
                self.gpu_id[i].to_field()?,
                self.power_usage_min[i].to_field()?,
                self.power_usage_max[i].to_field()?,
                self.power_usage_avg[i].to_field()?,
                self.start_time[i].to_field()?,
                self.end_time[i].to_field()?,
                self.sm_utilization_min[i].to_field()?,
                self.sm_utilization_max[i].to_field()?,
                self.sm_utilization_avg[i].to_field()?,
                self.memory_utilization_min[i].to_field()?,
                self.memory_utilization_max[i].to_field()?,
                self.memory_utilization_avg[i].to_field()?,
            ];
            writeln!(sink, "{}", fields.join(","))?;
        }
        sink.flush()?;
        Ok(())
    }

    /// Parse a fragment and append its rows.
    ///
    /// All or nothing: rows are decoded into a scratch table first, so a
    /// failure leaves `self` unchanged.
    pub fn load<R: BufRead>(&mut self, source: &mut R, format: StorageFormat) -> Result<usize> {
        let mut scratch = RecordTable::new();
        match format {
            StorageFormat::Csv => scratch.load_csv(source)?,
            StorageFormat::Binary => scratch.load_binary(source)?,
        }
        scratch.check_consistent()?;
        self.extend(&scratch);
        Ok(scratch.len())
    }

    fn load_binary<R: BufRead>(&mut self, source: &mut R) -> Result<()> {
        // A clean end of stream is only legal on a row boundary.
        while !source.fill_buf()?.is_empty() {
            self.read_row(source)?;
        }
        Ok(())
    }

    fn load_csv<R: BufRead>(&mut self, source: &mut R) -> Result<()> {
        let mut lines = source.lines();
        // The schema is fixed; the header text is not interpreted.
        if lines.next().transpose()?.is_none() {
            return Ok(());
        }
        for (idx, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let line_no = idx + 2;
            self.push_csv_line(&line)
                .map_err(|e| Error::Decode(format!("line {line_no}: {e}")))?;
        }
        Ok(())
    }

    fn push_csv_line(&mut self, line: &str) -> Result<()> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != COLUMN_NAMES.len() {
            return Err(Error::Decode(format!(
                "expected {} fields, got {}",
                COLUMN_NAMES.len(),
                fields.len()
            )));
        }
        // Parse every field before touching any column so a bad line never
        // leaves the columns with unequal lengths.
        let job_id = u32::parse_field(fields[0])?;
        let step_id = u32::parse_field(fields[1])?;
        let user = String::parse_field(fields[2])?;
        let account = String::parse_field(fields[3])?;
        let num_nodes = u32::parse_field(fields[4])?;
        let host = String::parse_field(fields[5])?;
        let gpu_id = u32::parse_field(fields[6])?;
        let power_usage_min = f64::parse_field(fields[7])?;
        let power_usage_max = f64::parse_field(fields[8])?;
        let power_usage_avg = f64::parse_field(fields[9])?;
        let start_time = i64::parse_field(fields[10])?;
        let end_time = i64::parse_field(fields[11])?;
        let sm_utilization_min = i32::parse_field(fields[12])?;
        let sm_utilization_max = i32::parse_field(fields[13])?;
        let sm_utilization_avg = i32::parse_field(fields[14])?;
        let memory_utilization_min = i32::parse_field(fields[15])?;
        let memory_utilization_max = i32::parse_field(fields[16])?;
        let memory_utilization_avg = i32::parse_field(fields[17])?;

        self.job_id.push(job_id);
        self.step_id.push(step_id);
        self.user.push(user);
        self.account.push(account);
        self.num_nodes.push(num_nodes);
        self.host.push(host);
        self.gpu_id.push(gpu_id);
        self.power_usage_min.push(power_usage_min);
        self.power_usage_max.push(power_usage_max);
        self.power_usage_avg.push(power_usage_avg);
        self.start_time.push(start_time);
        self.end_time.push(end_time);
        self.sm_utilization_min.push(sm_utilization_min);
        self.sm_utilization_max.push(sm_utilization_max);
        self.sm_utilization_avg.push(sm_utilization_avg);
        self.memory_utilization_min.push(memory_utilization_min);
        self.memory_utilization_max.push(memory_utilization_max);
        self.memory_utilization_avg.push(memory_utilization_avg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::sample_row;
    use jr_math::measure::INT32_BLANK;
    use std::io::Cursor;

    fn table() -> RecordTable {
        let mut blank = sample_row("nid003", 2, 0.0);
        blank.power_usage.min = f64::NAN;
        blank.power_usage.max = f64::NAN;
        blank.power_usage.avg = f64::NAN;
        blank.sm_utilization.avg = INT32_BLANK;
        [
            sample_row("nid001", 0, 250.5),
            sample_row("nid001", 1, 300.25),
            blank,
        ]
        .into_iter()
        .collect()
    }

    fn assert_bit_identical(a: &RecordTable, b: &RecordTable) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.rows().zip(b.rows()) {
            assert_eq!(x.host, y.host);
            assert_eq!(x.gpu_id, y.gpu_id);
            assert_eq!(x.power_usage.min.to_bits(), y.power_usage.min.to_bits());
            assert_eq!(x.power_usage.max.to_bits(), y.power_usage.max.to_bits());
            assert_eq!(x.power_usage.avg.to_bits(), y.power_usage.avg.to_bits());
            assert_eq!(x.sm_utilization, y.sm_utilization);
            assert_eq!(x.start_time, y.start_time);
        }
    }

    #[test]
    fn test_binary_roundtrip_bit_identical() {
        let t = table();
        let mut buf = Vec::new();
        t.dump(&mut buf, StorageFormat::Binary).unwrap();
        let mut back = RecordTable::new();
        let n = back
            .load(&mut Cursor::new(buf), StorageFormat::Binary)
            .unwrap();
        assert_eq!(n, 3);
        assert_bit_identical(&t, &back);
    }

    #[test]
    fn test_csv_layout() {
        let t: RecordTable = [sample_row("nid001", 0, 250.5)].into_iter().collect();
        let mut buf = Vec::new();
        t.dump(&mut buf, StorageFormat::Csv).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(
            lines.next(),
            Some(
                "4242,0,alice,csstaff,2,nid001,0,240.500000,260.500000,250.500000,\
1717000000000000,1717000060000000,10,90,50,5,40,20"
            )
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_csv_roundtrip_with_sentinels() {
        let t = table();
        let mut buf = Vec::new();
        t.dump(&mut buf, StorageFormat::Csv).unwrap();
        let mut back = RecordTable::new();
        back.load(&mut Cursor::new(buf), StorageFormat::Csv).unwrap();
        let blank = back.row(2).unwrap();
        assert!(blank.power_usage.avg.is_nan());
        assert_eq!(blank.sm_utilization.avg, INT32_BLANK);
        assert_eq!(back.row(1).unwrap().power_usage.avg, 300.25);
    }

    #[test]
    fn test_csv_header_text_is_ignored() {
        let csv = "whatever,the,header,says\n\
1,2,bob,acct,1,host,0,1.0,2.0,1.5,10,20,1,2,3,4,5,6\n\n";
        let mut t = RecordTable::new();
        assert_eq!(t.load(&mut Cursor::new(csv), StorageFormat::Csv).unwrap(), 1);
        assert_eq!(t.row(0).unwrap().user, "bob");
    }

    #[test]
    fn test_csv_bad_field_fails_whole_load() {
        let csv = format!(
            "{CSV_HEADER}\n\
1,2,bob,acct,1,host,0,1.0,2.0,1.5,10,20,1,2,3,4,5,6\n\
1,2,bob,acct,1,host,1,1.0,2.0,oops,10,20,1,2,3,4,5,6\n"
        );
        let mut t: RecordTable = [sample_row("keep", 0, 1.0)].into_iter().collect();
        let err = t
            .load(&mut Cursor::new(csv), StorageFormat::Csv)
            .unwrap_err();
        assert!(err.to_string().contains("line 3"));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_csv_wrong_field_count() {
        let csv = format!("{CSV_HEADER}\n1,2,3\n");
        let mut t = RecordTable::new();
        assert!(matches!(
            t.load(&mut Cursor::new(csv), StorageFormat::Csv),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_csv_rejects_comma_in_string() {
        let t: RecordTable = [sample_row("bad,host", 0, 1.0)].into_iter().collect();
        assert!(matches!(
            t.dump(&mut Vec::new(), StorageFormat::Csv),
            Err(Error::Encode(_))
        ));
    }

    #[test]
    fn test_binary_truncated_row_is_error() {
        let t = table();
        let mut buf = Vec::new();
        t.dump(&mut buf, StorageFormat::Binary).unwrap();
        buf.truncate(buf.len() - 3);
        let mut back = RecordTable::new();
        assert!(matches!(
            back.load(&mut Cursor::new(buf), StorageFormat::Binary),
            Err(Error::Decode(_))
        ));
        assert!(back.is_empty());
    }

    #[test]
    fn test_empty_inputs() {
        let mut t = RecordTable::new();
        assert_eq!(t.load(&mut Cursor::new(""), StorageFormat::Csv).unwrap(), 0);
        assert_eq!(
            t.load(&mut Cursor::new(Vec::<u8>::new()), StorageFormat::Binary)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_rows_only_appends_cleanly() {
        let a: RecordTable = [sample_row("nid001", 0, 1.0)].into_iter().collect();
        let b: RecordTable = [sample_row("nid002", 0, 2.0)].into_iter().collect();
        let mut buf = Vec::new();
        a.dump(&mut buf, StorageFormat::Csv).unwrap();
        b.dump_rows(&mut buf, StorageFormat::Csv).unwrap();
        let mut back = RecordTable::new();
        assert_eq!(back.load(&mut Cursor::new(buf), StorageFormat::Csv).unwrap(), 2);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            StorageFormat::from_path(Path::new("step_0/proc_3.bin")),
            StorageFormat::Binary
        );
        assert_eq!(
            StorageFormat::from_path(Path::new("step_0/proc_3.csv")),
            StorageFormat::Csv
        );
        assert_eq!("binary".parse::<StorageFormat>().unwrap(), StorageFormat::Binary);
        assert!("xml".parse::<StorageFormat>().is_err());
    }
}
