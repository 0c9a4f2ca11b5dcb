//! Test result logging.
//!
//! Rows are appended to a CSV file while the run is in progress; `finalize` turns
//! that file into an `.xlsx` workbook and removes it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook};
use tracing::info;

use crate::error::{BenchError, Result};

/// Cell texts highlighted in green in the workbook.
pub const PASS_MARKERS: [&str; 1] = ["Test OK"];
/// Cell texts highlighted in red in the workbook.
pub const FAIL_MARKERS: [&str; 2] = ["Test NOK", "Exception occurs"];

/// Sink for the rows of a test report.
pub trait ResultLogger {
    /// Appends one row, one field per column.
    fn write_row(&mut self, fields: &[&str]) -> Result<()>;

    /// Ends the report under `sheet_name` and returns where it was written.
    fn finalize(&mut self, sheet_name: &str) -> Result<PathBuf>;
}

/// Appends rows to a CSV file and converts it to a workbook at the end of the run.
/// Rows may have any number of fields.
pub struct CsvLogger {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: usize,
    column_widths: Vec<f64>,
}

impl CsvLogger {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
        info!(path = %path.display(), "result log opened");
        Ok(Self {
            path,
            writer: Some(writer),
            rows: 0,
            column_widths: Vec::new(),
        })
    }

    /// Widths of the first columns of the workbook, in characters.
    pub fn with_column_widths(mut self, widths: &[f64]) -> Self {
        self.column_widths = widths.to_vec();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where `finalize` writes the workbook.
    pub fn workbook_path(&self) -> PathBuf {
        self.path.with_extension("xlsx")
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    fn writer(&mut self) -> Result<&mut csv::Writer<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| BenchError::Logger(format!("{} is already finalized", self.path.display())))
    }

    fn write_workbook(&self, sheet_name: &str, target: &Path) -> Result<()> {
        let base = Format::new()
            .set_align(FormatAlign::Right)
            .set_align(FormatAlign::VerticalCenter)
            .set_indent(1);
        let pass = base.clone().set_background_color(Color::Green);
        let fail = base.clone().set_background_color(Color::Red);

        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        if !sheet_name.is_empty() {
            worksheet.set_name(sheet_name)?;
        }
        for (col, width) in self.column_widths.iter().enumerate() {
            worksheet.set_column_width(col as u16, *width)?;
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)?;
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            for (col, field) in record.iter().enumerate() {
                let format = if PASS_MARKERS.contains(&field) {
                    &pass
                } else if FAIL_MARKERS.contains(&field) {
                    &fail
                } else {
                    &base
                };
                worksheet.write_string_with_format(row as u32, col as u16, field, format)?;
            }
        }

        workbook.save(target)?;
        Ok(())
    }
}

impl ResultLogger for CsvLogger {
    fn write_row(&mut self, fields: &[&str]) -> Result<()> {
        let writer = self.writer()?;
        writer.write_record(fields)?;
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    fn finalize(&mut self, sheet_name: &str) -> Result<PathBuf> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| BenchError::Logger(format!("{} is already finalized", self.path.display())))?;
        writer.flush()?;
        drop(writer);

        let target = self.workbook_path();
        self.write_workbook(sheet_name, &target)?;
        fs::remove_file(&self.path)?;
        info!(path = %target.display(), rows = self.rows, sheet = sheet_name, "result log finalized");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook, Data, Reader, Xlsx};

    fn text(value: &str) -> Data {
        Data::String(value.to_string())
    }

    #[test]
    fn rows_are_appended_with_any_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");

        let mut logger = CsvLogger::create(&path).unwrap();
        logger.write_row(&["1", "Relay C1", "OK"]).unwrap();
        logger.write_row(&["2", "V_OUT, 9 V", "8.97", "Test OK"]).unwrap();
        assert_eq!(logger.rows(), 2);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1,Relay C1,OK\n2,\"V_OUT, 9 V\",8.97,Test OK\n");
    }

    #[test]
    fn finalize_writes_a_named_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");

        let mut logger = CsvLogger::create(&path).unwrap().with_column_widths(&[5.0, 35.0, 15.0, 75.0]);
        logger.write_row(&["1", "Relay C1", "Test OK"]).unwrap();
        logger.write_row(&["2", "V_OUT, 9 V", "8.97", "Test NOK"]).unwrap();

        let written = logger.finalize("BMS3").unwrap();
        assert_eq!(written, dir.path().join("report.xlsx"));
        assert!(!path.exists());

        let mut workbook: Xlsx<_> = open_workbook(&written).unwrap();
        assert_eq!(workbook.sheet_names(), vec![String::from("BMS3")]);
        let sheet = workbook.worksheet_range("BMS3").unwrap();
        // Only the logged rows, every cell kept as text.
        assert_eq!(sheet.height(), 2);
        assert_eq!(sheet.get_value((0, 0)), Some(&text("1")));
        assert_eq!(sheet.get_value((0, 1)), Some(&text("Relay C1")));
        assert_eq!(sheet.get_value((0, 2)), Some(&text("Test OK")));
        assert_eq!(sheet.get_value((1, 1)), Some(&text("V_OUT, 9 V")));
        assert_eq!(sheet.get_value((1, 2)), Some(&text("8.97")));
        assert_eq!(sheet.get_value((1, 3)), Some(&text("Test NOK")));
    }

    #[test]
    fn finalize_keeps_nothing_of_the_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let mut logger = CsvLogger::create(&path).unwrap();
        let written = logger.finalize("run").unwrap();
        assert!(written.exists());
        assert!(!path.exists());
        let workbook: Xlsx<_> = open_workbook(&written).unwrap();
        assert_eq!(workbook.sheet_names(), vec![String::from("run")]);
    }

    #[test]
    fn rows_after_finalize_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = CsvLogger::create(dir.path().join("report.csv")).unwrap();
        logger.finalize("run").unwrap();
        assert!(matches!(logger.write_row(&["late"]), Err(BenchError::Logger(_))));
        assert!(matches!(logger.finalize("run"), Err(BenchError::Logger(_))));
    }

    #[test]
    fn existing_log_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        fs::write(&path, "previous\n").unwrap();
        let mut logger = CsvLogger::create(&path).unwrap();
        logger.write_row(&["next"]).unwrap();
        drop(logger);
        assert_eq!(fs::read_to_string(&path).unwrap(), "previous\nnext\n");
    }
}
