//! External file scan (CSV), source-style operator.
//!
//! Each instance owns a list of assigned files and emits their batches in
//! order. Compressed inputs are detected by extension at planning time and
//! routed through a single funnel scope; the codec itself is engine-side
//! work this operator does not implement.

use std::fs::File;
use std::sync::Arc;

use arrow::csv;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use tidal_common::{Result, TidalError};
use tidal_plan::TableDef;

use crate::batch::Batch;
use crate::process::Process;

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// External scan operator argument.
pub struct ExternalArg {
    /// Files assigned to this instance.
    pub files: Vec<String>,
    /// Column layout of the external table.
    pub table_def: TableDef,
    /// Rows per emitted batch.
    pub batch_rows: usize,
    next_file: usize,
    reader: Option<csv::Reader<File>>,
}

impl ExternalArg {
    /// Scan over `files` with the given layout.
    pub fn new(files: Vec<String>, table_def: TableDef, batch_rows: usize) -> Self {
        Self {
            files,
            table_def,
            batch_rows: batch_rows.max(1),
            next_file: 0,
            reader: None,
        }
    }

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.table_def
                .cols
                .iter()
                .map(|c| Field::new(&c.name, c.data_type.clone(), !c.not_null))
                .collect::<Vec<_>>(),
        ))
    }

    fn open_next(&mut self) -> Result<bool> {
        loop {
            let Some(path) = self.files.get(self.next_file) else {
                return Ok(false);
            };
            self.next_file += 1;
            if path.ends_with(".gz") || path.ends_with(".zst") || path.ends_with(".bz2") {
                return Err(TidalError::Nyi(format!(
                    "compressed external scan codec for '{path}'"
                )));
            }
            let file = File::open(path)
                .map_err(|e| execution(format!("open external file '{path}': {e}")))?;
            let reader = csv::ReaderBuilder::new(self.schema())
                .with_header(false)
                .with_batch_size(self.batch_rows)
                .build(file)
                .map_err(|e| execution(format!("csv reader for '{path}': {e}")))?;
            self.reader = Some(reader);
            return Ok(true);
        }
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if self.reader.is_none() && !self.open_next()? {
                return Ok(None);
            }
            let reader = self.reader.as_mut().expect("open");
            match reader.next() {
                Some(Ok(batch)) => return Ok(Some(batch)),
                Some(Err(e)) => return Err(execution(format!("csv decode failed: {e}"))),
                None => self.reader = None,
            }
        }
    }

    /// Emit the next file chunk; `end` once every assigned file is drained.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_last: bool,
    ) -> Result<bool> {
        let mut anal = proc.analyze(idx);
        anal.start();
        let out = self.next_batch()?;
        anal.stop();
        match out {
            Some(data) => {
                anal.scan(data.get_array_memory_size() as i64);
                let batch = Batch::new(&proc.pool, data)?;
                anal.output(&batch, is_last);
                proc.set_input(Some(batch));
                Ok(false)
            }
            None => {
                proc.set_input(None);
                Ok(true)
            }
        }
    }

    /// Close any open reader.
    pub fn free(&mut self, _failed: bool) {
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::DataType;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tidal_common::MemoryPool;
    use tidal_engine::Timestamp;
    use tidal_plan::ColDef;

    fn temp_csv(content: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("tidal_extern_{nanos}.csv"));
        let mut f = File::create(&path).expect("create");
        write!(f, "{content}").expect("write");
        path
    }

    #[tokio::test]
    async fn reads_csv_rows() {
        let path = temp_csv("1,10\n2,20\n3,30\n");
        let def = TableDef {
            name: "ext".to_string(),
            cols: vec![
                ColDef::new("a", DataType::Int64),
                ColDef::new("b", DataType::Int64),
            ],
        };
        let mut arg = ExternalArg::new(vec![path.display().to_string()], def, 2);
        let mut proc = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);

        let mut rows = 0;
        loop {
            let end = arg.call(&mut proc, 0, true).await.expect("call");
            if let Some(batch) = proc.take_input() {
                let col = batch
                    .data()
                    .column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .expect("i64")
                    .clone();
                rows += col.len();
            }
            if end {
                break;
            }
        }
        assert_eq!(rows, 3);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn compressed_file_is_rejected() {
        let def = TableDef {
            name: "ext".to_string(),
            cols: vec![ColDef::new("a", DataType::Int64)],
        };
        let mut arg = ExternalArg::new(vec!["data.csv.gz".to_string()], def, 8);
        let mut proc = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);
        let err = arg.call(&mut proc, 0, true).await.expect_err("nyi");
        assert!(matches!(err, TidalError::Nyi(_)));
    }
}
