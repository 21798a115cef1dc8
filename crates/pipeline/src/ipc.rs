//! Arrow IPC stream serialization for batches crossing process boundaries
//! (remote dispatch payloads, per-block row-id payloads of distributed
//! deletes).

use std::io::Cursor;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use tidal_common::{Result, TidalError};

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// Serialize one batch as an Arrow IPC stream.
pub fn serialize_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut out, batch.schema().as_ref())
            .map_err(|e| execution(format!("ipc writer init failed: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| execution(format!("ipc write failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decode one batch from an Arrow IPC stream.
pub fn deserialize_batch(payload: &[u8]) -> Result<RecordBatch> {
    let reader = StreamReader::try_new(Cursor::new(payload), None)
        .map_err(|e| execution(format!("ipc reader init failed: {e}")))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| execution(format!("ipc decode failed: {e}")))?);
    }
    match batches.len() {
        1 => Ok(batches.remove(0)),
        n => Err(execution(format!("expected one ipc batch, found {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn round_trips_a_batch() {
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(vec![1_i64, 2, 3]))],
        )
        .expect("batch");
        let bytes = serialize_batch(&batch).expect("encode");
        let back = deserialize_batch(&bytes).expect("decode");
        assert_eq!(back.num_rows(), 3);
        assert_eq!(batch, back);
    }
}
