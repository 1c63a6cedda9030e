/// Spill run file codec
///
/// Layout, little-endian throughout:
///
/// ```text
/// magic "WSPL" | version u32 | channel_count u16 | type tag u8 per channel
/// row_count u64 | position_count u64 | page_count u32
/// per page: blob_len u64, blob (lz4 frame of a one-batch arrow IPC stream)
/// positions_len u64, varint-packed deltas of the position list
/// ```
///
/// Runs are written in already-sorted row order, so the position list is the
/// identity permutation; it is still written and verified on read. The format
/// is only stable within a single query run.
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::error::{EngineError, EngineResult};
use crate::page::Page;

pub const MAGIC: [u8; 4] = *b"WSPL";
pub const VERSION: u32 = 1;

pub fn type_tag(data_type: &DataType) -> EngineResult<u8> {
    match data_type {
        DataType::Int64 => Ok(0),
        DataType::Float64 => Ok(1),
        DataType::Boolean => Ok(2),
        DataType::Utf8 => Ok(3),
        DataType::Dictionary(key, value)
            if matches!(key.as_ref(), DataType::Int32)
                && matches!(value.as_ref(), DataType::Utf8) =>
        {
            Ok(4)
        }
        other => Err(EngineError::type_mismatch(format!(
            "unsupported spill column type {:?}",
            other
        ))),
    }
}

pub fn tag_type(tag: u8) -> EngineResult<DataType> {
    match tag {
        0 => Ok(DataType::Int64),
        1 => Ok(DataType::Float64),
        2 => Ok(DataType::Boolean),
        3 => Ok(DataType::Utf8),
        4 => Ok(DataType::Dictionary(
            Box::new(DataType::Int32),
            Box::new(DataType::Utf8),
        )),
        other => Err(EngineError::spill_io(format!(
            "unknown spill column type tag {}",
            other
        ))),
    }
}

pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

pub fn read_varint(bytes: &[u8], cursor: &mut usize) -> EngineResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*cursor)
            .ok_or_else(|| EngineError::spill_io("truncated varint in position list"))?;
        *cursor += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(EngineError::spill_io("varint overflow in position list"));
        }
    }
}

/// Channel-named schema for IPC serialization; channels have no user-visible
/// names, so synthetic ones are generated.
pub fn schema_for(types: &[DataType]) -> SchemaRef {
    let fields: Vec<Field> = types
        .iter()
        .enumerate()
        .map(|(channel, data_type)| Field::new(format!("c{channel}"), data_type.clone(), true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn io_error(path: &Path, context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::SpillIo {
        message: format!("{context}: {err}"),
        path: Some(path.to_string_lossy().to_string()),
        source_message: None,
    }
}

fn encode_page(schema: &SchemaRef, page: &Page) -> EngineResult<Vec<u8>> {
    let batch = RecordBatch::try_new(schema.clone(), page.columns().to_vec())?;
    let mut ipc = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut ipc, schema.as_ref())?;
        writer.write(&batch)?;
        writer.finish()?;
    }
    let mut encoder = lz4::EncoderBuilder::new()
        .level(4)
        .build(Vec::new())
        .map_err(|e| EngineError::spill_io(format!("lz4 encoder: {e}")))?;
    encoder
        .write_all(&ipc)
        .map_err(|e| EngineError::spill_io(format!("lz4 write: {e}")))?;
    let (compressed, result) = encoder.finish();
    result.map_err(|e| EngineError::spill_io(format!("lz4 finish: {e}")))?;
    Ok(compressed)
}

fn decode_page(blob: &[u8]) -> EngineResult<Page> {
    let mut decoder = lz4::Decoder::new(Cursor::new(blob))
        .map_err(|e| EngineError::spill_io(format!("lz4 decoder: {e}")))?;
    let mut ipc = Vec::new();
    decoder
        .read_to_end(&mut ipc)
        .map_err(|e| EngineError::spill_io(format!("lz4 read: {e}")))?;
    let mut reader = StreamReader::try_new(Cursor::new(ipc), None)?;
    let batch = reader
        .next()
        .ok_or_else(|| EngineError::spill_io("spill page blob holds no record batch"))??;
    Page::new(batch.columns().to_vec())
}

/// Serialize one sorted run. `pages` are the run's rows in stored order.
pub fn write_run(path: &Path, types: &[DataType], pages: &[Page]) -> EngineResult<()> {
    let row_count: u64 = pages.iter().map(|p| p.position_count() as u64).sum();
    let schema = schema_for(types);

    let file = File::create(path).map_err(|e| io_error(path, "create run file", e))?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&MAGIC).map_err(|e| io_error(path, "write header", e))?;
    writer
        .write_all(&VERSION.to_le_bytes())
        .map_err(|e| io_error(path, "write header", e))?;
    writer
        .write_all(&(types.len() as u16).to_le_bytes())
        .map_err(|e| io_error(path, "write header", e))?;
    for data_type in types {
        writer
            .write_all(&[type_tag(data_type)?])
            .map_err(|e| io_error(path, "write header", e))?;
    }
    writer
        .write_all(&row_count.to_le_bytes())
        .map_err(|e| io_error(path, "write header", e))?;
    writer
        .write_all(&row_count.to_le_bytes())
        .map_err(|e| io_error(path, "write header", e))?;
    writer
        .write_all(&(pages.len() as u32).to_le_bytes())
        .map_err(|e| io_error(path, "write header", e))?;

    for page in pages {
        let blob = encode_page(&schema, page)?;
        writer
            .write_all(&(blob.len() as u64).to_le_bytes())
            .map_err(|e| io_error(path, "write page", e))?;
        writer
            .write_all(&blob)
            .map_err(|e| io_error(path, "write page", e))?;
    }

    let mut positions = Vec::new();
    for i in 0..row_count {
        // identity permutation: first delta is the first position itself
        write_varint(&mut positions, if i == 0 { 0 } else { 1 });
    }
    writer
        .write_all(&(positions.len() as u64).to_le_bytes())
        .map_err(|e| io_error(path, "write positions", e))?;
    writer
        .write_all(&positions)
        .map_err(|e| io_error(path, "write positions", e))?;
    writer.flush().map_err(|e| io_error(path, "flush run file", e))?;
    Ok(())
}

/// Streaming reader over one run file.
pub struct RunReader {
    path: std::path::PathBuf,
    file: BufReader<File>,
    types: Vec<DataType>,
    row_count: u64,
    position_count: u64,
    page_count: u32,
    pages_read: u32,
}

impl RunReader {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let file = File::open(path).map_err(|e| io_error(path, "open run file", e))?;
        let mut file = BufReader::new(file);

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|e| io_error(path, "read header", e))?;
        if magic != MAGIC {
            return Err(io_error(path, "read header", "bad magic"));
        }
        let version = read_u32(&mut file, path)?;
        if version != VERSION {
            return Err(io_error(
                path,
                "read header",
                format!("unsupported version {version}"),
            ));
        }
        let channel_count = read_u16(&mut file, path)?;
        let mut types = Vec::with_capacity(channel_count as usize);
        for _ in 0..channel_count {
            let mut tag = [0u8; 1];
            file.read_exact(&mut tag)
                .map_err(|e| io_error(path, "read header", e))?;
            types.push(tag_type(tag[0])?);
        }
        let row_count = read_u64(&mut file, path)?;
        let position_count = read_u64(&mut file, path)?;
        let page_count = read_u32(&mut file, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            types,
            row_count,
            position_count,
            page_count,
            pages_read: 0,
        })
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn pages_read(&self) -> u32 {
        self.pages_read
    }

    /// Skip `count` page blobs without decoding them; used when a transient
    /// read failure forces a reopen mid-stream.
    pub fn skip_pages(&mut self, count: u32) -> EngineResult<()> {
        for _ in 0..count {
            let len = read_u64(&mut self.file, &self.path)?;
            self.file
                .seek(SeekFrom::Current(len as i64))
                .map_err(|e| io_error(&self.path, "skip page", e))?;
            self.pages_read += 1;
        }
        Ok(())
    }

    /// Next page of the run, or `None` after the last page (at which point
    /// the position trailer is read and verified).
    pub fn next_page(&mut self) -> EngineResult<Option<Page>> {
        if self.pages_read >= self.page_count {
            self.verify_positions()?;
            return Ok(None);
        }
        let len = read_u64(&mut self.file, &self.path)?;
        let mut blob = vec![0u8; len as usize];
        self.file
            .read_exact(&mut blob)
            .map_err(|e| io_error(&self.path, "read page", e))?;
        self.pages_read += 1;
        decode_page(&blob).map(Some)
    }

    fn verify_positions(&mut self) -> EngineResult<()> {
        let len = read_u64(&mut self.file, &self.path)?;
        let mut bytes = vec![0u8; len as usize];
        self.file
            .read_exact(&mut bytes)
            .map_err(|e| io_error(&self.path, "read positions", e))?;
        let mut cursor = 0usize;
        let mut position = 0u64;
        for i in 0..self.position_count {
            let delta = read_varint(&bytes, &mut cursor)?;
            position = if i == 0 { delta } else { position + delta };
            if position != i {
                return Err(io_error(
                    &self.path,
                    "read positions",
                    "run position list is not the identity permutation",
                ));
            }
        }
        Ok(())
    }
}

fn read_u16(reader: &mut impl Read, path: &Path) -> EngineResult<u16> {
    let mut bytes = [0u8; 2];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| io_error(path, "read", e))?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32(reader: &mut impl Read, path: &Path) -> EngineResult<u32> {
    let mut bytes = [0u8; 4];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| io_error(path, "read", e))?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(reader: &mut impl Read, path: &Path) -> EngineResult<u64> {
    let mut bytes = [0u8; 8];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| io_error(path, "read", e))?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};

    #[test]
    fn varint_round_trip() {
        let mut buf = Vec::new();
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            buf.clear();
            write_varint(&mut buf, value);
            let mut cursor = 0;
            assert_eq!(read_varint(&buf, &mut cursor).unwrap(), value);
            assert_eq!(cursor, buf.len());
        }
    }

    #[test]
    fn run_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-0.spill");
        let types = vec![DataType::Int64, DataType::Utf8];
        let pages = vec![
            Page::new(vec![
                Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("a"), None])) as ArrayRef,
            ])
            .unwrap(),
            Page::new(vec![
                Arc::new(Int64Array::from(vec![3])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("c")])) as ArrayRef,
            ])
            .unwrap(),
        ];
        write_run(&path, &types, &pages).unwrap();

        let mut reader = RunReader::open(&path).unwrap();
        assert_eq!(reader.types(), types.as_slice());
        assert_eq!(reader.row_count(), 3);
        let first = reader.next_page().unwrap().unwrap();
        assert_eq!(first.position_count(), 2);
        let second = reader.next_page().unwrap().unwrap();
        assert_eq!(second.position_count(), 1);
        assert!(reader.next_page().unwrap().is_none());
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-run");
        std::fs::write(&path, b"garbage data").unwrap();
        assert!(RunReader::open(&path).is_err());
    }
}
