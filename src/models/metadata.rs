use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

use tracing::debug;

use crate::core::{FetchError, Result};

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const SPLIT_COUNT_KEY: &str = "split.count";
const MAX_KEY_LEN: u64 = 64 * 1024;
const MAX_ARRAY_DEPTH: u32 = 8;

/// GGUF metadata value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            _ => return None,
        })
    }

    fn fixed_size(self) -> Option<u64> {
        match self {
            Self::U8 | Self::I8 | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::String | Self::Array => None,
        }
    }
}

/// Returns the shard count a GGUF file declares under `split.count`, or
/// `None` when the key is absent. Only the header is read.
pub fn read_split_count(path: &Path) -> Result<Option<u16>> {
    let file = File::open(path).map_err(|err| FetchError::fs("open", path, err))?;
    let mut reader = GgufReader {
        inner: BufReader::new(file),
        path,
    };
    let count = reader.split_count()?;
    debug!("{}: n_split = {:?}", path.display(), count);
    Ok(count)
}

struct GgufReader<'a, R> {
    inner: R,
    path: &'a Path,
}

impl<R: Read> GgufReader<'_, R> {
    fn split_count(&mut self) -> Result<Option<u16>> {
        let mut magic = [0u8; 4];
        self.read_exact(&mut magic)?;
        if &magic != GGUF_MAGIC {
            return Err(self.invalid("not a GGUF file"));
        }
        let version = self.u32()?;
        if !(2..=3).contains(&version) {
            return Err(self.invalid(format!("unsupported GGUF version {version}")));
        }
        let _tensor_count = self.u64()?;
        let kv_count = self.u64()?;

        for _ in 0..kv_count {
            let key_len = self.u64()?;
            if key_len > MAX_KEY_LEN {
                return Err(self.invalid(format!("key length {key_len} is too large")));
            }
            let key = self.string_of(key_len)?;
            let value_type = self.value_type()?;
            if key == SPLIT_COUNT_KEY {
                return self.integer(value_type).map(Some);
            }
            self.skip_value(value_type, 0)?;
        }
        Ok(None)
    }

    fn integer(&mut self, value_type: ValueType) -> Result<u16> {
        let value: i128 = match value_type {
            ValueType::U8 => self.bytes::<1>()?[0].into(),
            ValueType::I8 => i8::from_le_bytes(self.bytes()?).into(),
            ValueType::U16 => u16::from_le_bytes(self.bytes()?).into(),
            ValueType::I16 => i16::from_le_bytes(self.bytes()?).into(),
            ValueType::U32 => self.u32()?.into(),
            ValueType::I32 => i32::from_le_bytes(self.bytes()?).into(),
            ValueType::U64 => self.u64()?.into(),
            ValueType::I64 => i64::from_le_bytes(self.bytes()?).into(),
            other => {
                return Err(self.invalid(format!("{SPLIT_COUNT_KEY} has non-integer type {other:?}")))
            }
        };
        u16::try_from(value)
            .map_err(|_| self.invalid(format!("{SPLIT_COUNT_KEY} value {value} is out of range")))
    }

    fn skip_value(&mut self, value_type: ValueType, depth: u32) -> Result<()> {
        match value_type {
            ValueType::String => {
                let len = self.u64()?;
                self.skip(len)
            }
            ValueType::Array => {
                if depth >= MAX_ARRAY_DEPTH {
                    return Err(self.invalid("arrays nested too deeply"));
                }
                let element_type = self.value_type()?;
                let count = self.u64()?;
                match element_type.fixed_size() {
                    Some(size) => {
                        let total = count
                            .checked_mul(size)
                            .ok_or_else(|| self.invalid("array size overflows"))?;
                        self.skip(total)
                    }
                    None => {
                        for _ in 0..count {
                            self.skip_value(element_type, depth + 1)?;
                        }
                        Ok(())
                    }
                }
            }
            fixed => self.skip(fixed.fixed_size().unwrap_or_default()),
        }
    }

    fn value_type(&mut self) -> Result<ValueType> {
        let raw = self.u32()?;
        ValueType::from_raw(raw).ok_or_else(|| self.invalid(format!("unknown value type {raw}")))
    }

    fn string_of(&mut self, len: u64) -> Result<String> {
        let mut buffer = Vec::new();
        let result = (&mut self.inner).take(len).read_to_end(&mut buffer);
        let read = result.map_err(|err| self.io_error(err))?;
        if read as u64 != len {
            return Err(self.invalid("unexpected end of file"));
        }
        String::from_utf8(buffer).map_err(|_| self.invalid("key is not valid UTF-8"))
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        let result = io::copy(&mut (&mut self.inner).take(len), &mut io::sink());
        let skipped = result.map_err(|err| self.io_error(err))?;
        if skipped != len {
            return Err(self.invalid("unexpected end of file"));
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buffer = [0u8; N];
        self.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<()> {
        let result = self.inner.read_exact(buffer);
        result.map_err(|err| self.io_error(err))
    }

    fn io_error(&self, err: io::Error) -> FetchError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            self.invalid("unexpected end of file")
        } else {
            FetchError::fs("read", self.path, err)
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> FetchError {
        FetchError::InvalidMetadata {
            path: self.path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;

    use super::*;

    /// Builds a GGUF header with the given key/value section.
    pub(crate) struct GgufBuilder {
        kv: Vec<u8>,
        count: u64,
    }

    impl GgufBuilder {
        pub(crate) fn new() -> Self {
            Self {
                kv: Vec::new(),
                count: 0,
            }
        }

        fn key(&mut self, key: &str, value_type: u32) {
            self.kv.extend((key.len() as u64).to_le_bytes());
            self.kv.extend(key.as_bytes());
            self.kv.extend(value_type.to_le_bytes());
            self.count += 1;
        }

        pub(crate) fn string(mut self, key: &str, value: &str) -> Self {
            self.key(key, 8);
            self.kv.extend((value.len() as u64).to_le_bytes());
            self.kv.extend(value.as_bytes());
            self
        }

        pub(crate) fn u16(mut self, key: &str, value: u16) -> Self {
            self.key(key, 2);
            self.kv.extend(value.to_le_bytes());
            self
        }

        pub(crate) fn u32_array(mut self, key: &str, values: &[u32]) -> Self {
            self.key(key, 9);
            self.kv.extend(4u32.to_le_bytes());
            self.kv.extend((values.len() as u64).to_le_bytes());
            for value in values {
                self.kv.extend(value.to_le_bytes());
            }
            self
        }

        pub(crate) fn string_array(mut self, key: &str, values: &[&str]) -> Self {
            self.key(key, 9);
            self.kv.extend(8u32.to_le_bytes());
            self.kv.extend((values.len() as u64).to_le_bytes());
            for value in values {
                self.kv.extend((value.len() as u64).to_le_bytes());
                self.kv.extend(value.as_bytes());
            }
            self
        }

        pub(crate) fn build(self) -> Vec<u8> {
            let mut bytes = GGUF_MAGIC.to_vec();
            bytes.extend(3u32.to_le_bytes());
            bytes.extend(0u64.to_le_bytes());
            bytes.extend(self.count.to_le_bytes());
            bytes.extend(self.kv);
            bytes.extend([0xAB; 16]);
            bytes
        }
    }

    fn write(dir: &Path, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join("model.gguf");
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn finds_split_count_after_other_values() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = GgufBuilder::new()
            .string("general.architecture", "llama")
            .string_array("tokenizer.ggml.tokens", &["<s>", "</s>", "hello"])
            .u32_array("tokenizer.ggml.token_type", &[1, 2, 3])
            .u16("split.no", 0)
            .u16("split.count", 3)
            .build();
        let path = write(dir.path(), &bytes);
        assert_eq!(read_split_count(&path).unwrap(), Some(3));
    }

    #[test]
    fn missing_key_means_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = GgufBuilder::new()
            .string("general.name", "tiny")
            .build();
        let path = write(dir.path(), &bytes);
        assert_eq!(read_split_count(&path).unwrap(), None);
    }

    #[test]
    fn rejects_non_gguf_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), b"<html>not found</html>");
        let err = read_split_count(&path).unwrap_err();
        assert!(matches!(err, FetchError::InvalidMetadata { .. }));
    }

    #[test]
    fn rejects_truncated_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = GgufBuilder::new()
            .string("general.architecture", "llama")
            .u16("split.count", 2)
            .build();
        bytes.truncate(40);
        let path = write(dir.path(), &bytes);
        let err = read_split_count(&path).unwrap_err();
        assert!(err.to_string().contains("unexpected end of file"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = GgufBuilder::new().build();
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        let path = write(dir.path(), &bytes);
        assert!(read_split_count(&path).is_err());
    }
}
