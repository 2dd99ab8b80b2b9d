//! Storage interface shared by the RocksDB backend and the in-memory test store

use crate::errors::EngineResult;

/// One mutation inside an atomic batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Ordered key-value store with all-or-nothing batch writes
pub trait KvStore: Send + Sync {
    /// Read a single key
    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>>;

    /// Keys starting with `prefix` in ascending order, strictly after `start_after`
    /// when given, at most `limit` entries
    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> EngineResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every op or none of them
    fn write_batch(&self, ops: Vec<WriteOp>) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_op_key() {
        let put = WriteOp::Put {
            key: b"user:1".to_vec(),
            value: b"{}".to_vec(),
        };
        let delete = WriteOp::Delete { key: b"seed:1".to_vec() };
        assert_eq!(put.key(), b"user:1");
        assert_eq!(delete.key(), b"seed:1");
    }
}
