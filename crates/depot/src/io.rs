//! Abstract metadata read/write seam, abstracting over device backends so
//! the depot core can run against a real block device or an in-memory
//! fixture without caring which.

use async_trait::async_trait;

use crate::error::Result;

/// One block-sized metadata I/O unit, addressed by absolute block number on
/// the underlying device.
#[async_trait]
pub trait MetadataIoDriver: Send + Sync {
    async fn read_block(&self, block_number: u64, buf: &mut [u8]) -> Result<()>;
    async fn write_block(&self, block_number: u64, buf: &[u8]) -> Result<()>;
    async fn flush(&self) -> Result<()>;
}

/// An in-memory driver used by tests and by the scenario harness in
/// `crates/testing`; never used in a real deployment.
pub struct InMemoryIoDriver {
    blocks: tokio::sync::Mutex<std::collections::HashMap<u64, Vec<u8>>>,
    block_size: usize,
}

impl InMemoryIoDriver {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            block_size,
        }
    }
}

#[async_trait]
impl MetadataIoDriver for InMemoryIoDriver {
    async fn read_block(&self, block_number: u64, buf: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock().await;
        match blocks.get(&block_number) {
            Some(data) => {
                buf[..data.len().min(buf.len())].copy_from_slice(&data[..data.len().min(buf.len())]);
                Ok(())
            }
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    async fn write_block(&self, block_number: u64, buf: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock().await;
        blocks.insert(block_number, buf.to_vec());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl InMemoryIoDriver {
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}
