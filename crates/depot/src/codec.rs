//! Packed on-disk formats, little-endian throughout.
//!
//! Plain Rust structs carry the in-memory representation; `encode`/`decode`
//! produce the exact packed byte layout so that `encode(decode(bytes)) ==
//! bytes` for any valid record.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{self, Cursor, Read, Write};

use crate::config::SlabConfig;
use crate::types::{Pbn, ReferenceOperation, SequenceNumber};

/// `slab_depot_state_2_0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabDepotState2_0 {
    pub slab_config: SlabConfig,
    pub first_block: u64,
    pub last_block: u64,
    pub zone_count: u8,
}

impl SlabDepotState2_0 {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * 7 + 8 + 8 + 1);
        let c = &self.slab_config;
        for field in [
            c.slab_blocks,
            c.data_blocks,
            c.ref_count_blocks,
            c.slab_journal_blocks,
            c.slab_journal_flushing_threshold,
            c.slab_journal_blocking_threshold,
            c.slab_journal_scrubbing_threshold,
            self.first_block,
            self.last_block,
        ] {
            buf.write_u64::<LE>(field).expect("write to Vec never fails");
        }
        buf.write_u8(self.zone_count).expect("write to Vec never fails");
        buf
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(bytes);
        let slab_blocks = cur.read_u64::<LE>()?;
        let data_blocks = cur.read_u64::<LE>()?;
        let ref_count_blocks = cur.read_u64::<LE>()?;
        let slab_journal_blocks = cur.read_u64::<LE>()?;
        let slab_journal_flushing_threshold = cur.read_u64::<LE>()?;
        let slab_journal_blocking_threshold = cur.read_u64::<LE>()?;
        let slab_journal_scrubbing_threshold = cur.read_u64::<LE>()?;
        let first_block = cur.read_u64::<LE>()?;
        let last_block = cur.read_u64::<LE>()?;
        let zone_count = cur.read_u8()?;
        Ok(Self {
            slab_config: SlabConfig {
                slab_blocks,
                data_blocks,
                ref_count_blocks,
                slab_journal_blocks,
                slab_journal_flushing_threshold,
                slab_journal_blocking_threshold,
                slab_journal_scrubbing_threshold,
            },
            first_block,
            last_block,
            zone_count,
        })
    }
}

/// A single slab-journal on-disk entry: `{ op:u4, pbn:u60, recovery_sequence:u64 }`.
/// The op/pbn pair is packed into one `u64` so the whole entry is 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub op: ReferenceOperation,
    pub pbn: Pbn,
    pub recovery_sequence: SequenceNumber,
}

fn op_to_nibble(op: ReferenceOperation) -> u8 {
    match op {
        ReferenceOperation::Increment => 0,
        ReferenceOperation::Decrement => 1,
        ReferenceOperation::BlockMapIncrement => 2,
    }
}

fn nibble_to_op(n: u8) -> io::Result<ReferenceOperation> {
    match n {
        0 => Ok(ReferenceOperation::Increment),
        1 => Ok(ReferenceOperation::Decrement),
        2 => Ok(ReferenceOperation::BlockMapIncrement),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown slab journal op nibble {other}"),
        )),
    }
}

const PBN_MASK: u64 = (1u64 << 60) - 1;

impl SlabJournalEntry {
    pub fn encode(&self) -> [u8; 16] {
        let packed = ((op_to_nibble(self.op) as u64) << 60) | (self.pbn & PBN_MASK);
        let mut buf = [0u8; 16];
        {
            let mut w = &mut buf[0..8];
            w.write_u64::<LE>(packed).unwrap();
        }
        {
            let mut w = &mut buf[8..16];
            w.write_u64::<LE>(self.recovery_sequence).unwrap();
        }
        buf
    }

    pub fn decode(bytes: &[u8; 16]) -> io::Result<Self> {
        let packed = (&bytes[0..8]).read_u64::<LE>()?;
        let recovery_sequence = (&bytes[8..16]).read_u64::<LE>()?;
        let op = nibble_to_op((packed >> 60) as u8)?;
        let pbn = packed & PBN_MASK;
        Ok(Self {
            op,
            pbn,
            recovery_sequence,
        })
    }
}

/// Slab-journal block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalBlockHeader {
    pub magic: u32,
    pub nonce: u64,
    pub sequence: u64,
    pub head: u64,
    pub tail_offset: u16,
    pub entry_count: u16,
}

pub const SLAB_JOURNAL_BLOCK_MAGIC: u32 = 0x534a_4230; // "SJB0"

impl SlabJournalBlockHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 8 * 3 + 2 * 2);
        buf.write_u32::<LE>(self.magic).unwrap();
        buf.write_u64::<LE>(self.nonce).unwrap();
        buf.write_u64::<LE>(self.sequence).unwrap();
        buf.write_u64::<LE>(self.head).unwrap();
        buf.write_u16::<LE>(self.tail_offset).unwrap();
        buf.write_u16::<LE>(self.entry_count).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(bytes);
        let magic = cur.read_u32::<LE>()?;
        let nonce = cur.read_u64::<LE>()?;
        let sequence = cur.read_u64::<LE>()?;
        let head = cur.read_u64::<LE>()?;
        let tail_offset = cur.read_u16::<LE>()?;
        let entry_count = cur.read_u16::<LE>()?;
        if magic != SLAB_JOURNAL_BLOCK_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad slab journal block magic",
            ));
        }
        Ok(Self {
            magic,
            nonce,
            sequence,
            head,
            tail_offset,
            entry_count,
        })
    }
}

/// Slab summary entry: 7 bytes, `{ tail_block_offset:u16, load_ref_counts:u1,
/// is_clean:u1, free_blocks_hint:u6 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabSummaryEntry {
    pub tail_block_offset: u16,
    pub load_ref_counts: bool,
    pub is_clean: bool,
    pub free_blocks_hint: u8,
}

impl SlabSummaryEntry {
    pub fn encode(&self) -> [u8; 3] {
        let mut buf = [0u8; 3];
        (&mut buf[0..2]).write_u16::<LE>(self.tail_block_offset).unwrap();
        let flags = ((self.load_ref_counts as u8) << 7)
            | ((self.is_clean as u8) << 6)
            | (self.free_blocks_hint & 0x3f);
        buf[2] = flags;
        buf
    }

    pub fn decode(bytes: &[u8; 3]) -> Self {
        let tail_block_offset = (&bytes[0..2]).read_u16::<LE>().unwrap();
        let flags = bytes[2];
        Self {
            tail_block_offset,
            load_ref_counts: (flags & 0x80) != 0,
            is_clean: (flags & 0x40) != 0,
            free_blocks_hint: flags & 0x3f,
        }
    }
}

/// Bytes per summary block, rounded to 4 KiB.
pub const SUMMARY_BLOCK_SIZE: usize = 4096;
pub const SUMMARY_ENTRY_BYTES: usize = 3;
pub const ENTRIES_PER_SUMMARY_BLOCK: usize = SUMMARY_BLOCK_SIZE / SUMMARY_ENTRY_BYTES;

pub fn pack_summary_block(entries: &[SlabSummaryEntry]) -> Vec<u8> {
    assert!(entries.len() <= ENTRIES_PER_SUMMARY_BLOCK);
    let mut buf = vec![0u8; SUMMARY_BLOCK_SIZE];
    for (i, e) in entries.iter().enumerate() {
        let packed = e.encode();
        buf[i * SUMMARY_ENTRY_BYTES..i * SUMMARY_ENTRY_BYTES + SUMMARY_ENTRY_BYTES]
            .copy_from_slice(&packed);
    }
    buf
}

pub fn unpack_summary_block(block: &[u8], count: usize) -> Vec<SlabSummaryEntry> {
    assert!(count <= ENTRIES_PER_SUMMARY_BLOCK);
    (0..count)
        .map(|i| {
            let mut raw = [0u8; 3];
            raw.copy_from_slice(
                &block[i * SUMMARY_ENTRY_BYTES..i * SUMMARY_ENTRY_BYTES + SUMMARY_ENTRY_BYTES],
            );
            SlabSummaryEntry::decode(&raw)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depot_state_round_trips() {
        let state = SlabDepotState2_0 {
            slab_config: SlabConfig::for_data_blocks(8),
            first_block: 100,
            last_block: 1100,
            zone_count: 4,
        };
        let bytes = state.encode();
        assert_eq!(SlabDepotState2_0::decode(&bytes).unwrap(), state);
    }

    #[test]
    fn journal_entry_round_trips_large_pbn() {
        let entry = SlabJournalEntry {
            op: ReferenceOperation::BlockMapIncrement,
            pbn: PBN_MASK, // largest representable pbn
            recovery_sequence: 0xdead_beef_0000_1234,
        };
        let bytes = entry.encode();
        assert_eq!(SlabJournalEntry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn summary_entry_round_trips() {
        let entry = SlabSummaryEntry {
            tail_block_offset: 4000,
            load_ref_counts: true,
            is_clean: false,
            free_blocks_hint: 0x2a,
        };
        let bytes = entry.encode();
        assert_eq!(SlabSummaryEntry::decode(&bytes), entry);
    }

    #[test]
    fn summary_block_packs_and_unpacks() {
        let entries: Vec<SlabSummaryEntry> = (0..10)
            .map(|i| SlabSummaryEntry {
                tail_block_offset: i as u16 * 3,
                load_ref_counts: i % 2 == 0,
                is_clean: i % 3 == 0,
                free_blocks_hint: (i % 64) as u8,
            })
            .collect();
        let block = pack_summary_block(&entries);
        assert_eq!(block.len(), SUMMARY_BLOCK_SIZE);
        let unpacked = unpack_summary_block(&block, entries.len());
        assert_eq!(unpacked, entries);
    }
}
