// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The block database export/import file format and its `blocks.idx`
//! companion index.
//!
//! A database file is a varint version header followed by sections, each
//! self-delimiting and written in non-decreasing genesis index. All
//! integers are big-endian; the version varint uses most-significant-bit
//! continuation bytes.

use crate::persistent_storage::{PersistentStorage, StoredBlock};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use kestrel_consensus_types::{common::Height, finalization_entry::FinalizationEntry};
use kestrel_crypto::HashValue;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Current file format version.
pub const EXPORT_VERSION: u64 = 3;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unsupported block database version {0}")]
    UnsupportedVersion(u64),
    #[error("malformed block database: {0}")]
    Malformed(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] crate::persistent_storage::StorageError),
}

/// Writes `value` as a base-128 varint, most significant group first;
/// every byte but the last carries the continuation bit.
pub fn write_varint<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    let mut groups = Vec::new();
    let mut rest = value;
    loop {
        groups.push((rest & 0x7f) as u8);
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    while let Some(group) = groups.pop() {
        let continuation = if groups.is_empty() { 0x00 } else { 0x80 };
        out.write_all(&[group | continuation])?;
    }
    Ok(())
}

pub fn read_varint<R: Read>(input: &mut R) -> Result<u64, ExportError> {
    let mut value: u64 = 0;
    for _ in 0..10 {
        let byte = input.read_u8()?;
        if value > u64::MAX >> 7 {
            return Err(ExportError::Malformed("varint overflow"));
        }
        value = value << 7 | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ExportError::Malformed("varint too long"))
}

/// One section of a block database file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportSection {
    pub genesis_index: u32,
    pub protocol_version: u64,
    pub genesis_block_hash: HashValue,
    pub first_block_height: Height,
    /// Versioned block frames, strictly ascending height.
    pub blocks: Vec<Vec<u8>>,
    /// Zero or one finalization entry for the consensus-v1 format.
    pub finalization_records: Vec<Vec<u8>>,
}

impl ExportSection {
    fn blocks_length(&self) -> u64 {
        self.blocks.iter().map(|b| 8 + b.len() as u64).sum()
    }

    fn finalization_length(&self) -> u64 {
        self.finalization_records
            .iter()
            .map(|r| 8 + r.len() as u64)
            .sum()
    }

    /// Total bytes of the serialized section, length field included.
    fn section_length(&self) -> u64 {
        // length + genesisIndex + protocolVersion + hash + firstHeight
        // + blockCount + blocksLength + finalizationCount
        8 + 4 + 8 + 32 + 8 + 8 + 8 + 8 + self.blocks_length() + self.finalization_length()
    }
}

/// Sequential section writer; enforces the non-decreasing genesis index
/// ordering of the format.
pub struct BlockExportWriter<W: Write> {
    out: W,
    last_genesis_index: Option<u32>,
}

impl<W: Write> BlockExportWriter<W> {
    pub fn new(mut out: W) -> Result<Self, ExportError> {
        write_varint(&mut out, EXPORT_VERSION)?;
        Ok(Self {
            out,
            last_genesis_index: None,
        })
    }

    pub fn write_section(&mut self, section: &ExportSection) -> Result<(), ExportError> {
        if let Some(last) = self.last_genesis_index {
            if section.genesis_index < last {
                return Err(ExportError::Malformed(
                    "sections must be in non-decreasing genesis index",
                ));
            }
        }
        self.last_genesis_index = Some(section.genesis_index);

        self.out.write_u64::<BigEndian>(section.section_length())?;
        self.out.write_u32::<BigEndian>(section.genesis_index)?;
        self.out.write_u64::<BigEndian>(section.protocol_version)?;
        self.out.write_all(section.genesis_block_hash.as_slice())?;
        self.out
            .write_u64::<BigEndian>(section.first_block_height)?;
        self.out.write_u64::<BigEndian>(section.blocks.len() as u64)?;
        self.out.write_u64::<BigEndian>(section.blocks_length())?;
        self.out
            .write_u64::<BigEndian>(section.finalization_records.len() as u64)?;
        for block in &section.blocks {
            self.out.write_u64::<BigEndian>(block.len() as u64)?;
            self.out.write_all(block)?;
        }
        for record in &section.finalization_records {
            self.out.write_u64::<BigEndian>(record.len() as u64)?;
            self.out.write_all(record)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Sequential section reader.
pub struct BlockExportReader<R: Read> {
    input: R,
    version: u64,
}

impl<R: Read> BlockExportReader<R> {
    pub fn new(mut input: R) -> Result<Self, ExportError> {
        let version = read_varint(&mut input)?;
        if version != EXPORT_VERSION {
            return Err(ExportError::UnsupportedVersion(version));
        }
        Ok(Self { input, version })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Reads the next section, or `None` at a clean end of file.
    pub fn read_section(&mut self) -> Result<Option<ExportSection>, ExportError> {
        let section_length = match self.input.read_u64::<BigEndian>() {
            Ok(length) => length,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let genesis_index = self.input.read_u32::<BigEndian>()?;
        let protocol_version = self.input.read_u64::<BigEndian>()?;
        let mut hash = [0u8; 32];
        self.input.read_exact(&mut hash)?;
        let first_block_height = self.input.read_u64::<BigEndian>()?;
        let block_count = self.input.read_u64::<BigEndian>()?;
        let blocks_length = self.input.read_u64::<BigEndian>()?;
        let finalization_count = self.input.read_u64::<BigEndian>()?;

        let mut blocks = Vec::with_capacity(block_count.min(1024) as usize);
        let mut read_block_bytes = 0u64;
        for _ in 0..block_count {
            let frame = self.read_frame()?;
            read_block_bytes += 8 + frame.len() as u64;
            blocks.push(frame);
        }
        if read_block_bytes != blocks_length {
            return Err(ExportError::Malformed("block region length mismatch"));
        }
        let mut finalization_records = Vec::new();
        for _ in 0..finalization_count {
            finalization_records.push(self.read_frame()?);
        }

        let section = ExportSection {
            genesis_index,
            protocol_version,
            genesis_block_hash: HashValue::new(hash),
            first_block_height,
            blocks,
            finalization_records,
        };
        if section.section_length() != section_length {
            return Err(ExportError::Malformed("section length mismatch"));
        }
        Ok(Some(section))
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, ExportError> {
        let length = self.input.read_u64::<BigEndian>()?;
        if length > 1 << 30 {
            return Err(ExportError::Malformed("oversized frame"));
        }
        let mut frame = vec![0u8; length as usize];
        self.input.read_exact(&mut frame)?;
        Ok(frame)
    }
}

/// Exports the finalized chain from `first_height` through the last
/// finalized block as one section, with the latest finalization entry as
/// the single finalization record.
pub fn export_section_from_storage(
    storage: &PersistentStorage,
    genesis_index: u32,
    protocol_version: u64,
    genesis_block_hash: HashValue,
    first_height: Height,
) -> Result<ExportSection, ExportError> {
    let mut blocks = Vec::new();
    let mut height = first_height.max(1);
    while let Some(stored) = storage.finalized_block_at_height(height)? {
        blocks.push(bcs::to_bytes(&stored).expect("stored block serializes"));
        height += 1;
    }
    let finalization_records = match storage.latest_finalization_entry()? {
        Some(entry) if !blocks.is_empty() => {
            vec![bcs::to_bytes(&entry).expect("finalization entry serializes")]
        }
        _ => Vec::new(),
    };
    Ok(ExportSection {
        genesis_index,
        protocol_version,
        genesis_block_hash,
        first_block_height: first_height.max(1),
        blocks,
        finalization_records,
    })
}

/// Decodes a section's frames back into stored blocks and the optional
/// finalization entry.
pub fn decode_section(
    section: &ExportSection,
) -> Result<(Vec<StoredBlock>, Option<FinalizationEntry>), ExportError> {
    let mut blocks = Vec::with_capacity(section.blocks.len());
    let mut expected_height = section.first_block_height;
    for frame in &section.blocks {
        let stored: StoredBlock = bcs::from_bytes(frame)
            .map_err(|_| ExportError::Malformed("undecodable block frame"))?;
        if stored.height() != expected_height {
            return Err(ExportError::Malformed("block heights not ascending"));
        }
        expected_height += 1;
        blocks.push(stored);
    }
    let entry = match section.finalization_records.first() {
        Some(frame) => Some(
            bcs::from_bytes(frame)
                .map_err(|_| ExportError::Malformed("undecodable finalization record"))?,
        ),
        None => None,
    };
    Ok((blocks, entry))
}

// ---------------------------------------------------------------------
// blocks.idx
// ---------------------------------------------------------------------

/// One chunk line of `blocks.idx`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexChunk {
    pub filename: String,
    pub genesis_index: u32,
    pub first_height: Height,
    pub last_height: Height,
}

/// One section of `blocks.idx`: a genesis hash header and its chunks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexSection {
    pub genesis_hash: String,
    pub chunks: Vec<BlockIndexChunk>,
}

/// Parses `blocks.idx`, merging consecutive sections that share a genesis
/// hash.
pub fn parse_block_index(text: &str) -> Result<Vec<BlockIndexSection>, ExportError> {
    let mut sections: Vec<BlockIndexSection> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(hash) = line.strip_prefix("# genesis hash ") {
            match sections.last() {
                Some(last) if last.genesis_hash == hash => {}
                _ => sections.push(BlockIndexSection {
                    genesis_hash: hash.to_string(),
                    chunks: Vec::new(),
                }),
            }
            continue;
        }
        let section = sections
            .last_mut()
            .ok_or(ExportError::Malformed("chunk line before genesis header"))?;
        let mut fields = line.split(',');
        let filename = fields
            .next()
            .ok_or(ExportError::Malformed("missing chunk filename"))?;
        let genesis_index = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(ExportError::Malformed("bad chunk genesis index"))?;
        let first_height = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(ExportError::Malformed("bad chunk first height"))?;
        let last_height = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(ExportError::Malformed("bad chunk last height"))?;
        if fields.next().is_some() {
            return Err(ExportError::Malformed("trailing chunk fields"));
        }
        section.chunks.push(BlockIndexChunk {
            filename: filename.to_string(),
            genesis_index,
            first_height,
            last_height,
        });
    }
    Ok(sections)
}

/// Renders sections back into the `blocks.idx` text format.
pub fn render_block_index(sections: &[BlockIndexSection]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str("# genesis hash ");
        out.push_str(&section.genesis_hash);
        out.push('\n');
        for chunk in &section.chunks {
            out.push_str(&format!(
                "{},{},{},{}\n",
                chunk.filename, chunk.genesis_index, chunk.first_height, chunk.last_height
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 3, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut bytes = Vec::new();
            write_varint(&mut bytes, value).unwrap();
            let read = read_varint(&mut bytes.as_slice()).unwrap();
            assert_eq!(read, value);
        }
    }

    proptest! {
        #[test]
        fn varint_round_trips_any_value(value in any::<u64>()) {
            let mut bytes = Vec::new();
            write_varint(&mut bytes, value).unwrap();
            prop_assert_eq!(read_varint(&mut bytes.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn exported_chain_decodes_from_storage() {
        use crate::{
            block_storage::BlockPointer,
            test_utils::{BlockParams, MockStateComputer, TestSetup},
        };
        use kestrel_consensus_types::finalization_entry::FinalizationEntry;

        let setup = TestSetup::new(4);
        let dir = tempfile::tempdir().unwrap();
        let storage = PersistentStorage::open(dir.path()).unwrap();
        let root = BlockPointer::genesis(
            setup.genesis_hash,
            0,
            setup.genesis.initial_state_hash(),
        );
        storage
            .write_genesis_block(&StoredBlock::from_pointer(&root))
            .unwrap();

        let b1 = setup.make_block(BlockParams::child_of(&root, 1, 1_000));
        let executed = MockStateComputer::compute(&root.state_hash(), 1, 1_000, &[]);
        let b1_pointer = BlockPointer::new(b1.clone(), 1, executed.state_hash, 1_000);
        let entry = FinalizationEntry::new(
            setup.make_qc(b1.hash(), 1, 0),
            setup.make_qc(HashValue::sha256(b"successor"), 2, 0),
        );
        storage
            .write_finalized(&[StoredBlock::from_pointer(&b1_pointer)], &entry)
            .unwrap();

        let section =
            export_section_from_storage(&storage, 0, 1, setup.genesis_hash, 1).unwrap();
        let mut writer = BlockExportWriter::new(Vec::new()).unwrap();
        writer.write_section(&section).unwrap();
        let mut reader = BlockExportReader::new(writer.into_inner().as_slice()).unwrap();
        let read = reader.read_section().unwrap().expect("one section");

        let (blocks, read_entry) = decode_section(&read).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].hash(), b1.hash());
        assert_eq!(read_entry, Some(entry));
    }

    #[test]
    fn varint_single_byte_for_small_values() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, EXPORT_VERSION).unwrap();
        assert_eq!(bytes, vec![3]);
    }

    #[test]
    fn section_round_trip() {
        let section = ExportSection {
            genesis_index: 0,
            protocol_version: 7,
            genesis_block_hash: HashValue::sha256(b"genesis"),
            first_block_height: 1,
            blocks: vec![b"block one".to_vec(), b"second block".to_vec()],
            finalization_records: vec![b"finalization".to_vec()],
        };
        let later = ExportSection {
            genesis_index: 1,
            first_block_height: 3,
            blocks: vec![b"third".to_vec()],
            finalization_records: vec![],
            ..section.clone()
        };

        let mut writer = BlockExportWriter::new(Vec::new()).unwrap();
        writer.write_section(&section).unwrap();
        writer.write_section(&later).unwrap();
        let bytes = writer.into_inner();

        let mut reader = BlockExportReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.read_section().unwrap(), Some(section));
        assert_eq!(reader.read_section().unwrap(), Some(later));
        assert_eq!(reader.read_section().unwrap(), None);
    }

    #[test]
    fn writer_rejects_decreasing_genesis_index() {
        let mut writer = BlockExportWriter::new(Vec::new()).unwrap();
        let section = ExportSection {
            genesis_index: 2,
            protocol_version: 7,
            genesis_block_hash: HashValue::sha256(b"genesis"),
            first_block_height: 1,
            blocks: vec![],
            finalization_records: vec![],
        };
        writer.write_section(&section).unwrap();
        let earlier = ExportSection {
            genesis_index: 1,
            ..section
        };
        assert!(writer.write_section(&earlier).is_err());
    }

    #[test]
    fn block_index_parses_and_merges() {
        let text = "\
# genesis hash aabb\n\
chunk-0.dat,0,1,100\n\
chunk-1.dat,0,101,200\n\
# genesis hash aabb\n\
chunk-2.dat,0,201,300\n\
# genesis hash ccdd\n\
chunk-3.dat,1,1,50\n";
        let sections = parse_block_index(text).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].genesis_hash, "aabb");
        assert_eq!(sections[0].chunks.len(), 3);
        assert_eq!(sections[1].chunks.len(), 1);
        assert_eq!(sections[0].chunks[2].filename, "chunk-2.dat");

        let rendered = render_block_index(&sections);
        let reparsed = parse_block_index(&rendered).unwrap();
        assert_eq!(sections, reparsed);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, 4).unwrap();
        assert!(matches!(
            BlockExportReader::new(bytes.as_slice()),
            Err(ExportError::UnsupportedVersion(4))
        ));
    }
}
