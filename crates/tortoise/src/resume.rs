//! Resume file, the block states of the pieces that were not completed when
//! we stopped.
//!
//! One line per block:
//!
//! ```text
//! Piece: 3 Offset: 16384 Length: 16384 Status: Finished
//! ```
//!
//! Pieces without any line were completed, but they are only trusted if
//! their hash still verifies.

use std::{collections::BTreeMap, io::ErrorKind, path::Path};

use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    disk::piece_matches,
    error::Error,
    metainfo::Metadata,
    piece::{Block, BlockStatus, Piece},
    state::TransferState,
    storage::Storage,
};

/// One line of the resume file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub piece: u32,
    pub offset: u32,
    pub len: u32,
    pub status: BlockStatus,
}

impl Record {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();

        let piece = field(&mut words, "Piece:")?.parse().ok()?;
        let offset = field(&mut words, "Offset:")?.parse().ok()?;
        let len = field(&mut words, "Length:")?.parse().ok()?;
        let status = field(&mut words, "Status:")?.parse().ok()?;

        if words.next().is_some() {
            return None;
        }

        Some(Self { piece, offset, len, status })
    }
}

/// The value after the word `name`.
fn field<'a>(words: &mut impl Iterator<Item = &'a str>, name: &str) -> Option<&'a str> {
    if words.next()? != name {
        return None;
    }
    words.next()
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Piece: {} Offset: {} Length: {} Status: {}",
            self.piece, self.offset, self.len, self.status
        )
    }
}

/// Parse the records of a resume file, by piece.
pub fn parse(text: &str) -> Result<BTreeMap<u32, Vec<Record>>, Error> {
    let mut pieces: BTreeMap<u32, Vec<Record>> = BTreeMap::new();

    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = Record::parse(line).ok_or_else(|| Error::ResumeRecordInvalid {
            line: i + 1,
            record: line.to_string(),
        })?;
        pieces.entry(record.piece).or_default().push(record);
    }

    Ok(pieces)
}

/// Lines of every outstanding piece.
pub fn render(state: &TransferState) -> String {
    let mut out = String::new();
    for piece in state.outstanding.values() {
        for block in &piece.blocks {
            let record = Record {
                piece: block.piece,
                offset: block.offset,
                len: block.len,
                status: block.status,
            };
            out.push_str(&record.to_string());
            out.push('\n');
        }
    }
    out
}

/// Rebuild the transfer state from the resume records and from what is in
/// storage.
///
/// Finished blocks are kept and every other block starts over. A piece whose
/// records don't cover it exactly starts over. A piece without records is
/// completed if its hash verifies, or starts over.
pub async fn rehydrate<S: Storage>(
    records: BTreeMap<u32, Vec<Record>>,
    meta: &Metadata,
    storage: &mut S,
    block_len: u32,
) -> TransferState {
    let count = meta.piece_count();
    let mut completed = Bitfield::from_piece(count);
    let mut outstanding = BTreeMap::new();

    for index in 0..count as u32 {
        let piece_len = meta.piece_len(index);

        let Some(records) = records.get(&index) else {
            if piece_matches(meta, storage, index).await {
                completed.set(index as usize, true);
            } else {
                outstanding.insert(index, Piece::new(index, piece_len, block_len));
            }
            continue;
        };

        let blocks = records
            .iter()
            .map(|r| {
                let mut block = Block::new(index, r.offset, r.len);
                if r.status == BlockStatus::Finished {
                    block.status = BlockStatus::Finished;
                    block.bytes_read = r.len;
                }
                block
            })
            .collect();
        let piece = Piece::from_blocks(index, blocks);

        if piece.is_partition(piece_len) {
            outstanding.insert(index, piece);
        } else {
            warn!("resume records of piece {index} are invalid, downloading it again");
            outstanding.insert(index, Piece::new(index, piece_len, block_len));
        }
    }

    let mut state = TransferState::from_parts(meta, block_len, completed, outstanding);

    // every block arrived but we stopped before hashing
    let unverified: Vec<u32> = state
        .outstanding
        .iter()
        .filter(|(_, p)| p.all_finished())
        .map(|(i, _)| *i)
        .collect();
    for index in unverified {
        let valid = piece_matches(meta, storage, index).await;
        state.piece_checked(index, valid);
    }
    state.take_completed();

    state
}

/// Load the resume file at `path`. A missing file is the same as an empty
/// one: every piece is checked against storage.
pub async fn load<S: Storage>(
    path: &Path,
    meta: &Metadata,
    storage: &mut S,
    block_len: u32,
) -> Result<TransferState, Error> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("no resume file at {path:?}");
            String::new()
        }
        Err(e) => return Err(e.into()),
    };

    let state = rehydrate(parse(&text)?, meta, storage, block_len).await;
    info!(
        "resumed with {}/{} pieces",
        state.completed.count_ones(),
        state.piece_count()
    );

    Ok(state)
}

/// Write the block states of every outstanding piece to `path`. The file is
/// empty when the download is complete.
pub async fn save(path: &Path, state: &TransferState) -> Result<(), Error> {
    tokio::fs::write(path, render(state)).await?;
    debug!("saved resume file {path:?}");
    Ok(())
}

/// Every piece in storage must verify before we seed it.
pub async fn check_seed<S: Storage>(meta: &Metadata, storage: &mut S) -> Result<(), Error> {
    let mut missing = 0;
    for index in 0..meta.piece_count() as u32 {
        if !piece_matches(meta, storage, index).await {
            missing += 1;
        }
    }

    if missing > 0 {
        return Err(Error::SeedIncomplete { missing });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn record_lines() {
        let line = "Piece: 3 Offset: 16384 Length: 100 Status: Requested";
        let record = Record::parse(line).unwrap();
        assert_eq!(
            record,
            Record { piece: 3, offset: 16384, len: 100, status: BlockStatus::Requested }
        );
        assert_eq!(record.to_string(), line);

        assert!(Record::parse("Piece: 3 Offset: 16384 Length: 100").is_none());
        assert!(Record::parse("Piece: x Offset: 0 Length: 1 Status: Finished").is_none());
        assert!(Record::parse("Offset: 0 Piece: 1 Length: 1 Status: Finished").is_none());

        let err = parse("Piece: 0 Offset: 0 Length: 1 Status: Finished\n\ngarbage\n");
        assert!(matches!(err, Err(Error::ResumeRecordInvalid { line: 3, .. })));
    }

    #[tokio::test]
    async fn rehydrate_from_records() {
        let data = content(16384 * 4);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();

        // piece 0 is on disk, piece 3 is not
        let mut storage = MemoryStorage::new(data.len() as u64);
        storage.data[..16384].copy_from_slice(&data[..16384]);

        let text = "\
Piece: 1 Offset: 0 Length: 8192 Status: Finished
Piece: 1 Offset: 8192 Length: 8192 Status: Requested
Piece: 2 Offset: 0 Length: 8192 Status: Finished
Piece: 2 Offset: 9000 Length: 7384 Status: Unassigned
";
        let state = rehydrate(parse(text).unwrap(), &meta, &mut storage, 8192).await;

        assert!(state.completed.has(0));
        assert!(!state.completed.has(3));
        assert_eq!(state.outstanding.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

        let one = &state.outstanding[&1];
        assert_eq!(one.blocks[0].status, BlockStatus::Finished);
        assert_eq!(one.blocks[1].status, BlockStatus::Unassigned);
        assert!(state.in_progress.has(1));

        // gap at 8192..9000
        let two = &state.outstanding[&2];
        assert!(two.blocks.iter().all(|b| b.status == BlockStatus::Unassigned));
        assert!(!state.in_progress.has(2));
    }

    #[tokio::test]
    async fn finished_pieces_are_verified() {
        let data = content(16384 * 2);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();
        let mut storage = MemoryStorage::from(data.clone());
        storage.data[16384] ^= 1;

        let text = "\
Piece: 0 Offset: 0 Length: 16384 Status: Finished
Piece: 1 Offset: 0 Length: 16384 Status: Finished
";
        let state = rehydrate(parse(text).unwrap(), &meta, &mut storage, 16384).await;
        assert!(state.completed.has(0));
        assert!(!state.completed.has(1));
        assert_eq!(state.outstanding[&1].blocks[0].status, BlockStatus::Unassigned);
    }

    #[tokio::test]
    async fn save_then_load() {
        let data = content(16384 * 3);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();
        let mut storage = MemoryStorage::from(data.clone());
        storage.data[20000] ^= 1;

        let path = std::env::temp_dir()
            .join(format!("tortoise-resume-{}.txt", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        // no file, everything is hashed
        let mut state = load(&path, &meta, &mut storage, 8192).await.unwrap();
        assert!(state.completed.has(0) && state.completed.has(2));
        assert!(!state.completed.has(1));

        state.outstanding.get_mut(&1).unwrap().blocks[0].status = BlockStatus::Finished;
        state.outstanding.get_mut(&1).unwrap().blocks[0].bytes_read = 8192;
        save(&path, &state).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(
            text,
            "Piece: 1 Offset: 0 Length: 8192 Status: Finished\n\
             Piece: 1 Offset: 8192 Length: 8192 Status: Unassigned\n"
        );

        let state = load(&path, &meta, &mut storage, 8192).await.unwrap();
        assert_eq!(state.outstanding[&1].blocks[0].status, BlockStatus::Finished);
        assert!(state.in_progress.has(1));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn seed_check() {
        let data = content(40000);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();

        let mut storage = MemoryStorage::from(data.clone());
        assert!(check_seed(&meta, &mut storage).await.is_ok());

        storage.data[39999] ^= 1;
        storage.data[0] ^= 1;
        assert!(matches!(
            check_seed(&meta, &mut storage).await,
            Err(Error::SeedIncomplete { missing: 2 })
        ));
    }
}
