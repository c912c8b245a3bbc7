//! The superblock and the generation swap.
//!
//! Pages 0 and 1 are reserved for two superblock slots. A generation
//! commit writes slot `generation % 2`, so the previous generation stays
//! intact until the new one is durable; opening adopts the valid slot
//! with the highest generation. This is the single-writer atomic
//! publication point for everything the cache wrote.

use crate::cache::Context;
use crate::checksum::Checksum;
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::page_id::PageId;
use crate::pool::PageBuf;

const MAGIC: &[u8; 8] = b"ropestor";
const VERSION: u32 = 1;
const NAME_FIELD: usize = 16;

// magic + version + page_size + size_sectors + generation + root
// + digest_size + name
const FIXED_LEN: usize = 8 + 4 + 4 + 8 + 8 + 8 + 1 + NAME_FIELD;

/// The decoded superblock record.
#[derive(Debug, Clone)]
pub struct Superblock {
    /// Page size recorded at format time.
    pub page_size: u32,
    /// Device size recorded at format time.
    pub size_sectors: u64,
    /// Generation counter; bumped by every commit.
    pub generation: u64,
    /// Root page of the current generation; nil when empty.
    pub root: PageId,
}

impl Superblock {
    /// The slot page this generation lives in.
    pub fn slot(&self) -> PageId {
        PageId(self.generation % 2)
    }

    fn encode(&self, checksum: &dyn Checksum, page: &mut [u8]) {
        page.fill(0);
        page[0..8].copy_from_slice(MAGIC);
        page[8..12].copy_from_slice(&VERSION.to_le_bytes());
        page[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        page[16..24].copy_from_slice(&self.size_sectors.to_le_bytes());
        page[24..32].copy_from_slice(&self.generation.to_le_bytes());
        page[32..40].copy_from_slice(&self.root.get().to_le_bytes());
        page[40] = checksum.digest_size() as u8;
        let name = checksum.name().as_bytes();
        let n = name.len().min(NAME_FIELD);
        page[41..41 + n].copy_from_slice(&name[..n]);

        let digest_size = checksum.digest_size();
        if digest_size > 0 {
            let end = page.len() - digest_size;
            let digest = checksum.compute(&page[..end]);
            page[end..].copy_from_slice(&digest);
        }
    }
}

enum Slot {
    Blank,
    Corrupted,
    Valid(Superblock),
}

fn decode_slot(page: &[u8], checksum: &dyn Checksum) -> Result<Slot> {
    if page.len() < FIXED_LEN + checksum.digest_size() || &page[0..8] != MAGIC {
        return Ok(Slot::Blank);
    }

    let recorded_name = {
        let raw = &page[41..41 + NAME_FIELD];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    };
    let recorded_digest_size = page[40] as usize;
    if recorded_name != checksum.name() || recorded_digest_size != checksum.digest_size() {
        return Err(Error::WrongChecksumAlgorithm {
            name: recorded_name,
            size: recorded_digest_size,
        });
    }

    let digest_size = checksum.digest_size();
    if digest_size > 0 {
        let end = page.len() - digest_size;
        if checksum.compute(&page[..end])[..] != page[end..] {
            return Ok(Slot::Corrupted);
        }
    }

    Ok(Slot::Valid(Superblock {
        page_size: u32::from_le_bytes(page[12..16].try_into().unwrap()),
        size_sectors: u64::from_le_bytes(page[16..24].try_into().unwrap()),
        generation: u64::from_le_bytes(page[24..32].try_into().unwrap()),
        root: PageId(u64::from_le_bytes(page[32..40].try_into().unwrap())),
    }))
}

/// Format the device: write generation 1 with an empty root and blank
/// the other slot.
pub fn format(disk: &dyn Disk, checksum: &dyn Checksum) -> Result<Superblock> {
    let info = disk.info();
    let sb = Superblock {
        page_size: info.sector_size,
        size_sectors: info.size_sectors,
        generation: 1,
        root: PageId::NIL,
    };

    let mut page = PageBuf::zeroed(info.sector_size as usize);
    disk.write(1 - sb.slot().get(), std::slice::from_ref(&page))?;
    sb.encode(checksum, &mut page);
    disk.write(sb.slot().get(), std::slice::from_ref(&page))?;
    tracing::info!(sectors = info.size_sectors, "formatted device");
    Ok(sb)
}

/// Open a formatted device, adopting the valid generation with the
/// highest counter.
pub fn open(disk: &dyn Disk, checksum: &dyn Checksum) -> Result<Superblock> {
    let info = disk.info();
    let mut best: Option<Superblock> = None;
    let mut any_magic = false;

    for slot in 0..2u64 {
        let mut page = PageBuf::zeroed(info.sector_size as usize);
        disk.read(slot, std::slice::from_mut(&mut page))?;
        match decode_slot(&page, checksum)? {
            Slot::Blank => {}
            Slot::Corrupted => any_magic = true,
            Slot::Valid(sb) => {
                any_magic = true;
                if sb.page_size != info.sector_size {
                    return Err(Error::WrongPageSize(sb.page_size));
                }
                if sb.size_sectors != info.size_sectors {
                    return Err(Error::WrongDiskSize(sb.size_sectors));
                }
                if best.as_ref().map_or(true, |b| sb.generation > b.generation) {
                    best = Some(sb);
                }
            }
        }
    }

    match best {
        Some(sb) => Ok(sb),
        None if any_magic => Err(Error::AllGenerationsCorrupted),
        None => Err(Error::DiskNotFormatted),
    }
}

/// Publish a new generation: flush the cache, then swap the superblock
/// to record `root`.
pub fn commit_generation(ctx: &Context, sb: &mut Superblock, root: PageId) -> Result<()> {
    ctx.clear()?;
    sb.generation += 1;
    sb.root = root;
    let mut page = PageBuf::zeroed(ctx.page_size());
    sb.encode(ctx.checksum(), &mut page);
    ctx.write_page(sb.slot(), &page)?;
    tracing::info!(generation = sb.generation, root = %root, "committed generation");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{Crc32, NoChecksum};
    use crate::disk::MemDisk;

    #[test]
    fn format_then_open_round_trips() {
        let disk = MemDisk::new(512, 64);
        let formatted = format(&disk, &Crc32).unwrap();
        let opened = open(&disk, &Crc32).unwrap();
        assert_eq!(opened.generation, formatted.generation);
        assert_eq!(opened.page_size, 512);
        assert_eq!(opened.size_sectors, 64);
        assert!(opened.root.is_nil());
    }

    #[test]
    fn blank_disk_is_not_formatted() {
        let disk = MemDisk::new(512, 64);
        assert!(matches!(
            open(&disk, &Crc32),
            Err(Error::DiskNotFormatted)
        ));
    }

    #[test]
    fn corrupted_active_slot_is_detected() {
        let disk = MemDisk::new(512, 64);
        let sb = format(&disk, &Crc32).unwrap();
        // flip a byte inside the active slot's payload
        disk.flip_byte((sb.slot().get() as usize) * 512 + 20);
        assert!(matches!(
            open(&disk, &Crc32),
            Err(Error::AllGenerationsCorrupted)
        ));
    }

    #[test]
    fn older_valid_slot_survives_corruption_of_the_newer() {
        let disk = MemDisk::new(512, 64);
        let mut sb = format(&disk, &Crc32).unwrap();

        // hand-write generation 2 into the other slot
        let gen1_slot = sb.slot();
        sb.generation = 2;
        sb.root = PageId(7);
        let mut page = PageBuf::zeroed(512);
        sb.encode(&Crc32, &mut page);
        disk.write(sb.slot().get(), std::slice::from_ref(&page)).unwrap();

        assert_eq!(open(&disk, &Crc32).unwrap().generation, 2);

        // corrupting generation 2 falls back to generation 1
        disk.flip_byte((sb.slot().get() as usize) * 512 + 30);
        let opened = open(&disk, &Crc32).unwrap();
        assert_eq!(opened.generation, 1);
        assert_eq!(opened.slot(), gen1_slot);
    }

    #[test]
    fn checksum_algorithm_mismatch_is_reported() {
        let disk = MemDisk::new(512, 64);
        format(&disk, &Crc32).unwrap();
        match open(&disk, &NoChecksum) {
            Err(Error::WrongChecksumAlgorithm { name, size }) => {
                assert_eq!(name, "crc32");
                assert_eq!(size, 4);
            }
            other => panic!("expected algorithm mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn recorded_geometry_is_validated() {
        let disk = MemDisk::new(512, 64);
        let sb = format(&disk, &Crc32).unwrap();

        let mut doctored = sb.clone();
        doctored.page_size = 4096;
        let mut page = PageBuf::zeroed(512);
        doctored.encode(&Crc32, &mut page);
        disk.write(doctored.slot().get(), std::slice::from_ref(&page)).unwrap();
        assert!(matches!(open(&disk, &Crc32), Err(Error::WrongPageSize(4096))));

        let mut doctored = sb.clone();
        doctored.size_sectors = 128;
        doctored.encode(&Crc32, &mut page);
        disk.write(doctored.slot().get(), std::slice::from_ref(&page)).unwrap();
        assert!(matches!(open(&disk, &Crc32), Err(Error::WrongDiskSize(128))));
    }
}
