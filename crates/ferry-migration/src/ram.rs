//! Guest RAM as a live entity.
//!
//! RAM is the one component too large to send while the guest is paused, so it is streamed
//! while the guest runs: a bulk pass sends every page, later passes resend pages the guest
//! dirtied in the meantime, and the final pass (guest stopped) sends whatever is left.
//!
//! Every record starts with a be64 holding the page offset in its upper bits and `RAM_SAVE_FLAG_*`
//! bits in the low 12 bits.

use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::rc::Rc;

use ferry_vmstate::Channel;
use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};
use crate::registry::{
    InstanceId, IterationStatus, LiveSaveHandler, OpaqueId, RegisterOptions, Registry,
};
use crate::xbzrle::{self, Encoded, XbzrleError};

pub const RAM_IDSTR: &str = "ram";
pub const RAM_VERSION_ID: u32 = 4;

/// Page filled with a single byte value, which follows.
pub const RAM_SAVE_FLAG_ZERO: u64 = 0x02;
/// RAM size announcement; a be32 page size follows.
pub const RAM_SAVE_FLAG_MEM_SIZE: u64 = 0x04;
/// Raw page contents follow.
pub const RAM_SAVE_FLAG_PAGE: u64 = 0x08;
/// End of this section's records.
pub const RAM_SAVE_FLAG_EOS: u64 = 0x10;
/// XBZRLE delta follows: encoding byte, be16 length, data.
pub const RAM_SAVE_FLAG_XBZRLE: u64 = 0x40;
/// LZ4 block follows: be32 length, data.
pub const RAM_SAVE_FLAG_COMPRESS_PAGE: u64 = 0x100;

pub const ENCODING_FLAG_XBZRLE: u8 = 0x01;

const FLAG_MASK: u64 = 0xfff;
const MIN_PAGE_SIZE: u32 = (FLAG_MASK + 1) as u32;
const MAX_PAGE_SIZE: u32 = 2 * 1024 * 1024;

/// Guest physical memory as seen by the migration code.
pub trait GuestRam {
    /// Size in bytes.
    fn size(&self) -> u64;

    fn read(&self, offset: u64, buf: &mut [u8]);

    fn write(&mut self, offset: u64, data: &[u8]);

    /// Indexes of pages written since the previous call, clearing the log.
    fn take_dirty_pages(&mut self, page_size: u64) -> Vec<u64>;
}

/// `Vec`-backed guest RAM with write tracking.
#[derive(Debug, Clone, Default)]
pub struct VecRam {
    data: Vec<u8>,
    dirty: Vec<Range<u64>>,
}

impl VecRam {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            dirty: Vec::new(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl GuestRam for VecRam {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        if !data.is_empty() {
            self.dirty.push(offset..offset + data.len() as u64);
        }
    }

    fn take_dirty_pages(&mut self, page_size: u64) -> Vec<u64> {
        let mut pages: Vec<u64> = self
            .dirty
            .drain(..)
            .flat_map(|range| {
                range.start / page_size..range.end.div_ceil(page_size)
            })
            .collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RamMigrationOptions {
    pub page_size: u32,
    /// Resend dirtied pages as XBZRLE deltas against the last sent copy.
    pub xbzrle: bool,
    /// Number of pages the XBZRLE cache holds.
    pub xbzrle_cache_pages: usize,
    /// LZ4-compress pages that are sent whole.
    pub compress: bool,
}

impl Default for RamMigrationOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            xbzrle: false,
            xbzrle_cache_pages: 16 * 1024,
            compress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XbzrleStats {
    pub pages: u64,
    pub bytes: u64,
    pub cache_miss: u64,
    pub overflow: u64,
    /// Dirty pages whose contents matched the cached copy and were not resent.
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RamStats {
    pub normal_pages: u64,
    pub zero_pages: u64,
    pub compressed_pages: u64,
    pub iterations: u64,
    pub xbzrle: XbzrleStats,
}

struct CacheEntry {
    page: u64,
    data: Box<[u8]>,
}

/// Direct-mapped cache of the contents last sent for each page.
struct PageCache {
    slots: Vec<Option<CacheEntry>>,
}

impl PageCache {
    fn new(num_pages: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(num_pages.max(1), || None);
        Self { slots }
    }

    fn slot(&self, page: u64) -> usize {
        (page % self.slots.len() as u64) as usize
    }

    fn get_mut(&mut self, page: u64) -> Option<&mut [u8]> {
        let slot = self.slot(page);
        match &mut self.slots[slot] {
            Some(entry) if entry.page == page => Some(&mut entry.data),
            _ => None,
        }
    }

    fn insert(&mut self, page: u64, data: &[u8]) {
        let slot = self.slot(page);
        match &mut self.slots[slot] {
            Some(entry) if entry.data.len() == data.len() => {
                entry.page = page;
                entry.data.copy_from_slice(data);
            }
            other => {
                *other = Some(CacheEntry {
                    page,
                    data: data.into(),
                })
            }
        }
    }
}

enum XbzrleOutcome {
    Sent,
    Skipped,
    Fallback,
}

fn uniform_byte(page: &[u8]) -> Option<u8> {
    let first = *page.first()?;
    page.iter().all(|&b| b == first).then_some(first)
}

fn max_lz4_compressed_len(uncompressed_len: usize) -> usize {
    // LZ4 worst case: uncompressed + uncompressed / 255 + 16.
    uncompressed_len
        .saturating_add(uncompressed_len / 255)
        .saturating_add(16)
}

pub struct RamMigration<M> {
    ram: Rc<RefCell<M>>,
    options: RamMigrationOptions,
    stats: Rc<Cell<RamStats>>,
    dirty: Vec<u64>,
    dirty_count: u64,
    cursor: u64,
    bulk_stage: bool,
    cache: Option<PageCache>,
    page: Vec<u8>,
    encoded: Vec<u8>,
    load_page_size: Option<usize>,
}

impl<M: GuestRam> RamMigration<M> {
    pub fn new(ram: Rc<RefCell<M>>, options: RamMigrationOptions) -> Result<Self> {
        let page_size = options.page_size;
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(MigrationError::entity(
                RAM_IDSTR,
                format!("invalid page size {page_size}"),
            ));
        }
        if ram.borrow().size() % u64::from(page_size) != 0 {
            return Err(MigrationError::entity(
                RAM_IDSTR,
                "RAM size is not a multiple of the page size",
            ));
        }

        Ok(Self {
            ram,
            options,
            stats: Rc::new(Cell::new(RamStats::default())),
            dirty: Vec::new(),
            dirty_count: 0,
            cursor: 0,
            bulk_stage: true,
            cache: None,
            page: vec![0; page_size as usize],
            encoded: vec![0; page_size as usize],
            load_page_size: None,
        })
    }

    /// Shared handle to the transfer counters, still readable after the entity is registered.
    pub fn stats(&self) -> Rc<Cell<RamStats>> {
        self.stats.clone()
    }

    pub fn register(self, registry: &mut Registry) -> Result<u32>
    where
        M: 'static,
    {
        let opaque = OpaqueId::of(&self.ram);
        registry.register_savevm_live(
            RAM_IDSTR,
            InstanceId::Fixed(0),
            RAM_VERSION_ID,
            Box::new(self),
            opaque,
            RegisterOptions::default(),
        )
    }

    fn page_size(&self) -> usize {
        self.options.page_size as usize
    }

    fn num_pages(&self) -> u64 {
        self.ram.borrow().size() / u64::from(self.options.page_size)
    }

    fn set_dirty(&mut self, page: u64) {
        let (word, bit) = ((page / 64) as usize, page % 64);
        if let Some(w) = self.dirty.get_mut(word) {
            if *w & (1 << bit) == 0 {
                *w |= 1 << bit;
                self.dirty_count += 1;
            }
        }
    }

    fn clear_dirty(&mut self, page: u64) {
        let (word, bit) = ((page / 64) as usize, page % 64);
        if let Some(w) = self.dirty.get_mut(word) {
            if *w & (1 << bit) != 0 {
                *w &= !(1 << bit);
                self.dirty_count -= 1;
            }
        }
    }

    fn find_dirty(&self, start: u64, end: u64) -> Option<u64> {
        let mut page = start;
        while page < end {
            let word = self.dirty[(page / 64) as usize] >> (page % 64);
            if word == 0 {
                page = (page / 64 + 1) * 64;
                continue;
            }
            let candidate = page + u64::from(word.trailing_zeros());
            return (candidate < end).then_some(candidate);
        }
        None
    }

    // Next dirty page at or after the cursor, wrapping once. Wrapping ends the bulk stage.
    fn next_dirty(&mut self) -> Option<u64> {
        if self.dirty_count == 0 {
            return None;
        }
        let page = match self.find_dirty(self.cursor, self.num_pages()) {
            Some(page) => page,
            None => {
                self.bulk_stage = false;
                self.find_dirty(0, self.cursor)?
            }
        };
        self.clear_dirty(page);
        self.cursor = page + 1;
        Some(page)
    }

    fn sync_dirty_log(&mut self) {
        let page_size = u64::from(self.options.page_size);
        let num_pages = self.num_pages();
        let pages = self.ram.borrow_mut().take_dirty_pages(page_size);
        let before = self.dirty_count;
        for page in pages.into_iter().filter(|&p| p < num_pages) {
            self.set_dirty(page);
        }
        tracing::trace!(
            newly_dirty = self.dirty_count - before,
            dirty = self.dirty_count,
            "synced RAM dirty log"
        );
    }

    fn save_xbzrle_page(
        &mut self,
        ch: &mut Channel,
        page: u64,
        offset: u64,
        last_stage: bool,
        stats: &mut RamStats,
    ) -> XbzrleOutcome {
        if self.bulk_stage {
            return XbzrleOutcome::Fallback;
        }
        let Self {
            cache,
            page: current,
            encoded,
            ..
        } = self;
        let Some(cache) = cache.as_mut() else {
            return XbzrleOutcome::Fallback;
        };

        let Some(cached) = cache.get_mut(page) else {
            tracing::trace!(page, "XBZRLE cache miss");
            stats.xbzrle.cache_miss += 1;
            if !last_stage {
                cache.insert(page, current);
            }
            return XbzrleOutcome::Fallback;
        };

        match xbzrle::encode_buffer(cached, current, encoded) {
            Ok(Encoded::Unchanged) => {
                stats.xbzrle.skipped += 1;
                XbzrleOutcome::Skipped
            }
            Ok(Encoded::Delta(len)) => {
                if !last_stage {
                    cached.copy_from_slice(current);
                }
                ch.put_be64(offset | RAM_SAVE_FLAG_XBZRLE);
                ch.put_u8(ENCODING_FLAG_XBZRLE);
                ch.put_be16(len as u16);
                ch.put_buffer(&encoded[..len]);
                stats.xbzrle.pages += 1;
                stats.xbzrle.bytes += len as u64;
                XbzrleOutcome::Sent
            }
            Err(XbzrleError::Overflow) => {
                tracing::trace!(page, "XBZRLE overflow");
                stats.xbzrle.overflow += 1;
                if !last_stage {
                    cached.copy_from_slice(current);
                }
                XbzrleOutcome::Fallback
            }
            Err(XbzrleError::Malformed(_)) => XbzrleOutcome::Fallback,
        }
    }

    fn send_page(&mut self, ch: &mut Channel, page: u64, last_stage: bool) {
        let offset = page * u64::from(self.options.page_size);
        self.ram.borrow().read(offset, &mut self.page);
        let mut stats = self.stats.get();

        if let Some(fill) = uniform_byte(&self.page) {
            ch.put_be64(offset | RAM_SAVE_FLAG_ZERO);
            ch.put_u8(fill);
            stats.zero_pages += 1;
            if !self.bulk_stage && !last_stage {
                if let Some(cache) = self.cache.as_mut() {
                    cache.insert(page, &self.page);
                }
            }
            self.stats.set(stats);
            return;
        }

        match self.save_xbzrle_page(ch, page, offset, last_stage, &mut stats) {
            XbzrleOutcome::Sent | XbzrleOutcome::Skipped => {}
            XbzrleOutcome::Fallback => {
                let compressed = self
                    .options
                    .compress
                    .then(|| lz4_flex::block::compress(&self.page))
                    .filter(|c| c.len() < self.page.len());
                match compressed {
                    Some(compressed) => {
                        ch.put_be64(offset | RAM_SAVE_FLAG_COMPRESS_PAGE);
                        ch.put_be32(compressed.len() as u32);
                        ch.put_buffer(&compressed);
                        stats.compressed_pages += 1;
                    }
                    None => {
                        ch.put_be64(offset | RAM_SAVE_FLAG_PAGE);
                        ch.put_buffer(&self.page);
                        stats.normal_pages += 1;
                    }
                }
            }
        }
        self.stats.set(stats);
    }

    fn release(&mut self) {
        self.dirty = Vec::new();
        self.dirty_count = 0;
        self.cache = None;
    }

    fn load_page(&mut self, ch: &mut Channel, flags: u64, addr: u64) -> Result<()> {
        let page_size = self
            .load_page_size
            .ok_or(MigrationError::RamCorrupt("page before RAM size"))?;
        let ram_size = self.ram.borrow().size();
        let out_of_range = addr
            .checked_add(page_size as u64)
            .map_or(true, |end| end > ram_size);
        if addr % page_size as u64 != 0 || out_of_range {
            return Err(MigrationError::RamCorrupt("page offset out of range"));
        }
        let page = &mut self.page[..page_size];

        if flags & RAM_SAVE_FLAG_ZERO != 0 {
            let fill = ch.get_u8()?;
            page.fill(fill);
        } else if flags & RAM_SAVE_FLAG_PAGE != 0 {
            ch.get_buffer(page)?;
        } else if flags & RAM_SAVE_FLAG_XBZRLE != 0 {
            if ch.get_u8()? != ENCODING_FLAG_XBZRLE {
                return Err(MigrationError::RamCorrupt("unknown XBZRLE encoding"));
            }
            let len = ch.get_be16()? as usize;
            if len > page_size {
                return Err(MigrationError::RamCorrupt("XBZRLE data larger than a page"));
            }
            self.encoded.resize(page_size, 0);
            ch.get_buffer(&mut self.encoded[..len])?;
            self.ram.borrow().read(addr, page);
            xbzrle::decode_buffer(&self.encoded[..len], page)
                .map_err(|_| MigrationError::RamCorrupt("malformed XBZRLE page"))?;
        } else {
            let len = ch.get_be32()? as usize;
            if len > max_lz4_compressed_len(page_size) {
                return Err(MigrationError::RamCorrupt("compressed page too large"));
            }
            let mut compressed = vec![0u8; len];
            ch.get_buffer(&mut compressed)?;
            let data = lz4_flex::block::decompress(&compressed, page_size)?;
            if data.len() != page_size {
                return Err(MigrationError::RamCorrupt(
                    "compressed page length mismatch",
                ));
            }
            page.copy_from_slice(&data);
        }

        self.ram.borrow_mut().write(addr, page);
        Ok(())
    }
}

impl<M: GuestRam> LiveSaveHandler for RamMigration<M> {
    fn setup(&mut self, ch: &mut Channel) -> Result<()> {
        let num_pages = self.num_pages();
        let words = num_pages.div_ceil(64) as usize;
        self.dirty = vec![0; words];
        self.dirty_count = 0;
        for page in 0..num_pages {
            self.set_dirty(page);
        }
        self.cursor = 0;
        self.bulk_stage = true;
        self.cache = (self.options.xbzrle && self.page_size() <= xbzrle::MAX_RUN)
            .then(|| PageCache::new(self.options.xbzrle_cache_pages));
        self.stats.set(RamStats::default());
        // Everything is about to be sent anyway.
        self.ram
            .borrow_mut()
            .take_dirty_pages(u64::from(self.options.page_size));

        let ram_size = self.ram.borrow().size();
        tracing::debug!(
            ram_size,
            page_size = self.options.page_size,
            xbzrle = self.cache.is_some(),
            "RAM migration setup"
        );
        ch.put_be64(ram_size | RAM_SAVE_FLAG_MEM_SIZE);
        ch.put_be32(self.options.page_size);
        ch.put_be64(RAM_SAVE_FLAG_EOS);
        Ok(())
    }

    fn iterate(&mut self, ch: &mut Channel) -> Result<IterationStatus> {
        self.sync_dirty_log();

        let mut sent = 0u64;
        while !ch.rate_limit_exceeded() {
            let Some(page) = self.next_dirty() else {
                break;
            };
            self.send_page(ch, page, false);
            sent += 1;
        }
        ch.put_be64(RAM_SAVE_FLAG_EOS);

        let mut stats = self.stats.get();
        stats.iterations += 1;
        self.stats.set(stats);
        tracing::trace!(sent, remaining = self.dirty_count, "RAM iteration");

        Ok(if self.dirty_count == 0 {
            IterationStatus::Complete
        } else {
            IterationStatus::Continue
        })
    }

    fn complete(&mut self, ch: &mut Channel) -> Result<()> {
        self.sync_dirty_log();
        while let Some(page) = self.next_dirty() {
            self.send_page(ch, page, true);
        }
        ch.put_be64(RAM_SAVE_FLAG_EOS);
        tracing::debug!(stats = ?self.stats.get(), "RAM migration complete");
        Ok(())
    }

    fn pending(&mut self, max_size: u64) -> u64 {
        let page_size = u64::from(self.options.page_size);
        let mut remaining = self.dirty_count * page_size;
        if remaining < max_size {
            self.sync_dirty_log();
            remaining = self.dirty_count * page_size;
        }
        remaining
    }

    fn cancel(&mut self) {
        self.release();
    }

    fn cleanup(&mut self) {
        self.release();
    }

    fn load_state(&mut self, ch: &mut Channel, version_id: u32) -> Result<()> {
        if version_id != RAM_VERSION_ID {
            return Err(MigrationError::RamCorrupt("unsupported RAM stream version"));
        }

        loop {
            let header = ch.get_be64()?;
            let flags = header & FLAG_MASK;
            let addr = header & !FLAG_MASK;

            if flags & RAM_SAVE_FLAG_MEM_SIZE != 0 {
                let page_size = ch.get_be32()?;
                if !page_size.is_power_of_two()
                    || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
                {
                    return Err(MigrationError::RamCorrupt("invalid page size"));
                }
                if addr != self.ram.borrow().size() {
                    return Err(MigrationError::RamCorrupt("RAM size mismatch"));
                }
                self.load_page_size = Some(page_size as usize);
                self.page.resize(page_size as usize, 0);
            } else if flags
                & (RAM_SAVE_FLAG_ZERO
                    | RAM_SAVE_FLAG_PAGE
                    | RAM_SAVE_FLAG_XBZRLE
                    | RAM_SAVE_FLAG_COMPRESS_PAGE)
                != 0
            {
                self.load_page(ch, flags, addr)?;
            } else if flags & RAM_SAVE_FLAG_EOS == 0 {
                return Err(MigrationError::RamCorrupt("unknown RAM record flags"));
            }

            if flags & RAM_SAVE_FLAG_EOS != 0 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_vmstate::MemTransport;

    const PAGE: usize = 4096;

    fn ram_with(pages: usize, fill: impl Fn(usize) -> u8) -> Rc<RefCell<VecRam>> {
        let mut ram = VecRam::new(pages * PAGE);
        let data: Vec<u8> = (0..pages * PAGE).map(fill).collect();
        ram.write(0, &data);
        ram.take_dirty_pages(PAGE as u64);
        Rc::new(RefCell::new(ram))
    }

    fn writer() -> (MemTransport, Channel) {
        let mem = MemTransport::new();
        let ch = Channel::new_writer(mem.clone());
        (mem, ch)
    }

    fn replay(dst: &mut RamMigration<VecRam>, bytes: Vec<u8>, sections: usize) {
        let mut ch = Channel::new_reader(MemTransport::from_bytes(bytes));
        for _ in 0..sections {
            dst.load_state(&mut ch, RAM_VERSION_ID).unwrap();
        }
        assert_eq!(ch.peek_u8(0), None);
    }

    #[test]
    fn vec_ram_reports_touched_pages_once() {
        let mut ram = VecRam::new(4 * PAGE);
        ram.write(10, &[1, 2]);
        ram.write(PAGE as u64 - 1, &[3, 4]);
        ram.write(3 * PAGE as u64, &[5]);
        assert_eq!(ram.take_dirty_pages(PAGE as u64), vec![0, 1, 3]);
        assert!(ram.take_dirty_pages(PAGE as u64).is_empty());
    }

    #[test]
    fn bulk_pass_sends_zero_and_full_pages() {
        // Page 0 is uniform, pages 1..3 hold distinct data.
        let src = ram_with(3, |i| if i < PAGE { 0xaa } else { (i % 251) as u8 });
        let mut ram = RamMigration::new(src.clone(), RamMigrationOptions::default()).unwrap();
        let (mem, mut ch) = writer();
        ram.setup(&mut ch).unwrap();
        assert_eq!(ram.pending(0), 3 * PAGE as u64);
        assert_eq!(ram.iterate(&mut ch).unwrap(), IterationStatus::Complete);
        ram.complete(&mut ch).unwrap();
        ch.close().unwrap();

        let stats = ram.stats().get();
        assert_eq!(stats.zero_pages, 1);
        assert_eq!(stats.normal_pages, 2);

        let dst_ram = Rc::new(RefCell::new(VecRam::new(3 * PAGE)));
        let mut dst = RamMigration::new(dst_ram.clone(), RamMigrationOptions::default()).unwrap();
        replay(&mut dst, mem.contents(), 3);
        assert_eq!(dst_ram.borrow().as_bytes(), src.borrow().as_bytes());
    }

    #[test]
    fn rate_limit_spreads_pages_over_iterations() {
        let src = ram_with(8, |i| (i / 7) as u8);
        let mut ram = RamMigration::new(src.clone(), RamMigrationOptions::default()).unwrap();
        let (mem, mut ch) = writer();
        ch.set_rate_limit(2 * PAGE as u64);
        ram.setup(&mut ch).unwrap();

        let mut iterations = 0;
        while ram.iterate(&mut ch).unwrap() == IterationStatus::Continue {
            ch.reset_rate_limit();
            iterations += 1;
        }
        assert!(iterations >= 2, "only {iterations} partial iterations");
        ram.complete(&mut ch).unwrap();
        ch.close().unwrap();

        let dst_ram = Rc::new(RefCell::new(VecRam::new(8 * PAGE)));
        let mut dst = RamMigration::new(dst_ram.clone(), RamMigrationOptions::default()).unwrap();
        replay(&mut dst, mem.contents(), iterations + 3);
        assert_eq!(dst_ram.borrow().as_bytes(), src.borrow().as_bytes());
    }

    #[test]
    fn redirtied_pages_go_out_as_xbzrle() {
        let src = ram_with(4, |i| (i * 7 % 256) as u8);
        let options = RamMigrationOptions {
            xbzrle: true,
            xbzrle_cache_pages: 4,
            ..RamMigrationOptions::default()
        };
        let mut ram = RamMigration::new(src.clone(), options).unwrap();
        let (mem, mut ch) = writer();
        ram.setup(&mut ch).unwrap();
        // Bulk pass, then a pass that ends the bulk stage.
        ram.iterate(&mut ch).unwrap();
        src.borrow_mut().write(PAGE as u64 + 5, &[1]);
        ram.iterate(&mut ch).unwrap();
        // Cached now; a small change is sent as a delta.
        src.borrow_mut().write(PAGE as u64 + 9, &[2]);
        ram.iterate(&mut ch).unwrap();
        // Rewriting identical bytes is skipped.
        src.borrow_mut().write(PAGE as u64 + 9, &[2]);
        ram.iterate(&mut ch).unwrap();
        ram.complete(&mut ch).unwrap();
        ch.close().unwrap();

        let stats = ram.stats().get();
        assert_eq!(stats.xbzrle.cache_miss, 1);
        assert_eq!(stats.xbzrle.pages, 1);
        assert_eq!(stats.xbzrle.skipped, 1);
        assert!(stats.xbzrle.bytes < 20);

        let dst_ram = Rc::new(RefCell::new(VecRam::new(4 * PAGE)));
        let mut dst = RamMigration::new(dst_ram.clone(), RamMigrationOptions::default()).unwrap();
        replay(&mut dst, mem.contents(), 6);
        assert_eq!(dst_ram.borrow().as_bytes(), src.borrow().as_bytes());
    }

    #[test]
    fn compressed_pages_round_trip() {
        let src = ram_with(2, |i| (i / 64) as u8);
        let options = RamMigrationOptions {
            compress: true,
            ..RamMigrationOptions::default()
        };
        let mut ram = RamMigration::new(src.clone(), options).unwrap();
        let (mem, mut ch) = writer();
        ram.setup(&mut ch).unwrap();
        ram.complete(&mut ch).unwrap();
        ch.close().unwrap();
        assert_eq!(ram.stats().get().compressed_pages, 2);

        let dst_ram = Rc::new(RefCell::new(VecRam::new(2 * PAGE)));
        let mut dst = RamMigration::new(dst_ram.clone(), RamMigrationOptions::default()).unwrap();
        replay(&mut dst, mem.contents(), 2);
        assert_eq!(dst_ram.borrow().as_bytes(), src.borrow().as_bytes());
    }

    #[test]
    fn load_rejects_size_mismatch() {
        let src = ram_with(2, |_| 0);
        let mut ram = RamMigration::new(src, RamMigrationOptions::default()).unwrap();
        let (mem, mut ch) = writer();
        ram.setup(&mut ch).unwrap();
        ch.close().unwrap();

        let dst_ram = Rc::new(RefCell::new(VecRam::new(4 * PAGE)));
        let mut dst = RamMigration::new(dst_ram, RamMigrationOptions::default()).unwrap();
        let mut ch = Channel::new_reader(MemTransport::from_bytes(mem.contents()));
        assert!(matches!(
            dst.load_state(&mut ch, RAM_VERSION_ID),
            Err(MigrationError::RamCorrupt("RAM size mismatch"))
        ));
    }

    #[test]
    fn page_before_size_is_corrupt() {
        let dst_ram = Rc::new(RefCell::new(VecRam::new(PAGE)));
        let mut dst = RamMigration::new(dst_ram, RamMigrationOptions::default()).unwrap();
        let mut bytes = (RAM_SAVE_FLAG_ZERO).to_be_bytes().to_vec();
        bytes.push(0);
        let mut ch = Channel::new_reader(MemTransport::from_bytes(bytes));
        assert!(matches!(
            dst.load_state(&mut ch, RAM_VERSION_ID),
            Err(MigrationError::RamCorrupt("page before RAM size"))
        ));
    }

    #[test]
    fn page_offset_near_address_space_end_is_corrupt() {
        let dst_ram = Rc::new(RefCell::new(VecRam::new(PAGE)));
        let mut dst = RamMigration::new(dst_ram.clone(), RamMigrationOptions::default()).unwrap();
        let mut bytes = (PAGE as u64 | RAM_SAVE_FLAG_MEM_SIZE).to_be_bytes().to_vec();
        bytes.extend_from_slice(&(PAGE as u32).to_be_bytes());
        let header = 0xffff_ffff_ffff_f000 | RAM_SAVE_FLAG_ZERO;
        bytes.extend_from_slice(&header.to_be_bytes());
        bytes.push(0xff);
        let mut ch = Channel::new_reader(MemTransport::from_bytes(bytes));
        assert!(matches!(
            dst.load_state(&mut ch, RAM_VERSION_ID),
            Err(MigrationError::RamCorrupt("page offset out of range"))
        ));
        assert!(dst_ram.borrow().as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn invalid_page_size_is_rejected() {
        let ram = Rc::new(RefCell::new(VecRam::new(PAGE)));
        let options = RamMigrationOptions {
            page_size: 1000,
            ..RamMigrationOptions::default()
        };
        assert!(RamMigration::new(ram, options).is_err());
    }
}
