//! # Virtual Heap (vmalloc)
//!
//! Hands out page-granular runs of virtual address space from
//! `[VMALLOC_VIRT_START, VMALLOC_VIRT_END]`, each backed by individually
//! allocated physical frames. The address space is tracked as extents: free
//! extents in address order, occupied extents in allocation order.
//!
//! ```text
//!  VMALLOC_VIRT_MIN        brk                                   VMALLOC_VIRT_END
//!        │ ◄── vbrk(+) ──  ├────────┬─────────┬───────┬─ … ──────────────┤
//!        │                 │  free  │ occupied│ free  │                  │
//! ```
//!
//! Every allocation starts with a 16-byte header naming its extent and the
//! requested size; the caller gets the address right after it.
//!
//! Physical frames are taken upward from the end of the kernel's linear
//! window and, once those run out, downward from just below it. The frames
//! right behind the kernel break stay free for as long as possible.

use crate::AllocError;
use crate::extent::{ExtentArena, ExtentId, ExtentList, ExtentState};
use crate::frame_alloc::BitmapFrameAllocator;
use crate::mm::MemoryManager;
use core::fmt;
use kernel_info::memory::{
    KERNEL_VIRT_LINEAR_MAPPING_END, KERNEL_VIRT_START, VMALLOC_VIRT_END, VMALLOC_VIRT_MIN,
    VMALLOC_VIRT_START,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};
use kernel_vmem::{Mmu, PhysMapper, VirtualMemory};
use log::{debug, info, warn};

const HEADER_MAGIC: u32 = 0x564D_414C;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct VmallocHeader {
    extent: u32,
    size: u32,
    magic: u32,
    reserved: u32,
}

const HEADER_SIZE: u32 = size_of::<VmallocHeader>() as u32;

const _: () = assert!(HEADER_SIZE == 16);

/// Byte totals of both extent lists, see [`Vmalloc::stats`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmallocStats {
    pub free_extents: usize,
    pub free_bytes: u32,
    pub occupied_extents: usize,
    pub occupied_bytes: u32,
    pub brk: VirtualAddress,
}

/// Hands out one frame at a time: upward from the end of the kernel's linear
/// window, then downward from just below it.
struct FrameCursor {
    start: u32,
    index: u32,
    reverse: bool,
}

impl FrameCursor {
    fn new(frames: &BitmapFrameAllocator<'_>) -> Self {
        let start = ((KERNEL_VIRT_LINEAR_MAPPING_END - KERNEL_VIRT_START) / PAGE_SIZE)
            .min(frames.total_frames());
        Self {
            start,
            index: start,
            reverse: false,
        }
    }

    fn next(&mut self, frames: &mut BitmapFrameAllocator<'_>) -> Option<PhysicalAddress> {
        if !self.reverse {
            if let Some(pa) = frames.alloc_frames_from(1, self.index, false) {
                self.index = pa.frame().index() + 1;
                return Some(pa);
            }
            self.reverse = true;
            self.index = self.start.checked_sub(1)?;
        }
        let pa = frames.alloc_frames_from(1, self.index, true)?;
        self.index = pa.frame().index().saturating_sub(1);
        Some(pa)
    }
}

/// The virtual heap.
pub struct Vmalloc {
    arena: ExtentArena,
    free: ExtentList,
    occupied: ExtentList,
    brk: VirtualAddress,
}

impl Default for Vmalloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Vmalloc {
    /// One free extent covering the whole vmalloc window.
    #[must_use]
    pub fn new() -> Self {
        let mut arena = ExtentArena::new();
        let mut free = ExtentList::new();
        if let Some(all) = arena.alloc(VMALLOC_VIRT_START, VMALLOC_VIRT_END, ExtentState::Free) {
            arena.push_front(&mut free, all);
        }
        info!(
            "Initialized vmalloc at {} - {}",
            VirtualAddress::new(VMALLOC_VIRT_START),
            VirtualAddress::new(VMALLOC_VIRT_END)
        );
        Self {
            arena,
            free,
            occupied: ExtentList::new(),
            brk: VirtualAddress::new(VMALLOC_VIRT_START),
        }
    }

    /// Allocate `size` bytes of freshly mapped memory.
    ///
    /// # Errors
    /// - [`AllocError::ZeroSize`] for `size == 0`.
    /// - [`AllocError::OutOfAddressSpace`] if no free extent is large enough.
    /// - [`AllocError::OutOfExtentNodes`] if the extent would have to be split
    ///   and no node is left.
    /// - [`AllocError::OutOfPhysicalMemory`] if frames or page tables run out;
    ///   every frame and mapping taken so far is released again.
    pub fn alloc<M: PhysMapper, U: Mmu>(
        &mut self,
        mm: &mut MemoryManager<'_, M, U>,
        size: u32,
    ) -> Result<VirtualAddress, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let total = size
            .checked_add(HEADER_SIZE)
            .and_then(|bytes| align_up(bytes, PAGE_SIZE))
            .ok_or(AllocError::OutOfAddressSpace)?;

        let best = self.best_fit(total).ok_or(AllocError::OutOfAddressSpace)?;
        let claimed = self.split(best, total)?;
        self.arena.unlink(&mut self.free, claimed);

        let base = self.arena.get(claimed).min;
        if let Err(e) = Self::back_pages(mm, base, total / PAGE_SIZE) {
            self.insert_free(claimed);
            warn!("vmalloc of {size} bytes failed: {e}");
            return Err(e);
        }

        self.arena.get_mut(claimed).state = ExtentState::Occupied;
        self.arena.push_front(&mut self.occupied, claimed);

        let header = VirtualAddress::new(base);
        mm.write(
            header,
            VmallocHeader {
                extent: u32::from(claimed.raw()),
                size,
                magic: HEADER_MAGIC,
                reserved: 0,
            },
        );
        debug!("vmalloc {size} bytes at {header} ({} pages)", total / PAGE_SIZE);
        Ok(header + HEADER_SIZE)
    }

    /// The smallest free extent of at least `total` bytes; an exact fit wins
    /// immediately.
    fn best_fit(&self, total: u32) -> Option<ExtentId> {
        let mut best: Option<(ExtentId, u32)> = None;
        for (id, extent) in self.arena.iter(&self.free) {
            let len = extent.len();
            if len == total {
                return Some(id);
            }
            if len > total && best.is_none_or(|(_, best_len)| len < best_len) {
                best = Some((id, len));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Cut `total` bytes off the low end of `id`, returning the node that
    /// describes them. The new node stays in the free list in front of `id`.
    fn split(&mut self, id: ExtentId, total: u32) -> Result<ExtentId, AllocError> {
        let extent = *self.arena.get(id);
        if extent.len() == total {
            return Ok(id);
        }
        let low = self
            .arena
            .alloc(extent.min, extent.min + total - 1, ExtentState::Free)
            .ok_or(AllocError::OutOfExtentNodes)?;
        self.arena.insert_before(&mut self.free, id, low);
        self.arena.get_mut(id).min = extent.min + total;
        Ok(low)
    }

    /// Map `pages` pages starting at `base`, each to its own frame.
    fn back_pages<M: PhysMapper, U: Mmu>(
        mm: &mut MemoryManager<'_, M, U>,
        base: u32,
        pages: u32,
    ) -> Result<(), AllocError> {
        let mut cursor = FrameCursor::new(&mm.frames);
        for page in 0..pages {
            let va = VirtualAddress::new(base + page * PAGE_SIZE);
            let mapped = match cursor.next(&mut mm.frames) {
                Some(pa) => {
                    let result = mm.paging.map_page(&mut mm.frames, pa, va);
                    if result.is_err() {
                        mm.frames.free_frames(pa, 1);
                    }
                    result.is_ok()
                }
                None => false,
            };
            if !mapped {
                Self::release_pages(mm, base, page);
                return Err(AllocError::OutOfPhysicalMemory);
            }
        }
        Ok(())
    }

    /// Unmap `pages` pages starting at `base` and free their frames.
    ///
    /// # Panics
    /// If one of the pages is not mapped.
    fn release_pages<M: PhysMapper, U: Mmu>(
        mm: &mut MemoryManager<'_, M, U>,
        base: u32,
        pages: u32,
    ) {
        for page in 0..pages {
            let va = VirtualAddress::new(base + page * PAGE_SIZE);
            match mm.paging.unmap_page(va) {
                Ok(frame) => mm.frames.free_frames(frame.base(), 1),
                Err(e) => panic!("vmalloc: page {va} of a live allocation is gone: {e}"),
            }
        }
    }

    /// Return `id` to the free list in address order and merge it with
    /// touching neighbours.
    fn insert_free(&mut self, id: ExtentId) {
        self.arena.get_mut(id).state = ExtentState::Free;
        let min = self.arena.get(id).min;

        let mut before = None;
        let mut after = self.free.head();
        while let Some(next) = after {
            if self.arena.get(next).min > min {
                break;
            }
            before = Some(next);
            after = self.arena.next(next);
        }
        match (before, after) {
            (_, Some(after)) => self.arena.insert_before(&mut self.free, after, id),
            (Some(before), None) => self.arena.insert_after(&mut self.free, before, id),
            (None, None) => self.arena.push_front(&mut self.free, id),
        }

        let mut id = id;
        if let Some(prev) = self.arena.prev(id)
            && self.arena.get(prev).touches(self.arena.get(id))
        {
            self.arena.get_mut(prev).max = self.arena.get(id).max;
            self.arena.unlink(&mut self.free, id);
            self.arena.release(id);
            id = prev;
        }
        if let Some(next) = self.arena.next(id)
            && self.arena.get(id).touches(self.arena.get(next))
        {
            self.arena.get_mut(id).max = self.arena.get(next).max;
            self.arena.unlink(&mut self.free, next);
            self.arena.release(next);
        }
    }

    /// Recover and validate the header of a pointer handed out by
    /// [`alloc`](Self::alloc).
    ///
    /// # Panics
    /// If `ptr` is not a live vmalloc allocation.
    fn checked_header<M: PhysMapper, U: Mmu>(
        &self,
        mm: &MemoryManager<'_, M, U>,
        ptr: VirtualAddress,
    ) -> (ExtentId, VmallocHeader) {
        assert!(
            ptr.page_offset() == HEADER_SIZE && ptr.as_u32() >= VMALLOC_VIRT_MIN,
            "vmalloc: {ptr} is not a vmalloc pointer"
        );
        let base = VirtualAddress::new(ptr.as_u32() - HEADER_SIZE);
        assert!(
            mm.paging.translate(base).is_some(),
            "vmalloc: {ptr} is not allocated (double free?)"
        );
        let header: VmallocHeader = mm.read(base);
        assert!(
            header.magic == HEADER_MAGIC,
            "vmalloc: corrupt header at {base} (magic {:#010X})",
            header.magic
        );
        let id = self.arena.id(header.extent).unwrap_or_else(|| {
            panic!("vmalloc: corrupt header at {base} (extent {})", header.extent)
        });
        let extent = self.arena.get(id);
        assert!(
            extent.state == ExtentState::Occupied && extent.min == base.as_u32(),
            "vmalloc: corrupt header at {base} (extent {} is not this allocation)",
            header.extent
        );
        (id, header)
    }

    /// Unmap and release the allocation at `ptr`. A null pointer is ignored.
    ///
    /// # Panics
    /// On a foreign or corrupt pointer, a double free, or if a page of the
    /// allocation is no longer mapped.
    pub fn free<M: PhysMapper, U: Mmu>(
        &mut self,
        mm: &mut MemoryManager<'_, M, U>,
        ptr: VirtualAddress,
    ) {
        if ptr.is_null() {
            return;
        }
        let (id, _) = self.checked_header(mm, ptr);
        let extent = *self.arena.get(id);
        Self::release_pages(mm, extent.min, extent.len() / PAGE_SIZE);

        self.arena.unlink(&mut self.occupied, id);
        self.insert_free(id);
        debug!("vfree {ptr} ({} pages)", extent.len() / PAGE_SIZE);
    }

    /// Requested size of the allocation at `ptr`.
    ///
    /// # Panics
    /// On a foreign or corrupt pointer.
    pub fn size<M: PhysMapper, U: Mmu>(
        &self,
        mm: &MemoryManager<'_, M, U>,
        ptr: VirtualAddress,
    ) -> u32 {
        self.checked_header(mm, ptr).1.size
    }

    /// Move the low end of the vmalloc window by `increment` bytes (rounded to
    /// pages) and return the new break.
    ///
    /// A positive increment grows the window toward [`VMALLOC_VIRT_MIN`], a
    /// negative one gives unused space at the low end back (never above
    /// [`VMALLOC_VIRT_START`]), zero just reports the break.
    ///
    /// # Errors
    /// [`AllocError::BreakOutOfRange`] if the request leaves the permitted
    /// range or the low end is in use, [`AllocError::OutOfExtentNodes`] if a
    /// new extent is needed and none is left.
    pub fn brk(&mut self, increment: i32) -> Result<VirtualAddress, AllocError> {
        let bytes =
            align_up(increment.unsigned_abs(), PAGE_SIZE).ok_or(AllocError::BreakOutOfRange)?;
        match increment.signum() {
            1 => self.grow(bytes),
            -1 => self.shrink(bytes),
            _ => Ok(self.brk),
        }
    }

    fn grow(&mut self, bytes: u32) -> Result<VirtualAddress, AllocError> {
        let brk = self.brk.as_u32();
        if bytes >= brk - VMALLOC_VIRT_MIN {
            warn!("vbrk: requested too many bytes ({bytes})");
            return Err(AllocError::BreakOutOfRange);
        }
        let new = brk - bytes;

        match self.free.head() {
            Some(head) if self.arena.get(head).min == brk => self.arena.get_mut(head).min = new,
            _ => {
                let id = self
                    .arena
                    .alloc(new, brk - 1, ExtentState::Free)
                    .ok_or(AllocError::OutOfExtentNodes)?;
                self.arena.push_front(&mut self.free, id);
            }
        }

        self.brk = VirtualAddress::new(new);
        debug!("vbrk grown by {bytes} bytes to {}", self.brk);
        Ok(self.brk)
    }

    fn shrink(&mut self, bytes: u32) -> Result<VirtualAddress, AllocError> {
        let brk = self.brk.as_u32();
        let new = brk
            .checked_add(bytes)
            .filter(|&new| new <= VMALLOC_VIRT_START)
            .ok_or(AllocError::BreakOutOfRange)?;
        let head = self
            .free
            .head()
            .filter(|&head| self.arena.get(head).min == brk && self.arena.get(head).len() >= bytes)
            .ok_or(AllocError::BreakOutOfRange)?;

        if self.arena.get(head).len() == bytes {
            self.arena.unlink(&mut self.free, head);
            self.arena.release(head);
        } else {
            self.arena.get_mut(head).min = new;
        }

        self.brk = VirtualAddress::new(new);
        debug!("vbrk shrunk by {bytes} bytes to {}", self.brk);
        Ok(self.brk)
    }

    /// Free extents as inclusive `(min, max)` pairs, in address order.
    pub fn free_extents(&self) -> impl Iterator<Item = (VirtualAddress, VirtualAddress)> + '_ {
        self.arena
            .iter(&self.free)
            .map(|(_, e)| (VirtualAddress::new(e.min), VirtualAddress::new(e.max)))
    }

    /// Occupied extents as inclusive `(min, max)` pairs, newest first.
    pub fn occupied_extents(&self) -> impl Iterator<Item = (VirtualAddress, VirtualAddress)> + '_ {
        self.arena
            .iter(&self.occupied)
            .map(|(_, e)| (VirtualAddress::new(e.min), VirtualAddress::new(e.max)))
    }

    #[must_use]
    pub fn stats(&self) -> VmallocStats {
        VmallocStats {
            free_extents: self.free.len(),
            free_bytes: self.arena.iter(&self.free).map(|(_, e)| e.len()).sum(),
            occupied_extents: self.occupied.len(),
            occupied_bytes: self.arena.iter(&self.occupied).map(|(_, e)| e.len()).sum(),
            brk: self.brk,
        }
    }

    /// Print both extent lists with byte totals.
    ///
    /// # Errors
    /// Propagates errors of the writer.
    pub fn dump(&self, w: &mut impl fmt::Write) -> fmt::Result {
        let stats = self.stats();
        writeln!(w, "Vmalloc heap info:")?;
        writeln!(w, "Free address space:")?;
        for (min, max) in self.free_extents() {
            writeln!(w, "  {min} - {max}")?;
        }
        writeln!(w, "\nTotal free: {} bytes", stats.free_bytes)?;
        writeln!(w, "\nOccupied address space:")?;
        for (min, max) in self.occupied_extents() {
            writeln!(w, "  {min} - {max}")?;
        }
        writeln!(w, "\nTotal allocated: {} bytes", stats.occupied_bytes)
    }
}
