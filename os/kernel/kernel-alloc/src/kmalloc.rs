//! # Kernel Heap (kmalloc)
//!
//! Small objects come from *bins*: one page per bin, a 16-byte bin header
//! at the start and the rest cut into equally sized slots of one size class.
//! Objects of a page or more come from *big classes*, whose slots are carved
//! from the heap one at a time and recycled through a per-class free list.
//!
//! ```text
//! bin page:  ┌──────────┬────────┬──────────┬────────┬──────────┬─ … ─┐
//!            │BinHeader │ header │ payload  │ header │ payload  │     │
//!            └──────────┴────────┴──────────┴────────┴──────────┴─ … ─┘
//!                 16       32      class       32      class
//! ```
//!
//! Every slot starts with a 32-byte slot header linking it into either the
//! free or the occupied list of its owner. All pointers handed out are 16-byte
//! aligned. Headers are read and written through [`VirtualMemory`].
//!
//! The heap itself is a window of the kernel break: [`KMALLOC_TOTAL_CAPACITY`]
//! bytes are reserved up front and the break is pushed further on demand.

use crate::brk::Break;
use crate::{AllocError, InitError};
use core::fmt;
use kernel_info::memory::{KMALLOC_DEFAULT_BINS, KMALLOC_TOTAL_CAPACITY};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_down};
use kernel_vmem::VirtualMemory;
use log::{debug, info, warn};

/// Small size classes, in bytes.
pub const SMALL_CLASSES: [u32; 5] = [64, 128, 256, 512, 1024];

/// Big size classes: 1, 2, 4, 8, 16 and 32 pages minus the slot header.
pub const BIG_CLASSES: [u32; 6] = big_classes();

/// Largest size [`Kmalloc::alloc`] serves.
pub const KMALLOC_MAX_SIZE: u32 = BIG_CLASSES[BIG_CLASSES.len() - 1];

const HEADER_SIZE: u32 = size_of::<SlotHeader>() as u32;
const BIN_HEADER_SIZE: u32 = size_of::<BinHeader>() as u32;

const SLOT_MAGIC: u32 = 0x4B4D_414C;
const STATE_FREE: u32 = 0x4652_4545;
const STATE_OCCUPIED: u32 = 0x5553_4544;

const fn big_classes() -> [u32; 6] {
    let pages = [1, 2, 4, 8, 16, 32];
    let mut classes = [0; 6];
    let mut i = 0;
    while i < pages.len() {
        classes[i] = pages[i] * PAGE_SIZE - HEADER_SIZE;
        i += 1;
    }
    classes
}

/// Prefix of every slot.
///
/// `bin` is the owning bin page for small slots and `class + 1` for big
/// slots; neither is ever zero.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct SlotHeader {
    prev: u32,
    next: u32,
    size: u32,
    bin: u32,
    magic: u32,
    state: u32,
    reserved: [u32; 2],
}

/// Start of every bin page.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct BinHeader {
    next_bin: u32,
    slot_size: u32,
    free_head: u32,
    occupied_head: u32,
}

const _: () = {
    assert!(HEADER_SIZE == 32);
    assert!(HEADER_SIZE.is_multiple_of(16));
    assert!(BIN_HEADER_SIZE == 16);
    assert!(SMALL_CLASSES[SMALL_CLASSES.len() - 1] < BIG_CLASSES[0]);
};

#[derive(Copy, Clone, Debug, Default)]
struct BigBin {
    free_head: u32,
    occupied_head: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Owner {
    Bin(VirtualAddress),
    Big(usize),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SlotList {
    Free,
    Occupied,
}

impl SlotList {
    const fn state(self) -> u32 {
        match self {
            Self::Free => STATE_FREE,
            Self::Occupied => STATE_OCCUPIED,
        }
    }
}

impl SlotHeader {
    const fn new(size: u32, bin: u32) -> Self {
        Self {
            prev: 0,
            next: 0,
            size,
            bin,
            magic: SLOT_MAGIC,
            state: STATE_FREE,
            reserved: [0; 2],
        }
    }
}

impl BinHeader {
    const fn head(&self, list: SlotList) -> u32 {
        match list {
            SlotList::Free => self.free_head,
            SlotList::Occupied => self.occupied_head,
        }
    }

    const fn head_mut(&mut self, list: SlotList) -> &mut u32 {
        match list {
            SlotList::Free => &mut self.free_head,
            SlotList::Occupied => &mut self.occupied_head,
        }
    }
}

impl BigBin {
    const fn head(&self, list: SlotList) -> u32 {
        match list {
            SlotList::Free => self.free_head,
            SlotList::Occupied => self.occupied_head,
        }
    }

    const fn head_mut(&mut self, list: SlotList) -> &mut u32 {
        match list {
            SlotList::Free => &mut self.free_head,
            SlotList::Occupied => &mut self.occupied_head,
        }
    }
}

/// Slot counts of one size class.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ClassStats {
    pub size: u32,
    pub bins: u32,
    pub free: u32,
    pub occupied: u32,
}

/// Snapshot of the heap, see [`Kmalloc::stats`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KmallocStats {
    pub small: [ClassStats; SMALL_CLASSES.len()],
    pub big: [ClassStats; BIG_CLASSES.len()],
    /// Bytes between the carve pointer and the end of the heap window.
    pub reserve: u32,
}

fn small_class(size: u32) -> Option<usize> {
    SMALL_CLASSES.iter().position(|&class| size <= class)
}

fn big_class(size: u32) -> Option<usize> {
    BIG_CLASSES.iter().position(|&class| size <= class)
}

/// The kernel heap.
pub struct Kmalloc {
    curr: VirtualAddress,
    end: VirtualAddress,
    bins: [u32; SMALL_CLASSES.len()],
    big: [BigBin; BIG_CLASSES.len()],
}

impl Kmalloc {
    /// Reserve the heap window through `heap` and pre-create
    /// [`KMALLOC_DEFAULT_BINS`] bins per small class.
    ///
    /// # Errors
    /// [`InitError::KmallocHeap`] if the window cannot be reserved. A bin that
    /// cannot be created is only logged.
    pub fn new<H: Break + VirtualMemory>(heap: &mut H) -> Result<Self, InitError> {
        let start = heap
            .sbrk(KMALLOC_TOTAL_CAPACITY)
            .map_err(InitError::KmallocHeap)?;
        let mut kmalloc = Self {
            curr: start,
            end: heap.brk(),
            bins: [0; SMALL_CLASSES.len()],
            big: [BigBin::default(); BIG_CLASSES.len()],
        };

        for _ in 0..KMALLOC_DEFAULT_BINS {
            for (class, size) in SMALL_CLASSES.iter().enumerate() {
                if let Err(e) = kmalloc.create_bin(heap, class) {
                    warn!("Could not create kmalloc bin for size {size}: {e}");
                }
            }
        }

        info!("Initialized kmalloc at {start} - {}", kmalloc.end);
        Ok(kmalloc)
    }

    /// Allocate `size` bytes. The returned address is 16-byte aligned.
    ///
    /// # Errors
    /// - [`AllocError::ZeroSize`] / [`AllocError::TooLarge`] for sizes outside
    ///   `1..=KMALLOC_MAX_SIZE`.
    /// - Any error of the break when the heap has to grow.
    pub fn alloc<H: Break + VirtualMemory>(
        &mut self,
        heap: &mut H,
        size: u32,
    ) -> Result<VirtualAddress, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if let Some(class) = small_class(size) {
            self.alloc_small(heap, class)
        } else if let Some(class) = big_class(size) {
            self.alloc_big(heap, class)
        } else {
            Err(AllocError::TooLarge {
                size,
                max: KMALLOC_MAX_SIZE,
            })
        }
    }

    fn alloc_small<H: Break + VirtualMemory>(
        &mut self,
        heap: &mut H,
        class: usize,
    ) -> Result<VirtualAddress, AllocError> {
        let mut bin = self.bins[class];
        while bin != 0 {
            let header: BinHeader = heap.read(VirtualAddress::new(bin));
            if header.free_head != 0 {
                break;
            }
            bin = header.next_bin;
        }

        let bin = if bin == 0 {
            self.create_bin(heap, class)?
        } else {
            VirtualAddress::new(bin)
        };
        let slot = VirtualAddress::new(heap.read::<BinHeader>(bin).free_head);
        Ok(self.take(heap, Owner::Bin(bin), slot))
    }

    fn alloc_big<H: Break + VirtualMemory>(
        &mut self,
        heap: &mut H,
        class: usize,
    ) -> Result<VirtualAddress, AllocError> {
        let owner = Owner::Big(class);
        let free = self.big[class].free_head;
        if free != 0 {
            return Ok(self.take(heap, owner, VirtualAddress::new(free)));
        }

        let size = BIG_CLASSES[class];
        let slot = self.carve(heap, size + HEADER_SIZE)?;
        heap.write(slot, SlotHeader::new(size, class as u32 + 1));
        self.push_front(heap, owner, SlotList::Occupied, slot);
        debug!("New big kmalloc slot of {size} bytes at {slot}");
        Ok(slot + HEADER_SIZE)
    }

    /// Move `slot` from the free to the occupied list and return its payload.
    fn take<H: VirtualMemory>(
        &mut self,
        heap: &mut H,
        owner: Owner,
        slot: VirtualAddress,
    ) -> VirtualAddress {
        self.unlink(heap, owner, SlotList::Free, slot);
        self.push_front(heap, owner, SlotList::Occupied, slot);
        slot + HEADER_SIZE
    }

    /// Take `bytes` from the heap window, growing the break if needed.
    ///
    /// If something else moved the break since the last growth, the rest of
    /// the current window is abandoned and carving restarts at the old break.
    fn carve<H: Break>(&mut self, heap: &mut H, bytes: u32) -> Result<VirtualAddress, AllocError> {
        let available = self.end.as_u32() - self.curr.as_u32();
        if available < bytes {
            if heap.brk() == self.end {
                heap.sbrk(bytes - available)?;
            } else {
                self.curr = heap.sbrk(bytes)?;
            }
            self.end = heap.brk();
            debug!("kmalloc heap extended to {}", self.end);
        }
        let start = self.curr;
        self.curr += bytes;
        Ok(start)
    }

    fn create_bin<H: Break + VirtualMemory>(
        &mut self,
        heap: &mut H,
        class: usize,
    ) -> Result<VirtualAddress, AllocError> {
        let size = SMALL_CLASSES[class];
        let bin = self.carve(heap, PAGE_SIZE)?;
        heap.write(
            bin,
            BinHeader {
                next_bin: self.bins[class],
                slot_size: size,
                free_head: 0,
                occupied_head: 0,
            },
        );
        self.bins[class] = bin.as_u32();

        let stride = size + HEADER_SIZE;
        let slots = (PAGE_SIZE - BIN_HEADER_SIZE) / stride;
        for i in (0..slots).rev() {
            let slot = bin + BIN_HEADER_SIZE + i * stride;
            heap.write(slot, SlotHeader::new(size, bin.as_u32()));
            self.push_front(heap, Owner::Bin(bin), SlotList::Free, slot);
        }

        debug!("Created kmalloc bin for size {size} at {bin} ({slots} slots)");
        Ok(bin)
    }

    fn head<H: VirtualMemory>(&self, heap: &H, owner: Owner, list: SlotList) -> u32 {
        match owner {
            Owner::Bin(bin) => heap.read::<BinHeader>(bin).head(list),
            Owner::Big(class) => self.big[class].head(list),
        }
    }

    fn set_head<H: VirtualMemory>(
        &mut self,
        heap: &mut H,
        owner: Owner,
        list: SlotList,
        slot: u32,
    ) {
        match owner {
            Owner::Bin(bin) => {
                let mut header: BinHeader = heap.read(bin);
                *header.head_mut(list) = slot;
                heap.write(bin, header);
            }
            Owner::Big(class) => *self.big[class].head_mut(list) = slot,
        }
    }

    fn push_front<H: VirtualMemory>(
        &mut self,
        heap: &mut H,
        owner: Owner,
        list: SlotList,
        slot: VirtualAddress,
    ) {
        let first = self.head(heap, owner, list);
        let mut header: SlotHeader = heap.read(slot);
        header.prev = 0;
        header.next = first;
        header.state = list.state();
        heap.write(slot, header);

        if first != 0 {
            let first = VirtualAddress::new(first);
            let mut next: SlotHeader = heap.read(first);
            next.prev = slot.as_u32();
            heap.write(first, next);
        }
        self.set_head(heap, owner, list, slot.as_u32());
    }

    fn unlink<H: VirtualMemory>(
        &mut self,
        heap: &mut H,
        owner: Owner,
        list: SlotList,
        slot: VirtualAddress,
    ) {
        let mut header: SlotHeader = heap.read(slot);
        if header.prev == 0 {
            debug_assert_eq!(self.head(heap, owner, list), slot.as_u32());
            self.set_head(heap, owner, list, header.next);
        } else {
            let prev = VirtualAddress::new(header.prev);
            let mut before: SlotHeader = heap.read(prev);
            before.next = header.next;
            heap.write(prev, before);
        }
        if header.next != 0 {
            let next = VirtualAddress::new(header.next);
            let mut after: SlotHeader = heap.read(next);
            after.prev = header.prev;
            heap.write(next, after);
        }
        header.prev = 0;
        header.next = 0;
        heap.write(slot, header);
    }

    /// Recover and validate the header of a pointer handed out by
    /// [`alloc`](Self::alloc).
    ///
    /// # Panics
    /// If `ptr` does not carry an intact kmalloc header.
    fn checked_header<H: VirtualMemory>(
        heap: &H,
        ptr: VirtualAddress,
    ) -> (VirtualAddress, SlotHeader, Owner) {
        assert!(ptr.is_aligned(16), "kmalloc: {ptr} is not 16-byte aligned");
        let slot = ptr
            .checked_sub(HEADER_SIZE)
            .unwrap_or_else(|| panic!("kmalloc: {ptr} is not a heap pointer"));
        let header: SlotHeader = heap.read(slot);
        assert!(
            header.magic == SLOT_MAGIC,
            "kmalloc: corrupt header at {slot} (magic {:#010X})",
            header.magic
        );
        assert!(
            header.state == STATE_FREE || header.state == STATE_OCCUPIED,
            "kmalloc: corrupt header at {slot} (state {:#010X})",
            header.state
        );
        assert_ne!(header.bin, 0, "kmalloc: header at {slot} has no bin");

        let owner = if header.bin as usize <= BIG_CLASSES.len() {
            let class = header.bin as usize - 1;
            assert!(
                BIG_CLASSES[class] == header.size,
                "kmalloc: header at {slot} claims size {} in big class {class}",
                header.size
            );
            Owner::Big(class)
        } else {
            let bin = VirtualAddress::new(header.bin);
            assert!(
                VirtualAddress::new(align_down(slot.as_u32(), PAGE_SIZE)) == bin,
                "kmalloc: header at {slot} names foreign bin {bin}"
            );
            assert!(
                SMALL_CLASSES.contains(&header.size)
                    && heap.read::<BinHeader>(bin).slot_size == header.size,
                "kmalloc: header at {slot} has unknown size {}",
                header.size
            );
            Owner::Bin(bin)
        };
        (slot, header, owner)
    }

    /// Return `ptr` to its bin. A null pointer is ignored.
    ///
    /// # Panics
    /// On a corrupt header or a double free.
    pub fn free<H: VirtualMemory>(&mut self, heap: &mut H, ptr: VirtualAddress) {
        if ptr.is_null() {
            return;
        }
        let (slot, header, owner) = Self::checked_header(heap, ptr);
        assert!(
            header.state == STATE_OCCUPIED,
            "kfree: double free of {ptr}"
        );
        self.unlink(heap, owner, SlotList::Occupied, slot);
        self.push_front(heap, owner, SlotList::Free, slot);
    }

    /// Usable size of the allocation at `ptr` (its size class).
    ///
    /// # Panics
    /// On a corrupt header or a pointer that is not allocated.
    pub fn size<H: VirtualMemory>(&self, heap: &H, ptr: VirtualAddress) -> u32 {
        let (_, header, _) = Self::checked_header(heap, ptr);
        assert!(
            header.state == STATE_OCCUPIED,
            "ksize: {ptr} is not allocated"
        );
        header.size
    }

    fn count<H: VirtualMemory>(heap: &H, mut slot: u32) -> u32 {
        let mut n = 0;
        while slot != 0 {
            n += 1;
            slot = heap.read::<SlotHeader>(VirtualAddress::new(slot)).next;
        }
        n
    }

    fn bin_stats<H: VirtualMemory>(&self, heap: &H, class: usize) -> ClassStats {
        let mut stats = ClassStats {
            size: SMALL_CLASSES[class],
            ..ClassStats::default()
        };
        let mut bin = self.bins[class];
        while bin != 0 {
            let header: BinHeader = heap.read(VirtualAddress::new(bin));
            stats.bins += 1;
            stats.free += Self::count(heap, header.free_head);
            stats.occupied += Self::count(heap, header.occupied_head);
            bin = header.next_bin;
        }
        stats
    }

    /// Walk every list and count slots.
    pub fn stats<H: VirtualMemory>(&self, heap: &H) -> KmallocStats {
        KmallocStats {
            small: core::array::from_fn(|class| self.bin_stats(heap, class)),
            big: core::array::from_fn(|class| ClassStats {
                size: BIG_CLASSES[class],
                bins: 1,
                free: Self::count(heap, self.big[class].free_head),
                occupied: Self::count(heap, self.big[class].occupied_head),
            }),
            reserve: self.end.as_u32() - self.curr.as_u32(),
        }
    }

    /// Print per-bin and per-big-class slot counts.
    ///
    /// # Errors
    /// Propagates errors of the writer.
    pub fn dump<H: VirtualMemory>(&self, heap: &H, w: &mut impl fmt::Write) -> fmt::Result {
        writeln!(w, "Kmalloc heap info:")?;
        for (class, &size) in SMALL_CLASSES.iter().enumerate() {
            writeln!(w, "Bins {class}, size {size}:")?;
            let (mut free, mut occupied) = (0, 0);
            let mut bin = self.bins[class];
            let mut index = 0;
            while bin != 0 {
                let header: BinHeader = heap.read(VirtualAddress::new(bin));
                let f = Self::count(heap, header.free_head);
                let o = Self::count(heap, header.occupied_head);
                writeln!(w, "  [{index}]: {f} free slot(s), {o} occupied slot(s)")?;
                free += f;
                occupied += o;
                index += 1;
                bin = header.next_bin;
            }
            writeln!(w, "  {free} total free slot(s), {occupied} occupied")?;
        }
        for (class, &size) in BIG_CLASSES.iter().enumerate() {
            writeln!(
                w,
                "Big bin {class}, size {size}: {} free slot(s), {} occupied slot(s)",
                Self::count(heap, self.big[class].free_head),
                Self::count(heap, self.big[class].occupied_head)
            )?;
        }
        writeln!(
            w,
            "Heap window {} - {}, {} bytes unclaimed",
            self.curr,
            self.end,
            self.end.as_u32() - self.curr.as_u32()
        )
    }
}
