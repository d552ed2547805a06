//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame of physical memory, packed into `u32` words
//! (`1` = used). The bitmap itself lives in physical memory right after the
//! kernel image and is reached through a [`PhysMapper`].
//!
//! ```text
//! 0          kernel.start    kernel.end  bitmap      bitmap end
//! ├──────────────┼──────────────┼────────┼─────────────┼──────────── … total
//! │   reserved   │ kernel image │  pad   │ frame bits  │ free frames
//! └──────────────┴──────────────┴────────┴─────────────┴──────────── …
//!  ◄────────────── marked used during init ───────────►
//! ```
//!
//! Frame `0` is always used and never handed out, so a frame address of `0`
//! never denotes a valid allocation.

use core::fmt;
use kernel_info::boot::{BootMemoryInfo, KernelImage};
use kernel_info::memory::FRAME_BITMAP_ALIGN;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, trace};

const BITS_PER_WORD: u32 = u32::BITS;

/// Largest physical address (exclusive) the 32-bit allocator can manage.
const PHYS_LIMIT: u64 = 1 << 32;

/// Bitmap-backed allocator over all detected physical memory.
pub struct BitmapFrameAllocator<'m> {
    bitmap: &'m mut [u32],
    bitmap_start: PhysicalAddress,
    total_frames: u32,
    used_frames: u32,
    total_memory: u64,
}

impl<'m> BitmapFrameAllocator<'m> {
    /// Size the bitmap from the boot memory map and reserve everything that is
    /// not free RAM.
    ///
    /// # Panics
    /// - The boot information carries no memory map.
    /// - A memory map entry is empty or reaches beyond 32 bits.
    /// - The bitmap does not fit into the available range it starts in.
    pub fn init<M: PhysMapper>(
        mapper: &'m M,
        boot: &BootMemoryInfo<'_>,
        kernel: KernelImage,
    ) -> Self {
        assert!(
            boot.has_memory_map(),
            "memory map is not present in the boot information"
        );
        if let Some(legacy) = boot.legacy_total_bytes() {
            debug!("Boot loader reports {} KiB of memory", legacy >> 10);
        }

        let mut total_memory = 0;
        for entry in boot.memory_map {
            assert!(entry.length > 0, "empty memory map entry at {:#X}", entry.base);
            assert!(
                entry.base < PHYS_LIMIT && entry.end() <= PHYS_LIMIT,
                "memory map entry {:#X}+{:#X} is not 32-bit addressable",
                entry.base,
                entry.length
            );
            if entry.kind.is_available() {
                total_memory = total_memory.max(entry.end());
            }
        }

        let total_frames = u32::try_from(total_memory / u64::from(PAGE_SIZE))
            .unwrap_or(1 << 20);
        let words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = words * (BITS_PER_WORD / 8);
        let bitmap_start = align_up(kernel.end.as_u32(), FRAME_BITMAP_ALIGN)
            .map(PhysicalAddress::new)
            .unwrap_or_else(|| {
                panic!("kernel image ends at {} with no room for the bitmap", kernel.end)
            });
        let bitmap_end = u64::from(bitmap_start.as_u32()) + u64::from(bitmap_bytes);

        let home = boot.memory_map.iter().find(|e| {
            e.base <= u64::from(bitmap_start.as_u32()) && u64::from(bitmap_start.as_u32()) < e.end()
        });
        match home {
            Some(entry) => {
                assert!(
                    entry.kind.is_available(),
                    "frame bitmap at {bitmap_start} lies in an unavailable memory region"
                );
                assert!(
                    bitmap_end <= entry.end(),
                    "frame bitmap at {bitmap_start} ({bitmap_bytes} bytes) overruns its memory region"
                );
            }
            None => panic!("frame bitmap at {bitmap_start} is outside every memory map entry"),
        }

        info!(
            "Kernel loaded at {} - {}, {} KiB of memory in {total_frames} frames",
            kernel.start,
            kernel.end,
            total_memory >> 10
        );
        debug!("Frame bitmap at {bitmap_start}, {words} words");

        let bitmap = unsafe {
            let first = mapper.phys_to_mut::<u32>(bitmap_start);
            core::slice::from_raw_parts_mut(core::ptr::from_mut(first), words as usize)
        };
        bitmap.fill(0);

        let mut frames = Self {
            bitmap,
            bitmap_start,
            total_frames,
            used_frames: 0,
            total_memory,
        };

        for entry in boot.memory_map {
            if entry.kind.is_available() || entry.base >= total_memory {
                continue;
            }
            frames.mark_region_used(entry.base, entry.end().min(total_memory));
        }
        frames.mark_region_used(0, bitmap_end);

        debug!(
            "{} of {} frames in use after reserving the kernel and the bitmap",
            frames.used_frames, frames.total_frames
        );
        frames
    }

    /// Mark every frame touching `[start, end)` as used.
    fn mark_region_used(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let first = start / u64::from(PAGE_SIZE);
        let last = (end - 1) / u64::from(PAGE_SIZE);
        for index in first..=last {
            if let Ok(index) = u32::try_from(index)
                && index < self.total_frames
            {
                self.set_used(index);
            }
        }
    }

    #[inline]
    const fn locate(index: u32) -> (usize, u32) {
        ((index / BITS_PER_WORD) as usize, 1 << (index % BITS_PER_WORD))
    }

    /// Whether frame `index` is free.
    ///
    /// # Panics
    /// If `index` is outside the managed range.
    #[must_use]
    pub fn is_frame_free(&self, index: u32) -> bool {
        assert!(
            index < self.total_frames,
            "frame index {index} out of range ({} frames)",
            self.total_frames
        );
        let (word, mask) = Self::locate(index);
        self.bitmap[word] & mask == 0
    }

    fn set_used(&mut self, index: u32) {
        if self.is_frame_free(index) {
            self.used_frames += 1;
        }
        let (word, mask) = Self::locate(index);
        self.bitmap[word] |= mask;
    }

    fn set_free(&mut self, index: u32) {
        assert_ne!(index, 0, "frame 0 can never be freed");
        if !self.is_frame_free(index) {
            self.used_frames -= 1;
        }
        let (word, mask) = Self::locate(index);
        self.bitmap[word] &= !mask;
    }

    fn claim(&mut self, first: u32, count: u32) -> PhysicalAddress {
        for index in first..first + count {
            self.set_used(index);
        }
        let pa = PhysicalPage::from_index(first).base();
        trace!("Allocated {count} frame(s) at {pa}");
        pa
    }

    /// Allocate `count` contiguous frames, first fit from the bottom of memory.
    ///
    /// Returns the address of the first frame, or `None` if `count` is zero or
    /// no run is large enough.
    pub fn alloc_frames(&mut self, count: u32) -> Option<PhysicalAddress> {
        self.alloc_frames_from(count, 1, false)
    }

    /// Allocate `count` contiguous frames, scanning from `start_index`.
    ///
    /// A forward scan returns the lowest run starting at or above
    /// `start_index`; a reverse scan returns the highest run ending at or
    /// below it. Frame 0 is never part of a run.
    pub fn alloc_frames_from(
        &mut self,
        count: u32,
        start_index: u32,
        reverse: bool,
    ) -> Option<PhysicalAddress> {
        if count == 0 || count > self.available_frames() {
            return None;
        }

        let mut run = 0;
        if reverse {
            let top = start_index.min(self.total_frames.checked_sub(1)?);
            for index in (1..=top).rev() {
                run = if self.is_frame_free(index) { run + 1 } else { 0 };
                if run == count {
                    return Some(self.claim(index, count));
                }
            }
        } else {
            for index in start_index.max(1)..self.total_frames {
                run = if self.is_frame_free(index) { run + 1 } else { 0 };
                if run == count {
                    return Some(self.claim(index + 1 - count, count));
                }
            }
        }
        None
    }

    /// Claim the `count` frames starting at `pa` if every one of them is free.
    ///
    /// # Panics
    /// If `pa` is not frame aligned.
    pub fn alloc_frames_at(&mut self, pa: PhysicalAddress, count: u32) -> Option<PhysicalAddress> {
        assert!(pa.is_page_aligned(), "{pa} is not frame aligned");
        let first = pa.frame().index();
        let end = first.checked_add(count)?;
        if count == 0 || first == 0 || end > self.total_frames {
            return None;
        }
        if (first..end).all(|index| self.is_frame_free(index)) {
            Some(self.claim(first, count))
        } else {
            None
        }
    }

    /// Release `count` frames starting at `pa`.
    ///
    /// # Panics
    /// If `pa` is not frame aligned, is frame 0, lies outside memory, or any
    /// of the frames is already free (double free).
    pub fn free_frames(&mut self, pa: PhysicalAddress, count: u32) {
        assert!(pa.is_page_aligned(), "{pa} does not point to the start of a frame");
        let first = pa.frame().index();
        assert_ne!(first, 0, "frame 0 can never be freed");
        let end = first
            .checked_add(count)
            .filter(|&end| end <= self.total_frames)
            .unwrap_or_else(|| {
                panic!("freeing {count} frame(s) at {pa} runs past physical memory")
            });

        trace!("Freeing {count} frame(s) at {pa}");
        for index in first..end {
            assert!(
                !self.is_frame_free(index),
                "double free of frame {index} ({})",
                PhysicalPage::from_index(index)
            );
            self.set_free(index);
        }
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> u32 {
        self.used_frames
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.total_frames
    }

    #[inline]
    #[must_use]
    pub const fn available_frames(&self) -> u32 {
        self.total_frames - self.used_frames
    }

    /// Bytes of physical memory (top of the highest available range).
    #[inline]
    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Bytes not covered by used frames.
    #[inline]
    #[must_use]
    pub const fn remaining_memory(&self) -> u64 {
        self.total_memory
            .saturating_sub(self.used_frames as u64 * PAGE_SIZE as u64)
    }

    /// Physical address of the frame bitmap.
    #[inline]
    #[must_use]
    pub const fn bitmap_start(&self) -> PhysicalAddress {
        self.bitmap_start
    }

    /// Print the physical memory map as runs of free and used frames.
    ///
    /// # Errors
    /// Propagates errors of the writer.
    pub fn dump(&self, w: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            w,
            "Memory map ({} frames, {} used):",
            self.total_frames, self.used_frames
        )?;
        let mut run_start = 0;
        while run_start < self.total_frames {
            let free = self.is_frame_free(run_start);
            let mut run_end = run_start + 1;
            while run_end < self.total_frames && self.is_frame_free(run_end) == free {
                run_end += 1;
            }
            let first = u64::from(run_start) * u64::from(PAGE_SIZE);
            let last = u64::from(run_end) * u64::from(PAGE_SIZE) - 1;
            writeln!(
                w,
                "  {}: {first:#010X}-{last:#010X} ({} KiB) frames {run_start}-{}",
                if free { "Free" } else { "Used" },
                (last - first + 1) >> 10,
                run_end - 1
            )?;
            run_start = run_end;
        }
        writeln!(w, "End of memory map")
    }
}

impl FrameAlloc for BitmapFrameAllocator<'_> {
    fn alloc_frame(&mut self) -> Option<PhysicalPage> {
        self.alloc_frames(1).map(PhysicalAddress::frame)
    }

    fn free_frame(&mut self, frame: PhysicalPage) {
        self.free_frames(frame.base(), 1);
    }
}
