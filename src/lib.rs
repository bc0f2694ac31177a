#![allow(clippy::missing_safety_doc)]

use core::{
  cell::RefCell,
  fmt,
  marker::PhantomData,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

#[cfg(not(unix))]
compile_error!("slotpool maps its pools with mmap/munmap; only Unix targets are supported");

// =============================================================================
// Constants
// =============================================================================

/// Payloads are aligned to this boundary.
pub const CACHE_LINE_SIZE: usize = 64;
pub const PAGE_SIZE: usize = 4096;

/// Requests of at least this many bytes bypass the pools and get their own mapping.
pub const LARGE_THRESHOLD: usize = 1 << 20; // 1MB

/// Number of geometric size classes (8 bytes ... 16GB nominal).
pub const SIZE_CLASSES: usize = 32;

/// Up to this size, classes advance in 8-byte steps.
const TINY_THRESHOLD: usize = 64;

/// Size-class index stored in the header of mmap-backed blocks.
pub const LARGE_CLASS: u8 = 255;

/// Largest payload a header can describe.
pub const MAX_BLOCK_SIZE: usize = 1 << 47;

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
const HEADER_MAGIC: u64 = 0xDEAD_BEEF_1234_5678;

// Packed header word: | marker:4 | reserved:2 | mmap:1 | free:1 | class:8 | size:48 |
const SIZE_MASK: u64 = (1 << 48) - 1;
const CLASS_SHIFT: u32 = 48;
const CLASS_MASK: u64 = 0xFF << CLASS_SHIFT;
const FREE_FLAG: u64 = 1 << 56;
const MMAP_FLAG: u64 = 1 << 57;
const MARKER_MASK: u64 = 0xF << 60;
const MARKER_VALUE: u64 = 0xA << 60;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(usize::BITS == 64, "header packing assumes 64-bit pointers");
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(CACHE_LINE_SIZE.is_power_of_two());
const _: () = assert!(PAGE_SIZE % CACHE_LINE_SIZE == 0);
const _: () = assert!(LARGE_THRESHOLD.is_power_of_two());
const _: () = assert!(HEADER_SIZE == CACHE_LINE_SIZE);
const _: () = assert!(core::mem::offset_of!(BlockHeader, magic) == HEADER_SIZE - 8);
const _: () = assert!(FREE_FLAG & (SIZE_MASK | CLASS_MASK | MARKER_MASK) == 0);
const _: () = assert!(MMAP_FLAG & (SIZE_MASK | CLASS_MASK | MARKER_MASK | FREE_FLAG) == 0);
const _: () = assert!((MAX_BLOCK_SIZE as u64) <= SIZE_MASK);
const _: () = assert!((LARGE_CLASS as usize) >= SIZE_CLASSES);
const _: () = assert!(CLASS_TABLE[0].size == 8);
const _: () = assert!(CLASS_TABLE[SIZE_CLASSES - 1].size == 1 << 34);
const _: () = assert!(CLASS_TABLE[size_class_of(LARGE_THRESHOLD - 1)].blocks >= 1);

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
  /// The OS refused a mapping, or the mapping would exceed the arena's budget.
  #[error("out of memory: could not map {bytes} bytes")]
  OutOfMemory { bytes: usize },
  /// The requested byte count overflows `usize` or cannot be encoded in a header.
  #[error("allocation size overflows the allocator's size accounting")]
  CapacityOverflow,
}

// =============================================================================
// Platform
// =============================================================================

/// Maps `len` bytes of anonymous, zero-filled, read-write memory.
fn os_reserve(len: usize) -> Result<NonNull<u8>, AllocError> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    log::debug!(
      "mmap of {} bytes failed: {}",
      len,
      std::io::Error::last_os_error()
    );
    return Err(AllocError::OutOfMemory { bytes: len });
  }

  NonNull::new(ptr.cast()).ok_or(AllocError::OutOfMemory { bytes: len })
}

/// Releases a whole mapping obtained from `os_reserve`.
unsafe fn os_release(ptr: NonNull<u8>, len: usize) {
  if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
    log::warn!(
      "munmap({:p}, {}) failed: {}",
      ptr,
      len,
      std::io::Error::last_os_error()
    );
  }
}

// =============================================================================
// Size Classes
// =============================================================================

/// Geometry of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
  /// Nominal payload size.
  pub size: usize,
  /// Header plus payload, rounded up to the class alignment.
  pub slot: usize,
  /// Slots carved out of one pool.
  pub blocks: usize,
  /// Length of one pool mapping. One page, unless a single slot is larger.
  pub pool_bytes: usize,
}

impl SizeClass {
  const fn new(index: usize) -> Self {
    let size = 1usize << (index + 3);
    // Large classes self-align.
    let align = if size > CACHE_LINE_SIZE { size } else { CACHE_LINE_SIZE };
    let slot = align_up(size + HEADER_SIZE, align);
    let pool_bytes = if slot > PAGE_SIZE { slot } else { PAGE_SIZE };
    Self {
      size,
      slot,
      blocks: pool_bytes / slot,
      pool_bytes,
    }
  }

  pub fn for_index(index: usize) -> Option<&'static SizeClass> {
    SIZE_CLASS_TABLE.get(index)
  }
}

const fn build_size_class_table() -> [SizeClass; SIZE_CLASSES] {
  let mut table = [SizeClass {
    size: 0,
    slot: 0,
    blocks: 0,
    pool_bytes: 0,
  }; SIZE_CLASSES];
  let mut i = 0;
  while i < SIZE_CLASSES {
    table[i] = SizeClass::new(i);
    i += 1;
  }
  table
}

const CLASS_TABLE: [SizeClass; SIZE_CLASSES] = build_size_class_table();

/// All size classes, indexed by class. Computed at compile-time.
pub static SIZE_CLASS_TABLE: [SizeClass; SIZE_CLASSES] = CLASS_TABLE;

/// Maps a byte count to its size class.
///
/// Up to 64 bytes the class is `(bytes - 1) / 8`; past that it is
/// `log2(bytes.next_power_of_two()) - 3`, clamped to the last class.
/// Every class returned for `bytes` has a nominal size of at least `bytes`
/// as long as `bytes` is below 2^34.
#[inline(always)]
pub const fn size_class_of(bytes: usize) -> usize {
  if bytes <= TINY_THRESHOLD {
    return bytes.saturating_sub(1) >> 3;
  }

  let class = match bytes.checked_next_power_of_two() {
    Some(pow) => pow.trailing_zeros() as usize - 3,
    None => SIZE_CLASSES - 1,
  };

  if class >= SIZE_CLASSES {
    SIZE_CLASSES - 1
  } else {
    class
  }
}

// =============================================================================
// Block Header
// =============================================================================

/// In-band metadata stored immediately before every payload.
///
/// The magic is the last word of the header, so it is the word directly
/// preceding the pointer handed to the caller.
#[repr(C, align(64))]
pub struct BlockHeader {
  /// Next block in the class free list. Unused while the block is allocated.
  next: *mut BlockHeader,
  _reserved: [u8; 40],
  word: u64,
  magic: u64,
}

impl BlockHeader {
  /// Stamps magic and packed fields and clears the free-list link.
  pub fn init(&mut self, size: usize, size_class: u8, free: bool) {
    self.magic = HEADER_MAGIC;
    self.word = (size as u64 & SIZE_MASK)
      | ((size_class as u64) << CLASS_SHIFT)
      | flag_bits(FREE_FLAG, free)
      | MARKER_VALUE;
    self.next = null_mut();
  }

  #[inline]
  pub fn is_valid(&self) -> bool {
    self.magic == HEADER_MAGIC
      && (self.word & MARKER_MASK) == MARKER_VALUE
      && self.size() <= MAX_BLOCK_SIZE
  }

  #[inline]
  pub fn is_free(&self) -> bool {
    self.word & FREE_FLAG != 0
  }

  #[inline]
  pub fn is_mmap(&self) -> bool {
    self.word & MMAP_FLAG != 0
  }

  /// Payload size in bytes. For pool blocks this is the class's nominal size.
  #[inline]
  pub fn size(&self) -> usize {
    (self.word & SIZE_MASK) as usize
  }

  /// Class index, or `LARGE_CLASS` for mmap-backed blocks.
  #[inline]
  pub fn size_class(&self) -> u8 {
    ((self.word & CLASS_MASK) >> CLASS_SHIFT) as u8
  }

  #[inline]
  pub fn set_free(&mut self, free: bool) {
    self.word = (self.word & !FREE_FLAG) | flag_bits(FREE_FLAG, free);
  }

  #[inline]
  pub fn set_mmap(&mut self, mmap: bool) {
    self.word = (self.word & !MMAP_FLAG) | flag_bits(MMAP_FLAG, mmap);
  }

  /// Best-effort check that `ptr` could be a payload pointer: cache-line
  /// aligned, with the magic in the preceding word.
  ///
  /// Pointers whose page offset is smaller than a header are rejected without
  /// reading memory, so the probe never leaves the page `ptr` points into.
  ///
  /// # Safety
  /// `ptr` must point into readable memory.
  pub unsafe fn is_aligned(ptr: *const u8) -> bool {
    let addr = ptr as usize;
    if addr & (CACHE_LINE_SIZE - 1) != 0 || addr & (PAGE_SIZE - 1) < HEADER_SIZE {
      return false;
    }

    let magic = unsafe { ptr.cast::<u64>().sub(1).read_volatile() };
    magic == HEADER_MAGIC
  }

  /// Returns the header of a live or free block, or `None` if `ptr` does not
  /// look like a payload produced by this crate.
  ///
  /// # Safety
  /// `ptr` must be null or point into readable memory. The returned reference
  /// must not outlive the block's mapping.
  pub unsafe fn from_payload<'a>(ptr: *const u8) -> Option<&'a BlockHeader> {
    unsafe { header_of(ptr.cast_mut()).map(|h| &*h.as_ptr()) }
  }
}

impl fmt::Debug for BlockHeader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BlockHeader")
      .field("size", &self.size())
      .field("size_class", &self.size_class())
      .field("free", &self.is_free())
      .field("mmap", &self.is_mmap())
      .field("valid", &self.is_valid())
      .finish()
  }
}

/// Walks back from a payload pointer to its header, validating it.
unsafe fn header_of(ptr: *mut u8) -> Option<NonNull<BlockHeader>> {
  if ptr.is_null() || !unsafe { BlockHeader::is_aligned(ptr) } {
    return None;
  }

  let header = unsafe { ptr.sub(HEADER_SIZE).cast::<BlockHeader>() };
  if unsafe { (*header).is_valid() } {
    NonNull::new(header)
  } else {
    None
  }
}

#[inline]
unsafe fn payload_of(header: NonNull<BlockHeader>) -> NonNull<u8> {
  unsafe { header.cast::<u8>().add(HEADER_SIZE) }
}

// =============================================================================
// Free List
// =============================================================================

/// Intrusive LIFO list of free blocks of one size class.
struct FreeList {
  head: *mut BlockHeader,
  count: usize,
}

impl FreeList {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      count: 0,
    }
  }

  #[inline]
  fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  /// # Safety
  /// `header` must be a valid header that is not already on any list.
  #[inline]
  unsafe fn push(&mut self, header: NonNull<BlockHeader>) {
    unsafe { (*header.as_ptr()).next = self.head };
    self.head = header.as_ptr();
    self.count += 1;
  }

  #[inline]
  fn pop(&mut self) -> Option<NonNull<BlockHeader>> {
    let header = NonNull::new(self.head)?;
    unsafe {
      self.head = (*header.as_ptr()).next;
      (*header.as_ptr()).next = null_mut();
    }
    self.count -= 1;
    Some(header)
  }
}

// =============================================================================
// Pool
// =============================================================================

/// One mapping carved into equally sized slots of a single class.
struct Pool {
  base: NonNull<u8>,
  len: usize,
  class: usize,
  /// Previously created pool of the same class.
  next: Option<Box<Pool>>,
}

impl Pool {
  /// Takes ownership of `base` (a fresh `pool_bytes` mapping for `class`) and
  /// stamps a free header at the start of every slot.
  unsafe fn new(class: usize, base: NonNull<u8>) -> Self {
    let sc = &SIZE_CLASS_TABLE[class];
    let pool = Self {
      base,
      len: sc.pool_bytes,
      class,
      next: None,
    };
    for header in pool.slots() {
      unsafe { (*header.as_ptr()).init(sc.size, class as u8, true) };
    }
    pool
  }

  /// Slot headers in address order.
  fn slots(&self) -> impl Iterator<Item = NonNull<BlockHeader>> + use<> {
    let sc = &SIZE_CLASS_TABLE[self.class];
    let base = self.base;
    (0..sc.blocks).map(move |i| unsafe { base.add(i * sc.slot).cast::<BlockHeader>() })
  }

  /// Prepends every slot to `list`, so the highest slot is handed out first.
  fn thread_into(&self, list: &mut FreeList) {
    for header in self.slots() {
      unsafe { list.push(header) };
    }
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    unsafe { os_release(self.base, self.len) };
  }
}

// =============================================================================
// Arena
// =============================================================================

/// Counters describing what an arena currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
  /// Pools mapped across all classes.
  pub pools: usize,
  /// Bytes mapped for pools.
  pub pool_bytes: usize,
  /// Pool blocks sitting in free lists.
  pub free_blocks: usize,
  /// Pool blocks handed out and not yet returned.
  pub live_blocks: usize,
  /// Live mmap-backed blocks.
  pub large_blocks: usize,
  /// Bytes mapped for live mmap-backed blocks.
  pub large_bytes: usize,
}

impl ArenaStats {
  pub fn mapped_bytes(&self) -> usize {
    self.pool_bytes + self.large_bytes
  }
}

struct ArenaState {
  free_lists: [FreeList; SIZE_CLASSES],
  pools: [Option<Box<Pool>>; SIZE_CLASSES],
  /// Base address of every pool mapping.
  pool_bases: HashSet<NonNull<u8>>,
  /// Live mmap-backed blocks: mapping base -> mapping length.
  large: HashMap<NonNull<u8>, usize>,
  /// Ceiling on `stats.mapped_bytes()`.
  limit: Option<usize>,
  stats: ArenaStats,
}

/// Owner of all free lists and pools.
///
/// An arena is single-threaded (it is neither `Send` nor `Sync`). Pools are
/// only returned to the OS when the arena is dropped. Several [`Allocator`]
/// handles may share one arena through an `Rc`.
pub struct Arena {
  state: RefCell<ArenaState>,
}

impl Arena {
  pub fn new() -> Self {
    Self {
      state: RefCell::new(ArenaState {
        free_lists: [const { FreeList::new() }; SIZE_CLASSES],
        pools: [const { None }; SIZE_CLASSES],
        pool_bases: HashSet::new(),
        large: HashMap::new(),
        limit: None,
        stats: ArenaStats::default(),
      }),
    }
  }

  /// Creates an arena that fails with `OutOfMemory` instead of mapping more
  /// than `limit` bytes at once.
  pub fn with_limit(limit: usize) -> Self {
    let arena = Self::new();
    arena.state.borrow_mut().limit = Some(limit);
    arena
  }

  pub fn limit(&self) -> Option<usize> {
    self.state.borrow().limit
  }

  pub fn stats(&self) -> ArenaStats {
    self.state.borrow().stats
  }

  /// Returns a cache-line aligned block of at least `bytes` bytes.
  pub fn allocate_bytes(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
    let mut state = self.state.borrow_mut();
    if bytes >= LARGE_THRESHOLD {
      state.alloc_large(bytes)
    } else {
      state.alloc_small(size_class_of(bytes))
    }
  }

  /// Returns a block to its free list, or unmaps it if it is mmap-backed.
  ///
  /// Null, misaligned, foreign and already-free pointers are ignored. A
  /// pointer one header past a page boundary is only probed if that page
  /// starts a mapping of this arena, so a large block freed twice is never
  /// read after it was unmapped. Elsewhere the guard is best-effort: a pointer
  /// that happens to sit behind a valid header is accepted.
  ///
  /// # Safety
  /// `ptr` must be null or point into readable memory. If it was produced by
  /// an arena, it must be this arena, and it must not be used afterwards.
  pub unsafe fn deallocate_bytes(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }

    let mut state = self.state.borrow_mut();
    if !state.may_probe(ptr) {
      reject_free(ptr, "header page is not a mapping of this arena");
      return;
    }

    let Some(header) = (unsafe { header_of(ptr) }) else {
      reject_free(ptr, "no valid block header");
      return;
    };

    unsafe { state.free_block(ptr, header) };
  }
}

impl ArenaState {
  /// Maps `len` bytes, honouring the budget.
  fn map(&mut self, len: usize) -> Result<NonNull<u8>, AllocError> {
    if let Some(limit) = self.limit
      && self.stats.mapped_bytes().saturating_add(len) > limit
    {
      log::debug!(
        "mapping {} bytes would exceed the {} byte budget ({} mapped)",
        len,
        limit,
        self.stats.mapped_bytes()
      );
      return Err(AllocError::OutOfMemory { bytes: len });
    }
    os_reserve(len)
  }

  /// Whether the word before `ptr` may be read. Headers that start a page
  /// always start a mapping, which must be one this arena still owns.
  fn may_probe(&self, ptr: *mut u8) -> bool {
    if ptr as usize & (PAGE_SIZE - 1) != HEADER_SIZE {
      return true;
    }
    match NonNull::new(ptr.wrapping_sub(HEADER_SIZE)) {
      Some(base) => self.pool_bases.contains(&base) || self.large.contains_key(&base),
      None => false,
    }
  }

  fn alloc_small(&mut self, class: usize) -> Result<NonNull<u8>, AllocError> {
    if self.free_lists[class].is_empty() {
      self.grow(class)?;
    }

    let header = self.free_lists[class]
      .pop()
      .ok_or(AllocError::OutOfMemory {
        bytes: SIZE_CLASS_TABLE[class].pool_bytes,
      })?;
    unsafe { (*header.as_ptr()).set_free(false) };

    self.stats.free_blocks -= 1;
    self.stats.live_blocks += 1;
    Ok(unsafe { payload_of(header) })
  }

  /// Maps a new pool for `class` and threads its slots into the class list.
  #[inline(never)]
  fn grow(&mut self, class: usize) -> Result<(), AllocError> {
    let sc = &SIZE_CLASS_TABLE[class];
    let base = self.map(sc.pool_bytes)?;
    let mut pool = Box::new(unsafe { Pool::new(class, base) });
    pool.thread_into(&mut self.free_lists[class]);

    log::trace!(
      "class {}: new pool at {:p} ({} slots of {} bytes)",
      class,
      base,
      sc.blocks,
      sc.slot
    );

    self.pool_bases.insert(base);
    pool.next = self.pools[class].take();
    self.pools[class] = Some(pool);

    self.stats.pools += 1;
    self.stats.pool_bytes += sc.pool_bytes;
    self.stats.free_blocks += sc.blocks;
    Ok(())
  }

  fn alloc_large(&mut self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
    if bytes > MAX_BLOCK_SIZE {
      return Err(AllocError::CapacityOverflow);
    }

    let len = large_mapping_len(bytes);
    let base = self.map(len)?;
    let header = base.cast::<BlockHeader>();
    unsafe {
      (*header.as_ptr()).init(bytes, LARGE_CLASS, false);
      (*header.as_ptr()).set_mmap(true);
    }

    log::debug!("mapped large block at {:p} ({} bytes)", base, len);

    self.large.insert(base, len);
    self.stats.large_blocks += 1;
    self.stats.large_bytes += len;
    Ok(unsafe { payload_of(header) })
  }

  unsafe fn free_block(&mut self, ptr: *mut u8, header: NonNull<BlockHeader>) {
    let h = unsafe { &mut *header.as_ptr() };

    if h.is_mmap() {
      let Some(len) = self.large.remove(&header.cast::<u8>()) else {
        reject_free(ptr, "not a live large block of this arena");
        return;
      };
      unsafe { os_release(header.cast(), len) };
      log::debug!("unmapped large block at {:p} ({} bytes)", header, len);

      self.stats.large_blocks -= 1;
      self.stats.large_bytes -= len;
      return;
    }

    let class = h.size_class() as usize;
    if class >= SIZE_CLASSES {
      reject_free(ptr, "size class out of range");
      return;
    }
    if h.is_free() {
      reject_free(ptr, "block is already free");
      return;
    }

    h.set_free(true);
    unsafe { self.free_lists[class].push(header) };

    self.stats.live_blocks = self.stats.live_blocks.saturating_sub(1);
    self.stats.free_blocks += 1;
  }
}

impl Default for Arena {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for Arena {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.borrow();
    f.debug_struct("Arena")
      .field("limit", &state.limit)
      .field("stats", &state.stats)
      .finish()
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    let state = self.state.get_mut();

    // Unlink iteratively; a recursive Box drop could overflow on long chains.
    for head in state.pools.iter_mut() {
      let mut pool = head.take();
      while let Some(mut p) = pool {
        pool = p.next.take();
      }
    }
    for (&base, &len) in &state.large {
      unsafe { os_release(base, len) };
    }

    log::debug!(
      "arena dropped: released {} pools ({} bytes) and {} live large blocks",
      state.stats.pools,
      state.stats.pool_bytes,
      state.stats.large_blocks
    );
  }
}

#[cold]
fn reject_free(ptr: *const u8, reason: &str) {
  log::debug!("ignoring free of {:p}: {}", ptr, reason);

  #[cfg(feature = "debug-tripwire")]
  panic!("invalid free of {:p}: {}", ptr, reason);
}

// =============================================================================
// Allocator
// =============================================================================

/// Typed handle over an [`Arena`].
///
/// `Allocator::new` creates a private arena. Clones and [`Allocator::rebind`]
/// share the arena, and two handles compare equal iff they share it.
pub struct Allocator<T> {
  arena: Rc<Arena>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Allocator<T> {
  pub fn new() -> Self {
    Self::with_arena(Rc::new(Arena::new()))
  }

  pub fn with_arena(arena: Rc<Arena>) -> Self {
    const {
      assert!(
        core::mem::align_of::<T>() <= CACHE_LINE_SIZE,
        "element alignment exceeds the payload alignment"
      )
    };
    Self {
      arena,
      _marker: PhantomData,
    }
  }

  pub fn arena(&self) -> &Rc<Arena> {
    &self.arena
  }

  /// Handle for another element type backed by the same arena.
  pub fn rebind<U>(&self) -> Allocator<U> {
    Allocator::with_arena(Rc::clone(&self.arena))
  }

  /// Allocates uninitialised storage for `n` values of `T`.
  ///
  /// Returns null for `n == 0` and a dangling pointer for zero-sized `T`.
  pub fn allocate(&self, n: usize) -> Result<*mut T, AllocError> {
    if n == 0 {
      return Ok(null_mut());
    }
    if size_of::<T>() == 0 {
      return Ok(NonNull::dangling().as_ptr());
    }
    if n > self.max_size() {
      return Err(AllocError::CapacityOverflow);
    }

    let bytes = n * size_of::<T>();
    self
      .arena
      .allocate_bytes(bytes)
      .map(|ptr| ptr.as_ptr().cast())
  }

  /// Returns storage obtained from `allocate`. `_n` is not used for sizing.
  ///
  /// # Safety
  /// See [`Arena::deallocate_bytes`]. Values stored in the block are not dropped.
  pub unsafe fn deallocate(&self, ptr: *mut T, _n: usize) {
    if size_of::<T>() == 0 {
      return;
    }
    unsafe { self.arena.deallocate_bytes(ptr.cast()) }
  }

  /// Largest `n` that `allocate` accepts.
  pub fn max_size(&self) -> usize {
    match size_of::<T>() {
      0 => usize::MAX,
      elem => MAX_BLOCK_SIZE / elem,
    }
  }

  /// # Safety
  /// `ptr` must be valid for writes and properly aligned.
  pub unsafe fn construct<U>(&self, ptr: *mut U, value: U) {
    unsafe { ptr.write(value) }
  }

  /// # Safety
  /// `ptr` must point to an initialised value that is not used afterwards.
  pub unsafe fn destroy<U>(&self, ptr: *mut U) {
    unsafe { ptr::drop_in_place(ptr) }
  }
}

impl<T> Default for Allocator<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for Allocator<T> {
  fn clone(&self) -> Self {
    Self::with_arena(Rc::clone(&self.arena))
  }
}

impl<T, U> PartialEq<Allocator<U>> for Allocator<T> {
  fn eq(&self, other: &Allocator<U>) -> bool {
    Rc::ptr_eq(&self.arena, &other.arena)
  }
}

impl<T> Eq for Allocator<T> {}

impl<T> fmt::Debug for Allocator<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Allocator")
      .field("element", &core::any::type_name::<T>())
      .field("arena", &*self.arena)
      .finish()
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
const fn flag_bits(flag: u64, on: bool) -> u64 {
  if on { flag } else { 0 }
}

/// Length of the mapping backing a large block of `bytes` payload bytes.
#[inline(always)]
const fn large_mapping_len(bytes: usize) -> usize {
  align_up(bytes + HEADER_SIZE, PAGE_SIZE)
}
