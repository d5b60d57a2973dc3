//! Defines buffers that are used to send and receive packets.
//!
//! A [`DmaBuffer`] is a physically contiguous region of memory that a device reads or writes directly.
//! A [`Frame`] wraps one such buffer and tracks which part of it currently holds packet data,
//! leaving headroom in front of the data so that link-layer headers can be pushed and pulled in place.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;

use core::fmt;
use core::ops::{Add, Deref, DerefMut, Range};
use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};


/// A physical memory address, as seen by a device performing DMA.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    pub const fn new(addr: usize) -> PhysicalAddress {
        PhysicalAddress(addr)
    }

    pub const fn value(&self) -> usize {
        self.0
    }

    /// Returns true if this address is a multiple of `align`, which must be a power of two.
    pub const fn is_aligned(&self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl Add<usize> for PhysicalAddress {
    type Output = PhysicalAddress;
    fn add(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress(self.0 + rhs)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}


/// The memory behind a [`DmaBuffer`].
///
/// The device accesses this memory concurrently with the CPU, so CPU accesses go through the lock,
/// which plays the role of syncing the buffer for the CPU.
pub type DmaMemory = Mutex<Box<[u8]>>;

/// A buffer that is guaranteed to be contiguous in physical memory.
pub struct DmaBuffer {
    memory: Arc<DmaMemory>,
    phys_addr: PhysicalAddress,
    size: usize,
}

impl DmaBuffer {
    /// Wraps `memory`, which starts at the physical address `phys_addr`.
    pub fn new(memory: Arc<DmaMemory>, phys_addr: PhysicalAddress) -> DmaBuffer {
        let size = memory.lock().len();
        DmaBuffer { memory, phys_addr, size }
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    /// The size of this buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the shared memory behind this buffer,
    /// which is how an allocator or a device model reaches a buffer it handed out.
    pub fn memory(&self) -> &Arc<DmaMemory> {
        &self.memory
    }

    /// Gives the CPU access to the contents of this buffer until the returned guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.memory.lock()
    }

    /// Returns true if `self` and `other` are backed by the same memory.
    pub fn same_memory(&self, other: &DmaBuffer) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("phys_addr", &self.phys_addr)
            .field("size", &self.size)
            .finish()
    }
}


/// Supplies and takes back DMA-able buffers.
///
/// Every buffer handed out by [`allocate`](BufferAllocator::allocate) starts at a physical address
/// that is at least quad-byte aligned.
pub trait BufferAllocator: Send + Sync {
    /// Allocates a buffer of at least `size` bytes, or returns `None` if memory is exhausted.
    fn allocate(&self, size: usize) -> Option<DmaBuffer>;

    /// Returns a buffer obtained from [`allocate`](BufferAllocator::allocate).
    fn release(&self, buffer: DmaBuffer);
}


/// A packet held in a [`DmaBuffer`], in the manner of a socket buffer.
///
/// The buffer is divided into headroom, data and tailroom:
/// ```text
/// 0        head        head + len        size
/// |headroom|    data    |    tailroom     |
/// ```
/// Headers are added in front of the data with [`push`](Frame::push)
/// and stripped off with [`pull`](Frame::pull).
pub struct Frame {
    buffer: DmaBuffer,
    head: usize,
    len: usize,
}

impl Frame {
    /// Creates an empty frame over `buffer`, with all of it as tailroom.
    pub fn new(buffer: DmaBuffer) -> Frame {
        Frame { buffer, head: 0, len: 0 }
    }

    /// Creates a frame holding a copy of `bytes`, placed after `headroom` bytes of headroom.
    pub fn from_bytes(buffer: DmaBuffer, headroom: usize, bytes: &[u8]) -> Result<Frame, &'static str> {
        let mut frame = Frame::new(buffer);
        frame.reserve(headroom)?;
        frame.put(bytes.len())?;
        frame.data().copy_from_slice(bytes);
        Ok(frame)
    }

    /// Number of data bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        self.buffer.size - self.head - self.len
    }

    /// Physical address of the first data byte.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.buffer.phys_addr + self.head
    }

    pub fn buffer(&self) -> &DmaBuffer {
        &self.buffer
    }

    /// Consumes this frame and returns its underlying buffer.
    pub fn into_buffer(self) -> DmaBuffer {
        self.buffer
    }

    /// Moves the start of an empty frame forward by `len` bytes of headroom.
    pub fn reserve(&mut self, len: usize) -> Result<(), &'static str> {
        if self.len != 0 {
            return Err("Frame::reserve(): frame already holds data");
        }
        if len > self.tailroom() {
            return Err("Frame::reserve(): not enough room in buffer");
        }
        self.head += len;
        Ok(())
    }

    /// Extends the data by `len` bytes at its end.
    pub fn put(&mut self, len: usize) -> Result<(), &'static str> {
        if len > self.tailroom() {
            return Err("Frame::put(): not enough tailroom");
        }
        self.len += len;
        Ok(())
    }

    /// Extends the data by `len` bytes at its start.
    pub fn push(&mut self, len: usize) -> Result<(), &'static str> {
        if len > self.head {
            return Err("Frame::push(): not enough headroom");
        }
        self.head -= len;
        self.len += len;
        Ok(())
    }

    /// Removes `len` bytes from the start of the data.
    pub fn pull(&mut self, len: usize) -> Result<(), &'static str> {
        if len > self.len {
            return Err("Frame::pull(): frame is shorter than that");
        }
        self.head += len;
        self.len -= len;
        Ok(())
    }

    /// Removes data bytes past the first `len`.
    pub fn trim(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Gives the CPU access to the data bytes of this frame.
    pub fn data(&self) -> FrameData<'_> {
        FrameData {
            guard: self.buffer.lock(),
            range: self.head .. self.head + self.len,
        }
    }

    /// Gives the CPU access to the tailroom of this frame,
    /// which is where a device writes an inbound packet into an empty frame.
    pub fn tail(&self) -> FrameData<'_> {
        FrameData {
            guard: self.buffer.lock(),
            range: self.head + self.len .. self.buffer.size,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Frame")
            .field("phys_addr", &self.phys_addr())
            .field("len", &self.len)
            .field("headroom", &self.head)
            .finish()
    }
}

/// A locked view of a range of a frame's buffer.
/// Auto-dereferences into a byte slice.
pub struct FrameData<'f> {
    guard: MutexGuard<'f, Box<[u8]>>,
    range: Range<usize>,
}

impl Deref for FrameData<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard[self.range.clone()]
    }
}

impl DerefMut for FrameData<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let range = self.range.clone();
        &mut self.guard[range]
    }
}


/// A network frame that has been received by the NIC and is handed up to the network stack.
///
/// The frame's data begins with a link-layer header of [`link_header_len`](ReceivedFrame::link_header_len) bytes,
/// followed by the network-layer packet.
pub struct ReceivedFrame {
    frame: Frame,
    protocol: u16,
    link_header_len: usize,
}

impl ReceivedFrame {
    pub fn new(frame: Frame, protocol: u16, link_header_len: usize) -> ReceivedFrame {
        if link_header_len > frame.len() {
            warn!("ReceivedFrame::new(): frame of {} bytes is shorter than its {}-byte link header",
                frame.len(), link_header_len);
        }
        ReceivedFrame { frame, protocol, link_header_len }
    }

    /// The network-layer protocol carried by this frame, e.g., 0x0800 for IPv4.
    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    pub fn link_header_len(&self) -> usize {
        self.link_header_len
    }

    /// The whole frame, link-layer header included.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// Number of bytes following the link-layer header.
    pub fn payload_len(&self) -> usize {
        self.frame.len().saturating_sub(self.link_header_len)
    }
}
