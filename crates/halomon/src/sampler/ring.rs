//! Ring-buffer drain and sample-record decoding.
//!
//! The kernel writes records into a shared ring whose first page is a
//! header carrying the producer head and consumer tail cursors. Records are
//! variable-length and may straddle the wrap boundary, so each one is
//! copied through a scratch buffer before decoding. The drain protocol is
//! the documented one: read `data_head`, acquire fence, consume records
//! tail→head, release fence, publish the new `data_tail`.

use std::sync::atomic::{fence, Ordering};

use perf_event_open_sys::bindings::{perf_event_header, perf_event_mmap_page};

use halo_wire::{BranchInfo, RawSample};

use crate::error::{HaloError, Result};

/// Record type for samples, from the kernel ABI.
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Byte size of `perf_event_header`.
const HEADER_SIZE: usize = std::mem::size_of::<perf_event_header>();

/// Memory-mapped perf ring: one header page plus 2^n data pages.
#[derive(Debug)]
pub struct RingBuffer {
    base: *mut u8,
    mmap_len: usize,
    data_size: usize,
    page_size: usize,
    /// Scratch for wrap reassembly, reused across records.
    scratch: Vec<u8>,
}

// Owned exclusively; drained only from the monitor thread.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Map the ring of a perf fd: `data_pages` (a power of two) plus the
    /// header page.
    pub fn map(fd: i32, data_pages: usize, page_size: usize) -> Result<Self> {
        debug_assert!(data_pages.is_power_of_two());
        let mmap_len = (data_pages + 1) * page_size;
        // Safety: shared mapping of the perf fd, as the ABI requires.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Err(HaloError::Sampler(
                    "mmap of perf ring denied; raise /proc/sys/kernel/perf_event_mlock_kb \
                     or reduce HALO_RING_PAGES"
                        .to_string(),
                ));
            }
            return Err(HaloError::Os {
                op: "mmap perf ring",
                source: err,
            });
        }
        Ok(RingBuffer {
            base: ptr as *mut u8,
            mmap_len,
            data_size: data_pages * page_size,
            page_size,
            scratch: Vec::new(),
        })
    }

    /// Drain all complete records, appending decoded samples to `batch`.
    /// Returns the number of samples appended.
    pub fn drain(&mut self, batch: &mut Vec<RawSample>) -> usize {
        let header = self.base as *mut perf_event_mmap_page;
        let data = unsafe { self.base.add(self.page_size) };
        unsafe { drain_ring(header, data, self.data_size, &mut self.scratch, batch) }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        // Safety: base/len came from our own successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mmap_len);
        }
    }
}

/// The drain algorithm over raw ring parts. Factored out so tests can run
/// it against a synthetic ring.
///
/// # Safety
/// `header` must point at a valid mmap header page and `data` at its
/// `data_size`-byte ring, with `data_size` a power of two.
pub unsafe fn drain_ring(
    header: *mut perf_event_mmap_page,
    data: *const u8,
    data_size: usize,
    scratch: &mut Vec<u8>,
    batch: &mut Vec<RawSample>,
) -> usize {
    debug_assert!(data_size.is_power_of_two());
    let mask = (data_size - 1) as u64;

    // The head keeps growing; it is wrapped by masking, never by the
    // kernel. Pair the read with an acquire fence before touching data.
    let head = std::ptr::read_volatile(&(*header).data_head);
    fence(Ordering::Acquire);

    let tail_start = std::ptr::read_volatile(&(*header).data_tail);
    let mut consumed: u64 = 0;
    let mut appended = 0;

    while tail_start + consumed != head {
        let offset = (tail_start + consumed) & mask;

        // The 8-byte record header itself may straddle the wrap.
        let mut hdr_bytes = [0u8; HEADER_SIZE];
        copy_wrapped(data, data_size, offset, &mut hdr_bytes);
        let record_size = u16::from_le_bytes([hdr_bytes[6], hdr_bytes[7]]) as usize;
        let record_type = u32::from_le_bytes([hdr_bytes[0], hdr_bytes[1], hdr_bytes[2], hdr_bytes[3]]);

        // A zero-length record means the producer has not finished this
        // slot; end the drain without error and pick it up next time.
        if record_size == 0 {
            break;
        }

        if record_type == PERF_RECORD_SAMPLE {
            scratch.resize(record_size, 0);
            copy_wrapped(data, data_size, offset, scratch);
            if let Some(sample) = decode_sample(&scratch[HEADER_SIZE..]) {
                batch.push(sample);
                appended += 1;
            }
        }
        // Everything else (mmap, comm, task, lost) is ignored.

        consumed += record_size as u64;
    }

    // Publish the new tail only after all reads of the consumed region.
    fence(Ordering::Release);
    std::ptr::write_volatile(&mut (*header).data_tail, tail_start + consumed);

    appended
}

/// Copy `out.len()` bytes starting at ring offset `offset`, splicing the
/// two pieces back together when the record crosses the wrap boundary.
unsafe fn copy_wrapped(data: *const u8, data_size: usize, offset: u64, out: &mut [u8]) {
    let offset = offset as usize;
    let len = out.len();
    let first = len.min(data_size - offset);
    std::ptr::copy_nonoverlapping(data.add(offset), out.as_mut_ptr(), first);
    if first < len {
        std::ptr::copy_nonoverlapping(data, out.as_mut_ptr().add(first), len - first);
    }
}

// ---------------------------------------------------------------------------
// Record decoding
// ---------------------------------------------------------------------------

/// Little-endian field cursor over a record body.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FieldReader { buf, pos: 0 }
    }

    fn u32(&mut self) -> Option<u32> {
        let b = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        let b = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Decode a PERF_RECORD_SAMPLE body (the bytes after the record header)
/// laid out for the sample type the handles are opened with:
/// IDENTIFIER, IP, TID, TIME, ADDR, STREAM_ID, CALLCHAIN, BRANCH_STACK,
/// WEIGHT, DATA_SRC.
///
/// Returns `None` on a truncated body; the caller drops the record.
pub fn decode_sample(body: &[u8]) -> Option<RawSample> {
    let mut r = FieldReader::new(body);

    let _sample_id = r.u64()?;
    let ip = r.u64()?;
    let _pid = r.u32()?;
    let tid = r.u32()?;
    let time = r.u64()?;
    let _addr = r.u64()?;
    let _stream_id = r.u64()?;

    let chain_len = r.u64()?;
    let mut call_context = Vec::with_capacity(chain_len.min(512) as usize);
    for _ in 0..chain_len {
        call_context.push(r.u64()?);
    }

    let branch_count = r.u64()?;
    let mut branches = Vec::with_capacity(branch_count.min(64) as usize);
    for _ in 0..branch_count {
        let from = r.u64()?;
        let to = r.u64()?;
        // Bitfield word: mispred:1, predicted:1, in_tx:1, abort:1,
        // cycles:16, type:4, rest reserved.
        let flags = r.u64()?;
        branches.push(BranchInfo {
            from,
            to,
            mispred: flags & 0x1 != 0,
            predicted: flags & 0x2 != 0,
        });
    }

    let weight = r.u64()?;
    let _data_src = r.u64()?;

    Some(RawSample {
        instr_ptr: ip,
        thread_id: tid,
        time,
        weight,
        call_context,
        branches,
    })
}
