//! Typed, bounds-checked projection of input/output records onto a
//! contiguous byte region, plus the POSIX System V attach/detach transport.
//!
//! Ported from `shared_data.c`/`shared_data.h` in the reference
//! implementation. The C original walks the region with raw pointer
//! arithmetic; here the same offsets are computed once into a `Layout`, and
//! every field access goes through `bytemuck::pod_read_unaligned` /
//! a manual byte write, since the wire format is tightly packed with no
//! padding and cannot be relied on to satisfy Rust's native alignment rules.

use bytemuck::{Pod, Zeroable};

use crate::color::Color;
use crate::error::AttachError;

pub const DEBUG_STORE_IMAGES: u8 = 0b01;
pub const DEBUG_STORE_ABSOLUTE_ERROR: u8 = 0b10;

pub const TERMINATE_ON_MIN_RELATIVE_ERROR: u8 = 0b01;
pub const TERMINATE_ON_UNAVAILABLE_CONNECTION: u8 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Disc {
    pub radius_um: u64,
    pub background_color: Color,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Indexer {
    pub point_amount: u64,
    pub thread_amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Termination {
    pub flags: u8,
    pub max_iterations: u64,
    pub min_relative_error: f64,
    pub relative_error_streak: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadSpec {
    pub alpha: u8,
    pub thickness_um: u64,
    pub color: Color,
}

/// A committed (start, end, thread) triple.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Instruction {
    pub start: u64,
    pub end: u64,
    pub thread: u64,
}

const THREAD_RECORD_SIZE: u64 = 1 + 8 + 3;
const INSTRUCTION_SIZE: u64 = std::mem::size_of::<Instruction>() as u64;
const OUTPUT_HEADER_SIZE: u64 = 8 + 8 + 8;
const INPUT_HEADER_SIZE: u64 = 8 + 8 + 1 + (8 + 3) + (8 + 8) + (1 + 8 + 8 + 8);

/// Computed byte offsets for every input/output record, derived once from
/// the fixed-size header fields.
#[derive(Debug, Clone)]
pub struct Layout {
    pub image_width: u64,
    pub thread_order_size: u64,
    pub debug_flags: u8,
    pub point_amount: u64,
    pub thread_amount: u64,
    pub max_iterations: u64,

    threads_offset: u64,
    thread_order_offset: u64,
    start_points_offset: u64,
    target_offset: u64,
    importance_offset: u64,

    output_offset: u64,
    result_offset: u64,
    instructions_offset: u64,
    debug_images_offset: u64,
    debug_errors_offset: u64,

    pub total_size: u64,
}

impl Layout {
    fn read_u64(bytes: &[u8], offset: u64) -> u64 {
        let o = offset as usize;
        bytemuck::pod_read_unaligned(&bytes[o..o + 8])
    }

    fn read_u8(bytes: &[u8], offset: u64) -> u8 {
        bytes[offset as usize]
    }

    /// Parses the fixed-size header fields needed to compute every other
    /// offset, then computes the rest of the layout.
    pub fn compute(bytes: &[u8]) -> Result<Layout, AttachError> {
        if (bytes.len() as u64) < INPUT_HEADER_SIZE {
            return Err(AttachError::TooSmall {
                needed: INPUT_HEADER_SIZE,
                got: bytes.len() as u64,
            });
        }

        let image_width = Self::read_u64(bytes, 0);
        let thread_order_size = Self::read_u64(bytes, 8);
        let debug_flags = Self::read_u8(bytes, 16);
        // Disc.radius_um at 17, Disc.background_color at 25..28 (unused for layout)
        let point_amount = Self::read_u64(bytes, 28);
        let thread_amount = Self::read_u64(bytes, 36);
        let max_iterations = Self::read_u64(bytes, 45);

        let pixel_amount = image_width * image_width;

        let threads_offset = INPUT_HEADER_SIZE;
        let thread_order_offset = threads_offset + thread_amount * THREAD_RECORD_SIZE;
        let start_points_offset = thread_order_offset + thread_order_size * 8;
        let target_offset = start_points_offset + thread_amount * 8;
        let importance_offset = target_offset + pixel_amount * 3;
        let output_offset = importance_offset + pixel_amount * 8;

        let result_offset = output_offset + OUTPUT_HEADER_SIZE;
        let instructions_offset = result_offset + pixel_amount * 3;
        let debug_images_offset = instructions_offset + max_iterations * INSTRUCTION_SIZE;
        let debug_errors_offset = debug_images_offset + max_iterations * pixel_amount * 3;

        let total_size = if debug_flags != 0 {
            debug_errors_offset + max_iterations * pixel_amount * 8
        } else {
            debug_images_offset
        };

        if (bytes.len() as u64) < total_size {
            return Err(AttachError::TooSmall {
                needed: total_size,
                got: bytes.len() as u64,
            });
        }

        Ok(Layout {
            image_width,
            thread_order_size,
            debug_flags,
            point_amount,
            thread_amount,
            max_iterations,
            threads_offset,
            thread_order_offset,
            start_points_offset,
            target_offset,
            importance_offset,
            output_offset,
            result_offset,
            instructions_offset,
            debug_images_offset,
            debug_errors_offset,
            total_size,
        })
    }

    pub fn pixel_amount(&self) -> u64 {
        self.image_width * self.image_width
    }
}

/// Read-only view over the input section.
pub struct InputView<'a> {
    bytes: &'a [u8],
    layout: Layout,
}

impl<'a> InputView<'a> {
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn disc(&self) -> Disc {
        Disc {
            radius_um: Layout::read_u64(self.bytes, 17),
            background_color: bytemuck::pod_read_unaligned(&self.bytes[25..28]),
        }
    }

    pub fn indexer(&self) -> Indexer {
        Indexer {
            point_amount: self.layout.point_amount,
            thread_amount: self.layout.thread_amount,
        }
    }

    pub fn termination(&self) -> Termination {
        Termination {
            flags: Layout::read_u8(self.bytes, 44),
            max_iterations: self.layout.max_iterations,
            min_relative_error: bytemuck::pod_read_unaligned(&self.bytes[53..61]),
            relative_error_streak: Layout::read_u64(self.bytes, 61),
        }
    }

    pub fn thread(&self, index: usize) -> ThreadSpec {
        let base = self.layout.threads_offset + index as u64 * THREAD_RECORD_SIZE;
        let base = base as usize;
        ThreadSpec {
            alpha: self.bytes[base],
            thickness_um: bytemuck::pod_read_unaligned(&self.bytes[base + 1..base + 9]),
            color: bytemuck::pod_read_unaligned(&self.bytes[base + 9..base + 12]),
        }
    }

    pub fn thread_order(&self, index: usize) -> u64 {
        let base = self.layout.thread_order_offset + index as u64 * 8;
        Layout::read_u64(self.bytes, base)
    }

    pub fn start_point(&self, thread_index: usize) -> u64 {
        let base = self.layout.start_points_offset + thread_index as u64 * 8;
        Layout::read_u64(self.bytes, base)
    }

    pub fn target(&self, pixel_index: usize) -> Color {
        let base = (self.layout.target_offset + pixel_index as u64 * 3) as usize;
        bytemuck::pod_read_unaligned(&self.bytes[base..base + 3])
    }

    pub fn importance(&self, pixel_index: usize) -> f64 {
        let base = (self.layout.importance_offset + pixel_index as u64 * 8) as usize;
        bytemuck::pod_read_unaligned(&self.bytes[base..base + 8])
    }
}

/// Read-write view over the output section.
pub struct OutputView<'a> {
    bytes: &'a mut [u8],
    layout: Layout,
}

impl<'a> OutputView<'a> {
    fn write_u64(&mut self, offset: u64, value: u64) {
        let o = offset as usize;
        self.bytes[o..o + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn write_f64(&mut self, offset: u64, value: f64) {
        let o = offset as usize;
        self.bytes[o..o + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_header(&mut self, instruction_amount: u64, absolute_error: u64, normalized_error: f64) {
        self.write_u64(0, instruction_amount);
        self.write_u64(8, absolute_error);
        self.write_f64(16, normalized_error);
    }

    pub fn instruction_amount(&self) -> u64 {
        Layout::read_u64(self.bytes, 0)
    }

    pub fn absolute_error(&self) -> u64 {
        Layout::read_u64(self.bytes, 8)
    }

    pub fn normalized_error(&self) -> f64 {
        bytemuck::pod_read_unaligned(&self.bytes[16..24])
    }

    pub fn set_result_pixel(&mut self, pixel_index: usize, color: Color) {
        let base = (self.layout.result_offset - self.layout.output_offset + pixel_index as u64 * 3) as usize;
        self.bytes[base..base + 3].copy_from_slice(bytemuck::bytes_of(&color));
    }

    pub fn result_pixel(&self, pixel_index: usize) -> Color {
        let base = (self.layout.result_offset - self.layout.output_offset + pixel_index as u64 * 3) as usize;
        bytemuck::pod_read_unaligned(&self.bytes[base..base + 3])
    }

    pub fn set_instruction(&mut self, index: usize, instruction: Instruction) {
        let base = (self.layout.instructions_offset - self.layout.output_offset
            + index as u64 * INSTRUCTION_SIZE) as usize;
        self.bytes[base..base + INSTRUCTION_SIZE as usize].copy_from_slice(bytemuck::bytes_of(&instruction));
    }

    pub fn instruction(&self, index: usize) -> Instruction {
        let base = (self.layout.instructions_offset - self.layout.output_offset
            + index as u64 * INSTRUCTION_SIZE) as usize;
        bytemuck::pod_read_unaligned(&self.bytes[base..base + INSTRUCTION_SIZE as usize])
    }

    pub fn debug_enabled(&self) -> bool {
        self.layout.debug_flags != 0
    }

    pub fn set_debug_image_pixel(&mut self, iteration: usize, pixel_index: usize, color: Color) {
        if self.layout.debug_flags & DEBUG_STORE_IMAGES == 0 {
            return;
        }
        let base = (self.layout.debug_images_offset - self.layout.output_offset
            + (iteration as u64 * self.layout.pixel_amount() + pixel_index as u64) * 3) as usize;
        self.bytes[base..base + 3].copy_from_slice(bytemuck::bytes_of(&color));
    }

    pub fn set_debug_absolute_error(&mut self, iteration: usize, pixel_index: usize, error: u64) {
        if self.layout.debug_flags & DEBUG_STORE_ABSOLUTE_ERROR == 0 {
            return;
        }
        let base = (self.layout.debug_errors_offset - self.layout.output_offset
            + (iteration as u64 * self.layout.pixel_amount() + pixel_index as u64) * 8) as usize;
        self.bytes[base..base + 8].copy_from_slice(&error.to_le_bytes());
    }
}

enum Backing {
    Attached {
        ptr: *mut u8,
        len: usize,
        shm_id: i32,
    },
    Owned(Vec<u8>),
}

// SAFETY: the raw pointer in `Attached` refers to a System V shared memory
// segment that this process has exclusively attached; it is never aliased
// outside of this struct's accessors.
unsafe impl Send for Backing {}

/// A byte-addressable region shared with an external producer process.
pub struct SharedRegion {
    backing: Backing,
    layout: Layout,
}

impl SharedRegion {
    /// Binds to an existing System V shared-memory segment identified by
    /// `key`, requiring at least `size` bytes, then computes the record
    /// layout from its header.
    pub fn attach(key: u64, size: u64) -> Result<SharedRegion, AttachError> {
        // SAFETY: shmget/shmat are plain FFI calls; failure is reported
        // through errno and converted into AttachError below.
        let shm_id = unsafe { libc::shmget(key as libc::key_t, size as libc::size_t, 0o600) };
        if shm_id < 0 {
            return Err(AttachError::Get {
                key,
                size,
                source: std::io::Error::last_os_error(),
            });
        }

        let ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(AttachError::Attach {
                id: shm_id,
                source: std::io::Error::last_os_error(),
            });
        }

        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, size as usize) };
        let layout = Layout::compute(bytes)?;

        log::info!(
            "attached shared region: key={key} size={size} image_width={} point_amount={} thread_amount={}",
            layout.image_width, layout.point_amount, layout.thread_amount
        );

        Ok(SharedRegion {
            backing: Backing::Attached {
                ptr: ptr as *mut u8,
                len: size as usize,
                shm_id,
            },
            layout,
        })
    }

    /// Wraps an in-memory buffer as a region, for tests and non-SysV
    /// transports that satisfy the same offset contract.
    pub fn from_vec(bytes: Vec<u8>) -> Result<SharedRegion, AttachError> {
        let layout = Layout::compute(&bytes)?;
        Ok(SharedRegion {
            backing: Backing::Owned(bytes),
            layout,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn as_bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Attached { ptr, len, .. } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            Backing::Owned(v) => v.as_slice(),
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Attached { ptr, len, .. } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
            Backing::Owned(v) => v.as_mut_slice(),
        }
    }

    pub fn input(&self) -> InputView<'_> {
        InputView {
            bytes: self.as_bytes(),
            layout: self.layout.clone(),
        }
    }

    /// Splits the region into a read-only input view and a read-write
    /// output view over disjoint byte ranges.
    pub fn views(&mut self) -> (InputView<'_>, OutputView<'_>) {
        let layout = self.layout.clone();
        let output_offset = layout.output_offset as usize;
        let bytes = self.as_bytes_mut();
        let (input_bytes, output_bytes) = bytes.split_at_mut(output_offset);
        (
            InputView {
                bytes: input_bytes,
                layout: layout.clone(),
            },
            OutputView {
                bytes: output_bytes,
                layout,
            },
        )
    }

    /// Releases transport-level resources. The reference implementation's
    /// `shmdt` is a no-op left for the producer to read the region after
    /// this process exits; matched here deliberately, not an oversight.
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Intentionally does not call shmdt, matching the reference
        // implementation's no-op detach: the producer reads the region
        // after this process exits.
        if let Backing::Attached { shm_id, .. } = &self.backing {
            log::debug!("shared region {shm_id} left attached on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_region(image_width: u64, thread_amount: u64, max_iterations: u64, debug_flags: u8) -> Vec<u8> {
        let pixel_amount = image_width * image_width;
        let thread_order_size = max_iterations;

        let mut bytes = vec![0u8; 0];
        bytes.extend_from_slice(&image_width.to_le_bytes());
        bytes.extend_from_slice(&thread_order_size.to_le_bytes());
        bytes.push(debug_flags);
        bytes.extend_from_slice(&10u64.to_le_bytes()); // radius_um
        bytes.extend_from_slice(&[1, 2, 3]); // background color
        bytes.extend_from_slice(&(image_width).to_le_bytes()); // point_amount (reuse)
        bytes.extend_from_slice(&thread_amount.to_le_bytes());
        bytes.push(0); // termination flags
        bytes.extend_from_slice(&max_iterations.to_le_bytes());
        bytes.extend_from_slice(&0.01f64.to_le_bytes());
        bytes.extend_from_slice(&3u64.to_le_bytes());

        assert_eq!(bytes.len() as u64, INPUT_HEADER_SIZE);

        for t in 0..thread_amount {
            bytes.push(255);
            bytes.extend_from_slice(&1u64.to_le_bytes());
            bytes.extend_from_slice(&[t as u8, t as u8, t as u8]);
        }
        for i in 0..thread_order_size {
            bytes.extend_from_slice(&(i % thread_amount.max(1)).to_le_bytes());
        }
        for _ in 0..thread_amount {
            bytes.extend_from_slice(&0u64.to_le_bytes());
        }
        for _ in 0..pixel_amount {
            bytes.extend_from_slice(&[9, 9, 9]);
        }
        for _ in 0..pixel_amount {
            bytes.extend_from_slice(&1.0f64.to_le_bytes());
        }

        // output header
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0.0f64.to_le_bytes());
        for _ in 0..pixel_amount {
            bytes.extend_from_slice(&[0, 0, 0]);
        }
        for _ in 0..max_iterations {
            bytes.extend_from_slice(&0u64.to_le_bytes());
            bytes.extend_from_slice(&0u64.to_le_bytes());
            bytes.extend_from_slice(&0u64.to_le_bytes());
        }
        if debug_flags != 0 {
            for _ in 0..(max_iterations * pixel_amount) {
                bytes.extend_from_slice(&[0, 0, 0]);
            }
            for _ in 0..(max_iterations * pixel_amount) {
                bytes.extend_from_slice(&0u64.to_le_bytes());
            }
        }
        bytes
    }

    #[test]
    fn layout_round_trips_header_fields() {
        let bytes = tiny_region(2, 2, 3, 0);
        let region = SharedRegion::from_vec(bytes).unwrap();
        let input = region.input();
        assert_eq!(input.layout().image_width, 2);
        assert_eq!(input.indexer().thread_amount, 2);
        assert_eq!(input.termination().max_iterations, 3);
        assert_eq!(input.thread(1).color, Color::new(1, 1, 1));
    }

    #[test]
    fn output_view_writes_are_isolated_from_input() {
        let bytes = tiny_region(2, 1, 1, 0);
        let mut region = SharedRegion::from_vec(bytes).unwrap();
        {
            let (input, mut output) = region.views();
            assert_eq!(input.target(0), Color::new(9, 9, 9));
            output.set_result_pixel(0, Color::new(5, 6, 7));
            output.set_header(1, 42, 0.5);
        }
        let (input, output) = region.views();
        assert_eq!(input.target(0), Color::new(9, 9, 9));
        assert_eq!(output.result_pixel(0), Color::new(5, 6, 7));
        assert_eq!(output.instruction_amount(), 1);
        assert_eq!(output.absolute_error(), 42);
    }

    #[test]
    fn region_too_small_is_rejected() {
        let err = SharedRegion::from_vec(vec![0u8; 4]).unwrap_err();
        assert!(matches!(err, AttachError::TooSmall { .. }));
    }
}
