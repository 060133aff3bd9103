//! The greedy iteration loop: candidate enumeration, parallel dispatch,
//! per-pixel composite/score, best-candidate selection, termination checks,
//! and output emission.
//!
//! Ported from `optimizer.c` in the reference implementation, with three
//! corrections applied over the source: `connection_is_done` is indexed by
//! the candidate (not the write cursor), each candidate's running error is
//! reset from `last_best_error` at the top of every iteration instead of
//! left stale, and the relative-error termination check is skipped on
//! iteration 0 instead of dividing by zero.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use crate::color::{weighted_squared_error, Color};
use crate::error::AllocationError;
use crate::raster::draw_line;
use crate::shared_memory::{
    Disc, Indexer, InputView, Instruction, OutputView, Termination, ThreadSpec,
    DEBUG_STORE_ABSOLUTE_ERROR, DEBUG_STORE_IMAGES, TERMINATE_ON_MIN_RELATIVE_ERROR,
    TERMINATE_ON_UNAVAILABLE_CONNECTION,
};
use crate::worker_pool::WorkerPool;

/// Raw pointer wrapper used to share disjoint slices of the persistent
/// candidate buffers across worker threads without a lock. Soundness rests
/// on the disjointness argument in [`Optimizer::dispatch`]'s doc comment:
/// every worker touches only the candidates assigned to it, and
/// `WorkerPool::run` does not return until every worker has finished, so
/// there is no concurrent access to the same index and no access after this
/// function returns.
#[derive(Clone, Copy)]
struct RawSlice<T> {
    ptr: *const T,
    len: usize,
}
unsafe impl<T> Send for RawSlice<T> {}
unsafe impl<T> Sync for RawSlice<T> {}
impl<T> RawSlice<T> {
    fn new(s: &[T]) -> Self {
        RawSlice {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }
    fn null() -> Self {
        RawSlice {
            ptr: std::ptr::null(),
            len: 0,
        }
    }
    fn len(&self) -> usize {
        self.len
    }
    unsafe fn get(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

#[derive(Clone, Copy)]
struct RawSliceMut<T> {
    ptr: *mut T,
    len: usize,
}
unsafe impl<T> Send for RawSliceMut<T> {}
unsafe impl<T> Sync for RawSliceMut<T> {}
impl<T> RawSliceMut<T> {
    fn new(s: &mut [T]) -> Self {
        RawSliceMut {
            ptr: s.as_mut_ptr(),
            len: s.len(),
        }
    }
    fn null() -> Self {
        RawSliceMut {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }
    unsafe fn get(&self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

fn anchor_coords_for(index: u64, point_amount: u64, image_width: u64) -> (f64, f64) {
    let r = image_width as f64 / 2.0;
    let theta = 2.0 * PI * index as f64 / point_amount.max(1) as f64;
    (theta.cos() * r + r, image_width as f64 - (theta.sin() * r + r))
}

fn partition_range(len: usize, worker_index: usize, worker_amount: usize) -> (usize, usize) {
    let base = len / worker_amount;
    let rem = len % worker_amount;
    let start = worker_index * base + worker_index.min(rem);
    let extra = if worker_index < rem { 1 } else { 0 };
    let end = start + base + extra;
    (start, end)
}

/// Resulting total error for one candidate endpoint, plus the committed
/// per-pixel state needed if it turns out to be the winner.
#[allow(clippy::too_many_arguments)]
fn evaluate_candidate(
    candidate: u64,
    current_start: u64,
    thread: ThreadSpec,
    thickness_in_pixels: f64,
    image_width: u64,
    point_amount: u64,
    last_best_error: u64,
    target: &[Color],
    importance: &[f64],
    last_best_image: &[Color],
    last_best_error_image: &[u64],
    image_buffer_slot: &mut [Color],
    error_buffer_slot: &mut [u64],
    connection_is_done: &mut [bool],
) -> u64 {
    image_buffer_slot.copy_from_slice(last_best_image);
    error_buffer_slot.copy_from_slice(last_best_error_image);

    let (x0, y0) = anchor_coords_for(current_start, point_amount, image_width);
    let (x1, y1) = anchor_coords_for(candidate, point_amount, image_width);
    let alpha = thread.alpha as f64 / 255.0;

    let mut delta: i64 = 0;
    draw_line(x0, y0, x1, y1, thickness_in_pixels, &mut |x: i64, y: i64, intensity: f64| {
        if x < 0 || y < 0 || x as u64 >= image_width || y as u64 >= image_width {
            return;
        }
        let idx = (y as u64 * image_width + x as u64) as usize;
        let alpha_eff = alpha * intensity;
        let old_pixel = image_buffer_slot[idx];
        let new_pixel = Color::mix(old_pixel, thread.color, alpha_eff);
        let new_err = weighted_squared_error(target[idx], new_pixel, importance[idx]);
        let old_err = error_buffer_slot[idx];
        delta += new_err as i64 - old_err as i64;
        image_buffer_slot[idx] = new_pixel;
        error_buffer_slot[idx] = new_err;
    });

    let n = point_amount as usize;
    connection_is_done[candidate as usize * n + current_start as usize] = true;
    connection_is_done[current_start as usize * n + candidate as usize] = true;

    (last_best_error as i64 + delta).max(0) as u64
}

/// Copy of the iteration-local state the dispatch task reads on each
/// [`WorkerPool::run`]. Installed once via [`WorkerPool::set_task`] and
/// updated in place by [`Optimizer::dispatch`] every iteration, so a new
/// task closure (and its allocation) is never created inside the loop.
#[derive(Clone, Copy)]
struct DispatchParams {
    candidates: RawSlice<u64>,
    current_start: u64,
    thread: ThreadSpec,
    thickness_in_pixels: f64,
    image_width: u64,
    point_amount: u64,
    pixel_amount: usize,
    last_best_error: u64,
    target: RawSlice<Color>,
    importance: RawSlice<f64>,
    last_best_image: RawSlice<Color>,
    last_best_error_image: RawSlice<u64>,
    image_buffer: RawSliceMut<Color>,
    error_buffer: RawSliceMut<u64>,
    errors: RawSliceMut<u64>,
    connection_is_done: RawSliceMut<bool>,
}

impl DispatchParams {
    fn null() -> Self {
        DispatchParams {
            candidates: RawSlice::null(),
            current_start: 0,
            thread: ThreadSpec {
                alpha: 0,
                thickness_um: 0,
                color: Color::default(),
            },
            thickness_in_pixels: 0.0,
            image_width: 0,
            point_amount: 0,
            pixel_amount: 0,
            last_best_error: 0,
            target: RawSlice::null(),
            importance: RawSlice::null(),
            last_best_image: RawSlice::null(),
            last_best_error_image: RawSlice::null(),
            image_buffer: RawSliceMut::null(),
            error_buffer: RawSliceMut::null(),
            errors: RawSliceMut::null(),
            connection_is_done: RawSliceMut::null(),
        }
    }
}

/// Owned copy of every input record the optimizer needs, independent of the
/// shared-memory region's lifetime.
struct Inputs {
    image_width: u64,
    disc: Disc,
    indexer: Indexer,
    termination: Termination,
    debug_flags: u8,
    threads: Vec<ThreadSpec>,
    thread_order: Vec<u64>,
    start_points: Vec<u64>,
    target: Vec<Color>,
    importance: Vec<f64>,
}

impl Inputs {
    fn read(input: &InputView) -> Result<Inputs, AllocationError> {
        let layout = input.layout();
        let pixel_amount = layout.pixel_amount() as usize;
        let disc = input.disc();
        let indexer = input.indexer();
        let termination = input.termination();

        let threads = (0..indexer.thread_amount as usize).map(|i| input.thread(i)).collect();
        let thread_order = (0..layout.thread_order_size as usize)
            .map(|i| input.thread_order(i))
            .collect();
        let start_points = (0..indexer.thread_amount as usize)
            .map(|i| input.start_point(i))
            .collect();
        let target = (0..pixel_amount).map(|i| input.target(i)).collect();
        let importance = (0..pixel_amount).map(|i| input.importance(i)).collect();

        if layout.image_width == 0 {
            return Err(AllocationError::Overflow {
                name: "image_width",
                elements: 0,
            });
        }

        Ok(Inputs {
            image_width: layout.image_width,
            disc,
            indexer,
            termination,
            debug_flags: layout.debug_flags,
            threads,
            thread_order,
            start_points,
            target,
            importance,
        })
    }
}

/// Drives the full greedy stringing loop.
pub struct Optimizer {
    inputs: Inputs,
    pixel_amount: usize,
    thickness_in_pixels: Vec<f64>,

    last_best_image: Vec<Color>,
    last_best_error_image: Vec<u64>,
    last_best_error: u64,
    last_best_point_indices: Vec<u64>,

    image_buffer: Vec<Color>,
    error_buffer: Vec<u64>,
    errors: Vec<u64>,
    connection_is_done: Vec<bool>,

    possible_connections: Vec<u64>,
    current_thread_index: u64,
    current_iteration: u64,
    last_normalized_error: f64,
    current_normalized_error: f64,
    relative_error_streak: u64,

    instructions: Vec<Instruction>,
    worker_pool: WorkerPool,
    dispatch_params: Arc<Mutex<DispatchParams>>,

    debug_images_enabled: bool,
    debug_errors_enabled: bool,
    debug_images: Vec<Color>,
    debug_errors: Vec<u64>,

    // Pointers into the buffers above, computed once at construction and
    // reused by every `dispatch()` call instead of being recomputed (or the
    // buffers re-captured into a fresh closure) each iteration.
    target_ptr: RawSlice<Color>,
    importance_ptr: RawSlice<f64>,
    last_best_image_ptr: RawSlice<Color>,
    last_best_error_image_ptr: RawSlice<u64>,
    image_buffer_ptr: RawSliceMut<Color>,
    error_buffer_ptr: RawSliceMut<u64>,
    errors_ptr: RawSliceMut<u64>,
    connection_is_done_ptr: RawSliceMut<bool>,
}

impl Optimizer {
    pub fn new(input: &InputView, worker_pool: WorkerPool) -> Result<Optimizer, AllocationError> {
        let inputs = Inputs::read(input)?;
        let pixel_amount = (inputs.image_width * inputs.image_width) as usize;
        let point_amount = inputs.indexer.point_amount as usize;

        let thickness_in_pixels = inputs
            .threads
            .iter()
            .map(|t| {
                if inputs.disc.radius_um == 0 {
                    1.0
                } else {
                    t.thickness_um as f64 * inputs.image_width as f64
                        / (2.0 * inputs.disc.radius_um as f64)
                }
            })
            .collect();

        let image_buffer_len = point_amount
            .checked_mul(pixel_amount)
            .ok_or(AllocationError::Overflow {
                name: "image_buffer",
                elements: point_amount as u64,
            })?;
        let connections_len = point_amount.checked_mul(point_amount).ok_or(AllocationError::Overflow {
            name: "connection_is_done",
            elements: point_amount as u64,
        })?;

        let mut last_best_image = vec![Color::default(); pixel_amount];
        let mut last_best_error_image = vec![0u64; pixel_amount];
        let mut last_best_error = 0u64;

        let r = inputs.image_width as f64 / 2.0;
        for y in 0..inputs.image_width {
            for x in 0..inputs.image_width {
                let idx = (y * inputs.image_width + x) as usize;
                let dx = x as f64 + 0.5 - r;
                let dy = y as f64 + 0.5 - r;
                let inside = dx * dx + dy * dy <= r * r;
                let pixel = if inside { inputs.disc.background_color } else { Color::default() };
                let err = weighted_squared_error(inputs.target[idx], pixel, inputs.importance[idx]);
                last_best_image[idx] = pixel;
                last_best_error_image[idx] = err;
                last_best_error += err;
            }
        }

        log::info!(
            "optimizer constructed: image_width={} point_amount={} thread_amount={} max_iterations={} initial_error={}",
            inputs.image_width,
            point_amount,
            inputs.indexer.thread_amount,
            inputs.termination.max_iterations,
            last_best_error
        );

        let mut image_buffer = vec![Color::default(); image_buffer_len];
        let mut error_buffer = vec![0u64; image_buffer_len];
        let mut errors = vec![0u64; point_amount];
        let mut connection_is_done = vec![false; connections_len];
        let possible_connections = Vec::with_capacity(point_amount);

        // Pointers are taken here, before these buffers move into the
        // struct below; moving a `Vec` relocates the handle, not the heap
        // allocation it points at, so the pointers stay valid for the
        // optimizer's whole lifetime (the buffers are never resized again).
        let target_ptr = RawSlice::new(&inputs.target);
        let importance_ptr = RawSlice::new(&inputs.importance);
        let last_best_image_ptr = RawSlice::new(&last_best_image);
        let last_best_error_image_ptr = RawSlice::new(&last_best_error_image);
        let image_buffer_ptr = RawSliceMut::new(&mut image_buffer);
        let error_buffer_ptr = RawSliceMut::new(&mut error_buffer);
        let errors_ptr = RawSliceMut::new(&mut errors);
        let connection_is_done_ptr = RawSliceMut::new(&mut connection_is_done);

        let dispatch_params = Arc::new(Mutex::new(DispatchParams::null()));
        let task_params = Arc::clone(&dispatch_params);
        worker_pool.set_task(move |worker_index, worker_amount| {
            let params = *task_params.lock().unwrap();
            let (start, end) = partition_range(params.candidates.len(), worker_index, worker_amount);
            // SAFETY: see RawSlice/RawSliceMut doc comments. Each worker
            // only touches the candidates in its own contiguous range, and
            // the coordinator waits on the pool barrier before reusing
            // these buffers.
            let candidates = unsafe { params.candidates.get() };
            let target = unsafe { params.target.get() };
            let importance = unsafe { params.importance.get() };
            let last_best_image = unsafe { params.last_best_image.get() };
            let last_best_error_image = unsafe { params.last_best_error_image.get() };
            let image_buffer = unsafe { params.image_buffer.get() };
            let error_buffer = unsafe { params.error_buffer.get() };
            let errors = unsafe { params.errors.get() };
            let connection_is_done = unsafe { params.connection_is_done.get() };

            for &candidate in &candidates[start..end] {
                let slot = candidate as usize * params.pixel_amount;
                let result = evaluate_candidate(
                    candidate,
                    params.current_start,
                    params.thread,
                    params.thickness_in_pixels,
                    params.image_width,
                    params.point_amount,
                    params.last_best_error,
                    target,
                    importance,
                    last_best_image,
                    last_best_error_image,
                    &mut image_buffer[slot..slot + params.pixel_amount],
                    &mut error_buffer[slot..slot + params.pixel_amount],
                    connection_is_done,
                );
                errors[candidate as usize] = result;
            }
        });

        let debug_images_enabled = inputs.debug_flags & DEBUG_STORE_IMAGES != 0;
        let debug_errors_enabled = inputs.debug_flags & DEBUG_STORE_ABSOLUTE_ERROR != 0;
        let debug_images_len = if debug_images_enabled {
            inputs.termination.max_iterations as usize * pixel_amount
        } else {
            0
        };
        let debug_errors_len = if debug_errors_enabled {
            inputs.termination.max_iterations as usize * pixel_amount
        } else {
            0
        };

        Ok(Optimizer {
            last_best_point_indices: inputs.start_points.clone(),
            image_buffer,
            error_buffer,
            errors,
            connection_is_done,
            possible_connections,
            current_thread_index: 0,
            current_iteration: 0,
            last_normalized_error: 0.0,
            current_normalized_error: 0.0,
            relative_error_streak: 0,
            instructions: Vec::with_capacity(inputs.termination.max_iterations as usize),
            pixel_amount,
            thickness_in_pixels,
            last_best_image,
            last_best_error_image,
            last_best_error,
            inputs,
            worker_pool,
            dispatch_params,
            debug_images_enabled,
            debug_errors_enabled,
            debug_images: vec![Color::default(); debug_images_len],
            debug_errors: vec![0u64; debug_errors_len],
            target_ptr,
            importance_ptr,
            last_best_image_ptr,
            last_best_error_image_ptr,
            image_buffer_ptr,
            error_buffer_ptr,
            errors_ptr,
            connection_is_done_ptr,
        })
    }

    fn prepare_candidates(&mut self) {
        let point_amount = self.inputs.indexer.point_amount;
        let current_start = self.last_best_point_indices[self.current_thread_index as usize];
        let filter_unavailable =
            self.inputs.termination.flags & TERMINATE_ON_UNAVAILABLE_CONNECTION != 0;
        let n = point_amount as usize;

        self.possible_connections.clear();
        for candidate in 0..point_amount {
            if candidate == current_start {
                continue;
            }
            if filter_unavailable
                && self.connection_is_done[candidate as usize * n + current_start as usize]
            {
                continue;
            }
            self.possible_connections.push(candidate);
        }
    }

    /// Updates the shared dispatch state and wakes the worker pool to score
    /// every candidate in `possible_connections`. Each candidate `p` owns
    /// disjoint slices `image_buffer[p]`/`error_buffer[p]` and a single
    /// scalar `errors[p]`; `connection_is_done` writes land at disjoint
    /// `(start, p)`/`(p, start)` coordinates across workers. Building a new
    /// `DispatchParams` value here is a plain stack copy, not a heap
    /// allocation — the task closure itself was installed once, in `new`.
    fn dispatch(&mut self) {
        let current_start = self.last_best_point_indices[self.current_thread_index as usize];
        let thread = self.inputs.threads[self.current_thread_index as usize];
        let thickness_in_pixels = self.thickness_in_pixels[self.current_thread_index as usize];

        let params = DispatchParams {
            candidates: RawSlice::new(&self.possible_connections),
            current_start,
            thread,
            thickness_in_pixels,
            image_width: self.inputs.image_width,
            point_amount: self.inputs.indexer.point_amount,
            pixel_amount: self.pixel_amount,
            last_best_error: self.last_best_error,
            target: self.target_ptr,
            importance: self.importance_ptr,
            last_best_image: self.last_best_image_ptr,
            last_best_error_image: self.last_best_error_image_ptr,
            image_buffer: self.image_buffer_ptr,
            error_buffer: self.error_buffer_ptr,
            errors: self.errors_ptr,
            connection_is_done: self.connection_is_done_ptr,
        };
        *self.dispatch_params.lock().unwrap() = params;
        self.worker_pool.run();
    }

    fn select_best(&self) -> Option<u64> {
        self.possible_connections
            .iter()
            .copied()
            .min_by_key(|&p| (self.errors[p as usize], p))
    }

    fn commit(&mut self, best: u64) {
        let start = self.last_best_point_indices[self.current_thread_index as usize];
        let slot = best as usize * self.pixel_amount;
        self.last_best_image
            .copy_from_slice(&self.image_buffer[slot..slot + self.pixel_amount]);
        self.last_best_error_image
            .copy_from_slice(&self.error_buffer[slot..slot + self.pixel_amount]);
        self.last_best_error = self.errors[best as usize];
        self.last_best_point_indices[self.current_thread_index as usize] = best;
        self.last_normalized_error = self.current_normalized_error;
        self.current_normalized_error = self.last_best_error as f64 / self.pixel_amount as f64;

        self.instructions.push(Instruction {
            start,
            end: best,
            thread: self.current_thread_index,
        });

        if self.debug_images_enabled || self.debug_errors_enabled {
            self.record_debug_snapshot();
        }
    }

    /// Mirrors the committed canvas and per-pixel error image into the
    /// in-region debug arrays for the iteration that was just committed,
    /// one slot per iteration.
    fn record_debug_snapshot(&mut self) {
        let base = self.current_iteration as usize * self.pixel_amount;
        if self.debug_images_enabled {
            self.debug_images[base..base + self.pixel_amount].copy_from_slice(&self.last_best_image);
        }
        if self.debug_errors_enabled {
            self.debug_errors[base..base + self.pixel_amount]
                .copy_from_slice(&self.last_best_error_image);
        }
    }

    fn post_check_termination(&mut self) -> bool {
        if self.current_iteration == 0 {
            return false;
        }
        if self.inputs.termination.flags & TERMINATE_ON_MIN_RELATIVE_ERROR == 0 {
            return false;
        }
        if self.last_normalized_error == 0.0 {
            return false;
        }
        let relative = 1.0 - self.current_normalized_error / self.last_normalized_error;
        if relative <= self.inputs.termination.min_relative_error {
            self.relative_error_streak += 1;
        } else {
            self.relative_error_streak = 0;
        }
        self.relative_error_streak >= self.inputs.termination.relative_error_streak
    }

    /// Runs the full iteration loop to completion or early termination,
    /// returning the number of instructions actually emitted.
    pub fn run(&mut self) -> u64 {
        self.run_with(|_iteration, _image| {})
    }

    /// Like [`Optimizer::run`], but invokes `observer(iteration, last_best_image)`
    /// after every committed candidate. Used by the binary entry point to
    /// drive the supplemental on-disk debug dump (see [`crate::debug`]).
    pub fn run_with<F: FnMut(u64, &[Color])>(&mut self, mut observer: F) -> u64 {
        let max_iterations = self.inputs.termination.max_iterations;
        let thread_order_size = self.inputs.thread_order.len().max(1) as u64;

        while self.current_iteration < max_iterations {
            self.current_thread_index =
                self.inputs.thread_order[(self.current_iteration % thread_order_size) as usize];

            self.prepare_candidates();

            if self.inputs.termination.flags & TERMINATE_ON_UNAVAILABLE_CONNECTION != 0
                && self.possible_connections.is_empty()
            {
                log::info!(
                    "terminating at iteration {}: no admissible connection remains",
                    self.current_iteration
                );
                break;
            }

            self.dispatch();

            let best = match self.select_best() {
                Some(b) => b,
                None => break,
            };
            self.commit(best);

            log::trace!(
                "iteration {}: thread={} start->end={}->{} error={}",
                self.current_iteration,
                self.current_thread_index,
                self.last_best_point_indices[self.current_thread_index as usize],
                best,
                self.last_best_error
            );

            self.current_iteration += 1;
            observer(self.current_iteration, &self.last_best_image);

            if self.post_check_termination() {
                log::info!(
                    "terminating at iteration {}: relative-error streak reached",
                    self.current_iteration
                );
                break;
            }
        }

        log::info!(
            "optimizer finished after {} iteration(s), absolute_error={}",
            self.current_iteration,
            self.last_best_error
        );
        self.current_iteration
    }

    pub fn image_width(&self) -> u64 {
        self.inputs.image_width
    }

    pub fn last_best_image(&self) -> &[Color] {
        &self.last_best_image
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn last_best_error(&self) -> u64 {
        self.last_best_error
    }

    pub fn current_normalized_error(&self) -> f64 {
        self.current_normalized_error
    }

    /// Writes the committed canvas, instruction log, header fields, and (if
    /// the region has room for them) the per-iteration debug arrays to the
    /// output section.
    pub fn write_output(&self, output: &mut OutputView) {
        output.set_header(
            self.current_iteration,
            self.last_best_error,
            self.current_normalized_error,
        );
        for (idx, &color) in self.last_best_image.iter().enumerate() {
            output.set_result_pixel(idx, color);
        }
        for (idx, instruction) in self.instructions.iter().enumerate() {
            output.set_instruction(idx, *instruction);
        }

        if !output.debug_enabled() {
            return;
        }
        for iteration in 0..self.current_iteration as usize {
            let base = iteration * self.pixel_amount;
            if self.debug_images_enabled {
                for (pixel_index, &color) in
                    self.debug_images[base..base + self.pixel_amount].iter().enumerate()
                {
                    output.set_debug_image_pixel(iteration, pixel_index, color);
                }
            }
            if self.debug_errors_enabled {
                for (pixel_index, &error) in
                    self.debug_errors[base..base + self.pixel_amount].iter().enumerate()
                {
                    output.set_debug_absolute_error(iteration, pixel_index, error);
                }
            }
        }
    }
}
