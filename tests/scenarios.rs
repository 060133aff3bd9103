//! Whole-pipeline scenarios exercising the crate's public surface
//! (`SharedRegion` + `Optimizer` + `WorkerPool`) rather than a single
//! module's internals.

use threadloom::color::Color;
use threadloom::optimizer::Optimizer;
use threadloom::shared_memory::{
    SharedRegion, TERMINATE_ON_MIN_RELATIVE_ERROR, TERMINATE_ON_UNAVAILABLE_CONNECTION,
};
use threadloom::worker_pool::WorkerPool;

#[allow(clippy::too_many_arguments)]
fn build_region(
    image_width: u64,
    point_amount: u64,
    thread_amount: u64,
    thread_order: &[u64],
    start_points: &[u64],
    target: &[Color],
    importance: &[f64],
    termination_flags: u8,
    max_iterations: u64,
    min_relative_error: f64,
    relative_error_streak: u64,
    threads: &[(u8, u64, Color)],
    background: Color,
    radius_um: u64,
) -> Vec<u8> {
    let pixel_amount = (image_width * image_width) as usize;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&image_width.to_le_bytes());
    bytes.extend_from_slice(&(thread_order.len() as u64).to_le_bytes());
    bytes.push(0); // debug_flags
    bytes.extend_from_slice(&radius_um.to_le_bytes());
    bytes.extend_from_slice(&[background.c, background.m, background.y]);
    bytes.extend_from_slice(&point_amount.to_le_bytes());
    bytes.extend_from_slice(&thread_amount.to_le_bytes());
    bytes.push(termination_flags);
    bytes.extend_from_slice(&max_iterations.to_le_bytes());
    bytes.extend_from_slice(&min_relative_error.to_le_bytes());
    bytes.extend_from_slice(&relative_error_streak.to_le_bytes());

    for &(alpha, thickness_um, color) in threads {
        bytes.push(alpha);
        bytes.extend_from_slice(&thickness_um.to_le_bytes());
        bytes.extend_from_slice(&[color.c, color.m, color.y]);
    }
    for &t in thread_order {
        bytes.extend_from_slice(&t.to_le_bytes());
    }
    for &s in start_points {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    for c in target {
        bytes.extend_from_slice(&[c.c, c.m, c.y]);
    }
    for w in importance {
        bytes.extend_from_slice(&w.to_le_bytes());
    }

    // output section
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
    bytes
}

/// S1: a single thread whose chord exactly matches an all-background
/// target should commit with zero error.
#[test]
fn trivial_single_point_converges_to_zero_error() {
    let image_width = 8;
    let background = Color::new(0, 0, 0);
    let pixel_amount = (image_width * image_width) as usize;
    let target = vec![background; pixel_amount];
    let importance = vec![1.0; pixel_amount];

    let bytes = build_region(
        image_width,
        4,
        1,
        &[0],
        &[0],
        &target,
        &importance,
        0,
        1,
        0.0,
        0,
        &[(255, 2 * 100, background)],
        background,
        100,
    );

    let region = SharedRegion::from_vec(bytes).unwrap();
    let input = region.input();
    let pool = WorkerPool::new(2, false).unwrap();
    let mut optimizer = Optimizer::new(&input, pool).unwrap();
    let iterations = optimizer.run();
    assert_eq!(iterations, 1);
    assert_eq!(optimizer.last_best_error(), 0);
}

/// S2: with TERMINATE_ON_UNAVAILABLE_CONNECTION, a 3-point disc runs
/// out of admissible connections after 2 iterations.
#[test]
fn unavailable_connection_terminates_early() {
    let image_width = 8;
    let background = Color::new(10, 10, 10);
    let pixel_amount = (image_width * image_width) as usize;
    let target = vec![Color::new(0, 0, 0); pixel_amount];
    let importance = vec![1.0; pixel_amount];

    let bytes = build_region(
        image_width,
        3,
        1,
        &[0, 0, 0, 0, 0],
        &[0],
        &target,
        &importance,
        TERMINATE_ON_UNAVAILABLE_CONNECTION,
        100,
        0.0,
        0,
        &[(128, 100, Color::new(50, 50, 50))],
        background,
        100,
    );

    let region = SharedRegion::from_vec(bytes).unwrap();
    let input = region.input();
    let pool = WorkerPool::new(1, false).unwrap();
    let mut optimizer = Optimizer::new(&input, pool).unwrap();
    let iterations = optimizer.run();
    assert_eq!(iterations, 2);
}

/// S3: with TERMINATE_ON_MIN_RELATIVE_ERROR and a thread whose alpha is
/// zero, every chord leaves the canvas (and hence the error) unchanged, so
/// the relative-improvement streak fires once it reaches the configured
/// threshold.
#[test]
fn min_relative_error_streak_terminates_early() {
    let image_width = 8;
    let background = Color::new(20, 20, 20);
    let pixel_amount = (image_width * image_width) as usize;
    let target = vec![Color::new(80, 10, 5); pixel_amount];
    let importance = vec![1.0; pixel_amount];

    let bytes = build_region(
        image_width,
        5,
        1,
        &[0],
        &[0],
        &target,
        &importance,
        TERMINATE_ON_MIN_RELATIVE_ERROR,
        50,
        0.0,
        3,
        &[(0, 100, Color::new(255, 255, 255))],
        background,
        100,
    );

    let region = SharedRegion::from_vec(bytes).unwrap();
    let input = region.input();
    let pool = WorkerPool::new(2, false).unwrap();
    let mut optimizer = Optimizer::new(&input, pool).unwrap();
    let initial_error = optimizer.last_best_error();
    let iterations = optimizer.run();

    assert_eq!(iterations, 4);
    assert_eq!(optimizer.last_best_error(), initial_error);
}

/// S4: determinism — two runs over byte-identical input produce
/// byte-identical instruction logs and final error.
#[test]
fn identical_input_is_deterministic() {
    let image_width = 16;
    let background = Color::new(5, 5, 5);
    let pixel_amount = (image_width * image_width) as usize;
    let target: Vec<Color> = (0..pixel_amount)
        .map(|i| Color::new((i % 251) as u8, ((i * 7) % 251) as u8, ((i * 13) % 251) as u8))
        .collect();
    let importance = vec![1.0; pixel_amount];

    let make = || {
        build_region(
            image_width,
            8,
            2,
            &[0, 1, 0, 1, 0, 1],
            &[0, 4],
            &target,
            &importance,
            0,
            6,
            0.0,
            0,
            &[(200, 80, Color::new(200, 10, 10)), (180, 60, Color::new(10, 200, 10))],
            background,
            100,
        )
    };

    let run_once = || {
        let region = SharedRegion::from_vec(make()).unwrap();
        let input = region.input();
        let pool = WorkerPool::new(3, false).unwrap();
        let mut optimizer = Optimizer::new(&input, pool).unwrap();
        optimizer.run();
        (optimizer.instructions().to_vec(), optimizer.last_best_error())
    };

    let (instr_a, err_a) = run_once();
    let (instr_b, err_b) = run_once();
    assert_eq!(instr_a, instr_b);
    assert_eq!(err_a, err_b);
}

/// S6: doubling every importance weight doubles the accumulated error.
#[test]
fn importance_scaling_doubles_error() {
    let image_width = 6;
    let background = Color::new(0, 0, 0);
    let pixel_amount = (image_width * image_width) as usize;
    let target = vec![Color::new(50, 0, 0); pixel_amount];

    let run_with_weight = |w: f64| {
        let importance = vec![w; pixel_amount];
        let bytes = build_region(
            image_width,
            4,
            1,
            &[0],
            &[0],
            &target,
            &importance,
            0,
            0,
            0.0,
            0,
            &[(255, 100, background)],
            background,
            100,
        );
        let region = SharedRegion::from_vec(bytes).unwrap();
        let input = region.input();
        let pool = WorkerPool::new(1, false).unwrap();
        let optimizer = Optimizer::new(&input, pool).unwrap();
        optimizer.last_best_error()
    };

    let base = run_with_weight(1.0);
    let doubled = run_with_weight(2.0);
    assert_eq!(doubled, base * 2);
}
