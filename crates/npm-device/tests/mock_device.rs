//! End-to-end correctness tests for the mock backend.

use npm_device::{BufferHandle, MatMulParams, MockDevice, NpmDevice};
use npm_protocol::DataType;

fn register(dev: &mut MockDevice, data: &mut [f32]) -> BufferHandle {
    // SAFETY: every buffer in these tests outlives the device usage.
    unsafe {
        dev.register_buffer(data.as_mut_ptr().cast(), std::mem::size_of_val(data))
            .expect("register")
    }
}

fn matmul_params(
    a: BufferHandle,
    b: BufferHandle,
    c: BufferHandle,
    (m, n, k): (i64, i64, i64),
) -> MatMulParams {
    MatMulParams {
        a_handle: a,
        a_offset: 0,
        b_handle: b,
        b_offset: 0,
        c_handle: c,
        c_offset: 0,
        m,
        n,
        k,
        lda: k,
        ldb: k,
        ldc: n,
        type_a: DataType::F32,
        type_b: DataType::F32,
        type_c: DataType::F32,
    }
}

fn naive_gemm(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for mi in 0..m {
        for ni in 0..n {
            let mut sum = 0.0f32;
            for ki in 0..k {
                sum += a[mi * k + ki] * b[ni * k + ki];
            }
            c[mi * n + ni] = sum;
        }
    }
    c
}

fn max_abs_diff(x: &[f32], y: &[f32]) -> f32 {
    x.iter()
        .zip(y)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f32::max)
}

#[test]
fn tiny_fp32_matmul() {
    let mut dev = MockDevice::init(0).unwrap();

    let mut a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    #[rustfmt::skip]
    let mut b = [
        1.0f32, 0.0, 0.0,
        0.0,    1.0, 0.0,
        0.0,    0.0, 1.0,
        1.0,    1.0, 1.0,
    ];
    let mut c = [0.0f32; 8];

    let ha = register(&mut dev, &mut a);
    let hb = register(&mut dev, &mut b);
    let hc = register(&mut dev, &mut c);
    dev.matmul(&matmul_params(ha, hb, hc, (2, 4, 3))).unwrap();

    let expected = [1.0f32, 2.0, 3.0, 6.0, 4.0, 5.0, 6.0, 15.0];
    assert!(
        max_abs_diff(&c, &expected) < 1e-5,
        "got {c:?}, expected {expected:?}"
    );
}

#[test]
fn mid_size_matmul_matches_reference() {
    let (m, n, k) = (64usize, 128usize, 64usize);
    let mut a: Vec<f32> = (0..m * k).map(|i| 0.1 * (i % 10) as f32).collect();
    let mut b: Vec<f32> = (0..n * k).map(|i| 0.1 * (i % 10) as f32).collect();
    let mut c = vec![0.0f32; m * n];
    let expected = naive_gemm(&a, &b, m, n, k);

    let mut dev = MockDevice::init(0).unwrap();
    let ha = register(&mut dev, &mut a);
    let hb = register(&mut dev, &mut b);
    let hc = register(&mut dev, &mut c);
    dev.matmul(&matmul_params(ha, hb, hc, (m as i64, n as i64, k as i64)))
        .unwrap();

    assert!(max_abs_diff(&c, &expected) < 1e-4);
}

#[test]
fn degenerate_dimensions_are_correct() {
    // M=1, N=1 and K=1 each exercise a collapsed loop
    let cases: &[(i64, i64, i64)] = &[(1, 4, 3), (2, 1, 3), (2, 4, 1)];
    for &(m, n, k) in cases {
        let mut a: Vec<f32> = (0..(m * k) as usize).map(|i| i as f32 + 1.0).collect();
        let mut b: Vec<f32> = (0..(n * k) as usize).map(|i| 0.5 * i as f32 - 1.0).collect();
        let mut c = vec![0.0f32; (m * n) as usize];
        let expected = naive_gemm(&a, &b, m as usize, n as usize, k as usize);

        let mut dev = MockDevice::init(0).unwrap();
        let ha = register(&mut dev, &mut a);
        let hb = register(&mut dev, &mut b);
        let hc = register(&mut dev, &mut c);
        dev.matmul(&matmul_params(ha, hb, hc, (m, n, k))).unwrap();

        assert!(
            max_abs_diff(&c, &expected) < 1e-5,
            "M={m} N={n} K={k}: got {c:?}, expected {expected:?}"
        );
    }
}

#[test]
fn strided_operands_use_leading_dimensions() {
    // A is a 2x3 window in a 2x5 row-major buffer (lda=5); C is written
    // into a 2x6 buffer (ldc=6)
    let (m, n, k) = (2i64, 4i64, 3i64);
    let mut a = [
        1.0f32, 2.0, 3.0, -9.0, -9.0, //
        4.0, 5.0, 6.0, -9.0, -9.0,
    ];
    #[rustfmt::skip]
    let mut b = [
        1.0f32, 0.0, 0.0,
        0.0,    1.0, 0.0,
        0.0,    0.0, 1.0,
        1.0,    1.0, 1.0,
    ];
    let mut c = [7.0f32; 12];

    let mut dev = MockDevice::init(0).unwrap();
    let ha = register(&mut dev, &mut a);
    let hb = register(&mut dev, &mut b);
    let hc = register(&mut dev, &mut c);

    let mut params = matmul_params(ha, hb, hc, (m, n, k));
    params.lda = 5;
    params.ldc = 6;
    dev.matmul(&params).unwrap();

    assert_eq!(&c[0..4], &[1.0, 2.0, 3.0, 6.0]);
    assert_eq!(&c[6..10], &[4.0, 5.0, 6.0, 15.0]);
    // untouched tail of each C row
    assert_eq!(&c[4..6], &[7.0, 7.0]);
    assert_eq!(&c[10..12], &[7.0, 7.0]);
}

#[test]
fn register_unregister_returns_to_prior_state() {
    let mut dev = MockDevice::init(0).unwrap();
    let mut x = [0.0f32; 8];
    let h = register(&mut dev, &mut x);
    dev.unregister_buffer(h).unwrap();

    // the handle is gone and is not reissued
    let mut y = [0.0f32; 8];
    let h2 = register(&mut dev, &mut y);
    assert_ne!(h, h2);

    let mut a = [1.0f32; 3];
    let mut b = [1.0f32; 3];
    let mut c = [0.0f32; 1];
    let ha = register(&mut dev, &mut a);
    let hb = register(&mut dev, &mut b);
    let hc = register(&mut dev, &mut c);
    // the stale handle is rejected where a live one works
    assert!(dev.matmul(&matmul_params(ha, hb, hc, (1, 1, 3))).is_ok());
    assert!(dev.matmul(&matmul_params(h, hb, hc, (1, 1, 3))).is_err());
}

#[test]
fn handles_are_unique_across_lifetime() {
    let mut dev = MockDevice::init(0).unwrap();
    let mut seen = std::collections::HashSet::new();
    let mut bufs: Vec<Box<[f32; 4]>> = Vec::new();
    for _ in 0..100 {
        bufs.push(Box::new([0.0f32; 4]));
        let ptr = bufs.last_mut().unwrap().as_mut_ptr();
        // SAFETY: the boxed buffers live to the end of the test.
        let h = unsafe { dev.register_buffer(ptr.cast(), 16).unwrap() };
        assert!(h.is_valid());
        assert!(seen.insert(h), "handle {h:?} was reused");
    }
}
