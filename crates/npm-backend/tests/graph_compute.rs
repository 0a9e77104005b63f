//! Graph-backend tests against the mock device: the op-support
//! predicate, batched broadcasting, and quantized-weight staging.

use npm_backend::{Dequantize, Graph, GraphBackend, NoDequant, Tensor, TensorOp, TensorType};
use npm_device::{MockDevice, NpmDevice, Result};

fn mock_backend(dequantizer: Box<dyn Dequantize>) -> GraphBackend {
    GraphBackend::new(Box::new(MockDevice::init(0).unwrap()), dequantizer)
}

fn max_abs_diff(x: &[f32], y: &[f32]) -> f32 {
    x.iter()
        .zip(y)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f32::max)
}

/// A toy 34-byte block format in the shape of Q8_0: a little-endian
/// u16 scale (in hundredths) followed by 32 signed byte quants.
struct ToyDequant;

impl ToyDequant {
    const BLOCK: usize = 32;
    const BLOCK_BYTES: usize = 34;

    fn pack(scale_hundredths: u16, quants: &[i8]) -> Vec<u8> {
        assert_eq!(quants.len() % Self::BLOCK, 0);
        let mut out = Vec::new();
        for block in quants.chunks(Self::BLOCK) {
            out.extend_from_slice(&scale_hundredths.to_le_bytes());
            out.extend(block.iter().map(|&q| q as u8));
        }
        out
    }
}

impl Dequantize for ToyDequant {
    fn supports(&self, ty: TensorType) -> bool {
        ty == TensorType::Q8_0
    }

    fn to_float(&self, ty: TensorType, src: &[u8], dst: &mut [f32]) -> Result<()> {
        assert_eq!(ty, TensorType::Q8_0);
        for (i, out) in dst.iter_mut().enumerate() {
            let block = i / Self::BLOCK;
            let base = block * Self::BLOCK_BYTES;
            let scale =
                f32::from(u16::from_le_bytes([src[base], src[base + 1]])) / 100.0;
            let q = src[base + 2 + i % Self::BLOCK] as i8;
            *out = scale * f32::from(q);
        }
        Ok(())
    }
}

#[test]
fn single_matmul_through_the_graph() {
    let mut w = [1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0]; // N=2 rows of K=3
    let mut x = [1.0f32, 2.0, 3.0]; // M=1
    let mut c = [0.0f32; 2];

    let mut graph = Graph::default();
    let iw = graph.push(Tensor::dense_f32([3, 2, 1, 1], w.as_mut_ptr().cast()));
    let ix = graph.push(Tensor::dense_f32([3, 1, 1, 1], x.as_mut_ptr().cast()));
    let w_node = graph.nodes[iw].clone();
    let x_node = graph.nodes[ix].clone();
    graph.push(Tensor::mul_mat_dst(
        &w_node,
        &x_node,
        [iw, ix],
        c.as_mut_ptr().cast(),
    ));

    let mut backend = mock_backend(Box::new(NoDequant));
    let node = graph.nodes[2].clone();
    assert!(backend.supports_op(&graph, &node));
    backend.graph_compute(&graph).unwrap();

    assert!(max_abs_diff(&c, &[1.0, 6.0]) < 1e-5);
}

#[test]
fn batched_broadcast_matches_per_batch_matmul() {
    // weights are shared (ne02 = 1) across 4 activation batches
    // (ne12 = 4): every batch output must equal its own matmul
    let (k, n, m, batches) = (3usize, 2usize, 2usize, 4usize);
    let mut w: Vec<f32> = (0..k * n).map(|i| 0.25 * i as f32 - 0.5).collect();
    let mut x: Vec<f32> = (0..k * m * batches).map(|i| 0.1 * (i % 13) as f32).collect();
    let mut c = vec![0.0f32; n * m * batches];

    let mut graph = Graph::default();
    let iw = graph.push(Tensor::dense_f32(
        [k as i64, n as i64, 1, 1],
        w.as_mut_ptr().cast(),
    ));
    let ix = graph.push(Tensor::dense_f32(
        [k as i64, m as i64, batches as i64, 1],
        x.as_mut_ptr().cast(),
    ));
    let w_node = graph.nodes[iw].clone();
    let x_node = graph.nodes[ix].clone();
    graph.push(Tensor::mul_mat_dst(
        &w_node,
        &x_node,
        [iw, ix],
        c.as_mut_ptr().cast(),
    ));

    let mut backend = mock_backend(Box::new(NoDequant));
    backend.graph_compute(&graph).unwrap();

    for batch in 0..batches {
        for mi in 0..m {
            for ni in 0..n {
                let mut expected = 0.0f32;
                for ki in 0..k {
                    expected +=
                        x[batch * m * k + mi * k + ki] * w[ni * k + ki];
                }
                let got = c[batch * m * n + mi * n + ni];
                assert!(
                    (got - expected).abs() < 1e-5,
                    "batch {batch} [{mi},{ni}]: got {got}, expected {expected}"
                );
            }
        }
    }
}

#[test]
fn quantized_weights_are_staged_through_the_dequant_buffer() {
    let (k, n) = (32usize, 2usize);
    let quants: Vec<i8> = (0..(k * n) as i32).map(|i| (i % 17 - 8) as i8).collect();
    let mut packed = ToyDequant::pack(100, &quants); // scale 1.0
    let mut x: Vec<f32> = (0..k).map(|i| 0.5 * (i % 5) as f32).collect();
    let mut c = vec![0.0f32; n];

    let mut graph = Graph::default();
    let iw = graph.push(Tensor::leaf(
        TensorType::Q8_0,
        [k as i64, n as i64, 1, 1],
        packed.as_mut_ptr(),
    ));
    let ix = graph.push(Tensor::dense_f32([k as i64, 1, 1, 1], x.as_mut_ptr().cast()));
    let w_node = graph.nodes[iw].clone();
    let x_node = graph.nodes[ix].clone();
    graph.push(Tensor::mul_mat_dst(
        &w_node,
        &x_node,
        [iw, ix],
        c.as_mut_ptr().cast(),
    ));

    let mut backend = mock_backend(Box::new(ToyDequant));
    let node = graph.nodes[2].clone();
    assert!(backend.supports_op(&graph, &node));
    backend.graph_compute(&graph).unwrap();

    for ni in 0..n {
        let expected: f32 = (0..k)
            .map(|ki| f32::from(quants[ni * k + ki]) * x[ki])
            .sum();
        assert!(
            (c[ni] - expected).abs() < 1e-4,
            "row {ni}: got {}, expected {expected}",
            c[ni]
        );
    }

    // a second pass reuses the cached handles and the dequant
    // registration; refreshed activations must flow through
    for v in &mut x {
        *v += 1.0;
    }
    backend.graph_compute(&graph).unwrap();
    for ni in 0..n {
        let expected: f32 = (0..k)
            .map(|ki| f32::from(quants[ni * k + ki]) * x[ki])
            .sum();
        assert!((c[ni] - expected).abs() < 1e-4);
    }
}

#[test]
fn pass_through_ops_are_always_supported() {
    let graph = Graph::default();
    let backend = mock_backend(Box::new(NoDequant));
    for op in [
        TensorOp::None,
        TensorOp::Reshape,
        TensorOp::View,
        TensorOp::Permute,
        TensorOp::Transpose,
    ] {
        let mut node = Tensor::dense_f32([4, 4, 1, 1], std::ptr::null_mut());
        node.op = op;
        assert!(backend.supports_op(&graph, &node), "{op:?}");
    }

    let mut node = Tensor::dense_f32([4, 4, 1, 1], std::ptr::null_mut());
    node.op = TensorOp::Add;
    assert!(!backend.supports_op(&graph, &node));
}

#[test]
fn support_predicate_rejects_what_the_device_cannot_run() {
    let mut graph = Graph::default();
    let iw = graph.push(Tensor::dense_f32([48, 2, 1, 1], std::ptr::null_mut()));
    let ix = graph.push(Tensor::dense_f32([48, 2, 1, 1], std::ptr::null_mut()));
    let w_node = graph.nodes[iw].clone();
    let x_node = graph.nodes[ix].clone();
    let node = Tensor::mul_mat_dst(&w_node, &x_node, [iw, ix], std::ptr::null_mut());

    let backend = mock_backend(Box::new(ToyDequant));

    // the FP32 baseline is fine
    assert!(backend.supports_op(&graph, &node));

    // quantized weights without a dequant routine fall back
    let mut no_dequant_graph = Graph::default();
    no_dequant_graph.push(Tensor::leaf(TensorType::Q8_0, [64, 2, 1, 1], std::ptr::null_mut()));
    no_dequant_graph.push(Tensor::dense_f32([64, 2, 1, 1], std::ptr::null_mut()));
    let w_node = no_dequant_graph.nodes[0].clone();
    let x_node = no_dequant_graph.nodes[1].clone();
    let q_node = Tensor::mul_mat_dst(&w_node, &x_node, [0, 1], std::ptr::null_mut());
    let plain = mock_backend(Box::new(NoDequant));
    assert!(!plain.supports_op(&no_dequant_graph, &q_node));
    // ... but run on NPM when the host lends one
    assert!(backend.supports_op(&no_dequant_graph, &q_node));

    // K off the quantization block boundary falls back (48 % 32 != 0)
    let mut misaligned = Graph::default();
    misaligned.push(Tensor::leaf(TensorType::Q8_0, [48, 2, 1, 1], std::ptr::null_mut()));
    misaligned.push(Tensor::dense_f32([48, 2, 1, 1], std::ptr::null_mut()));
    let w_node = misaligned.nodes[0].clone();
    let x_node = misaligned.nodes[1].clone();
    let bad = Tensor::mul_mat_dst(&w_node, &x_node, [0, 1], std::ptr::null_mut());
    assert!(!backend.supports_op(&misaligned, &bad));

    // non-FP32 activations fall back
    let mut f16_graph = Graph::default();
    f16_graph.push(Tensor::dense_f32([4, 2, 1, 1], std::ptr::null_mut()));
    f16_graph.push(Tensor::leaf(TensorType::F16, [4, 2, 1, 1], std::ptr::null_mut()));
    let w_node = f16_graph.nodes[0].clone();
    let x_node = f16_graph.nodes[1].clone();
    let f16_node = Tensor::mul_mat_dst(&w_node, &x_node, [0, 1], std::ptr::null_mut());
    assert!(!backend.supports_op(&f16_graph, &f16_node));

    // transposed (non-contiguous) activations fall back
    let mut strided = Graph::default();
    strided.push(Tensor::dense_f32([4, 2, 1, 1], std::ptr::null_mut()));
    let mut t = Tensor::dense_f32([4, 2, 1, 1], std::ptr::null_mut());
    t.nb.swap(0, 1);
    strided.push(t);
    let w_node = strided.nodes[0].clone();
    let x_node = strided.nodes[1].clone();
    let s_node = Tensor::mul_mat_dst(&w_node, &x_node, [0, 1], std::ptr::null_mut());
    assert!(!backend.supports_op(&strided, &s_node));
}

#[test]
fn min_batch_gates_small_matmuls() {
    let mut graph = Graph::default();
    let iw = graph.push(Tensor::dense_f32([16, 16, 1, 1], std::ptr::null_mut()));
    let ix = graph.push(Tensor::dense_f32([16, 16, 1, 1], std::ptr::null_mut()));
    let w_node = graph.nodes[iw].clone();
    let x_node = graph.nodes[ix].clone();
    let node = Tensor::mul_mat_dst(&w_node, &x_node, [iw, ix], std::ptr::null_mut());

    let relaxed = mock_backend(Box::new(NoDequant));
    assert!(relaxed.supports_op(&graph, &node));

    let strict = mock_backend(Box::new(NoDequant)).with_min_batch(32);
    assert!(!strict.supports_op(&graph, &node));
}

#[test]
fn activation_updates_reach_the_device_between_calls() {
    let mut w = [1.0f32, 1.0];
    let mut x = [1.0f32, 2.0];
    let mut c = [0.0f32];

    let mut graph = Graph::default();
    let iw = graph.push(Tensor::dense_f32([2, 1, 1, 1], w.as_mut_ptr().cast()));
    let ix = graph.push(Tensor::dense_f32([2, 1, 1, 1], x.as_mut_ptr().cast()));
    let w_node = graph.nodes[iw].clone();
    let x_node = graph.nodes[ix].clone();
    graph.push(Tensor::mul_mat_dst(
        &w_node,
        &x_node,
        [iw, ix],
        c.as_mut_ptr().cast(),
    ));

    let mut backend = mock_backend(Box::new(NoDequant));
    backend.graph_compute(&graph).unwrap();
    assert!((c[0] - 3.0).abs() < 1e-6);

    x = [10.0, 20.0];
    backend.graph_compute(&graph).unwrap();
    assert!((c[0] - 30.0).abs() < 1e-6);
}
