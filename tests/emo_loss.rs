//! Integration tests for the composed EMO objective: scenarios and gradient flow.
//!
//! The gradient tests pin down which terms are treated as constants during backward:
//! the ratio weight of both variants, the on-target probability removed from the
//! predicted distribution, and (for the inverse-ratio variant) the cost embedding.

use emo_finetune::nn::loss::{IGNORE_INDEX, emo_causal_lm_loss, emo_per_position, mle_loss};
use emo_finetune::{EmoConfig, EmoVariant};
use numr::autograd::{Var, backward, var_sum};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

fn setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

fn det_data(n: usize, freq: f32) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * freq).sin() * 2.0).collect()
}

fn identity(n: usize, device: &CpuDevice, trainable: bool) -> Var<CpuRuntime> {
    let mut data = vec![0.0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Var::new(Tensor::from_slice(&data, &[n, n], device), trainable)
}

fn softmax(z: &[f64]) -> Vec<f64> {
    let max = z.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = z.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

#[test]
fn test_scenario_single_sequence() -> TestResult {
    let (client, device) = setup();

    let logits = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(3 * 4, 0.9), &[1, 3, 4], &device),
        true,
    );
    let labels = Tensor::<CpuRuntime>::from_slice(&[-100i64, 2, 1], &[1, 3], &device);
    let embedding = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(4 * 3, 0.4), &[4, 3], &device),
        false,
    );

    for variant in [EmoVariant::CappedRatio, EmoVariant::InverseRatio] {
        let config = EmoConfig::default().with_variant(variant);
        let out = emo_causal_lm_loss(&client, &logits, &labels, &embedding, &config)?;

        let mask: Vec<f32> = out.per_position.mask.to_vec();
        assert_eq!(mask, vec![1.0, 1.0], "{variant:?}");
        let loss: Vec<f32> = out.loss.tensor().to_vec();
        assert!(loss[0].is_finite(), "{variant:?}: loss={}", loss[0]);
    }
    Ok(())
}

#[test]
fn test_all_ignored_gives_zero_loss_and_zero_grad() -> TestResult {
    let (client, device) = setup();

    let logits = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(2 * 4 * 5, 0.3), &[2, 4, 5], &device),
        true,
    );
    let labels = Tensor::<CpuRuntime>::from_slice(&[IGNORE_INDEX; 8], &[2, 4], &device);
    let embedding = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(5 * 2, 0.8), &[5, 2], &device),
        true,
    );

    let out = emo_causal_lm_loss(&client, &logits, &labels, &embedding, &EmoConfig::default())?;
    let loss: Vec<f32> = out.loss.tensor().to_vec();
    assert_eq!(loss[0], 0.0);

    let grads = backward(&out.loss, &client)?;
    if let Some(g) = grads.get(logits.id()) {
        assert!(g.to_vec::<f32>().iter().all(|v| *v == 0.0));
    }

    let mle: Vec<f32> = mle_loss(&client, &logits, &labels, IGNORE_INDEX)?
        .tensor()
        .to_vec();
    assert_eq!(mle[0], 0.0);
    Ok(())
}

#[test]
fn test_ignored_and_dropped_rows_get_no_gradient() -> TestResult {
    let (client, device) = setup();
    let v = 5;

    let labels = Tensor::<CpuRuntime>::from_slice(&[3i64, -100, 2, -100], &[1, 4], &device);
    let embedding = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(v * 3, 0.6), &[v, 3], &device),
        false,
    );

    for variant in [EmoVariant::CappedRatio, EmoVariant::InverseRatio] {
        let logits = Var::<CpuRuntime>::new(
            Tensor::from_slice(&det_data(4 * v, 0.45), &[1, 4, v], &device),
            true,
        );
        let config = EmoConfig::default().with_variant(variant);
        let out = emo_causal_lm_loss(&client, &logits, &labels, &embedding, &config)?;
        let grads = backward(&out.loss, &client)?;

        let grad = grads
            .get(logits.id())
            .ok_or_else(|| format!("{variant:?}: no gradient for logits"))?
            .to_vec::<f32>();
        let rows: Vec<&[f32]> = grad.chunks(v).collect();

        // Shifted labels are [-100, 2, -100]; the last position has no target.
        assert!(rows[0].iter().all(|g| *g == 0.0), "{variant:?}: row 0 {:?}", rows[0]);
        assert!(rows[1].iter().any(|g| g.abs() > 1e-6), "{variant:?}: row 1 {:?}", rows[1]);
        assert!(rows[2].iter().all(|g| *g == 0.0), "{variant:?}: row 2 {:?}", rows[2]);
        assert!(rows[3].iter().all(|g| *g == 0.0), "{variant:?}: row 3 {:?}", rows[3]);
    }
    Ok(())
}

/// With an identity cost embedding and a single valid position, the gradients of
/// both variants have a closed form once the detached terms are treated as constants:
///
/// - `d mle / dz = q - onehot`
/// - `d emo / dz = q_l * (q - onehot)` (on-target mass removed as a constant)
/// - capped:  `dz = 0.5 * (w * q_l + 1) * (q - onehot)`, `w = min(mle / emo, 3)`
/// - inverse: `dz = (w + q_l) * (q - onehot)`, `w = emo / mle`
#[test]
fn test_detached_terms_closed_form_gradient() -> TestResult {
    let (client, device) = setup();
    let z = [0.5f64, -1.0, 2.0, 0.3];
    let label = 0usize;

    let q = softmax(&z);
    let mle = -q[label].ln();
    let emo = 1.0;
    let delta: Vec<f64> = (0..4)
        .map(|k| q[k] - if k == label { 1.0 } else { 0.0 })
        .collect();

    for variant in [EmoVariant::CappedRatio, EmoVariant::InverseRatio] {
        let mut logits_data: Vec<f32> = z.iter().map(|v| *v as f32).collect();
        logits_data.extend_from_slice(&[0.0, 0.0, 0.0, 0.0]);
        let logits = Var::<CpuRuntime>::new(
            Tensor::from_slice(&logits_data, &[1, 2, 4], &device),
            true,
        );
        let labels =
            Tensor::<CpuRuntime>::from_slice(&[-100i64, label as i64], &[1, 2], &device);
        let embedding = identity(4, &device, false);

        let config = EmoConfig::default().with_variant(variant);
        let out = emo_causal_lm_loss(&client, &logits, &labels, &embedding, &config)?;

        let scale = match variant {
            EmoVariant::CappedRatio => {
                let w = (mle / emo).min(3.0);
                assert!(w < 3.0, "test point should be below the cap");
                0.5 * (w * q[label] + 1.0)
            }
            EmoVariant::InverseRatio => emo / mle + q[label],
        };

        let grads = backward(&out.loss, &client)?;
        let grad = grads
            .get(logits.id())
            .ok_or("no gradient for logits")?
            .to_vec::<f32>();
        for k in 0..4 {
            let expected = scale * delta[k];
            let diff = (grad[k] as f64 - expected).abs();
            assert!(
                diff < 1e-4,
                "{variant:?}: grad[{k}] analytical={} expected={expected}",
                grad[k]
            );
        }
    }
    Ok(())
}

/// The EMO value excludes the on-target mass, but its gradient is that of
/// `1 - <target_repr, q @ E>`. Check against finite differences of that surrogate.
#[test]
fn test_emo_gradient_matches_uncentered_surrogate() -> TestResult {
    let (client, device) = setup();
    let (n, v, h) = (3, 4, 3);

    let z = det_data(n * v, 0.77);
    let targets = [2i64, 0, 3];
    let emb_raw = det_data(v * h, 0.35);

    // host copy of the row-normalized embedding
    let emb: Vec<f64> = emb_raw
        .chunks(h)
        .flat_map(|row| {
            let norm = row.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
            row.iter().map(move |x| *x as f64 / norm).collect::<Vec<_>>()
        })
        .collect();
    let surrogate = |z: &[f32]| -> f64 {
        let mut total = 0.0;
        for (row, t) in z.chunks(v).zip(targets) {
            let q = softmax(&row.iter().map(|x| *x as f64).collect::<Vec<_>>());
            let target = &emb[t as usize * h..(t as usize + 1) * h];
            let mut dot = 0.0;
            for (j, qj) in q.iter().enumerate() {
                for d in 0..h {
                    dot += qj * emb[j * h + d] * target[d];
                }
            }
            total += 1.0 - dot;
        }
        total
    };

    let logits = Var::<CpuRuntime>::new(Tensor::from_slice(&z, &[n, v], &device), true);
    let target_t = Tensor::<CpuRuntime>::from_slice(&targets, &[n], &device);
    let embedding = Var::<CpuRuntime>::new(Tensor::from_slice(&emb_raw, &[v, h], &device), false);

    let emo = emo_per_position(&client, &logits, &target_t, &embedding)?;
    let loss = var_sum(&emo, &[0], false, &client)?;
    let grads = backward(&loss, &client)?;
    let grad = grads
        .get(logits.id())
        .ok_or("no gradient for logits")?
        .to_vec::<f32>();

    let eps = 1e-3f32;
    for idx in 0..n * v {
        let mut plus = z.clone();
        let mut minus = z.clone();
        plus[idx] += eps;
        minus[idx] -= eps;
        let numerical = (surrogate(&plus) - surrogate(&minus)) / (2.0 * eps as f64);
        let diff = (numerical - grad[idx] as f64).abs();
        assert!(
            diff < 2e-3,
            "grad mismatch at {idx}: analytical={} numerical={numerical}",
            grad[idx]
        );
    }
    Ok(())
}

#[test]
fn test_mle_loss_finite_difference() -> TestResult {
    let (client, device) = setup();
    let shape = [2, 3, 4];
    let data = det_data(24, 0.61);
    let labels = Tensor::<CpuRuntime>::from_slice(&[-100i64, 1, 3, 0, -100, 2], &[2, 3], &device);

    let eval = |x: &[f32]| -> TestResult<f32> {
        let logits = Var::<CpuRuntime>::new(Tensor::from_slice(x, &shape, &device), false);
        Ok(mle_loss(&client, &logits, &labels, IGNORE_INDEX)?.tensor().to_vec::<f32>()[0])
    };

    let logits = Var::<CpuRuntime>::new(Tensor::from_slice(&data, &shape, &device), true);
    let loss = mle_loss(&client, &logits, &labels, IGNORE_INDEX)?;
    let grads = backward(&loss, &client)?;
    let grad = grads
        .get(logits.id())
        .ok_or("no gradient for logits")?
        .to_vec::<f32>();

    let eps = 1e-3f32;
    for idx in [0, 5, 9, 14, 17, 23] {
        let mut plus = data.clone();
        let mut minus = data.clone();
        plus[idx] += eps;
        minus[idx] -= eps;
        let numerical = (eval(&plus)? - eval(&minus)?) / (2.0 * eps);
        let diff = (numerical - grad[idx]).abs();
        assert!(
            diff < 1e-3,
            "grad mismatch at {idx}: analytical={} numerical={numerical}",
            grad[idx]
        );
    }
    Ok(())
}

#[test]
fn test_inverse_ratio_blocks_embedding_gradient() -> TestResult {
    let (client, device) = setup();

    let logits = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(2 * 3 * 5, 0.5), &[2, 3, 5], &device),
        true,
    );
    let labels = Tensor::<CpuRuntime>::from_slice(&[0i64, 4, 1, 2, 3, -100], &[2, 3], &device);
    let embedding = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(5 * 4, 0.27), &[5, 4], &device),
        true,
    );

    let config = EmoConfig::default().with_variant(EmoVariant::InverseRatio);
    let out = emo_causal_lm_loss(&client, &logits, &labels, &embedding, &config)?;
    let grads = backward(&out.loss, &client)?;

    if let Some(g) = grads.get(embedding.id()) {
        let g = g.to_vec::<f32>();
        assert!(g.iter().all(|v| *v == 0.0), "embedding gradient should be zero: {g:?}");
    }
    let logit_grad = grads
        .get(logits.id())
        .ok_or("no gradient for logits")?
        .to_vec::<f32>();
    assert!(logit_grad.iter().any(|v| v.abs() > 1e-6));
    Ok(())
}

#[test]
fn test_capped_ratio_trains_embedding() -> TestResult {
    let (client, device) = setup();

    let logits = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(2 * 3 * 5, 0.5), &[2, 3, 5], &device),
        true,
    );
    let labels = Tensor::<CpuRuntime>::from_slice(&[0i64, 4, 1, 2, 3, -100], &[2, 3], &device);
    let embedding = Var::<CpuRuntime>::new(
        Tensor::from_slice(&det_data(5 * 4, 0.27), &[5, 4], &device),
        true,
    );

    let out = emo_causal_lm_loss(&client, &logits, &labels, &embedding, &EmoConfig::default())?;
    let grads = backward(&out.loss, &client)?;

    let g = grads
        .get(embedding.id())
        .ok_or("no gradient for the trainable cost embedding")?
        .to_vec::<f32>();
    assert!(g.iter().all(|v| v.is_finite()));
    assert!(g.iter().any(|v| v.abs() > 1e-7), "embedding gradient is all zeros");
    Ok(())
}

#[test]
fn test_inputs_are_not_modified() -> TestResult {
    let (client, device) = setup();

    let logits_data = det_data(2 * 3 * 4, 0.2);
    let label_data = [-100i64, 1, 2, 3, -100, 0];
    let emb_data = det_data(4 * 2, 0.9);

    let logits = Var::<CpuRuntime>::new(
        Tensor::from_slice(&logits_data, &[2, 3, 4], &device),
        true,
    );
    let labels = Tensor::<CpuRuntime>::from_slice(&label_data, &[2, 3], &device);
    let embedding = Var::<CpuRuntime>::new(Tensor::from_slice(&emb_data, &[4, 2], &device), true);

    let out = emo_causal_lm_loss(&client, &logits, &labels, &embedding, &EmoConfig::default())?;
    let _ = backward(&out.loss, &client)?;

    assert_eq!(logits.tensor().to_vec::<f32>(), logits_data);
    assert_eq!(labels.to_vec::<i64>(), label_data.to_vec());
    assert_eq!(embedding.tensor().to_vec::<f32>(), emb_data);
    Ok(())
}

#[test]
fn test_shape_mismatch_is_an_error() {
    let (client, device) = setup();

    let config = EmoConfig::default();
    let logits = Var::<CpuRuntime>::new(
        Tensor::from_slice(&[0.0f32; 24], &[2, 3, 4], &device),
        false,
    );
    let labels = Tensor::<CpuRuntime>::from_slice(&[0i64; 6], &[2, 3], &device);
    let wrong_vocab = Var::<CpuRuntime>::new(
        Tensor::from_slice(&[0.5f32; 10], &[5, 2], &device),
        false,
    );
    assert!(emo_causal_lm_loss(&client, &logits, &labels, &wrong_vocab, &config).is_err());

    let embedding = Var::<CpuRuntime>::new(
        Tensor::from_slice(&[0.5f32; 8], &[4, 2], &device),
        false,
    );
    let wrong_labels = Tensor::<CpuRuntime>::from_slice(&[0i64; 4], &[1, 4], &device);
    assert!(emo_causal_lm_loss(&client, &logits, &wrong_labels, &embedding, &config).is_err());
}
