use candle::{test_device, DType, Device, Module, Result, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use candle_pervasive::models::hmm_controls::{
    read_write, Controls, ForwardBackward, GateNetwork, Grid, HmmControls, TransitionMatrix,
};
use candle_pervasive::ControlsConfig;

const TOL: f32 = 1e-4;

fn controller(dev: &Device, controller_dim: usize, layers: usize, detach: bool) -> Result<(VarMap, HmmControls)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let cfg = ControlsConfig {
        controller_dim,
        num_controller_layers: layers,
        detach_controls: detach,
    };
    let controls = HmmControls::new(&cfg, vb)?;
    Ok((varmap, controls))
}

/// `(Tt, B, Ts)` emissions normalised over source positions.
fn random_emissions(tgt_len: usize, b_size: usize, src_len: usize, dev: &Device) -> Result<Tensor> {
    let scores = Tensor::randn(0f32, 1.0, (tgt_len, b_size, src_len), dev)?;
    candle_nn::ops::log_softmax(&scores, D::Minus1)
}

/// `(Tt, B, Ts, 2)` controls from random logits.
fn random_controls(tgt_len: usize, b_size: usize, src_len: usize, dev: &Device) -> Result<Tensor> {
    let logits = Tensor::randn(0f32, 2.0, (tgt_len, b_size, src_len, 1), dev)?;
    read_write(&logits)
}

fn gamma_sums_to_one(dev: &Device) -> Result<()> {
    let (b_size, tgt_len, src_len) = (2, 5, 4);
    let (_varmap, hmm) = controller(dev, 8, 1, false)?;
    let observations = Tensor::randn(0f32, 1.0, (b_size, tgt_len, src_len, 8), dev)?;
    let emissions = random_emissions(tgt_len, b_size, src_len, dev)?;
    let out = hmm.forward(&observations, &emissions)?;
    assert_eq!(out.controls.dims(), [tgt_len - 1, b_size, src_len, 2]);
    assert_eq!(out.gamma.dims(), [tgt_len, b_size, src_len]);
    assert_eq!(out.read.dims(), [tgt_len - 1, b_size, src_len]);
    assert_eq!(out.write.dims(), [tgt_len - 1, b_size, src_len]);
    assert_eq!(out.prior.dims(), [b_size]);
    for row in out.gamma.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()? {
        assert!((row - 1.0).abs() < TOL, "gamma row sums to {row}");
    }
    // write labels are the occupancy of the next step.
    let next = out.gamma.narrow(0, 1, tgt_len - 1)?;
    assert_eq!(next.flatten_all()?.to_vec1::<f32>()?, out.write.flatten_all()?.to_vec1::<f32>()?);
    for p in out.prior.to_vec1::<f32>()? {
        assert!(p.is_finite() && p < 0.0);
    }
    Ok(())
}

fn ksi_sums_to_one(dev: &Device) -> Result<()> {
    let (tgt_len, b_size, src_len) = (6, 3, 5);
    let controls = Controls::from_tensor(&random_controls(tgt_len, b_size, src_len, dev)?)?;
    let transitions = TransitionMatrix::build(&controls);
    let emissions = Grid::from_tensor(&random_emissions(tgt_len, b_size, src_len, dev)?)?;
    let posteriors = ForwardBackward::new(&emissions, &transitions)?.run();
    for t in 0..tgt_len - 1 {
        for b in 0..b_size {
            let mut total = 0f32;
            for k in 0..src_len {
                total += posteriors.ksi.row(&[t, b, k]).iter().sum::<f32>();
                // Nothing flows backwards.
                for j in 0..k {
                    assert_eq!(posteriors.ksi.get([t, b, k, j]), 0.0);
                }
            }
            assert!((total - 1.0).abs() < TOL, "ksi[{t}, {b}] sums to {total}");
            // Marginalising ksi over the destination gives gamma.
            for k in 0..src_len {
                let outgoing: f32 = posteriors.ksi.row(&[t, b, k]).iter().sum();
                assert!((outgoing - posteriors.gamma.get([t, b, k])).abs() < TOL);
            }
        }
    }
    Ok(())
}

fn transition_matrix_structure(dev: &Device) -> Result<()> {
    let (tgt_len, b_size, src_len) = (3, 2, 6);
    let raw = random_controls(tgt_len, b_size, src_len, dev)?;
    let before = raw.flatten_all()?.to_vec1::<f32>()?;
    let controls = Controls::from_tensor(&raw)?;
    let m = TransitionMatrix::build(&controls);
    // The caller's controls keep their unmodified boundary values.
    assert_eq!(Controls::from_tensor(&raw)?, controls);
    assert_eq!(raw.flatten_all()?.to_vec1::<f32>()?, before);
    assert!(controls.log_read(0, 0, src_len - 1).is_finite());

    for t in 0..tgt_len {
        for b in 0..b_size {
            for k in 0..src_len {
                for j in 0..k {
                    assert_eq!(m.get(t, b, k, j), f32::NEG_INFINITY);
                }
                let mut reads = 0f32;
                for l in k..src_len - 1 {
                    reads += controls.log_read(t, b, l);
                }
                assert_eq!(m.get(t, b, k, src_len - 1), reads);
                // Each row is a distribution over destinations.
                let total: f32 = m.row(t, b, k).iter().map(|v| v.exp()).sum();
                assert!((total - 1.0).abs() < TOL);
            }
        }
    }
    let as_tensor = m.to_tensor(dev)?;
    assert_eq!(as_tensor.dims(), [tgt_len, b_size, src_len, src_len]);
    Ok(())
}

fn masked_emissions_stay_finite_or_neg_inf(dev: &Device) -> Result<()> {
    let (tgt_len, b_size, src_len) = (4, 2, 3);
    let controls = Controls::from_tensor(&random_controls(tgt_len, b_size, src_len, dev)?)?;
    let transitions = TransitionMatrix::build(&controls);
    let emissions = Grid::neg_inf([tgt_len, b_size, src_len]);
    let posteriors = ForwardBackward::new(&emissions, &transitions)?.run();
    for &a in posteriors.alpha.as_slice() {
        assert_eq!(a, f32::NEG_INFINITY);
    }
    for t in 0..tgt_len - 1 {
        for b in 0..b_size {
            for &v in posteriors.beta.row(&[t, b]) {
                assert_eq!(v, f32::NEG_INFINITY);
            }
        }
    }
    assert_eq!(posteriors.beta.row(&[tgt_len - 1, 0]), &[0.0; 3]);
    for &p in posteriors.prior.iter() {
        assert_eq!(p, f32::NEG_INFINITY);
    }
    for grid in [&posteriors.gamma, &posteriors.read, &posteriors.write] {
        assert!(grid.as_slice().iter().all(|&v| v == 0.0));
    }
    assert!(posteriors.ksi.as_slice().iter().all(|&v| v == 0.0));

    // Same through the module, with one sentence masked and one valid.
    let (_varmap, hmm) = controller(dev, 4, 0, false)?;
    let observations = Tensor::randn(0f32, 1.0, (b_size, tgt_len, src_len, 4), dev)?;
    let valid = random_emissions(tgt_len, 1, src_len, dev)?;
    let masked = Tensor::full(f32::NEG_INFINITY, (tgt_len, 1, src_len), dev)?;
    let emissions = Tensor::cat(&[&valid, &masked], 1)?;
    let out = hmm.forward(&observations, &emissions)?;
    let prior = out.prior.to_vec1::<f32>()?;
    assert!(prior[0].is_finite());
    assert_eq!(prior[1], f32::NEG_INFINITY);
    let gamma = out.gamma.to_vec3::<f32>()?;
    for t in 0..tgt_len {
        assert!((gamma[t][0].iter().sum::<f32>() - 1.0).abs() < TOL);
        assert!(gamma[t][1].iter().all(|&v| v == 0.0));
    }
    assert!(!out.read.flatten_all()?.to_vec1::<f32>()?.iter().any(|v| v.is_nan()));
    Ok(())
}

fn uniform_three_by_two(dev: &Device) -> Result<()> {
    let (b_size, tgt_len, src_len) = (1, 3, 2);
    let cfg = ControlsConfig::new(4);
    // All-zero weights give a logit of 0 everywhere: rho = 1/2.
    let hmm = HmmControls::new(&cfg, VarBuilder::zeros(DType::F32, dev))?;
    let observations = Tensor::randn(0f32, 1.0, (b_size, tgt_len, src_len, 4), dev)?;
    let emissions = Tensor::full(0.5f32.ln(), (tgt_len, b_size, src_len), dev)?;

    let controls = hmm.predict_read_write(&observations)?;
    for v in controls.flatten_all()?.to_vec1::<f32>()? {
        assert!((v + 2f32.ln()).abs() < 1e-6);
    }

    let out = hmm.forward(&observations, &emissions)?;
    let gamma = out.gamma.to_vec3::<f32>()?;
    for row in gamma.iter() {
        let total: f32 = row[0].iter().sum();
        assert!((total - 1.0).abs() < TOL);
        assert!(row[0].iter().all(|v| v.is_finite()));
    }
    // Start uniform, then drift right: from 0 stay or move with equal odds.
    assert!((gamma[0][0][0] - gamma[0][0][1]).abs() < 1e-6);
    assert!(gamma[2][0][1] > gamma[1][0][1]);
    assert!((out.prior.to_vec1::<f32>()?[0] - 0.125f32.ln()).abs() < 1e-5);

    let transitions = TransitionMatrix::build(&Controls::from_tensor(&controls.permute((1, 0, 2, 3))?)?);
    let emissions = Grid::from_tensor(&emissions)?;
    let posteriors = ForwardBackward::new(&emissions, &transitions)?.run();
    for grid in [&posteriors.alpha, &posteriors.beta] {
        assert!(grid.as_slice().iter().all(|v| v.is_finite()));
    }
    Ok(())
}

fn detach_controls_blocks_feature_gradients(dev: &Device) -> Result<()> {
    let (b_size, tgt_len, src_len) = (1, 3, 3);
    for detach in [false, true] {
        let (varmap, hmm) = controller(dev, 4, 1, detach)?;
        assert_eq!(hmm.gate().detaches_input(), detach);
        let observations = Var::randn(0f32, 1.0, (b_size, tgt_len, src_len, 4), dev)?;
        let controls = hmm.predict_read_write(observations.as_tensor())?;
        let grads = controls.sum_all()?.backward()?;
        assert_eq!(grads.get(observations.as_tensor()).is_some(), !detach);
        // The gate itself always trains.
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }
    Ok(())
}

fn posteriors_are_detached(dev: &Device) -> Result<()> {
    let (b_size, tgt_len, src_len) = (2, 4, 3);
    let (varmap, hmm) = controller(dev, 4, 1, false)?;
    let observations = Tensor::randn(0f32, 1.0, (b_size, tgt_len, src_len, 4), dev)?;
    let emissions = Var::from_tensor(&random_emissions(tgt_len, b_size, src_len, dev)?)?;
    let out = hmm.forward(&observations, emissions.as_tensor())?;
    let loss = out.controls_loss()?;
    let value = loss.to_scalar::<f32>()?;
    assert!(value.is_finite() && value > 0.0);
    let grads = loss.backward()?;
    assert!(grads.get(emissions.as_tensor()).is_none());
    for label in [&out.gamma, &out.read, &out.write, &out.prior] {
        assert!(!label.track_op());
    }
    assert!(out.controls.track_op());
    for var in varmap.all_vars() {
        assert!(grads.get(var.as_tensor()).is_some());
    }
    Ok(())
}

fn mismatched_shapes_fail(dev: &Device) -> Result<()> {
    let (_varmap, hmm) = controller(dev, 4, 0, false)?;
    let observations = Tensor::randn(0f32, 1.0, (2, 3, 4, 4), dev)?;
    let emissions = random_emissions(3, 2, 5, dev)?;
    assert!(hmm.forward(&observations, &emissions).is_err());
    let batch_major = random_emissions(2, 3, 4, dev)?;
    assert!(hmm.forward(&observations, &batch_major).is_err());
    let gate = GateNetwork::new(&ControlsConfig::new(4), VarBuilder::zeros(DType::F32, dev))?;
    assert!(gate.forward(&Tensor::zeros((2, 5), DType::F32, dev)?).is_err());
    Ok(())
}

test_device!(gamma_sums_to_one, gamma_sums_to_one_cpu, gamma_sums_to_one_gpu, gamma_sums_to_one_metal);
test_device!(ksi_sums_to_one, ksi_sums_to_one_cpu, ksi_sums_to_one_gpu, ksi_sums_to_one_metal);
test_device!(
    transition_matrix_structure,
    transition_matrix_structure_cpu,
    transition_matrix_structure_gpu,
    transition_matrix_structure_metal
);
test_device!(
    masked_emissions_stay_finite_or_neg_inf,
    masked_emissions_cpu,
    masked_emissions_gpu,
    masked_emissions_metal
);
test_device!(uniform_three_by_two, uniform_three_by_two_cpu, uniform_three_by_two_gpu, uniform_three_by_two_metal);
test_device!(
    detach_controls_blocks_feature_gradients,
    detach_controls_cpu,
    detach_controls_gpu,
    detach_controls_metal
);
test_device!(
    posteriors_are_detached,
    posteriors_are_detached_cpu,
    posteriors_are_detached_gpu,
    posteriors_are_detached_metal
);
test_device!(mismatched_shapes_fail, mismatched_shapes_fail_cpu, mismatched_shapes_fail_gpu, mismatched_shapes_fail_metal);
