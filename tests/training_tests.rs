//! End-to-end training runs on a single worker.

use std::rc::Rc;

use approx::assert_relative_eq;
use ndarray::Array2;

use pint_net::activation::Activation;
use pint_net::comm::SingleComm;
use pint_net::config::{Config, HessianKind, NetworkType, OpenLayerType};
use pint_net::dataset::DataSet;
use pint_net::optim::Trainer;

fn test_config() -> Config {
    let mut c = Config::default();
    c.nlayers = 6;
    c.nchannels = 4;
    c.nfeatures = 3;
    c.nclasses = 2;
    c.t_final = 2.0;
    c.activation = Activation::Tanh;
    c.weights_open_init = 0.4;
    c.weights_init = 0.3;
    c.weights_class_init = 0.2;
    c.stepsize_init = 0.5;
    c.braid.max_levels = 1;
    c.validationlevel = 0;
    c
}

fn test_data(config: &Config, nexamples: usize) -> DataSet {
    let examples = Array2::from_shape_fn((nexamples, config.nfeatures), |(i, j)| {
        ((i * config.nfeatures + j) as f64 * 0.83).sin()
    });
    let labels = Array2::from_shape_fn((nexamples, config.nclasses), |(i, j)| {
        if j == i % config.nclasses {
            1.0
        } else {
            0.0
        }
    });
    DataSet::from_arrays(examples, labels)
}

fn run_with(config: Config) -> pint_net::Summary {
    let data = test_data(&config, 8);
    let mut trainer = Trainer::new(config, Rc::new(SingleComm), data.clone(), data).unwrap();
    trainer.run().unwrap()
}

#[test]
fn lbfgs_descends_the_objective() {
    let mut short = test_config();
    short.hessian = HessianKind::Lbfgs;
    short.lbfgs_stages = 4;
    short.optim_maxiter = 1;
    let first = run_with(short);

    let mut long = test_config();
    long.hessian = HessianKind::Lbfgs;
    long.lbfgs_stages = 4;
    long.optim_maxiter = 6;
    let later = run_with(long);

    assert!(later.objective.is_finite());
    assert!(
        later.objective < first.objective,
        "objective did not decrease: {} -> {}",
        first.objective,
        later.objective
    );
}

#[test]
fn bfgs_runs_with_validation_sweeps() {
    let mut config = test_config();
    config.hessian = HessianKind::Bfgs;
    config.optim_maxiter = 3;
    config.validationlevel = 1;
    let summary = run_with(config);
    assert!(summary.objective.is_finite());
    assert!(summary.gnorm.is_finite());
    assert!((0.0..=100.0).contains(&summary.val_accuracy));
}

#[test]
fn multilevel_driver_trains_too() {
    let mut config = test_config();
    config.nlayers = 10;
    config.optim_maxiter = 3;
    config.braid.max_levels = 2;
    config.braid.cfactor0 = 3;
    config.braid.cfactor = 3;
    config.braid.min_coarse = 2;
    config.braid.max_iter = 30;
    config.braid.abs_tol = 1e-12;
    config.braid_abstoladj = 1e-12;
    let summary = run_with(config);
    assert!(summary.objective.is_finite());
    assert!(summary.gnorm.is_finite());
}

#[test]
fn driver_objective_matches_serial_propagation() {
    // Propagate the examples layer by layer without the driver and
    // assemble the objective by hand; the parallel-in-time sweep must
    // reproduce it exactly.
    let config = test_config();
    let data = test_data(&config, 8);
    let mut trainer =
        Trainer::new(config.clone(), Rc::new(SingleComm), data.clone(), data.clone()).unwrap();
    let (objective, _) = trainer.primal_sweep().unwrap();

    let network = trainer.network();
    let mut net = network.borrow_mut();
    let nlayers = net.nlayers_global();
    let dt = net.dt();
    let examples = data.examples.as_ref().unwrap();
    let labels = data.labels.as_ref().unwrap();

    let mut final_states = ndarray::Array2::zeros((8, net.nchannels()));
    for iex in 0..8 {
        let mut state = vec![0.0; net.nchannels()];
        let example = examples.row(iex);
        for index in 0..nlayers - 1 {
            net.step_layer(index, dt, example.to_slice(), &mut state).unwrap();
        }
        final_states.row_mut(iex).assign(&ndarray::ArrayView1::from(&state[..]));
    }

    let mut expected = 0.0;
    for layer in net.layers() {
        expected += layer.eval_tikh(net.params_of(layer));
        let index = layer.index();
        if index > 0 && net.is_hidden(index) && net.is_hidden(index - 1) {
            let prev = net.get_layer(index - 1).unwrap();
            expected += net.eval_regul_ddt(prev, layer).unwrap();
        }
    }
    let classifier = net.get_layer(nlayers - 1).unwrap();
    let (loss, _) = classifier.eval_classification(
        net.params_of(classifier),
        final_states.view(),
        labels.view(),
    );
    expected += loss;

    assert_relative_eq!(objective.objective, expected, max_relative = 1e-14);
}

#[test]
fn convolutional_gradient_is_adjoint_consistent() {
    let mut config = test_config();
    // 2x2 images replicated into 8 channels (2 convolutions)
    config.nlayers = 5;
    config.nfeatures = 4;
    config.nchannels = 8;
    config.network_type = NetworkType::Convolutional;
    config.type_openlayer = OpenLayerType::Replicate;
    config.gamma_tik = 1e-3;
    config.gamma_ddt = 0.0;

    let data = test_data(&config, 6);
    let mut t = Trainer::new(config, Rc::new(SingleComm), data.clone(), data).unwrap();
    t.primal_sweep().unwrap();
    t.adjoint_sweep().unwrap();
    t.gather_gradient().unwrap();
    let gradient = t.gradient().to_vec();
    let design = t.design().to_vec();
    let directional: f64 = gradient.iter().sum();

    let eps = 1e-6;
    let plus: Vec<f64> = design.iter().map(|d| d + eps).collect();
    t.set_design(plus).unwrap();
    let (obj_plus, _) = t.primal_sweep().unwrap();
    let minus: Vec<f64> = design.iter().map(|d| d - eps).collect();
    t.set_design(minus).unwrap();
    let (obj_minus, _) = t.primal_sweep().unwrap();

    let fd = (obj_plus.objective - obj_minus.objective) / (2.0 * eps);
    assert_relative_eq!(directional, fd, max_relative = 1e-4, epsilon = 1e-9);
}
