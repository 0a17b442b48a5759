//! Driver-callback behaviour of the network adapters on a single worker.

use std::cell::RefCell;
use std::rc::Rc;

use ndarray::Array2;

use pint_net::activation::Activation;
use pint_net::comm::SingleComm;
use pint_net::config::Config;
use pint_net::dataset::DataSet;
use pint_net::network::Network;
use pint_net::pint::{
    block_distribution, AdjointNet, App, Core, PrimalNet, StepStatus, TimeIntegrator,
};

const NEXAMPLES: usize = 5;

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
    c.braid.max_levels = 1;
    c
}

fn test_data(config: &Config) -> DataSet {
    let examples = Array2::from_shape_fn((NEXAMPLES, config.nfeatures), |(i, j)| {
        ((i * config.nfeatures + j) as f64 * 0.7).sin()
    });
    let labels = Array2::from_shape_fn((NEXAMPLES, config.nclasses), |(i, j)| {
        if j == i % config.nclasses {
            1.0
        } else {
            0.0
        }
    });
    DataSet::from_arrays(examples, labels)
}

fn build(config: &Config) -> (Rc<App>, Rc<RefCell<Core<PrimalNet>>>) {
    let (lo, hi) = block_distribution(config.nlayers, 1, 0);
    let mut net = Network::new(lo, hi, config).unwrap();
    net.initialize(1, config).unwrap();
    let app = Rc::new(App {
        rank: 0,
        size: 1,
        network: Rc::new(RefCell::new(net)),
        data: test_data(config),
    });
    let core = Rc::new(RefCell::new(Core::new(
        PrimalNet::new(Rc::clone(&app)),
        Rc::new(SingleComm),
        config.braid.clone(),
        config.nlayers - 1,
        config.dt(),
        false,
    )));
    (app, core)
}

#[test]
fn clone_and_sum_obey_the_vector_laws() {
    let config = test_config();
    let (_app, core) = build(&config);
    core.borrow_mut().drive().unwrap();

    let core_ref = core.borrow();
    assert_eq!(core_ref.npoints(), config.nlayers);
    let integ = core_ref.integrator();
    let u = core_ref.vector(2).unwrap();

    // clone then sum(1, clone, 0, original) leaves the original bit-identical
    let v = integ.clone_vector(u);
    let mut original = integ.clone_vector(u);
    integ.sum(1.0, &v, 0.0, &mut original);
    assert_eq!(original.state, u.state);

    // sum(0, x, 1, y) = y
    let mut y = integ.clone_vector(u);
    let before = y.state.clone();
    let x = integ.clone_vector(&v);
    integ.sum(0.0, &x, 1.0, &mut y);
    assert_eq!(y.state, before);
}

#[test]
fn pack_unpack_reproduces_state_and_layer() {
    let config = test_config();
    let (app, core) = build(&config);
    core.borrow_mut().drive().unwrap();

    let integ = PrimalNet::new(Rc::clone(&app));
    let core_ref = core.borrow();
    let u = core_ref.vector(3).unwrap();

    let mut buf = Vec::new();
    integ.buf_pack(u, &mut buf).unwrap();
    let restored = integ.buf_unpack(&buf).unwrap();

    assert_eq!(restored.state, u.state);
    assert!(restored.layer.is_migrated());

    let net = app.network.borrow();
    let layer = net.get_layer(u.layer.index()).unwrap();
    match &restored.layer {
        pint_net::state::LayerRef::Migrated(m) => {
            assert_eq!(m.header(), layer.header());
            assert_eq!(m.owned_params().weights, net.params_of(layer).weights);
            assert_eq!(m.owned_params().bias, net.params_of(layer).bias);
        }
        other => panic!("expected a migrated layer, got {other:?}"),
    }
}

#[test]
fn step_reproduces_the_stored_trajectory() {
    let config = test_config();
    let (app, core) = build(&config);
    core.borrow_mut().drive().unwrap();

    let mut integ = PrimalNet::new(Rc::clone(&app));
    let dt = config.dt();

    let (mut u, expected) = {
        let core_ref = core.borrow();
        (
            integ.clone_vector(core_ref.vector(1).unwrap()),
            core_ref.vector(2).unwrap().state.clone(),
        )
    };
    let status = StepStatus { t_start: dt, t_stop: 2.0 * dt, level: 0 };
    integ.step(&mut u, &status).unwrap();

    assert_eq!(u.state, expected);
    assert_eq!(u.layer.index(), 2);
}

#[test]
fn stepping_a_migrated_vector_consumes_the_layer() {
    let config = test_config();
    let (app, core) = build(&config);
    core.borrow_mut().drive().unwrap();

    let mut integ = PrimalNet::new(Rc::clone(&app));
    let dt = config.dt();

    let (mut migrated, expected) = {
        let core_ref = core.borrow();
        let u = core_ref.vector(2).unwrap();
        let mut buf = Vec::new();
        integ.buf_pack(u, &mut buf).unwrap();
        (integ.buf_unpack(&buf).unwrap(), core_ref.vector(3).unwrap().state.clone())
    };
    assert!(migrated.layer.is_migrated());

    let status = StepStatus { t_start: 2.0 * dt, t_stop: 3.0 * dt, level: 0 };
    integ.step(&mut migrated, &status).unwrap();

    assert_eq!(migrated.state, expected);
    assert!(!migrated.layer.is_migrated());
    assert_eq!(migrated.layer.index(), 3);
}

#[test]
fn adjoint_step_reads_the_mirrored_primal_index() {
    // 6-layer net: the adjoint step towards time index 4 must fetch the
    // primal state and layer at index (6-1) - 4 = 1 and write only that
    // layer's gradient slice.
    let config = test_config();
    let (app, core) = build(&config);
    core.borrow_mut().drive().unwrap();

    let sentinel = 7.0;
    {
        let mut net = app.network.borrow_mut();
        net.gradient_mut().fill(sentinel);
    }

    let mut adj = AdjointNet::new(Rc::clone(&app), Rc::clone(&core));
    let dt = config.dt();
    let mut ubar = adj.init(3.0 * dt).unwrap();
    let status = StepStatus { t_start: 3.0 * dt, t_stop: 4.0 * dt, level: 0 };
    adj.step(&mut ubar, &status).unwrap();

    let net = app.network.borrow();
    for layer in net.layers() {
        let offset = layer.offset().unwrap();
        let slice = &net.gradient()[offset..offset + layer.ndesign()];
        if layer.index() == 1 {
            assert!(slice.iter().all(|&g| g != sentinel), "layer 1 bars were not rewritten");
        } else {
            assert!(
                slice.iter().all(|&g| g == sentinel),
                "layer {} bars were touched",
                layer.index()
            );
        }
    }
}
