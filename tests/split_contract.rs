use std::{cell::RefCell, num::NonZeroUsize, rc::Rc};

use ndarray::{Array1, Array2, Array4};
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use rand::{SeedableRng, rngs::StdRng};
use split_learning::{
    SplitErr,
    arch::Phase,
    estimation::{GradEstimator, Objective, SteinEstimator},
    specs::{ClientSpec, ServerSpec},
    split::{ClientOutput, ClientStage, ServerStage, SplitNetwork},
};

const CLASSES: usize = 3;

fn client_spec() -> ClientSpec {
    ClientSpec {
        in_channels: 2,
        input_hw: (6, 6),
        width: 4,
        aux_pool: (2, 2),
        classes: CLASSES,
    }
}

fn server_spec() -> ServerSpec {
    ServerSpec {
        in_channels: 4,
        input_hw: (6, 6),
        widths: vec![6],
        classes: CLASSES,
    }
}

fn estimator() -> Box<SteinEstimator> {
    let samples = NonZeroUsize::new(2).unwrap();
    Box::new(SteinEstimator::new(1e-2, samples, false, 5).unwrap())
}

/// Scribbles on the gradient and then gives up.
struct Refusing;

impl GradEstimator for Refusing {
    fn estimate(
        &mut self,
        _: &dyn Objective,
        _: &[f32],
        _: f32,
        grad: &mut [f32],
    ) -> split_learning::Result<()> {
        grad.fill(1.);
        Err(SplitErr::Estimator("refused".into()))
    }
}

fn client(seed: u64) -> ClientStage {
    let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(seed)));
    ClientStage::new(&client_spec(), estimator(), rng).unwrap()
}

fn halves(seed: u64) -> (ClientStage, ServerStage) {
    let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(seed)));
    let client = ClientStage::new(&client_spec(), estimator(), rng.clone()).unwrap();
    let server = ServerStage::new(&server_spec(), rng).unwrap();
    (client, server)
}

fn network(seed: u64) -> SplitNetwork {
    let (client, server) = halves(seed);
    SplitNetwork::new(client, server).unwrap()
}

fn batch(n: usize) -> (Array4<f32>, Array1<usize>) {
    let mut rng = StdRng::seed_from_u64(100);
    let x = Array4::random_using((n, 2, 6, 6), StandardNormal, &mut rng);
    let y = Array1::from_shape_fn(n, |i| i % CLASSES);
    (x, y)
}

#[test]
fn composite_matches_the_split_halves_bit_for_bit() {
    let (x, _) = batch(3);
    let mut net = network(7);
    let (mut client, mut server) = halves(7);

    let activation = client.encode(x.view()).unwrap();
    let split = server.forward(activation.view()).unwrap();
    let composite = net.forward(x.view()).unwrap();

    assert_eq!(composite.output, split);
    assert_eq!(net.client().infer(x.view()).unwrap(), activation);
}

#[test]
fn split_backprop_matches_composite_gradients() {
    let (x, _) = batch(3);
    let d_logits = Array2::from_shape_fn((3, CLASSES), |(i, j)| (i as f32 - j as f32) * 0.1);

    let mut net = network(11);
    net.forward(x.view()).unwrap();
    net.backward(d_logits.view()).unwrap();

    let (mut client, mut server) = halves(11);
    let activation = client.encode(x.view()).unwrap();
    server.forward(activation.view()).unwrap();
    let d_activation = server.backward(d_logits.view()).unwrap();
    client.backward(d_activation.view()).unwrap();

    assert_eq!(net.client().params().grad(), client.params().grad());
    assert_eq!(net.server().params().grad(), server.params().grad());
    assert!(client.params().grad().iter().any(|&g| g != 0.));
}

#[test]
fn forward_modes_accept_and_reject() {
    let (x, y) = batch(3);
    let mut client = client(1);

    assert!(matches!(
        client.forward(x.view(), None, false).unwrap(),
        ClientOutput::Encoded(_)
    ));
    assert!(matches!(
        client.forward(x.view(), None, true),
        Err(SplitErr::MissingLabels)
    ));

    let trained = client.forward(x.view(), Some(y.view()), false).unwrap();
    assert!(matches!(trained, ClientOutput::Trained { .. }));
    assert!(trained.loss().is_some());

    let estimated = client.forward(x.view(), Some(y.view()), true).unwrap();
    assert!(matches!(estimated, ClientOutput::Estimated { .. }));
    assert!(estimated.loss().is_none());
    assert_eq!(estimated.activation().dim(), (3, 4, 6, 6));
}

#[test]
fn estimate_leaves_nothing_to_backpropagate() {
    let (x, y) = batch(3);
    let mut client = client(2);

    let (activation, loss) = client.train(x.view(), y.view()).unwrap();
    client.estimate(x.view(), y.view()).unwrap();

    assert!(!client.is_recorded());
    assert!(matches!(
        client.backward(activation.view()),
        Err(SplitErr::NoGraph { .. })
    ));
    assert!(matches!(
        client.backward_loss(&loss),
        Err(SplitErr::NoGraph { .. })
    ));
}

#[test]
fn estimate_overwrites_every_gradient_entry() {
    let (x, y) = batch(3);
    let mut dirty = client(3);
    let mut clean = client(3);

    dirty.params_mut().grad_mut().fill(f32::NAN);
    dirty.estimate(x.view(), y.view()).unwrap();
    clean.estimate(x.view(), y.view()).unwrap();

    assert!(dirty.params().grad().iter().all(|g| g.is_finite()));
    assert_eq!(dirty.params().grad(), clean.params().grad());
    assert!(dirty.last_loss().is_some_and(|l| l.is_finite()));
}

#[test]
fn failed_estimate_changes_nothing() {
    let (x, y) = batch(3);
    let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(15)));
    let mut client = ClientStage::new(&client_spec(), Box::new(Refusing), rng).unwrap();

    client.set_phase(Phase::Eval);
    let before = client.infer(x.view()).unwrap();
    client.set_phase(Phase::Train);
    client.params_mut().grad_mut().fill(-3.);
    let params = client.params().values().to_vec();

    assert!(matches!(
        client.estimate(x.view(), y.view()),
        Err(SplitErr::Estimator(_))
    ));
    assert!(client.last_loss().is_none());
    assert_eq!(client.params().values(), params.as_slice());
    assert!(client.params().grad().iter().all(|&g| g == -3.));

    client.set_phase(Phase::Eval);
    assert_eq!(client.infer(x.view()).unwrap(), before);
}

#[test]
fn successful_estimate_moves_running_statistics() {
    let (x, y) = batch(3);
    let mut client = client(15);

    client.set_phase(Phase::Eval);
    let before = client.infer(x.view()).unwrap();

    client.set_phase(Phase::Train);
    client.estimate(x.view(), y.view()).unwrap();

    client.set_phase(Phase::Eval);
    assert_ne!(client.infer(x.view()).unwrap(), before);
}

#[test]
fn recorded_outputs_backpropagate_once() {
    let (x, y) = batch(2);
    let (mut client, mut server) = halves(16);

    let activation = client.encode(x.view()).unwrap();
    let logits = server.forward(activation.view()).unwrap();
    let d_activation = server.backward(Array2::ones(logits.dim()).view()).unwrap();
    assert!(matches!(
        server.backward(Array2::ones(logits.dim()).view()),
        Err(SplitErr::NoGraph { .. })
    ));

    client.backward(d_activation.view()).unwrap();
    let grad = client.params().grad().to_vec();
    assert!(!client.is_recorded());
    assert!(matches!(
        client.backward(d_activation.view()),
        Err(SplitErr::NoGraph { .. })
    ));
    assert_eq!(client.params().grad(), grad.as_slice());

    // The activation and the auxiliary loss of a training pass are spent separately.
    let (activation, loss) = client.train(x.view(), y.view()).unwrap();
    client.backward_loss(&loss).unwrap();
    assert!(matches!(
        client.backward_loss(&loss),
        Err(SplitErr::NoGraph { .. })
    ));
    client.backward(Array4::ones(activation.dim()).view()).unwrap();
}

#[test]
fn estimate_produces_the_recorded_activation() {
    let (x, y) = batch(3);
    let mut a = client(4);
    let mut b = client(4);

    let estimated = a.estimate(x.view(), y.view()).unwrap();
    let encoded = b.encode(x.view()).unwrap();

    assert_eq!(estimated, encoded);
}

#[test]
fn standard_training_loss_reaches_the_client() {
    let (x, y) = batch(4);
    let mut client = client(5);

    let (_, loss) = client.train(x.view(), y.view()).unwrap();
    assert!(loss.value().is_finite());
    assert!(loss.value() >= 0.);

    client.backward_loss(&loss).unwrap();
    let grad = client.params().grad();
    assert!(grad.iter().all(|g| g.is_finite()));
    assert!(grad.iter().any(|&g| g != 0.));

    let fc = client.params().grad_of("fc.weight").unwrap();
    assert!(fc.iter().any(|&g| g != 0.));
}

#[test]
fn stale_losses_are_rejected() {
    let (x, y) = batch(2);
    let mut client = client(6);

    let (_, old) = client.train(x.view(), y.view()).unwrap();
    let (_, new) = client.train(x.view(), y.view()).unwrap();

    assert!(matches!(
        client.backward_loss(&old),
        Err(SplitErr::StaleLoss { .. })
    ));
    client.backward_loss(&new).unwrap();
}

#[test]
fn encode_pass_has_no_loss_to_backpropagate() {
    let (x, y) = batch(2);
    let mut client = client(6);

    let (_, loss) = client.train(x.view(), y.view()).unwrap();
    client.encode(x.view()).unwrap();

    assert!(matches!(
        client.backward_loss(&loss),
        Err(SplitErr::NoGraph { .. })
    ));
}

#[test]
fn labels_are_validated() {
    let (x, _) = batch(2);
    let mut client = client(8);

    let out_of_range = Array1::from(vec![0, CLASSES]);
    assert!(matches!(
        client.train(x.view(), out_of_range.view()),
        Err(SplitErr::LabelOutOfRange { .. })
    ));

    let short = Array1::from(vec![0]);
    assert!(matches!(
        client.estimate(x.view(), short.view()),
        Err(SplitErr::SizeMismatch { .. })
    ));
}

#[test]
fn backward_needs_a_recorded_pass() {
    let mut client = client(9);
    let mut server = halves(9).1;

    let d = Array4::zeros((1, 4, 6, 6));
    assert!(matches!(
        client.backward(d.view()),
        Err(SplitErr::NoGraph { .. })
    ));

    let d = Array2::zeros((1, CLASSES));
    assert!(matches!(
        server.backward(d.view()),
        Err(SplitErr::NoGraph { .. })
    ));
}

#[test]
fn client_rejects_foreign_inputs() {
    let mut client = client(10);
    let x = Array4::zeros((2, 3, 6, 6));

    assert!(matches!(
        client.encode(x.view()),
        Err(SplitErr::ShapeMismatch { .. })
    ));
}

#[test]
fn mismatched_halves_do_not_compose() {
    let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(0)));
    let client = ClientStage::new(&client_spec(), estimator(), rng.clone()).unwrap();
    let spec = ServerSpec {
        in_channels: 8,
        ..server_spec()
    };
    let server = ServerStage::new(&spec, rng).unwrap();

    assert!(matches!(
        SplitNetwork::new(client, server),
        Err(SplitErr::ShapeMismatch { .. })
    ));
}

#[test]
fn detached_passes_leave_running_statistics_alone() {
    let (x, y) = batch(3);
    let mut client = client(12);
    client.set_phase(Phase::Eval);
    let before = client.infer(x.view()).unwrap();

    client.set_phase(Phase::Train);
    client.detached().loss(x.view(), y.view()).unwrap();
    client.infer(x.view()).unwrap();

    client.set_phase(Phase::Eval);
    assert_eq!(client.infer(x.view()).unwrap(), before);

    client.set_phase(Phase::Train);
    client.encode(x.view()).unwrap();
    client.set_phase(Phase::Eval);
    assert_ne!(client.infer(x.view()).unwrap(), before);
}

#[test]
fn same_seed_same_parameters() {
    let a = client(13);
    let b = client(13);
    let c = client(14);

    assert_eq!(a.params().values(), b.params().values());
    assert_ne!(a.params().values(), c.params().values());
}
