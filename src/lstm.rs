//! Stacked LSTM with a sigmoid head, trained with binary cross-entropy and
//! Adam over unshuffled mini-batches. Every layer applies input dropout
//! during training, one mask per sample shared across timesteps.

use ndarray::{s, Array, Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis, Dimension, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::{validate_params, ModelError, SequenceClassifier, TrainHistory, TrainParams};
use crate::windows::WindowSet;

/// Fuzz factor for the loss clamp and the Adam denominator.
const EPSILON: f64 = 1e-7;
const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;

/// Activation for the candidate gate and the cell output. Gates always use
/// the sigmoid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LstmActivation {
    Relu,
    Tanh,
}

impl LstmActivation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "relu" => Some(Self::Relu),
            "tanh" => Some(Self::Tanh),
            _ => None,
        }
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed through the activation's output `y`.
    fn derivative(self, y: f64) -> f64 {
        match self {
            Self::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Tanh => 1.0 - y * y,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmConfig {
    /// Hidden size of every stacked layer, input side first.
    pub hidden_sizes: Vec<usize>,
    pub activation: LstmActivation,
    /// Fraction of layer inputs zeroed while training, in `[0, 1)`.
    pub dropout: f64,
    pub seed: u64,
}

impl Default for LstmConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![128, 32],
            activation: LstmActivation::Relu,
            dropout: 0.5,
            seed: 123,
        }
    }
}

/// Gate weights stacked as `[input, forget, candidate, output]`.
#[derive(Debug, Clone, PartialEq)]
struct LstmLayer {
    w: Array2<f64>,
    u: Array2<f64>,
    b: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct DenseHead {
    w: Array1<f64>,
    b: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct Params {
    layers: Vec<LstmLayer>,
    head: DenseHead,
}

struct StepCache {
    /// Layer input after the dropout mask.
    x: Array1<f64>,
    h_prev: Array1<f64>,
    c_prev: Array1<f64>,
    i: Array1<f64>,
    f: Array1<f64>,
    g: Array1<f64>,
    o: Array1<f64>,
    act_c: Array1<f64>,
}

struct SampleTrace {
    layer_caches: Vec<Vec<StepCache>>,
    /// Per-layer input masks, empty at inference.
    masks: Vec<Array1<f64>>,
    last_hidden: Array1<f64>,
    prob: f64,
}

impl LstmLayer {
    fn init(input_size: usize, hidden: usize, rng: &mut StdRng) -> Self {
        let limit = (1.0 / hidden as f64).sqrt();
        let w = Array2::from_shape_fn((4 * hidden, input_size), |_| rng.gen_range(-limit..limit));
        let u = Array2::from_shape_fn((4 * hidden, hidden), |_| rng.gen_range(-limit..limit));
        let mut b = Array1::<f64>::zeros(4 * hidden);
        b.slice_mut(s![hidden..2 * hidden]).fill(1.0);
        Self { w, u, b }
    }

    fn zeros_like(&self) -> Self {
        Self {
            w: Array2::zeros(self.w.raw_dim()),
            u: Array2::zeros(self.u.raw_dim()),
            b: Array1::zeros(self.b.raw_dim()),
        }
    }

    fn hidden_size(&self) -> usize {
        self.u.ncols()
    }

    fn forward_sequence(
        &self,
        inputs: ArrayView2<'_, f64>,
        activation: LstmActivation,
        mask: Option<&Array1<f64>>,
    ) -> (Array2<f64>, Vec<StepCache>) {
        let hidden = self.hidden_size();
        let mut outputs = Array2::<f64>::zeros((inputs.nrows(), hidden));
        let mut caches = Vec::with_capacity(inputs.nrows());
        let mut h = Array1::<f64>::zeros(hidden);
        let mut c = Array1::<f64>::zeros(hidden);

        for (t, row) in inputs.outer_iter().enumerate() {
            let x = match mask {
                Some(mask) => &row * mask,
                None => row.to_owned(),
            };
            let z = self.w.dot(&x) + self.u.dot(&h) + &self.b;
            let i = z.slice(s![0..hidden]).mapv(sigmoid);
            let f = z.slice(s![hidden..2 * hidden]).mapv(sigmoid);
            let g = z
                .slice(s![2 * hidden..3 * hidden])
                .mapv(|v| activation.apply(v));
            let o = z.slice(s![3 * hidden..]).mapv(sigmoid);

            let c_next = &f * &c + &i * &g;
            let act_c = c_next.mapv(|v| activation.apply(v));
            let h_next = &o * &act_c;
            outputs.row_mut(t).assign(&h_next);

            caches.push(StepCache {
                x,
                h_prev: h,
                c_prev: c,
                i,
                f,
                g,
                o,
                act_c,
            });
            h = h_next;
            c = c_next;
        }

        (outputs, caches)
    }

    /// Backpropagation through time. `grad_outputs[t]` is dL/dh_t coming from
    /// above; returns dL/dx_t for the layer below, before the dropout mask.
    fn backward_sequence(
        &self,
        caches: &[StepCache],
        grad_outputs: ArrayView2<'_, f64>,
        activation: LstmActivation,
        mask: Option<&Array1<f64>>,
        grads: &mut LstmLayer,
    ) -> Array2<f64> {
        let hidden = self.hidden_size();
        let mut grad_inputs = Array2::<f64>::zeros((caches.len(), self.w.ncols()));
        let mut dh_next = Array1::<f64>::zeros(hidden);
        let mut dc_next = Array1::<f64>::zeros(hidden);

        for (t, cache) in caches.iter().enumerate().rev() {
            let dh = &grad_outputs.row(t) + &dh_next;
            let d_o = &dh * &cache.act_c;
            let dc = &dh * &cache.o * &cache.act_c.mapv(|v| activation.derivative(v)) + &dc_next;

            let di = &dc * &cache.g;
            let dg = &dc * &cache.i;
            let df = &dc * &cache.c_prev;
            dc_next = &dc * &cache.f;

            let mut dz = Array1::<f64>::zeros(4 * hidden);
            dz.slice_mut(s![0..hidden])
                .assign(&(&di * &cache.i.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![hidden..2 * hidden])
                .assign(&(&df * &cache.f.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![2 * hidden..3 * hidden])
                .assign(&(&dg * &cache.g.mapv(|v| activation.derivative(v))));
            dz.slice_mut(s![3 * hidden..])
                .assign(&(&d_o * &cache.o.mapv(|v| v * (1.0 - v))));

            grads.w += &outer(&dz, cache.x.view());
            grads.u += &outer(&dz, cache.h_prev.view());
            grads.b += &dz;

            let dx = self.w.t().dot(&dz);
            match mask {
                Some(mask) => grad_inputs.row_mut(t).assign(&(dx * mask)),
                None => grad_inputs.row_mut(t).assign(&dx),
            }
            dh_next = self.u.t().dot(&dz);
        }

        grad_inputs
    }
}

impl Params {
    fn zeros_like(&self) -> Self {
        Self {
            layers: self.layers.iter().map(LstmLayer::zeros_like).collect(),
            head: DenseHead {
                w: Array1::zeros(self.head.w.raw_dim()),
                b: Array1::zeros(self.head.b.raw_dim()),
            },
        }
    }
}

struct Adam {
    iterations: i32,
    m: Params,
    v: Params,
}

struct AdamRule {
    learning_rate: f64,
    correction1: f64,
    correction2: f64,
}

impl AdamRule {
    fn apply<D: Dimension>(
        &self,
        param: &mut Array<f64, D>,
        grad: &Array<f64, D>,
        m: &mut Array<f64, D>,
        v: &mut Array<f64, D>,
    ) {
        Zip::from(param)
            .and(grad)
            .and(m)
            .and(v)
            .for_each(|p, &g, m, v| {
                *m = BETA1 * *m + (1.0 - BETA1) * g;
                *v = BETA2 * *v + (1.0 - BETA2) * g * g;
                let m_hat = *m / self.correction1;
                let v_hat = *v / self.correction2;
                *p -= self.learning_rate * m_hat / (v_hat.sqrt() + EPSILON);
            });
    }
}

impl Adam {
    fn new(params: &Params) -> Self {
        Self {
            iterations: 0,
            m: params.zeros_like(),
            v: params.zeros_like(),
        }
    }

    fn step(&mut self, params: &mut Params, grads: &Params, learning_rate: f64) {
        self.iterations += 1;
        let rule = AdamRule {
            learning_rate,
            correction1: 1.0 - BETA1.powi(self.iterations),
            correction2: 1.0 - BETA2.powi(self.iterations),
        };

        let layers = params
            .layers
            .iter_mut()
            .zip(&grads.layers)
            .zip(self.m.layers.iter_mut().zip(self.v.layers.iter_mut()));
        for ((p, g), (m, v)) in layers {
            rule.apply(&mut p.w, &g.w, &mut m.w, &mut v.w);
            rule.apply(&mut p.u, &g.u, &mut m.u, &mut v.u);
            rule.apply(&mut p.b, &g.b, &mut m.b, &mut v.b);
        }
        rule.apply(
            &mut params.head.w,
            &grads.head.w,
            &mut self.m.head.w,
            &mut self.v.head.w,
        );
        rule.apply(
            &mut params.head.b,
            &grads.head.b,
            &mut self.m.head.b,
            &mut self.v.head.b,
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LstmClassifier {
    config: LstmConfig,
    n_features: usize,
    params: Params,
    /// Completed `fit` calls; salts the dropout stream so repeated fits draw
    /// fresh masks while staying reproducible.
    fits: u64,
}

impl LstmClassifier {
    pub fn new(config: LstmConfig, n_features: usize) -> Result<Self, ModelError> {
        if n_features == 0 {
            return Err(ModelError::InvalidConfig("n_features must be > 0".to_string()));
        }
        if config.hidden_sizes.is_empty() || config.hidden_sizes.contains(&0) {
            return Err(ModelError::InvalidConfig(
                "hidden_sizes must be non-empty and every size > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout must be within [0, 1), got {}",
                config.dropout
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut layers = Vec::with_capacity(config.hidden_sizes.len());
        let mut input_size = n_features;
        for hidden in &config.hidden_sizes {
            layers.push(LstmLayer::init(input_size, *hidden, &mut rng));
            input_size = *hidden;
        }
        let limit = (6.0 / (input_size as f64 + 1.0)).sqrt();
        let head = DenseHead {
            w: Array1::from_shape_fn(input_size, |_| rng.gen_range(-limit..limit)),
            b: Array1::zeros(1),
        };

        Ok(Self {
            config,
            n_features,
            params: Params { layers, head },
            fits: 0,
        })
    }

    pub fn config(&self) -> &LstmConfig {
        &self.config
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    fn check_windows(&self, windows: ArrayView3<'_, f64>) -> Result<(), ModelError> {
        let actual = windows.len_of(Axis(2));
        if actual != self.n_features {
            return Err(ModelError::FeatureCountMismatch {
                expected: self.n_features,
                actual,
            });
        }
        if windows.len_of(Axis(1)) == 0 {
            return Err(ModelError::EmptyWindow);
        }
        Ok(())
    }

    /// Forward pass. `masks` holds one input mask per layer while training
    /// and is empty at inference.
    fn trace(&self, window: ArrayView2<'_, f64>, masks: Vec<Array1<f64>>) -> SampleTrace {
        let mut layer_caches = Vec::with_capacity(self.params.layers.len());
        let mut current = window.to_owned();
        for (idx, layer) in self.params.layers.iter().enumerate() {
            let (outputs, caches) =
                layer.forward_sequence(current.view(), self.config.activation, masks.get(idx));
            layer_caches.push(caches);
            current = outputs;
        }

        let last_hidden = current.row(current.nrows() - 1).to_owned();
        let logit = self.params.head.w.dot(&last_hidden) + self.params.head.b[0];
        SampleTrace {
            layer_caches,
            masks,
            last_hidden,
            prob: sigmoid(logit),
        }
    }

    /// Inverted-dropout masks: kept inputs are scaled by `1 / (1 - dropout)`.
    fn sample_masks(&self, rng: &mut StdRng) -> Vec<Array1<f64>> {
        let dropout = self.config.dropout;
        if dropout == 0.0 {
            return Vec::new();
        }
        let keep_scale = 1.0 / (1.0 - dropout);
        self.params
            .layers
            .iter()
            .map(|layer| {
                Array1::from_shape_fn(layer.w.ncols(), |_| {
                    if rng.gen::<f64>() < dropout {
                        0.0
                    } else {
                        keep_scale
                    }
                })
            })
            .collect()
    }

    /// Adds `scale * dL/dparams` for one sample into `grads`.
    fn accumulate_gradients(&self, trace: &SampleTrace, label: f64, scale: f64, grads: &mut Params) {
        let d_logit = (trace.prob - label) * scale;
        grads.head.w.scaled_add(d_logit, &trace.last_hidden);
        grads.head.b[0] += d_logit;

        let steps = trace.layer_caches[0].len();
        let mut grad_outputs = Array2::<f64>::zeros((steps, self.params.head.w.len()));
        grad_outputs
            .row_mut(steps - 1)
            .assign(&(&self.params.head.w * d_logit));

        for (idx, layer) in self.params.layers.iter().enumerate().rev() {
            grad_outputs = layer.backward_sequence(
                &trace.layer_caches[idx],
                grad_outputs.view(),
                self.config.activation,
                trace.masks.get(idx),
                &mut grads.layers[idx],
            );
        }
    }

    fn mean_loss(&self, set: &WindowSet) -> f64 {
        let total: f64 = set
            .windows
            .outer_iter()
            .zip(set.labels.iter())
            .map(|(window, label)| {
                binary_cross_entropy(self.trace(window, Vec::new()).prob, f64::from(*label))
            })
            .sum();
        total / set.len() as f64
    }
}

impl SequenceClassifier for LstmClassifier {
    fn fit(
        &mut self,
        train: &WindowSet,
        valid: Option<&WindowSet>,
        params: &TrainParams,
    ) -> Result<TrainHistory, ModelError> {
        validate_params(params)?;
        if train.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        self.check_windows(train.view())?;
        let valid = valid.filter(|set| !set.is_empty());
        if let Some(set) = valid {
            self.check_windows(set.view())?;
        }

        info!(
            component = "lstm",
            event = "model.fit.start",
            samples = train.len(),
            lookback = train.lookback(),
            n_features = self.n_features,
            hidden_sizes = ?self.config.hidden_sizes,
            activation = ?self.config.activation,
            dropout = self.config.dropout,
            batch_size = params.batch_size,
            learning_rate = params.learning_rate,
            epochs = params.epochs
        );

        let mut optimizer = Adam::new(&self.params);
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(self.fits + 1));
        self.fits += 1;
        let mut history = TrainHistory::default();
        let n = train.len();

        for epoch in 0..params.epochs {
            let mut epoch_loss = 0.0;
            for start in (0..n).step_by(params.batch_size) {
                let end = (start + params.batch_size).min(n);
                let scale = 1.0 / (end - start) as f64;
                let mut grads = self.params.zeros_like();
                for idx in start..end {
                    let label = f64::from(train.labels[idx]);
                    let masks = self.sample_masks(&mut rng);
                    let trace = self.trace(train.windows.index_axis(Axis(0), idx), masks);
                    epoch_loss += binary_cross_entropy(trace.prob, label);
                    self.accumulate_gradients(&trace, label, scale, &mut grads);
                }
                optimizer.step(&mut self.params, &grads, params.learning_rate);
            }

            let train_loss = epoch_loss / n as f64;
            if !train_loss.is_finite() {
                return Err(ModelError::NonFiniteLoss { epoch });
            }
            history.train_loss.push(train_loss);

            let valid_loss = valid.map(|set| self.mean_loss(set));
            if let Some(loss) = valid_loss {
                history.valid_loss.push(loss);
            }

            debug!(
                component = "lstm",
                event = "model.epoch.finish",
                epoch,
                train_loss,
                valid_loss = ?valid_loss
            );
        }

        info!(
            component = "lstm",
            event = "model.fit.finish",
            final_train_loss = ?history.final_train_loss(),
            final_valid_loss = ?history.final_valid_loss()
        );

        Ok(history)
    }

    fn predict_proba(&self, windows: ArrayView3<'_, f64>) -> Result<Array1<f64>, ModelError> {
        if windows.len_of(Axis(0)) == 0 {
            return Ok(Array1::zeros(0));
        }
        self.check_windows(windows)?;
        Ok(windows
            .outer_iter()
            .map(|window| self.trace(window, Vec::new()).prob)
            .collect())
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn binary_cross_entropy(prob: f64, label: f64) -> f64 {
    let p = prob.clamp(EPSILON, 1.0 - EPSILON);
    -(label * p.ln() + (1.0 - label) * (1.0 - p).ln())
}

fn outer(a: &Array1<f64>, b: ArrayView1<'_, f64>) -> Array2<f64> {
    a.view().insert_axis(Axis(1)).dot(&b.insert_axis(Axis(0)))
}
