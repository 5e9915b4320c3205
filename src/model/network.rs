//! Reference dense classifier: input → hidden (ReLU) → classes (softmax).
//!
//! Weights are kept in the training layout, `[input][output]`, so extraction
//! for the device has to transpose them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::packer::{DenseLayer, WeightSource};
use super::Matrix;
use crate::error::{AppResult, LinkError};

/// Two-layer classifier trained with per-sample SGD.
#[derive(Debug, Clone)]
pub struct SimpleNet {
    hidden: DenseLayer,
    output: DenseLayer,
}

impl SimpleNet {
    /// Glorot-uniform initialisation from a fixed seed.
    pub fn new(input_size: usize, hidden_size: usize, class_count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            hidden: random_layer(&mut rng, input_size, hidden_size),
            output: random_layer(&mut rng, hidden_size, class_count),
        }
    }

    /// Wraps existing layers after checking they chain.
    pub fn from_layers(hidden: DenseLayer, output: DenseLayer) -> AppResult<Self> {
        hidden.check()?;
        output.check()?;
        if output.kernel.rows() != hidden.kernel.cols() {
            return Err(LinkError::Dimension {
                what: "output layer input width".into(),
                expected: hidden.kernel.cols(),
                actual: output.kernel.rows(),
            });
        }
        Ok(Self { hidden, output })
    }

    /// Input features.
    pub fn input_size(&self) -> usize {
        self.hidden.kernel.rows()
    }

    /// Hidden units.
    pub fn hidden_size(&self) -> usize {
        self.hidden.kernel.cols()
    }

    /// Output classes.
    pub fn class_count(&self) -> usize {
        self.output.kernel.cols()
    }

    /// Class probabilities for one input vector.
    pub fn predict(&self, input: &[f32]) -> AppResult<Vec<f32>> {
        self.check_input(input)?;
        let (_, hidden) = forward_training(&self.hidden, input, true);
        let (mut probs, _) = forward_training(&self.output, &hidden, false);
        softmax(&mut probs);
        Ok(probs)
    }

    /// One SGD step on a single labelled sample. Returns the cross-entropy loss.
    pub fn train_step(&mut self, input: &[f32], target: usize, learning_rate: f32) -> AppResult<f32> {
        self.check_input(input)?;
        if target >= self.class_count() {
            return Err(LinkError::Dimension {
                what: "target class".into(),
                expected: self.class_count(),
                actual: target,
            });
        }

        let (pre_hidden, hidden) = forward_training(&self.hidden, input, true);
        let (mut probs, _) = forward_training(&self.output, &hidden, false);
        softmax(&mut probs);
        let loss = -probs[target].max(f32::MIN_POSITIVE).ln();

        // dL/dz for softmax + cross-entropy
        let mut d_out = probs;
        d_out[target] -= 1.0;

        let mut d_hidden = vec![0.0f32; hidden.len()];
        for (h, slot) in d_hidden.iter_mut().enumerate() {
            if pre_hidden[h] > 0.0 {
                *slot = d_out
                    .iter()
                    .enumerate()
                    .map(|(o, g)| self.output.kernel.get(h, o) * g)
                    .sum();
            }
        }

        apply_gradient(&mut self.output, &hidden, &d_out, learning_rate);
        apply_gradient(&mut self.hidden, input, &d_hidden, learning_rate);
        Ok(loss)
    }

    fn check_input(&self, input: &[f32]) -> AppResult<()> {
        if input.len() != self.input_size() {
            return Err(LinkError::Dimension {
                what: "input vector".into(),
                expected: self.input_size(),
                actual: input.len(),
            });
        }
        Ok(())
    }
}

impl WeightSource for SimpleNet {
    fn dense_layers(&self) -> Vec<DenseLayer> {
        vec![self.hidden.clone(), self.output.clone()]
    }
}

fn random_layer(rng: &mut StdRng, inputs: usize, outputs: usize) -> DenseLayer {
    let limit = (6.0 / (inputs + outputs).max(1) as f32).sqrt();
    let data = (0..inputs * outputs)
        .map(|_| rng.gen_range(-limit..=limit))
        .collect();
    DenseLayer {
        kernel: Matrix {
            rows: inputs,
            cols: outputs,
            data,
        },
        bias: vec![0.0; outputs],
    }
}

/// Forward pass over a `[in][out]` kernel. Returns pre-activation and activation.
fn forward_training(layer: &DenseLayer, input: &[f32], relu: bool) -> (Vec<f32>, Vec<f32>) {
    let mut pre = layer.bias.clone();
    for (i, x) in input.iter().enumerate() {
        if *x == 0.0 {
            continue;
        }
        for (o, acc) in pre.iter_mut().enumerate() {
            *acc += x * layer.kernel.get(i, o);
        }
    }
    let act = if relu {
        pre.iter().map(|v| v.max(0.0)).collect()
    } else {
        pre.clone()
    };
    (pre, act)
}

fn apply_gradient(layer: &mut DenseLayer, input: &[f32], delta: &[f32], learning_rate: f32) {
    for (i, x) in input.iter().enumerate() {
        for (o, d) in delta.iter().enumerate() {
            let w = layer.kernel.get(i, o);
            layer.kernel.set(i, o, w - learning_rate * x * d);
        }
    }
    for (b, d) in layer.bias.iter_mut().zip(delta) {
        *b -= learning_rate * d;
    }
}

/// In-place softmax with max subtraction.
pub(crate) fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

/// Index of the first maximum.
pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}
