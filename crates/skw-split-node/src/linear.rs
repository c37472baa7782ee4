use rand::{rngs::StdRng, Rng, SeedableRng};

use skw_split_payload::Tensor;

use crate::compute::{Compute, Gradients, Loss, LossSignal, Parameters};
use crate::error::SplitError;

const INIT_RANGE: f32 = 0.1;

/// Dense layer over the element-wise square of its input,
/// `y = W·(x∘x) + b`, trained with plain SGD.
#[derive(Debug, Clone)]
pub struct PolynomialLinear {
    inputs: usize,
    outputs: usize,
    learning_rate: f32,
}

impl PolynomialLinear {
    pub fn new(inputs: usize, outputs: usize, learning_rate: f32) -> Self {
        Self { inputs, outputs, learning_rate }
    }

    fn check_params(&self, params: &Parameters) -> Result<(), SplitError> {
        match params.as_slice() {
            [w, b] if w.shape == [self.outputs, self.inputs] && b.shape == [self.outputs]
                && w.is_well_formed() && b.is_well_formed() => Ok(()),
            _ => Err(SplitError::Compute(format!(
                "expected parameters [{}x{}, {}]", self.outputs, self.inputs, self.outputs
            ))),
        }
    }

    fn check_vector(&self, what: &str, t: &Tensor, len: usize) -> Result<(), SplitError> {
        if !t.is_well_formed() || t.len() != len {
            return Err(SplitError::Compute(format!(
                "{} must be {} finite values, got shape {:?}", what, len, t.shape
            )));
        }
        Ok(())
    }
}

impl Compute for PolynomialLinear {
    fn init(&self, seed: u64) -> Parameters {
        let mut rng = StdRng::seed_from_u64(seed);
        let w = (0..self.outputs * self.inputs)
            .map(|_| rng.gen_range(-INIT_RANGE..INIT_RANGE))
            .collect();

        vec![
            Tensor::new(vec![self.outputs, self.inputs], w),
            Tensor::zeros(vec![self.outputs]),
        ]
    }

    fn forward(&self, params: &Parameters, input: &Tensor) -> Result<Tensor, SplitError> {
        self.check_params(params)?;
        self.check_vector("input", input, self.inputs)?;

        let (w, b) = (&params[0].values, &params[1].values);
        let out = (0..self.outputs)
            .map(|i| {
                let row = &w[i * self.inputs..(i + 1) * self.inputs];
                b[i] + row.iter().zip(&input.values).map(|(w, x)| w * x * x).sum::<f32>()
            })
            .collect();

        Ok(Tensor::vector(out))
    }

    fn gradient(
        &self,
        params: &Parameters,
        input: &Tensor,
        output_error: &Tensor,
    ) -> Result<Gradients, SplitError> {
        self.check_params(params)?;
        self.check_vector("input", input, self.inputs)?;
        self.check_vector("output error", output_error, self.outputs)?;

        let w = &params[0].values;
        let x = &input.values;
        let e = &output_error.values;

        let mut dw = vec![0.0; self.outputs * self.inputs];
        let mut dx = vec![0.0; self.inputs];
        for i in 0..self.outputs {
            for j in 0..self.inputs {
                dw[i * self.inputs + j] = e[i] * x[j] * x[j];
                dx[j] += w[i * self.inputs + j] * e[i];
            }
        }
        // d(x^2)/dx
        for j in 0..self.inputs {
            dx[j] *= 2.0 * x[j];
        }

        Ok(Gradients {
            params: vec![
                Tensor::new(vec![self.outputs, self.inputs], dw),
                Tensor::vector(e.clone()),
            ],
            input_error: Tensor::vector(dx),
        })
    }

    fn apply(&self, params: &mut Parameters, grads: &Gradients) -> Result<(), SplitError> {
        self.check_params(params)?;
        if grads.params.len() != params.len()
            || grads.params.iter().zip(params.iter()).any(|(g, p)| g.shape != p.shape || !g.is_well_formed())
        {
            return Err(SplitError::Compute("gradients do not match parameter shapes".to_string()));
        }

        for (p, g) in params.iter_mut().zip(&grads.params) {
            for (v, d) in p.values.iter_mut().zip(&g.values) {
                *v -= self.learning_rate * d;
            }
        }
        Ok(())
    }
}

/// Mean squared error. A single-value target is broadcast over the output.
#[derive(Debug, Clone, Default)]
pub struct MseLoss;

impl Loss for MseLoss {
    fn compute(&self, output: &Tensor, target: &Tensor) -> Result<LossSignal, SplitError> {
        if !output.is_well_formed() || !target.is_well_formed() || output.is_empty() {
            return Err(SplitError::Compute("loss inputs must be non-empty finite tensors".to_string()));
        }
        if target.len() != output.len() && target.len() != 1 {
            return Err(SplitError::Compute(format!(
                "target of {} values cannot be compared with output of {}", target.len(), output.len()
            )));
        }

        let n = output.len() as f32;
        let target_at = |i: usize| if target.len() == 1 { target.values[0] } else { target.values[i] };

        let diff: Vec<f32> = output.values
            .iter()
            .enumerate()
            .map(|(i, o)| o - target_at(i))
            .collect();

        Ok(LossSignal {
            value: diff.iter().map(|d| d * d).sum::<f32>() / n,
            error: Tensor::new(output.shape.clone(), diff.iter().map(|d| 2.0 * d / n).collect()),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn layer() -> PolynomialLinear {
        PolynomialLinear::new(2, 3, 0.01)
    }

    #[test]
    fn init_is_seeded() {
        assert_eq!(layer().init(7), layer().init(7));
        assert_ne!(layer().init(7), layer().init(8));

        let params = layer().init(7);
        assert!(params[0].values.iter().all(|w| w.abs() <= INIT_RANGE));
        assert_eq!(params[1], Tensor::zeros(vec![3]));
    }

    #[test]
    fn forward_squares_input() {
        let params = vec![
            Tensor::new(vec![1, 2], vec![1.0, 2.0]),
            Tensor::vector(vec![0.5]),
        ];
        let out = PolynomialLinear::new(2, 1, 0.01)
            .forward(&params, &Tensor::vector(vec![3.0, -1.0]))
            .unwrap();
        // 1*9 + 2*1 + 0.5
        assert_eq!(out, Tensor::vector(vec![11.5]));
    }

    #[test]
    fn forward_rejects_wrong_shape() {
        let params = layer().init(0);
        let res = layer().forward(&params, &Tensor::vector(vec![1.0, 2.0, 3.0]));
        assert!(matches!(res, Err(SplitError::Compute(_))));
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let layer = layer();
        let params = layer.init(3);
        let input = Tensor::vector(vec![0.5, -0.2]);
        let target = Tensor::vector(vec![1.0]);
        let loss_of = |params: &Parameters, input: &Tensor| {
            MseLoss.compute(&layer.forward(params, input).unwrap(), &target).unwrap().value
        };

        let output = layer.forward(&params, &input).unwrap();
        let signal = MseLoss.compute(&output, &target).unwrap();
        let grads = layer.gradient(&params, &input, &signal.error).unwrap();

        let h = 1e-3;
        for k in 0..params[0].len() {
            let mut up = params.clone();
            up[0].values[k] += h;
            let mut down = params.clone();
            down[0].values[k] -= h;
            let numeric = (loss_of(&up, &input) - loss_of(&down, &input)) / (2.0 * h);
            assert!((numeric - grads.params[0].values[k]).abs() < 1e-3);
        }
        for j in 0..input.len() {
            let mut up = input.clone();
            up.values[j] += h;
            let mut down = input.clone();
            down.values[j] -= h;
            let numeric = (loss_of(&params, &up) - loss_of(&params, &down)) / (2.0 * h);
            assert!((numeric - grads.input_error.values[j]).abs() < 1e-3);
        }
    }

    #[test]
    fn apply_steps_against_gradient() {
        let layer = layer();
        let mut params = layer.init(1);
        let before = params.clone();
        let grads = Gradients {
            params: vec![Tensor::new(vec![3, 2], vec![1.0; 6]), Tensor::vector(vec![1.0; 3])],
            input_error: Tensor::vector(vec![0.0; 2]),
        };
        layer.apply(&mut params, &grads).unwrap();

        for (p, b) in params[0].values.iter().zip(&before[0].values) {
            assert!((b - p - 0.01).abs() < 1e-6);
        }

        let bad = Gradients { params: vec![Tensor::vector(vec![1.0])], ..grads };
        assert!(layer.apply(&mut params, &bad).is_err());
    }

    #[test]
    fn mse_broadcasts_scalar_target() {
        let signal = MseLoss
            .compute(&Tensor::vector(vec![1.0, 3.0]), &Tensor::vector(vec![1.0]))
            .unwrap();
        assert_eq!(signal.value, 2.0);
        assert_eq!(signal.error, Tensor::vector(vec![0.0, 2.0]));

        let res = MseLoss.compute(&Tensor::vector(vec![1.0, 3.0]), &Tensor::vector(vec![1.0, 2.0, 3.0]));
        assert!(matches!(res, Err(SplitError::Compute(_))));
    }
}
