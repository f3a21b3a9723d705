//! SGD with momentum and decoupled-into-gradient weight decay.

use ndarray::ArrayD;
use slidemil_nn::params::NamedViewMut;
use slidemil_nn::{Gradients, NnError, NnResult};
use std::collections::HashMap;

/// `v = μ·v + g + λ·θ ; θ -= lr·v`, with one velocity buffer per named
/// parameter.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    /// New optimiser with empty velocity.
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Sgd { lr, momentum, weight_decay, velocity: HashMap::new() }
    }

    /// Current learning rate.
    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Replace the learning rate.
    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// Update `params` in place. `grads` must name the same tensors in the
    /// same order with the same shapes; nothing is changed otherwise.
    pub fn step(&mut self, params: Vec<NamedViewMut<'_>>, grads: &Gradients) -> NnResult<()> {
        if params.len() != grads.len() {
            return Err(NnError::layout(
                "<optimizer>",
                format!("{} parameters vs {} gradients", params.len(), grads.len()),
            ));
        }
        for ((pn, pv), (gn, gv)) in params.iter().zip(grads.iter()) {
            if pn != gn || pv.shape() != gv.shape() {
                return Err(NnError::layout(
                    pn.clone(),
                    format!("parameter {pn}{:?} vs gradient {gn}{:?}", pv.shape(), gv.shape()),
                ));
            }
        }

        for ((name, mut param), (_, grad)) in params.into_iter().zip(grads.iter()) {
            let v = self
                .velocity
                .entry(name)
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let (mu, wd, lr) = (self.momentum, self.weight_decay, self.lr);
            ndarray::Zip::from(&mut param)
                .and(&mut *v)
                .and(grad)
                .for_each(|p, v, &g| {
                    *v = mu * *v + g + wd * *p;
                    *p -= lr * *v;
                });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use slidemil_nn::{Linear, Parameterized};

    #[test]
    fn plain_sgd_moves_against_gradient() {
        let mut layer = Linear::from_parts(array![[1.0, 2.0]], array![0.0]).unwrap();
        let grads = vec![
            ("weight".to_string(), array![[0.5, -1.0]].into_dyn()),
            ("bias".to_string(), array![2.0].into_dyn()),
        ];
        let mut opt = Sgd::new(0.1, 0.0, 0.0);
        opt.step(layer.parameters_mut(), &grads).unwrap();
        assert_abs_diff_eq!(layer.weight()[[0, 0]], 0.95, epsilon = 1e-6);
        assert_abs_diff_eq!(layer.weight()[[0, 1]], 2.1, epsilon = 1e-6);
        assert_abs_diff_eq!(layer.bias()[0], -0.2, epsilon = 1e-6);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut layer = Linear::zeros(1, 1);
        let grads = vec![
            ("weight".to_string(), array![[1.0]].into_dyn()),
            ("bias".to_string(), array![0.0].into_dyn()),
        ];
        let mut opt = Sgd::new(1.0, 0.9, 0.0);
        opt.step(layer.parameters_mut(), &grads).unwrap();
        opt.step(layer.parameters_mut(), &grads).unwrap();
        // v1 = 1, v2 = 1.9 -> w = -(1 + 1.9)
        assert_abs_diff_eq!(layer.weight()[[0, 0]], -2.9, epsilon = 1e-6);
    }

    #[test]
    fn weight_decay_shrinks_parameters() {
        let mut layer = Linear::from_parts(array![[2.0]], array![0.0]).unwrap();
        let grads = vec![
            ("weight".to_string(), array![[0.0]].into_dyn()),
            ("bias".to_string(), array![0.0].into_dyn()),
        ];
        let mut opt = Sgd::new(0.5, 0.0, 0.1);
        opt.step(layer.parameters_mut(), &grads).unwrap();
        assert_abs_diff_eq!(layer.weight()[[0, 0]], 1.9, epsilon = 1e-6);
    }

    #[test]
    fn misaligned_gradients_are_rejected_untouched() {
        let mut layer = Linear::from_parts(array![[1.0]], array![1.0]).unwrap();
        let grads = vec![
            ("bias".to_string(), array![1.0].into_dyn()),
            ("weight".to_string(), array![[1.0]].into_dyn()),
        ];
        let mut opt = Sgd::new(1.0, 0.0, 0.0);
        assert!(opt.step(layer.parameters_mut(), &grads).is_err());
        assert_eq!(layer.weight()[[0, 0]], 1.0);
    }
}
