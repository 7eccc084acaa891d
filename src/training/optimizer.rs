//! Optimizer, gradient clipping and learning-rate schedules

use anyhow::{bail, Result};
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::optim::{Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 2e-5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-6,
            weight_decay: 0.01,
        }
    }
}

/// Parameters that are never weight-decayed
fn is_no_decay(name: &str) -> bool {
    name.contains("bias") || name.contains("LayerNorm")
}

/// AdamW with two parameter groups: decayed weights, and biases/LayerNorm
pub struct AdamW {
    decay: Option<candle_nn::optim::AdamW>,
    no_decay: Option<candle_nn::optim::AdamW>,
    vars: Vec<Var>,
    config: AdamWConfig,
    step_count: usize,
}

impl AdamW {
    pub fn new(named_vars: Vec<(String, Var)>, config: AdamWConfig) -> Result<Self> {
        if named_vars.is_empty() {
            bail!("No trainable parameters");
        }

        let vars: Vec<Var> = named_vars.iter().map(|(_, v)| v.clone()).collect();
        let (no_decay, decay): (Vec<_>, Vec<_>) = named_vars
            .into_iter()
            .partition(|(name, _)| is_no_decay(name));

        tracing::debug!(
            "AdamW groups: {} decayed, {} without decay",
            decay.len(),
            no_decay.len()
        );

        let group = |group: Vec<(String, Var)>, weight_decay: f64| -> Result<_> {
            if group.is_empty() {
                return Ok(None);
            }
            let params = ParamsAdamW {
                lr: config.lr,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.eps,
                weight_decay,
            };
            let vars = group.into_iter().map(|(_, v)| v).collect();
            Ok(Some(candle_nn::optim::AdamW::new(vars, params)?))
        };

        Ok(Self {
            decay: group(decay, config.weight_decay)?,
            no_decay: group(no_decay, 0.0)?,
            vars,
            config,
            step_count: 0,
        })
    }

    /// Clip gradients to `max_grad_norm` (if positive), then update parameters
    ///
    /// Returns the gradient norm before clipping.
    pub fn step_with_clipping(&mut self, grads: &mut GradStore, max_grad_norm: f64) -> Result<f64> {
        let norm = if max_grad_norm > 0.0 {
            clip_grad_norm(grads, &self.vars, max_grad_norm)?
        } else {
            grad_norm(grads, &self.vars)?
        };
        self.step(grads)?;
        Ok(norm)
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        if let Some(opt) = self.decay.as_mut() {
            opt.step(grads)?;
        }
        if let Some(opt) = self.no_decay.as_mut() {
            opt.step(grads)?;
        }
        self.step_count += 1;
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
        if let Some(opt) = self.decay.as_mut() {
            opt.set_learning_rate(lr);
        }
        if let Some(opt) = self.no_decay.as_mut() {
            opt.set_learning_rate(lr);
        }
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }
}

/// Global L2 norm of the gradients of `vars`
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total_norm_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            let sq = grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?;
            total_norm_sq += sq.to_scalar::<f64>()?;
        }
    }
    Ok(total_norm_sq.sqrt())
}

/// Rescale gradients in place so their global L2 norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total_norm = grad_norm(grads, vars)?;
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, (grad * clip_coef)?);
            }
        }
    }
    Ok(total_norm)
}

/// Learning-rate schedule shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Base rate throughout
    Constant,
    /// Linear warm-up, then constant
    WarmupConstant,
    /// Linear warm-up, then linear decay to zero at the last step
    #[default]
    WarmupLinear,
    /// Linear warm-up, then half-cosine decay to zero
    WarmupCosine,
}

impl std::str::FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "constant" | "constantlr" => Ok(Self::Constant),
            "warmup_constant" | "warmupconstant" => Ok(Self::WarmupConstant),
            "warmup_linear" | "warmuplinear" => Ok(Self::WarmupLinear),
            "warmup_cosine" | "warmupcosine" => Ok(Self::WarmupCosine),
            _ => Err(anyhow::anyhow!(
                "Invalid scheduler: {}. Valid options: constant, warmup_constant, warmup_linear, warmup_cosine",
                s
            )),
        }
    }
}

/// Number of warm-up steps for a run, truncated toward zero
pub fn warmup_steps_for(total_steps: usize, warmup_ratio: f64) -> usize {
    (total_steps as f64 * warmup_ratio) as usize
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    kind: SchedulerKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LearningRateScheduler {
    pub fn new(kind: SchedulerKind, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Multiplier on the base rate at a given (0-based) optimizer step
    pub fn factor_at(&self, step: usize) -> f64 {
        if self.kind == SchedulerKind::Constant {
            return 1.0;
        }
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let progress = (step - self.warmup_steps) as f64 / decay_steps;
        match self.kind {
            SchedulerKind::WarmupConstant | SchedulerKind::Constant => 1.0,
            SchedulerKind::WarmupLinear => (1.0 - progress).max(0.0),
            SchedulerKind::WarmupCosine => {
                (0.5 * (1.0 + (std::f64::consts::PI * progress).cos())).max(0.0)
            }
        }
    }

    /// Learning rate for the current step
    pub fn get_lr(&self) -> f64 {
        self.base_lr * self.factor_at(self.current_step)
    }

    /// Advance one step and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_warmup_linear() {
        let mut scheduler = LearningRateScheduler::new(SchedulerKind::WarmupLinear, 1e-4, 10, 110);
        assert_eq!(scheduler.get_lr(), 0.0);

        for _ in 0..5 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.5e-4).abs() < 1e-12);

        for _ in 0..5 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 1e-4).abs() < 1e-12);

        // halfway through decay
        for _ in 0..50 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.5e-4).abs() < 1e-12);

        for _ in 0..60 {
            scheduler.step();
        }
        assert_eq!(scheduler.get_lr(), 0.0);
    }

    #[test]
    fn test_zero_warmup_starts_at_base() {
        let scheduler = LearningRateScheduler::new(SchedulerKind::WarmupLinear, 2e-5, 0, 100);
        assert!((scheduler.get_lr() - 2e-5).abs() < 1e-15);
    }

    #[test]
    fn test_constant_and_cosine() {
        let constant = LearningRateScheduler::new(SchedulerKind::Constant, 1e-3, 10, 100);
        assert_eq!(constant.factor_at(0), 1.0);
        assert_eq!(constant.factor_at(99), 1.0);

        let warm_constant = LearningRateScheduler::new(SchedulerKind::WarmupConstant, 1e-3, 10, 100);
        assert_eq!(warm_constant.factor_at(0), 0.0);
        assert_eq!(warm_constant.factor_at(50), 1.0);

        let cosine = LearningRateScheduler::new(SchedulerKind::WarmupCosine, 1e-3, 0, 100);
        assert!((cosine.factor_at(50) - 0.5).abs() < 1e-9);
        assert!(cosine.factor_at(100) < 1e-9);
    }

    #[test]
    fn test_warmup_steps_truncate() {
        // 10% of 1 epoch x 35 batches
        assert_eq!(warmup_steps_for(35, 0.1), 3);
        assert_eq!(warmup_steps_for(9, 0.1), 0);
        // 3 epochs x 100 batches
        assert_eq!(warmup_steps_for(300, 0.1), 30);
    }

    #[test]
    fn test_scheduler_parse() {
        assert_eq!("warmup-linear".parse::<SchedulerKind>().unwrap(), SchedulerKind::WarmupLinear);
        assert_eq!("WarmupCosine".parse::<SchedulerKind>().unwrap(), SchedulerKind::WarmupCosine);
        assert!("step".parse::<SchedulerKind>().is_err());
    }

    #[test]
    fn test_no_decay_groups() {
        assert!(is_no_decay("encoder.layer.0.attention.output.LayerNorm.weight"));
        assert!(is_no_decay("encoder.layer.0.attention.self.query.bias"));
        assert!(!is_no_decay("encoder.layer.0.attention.self.query.weight"));
    }

    #[test]
    fn test_clip_grad_norm() {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[1f32, 1.], &device).unwrap()).unwrap();
        // d/dw sum(3w0 + 4w1) = [3, 4], norm 5
        let coeffs = Tensor::new(&[3f32, 4.], &device).unwrap();
        let loss = (w.as_tensor() * &coeffs).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        let vars = vec![w.clone()];
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
        assert!((grad_norm(&grads, &vars).unwrap() - 1.0).abs() < 1e-4);

        let clipped: Vec<f32> = grads.get(&w).unwrap().to_vec1().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-4);
        assert!((clipped[1] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_adamw_step_moves_weights_and_skips_decay_for_bias() {
        let device = Device::Cpu;
        let weight = Var::zeros((2,), DType::F32, &device).unwrap();
        let bias = Var::ones((2,), DType::F32, &device).unwrap();

        let mut opt = AdamW::new(
            vec![
                ("dense.weight".to_string(), weight.clone()),
                ("dense.bias".to_string(), bias.clone()),
            ],
            AdamWConfig {
                lr: 0.1,
                weight_decay: 0.5,
                ..Default::default()
            },
        )
        .unwrap();

        // gradient only flows into the weight
        let loss = weight.as_tensor().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let norm = opt.step_with_clipping(&mut grads, 1.0).unwrap();
        assert!(norm > 0.0);
        assert_eq!(opt.step_count(), 1);

        let w: Vec<f32> = weight.as_tensor().to_vec1().unwrap();
        assert!(w.iter().all(|v| *v < 0.0));
        let b: Vec<f32> = bias.as_tensor().to_vec1().unwrap();
        assert_eq!(b, vec![1.0, 1.0]);

        opt.set_learning_rate(0.01);
        assert_eq!(opt.learning_rate(), 0.01);
        assert!(AdamW::new(Vec::new(), AdamWConfig::default()).is_err());
    }
}
