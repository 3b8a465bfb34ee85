//! PNDM scheduler (pseudo linear multistep variant).
//!
//! The sampler keeps a window of up to four previous noise predictions
//! and combines them with Adams-Bashforth coefficients before applying
//! the closed-form transfer between alpha-bar levels. With
//! `skip_prk_steps` the Runge-Kutta warmup is replaced by repeating the
//! second timestep once, which is the configuration the released
//! pipeline uses.

use candle::Tensor;

use crate::config::{BetaSchedule, SchedulerConfig};
use crate::error::{Error, Result};

/// Stateful multistep sampler. Create one per generation; `step` mutates
/// the prediction window.
pub struct PndmScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    timesteps: Vec<usize>,
    step_ratio: usize,
    ets: Vec<Tensor>,
    counter: usize,
    cur_sample: Option<Tensor>,
}

impl PndmScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let n = config.num_train_timesteps;
        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => (0..n)
                .map(|i| {
                    config.beta_start
                        + (config.beta_end - config.beta_start) * i as f64 / (n - 1) as f64
                })
                .collect(),
            BetaSchedule::ScaledLinear => {
                let start = config.beta_start.sqrt();
                let end = config.beta_end.sqrt();
                (0..n)
                    .map(|i| {
                        let b = start + (end - start) * i as f64 / (n - 1) as f64;
                        b * b
                    })
                    .collect()
            }
        };
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for beta in betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };
        Self {
            config,
            alphas_cumprod,
            final_alpha_cumprod,
            timesteps: Vec::new(),
            step_ratio: 0,
            ets: Vec::new(),
            counter: 0,
            cur_sample: None,
        }
    }

    /// Build the inference timestep sequence for `num_inference_steps`
    /// and reset the multistep state.
    ///
    /// With `skip_prk_steps` the second-to-last training-space timestep
    /// is visited twice, so the returned sequence has one more entry
    /// than `num_inference_steps` (for `num_inference_steps >= 2`).
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        if num_inference_steps == 0 {
            return Err(Error::invalid_input("num_inference_steps must be >= 1"));
        }
        if num_inference_steps > self.config.num_train_timesteps {
            return Err(Error::invalid_input(format!(
                "num_inference_steps ({num_inference_steps}) exceeds the training schedule ({})",
                self.config.num_train_timesteps
            )));
        }
        if !self.config.skip_prk_steps {
            return Err(Error::invalid_input(
                "the Runge-Kutta warmup (skip_prk_steps = false) is not supported",
            ));
        }
        self.step_ratio = self.config.num_train_timesteps / num_inference_steps;
        // The highest timestep, also reached when the second step replays
        // the first pair, must stay inside the alpha-bar table.
        let last = (num_inference_steps - 1) * self.step_ratio + self.config.steps_offset;
        if last >= self.config.num_train_timesteps {
            return Err(Error::invalid_input(format!(
                "num_inference_steps ({num_inference_steps}) with steps_offset {} reaches \
                 timestep {last}, past the last training timestep ({})",
                self.config.steps_offset,
                self.config.num_train_timesteps - 1
            )));
        }
        let base: Vec<usize> = (0..num_inference_steps)
            .map(|i| i * self.step_ratio + self.config.steps_offset)
            .collect();

        let mut seq: Vec<usize> = Vec::with_capacity(num_inference_steps + 1);
        seq.extend_from_slice(&base[..num_inference_steps - 1]);
        if num_inference_steps >= 2 {
            seq.push(base[num_inference_steps - 2]);
        }
        seq.push(base[num_inference_steps - 1]);
        seq.reverse();

        self.timesteps = seq;
        self.ets.clear();
        self.counter = 0;
        self.cur_sample = None;
        Ok(())
    }

    /// Timesteps to iterate over, highest noise level first.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Standard deviation of the initial latent noise. PNDM latents are
    /// plain unit Gaussians.
    pub fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// PNDM applies no per-step input scaling.
    pub fn scale_model_input(&self, sample: Tensor) -> Tensor {
        sample
    }

    /// Forward-diffuse `original` to noise level `timestep`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let acp = self.alphas_cumprod[timestep];
        let sample = (original.affine(acp.sqrt(), 0.0)?
            + noise.affine((1.0 - acp).sqrt(), 0.0)?)?;
        Ok(sample)
    }

    /// Advance `sample` one step using the noise prediction `model_output`
    /// at `timestep`.
    pub fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        if self.timesteps.is_empty() {
            return Err(Error::invalid_input(
                "set_timesteps must be called before step",
            ));
        }
        let mut timestep = timestep as isize;
        let mut prev_timestep = timestep - self.step_ratio as isize;

        if self.counter != 1 {
            if self.ets.len() > 3 {
                self.ets.drain(..self.ets.len() - 3);
            }
            self.ets.push(model_output.clone());
        } else {
            // Second call replays the first timestep pair with the
            // averaged prediction.
            prev_timestep = timestep;
            timestep += self.step_ratio as isize;
        }

        let n = self.ets.len();
        let (model_output, sample) = if n == 1 && self.counter == 0 {
            self.cur_sample = Some(sample.clone());
            (model_output.clone(), sample.clone())
        } else if n == 1 && self.counter == 1 {
            let output = ((model_output + &self.ets[0])? / 2.0)?;
            let sample = self.cur_sample.take().ok_or_else(|| {
                Error::invalid_input("scheduler state out of order: missing held sample")
            })?;
            (output, sample)
        } else if n == 2 {
            let output = ((self.ets[1].affine(3.0, 0.0)? - self.ets[0].affine(1.0, 0.0)?)? / 2.0)?;
            (output, sample.clone())
        } else if n == 3 {
            let output = ((self.ets[2].affine(23.0, 0.0)? - self.ets[1].affine(16.0, 0.0)?)?
                + self.ets[0].affine(5.0, 0.0)?)?
            .affine(1.0 / 12.0, 0.0)?;
            (output, sample.clone())
        } else {
            let output = (((self.ets[n - 1].affine(55.0, 0.0)?
                - self.ets[n - 2].affine(59.0, 0.0)?)?
                + self.ets[n - 3].affine(37.0, 0.0)?)?
                - self.ets[n - 4].affine(9.0, 0.0)?)?
            .affine(1.0 / 24.0, 0.0)?;
            (output, sample.clone())
        };

        let prev = self.prev_sample(&sample, timestep, prev_timestep, &model_output)?;
        self.counter += 1;
        Ok(prev)
    }

    /// Closed-form transfer from noise level `timestep` to
    /// `prev_timestep` given the combined noise prediction.
    fn prev_sample(
        &self,
        sample: &Tensor,
        timestep: isize,
        prev_timestep: isize,
        model_output: &Tensor,
    ) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep as usize];
        let alpha_prod_t_prev = if prev_timestep >= 0 {
            self.alphas_cumprod[prev_timestep as usize]
        } else {
            self.final_alpha_cumprod
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

        let prev = (sample.affine(sample_coeff, 0.0)?
            - model_output.affine(
                (alpha_prod_t_prev - alpha_prod_t) / model_output_denom_coeff,
                0.0,
            )?)?;
        Ok(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn scheduler_n(steps: usize) -> PndmScheduler {
        let mut s = PndmScheduler::new(SchedulerConfig {
            steps_offset: 0,
            ..SchedulerConfig::blip_diffusion()
        });
        s.set_timesteps(steps).unwrap();
        s
    }

    #[test]
    fn test_beta_schedule_endpoints() {
        let s = PndmScheduler::new(SchedulerConfig::blip_diffusion());
        // scaled_linear: first beta is beta_start, so acp[0] = 1 - 0.00085.
        assert!((s.alphas_cumprod[0] - (1.0 - 0.00085)).abs() < 1e-12);
        // alpha-bar is strictly decreasing in (0, 1).
        for w in s.alphas_cumprod.windows(2) {
            assert!(w[1] < w[0]);
            assert!(w[1] > 0.0);
        }
        assert!(!s.config.set_alpha_to_one);
        assert_eq!(s.final_alpha_cumprod, s.alphas_cumprod[0]);
    }

    #[test]
    fn test_timestep_sequence_repeats_second_step() {
        let s = scheduler_n(5);
        // 1000 / 5 = stride 200; the second-to-last base timestep (600)
        // appears twice.
        assert_eq!(s.timesteps(), &[800, 600, 600, 400, 200, 0]);
    }

    #[test]
    fn test_timestep_sequence_with_offset() {
        let mut s = PndmScheduler::new(SchedulerConfig::blip_diffusion());
        s.set_timesteps(10).unwrap();
        assert_eq!(s.timesteps().len(), 11);
        assert_eq!(s.timesteps()[0], 901);
        assert_eq!(*s.timesteps().last().unwrap(), 1);
    }

    #[test]
    fn test_schedule_reaching_training_end_rejected() {
        // With the shipped steps_offset of 1, a full 1000-step schedule
        // would put the top timestep at 1000, one past the alpha-bar
        // table. That has to fail up front, not index out of bounds.
        let mut s = PndmScheduler::new(SchedulerConfig::blip_diffusion());
        assert!(matches!(s.set_timesteps(1000), Err(Error::InvalidInput(_))));

        // Without the offset the top timestep is 999 and every step,
        // including the replayed one, stays in bounds.
        let mut s = PndmScheduler::new(SchedulerConfig {
            steps_offset: 0,
            ..SchedulerConfig::blip_diffusion()
        });
        s.set_timesteps(1000).unwrap();
        assert_eq!(s.timesteps()[0], 999);
        let device = Device::Cpu;
        let eps = Tensor::zeros((1, 4, 4, 4), DType::F32, &device).unwrap();
        let mut sample = Tensor::ones((1, 4, 4, 4), DType::F32, &device).unwrap();
        for &t in s.timesteps().to_vec().iter().take(3) {
            sample = s.step(&eps, t, &sample).unwrap();
        }
    }

    #[test]
    fn test_prk_warmup_rejected() {
        let mut s = PndmScheduler::new(SchedulerConfig {
            skip_prk_steps: false,
            ..SchedulerConfig::blip_diffusion()
        });
        assert!(matches!(s.set_timesteps(10), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_zero_steps_rejected() {
        let mut s = PndmScheduler::new(SchedulerConfig::blip_diffusion());
        assert!(matches!(
            s.set_timesteps(0),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_step_before_set_timesteps_rejected() {
        let mut s = PndmScheduler::new(SchedulerConfig::blip_diffusion());
        let t = Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            s.step(&t, 901, &t),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_zero_noise_prediction_rescales_sample() {
        // With eps = 0 each step is a pure multiplication by
        // sqrt(acp_prev / acp_t), so the full trajectory can be checked
        // in closed form.
        let mut s = scheduler_n(5);
        let device = Device::Cpu;
        let eps = Tensor::zeros((1, 4, 8, 8), DType::F32, &device).unwrap();
        let mut sample = Tensor::ones((1, 4, 8, 8), DType::F32, &device).unwrap();

        let timesteps = s.timesteps().to_vec();
        for &t in timesteps.iter() {
            sample = s.step(&eps, t, &sample).unwrap();
        }
        let got = sample.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0] as f64;
        // Endpoints telescope: sqrt(acp[0] / acp[800]).
        let want = (s.alphas_cumprod[0] / s.alphas_cumprod[800]).sqrt();
        assert!((got - want).abs() / want < 1e-4, "got {got}, want {want}");
    }

    #[test]
    fn test_prediction_window_is_bounded() {
        let mut s = scheduler_n(20);
        let device = Device::Cpu;
        let eps = Tensor::ones((1, 4, 4, 4), DType::F32, &device).unwrap();
        let mut sample = Tensor::ones((1, 4, 4, 4), DType::F32, &device).unwrap();
        let timesteps = s.timesteps().to_vec();
        for &t in timesteps.iter() {
            sample = s.step(&eps, t, &sample).unwrap();
            assert!(s.ets.len() <= 4);
        }
        let v = sample.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(v.is_finite());
    }

    #[test]
    fn test_determinism_across_runs() {
        let device = Device::Cpu;
        let run = || {
            let mut s = scheduler_n(8);
            let eps = Tensor::full(0.5f32, (1, 4, 4, 4), &device).unwrap();
            let mut sample = Tensor::ones((1, 4, 4, 4), DType::F32, &device).unwrap();
            let timesteps = s.timesteps().to_vec();
            for &t in timesteps.iter() {
                sample = s.step(&eps, t, &sample).unwrap();
            }
            sample.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_add_noise_interpolates() {
        let device = Device::Cpu;
        let s = scheduler_n(5);
        let original = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        let noise = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let noised = s.add_noise(&original, &noise, 500).unwrap();
        let got = noised.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0] as f64;
        assert!((got - s.alphas_cumprod[500].sqrt()).abs() < 1e-6);
    }
}
