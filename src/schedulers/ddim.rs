use ndarray::{s, Array1, Array4, ArrayView1, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{betas_for_alpha_bar, BetaSchedule, DiffusionScheduler, RestartCompatible, SchedulerStepOutput};
use crate::{SchedulerOptimizedDefaults, SchedulerPredictionType};

/// Additional configuration for the [`DDIMScheduler`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DDIMSchedulerConfig {
	/// Option to clip the predicted sample between -1 and 1 for numerical stability.
	pub clip_sample: bool,
	/// Each diffusion step uses the cumulative scale factor at that step and at the previous one. For the final step,
	/// there is no previous timestep. When this option is true, the previous cumulative scale factor is fixed to `1`,
	/// otherwise it uses the value at raw timestep 0.
	pub set_alpha_to_one: bool,
	/// An offset added to inference timesteps. You can use a combination of `steps_offset: 1` and
	/// `set_alpha_to_one: true` to make the last step use timestep 0 for the previous cumulative scale factor, as done
	/// in Stable Diffusion.
	pub steps_offset: isize,
	/// Weight of the stochastic noise injected at each step; `0` (the default) makes DDIM sampling fully
	/// deterministic given its inputs, `1` recovers DDPM-like behavior.
	pub eta: f32
}

impl Default for DDIMSchedulerConfig {
	fn default() -> Self {
		Self {
			clip_sample: false,
			set_alpha_to_one: false,
			steps_offset: 1,
			eta: 0.0
		}
	}
}

/// [Denoising diffusion implicit models][ddim] is a scheduler that extends the denoising procedure introduced in
/// denoising diffusion probabilistic models (DDPMs) with non-Markovian guidance.
///
/// This is the schedule family the restart sampling strategy is defined for: its cumulative signal-scale factors and
/// noise standard deviations cover the full raw timestep range (see [`RestartCompatible`]), while
/// [`DiffusionScheduler::timesteps`] is the subsampled descending sequence actually visited during denoising.
///
/// [ddim]: https://arxiv.org/abs/2010.02502
#[derive(Clone)]
pub struct DDIMScheduler {
	cumulative_scale_factors: Array1<f32>,
	noise_std: Array1<f32>,
	final_cumulative_scale_factor: f32,
	init_noise_sigma: f32,
	timesteps: Array1<usize>,
	num_train_timesteps: usize,
	num_inference_steps: Option<usize>,
	config: DDIMSchedulerConfig,
	prediction_type: SchedulerPredictionType
}

impl Default for DDIMScheduler {
	fn default() -> Self {
		Self::new(1000, 0.0001, 0.02, &BetaSchedule::Linear, &SchedulerPredictionType::Epsilon, None).unwrap()
	}
}

impl DDIMScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps used to train the model; the length of the raw timestep
	///   range.
	/// - **`beta_start`**: the starting `beta` value of inference.
	/// - **`beta_end`**: the final `beta` value.
	/// - **`beta_schedule`**: the beta schedule, a mapping from a beta range to a sequence of betas for stepping the
	///   model; see [`BetaSchedule`]
	/// - **`prediction_type`**: the output prediction type; see [`SchedulerPredictionType`]
	///
	/// # Errors
	/// Can error if:
	/// - `num_train_timesteps` is 0
	/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `beta_end` is less than or equal to `beta_start`, or not less than 1
	pub fn new(
		num_train_timesteps: usize,
		beta_start: f32,
		beta_end: f32,
		beta_schedule: &BetaSchedule,
		prediction_type: &SchedulerPredictionType,
		config: Option<DDIMSchedulerConfig>
	) -> anyhow::Result<Self> {
		if num_train_timesteps == 0 {
			anyhow::bail!("num_train_timesteps ({num_train_timesteps}) must be >0");
		}
		if !beta_start.is_normal() || !beta_end.is_normal() {
			anyhow::bail!("beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)");
		}
		if beta_start >= beta_end {
			anyhow::bail!("beta_start must be < beta_end");
		}
		// betas < 1 keep every cumulative scale factor strictly positive, which keeps noise-interval scale ratios
		// finite
		if beta_end >= 1.0 {
			anyhow::bail!("beta_end ({beta_end}) must be < 1");
		}

		let config = config.unwrap_or_default();

		let betas = match beta_schedule {
			BetaSchedule::TrainedBetas(betas) => betas.clone(),
			BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
			BetaSchedule::ScaledLinear => {
				let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
				betas.par_map_inplace(|f| *f = f.powi(2));
				betas
			}
			BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(num_train_timesteps, 0.999)
		};

		let alphas = 1.0 - betas;

		let alphas_cumprod = alphas
			.view()
			.into_iter()
			.scan(1.0, |prod, alpha| {
				*prod *= *alpha;
				Some(*prod)
			})
			.collect::<Array1<_>>();

		let cumulative_scale_factors = alphas_cumprod.mapv(f32::sqrt);
		let noise_std = alphas_cumprod.mapv(|f| (1.0 - f).sqrt());

		// At every step in DDIM, we are looking at the previous timestep's cumulative scale factor. For the final
		// step there is no previous timestep; `set_alpha_to_one` decides whether we set it simply to one or use the
		// value at raw timestep 0.
		let final_cumulative_scale_factor = if config.set_alpha_to_one { 1.0 } else { cumulative_scale_factors[0] };

		let timesteps = Array1::linspace(0.0, num_train_timesteps as f32 - 1.0, num_train_timesteps)
			.slice(s![..;-1])
			.map(|f| *f as usize)
			.to_owned();

		// standard deviation of the initial noise distribution
		let init_noise_sigma = 1.0;

		Ok(Self {
			cumulative_scale_factors,
			noise_std,
			final_cumulative_scale_factor,
			init_noise_sigma,
			timesteps,
			num_inference_steps: None,
			num_train_timesteps,
			prediction_type: *prediction_type,
			config
		})
	}

	/// Returns the number of inference steps set via [`DiffusionScheduler::set_timesteps`], if any.
	pub fn num_inference_steps(&self) -> Option<usize> {
		self.num_inference_steps
	}

	fn variance(&self, scale_t: f32, scale_prev: f32) -> f32 {
		let alpha_prod_t = scale_t.powi(2);
		let alpha_prod_t_prev = scale_prev.powi(2);
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

		(beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev)
	}
}

impl DiffusionScheduler for DDIMScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) {
		let num_inference_steps = num_inference_steps.clamp(1, self.num_train_timesteps);
		self.num_inference_steps = Some(num_inference_steps);

		let step_ratio = self.num_train_timesteps / num_inference_steps;

		let timesteps = Array1::range(0.0, num_inference_steps as f32, 1.0)
			.slice(s![..;-1])
			.map(|f| (*f * step_ratio as f32).round() as isize + self.config.steps_offset)
			.mapv(|t| t.clamp(0, self.num_train_timesteps as isize - 1) as usize);

		self.timesteps = timesteps;
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, step: usize, sample: ArrayView4<'_, f32>, rng: &mut R) -> SchedulerStepOutput {
		let timestep = self.timesteps[step];

		// 1. get the schedule point being stepped to (= the next position in the timestep sequence)
		let scale_t = self.cumulative_scale_factors[timestep];
		let std_t = self.noise_std[timestep];
		let scale_prev = if step + 1 < self.timesteps.len() {
			self.cumulative_scale_factors[self.timesteps[step + 1]]
		} else {
			self.final_cumulative_scale_factor
		};

		// 2. compute predicted original sample from predicted noise - also called "predicted x_0" of formula (12)
		let mut model_output = model_output.to_owned();
		let mut pred_original_sample = match self.prediction_type {
			SchedulerPredictionType::Epsilon => (sample.to_owned() - std_t * model_output.clone()) / scale_t,
			SchedulerPredictionType::Sample => model_output.clone(),
			SchedulerPredictionType::VPrediction => {
				let pred = scale_t * sample.to_owned() - std_t * model_output.clone();
				model_output = scale_t * model_output + std_t * sample.to_owned();
				pred
			}
		};

		// 3. clip predicted x_0
		if self.config.clip_sample {
			pred_original_sample = pred_original_sample.map(|f| f.clamp(-1.0, 1.0));
		}

		// 4. compute variance: "sigma_t(η)" -> see formula (16)
		// σ_t = sqrt((1 − α_t−1)/(1 − α_t)) * sqrt(1 − α_t/α_t−1)
		let std_dev_t = self.config.eta * self.variance(scale_t, scale_prev).sqrt();

		// 5. compute direction pointing to x_t of formula (12)
		let alpha_prod_t_prev = scale_prev.powi(2);
		let pred_sample_direction = (1.0 - alpha_prod_t_prev - std_dev_t.powi(2)).sqrt() * model_output;

		// 6. compute x_t without random noise of formula (12)
		let mut prev_sample = scale_prev * pred_original_sample.clone() + pred_sample_direction;

		if self.config.eta > 0.0 {
			let variance_noise = Array4::<f32>::random_using(prev_sample.raw_dim(), StandardNormal, rng);
			prev_sample = prev_sample + std_dev_t * variance_noise;
		}

		SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		}
	}

	fn add_noise(&self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: usize) -> Array4<f32> {
		self.cumulative_scale_factors[timestep] * original_samples.to_owned() + self.noise_std[timestep] * noise.to_owned()
	}

	fn timesteps(&self) -> ArrayView1<'_, usize> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.init_noise_sigma
	}

	fn len(&self) -> usize {
		self.num_train_timesteps
	}
}

impl RestartCompatible for DDIMScheduler {
	fn cumulative_scale_factors(&self) -> ArrayView1<'_, f32> {
		self.cumulative_scale_factors.view()
	}

	fn noise_std(&self) -> ArrayView1<'_, f32> {
		self.noise_std.view()
	}

	fn override_timesteps(&mut self, timesteps: Array1<usize>) {
		self.timesteps = timesteps;
	}
}

impl SchedulerOptimizedDefaults for DDIMScheduler {
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear, &SchedulerPredictionType::Epsilon, None)
	}
}
