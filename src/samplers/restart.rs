use std::cell::OnceCell;

use ndarray::{s, Array1, Array4, ArrayView1, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{DiffusionModel, DiffusionScheduler, RestartCompatible};

/// Forward-diffuses `sample` from one raw timestep to another.
///
/// With `factor = scale(target) / scale(initial)`, returns `factor * sample + sqrt(1 - factor²) * noise`. When
/// `target_timestep` carries more accumulated noise than `initial_timestep`, `factor < 1` and the result contains
/// more noise than the input — the semantic opposite of a denoising step. `factor == 1` (in particular
/// `initial_timestep == target_timestep`) returns `sample` unchanged.
///
/// `noise` must be shaped like `sample` and freshly drawn for every call; reusing a noise sample across timesteps
/// breaks the statistical model.
pub fn add_noise_interval<S: RestartCompatible>(
	scheduler: &S,
	sample: ArrayView4<'_, f32>,
	noise: ArrayView4<'_, f32>,
	initial_timestep: usize,
	target_timestep: usize
) -> Array4<f32> {
	let scale = scheduler.cumulative_scale_factors();
	let factor = scale[target_timestep] / scale[initial_timestep];
	debug_assert!((0.0..=1.0).contains(&factor), "target timestep must carry at least as much noise as the initial timestep (factor {factor})");

	factor * sample.to_owned() + (1.0 - factor.powi(2)).sqrt() * noise.to_owned()
}

/// Configuration for a [`RestartSampler`].
///
/// `start_time` and `end_time` are noise levels in sigma space (`noise_std / scale`), not raw timestep indices; the
/// defaults match the reference values from the [restart sampling paper][restart].
///
/// [restart]: https://arxiv.org/pdf/2306.14878.pdf
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RestartOptions {
	/// The number of timesteps in the restart sub-schedule.
	pub num_steps: usize,
	/// How many re-noise/re-denoise passes to run over the restart interval.
	pub num_iterations: usize,
	/// The noise level (sigma) at which the restart interval starts, i.e. its low-noise bound.
	pub start_time: f32,
	/// The noise level (sigma) up to which the latent is re-noised each iteration, i.e. the interval's high-noise
	/// bound.
	pub end_time: f32
}

impl Default for RestartOptions {
	fn default() -> Self {
		Self {
			num_steps: 10,
			num_iterations: 2,
			start_time: 0.1,
			end_time: 2.0
		}
	}
}

impl RestartOptions {
	/// Set the number of timesteps in the restart sub-schedule.
	pub fn with_steps(mut self, num_steps: usize) -> Self {
		self.num_steps = num_steps;
		self
	}

	/// Set the number of re-noise/re-denoise passes.
	pub fn with_iterations(mut self, num_iterations: usize) -> Self {
		self.num_iterations = num_iterations;
		self
	}

	/// Set the sigma-space noise interval the restart trajectory spans. `start_time` must be below `end_time`.
	pub fn with_time_interval(mut self, start_time: f32, end_time: f32) -> Self {
		self.start_time = start_time;
		self.end_time = end_time;
		self
	}
}

/// The derived restart sub-schedule; computed once per sampler configuration.
#[derive(Debug, Clone)]
struct RestartSchedule {
	start_step: usize,
	end_timestep: usize,
	timesteps: Array1<usize>
}

/// Keeps a temporarily installed scheduler on a model, reinstating the original on drop.
///
/// Restoration runs on every exit path — normal completion, error propagation, and unwind — so a failed stepping
/// call can never leave the model with the sub-schedule still active.
struct InstalledSchedule<'m, M: DiffusionModel> {
	model: &'m mut M,
	original: Option<M::Scheduler>
}

impl<'m, M: DiffusionModel> InstalledSchedule<'m, M> {
	fn install(model: &'m mut M, scheduler: M::Scheduler) -> Self {
		let original = model.replace_scheduler(scheduler);
		Self { model, original: Some(original) }
	}

	fn model(&self) -> &M {
		self.model
	}

	fn model_mut(&mut self) -> &mut M {
		self.model
	}
}

impl<M: DiffusionModel> Drop for InstalledSchedule<'_, M> {
	fn drop(&mut self) {
		if let Some(original) = self.original.take() {
			self.model.replace_scheduler(original);
			trace!("restored original scheduler");
		}
	}
}

/// Implements the restart sampling strategy from the paper
/// ["Restart Sampling for Improving Generative Processes"][restart].
///
/// Given a partially denoised latent, the sampler derives a fresh descending sub-schedule of `num_steps` timesteps
/// spanning a configured sigma interval, then `num_iterations` times re-noises the latent up to the top of that
/// interval and re-denoises it down through the sub-schedule. The model's own scheduler is swapped out for the
/// duration of a call and restored afterwards, on success and on failure alike; the original scheduler value is
/// never mutated.
///
/// Only works with schedule families implementing [`RestartCompatible`] (the DDIM family in this crate).
///
/// [restart]: https://arxiv.org/pdf/2306.14878.pdf
pub struct RestartSampler<M: DiffusionModel> {
	model: M,
	options: RestartOptions,
	schedule: OnceCell<RestartSchedule>
}

impl<M> RestartSampler<M>
where
	M: DiffusionModel,
	M::Scheduler: RestartCompatible
{
	/// Creates a new restart sampler wrapping `model`.
	///
	/// The restart sub-schedule is derived lazily from the model's *current* scheduler on first use and cached for
	/// the lifetime of the sampler; to change the configuration (or pick up a reconfigured model schedule),
	/// construct a new sampler.
	///
	/// # Errors
	/// Errors if `options.num_steps` is 0, if either time bound is non-finite or negative, or if
	/// `options.start_time >= options.end_time` (the restart interval must span increasing noise).
	pub fn new(model: M, options: RestartOptions) -> anyhow::Result<Self> {
		if options.num_steps == 0 {
			anyhow::bail!("num_steps ({}) must be >0", options.num_steps);
		}
		if !options.start_time.is_finite() || !options.end_time.is_finite() || options.start_time < 0.0 || options.end_time < 0.0 {
			anyhow::bail!("start_time ({}) and end_time ({}) must be finite and non-negative", options.start_time, options.end_time);
		}
		if options.start_time >= options.end_time {
			anyhow::bail!(
				"start_time ({}) must be < end_time ({}); the restart interval spans from low to high noise",
				options.start_time,
				options.end_time
			);
		}

		Ok(Self {
			model,
			options,
			schedule: OnceCell::new()
		})
	}

	/// Returns a reference to the wrapped model.
	pub fn model(&self) -> &M {
		&self.model
	}

	/// Returns a mutable reference to the wrapped model.
	pub fn model_mut(&mut self) -> &mut M {
		&mut self.model
	}

	/// Consumes the sampler, returning the wrapped model.
	pub fn into_model(self) -> M {
		self.model
	}

	/// The index into the model scheduler's subsampled timestep sequence whose sigma is closest to
	/// `options.start_time`.
	pub fn start_step(&self) -> anyhow::Result<usize> {
		Ok(self.schedule()?.start_step)
	}

	/// The raw timestep whose sigma is closest to `options.end_time`.
	pub fn end_timestep(&self) -> anyhow::Result<usize> {
		Ok(self.schedule()?.end_timestep)
	}

	/// The derived restart sub-schedule: `num_steps` raw timesteps linearly spaced between the raw timestep at
	/// [`RestartSampler::start_step`] and [`RestartSampler::end_timestep`] inclusive, in descending (high-noise to
	/// low-noise) order.
	///
	/// Interpolated values are rounded to the nearest integer with [`f32::round`], i.e. ties round away from zero.
	pub fn timesteps(&self) -> anyhow::Result<ArrayView1<'_, usize>> {
		Ok(self.schedule()?.timesteps.view())
	}

	/// Runs the restart trajectory on `sample`, returning the refined latent.
	///
	/// `conditioning` is forwarded verbatim to every model stepping call. Noise is drawn from `rng` freshly for
	/// every iteration. With `num_iterations == 0` the latent is returned unchanged (the schedule swap still
	/// happens).
	///
	/// # Errors
	/// Propagates errors from the model's stepping call, after the model's original scheduler has been restored.
	pub fn sample<R: Rng + ?Sized>(&mut self, sample: ArrayView4<'_, f32>, conditioning: &M::Conditioning, rng: &mut R) -> anyhow::Result<Array4<f32>> {
		let restart_timesteps = self.schedule()?.timesteps.clone();
		let first_timestep = restart_timesteps[0];
		let last_timestep = restart_timesteps[restart_timesteps.len() - 1];

		let mut sub_scheduler = self.model.scheduler().clone();
		sub_scheduler.override_timesteps(restart_timesteps.clone());
		let mut guard = InstalledSchedule::install(&mut self.model, sub_scheduler);
		debug!(num_iterations = self.options.num_iterations, ?first_timestep, ?last_timestep, "installed restart sub-schedule");

		let mut x = sample.to_owned();
		for iteration in 0..self.options.num_iterations {
			let noise = Array4::<f32>::random_using(x.raw_dim(), StandardNormal, rng);
			x = add_noise_interval(guard.model().scheduler(), x.view(), noise.view(), last_timestep, first_timestep);

			for step in 0..restart_timesteps.len() - 1 {
				x = guard.model_mut().step(x.view(), step, conditioning, rng)?;
			}
			trace!(iteration, "completed restart iteration");
		}

		drop(guard);
		Ok(x)
	}

	fn schedule(&self) -> anyhow::Result<&RestartSchedule> {
		if let Some(schedule) = self.schedule.get() {
			return Ok(schedule);
		}
		let schedule = self.derive_schedule()?;
		debug!(
			start_step = schedule.start_step,
			end_timestep = schedule.end_timestep,
			"derived restart schedule: {:?}",
			schedule.timesteps
		);
		Ok(self.schedule.get_or_init(|| schedule))
	}

	fn derive_schedule(&self) -> anyhow::Result<RestartSchedule> {
		let scheduler = self.model.scheduler();
		let current_timesteps = scheduler.timesteps();
		if current_timesteps.is_empty() {
			anyhow::bail!("the model's scheduler has an empty timestep sequence; call set_timesteps first");
		}

		// stable argmins: Iterator::min_by keeps the first of equally minimal elements
		let start_step = current_timesteps
			.iter()
			.map(|&t| (scheduler.sigma(t) - self.options.start_time).abs())
			.enumerate()
			.min_by(|(_, a), (_, b)| a.total_cmp(b))
			.map(|(i, _)| i)
			.unwrap_or_default();
		let end_timestep = (0..scheduler.len())
			.map(|t| (scheduler.sigma(t) - self.options.end_time).abs())
			.enumerate()
			.min_by(|(_, a), (_, b)| a.total_cmp(b))
			.map(|(t, _)| t)
			.unwrap_or_default();

		let start_timestep = current_timesteps[start_step];
		let timesteps = Array1::linspace(start_timestep as f32, end_timestep as f32, self.options.num_steps)
			.slice(s![..;-1])
			.map(|f| f.round() as usize)
			.to_owned();

		Ok(RestartSchedule {
			start_step,
			end_timestep,
			timesteps
		})
	}
}
