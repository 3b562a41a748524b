use ndarray::{Array1, Array4, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use restart_diffusion::{add_noise_interval, DDIMScheduler, DiffusionModel, DiffusionScheduler, RestartCompatible, RestartOptions, RestartSampler};

/// Stand-in denoising model that scales the latent by the conditioning value on every step and records what it saw.
struct ScaleModel {
	scheduler: DDIMScheduler,
	fail_after: Option<usize>,
	steps_taken: usize,
	conditioning_seen: Vec<f32>,
	sub_schedule_lens: Vec<usize>
}

impl ScaleModel {
	fn new(scheduler: DDIMScheduler) -> Self {
		Self {
			scheduler,
			fail_after: None,
			steps_taken: 0,
			conditioning_seen: Vec::new(),
			sub_schedule_lens: Vec::new()
		}
	}

	fn failing_after(scheduler: DDIMScheduler, steps: usize) -> Self {
		Self {
			fail_after: Some(steps),
			..Self::new(scheduler)
		}
	}
}

impl DiffusionModel for ScaleModel {
	type Conditioning = f32;
	type Scheduler = DDIMScheduler;

	fn scheduler(&self) -> &DDIMScheduler {
		&self.scheduler
	}

	fn replace_scheduler(&mut self, scheduler: DDIMScheduler) -> DDIMScheduler {
		std::mem::replace(&mut self.scheduler, scheduler)
	}

	fn step<R: Rng + ?Sized>(&mut self, sample: ArrayView4<'_, f32>, _step: usize, conditioning: &f32, _rng: &mut R) -> anyhow::Result<Array4<f32>> {
		if self.fail_after.is_some_and(|limit| self.steps_taken >= limit) {
			anyhow::bail!("compute device unavailable");
		}
		self.steps_taken += 1;
		self.conditioning_seen.push(*conditioning);
		self.sub_schedule_lens.push(self.scheduler.timesteps().len());
		Ok(sample.to_owned() * *conditioning)
	}
}

/// Model that predicts zero noise and steps with the installed DDIM scheduler, exercising the real update math.
struct ZeroNoiseModel {
	scheduler: DDIMScheduler
}

impl DiffusionModel for ZeroNoiseModel {
	type Conditioning = ();
	type Scheduler = DDIMScheduler;

	fn scheduler(&self) -> &DDIMScheduler {
		&self.scheduler
	}

	fn replace_scheduler(&mut self, scheduler: DDIMScheduler) -> DDIMScheduler {
		std::mem::replace(&mut self.scheduler, scheduler)
	}

	fn step<R: Rng + ?Sized>(&mut self, sample: ArrayView4<'_, f32>, step: usize, _conditioning: &(), rng: &mut R) -> anyhow::Result<Array4<f32>> {
		let noise_pred = Array4::<f32>::zeros(sample.raw_dim());
		Ok(self.scheduler.step(noise_pred.view(), step, sample, rng).into_prev_sample())
	}
}

/// The schedule layout from the reference scenario: raw range 0..999, current subsampled sequence `[999, 666, 333, 0]`.
fn coarse_scheduler() -> DDIMScheduler {
	let mut scheduler = DDIMScheduler::default();
	scheduler.override_timesteps(Array1::from_vec(vec![999, 666, 333, 0]));
	scheduler
}

fn latent(rng: &mut StdRng) -> Array4<f32> {
	Array4::<f32>::random_using((1, 4, 8, 8), StandardNormal, rng)
}

#[test]
fn noise_interval_same_timestep_is_identity() {
	let scheduler = DDIMScheduler::default();
	let mut rng = StdRng::seed_from_u64(0);
	let x = latent(&mut rng);
	let noise = latent(&mut rng);

	let out = add_noise_interval(&scheduler, x.view(), noise.view(), 500, 500);
	assert_eq!(out, x);
}

#[test]
fn noise_interval_scales_signal_by_scale_ratio() {
	let scheduler = DDIMScheduler::default();
	let mut rng = StdRng::seed_from_u64(1);
	let x = latent(&mut rng);
	let zeros = Array4::<f32>::zeros(x.raw_dim());

	let out = add_noise_interval(&scheduler, x.view(), zeros.view(), 100, 700);

	let scale = scheduler.cumulative_scale_factors();
	let factor = scale[700] / scale[100];
	assert!(factor > 0.0 && factor < 1.0);
	for (o, i) in out.iter().zip(x.iter()) {
		assert!((o - i * factor).abs() < 1e-6);
	}

	// the round trip is stochastic and does not recover x, but the scale ratios cancel exactly
	let product = (scale[700] / scale[100]) * (scale[100] / scale[700]);
	assert!((product - 1.0).abs() < 1e-6);
}

#[test]
fn restart_schedule_matches_coarse_scenario() {
	let model = ScaleModel::new(coarse_scheduler());
	let sampler = RestartSampler::new(
		model,
		RestartOptions {
			num_steps: 4,
			num_iterations: 1,
			start_time: 0.1,
			end_time: 2.0
		}
	)
	.unwrap();

	let scheduler = sampler.model().scheduler();
	let current: Vec<usize> = sampler.model().scheduler().timesteps().to_vec();
	let expected_start = current
		.iter()
		.map(|&t| (scheduler.sigma(t) - 0.1).abs())
		.enumerate()
		.min_by(|(_, a), (_, b)| a.total_cmp(b))
		.map(|(i, _)| i)
		.unwrap();
	let expected_end = (0..scheduler.len())
		.map(|t| (scheduler.sigma(t) - 2.0).abs())
		.enumerate()
		.min_by(|(_, a), (_, b)| a.total_cmp(b))
		.map(|(t, _)| t)
		.unwrap();

	assert_eq!(sampler.start_step().unwrap(), expected_start);
	// t=0 has the lowest sigma (~0.01) of the subsampled sequence, nearest to 0.1
	assert_eq!(expected_start, 3);
	assert_eq!(sampler.end_timestep().unwrap(), expected_end);
	assert!((scheduler.sigma(expected_end) - 2.0).abs() < 0.05);

	let timesteps = sampler.timesteps().unwrap();
	assert_eq!(timesteps.len(), 4);
	assert!(timesteps.iter().zip(timesteps.iter().skip(1)).all(|(a, b)| a >= b), "restart timesteps must be non-increasing");
	assert!(timesteps.iter().all(|&t| t < scheduler.len()));
	assert_eq!(timesteps[0], expected_end);
	assert_eq!(timesteps[3], current[expected_start]);
}

#[test]
fn single_step_schedule_is_the_start_bound() {
	let sampler = RestartSampler::new(ScaleModel::new(coarse_scheduler()), RestartOptions::default().with_steps(1)).unwrap();
	let start_step = sampler.start_step().unwrap();
	let start_timestep = sampler.model().scheduler().timesteps()[start_step];
	assert_eq!(sampler.timesteps().unwrap().to_vec(), vec![start_timestep]);
}

#[test]
fn scheduler_restored_after_successful_call() {
	let options = RestartOptions::default().with_steps(3).with_iterations(1);
	let mut sampler = RestartSampler::new(ScaleModel::new(coarse_scheduler()), options).unwrap();
	let original: Vec<usize> = sampler.model().scheduler().timesteps().to_vec();

	let mut rng = StdRng::seed_from_u64(2);
	let x = latent(&mut rng);
	sampler.sample(x.view(), &0.5, &mut rng).unwrap();

	assert_eq!(sampler.model().scheduler().timesteps().to_vec(), original);
	// one iteration over a 3-step sub-schedule = 2 denoising sub-steps, each taken with the sub-schedule installed
	assert_eq!(sampler.model().steps_taken, 2);
	assert_eq!(sampler.model().sub_schedule_lens, vec![3, 3]);
	assert_eq!(sampler.model().conditioning_seen, vec![0.5, 0.5]);
}

#[test]
fn scheduler_restored_after_failed_step() {
	let options = RestartOptions::default().with_steps(3).with_iterations(1);
	let mut sampler = RestartSampler::new(ScaleModel::failing_after(coarse_scheduler(), 1), options).unwrap();
	let original: Vec<usize> = sampler.model().scheduler().timesteps().to_vec();

	let mut rng = StdRng::seed_from_u64(3);
	let x = latent(&mut rng);
	let result = sampler.sample(x.view(), &0.5, &mut rng);

	assert!(result.is_err());
	assert_eq!(sampler.model().steps_taken, 1);
	assert_eq!(sampler.model().scheduler().timesteps().to_vec(), original);
}

#[test]
fn zero_iterations_leaves_latent_unchanged() {
	let options = RestartOptions::default().with_iterations(0);
	let mut sampler = RestartSampler::new(ScaleModel::new(coarse_scheduler()), options).unwrap();
	let original: Vec<usize> = sampler.model().scheduler().timesteps().to_vec();

	let mut rng = StdRng::seed_from_u64(4);
	let x = latent(&mut rng);
	let out = sampler.sample(x.view(), &0.5, &mut rng).unwrap();

	assert_eq!(out, x);
	assert_eq!(sampler.model().steps_taken, 0);
	assert_eq!(sampler.model().scheduler().timesteps().to_vec(), original);
}

#[test]
fn repeated_calls_reuse_the_derived_schedule() {
	let mut sampler = RestartSampler::new(ScaleModel::new(coarse_scheduler()), RestartOptions::default().with_steps(4)).unwrap();
	let first: Vec<usize> = sampler.timesteps().unwrap().to_vec();

	let mut rng = StdRng::seed_from_u64(5);
	let x = latent(&mut rng);
	let refined = sampler.sample(x.view(), &0.9, &mut rng).unwrap();
	sampler.sample(refined.view(), &0.9, &mut rng).unwrap();

	assert_eq!(sampler.timesteps().unwrap().to_vec(), first);
}

#[test]
fn conditioning_forwarded_to_every_step() {
	let mut sampler = RestartSampler::new(ScaleModel::new(coarse_scheduler()), RestartOptions::default()).unwrap();
	let mut rng = StdRng::seed_from_u64(6);
	let x = latent(&mut rng);
	sampler.sample(x.view(), &7.5, &mut rng).unwrap();

	// default options: 2 iterations × (10 - 1) sub-steps
	assert_eq!(sampler.model().steps_taken, 18);
	assert!(sampler.model().conditioning_seen.iter().all(|&c| c == 7.5));
}

#[test]
fn drives_a_real_ddim_schedule() {
	let mut scheduler = DDIMScheduler::default();
	scheduler.set_timesteps(4);
	let mut sampler = RestartSampler::new(ZeroNoiseModel { scheduler }, RestartOptions::default().with_steps(5).with_iterations(2)).unwrap();

	let mut rng = StdRng::seed_from_u64(7);
	let x = latent(&mut rng);
	let out = sampler.sample(x.view(), &(), &mut rng).unwrap();

	assert_eq!(out.raw_dim(), x.raw_dim());
	assert!(out.iter().all(|f| f.is_finite()));
	assert_eq!(sampler.model().scheduler().timesteps().len(), 4);
}

#[test]
fn rejects_invalid_configuration() {
	assert!(RestartSampler::new(ScaleModel::new(coarse_scheduler()), RestartOptions::default().with_steps(0)).is_err());
	assert!(RestartSampler::new(ScaleModel::new(coarse_scheduler()), RestartOptions::default().with_time_interval(2.0, 0.1)).is_err());
	assert!(RestartSampler::new(ScaleModel::new(coarse_scheduler()), RestartOptions::default().with_time_interval(0.5, 0.5)).is_err());
	assert!(RestartSampler::new(ScaleModel::new(coarse_scheduler()), RestartOptions::default().with_time_interval(f32::NAN, 2.0)).is_err());
}

#[test]
fn derivation_fails_on_empty_timestep_sequence() {
	let mut scheduler = DDIMScheduler::default();
	scheduler.override_timesteps(Array1::from_vec(Vec::new()));
	let sampler = RestartSampler::new(ScaleModel::new(scheduler), RestartOptions::default()).unwrap();
	assert!(sampler.timesteps().is_err());
}
