use cdf_sampler::{Sampler, SamplerConfig, SamplerError, Strategy};

fn main() -> Result<(), SamplerError> {
    let mut rng = rand::thread_rng();

    let config = SamplerConfig::new()
        .bounds(0.0, 1.0)
        .strategy(Strategy::Chebyshev);
    let density = |x: f64| -x * x + x;
    let sampler = Sampler::new(&density, &config)?;

    for w in sampler.warnings() {
        eprintln!("warning: {w}");
    }

    for s in sampler.sample_n(100, &mut rng)?.iter() {
        println!("{s}")
    }
    Ok(())
}
