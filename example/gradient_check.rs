use rand::rngs::StdRng;
use rand::SeedableRng;
use rkl_conv::gradient_check;
use rkl_conv::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut rng = StdRng::seed_from_u64(42);

    let mut model = Sequential::<FloatX>::builder(&[1, 8, 8])
        .add_conv(4, 3, 3, Activation::Sigmoid)?
        .add_pool(2)?
        .loss(Loss::MSE)
        .build()?;

    println!("{}", model.summary());

    let ws = Array1::random_using(model.count_parameters(), Uniform::new(-1.0, 1.0), &mut rng);
    model.set_weights(ws.view())?;

    let x = ArrayD::random_using(IxDyn(&[2, 1, 8, 8]), Uniform::new(-1.0, 1.0), &mut rng);
    let y = ArrayD::random_using(IxDyn(&[2, 4, 3, 3]), Uniform::new(0.0, 1.0), &mut rng);

    let config = GradientCheckConfig::default().with_epsilon(1e-4);
    let report = gradient_check(&mut model, &x, &y, &config)?;

    println!("\nrelative error: {:.3e}", report.relative_error);
    println!("{}", report.verdict);

    Ok(())
}
