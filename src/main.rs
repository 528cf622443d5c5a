use clap::Parser;
use ndarray::{Array4, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use matrix_capsules::{
    CapsResult, CapsuleError, ComputeContext, LambdaMix, ModelBuilder, NetworkConfig,
};

/// Passe un batch aléatoire seedé dans un réseau de capsules matricielles
#[derive(Debug, Parser)]
#[command(name = "matrix-capsules", version)]
struct Args {
    /// Configuration du réseau en JSON (par défaut la pile de référence 28x28)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    batch: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Threads dédiés (par défaut le pool rayon global)
    #[arg(long)]
    threads: Option<usize>,

    /// Interpole lambda par ce ratio de progression au lieu de la masse de routage
    #[arg(long)]
    progress: Option<f32>,

    /// Affiche la configuration effective en JSON puis quitte
    #[arg(long)]
    dump_config: bool,
}

fn main() -> CapsResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let network_config = match &args.config {
        Some(path) => NetworkConfig::from_json_file(path)?,
        None => NetworkConfig::default(),
    };
    if args.dump_config {
        println!("{}", network_config.to_json_string()?);
        return Ok(());
    }

    let ctx = match args.threads {
        Some(n) => ComputeContext::with_threads(args.seed, n)?,
        None => ComputeContext::cpu(args.seed),
    };
    let mix = args.progress.map_or(LambdaMix::RoutingMass, LambdaMix::Progress);

    let model = ModelBuilder::new().with_network_config(network_config).build(&ctx)?;
    model.diagnostic(&ctx);

    let (c, h, w) = model.config.input_shape;
    let dist = Uniform::new(0.0f32, 1.0).map_err(|e| CapsuleError::invalid_config(e.to_string()))?;
    let mut rng = ctx.rng(u64::MAX);
    let images = Array4::random_using((args.batch, c, h, w), dist, &mut rng);

    info!(batch = args.batch, ?mix, "lancement du forward");
    let activations = model.forward(&ctx, &images.view(), mix);

    for (i, row) in activations.axis_iter(Axis(0)).enumerate() {
        let (class, best) = row
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (k, &a)| if a > acc.1 { (k, a) } else { acc });
        let formatted: Vec<String> = row.iter().map(|a| format!("{a:.4}")).collect();
        println!("sample {i}: class {class} ({best:.4}) [{}]", formatted.join(", "));
    }

    Ok(())
}
