use parallax::prelude::*;
use std::thread;

const BATCH: usize = 8;
const CHANNELS: usize = 3;
const SIZE: usize = 16;
const CROP: usize = 12;
const CLASSES: usize = 10;
const ITERATIONS: u64 = 30;

/// Two parallel towers merged by addition, then a classifier head with
/// dropout.
fn network(placement: Placement) -> Result<Graph> {
    let mut b = GraphBuilder::new(placement);
    let data = b.create("data", &[BATCH, CHANNELS, CROP, CROP])?;
    let label = b.create("label", &[BATCH])?;
    b.mark_input(data)?;
    b.mark_input(label)?;

    let tower_a = b.add_operator::<InnerProduct>("tower_a", InnerProductParams::new(64))?;
    let tower_b = b.add_operator::<InnerProduct>("tower_b", InnerProductParams::new(64))?;
    let merge = b.add_operator::<Add>("merge", ())?;
    let relu = b.add_operator::<Relu>("relu", ())?;
    let drop = b.add_operator::<Dropout>("drop", DropoutParams { ratio: 0.4, seed: 7 })?;
    let classifier = b.add_operator::<InnerProduct>("classifier", InnerProductParams::new(CLASSES))?;
    let loss = b.add_operator::<SoftmaxLoss>("loss", SoftmaxLossParams::default())?;

    let a = b.connect(&[data], tower_a)?;
    let c = b.connect(&[data], tower_b)?;
    let merged = b.connect(&[a[0], c[0]], merge)?;
    let logits = b.chain(&merged, &[relu, drop, classifier])?;
    let out = b.connect(&[logits[0], label], loss)?;
    b.mark_loss(out[0])?;
    b.build()
}

fn train(ctx: CommContext, placements: Vec<Placement>) -> Result<()> {
    let rank = ctx.rank();
    let fetch_config = FetchConfig {
        source: format!("synthetic:4096:{}:{}x{}x{}", CLASSES, CHANNELS, SIZE, SIZE),
        mean: vec![127.5],
        shuffle: true,
        mirror: true,
        random_crop: true,
        batch_size: BATCH,
        crop_size: CROP,
        placements: placements.clone(),
        rank,
        seed: 5,
    };
    let mut fetch = Fetcher::new(&fetch_config, SyntheticSource::parse(&fetch_config.source, 5)?)?;
    fetch.run()?;

    let config = ParallelConfig::new(placements, Placement::host(0)).with_update(UpdateConfig {
        learning_rate: 0.0005,
        momentum: 0.9,
        weight_decay: 0.0005,
    });
    let mut model = DataParallel::new(config, ctx, network)?;
    if rank == 0 {
        print!("{}", model.summary());
    }

    // weights sit at even positions, biases at odd ones
    let n = model.num_weights();
    let weights: Vec<usize> = (0..n).step_by(2).collect();
    let biases: Vec<usize> = (1..n).step_by(2).collect();
    model.init::<Constant>(&biases, ConstantParams { value: 0.0 })?;
    model.init::<Gaussian>(&weights, GaussianParams { mean: 0.0, std: 0.05 })?;
    model.init_by_key::<Gaussian>(&["classifier.weight"], GaussianParams { mean: 0.0, std: 0.01 })?;

    for iteration in 0..ITERATIONS {
        model.feed(fetch.images()?, fetch.labels()?)?;
        model.run_async()?;
        fetch.run_async()?;
        fetch.sync()?;
        model.sync()?;

        if iteration % 5 == 0 || iteration + 1 == ITERATIONS {
            let losses = model.losses()?;
            let mean = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
            println!("rank {} iteration {:>3}: loss {:.4}", rank, iteration, mean);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // two ranks in one process: rank 0 hosts the parameter server and one
    // replica, rank 1 hosts two replicas
    let placements = vec![
        Placement::device_of(0, 0),
        Placement::device_of(1, 0),
        Placement::device_of(1, 1),
    ];

    let ranks: Vec<_> = CommContext::local_mesh(2, RetryPolicy::default())
        .into_iter()
        .map(|ctx| {
            let placements = placements.clone();
            thread::spawn(move || train(ctx, placements))
        })
        .collect();

    for rank in ranks {
        rank.join()
            .map_err(|_| Error::InvalidState("training thread panicked".into()))??;
    }
    Ok(())
}
