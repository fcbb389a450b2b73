use std::{env, process};

use log::{error, info};
use split_learning::{specs::TrainerSpec, training::TrainerBuilder};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        error!("{e}");
        process::exit(1);
    }
}

fn run() -> split_learning::Result<()> {
    let spec = match env::args().nth(1) {
        Some(path) => {
            info!(path = path.as_str(); "reading trainer spec");
            TrainerSpec::from_json_file(path)?
        }
        None => TrainerSpec::default(),
    };

    info!(
        mode:? = spec.mode,
        epochs = spec.epochs.get(),
        batch_size = spec.batch_size.get();
        "starting training"
    );

    let mut trainer = TrainerBuilder::new().build(&spec)?;
    let history = trainer.train()?;

    if let Some(last) = history.last() {
        info!(loss = last.loss; "training finished");
    }

    let accuracy = trainer.training_accuracy()?;
    info!(accuracy = accuracy; "training set accuracy");

    Ok(())
}
