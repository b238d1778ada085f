// Offline front end: classify or explain a local image without the server.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use mushroom_classifier::logging::init_logging;
use mushroom_classifier::{Classifier, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "classify_cli", about = "Classify mushroom photos from the command line")]
struct Cli {
    /// JSON config file providing model paths and architecture.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long = "model", global = true)]
    model_path: Option<PathBuf>,
    #[arg(long = "classes", global = true)]
    classes_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the prediction as JSON.
    Predict { image: PathBuf },
    /// Grad-CAM overlay; written as PNG to `--out`, or printed as base64.
    Visualize {
        image: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(path) = cli.model_path {
        config.model_path = path;
    }
    if let Some(path) = cli.classes_path {
        config.classes_path = path;
    }

    let classifier = Classifier::load(&config.model_path, &config.classes_path, &config.model)?
        .with_low_confidence_threshold(config.low_confidence_threshold);

    match cli.command {
        Command::Predict { image } => {
            let prediction = classifier.predict(&image)?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
        Command::Visualize { image, out } => {
            let encoded = classifier.visualize(&image)?;
            match out {
                Some(path) => {
                    fs::write(&path, STANDARD.decode(&encoded)?)?;
                    println!("Grad-CAM overlay written to {}", path.display());
                }
                None => println!("{}", encoded),
            }
        }
    }
    Ok(())
}

fn main() {
    init_logging();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Application error: {}", e);
        let mut current_err: Option<&(dyn std::error::Error + 'static)> = e.source();
        while let Some(source) = current_err {
            eprintln!("Caused by: {}", source);
            current_err = source.source();
        }
        std::process::exit(1);
    }
}
