use clap::Parser;
use std::path::PathBuf;

use mushroom_classifier::logging::init_logging;
use mushroom_classifier::web::run_server;
use mushroom_classifier::{Classifier, ServerConfig};

/// Mushroom classification HTTP API.
#[derive(Parser, Debug)]
#[command(name = "mushroom_server", version)]
struct Args {
    /// JSON config file; flags below override its values.
    #[arg(long, env = "MUSHROOM_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "MUSHROOM_HOST")]
    host: Option<String>,
    #[arg(long, env = "MUSHROOM_PORT")]
    port: Option<u16>,
    /// Checkpoint in safetensors format.
    #[arg(long = "model", env = "MUSHROOM_MODEL_PATH")]
    model_path: Option<PathBuf>,
    /// JSON mapping of class index to class name.
    #[arg(long = "classes", env = "MUSHROOM_CLASSES_PATH")]
    classes_path: Option<PathBuf>,
    #[arg(long, env = "MUSHROOM_UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model_path) = self.model_path {
            config.model_path = model_path;
        }
        if let Some(classes_path) = self.classes_path {
            config.classes_path = classes_path;
        }
        if self.upload_dir.is_some() {
            config.upload_dir = self.upload_dir;
        }
        if self.workers.is_some() {
            config.workers = self.workers;
        }
        Ok(config)
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config()?;

    let classifier = Classifier::load(&config.model_path, &config.classes_path, &config.model)?
        .with_low_confidence_threshold(config.low_confidence_threshold);

    run_server(config, classifier).await?;
    Ok(())
}

#[actix_web::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        eprintln!("Application error: {}", e);
        let mut current_err: Option<&(dyn std::error::Error + 'static)> = e.source();
        while let Some(source) = current_err {
            eprintln!("Caused by: {}", source);
            current_err = source.source();
        }
        std::process::exit(1);
    }
}
