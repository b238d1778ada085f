//! # Classification API Routes
//!
//! Actix handlers for the health route and the two upload endpoints. Each
//! upload is read from the `file` form field, spooled to a temporary file,
//! classified (or explained) on the blocking thread pool, and the temporary
//! file is removed afterwards whatever the outcome.

use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use futures_util::TryStreamExt;
use log::{info, warn};
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::error::ApiError;
use crate::config::ServerConfig;
use crate::predict::{Classifier, Prediction};

pub const UPLOAD_FIELD: &str = "file";

/// Shared by every worker through `web::Data`.
#[derive(Debug)]
pub struct AppState {
    pub classifier: Classifier,
    pub upload_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(classifier: Classifier, config: &ServerConfig) -> Self {
        Self {
            classifier,
            upload_dir: config.upload_dir.clone(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GradCamResponse {
    pub gradcam_image: String,
}

pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": "Mushroom Classification API is running." }))
}

pub async fn predict_image(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<web::Json<Prediction>, ApiError> {
    let upload_id = Uuid::new_v4();
    let bytes = read_upload(payload, state.max_upload_bytes).await?;
    info!("[{}] /predict received {} bytes", upload_id, bytes.len());

    let prediction = web::block(move || {
        with_spooled_upload(&bytes, state.upload_dir.as_deref(), |path| {
            state.classifier.predict(path).map_err(ApiError::from)
        })
    })
    .await??;

    info!(
        "[{}] classified as '{}' ({:.4})",
        upload_id, prediction.class_name, prediction.confidence
    );
    Ok(web::Json(prediction))
}

pub async fn visualize_image(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<web::Json<GradCamResponse>, ApiError> {
    let upload_id = Uuid::new_v4();
    let bytes = read_upload(payload, state.max_upload_bytes).await?;
    info!("[{}] /visualize received {} bytes", upload_id, bytes.len());

    let gradcam_image = web::block(move || {
        with_spooled_upload(&bytes, state.upload_dir.as_deref(), |path| {
            state.classifier.visualize(path).map_err(ApiError::from)
        })
    })
    .await??;

    Ok(web::Json(GradCamResponse { gradcam_image }))
}

/// Collects the `file` field of the form. Other fields are skipped.
async fn read_upload(mut payload: Multipart, limit: usize) -> Result<Vec<u8>, ApiError> {
    while let Some(mut field) = payload.try_next().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            if bytes.len() + chunk.len() > limit {
                return Err(ApiError::PayloadTooLarge { limit });
            }
            bytes.extend_from_slice(&chunk);
        }
        return Ok(bytes);
    }
    Err(ApiError::MissingFile)
}

/// Writes `bytes` to a fresh `.jpg` temp file, hands its path to `work`
/// and deletes the file afterwards, also when `work` fails.
fn with_spooled_upload<T>(
    bytes: &[u8],
    upload_dir: Option<&Path>,
    work: impl FnOnce(&Path) -> Result<T, ApiError>,
) -> Result<T, ApiError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("upload-").suffix(".jpg");
    let mut upload: NamedTempFile = match upload_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    upload.write_all(bytes)?;
    upload.flush()?;

    let result = work(upload.path());

    let path = upload.path().to_path_buf();
    if let Err(e) = upload.close() {
        warn!("Failed to remove upload {}: {}", path.display(), e);
    }
    result
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(root))
        .route("/predict", web::post().to(predict_image))
        .route("/visualize", web::post().to(visualize_image));
}

/// Any origin, method and header, with credentials. A strict default
/// (same-origin only) otherwise.
pub fn cors_layer(permissive: bool) -> Cors {
    if permissive {
        Cors::permissive()
    } else {
        Cors::default()
    }
}

/// Binds the configured address and serves until shutdown.
pub async fn run_server(config: ServerConfig, classifier: Classifier) -> std::io::Result<()> {
    let state = web::Data::new(AppState::new(classifier, &config));
    let permissive = config.cors_permissive;

    info!("Starting server at http://{}:{}/", config.host, config.port);
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors_layer(permissive))
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((config.host.as_str(), config.port))?;

    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }
    server.run().await
}
