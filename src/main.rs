use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use stillgen::config::Config;
use stillgen::dispatch::http::HttpTransport;
use stillgen::dispatch::{GenerationRequest, ReferenceImage, RequestId};
use stillgen::error::ErrorRecord;
use stillgen::scheduler::GenerationScheduler;
use stillgen::status::StatusEvent;
use stillgen::store::RequestState;

const USAGE: &str = "usage: stillgen <manifest.json> | stillgen --probe";

/// One line of the batch manifest.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    prompt: String,
    #[serde(default)]
    images: Vec<PathBuf>,
    timeout_secs: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Summary {
    id: RequestId,
    state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let arg = std::env::args().nth(1).context(USAGE)?;
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");
    if config.api_key.is_none() {
        bail!("OPENROUTER_API_KEY is not set");
    }
    let transport = HttpTransport::from_config(&config)?;

    if arg == "--probe" {
        let count = transport.probe_models(config.request_timeout).await?;
        println!("{count} models available at {}", config.api_base);
        return Ok(());
    }

    let requests = read_manifest(Path::new(&arg))?;
    tracing::info!(requests = requests.len(), model = %config.model, "stillgen starting");

    let scheduler = GenerationScheduler::from_config(transport, &config);
    let mut batch = scheduler.submit(requests)?;

    if let Some(mut events) = batch.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        });
    }
    let cancel = batch.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling batch");
            cancel.cancel();
        }
    });

    let store = scheduler.store();
    let ids = batch.ids().to_vec();
    let report = batch.wait().await?;

    let summary: Vec<Summary> = ids
        .into_iter()
        .filter_map(|id| {
            let entry = store.get(&id)?;
            Some(Summary {
                state: entry.state(),
                mime_type: entry.image().map(|img| img.mime_type.clone()),
                bytes: entry.image().map(|img| img.bytes.len()),
                error: entry.error().cloned(),
                id,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        cancelled = report.cancelled,
        "stillgen finished in {:.1}s",
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

fn read_manifest(path: &Path) -> anyhow::Result<Vec<GenerationRequest>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let entries: Vec<ManifestEntry> = serde_json::from_str(&text)
        .with_context(|| format!("invalid manifest {}", path.display()))?;

    entries
        .into_iter()
        .map(|entry| {
            let mut request = GenerationRequest::new(entry.id, entry.prompt);
            for image in &entry.images {
                let reference = ReferenceImage::from_path(image)
                    .with_context(|| format!("failed to read image {}", image.display()))?;
                request = request.with_image(reference);
            }
            if let Some(secs) = entry.timeout_secs {
                let timeout = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid timeout_secs for {}", request.id))?;
                request = request.with_timeout(timeout);
            }
            Ok(request)
        })
        .collect()
}

fn log_event(event: &StatusEvent) {
    match event {
        StatusEvent::State { id, state } => tracing::info!(request_id = %id, ?state, "state"),
        StatusEvent::Attempt { id, index } => {
            tracing::info!(request_id = %id, attempt = index + 1, "calling provider")
        }
        StatusEvent::Retrying {
            id,
            index,
            class,
            delay,
        } => tracing::info!(
            request_id = %id,
            attempt = index + 1,
            %class,
            "retrying in {:.1}s",
            delay.as_secs_f64()
        ),
        StatusEvent::Text { id, text } => tracing::debug!(request_id = %id, %text, "provider text"),
    }
}

