//! Server-side jobs: export status polling and media generation.

use std::time::Duration;

use cutline_api_client::{
    wait_for_export, wait_for_generation, ExportStatus, GenerationClient, GenerationKind, GenerationRequest,
    GenerationState, HttpApiClient,
};
use cutline_common::config::{ApiConfig, EngineConfig};
use cutline_common::signal::AbortSignal;

fn api_client(config: &EngineConfig, api: Option<String>) -> anyhow::Result<(HttpApiClient, Duration)> {
    let api_config = ApiConfig {
        base_url: api.unwrap_or_else(|| config.api.base_url.clone()),
        ..config.api.clone()
    };
    let client = HttpApiClient::new(&api_config).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok((client, Duration::from_millis(api_config.poll_interval_ms)))
}

/// Abort signal tripped by Ctrl-C.
fn ctrl_c_abort() -> (AbortSignal, tokio::task::JoinHandle<()>) {
    let abort = AbortSignal::new();
    let trigger = abort.clone();
    let task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.abort();
        }
    });
    (abort, task)
}

pub async fn run_export(config: &EngineConfig, job_id: String, api: Option<String>) -> anyhow::Result<()> {
    let (client, interval) = api_client(config, api)?;
    println!("Polling export {job_id} at {}", client.base_url());

    let (abort, ctrl_c) = ctrl_c_abort();
    let result = wait_for_export(&client, &job_id, interval, &abort).await;
    ctrl_c.abort();

    match result {
        Ok(status) => match status.status {
            ExportStatus::Completed => {
                println!("Export completed");
                if let Some(url) = status.download_url {
                    println!("  Download: {url}");
                }
                Ok(())
            }
            _ => Err(anyhow::anyhow!(
                "Export failed: {}",
                status.error.unwrap_or_else(|| "no error message".to_string())
            )),
        },
        Err(e) if e.is_cancelled() => {
            println!("Polling cancelled");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("{e}")),
    }
}

pub async fn run_generation(
    config: &EngineConfig,
    kind: String,
    prompt: String,
    api: Option<String>,
) -> anyhow::Result<()> {
    let kind: GenerationKind = kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let (client, interval) = api_client(config, api)?;

    let submitted = client
        .submit(kind, &GenerationRequest::new(prompt))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to submit generation: {e}"))?;
    println!("Submitted {} generation {}", kind.as_str(), submitted.generation_id);

    let (abort, ctrl_c) = ctrl_c_abort();
    let result = wait_for_generation(&client, &submitted.generation_id, interval, &abort).await;
    ctrl_c.abort();

    match result {
        Ok(status) if status.status == GenerationState::Completed => {
            println!("Generation completed");
            if let Some(url) = status.result_url {
                println!("  Result: {url}");
            }
            Ok(())
        }
        Ok(status) => Err(anyhow::anyhow!(
            "Generation failed: {}",
            status.error_message.unwrap_or_else(|| "no error message".to_string())
        )),
        Err(e) if e.is_cancelled() => {
            println!("Polling cancelled");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("{e}")),
    }
}
