use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use llm_session_host::{
    init_tracing, HostConfig, LlmHost, ModelSettings, PredictionEvent, StubBackend,
};
use parking_lot::Mutex;
use tracing::{info, warn};

const CONFIG_ENV: &str = "LLM_HOST_CONFIG";
const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    let config = HostConfig::load(config_path.as_deref()).context("loading host configuration")?;
    init_tracing(&config.logging);

    let host = LlmHost::from_config(StubBackend::new(), &config);
    let settings = config
        .model
        .clone()
        .unwrap_or_else(|| ModelSettings::new("demo.bin"));
    let engine = host.create_engine(settings)?;
    let session = host.create_session(&engine, config.session.clone().unwrap_or_default())?;

    let prompt = "Hello from the host";
    host.add_query_chunk(&session, prompt)?;
    info!(tokens = host.size_in_tokens(&session, prompt)?, "query queued");
    let response = host.predict_sync(&session)?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    host.add_query_chunk(&session, "Stream this reply word by word")?;
    let streamed = Arc::new(Mutex::new(String::new()));
    let sink = streamed.clone();
    host.predict_async(&session, move |event| match event {
        PredictionEvent::Chunk(chunk) => sink.lock().push_str(&chunk.candidates.concat()),
        PredictionEvent::Error(message) => warn!(%message, "stream failed"),
        PredictionEvent::Cancelled => info!("stream cancelled"),
    })?;
    if !host.dispatcher().drain(STREAM_TIMEOUT) {
        bail!("streamed prediction did not finish within {:?}", STREAM_TIMEOUT);
    }
    println!("{}", streamed.lock());

    host.delete_engine(&engine);
    Ok(())
}
