//! Local llama.cpp backend for keyless operation.
//!
//! Loads a fixed quantized instruct model and runs greedy in-process
//! inference. The GGUF file is downloaded into the platform data directory
//! on first use; that one-time fetch is the only network access on this path.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::client::LlmError;
use super::message::Message;

/// Fixed pretrained reference used when no API key is configured.
const MODEL_URL: &str = "https://huggingface.co/Qwen/Qwen2.5-3B-Instruct-GGUF/resolve/main/qwen2.5-3b-instruct-q4_k_m.gguf";
const MODEL_FILE: &str = "qwen2.5-3b-instruct-q4_k_m.gguf";

const N_CTX: u32 = 5_000;
const N_THREADS: i32 = 4;

/// `model` and `template` are declared before `backend` so their ggml
/// resources drop before the backend frees the llama runtime.
struct LoadedModel {
    model: LlamaModel,
    template: LlamaChatTemplate,
    backend: LlamaBackend,
}

/// In-process model handle. One completion at a time; the lock serializes
/// access to the llama context's owner.
pub(crate) struct LocalBackend {
    loaded: Arc<Mutex<LoadedModel>>,
}

impl LocalBackend {
    /// Download the model weights if missing, then load them.
    pub(crate) async fn load() -> Result<Self, LlmError> {
        let path = model_path()?;
        if !path.exists() {
            download_model(&path).await?;
        }
        let loaded = tokio::task::spawn_blocking(move || load_model_sync(&path))
            .await
            .map_err(|e| LlmError::Local(format!("model load task failed: {e}")))??;
        Ok(Self {
            loaded: Arc::new(Mutex::new(loaded)),
        })
    }

    /// Run one greedy completion over the conversation.
    pub(crate) async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let chat: Vec<LlamaChatMessage> = messages
            .iter()
            .map(|m| {
                LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone())
                    .map_err(|e| LlmError::Local(format!("invalid chat message: {e}")))
            })
            .collect::<Result<_, _>>()?;

        let loaded = self.loaded.clone();
        tokio::task::spawn_blocking(move || {
            let loaded = loaded.blocking_lock();
            run_completion(&loaded, &chat)
        })
        .await
        .map_err(|e| LlmError::Local(format!("inference task failed: {e}")))?
    }
}

fn model_path() -> Result<PathBuf, LlmError> {
    directories::ProjectDirs::from("com", "arxivdigest", "arxiv-digest")
        .map(|dirs| dirs.data_dir().join("models").join(MODEL_FILE))
        .ok_or_else(|| LlmError::Local("cannot determine data directory".to_string()))
}

async fn download_model(path: &Path) -> Result<(), LlmError> {
    info!(url = MODEL_URL, "downloading model weights (one-time setup)");
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| LlmError::Local(format!("failed to create model directory: {e}")))?;
    }

    let mut response = reqwest::get(MODEL_URL).await?.error_for_status()?;

    // Stream to a temporary name so an interrupted download never passes the
    // exists() check on the next run.
    let partial = path.with_extension("download");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|e| LlmError::Local(format!("failed to create model file: {e}")))?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk)
            .await
            .map_err(|e| LlmError::Local(format!("failed to write model file: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| LlmError::Local(format!("failed to flush model file: {e}")))?;
    drop(file);
    tokio::fs::rename(&partial, path)
        .await
        .map_err(|e| LlmError::Local(format!("failed to move model file into place: {e}")))?;

    info!(path = %path.display(), "model weights downloaded");
    Ok(())
}

fn load_model_sync(path: &Path) -> Result<LoadedModel, LlmError> {
    info!(path = %path.display(), "loading local model");

    let backend = LlamaBackend::init()
        .map_err(|e| LlmError::Local(format!("failed to init llama backend: {e}")))?;
    let params = LlamaModelParams::default();
    let model = LlamaModel::load_from_file(&backend, path, &params)
        .map_err(|e| LlmError::Local(format!("failed to load model: {e}")))?;

    let template = match model.chat_template(None) {
        Ok(template) => template,
        Err(_) => {
            warn!("model has no embedded chat template, falling back to chatml");
            LlamaChatTemplate::new("chatml")
                .map_err(|e| LlmError::Local(format!("failed to create chat template: {e}")))?
        }
    };

    info!("local model loaded");
    Ok(LoadedModel {
        model,
        template,
        backend,
    })
}

fn run_completion(loaded: &LoadedModel, chat: &[LlamaChatMessage]) -> Result<String, LlmError> {
    let prompt = loaded
        .model
        .apply_chat_template(&loaded.template, chat, true)
        .map_err(|e| LlmError::Local(format!("failed to apply chat template: {e}")))?;

    let tokens = loaded
        .model
        .str_to_token(&prompt, AddBos::Never)
        .map_err(|e| LlmError::Local(format!("failed to tokenize prompt: {e}")))?;

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(N_CTX))
        .with_n_threads(N_THREADS)
        .with_n_threads_batch(N_THREADS);
    let mut ctx = loaded
        .model
        .new_context(&loaded.backend, ctx_params)
        .map_err(|e| LlmError::Local(format!("failed to create context: {e}")))?;

    let n_batch = ctx.n_batch() as usize;
    for chunk in tokens.chunks(n_batch) {
        let mut batch = LlamaBatch::get_one(chunk)
            .map_err(|e| LlmError::Local(format!("failed to create batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| LlmError::Local(format!("prefill decode failed: {e}")))?;
    }

    // Greedy sampling is the temperature-0 decoding of the remote path.
    let mut sampler = LlamaSampler::greedy();
    let mut decoder = encoding_rs::UTF_8.new_decoder();
    let mut output = String::new();
    let max_output = (N_CTX as usize).saturating_sub(tokens.len());

    for _ in 0..max_output {
        let token = sampler.sample(&ctx, -1);
        sampler.accept(token);

        if loaded.model.is_eog_token(token) {
            break;
        }

        let piece = loaded
            .model
            .token_to_piece(token, &mut decoder, true, None)
            .map_err(|e| LlmError::Local(format!("failed to decode token: {e}")))?;
        output.push_str(&piece);

        let next = [token];
        let mut batch = LlamaBatch::get_one(&next)
            .map_err(|e| LlmError::Local(format!("failed to create batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| LlmError::Local(format!("decode failed: {e}")))?;
    }

    Ok(output)
}
