//! # onllm-cli
//!
//! Command logic behind the `onllm` binary: interactive chat over stdin/stdout,
//! prompt rendering, registry listing and model directory checks.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use onllm::{
    check_model_files, AppConfig, ChatSession, ChatTemplate, GenerationConfig, Message,
    ModelRegistry, OnllmError, Platform, ResultRole, SessionEvent,
};
use onllm_rag::{spawn_embedding_ingest, spawn_ingest, Embedder, RagConfig, RagError, Retriever};

/// Errors from CLI commands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Onllm(#[from] OnllmError),
    #[error("document error: {0}")]
    Document(#[from] RagError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("model directory {dir} is missing: {missing}")]
    MissingFiles { dir: PathBuf, missing: String },
    #[error("no models directory (pass --models-dir or set models_dir in the settings file)")]
    NoModelsDir,
    #[error("this build cannot load models; rebuild with --features onnx")]
    NoRuntime,
    #[error("document ingestion stopped without a result")]
    IngestStopped,
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Settings file, or defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => Ok(AppConfig::load(path)?),
        None => Ok(AppConfig::default()),
    }
}

/// Built-in registry plus the configured `extra_models.json`, if any.
pub fn load_registry(config: &AppConfig, platform: Platform) -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::builtin();
    if let Some(extra) = &config.extra_models {
        registry.load_extra(extra, platform)?;
    }
    Ok(registry)
}

/// One line per model: name, size, platform, url. Embedding models follow,
/// marked `embedding`.
pub fn list_models(registry: &ModelRegistry) -> String {
    let chat = registry
        .iter()
        .map(|(name, entry)| format!("{name}\t{}\t{}\t{}\n", entry.size, entry.platform, entry.url));
    let embedding = registry.embedding_models().map(|(name, entry)| {
        format!("{name}\t{}\t{}\tembedding\t{}\n", entry.size, entry.platform, entry.url)
    });
    chat.chain(embedding).collect()
}

/// Succeeds when every required model file is present.
pub fn check_dir(dir: &Path) -> Result<()> {
    let missing = check_model_files(dir);
    if missing.is_empty() {
        return Ok(());
    }
    Err(CliError::MissingFiles {
        dir: dir.to_path_buf(),
        missing: missing
            .iter()
            .filter_map(|p| p.strip_prefix(dir).ok())
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Render a JSON message list (`[{"role": ..., "content": ...}]`) with a model's tags.
pub fn render_prompt(
    registry: &ModelRegistry,
    model: &str,
    messages_json: &str,
    add_generation_prompt: bool,
) -> Result<String> {
    let entry = registry
        .get(model)
        .ok_or_else(|| CliError::UnknownModel(model.to_string()))?;
    let template = ChatTemplate::from_tags(&entry.tokens)?;
    let messages: Vec<Message> = serde_json::from_str(messages_json)?;
    Ok(template.render_text(&messages, add_generation_prompt))
}

/// Command-line changes to the configured generation settings.
#[derive(Debug, Clone, Default)]
pub struct GenerationOverrides {
    pub greedy: bool,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
}

impl GenerationOverrides {
    pub fn apply(&self, mut config: GenerationConfig) -> GenerationConfig {
        config.use_greedy |= self.greedy;
        if let Some(v) = self.max_tokens {
            config.max_new_tokens = v;
        }
        if let Some(v) = self.temperature {
            config.temperature = v;
        }
        if let Some(v) = self.top_k {
            config.top_k = v;
        }
        if let Some(v) = self.top_p {
            config.top_p = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.clamped()
    }
}

/// Index a text document on the ingestion thread and wait for it. Chunks are
/// embedded when an embedder is given and ranked lexically otherwise.
pub fn load_document(
    path: &Path,
    embedder: Option<Arc<dyn Embedder>>,
) -> Result<Arc<dyn Retriever>> {
    let config = RagConfig::default();
    match embedder {
        Some(embedder) => {
            let index = spawn_embedding_ingest(path, config, embedder)
                .recv()
                .map_err(|_| CliError::IngestStopped)??;
            tracing::info!(source = %index.source(), chunks = index.len(), "document attached");
            let retriever: Arc<dyn Retriever> = Arc::new(index);
            Ok(retriever)
        }
        None => {
            let index = spawn_ingest(path, config)
                .recv()
                .map_err(|_| CliError::IngestStopped)??;
            tracing::info!(source = %index.source(), chunks = index.len(), "document attached with lexical retrieval");
            let retriever: Arc<dyn Retriever> = Arc::new(index);
            Ok(retriever)
        }
    }
}

/// The built-in embedding model from `models_dir`, if it has been downloaded.
#[cfg(feature = "onnx")]
pub fn open_embedder(
    config: &AppConfig,
    models_dir: Option<&Path>,
) -> Result<Option<Arc<dyn Embedder>>> {
    use onllm::model::{check_embedding_model_files, DEFAULT_EMBEDDING_MODEL};

    let Some(root) = models_dir.or(config.models_dir.as_deref()) else {
        return Ok(None);
    };
    let dir = root.join(DEFAULT_EMBEDDING_MODEL);
    if !check_embedding_model_files(&dir).is_empty() {
        tracing::info!(dir = %dir.display(), "no embedding model, using lexical retrieval");
        return Ok(None);
    }
    let embedder: Arc<dyn Embedder> = Arc::new(onllm_rag::OnnxEmbedder::from_dir(&dir)?);
    Ok(Some(embedder))
}

#[cfg(not(feature = "onnx"))]
pub fn open_embedder(
    _config: &AppConfig,
    _models_dir: Option<&Path>,
) -> Result<Option<Arc<dyn Embedder>>> {
    Ok(None)
}

/// Create a session with `model` loaded from `models_dir/<model>`.
#[cfg(feature = "onnx")]
pub fn open_session(
    config: &AppConfig,
    registry: &ModelRegistry,
    model: &str,
    models_dir: Option<&Path>,
) -> Result<ChatSession> {
    let entry = registry
        .get(model)
        .ok_or_else(|| CliError::UnknownModel(model.to_string()))?;
    let dir = models_dir
        .or(config.models_dir.as_deref())
        .ok_or(CliError::NoModelsDir)?
        .join(model);
    check_dir(&dir)?;

    let mut session = ChatSession::from_config(config)?;
    session.load_model(model, entry, &dir)?;
    Ok(session)
}

#[cfg(not(feature = "onnx"))]
pub fn open_session(
    _config: &AppConfig,
    _registry: &ModelRegistry,
    _model: &str,
    _models_dir: Option<&Path>,
) -> Result<ChatSession> {
    Err(CliError::NoRuntime)
}

/// Read lines from `input`, stream replies to `output`.
///
/// `/reset` starts a new chat and `/quit` ends the loop. Rejected messages are
/// reported and the loop continues.
pub fn chat_loop<R: BufRead, W: Write>(
    session: &mut ChatSession,
    input: R,
    output: &mut W,
) -> Result<()> {
    write!(output, "> ")?;
    output.flush()?;

    for line in input.lines() {
        let line = line?;
        match line.trim() {
            "/quit" => break,
            "/reset" => {
                session.reset();
                writeln!(output, "[new chat]")?;
            }
            text => match session.submit(text) {
                Ok(_) => stream_reply(session, output)?,
                Err(e) => writeln!(output, "{e}")?,
            },
        }
        write!(output, "> ")?;
        output.flush()?;
    }
    writeln!(output)?;
    Ok(())
}

fn stream_reply<W: Write>(session: &mut ChatSession, output: &mut W) -> Result<()> {
    while let Some(event) = session.next_event() {
        match event {
            SessionEvent::Partial(text) => {
                write!(output, "{text}")?;
                output.flush()?;
            }
            SessionEvent::Final(result) => {
                if result.role == ResultRole::Error {
                    write!(output, "{}", result.content)?;
                }
                writeln!(output)?;
            }
            SessionEvent::Cancelled => writeln!(output, "[cancelled]")?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use onllm::{LoadedModel, ModelSpec, SessionSettings};
    use onllm_engine::{InferenceBackend, Logits, ModelDescriptor, StepInputs, StepOutputs};
    use onllm_kv::{KVShape, KVTensor, LayerKV};
    use onllm_tokenizer::CharTokenizer;

    const VOCAB: usize = 3 + 128;

    /// Answers every prompt with "ok" then `<|im_end|>`.
    struct OkBackend;

    impl InferenceBackend for OkBackend {
        fn run(&self, inputs: StepInputs<'_>) -> onllm_engine::Result<StepOutputs> {
            let tok = CharTokenizer::chatml();
            let last = *inputs.input_ids.last().unwrap_or(&0) as u32;
            let next = if inputs.past.seq_len() == 0 {
                tok.char_id('o')
            } else if last == tok.char_id('o') {
                tok.char_id('k')
            } else {
                2
            };

            let n = inputs.input_ids.len();
            let mut data = vec![0.0; n * VOCAB];
            data[(n - 1) * VOCAB + next as usize] = 10.0;
            let shape = KVShape::new(1, 1, inputs.past.seq_len() + n, 2);
            Ok(StepOutputs {
                logits: Logits::new([1, n, VOCAB], data)?,
                present: vec![LayerKV::new(KVTensor::zeros(shape), KVTensor::zeros(shape))],
            })
        }
    }

    fn stub_session() -> ChatSession {
        let registry = ModelRegistry::builtin();
        let entry = registry.get("smollm2-135m").unwrap();
        let descriptor =
            ModelDescriptor::from_json(r#"{"num_hidden_layers": 1, "num_key_value_heads": 1, "head_dim": 2}"#)
                .unwrap();
        let tokenizer = CharTokenizer::chatml();
        let spec = ModelSpec::resolve("smollm2-135m", entry, &descriptor, &tokenizer).unwrap();
        let model = LoadedModel::new(spec, Arc::new(tokenizer), Arc::new(OkBackend));

        let mut session = ChatSession::new(SessionSettings::default(), GenerationConfig::greedy()).unwrap();
        session.select_model(model);
        session
    }

    #[test]
    fn lists_builtin_model() {
        let listing = list_models(&ModelRegistry::builtin());
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("smollm2-135m\t95MB\tandroid\thttps://"));
        assert!(lines[1].starts_with("all-MiniLM-L6-V2\t85MB\tandroid\tembedding\thttps://"));
    }

    #[test]
    fn registry_merges_extra_models_file() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("extra_models.json");
        std::fs::write(
            &extra,
            r#"{"qwen": {"tokens": ["", "<|im_start|>", "<|im_end|>"], "platform": "warn"},
                "big": {"tokens": ["", "<s>", "</s>"], "platform": "desktop"}}"#,
        )
        .unwrap();
        let config = AppConfig {
            extra_models: Some(extra),
            ..AppConfig::default()
        };

        let android = load_registry(&config, Platform::Android).unwrap();
        assert!(android.get("qwen").is_some());
        assert!(android.get("big").is_none());
        assert_eq!(load_registry(&config, Platform::Desktop).unwrap().len(), 3);
    }

    #[test]
    fn check_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("onnx")).unwrap();
        std::fs::write(dir.path().join("onnx/model_int8.onnx"), b"").unwrap();

        let err = check_dir(dir.path()).unwrap_err();
        assert!(err.to_string().ends_with("is missing: tokenizer.json"));

        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        assert!(check_dir(dir.path()).is_ok());
    }

    #[test]
    fn renders_messages_file() {
        let json = r#"[{"role": "system", "content": "Be terse."}, {"role": "user", "content": "Hi"}]"#;
        let text = render_prompt(&ModelRegistry::builtin(), "smollm2-135m", json, true).unwrap();
        assert!(text.ends_with("<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"));
        assert!(matches!(
            render_prompt(&ModelRegistry::builtin(), "nope", json, true),
            Err(CliError::UnknownModel(_))
        ));
    }

    #[test]
    fn overrides_are_clamped() {
        let overrides = GenerationOverrides {
            greedy: true,
            max_tokens: Some(8),
            top_p: Some(2.0),
            seed: Some(7),
            ..GenerationOverrides::default()
        };
        let config = overrides.apply(GenerationConfig::default());
        assert!(config.use_greedy);
        assert_eq!(config.max_new_tokens, 32);
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.top_k, 20);
    }

    #[test]
    fn chat_loop_streams_replies_and_reports_rejections() {
        let mut session = stub_session();
        let input = Cursor::new("Hi\n   \n/reset\nHello\n/quit\nignored\n");
        let mut output = Vec::new();

        chat_loop(&mut session, input, &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(
            text,
            "> ok\n> Please type a message!\n> [new chat]\n> ok\n> \n"
        );
        assert_eq!(session.history().len(), 2);
    }

    /// Scores "battery" words; enough to tell the two retrieval paths apart.
    struct BatteryEmbedder;

    impl Embedder for BatteryEmbedder {
        fn embed(&self, text: &str) -> onllm_rag::Result<Vec<f32>> {
            let hits = text.to_lowercase().matches("batter").count() as f32;
            Ok(vec![hits, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[test]
    fn document_loads_through_ingest_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "The battery lasts ten hours.").unwrap();

        let lexical = load_document(&path, None).unwrap();
        assert!(lexical.retrieve("zzz", 3).unwrap().is_empty());
        assert_eq!(lexical.retrieve("battery", 3).unwrap().len(), 1);

        let dense = load_document(&path, Some(Arc::new(BatteryEmbedder))).unwrap();
        let chunks = dense.retrieve("zzz", 3).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "doc.txt#0");

        let missing = load_document(&dir.path().join("nope.txt"), None);
        assert!(matches!(missing, Err(CliError::Document(RagError::Io(_)))));
    }

    #[test]
    fn no_embedder_without_models_dir() {
        assert!(open_embedder(&AppConfig::default(), None).unwrap().is_none());
    }
}
