//! Configuration types for the analysis pipeline.
//!
//! Everything the pipeline needs to reach its three collaborators lives in
//! [`AnalysisConfig`], built via [`AnalysisConfigBuilder`] or read from the
//! process environment with [`AnalysisConfig::from_env`]. Credentials are
//! resolved once, at construction, into plain values owned by the config;
//! nothing here writes files or mutates process-wide state.

use crate::error::AnalysisError;
use crate::pipeline::auth::{GoogleCredentials, ServiceAccountKey};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default inference model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default MIME type sent to the extractor when the upload declares none.
pub const DEFAULT_MIME_TYPE: &str = "application/pdf";

/// Configuration for one analysis handler.
///
/// # Example
/// ```rust
/// use doc2fin::{AnalysisConfig, ExtractionBackend};
///
/// let config = AnalysisConfig::builder()
///     .storage_url("https://project.supabase.co")
///     .storage_key("service-role-key")
///     .extraction(ExtractionBackend::vision("vision-api-key"))
///     .temperature(0.0)
///     .build()
///     .unwrap();
/// assert_eq!(config.storage.documents_table, "document_uploads");
/// ```
#[derive(Clone)]
pub struct AnalysisConfig {
    /// Where document rows, result rows and uploaded files live.
    pub storage: StorageConfig,

    /// Which OCR/document-understanding service turns bytes into text.
    pub extraction: ExtractionBackend,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is detected from the environment.
    pub provider_name: Option<String>,

    /// LLM model identifier. Default: [`DEFAULT_MODEL`].
    pub model: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for field inference. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate. Default: 1024.
    pub max_tokens: usize,

    /// Custom system prompt. If None, uses [`crate::prompts::FINANCIAL_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,

    /// Extracted text longer than this is cut before inference. Default: 100 000 chars.
    pub max_text_chars: usize,

    /// MIME type used when the document row has none. Default: `application/pdf`.
    pub default_mime_type: String,

    /// Upper bound on each storage, extraction or inference call. Default: 60.
    pub call_timeout_secs: u64,

    /// Upper bound on the file download. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            extraction: ExtractionBackend::vision(""),
            provider_name: None,
            model: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 1024,
            system_prompt: None,
            max_text_chars: 100_000,
            default_mime_type: DEFAULT_MIME_TYPE.to_string(),
            call_timeout_secs: 60,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("storage", &self.storage)
            .field("extraction", &self.extraction)
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_text_chars", &self.max_text_chars)
            .field("default_mime_type", &self.default_mime_type)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .finish()
    }
}

impl AnalysisConfig {
    /// Create a new builder for `AnalysisConfig`.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder {
            config: Self::default(),
        }
    }

    /// Read configuration from the process environment.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `SUPABASE_URL` | storage endpoint (required) |
    /// | `SUPABASE_SERVICE_ROLE_KEY` | storage service key (required) |
    /// | `DOC2FIN_EXTRACTOR` | `vision` or `documentai` |
    /// | `GOOGLE_CLOUD_VISION_API_KEY` | Vision API key |
    /// | `DOCUMENTAI_PROJECT_ID` / `_LOCATION` / `_PROCESSOR_ID` | Document AI processor |
    /// | `GOOGLE_ACCESS_TOKEN` | Document AI bearer token |
    /// | `GOOGLE_SERVICE_ACCOUNT` | Document AI service-account key JSON |
    /// | `GOOGLE_APPLICATION_CREDENTIALS` | path to a service-account key file |
    /// | `DOC2FIN_PROVIDER` / `DOC2FIN_MODEL` | inference provider and model |
    ///
    /// Secrets may also be given as `<NAME>_FILE` (path to a file holding the
    /// value) or `<NAME>_BASE64` (base64 of the value).
    pub fn from_env() -> Result<Self, AnalysisError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AnalysisError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let storage_url = get("SUPABASE_URL")
            .ok_or_else(|| AnalysisError::InvalidConfig("SUPABASE_URL is not set".into()))?;
        let storage_key = CredentialSource::from_lookup(&get, "SUPABASE_SERVICE_ROLE_KEY")
            .ok_or_else(|| {
                AnalysisError::InvalidConfig("SUPABASE_SERVICE_ROLE_KEY is not set".into())
            })?
            .resolve()?;

        let extraction = extraction_from_lookup(&get)?;

        let mut builder = Self::builder()
            .storage_url(storage_url)
            .storage_key(storage_key)
            .extraction(extraction);

        if let Some(v) = get("DOC2FIN_DOCUMENTS_TABLE") {
            builder = builder.documents_table(v);
        }
        if let Some(v) = get("DOC2FIN_RESULTS_TABLE") {
            builder = builder.results_table(v);
        }
        if let Some(v) = get("DOC2FIN_BUCKET") {
            builder = builder.bucket(v);
        }
        if let Some(v) = get("DOC2FIN_PROVIDER") {
            builder = builder.provider_name(v);
        }
        if let Some(v) = get("DOC2FIN_MODEL") {
            builder = builder.model(v);
        }
        if let Some(v) = get("DOC2FIN_TEMPERATURE") {
            builder = builder.temperature(parse_num("DOC2FIN_TEMPERATURE", &v)?);
        }
        if let Some(v) = get("DOC2FIN_MAX_TOKENS") {
            builder = builder.max_tokens(parse_num("DOC2FIN_MAX_TOKENS", &v)?);
        }
        if let Some(v) = get("DOC2FIN_CALL_TIMEOUT") {
            builder = builder.call_timeout_secs(parse_num("DOC2FIN_CALL_TIMEOUT", &v)?);
        }
        if let Some(v) = get("DOC2FIN_DOWNLOAD_TIMEOUT") {
            builder = builder.download_timeout_secs(parse_num("DOC2FIN_DOWNLOAD_TIMEOUT", &v)?);
        }
        if let Some(v) = get("DOC2FIN_DEFAULT_MIME_TYPE") {
            builder = builder.default_mime_type(v);
        }

        builder.build()
    }

    /// The model to request, falling back to [`DEFAULT_MODEL`].
    pub fn model_or_default(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

/// Builder for [`AnalysisConfig`].
#[derive(Debug)]
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl AnalysisConfigBuilder {
    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn storage_url(mut self, url: impl Into<String>) -> Self {
        self.config.storage.url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.config.storage.service_key = key.into();
        self
    }

    pub fn documents_table(mut self, table: impl Into<String>) -> Self {
        self.config.storage.documents_table = table.into();
        self
    }

    pub fn results_table(mut self, table: impl Into<String>) -> Self {
        self.config.storage.results_table = table.into();
        self
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.storage.bucket = bucket.into();
        self
    }

    pub fn extraction(mut self, backend: ExtractionBackend) -> Self {
        self.config.extraction = backend;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_text_chars(mut self, n: usize) -> Self {
        self.config.max_text_chars = n.max(1);
        self
    }

    pub fn default_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.config.default_mime_type = mime.into();
        self
    }

    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.call_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalysisConfig, AnalysisError> {
        let c = &self.config;
        if !(c.storage.url.starts_with("http://") || c.storage.url.starts_with("https://")) {
            return Err(AnalysisError::InvalidConfig(format!(
                "storage URL must be http(s), got '{}'",
                c.storage.url
            )));
        }
        if c.storage.service_key.trim().is_empty() {
            return Err(AnalysisError::InvalidConfig(
                "storage service key is empty".into(),
            ));
        }
        for (name, value) in [
            ("documents table", &c.storage.documents_table),
            ("results table", &c.storage.results_table),
            ("bucket", &c.storage.bucket),
        ] {
            if value.trim().is_empty() {
                return Err(AnalysisError::InvalidConfig(format!("{name} is empty")));
            }
        }
        c.extraction.validate()?;
        if c.call_timeout_secs == 0 || c.download_timeout_secs == 0 {
            return Err(AnalysisError::InvalidConfig(
                "timeouts must be ≥ 1 second".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(AnalysisError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

/// Location and credentials of the storage backend.
#[derive(Clone)]
pub struct StorageConfig {
    /// Project base URL, e.g. `https://abc.supabase.co`.
    pub url: String,
    /// Service-level key sent as both `apikey` and bearer token.
    pub service_key: String,
    pub documents_table: String,
    pub results_table: String,
    pub bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_key: String::new(),
            documents_table: "document_uploads".to_string(),
            results_table: "dados_financeiros_processados".to_string(),
            bucket: "documents".to_string(),
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .field("documents_table", &self.documents_table)
            .field("results_table", &self.results_table)
            .field("bucket", &self.bucket)
            .finish()
    }
}

// ── Extraction backend ───────────────────────────────────────────────────

/// Text-extraction service and its credentials.
#[derive(Clone, PartialEq)]
pub enum ExtractionBackend {
    /// Google Cloud Vision `DOCUMENT_TEXT_DETECTION`, authenticated by API key.
    Vision {
        api_key: String,
        /// Override for `https://vision.googleapis.com`.
        endpoint: Option<String>,
    },
    /// Google Document AI processor, authenticated by an OAuth access token
    /// or a service-account key.
    DocumentAi {
        project_id: String,
        location: String,
        processor_id: String,
        credentials: GoogleCredentials,
        /// Override for `https://{location}-documentai.googleapis.com`.
        endpoint: Option<String>,
    },
}

impl ExtractionBackend {
    pub fn vision(api_key: impl Into<String>) -> Self {
        ExtractionBackend::Vision {
            api_key: api_key.into(),
            endpoint: None,
        }
    }

    pub fn document_ai(
        project_id: impl Into<String>,
        location: impl Into<String>,
        processor_id: impl Into<String>,
        credentials: impl Into<GoogleCredentials>,
    ) -> Self {
        ExtractionBackend::DocumentAi {
            project_id: project_id.into(),
            location: location.into(),
            processor_id: processor_id.into(),
            credentials: credentials.into(),
            endpoint: None,
        }
    }

    /// Point the backend at a different base URL.
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        let url = Some(url.into().trim_end_matches('/').to_string());
        match &mut self {
            ExtractionBackend::Vision { endpoint, .. } => *endpoint = url,
            ExtractionBackend::DocumentAi { endpoint, .. } => *endpoint = url,
        }
        self
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ExtractionBackend::Vision { .. } => "vision",
            ExtractionBackend::DocumentAi { .. } => "documentai",
        }
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        let missing: Vec<&str> = match self {
            ExtractionBackend::Vision { api_key, .. } => {
                [("Vision API key", api_key)]
                    .into_iter()
                    .filter(|(_, v)| v.trim().is_empty())
                    .map(|(n, _)| n)
                    .collect()
            }
            ExtractionBackend::DocumentAi {
                project_id,
                location,
                processor_id,
                credentials,
                ..
            } => {
                let mut missing: Vec<&str> = [
                    ("Document AI project id", project_id),
                    ("Document AI location", location),
                    ("Document AI processor id", processor_id),
                ]
                .into_iter()
                .filter(|(_, v)| v.trim().is_empty())
                .map(|(n, _)| n)
                .collect();
                if credentials.is_empty() {
                    missing.push("Document AI access token");
                }
                missing
            }
        };
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AnalysisError::InvalidConfig(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }
}

impl fmt::Debug for ExtractionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionBackend::Vision { endpoint, .. } => f
                .debug_struct("Vision")
                .field("api_key", &"<redacted>")
                .field("endpoint", endpoint)
                .finish(),
            ExtractionBackend::DocumentAi {
                project_id,
                location,
                processor_id,
                credentials,
                endpoint,
            } => f
                .debug_struct("DocumentAi")
                .field("project_id", project_id)
                .field("location", location)
                .field("processor_id", processor_id)
                .field("credentials", credentials)
                .field("endpoint", endpoint)
                .finish(),
        }
    }
}

fn extraction_from_lookup<F>(get: &F) -> Result<ExtractionBackend, AnalysisError>
where
    F: Fn(&str) -> Option<String>,
{
    let choice = get("DOC2FIN_EXTRACTOR").map(|v| v.to_lowercase());
    let use_document_ai = match choice.as_deref() {
        Some("vision") => false,
        Some("documentai") | Some("document-ai") | Some("document_ai") => true,
        Some(other) => {
            return Err(AnalysisError::InvalidConfig(format!(
                "DOC2FIN_EXTRACTOR must be 'vision' or 'documentai', got '{other}'"
            )))
        }
        None => get("DOCUMENTAI_PROCESSOR_ID").is_some(),
    };

    let backend = if use_document_ai {
        let credentials = google_credentials(get)?;
        let project_id = get("DOCUMENTAI_PROJECT_ID")
            .or_else(|| credentials.project_id().map(str::to_string))
            .ok_or_else(|| {
                AnalysisError::InvalidConfig("DOCUMENTAI_PROJECT_ID is not set".into())
            })?;
        let processor_id = get("DOCUMENTAI_PROCESSOR_ID").ok_or_else(|| {
            AnalysisError::InvalidConfig("DOCUMENTAI_PROCESSOR_ID is not set".into())
        })?;
        ExtractionBackend::document_ai(
            project_id,
            get("DOCUMENTAI_LOCATION").unwrap_or_else(|| "us".to_string()),
            processor_id,
            credentials,
        )
    } else {
        let key = CredentialSource::from_lookup(get, "GOOGLE_CLOUD_VISION_API_KEY")
            .ok_or_else(|| {
                AnalysisError::InvalidConfig("GOOGLE_CLOUD_VISION_API_KEY is not set".into())
            })?
            .resolve()?;
        ExtractionBackend::vision(key)
    };

    Ok(match get("DOC2FIN_EXTRACTOR_ENDPOINT") {
        Some(url) => backend.with_endpoint(url),
        None => backend,
    })
}

/// Document AI credentials: an access token if one is given, otherwise a
/// service-account key from `GOOGLE_SERVICE_ACCOUNT*` or the file named by
/// `GOOGLE_APPLICATION_CREDENTIALS`.
fn google_credentials<F>(get: &F) -> Result<GoogleCredentials, AnalysisError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(source) = CredentialSource::from_lookup(get, "GOOGLE_ACCESS_TOKEN") {
        return Ok(GoogleCredentials::AccessToken(source.resolve()?));
    }
    if let Some(source) = CredentialSource::from_lookup(get, "GOOGLE_SERVICE_ACCOUNT") {
        return source.resolve_google();
    }
    if let Some(path) = get("GOOGLE_APPLICATION_CREDENTIALS") {
        return CredentialSource::File(PathBuf::from(path)).resolve_google();
    }
    Err(AnalysisError::InvalidConfig(
        "Document AI needs GOOGLE_ACCESS_TOKEN or GOOGLE_SERVICE_ACCOUNT".into(),
    ))
}

// ── Credentials ──────────────────────────────────────────────────────────

/// Where a secret comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// The secret itself.
    Inline(String),
    /// A file whose contents are the secret.
    File(PathBuf),
    /// Base64 of the secret.
    Base64(String),
}

impl CredentialSource {
    /// Look up `NAME`, then `NAME_FILE`, then `NAME_BASE64`.
    pub fn from_lookup<F>(get: &F, name: &str) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get(name) {
            return Some(CredentialSource::Inline(v));
        }
        if let Some(v) = get(&format!("{name}_FILE")) {
            return Some(CredentialSource::File(PathBuf::from(v)));
        }
        get(&format!("{name}_BASE64")).map(CredentialSource::Base64)
    }

    /// Produce the secret.
    ///
    /// When the material is a JSON object the value of its `api_key`,
    /// `access_token`, `token` or `key` member is used. Service-account keys
    /// are only accepted by [`resolve_google`](Self::resolve_google).
    pub fn resolve(&self) -> Result<String, AnalysisError> {
        let raw = self.material()?;
        if raw.starts_with('{') {
            return secret_from_json(&raw);
        }
        Ok(raw)
    }

    /// Produce Google credentials: a service-account key when the material
    /// is one, otherwise a bearer token as [`resolve`](Self::resolve) reads it.
    pub fn resolve_google(&self) -> Result<GoogleCredentials, AnalysisError> {
        let raw = self.material()?;
        if raw.starts_with('{') {
            if json_value(&raw)?.get("private_key").is_some() {
                return ServiceAccountKey::from_json(&raw).map(GoogleCredentials::ServiceAccount);
            }
            return secret_from_json(&raw).map(GoogleCredentials::AccessToken);
        }
        Ok(GoogleCredentials::AccessToken(raw))
    }

    fn material(&self) -> Result<String, AnalysisError> {
        let raw = match self {
            CredentialSource::Inline(v) => v.clone(),
            CredentialSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
                AnalysisError::InvalidConfig(format!(
                    "cannot read credential file '{}': {e}",
                    path.display()
                ))
            })?,
            CredentialSource::Base64(v) => {
                let bytes = STANDARD.decode(v.trim()).map_err(|e| {
                    AnalysisError::InvalidConfig(format!("credential is not valid base64: {e}"))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    AnalysisError::InvalidConfig("decoded credential is not UTF-8".into())
                })?
            }
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AnalysisError::InvalidConfig("credential is empty".into()));
        }
        Ok(raw.to_string())
    }
}

fn json_value(raw: &str) -> Result<serde_json::Value, AnalysisError> {
    serde_json::from_str(raw)
        .map_err(|e| AnalysisError::InvalidConfig(format!("credential JSON is invalid: {e}")))
}

fn secret_from_json(raw: &str) -> Result<String, AnalysisError> {
    let value = json_value(raw)?;
    if value.get("private_key").is_some() {
        return Err(AnalysisError::InvalidConfig(
            "service-account key given where a plain secret is expected".into(),
        ));
    }
    ["api_key", "access_token", "token", "key"]
        .iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            AnalysisError::InvalidConfig(
                "credential JSON has no api_key, access_token, token or key member".into(),
            )
        })
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, AnalysisError> {
    value
        .parse()
        .map_err(|_| AnalysisError::InvalidConfig(format!("{name} is not a number: '{value}'")))
}
