use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_bedrockruntime as bedrock;
use aws_sdk_bedrockruntime::types::{
    InferenceConfiguration, Tool, ToolConfiguration, ToolInputSchema, ToolSpecification,
};
use aws_smithy_types::Document;
use convo_config::{AgentConfig, AwsSettings};
use convo_core::{ChunkStream, ConvoError, ModelClient, ModelRequest, Result, ToolDeclaration};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod convert;
mod streaming;

pub use convert::to_converse_input;
use streaming::StreamNormalizer;

/// Model and inference parameters sent with every request.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl From<&AgentConfig> for InferenceSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            model: config.agent.model.clone(),
            temperature: config.agent.temperature,
            max_tokens: config.agent.max_tokens,
        }
    }
}

/// [`ModelClient`] backed by the Bedrock Converse streaming API.
pub struct BedrockClient {
    client: bedrock::Client,
    region: Region,
    settings: InferenceSettings,
}

impl BedrockClient {
    pub async fn new(config: &AgentConfig) -> Result<Self> {
        let aws_config = Self::build_aws_config(&config.aws).await;
        let client = bedrock::Client::new(&aws_config);
        let region = aws_config
            .region()
            .cloned()
            .unwrap_or_else(|| Region::new(config.aws.region.clone()));

        Ok(Self {
            client,
            region,
            settings: InferenceSettings::from(config),
        })
    }

    async fn build_aws_config(settings: &AwsSettings) -> aws_config::SdkConfig {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));

        if let Some(profile) = &settings.profile {
            info!("Using AWS profile: {}", profile);
            config_loader = config_loader.profile_name(profile);
        }

        let aws_config = config_loader.load().await;
        debug!("AWS config loaded for region: {}", settings.region);
        aws_config
    }

    pub fn get_region(&self) -> &str {
        self.region.as_ref()
    }

    pub fn settings(&self) -> &InferenceSettings {
        &self.settings
    }

    fn build_tool_config(tools: &[ToolDeclaration]) -> Result<ToolConfiguration> {
        let mut tool_specs = Vec::with_capacity(tools.len());

        for tool in tools {
            let doc = match json_to_document(&tool.input_schema) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(
                        "Failed to convert schema for tool '{}': {} - using empty schema",
                        tool.name, e
                    );
                    Document::Object(HashMap::new())
                }
            };

            let spec = ToolSpecification::builder()
                .name(tool.name.clone())
                .description(tool.description.clone())
                .input_schema(ToolInputSchema::Json(doc))
                .build()
                .map_err(|e| {
                    ConvoError::ModelError(format!("Failed to build tool spec for '{}': {e}", tool.name))
                })?;

            tool_specs.push(Tool::ToolSpec(spec));
        }

        debug!("Built {} tool specifications", tool_specs.len());

        ToolConfiguration::builder()
            .set_tools(Some(tool_specs))
            .build()
            .map_err(|e| ConvoError::ModelError(e.to_string()))
    }
}

#[async_trait]
impl ModelClient for BedrockClient {
    async fn stream(&self, request: ModelRequest, cancel: CancellationToken) -> Result<ChunkStream> {
        let (messages, system) = to_converse_input(&request)?;
        debug!(
            "Bedrock request: {} messages, {} system blocks, {} tools",
            messages.len(),
            system.len(),
            request.tools.len()
        );

        let inference_config = InferenceConfiguration::builder()
            .max_tokens(i32::try_from(self.settings.max_tokens).unwrap_or(i32::MAX))
            .temperature(self.settings.temperature)
            .build();

        let mut converse_request = self
            .client
            .converse_stream()
            .model_id(&self.settings.model)
            .set_messages(Some(messages))
            .inference_config(inference_config);

        if !system.is_empty() {
            converse_request = converse_request.set_system(Some(system));
        }

        if !request.tools.is_empty() {
            converse_request = converse_request.tool_config(Self::build_tool_config(&request.tools)?);
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ConvoError::TurnCancelled("Bedrock request cancelled".into()));
            }
            output = converse_request.send() => {
                output.map_err(|e| ConvoError::ModelError(format!("Bedrock streaming error: {e}")))?
            }
        };

        let mut events = output.stream;
        let stream = async_stream::stream! {
            let mut normalizer = StreamNormalizer::default();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Bedrock stream cancelled");
                        return;
                    }
                    next = events.recv() => next,
                };

                match next {
                    Ok(Some(event)) => match normalizer.handle(event) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                yield Ok(chunk);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stream error: {}", e);
                        yield Err(ConvoError::ModelError(format!("Stream error: {e}")));
                        return;
                    }
                }
            }

            if let Some(done) = normalizer.finish() {
                yield Ok(done);
            }
        };

        Ok(stream.boxed())
    }
}

pub fn json_to_document(value: &Value) -> Result<Document> {
    json_to_document_with_depth(value, 0)
}

fn json_to_document_with_depth(value: &Value, depth: usize) -> Result<Document> {
    const MAX_DEPTH: usize = 100;

    if depth > MAX_DEPTH {
        debug!("Max depth {} exceeded in json_to_document", MAX_DEPTH);
        return Ok(Document::String(format!("[Deep nested object at depth {depth}]")));
    }

    match value {
        Value::Null => Ok(Document::Null),
        Value::Bool(b) => Ok(Document::Bool(*b)),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Ok(Document::Number(aws_smithy_types::Number::PosInt(u)))
            } else if let Some(i) = n.as_i64() {
                Ok(Document::Number(aws_smithy_types::Number::NegInt(i)))
            } else if let Some(f) = n.as_f64() {
                Ok(Document::Number(aws_smithy_types::Number::Float(f)))
            } else {
                Err(ConvoError::ModelError(format!("Invalid number: {n}")))
            }
        }
        Value::String(s) => Ok(Document::String(s.clone())),
        Value::Array(arr) => {
            let docs: Result<Vec<Document>> = arr
                .iter()
                .map(|v| json_to_document_with_depth(v, depth + 1))
                .collect();
            Ok(Document::Array(docs?))
        }
        Value::Object(obj) => {
            let mut map = HashMap::new();
            for (k, v) in obj {
                map.insert(k.clone(), json_to_document_with_depth(v, depth + 1)?);
            }
            Ok(Document::Object(map))
        }
    }
}

pub fn document_to_json(doc: &Document) -> Result<Value> {
    match doc {
        Document::Null => Ok(Value::Null),
        Document::Bool(b) => Ok(Value::Bool(*b)),
        Document::Number(n) => match n {
            aws_smithy_types::Number::PosInt(u) => Ok(Value::Number((*u).into())),
            aws_smithy_types::Number::NegInt(i) => Ok(Value::Number((*i).into())),
            aws_smithy_types::Number::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .ok_or_else(|| ConvoError::ModelError(format!("Invalid float value: {f}"))),
        },
        Document::String(s) => Ok(Value::String(s.clone())),
        Document::Array(arr) => {
            let values: Result<Vec<Value>> = arr.iter().map(document_to_json).collect();
            Ok(Value::Array(values?))
        }
        Document::Object(obj) => {
            let mut map = serde_json::Map::new();
            for (k, v) in obj {
                map.insert(k.clone(), document_to_json(v)?);
            }
            Ok(Value::Object(map))
        }
    }
}
