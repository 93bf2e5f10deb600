use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionNamedToolChoice, ChatCompletionRequestMessage, ChatCompletionTool,
        ChatCompletionToolChoiceOption, ChatCompletionToolType, CreateChatCompletionRequestArgs,
        FunctionName, FunctionObject,
    },
};
use async_trait::async_trait;
use schemars::{JsonSchema, schema_for};
use serde_json::json;
use tracing::debug;

use super::{Evaluation, Rubric, ScoringOracle};
use crate::{
    config::OracleConfig,
    error::{Error, Result},
};

/// Scores submissions with a chat-completion model, forcing the answer
/// through a single tool call so the reply is always a parseable score card.
pub struct OpenAiOracle {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiOracle {
    pub fn new(config: &OracleConfig) -> anyhow::Result<Self> {
        if config.api_key.is_empty() {
            anyhow::bail!("OPENAI_API_KEY is not set");
        }
        let openai = OpenAIConfig::default()
            .with_api_base(config.base_url.clone())
            .with_api_key(config.api_key.clone());
        Ok(Self {
            client: Client::with_config(openai),
            model: config.model.clone(),
        })
    }
}

fn instruction(rubric: &Rubric) -> String {
    let mut instruction = format!(
        "{}\n\n## Task\n{}\n",
        rubric.system_message.trim(),
        rubric.task.trim()
    );
    if !rubric.reference_text.trim().is_empty() {
        instruction.push_str(&format!(
            "\n## Reference\n{}\n",
            rubric.reference_text.trim()
        ));
    }
    instruction.push_str(
        "\nGrade the learner's answer from 0 to 100. Give short feedback and one concrete next step.",
    );
    instruction
}

pub fn extract_tool<T: JsonSchema>(strict: Option<bool>) -> ChatCompletionTool {
    ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObject {
            name: T::schema_name(),
            description: None,
            parameters: Some(json!(schema_for!(T))),
            strict,
        },
    }
}

fn oracle_error(e: OpenAIError) -> Error {
    Error::Oracle(e.to_string())
}

#[async_trait]
impl ScoringOracle for OpenAiOracle {
    async fn evaluate(&self, rubric: &Rubric, submission: &str) -> Result<Evaluation> {
        let tool = extract_tool::<Evaluation>(None);
        let tool_choice = ChatCompletionToolChoiceOption::Named(ChatCompletionNamedToolChoice {
            r#type: ChatCompletionToolType::Function,
            function: FunctionName {
                name: tool.function.name.clone(),
            },
        });
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .messages(vec![
                ChatCompletionRequestMessage::System(instruction(rubric).into()),
                ChatCompletionRequestMessage::User(submission.to_string().into()),
            ])
            .tools(vec![tool])
            .tool_choice(tool_choice)
            .build()
            .map_err(oracle_error)?;
        let arguments = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(oracle_error)?
            .choices
            .first()
            .ok_or(Error::Oracle("No response from OpenAI".to_string()))?
            .message
            .tool_calls
            .as_ref()
            .and_then(|tool_calls| tool_calls.first())
            .ok_or(Error::Oracle("No tool call in response".to_string()))?
            .function
            .arguments
            .clone();
        debug!("oracle arguments: {arguments}");
        serde_json::from_str::<Evaluation>(&arguments)
            .map_err(|e| Error::Oracle(format!("malformed score card: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_includes_reference_only_when_present() {
        let mut rubric = Rubric {
            system_message: "You are a strict reviewer.".into(),
            reference_text: String::new(),
            task: "Explain borrowing.".into(),
        };
        assert!(!instruction(&rubric).contains("## Reference"));
        rubric.reference_text = "Borrowing lends access without moving.".into();
        let text = instruction(&rubric);
        assert!(text.starts_with("You are a strict reviewer."));
        assert!(text.contains("## Reference\nBorrowing lends access"));
    }

    #[test]
    fn score_card_schema_names_every_field() {
        let tool = extract_tool::<Evaluation>(None);
        assert_eq!(tool.function.name, "Evaluation");
        let parameters = tool.function.parameters.unwrap().to_string();
        for field in ["score", "feedback", "next_step"] {
            assert!(parameters.contains(field));
        }
    }

    #[test]
    fn missing_key_is_rejected() {
        let config = OracleConfig::default();
        assert!(OpenAiOracle::new(&config).is_err());
    }
}
