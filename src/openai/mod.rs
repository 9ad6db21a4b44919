use either::Either;
use serde::Deserialize;

use crate::engine_state::EngineHolder;

pub mod conversation;
pub mod openai_server;
pub mod pipelines;
pub mod requests;
pub mod responses;
pub mod sampling_params;
pub mod streaming;
pub mod utils;

#[derive(Clone, Debug, Deserialize)]
#[allow(unused)]
pub struct TokenContent {
    content: Option<String>,
    lstrip: Option<bool>,
    normalized: Option<bool>,
    rstrip: Option<bool>,
    single_word: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BosEosToken(
    #[serde(with = "either::serde_untagged")] pub Either<Option<String>, Option<TokenContent>>,
);

impl BosEosToken {
    pub fn content(&self) -> Option<String> {
        match &self.0 {
            Either::Left(text) => text.clone(),
            Either::Right(Some(token)) => token.content.clone(),
            Either::Right(None) => None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct NamedChatTemplate {
    pub name: String,
    pub template: String,
}

/// `chat_template` is either a single template or a list of named ones.
#[derive(Deserialize, Debug, Clone)]
pub struct ChatTemplateField(
    #[serde(with = "either::serde_untagged")] pub Either<String, Vec<NamedChatTemplate>>,
);

impl ChatTemplateField {
    pub fn default_template(&self) -> Option<String> {
        match &self.0 {
            Either::Left(template) => Some(template.clone()),
            Either::Right(named) => named
                .iter()
                .find(|t| t.name == "default")
                .or_else(|| named.first())
                .map(|t| t.template.clone()),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub chat_template: Option<ChatTemplateField>,
    #[serde(default)]
    pub bos_token: Option<BosEosToken>,
    #[serde(default)]
    pub eos_token: Option<BosEosToken>,
}

/// Server data shared across request handlers.
pub struct OpenAIServerData {
    pub engine: EngineHolder,
    pub served_model_names: Vec<String>,
}

impl OpenAIServerData {
    pub fn new(engine: EngineHolder, served_model_names: Vec<String>) -> Self {
        Self {
            engine,
            served_model_names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenizer_config_token_forms() {
        let cfg: TokenizerConfig = serde_json::from_str(
            r#"{
                "bos_token": "<s>",
                "eos_token": {"content": "</s>", "lstrip": false},
                "chat_template": "{{ messages }}"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.bos_token.unwrap().content().as_deref(), Some("<s>"));
        assert_eq!(cfg.eos_token.unwrap().content().as_deref(), Some("</s>"));
        assert_eq!(
            cfg.chat_template.unwrap().default_template().as_deref(),
            Some("{{ messages }}")
        );
    }

    #[test]
    fn test_named_chat_templates_pick_default() {
        let cfg: TokenizerConfig = serde_json::from_str(
            r#"{"chat_template": [
                {"name": "tool_use", "template": "tools"},
                {"name": "default", "template": "chat"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.chat_template.unwrap().default_template().as_deref(),
            Some("chat")
        );
        assert!(cfg.bos_token.is_none());
    }
}
