pub mod chat_template;

pub use chat_template::{ChatTemplate, DEFAULT_CHAT_TEMPLATE};

#[derive(thiserror::Error, Debug)]
pub enum ApplyChatTemplateError {
    #[error("failed to add template: {0}")]
    AddTemplateError(#[source] minijinja::Error),
    #[error("failed to get template: {0}")]
    GetTemplateError(#[source] minijinja::Error),
    #[error("failed to render: {0}")]
    RenderTemplateError(#[source] minijinja::Error),
}
