use super::ApplyChatTemplateError;
use crate::openai::requests::Message;
use minijinja::{context, value::Kwargs, Environment, Error, ErrorKind, Value};
use serde::Serialize;

/// ChatML, used when a model ships without a chat template of its own.
pub const DEFAULT_CHAT_TEMPLATE: &str = "{% for message in messages %}\
{{ '<|im_start|>' + message['role'] + '\\n' }}\
{% if message['content'] is string %}{{ message['content'] }}\
{% else %}{% for part in message['content'] %}\
{% if part['type'] == 'text' %}{{ part['text'] }}{% else %}{{ '<' + part['type'] + '>' }}{% endif %}\
{% endfor %}{% endif %}\
{{ '<|im_end|>' + '\\n' }}\
{% endfor %}\
{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

/// A Jinja chat template together with the special tokens it may reference.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    name: String,
    source: String,
    bos_token: Option<String>,
    eos_token: Option<String>,
}

fn tojson(value: Value, kwargs: Kwargs) -> Result<Value, Error> {
    if let Ok(indent) = kwargs.get::<usize>("indent") {
        let mut buf = Vec::new();
        let repeat = b" ".repeat(indent);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(&repeat);
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut ser).map_err(|err| {
            Error::new(ErrorKind::BadSerialization, "cannot serialize to JSON").with_source(err)
        })?;
        String::from_utf8(buf).map_err(|err| {
            Error::new(ErrorKind::BadSerialization, "cannot serialize to JSON").with_source(err)
        })
    } else {
        serde_json::to_string(&value).map_err(|err| {
            Error::new(ErrorKind::BadSerialization, "cannot serialize to JSON").with_source(err)
        })
    }
    .map(|s| {
        // Safe for both HTML and JSON consumers.
        let mut rv = String::with_capacity(s.len());
        for c in s.chars() {
            match c {
                '<' => rv.push_str("\\u003c"),
                '>' => rv.push_str("\\u003e"),
                '&' => rv.push_str("\\u0026"),
                '\'' => rv.push_str("\\u0027"),
                _ => rv.push(c),
            }
        }
        Value::from_safe_string(rv)
    })
}

fn strftime_now(fmt: String) -> Result<String, Error> {
    Ok(chrono::Utc::now().format(&fmt).to_string())
}

fn raise_exception(msg: String) -> Result<String, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, msg))
}

impl ChatTemplate {
    pub fn new(
        name: &str,
        source: String,
        bos_token: Option<String>,
        eos_token: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            source,
            bos_token,
            eos_token,
        }
    }

    pub fn chatml(bos_token: Option<String>, eos_token: Option<String>) -> Self {
        Self::new("chatml", DEFAULT_CHAT_TEMPLATE.to_string(), bos_token, eos_token)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render `messages` into a prompt string, optionally followed by the
    /// assistant turn header.
    pub fn render(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String, ApplyChatTemplateError> {
        let mut env = Environment::new();
        env.set_lstrip_blocks(true);
        env.set_trim_blocks(true);
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        // Python slice reversal is not valid minijinja syntax.
        let template = self.source.replace("[::-1]", "|reverse");
        env.add_template(self.name.as_str(), template.as_str())
            .map_err(ApplyChatTemplateError::AddTemplateError)?;

        env.add_function("raise_exception", raise_exception);
        env.add_filter("tojson", tojson);
        env.add_function("strftime_now", strftime_now);

        let date_string = chrono::Utc::now().format("%d, %B, %Y").to_string();

        let template = env
            .get_template(&self.name)
            .map_err(ApplyChatTemplateError::GetTemplateError)?;
        template
            .render(context! {
              messages => messages,
              add_generation_prompt => add_generation_prompt,
              bos_token => self.bos_token,
              eos_token => self.eos_token,
              date_string => date_string,
            })
            .map_err(ApplyChatTemplateError::RenderTemplateError)
    }
}
