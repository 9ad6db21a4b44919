mod test_helpers;

use candle_serve::openai::pipelines::llm_engine::{EngineError, LLMEngine};
use candle_serve::openai::pipelines::{RuntimeError, TemplateSource};
use candle_serve::openai::requests::Message;
use candle_serve::openai::sampling_params::{CacheImplementation, GenerationConfig};
use test_helpers::engine;
use test_helpers::mock_runtime::{MockRuntime, ProcessorMode, EOS};

fn greedy() -> GenerationConfig {
    GenerationConfig {
        do_sample: Some(false),
        ..GenerationConfig::default()
    }
}

fn image_conversation() -> Vec<Message> {
    serde_json::from_value(serde_json::json!([
        {"role": "user", "content": [
            {"type": "image", "url": "https://example.com/cat.png"},
            {"type": "text", "text": "What is this?"}
        ]}
    ]))
    .unwrap()
}

#[test]
fn test_completion_usage_adds_up() {
    let (_, engine) = engine(MockRuntime::new(" world"));
    let generation = engine.generate_completion("Hello", &greedy(), None).unwrap();
    assert_eq!(generation.text, " world");
    assert_eq!(generation.prompt_tokens, 5);
    assert_eq!(generation.completion_tokens, 6);
}

#[test]
fn test_completion_honors_token_limits() {
    let (_, engine) = engine(MockRuntime::new(" world"));
    let config = GenerationConfig {
        max_new_tokens: Some(1),
        ..greedy()
    };
    let generation = engine.generate_completion("Hello", &config, None).unwrap();
    assert_eq!(generation.completion_tokens, 1);
    assert_eq!(generation.text, " ");

    // `max_length` counts the prompt.
    let config = GenerationConfig {
        max_length: Some(1),
        ..greedy()
    };
    let generation = engine.generate_completion("Hello", &config, None).unwrap();
    assert!(generation.completion_tokens <= 1);
}

#[test]
fn test_chat_completion_uses_tokenizer_template() {
    let (runtime, engine) = engine(MockRuntime::new("Hi!"));
    let conversation = vec![Message::new("user", "Hello")];
    let generation = engine
        .generate_chat_completion(&conversation, &greedy(), None)
        .unwrap();
    assert_eq!(generation.text, "Hi!");
    assert_eq!(generation.prompt_tokens, "user: Hello\nassistant: ".len());
    assert_eq!(runtime.template_sources(), vec![TemplateSource::Tokenizer]);
}

#[test]
fn test_out_of_memory_is_retried_once_with_offloaded_cache() {
    let (runtime, engine) = engine(MockRuntime::new("ok").with_oom_failures(1));
    let generation = engine.generate_completion("Hello", &greedy(), None).unwrap();
    assert_eq!(generation.text, "ok");

    let configs = runtime.configs();
    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].cache_implementation, None);
    assert_eq!(
        configs[1].cache_implementation,
        Some(CacheImplementation::Offloaded)
    );
    assert_eq!(configs[1].do_sample, Some(false));
    assert_eq!(runtime.releases(), 1);
}

#[test]
fn test_second_out_of_memory_is_a_generation_failure() {
    let (runtime, engine) = engine(MockRuntime::new("ok").with_oom_failures(2));
    let err = engine.generate_completion("Hello", &greedy(), None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::GenerationFailure(RuntimeError::OutOfMemory(_))
    ));
    assert_eq!(runtime.configs().len(), 2);
}

#[test]
fn test_other_failures_are_not_retried() {
    let (runtime, engine) = engine(MockRuntime::new("ok").failing_after(0));
    let err = engine.generate_completion("Hello", &greedy(), None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::GenerationFailure(RuntimeError::Model(_))
    ));
    assert_eq!(runtime.configs().len(), 1);
    assert_eq!(runtime.releases(), 0);
}

#[test]
fn test_multimodal_detection() {
    assert!(LLMEngine::is_multimodal(&image_conversation()));
    assert!(!LLMEngine::is_multimodal(&[
        Message::new("system", "Be brief."),
        Message::new("user", "Hello"),
    ]));
    let text_parts: Vec<Message> = serde_json::from_value(serde_json::json!([
        {"role": "user", "content": [{"type": "text", "text": "only text"}]}
    ]))
    .unwrap();
    assert!(!LLMEngine::is_multimodal(&text_parts));
}

#[test]
fn test_multimodal_conversation_uses_processor() {
    let (runtime, engine) =
        engine(MockRuntime::new("a cat").with_processor(ProcessorMode::Working));
    let generation = engine
        .generate_chat_completion(&image_conversation(), &greedy(), None)
        .unwrap();
    assert_eq!(generation.text, "a cat");
    assert_eq!(runtime.template_sources(), vec![TemplateSource::Processor]);
}

#[test]
fn test_missing_processor_falls_back_to_tokenizer_template() {
    let (runtime, engine) = engine(MockRuntime::new("a cat"));
    let generation = engine
        .generate_chat_completion(&image_conversation(), &greedy(), None)
        .unwrap();
    assert_eq!(generation.text, "a cat");
    assert_eq!(
        runtime.template_sources(),
        vec![TemplateSource::Processor, TemplateSource::Tokenizer]
    );
}

#[test]
fn test_input_errors_from_processor_propagate() {
    let (runtime, engine) =
        engine(MockRuntime::new("a cat").with_processor(ProcessorMode::BrokenInput));
    let err = engine
        .generate_chat_completion(&image_conversation(), &greedy(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::GenerationFailure(RuntimeError::Tokenizer(_))
    ));
    assert_eq!(runtime.template_sources(), vec![TemplateSource::Processor]);
    assert!(runtime.configs().is_empty());
}

#[test]
fn test_tokenize_detokenize_round_trip() {
    let (_, engine) = engine(MockRuntime::new(""));
    for text in ["", "hello", "The quick brown fox, 42 times!"] {
        let ids = engine.tokenize(text).unwrap();
        assert_eq!(ids.len(), text.len());
        assert_eq!(engine.detokenize(&ids).unwrap(), text);
    }
}

#[test]
fn test_detokenize_keeps_special_tokens() {
    let (_, engine) = engine(MockRuntime::new(""));
    let mut ids = engine.tokenize("end").unwrap();
    ids.push(EOS);
    assert_eq!(engine.detokenize(&ids).unwrap(), "end</s>");
    assert_eq!(engine.count_tokens("end").unwrap(), 3);
}
