//! Chat-completion backends (direct OpenAI or OpenRouter-hosted models).
//!
//! Each turn opens one streaming completion. Text deltas are buffered into
//! sentence-sized pieces and each piece is synthesized to 24 kHz PCM16 with
//! the OpenAI speech API, so audio starts flowing as soon as the model has
//! produced its first full sentence rather than after the whole reply.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateSpeechRequestArgs, SpeechModel,
        SpeechResponseFormat, Voice,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;
use voicegate_core::{
    BrainProvider, ProviderError, ProviderEvent, ResponseId, ResponseStream, RetryPolicy, Speaker,
    TurnContext, TurnMessage,
};

/// Don't synthesize fragments shorter than this unless the reply is over;
/// tiny TTS requests waste round-trips and sound choppy.
const MIN_FLUSH_CHARS: usize = 40;

pub struct ChatProvider {
    name: String,
    chat: Client<OpenAIConfig>,
    /// Speech synthesis always goes to OpenAI, whichever host streams text.
    tts: Client<OpenAIConfig>,
    model: String,
    retry: RetryPolicy,
}

impl ChatProvider {
    /// A model reached directly at api.openai.com.
    pub fn direct(openai_key: &str, model: String) -> Self {
        let config = OpenAIConfig::new().with_api_key(openai_key);
        ChatProvider {
            name: format!("direct/{model}"),
            chat: Client::with_config(config.clone()),
            tts: Client::with_config(config),
            model,
            retry: RetryPolicy::default(),
        }
    }

    /// A racing candidate hosted behind OpenRouter.
    pub fn openrouter(
        openrouter_key: &str,
        api_base: &str,
        model: String,
        openai_key: &str,
    ) -> Self {
        let chat_config = OpenAIConfig::new()
            .with_api_key(openrouter_key)
            .with_api_base(api_base);
        let tts_config = OpenAIConfig::new().with_api_key(openai_key);
        ChatProvider {
            name: format!("openrouter/{model}"),
            chat: Client::with_config(chat_config),
            tts: Client::with_config(tts_config),
            model,
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl BrainProvider for ChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin_response(&self, ctx: &TurnContext) -> Result<ResponseStream, ProviderError> {
        let messages = build_messages(&ctx.instructions, &ctx.history).map_err(|err| {
            ProviderError::Protocol {
                provider: self.name.clone(),
                message: err.to_string(),
            }
        })?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .stream(true)
            .build()
            .map_err(|err| ProviderError::Protocol {
                provider: self.name.clone(),
                message: err.to_string(),
            })?;

        let mut attempt = 0;
        let mut text_stream = loop {
            match self.chat.chat().create_stream(request.clone()).await {
                Ok(stream) => break stream,
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(ProviderError::Unavailable {
                            provider: self.name.clone(),
                            attempts: attempt,
                            source: err.into(),
                        });
                    }
                    let jitter =
                        std::time::Duration::from_millis(rand::random_range(0..100));
                    let delay = self.retry.delay_for(attempt - 1) + jitter;
                    warn!(
                        provider = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chat stream failed to open; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let response_id = ResponseId(format!("{}-{}", self.name, Uuid::new_v4()));
        let provider = self.name.clone();
        let tts = self.tts.clone();
        let voice = parse_voice(&ctx.voice);
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            if tx
                .send(Ok(ProviderEvent::ResponseStarted {
                    response_id: response_id.clone(),
                }))
                .await
                .is_err()
            {
                return;
            }

            let mut pending = String::new();
            let mut full = String::new();
            while let Some(result) = text_stream.next().await {
                let response = match result {
                    Ok(response) => response,
                    Err(err) => {
                        let _ = tx
                            .send(Err(ProviderError::Protocol {
                                provider: provider.clone(),
                                message: err.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                // OpenRouter interleaves housekeeping chunks with no choices.
                let Some(choice) = response.choices.first() else {
                    continue;
                };
                let Some(content) = choice.delta.content.as_deref() else {
                    continue;
                };
                pending.push_str(content);
                full.push_str(content);
                while let Some(sentence) = take_ready_sentence(&mut pending) {
                    if !speak(&tx, &tts, &provider, &response_id, voice.clone(), sentence).await {
                        return;
                    }
                }
            }

            let tail = std::mem::take(&mut pending);
            if !tail.trim().is_empty()
                && !speak(&tx, &tts, &provider, &response_id, voice, tail).await
            {
                return;
            }
            let _ = tx
                .send(Ok(ProviderEvent::ResponseDone {
                    response_id,
                    transcript: Some(full),
                }))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn cancel_response(&self, response_id: &ResponseId) {
        // The completion stream aborts when its consumer drops it; there is
        // no server-side cancel on this path.
        debug!(provider = %self.name, response_id = %response_id, "chat response cancelled locally");
    }

    async fn truncate_conversation(&self, response_id: &ResponseId, audio_end_ms: Option<u64>) {
        // Stateless backend: the session rebuilds history every turn, keeping
        // only the transcript that was actually played.
        debug!(
            provider = %self.name,
            response_id = %response_id,
            audio_end_ms = ?audio_end_ms,
            "no server-side history to truncate"
        );
    }
}

/// Synthesize one piece of text and forward it. Returns false once the
/// consumer is gone or synthesis failed terminally.
async fn speak(
    tx: &mpsc::Sender<Result<ProviderEvent, ProviderError>>,
    tts: &Client<OpenAIConfig>,
    provider: &str,
    response_id: &ResponseId,
    voice: Voice,
    text: String,
) -> bool {
    let request = match CreateSpeechRequestArgs::default()
        .model(SpeechModel::Tts1)
        .input(text.clone())
        .voice(voice)
        .response_format(SpeechResponseFormat::Pcm)
        .build()
    {
        Ok(request) => request,
        Err(err) => {
            let _ = tx
                .send(Err(ProviderError::Protocol {
                    provider: provider.to_string(),
                    message: err.to_string(),
                }))
                .await;
            return false;
        }
    };
    match tts.audio().speech(request).await {
        Ok(speech) => tx
            .send(Ok(ProviderEvent::AudioChunk {
                response_id: response_id.clone(),
                audio: speech.bytes,
                transcript_delta: Some(text),
            }))
            .await
            .is_ok(),
        Err(err) => {
            let _ = tx
                .send(Err(ProviderError::Protocol {
                    provider: provider.to_string(),
                    message: format!("speech synthesis failed: {err}"),
                }))
                .await;
            false
        }
    }
}

fn build_messages(
    instructions: &str,
    history: &[TurnMessage],
) -> anyhow::Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(history.len() + 1);
    messages.push(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(instructions)
            .build()?
            .into(),
    );
    for message in history {
        let mapped = match message.role {
            Speaker::Caller => ChatCompletionRequestUserMessageArgs::default()
                .content(message.text.as_str())
                .build()?
                .into(),
            Speaker::Agent => ChatCompletionRequestAssistantMessageArgs::default()
                .content(message.text.as_str())
                .build()?
                .into(),
        };
        messages.push(mapped);
    }
    Ok(messages)
}

/// Split off the leading part of `buf` once it is long enough to end at a
/// sentence boundary.
fn take_ready_sentence(buf: &mut String) -> Option<String> {
    let mut seen = 0;
    for (idx, ch) in buf.char_indices() {
        seen += 1;
        if seen >= MIN_FLUSH_CHARS && matches!(ch, '.' | '!' | '?' | '\n') {
            let rest = buf.split_off(idx + ch.len_utf8());
            return Some(std::mem::replace(buf, rest));
        }
    }
    None
}

fn parse_voice(name: &str) -> Voice {
    match name.to_lowercase().as_str() {
        "alloy" => Voice::Alloy,
        "echo" => Voice::Echo,
        "fable" => Voice::Fable,
        "onyx" => Voice::Onyx,
        "nova" => Voice::Nova,
        "shimmer" => Voice::Shimmer,
        other => {
            warn!(voice = other, "unknown voice, using shimmer");
            Voice::Shimmer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_held_back() {
        let mut buf = "Hello there.".to_string();
        assert!(take_ready_sentence(&mut buf).is_none());
        assert_eq!(buf, "Hello there.");
    }

    #[test]
    fn long_text_splits_at_the_sentence_boundary() {
        let mut buf =
            "This first sentence is comfortably long enough to flush. And this part stays."
                .to_string();
        let sentence = take_ready_sentence(&mut buf).expect("ready");
        assert_eq!(
            sentence,
            "This first sentence is comfortably long enough to flush."
        );
        assert_eq!(buf, " And this part stays.");
        assert!(take_ready_sentence(&mut buf).is_none());
    }

    #[test]
    fn splitting_respects_multibyte_characters() {
        let mut buf = format!("{}é? tail", "x".repeat(MIN_FLUSH_CHARS));
        let sentence = take_ready_sentence(&mut buf).expect("ready");
        assert!(sentence.ends_with("é?"));
        assert_eq!(buf, " tail");
    }

    #[test]
    fn history_maps_to_chat_roles() {
        let history = vec![
            TurnMessage {
                role: Speaker::Caller,
                text: "hi".to_string(),
            },
            TurnMessage {
                role: Speaker::Agent,
                text: "hello".to_string(),
            },
        ];
        let messages = build_messages("be nice", &history).expect("messages");
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            messages[0],
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(
            messages[2],
            ChatCompletionRequestMessage::Assistant(_)
        ));
    }

    #[test]
    fn unknown_voice_falls_back_to_shimmer() {
        assert!(matches!(parse_voice("nova"), Voice::Nova));
        assert!(matches!(parse_voice("SHIMMER"), Voice::Shimmer));
        assert!(matches!(parse_voice("mystery"), Voice::Shimmer));
    }
}
