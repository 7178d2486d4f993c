//! Generation Augmentor: enrich a prompt with fresh search results before
//! delegating to the underlying generation capability.
//!
//! # Flow
//!
//! 1. Generate a [`SearchIdentifier`] and register a correlation wait for it.
//! 2. Dispatch the search through a [`Trigger`]. If dispatch fails, or the
//!    correlator has lost its cursor and refuses the registration, use the
//!    configured "network unavailable" notice as the search content.
//! 3. Otherwise wait on the correlator with the configured deadline; the
//!    matched content or the timeout fallback becomes the search content.
//! 4. Render the prompt template, replace `request.prompt`, and call the
//!    [`Generator`]. Chunks pass straight through to the caller's sink.
//!
//! Only a cancellation aborts generation; search failures never do.

use anyhow::Result;
use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::config::{Config, MessagesConfig};
use crate::correlator::{deadline_after, Correlator, CorrelatorSettings, Outcome};
use crate::error::RelayError;
use crate::generate::OllamaGenerator;
use crate::models::{GenerateChunk, GenerateRequest, SearchIdentifier};
use crate::search::HttpSearchProvider;
use crate::shutdown::ShutdownCoordinator;
use crate::trigger::{RemoteTrigger, SearchTrigger, Trigger};

/// Receives streamed generation output in order.
pub type ChunkSink<'a> = dyn FnMut(GenerateChunk) -> Result<()> + Send + 'a;

/// The underlying generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerateRequest, on_chunk: &mut ChunkSink<'_>)
        -> Result<()>;
}

/// Where the search content in an augmented prompt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    /// The search was triggered; the correlation ended with this outcome.
    Search(Outcome),
    /// Triggering failed; the network-unavailable notice was used.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct AugmentedPrompt {
    pub prompt: String,
    pub source: PromptSource,
}

pub struct Augmentor {
    generator: Arc<dyn Generator>,
    trigger: Arc<dyn Trigger>,
    correlator: Arc<Correlator>,
    messages: MessagesConfig,
    deadline: Duration,
}

impl Augmentor {
    pub fn new(
        generator: Arc<dyn Generator>,
        trigger: Arc<dyn Trigger>,
        correlator: Arc<Correlator>,
        messages: MessagesConfig,
        deadline: Duration,
    ) -> Self {
        Self {
            generator,
            trigger,
            correlator,
            messages,
            deadline,
        }
    }

    /// Build the augmented prompt for `prompt`.
    ///
    /// Returns [`RelayError::Canceled`] only when `cancel` fires or the
    /// correlator has shut down.
    pub async fn augment_prompt(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<AugmentedPrompt, RelayError> {
        let id = SearchIdentifier::generate();
        let wait = match self.correlator.register(id.clone()) {
            Ok(wait) => wait,
            Err(RelayError::Canceled) => return Err(RelayError::Canceled),
            Err(e) => {
                warn!(
                    search_id = %id,
                    error = %e,
                    "correlation unavailable; continuing without search"
                );
                return Ok(self.degraded(prompt));
            }
        };

        let dispatched = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Canceled),
            dispatched = self.trigger.dispatch(&id, prompt) => dispatched,
        };

        if let Err(e) = dispatched {
            warn!(search_id = %id, error = %e, "search unavailable; continuing without it");
            drop(wait);
            return Ok(self.degraded(prompt));
        }

        let correlation = wait.wait(deadline_after(self.deadline), cancel).await;
        match correlation.outcome {
            Outcome::Canceled => Err(RelayError::Canceled),
            outcome => {
                if outcome == Outcome::TimedOut {
                    let timeout = RelayError::CorrelationTimeout(self.deadline);
                    warn!(search_id = %id, error = %timeout, "using timeout fallback");
                }
                info!(search_id = %id, ?outcome, "prompt augmented");
                Ok(AugmentedPrompt {
                    prompt: self.messages.render_prompt(&correlation.content, prompt),
                    source: PromptSource::Search(outcome),
                })
            }
        }
    }

    fn degraded(&self, prompt: &str) -> AugmentedPrompt {
        AugmentedPrompt {
            prompt: self
                .messages
                .render_prompt(&self.messages.network_unavailable, prompt),
            source: PromptSource::Degraded,
        }
    }

    /// Augment `request.prompt`, then delegate to the generator, forwarding
    /// every chunk to `on_chunk` unmodified and in order.
    pub async fn generate(
        &self,
        mut request: GenerateRequest,
        on_chunk: &mut ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<PromptSource, RelayError> {
        let augmented = self.augment_prompt(&request.prompt, cancel).await?;
        request.prompt = augmented.prompt;

        self.generator
            .generate(request, on_chunk)
            .await
            .map_err(|e| RelayError::Generation(format!("{:#}", e)))?;
        Ok(augmented.source)
    }
}

/// Run one augmented generation and stream the answer to stdout.
///
/// This is the composition root for `relay ask`: it opens the broker,
/// starts the correlator, picks an in-process or remote trigger, and tears
/// everything down afterwards.
pub async fn run_ask(config: &Config, prompt: &str, in_memory: bool) -> Result<()> {
    let broker = if in_memory {
        BrokerClient::in_memory((&config.broker).into())
    } else {
        BrokerClient::open(&config.broker).await?
    };
    let correlator = Correlator::start(broker.clone(), CorrelatorSettings::from(config));

    let trigger: Arc<dyn Trigger> = match &config.generation.trigger_url {
        Some(url) => {
            let timeout =
                Duration::from_secs(config.search.timeout_secs) + config.broker.publish_timeout();
            Arc::new(RemoteTrigger::new(url, timeout)?)
        }
        None => Arc::new(SearchTrigger::new(
            Arc::new(HttpSearchProvider::new(&config.search)?),
            broker.clone(),
        )),
    };

    let augmentor = Augmentor::new(
        Arc::new(OllamaGenerator::new(&config.generation)?),
        trigger,
        correlator.clone(),
        config.messages.clone(),
        config.correlation.deadline(),
    );

    let coordinator = ShutdownCoordinator::new();
    coordinator.cancel_on_ctrl_c();

    let request = GenerateRequest {
        model: config.generation.model.clone(),
        prompt: prompt.to_string(),
        system: None,
    };

    let mut stdout = std::io::stdout();
    let mut print_chunk = |chunk: GenerateChunk| -> Result<()> {
        stdout.write_all(chunk.response.as_bytes())?;
        stdout.flush()?;
        Ok(())
    };

    let outcome = augmentor
        .generate(request, &mut print_chunk, &coordinator.token())
        .await;
    println!();

    correlator.shutdown().await;
    broker.close(config.broker.drain_timeout()).await?;

    let source = outcome?;
    info!(?source, "generation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerSettings;
    use crate::models::SearchResult;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Echoes the prompt back in two chunks and records what it saw.
    struct EchoGenerator {
        seen: Mutex<Vec<String>>,
    }

    impl EchoGenerator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(
            &self,
            request: GenerateRequest,
            on_chunk: &mut ChunkSink<'_>,
        ) -> Result<()> {
            self.seen.lock().unwrap().push(request.prompt.clone());
            on_chunk(GenerateChunk {
                response: "first ".to_string(),
                done: false,
            })?;
            on_chunk(GenerateChunk {
                response: "second".to_string(),
                done: true,
            })?;
            Ok(())
        }
    }

    /// Publishes a fixed result for whatever id it is given.
    struct PublishingTrigger {
        broker: Arc<BrokerClient>,
        content: &'static str,
    }

    #[async_trait]
    impl Trigger for PublishingTrigger {
        async fn dispatch(&self, id: &SearchIdentifier, _query: &str) -> Result<(), RelayError> {
            let payload = SearchResult {
                search_id: id.clone(),
                content: self.content.to_string(),
            }
            .to_payload()
            .unwrap();
            self.broker.publish(self.broker.topic(), &payload).await
        }
    }

    struct FailingTrigger;

    #[async_trait]
    impl Trigger for FailingTrigger {
        async fn dispatch(&self, _id: &SearchIdentifier, _query: &str) -> Result<(), RelayError> {
            Err(RelayError::UpstreamSearch("provider timed out".to_string()))
        }
    }

    /// Succeeds but nothing is ever published.
    struct SilentTrigger;

    #[async_trait]
    impl Trigger for SilentTrigger {
        async fn dispatch(&self, _id: &SearchIdentifier, _query: &str) -> Result<(), RelayError> {
            Ok(())
        }
    }

    fn broker() -> Arc<BrokerClient> {
        BrokerClient::in_memory(BrokerSettings {
            topic: "search_results".to_string(),
            publish_timeout: Duration::from_secs(1),
            max_retries: 0,
            retry_backoff: Duration::from_millis(1),
        })
    }

    fn correlator(broker: Arc<BrokerClient>) -> Arc<Correlator> {
        Correlator::start(
            broker,
            CorrelatorSettings {
                poll_interval: Duration::from_millis(20),
                timeout_fallback: MessagesConfig::default().timeout_fallback,
            },
        )
    }

    fn augmentor(
        generator: Arc<EchoGenerator>,
        trigger: Arc<dyn Trigger>,
        correlator: Arc<Correlator>,
    ) -> Augmentor {
        Augmentor::new(
            generator,
            trigger,
            correlator,
            MessagesConfig::default(),
            Duration::from_secs(10),
        )
    }

    fn request(prompt: &str) -> GenerateRequest {
        GenerateRequest {
            model: "llama3".to_string(),
            prompt: prompt.to_string(),
            system: None,
        }
    }

    #[tokio::test]
    async fn test_search_content_reaches_prompt() {
        let broker = broker();
        let generator = EchoGenerator::new();
        let trigger = Arc::new(PublishingTrigger {
            broker: broker.clone(),
            content: "sunny",
        });
        let aug = augmentor(generator.clone(), trigger, correlator(broker));

        let mut chunks = Vec::new();
        let mut sink = |c: GenerateChunk| -> Result<()> {
            chunks.push(c);
            Ok(())
        };
        let source = aug
            .generate(request("weather?"), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source, PromptSource::Search(Outcome::Matched));
        let seen = generator.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            "Answer the question using the following search results: sunny. Question: weather?"
        );
        let text: Vec<&str> = chunks.iter().map(|c| c.response.as_str()).collect();
        assert_eq!(text, vec!["first ", "second"]);
        assert!(chunks[1].done);
    }

    #[tokio::test]
    async fn test_trigger_failure_degrades_without_aborting() {
        let broker = broker();
        let generator = EchoGenerator::new();
        let correlator = correlator(broker);
        let aug = augmentor(generator.clone(), Arc::new(FailingTrigger), correlator.clone());

        let mut sink = |_c: GenerateChunk| -> Result<()> { Ok(()) };
        let source = aug
            .generate(request("weather?"), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source, PromptSource::Degraded);
        let seen = generator.seen.lock().unwrap();
        assert!(seen[0].contains(&MessagesConfig::default().network_unavailable));
        assert!(seen[0].ends_with("Question: weather?"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fallback_used_when_nothing_arrives() {
        let broker = broker();
        let generator = EchoGenerator::new();
        let aug = augmentor(generator.clone(), Arc::new(SilentTrigger), correlator(broker));

        let started = Instant::now();
        let augmented = aug
            .augment_prompt("weather?", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(augmented.source, PromptSource::Search(Outcome::TimedOut));
        assert!(augmented
            .prompt
            .contains(&MessagesConfig::default().timeout_fallback));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_is_clamped() {
        let broker = broker();
        let trigger = Arc::new(PublishingTrigger {
            broker: broker.clone(),
            content: "sunny",
        });
        let aug = Augmentor::new(
            EchoGenerator::new(),
            trigger,
            correlator(broker),
            MessagesConfig::default(),
            Duration::from_secs(u64::MAX),
        );

        let augmented = aug
            .augment_prompt("weather?", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(augmented.source, PromptSource::Search(Outcome::Matched));
        assert!(augmented.prompt.contains("sunny"));
    }

    /// Every read fails, as after the broker connection is lost.
    struct LostCursor;

    #[async_trait]
    impl crate::broker::Transport for LostCursor {
        async fn send(&self, _topic: &str, _payload: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn receive(&self, _max_wait: Duration) -> Result<Option<Vec<u8>>> {
            anyhow::bail!("broker subscription ended")
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_cursor_degrades_instead_of_waiting() {
        let broker = Arc::new(BrokerClient::new(
            Arc::new(LostCursor),
            BrokerSettings {
                topic: "search_results".to_string(),
                publish_timeout: Duration::from_secs(1),
                max_retries: 0,
                retry_backoff: Duration::from_millis(1),
            },
        ));
        let correlator = correlator(broker);
        let aug = augmentor(EchoGenerator::new(), Arc::new(SilentTrigger), correlator.clone());

        // Let the reader exhaust its read attempts
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        let augmented = aug
            .augment_prompt("weather?", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(augmented.source, PromptSource::Degraded);
        assert!(augmented
            .prompt
            .contains(&MessagesConfig::default().network_unavailable));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_before_generation() {
        let broker = broker();
        let generator = EchoGenerator::new();
        let correlator = correlator(broker);
        let aug = augmentor(generator.clone(), Arc::new(SilentTrigger), correlator.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = |_c: GenerateChunk| -> Result<()> { Ok(()) };
        let err = aug
            .generate(request("weather?"), &mut sink, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Canceled));
        assert!(generator.seen.lock().unwrap().is_empty());
        assert_eq!(correlator.pending_count(), 0);
    }
}
