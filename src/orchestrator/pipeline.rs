//! The two-phase conversation turn
//!
//! Phase 1 lets the LLM pick tools and executes them through the router;
//! phase 2 masks every tool result under a fresh session id, asks the LLM to
//! answer strictly from the masked results, restores pseudonyms per chunk on
//! the way out, and finishes with one whole-buffer restoration pass whose
//! result — when it differs from what was streamed — is emitted as a
//! corrective `content_update` event.

use crate::masking::MaskingEngine;
use crate::orchestrator::llm::ChatModel;
use crate::orchestrator::types::{ChatMessage, Decision, OrchestratorEvent};
use crate::routing::{ToolCall, ToolCallOutcome, ToolRouter};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

const GENERATION_INSTRUCTIONS: &str = "You are an operations assistant. Answer the user's \
question strictly from the tool results supplied below. Do not invent hostnames, addresses \
or numbers that are not present in the results. Keep identifiers exactly as written.";

/// Runs the two-phase LLM/tool dialogue and streams output events
pub struct ToolOrchestrator {
    router: Arc<ToolRouter>,
    masking: Arc<MaskingEngine>,
    model: Arc<dyn ChatModel>,
}

impl ToolOrchestrator {
    pub fn new(router: Arc<ToolRouter>, masking: Arc<MaskingEngine>, model: Arc<dyn ChatModel>) -> Self {
        Self {
            router,
            masking,
            model,
        }
    }

    /// Run one conversation turn against the given history.
    ///
    /// The returned stream always carries some textual answer, whatever
    /// fails along the way.
    pub fn run_turn(&self, history: Vec<ChatMessage>) -> ReceiverStream<OrchestratorEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let router = Arc::clone(&self.router);
        let masking = Arc::clone(&self.masking);
        let model = Arc::clone(&self.model);

        tokio::spawn(async move {
            run_turn_inner(router, masking, model, history, tx).await;
        });

        ReceiverStream::new(rx)
    }
}

async fn run_turn_inner(
    router: Arc<ToolRouter>,
    masking: Arc<MaskingEngine>,
    model: Arc<dyn ChatModel>,
    mut history: Vec<ChatMessage>,
    tx: mpsc::Sender<OrchestratorEvent>,
) {
    let tools = router.list_tools();

    let decision = match model.decide(&history, &tools).await {
        Ok(decision) => decision,
        Err(e) => {
            error!("Decision call failed: {}", e);
            emit_text(&tx, format!("I could not reach the language model: {}", e)).await;
            return;
        }
    };

    let calls = match decision {
        Decision::NoTools => {
            // Plain streamed reply from the unmodified history; the masking
            // engine is never touched on this path.
            debug!("No tools requested, streaming plain reply");
            stream_plain_reply(&model, &history, &tx).await;
            return;
        }
        Decision::ToolCalls(calls) => calls,
    };

    info!("Model requested {} tool calls", calls.len());
    history.push(ChatMessage::assistant_tool_calls(calls.clone()));

    // Phase 1: execute. Fan-out/fan-in; each call carries its own timeout
    // and one call's failure never blocks the others.
    for call in &calls {
        let _ = tx
            .send(OrchestratorEvent::ToolCallStarted {
                id: call.id.clone(),
                tool_name: call.name.clone(),
            })
            .await;
    }

    let batch: Vec<ToolCall> = calls
        .iter()
        .map(|call| ToolCall::with_id(call.id.clone(), call.name.clone(), call.arguments.clone()))
        .collect();
    let outcomes = router.call_batch(batch).await;

    for outcome in &outcomes {
        let _ = tx
            .send(OrchestratorEvent::ToolCallFinished {
                id: outcome.id.clone(),
                tool_name: outcome.tool_name.clone(),
                success: outcome.is_success(),
                summary: summarize_outcome(outcome),
            })
            .await;

        let content = match &outcome.result {
            Ok(value) => serde_json::to_string(value).unwrap_or_else(|e| format!("Unserializable result: {}", e)),
            Err(e) => format!("Error: {}", e),
        };
        history.push(ChatMessage::tool(outcome.id.clone(), content));
    }

    // Phase 2: masked generation under a session id fresh for this turn.
    let session_id = format!("turn-{}", Uuid::new_v4());

    let raw_results: Vec<Value> = outcomes
        .iter()
        .map(|outcome| {
            json!({
                "call_id": outcome.id,
                "tool": outcome.tool_name,
                "result": match &outcome.result {
                    Ok(value) => value.clone(),
                    Err(e) => json!({"error": e.to_string()}),
                },
            })
        })
        .collect();

    let masked_results = match masking.mask_all(&raw_results, &session_id) {
        Ok(masked) => masked,
        Err(e) => {
            // Fail-closed masking: never send the raw data to the LLM;
            // answer from the raw results locally instead.
            warn!("Masking failed closed: {}", e);
            emit_text(&tx, fallback_summary(&outcomes)).await;
            return;
        }
    };

    let generation_history = build_generation_prompt(&history, &masked_results);

    let mut stream = match model.stream_reply(&generation_history).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Generation call failed: {}", e);
            emit_text(&tx, fallback_summary(&outcomes)).await;
            return;
        }
    };

    // Stream with best-effort per-chunk restoration. A pseudonym split
    // across two chunks will not restore here; the final pass catches it.
    let mut raw_answer = String::new();
    let mut streamed_answer = String::new();
    let mut stream_failed = false;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                raw_answer.push_str(&chunk);
                let restored = masking.restore_text(&chunk, &session_id);
                streamed_answer.push_str(&restored);
                emit_text(&tx, restored).await;
            }
            Err(e) => {
                error!("Generation stream failed: {}", e);
                stream_failed = true;
                break;
            }
        }
    }

    if stream_failed {
        // The turn still answers: replace whatever was streamed with a
        // synthesized summary of the raw tool results.
        let _ = tx
            .send(OrchestratorEvent::ContentUpdate {
                content: fallback_summary(&outcomes),
            })
            .await;
        return;
    }

    // Final whole-buffer restoration pass; correct the displayed text only
    // when the approximate stream missed something.
    let final_answer = masking.restore_text(&raw_answer, &session_id);
    if final_answer != streamed_answer {
        debug!("Streamed restoration was incomplete, emitting corrective update");
        let _ = tx
            .send(OrchestratorEvent::ContentUpdate {
                content: final_answer,
            })
            .await;
    }
}

async fn stream_plain_reply(
    model: &Arc<dyn ChatModel>,
    history: &[ChatMessage],
    tx: &mpsc::Sender<OrchestratorEvent>,
) {
    let mut stream = match model.stream_reply(history).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Plain reply failed: {}", e);
            emit_text(tx, format!("I could not reach the language model: {}", e)).await;
            return;
        }
    };

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => emit_text(tx, chunk).await,
            Err(e) => {
                error!("Plain reply stream failed: {}", e);
                emit_text(tx, format!("\n[The answer was cut short: {}]", e)).await;
                return;
            }
        }
    }
}

async fn emit_text(tx: &mpsc::Sender<OrchestratorEvent>, content: String) {
    if content.is_empty() {
        return;
    }
    let _ = tx.send(OrchestratorEvent::Text { content }).await;
}

/// Short human-readable progress line; never the raw payload
fn summarize_outcome(outcome: &ToolCallOutcome) -> String {
    match &outcome.result {
        Ok(value) => {
            let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
            format!(
                "{} completed in {}ms ({} bytes)",
                outcome.tool_name,
                outcome.duration.as_millis(),
                size
            )
        }
        Err(e) => format!(
            "{} failed after {}ms: {}",
            outcome.tool_name,
            outcome.duration.as_millis(),
            e.category()
        ),
    }
}

/// Phase-2 prompt: the conversational history (without tool internals) plus
/// the masked results the model must answer from
fn build_generation_prompt(history: &[ChatMessage], masked_results: &[Value]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(GENERATION_INSTRUCTIONS)];

    messages.extend(
        history
            .iter()
            .filter(|m| m.tool_call_id.is_none() && m.tool_calls.is_none())
            .cloned(),
    );

    let results_block = serde_json::to_string_pretty(masked_results)
        .unwrap_or_else(|_| "[]".to_string());
    messages.push(ChatMessage::user(format!(
        "Tool results:\n{}\n\nAnswer the previous question strictly from these results.",
        results_block
    )));

    messages
}

/// Structured summary of the raw tool results, used whenever phase-2
/// generation is unavailable. Built from the collected outcomes, never from
/// the masked intermediate form.
fn fallback_summary(outcomes: &[ToolCallOutcome]) -> String {
    let mut summary = String::from("I could not generate a narrative answer. Raw tool results:\n");

    for outcome in outcomes {
        match &outcome.result {
            Ok(value) => {
                let rendered = serde_json::to_string(value).unwrap_or_else(|_| "<unserializable>".to_string());
                summary.push_str(&format!(
                    "- {} (ok, {}ms): {}\n",
                    outcome.tool_name,
                    outcome.duration.as_millis(),
                    rendered
                ));
            }
            Err(e) => {
                summary.push_str(&format!(
                    "- {} (failed, {}ms): {}\n",
                    outcome.tool_name,
                    outcome.duration.as_millis(),
                    e
                ));
            }
        }
    }

    summary
}
