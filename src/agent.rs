use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::cua::{Provider, ProposedCall};
use crate::executor::Executor;
use crate::surface::{Surface, SurfaceError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Controller phases. There is no terminal success state; the loop runs until
/// the process is stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    TaskStarted,
    AwaitingProviderResponse,
    ExecutingActions,
    AwaitingUserInput,
}

/// A call dispatched last round whose screenshot result is still owed to the
/// provider.
struct ExecutedCall {
    call_id: String,
    acknowledged_safety_checks: Vec<Value>,
}

/// Drives the model/action loop: owns the conversation, asks the provider for
/// the next step, dispatches the proposed actions through the executor, and
/// folds screenshot results back into the conversation.
pub struct Agent<P: Provider, S: Surface> {
    provider: P,
    executor: Executor<S>,
    autoplay: bool,
    state: AgentState,
    conversation: Vec<Value>,
    round_calls: Vec<ProposedCall>,
    dispatched: bool,
    executed: Vec<ExecutedCall>,
    pub requires_user_input: bool,
    pub requires_consent: bool,
    /// Provider-supplied warning messages for the current round.
    pub pending_safety_checks: Vec<String>,
    pub reasoning_summary: String,
    pub messages: Vec<String>,
}

impl<P: Provider, S: Surface> Agent<P, S> {
    /// `autoplay` bypasses consent and safety gates unconditionally.
    pub fn new(provider: P, executor: Executor<S>, autoplay: bool) -> Self {
        Self {
            provider,
            executor,
            autoplay,
            state: AgentState::Idle,
            conversation: Vec::new(),
            round_calls: Vec::new(),
            dispatched: false,
            executed: Vec::new(),
            requires_user_input: false,
            requires_consent: false,
            pending_safety_checks: Vec::new(),
            reasoning_summary: String::new(),
            messages: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The current round's proposed calls, in dispatch order.
    pub fn actions(&self) -> &[ProposedCall] {
        &self.round_calls
    }

    /// Resets conversation state for a fresh task.
    pub fn start_task(&mut self) {
        self.conversation.clear();
        self.round_calls.clear();
        self.executed.clear();
        self.dispatched = false;
        self.requires_user_input = false;
        self.requires_consent = false;
        self.pending_safety_checks.clear();
        self.reasoning_summary.clear();
        self.messages.clear();
        self.state = AgentState::TaskStarted;
    }

    /// Runs one round: append user input, capture a screenshot, settle any
    /// outstanding call outputs, ask the provider for the next step, then
    /// dispatch the proposed actions unless a gate blocks them.
    pub async fn continue_task(&mut self, user_input: &str) -> Result<(), AgentError> {
        if !user_input.is_empty() {
            self.conversation.push(json!({
                "role": "user",
                "content": [{ "type": "input_text", "text": user_input }],
            }));
        }

        let screenshot = self.executor.surface().screenshot().await?;
        let image_url = format!("data:image/png;base64,{screenshot}");
        if self.executed.is_empty() {
            self.conversation.push(json!({
                "role": "user",
                "content": [{ "type": "input_image", "image_url": image_url }],
            }));
        } else {
            // Every executed call gets exactly one output carrying the fresh
            // screenshot, with any acknowledged safety checks echoed back.
            for call in self.executed.drain(..) {
                let mut output = json!({
                    "type": "computer_call_output",
                    "call_id": call.call_id,
                    "output": { "type": "input_image", "image_url": image_url.clone() },
                });
                if !call.acknowledged_safety_checks.is_empty() {
                    output["acknowledged_safety_checks"] =
                        Value::Array(call.acknowledged_safety_checks);
                }
                self.conversation.push(output);
            }
        }

        self.state = AgentState::AwaitingProviderResponse;
        let step = self
            .provider
            .step(&self.conversation, self.executor.info())
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;
        self.conversation.extend(step.items);

        self.requires_consent = !step.calls.is_empty();
        self.pending_safety_checks = step
            .calls
            .iter()
            .flat_map(|c| &c.safety_checks)
            .map(safety_message)
            .collect();
        self.requires_user_input = step.calls.is_empty() && !step.messages.is_empty();
        self.reasoning_summary = step.reasoning_summary;
        self.messages = step.messages;
        self.round_calls = step.calls;
        self.dispatched = false;
        debug!(
            calls = self.round_calls.len(),
            safety_checks = self.pending_safety_checks.len(),
            requires_user_input = self.requires_user_input,
            "provider step parsed"
        );

        if self.gate_satisfied() {
            self.dispatch_round().await?;
        } else {
            self.state = AgentState::AwaitingUserInput;
        }
        Ok(())
    }

    /// Dispatches a round held back by a consent or safety gate, after the
    /// human acknowledged it. No-op when nothing is pending.
    pub async fn acknowledge(&mut self) -> Result<(), AgentError> {
        if self.dispatched {
            return Ok(());
        }
        self.dispatch_round().await
    }

    fn gate_satisfied(&self) -> bool {
        self.autoplay || (!self.requires_consent && self.pending_safety_checks.is_empty())
    }

    async fn dispatch_round(&mut self) -> Result<(), AgentError> {
        self.state = AgentState::ExecutingActions;
        // Strictly sequential; each call is awaited before the next starts.
        for call in &self.round_calls {
            info!(call_id = %call.call_id, action = ?call.action, "executing action");
            self.executor.execute(&call.action).await?;
            self.executed.push(ExecutedCall {
                call_id: call.call_id.clone(),
                acknowledged_safety_checks: call.safety_checks.clone(),
            });
        }
        self.dispatched = true;
        self.state = if self.requires_user_input {
            AgentState::AwaitingUserInput
        } else {
            AgentState::TaskStarted
        };
        Ok(())
    }
}

fn safety_message(check: &Value) -> String {
    check
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| check.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cua::StepResponse;
    use crate::surface::testing::{RecordingSurface, SurfaceCall};
    use crate::surface::SurfaceInfo;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays canned responses and records each conversation it was sent.
    struct ScriptedProvider {
        responses: Mutex<VecDeque<StepResponse>>,
        conversations: Arc<Mutex<Vec<Vec<Value>>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<StepResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                conversations: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn step(
            &self,
            conversation: &[Value],
            _display: SurfaceInfo,
        ) -> Result<StepResponse> {
            self.conversations.lock().unwrap().push(conversation.to_vec());
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted"))
        }
    }

    fn call(call_id: &str, action: crate::executor::Action) -> ProposedCall {
        ProposedCall {
            call_id: call_id.into(),
            action,
            safety_checks: Vec::new(),
        }
    }

    fn click_and_type_response() -> StepResponse {
        StepResponse {
            items: vec![json!({"type": "computer_call", "call_id": "call_1"})],
            calls: vec![
                call("call_1", crate::executor::Action::Click {
                    x: 400,
                    y: 300,
                    button: "left".into(),
                }),
                call("call_2", crate::executor::Action::Type {
                    text: "microsoft.com".into(),
                }),
            ],
            reasoning_summary: "Open the browser and type the address".into(),
            messages: Vec::new(),
        }
    }

    fn agent_with(
        responses: Vec<StepResponse>,
        autoplay: bool,
    ) -> Agent<ScriptedProvider, RecordingSurface> {
        let provider = ScriptedProvider::new(responses);
        let executor = Executor::new(RecordingSurface::new(1024, 768));
        Agent::new(provider, executor, autoplay)
    }

    #[tokio::test]
    async fn end_to_end_click_then_type() {
        let mut agent = agent_with(vec![click_and_type_response()], true);
        agent.start_task();
        agent
            .continue_task("Open web browser and go to microsoft.com.")
            .await
            .unwrap();

        let inputs = agent.executor.surface().input_calls();
        assert_eq!(
            inputs,
            vec![
                SurfaceCall::Click { x: 400, y: 300, button: "left".into() },
                SurfaceCall::Type { text: "microsoft.com".into() },
            ]
        );
        assert_eq!(agent.reasoning_summary, "Open the browser and type the address");
        assert!(agent.requires_consent);
        assert!(!agent.requires_user_input);
        assert_eq!(agent.state(), AgentState::TaskStarted);
    }

    #[tokio::test]
    async fn safety_gate_blocks_dispatch_until_acknowledged() {
        let mut response = click_and_type_response();
        response.calls.truncate(1);
        response.calls[0].safety_checks =
            vec![json!({"id": "sc_1", "code": "malicious_instructions", "message": "Review this"})];
        let mut agent = agent_with(vec![response], false);
        agent.start_task();
        agent.continue_task("do the thing").await.unwrap();

        assert_eq!(agent.pending_safety_checks, vec!["Review this"]);
        assert!(agent.executor.surface().input_calls().is_empty());
        assert_eq!(agent.state(), AgentState::AwaitingUserInput);

        agent.acknowledge().await.unwrap();
        assert_eq!(agent.executor.surface().input_calls().len(), 1);
    }

    #[tokio::test]
    async fn consent_gate_blocks_without_autoplay() {
        let mut agent = agent_with(vec![click_and_type_response()], false);
        agent.start_task();
        agent.continue_task("go").await.unwrap();
        assert!(agent.requires_consent);
        assert!(agent.executor.surface().input_calls().is_empty());
        agent.acknowledge().await.unwrap();
        assert_eq!(agent.executor.surface().input_calls().len(), 2);
        // a second acknowledge must not re-dispatch
        agent.acknowledge().await.unwrap();
        assert_eq!(agent.executor.surface().input_calls().len(), 2);
    }

    #[tokio::test]
    async fn autoplay_bypasses_safety_gate() {
        let mut response = click_and_type_response();
        response.calls[0].safety_checks = vec![json!({"message": "Review this"})];
        let mut agent = agent_with(vec![response], true);
        agent.start_task();
        agent.continue_task("go").await.unwrap();
        assert_eq!(agent.executor.surface().input_calls().len(), 2);
    }

    #[tokio::test]
    async fn message_only_response_requires_user_input() {
        let response = StepResponse {
            messages: vec!["Which account should I use?".into()],
            ..Default::default()
        };
        let mut agent = agent_with(vec![response], true);
        agent.start_task();
        agent.continue_task("log in").await.unwrap();
        assert!(agent.requires_user_input);
        assert!(!agent.requires_consent);
        assert_eq!(agent.state(), AgentState::AwaitingUserInput);
        assert!(agent.executor.surface().input_calls().is_empty());
    }

    #[tokio::test]
    async fn call_outputs_are_folded_into_next_round() {
        let second = StepResponse::default();
        let mut first = click_and_type_response();
        first.calls.truncate(1);
        first.calls[0].safety_checks = vec![json!({"message": "Review this"})];
        let mut agent = agent_with(vec![first, second], true);
        agent.start_task();
        agent.continue_task("go").await.unwrap();
        let conversations = agent.provider.conversations.clone();
        agent.continue_task("").await.unwrap();

        let convs = conversations.lock().unwrap();
        // first round: user text turn + screenshot image turn
        assert_eq!(convs[0][0]["role"], "user");
        assert_eq!(convs[0][1]["content"][0]["type"], "input_image");
        // second round: output for call_1 with the acknowledged checks echoed
        let output = convs[1]
            .iter()
            .find(|item| item["type"] == "computer_call_output")
            .expect("no computer_call_output");
        assert_eq!(output["call_id"], "call_1");
        assert_eq!(output["acknowledged_safety_checks"][0]["message"], "Review this");
        assert!(output["output"]["image_url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn start_task_resets_conversation() {
        let responses = vec![click_and_type_response(), StepResponse::default()];
        let mut agent = agent_with(responses, true);
        agent.start_task();
        agent.continue_task("first task").await.unwrap();
        agent.start_task();
        assert_eq!(agent.state(), AgentState::TaskStarted);
        assert!(agent.actions().is_empty());
        agent.continue_task("second task").await.unwrap();
        let convs = agent.provider.conversations.lock().unwrap();
        // the second round's conversation starts over: text turn + screenshot
        assert_eq!(convs[1].len(), 2);
        assert_eq!(convs[1][0]["content"][0]["text"], "second task");
    }
}
