//! Test support — a scripted [`AgentRunner`] for exercising the
//! executor and feedback engine without a model behind them.
//!
//! Available to this crate's own tests, and to downstream crates via
//! the `test-support` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::agents::{AgentDefinition, AgentOutput, AgentRunner, StubRunner};
use crate::error::CoreError;

/// Scripted runner: per-agent queues of canned results, optional
/// artificial latency, and a call log. An agent with an exhausted (or
/// absent) queue falls through to [`StubRunner`], so scripts only need
/// to cover the interesting steps.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Result<AgentOutput, String>>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one successful run for `agent` returning `payload`.
    pub fn succeed_with(self, agent: &str, payload: Value) -> Self {
        self.enqueue(
            agent,
            Ok(AgentOutput {
                payload: Some(payload),
                model: Some("scripted".into()),
                ..AgentOutput::default()
            }),
        );
        self
    }

    /// Queue one failure for `agent`.
    pub fn fail(self, agent: &str, message: &str) -> Self {
        self.enqueue(agent, Err(message.to_string()));
        self
    }

    /// Queue `count` consecutive failures for `agent`; runs after the
    /// queue drains succeed via the stub fallback.
    pub fn fail_times(self, agent: &str, count: usize, message: &str) -> Self {
        for _ in 0..count {
            self.enqueue(agent, Err(message.to_string()));
        }
        self
    }

    /// Every run of `agent` sleeps this long before settling.
    pub fn delay(self, agent: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.to_string(), delay);
        self
    }

    /// `(agent id, step)` pairs in invocation order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self, agent: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, _)| id == agent)
            .count()
    }

    fn enqueue(&self, agent: &str, result: Result<AgentOutput, String>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(agent.to_string())
            .or_default()
            .push_back(result);
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run_step(
        &self,
        agent: &AgentDefinition,
        step: u32,
        prompt: &str,
    ) -> Result<AgentOutput, CoreError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((agent.id.clone(), step));

        let delay = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent.id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&agent.id)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(CoreError::Internal(message)),
            None => StubRunner.run_step(agent, step, prompt).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripts_pop_in_order_then_fall_back_to_stub() {
        let runner = ScriptedRunner::new()
            .fail("qa", "first run broken")
            .succeed_with("qa", json!({"verdict": "pass"}));
        let qa = AgentDefinition::qa();

        let first = runner.run_step(&qa, 1, "p").await;
        assert!(first.is_err());

        let second = runner.run_step(&qa, 2, "p").await.unwrap();
        assert_eq!(second.payload, Some(json!({"verdict": "pass"})));

        // Queue drained: stub takes over.
        let third = runner.run_step(&qa, 3, "p").await.unwrap();
        assert_eq!(third.model.as_deref(), Some("stub"));
    }

    #[tokio::test]
    async fn test_unscripted_agent_uses_stub_and_calls_are_logged() {
        let runner = ScriptedRunner::new().fail("qa", "broken");
        let pm = AgentDefinition::pm();

        let output = runner.run_step(&pm, 1, "p").await.unwrap();
        assert!(output.payload.is_some());

        assert_eq!(runner.calls(), vec![("pm".to_string(), 1)]);
        assert_eq!(runner.call_count("pm"), 1);
        assert_eq!(runner.call_count("qa"), 0);
    }
}
