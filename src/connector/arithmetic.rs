//! Arithmetic mock backend.
//!
//! A deterministic completion provider answering prompts of the form
//! `Compute <Operation>(<a>, <b>)`. It exists to exercise the dispatch and
//! vetting loop end to end without a real backend: a provider with the exact
//! compute function plays the trusted oracle, while one with a skewed
//! function simulates a weaker model that must fail vetting.

use crate::connector::provider::CompletionProvider;
use crate::error::CompletionError;
use crate::job::RequestSettings;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// The four operations the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOperation {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "Add" => Some(Self::Add),
            "Subtract" => Some(Self::Subtract),
            "Multiply" => Some(Self::Multiply),
            "Divide" => Some(Self::Divide),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Add => "Add",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Divide => "Divide",
        }
    }
}

/// Function computing the result of an operation on two operands.
pub type ComputeFn = Arc<dyn Fn(ArithmeticOperation, i64, i64) -> i64 + Send + Sync>;

fn prompt_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Compute (?P<operation>\w+)\((?P<operand1>-?\d+), (?P<operand2>-?\d+)\)")
            .expect("static pattern compiles")
    })
}

/// Parses and computes arithmetic prompts.
#[derive(Clone)]
pub struct ArithmeticEngine {
    compute: ComputeFn,
}

impl ArithmeticEngine {
    /// Engine backed by the exact arithmetic result.
    pub fn exact() -> Self {
        Self {
            compute: Arc::new(Self::compute),
        }
    }

    /// Engine backed by a custom compute function, e.g. one that is only
    /// correct for some operations.
    pub fn with_compute(compute: ComputeFn) -> Self {
        Self { compute }
    }

    pub fn compute(operation: ArithmeticOperation, operand1: i64, operand2: i64) -> i64 {
        match operation {
            ArithmeticOperation::Add => operand1 + operand2,
            ArithmeticOperation::Subtract => operand1 - operand2,
            ArithmeticOperation::Multiply => operand1 * operand2,
            ArithmeticOperation::Divide => operand1 / operand2,
        }
    }

    /// Writes the prompt for computing an operation on two operands.
    pub fn generate_prompt(
        operation: ArithmeticOperation,
        operand1: i64,
        operand2: i64,
    ) -> String {
        format!("Compute {}({operand1}, {operand2})", operation.name())
    }

    /// Parses a prompt back into its operation and operands.
    pub fn parse_prompt(
        prompt: &str,
    ) -> Result<(ArithmeticOperation, i64, i64), CompletionError> {
        let captures = prompt_pattern()
            .captures(prompt)
            .ok_or_else(|| CompletionError::InvalidRequest("invalid prompt format".to_string()))?;
        let operation = ArithmeticOperation::parse(&captures["operation"]).ok_or_else(|| {
            CompletionError::InvalidRequest(format!(
                "unknown operation '{}'",
                &captures["operation"]
            ))
        })?;
        let operand1: i64 = captures["operand1"].parse().unwrap_or_default();
        let operand2: i64 = captures["operand2"].parse().unwrap_or_default();
        Ok((operation, operand1, operand2))
    }

    /// Runs a prompt through the engine's compute function.
    pub fn run(&self, prompt: &str) -> Result<String, CompletionError> {
        let (operation, operand1, operand2) = Self::parse_prompt(prompt)?;
        Ok((self.compute)(operation, operand1, operand2).to_string())
    }
}

/// [`CompletionProvider`] over an [`ArithmeticEngine`], with optional
/// artificial latency to make duration-based selection observable in tests.
pub struct ArithmeticProvider {
    engine: ArithmeticEngine,
    latency: Duration,
}

impl ArithmeticProvider {
    pub fn exact() -> Self {
        Self {
            engine: ArithmeticEngine::exact(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_engine(engine: ArithmeticEngine) -> Self {
        Self {
            engine,
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl CompletionProvider for ArithmeticProvider {
    async fn complete(
        &self,
        prompt: &str,
        _settings: &RequestSettings,
    ) -> Result<String, CompletionError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        // Vetting prompts quote a reference and a candidate answer; judge by
        // recomputing the quoted operation.
        if let Some((inner_prompt, candidate_answer)) = extract_vetting_candidate(prompt) {
            let expected = self.engine.run(&inner_prompt)?;
            let verdict = expected.trim() == candidate_answer.trim();
            return Ok(verdict.to_string());
        }
        self.engine.run(prompt)
    }
}

/// Recognizes the default vetting template and extracts the quoted original
/// prompt and the candidate answer under judgment.
fn extract_vetting_candidate(prompt: &str) -> Option<(String, String)> {
    let pattern = {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        PATTERN.get_or_init(|| {
            Regex::new(
                r"(?s)Instruction:\n(?P<inner>.*?)\n+Reference answer:\n.*?\n+Candidate answer:\n(?P<candidate>.*?)\n+Is the candidate",
            )
            .expect("static pattern compiles")
        })
    };
    let captures = pattern.captures(prompt)?;
    Some((
        captures["inner"].trim().to_string(),
        captures["candidate"].trim().to_string(),
    ))
}
