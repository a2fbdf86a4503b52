#![forbid(unsafe_code)]

use std::fmt;

use rn_core::TensorId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Policy,
    Kernel,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor: Option<TensorId>,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.push(kind, None, summary.into());
    }

    pub fn record_for(&mut self, kind: EvidenceKind, tensor: TensorId, summary: impl Into<String>) {
        self.push(kind, Some(tensor), summary.into());
    }

    fn push(&mut self, kind: EvidenceKind, tensor: Option<TensorId>, summary: String) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            tensor,
            summary,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failures_for(&self, tensor: TensorId) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.kind == EvidenceKind::Failure && entry.tensor == Some(tensor))
    }

    /// One JSON object per line, in recording order.
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Where per-call kernel generators take their seed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedPolicy {
    #[default]
    Entropy,
    /// Every call seeds a fresh generator with this value; for reproducible tests.
    Fixed(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    pub seed: SeedPolicy,
}

impl RuntimeConfig {
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = SeedPolicy::Fixed(seed);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    config: RuntimeConfig,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("seed policy initialized to {:?}", config.seed),
        );
        Self { config, ledger }
    }

    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    #[must_use]
    pub fn seed_policy(&self) -> SeedPolicy {
        self.config.seed
    }

    pub fn set_seed_policy(&mut self, seed: SeedPolicy) {
        self.config.seed = seed;
        self.ledger.record(
            EvidenceKind::Policy,
            format!("seed policy switched to {seed:?}"),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_kernel_failure<E>(&mut self, op: &str, tensor: TensorId, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record_for(
            EvidenceKind::Failure,
            tensor,
            format!("{op} failed on {tensor}: {error}"),
        );
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
