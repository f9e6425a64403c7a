/// Deterministic failure produced by a scripted dependency.
#[derive(Debug, thiserror::Error)]
#[error("Scripted dependency failure.")]
pub struct ScriptedError;
