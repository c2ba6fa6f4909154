//! Decoded job results, one variant per [`JobCategory`].
//!
//! The server returns results as raw JSON. Each category owns exactly one
//! decode function; [`JobCategory::decoder`] selects it so a tracked job
//! can bind its decoder at construction time.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::JobCategory;

/// Decode function turning a raw server payload into a typed result.
pub type OutputDecoder = fn(serde_json::Value) -> Result<JobOutput, CoreError>;

/// A successfully decoded job result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JobOutput {
    Fingerprint(FingerprintOutput),
    CompoundClasses(CompoundClassOutput),
    CovarianceTree(CovarianceTreeOutput),
    StructureCandidates(StructureGenerationOutput),
}

impl JobOutput {
    pub fn category(&self) -> JobCategory {
        match self {
            JobOutput::Fingerprint(_) => JobCategory::Fingerprint,
            JobOutput::CompoundClasses(_) => JobCategory::CompoundClass,
            JobOutput::CovarianceTree(_) => JobCategory::CovarianceTree,
            JobOutput::StructureCandidates(_) => JobCategory::StructureGeneration,
        }
    }
}

/// Per-bit posterior probabilities of a predicted molecular fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintOutput {
    pub fingerprint: Vec<f64>,
}

/// Compound-class probabilities (ClassyFire plus optional NPC classes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompoundClassOutput {
    pub compound_classes: Vec<f64>,
    #[serde(default)]
    pub npc_classes: Option<Vec<f64>>,
}

/// Serialized covariance tree for a molecular formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceTreeOutput {
    pub formula: String,
    pub tree: String,
}

/// One generated structure candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureCandidate {
    pub smiles: String,
    pub score: f64,
}

/// Candidates produced by de-novo structure generation, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureGenerationOutput {
    pub candidates: Vec<StructureCandidate>,
}

impl JobCategory {
    /// The decode function for results of this category.
    pub fn decoder(self) -> OutputDecoder {
        match self {
            JobCategory::Fingerprint => decode_fingerprint,
            JobCategory::CompoundClass => decode_compound_classes,
            JobCategory::CovarianceTree => decode_covariance_tree,
            JobCategory::StructureGeneration => decode_structure_candidates,
        }
    }
}

// ---- decoders ----

fn decode_fingerprint(raw: serde_json::Value) -> Result<JobOutput, CoreError> {
    let output: FingerprintOutput = parse(JobCategory::Fingerprint, raw)?;
    validate_probabilities(JobCategory::Fingerprint, &output.fingerprint)?;
    Ok(JobOutput::Fingerprint(output))
}

fn decode_compound_classes(raw: serde_json::Value) -> Result<JobOutput, CoreError> {
    let output: CompoundClassOutput = parse(JobCategory::CompoundClass, raw)?;
    validate_probabilities(JobCategory::CompoundClass, &output.compound_classes)?;
    if let Some(npc) = &output.npc_classes {
        validate_probabilities(JobCategory::CompoundClass, npc)?;
    }
    Ok(JobOutput::CompoundClasses(output))
}

fn decode_covariance_tree(raw: serde_json::Value) -> Result<JobOutput, CoreError> {
    let output: CovarianceTreeOutput = parse(JobCategory::CovarianceTree, raw)?;
    if output.tree.trim().is_empty() {
        return Err(CoreError::Decode {
            category: JobCategory::CovarianceTree,
            message: "empty covariance tree".to_string(),
        });
    }
    Ok(JobOutput::CovarianceTree(output))
}

fn decode_structure_candidates(raw: serde_json::Value) -> Result<JobOutput, CoreError> {
    let mut output: StructureGenerationOutput = parse(JobCategory::StructureGeneration, raw)?;
    output
        .candidates
        .sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(JobOutput::StructureCandidates(output))
}

// ---- private helpers ----

fn parse<T: serde::de::DeserializeOwned>(
    category: JobCategory,
    raw: serde_json::Value,
) -> Result<T, CoreError> {
    serde_json::from_value(raw).map_err(|e| CoreError::Decode {
        category,
        message: e.to_string(),
    })
}

fn validate_probabilities(category: JobCategory, values: &[f64]) -> Result<(), CoreError> {
    match values.iter().position(|p| !(0.0..=1.0).contains(p)) {
        Some(index) => Err(CoreError::Decode {
            category,
            message: format!("probability at index {index} is outside [0, 1]"),
        }),
        None => Ok(()),
    }
}
