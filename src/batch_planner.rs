//! Change-Set Planner (C4).
//!
//! Splits a changeset into token-bounded batches via a deterministic greedy
//! fill, shaped after the teacher's `ChunkConfig`/`chunk_document` pair in
//! `src/chunking.rs`: a `Default`-able, `validate()`-able config struct feeds
//! a pure function that returns ordered, indexed units. Where the teacher
//! chunks a single document by word count, this chunks a *file list* by an
//! estimated token weight, since the assistant subprocess is billed per
//! token rather than per word.
//!
//! No I/O happens here - callers pass in file paths with their byte sizes
//! already known (from the Working-Copy Manager), and `plan_batches` is a
//! pure function safe to unit test without touching disk.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlanConfig {
    /// Token budget per batch, shared across every file's estimated weight
    /// plus the whole-repo context map every batch carries.
    pub max_tokens_per_batch: usize,

    /// Estimated characters per token used to convert a file's byte length
    /// into a token-weight estimate (no real tokenizer is wired in; see
    /// Design Note on the token-weight heuristic).
    pub chars_per_token: f64,

    /// Token weight reserved for the whole-repo context map that every
    /// batch carries alongside its files.
    pub context_map_tokens: usize,
}

impl Default for BatchPlanConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_batch: 100_000,
            chars_per_token: 3.5,
            context_map_tokens: 262_144,
        }
    }
}

impl BatchPlanConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tokens_per_batch == 0 {
            return Err("max_tokens_per_batch must be greater than 0".to_string());
        }
        if self.chars_per_token <= 0.0 {
            return Err("chars_per_token must be greater than 0".to_string());
        }
        if self.context_map_tokens == 0 {
            return Err("context_map_tokens must be greater than 0".to_string());
        }
        Ok(())
    }

    /// The per-batch file budget is `max_tokens_per_batch` alone -
    /// `context_map_tokens` is a separate allowance tagged onto every batch
    /// for the whole-repo context map the assistant builds on its own, not
    /// carved out of the files' share.
    fn file_budget(&self) -> usize {
        self.max_tokens_per_batch
    }
}

/// A single file entering the planner: its repo-relative path and its byte
/// length in the working copy at the target revision.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub path: String,
    pub byte_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedBatch {
    pub index: usize,
    pub files: Vec<String>,
    pub token_weight: usize,
    /// Set when a single file alone exceeds the per-batch budget; it still
    /// gets its own batch rather than being dropped or silently truncated.
    pub oversize: bool,
}

fn token_weight(byte_len: usize, chars_per_token: f64) -> usize {
    ((byte_len as f64) / chars_per_token).ceil() as usize
}

/// Greedy-fill batches in change order (the order `files` is passed in), so
/// flattening the resulting batch plan back out yields the exact input file
/// list - planning never reorders.
pub fn plan_batches(files: &[PlannedFile], config: &BatchPlanConfig) -> Vec<PlannedBatch> {
    let budget = config.file_budget();

    let mut batches = Vec::new();
    let mut current_files: Vec<String> = Vec::new();
    let mut current_weight = 0usize;

    for file in files {
        let weight = token_weight(file.byte_len, config.chars_per_token);

        if weight > budget {
            if !current_files.is_empty() {
                batches.push(PlannedBatch {
                    index: batches.len(),
                    files: std::mem::take(&mut current_files),
                    token_weight: current_weight,
                    oversize: false,
                });
                current_weight = 0;
            }
            batches.push(PlannedBatch {
                index: batches.len(),
                files: vec![file.path.clone()],
                token_weight: weight,
                oversize: true,
            });
            continue;
        }

        if current_weight + weight > budget && !current_files.is_empty() {
            batches.push(PlannedBatch {
                index: batches.len(),
                files: std::mem::take(&mut current_files),
                token_weight: current_weight,
                oversize: false,
            });
            current_weight = 0;
        }

        current_files.push(file.path.clone());
        current_weight += weight;
    }

    if !current_files.is_empty() {
        batches.push(PlannedBatch {
            index: batches.len(),
            files: current_files,
            token_weight: current_weight,
            oversize: false,
        });
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, byte_len: usize) -> PlannedFile {
        PlannedFile {
            path: path.to_string(),
            byte_len,
        }
    }

    #[test]
    fn empty_changeset_produces_no_batches() {
        let config = BatchPlanConfig::default();
        assert!(plan_batches(&[], &config).is_empty());
    }

    #[test]
    fn small_changeset_fits_one_batch() {
        let config = BatchPlanConfig::default();
        let files = vec![file("a.rs", 100), file("b.rs", 200)];
        let batches = plan_batches(&files, &config);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].files, vec!["a.rs".to_string(), "b.rs".to_string()]);
        assert!(!batches[0].oversize);
    }

    #[test]
    fn preserves_change_order_rather_than_sorting() {
        let config = BatchPlanConfig::default();
        let files = vec![file("z.rs", 10), file("a.rs", 10), file("m.rs", 10)];
        let batches = plan_batches(&files, &config);
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].files,
            vec!["z.rs".to_string(), "a.rs".to_string(), "m.rs".to_string()]
        );
    }

    #[test]
    fn oversize_file_gets_its_own_batch() {
        let config = BatchPlanConfig {
            max_tokens_per_batch: 100,
            chars_per_token: 1.0,
            context_map_tokens: 10,
        };
        // budget is 100 tokens; this file alone weighs 500.
        let files = vec![file("huge.rs", 500), file("small.rs", 10)];
        let batches = plan_batches(&files, &config);

        assert_eq!(batches.len(), 2);
        let huge_batch = batches.iter().find(|b| b.files == vec!["huge.rs".to_string()]).unwrap();
        assert!(huge_batch.oversize);
    }

    #[test]
    fn splits_into_multiple_batches_when_budget_exceeded() {
        let config = BatchPlanConfig {
            max_tokens_per_batch: 100,
            chars_per_token: 1.0,
            context_map_tokens: 0,
        };
        let files = vec![file("a.rs", 60), file("b.rs", 60), file("c.rs", 60)];
        let batches = plan_batches(&files, &config);
        assert_eq!(batches.len(), 3);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.index, i);
        }
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = BatchPlanConfig::default();
        config.max_tokens_per_batch = 0;
        assert!(config.validate().is_err());

        let mut config = BatchPlanConfig::default();
        config.context_map_tokens = 0;
        assert!(config.validate().is_err());
    }
}
