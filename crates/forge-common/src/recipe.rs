// Declarative build recipes as they appear under `JOB_COMMAND_<id>` keys
// in the master configuration. A recipe is either a single Build or a
// BuildSet (several builds plus a merge step).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::macros::{expand, normalize_separators, MacroSpecs};

/// One build step: a command list and the path of its expected output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub cmd: Vec<String>,
    pub output: String,
}

impl Build {
    /// Substitute macros and normalize path separators in place.
    pub fn preprocess(&mut self, specs: &MacroSpecs) {
        self.cmd = self
            .cmd
            .iter()
            .map(|c| normalize_separators(&expand(c, specs)))
            .collect();
        self.output = normalize_separators(&expand(&self.output, specs));
    }

    /// File name component of the output path.
    pub fn output_file_name(&self) -> &str {
        self.output.rsplit('/').next().unwrap_or(&self.output)
    }
}

/// Several named builds whose outputs feed one merge step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSet {
    /// Builds keyed by ident; iteration order (and therefore task order)
    /// follows the ident ordering.
    #[serde(rename = "Builds")]
    pub builds: BTreeMap<String, Build>,
    #[serde(rename = "Merge")]
    pub merge: Build,
}

/// A `JOB_COMMAND_<id>` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipe {
    Set(BuildSet),
    Build(Build),
}
