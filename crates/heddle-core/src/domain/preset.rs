//! Presets: named, fixed stage templates.
//!
//! A preset is a sequence of stages. A stage is either a single task or a
//! fan-out of N sibling tasks. Every task of a stage depends on every task of
//! the previous kept stage, so a stage following a fan-out is a join point
//! with barrier semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::{HeddleError, Result};

pub const DEFAULT_FAN_OUT: u32 = 2;
pub const MAX_FAN_OUT: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Review,
    Implement,
    Debug,
    Research,
    Refactor,
    Security,
}

/// Shape of one stage in a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageShape {
    Single,
    FanOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTemplate {
    pub name: &'static str,
    pub shape: StageShape,
}

const fn single(name: &'static str) -> StageTemplate {
    StageTemplate {
        name,
        shape: StageShape::Single,
    }
}

const fn fan_out(name: &'static str) -> StageTemplate {
    StageTemplate {
        name,
        shape: StageShape::FanOut,
    }
}

const REVIEW: &[StageTemplate] = &[single("scope"), fan_out("review"), single("report")];

const IMPLEMENT: &[StageTemplate] = &[
    single("plan"),
    fan_out("implement"),
    single("integrate"),
    single("verify"),
];

const DEBUG: &[StageTemplate] = &[
    single("reproduce"),
    fan_out("hypothesize"),
    single("fix"),
    single("verify"),
];

const RESEARCH: &[StageTemplate] = &[
    single("frame"),
    fan_out("investigate"),
    single("synthesize"),
];

const REFACTOR: &[StageTemplate] = &[single("analyze"), fan_out("refactor"), single("verify")];

const SECURITY: &[StageTemplate] = &[
    single("threat_model"),
    fan_out("audit"),
    single("triage"),
    fan_out("remediate"),
    single("verify"),
];

impl Preset {
    pub const ALL: [Preset; 6] = [
        Preset::Review,
        Preset::Implement,
        Preset::Debug,
        Preset::Research,
        Preset::Refactor,
        Preset::Security,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Review => "review",
            Preset::Implement => "implement",
            Preset::Debug => "debug",
            Preset::Research => "research",
            Preset::Refactor => "refactor",
            Preset::Security => "security",
        }
    }

    pub fn template(self) -> &'static [StageTemplate] {
        match self {
            Preset::Review => REVIEW,
            Preset::Implement => IMPLEMENT,
            Preset::Debug => DEBUG,
            Preset::Research => RESEARCH,
            Preset::Refactor => REFACTOR,
            Preset::Security => SECURITY,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = HeddleError;

    fn from_str(s: &str) -> Result<Self> {
        Preset::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| HeddleError::InvalidPipeline(format!("unknown preset '{s}'")))
    }
}

/// Caller-supplied knobs for a preset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetParams {
    /// Fan-out width for every fan-out stage (default 2).
    pub width: Option<u32>,

    /// Per-stage fan-out width overrides.
    pub stage_widths: BTreeMap<String, u32>,

    /// Stages to leave out of the run.
    pub skip: BTreeSet<String>,

    /// Retry budget per task (falls back to the configured default).
    pub max_attempts: Option<u32>,

    /// Opaque context copied into every task payload.
    pub context: serde_json::Value,
}

/// A stage after params have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStage {
    pub name: &'static str,
    pub width: u32,
}

impl PresetParams {
    /// Apply params to the preset template.
    ///
    /// Rejects unknown stage names, widths outside `1..=MAX_FAN_OUT`, width
    /// overrides on single stages, and runs with no stage left.
    pub fn resolve(&self, preset: Preset) -> Result<Vec<ResolvedStage>> {
        let template = preset.template();
        let known: BTreeSet<&str> = template.iter().map(|stage| stage.name).collect();

        for name in self.skip.iter().chain(self.stage_widths.keys()) {
            if !known.contains(name.as_str()) {
                return Err(HeddleError::InvalidPipeline(format!(
                    "preset '{preset}' has no stage '{name}'"
                )));
            }
        }

        let default_width = self.width.unwrap_or(DEFAULT_FAN_OUT);
        let mut stages = Vec::with_capacity(template.len());
        for stage in template {
            if self.skip.contains(stage.name) {
                continue;
            }
            let width = match stage.shape {
                StageShape::Single => {
                    if self.stage_widths.contains_key(stage.name) {
                        return Err(HeddleError::InvalidPipeline(format!(
                            "stage '{}' of preset '{preset}' does not fan out",
                            stage.name
                        )));
                    }
                    1
                }
                StageShape::FanOut => self
                    .stage_widths
                    .get(stage.name)
                    .copied()
                    .unwrap_or(default_width),
            };
            if width == 0 || width > MAX_FAN_OUT {
                return Err(HeddleError::InvalidPipeline(format!(
                    "fan-out width {width} for stage '{}' is outside 1..={MAX_FAN_OUT}",
                    stage.name
                )));
            }
            stages.push(ResolvedStage {
                name: stage.name,
                width,
            });
        }

        if stages.is_empty() {
            return Err(HeddleError::InvalidPipeline(format!(
                "every stage of preset '{preset}' was skipped"
            )));
        }
        Ok(stages)
    }
}
