use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::fsio::atomic_write;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("yaml path '{0}' not navigable")]
    PathNotFound(String),
}

/// Phases of the trading pipeline; each consolidates parameters from one or
/// more configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    MarketSelection,
    StrikeSelection,
    Scoring,
    Exit,
    Portfolio,
}

impl PipelinePhase {
    pub const ALL: [PipelinePhase; 5] = [
        PipelinePhase::MarketSelection,
        PipelinePhase::StrikeSelection,
        PipelinePhase::Scoring,
        PipelinePhase::Exit,
        PipelinePhase::Portfolio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelinePhase::MarketSelection => "market_selection",
            PipelinePhase::StrikeSelection => "strike_selection",
            PipelinePhase::Scoring => "scoring",
            PipelinePhase::Exit => "exit",
            PipelinePhase::Portfolio => "portfolio",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == name)
    }
}

/// Where a parameter lives: the file and the YAML path inside it, so an
/// update can be written back to the right place.
#[derive(Debug, Clone)]
pub struct ParameterSource {
    pub file_path: PathBuf,
    pub yaml_path: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseParameters {
    parameters: BTreeMap<String, ParameterSource>,
}

impl PhaseParameters {
    pub fn add(&mut self, name: impl Into<String>, source: ParameterSource) {
        self.parameters.insert(name.into(), source);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSource> {
        self.parameters.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterSource)> {
        self.parameters.iter()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// One strategy's parameters across all pipeline phases.
#[derive(Debug, Clone)]
pub struct StrategyParameters {
    pub strategy_key: String,
    pub strategy_name: String,
    phases: BTreeMap<PipelinePhase, PhaseParameters>,
}

impl StrategyParameters {
    fn new(strategy_key: &str, strategy_name: String) -> Self {
        Self {
            strategy_key: strategy_key.to_string(),
            strategy_name,
            phases: BTreeMap::new(),
        }
    }

    pub fn phase(&self, phase: PipelinePhase) -> Option<&PhaseParameters> {
        self.phases.get(&phase)
    }

    fn phase_mut(&mut self, phase: PipelinePhase) -> &mut PhaseParameters {
        self.phases.entry(phase).or_default()
    }

    pub fn all_parameters(&self) -> impl Iterator<Item = (PipelinePhase, &String, &ParameterSource)> {
        self.phases
            .iter()
            .flat_map(|(phase, params)| params.iter().map(move |(n, s)| (*phase, n, s)))
    }
}

/// Strategies the pipeline configuration knows about.
pub const STRATEGIES: [&str; 8] = [
    "iron_condor",
    "atm_iron_butterfly",
    "short_put_spread",
    "short_call_spread",
    "naked_put",
    "calendar",
    "ratio_spread",
    "backspread_put",
];

/// Consolidates parameters scattered across the pipeline's YAML files into a
/// single strategy → phase view, remembering the originating file and YAML
/// path of every leaf so updates write back to the correct source.
///
/// Updates are transactional per parameter: the in-memory change is rolled
/// back if the file write fails. File rewrites go through the atomic
/// temp-and-rename path.
pub struct ParameterRegistry {
    file_paths: BTreeMap<&'static str, PathBuf>,
    strategies: BTreeMap<String, StrategyParameters>,
}

impl ParameterRegistry {
    /// Load all configuration files under `base_path`. Missing files are
    /// logged and contribute nothing.
    pub fn load(base_path: &Path) -> Self {
        let mut file_paths = BTreeMap::new();
        file_paths.insert("criteria", base_path.join("criteria.yaml"));
        file_paths.insert("volatility_rules", base_path.join("volatility_rules.yaml"));
        file_paths.insert(
            "strike_selection",
            base_path.join("strike_selection_rules.yaml"),
        );
        file_paths.insert("strategies", base_path.join("strategies.yaml"));
        file_paths.insert("backtest", base_path.join("backtest.yaml"));

        let criteria = load_yaml(&file_paths["criteria"]);
        let vol_rules = load_yaml(&file_paths["volatility_rules"]);
        let strike_rules = load_yaml(&file_paths["strike_selection"]);
        let strategies_file = load_yaml(&file_paths["strategies"]);
        let backtest = load_yaml(&file_paths["backtest"]);

        let mut strategies = BTreeMap::new();
        for key in STRATEGIES {
            let config = build_strategy(
                key,
                &file_paths,
                criteria.as_ref(),
                vol_rules.as_ref(),
                strike_rules.as_ref(),
                strategies_file.as_ref(),
                backtest.as_ref(),
            );
            strategies.insert(key.to_string(), config);
        }

        Self {
            file_paths,
            strategies,
        }
    }

    pub fn strategy(&self, key: &str) -> Option<&StrategyParameters> {
        self.strategies.get(key)
    }

    pub fn list_strategies(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }

    pub fn file_path(&self, key: &str) -> Option<&PathBuf> {
        self.file_paths.get(key)
    }

    /// Update one parameter and write it back to its source file. Returns
    /// `true` on success; on write failure the in-memory value is restored.
    pub fn update_parameter(
        &mut self,
        strategy_key: &str,
        phase: PipelinePhase,
        param_name: &str,
        new_value: Value,
    ) -> bool {
        let Some(strategy) = self.strategies.get_mut(strategy_key) else {
            return false;
        };
        let Some(source) = strategy.phase_mut(phase).parameters.get_mut(param_name) else {
            return false;
        };

        let old_value = std::mem::replace(&mut source.value, new_value.clone());
        let file_path = source.file_path.clone();
        let yaml_path = source.yaml_path.clone();

        match write_parameter(&file_path, &yaml_path, &new_value) {
            Ok(()) => {
                tracing::info!(
                    parameter = param_name,
                    file = %file_path.display(),
                    "parameter updated"
                );
                true
            }
            Err(err) => {
                tracing::error!(parameter = param_name, %err, "parameter write failed, rolling back");
                // Rollback the in-memory change.
                if let Some(source) = self
                    .strategies
                    .get_mut(strategy_key)
                    .and_then(|s| s.phases.get_mut(&phase))
                    .and_then(|p| p.parameters.get_mut(param_name))
                {
                    source.value = old_value;
                }
                false
            }
        }
    }

    /// Discard in-memory state and reload from disk.
    pub fn reload(&mut self, base_path: &Path) {
        *self = Self::load(base_path);
    }
}

fn load_yaml(path: &Path) -> Option<Value> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found");
            return None;
        }
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "failed to read config file");
            return None;
        }
    };
    match serde_yaml::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "failed to parse config file");
            None
        }
    }
}

#[allow(clippy::too_many_lines)]
fn build_strategy(
    key: &str,
    file_paths: &BTreeMap<&'static str, PathBuf>,
    criteria: Option<&Value>,
    vol_rules: Option<&Value>,
    strike_rules: Option<&Value>,
    strategies_file: Option<&Value>,
    backtest: Option<&Value>,
) -> StrategyParameters {
    // Volatility rules: a list of {key, strategy, greeks, criteria: [...]}.
    let vol_rule = vol_rules
        .and_then(Value::as_sequence)
        .and_then(|rules| {
            rules.iter().find(|rule| {
                rule.get("key").and_then(Value::as_str) == Some(key)
            })
        });

    let display_name = vol_rule
        .and_then(|r| r.get("strategy"))
        .and_then(Value::as_str)
        .map_or_else(|| title_case(key), ToString::to_string);

    let mut config = StrategyParameters::new(key, display_name);

    // Phase 1: market selection from volatility_rules.yaml.
    if let Some(criteria_list) = vol_rule
        .and_then(|r| r.get("criteria"))
        .and_then(Value::as_sequence)
    {
        let phase = config.phase_mut(PipelinePhase::MarketSelection);
        for (i, criterion) in criteria_list.iter().enumerate() {
            phase.add(
                format!("criterion_{}", i + 1),
                ParameterSource {
                    file_path: file_paths["volatility_rules"].clone(),
                    yaml_path: format!("{key}.criteria[{i}]"),
                    value: criterion.clone(),
                },
            );
        }
    }

    // Phase 2: strike selection, strategy-specific over defaults.
    if let Some(strike_map) = strike_rules.and_then(Value::as_mapping) {
        let default = strike_map.get("default").and_then(Value::as_mapping);
        let specific = strike_map.get(key).and_then(Value::as_mapping);

        let phase = config.phase_mut(PipelinePhase::StrikeSelection);
        let mut merged: BTreeMap<String, (String, Value)> = BTreeMap::new();
        if let Some(default) = default {
            for (k, v) in default {
                if let Some(name) = k.as_str() {
                    merged.insert(name.to_string(), ("default".to_string(), v.clone()));
                }
            }
        }
        if let Some(specific) = specific {
            for (k, v) in specific {
                if let Some(name) = k.as_str() {
                    merged.insert(name.to_string(), (key.to_string(), v.clone()));
                }
            }
        }
        for (name, (section, value)) in merged {
            phase.add(
                name.clone(),
                ParameterSource {
                    file_path: file_paths["strike_selection"].clone(),
                    yaml_path: format!("{section}.{name}"),
                    value,
                },
            );
        }
    }

    // Phase 3: scoring weights and per-strategy settings.
    if let Some(strategy_section) = criteria
        .and_then(|c| c.get("strategy"))
        .and_then(Value::as_mapping)
    {
        let phase = config.phase_mut(PipelinePhase::Scoring);
        for (k, v) in strategy_section {
            let Some(name) = k.as_str() else { continue };
            if name.starts_with("score_weight_") || name.ends_with("_pct") {
                phase.add(
                    name,
                    ParameterSource {
                        file_path: file_paths["criteria"].clone(),
                        yaml_path: format!("strategy.{name}"),
                        value: v.clone(),
                    },
                );
            }
        }
    }
    if let Some(strategies_map) = strategies_file.and_then(Value::as_mapping) {
        let default = strategies_map.get("default").and_then(Value::as_mapping);
        let specific = strategies_map
            .get("strategies")
            .and_then(|s| s.get(key))
            .and_then(Value::as_mapping);

        let phase = config.phase_mut(PipelinePhase::Scoring);
        if let Some(default) = default {
            for (k, v) in default {
                if let Some(name) = k.as_str() {
                    phase.add(
                        name,
                        ParameterSource {
                            file_path: file_paths["strategies"].clone(),
                            yaml_path: format!("default.{name}"),
                            value: v.clone(),
                        },
                    );
                }
            }
        }
        if let Some(specific) = specific {
            for (k, v) in specific {
                if let Some(name) = k.as_str() {
                    phase.add(
                        name,
                        ParameterSource {
                            file_path: file_paths["strategies"].clone(),
                            yaml_path: format!("strategies.{key}.{name}"),
                            value: v.clone(),
                        },
                    );
                }
            }
        }
    }

    // Phase 4: exit rules from backtest.yaml.
    if let Some(exit_rules) = backtest
        .and_then(|b| b.get("exit_rules"))
        .and_then(Value::as_mapping)
    {
        let phase = config.phase_mut(PipelinePhase::Exit);
        for (k, v) in exit_rules {
            if v.is_null() {
                continue;
            }
            if let Some(name) = k.as_str() {
                phase.add(
                    format!("bt_{name}"),
                    ParameterSource {
                        file_path: file_paths["backtest"].clone(),
                        yaml_path: format!("exit_rules.{name}"),
                        value: v.clone(),
                    },
                );
            }
        }
    }

    // Phase 5: portfolio gates from criteria.yaml, one nesting level deep.
    if let Some(portfolio) = criteria
        .and_then(|c| c.get("portfolio"))
        .and_then(Value::as_mapping)
    {
        let phase = config.phase_mut(PipelinePhase::Portfolio);
        for (k, v) in portfolio {
            let Some(name) = k.as_str() else { continue };
            if let Some(nested) = v.as_mapping() {
                for (sub_k, sub_v) in nested {
                    if sub_v.is_null() {
                        continue;
                    }
                    if let Some(sub_name) = sub_k.as_str() {
                        phase.add(
                            format!("{name}_{sub_name}"),
                            ParameterSource {
                                file_path: file_paths["criteria"].clone(),
                                yaml_path: format!("portfolio.{name}.{sub_name}"),
                                value: sub_v.clone(),
                            },
                        );
                    }
                }
            } else if !v.is_null() {
                phase.add(
                    name,
                    ParameterSource {
                        file_path: file_paths["criteria"].clone(),
                        yaml_path: format!("portfolio.{name}"),
                        value: v.clone(),
                    },
                );
            }
        }
    }

    config
}

fn title_case(key: &str) -> String {
    key.split('_')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().collect::<String>() + chars.as_str()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write one value back into a YAML file at `yaml_path`, atomically.
///
/// Path grammar: dot-separated segments, with an optional `[index]` suffix
/// for list items. When the document root is itself a list (volatility
/// rules), the first segment selects the element whose `key` field matches.
fn write_parameter(file_path: &Path, yaml_path: &str, value: &Value) -> Result<(), RegistryError> {
    let raw = std::fs::read_to_string(file_path).map_err(|source| RegistryError::Io {
        path: file_path.to_path_buf(),
        source,
    })?;
    let mut document: Value =
        serde_yaml::from_str(&raw).map_err(|source| RegistryError::Yaml {
            path: file_path.to_path_buf(),
            source,
        })?;

    set_yaml_path(&mut document, yaml_path, value)
        .ok_or_else(|| RegistryError::PathNotFound(yaml_path.to_string()))?;

    let rendered = serde_yaml::to_string(&document).map_err(|source| RegistryError::Yaml {
        path: file_path.to_path_buf(),
        source,
    })?;
    atomic_write(file_path, rendered.as_bytes()).map_err(|source| RegistryError::Io {
        path: file_path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn set_yaml_path(document: &mut Value, yaml_path: &str, value: &Value) -> Option<()> {
    let segments: Vec<&str> = yaml_path.split('.').collect();
    let mut current = document;

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        let (name, index) = parse_segment(segment)?;

        // A list-rooted document: the first segment picks the element whose
        // "key" field matches.
        if i == 0 && current.is_sequence() {
            let sequence = current.as_sequence_mut()?;
            current = sequence
                .iter_mut()
                .find(|item| item.get("key").and_then(Value::as_str) == Some(name))?;
            // The selector segment itself cannot carry an index or be the
            // final target; the value lives in one of the element's fields.
            if index.is_some() || last {
                return None;
            }
            continue;
        }

        match index {
            None => {
                if last {
                    let mapping = current.as_mapping_mut()?;
                    mapping.insert(Value::String((*name).to_string()), value.clone());
                    return Some(());
                }
                let mapping = current.as_mapping_mut()?;
                current = mapping.get_mut(Value::String((*name).to_string()))?;
            }
            Some(idx) => {
                let mapping = current.as_mapping_mut()?;
                let list = mapping
                    .get_mut(Value::String((*name).to_string()))?
                    .as_sequence_mut()?;
                let slot = list.get_mut(idx)?;
                if last {
                    *slot = value.clone();
                    return Some(());
                }
                current = slot;
            }
        }
    }
    None
}

fn parse_segment(segment: &str) -> Option<(&str, Option<usize>)> {
    match segment.find('[') {
        None => Some((segment, None)),
        Some(open) => {
            let close = segment.find(']')?;
            let index = segment.get(open + 1..close)?.parse().ok()?;
            Some((segment.get(..open)?, Some(index)))
        }
    }
}
