use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),
    #[error("scheme '{scheme}': unknown override key '{key}'")]
    UnknownOverrideKey { scheme: String, key: String },
    #[error("scheme '{scheme}': override '{key}' expects {expected}, got {found}")]
    OverrideType {
        scheme: String,
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid target link '{0}' (expected uplink or downlink)")]
    TargetLink(String),
    #[error("invalid wait directive '{0}': expected 'wait <positive seconds>'")]
    WaitDirective(String),
    #[error("scheme '{0}' has no run command")]
    MissingRunCommand(String),
    #[error("base configuration '{base}' unavailable at {}: {reason}", path.display())]
    BaseUnavailable {
        base: String,
        path: PathBuf,
        reason: String,
    },
}

/// Side of the emulated link the queue discipline and packet log attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetLink {
    #[default]
    Uplink,
    Downlink,
}

impl TargetLink {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetLink::Uplink => "uplink",
            TargetLink::Downlink => "downlink",
        }
    }
}

impl FromStr for TargetLink {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uplink" => Ok(TargetLink::Uplink),
            "downlink" => Ok(TargetLink::Downlink),
            other => Err(ConfigError::TargetLink(other.to_string())),
        }
    }
}

/// One entry of a command list: either a process to start or a pause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStep {
    Spawn(String),
    Wait(Duration),
}

impl CommandStep {
    /// Classifies a configured command line. Blank lines yield `None`.
    ///
    /// `wait N` is the pause directive; `sleep N` is accepted as the older
    /// spelling found in existing scheme files. Any other `sleep` invocation
    /// is an ordinary command.
    pub fn parse(raw: &str) -> Result<Option<CommandStep>, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        match tokens.as_slice() {
            ["wait", rest @ ..] => match rest {
                [secs] => positive_seconds(secs)
                    .map(|d| Some(CommandStep::Wait(d)))
                    .ok_or_else(|| ConfigError::WaitDirective(trimmed.to_string())),
                _ => Err(ConfigError::WaitDirective(trimmed.to_string())),
            },
            ["sleep", secs] => Ok(Some(match positive_seconds(secs) {
                Some(d) => CommandStep::Wait(d),
                None => CommandStep::Spawn(trimmed.to_string()),
            })),
            _ => Ok(Some(CommandStep::Spawn(trimmed.to_string()))),
        }
    }
}

fn positive_seconds(token: &str) -> Option<Duration> {
    match token.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => None,
    }
}

impl fmt::Display for CommandStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStep::Spawn(cmd) => f.write_str(cmd),
            CommandStep::Wait(d) => write!(f, "wait {}", d.as_secs()),
        }
    }
}

/// Base scheme record as stored on disk (`<dir>/<base>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeRecord {
    pub name: String,
    #[serde(default)]
    pub target_link: TargetLink,
    #[serde(default)]
    pub uplink_queue: String,
    #[serde(default)]
    pub uplink_queue_args: String,
    #[serde(default)]
    pub prep_commands: Vec<String>,
    #[serde(default)]
    pub cleanup_commands: Vec<String>,
    pub mahimahi_command: String,
}

impl SchemeRecord {
    fn apply_override(&mut self, scheme: &str, key: &str, value: &Value) -> Result<(), ConfigError> {
        let type_err = |expected: &'static str| ConfigError::OverrideType {
            scheme: scheme.to_string(),
            key: key.to_string(),
            expected,
            found: value_type_name(value),
        };
        match key {
            "name" => self.name = string_value(value).ok_or_else(|| type_err("string"))?,
            "target_link" => {
                let raw = string_value(value).ok_or_else(|| type_err("string"))?;
                self.target_link = raw.parse()?;
            }
            "uplink_queue" => {
                self.uplink_queue = string_value(value).ok_or_else(|| type_err("string"))?
            }
            "uplink_queue_args" => {
                self.uplink_queue_args = string_value(value).ok_or_else(|| type_err("string"))?
            }
            "mahimahi_command" => {
                self.mahimahi_command = string_value(value).ok_or_else(|| type_err("string"))?
            }
            "prep_commands" => {
                self.prep_commands = string_list(value).ok_or_else(|| type_err("array of strings"))?
            }
            "cleanup_commands" => {
                self.cleanup_commands =
                    string_list(value).ok_or_else(|| type_err("array of strings"))?
            }
            _ => {
                return Err(ConfigError::UnknownOverrideKey {
                    scheme: scheme.to_string(),
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }
}

fn string_value(value: &Value) -> Option<String> {
    value.as_str().map(|s| s.to_string())
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Fully resolved, immutable description of one scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    name: String,
    target_link: TargetLink,
    queue_kind: String,
    queue_args: String,
    prep_commands: Vec<CommandStep>,
    run_command: String,
    cleanup_commands: Vec<CommandStep>,
}

impl ProtocolConfig {
    /// Applies `overrides` to `base` once and freezes the result.
    pub fn from_record(
        scheme: &str,
        mut base: SchemeRecord,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Self, ConfigError> {
        for (key, value) in overrides {
            base.apply_override(scheme, key, value)?;
        }
        let run_command = base.mahimahi_command.trim().to_string();
        if run_command.is_empty() {
            return Err(ConfigError::MissingRunCommand(scheme.to_string()));
        }
        Ok(Self {
            name: base.name,
            target_link: base.target_link,
            queue_kind: base.uplink_queue,
            queue_args: base.uplink_queue_args,
            prep_commands: parse_steps(&base.prep_commands)?,
            run_command,
            cleanup_commands: parse_steps(&base.cleanup_commands)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_link(&self) -> TargetLink {
        self.target_link
    }

    pub fn queue_kind(&self) -> &str {
        &self.queue_kind
    }

    pub fn queue_args(&self) -> &str {
        &self.queue_args
    }

    pub fn prep_commands(&self) -> &[CommandStep] {
        &self.prep_commands
    }

    pub fn run_command(&self) -> &str {
        &self.run_command
    }

    pub fn cleanup_commands(&self) -> &[CommandStep] {
        &self.cleanup_commands
    }
}

fn parse_steps(raw: &[String]) -> Result<Vec<CommandStep>, ConfigError> {
    let mut steps = Vec::new();
    for line in raw {
        if let Some(step) = CommandStep::parse(line)? {
            steps.push(step);
        }
    }
    Ok(steps)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeEntry {
    pub base: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
}

impl SchemeEntry {
    fn base(base: &str) -> Self {
        Self {
            base: base.to_string(),
            overrides: BTreeMap::new(),
        }
    }

    fn derived(base: &str, overrides: Value) -> Self {
        let overrides = match overrides {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        Self {
            base: base.to_string(),
            overrides,
        }
    }
}

/// Maps scheme names to a base record plus the overrides layered on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeCatalog {
    pub schemes: BTreeMap<String, SchemeEntry>,
}

impl SchemeCatalog {
    pub fn builtin() -> Self {
        let mut schemes = BTreeMap::new();
        for base in ["abc", "copa", "cubic", "ledbat", "pcc", "quic", "sprout", "verus"] {
            schemes.insert(base.to_string(), SchemeEntry::base(base));
        }
        schemes.insert(
            "vegas".to_string(),
            SchemeEntry::derived(
                "cubic",
                json!({"name": "vegas", "mahimahi_command": "sh ~/ABC-1/start_tcp.sh vegas"}),
            ),
        );
        schemes.insert(
            "bbr".to_string(),
            SchemeEntry::derived(
                "cubic",
                json!({"name": "bbr", "mahimahi_command": "sh ~/ABC-1/start_tcp.sh bbr"}),
            ),
        );
        schemes.insert(
            "cubiccodel".to_string(),
            SchemeEntry::derived(
                "cubic",
                json!({
                    "name": "cubiccodel",
                    "uplink_queue": "codel",
                    "uplink_queue_args": "packets=100,target=50,interval=100"
                }),
            ),
        );
        schemes.insert(
            "cubicpie".to_string(),
            SchemeEntry::derived(
                "cubic",
                json!({
                    "name": "cubicpie",
                    "uplink_queue": "pie",
                    "uplink_queue_args": "packets=100,qdelay_ref=50,max_burst=100"
                }),
            ),
        );
        Self { schemes }
    }

    /// Loads a YAML catalog (`schemes: {name: {base, overrides}}`).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read scheme catalog {}", path.display()))?;
        let catalog: SchemeCatalog = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse scheme catalog {}", path.display()))?;
        Ok(catalog)
    }

    pub fn entry(&self, scheme: &str) -> Result<&SchemeEntry, ConfigError> {
        self.schemes
            .get(scheme)
            .ok_or_else(|| ConfigError::UnknownScheme(scheme.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemes.keys().map(|s| s.as_str())
    }
}

/// Source of base scheme records.
pub trait BaseConfigStore {
    fn load_base(&self, base: &str) -> Result<SchemeRecord, ConfigError>;
}

/// Reads `<dir>/<base>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, base: &str) -> PathBuf {
        self.dir.join(format!("{}.json", base))
    }
}

impl BaseConfigStore for DirectoryStore {
    fn load_base(&self, base: &str) -> Result<SchemeRecord, ConfigError> {
        let path = self.path_for(base);
        let unavailable = |reason: String| ConfigError::BaseUnavailable {
            base: base.to_string(),
            path: path.clone(),
            reason,
        };
        let raw = fs::read_to_string(&path).map_err(|e| unavailable(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| unavailable(e.to_string()))
    }
}

impl BaseConfigStore for BTreeMap<String, SchemeRecord> {
    fn load_base(&self, base: &str) -> Result<SchemeRecord, ConfigError> {
        self.get(base)
            .cloned()
            .ok_or_else(|| ConfigError::BaseUnavailable {
                base: base.to_string(),
                path: PathBuf::from(base),
                reason: "not in store".to_string(),
            })
    }
}

pub struct ProtocolResolver<'a, S> {
    catalog: &'a SchemeCatalog,
    store: &'a S,
}

impl<'a, S: BaseConfigStore> ProtocolResolver<'a, S> {
    pub fn new(catalog: &'a SchemeCatalog, store: &'a S) -> Self {
        Self { catalog, store }
    }

    pub fn catalog(&self) -> &SchemeCatalog {
        self.catalog
    }

    pub fn resolve(&self, scheme: &str) -> Result<ProtocolConfig, ConfigError> {
        let entry = self.catalog.entry(scheme)?;
        let base = self.store.load_base(&entry.base)?;
        ProtocolConfig::from_record(scheme, base, &entry.overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn cubic_record() -> SchemeRecord {
        SchemeRecord {
            name: "cubic".to_string(),
            target_link: TargetLink::Uplink,
            uplink_queue: "droptail".to_string(),
            uplink_queue_args: "packets=100".to_string(),
            prep_commands: vec!["iperf -s -p 42425 -w 16m &".to_string(), "sleep 1".to_string()],
            cleanup_commands: vec!["killall iperf".to_string()],
            mahimahi_command: "sh ~/ABC-1/start_tcp.sh cubic".to_string(),
        }
    }

    fn store() -> BTreeMap<String, SchemeRecord> {
        let mut store = BTreeMap::new();
        store.insert("cubic".to_string(), cubic_record());
        store
    }

    #[test]
    fn derived_scheme_overrides_base_fields() {
        let catalog = SchemeCatalog::builtin();
        let store = store();
        let resolver = ProtocolResolver::new(&catalog, &store);

        let vegas = resolver.resolve("vegas").expect("vegas resolves");
        assert_eq!(vegas.name(), "vegas");
        assert_eq!(vegas.run_command(), "sh ~/ABC-1/start_tcp.sh vegas");
        assert_eq!(vegas.queue_kind(), "droptail");

        let pie = resolver.resolve("cubicpie").expect("cubicpie resolves");
        assert_eq!(pie.queue_kind(), "pie");
        assert_eq!(pie.queue_args(), "packets=100,qdelay_ref=50,max_burst=100");
        assert_eq!(pie.run_command(), "sh ~/ABC-1/start_tcp.sh cubic");
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let catalog = SchemeCatalog::builtin();
        let store = store();
        let err = ProtocolResolver::new(&catalog, &store)
            .resolve("reno")
            .expect_err("unknown");
        assert!(matches!(err, ConfigError::UnknownScheme(s) if s == "reno"));
    }

    #[test]
    fn unknown_override_key_is_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert("uplink_queu".to_string(), json!("codel"));
        let err = ProtocolConfig::from_record("typo", cubic_record(), &overrides)
            .expect_err("unknown key");
        assert!(matches!(err, ConfigError::UnknownOverrideKey { key, .. } if key == "uplink_queu"));
    }

    #[test]
    fn override_type_is_checked() {
        let mut overrides = BTreeMap::new();
        overrides.insert("prep_commands".to_string(), json!("iperf -s &"));
        let err = ProtocolConfig::from_record("x", cubic_record(), &overrides)
            .expect_err("wrong type");
        assert!(err.to_string().contains("array of strings"), "{}", err);
    }

    #[test]
    fn target_link_override_parses() {
        let mut overrides = BTreeMap::new();
        overrides.insert("target_link".to_string(), json!("downlink"));
        let config = ProtocolConfig::from_record("x", cubic_record(), &overrides).expect("ok");
        assert_eq!(config.target_link(), TargetLink::Downlink);
    }

    #[test]
    fn wait_directives_are_classified_up_front() {
        let config =
            ProtocolConfig::from_record("cubic", cubic_record(), &BTreeMap::new()).expect("ok");
        assert_eq!(
            config.prep_commands(),
            &[
                CommandStep::Spawn("iperf -s -p 42425 -w 16m &".to_string()),
                CommandStep::Wait(Duration::from_secs(1)),
            ]
        );
    }

    #[test]
    fn command_step_parsing() {
        assert_eq!(CommandStep::parse("   ").unwrap(), None);
        assert_eq!(
            CommandStep::parse("wait 3").unwrap(),
            Some(CommandStep::Wait(Duration::from_secs(3)))
        );
        assert_eq!(
            CommandStep::parse("sleep 0.5").unwrap(),
            Some(CommandStep::Spawn("sleep 0.5".to_string()))
        );
        assert!(CommandStep::parse("wait 0").is_err());
        assert!(CommandStep::parse("wait soon").is_err());
        assert!(CommandStep::parse("wait").is_err());
        assert_eq!(CommandStep::Wait(Duration::from_secs(2)).to_string(), "wait 2");
    }

    #[test]
    fn missing_run_command_is_rejected() {
        let mut record = cubic_record();
        record.mahimahi_command = "  ".to_string();
        let err = ProtocolConfig::from_record("cubic", record, &BTreeMap::new()).expect_err("empty");
        assert!(matches!(err, ConfigError::MissingRunCommand(_)));
    }

    #[test]
    fn catalog_loads_from_yaml() {
        let dir = crate::testing::scratch_dir("catalog");
        let path = dir.join("schemes.yaml");
        fs::write(
            &path,
            "schemes:\n  cubic:\n    base: cubic\n  reno:\n    base: cubic\n    overrides:\n      name: reno\n      mahimahi_command: sh start_tcp.sh reno\n",
        )
        .expect("write catalog");
        let catalog = SchemeCatalog::load(&path).expect("load");
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["cubic", "reno"]);

        let store = store();
        let reno = ProtocolResolver::new(&catalog, &store)
            .resolve("reno")
            .expect("reno");
        assert_eq!(reno.run_command(), "sh start_tcp.sh reno");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn directory_store_reads_json_records() {
        let dir = crate::testing::scratch_dir("store");
        fs::write(
            dir.join("abc.json"),
            r#"{"name": "abc", "uplink_queue": "cellular", "uplink_queue_args": "packets=100,qdelay_ref=50,beta=75",
                "prep_commands": ["python server.py &"], "cleanup_commands": ["pkill -f server.py"],
                "mahimahi_command": "python client.py"}"#,
        )
        .expect("write record");
        let store = DirectoryStore::new(&dir);
        let record = store.load_base("abc").expect("abc");
        assert_eq!(record.target_link, TargetLink::Uplink);
        assert_eq!(record.uplink_queue, "cellular");

        let err = store.load_base("sprout").expect_err("missing");
        assert!(matches!(err, ConfigError::BaseUnavailable { .. }));
        let _ = fs::remove_dir_all(dir);
    }
}
