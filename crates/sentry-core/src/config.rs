//! Pipeline configuration loaded from YAML.
//!
//! A configuration is a document with top-level `loglevel` and `pipeline`
//! keys; `pipeline` is an ordered array of at least two stage objects, each
//! carrying a `module` name plus the stage's own parameters. C++-style `//`
//! line comments are stripped before parsing.
//!
//! Every stage spec composes the base schema (`module`, optional `loglevel`)
//! with the module's own fields; unknown keys are rejected per stage. Numeric
//! range rules that a schema would express (`exclusiveMinimum` and friends)
//! live in [`StageSpec::validate`]; cross-field rules are checked by the
//! operator constructors.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::SentryError;

/// The role a stage plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Filter,
    Sink,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "Source"),
            Role::Filter => write!(f, "Filter"),
            Role::Sink => write!(f, "Sink"),
        }
    }
}

/// Complete pipeline specification loaded from YAML configuration.
///
/// # Example YAML Configuration
///
/// ```yaml
/// loglevel: INFO
/// pipeline:
///   - module: sources.Historical
///     expression: "bgp.prefix-visibility.*.v4.visible_slash24_cnt"
///     starttime: "2021-03-01"
///     endtime: "2021-03-02"
///     url: "https://api.example.org/ts/query"
///     batchduration: 3600
///   - module: filters.MovingStat
///     type: [median]
///     warmup: 1800
///     history: 86400
///   - module: sinks.AlertKafka
///     fqid: "sentry.test"
///     name: "sentry test"
///     min: 0.5
///     brokers: "localhost:9092"
///     topic: "watchtower-alerts"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    /// Global log level
    #[serde(default)]
    pub loglevel: Option<String>,

    /// Ordered stage list: one source, zero or more filters, one sink
    pub pipeline: Vec<StageSpec>,
}

/// One stage entry, dispatched on its `module` name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "module")]
pub enum StageSpec {
    #[serde(rename = "sources.Realtime")]
    Realtime(RealtimeSpec),
    #[serde(rename = "sources.Historical")]
    Historical(HistoricalSpec),
    #[serde(rename = "sources.JsonIn")]
    JsonIn(JsonInSpec),
    #[serde(rename = "filters.TimeOrder")]
    TimeOrder(TimeOrderSpec),
    #[serde(rename = "filters.TimeOrderChecker")]
    TimeOrderChecker(TimeOrderCheckerSpec),
    #[serde(rename = "filters.Keyfilter")]
    Keyfilter(KeyfilterSpec),
    #[serde(rename = "filters.KeyEntity")]
    KeyEntity(KeyEntitySpec),
    #[serde(rename = "filters.ToSigned")]
    ToSigned(ToSignedSpec),
    #[serde(rename = "filters.AggSum")]
    AggSum(AggSumSpec),
    #[serde(rename = "filters.AggTimeMedian")]
    AggTimeMedian(AggTimeMedianSpec),
    #[serde(rename = "filters.MovingStat")]
    MovingStat(MovingStatSpec),
    #[serde(rename = "sinks.AlertKafka")]
    AlertKafka(AlertKafkaSpec),
    #[serde(rename = "sinks.JsonOut")]
    JsonOut(JsonOutSpec),
}

impl StageSpec {
    /// The dotted module name as it appears in configuration files.
    pub fn module(&self) -> &'static str {
        match self {
            StageSpec::Realtime(_) => "sources.Realtime",
            StageSpec::Historical(_) => "sources.Historical",
            StageSpec::JsonIn(_) => "sources.JsonIn",
            StageSpec::TimeOrder(_) => "filters.TimeOrder",
            StageSpec::TimeOrderChecker(_) => "filters.TimeOrderChecker",
            StageSpec::Keyfilter(_) => "filters.Keyfilter",
            StageSpec::KeyEntity(_) => "filters.KeyEntity",
            StageSpec::ToSigned(_) => "filters.ToSigned",
            StageSpec::AggSum(_) => "filters.AggSum",
            StageSpec::AggTimeMedian(_) => "filters.AggTimeMedian",
            StageSpec::MovingStat(_) => "filters.MovingStat",
            StageSpec::AlertKafka(_) => "sinks.AlertKafka",
            StageSpec::JsonOut(_) => "sinks.JsonOut",
        }
    }

    pub fn role(&self) -> Role {
        match self {
            StageSpec::Realtime(_) | StageSpec::Historical(_) | StageSpec::JsonIn(_) => {
                Role::Source
            }
            StageSpec::AlertKafka(_) | StageSpec::JsonOut(_) => Role::Sink,
            _ => Role::Filter,
        }
    }

    /// Per-stage log level override, if configured.
    pub fn loglevel(&self) -> Option<&str> {
        let level = match self {
            StageSpec::Realtime(s) => &s.loglevel,
            StageSpec::Historical(s) => &s.loglevel,
            StageSpec::JsonIn(s) => &s.loglevel,
            StageSpec::TimeOrder(s) => &s.loglevel,
            StageSpec::TimeOrderChecker(s) => &s.loglevel,
            StageSpec::Keyfilter(s) => &s.loglevel,
            StageSpec::KeyEntity(s) => &s.loglevel,
            StageSpec::ToSigned(s) => &s.loglevel,
            StageSpec::AggSum(s) => &s.loglevel,
            StageSpec::AggTimeMedian(s) => &s.loglevel,
            StageSpec::MovingStat(s) => &s.loglevel,
            StageSpec::AlertKafka(s) => &s.loglevel,
            StageSpec::JsonOut(s) => &s.loglevel,
        };
        level.as_deref()
    }

    /// Range rules a JSON schema would carry as `exclusiveMinimum` and friends.
    pub fn validate(&self) -> Result<(), SentryError> {
        let module = self.module();
        let fail = |msg: String| Err(SentryError::user(format!("module {module}: {msg}")));
        match self {
            StageSpec::Realtime(s) => {
                if s.expressions.is_empty() {
                    return fail("expressions must not be empty".into());
                }
            }
            StageSpec::Historical(s) => {
                if s.batchduration <= 0 {
                    return fail(format!("batchduration ({}) must be > 0", s.batchduration));
                }
            }
            StageSpec::AggSum(s) => {
                if s.expressions.is_empty() {
                    return fail("expressions must not be empty".into());
                }
                if s.timeout <= 0 {
                    return fail(format!("timeout ({}) must be > 0", s.timeout));
                }
                if let Some(g) = s.groupsize {
                    if g == 0 {
                        return fail("groupsize must be > 0".into());
                    }
                }
            }
            StageSpec::AggTimeMedian(s) => {
                if let Some(tb) = s.timebin {
                    if tb <= 60 {
                        return fail(format!("timebin ({tb}) must be > 60"));
                    }
                }
            }
            StageSpec::MovingStat(s) => {
                if s.stat_type.is_empty() {
                    return fail("type must not be empty".into());
                }
                if s.history <= 0 {
                    return fail(format!("history ({}) must be > 0", s.history));
                }
                if s.warmup <= 0 {
                    return fail(format!("warmup ({}) must be > 0", s.warmup));
                }
                if let Some(inp) = &s.inpainting {
                    if let Some(min) = inp.min {
                        if min >= 1.0 {
                            return fail(format!("inpainting.min ({min}) must be < 1"));
                        }
                    }
                    if let Some(max) = inp.max {
                        if max <= 1.0 {
                            return fail(format!("inpainting.max ({max}) must be > 1"));
                        }
                    }
                    if inp.maxduration <= 0 {
                        return fail(format!(
                            "inpainting.maxduration ({}) must be > 0",
                            inp.maxduration
                        ));
                    }
                }
            }
            StageSpec::AlertKafka(s) => {
                if s.min.is_none() && s.max.is_none() {
                    return fail("at least one of min, max is required".into());
                }
                if let Some(min) = s.min {
                    if min >= 1.0 {
                        return fail(format!("min ({min}) must be < 1"));
                    }
                }
                if let Some(max) = s.max {
                    if max <= 1.0 {
                        return fail(format!("max ({max}) must be > 1"));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Live TSK (Time Series Kafka) source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Key-pattern globs; only matching keys enter the pipeline
    pub expressions: Vec<String>,
    /// Comma-separated list of kafka brokers
    pub brokers: String,
    pub consumergroup: String,
    pub topicprefix: String,
    pub channelname: String,
}

/// Historical data source paging an HTTP time-series API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoricalSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Key-pattern glob passed through to the API
    pub expression: String,
    /// Fetch data at or after this time, `YYYY-mm-dd [HH:MM[:SS]]` UTC
    pub starttime: String,
    /// Fetch data before this time
    pub endtime: String,
    pub url: String,
    /// Seconds of data retrieved per API call
    pub batchduration: i64,
    /// Skip null values instead of forwarding them
    #[serde(default)]
    pub ignorenull: bool,
    /// Extra POST parameters for the API
    #[serde(default)]
    pub queryparams: Option<HashMap<String, String>>,
}

/// Newline-delimited `[key, value, time]` JSON source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonInSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Input file name; omitted or `-` means stdin
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeOrderSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Expected time between consecutive data points
    pub interval: i64,
    /// Seconds to wait for new data before force-draining the buffer
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeOrderCheckerSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Treat out-of-order data as an error instead of a log line
    #[serde(default)]
    pub fatal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyfilterSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyEntitySpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    pub expressions: Vec<KeyEntityPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyEntityPattern {
    /// Glob whose capturing group extracts the entity code
    pub pattern: String,
    /// Entity type for series matching this pattern
    pub metatype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToSignedSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggSumSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Globs matched in order; the first match determines the group
    pub expressions: Vec<String>,
    /// Expected number of inputs per group; a full group emits immediately
    #[serde(default)]
    pub groupsize: Option<u32>,
    /// Max seconds to wait for inputs before a group emits anyway
    pub timeout: i64,
    /// Drop incomplete groups on timeout instead of emitting partial sums
    #[serde(default)]
    pub droppartial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggTimeMedianSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Size of the aggregate time bin in seconds, default 300
    #[serde(default)]
    pub timebin: Option<i64>,
    /// Ignore the first (possibly incomplete) bin, default true
    #[serde(default)]
    pub dropfirst: Option<bool>,
}

/// One entry of a `MovingStat` `type` array: a statistic name followed by
/// optional integer parameters, e.g. `[quantile, 1, 4]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeItem {
    Name(String),
    Param(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MovingStatSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Statistic selector: `[mean]`, `[median]`, `[min]`, `[max]`, or
    /// `[quantile, k, q]`
    #[serde(rename = "type")]
    pub stat_type: Vec<TypeItem>,
    /// Seconds of data over which to calculate
    pub history: i64,
    /// Minimum seconds of data to collect before generating output
    pub warmup: i64,
    /// Emit the ratio to the statistic (default) instead of the raw statistic
    #[serde(default)]
    pub normalize: Option<bool>,
    /// Emit `(ratio, actual, predicted)` triples; requires normalize
    #[serde(default)]
    pub includeabsolute: bool,
    /// Minimum prediction value before output is generated
    #[serde(default)]
    pub minprediction: Option<f64>,
    #[serde(default)]
    pub inpainting: Option<InpaintingSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InpaintingSpec {
    /// Inpaint when value/stat falls below this ratio
    #[serde(default)]
    pub min: Option<f64>,
    /// Inpaint when value/stat rises above this ratio
    #[serde(default)]
    pub max: Option<f64>,
    /// Maximum seconds to inpaint before the extreme becomes the new normal
    pub maxduration: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertKafkaSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Unique identifier for this data source
    pub fqid: String,
    /// Human-readable name for this data source
    pub name: String,
    /// Alert when the value falls below this ratio
    #[serde(default)]
    pub min: Option<f64>,
    /// Alert when the value rises above this ratio
    #[serde(default)]
    pub max: Option<f64>,
    /// Only alert for events at least this long, in seconds
    #[serde(default)]
    pub minduration: Option<f64>,
    pub brokers: String,
    pub topic: String,
    /// Print alerts to stdout instead of producing to kafka
    #[serde(default)]
    pub disable: bool,
    /// Apply minduration when detecting the return to normal too
    #[serde(default)]
    pub waitnormal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonOutSpec {
    #[serde(default)]
    pub loglevel: Option<String>,
    /// Output file name; omitted or `-` means stdout
    #[serde(default)]
    pub file: Option<String>,
    /// Compact separators (default true)
    #[serde(default)]
    pub compact: Option<bool>,
}

impl PipelineSpec {
    /// Validate pipeline shape: length, stage roles by position, stage ranges.
    pub fn validate(&self) -> Result<(), SentryError> {
        if self.pipeline.len() < 2 {
            return Err(SentryError::user(format!(
                "pipeline has {} stages; at least a source and a sink are required",
                self.pipeline.len()
            )));
        }
        let last = self.pipeline.len() - 1;
        for (i, stage) in self.pipeline.iter().enumerate() {
            let want = if i == 0 {
                Role::Source
            } else if i == last {
                Role::Sink
            } else {
                Role::Filter
            };
            let got = stage.role();
            if got != want {
                let place = match want {
                    Role::Source => "first",
                    Role::Sink => "last",
                    Role::Filter => "interior",
                };
                return Err(SentryError::user(format!(
                    "pipeline[{i}]: {} is a {got}, but the {place} stage must be a {want}",
                    stage.module()
                )));
            }
            stage.validate()?;
        }
        Ok(())
    }
}

/// Strip C++-style `//` line comments.
///
/// Only `//` followed by whitespace counts, so `https://host/path` survives.
fn strip_line_comments(source: &str) -> String {
    let comment = Regex::new(r"(?m)//\s+.*$").expect("comment pattern is valid");
    comment.replace_all(source, "").into_owned()
}

/// Parse and validate a configuration document.
pub fn parse_config(source: &str, name: &str) -> Result<PipelineSpec, SentryError> {
    let stripped = strip_line_comments(source);
    let spec: PipelineSpec = serde_yaml::from_str(&stripped)
        .map_err(|e| SentryError::user(format!("invalid config file {name}: {e}")))?;
    spec.validate()?;
    Ok(spec)
}

/// Load, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<PipelineSpec, SentryError> {
    info!("Load configuration: {}", path.display());
    let source = std::fs::read_to_string(path).map_err(|e| {
        SentryError::user(format!("invalid config file {}: {e}", path.display()))
    })?;
    parse_config(&source, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_CFG: &str = r#"
loglevel: INFO
pipeline:
  - module: sources.JsonIn       // read from stdin
    file: "-"
  - module: filters.AggSum
    expressions: ["aaa.(*).*.zzz"]
    groupsize: 2
    timeout: 60
  - module: sinks.JsonOut
"#;

    #[test]
    fn parses_valid_config() {
        let spec = parse_config(OK_CFG, "<test>").unwrap();
        assert_eq!(spec.loglevel.as_deref(), Some("INFO"));
        assert_eq!(spec.pipeline.len(), 3);
        assert_eq!(spec.pipeline[0].role(), Role::Source);
        assert_eq!(spec.pipeline[1].module(), "filters.AggSum");
        assert_eq!(spec.pipeline[2].role(), Role::Sink);
        // the line comment was stripped before parsing
        match &spec.pipeline[0] {
            StageSpec::JsonIn(s) => assert_eq!(s.file.as_deref(), Some("-")),
            other => panic!("unexpected stage: {other:?}"),
        }
    }

    #[test]
    fn unknown_module_rejected() {
        let cfg = r#"
pipeline:
  - module: sources.Nonesuch
  - module: sinks.JsonOut
"#;
        let err = parse_config(cfg, "<test>").unwrap_err();
        assert!(matches!(err, SentryError::User(_)), "got: {err}");
    }

    #[test]
    fn unknown_stage_key_rejected() {
        let cfg = r#"
pipeline:
  - module: sources.JsonIn
    bogus: 1
  - module: sinks.JsonOut
"#;
        assert!(parse_config(cfg, "<test>").is_err());
    }

    #[test]
    fn role_misplacement_rejected() {
        let cfg = r#"
pipeline:
  - module: filters.ToSigned
  - module: sinks.JsonOut
"#;
        let err = parse_config(cfg, "<test>").unwrap_err();
        assert!(err.to_string().contains("pipeline[0]"), "got: {err}");

        let cfg = r#"
pipeline:
  - module: sources.JsonIn
  - module: filters.ToSigned
"#;
        let err = parse_config(cfg, "<test>").unwrap_err();
        assert!(err.to_string().contains("pipeline[1]"), "got: {err}");
    }

    #[test]
    fn short_pipeline_rejected() {
        let cfg = r#"
pipeline:
  - module: sources.JsonIn
"#;
        assert!(parse_config(cfg, "<test>").is_err());
    }

    #[test]
    fn range_rules_enforced() {
        let cfg = r#"
pipeline:
  - module: sources.JsonIn
  - module: filters.AggSum
    expressions: ["a.(*)"]
    timeout: 0
  - module: sinks.JsonOut
"#;
        let err = parse_config(cfg, "<test>").unwrap_err();
        assert!(err.to_string().contains("timeout"), "got: {err}");

        let cfg = r#"
pipeline:
  - module: sources.JsonIn
  - module: sinks.AlertKafka
    fqid: f
    name: n
    brokers: b
    topic: t
"#;
        let err = parse_config(cfg, "<test>").unwrap_err();
        assert!(err.to_string().contains("min, max"), "got: {err}");
    }

    #[test]
    fn moving_stat_type_array() {
        let cfg = r#"
pipeline:
  - module: sources.JsonIn
  - module: filters.MovingStat
    type: [quantile, 1, 4]
    warmup: 60
    history: 600
  - module: sinks.JsonOut
"#;
        let spec = parse_config(cfg, "<test>").unwrap();
        match &spec.pipeline[1] {
            StageSpec::MovingStat(s) => {
                assert_eq!(s.stat_type.len(), 3);
                assert!(matches!(&s.stat_type[0], TypeItem::Name(n) if n == "quantile"));
                assert!(matches!(s.stat_type[1], TypeItem::Param(1)));
            }
            other => panic!("unexpected stage: {other:?}"),
        }
    }

    #[test]
    fn comment_stripping_preserves_urls() {
        let cfg = r#"
pipeline:
  - module: sources.Historical    // fetch a day
    expression: "a.*"
    starttime: "2021-03-01"
    endtime: "2021-03-02"
    url: "https://api.example.org/ts"
    batchduration: 3600
  - module: sinks.JsonOut
"#;
        let spec = parse_config(cfg, "<test>").unwrap();
        match &spec.pipeline[0] {
            StageSpec::Historical(s) => assert_eq!(s.url, "https://api.example.org/ts"),
            other => panic!("unexpected stage: {other:?}"),
        }
    }
}
